//! Database migrations

use sea_orm_migration::prelude::*;

mod m20251001_000001_create_acme_accounts;
mod m20251001_000002_create_acme_orders;
mod m20251001_000003_create_acme_certificates;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20251001_000001_create_acme_accounts::Migration),
            Box::new(m20251001_000002_create_acme_orders::Migration),
            Box::new(m20251001_000003_create_acme_certificates::Migration),
        ]
    }
}
