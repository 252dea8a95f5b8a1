//! Issued certificate chains

use sea_orm_migration::{prelude::*, schema::*};

use super::m20251001_000002_create_acme_orders::AcmeOrders;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AcmeCertificates::Table)
                    .if_not_exists()
                    .col(string_len(AcmeCertificates::Id, 64).primary_key())
                    .col(string_len(AcmeCertificates::OrderId, 64).not_null())
                    .col(string_len(AcmeCertificates::SerialNumber, 128).not_null())
                    .col(text(AcmeCertificates::ChainPem).not_null())
                    .col(timestamp_with_time_zone(AcmeCertificates::NotAfter).not_null())
                    .col(
                        timestamp_with_time_zone(AcmeCertificates::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_certificates_order_id")
                            .from(AcmeCertificates::Table, AcmeCertificates::OrderId)
                            .to(AcmeOrders::Table, AcmeOrders::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_certificates_order_id")
                    .table(AcmeCertificates::Table)
                    .col(AcmeCertificates::OrderId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeCertificates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AcmeCertificates {
    Table,
    Id,
    OrderId,
    SerialNumber,
    ChainPem,
    NotAfter,
    CreatedAt,
}
