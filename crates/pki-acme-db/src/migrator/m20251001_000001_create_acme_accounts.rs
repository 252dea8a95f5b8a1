//! Accounts and replay nonces

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AcmeAccounts::Table)
                    .if_not_exists()
                    .col(string_len(AcmeAccounts::Id, 64).primary_key())
                    .col(string_len(AcmeAccounts::ProfileId, 255).not_null())
                    .col(string_len(AcmeAccounts::Alg, 16).not_null())
                    .col(json(AcmeAccounts::PublicKey).not_null())
                    .col(string_len(AcmeAccounts::PublicKeyThumbprint, 128).not_null())
                    .col(json(AcmeAccounts::Contacts).not_null())
                    .col(
                        string_len(AcmeAccounts::Status, 16)
                            .not_null()
                            .default("valid"),
                    )
                    .col(
                        timestamp_with_time_zone(AcmeAccounts::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(AcmeAccounts::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One account per (profile, alg, key)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_accounts_profile_key")
                    .table(AcmeAccounts::Table)
                    .col(AcmeAccounts::ProfileId)
                    .col(AcmeAccounts::Alg)
                    .col(AcmeAccounts::PublicKeyThumbprint)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AcmeNonces::Table)
                    .if_not_exists()
                    .col(string_len(AcmeNonces::Nonce, 128).primary_key())
                    .col(timestamp_with_time_zone(AcmeNonces::ExpiresAt).not_null())
                    .col(
                        timestamp_with_time_zone(AcmeNonces::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Sweeper deletes by expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_nonces_expires_at")
                    .table(AcmeNonces::Table)
                    .col(AcmeNonces::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeNonces::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(super) enum AcmeAccounts {
    Table,
    Id,
    ProfileId,
    Alg,
    PublicKey,
    PublicKeyThumbprint,
    Contacts,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeNonces {
    Table,
    Nonce,
    ExpiresAt,
    CreatedAt,
}
