//! Orders, authorizations, challenges and the order/authorization link table

use sea_orm_migration::{prelude::*, schema::*};

use super::m20251001_000001_create_acme_accounts::AcmeAccounts;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Orders
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeOrders::Table)
                    .if_not_exists()
                    .col(string_len(AcmeOrders::Id, 64).primary_key())
                    .col(string_len(AcmeOrders::AccountId, 64).not_null())
                    .col(string_len(AcmeOrders::ProfileId, 255).not_null())
                    .col(
                        string_len(AcmeOrders::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(json(AcmeOrders::Identifiers).not_null())
                    .col(timestamp_with_time_zone_null(AcmeOrders::NotBefore))
                    .col(timestamp_with_time_zone_null(AcmeOrders::NotAfter))
                    .col(timestamp_with_time_zone(AcmeOrders::ExpiresAt).not_null())
                    .col(text_null(AcmeOrders::Csr))
                    .col(string_len_null(AcmeOrders::CertificateId, 64))
                    .col(json_null(AcmeOrders::Error))
                    .col(
                        timestamp_with_time_zone(AcmeOrders::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(AcmeOrders::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_orders_account_id")
                            .from(AcmeOrders::Table, AcmeOrders::AccountId)
                            .to(AcmeAccounts::Table, AcmeAccounts::Id)
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
                    .name("idx_acme_orders_account_id")
                    .table(AcmeOrders::Table)
                    .col(AcmeOrders::AccountId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Authorizations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeAuthorizations::Table)
                    .if_not_exists()
                    .col(string_len(AcmeAuthorizations::Id, 64).primary_key())
                    .col(string_len(AcmeAuthorizations::AccountId, 64).not_null())
                    .col(string_len(AcmeAuthorizations::IdentifierType, 16).not_null())
                    .col(string_len(AcmeAuthorizations::IdentifierValue, 255).not_null())
                    .col(
                        string_len(AcmeAuthorizations::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(string_len(AcmeAuthorizations::Token, 128).not_null())
                    .col(timestamp_with_time_zone(AcmeAuthorizations::ExpiresAt).not_null())
                    .col(
                        timestamp_with_time_zone(AcmeAuthorizations::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(AcmeAuthorizations::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_authorizations_account_id")
                            .from(AcmeAuthorizations::Table, AcmeAuthorizations::AccountId)
                            .to(AcmeAccounts::Table, AcmeAccounts::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Lookup for reusable valid authorizations
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_authorizations_account_identifier")
                    .table(AcmeAuthorizations::Table)
                    .col(AcmeAuthorizations::AccountId)
                    .col(AcmeAuthorizations::IdentifierValue)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Challenges
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeChallenges::Table)
                    .if_not_exists()
                    .col(string_len(AcmeChallenges::Id, 64).primary_key())
                    .col(string_len(AcmeChallenges::AuthorizationId, 64).not_null())
                    .col(string_len(AcmeChallenges::ChallengeType, 16).not_null())
                    .col(
                        string_len(AcmeChallenges::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(timestamp_with_time_zone_null(AcmeChallenges::ValidatedAt))
                    .col(json_null(AcmeChallenges::Error))
                    .col(
                        timestamp_with_time_zone(AcmeChallenges::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(AcmeChallenges::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_challenges_authorization_id")
                            .from(AcmeChallenges::Table, AcmeChallenges::AuthorizationId)
                            .to(AcmeAuthorizations::Table, AcmeAuthorizations::Id)
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
                    .name("idx_acme_challenges_authorization_id")
                    .table(AcmeChallenges::Table)
                    .col(AcmeChallenges::AuthorizationId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Order <-> authorization link
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeOrderAuthorizations::Table)
                    .if_not_exists()
                    .col(string_len(AcmeOrderAuthorizations::OrderId, 64).not_null())
                    .col(string_len(AcmeOrderAuthorizations::AuthorizationId, 64).not_null())
                    .primary_key(
                        Index::create()
                            .col(AcmeOrderAuthorizations::OrderId)
                            .col(AcmeOrderAuthorizations::AuthorizationId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_order_authorizations_order_id")
                            .from(AcmeOrderAuthorizations::Table, AcmeOrderAuthorizations::OrderId)
                            .to(AcmeOrders::Table, AcmeOrders::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_order_authorizations_authorization_id")
                            .from(
                                AcmeOrderAuthorizations::Table,
                                AcmeOrderAuthorizations::AuthorizationId,
                            )
                            .to(AcmeAuthorizations::Table, AcmeAuthorizations::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Reverse lookup: which orders depend on an authorization
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_order_authorizations_authorization_id")
                    .table(AcmeOrderAuthorizations::Table)
                    .col(AcmeOrderAuthorizations::AuthorizationId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeOrderAuthorizations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeChallenges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeAuthorizations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeOrders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(super) enum AcmeOrders {
    Table,
    Id,
    AccountId,
    ProfileId,
    Status,
    Identifiers,
    NotBefore,
    NotAfter,
    ExpiresAt,
    Csr,
    CertificateId,
    Error,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeAuthorizations {
    Table,
    Id,
    AccountId,
    IdentifierType,
    IdentifierValue,
    Status,
    Token,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeChallenges {
    Table,
    Id,
    AuthorizationId,
    ChallengeType,
    Status,
    ValidatedAt,
    Error,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeOrderAuthorizations {
    Table,
    OrderId,
    AuthorizationId,
}
