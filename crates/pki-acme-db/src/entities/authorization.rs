//! Authorization entity: proof of control over one identifier

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of an authorization (RFC 8555 section 7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,

    #[sea_orm(string_value = "valid")]
    Valid,

    #[sea_orm(string_value = "invalid")]
    Invalid,

    /// Deactivated by the client
    #[sea_orm(string_value = "deactivated")]
    Deactivated,

    #[sea_orm(string_value = "expired")]
    Expired,

    /// Revoked by the server
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_authorizations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub account_id: String,

    /// Identifier type, always "dns" for now
    pub identifier_type: String,

    /// Identifier value (normalized DNS name)
    pub identifier_value: String,

    pub status: AuthorizationStatus,

    /// Random token shared by all challenges under this authorization
    pub token: String,

    pub expires_at: ChronoDateTimeUtc,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,

    #[sea_orm(has_many = "super::challenge::Entity")]
    Challenge,

    #[sea_orm(has_many = "super::order_authorization::Entity")]
    OrderAuthorization,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl Related<super::challenge::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Challenge.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        super::order_authorization::Relation::Order.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::order_authorization::Relation::Authorization.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_expired_at(&self, now: ChronoDateTimeUtc) -> bool {
        self.expires_at <= now
    }
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        }
    }
}
