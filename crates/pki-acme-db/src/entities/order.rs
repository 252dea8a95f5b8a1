//! Order entity for ACME certificate orders

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of an order (RFC 8555 section 7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Waiting for its authorizations to be completed
    #[sea_orm(string_value = "pending")]
    Pending,

    /// All authorizations are valid, waiting for a CSR
    #[sea_orm(string_value = "ready")]
    Ready,

    /// CSR accepted, certificate being issued
    #[sea_orm(string_value = "processing")]
    Processing,

    /// Certificate issued
    #[sea_orm(string_value = "valid")]
    Valid,

    #[sea_orm(string_value = "invalid")]
    Invalid,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub account_id: String,

    pub profile_id: String,

    pub status: OrderStatus,

    /// Requested identifiers as a JSON array of `{type, value}`
    pub identifiers: Json,

    pub not_before: Option<ChronoDateTimeUtc>,

    pub not_after: Option<ChronoDateTimeUtc>,

    pub expires_at: ChronoDateTimeUtc,

    /// Submitted CSR, base64url DER as sent by the client
    #[sea_orm(column_type = "Text", nullable)]
    pub csr: Option<String>,

    /// Issued certificate, set once the order is valid
    #[sea_orm(nullable)]
    pub certificate_id: Option<String>,

    /// Problem document (JSON) explaining why the order became invalid
    #[sea_orm(nullable)]
    pub error: Option<Json>,

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

    #[sea_orm(has_many = "super::order_authorization::Entity")]
    OrderAuthorization,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl Related<super::authorization::Entity> for Entity {
    fn to() -> RelationDef {
        super::order_authorization::Relation::Authorization.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::order_authorization::Relation::Order.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}
