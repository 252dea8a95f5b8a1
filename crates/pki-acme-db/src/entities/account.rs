//! Account entity for ACME accounts registered against a CA profile

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Status of an ACME account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[sea_orm(string_value = "valid")]
    Valid,

    #[sea_orm(string_value = "deactivated")]
    Deactivated,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_accounts")]
pub struct Model {
    /// Account ID (UUID string)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// CA profile the account was registered against
    #[sea_orm(indexed)]
    pub profile_id: String,

    /// JWS algorithm the account signs with (e.g. ES256)
    pub alg: String,

    /// Public key as a JWK object
    pub public_key: Json,

    /// RFC 7638 SHA-256 thumbprint of `public_key`, base64url
    pub public_key_thumbprint: String,

    /// Contact URIs (JSON array of strings)
    pub contacts: Json,

    pub status: AccountStatus,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order::Entity")]
    Order,

    #[sea_orm(has_many = "super::authorization::Entity")]
    Authorization,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::authorization::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Authorization.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Contact URIs decoded from the JSON column
    pub fn contact_list(&self) -> Vec<String> {
        serde_json::from_value(self.contacts.clone()).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Valid
    }
}
