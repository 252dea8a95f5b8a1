//! Challenge entity: one way of proving control for an authorization

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Type of ACME challenge
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumIter,
    DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ChallengeType {
    #[sea_orm(string_value = "http-01")]
    #[serde(rename = "http-01")]
    Http01,

    #[sea_orm(string_value = "dns-01")]
    #[serde(rename = "dns-01")]
    Dns01,

    /// Recognised but not validated by this server
    #[sea_orm(string_value = "tls-alpn-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

/// Status of a challenge (RFC 8555 section 7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Client signalled readiness, validation queued or running
    #[sea_orm(string_value = "processing")]
    Processing,

    #[sea_orm(string_value = "valid")]
    Valid,

    #[sea_orm(string_value = "invalid")]
    Invalid,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_challenges")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub authorization_id: String,

    pub challenge_type: ChallengeType,

    pub status: ChallengeStatus,

    /// When the challenge was validated successfully
    pub validated_at: Option<ChronoDateTimeUtc>,

    /// Problem document (JSON) from the final failed validation attempt
    #[sea_orm(nullable)]
    pub error: Option<Json>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::authorization::Entity",
        from = "Column::AuthorizationId",
        to = "super::authorization::Column::Id"
    )]
    Authorization,
}

impl Related<super::authorization::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Authorization.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Processing => "processing",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
        }
    }
}
