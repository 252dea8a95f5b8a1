//! Account operations

use chrono::Utc;
use pki_acme_db::entities::{
    account::{self, AccountStatus},
    order,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set,
    SqlErr,
};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::error::{AcmeError, AcmeResult};
use crate::jose::{Jwk, JwsAlgorithm};
use crate::service::AcmeService;

/// new-account payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountPayload {
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(default)]
    pub only_return_existing: Option<bool>,
    /// Accepted and ignored; no binding policy is enforced
    #[serde(default)]
    pub external_account_binding: Option<serde_json::Value>,
}

/// Payload of a POST to an account URL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountUpdatePayload {
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Outcome of new-account
#[derive(Debug, Clone)]
pub struct AccountLookup {
    pub account: account::Model,
    /// `true` if this request created the account (201), `false` if it existed (200)
    pub created: bool,
}

/// Contacts must be non-empty `mailto:` URIs
pub fn validate_contacts(contacts: &[String]) -> AcmeResult<()> {
    for contact in contacts {
        let address = contact.strip_prefix("mailto:").ok_or_else(|| {
            AcmeError::unsupported_contact(format!("Only mailto: contacts are supported: {}", contact))
        })?;
        let valid = match address.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.') && !address.contains(','),
            None => false,
        };
        if !valid {
            return Err(AcmeError::unsupported_contact(format!(
                "Invalid email address in contact: {}",
                contact
            )));
        }
    }
    Ok(())
}

impl AcmeService {
    /// Create the account for this key, or return the one that already exists
    ///
    /// The unique index on (profile, alg, thumbprint) decides races: the loser
    /// of a concurrent insert re-reads and returns the winner's account.
    pub async fn create_or_fetch_account(
        &self,
        profile_id: &str,
        jwk: &Jwk,
        alg: JwsAlgorithm,
        payload: NewAccountPayload,
    ) -> AcmeResult<AccountLookup> {
        let thumbprint = jwk.thumbprint();

        if let Some(existing) = self.find_account_by_key(profile_id, alg, &thumbprint).await? {
            return self.existing_account(existing).await;
        }

        if payload.only_return_existing.unwrap_or(false) {
            return Err(AcmeError::account_does_not_exist(
                "No account exists for this key",
            ));
        }

        let contacts = payload.contact.unwrap_or_default();
        validate_contacts(&contacts)?;

        let now = Utc::now();
        let model = account::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            profile_id: Set(profile_id.to_string()),
            alg: Set(alg.as_str().to_string()),
            public_key: Set(jwk.to_json()),
            public_key_thumbprint: Set(thumbprint.clone()),
            contacts: Set(serde_json::json!(contacts)),
            status: Set(AccountStatus::Valid),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&self.db).await {
            Ok(account) => {
                info!(account_id = %account.id, profile_id, "ACME account created");
                self.audit
                    .record(AuditEvent::AccountCreated {
                        account_id: account.id.clone(),
                        profile_id: profile_id.to_string(),
                    })
                    .await;
                Ok(AccountLookup {
                    account,
                    created: true,
                })
            }
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                debug!(profile_id, "Concurrent account registration, re-reading");
                let existing = self
                    .find_account_by_key(profile_id, alg, &thumbprint)
                    .await?
                    .ok_or_else(|| AcmeError::server_internal("Account vanished after conflict"))?;
                self.existing_account(existing).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn existing_account(&self, existing: account::Model) -> AcmeResult<AccountLookup> {
        if !existing.is_active() {
            return Err(AcmeError::unauthorized("Account has been deactivated"));
        }
        self.audit
            .record(AuditEvent::AccountRetrieved {
                account_id: existing.id.clone(),
            })
            .await;
        Ok(AccountLookup {
            account: existing,
            created: false,
        })
    }

    async fn find_account_by_key(
        &self,
        profile_id: &str,
        alg: JwsAlgorithm,
        thumbprint: &str,
    ) -> AcmeResult<Option<account::Model>> {
        Ok(account::Entity::find()
            .filter(account::Column::ProfileId.eq(profile_id))
            .filter(account::Column::Alg.eq(alg.as_str()))
            .filter(account::Column::PublicKeyThumbprint.eq(thumbprint))
            .one(&self.db)
            .await?)
    }

    /// Apply a POST to the account URL: contact update, deactivation, or read
    pub async fn update_account(
        &self,
        account: &account::Model,
        payload: AccountUpdatePayload,
    ) -> AcmeResult<account::Model> {
        match payload.status.as_deref() {
            None => {}
            Some("deactivated") => return self.deactivate_account(account).await,
            Some(other) => {
                return Err(AcmeError::malformed(format!(
                    "Account status can only be set to deactivated, not {}",
                    other
                )))
            }
        }

        let Some(contacts) = payload.contact else {
            return Ok(account.clone());
        };
        validate_contacts(&contacts)?;

        let mut active = account.clone().into_active_model();
        active.contacts = Set(serde_json::json!(contacts));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&self.db).await?;

        self.audit
            .record(AuditEvent::AccountUpdated {
                account_id: updated.id.clone(),
            })
            .await;
        Ok(updated)
    }

    /// Deactivate an account; repeated calls leave it deactivated
    pub async fn deactivate_account(&self, account: &account::Model) -> AcmeResult<account::Model> {
        if account.status == AccountStatus::Deactivated {
            return Ok(account.clone());
        }

        let mut active = account.clone().into_active_model();
        active.status = Set(AccountStatus::Deactivated);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&self.db).await?;

        info!(account_id = %updated.id, "ACME account deactivated");
        self.audit
            .record(AuditEvent::AccountDeactivated {
                account_id: updated.id.clone(),
            })
            .await;
        Ok(updated)
    }

    /// Ids of the account's orders, oldest first
    pub async fn list_order_ids(&self, account: &account::Model) -> AcmeResult<Vec<String>> {
        Ok(order::Entity::find()
            .filter(order::Column::AccountId.eq(account.id.as_str()))
            .order_by_asc(order::Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|order| order.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProblemKind;

    #[test]
    fn test_validate_contacts() {
        assert!(validate_contacts(&[]).is_ok());
        assert!(validate_contacts(&["mailto:a@example.com".to_string()]).is_ok());

        for bad in ["tel:+1555", "mailto:", "mailto:nobody", "mailto:a@b,c@d.com", "a@example.com"] {
            let err = validate_contacts(&[bad.to_string()]).unwrap_err();
            assert_eq!(err.kind, ProblemKind::UnsupportedContact, "{}", bad);
        }
    }

    #[test]
    fn test_new_account_payload_fields() {
        let payload: NewAccountPayload = serde_json::from_value(serde_json::json!({
            "contact": ["mailto:a@example.com"],
            "termsOfServiceAgreed": true,
            "onlyReturnExisting": true,
            "externalAccountBinding": {"protected": "x"}
        }))
        .unwrap();
        assert_eq!(payload.only_return_existing, Some(true));
        assert_eq!(payload.terms_of_service_agreed, Some(true));
        assert!(payload.external_account_binding.is_some());
    }
}
