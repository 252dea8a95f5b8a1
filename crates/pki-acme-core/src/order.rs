//! Order operations: creation, reads, finalize and certificate download

use chrono::{DateTime, Utc};
use pki_acme_db::entities::{
    account,
    authorization::{self, AuthorizationStatus},
    certificate,
    challenge::{self, ChallengeStatus, ChallengeType},
    order::{self, OrderStatus},
    order_authorization,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::csr::{check_csr_names, parse_csr};
use crate::error::{AcmeError, AcmeResult, ProblemKind, Subproblem};
use crate::identifier::{
    is_localhost, is_valid_dns_name, is_wildcard, normalize_dns_name, Identifier,
};
use crate::issuer::{IssuanceError, IssuanceRequest, IssuedCertificate};
use crate::jose::random_token;
use crate::profile::AcmeProfile;
use crate::service::AcmeService;
use crate::state;

/// new-order payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// finalize payload
#[derive(Debug, Clone, Deserialize)]
pub struct FinalizePayload {
    /// base64url DER PKCS#10
    pub csr: String,
}

/// An order with the ids of its authorizations
#[derive(Debug, Clone)]
pub struct OrderView {
    pub order: order::Model,
    pub authorization_ids: Vec<String>,
}

impl OrderView {
    pub fn identifiers(&self) -> Vec<Identifier> {
        order_identifiers(&self.order)
    }
}

fn order_identifiers(order: &order::Model) -> Vec<Identifier> {
    serde_json::from_value(order.identifiers.clone()).unwrap_or_default()
}

/// Check, normalize and de-duplicate requested identifiers
pub fn validate_identifiers(requested: &[Identifier], dev_mode: bool) -> AcmeResult<Vec<Identifier>> {
    if requested.is_empty() {
        return Err(AcmeError::malformed("Order must contain at least one identifier"));
    }

    let unsupported: Vec<Subproblem> = requested
        .iter()
        .filter(|identifier| !identifier.is_dns())
        .map(|identifier| {
            Subproblem::new(
                ProblemKind::UnsupportedIdentifier,
                format!("Identifier type {} is not supported", identifier.kind),
                identifier.clone(),
            )
        })
        .collect();
    if !unsupported.is_empty() {
        return Err(AcmeError::unsupported_identifier(
            "Only DNS identifiers are supported",
            unsupported,
        ));
    }

    let mut seen = BTreeSet::new();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for identifier in requested {
        let name = normalize_dns_name(&identifier.value);
        let reason = if is_wildcard(&name) {
            Some("Wildcard identifiers are not supported")
        } else if !is_valid_dns_name(&name) {
            Some("Identifier is not a valid DNS name")
        } else if !dev_mode && is_localhost(&name) {
            Some("localhost identifiers are not allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => rejected.push(Subproblem::new(
                ProblemKind::RejectedIdentifier,
                reason,
                identifier.clone(),
            )),
            None => {
                if seen.insert(name.clone()) {
                    accepted.push(Identifier::dns(name));
                }
            }
        }
    }

    if !rejected.is_empty() {
        return Err(AcmeError::rejected_identifier(
            "One or more identifiers were rejected",
            rejected,
        ));
    }

    Ok(accepted)
}

/// Rewrite a PEM chain with CRLF line endings and a trailing CRLF
pub fn normalize_pem_chain(pem: &str) -> String {
    let mut out = pem
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\r\n");
    out.push_str("\r\n");
    out
}

pub(crate) fn ensure_owner(owner_id: &str, account: &account::Model) -> AcmeResult<()> {
    if owner_id != account.id {
        return Err(AcmeError::unauthorized(
            "Resource belongs to a different account",
        ));
    }
    Ok(())
}

async fn linked_authorization_ids<C: ConnectionTrait>(conn: &C, order_id: &str) -> AcmeResult<Vec<String>> {
    let mut authzs = state::order_authorizations(conn, order_id).await?;
    authzs.sort_by(|a, b| a.identifier_value.cmp(&b.identifier_value));
    Ok(authzs.into_iter().map(|authz| authz.id).collect())
}

impl AcmeService {
    /// Create an order and its authorizations
    pub async fn create_order(
        &self,
        profile: &AcmeProfile,
        account: &account::Model,
        payload: NewOrderPayload,
    ) -> AcmeResult<OrderView> {
        let identifiers = validate_identifiers(&payload.identifiers, self.dev_mode)?;

        if let (Some(not_before), Some(not_after)) = (payload.not_before, payload.not_after) {
            if not_after <= not_before {
                return Err(AcmeError::malformed("notAfter must be later than notBefore"));
            }
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            account_id: Set(account.id.clone()),
            profile_id: Set(profile.id.clone()),
            status: Set(OrderStatus::Pending),
            identifiers: Set(serde_json::json!(identifiers)),
            not_before: Set(payload.not_before),
            not_after: Set(payload.not_after),
            expires_at: Set(now + profile.order_lifetime),
            csr: Set(None),
            certificate_id: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut authorization_ids = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let reusable = if profile.reuse_valid_authorizations {
                self.find_reusable_authorization(&txn, account, identifier, now)
                    .await?
            } else {
                None
            };

            let authz = match reusable {
                Some(authz) => authz,
                None => {
                    self.create_authorization(&txn, profile, account, identifier, now)
                        .await?
                }
            };

            order_authorization::ActiveModel {
                order_id: Set(order.id.clone()),
                authorization_id: Set(authz.id.clone()),
            }
            .insert(&txn)
            .await?;
            authorization_ids.push(authz.id);
        }

        // Pre-validated or reused authorizations can make the order ready at once
        let order = state::refresh_order(&txn, order, now).await?;
        txn.commit().await?;

        info!(
            order_id = %order.id,
            account_id = %account.id,
            status = order.status.as_str(),
            "ACME order created"
        );
        self.audit
            .record(AuditEvent::OrderCreated {
                order_id: order.id.clone(),
                account_id: account.id.clone(),
                identifiers: identifiers.iter().map(|i| i.value.clone()).collect(),
            })
            .await;

        Ok(OrderView {
            order,
            authorization_ids,
        })
    }

    async fn find_reusable_authorization(
        &self,
        txn: &DatabaseTransaction,
        account: &account::Model,
        identifier: &Identifier,
        now: DateTime<Utc>,
    ) -> AcmeResult<Option<authorization::Model>> {
        Ok(authorization::Entity::find()
            .filter(authorization::Column::AccountId.eq(account.id.as_str()))
            .filter(authorization::Column::IdentifierType.eq(identifier.kind.as_str()))
            .filter(authorization::Column::IdentifierValue.eq(identifier.value.as_str()))
            .filter(authorization::Column::Status.eq(AuthorizationStatus::Valid))
            .filter(authorization::Column::ExpiresAt.gt(now))
            .order_by_desc(authorization::Column::ExpiresAt)
            .one(txn)
            .await?)
    }

    async fn create_authorization(
        &self,
        txn: &DatabaseTransaction,
        profile: &AcmeProfile,
        account: &account::Model,
        identifier: &Identifier,
        now: DateTime<Utc>,
    ) -> AcmeResult<authorization::Model> {
        let skip = profile.skip_dns_ownership_verification;

        let authz = authorization::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            account_id: Set(account.id.clone()),
            identifier_type: Set(identifier.kind.clone()),
            identifier_value: Set(identifier.value.clone()),
            status: Set(if skip {
                AuthorizationStatus::Valid
            } else {
                AuthorizationStatus::Pending
            }),
            // 256 bits of entropy, above the 128 RFC 8555 section 11.3 asks for
            token: Set(random_token(32)),
            expires_at: Set(now + profile.authorization_lifetime),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        if !skip {
            for challenge_type in [ChallengeType::Http01, ChallengeType::Dns01] {
                challenge::ActiveModel {
                    id: Set(Uuid::new_v4().to_string()),
                    authorization_id: Set(authz.id.clone()),
                    challenge_type: Set(challenge_type),
                    status: Set(ChallengeStatus::Pending),
                    validated_at: Set(None),
                    error: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
            }
        }

        Ok(authz)
    }

    /// Read an order owned by `account`, applying lazy expiry and roll-up
    pub async fn get_order(&self, account: &account::Model, order_id: &str) -> AcmeResult<OrderView> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AcmeError::not_found("Order not found"))?;
        ensure_owner(&order.account_id, account)?;

        let order = state::refresh_order(&txn, order, now).await?;
        let authorization_ids = linked_authorization_ids(&txn, &order.id).await?;
        txn.commit().await?;

        Ok(OrderView {
            order,
            authorization_ids,
        })
    }

    /// Finalize a ready order with a CSR
    ///
    /// The order is locked, checked and moved to `processing` in one
    /// transaction; the CA is called outside it; the outcome is written in a
    /// second one. A CSR that fails the name check never reaches the CA and
    /// leaves the order `ready`.
    pub async fn finalize_order(
        &self,
        profile: &AcmeProfile,
        account: &account::Model,
        order_id: &str,
        payload: FinalizePayload,
    ) -> AcmeResult<OrderView> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = state::lock_order(&txn, order_id)
            .await?
            .ok_or_else(|| AcmeError::not_found("Order not found"))?;
        ensure_owner(&order.account_id, account)?;

        let order = state::refresh_order(&txn, order, now).await?;
        if order.status != OrderStatus::Ready {
            txn.commit().await?;
            return Err(AcmeError::order_not_ready(format!(
                "Order is {}, not ready",
                order.status.as_str()
            )));
        }
        if !state::order_authorizations_valid(&txn, &order.id, now).await? {
            txn.commit().await?;
            return Err(AcmeError::order_not_ready(
                "Order authorizations are no longer valid",
            ));
        }

        let identifiers: BTreeSet<String> = order_identifiers(&order)
            .into_iter()
            .map(|identifier| identifier.value)
            .collect();

        let csr = match parse_csr(&payload.csr).and_then(|csr| {
            check_csr_names(&csr, &identifiers)?;
            Ok(csr)
        }) {
            Ok(csr) => csr,
            Err(err) => {
                txn.commit().await?;
                warn!(order_id, error = %err, "Finalize rejected CSR");
                return Err(err);
            }
        };

        let mut active = order.into_active_model();
        active.status = Set(OrderStatus::Processing);
        active.csr = Set(Some(payload.csr));
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;
        let authorization_ids = linked_authorization_ids(&txn, &order.id).await?;
        txn.commit().await?;

        let request = IssuanceRequest {
            order_id: order.id.clone(),
            profile_id: profile.id.clone(),
            identifiers: identifiers.into_iter().collect(),
            csr_der: csr.der,
            not_before: order.not_before,
            not_after: order.not_after,
            default_lifetime: profile.certificate_lifetime,
        };

        let (err, reason) = match self.issuer.issue(request).await {
            Ok(issued) => match self.store_certificate(order.clone(), issued).await {
                Ok((order, certificate_id)) => {
                    info!(order_id = %order.id, certificate_id = %certificate_id, "Order finalized");
                    self.audit
                        .record(AuditEvent::OrderFinalized {
                            order_id: order.id.clone(),
                            certificate_id: Some(certificate_id),
                            error: None,
                        })
                        .await;

                    return Ok(OrderView {
                        order,
                        authorization_ids,
                    });
                }
                Err(store_err) => {
                    error!(order_id = %order.id, error = %store_err, "Failed to store issued certificate");
                    (
                        AcmeError::server_internal("Failed to store issued certificate"),
                        store_err.to_string(),
                    )
                }
            },
            Err(issue_err) => {
                let err = match &issue_err {
                    IssuanceError::Rejected(reason) => AcmeError::bad_csr(reason.clone()),
                    IssuanceError::Internal(reason) => {
                        error!(order_id = %order.id, error = %reason, "Certificate issuance failed");
                        AcmeError::server_internal("Certificate issuance failed")
                    }
                };
                (err, issue_err.to_string())
            }
        };

        // A processing order must not outlive a failed finalize
        if let Err(mark_err) = self.fail_processing_order(&order.id, err.to_json()).await {
            error!(order_id = %order.id, error = %mark_err, "Failed to mark order invalid");
        }
        self.audit
            .record(AuditEvent::OrderFinalized {
                order_id: order.id.clone(),
                certificate_id: None,
                error: Some(reason),
            })
            .await;

        Err(err)
    }

    /// Record an issued chain and move the order to `valid`
    async fn store_certificate(
        &self,
        order: order::Model,
        issued: IssuedCertificate,
    ) -> AcmeResult<(order::Model, String)> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let certificate = certificate::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            order_id: Set(order.id.clone()),
            serial_number: Set(issued.serial),
            chain_pem: Set(issued.chain_pem),
            not_after: Set(issued.not_after),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut active = order.into_active_model();
        active.status = Set(OrderStatus::Valid);
        active.certificate_id = Set(Some(certificate.id.clone()));
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;
        txn.commit().await?;

        Ok((order, certificate.id))
    }

    /// Move a `processing` order to `invalid` with `problem`
    async fn fail_processing_order(&self, order_id: &str, problem: serde_json::Value) -> AcmeResult<()> {
        let txn = self.db.begin().await?;
        if let Some(order) = state::lock_order(&txn, order_id).await? {
            if order.status == OrderStatus::Processing {
                state::set_order_status(&txn, order, OrderStatus::Invalid, Some(problem), Utc::now())
                    .await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    /// PEM chain of a valid order, CRLF line endings, leaf first
    pub async fn download_certificate(
        &self,
        account: &account::Model,
        order_id: &str,
    ) -> AcmeResult<String> {
        let order = order::Entity::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AcmeError::not_found("Order not found"))?;
        ensure_owner(&order.account_id, account)?;

        let certificate_id = match (order.status, order.certificate_id.as_deref()) {
            (OrderStatus::Valid, Some(id)) => id.to_string(),
            _ => {
                return Err(AcmeError::malformed(format!(
                    "Order is {}, no certificate is available",
                    order.status.as_str()
                )))
            }
        };

        let certificate = certificate::Entity::find_by_id(certificate_id.as_str())
            .one(&self.db)
            .await?
            .ok_or_else(|| AcmeError::not_found("Certificate not found"))?;

        self.audit
            .record(AuditEvent::CertificateDownloaded {
                order_id: order.id,
                certificate_id,
            })
            .await;

        Ok(normalize_pem_chain(&certificate.chain_pem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_normalized_and_deduplicated() {
        let out = validate_identifiers(
            &[
                Identifier::dns("Example.com."),
                Identifier::dns("example.com"),
                Identifier::dns("www.example.com"),
            ],
            false,
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Identifier::dns("example.com"), Identifier::dns("www.example.com")]
        );
    }

    #[test]
    fn test_unsupported_identifier_type() {
        let err = validate_identifiers(
            &[
                Identifier::dns("example.com"),
                Identifier {
                    kind: "ip".into(),
                    value: "192.0.2.1".into(),
                },
            ],
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind, ProblemKind::UnsupportedIdentifier);
        assert_eq!(err.subproblems.len(), 1);
        assert_eq!(err.subproblems[0].identifier.as_ref().unwrap().value, "192.0.2.1");
    }

    #[test]
    fn test_rejected_identifiers_have_subproblems() {
        let err = validate_identifiers(
            &[
                Identifier::dns("*.example.com"),
                Identifier::dns("bad-.example.com"),
                Identifier::dns("ok.example.com"),
            ],
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind, ProblemKind::RejectedIdentifier);
        assert_eq!(err.subproblems.len(), 2);
    }

    #[test]
    fn test_localhost_only_in_dev_mode() {
        assert!(validate_identifiers(&[Identifier::dns("localhost")], false).is_err());
        assert!(validate_identifiers(&[Identifier::dns("localhost")], true).is_ok());
    }

    #[test]
    fn test_empty_identifiers_malformed() {
        assert_eq!(
            validate_identifiers(&[], false).unwrap_err().kind,
            ProblemKind::Malformed
        );
    }

    #[test]
    fn test_normalize_pem_chain() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\r\nBBB\r\n-----END CERTIFICATE-----";
        let out = normalize_pem_chain(pem);
        assert_eq!(
            out,
            "-----BEGIN CERTIFICATE-----\r\nAAA\r\n-----END CERTIFICATE-----\r\n-----BEGIN CERTIFICATE-----\r\nBBB\r\n-----END CERTIFICATE-----\r\n"
        );
    }
}
