//! Authorization and challenge operations

use chrono::Utc;
use pki_acme_db::entities::{
    account,
    authorization::{self, AuthorizationStatus},
    challenge::{self, ChallengeStatus, ChallengeType},
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    Set, TransactionTrait,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::audit::AuditEvent;
use crate::error::{AcmeError, AcmeResult};
use crate::identifier::private_target_reason;
use crate::order::ensure_owner;
use crate::service::AcmeService;
use crate::state;
use crate::validator::ValidationJob;

/// Payload of a POST to an authorization URL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationUpdatePayload {
    #[serde(default)]
    pub status: Option<String>,
}

/// An authorization with its challenges, ordered by type
#[derive(Debug, Clone)]
pub struct AuthorizationView {
    pub authorization: authorization::Model,
    pub challenges: Vec<challenge::Model>,
}

async fn challenges_for<C: ConnectionTrait>(
    conn: &C,
    authz_id: &str,
) -> AcmeResult<Vec<challenge::Model>> {
    let mut challenges = challenge::Entity::find()
        .filter(challenge::Column::AuthorizationId.eq(authz_id))
        .all(conn)
        .await?;
    challenges.sort_by_key(|c| c.challenge_type);
    Ok(challenges)
}

impl AcmeService {
    /// Read an authorization owned by `account`
    pub async fn get_authorization(
        &self,
        account: &account::Model,
        authz_id: &str,
    ) -> AcmeResult<AuthorizationView> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let authz = authorization::Entity::find_by_id(authz_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AcmeError::not_found("Authorization not found"))?;
        ensure_owner(&authz.account_id, account)?;

        let authz = state::expire_authorization_if_due(&txn, authz, now).await?;
        let challenges = challenges_for(&txn, &authz.id).await?;
        txn.commit().await?;

        Ok(AuthorizationView {
            authorization: authz,
            challenges,
        })
    }

    /// Apply a POST to an authorization URL: deactivation or read
    pub async fn update_authorization(
        &self,
        account: &account::Model,
        authz_id: &str,
        payload: AuthorizationUpdatePayload,
    ) -> AcmeResult<AuthorizationView> {
        match payload.status.as_deref() {
            None => self.get_authorization(account, authz_id).await,
            Some("deactivated") => self.deactivate_authorization(account, authz_id).await,
            Some(other) => Err(AcmeError::malformed(format!(
                "Authorization status can only be set to deactivated, not {}",
                other
            ))),
        }
    }

    /// Client-initiated deactivation of a pending or valid authorization
    pub async fn deactivate_authorization(
        &self,
        account: &account::Model,
        authz_id: &str,
    ) -> AcmeResult<AuthorizationView> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let authz = state::lock_authorization(&txn, authz_id)
            .await?
            .ok_or_else(|| AcmeError::not_found("Authorization not found"))?;
        ensure_owner(&authz.account_id, account)?;

        let authz = state::expire_authorization_if_due(&txn, authz, now).await?;
        if !matches!(
            authz.status,
            AuthorizationStatus::Pending | AuthorizationStatus::Valid
        ) {
            txn.commit().await?;
            return Err(AcmeError::malformed(format!(
                "Authorization is {} and cannot be deactivated",
                authz.status.as_str()
            )));
        }

        let authz =
            state::set_authorization_status(&txn, authz, AuthorizationStatus::Deactivated, now)
                .await?;
        state::refresh_orders_for_authorization(&txn, &authz.id, now).await?;
        let challenges = challenges_for(&txn, &authz.id).await?;
        txn.commit().await?;

        info!(authorization_id = %authz.id, "Authorization deactivated");
        self.audit
            .record(AuditEvent::AuthorizationDeactivated {
                authorization_id: authz.id.clone(),
            })
            .await;

        Ok(AuthorizationView {
            authorization: authz,
            challenges,
        })
    }

    /// Read a challenge and its authorization
    pub async fn get_challenge(
        &self,
        account: &account::Model,
        authz_id: &str,
        challenge_id: &str,
    ) -> AcmeResult<(authorization::Model, challenge::Model)> {
        let view = self.get_authorization(account, authz_id).await?;
        let challenge = view
            .challenges
            .into_iter()
            .find(|c| c.id == challenge_id)
            .ok_or_else(|| AcmeError::not_found("Challenge not found"))?;
        Ok((view.authorization, challenge))
    }

    /// Client signals readiness: move the challenge to `processing` and queue
    /// a validation job
    ///
    /// Repeating the call on a processing or valid challenge returns the
    /// current state without queueing another job.
    pub async fn respond_to_challenge(
        &self,
        account: &account::Model,
        authz_id: &str,
        challenge_id: &str,
    ) -> AcmeResult<(authorization::Model, challenge::Model)> {
        let (authz, challenge) = self.get_challenge(account, authz_id, challenge_id).await?;

        if challenge.challenge_type == ChallengeType::TlsAlpn01 {
            return Err(AcmeError::malformed("tls-alpn-01 challenges are not supported"));
        }

        if matches!(
            challenge.status,
            ChallengeStatus::Processing | ChallengeStatus::Valid
        ) || authz.status == AuthorizationStatus::Valid
        {
            return Ok((authz, challenge));
        }

        if challenge.status == ChallengeStatus::Invalid {
            return Err(AcmeError::malformed("Challenge has already failed"));
        }

        if authz.status != AuthorizationStatus::Pending {
            return Err(AcmeError::malformed(format!(
                "Authorization is {}",
                authz.status.as_str()
            )));
        }

        if let Some(reason) = private_target_reason(&authz.identifier_value, self.dev_mode) {
            return Err(AcmeError::malformed(format!(
                "Refusing to validate internal target: {}",
                reason
            )));
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let authz = state::lock_authorization(&txn, &authz.id)
            .await?
            .ok_or_else(|| AcmeError::not_found("Authorization not found"))?;
        let challenge = challenge::Entity::find_by_id(challenge.id.as_str())
            .one(&txn)
            .await?
            .ok_or_else(|| AcmeError::not_found("Challenge not found"))?;

        // Another request won the race to processing
        if challenge.status != ChallengeStatus::Pending || authz.status != AuthorizationStatus::Pending {
            txn.commit().await?;
            return Ok((authz, challenge));
        }

        let challenge =
            state::set_challenge_status(&txn, challenge, ChallengeStatus::Processing, None, now)
                .await?;
        txn.commit().await?;

        let job = ValidationJob {
            challenge_id: challenge.id.clone(),
            attempt: 0,
        };
        if let Err(err) = self.queue.enqueue(job).await {
            error!(challenge_id = %challenge.id, error = %err, "Failed to queue validation");
            // Outside the transition table: the job never ran
            let mut active = challenge.into_active_model();
            active.status = Set(ChallengeStatus::Pending);
            active.updated_at = Set(Utc::now());
            active.update(&self.db).await?;
            return Err(AcmeError::server_internal("Validation queue is unavailable"));
        }

        info!(
            challenge_id = %challenge.id,
            challenge_type = challenge.challenge_type.as_str(),
            identifier = %authz.identifier_value,
            "Challenge validation queued"
        );
        self.audit
            .record(AuditEvent::ChallengeResponded {
                challenge_id: challenge.id.clone(),
                challenge_type: challenge.challenge_type.as_str().to_string(),
            })
            .await;

        Ok((authz, challenge))
    }
}
