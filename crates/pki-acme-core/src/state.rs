//! Order / authorization / challenge state machine
//!
//! The transition rules are pure functions; the cascade helpers apply them
//! inside a caller-owned transaction. Every leaf mutation (challenge outcome,
//! authorization deactivation or expiry) ends with
//! [`refresh_orders_for_authorization`], which is the only place order status
//! is re-derived from authorization status.

use chrono::{DateTime, Utc};
use pki_acme_db::entities::{
    authorization::{self, AuthorizationStatus},
    challenge::{self, ChallengeStatus},
    order::{self, OrderStatus},
    order_authorization,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QuerySelect, Set,
};
use tracing::debug;

use crate::error::AcmeError;

/// Allowed challenge transitions
pub fn challenge_can_transition(from: ChallengeStatus, to: ChallengeStatus) -> bool {
    use ChallengeStatus::*;
    matches!(
        (from, to),
        (Pending, Processing) | (Processing, Valid) | (Processing, Invalid)
    )
}

/// Allowed authorization transitions
pub fn authorization_can_transition(from: AuthorizationStatus, to: AuthorizationStatus) -> bool {
    use AuthorizationStatus::*;
    matches!(
        (from, to),
        (Pending, Valid)
            | (Pending, Invalid)
            | (Pending, Expired)
            | (Pending, Deactivated)
            | (Valid, Deactivated)
            | (Valid, Expired)
            | (Valid, Revoked)
    )
}

/// Allowed order transitions
pub fn order_can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Invalid)
            | (Ready, Processing)
            | (Ready, Invalid)
            | (Processing, Valid)
            | (Processing, Invalid)
    )
}

/// Order status implied by its authorizations
///
/// Only `pending` and `ready` orders move. Any failed authorization makes
/// the order invalid; all valid makes a pending order ready. A ready order
/// whose authorizations are no longer all valid is invalid.
pub fn derive_order_status(current: OrderStatus, authorizations: &[AuthorizationStatus]) -> OrderStatus {
    if authorizations.is_empty() {
        return current;
    }

    match current {
        OrderStatus::Pending => {}
        OrderStatus::Ready => {
            if authorizations
                .iter()
                .all(|status| *status == AuthorizationStatus::Valid)
            {
                return OrderStatus::Ready;
            }
            return OrderStatus::Invalid;
        }
        _ => return current,
    }

    if authorizations.iter().any(|status| {
        matches!(
            status,
            AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked
        )
    }) {
        return OrderStatus::Invalid;
    }

    if authorizations
        .iter()
        .all(|status| *status == AuthorizationStatus::Valid)
    {
        return OrderStatus::Ready;
    }

    OrderStatus::Pending
}

fn illegal(entity: &str, from: &str, to: &str) -> DbErr {
    DbErr::Custom(format!("illegal {} transition {} -> {}", entity, from, to))
}

/// Set a challenge's status, enforcing the transition table
pub async fn set_challenge_status<C: ConnectionTrait>(
    conn: &C,
    challenge: challenge::Model,
    to: ChallengeStatus,
    error: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<challenge::Model, DbErr> {
    if !challenge_can_transition(challenge.status, to) {
        return Err(illegal("challenge", challenge.status.as_str(), to.as_str()));
    }

    let mut active = challenge.into_active_model();
    active.status = Set(to);
    if to == ChallengeStatus::Valid {
        active.validated_at = Set(Some(now));
    }
    if error.is_some() {
        active.error = Set(error);
    }
    active.updated_at = Set(now);
    active.update(conn).await
}

/// Set an authorization's status, enforcing the transition table
pub async fn set_authorization_status<C: ConnectionTrait>(
    conn: &C,
    authz: authorization::Model,
    to: AuthorizationStatus,
    now: DateTime<Utc>,
) -> Result<authorization::Model, DbErr> {
    if !authorization_can_transition(authz.status, to) {
        return Err(illegal("authorization", authz.status.as_str(), to.as_str()));
    }

    let mut active = authz.into_active_model();
    active.status = Set(to);
    active.updated_at = Set(now);
    active.update(conn).await
}

/// Set an order's status, enforcing the transition table
pub async fn set_order_status<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    to: OrderStatus,
    error: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<order::Model, DbErr> {
    if !order_can_transition(order.status, to) {
        return Err(illegal("order", order.status.as_str(), to.as_str()));
    }

    let mut active = order.into_active_model();
    active.status = Set(to);
    if error.is_some() {
        active.error = Set(error);
    }
    active.updated_at = Set(now);
    active.update(conn).await
}

/// Lock an authorization row for the rest of the transaction
pub async fn lock_authorization<C: ConnectionTrait>(
    conn: &C,
    authz_id: &str,
) -> Result<Option<authorization::Model>, DbErr> {
    authorization::Entity::find_by_id(authz_id)
        .lock_exclusive()
        .one(conn)
        .await
}

/// Lock an order row for the rest of the transaction
pub async fn lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
) -> Result<Option<order::Model>, DbErr> {
    order::Entity::find_by_id(order_id).lock_exclusive().one(conn).await
}

/// Authorizations linked to an order
pub async fn order_authorizations<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
) -> Result<Vec<authorization::Model>, DbErr> {
    let ids: Vec<String> = order_authorization::Entity::find()
        .filter(order_authorization::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|link| link.authorization_id)
        .collect();

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    authorization::Entity::find()
        .filter(authorization::Column::Id.is_in(ids))
        .all(conn)
        .await
}

/// A pending or valid authorization past its deadline
pub fn authorization_is_due(authz: &authorization::Model, now: DateTime<Utc>) -> bool {
    matches!(
        authz.status,
        AuthorizationStatus::Pending | AuthorizationStatus::Valid
    ) && authz.is_expired_at(now)
}

/// Mark a pending or valid authorization expired if its deadline has passed
pub async fn expire_authorization_if_due<C: ConnectionTrait>(
    conn: &C,
    authz: authorization::Model,
    now: DateTime<Utc>,
) -> Result<authorization::Model, DbErr> {
    if authorization_is_due(&authz, now) {
        debug!(authorization_id = %authz.id, "Authorization expired");
        let id = authz.id.clone();
        let expired = set_authorization_status(conn, authz, AuthorizationStatus::Expired, now).await?;
        refresh_orders_for_authorization(conn, &id, now).await?;
        return Ok(expired);
    }
    Ok(authz)
}

/// Re-derive an order's status: lazy expiry, then authorization roll-up
pub async fn refresh_order<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    now: DateTime<Utc>,
) -> Result<order::Model, DbErr> {
    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
        return Ok(order);
    }

    if order.expires_at <= now {
        debug!(order_id = %order.id, "Order expired");
        let problem = AcmeError::malformed("Order has expired").to_json();
        return set_order_status(conn, order, OrderStatus::Invalid, Some(problem), now).await;
    }

    let mut statuses = Vec::new();
    for authz in order_authorizations(conn, &order.id).await? {
        let authz = if authorization_is_due(&authz, now) {
            set_authorization_status(conn, authz, AuthorizationStatus::Expired, now).await?
        } else {
            authz
        };
        statuses.push(authz.status);
    }

    apply_derived_status(conn, order, &statuses, now).await
}

async fn apply_derived_status<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    statuses: &[AuthorizationStatus],
    now: DateTime<Utc>,
) -> Result<order::Model, DbErr> {
    let next = derive_order_status(order.status, statuses);
    if next == order.status {
        return Ok(order);
    }

    debug!(order_id = %order.id, from = order.status.as_str(), to = next.as_str(), "Order status derived");
    let error = (next == OrderStatus::Invalid).then(|| {
        AcmeError::unauthorized("One or more authorizations for this order failed").to_json()
    });
    set_order_status(conn, order, next, error, now).await
}

/// Re-derive every pending or ready order that depends on an authorization
pub async fn refresh_orders_for_authorization<C: ConnectionTrait>(
    conn: &C,
    authz_id: &str,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let order_ids: Vec<String> = order_authorization::Entity::find()
        .filter(order_authorization::Column::AuthorizationId.eq(authz_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|link| link.order_id)
        .collect();

    if order_ids.is_empty() {
        return Ok(());
    }

    let orders = order::Entity::find()
        .filter(order::Column::Id.is_in(order_ids))
        .filter(order::Column::Status.is_in([OrderStatus::Pending, OrderStatus::Ready]))
        .lock_exclusive()
        .all(conn)
        .await?;

    for order in orders {
        let statuses: Vec<AuthorizationStatus> = order_authorizations(conn, &order.id)
            .await?
            .into_iter()
            .map(|authz| authz.status)
            .collect();
        apply_derived_status(conn, order, &statuses, now).await?;
    }

    Ok(())
}

/// Every authorization of the order is valid and inside its lifetime
pub async fn order_authorizations_valid<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let authzs = order_authorizations(conn, order_id).await?;
    Ok(!authzs.is_empty()
        && authzs
            .iter()
            .all(|authz| authz.status == AuthorizationStatus::Valid && !authz.is_expired_at(now)))
}

/// Challenge validated: challenge -> valid, pending authorization -> valid,
/// then dependent orders. Caller holds the authorization lock.
pub async fn complete_challenge_valid<C: ConnectionTrait>(
    conn: &C,
    challenge: challenge::Model,
    authz: authorization::Model,
    now: DateTime<Utc>,
) -> Result<challenge::Model, DbErr> {
    let challenge = set_challenge_status(conn, challenge, ChallengeStatus::Valid, None, now).await?;

    if authz.status == AuthorizationStatus::Pending {
        let authz_id = authz.id.clone();
        set_authorization_status(conn, authz, AuthorizationStatus::Valid, now).await?;
        refresh_orders_for_authorization(conn, &authz_id, now).await?;
    }

    Ok(challenge)
}

/// Challenge failed for good: challenge -> invalid, pending authorization ->
/// invalid, then dependent orders. A valid authorization stays valid.
/// Caller holds the authorization lock.
pub async fn complete_challenge_invalid<C: ConnectionTrait>(
    conn: &C,
    challenge: challenge::Model,
    authz: authorization::Model,
    problem: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<challenge::Model, DbErr> {
    let challenge =
        set_challenge_status(conn, challenge, ChallengeStatus::Invalid, Some(problem), now).await?;

    if authz.status == AuthorizationStatus::Pending {
        let authz_id = authz.id.clone();
        set_authorization_status(conn, authz, AuthorizationStatus::Invalid, now).await?;
        refresh_orders_for_authorization(conn, &authz_id, now).await?;
    }

    Ok(challenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_never_skips_processing() {
        use ChallengeStatus::*;
        assert!(challenge_can_transition(Pending, Processing));
        assert!(!challenge_can_transition(Pending, Valid));
        assert!(!challenge_can_transition(Pending, Invalid));
        assert!(challenge_can_transition(Processing, Valid));
        assert!(challenge_can_transition(Processing, Invalid));
        // Terminal
        for to in [Pending, Processing, Valid, Invalid] {
            assert!(!challenge_can_transition(Valid, to));
            assert!(!challenge_can_transition(Invalid, to));
        }
    }

    #[test]
    fn test_authorization_terminal_states() {
        use AuthorizationStatus::*;
        for from in [Invalid, Deactivated, Expired, Revoked] {
            for to in [Pending, Valid, Invalid, Deactivated, Expired, Revoked] {
                assert!(!authorization_can_transition(from, to));
            }
        }
        assert!(!authorization_can_transition(Valid, Invalid));
        assert!(authorization_can_transition(Valid, Deactivated));
        assert!(authorization_can_transition(Valid, Expired));
    }

    #[test]
    fn test_order_is_forward_only() {
        use OrderStatus::*;
        assert!(order_can_transition(Pending, Ready));
        assert!(!order_can_transition(Pending, Processing));
        assert!(!order_can_transition(Ready, Valid));
        assert!(!order_can_transition(Ready, Pending));
        assert!(!order_can_transition(Valid, Invalid));
        assert!(!order_can_transition(Invalid, Pending));
    }

    #[test]
    fn test_derive_order_status() {
        use AuthorizationStatus as A;
        use OrderStatus as O;

        assert_eq!(derive_order_status(O::Pending, &[A::Valid, A::Valid]), O::Ready);
        assert_eq!(derive_order_status(O::Pending, &[A::Valid, A::Pending]), O::Pending);
        assert_eq!(derive_order_status(O::Pending, &[A::Pending, A::Invalid]), O::Invalid);
        assert_eq!(derive_order_status(O::Pending, &[A::Valid, A::Expired]), O::Invalid);
        assert_eq!(derive_order_status(O::Pending, &[A::Deactivated]), O::Invalid);
        // A ready order falls back to invalid once an authorization is gone
        assert_eq!(derive_order_status(O::Ready, &[A::Valid, A::Valid]), O::Ready);
        assert_eq!(derive_order_status(O::Ready, &[A::Valid, A::Deactivated]), O::Invalid);
        assert_eq!(derive_order_status(O::Ready, &[A::Expired]), O::Invalid);
        // Processing and later are never re-derived
        assert_eq!(derive_order_status(O::Processing, &[A::Invalid]), O::Processing);
        assert_eq!(derive_order_status(O::Valid, &[A::Deactivated]), O::Valid);
        assert_eq!(derive_order_status(O::Pending, &[]), O::Pending);
    }
}
