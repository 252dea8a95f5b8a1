//! Audit trail for ACME operations
//!
//! Every challenge validation attempt is recorded, so a failed issuance can be
//! reconstructed after the fact.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

/// Result of one validation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Valid,
    /// Failed, another attempt is scheduled
    Retrying,
    /// Failed on the last attempt; challenge is now invalid
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    AccountCreated {
        account_id: String,
        profile_id: String,
    },
    AccountRetrieved {
        account_id: String,
    },
    AccountUpdated {
        account_id: String,
    },
    AccountDeactivated {
        account_id: String,
    },
    OrderCreated {
        order_id: String,
        account_id: String,
        identifiers: Vec<String>,
    },
    AuthorizationDeactivated {
        authorization_id: String,
    },
    ChallengeResponded {
        challenge_id: String,
        challenge_type: String,
    },
    ChallengeValidation {
        challenge_id: String,
        challenge_type: String,
        retry_count: u32,
        outcome: AttemptOutcome,
        error: Option<String>,
    },
    OrderFinalized {
        order_id: String,
        certificate_id: Option<String>,
        error: Option<String>,
    },
    CertificateDownloaded {
        order_id: String,
        certificate_id: String,
    },
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes audit events as structured `tracing` records on the `acme_audit` target
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, event: AuditEvent) {
        let fields = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "acme_audit", event = %fields, "ACME audit event");
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Validation attempts recorded for one challenge, in order
    pub fn validation_attempts(&self, challenge_id: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                matches!(event, AuditEvent::ChallengeValidation { challenge_id: id, .. } if id == challenge_id)
            })
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
