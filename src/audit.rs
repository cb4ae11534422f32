//! Audit logging for security-relevant events.
//!
//! Issuance, verification outcomes, and delegations emit an [`AuditEvent`]
//! through a process-global logger. The default is no logging; deployments
//! install a logger once at startup via [`set_global_logger`].
//! [`StdoutLogger`] writes one JSON object per line, which log shippers
//! ingest directly.
//!
//! Rejection events carry the reason name, so an integrity violation (a
//! tampering signal worth alerting on) is distinguishable from a routine
//! expiry or policy denial.

use crate::delegation::Delegation;
use crate::token::Token;
use crate::verify::RejectReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event kind: `token_issued`, `verification_allowed`,
    /// `verification_rejected`, or `delegation_created`.
    pub event: &'static str,
    pub at: DateTime<Utc>,
    pub token_id: String,
    pub plan_hash: String,
    pub user_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate: Option<String>,
}

impl AuditEvent {
    fn base(event: &'static str, token: &Token) -> Self {
        Self {
            event,
            at: Utc::now(),
            token_id: token.token_id().to_string(),
            plan_hash: token.plan_hash().to_hex(),
            user_id: token.identity().user_id.clone(),
            agent_id: token.identity().agent_id.clone(),
            path: None,
            action: None,
            reason: None,
            detail: None,
            delegation_id: None,
            delegate: None,
        }
    }

    pub fn token_issued(token: &Token) -> Self {
        Self::base("token_issued", token)
    }

    pub fn verification_allowed(token: &Token, path: &str, action: &str) -> Self {
        let mut event = Self::base("verification_allowed", token);
        event.path = Some(path.to_string());
        event.action = Some(action.to_string());
        event
    }

    pub fn verification_rejected(
        token: &Token,
        path: &str,
        action: &str,
        reason: &RejectReason,
    ) -> Self {
        let mut event = Self::base("verification_rejected", token);
        event.path = Some(path.to_string());
        event.action = Some(action.to_string());
        event.reason = Some(reason.name().to_string());
        event.detail = Some(reason.to_string());
        event
    }

    pub fn delegation_created(delegation: &Delegation) -> Self {
        let mut event = Self::base("delegation_created", &delegation.token);
        event.delegation_id = Some(delegation.delegation_id.to_string());
        event.delegate = Some(delegation.delegate_public_key.fingerprint());
        event
    }
}

/// Sink for audit events.
pub trait AuditLogger: Send + Sync {
    fn log(&self, event: &AuditEvent);
}

/// Writes one JSON object per line to stdout.
#[derive(Debug, Default)]
pub struct StdoutLogger;

impl AuditLogger for StdoutLogger {
    fn log(&self, event: &AuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoOpLogger;

impl AuditLogger for NoOpLogger {
    fn log(&self, _event: &AuditEvent) {}
}

static GLOBAL_LOGGER: RwLock<Option<Arc<dyn AuditLogger>>> = RwLock::new(None);

/// Install the process-global audit logger.
pub fn set_global_logger(logger: Arc<dyn AuditLogger>) {
    if let Ok(mut guard) = GLOBAL_LOGGER.write() {
        *guard = Some(logger);
    }
}

/// Remove the global logger; subsequent events are discarded.
pub fn clear_global_logger() {
    if let Ok(mut guard) = GLOBAL_LOGGER.write() {
        *guard = None;
    }
}

/// Emit an event to the global logger, if one is installed. Never fails and
/// never panics; auditing must not break the operation it observes.
pub fn log_event(event: &AuditEvent) {
    if let Ok(guard) = GLOBAL_LOGGER.read() {
        if let Some(logger) = guard.as_ref() {
            logger.log(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, Plan, Step};
    use crate::crypto::LocalSigner;
    use crate::merkle::MerkleTree;
    use crate::policy::Policy;
    use crate::token::{Identity, TokenBuilder};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CaptureLogger {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditLogger for CaptureLogger {
        fn log(&self, event: &AuditEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
        }
    }

    fn make_token() -> Token {
        let plan = Plan::new(vec![Step::new("fetch", "data-mcp")]);
        let canonical = canonicalize(&plan).unwrap();
        let tree = MerkleTree::build(&canonical.leaf_digests()).unwrap();
        TokenBuilder::new(canonical.plan_hash, tree.root())
            .policy(Policy::allow_all())
            .identity(Identity::new("user-1", "agent-1"))
            .validity_seconds(300)
            .issue(&LocalSigner::generate())
            .unwrap()
    }

    #[test]
    fn test_event_json_shape() {
        let token = make_token();
        let event = AuditEvent::verification_rejected(
            &token,
            "/steps/[0]",
            "data-mcp/fetch",
            &RejectReason::MerkleProofInvalid,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "verification_rejected");
        assert_eq!(json["token_id"], token.token_id().as_str());
        assert_eq!(json["reason"], "merkle-proof-invalid");
        assert_eq!(json["path"], "/steps/[0]");
        // Unset optional fields are omitted entirely.
        assert!(json.get("delegation_id").is_none());
    }

    #[test]
    fn test_integrity_rejection_distinct_from_expiry() {
        let token = make_token();
        let integrity = AuditEvent::verification_rejected(
            &token,
            "/steps/[0]",
            "data-mcp/fetch",
            &RejectReason::MerkleProofInvalid,
        );
        let expiry = AuditEvent::verification_rejected(
            &token,
            "/steps/[0]",
            "data-mcp/fetch",
            &RejectReason::TokenExpired { expired_at: 0 },
        );
        assert_ne!(integrity.reason, expiry.reason);
    }

    #[test]
    fn test_logger_capture_and_noop() {
        let capture = CaptureLogger::default();
        let token = make_token();
        capture.log(&AuditEvent::token_issued(&token));
        assert_eq!(capture.events.lock().unwrap().len(), 1);

        // NoOp accepts anything silently.
        NoOpLogger.log(&AuditEvent::token_issued(&token));
    }

    #[test]
    fn test_log_event_without_global_logger_is_silent() {
        let token = make_token();
        // Must not panic even with no logger installed.
        log_event(&AuditEvent::token_issued(&token));
    }
}
