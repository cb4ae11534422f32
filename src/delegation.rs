//! Delegation: handing a token to another agent with narrower authority.
//!
//! Delegation is attenuation-only. A delegated token can cover the same or a
//! smaller action set than its parent, never a larger one, and its lifetime
//! is clamped to the parent's. The new token is bound to the delegate's
//! public key via the `holder` field and keeps the parent's plan commitments
//! (`plan_hash`, `merkle_root`) unchanged - the delegate executes the same
//! plan, just with less room.
//!
//! Chains compose: a delegated token is a regular [`Token`] and can itself be
//! delegated, narrowing further at each hop.

use crate::canonical::Digest;
use crate::crypto::{PublicKey, Signer};
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::token::{Token, TokenBuilder, TokenId};
use crate::audit::{self, AuditEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

const DELEGATION_ID_PREFIX: &str = "csrg_dlg_";

/// Unique delegation identifier: `csrg_dlg_` followed by a UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelegationId(String);

impl DelegationId {
    pub fn new() -> Self {
        Self(format!("{}{}", DELEGATION_ID_PREFIX, Uuid::now_v7()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let suffix = s.strip_prefix(DELEGATION_ID_PREFIX).ok_or_else(|| {
            Error::InvalidId(format!("missing '{}' prefix", DELEGATION_ID_PREFIX))
        })?;
        Uuid::parse_str(suffix).map_err(|e| Error::InvalidId(e.to_string()))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DelegationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DelegationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DelegationId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DelegationId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DelegationId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Result of a delegation: the narrowed token plus chain bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub delegation_id: DelegationId,
    /// The new, attenuated token, holder-bound to the delegate.
    pub token: Token,
    pub delegate_public_key: PublicKey,
    /// ID of the token this one was derived from.
    pub parent_token_id: TokenId,
    /// The parent's plan commitment, carried for chain auditing.
    pub parent_plan_hash: Digest,
    /// Trust update applied by this hop.
    pub trust_delta: BTreeMap<String, Value>,
}

/// Parameters for one delegation hop.
pub struct DelegationRequest {
    pub delegate_public_key: PublicKey,
    /// Requested lifetime in seconds; clamped to the parent's remaining
    /// lifetime.
    pub validity_seconds: i64,
    /// Explicit `service/action` identifiers to grant. `None` inherits the
    /// parent's full allow set.
    pub allowed_actions: Option<Vec<String>>,
}

/// Create a delegated token from `parent`.
///
/// `issuer` is the key the parent's signature is checked against; `signer`
/// signs the new token and must be the parent's bound holder when one is
/// set. Every requested action must already be permitted by the parent's
/// policy - any widening attempt fails with
/// [`Error::DelegationScopeViolation`] and produces nothing.
pub fn delegate(
    parent: &Token,
    issuer: &PublicKey,
    signer: &dyn Signer,
    request: DelegationRequest,
) -> Result<Delegation> {
    delegate_at(parent, issuer, signer, request, Utc::now())
}

/// [`delegate`] with an explicit current time.
pub fn delegate_at(
    parent: &Token,
    issuer: &PublicKey,
    signer: &dyn Signer,
    request: DelegationRequest,
    now: DateTime<Utc>,
) -> Result<Delegation> {
    parent.verify_signature(issuer)?;
    if parent.is_expired(now) {
        return Err(Error::TokenExpired(parent.expires_at()));
    }
    if let Some(holder) = parent.holder() {
        if signer.public_key() != *holder {
            return Err(Error::DelegationScopeViolation(
                "signer is not the token's bound holder".to_string(),
            ));
        }
    }

    let narrowed = narrow_policy(parent.policy(), request.allowed_actions.as_deref())?;

    // Lifetime never extends past the parent.
    let remaining = parent.expires_at() - now.timestamp();
    let validity = request.validity_seconds.min(remaining);
    if request.validity_seconds <= 0 {
        return Err(Error::InvalidValidity(format!(
            "validity_seconds must be positive, got {}",
            request.validity_seconds
        )));
    }

    let token = TokenBuilder::new(*parent.plan_hash(), *parent.merkle_root())
        .policy(narrowed)
        .identity(parent.identity().clone())
        .validity_seconds(validity)
        .holder(request.delegate_public_key.clone())
        .issue_at(signer, now)?;

    let mut trust_delta = BTreeMap::new();
    trust_delta.insert("type".to_string(), Value::String("delegation".to_string()));
    trust_delta.insert(
        "delegate".to_string(),
        Value::String(request.delegate_public_key.fingerprint()),
    );
    if let Some(actions) = &request.allowed_actions {
        trust_delta.insert(
            "narrowed_to".to_string(),
            Value::Array(actions.iter().cloned().map(Value::String).collect()),
        );
    }
    if token.expires_at() < parent.expires_at() {
        trust_delta.insert(
            "validity_clamped_to".to_string(),
            Value::Number(token.expires_at().into()),
        );
    }

    let delegation = Delegation {
        delegation_id: DelegationId::new(),
        token,
        delegate_public_key: request.delegate_public_key,
        parent_token_id: parent.token_id().clone(),
        parent_plan_hash: *parent.plan_hash(),
        trust_delta,
    };

    audit::log_event(&AuditEvent::delegation_created(&delegation));
    Ok(delegation)
}

/// Intersect the parent policy with the requested action set.
///
/// With no explicit request the parent's allow set carries over whole. With
/// one, each identifier must name a concrete action: it is matched against
/// the parent's static scope (deny patterns included) as a literal string
/// and then installed in the child's allow list. Because the allow list is
/// interpreted as glob patterns at evaluation time, identifiers containing
/// pattern metacharacters are rejected outright - otherwise a request like
/// `svc/**` would pass the literal subset check against a parent `svc/*`
/// and still widen the child's scope across segments. Auxiliary
/// restrictions carry over unchanged - a delegate never escapes the
/// parent's rate, IP, or time limits.
fn narrow_policy(parent: &Policy, requested: Option<&[String]>) -> Result<Policy> {
    let allow = match requested {
        None => parent.allow.clone(),
        Some(actions) => {
            if actions.is_empty() {
                return Err(Error::DelegationScopeViolation(
                    "requested action set is empty".to_string(),
                ));
            }
            for action in actions {
                if action.contains(['*', '?', '[', ']']) {
                    return Err(Error::DelegationScopeViolation(format!(
                        "'{}' contains pattern metacharacters; requested actions must be concrete identifiers",
                        action
                    )));
                }
                if !parent.permits_statically(action) {
                    return Err(Error::DelegationScopeViolation(format!(
                        "'{}' is outside the parent's scope",
                        action
                    )));
                }
            }
            actions.to_vec()
        }
    };

    Ok(Policy {
        allow,
        deny: parent.deny.clone(),
        allowed_tools: parent.allowed_tools.clone(),
        rate_limit: parent.rate_limit,
        ip_whitelist: parent.ip_whitelist.clone(),
        time_restrictions: parent.time_restrictions.clone(),
        priority: parent.priority,
    })
}
