//! Policy model and evaluation.
//!
//! A [`Policy`] is an allow/deny rule set over `service/action` identifiers
//! plus auxiliary restrictions (tool whitelist, hourly rate limit, IP
//! whitelist, time-of-day/weekday windows). Evaluation returns a
//! [`Decision`] - DENY is a routine outcome, never an error.
//!
//! ## Glob semantics
//!
//! `*` is segment-scoped: it matches within one `/`-separated segment only,
//! so `data-mcp/*` matches `data-mcp/fetch` but not `data-mcp/sub/fetch`.
//! `**` crosses segment boundaries. Deny patterns are evaluated before
//! allow patterns; absence from the allow list is denial (default-deny).
//!
//! Rate-limit counters are external shared state and are injected through
//! the [`RateLimiter`] capability trait rather than owned here. If a
//! restriction is configured but its runtime input is missing from the
//! [`EvaluationContext`], evaluation fails closed.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use glob::{MatchOptions, Pattern};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;

/// `*` stays within one path segment; `**` is the explicit cross-segment
/// wildcard.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Allowed execution windows: hours are 0-23 UTC, weekdays are 0-6 counted
/// from Monday. An empty set means that dimension is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRestrictions {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_hours: BTreeSet<u8>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_weekdays: BTreeSet<u8>,
}

impl TimeRestrictions {
    fn validate(&self) -> Result<()> {
        if let Some(h) = self.allowed_hours.iter().find(|h| **h > 23) {
            return Err(Error::InvalidPolicy(format!("hour {} out of range", h)));
        }
        if let Some(d) = self.allowed_weekdays.iter().find(|d| **d > 6) {
            return Err(Error::InvalidPolicy(format!("weekday {} out of range", d)));
        }
        Ok(())
    }

    fn permits(&self, now: DateTime<Utc>) -> bool {
        if !self.allowed_hours.is_empty() && !self.allowed_hours.contains(&(now.hour() as u8)) {
            return false;
        }
        if !self.allowed_weekdays.is_empty()
            && !self
                .allowed_weekdays
                .contains(&(now.weekday().num_days_from_monday() as u8))
        {
            return false;
        }
        true
    }
}

/// Access policy carried inside a token.
///
/// A token's policy is always explicit - there is no implicit default. An
/// empty `allow` list denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Glob patterns over `service/action` that grant access.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Glob patterns that revoke access. Deny wins on overlap.
    #[serde(default)]
    pub deny: Vec<String>,
    /// If non-empty, the bare action (tool) name must be a member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<BTreeSet<String>>,
    /// Requests per hour per caller. Enforced via an injected counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// CIDR blocks the caller IP must fall within.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_whitelist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<TimeRestrictions>,
    /// Used by [`select_policy`] when several policies apply; higher wins.
    #[serde(default)]
    pub priority: i32,
}

impl Policy {
    /// A policy that allows every action with no auxiliary restrictions.
    pub fn allow_all() -> Self {
        Self {
            allow: vec!["**".to_string()],
            ..Default::default()
        }
    }

    /// A policy that denies every action (empty allow list).
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// A policy allowing exactly the given `service/action` identifiers.
    pub fn allow_only(actions: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow: actions.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Structural validation: every glob must parse, every CIDR must parse,
    /// hours and weekdays must be in range.
    pub fn validate(&self) -> Result<()> {
        for pattern in self.allow.iter().chain(self.deny.iter()) {
            Pattern::new(pattern)
                .map_err(|e| Error::InvalidPolicy(format!("bad pattern '{}': {}", pattern, e)))?;
        }
        if let Some(cidrs) = &self.ip_whitelist {
            for cidr in cidrs {
                IpNetwork::from_str(cidr)
                    .map_err(|e| Error::InvalidPolicy(format!("bad CIDR '{}': {}", cidr, e)))?;
            }
        }
        if let Some(tr) = &self.time_restrictions {
            tr.validate()?;
        }
        Ok(())
    }

    /// Whether the allow/deny pattern lists alone permit this identifier.
    ///
    /// This is the static portion of [`evaluate`] (steps: deny, then allow,
    /// then default-deny) with no runtime context. The delegation engine
    /// uses it to decide whether a requested action is inside a parent
    /// token's effective scope.
    pub fn permits_statically(&self, action_identifier: &str) -> bool {
        if matches_any(&self.deny, action_identifier) {
            return false;
        }
        matches_any(&self.allow, action_identifier)
    }

    /// Evaluate an action identifier against this policy.
    pub fn evaluate(&self, action_identifier: &str, ctx: &EvaluationContext<'_>) -> Decision {
        // 1. Deny patterns take precedence.
        if let Some(pattern) = first_match(&self.deny, action_identifier) {
            return Decision::Deny(DenyReason::ExplicitDeny {
                pattern: pattern.to_string(),
            });
        }

        // 2-3. Must match an allow pattern; absence is denial.
        if !matches_any(&self.allow, action_identifier) {
            return Decision::Deny(DenyReason::NotAllowed);
        }

        // 4. Tool whitelist over the bare action name.
        if let Some(tools) = &self.allowed_tools {
            if !tools.is_empty() {
                let tool = action_identifier
                    .rsplit('/')
                    .next()
                    .unwrap_or(action_identifier);
                if !tools.contains(tool) {
                    return Decision::Deny(DenyReason::ToolNotAllowed {
                        tool: tool.to_string(),
                    });
                }
            }
        }

        // 5. Hourly rate limit via the injected counter. Fail closed if no
        // counter was provided.
        if let Some(limit) = self.rate_limit {
            match (ctx.rate_limiter, ctx.rate_key) {
                (Some(limiter), Some(key)) => {
                    if !limiter.check_and_increment(key, limit, ctx.now) {
                        return Decision::Deny(DenyReason::RateLimited { limit });
                    }
                }
                _ => return Decision::Deny(DenyReason::RateLimited { limit }),
            }
        }

        // 6. IP whitelist. Fail closed if the caller IP is unknown.
        if let Some(cidrs) = &self.ip_whitelist {
            if !cidrs.is_empty() {
                let permitted = match ctx.caller_ip {
                    Some(ip) => cidrs.iter().any(|cidr| {
                        IpNetwork::from_str(cidr)
                            .map(|net| net.contains(ip))
                            .unwrap_or(false)
                    }),
                    None => false,
                };
                if !permitted {
                    return Decision::Deny(DenyReason::IpNotAllowed);
                }
            }
        }

        // 7. Time-of-day / weekday windows.
        if let Some(tr) = &self.time_restrictions {
            if !tr.permits(ctx.now) {
                return Decision::Deny(DenyReason::TimeRestricted);
            }
        }

        // 8. Everything passed.
        Decision::Allow
    }
}

fn matches_any(patterns: &[String], identifier: &str) -> bool {
    first_match(patterns, identifier).is_some()
}

fn first_match<'a>(patterns: &'a [String], identifier: &str) -> Option<&'a str> {
    patterns.iter().map(String::as_str).find(|p| {
        Pattern::new(p)
            .map(|pat| pat.matches_with(identifier, GLOB_OPTIONS))
            .unwrap_or(false)
    })
}

/// Pick the governing policy when several apply: highest `priority` wins,
/// and among equal priorities the first in input order wins.
pub fn select_policy(policies: &[Policy]) -> Option<&Policy> {
    let mut best: Option<&Policy> = None;
    for policy in policies {
        match best {
            Some(current) if current.priority >= policy.priority => {}
            _ => best = Some(policy),
        }
    }
    best
}

/// Outcome of policy evaluation. DENY carries the governing reason so
/// transports can log and surface it distinctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Why a policy denied an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Matched an explicit deny pattern.
    ExplicitDeny { pattern: String },
    /// Matched no allow pattern (default-deny).
    NotAllowed,
    /// Bare action name absent from the tool whitelist.
    ToolNotAllowed { tool: String },
    /// Hourly request budget exhausted (or no counter available).
    RateLimited { limit: u32 },
    /// Caller IP outside the whitelist (or unknown).
    IpNotAllowed,
    /// Outside the allowed hour/weekday windows.
    TimeRestricted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExplicitDeny { pattern } => write!(f, "denied by pattern '{}'", pattern),
            Self::NotAllowed => write!(f, "not in allow list"),
            Self::ToolNotAllowed { tool } => write!(f, "tool '{}' not whitelisted", tool),
            Self::RateLimited { limit } => write!(f, "rate limit {}/hour exceeded", limit),
            Self::IpNotAllowed => write!(f, "caller IP not whitelisted"),
            Self::TimeRestricted => write!(f, "outside allowed time window"),
        }
    }
}

/// Runtime inputs for policy evaluation.
///
/// Construction starts from a timestamp; IP and rate-limiter inputs are
/// attached by the transport when the corresponding restrictions are in
/// play.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub now: DateTime<Utc>,
    pub caller_ip: Option<IpAddr>,
    pub rate_limiter: Option<&'a dyn RateLimiter>,
    /// Counter key, typically `user_id/agent_id`.
    pub rate_key: Option<&'a str>,
}

impl<'a> EvaluationContext<'a> {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            caller_ip: None,
            rate_limiter: None,
            rate_key: None,
        }
    }

    pub fn caller_ip(mut self, ip: IpAddr) -> Self {
        self.caller_ip = Some(ip);
        self
    }

    pub fn rate_limiter(mut self, limiter: &'a dyn RateLimiter, key: &'a str) -> Self {
        self.rate_limiter = Some(limiter);
        self.rate_key = Some(key);
        self
    }
}

/// Capability seam for the shared rate-limit counter.
///
/// Implementations must provide at-least monotonic consistency under
/// concurrent access so concurrent callers never undercount.
pub trait RateLimiter: Send + Sync {
    /// Atomically record one request for `key` in the hour window containing
    /// `now`. Returns `true` if the request is within `limit`.
    fn check_and_increment(&self, key: &str, limit: u32, now: DateTime<Utc>) -> bool;
}

/// In-memory hourly-window counter, suitable for tests and single-process
/// deployments. Distributed deployments supply their own store.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    counters: RwLock<HashMap<(String, i64), u32>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn check_and_increment(&self, key: &str, limit: u32, now: DateTime<Utc>) -> bool {
        let bucket = now.timestamp().div_euclid(3600);
        let mut counters = match self.counters.write() {
            Ok(guard) => guard,
            // A poisoned lock means a writer panicked mid-update; fail closed.
            Err(_) => return false,
        };
        // Buckets before the current hour can never be read again; drop them
        // so the map stays bounded by the number of active keys.
        counters.retain(|&(_, b), _| b >= bucket);
        let count = counters.entry((key.to_string(), bucket)).or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }
}
