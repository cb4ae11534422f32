//! Step verification: the gate an execution service runs before acting.
//!
//! [`verify_step`] checks a claimed step against a token in a fixed order -
//! signature, expiry, path grammar, Merkle inclusion, value digest, policy -
//! and short-circuits on the first failure. Rejections are normal return
//! values ([`Verdict::Reject`]), not errors: a denied or tampered request is
//! an expected outcome for a verifier, and the caller maps the reason to its
//! transport.
//!
//! Verification never mutates the token and holds no state of its own; the
//! only shared state it touches is the rate-limit counter injected through
//! the evaluation context.

use crate::audit::{self, AuditEvent};
use crate::canonical::{parse_step_path, step_value_digest, Digest, Step};
use crate::crypto::PublicKey;
use crate::merkle::{self, Proof};
use crate::policy::{Decision, DenyReason, EvaluationContext};
use crate::token::Token;

/// Outcome of step verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            Verdict::Allow => None,
            Verdict::Reject(reason) => Some(reason),
        }
    }
}

/// Why verification rejected a step, in check order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Token signature does not verify against the issuer key.
    InvalidSignature,
    /// Token past its expiry instant.
    TokenExpired { expired_at: i64 },
    /// Claimed path does not match the `/steps/[i]` grammar.
    MalformedPath { path: String },
    /// Inclusion proof does not fold to the committed Merkle root.
    MerkleProofInvalid,
    /// The actual request's digest differs from the proven one.
    ValueMismatch,
    /// The policy denied the action.
    PolicyDenied(DenyReason),
}

impl RejectReason {
    /// Stable machine-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid-signature",
            Self::TokenExpired { .. } => "token-expired",
            Self::MalformedPath { .. } => "malformed-path",
            Self::MerkleProofInvalid => "merkle-proof-invalid",
            Self::ValueMismatch => "value-mismatch",
            Self::PolicyDenied(_) => "policy-denied",
        }
    }

    /// HTTP status a transport should surface.
    ///
    /// Integrity failures (bad proof, digest mismatch) map to 409: the
    /// request conflicts with the committed plan, which is a different
    /// signal than "not authorized".
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidSignature | Self::TokenExpired { .. } => 401,
            Self::MalformedPath { .. } => 400,
            Self::MerkleProofInvalid | Self::ValueMismatch => 409,
            Self::PolicyDenied(_) => 403,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "token signature invalid"),
            Self::TokenExpired { expired_at } => write!(f, "token expired at {}", expired_at),
            Self::MalformedPath { path } => write!(f, "malformed step path '{}'", path),
            Self::MerkleProofInvalid => write!(f, "merkle inclusion proof invalid"),
            Self::ValueMismatch => write!(f, "request does not match proven step"),
            Self::PolicyDenied(reason) => write!(f, "policy denied: {}", reason),
        }
    }
}

/// Verify one claimed step against a token.
///
/// `claimed_path` and `claimed_value_digest` are what the caller asserts the
/// token committed to; `proof` links that digest to the token's Merkle root;
/// `step` is the request actually about to execute. The checks run in a
/// fixed order and stop at the first failure:
///
/// 1. signature over the token's signed bytes, against `issuer`
/// 2. expiry at `ctx.now` (the boundary instant is expired)
/// 3. path grammar
/// 4. Merkle inclusion of the claimed digest
/// 5. digest of the actual request equals the claimed digest
/// 6. policy evaluation of `service/action` under `ctx`
///
/// A valid proof for step N says nothing about a request whose content
/// differs from step N - that is exactly what check 5 catches.
#[allow(clippy::too_many_arguments)]
pub fn verify_step(
    token: &Token,
    issuer: &PublicKey,
    claimed_path: &str,
    claimed_value_digest: &Digest,
    proof: &Proof,
    step: &Step,
    ctx: &EvaluationContext<'_>,
) -> Verdict {
    let verdict = run_checks(token, issuer, claimed_path, claimed_value_digest, proof, step, ctx);
    match &verdict {
        Verdict::Allow => audit::log_event(&AuditEvent::verification_allowed(
            token,
            claimed_path,
            &step.action_identifier(),
        )),
        Verdict::Reject(reason) => audit::log_event(&AuditEvent::verification_rejected(
            token,
            claimed_path,
            &step.action_identifier(),
            reason,
        )),
    }
    verdict
}

#[allow(clippy::too_many_arguments)]
fn run_checks(
    token: &Token,
    issuer: &PublicKey,
    claimed_path: &str,
    claimed_value_digest: &Digest,
    proof: &Proof,
    step: &Step,
    ctx: &EvaluationContext<'_>,
) -> Verdict {
    if token.verify_signature(issuer).is_err() {
        return Verdict::Reject(RejectReason::InvalidSignature);
    }

    if token.is_expired(ctx.now) {
        return Verdict::Reject(RejectReason::TokenExpired {
            expired_at: token.expires_at(),
        });
    }

    if parse_step_path(claimed_path).is_err() {
        return Verdict::Reject(RejectReason::MalformedPath {
            path: claimed_path.to_string(),
        });
    }

    if !merkle::verify(claimed_value_digest, proof, token.merkle_root()) {
        return Verdict::Reject(RejectReason::MerkleProofInvalid);
    }

    let actual = step_value_digest(&step.action, &step.service, step.metadata.as_ref());
    if !actual.ct_eq(claimed_value_digest) {
        return Verdict::Reject(RejectReason::ValueMismatch);
    }

    match token.policy().evaluate(&step.action_identifier(), ctx) {
        Decision::Allow => Verdict::Allow,
        Decision::Deny(reason) => Verdict::Reject(RejectReason::PolicyDenied(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, value_digest, CanonicalPlan, Plan};
    use crate::crypto::{LocalSigner, Signer};
    use crate::merkle::MerkleTree;
    use crate::policy::Policy;
    use crate::token::{Identity, TokenBuilder};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        plan: Plan,
        canonical: CanonicalPlan,
        tree: MerkleTree,
        signer: LocalSigner,
        token: Token,
    }

    fn fixture_with_policy(policy: Policy) -> Fixture {
        let plan = Plan::new(vec![
            Step::new("fetch", "data-mcp"),
            Step::new("analyze", "analytics-mcp"),
        ]);
        let canonical = canonicalize(&plan).unwrap();
        let tree = MerkleTree::build(&canonical.leaf_digests()).unwrap();
        let signer = LocalSigner::generate();
        let token = TokenBuilder::new(canonical.plan_hash, tree.root())
            .policy(policy)
            .identity(Identity::new("user-1", "agent-1"))
            .validity_seconds(300)
            .issue_at(&signer, Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap())
            .unwrap();
        Fixture {
            plan,
            canonical,
            tree,
            signer,
            token,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_policy(Policy::allow_all())
    }

    fn ctx_at_issue<'a>() -> EvaluationContext<'a> {
        EvaluationContext::at(Utc.with_ymd_and_hms(2025, 6, 2, 12, 1, 0).unwrap())
    }

    #[test]
    fn test_happy_path_both_steps() {
        let f = fixture();
        let ctx = ctx_at_issue();

        for i in 0..2 {
            let verdict = verify_step(
                &f.token,
                &f.signer.public_key(),
                &f.canonical.nodes[i].path,
                &f.canonical.nodes[i].value_digest,
                &f.tree.prove(i).unwrap(),
                &f.plan.steps[i],
                &ctx,
            );
            assert!(verdict.is_allow(), "step {} rejected: {:?}", i, verdict);
        }
    }

    #[test]
    fn test_wrong_issuer_key_rejected_first() {
        let f = fixture();
        // Even with an otherwise-broken claim, the signature check fires
        // first against the wrong key.
        let verdict = verify_step(
            &f.token,
            &LocalSigner::generate().public_key(),
            "not-a-path",
            &value_digest(&json!("junk")),
            &Proof::default(),
            &f.plan.steps[0],
            &ctx_at_issue(),
        );
        assert_eq!(verdict, Verdict::Reject(RejectReason::InvalidSignature));
    }

    #[test]
    fn test_expired_token_rejected_before_path() {
        let f = fixture();
        let late = EvaluationContext::at(Utc.with_ymd_and_hms(2025, 6, 2, 13, 0, 0).unwrap());
        let verdict = verify_step(
            &f.token,
            &f.signer.public_key(),
            "not-a-path",
            &f.canonical.nodes[0].value_digest,
            &f.tree.prove(0).unwrap(),
            &f.plan.steps[0],
            &late,
        );
        assert_eq!(
            verdict,
            Verdict::Reject(RejectReason::TokenExpired {
                expired_at: f.token.expires_at()
            })
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let f = fixture();
        let proof = f.tree.prove(0).unwrap();
        let args = |ctx: &EvaluationContext<'_>| {
            verify_step(
                &f.token,
                &f.signer.public_key(),
                &f.canonical.nodes[0].path,
                &f.canonical.nodes[0].value_digest,
                &proof,
                &f.plan.steps[0],
                ctx,
            )
        };

        let one_before = EvaluationContext::at(Utc.with_ymd_and_hms(2025, 6, 2, 12, 4, 59).unwrap());
        assert!(args(&one_before).is_allow());

        let boundary = EvaluationContext::at(Utc.with_ymd_and_hms(2025, 6, 2, 12, 5, 0).unwrap());
        assert!(matches!(
            args(&boundary),
            Verdict::Reject(RejectReason::TokenExpired { .. })
        ));
    }

    #[test]
    fn test_malformed_path_rejected() {
        let f = fixture();
        let verdict = verify_step(
            &f.token,
            &f.signer.public_key(),
            "/steps/[01]",
            &f.canonical.nodes[0].value_digest,
            &f.tree.prove(0).unwrap(),
            &f.plan.steps[0],
            &ctx_at_issue(),
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::MalformedPath { .. })
        ));
    }

    #[test]
    fn test_fabricated_step_rejected_by_merkle() {
        let f = fixture();
        // A step never committed to: its digest has no inclusion proof that
        // folds to the root, whatever proof bytes come with it.
        let fabricated = Step::new("delete_all", "data-mcp");
        let fabricated_digest =
            step_value_digest(&fabricated.action, &fabricated.service, None);
        let verdict = verify_step(
            &f.token,
            &f.signer.public_key(),
            "/steps/[2]",
            &fabricated_digest,
            &f.tree.prove(0).unwrap(),
            &fabricated,
            &ctx_at_issue(),
        );
        assert_eq!(verdict, Verdict::Reject(RejectReason::MerkleProofInvalid));
    }

    #[test]
    fn test_substituted_request_rejected_by_value_check() {
        let f = fixture();
        // Valid proof for step 0, but the actual request differs from the
        // proven content.
        let swapped = Step::new("drop_tables", "data-mcp");
        let verdict = verify_step(
            &f.token,
            &f.signer.public_key(),
            &f.canonical.nodes[0].path,
            &f.canonical.nodes[0].value_digest,
            &f.tree.prove(0).unwrap(),
            &swapped,
            &ctx_at_issue(),
        );
        assert_eq!(verdict, Verdict::Reject(RejectReason::ValueMismatch));
    }

    #[test]
    fn test_policy_denied_step() {
        let f = fixture_with_policy(Policy::allow_only(vec!["data-mcp/fetch".to_string()]));
        let ctx = ctx_at_issue();

        // Step 0 (data-mcp/fetch) allowed.
        assert!(verify_step(
            &f.token,
            &f.signer.public_key(),
            &f.canonical.nodes[0].path,
            &f.canonical.nodes[0].value_digest,
            &f.tree.prove(0).unwrap(),
            &f.plan.steps[0],
            &ctx,
        )
        .is_allow());

        // Step 1 (analytics-mcp/analyze) structurally valid but denied.
        let verdict = verify_step(
            &f.token,
            &f.signer.public_key(),
            &f.canonical.nodes[1].path,
            &f.canonical.nodes[1].value_digest,
            &f.tree.prove(1).unwrap(),
            &f.plan.steps[1],
            &ctx,
        );
        assert!(matches!(
            verdict,
            Verdict::Reject(RejectReason::PolicyDenied(_))
        ));
    }

    #[test]
    fn test_reason_names_and_statuses() {
        assert_eq!(RejectReason::InvalidSignature.http_status(), 401);
        assert_eq!(RejectReason::TokenExpired { expired_at: 0 }.http_status(), 401);
        assert_eq!(
            RejectReason::MalformedPath { path: "x".into() }.http_status(),
            400
        );
        assert_eq!(RejectReason::MerkleProofInvalid.http_status(), 409);
        assert_eq!(RejectReason::ValueMismatch.http_status(), 409);
        assert_eq!(
            RejectReason::PolicyDenied(crate::policy::DenyReason::NotAllowed).http_status(),
            403
        );
        assert_eq!(RejectReason::MerkleProofInvalid.name(), "merkle-proof-invalid");
    }
}
