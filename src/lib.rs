//! # csrg-core
//!
//! Intent assurance for agent plans: canonicalize a declared plan, commit to
//! it with a Merkle tree, issue a signed token over the commitment, and
//! verify each step against the token before it executes. Delegation hands a
//! token to another agent with strictly narrower authority.
//!
//! The pipeline:
//!
//! 1. **Canonicalize** ([`canonical`]) - deterministic per-step digests and
//!    a whole-plan hash, stable across key ordering and whitespace.
//! 2. **Commit** ([`merkle`]) - a Merkle root over the step digests, with
//!    O(log n) inclusion proofs.
//! 3. **Issue** ([`token`]) - an Ed25519-signed token binding the
//!    commitment to a policy, an identity, and a validity window.
//! 4. **Verify** ([`verify`]) - per-step checks in fixed order: signature,
//!    expiry, path, inclusion proof, value digest, policy.
//! 5. **Delegate** ([`delegation`]) - attenuation-only hand-off to another
//!    agent's key.
//!
//! ## Example
//!
//! ```
//! use csrg_core::canonical::{canonicalize, Plan, Step};
//! use csrg_core::crypto::{LocalSigner, Signer};
//! use csrg_core::merkle::MerkleTree;
//! use csrg_core::policy::{EvaluationContext, Policy};
//! use csrg_core::token::{Identity, TokenBuilder};
//! use csrg_core::verify::verify_step;
//! use chrono::Utc;
//!
//! // The agent declares its plan up front.
//! let plan = Plan::new(vec![
//!     Step::new("fetch", "data-mcp"),
//!     Step::new("analyze", "analytics-mcp"),
//! ]);
//! let canonical = canonicalize(&plan).unwrap();
//! let tree = MerkleTree::build(&canonical.leaf_digests()).unwrap();
//!
//! // The issuer signs a token over the commitment.
//! let signer = LocalSigner::generate();
//! let token = TokenBuilder::new(canonical.plan_hash, tree.root())
//!     .policy(Policy::allow_only(vec![
//!         "data-mcp/fetch".into(),
//!         "analytics-mcp/analyze".into(),
//!     ]))
//!     .identity(Identity::new("user-1", "agent-1"))
//!     .validity_seconds(300)
//!     .issue(&signer)
//!     .unwrap();
//!
//! // An execution service verifies step 0 before acting.
//! let verdict = verify_step(
//!     &token,
//!     &signer.public_key(),
//!     &canonical.nodes[0].path,
//!     &canonical.nodes[0].value_digest,
//!     &tree.prove(0).unwrap(),
//!     &plan.steps[0],
//!     &EvaluationContext::at(Utc::now()),
//! );
//! assert!(verdict.is_allow());
//! ```
//!
//! ## Security model
//!
//! The verifier trusts only the issuer's public key and the mathematics: a
//! step executes only if its content was committed to at issuance, the
//! token is unexpired and policy allows it. Rejections are values, not
//! errors - see [`verify::Verdict`]. All signatures are domain-separated
//! with [`SIGNATURE_CONTEXT`], and digest comparisons on the verification
//! path are constant-time.

pub mod audit;
pub mod canonical;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod merkle;
pub mod policy;
pub mod token;
pub mod verify;
pub mod wire;

pub use canonical::{canonicalize, CanonicalPlan, Digest, Plan, Step};
pub use crypto::{LocalSigner, PublicKey, Signature, Signer, SigningKey};
pub use delegation::{delegate, Delegation, DelegationRequest};
pub use error::{Error, ErrorKind, Result};
pub use merkle::{MerkleTree, Proof};
pub use policy::{Decision, EvaluationContext, Policy};
pub use token::{Identity, Token, TokenBuilder, TokenId};
pub use verify::{verify_step, RejectReason, Verdict};

/// Token format version understood by this build.
pub const TOKEN_VERSION: u8 = 1;

/// Domain-separation prefix applied to every signature. A signature
/// produced here can never validate in another protocol, and vice versa.
pub const SIGNATURE_CONTEXT: &[u8] = b"csrg-token-v1";
