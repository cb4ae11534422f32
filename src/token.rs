//! Intent tokens: the signed commitment binding a plan to a policy and an
//! identity.
//!
//! A [`Token`] carries its payload twice: as typed fields and as the exact
//! CBOR bytes that were signed. Signature verification always runs over the
//! stored `payload_bytes`, never over a re-serialization, so a token that
//! round-trips through any transport still verifies bit-for-bit.
//!
//! Issuance goes through [`TokenBuilder`], which validates inputs before any
//! signing happens. The builder signs via the [`Signer`] seam, so key custody
//! (local, KMS, HSM) is the caller's choice.

use crate::canonical::Digest;
use crate::crypto::{PublicKey, Signature, Signer};
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::TOKEN_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TOKEN_ID_PREFIX: &str = "csrg_tok_";

/// Unique token identifier: `csrg_tok_` followed by a UUIDv7.
///
/// UUIDv7 is time-ordered, so token IDs sort by issuance time in logs and
/// stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenId(String);

impl TokenId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(format!("{}{}", TOKEN_ID_PREFIX, Uuid::now_v7()))
    }

    /// Parse and validate an identifier string.
    pub fn parse(s: &str) -> Result<Self> {
        let suffix = s
            .strip_prefix(TOKEN_ID_PREFIX)
            .ok_or_else(|| Error::InvalidId(format!("missing '{}' prefix", TOKEN_ID_PREFIX)))?;
        Uuid::parse_str(suffix).map_err(|e| Error::InvalidId(e.to_string()))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for TokenId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TokenId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The issuing principal a token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub agent_id: String,
    /// Identifier of the signing key. Filled from the signer at issuance
    /// when left empty.
    #[serde(default)]
    pub key_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            key_id: String::new(),
        }
    }

    /// Counter key for per-caller rate limiting.
    pub fn rate_key(&self) -> String {
        format!("{}/{}", self.user_id, self.agent_id)
    }
}

/// The signed content of a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Format version. Verifiers reject versions they do not understand.
    pub version: u8,
    pub token_id: TokenId,
    /// Whole-document commitment from canonicalization.
    pub plan_hash: Digest,
    /// Merkle root over the per-step value digests.
    pub merkle_root: Digest,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds. The token is invalid from this instant onward.
    pub expires_at: i64,
    /// Always explicit. An empty allow list denies everything.
    pub policy: Policy,
    pub identity: Identity,
    /// When set, only this key's holder may exercise the token. Delegation
    /// binds this to the delegate's key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<PublicKey>,
}

/// A signed intent token.
///
/// Immutable once issued. `payload_bytes` is the exact signed encoding; the
/// typed `payload` is decoded from it and the two never diverge.
#[derive(Debug, Clone)]
pub struct Token {
    payload: TokenPayload,
    payload_bytes: Vec<u8>,
    signature: Signature,
}

impl Token {
    pub fn payload(&self) -> &TokenPayload {
        &self.payload
    }

    /// The exact bytes the signature covers.
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload_bytes
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn token_id(&self) -> &TokenId {
        &self.payload.token_id
    }

    pub fn plan_hash(&self) -> &Digest {
        &self.payload.plan_hash
    }

    pub fn merkle_root(&self) -> &Digest {
        &self.payload.merkle_root
    }

    pub fn policy(&self) -> &Policy {
        &self.payload.policy
    }

    pub fn identity(&self) -> &Identity {
        &self.payload.identity
    }

    pub fn holder(&self) -> Option<&PublicKey> {
        self.payload.holder.as_ref()
    }

    pub fn issued_at(&self) -> i64 {
        self.payload.issued_at
    }

    pub fn expires_at(&self) -> i64 {
        self.payload.expires_at
    }

    /// Whether the token is expired at `now`. The boundary instant itself is
    /// expired: a token with `expires_at = T` is rejected at `T`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.payload.expires_at
    }

    /// Seconds of validity remaining at `now`, zero if expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.payload.expires_at - now.timestamp()).max(0)
    }

    /// Verify the signature over the stored payload bytes.
    pub fn verify_signature(&self, issuer: &PublicKey) -> Result<()> {
        issuer.verify(&self.payload_bytes, &self.signature)
    }

    /// Reassemble a token from its signed bytes and signature, decoding the
    /// typed payload from the bytes. Used by wire decoding.
    pub(crate) fn from_parts(payload_bytes: Vec<u8>, signature: Signature) -> Result<Self> {
        let payload: TokenPayload = ciborium::de::from_reader(payload_bytes.as_slice())?;
        if payload.version != TOKEN_VERSION {
            return Err(Error::UnsupportedVersion(payload.version));
        }
        Ok(Self {
            payload,
            payload_bytes,
            signature,
        })
    }
}

// On the wire a token is {payload_bytes, signature}: the payload travels as
// the exact signed bytes. Human-readable formats carry payload_bytes as
// base64url (no padding).
impl Serialize for Token {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let human = serializer.is_human_readable();
        let mut st = serializer.serialize_struct("Token", 2)?;
        if human {
            use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
            st.serialize_field("payload_bytes", &URL_SAFE_NO_PAD.encode(&self.payload_bytes))?;
        } else {
            st.serialize_field("payload_bytes", serde_bytes::Bytes::new(&self.payload_bytes))?;
        }
        st.serialize_field("signature", &self.signature)?;
        st.end()
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct HumanWire {
            payload_bytes: String,
            signature: Signature,
        }

        #[derive(Deserialize)]
        struct BinaryWire {
            #[serde(with = "serde_bytes")]
            payload_bytes: Vec<u8>,
            signature: Signature,
        }

        let (payload_bytes, signature) = if deserializer.is_human_readable() {
            use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
            let wire = HumanWire::deserialize(deserializer)?;
            let bytes = URL_SAFE_NO_PAD
                .decode(wire.payload_bytes.as_bytes())
                .map_err(serde::de::Error::custom)?;
            (bytes, wire.signature)
        } else {
            let wire = BinaryWire::deserialize(deserializer)?;
            (wire.payload_bytes, wire.signature)
        };

        Token::from_parts(payload_bytes, signature).map_err(serde::de::Error::custom)
    }
}

/// Builder for token issuance.
///
/// ```
/// # use csrg_core::{canonical::{canonicalize, Plan, Step}, merkle::MerkleTree,
/// #     crypto::{LocalSigner, Signer}, policy::Policy, token::{Identity, TokenBuilder}};
/// let plan = Plan::new(vec![Step::new("fetch", "data-mcp")]);
/// let canonical = canonicalize(&plan).unwrap();
/// let tree = MerkleTree::build(&canonical.leaf_digests()).unwrap();
/// let signer = LocalSigner::generate();
///
/// let token = TokenBuilder::new(canonical.plan_hash, tree.root())
///     .policy(Policy::allow_only(vec!["data-mcp/fetch".into()]))
///     .identity(Identity::new("user-1", "agent-1"))
///     .validity_seconds(300)
///     .issue(&signer)
///     .unwrap();
/// assert!(token.verify_signature(&signer.public_key()).is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    plan_hash: Digest,
    merkle_root: Digest,
    policy: Option<Policy>,
    identity: Option<Identity>,
    validity_seconds: i64,
    holder: Option<PublicKey>,
}

impl TokenBuilder {
    pub fn new(plan_hash: Digest, merkle_root: Digest) -> Self {
        Self {
            plan_hash,
            merkle_root,
            policy: None,
            identity: None,
            validity_seconds: 0,
            holder: None,
        }
    }

    /// The policy to embed. Required; there is no implicit default.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Validity window in seconds from issuance. Must be positive.
    pub fn validity_seconds(mut self, seconds: i64) -> Self {
        self.validity_seconds = seconds;
        self
    }

    /// Bind the token to a holder key.
    pub fn holder(mut self, holder: PublicKey) -> Self {
        self.holder = Some(holder);
        self
    }

    /// Issue the token, signing with the current time as issuance instant.
    pub fn issue(self, signer: &dyn Signer) -> Result<Token> {
        self.issue_at(signer, Utc::now())
    }

    /// Issue with an explicit issuance instant.
    ///
    /// All inputs are validated before the signer is invoked; a signer
    /// failure produces no partial token.
    pub fn issue_at(self, signer: &dyn Signer, now: DateTime<Utc>) -> Result<Token> {
        if self.validity_seconds <= 0 {
            return Err(Error::InvalidValidity(format!(
                "validity_seconds must be positive, got {}",
                self.validity_seconds
            )));
        }
        let policy = self.policy.ok_or_else(|| Error::MissingField("policy".into()))?;
        policy.validate()?;
        let mut identity = self
            .identity
            .ok_or_else(|| Error::MissingField("identity".into()))?;
        if identity.key_id.is_empty() {
            identity.key_id = signer.key_id();
        }

        let issued_at = now.timestamp();
        let payload = TokenPayload {
            version: TOKEN_VERSION,
            token_id: TokenId::new(),
            plan_hash: self.plan_hash,
            merkle_root: self.merkle_root,
            issued_at,
            expires_at: issued_at + self.validity_seconds,
            policy,
            identity,
            holder: self.holder,
        };

        let mut payload_bytes = Vec::new();
        ciborium::ser::into_writer(&payload, &mut payload_bytes)?;
        let signature = signer.sign(&payload_bytes)?;

        let token = Token {
            payload,
            payload_bytes,
            signature,
        };
        crate::audit::log_event(&crate::audit::AuditEvent::token_issued(&token));
        Ok(token)
    }
}
