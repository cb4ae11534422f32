//! Wire encoding: CBOR bytes and base64url strings for token transport.
//!
//! The binary form is deterministic CBOR of `{payload_bytes, signature}`;
//! because the signed payload travels as its exact bytes, re-encoding never
//! invalidates a signature. The string form is base64url (no padding) over
//! the CBOR bytes, suitable for headers and JSON fields.
//!
//! Size is bounded before any parsing happens, so a hostile peer cannot make
//! a verifier allocate unboundedly.

use crate::error::{Error, Result};
use crate::token::Token;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

/// Maximum serialized token size in bytes.
pub const MAX_TOKEN_SIZE: usize = 64 * 1024;

/// HTTP header names used by peer SDKs for per-request proof material.
pub const TOKEN_HEADER: &str = "X-CSRG-Token";
pub const PATH_HEADER: &str = "X-CSRG-Path";
pub const PROOF_HEADER: &str = "X-CSRG-Proof";
pub const VALUE_DIGEST_HEADER: &str = "X-CSRG-Value-Digest";

/// Encode a token to CBOR bytes.
pub fn encode(token: &Token) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(token, &mut buf)?;
    if buf.len() > MAX_TOKEN_SIZE {
        return Err(Error::TokenTooLarge {
            size: buf.len(),
            max: MAX_TOKEN_SIZE,
        });
    }
    Ok(buf)
}

/// Decode a token from CBOR bytes.
///
/// The size bound is checked before any CBOR parsing. Version checking
/// happens inside payload decoding; an unknown version is rejected.
pub fn decode(bytes: &[u8]) -> Result<Token> {
    if bytes.len() > MAX_TOKEN_SIZE {
        return Err(Error::TokenTooLarge {
            size: bytes.len(),
            max: MAX_TOKEN_SIZE,
        });
    }
    Ok(ciborium::de::from_reader(bytes)?)
}

/// Encode a token as a base64url string (no padding).
pub fn encode_base64(token: &Token) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(encode(token)?))
}

/// Expanded JSON form for cross-language consumers.
///
/// Exposes the payload fields at the top level (hex digests, integer unix
/// timestamps, nested policy and identity) for inspection and display, and
/// carries the exact signed bytes plus signature so the token remains
/// verifiable after the round trip.
pub fn encode_json(token: &Token) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(token.payload())
        .map_err(|e| Error::SerializationError(e.to_string()))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::SerializationError("payload is not an object".to_string()))?;
    obj.insert(
        "payload".to_string(),
        serde_json::Value::String(URL_SAFE_NO_PAD.encode(token.payload_bytes())),
    );
    obj.insert(
        "signature".to_string(),
        serde_json::Value::String(token.signature().to_hex()),
    );
    Ok(value)
}

/// Decode a token from its expanded JSON form.
///
/// Only the `payload` bytes and `signature` are authoritative; the exposed
/// fields are re-derived from the signed bytes, so an attacker editing the
/// display fields changes nothing.
pub fn decode_json(value: &serde_json::Value) -> Result<Token> {
    let payload_b64 = value
        .get("payload")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MissingField("payload".to_string()))?;
    if payload_b64.len() / 4 * 3 > MAX_TOKEN_SIZE {
        return Err(Error::TokenTooLarge {
            size: payload_b64.len() / 4 * 3,
            max: MAX_TOKEN_SIZE,
        });
    }
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64.as_bytes())
        .map_err(|e| Error::DeserializationError(format!("invalid base64: {}", e)))?;

    let signature_hex = value
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MissingField("signature".to_string()))?;
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| Error::DeserializationError(format!("invalid signature hex: {}", e)))?;
    let sig_arr: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| Error::DeserializationError("invalid signature length".to_string()))?;

    Token::from_parts(payload_bytes, crate::crypto::Signature::from_bytes(&sig_arr))
}

/// Decode a token from a base64url string.
pub fn decode_base64(s: &str) -> Result<Token> {
    // Reject oversized input before base64 decoding allocates.
    if s.len() / 4 * 3 > MAX_TOKEN_SIZE {
        return Err(Error::TokenTooLarge {
            size: s.len() / 4 * 3,
            max: MAX_TOKEN_SIZE,
        });
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(s.as_bytes())
        .map_err(|e| Error::DeserializationError(format!("invalid base64: {}", e)))?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, Plan, Step};
    use crate::crypto::{LocalSigner, Signer};
    use crate::merkle::MerkleTree;
    use crate::policy::Policy;
    use crate::token::{Identity, TokenBuilder};

    fn make_token(signer: &LocalSigner) -> Token {
        let plan = Plan::new(vec![Step::new("fetch", "data-mcp")]);
        let canonical = canonicalize(&plan).unwrap();
        let tree = MerkleTree::build(&canonical.leaf_digests()).unwrap();
        TokenBuilder::new(canonical.plan_hash, tree.root())
            .policy(Policy::allow_all())
            .identity(Identity::new("user-1", "agent-1"))
            .validity_seconds(300)
            .issue(signer)
            .unwrap()
    }

    #[test]
    fn test_cbor_roundtrip() {
        let signer = LocalSigner::generate();
        let token = make_token(&signer);

        let bytes = encode(&token).unwrap();
        let back = decode(&bytes).unwrap();

        assert_eq!(back.token_id(), token.token_id());
        assert_eq!(back.payload_bytes(), token.payload_bytes());
        assert!(back.verify_signature(&signer.public_key()).is_ok());
    }

    #[test]
    fn test_base64_roundtrip() {
        let signer = LocalSigner::generate();
        let token = make_token(&signer);

        let s = encode_base64(&token).unwrap();
        // URL-safe alphabet, no padding.
        assert!(!s.contains('='));
        assert!(!s.contains('+'));
        assert!(!s.contains('/'));

        let back = decode_base64(&s).unwrap();
        assert!(back.verify_signature(&signer.public_key()).is_ok());
    }

    #[test]
    fn test_decode_rejects_oversized_input() {
        let huge = vec![0u8; MAX_TOKEN_SIZE + 1];
        assert!(matches!(
            decode(&huge),
            Err(Error::TokenTooLarge { .. })
        ));

        let huge_b64 = "A".repeat((MAX_TOKEN_SIZE + 1024) * 4 / 3);
        assert!(matches!(
            decode_base64(&huge_b64),
            Err(Error::TokenTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not cbor at all"),
            Err(Error::DeserializationError(_))
        ));
        assert!(matches!(
            decode_base64("!!!not-base64!!!"),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn test_json_form_exposes_fields_and_stays_verifiable() {
        let signer = LocalSigner::generate();
        let token = make_token(&signer);

        let json = encode_json(&token).unwrap();
        assert_eq!(json["plan_hash"], token.plan_hash().to_hex());
        assert_eq!(json["merkle_root"], token.merkle_root().to_hex());
        assert_eq!(json["issued_at"], token.issued_at());
        assert_eq!(json["expires_at"], token.expires_at());
        assert_eq!(json["identity"]["user_id"], "user-1");
        assert_eq!(json["version"], 1);

        let back = decode_json(&json).unwrap();
        assert!(back.verify_signature(&signer.public_key()).is_ok());
    }

    #[test]
    fn test_json_display_fields_are_not_authoritative() {
        let signer = LocalSigner::generate();
        let token = make_token(&signer);

        // Editing an exposed field does nothing: the decoded token comes
        // from the signed bytes.
        let mut json = encode_json(&token).unwrap();
        json["expires_at"] = serde_json::json!(i64::MAX);
        let back = decode_json(&json).unwrap();
        assert_eq!(back.expires_at(), token.expires_at());
    }

    #[test]
    fn test_signature_survives_double_roundtrip() {
        // Encode, decode, encode again: the signed bytes are carried
        // verbatim, so the signature still verifies.
        let signer = LocalSigner::generate();
        let token = make_token(&signer);

        let once = decode(&encode(&token).unwrap()).unwrap();
        let twice = decode(&encode(&once).unwrap()).unwrap();
        assert!(twice.verify_signature(&signer.public_key()).is_ok());
    }
}
