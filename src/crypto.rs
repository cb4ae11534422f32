//! Cryptographic primitives: Ed25519 keys, signatures, and the signer seam.
//!
//! All signatures are computed over `SIGNATURE_CONTEXT || message` so that a
//! signature produced for this protocol can never validate in another.
//!
//! Key custody is abstracted behind the [`Signer`] trait: the issuer and the
//! delegation engine only require `sign(bytes) -> Signature` plus the
//! corresponding public key. [`LocalSigner`] holds an in-process
//! [`SigningKey`]; deployments backed by a KMS or HSM implement the trait
//! over their own transport.

use crate::error::{Error, Result};
use crate::SIGNATURE_CONTEXT;
use ed25519_dalek::{
    Signature as DalekSignature, Signer as DalekSigner, SigningKey as Ed25519SigningKey, Verifier,
    VerifyingKey,
};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use secrecy::{CloneableSecret, ExposeSecret, Secret, Zeroize};
use serde::{Deserialize, Serialize};

/// An Ed25519 private key for signing token payloads.
///
/// The key is wrapped in `Secret` for guaranteed zeroization on drop and a
/// redacted `Debug` representation.
#[derive(Clone)]
pub struct SigningKey {
    signing_key: Secret<Ed25519SigningKeyWrapper>,
}

// ed25519-dalek 2.x SigningKey zeroizes on Drop; Zeroize here is a no-op
// so the type satisfies secrecy's bounds.
struct Ed25519SigningKeyWrapper(Ed25519SigningKey);

impl Clone for Ed25519SigningKeyWrapper {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Zeroize for Ed25519SigningKeyWrapper {
    fn zeroize(&mut self) {}
}

impl CloneableSecret for Ed25519SigningKeyWrapper {}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("signing_key", &"***SECRET***")
            .finish()
    }
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Create a signing key from secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(bytes);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.expose_secret().0.verifying_key(),
        }
    }

    /// Sign a message with the protocol context prefix.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let prefixed = Self::prefix_message(message);
        let sig = self.signing_key.expose_secret().0.sign(&prefixed);
        Signature { inner: sig }
    }

    /// Get the secret key bytes.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.expose_secret().0.to_bytes()
    }

    fn prefix_message(message: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(SIGNATURE_CONTEXT.len() + message.len());
        prefixed.extend_from_slice(SIGNATURE_CONTEXT);
        prefixed.extend_from_slice(message);
        prefixed
    }

    /// Create a signing key from a PKCS#8 PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let signing_key = Ed25519SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::CryptoError(format!("invalid PEM: {}", e)))?;
        Ok(Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        })
    }

    /// Export the signing key as a PKCS#8 PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.signing_key
            .expose_secret()
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::CryptoError(format!("PEM encoding failed: {}", e)))
    }
}

/// A public key for verifying token signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|e| Error::CryptoError(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Create a public key from a hex string (the SDK wire form).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::CryptoError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::CryptoError("invalid public key length".to_string()))?;
        Self::from_bytes(&arr)
    }

    /// Get the public key as raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Hex encoding of the full key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short fingerprint (first 16 hex chars) for audit records.
    pub fn fingerprint(&self) -> String {
        let bytes = self.to_bytes();
        hex::encode(&bytes[..8])
    }

    /// Verify a context-prefixed signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let prefixed = SigningKey::prefix_message(message);
        self.verifying_key
            .verify(&prefixed, &signature.inner)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }

    /// Create a public key from a SubjectPublicKeyInfo PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let verifying_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| Error::CryptoError(format!("invalid PEM: {}", e)))?;
        Ok(Self { verifying_key })
    }

    /// Export the public key as a PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::CryptoError(format!("PEM encoding failed: {}", e)))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

const ED25519_ALG_ID: u8 = 1;

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            // Wire format: [algorithm, bytes]
            use serde::ser::SerializeTuple;
            let mut tup = serializer.serialize_tuple(2)?;
            tup.serialize_element(&ED25519_ALG_ID)?;
            tup.serialize_element(&serde_bytes::Bytes::new(&bytes))?;
            tup.end()
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            struct PublicKeyVisitor;

            impl<'de> serde::de::Visitor<'de> for PublicKeyVisitor {
                type Value = PublicKey;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a public key array [algo, bytes]")
                }

                fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let alg: u8 = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                    if alg != ED25519_ALG_ID {
                        return Err(serde::de::Error::custom(format!(
                            "unsupported algorithm id: {}",
                            alg
                        )));
                    }
                    let bytes: Vec<u8> = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                    let arr: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| serde::de::Error::custom("invalid public key length"))?;
                    PublicKey::from_bytes(&arr).map_err(serde::de::Error::custom)
                }
            }

            deserializer.deserialize_tuple(2, PublicKeyVisitor)
        }
    }
}

/// An Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: DalekSignature,
}

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: DalekSignature::from_bytes(bytes),
        }
    }

    /// Get the signature as raw bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    /// Hex encoding for human-facing transports.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            use serde::ser::SerializeTuple;
            let mut tup = serializer.serialize_tuple(2)?;
            tup.serialize_element(&ED25519_ALG_ID)?;
            tup.serialize_element(&serde_bytes::Bytes::new(&bytes))?;
            tup.end()
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
            let arr: [u8; 64] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
            Ok(Signature::from_bytes(&arr))
        } else {
            struct SignatureVisitor;

            impl<'de> serde::de::Visitor<'de> for SignatureVisitor {
                type Value = Signature;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a signature array [algo, bytes]")
                }

                fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let alg: u8 = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                    if alg != ED25519_ALG_ID {
                        return Err(serde::de::Error::custom(format!(
                            "unsupported algorithm id: {}",
                            alg
                        )));
                    }
                    let bytes: Vec<u8> = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                    let arr: [u8; 64] = bytes
                        .try_into()
                        .map_err(|_| serde::de::Error::custom("invalid signature length"))?;
                    Ok(Signature::from_bytes(&arr))
                }
            }

            deserializer.deserialize_tuple(2, SignatureVisitor)
        }
    }
}

/// Capability seam for key custody.
///
/// The core never touches private key material beyond this trait. A signer
/// may be local, a KMS client, or an HSM frontend; the only requirements are
/// a deterministic public key and a `sign` call that either produces a
/// signature over the context-prefixed message or fails with
/// [`Error::SigningFailed`].
pub trait Signer: Send + Sync {
    /// Sign a message. The implementation must apply the protocol context
    /// prefix (as [`SigningKey::sign`] does).
    fn sign(&self, message: &[u8]) -> Result<Signature>;

    /// The public key callers verify against.
    fn public_key(&self) -> PublicKey;

    /// Identifier for the signing key (for the token's `key_id` field).
    fn key_id(&self) -> String {
        self.public_key().fingerprint()
    }
}

/// A signer backed by an in-process [`SigningKey`].
#[derive(Debug, Clone)]
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Generate a signer with a fresh random key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(),
        }
    }
}

impl Signer for LocalSigner {
    fn sign(&self, message: &[u8]) -> Result<Signature> {
        Ok(self.key.sign(message))
    }

    fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let key = SigningKey::generate();
        assert_eq!(key.public_key().to_bytes().len(), 32);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate();
        let message = b"test message";
        let signature = key.sign(message);
        assert!(key.public_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let key = SigningKey::generate();
        let signature = key.sign(b"test message");
        assert!(key.public_key().verify(b"wrong message", &signature).is_err());
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let key1 = SigningKey::generate();
        let key2 = SigningKey::generate();
        let signature = key1.sign(b"test message");
        assert!(key2.public_key().verify(b"test message", &signature).is_err());
    }

    #[test]
    fn test_key_from_bytes_roundtrip() {
        let key = SigningKey::generate();
        let restored = SigningKey::from_bytes(&key.secret_key_bytes());
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_context_prefix_prevents_cross_protocol() {
        let key = SigningKey::generate();
        let message = b"test message";
        let signature = key.sign(message);

        // A raw signature without the context prefix must not verify.
        let raw_sig = key.signing_key.expose_secret().0.sign(message);
        let unprefixed = Signature { inner: raw_sig };

        assert!(key.public_key().verify(message, &unprefixed).is_err());
        assert!(key.public_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = SigningKey::generate();
        let pk = key.public_key();
        let restored = PublicKey::from_hex(&pk.to_hex()).unwrap();
        assert_eq!(pk, restored);
    }

    #[test]
    fn test_public_key_json_is_hex() {
        let pk = SigningKey::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        let s: String = serde_json::from_str(&json).unwrap();
        assert_eq!(s, pk.to_hex());
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }

    #[test]
    fn test_local_signer_matches_key() {
        let key = SigningKey::generate();
        let signer = LocalSigner::new(key.clone());
        let sig = signer.sign(b"payload").unwrap();
        assert!(key.public_key().verify(b"payload", &sig).is_ok());
        assert_eq!(signer.public_key(), key.public_key());
        assert_eq!(signer.key_id(), key.public_key().fingerprint());
    }

    #[test]
    fn test_pem_roundtrip() {
        let key = SigningKey::generate();
        let pem = key.to_pem().unwrap();
        let restored = SigningKey::from_pem(&pem).unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        let pub_pem = key.public_key().to_pem().unwrap();
        let restored_pub = PublicKey::from_pem(&pub_pem).unwrap();
        assert_eq!(key.public_key(), restored_pub);
    }
}
