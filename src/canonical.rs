//! Plan canonicalization: deterministic digests over declared action plans.
//!
//! A [`Plan`] is an ordered list of [`Step`]s an agent declares before
//! execution. Canonicalization turns it into per-step [`CanonicalNode`]s with
//! stable paths (`/steps/[i]`) and SHA-256 value digests, plus a
//! document-level `plan_hash`. The core guarantee is determinism: the same
//! logical plan, regardless of key ordering or whitespace in its source
//! encoding, always produces byte-identical digests.
//!
//! The canonical serialization is JSON with lexicographically sorted keys,
//! no insignificant whitespace, and all non-ASCII characters escaped -
//! byte-compatible with Python's
//! `json.dumps(v, sort_keys=True, separators=(",", ":"), ensure_ascii=True)`,
//! which peer implementations use.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// A 32-byte SHA-256 digest.
///
/// Serializes as lowercase hex in human-readable formats and as raw bytes
/// on the binary wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a digest from a hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::DeserializationError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::DeserializationError("invalid digest length".to_string()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality, for comparisons on the verification path.
    pub fn ct_eq(&self, other: &Digest) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Digest::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes: serde_bytes::ByteBuf = serde_bytes::ByteBuf::deserialize(deserializer)?;
            let arr: [u8; 32] = bytes
                .into_vec()
                .try_into()
                .map_err(|_| serde::de::Error::custom("invalid digest length"))?;
            Ok(Digest(arr))
        }
    }
}

/// One declared action in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Action name (required, non-empty).
    pub action: String,
    /// Target execution service identifier (required, non-empty).
    pub service: String,
    /// Human-facing description. Not part of the value digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque step parameters/metadata. Part of the value digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Step {
    pub fn new(action: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            service: service.into(),
            description: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The `service/action` identifier used for policy evaluation.
    pub fn action_identifier(&self) -> String {
        format!("{}/{}", self.service, self.action)
    }
}

/// An ordered sequence of declared steps plus optional plan-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The canonical form of one step: its index, stable path, and value digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalNode {
    /// 0-based step position. Step order is significant and preserved.
    pub index: usize,
    /// Deterministic path, `/steps/[i]`.
    pub path: String,
    /// SHA-256 of the canonical serialization of `{action, service, metadata}`.
    pub value_digest: Digest,
}

/// Output of [`canonicalize`]: the ordered nodes and the document commitment.
#[derive(Debug, Clone)]
pub struct CanonicalPlan {
    pub nodes: Vec<CanonicalNode>,
    /// Whole-document hash, independent of the Merkle tree. Used for
    /// human-facing "this is plan X" comparisons and identity binding.
    pub plan_hash: Digest,
}

impl CanonicalPlan {
    /// The ordered leaf digests, ready for Merkle tree construction.
    pub fn leaf_digests(&self) -> Vec<Digest> {
        self.nodes.iter().map(|n| n.value_digest).collect()
    }
}

/// Canonical path for step `i`.
pub fn step_path(index: usize) -> String {
    format!("/steps/[{}]", index)
}

/// Parse and validate a claimed canonical path.
///
/// Grammar: `/steps/[<index>]` with an optional single trailing field
/// segment (`/steps/[0]/action`), which peer SDKs use when proving
/// individual fields. Returns the step index.
pub fn parse_step_path(path: &str) -> Result<usize> {
    let rest = path
        .strip_prefix("/steps/[")
        .ok_or_else(|| Error::MalformedPath(path.to_string()))?;
    let close = rest
        .find(']')
        .ok_or_else(|| Error::MalformedPath(path.to_string()))?;
    let index_str = &rest[..close];
    if index_str.is_empty() || !index_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::MalformedPath(path.to_string()));
    }
    // No leading zeros: the canonical form of an index is unique.
    if index_str.len() > 1 && index_str.starts_with('0') {
        return Err(Error::MalformedPath(path.to_string()));
    }
    let index: usize = index_str
        .parse()
        .map_err(|_| Error::MalformedPath(path.to_string()))?;

    let tail = &rest[close + 1..];
    match tail {
        "" => Ok(index),
        t if t.starts_with('/') && t.len() > 1 && !t[1..].contains('/') => Ok(index),
        _ => Err(Error::MalformedPath(path.to_string())),
    }
}

/// Canonicalize a plan into ordered nodes and a document hash.
///
/// Pure function: no side effects, no partial output on error. The plan must
/// contain at least one step, and every step must have non-empty `action`
/// and `service` strings.
pub fn canonicalize(plan: &Plan) -> Result<CanonicalPlan> {
    if plan.steps.is_empty() {
        return Err(Error::MalformedPlan("plan has no steps".to_string()));
    }
    for (i, step) in plan.steps.iter().enumerate() {
        if step.action.is_empty() {
            return Err(Error::MalformedPlan(format!("step {} has empty action", i)));
        }
        if step.service.is_empty() {
            return Err(Error::MalformedPlan(format!(
                "step {} has empty service",
                i
            )));
        }
    }

    let nodes: Vec<CanonicalNode> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| CanonicalNode {
            index: i,
            path: step_path(i),
            value_digest: step_value_digest(&step.action, &step.service, step.metadata.as_ref()),
        })
        .collect();

    // plan_hash commits to the ordered concatenation of paths and value
    // digests plus the canonical plan-level metadata.
    let mut hasher = Sha256::new();
    for node in &nodes {
        hasher.update(node.path.as_bytes());
        hasher.update(node.value_digest.as_bytes());
    }
    let meta_value = match &plan.metadata {
        Some(m) => Value::Object(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        None => Value::Object(serde_json::Map::new()),
    };
    hasher.update(canonical_json(&meta_value).as_bytes());
    let plan_hash = Digest(hasher.finalize().into());

    Ok(CanonicalPlan { nodes, plan_hash })
}

/// Digest of a step's semantic content: `{action, service, metadata}` with
/// sorted keys. `description` is deliberately excluded - it is display text,
/// not authorized content.
pub fn step_value_digest(
    action: &str,
    service: &str,
    metadata: Option<&BTreeMap<String, Value>>,
) -> Digest {
    let mut obj = serde_json::Map::new();
    obj.insert("action".to_string(), Value::String(action.to_string()));
    if let Some(meta) = metadata {
        obj.insert(
            "metadata".to_string(),
            Value::Object(meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
    }
    obj.insert("service".to_string(), Value::String(service.to_string()));
    let encoded = canonical_json(&Value::Object(obj));
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Digest(hasher.finalize().into())
}

/// Digest of an arbitrary JSON value under the canonical encoding.
///
/// Peer SDKs hash individual leaf values (e.g. the bare action string at
/// `/steps/[0]/action`) the same way.
pub fn value_digest(value: &Value) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    Digest(hasher.finalize().into())
}

/// Render a JSON value in canonical form: sorted keys, `,`/`:` separators,
/// no whitespace, non-ASCII escaped as `\uXXXX`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers exactly and floats via ryu, matching
        // Python's repr for round-trippable values. Cross-language plans
        // should avoid floats in params regardless.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                // Key came from the map, so the value is present.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                // ensure_ascii semantics: BMP as \uXXXX, astral as a
                // UTF-16 surrogate pair.
                let cp = c as u32;
                if cp <= 0xFFFF {
                    out.push_str(&format!("\\u{:04x}", cp));
                } else {
                    let v = cp - 0x10000;
                    let hi = 0xD800 + (v >> 10);
                    let lo = 0xDC00 + (v & 0x3FF);
                    out.push_str(&format!("\\u{:04x}\\u{:04x}", hi, lo));
                }
            }
        }
    }
    out.push('"');
}
