//! Binary Merkle tree over canonical step digests.
//!
//! Leaves are the ordered `value_digest`s from canonicalization. Leaf and
//! internal hashes are domain-separated with distinct prefixes so a leaf
//! digest can never be confused with an internal node (second-preimage
//! hardening). An odd node at any level is paired with a duplicate of
//! itself; build, prove, and verify all apply the same rule.
//!
//! A single-leaf tree's root is the (tagged) leaf hash itself and its proof
//! is empty. Verification is a pure fold over the proof and never panics on
//! malformed input - it simply fails to reproduce the committed root.

use crate::canonical::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

/// Domain tag prefixed to leaf hashes.
const LEAF_TAG: u8 = 0x00;
/// Domain tag prefixed to internal-node hashes.
const INTERNAL_TAG: u8 = 0x01;

/// Which side the sibling sits on when folding a proof step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

/// One step of an inclusion proof: the sibling digest and its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub sibling_hash: Digest,
    pub position: Position,
}

/// An ordered inclusion proof, leaf to root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proof(pub Vec<ProofNode>);

impl Proof {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Hash a raw leaf digest into its tree-leaf form.
fn leaf_hash(digest: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(digest.as_bytes());
    Digest::from_bytes(hasher.finalize().into())
}

/// Hash two child nodes into their parent.
fn internal_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_TAG]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::from_bytes(hasher.finalize().into())
}

/// A built Merkle tree, retaining every level for proof generation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] is the leaf-hash level; the last level holds the root.
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a tree from the ordered leaf digests.
    ///
    /// Returns `None` for an empty leaf list - an empty plan has no
    /// commitment and is rejected upstream by the canonicalizer.
    pub fn build(leaf_digests: &[Digest]) -> Option<Self> {
        if leaf_digests.is_empty() {
            return None;
        }

        let mut levels: Vec<Vec<Digest>> = Vec::new();
        levels.push(leaf_digests.iter().map(leaf_hash).collect());

        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let current = levels.last().cloned().unwrap_or_default();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd node at this level: pair it with itself.
                let right = pair.get(1).unwrap_or(left);
                next.push(internal_hash(left, right));
            }
            levels.push(next);
        }

        Some(Self { levels })
    }

    /// The root digest.
    pub fn root(&self) -> Digest {
        // Construction guarantees a non-empty final level.
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of range.
    ///
    /// The proof lists, per level, the sibling hash and which side it sits
    /// on. Cost is O(log n).
    pub fn prove(&self, index: usize) -> Option<Proof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut nodes = Vec::new();
        let mut pos = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            // Duplicate-last padding: an odd node's sibling is itself.
            let sibling = level.get(sibling_index).unwrap_or(&level[pos]);
            let position = if pos % 2 == 0 {
                Position::Right
            } else {
                Position::Left
            };
            nodes.push(ProofNode {
                sibling_hash: *sibling,
                position,
            });
            pos /= 2;
        }

        Some(Proof(nodes))
    }
}

/// Fold a proof against a raw leaf digest and compare to the claimed root.
///
/// Returns `false` on any mismatch, including structurally bogus proofs -
/// never panics or errors. The comparison is constant-time.
pub fn verify(leaf_digest: &Digest, proof: &Proof, claimed_root: &Digest) -> bool {
    let mut current = leaf_hash(leaf_digest);
    for node in &proof.0 {
        current = match node.position {
            Position::Left => internal_hash(&node.sibling_hash, &current),
            Position::Right => internal_hash(&current, &node.sibling_hash),
        };
    }
    current.ct_eq(claimed_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::value_digest;
    use serde_json::json;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| value_digest(&json!(format!("step-{}", i))))
            .collect()
    }

    #[test]
    fn test_empty_leaves_rejected() {
        assert!(MerkleTree::build(&[]).is_none());
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let ls = leaves(1);
        let tree = MerkleTree::build(&ls).unwrap();
        assert_eq!(tree.root(), leaf_hash(&ls[0]));

        let proof = tree.prove(0).unwrap();
        assert!(proof.is_empty());
        assert!(verify(&ls[0], &proof, &tree.root()));
    }

    #[test]
    fn test_round_trip_all_sizes_and_indices() {
        for n in 1..=9 {
            let ls = leaves(n);
            let tree = MerkleTree::build(&ls).unwrap();
            for (i, leaf) in ls.iter().enumerate() {
                let proof = tree.prove(i).unwrap();
                assert!(
                    verify(leaf, &proof, &tree.root()),
                    "round trip failed for n={} i={}",
                    n,
                    i
                );
            }
        }
    }

    #[test]
    fn test_proof_length_logarithmic() {
        let ls = leaves(8);
        let tree = MerkleTree::build(&ls).unwrap();
        assert_eq!(tree.prove(0).unwrap().len(), 3);

        let ls = leaves(2);
        let tree = MerkleTree::build(&ls).unwrap();
        assert_eq!(tree.prove(1).unwrap().len(), 1);
    }

    #[test]
    fn test_prove_out_of_range() {
        let tree = MerkleTree::build(&leaves(3)).unwrap();
        assert!(tree.prove(3).is_none());
    }

    #[test]
    fn test_odd_count_duplicate_last_consistency() {
        // With 3 leaves the last leaf pairs with itself; its proof must
        // still fold to the same root the builder computed.
        let ls = leaves(3);
        let tree = MerkleTree::build(&ls).unwrap();
        let proof = tree.prove(2).unwrap();
        assert!(verify(&ls[2], &proof, &tree.root()));
    }

    #[test]
    fn test_tamper_any_leaf_changes_root() {
        let ls = leaves(4);
        let tree = MerkleTree::build(&ls).unwrap();
        let proof_for_0 = tree.prove(0).unwrap();

        for j in 0..4 {
            let mut mutated = ls.clone();
            mutated[j] = value_digest(&json!("tampered"));
            let new_tree = MerkleTree::build(&mutated).unwrap();
            assert_ne!(tree.root(), new_tree.root(), "mutating leaf {} kept root", j);
            // The original proof no longer verifies against the new root.
            assert!(!verify(&ls[0], &proof_for_0, &new_tree.root()));
        }
    }

    #[test]
    fn test_wrong_leaf_fails() {
        let ls = leaves(4);
        let tree = MerkleTree::build(&ls).unwrap();
        let proof = tree.prove(0).unwrap();
        assert!(!verify(&ls[1], &proof, &tree.root()));
    }

    #[test]
    fn test_malformed_proof_returns_false_not_panic() {
        let ls = leaves(2);
        let tree = MerkleTree::build(&ls).unwrap();

        // Truncated proof
        assert!(!verify(&ls[0], &Proof(vec![]), &tree.root()));

        // Garbage siblings, excessive length
        let garbage = Proof(
            (0..40)
                .map(|i| ProofNode {
                    sibling_hash: value_digest(&json!(i)),
                    position: Position::Left,
                })
                .collect(),
        );
        assert!(!verify(&ls[0], &garbage, &tree.root()));

        // Flipped position
        let mut proof = tree.prove(0).unwrap();
        proof.0[0].position = Position::Left;
        assert!(!verify(&ls[0], &proof, &tree.root()));
    }

    #[test]
    fn test_leaf_internal_domain_separation() {
        // H(leaf) and H(internal) over the same bytes must differ.
        let d = value_digest(&json!("x"));
        assert_ne!(leaf_hash(&d), internal_hash(&d, &d));
    }

    #[test]
    fn test_proof_serde_wire_shape() {
        let ls = leaves(2);
        let tree = MerkleTree::build(&ls).unwrap();
        let proof = tree.prove(0).unwrap();

        let json = serde_json::to_value(&proof).unwrap();
        let first = &json[0];
        assert!(first["sibling_hash"].is_string());
        assert_eq!(first["position"], "right");

        let back: Proof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }
}
