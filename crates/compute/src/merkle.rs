//! Binary Merkle tree over chunk-result hashes.
//!
//! Leaves and branches are domain-separated; an odd node is paired with
//! itself. Proofs are sibling paths checked against the root.

use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const BRANCH_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

fn branch_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([BRANCH_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// One sibling step: the hash and whether it sits on the right.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash32,
    pub sibling_is_right: bool,
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    /// Builds from leaf hashes. Empty input yields a zero root.
    pub fn from_leaves(leaves: Vec<Hash32>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().map_or(false, |l| l.len() > 1) {
            let prev = levels.last().expect("at least one level");
            let mut next = Vec::with_capacity((prev.len() + 1) / 2);
            for pair in prev.chunks(2) {
                let left = pair[0];
                let right = *pair.get(1).unwrap_or(&pair[0]);
                next.push(branch_hash(&left, &right));
            }
            levels.push(next);
        }
        MerkleTree { levels }
    }

    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self::from_leaves(chunks.into_iter().map(leaf_hash).collect())
    }

    pub fn root(&self) -> Hash32 {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Sibling path for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling_idx = idx ^ 1;
            let sibling = *level.get(sibling_idx).unwrap_or(&level[idx]);
            steps.push(ProofStep {
                sibling,
                sibling_is_right: sibling_idx > idx,
            });
            idx /= 2;
        }
        Some(steps)
    }
}

/// Replays a proof from `leaf` and compares against `root`.
pub fn verify_proof(leaf: Hash32, proof: &[ProofStep], root: Hash32) -> bool {
    let mut current = leaf;
    for step in proof {
        current = if step.sibling_is_right {
            branch_hash(&current, &step.sibling)
        } else {
            branch_hash(&step.sibling, &current)
        };
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proofs_verify_for_every_leaf() {
        let chunks: Vec<&[u8]> = vec![b"alpha", b"beta", b"gamma", b"delta", b"epsilon"];
        let tree = MerkleTree::from_chunks(chunks.iter().copied());
        let root = tree.root();

        for (i, chunk) in chunks.iter().enumerate() {
            let proof = tree.proof(i).expect("proof exists");
            assert!(verify_proof(leaf_hash(chunk), &proof, root), "leaf {i}");
        }
    }

    #[test]
    fn tampered_leaf_fails() {
        let tree = MerkleTree::from_chunks([b"a".as_slice(), b"b", b"c"]);
        let proof = tree.proof(1).unwrap();
        assert!(!verify_proof(leaf_hash(b"tampered"), &proof, tree.root()));
    }

    #[test]
    fn single_leaf_root_is_leaf() {
        let tree = MerkleTree::from_chunks([b"only".as_slice()]);
        assert_eq!(tree.root(), leaf_hash(b"only"));
        assert!(verify_proof(leaf_hash(b"only"), &tree.proof(0).unwrap(), tree.root()));
    }

    #[test]
    fn out_of_range_proof_is_none() {
        let tree = MerkleTree::from_chunks([b"a".as_slice(), b"b"]);
        assert!(tree.proof(2).is_none());
    }

    #[test]
    fn roots_differ_on_content() {
        let t1 = MerkleTree::from_chunks([b"a".as_slice(), b"b"]);
        let t2 = MerkleTree::from_chunks([b"a".as_slice(), b"c"]);
        assert_ne!(t1.root(), t2.root());
    }
}
