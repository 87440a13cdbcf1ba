//! Binary Merkle tree over per-substep leaf hashes.
//!
//! Pairs are combined as `sha256(left_hex || right_hex)`. An odd level pairs its last hash
//! with itself. Leaves keep workflow order and are never sorted.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub substep_id: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MerkleTree {
    pub leaves: Vec<MerkleLeaf>,
    /// Bottom (leaf hashes) to top (root alone).
    pub levels: Vec<Vec<String>>,
    pub root: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub hash: String,
    /// Where the sibling sits relative to the running hash.
    pub side: Side,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub substep_id: String,
    pub leaf_hash: String,
    pub path: Vec<ProofNode>,
}

pub fn hash_pair(left: &str, right: &str) -> String {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    sha256::digest(joined)
}

pub fn build_merkle_tree(leaves: Vec<MerkleLeaf>) -> MerkleTree {
    if leaves.is_empty() {
        return MerkleTree::default();
    }

    let mut levels = vec![leaves.iter().map(|l| l.hash.clone()).collect::<Vec<_>>()];
    while let Some(level) = levels.last().filter(|l| l.len() > 1) {
        let next = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
        levels.push(next);
    }

    let root = levels.last().and_then(|top| top.first().cloned());
    MerkleTree {
        leaves,
        levels,
        root,
    }
}

impl MerkleTree {
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn proof(&self, substep_id: &str) -> Option<MerkleProof> {
        let mut index = self.leaves.iter().position(|l| l.substep_id == substep_id)?;
        let leaf_hash = self.leaves[index].hash.clone();

        let mut path = Vec::new();
        for level in self.levels.iter().take(self.levels.len().saturating_sub(1)) {
            let node = if index % 2 == 0 {
                // last odd hash is its own right sibling
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofNode {
                    hash: sibling.clone(),
                    side: Side::Right,
                }
            } else {
                ProofNode {
                    hash: level[index - 1].clone(),
                    side: Side::Left,
                }
            };
            path.push(node);
            index /= 2;
        }

        Some(MerkleProof {
            substep_id: substep_id.to_string(),
            leaf_hash,
            path,
        })
    }
}

impl MerkleProof {
    pub fn compute_root(&self) -> String {
        self.path.iter().fold(self.leaf_hash.clone(), |acc, node| match node.side {
            Side::Left => hash_pair(&node.hash, &acc),
            Side::Right => hash_pair(&acc, &node.hash),
        })
    }

    pub fn verify(&self, root: &str) -> bool {
        self.compute_root() == root
    }
}
