//! BLAKE3 Merkle tree over ledger entry hashes
//!
//! A level with an odd node count pairs its last node with itself. A tree
//! of one leaf has that leaf as its root.

use serde::{Deserialize, Serialize};

/// BLAKE3 output size
pub const HASH_SIZE: usize = 32;

type Node = [u8; HASH_SIZE];

/// Which side a proof sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step from a node towards the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: Side,
    pub sibling: Node,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    /// Steps ordered leaf to root
    pub path: Vec<ProofStep>,
    pub root: Node,
}

impl MerkleProof {
    /// True when folding `leaf_hash` along the path reproduces the root
    pub fn verify(&self, leaf_hash: &Node) -> bool {
        let folded = self.path.iter().fold(*leaf_hash, |acc, step| match step.side {
            Side::Left => hash_pair(&step.sibling, &acc),
            Side::Right => hash_pair(&acc, &step.sibling),
        });
        folded == self.root
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }
}

/// Immutable tree built from a leaf list
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves, the last level holds the root
    levels: Vec<Vec<Node>>,
}

impl MerkleTree {
    pub fn build(leaves: Vec<Node>) -> Self {
        if leaves.is_empty() {
            return Self::default();
        }
        let mut levels = vec![leaves];
        while let Some(top) = levels.last().filter(|level| level.len() > 1) {
            let parent = parent_level(top);
            levels.push(parent);
        }
        Self { levels }
    }

    pub fn root(&self) -> Option<Node> {
        self.levels.last().and_then(|top| top.first()).copied()
    }

    pub fn len(&self) -> u64 {
        self.levels.first().map_or(0, |leaves| leaves.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Proof for the leaf at `index`, or `None` when out of range
    pub fn proof(&self, index: u64) -> Option<MerkleProof> {
        let root = self.root()?;
        if index >= self.len() {
            return None;
        }

        let mut position = index as usize;
        let mut path = Vec::new();
        for level in self.levels.iter().take(self.levels.len() - 1) {
            let step = if position % 2 == 1 {
                ProofStep {
                    side: Side::Left,
                    sibling: level[position - 1],
                }
            } else {
                ProofStep {
                    side: Side::Right,
                    sibling: *level.get(position + 1).unwrap_or(&level[position]),
                }
            };
            path.push(step);
            position /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            path,
            root,
        })
    }
}

fn parent_level(children: &[Node]) -> Vec<Node> {
    children
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_pair(left, right)
        })
        .collect()
}

/// Parent of two nodes: `BLAKE3(left ‖ right)`
pub fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Leaf hash for arbitrary bytes
pub fn hash_leaf(data: &[u8]) -> Node {
    *blake3::hash(data).as_bytes()
}
