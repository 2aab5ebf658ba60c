//! Sparse merkle tree over 32-byte keys, 256 levels deep.
//!
//! Subtrees are shared behind `Rc`, so cloning a tree is cheap: the block
//! builder and the apply engine snapshot working state by cloning and throw
//! the clone away on failure. Every mutation rebuilds only the path from the
//! root to the touched leaf.

use std::rc::Rc;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::types::Hash;

const TREE_DEPTH: usize = 256;

fn hash_leaf(key: &Hash, value: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.smt.leaf");
    hasher.update(key);
    hasher.update(value);
    hasher.finalize().into()
}

fn hash_branch(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veil.smt.branch");
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn key_bit(key: &Hash, depth: usize) -> u8 {
    (key[depth / 8] >> (7 - depth % 8)) & 1
}

/// Digest ladder for fully-empty subtrees, one entry per level.
fn defaults() -> &'static [Hash; TREE_DEPTH + 1] {
    static DEFAULTS: OnceLock<[Hash; TREE_DEPTH + 1]> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        let mut ladder = [[0u8; 32]; TREE_DEPTH + 1];
        ladder[TREE_DEPTH] = blake3::hash(b"veil.smt.empty").into();
        for level in (0..TREE_DEPTH).rev() {
            ladder[level] = hash_branch(&ladder[level + 1], &ladder[level + 1]);
        }
        ladder
    })
}

#[derive(Clone)]
enum NodeKind {
    Empty,
    Leaf { key: Hash, value: Vec<u8> },
    Branch { left: Rc<Node>, right: Rc<Node> },
}

#[derive(Clone)]
struct Node {
    hash: Hash,
    kind: NodeKind,
}

impl Node {
    fn empty(depth: usize) -> Self {
        Node {
            hash: defaults()[depth],
            kind: NodeKind::Empty,
        }
    }

    fn leaf(key: Hash, value: Vec<u8>) -> Self {
        Node {
            hash: hash_leaf(&key, &value),
            kind: NodeKind::Leaf { key, value },
        }
    }

    fn branch(left: Rc<Node>, right: Rc<Node>) -> Self {
        Node {
            hash: hash_branch(&left.hash, &right.hash),
            kind: NodeKind::Branch { left, right },
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self.kind, NodeKind::Empty)
    }
}

/// Membership (or non-membership) proof: the sibling path from the root down
/// to the addressed slot, plus the value found there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub key: Hash,
    pub value: Option<Vec<u8>>,
    pub siblings: Vec<Hash>,
}

#[derive(Clone)]
pub struct SparseMerkleTree {
    root: Rc<Node>,
}

impl SparseMerkleTree {
    pub fn new() -> Self {
        Self {
            root: Rc::new(Node::empty(0)),
        }
    }

    /// Keys are addressed by 32-byte digests; anything else is hashed first.
    pub fn digest_key(key: &[u8]) -> Hash {
        match key.try_into() {
            Ok(exact) => exact,
            Err(_) => blake3::hash(key).into(),
        }
    }

    pub fn root(&self) -> Hash {
        self.root.hash
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let key = Self::digest_key(key);
        let mut node = self.root.as_ref();
        for depth in 0..TREE_DEPTH {
            match &node.kind {
                NodeKind::Branch { left, right } => {
                    node = if key_bit(&key, depth) == 0 { left } else { right };
                }
                _ => break,
            }
        }
        match &node.kind {
            NodeKind::Leaf {
                key: stored,
                value,
            } if *stored == key => Some(value),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        let key = Self::digest_key(key);
        self.root = Rc::new(Self::insert_at(&self.root, 0, &key, value));
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let key = Self::digest_key(key);
        let (root, removed) = Self::remove_at(&self.root, 0, &key);
        self.root = Rc::new(root);
        removed
    }

    fn insert_at(node: &Node, depth: usize, key: &Hash, value: Vec<u8>) -> Node {
        if depth == TREE_DEPTH {
            return Node::leaf(*key, value);
        }
        let (left, right) = match &node.kind {
            NodeKind::Branch { left, right } => (Rc::clone(left), Rc::clone(right)),
            NodeKind::Empty => (
                Rc::new(Node::empty(depth + 1)),
                Rc::new(Node::empty(depth + 1)),
            ),
            NodeKind::Leaf { .. } => unreachable!("leaf above the tree floor"),
        };
        if key_bit(key, depth) == 0 {
            let left = Rc::new(Self::insert_at(&left, depth + 1, key, value));
            Node::branch(left, right)
        } else {
            let right = Rc::new(Self::insert_at(&right, depth + 1, key, value));
            Node::branch(left, right)
        }
    }

    fn remove_at(node: &Node, depth: usize, key: &Hash) -> (Node, Option<Vec<u8>>) {
        match &node.kind {
            NodeKind::Empty => (Node::empty(depth), None),
            NodeKind::Leaf { key: stored, value } => {
                if stored == key {
                    (Node::empty(depth), Some(value.clone()))
                } else {
                    (node.clone(), None)
                }
            }
            NodeKind::Branch { left, right } => {
                let (new_child, removed) = if key_bit(key, depth) == 0 {
                    let (child, removed) = Self::remove_at(left, depth + 1, key);
                    (Node::branch(Rc::new(child), Rc::clone(right)), removed)
                } else {
                    let (child, removed) = Self::remove_at(right, depth + 1, key);
                    (Node::branch(Rc::clone(left), Rc::new(child)), removed)
                };
                if removed.is_some() {
                    if let NodeKind::Branch { left, right } = &new_child.kind {
                        if left.is_empty() && right.is_empty() {
                            return (Node::empty(depth), removed);
                        }
                    }
                }
                (new_child, removed)
            }
        }
    }

    pub fn prove(&self, key: &[u8]) -> MerkleProof {
        let key = Self::digest_key(key);
        let mut siblings = Vec::with_capacity(TREE_DEPTH);
        let mut node = self.root.as_ref();
        for depth in 0..TREE_DEPTH {
            match &node.kind {
                NodeKind::Branch { left, right } => {
                    if key_bit(&key, depth) == 0 {
                        siblings.push(right.hash);
                        node = left;
                    } else {
                        siblings.push(left.hash);
                        node = right;
                    }
                }
                _ => {
                    siblings.extend_from_slice(&defaults()[depth + 1..]);
                    break;
                }
            }
        }
        let value = match &node.kind {
            NodeKind::Leaf {
                key: stored,
                value,
            } if *stored == key => Some(value.clone()),
            _ => None,
        };
        MerkleProof {
            key,
            value,
            siblings,
        }
    }

    pub fn verify_proof(root: &Hash, proof: &MerkleProof) -> bool {
        if proof.siblings.len() != TREE_DEPTH {
            return false;
        }
        let mut current = match &proof.value {
            Some(value) => hash_leaf(&proof.key, value),
            None => defaults()[TREE_DEPTH],
        };
        for (idx, sibling) in proof.siblings.iter().rev().enumerate() {
            let depth = TREE_DEPTH - 1 - idx;
            current = if key_bit(&proof.key, depth) == 0 {
                hash_branch(&current, sibling)
            } else {
                hash_branch(sibling, &current)
            };
        }
        current == *root
    }
}

impl Default for SparseMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Vec<u8> {
        vec![byte; 32]
    }

    #[test]
    fn roots_return_after_reverse_removal() {
        let mut tree = SparseMerkleTree::new();
        let empty = tree.root();
        let mut roots = vec![empty];
        for i in 0..6u8 {
            tree.insert(&key(i), vec![i]);
            roots.push(tree.root());
        }
        for i in (0..6u8).rev() {
            assert_eq!(tree.root(), roots[i as usize + 1]);
            assert_eq!(tree.remove(&key(i)), Some(vec![i]));
        }
        assert_eq!(tree.root(), empty);
        assert!(tree.is_empty());
    }

    #[test]
    fn root_is_order_independent() {
        let mut a = SparseMerkleTree::new();
        let mut b = SparseMerkleTree::new();
        for i in 0..8u8 {
            a.insert(&key(i), vec![i]);
        }
        for i in (0..8u8).rev() {
            b.insert(&key(i), vec![i]);
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn get_and_update() {
        let mut tree = SparseMerkleTree::new();
        assert_eq!(tree.get(&key(1)), None);
        tree.insert(&key(1), vec![1]);
        tree.insert(&key(2), vec![2]);
        assert_eq!(tree.get(&key(1)), Some(&[1u8][..]));
        let before = tree.root();
        tree.insert(&key(1), vec![9]);
        assert_eq!(tree.get(&key(1)), Some(&[9u8][..]));
        assert_ne!(tree.root(), before);
        assert_eq!(tree.remove(&key(3)), None);
    }

    #[test]
    fn snapshots_are_independent() {
        let mut tree = SparseMerkleTree::new();
        tree.insert(&key(1), vec![1]);
        let snapshot = tree.clone();
        tree.insert(&key(2), vec![2]);
        tree.remove(&key(1));
        assert_eq!(snapshot.get(&key(1)), Some(&[1u8][..]));
        assert_eq!(snapshot.get(&key(2)), None);
    }

    #[test]
    fn proofs_verify_membership_and_absence() {
        let mut tree = SparseMerkleTree::new();
        for i in 0..4u8 {
            tree.insert(&key(i), vec![i]);
        }
        let root = tree.root();

        let present = tree.prove(&key(2));
        assert_eq!(present.value, Some(vec![2]));
        assert!(SparseMerkleTree::verify_proof(&root, &present));

        let absent = tree.prove(&key(9));
        assert_eq!(absent.value, None);
        assert!(SparseMerkleTree::verify_proof(&root, &absent));

        let mut tampered = present.clone();
        tampered.value = Some(vec![3]);
        assert!(!SparseMerkleTree::verify_proof(&root, &tampered));
    }

    #[test]
    fn long_keys_are_digested() {
        let mut tree = SparseMerkleTree::new();
        let long_key = vec![7u8; 40];
        tree.insert(&long_key, vec![1]);
        assert_eq!(tree.get(&long_key), Some(&[1u8][..]));
        assert_eq!(tree.remove(&long_key), Some(vec![1]));
        assert!(tree.is_empty());
    }
}
