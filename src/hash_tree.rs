//! The Merkle hash tree embedded in certificates.
//!
//! A certificate carries a possibly-pruned view of a subnet's state tree.
//! [`HashTree::digest`] recomputes the root hash from that view;
//! [`HashTree::lookup_path`] resolves a path to a leaf value, carefully
//! distinguishing *proven absence* from *pruned-away* information.

use crate::{hash_with_domain, Hash};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes};
use std::fmt;

/// A tagged-variant Merkle tree. Labels are ordered byte strings.
#[derive(Clone, PartialEq, Eq)]
pub enum HashTree {
    Empty,
    Fork(Box<HashTree>, Box<HashTree>),
    Labeled(Vec<u8>, Box<HashTree>),
    Leaf(Vec<u8>),
    Pruned(Hash),
}

pub fn empty() -> HashTree {
    HashTree::Empty
}

pub fn fork(left: HashTree, right: HashTree) -> HashTree {
    HashTree::Fork(Box::new(left), Box::new(right))
}

pub fn labeled(label: impl Into<Vec<u8>>, subtree: HashTree) -> HashTree {
    HashTree::Labeled(label.into(), Box::new(subtree))
}

pub fn leaf(value: impl Into<Vec<u8>>) -> HashTree {
    HashTree::Leaf(value.into())
}

pub fn pruned(hash: Hash) -> HashTree {
    HashTree::Pruned(hash)
}

/// Result of looking up a path expecting a leaf value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult<'a> {
    /// The tree proves the path does not exist.
    Absent,
    /// The path may or may not exist; the relevant subtree was pruned.
    Unknown,
    Found(&'a [u8]),
    /// The path is inconsistent with the tree shape (e.g. descends into a
    /// leaf).
    Error,
}

/// Result of looking up a path expecting a subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtreeLookupResult<'a> {
    Absent,
    Unknown,
    Found(&'a HashTree),
    Error,
}

enum SearchResult<'a> {
    Found(&'a HashTree),
    Absent,
    Unknown,
}

impl HashTree {
    /// Recomputes the root hash of this (possibly pruned) tree.
    pub fn digest(&self) -> Hash {
        match self {
            HashTree::Empty => hash_with_domain(b"ic-hashtree-empty", b""),
            HashTree::Fork(left, right) => {
                let mut concat = Vec::with_capacity(64);
                concat.extend_from_slice(&left.digest());
                concat.extend_from_slice(&right.digest());
                hash_with_domain(b"ic-hashtree-fork", &concat)
            }
            HashTree::Labeled(label, subtree) => {
                let mut concat = Vec::with_capacity(label.len() + 32);
                concat.extend_from_slice(label);
                concat.extend_from_slice(&subtree.digest());
                hash_with_domain(b"ic-hashtree-labeled", &concat)
            }
            HashTree::Leaf(value) => hash_with_domain(b"ic-hashtree-leaf", value),
            HashTree::Pruned(hash) => *hash,
        }
    }

    /// Lists the children of this node with forks flattened away, in label
    /// order. `Empty` contributes nothing.
    pub fn flatten_forks(&self) -> Vec<&HashTree> {
        match self {
            HashTree::Empty => vec![],
            HashTree::Fork(left, right) => {
                let mut out = left.flatten_forks();
                out.extend(right.flatten_forks());
                out
            }
            other => vec![other],
        }
    }

    /// Resolves `path` to a leaf value.
    pub fn lookup_path<P: AsRef<[u8]>>(&self, path: &[P]) -> LookupResult<'_> {
        match path.split_first() {
            None => match self {
                HashTree::Leaf(value) => LookupResult::Found(value),
                HashTree::Empty => LookupResult::Absent,
                HashTree::Pruned(_) => LookupResult::Unknown,
                // Asked for a concrete value, found structure.
                HashTree::Fork(..) | HashTree::Labeled(..) => LookupResult::Error,
            },
            Some((segment, rest)) => match self {
                HashTree::Leaf(_) => LookupResult::Error,
                tree => match find_label(segment.as_ref(), &tree.flatten_forks()) {
                    SearchResult::Found(subtree) => subtree.lookup_path(rest),
                    SearchResult::Absent => LookupResult::Absent,
                    SearchResult::Unknown => LookupResult::Unknown,
                },
            },
        }
    }

    /// Resolves `path` to the subtree rooted under its final label.
    pub fn lookup_subtree<P: AsRef<[u8]>>(&self, path: &[P]) -> SubtreeLookupResult<'_> {
        match path.split_first() {
            None => SubtreeLookupResult::Found(self),
            Some((segment, rest)) => match self {
                HashTree::Leaf(_) => SubtreeLookupResult::Error,
                tree => match find_label(segment.as_ref(), &tree.flatten_forks()) {
                    SearchResult::Found(subtree) => subtree.lookup_subtree(rest),
                    SearchResult::Absent => SubtreeLookupResult::Absent,
                    SearchResult::Unknown => SubtreeLookupResult::Unknown,
                },
            },
        }
    }
}

/// Searches for `label` among the flattened children of a node.
///
/// Children are in ascending label order; pruned subtrees are opaque gaps.
/// Absence is only reported when the visible labels around the would-be
/// position of `label` prove it cannot be hidden in a gap.
fn find_label<'a>(label: &[u8], children: &[&'a HashTree]) -> SearchResult<'a> {
    let mut opaque_gap = false;
    for child in children {
        match child {
            HashTree::Labeled(l, subtree) => {
                if l.as_slice() == label {
                    return SearchResult::Found(subtree);
                }
                if l.as_slice() > label {
                    // Everything to the left is smaller; the target could
                    // only hide in an opaque gap we already passed.
                    return if opaque_gap {
                        SearchResult::Unknown
                    } else {
                        SearchResult::Absent
                    };
                }
                // A visible label smaller than the target closes any gap
                // seen so far.
                opaque_gap = false;
            }
            _ => opaque_gap = true,
        }
    }
    if opaque_gap {
        SearchResult::Unknown
    } else {
        SearchResult::Absent
    }
}

impl fmt::Debug for HashTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashTree::Empty => write!(f, "Empty"),
            HashTree::Fork(l, r) => f.debug_tuple("Fork").field(l).field(r).finish(),
            HashTree::Labeled(label, t) => f
                .debug_tuple("Labeled")
                .field(&format_args!("{}", display_label(label)))
                .field(t)
                .finish(),
            HashTree::Leaf(v) => write!(f, "Leaf(0x{})", hex::encode(v)),
            HashTree::Pruned(h) => write!(f, "Pruned(0x{})", hex::encode(h)),
        }
    }
}

/// Renders a label as text when it is printable ASCII, hex otherwise.
pub(crate) fn display_label(label: &[u8]) -> String {
    if !label.is_empty() && label.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(label).into_owned()
    } else {
        format!("0x{}", hex::encode(label))
    }
}

// The wire form is a CBOR array tagged by variant:
// [0] | [1, left, right] | [2, label, subtree] | [3, value] | [4, hash].

impl Serialize for HashTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            HashTree::Empty => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&0u8)?;
                seq.end()
            }
            HashTree::Fork(left, right) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&1u8)?;
                seq.serialize_element(left)?;
                seq.serialize_element(right)?;
                seq.end()
            }
            HashTree::Labeled(label, subtree) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&2u8)?;
                seq.serialize_element(Bytes::new(label))?;
                seq.serialize_element(subtree)?;
                seq.end()
            }
            HashTree::Leaf(value) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&3u8)?;
                seq.serialize_element(Bytes::new(value))?;
                seq.end()
            }
            HashTree::Pruned(hash) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&4u8)?;
                seq.serialize_element(Bytes::new(hash))?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for HashTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TreeVisitor;

        impl<'de> Visitor<'de> for TreeVisitor {
            type Value = HashTree;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hash tree variant array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<HashTree, A::Error> {
                let tag: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match tag {
                    0 => Ok(HashTree::Empty),
                    1 => {
                        let left: HashTree = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let right: HashTree = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(fork(left, right))
                    }
                    2 => {
                        let label: ByteBuf = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let subtree: HashTree = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(labeled(label.into_vec(), subtree))
                    }
                    3 => {
                        let value: ByteBuf = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(HashTree::Leaf(value.into_vec()))
                    }
                    4 => {
                        let hash: ByteBuf = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let hash: Hash = hash.as_slice().try_into().map_err(|_| {
                            de::Error::custom("pruned hash must be exactly 32 bytes")
                        })?;
                        Ok(HashTree::Pruned(hash))
                    }
                    other => Err(de::Error::custom(format!(
                        "unknown hash tree variant tag {other}"
                    ))),
                }
            }
        }

        deserializer.deserialize_seq(TreeVisitor)
    }
}
