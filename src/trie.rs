//! A Merkle-Patricia trie over a byte key-value store.
//!
//! Keys are hashed to a fixed-width path of 4-bit nibbles; nodes are
//! marshalled and stored under the SHA-256 hash of their encoding, so the
//! 32-byte root digest authenticates the whole map. The trie never deletes
//! on `put`: superseded nodes are recorded as garbage and reclaimed per
//! commit by the store, according to its retention policy.

use crate::crypto::sha256;
use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};

pub trait KeyValueStore {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>>;
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> ChainResult<()>;
    fn remove(&mut self, key: &[u8]) -> ChainResult<()>;
}

const TAG_LEAF: u8 = 0;
const TAG_EXTENSION: u8 = 1;
const TAG_BRANCH: u8 = 2;

#[derive(Clone, Debug, PartialEq)]
enum TrieNode {
    Leaf {
        suffix: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        prefix: Vec<u8>,
        child: [u8; 32],
    },
    Branch {
        children: [Option<[u8; 32]>; 16],
        value: Option<Vec<u8>>,
    },
}

fn write_nibbles(nibbles: &[u8], ctx: &mut MarshallingContext) {
    ctx.write_compact_u32(nibbles.len() as u32);
    let mut iter = nibbles.iter();
    while let Some(high) = iter.next() {
        match iter.next() {
            Some(low) => ctx.write_u8((high << 4) | (low & 0x0f)),
            None => ctx.write_u8(high << 4),
        }
    }
}

fn read_nibbles(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<u8>> {
    let count = ctx.read_compact_u32()? as usize;
    let packed = ctx.read_exact(count / 2 + count % 2)?;
    let mut nibbles = Vec::with_capacity(count);
    for byte in packed {
        if nibbles.len() < count {
            nibbles.push(byte >> 4);
        }
        if nibbles.len() < count {
            nibbles.push(byte & 0x0f);
        }
    }
    Ok(nibbles)
}

impl Marshallable for TrieNode {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        match self {
            TrieNode::Leaf { suffix, value } => {
                ctx.write_u8(TAG_LEAF);
                write_nibbles(suffix, ctx);
                ctx.write_byte_array(value);
            }
            TrieNode::Extension { prefix, child } => {
                ctx.write_u8(TAG_EXTENSION);
                write_nibbles(prefix, ctx);
                ctx.write_bytes(child);
            }
            TrieNode::Branch { children, value } => {
                ctx.write_u8(TAG_BRANCH);
                let mut bitmap: u16 = 0;
                for (slot, child) in children.iter().enumerate() {
                    if child.is_some() {
                        bitmap |= 1 << slot;
                    }
                }
                ctx.write_u16(bitmap);
                for child in children.iter().flatten() {
                    ctx.write_bytes(child);
                }
                match value {
                    None => ctx.write_bool(false),
                    Some(value) => {
                        ctx.write_bool(true);
                        ctx.write_byte_array(value);
                    }
                }
            }
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        match ctx.read_u8()? {
            TAG_LEAF => Ok(TrieNode::Leaf {
                suffix: read_nibbles(ctx)?,
                value: ctx.read_byte_array()?,
            }),
            TAG_EXTENSION => {
                let prefix = read_nibbles(ctx)?;
                let child: [u8; 32] = ctx.read_exact(32)?.as_slice().try_into().expect("sized read");
                Ok(TrieNode::Extension { prefix, child })
            }
            TAG_BRANCH => {
                let bitmap = ctx.read_u16()?;
                let mut children: [Option<[u8; 32]>; 16] = [None; 16];
                for (slot, child) in children.iter_mut().enumerate() {
                    if bitmap & (1 << slot) != 0 {
                        *child = Some(ctx.read_exact(32)?.as_slice().try_into().expect("sized read"));
                    }
                }
                let value = if ctx.read_bool()? {
                    Some(ctx.read_byte_array()?)
                } else {
                    None
                };
                Ok(TrieNode::Branch { children, value })
            }
            other => Err(ChainError::marshalling(format!("unknown trie node tag {other}"))),
        }
    }
}

fn nibbles_of(hash: [u8; 32]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(64);
    for byte in hash {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A Merkle-Patricia trie view over a key-value store, positioned at a
/// given root (or empty).
pub struct PatriciaTrie<S: KeyValueStore> {
    store: S,
    root: Option<[u8; 32]>,
    garbage: Vec<[u8; 32]>,
}

impl<S: KeyValueStore> PatriciaTrie<S> {
    pub fn new(store: S, root: Option<[u8; 32]>) -> Self {
        Self {
            store,
            root,
            garbage: Vec::new(),
        }
    }

    /// The root digest authenticating the current content, or none if empty.
    pub fn root(&self) -> Option<[u8; 32]> {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Hashes of the nodes superseded since the last call; the store
    /// records them under the current commit for later garbage collection.
    pub fn take_garbage(&mut self) -> Vec<[u8; 32]> {
        std::mem::take(&mut self.garbage)
    }

    fn load(&self, hash: &[u8; 32]) -> ChainResult<TrieNode> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or_else(|| ChainError::Marshalling(format!("missing trie node {}", hex::encode(hash))))?;
        TrieNode::from_bytes(&bytes)
    }

    fn write_node(&mut self, node: &TrieNode) -> ChainResult<[u8; 32]> {
        let bytes = node.to_bytes();
        let hash = sha256(&bytes);
        self.store.put(hash.to_vec(), bytes)?;
        // a node superseded earlier in this commit may be re-created by a
        // later put; it is live again and must not be collected
        self.garbage.retain(|garbage| garbage != &hash);
        Ok(hash)
    }

    pub fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let nibbles = nibbles_of(sha256(key));
        self.get_at(&root, &nibbles)
    }

    fn get_at(&self, hash: &[u8; 32], nibbles: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        match self.load(hash)? {
            TrieNode::Leaf { suffix, value } => Ok((suffix == nibbles).then_some(value)),
            TrieNode::Extension { prefix, child } => {
                if nibbles.len() >= prefix.len() && nibbles[..prefix.len()] == prefix[..] {
                    self.get_at(&child, &nibbles[prefix.len()..])
                } else {
                    Ok(None)
                }
            }
            TrieNode::Branch { children, value } => match nibbles.split_first() {
                None => Ok(value),
                Some((slot, rest)) => match children[*slot as usize] {
                    Some(child) => self.get_at(&child, rest),
                    None => Ok(None),
                },
            },
        }
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> ChainResult<()> {
        // rewriting an unchanged binding would register the live path as
        // garbage, since the rewritten nodes hash to themselves
        if self.get(key)?.as_deref() == Some(value.as_slice()) {
            return Ok(());
        }
        let nibbles = nibbles_of(sha256(key));
        let new_root = match self.root {
            None => self.write_node(&TrieNode::Leaf {
                suffix: nibbles,
                value,
            })?,
            Some(root) => self.insert(&root, &nibbles, value)?,
        };
        self.root = Some(new_root);
        Ok(())
    }

    fn insert(&mut self, hash: &[u8; 32], nibbles: &[u8], value: Vec<u8>) -> ChainResult<[u8; 32]> {
        let node = self.load(hash)?;
        // every node along the path is rewritten, so the old one is garbage
        self.garbage.push(*hash);

        match node {
            TrieNode::Leaf {
                suffix,
                value: old_value,
            } => {
                if suffix == nibbles {
                    return self.write_node(&TrieNode::Leaf {
                        suffix,
                        value,
                    });
                }
                let common = common_prefix_len(&suffix, nibbles);
                // keys have a fixed width, so both paths continue past the
                // shared prefix
                let mut children: [Option<[u8; 32]>; 16] = [None; 16];
                let old_rest = &suffix[common..];
                let new_rest = &nibbles[common..];
                children[old_rest[0] as usize] = Some(self.write_node(&TrieNode::Leaf {
                    suffix: old_rest[1..].to_vec(),
                    value: old_value,
                })?);
                children[new_rest[0] as usize] = Some(self.write_node(&TrieNode::Leaf {
                    suffix: new_rest[1..].to_vec(),
                    value,
                })?);
                let branch = self.write_node(&TrieNode::Branch {
                    children,
                    value: None,
                })?;
                if common == 0 {
                    Ok(branch)
                } else {
                    self.write_node(&TrieNode::Extension {
                        prefix: nibbles[..common].to_vec(),
                        child: branch,
                    })
                }
            }
            TrieNode::Extension { prefix, child } => {
                let common = common_prefix_len(&prefix, nibbles);
                if common == prefix.len() {
                    let new_child = self.insert(&child, &nibbles[common..], value)?;
                    return self.write_node(&TrieNode::Extension {
                        prefix,
                        child: new_child,
                    });
                }
                let mut children: [Option<[u8; 32]>; 16] = [None; 16];
                let ext_rest = &prefix[common..];
                let key_rest = &nibbles[common..];
                let sub = if ext_rest.len() == 1 {
                    child
                } else {
                    self.write_node(&TrieNode::Extension {
                        prefix: ext_rest[1..].to_vec(),
                        child,
                    })?
                };
                children[ext_rest[0] as usize] = Some(sub);
                children[key_rest[0] as usize] = Some(self.write_node(&TrieNode::Leaf {
                    suffix: key_rest[1..].to_vec(),
                    value,
                })?);
                let branch = self.write_node(&TrieNode::Branch {
                    children,
                    value: None,
                })?;
                if common == 0 {
                    Ok(branch)
                } else {
                    self.write_node(&TrieNode::Extension {
                        prefix: nibbles[..common].to_vec(),
                        child: branch,
                    })
                }
            }
            TrieNode::Branch {
                mut children,
                value: branch_value,
            } => match nibbles.split_first() {
                None => self.write_node(&TrieNode::Branch {
                    children,
                    value: Some(value),
                }),
                Some((slot, rest)) => {
                    let new_child = match children[*slot as usize] {
                        Some(child) => self.insert(&child, rest, value)?,
                        None => self.write_node(&TrieNode::Leaf {
                            suffix: rest.to_vec(),
                            value,
                        })?,
                    };
                    children[*slot as usize] = Some(new_child);
                    self.write_node(&TrieNode::Branch {
                        children,
                        value: branch_value,
                    })
                }
            },
        }
    }
}
