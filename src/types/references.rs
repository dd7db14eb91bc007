use std::fmt;

use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};

/// The identifier of a committed transaction: the SHA-256 hash of the
/// marshalled request bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionReference {
    pub hash: [u8; 32],
}

impl TransactionReference {
    pub fn new(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes = hex::decode(data)
            .map_err(|err| ChainError::marshalling(format!("invalid reference encoding: {err}")))?;
        let hash: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::marshalling("a transaction reference has 32 bytes".to_string()))?;
        Ok(Self { hash })
    }
}

impl fmt::Display for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.hash))
    }
}

impl fmt::Debug for TransactionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.hash[..8]))
    }
}

impl Marshallable for TransactionReference {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_bytes(&self.hash);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let bytes = ctx.read_exact(32)?;
        let hash: [u8; 32] = bytes.as_slice().try_into().expect("sized read");
        Ok(Self { hash })
    }
}

/// A reference to a storage object: the transaction that created it and the
/// progressive number of the object within that transaction's allocations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageReference {
    pub transaction: TransactionReference,
    pub progressive: u32,
}

impl StorageReference {
    pub fn new(transaction: TransactionReference, progressive: u32) -> Self {
        Self {
            transaction,
            progressive,
        }
    }

    /// Marshals without the value discriminator, for use inside composite
    /// encodings (requests, histories, trie keys).
    pub fn marshal_without_selector(&self, ctx: &mut MarshallingContext) {
        self.transaction.marshal(ctx);
        ctx.write_compact_u32(self.progressive);
    }

    pub fn unmarshal_without_selector(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let transaction = TransactionReference::unmarshal(ctx)?;
        let progressive = ctx.read_compact_u32()?;
        Ok(Self {
            transaction,
            progressive,
        })
    }

    pub fn to_bytes_without_selector(&self) -> Vec<u8> {
        let mut ctx = MarshallingContext::new();
        self.marshal_without_selector(&mut ctx);
        ctx.into_bytes()
    }
}

impl fmt::Display for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction, self.progressive)
    }
}

impl fmt::Debug for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.transaction, self.progressive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_references_order_lexicographically() {
        let older = TransactionReference::new([1u8; 32]);
        let newer = TransactionReference::new([2u8; 32]);
        assert!(StorageReference::new(older, 5) < StorageReference::new(newer, 0));
        assert!(StorageReference::new(older, 0) < StorageReference::new(older, 1));
        assert_eq!(StorageReference::new(older, 3), StorageReference::new(older, 3));
    }

    #[test]
    fn reference_round_trip() {
        let reference = TransactionReference::new([9u8; 32]);
        let bytes = reference.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(TransactionReference::from_bytes(&bytes).unwrap(), reference);
    }
}
