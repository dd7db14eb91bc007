use num_bigint::BigInt;

use crate::crypto::{sha256, SignatureScheme};
use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::signatures::{ConstructorSignature, MethodSignature};
use crate::types::storage_types::StorageType;
use crate::types::values::StorageValue;

const SELECTOR_INITIAL_JAR_STORE: u8 = 1;
const SELECTOR_GAMETE_CREATION: u8 = 2;
const SELECTOR_JAR_STORE: u8 = 3;
const SELECTOR_CONSTRUCTOR_CALL: u8 = 4;
const SELECTOR_INSTANCE_METHOD_CALL: u8 = 5;
const SELECTOR_STATIC_METHOD_CALL: u8 = 6;
const SELECTOR_TRANSFER_INT: u8 = 7;
const SELECTOR_TRANSFER_LONG: u8 = 8;
const SELECTOR_TRANSFER_BIG_INTEGER: u8 = 9;
const SELECTOR_INITIALIZATION: u8 = 10;

/// The fixed gas limit of the compact coin-transfer requests.
pub fn transfer_gas_limit() -> BigInt {
    BigInt::from(10_000u32)
}

/// The common header of every non-initial request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestHeader {
    /// The externally owned account that pays for the transaction.
    pub caller: StorageReference,
    /// Forbids replay: must equal the caller's current nonce.
    pub nonce: BigInt,
    /// Forbids replay across chains.
    pub chain_id: String,
    pub gas_limit: BigInt,
    pub gas_price: BigInt,
    /// The module installation under which the request executes.
    pub classpath: TransactionReference,
}

impl RequestHeader {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        self.caller.marshal_without_selector(ctx);
        ctx.write_big_integer(&self.gas_limit);
        ctx.write_big_integer(&self.gas_price);
        self.classpath.marshal(ctx);
        ctx.write_big_integer(&self.nonce);
        ctx.write_utf(&self.chain_id);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let caller = StorageReference::unmarshal_without_selector(ctx)?;
        let gas_limit = ctx.read_big_integer()?;
        let gas_price = ctx.read_big_integer()?;
        let classpath = TransactionReference::unmarshal(ctx)?;
        let nonce = ctx.read_big_integer()?;
        let chain_id = ctx.read_utf()?;
        Ok(Self {
            caller,
            nonce,
            chain_id,
            gas_limit,
            gas_price,
            classpath,
        })
    }
}

/// Installs a module before the node is initialized; used for the base
/// module. Consumes no gas and requires no signature.
#[derive(Clone, Debug, PartialEq)]
pub struct InitialJarStoreTransactionRequest {
    pub jar: Vec<u8>,
    pub dependencies: Vec<TransactionReference>,
}

/// Creates the distinguished initial account holding the initial supplies.
#[derive(Clone, Debug, PartialEq)]
pub struct GameteCreationTransactionRequest {
    pub classpath: TransactionReference,
    pub initial_amount: BigInt,
    pub red_initial_amount: BigInt,
    /// Base64-encoded public key of the gamete.
    pub public_key: String,
}

/// Marks the node as initialized and records the manifest; after this, no
/// initial transaction is accepted anymore.
#[derive(Clone, Debug, PartialEq)]
pub struct InitializationTransactionRequest {
    pub classpath: TransactionReference,
    pub manifest: StorageReference,
}

/// Installs a module, paying gas.
#[derive(Clone, Debug, PartialEq)]
pub struct JarStoreTransactionRequest {
    pub header: RequestHeader,
    pub jar: Vec<u8>,
    pub dependencies: Vec<TransactionReference>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstructorCallTransactionRequest {
    pub header: RequestHeader,
    pub constructor: ConstructorSignature,
    pub actuals: Vec<StorageValue>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceMethodCallTransactionRequest {
    pub header: RequestHeader,
    pub method: MethodSignature,
    pub receiver: StorageReference,
    pub actuals: Vec<StorageValue>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StaticMethodCallTransactionRequest {
    pub header: RequestHeader,
    pub method: MethodSignature,
    pub actuals: Vec<StorageValue>,
    pub signature: Vec<u8>,
}

/// Compact form of an instance call to the `receive` method of a payable
/// contract: the target method is implicit and the gas limit is fixed, so
/// neither is marshalled.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferTransactionRequest {
    pub header: RequestHeader,
    pub receiver: StorageReference,
    /// The transferred amount: an int, long or big-integer value.
    pub amount: StorageValue,
    pub signature: Vec<u8>,
}

impl TransferTransactionRequest {
    pub fn new(
        caller: StorageReference,
        nonce: BigInt,
        chain_id: String,
        gas_price: BigInt,
        classpath: TransactionReference,
        receiver: StorageReference,
        amount: StorageValue,
    ) -> ChainResult<Self> {
        match amount {
            StorageValue::Int(_) | StorageValue::Long(_) | StorageValue::BigInteger(_) => Ok(Self {
                header: RequestHeader {
                    caller,
                    nonce,
                    chain_id,
                    gas_limit: transfer_gas_limit(),
                    gas_price,
                    classpath,
                },
                receiver,
                amount,
                signature: Vec::new(),
            }),
            _ => Err(ChainError::rejected("a transfer moves an int, long or big integer amount")),
        }
    }

    /// The `receive` method this compact request stands for.
    pub fn equivalent_method(&self) -> MethodSignature {
        let amount_type = match self.amount {
            StorageValue::Int(_) => StorageType::Int,
            StorageValue::Long(_) => StorageType::Long,
            _ => StorageType::big_integer(),
        };
        crate::base_library::receive_signature(amount_type)
    }

    fn selector(&self) -> u8 {
        match self.amount {
            StorageValue::Int(_) => SELECTOR_TRANSFER_INT,
            StorageValue::Long(_) => SELECTOR_TRANSFER_LONG,
            _ => SELECTOR_TRANSFER_BIG_INTEGER,
        }
    }
}

/// A request for a transaction of any kind.
#[derive(Clone, Debug, PartialEq)]
pub enum TransactionRequest {
    InitialJarStore(InitialJarStoreTransactionRequest),
    GameteCreation(GameteCreationTransactionRequest),
    Initialization(InitializationTransactionRequest),
    JarStore(JarStoreTransactionRequest),
    ConstructorCall(ConstructorCallTransactionRequest),
    InstanceMethodCall(InstanceMethodCallTransactionRequest),
    StaticMethodCall(StaticMethodCallTransactionRequest),
    Transfer(TransferTransactionRequest),
}

impl TransactionRequest {
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            TransactionRequest::InitialJarStore(_)
                | TransactionRequest::GameteCreation(_)
                | TransactionRequest::Initialization(_)
        )
    }

    pub fn header(&self) -> Option<&RequestHeader> {
        match self {
            TransactionRequest::JarStore(r) => Some(&r.header),
            TransactionRequest::ConstructorCall(r) => Some(&r.header),
            TransactionRequest::InstanceMethodCall(r) => Some(&r.header),
            TransactionRequest::StaticMethodCall(r) => Some(&r.header),
            TransactionRequest::Transfer(r) => Some(&r.header),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&[u8]> {
        match self {
            TransactionRequest::JarStore(r) => Some(&r.signature),
            TransactionRequest::ConstructorCall(r) => Some(&r.signature),
            TransactionRequest::InstanceMethodCall(r) => Some(&r.signature),
            TransactionRequest::StaticMethodCall(r) => Some(&r.signature),
            TransactionRequest::Transfer(r) => Some(&r.signature),
            _ => None,
        }
    }

    /// The identifier this request receives once committed: the SHA-256
    /// hash of its marshalled bytes.
    pub fn reference(&self) -> TransactionReference {
        TransactionReference::new(sha256(&self.to_bytes()))
    }

    /// The bytes covered by the request signature: everything except the
    /// trailing signature itself.
    pub fn to_bytes_without_signature(&self) -> Vec<u8> {
        let mut ctx = MarshallingContext::new();
        self.marshal_core(&mut ctx);
        ctx.into_bytes()
    }

    /// Signs the request with the given scheme and keypair, replacing any
    /// previous signature.
    pub fn sign_with(&mut self, scheme: SignatureScheme, keypair: &ed25519_dalek::Keypair) {
        let message = self.to_bytes_without_signature();
        let signature = scheme.sign(keypair, &message);
        match self {
            TransactionRequest::JarStore(r) => r.signature = signature,
            TransactionRequest::ConstructorCall(r) => r.signature = signature,
            TransactionRequest::InstanceMethodCall(r) => r.signature = signature,
            TransactionRequest::StaticMethodCall(r) => r.signature = signature,
            TransactionRequest::Transfer(r) => r.signature = signature,
            _ => {}
        }
    }

    fn marshal_core(&self, ctx: &mut MarshallingContext) {
        match self {
            TransactionRequest::InitialJarStore(r) => {
                ctx.write_u8(SELECTOR_INITIAL_JAR_STORE);
                ctx.write_byte_array(&r.jar);
                ctx.write_compact_u32(r.dependencies.len() as u32);
                for dependency in &r.dependencies {
                    dependency.marshal(ctx);
                }
            }
            TransactionRequest::GameteCreation(r) => {
                ctx.write_u8(SELECTOR_GAMETE_CREATION);
                r.classpath.marshal(ctx);
                ctx.write_big_integer(&r.initial_amount);
                ctx.write_big_integer(&r.red_initial_amount);
                ctx.write_utf(&r.public_key);
            }
            TransactionRequest::Initialization(r) => {
                ctx.write_u8(SELECTOR_INITIALIZATION);
                r.classpath.marshal(ctx);
                r.manifest.marshal_without_selector(ctx);
            }
            TransactionRequest::JarStore(r) => {
                ctx.write_u8(SELECTOR_JAR_STORE);
                r.header.marshal(ctx);
                ctx.write_byte_array(&r.jar);
                ctx.write_compact_u32(r.dependencies.len() as u32);
                for dependency in &r.dependencies {
                    dependency.marshal(ctx);
                }
            }
            TransactionRequest::ConstructorCall(r) => {
                ctx.write_u8(SELECTOR_CONSTRUCTOR_CALL);
                r.header.marshal(ctx);
                r.constructor.marshal(ctx);
                ctx.write_compact_u32(r.actuals.len() as u32);
                for actual in &r.actuals {
                    actual.marshal(ctx);
                }
            }
            TransactionRequest::InstanceMethodCall(r) => {
                ctx.write_u8(SELECTOR_INSTANCE_METHOD_CALL);
                r.header.marshal(ctx);
                r.method.marshal(ctx);
                r.receiver.marshal_without_selector(ctx);
                ctx.write_compact_u32(r.actuals.len() as u32);
                for actual in &r.actuals {
                    actual.marshal(ctx);
                }
            }
            TransactionRequest::StaticMethodCall(r) => {
                ctx.write_u8(SELECTOR_STATIC_METHOD_CALL);
                r.header.marshal(ctx);
                r.method.marshal(ctx);
                ctx.write_compact_u32(r.actuals.len() as u32);
                for actual in &r.actuals {
                    actual.marshal(ctx);
                }
            }
            TransactionRequest::Transfer(r) => {
                // more compact than the equivalent instance method call:
                // the gas limit and the target method are implicit
                ctx.write_u8(r.selector());
                r.header.caller.marshal_without_selector(ctx);
                ctx.write_big_integer(&r.header.gas_price);
                r.header.classpath.marshal(ctx);
                ctx.write_big_integer(&r.header.nonce);
                ctx.write_utf(&r.header.chain_id);
                r.receiver.marshal_without_selector(ctx);
                match &r.amount {
                    StorageValue::Int(v) => ctx.write_i32(*v),
                    StorageValue::Long(v) => ctx.write_i64(*v),
                    StorageValue::BigInteger(v) => ctx.write_big_integer(v),
                    _ => unreachable!("transfer amounts are ints, longs or big integers"),
                }
            }
        }
    }
}

impl Marshallable for TransactionRequest {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        self.marshal_core(ctx);
        if let Some(signature) = self.signature() {
            ctx.write_byte_array(signature);
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        let selector = ctx.read_u8()?;
        match selector {
            SELECTOR_INITIAL_JAR_STORE => {
                let jar = ctx.read_byte_array()?;
                let count = ctx.read_compact_u32()? as usize;
                let mut dependencies = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    dependencies.push(TransactionReference::unmarshal(ctx)?);
                }
                Ok(TransactionRequest::InitialJarStore(InitialJarStoreTransactionRequest {
                    jar,
                    dependencies,
                }))
            }
            SELECTOR_GAMETE_CREATION => Ok(TransactionRequest::GameteCreation(
                GameteCreationTransactionRequest {
                    classpath: TransactionReference::unmarshal(ctx)?,
                    initial_amount: ctx.read_big_integer()?,
                    red_initial_amount: ctx.read_big_integer()?,
                    public_key: ctx.read_utf()?,
                },
            )),
            SELECTOR_INITIALIZATION => Ok(TransactionRequest::Initialization(
                InitializationTransactionRequest {
                    classpath: TransactionReference::unmarshal(ctx)?,
                    manifest: StorageReference::unmarshal_without_selector(ctx)?,
                },
            )),
            SELECTOR_JAR_STORE => {
                let header = RequestHeader::unmarshal(ctx)?;
                let jar = ctx.read_byte_array()?;
                let count = ctx.read_compact_u32()? as usize;
                let mut dependencies = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    dependencies.push(TransactionReference::unmarshal(ctx)?);
                }
                let signature = ctx.read_byte_array()?;
                Ok(TransactionRequest::JarStore(JarStoreTransactionRequest {
                    header,
                    jar,
                    dependencies,
                    signature,
                }))
            }
            SELECTOR_CONSTRUCTOR_CALL => {
                let header = RequestHeader::unmarshal(ctx)?;
                let constructor = ConstructorSignature::unmarshal(ctx)?;
                let actuals = read_values(ctx)?;
                let signature = ctx.read_byte_array()?;
                Ok(TransactionRequest::ConstructorCall(ConstructorCallTransactionRequest {
                    header,
                    constructor,
                    actuals,
                    signature,
                }))
            }
            SELECTOR_INSTANCE_METHOD_CALL => {
                let header = RequestHeader::unmarshal(ctx)?;
                let method = MethodSignature::unmarshal(ctx)?;
                let receiver = StorageReference::unmarshal_without_selector(ctx)?;
                let actuals = read_values(ctx)?;
                let signature = ctx.read_byte_array()?;
                Ok(TransactionRequest::InstanceMethodCall(
                    InstanceMethodCallTransactionRequest {
                        header,
                        method,
                        receiver,
                        actuals,
                        signature,
                    },
                ))
            }
            SELECTOR_STATIC_METHOD_CALL => {
                let header = RequestHeader::unmarshal(ctx)?;
                let method = MethodSignature::unmarshal(ctx)?;
                let actuals = read_values(ctx)?;
                let signature = ctx.read_byte_array()?;
                Ok(TransactionRequest::StaticMethodCall(StaticMethodCallTransactionRequest {
                    header,
                    method,
                    actuals,
                    signature,
                }))
            }
            SELECTOR_TRANSFER_INT | SELECTOR_TRANSFER_LONG | SELECTOR_TRANSFER_BIG_INTEGER => {
                let caller = StorageReference::unmarshal_without_selector(ctx)?;
                let gas_price = ctx.read_big_integer()?;
                let classpath = TransactionReference::unmarshal(ctx)?;
                let nonce = ctx.read_big_integer()?;
                let chain_id = ctx.read_utf()?;
                let receiver = StorageReference::unmarshal_without_selector(ctx)?;
                let amount = match selector {
                    SELECTOR_TRANSFER_INT => StorageValue::Int(ctx.read_i32()?),
                    SELECTOR_TRANSFER_LONG => StorageValue::Long(ctx.read_i64()?),
                    _ => StorageValue::BigInteger(ctx.read_big_integer()?),
                };
                let signature = ctx.read_byte_array()?;
                Ok(TransactionRequest::Transfer(TransferTransactionRequest {
                    header: RequestHeader {
                        caller,
                        nonce,
                        chain_id,
                        gas_limit: transfer_gas_limit(),
                        gas_price,
                        classpath,
                    },
                    receiver,
                    amount,
                    signature,
                }))
            }
            other => Err(ChainError::marshalling(format!("unknown request selector {other}"))),
        }
    }
}

fn read_values(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<StorageValue>> {
    let count = ctx.read_compact_u32()? as usize;
    let mut values = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        values.push(StorageValue::unmarshal(ctx)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> StorageReference {
        StorageReference::new(TransactionReference::new([1u8; 32]), 0)
    }

    fn receiver() -> StorageReference {
        StorageReference::new(TransactionReference::new([2u8; 32]), 0)
    }

    fn classpath() -> TransactionReference {
        TransactionReference::new([3u8; 32])
    }

    #[test]
    fn transfer_of_int_leads_with_selector_seven() {
        let request = TransactionRequest::Transfer(
            TransferTransactionRequest::new(
                caller(),
                BigInt::from(0),
                "test".to_string(),
                BigInt::from(1),
                classpath(),
                receiver(),
                StorageValue::Int(100),
            )
            .unwrap(),
        );
        let bytes = request.to_bytes();
        assert_eq!(bytes[0], 0x07);
        assert_eq!(TransactionRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn transfer_gas_limit_is_implicit() {
        let request = TransferTransactionRequest::new(
            caller(),
            BigInt::from(0),
            "test".to_string(),
            BigInt::from(1),
            classpath(),
            receiver(),
            StorageValue::Long(100),
        )
        .unwrap();
        assert_eq!(request.header.gas_limit, transfer_gas_limit());
        let wrapped = TransactionRequest::Transfer(request);
        let back = TransactionRequest::from_bytes(&wrapped.to_bytes()).unwrap();
        assert_eq!(back.header().unwrap().gas_limit, transfer_gas_limit());
    }

    #[test]
    fn requests_round_trip() {
        let header = RequestHeader {
            caller: caller(),
            nonce: BigInt::from(4),
            chain_id: "test".to_string(),
            gas_limit: BigInt::from(20_000),
            gas_price: BigInt::from(2),
            classpath: classpath(),
        };
        let requests = vec![
            TransactionRequest::InitialJarStore(InitialJarStoreTransactionRequest {
                jar: vec![1, 2, 3],
                dependencies: vec![classpath()],
            }),
            TransactionRequest::GameteCreation(GameteCreationTransactionRequest {
                classpath: classpath(),
                initial_amount: BigInt::from(1_000_000u64),
                red_initial_amount: BigInt::from(0),
                public_key: "TUFBQQ==".to_string(),
            }),
            TransactionRequest::Initialization(InitializationTransactionRequest {
                classpath: classpath(),
                manifest: receiver(),
            }),
            TransactionRequest::JarStore(JarStoreTransactionRequest {
                header: header.clone(),
                jar: vec![9, 9],
                dependencies: vec![],
                signature: vec![7; 64],
            }),
            TransactionRequest::ConstructorCall(ConstructorCallTransactionRequest {
                header: header.clone(),
                constructor: ConstructorSignature::new("demo.C", vec![StorageType::Int]),
                actuals: vec![StorageValue::Int(3)],
                signature: vec![],
            }),
            TransactionRequest::InstanceMethodCall(InstanceMethodCallTransactionRequest {
                header: header.clone(),
                method: MethodSignature::new("demo.C", "m", vec![], Some(StorageType::Int)),
                receiver: receiver(),
                actuals: vec![],
                signature: vec![1],
            }),
            TransactionRequest::StaticMethodCall(StaticMethodCallTransactionRequest {
                header,
                method: MethodSignature::new("demo.C", "s", vec![], None),
                actuals: vec![],
                signature: vec![],
            }),
        ];
        for request in requests {
            assert_eq!(TransactionRequest::from_bytes(&request.to_bytes()).unwrap(), request);
        }
    }

    #[test]
    fn signature_covers_everything_but_itself() {
        let mut request = TransactionRequest::InstanceMethodCall(InstanceMethodCallTransactionRequest {
            header: RequestHeader {
                caller: caller(),
                nonce: BigInt::from(0),
                chain_id: "test".to_string(),
                gas_limit: BigInt::from(10_000),
                gas_price: BigInt::from(1),
                classpath: classpath(),
            },
            method: MethodSignature::new("demo.C", "m", vec![], None),
            receiver: receiver(),
            actuals: vec![],
            signature: vec![],
        });
        let unsigned = request.to_bytes_without_signature();
        request.sign_with(SignatureScheme::Empty, &{
            let secret = ed25519_dalek::SecretKey::from_bytes(&[7u8; 32]).unwrap();
            let public = ed25519_dalek::PublicKey::from(&secret);
            ed25519_dalek::Keypair { secret, public }
        });
        assert_eq!(request.to_bytes_without_signature(), unsigned);
        assert!(request.to_bytes().len() > unsigned.len());
    }
}
