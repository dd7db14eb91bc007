use num_bigint::BigInt;

use crate::errors::{ChainError, ChainResult};
use crate::marshalling::{Marshallable, MarshallingContext, UnmarshallingContext};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::updates::Update;
use crate::types::values::StorageValue;

const SELECTOR_GAMETE_CREATION: u8 = 0;
const SELECTOR_JAR_STORE_INITIAL: u8 = 1;
const SELECTOR_JAR_STORE_SUCCESSFUL: u8 = 2;
const SELECTOR_JAR_STORE_FAILED: u8 = 3;
const SELECTOR_CONSTRUCTOR_EXCEPTION: u8 = 4;
const SELECTOR_CONSTRUCTOR_SUCCESSFUL: u8 = 5;
const SELECTOR_CONSTRUCTOR_FAILED: u8 = 6;
const SELECTOR_METHOD_EXCEPTION: u8 = 7;
const SELECTOR_METHOD_FAILED: u8 = 8;
const SELECTOR_METHOD_SUCCESSFUL: u8 = 9;
const SELECTOR_VOID_METHOD_SUCCESSFUL: u8 = 10;
const SELECTOR_INITIALIZATION: u8 = 11;

/// Gas actually consumed by an accepted transaction, split by concern.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct GasCosts {
    pub cpu: BigInt,
    pub ram: BigInt,
    pub storage: BigInt,
}

impl GasCosts {
    pub fn total(&self) -> BigInt {
        &self.cpu + &self.ram + &self.storage
    }
}

impl Marshallable for GasCosts {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_big_integer(&self.cpu);
        ctx.write_big_integer(&self.ram);
        ctx.write_big_integer(&self.storage);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            cpu: ctx.read_big_integer()?,
            ram: ctx.read_big_integer()?,
            storage: ctx.read_big_integer()?,
        })
    }
}

/// The classification of a failed transaction body.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureCause {
    /// The class name of the exception or diagnostic that caused the failure.
    pub class_of_cause: String,
    pub message: String,
    /// Where the failure occurred, when known (class and method).
    pub location: String,
}

impl Marshallable for FailureCause {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        ctx.write_utf(&self.class_of_cause);
        ctx.write_utf(&self.message);
        ctx.write_utf(&self.location);
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        Ok(Self {
            class_of_cause: ctx.read_utf()?,
            message: ctx.read_utf()?,
            location: ctx.read_utf()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameteCreationTransactionResponse {
    pub updates: Vec<Update>,
    pub gamete: StorageReference,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JarStoreInitialTransactionResponse {
    pub instrumented_jar: Vec<u8>,
    pub dependencies: Vec<TransactionReference>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InitializationTransactionResponse {}

#[derive(Clone, Debug, PartialEq)]
pub struct JarStoreTransactionSuccessfulResponse {
    pub instrumented_jar: Vec<u8>,
    pub dependencies: Vec<TransactionReference>,
    pub updates: Vec<Update>,
    pub gas: GasCosts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JarStoreTransactionFailedResponse {
    pub cause: FailureCause,
    pub updates: Vec<Update>,
    pub gas: GasCosts,
    pub penalty: BigInt,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstructorCallTransactionSuccessfulResponse {
    pub new_object: StorageReference,
    pub updates: Vec<Update>,
    pub events: Vec<StorageReference>,
    pub gas: GasCosts,
}

/// The constructor threw an exception declared with `throws_exceptions`:
/// a success outcome carrying the declared exception.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstructorCallTransactionExceptionResponse {
    pub cause: FailureCause,
    pub updates: Vec<Update>,
    pub events: Vec<StorageReference>,
    pub gas: GasCosts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstructorCallTransactionFailedResponse {
    pub cause: FailureCause,
    pub updates: Vec<Update>,
    pub gas: GasCosts,
    pub penalty: BigInt,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCallTransactionSuccessfulResponse {
    pub result: StorageValue,
    pub updates: Vec<Update>,
    pub events: Vec<StorageReference>,
    pub gas: GasCosts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VoidMethodCallTransactionSuccessfulResponse {
    pub updates: Vec<Update>,
    pub events: Vec<StorageReference>,
    pub gas: GasCosts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCallTransactionExceptionResponse {
    pub cause: FailureCause,
    pub updates: Vec<Update>,
    pub events: Vec<StorageReference>,
    pub gas: GasCosts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodCallTransactionFailedResponse {
    pub cause: FailureCause,
    pub updates: Vec<Update>,
    pub gas: GasCosts,
    pub penalty: BigInt,
}

/// The response computed for an accepted transaction request.
#[derive(Clone, Debug, PartialEq)]
pub enum TransactionResponse {
    GameteCreation(GameteCreationTransactionResponse),
    JarStoreInitial(JarStoreInitialTransactionResponse),
    Initialization(InitializationTransactionResponse),
    JarStoreSuccessful(JarStoreTransactionSuccessfulResponse),
    JarStoreFailed(JarStoreTransactionFailedResponse),
    ConstructorSuccessful(ConstructorCallTransactionSuccessfulResponse),
    ConstructorException(ConstructorCallTransactionExceptionResponse),
    ConstructorFailed(ConstructorCallTransactionFailedResponse),
    MethodSuccessful(MethodCallTransactionSuccessfulResponse),
    VoidMethodSuccessful(VoidMethodCallTransactionSuccessfulResponse),
    MethodException(MethodCallTransactionExceptionResponse),
    MethodFailed(MethodCallTransactionFailedResponse),
}

impl TransactionResponse {
    pub fn updates(&self) -> &[Update] {
        match self {
            TransactionResponse::GameteCreation(r) => &r.updates,
            TransactionResponse::JarStoreInitial(_) | TransactionResponse::Initialization(_) => &[],
            TransactionResponse::JarStoreSuccessful(r) => &r.updates,
            TransactionResponse::JarStoreFailed(r) => &r.updates,
            TransactionResponse::ConstructorSuccessful(r) => &r.updates,
            TransactionResponse::ConstructorException(r) => &r.updates,
            TransactionResponse::ConstructorFailed(r) => &r.updates,
            TransactionResponse::MethodSuccessful(r) => &r.updates,
            TransactionResponse::VoidMethodSuccessful(r) => &r.updates,
            TransactionResponse::MethodException(r) => &r.updates,
            TransactionResponse::MethodFailed(r) => &r.updates,
        }
    }

    pub fn events(&self) -> &[StorageReference] {
        match self {
            TransactionResponse::ConstructorSuccessful(r) => &r.events,
            TransactionResponse::ConstructorException(r) => &r.events,
            TransactionResponse::MethodSuccessful(r) => &r.events,
            TransactionResponse::VoidMethodSuccessful(r) => &r.events,
            TransactionResponse::MethodException(r) => &r.events,
            _ => &[],
        }
    }

    pub fn gas(&self) -> Option<&GasCosts> {
        match self {
            TransactionResponse::JarStoreSuccessful(r) => Some(&r.gas),
            TransactionResponse::JarStoreFailed(r) => Some(&r.gas),
            TransactionResponse::ConstructorSuccessful(r) => Some(&r.gas),
            TransactionResponse::ConstructorException(r) => Some(&r.gas),
            TransactionResponse::ConstructorFailed(r) => Some(&r.gas),
            TransactionResponse::MethodSuccessful(r) => Some(&r.gas),
            TransactionResponse::VoidMethodSuccessful(r) => Some(&r.gas),
            TransactionResponse::MethodException(r) => Some(&r.gas),
            TransactionResponse::MethodFailed(r) => Some(&r.gas),
            _ => None,
        }
    }

    pub fn penalty(&self) -> Option<&BigInt> {
        match self {
            TransactionResponse::JarStoreFailed(r) => Some(&r.penalty),
            TransactionResponse::ConstructorFailed(r) => Some(&r.penalty),
            TransactionResponse::MethodFailed(r) => Some(&r.penalty),
            _ => None,
        }
    }

    /// The instrumented module bytes and dependencies, if this response is
    /// a successful module installation usable as a classpath.
    pub fn installed_jar(&self) -> Option<(&[u8], &[TransactionReference])> {
        match self {
            TransactionResponse::JarStoreInitial(r) => {
                Some((&r.instrumented_jar, &r.dependencies))
            }
            TransactionResponse::JarStoreSuccessful(r) => {
                Some((&r.instrumented_jar, &r.dependencies))
            }
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TransactionResponse::JarStoreFailed(_)
                | TransactionResponse::ConstructorFailed(_)
                | TransactionResponse::MethodFailed(_)
        )
    }

    pub fn failure_cause(&self) -> Option<&FailureCause> {
        match self {
            TransactionResponse::JarStoreFailed(r) => Some(&r.cause),
            TransactionResponse::ConstructorFailed(r) => Some(&r.cause),
            TransactionResponse::MethodFailed(r) => Some(&r.cause),
            TransactionResponse::ConstructorException(r) => Some(&r.cause),
            TransactionResponse::MethodException(r) => Some(&r.cause),
            _ => None,
        }
    }
}

fn write_updates(updates: &[Update], ctx: &mut MarshallingContext) {
    ctx.write_compact_u32(updates.len() as u32);
    for update in updates {
        update.marshal(ctx);
    }
}

fn read_updates(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<Update>> {
    let count = ctx.read_compact_u32()? as usize;
    let mut updates = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        updates.push(Update::unmarshal(ctx)?);
    }
    Ok(updates)
}

fn write_events(events: &[StorageReference], ctx: &mut MarshallingContext) {
    ctx.write_compact_u32(events.len() as u32);
    for event in events {
        event.marshal_without_selector(ctx);
    }
}

fn read_events(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<StorageReference>> {
    let count = ctx.read_compact_u32()? as usize;
    let mut events = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        events.push(StorageReference::unmarshal_without_selector(ctx)?);
    }
    Ok(events)
}

fn write_dependencies(dependencies: &[TransactionReference], ctx: &mut MarshallingContext) {
    ctx.write_compact_u32(dependencies.len() as u32);
    for dependency in dependencies {
        dependency.marshal(ctx);
    }
}

fn read_dependencies(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<TransactionReference>> {
    let count = ctx.read_compact_u32()? as usize;
    let mut dependencies = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        dependencies.push(TransactionReference::unmarshal(ctx)?);
    }
    Ok(dependencies)
}

impl Marshallable for TransactionResponse {
    fn marshal(&self, ctx: &mut MarshallingContext) {
        match self {
            TransactionResponse::GameteCreation(r) => {
                ctx.write_u8(SELECTOR_GAMETE_CREATION);
                write_updates(&r.updates, ctx);
                r.gamete.marshal_without_selector(ctx);
            }
            TransactionResponse::JarStoreInitial(r) => {
                ctx.write_u8(SELECTOR_JAR_STORE_INITIAL);
                ctx.write_byte_array(&r.instrumented_jar);
                write_dependencies(&r.dependencies, ctx);
            }
            TransactionResponse::Initialization(_) => {
                ctx.write_u8(SELECTOR_INITIALIZATION);
            }
            TransactionResponse::JarStoreSuccessful(r) => {
                ctx.write_u8(SELECTOR_JAR_STORE_SUCCESSFUL);
                ctx.write_byte_array(&r.instrumented_jar);
                write_dependencies(&r.dependencies, ctx);
                write_updates(&r.updates, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::JarStoreFailed(r) => {
                ctx.write_u8(SELECTOR_JAR_STORE_FAILED);
                r.cause.marshal(ctx);
                write_updates(&r.updates, ctx);
                r.gas.marshal(ctx);
                ctx.write_big_integer(&r.penalty);
            }
            TransactionResponse::ConstructorSuccessful(r) => {
                ctx.write_u8(SELECTOR_CONSTRUCTOR_SUCCESSFUL);
                r.new_object.marshal_without_selector(ctx);
                write_updates(&r.updates, ctx);
                write_events(&r.events, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::ConstructorException(r) => {
                ctx.write_u8(SELECTOR_CONSTRUCTOR_EXCEPTION);
                r.cause.marshal(ctx);
                write_updates(&r.updates, ctx);
                write_events(&r.events, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::ConstructorFailed(r) => {
                ctx.write_u8(SELECTOR_CONSTRUCTOR_FAILED);
                r.cause.marshal(ctx);
                write_updates(&r.updates, ctx);
                r.gas.marshal(ctx);
                ctx.write_big_integer(&r.penalty);
            }
            TransactionResponse::MethodSuccessful(r) => {
                ctx.write_u8(SELECTOR_METHOD_SUCCESSFUL);
                r.result.marshal(ctx);
                write_updates(&r.updates, ctx);
                write_events(&r.events, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::VoidMethodSuccessful(r) => {
                ctx.write_u8(SELECTOR_VOID_METHOD_SUCCESSFUL);
                write_updates(&r.updates, ctx);
                write_events(&r.events, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::MethodException(r) => {
                ctx.write_u8(SELECTOR_METHOD_EXCEPTION);
                r.cause.marshal(ctx);
                write_updates(&r.updates, ctx);
                write_events(&r.events, ctx);
                r.gas.marshal(ctx);
            }
            TransactionResponse::MethodFailed(r) => {
                ctx.write_u8(SELECTOR_METHOD_FAILED);
                r.cause.marshal(ctx);
                write_updates(&r.updates, ctx);
                r.gas.marshal(ctx);
                ctx.write_big_integer(&r.penalty);
            }
        }
    }

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self> {
        match ctx.read_u8()? {
            SELECTOR_GAMETE_CREATION => Ok(TransactionResponse::GameteCreation(
                GameteCreationTransactionResponse {
                    updates: read_updates(ctx)?,
                    gamete: StorageReference::unmarshal_without_selector(ctx)?,
                },
            )),
            SELECTOR_JAR_STORE_INITIAL => Ok(TransactionResponse::JarStoreInitial(
                JarStoreInitialTransactionResponse {
                    instrumented_jar: ctx.read_byte_array()?,
                    dependencies: read_dependencies(ctx)?,
                },
            )),
            SELECTOR_INITIALIZATION => {
                Ok(TransactionResponse::Initialization(InitializationTransactionResponse {}))
            }
            SELECTOR_JAR_STORE_SUCCESSFUL => Ok(TransactionResponse::JarStoreSuccessful(
                JarStoreTransactionSuccessfulResponse {
                    instrumented_jar: ctx.read_byte_array()?,
                    dependencies: read_dependencies(ctx)?,
                    updates: read_updates(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_JAR_STORE_FAILED => Ok(TransactionResponse::JarStoreFailed(
                JarStoreTransactionFailedResponse {
                    cause: FailureCause::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                    penalty: ctx.read_big_integer()?,
                },
            )),
            SELECTOR_CONSTRUCTOR_SUCCESSFUL => Ok(TransactionResponse::ConstructorSuccessful(
                ConstructorCallTransactionSuccessfulResponse {
                    new_object: StorageReference::unmarshal_without_selector(ctx)?,
                    updates: read_updates(ctx)?,
                    events: read_events(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_CONSTRUCTOR_EXCEPTION => Ok(TransactionResponse::ConstructorException(
                ConstructorCallTransactionExceptionResponse {
                    cause: FailureCause::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    events: read_events(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_CONSTRUCTOR_FAILED => Ok(TransactionResponse::ConstructorFailed(
                ConstructorCallTransactionFailedResponse {
                    cause: FailureCause::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                    penalty: ctx.read_big_integer()?,
                },
            )),
            SELECTOR_METHOD_SUCCESSFUL => Ok(TransactionResponse::MethodSuccessful(
                MethodCallTransactionSuccessfulResponse {
                    result: StorageValue::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    events: read_events(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_VOID_METHOD_SUCCESSFUL => Ok(TransactionResponse::VoidMethodSuccessful(
                VoidMethodCallTransactionSuccessfulResponse {
                    updates: read_updates(ctx)?,
                    events: read_events(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_METHOD_EXCEPTION => Ok(TransactionResponse::MethodException(
                MethodCallTransactionExceptionResponse {
                    cause: FailureCause::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    events: read_events(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                },
            )),
            SELECTOR_METHOD_FAILED => Ok(TransactionResponse::MethodFailed(
                MethodCallTransactionFailedResponse {
                    cause: FailureCause::unmarshal(ctx)?,
                    updates: read_updates(ctx)?,
                    gas: GasCosts::unmarshal(ctx)?,
                    penalty: ctx.read_big_integer()?,
                },
            )),
            other => Err(ChainError::marshalling(format!("unknown response selector {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::signatures::FieldSignature;
    use crate::types::storage_types::StorageType;

    fn object() -> StorageReference {
        StorageReference::new(TransactionReference::new([4u8; 32]), 0)
    }

    fn gas() -> GasCosts {
        GasCosts {
            cpu: BigInt::from(100),
            ram: BigInt::from(20),
            storage: BigInt::from(35),
        }
    }

    #[test]
    fn normative_selectors_are_stable() {
        let gamete = TransactionResponse::GameteCreation(GameteCreationTransactionResponse {
            updates: vec![],
            gamete: object(),
        });
        assert_eq!(gamete.to_bytes()[0], 0);

        let constructor_exception =
            TransactionResponse::ConstructorException(ConstructorCallTransactionExceptionResponse {
                cause: FailureCause {
                    class_of_cause: "demo.Refused".to_string(),
                    message: "no".to_string(),
                    location: "demo.C.<init>".to_string(),
                },
                updates: vec![],
                events: vec![],
                gas: gas(),
            });
        assert_eq!(constructor_exception.to_bytes()[0], 4);

        let failed = TransactionResponse::MethodFailed(MethodCallTransactionFailedResponse {
            cause: FailureCause {
                class_of_cause: "banyan.lang.OutOfGasError".to_string(),
                message: String::new(),
                location: String::new(),
            },
            updates: vec![],
            gas: gas(),
            penalty: BigInt::from(5),
        });
        assert_eq!(failed.to_bytes()[0], 8);

        let successful = TransactionResponse::MethodSuccessful(MethodCallTransactionSuccessfulResponse {
            result: StorageValue::Int(3),
            updates: vec![],
            events: vec![],
            gas: gas(),
        });
        assert_eq!(successful.to_bytes()[0], 9);
    }

    #[test]
    fn responses_round_trip() {
        let update = Update::Field {
            object: object(),
            field: FieldSignature::new("demo.C", "x", StorageType::Int),
            value: StorageValue::Int(5),
        };
        let responses = vec![
            TransactionResponse::GameteCreation(GameteCreationTransactionResponse {
                updates: vec![update.clone()],
                gamete: object(),
            }),
            TransactionResponse::JarStoreInitial(JarStoreInitialTransactionResponse {
                instrumented_jar: vec![1, 2, 3],
                dependencies: vec![TransactionReference::new([1u8; 32])],
            }),
            TransactionResponse::Initialization(InitializationTransactionResponse {}),
            TransactionResponse::JarStoreSuccessful(JarStoreTransactionSuccessfulResponse {
                instrumented_jar: vec![4, 5],
                dependencies: vec![],
                updates: vec![update.clone()],
                gas: gas(),
            }),
            TransactionResponse::ConstructorSuccessful(ConstructorCallTransactionSuccessfulResponse {
                new_object: object(),
                updates: vec![update.clone()],
                events: vec![object()],
                gas: gas(),
            }),
            TransactionResponse::VoidMethodSuccessful(VoidMethodCallTransactionSuccessfulResponse {
                updates: vec![update],
                events: vec![],
                gas: gas(),
            }),
            TransactionResponse::MethodFailed(MethodCallTransactionFailedResponse {
                cause: FailureCause {
                    class_of_cause: "x.Y".to_string(),
                    message: "m".to_string(),
                    location: "l".to_string(),
                },
                updates: vec![],
                gas: gas(),
                penalty: BigInt::from(9),
            }),
        ];
        for response in responses {
            assert_eq!(
                TransactionResponse::from_bytes(&response.to_bytes()).unwrap(),
                response
            );
        }
    }
}
