//! Builders of the code-execution transactions: constructor calls,
//! instance and static method calls, the compact coin transfer and the
//! uncommitted view runs.

use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Signed;

use crate::base_library::{BURN_METHOD, FAUCET_METHOD, MINT_METHOD};
use crate::bytecode::Method;
use crate::caches::NodeCaches;
use crate::classloader::EngineClassLoader;
use crate::config::ConsensusParams;
use crate::deserialization::{deserialize, runtime_to_storage, value_to_runtime};
use crate::errors::{ChainError, ChainResult};
use crate::extraction::only_caller_accounting;
use crate::gas::GasCostModel;
use crate::instrumentation::from_contract_formals;
use crate::interpreter::invoke;
use crate::runtime::{ExecutionContext, RtValue, VmError};
use crate::store::{StoreView, INFO_GAMETE};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::{
    ConstructorCallTransactionRequest, InstanceMethodCallTransactionRequest, RequestHeader,
    StaticMethodCallTransactionRequest, TransactionRequest, TransferTransactionRequest,
};
use crate::types::responses::{
    ConstructorCallTransactionExceptionResponse, ConstructorCallTransactionFailedResponse,
    ConstructorCallTransactionSuccessfulResponse, MethodCallTransactionExceptionResponse,
    MethodCallTransactionFailedResponse, MethodCallTransactionSuccessfulResponse, TransactionResponse,
    VoidMethodCallTransactionSuccessfulResponse,
};
use crate::types::signatures::{ConstructorSignature, MethodSignature};
use crate::types::values::StorageValue;

use super::{admit, cause_of, failed_execution, gas_triple, PaidExecution, SIDE_EFFECTS_IN_VIEW_ERROR};

const NO_SUCH_METHOD_ERROR: &str = "banyan.lang.NoSuchMethodError";

/// The outcome of a body, before it is turned into a response kind.
enum CallOutcome {
    Returned(Option<RtValue>),
    /// The body threw an exception declared with `throws_exceptions`:
    /// a success from the engine's perspective.
    DeclaredException { class: String, message: String, location: String },
}

#[allow(clippy::too_many_arguments)]
pub(super) fn constructor_call(
    reference: TransactionReference,
    request: &TransactionRequest,
    call: &ConstructorCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    let header = &call.header;
    let classloader = admit(
        reference, request, header, view, caches, consensus, gas_model, false, false,
    )?;

    let mut execution = PaidExecution::begin(
        reference,
        request,
        header,
        classloader.clone(),
        view,
        consensus,
        gas_model,
    )?;

    let body = run_constructor(&mut execution, call);
    match body {
        Ok((outcome, new_object_index, roots)) => {
            let new_object = execution.ctx.object(new_object_index).reference;
            let result = match outcome {
                CallOutcome::Returned(_) => execution.succeed(&roots, |updates, events, gas| {
                    TransactionResponse::ConstructorSuccessful(ConstructorCallTransactionSuccessfulResponse {
                        new_object,
                        updates,
                        events,
                        gas,
                    })
                }),
                CallOutcome::DeclaredException { class, message, location } => {
                    // the new object is discarded: only the effects on the
                    // objects reachable from caller and actuals survive
                    let cause = crate::types::responses::FailureCause {
                        class_of_cause: class,
                        message,
                        location,
                    };
                    let roots: Vec<usize> = roots.into_iter().filter(|index| *index != new_object_index).collect();
                    execution.succeed(&roots, move |updates, events, gas| {
                        TransactionResponse::ConstructorException(ConstructorCallTransactionExceptionResponse {
                            cause: cause.clone(),
                            updates,
                            events,
                            gas,
                        })
                    })
                }
            };
            finish_constructor(result, reference, header, classloader, view, consensus, gas_model, &mut execution)
        }
        Err(error) => {
            let consumed = gas_triple(&execution.ctx.gas);
            failed_execution(
                reference,
                header,
                classloader,
                view,
                consensus,
                gas_model,
                consumed,
                cause_of(&error),
                constructor_failed,
            )
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_constructor(
    result: Result<TransactionResponse, VmError>,
    reference: TransactionReference,
    header: &RequestHeader,
    classloader: Arc<EngineClassLoader>,
    view: &dyn StoreView,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    execution: &mut PaidExecution<'_>,
) -> ChainResult<TransactionResponse> {
    match result {
        Ok(response) => Ok(response),
        Err(error) => {
            let consumed = gas_triple(&execution.ctx.gas);
            failed_execution(
                reference,
                header,
                classloader,
                view,
                consensus,
                gas_model,
                consumed,
                cause_of(&error),
                constructor_failed,
            )
        }
    }
}

fn constructor_failed(
    cause: crate::types::responses::FailureCause,
    updates: Vec<crate::types::updates::Update>,
    gas: crate::types::responses::GasCosts,
    penalty: BigInt,
) -> TransactionResponse {
    TransactionResponse::ConstructorFailed(ConstructorCallTransactionFailedResponse {
        cause,
        updates,
        gas,
        penalty,
    })
}

fn run_constructor(
    execution: &mut PaidExecution<'_>,
    call: &ConstructorCallTransactionRequest,
) -> Result<(CallOutcome, usize, Vec<usize>), VmError> {
    let ctx = &mut execution.ctx;
    let caller = execution.caller;

    let mut actuals = Vec::with_capacity(call.actuals.len());
    for actual in &call.actuals {
        actuals.push(value_to_runtime(ctx, actual)?);
    }

    // exact signature first, then the from-contract variant with the
    // trailing caller and dummy
    let class_name = &call.constructor.defining_class;
    let (resolved, mut arguments) = match ctx.classloader.resolve_constructor(class_name, &call.constructor.formals) {
        Some(method) => (method, actuals.clone()),
        None => {
            let extended = from_contract_formals(&call.constructor.formals);
            let method = ctx
                .classloader
                .resolve_constructor(class_name, &extended)
                .ok_or_else(|| {
                    VmError::thrown(
                        NO_SUCH_METHOD_ERROR,
                        format!("constructor {} cannot be found", call.constructor),
                        "constructor call",
                    )
                })?;
            let mut extended_actuals = actuals.clone();
            extended_actuals.push(RtValue::Object(caller));
            extended_actuals.push(RtValue::Int(0));
            (method, extended_actuals)
        }
    };

    if !ctx.classloader.is_storage_class(class_name) {
        return Err(VmError::thrown(
            NO_SUCH_METHOD_ERROR,
            format!("{class_name} is not a storage class"),
            "constructor call",
        ));
    }

    let new_object = ctx.allocate(class_name)?;
    let mut roots = vec![caller, new_object];
    for actual in &actuals {
        if let RtValue::Object(index) = actual {
            roots.push(*index);
        }
    }

    let invocation = invoke(ctx, class_name, &resolved, Some(new_object), std::mem::take(&mut arguments), 0);
    match invocation {
        Ok(_) => Ok((CallOutcome::Returned(None), new_object, roots)),
        Err(VmError::Thrown { class, message, location })
            if resolved.throws_exceptions && resolved.throws.contains(&class) =>
        {
            Ok((
                CallOutcome::DeclaredException { class, message, location },
                new_object,
                roots,
            ))
        }
        Err(error) => Err(error),
    }
}

/// The shape shared by instance calls, static calls and transfers.
struct CallSpec<'r> {
    method: MethodSignature,
    receiver: Option<StorageReference>,
    actuals: &'r [StorageValue],
}

#[allow(clippy::too_many_arguments)]
pub(super) fn instance_method_call(
    reference: TransactionReference,
    request: &TransactionRequest,
    call: &InstanceMethodCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    view_run: bool,
) -> ChainResult<TransactionResponse> {
    reject_negative_supply_change(call)?;
    let skip_signature = is_unsigned_faucet_call(call, view, caches, consensus)?;
    method_call(
        reference,
        request,
        &call.header,
        CallSpec {
            method: call.method.clone(),
            receiver: Some(call.receiver),
            actuals: &call.actuals,
        },
        view,
        caches,
        consensus,
        gas_model,
        view_run,
        skip_signature,
    )
}

#[allow(clippy::too_many_arguments)]
pub(super) fn static_method_call(
    reference: TransactionReference,
    request: &TransactionRequest,
    call: &StaticMethodCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    view_run: bool,
) -> ChainResult<TransactionResponse> {
    method_call(
        reference,
        request,
        &call.header,
        CallSpec {
            method: call.method.clone(),
            receiver: None,
            actuals: &call.actuals,
        },
        view,
        caches,
        consensus,
        gas_model,
        view_run,
        false,
    )
}

pub(super) fn transfer(
    reference: TransactionReference,
    request: &TransactionRequest,
    call: &TransferTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    let negative = match &call.amount {
        StorageValue::Int(v) => *v < 0,
        StorageValue::Long(v) => *v < 0,
        StorageValue::BigInteger(v) => v.is_negative(),
        _ => true,
    };
    if negative {
        return Err(ChainError::rejected("cannot transfer a negative amount"));
    }
    let actuals = [call.amount.clone()];
    method_call(
        reference,
        request,
        &call.header,
        CallSpec {
            method: call.equivalent_method(),
            receiver: Some(call.receiver),
            actuals: &actuals,
        },
        view,
        caches,
        consensus,
        gas_model,
        false,
        false,
    )
}

/// Runs an instance method call as a view: admission skips nonce and
/// signature, the gas limit is capped and nothing may be committed.
pub fn run_instance_method_call(
    request: &InstanceMethodCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    if request.header.gas_limit > consensus.max_gas_per_view_transaction {
        return Err(ChainError::rejected("too much gas for view"));
    }
    let wrapped = TransactionRequest::InstanceMethodCall(request.clone());
    let reference = wrapped.reference();
    instance_method_call(reference, &wrapped, request, view, caches, consensus, gas_model, true)
}

/// Runs a static method call as a view; see [`run_instance_method_call`].
pub fn run_static_method_call(
    request: &StaticMethodCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    if request.header.gas_limit > consensus.max_gas_per_view_transaction {
        return Err(ChainError::rejected("too much gas for view"));
    }
    let wrapped = TransactionRequest::StaticMethodCall(request.clone());
    let reference = wrapped.reference();
    static_method_call(reference, &wrapped, request, view, caches, consensus, gas_model, true)
}

/// Unsigned faucet calls are admissible when the consensus allows them:
/// the gamete calling `faucet` on itself.
fn is_unsigned_faucet_call(
    call: &InstanceMethodCallTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
) -> ChainResult<bool> {
    if !consensus.allow_unsigned_faucet
        || call.method.name != FAUCET_METHOD
        || call.header.caller != call.receiver
    {
        return Ok(false);
    }
    let Some(bytes) = view.info(INFO_GAMETE)? else {
        return Ok(false);
    };
    let mut reader = crate::marshalling::UnmarshallingContext::new(&bytes);
    let gamete = StorageReference::unmarshal_without_selector(&mut reader)?;
    if gamete != call.receiver {
        return Ok(false);
    }
    let is_gamete_class = caches
        .class_tag_at(call.receiver, view)?
        .map(|(class, _)| class == crate::base_library::GAMETE_CLASS)
        .unwrap_or(false);
    Ok(is_gamete_class)
}

/// Negative amounts to the supply intrinsics are rejected before any
/// state change.
fn reject_negative_supply_change(call: &InstanceMethodCallTransactionRequest) -> ChainResult<()> {
    if call.method.name == MINT_METHOD || call.method.name == BURN_METHOD || call.method.name == FAUCET_METHOD {
        for actual in &call.actuals {
            if let StorageValue::BigInteger(amount) = actual {
                if amount.is_negative() {
                    return Err(ChainError::rejected(format!(
                        "cannot {} a negative amount",
                        call.method.name
                    )));
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn method_call(
    reference: TransactionReference,
    request: &TransactionRequest,
    header: &RequestHeader,
    spec: CallSpec<'_>,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    view_run: bool,
    skip_signature: bool,
) -> ChainResult<TransactionResponse> {
    let classloader = admit(
        reference,
        request,
        header,
        view,
        caches,
        consensus,
        gas_model,
        skip_signature || view_run,
        view_run,
    )?;

    // receivers of signed calls must be exported; view calls may receive
    // non-exported values
    if let Some(receiver) = spec.receiver {
        if !view_run {
            let (receiver_class, _) = caches
                .class_tag_at(receiver, view)?
                .ok_or_else(|| ChainError::rejected(format!("unknown receiver {receiver}")))?;
            if !classloader.is_exported(&receiver_class) {
                return Err(ChainError::rejected("the receiver of the request is not exported"));
            }
        }
    }

    let mut execution = PaidExecution::begin(
        reference,
        request,
        header,
        classloader.clone(),
        view,
        consensus,
        gas_model,
    )?;

    let body = run_method(&mut execution, &spec, view_run);
    match body {
        Ok((outcome, resolved, roots)) => {
            let is_view = view_run || resolved.view;
            let caller_reference = header.caller;
            let result = match outcome {
                CallOutcome::Returned(result) => {
                    let serialized = result.map(|value| runtime_to_storage(&execution.ctx, &value));
                    let checked = check_view(&mut execution, &roots, is_view, caller_reference);
                    match checked {
                        Err(error) => Err(error),
                        Ok(()) => execution.succeed(&roots, move |updates, events, gas| match &serialized {
                            Some(result) => TransactionResponse::MethodSuccessful(
                                MethodCallTransactionSuccessfulResponse {
                                    result: result.clone(),
                                    updates,
                                    events,
                                    gas,
                                },
                            ),
                            None => TransactionResponse::VoidMethodSuccessful(
                                VoidMethodCallTransactionSuccessfulResponse { updates, events, gas },
                            ),
                        }),
                    }
                }
                CallOutcome::DeclaredException { class, message, location } => {
                    let cause = crate::types::responses::FailureCause {
                        class_of_cause: class,
                        message,
                        location,
                    };
                    let checked = check_view(&mut execution, &roots, is_view, caller_reference);
                    match checked {
                        Err(error) => Err(error),
                        Ok(()) => execution.succeed(&roots, move |updates, events, gas| {
                            TransactionResponse::MethodException(MethodCallTransactionExceptionResponse {
                                cause: cause.clone(),
                                updates,
                                events,
                                gas,
                            })
                        }),
                    }
                }
            };
            match result {
                Ok(response) => Ok(response),
                Err(error) => {
                    let consumed = gas_triple(&execution.ctx.gas);
                    failed_execution(
                        reference,
                        header,
                        classloader,
                        view,
                        consensus,
                        gas_model,
                        consumed,
                        cause_of(&error),
                        method_failed,
                    )
                }
            }
        }
        Err(error) => {
            let consumed = gas_triple(&execution.ctx.gas);
            failed_execution(
                reference,
                header,
                classloader,
                view,
                consensus,
                gas_model,
                consumed,
                cause_of(&error),
                method_failed,
            )
        }
    }
}

fn method_failed(
    cause: crate::types::responses::FailureCause,
    updates: Vec<crate::types::updates::Update>,
    gas: crate::types::responses::GasCosts,
    penalty: BigInt,
) -> TransactionResponse {
    TransactionResponse::MethodFailed(MethodCallTransactionFailedResponse {
        cause,
        updates,
        gas,
        penalty,
    })
}

/// A view execution must not affect anything beyond the caller's nonce
/// and balance.
fn check_view(
    execution: &mut PaidExecution<'_>,
    roots: &[usize],
    is_view: bool,
    caller: StorageReference,
) -> Result<(), VmError> {
    if !is_view {
        return Ok(());
    }
    let mut roots = roots.to_vec();
    for event in &execution.ctx.events {
        if !roots.contains(event) {
            roots.push(*event);
        }
    }
    let updates = crate::extraction::extract_updates(&execution.ctx, &roots)?;
    if only_caller_accounting(&updates, &caller) {
        Ok(())
    } else {
        Err(VmError::thrown(
            SIDE_EFFECTS_IN_VIEW_ERROR,
            "the view method produced observable side effects",
            "view validation",
        ))
    }
}

fn run_method(
    execution: &mut PaidExecution<'_>,
    spec: &CallSpec<'_>,
    view_run: bool,
) -> Result<(CallOutcome, Method, Vec<usize>), VmError> {
    let caller = execution.caller;
    let ctx = &mut execution.ctx;

    let mut actuals = Vec::with_capacity(spec.actuals.len());
    for actual in spec.actuals {
        actuals.push(value_to_runtime(ctx, actual)?);
    }

    let mut roots = vec![caller];
    for actual in &actuals {
        if let RtValue::Object(index) = actual {
            roots.push(*index);
        }
    }

    let (defining_class, resolved, arguments, receiver_index) = match spec.receiver {
        Some(receiver) => {
            let receiver_index = deserialize(ctx, receiver)?;
            roots.push(receiver_index);
            let runtime_class = ctx.object(receiver_index).class.clone();
            resolve_call(ctx, &runtime_class, &spec.method, actuals, caller)?
                .map(|(class, method, args)| (class, method, args, Some(receiver_index)))
                .ok_or_else(|| {
                    VmError::thrown(
                        NO_SUCH_METHOD_ERROR,
                        format!("method {} cannot be found", spec.method),
                        "method call",
                    )
                })?
        }
        None => resolve_call(ctx, &spec.method.defining_class, &spec.method, actuals, caller)?
            .map(|(class, method, args)| (class, method, args, None))
            .ok_or_else(|| {
                VmError::thrown(
                    NO_SUCH_METHOD_ERROR,
                    format!("method {} cannot be found", spec.method),
                    "method call",
                )
            })?,
    };

    match spec.receiver {
        Some(_) if resolved.is_static => {
            return Err(VmError::thrown(
                NO_SUCH_METHOD_ERROR,
                "cannot call a static method through an instance call",
                "method call",
            ));
        }
        None if !resolved.is_static => {
            return Err(VmError::thrown(
                NO_SUCH_METHOD_ERROR,
                "cannot call an instance method through a static call",
                "method call",
            ));
        }
        _ => {}
    }

    if view_run && !resolved.view {
        return Err(VmError::thrown(
            NO_SUCH_METHOD_ERROR,
            "cannot run a method not annotated as view",
            "method call",
        ));
    }

    let invocation = invoke(ctx, &defining_class, &resolved, receiver_index, arguments, 0);
    match invocation {
        Ok(result) => {
            if let Some(RtValue::Object(index)) = &result {
                roots.push(*index);
            }
            Ok((CallOutcome::Returned(result), resolved, roots))
        }
        Err(VmError::Thrown { class, message, location })
            if resolved.throws_exceptions && resolved.throws.contains(&class) =>
        {
            Ok((
                CallOutcome::DeclaredException { class, message, location },
                resolved,
                roots,
            ))
        }
        Err(error) => Err(error),
    }
}

/// Call resolution: the exact declared signature wins; otherwise the
/// from-contract variant with the trailing caller and dummy is tried.
#[allow(clippy::type_complexity)]
fn resolve_call(
    ctx: &ExecutionContext<'_>,
    start_class: &str,
    method: &MethodSignature,
    actuals: Vec<RtValue>,
    caller: usize,
) -> Result<Option<(String, Method, Vec<RtValue>)>, VmError> {
    if let Some((defining, _, resolved)) = ctx
        .classloader
        .resolve_method(start_class, &method.name, &method.formals)
    {
        return Ok(Some((defining, resolved, actuals)));
    }
    let extended = from_contract_formals(&method.formals);
    if let Some((defining, _, resolved)) = ctx.classloader.resolve_method(start_class, &method.name, &extended) {
        let mut arguments = actuals;
        arguments.push(RtValue::Object(caller));
        arguments.push(RtValue::Int(0));
        return Ok(Some((defining, resolved, arguments)));
    }
    Ok(None)
}
