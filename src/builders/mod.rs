//! The transaction state machines. Each request kind has a builder with
//! the common skeleton: admission checks, pessimistic gas reservation,
//! body execution, storage charge and refund on success, penalty on
//! failure. Rejections escape as errors and are never committed; accepted
//! transactions always produce a response, successful or failed.

mod calls;
mod initial;
mod jar_store;

use std::sync::Arc;

use num_bigint::BigInt;
use tracing::warn;

use crate::caches::NodeCaches;
use crate::classloader::EngineClassLoader;
use crate::config::ConsensusParams;
use crate::deserialization::{deserialize, eager_state_of};
use crate::errors::{ChainError, ChainResult};
use crate::extraction::extract_updates;
use crate::gas::GasCostModel;
use crate::marshalling::Marshallable;
use crate::runtime::{ExecutionContext, GasMeter, VmError, OUT_OF_GAS_ERROR};
use crate::store::{StoreView, INFO_MANIFEST};
use crate::types::references::TransactionReference;
use crate::types::requests::{RequestHeader, TransactionRequest};
use crate::types::responses::{FailureCause, GasCosts, TransactionResponse};
use crate::types::updates::Update;
use crate::types::values::StorageValue;

pub use calls::{run_instance_method_call, run_static_method_call};

pub const SIDE_EFFECTS_IN_VIEW_ERROR: &str = "banyan.lang.SideEffectsInViewMethodException";
pub const ILLEGAL_STATE_ERROR: &str = "banyan.lang.IllegalStateError";

/// Builds the response for a request. A `TransactionRejected` error means
/// nothing may be written to the store; any other error is a store-level
/// fault that aborts the current commit.
pub fn build_response(
    reference: TransactionReference,
    request: &TransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    match request {
        TransactionRequest::InitialJarStore(r) => initial::initial_jar_store(r, view, consensus, gas_model),
        TransactionRequest::GameteCreation(r) => initial::gamete_creation(reference, r, view, caches),
        TransactionRequest::Initialization(r) => initial::initialization(r, view, caches),
        TransactionRequest::JarStore(r) => {
            jar_store::jar_store(reference, request, r, view, caches, consensus, gas_model)
        }
        TransactionRequest::ConstructorCall(r) => {
            calls::constructor_call(reference, request, r, view, caches, consensus, gas_model)
        }
        TransactionRequest::InstanceMethodCall(r) => {
            calls::instance_method_call(reference, request, r, view, caches, consensus, gas_model, false)
        }
        TransactionRequest::StaticMethodCall(r) => {
            calls::static_method_call(reference, request, r, view, caches, consensus, gas_model, false)
        }
        TransactionRequest::Transfer(r) => {
            calls::transfer(reference, request, r, view, caches, consensus, gas_model)
        }
    }
}

pub(crate) fn node_is_initialized(view: &dyn StoreView) -> ChainResult<bool> {
    Ok(view.info(INFO_MANIFEST)?.is_some())
}

pub(crate) fn gas_triple(gas: &GasMeter) -> GasCosts {
    GasCosts {
        cpu: gas.consumed_cpu().clone(),
        ram: gas.consumed_ram().clone(),
        storage: gas.consumed_storage().clone(),
    }
}

/// The admission checks common to all non-initial requests. Returns the
/// classloader of the request's classpath.
#[allow(clippy::too_many_arguments)]
pub(crate) fn admit(
    reference: TransactionReference,
    request: &TransactionRequest,
    header: &RequestHeader,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    skip_signature: bool,
    skip_nonce: bool,
) -> ChainResult<Arc<EngineClassLoader>> {
    let classloader = caches.classloader_at(header.classpath, view)?;

    let caller_state = eager_state_of(view, &header.caller)?;
    let (caller_class, _) = caches
        .class_tag_at(header.caller, view)?
        .ok_or_else(|| ChainError::rejected(format!("unknown caller {}", header.caller)))?;
    if !classloader.is_externally_owned_account(&caller_class) {
        return Err(ChainError::rejected("the caller is not an externally owned account"));
    }

    if header.chain_id != consensus.chain_id {
        return Err(ChainError::rejected(format!(
            "incorrect chain id: the request is for {}, this node runs {}",
            header.chain_id, consensus.chain_id
        )));
    }

    if !skip_nonce {
        let current_nonce = caller_state
            .get(&crate::base_library::nonce_field())
            .and_then(StorageValue::as_big_integer)
            .cloned()
            .unwrap_or_else(|| BigInt::from(0));
        if current_nonce != header.nonce {
            return Err(ChainError::rejected(format!(
                "incorrect nonce: the request has {}, the caller expects {current_nonce}",
                header.nonce
            )));
        }
    }

    if !skip_signature {
        let public_key = match caller_state.get(&crate::base_library::public_key_field()) {
            Some(StorageValue::String(key)) => key.clone(),
            _ => return Err(ChainError::rejected("the caller has no public key")),
        };
        let message = request.to_bytes_without_signature();
        let signature = request.signature().unwrap_or(&[]);
        if !caches.signature_is_valid(reference, &public_key, consensus.signature, &message, signature)? {
            return Err(ChainError::rejected("invalid request signature"));
        }
    }

    let minimum = gas_model.minimum_gas_for_request(request.to_bytes().len());
    if header.gas_limit < minimum {
        return Err(ChainError::rejected(format!(
            "not enough gas to start the transaction: at least {minimum} units are needed"
        )));
    }

    if !consensus.ignore_gas_price && header.gas_price < consensus.gas_price {
        return Err(ChainError::rejected(format!(
            "the gas price of the request is smaller than the current gas price ({})",
            consensus.gas_price
        )));
    }

    let balance = caller_state
        .get(&crate::base_library::balance_field())
        .and_then(StorageValue::as_big_integer)
        .cloned()
        .unwrap_or_else(|| BigInt::from(0));
    if balance < &header.gas_limit * &header.gas_price {
        return Err(ChainError::rejected(
            "the caller has not enough funds to buy the promised amount of gas",
        ));
    }

    Ok(classloader)
}

/// A paid execution in progress: the caller is loaded, the full gas cost
/// is already withdrawn from its balance and its nonce is bumped.
pub(crate) struct PaidExecution<'a> {
    pub ctx: ExecutionContext<'a>,
    pub caller: usize,
    pub gas_limit: BigInt,
    pub gas_price: BigInt,
}

impl<'a> PaidExecution<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        reference: TransactionReference,
        request: &TransactionRequest,
        header: &RequestHeader,
        classloader: Arc<EngineClassLoader>,
        view: &'a dyn StoreView,
        consensus: &ConsensusParams,
        gas_model: &'a GasCostModel,
    ) -> ChainResult<Self> {
        let mut ctx = ExecutionContext::new(
            classloader,
            view,
            gas_model,
            reference,
            header.gas_limit.clone(),
            consensus.allow_mint_burn_from_gamete,
        );
        let caller = deserialize(&mut ctx, header.caller)
            .map_err(|_| ChainError::rejected(format!("cannot load the caller {}", header.caller)))?;

        // the base cpu cost and the storage of the request are charged to
        // every transaction; admission guarantees they fit the gas limit
        ctx.gas
            .charge_cpu(gas_model.cpu_base_transaction_cost)
            .and_then(|()| {
                ctx.gas
                    .charge_storage(gas_model.storage_cost_of_bytes(request.to_bytes().len()))
            })
            .map_err(|_| ChainError::rejected("not enough gas to start the transaction"))?;

        let mut execution = Self {
            ctx,
            caller,
            gas_limit: header.gas_limit.clone(),
            gas_price: header.gas_price.clone(),
        };
        // pessimistic reservation: the whole promised gas is withdrawn
        // now and the unused part is given back on success
        let balance = execution.ctx.balance_of(caller);
        execution
            .ctx
            .set_balance(caller, balance - &execution.gas_limit * &execution.gas_price);
        execution.bump_nonce();
        Ok(execution)
    }

    fn bump_nonce(&mut self) {
        let nonce_field = crate::base_library::nonce_field();
        let current = self
            .ctx
            .object(self.caller)
            .fields
            .get(&nonce_field)
            .and_then(crate::runtime::RtValue::as_big_integer)
            .unwrap_or_else(|| BigInt::from(0));
        self.ctx
            .object_mut(self.caller)
            .fields
            .insert(nonce_field, crate::runtime::RtValue::BigInteger(current + 1));
    }

    /// Finishes a successful body: charges the storage of the response,
    /// refunds the unused gas to the caller and extracts the final
    /// updates. `make` assembles the response kind from the updates, the
    /// events and the consumed gas.
    pub fn succeed(
        &mut self,
        roots: &[usize],
        make: impl Fn(Vec<Update>, Vec<crate::types::references::StorageReference>, GasCosts) -> TransactionResponse,
    ) -> Result<TransactionResponse, VmError> {
        // events are storage objects too: their state commits with the
        // response even when nothing else reaches them
        let mut roots = roots.to_vec();
        for event in &self.ctx.events {
            if !roots.contains(event) {
                roots.push(*event);
            }
        }
        let roots = &roots[..];
        let updates = extract_updates(&self.ctx, roots)?;
        let events = self.ctx.event_references();
        let provisional = make(updates, events.clone(), gas_triple(&self.ctx.gas));
        self.ctx.gas.charge_storage(
            self.ctx
                .gas_model
                .storage_cost_of_bytes(provisional.to_bytes().len()),
        )?;

        let refund = self.ctx.gas.remaining().clone();
        let balance = self.ctx.balance_of(self.caller);
        self.ctx
            .set_balance(self.caller, balance + refund * &self.gas_price);

        let updates = extract_updates(&self.ctx, roots)?;
        Ok(make(updates, events, gas_triple(&self.ctx.gas)))
    }
}

/// Classification of a failed body.
pub(crate) fn cause_of(error: &VmError) -> FailureCause {
    match error {
        VmError::OutOfGas => FailureCause {
            class_of_cause: OUT_OF_GAS_ERROR.to_string(),
            message: "the transaction ran out of gas".to_string(),
            location: String::new(),
        },
        VmError::Thrown { class, message, location } => FailureCause {
            class_of_cause: class.clone(),
            message: message.clone(),
            location: location.clone(),
        },
        VmError::IllegalState(message) => FailureCause {
            class_of_cause: ILLEGAL_STATE_ERROR.to_string(),
            message: message.clone(),
            location: String::new(),
        },
        VmError::Chain(error) => FailureCause {
            class_of_cause: ILLEGAL_STATE_ERROR.to_string(),
            message: error.to_string(),
            location: String::new(),
        },
    }
}

/// The failure branch: the state of the body is discarded; the only
/// committed updates withdraw the whole promised gas from the caller and
/// bump its nonce. The unused gas becomes the penalty.
#[allow(clippy::too_many_arguments)]
pub(crate) fn failed_execution<'a>(
    reference: TransactionReference,
    header: &RequestHeader,
    classloader: Arc<EngineClassLoader>,
    view: &'a dyn StoreView,
    consensus: &ConsensusParams,
    gas_model: &'a GasCostModel,
    consumed: GasCosts,
    cause: FailureCause,
    make: impl Fn(FailureCause, Vec<Update>, GasCosts, BigInt) -> TransactionResponse,
) -> ChainResult<TransactionResponse> {
    warn!(reference = %reference, cause = %cause.class_of_cause, "transaction failed");

    let mut ctx = ExecutionContext::new(
        classloader,
        view,
        gas_model,
        reference,
        header.gas_limit.clone(),
        consensus.allow_mint_burn_from_gamete,
    );
    let caller = deserialize(&mut ctx, header.caller)
        .map_err(|_| ChainError::rejected(format!("cannot load the caller {}", header.caller)))?;

    let balance = ctx.balance_of(caller);
    ctx.set_balance(caller, balance - &header.gas_limit * &header.gas_price);
    let nonce_field = crate::base_library::nonce_field();
    let nonce = ctx
        .object(caller)
        .fields
        .get(&nonce_field)
        .and_then(crate::runtime::RtValue::as_big_integer)
        .unwrap_or_else(|| BigInt::from(0));
    ctx.object_mut(caller)
        .fields
        .insert(nonce_field, crate::runtime::RtValue::BigInteger(nonce + 1));

    let updates = extract_updates(&ctx, &[caller]).map_err(|error| match error {
        VmError::Chain(error) => error,
        other => ChainError::Node(format!("cannot account the failed transaction: {}", cause_of(&other).message)),
    })?;

    let penalty = &header.gas_limit - consumed.total();
    Ok(make(cause, updates, consumed, penalty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_gas_is_never_a_code_level_exception() {
        let cause = cause_of(&VmError::OutOfGas);
        assert_eq!(cause.class_of_cause, OUT_OF_GAS_ERROR);
    }
}
