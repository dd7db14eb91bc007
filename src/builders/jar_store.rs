//! Builder of the paid module installations: verification and
//! instrumentation under gas accounting. The response carries the
//! instrumented bytes, so every node materializes the same artifact.

use crate::caches::NodeCaches;
use crate::classloader::EngineClassLoader;
use crate::config::ConsensusParams;
use crate::errors::ChainResult;
use crate::gas::GasCostModel;
use crate::instrumentation::instrument;
use crate::marshalling::Marshallable;
use crate::runtime::VmError;
use crate::store::StoreView;
use crate::types::references::TransactionReference;
use crate::types::requests::{JarStoreTransactionRequest, TransactionRequest};
use crate::types::responses::{
    FailureCause, JarStoreTransactionFailedResponse, JarStoreTransactionSuccessfulResponse, TransactionResponse,
};
use crate::verification::Verifier;
use crate::whitelisting::WhiteListingWizard;

use super::{admit, cause_of, failed_execution, gas_triple, PaidExecution};

#[allow(clippy::too_many_arguments)]
pub(super) fn jar_store(
    reference: TransactionReference,
    request: &TransactionRequest,
    jar_request: &JarStoreTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    let header = &jar_request.header;
    let classloader = admit(
        reference, request, header, view, caches, consensus, gas_model, false, false,
    )?;

    // the declared dependencies must already be installed (their absence
    // also guarantees the dependency relation respects the commit order)
    let dependencies_loader = if jar_request.dependencies.is_empty() {
        None
    } else {
        Some(EngineClassLoader::from_roots(&jar_request.dependencies, view)?)
    };

    let mut execution = PaidExecution::begin(
        reference,
        request,
        header,
        classloader.clone(),
        view,
        consensus,
        gas_model,
    )?;

    let body = (|| -> Result<Vec<u8>, VmError> {
        // installation costs cpu linear in the module size and ram for
        // the instrumentation working set
        execution.ctx.gas.charge_cpu(gas_model.cpu_cost_of_jar(jar_request.jar.len()))?;
        execution.ctx.gas.charge_ram(jar_request.jar.len() as u64)?;

        let module = crate::bytecode::Module::from_bytes(&jar_request.jar).map_err(|err| {
            VmError::thrown(
                "banyan.lang.ModuleFormatError",
                format!("the uploaded module is malformed: {err}"),
                "jar store",
            )
        })?;

        let wizard = WhiteListingWizard::new();
        let verified = Verifier::new(
            &module,
            dependencies_loader.as_ref(),
            &wizard,
            consensus.allows_self_charged,
            false,
        )
        .verify()
        .map_err(|errors| {
            let first = &errors[0];
            VmError::thrown(&first.error_class, first.message.clone(), first.location.clone())
        })?;

        let instrumented = instrument(&verified, dependencies_loader.as_ref(), gas_model);
        Ok(instrumented.to_bytes())
    })();

    match body {
        Ok(instrumented_jar) => {
            let caller = execution.caller;
            let dependencies = jar_request.dependencies.clone();
            let result = execution.succeed(&[caller], move |updates, _events, gas| {
                TransactionResponse::JarStoreSuccessful(JarStoreTransactionSuccessfulResponse {
                    instrumented_jar: instrumented_jar.clone(),
                    dependencies: dependencies.clone(),
                    updates,
                    gas,
                })
            });
            match result {
                Ok(response) => Ok(response),
                Err(error) => {
                    let consumed = gas_triple(&execution.ctx.gas);
                    fail(
                        reference, jar_request, classloader, view, consensus, gas_model, consumed,
                        cause_of(&error),
                    )
                }
            }
        }
        Err(error) => {
            let consumed = gas_triple(&execution.ctx.gas);
            let cause = cause_of(&error);
            fail(reference, jar_request, classloader, view, consensus, gas_model, consumed, cause)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fail(
    reference: TransactionReference,
    jar_request: &JarStoreTransactionRequest,
    classloader: std::sync::Arc<EngineClassLoader>,
    view: &dyn StoreView,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
    consumed: crate::types::responses::GasCosts,
    cause: FailureCause,
) -> ChainResult<TransactionResponse> {
    failed_execution(
        reference,
        &jar_request.header,
        classloader,
        view,
        consensus,
        gas_model,
        consumed,
        cause,
        |cause, updates, gas, penalty| {
            TransactionResponse::JarStoreFailed(JarStoreTransactionFailedResponse {
                cause,
                updates,
                gas,
                penalty,
            })
        },
    )
}
