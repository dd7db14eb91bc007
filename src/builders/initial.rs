//! Builders of the initial transactions: the installation of the base
//! module, the creation of the gamete and the initialization marker.
//! They consume no gas and are admissible only before the node is
//! initialized.

use num_bigint::BigInt;
use num_traits::Signed;

use crate::base_library::{
    balance_field, nonce_field, public_key_field, red_balance_field, GAMETE_CLASS,
};
use crate::caches::NodeCaches;
use crate::classloader::EngineClassLoader;
use crate::config::ConsensusParams;
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasCostModel;
use crate::instrumentation::instrument;
use crate::marshalling::Marshallable;
use crate::store::{StoreView, INFO_GAMETE};
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::requests::{
    GameteCreationTransactionRequest, InitialJarStoreTransactionRequest, InitializationTransactionRequest,
};
use crate::types::responses::{
    GameteCreationTransactionResponse, InitializationTransactionResponse, JarStoreInitialTransactionResponse,
    TransactionResponse,
};
use crate::types::updates::Update;
use crate::types::values::StorageValue;
use crate::verification::Verifier;
use crate::whitelisting::WhiteListingWizard;

use super::node_is_initialized;

pub(super) fn initial_jar_store(
    request: &InitialJarStoreTransactionRequest,
    view: &dyn StoreView,
    consensus: &ConsensusParams,
    gas_model: &GasCostModel,
) -> ChainResult<TransactionResponse> {
    if node_is_initialized(view)? {
        return Err(ChainError::rejected("cannot run an initial transaction on an initialized node"));
    }

    let dependencies_loader = if request.dependencies.is_empty() {
        None
    } else {
        Some(EngineClassLoader::from_roots(&request.dependencies, view)?)
    };

    let module = crate::bytecode::Module::from_bytes(&request.jar)
        .map_err(|err| ChainError::rejected(format!("the uploaded module is malformed: {err}")))?;

    let wizard = WhiteListingWizard::new();
    let verified = Verifier::new(
        &module,
        dependencies_loader.as_ref(),
        &wizard,
        consensus.allows_self_charged,
        true,
    )
    .verify()
    .map_err(|errors| {
        ChainError::rejected(format!("the uploaded module does not verify: {}", errors[0]))
    })?;

    let instrumented = instrument(&verified, dependencies_loader.as_ref(), gas_model);
    Ok(TransactionResponse::JarStoreInitial(JarStoreInitialTransactionResponse {
        instrumented_jar: instrumented.to_bytes(),
        dependencies: request.dependencies.clone(),
    }))
}

pub(super) fn gamete_creation(
    reference: TransactionReference,
    request: &GameteCreationTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
) -> ChainResult<TransactionResponse> {
    if node_is_initialized(view)? {
        return Err(ChainError::rejected("cannot run an initial transaction on an initialized node"));
    }
    if view.info(INFO_GAMETE)?.is_some() {
        return Err(ChainError::rejected("the gamete already exists"));
    }
    if request.initial_amount.is_negative() || request.red_initial_amount.is_negative() {
        return Err(ChainError::rejected("the initial supplies cannot be negative"));
    }
    if request.public_key.is_empty() {
        return Err(ChainError::rejected("the gamete needs a public key"));
    }

    let classloader = caches.classloader_at(request.classpath, view)?;
    let jar = classloader
        .jar_of(GAMETE_CLASS)
        .ok_or_else(|| ChainError::rejected("the classpath does not contain the account classes"))?;

    let gamete = StorageReference::new(reference, 0);
    let updates = vec![
        Update::ClassTag {
            object: gamete,
            class: GAMETE_CLASS.to_string(),
            jar,
        },
        Update::Balance {
            object: gamete,
            balance: request.initial_amount.clone(),
        },
        Update::RedBalance {
            object: gamete,
            balance: request.red_initial_amount.clone(),
        },
        Update::Field {
            object: gamete,
            field: nonce_field(),
            value: StorageValue::BigInteger(BigInt::from(0)),
        },
        Update::Field {
            object: gamete,
            field: public_key_field(),
            value: StorageValue::String(request.public_key.clone()),
        },
    ];
    debug_assert_eq!(updates[1].field(), Some(balance_field()));
    debug_assert_eq!(updates[2].field(), Some(red_balance_field()));

    Ok(TransactionResponse::GameteCreation(GameteCreationTransactionResponse {
        updates,
        gamete,
    }))
}

pub(super) fn initialization(
    request: &InitializationTransactionRequest,
    view: &dyn StoreView,
    caches: &NodeCaches,
) -> ChainResult<TransactionResponse> {
    if node_is_initialized(view)? {
        return Err(ChainError::rejected("the node is already initialized"));
    }
    caches
        .classloader_at(request.classpath, view)?
        .load_class(crate::base_library::MANIFEST_CLASS)?;
    let manifest_class = caches
        .class_tag_at(request.manifest, view)?
        .ok_or_else(|| ChainError::rejected("the manifest is not an object in store"))?
        .0;
    if manifest_class != crate::base_library::MANIFEST_CLASS {
        return Err(ChainError::rejected("the manifest has the wrong class"));
    }
    Ok(TransactionResponse::Initialization(InitializationTransactionResponse {}))
}
