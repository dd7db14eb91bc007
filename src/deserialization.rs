//! Rehydration of storage objects from their histories. The scan walks a
//! history newest-to-oldest, keeping the first update seen per field (the
//! latest one) until the class tag is found in the creating transaction.
//! Objects are materialized into the arena of the execution context, which
//! guarantees one live object per storage reference; lazy fields stay
//! unresolved until first access.

use std::collections::BTreeMap;

use crate::errors::{ChainError, ChainResult};
use crate::runtime::{ExecutionContext, ObjectState, RtValue, VmError, VmResult, DESERIALIZATION_ERROR};
use crate::store::StoreView;
use crate::types::references::{StorageReference, TransactionReference};
use crate::types::signatures::FieldSignature;
use crate::types::updates::Update;
use crate::types::values::StorageValue;

/// Rehydrates the object at the given reference, returning its arena
/// index. Equal references return the same index within one transaction.
pub fn deserialize(ctx: &mut ExecutionContext<'_>, reference: StorageReference) -> VmResult<usize> {
    if let Some(index) = ctx.index_of(&reference) {
        return Ok(index);
    }

    let history = ctx.store.history_of(&reference)?;
    if history.is_empty() {
        return Err(VmError::thrown(
            DESERIALIZATION_ERROR,
            format!("{reference} is not an object in store"),
            "deserialize",
        ));
    }

    let mut fields: BTreeMap<FieldSignature, RtValue> = BTreeMap::new();
    let mut class_tag: Option<(String, TransactionReference)> = None;
    'history: for transaction in &history {
        let response = ctx.store.response_of(transaction)?.ok_or_else(|| {
            VmError::from(ChainError::UnknownReference(format!(
                "history of {reference} mentions the uncommitted transaction {transaction}"
            )))
        })?;
        for update in response.updates() {
            if update.object() != reference {
                continue;
            }
            match update {
                Update::ClassTag { class, jar, .. } => {
                    class_tag = Some((class.clone(), *jar));
                }
                _ if update.is_eager() => {
                    let field = update.field().expect("field updates carry a signature");
                    let value = update.value().expect("field updates carry a value");
                    fields
                        .entry(field)
                        .or_insert_with(|| eager_value_to_runtime(&value));
                }
                _ => {}
            }
        }
        if class_tag.is_some() {
            // the class tag lives in the creating transaction, the last
            // one of the history: nothing older can exist
            break 'history;
        }
    }

    let (class, jar) = class_tag.ok_or_else(|| {
        VmError::thrown(
            DESERIALIZATION_ERROR,
            format!("no class tag found in the history of {reference}"),
            "deserialize",
        )
    })?;

    let old_fields = fields.clone();
    Ok(ctx.adopt(ObjectState {
        reference,
        class,
        jar,
        fields,
        old_fields,
        in_storage: true,
    }))
}

/// Loads the latest value of a lazy field of an object, on first access.
/// The loaded value is recorded both as current and as old image, so that
/// a mere read never produces an update.
pub fn deserialize_last_lazy_update_for(
    ctx: &mut ExecutionContext<'_>,
    object_index: usize,
    field: &FieldSignature,
) -> VmResult<RtValue> {
    let reference = ctx.object(object_index).reference;
    let history = ctx.store.history_of(&reference)?;
    let mut found: Option<StorageValue> = None;
    'history: for transaction in &history {
        let response = ctx.store.response_of(transaction)?.ok_or_else(|| {
            VmError::from(ChainError::UnknownReference(format!(
                "history of {reference} mentions the uncommitted transaction {transaction}"
            )))
        })?;
        for update in response.updates() {
            if update.object() == reference && update.field().as_ref() == Some(field) {
                found = update.value();
                break 'history;
            }
        }
    }

    let value = match found {
        None => RtValue::Null,
        Some(StorageValue::Reference(target)) => RtValue::Object(deserialize(ctx, target)?),
        Some(value) => eager_value_to_runtime(&value),
    };
    let object = ctx.object_mut(object_index);
    object.fields.insert(field.clone(), value.clone());
    object.old_fields.insert(field.clone(), value.clone());
    Ok(value)
}

/// Converts a request actual into a runtime value, rehydrating references.
pub fn value_to_runtime(ctx: &mut ExecutionContext<'_>, value: &StorageValue) -> VmResult<RtValue> {
    match value {
        StorageValue::Reference(reference) => Ok(RtValue::Object(deserialize(ctx, *reference)?)),
        other => Ok(eager_value_to_runtime(other)),
    }
}

/// Converts a runtime value into a storage value for responses.
pub fn runtime_to_storage(ctx: &ExecutionContext<'_>, value: &RtValue) -> StorageValue {
    match value {
        RtValue::Boolean(v) => StorageValue::Boolean(*v),
        RtValue::Byte(v) => StorageValue::Byte(*v),
        RtValue::Char(v) => StorageValue::Char(*v),
        RtValue::Short(v) => StorageValue::Short(*v),
        RtValue::Int(v) => StorageValue::Int(*v),
        RtValue::Long(v) => StorageValue::Long(*v),
        RtValue::Float(v) => StorageValue::Float(*v),
        RtValue::Double(v) => StorageValue::Double(*v),
        RtValue::BigInteger(v) => StorageValue::BigInteger(v.clone()),
        RtValue::String(v) => StorageValue::String(v.clone()),
        RtValue::Enum { class, name } => StorageValue::Enum {
            class: class.clone(),
            name: name.clone(),
        },
        RtValue::Null => StorageValue::Null,
        RtValue::Object(index) => StorageValue::Reference(ctx.object(*index).reference),
    }
}

fn eager_value_to_runtime(value: &StorageValue) -> RtValue {
    match value {
        StorageValue::Boolean(v) => RtValue::Boolean(*v),
        StorageValue::Byte(v) => RtValue::Byte(*v),
        StorageValue::Char(v) => RtValue::Char(*v),
        StorageValue::Short(v) => RtValue::Short(*v),
        StorageValue::Int(v) => RtValue::Int(*v),
        StorageValue::Long(v) => RtValue::Long(*v),
        StorageValue::Float(v) => RtValue::Float(*v),
        StorageValue::Double(v) => RtValue::Double(*v),
        StorageValue::BigInteger(v) => RtValue::BigInteger(v.clone()),
        StorageValue::String(v) => RtValue::String(v.clone()),
        StorageValue::Enum { class, name } => RtValue::Enum {
            class: class.clone(),
            name: name.clone(),
        },
        StorageValue::Null => RtValue::Null,
        StorageValue::Reference(_) => RtValue::Null,
    }
}

/// The latest eager field values of an object, straight from store.
/// Used by admission checks (nonce, public key, balance) that run before
/// any execution context exists.
pub fn eager_state_of(
    view: &dyn StoreView,
    reference: &StorageReference,
) -> ChainResult<BTreeMap<FieldSignature, StorageValue>> {
    let mut fields = BTreeMap::new();
    for transaction in view.history_of(reference)? {
        let Some(response) = view.response_of(&transaction)? else {
            continue;
        };
        let mut found_tag = false;
        for update in response.updates() {
            if update.object() != *reference {
                continue;
            }
            if update.is_class_tag() {
                found_tag = true;
            } else if update.is_eager() {
                if let (Some(field), Some(value)) = (update.field(), update.value()) {
                    fields.entry(field).or_insert(value);
                }
            }
        }
        if found_tag {
            break;
        }
    }
    Ok(fields)
}

/// The class tag of an object in store, if any.
pub fn class_tag_of(
    view: &dyn StoreView,
    reference: &StorageReference,
) -> ChainResult<Option<(String, TransactionReference)>> {
    for transaction in view.history_of(reference)? {
        let Some(response) = view.response_of(&transaction)? else {
            continue;
        };
        for update in response.updates() {
            if let Update::ClassTag { object, class, jar } = update {
                if object == reference {
                    return Ok(Some((class.clone(), *jar)));
                }
            }
        }
    }
    Ok(None)
}

/// The full reconstructed state of an object: its class tag and the
/// latest update for each of its fields, eager and lazy.
pub fn state_of(view: &dyn StoreView, reference: &StorageReference) -> ChainResult<Vec<Update>> {
    let mut state: Vec<Update> = Vec::new();
    let mut seen_fields: Vec<FieldSignature> = Vec::new();
    let mut seen_tag = false;
    for transaction in view.history_of(reference)? {
        let Some(response) = view.response_of(&transaction)? else {
            continue;
        };
        for update in response.updates() {
            if update.object() != *reference {
                continue;
            }
            match update.field() {
                None => {
                    if !seen_tag {
                        seen_tag = true;
                        state.push(update.clone());
                    }
                }
                Some(field) => {
                    if !seen_fields.contains(&field) {
                        seen_fields.push(field);
                        state.push(update.clone());
                    }
                }
            }
        }
        if seen_tag {
            break;
        }
    }
    if state.is_empty() {
        return Err(ChainError::UnknownReference(format!("{reference} has no state in store")));
    }
    Ok(state)
}
