//! Extraction of the updates committed by a successful transaction body:
//! a breadth-first walk of the objects reachable from the roots (caller,
//! receiver, actuals, result), emitting one update per field whose current
//! value differs from its image at load time, plus a class tag for every
//! object created by the transaction. Updates are sorted canonically:
//! object first, class tags before fields, then defining class in
//! superclass order, field name and type.

use std::collections::HashSet;

use crate::base_library::{balance_field, red_balance_field};
use crate::runtime::{ExecutionContext, RtValue, VmResult};
use crate::types::references::StorageReference;
use crate::types::signatures::FieldSignature;
use crate::types::updates::Update;
use crate::types::values::StorageValue;

pub fn extract_updates(ctx: &ExecutionContext<'_>, roots: &[usize]) -> VmResult<Vec<Update>> {
    let mut updates = Vec::new();
    let mut seen: HashSet<usize> = HashSet::new();
    let mut work: Vec<usize> = Vec::new();
    for root in roots {
        if seen.insert(*root) {
            work.push(*root);
        }
    }

    while let Some(index) = work.pop() {
        let object = ctx.object(index);

        if !object.in_storage {
            updates.push(Update::ClassTag {
                object: object.reference,
                class: object.class.clone(),
                jar: object.jar,
            });
        }

        for signature in ctx.classloader.storage_fields_of(&object.class) {
            let current = object.fields.get(&signature);
            let old = object.old_fields.get(&signature);

            // a lazy field never touched by this transaction is absent on
            // both sides and cannot have changed
            let Some(current) = current else {
                continue;
            };

            if !object.in_storage || old != Some(current) {
                updates.push(update_for(ctx, object.reference, &signature, current)?);
                if let RtValue::Object(target) = current {
                    if seen.insert(*target) {
                        work.push(*target);
                    }
                }
            }

            // the objects reachable through the old value of a lazy field
            // may have been mutated as well
            if object.in_storage && !signature.field_type.is_eager() {
                if let Some(RtValue::Object(target)) = old {
                    if seen.insert(*target) {
                        work.push(*target);
                    }
                }
            }
        }
    }

    canonical_sort(ctx, &mut updates);
    Ok(updates)
}

fn update_for(
    ctx: &ExecutionContext<'_>,
    object: StorageReference,
    signature: &FieldSignature,
    value: &RtValue,
) -> VmResult<Update> {
    Ok(match value {
        RtValue::Null => Update::ToNull {
            object,
            field: signature.clone(),
            eager: signature.field_type.is_eager(),
        },
        RtValue::Object(index) => Update::Field {
            object,
            field: signature.clone(),
            value: StorageValue::Reference(ctx.object(*index).reference),
        },
        RtValue::BigInteger(balance) if *signature == balance_field() => Update::Balance {
            object,
            balance: balance.clone(),
        },
        RtValue::BigInteger(balance) if *signature == red_balance_field() => Update::RedBalance {
            object,
            balance: balance.clone(),
        },
        RtValue::Boolean(v) => field_update(object, signature, StorageValue::Boolean(*v)),
        RtValue::Byte(v) => field_update(object, signature, StorageValue::Byte(*v)),
        RtValue::Char(v) => field_update(object, signature, StorageValue::Char(*v)),
        RtValue::Short(v) => field_update(object, signature, StorageValue::Short(*v)),
        RtValue::Int(v) => field_update(object, signature, StorageValue::Int(*v)),
        RtValue::Long(v) => field_update(object, signature, StorageValue::Long(*v)),
        RtValue::Float(v) => field_update(object, signature, StorageValue::Float(*v)),
        RtValue::Double(v) => field_update(object, signature, StorageValue::Double(*v)),
        RtValue::BigInteger(v) => field_update(object, signature, StorageValue::BigInteger(v.clone())),
        RtValue::String(v) => field_update(object, signature, StorageValue::String(v.clone())),
        RtValue::Enum { class, name } => field_update(
            object,
            signature,
            StorageValue::Enum {
                class: class.clone(),
                name: name.clone(),
            },
        ),
    })
}

fn field_update(object: StorageReference, signature: &FieldSignature, value: StorageValue) -> Update {
    Update::Field {
        object,
        field: signature.clone(),
        value,
    }
}

/// Sorts updates by object, then class tags first, then the canonical
/// field order: defining class superclass-first within the hierarchy of
/// the object's runtime class, then field name, then field type.
pub fn canonical_sort(ctx: &ExecutionContext<'_>, updates: &mut [Update]) {
    updates.sort_by(|a, b| {
        a.object()
            .cmp(&b.object())
            .then_with(|| a.field().is_some().cmp(&b.field().is_some()))
            .then_with(|| match (a.field(), b.field()) {
                (Some(field_a), Some(field_b)) => {
                    let runtime_class = ctx
                        .index_of(&a.object())
                        .map(|index| ctx.object(index).class.clone())
                        .unwrap_or_default();
                    let rank_a = ctx.classloader.class_rank(&field_a.defining_class, &runtime_class);
                    let rank_b = ctx.classloader.class_rank(&field_b.defining_class, &runtime_class);
                    rank_a
                        .cmp(&rank_b)
                        .then_with(|| field_a.name.cmp(&field_b.name))
                        .then_with(|| field_a.field_type.cmp(&field_b.field_type))
                }
                _ => std::cmp::Ordering::Equal,
            })
    });
}

/// True when the updates affect nothing but the caller's nonce and
/// balances: the only effects a view call may have.
pub fn only_caller_accounting(updates: &[Update], caller: &StorageReference) -> bool {
    updates.iter().all(|update| {
        update.object() == *caller
            && match update.field() {
                None => false,
                Some(field) => {
                    field == crate::base_library::nonce_field()
                        || field == balance_field()
                        || field == red_balance_field()
                }
            }
    })
}

// the extractor is exercised end-to-end by the engine tests; the unit
// tests here pin the canonical shapes
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::references::TransactionReference;
    use crate::types::storage_types::StorageType;
    use num_bigint::BigInt;

    #[test]
    fn balance_updates_take_the_compact_shape() {
        let object = StorageReference::new(TransactionReference::new([1u8; 32]), 0);
        let update = Update::Balance {
            object,
            balance: BigInt::from(100),
        };
        assert_eq!(update.field(), Some(balance_field()));
        assert!(update.is_eager());
    }

    #[test]
    fn view_allow_list_accepts_only_caller_accounting() {
        let caller = StorageReference::new(TransactionReference::new([1u8; 32]), 0);
        let other = StorageReference::new(TransactionReference::new([2u8; 32]), 0);
        let accounting = vec![
            Update::Balance {
                object: caller,
                balance: BigInt::from(5),
            },
            Update::Field {
                object: caller,
                field: crate::base_library::nonce_field(),
                value: StorageValue::BigInteger(BigInt::from(1)),
            },
        ];
        assert!(only_caller_accounting(&accounting, &caller));

        let with_foreign_effect = vec![Update::Field {
            object: other,
            field: FieldSignature::new("demo.C", "x", StorageType::Int),
            value: StorageValue::Int(1),
        }];
        assert!(!only_caller_accounting(&with_foreign_effect, &caller));
    }
}
