//! The per-transaction class loader: resolves a classpath transaction
//! reference to the set of classes visible under it, following the
//! dependencies of the installed modules breadth-first. Dependencies act
//! as parents: their classes win over later definitions, as in delegating
//! loader chains. The loader owns its scratch directory and dies with the
//! transaction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use crate::base_library::{CONTRACT_CLASS, EOA_CLASS, EVENT_CLASS, STORAGE_CLASS};
use crate::bytecode::{Class, Method, Module};
use crate::errors::{ChainError, ChainResult};
use crate::marshalling::Marshallable;
use crate::store::StoreView;
use crate::types::references::TransactionReference;
use crate::types::signatures::FieldSignature;
use crate::types::storage_types::StorageType;

pub struct LoadedClass {
    pub class: Arc<Class>,
    /// The module installation that defined this class.
    pub jar: TransactionReference,
}

pub struct EngineClassLoader {
    classpath: TransactionReference,
    jars: Vec<TransactionReference>,
    classes: HashMap<String, LoadedClass>,
    _scratch: TempDir,
}

impl EngineClassLoader {
    pub fn new(classpath: TransactionReference, view: &dyn StoreView) -> ChainResult<Self> {
        Self::from_roots(&[classpath], view)
    }

    /// Builds a loader over several root installations; used to verify a
    /// new module against its declared dependencies.
    pub fn from_roots(roots: &[TransactionReference], view: &dyn StoreView) -> ChainResult<Self> {
        let classpath = *roots
            .first()
            .ok_or_else(|| ChainError::rejected("a classpath needs at least one module installation"))?;
        let scratch = TempDir::new()?;

        // breadth-first over the dependencies, de-duplicating
        let mut order: Vec<(TransactionReference, Module)> = Vec::new();
        let mut seen: HashSet<TransactionReference> = HashSet::new();
        let mut queue: VecDeque<TransactionReference> = VecDeque::new();
        for root in roots {
            if seen.insert(*root) {
                queue.push_back(*root);
            }
        }
        while let Some(jar_reference) = queue.pop_front() {
            let response = view.response_of(&jar_reference)?.ok_or_else(|| {
                ChainError::rejected(format!("unknown classpath {jar_reference}"))
            })?;
            let (jar_bytes, dependencies) = response.installed_jar().ok_or_else(|| {
                ChainError::rejected(format!(
                    "classpath {jar_reference} does not point to a successful module installation"
                ))
            })?;
            fs::write(scratch.path().join(format!("{}.jar", order.len())), jar_bytes)?;
            order.push((jar_reference, Module::from_bytes(jar_bytes)?));
            for dependency in dependencies {
                if seen.insert(*dependency) {
                    queue.push_back(*dependency);
                }
            }
        }

        // parents answer first: definitions from deeper dependencies win
        // over redefinitions closer to the classpath
        let mut classes: HashMap<String, LoadedClass> = HashMap::new();
        for (jar_reference, module) in order.iter() {
            for class in &module.classes {
                classes.insert(
                    class.name.clone(),
                    LoadedClass {
                        class: Arc::new(class.clone()),
                        jar: *jar_reference,
                    },
                );
            }
        }

        Ok(Self {
            classpath,
            jars: order.into_iter().map(|(reference, _)| reference).collect(),
            classes,
            _scratch: scratch,
        })
    }

    pub fn classpath(&self) -> TransactionReference {
        self.classpath
    }

    /// The jars visible under this classpath, breadth-first from the
    /// classpath itself.
    pub fn jars(&self) -> &[TransactionReference] {
        &self.jars
    }

    pub fn class(&self, name: &str) -> Option<&LoadedClass> {
        self.classes.get(name)
    }

    pub fn load_class(&self, name: &str) -> ChainResult<&LoadedClass> {
        self.class(name)
            .ok_or_else(|| ChainError::rejected(format!("class {name} not found in classpath")))
    }

    pub fn jar_of(&self, class_name: &str) -> Option<TransactionReference> {
        self.classes.get(class_name).map(|loaded| loaded.jar)
    }

    pub fn is_subclass_of(&self, class_name: &str, superclass: &str) -> bool {
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            if name == superclass {
                return true;
            }
            cursor = self
                .classes
                .get(&name)
                .and_then(|loaded| loaded.class.superclass.clone());
        }
        false
    }

    pub fn is_storage_class(&self, class_name: &str) -> bool {
        self.is_subclass_of(class_name, STORAGE_CLASS)
    }

    pub fn is_contract_class(&self, class_name: &str) -> bool {
        self.is_subclass_of(class_name, CONTRACT_CLASS)
    }

    pub fn is_externally_owned_account(&self, class_name: &str) -> bool {
        self.is_subclass_of(class_name, EOA_CLASS)
    }

    pub fn is_event_class(&self, class_name: &str) -> bool {
        self.is_subclass_of(class_name, EVENT_CLASS)
    }

    pub fn is_exported(&self, class_name: &str) -> bool {
        self.classes
            .get(class_name)
            .map(|loaded| loaded.class.exported)
            .unwrap_or(false)
    }

    /// A storage type is admissible for a persistent field when it is
    /// basic, a string, a big integer or a storage class of this classpath.
    pub fn is_storage_type(&self, storage_type: &StorageType) -> bool {
        match storage_type.class_name() {
            None => true,
            Some(name) => storage_type.is_eager() || self.is_storage_class(name),
        }
    }

    /// The superclass chain of a class, root first.
    pub fn superclass_chain(&self, class_name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            cursor = self
                .classes
                .get(&name)
                .and_then(|loaded| loaded.class.superclass.clone());
            chain.push(name);
        }
        chain.reverse();
        chain
    }

    /// The persistent fields of a class, in canonical order: defining
    /// classes superclass-first, fields sorted by name then type within
    /// each class. This order drives both deserialization and the updates
    /// committed by responses.
    pub fn storage_fields_of(&self, class_name: &str) -> Vec<FieldSignature> {
        let mut signatures = Vec::new();
        for defining_class in self.superclass_chain(class_name) {
            let Some(loaded) = self.classes.get(&defining_class) else {
                continue;
            };
            let mut fields: Vec<_> = loaded
                .class
                .fields
                .iter()
                .filter(|field| !field.transient)
                .collect();
            fields.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.field_type.cmp(&b.field_type)));
            for field in fields {
                signatures.push(FieldSignature::new(
                    defining_class.clone(),
                    field.name.clone(),
                    field.field_type.clone(),
                ));
            }
        }
        signatures
    }

    /// The rank of a defining class within the hierarchy of a runtime
    /// class: superclasses first. Used to order updates canonically.
    pub fn class_rank(&self, defining_class: &str, runtime_class: &str) -> usize {
        self.superclass_chain(runtime_class)
            .iter()
            .position(|name| name == defining_class)
            .unwrap_or(usize::MAX)
    }

    /// Resolves a method by walking the superclass chain from the given
    /// class upwards, matching name and formal types exactly.
    pub fn resolve_method(
        &self,
        class_name: &str,
        method_name: &str,
        formals: &[StorageType],
    ) -> Option<(String, Arc<Class>, Method)> {
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            let loaded = self.classes.get(&name)?;
            if let Some(method) = loaded
                .class
                .methods
                .iter()
                .find(|method| method.name == method_name && method.formals == formals)
            {
                return Some((name.clone(), loaded.class.clone(), method.clone()));
            }
            cursor = loaded.class.superclass.clone();
        }
        None
    }

    /// Resolves a constructor; constructors are not inherited.
    pub fn resolve_constructor(&self, class_name: &str, formals: &[StorageType]) -> Option<Method> {
        let loaded = self.classes.get(class_name)?;
        loaded
            .class
            .methods
            .iter()
            .find(|method| method.is_constructor() && method.formals == formals)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_library::{base_module, GAMETE_CLASS, PAYABLE_CONTRACT_CLASS};
    use crate::types::references::StorageReference;
    use crate::types::responses::{JarStoreInitialTransactionResponse, TransactionResponse};
    use std::collections::HashMap as Map;

    pub(crate) struct FakeView {
        pub responses: Map<TransactionReference, TransactionResponse>,
    }

    impl StoreView for FakeView {
        fn response_of(&self, reference: &TransactionReference) -> ChainResult<Option<TransactionResponse>> {
            Ok(self.responses.get(reference).cloned())
        }

        fn history_of(&self, _object: &StorageReference) -> ChainResult<Vec<TransactionReference>> {
            Ok(Vec::new())
        }

        fn info(&self, _tag: u8) -> ChainResult<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn view_with_base() -> (FakeView, TransactionReference) {
        let reference = TransactionReference::new([1u8; 32]);
        let mut responses = Map::new();
        responses.insert(
            reference,
            TransactionResponse::JarStoreInitial(JarStoreInitialTransactionResponse {
                instrumented_jar: base_module().to_bytes(),
                dependencies: vec![],
            }),
        );
        (FakeView { responses }, reference)
    }

    #[test]
    fn loads_the_base_hierarchy() {
        let (view, reference) = view_with_base();
        let loader = EngineClassLoader::new(reference, &view).unwrap();
        assert!(loader.is_storage_class(GAMETE_CLASS));
        assert!(loader.is_contract_class(PAYABLE_CONTRACT_CLASS));
        assert!(loader.is_externally_owned_account(GAMETE_CLASS));
        assert!(!loader.is_externally_owned_account(PAYABLE_CONTRACT_CLASS));
    }

    #[test]
    fn unknown_classpath_is_rejected() {
        let (view, _) = view_with_base();
        let missing = TransactionReference::new([9u8; 32]);
        assert!(matches!(
            EngineClassLoader::new(missing, &view),
            Err(ChainError::TransactionRejected(_))
        ));
    }

    #[test]
    fn storage_fields_are_ordered_superclass_first() {
        let (view, reference) = view_with_base();
        let loader = EngineClassLoader::new(reference, &view).unwrap();
        let fields = loader.storage_fields_of(GAMETE_CLASS);
        let names: Vec<_> = fields.iter().map(|field| field.name.as_str()).collect();
        // Contract fields first, then the account fields
        assert_eq!(names, vec!["balance", "balanceRed", "nonce", "publicKey"]);
        assert_eq!(fields[0].defining_class, CONTRACT_CLASS);
        assert_eq!(fields[2].defining_class, EOA_CLASS);
    }

    #[test]
    fn resolves_inherited_methods() {
        let (view, reference) = view_with_base();
        let loader = EngineClassLoader::new(reference, &view).unwrap();
        let (defining, _, method) = loader
            .resolve_method(GAMETE_CLASS, "receive", &[StorageType::big_integer()])
            .unwrap();
        assert_eq!(defining, PAYABLE_CONTRACT_CLASS);
        assert!(method.payable);
    }
}
