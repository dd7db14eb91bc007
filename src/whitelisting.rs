//! The white-listing table: the only members of the base library that
//! uploaded code may reach. Fields are never white-listed; methods and
//! constructors of the exported base classes are.

use std::collections::HashSet;

use crate::base_library::base_module;
use crate::bytecode::Module;
use crate::types::signatures::{ConstructorSignature, MethodSignature};
use crate::types::storage_types::StorageType;

pub struct WhiteListingWizard {
    methods: HashSet<(String, String, Vec<StorageType>)>,
    constructors: HashSet<(String, Vec<StorageType>)>,
}

impl WhiteListingWizard {
    /// The table over the platform's base library.
    pub fn new() -> Self {
        Self::over(&base_module())
    }

    fn over(module: &Module) -> Self {
        let mut methods = HashSet::new();
        let mut constructors = HashSet::new();
        for class in &module.classes {
            if !class.exported {
                continue;
            }
            for method in &class.methods {
                if !method.is_public {
                    continue;
                }
                if method.is_constructor() {
                    constructors.insert((class.name.clone(), method.formals.clone()));
                } else {
                    methods.insert((class.name.clone(), method.name.clone(), method.formals.clone()));
                }
            }
        }
        Self {
            methods,
            constructors,
        }
    }

    pub fn allows_method(&self, signature: &MethodSignature) -> bool {
        self.methods.contains(&(
            signature.defining_class.clone(),
            signature.name.clone(),
            signature.formals.clone(),
        ))
    }

    pub fn allows_constructor(&self, signature: &ConstructorSignature) -> bool {
        self.constructors
            .contains(&(signature.defining_class.clone(), signature.formals.clone()))
    }

    /// No field of the base library is ever accessible from uploaded code.
    pub fn allows_field(&self) -> bool {
        false
    }
}

impl Default for WhiteListingWizard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_library::{receive_signature, GAMETE_CLASS, PAYABLE_CONTRACT_CLASS};

    #[test]
    fn receive_is_white_listed() {
        let wizard = WhiteListingWizard::new();
        assert!(wizard.allows_method(&receive_signature(StorageType::big_integer())));
        assert!(wizard.allows_method(&receive_signature(StorageType::Int)));
    }

    #[test]
    fn unknown_members_are_not_white_listed() {
        let wizard = WhiteListingWizard::new();
        assert!(!wizard.allows_method(&MethodSignature::new(
            PAYABLE_CONTRACT_CLASS,
            "drain",
            vec![],
            None
        )));
        assert!(!wizard.allows_constructor(&ConstructorSignature::new(
            GAMETE_CLASS,
            vec![StorageType::Int]
        )));
        assert!(!wizard.allows_field());
    }
}
