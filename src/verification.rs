//! Static verification of uploaded modules, before instrumentation.
//! Diagnostics are collected; any error fails the module installation.

use std::fmt;

use crate::base_library::STORAGE_CLASS;
use crate::bytecode::{Class, Instruction, Method, Module};
use crate::classloader::EngineClassLoader;
use crate::types::storage_types::StorageType;
use crate::whitelisting::WhiteListingWizard;

#[derive(Clone, Debug, PartialEq)]
pub struct VerificationError {
    /// The class of the diagnostic, part of the failure surface of
    /// module-installation responses.
    pub error_class: String,
    /// Where the issue was found: `class`, `class.method` or
    /// `class.field`.
    pub location: String,
    pub message: String,
}

impl VerificationError {
    fn new(error_class: &str, location: String, message: String) -> Self {
        Self {
            error_class: error_class.to_string(),
            location,
            message,
        }
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.error_class, self.location, self.message)
    }
}

/// A module that passed verification and may be instrumented.
pub struct VerifiedModule {
    pub module: Module,
}

pub struct Verifier<'a> {
    module: &'a Module,
    loader: Option<&'a EngineClassLoader>,
    wizard: &'a WhiteListingWizard,
    allows_self_charged: bool,
    /// The base module verifies itself before anything is installed and
    /// is the only code allowed to carry the supply intrinsics.
    during_initialization: bool,
    errors: Vec<VerificationError>,
}

impl<'a> Verifier<'a> {
    pub fn new(
        module: &'a Module,
        loader: Option<&'a EngineClassLoader>,
        wizard: &'a WhiteListingWizard,
        allows_self_charged: bool,
        during_initialization: bool,
    ) -> Self {
        Self {
            module,
            loader,
            wizard,
            allows_self_charged,
            during_initialization,
            errors: Vec::new(),
        }
    }

    pub fn verify(mut self) -> Result<VerifiedModule, Vec<VerificationError>> {
        for class in &self.module.classes {
            self.check_class(class);
        }
        if self.errors.is_empty() {
            Ok(VerifiedModule {
                module: self.module.clone(),
            })
        } else {
            Err(self.errors)
        }
    }

    fn find_class(&self, name: &str) -> Option<(&'a Class, bool)> {
        if let Some(class) = self.module.class(name) {
            return Some((class, true));
        }
        self.loader
            .and_then(|loader| loader.class(name))
            .map(|loaded| (loaded.class.as_ref(), false))
    }

    fn is_subclass_of(&self, class_name: &str, superclass: &str) -> bool {
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            if name == superclass {
                return true;
            }
            cursor = self
                .find_class(&name)
                .and_then(|(class, _)| class.superclass.clone());
        }
        false
    }

    fn is_storage_class(&self, class_name: &str) -> bool {
        self.is_subclass_of(class_name, STORAGE_CLASS)
    }

    fn is_storage_type(&self, storage_type: &StorageType) -> bool {
        match storage_type.class_name() {
            None => true,
            Some(name) => storage_type.is_eager() || self.is_storage_class(name),
        }
    }

    fn resolve_method(&self, class_name: &str, method_name: &str, formals: &[StorageType]) -> Option<(&'a Method, bool)> {
        let mut cursor = Some(class_name.to_string());
        while let Some(name) = cursor {
            let (class, in_module) = self.find_class(&name)?;
            if let Some(method) = class
                .methods
                .iter()
                .find(|method| method.name == method_name && method.formals == formals)
            {
                return Some((method, in_module));
            }
            cursor = class.superclass.clone();
        }
        None
    }

    fn error(&mut self, error_class: &str, location: String, message: impl Into<String>) {
        self.errors
            .push(VerificationError::new(error_class, location, message.into()));
    }

    fn check_class(&mut self, class: &Class) {
        if let Some(superclass) = &class.superclass {
            if self.find_class(superclass).is_none() {
                self.error(
                    "UnknownClassError",
                    class.name.clone(),
                    format!("superclass {superclass} cannot be resolved"),
                );
            }
        }

        if self.is_storage_class(&class.name) {
            for field in &class.fields {
                if !field.transient && !self.is_storage_type(&field.field_type) {
                    self.error(
                        "IllegalTypeForStorageFieldError",
                        format!("{}.{}", class.name, field.name),
                        "fields of storage classes must hold storage values",
                    );
                }
            }
        }

        for method in &class.methods {
            self.check_method(class, method);
        }
    }

    fn check_method(&mut self, class: &Class, method: &Method) {
        let location = format!("{}.{}", class.name, method.name);

        if method.payable && !method.from_contract {
            self.error(
                "PayableWithoutFromContractError",
                location.clone(),
                "payable code must also be from-contract",
            );
        }
        if method.payable {
            let amount_ok = matches!(
                method.formals.first(),
                Some(StorageType::Int) | Some(StorageType::Long)
            ) || method.formals.first() == Some(&StorageType::big_integer());
            if !amount_ok {
                self.error(
                    "PayableWithoutAmountError",
                    location.clone(),
                    "payable code takes the paid amount as first parameter",
                );
            }
        }
        if method.from_contract && !self.is_storage_class(&class.name) {
            self.error(
                "IllegalFromContractError",
                location.clone(),
                "from-contract code is only allowed in storage classes",
            );
        }
        if !method.throws.is_empty() && !method.throws_exceptions {
            self.error(
                "MissingThrowsExceptionsError",
                location.clone(),
                "checked exceptions require the throws-exceptions annotation",
            );
        }
        if method.self_charged {
            let admissible = self.allows_self_charged
                && !method.is_static
                && method.is_public
                && !method.is_constructor()
                && self.is_subclass_of(&class.name, crate::base_library::CONTRACT_CLASS);
            if !admissible {
                self.error(
                    "IllegalSelfChargedError",
                    location.clone(),
                    "self-charged is reserved to public instance methods of contracts, when the consensus allows it",
                );
            }
        }

        for instruction in &method.code {
            self.check_instruction(method, instruction, &location);
        }
    }

    fn check_instruction(&mut self, method: &Method, instruction: &Instruction, location: &str) {
        match instruction {
            Instruction::Jsr(_) => {
                self.error("IllegalJsrInstructionError", location.to_string(), "jsr is forbidden")
            }
            Instruction::Ret(_) => {
                self.error("IllegalRetInstructionError", location.to_string(), "ret is forbidden")
            }
            Instruction::MonitorEnter | Instruction::MonitorExit => self.error(
                "IllegalSynchronizationError",
                location.to_string(),
                "explicit synchronization is forbidden",
            ),
            Instruction::PutStatic(_) if !method.class_initializer && !method.synthetic => self.error(
                "IllegalPutstaticInstructionError",
                location.to_string(),
                "static fields cannot be written outside class initializers",
            ),
            Instruction::Store(0) if !method.is_static => self.error(
                "IllegalModificationOfLocal0Error",
                location.to_string(),
                "local 0 holds the receiver and cannot be overwritten",
            ),
            Instruction::LoadCaller if !method.from_contract => self.error(
                "IllegalCallerAccessError",
                location.to_string(),
                "only from-contract code can access its caller",
            ),
            Instruction::ChargeCpu(_)
            | Instruction::ChargeRam(_)
            | Instruction::FromContract
            | Instruction::PayableFromContract
            | Instruction::GetFieldLazy(_) => self.error(
                "IllegalSyntheticInstructionError",
                location.to_string(),
                "instrumentation instructions cannot appear in uploaded code",
            ),
            Instruction::Mint | Instruction::Burn if !self.during_initialization => self.error(
                "IllegalSyntheticInstructionError",
                location.to_string(),
                "supply intrinsics are reserved to the base library",
            ),
            Instruction::GetField(field) | Instruction::PutField(field) | Instruction::GetStatic(field) => {
                let in_module = self.module.class(&field.defining_class).is_some();
                if in_module {
                    if self
                        .module
                        .class(&field.defining_class)
                        .and_then(|c| c.field(&field.name))
                        .is_none()
                    {
                        self.error(
                            "UnknownClassError",
                            location.to_string(),
                            format!("field {field} cannot be resolved"),
                        );
                    }
                } else if !self.wizard.allows_field() {
                    self.error(
                        "IllegalAccessToNonWhiteListedFieldError",
                        location.to_string(),
                        format!("illegal access to non-white-listed field {field}"),
                    );
                }
            }
            Instruction::New(name) => {
                if self.find_class(name).is_none() {
                    self.error(
                        "UnknownClassError",
                        location.to_string(),
                        format!("class {name} cannot be resolved"),
                    );
                }
            }
            Instruction::Call(signature) => {
                // dependency classes arrive instrumented: their
                // from-contract members carry the extended formals
                let resolved = self
                    .resolve_method(&signature.defining_class, &signature.name, &signature.formals)
                    .or_else(|| {
                        self.resolve_method(
                            &signature.defining_class,
                            &signature.name,
                            &crate::instrumentation::from_contract_formals(&signature.formals),
                        )
                    });
                match resolved {
                    None => {
                        if !self.wizard.allows_method(signature) {
                            self.error(
                                "IllegalCallToNonWhiteListedMethodError",
                                location.to_string(),
                                format!("illegal call to non-white-listed method {signature}"),
                            );
                        }
                    }
                    Some((target, target_in_module)) => {
                        if !target_in_module && !target.is_public && !self.wizard.allows_method(signature) {
                            self.error(
                                "IllegalCallToNonWhiteListedMethodError",
                                location.to_string(),
                                format!("illegal call to non-white-listed method {signature}"),
                            );
                        }
                        if target.from_contract && !method.from_contract {
                            self.error(
                                "IllegalCallToFromContractError",
                                location.to_string(),
                                format!("{signature} is from-contract and can only be called from contract code"),
                            );
                        }
                    }
                }
            }
            Instruction::CallConstructor(signature) => {
                let extended = crate::instrumentation::from_contract_formals(&signature.formals);
                let target = self
                    .find_class(&signature.defining_class)
                    .and_then(|(class, in_module)| {
                        class
                            .methods
                            .iter()
                            .find(|m| {
                                m.is_constructor() && (m.formals == signature.formals || m.formals == extended)
                            })
                            .map(|m| (m, in_module))
                    });
                match target {
                    None => {
                        if !self.wizard.allows_constructor(signature) {
                            self.error(
                                "IllegalCallToNonWhiteListedConstructorError",
                                location.to_string(),
                                format!("illegal call to non-white-listed constructor {signature}"),
                            );
                        }
                    }
                    Some((target, target_in_module)) => {
                        if !target_in_module && !target.is_public && !self.wizard.allows_constructor(signature) {
                            self.error(
                                "IllegalCallToNonWhiteListedConstructorError",
                                location.to_string(),
                                format!("illegal call to non-white-listed constructor {signature}"),
                            );
                        }
                        if target.from_contract && !method.from_contract {
                            self.error(
                                "IllegalCallToFromContractError",
                                location.to_string(),
                                format!("{signature} is from-contract and can only be called from contract code"),
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_library::{base_module, CONTRACT_CLASS};
    use crate::bytecode::{Class, Field, Method};
    use crate::types::signatures::FieldSignature;

    fn verify_alone(module: &Module) -> Result<VerifiedModule, Vec<VerificationError>> {
        let wizard = WhiteListingWizard::new();
        Verifier::new(module, None, &wizard, false, true).verify()
    }

    #[test]
    fn base_module_verifies() {
        assert!(verify_alone(&base_module()).is_ok());
    }

    #[test]
    fn forbidden_opcodes_are_reported() {
        let module = Module::new(vec![Class::new("demo.Bad", None).with_method(
            Method::new("m", vec![], None).with_code(
                1,
                vec![Instruction::Jsr(0), Instruction::MonitorEnter, Instruction::Return],
            ),
        )]);
        let errors = verify_alone(&module).err().unwrap();
        let classes: Vec<_> = errors.iter().map(|error| error.error_class.as_str()).collect();
        assert!(classes.contains(&"IllegalJsrInstructionError"));
        assert!(classes.contains(&"IllegalSynchronizationError"));
    }

    #[test]
    fn external_field_access_is_not_white_listed() {
        let module = Module::new(vec![Class::new("demo.Snooper", None).with_method(
            Method::new("peek", vec![], None).with_code(
                1,
                vec![
                    Instruction::Load(0),
                    Instruction::GetField(crate::base_library::balance_field()),
                    Instruction::Pop,
                    Instruction::Return,
                ],
            ),
        )]);
        let errors = verify_alone(&module).err().unwrap();
        assert!(errors
            .iter()
            .any(|error| error.error_class.starts_with("IllegalAccessToNonWhiteListedField")));
    }

    #[test]
    fn payable_requires_from_contract_and_amount() {
        let module = Module::new(vec![Class::new("demo.C", Some(STORAGE_CLASS)).with_method(
            Method::new("p", vec![StorageType::string()], None)
                .payable()
                .with_code(2, vec![Instruction::Return]),
        )]);
        let errors = verify_alone(&module).err().unwrap();
        let classes: Vec<_> = errors.iter().map(|error| error.error_class.as_str()).collect();
        assert!(classes.contains(&"PayableWithoutFromContractError"));
        assert!(classes.contains(&"PayableWithoutAmountError"));
    }

    #[test]
    fn local_zero_is_protected_in_instance_methods() {
        let module = Module::new(vec![Class::new("demo.C", None).with_method(
            Method::new("m", vec![], None).with_code(
                1,
                vec![Instruction::Const(crate::types::values::StorageValue::Null), Instruction::Store(0), Instruction::Return],
            ),
        )]);
        let errors = verify_alone(&module).err().unwrap();
        assert!(errors
            .iter()
            .any(|error| error.error_class == "IllegalModificationOfLocal0Error"));
    }

    #[test]
    fn from_contract_discipline_is_enforced() {
        let callee = Class::new("demo.Callee", Some(STORAGE_CLASS)).with_method(
            Method::new("guarded", vec![], None)
                .from_contract()
                .with_code(1, vec![Instruction::Return]),
        );
        let caller = Class::new("demo.Caller", Some(STORAGE_CLASS))
            .with_field(Field::new("callee", StorageType::Class("demo.Callee".to_string())))
            .with_method(Method::new("call", vec![], None).with_code(
                1,
                vec![
                    Instruction::Load(0),
                    Instruction::GetField(FieldSignature::new(
                        "demo.Caller",
                        "callee",
                        StorageType::Class("demo.Callee".to_string()),
                    )),
                    Instruction::Call(crate::types::signatures::MethodSignature::new(
                        "demo.Callee",
                        "guarded",
                        vec![],
                        None,
                    )),
                    Instruction::Return,
                ],
            ));
        let module = Module::new(vec![callee, caller]);
        let errors = verify_alone(&module).err().unwrap();
        assert!(errors
            .iter()
            .any(|error| error.error_class == "IllegalCallToFromContractError"));
    }

    #[test]
    fn self_charged_requires_consensus_permission() {
        let module = Module::new(vec![Class::new("demo.C", Some(CONTRACT_CLASS)).with_method(
            Method::new("m", vec![], None)
                .self_charged()
                .with_code(1, vec![Instruction::Return]),
        )]);
        // no loader: the contract hierarchy is unresolvable, but the
        // self-charged check alone must already fire
        let errors = verify_alone(&module).err().unwrap();
        assert!(errors
            .iter()
            .any(|error| error.error_class == "IllegalSelfChargedError"));
    }
}
