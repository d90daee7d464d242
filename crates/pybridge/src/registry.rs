//! Name-keyed sets of function descriptors.
//!
//! [`Builtins`] describe host functions the guest may call; [`Invokables`]
//! describe guest functions the host intends to call. Both are grouped per
//! module and collected into [`Registrations`], which rejects duplicate
//! module names. Iteration order is lexicographic everywhere so anything
//! generated from a registry is reproducible.

use std::{collections::BTreeMap, ops::Deref};

use smallvec::SmallVec;

use crate::{
    codec::Codec,
    error::{Error, Result},
    host::{BoxError, FunctionDescriptor},
    reference::ReferenceTable,
    value::{ValType, Value},
};

const GUEST_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !GUEST_KEYWORDS.contains(&name);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName {
            name: name.to_string(),
        })
    }
}

/// The functions registered under one module name.
#[derive(Debug, Clone)]
pub struct ModuleFunctions {
    module: String,
    functions: BTreeMap<String, FunctionDescriptor>,
}

impl ModuleFunctions {
    fn new(module: String, descriptors: Vec<FunctionDescriptor>) -> Result<Self> {
        validate_name(&module)?;
        let mut functions = BTreeMap::new();
        for descriptor in descriptors {
            validate_name(descriptor.name())?;
            if functions.contains_key(descriptor.name()) {
                return Err(Error::DuplicateFunction {
                    module,
                    function: descriptor.name().to_string(),
                });
            }
            functions.insert(descriptor.name().to_string(), descriptor);
        }
        Ok(Self { module, functions })
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn get(&self, function: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(function)
    }

    /// Descriptors ordered by function name.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Host functions exposed to the guest under one module name.
#[derive(Debug, Clone)]
pub struct Builtins(ModuleFunctions);

impl Builtins {
    #[must_use]
    pub fn builder(module: impl Into<String>) -> BuiltinsBuilder {
        BuiltinsBuilder {
            module: module.into(),
            functions: Vec::new(),
        }
    }
}

impl Deref for Builtins {
    type Target = ModuleFunctions;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct BuiltinsBuilder {
    module: String,
    functions: Vec<FunctionDescriptor>,
}

impl BuiltinsBuilder {
    #[must_use]
    pub fn add<F>(
        mut self,
        name: impl Into<String>,
        params: impl Into<Vec<ValType>>,
        ret: ValType,
        body: F,
    ) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.functions
            .push(FunctionDescriptor::host(name, params, ret, body));
        self
    }

    #[must_use]
    pub fn function(mut self, descriptor: FunctionDescriptor) -> Self {
        self.functions.push(descriptor);
        self
    }

    /// # Errors
    /// Returns [`Error::DuplicateFunction`] if a name repeats, or
    /// [`Error::InvalidName`] if a name is not a guest identifier.
    pub fn build(self) -> Result<Builtins> {
        ModuleFunctions::new(self.module, self.functions).map(Builtins)
    }
}

/// Guest functions the host intends to call under one module name.
#[derive(Debug, Clone)]
pub struct Invokables(ModuleFunctions);

impl Invokables {
    #[must_use]
    pub fn builder(module: impl Into<String>) -> InvokablesBuilder {
        InvokablesBuilder {
            module: module.into(),
            functions: Vec::new(),
        }
    }
}

impl Deref for Invokables {
    type Target = ModuleFunctions;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct InvokablesBuilder {
    module: String,
    functions: Vec<FunctionDescriptor>,
}

impl InvokablesBuilder {
    #[must_use]
    pub fn add(
        mut self,
        name: impl Into<String>,
        params: impl Into<Vec<ValType>>,
        ret: ValType,
    ) -> Self {
        self.functions
            .push(FunctionDescriptor::guest(name, params, ret));
        self
    }

    /// # Errors
    /// Returns [`Error::DuplicateFunction`] if a name repeats, or
    /// [`Error::InvalidName`] if a name is not a guest identifier.
    pub fn build(self) -> Result<Invokables> {
        ModuleFunctions::new(self.module, self.functions).map(Invokables)
    }
}

/// Modules keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleFunctions>,
}

impl ModuleRegistry {
    fn from_modules(modules: impl IntoIterator<Item = ModuleFunctions>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for module in modules {
            if map.contains_key(module.module()) {
                return Err(Error::DuplicateModule {
                    module: module.module,
                });
            }
            map.insert(module.module.clone(), module);
        }
        Ok(Self { modules: map })
    }

    #[must_use]
    pub fn module(&self, module: &str) -> Option<&ModuleFunctions> {
        self.modules.get(module)
    }

    #[must_use]
    pub fn by_name(&self, module: &str, function: &str) -> Option<&FunctionDescriptor> {
        self.modules.get(module)?.get(function)
    }

    /// Like [`Self::by_name`], but reports which half of the lookup failed.
    ///
    /// # Errors
    /// Returns [`Error::UnknownModule`] or [`Error::UnknownFunction`].
    pub fn resolve(&self, module: &str, function: &str) -> Result<&FunctionDescriptor> {
        let functions = self
            .modules
            .get(module)
            .ok_or_else(|| Error::UnknownModule {
                module: module.to_string(),
            })?;
        functions
            .get(function)
            .ok_or_else(|| Error::UnknownFunction {
                module: module.to_string(),
                function: function.to_string(),
            })
    }

    /// Modules ordered by name.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleFunctions> {
        self.modules.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltinRegistry(ModuleRegistry);

impl Deref for BuiltinRegistry {
    type Target = ModuleRegistry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvokableRegistry(ModuleRegistry);

impl Deref for InvokableRegistry {
    type Target = ModuleRegistry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl InvokableRegistry {
    /// Encode arguments for a call into the guest.
    ///
    /// Host references are inserted into `refs` and travel as their handle;
    /// everything else is encoded by its declared type, in order.
    ///
    /// # Errors
    /// Returns [`Error::UnknownModule`]/[`Error::UnknownFunction`] for an
    /// unregistered target, [`Error::ArityMismatch`] when the argument count
    /// differs from the declaration, and [`Error::TypeMismatch`] when a value
    /// does not fit its declared type.
    pub fn compute_call_payload(
        &self,
        refs: &mut ReferenceTable,
        codec: &dyn Codec,
        module: &str,
        function: &str,
        args: &[Value],
    ) -> Result<Vec<u8>> {
        let descriptor = self.resolve(module, function)?;
        if args.len() != descriptor.params().len() {
            return Err(Error::ArityMismatch {
                module: module.to_string(),
                function: function.to_string(),
                expected: descriptor.params().len(),
                actual: args.len(),
            });
        }

        let mut encoded = SmallVec::<[serde_json::Value; 4]>::new();
        for (index, (ty, arg)) in descriptor.params().iter().zip(args).enumerate() {
            let site = || format!("argument {index} of `{module}.{function}`");
            let element = match (ty, arg) {
                (ValType::HostRef, Value::HostRef(reference)) => refs.insert(reference).into(),
                (ValType::HostRef, Value::Null) => serde_json::Value::Null,
                (ValType::HostRef, other) => {
                    return Err(Error::TypeMismatch {
                        site: site(),
                        expected: ValType::HostRef,
                        found: other.kind().to_string(),
                    });
                }
                (ty, arg) => arg.encode(*ty, &site())?,
            };
            encoded.push(element);
        }

        codec
            .encode(&serde_json::Value::Array(encoded.into_vec()))
            .map_err(|source| Error::Encode {
                what: "call payload",
                source,
            })
    }
}

/// Every module registration for one session.
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    pub(crate) builtins: BuiltinRegistry,
    pub(crate) invokables: InvokableRegistry,
}

impl Registrations {
    #[must_use]
    pub fn builder() -> RegistrationsBuilder {
        RegistrationsBuilder::default()
    }

    #[must_use]
    pub const fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    #[must_use]
    pub const fn invokables(&self) -> &InvokableRegistry {
        &self.invokables
    }
}

#[derive(Debug, Default)]
pub struct RegistrationsBuilder {
    builtins: Vec<Builtins>,
    invokables: Vec<Invokables>,
}

impl RegistrationsBuilder {
    #[must_use]
    pub fn builtins(mut self, builtins: Builtins) -> Self {
        self.builtins.push(builtins);
        self
    }

    #[must_use]
    pub fn invokables(mut self, invokables: Invokables) -> Self {
        self.invokables.push(invokables);
        self
    }

    /// # Errors
    /// Returns [`Error::DuplicateModule`] if a module name is registered twice
    /// in either registry.
    pub fn build(self) -> Result<Registrations> {
        Ok(Registrations {
            builtins: BuiltinRegistry(ModuleRegistry::from_modules(
                self.builtins.into_iter().map(|b| b.0),
            )?),
            invokables: InvokableRegistry(ModuleRegistry::from_modules(
                self.invokables.into_iter().map(|i| i.0),
            )?),
        })
    }
}
