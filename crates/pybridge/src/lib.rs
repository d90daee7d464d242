//! Invocation bridge between a host and a Python interpreter running as a
//! WASI guest.
//!
//! Host functions are registered per module as [`Builtins`] and reached from
//! guest code through generated stubs (see [`prelude`]). Every stub call goes
//! through one host import, `pybridge.wasm_invoke`, which the [`dispatch`]
//! module implements on top of a [`GuestMemory`] accessor. Host objects cross
//! the boundary as integer handles into a per-session [`ReferenceTable`].
//!
//! ```no_run
//! use pybridge::{Builtins, PluginTemplate, Registrations, SessionOptions, ValType, Value};
//!
//! # fn main() -> pybridge::Result<()> {
//! let template = PluginTemplate::builder().build("python.wasm")?;
//! let math = Builtins::builder("math")
//!     .add("add", [ValType::Integer, ValType::Integer], ValType::Integer, |args| {
//!         let a = args[0].as_i64().unwrap_or_default();
//!         let b = args[1].as_i64().unwrap_or_default();
//!         Ok(Value::Integer(a + b))
//!     })
//!     .build()?;
//! let registrations = Registrations::builder().builtins(math).build()?;
//! let mut session = template.instantiate(registrations, SessionOptions::default())?;
//! session.exec("print(math.add(2, 3))")?;
//! assert_eq!(session.stdout()?, "5\n");
//! session.close()?;
//! # Ok(())
//! # }
//! ```

mod internal;

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod memory;
pub mod prelude;
pub mod reference;
pub mod registry;
pub mod session;
pub mod value;

pub const TRACE_TARGET_BRIDGE: &str = "pybridge::bridge";

pub use codec::{Codec, JsonCodec};
pub use error::{Error, Result};
pub use host::{BoxError, FunctionBody, FunctionDescriptor, HostFn};
pub use memory::{GuestMemory, WidePtr};
pub use reference::{Handle, ReferenceTable};
pub use registry::{
    BuiltinRegistry, Builtins, InvokableRegistry, Invokables, ModuleFunctions, Registrations,
};
pub use session::{
    DirPerms, FilePerms, PluginTemplate, PluginTemplateBuilder, Session, SessionOptions,
};
pub use value::{HostRef, ValType, Value};
