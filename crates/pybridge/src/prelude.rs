//! Guest-side stubs for every registered builtin.
//!
//! Each builtin module becomes a `SimpleNamespace` attribute of Python's
//! `builtins`, and each function a lambda that encodes its arguments, calls
//! the guest bridge module and decodes what comes back.

use std::fmt::Write;

use crate::{codec::Codec, registry::BuiltinRegistry};

/// Guest module exposing `invoke(module, function, args) -> str`, which
/// forwards to the host's `pybridge.wasm_invoke` import.
pub const GUEST_BRIDGE_MODULE: &str = "pyo3_plugin";

/// Source text defining a stub for every builtin.
///
/// Output depends only on the registry contents and the codec's guest
/// module, so an unchanged registry yields byte-identical text.
#[must_use]
pub fn generate_prelude(builtins: &BuiltinRegistry, codec: &dyn Codec) -> String {
    let encoder = codec.guest_module();
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "import builtins, {encoder}, {GUEST_BRIDGE_MODULE}");
    let _ = writeln!(out, "from types import SimpleNamespace");
    for module in builtins.modules() {
        let name = module.module();
        let _ = writeln!(out, "builtins.{name} = SimpleNamespace()");
        for function in module.functions() {
            let function = function.name();
            let _ = writeln!(
                out,
                "builtins.{name}.{function} = lambda *args: {encoder}.loads({GUEST_BRIDGE_MODULE}.invoke(\"{name}\", \"{function}\", {encoder}.dumps(args)))"
            );
        }
    }
    out
}
