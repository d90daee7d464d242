//! The single host entry point guest code calls into.
//!
//! A call arrives as three byte ranges (module name, function name and the
//! encoded argument array). The dispatcher resolves the target, decodes each
//! argument by its declared type, runs the host body, encodes the result the
//! same way and hands it back as the address of a [`WidePtr`] record.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    TRACE_TARGET_BRIDGE,
    codec::Codec,
    error::{Error, Result},
    host::FunctionDescriptor,
    memory::{GuestMemory, WidePtr},
    reference::ReferenceTable,
    registry::BuiltinRegistry,
    value::{HostRef, ValType, Value, json_kind},
};

/// The six raw parameters of `pybridge.wasm_invoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCall {
    pub module: WidePtr,
    pub function: WidePtr,
    pub args: WidePtr,
}

impl RawCall {
    /// Reinterpret the wasm `i32` parameters as unsigned addresses.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_params(
        module_ptr: i32,
        module_len: i32,
        function_ptr: i32,
        function_len: i32,
        args_ptr: i32,
        args_len: i32,
    ) -> Self {
        Self {
            module: WidePtr::new(module_ptr as u32, module_len as u32),
            function: WidePtr::new(function_ptr as u32, function_len as u32),
            args: WidePtr::new(args_ptr as u32, args_len as u32),
        }
    }
}

/// Run one guest-to-host call and return the outer address of the result.
///
/// With `log_calls` set, each call emits a `debug` event on
/// [`TRACE_TARGET_BRIDGE`].
///
/// # Errors
/// Any lookup, decode, invocation, encode or allocation failure. A failed
/// call adds no reference table entry and frees any result buffer it
/// allocated.
pub fn dispatch<M: GuestMemory + ?Sized>(
    memory: &mut M,
    refs: &mut ReferenceTable,
    builtins: &BuiltinRegistry,
    codec: &dyn Codec,
    call: RawCall,
    log_calls: bool,
) -> Result<u32> {
    let module = memory.read_str(call.module.offset, call.module.len, "module name")?;
    let function = memory.read_str(call.function.offset, call.function.len, "function name")?;
    let descriptor = builtins.resolve(&module, &function)?;

    let raw_args = memory.read_bytes(call.args.offset, call.args.len)?;
    let args = decode_args(refs, codec, descriptor, &module, &function, &raw_args)?;
    if log_calls {
        tracing::debug!(
            target: TRACE_TARGET_BRIDGE,
            module = %module,
            function = %function,
            args = args.len(),
            "host call"
        );
    }

    let result = descriptor
        .invoke(&args)
        .map_err(|source| Error::InvocationError {
            module: module.clone(),
            function: function.clone(),
            source,
        })?;

    let (encoded, fresh) = encode_result(refs, codec, descriptor, result, &module, &function)?;
    let data = memory.write_buffer(&encoded)?;
    let outer = match memory.write_wide_pointer(data) {
        Ok(outer) => outer,
        Err(e) => {
            if let Err(free_err) = memory.deallocate(data.offset) {
                tracing::warn!(
                    target: TRACE_TARGET_BRIDGE,
                    error = %free_err,
                    "failed to free result buffer"
                );
            }
            return Err(e);
        }
    };
    // The guest can only see the handle once the pointer is written.
    if let Some(reference) = fresh {
        refs.put(Arc::clone(reference.object()));
    }
    if log_calls {
        tracing::debug!(
            target: TRACE_TARGET_BRIDGE,
            module = %module,
            function = %function,
            result_len = data.len,
            "host call returned"
        );
    }
    Ok(outer)
}

fn decode_args(
    refs: &ReferenceTable,
    codec: &dyn Codec,
    descriptor: &FunctionDescriptor,
    module: &str,
    function: &str,
    raw: &[u8],
) -> Result<SmallVec<[Value; 4]>> {
    let decoded = codec.decode(raw).map_err(|source| Error::Decode {
        what: "call arguments",
        source,
    })?;
    let elements = match decoded {
        serde_json::Value::Array(elements) => elements,
        other => {
            return Err(Error::Decode {
                what: "call arguments",
                source: format!("expected an array, found {}", json_kind(&other)).into(),
            });
        }
    };

    let params = descriptor.params();
    if elements.len() > params.len() {
        return Err(Error::ArityMismatch {
            module: module.to_string(),
            function: function.to_string(),
            expected: params.len(),
            actual: elements.len(),
        });
    }

    // Trailing arguments the guest left out decode as null.
    let mut elements = elements.into_iter();
    params
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            let element = elements.next().unwrap_or_default();
            let site = format!("argument {index} of `{module}.{function}`");
            match ty {
                ValType::HostRef if element.is_null() => Ok(Value::Null),
                ValType::HostRef => {
                    let handle = element.as_i64().ok_or_else(|| Error::TypeMismatch {
                        site,
                        expected: ValType::HostRef,
                        found: json_kind(&element).to_string(),
                    })?;
                    refs.get(handle).map(Value::HostRef)
                }
                ty => Value::decode(*ty, element, &site),
            }
        })
        .collect()
}

/// Encoded result plus a reference that still needs a table entry. A fresh
/// reference is encoded as [`ReferenceTable::next_handle`].
fn encode_result(
    refs: &ReferenceTable,
    codec: &dyn Codec,
    descriptor: &FunctionDescriptor,
    result: Value,
    module: &str,
    function: &str,
) -> Result<(Vec<u8>, Option<HostRef>)> {
    let site = || format!("return value of `{module}.{function}`");
    let mut fresh = None;
    let json = match (descriptor.ret(), result) {
        (ValType::Unit, _) | (ValType::HostRef, Value::Null) => serde_json::Value::Null,
        (ValType::HostRef, Value::HostRef(reference)) => match refs.find(&reference) {
            Some(handle) => handle.into(),
            None => {
                let handle = refs.next_handle();
                fresh = Some(reference);
                handle.into()
            }
        },
        (ValType::HostRef, other) => {
            return Err(Error::TypeMismatch {
                site: site(),
                expected: ValType::HostRef,
                found: other.kind().to_string(),
            });
        }
        (ty, value) => value.encode(ty, &site())?,
    };
    let encoded = codec.encode(&json).map_err(|source| Error::Encode {
        what: "call result",
        source,
    })?;
    Ok((encoded, fresh))
}
