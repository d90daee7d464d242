use std::path::Path;

use wasmtime::{Engine, Module};

use super::cache::{cache_key, write_cache_file_atomic};
use crate::{
    TRACE_TARGET_BRIDGE,
    error::{Error, Result},
};

/// Compile `wasm_bytes`, going through the on-disk artifact cache when one is
/// configured.
pub fn load_or_compile_module(
    engine: &Engine,
    wasm_bytes: &[u8],
    cache: Option<&Path>,
) -> Result<Module> {
    let Some(cache_dir) = cache else {
        return Module::new(engine, wasm_bytes).map_err(Error::Wasm);
    };

    std::fs::create_dir_all(cache_dir)?;
    let key = cache_key(engine, wasm_bytes);
    let cache_path = cache_dir.join(format!("{key}.cwasm"));

    // SAFETY: the artifact was produced by `Module::serialize` for an engine
    // with the same compatibility hash (it is part of the key); a stale or
    // corrupt file fails to deserialize and is recompiled below.
    if let Ok(module) = unsafe { Module::deserialize_file(engine, &cache_path) } {
        tracing::debug!(
            target: TRACE_TARGET_BRIDGE,
            path = %cache_path.display(),
            "compile cache hit"
        );
        return Ok(module);
    }

    let module = Module::new(engine, wasm_bytes).map_err(Error::Wasm)?;
    let bytes = module.serialize().map_err(Error::Wasm)?;
    write_cache_file_atomic(&cache_path, &bytes)?;
    tracing::debug!(
        target: TRACE_TARGET_BRIDGE,
        path = %cache_path.display(),
        bytes = bytes.len(),
        "compile cache stored"
    );
    Ok(module)
}
