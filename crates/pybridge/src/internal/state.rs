use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use wasmtime::{Caller, Engine, Linker, Store};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder, p1::WasiP1Ctx};

use crate::{
    TRACE_TARGET_BRIDGE,
    codec::Codec,
    dispatch::{RawCall, dispatch},
    internal::{
        guest::{GuestExports, WasmMemory},
        output::CapturedOutput,
        resource::MemoryLimiter,
    },
    reference::ReferenceTable,
    registry::BuiltinRegistry,
    session::DirectoryMapping,
};

/// Import module the dispatcher is linked under.
pub const HOST_MODULE: &str = "pybridge";
pub const HOST_INVOKE: &str = "wasm_invoke";

/// Guest path of the per-session scratch directory.
pub const SCRATCH_GUEST_PATH: &str = "/tmp";

pub struct InstanceState {
    pub limiter: MemoryLimiter,
    wasi: WasiP1Ctx,
    refs: ReferenceTable,
    builtins: Arc<BuiltinRegistry>,
    codec: Arc<dyn Codec>,
    exports: Option<GuestExports>,
    log_calls: bool,
}

/// Everything a new store needs besides the engine.
pub struct InstanceConfig<'a> {
    pub directory_mappings: &'a [DirectoryMapping],
    pub env: &'a [(String, String)],
    pub scratch: &'a Path,
    pub stdout: &'a CapturedOutput,
    pub stderr: &'a CapturedOutput,
    pub max_memory: usize,
    pub builtins: Arc<BuiltinRegistry>,
    pub codec: Arc<dyn Codec>,
    pub log_calls: bool,
}

impl InstanceState {
    /// Creates a new linker with WASI preview 1 and the dispatcher import.
    ///
    /// # Errors
    ///
    /// Returns an error if any import fails to link.
    pub fn new_linker(engine: &Engine) -> anyhow::Result<Linker<Self>> {
        let mut linker = Linker::<Self>::new(engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |s| &mut s.wasi)?;
        linker.func_wrap(HOST_MODULE, HOST_INVOKE, wasm_invoke)?;
        Ok(linker)
    }

    /// Creates a new store for one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the preopened directories cannot be added to the
    /// WASI context.
    pub fn new(engine: &Engine, cfg: InstanceConfig<'_>) -> anyhow::Result<Store<Self>> {
        let mut builder = WasiCtxBuilder::new();

        for mapping in cfg.directory_mappings {
            builder
                .preopened_dir(
                    &mapping.host,
                    &mapping.guest,
                    mapping.dir_perms,
                    mapping.file_perms,
                )
                .map_err(|e| {
                    anyhow!(
                        "Failed to add directory mapping '{}' -> '{}': {e}",
                        mapping.host.display(),
                        mapping.guest
                    )
                })?;
        }
        builder
            .preopened_dir(
                cfg.scratch,
                SCRATCH_GUEST_PATH,
                DirPerms::all(),
                FilePerms::all(),
            )
            .map_err(|e| anyhow!("Failed to mount scratch directory: {e}"))?;

        builder.env("PYTHONDONTWRITEBYTECODE", "1");
        for (k, v) in cfg.env {
            builder.env(k, v);
        }
        let wasi = builder
            .stdout(cfg.stdout.pipe())
            .stderr(cfg.stderr.pipe())
            .build_p1();

        let mut s = Store::new(
            engine,
            Self {
                limiter: MemoryLimiter::new(cfg.max_memory),
                wasi,
                refs: ReferenceTable::new(),
                builtins: cfg.builtins,
                codec: cfg.codec,
                exports: None,
                log_calls: cfg.log_calls,
            },
        );
        s.limiter(|s| &mut s.limiter);
        Ok(s)
    }

    pub fn bind_exports(&mut self, exports: GuestExports) {
        self.exports = Some(exports);
    }

    pub const fn refs(&self) -> &ReferenceTable {
        &self.refs
    }

    pub const fn refs_mut(&mut self) -> &mut ReferenceTable {
        &mut self.refs
    }
}

fn wasm_invoke(
    mut caller: Caller<'_, InstanceState>,
    module_ptr: i32,
    module_len: i32,
    function_ptr: i32,
    function_len: i32,
    args_ptr: i32,
    args_len: i32,
) -> anyhow::Result<i32> {
    let call = RawCall::from_params(
        module_ptr,
        module_len,
        function_ptr,
        function_len,
        args_ptr,
        args_len,
    );

    let state = caller.data_mut();
    let exports = state
        .exports
        .clone()
        .ok_or_else(|| anyhow!("host call before guest exports were bound"))?;
    let builtins = Arc::clone(&state.builtins);
    let codec = Arc::clone(&state.codec);
    let log_calls = state.log_calls;
    // The table lives in store data, which the memory accessor also borrows.
    let mut refs = std::mem::take(&mut state.refs);

    let result = dispatch(
        &mut WasmMemory::new(&mut caller, &exports),
        &mut refs,
        &builtins,
        codec.as_ref(),
        call,
        log_calls,
    );
    caller.data_mut().refs = refs;

    match result {
        Ok(outer) => Ok(outer.cast_signed()),
        Err(e) => {
            if log_calls {
                tracing::debug!(target: TRACE_TARGET_BRIDGE, error = %e, "host call failed");
            }
            Err(anyhow::Error::new(e))
        }
    }
}
