//! Session lifecycle APIs.
//!
//! Typical flow:
//! 1. Build a [`PluginTemplate`] from the guest plugin with
//!    [`PluginTemplateBuilder`].
//! 2. Instantiate a [`Session`] from that template with the session's
//!    [`Registrations`].
//! 3. [`Session::exec`] guest source as many times as needed, reading
//!    [`Session::stdout`]/[`Session::stderr`] in between.
//! 4. [`Session::close`] (or drop) the session.
//!
//! [`SessionOptions`] controls per-instantiation settings (codec, limits,
//! logging, mount/env overrides), while template defaults are configured via
//! [`PluginTemplateBuilder`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;
use tracing::level_filters::LevelFilter;
use wasmtime::{Engine, InstancePre, Store};
pub use wasmtime_wasi::{DirPerms, FilePerms};

use crate::{
    TRACE_TARGET_BRIDGE,
    codec::{Codec, JsonCodec},
    error::{Error, Result},
    internal::{
        guest::{GuestExports, WasmMemory},
        module::{compile::load_or_compile_module, configure::new_engine},
        output::CapturedOutput,
        state::{InstanceConfig, InstanceState},
    },
    memory::GuestMemory,
    prelude::generate_prelude,
    registry::{BuiltinRegistry, InvokableRegistry, Registrations},
    value::Value,
};

/// Default linear-memory cap per session.
pub const DEFAULT_MAX_MEMORY: usize = 512 * 1024 * 1024;
/// Default capture capacity for each of stdout and stderr.
pub const DEFAULT_MAX_OUTPUT: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub(crate) struct DirectoryMapping {
    pub(crate) host: PathBuf,
    pub(crate) guest: String,
    pub(crate) dir_perms: DirPerms,
    pub(crate) file_perms: FilePerms,
}

/// Per-instantiation options when creating a [`Session`] from a
/// [`PluginTemplate`].
///
/// Unset fields fall back to the template defaults, then to the crate
/// defaults ([`JsonCodec`], [`DEFAULT_MAX_MEMORY`], [`DEFAULT_MAX_OUTPUT`],
/// logging off).
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub(crate) codec: Option<Arc<dyn Codec>>,
    pub(crate) max_memory: Option<usize>,
    pub(crate) max_output: Option<usize>,
    pub(crate) log_level: Option<LevelFilter>,
    pub(crate) directory_mappings: Vec<DirectoryMapping>,
    pub(crate) env: Vec<(String, String)>,
}

impl SessionOptions {
    /// Use `codec` for arguments and results on the wire.
    pub fn codec(&mut self, codec: impl Codec) -> &mut Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Override the memory hard limit for this session.
    pub const fn max_memory(&mut self, max_memory: usize) -> &mut Self {
        self.max_memory = Some(max_memory);
        self
    }

    /// Cap on captured bytes per stream. A guest write past the cap traps.
    pub const fn max_output(&mut self, max_output: usize) -> &mut Self {
        self.max_output = Some(max_output);
        self
    }

    /// Verbosity of per-call dispatcher events. `DEBUG` or finer logs every
    /// host call.
    pub const fn log_level(&mut self, level: LevelFilter) -> &mut Self {
        self.log_level = Some(level);
        self
    }

    /// Mount a host directory into this session.
    ///
    /// If a guest path duplicates a template-level mount, this mount replaces
    /// it for that session.
    pub fn mount(
        &mut self,
        host_path: impl AsRef<Path>,
        guest_path: impl AsRef<str>,
        dir_perms: DirPerms,
        file_perms: FilePerms,
    ) -> &mut Self {
        self.directory_mappings.push(DirectoryMapping {
            host: host_path.as_ref().to_path_buf(),
            guest: guest_path.as_ref().to_string(),
            dir_perms,
            file_perms,
        });
        self
    }

    /// Add an environment variable for this session.
    ///
    /// If the same key is set multiple times, the last value wins.
    pub fn env(&mut self, k: impl AsRef<str>, v: impl AsRef<str>) -> &mut Self {
        self.env
            .push((k.as_ref().to_string(), v.as_ref().to_string()));
        self
    }

    /// Merge `overrides` into this options value and return the merged result.
    ///
    /// Merge behavior:
    /// - scalar settings: override wins when set.
    /// - mounts: override entries replace on guest-path collision.
    /// - `env`: override values replace by matching key.
    #[must_use]
    pub fn merged_with(&self, overrides: &Self) -> Self {
        let mut merged = self.clone();

        if let Some(codec) = &overrides.codec {
            merged.codec = Some(Arc::clone(codec));
        }
        merged.max_memory = overrides.max_memory.or(merged.max_memory);
        merged.max_output = overrides.max_output.or(merged.max_output);
        merged.log_level = overrides.log_level.or(merged.log_level);

        for mapping in &overrides.directory_mappings {
            if let Some(existing) = merged
                .directory_mappings
                .iter_mut()
                .find(|m| m.guest == mapping.guest)
            {
                *existing = mapping.clone();
            } else {
                merged.directory_mappings.push(mapping.clone());
            }
        }

        for (key, value) in &overrides.env {
            if let Some(existing) = merged.env.iter_mut().find(|(k, _)| k == key) {
                existing.1.clone_from(value);
            } else {
                merged.env.push((key.clone(), value.clone()));
            }
        }

        merged
    }

    fn log_calls(&self) -> bool {
        tracing::Level::DEBUG <= self.log_level.unwrap_or(LevelFilter::OFF)
    }
}

/// Builder for compiling a reusable [`PluginTemplate`].
#[derive(Default)]
pub struct PluginTemplateBuilder {
    cache: Option<PathBuf>,
    base_options: SessionOptions,
}

impl PluginTemplateBuilder {
    /// Set the optional compile cache directory.
    ///
    /// When set, compiled artifacts are cached on disk and reused across
    /// builds.
    #[must_use]
    pub fn cache(mut self, cache: Option<PathBuf>) -> Self {
        self.cache = cache;
        self
    }

    /// Set the per-session memory hard limit.
    ///
    /// Defaults to [`DEFAULT_MAX_MEMORY`].
    #[must_use]
    pub const fn max_memory(mut self, max_memory: usize) -> Self {
        self.base_options.max_memory = Some(max_memory);
        self
    }

    /// Set base directory mappings shared by all sessions from this template.
    ///
    /// These can be extended or overridden per instantiation via
    /// [`SessionOptions::mount`].
    #[must_use]
    pub fn mount(
        mut self,
        host_path: impl AsRef<Path>,
        guest_path: impl AsRef<str>,
        dir_perms: DirPerms,
        file_perms: FilePerms,
    ) -> Self {
        self.base_options
            .mount(host_path, guest_path, dir_perms, file_perms);
        self
    }

    /// Add an environment variable present in every session's WASI env.
    #[must_use]
    pub fn env(mut self, k: impl AsRef<str>, v: impl AsRef<str>) -> Self {
        self.base_options.env(k, v);
        self
    }

    /// Template-wide defaults for [`SessionOptions`].
    #[must_use]
    pub fn options(mut self, options: &SessionOptions) -> Self {
        self.base_options = self.base_options.merged_with(options);
        self
    }

    /// # Errors
    /// Returns an error if the plugin cannot be read, compiled or linked.
    pub fn build(self, wasm: impl AsRef<Path>) -> Result<PluginTemplate> {
        let wasm_bytes = std::fs::read(wasm.as_ref())?;
        self.build_from_bytes(&wasm_bytes)
    }

    /// # Errors
    /// Returns an error if the plugin cannot be compiled or linked.
    pub fn build_from_bytes(self, wasm_bytes: &[u8]) -> Result<PluginTemplate> {
        let _span = tracing::info_span!(
            target: TRACE_TARGET_BRIDGE,
            "template.build",
            bytes = wasm_bytes.len(),
            cached = self.cache.is_some()
        )
        .entered();

        let engine = new_engine()?;
        let module = load_or_compile_module(&engine, wasm_bytes, self.cache.as_deref())?;
        let linker = InstanceState::new_linker(&engine).map_err(Error::Wasm)?;
        let pre = linker.instantiate_pre(&module).map_err(Error::Wasm)?;
        Engine::tls_eager_initialize();

        Ok(PluginTemplate {
            base_options: self.base_options,
            engine,
            pre,
        })
    }
}

/// Compiled guest plugin that can instantiate multiple sessions.
///
/// A `PluginTemplate` is immutable. Each [`Session`] created from it has its
/// own store, memory, reference table and captured output.
pub struct PluginTemplate {
    base_options: SessionOptions,
    engine: Engine,
    pre: InstancePre<InstanceState>,
}

impl PluginTemplate {
    #[must_use]
    pub fn builder() -> PluginTemplateBuilder {
        PluginTemplateBuilder::default()
    }

    /// Create a new session with its own registrations.
    ///
    /// Runs the guest's `_initialize` (when exported) and `plugin_init`
    /// before returning. If any step fails, whatever was already set up is
    /// released before the error is returned.
    ///
    /// # Errors
    /// Returns an error if the scratch directory, store or instance cannot be
    /// created, or [`Error::GuestExecutionFailed`] if guest initialization
    /// traps.
    pub fn instantiate(
        &self,
        registrations: Registrations,
        options: SessionOptions,
    ) -> Result<Session> {
        let _span = tracing::info_span!(target: TRACE_TARGET_BRIDGE, "session.instantiate")
            .entered();
        let merged = self.base_options.merged_with(&options);
        let codec = merged
            .codec
            .clone()
            .unwrap_or_else(|| Arc::new(JsonCodec));
        let Registrations {
            builtins,
            invokables,
        } = registrations;
        let max_output = merged.max_output.unwrap_or(DEFAULT_MAX_OUTPUT);

        let mut session = Session {
            store: None,
            exports: None,
            stdout: Some(CapturedOutput::new("stdout", max_output)),
            stderr: Some(CapturedOutput::new("stderr", max_output)),
            scratch: Some(tempfile::Builder::new().prefix("pybridge-").tempdir()?),
            prelude: generate_prelude(&builtins, codec.as_ref()),
            invokables,
            codec: Arc::clone(&codec),
            closed: false,
        };

        if let Err(e) = session.start(self, &merged, Arc::new(builtins), codec) {
            if let Err(close_err) = session.close() {
                tracing::warn!(
                    target: TRACE_TARGET_BRIDGE,
                    error = %close_err,
                    "failed to release partially constructed session"
                );
            }
            return Err(e);
        }
        Ok(session)
    }
}

/// One live guest instance plus everything the bridge keeps for it.
///
/// Not internally synchronized; every operation takes `&mut self`, so at most
/// one guest call is in flight.
pub struct Session {
    store: Option<Store<InstanceState>>,
    exports: Option<GuestExports>,
    stdout: Option<CapturedOutput>,
    stderr: Option<CapturedOutput>,
    scratch: Option<TempDir>,
    prelude: String,
    invokables: InvokableRegistry,
    codec: Arc<dyn Codec>,
    closed: bool,
}

impl Session {
    fn start(
        &mut self,
        template: &PluginTemplate,
        options: &SessionOptions,
        builtins: Arc<BuiltinRegistry>,
        codec: Arc<dyn Codec>,
    ) -> Result<()> {
        let (Some(stdout), Some(stderr), Some(scratch)) =
            (&self.stdout, &self.stderr, &self.scratch)
        else {
            return Err(Error::SessionClosed);
        };
        let store = InstanceState::new(
            &template.engine,
            InstanceConfig {
                directory_mappings: &options.directory_mappings,
                env: &options.env,
                scratch: scratch.path(),
                stdout,
                stderr,
                max_memory: options.max_memory.unwrap_or(DEFAULT_MAX_MEMORY),
                builtins,
                codec,
                log_calls: options.log_calls(),
            },
        )
        .map_err(Error::Wasm)?;

        let store = self.store.insert(store);
        let instance = template.pre.instantiate(&mut *store).map_err(Error::Wasm)?;
        let exports = GuestExports::load(&mut *store, &instance).map_err(Error::Wasm)?;
        store.data_mut().bind_exports(exports.clone());
        let init = exports.initialize(&mut *store);
        self.exports = Some(exports);
        init.map_err(|e| self.guest_failure(e))
    }

    /// Run `source` in the guest with the prelude prepended.
    ///
    /// The code buffer is returned to the guest allocator only when the guest
    /// finishes normally. After a trap the allocator state is unknown, so the
    /// buffer is left in place and each trapped call grows the guest heap.
    ///
    /// # Errors
    /// Returns [`Error::GuestExecutionFailed`] if the guest traps, with both
    /// captured streams and, when a host call caused the trap, the bridge
    /// error as its cause. Returns [`Error::SessionClosed`] after
    /// [`Session::close`].
    pub fn exec(&mut self, source: &str) -> Result<()> {
        let _span = tracing::info_span!(
            target: TRACE_TARGET_BRIDGE,
            "session.exec",
            bytes = source.len()
        )
        .entered();
        let (false, Some(store), Some(exports)) =
            (self.closed, self.store.as_mut(), self.exports.as_ref())
        else {
            return Err(Error::SessionClosed);
        };

        let mut code = String::with_capacity(self.prelude.len() + source.len());
        code.push_str(&self.prelude);
        code.push_str(source);
        let buffer = WasmMemory::new(&mut *store, exports).write_buffer(code.as_bytes())?;

        match exports.eval(&mut *store, buffer) {
            Ok(()) => WasmMemory::new(&mut *store, exports).deallocate(buffer.offset),
            Err(e) => Err(self.guest_failure(e)),
        }
    }

    fn guest_failure(&self, err: anyhow::Error) -> Error {
        let trap = err.to_string();
        let cause = err.downcast::<Error>().ok().map(Box::new);
        Error::GuestExecutionFailed {
            trap,
            stdout: self.stdout.as_ref().map(CapturedOutput::text).unwrap_or_default(),
            stderr: self.stderr.as_ref().map(CapturedOutput::text).unwrap_or_default(),
            cause,
        }
    }

    /// Everything the guest wrote to stdout since creation or the last
    /// [`Session::clear_output`].
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] after [`Session::close`].
    pub fn stdout(&self) -> Result<String> {
        self.stdout
            .as_ref()
            .map(CapturedOutput::text)
            .ok_or(Error::SessionClosed)
    }

    /// Like [`Session::stdout`], for stderr.
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] after [`Session::close`].
    pub fn stderr(&self) -> Result<String> {
        self.stderr
            .as_ref()
            .map(CapturedOutput::text)
            .ok_or(Error::SessionClosed)
    }

    /// Forget captured output so far on both streams.
    ///
    /// # Errors
    /// Returns [`Error::SessionClosed`] after [`Session::close`].
    pub fn clear_output(&mut self) -> Result<()> {
        let (Some(stdout), Some(stderr)) = (self.stdout.as_mut(), self.stderr.as_mut()) else {
            return Err(Error::SessionClosed);
        };
        stdout.clear();
        stderr.clear();
        Ok(())
    }

    /// Encode a call into a registered guest function, inserting host
    /// references into this session's table.
    ///
    /// # Errors
    /// See [`InvokableRegistry::compute_call_payload`]; also
    /// [`Error::SessionClosed`] after [`Session::close`].
    pub fn call_payload(
        &mut self,
        module: &str,
        function: &str,
        args: &[Value],
    ) -> Result<Vec<u8>> {
        let store = self.store.as_mut().ok_or(Error::SessionClosed)?;
        self.invokables.compute_call_payload(
            store.data_mut().refs_mut(),
            self.codec.as_ref(),
            module,
            function,
            args,
        )
    }

    /// Guest source prepended to every [`Session::exec`].
    #[must_use]
    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    #[must_use]
    pub const fn invokables(&self) -> &InvokableRegistry {
        &self.invokables
    }

    /// Committed guest linear memory in bytes.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.store
            .as_ref()
            .map_or(0, |store| store.data().limiter.current())
    }

    /// Largest committed guest linear memory seen so far.
    #[must_use]
    pub fn peak_memory_usage(&self) -> usize {
        self.store
            .as_ref()
            .map_or(0, |store| store.data().limiter.peak())
    }

    /// Number of host objects handed to the guest so far.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.store
            .as_ref()
            .map_or(0, |store| store.data().refs().len())
    }

    /// Release the instance, the captured streams and the scratch directory.
    ///
    /// Every release is attempted even if an earlier one fails; the first
    /// failure is returned. Calling `close` again is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::ResourceCloseFailed`] for the first resource that
    /// could not be released.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _span = tracing::info_span!(target: TRACE_TARGET_BRIDGE, "session.close").entered();

        // Dropping the store drops the instance and the WASI context, which
        // holds the other end of both output pipes.
        self.exports = None;
        drop(self.store.take());

        let mut first = None;
        for output in [self.stdout.take(), self.stderr.take()].into_iter().flatten() {
            if let Err(e) = output.release() {
                tracing::warn!(target: TRACE_TARGET_BRIDGE, error = %e, "session close");
                first.get_or_insert(e);
            }
        }
        if let Some(scratch) = self.scratch.take()
            && let Err(source) = scratch.close()
        {
            let e = Error::ResourceCloseFailed {
                resource: "scratch directory",
                source,
            };
            tracing::warn!(target: TRACE_TARGET_BRIDGE, error = %e, "session close");
            first.get_or_insert(e);
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(
                target: TRACE_TARGET_BRIDGE,
                error = %e,
                "failed to close session on drop"
            );
        }
    }
}
