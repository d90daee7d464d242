use anyhow::{Context as _, anyhow};
use wasmtime::{AsContextMut, Instance, Memory, TypedFunc};

use crate::{
    error::{Error, Result},
    memory::{GuestMemory, WidePtr, checked_range},
};

/// Entry points the guest plugin exports.
#[derive(Clone)]
pub struct GuestExports {
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
    eval: TypedFunc<(i32, i32), ()>,
    init: TypedFunc<(), ()>,
    reactor_init: Option<TypedFunc<(), ()>>,
}

impl GuestExports {
    pub fn load(mut store: impl AsContextMut, instance: &Instance) -> anyhow::Result<Self> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("guest does not export `memory`"))?;
        let mut func = |name: &str| {
            instance
                .get_func(&mut store, name)
                .with_context(|| format!("guest does not export `{name}`"))
        };
        let malloc = func("plugin_malloc")?;
        let free = func("plugin_free")?;
        let eval = func("plugin_eval")?;
        let init = func("plugin_init")?;
        let reactor_init = instance.get_func(&mut store, "_initialize");

        Ok(Self {
            memory,
            malloc: malloc.typed(&store)?,
            free: free.typed(&store)?,
            eval: eval.typed(&store)?,
            init: init.typed(&store)?,
            reactor_init: reactor_init.map(|f| f.typed(&store)).transpose()?,
        })
    }

    /// Run the reactor constructor, if any, then the plugin's own init.
    pub fn initialize(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        if let Some(reactor_init) = &self.reactor_init {
            reactor_init.call(&mut store, ())?;
        }
        self.init.call(&mut store, ())
    }

    pub fn eval(&self, store: impl AsContextMut, code: WidePtr) -> anyhow::Result<()> {
        self.eval
            .call(store, (code.offset.cast_signed(), code.len.cast_signed()))
    }
}

/// [`GuestMemory`] over a live instance, usable with a `Store` or a `Caller`.
pub struct WasmMemory<'a, C> {
    ctx: C,
    exports: &'a GuestExports,
}

impl<'a, C: AsContextMut> WasmMemory<'a, C> {
    pub const fn new(ctx: C, exports: &'a GuestExports) -> Self {
        Self { ctx, exports }
    }
}

impl<C> GuestMemory for WasmMemory<'_, C>
where
    C: AsContextMut,
    C::Data: 'static,
{
    fn read_bytes(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let data = self.exports.memory.data(&self.ctx);
        let range = checked_range(offset, len as usize, data.len())?;
        Ok(data[range].to_vec())
    }

    fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let data = self.exports.memory.data_mut(&mut self.ctx);
        let range = checked_range(offset, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn allocate(&mut self, len: u32) -> Result<u32> {
        let ptr = self
            .exports
            .malloc
            .call(&mut self.ctx, len.cast_signed())
            .map_err(|e| Error::AllocationFailed {
                len,
                reason: format!("{e:#}"),
            })?;
        if ptr == 0 && len != 0 {
            return Err(Error::AllocationFailed {
                len,
                reason: "guest allocator returned null".to_string(),
            });
        }
        Ok(ptr.cast_unsigned())
    }

    fn deallocate(&mut self, offset: u32) -> Result<()> {
        self.exports
            .free
            .call(&mut self.ctx, offset.cast_signed())
            .map_err(Error::Wasm)
    }
}
