use wasmtime::{Config, Engine};

use crate::error::{Error, Result};

pub fn configure_engine(cfg: &mut Config) {
    cfg.table_lazy_init(false);
    cfg.generate_address_map(false);
    cfg.wasm_backtrace(false);
    cfg.native_unwind_info(false);
    cfg.cranelift_opt_level(wasmtime::OptLevel::Speed);
}

pub fn new_engine() -> Result<Engine> {
    let mut cfg = Config::default();
    configure_engine(&mut cfg);
    Engine::new(&cfg).map_err(Error::Wasm)
}
