use std::{
    env,
    path::{Path, PathBuf},
    sync::{Mutex, Once, OnceLock},
};

use anyhow::{Context, Result};
use pybridge::{
    Builtins, DirPerms, FilePerms, HostRef, PluginTemplate, Registrations, Session,
    SessionOptions, ValType, Value,
};

fn workspace_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .context("failed to resolve workspace root from CARGO_MANIFEST_DIR")
}

fn print_skip_once(message: String) {
    static SKIP_MESSAGE_ONCE: Once = Once::new();
    SKIP_MESSAGE_ONCE.call_once(|| {
        eprintln!("{message}");
    });
}

fn resolve_prereqs() -> Option<(PathBuf, Option<PathBuf>)> {
    let Some(wasm) = env::var_os("PYBRIDGE_PYTHON_WASM").map(PathBuf::from) else {
        print_skip_once(
            "skipping integration_python tests: set PYBRIDGE_PYTHON_WASM to a CPython plugin build."
                .to_string(),
        );
        return None;
    };
    if !wasm.is_file() {
        print_skip_once(format!(
            "skipping integration_python tests: missing plugin at '{}'.",
            wasm.display()
        ));
        return None;
    }
    let lib_dir = env::var_os("PYBRIDGE_PYTHON_LIB").map(PathBuf::from);
    Some((wasm, lib_dir))
}

fn build_template_lock() -> &'static Mutex<()> {
    static BUILD_TEMPLATE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    BUILD_TEMPLATE_LOCK.get_or_init(|| Mutex::new(()))
}

pub(crate) fn build_template() -> Result<Option<PluginTemplate>> {
    // Tests run in parallel and share the cache directory.
    let _guard = build_template_lock()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let Some((wasm, lib_dir)) = resolve_prereqs() else {
        return Ok(None);
    };

    let mut builder = PluginTemplate::builder()
        .cache(Some(workspace_root()?.join("target").join("cache")));
    if let Some(lib_dir) = lib_dir {
        builder = builder.mount(lib_dir, "/usr/local/lib", DirPerms::READ, FilePerms::READ);
    }
    let template = builder
        .build(&wasm)
        .context("failed to build template from python plugin")?;
    Ok(Some(template))
}

#[derive(Debug)]
pub(crate) struct Account {
    pub(crate) owner: String,
}

pub(crate) fn registrations() -> Result<Registrations> {
    let math = Builtins::builder("math")
        .add(
            "add",
            [ValType::Integer, ValType::Integer],
            ValType::Integer,
            |args| {
                let a = args[0].as_i64().ok_or("a is required")?;
                let b = args[1].as_i64().ok_or("b is required")?;
                Ok(Value::Integer(a + b))
            },
        )
        .build()?;
    let accounts = Builtins::builder("accounts")
        .add("open", [ValType::String], ValType::HostRef, |args| {
            let owner = args[0].as_str().ok_or("owner is required")?.to_string();
            Ok(HostRef::new(Account { owner }).into())
        })
        .add("owner", [ValType::HostRef], ValType::String, |args| {
            let account = args[0]
                .as_host_ref()
                .and_then(HostRef::downcast_ref::<Account>)
                .ok_or("expected an account")?;
            Ok(Value::from(account.owner.as_str()))
        })
        .build()?;
    Registrations::builder()
        .builtins(math)
        .builtins(accounts)
        .build()
        .context("failed to build registrations")
}

pub(crate) fn session() -> Result<Option<Session>> {
    let Some(template) = build_template()? else {
        return Ok(None);
    };
    let session = template
        .instantiate(registrations()?, SessionOptions::default())
        .context("failed to instantiate session")?;
    Ok(Some(session))
}
