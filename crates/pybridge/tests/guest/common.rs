use std::{
    io,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use pybridge::{
    Builtins, HostRef, Invokables, PluginTemplate, Registrations, Session, SessionOptions,
    ValType, Value,
};

/// Minimal plugin implementing the guest ABI without an interpreter.
///
/// `plugin_eval` looks for a `module\0function\0args` line at the end of the
/// code it is given and forwards it to `pybridge.wasm_invoke`, printing the
/// result and a newline to stdout. Code without such a line is echoed to
/// stdout verbatim. Code ending in `!` prints a line to each stream and
/// traps.
pub(crate) const GUEST_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "pybridge" "wasm_invoke"
    (func $invoke (param i32 i32 i32 i32 i32 i32) (result i32)))

  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))

  (data (i32.const 64) "boom: guest raised\n")
  (data (i32.const 96) "before failure\n")
  (data (i32.const 112) "\n")

  (func $write (param $fd i32) (param $ptr i32) (param $len i32)
    (i32.store (i32.const 0) (local.get $ptr))
    (i32.store (i32.const 4) (local.get $len))
    (drop (call $fd_write (local.get $fd) (i32.const 0) (i32.const 1) (i32.const 8))))

  (func $malloc (export "plugin_malloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local $size i32)
    (local.set $ptr (global.get $heap))
    (local.set $end
      (i32.and
        (i32.add (i32.add (local.get $ptr) (local.get $len)) (i32.const 7))
        (i32.const -8)))
    (local.set $size (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $size))
      (then
        (if (i32.eq
              (memory.grow
                (i32.shr_u
                  (i32.add (i32.sub (local.get $end) (local.get $size)) (i32.const 65535))
                  (i32.const 16)))
              (i32.const -1))
          (then (return (i32.const 0))))))
    (global.set $heap (local.get $end))
    (local.get $ptr))

  (func $free (export "plugin_free") (param i32))

  (func (export "plugin_init"))

  (func (export "plugin_eval") (param $ptr i32) (param $len i32)
    (local $i i32)
    (local $end i32)
    (local $first i32)
    (local $second i32)
    (local $line i32)
    (local $out i32)
    (local $result i32)
    (local.set $end (i32.add (local.get $ptr) (local.get $len)))

    (if (i32.gt_u (local.get $len) (i32.const 0))
      (then
        (if (i32.eq (i32.load8_u (i32.sub (local.get $end) (i32.const 1))) (i32.const 33))
          (then
            (call $write (i32.const 1) (i32.const 96) (i32.const 15))
            (call $write (i32.const 2) (i32.const 64) (i32.const 19))
            (unreachable)))))

    (local.set $first (i32.const -1))
    (local.set $second (i32.const -1))
    (local.set $i (local.get $ptr))
    (block $done
      (loop $scan
        (br_if $done (i32.ge_u (local.get $i) (local.get $end)))
        (if (i32.eqz (i32.load8_u (local.get $i)))
          (then
            (if (i32.eq (local.get $first) (i32.const -1))
              (then (local.set $first (local.get $i)))
              (else
                (local.set $second (local.get $i))
                (br $done)))))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $scan)))

    (if (i32.eq (local.get $second) (i32.const -1))
      (then
        (call $write (i32.const 1) (local.get $ptr) (local.get $len))
        (return)))

    (local.set $line (local.get $first))
    (block $found
      (loop $back
        (br_if $found (i32.le_u (local.get $line) (local.get $ptr)))
        (br_if $found
          (i32.eq (i32.load8_u (i32.sub (local.get $line) (i32.const 1))) (i32.const 10)))
        (local.set $line (i32.sub (local.get $line) (i32.const 1)))
        (br $back)))

    (local.set $out
      (call $invoke
        (local.get $line)
        (i32.sub (local.get $first) (local.get $line))
        (i32.add (local.get $first) (i32.const 1))
        (i32.sub (local.get $second) (i32.add (local.get $first) (i32.const 1)))
        (i32.add (local.get $second) (i32.const 1))
        (i32.sub (local.get $end) (i32.add (local.get $second) (i32.const 1)))))
    (local.set $result (i32.load (local.get $out)))
    (call $write (i32.const 1) (local.get $result) (i32.load offset=4 (local.get $out)))
    (call $write (i32.const 1) (i32.const 112) (i32.const 1))
    (call $free (local.get $result))
    (call $free (local.get $out))))
"#;

pub(crate) fn guest_wasm() -> Result<Vec<u8>> {
    wat::parse_str(GUEST_WAT).context("failed to assemble test guest")
}

/// Same guest with `plugin_init` replaced by `replacement`.
pub(crate) fn guest_wasm_with_init(replacement: &str) -> Result<Vec<u8>> {
    let source = GUEST_WAT.replace(r#"(func (export "plugin_init"))"#, replacement);
    wat::parse_str(source).context("failed to assemble test guest")
}

pub(crate) fn build_template() -> Result<PluginTemplate> {
    PluginTemplate::builder()
        .build_from_bytes(&guest_wasm()?)
        .context("failed to build template")
}

/// Call line the test guest forwards to the dispatcher.
pub(crate) fn call_line(module: &str, function: &str, args: &str) -> String {
    format!("{module}\0{function}\0{args}")
}

#[derive(Debug)]
pub(crate) struct Counter {
    pub(crate) start: i64,
}

pub(crate) fn math() -> Result<Builtins> {
    Builtins::builder("math")
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
        .add("greet", [ValType::String, ValType::String], ValType::String, |args| {
            let greeting = args[0].as_str().unwrap_or("hello");
            let name = args[1].as_str().unwrap_or("world");
            Ok(Value::from(format!("{greeting}, {name}")))
        })
        .add("fail", [], ValType::Unit, |_| {
            Err(std::io::Error::other("deliberate failure").into())
        })
        .add("ignore", [ValType::Structured], ValType::Unit, |_| Ok(Value::from(1)))
        .add("blob", [ValType::Integer], ValType::String, |args| {
            let len = usize::try_from(args[0].as_i64().unwrap_or(0))?;
            Ok(Value::from("x".repeat(len)))
        })
        .build()
        .context("failed to build math builtins")
}

pub(crate) fn objects() -> Result<Builtins> {
    Builtins::builder("objects")
        .add("make", [ValType::Integer], ValType::HostRef, |args| {
            let start = args[0].as_i64().unwrap_or_default();
            Ok(HostRef::new(Counter { start }).into())
        })
        .add("same", [ValType::HostRef], ValType::HostRef, |args| Ok(args[0].clone()))
        .add("inspect", [ValType::HostRef], ValType::String, |args| {
            let counter = args[0]
                .as_host_ref()
                .and_then(HostRef::downcast_ref::<Counter>)
                .ok_or("expected a counter")?;
            Ok(Value::from(format!("counter={}", counter.start)))
        })
        .build()
        .context("failed to build objects builtins")
}

pub(crate) fn registrations() -> Result<Registrations> {
    Registrations::builder()
        .builtins(math()?)
        .builtins(objects()?)
        .invokables(
            Invokables::builder("handlers")
                .add("on_item", [ValType::String, ValType::HostRef], ValType::Unit)
                .build()?,
        )
        .build()
        .context("failed to build registrations")
}

pub(crate) fn session() -> Result<Session> {
    session_with(SessionOptions::default())
}

pub(crate) fn session_with(options: SessionOptions) -> Result<Session> {
    build_template()?
        .instantiate(registrations()?, options)
        .context("failed to instantiate session")
}

/// Runs a call line and returns what the guest printed for it.
pub(crate) fn call(session: &mut Session, module: &str, function: &str, args: &str) -> Result<String> {
    session.clear_output()?;
    session.exec(&call_line(module, function, args))?;
    let out = session.stdout()?;
    Ok(out.strip_suffix('\n').unwrap_or(&out).to_string())
}

/// `io::Write` sink for capturing formatted tracing output.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(pub(crate) Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn contents(&self) -> String {
        let buf = self.0.lock().expect("log buffer lock");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
