use anyhow::{Context, Result};
use pybridge::{Error, HostRef, SessionOptions, ValType, Value};
use tracing::level_filters::LevelFilter;

use super::common::{Counter, SharedBuf, call, call_line, session, session_with};

fn call_err(session: &mut pybridge::Session, module: &str, function: &str, args: &str) -> Result<Error> {
    session
        .exec(&call_line(module, function, args))
        .err()
        .context("call should fail")
}

#[test]
fn add_through_dispatcher() -> Result<()> {
    let mut session = session()?;
    assert_eq!(call(&mut session, "math", "add", "[2, 3]")?, "5");
    assert_eq!(call(&mut session, "math", "add", "[-7, 7]")?, "0");
    Ok(())
}

#[test]
fn unknown_names_are_distinguished() -> Result<()> {
    let mut session = session()?;
    let err = call_err(&mut session, "nope", "add", "[]")?;
    assert!(matches!(err.root_cause(), Error::UnknownModule { .. }));

    let err = call_err(&mut session, "math", "mul", "[]")?;
    assert!(matches!(
        err.root_cause(),
        Error::UnknownFunction { module, function } if module == "math" && function == "mul"
    ));
    Ok(())
}

#[test]
fn host_refs_round_trip_by_identity() -> Result<()> {
    let mut session = session()?;
    let handle = call(&mut session, "objects", "make", "[7]")?;
    assert_eq!(handle, "0");
    assert_eq!(session.reference_count(), 1);

    // Handing the reference back re-emits the same handle.
    assert_eq!(call(&mut session, "objects", "same", &format!("[{handle}]"))?, handle);
    assert_eq!(session.reference_count(), 1);

    assert_eq!(
        call(&mut session, "objects", "inspect", &format!("[{handle}]"))?,
        "\"counter=7\""
    );

    assert_eq!(call(&mut session, "objects", "make", "[9]")?, "1");
    assert_eq!(
        call(&mut session, "objects", "inspect", "[1]")?,
        "\"counter=9\""
    );
    Ok(())
}

#[test]
fn invalid_handles_are_rejected() -> Result<()> {
    let mut session = session()?;
    let err = call_err(&mut session, "objects", "inspect", "[3]")?;
    assert!(matches!(
        err.root_cause(),
        Error::InvalidHandle { handle: 3, len: 0 }
    ));

    call(&mut session, "objects", "make", "[1]")?;
    let err = call_err(&mut session, "objects", "inspect", "[-1]")?;
    assert!(matches!(err.root_cause(), Error::InvalidHandle { handle: -1, len: 1 }));
    Ok(())
}

#[test]
fn arguments_are_type_checked() -> Result<()> {
    let mut session = session()?;
    let err = call_err(&mut session, "math", "add", r#"[1, "two"]"#)?;
    assert!(matches!(
        err.root_cause(),
        Error::TypeMismatch { expected: ValType::Integer, found, .. } if found == "string"
    ));

    let err = call_err(&mut session, "math", "add", r#"{"a": 1}"#)?;
    assert!(matches!(err.root_cause(), Error::Decode { .. }));
    Ok(())
}

#[test]
fn missing_trailing_args_are_null() -> Result<()> {
    let mut session = session()?;
    assert_eq!(call(&mut session, "math", "greet", "[]")?, "\"hello, world\"");
    assert_eq!(call(&mut session, "math", "greet", r#"["hi"]"#)?, "\"hi, world\"");
    assert_eq!(
        call(&mut session, "math", "greet", r#"["hi", "there"]"#)?,
        "\"hi, there\""
    );
    assert_eq!(
        call(&mut session, "math", "greet", r#"[null, "you"]"#)?,
        "\"hello, you\""
    );
    Ok(())
}

#[test]
fn extra_args_are_an_arity_mismatch() -> Result<()> {
    let mut session = session()?;
    let err = call_err(&mut session, "math", "add", "[1, 2, 3]")?;
    assert!(matches!(
        err.root_cause(),
        Error::ArityMismatch { expected: 2, actual: 3, .. }
    ));
    Ok(())
}

#[test]
fn body_errors_are_not_swallowed() -> Result<()> {
    let mut session = session()?;
    let err = call_err(&mut session, "math", "fail", "[]")?;
    let Error::InvocationError { source, .. } = err.root_cause() else {
        anyhow::bail!("unexpected error: {err}");
    };
    assert_eq!(source.to_string(), "deliberate failure");
    Ok(())
}

#[test]
fn unit_results_are_null() -> Result<()> {
    let mut session = session()?;
    assert_eq!(call(&mut session, "math", "ignore", r#"[{"k": [1, 2]}]"#)?, "null");
    Ok(())
}

#[test]
fn oversized_results_fail_allocation() -> Result<()> {
    let mut options = SessionOptions::default();
    options.max_memory(128 * 1024);
    let mut session = session_with(options)?;

    assert_eq!(call(&mut session, "math", "blob", "[4]")?, "\"xxxx\"");
    let err = call_err(&mut session, "math", "blob", "[262144]")?;
    assert!(matches!(err.root_cause(), Error::AllocationFailed { .. }));
    assert!(session.memory_usage() <= 128 * 1024);
    Ok(())
}

#[test]
fn exhausted_guest_heap_adds_no_handles() -> Result<()> {
    // The test guest never frees, so a fixed heap runs out after some calls.
    let mut options = SessionOptions::default();
    options.max_memory(64 * 1024);
    let mut session = session_with(options)?;

    let mut made = 0;
    let err = loop {
        match session.exec(&call_line("objects", "make", &format!("[{made}]"))) {
            Ok(()) => made += 1,
            Err(e) => break e,
        }
        anyhow::ensure!(made < 10_000, "guest heap never ran out");
    };
    assert!(matches!(err.root_cause(), Error::AllocationFailed { .. }));
    assert_eq!(session.reference_count(), made);

    let err = call_err(&mut session, "objects", "make", &format!("[{made}]"))?;
    assert!(matches!(err.root_cause(), Error::AllocationFailed { .. }));
    assert_eq!(session.reference_count(), made);
    Ok(())
}

#[test]
fn call_payload_uses_session_table() -> Result<()> {
    let mut session = session()?;
    call(&mut session, "objects", "make", "[5]")?;
    let resolved_elsewhere = HostRef::new(Counter { start: 1 });

    let payload = session.call_payload(
        "handlers",
        "on_item",
        &[Value::from("item"), Value::from(resolved_elsewhere)],
    )?;
    let decoded: serde_json::Value = serde_json::from_slice(&payload)?;
    assert_eq!(decoded, serde_json::json!(["item", 1]));
    assert_eq!(session.reference_count(), 2);

    let err = session
        .call_payload("handlers", "on_item", &[Value::from("item")])
        .err()
        .context("arity should be checked")?;
    assert!(matches!(err, Error::ArityMismatch { expected: 2, actual: 1, .. }));

    let err = session
        .call_payload("handlers", "missing", &[])
        .err()
        .context("lookup should fail")?;
    assert!(matches!(err, Error::UnknownFunction { .. }));
    Ok(())
}

#[test]
fn debug_level_logs_each_call() -> Result<()> {
    let logs = SharedBuf::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || -> Result<()> {
        let mut quiet = session()?;
        call(&mut quiet, "math", "add", "[1, 1]")?;

        let mut options = SessionOptions::default();
        options.log_level(LevelFilter::DEBUG);
        let mut verbose = session_with(options)?;
        call(&mut verbose, "math", "add", "[2, 2]")?;
        Ok(())
    })?;

    let contents = logs.contents();
    assert_eq!(contents.matches("host call returned").count(), 1);
    assert!(contents.contains("module=math"));
    assert!(contents.contains("result_len=1"));
    Ok(())
}
