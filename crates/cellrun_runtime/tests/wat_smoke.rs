use std::sync::Arc;

use cellrun_runtime::engine::{EngineLoader, InstanceFactory, RunOutput};
use cellrun_runtime::RuntimeError;

fn calculator_wasm() -> Vec<u8> {
    wat::parse_str(include_str!("fixtures/calculator.wat")).expect("calculator fixture parses")
}

#[tokio::test]
async fn load_is_cached_per_loader() -> anyhow::Result<()> {
    let loader = EngineLoader::new()?;
    let wasm = calculator_wasm();

    let first = loader.load(&wasm).await?;
    let second = loader.load(&wasm).await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.cached_modules().await, 1);
    assert_eq!(first.abi().init_export, Some("_initialize"));
    Ok(())
}

#[tokio::test]
async fn malformed_bytes_fail_to_load() -> anyhow::Result<()> {
    let loader = EngineLoader::new()?;
    let err = match loader.load(b"definitely not wasm").await {
        Ok(_) => panic!("malformed bytes must not load"),
        Err(err) => err,
    };
    assert!(matches!(err, RuntimeError::EngineLoad(_)), "{err}");
    assert_eq!(loader.cached_modules().await, 0);
    Ok(())
}

#[tokio::test]
async fn missing_exports_fail_to_load() -> anyhow::Result<()> {
    let wasm = wat::parse_str(
        r#"
(module
  (memory (export "memory") 1)
  (func (export "cellrun_alloc") (param i32) (result i32) (i32.const 0))
)
"#,
    )?;
    let loader = EngineLoader::new()?;
    let err = match loader.load(&wasm).await {
        Ok(_) => panic!("module without cellrun_run must not load"),
        Err(err) => err,
    };
    match err {
        RuntimeError::EngineLoad(message) => assert!(message.contains("cellrun_run"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn new_instance_evaluates_input() -> anyhow::Result<()> {
    let loader = EngineLoader::new()?;
    let module = loader.load(&calculator_wasm()).await?;
    let (instance, _termination) = InstanceFactory::default().start(module).await?;

    assert!(instance.is_alive());
    assert_eq!(instance.run_count(), 0);

    let output = instance.run("2+2").await?;
    assert_eq!(
        output,
        RunOutput {
            stdout: "4\n".to_string(),
            stderr: String::new(),
        }
    );
    assert_eq!(instance.run_count(), 1);

    let output = instance.run("!oops").await?;
    assert_eq!(output.stdout, "");
    assert_eq!(output.stderr, "oops\n");
    assert_eq!(instance.run_count(), 2);
    Ok(())
}

#[tokio::test]
async fn wasip1_stdout_is_captured_per_call() -> anyhow::Result<()> {
    let wat_src = r#"
(module
  (import "cellrun" "ready" (func $ready (param i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))

  (memory (export "memory") 1)

  ;; iovec[0] = { ptr=8, len=12 }
  (data (i32.const 8) "hello world\n")

  (func (export "_initialize")
    (call $ready (i32.const 1)))

  (func (export "cellrun_alloc") (param i32) (result i32)
    (i32.const 1024))

  (func (export "cellrun_run") (param i32 i32)
    (i32.store (i32.const 0) (i32.const 8))
    (i32.store (i32.const 4) (i32.const 12))
    ;; fd_write(fd=1, iovs=0, iovs_len=1, nwritten=20)
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 20))
    drop)
)
"#;

    let loader = EngineLoader::new()?;
    let module = loader.load(&wat::parse_str(wat_src)?).await?;
    let (instance, _termination) = InstanceFactory::default().start(module).await?;

    assert_eq!(instance.run("").await?.stdout, "hello world\n");
    assert_eq!(instance.run("").await?.stdout, "hello world\n");
    Ok(())
}

#[tokio::test]
async fn guest_state_persists_across_calls() -> anyhow::Result<()> {
    let loader = EngineLoader::new()?;
    let module = loader.load(&calculator_wasm()).await?;
    let (instance, _termination) = InstanceFactory::default().start(module).await?;

    assert_eq!(instance.run("seq").await?.stdout, "0\n");
    assert_eq!(instance.run("seq").await?.stdout, "1\n");
    assert_eq!(instance.run("hello").await?.stdout, "hello\n");
    Ok(())
}
