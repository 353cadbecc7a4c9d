use std::sync::Arc;
use std::time::Duration;

use cellrun_runtime::engine::{EngineLoader, InstanceFactory};
use cellrun_runtime::RuntimeError;
use cellrun_session::notebook::DocumentId;
use cellrun_session::{SessionError, SessionOptions, SessionRegistry};

const CALCULATOR: &str = include_str!("../../cellrun_runtime/tests/fixtures/calculator.wat");

fn registry_for(wat: &str, options: SessionOptions) -> anyhow::Result<SessionRegistry> {
    let wasm = wat::parse_str(wat)?;
    Ok(SessionRegistry::new(
        Arc::new(EngineLoader::new()?),
        InstanceFactory::default(),
        wasm,
        options,
    ))
}

fn calculator_registry() -> anyhow::Result<SessionRegistry> {
    registry_for(CALCULATOR, SessionOptions::default())
}

#[tokio::test]
async fn concurrent_lookups_share_one_instance() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let (first, second, third) = tokio::join!(
        registry.get_instance(&doc),
        registry.get_instance(&doc),
        registry.get_instance(&doc)
    );
    let (first, second, third) = (first?, second?, third?);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(registry.len(), 1);
    Ok(())
}

#[tokio::test]
async fn documents_get_separate_instances() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let a = registry.get_instance(&DocumentId::from("a.md")).await?;
    let b = registry.get_instance(&DocumentId::from("b.md")).await?;
    assert_ne!(a.id(), b.id());

    a.run("seq").await?;
    assert_eq!(b.run("seq").await?.stdout, "0\n");
    Ok(())
}

#[tokio::test]
async fn crashed_instance_is_replaced_on_next_lookup() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let old = registry.get_instance(&doc).await?;
    old.run("seq").await?;
    assert!(old.run("crash").await.is_err());
    assert!(!old.is_alive());

    let new = registry.get_instance(&doc).await?;
    assert_ne!(new.id(), old.id());
    assert!(new.is_alive());
    assert_eq!(new.run_count(), 0);
    // Fresh state: the counter starts over.
    assert_eq!(new.run("seq").await?.stdout, "0\n");
    assert!(old.is_disposed());
    Ok(())
}

#[tokio::test]
async fn restart_disposes_old_instance_once() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let old = registry.get_instance(&doc).await?;
    registry.restart_session(&doc);
    assert!(old.is_disposed());
    assert!(!old.dispose());
    assert!(matches!(
        old.run("2+2").await,
        Err(RuntimeError::NotRunning { .. })
    ));

    let new = registry.get_instance(&doc).await?;
    assert_ne!(new.id(), old.id());
    assert_eq!(new.run("2+2").await?.stdout, "4\n");
    Ok(())
}

#[tokio::test]
async fn restart_without_session_starts_one() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    registry.restart_session(&doc);
    assert!(registry.contains(&doc));
    assert!(registry.get_instance(&doc).await?.is_alive());
    Ok(())
}

#[tokio::test]
async fn stop_and_close_dispose_once() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let instance = registry.get_instance(&doc).await?;
    assert!(registry.stop_session(&doc));
    assert!(!registry.on_document_closed(&doc));
    assert!(instance.is_disposed());
    assert!(!registry.contains(&doc));
    assert!(!registry.stop_session(&DocumentId::from("never-opened.md")));
    Ok(())
}

#[tokio::test]
async fn stopped_session_never_starts_its_instance() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let pending = registry.reserve(&doc);
    assert!(registry.stop_session(&doc));
    assert_eq!(pending.await.unwrap_err(), SessionError::Stopped(doc.clone()));
    assert!(!registry.contains(&doc));
    Ok(())
}

#[tokio::test]
async fn back_to_back_restarts_start_only_the_last_session() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let original = registry.reserve(&doc);
    registry.restart_session(&doc);
    let replaced = registry.reserve(&doc);
    registry.restart_session(&doc);
    assert!(!original.ptr_eq(&replaced));

    // Neither superseded session loads or starts anything when awaited.
    for superseded in [original, replaced] {
        let err = superseded.await.unwrap_err();
        assert_eq!(err, SessionError::Stopped(doc.clone()));
        assert_eq!(err.kind(), "NotRunningError");
    }

    let current = registry.get_instance(&doc).await?;
    assert!(current.is_alive());
    assert_eq!(current.run("2+2").await?.stdout, "4\n");
    Ok(())
}

#[tokio::test]
async fn session_retired_during_start_disposes_the_new_instance() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let pending = registry.reserve(&doc);
    let starting = tokio::spawn(pending.clone());
    // Let the start get under way before the session is ended.
    tokio::task::yield_now().await;
    registry.restart_session(&doc);

    match starting.await? {
        Ok(instance) => assert!(instance.is_disposed()),
        Err(err) => assert_eq!(err, SessionError::Stopped(doc.clone())),
    }
    assert!(registry.get_instance(&doc).await?.is_alive());
    Ok(())
}

#[test]
fn ending_sessions_does_not_need_an_async_runtime() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let a = DocumentId::from("a.md");
    let b = DocumentId::from("b.md");

    registry.reserve(&a);
    registry.reserve(&b);
    assert!(registry.stop_session(&a));
    assert!(!registry.on_document_closed(&a));
    registry.restart_session(&b);
    assert_eq!(registry.dispose_all(), 1);
    assert!(registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn dispose_all_ends_every_session() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let a = registry.get_instance(&DocumentId::from("a.md")).await?;
    let b = registry.get_instance(&DocumentId::from("b.md")).await?;

    assert_eq!(registry.dispose_all(), 2);
    assert!(a.is_disposed());
    assert!(b.is_disposed());
    assert!(registry.is_empty());
    assert_eq!(registry.dispose_all(), 0);
    Ok(())
}

#[tokio::test]
async fn handshake_timeout_fails_the_session() -> anyhow::Result<()> {
    let registry = registry_for(
        r#"
(module
  (import "cellrun" "ready" (func $ready (param i32)))
  (memory (export "memory") 1)
  (func (export "_initialize") (loop $forever (br $forever)))
  (func (export "cellrun_alloc") (param i32) (result i32) (i32.const 0))
  (func (export "cellrun_run") (param i32 i32))
)
"#,
        SessionOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
        },
    )?;

    let err = registry
        .get_instance(&DocumentId::from("a.md"))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::HandshakeTimeout(Duration::from_millis(100)));
    assert_eq!(err.kind(), "HandshakeTimeout");
    Ok(())
}

#[tokio::test]
async fn failed_start_is_retried_on_next_access() -> anyhow::Result<()> {
    // Never calls `ready`.
    let registry = registry_for(
        r#"
(module
  (import "cellrun" "ready" (func $ready (param i32)))
  (memory (export "memory") 1)
  (func (export "_initialize"))
  (func (export "cellrun_alloc") (param i32) (result i32) (i32.const 0))
  (func (export "cellrun_run") (param i32 i32))
)
"#,
        SessionOptions::default(),
    )?;
    let doc = DocumentId::from("a.md");

    let first = registry.reserve(&doc);
    let err = first.clone().await.unwrap_err();
    assert_eq!(err.kind(), "HandshakeError");

    let second = registry.reserve(&doc);
    assert!(!second.ptr_eq(&first));
    assert!(second.await.is_err());
    Ok(())
}

#[tokio::test]
async fn pending_session_is_shared_with_later_callers() -> anyhow::Result<()> {
    let registry = calculator_registry()?;
    let doc = DocumentId::from("a.md");

    let first = registry.reserve(&doc);
    let second = registry.reserve(&doc);
    assert!(first.ptr_eq(&second));
    assert!(Arc::ptr_eq(&first.await?, &second.await?));
    Ok(())
}
