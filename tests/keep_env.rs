//! The keep switch is process-global, so it gets its own test binary.

mod common;

use common::FakeBackend;
use std::sync::Arc;
use testctr::Composition;

#[tokio::test]
async fn testctr_keep_skips_cleanup() {
    std::env::set_var("TESTCTR_KEEP", "1");

    let backend = Arc::new(FakeBackend::default());
    let container = Composition::with_image("alpine:latest")
        .with_backend_instance(backend.clone())
        .try_start()
        .await
        .unwrap();
    let id = container.id().to_string();

    drop(container);

    assert!(
        !backend.was_removed(&id),
        "a kept container must not be removed"
    );
    assert!(backend.containers.lock().unwrap().contains_key(&id));

    std::env::remove_var("TESTCTR_KEEP");
}
