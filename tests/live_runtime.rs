//! End-to-end scenarios against a real runtime.
//!
//! These assume a working `docker`/`podman`/`nerdctl` with image access,
//! like the rest of the ecosystem's daemon tests do. Environments without
//! a usable runtime skip instead of failing.

use std::time::Duration;
use testctr::{CliBackend, Composition, Container};

async fn start_or_skip(composition: Composition) -> Option<Container> {
    if CliBackend::new().await.is_err() {
        eprintln!("skipping: no container runtime on PATH");
        return None;
    }
    match composition.try_start().await {
        Ok(container) => Some(container),
        Err(e) => {
            eprintln!("skipping: cannot run containers here: {}", e);
            None
        }
    }
}

#[tokio::test]
async fn redis_answers_ping() {
    let composition = Composition::with_image("redis:7-alpine")
        .with_port(6379)
        .with_wait_for_log("Ready to accept connections", Duration::from_secs(30));
    let Some(redis) = start_or_skip(composition).await else {
        return;
    };

    let pong = redis.exec_simple(["redis-cli", "PING"]).await;
    assert_eq!(pong.trim(), "PONG");

    let endpoint = redis.endpoint(6379).await.unwrap();
    let (_, port) = endpoint.rsplit_once(':').unwrap();
    assert!(port.parse::<u16>().unwrap() > 0);
}

#[tokio::test]
async fn custom_command_keeps_container_running() {
    let composition = Composition::with_image("alpine:latest").with_cmd(["sleep", "30"]);
    let Some(alpine) = start_or_skip(composition).await else {
        return;
    };

    let info = alpine.inspect().await.unwrap();
    assert!(!info.id.is_empty());
    assert!(info.state.running);
}

#[tokio::test]
async fn later_env_value_wins_inside_the_container() {
    let composition = Composition::with_image("alpine:latest")
        .with_env("K", "A")
        .with_env("K", "B")
        .with_cmd(["sleep", "30"]);
    let Some(alpine) = start_or_skip(composition).await else {
        return;
    };

    let out = alpine.exec_simple(["sh", "-c", "echo $K"]).await;
    assert_eq!(out, "B\n");
}
