//! Ephemeral containers for integration tests, over pluggable runtimes.
//!
//! `testctr` starts throwaway containers for test bodies and guarantees
//! they are torn down when the owning test ends - panics included. The
//! default backend drives a runtime binary (`docker`, `podman` or
//! `nerdctl`) through argv invocations; a native Docker-API backend and
//! arbitrary third-party adapters plug in through the same [Backend]
//! contract and the process-wide [registry](Registry).
//!
//! ```no_run
//! use std::time::Duration;
//! use testctr::Composition;
//!
//! # async fn my_test() {
//! let redis = Composition::with_image("redis:7-alpine")
//!     .with_port(6379)
//!     .with_wait_for_log("Ready to accept connections", Duration::from_secs(30))
//!     .start()
//!     .await;
//!
//! let addr = redis.endpoint(6379).await.unwrap();
//! assert!(addr.starts_with("127.0.0.1:"));
//!
//! let pong = redis.exec_simple(["redis-cli", "PING"]).await;
//! assert_eq!(pong.trim(), "PONG");
//! // redis is stopped and removed when it goes out of scope.
//! # }
//! ```
//!
//! Containers can be kept around for debugging by setting `TESTCTR_KEEP`
//! (always) or `TESTCTR_KEEP_FAILED` (only for panicking tests);
//! `TESTCTR_RUNTIME` pins the CLI backend to one binary and
//! `TESTCTR_VERBOSE` raises the diagnostic log level used by
//! [init_diagnostics].

pub mod backend;
pub mod cli;
pub mod composition;
pub mod container;
pub mod docker;
pub mod dsn;
pub mod error;
mod inspect;
mod ports;
pub mod registry;
mod utils;
pub mod waitfor;

pub use backend::{
    Backend, ContainerInfo, ContainerState, ContainerStatus, ExecOutput, HostBinding,
};
pub use cli::CliBackend;
pub use composition::{Composition, CopiedFile};
pub use container::Container;
pub use docker::DockerBackend;
pub use dsn::DsnProvider;
pub use error::{ErrorKind, Result, TestctrError};
pub use registry::{default_registry, register, Registry};
pub use utils::init_diagnostics;
pub use waitfor::WaitStrategy;
