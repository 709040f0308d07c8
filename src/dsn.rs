//! Pluggable per-test database provisioning.
//!
//! Service specific modules (postgres, mysql, ...) supply a [DsnProvider];
//! the core only routes [Container::dsn](crate::container::Container::dsn)
//! calls through it and schedules the drop of every provisioned database
//! when the owning container is cleaned up.

use crate::container::Container;
use crate::error::Result;

use async_trait::async_trait;

/// Provisioner of fresh databases inside a long-lived container.
#[async_trait]
pub trait DsnProvider: Send + Sync {
    /// Create a database named `name` inside the container and return a
    /// connection string reaching it from the host.
    async fn create_database(&self, container: &Container, name: &str) -> Result<String>;

    /// Tear down a database previously provisioned with
    /// [create_database](DsnProvider::create_database). Invoked during
    /// container cleanup; failures are logged, never fatal.
    async fn drop_database(&self, container: &Container, name: &str) -> Result<()>;

    /// Format the connection string for an existing database without
    /// touching the container.
    async fn format_dsn(&self, container: &Container, name: &str) -> Result<String>;
}
