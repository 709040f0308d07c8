//! Named backend registration and lookup.
//!
//! The process-wide default registry is written at program initialization
//! and read by every [Composition](crate::Composition) that selects a
//! backend by name. Additional isolated registries can be constructed,
//! which the registry's own tests rely on.

use crate::backend::Backend;
use crate::error::{Result, TestctrError};

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

static DEFAULT: Lazy<Registry> = Lazy::new(Registry::new);

/// Access the process-wide registry.
pub fn default_registry() -> &'static Registry {
    &DEFAULT
}

/// Register `backend` under `name` in the process-wide registry.
///
/// # Panics
/// Panics when `name` is empty or already registered; both are caller
/// bugs, not runtime conditions.
pub fn register(name: &str, backend: Arc<dyn Backend>) {
    DEFAULT.register(name, backend);
}

/// A concurrent map from backend name to backend instance.
///
/// Reads vastly outnumber writes: registration happens at init time only
/// and entries are never removed.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, Arc<dyn Backend>>>,
}

impl Registry {
    /// Create an empty, isolated registry.
    pub fn new() -> Registry {
        Registry {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register `backend` under `name`.
    ///
    /// # Panics
    /// Panics on an empty name or a duplicate registration.
    pub fn register(&self, name: &str, backend: Arc<dyn Backend>) {
        if name.is_empty() {
            panic!("backend registered with an empty name");
        }
        let mut inner = self.inner.write().expect("backend registry lock poisoned");
        if inner.contains_key(name) {
            panic!("backend `{}` registered twice", name);
        }
        inner.insert(name.to_string(), backend);
    }

    /// Look up a backend by name.
    ///
    /// The not-found message lists every registered name, so a typo in a
    /// test points straight at the valid options.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        match inner.get(name) {
            Some(backend) => Ok(backend.clone()),
            None => {
                let mut known = inner.keys().cloned().collect::<Vec<_>>();
                known.sort();
                Err(TestctrError::NotFound(format!(
                    "backend `{}` is not registered (registered: [{}])",
                    name,
                    known.join(", ")
                )))
            }
        }
    }

    /// A snapshot of every registered name. Order is unspecified.
    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.read().expect("backend registry lock poisoned");
        inner.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ContainerInfo, ExecOutput};
    use crate::composition::Composition;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn create_container(&self, _: &str, _: &Composition) -> Result<String> {
            Ok("null".to_string())
        }
        async fn start_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn inspect_container(&self, _: &str) -> Result<ContainerInfo> {
            Ok(ContainerInfo::default())
        }
        async fn exec_in_container(&self, _: &str, _: &[String]) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
        async fn container_logs(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn wait_for_log(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Ok(())
        }
        async fn internal_ip(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn commit_container(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registered_backend_is_returned() {
        let registry = Registry::new();
        let backend: Arc<dyn Backend> = Arc::new(NullBackend);
        registry.register("x", backend.clone());

        let looked_up = registry.get("x").expect("backend should be registered");
        assert!(Arc::ptr_eq(&looked_up, &backend));
    }

    #[test]
    fn missing_backend_is_not_found() {
        let registry = Registry::new();
        registry.register("present", Arc::new(NullBackend));

        let err = registry.get("missing").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        // The message lists what is actually registered.
        assert!(err.to_string().contains("present"), "got: {}", err);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let registry = Registry::new();
        registry.register("x", Arc::new(NullBackend));
        registry.register("x", Arc::new(NullBackend));
    }

    #[test]
    #[should_panic(expected = "empty name")]
    fn empty_name_panics() {
        let registry = Registry::new();
        registry.register("", Arc::new(NullBackend));
    }

    #[test]
    fn list_returns_every_name() {
        let registry = Registry::new();
        registry.register("a", Arc::new(NullBackend));
        registry.register("b", Arc::new(NullBackend));
        registry.register("c", Arc::new(NullBackend));

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
