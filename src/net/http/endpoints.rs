//! Path → callback table for HTTP listeners.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{NetError, Result};
use crate::net::handle::{Handle, RecvCb};
use crate::net::http::uri::path_is_valid;

#[derive(Default)]
struct EndpointTable {
    frozen: bool,
    routes: HashMap<String, RecvCb>,
}

/// Shared set of HTTP endpoints. Clones refer to the same table.
///
/// Endpoints can only be added until the set is passed to
/// [`Manager::listen_http`](crate::manager::Manager::listen_http).
#[derive(Clone, Default)]
pub struct HttpEndpoints {
    inner: Arc<RwLock<EndpointTable>>,
}

impl std::fmt::Debug for HttpEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.read();
        let mut paths: Vec<_> = table.routes.keys().collect();
        paths.sort();
        f.debug_struct("HttpEndpoints")
            .field("frozen", &table.frozen)
            .field("paths", &paths)
            .finish()
    }
}

impl HttpEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self) -> Self {
        self.clone()
    }

    pub fn detach(self) {}

    /// Number of references to the shared table.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, EndpointTable> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, EndpointTable> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Serve requests for `path` with `cb`. Replaces an existing entry.
    pub fn add<F>(&self, path: &str, cb: F) -> Result<()>
    where
        F: Fn(&Handle, Result<&[u8]>) + Send + Sync + 'static,
    {
        self.add_with(path, Arc::new(cb))
    }

    pub fn add_with(&self, path: &str, cb: RecvCb) -> Result<()> {
        if !path_is_valid(path) {
            return Err(NetError::InvalidPath(path.to_string()));
        }
        let mut table = self.write();
        if table.frozen {
            return Err(NetError::EndpointsFrozen);
        }
        table.routes.insert(path.to_string(), cb);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }

    pub fn len(&self) -> usize {
        self.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn freeze(&self) {
        self.write().frozen = true;
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<RecvCb> {
        self.read().routes.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_until_frozen() {
        let endpoints = HttpEndpoints::new();
        endpoints.add("/dns-query", |_, _| {}).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert!(endpoints.lookup("/dns-query").is_some());
        assert!(endpoints.lookup("/other").is_none());

        let shared = endpoints.clone();
        shared.freeze();
        assert!(endpoints.is_frozen());
        assert_eq!(
            endpoints.add("/late", |_, _| {}).unwrap_err(),
            NetError::EndpointsFrozen
        );
    }

    #[test]
    fn attach_shares_the_table() {
        let endpoints = HttpEndpoints::new();
        let attached = endpoints.attach();
        assert_eq!(endpoints.references(), 2);
        attached.add("/dns-query", |_, _| {}).unwrap();
        assert_eq!(endpoints.len(), 1);
        attached.detach();
        assert_eq!(endpoints.references(), 1);
    }

    #[test]
    fn rejects_invalid_paths() {
        let endpoints = HttpEndpoints::new();
        assert!(matches!(
            endpoints.add("relative", |_, _| {}),
            Err(NetError::InvalidPath(_))
        ));
        assert!(endpoints.add("//authority", |_, _| {}).is_err());
        assert!(endpoints.is_empty());
    }
}
