//! In-process backend, shared by name.
//!
//! Two configurations opening `memory://same` see the same files, which
//! is what lets tests exercise several catalogs against one target.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use super::{Backend, BackendError, BackendResult, RemoteEntry};

static REGISTRY: Lazy<DashMap<String, Arc<MemoryBackend>>> = Lazy::new(DashMap::new);

#[derive(Debug, Default)]
pub struct MemoryBackend {
    label: String,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_puts: AtomicU32,
    puts: AtomicU64,
}

impl MemoryBackend {
    /// A private store, not reachable through the registry.
    pub fn new() -> Self {
        Self {
            label: "memory://".to_string(),
            ..Self::default()
        }
    }

    /// The process-wide store registered under `name`.
    pub fn shared(name: &str) -> Arc<MemoryBackend> {
        REGISTRY
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBackend {
                    label: format!("memory://{name}"),
                    ..Self::default()
                })
            })
            .clone()
    }

    /// Make the next `count` puts fail with a transient error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn put(&self, name: &str, data: &[u8]) -> BackendResult<()> {
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Transient(io::Error::new(
                io::ErrorKind::TimedOut,
                "injected timeout",
            )));
        }
        self.lock().insert(name.to_string(), data.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, name: &str) -> BackendResult<Vec<u8>> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    fn list(&self) -> BackendResult<Vec<RemoteEntry>> {
        Ok(self
            .lock()
            .iter()
            .map(|(name, data)| RemoteEntry {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn delete(&self, name: &str) -> BackendResult<()> {
        self.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_by_name() {
        let a = MemoryBackend::shared("memory-test-shared");
        let b = MemoryBackend::shared("memory-test-shared");
        a.put("x", b"1").unwrap();
        assert!(b.contains("x"));
        assert!(!MemoryBackend::shared("memory-test-other").contains("x"));
    }

    #[test]
    fn test_fault_injection() {
        let backend = MemoryBackend::new();
        backend.fail_next_puts(2);
        assert!(backend.put("a", b"1").unwrap_err().is_transient());
        assert!(backend.put("a", b"1").is_err());
        backend.put("a", b"1").unwrap();
        assert_eq!(backend.put_count(), 1);
    }
}
