//! Hierarchical byte-accounting counters.
//!
//! A [`MemoryManager`] tracks how many bytes a subsystem has allocated.
//! Child managers roll their totals into the parent chain, so the root
//! manager always reports host-wide usage. There are no throttling
//! semantics; limits are enforced by the consumers themselves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A node in the accounting hierarchy. Cheap to clone; clones share the
/// same counter.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    current: AtomicUsize,
    peak: AtomicUsize,
    parent: Option<MemoryManager>,
}

impl MemoryManager {
    /// Create a root manager with no parent.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                parent: None,
            }),
        }
    }

    /// Create a child manager whose additions and subtractions roll up into
    /// this manager.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Account `bytes` against this manager and every ancestor.
    pub fn add(&self, bytes: usize) {
        let mut node = &self.inner;
        loop {
            let now = node.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
            node.peak.fetch_max(now, Ordering::Relaxed);
            match &node.parent {
                Some(parent) => node = &parent.inner,
                None => break,
            }
        }
    }

    /// Release `bytes` from this manager and every ancestor. Saturates at
    /// zero rather than underflowing.
    pub fn subtract(&self, bytes: usize) {
        let mut node = &self.inner;
        loop {
            let _ = node
                .current
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(bytes))
                });
            match &node.parent {
                Some(parent) => node = &parent.inner,
                None => break,
            }
        }
    }

    /// Bytes currently accounted here.
    pub fn total(&self) -> usize {
        self.inner.current.load(Ordering::Relaxed)
    }

    /// High watermark of bytes accounted here.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Relaxed)
    }

    /// Name of this manager.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("name", &self.inner.name)
            .field("current", &self.total())
            .field("peak", &self.peak())
            .finish()
    }
}
