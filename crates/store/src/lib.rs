//! gateway-extension store: the Ingress object-store seam and an in-RAM implementation.
//!
//! The reconciler only talks to [`IngressStore`]. The cluster-backed implementation lives in
//! `gatex-kubehub`; [`MemoryStore`] here keeps the same versioning rules so reconcile logic can be
//! exercised without an API server.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use k8s_openapi::api::networking::v1::Ingress;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Namespaced object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of an Ingress; a missing namespace is treated as `default`.
    pub fn of(ingress: &Ingress) -> Self {
        Self {
            namespace: ingress.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: ingress.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store failures. `NotFound` and `Conflict` drive reconcile control flow; the rest are surfaced.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ingress {0} not found")]
    NotFound(ObjectKey),
    /// The stored version moved since it was read.
    #[error("ingress {key}: version conflict: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error("ingress {0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("ingress {key}: {source}")]
    Other {
        key: ObjectKey,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write access to derived Ingress objects.
///
/// `get` may hand out a shared cached object; callers clone before modifying.
/// `update` and `delete` honor `metadata.resourceVersion` when it is set.
#[async_trait::async_trait]
pub trait IngressStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<Ingress>>;
    async fn create(&self, ingress: &Ingress) -> StoreResult<()>;
    async fn update(&self, ingress: &Ingress) -> StoreResult<()>;
    async fn delete(&self, ingress: &Ingress) -> StoreResult<()>;
}

type Objects = FxHashMap<ObjectKey, Arc<Ingress>>;

/// In-RAM [`IngressStore`] with API-server-like resource versions.
///
/// Readers get the stored `Arc` itself, the same way an informer cache shares objects.
pub struct MemoryStore {
    objects: ArcSwap<Objects>,
    version: AtomicU64,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { objects: ArcSwap::from_pointee(Objects::default()), version: AtomicU64::new(0), writes: AtomicU64::new(0) }
    }

    /// Number of successful create/update/delete calls.
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::Relaxed) }

    pub fn len(&self) -> usize { self.objects.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Current object, if any, without going through the async trait.
    pub fn peek(&self, key: &ObjectKey) -> Option<Arc<Ingress>> { self.objects.load().get(key).cloned() }

    /// All stored objects ordered by key.
    pub fn snapshot(&self) -> Vec<Arc<Ingress>> {
        let objects = self.objects.load();
        let mut keys: Vec<_> = objects.keys().collect();
        keys.sort();
        keys.into_iter().filter_map(|k| objects.get(k).cloned()).collect()
    }

    fn next_version(&self) -> String { (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string() }

    /// Compare-and-swap the whole map until `step` either yields a new map or refuses.
    fn commit<F>(&self, mut step: F) -> StoreResult<()>
    where
        F: FnMut(&Objects) -> StoreResult<Objects>,
    {
        loop {
            let cur = self.objects.load_full();
            let next = step(&cur)?;
            let prev = self.objects.compare_and_swap(&cur, Arc::new(next));
            if Arc::ptr_eq(&*prev, &cur) {
                self.writes.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    fn check_version(key: &ObjectKey, stored: &Ingress, incoming: &Ingress) -> StoreResult<()> {
        match incoming.metadata.resource_version.as_deref() {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_deref() => Err(StoreError::Conflict {
                key: key.clone(),
                message: format!(
                    "the object has been modified (have {}, stored {})",
                    rv,
                    stored.metadata.resource_version.as_deref().unwrap_or("")
                ),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IngressStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<Ingress>> {
        self.peek(key).ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        self.commit(|objects| {
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.clone()));
            }
            let mut stored = ingress.clone();
            stored.metadata.namespace = Some(key.namespace.clone());
            stored.metadata.resource_version = Some(self.next_version());
            let mut next = objects.clone();
            next.insert(key.clone(), Arc::new(stored));
            Ok(next)
        })?;
        debug!(ingress = %key, "memory store: created");
        Ok(())
    }

    async fn update(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        self.commit(|objects| {
            let current = objects.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
            Self::check_version(&key, current, ingress)?;
            let mut stored = ingress.clone();
            stored.metadata.namespace = Some(key.namespace.clone());
            stored.metadata.resource_version = Some(self.next_version());
            let mut next = objects.clone();
            next.insert(key.clone(), Arc::new(stored));
            Ok(next)
        })?;
        debug!(ingress = %key, "memory store: updated");
        Ok(())
    }

    async fn delete(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        self.commit(|objects| {
            let current = objects.get(&key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
            Self::check_version(&key, current, ingress)?;
            let mut next = objects.clone();
            next.remove(&key);
            Ok(next)
        })?;
        debug!(ingress = %key, "memory store: deleted");
        Ok(())
    }
}
