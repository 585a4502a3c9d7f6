//! gateway-extension reconciler.
//!
//! Keeps one Ingress per `(namespace, domain)` in step with the Services that point at it.
//! Each Service owns exactly one path entry keyed by its name; the reconciler adds, replaces and
//! removes that entry as Service events arrive and deletes the Ingress once no entry is left.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use gatex_core::{
    add_path, build_ingress, has_entries, remove_path, AddChange, AnnotationKeys, Descriptor, RemoveChange,
    ValidationError, DEFAULT_INGRESS_CLASS,
};
use gatex_kubehub::ServiceEventHandler;
use gatex_store::{IngressStore, ObjectKey, StoreError};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

pub mod retry;

pub use retry::{retry_on_conflict, RetryPolicy};

/// Everything the reconciler needs besides the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub keys: AnnotationKeys,
    pub ingress_class: String,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { keys: AnnotationKeys::default(), ingress_class: DEFAULT_INGRESS_CLASS.to_string(), retry: RetryPolicy::default() }
    }
}

/// Result of one successfully handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    /// The merged spec equals the stored one; no write was issued.
    Unchanged,
    /// Delete for an Ingress that does not exist.
    AlreadyAbsent,
    /// The Ingress routes a different host under the same name; left untouched.
    HostMismatch,
    /// The Service moved to another domain. Not supported: unpublish then publish instead.
    HostTransitionIgnored,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::Unchanged => "unchanged",
            Outcome::AlreadyAbsent => "already_absent",
            Outcome::HostMismatch => "host_mismatch",
            Outcome::HostTransitionIgnored => "host_transition_ignored",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("validation: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool { matches!(self, ReconcileError::Store(e) if e.is_conflict()) }
}

pub type ReconcileResult = Result<Outcome, ReconcileError>;

/// Sole writer of derived Ingresses.
pub struct Reconciler {
    store: Arc<dyn IngressStore>,
    cfg: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn IngressStore>, cfg: ReconcilerConfig) -> Self { Self { store, cfg } }

    /// Validate a Service against the configured annotation keys.
    pub fn describe(&self, svc: &Service) -> Result<Descriptor, ValidationError> {
        Descriptor::from_service(svc, &self.cfg.keys)
    }

    /// Publish `desc`: create its Ingress or add/replace its entry.
    pub async fn add(&self, desc: &Descriptor) -> ReconcileResult {
        retry_on_conflict(&self.cfg.retry, ReconcileError::is_conflict, || self.add_once(desc)).await
    }

    /// Rebuild the Service's entry from `new` at its current index. Both must share a domain.
    pub async fn update(&self, old: &Descriptor, new: &Descriptor) -> ReconcileResult {
        if old.domain_host != new.domain_host {
            warn!(
                svc = %new, from = %old.domain_host, to = %new.domain_host,
                "domain change is not supported, unpublish then publish instead"
            );
            return Ok(Outcome::HostTransitionIgnored);
        }
        retry_on_conflict(&self.cfg.retry, ReconcileError::is_conflict, || self.update_once(old, new)).await
    }

    /// Unpublish `desc`: drop its entry and delete the Ingress once empty.
    pub async fn remove(&self, desc: &Descriptor) -> ReconcileResult {
        retry_on_conflict(&self.cfg.retry, ReconcileError::is_conflict, || self.remove_once(desc)).await
    }

    async fn add_once(&self, desc: &Descriptor) -> ReconcileResult {
        let key = ObjectKey::new(&desc.namespace, desc.ingress_name());
        let existing = match self.store.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return self.create(desc).await,
            Err(e) => return Err(e.into()),
        };
        let base = existing.spec.clone().unwrap_or_default();
        let (next, change) = add_path(&base, desc);
        if let AddChange::HostMismatch { existing: host } = change {
            warn!(ingress = %key, host = %host, want = %desc.domain_host, svc = %desc, "ingress serves another host, skipping");
            return Ok(Outcome::HostMismatch);
        }
        let outcome = self.write_spec(&key, &existing, &base, next).await?;
        if outcome == Outcome::Updated {
            info!(ingress = %key, host = %desc.domain_host, path = %desc.route_path, svc = %desc, "ingress path added");
        }
        Ok(outcome)
    }

    async fn update_once(&self, old: &Descriptor, new: &Descriptor) -> ReconcileResult {
        let key = ObjectKey::new(&new.namespace, new.ingress_name());
        let existing = match self.store.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return self.create(new).await,
            Err(e) => return Err(e.into()),
        };
        let base = existing.spec.clone().unwrap_or_default();
        // old and new share the Service name, so the entry is rebuilt at its index
        let (next, change) = add_path(&base, new);
        if let AddChange::HostMismatch { existing: host } = change {
            warn!(ingress = %key, host = %host, want = %new.domain_host, svc = %new, "ingress serves another host, skipping");
            return Ok(Outcome::HostMismatch);
        }
        let outcome = self.write_spec(&key, &existing, &base, next).await?;
        if outcome == Outcome::Updated {
            info!(
                ingress = %key, svc = %new, from = %old.route_path, to = %new.route_path,
                host = %new.domain_host, "ingress path updated"
            );
        }
        Ok(outcome)
    }

    async fn remove_once(&self, desc: &Descriptor) -> ReconcileResult {
        let key = ObjectKey::new(&desc.namespace, desc.ingress_name());
        let existing = match self.store.get(&key).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                warn!(ingress = %key, svc = %desc, "ingress does not exist");
                return Ok(Outcome::AlreadyAbsent);
            }
            Err(e) => return Err(e.into()),
        };
        let base = existing.spec.clone().unwrap_or_default();
        let (next, change) = remove_path(&base, desc);
        if let RemoveChange::HostMismatch { existing: host } = change {
            warn!(ingress = %key, host = %host, want = %desc.domain_host, svc = %desc, "ingress serves another host, skipping");
            return Ok(Outcome::HostMismatch);
        }

        if !has_entries(&next) {
            return match self.store.delete(&existing).await {
                Ok(()) => {
                    info!(ingress = %key, svc = %desc, "ingress deleted");
                    Ok(Outcome::Deleted)
                }
                Err(e) if e.is_not_found() => Ok(Outcome::AlreadyAbsent),
                Err(e) => Err(e.into()),
            };
        }
        let outcome = self.write_spec(&key, &existing, &base, next).await?;
        if outcome == Outcome::Updated {
            info!(ingress = %key, host = %desc.domain_host, path = %desc.route_path, svc = %desc, "ingress path removed");
        }
        Ok(outcome)
    }

    async fn create(&self, desc: &Descriptor) -> ReconcileResult {
        let ingress = build_ingress(desc, &self.cfg.ingress_class);
        let key = ObjectKey::of(&ingress);
        if let Err(e) = self.store.create(&ingress).await {
            // a racing writer created it first; surfaced, not turned into an update
            warn!(ingress = %key, error = %e, "create ingress failed, maybe created concurrently");
            return Err(e.into());
        }
        info!(ingress = %key, host = %desc.domain_host, path = %desc.route_path, svc = %desc, "ingress created");
        Ok(Outcome::Created)
    }

    /// Write `next` over a clone of the shared snapshot unless nothing changed.
    async fn write_spec(&self, key: &ObjectKey, existing: &Ingress, base: &IngressSpec, next: IngressSpec) -> ReconcileResult {
        if &next == base {
            debug!(ingress = %key, "ingress spec unchanged, skip update");
            return Ok(Outcome::Unchanged);
        }
        let mut updated = existing.clone();
        updated.spec = Some(next);
        self.store.update(&updated).await?;
        Ok(Outcome::Updated)
    }

    fn report(&self, event: &'static str, svc: &str, result: ReconcileResult, started: Instant) {
        histogram!("gatex_reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "event" => event);
        match result {
            Ok(outcome) => {
                counter!("gatex_events_total", 1u64, "event" => event, "outcome" => outcome.as_str());
                debug!(event, svc, outcome = outcome.as_str(), "service event handled");
            }
            Err(ReconcileError::Invalid(e)) => {
                counter!("gatex_validation_rejected_total", 1u64, "reason" => e.reason());
                counter!("gatex_events_total", 1u64, "event" => event, "outcome" => "invalid");
                warn!(event, svc, error = %e, "service validation failed, event dropped");
            }
            Err(ReconcileError::Store(e)) => {
                counter!("gatex_store_errors_total", 1u64, "event" => event);
                counter!("gatex_events_total", 1u64, "event" => event, "outcome" => "error");
                error!(event, svc, error = %e, "reconcile failed, event dropped");
            }
        }
    }
}

fn svc_key(svc: &Service) -> String {
    format!(
        "{}/{}",
        svc.metadata.namespace.as_deref().unwrap_or("default"),
        svc.metadata.name.as_deref().unwrap_or("")
    )
}

#[async_trait::async_trait]
impl ServiceEventHandler for Reconciler {
    async fn on_add(&self, svc: &Service) {
        let started = Instant::now();
        let result = match self.describe(svc) {
            Ok(desc) => self.add(&desc).await,
            Err(e) => Err(e.into()),
        };
        self.report("add", &svc_key(svc), result, started);
    }

    async fn on_update(&self, old: &Service, new: &Service) {
        let started = Instant::now();
        let result = match (self.describe(old), self.describe(new)) {
            (Ok(old_desc), Ok(new_desc)) => self.update(&old_desc, &new_desc).await,
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        };
        self.report("update", &svc_key(new), result, started);
    }

    async fn on_delete(&self, svc: &Service) {
        let started = Instant::now();
        let result = match self.describe(svc) {
            Ok(desc) => self.remove(&desc).await,
            Err(e) => Err(e.into()),
        };
        self.report("delete", &svc_key(svc), result, started);
    }
}
