//! Service list+watch turned into add/update/delete callbacks.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiver of Service lifecycle callbacks.
///
/// Implementations own their error handling: the watch layer does not retry or requeue.
#[async_trait::async_trait]
pub trait ServiceEventHandler: Send + Sync {
    async fn on_add(&self, svc: &Service);
    async fn on_update(&self, old: &Service, new: &Service);
    async fn on_delete(&self, svc: &Service);
}

/// A callback to deliver, derived from a raw watch event.
#[derive(Debug, Clone)]
pub enum Notification {
    Add(Service),
    Update(Service, Service),
    Delete(Service),
}

impl Notification {
    pub async fn dispatch(&self, handler: &dyn ServiceEventHandler) {
        match self {
            Notification::Add(svc) => handler.on_add(svc).await,
            Notification::Update(old, new) => handler.on_update(old, new).await,
            Notification::Delete(svc) => handler.on_delete(svc).await,
        }
    }
}

/// Last seen Service per `namespace/name`, used to tell adds from updates
/// and to recover deletes missed across a relist.
#[derive(Default)]
pub struct ServiceCache {
    items: FxHashMap<String, Service>,
    synced: bool,
}

fn key_of(svc: &Service) -> String {
    format!("{}/{}", svc.namespace().unwrap_or_default(), svc.name_any())
}

impl ServiceCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// True once a full list has been applied.
    pub fn synced(&self) -> bool { self.synced }

    pub fn apply(&mut self, event: Event<Service>) -> Vec<Notification> {
        match event {
            Event::Applied(svc) => self.upsert(svc).into_iter().collect(),
            Event::Deleted(svc) => {
                self.items.remove(&key_of(&svc));
                vec![Notification::Delete(svc)]
            }
            Event::Restarted(list) => {
                let listed: FxHashSet<String> = list.iter().map(key_of).collect();
                let mut gone: Vec<String> = self.items.keys().filter(|k| !listed.contains(*k)).cloned().collect();
                gone.sort();
                let mut out: Vec<Notification> = gone
                    .into_iter()
                    .filter_map(|k| self.items.remove(&k))
                    .map(Notification::Delete)
                    .collect();
                out.extend(list.into_iter().filter_map(|svc| self.upsert(svc)));
                self.synced = true;
                out
            }
        }
    }

    fn upsert(&mut self, svc: Service) -> Option<Notification> {
        match self.items.insert(key_of(&svc), svc.clone()) {
            None => Some(Notification::Add(svc)),
            Some(old) if old.resource_version().is_some() && old.resource_version() == svc.resource_version() => None,
            Some(old) => Some(Notification::Update(old, svc)),
        }
    }
}

/// Watch Services (all namespaces, or one) and feed callbacks to `handler` until `cancel` fires.
///
/// `ready` flips to true after the first full list has been dispatched.
pub async fn run_service_watcher(
    client: Client,
    namespace: Option<String>,
    handler: Arc<dyn ServiceEventHandler>,
    ready: tokio::sync::watch::Sender<bool>,
    cancel: CancellationToken,
) -> Result<()> {
    let api: Api<Service> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "service watcher started");

    let mut cache = ServiceCache::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ev)) => {
                let was_synced = cache.synced();
                let notes = cache.apply(ev);
                debug!(count = notes.len(), cached = cache.len(), "service watch event");
                for note in &notes {
                    note.dispatch(handler.as_ref()).await;
                }
                if !was_synced && cache.synced() {
                    info!(services = cache.len(), "initial service list handled");
                    let _ = ready.send(true);
                }
            }
            Some(Err(e)) => warn!(error = %e, "service watch error; backing off"),
            None => {
                warn!("service watch stream ended");
                break;
            }
        }
    }
    info!("service watcher stopped");
    Ok(())
}
