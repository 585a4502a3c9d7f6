//! gateway-extension kubehub: cluster client wiring, the kube-backed Ingress store,
//! and the Service list+watch layer.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use gatex_store::{IngressStore, ObjectKey, StoreError, StoreResult};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use tracing::{debug, info};

pub mod watch;

pub use watch::{run_service_watcher, Notification, ServiceCache, ServiceEventHandler};

/// Default client identity, used as field manager on every write.
pub const DEFAULT_MANAGER_PLANE_NAME: &str = "gateway-extension-manager-plane";

/// Build a client from the ambient kubeconfig or in-cluster service account.
pub async fn connect(identity: &str) -> Result<Client> {
    let client = Client::try_default()
        .await
        .with_context(|| format!("init manager-plane cluster client {}", identity))?;
    info!(identity, "cluster client ready");
    Ok(client)
}

/// [`IngressStore`] talking to the API server directly.
///
/// Updates use `replace` with the read `resourceVersion`, so a concurrent writer surfaces as
/// [`StoreError::Conflict`]. Deletes carry the same version as a precondition.
#[derive(Clone)]
pub struct KubeIngressStore {
    client: Client,
    field_manager: String,
}

impl KubeIngressStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api(&self, namespace: &str) -> Api<Ingress> { Api::namespaced(self.client.clone(), namespace) }

    fn post_params(&self) -> PostParams {
        PostParams { dry_run: false, field_manager: Some(self.field_manager.clone()) }
    }
}

/// Map a kube error onto the store taxonomy by HTTP status.
pub fn classify(key: &ObjectKey, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key.clone())
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict { key: key.clone(), message: resp.message.clone() }
        }
        _ => StoreError::Other { key: key.clone(), source: Box::new(err) },
    }
}

#[async_trait::async_trait]
impl IngressStore for KubeIngressStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<Ingress>> {
        let obj = self.api(&key.namespace).get(&key.name).await.map_err(|e| classify(key, e))?;
        Ok(Arc::new(obj))
    }

    async fn create(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        let created = self
            .api(&key.namespace)
            .create(&self.post_params(), ingress)
            .await
            .map_err(|e| classify(&key, e))?;
        debug!(ingress = %key, rv = ?created.metadata.resource_version, "ingress created");
        Ok(())
    }

    async fn update(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        let replaced = self
            .api(&key.namespace)
            .replace(&key.name, &self.post_params(), ingress)
            .await
            .map_err(|e| classify(&key, e))?;
        debug!(ingress = %key, rv = ?replaced.metadata.resource_version, "ingress replaced");
        Ok(())
    }

    async fn delete(&self, ingress: &Ingress) -> StoreResult<()> {
        let key = ObjectKey::of(ingress);
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: ingress.metadata.resource_version.clone(),
                uid: ingress.metadata.uid.clone(),
            }),
            ..Default::default()
        };
        self.api(&key.namespace).delete(&key.name, &dp).await.map_err(|e| classify(&key, e))?;
        Ok(())
    }
}
