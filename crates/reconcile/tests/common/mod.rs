#![allow(dead_code)]

use std::sync::Arc;

use gatex_core::{AnnotationKeys, Descriptor};
use gatex_reconcile::{Reconciler, ReconcilerConfig, RetryPolicy};
use gatex_store::{IngressStore, MemoryStore, ObjectKey};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, ServiceBackendPort};

/// Service fixture; `port_name` of `None` leaves the port unnamed.
pub fn svc(ns: &str, name: &str, domain: &str, path: &str, port_name: Option<&str>, port: i32) -> Service {
    let mut p = serde_json::json!({ "port": port });
    if let Some(n) = port_name { p["name"] = serde_json::Value::String(n.to_string()); }
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": ns,
            "annotations": { "ingressDomain0": domain, "ingressPath": path }
        },
        "spec": { "ports": [p] }
    }))
    .unwrap()
}

pub fn desc(svc: &Service) -> Descriptor { Descriptor::from_service(svc, &AnnotationKeys::default()).unwrap() }

pub fn reconciler(store: Arc<dyn IngressStore>) -> Reconciler {
    let cfg = ReconcilerConfig { retry: RetryPolicy::immediate(4), ..Default::default() };
    Reconciler::new(store, cfg)
}

pub fn memory() -> Arc<MemoryStore> { Arc::new(MemoryStore::new()) }

pub fn key(ns: &str, name: &str) -> ObjectKey { ObjectKey::new(ns, name) }

/// `(path, backend service, port)` per entry of the first rule, in order.
pub fn entries(ing: &Ingress) -> Vec<(String, String, String)> {
    ing.spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|r| r.first())
        .and_then(|r| r.http.as_ref())
        .map(|h| {
            h.paths
                .iter()
                .map(|p| {
                    let backend = p.backend.service.as_ref().unwrap();
                    (p.path.clone().unwrap_or_default(), backend.name.clone(), port_str(backend.port.as_ref()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn port_str(port: Option<&ServiceBackendPort>) -> String {
    match port {
        Some(ServiceBackendPort { name: Some(n), .. }) => n.clone(),
        Some(ServiceBackendPort { number: Some(n), .. }) => n.to_string(),
        _ => String::new(),
    }
}

pub fn e(path: &str, backend: &str, port: &str) -> (String, String, String) {
    (path.to_string(), backend.to_string(), port.to_string())
}
