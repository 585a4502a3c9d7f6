//! Path merge engine.
//!
//! A derived Ingress carries a single host rule whose path list holds one entry per Service,
//! keyed by backend service name. Every function here takes a borrowed snapshot and returns a
//! fresh spec; snapshots handed out by a store cache are shared and must never be mutated.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{Descriptor, DOMAIN_ANNOTATION, INGRESS_CLASS_ANNOTATION, PATH_TYPE_PREFIX};

/// What [`add_path`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddChange {
    /// No rule existed; a rule with a single entry was created.
    Created,
    /// The Service already had an entry; it was rebuilt at the same index.
    Replaced { index: usize },
    Appended,
    /// The rule belongs to another host. Multi-host Ingresses are not supported; nothing changed.
    HostMismatch { existing: String },
}

/// What [`remove_path`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveChange {
    Removed { index: usize },
    /// The last entry was removed and the rule dropped; the Ingress can be deleted.
    Cleared,
    NotFound,
    /// No rule or an empty path list.
    Empty,
    HostMismatch { existing: String },
}

/// Add or replace the entry for `desc`.
pub fn add_path(spec: &IngressSpec, desc: &Descriptor) -> (IngressSpec, AddChange) {
    let mut next = spec.clone();
    let rules = next.rules.get_or_insert_with(Vec::new);
    let Some(rule) = rules.first_mut() else {
        rules.push(build_rule(desc));
        return (next, AddChange::Created);
    };
    if rule.host.as_deref() != Some(desc.domain_host.as_str()) {
        let existing = rule.host.clone().unwrap_or_default();
        return (spec.clone(), AddChange::HostMismatch { existing });
    }

    let paths = &mut rule.http.get_or_insert_with(HTTPIngressRuleValue::default).paths;
    let change = match position_of(paths, &desc.name) {
        Some(index) => {
            paths[index] = build_path(desc);
            AddChange::Replaced { index }
        }
        None => {
            paths.push(build_path(desc));
            AddChange::Appended
        }
    };
    (next, change)
}

/// Remove the entry for `desc`, dropping the rule once it is empty.
pub fn remove_path(spec: &IngressSpec, desc: &Descriptor) -> (IngressSpec, RemoveChange) {
    let Some(rule) = spec.rules.as_ref().and_then(|r| r.first()) else {
        return (spec.clone(), RemoveChange::Empty);
    };
    if rule.host.as_deref() != Some(desc.domain_host.as_str()) {
        let existing = rule.host.clone().unwrap_or_default();
        return (spec.clone(), RemoveChange::HostMismatch { existing });
    }
    let paths = rule.http.as_ref().map(|h| h.paths.as_slice()).unwrap_or_default();
    if paths.is_empty() {
        return (spec.clone(), RemoveChange::Empty);
    }
    let Some(index) = position_of(paths, &desc.name) else {
        return (spec.clone(), RemoveChange::NotFound);
    };

    let mut next = spec.clone();
    if paths.len() == 1 {
        next.rules = None;
        return (next, RemoveChange::Cleared);
    }
    if let Some(http) = next.rules.as_mut().and_then(|r| r.first_mut()).and_then(|r| r.http.as_mut()) {
        http.paths.remove(index);
    }
    (next, RemoveChange::Removed { index })
}

/// True when the first rule still routes at least one path.
pub fn has_entries(spec: &IngressSpec) -> bool {
    spec.rules
        .as_ref()
        .and_then(|r| r.first())
        .and_then(|r| r.http.as_ref())
        .map(|h| !h.paths.is_empty())
        .unwrap_or(false)
}

/// A brand new Ingress routing only `desc`.
pub fn build_ingress(desc: &Descriptor, ingress_class: &str) -> Ingress {
    let annotations = BTreeMap::from([
        (INGRESS_CLASS_ANNOTATION.to_string(), ingress_class.to_string()),
        (DOMAIN_ANNOTATION.to_string(), desc.domain_host.clone()),
    ]);
    let (spec, _) = add_path(&IngressSpec::default(), desc);
    Ingress {
        metadata: ObjectMeta {
            name: Some(desc.ingress_name()),
            namespace: Some(desc.namespace.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

fn position_of(paths: &[HTTPIngressPath], backend: &str) -> Option<usize> {
    paths
        .iter()
        .position(|p| p.backend.service.as_ref().map(|s| s.name.as_str()) == Some(backend))
}

fn build_rule(desc: &Descriptor) -> IngressRule {
    IngressRule {
        host: Some(desc.domain_host.clone()),
        http: Some(HTTPIngressRuleValue { paths: vec![build_path(desc)] }),
    }
}

fn build_path(desc: &Descriptor) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(desc.route_path.clone()),
        path_type: PATH_TYPE_PREFIX.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend { name: desc.name.clone(), port: Some(desc.backend_port()) }),
            resource: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourcePort;
    use k8s_openapi::api::networking::v1::ServiceBackendPort;
    use smallvec::smallvec;

    fn desc(name: &str, host: &str, path: &str, port: SourcePort) -> Descriptor {
        Descriptor {
            namespace: "default".into(),
            name: name.into(),
            ports: smallvec![port],
            domain_host: host.into(),
            route_path: path.into(),
        }
    }

    fn named(n: &str, p: i32) -> SourcePort { SourcePort { name: Some(n.into()), number: p } }
    fn unnamed(p: i32) -> SourcePort { SourcePort { name: None, number: p } }

    fn entries(spec: &IngressSpec) -> Vec<(String, String)> {
        spec.rules.as_ref().and_then(|r| r.first()).and_then(|r| r.http.as_ref())
            .map(|h| h.paths.iter().map(|p| {
                let svc = p.backend.service.as_ref().unwrap();
                (p.path.clone().unwrap_or_default(), svc.name.clone())
            }).collect())
            .unwrap_or_default()
    }

    #[test]
    fn add_to_empty_creates_single_rule() {
        let a = desc("a", "foo.bar.com", "/api", named("http", 8080));
        let (spec, change) = add_path(&IngressSpec::default(), &a);
        assert_eq!(change, AddChange::Created);
        let rules = spec.rules.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("foo.bar.com"));
        let p = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(p.path_type, "Prefix");
        assert_eq!(p.backend.service.as_ref().unwrap().port, Some(ServiceBackendPort { name: Some("http".into()), number: None }));
    }

    #[test]
    fn add_appends_then_replaces_in_place() {
        let a = desc("a", "foo.bar.com", "/api", named("http", 8080));
        let b = desc("b", "foo.bar.com", "/v2", unnamed(9090));
        let c = desc("c", "foo.bar.com", "/c", unnamed(80));
        let (s1, _) = add_path(&IngressSpec::default(), &a);
        let (s2, ch) = add_path(&s1, &b);
        assert_eq!(ch, AddChange::Appended);
        let (s3, _) = add_path(&s2, &c);

        let a2 = desc("a", "foo.bar.com", "/apiv1", named("grpc", 9000));
        let (s4, ch) = add_path(&s3, &a2);
        assert_eq!(ch, AddChange::Replaced { index: 0 });
        assert_eq!(
            entries(&s4),
            vec![("/apiv1".into(), "a".into()), ("/v2".into(), "b".into()), ("/c".into(), "c".into())]
        );
        // input snapshot untouched
        assert_eq!(entries(&s3)[0].0, "/api");
    }

    #[test]
    fn add_is_idempotent() {
        let a = desc("a", "foo.bar.com", "/api", named("http", 8080));
        let (once, _) = add_path(&IngressSpec::default(), &a);
        let (twice, change) = add_path(&once, &a);
        assert_eq!(change, AddChange::Replaced { index: 0 });
        assert_eq!(once, twice);
    }

    #[test]
    fn add_with_other_host_is_noop() {
        let a = desc("a", "foo.bar.com", "/api", unnamed(80));
        let x = desc("x", "other.com", "/x", unnamed(80));
        let (s1, _) = add_path(&IngressSpec::default(), &a);
        let (s2, change) = add_path(&s1, &x);
        assert_eq!(change, AddChange::HostMismatch { existing: "foo.bar.com".into() });
        assert_eq!(s1, s2);
    }

    #[test]
    fn add_to_rule_without_http_block() {
        let a = desc("a", "foo.bar.com", "/api", unnamed(80));
        let spec = IngressSpec {
            rules: Some(vec![IngressRule { host: Some("foo.bar.com".into()), http: None }]),
            ..Default::default()
        };
        let (next, change) = add_path(&spec, &a);
        assert_eq!(change, AddChange::Appended);
        assert_eq!(entries(&next), vec![("/api".into(), "a".into())]);
    }

    #[test]
    fn remove_after_add_clears_rule() {
        let a = desc("a", "foo.bar.com", "/api", named("http", 8080));
        let (s1, _) = add_path(&IngressSpec::default(), &a);
        let (s2, change) = remove_path(&s1, &a);
        assert_eq!(change, RemoveChange::Cleared);
        assert!(s2.rules.is_none());
        assert!(!has_entries(&s2));
    }

    #[test]
    fn remove_preserves_order_of_rest() {
        let a = desc("a", "h.io", "/a", unnamed(1));
        let b = desc("b", "h.io", "/b", unnamed(2));
        let c = desc("c", "h.io", "/c", unnamed(3));
        let (s, _) = add_path(&IngressSpec::default(), &a);
        let (s, _) = add_path(&s, &b);
        let (s, _) = add_path(&s, &c);
        let (s, change) = remove_path(&s, &b);
        assert_eq!(change, RemoveChange::Removed { index: 1 });
        assert_eq!(entries(&s), vec![("/a".into(), "a".into()), ("/c".into(), "c".into())]);
        assert!(has_entries(&s));
    }

    #[test]
    fn remove_noops() {
        let a = desc("a", "h.io", "/a", unnamed(1));
        let z = desc("z", "h.io", "/z", unnamed(1));
        let other = desc("a", "other.io", "/a", unnamed(1));

        let (empty, change) = remove_path(&IngressSpec::default(), &a);
        assert_eq!(change, RemoveChange::Empty);
        assert_eq!(empty, IngressSpec::default());

        let (s, _) = add_path(&IngressSpec::default(), &a);
        let (same, change) = remove_path(&s, &z);
        assert_eq!(change, RemoveChange::NotFound);
        assert_eq!(same, s);

        let (same, change) = remove_path(&s, &other);
        assert_eq!(change, RemoveChange::HostMismatch { existing: "h.io".into() });
        assert_eq!(same, s);
    }

    #[test]
    fn built_ingress_carries_markers() {
        let a = desc("a", "foo.bar.com", "/api", named("http", 8080));
        let ing = build_ingress(&a, "apisix");
        assert_eq!(ing.metadata.name.as_deref(), Some("foo-bar-com"));
        assert_eq!(ing.metadata.namespace.as_deref(), Some("default"));
        let ann = ing.metadata.annotations.as_ref().unwrap();
        assert_eq!(ann.get(INGRESS_CLASS_ANNOTATION).map(String::as_str), Some("apisix"));
        assert_eq!(ann.get(DOMAIN_ANNOTATION).map(String::as_str), Some("foo.bar.com"));
        assert_eq!(entries(ing.spec.as_ref().unwrap()), vec![("/api".into(), "a".into())]);
    }
}
