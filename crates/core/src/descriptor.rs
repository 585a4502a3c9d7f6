//! Service -> [`Descriptor`] validation.

use std::fmt;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::ServiceBackendPort;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{DEFAULT_DOMAIN_KEY, DEFAULT_PATH_KEY};

const DNS1123_LABEL_MAX_LEN: usize = 63;
const DNS1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{}$", DNS1123_LABEL_FMT)).expect("static DNS-1123 label regex"));

/// Names of the Service annotations the reconciler reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationKeys {
    pub domain: String,
    pub path: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self { domain: DEFAULT_DOMAIN_KEY.to_string(), path: DEFAULT_PATH_KEY.to_string() }
    }
}

impl AnnotationKeys {
    fn required(&self) -> [&str; 2] { [self.domain.as_str(), self.path.as_str()] }
}

/// Why a Service was rejected. Rejected Services never touch an Ingress.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("service annotations are empty")]
    EmptyMetadata,
    #[error("annotation {key} does not exist or is empty")]
    MissingAnnotation { key: String },
    #[error("domain {domain} yields invalid ingress name {name}: {}", .reasons.join("; "))]
    InvalidName { domain: String, name: String, reasons: Vec<String> },
    #[error("service ports are empty")]
    NoPorts,
}

impl ValidationError {
    /// Short, stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyMetadata => "empty_metadata",
            ValidationError::MissingAnnotation { .. } => "missing_annotation",
            ValidationError::InvalidName { .. } => "invalid_name",
            ValidationError::NoPorts => "no_ports",
        }
    }
}

/// One Service port as far as routing cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePort {
    pub name: Option<String>,
    pub number: i32,
}

impl SourcePort {
    /// Named ports are referenced by name, unnamed ones by number.
    pub fn backend_port(&self) -> ServiceBackendPort {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => ServiceBackendPort { name: Some(name.to_string()), number: None },
            _ => ServiceBackendPort { name: None, number: Some(self.number) },
        }
    }
}

/// A Service that passed validation, reduced to what the merge engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub namespace: String,
    pub name: String,
    /// Never empty.
    pub ports: SmallVec<[SourcePort; 4]>,
    pub domain_host: String,
    /// Always starts with `/`.
    pub route_path: String,
}

impl Descriptor {
    /// Validate a Service. Checks run in order and stop at the first failure:
    /// annotations present, required keys non-empty, derived name is a DNS-1123 label, ports non-empty.
    pub fn from_service(svc: &Service, keys: &AnnotationKeys) -> Result<Self, ValidationError> {
        let annotations = match svc.metadata.annotations.as_ref() {
            Some(a) if !a.is_empty() => a,
            _ => return Err(ValidationError::EmptyMetadata),
        };
        for key in keys.required() {
            match annotations.get(key) {
                Some(v) if !v.is_empty() => {}
                _ => return Err(ValidationError::MissingAnnotation { key: key.to_string() }),
            }
        }
        let domain_host = annotations[&keys.domain].clone();
        let name = ingress_name(&domain_host);
        let reasons = dns1123_label_errors(&name);
        if !reasons.is_empty() {
            return Err(ValidationError::InvalidName { domain: domain_host, name, reasons });
        }

        let ports: SmallVec<[SourcePort; 4]> = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports.iter().map(|p| SourcePort { name: p.name.clone(), number: p.port }).collect()
            })
            .unwrap_or_default();
        if ports.is_empty() {
            return Err(ValidationError::NoPorts);
        }

        Ok(Self {
            namespace: svc.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: svc.metadata.name.clone().unwrap_or_default(),
            ports,
            domain_host,
            route_path: normalize_path(&annotations[&keys.path]),
        })
    }

    /// Name of the Ingress this Service contributes to.
    pub fn ingress_name(&self) -> String { ingress_name(&self.domain_host) }

    /// The backend port written into the path entry: always the first Service port.
    pub fn backend_port(&self) -> ServiceBackendPort { self.ports[0].backend_port() }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `foo.bar.com` -> `foo-bar-com`.
pub fn ingress_name(domain_host: &str) -> String { domain_host.replace('.', "-") }

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') { path.to_string() } else { format!("/{}", path) }
}

fn dns1123_label_errors(value: &str) -> Vec<String> {
    let mut errs = Vec::new();
    if value.len() > DNS1123_LABEL_MAX_LEN {
        errs.push(format!("must be no more than {} characters", DNS1123_LABEL_MAX_LEN));
    }
    if !DNS1123_LABEL.is_match(value) {
        errs.push(format!(
            "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', \
             and must start and end with an alphanumeric character (regex used for validation is '{}')",
            DNS1123_LABEL_FMT
        ));
    }
    errs
}
