//! gateway-extension core: Service descriptors and the Ingress path merge engine.
//!
//! Nothing in this crate performs I/O. The reconciler reads Ingress snapshots from a store,
//! hands them here together with a validated [`Descriptor`], and writes back whatever comes out.

#![forbid(unsafe_code)]

pub mod descriptor;
pub mod merge;

pub use descriptor::{ingress_name, AnnotationKeys, Descriptor, SourcePort, ValidationError};
pub use merge::{add_path, build_ingress, has_entries, remove_path, AddChange, RemoveChange};

/// Ingress class stamped on every derived Ingress.
pub const DEFAULT_INGRESS_CLASS: &str = "apisix";

/// Legacy annotation selecting the ingress class.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation on the derived Ingress recording the host it serves.
pub const DOMAIN_ANNOTATION: &str = "symcn.gateway.extension/domain";

/// Service annotation carrying the host. Configurable through [`AnnotationKeys`].
pub const DEFAULT_DOMAIN_KEY: &str = "ingressDomain0";

/// Service annotation carrying the route path. Configurable through [`AnnotationKeys`].
pub const DEFAULT_PATH_KEY: &str = "ingressPath";

/// The only path type the merge engine emits.
pub const PATH_TYPE_PREFIX: &str = "Prefix";
