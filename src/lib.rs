use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub mod config;
pub mod controller;
pub mod filters;
pub mod objects;
pub mod ports;
pub mod queue;
pub mod reconcile;
pub mod render;
pub mod server;
pub mod simpleevent;
pub mod store;
pub mod sync;

/// Label carried by namespaces and nodes that belong to a tenant.
pub const TENANT_LABEL: &str = "burrow.sh/tenant";

/// Selector key used by tenant-scoped services to match broker and kubelet pods.
pub const TENANT_SELECTOR_KEY: &str = "tenant";

/// Annotation selecting the controller responsible for an Ingress.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// The only Ingress class (besides unset or empty) this controller accepts.
pub const FRP_INGRESS_CLASS: &str = "frp";

/// Field manager / reporter name used for writes and events.
pub const CONTROLLER_NAME: &str = "burrow-controller";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP Error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("INI Error: {0}")]
    IniError(#[from] ini::ParseError),

    #[error("{kind} `{name}` already exists and is not managed by this controller")]
    OwnershipConflict { kind: &'static str, name: String },

    #[error("Reconcile did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("An unexpected error occurred: {0}")]
    UnexpectedError(String),
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::UnexpectedError(message.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

///
/// The successful result of a reconcile call. Together with `Err(Error)` this gives the three-way
/// outcome Applied | Deferred | Failed that the work queue acts upon.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The object converged, either because writes were applied or because nothing was left to do.
    Applied,

    /// Nothing can be done until something else changes in the cluster (e.g. free ports). The key
    /// is not retried with backoff; a future event re-triggers it.
    Deferred(String),
}

/// Returns the tenant named by the object's tenant label, if it is set and non-empty.
pub fn tenant_of(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(TENANT_LABEL))
        .map(String::as_str)
        .filter(|tenant| !tenant.is_empty())
}
