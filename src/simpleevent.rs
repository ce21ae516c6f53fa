//! Warning events about objects the controller cannot converge.

use std::{fmt, sync::Arc};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};

use crate::CONTROLLER_NAME;

/// Why an object could not be converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// A same-named companion object exists that the controller does not own.
    ResourceExists,
    /// No broker ports are left on the node IP.
    PortsExhausted,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ResourceExists => "ResourceExists",
            Reason::PortsExhausted => "PortsExhausted",
        }
    }

    /// The action the controller was taking when it gave up.
    pub fn action(&self) -> &'static str {
        match self {
            Reason::ResourceExists => "CreateTunnelClient",
            Reason::PortsExhausted => "AllocatePorts",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A warning about a reconciled object.
#[derive(Debug, Clone)]
pub struct Warning {
    pub regarding: ObjectReference,
    pub reason: Reason,
    pub note: String,
}

impl Warning {
    pub fn new<K: Resource<DynamicType = ()>>(object: &K, reason: Reason, note: impl Into<String>) -> Self {
        Self {
            regarding: object.object_ref(&()),
            reason,
            note: note.into(),
        }
    }
}

///
/// Publishes [`Warning`]s as Kubernetes events reported by the controller.
///
#[derive(Clone)]
pub struct WarningRecorder {
    recorder: Arc<Recorder>,
}

impl WarningRecorder {
    pub fn from_client(client: kube::Client) -> Self {
        let reporter = Reporter::from(CONTROLLER_NAME);
        Self {
            recorder: Arc::new(Recorder::new(client, reporter)),
        }
    }

    pub async fn publish(&self, warning: &Warning) -> Result<(), kube_client::Error> {
        let event = Event {
            type_: EventType::Warning,
            reason: warning.reason.to_string(),
            note: Some(warning.note.clone()),
            action: warning.reason.action().to_string(),
            secondary: None,
        };
        self.recorder.publish(&event, &warning.regarding).await
    }
}
