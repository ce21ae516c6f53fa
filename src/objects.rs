//! Companion objects derived from Ingresses, tenant namespaces and tenant nodes.
//!
//! Everything here is a pure function of its inputs; the reconcilers compare and persist the
//! results.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        core::v1::{
            Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Namespace, Node, Pod, PodSpec, Service,
            ServicePort, ServiceSpec, Volume, VolumeMount,
        },
        networking::v1::Ingress,
    },
    apimachinery::pkg::{
        apis::meta::v1::{ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{Resource, ResourceExt};

use crate::{Error, Result, TENANT_SELECTOR_KEY, config::Config};

pub const FRPC_CONTAINER: &str = "frpc";
pub const SYNC_CONTAINER: &str = "sync";
pub const FRPS_CONTAINER: &str = "frps";
pub const FRPC_INI_VOLUME: &str = "frpc-ini";
pub const FRPC_INI_DIR: &str = "/etc/frpc";
pub const FRPC_INI_PATH: &str = "/etc/frpc/frpc.ini";

/// Name of the broker service port tunnel clients connect to.
pub const FRPS_PORT_NAME: &str = "frps";
pub const KUBELET_PORT: i32 = 10250;

/// Ports allocated to one tenant broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerPorts {
    pub frps: u16,
    pub http: u16,
    pub https: u16,
}

impl BrokerPorts {
    pub const COUNT: usize = 3;

    pub fn from_slice(ports: &[u16]) -> Option<Self> {
        match ports {
            [frps, http, https] => Some(Self {
                frps: *frps,
                http: *http,
                https: *https,
            }),
            _ => None,
        }
    }
}

/// A controller owner reference pointing at `owner`.
pub fn controller_ref<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::UnexpectedError(format!(
            "{} `{}` has no uid, cannot reference it as owner",
            K::kind(&()),
            owner.name_any()
        ))
    })
}

/// Whether `meta` names the object with uid `owner_uid` as its controller.
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: Option<&str>) -> bool {
    let Some(owner_uid) = owner_uid else {
        return false;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == owner_uid)
}

/// The peer service of a node is named after the first DNS label of the node name.
pub fn peer_service_name(node_name: &str) -> &str {
    node_name.split('.').next().unwrap_or(node_name)
}

fn tenant_selector(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(TENANT_SELECTOR_KEY.to_string(), tenant.to_string())])
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn tcp_service_port(name: &str, port: i32, target: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::String(target.to_string())),
        ..Default::default()
    }
}

fn tcp_container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        container_port: port,
        ..Default::default()
    }
}

///
/// The tunnel-client pod of an Ingress: an `frpc` container plus a sidecar that keeps the frpc
/// configuration in sync with the Ingress and triggers live reloads.
///
pub fn tunnel_client_pod(ingress: &Ingress, config: &Config) -> Result<Pod> {
    let name = ingress.name_any();
    let namespace = ingress
        .namespace()
        .ok_or_else(|| Error::UnexpectedError(format!("Ingress `{name}` does not have a namespace")))?;

    let mut sync_env = vec![env("POD_NAMESPACE", &namespace), env("INGRESS_NAME", &name)];
    if let Some(url) = config.public_master_url.as_deref().filter(|url| !url.is_empty()) {
        sync_env.push(env("KUBERNETES_SERVICE_HOST", url));
    }
    if let Some(token) = config.token() {
        sync_env.push(env("FRPS_TOKEN", token));
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([("app".to_string(), name)])),
            owner_references: Some(vec![controller_ref(ingress)?]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![
                Container {
                    name: FRPC_CONTAINER.to_string(),
                    image: Some(config.image.clone()),
                    command: Some(vec!["frpc".into(), "-c".into(), FRPC_INI_PATH.into()]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: FRPC_INI_VOLUME.to_string(),
                        mount_path: FRPC_INI_DIR.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                Container {
                    name: SYNC_CONTAINER.to_string(),
                    image: Some(config.sync_image.clone()),
                    command: Some(vec![
                        "burrow".into(),
                        "sync".into(),
                        "--frpc-ini".into(),
                        FRPC_INI_PATH.into(),
                    ]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: FRPC_INI_VOLUME.to_string(),
                        mount_path: FRPC_INI_DIR.to_string(),
                        ..Default::default()
                    }]),
                    env: Some(sync_env),
                    ..Default::default()
                },
            ],
            volumes: Some(vec![Volume {
                name: FRPC_INI_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

///
/// The broker service of a tenant, exposing the allocated ports on the node IP.
///
pub fn broker_service(namespace: &Namespace, tenant: &str, ports: BrokerPorts, config: &Config) -> Result<Service> {
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(tenant.to_string()),
            namespace: Some(config.system_namespace.clone()),
            owner_references: Some(vec![controller_ref(namespace)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![
                tcp_service_port(FRPS_PORT_NAME, ports.frps.into(), "frps"),
                tcp_service_port("http", ports.http.into(), "http"),
                tcp_service_port("https", ports.https.into(), "https"),
            ]),
            external_ips: Some(vec![config.node_ip.clone()]),
            selector: Some(tenant_selector(tenant)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

///
/// The broker pod of a tenant. Virtual hosts listen on the standard HTTP(S) ports inside the pod;
/// the broker service maps the allocated ports onto them.
///
pub fn broker_pod(namespace: &Namespace, tenant: &str, config: &Config) -> Result<Pod> {
    let mut command = vec![
        "frps".to_string(),
        "--vhost_http_port=80".to_string(),
        "--vhost_https_port=443".to_string(),
    ];
    if let Some(token) = config.token() {
        command.push(format!("--token={token}"));
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(tenant.to_string()),
            namespace: Some(config.system_namespace.clone()),
            labels: Some(tenant_selector(tenant)),
            owner_references: Some(vec![controller_ref(namespace)?]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: FRPS_CONTAINER.to_string(),
                image: Some(config.image.clone()),
                command: Some(command),
                ports: Some(vec![
                    tcp_container_port("frps", 7000),
                    tcp_container_port("http", 80),
                    tcp_container_port("https", 443),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

///
/// The peer service of a tenant node, routing the kubelet port to the tenant's pods.
///
pub fn kubelet_service(node: &Node, service_name: &str, tenant: &str, config: &Config) -> Result<Service> {
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(service_name.to_string()),
            namespace: Some(config.system_namespace.clone()),
            owner_references: Some(vec![controller_ref(node)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![tcp_service_port("kubelet", KUBELET_PORT, "https")]),
            selector: Some(tenant_selector(tenant)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The `(name, port)` pairs of a service, sorted.
pub fn port_set(service: &Service) -> Vec<(String, i32)> {
    let mut ports: Vec<_> = service
        .spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .map(|port| (port.name.clone().unwrap_or_default(), port.port))
        .collect();
    ports.sort();
    ports
}

/// Looks up the port named `name` on a service.
pub fn named_port(service: &Service, name: &str) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|port| port.name.as_deref() == Some(name))
        .map(|port| port.port)
}

pub fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}
