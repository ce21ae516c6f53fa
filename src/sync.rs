//! The `sync` sidecar: keeps the frpc configuration file of a tunnel client up to date.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, ValueEnum};
use ini::Ini;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use log::{info, warn};

use crate::{
    Error, Result, TENANT_SELECTOR_KEY,
    objects::{FRPC_INI_PATH, FRPS_PORT_NAME, KUBELET_PORT, named_port, peer_service_name},
    render::{Common, DEFAULT_ADMIN_PORT, Proxy, ProxyType, TunnelConfig, ini_value, parse_config, proxy_sections},
};

/// Namespace holding the discovery services.
pub const PUBLIC_NAMESPACE: &str = "kube-public";

/// ExternalName service pointing at the tunnel-config endpoint.
pub const INI_SERVER_SERVICE: &str = "ini-server";

/// ExternalName service pointing at the public broker address.
pub const BROKER_SERVICE: &str = "valhala";

pub const DEFAULT_RESYNC_SECS: u64 = 120;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Fetch the rendered configuration of an Ingress.
    Ingress,
    /// Derive the configuration that exposes the node's kubelet.
    Kubelet,
}

#[derive(Args, Clone, Debug)]
pub struct SyncArgs {
    /// Which configuration to keep in sync.
    #[arg(long = "sync", value_enum, default_value_t = SyncMode::Ingress)]
    pub mode: SyncMode,

    /// Seconds between two syncs.
    #[arg(long, default_value_t = DEFAULT_RESYNC_SECS)]
    pub resync: u64,

    /// Path of the frpc configuration file.
    #[arg(long, default_value = FRPC_INI_PATH)]
    pub frpc_ini: PathBuf,

    /// Base URL of the tunnel-config endpoint. Discovered from `kube-public/ini-server` when unset.
    #[arg(long, aliases = ["server", "ini-server"])]
    pub frpc_ini_server: Option<String>,

    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "INGRESS_NAME", default_value = "")]
    pub ingress_name: String,

    #[arg(long, env = "POD_NODE_NAME", default_value = "")]
    pub node_name: String,

    #[arg(long, env = "POD_HOST_IP", default_value = "")]
    pub host_ip: String,
}

/// Base URL of the tunnel-config endpoint behind an `ini-server` ExternalName service. The first
/// port decides the scheme (443 means https).
pub fn ini_server_url(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    let host = spec.external_name.as_deref().filter(|name| !name.is_empty())?;
    let port = spec.ports.iter().flatten().next().map(|p| p.port).unwrap_or(0);
    let scheme = if port == 443 { "https" } else { "http" };
    Some(match port {
        0 => format!("{scheme}://{host}"),
        port => format!("{scheme}://{host}:{port}"),
    })
}

/// The configuration exposing a node's kubelet through its tenant broker.
pub fn kubelet_config(broker_addr: &str, frps_port: i32, node_name: &str, host_ip: &str) -> TunnelConfig {
    TunnelConfig {
        proxies: vec![Proxy {
            section: peer_service_name(node_name).to_string(),
            proxy_type: ProxyType::Https,
            local_ip: host_ip.to_string(),
            local_port: KUBELET_PORT,
            custom_domains: node_name.to_string(),
            locations: None,
        }],
        common: Common::new(broker_addr, frps_port, None),
    }
}

/// Admin port announced by a configuration document, 7400 when absent or invalid.
pub fn admin_port(ini: &Ini) -> u16 {
    ini_value(ini, "common", "admin_port")
        .and_then(|port| port.parse().ok())
        .filter(|port| *port != 0)
        .unwrap_or(DEFAULT_ADMIN_PORT)
}

/// Writes the document and reports whether the file existed before.
pub async fn write_config(path: &Path, document: &str) -> Result<bool> {
    let existed = tokio::fs::try_exists(path).await?;
    tokio::fs::write(path, document).await?;
    Ok(existed)
}

/// Writes the document only if it parses, so a bad response never replaces a working file.
/// Returns the parsed document and whether the file existed before.
pub async fn install_config(path: &Path, document: &str) -> Result<(Ini, bool)> {
    let ini = parse_config(document)?;
    let existed = write_config(path, document).await?;
    Ok((ini, existed))
}

pub struct Syncer {
    args: SyncArgs,
    client: Client,
    http: reqwest::Client,
}

impl Syncer {
    pub fn new(args: SyncArgs, client: Client) -> Self {
        Self {
            args,
            client,
            http: reqwest::Client::new(),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let service = Api::<Service>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await?;
        Ok(service)
    }

    async fn discover_ini_server(&self) -> Result<String> {
        let service = self.get_service(PUBLIC_NAMESPACE, INI_SERVER_SERVICE).await?;
        ini_server_url(&service).ok_or_else(|| {
            Error::ConfigError(format!(
                "service `{PUBLIC_NAMESPACE}/{INI_SERVER_SERVICE}` has no external name"
            ))
        })
    }

    async fn fetch_ingress_config(&self, server: &str) -> Result<String> {
        let url = format!(
            "{}/v1/namespaces/{}/ingress/{}",
            server.trim_end_matches('/'),
            self.args.namespace,
            self.args.ingress_name
        );
        info!("Requesting {url}");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn kubelet_document(&self) -> Result<String> {
        let broker = self.get_service(PUBLIC_NAMESPACE, BROKER_SERVICE).await?;
        let broker_addr = broker
            .spec
            .as_ref()
            .and_then(|spec| spec.external_name.clone())
            .unwrap_or_default();
        if broker_addr.is_empty() {
            info!("External name is empty for service `{PUBLIC_NAMESPACE}/{BROKER_SERVICE}`");
        }

        let namespace = &self.args.namespace;
        let service_name = peer_service_name(&self.args.node_name);
        let peer = self.get_service(namespace, service_name).await?;
        let tenant = peer
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .and_then(|selector| selector.get(TENANT_SELECTOR_KEY))
            .filter(|tenant| !tenant.is_empty())
            .ok_or_else(|| Error::ConfigError(format!("service `{namespace}/{service_name}` has no tenant selector")))?;

        let tenant_service = self.get_service(namespace, tenant).await?;
        let frps_port = named_port(&tenant_service, FRPS_PORT_NAME)
            .filter(|port| *port != 0)
            .ok_or_else(|| Error::ConfigError(format!("failed discovering frps port for service `{tenant}`")))?;
        info!("Found port {frps_port} for tenant `{tenant}`");

        Ok(kubelet_config(&broker_addr, frps_port, &self.args.node_name, &self.args.host_ip).to_string())
    }

    async fn reload(&self, admin_port: u16) -> Result<String> {
        let response = self
            .http
            .get(format!("http://127.0.0.1:{admin_port}/api/reload"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    /// Fetches or derives the document once, writes it and reloads frpc.
    pub async fn sync_once(&self, ini_server: Option<&str>) -> Result<()> {
        let document = match (self.args.mode, ini_server) {
            (SyncMode::Ingress, Some(server)) => self.fetch_ingress_config(server).await?,
            (SyncMode::Ingress, None) => return Err("no tunnel-config endpoint to fetch from".into()),
            (SyncMode::Kubelet, _) => self.kubelet_document().await?,
        };

        let (ini, existed) = install_config(&self.args.frpc_ini, &document).await?;
        info!("Wrote `{}`", self.args.frpc_ini.display());
        for section in proxy_sections(&ini) {
            info!(
                "section={section}, type={}, local_ip={}, local_port={}, custom_domains={}",
                ini_value(&ini, section, "type").unwrap_or_default(),
                ini_value(&ini, section, "local_ip").unwrap_or_default(),
                ini_value(&ini, section, "local_port").unwrap_or_default(),
                ini_value(&ini, section, "custom_domains").unwrap_or_default(),
            );
        }

        if !existed {
            info!("First write, frpc picks the configuration up on start");
            return Ok(());
        }
        match self.reload(admin_port(&ini)).await {
            Ok(body) => info!("Reloaded frpc: {body}"),
            Err(e) => warn!("Failed reloading frpc config: {e}"),
        }
        Ok(())
    }

    /// Syncs every `resync` seconds until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        let ini_server = match (self.args.mode, &self.args.frpc_ini_server) {
            (SyncMode::Ingress, Some(server)) => Some(server.clone()),
            (SyncMode::Ingress, None) => Some(self.discover_ini_server().await?),
            (SyncMode::Kubelet, _) => None,
        };

        let resync = Duration::from_secs(self.args.resync.max(1));
        let mut interval = tokio::time::interval(resync);
        loop {
            interval.tick().await;
            info!("Sync started");
            match self.sync_once(ini_server.as_deref()).await {
                Ok(()) => info!("Sync finished"),
                Err(e) => warn!("Sync failed: {e}"),
            }
            info!("Resync after {} second(s)", resync.as_secs());
        }
    }
}

pub async fn run(args: SyncArgs) -> Result<()> {
    let client = Client::try_default().await?;
    Syncer::new(args, client).run().await
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    use super::*;

    fn external(name: &str, port: Option<i32>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                external_name: Some(name.into()),
                ports: port.map(|port| {
                    vec![ServicePort {
                        port,
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ini_server_scheme_follows_port() {
        assert_eq!(
            ini_server_url(&external("ini.example.com", Some(443))).as_deref(),
            Some("https://ini.example.com:443")
        );
        assert_eq!(
            ini_server_url(&external("ini.example.com", Some(3500))).as_deref(),
            Some("http://ini.example.com:3500")
        );
        assert_eq!(
            ini_server_url(&external("ini.example.com", None)).as_deref(),
            Some("http://ini.example.com")
        );
        assert_eq!(ini_server_url(&external("", Some(80))), None);
    }

    #[test]
    fn kubelet_section_is_named_after_the_node() {
        let document = kubelet_config("broker.example.com", 20003, "worker-1.example.com", "192.168.1.10").to_string();
        let ini = parse_config(&document).unwrap();
        assert_eq!(ini_value(&ini, "worker-1", "type"), Some("https"));
        assert_eq!(ini_value(&ini, "worker-1", "local_ip"), Some("192.168.1.10"));
        assert_eq!(ini_value(&ini, "worker-1", "local_port"), Some("10250"));
        assert_eq!(ini_value(&ini, "worker-1", "custom_domains"), Some("worker-1.example.com"));
        assert_eq!(ini_value(&ini, "common", "server_addr"), Some("broker.example.com"));
        assert_eq!(ini_value(&ini, "common", "server_port"), Some("20003"));
        assert_eq!(admin_port(&ini), DEFAULT_ADMIN_PORT);
    }

    #[test]
    fn admin_port_defaults() {
        let port = |document: &str| admin_port(&parse_config(document).unwrap());
        assert_eq!(port("[common]\nadmin_port = 7401\n"), 7401);
        assert_eq!(port("[common]\nadmin_port = nope\n"), 7400);
        assert_eq!(port("[web]\nadmin_port = 7401\n[common]\n"), 7400);
    }

    #[tokio::test]
    async fn first_write_is_reported() {
        let path = std::env::temp_dir().join(format!("burrow-sync-{}.ini", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        assert!(!write_config(&path, "[common]\n").await.unwrap());
        assert!(write_config(&path, "[common]\nserver_port = 1\n").await.unwrap());
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "[common]\nserver_port = 1\n"
        );
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_document_keeps_the_previous_file() {
        let path = std::env::temp_dir().join(format!("burrow-install-{}.ini", std::process::id()));
        let _ = tokio::fs::remove_file(&path).await;

        let (ini, existed) = install_config(&path, "[common]\nadmin_port = 7401\n").await.unwrap();
        assert!(!existed);
        assert_eq!(admin_port(&ini), 7401);

        assert!(install_config(&path, "upstream connect error").await.is_err());
        assert!(install_config(&path, "[web/]\ntype = http\n").await.is_err());
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "[common]\nadmin_port = 7401\n"
        );
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
