//! Rendering of frpc configuration documents.
//!
//! A document has one section per proxied host/path and a `[common]` section that tells the
//! client how to reach its tenant's broker and where to expose its admin API.

use std::fmt;

use ini::Ini;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use log::warn;
use serde::Serialize;

use crate::{
    Error, Result,
    config::Config,
    objects::{FRPS_PORT_NAME, named_port},
    store::ClusterStore,
    tenant_of,
};

pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0";
pub const DEFAULT_ADMIN_PORT: u16 = 7400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => f.write_str("http"),
            ProxyType::Https => f.write_str("https"),
        }
    }
}

/// One proxied endpoint of a tunnel client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub section: String,
    pub proxy_type: ProxyType,
    pub local_ip: String,
    pub local_port: i32,
    pub custom_domains: String,
    pub locations: Option<String>,
}

/// The `[common]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Common {
    pub server_addr: String,
    pub server_port: i32,
    pub token: Option<String>,
    pub admin_addr: String,
    pub admin_port: u16,
}

impl Common {
    pub fn new(server_addr: impl Into<String>, server_port: i32, token: Option<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_port,
            token: token.filter(|token| !token.is_empty()),
            admin_addr: DEFAULT_ADMIN_ADDR.to_string(),
            admin_port: DEFAULT_ADMIN_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub proxies: Vec<Proxy>,
    pub common: Common,
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for proxy in &self.proxies {
            writeln!(f, "[{}]", proxy.section)?;
            writeln!(f, "type = {}", proxy.proxy_type)?;
            writeln!(f, "local_ip = {}", proxy.local_ip)?;
            writeln!(f, "local_port = {}", proxy.local_port)?;
            writeln!(f, "custom_domains = {}", proxy.custom_domains)?;
            if let Some(locations) = &proxy.locations {
                writeln!(f, "locations = {locations}")?;
            }
            writeln!(f)?;
        }
        let common = &self.common;
        writeln!(f, "[common]")?;
        writeln!(f, "server_addr = {}", common.server_addr)?;
        writeln!(f, "server_port = {}", common.server_port)?;
        if let Some(token) = &common.token {
            writeln!(f, "token = {token}")?;
        }
        writeln!(f, "admin_addr = {}", common.admin_addr)?;
        writeln!(f, "admin_port = {}", common.admin_port)
    }
}

/// Parses a configuration document. Documents without a `[common]` section are rejected, frpc
/// refuses to start on them.
pub fn parse_config(document: &str) -> Result<Ini> {
    let ini = Ini::load_from_str_noescape(document)?;
    if ini.section(Some("common")).is_none() {
        return Err(Error::ConfigError("document has no [common] section".into()));
    }
    Ok(ini)
}

/// Reads `key` from `[section]` of a parsed document.
pub fn ini_value<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))?.get(key)
}

/// Sections of a parsed document that declare a proxy type, for logging.
pub fn proxy_sections(ini: &Ini) -> Vec<&str> {
    ini.iter()
        .filter(|(_, properties)| properties.contains_key("type"))
        .filter_map(|(section, _)| section)
        .collect()
}

/// One proxy per host/path rule of the Ingress. Backends on port 443 are proxied as https.
pub fn ingress_proxies(ingress: &Ingress) -> Vec<Proxy> {
    let namespace = ingress.namespace().unwrap_or_default();
    let mut proxies = Vec::new();
    let rules = ingress.spec.iter().flat_map(|spec| spec.rules.iter().flatten());
    for rule in rules {
        let Some(http) = &rule.http else {
            continue;
        };
        let host = rule.host.clone().unwrap_or_default();
        for path in &http.paths {
            let backend = path.backend.service.as_ref();
            let Some((service, port)) =
                backend.and_then(|svc| Some((svc.name.as_str(), svc.port.as_ref()?.number?)))
            else {
                warn!(
                    "Skipping path `{}` of ingress `{namespace}/{}`: no numbered service port",
                    path.path.as_deref().unwrap_or_default(),
                    ingress.name_any()
                );
                continue;
            };
            let location = path.path.clone().unwrap_or_default();
            proxies.push(Proxy {
                section: format!("{host}{location}"),
                proxy_type: if port == 443 { ProxyType::Https } else { ProxyType::Http },
                local_ip: format!("{service}.{namespace}.svc.cluster.local"),
                local_port: port,
                custom_domains: host.clone(),
                locations: Some(location).filter(|l| !l.is_empty()),
            });
        }
    }
    proxies
}

/// Error body returned by the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub status_code: u16,
    pub message: String,
    pub reason: String,
}

impl ApiError {
    pub fn new(status_code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            reason: if reason.is_empty() { "Unknown".into() } else { reason.into() },
        }
    }
}

/// Settings the renderer puts into every `[common]` section.
#[derive(Debug, Clone, Default)]
pub struct RenderSettings {
    pub server_addr: String,
    pub token: Option<String>,
    pub system_namespace: String,
}

impl From<&Config> for RenderSettings {
    fn from(config: &Config) -> Self {
        Self {
            server_addr: config.frps_address.clone(),
            token: config.token().map(String::from),
            system_namespace: config.system_namespace.clone(),
        }
    }
}

///
/// Renders the frpc configuration for an Ingress from the cached cluster state: its rules become
/// proxies, and its tenant's broker service provides the server port.
///
pub fn render_ingress(
    store: &dyn ClusterStore,
    settings: &RenderSettings,
    namespace: &str,
    name: &str,
) -> Result<TunnelConfig, ApiError> {
    let ingress = store.ingress(namespace, name).ok_or_else(|| {
        ApiError::new(
            400,
            "IngressNotFound",
            format!("ingress '{namespace}/{name}' in work queue no longer exists"),
        )
    })?;
    let ns = store.namespace(namespace).ok_or_else(|| {
        ApiError::new(
            400,
            "FetchNamespaceErr",
            format!("Failed fetching for namespace \"{namespace}\": not found"),
        )
    })?;
    let tenant = tenant_of(&ns.metadata)
        .ok_or_else(|| ApiError::new(400, "TenantNotFound", "This namespace doesn't have a tenant"))?;
    let broker = store.service(&settings.system_namespace, tenant).ok_or_else(|| {
        ApiError::new(
            400,
            "FetchServiceErr",
            format!("Failed fetching frps service: service \"{tenant}\" not found"),
        )
    })?;
    let server_port = named_port(&broker, FRPS_PORT_NAME).filter(|port| *port != 0).ok_or_else(|| {
        ApiError::new(
            400,
            "PortNotFound",
            format!("Failed finding FRPS port for service \"{tenant}\""),
        )
    })?;

    let proxies = ingress_proxies(&ingress);
    if proxies.is_empty() {
        warn!("Found 0 sections, the ingress `{namespace}/{name}` may have an error");
    }
    Ok(TunnelConfig {
        proxies,
        common: Common::new(settings.server_addr.clone(), server_port, settings.token.clone()),
    })
}
