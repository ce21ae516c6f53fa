//! Settings of the `run` command.

use std::{net::SocketAddr, time::Duration};

use clap::Args;

pub const DEFAULT_IMAGE: &str = "quay.io/sandromello/frp:v0.20.0";
/// Image of this binary, used for the sync sidecar of tunnel-client pods.
pub const DEFAULT_SYNC_IMAGE: &str = concat!("ghcr.io/burrow-sh/burrow:v", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_RESYNC_SECS: u64 = 30;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:3500";
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 60;

///
/// Configuration of the controller and the tunnel-config renderer that runs next to it.
///
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// The IP of the node that exposes the tenant broker ports.
    #[arg(long, env = "FRPS_NODE_IP")]
    pub node_ip: String,

    /// The address tunnel clients use to reach the brokers.
    #[arg(long, env = "FRPS_ADDRESS", default_value = "")]
    pub frps_address: String,

    /// Token shared between brokers and tunnel clients.
    #[arg(long, env = "FRPS_TOKEN")]
    pub frps_token: Option<String>,

    /// The frp image used for broker and tunnel-client pods.
    #[arg(long, default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// The image running `burrow sync` next to each tunnel client. Must contain the burrow binary.
    #[arg(long, env = "BURROW_IMAGE", default_value = DEFAULT_SYNC_IMAGE)]
    pub sync_image: String,

    /// The public address of the API server handed to the sync sidecar.
    #[arg(long)]
    pub public_master_url: Option<String>,

    /// Only watch Ingresses in this namespace. Watches all namespaces when unset.
    #[arg(long)]
    pub watch_namespace: Option<String>,

    /// The namespace the controller runs in; broker and kubelet resources are created here.
    #[arg(long, env = "POD_NAMESPACE")]
    pub system_namespace: String,

    /// Number of workers per work queue.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Upper bound in seconds for a single reconcile call.
    #[arg(long = "reconcile-timeout", default_value_t = DEFAULT_RECONCILE_TIMEOUT_SECS)]
    pub reconcile_timeout_secs: u64,

    /// Seconds between two passes that re-enqueue every cached object.
    #[arg(long = "resync", default_value_t = DEFAULT_RESYNC_SECS)]
    pub resync_secs: u64,

    /// Address of the tunnel-config HTTP endpoint.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,
}

impl Config {
    pub fn new(node_ip: impl Into<String>, system_namespace: impl Into<String>) -> Self {
        Self {
            node_ip: node_ip.into(),
            frps_address: String::new(),
            frps_token: None,
            image: DEFAULT_IMAGE.to_string(),
            sync_image: DEFAULT_SYNC_IMAGE.to_string(),
            public_master_url: None,
            watch_namespace: None,
            system_namespace: system_namespace.into(),
            workers: 1,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            resync_secs: DEFAULT_RESYNC_SECS,
            listen: SocketAddr::from(([0, 0, 0, 0], 3500)),
        }
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Interval of the cache resync, never shorter than a second.
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }

    /// The broker token, if one is configured and non-empty.
    pub fn token(&self) -> Option<&str> {
        self.frps_token.as_deref().filter(|token| !token.is_empty())
    }
}
