//! Allocation of tenant broker ports on the node IP that exposes them.

use std::{collections::HashMap, ops::RangeInclusive, sync::Arc};

use k8s_openapi::api::core::v1::Service;
use log::debug;

/// Ports handed out to tenant brokers.
pub const ALLOCATABLE_PORTS: RangeInclusive<u16> = 20000..=21000;

const WORDS: usize = (u16::MAX as usize + 1) / 64;

/// An allocator shared between concurrently running namespace reconciles. Callers hold the lock
/// for the whole reload/allocate sequence.
pub type SharedPortAllocator = Arc<tokio::sync::Mutex<PortAllocator>>;

///
/// Availability of every port on a single IP. A set bit marks the port as unavailable.
///
#[derive(Clone)]
pub struct PortTable {
    taken: Box<[u64; WORDS]>,
}

impl PortTable {
    fn new() -> Self {
        Self {
            taken: Box::new([0; WORDS]),
        }
    }

    pub fn is_available(&self, port: u16) -> bool {
        let port = port as usize;
        self.taken[port / 64] & (1 << (port % 64)) == 0
    }

    fn take(&mut self, port: u16) {
        let port = port as usize;
        self.taken[port / 64] |= 1 << (port % 64);
    }
}

///
/// Per-IP port availability, rebuilt authoritatively from the services known to the cluster.
///
/// An IP that was never reloaded has no available ports.
///
#[derive(Default)]
pub struct PortAllocator {
    tables: HashMap<String, PortTable>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPortAllocator {
        Arc::new(tokio::sync::Mutex::new(Self::new()))
    }

    /// Rebuilds the table for `ip`. Every port declared by a service that binds `ip` as an external
    /// IP becomes unavailable, every other port available.
    pub fn reload<'a, I>(&mut self, ip: &str, services: I)
    where
        I: IntoIterator<Item = &'a Service>,
    {
        let mut table = PortTable::new();
        let mut bound = 0;
        for spec in services.into_iter().filter_map(|svc| svc.spec.as_ref()) {
            let binds_ip = spec
                .external_ips
                .as_ref()
                .is_some_and(|ips| ips.iter().any(|external| external == ip));
            if !binds_ip {
                continue;
            }
            for port in spec.ports.iter().flatten() {
                if let Ok(port) = u16::try_from(port.port) {
                    table.take(port);
                    bound += 1;
                }
            }
        }
        debug!("Reloaded port table for `{ip}` with {bound} bound port(s)");
        self.tables.insert(ip.to_string(), table);
    }

    /// Takes the lowest available port of [`ALLOCATABLE_PORTS`] on `ip`.
    pub fn pop(&mut self, ip: &str) -> Option<u16> {
        let table = self.tables.get_mut(ip)?;
        let port = ALLOCATABLE_PORTS.into_iter().find(|port| table.is_available(*port))?;
        table.take(port);
        Some(port)
    }

    /// Takes `count` ports on `ip`, or none at all if the range runs out.
    ///
    /// Ports taken before the range ran out are not released; the next [`PortAllocator::reload`]
    /// restores them.
    pub fn pop_many(&mut self, ip: &str, count: usize) -> Option<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            ports.push(self.pop(ip)?);
        }
        Some(ports)
    }

    pub fn table(&self, ip: &str) -> Option<&PortTable> {
        self.tables.get(ip)
    }
}
