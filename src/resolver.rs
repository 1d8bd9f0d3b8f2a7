// Jackson Coxson

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use log::{error, info, warn};

use crate::{config::HubConfig, error::ResolveError};

/// The hub address and the ports to relay, as decided at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub hub_ip: Ipv4Addr,
    pub ports: Vec<u16>,
}

impl Endpoints {
    pub async fn resolve(config: &HubConfig) -> Self {
        let ports = fetch_hub_ports(&config.hub_ports_url, config.lookup_timeout).await;
        let hub_ip = lookup_hub_ip(&config.hub_hostname, config.lookup_timeout).await;
        Self::from_lookups(config, ports, hub_ip)
    }

    /// Applies the fallbacks independently to each lookup result.
    pub fn from_lookups(
        config: &HubConfig,
        ports: Result<Vec<u16>, ResolveError>,
        hub_ip: Result<Ipv4Addr, ResolveError>,
    ) -> Self {
        let ports = match ports {
            Ok(ports) => {
                info!("Got hub ports: {}", join_ports(&ports));
                ports
            }
            Err(e) => {
                warn!(
                    "Failed to get hub ports ({e})! Falling back to fallback ports {}",
                    join_ports(&config.fallback_ports)
                );
                config.fallback_ports.clone()
            }
        };

        let hub_ip = match hub_ip {
            Ok(ip) => {
                info!("Got hub IP: {ip}");
                ip
            }
            Err(e) => {
                error!("Failed to query hub IP! {e}");
                warn!("Falling back to fallback IP {}", config.fallback_ip);
                config.fallback_ip
            }
        };

        Self { hub_ip, ports }
    }
}

pub async fn fetch_hub_ports(url: &str, timeout: Duration) -> Result<Vec<u16>, ResolveError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_hub_ports(&body)
}

/// Parses the hub ports listing, one decimal port per line.
///
/// Lines that are not a valid non-zero port are skipped, as are repeats.
/// A listing with nothing usable in it is an error so the caller falls back
/// to its defaults instead of listening on nothing.
pub fn parse_hub_ports(body: &str) -> Result<Vec<u16>, ResolveError> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();
    for line in body.trim().lines() {
        let line = line.trim();
        match line.parse::<u16>() {
            Ok(0) | Err(_) => warn!("Skipping invalid hub port entry {line:?}"),
            Ok(port) => {
                if seen.insert(port) {
                    ports.push(port);
                } else {
                    warn!("Skipping duplicate hub port {port}");
                }
            }
        }
    }

    if ports.is_empty() {
        return Err(ResolveError::NoPorts);
    }
    Ok(ports)
}

/// Resolves `host` with the system resolver and returns its first IPv4
/// address.
pub async fn lookup_hub_ip(host: &str, timeout: Duration) -> Result<Ipv4Addr, ResolveError> {
    let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ResolveError::Timeout(host.to_string()))??;

    addrs
        .map(|addr| addr.ip())
        .find_map(|ip| match ip {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| ResolveError::NoIpv4Record(host.to_string()))
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
