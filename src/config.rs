// Jackson Coxson

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

pub const HUB_PORTS_URL: &str = "https://secure.byond.com/HubPorts";
pub const HUB_HOSTNAME: &str = "hub.byond.com";
pub const FALLBACK_HUB_IP: Ipv4Addr = Ipv4Addr::new(69, 39, 237, 88);
pub const FALLBACK_HUB_PORTS: [u16; 2] = [6001, 20002];

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the relay needs to know before it starts. Built once in `main`
/// and only read afterwards.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Where the newline separated port list is fetched from
    pub hub_ports_url: String,
    /// Hostname whose first A record is the relay target
    pub hub_hostname: String,
    pub fallback_ip: Ipv4Addr,
    pub fallback_ports: Vec<u16>,
    /// Local address every listener binds on, paired with each hub port.
    /// `::` is bound dual-stack, so IPv4 and IPv6 clients both get in
    pub bind_address: IpAddr,
    /// Upper bound on each startup lookup
    pub lookup_timeout: Duration,
    /// Upper bound on dialing the target; `None` waits as long as the OS does
    pub dial_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_ports_url: HUB_PORTS_URL.to_string(),
            hub_hostname: HUB_HOSTNAME.to_string(),
            fallback_ip: FALLBACK_HUB_IP,
            fallback_ports: FALLBACK_HUB_PORTS.to_vec(),
            bind_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            lookup_timeout: LOOKUP_TIMEOUT,
            dial_timeout: None,
        }
    }
}
