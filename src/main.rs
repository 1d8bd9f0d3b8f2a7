// Jackson Coxson

mod config;
mod error;
mod resolver;
mod session;
mod tcp;

use std::net::{SocketAddr, SocketAddrV4};

use log::{info, warn};
use tokio::task::JoinSet;

use config::HubConfig;
use resolver::Endpoints;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let config = HubConfig::default();

    info!("Resolving hub endpoints");
    let endpoints = Endpoints::resolve(&config).await;

    let (mut tasks, serving) = start_listeners(&config, &endpoints).await;
    if serving.is_empty() {
        warn!("No hub port could be opened, nothing to serve");
    } else {
        info!("Starting server, all ports have been requested! Serving {serving:?}");
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!("Listener task crashed: {e}");
        }
    }
}

/// Spawns one listener per hub port, each forwarding to the same port on the
/// hub, and waits until every one of them has tried to bind. Returns the
/// listener tasks and the ports that are actually being served.
async fn start_listeners(config: &HubConfig, endpoints: &Endpoints) -> (JoinSet<()>, Vec<u16>) {
    let (ready_tx, ready_rx) = kanal::unbounded_async();

    let mut tasks = JoinSet::new();
    for &port in &endpoints.ports {
        tasks.spawn(tcp::open_tcp(
            SocketAddr::new(config.bind_address, port),
            SocketAddrV4::new(endpoints.hub_ip, port),
            config.dial_timeout,
            ready_tx.clone(),
        ));
    }
    drop(ready_tx);

    let mut serving = Vec::new();
    for _ in 0..endpoints.ports.len() {
        match ready_rx.recv().await {
            Ok((port, Some(_))) => serving.push(port),
            Ok((_, None)) => {}
            Err(_) => break,
        }
    }
    (tasks, serving)
}
