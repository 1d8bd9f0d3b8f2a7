// Jackson Coxson

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use kanal::AsyncSender;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::{error::ProxyError, session::ProxySession};

const BACKLOG: i32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Opens the listening socket for `host`.
///
/// An unspecified IPv6 host is bound dual-stack so IPv4 peers are accepted
/// too. Hosts without IPv6 get `0.0.0.0` on the same port instead.
fn listen(host: SocketAddr) -> io::Result<TcpListener> {
    match host {
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => match listen_on(host) {
            Err(e)
                if !matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                warn!(
                    "[{}] IPv6 unavailable ({e}), listening on IPv4 only",
                    host.port()
                );
                listen_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, host.port())))
            }
            res => res,
        },
        _ => listen_on(host),
    }
}

fn listen_on(host: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(host), Type::STREAM, Some(Protocol::TCP))?;
    if host.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&host.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Accepts connections on one port and relays each of them to `target`.
pub struct ProxyListener {
    listener: TcpListener,
    port: u16,
    target: SocketAddrV4,
    dial_timeout: Option<Duration>,
}

impl ProxyListener {
    pub async fn bind(host: SocketAddr, target: SocketAddrV4) -> Result<Self, ProxyError> {
        let listener = listen(host).map_err(|source| ProxyError::Bind {
            port: host.port(),
            source,
        })?;
        let port = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                port: host.port(),
                source,
            })?
            .port();
        info!("TCP Proxy server listening on port {port}, forwarding to {target}");

        Ok(Self {
            listener,
            port,
            target,
            dial_timeout: None,
        })
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Option<Duration>) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts forever. Every connection gets its own session task, whatever
    /// the peer's address family.
    pub async fn serve(self) {
        let port = self.port;
        loop {
            let (stream, src) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("[{port}] Failed to accept connection: {e}");
                    // Out of descriptors and similar errors persist, so wait
                    // before trying again.
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let session = ProxySession::new(port, stream, src, self.target)
                .with_dial_timeout(self.dial_timeout);
            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    debug!("[{port}] Session ended early: {e}");
                }
            });
        }
    }
}

/// Binds `host`, reports the bound address (or `None`) on `ready`, then
/// serves until the process exits. A failed bind only takes out this port.
pub async fn open_tcp(
    host: SocketAddr,
    target: SocketAddrV4,
    dial_timeout: Option<Duration>,
    ready: AsyncSender<(u16, Option<SocketAddr>)>,
) {
    let port = host.port();
    let listener = match ProxyListener::bind(host, target).await {
        Ok(listener) => listener.with_dial_timeout(dial_timeout),
        Err(e) => {
            error!("{e}");
            if e.is_addr_in_use() {
                error!("Error: Port {port} is already in use");
            }
            ready.send((port, None)).await.ok();
            return;
        }
    };
    ready.send((port, listener.local_addr().ok())).await.ok();
    drop(ready);

    listener.serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use std::net::{IpAddr, Ipv6Addr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::timeout,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected an IPv4 address"),
        }
    }

    /// A target listener and a running proxy in front of it.
    async fn proxy_to_fresh_target() -> (TcpListener, SocketAddr) {
        let target = TcpListener::bind(loopback(0)).await.unwrap();
        let proxy = ProxyListener::bind(loopback(0), v4(target.local_addr().unwrap()))
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.serve());
        (target, proxy_addr)
    }

    #[tokio::test]
    async fn ping_pong_end_to_end() {
        let (target, proxy_addr) = proxy_to_fresh_target().await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"PING").await.unwrap();

        let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"PING");

        upstream.write_all(b"PONG").await.unwrap();
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"PONG");

        drop(client);
        let size = timeout(WAIT, upstream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn relays_large_streams_in_order() {
        let (target, proxy_addr) = proxy_to_fresh_target().await;
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();

        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            for chunk in sent.chunks(1000) {
                client.write_all(chunk).await.unwrap();
            }
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);

        let mut client = writer.await.unwrap();
        let reader = tokio::spawn(async move {
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            echoed
        });

        upstream.write_all(&payload).await.unwrap();
        upstream.shutdown().await.unwrap();

        let echoed = timeout(WAIT, reader).await.unwrap().unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn client_half_close_keeps_reply_path_open() {
        let (target, proxy_addr) = proxy_to_fresh_target().await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
        let mut received = Vec::new();
        timeout(WAIT, upstream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"last words");

        upstream.write_all(b"late reply").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        timeout(WAIT, client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"late reply");
    }

    #[tokio::test]
    async fn failed_dial_closes_client() {
        let unused = TcpListener::bind(loopback(0)).await.unwrap();
        let dead_target = v4(unused.local_addr().unwrap());
        drop(unused);

        let proxy = ProxyListener::bind(loopback(0), dead_target).await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.serve());

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let result = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn dial_timeout_gives_up_on_silent_target() {
        // Non-routable address, the SYN goes nowhere.
        let blackhole = SocketAddrV4::new(Ipv4Addr::new(10, 255, 255, 1), 9);
        let proxy = ProxyListener::bind(loopback(0), blackhole)
            .await
            .unwrap()
            .with_dial_timeout(Some(Duration::from_millis(200)));
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.serve());

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let result = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn busy_port_fails_only_that_listener() {
        let (target, proxy_addr) = proxy_to_fresh_target().await;

        let busy = TcpListener::bind(loopback(0)).await.unwrap();
        let busy_addr = busy.local_addr().unwrap();
        let err = ProxyListener::bind(busy_addr, v4(target.local_addr().unwrap()))
            .await
            .err()
            .expect("bind on a busy port must fail");
        assert!(err.is_addr_in_use());
        assert!(matches!(err, ProxyError::Bind { port, .. } if port == busy_addr.port()));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"still here").await.unwrap();
        let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
        let mut buf = [0u8; 10];
        timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn open_tcp_reports_bind_outcome() {
        let busy = TcpListener::bind(loopback(0)).await.unwrap();
        let busy_addr = busy.local_addr().unwrap();
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, busy_addr.port());

        let (tx, rx) = kanal::unbounded_async();
        let task = tokio::spawn(open_tcp(busy_addr, target, None, tx));
        let report = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(report, (busy_addr.port(), None));
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn default_bind_relays_ipv6_and_ipv4_clients() {
        if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
            // No IPv6 loopback on this host
            return;
        }
        let target = TcpListener::bind(loopback(0)).await.unwrap();
        let host = SocketAddr::new(HubConfig::default().bind_address, 0);
        let proxy = ProxyListener::bind(host, v4(target.local_addr().unwrap()))
            .await
            .unwrap();
        let port = proxy.local_addr().unwrap().port();
        tokio::spawn(proxy.serve());

        for client_ip in [IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)] {
            let mut client = timeout(WAIT, TcpStream::connect((client_ip, port)))
                .await
                .unwrap()
                .unwrap();
            client.write_all(b"hi").await.unwrap();

            let (mut upstream, _) = timeout(WAIT, target.accept()).await.unwrap().unwrap();
            let mut buf = [0u8; 2];
            timeout(WAIT, upstream.read_exact(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf, b"hi");
        }
    }
}
