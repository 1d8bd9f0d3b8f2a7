// Jackson Coxson

use std::{
    fmt, io,
    net::{SocketAddr, SocketAddrV4},
    time::Duration,
};

use log::{error, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use crate::error::ProxyError;

const BUFFER_SIZE: usize = 16 * 1024;

/// One side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Target,
}

impl Leg {
    pub fn peer(self) -> Leg {
        match self {
            Leg::Client => Leg::Target,
            Leg::Target => Leg::Client,
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => write!(f, "local client"),
            Leg::Target => write!(f, "target server"),
        }
    }
}

/// State of the bytes flowing out of one leg into its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Open,
    /// The source ended and the peer is being half-closed
    HalfClosing,
    Closed,
}

/// What the session has to do after feeding an event to [`Teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Gracefully half-close this leg
    End(Leg),
    /// Drop this leg now, without flushing
    Destroy(Leg),
    /// Both directions are closed
    Finish,
    Nothing,
}

/// Teardown bookkeeping for one session.
///
/// Each direction is tracked on its own as `Open -> HalfClosing -> Closed`.
/// An end of stream only closes the direction it came from, an error closes
/// both and condemns the other leg.
#[derive(Debug)]
pub struct Teardown {
    from_client: Flow,
    from_target: Flow,
    destroyed: Option<Leg>,
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

impl Teardown {
    pub fn new() -> Self {
        Self {
            from_client: Flow::Open,
            from_target: Flow::Open,
            destroyed: None,
        }
    }

    /// The direction whose bytes come from `source`.
    pub fn flow(&self, source: Leg) -> Flow {
        match source {
            Leg::Client => self.from_client,
            Leg::Target => self.from_target,
        }
    }

    fn flow_mut(&mut self, source: Leg) -> &mut Flow {
        match source {
            Leg::Client => &mut self.from_client,
            Leg::Target => &mut self.from_target,
        }
    }

    pub fn destroyed(&self) -> Option<Leg> {
        self.destroyed
    }

    pub fn is_finished(&self) -> bool {
        self.from_client == Flow::Closed && self.from_target == Flow::Closed
    }

    /// `source` reached end of stream.
    pub fn on_end(&mut self, source: Leg) -> Action {
        let flow = self.flow_mut(source);
        if *flow != Flow::Open {
            return Action::Nothing;
        }
        *flow = Flow::HalfClosing;
        Action::End(source.peer())
    }

    /// The half-close caused by `source` ending went out on the peer.
    pub fn on_ended(&mut self, source: Leg) -> Action {
        let flow = self.flow_mut(source);
        if *flow == Flow::HalfClosing {
            *flow = Flow::Closed;
        }
        if self.is_finished() {
            Action::Finish
        } else {
            Action::Nothing
        }
    }

    /// `leg` failed. Everything closes and the other leg is torn down.
    pub fn on_error(&mut self, leg: Leg) -> Action {
        let already_over = self.is_finished();
        self.from_client = Flow::Closed;
        self.from_target = Flow::Closed;
        if already_over || self.destroyed.is_some() {
            return Action::Finish;
        }
        self.destroyed = Some(leg.peer());
        Action::Destroy(leg.peer())
    }
}

/// How a relay direction stopped.
enum Exit {
    /// The source ended; the writer toward the peer is handed back so it can
    /// be half-closed
    Eof(Leg, OwnedWriteHalf),
    Failed(Leg, io::Error),
}

/// Copies chunks from `reader` (belonging to `source`) into `writer` until
/// end of stream or an error on either leg.
async fn pump(
    port: u16,
    source: Leg,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
) -> Exit {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let size = match reader.read(&mut buf).await {
            Ok(0) => return Exit::Eof(source, writer),
            Ok(size) => size,
            Err(e) => return Exit::Failed(source, e),
        };
        info!("[{port}] Data from {source} ({size} bytes) -> {}", source.peer());
        if let Err(e) = writer.write_all(&buf[..size]).await {
            return Exit::Failed(source.peer(), e);
        }
    }
}

/// A client connection and the connection dialed to the target on its
/// behalf. Both sockets belong to the session and die with it.
pub struct ProxySession {
    port: u16,
    client: TcpStream,
    client_addr: SocketAddr,
    target: SocketAddrV4,
    dial_timeout: Option<Duration>,
}

impl ProxySession {
    pub fn new(
        port: u16,
        client: TcpStream,
        client_addr: SocketAddr,
        target: SocketAddrV4,
    ) -> Self {
        Self {
            port,
            client,
            client_addr,
            target,
            dial_timeout: None,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Option<Duration>) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Dials the target and relays until both directions are closed.
    ///
    /// If the dial fails the client socket is dropped along with the session.
    /// Both sockets are closed by the time this returns, whatever the outcome.
    pub async fn run(self) -> Result<(), ProxyError> {
        let port = self.port;
        let client_addr = self.client_addr;
        info!("[{port}] Incoming client connection from {client_addr}");

        let dialed = self.dial().await;
        let result = match dialed {
            Ok(target) => {
                info!("[{port}] Connected to target server {}", self.target);
                self.relay(target).await
            }
            Err(e) => {
                error!("[{port}] {e}. Dropping local client {client_addr}");
                drop(self);
                Err(e)
            }
        };

        info!("[{port}] Local client {client_addr} connection closed.");
        info!("[{port}] Target server connection closed.");
        result
    }

    async fn dial(&self) -> Result<TcpStream, ProxyError> {
        let target = self.target;
        let connect = TcpStream::connect(target);
        let stream = match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ProxyError::DialTimeout { target })?,
            None => connect.await,
        };
        stream.map_err(|source| ProxyError::Dial { target, source })
    }

    async fn relay(self, target: TcpStream) -> Result<(), ProxyError> {
        let port = self.port;
        let client_addr = self.client_addr;

        let (client_rd, client_wr) = self.client.into_split();
        let (target_rd, target_wr) = target.into_split();

        let upstream = pump(port, Leg::Client, client_rd, target_wr);
        let downstream = pump(port, Leg::Target, target_rd, client_wr);
        tokio::pin!(upstream, downstream);

        let mut teardown = Teardown::new();
        while !teardown.is_finished() {
            let exit = tokio::select! {
                exit = &mut upstream, if teardown.flow(Leg::Client) == Flow::Open => exit,
                exit = &mut downstream, if teardown.flow(Leg::Target) == Flow::Open => exit,
                else => break,
            };

            match exit {
                Exit::Eof(source, mut writer) => {
                    match source {
                        Leg::Client => info!(
                            "[{port}] Local client {client_addr} disconnected. Closing target server connection."
                        ),
                        Leg::Target => info!(
                            "[{port}] Target server disconnected. Closing local client connection."
                        ),
                    }
                    if let Action::End(peer) = teardown.on_end(source) {
                        if let Err(e) = writer.shutdown().await {
                            error!("[{port}] Half-closing {peer} failed: {e}");
                            if let Action::Destroy(other) = teardown.on_error(peer) {
                                warn!("[{port}] Destroying {other} connection");
                            }
                            return Err(ProxyError::Relay { leg: peer, source: e });
                        }
                        teardown.on_ended(source);
                    }
                }
                Exit::Failed(leg, e) => {
                    match leg {
                        Leg::Client => error!(
                            "[{port}] Local client connection error from {client_addr}: {e}"
                        ),
                        Leg::Target => {
                            error!("[{port}] Target server connection error: {e}")
                        }
                    }
                    teardown.on_error(leg);
                    if let Some(peer) = teardown.destroyed() {
                        warn!("[{port}] Destroying {peer} connection");
                    }
                    // Returning drops the other direction mid-flight, which
                    // closes the destroyed leg without flushing.
                    return Err(ProxyError::Relay { leg, source: e });
                }
            }
        }

        Ok(())
    }
}
