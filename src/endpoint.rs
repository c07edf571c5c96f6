use crate::config::{access, ClientConfig, ServerConfig, Settings};
use crate::connection::{ConnState, Connection, OutCommand, Role};
use crate::error::{ConnectError, Error, FailStatus};
use crate::handler::Handler;
use crate::handshake::{self, ServerHandshake};
use crate::read::{Processor, ReadDriver};
use crate::stream::{default_client_tls, WsStream};
use crate::uri::WsUri;
use crate::write::Writer;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use pki_types::ServerName;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

/// Endpoint lifecycle: IDLE until `listen`/`run`, RUNNING while the loop is
/// live, STOPPED once it exits. `reset` re-arms a stopped endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

/// State shared by both endpoint roles: the connection registry and the
/// run-loop bookkeeping.
struct EndpointCore {
    settings: Settings,
    registry: Mutex<HashMap<Uuid, Connection>>,
    state: AtomicU8,
    active: AtomicUsize,
    perpetual: AtomicBool,
    /// Notified whenever a connection finishes or perpetual mode ends.
    drained: Notify,
}

impl EndpointCore {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: Mutex::new(HashMap::new()),
            state: AtomicU8::new(EndpointState::Idle as u8),
            active: AtomicUsize::new(0),
            perpetual: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    fn state(&self) -> EndpointState {
        match self.state.load(Ordering::Acquire) {
            0 => EndpointState::Idle,
            1 => EndpointState::Running,
            _ => EndpointState::Stopped,
        }
    }

    fn set_state(&self, state: EndpointState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn register(&self, conn: &Connection) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.id(), conn.clone());
    }

    fn unregister(&self, id: Uuid) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.active.fetch_sub(1, Ordering::AcqRel);
        // notify_one keeps a permit around, so the runner cannot miss a
        // drain that lands between its check and its park.
        self.drained.notify_one();
    }

    fn connections(&self) -> Vec<Connection> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Block until no connections are outstanding; with `perpetual`, hold
    /// the loop open until `end_perpetual` releases it.
    async fn run(&self, perpetual: bool) {
        if perpetual {
            self.perpetual.store(true, Ordering::Release);
        }
        self.set_state(EndpointState::Running);
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::Acquire) == 0 && !self.perpetual.load(Ordering::Acquire)
            {
                break;
            }
            notified.await;
        }
        self.set_state(EndpointState::Stopped);
    }

    fn end_perpetual(&self) {
        self.perpetual.store(false, Ordering::Release);
        self.drained.notify_one();
    }

    fn reset(&self) -> Result<(), Error> {
        if self.state() != EndpointState::Stopped {
            return Err(Error::InvalidState);
        }
        self.set_state(EndpointState::Idle);
        Ok(())
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    // EMFILE / ENFILE
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

/// Record a pre-open failure and route it to `on_fail`.
fn fail_connection(conn: &Connection, handler: &dyn Handler, status: FailStatus, err: &Error) {
    {
        let mut close_state = conn.lock_close_state();
        close_state.fail_status = status;
        close_state.was_clean = false;
    }
    conn.set_state(ConnState::Closed);
    handler.on_fail(conn, err);
}

/// WebSocket server endpoint: owns the listener loop and every accepted
/// connection.
pub struct Server {
    core: Arc<EndpointCore>,
    handler: Arc<dyn Handler>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, Error> {
        config.settings.validate()?;
        Ok(Self {
            core: Arc::new(EndpointCore::new(config.settings)),
            handler,
            tls: config.tls_config.map(TlsAcceptor::from),
        })
    }

    pub fn state(&self) -> EndpointState {
        self.core.state()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.core.connections()
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.core.reset()
    }

    /// Bind `addr` and accept until the listener fails fatally. Each
    /// accepted transport becomes a connection with its own driver task.
    pub async fn listen(&self, addr: &str) -> Result<(), Error> {
        if self.core.state() == EndpointState::Running {
            return Err(Error::InvalidState);
        }
        let listener = TcpListener::bind(addr).await?;
        self.core.set_state(EndpointState::Running);
        info!("listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((tcp, peer)) => {
                    if self.core.settings.access_enabled(access::CONNECT) {
                        info!("accepted connection from {}", peer);
                    }
                    let core = Arc::clone(&self.core);
                    let handler = Arc::clone(&self.handler);
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        accept_connection(core, handler, tls, tcp).await;
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_fd_exhaustion(&err) => {
                    warn!(
                        "accept failed ({}), retrying in {:?}",
                        err, self.core.settings.accept_retry_delay
                    );
                    tokio::time::sleep(self.core.settings.accept_retry_delay).await;
                }
                Err(err) => {
                    // The io loop is shutting down; exit quietly.
                    debug!("accept loop exiting: {}", err);
                    break;
                }
            }
        }

        self.core.set_state(EndpointState::Stopped);
        Ok(())
    }

    /// Blocking entry point: builds a runtime with `pool_threads` workers
    /// and runs `listen` on it.
    pub fn listen_on(&self, addr: &str) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.core.settings.pool_threads)
            .enable_all()
            .build()?;
        runtime.block_on(self.listen(addr))
    }

    /// Ask every live connection to close.
    pub fn close_all(&self, code: crate::error::CloseCode, reason: &str) {
        for conn in self.core.connections() {
            let _ = conn.close(code, reason);
        }
    }
}

/// Server side of one accepted transport: optional TLS, handshake, then the
/// frame loop. Failures before OPEN route to `on_fail`.
async fn accept_connection(
    core: Arc<EndpointCore>,
    handler: Arc<dyn Handler>,
    tls: Option<TlsAcceptor>,
    tcp: TcpStream,
) {
    let settings = core.settings.clone();
    let (out_tx, out_rx) = unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let conn = Connection::new(Role::Server, settings.clone(), out_tx, Arc::clone(&buffered));
    core.register(&conn);

    let secure = tls.is_some();
    let mut stream = match tls {
        Some(acceptor) => {
            match WsStream::accept_tls(tcp, &acceptor, settings.tls_handshake_timeout).await {
                Ok(stream) => stream,
                Err(err) => {
                    let status = match &err {
                        Error::Timeout { .. } => FailStatus::TimeoutTls,
                        _ => FailStatus::System,
                    };
                    fail_connection(&conn, handler.as_ref(), status, &err);
                    core.unregister(conn.id());
                    return;
                }
            }
        }
        None => WsStream::Plain(tcp),
    };

    let mut buf = BytesMut::with_capacity(4096);
    let negotiated = timeout(
        settings.handshake_timeout,
        handshake::server_handshake(
            &mut stream,
            &mut buf,
            &settings,
            secure,
            handler.as_ref(),
            &conn,
        ),
    )
    .await;

    match negotiated {
        Ok(Ok(ServerHandshake::WebSocket(details))) => {
            if settings.access_enabled(access::HANDSHAKE) {
                info!("connection {} upgraded: {}", conn.id(), details.uri);
            }
            let version = details.version;
            conn.set_details(details);
            let processor =
                Processor::for_version(version, settings.max_message_size, settings.strict_masking);
            let (read_half, write_half) = tokio::io::split(stream);
            let writer = tokio::spawn(Writer::new(write_half, out_rx, buffered).run());
            ReadDriver::new(read_half, buf, processor, conn.clone(), handler, writer)
                .run()
                .await;
        }
        Ok(Ok(ServerHandshake::Http)) => {
            debug!("connection {} served as plain http", conn.id());
            conn.set_state(ConnState::Closed);
        }
        Ok(Err(err)) => {
            if settings.error_enabled(log::Level::Warn) {
                warn!("connection {} handshake failed: {}", conn.id(), err);
            }
            fail_connection(&conn, handler.as_ref(), FailStatus::Unknown, &err);
        }
        Err(elapsed) => {
            let err = Error::from(elapsed);
            fail_connection(&conn, handler.as_ref(), FailStatus::TimeoutWs, &err);
        }
    }

    core.unregister(conn.id());
}

/// A connection created by `get_connection` but not yet dialed.
pub struct PendingConnection {
    conn: Connection,
    uri: WsUri,
    out_rx: UnboundedReceiver<OutCommand>,
    buffered: Arc<AtomicUsize>,
}

impl PendingConnection {
    pub fn handle(&self) -> Connection {
        self.conn.clone()
    }

    pub fn uri(&self) -> &WsUri {
        &self.uri
    }
}

/// WebSocket client endpoint: dials outbound URIs and drives the resulting
/// connections.
pub struct Client {
    core: Arc<EndpointCore>,
    handler: Arc<dyn Handler>,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig, handler: Arc<dyn Handler>) -> Result<Self, Error> {
        config.settings.validate()?;
        Ok(Self {
            core: Arc::new(EndpointCore::new(config.settings.clone())),
            handler,
            config,
        })
    }

    pub fn state(&self) -> EndpointState {
        self.core.state()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Construct a connection bound to `uri`. A `wss` target requires this
    /// endpoint to carry a TLS config.
    pub fn get_connection(&self, uri: &str) -> Result<PendingConnection, Error> {
        let uri = WsUri::parse(uri)?;
        if uri.secure && self.config.tls_config.is_none() {
            return Err(Error::EndpointUnsecure);
        }
        let (out_tx, out_rx) = unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let conn = Connection::new(
            Role::Client,
            self.config.settings.clone(),
            out_tx,
            Arc::clone(&buffered),
        );
        self.core.register(&conn);
        Ok(PendingConnection {
            conn,
            uri,
            out_rx,
            buffered,
        })
    }

    /// Dial the transport, run the handshake, and spawn the connection
    /// driver. Connect failures are classified and routed to `on_fail`.
    pub async fn connect(&self, pending: PendingConnection) -> Result<Connection, Error> {
        let PendingConnection {
            conn,
            uri,
            out_rx,
            buffered,
        } = pending;
        let settings = self.config.settings.clone();

        let result = self.dial_and_upgrade(&conn, &uri).await;
        let (stream, buf) = match result {
            Ok(parts) => parts,
            Err((err, status)) => {
                fail_connection(&conn, self.handler.as_ref(), status, &err);
                self.core.unregister(conn.id());
                return Err(err);
            }
        };

        let processor = Processor::for_version(
            conn.version().unwrap_or(crate::handshake::Version::Hybi13),
            settings.max_message_size,
            settings.strict_masking,
        );
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(Writer::new(write_half, out_rx, buffered).run());
        let driver = ReadDriver::new(
            read_half,
            buf,
            processor,
            conn.clone(),
            Arc::clone(&self.handler),
            writer,
        );

        let core = Arc::clone(&self.core);
        let id = conn.id();
        tokio::spawn(async move {
            driver.run().await;
            core.unregister(id);
        });

        Ok(conn)
    }

    async fn dial_and_upgrade(
        &self,
        conn: &Connection,
        uri: &WsUri,
    ) -> Result<(WsStream, BytesMut), (Error, FailStatus)> {
        let settings = &self.config.settings;
        let tcp = TcpStream::connect(uri.authority()).await.map_err(|err| {
            error!(
                "connect to {} failed: {:?} ({})",
                uri,
                ConnectError::classify(&err),
                err
            );
            (Error::from(err), FailStatus::System)
        })?;

        let mut stream = if uri.secure {
            let tls_config = self
                .config
                .tls_config
                .clone()
                .unwrap_or_else(default_client_tls);
            let connector = TlsConnector::from(tls_config);
            let domain = ServerName::try_from(uri.host.clone())
                .map_err(|err| (Error::from(err), FailStatus::Unknown))?;
            WsStream::connect_tls(tcp, &connector, domain, settings.tls_handshake_timeout)
                .await
                .map_err(|err| {
                    let status = match &err {
                        Error::Timeout { .. } => FailStatus::TimeoutTls,
                        _ => FailStatus::System,
                    };
                    (err, status)
                })?
        } else {
            WsStream::Plain(tcp)
        };

        let mut buf = BytesMut::with_capacity(4096);
        let negotiated = timeout(
            settings.handshake_timeout,
            handshake::client_handshake(&mut stream, &mut buf, uri, &self.config),
        )
        .await;
        let details = match negotiated {
            Ok(Ok(details)) => details,
            Ok(Err(err)) => return Err((err, FailStatus::Unknown)),
            Err(elapsed) => return Err((Error::from(elapsed), FailStatus::TimeoutWs)),
        };
        conn.set_details(details);
        Ok((stream, buf))
    }

    /// Drive the endpoint until its work is done. With `perpetual`, the
    /// call holds the loop open even when no connections are outstanding,
    /// until `end_perpetual`.
    pub async fn run(&self, perpetual: bool) {
        self.core.run(perpetual).await;
    }

    /// Blocking entry point: builds a runtime with `pool_threads` workers
    /// and runs the endpoint on it.
    pub fn run_on(&self, perpetual: bool) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.settings.pool_threads)
            .enable_all()
            .build()?;
        runtime.block_on(self.run(perpetual));
        Ok(())
    }

    /// Release the idle-work hold taken by `run(true)`.
    pub fn end_perpetual(&self) {
        self.core.end_perpetual();
    }

    /// Re-arm a stopped endpoint. Fails with `InvalidState` unless the
    /// endpoint is STOPPED.
    pub fn reset(&self) -> Result<(), Error> {
        self.core.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NullHandler;

    #[test]
    fn endpoint_lifecycle_states() {
        let core = EndpointCore::new(Settings::default());
        assert_eq!(core.state(), EndpointState::Idle);
        assert!(core.reset().is_err());

        core.set_state(EndpointState::Stopped);
        core.reset().unwrap();
        assert_eq!(core.state(), EndpointState::Idle);
    }

    #[tokio::test]
    async fn run_exits_when_drained() {
        let core = Arc::new(EndpointCore::new(Settings::default()));
        // No connections and not perpetual: returns immediately.
        core.run(false).await;
        assert_eq!(core.state(), EndpointState::Stopped);
    }

    #[tokio::test]
    async fn perpetual_run_holds_until_released() {
        let core = Arc::new(EndpointCore::new(Settings::default()));
        let runner = {
            let core = Arc::clone(&core);
            tokio::spawn(async move { core.run(true).await })
        };
        tokio::task::yield_now().await;
        assert!(!runner.is_finished());

        core.end_perpetual();
        runner.await.unwrap();
        assert_eq!(core.state(), EndpointState::Stopped);
    }

    #[test]
    fn wss_requires_tls_capable_endpoint() {
        let client = Client::new(ClientConfig::default(), Arc::new(NullHandler)).unwrap();
        assert!(matches!(
            client.get_connection("wss://example.com/"),
            Err(Error::EndpointUnsecure)
        ));
        assert!(client.get_connection("ws://example.com/").is_ok());
    }

    #[test]
    fn fd_exhaustion_detection() {
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(24)));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(23)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(104)));
    }
}
