//! Connection driver: owns the channel, the phase machine and both
//! registries. Every transition is serialized on this one task; transport
//! reads and connect attempts run on side tasks that feed commands back in.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strom_transport::{ConnectionId, NodeConnection, PackageReader, TcpConnector};
use strom_wire::proto::{self, NakAction};
use strom_wire::{Command, Package};

use crate::client::operations::{OperationRegistry, PackageDisposition};
use crate::client::ops::ClientOperation;
use crate::client::persistent::StartPersistent;
use crate::client::subscriptions::{StartSubscription, SubscriptionRegistry};
use crate::config::Settings;
use crate::discovery::{EndpointDiscoverer, discoverer_for};
use crate::error::{OperationError, SubscriptionDropReason};

const TICK: Duration = Duration::from_millis(200);

/// Connection lifecycle notifications delivered to listeners.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected(SocketAddr),
    Disconnected(SocketAddr),
    Reconnecting,
    AuthenticationFailed(String),
    Closed(String),
    ErrorOccurred(String),
}

pub(crate) enum DriverCommand {
    Connect,
    StartOperation(Box<dyn ClientOperation>),
    StartSubscription(StartSubscription),
    StartPersistent(StartPersistent),
    AckEvents {
        subscription_id: Uuid,
        event_ids: Vec<Uuid>,
    },
    NakEvents {
        subscription_id: Uuid,
        event_ids: Vec<Uuid>,
        action: NakAction,
        message: String,
    },
    Unsubscribe {
        subscription_id: Uuid,
    },
    TransportEstablished {
        attempt: u64,
        result: Result<NodeConnection, strom_transport::Error>,
    },
    PackageReceived {
        connection_id: ConnectionId,
        package: Package,
    },
    TransportClosed {
        connection_id: ConnectionId,
        error: Option<String>,
    },
    Close {
        done: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Init,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectingPhase {
    Invalid,
    Reconnecting,
    EndpointDiscovery,
    ConnectionEstablishing,
    Authentication,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatStage {
    Interval,
    Timeout,
}

struct HeartbeatInfo {
    last_package_count: u64,
    stage: HeartbeatStage,
    since: Instant,
}

struct Channel {
    id: ConnectionId,
    remote: SocketAddr,
    writer: strom_transport::PackageWriter,
    reader: tokio::task::JoinHandle<()>,
}

pub(crate) fn spawn_driver(
    settings: Settings,
    events: broadcast::Sender<ClientEvent>,
) -> mpsc::UnboundedSender<DriverCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = Driver::new(settings, events, tx.clone(), rx);
    tokio::spawn(driver.run());
    tx
}

struct Driver {
    settings: Settings,
    connector: Arc<TcpConnector>,
    discoverer: Box<dyn EndpointDiscoverer>,
    tx: mpsc::UnboundedSender<DriverCommand>,
    rx: mpsc::UnboundedReceiver<DriverCommand>,
    events: broadcast::Sender<ClientEvent>,
    state: ConnectionState,
    phase: ConnectingPhase,
    channel: Option<Channel>,
    connect_attempt: u64,
    reconnect_count: i32,
    reconnect_since: Instant,
    last_failed_endpoint: Option<SocketAddr>,
    auth_started: Option<Instant>,
    auth_correlation: Option<Uuid>,
    heartbeat: Option<HeartbeatInfo>,
    package_count: u64,
    last_timeout_sweep: Instant,
    operations: OperationRegistry,
    subscriptions: SubscriptionRegistry,
}

impl Driver {
    fn new(
        settings: Settings,
        events: broadcast::Sender<ClientEvent>,
        tx: mpsc::UnboundedSender<DriverCommand>,
        rx: mpsc::UnboundedReceiver<DriverCommand>,
    ) -> Self {
        let connector = Arc::new(TcpConnector::new(settings.transport.clone()));
        let discoverer = discoverer_for(&settings.nodes);
        let operations = OperationRegistry::new(&settings);
        let subscriptions = SubscriptionRegistry::new(&settings, tx.clone());
        Self {
            settings,
            connector,
            discoverer,
            tx,
            rx,
            events,
            state: ConnectionState::Init,
            phase: ConnectingPhase::Invalid,
            channel: None,
            connect_attempt: 0,
            reconnect_count: 0,
            reconnect_since: Instant::now(),
            last_failed_endpoint: None,
            auth_started: None,
            auth_correlation: None,
            heartbeat: None,
            package_count: 0,
            last_timeout_sweep: Instant::now(),
            operations,
            subscriptions,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.close("client dropped", None).await,
                },
                _ = tick.tick() => self.on_tick().await,
            }
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        debug!("driver task finished");
    }

    async fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Connect => self.start_connection().await,
            DriverCommand::StartOperation(mut operation) => {
                if self.state == ConnectionState::Closed {
                    operation.fail(OperationError::ConnectionClosed);
                    return;
                }
                self.operations.enqueue(operation);
                self.schedule_waiting().await;
            }
            DriverCommand::StartSubscription(request) => {
                if self.state == ConnectionState::Closed {
                    let _ = request.result.send(Err(OperationError::ConnectionClosed));
                    return;
                }
                self.subscriptions.enqueue_volatile(request);
                self.schedule_waiting().await;
            }
            DriverCommand::StartPersistent(request) => {
                if self.state == ConnectionState::Closed {
                    let _ = request.result.send(Err(OperationError::ConnectionClosed));
                    return;
                }
                self.subscriptions.enqueue_persistent(request);
                self.schedule_waiting().await;
            }
            DriverCommand::AckEvents {
                subscription_id,
                event_ids,
            } => {
                if let Some(package) = self.subscriptions.ack_package(subscription_id, event_ids) {
                    self.write_or_fault(package).await;
                }
            }
            DriverCommand::NakEvents {
                subscription_id,
                event_ids,
                action,
                message,
            } => {
                if let Some(package) =
                    self.subscriptions
                        .nak_package(subscription_id, event_ids, action, message)
                {
                    self.write_or_fault(package).await;
                }
            }
            DriverCommand::Unsubscribe { subscription_id } => {
                if let Some(package) = self.subscriptions.unsubscribe(subscription_id) {
                    self.write_or_fault(package).await;
                }
            }
            DriverCommand::TransportEstablished { attempt, result } => {
                self.on_transport_established(attempt, result).await;
            }
            DriverCommand::PackageReceived {
                connection_id,
                package,
            } => {
                self.on_package(connection_id, package).await;
            }
            DriverCommand::TransportClosed {
                connection_id,
                error,
            } => {
                self.on_transport_closed(connection_id, error).await;
            }
            DriverCommand::Close { done } => self.close("close requested", done).await,
        }
    }

    async fn start_connection(&mut self) {
        match self.state {
            ConnectionState::Init => {
                self.state = ConnectionState::Connecting;
                self.discover(None).await;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("connect ignored, connection already started");
            }
            ConnectionState::Closed => warn!("connect ignored, client is closed"),
        }
    }

    async fn discover(&mut self, failed: Option<SocketAddr>) {
        self.phase = ConnectingPhase::EndpointDiscovery;
        match self.discoverer.discover(failed) {
            Ok(endpoint) => self.establish(endpoint.address),
            Err(err) => {
                warn!(error = %err, "endpoint discovery failed");
                let _ = self
                    .events
                    .send(ClientEvent::ErrorOccurred(err.to_string()));
                self.go_reconnecting().await;
            }
        }
    }

    fn establish(&mut self, address: SocketAddr) {
        self.phase = ConnectingPhase::ConnectionEstablishing;
        self.connect_attempt += 1;
        self.last_failed_endpoint = Some(address);
        let attempt = self.connect_attempt;
        debug!(%address, attempt, "establishing channel");
        let connector = Arc::clone(&self.connector);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(address).await;
            let _ = tx.send(DriverCommand::TransportEstablished { attempt, result });
        });
    }

    async fn on_transport_established(
        &mut self,
        attempt: u64,
        result: Result<NodeConnection, strom_transport::Error>,
    ) {
        let current = self.state == ConnectionState::Connecting
            && self.phase == ConnectingPhase::ConnectionEstablishing
            && attempt == self.connect_attempt;
        if !current {
            debug!(attempt, "ignoring stale connect attempt");
            return;
        }
        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = %err, "channel establish failed");
                self.go_reconnecting().await;
                return;
            }
        };
        let (info, reader, writer) = connection.split();
        let reader_task = tokio::spawn(run_reader(reader, info.id, self.tx.clone()));
        self.channel = Some(Channel {
            id: info.id,
            remote: info.peer_addr,
            writer,
            reader: reader_task,
        });
        self.package_count = 0;
        self.heartbeat = Some(HeartbeatInfo {
            last_package_count: 0,
            stage: HeartbeatStage::Interval,
            since: Instant::now(),
        });

        if let Some(credentials) = self.settings.default_credentials.clone() {
            self.phase = ConnectingPhase::Authentication;
            self.auth_started = Some(Instant::now());
            let correlation_id = Uuid::new_v4();
            self.auth_correlation = Some(correlation_id);
            debug!("authenticating channel");
            let package = Package::new(Command::Authenticate, correlation_id)
                .with_credentials(Some(credentials));
            self.write_or_fault(package).await;
        } else {
            self.go_connected().await;
        }
    }

    async fn go_connected(&mut self) {
        let Some(channel) = &self.channel else {
            return;
        };
        let remote = channel.remote;
        self.state = ConnectionState::Connected;
        self.phase = ConnectingPhase::Connected;
        self.reconnect_count = 0;
        self.auth_started = None;
        self.auth_correlation = None;
        info!(%remote, "client connected");
        // Re-establish subscriptions and resume dispatching before
        // announcing the connection.
        self.schedule_waiting().await;
        let _ = self.events.send(ClientEvent::Connected(remote));
    }

    fn teardown_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.reader.abort();
            let _ = self
                .events
                .send(ClientEvent::Disconnected(channel.remote));
        }
        self.heartbeat = None;
        self.auth_started = None;
        self.auth_correlation = None;
    }

    async fn go_reconnecting(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.teardown_channel();
        self.operations.on_disconnected();
        self.subscriptions.on_disconnected();
        self.state = ConnectionState::Connecting;
        self.phase = ConnectingPhase::Reconnecting;
        self.reconnect_since = Instant::now();
        self.reconnect_count += 1;
        if self.settings.max_reconnections >= 0
            && self.reconnect_count > self.settings.max_reconnections
        {
            self.close("reconnection limit reached", None).await;
            return;
        }
        metrics::counter!("strom_client_reconnect_attempts_total").increment(1);
        debug!(
            attempt = self.reconnect_count,
            delay = ?self.settings.reconnection_delay,
            "reconnecting"
        );
        let _ = self.events.send(ClientEvent::Reconnecting);
    }

    /// The server redirected us to another node: drop the channel right away
    /// and connect there, preserving both registries as they are.
    async fn reconnect_to(&mut self, address: SocketAddr) {
        info!(%address, "server redirected connection");
        self.teardown_channel();
        self.operations.on_disconnected();
        self.subscriptions.on_disconnected();
        self.state = ConnectionState::Connecting;
        self.establish(address);
    }

    async fn on_transport_closed(&mut self, connection_id: ConnectionId, error: Option<String>) {
        let Some(channel) = &self.channel else {
            return;
        };
        if channel.id != connection_id {
            return;
        }
        match &error {
            Some(error) => warn!(error = %error, "channel lost"),
            None => debug!("channel closed by server"),
        }
        self.go_reconnecting().await;
    }

    async fn on_package(&mut self, connection_id: ConnectionId, package: Package) {
        let Some(channel) = &self.channel else {
            return;
        };
        if channel.id != connection_id {
            return;
        }
        self.package_count += 1;

        match package.command {
            Command::HeartbeatRequest => {
                let response =
                    Package::new(Command::HeartbeatResponse, package.correlation_id);
                self.write_or_fault(response).await;
                return;
            }
            Command::HeartbeatResponse => return,
            _ => {}
        }

        if self.phase == ConnectingPhase::Authentication
            && Some(package.correlation_id) == self.auth_correlation
        {
            match package.command {
                Command::Authenticated => {
                    debug!("authentication succeeded");
                    self.go_connected().await;
                }
                Command::NotAuthenticated => {
                    let reason = proto::text_payload(&package.payload);
                    warn!(reason = %reason, "authentication rejected");
                    let _ = self
                        .events
                        .send(ClientEvent::AuthenticationFailed(reason.clone()));
                    self.close(&format!("not authenticated: {reason}"), None).await;
                }
                other => debug!(command = ?other, "unexpected package during authentication"),
            }
            return;
        }

        let command = package.command;
        let correlation_id = package.correlation_id;
        match self.operations.handle_package(package) {
            PackageDisposition::Handled => {
                self.schedule_waiting().await;
            }
            PackageDisposition::Reconnect(address) => {
                self.reconnect_to(address).await;
            }
            PackageDisposition::Unknown(package) => {
                if self.subscriptions.handle_package(package) {
                    self.schedule_waiting().await;
                } else {
                    metrics::counter!("strom_client_packages_discarded_total").increment(1);
                    debug!(
                        command = ?command,
                        correlation = %correlation_id,
                        "discarding package with unknown correlation id"
                    );
                }
            }
        }
    }

    async fn schedule_waiting(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let credentials = self.settings.default_credentials.clone();
        let result = match self.channel.as_mut() {
            Some(channel) => {
                self.subscriptions
                    .schedule_waiting(&mut channel.writer, &credentials)
                    .await
            }
            None => return,
        };
        if let Err(err) = result {
            warn!(error = %err, "subscription dispatch write failed");
            self.go_reconnecting().await;
            return;
        }
        let result = match self.channel.as_mut() {
            Some(channel) => {
                self.operations
                    .schedule_waiting(&mut channel.writer, &credentials)
                    .await
            }
            None => return,
        };
        if let Err(err) = result {
            warn!(error = %err, "operation dispatch write failed");
            self.go_reconnecting().await;
        }
    }

    async fn write_or_fault(&mut self, package: Package) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if let Err(err) = channel.writer.write_package(&package).await {
            warn!(error = %err, "channel write failed");
            self.go_reconnecting().await;
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state {
            ConnectionState::Connecting => {
                if self.phase == ConnectingPhase::Reconnecting
                    && now.duration_since(self.reconnect_since) >= self.settings.reconnection_delay
                {
                    debug!("reconnection delay elapsed");
                    self.discover(self.last_failed_endpoint).await;
                }
                if self.phase == ConnectingPhase::Authentication
                    && let Some(started) = self.auth_started
                    && now.duration_since(started) > self.settings.operation_timeout
                {
                    warn!("authentication timed out, proceeding unauthenticated");
                    self.go_connected().await;
                }
            }
            ConnectionState::Connected => {
                self.manage_heartbeat(now).await;
                if now.duration_since(self.last_timeout_sweep)
                    >= self.settings.operation_timeout_check_interval
                {
                    self.last_timeout_sweep = now;
                    self.operations.check_timeouts(now);
                    self.subscriptions.check_timeouts(now);
                    self.schedule_waiting().await;
                }
            }
            ConnectionState::Init | ConnectionState::Closed => {}
        }
    }

    /// Staged idle detection: any received package resets the stage; an idle
    /// interval sends a heartbeat request; a silent timeout faults the
    /// channel.
    async fn manage_heartbeat(&mut self, now: Instant) {
        enum Action {
            Nothing,
            SendRequest,
            Fault,
        }
        let action = match self.heartbeat.as_mut() {
            None => Action::Nothing,
            Some(heartbeat) => {
                if heartbeat.last_package_count != self.package_count {
                    heartbeat.last_package_count = self.package_count;
                    heartbeat.stage = HeartbeatStage::Interval;
                    heartbeat.since = now;
                    Action::Nothing
                } else {
                    match heartbeat.stage {
                        HeartbeatStage::Interval
                            if now.duration_since(heartbeat.since)
                                >= self.settings.heartbeat_interval =>
                        {
                            heartbeat.stage = HeartbeatStage::Timeout;
                            heartbeat.since = now;
                            Action::SendRequest
                        }
                        HeartbeatStage::Timeout
                            if now.duration_since(heartbeat.since)
                                >= self.settings.heartbeat_timeout =>
                        {
                            Action::Fault
                        }
                        _ => Action::Nothing,
                    }
                }
            }
        };
        match action {
            Action::Nothing => {}
            Action::SendRequest => {
                let package = Package::new(Command::HeartbeatRequest, Uuid::new_v4());
                self.write_or_fault(package).await;
            }
            Action::Fault => {
                warn!("heartbeat timed out, faulting channel");
                metrics::counter!("strom_client_heartbeat_timeouts_total").increment(1);
                self.go_reconnecting().await;
            }
        }
    }

    async fn close(&mut self, reason: &str, done: Option<oneshot::Sender<()>>) {
        if self.state != ConnectionState::Closed {
            info!(reason, "closing client");
            self.teardown_channel();
            self.state = ConnectionState::Closed;
            self.phase = ConnectingPhase::Invalid;
            self.operations.fail_all();
            self.subscriptions
                .drop_all(SubscriptionDropReason::ConnectionClosed);
            let _ = self.events.send(ClientEvent::Closed(reason.to_string()));
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

async fn run_reader(
    mut reader: PackageReader,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<DriverCommand>,
) {
    loop {
        match reader.read_package().await {
            Ok(Some(package)) => {
                if tx
                    .send(DriverCommand::PackageReceived {
                        connection_id,
                        package,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(DriverCommand::TransportClosed {
                    connection_id,
                    error: None,
                });
                return;
            }
            Err(err) => {
                let _ = tx.send(DriverCommand::TransportClosed {
                    connection_id,
                    error: Some(err.to_string()),
                });
                return;
            }
        }
    }
}
