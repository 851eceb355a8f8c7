// Client settings and their build-time validation.
use std::net::SocketAddr;
use std::time::Duration;

use strom_transport::{TlsMode, TransportSettings};
use strom_wire::Credentials;

use crate::error::BuildError;

pub(crate) const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1500);
pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(7);
pub(crate) const DEFAULT_OPERATION_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_OPERATION_QUEUE_SIZE: usize = 5000;
pub(crate) const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 5000;
pub(crate) const DEFAULT_MAX_OPERATION_RETRIES: i32 = 10;
pub(crate) const DEFAULT_MAX_RECONNECTIONS: i32 = 10;
pub(crate) const DEFAULT_PERSISTENT_SUBSCRIPTION_BUFFER_SIZE: i32 = 10;

/// Where the client finds nodes to talk to.
#[derive(Debug, Clone)]
pub enum NodeSettings {
    /// A single static endpoint.
    Single(SocketAddr),
    /// A fixed candidate list, tried round-robin.
    Cluster(Vec<SocketAddr>),
}

/// Client settings. Built through [`Settings::builder`]; defaults match the
/// documented configuration table.
#[derive(Debug, Clone)]
pub struct Settings {
    pub nodes: NodeSettings,
    pub transport: TransportSettings,
    pub reconnection_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub require_master: bool,
    pub default_credentials: Option<Credentials>,
    pub operation_timeout: Duration,
    pub operation_timeout_check_interval: Duration,
    pub max_operation_queue_size: usize,
    pub max_concurrent_operations: usize,
    /// -1 means unlimited.
    pub max_operation_retries: i32,
    /// -1 means unlimited.
    pub max_reconnections: i32,
    pub persistent_subscription_buffer_size: i32,
    pub persistent_subscription_auto_ack: bool,
    pub fail_on_no_server_response: bool,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SettingsBuilder {
    single_node: Option<SocketAddr>,
    cluster_nodes: Option<Vec<SocketAddr>>,
    connect_timeout: Option<Duration>,
    tls: Option<TlsMode>,
    reconnection_delay: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    require_master: Option<bool>,
    default_credentials: Option<Credentials>,
    operation_timeout: Option<Duration>,
    operation_timeout_check_interval: Option<Duration>,
    max_operation_queue_size: Option<i64>,
    max_concurrent_operations: Option<i64>,
    max_operation_retries: Option<i64>,
    max_reconnections: Option<i64>,
    persistent_subscription_buffer_size: Option<i64>,
    persistent_subscription_auto_ack: Option<bool>,
    fail_on_no_server_response: Option<bool>,
}

impl SettingsBuilder {
    pub fn single_node(mut self, address: SocketAddr) -> Self {
        self.single_node = Some(address);
        self
    }

    pub fn cluster_nodes(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.cluster_nodes = Some(addresses);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls = Some(mode);
        self
    }

    pub fn reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = Some(delay);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn require_master(mut self, require_master: bool) -> Self {
        self.require_master = Some(require_master);
        self
    }

    pub fn user_credentials(
        mut self,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.default_credentials = Some(Credentials::new(login, password));
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn operation_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.operation_timeout_check_interval = Some(interval);
        self
    }

    pub fn max_operation_queue_size(mut self, size: i64) -> Self {
        self.max_operation_queue_size = Some(size);
        self
    }

    pub fn max_concurrent_operations(mut self, count: i64) -> Self {
        self.max_concurrent_operations = Some(count);
        self
    }

    /// Use -1 for unlimited.
    pub fn max_operation_retries(mut self, retries: i64) -> Self {
        self.max_operation_retries = Some(retries);
        self
    }

    /// Use -1 for unlimited.
    pub fn max_reconnections(mut self, reconnections: i64) -> Self {
        self.max_reconnections = Some(reconnections);
        self
    }

    pub fn persistent_subscription_buffer_size(mut self, size: i64) -> Self {
        self.persistent_subscription_buffer_size = Some(size);
        self
    }

    pub fn persistent_subscription_auto_ack(mut self, enabled: bool) -> Self {
        self.persistent_subscription_auto_ack = Some(enabled);
        self
    }

    pub fn fail_on_no_server_response(mut self, fail: bool) -> Self {
        self.fail_on_no_server_response = Some(fail);
        self
    }

    pub fn build(self) -> Result<Settings, BuildError> {
        let nodes = match (self.single_node, self.cluster_nodes) {
            (Some(_), Some(_)) => return Err(BuildError::ConflictingNodeSettings),
            (Some(address), None) => NodeSettings::Single(address),
            (None, Some(addresses)) => {
                if addresses.is_empty() {
                    return Err(BuildError::MissingNodeSettings);
                }
                NodeSettings::Cluster(addresses)
            }
            (None, None) => return Err(BuildError::MissingNodeSettings),
        };

        let max_operation_queue_size = positive(
            "maxOperationQueueSize",
            self.max_operation_queue_size,
            DEFAULT_MAX_OPERATION_QUEUE_SIZE as i64,
        )? as usize;
        let max_concurrent_operations = positive(
            "maxConcurrentOperations",
            self.max_concurrent_operations,
            DEFAULT_MAX_CONCURRENT_OPERATIONS as i64,
        )? as usize;
        let persistent_subscription_buffer_size = positive(
            "persistentSubscriptionBufferSize",
            self.persistent_subscription_buffer_size,
            DEFAULT_PERSISTENT_SUBSCRIPTION_BUFFER_SIZE as i64,
        )? as i32;
        let max_operation_retries = unlimited_or_positive(
            "maxOperationRetries",
            self.max_operation_retries,
            DEFAULT_MAX_OPERATION_RETRIES as i64,
        )?;
        let max_reconnections = unlimited_or_positive(
            "maxReconnections",
            self.max_reconnections,
            DEFAULT_MAX_RECONNECTIONS as i64,
        )?;

        let mut transport = TransportSettings::default();
        if let Some(timeout) = self.connect_timeout {
            transport.connect_timeout = timeout;
        }
        transport.tls = self.tls;

        Ok(Settings {
            nodes,
            transport,
            reconnection_delay: self.reconnection_delay.unwrap_or(DEFAULT_RECONNECTION_DELAY),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT),
            require_master: self.require_master.unwrap_or(true),
            default_credentials: self.default_credentials,
            operation_timeout: self.operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT),
            operation_timeout_check_interval: self
                .operation_timeout_check_interval
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_CHECK_INTERVAL),
            max_operation_queue_size,
            max_concurrent_operations,
            max_operation_retries,
            max_reconnections,
            persistent_subscription_buffer_size,
            persistent_subscription_auto_ack: self.persistent_subscription_auto_ack.unwrap_or(true),
            fail_on_no_server_response: self.fail_on_no_server_response.unwrap_or(false),
        })
    }
}

fn positive(name: &'static str, value: Option<i64>, default: i64) -> Result<i64, BuildError> {
    let value = value.unwrap_or(default);
    if value <= 0 {
        return Err(BuildError::NotPositive { name });
    }
    Ok(value)
}

fn unlimited_or_positive(
    name: &'static str,
    value: Option<i64>,
    default: i64,
) -> Result<i32, BuildError> {
    let value = value.unwrap_or(default);
    if value < -1 || value > i32::MAX as i64 {
        return Err(BuildError::OutOfRange { name, value });
    }
    Ok(value as i32)
}
