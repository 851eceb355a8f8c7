//! Outstanding-request registry: a waiting FIFO feeding a bounded active map,
//! with timeout sweeps, retries and reconnect-survival.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use strom_transport::PackageWriter;
use strom_wire::{Credentials, Package};

use crate::client::ops::{ClientOperation, Inspection};
use crate::config::Settings;
use crate::error::OperationError;

pub(crate) struct OperationItem {
    operation: Box<dyn ClientOperation>,
    correlation_id: Uuid,
    last_updated: Instant,
    retry_count: i32,
}

/// What became of an incoming package offered to the registry.
pub(crate) enum PackageDisposition {
    /// Not one of ours; hand it to the subscription registry.
    Unknown(Package),
    Handled,
    /// The operation asked for a reconnect to this endpoint; it is back in
    /// the waiting queue.
    Reconnect(SocketAddr),
}

pub(crate) struct OperationRegistry {
    waiting: VecDeque<OperationItem>,
    active: HashMap<Uuid, OperationItem>,
    max_queue_size: usize,
    max_concurrent: usize,
    max_retries: i32,
    operation_timeout: Duration,
    fail_on_no_server_response: bool,
}

impl OperationRegistry {
    pub(crate) fn new(settings: &Settings) -> Self {
        Self {
            waiting: VecDeque::new(),
            active: HashMap::new(),
            max_queue_size: settings.max_operation_queue_size,
            max_concurrent: settings.max_concurrent_operations,
            max_retries: settings.max_operation_retries,
            operation_timeout: settings.operation_timeout,
            fail_on_no_server_response: settings.fail_on_no_server_response,
        }
    }

    /// Admit an operation to the waiting queue, failing it immediately when
    /// the queue bound is hit.
    pub(crate) fn enqueue(&mut self, mut operation: Box<dyn ClientOperation>) {
        if self.waiting.len() >= self.max_queue_size {
            metrics::counter!("strom_client_operation_queue_overflow_total").increment(1);
            operation.fail(OperationError::OperationQueueOverflow {
                max: self.max_queue_size,
            });
            return;
        }
        self.waiting.push_back(OperationItem {
            operation,
            correlation_id: Uuid::new_v4(),
            last_updated: Instant::now(),
            retry_count: 0,
        });
    }

    /// Dispatch waiting operations while the concurrency bound allows. Each
    /// dispatch assigns a fresh correlation id. A transport write failure puts
    /// the head operation back and bubbles up so the driver can fault the
    /// channel.
    pub(crate) async fn schedule_waiting(
        &mut self,
        writer: &mut PackageWriter,
        default_credentials: &Option<Credentials>,
    ) -> Result<(), strom_transport::Error> {
        while self.active.len() < self.max_concurrent {
            let Some(mut item) = self.waiting.pop_front() else {
                break;
            };
            item.correlation_id = Uuid::new_v4();
            let credentials = item
                .operation
                .credentials()
                .or_else(|| default_credentials.clone());
            let package = match item.operation.request(item.correlation_id) {
                Ok(package) => package.with_credentials(credentials),
                Err(err) => {
                    item.operation.fail(err.into());
                    continue;
                }
            };
            if let Err(err) = writer.write_package(&package).await {
                self.waiting.push_front(item);
                return Err(err);
            }
            debug!(
                operation = item.operation.name(),
                correlation = %item.correlation_id,
                attempt = item.retry_count + 1,
                "operation dispatched"
            );
            item.last_updated = Instant::now();
            self.active.insert(item.correlation_id, item);
        }
        Ok(())
    }

    pub(crate) fn handle_package(&mut self, package: Package) -> PackageDisposition {
        let Some(mut item) = self.active.remove(&package.correlation_id) else {
            return PackageDisposition::Unknown(package);
        };
        match item.operation.inspect(package) {
            Inspection::Completed => {
                debug!(operation = item.operation.name(), "operation completed");
                PackageDisposition::Handled
            }
            Inspection::Continue => {
                item.last_updated = Instant::now();
                self.active.insert(item.correlation_id, item);
                PackageDisposition::Handled
            }
            Inspection::Retry(reason) => {
                self.retry(item, reason);
                PackageDisposition::Handled
            }
            Inspection::Reconnect(address) => {
                // Back to waiting with the retry count untouched; the request
                // was never refused on its merits.
                self.waiting.push_back(item);
                PackageDisposition::Reconnect(address)
            }
            Inspection::Fail(error) => {
                item.operation.fail(error);
                PackageDisposition::Handled
            }
        }
    }

    fn retry(&mut self, mut item: OperationItem, reason: &'static str) {
        item.retry_count += 1;
        if self.max_retries >= 0 && item.retry_count > self.max_retries {
            warn!(
                operation = item.operation.name(),
                retries = item.retry_count - 1,
                reason,
                "operation exceeded retry limit"
            );
            let name = item.operation.name();
            item.operation.fail(OperationError::RetryLimitReached {
                operation: name,
                retries: self.max_retries,
            });
            return;
        }
        metrics::counter!("strom_client_operation_retries_total").increment(1);
        debug!(
            operation = item.operation.name(),
            retry = item.retry_count,
            reason,
            "operation scheduled for retry"
        );
        self.waiting.push_back(item);
    }

    /// Periodic sweep over active entries; stale ones either fail or retry
    /// depending on `failOnNoServerResponse`.
    pub(crate) fn check_timeouts(&mut self, now: Instant) {
        let stale: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| now.duration_since(item.last_updated) > self.operation_timeout)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in stale {
            let Some(mut item) = self.active.remove(&correlation_id) else {
                continue;
            };
            if self.fail_on_no_server_response {
                let name = item.operation.name();
                item.operation
                    .fail(OperationError::OperationTimedOut { operation: name });
            } else {
                self.retry(item, "operation timeout");
            }
        }
    }

    /// On channel loss, in-flight operations go back to waiting so they are
    /// re-sent after reconnect; their retry counts are preserved.
    pub(crate) fn on_disconnected(&mut self) {
        for (_, item) in self.active.drain() {
            self.waiting.push_back(item);
        }
    }

    pub(crate) fn fail_all(&mut self) {
        for (_, mut item) in self.active.drain() {
            item.operation.fail(OperationError::ConnectionClosed);
        }
        while let Some(mut item) = self.waiting.pop_front() {
            item.operation.fail(OperationError::ConnectionClosed);
        }
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use strom_transport::split_package_io;
    use strom_wire::Command;

    use crate::config::Settings;

    fn settings(max_queue: i64, max_concurrent: i64, max_retries: i64) -> Settings {
        Settings::builder()
            .single_node("127.0.0.1:1113".parse().unwrap())
            .max_operation_queue_size(max_queue)
            .max_concurrent_operations(max_concurrent)
            .max_operation_retries(max_retries)
            .build()
            .unwrap()
    }

    /// Scripted operation: yields the next scripted inspection per response
    /// and records terminal failures.
    struct ScriptedOperation {
        script: Vec<Inspection>,
        failures: Arc<Mutex<Vec<OperationError>>>,
    }

    impl ScriptedOperation {
        fn boxed(
            script: Vec<Inspection>,
            failures: &Arc<Mutex<Vec<OperationError>>>,
        ) -> Box<dyn ClientOperation> {
            Box::new(Self {
                script,
                failures: Arc::clone(failures),
            })
        }
    }

    impl ClientOperation for ScriptedOperation {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn credentials(&self) -> Option<Credentials> {
            None
        }

        fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
            Ok(Package::new(Command::Ping, correlation_id))
        }

        fn inspect(&mut self, _package: Package) -> Inspection {
            self.script.remove(0)
        }

        fn fail(&mut self, error: OperationError) {
            self.failures.lock().unwrap().push(error);
        }
    }

    // Keep the server end alive so writes land in the duplex buffer.
    fn writer() -> (PackageWriter, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_, writer) = split_package_io(Box::new(client));
        (writer, server)
    }

    fn response_for(registry: &OperationRegistry) -> Package {
        let correlation_id = *registry.active.keys().next().unwrap();
        Package::new(Command::Pong, correlation_id)
    }

    #[tokio::test]
    async fn queue_overflow_fails_the_enqueued_operation() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(1, 10, 10));
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            OperationError::OperationQueueOverflow { max: 1 }
        ));
    }

    #[tokio::test]
    async fn dispatch_respects_the_concurrency_bound() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(100, 2, 10));
        for _ in 0..5 {
            registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        }
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();
        assert_eq!(registry.active_len(), 2);
        assert_eq!(registry.waiting_len(), 3);
    }

    #[tokio::test]
    async fn continue_keeps_the_operation_active() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(10, 10, 10));
        registry.enqueue(ScriptedOperation::boxed(
            vec![Inspection::Continue, Inspection::Completed],
            &failures,
        ));
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();

        let package = response_for(&registry);
        assert!(matches!(
            registry.handle_package(package.clone()),
            PackageDisposition::Handled
        ));
        assert_eq!(registry.active_len(), 1);
        assert!(matches!(
            registry.handle_package(package),
            PackageDisposition::Handled
        ));
        assert_eq!(registry.active_len(), 0);
    }

    #[tokio::test]
    async fn retry_limit_fails_with_retry_limit_reached() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(10, 10, 1));
        registry.enqueue(ScriptedOperation::boxed(
            vec![
                Inspection::Retry("busy"),
                Inspection::Retry("busy"),
            ],
            &failures,
        ));
        let (mut writer, _server) = writer();

        // attempt 1 -> retry 1 -> attempt 2 -> retry limit
        registry.schedule_waiting(&mut writer, &None).await.unwrap();
        registry.handle_package(response_for(&registry));
        registry.schedule_waiting(&mut writer, &None).await.unwrap();
        registry.handle_package(response_for(&registry));

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            OperationError::RetryLimitReached { retries: 1, .. }
        ));
    }

    #[tokio::test]
    async fn reconnect_outcome_preserves_the_operation() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let redirect: SocketAddr = "10.0.0.9:1113".parse().unwrap();
        let mut registry = OperationRegistry::new(&settings(10, 10, 10));
        registry.enqueue(ScriptedOperation::boxed(
            vec![Inspection::Reconnect(redirect)],
            &failures,
        ));
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();

        match registry.handle_package(response_for(&registry)) {
            PackageDisposition::Reconnect(address) => assert_eq!(address, redirect),
            _ => panic!("expected reconnect disposition"),
        }
        assert_eq!(registry.waiting_len(), 1);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_response_is_unknown() {
        let mut registry = OperationRegistry::new(&settings(10, 10, 10));
        let package = Package::new(Command::Pong, Uuid::new_v4());
        assert!(matches!(
            registry.handle_package(package),
            PackageDisposition::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn timeout_retries_unless_fail_on_no_response() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(10, 10, 10));
        registry.operation_timeout = Duration::from_millis(0);
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();

        registry.check_timeouts(Instant::now() + Duration::from_millis(10));
        assert_eq!(registry.active_len(), 0);
        assert_eq!(registry.waiting_len(), 1);
        assert!(failures.lock().unwrap().is_empty());

        registry.fail_on_no_server_response = true;
        registry.schedule_waiting(&mut writer, &None).await.unwrap();
        registry.check_timeouts(Instant::now() + Duration::from_millis(10));
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            OperationError::OperationTimedOut { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_moves_active_back_to_waiting() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(10, 10, 10));
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();
        assert_eq!(registry.active_len(), 1);

        registry.on_disconnected();
        assert_eq!(registry.active_len(), 0);
        assert_eq!(registry.waiting_len(), 1);
        assert!(failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_all_resolves_everything_with_connection_closed() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new(&settings(10, 1, 10));
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        registry.enqueue(ScriptedOperation::boxed(vec![], &failures));
        let (mut writer, _server) = writer();
        registry.schedule_waiting(&mut writer, &None).await.unwrap();

        registry.fail_all();
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|error| matches!(error, OperationError::ConnectionClosed)));
    }
}
