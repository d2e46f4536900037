use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;

use super::{
    description::server::{average_round_trip_time, ServerDescription, TopologyVersion},
    topology::{SdamEventEmitter, TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
    ServerType,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::Result,
    event::sdam::{
        SdamEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, WorkerHandle, WorkerHandleListener},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The minimum amount of time a monitor sleeps between checks, which also bounds how often an
/// immediate check request is honored.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The id of the monitoring connection to a given server. Connection ids are unique within their
/// pool; the monitoring connection is not part of the pool and uses a reserved value.
const MONITORING_CONNECTION_ID: u32 = 0;

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: SdamEventEmitter,
    client_options: ClientOptions,

    /// Used to receive immediate check requests and to detect when the server has been removed
    /// from the topology.
    request_receiver: MonitorRequestReceiver,

    /// The most recent topology version returned by the server. When this is present and the
    /// server supports it, the monitor uses awaited (streaming) hello commands, which the server
    /// holds open until its state changes or `heartbeatFrequencyMS` passes.
    topology_version: Option<TopologyVersion>,

    /// Handle to the RTT monitor, which is started lazily once the monitor enters streaming
    /// mode. While streaming, the duration of each awaited hello no longer reflects the network
    /// round trip, so a separate task keeps the average up to date.
    rtt_monitor_started: bool,

    /// The moving average of this server's round trip time, shared with the RTT monitor.
    rtt: RttTracker,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: SdamEventEmitter,
        request_receiver: MonitorRequestReceiver,
        client_options: ClientOptions,
        connection_establisher: ConnectionEstablisher,
    ) {
        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            client_options,
            request_receiver,
            topology_version: None,
            rtt_monitor_started: false,
            rtt: RttTracker::default(),
        };

        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        let mut stop_listener = self.request_receiver.take_stop_listener();

        while self.topology_watcher.is_alive() {
            let check_completed = tokio::select! {
                changed = self.check_server() => {
                    let _ = changed;
                    true
                }
                _ = stop_listener.wait_for_all_handle_drops() => false,
            };

            if !check_completed || !self.topology_watcher.is_alive() {
                break;
            }

            // In streaming mode the server itself holds the hello until something changes, so
            // the monitor loops straight into the next check.
            if self.topology_version.is_some() && self.connection.is_some() {
                continue;
            }

            let wait = async {
                // Immediate check requests are honored no more often than once every
                // MIN_HEARTBEAT_FREQUENCY per server.
                let min_frequency = self
                    .client_options
                    .heartbeat_freq_test
                    .unwrap_or(MIN_HEARTBEAT_FREQUENCY);
                runtime::delay_for(min_frequency).await;
                self.request_receiver
                    .wait_for_check_request(heartbeat_frequency.saturating_sub(min_frequency))
                    .await;
            };

            tokio::select! {
                _ = wait => {}
                _ = stop_listener.wait_for_all_handle_drops() => break,
            }
        }
    }

    /// Checks the server, publishing any resulting change to the topology. On a network error,
    /// the server is immediately marked Unknown and a single retry is performed without sleeping
    /// to distinguish transient failures from persistent ones.
    async fn check_server(&mut self) -> bool {
        let mut retried = false;
        loop {
            match self.perform_hello().await {
                Ok(reply) => {
                    let average_rtt = self
                        .rtt
                        .average()
                        .unwrap_or_else(|| Duration::from_millis(0));
                    let description = ServerDescription::new_from_hello_reply(
                        self.address.clone(),
                        reply,
                        average_rtt,
                    );
                    self.topology_version = description.topology_version();
                    return self.topology_updater.update(description).await;
                }
                Err(e) => {
                    self.connection.take();
                    self.rtt.reset();
                    self.topology_version.take();

                    let previous_type = self
                        .topology_watcher
                        .server_type(&self.address)
                        .unwrap_or(ServerType::Unknown);

                    let changed = self
                        .topology_updater
                        .handle_monitor_error(self.address.clone(), e.clone())
                        .await;

                    if !retried && e.is_network_error() && previous_type != ServerType::Unknown {
                        retried = true;
                        continue;
                    }

                    return changed;
                }
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let (command, awaited) = match self.connection {
            Some(ref conn) => {
                let hello_ok = conn
                    .stream_description
                    .as_ref()
                    .map(|sd| sd.hello_ok)
                    .filter(|hello_ok| *hello_ok);

                let awaitable_options = self.topology_version.and_then(|topology_version| {
                    let supports_awaitable = conn
                        .stream_description
                        .as_ref()
                        .and_then(|sd| sd.max_wire_version)
                        .map(|v| v >= 9)
                        .unwrap_or(false);
                    supports_awaitable.then(|| AwaitableHelloOptions {
                        topology_version,
                        max_await_time: self
                            .client_options
                            .heartbeat_freq
                            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
                    })
                });

                let awaited = awaitable_options.is_some();
                (
                    hello_command(self.client_options.load_balanced, hello_ok, awaitable_options),
                    awaited,
                )
            }
            None => (
                // The initial handshake on a fresh monitoring connection is itself the hello.
                hello_command(self.client_options.load_balanced, None, None),
                false,
            ),
        };

        if awaited {
            self.ensure_rtt_monitor_started();
        }

        self.emit_event(SdamEvent::ServerHeartbeatStarted(
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
                driver_connection_id: MONITORING_CONNECTION_ID,
            },
        ))
        .await;

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let timeout = if awaited {
                    self.client_options
                        .heartbeat_freq
                        .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
                        + self
                            .client_options
                            .connect_timeout
                            .unwrap_or(crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT)
                } else {
                    self.client_options
                        .connect_timeout
                        .unwrap_or(crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT)
                };
                run_hello(conn, command, Some(start + timeout)).await
            }
            None => {
                self.connection_establisher
                    .establish_monitoring_connection(
                        self.address.clone(),
                        MONITORING_CONNECTION_ID,
                    )
                    .await
                    .map(|(connection, reply)| {
                        self.connection = Some(connection);
                        reply
                    })
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(reply) => {
                // Awaited replies are held open by the server, so their duration says nothing
                // about the network round trip; the RTT monitor provides samples instead.
                if !awaited {
                    self.rtt.add_sample(duration);
                }

                self.emit_event(SdamEvent::ServerHeartbeatSucceeded(
                    ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id: MONITORING_CONNECTION_ID,
                    },
                ))
                .await;

                Ok(reply)
            }
            Err(e) => {
                self.emit_event(SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                    duration,
                    failure: e.clone(),
                    server_address: self.address.clone(),
                    awaited,
                    driver_connection_id: MONITORING_CONNECTION_ID,
                }))
                .await;

                Err(e)
            }
        }
    }

    fn ensure_rtt_monitor_started(&mut self) {
        if self.rtt_monitor_started {
            return;
        }
        self.rtt_monitor_started = true;

        let rtt_monitor = RttMonitor {
            address: self.address.clone(),
            connection: None,
            connection_establisher: self.connection_establisher.clone(),
            topology_watcher: self.topology_watcher.clone(),
            client_options: self.client_options.clone(),
            rtt: self.rtt.clone(),
        };
        runtime::spawn(rtt_monitor.execute());
    }

    async fn emit_event(&self, event: SdamEvent) {
        self.event_emitter.emit(event).await;
    }
}

/// While the monitor's connection is blocked in an awaited hello, a separate task keeps the
/// round trip time estimate fresh by running plain hello commands on its own dedicated
/// connection.
struct RttMonitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_watcher: TopologyWatcher,
    client_options: ClientOptions,
    rtt: RttTracker,
}

impl RttMonitor {
    async fn execute(mut self) {
        let frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.topology_watcher.is_alive() {
            self.ping_server().await;
            runtime::delay_for(frequency).await;
        }
    }

    async fn ping_server(&mut self) {
        let start = Instant::now();
        let result: Result<()> = match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn
                    .stream_description
                    .as_ref()
                    .map(|sd| sd.hello_ok)
                    .filter(|hello_ok| *hello_ok);
                let command = hello_command(self.client_options.load_balanced, hello_ok, None);
                let timeout = self
                    .client_options
                    .connect_timeout
                    .unwrap_or(crate::runtime::stream::DEFAULT_CONNECT_TIMEOUT);
                run_hello(conn, command, Some(start + timeout)).await.map(|_| ())
            }
            None => self
                .connection_establisher
                .establish_monitoring_connection(self.address.clone(), MONITORING_CONNECTION_ID)
                .await
                .map(|(connection, _)| {
                    self.connection = Some(connection);
                }),
        };

        match result {
            Ok(()) => self.rtt.add_sample(start.elapsed()),
            Err(_) => {
                // The main monitor is responsible for reporting errors; the RTT task just
                // reconnects on its next pass.
                self.connection.take();
            }
        }
    }
}

/// The round trip time estimate for a single server, shared between the server's monitor and its
/// RTT task.
#[derive(Clone, Debug, Default)]
struct RttTracker {
    average: Arc<RwLock<Option<Duration>>>,
}

impl RttTracker {
    fn add_sample(&self, sample: Duration) {
        if let Ok(mut average) = self.average.write() {
            *average = Some(average_round_trip_time(*average, sample));
        }
    }

    fn average(&self) -> Option<Duration> {
        self.average.read().ok().and_then(|average| *average)
    }

    fn reset(&self) {
        if let Ok(mut average) = self.average.write() {
            average.take();
        }
    }
}

/// Handle held by the topology for each monitored server; used to request immediate checks and,
/// when dropped, to stop the monitor.
#[derive(Debug)]
pub(crate) struct MonitorManager {
    request_sender: mpsc::UnboundedSender<()>,
    _handle: WorkerHandle,
}

impl MonitorManager {
    /// Construct a manager and the receiver half given to the monitor itself. The receiver also
    /// listens for topology-wide check requests made through the given subscription.
    pub(crate) fn channel(
        topology_check_requests: TopologyCheckRequestReceiver,
    ) -> (MonitorManager, MonitorRequestReceiver) {
        let (request_sender, individual_requests) = mpsc::unbounded_channel();
        let (handle, stop_listener) = WorkerHandleListener::channel();

        (
            MonitorManager {
                request_sender,
                _handle: handle,
            },
            MonitorRequestReceiver {
                individual_requests,
                topology_check_requests,
                stop_listener: Some(stop_listener),
            },
        )
    }

    /// Ask the monitor to skip its current sleep and check the server now.
    pub(crate) fn request_immediate_check(&self) {
        let _: std::result::Result<_, _> = self.request_sender.send(());
    }
}

/// The monitor's half of the request channel.
#[derive(Debug)]
pub(crate) struct MonitorRequestReceiver {
    individual_requests: mpsc::UnboundedReceiver<()>,
    topology_check_requests: TopologyCheckRequestReceiver,
    stop_listener: Option<WorkerHandleListener>,
}

impl MonitorRequestReceiver {
    fn take_stop_listener(&mut self) -> WorkerHandleListener {
        // `execute` takes this exactly once at startup.
        self.stop_listener
            .take()
            .unwrap_or_else(|| WorkerHandleListener::channel().1)
    }

    /// Wait up to `timeout` for a check request, either for this server specifically or for the
    /// whole topology. Requests that accumulated before this call are treated as satisfied by
    /// the check that just completed.
    async fn wait_for_check_request(&mut self, timeout: Duration) {
        while self.individual_requests.try_recv().is_ok() {}

        let _: Result<_> = runtime::timeout(timeout, async {
            tokio::select! {
                _ = self.individual_requests.recv() => {}
                _ = self.topology_check_requests.wait_for_check_request() => {}
            }
        })
        .await;
    }
}
