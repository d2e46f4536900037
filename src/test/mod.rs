//! Test utilities: an in-process server good enough for the wire traffic the driver core
//! generates, plus event-collection helpers.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Document};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    cmap::conn::wire::Message,
    event::{
        cmap::CmapEvent,
        command::CommandEvent,
        sdam::SdamEvent,
        MonitoringRegistry,
    },
    hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    options::ServerAddress,
};

/// A hello reply body for a healthy standalone server.
pub(crate) fn standalone_hello() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "minWireVersion": 0,
        "maxWireVersion": 17,
        "logicalSessionTimeoutMinutes": 30,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48_000_000,
        "maxWriteBatchSize": 100_000,
    }
}

/// A hello reply body for a replica set member.
pub(crate) fn replica_set_hello(
    set_name: &str,
    primary: bool,
    hosts: &[&ServerAddress],
) -> Document {
    let mut hello = standalone_hello();
    hello.insert("setName", set_name);
    hello.insert(
        "hosts",
        hosts.iter().map(|h| h.to_string()).collect::<Vec<String>>(),
    );
    if primary {
        hello.insert("isWritablePrimary", true);
    } else {
        hello.insert("isWritablePrimary", false);
        hello.insert("secondary", true);
    }
    hello
}

#[derive(Default)]
struct MockServerState {
    /// The current reply to hello / legacy hello commands.
    hello: Document,

    /// Scripted replies, popped in order per command name. When empty, `{ok: 1}` is returned.
    replies: HashMap<String, VecDeque<Document>>,

    /// Every non-hello command body received, in order.
    received: Vec<Document>,
}

/// An in-process TCP server that speaks just enough OP_MSG to serve as a deployment member in
/// tests: it answers hello commands with a configurable reply and other commands from a
/// scripted queue.
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<Mutex<MockServerState>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl MockServer {
    pub(crate) async fn start(hello: Document) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let local_addr: SocketAddr = listener.local_addr().expect("mock server has no address");
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(local_addr.port()),
        };

        let state = Arc::new(Mutex::new(MockServerState {
            hello,
            ..Default::default()
        }));
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(accepted) => accepted,
                            Err(_) => break,
                        };
                        let connection_state = accept_state.clone();
                        let connection_shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = serve_connection(stream, connection_state) => {}
                                _ = connection_shutdown.notified() => {}
                            }
                        });
                    }
                    _ = accept_shutdown.notified() => break,
                }
            }
        });

        MockServer {
            address,
            state,
            shutdown,
        }
    }

    pub(crate) fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    /// Replaces the hello reply served to subsequent checks.
    pub(crate) fn set_hello(&self, hello: Document) {
        self.state.lock().unwrap().hello = hello;
    }

    /// Queues a one-shot reply for the given command name.
    pub(crate) fn enqueue_reply(&self, command_name: &str, reply: Document) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(command_name.to_string())
            .or_default()
            .push_back(reply);
    }

    /// All non-hello command bodies received so far.
    pub(crate) fn received(&self) -> Vec<Document> {
        self.state.lock().unwrap().received.clone()
    }

    /// Stops accepting connections and severs the established ones, simulating a server that
    /// went away.
    pub(crate) fn stop(&self) {
        self.shutdown.notify_waiters();
        // Wake any future waiters too.
        self.shutdown.notify_one();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<MockServerState>>) {
    loop {
        let request = match Message::read_from(&mut stream, None).await {
            Ok(request) => request,
            Err(_) => return,
        };

        let body = match request.body_document() {
            Ok(body) => body,
            Err(_) => return,
        };

        let command_name = body
            .keys()
            .next()
            .map(|name| name.to_string())
            .unwrap_or_default();

        let reply = {
            let mut state = state.lock().unwrap();
            if command_name == "hello"
                || command_name.to_lowercase() == LEGACY_HELLO_COMMAND_NAME_LOWERCASE
            {
                state.hello.clone()
            } else {
                state.received.push(body);
                state
                    .replies
                    .get_mut(&command_name)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| doc! { "ok": 1 })
            }
        };

        let payload = match crate::bson_util::document_to_vec(&reply) {
            Ok(payload) => payload,
            Err(_) => return,
        };

        let response = Message {
            document_payload: payload,
            document_sequences: Vec::new(),
            response_to: request.request_id.unwrap_or(0),
            flags: crate::cmap::conn::wire::MessageFlags::empty(),
            checksum: None,
            request_id: None,
        };

        if response.write_to(&mut stream).await.is_err() {
            return;
        }
    }
}

/// An event subscriber that collects everything it sees for later assertions.
#[derive(Clone, Default)]
pub(crate) struct EventBuffer {
    cmap: Arc<Mutex<Vec<CmapEvent>>>,
    command: Arc<Mutex<Vec<CommandEvent>>>,
    sdam: Arc<Mutex<Vec<SdamEvent>>>,
}

impl EventBuffer {
    /// Creates a buffer and a registry with the buffer subscribed to every topic.
    pub(crate) fn registry() -> (EventBuffer, MonitoringRegistry) {
        let buffer = EventBuffer::default();
        let registry = MonitoringRegistry::new();

        let cmap = buffer.cmap.clone();
        registry.subscribe_cmap(Arc::new(move |event: &CmapEvent| {
            cmap.lock().unwrap().push(event.clone());
        }));

        let command = buffer.command.clone();
        registry.subscribe_command(Arc::new(move |event: &CommandEvent| {
            command.lock().unwrap().push(event.clone());
        }));

        let sdam = buffer.sdam.clone();
        registry.subscribe_sdam(Arc::new(move |event: &SdamEvent| {
            sdam.lock().unwrap().push(event.clone());
        }));

        (buffer, registry)
    }

    pub(crate) fn cmap_events(&self) -> Vec<CmapEvent> {
        self.cmap.lock().unwrap().clone()
    }

    pub(crate) fn command_events(&self) -> Vec<CommandEvent> {
        self.command.lock().unwrap().clone()
    }

    pub(crate) fn sdam_events(&self) -> Vec<SdamEvent> {
        self.sdam.lock().unwrap().clone()
    }
}

/// Polls `predicate` every 10ms until it returns true or `timeout` elapses, panicking on
/// timeout.
pub(crate) async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool, what: &str) {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}
