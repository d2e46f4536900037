use std::time::Duration;

use bson::{doc, oid::ObjectId, DateTime, Document, Timestamp};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::{
    client::{options::ServerAddress, ClusterTime},
    cmap::{Command, Connection},
    compression::Compressor,
    error::Result,
    options::ClientOptions,
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

lazy_static! {
    /// Contains the basic handshake information that can be statically determined. This document
    /// (potentially with additional fields added) can be cloned and put in the `client` field of
    /// the `hello` command.
    static ref BASE_CLIENT_METADATA: Document = {
        doc! {
            "driver": {
                "name": "mongodb-core",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
            "platform": format!("rust {}", rustc_version()),
        }
    };
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If `load_balanced` is true or the server indicated `helloOk: true`, then `hello` will be used.
/// Otherwise, legacy hello will be used, and if it's unknown whether the server supports hello,
/// the command also will contain `helloOk: true`.
pub(crate) fn hello_command(
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(load_balanced, Some(true))
        || matches!(hello_ok, Some(true))
    {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if matches!(load_balanced, Some(true)) {
        body.insert("loadBalanced", true);
    }

    if let Some(opts) = awaitable_options {
        body.insert(
            "topologyVersion",
            doc! {
                "processId": opts.topology_version.process_id,
                "counter": opts.topology_version.counter,
            },
        );
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    let mut command = Command::new(command_name, "admin", body);
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Appends the client metadata and compression negotiation fields to a handshake hello body.
pub(crate) fn append_metadata(body: &mut Document, options: &ClientOptions) {
    let mut metadata = BASE_CLIENT_METADATA.clone();

    if let Some(ref app_name) = options.app_name {
        metadata.insert("application", doc! { "name": app_name.as_str() });
    }

    body.insert("client", metadata);

    let compressors: Vec<&'static str> = options
        .compressors
        .as_ref()
        .map(|compressors| compressors.iter().map(Compressor::name).collect())
        .unwrap_or_default();
    body.insert(
        "compression",
        compressors
            .into_iter()
            .map(bson::Bson::from)
            .collect::<bson::Array>(),
    );
}

/// Execute a hello or legacy hello command on the provided connection.
pub(crate) async fn run_hello(
    conn: &mut Connection,
    command: Command,
    deadline: Option<std::time::Instant>,
) -> Result<HelloReply> {
    let response = conn.send_command(command, None, deadline).await?;
    response.validate()?;

    let cluster_time = response.cluster_time();
    let command_response: HelloCommandResponse = response.body()?;

    Ok(HelloReply {
        server_address: conn.address().clone(),
        command_response,
        raw_command_response: response.raw_response,
        cluster_time,
    })
}

/// The reply to a successful `hello` command, along with its source and any cluster time it
/// carried.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub(crate) is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub(crate) is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub(crate) hello_ok: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub(crate) msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub(crate) me: Option<String>,

    #[serde(rename = "compression")]
    /// The list of compatible compressors that the server returned.
    pub(crate) compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub(crate) set_version: Option<i32>,

    /// The name of the current replica set.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub(crate) last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub(crate) tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub(crate) election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub(crate) primary: Option<String>,

    /// A list of SASL mechanisms used to create the user's credential(s).
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the authentication handshake.
    pub(crate) speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default = "max_bson_object_size_default")]
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,

    /// For internal use.
    pub(crate) topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default = "max_message_size_bytes_default")]
    pub(crate) max_message_size_bytes: i32,

    /// The server-generated ID for the connection the "hello" command was run on.
    /// Present on server versions 4.2+.
    pub(crate) connection_id: Option<i64>,
}

fn max_bson_object_size_default() -> i64 {
    16 * 1024 * 1024
}

fn max_message_size_bytes_default() -> i32 {
    48_000_000
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[allow(dead_code)]
pub(crate) struct OpTime {
    ts: Timestamp,
    t: i32,
}

#[cfg(test)]
mod test {
    use super::{hello_command, AwaitableHelloOptions, HelloCommandResponse};
    use crate::sdam::{ServerType, TopologyVersion};
    use std::time::Duration;

    #[test]
    fn legacy_hello_is_used_until_hello_ok() {
        let command = hello_command(None, None, None);
        assert_eq!(command.name, super::LEGACY_HELLO_COMMAND_NAME);
        assert!(command.body.get_bool("helloOk").unwrap());

        let command = hello_command(None, Some(true), None);
        assert_eq!(command.name, "hello");
        assert!(!command.body.contains_key("helloOk"));
    }

    #[test]
    fn awaited_hello_carries_topology_version() {
        let options = AwaitableHelloOptions {
            topology_version: TopologyVersion {
                process_id: bson::oid::ObjectId::new(),
                counter: 7,
            },
            max_await_time: Duration::from_secs(10),
        };

        let command = hello_command(None, Some(true), Some(options));
        assert!(command.exhaust_allowed);
        assert_eq!(command.body.get_i64("maxAwaitTimeMS").unwrap(), 10_000);
        assert_eq!(
            command
                .body
                .get_document("topologyVersion")
                .unwrap()
                .get_i64("counter")
                .unwrap(),
            7
        );
    }

    #[test]
    fn server_type_classification() {
        let mut response = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            ..Default::default()
        };
        assert_eq!(response.server_type(), ServerType::Mongos);

        response.msg = None;
        response.set_name = Some("rs0".to_string());
        response.is_writable_primary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = None;
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);

        assert_eq!(
            HelloCommandResponse::default().server_type(),
            ServerType::Standalone
        );
    }
}
