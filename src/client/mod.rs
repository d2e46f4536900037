pub(crate) mod auth;
mod bulk_write;
mod executor;
pub mod options;
pub(crate) mod session;
#[cfg(test)]
mod test;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::Document;

use crate::{
    error::{ErrorKind, Result, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    event::MonitoringRegistry,
    operation::{AbortTransaction, CommitTransaction, Find, Insert, RunCommand},
    options::{ClientOptions, FindOptions, ReadPreference, SelectionCriteria, SessionOptions},
    results::{CursorBatch, InsertManyResult},
    sdam::{
        server_selection::attempt_to_select_server,
        Server,
        Topology,
        TransactionSupportStatus,
    },
    ClientSession,
};

pub use bulk_write::WriteModel;
pub(crate) use bulk_write::write_batches;
pub(crate) use session::ClusterTime;

use session::ServerSession;

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// This is the main entry point for the core API. A `Client` is used to connect to a MongoDB
/// cluster. By default, it will monitor the topology of the cluster, keeping track of any changes,
/// such as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across threads or async tasks. Dropping the last clone shuts down
/// the monitors and closes the connection pools.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
    registry: MonitoringRegistry,
    session_pool: session::ServerSessionPool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a valid
    /// MongoDB connection string.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let registry = options.monitoring_registry();
        let topology = Topology::new(options.clone())?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                registry,
                session_pool: session::ServerSessionPool::new(),
            }),
        })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The monitoring registry this client publishes events to.
    pub fn monitoring(&self) -> &MonitoringRegistry {
        &self.inner.registry
    }

    /// Runs a database-level command against the given database.
    ///
    /// Note that no inspection is done on `command`; the document will be sent to the server
    /// as-is, with the session and cluster-time fields attached.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref(), command, selection_criteria.into())?;
        self.execute_operation(operation, None).await
    }

    /// Runs a database-level command on this client using the provided session.
    pub async fn run_command_with_session(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref(), command, selection_criteria.into())?;
        self.execute_operation(operation, session).await
    }

    /// Issues a query against `db.coll`, returning the first batch of the resulting cursor.
    pub async fn find(
        &self,
        db: impl AsRef<str>,
        coll: impl AsRef<str>,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<CursorBatch> {
        let operation = Find::new(
            db.as_ref().to_string(),
            coll.as_ref().to_string(),
            filter.into(),
            options.into(),
            selection_criteria.into(),
        );
        self.execute_operation(operation, session).await
    }

    /// Inserts the given documents into `db.coll`, using the client's default write concern.
    pub async fn insert_many(
        &self,
        db: impl AsRef<str>,
        coll: impl AsRef<str>,
        documents: Vec<Document>,
        ordered: impl Into<Option<bool>>,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<InsertManyResult> {
        let operation = Insert::new(
            db.as_ref().to_string(),
            coll.as_ref().to_string(),
            documents,
            ordered.into(),
            self.inner.options.write_concern.clone(),
        );
        self.execute_operation(operation, session).await
    }

    /// Performs the given sequence of writes against `db.coll`, grouping them into as few
    /// commands as their types and order allow. Returns the raw reply of each command issued.
    ///
    /// With `ordered` set (the default), writes are applied in order and execution stops at the
    /// first write error; otherwise writes are grouped per command type and all of them are
    /// attempted.
    pub async fn bulk_write(
        &self,
        db: impl AsRef<str>,
        coll: impl AsRef<str>,
        models: &[WriteModel],
        ordered: impl Into<Option<bool>>,
    ) -> Result<Vec<Document>> {
        const MAX_BULK_BATCH_SIZE: usize = 1000;

        let ordered = ordered.into().unwrap_or(true);
        let batches = write_batches(models, ordered, MAX_BULK_BATCH_SIZE)?;

        let mut replies = Vec::with_capacity(batches.len());
        for batch in batches {
            let payload_key = match batch.name {
                "insert" => "documents",
                "update" => "updates",
                _ => "deletes",
            };

            let mut command = bson::doc! {
                batch.name: coll.as_ref(),
                "ordered": ordered,
            };
            command.insert(payload_key, bson::to_bson(&batch.documents)?);
            if let Some(ref write_concern) = self.inner.options.write_concern {
                if !write_concern.is_empty() {
                    command.insert("writeConcern", write_concern.to_document()?);
                }
            }

            let reply = self.run_command(db.as_ref(), command, None).await?;

            let has_write_errors = reply
                .get_array("writeErrors")
                .map(|errors| !errors.is_empty())
                .unwrap_or(false);
            replies.push(reply);

            if ordered && has_write_errors {
                break;
            }
        }

        Ok(replies)
    }

    /// Starts a new `ClientSession`.
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        match self.get_session_support_status().await? {
            SessionSupportStatus::Supported => {
                let server_session = self
                    .inner
                    .session_pool
                    .check_out(self.inner.topology.logical_session_timeout())
                    .await;
                Ok(ClientSession::new(
                    server_session,
                    self.clone(),
                    options.into(),
                    false,
                ))
            }
            _ => Err(ErrorKind::SessionsNotSupported.into()),
        }
    }

    /// Shuts down this client, closing the connection pools and stopping the monitors. Blocks
    /// until the in-flight state has been cleaned up.
    pub async fn shutdown(self) {
        self.inner.topology.shutdown().await;
    }

    /// Pre-populates the connection pools of all data-bearing servers up to `minPoolSize`.
    pub async fn warm_connection_pool(&self) {
        self.inner.topology.warm_pool().await;
    }

    /// Select a server using the provided criteria. If none is provided, a primary read
    /// preference will be used instead.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
    ) -> Result<Arc<Server>> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria.unwrap_or(&default_criteria);

        let timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let try_once = self.inner.options.server_selection_try_once == Some(true);

        let start_time = Instant::now();
        let mut watcher = self.inner.topology.watch();
        let mut attempted = false;

        loop {
            let state = watcher.observe_latest();

            if let Some(server) =
                attempt_to_select_server(criteria, &state.description, &state.servers())?
            {
                return Ok(server);
            }

            let message = state
                .description
                .server_selection_timeout_error_message(criteria);

            // With `serverSelectionTryOnce`, selection makes a single pass, waits for the
            // topology to change once, then makes a final pass.
            if try_once && attempted {
                return Err(ErrorKind::ServerSelection { message }.into());
            }
            attempted = true;

            // Request server checks and wait for the topology to change before trying again.
            watcher.request_immediate_check();

            let remaining = match timeout.checked_sub(start_time.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Err(ErrorKind::ServerSelection { message }.into()),
            };

            if !watcher.wait_for_update(remaining).await {
                return Err(ErrorKind::ServerSelection { message }.into());
            }
        }
    }

    /// Start an implicit session if the operation and write concern are compatible with
    /// sessions.
    async fn start_implicit_session<T: crate::operation::Operation>(
        &self,
        op: &T,
    ) -> Result<Option<ClientSession>> {
        match self.get_session_support_status().await? {
            SessionSupportStatus::Supported if op.supports_sessions() && op.is_acknowledged() => {
                let server_session = self
                    .inner
                    .session_pool
                    .check_out(self.inner.topology.logical_session_timeout())
                    .await;
                Ok(Some(ClientSession::new(
                    server_session,
                    self.clone(),
                    None,
                    true,
                )))
            }
            _ => Ok(None),
        }
    }

    /// Gets whether the topology supports sessions. If it has yet to be determined (i.e. before
    /// any data-bearing server has been discovered), this method performs a server selection
    /// that will force that determination to be made.
    async fn get_session_support_status(&self) -> Result<SessionSupportStatus> {
        let initial_status = self.session_support_status();

        match initial_status {
            SessionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(Arc::new(move |server_info| {
                    server_info.server_type().is_data_bearing()
                }));
                let _: Arc<Server> = self.select_server(Some(&criteria)).await?;
                Ok(self.session_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    fn session_support_status(&self) -> SessionSupportStatus {
        let watcher = self.inner.topology.watch();
        let state = watcher.peek_latest();
        let description = &state.description;

        if description.topology_type() == crate::TopologyType::LoadBalanced {
            return SessionSupportStatus::Supported;
        }

        let any_data_bearing = description
            .servers()
            .iter()
            .any(|s| s.server_type().is_data_bearing());

        if !any_data_bearing {
            SessionSupportStatus::Undetermined
        } else if description.logical_session_timeout().is_some() {
            SessionSupportStatus::Supported
        } else {
            // A data-bearing server that did not report a logicalSessionTimeoutMinutes disables
            // sessions for the whole deployment.
            SessionSupportStatus::Unsupported
        }
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.inner.topology.transaction_support_status()
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// Commits the active transaction on the provided session, adding the
    /// `UnknownTransactionCommitResult` label to errors whose outcome is unknown.
    pub(crate) async fn commit_transaction(&self, session: &mut ClientSession) -> Result<()> {
        let mut op = CommitTransaction::new(session.transaction.options.clone());
        if matches!(
            session.transaction.state,
            session::TransactionState::Committed { .. }
        ) {
            // An explicit re-commit after a prior attempt upgrades the write concern.
            op.mark_as_retrying();
        }

        match self.execute_operation(op, &mut *session).await {
            Ok(()) => Ok(()),
            Err(mut err) => {
                if err.should_add_unknown_transaction_commit_result_label() {
                    err.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
                Err(err)
            }
        }
    }

    /// Aborts the active transaction on the provided session.
    pub(crate) async fn abort_transaction(&self, session: &mut ClientSession) -> Result<()> {
        let op = AbortTransaction::new(session.transaction.options.clone());
        let result = self.execute_operation(op, &mut *session).await;
        session.unpin();
        result
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}

/// Whether sessions are supported by the deployment the client is connected to.
#[derive(Clone, Copy, Debug, PartialEq)]
enum SessionSupportStatus {
    /// It is not known yet whether the deployment supports sessions; no data-bearing server has
    /// been discovered.
    Undetermined,

    /// Sessions are not supported by the deployment.
    Unsupported,

    /// Sessions are supported by the deployment.
    Supported,
}

