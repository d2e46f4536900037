//! Contains the session type and its supporting machinery.

mod cluster_time;
mod pool;
#[cfg(test)]
mod test;

use std::time::{Duration, Instant};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use lazy_static::lazy_static;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
    Client,
};
pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

lazy_static! {
    pub(crate) static ref SESSIONS_UNSUPPORTED_COMMANDS: std::collections::HashSet<&'static str> = {
        let mut hash_set = std::collections::HashSet::new();
        hash_set.insert("killcursors");
        hash_set.insert("parallelcollectionscan");
        hash_set
    };
}

/// Contains the options that can be used to create a new [`ClientSession`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    #[builder(default)]
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all operations performed in the context of this session
    /// will be [causally consistent](https://www.mongodb.com/docs/manual/core/causal-consistency-read-write-concerns/).
    ///
    /// Defaults to true.
    #[builder(default)]
    pub causal_consistency: Option<bool>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    #[builder(default)]
    pub read_concern: Option<ReadConcern>,

    /// The write concern to commit or abort the transaction with.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in the transaction.
    #[builder(default)]
    pub selection_criteria: Option<SelectionCriteria>,
}

/// A session to be used with client operations, providing a mechanism for causal consistency and
/// transactions.
///
/// `ClientSession`s are not thread safe or fork safe; they can only be used by one thread or
/// process at a time.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    server_session: Option<ServerSession>,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
}

/// The transaction state of a session, along with the resources the transaction holds onto.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    /// Once a transaction command has been run on a mongos (or load balancer), all subsequent
    /// commands of the transaction must go to the same one.
    pub(crate) pinned_address: Option<ServerAddress>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.pinned_address = None;
        self.recovery_token = None;
    }

    fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_address = None;
    }
}

/// The state of a transaction over its lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any data was actually committed, i.e. whether at least one operation ran
        /// between starting and committing. Committing an empty transaction is a no-op on the
        /// driver side.
        data_committed: bool,
    },
    Aborted,
}

impl ClientSession {
    pub(crate) fn new(
        server_session: ServerSession,
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        Self {
            cluster_time: None,
            operation_time: None,
            server_session: Some(server_session),
            client,
            is_implicit,
            options,
            transaction: Default::default(),
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        // The inner session is only absent mid-drop.
        &self
            .server_session
            .as_ref()
            .expect("session unexpectedly dropped")
            .id
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether operations using this session are causally consistent with each other.
    pub(crate) fn causal_consistency(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.causal_consistency)
            .unwrap_or(true)
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The latest operation time this session has observed, used as `afterClusterTime` for
    /// causally consistent reads.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance the session's notion of the latest seen operation time.
    pub fn advance_operation_time(&mut self, to: Timestamp) {
        match self.operation_time {
            Some(current) if (current.time, current.increment) >= (to.time, to.increment) => {}
            _ => self.operation_time = Some(to),
        }
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.dirty = true;
        }
    }

    /// Updates the date that the underlying server session was last used as part of an operation
    /// sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        if let Some(ref mut session) = self.server_session {
            session.last_use = Instant::now();
        }
    }

    /// Increments the transaction number and returns the new value, used for retryable writes
    /// and transactions.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        match self.server_session {
            Some(ref mut session) => {
                session.txn_number += 1;
                session.txn_number
            }
            None => 0,
        }
    }

    /// The current transaction number.
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session
            .as_ref()
            .map(|session| session.txn_number)
            .unwrap_or(0)
    }

    pub(crate) fn pin_to_address(&mut self, address: ServerAddress) {
        self.transaction.pinned_address = Some(address);
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned_address = None;
    }

    /// Starts a new transaction on this session with the given options. If no options are
    /// provided, the session's `default_transaction_options` will be used.
    ///
    /// Operations will be associated with the transaction until either
    /// [`commit_transaction`](Self::commit_transaction) or
    /// [`abort_transaction`](Self::abort_transaction) is called.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        if matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        ) {
            return Err(ErrorKind::Transaction {
                message: "transaction already in progress".into(),
            }
            .into());
        }

        if self.client.transaction_support_status()
            == crate::sdam::TransactionSupportStatus::Unsupported
        {
            return Err(ErrorKind::Transaction {
                message: "transactions are not supported by this deployment".into(),
            }
            .into());
        }

        let options = options.into().or_else(|| {
            self.options
                .as_ref()
                .and_then(|o| o.default_transaction_options.clone())
        });

        if let Some(ref wc) = options.as_ref().and_then(|o| o.write_concern.clone()) {
            if !wc.is_acknowledged() {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }

        self.get_and_increment_txn_number();
        self.transaction.start(options);

        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This operation retries once upon failure with a `RetryableWriteError` label, and the
    /// returned error may carry an `UnknownTransactionCommitResult` label indicating that it is
    /// unknown whether the commit took effect.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting | TransactionState::Committed { data_committed: false } => {
                // No command was run in the transaction, so there is nothing to commit.
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress | TransactionState::Committed { data_committed: true } => {
                let client = self.client.clone();
                let commit_result = client.commit_transaction(self).await;
                if commit_result.is_ok() {
                    self.transaction.commit(true);
                }
                commit_result
            }
        }
    }

    /// Aborts the transaction that is currently active on this session. Errors returned by the
    /// server are swallowed; the transaction is considered aborted either way.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                // No command was ever run on the transaction, so there is nothing to abort.
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                // Errors from abortTransaction are intentionally swallowed; aborting is
                // best-effort.
                let client = self.client.clone();
                let _: Result<()> = client.abort_transaction(self).await;
                self.transaction.abort();
                Ok(())
            }
        }
    }

    pub(crate) fn take_server_session(&mut self) -> Option<ServerSession> {
        self.server_session.take()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(server_session) = self.server_session.take() {
            let client = self.client.clone();
            crate::runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,

    /// A monotonically increasing transaction number for this session.
    txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute). Sessions for which no timeout is known never expire client-side.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}
