use std::{sync::Arc, time::Instant};

use super::{session::TransactionState, Client, ClientSession};
use crate::{
    cmap::{conn::PooledConnection, Command, CommandResponse},
    error::{Error, ErrorKind, Result, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR},
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{Operation, Retryability},
    sdam::HandshakePhase,
    selection_criteria::SelectionCriteria,
};

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will be performed using the criteria specified on the operation, if any,
    /// and an implicit session will be created if the operation and write concern are compatible
    /// with sessions and an explicit session is not provided.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        if !op.is_acknowledged() {
            return Err(ErrorKind::InvalidArgument {
                message: "Unacknowledged write concerns are not supported".to_string(),
            }
            .into());
        }
        match session.into() {
            Some(session) => self.execute_operation_with_retry(op, Some(session)).await,
            None => {
                let mut implicit_session = self.start_implicit_session(&op).await?;
                self.execute_operation_with_retry(op, implicit_session.as_mut())
                    .await
            }
        }
    }

    /// Selects a server and executes the given operation on it, optionally using a provided
    /// session. Retries the operation exactly once upon failure if retryability is supported.
    async fn execute_operation_with_retry<T: Operation>(
        &self,
        mut op: T,
        mut session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        let mut first_error: Option<Error> = None;
        let mut txn_number: Option<i64> = None;

        for attempt in 0..2 {
            let is_retry = attempt > 0;
            if is_retry {
                op.update_for_retry();
            }

            let in_transaction = session
                .as_ref()
                .map(|s| {
                    matches!(
                        s.transaction.state,
                        TransactionState::Starting | TransactionState::InProgress
                    )
                })
                .unwrap_or(false);

            let selection_criteria = self.resolve_selection_criteria(&op, &session);
            let server = match self.select_server(selection_criteria.as_ref()).await {
                Ok(server) => server,
                Err(mut err) => {
                    if let Some(first_error) = first_error.take() {
                        return Err(first_error);
                    }
                    if in_transaction {
                        err.add_label(TRANSIENT_TRANSACTION_ERROR);
                    }
                    return Err(err);
                }
            };

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(mut err) => {
                    if let Some(first_error) = first_error.take() {
                        return Err(first_error);
                    }
                    if in_transaction {
                        err.add_label(TRANSIENT_TRANSACTION_ERROR);
                        return Err(err);
                    }
                    // Failures to produce a connection (establishment errors, cleared pools)
                    // have already been fed into the topology by the pool itself; a retryable
                    // operation simply tries again against a fresh selection.
                    if op.retryability() == Retryability::Write
                        && self.retries_enabled_for(&op)
                        && err.is_network_error()
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }
                    let retryable = self.retries_enabled_for(&op)
                        && match op.retryability() {
                            Retryability::Read => err.is_read_retryable(),
                            Retryability::Write => err.is_write_retryable(),
                            Retryability::None => false,
                        };
                    if retryable {
                        first_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            };

            let retryability = self.get_retryability(&conn, &op, &session)?;
            if is_retry && retryability == Retryability::None {
                // The newly selected server doesn't support retrying, so the original error is
                // surfaced.
                return Err(first_error.unwrap_or_else(|| {
                    Error::internal("retry attempted without an original error")
                }));
            }

            if txn_number.is_none() {
                txn_number = match session {
                    Some(ref mut session) if in_transaction => Some(session.txn_number()),
                    Some(ref mut session) if retryability == Retryability::Write => {
                        Some(session.get_and_increment_txn_number())
                    }
                    _ => None,
                };
            }

            let max_wire_version = conn
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version)
                .unwrap_or(0);

            match self
                .execute_operation_on_connection(&mut op, &mut conn, &mut session, txn_number)
                .await
            {
                Ok(result) => return Ok(result),
                Err(mut err) => {
                    if retryability == Retryability::Write
                        && err.should_add_retryable_write_label(max_wire_version)
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    // Release the connection to be processed by the connection pool, and the
                    // selected server with it.
                    drop(conn);
                    drop(server);

                    let retryable = (retryability == Retryability::Read
                        && err.is_read_retryable())
                        || (retryability == Retryability::Write && err.is_write_retryable());

                    match first_error.take() {
                        Some(first_error) => {
                            return Err(if err.is_server_error() || retryable {
                                err
                            } else {
                                first_error
                            });
                        }
                        None if retryable => {
                            first_error = Some(err);
                            continue;
                        }
                        None => return Err(err),
                    }
                }
            }
        }

        // Both attempts produced retryable errors; the last one was stored above.
        Err(first_error
            .unwrap_or_else(|| Error::internal("operation failed without reporting an error")))
    }

    /// Executes an operation on a given connection, optionally using a provided session.
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<T::O> {
        if let Some(wc) = op.write_concern() {
            wc.validate()?;
        }

        let stream_description = connection.stream_description()?.clone();
        let is_sharded =
            stream_description.initial_server_type == crate::sdam::ServerType::Mongos;

        let mut cmd = op.build(&stream_description)?;
        self.inner.topology.update_command_with_read_pref(
            connection.address(),
            &mut cmd,
            op.selection_criteria(),
        )?;

        match session {
            Some(ref mut session) if op.supports_sessions() && op.is_acknowledged() => {
                cmd.set_session_id(session.id());
                self.append_transaction_fields(&mut cmd, op, session, txn_number, &stream_description)?;
                session.update_last_use();
            }
            Some(ref session) if !op.supports_sessions() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("{} does not support sessions", cmd.name),
                }
                .into());
            }
            Some(ref session) if !op.is_acknowledged() && !session.is_implicit() => {
                return Err(ErrorKind::InvalidArgument {
                    message: "Cannot use ClientSessions with unacknowledged write concern"
                        .to_string(),
                }
                .into());
            }
            _ => {
                if let Some(read_concern) = self.non_session_read_concern(op, &stream_description)
                {
                    cmd.set_read_concern_level(&read_concern);
                }
            }
        }

        let session_cluster_time = session.as_ref().and_then(|session| session.cluster_time());
        let client_cluster_time = self.inner.topology.cluster_time();
        let max_cluster_time =
            std::cmp::max(session_cluster_time, client_cluster_time.as_ref());
        if let Some(cluster_time) = max_cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        let connection_info = connection.info();
        let service_id = connection.service_id();
        let request_id = crate::cmap::conn::next_request_id();

        self.emit_command_event(|| {
            let command_body = if cmd.should_redact() {
                bson::Document::new()
            } else {
                cmd.body.clone()
            };
            CommandEvent::Started(CommandStartedEvent {
                command: command_body,
                db: cmd.target_db.clone(),
                command_name: cmd.name.clone(),
                request_id,
                connection: connection_info.clone(),
                service_id,
            })
        });

        let start_time = Instant::now();

        let command_result = connection.send_command(cmd.clone(), request_id, None).await;
        let duration = start_time.elapsed();

        let response_result = match command_result {
            Ok(response) => {
                self.advance_times(session, &response).await;
                response.validate().map(|_| response)
            }
            Err(err) => Err(err),
        };

        match response_result {
            Err(mut err) => {
                self.emit_command_event(|| {
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: cmd.name.clone(),
                        failure: err.clone(),
                        request_id,
                        connection: connection_info,
                        service_id,
                    })
                });

                if let Some(ref mut session) = session {
                    if err.is_network_error() {
                        session.mark_dirty();
                    }
                    if matches!(
                        session.transaction.state,
                        TransactionState::Starting | TransactionState::InProgress
                    ) && (err.is_network_error() || err.is_state_change_error())
                    {
                        err.add_label(TRANSIENT_TRANSACTION_ERROR);
                        session.unpin();
                    }
                }

                // Update the topology based on the error, unless the error is a network timeout
                // on a command carrying a server-enforced time limit: the server is healthy in
                // that case and the connection alone is discarded.
                if !(err.is_network_timeout() && cmd.has_max_time()) {
                    self.inner
                        .topology
                        .handle_application_error(
                            connection.address().clone(),
                            err.clone(),
                            HandshakePhase::after_completion(connection),
                        )
                        .await;
                }

                op.handle_error(err)
            }
            Ok(response) => {
                self.emit_command_event(|| {
                    let reply = if cmd.should_redact() {
                        bson::Document::new()
                    } else {
                        response.raw_response.clone()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: cmd.name.clone(),
                        request_id,
                        connection: connection_info,
                        service_id,
                    })
                });

                if let Some(ref mut session) = session {
                    if let Some(token) = response.recovery_token() {
                        session.transaction.recovery_token = Some(token);
                    }

                    if session.transaction.state == TransactionState::Starting {
                        session.transaction.state = TransactionState::InProgress;
                        // On sharded (and load-balanced) deployments, every subsequent command
                        // of this transaction has to address the same server.
                        if is_sharded {
                            session.pin_to_address(connection.address().clone());
                        }
                    }
                }

                op.handle_response(response, &stream_description)
            }
        }
    }

    /// Appends the session's transaction-related fields (or, outside of a transaction, causally
    /// consistent read concern fields) to the command.
    fn append_transaction_fields<T: Operation>(
        &self,
        cmd: &mut Command,
        op: &T,
        session: &mut ClientSession,
        txn_number: Option<i64>,
        description: &crate::cmap::StreamDescription,
    ) -> Result<()> {
        let is_transaction_command = matches!(
            op.name(),
            "commitTransaction" | "abortTransaction"
        );

        if is_transaction_command {
            cmd.set_autocommit();
            cmd.set_txn_number(session.txn_number());
            if op.name() == "commitTransaction" {
                if let Some(ref token) = session.transaction.recovery_token {
                    cmd.body.insert("recoveryToken", token.clone());
                }
            }
            return Ok(());
        }

        match session.transaction.state {
            TransactionState::Starting => {
                cmd.set_start_transaction();
                cmd.set_autocommit();

                if let Some(ref options) = session.transaction.options {
                    if let Some(ref read_concern) = options.read_concern {
                        cmd.set_read_concern_level(&read_concern.level);
                    }
                }
                if session.causal_consistency() {
                    if let Some(operation_time) = session.operation_time() {
                        cmd.set_after_cluster_time(&operation_time);
                    }
                }
                cmd.set_txn_number(txn_number.unwrap_or_else(|| session.txn_number()));
            }
            TransactionState::InProgress => {
                cmd.set_autocommit();
                cmd.set_txn_number(txn_number.unwrap_or_else(|| session.txn_number()));
            }
            _ => {
                // Not in a transaction: attach the retryable write transaction number and, for
                // causally consistent reads, the afterClusterTime token.
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }

                if op.supports_read_concern(description) {
                    if let Some(ref read_concern) = self.inner.options.read_concern {
                        cmd.set_read_concern_level(&read_concern.level);
                    }
                    if session.causal_consistency() {
                        if let Some(operation_time) = session.operation_time() {
                            cmd.set_after_cluster_time(&operation_time);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn non_session_read_concern<T: Operation>(
        &self,
        op: &T,
        description: &crate::cmap::StreamDescription,
    ) -> Option<crate::concern::ReadConcernLevel> {
        if !op.supports_read_concern(description) {
            return None;
        }
        self.inner
            .options
            .read_concern
            .as_ref()
            .map(|rc| rc.level.clone())
    }

    async fn advance_times(
        &self,
        session: &mut Option<&mut ClientSession>,
        response: &CommandResponse,
    ) {
        if let Some(cluster_time) = response.cluster_time() {
            self.inner.topology.advance_cluster_time(cluster_time.clone()).await;
            if let Some(ref mut session) = session {
                session.advance_cluster_time(&cluster_time);
            }
        }

        if let Some(operation_time) = response.operation_time() {
            if let Some(ref mut session) = session {
                session.advance_operation_time(operation_time);
            }
        }
    }

    /// The criteria used for selecting the server this operation runs on: a session pinned to a
    /// mongos overrides everything; otherwise transaction options and then the operation itself
    /// are consulted. Write operations carry no criteria and so default to the primary.
    fn resolve_selection_criteria<T: Operation>(
        &self,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Option<SelectionCriteria> {
        if let Some(session) = session {
            if let Some(ref pinned) = session.transaction.pinned_address {
                let address = pinned.clone();
                return Some(SelectionCriteria::Predicate(Arc::new(move |server| {
                    server.address() == &address
                })));
            }

            if matches!(
                session.transaction.state,
                TransactionState::Starting | TransactionState::InProgress
            ) {
                if let Some(ref options) = session.transaction.options {
                    if let Some(ref criteria) = options.selection_criteria {
                        return Some(criteria.clone());
                    }
                }
            }
        }

        op.selection_criteria().cloned()
    }

    fn retries_enabled_for<T: Operation>(&self, op: &T) -> bool {
        match op.retryability() {
            Retryability::Read => self.inner.options.retry_reads != Some(false),
            Retryability::Write => self.inner.options.retry_writes != Some(false),
            Retryability::None => false,
        }
    }

    /// Returns the retryability level for the execution of this operation.
    fn get_retryability<T: Operation>(
        &self,
        conn: &PooledConnection,
        op: &T,
        session: &Option<&mut ClientSession>,
    ) -> Result<Retryability> {
        let in_transaction = session
            .as_ref()
            .map(|session| {
                matches!(
                    session.transaction.state,
                    TransactionState::Starting | TransactionState::InProgress
                )
            })
            .unwrap_or(false);
        let is_transaction_command = matches!(
            op.name(),
            "commitTransaction" | "abortTransaction"
        );

        if in_transaction && !is_transaction_command {
            return Ok(Retryability::None);
        }

        match op.retryability() {
            Retryability::Read if self.inner.options.retry_reads != Some(false) => {
                Ok(Retryability::Read)
            }
            Retryability::Write
                if self.inner.options.retry_writes != Some(false)
                    && conn.stream_description()?.supports_retryable_writes() =>
            {
                Ok(Retryability::Write)
            }
            _ => Ok(Retryability::None),
        }
    }

    pub(crate) fn emit_command_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        if self.inner.options.command_events == Some(false) {
            return;
        }
        self.inner.registry.emit_command(&generate_event());
    }
}
