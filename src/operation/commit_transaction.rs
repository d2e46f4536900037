use bson::doc;

use super::{Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::Result,
    options::TransactionOptions,
};

/// An operation that commits the active transaction on a session.
#[derive(Debug)]
pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,

    /// Whether this commit is re-running after an earlier attempt whose outcome was unknown. In
    /// that case the write concern is upgraded to majority.
    retrying: bool,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self {
            options,
            retrying: false,
        }
    }

    /// Mark this commit as re-running after an `UnknownTransactionCommitResult` outcome.
    pub(crate) fn mark_as_retrying(&mut self) {
        self.retrying = true;
    }
}

impl Operation for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut command = Command::new(Self::NAME, "admin", doc! { Self::NAME: 1 });

        let mut write_concern = self
            .options
            .as_ref()
            .and_then(|options| options.write_concern.clone())
            .unwrap_or_default();

        // Per the transactions spec, a commit retried after an unknown result must use a
        // majority write concern with a w_timeout.
        if self.retrying {
            write_concern.w = Some(Acknowledgment::Majority);
            if write_concern.w_timeout.is_none() {
                write_concern.w_timeout = Some(std::time::Duration::from_millis(10_000));
            }
        }

        if !write_concern.is_empty() {
            command.set_write_concern(&write_concern)?;
        }

        Ok(command)
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn update_for_retry(&mut self) {
        self.mark_as_retrying();
    }
}
