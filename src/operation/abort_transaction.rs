use bson::doc;

use super::{Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    options::TransactionOptions,
};

/// An operation that aborts the active transaction on a session.
#[derive(Debug)]
pub(crate) struct AbortTransaction {
    options: Option<TransactionOptions>,
}

impl AbortTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl Operation for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut command = Command::new(Self::NAME, "admin", doc! { Self::NAME: 1 });

        if let Some(write_concern) = self.write_concern() {
            if !write_concern.is_empty() {
                command.set_write_concern(write_concern)?;
            }
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
}
