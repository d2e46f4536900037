use bson::{doc, Document};
use serde::Serialize;
use typed_builder::TypedBuilder;

use super::{append_options, Operation, Retryability};
use crate::{
    cmap::{Command, CommandResponse, StreamDescription},
    error::Result,
    results::CursorBatch,
    selection_criteria::SelectionCriteria,
};

/// Options for a find operation.
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// The maximum number of documents to return.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    /// The number of documents the server should return per cursor batch.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    /// Limits the fields of the document being returned.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,

    /// The order of the documents for the purposes of the operation.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Document>,

    /// The maximum amount of time for the server to spend on the operation.
    ///
    /// This is enforced server side; the server is healthy even if the limit elapses.
    #[builder(default)]
    #[serde(
        rename = "maxTimeMS",
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_millis"
    )]
    pub max_time: Option<std::time::Duration>,
}

/// An operation that issues an initial query, returning the first batch of the resulting cursor.
#[derive(Debug)]
pub(crate) struct Find {
    db: String,
    coll: String,
    filter: Option<Document>,
    options: Option<FindOptions>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Find {
    pub(crate) fn new(
        db: String,
        coll: String,
        filter: Option<Document>,
        options: Option<FindOptions>,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            db,
            coll,
            filter,
            options,
            selection_criteria,
        }
    }
}

impl Operation for Find {
    type O = CursorBatch;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.coll.clone(),
        };

        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }

        append_options(&mut body, self.options.as_ref())?;

        Ok(Command::new(Self::NAME, self.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: CommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.validate()?;
        let body: CursorResponseBody = response.body()?;
        Ok(body.cursor)
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[derive(Debug, serde::Deserialize)]
struct CursorResponseBody {
    cursor: CursorBatch,
}
