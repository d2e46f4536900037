use std::collections::HashMap;

use bson::{doc, oid::ObjectId, Bson, Document};

use super::{Operation, Retryability};
use crate::{
    bson_util,
    cmap::{Command, CommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, WriteConcernError, WriteError, WriteFailure},
    results::InsertManyResult,
};

/// An operation that inserts a batch of documents.
///
/// The documents are sent as an OP_MSG payload type 1 document sequence; the number of documents
/// per command is bounded by the server's `maxWriteBatchSize`, with the remainder sent in
/// follow-up batches by the caller.
#[derive(Debug)]
pub(crate) struct Insert {
    db: String,
    coll: String,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    ordered: bool,
    write_concern: Option<WriteConcern>,
    encoded: Vec<Vec<u8>>,
}

impl Insert {
    pub(crate) fn new(
        db: String,
        coll: String,
        documents: Vec<Document>,
        ordered: Option<bool>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            db,
            coll,
            documents,
            inserted_ids: Vec::new(),
            ordered: ordered.unwrap_or(true),
            write_concern,
            encoded: Vec::new(),
        }
    }
}

impl Operation for Insert {
    type O = InsertManyResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        if self.documents.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "at least one document must be provided to an insert operation".into(),
            }
            .into());
        }

        let batch_size = std::cmp::min(
            self.documents.len(),
            description.max_write_batch_size.max(1) as usize,
        );

        self.inserted_ids.clear();
        self.encoded.clear();
        for document in self.documents.iter_mut().take(batch_size) {
            // The driver generates _ids client-side so that they can be reported without
            // inspecting the server reply.
            let id = document
                .entry("_id".to_string())
                .or_insert_with(|| Bson::ObjectId(ObjectId::new()))
                .clone();
            self.inserted_ids.push(id);
            self.encoded.push(bson_util::document_to_vec(document)?);
        }

        let body = doc! {
            Self::NAME: self.coll.clone(),
            "ordered": self.ordered,
        };

        let mut command = Command::new(Self::NAME, self.db.clone(), body);
        command.add_document_sequence("documents", self.encoded.clone());

        if let Some(ref write_concern) = self.write_concern {
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
        response.validate()?;

        let body = &response.raw_response;

        // Write errors are embedded in `ok: 1` replies.
        if let Ok(write_errors) = body.get_array("writeErrors") {
            if let Some(first) = write_errors
                .iter()
                .filter_map(Bson::as_document)
                .next()
            {
                let error: WriteError = bson::from_document(first.clone())
                    .map_err(|e| Error::invalid_response(e.to_string()))?;
                return Err(ErrorKind::Write(WriteFailure::WriteError(error)).into());
            }
        }

        if let Ok(wc_error) = body.get_document("writeConcernError") {
            let error: WriteConcernError = bson::from_document(wc_error.clone())
                .map_err(|e| Error::invalid_response(e.to_string()))?;
            return Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(error)),
                None::<Vec<String>>,
            ));
        }

        let inserted_ids: HashMap<usize, Bson> = self
            .inserted_ids
            .iter()
            .cloned()
            .enumerate()
            .collect();

        Ok(InsertManyResult { inserted_ids })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
