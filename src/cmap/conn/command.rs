use bson::{doc, Bson, Document};
use serde::{de::DeserializeOwned, Deserialize};

use super::wire::{DocumentSequence, Message};
use crate::{
    client::ClusterTime,
    concern::WriteConcern,
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-side model of a database command.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) exhaust_allowed: bool,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

impl Command {
    /// Constructs a new command. The `$db` field is part of the body from the start so that the
    /// serialized body is complete as soon as the command is built.
    pub(crate) fn new(
        name: impl ToString,
        target_db: impl ToString,
        mut body: Document,
    ) -> Self {
        body.insert("$db", target_db.to_string());
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            exhaust_allowed: false,
            body,
            document_sequences: Vec::new(),
        }
    }

    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl ToString,
        documents: Vec<Vec<u8>>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.to_string(),
            documents,
        });
    }

    pub(crate) fn set_session_id(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // This serialization is infallible for the fixed shape of ClusterTime.
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) -> Result<()> {
        self.body
            .insert("$readPreference", read_preference.to_document()?);
        Ok(())
    }

    pub(crate) fn set_read_concern_level(&mut self, level: &crate::concern::ReadConcernLevel) {
        self.body
            .insert("readConcern", doc! { "level": level.as_str() });
    }

    pub(crate) fn set_after_cluster_time(&mut self, operation_time: &bson::Timestamp) {
        let read_concern = match self.body.get_document_mut("readConcern") {
            Ok(doc) => doc,
            Err(_) => {
                self.body.insert("readConcern", Document::new());
                // The entry was just inserted.
                match self.body.get_document_mut("readConcern") {
                    Ok(doc) => doc,
                    Err(_) => return,
                }
            }
        };
        read_concern.insert("afterClusterTime", Bson::Timestamp(*operation_time));
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) -> Result<()> {
        self.body
            .insert("writeConcern", write_concern.to_document()?);
        Ok(())
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    /// Whether this command carries a `maxTimeMS` honored server-side. A network timeout on such
    /// a command does not indicate an unhealthy server.
    pub(crate) fn has_max_time(&self) -> bool {
        self.body.contains_key("maxTimeMS")
    }

    pub(crate) fn is_hello(&self) -> bool {
        self.name == "hello"
            || self.name.to_lowercase() == crate::hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE
    }

    /// Whether the body of this command should be redacted from command monitoring events.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        matches!(
            name.as_str(),
            "authenticate" | "saslstart" | "saslcontinue" | "getnonce" | "createuser" | "updateuser"
        ) || (self.is_hello() && self.body.contains_key("speculativeAuthenticate"))
    }
}

/// A response to a command received from the server.
#[derive(Clone, Debug)]
pub(crate) struct CommandResponse {
    /// The address of the server that provided this response.
    pub(crate) source: ServerAddress,

    /// The decoded response body.
    pub(crate) raw_response: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Result<Self> {
        Ok(Self {
            raw_response: message.body_document()?,
            source,
        })
    }

    /// Whether this response indicates that the command succeeded (i.e. it contains `"ok": 1`).
    pub(crate) fn is_success(&self) -> bool {
        match self.raw_response.get("ok") {
            Some(b) => crate::bson_util::get_int(b) == Some(1),
            None => false,
        }
    }

    /// Returns the error the server replied with, if the command did not succeed.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }

        match bson::from_document::<CommandErrorBody>(self.raw_response.clone()) {
            Ok(command_error_body) => Err(Error::new(
                ErrorKind::Command(command_error_body.command_error),
                command_error_body.error_labels,
            )),
            Err(_) => Err(ErrorKind::InvalidResponse {
                message: "invalid server response".to_string(),
            }
            .into()),
        }
    }

    /// Deserialize the body of the response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        match bson::from_document(self.raw_response.clone()) {
            Ok(body) => Ok(body),
            Err(e) => Err(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            }
            .into()),
        }
    }

    /// The `$clusterTime` the server attached to this response, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw_response
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok())
    }

    /// The `operationTime` the server attached to this response, if any.
    pub(crate) fn operation_time(&self) -> Option<bson::Timestamp> {
        self.raw_response
            .get("operationTime")
            .and_then(Bson::as_timestamp)
    }

    /// The `recoveryToken` the server attached to this response, if any.
    pub(crate) fn recovery_token(&self) -> Option<Document> {
        self.raw_response.get_document("recoveryToken").ok().cloned()
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}
