//! Combines heterogeneous write models into the per-command batches the server accepts.

use bson::{doc, Document};

use crate::error::{ErrorKind, Result};

/// A single write to be performed as part of a bulk write.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert the given document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Update the first document matching `filter` using `update`.
    UpdateOne {
        /// The filter selecting the document to update.
        filter: Document,
        /// The modifications to apply; must contain only update operator expressions.
        update: Document,
        /// Whether to insert the document if no match is found.
        upsert: Option<bool>,
    },

    /// Update every document matching `filter` using `update`.
    UpdateMany {
        /// The filter selecting the documents to update.
        filter: Document,
        /// The modifications to apply; must contain only update operator expressions.
        update: Document,
        /// Whether to insert a document if no match is found.
        upsert: Option<bool>,
    },

    /// Replace the first document matching `filter` with `replacement`.
    ReplaceOne {
        /// The filter selecting the document to replace.
        filter: Document,
        /// The replacement document; must not contain update operator expressions.
        replacement: Document,
        /// Whether to insert the document if no match is found.
        upsert: Option<bool>,
    },

    /// Delete the first document matching `filter`.
    DeleteOne {
        /// The filter selecting the document to delete.
        filter: Document,
    },

    /// Delete every document matching `filter`.
    DeleteMany {
        /// The filter selecting the documents to delete.
        filter: Document,
    },
}

impl WriteModel {
    /// The name of the write command this model maps to.
    pub(crate) fn command_name(&self) -> &'static str {
        match self {
            Self::InsertOne { .. } => "insert",
            Self::UpdateOne { .. } | Self::UpdateMany { .. } | Self::ReplaceOne { .. } => "update",
            Self::DeleteOne { .. } | Self::DeleteMany { .. } => "delete",
        }
    }

    /// Converts this model into the document that appears in the corresponding command's
    /// payload array, validating its shape.
    fn to_entry(&self) -> Result<Document> {
        match self {
            Self::InsertOne { document } => Ok(document.clone()),
            Self::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                validate_update_document(update, true)?;
                Ok(update_entry(filter, update, *upsert, false))
            }
            Self::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                validate_update_document(update, true)?;
                Ok(update_entry(filter, update, *upsert, true))
            }
            Self::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                validate_update_document(replacement, false)?;
                Ok(update_entry(filter, replacement, *upsert, false))
            }
            Self::DeleteOne { filter } => Ok(doc! { "q": filter.clone(), "limit": 1 }),
            Self::DeleteMany { filter } => Ok(doc! { "q": filter.clone(), "limit": 0 }),
        }
    }
}

fn update_entry(filter: &Document, update: &Document, upsert: Option<bool>, multi: bool) -> Document {
    let mut entry = doc! { "q": filter.clone(), "u": update.clone() };
    if let Some(upsert) = upsert {
        entry.insert("upsert", upsert);
    }
    if multi {
        entry.insert("multi", true);
    }
    entry
}

/// Update documents must consist entirely of update operators; replacements must not contain
/// any.
fn validate_update_document(document: &Document, expect_operators: bool) -> Result<()> {
    let first_key_is_operator = document
        .keys()
        .next()
        .map(|k| k.starts_with('$'))
        .unwrap_or(expect_operators);

    if first_key_is_operator != expect_operators {
        let message = if expect_operators {
            "update document must only contain update modifiers"
        } else {
            "replacement document must not contain update modifiers"
        };
        return Err(ErrorKind::InvalidBulkOperation {
            message: message.to_string(),
        }
        .into());
    }

    Ok(())
}

/// A single batch of homogeneous writes, to be sent as one command.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteBatch {
    /// The name of the command ("insert", "update", or "delete").
    pub(crate) name: &'static str,

    /// The command's payload documents.
    pub(crate) documents: Vec<Document>,
}

/// Groups the given models into command batches.
///
/// For an ordered bulk write, only consecutive models of the same type are grouped so that the
/// user-specified order is preserved; for an unordered one, all models of the same type collapse
/// into as few batches as possible. Batches never exceed `max_batch_size` entries. Malformed
/// models fail the whole call before anything is produced.
pub(crate) fn write_batches(
    models: &[WriteModel],
    ordered: bool,
    max_batch_size: usize,
) -> Result<Vec<WriteBatch>> {
    if models.is_empty() {
        return Err(ErrorKind::InvalidBulkOperation {
            message: "bulk write requires at least one write".to_string(),
        }
        .into());
    }
    let max_batch_size = max_batch_size.max(1);

    // Validate everything up front so that a malformed entry cannot leave a partial bulk write
    // behind.
    let entries = models
        .iter()
        .map(|model| Ok((model.command_name(), model.to_entry()?)))
        .collect::<Result<Vec<_>>>()?;

    let mut batches: Vec<WriteBatch> = Vec::new();

    for (name, entry) in entries {
        let target = if ordered {
            // Only the trailing batch may be extended, and only if the command matches.
            batches
                .last_mut()
                .filter(|batch| batch.name == name && batch.documents.len() < max_batch_size)
        } else {
            batches
                .iter_mut()
                .find(|batch| batch.name == name && batch.documents.len() < max_batch_size)
        };

        match target {
            Some(batch) => batch.documents.push(entry),
            None => batches.push(WriteBatch {
                name,
                documents: vec![entry],
            }),
        }
    }

    Ok(batches)
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::{write_batches, WriteModel};

    fn insert(i: i32) -> WriteModel {
        WriteModel::InsertOne {
            document: doc! { "_id": i },
        }
    }

    fn delete(i: i32) -> WriteModel {
        WriteModel::DeleteOne {
            filter: doc! { "_id": i },
        }
    }

    #[test]
    fn ordered_batches_preserve_order() {
        let models = vec![insert(1), insert(2), delete(1), insert(3)];
        let batches = write_batches(&models, true, 1000).unwrap();

        assert_eq!(
            batches.iter().map(|b| b.name).collect::<Vec<_>>(),
            vec!["insert", "delete", "insert"]
        );
        assert_eq!(batches[0].documents.len(), 2);
        assert_eq!(batches[2].documents[0], doc! { "_id": 3 });
    }

    #[test]
    fn unordered_batches_coalesce() {
        let models = vec![insert(1), delete(1), insert(2), delete(2), insert(3)];
        let batches = write_batches(&models, false, 1000).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].name, "insert");
        assert_eq!(batches[0].documents.len(), 3);
        assert_eq!(batches[1].name, "delete");
        assert_eq!(batches[1].documents.len(), 2);
    }

    #[test]
    fn batches_split_at_max_size() {
        let models: Vec<_> = (0..5).map(insert).collect();
        let batches = write_batches(&models, true, 2).unwrap();
        assert_eq!(
            batches.iter().map(|b| b.documents.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[test]
    fn malformed_update_fails_the_whole_bulk() {
        let models = vec![
            insert(1),
            WriteModel::UpdateOne {
                filter: doc! {},
                // A replacement-style document is not a valid update.
                update: doc! { "x": 1 },
                upsert: None,
            },
        ];
        let err = write_batches(&models, true, 1000).unwrap_err();
        assert!(matches!(
            *err.kind,
            crate::error::ErrorKind::InvalidBulkOperation { .. }
        ));

        let replace_with_operators = vec![WriteModel::ReplaceOne {
            filter: doc! {},
            replacement: doc! { "$set": { "x": 1 } },
            upsert: None,
        }];
        assert!(write_batches(&replace_with_operators, true, 1000).is_err());
    }

    #[test]
    fn empty_bulk_is_rejected() {
        assert!(write_batches(&[], true, 1000).is_err());
    }

    #[test]
    fn update_entries_carry_flags() {
        let models = vec![WriteModel::UpdateMany {
            filter: doc! { "a": 1 },
            update: doc! { "$inc": { "a": 1 } },
            upsert: Some(true),
        }];
        let batches = write_batches(&models, true, 1000).unwrap();
        let entry = &batches[0].documents[0];
        assert!(entry.get_bool("multi").unwrap());
        assert!(entry.get_bool("upsert").unwrap());
    }
}
