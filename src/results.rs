//! Contains the types of results returned by operations.

use std::collections::HashMap;

use bson::{Bson, Document};
use serde::Deserialize;

/// The initial batch of a cursor established by a query, along with the information needed to
/// continue iterating it.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CursorBatch {
    /// The id of the cursor on the server; 0 if the cursor was exhausted by the first batch.
    pub id: i64,

    /// The namespace the cursor belongs to.
    pub ns: String,

    /// The documents in this batch.
    #[serde(rename = "firstBatch")]
    pub first_batch: Vec<Document>,
}

/// The result of an insert operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the original input.
    pub inserted_ids: HashMap<usize, Bson>,
}
