//! Contains all of the types needed to specify the options of an operation or client.

pub use crate::{
    client::{
        auth::{AuthMechanism, Credential},
        options::*,
        session::{SessionOptions, TransactionOptions},
    },
    compression::Compressor,
    concern::*,
    operation::FindOptions,
    selection_criteria::*,
};
