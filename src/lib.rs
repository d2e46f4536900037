//! This crate contains the deployment-facing core of a MongoDB driver: server
//! discovery and monitoring (SDAM), connection pooling (CMAP), and operation
//! execution with retryable reads and writes. It follows the
//! [MongoDB driver specifications](https://github.com/mongodb/specifications)
//! for those subsystems.
//!
//! To connect to a deployment, parse a connection string into
//! [`ClientOptions`](options::ClientOptions) and construct a [`Client`]:
//!
//! ```no_run
//! # use mongodb_core::{Client, error::Result, options::ClientOptions};
//! # async fn connect() -> Result<Client> {
//! let options = ClientOptions::parse("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let client = Client::with_options(options)?;
//! # Ok(client)
//! # }
//! ```
//!
//! The `Client` tracks the deployment topology in the background; commands can
//! be issued immediately and will wait for a suitable server to be discovered,
//! bounded by `serverSelectionTimeoutMS`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
extern crate derivative;

mod bson_util;
mod client;
mod cmap;
mod compression;
pub mod concern;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod options;
pub mod results;
mod runtime;
mod sdam;
mod serde_util;
#[cfg(test)]
mod test;
pub mod selection_criteria;
#[cfg(feature = "tracing-unstable")]
pub mod trace;

pub use bson;

pub use crate::{
    client::{session::ClientSession, Client, WriteModel},
    sdam::public::{ServerInfo, ServerType, TopologyType},
};

pub(crate) use crate::client::session::ClusterTime;
