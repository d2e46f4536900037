use std::time::Duration;

use serde::Deserialize;

use crate::{bson_util, options::ClientOptions};

/// Contains the options for creating a connection pool.
#[derive(Clone, Default, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectionPoolOptions {
    /// The amount of time a connection can remain idle in the pool before being closed.
    #[serde(
        rename = "maxIdleTimeMS",
        default,
        deserialize_with = "bson_util::deserialize_duration_option_from_u64_millis"
    )]
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time, including
    /// connections which are currently checked out of the pool.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time.
    pub(crate) min_pool_size: Option<u32>,

    /// Whether the pool is in load-balanced mode.
    #[serde(skip)]
    pub(crate) load_balanced: Option<bool>,

    /// The amount of time a checkout request may wait for a connection to become available.
    #[serde(skip)]
    pub(crate) wait_queue_timeout: Option<Duration>,

    /// Interval between background maintenance passes; configurable in tests only.
    #[serde(rename = "backgroundThreadIntervalMS")]
    pub(crate) maintenance_frequency_ms: Option<u64>,

    /// Whether the pool should be created in the ready state rather than paused; used in tests.
    #[serde(skip)]
    pub(crate) ready: Option<bool>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            load_balanced: options.load_balanced,
            wait_queue_timeout: options
                .wait_queue_timeout
                .or(options.server_selection_timeout),
            maintenance_frequency_ms: None,
            ready: None,
        }
    }
}
