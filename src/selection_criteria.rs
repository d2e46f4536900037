//! Contains the types related to specifying which servers are eligible for an operation.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bson::{doc, Document};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson_util::get_int,
    error::{Error, ErrorKind, Result},
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derivative(Debug = "ignore")] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }
}

/// A predicate used to filter servers.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver routes read operations in replica sets and sharded clusters.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Options of this read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Options of this read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Options of this read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Options of this read preference.
        options: ReadPreferenceOptions,
    },
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode_str())
    }
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none", alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[builder(default)]
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_secs",
        deserialize_with = "crate::serde_util::deserialize_duration_option_from_u64_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_ref()
                .map(|ts| ts.is_empty() || ts.iter().all(|t| t.is_empty()))
                .unwrap_or(true)
    }
}

impl ReadPreference {
    fn mode_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::Secondary { .. } => "secondary",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Creates a read preference from the `readPreference` and related URI options.
    pub(crate) fn from_mode_str(
        mode: &str,
        options: ReadPreferenceOptions,
    ) -> Result<Self> {
        let read_pref = match &mode.to_lowercase()[..] {
            "primary" => {
                if !options.is_default() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "primary read preference cannot be combined with tags or \
                                  maxStalenessSeconds"
                            .to_string(),
                    }
                    .into());
                }
                Self::Primary
            }
            "primarypreferred" => Self::PrimaryPreferred { options },
            "secondary" => Self::Secondary { options },
            "secondarypreferred" => Self::SecondaryPreferred { options },
            "nearest" => Self::Nearest { options },
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid read preference mode: {}", other),
                }
                .into())
            }
        };
        Ok(read_pref)
    }

    pub(crate) fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            Self::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary mode \
                              is specified"
                        .to_string(),
                }
                .into());
            }
            Self::Secondary { ref mut options } => options,
            Self::PrimaryPreferred { ref mut options } => options,
            Self::SecondaryPreferred { ref mut options } => options,
            Self::Nearest { ref mut options } => options,
        };

        options.tag_sets = Some(tag_sets);

        Ok(self)
    }

    pub(crate) fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            Self::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            Self::Secondary { ref mut options } => options,
            Self::PrimaryPreferred { ref mut options } => options,
            Self::SecondaryPreferred { ref mut options } => options,
            Self::Nearest { ref mut options } => options,
        };

        options.max_staleness = Some(max_staleness);

        Ok(self)
    }

    /// The `$readPreference` document sent to mongos or attached to commands for non-primary
    /// reads.
    pub(crate) fn to_document(&self) -> Result<Document> {
        let mut doc = doc! { "mode": self.mode_str() };

        if let Some(opts) = self.options() {
            if let Some(ref tag_sets) = opts.tag_sets {
                let tags: Vec<Document> = tag_sets
                    .iter()
                    .map(|tag_set| {
                        tag_set
                            .iter()
                            .map(|(k, v)| (k.to_string(), bson::Bson::String(v.to_string())))
                            .collect()
                    })
                    .collect();
                doc.insert("tags", tags);
            }

            if let Some(max_staleness) = opts.max_staleness {
                let staleness_seconds = i64::try_from(max_staleness.as_secs())
                    .map_err(|_| Error::invalid_argument("maxStalenessSeconds out of range"))?;
                doc.insert("maxStalenessSeconds", staleness_seconds);
            }
        }

        Ok(doc)
    }

    /// Parses a `$readPreference` document of the form produced by `to_document`.
    #[cfg(test)]
    pub(crate) fn from_document(mut doc: Document) -> Result<Self> {
        let mode = doc
            .remove("mode")
            .and_then(|mode| match mode {
                bson::Bson::String(s) => Some(s),
                _ => None,
            })
            .ok_or_else(|| Error::invalid_argument("$readPreference must contain a string mode"))?;

        let mut options = ReadPreferenceOptions::default();
        if let Ok(tags) = doc.get_array("tags") {
            let tag_sets = tags
                .iter()
                .filter_map(|tag_set| tag_set.as_document())
                .map(|tag_set| {
                    tag_set
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .collect();
            options.tag_sets = Some(tag_sets);
        }
        if let Some(staleness) = doc.get("maxStalenessSeconds").and_then(get_int) {
            options.max_staleness = Some(Duration::from_secs(staleness as u64));
        }

        Self::from_mode_str(mode.as_str(), options)
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ReadPreference, ReadPreferenceOptions};

    #[test]
    fn primary_rejects_options() {
        assert!(ReadPreference::from_mode_str(
            "primary",
            ReadPreferenceOptions::builder()
                .max_staleness(Some(Duration::from_secs(100)))
                .build(),
        )
        .is_err());

        assert!(ReadPreference::Primary
            .with_tags(vec![maplit_tag_set(&[("dc", "ny")])])
            .is_err());
    }

    #[test]
    fn read_pref_document_round_trip() {
        let pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(Some(vec![maplit_tag_set(&[("dc", "ny"), ("rack", "1")])]))
                .max_staleness(Some(Duration::from_secs(120)))
                .build(),
        };

        let doc = pref.to_document().unwrap();
        assert_eq!(doc.get_str("mode").unwrap(), "secondary");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 120);

        let parsed = ReadPreference::from_document(doc).unwrap();
        assert_eq!(parsed, pref);
    }

    fn maplit_tag_set(tags: &[(&str, &str)]) -> super::TagSet {
        tags.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
