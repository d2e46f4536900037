use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize, Derivative)]
#[derivative(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    // The signature is produced and verified by the server; it never participates in ordering.
    #[derivative(PartialEq = "ignore")]
    pub(crate) signature: Document,
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use bson::{doc, Timestamp};

    use super::ClusterTime;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! { "irrelevant": time },
        }
    }

    #[test]
    fn ordering_ignores_signature() {
        assert!(cluster_time(5, 1) < cluster_time(5, 2));
        assert!(cluster_time(5, 9) < cluster_time(6, 0));
        assert_eq!(cluster_time(5, 1), cluster_time(5, 1));
        assert_eq!(
            std::cmp::max(&cluster_time(7, 0), &cluster_time(5, 3)),
            &cluster_time(7, 0)
        );
    }
}
