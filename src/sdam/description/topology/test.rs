use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{oid::ObjectId, DateTime};
use pretty_assertions::assert_eq;

use super::{server_selection::attempt_to_select_server, TopologyDescription, TopologyType};
use crate::{
    error::{Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply, LastWrite},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        Server,
    },
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria},
};

fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn hello_response(server_type: ServerType) -> HelloCommandResponse {
    let mut response = HelloCommandResponse {
        min_wire_version: Some(6),
        max_wire_version: Some(17),
        logical_session_timeout_minutes: Some(30),
        ..Default::default()
    };

    match server_type {
        ServerType::Standalone => {
            response.is_writable_primary = Some(true);
        }
        ServerType::Mongos => {
            response.msg = Some("isdbgrid".to_string());
        }
        ServerType::RsPrimary => {
            response.set_name = Some("rs0".to_string());
            response.is_writable_primary = Some(true);
        }
        ServerType::RsSecondary => {
            response.set_name = Some("rs0".to_string());
            response.secondary = Some(true);
        }
        ServerType::RsArbiter => {
            response.set_name = Some("rs0".to_string());
            response.arbiter_only = Some(true);
        }
        _ => {}
    }

    response
}

struct DescriptionBuilder {
    address: ServerAddress,
    response: HelloCommandResponse,
    rtt: Duration,
}

impl DescriptionBuilder {
    fn new(address: ServerAddress, server_type: ServerType) -> Self {
        Self {
            address,
            response: hello_response(server_type),
            rtt: Duration::from_millis(5),
        }
    }

    fn hosts(mut self, hosts: &[&ServerAddress]) -> Self {
        self.response.hosts = Some(hosts.iter().map(|a| a.to_string()).collect());
        self
    }

    fn election_id(mut self, election_id: ObjectId) -> Self {
        self.response.election_id = Some(election_id);
        self
    }

    fn set_version(mut self, set_version: i32) -> Self {
        self.response.set_version = Some(set_version);
        self
    }

    fn topology_version(mut self, process_id: ObjectId, counter: i64) -> Self {
        self.response.topology_version = Some(crate::sdam::TopologyVersion {
            process_id,
            counter,
        });
        self
    }

    fn last_write(mut self, last_write_date: DateTime) -> Self {
        self.response.last_write = Some(LastWrite { last_write_date });
        self
    }

    fn tag(mut self, key: &str, value: &str) -> Self {
        self.response
            .tags
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    fn rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    fn build(self) -> ServerDescription {
        let reply = HelloReply {
            server_address: self.address.clone(),
            command_response: self.response,
            raw_command_response: Default::default(),
            cluster_time: None,
        };
        ServerDescription::new_from_hello_reply(self.address, reply, self.rtt)
    }
}

fn seeded_topology(seeds: &[&ServerAddress]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(seeds.iter().map(|&a| a.clone()).collect::<Vec<_>>())
        .build();
    let mut description = TopologyDescription::default();
    description.initialize(&options);
    description
}

#[test]
fn standalone_discovered_from_single_seed() {
    let a = addr("a:27017");
    let mut topology = seeded_topology(&[&a]);

    topology
        .update(DescriptionBuilder::new(a.clone(), ServerType::Standalone).build())
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::Single);
    assert_eq!(topology.servers.len(), 1);
}

#[test]
fn standalone_removed_from_multi_seed_topology() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let mut topology = seeded_topology(&[&a, &b]);

    topology
        .update(DescriptionBuilder::new(a.clone(), ServerType::Standalone).build())
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::Unknown);
    assert!(!topology.servers.contains_key(&a));
    assert!(topology.servers.contains_key(&b));
}

#[test]
fn mongos_transitions_to_sharded_and_evicts_non_mongos() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let mut topology = seeded_topology(&[&a, &b]);

    topology
        .update(DescriptionBuilder::new(a.clone(), ServerType::Mongos).build())
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Sharded);

    // A replica set member has no business in a sharded topology.
    topology
        .update(DescriptionBuilder::new(b.clone(), ServerType::RsPrimary).build())
        .unwrap();
    assert!(!topology.servers.contains_key(&b));
}

#[test]
fn primary_discovery_absorbs_host_list() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let c = addr("c:27017");
    let mut topology = seeded_topology(&[&a]);

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b, &c])
                .set_version(1)
                .election_id(ObjectId::new())
                .build(),
        )
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.servers.len(), 3);
    assert_eq!(topology.set_name.as_deref(), Some("rs0"));
    assert!(topology.servers.contains_key(&b));
    assert!(topology.servers.contains_key(&c));
}

// Scenario: the primary goes away, then another member reports itself primary with a higher
// election id.
#[test]
fn primary_failover() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let c = addr("c:27017");
    let mut topology = seeded_topology(&[&a]);

    let e1 = ObjectId::new();
    let e2 = ObjectId::new();
    assert!(e1 < e2);

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b, &c])
                .set_version(5)
                .election_id(e1)
                .build(),
        )
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

    // The primary's heartbeat fails.
    topology
        .update(ServerDescription::new_from_error(
            a.clone(),
            ErrorKind::from(std::io::ErrorKind::ConnectionReset).into(),
        ))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert!(topology.servers.get(&a).unwrap().error().is_some());

    // B gets elected with a higher election id.
    topology
        .update(
            DescriptionBuilder::new(b.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b, &c])
                .set_version(5)
                .election_id(e2)
                .build(),
        )
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(
        topology.servers.get(&b).unwrap().server_type,
        ServerType::RsPrimary
    );
}

// Scenario: a stale former primary reports itself primary with an older election id and must
// not displace the current one.
#[test]
fn stale_primary_rejected() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let mut topology = seeded_topology(&[&a, &b]);

    let e1 = ObjectId::new();
    let e2 = ObjectId::new();

    topology
        .update(
            DescriptionBuilder::new(b.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b])
                .set_version(5)
                .election_id(e2)
                .build(),
        )
        .unwrap();

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b])
                .set_version(5)
                .election_id(e1)
                .build(),
        )
        .unwrap();

    // A is coerced back to Unknown; B remains the primary.
    assert_eq!(
        topology.servers.get(&a).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.servers.get(&b).unwrap().server_type,
        ServerType::RsPrimary
    );
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.max_election_id, Some(e2));
}

#[test]
fn primary_host_list_removes_absent_members() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let c = addr("c:27017");
    let mut topology = seeded_topology(&[&a, &b, &c]);

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a, &b])
                .build(),
        )
        .unwrap();

    assert!(topology.servers.contains_key(&a));
    assert!(topology.servers.contains_key(&b));
    assert!(!topology.servers.contains_key(&c));
}

// Scenario: two awaited replies from the same server process arrive out of order; the lower
// counter must not supersede the higher one.
#[test]
fn stale_topology_version_is_dropped() {
    let a = addr("a:27017");
    let mut topology = seeded_topology(&[&a]);
    let process_id = ObjectId::new();

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a])
                .topology_version(process_id, 7)
                .build(),
        )
        .unwrap();

    let before = topology.clone();

    // The delayed counter=6 reply arrives after counter=7 was applied.
    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsSecondary)
                .hosts(&[&a])
                .topology_version(process_id, 6)
                .build(),
        )
        .unwrap();

    assert_eq!(topology, before);
    assert!(topology.diff(&before).is_none());
}

#[test]
fn newer_topology_version_is_applied() {
    let a = addr("a:27017");
    let mut topology = seeded_topology(&[&a]);
    let process_id = ObjectId::new();

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                .hosts(&[&a])
                .topology_version(process_id, 6)
                .build(),
        )
        .unwrap();

    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsSecondary)
                .hosts(&[&a])
                .topology_version(process_id, 7)
                .build(),
        )
        .unwrap();

    assert_eq!(
        topology.servers.get(&a).unwrap().server_type,
        ServerType::RsSecondary
    );
}

#[test]
fn session_timeout_is_min_across_data_bearing_servers() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let arb = addr("arb:27017");
    let mut topology = seeded_topology(&[&a, &b, &arb]);

    let mut primary = DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
        .hosts(&[&a, &b, &arb]);
    primary.response.logical_session_timeout_minutes = Some(30);
    topology.update(primary.build()).unwrap();

    let mut secondary = DescriptionBuilder::new(b.clone(), ServerType::RsSecondary)
        .hosts(&[&a, &b, &arb]);
    secondary.response.logical_session_timeout_minutes = Some(20);
    topology.update(secondary.build()).unwrap();

    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );

    // Arbiters are not data-bearing, so their lack of a timeout is irrelevant.
    let mut arbiter = DescriptionBuilder::new(arb.clone(), ServerType::RsArbiter)
        .hosts(&[&a, &b, &arb]);
    arbiter.response.logical_session_timeout_minutes = None;
    topology.update(arbiter.build()).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );

    // A data-bearing server without a timeout disables sessions entirely.
    let mut no_timeout = DescriptionBuilder::new(b.clone(), ServerType::RsSecondary)
        .hosts(&[&a, &b, &arb]);
    no_timeout.response.logical_session_timeout_minutes = None;
    topology.update(no_timeout.build()).unwrap();
    assert_eq!(topology.logical_session_timeout, None);
}

#[test]
fn wire_version_incompatibility_is_reported() {
    let a = addr("a:27017");
    let mut topology = seeded_topology(&[&a]);

    let mut old_server = DescriptionBuilder::new(a.clone(), ServerType::Standalone);
    old_server.response.max_wire_version = Some(4);
    old_server.response.min_wire_version = Some(2);
    topology.update(old_server.build()).unwrap();

    let error_message = topology.compatibility_error.clone().unwrap();
    assert!(error_message.contains("wire version"), "{}", error_message);

    // An incompatible topology fails selection outright.
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let err = topology
        .suitable_servers_in_latency_window(&criteria)
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::IncompatibleServer { .. }));
}

#[test]
fn replica_set_name_mismatch_removes_server() {
    let a = addr("a:27017");
    let b = addr("b:27017");
    let options = ClientOptions::builder()
        .hosts(vec![a.clone(), b.clone()])
        .repl_set_name(Some("expected".to_string()))
        .build();
    let mut topology = TopologyDescription::default();
    topology.initialize(&options);
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

    // The member reports set name "rs0" rather than "expected".
    topology
        .update(
            DescriptionBuilder::new(a.clone(), ServerType::RsSecondary)
                .hosts(&[&a, &b])
                .build(),
        )
        .unwrap();

    assert!(!topology.servers.contains_key(&a));
}

mod selection {
    use super::*;
    use pretty_assertions::assert_eq;

    fn servers_for(topology: &TopologyDescription) -> HashMap<ServerAddress, Arc<Server>> {
        topology
            .servers
            .keys()
            .map(|address| (address.clone(), Server::new_mocked(address.clone())))
            .collect()
    }

    fn nearest() -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Nearest {
            options: Default::default(),
        })
    }

    /// A replica set with primary A and secondaries B, C with the given RTTs.
    fn replica_set_with_rtts(rtts: [Duration; 3]) -> (TopologyDescription, [ServerAddress; 3]) {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let c = addr("c:27017");
        let mut topology = seeded_topology(&[&a, &b, &c]);

        let now = DateTime::now();
        topology
            .update(
                DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                    .hosts(&[&a, &b, &c])
                    .rtt(rtts[0])
                    .last_write(now)
                    .build(),
            )
            .unwrap();
        for (address, rtt) in [(b.clone(), rtts[1]), (c.clone(), rtts[2])] {
            topology
                .update(
                    DescriptionBuilder::new(address, ServerType::RsSecondary)
                        .hosts(&[&a, &b, &c])
                        .rtt(rtt)
                        .last_write(now)
                        .build(),
                )
                .unwrap();
        }
        (topology, [a, b, c])
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        // RTTs of 5ms, 7ms and 40ms with the default 15ms local threshold: only the first two
        // fall within the window.
        let (topology, [a, b, c]) = replica_set_with_rtts([
            Duration::from_millis(5),
            Duration::from_millis(7),
            Duration::from_millis(40),
        ]);

        let criteria = nearest();
        let in_window = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();

        let addresses: Vec<&ServerAddress> = in_window.iter().map(|s| &s.address).collect();
        assert_eq!(addresses.len(), 2);
        assert!(addresses.contains(&&a));
        assert!(addresses.contains(&&b));
        assert!(!addresses.contains(&&c));

        // Repeated selections only ever produce servers from within the window.
        let servers = servers_for(&topology);
        for _ in 0..20 {
            let selected = attempt_to_select_server(&criteria, &topology, &servers)
                .unwrap()
                .unwrap();
            assert_ne!(selected.address, c);
        }
    }

    #[test]
    fn max_staleness_below_minimum_is_rejected() {
        let (topology, _) = replica_set_with_rtts([
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Some(Duration::from_secs(30)))
                .build(),
        });

        let err: Error = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));

        // At or above the 90 second floor the filter is accepted.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Some(Duration::from_secs(120)))
                .build(),
        });
        assert!(topology.suitable_servers_in_latency_window(&criteria).is_ok());
    }

    #[test]
    fn tag_sets_filter_in_order() {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let mut topology = seeded_topology(&[&a, &b]);

        let now = DateTime::now();
        topology
            .update(
                DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                    .hosts(&[&a, &b])
                    .last_write(now)
                    .build(),
            )
            .unwrap();
        topology
            .update(
                DescriptionBuilder::new(b.clone(), ServerType::RsSecondary)
                    .hosts(&[&a, &b])
                    .tag("dc", "ny")
                    .last_write(now)
                    .build(),
            )
            .unwrap();

        // The first tag set matches nothing; the second matches the secondary.
        let tag_sets = vec![
            [("dc".to_string(), "sf".to_string())].into_iter().collect(),
            [("dc".to_string(), "ny".to_string())].into_iter().collect(),
        ];
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder().tag_sets(Some(tag_sets)).build(),
        });

        let suitable = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].address, b);

        // No matching tag set leaves nothing eligible.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(Some(vec![[("dc".to_string(), "sf".to_string())]
                    .into_iter()
                    .collect()]))
                .build(),
        });
        assert!(topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let a = addr("a:27017");
        let mut topology = seeded_topology(&[&a]);
        topology
            .update(
                DescriptionBuilder::new(a.clone(), ServerType::RsPrimary)
                    .hosts(&[&a])
                    .build(),
            )
            .unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: Default::default(),
        });
        let suitable = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].server_type, ServerType::RsPrimary);
    }

    #[test]
    fn unknown_topology_has_no_suitable_servers() {
        let a = addr("a:27017");
        let topology = seeded_topology(&[&a]);
        let servers = servers_for(&topology);

        let selected = attempt_to_select_server(&nearest(), &topology, &servers).unwrap();
        assert!(selected.is_none());
    }
}
