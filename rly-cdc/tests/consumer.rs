//! End-to-end behavior of the consumer against in-process clusters.

#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use rly_cdc::{
    BadRecordPolicy, CdcConsumer, CheckpointStore, ConsumerConfig, ConsumerDeps, ConsumerRegistry,
    MemoryCheckpointStore, PollerState, ProducerEntry, RefreshOutcome, StreamEntry,
};
use rly_client::{MemoryClientFactory, MemoryCluster};
use rly_core::{ChangeRecord, ColumnValue, HlcTimestamp, OpId, ProducerTabletInfo};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TRIGGER: Duration = Duration::from_millis(50);
const POLL: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(10);

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn ts(ms: u64) -> HlcTimestamp {
    HlcTimestamp::new(ms, 0)
}

fn write(index: u64, key: &str, version: u32, value: &str) -> ChangeRecord {
    ChangeRecord::write(
        OpId::new(1, index),
        key.to_string(),
        vec![ColumnValue::new(1, version, value.to_string())],
        ts(1_000 + index),
    )
}

/// Leader set shared with the consumer's leadership callback.
#[derive(Clone, Default)]
struct Leaders(Arc<Mutex<HashSet<String>>>);

impl Leaders {
    fn of(tablets: &[&str]) -> Self {
        let leaders = Self::default();
        for tablet in tablets {
            leaders.grant(tablet);
        }
        leaders
    }

    fn grant(&self, tablet: &str) {
        self.0.lock().unwrap().insert(tablet.to_string());
    }

    fn revoke(&self, tablet: &str) {
        self.0.lock().unwrap().remove(tablet);
    }

    fn is_leader(&self, tablet: &str) -> bool {
        self.0.lock().unwrap().contains(tablet)
    }
}

struct Harness {
    producer: Arc<MemoryCluster>,
    local: Arc<MemoryCluster>,
    factory: Arc<MemoryClientFactory>,
    leaders: Leaders,
    checkpoints: Arc<MemoryCheckpointStore>,
    consumer: CdcConsumer,
}

impl Harness {
    fn new(leaders: Leaders) -> Self {
        Self::with_config(leaders, default_config())
    }

    fn with_config(leaders: Leaders, config: ConsumerConfig) -> Self {
        let producer = MemoryCluster::new("pc1");
        let local = MemoryCluster::new("local");
        let factory = MemoryClientFactory::new();
        factory.register(&producer, &["host1:9100"]);
        factory.register(&local, &["local:7100"]);
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let callback = leaders.clone();
        let deps = ConsumerDeps::new(
            factory.clone(),
            Arc::new(move |tablet: &str| callback.is_leader(tablet)),
            vec!["local:7100".into()],
        )
        .with_checkpoint_store(checkpoints.clone());
        let consumer = CdcConsumer::create(config, deps).unwrap();

        Self {
            producer,
            local,
            factory,
            leaders,
            checkpoints,
            consumer,
        }
    }

    fn pollers(&self) -> Vec<String> {
        self.consumer.list_active_poller_tablet_ids()
    }

    fn wait_for_pollers(&self, expected: &[&str]) -> bool {
        let expected: Vec<String> = expected.iter().map(|s| (*s).to_string()).collect();
        wait_until(WAIT, || self.pollers() == expected)
    }
}

fn default_config() -> ConsumerConfig {
    ConsumerConfig::new()
        .with_trigger_interval(TRIGGER)
        .with_poll_delay(POLL)
        .with_worker_threads(4)
}

/// `pc1/s1`, consumer table `tb1`, with the given `(consumer, producer)` tablet pairs.
fn registry(tablets: &[(&str, &str)]) -> ConsumerRegistry {
    let stream = tablets
        .iter()
        .fold(StreamEntry::new("tb1").with_schema_version(6, 1), |s, (ct, pt)| {
            s.with_tablet(*ct, [*pt])
        });
    ConsumerRegistry::new().with_producer(
        "pc1",
        ProducerEntry::new(["host1:9100"]).with_stream("s1", stream),
    )
}

fn key(tablet: &str) -> ProducerTabletInfo {
    ProducerTabletInfo::new("pc1", "s1", tablet)
}

#[test]
fn scenario_a_one_poller_and_one_client() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", [write(1, "a", 6, "x")]);

    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(h.wait_for_pollers(&["pt1"]));
    assert_eq!(h.consumer.remote_cluster_ids(), vec!["pc1".to_string()]);
    assert_eq!(h.producer.open_clients(), 1);
    assert!(wait_until(WAIT, || h.local.read("ct1", b"a").is_some()));

    // more passes never add a second poller or client
    std::thread::sleep(TRIGGER * 3);
    assert_eq!(h.pollers(), vec!["pt1".to_string()]);
    assert_eq!(h.producer.open_clients(), 1);
}

#[test]
fn scenario_b_removed_mapping_stops_poller_and_client() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", std::iter::empty());
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);
    assert!(h.wait_for_pollers(&["pt1"]));

    h.consumer
        .refresh_with_new_registry_from_master(Some(&ConsumerRegistry::new()), 2);

    assert!(h.wait_for_pollers(&[]));
    assert!(wait_until(WAIT, || h.consumer.remote_cluster_ids().is_empty()));
    assert_eq!(h.producer.open_clients(), 0);
}

#[test]
fn scenario_c_out_of_order_registry_versions() {
    let h = Harness::new(Leaders::of(&["ct1", "ct3"]));
    h.producer.append("s1", "pt5", std::iter::empty());
    h.producer.append("s1", "pt3", std::iter::empty());

    let newer = h
        .consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt5")])), 5);
    let older = h
        .consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct3", "pt3")])), 3);

    assert!(newer.is_applied());
    assert_eq!(older, RefreshOutcome::Stale { version: 3, current: 5 });
    assert_eq!(h.consumer.registry_version(), Some(5));
    assert!(h.wait_for_pollers(&["pt5"]));
    std::thread::sleep(TRIGGER * 3);
    assert_eq!(h.pollers(), vec!["pt5".to_string()]);
}

#[test]
fn scenario_d_schema_mismatch_retries_same_records() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer
        .append("s1", "pt1", [write(1, "a", 6, "x"), write(2, "b", 7, "y")]);
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.producer.fetch_count("pt1") >= 3));
    assert_eq!(h.local.row_count("ct1"), 0);
    let poller = h.consumer.active_pollers().pop().unwrap();
    assert_eq!(poller.last_processed, OpId::MIN);
    assert_eq!(h.checkpoints.load(&key("pt1")).unwrap(), None);

    let fixed = ConsumerRegistry::new().with_producer(
        "pc1",
        ProducerEntry::new(["host1:9100"]).with_stream(
            "s1",
            StreamEntry::new("tb1")
                .with_tablet("ct1", ["pt1"])
                .with_schema_version(6, 1)
                .with_schema_version(7, 2),
        ),
    );
    h.consumer.refresh_with_new_registry_from_master(Some(&fixed), 2);

    assert!(wait_until(WAIT, || h.local.row_count("ct1") == 2));
    assert_eq!(h.local.read("ct1", b"b").unwrap()[0].schema_version, 2);
    assert!(wait_until(WAIT, || {
        h.checkpoints.load(&key("pt1")).unwrap() == Some(OpId::new(1, 2))
    }));
}

#[test]
fn scenario_e_slow_tablet_does_not_delay_others() {
    let config = default_config().with_rpc_timeout(Duration::from_secs(60));
    let h = Harness::with_config(Leaders::of(&["ct1", "ct2"]), config);
    h.producer.append("s1", "pt1", std::iter::empty());
    h.producer.append("s1", "pt2", std::iter::empty());
    h.producer.set_fetch_delay("pt1", Duration::from_secs(30));

    h.consumer.refresh_with_new_registry_from_master(
        Some(&registry(&[("ct1", "pt1"), ("ct2", "pt2")])),
        1,
    );
    assert!(h.wait_for_pollers(&["pt1", "pt2"]));

    assert!(wait_until(WAIT, || h.producer.fetch_count("pt2") >= 10));
    assert!(h.producer.fetch_count("pt1") <= 1);
    let slow = h
        .consumer
        .active_pollers()
        .into_iter()
        .find(|p| p.producer.producer_tablet_id == "pt1")
        .unwrap();
    assert_eq!(slow.state, PollerState::Fetching);
}

#[test]
fn concurrent_triggers_start_one_poller_per_tablet() {
    // a long period keeps the background loop out of the way
    let config = default_config().with_trigger_interval(Duration::from_secs(30));
    let h = Harness::with_config(Leaders::default(), config);
    let tablets = [("ct1", "pt1"), ("ct2", "pt2"), ("ct3", "pt3")];
    for (_, pt) in tablets {
        h.producer.append("s1", pt, std::iter::empty());
    }
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&tablets)), 1);
    // let the woken background pass run while nothing is led
    std::thread::sleep(Duration::from_millis(200));
    assert!(h.pollers().is_empty());
    for (ct, _) in tablets {
        h.leaders.grant(ct);
    }

    let consumer = &h.consumer;
    let started: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| (0..20).map(|_| consumer.trigger_poll_for_new_tablets()).sum::<usize>()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(started, 3);
    assert_eq!(h.pollers(), vec!["pt1", "pt2", "pt3"]);
    assert_eq!(h.producer.open_clients(), 1);
}

#[test]
fn client_kept_while_any_poller_or_registry_references_it() {
    let h = Harness::new(Leaders::of(&["ct1", "ct2"]));
    h.producer.append("s1", "pt1", std::iter::empty());
    h.producer.append("s1", "pt2", std::iter::empty());
    h.consumer.refresh_with_new_registry_from_master(
        Some(&registry(&[("ct1", "pt1"), ("ct2", "pt2")])),
        1,
    );
    assert!(h.wait_for_pollers(&["pt1", "pt2"]));

    // pc1 is still listed: the client survives losing a poller
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct2", "pt2")])), 2);
    assert!(h.wait_for_pollers(&["pt2"]));
    std::thread::sleep(TRIGGER * 3);
    assert_eq!(h.consumer.remote_cluster_ids(), vec!["pc1".to_string()]);

    // listed, but no poller left: still kept
    h.leaders.revoke("ct2");
    assert!(h.wait_for_pollers(&[]));
    std::thread::sleep(TRIGGER * 3);
    assert_eq!(h.consumer.remote_cluster_ids(), vec!["pc1".to_string()]);

    // neither: removed within a trigger period
    h.consumer.refresh_with_new_registry_from_master(None, 3);
    assert!(wait_until(TRIGGER * 20, || h
        .consumer
        .remote_cluster_ids()
        .is_empty()));
    assert_eq!(h.producer.open_clients(), 0);
}

#[test]
fn records_apply_in_producer_order_across_cycles() {
    let config = default_config().with_max_records_per_fetch(3);
    let h = Harness::with_config(Leaders::of(&["ct1"]), config);
    let records: Vec<ChangeRecord> = (1..=20)
        .map(|i| write(i, &format!("k{}", i % 4), 6, &i.to_string()))
        .collect();
    let expected: Vec<Bytes> = records.iter().map(|r| r.key.clone()).collect();
    h.producer.append("s1", "pt1", records);

    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.local.applied_keys("ct1").len() >= 20));
    assert_eq!(h.local.applied_keys("ct1"), expected);
    assert_eq!(
        h.local.read("ct1", b"k0").unwrap()[0].value,
        Bytes::from("20")
    );
    assert!(h.local.write_batches() >= 7);
}

#[test]
fn leadership_loss_stops_polling_until_regained() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", [write(1, "a", 6, "1"), write(2, "b", 6, "2")]);
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);
    assert!(wait_until(WAIT, || h.local.row_count("ct1") == 2));

    h.leaders.revoke("ct1");
    assert!(h.wait_for_pollers(&[]));
    let fetches = h.producer.fetch_count("pt1");
    h.producer.append("s1", "pt1", [write(3, "c", 6, "3")]);
    std::thread::sleep(TRIGGER * 4);
    assert!(h.pollers().is_empty());
    assert_eq!(h.producer.fetch_count("pt1"), fetches);
    assert!(h.local.read("ct1", b"c").is_none());

    h.leaders.grant("ct1");
    assert!(h.wait_for_pollers(&["pt1"]));
    assert!(wait_until(WAIT, || h.local.read("ct1", b"c").is_some()));
    // resumed from the checkpoint: nothing was applied twice
    assert_eq!(h.local.applied_keys("ct1").len(), 3);
}

#[test]
fn skip_policy_steps_over_malformed_record() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append(
        "s1",
        "pt1",
        [
            write(1, "a", 6, "1"),
            ChangeRecord::write(OpId::new(1, 2), Bytes::new(), vec![], ts(1_002)),
            write(3, "c", 6, "3"),
        ],
    );
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.local.read("ct1", b"c").is_some()));
    assert!(wait_until(WAIT, || {
        h.checkpoints.load(&key("pt1")).unwrap() == Some(OpId::new(1, 3))
    }));
}

#[test]
fn halt_policy_stops_at_malformed_record() {
    let config = default_config().with_bad_record_policy(BadRecordPolicy::Halt);
    let h = Harness::with_config(Leaders::of(&["ct1"]), config);
    h.producer.append(
        "s1",
        "pt1",
        [
            write(1, "a", 6, "1"),
            ChangeRecord::delete(OpId::new(1, 2), Bytes::new(), ts(1_002)),
            write(3, "c", 6, "3"),
        ],
    );
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.local.read("ct1", b"a").is_some()));
    let fetches = h.producer.fetch_count("pt1");
    assert!(wait_until(WAIT, || h.producer.fetch_count("pt1") >= fetches + 3));

    assert!(h.local.read("ct1", b"c").is_none());
    assert_eq!(h.checkpoints.load(&key("pt1")).unwrap(), Some(OpId::new(1, 1)));
    // halted, not stopped
    assert_eq!(h.pollers(), vec!["pt1".to_string()]);
}

#[test]
fn transient_fetch_and_write_failures_are_retried() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", [write(1, "a", 6, "1")]);
    h.producer.fail_next_fetches("pt1", 3);
    h.local.fail_next_writes(2);

    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.local.read("ct1", b"a").is_some()));
    // injected fetch failures never reach the log; each failed write costs a refetch
    assert!(h.producer.fetch_count("pt1") >= 3);
    assert_eq!(h.local.version_count("ct1", b"a"), 1);
}

#[test]
fn connect_and_configuration_errors_are_retried() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", std::iter::empty());

    let no_endpoints = ConsumerRegistry::new().with_producer(
        "pc1",
        ProducerEntry::default()
            .with_stream("s1", StreamEntry::new("tb1").with_tablet("ct1", ["pt1"])),
    );
    h.consumer
        .refresh_with_new_registry_from_master(Some(&no_endpoints), 1);
    std::thread::sleep(TRIGGER * 4);
    assert!(h.pollers().is_empty());
    assert!(h.consumer.remote_cluster_ids().is_empty());

    h.factory.fail_next_builds(2);
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 2);
    assert!(h.wait_for_pollers(&["pt1"]));
    assert_eq!(h.producer.open_clients(), 1);
}

#[test]
fn shutdown_unblocks_in_flight_fetch() {
    let config = default_config().with_rpc_timeout(Duration::from_secs(120));
    let h = Harness::with_config(Leaders::of(&["ct1"]), config);
    h.producer.append("s1", "pt1", std::iter::empty());
    h.producer.set_fetch_delay("pt1", Duration::from_secs(60));
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);
    assert!(wait_until(WAIT, || {
        h.consumer
            .active_pollers()
            .iter()
            .any(|p| p.state == PollerState::Fetching)
    }));

    let started = Instant::now();
    h.consumer.shutdown();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(h.pollers().is_empty());
    assert_eq!(h.producer.open_clients(), 0);
    assert_eq!(h.local.open_clients(), 0);
}

#[test]
fn disabled_producer_pauses_replication() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    h.producer.append("s1", "pt1", std::iter::empty());
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);
    assert!(h.wait_for_pollers(&["pt1"]));

    let mut paused = registry(&[("ct1", "pt1")]);
    for producer in paused.producers.values_mut() {
        producer.disabled = true;
    }
    h.consumer.refresh_with_new_registry_from_master(Some(&paused), 2);

    assert!(h.wait_for_pollers(&[]));
    std::thread::sleep(TRIGGER * 3);
    // still listed, so the client stays for when replication resumes
    assert_eq!(h.consumer.remote_cluster_ids(), vec!["pc1".to_string()]);

    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 3);
    assert!(h.wait_for_pollers(&["pt1"]));
}

#[test]
fn applied_writes_advance_local_clock() {
    let h = Harness::new(Leaders::of(&["ct1"]));
    let far_future = HlcTimestamp::new(u64::from(u32::MAX) * 1_000, 0);
    h.producer.append(
        "s1",
        "pt1",
        [ChangeRecord::write(
            OpId::new(1, 1),
            "a",
            vec![ColumnValue::new(1, 6, "x")],
            far_future,
        )],
    );
    h.consumer
        .refresh_with_new_registry_from_master(Some(&registry(&[("ct1", "pt1")])), 1);

    assert!(wait_until(WAIT, || h.local.read("ct1", b"a").is_some()));
    assert!(h.consumer.clock().current() > far_future);
}
