//! End-to-end behaviour of the metadata state core

use meridian_common::config::JournalConfig;
use meridian_common::{ClusterRole, Config, ConsistencyKind, Error, LeaderInfo, NodeEndpoint, NodeId};
use meridian_meta_store::checkpoint::{decode_image, encode_image};
use meridian_meta_store::state::ApplyOutcome;
use meridian_meta_store::{
    EntityKind, EntitySnapshot, FileJournal, JournalEntry, JournalSource, JournalStore,
    LocalElection, MemoryJournal, MetadataState, MetadataStore, Operation, ReplayPolicy, Replayer,
    RequestContext, StateCoordinator, StaticConnector,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(id: u64, data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.node.node_id = id;
    config.node.data_dir = data_dir.to_path_buf();
    config.node.advertise_addr = Some(format!("mem://{id}"));
    config.replication.poll_wait_ms = 10;
    config.replication.retry_initial_ms = 5;
    config.replication.leader_drain_timeout_ms = 2_000;
    config
}

fn endpoint(id: u64) -> NodeEndpoint {
    NodeEndpoint::new(NodeId(id), format!("mem://{id}"))
}

async fn open_node(
    id: u64,
    dir: &TempDir,
    journal: Arc<dyn JournalStore>,
    connector: Arc<StaticConnector>,
) -> StateCoordinator {
    StateCoordinator::open(
        config(id, dir.path()),
        journal,
        Arc::new(LocalElection::new(0)),
        connector,
    )
    .await
    .unwrap()
}

/// A mixed workload touching every entity kind
fn workload() -> Vec<Operation> {
    vec![
        Operation::create_database("sales"),
        Operation::create_table(1, "orders"),
        Operation::create_table(1, "customers"),
        Operation::add_partition(2, "p2024"),
        Operation::add_partition(2, "p2025"),
        Operation::begin_transaction(1, "load-1", vec![2]),
        Operation::commit_transaction(6),
        Operation::rename_table(3, "clients"),
        Operation::put_resource("spark", "compute"),
        Operation::begin_transaction(1, "load-2", vec![2, 3]),
        Operation::abort_transaction(10, "cancelled"),
        Operation::drop_partition(4),
        Operation::drop_resource("spark"),
    ]
}

fn journal_of(ops: &[Operation]) -> Arc<MemoryJournal> {
    let journal = Arc::new(MemoryJournal::new());
    for (seq, op) in (1..).zip(ops) {
        journal
            .append(1, &[JournalEntry::new(seq, op, 1_000 + seq).unwrap()])
            .unwrap();
    }
    journal
}

fn replay_fresh(journal: Arc<MemoryJournal>) -> MetadataState {
    let store = Arc::new(MetadataStore::new());
    Replayer::new(journal, store.clone(), ReplayPolicy::strict())
        .recover()
        .unwrap();
    store.snapshot()
}

#[tokio::test]
async fn test_total_order_under_concurrency() {
    let dir = TempDir::new().unwrap();
    let journal = Arc::new(MemoryJournal::new());
    let node = open_node(1, &dir, journal.clone(), Arc::new(StaticConnector::new())).await;
    node.become_leader(1).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..50u64 {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            node.submit(
                Operation::create_table(i % 5, format!("t{i}")),
                RequestContext::default(),
            )
            .await
            .unwrap()
            .sequence_id
        }));
    }
    let mut seqs = Vec::new();
    for task in tasks {
        seqs.push(task.await.unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=50).collect::<Vec<_>>());

    let entries = journal.read(1, 50).unwrap();
    assert!(entries.windows(2).all(|w| w[1].sequence_id == w[0].sequence_id + 1));
    node.shutdown().await.unwrap();
}

#[test]
fn test_deterministic_replay() {
    let ops = workload();
    for prefix in 1..=ops.len() {
        let first = replay_fresh(journal_of(&ops[..prefix]));
        let second = replay_fresh(journal_of(&ops[..prefix]));
        assert_eq!(first, second);
        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
    }
}

#[test]
fn test_checkpoint_equivalence() {
    let ops = workload();
    let journal = journal_of(&ops);
    let full = replay_fresh(journal.clone());

    for cut in [0u64, 1, 5, 9, ops.len() as u64] {
        // image at `cut`
        let store = Arc::new(MetadataStore::new());
        let upto = journal.read(1, cut).unwrap();
        for entry in &upto {
            store.apply(entry).unwrap();
        }
        let image = encode_image(&store.snapshot(), 0).unwrap();

        // restore it and replay the rest
        let (header, state) = decode_image(&image).unwrap();
        assert_eq!(header.up_to_sequence, cut);
        let restored = Arc::new(MetadataStore::from_state(state));
        Replayer::new(journal.clone(), restored.clone(), ReplayPolicy::strict())
            .recover()
            .unwrap();
        assert_eq!(restored.snapshot(), full, "image at {cut}");
    }
}

#[test]
fn test_idempotent_apply() {
    let store = MetadataStore::new();
    let entries = journal_of(&workload()).read(1, 3).unwrap();
    for entry in &entries {
        assert_eq!(store.apply(entry).unwrap(), ApplyOutcome::Applied);
    }
    let before = store.snapshot();
    for entry in &entries {
        assert_eq!(store.apply(entry).unwrap(), ApplyOutcome::Duplicate);
    }
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn test_leader_exclusivity_with_fencing() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    // both nodes reach the same durable journal
    let shared = Arc::new(MemoryJournal::new());
    let connector = Arc::new(StaticConnector::new());

    let a = open_node(1, &dir_a, shared.clone(), connector.clone()).await;
    a.become_leader(1).await.unwrap();
    a.submit(Operation::create_database("a"), RequestContext::default())
        .await
        .unwrap();

    // partition: B is elected while A still believes it leads
    let b = open_node(2, &dir_b, shared.clone(), connector).await;
    b.become_leader(2).await.unwrap();
    assert!(a.role().is_leader());
    assert!(b.role().is_leader());

    let stale = a
        .submit(Operation::create_database("from-a"), RequestContext::default())
        .await
        .unwrap_err();
    assert!(matches!(stale, Error::Durability { .. }));

    b.submit(Operation::create_database("from-b"), RequestContext::default())
        .await
        .unwrap();

    // exactly one entry per slot, none from the stale leader
    let entries = shared.read(1, shared.last_sequence()).unwrap();
    assert_eq!(entries.len(), 3);
    let names: Vec<_> = entries
        .iter()
        .filter_map(|e| match e.operation().unwrap() {
            Operation::CreateDatabase(op) => Some(op.name),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["a".to_string(), "from-b".to_string()]);

    let mut role = a.subscribe_role();
    tokio::time::timeout(
        Duration::from_secs(5),
        role.wait_for(|r| r.role == ClusterRole::Unknown),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_scenario_first_table_on_fresh_leader() {
    let dir = TempDir::new().unwrap();
    let node = open_node(
        1,
        &dir,
        Arc::new(MemoryJournal::new()),
        Arc::new(StaticConnector::new()),
    )
    .await;
    node.become_leader(1).await.unwrap();

    let receipt = node
        .submit(Operation::create_table(1, "t1"), RequestContext::default())
        .await
        .unwrap();
    assert_eq!(receipt.sequence_id, 1);
    match node.read_current(EntityKind::Table, receipt.sequence_id) {
        Some(EntitySnapshot::Table(table)) => {
            assert_eq!(table.name, "t1");
            assert_eq!(table.db_id, 1);
        }
        other => panic!("unexpected snapshot {other:?}"),
    }
}

#[tokio::test]
async fn test_scenario_failover_replays_durable_tail() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let connector = Arc::new(StaticConnector::new());
    let journal_a = Arc::new(MemoryJournal::new());
    connector.register(NodeId(1), Arc::new(JournalSource::new(journal_a.clone())));

    let a = open_node(1, &dir_a, journal_a.clone(), connector.clone()).await;
    a.become_leader(1).await.unwrap();
    for i in 1..=5 {
        let receipt = a
            .submit(Operation::create_database(format!("db{i}")), RequestContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.sequence_id, i);
    }
    // the leader dies; its journal survives
    a.shutdown().await.unwrap();
    drop(a);

    let b = open_node(2, &dir_b, Arc::new(MemoryJournal::new()), connector).await;
    b.become_follower(LeaderInfo {
        node: endpoint(1),
        epoch: 1,
    })
    .await
    .unwrap();
    b.become_leader(2).await.unwrap();

    assert!(b.last_applied() >= 5);
    assert!(matches!(
        b.read_current(EntityKind::Database, 5),
        Some(EntitySnapshot::Database(ref db)) if db.name == "db5"
    ));
    // the new term starts with its marker at 6
    let receipt = b
        .submit(Operation::create_database("db6"), RequestContext::default())
        .await
        .unwrap();
    assert_eq!(receipt.sequence_id, 7);
    assert_eq!(b.view(|s| s.leader_epoch()), 2);
}

#[tokio::test]
async fn test_scenario_restart_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let journal_config = JournalConfig {
        sync_on_append: false,
        segment_size_bytes: 4096,
        ..JournalConfig::default()
    };
    let mut node_config = config(1, dir.path());
    node_config.journal = journal_config.clone();

    let open = |config: Config| {
        let journal_config = journal_config.clone();
        async move {
            let journal = Arc::new(FileJournal::open(config.node.journal_dir(), journal_config).unwrap());
            StateCoordinator::open(
                config,
                journal,
                Arc::new(LocalElection::new(0)),
                Arc::new(StaticConnector::new()),
            )
            .await
            .unwrap()
        }
    };

    let node = open(node_config.clone()).await;
    node.become_leader(1).await.unwrap();
    node.submit(Operation::create_database("db"), RequestContext::default())
        .await
        .unwrap();
    for i in 2..=100 {
        node.submit(
            Operation::create_table(1, format!("t{i}")),
            RequestContext::default(),
        )
        .await
        .unwrap();
    }
    let info = node.create_checkpoint().await.unwrap();
    assert_eq!(info.up_to_sequence, 100);

    for i in 101..=110 {
        node.submit(
            Operation::add_partition(i - 100 + 1, format!("p{i}")),
            RequestContext::default(),
        )
        .await
        .unwrap();
    }
    let continuous = node.view(MetadataState::clone);
    node.shutdown().await.unwrap();
    drop(node);

    let restarted = open(node_config).await;
    assert_eq!(restarted.role().role(), ClusterRole::Init);
    assert_eq!(restarted.last_applied(), 110);
    assert_eq!(restarted.status().last_image, 100);
    assert_eq!(restarted.view(MetadataState::clone), continuous);
}

#[tokio::test]
async fn test_scenario_follower_rejects_writes() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let connector = Arc::new(StaticConnector::new());
    let journal_a = Arc::new(MemoryJournal::new());
    connector.register(NodeId(1), Arc::new(JournalSource::new(journal_a.clone())));

    let a = open_node(1, &dir_a, journal_a, connector.clone()).await;
    a.become_leader(1).await.unwrap();

    let journal_b = Arc::new(MemoryJournal::new());
    let b = open_node(2, &dir_b, journal_b.clone(), connector).await;
    b.become_follower(LeaderInfo {
        node: endpoint(1),
        epoch: 1,
    })
    .await
    .unwrap();

    let err = b
        .submit(Operation::create_table(1, "t1"), RequestContext::default())
        .await
        .unwrap_err();
    match err {
        Error::NotLeader {
            role,
            leader: Some(leader),
            ..
        } => {
            assert_eq!(role, ClusterRole::Follower);
            assert_eq!(leader.node_id, NodeId(1));
        }
        other => panic!("expected NotLeader, got {other}"),
    }
    assert_eq!(journal_b.last_sequence(), 0);
    assert!(matches!(b.flush().await, Err(Error::NotLeader { .. })));
}

#[tokio::test]
async fn test_scenario_corrupt_entry_halts_replay() {
    let ops: Vec<_> = (1..=60)
        .map(|i| Operation::create_database(format!("db{i}")))
        .collect();
    let journal = journal_of(&ops);
    assert!(journal.corrupt(50));

    let store = Arc::new(MetadataStore::new());
    let err = Replayer::new(journal.clone(), store.clone(), ReplayPolicy::strict())
        .recover()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Consistency {
            sequence: 50,
            kind: ConsistencyKind::ChecksumMismatch
        }
    ));
    assert_eq!(store.last_applied(), 49);
    assert!(store.view(|s| s.database_by_name("db50").is_none()));

    // a node on this journal refuses to start
    let dir = TempDir::new().unwrap();
    let opened = StateCoordinator::open(
        config(1, dir.path()),
        journal,
        Arc::new(LocalElection::new(0)),
        Arc::new(StaticConnector::new()),
    )
    .await;
    assert!(matches!(
        opened,
        Err(Error::Consistency { sequence: 50, .. })
    ));
}
