//! End-to-end behavior of a small in-process cluster: ordering,
//! deduplication, view change, snapshot catch-up, and restart
//! recovery, all over the real codec and the loopback fabric.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::paxos::config::{Configuration, CrashModel};
use crate::paxos::executable::Service;
use crate::paxos::messages::serialize::reply_from_bytes;
use crate::paxos::messages::{
    ClientCommand, ClientReply, ClientRequest, Message, MessageKind, Reply, ReplyStatus, RequestId,
};
use crate::paxos::network::LoopbackFabric;
use crate::paxos::ordering::ReplicaId;
use crate::paxos::replica::{ClientProxy, Replica};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bounded-state echo service: replies `payload + "!"`, remembers how
/// many commands it applied and the last one.
#[derive(Serialize, Deserialize, Default)]
struct EchoState {
    count: u64,
    last: Vec<u8>,
}

struct EchoService {
    state: EchoState,
    /// Mirror of `state.count` readable from the test thread.
    applied: Arc<AtomicU64>,
}

impl EchoService {
    fn new(applied: Arc<AtomicU64>) -> Self {
        EchoService {
            state: EchoState::default(),
            applied,
        }
    }
}

impl Service for EchoService {
    fn execute(&mut self, request: &[u8]) -> Vec<u8> {
        self.state.count += 1;
        self.state.last = request.to_vec();
        self.applied.store(self.state.count, Ordering::Relaxed);
        let mut reply = request.to_vec();
        reply.push(b'!');
        reply
    }

    fn take_snapshot(&mut self) -> Vec<u8> {
        bincode::serialize(&self.state).expect("echo state serializes")
    }

    fn install_snapshot(&mut self, state: &[u8]) {
        self.state = bincode::deserialize(state).expect("echo state deserializes");
        self.applied.store(self.state.count, Ordering::Relaxed);
    }
}

struct ChannelProxy {
    tx: Sender<ClientReply>,
}

impl ClientProxy for ChannelProxy {
    fn send(&self, reply: ClientReply) {
        let _ = self.tx.send(reply);
    }
}

struct Cluster {
    fabric: Arc<LoopbackFabric>,
    config: Configuration,
    replicas: Vec<Option<Replica>>,
    applied: Vec<Arc<AtomicU64>>,
    _dir: tempfile::TempDir,
}

impl Cluster {
    fn new(n: usize, mut config: Configuration) -> Cluster {
        init_logging();
        let dir = tempfile::tempdir().expect("temp dir");
        config.num_replicas = n;
        config.crash_model = CrashModel::ViewSS;
        config.log_path = dir.path().to_path_buf();

        let mut cluster = Cluster {
            fabric: LoopbackFabric::new(),
            config,
            replicas: (0..n).map(|_| None).collect(),
            applied: (0..n).map(|_| Arc::new(AtomicU64::new(0))).collect(),
            _dir: dir,
        };
        for id in 0..n {
            cluster.start_replica(id as u32);
        }
        cluster
    }

    fn start_replica(&mut self, id: u32) {
        let node = self.fabric.node(ReplicaId::from(id));
        let service = EchoService::new(self.applied[id as usize].clone());
        let replica =
            Replica::new(self.config.clone(), id, service, node).expect("replica starts");
        self.fabric.register(ReplicaId::from(id), replica.message_handler());
        self.replicas[id as usize] = Some(replica);
    }

    fn replica(&self, id: usize) -> &Replica {
        self.replicas[id].as_ref().expect("replica is running")
    }

    fn partition(&self, id: u32) {
        self.fabric.set_down(ReplicaId::from(id), true);
    }

    fn reconnect(&self, id: u32) {
        self.fabric.set_down(ReplicaId::from(id), false);
    }

    /// Partition and stop a replica, keeping its durable state.
    fn crash(&mut self, id: u32) {
        self.partition(id);
        if let Some(replica) = self.replicas[id as usize].take() {
            replica.shutdown();
        }
    }

    fn restart(&mut self, id: u32) {
        self.reconnect(id);
        self.start_replica(id);
    }

    fn send_request(
        &self,
        to: usize,
        client: i64,
        seq: i32,
        payload: &[u8],
    ) -> Receiver<ClientReply> {
        let (tx, rx) = unbounded();
        let command = ClientCommand::Request(ClientRequest::new(
            RequestId::new(client, seq),
            payload.to_vec(),
        ));
        self.replica(to)
            .on_client_request(command, Arc::new(ChannelProxy { tx }))
            .expect("request admitted");
        rx
    }

    fn await_reply(rx: &Receiver<ClientReply>, timeout: Duration) -> ClientReply {
        rx.recv_timeout(timeout).expect("no reply within timeout")
    }

    fn await_ok(&self, to: usize, client: i64, seq: i32, payload: &[u8]) -> Reply {
        let rx = self.send_request(to, client, seq, payload);
        let reply = Self::await_reply(&rx, Duration::from_secs(10));
        assert_eq!(reply.status, ReplyStatus::Ok, "request ({client},{seq}) failed");
        reply_from_bytes(&reply.payload).expect("reply payload decodes")
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for replica in self.replicas.iter_mut().filter_map(Option::take) {
            replica.shutdown();
        }
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn fast_config() -> Configuration {
    Configuration {
        fd_send_timeout: Duration::from_millis(50),
        fd_suspect_timeout: Duration::from_millis(300),
        retransmit_timeout: Duration::from_millis(50),
        max_batch_delay: Duration::from_millis(5),
        forward_batch_max_delay: Duration::from_millis(5),
        max_batch_fetching_time: Duration::from_millis(250),
        ..Configuration::default()
    }
}

#[test]
fn single_decision_reaches_every_replica() {
    let cluster = Cluster::new(3, fast_config());

    let reply = cluster.await_ok(0, 42, 1, b"A");
    assert_eq!(reply.request_id, RequestId::new(42, 1));
    assert_eq!(reply.payload, b"A!");

    for id in 0..3 {
        assert!(
            wait_until(Duration::from_secs(5), || {
                cluster.replica(id).last_reply(42).as_ref() == Some(&reply)
            }),
            "replica {id} never cached the reply"
        );
    }
    for applied in &cluster.applied {
        assert_eq!(applied.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn resent_request_is_answered_from_the_cache() {
    let cluster = Cluster::new(3, fast_config());

    let first = cluster.await_ok(0, 42, 1, b"A");

    // the replica that never held the proxy answers the resend
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.replica(2).last_reply(42).is_some()
    }));
    let instances_before = cluster.replica(2).with_paxos(|p| p.storage.log().next_id());

    let again = cluster.await_ok(2, 42, 1, b"A");
    assert_eq!(again, first);

    thread::sleep(Duration::from_millis(100));
    let instances_after = cluster.replica(2).with_paxos(|p| p.storage.log().next_id());
    assert_eq!(instances_before, instances_after, "dedup created an instance");
}

#[test]
fn stale_request_is_rejected() {
    let cluster = Cluster::new(3, fast_config());

    cluster.await_ok(0, 42, 1, b"A");
    cluster.await_ok(0, 42, 2, b"B");

    let rx = cluster.send_request(0, 42, 1, b"A'");
    let reply = Cluster::await_reply(&rx, Duration::from_secs(5));
    assert_eq!(reply.status, ReplyStatus::Nack);
    assert!(String::from_utf8_lossy(&reply.payload).contains("too old"));
}

#[test]
fn leader_crash_triggers_view_change_and_progress() {
    let cluster = Cluster::new(3, fast_config());

    cluster.await_ok(0, 42, 1, b"A");
    let view_before = cluster.replica(1).with_paxos(|p| p.storage.view());

    cluster.partition(0);

    let reply = cluster.await_ok(1, 43, 1, b"B");
    assert_eq!(reply.payload, b"B!");

    let (view_after, leader) = cluster
        .replica(1)
        .with_paxos(|p| (p.storage.view(), p.leader_id()));
    assert!(view_after > view_before);
    assert_ne!(leader, ReplicaId::from(0));

    // the surviving replicas agree on the whole history
    for id in [1usize, 2] {
        assert!(
            wait_until(Duration::from_secs(5), || {
                cluster.replica(id).last_reply(43).map(|r| r.payload) == Some(b"B!".to_vec())
            }),
            "replica {id} missed the post-crash decision"
        );
    }
}

#[test]
fn partitioned_replica_catches_up_through_a_snapshot() {
    let config = Configuration {
        // the partitioned replica must not start view changes of its own
        fd_suspect_timeout: Duration::from_secs(60),
        fd_send_timeout: Duration::from_millis(50),
        retransmit_timeout: Duration::from_millis(50),
        max_batch_delay: Duration::from_millis(1),
        forward_batch_max_delay: Duration::from_millis(1),
        max_batch_fetching_time: Duration::from_millis(250),
        // aggressive snapshotting so the log is truncated quickly
        first_snapshot_size_estimate: 16,
        snapshot_min_log_size: 64,
        snapshot_ask_ratio: 1.0,
        snapshot_force_ratio: 2.0,
        min_snapshot_sampling: 2,
        ..Configuration::default()
    };
    let window = config.window_size;
    let cluster = Cluster::new(3, config);

    cluster.partition(2);

    for seq in 1..=60 {
        cluster.await_ok(0, 7, seq, format!("x{seq}").as_bytes());
        if seq % 20 == 0 {
            // the leader never runs ahead of the window
            let (next, first) = cluster
                .replica(0)
                .with_paxos(|p| (p.storage.log().next_id(), p.storage.first_uncommitted()));
            assert!(next.distance_from(first) <= window);
        }
    }

    // both connected replicas snapshot and truncate their logs
    for id in [0usize, 1] {
        assert!(
            wait_until(Duration::from_secs(10), || {
                cluster
                    .replica(id)
                    .with_paxos(|p| i32::from(p.storage.log().lowest_available()) > 0)
            }),
            "replica {id} never truncated its log"
        );
    }

    cluster.reconnect(2);

    assert!(
        wait_until(Duration::from_secs(30), || {
            cluster.replica(2).last_reply(7).map(|r| r.request_id.seq) == Some(60)
        }),
        "partitioned replica never caught up"
    );
    // it got there through a snapshot, not by replaying everything
    assert!(cluster
        .replica(2)
        .with_paxos(|p| p.storage.last_snapshot().is_some()));
    assert_eq!(cluster.applied[2].load(Ordering::Relaxed), 60);
}

#[test]
fn restarted_replica_recovers_from_its_view() {
    let mut cluster = Cluster::new(3, fast_config());

    cluster.await_ok(0, 42, 1, b"A");

    // every replica has promised a view above zero by now
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.replica(2).with_paxos(|p| !p.storage.view().is_initial())
    }));

    cluster.crash(2);
    cluster.await_ok(0, 42, 2, b"B");
    cluster.restart(2);

    assert!(
        wait_until(Duration::from_secs(20), || {
            cluster.replica(2).last_reply(42).map(|r| r.payload) == Some(b"B!".to_vec())
        }),
        "restarted replica never converged"
    );
    assert_eq!(cluster.applied[2].load(Ordering::Relaxed), 2);
}

#[test]
fn duplicate_propose_yields_the_same_vote_set() {
    let cluster = Cluster::new(3, fast_config());

    cluster.await_ok(0, 42, 1, b"A");

    let follower = cluster.replica(1);
    let (view, id) = follower.with_paxos(|p| (p.storage.view(), p.storage.log().next_id()));
    let value = crate::paxos::batcher::noop_value();

    let propose = move |p: &mut crate::paxos::Paxos, value: Vec<u8>| {
        p.process_message(
            Message::new(view, MessageKind::Propose { id, value }),
            ReplicaId::from(0),
        );
    };

    let value_once = value.clone();
    follower.with_paxos(move |p| propose(p, value_once));
    let first_votes =
        follower.with_paxos(move |p| p.storage.log().get_instance(id).unwrap().accept_count());

    let value_again = value.clone();
    follower.with_paxos(move |p| propose(p, value_again));
    let second_votes =
        follower.with_paxos(move |p| p.storage.log().get_instance(id).unwrap().accept_count());

    assert_eq!(first_votes, second_votes);
}

#[test]
fn full_stable_storage_rejects_the_batching_pipeline() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration {
        log_path: dir.path().to_path_buf(),
        crash_model: CrashModel::FullSS,
        ..Configuration::default()
    };
    let fabric = LoopbackFabric::new();
    let node = fabric.node(ReplicaId::from(0));
    let result = Replica::new(config, 0, EchoService::new(Arc::new(AtomicU64::new(0))), node);
    assert!(matches!(
        result,
        Err(crate::paxos::error::Error::BatchingUnavailable)
    ));
}

#[test]
fn replies_stay_in_client_sequence_order() {
    let cluster = Cluster::new(3, fast_config());

    for seq in 1..=5 {
        let reply = cluster.await_ok(0, 9, seq, format!("r{seq}").as_bytes());
        assert_eq!(reply.request_id.seq, seq);
    }
    assert_eq!(cluster.applied[0].load(Ordering::Relaxed), 5);
}
