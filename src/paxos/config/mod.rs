//! Static description of the local process and of the replica group.
//!
//! Everything here is decided before the system starts and is threaded
//! through component construction as an `Arc<ProcessDescriptor>`; no
//! process-wide mutable state survives teardown.

use std::path::PathBuf;
use std::time::Duration;

use crate::paxos::error::*;
use crate::paxos::ordering::{ReplicaId, View};

/// The largest replica set representable by the quorum bitmasks used in
/// the proposer and recovery protocols.
pub const MAX_REPLICAS: usize = 64;

/// Which pieces of state survive a crash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CrashModel {
    /// Full stable storage: every accepted proposal is logged durably.
    FullSS,
    /// Only the view number is durable; state is rebuilt from peers.
    ViewSS,
    /// No recovery; a crashed replica never returns.
    CrashStop,
    /// Epoch-vector based recovery.
    EpochSS,
}

/// Replica-to-replica transport selection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkKind {
    Tcp,
    Udp,
    /// Small messages over UDP, large ones over TCP.
    Generic,
}

/// All recognized options, with the stock defaults.
///
/// The option names of the original property surface map one to one onto
/// these fields; parsing a property file is the caller's concern.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub num_replicas: usize,

    /// Maximum number of concurrently proposed instances. (`WindowSize`)
    pub window_size: i32,
    /// Maximum size of a batched consensus value, bytes. (`BatchSize`)
    pub batching_level: usize,
    /// Maximum delay before an undersized batch is proposed. (`MaxBatchDelay`)
    pub max_batch_delay: Duration,
    /// (`MaxUDPPacketSize`)
    pub max_udp_packet_size: usize,
    /// (`Network`)
    pub network: NetworkKind,
    /// (`CrashModel`)
    pub crash_model: CrashModel,
    /// Location of stable storage. (`LogPath`)
    pub log_path: PathBuf,
    /// How long until the leader is suspected. (`FDSuspectTimeout`)
    pub fd_suspect_timeout: Duration,
    /// Interval between leader heartbeats. (`FDSendTimeout`)
    pub fd_send_timeout: Duration,
    /// (`RetransmitTimeoutMilisecs`)
    pub retransmit_timeout: Duration,
    /// Snapshot size estimate before the first snapshot exists.
    /// (`FirstSnapshotEstimateBytes`)
    pub first_snapshot_size_estimate: usize,
    /// Minimum log size before the snapshot ratios are considered.
    /// (`MinLogSizeForRatioCheckBytes`)
    pub snapshot_min_log_size: u64,
    /// log/snapshot ratio at which a snapshot is requested. (`SnapshotAskRatio`)
    pub snapshot_ask_ratio: f64,
    /// log/snapshot ratio at which a snapshot is forced. (`SnapshotForceRatio`)
    pub snapshot_force_ratio: f64,
    /// (`MinimumInstancesForSnapshotRatioSample`)
    pub min_snapshot_sampling: i32,
    /// (`replica.ForwardMaxBatchSize`)
    pub forward_batch_max_size: usize,
    /// (`replica.ForwardMaxBatchDelay`)
    pub forward_batch_max_delay: Duration,
    /// -1 selects a thread count based on the machine. (`replica.SelectorThreads`)
    pub selector_threads: i32,
    /// (`replica.ClientRequestBufferSize`)
    pub client_request_buffer_size: usize,
    /// How long the proposer / catch-up may wait for batch values.
    /// (`TimeoutFetchBatchValue`)
    pub max_batch_fetching_time: Duration,
    /// (`MulticastPort`)
    pub multicast_port: u16,
    /// (`MulticastIpAddress`)
    pub multicast_ip_address: String,
    /// (`NetworkMtuSize`)
    pub mtu: usize,
    /// (`IndirectConsensus`)
    pub indirect_consensus: bool,
    /// (`AugmentedPaxos`)
    pub augmented_paxos: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            num_replicas: 3,
            window_size: 2,
            batching_level: 65507,
            max_batch_delay: Duration::from_millis(10),
            max_udp_packet_size: 8 * 1024,
            network: NetworkKind::Tcp,
            crash_model: CrashModel::FullSS,
            log_path: PathBuf::from("paxos_logs"),
            fd_suspect_timeout: Duration::from_millis(1000),
            fd_send_timeout: Duration::from_millis(500),
            retransmit_timeout: Duration::from_millis(1000),
            first_snapshot_size_estimate: 1024,
            snapshot_min_log_size: 100 * 1024,
            snapshot_ask_ratio: 1.0,
            snapshot_force_ratio: 2.0,
            min_snapshot_sampling: 50,
            forward_batch_max_size: 1450,
            forward_batch_max_delay: Duration::from_millis(50),
            selector_threads: -1,
            client_request_buffer_size: 8 * 1024 + 12,
            max_batch_fetching_time: Duration::from_millis(2500),
            multicast_port: 3000,
            multicast_ip_address: "224.0.0.144".to_string(),
            mtu: 1492,
            indirect_consensus: false,
            augmented_paxos: false,
        }
    }
}

/// Contains all the information describing the local process, including
/// the local id and the validated configuration of the system.
#[derive(Debug)]
pub struct ProcessDescriptor {
    pub local_id: ReplicaId,
    pub num_replicas: usize,
    /// `⌊(n+1)/2⌋`
    pub majority: usize,
    pub config: Configuration,
}

impl ProcessDescriptor {
    pub fn new(config: Configuration, local_id: u32) -> Result<Self> {
        if config.num_replicas == 0 || config.num_replicas > MAX_REPLICAS {
            return Err(Error::Config(format!(
                "replica count {} outside of [1, {}]",
                config.num_replicas, MAX_REPLICAS
            )));
        }
        if (local_id as usize) >= config.num_replicas {
            return Err(Error::Config(format!(
                "local id {} outside of replica set of {}",
                local_id, config.num_replicas
            )));
        }
        if config.window_size < 1 {
            return Err(Error::Config("window size must be at least 1".to_string()));
        }
        if config.indirect_consensus {
            return Err(Error::UnsupportedOption("IndirectConsensus"));
        }
        if config.augmented_paxos {
            return Err(Error::UnsupportedOption("AugmentedPaxos"));
        }

        let majority = (config.num_replicas + 1) / 2;

        Ok(ProcessDescriptor {
            local_id: ReplicaId::from(local_id),
            num_replicas: config.num_replicas,
            majority,
            config,
        })
    }

    /// The leader of `view` is `view mod n`.
    pub fn leader_of_view(&self, view: View) -> ReplicaId {
        let v: i32 = view.into();
        ReplicaId::from((v as usize % self.num_replicas) as u32)
    }

    pub fn is_local_process_leader(&self, view: View) -> bool {
        self.leader_of_view(view) == self.local_id
    }

    /// Next replica id in lexical order, other than the local replica.
    pub fn next_replica(&self, after: ReplicaId) -> ReplicaId {
        let mut next = (after.as_usize() + 1) % self.num_replicas;
        if next == self.local_id.as_usize() {
            next = (next + 1) % self.num_replicas;
        }
        ReplicaId::from(next as u32)
    }

    /// Every replica id except the local one, in order.
    pub fn other_replicas(&self) -> Vec<ReplicaId> {
        (0..self.num_replicas as u32)
            .map(ReplicaId::from)
            .filter(|id| *id != self.local_id)
            .collect()
    }

    /// The directory holding this replica's durable state.
    pub fn storage_dir(&self) -> PathBuf {
        self.config
            .log_path
            .join(format!("{}", self.local_id.as_usize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_rotates_over_views() {
        let desc = ProcessDescriptor::new(Configuration::default(), 0).unwrap();
        assert_eq!(desc.leader_of_view(View::ZERO), ReplicaId::from(0));
        assert_eq!(desc.leader_of_view(View::from(1)), ReplicaId::from(1));
        assert_eq!(desc.leader_of_view(View::from(3)), ReplicaId::from(0));
        assert_eq!(desc.majority, 2);
    }

    #[test]
    fn next_replica_skips_local() {
        let desc = ProcessDescriptor::new(Configuration::default(), 1).unwrap();
        assert_eq!(desc.next_replica(ReplicaId::from(0)), ReplicaId::from(2));
        assert_eq!(desc.next_replica(ReplicaId::from(2)), ReplicaId::from(0));
    }

    #[test]
    fn rejects_unsupported_protocol_variants() {
        let config = Configuration {
            augmented_paxos: true,
            ..Configuration::default()
        };
        assert!(ProcessDescriptor::new(config, 0).is_err());
    }

    #[test]
    fn rejects_out_of_range_ids() {
        assert!(ProcessDescriptor::new(Configuration::default(), 3).is_err());
    }
}
