//! Types associated with messages traded between the system processes,
//! and with the client-facing command protocol.
//!
//! Every replica message travels framed as
//! `[type:u8][view:i32][sent_time:i64][body]`; the per-type bodies are
//! handled in [`serialize`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::paxos::batcher::ClientBatchId;
use crate::paxos::ordering::{Orderable, SeqNo, View};
use crate::paxos::snapshot::Snapshot;
use crate::paxos::storage::LogEntryState;

pub mod serialize;

/// Tags identifying each message on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Prepare = 0,
    PrepareOk = 1,
    Propose = 2,
    Accept = 3,
    Alive = 4,
    CatchUpQuery = 5,
    CatchUpResponse = 6,
    CatchUpSnapshot = 7,
    Recovery = 8,
    RecoveryAnswer = 9,
    ForwardClientBatch = 10,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<MessageType> {
        Some(match tag {
            0 => MessageType::Prepare,
            1 => MessageType::PrepareOk,
            2 => MessageType::Propose,
            3 => MessageType::Accept,
            4 => MessageType::Alive,
            5 => MessageType::CatchUpQuery,
            6 => MessageType::CatchUpResponse,
            7 => MessageType::CatchUpSnapshot,
            8 => MessageType::Recovery,
            9 => MessageType::RecoveryAnswer,
            10 => MessageType::ForwardClientBatch,
            _ => return None,
        })
    }
}

/// A replica-to-replica message: the shared header fields plus the
/// per-type body.
#[derive(Debug, Clone)]
pub struct Message {
    view: View,
    sent_time: i64,
    kind: MessageKind,
}

/// The per-type message bodies.
#[derive(Debug, Clone)]
pub enum MessageKind {
    /// Leader election: promise request for the view in the header.
    Prepare,
    /// Answer to a `Prepare`: every non-empty log entry the acceptor
    /// still holds.
    PrepareOk(Vec<InstanceRecord>),
    /// Leader order: record `value` at instance `id`.
    Propose { id: SeqNo, value: Vec<u8> },
    /// Acceptance vote for instance `id` in the header view.
    Accept { id: SeqNo },
    /// Leader heartbeat carrying the leader's log extent.
    Alive { log_next_id: SeqNo },
    CatchUpQuery(CatchUpQuery),
    CatchUpResponse(CatchUpResponse),
    /// A full snapshot transfer.
    CatchUpSnapshot { request_time: i64, snapshot: Snapshot },
    /// Broadcast by a restarting replica; the header view is the view
    /// it crashed in.
    Recovery { view_on_crash: View, epoch: i32 },
    RecoveryAnswer { view: View, next_id: i64 },
    /// A batch of client requests being propagated to all replicas
    /// ahead of ordering.
    ForwardClientBatch(ForwardedClientBatch),
}

impl Message {
    /// Creates a message stamped with the current wall clock. The stamp
    /// is used only for liveness measurements, never for correctness.
    pub fn new(view: View, kind: MessageKind) -> Self {
        Message {
            view,
            sent_time: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn with_sent_time(view: View, sent_time: i64, kind: MessageKind) -> Self {
        Message {
            view,
            sent_time,
            kind,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sent_time(&self) -> i64 {
        self.sent_time
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> MessageType {
        match &self.kind {
            MessageKind::Prepare => MessageType::Prepare,
            MessageKind::PrepareOk(_) => MessageType::PrepareOk,
            MessageKind::Propose { .. } => MessageType::Propose,
            MessageKind::Accept { .. } => MessageType::Accept,
            MessageKind::Alive { .. } => MessageType::Alive,
            MessageKind::CatchUpQuery(_) => MessageType::CatchUpQuery,
            MessageKind::CatchUpResponse(_) => MessageType::CatchUpResponse,
            MessageKind::CatchUpSnapshot { .. } => MessageType::CatchUpSnapshot,
            MessageKind::Recovery { .. } => MessageType::Recovery,
            MessageKind::RecoveryAnswer { .. } => MessageType::RecoveryAnswer,
            MessageKind::ForwardClientBatch(_) => MessageType::ForwardClientBatch,
        }
    }

    /// Whether the view gating rules of the consensus core apply to
    /// this message. Catch-up, recovery and batch propagation carry the
    /// sender's view for information only.
    pub fn is_view_gated(&self) -> bool {
        matches!(
            self.message_type(),
            MessageType::Prepare
                | MessageType::PrepareOk
                | MessageType::Propose
                | MessageType::Accept
                | MessageType::Alive
        )
    }
}

/// A query for decided instances, or for a snapshot.
#[derive(Debug, Clone, Default)]
pub struct CatchUpQuery {
    /// Set when the local log has no gaps but news is still wanted.
    pub periodic: bool,
    /// Set when a full snapshot is requested instead of instances.
    pub snapshot_request: bool,
    /// Individual instance ids considered undecided, ending with the
    /// sentinel `last_key + 1`.
    pub instance_ids: Vec<SeqNo>,
    /// Inclusive ranges of undecided instance ids.
    pub instance_ranges: Vec<(SeqNo, SeqNo)>,
}

/// One fragment of an answer to a [`CatchUpQuery`].
#[derive(Debug, Clone)]
pub struct CatchUpResponse {
    pub periodic: bool,
    /// The responder truncated its log below the requested instances;
    /// only a snapshot can help.
    pub snapshot_only: bool,
    /// `false` on every fragment except the final flush.
    pub last_part: bool,
    /// Echo of the query's sent time, for the requester's timeout
    /// estimate.
    pub request_time: i64,
    pub decided: Vec<InstanceRecord>,
}

/// The payload of a `ForwardClientBatch` message.
#[derive(Debug, Clone)]
pub struct ForwardedClientBatch {
    pub batch_id: ClientBatchId,
    pub requests: Vec<ClientRequest>,
}

/// Wire-facing copy of one consensus instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstanceRecord {
    pub id: SeqNo,
    pub view: View,
    pub state: LogEntryState,
    pub value: Option<Vec<u8>>,
}

impl InstanceRecord {
    /// Serialized size, used when splitting catch-up responses into
    /// transport-sized fragments.
    pub fn byte_size(&self) -> usize {
        4 + 4 + 1 + 4 + self.value.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl Orderable for InstanceRecord {
    fn sequence_number(&self) -> SeqNo {
        self.id
    }
}

/// Identifies a single command of a single client.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestId {
    pub client_id: i64,
    pub seq: i32,
}

impl RequestId {
    pub fn new(client_id: i64, seq: i32) -> Self {
        RequestId { client_id, seq }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.seq)
    }
}

/// A command submitted by a client, before ordering.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ClientRequest {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

impl ClientRequest {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        ClientRequest { id, payload }
    }

    pub fn byte_size(&self) -> usize {
        8 + 4 + 4 + self.payload.len()
    }
}

/// The reply produced by executing one client request. The most recent
/// reply per client is retained for at-most-once semantics.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Reply {
    pub request_id: RequestId,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(request_id: RequestId, payload: Vec<u8>) -> Self {
        Reply {
            request_id,
            payload,
        }
    }
}

/// Result status of a [`ClientReply`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    Nack = 1,
    /// The payload carries the id of the leader to talk to instead.
    Redirect = 2,
    Busy = 3,
}

impl ReplyStatus {
    pub fn from_u8(tag: u8) -> Option<ReplyStatus> {
        Some(match tag {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Nack,
            2 => ReplyStatus::Redirect,
            3 => ReplyStatus::Busy,
            _ => return None,
        })
    }
}

/// What a replica sends back to a client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientReply {
    pub status: ReplyStatus,
    pub payload: Vec<u8>,
}

impl ClientReply {
    pub fn ok(payload: Vec<u8>) -> Self {
        ClientReply {
            status: ReplyStatus::Ok,
            payload,
        }
    }

    pub fn nack(diagnostic: String) -> Self {
        ClientReply {
            status: ReplyStatus::Nack,
            payload: diagnostic.into_bytes(),
        }
    }
}

/// A framed command received from a client connection.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Request(ClientRequest),
    /// A frame with a command tag this replica does not recognize.
    /// Kept so the admission layer can answer it with a diagnostic.
    Unknown(u8),
}
