//! Wire codec for replica and client messages.
//!
//! The framing is fixed: `[type:u8][view:i32][sent_time:i64][body]`, all
//! integers big-endian. Snapshot payloads are opaque to the wire format
//! and travel bincode-encoded, since their layout is private to the
//! replicas.

use bytes::{BufMut, BytesMut};

use crate::paxos::batcher::ClientBatchId;
use crate::paxos::error::*;
use crate::paxos::messages::{
    CatchUpQuery, CatchUpResponse, ClientCommand, ClientReply, ClientRequest, ForwardedClientBatch,
    InstanceRecord, Message, MessageKind, MessageType, Reply, ReplyStatus, RequestId,
};
use crate::paxos::ordering::{ReplicaId, SeqNo, View};
use crate::paxos::storage::LogEntryState;

const FLAG_PERIODIC: u8 = 0b001;
const FLAG_SNAPSHOT: u8 = 0b010;
const FLAG_LAST_PART: u8 = 0b100;

/// Fixed header size preceding every body.
pub const HEADER_SIZE: usize = 1 + 4 + 8;

/// Serializes a replica message into its framed form.
pub fn serialize_message(message: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);

    buf.put_u8(message.message_type() as u8);
    buf.put_i32(message.view().into());
    buf.put_i64(message.sent_time());

    match message.kind() {
        MessageKind::Prepare => {}
        MessageKind::PrepareOk(records) => {
            buf.put_i32(records.len() as i32);
            for record in records {
                put_instance_record(&mut buf, record);
            }
        }
        MessageKind::Propose { id, value } => {
            buf.put_i32((*id).into());
            put_value(&mut buf, value);
        }
        MessageKind::Accept { id } => {
            buf.put_i32((*id).into());
        }
        MessageKind::Alive { log_next_id } => {
            buf.put_i32((*log_next_id).into());
        }
        MessageKind::CatchUpQuery(query) => {
            let mut flags = 0u8;
            if query.periodic {
                flags |= FLAG_PERIODIC;
            }
            if query.snapshot_request {
                flags |= FLAG_SNAPSHOT;
            }
            buf.put_u8(flags);
            buf.put_i32(query.instance_ids.len() as i32);
            for id in &query.instance_ids {
                buf.put_i32((*id).into());
            }
            buf.put_i32(query.instance_ranges.len() as i32);
            for (lo, hi) in &query.instance_ranges {
                buf.put_i32((*lo).into());
                buf.put_i32((*hi).into());
            }
        }
        MessageKind::CatchUpResponse(response) => {
            let mut flags = 0u8;
            if response.periodic {
                flags |= FLAG_PERIODIC;
            }
            if response.snapshot_only {
                flags |= FLAG_SNAPSHOT;
            }
            if response.last_part {
                flags |= FLAG_LAST_PART;
            }
            buf.put_u8(flags);
            buf.put_i64(response.request_time);
            buf.put_i32(response.decided.len() as i32);
            for record in &response.decided {
                put_instance_record(&mut buf, record);
            }
        }
        MessageKind::CatchUpSnapshot {
            request_time,
            snapshot,
        } => {
            buf.put_i64(*request_time);
            // infallible for this type; the buffer grows as needed
            let encoded = bincode::serialize(snapshot).expect("snapshot encoding");
            buf.put_slice(&encoded);
        }
        MessageKind::Recovery {
            view_on_crash,
            epoch,
        } => {
            buf.put_i32((*view_on_crash).into());
            buf.put_i32(*epoch);
        }
        MessageKind::RecoveryAnswer { view, next_id } => {
            buf.put_i32((*view).into());
            buf.put_i64(*next_id);
        }
        MessageKind::ForwardClientBatch(forward) => {
            put_client_batch_id(&mut buf, &forward.batch_id);
            buf.put_i32(forward.requests.len() as i32);
            for request in &forward.requests {
                put_client_request(&mut buf, request);
            }
        }
    }

    buf.to_vec()
}

/// Deserializes one framed replica message.
pub fn deserialize_message(buf: &[u8]) -> Result<Message> {
    let mut reader = Reader::new(buf);

    let tag = reader.get_u8()?;
    let message_type =
        MessageType::from_u8(tag).ok_or(Error::Codec("unknown message type tag"))?;
    let view = View::from(reader.get_i32()?);
    let sent_time = reader.get_i64()?;

    let kind = match message_type {
        MessageType::Prepare => MessageKind::Prepare,
        MessageType::PrepareOk => {
            let n = reader.get_len()?;
            let mut records = Vec::with_capacity(n);
            for _ in 0..n {
                records.push(get_instance_record(&mut reader)?);
            }
            MessageKind::PrepareOk(records)
        }
        MessageType::Propose => {
            let id = SeqNo::from(reader.get_i32()?);
            let value = get_value(&mut reader)?.ok_or(Error::Codec("propose without value"))?;
            MessageKind::Propose { id, value }
        }
        MessageType::Accept => MessageKind::Accept {
            id: SeqNo::from(reader.get_i32()?),
        },
        MessageType::Alive => MessageKind::Alive {
            log_next_id: SeqNo::from(reader.get_i32()?),
        },
        MessageType::CatchUpQuery => {
            let flags = reader.get_u8()?;
            let n = reader.get_len()?;
            let mut instance_ids = Vec::with_capacity(n);
            for _ in 0..n {
                instance_ids.push(SeqNo::from(reader.get_i32()?));
            }
            let n = reader.get_len()?;
            let mut instance_ranges = Vec::with_capacity(n);
            for _ in 0..n {
                let lo = SeqNo::from(reader.get_i32()?);
                let hi = SeqNo::from(reader.get_i32()?);
                instance_ranges.push((lo, hi));
            }
            MessageKind::CatchUpQuery(CatchUpQuery {
                periodic: flags & FLAG_PERIODIC != 0,
                snapshot_request: flags & FLAG_SNAPSHOT != 0,
                instance_ids,
                instance_ranges,
            })
        }
        MessageType::CatchUpResponse => {
            let flags = reader.get_u8()?;
            let request_time = reader.get_i64()?;
            let n = reader.get_len()?;
            let mut decided = Vec::with_capacity(n);
            for _ in 0..n {
                decided.push(get_instance_record(&mut reader)?);
            }
            MessageKind::CatchUpResponse(CatchUpResponse {
                periodic: flags & FLAG_PERIODIC != 0,
                snapshot_only: flags & FLAG_SNAPSHOT != 0,
                last_part: flags & FLAG_LAST_PART != 0,
                request_time,
                decided,
            })
        }
        MessageType::CatchUpSnapshot => {
            let request_time = reader.get_i64()?;
            let snapshot = bincode::deserialize(reader.rest())?;
            MessageKind::CatchUpSnapshot {
                request_time,
                snapshot,
            }
        }
        MessageType::Recovery => MessageKind::Recovery {
            view_on_crash: View::from(reader.get_i32()?),
            epoch: reader.get_i32()?,
        },
        MessageType::RecoveryAnswer => MessageKind::RecoveryAnswer {
            view: View::from(reader.get_i32()?),
            next_id: reader.get_i64()?,
        },
        MessageType::ForwardClientBatch => {
            let batch_id = get_client_batch_id(&mut reader)?;
            let n = reader.get_len()?;
            let mut requests = Vec::with_capacity(n);
            for _ in 0..n {
                requests.push(get_client_request(&mut reader)?);
            }
            MessageKind::ForwardClientBatch(ForwardedClientBatch { batch_id, requests })
        }
    };

    Ok(Message::with_sent_time(view, sent_time, kind))
}

/// Serializes a command as sent by a client over its connection.
pub fn serialize_client_command(command: &ClientCommand) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match command {
        ClientCommand::Request(request) => {
            buf.put_u8(0);
            put_client_request(&mut buf, request);
        }
        ClientCommand::Unknown(tag) => {
            buf.put_u8(*tag);
        }
    }
    buf.to_vec()
}

pub fn deserialize_client_command(buf: &[u8]) -> Result<ClientCommand> {
    let mut reader = Reader::new(buf);
    let tag = reader.get_u8()?;
    match tag {
        0 => Ok(ClientCommand::Request(get_client_request(&mut reader)?)),
        other => Ok(ClientCommand::Unknown(other)),
    }
}

pub fn serialize_client_reply(reply: &ClientReply) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + reply.payload.len());
    buf.put_u8(reply.status as u8);
    buf.put_slice(&reply.payload);
    buf.to_vec()
}

pub fn deserialize_client_reply(buf: &[u8]) -> Result<ClientReply> {
    let mut reader = Reader::new(buf);
    let status =
        ReplyStatus::from_u8(reader.get_u8()?).ok_or(Error::Codec("unknown reply status"))?;
    Ok(ClientReply {
        status,
        payload: reader.rest().to_vec(),
    })
}

/// Encodes a cached reply the way it is carried inside an OK client
/// reply payload.
pub fn reply_to_bytes(reply: &Reply) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12 + reply.payload.len());
    buf.put_i64(reply.request_id.client_id);
    buf.put_i32(reply.request_id.seq);
    buf.put_slice(&reply.payload);
    buf.to_vec()
}

pub fn reply_from_bytes(buf: &[u8]) -> Result<Reply> {
    let mut reader = Reader::new(buf);
    let client_id = reader.get_i64()?;
    let seq = reader.get_i32()?;
    Ok(Reply {
        request_id: RequestId { client_id, seq },
        payload: reader.rest().to_vec(),
    })
}

fn put_instance_record(buf: &mut BytesMut, record: &InstanceRecord) {
    buf.put_i32(record.id.into());
    buf.put_i32(record.view.into());
    buf.put_u8(record.state as u8);
    match &record.value {
        Some(value) => put_value(buf, value),
        None => buf.put_i32(-1),
    }
}

fn get_instance_record(reader: &mut Reader<'_>) -> Result<InstanceRecord> {
    let id = SeqNo::from(reader.get_i32()?);
    let view = View::from(reader.get_i32()?);
    let state =
        LogEntryState::from_u8(reader.get_u8()?).ok_or(Error::Codec("unknown entry state"))?;
    let value = get_value(reader)?;
    Ok(InstanceRecord {
        id,
        view,
        state,
        value,
    })
}

fn put_client_batch_id(buf: &mut BytesMut, id: &ClientBatchId) {
    buf.put_i32(u32::from(id.replica) as i32);
    buf.put_i32(id.seq.into());
}

fn get_client_batch_id(reader: &mut Reader<'_>) -> Result<ClientBatchId> {
    let replica = reader.get_i32()?;
    if replica < 0 {
        return Err(Error::Codec("negative replica id"));
    }
    let seq = SeqNo::from(reader.get_i32()?);
    Ok(ClientBatchId {
        replica: ReplicaId::from(replica as u32),
        seq,
    })
}

fn put_client_request(buf: &mut BytesMut, request: &ClientRequest) {
    buf.put_i64(request.id.client_id);
    buf.put_i32(request.id.seq);
    put_value(buf, &request.payload);
}

fn get_client_request(reader: &mut Reader<'_>) -> Result<ClientRequest> {
    let client_id = reader.get_i64()?;
    let seq = reader.get_i32()?;
    let payload = get_value(reader)?.ok_or(Error::Codec("request without payload"))?;
    Ok(ClientRequest {
        id: RequestId { client_id, seq },
        payload,
    })
}

fn put_value(buf: &mut BytesMut, value: &[u8]) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value);
}

fn get_value(reader: &mut Reader<'_>) -> Result<Option<Vec<u8>>> {
    let len = reader.get_i32()?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(reader.get_bytes(len as usize)?.to_vec()))
}

/// Bounds-checked reader over a received frame. The `bytes::Buf`
/// accessors panic on underflow, which a remote peer must not be able
/// to trigger.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Codec("message truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_i32(&mut self) -> Result<i32> {
        let bytes = self.get_bytes(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn get_i64(&mut self) -> Result<i64> {
        let bytes = self.get_bytes(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// A non-negative element count, sanity-bounded by the frame size.
    fn get_len(&mut self) -> Result<usize> {
        let n = self.get_i32()?;
        if n < 0 || n as usize > self.buf.len() {
            return Err(Error::Codec("implausible element count"));
        }
        Ok(n as usize)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::snapshot::Snapshot;

    fn roundtrip(message: Message) -> Message {
        let bytes = serialize_message(&message);
        deserialize_message(&bytes).expect("roundtrip failed")
    }

    #[test]
    fn prepare_ok_roundtrip() {
        let records = vec![
            InstanceRecord {
                id: SeqNo::from(3),
                view: View::from(2),
                state: LogEntryState::Known,
                value: Some(vec![1, 2, 3]),
            },
            InstanceRecord {
                id: SeqNo::from(4),
                view: View::ZERO,
                state: LogEntryState::Unknown,
                value: None,
            },
        ];
        let message = Message::with_sent_time(
            View::from(2),
            77,
            MessageKind::PrepareOk(records.clone()),
        );
        let back = roundtrip(message);
        match back.into_kind() {
            MessageKind::PrepareOk(got) => assert_eq!(got, records),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn catch_up_query_roundtrip() {
        let query = CatchUpQuery {
            periodic: true,
            snapshot_request: false,
            instance_ids: vec![SeqNo::from(5), SeqNo::from(9)],
            instance_ranges: vec![(SeqNo::from(1), SeqNo::from(3))],
        };
        let message = Message::new(View::from(1), MessageKind::CatchUpQuery(query));
        let back = roundtrip(message);
        match back.into_kind() {
            MessageKind::CatchUpQuery(q) => {
                assert!(q.periodic);
                assert!(!q.snapshot_request);
                assert_eq!(q.instance_ids, vec![SeqNo::from(5), SeqNo::from(9)]);
                assert_eq!(q.instance_ranges, vec![(SeqNo::from(1), SeqNo::from(3))]);
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let snapshot = Snapshot {
            next_instance_id: SeqNo::from(10),
            last_replies: vec![(
                42,
                Reply::new(RequestId::new(42, 1), b"done".to_vec()),
            )],
            value: b"state".to_vec(),
        };
        let message = Message::new(
            View::from(4),
            MessageKind::CatchUpSnapshot {
                request_time: 123,
                snapshot: snapshot.clone(),
            },
        );
        let back = roundtrip(message);
        match back.into_kind() {
            MessageKind::CatchUpSnapshot {
                request_time,
                snapshot: got,
            } => {
                assert_eq!(request_time, 123);
                assert_eq!(got, snapshot);
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn forward_batch_roundtrip() {
        let forward = ForwardedClientBatch {
            batch_id: ClientBatchId {
                replica: ReplicaId::from(1),
                seq: SeqNo::from(7),
            },
            requests: vec![ClientRequest::new(RequestId::new(9, 1), b"A".to_vec())],
        };
        let message = Message::new(View::ZERO, MessageKind::ForwardClientBatch(forward));
        let back = roundtrip(message);
        match back.into_kind() {
            MessageKind::ForwardClientBatch(f) => {
                assert_eq!(f.batch_id.replica, ReplicaId::from(1));
                assert_eq!(f.batch_id.seq, SeqNo::from(7));
                assert_eq!(f.requests.len(), 1);
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let message = Message::new(
            View::from(1),
            MessageKind::Propose {
                id: SeqNo::from(2),
                value: vec![0; 32],
            },
        );
        let bytes = serialize_message(&message);
        assert!(deserialize_message(&bytes[..bytes.len() - 5]).is_err());
        assert!(deserialize_message(&[]).is_err());
    }

    #[test]
    fn client_command_roundtrip() {
        let command = ClientCommand::Request(ClientRequest::new(
            RequestId::new(42, 1),
            b"A".to_vec(),
        ));
        let bytes = serialize_client_command(&command);
        match deserialize_client_command(&bytes).unwrap() {
            ClientCommand::Request(request) => {
                assert_eq!(request.id, RequestId::new(42, 1));
                assert_eq!(request.payload, b"A");
            }
            other => panic!("wrong command: {:?}", other),
        }

        match deserialize_client_command(&[9]).unwrap() {
            ClientCommand::Unknown(9) => {}
            other => panic!("wrong command: {:?}", other),
        }
    }
}
