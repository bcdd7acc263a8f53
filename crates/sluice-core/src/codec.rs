//! CBOR wire codec for stream messages.
//!
//! Each message is a definite-length CBOR array whose first element is a
//! numeric tag. Unknown tags and malformed envelopes are rejected; the
//! transport wraps the result in its own length framing.

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::flags::{MarkerFlags, StreamFlags, UnknownFlags};
use crate::item::Item;
use crate::message::{
    EndReason, StreamMessage, UnknownEndReason, UnknownVBucketState, VBucketState,
};
use crate::seqno::{Opaque, Seqno, VbUuid, Vbid};

const TAG_SNAPSHOT_MARKER: u32 = 1;
const TAG_MUTATION: u32 = 2;
const TAG_DELETION: u32 = 3;
const TAG_EXPIRATION: u32 = 4;
const TAG_SET_VBUCKET_STATE: u32 = 5;
const TAG_STREAM_END: u32 = 6;
const TAG_BUFFER_ACK: u32 = 7;
const TAG_SNAPSHOT_MARKER_ACK: u32 = 8;
const TAG_SET_VBUCKET_STATE_RESPONSE: u32 = 9;
const TAG_ADD_STREAM_RESPONSE: u32 = 10;
const TAG_STREAM_REQUEST: u32 = 11;

#[derive(Debug, Error)]
pub enum WireEncodeError {
    #[error("cbor encode failed: {0}")]
    Cbor(String),
}

#[derive(Debug, Error)]
pub enum WireDecodeError {
    #[error("cbor decode failed: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("message envelope invalid: {reason}")]
    BadEnvelope { reason: &'static str },
    #[error("unknown message tag {got}")]
    UnknownTag { got: u32 },
    #[error(transparent)]
    UnknownEndReason(#[from] UnknownEndReason),
    #[error(transparent)]
    UnknownVBucketState(#[from] UnknownVBucketState),
    #[error(transparent)]
    UnknownFlags(#[from] UnknownFlags),
}

pub fn encode_message(msg: &StreamMessage) -> Result<Vec<u8>, WireEncodeError> {
    let mut e = Encoder::new(Vec::with_capacity(msg.size()));
    let result = match msg {
        StreamMessage::SnapshotMarker {
            opaque,
            vbucket,
            start,
            end,
            flags,
        } => e
            .array(6)
            .and_then(|e| e.u32(TAG_SNAPSHOT_MARKER))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u16(vbucket.get()))
            .and_then(|e| e.u64(start.get()))
            .and_then(|e| e.u64(end.get()))
            .and_then(|e| e.u32(flags.bits()))
            .map(|_| ()),
        StreamMessage::Mutation { opaque, item } => encode_item(&mut e, TAG_MUTATION, *opaque, item),
        StreamMessage::Deletion { opaque, item } => {
            encode_keyed(&mut e, TAG_DELETION, *opaque, item)
        }
        StreamMessage::Expiration { opaque, item } => {
            encode_keyed(&mut e, TAG_EXPIRATION, *opaque, item)
        }
        StreamMessage::SetVBucketState {
            opaque,
            vbucket,
            state,
        } => e
            .array(4)
            .and_then(|e| e.u32(TAG_SET_VBUCKET_STATE))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u16(vbucket.get()))
            .and_then(|e| e.u8(state.wire_code()))
            .map(|_| ()),
        StreamMessage::StreamEnd {
            opaque,
            vbucket,
            reason,
        } => e
            .array(4)
            .and_then(|e| e.u32(TAG_STREAM_END))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u16(vbucket.get()))
            .and_then(|e| e.u32(reason.wire_code()))
            .map(|_| ()),
        StreamMessage::BufferAck {
            opaque,
            vbucket,
            bytes,
        } => e
            .array(4)
            .and_then(|e| e.u32(TAG_BUFFER_ACK))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u16(vbucket.get()))
            .and_then(|e| e.u32(*bytes))
            .map(|_| ()),
        StreamMessage::SnapshotMarkerAck {
            opaque,
            vbucket,
            status,
        } => encode_status(&mut e, TAG_SNAPSHOT_MARKER_ACK, *opaque, *vbucket, *status),
        StreamMessage::SetVBucketStateResponse {
            opaque,
            vbucket,
            status,
        } => encode_status(
            &mut e,
            TAG_SET_VBUCKET_STATE_RESPONSE,
            *opaque,
            *vbucket,
            *status,
        ),
        StreamMessage::AddStreamResponse {
            opaque,
            add_opaque,
            status,
        } => e
            .array(4)
            .and_then(|e| e.u32(TAG_ADD_STREAM_RESPONSE))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u32(add_opaque.get()))
            .and_then(|e| e.u16(*status))
            .map(|_| ()),
        StreamMessage::StreamRequest {
            opaque,
            vbucket,
            flags,
            start,
            end,
            vb_uuid,
            snap_start,
            snap_end,
        } => e
            .array(9)
            .and_then(|e| e.u32(TAG_STREAM_REQUEST))
            .and_then(|e| e.u32(opaque.get()))
            .and_then(|e| e.u16(vbucket.get()))
            .and_then(|e| e.u32(flags.bits()))
            .and_then(|e| e.u64(start.get()))
            .and_then(|e| e.u64(end.get()))
            .and_then(|e| e.u64(vb_uuid.get()))
            .and_then(|e| e.u64(snap_start.get()))
            .and_then(|e| e.u64(snap_end.get()))
            .map(|_| ()),
    };
    result.map_err(|err| WireEncodeError::Cbor(err.to_string()))?;
    Ok(e.into_writer())
}

type EncodeResult = Result<(), minicbor::encode::Error<core::convert::Infallible>>;

fn encode_item(
    e: &mut Encoder<Vec<u8>>,
    tag: u32,
    opaque: Opaque,
    item: &Item,
) -> EncodeResult {
    e.array(7)?
        .u32(tag)?
        .u32(opaque.get())?
        .u16(item.vbucket().get())?
        .u64(item.seqno().get())?
        .bytes(item.key())?
        .bytes(item.value())?
        .u32(item.expiry())?;
    Ok(())
}

fn encode_keyed(
    e: &mut Encoder<Vec<u8>>,
    tag: u32,
    opaque: Opaque,
    item: &Item,
) -> EncodeResult {
    e.array(5)?
        .u32(tag)?
        .u32(opaque.get())?
        .u16(item.vbucket().get())?
        .u64(item.seqno().get())?
        .bytes(item.key())?;
    Ok(())
}

fn encode_status(
    e: &mut Encoder<Vec<u8>>,
    tag: u32,
    opaque: Opaque,
    vbucket: Vbid,
    status: u16,
) -> EncodeResult {
    e.array(4)?
        .u32(tag)?
        .u32(opaque.get())?
        .u16(vbucket.get())?
        .u16(status)?;
    Ok(())
}

pub fn decode_message(bytes: &[u8]) -> Result<StreamMessage, WireDecodeError> {
    let mut d = Decoder::new(bytes);
    let len = d.array()?.ok_or(WireDecodeError::BadEnvelope {
        reason: "indefinite-length envelope",
    })?;
    let tag = d.u32()?;
    let msg = match tag {
        TAG_SNAPSHOT_MARKER => {
            expect_len(len, 6)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let start = Seqno::new(d.u64()?);
            let end = Seqno::new(d.u64()?);
            let flags = MarkerFlags::from_bits(d.u32()?)?;
            flags
                .snapshot_type()
                .map_err(|_| WireDecodeError::BadEnvelope {
                    reason: "marker names no snapshot type",
                })?;
            StreamMessage::SnapshotMarker {
                opaque,
                vbucket,
                start,
                end,
                flags,
            }
        }
        TAG_MUTATION => {
            expect_len(len, 7)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let seqno = Seqno::new(d.u64()?);
            let key = Bytes::copy_from_slice(d.bytes()?);
            let value = Bytes::copy_from_slice(d.bytes()?);
            let expiry = d.u32()?;
            StreamMessage::Mutation {
                opaque,
                item: Item::mutation(vbucket, seqno, key, value, expiry),
            }
        }
        TAG_DELETION | TAG_EXPIRATION => {
            expect_len(len, 5)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let seqno = Seqno::new(d.u64()?);
            let key = Bytes::copy_from_slice(d.bytes()?);
            let item = if tag == TAG_DELETION {
                Item::deletion(vbucket, seqno, key)
            } else {
                Item::expiration(vbucket, seqno, key)
            };
            if tag == TAG_DELETION {
                StreamMessage::Deletion { opaque, item }
            } else {
                StreamMessage::Expiration { opaque, item }
            }
        }
        TAG_SET_VBUCKET_STATE => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let state = VBucketState::from_wire_code(d.u8()?)?;
            StreamMessage::SetVBucketState {
                opaque,
                vbucket,
                state,
            }
        }
        TAG_STREAM_END => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let reason = EndReason::from_wire_code(d.u32()?)?;
            StreamMessage::StreamEnd {
                opaque,
                vbucket,
                reason,
            }
        }
        TAG_BUFFER_ACK => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let bytes = d.u32()?;
            StreamMessage::BufferAck {
                opaque,
                vbucket,
                bytes,
            }
        }
        TAG_SNAPSHOT_MARKER_ACK => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let status = d.u16()?;
            StreamMessage::SnapshotMarkerAck {
                opaque,
                vbucket,
                status,
            }
        }
        TAG_SET_VBUCKET_STATE_RESPONSE => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let status = d.u16()?;
            StreamMessage::SetVBucketStateResponse {
                opaque,
                vbucket,
                status,
            }
        }
        TAG_ADD_STREAM_RESPONSE => {
            expect_len(len, 4)?;
            let opaque = Opaque::new(d.u32()?);
            let add_opaque = Opaque::new(d.u32()?);
            let status = d.u16()?;
            StreamMessage::AddStreamResponse {
                opaque,
                add_opaque,
                status,
            }
        }
        TAG_STREAM_REQUEST => {
            expect_len(len, 9)?;
            let opaque = Opaque::new(d.u32()?);
            let vbucket = Vbid::new(d.u16()?);
            let flags = StreamFlags::from_bits(d.u32()?)?;
            let start = Seqno::new(d.u64()?);
            let end = Seqno::new(d.u64()?);
            let vb_uuid = VbUuid::new(d.u64()?);
            let snap_start = Seqno::new(d.u64()?);
            let snap_end = Seqno::new(d.u64()?);
            StreamMessage::StreamRequest {
                opaque,
                vbucket,
                flags,
                start,
                end,
                vb_uuid,
                snap_start,
                snap_end,
            }
        }
        got => return Err(WireDecodeError::UnknownTag { got }),
    };
    Ok(msg)
}

fn expect_len(got: u64, want: u64) -> Result<(), WireDecodeError> {
    if got == want {
        Ok(())
    } else {
        Err(WireDecodeError::BadEnvelope {
            reason: "unexpected field count",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(seqno: u64) -> Item {
        Item::mutation(
            Vbid::new(12),
            Seqno::new(seqno),
            Bytes::from_static(b"key-1"),
            Bytes::from_static(b"value-1"),
            300,
        )
    }

    #[test]
    fn mutation_round_trips() {
        let msg = StreamMessage::Mutation {
            opaque: Opaque::new(88),
            item: sample_item(42),
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn marker_round_trips_with_ack_flag() {
        let msg = StreamMessage::SnapshotMarker {
            opaque: Opaque::new(1),
            vbucket: Vbid::new(12),
            start: Seqno::new(10),
            end: Seqno::new(40),
            flags: MarkerFlags::DISK.union(MarkerFlags::ACK),
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn stream_request_round_trips() {
        let msg = StreamMessage::StreamRequest {
            opaque: Opaque::new(9),
            vbucket: Vbid::new(12),
            flags: StreamFlags::TAKEOVER,
            start: Seqno::new(74),
            end: Seqno::MAX,
            vb_uuid: VbUuid::new(0xfeed),
            snap_start: Seqno::new(74),
            snap_end: Seqno::new(74),
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut e = Encoder::new(Vec::new());
        e.array(2).unwrap().u32(200).unwrap().u32(0).unwrap();
        let err = decode_message(&e.into_writer()).unwrap_err();
        assert!(matches!(err, WireDecodeError::UnknownTag { got: 200 }));
    }

    #[test]
    fn marker_without_type_is_rejected() {
        let mut e = Encoder::new(Vec::new());
        e.array(6)
            .unwrap()
            .u32(TAG_SNAPSHOT_MARKER)
            .unwrap()
            .u32(0)
            .unwrap()
            .u16(1)
            .unwrap()
            .u64(0)
            .unwrap()
            .u64(10)
            .unwrap()
            .u32(MarkerFlags::ACK.bits())
            .unwrap();
        let err = decode_message(&e.into_writer()).unwrap_err();
        assert!(matches!(err, WireDecodeError::BadEnvelope { .. }));
    }

    #[test]
    fn bad_end_reason_is_rejected() {
        let mut e = Encoder::new(Vec::new());
        e.array(4)
            .unwrap()
            .u32(TAG_STREAM_END)
            .unwrap()
            .u32(0)
            .unwrap()
            .u16(1)
            .unwrap()
            .u32(77)
            .unwrap();
        let err = decode_message(&e.into_writer()).unwrap_err();
        assert!(matches!(err, WireDecodeError::UnknownEndReason(_)));
    }
}
