// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Protobuf wire types for Circuit Relay v2 (§4.12) and the length-prefix
//! varint framing used to put them on a [`crate::MuxedStream`].

use bytes::{BufMut, BytesMut};
use prost::Message;

#[allow(clippy::all)]
pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/p2p_core.relay.pb.rs"));
}

/// Status carried in a HOP `STATUS` reply, per §4.12's `HopMessage.Status` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopStatus {
    Ok,
    ReservationRefused,
    ResourceLimitExceeded,
    PermissionDenied,
    ConnectionFailed,
    NoReservation,
    MalformedMessage,
    UnexpectedMessage,
}

impl From<pb::hop_message::Status> for HopStatus {
    fn from(s: pb::hop_message::Status) -> Self {
        use pb::hop_message::Status::*;
        match s {
            Ok => HopStatus::Ok,
            ReservationRefused => HopStatus::ReservationRefused,
            ResourceLimitExceeded => HopStatus::ResourceLimitExceeded,
            PermissionDenied => HopStatus::PermissionDenied,
            ConnectionFailed => HopStatus::ConnectionFailed,
            NoReservation => HopStatus::NoReservation,
            MalformedMessage => HopStatus::MalformedMessage,
            UnexpectedMessage => HopStatus::UnexpectedMessage,
        }
    }
}

impl From<HopStatus> for pb::hop_message::Status {
    fn from(s: HopStatus) -> Self {
        use pb::hop_message::Status::*;
        match s {
            HopStatus::Ok => Ok,
            HopStatus::ReservationRefused => ReservationRefused,
            HopStatus::ResourceLimitExceeded => ResourceLimitExceeded,
            HopStatus::PermissionDenied => PermissionDenied,
            HopStatus::ConnectionFailed => ConnectionFailed,
            HopStatus::NoReservation => NoReservation,
            HopStatus::MalformedMessage => MalformedMessage,
            HopStatus::UnexpectedMessage => UnexpectedMessage,
        }
    }
}

/// Status carried in a STOP `STATUS` reply, per §4.12's `StopMessage.Status` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopStatus {
    Ok,
    ResourceLimitExceeded,
    PermissionDenied,
    ConnectionFailed,
    MalformedMessage,
    UnexpectedMessage,
}

impl From<pb::stop_message::Status> for StopStatus {
    fn from(s: pb::stop_message::Status) -> Self {
        use pb::stop_message::Status::*;
        match s {
            Ok => StopStatus::Ok,
            ResourceLimitExceeded => StopStatus::ResourceLimitExceeded,
            PermissionDenied => StopStatus::PermissionDenied,
            ConnectionFailed => StopStatus::ConnectionFailed,
            MalformedMessage => StopStatus::MalformedMessage,
            UnexpectedMessage => StopStatus::UnexpectedMessage,
        }
    }
}

impl From<StopStatus> for pb::stop_message::Status {
    fn from(s: StopStatus) -> Self {
        use pb::stop_message::Status::*;
        match s {
            StopStatus::Ok => Ok,
            StopStatus::ResourceLimitExceeded => ResourceLimitExceeded,
            StopStatus::PermissionDenied => PermissionDenied,
            StopStatus::ConnectionFailed => ConnectionFailed,
            StopStatus::MalformedMessage => MalformedMessage,
            StopStatus::UnexpectedMessage => UnexpectedMessage,
        }
    }
}

/// Encodes `msg` as a varint length prefix followed by its protobuf bytes.
pub fn frame<M: Message>(msg: &M) -> BytesMut {
    let len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(10 + len);
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    buf.put_slice(unsigned_varint::encode::usize(len, &mut len_buf));
    msg.encode(&mut buf).expect("BytesMut grows unbounded");
    buf
}

/// Decodes a varint length prefix from `data`, returning the declared
/// length and the remaining bytes past the prefix.
pub fn read_length_prefix(data: &[u8]) -> std::io::Result<(usize, &[u8])> {
    unsigned_varint::decode::usize(data)
        .map(|(len, rest)| (len, rest))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Decodes a length-prefixed protobuf message from a byte buffer, advancing
/// past it. Used once a full varint-length-prefixed frame has been read off
/// the wire by the stream's own `read_message`.
pub fn decode<M: Message + Default>(mut data: &[u8]) -> std::io::Result<M> {
    M::decode(&mut data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}
