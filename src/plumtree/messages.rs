// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Protobuf wire types for the Plumtree RPC envelope (§4.12) and the
//! length-prefix varint framing used to put them on a [`crate::MuxedStream`].

use bytes::{BufMut, BytesMut};
use prost::Message;

#[allow(clippy::all)]
pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/p2p_core.plumtree.pb.rs"));
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

/// Decodes a length-prefixed protobuf message from a byte buffer.
pub fn decode<M: Message + Default>(mut data: &[u8]) -> std::io::Result<M> {
    M::decode(&mut data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}
