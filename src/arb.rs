// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! `Arbitrary` wrappers for the wire types exercised by the round-trip
//! properties in §8. Plain `prost`-generated structs can't implement
//! `Arbitrary` themselves (orphan rules), so each gets an `ArbXxx(pub T)`
//! wrapper here, mirroring the teacher's `arb.rs`.

use quickcheck::Arbitrary;

use crate::plumtree::messages::pb as plumtree_pb;
use crate::relay::messages::pb as relay_pb;
use crate::tls::signed_key;

fn arbitrary_bytes(g: &mut quickcheck::Gen, max_len: usize) -> Vec<u8> {
    let len = usize::arbitrary(g) % (max_len + 1);
    (0..len).map(|_| u8::arbitrary(g)).collect()
}

fn arbitrary_peer_info(g: &mut quickcheck::Gen) -> relay_pb::PeerInfo {
    let addr_count = usize::arbitrary(g) % 4;
    relay_pb::PeerInfo {
        id: arbitrary_bytes(g, 64),
        addrs: (0..addr_count).map(|_| arbitrary_bytes(g, 32)).collect(),
    }
}

fn arbitrary_limit(g: &mut quickcheck::Gen) -> relay_pb::Limit {
    relay_pb::Limit {
        duration: u32::arbitrary(g),
        data: u64::arbitrary(g),
    }
}

/// A `HopMessage` with internally consistent (if not semantically valid)
/// optional sub-messages, so decoding it back never panics.
#[derive(Clone, Debug)]
pub struct ArbHopMessage(pub relay_pb::HopMessage);

impl Arbitrary for ArbHopMessage {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let r#type = *g
            .choose(&[
                relay_pb::hop_message::Type::Reserve,
                relay_pb::hop_message::Type::Connect,
                relay_pb::hop_message::Type::Status,
            ])
            .unwrap();
        let status = *g
            .choose(&[
                relay_pb::hop_message::Status::Ok,
                relay_pb::hop_message::Status::ReservationRefused,
                relay_pb::hop_message::Status::ResourceLimitExceeded,
                relay_pb::hop_message::Status::PermissionDenied,
                relay_pb::hop_message::Status::ConnectionFailed,
                relay_pb::hop_message::Status::NoReservation,
                relay_pb::hop_message::Status::MalformedMessage,
                relay_pb::hop_message::Status::UnexpectedMessage,
            ])
            .unwrap();
        let reservation = bool::arbitrary(g).then(|| relay_pb::ReservationInfo {
            expire: u64::arbitrary(g),
            addrs: (0..usize::arbitrary(g) % 4).map(|_| arbitrary_bytes(g, 32)).collect(),
            voucher: arbitrary_bytes(g, 64),
        });
        Self(relay_pb::HopMessage {
            r#type: r#type as i32,
            peer: bool::arbitrary(g).then(|| arbitrary_peer_info(g)),
            reservation,
            limit: bool::arbitrary(g).then(|| arbitrary_limit(g)),
            status: status as i32,
        })
    }
}

/// A `StopMessage`, same generation strategy as [`ArbHopMessage`].
#[derive(Clone, Debug)]
pub struct ArbStopMessage(pub relay_pb::StopMessage);

impl Arbitrary for ArbStopMessage {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let r#type = *g
            .choose(&[
                relay_pb::stop_message::Type::Connect,
                relay_pb::stop_message::Type::Status,
            ])
            .unwrap();
        let status = *g
            .choose(&[
                relay_pb::stop_message::Status::Ok,
                relay_pb::stop_message::Status::ResourceLimitExceeded,
                relay_pb::stop_message::Status::PermissionDenied,
                relay_pb::stop_message::Status::ConnectionFailed,
                relay_pb::stop_message::Status::MalformedMessage,
                relay_pb::stop_message::Status::UnexpectedMessage,
            ])
            .unwrap();
        Self(relay_pb::StopMessage {
            r#type: r#type as i32,
            peer: bool::arbitrary(g).then(|| arbitrary_peer_info(g)),
            limit: bool::arbitrary(g).then(|| arbitrary_limit(g)),
            status: status as i32,
        })
    }
}

/// A `PlumtreeRpc` with zero or more entries in each repeated field.
#[derive(Clone, Debug)]
pub struct ArbPlumtreeRpc(pub plumtree_pb::PlumtreeRpc);

impl Arbitrary for ArbPlumtreeRpc {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let gossip_count = usize::arbitrary(g) % 3;
        let ihave_count = usize::arbitrary(g) % 3;
        let graft_count = usize::arbitrary(g) % 3;
        let prune_count = usize::arbitrary(g) % 3;
        Self(plumtree_pb::PlumtreeRpc {
            gossip: (0..gossip_count)
                .map(|_| plumtree_pb::PlumtreeGossip {
                    message_id: arbitrary_bytes(g, 40),
                    topic: String::arbitrary(g),
                    data: arbitrary_bytes(g, 256),
                    source: arbitrary_bytes(g, 40),
                    hop_count: u32::arbitrary(g),
                })
                .collect(),
            ihave: (0..ihave_count)
                .map(|_| plumtree_pb::PlumtreeIHave {
                    message_id: arbitrary_bytes(g, 40),
                    topic: String::arbitrary(g),
                })
                .collect(),
            graft: (0..graft_count)
                .map(|_| plumtree_pb::PlumtreeGraft {
                    message_id: arbitrary_bytes(g, 40),
                    topic: String::arbitrary(g),
                })
                .collect(),
            prune: (0..prune_count)
                .map(|_| plumtree_pb::PlumtreePrune {
                    topic: String::arbitrary(g),
                })
                .collect(),
        })
    }
}

/// A DER-encoded `SignedKey`, generated by encoding arbitrary octet strings
/// rather than arbitrary DER, so every generated value parses (§8 round-trip
/// law covers `encode`/`decode` agreement, not DER-parser robustness).
#[derive(Clone, Debug)]
pub struct ArbSignedKey {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub der: Vec<u8>,
}

impl Arbitrary for ArbSignedKey {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let public_key = arbitrary_bytes(g, 128);
        let signature = arbitrary_bytes(g, 128);
        let der = signed_key::encode(&public_key, &signature);
        Self {
            public_key,
            signature,
            der,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn hop_message_round_trips_through_the_wire(msg: ArbHopMessage) -> bool {
        let encoded = msg.0.encode_to_vec();
        let decoded = relay_pb::HopMessage::decode(&encoded[..]).unwrap();
        decoded == msg.0
    }

    #[quickcheck]
    fn stop_message_round_trips_through_the_wire(msg: ArbStopMessage) -> bool {
        let encoded = msg.0.encode_to_vec();
        let decoded = relay_pb::StopMessage::decode(&encoded[..]).unwrap();
        decoded == msg.0
    }

    #[quickcheck]
    fn plumtree_rpc_round_trips_through_the_wire(msg: ArbPlumtreeRpc) -> bool {
        let encoded = msg.0.encode_to_vec();
        let decoded = plumtree_pb::PlumtreeRpc::decode(&encoded[..]).unwrap();
        decoded == msg.0
    }

    #[quickcheck]
    fn signed_key_round_trips_through_der(key: ArbSignedKey) -> bool {
        let (public_key, signature) = signed_key::decode(&key.der).unwrap();
        public_key == key.public_key && signature == key.signature
    }
}
