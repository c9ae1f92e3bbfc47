// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Error kinds, one enum per closed surface named in §7 of the design.

use crate::interfaces::GateStage;
use crate::relay::HopStatus;

/// Errors raised by the connection pool and its auxiliaries (backoff,
/// reconnection, health monitoring, gating).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("gated at {0:?} stage")]
    Gated(GateStage),
    #[error("stream closed")]
    StreamClosed,
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("operation timed out")]
    Timeout,
}

/// Circuit Relay v2 errors (§7, reservation/circuit family).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("reservation failed with status {0:?}")]
    ReservationFailed(HopStatus),
    #[error("connection through relay failed with status {0:?}")]
    ConnectionFailed(HopStatus),
    #[error("no live reservation for target")]
    NoReservation,
    #[error("circuit data/duration limit exceeded")]
    LimitExceeded,
    #[error("circuit closed")]
    CircuitClosed,
    #[error("resource limit exceeded")]
    ResourceLimitExceeded,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("operation timed out")]
    Timeout,
}

/// libp2p-TLS identity binding errors (§7).
#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("certificate is missing the libp2p extension")]
    MissingLibp2pExtension,
    #[error("signature over the TLS SPKI does not verify against the embedded public key")]
    InvalidExtensionSignature,
    #[error("certificate peer id does not match the expected peer id")]
    PeerIdMismatch,
    #[error("certificate is not self-signed")]
    NotSelfSigned,
    #[error("unsupported key type in certificate")]
    UnsupportedKeyType,
    #[error("certificate has expired")]
    CertificateExpired,
    #[error("certificate is not yet valid")]
    CertificateNotYetValid,
    #[error("ASN.1 parsing error: {0}")]
    Asn1Error(String),
}

/// Plumtree errors (§7).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlumtreeError {
    #[error("plumtree service has not been started")]
    NotStarted,
    #[error("message exceeds the configured maximum size")]
    MessageTooLarge,
    #[error("invalid message")]
    InvalidMessage,
    #[error("failed to decode message: {0}")]
    DecodingFailed(String),
    #[error("not subscribed to topic")]
    NotSubscribed,
}
