// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! libp2p-TLS certificate generation and verification (§4.8): a self-signed
//! certificate with an embedded identity proof binding the peer's
//! long-lived libp2p key to the TLS certificate's SPKI.

use lazy_static::lazy_static;
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use x509_parser::der_parser::oid::Oid;
use x509_parser::prelude::*;

use crate::error::TlsError;
use crate::peer::{Keypair, PeerId, PublicKey};
use crate::stats;
use crate::tls::signed_key;

/// OID of the libp2p-TLS extension carrying the `SignedKey`, critical (§6).
pub const LIBP2P_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 53594, 1, 1];

/// ALPN identifier libp2p negotiates over TLS 1.3 (§4.8, §6). The TLS state
/// machine itself is an external collaborator (§1 non-goals); this constant
/// is for callers to wire into their own `rustls`/`ServerConfig` ALPN list
/// alongside mutual-authentication requirements.
pub const ALPN_PROTOCOL: &[u8] = b"libp2p";

const SIGNING_PREFIX: &[u8] = b"libp2p-tls-handshake:";

lazy_static! {
    static ref EXTENSION_OID: Oid<'static> = Oid::from(LIBP2P_EXTENSION_OID)
        .expect("libp2p extension OID is a valid arc sequence");
}

/// A freshly generated self-signed certificate and its TLS private key,
/// both DER-encoded, ready to hand to a TLS implementation.
pub struct GeneratedCertificate {
    pub certificate_der: Vec<u8>,
    pub private_key_der: Vec<u8>,
}

/// Generates an ephemeral P-256 TLS keypair, signs its SPKI with the
/// long-lived `identity` key, and embeds the resulting `SignedKey` in a
/// self-signed certificate (§4.8 generation steps 1-5).
pub fn generate(identity: &Keypair) -> Result<GeneratedCertificate, TlsError> {
    let tls_keypair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TlsError::Asn1Error(e.to_string()))?;
    let spki_der = tls_keypair.public_key_der();

    let mut message = Vec::with_capacity(SIGNING_PREFIX.len() + spki_der.len());
    message.extend_from_slice(SIGNING_PREFIX);
    message.extend_from_slice(&spki_der);

    let signature = identity
        .sign(&message)
        .map_err(|e| TlsError::Asn1Error(e.to_string()))?;
    let signed_key_der = signed_key::encode(&identity.public().encode_protobuf(), &signature);

    let mut extension = CustomExtension::from_oid_content(LIBP2P_EXTENSION_OID, signed_key_der);
    extension.set_criticality(true);

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| TlsError::Asn1Error(e.to_string()))?;
    params.custom_extensions.push(extension);

    let cert = params
        .self_signed(&tls_keypair)
        .map_err(|e| TlsError::Asn1Error(e.to_string()))?;

    Ok(GeneratedCertificate {
        certificate_der: cert.der().to_vec(),
        private_key_der: tls_keypair.serialize_der(),
    })
}

/// Verifies a peer's libp2p-TLS certificate and returns the [`PeerId`] it
/// attests to (§4.8 verification steps 1-3). If `expected_peer` is given,
/// a mismatch is rejected rather than silently accepted.
pub fn verify(cert_der: &[u8], expected_peer: Option<PeerId>) -> Result<PeerId, TlsError> {
    match verify_inner(cert_der, expected_peer) {
        Ok(peer_id) => {
            stats::TLS_HANDSHAKE_VERIFIED.inc();
            Ok(peer_id)
        }
        Err(e) => {
            stats::TLS_HANDSHAKE_REJECTED.inc();
            Err(e)
        }
    }
}

fn verify_inner(cert_der: &[u8], expected_peer: Option<PeerId>) -> Result<PeerId, TlsError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| TlsError::Asn1Error(e.to_string()))?;

    let now = ASN1Time::now();
    if now < cert.validity().not_before {
        return Err(TlsError::CertificateNotYetValid);
    }
    if now > cert.validity().not_after {
        return Err(TlsError::CertificateExpired);
    }

    cert.verify_signature(None).map_err(|_| TlsError::NotSelfSigned)?;

    let extension = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid == *EXTENSION_OID)
        .ok_or(TlsError::MissingLibp2pExtension)?;

    let (public_key_bytes, signature) = signed_key::decode(extension.value)?;
    let public_key = PublicKey::try_decode_protobuf(&public_key_bytes)
        .map_err(|_| TlsError::UnsupportedKeyType)?;

    let spki_der = cert.public_key().raw;
    let mut message = Vec::with_capacity(SIGNING_PREFIX.len() + spki_der.len());
    message.extend_from_slice(SIGNING_PREFIX);
    message.extend_from_slice(spki_der);

    if !public_key.verify(&message, &signature) {
        return Err(TlsError::InvalidExtensionSignature);
    }

    let peer_id = PeerId::from_public_key(&public_key);
    if let Some(expected) = expected_peer {
        if expected != peer_id {
            return Err(TlsError::PeerIdMismatch);
        }
    }

    Ok(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_verify_yields_the_signing_peer_id() {
        let identity = Keypair::generate_ed25519();
        let expected = PeerId::from_public_key(&identity.public());
        let generated = generate(&identity).expect("certificate generation succeeds");
        let peer_id =
            verify(&generated.certificate_der, None).expect("freshly generated cert verifies");
        assert_eq!(peer_id, expected);
    }

    #[test]
    fn verify_rejects_mismatched_expected_peer() {
        let identity = Keypair::generate_ed25519();
        let generated = generate(&identity).expect("certificate generation succeeds");
        let other = PeerId::random();
        let err = verify(&generated.certificate_der, Some(other)).unwrap_err();
        assert!(matches!(err, TlsError::PeerIdMismatch));
    }

    #[test]
    fn verify_rejects_a_certificate_with_no_libp2p_extension() {
        let tls_keypair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let cert = params.self_signed(&tls_keypair).unwrap();
        let err = verify(cert.der(), None).unwrap_err();
        assert!(matches!(err, TlsError::MissingLibp2pExtension));
    }
}
