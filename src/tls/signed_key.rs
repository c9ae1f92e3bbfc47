// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! ASN.1 `SignedKey ::= SEQUENCE { publicKey OCTET STRING, signature OCTET
//! STRING }` (§4.8 step 4): binds a protobuf-encoded libp2p public key to a
//! signature over the TLS certificate's SPKI.

use crate::error::TlsError;

/// DER-encodes a `SignedKey` sequence from its two octet strings.
pub fn encode(public_key_protobuf: &[u8], signature: &[u8]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_bytes(public_key_protobuf);
            writer.next().write_bytes(signature);
        })
    })
}

/// Parses a DER `SignedKey` sequence, returning `(publicKey, signature)`.
pub fn decode(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TlsError> {
    yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let public_key = reader.next().read_bytes()?;
            let signature = reader.next().read_bytes()?;
            Ok((public_key, signature))
        })
    })
    .map_err(|e| TlsError::Asn1Error(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_key_round_trips() {
        let der = encode(b"public-key-bytes", b"signature-bytes");
        let (pk, sig) = decode(&der).unwrap();
        assert_eq!(pk, b"public-key-bytes");
        assert_eq!(sig, b"signature-bytes");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
