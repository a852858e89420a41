//! Minimal DER writer for certificate requests and client certificates
//!
//! Only the handful of ASN.1 types a PKCS#10 request and an X.509 v3
//! certificate need. Subject names are encoded one attribute per RDN, so
//! repeated attribute types (several OUs) survive intact.

use time::{OffsetDateTime, UtcOffset};

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0_CONSTRUCTED: u8 = 0xa0;

/// id-at-commonName
pub(crate) const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
/// id-at-organizationalUnitName
pub(crate) const OID_ORGANIZATIONAL_UNIT: &[u64] = &[2, 5, 4, 11];
/// id-ecPublicKey
pub(crate) const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
/// prime256v1
pub(crate) const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
/// ecdsa-with-SHA256
pub(crate) const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
/// id-ce-basicConstraints
pub(crate) const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
/// id-ce-keyUsage
pub(crate) const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
/// id-ce-extKeyUsage
pub(crate) const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
/// id-kp-clientAuth
pub(crate) const OID_CLIENT_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 2];

/// keyUsage digitalSignature, bit 0
pub(crate) const KEY_USAGE_DIGITAL_SIGNATURE: u8 = 0x80;

fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let significant = &bytes[first..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Encode a single tag-length-value triple
pub(crate) fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_len(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

pub(crate) fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

pub(crate) fn set(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SET, &parts.concat())
}

pub(crate) fn oid(arcs: &[u64]) -> Vec<u8> {
    let mut content = Vec::new();
    if arcs.len() >= 2 {
        push_base128(arcs[0] * 40 + arcs[1], &mut content);
    }
    for arc in arcs.iter().skip(2) {
        push_base128(*arc, &mut content);
    }
    tlv(TAG_OID, &content)
}

fn push_base128(mut value: u64, out: &mut Vec<u8>) {
    let mut groups = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        groups.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    groups.reverse();
    out.extend_from_slice(&groups);
}

pub(crate) fn utf8_string(value: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, value.as_bytes())
}

/// BIT STRING with no unused bits
pub(crate) fn bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(bytes.len() + 1);
    content.push(0);
    content.extend_from_slice(bytes);
    tlv(TAG_BIT_STRING, &content)
}

pub(crate) fn small_integer(value: u8) -> Vec<u8> {
    tlv(TAG_INTEGER, &[value])
}

/// Non-negative INTEGER from big-endian bytes, minimally encoded
pub(crate) fn unsigned_integer(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first..];
    let mut content = Vec::with_capacity(significant.len() + 1);
    if significant.first().is_none_or(|b| b & 0x80 != 0) {
        content.push(0);
    }
    content.extend_from_slice(significant);
    tlv(TAG_INTEGER, &content)
}

pub(crate) fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

pub(crate) fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, bytes)
}

/// Named bit list of up to eight bits, trailing zero bits dropped
pub(crate) fn flag_bits(flags: u8) -> Vec<u8> {
    if flags == 0 {
        return tlv(TAG_BIT_STRING, &[0]);
    }
    tlv(TAG_BIT_STRING, &[flags.trailing_zeros() as u8, flags])
}

/// `[n] EXPLICIT` wrapper
pub(crate) fn explicit(number: u8, content: &[u8]) -> Vec<u8> {
    tlv(TAG_CONTEXT_0_CONSTRUCTED | number, content)
}

/// X.509 Time: UTCTime through 2049, GeneralizedTime after
pub(crate) fn x509_time(at: OffsetDateTime) -> Vec<u8> {
    let at = at.to_offset(UtcOffset::UTC);
    let rest = format!(
        "{:02}{:02}{:02}{:02}{:02}Z",
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    );
    if (1950..2050).contains(&at.year()) {
        tlv(TAG_UTC_TIME, format!("{:02}{}", at.year() % 100, rest).as_bytes())
    } else {
        tlv(TAG_GENERALIZED_TIME, format!("{:04}{}", at.year(), rest).as_bytes())
    }
}

/// A certificate extension wrapping an already encoded value
pub(crate) fn extension(extension_oid: &[u64], critical: bool, value: &[u8]) -> Vec<u8> {
    if critical {
        sequence(&[&oid(extension_oid), &boolean(true), &octet_string(value)])
    } else {
        sequence(&[&oid(extension_oid), &octet_string(value)])
    }
}

/// Empty `[0] IMPLICIT SET OF Attribute`
pub(crate) fn empty_attributes() -> Vec<u8> {
    tlv(TAG_CONTEXT_0_CONSTRUCTED, &[])
}

/// Encode an X.501 Name with one attribute per relative distinguished name
pub(crate) fn name(attributes: &[(&[u64], &str)]) -> Vec<u8> {
    let rdns: Vec<Vec<u8>> = attributes
        .iter()
        .map(|(attr_oid, value)| {
            let type_and_value = sequence(&[&oid(attr_oid), &utf8_string(value)]);
            set(&[&type_and_value])
        })
        .collect();
    let parts: Vec<&[u8]> = rdns.iter().map(Vec::as_slice).collect();
    sequence(&parts)
}

/// SubjectPublicKeyInfo for an uncompressed P-256 point
pub(crate) fn p256_public_key_info(point: &[u8]) -> Vec<u8> {
    let algorithm = sequence(&[&oid(OID_EC_PUBLIC_KEY), &oid(OID_PRIME256V1)]);
    sequence(&[&algorithm, &bit_string(point)])
}
