//! STUN message codec for connectivity checks.
//!
//! Implements the subset of RFC 5389 the checklist engine needs: Binding
//! requests and responses, the ICE attributes of RFC 8445, short-term
//! MESSAGE-INTEGRITY (HMAC-SHA1, key = password) and FINGERPRINT (CRC-32
//! XOR'd with `0x5354554e`).
//!
//! Integrity and fingerprint each cover a prefix of the encoded message with
//! the header length field adjusted to end just past the attribute being
//! computed, so both building and verification work over raw bytes with
//! explicit offsets.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::BufMut;
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use thiserror::Error;

/// STUN magic cookie (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// XOR mask applied to the FINGERPRINT CRC, the ASCII of "STUN".
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const HEADER_LEN: usize = 20;
const TRANSACTION_ID_LEN: usize = 12;
const INTEGRITY_LEN: usize = 20;
/// Encoded size of a MESSAGE-INTEGRITY attribute, header included.
const INTEGRITY_ATTR_LEN: usize = 4 + INTEGRITY_LEN;
/// Encoded size of a FINGERPRINT attribute, header included.
const FINGERPRINT_ATTR_LEN: usize = 8;

const METHOD_BINDING: u16 = 0x0001;

pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802a;

pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_UNAUTHORIZED: u16 = 401;
pub const CODE_UNKNOWN_ATTRIBUTE: u16 = 420;
pub const CODE_STALE_NONCE: u16 = 438;
pub const CODE_ROLE_CONFLICT: u16 = 487;
pub const CODE_SERVER_ERROR: u16 = 500;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// Codec-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("buffer of {0} bytes is shorter than the declared STUN message")]
    UnexpectedEnd(usize),
    #[error("magic cookie mismatch: {0:#010x}")]
    BadMagicCookie(u32),
    #[error("malformed attribute {0:#06x}")]
    BadAttribute(u16),
    #[error("attribute {0:#06x} not present")]
    AttributeNotFound(u16),
    #[error("FINGERPRINT check failed")]
    FingerprintMismatch,
    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityMismatch,
}

/// Class of a STUN message (RFC 5389 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn from_type(message_type: u16) -> Self {
        match ((message_type >> 7) & 0b10) | ((message_type >> 4) & 0b01) {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    fn type_bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageClass::Request => "request",
            MessageClass::Indication => "indication",
            MessageClass::SuccessResponse => "success response",
            MessageClass::ErrorResponse => "error response",
        };
        f.write_str(s)
    }
}

/// 96-bit transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_LEN]);

impl TransactionId {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0u8; TRANSACTION_ID_LEN];
        rng.fill_bytes(&mut id);
        TransactionId(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Whether the buffer plausibly holds a STUN message: header-sized and
/// carrying the magic cookie. Anything else is application data.
pub fn is_message(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Reads the transaction ID without decoding the message.
pub fn peek_transaction_id(buf: &[u8]) -> Option<TransactionId> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut id = [0u8; TRANSACTION_ID_LEN];
    id.copy_from_slice(&buf[8..HEADER_LEN]);
    Some(TransactionId(id))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawAttribute {
    kind: u16,
    value: Vec<u8>,
    /// Offset of the attribute header within the raw message.
    offset: usize,
}

/// A decoded STUN message, retaining the raw bytes so integrity and
/// fingerprint can be verified over the exact wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    raw: Vec<u8>,
    class: MessageClass,
    method: u16,
    transaction_id: TransactionId,
    attributes: Vec<RawAttribute>,
}

impl Message {
    /// Decodes a STUN message. The buffer must start with a valid header;
    /// trailing bytes beyond the declared length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::UnexpectedEnd(buf.len()));
        }
        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::BadMagicCookie(cookie));
        }
        let end = HEADER_LEN + length;
        if buf.len() < end {
            return Err(Error::UnexpectedEnd(buf.len()));
        }
        let transaction_id =
            peek_transaction_id(buf).ok_or(Error::UnexpectedEnd(buf.len()))?;

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset + 4 <= end {
            let kind = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let value_len = usize::from(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
            if offset + 4 + value_len > end {
                return Err(Error::BadAttribute(kind));
            }
            attributes.push(RawAttribute {
                kind,
                value: buf[offset + 4..offset + 4 + value_len].to_vec(),
                offset,
            });
            offset += 4 + value_len;
            offset += (4 - value_len % 4) % 4;
        }

        Ok(Message {
            raw: buf[..end].to_vec(),
            class: MessageClass::from_type(message_type),
            method: extract_method(message_type),
            transaction_id,
            attributes,
        })
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn is_binding(&self) -> bool {
        self.method == METHOD_BINDING
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn get(&self, kind: u16) -> Option<&RawAttribute> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    /// USERNAME attribute as UTF-8, if present and valid.
    pub fn username(&self) -> Option<&str> {
        self.get(ATTR_USERNAME)
            .and_then(|a| std::str::from_utf8(&a.value).ok())
    }

    /// PRIORITY attribute (RFC 8445 §7.1.1).
    pub fn priority(&self) -> Option<u32> {
        let a = self.get(ATTR_PRIORITY)?;
        let value: [u8; 4] = a.value.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(value))
    }

    /// Tie-breaker of the ICE-CONTROLLING attribute.
    pub fn ice_controlling(&self) -> Option<u64> {
        self.tiebreaker_attr(ATTR_ICE_CONTROLLING)
    }

    /// Tie-breaker of the ICE-CONTROLLED attribute.
    pub fn ice_controlled(&self) -> Option<u64> {
        self.tiebreaker_attr(ATTR_ICE_CONTROLLED)
    }

    fn tiebreaker_attr(&self, kind: u16) -> Option<u64> {
        let a = self.get(kind)?;
        let value: [u8; 8] = a.value.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(value))
    }

    /// Whether the USE-CANDIDATE flag attribute is present.
    pub fn use_candidate(&self) -> bool {
        self.get(ATTR_USE_CANDIDATE).is_some()
    }

    /// Numeric code of the ERROR-CODE attribute.
    pub fn error_code(&self) -> Option<u16> {
        let a = self.get(ATTR_ERROR_CODE)?;
        if a.value.len() < 4 {
            return None;
        }
        let class = u16::from(a.value[2] & 0x07);
        let number = u16::from(a.value[3]);
        Some(class * 100 + number)
    }

    /// XOR-MAPPED-ADDRESS, un-XOR'd against the cookie and transaction ID.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        let a = self.get(ATTR_XOR_MAPPED_ADDRESS)?;
        let value = &a.value;
        if value.len() < 8 {
            return None;
        }
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        let cookie = MAGIC_COOKIE.to_be_bytes();
        match value[1] {
            0x01 => {
                let mut octets = [value[4], value[5], value[6], value[7]];
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            0x02 => {
                if value.len() < 20 {
                    return None;
                }
                let mut octets: [u8; 16] = value[4..20].try_into().ok()?;
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
                for (o, t) in octets[4..].iter_mut().zip(self.transaction_id.0) {
                    *o ^= t;
                }
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    }

    /// Verifies the FINGERPRINT attribute: CRC-32 over the message up to the
    /// attribute, with the header length adjusted to end just past it.
    pub fn verify_fingerprint(&self) -> Result<(), Error> {
        let attr = self
            .get(ATTR_FINGERPRINT)
            .ok_or(Error::AttributeNotFound(ATTR_FINGERPRINT))?;
        let mut covered = self.raw[..attr.offset].to_vec();
        patch_length(&mut covered, attr.offset + FINGERPRINT_ATTR_LEN);
        let expected = (CRC32.checksum(&covered) ^ FINGERPRINT_XOR).to_be_bytes();
        if attr.value != expected {
            return Err(Error::FingerprintMismatch);
        }
        Ok(())
    }

    /// Verifies short-term MESSAGE-INTEGRITY (RFC 5389 §15.4) with
    /// `key` = password. The HMAC covers the message up to the attribute,
    /// with the header length adjusted to end just past it.
    pub fn verify_integrity(&self, key: &[u8]) -> Result<(), Error> {
        let attr = self
            .get(ATTR_MESSAGE_INTEGRITY)
            .ok_or(Error::AttributeNotFound(ATTR_MESSAGE_INTEGRITY))?;
        if attr.value.len() != INTEGRITY_LEN {
            return Err(Error::IntegrityMismatch);
        }
        let mut covered = self.raw[..attr.offset].to_vec();
        patch_length(&mut covered, attr.offset + INTEGRITY_ATTR_LEN);
        let expected = hmac_sha1(key, &covered);
        if attr.value != expected {
            return Err(Error::IntegrityMismatch);
        }
        Ok(())
    }
}

fn extract_method(message_type: u16) -> u16 {
    (message_type & 0x000f) | ((message_type & 0x00e0) >> 1) | ((message_type & 0x3e00) >> 2)
}

/// Rewrites the header length field so checksums cover the intended prefix.
fn patch_length(buf: &mut [u8], end: usize) {
    let length = (end - HEADER_LEN) as u16;
    buf[2..4].copy_from_slice(&length.to_be_bytes());
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; INTEGRITY_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC-SHA1 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        CODE_BAD_REQUEST => "Bad Request",
        CODE_UNAUTHORIZED => "Unauthorized",
        CODE_UNKNOWN_ATTRIBUTE => "Unknown Attribute",
        CODE_STALE_NONCE => "Stale Nonce",
        CODE_ROLE_CONFLICT => "Role Conflict",
        CODE_SERVER_ERROR => "Server Error",
        _ => "Error",
    }
}

#[derive(Debug, Clone)]
enum BuildAttribute {
    Username(String),
    Priority(u32),
    IceControlling(u64),
    IceControlled(u64),
    UseCandidate,
    XorMappedAddress(SocketAddr),
    ErrorCode(u16),
    /// Computes HMAC-SHA1 over the message so far with the given key.
    Integrity(Vec<u8>),
    /// Computes CRC-32 over the message so far.
    Fingerprint,
    /// Appends an arbitrary attribute verbatim.
    Raw(u16, Vec<u8>),
}

/// Builds a Binding message. Attributes are encoded in the order the builder
/// methods are called; MESSAGE-INTEGRITY and FINGERPRINT are computed at
/// their position over everything already encoded, so call `integrity` before
/// `fingerprint` and both last.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    class: MessageClass,
    transaction_id: TransactionId,
    attributes: Vec<BuildAttribute>,
}

impl MessageBuilder {
    pub fn request(transaction_id: TransactionId) -> Self {
        Self::with_class(MessageClass::Request, transaction_id)
    }

    pub fn success_response(transaction_id: TransactionId) -> Self {
        Self::with_class(MessageClass::SuccessResponse, transaction_id)
    }

    pub fn error_response(transaction_id: TransactionId) -> Self {
        Self::with_class(MessageClass::ErrorResponse, transaction_id)
    }

    pub fn indication(transaction_id: TransactionId) -> Self {
        Self::with_class(MessageClass::Indication, transaction_id)
    }

    fn with_class(class: MessageClass, transaction_id: TransactionId) -> Self {
        MessageBuilder {
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn username(mut self, username: &str) -> Self {
        self.attributes
            .push(BuildAttribute::Username(username.to_owned()));
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.attributes.push(BuildAttribute::Priority(priority));
        self
    }

    pub fn ice_controlling(mut self, tiebreaker: u64) -> Self {
        self.attributes
            .push(BuildAttribute::IceControlling(tiebreaker));
        self
    }

    pub fn ice_controlled(mut self, tiebreaker: u64) -> Self {
        self.attributes
            .push(BuildAttribute::IceControlled(tiebreaker));
        self
    }

    pub fn use_candidate(mut self) -> Self {
        self.attributes.push(BuildAttribute::UseCandidate);
        self
    }

    pub fn xor_mapped_address(mut self, addr: SocketAddr) -> Self {
        self.attributes
            .push(BuildAttribute::XorMappedAddress(addr));
        self
    }

    pub fn error_code(mut self, code: u16) -> Self {
        self.attributes.push(BuildAttribute::ErrorCode(code));
        self
    }

    pub fn integrity(mut self, key: &[u8]) -> Self {
        self.attributes
            .push(BuildAttribute::Integrity(key.to_vec()));
        self
    }

    pub fn fingerprint(mut self) -> Self {
        self.attributes.push(BuildAttribute::Fingerprint);
        self
    }

    pub fn raw_attribute(mut self, kind: u16, value: &[u8]) -> Self {
        self.attributes
            .push(BuildAttribute::Raw(kind, value.to_vec()));
        self
    }

    pub fn build(self) -> Result<Message, Error> {
        let encoded = self.encode();
        Message::decode(&encoded)
    }

    fn encode(&self) -> Vec<u8> {
        let mut attrs: Vec<u8> = Vec::new();
        for attribute in &self.attributes {
            match attribute {
                BuildAttribute::Username(username) => {
                    put_attribute(&mut attrs, ATTR_USERNAME, username.as_bytes());
                }
                BuildAttribute::Priority(priority) => {
                    put_attribute(&mut attrs, ATTR_PRIORITY, &priority.to_be_bytes());
                }
                BuildAttribute::IceControlling(tiebreaker) => {
                    put_attribute(&mut attrs, ATTR_ICE_CONTROLLING, &tiebreaker.to_be_bytes());
                }
                BuildAttribute::IceControlled(tiebreaker) => {
                    put_attribute(&mut attrs, ATTR_ICE_CONTROLLED, &tiebreaker.to_be_bytes());
                }
                BuildAttribute::UseCandidate => {
                    put_attribute(&mut attrs, ATTR_USE_CANDIDATE, &[]);
                }
                BuildAttribute::XorMappedAddress(addr) => {
                    let value = xor_address_value(addr, &self.transaction_id);
                    put_attribute(&mut attrs, ATTR_XOR_MAPPED_ADDRESS, &value);
                }
                BuildAttribute::ErrorCode(code) => {
                    let reason = reason_phrase(*code);
                    let mut value = Vec::with_capacity(4 + reason.len());
                    value.put_u16(0);
                    value.put_u8((code / 100) as u8);
                    value.put_u8((code % 100) as u8);
                    value.put_slice(reason.as_bytes());
                    put_attribute(&mut attrs, ATTR_ERROR_CODE, &value);
                }
                BuildAttribute::Integrity(key) => {
                    let covered =
                        self.covered_prefix(&attrs, attrs.len() + INTEGRITY_ATTR_LEN);
                    let tag = hmac_sha1(key, &covered);
                    put_attribute(&mut attrs, ATTR_MESSAGE_INTEGRITY, &tag);
                }
                BuildAttribute::Fingerprint => {
                    let covered =
                        self.covered_prefix(&attrs, attrs.len() + FINGERPRINT_ATTR_LEN);
                    let crc = CRC32.checksum(&covered) ^ FINGERPRINT_XOR;
                    put_attribute(&mut attrs, ATTR_FINGERPRINT, &crc.to_be_bytes());
                }
                BuildAttribute::Raw(kind, value) => {
                    put_attribute(&mut attrs, *kind, value);
                }
            }
        }

        let mut message = self.header(attrs.len());
        message.extend_from_slice(&attrs);
        message
    }

    /// Header plus the attributes encoded so far, with the length field set
    /// to `claimed_len` — the coverage input for integrity and fingerprint.
    fn covered_prefix(&self, attrs: &[u8], claimed_len: usize) -> Vec<u8> {
        let mut covered = self.header(claimed_len);
        covered.extend_from_slice(attrs);
        covered
    }

    fn header(&self, length: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.put_u16(METHOD_BINDING | self.class.type_bits());
        header.put_u16(length as u16);
        header.put_u32(MAGIC_COOKIE);
        header.put_slice(&self.transaction_id.0);
        header
    }
}

fn put_attribute(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
    buf.put_u16(kind);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    buf.put_bytes(0, (4 - value.len() % 4) % 4);
}

fn xor_address_value(addr: &SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut value = Vec::with_capacity(20);
    value.put_u8(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.put_u8(0x01);
            value.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let mut octets = ip.octets();
            for (o, c) in octets.iter_mut().zip(cookie) {
                *o ^= c;
            }
            value.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            value.put_u8(0x02);
            value.put_u16(addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
            let mut octets = ip.octets();
            for (o, c) in octets.iter_mut().zip(cookie) {
                *o ^= c;
            }
            for (o, t) in octets[4..].iter_mut().zip(transaction_id.0) {
                *o ^= t;
            }
            value.put_slice(&octets);
        }
    }
    value
}
