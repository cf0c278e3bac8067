//! A deliberately minimal DNS message representation.
//!
//! A full wire codec is out of scope for this crate: a real deployment
//! would plug in a dedicated parser/serializer here. This module exposes
//! just enough surface — transaction id, rcode, and answer record types —
//! for the transport and forwarder to implement their contract and be
//! testable on their own.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// DNS RCODEs we care about labelling; anything else falls back to its
/// decimal value when used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rcode(pub u8);

impl Rcode {
    pub const NOERROR: Rcode = Rcode(0);
    pub const FORMERR: Rcode = Rcode(1);
    pub const SERVFAIL: Rcode = Rcode(2);
    pub const NXDOMAIN: Rcode = Rcode(3);
    pub const NOTIMP: Rcode = Rcode(4);
    pub const REFUSED: Rcode = Rcode(5);

    /// Label used for the `request_duration` histogram.
    pub fn label(self) -> String {
        match self.0 {
            0 => "NOERROR".to_string(),
            1 => "FORMERR".to_string(),
            2 => "SERVFAIL".to_string(),
            3 => "NXDOMAIN".to_string(),
            4 => "NOTIMP".to_string(),
            5 => "REFUSED".to_string(),
            other => other.to_string(),
        }
    }
}

/// Query types this crate needs to distinguish: AXFR/IXFR zone transfers
/// versus everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qtype {
    Axfr,
    Ixfr,
    Other(u16),
}

impl Qtype {
    pub fn from_u16(v: u16) -> Self {
        match v {
            252 => Qtype::Axfr,
            251 => Qtype::Ixfr,
            other => Qtype::Other(other),
        }
    }

    pub fn is_zone_transfer(self) -> bool {
        matches!(self, Qtype::Axfr | Qtype::Ixfr)
    }
}

/// Resource record type tag, only as granular as the forwarder needs
/// (SOA detection for AXFR/IXFR framing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtype(pub u16);

impl Rtype {
    pub const SOA: Rtype = Rtype(6);

    pub fn is_soa(self) -> bool {
        self == Rtype::SOA
    }
}

/// A single answer-section resource record, stripped down to what AXFR/IXFR
/// aggregation needs: its type, and the raw bytes a real codec would expand
/// into full rdata.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub rtype: Rtype,
    pub raw: Bytes,
}

/// An owned, mutable DNS message.
///
/// The transaction id occupies the first two octets of the wire format in
/// every DNS message (query, response, AXFR frame); this crate only ever
/// needs to read and patch that field in place, never to walk the rest of
/// the wire format, so `id`/`set_id` operate directly on `raw` rather than
/// through a parsed object model.
#[derive(Debug, Clone)]
pub struct Message {
    raw: BytesMut,
    rcode: Rcode,
    answers: Vec<ResourceRecord>,
}

impl Message {
    pub fn new(raw: BytesMut, rcode: Rcode, answers: Vec<ResourceRecord>) -> Self {
        Self {
            raw,
            rcode,
            answers,
        }
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.raw[0], self.raw[1]])
    }

    pub fn set_id(&mut self, id: u16) {
        let b = id.to_be_bytes();
        self.raw[0] = b[0];
        self.raw[1] = b[1];
    }

    pub fn rcode(&self) -> Rcode {
        self.rcode
    }

    pub fn answers(&self) -> &[ResourceRecord] {
        &self.answers
    }

    pub fn into_answers(self) -> Vec<ResourceRecord> {
        self.answers
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Bytes {
        self.raw.freeze()
    }
}

/// Returns a random 16-bit transaction id for the rewritten outbound request.
pub fn random_id() -> u16 {
    rand::random::<u16>()
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message shorter than a DNS header")]
    Truncated,
}

/// Parses just enough of the wire format to support this crate's needs: the
/// header's id/rcode/counts, and a walk of the answer section that resolves
/// each record's type and skips its rdata without interpreting it. Anything
/// past that (question name values, rdata semantics, OPT records) is left to
/// a real codec; it's out of scope here.
pub fn parse_message(raw: Bytes) -> Result<Message, WireError> {
    if raw.len() < 12 {
        return Err(WireError::Truncated);
    }
    let rcode = Rcode(raw[3] & 0x0f);
    let qdcount = u16::from_be_bytes([raw[4], raw[5]]) as usize;
    let ancount = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    let mut pos = 12usize;
    for _ in 0..qdcount {
        pos = skip_name(&raw, pos)?;
        pos += 4; // qtype + qclass
        if pos > raw.len() {
            return Err(WireError::Truncated);
        }
    }

    let mut answers = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        pos = skip_name(&raw, pos)?;
        if pos + 10 > raw.len() {
            return Err(WireError::Truncated);
        }
        let rr_start = pos;
        let rtype = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let rdlength = u16::from_be_bytes([raw[pos + 8], raw[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > raw.len() {
            return Err(WireError::Truncated);
        }
        pos += rdlength;
        answers.push(ResourceRecord {
            rtype: Rtype(rtype),
            raw: raw.slice(rr_start..pos),
        });
    }

    let mut owned = BytesMut::with_capacity(raw.len());
    owned.extend_from_slice(&raw);
    Ok(Message::new(owned, rcode, answers))
}

/// Skips one domain name occurrence starting at `pos`, returning the offset
/// just past it. Handles ordinary length-prefixed labels and compression
/// pointers (the pointer itself is two bytes; what it points at is never
/// followed, since skipping doesn't need the name's actual value).
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, WireError> {
    loop {
        if pos >= buf.len() {
            return Err(WireError::Truncated);
        }
        let len = buf[pos];
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            if pos + 1 >= buf.len() {
                return Err(WireError::Truncated);
            }
            return Ok(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u16) -> Message {
        let mut raw = BytesMut::zeroed(12);
        raw[0] = (id >> 8) as u8;
        raw[1] = id as u8;
        Message::new(raw, Rcode::NOERROR, Vec::new())
    }

    #[test]
    fn id_round_trips_through_set_id() {
        let mut m = msg(0x1234);
        assert_eq!(m.id(), 0x1234);
        m.set_id(0xabcd);
        assert_eq!(m.id(), 0xabcd);
    }

    #[test]
    fn rcode_label_known_and_unknown() {
        assert_eq!(Rcode::NXDOMAIN.label(), "NXDOMAIN");
        assert_eq!(Rcode(17).label(), "17");
    }

    #[test]
    fn qtype_classifies_zone_transfers() {
        assert!(Qtype::from_u16(252).is_zone_transfer());
        assert!(Qtype::from_u16(251).is_zone_transfer());
        assert!(!Qtype::from_u16(1).is_zone_transfer());
    }

    fn push_name(buf: &mut Vec<u8>, labels: &[&str]) {
        for label in labels {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    fn header(qdcount: u16, ancount: u16, rcode: u8) -> Vec<u8> {
        let mut h = vec![0xab, 0xcd, 0x81, rcode, 0, qdcount, 0, ancount, 0, 0, 0, 0];
        h[3] |= rcode;
        h
    }

    #[test]
    fn parse_message_reads_header_fields() {
        let mut raw = header(1, 0, Rcode::NXDOMAIN.0);
        push_name(&mut raw, &["example", "com"]);
        raw.extend_from_slice(&[0, 1, 0, 1]); // A, IN

        let m = parse_message(Bytes::from(raw)).unwrap();
        assert_eq!(m.id(), 0xabcd);
        assert_eq!(m.rcode(), Rcode::NXDOMAIN);
        assert!(m.answers().is_empty());
    }

    #[test]
    fn parse_message_walks_answer_section_to_find_soa() {
        let mut raw = header(1, 2, 0);
        push_name(&mut raw, &["example", "com"]);
        raw.extend_from_slice(&[0, 252, 0, 1]); // AXFR, IN

        // Answer 1: A record, owner name, 4 bytes of rdata.
        push_name(&mut raw, &["example", "com"]);
        raw.extend_from_slice(&[0, 1, 0, 1]); // type A, class IN
        raw.extend_from_slice(&[0, 0, 0, 60]); // ttl
        raw.extend_from_slice(&[0, 4]); // rdlength
        raw.extend_from_slice(&[127, 0, 0, 1]); // rdata

        // Answer 2: SOA record via compression pointer to offset 12, empty rdata.
        raw.extend_from_slice(&[0xc0, 0x0c]);
        raw.extend_from_slice(&[0, 6, 0, 1]); // type SOA, class IN
        raw.extend_from_slice(&[0, 0, 0, 60]); // ttl
        raw.extend_from_slice(&[0, 0]); // rdlength

        let m = parse_message(Bytes::from(raw)).unwrap();
        assert_eq!(m.answers().len(), 2);
        assert!(!m.answers()[0].rtype.is_soa());
        assert!(m.answers()[1].rtype.is_soa());
    }

    #[test]
    fn parse_message_rejects_truncated_header() {
        assert!(matches!(
            parse_message(Bytes::from_static(&[0u8; 4])),
            Err(WireError::Truncated)
        ));
    }
}
