//! Minimal mDNS (RFC 6762) packet codec.
//!
//! Discovery needs exactly two things from DNS: build a one-question query,
//! and pull `PTR` and `A` records out of a response.  Everything else in the
//! packet is skipped.
//!
//! # Packet layout (for beginners)
//!
//! ```text
//! header (12 bytes): id, flags, qdcount, ancount, nscount, arcount
//! questions:         name, type(2), class(2)
//! records:           name, type(2), class(2), ttl(4), rdlength(2), rdata
//! ```
//!
//! Names are sequences of length-prefixed labels ending in a zero byte.  To
//! save space a name may end in a two-byte *pointer* (top two bits set) to an
//! earlier offset in the packet, where the rest of the name continues.

use std::net::Ipv4Addr;

use thiserror::Error;

/// mDNS multicast group.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// mDNS port.
pub const MDNS_PORT: u16 = 5353;

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
/// Question class bit asking responders for a unicast reply.
const UNICAST_RESPONSE: u16 = 0x8000;
/// Record class bit meaning "flush cached records"; not part of the class.
const CACHE_FLUSH: u16 = 0x8000;
/// Upper bound on pointer jumps while reading one name.
const MAX_POINTER_JUMPS: usize = 32;

/// Errors while decoding a DNS packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MdnsError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("invalid label at offset {0}")]
    BadLabel(usize),

    #[error("name compression loop")]
    PointerLoop,
}

/// Record types discovery cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Ptr,
    Other(u16),
}

impl RecordType {
    fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Other(code) => code,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            12 => RecordType::Ptr,
            other => RecordType::Other(other),
        }
    }
}

/// Decoded record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ptr(String),
    Other,
}

/// One resource record from the answer, authority, or additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Owner name without the trailing dot.
    pub name: String,
    pub data: RecordData,
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Builds a query with a single question.
///
/// `unicast_response` sets the QU bit so responders answer the querying
/// socket directly rather than the multicast group.
pub fn encode_query(name: &str, rtype: RecordType, unicast_response: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    // id 0, standard query, one question
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        // Labels are at most 63 bytes; longer input is cut rather than rejected.
        let len = bytes.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&bytes[..len]);
    }
    buf.push(0);
    buf.extend_from_slice(&rtype.code().to_be_bytes());
    let class = if unicast_response {
        CLASS_IN | UNICAST_RESPONSE
    } else {
        CLASS_IN
    };
    buf.extend_from_slice(&class.to_be_bytes());
    buf
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Returns every record in a response packet.  Questions are skipped.
///
/// # Errors
///
/// Any structural problem fails the whole packet; a partly-parsed packet is
/// never returned.
pub fn decode_records(packet: &[u8]) -> Result<Vec<ResourceRecord>, MdnsError> {
    if packet.len() < HEADER_LEN {
        return Err(MdnsError::Truncated(packet.len()));
    }
    let qdcount = read_u16(packet, 4)?;
    let record_count =
        read_u16(packet, 6)? as usize + read_u16(packet, 8)? as usize + read_u16(packet, 10)? as usize;

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(packet, pos)?;
        pos = next + 4;
    }

    let mut records = Vec::with_capacity(record_count.min(64));
    for _ in 0..record_count {
        let (name, next) = read_name(packet, pos)?;
        let rtype = RecordType::from_code(read_u16(packet, next)?);
        let _class = read_u16(packet, next + 2)? & !CACHE_FLUSH;
        let rdlength = read_u16(packet, next + 8)? as usize;
        let rdata_start = next + 10;
        let rdata_end = rdata_start + rdlength;
        if rdata_end > packet.len() {
            return Err(MdnsError::Truncated(packet.len()));
        }

        let data = match rtype {
            RecordType::A if rdlength == 4 => {
                let b = &packet[rdata_start..rdata_end];
                RecordData::A(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            RecordType::Ptr => RecordData::Ptr(read_name(packet, rdata_start)?.0),
            _ => RecordData::Other,
        };
        records.push(ResourceRecord { name, data });
        pos = rdata_end;
    }
    Ok(records)
}

/// Reads a possibly-compressed name at `start`.
///
/// Returns the dotted name and the offset just past the name *at its original
/// position* (after the first pointer, if one was followed).
fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), MdnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_after: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos).ok_or(MdnsError::Truncated(pos))? as usize;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    let end = end_after.unwrap_or(pos + 1);
                    return Ok((labels.join("."), end));
                }
                let label = packet
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(MdnsError::Truncated(pos))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xC0 => {
                let low = *packet.get(pos + 1).ok_or(MdnsError::Truncated(pos))? as usize;
                if end_after.is_none() {
                    end_after = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(MdnsError::PointerLoop);
                }
                pos = ((len & 0x3F) << 8) | low;
            }
            _ => return Err(MdnsError::BadLabel(pos)),
        }
    }
}

fn read_u16(packet: &[u8], at: usize) -> Result<u16, MdnsError> {
    packet
        .get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(MdnsError::Truncated(at))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends an uncompressed name.
    fn put_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    fn put_record_header(buf: &mut Vec<u8>, rtype: u16, rdlength: u16) {
        buf.extend_from_slice(&rtype.to_be_bytes());
        buf.extend_from_slice(&(CLASS_IN | CACHE_FLUSH).to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes());
        buf.extend_from_slice(&rdlength.to_be_bytes());
    }

    #[test]
    fn test_encode_ptr_query_with_qu_bit() {
        // Act
        let q = encode_query("_ssh._tcp.local", RecordType::Ptr, true);

        // Assert
        assert_eq!(&q[..12], &[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        let mut name = Vec::new();
        put_name(&mut name, "_ssh._tcp.local");
        assert_eq!(&q[12..12 + name.len()], name.as_slice());
        assert_eq!(&q[q.len() - 4..], &[0, 12, 0x80, 0x01]);
    }

    #[test]
    fn test_encode_a_query_without_qu_bit() {
        let q = encode_query("maixcam-1a2b.local.", RecordType::A, false);
        assert_eq!(&q[q.len() - 4..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_decode_uncompressed_a_record() {
        // Arrange: response header with one answer
        let mut p = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        put_name(&mut p, "maixcam-07.local");
        put_record_header(&mut p, 1, 4);
        p.extend_from_slice(&[192, 168, 1, 20]);

        // Act
        let records = decode_records(&p).unwrap();

        // Assert
        assert_eq!(
            records,
            vec![ResourceRecord {
                name: "maixcam-07.local".into(),
                data: RecordData::A(Ipv4Addr::new(192, 168, 1, 20)),
            }]
        );
    }

    #[test]
    fn test_decode_ptr_with_compression_and_additional_a() {
        // Arrange: answer PTR _ssh._tcp.local -> maixcam-07._ssh._tcp.local (compressed),
        // additional A maixcam-07.local (compressed suffix "local").
        let mut p = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 1];
        let service_at = p.len();
        put_name(&mut p, "_ssh._tcp.local");
        // "local" label starts after "_ssh" (5 bytes) and "_tcp" (5 bytes)
        let local_at = service_at + 10;
        put_record_header(&mut p, 12, 13);
        p.push(10);
        p.extend_from_slice(b"maixcam-07");
        p.extend_from_slice(&[0xC0, service_at as u8]);
        // additional record owner: "maixcam-07" + pointer to "local"
        p.push(10);
        p.extend_from_slice(b"maixcam-07");
        p.extend_from_slice(&[0xC0, local_at as u8]);
        put_record_header(&mut p, 1, 4);
        p.extend_from_slice(&[10, 0, 0, 7]);

        // Act
        let records = decode_records(&p).unwrap();

        // Assert
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "_ssh._tcp.local");
        assert_eq!(
            records[0].data,
            RecordData::Ptr("maixcam-07._ssh._tcp.local".into())
        );
        assert_eq!(records[1].name, "maixcam-07.local");
        assert_eq!(records[1].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_decode_skips_questions() {
        let mut p = vec![0, 0, 0x84, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        put_name(&mut p, "_ssh._tcp.local");
        p.extend_from_slice(&[0, 12, 0, 1]);
        put_name(&mut p, "x.local");
        put_record_header(&mut p, 16, 2);
        p.extend_from_slice(&[1, b'a']);

        let records = decode_records(&p).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, RecordData::Other);
    }

    #[test]
    fn test_decode_pointer_loop_is_rejected() {
        // Answer name is a pointer to itself.
        let mut p = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        p.extend_from_slice(&[0xC0, 12]);
        put_record_header(&mut p, 1, 4);
        p.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(decode_records(&p), Err(MdnsError::PointerLoop));
    }

    #[test]
    fn test_decode_truncated_packets_never_panic() {
        let mut p = vec![0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        put_name(&mut p, "maixcam-07.local");
        put_record_header(&mut p, 1, 4);
        p.extend_from_slice(&[192, 168, 1, 20]);

        for cut in 0..p.len() {
            assert!(decode_records(&p[..cut]).is_err(), "cut at {cut}");
        }
    }
}
