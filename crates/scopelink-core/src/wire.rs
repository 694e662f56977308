//! ScopeLink wire format for the bulk data plane.
//!
//! These types ARE the chunk protocol. Every field, every size, every reserved
//! byte is part of the wire format. A consumer pulls a slice by writing
//! `ChunkRequest`s to a TCP stream on the chunk port (base port + 1); the
//! server answers each, in order, with one reply frame: a `ChunkReplyHeader`
//! followed by the raw chunk bytes when the slice is available. The header's
//! `chunk_size` is the frame's length prefix, so a chunk is not bounded by
//! the size of a datagram.
//!
//! All integers are little-endian and every struct is `#[repr(C)]` over
//! unaligned byte-order types, so zerocopy can read and write them without
//! padding or unsafe code.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::signal::ServerKind;

// ── Chunk Request ────────────────────────────────────────────────────────────

/// Asks the chunk server for one byte range of a cached slice.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkRequest {
    /// Cache id of the slice, as announced in its metadata signal.
    pub slice_id: I32<LittleEndian>,
    /// Byte offset into the slice payload.
    pub offset: I32<LittleEndian>,
    /// How many bytes the client wants. The server may send fewer.
    pub chunk_size: I32<LittleEndian>,
}

assert_eq_size!(ChunkRequest, [u8; 12]);

impl ChunkRequest {
    pub fn new(slice_id: i32, offset: i32, chunk_size: i32) -> Self {
        Self {
            slice_id: I32::new(slice_id),
            offset: I32::new(offset),
            chunk_size: I32::new(chunk_size),
        }
    }

    /// Parse one request frame. The frame must be exactly one request.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() != REQUEST_SIZE {
            return Err(WireError::BadLength {
                expected: REQUEST_SIZE,
                actual: frame.len(),
            });
        }
        Self::read_from(frame).ok_or(WireError::BadLength {
            expected: REQUEST_SIZE,
            actual: frame.len(),
        })
    }

    /// Negative ids, offsets or sizes never come from a well-behaved client.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.slice_id.get() < 0 || self.offset.get() < 0 || self.chunk_size.get() < 0 {
            return Err(WireError::NegativeField);
        }
        Ok(())
    }
}

// ── Chunk Reply ──────────────────────────────────────────────────────────────

/// Header of a chunk reply frame.
///
/// The raw chunk bytes follow the header directly and are never wrapped in a
/// structured encoding. They are present iff `available == 1`, and their
/// length always equals `chunk_size`.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkReplyHeader {
    pub slice_id: I32<LittleEndian>,
    /// Offset echoed from the request (before any server-side correction).
    pub offset: I32<LittleEndian>,
    /// Number of payload bytes that follow. Zero when unavailable.
    pub chunk_size: I32<LittleEndian>,
    /// 1 = slice found and bytes follow, 0 = unknown id.
    pub available: u8,
    /// Wire format version. Currently `WIRE_VERSION`.
    pub version: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(ChunkReplyHeader, [u8; 16]);

impl ChunkReplyHeader {
    pub fn available(slice_id: i32, offset: i32, chunk_size: i32) -> Self {
        Self {
            slice_id: I32::new(slice_id),
            offset: I32::new(offset),
            chunk_size: I32::new(chunk_size),
            available: 1,
            version: WIRE_VERSION,
            reserved: [0; 2],
        }
    }

    pub fn unavailable(slice_id: i32) -> Self {
        Self {
            slice_id: I32::new(slice_id),
            offset: I32::new(0),
            chunk_size: I32::new(0),
            available: 0,
            version: WIRE_VERSION,
            reserved: [0; 2],
        }
    }

    pub fn is_available(&self) -> bool {
        self.available == 1
    }

    /// Check the header on its own and return how many raw bytes follow it.
    pub fn body_len(&self) -> Result<usize, WireError> {
        if self.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.reserved != [0; 2] {
            return Err(WireError::ReservedBytesSet);
        }
        let declared = self.chunk_size.get();
        match self.available {
            0 if declared == 0 => Ok(0),
            0 => Err(WireError::UnexpectedFrame(declared.max(0) as usize)),
            1 if declared < 0 || declared as usize > MAX_CHUNK_CAP => {
                Err(WireError::FrameTooLarge(declared))
            }
            1 => Ok(declared as usize),
            other => Err(WireError::InvalidAvailability(other)),
        }
    }
}

/// Length of the first reply frame in `buf`, header included.
///
/// `Ok(None)` until the whole header has arrived. The body may still be
/// incomplete when this returns `Some`.
pub fn reply_frame_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    match ChunkReplyHeader::read_from_prefix(buf) {
        Some(header) => Ok(Some(REPLY_HEADER_SIZE + header.body_len()?)),
        None => Ok(None),
    }
}

/// A decoded chunk reply: header plus the borrowed raw frame.
#[derive(Debug)]
pub struct ChunkReply<'a> {
    pub header: ChunkReplyHeader,
    /// `Some` iff the slice was available.
    pub data: Option<&'a [u8]>,
}

impl<'a> ChunkReply<'a> {
    /// Parse one complete reply frame and check the header against it.
    pub fn parse(frame: &'a [u8]) -> Result<Self, WireError> {
        let header = ChunkReplyHeader::read_from_prefix(frame).ok_or(WireError::BadLength {
            expected: REPLY_HEADER_SIZE,
            actual: frame.len(),
        })?;

        let body = &frame[REPLY_HEADER_SIZE..];
        if !header.is_available() {
            header.body_len()?;
            if !body.is_empty() {
                return Err(WireError::UnexpectedFrame(body.len()));
            }
            return Ok(Self { header, data: None });
        }

        let declared = header.body_len()?;
        if declared != body.len() {
            return Err(WireError::FrameSizeMismatch {
                declared: header.chunk_size.get(),
                actual: body.len(),
            });
        }
        Ok(Self {
            header,
            data: Some(body),
        })
    }
}

/// Serialize a reply into one contiguous frame: header, then raw bytes.
pub fn encode_reply(header: &ChunkReplyHeader, data: Option<&[u8]>) -> Vec<u8> {
    let payload_len = data.map_or(0, |d| d.len());
    let mut frame = Vec::with_capacity(REPLY_HEADER_SIZE + payload_len);
    frame.extend_from_slice(header.as_bytes());
    if let Some(data) = data {
        frame.extend_from_slice(data);
    }
    frame
}

// ── Service Announcement ─────────────────────────────────────────────────────

/// Multicast datagram advertising one remote server on the local network.
///
/// Servers send one every announce interval and a final one with
/// `FLAG_LEAVING` set when they close. Explorers key entries by the sender
/// address and the signal port.
///
/// Wire size: 76 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ServiceAnnouncement {
    /// Always `ANNOUNCE_MAGIC`. Anything else on the group is ignored.
    pub magic: [u8; 4],
    pub version: u8,
    /// Bit flags. Bit 0 = leaving; the rest must be zero.
    pub flags: u8,
    /// 0x01 = microscope, 0x02 = volume stream.
    pub kind: u8,
    /// Number of meaningful bytes in `name`.
    pub name_len: u8,
    pub signal_port: U16<LittleEndian>,
    pub chunk_port: U16<LittleEndian>,
    /// UTF-8 server name, zero padded. Longer names are truncated.
    pub name: [u8; ANNOUNCE_NAME_MAX],
}

assert_eq_size!(ServiceAnnouncement, [u8; 76]);

impl ServiceAnnouncement {
    pub fn new(name: &str, kind: ServerKind, signal_port: u16, chunk_port: u16) -> Self {
        let mut end = name.len().min(ANNOUNCE_NAME_MAX);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut padded = [0u8; ANNOUNCE_NAME_MAX];
        padded[..end].copy_from_slice(&name.as_bytes()[..end]);

        Self {
            magic: ANNOUNCE_MAGIC,
            version: WIRE_VERSION,
            flags: 0,
            kind: match kind {
                ServerKind::Microscope => 0x01,
                ServerKind::VolumeStream => 0x02,
            },
            name_len: end as u8,
            signal_port: U16::new(signal_port),
            chunk_port: U16::new(chunk_port),
            name: padded,
        }
    }

    /// The same announcement, marked as the server's goodbye.
    pub fn leaving(mut self) -> Self {
        self.flags |= FLAG_LEAVING;
        self
    }

    pub fn is_leaving(&self) -> bool {
        self.flags & FLAG_LEAVING != 0
    }

    /// Parse and check an announcement datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let bad_length = WireError::BadLength {
            expected: ANNOUNCE_SIZE,
            actual: datagram.len(),
        };
        if datagram.len() != ANNOUNCE_SIZE {
            return Err(bad_length);
        }
        let announcement = Self::read_from(datagram).ok_or(bad_length)?;

        if announcement.magic != ANNOUNCE_MAGIC {
            return Err(WireError::BadMagic);
        }
        if announcement.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(announcement.version));
        }
        if announcement.flags & !FLAG_LEAVING != 0 {
            return Err(WireError::ReservedBytesSet);
        }
        if announcement.name_len as usize > ANNOUNCE_NAME_MAX {
            return Err(WireError::BadName);
        }
        announcement.server_kind()?;
        std::str::from_utf8(announcement.name_bytes()).map_err(|_| WireError::BadName)?;
        Ok(announcement)
    }

    pub fn server_kind(&self) -> Result<ServerKind, WireError> {
        match self.kind {
            0x01 => Ok(ServerKind::Microscope),
            0x02 => Ok(ServerKind::VolumeStream),
            other => Err(WireError::UnknownKind(other)),
        }
    }

    fn name_bytes(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(ANNOUNCE_NAME_MAX)]
    }

    /// Server name. Empty if the bytes are not UTF-8, which `parse` rejects.
    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_bytes()).unwrap_or_default()
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current chunk reply format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Size of an encoded `ChunkRequest`.
pub const REQUEST_SIZE: usize = std::mem::size_of::<ChunkRequest>();

/// Size of an encoded `ChunkReplyHeader`.
pub const REPLY_HEADER_SIZE: usize = std::mem::size_of::<ChunkReplyHeader>();

/// Largest payload a single UDP datagram can carry over IPv4.
/// Bounds signal session messages; chunk replies travel on a stream.
pub const MAX_DATAGRAM: usize = 65_507;

/// Upper bound for the configured chunk cap and for any reply body a client
/// accepts. Also keeps every size representable in the i32 header fields.
pub const MAX_CHUNK_CAP: usize = 16 * 1024 * 1024;

/// Default HARD_CHUNK_CAP — maximum payload bytes per chunk reply.
pub const DEFAULT_CHUNK_CAP: usize = 32 * 1024;

/// First bytes of every `ServiceAnnouncement`.
pub const ANNOUNCE_MAGIC: [u8; 4] = *b"SCPL";

/// Room for the server name inside an announcement.
pub const ANNOUNCE_NAME_MAX: usize = 64;

/// Size of an encoded `ServiceAnnouncement`.
pub const ANNOUNCE_SIZE: usize = std::mem::size_of::<ServiceAnnouncement>();

/// Announcement flag: the server is going away.
pub const FLAG_LEAVING: u8 = 0x01;

/// Default PIPELINE_BUDGET — chunk requests a client keeps in flight.
/// The server sizes its socket buffers for twice this many messages.
pub const DEFAULT_PIPELINE_BUDGET: usize = 10;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame length {actual} does not match expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved bytes are non-zero")]
    ReservedBytesSet,

    #[error("invalid availability byte: 0x{0:02x}")]
    InvalidAvailability(u8),

    #[error("unavailable reply carries {0} unexpected frame bytes")]
    UnexpectedFrame(usize),

    #[error("reply declares {declared} bytes but frame holds {actual}")]
    FrameSizeMismatch { declared: i32, actual: usize },

    #[error("request contains a negative field")]
    NegativeField,

    #[error("reply declares {0} bytes, outside 0..=MAX_CHUNK_CAP")]
    FrameTooLarge(i32),

    #[error("not a ScopeLink announcement")]
    BadMagic,

    #[error("unknown server kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("announced name is not valid UTF-8")]
    BadName,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_is_little_endian() {
        let request = ChunkRequest::new(7, 0x0102_0304, 65536);
        let bytes = request.as_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[7, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[0, 0, 1, 0]);

        let parsed = ChunkRequest::parse(bytes).unwrap();
        assert_eq!(parsed.slice_id.get(), 7);
        assert_eq!(parsed.offset.get(), 0x0102_0304);
        assert_eq!(parsed.chunk_size.get(), 65536);
    }

    #[test]
    fn request_with_trailing_bytes_is_rejected() {
        let mut frame = ChunkRequest::new(1, 0, 10).as_bytes().to_vec();
        frame.push(0);
        assert_eq!(
            ChunkRequest::parse(&frame).unwrap_err(),
            WireError::BadLength {
                expected: 12,
                actual: 13
            }
        );
    }

    #[test]
    fn negative_request_fields_fail_validation() {
        assert!(ChunkRequest::new(1, 0, 10).validate().is_ok());
        assert_eq!(
            ChunkRequest::new(1, -5, 10).validate(),
            Err(WireError::NegativeField)
        );
        assert_eq!(
            ChunkRequest::new(-1, 0, 10).validate(),
            Err(WireError::NegativeField)
        );
    }

    #[test]
    fn available_reply_carries_frame() {
        let data = [9u8, 8, 7, 6];
        let frame = encode_reply(&ChunkReplyHeader::available(3, 128, 4), Some(&data));
        assert_eq!(frame.len(), REPLY_HEADER_SIZE + 4);

        let reply = ChunkReply::parse(&frame).unwrap();
        assert!(reply.header.is_available());
        assert_eq!(reply.header.slice_id.get(), 3);
        assert_eq!(reply.header.offset.get(), 128);
        assert_eq!(reply.data, Some(&data[..]));
    }

    #[test]
    fn unavailable_reply_has_no_frame() {
        let frame = encode_reply(&ChunkReplyHeader::unavailable(42), None);
        assert_eq!(frame.len(), REPLY_HEADER_SIZE);

        let reply = ChunkReply::parse(&frame).unwrap();
        assert!(!reply.header.is_available());
        assert_eq!(reply.header.slice_id.get(), 42);
        assert!(reply.data.is_none());
    }

    #[test]
    fn reply_size_mismatch_is_rejected() {
        let frame = encode_reply(&ChunkReplyHeader::available(1, 0, 10), Some(&[0u8; 4]));
        assert_eq!(
            ChunkReply::parse(&frame).unwrap_err(),
            WireError::FrameSizeMismatch {
                declared: 10,
                actual: 4
            }
        );
    }

    #[test]
    fn invalid_availability_byte_is_rejected() {
        let mut header = ChunkReplyHeader::unavailable(1);
        header.available = 2;
        let frame = encode_reply(&header, None);
        assert_eq!(
            ChunkReply::parse(&frame).unwrap_err(),
            WireError::InvalidAvailability(2)
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut header = ChunkReplyHeader::unavailable(1);
        header.version = 0x09;
        let err = ChunkReply::parse(&encode_reply(&header, None)).unwrap_err();
        assert_eq!(err, WireError::UnknownVersion(0x09));
        assert!(err.to_string().contains("0x09"));
    }

    #[test]
    fn truncated_reply_is_rejected() {
        assert!(matches!(
            ChunkReply::parse(&[1, 2, 3]),
            Err(WireError::BadLength { .. })
        ));
    }

    #[test]
    fn chunk_cap_is_not_bounded_by_a_datagram() {
        assert!(DEFAULT_CHUNK_CAP <= MAX_CHUNK_CAP);
        assert!(64 * 1024 + REPLY_HEADER_SIZE > MAX_DATAGRAM);
        assert!(64 * 1024 <= MAX_CHUNK_CAP);
        assert!(MAX_CHUNK_CAP <= i32::MAX as usize);
    }

    #[test]
    fn frame_length_comes_from_the_header() {
        let data = vec![5u8; 64 * 1024];
        let mut stream = encode_reply(&ChunkReplyHeader::available(2, 0, data.len() as i32), Some(&data));
        stream.extend_from_slice(&encode_reply(&ChunkReplyHeader::unavailable(3), None));

        assert_eq!(reply_frame_len(&stream[..10]), Ok(None));
        // header alone is enough to know the frame length
        assert_eq!(
            reply_frame_len(&stream[..REPLY_HEADER_SIZE]),
            Ok(Some(REPLY_HEADER_SIZE + data.len()))
        );

        let first = REPLY_HEADER_SIZE + data.len();
        let reply = ChunkReply::parse(&stream[..first]).unwrap();
        assert_eq!(reply.data.map(<[u8]>::len), Some(64 * 1024));

        let rest = &stream[first..];
        assert_eq!(reply_frame_len(rest), Ok(Some(REPLY_HEADER_SIZE)));
        assert!(ChunkReply::parse(rest).unwrap().data.is_none());
    }

    #[test]
    fn oversized_or_inconsistent_headers_are_rejected_early() {
        let header = ChunkReplyHeader::available(1, 0, (MAX_CHUNK_CAP + 1) as i32);
        assert_eq!(
            reply_frame_len(header.as_bytes()),
            Err(WireError::FrameTooLarge((MAX_CHUNK_CAP + 1) as i32))
        );

        let mut header = ChunkReplyHeader::unavailable(1);
        header.chunk_size = I32::new(8);
        assert_eq!(
            reply_frame_len(header.as_bytes()),
            Err(WireError::UnexpectedFrame(8))
        );
    }

    #[test]
    fn announcement_carries_name_ports_and_goodbye() {
        let announcement = ServiceAnnouncement::new("bench scope", ServerKind::Microscope, 4000, 4001);
        let bytes = announcement.as_bytes();
        assert_eq!(bytes.len(), ANNOUNCE_SIZE);
        assert_eq!(&bytes[0..4], b"SCPL");

        let parsed = ServiceAnnouncement::parse(bytes).unwrap();
        assert_eq!(parsed.name(), "bench scope");
        assert_eq!(parsed.signal_port.get(), 4000);
        assert_eq!(parsed.chunk_port.get(), 4001);
        assert_eq!(parsed.server_kind(), Ok(ServerKind::Microscope));
        assert!(!parsed.is_leaving());

        let goodbye = ServiceAnnouncement::parse(announcement.leaving().as_bytes()).unwrap();
        assert!(goodbye.is_leaving());
    }

    #[test]
    fn long_names_are_cut_on_a_char_boundary() {
        let name = "é".repeat(40); // 80 bytes
        let announcement = ServiceAnnouncement::new(&name, ServerKind::VolumeStream, 1, 2);
        assert_eq!(announcement.name_len as usize, ANNOUNCE_NAME_MAX);
        assert_eq!(announcement.name(), "é".repeat(32));
    }

    #[test]
    fn foreign_datagrams_are_not_announcements() {
        let mut bytes = ServiceAnnouncement::new("x", ServerKind::Microscope, 1, 2)
            .as_bytes()
            .to_vec();
        bytes[0] = b'Z';
        assert_eq!(ServiceAnnouncement::parse(&bytes).unwrap_err(), WireError::BadMagic);
        assert!(matches!(
            ServiceAnnouncement::parse(&bytes[..10]),
            Err(WireError::BadLength { .. })
        ));
    }
}
