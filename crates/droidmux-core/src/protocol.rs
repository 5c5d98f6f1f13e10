//! ADB wire format: frame headers, payload checksums and the CNXN banner.
//!
//! Every message on an ADB transport is a fixed 24-byte header followed by
//! `data_length` payload bytes.
//!
//! # Header Layout (Little Endian)
//!
//! ```text
//! [command: u32] [arg0: u32] [arg1: u32] [data_length: u32] [data_checksum: u32] [magic: u32]
//! ```
//!
//! `magic` is `command ^ 0xFFFFFFFF`. `data_checksum` is the wrapping sum of
//! the payload bytes. Despite the historical "crc32" naming in ADB sources it
//! is not a CRC, and peers reject frames that do not match it exactly.
//!
//! # Example
//!
//! ```
//! use droidmux_core::protocol::{decode, encode, Command, HEADER_SIZE};
//!
//! let frame = encode(Command::Wrte, 1, 7, b"hello");
//! let wire = frame.to_bytes();
//!
//! let header: [u8; HEADER_SIZE] = wire[..HEADER_SIZE].try_into().unwrap();
//! let decoded = decode(&header, &wire[HEADER_SIZE..]).unwrap();
//! assert_eq!(decoded, frame);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Original protocol version. Payload checksums are mandatory.
pub const VERSION: u32 = 0x0100_0000;

/// Protocol version in which peers may leave `data_checksum` at zero.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Maximum payload size advertised by current adbd builds.
pub const MAX_PAYLOAD: u32 = 256 * 1024;

/// Maximum payload size understood by every adbd version.
pub const MAX_PAYLOAD_LEGACY: u32 = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while validating a frame.
///
/// ADB framing has no resync marker, so any of these is fatal to the
/// connection that produced the frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The command field is not one of the known ADB commands.
    #[error("unknown command tag: 0x{0:08X}")]
    UnknownCommand(u32),

    /// `magic` is not the bitwise complement of `command`.
    #[error("magic mismatch: command 0x{command:08X}, magic 0x{magic:08X}")]
    MagicMismatch { command: u32, magic: u32 },

    /// The payload does not sum to the header's checksum.
    #[error("checksum mismatch: header says 0x{expected:08X}, payload sums to 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The payload length disagrees with `data_length`.
    #[error("length mismatch: header says {declared} bytes, got {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    /// The declared payload exceeds the negotiated maximum.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: u32, max: u32 },

    /// A local payload is too long for the 32-bit length field.
    #[error("payload of {0} bytes does not fit in a frame")]
    Oversized(usize),
}

/// Errors raised while reading or writing frames on a byte stream.
#[derive(Error, Debug)]
pub enum WireError {
    /// The underlying stream failed or reached EOF.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame was received but failed validation.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// ADB command tags.
///
/// The discriminant is the four ASCII characters of the tag read as a
/// little-endian `u32`, which is exactly what appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Connection handshake.
    Cnxn = 0x4e58_4e43,
    /// Authentication challenge / response.
    Auth = 0x4854_5541,
    /// Open a logical stream to a named service.
    Open = 0x4e45_504f,
    /// Stream ready / write acknowledged.
    Okay = 0x5941_4b4f,
    /// Close a logical stream.
    Clse = 0x4553_4c43,
    /// Stream payload.
    Wrte = 0x4554_5257,
    /// Legacy transport sync.
    Sync = 0x434e_5953,
}

impl Command {
    /// Try to convert a raw header value into a `Command`.
    pub fn from_u32(value: u32) -> Result<Self, FrameError> {
        match value {
            0x4e58_4e43 => Ok(Command::Cnxn),
            0x4854_5541 => Ok(Command::Auth),
            0x4e45_504f => Ok(Command::Open),
            0x5941_4b4f => Ok(Command::Okay),
            0x4553_4c43 => Ok(Command::Clse),
            0x4554_5257 => Ok(Command::Wrte),
            0x434e_5953 => Ok(Command::Sync),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }

    /// The raw value written to the header.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The value expected in the header's `magic` field.
    pub fn magic(self) -> u32 {
        self.as_u32() ^ 0xFFFF_FFFF
    }

    /// The four-letter tag, for logging.
    pub fn name(self) -> &'static str {
        match self {
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Clse => "CLSE",
            Command::Wrte => "WRTE",
            Command::Sync => "SYNC",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Additive payload checksum: the sum of all bytes, modulo 2^32.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// How strictly inbound payload checksums are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Every frame must carry the exact payload sum.
    Verify,
    /// A zero checksum field is accepted (peers at [`VERSION_SKIP_CHECKSUM`]
    /// and above send zero). A nonzero field must still match.
    AllowZero,
}

impl ChecksumPolicy {
    /// The policy implied by a negotiated protocol version.
    pub fn for_version(version: u32) -> Self {
        if version >= VERSION_SKIP_CHECKSUM {
            ChecksumPolicy::AllowZero
        } else {
            ChecksumPolicy::Verify
        }
    }
}

// ---------------------------------------------------------------------------
// FrameHeader / Frame
// ---------------------------------------------------------------------------

/// The fixed 24-byte header that precedes every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
    pub magic: u32,
}

impl FrameHeader {
    /// Serialize to the little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let fields = [
            self.command.as_u32(),
            self.arg0,
            self.arg1,
            self.data_length,
            self.data_checksum,
            self.magic,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Parse a header and check the command tag and magic.
    ///
    /// The checksum cannot be checked until the payload is available; see
    /// [`decode`].
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let raw_command = word(0);
        let magic = word(20);
        let command = Command::from_u32(raw_command)?;
        if magic != command.magic() {
            return Err(FrameError::MagicMismatch {
                command: raw_command,
                magic,
            });
        }

        Ok(Self {
            command,
            arg0: word(4),
            arg1: word(8),
            data_length: word(12),
            data_checksum: word(16),
            magic,
        })
    }
}

/// One ADB message: header plus payload.
///
/// Frames are immutable once built. They are created per message and handed
/// straight to the transport or multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, computing length, checksum and magic.
    ///
    /// The payload must fit the 32-bit length field. Callers chunk by the
    /// negotiated max payload; use [`Frame::try_new`] for unbounded data.
    /// An oversized payload yields a frame that [`write_frame`] refuses.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let data_length = frame_length(payload.len()).unwrap_or(u32::MAX);
        Self::assemble(command, arg0, arg1, data_length, payload)
    }

    /// Like [`Frame::new`], but rejects payloads longer than `u32::MAX`.
    pub fn try_new(
        command: Command,
        arg0: u32,
        arg1: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, FrameError> {
        let payload = payload.into();
        let data_length = frame_length(payload.len())?;
        Ok(Self::assemble(command, arg0, arg1, data_length, payload))
    }

    fn assemble(command: Command, arg0: u32, arg1: u32, data_length: u32, payload: Vec<u8>) -> Self {
        let header = FrameHeader {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum: checksum(&payload),
            magic: command.magic(),
        };
        Self { header, payload }
    }

    /// Whether the header's length field describes the payload.
    pub fn is_consistent(&self) -> bool {
        self.header.data_length as usize == self.payload.len()
    }

    /// Build a frame whose payload is `text` followed by a single NUL, the
    /// convention for CNXN identities and OPEN service names.
    pub fn text(command: Command, arg0: u32, arg1: u32, text: &str) -> Self {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        Self::new(command, arg0, arg1, payload)
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn command(&self) -> Command {
        self.header.command
    }

    pub fn arg0(&self) -> u32 {
        self.header.arg0
    }

    pub fn arg1(&self) -> u32 {
        self.header.arg1
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, keeping only the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Header followed by payload, ready to write to a transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

fn frame_length(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::Oversized(len))
}

/// Build a frame from its parts. Equivalent to [`Frame::new`].
pub fn encode(command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Frame {
    Frame::new(command, arg0, arg1, payload.to_vec())
}

/// Decode and fully verify a frame, including its payload checksum.
pub fn decode(header: &[u8; HEADER_SIZE], payload: &[u8]) -> Result<Frame, FrameError> {
    decode_with(header, payload, ChecksumPolicy::Verify)
}

/// Decode a frame, verifying the checksum according to `policy`.
pub fn decode_with(
    header: &[u8; HEADER_SIZE],
    payload: &[u8],
    policy: ChecksumPolicy,
) -> Result<Frame, FrameError> {
    let header = FrameHeader::parse(header)?;
    verify_payload(&header, payload, policy)?;
    Ok(Frame {
        header,
        payload: payload.to_vec(),
    })
}

fn verify_payload(header: &FrameHeader, payload: &[u8], policy: ChecksumPolicy) -> Result<(), FrameError> {
    if header.data_length as usize != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared: header.data_length,
            actual: payload.len(),
        });
    }

    if policy == ChecksumPolicy::AllowZero && header.data_checksum == 0 {
        return Ok(());
    }

    let actual = checksum(payload);
    if actual != header.data_checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: header.data_checksum,
            actual,
        });
    }
    Ok(())
}

/// The payload as text, with at most one trailing NUL removed.
///
/// Devices are inconsistent about NUL-terminating strings, so a missing
/// terminator is fine. Invalid UTF-8 is replaced rather than rejected.
pub fn decode_text(frame: &Frame) -> String {
    let bytes = frame.payload();
    let bytes = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// ---------------------------------------------------------------------------
// Stream I/O
// ---------------------------------------------------------------------------

/// Read one complete frame from `reader`.
///
/// The declared length is checked against `max_payload` before the payload
/// buffer is allocated.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: u32,
    policy: ChecksumPolicy,
) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = FrameHeader::parse(&raw)?;

    if header.data_length > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: header.data_length,
            max: max_payload,
        }
        .into());
    }

    let mut payload = vec![0u8; header.data_length as usize];
    reader.read_exact(&mut payload).await?;
    verify_payload(&header, &payload, policy)?;

    Ok(Frame { header, payload })
}

/// Write one frame to `writer` and flush it.
///
/// Frames whose length field does not match the payload are refused with
/// [`std::io::ErrorKind::InvalidInput`] and nothing is written.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if !frame.is_consistent() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            FrameError::Oversized(frame.payload.len()),
        ));
    }
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// DeviceBanner
// ---------------------------------------------------------------------------

/// The identity a peer sends in its CNXN payload.
///
/// Format: `<kind>:<serial>:<key=value;key=value;...>`, e.g.
/// `device::ro.product.model=Pixel 7;features=shell_v2,cmd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBanner {
    /// Connection kind (`device`, `bootloader`, `recovery`, `sideload`, ...).
    pub kind: String,
    /// Serial, when the peer includes one (most devices leave it empty).
    pub serial: Option<String>,
    /// `key=value` properties other than `features`.
    pub properties: BTreeMap<String, String>,
    /// Feature flags from the `features=` entry.
    pub features: Vec<String>,
}

impl DeviceBanner {
    /// Parse a banner string. Never fails: unknown shapes yield a banner
    /// whose `kind` is the whole string.
    pub fn parse(identity: &str) -> Self {
        let mut parts = identity.splitn(3, ':');
        let kind = parts.next().unwrap_or_default().to_string();
        let serial = parts
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut properties = BTreeMap::new();
        let mut features = Vec::new();
        for entry in parts.next().unwrap_or_default().split(';') {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if key == "features" {
                features = value
                    .split(',')
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Self {
            kind,
            serial,
            properties,
            features,
        }
    }

    /// Whether the peer advertised `feature`.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
