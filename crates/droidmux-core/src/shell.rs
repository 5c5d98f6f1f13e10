//! Shell protocol v2 packet framing.
//!
//! With the `shell_v2` feature, adbd wraps shell I/O in packets:
//!
//! ```text
//! +----+-----------------+-----------+
//! | id | length (u32 LE) | data      |
//! +----+-----------------+-----------+
//! ```
//!
//! Packets arrive split across (or packed into) arbitrary WRTE payloads, so
//! [`ShellV2Decoder`] buffers bytes until whole packets are available.

use serde::Serialize;
use thiserror::Error;

const PACKET_HEADER: usize = 5;

/// Largest packet body the decoder will buffer.
pub const MAX_PACKET_LEN: usize = 1024 * 1024;

pub const ID_STDIN: u8 = 0;
pub const ID_STDOUT: u8 = 1;
pub const ID_STDERR: u8 = 2;
pub const ID_EXIT: u8 = 3;
pub const ID_CLOSE_STDIN: u8 = 4;
pub const ID_WINDOW_SIZE: u8 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShellError {
    /// A packet header declared a body larger than the decoder accepts.
    #[error("shell packet {id} declares {len} bytes, limit is {max}")]
    PacketTooLarge { id: u8, len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellPacket {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Exit status; the payload is a single byte.
    Exit(u8),
    /// Any other packet id (stdin echo, window size, ...).
    Other { id: u8, data: Vec<u8> },
}

/// Result of a finished shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    /// Exit status; `None` when the device only supports the legacy shell.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }
}

/// Incremental shell-v2 packet decoder.
#[derive(Debug)]
pub struct ShellV2Decoder {
    buf: Vec<u8>,
    max_packet: usize,
}

impl Default for ShellV2Decoder {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            max_packet: MAX_PACKET_LEN,
        }
    }
}

impl ShellV2Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_packet(max_packet: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_packet,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete packet, if one is buffered.
    ///
    /// A header declaring a body over the limit is an error; the decoder
    /// should not be used after that.
    pub fn next_packet(&mut self) -> Result<Option<ShellPacket>, ShellError> {
        if self.buf.len() < PACKET_HEADER {
            return Ok(None);
        }
        let id = self.buf[0];
        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_packet {
            return Err(ShellError::PacketTooLarge {
                id,
                len,
                max: self.max_packet,
            });
        }
        if self.buf.len() < PACKET_HEADER + len {
            return Ok(None);
        }

        let data: Vec<u8> = self.buf[PACKET_HEADER..PACKET_HEADER + len].to_vec();
        self.buf.drain(..PACKET_HEADER + len);

        Ok(Some(match id {
            ID_STDOUT => ShellPacket::Stdout(data),
            ID_STDERR => ShellPacket::Stderr(data),
            ID_EXIT => ShellPacket::Exit(data.first().copied().unwrap_or(0)),
            id => ShellPacket::Other { id, data },
        }))
    }

    /// Bytes of an incomplete packet still buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Frame `data` as one shell-v2 packet.
pub fn encode_packet(id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER + data.len());
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Assembles newline-terminated lines from arbitrary chunks.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Flush a trailing partial line.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
