//! Frame codec: the smallest unit of the sparse stream wire format.
//!
//! Each frame begins with a fixed-width, ASCII header so the stream is
//! greppable and resyncable by eye:
//!
//! ```text
//! <kind:2><' '><start:16 hex><' '><length:16 hex><\r\n>
//! ```
//!
//! `META` and `DATA` frames carry a payload of exactly `length` bytes
//! followed by a `\r\n` terminator. `ZERO` and `STOP` frames carry neither
//! payload nor terminator; `length` for `ZERO` is the run length being
//! zeroed, and is always `0` for `STOP`.

use crate::error::{Error, Result};
use std::io::{Read, Write};

const HEADER_LEN: usize = 2 + 1 + 16 + 1 + 16 + 2;

/// The four frame kinds the stream format defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Meta,
    Data,
    Zero,
    Stop,
}

impl FrameKind {
    fn magic(self) -> &'static str {
        match self {
            FrameKind::Meta => "MA",
            FrameKind::Data => "DA",
            FrameKind::Zero => "ZE",
            FrameKind::Stop => "ST",
        }
    }

    fn from_magic(magic: &str) -> Result<Self> {
        match magic {
            "MA" => Ok(FrameKind::Meta),
            "DA" => Ok(FrameKind::Data),
            "ZE" => Ok(FrameKind::Zero),
            "ST" => Ok(FrameKind::Stop),
            other => Err(Error::stream_format(format!("unknown frame kind '{other}'"))),
        }
    }

    fn has_payload(self) -> bool {
        matches!(self, FrameKind::Meta | FrameKind::Data)
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub start: u64,
    pub length: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn meta(payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Meta,
            start: 0,
            length: payload.len() as u64,
            payload,
        }
    }

    pub fn data(start: u64, payload: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Data,
            start,
            length: payload.len() as u64,
            payload,
        }
    }

    pub fn zero(start: u64, length: u64) -> Self {
        Frame {
            kind: FrameKind::Zero,
            start,
            length,
            payload: Vec::new(),
        }
    }

    pub fn stop() -> Self {
        Frame {
            kind: FrameKind::Stop,
            start: 0,
            length: 0,
            payload: Vec::new(),
        }
    }

    /// Writes this frame's header, payload and terminator to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.kind.has_payload() && self.payload.len() as u64 != self.length {
            return Err(Error::stream_format(
                "frame payload length does not match declared length",
            ));
        }
        let header = format!(
            "{} {:016x} {:016x}\r\n",
            self.kind.magic(),
            self.start,
            self.length
        );
        writer.write_all(header.as_bytes()).map_err(Error::io_simple)?;
        if self.kind.has_payload() {
            writer.write_all(&self.payload).map_err(Error::io_simple)?;
            writer.write_all(b"\r\n").map_err(Error::io_simple)?;
        }
        Ok(())
    }

    /// Reads one frame from `reader`. Returns `Ok(None)` on a clean EOF
    /// before any header bytes are read (used by readers that stop at a
    /// trailer rather than a `STOP` frame).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_LEN];
        match read_exact_or_eof(reader, &mut header)? {
            false => return Ok(None),
            true => {}
        }
        let header_str = std::str::from_utf8(&header)
            .map_err(|_| Error::stream_format("frame header is not valid ASCII"))?;
        if !header_str.ends_with("\r\n") {
            return Err(Error::stream_format("frame header missing CRLF terminator"));
        }
        let magic = &header_str[0..2];
        let start_hex = &header_str[3..19];
        let length_hex = &header_str[20..36];
        let kind = FrameKind::from_magic(magic)?;
        let start = u64::from_str_radix(start_hex, 16)
            .map_err(|_| Error::stream_format("invalid hex start offset in frame header"))?;
        let length = u64::from_str_radix(length_hex, 16)
            .map_err(|_| Error::stream_format("invalid hex length in frame header"))?;

        let payload = if kind.has_payload() {
            let mut buf = vec![0u8; length as usize];
            reader.read_exact(&mut buf).map_err(Error::io_simple)?;
            let mut term = [0u8; 2];
            reader.read_exact(&mut term).map_err(Error::io_simple)?;
            if &term != b"\r\n" {
                return Err(Error::stream_format("frame payload missing CRLF terminator"));
            }
            buf
        } else {
            Vec::new()
        };

        Ok(Some(Frame {
            kind,
            start,
            length,
            payload,
        }))
    }
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of erroring when
/// zero bytes could be read (a clean EOF at a frame boundary).
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).map_err(Error::io_simple)?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::stream_format("truncated frame header"));
        }
        filled += n;
    }
    Ok(true)
}
