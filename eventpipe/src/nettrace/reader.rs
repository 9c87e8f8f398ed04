use std::io::{ErrorKind, Read};

use crate::{EventPipeError, Result};

/// Byte-accurate cursor over the inbound transport.
///
/// Every read advances `position`, the logical offset from the first byte of
/// "Nettrace". All 4-byte alignment in the stream is computed against this
/// offset, never against the transport's own buffering. After any failed
/// read the reader is poisoned: the position can no longer be trusted, so
/// further reads are refused.
pub struct PositionedReader<R> {
    inner: R,
    position: u64,
    poisoned: bool,
}

impl<R: Read> PositionedReader<R> {
    pub fn new(inner: R) -> Self {
        PositionedReader {
            inner,
            position: 0,
            poisoned: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn guard(&self) -> Result<()> {
        if self.poisoned {
            return Err(EventPipeError::TransportFailure {
                position: self.position,
                source: std::io::Error::new(ErrorKind::Other, "read after a decode failure"),
            });
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes, looping over short reads. A zero-byte
    /// read mid-request means the transport closed inside a structure.
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.guard()?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.poisoned = true;
                    return Err(EventPipeError::UnexpectedEndOfStream {
                        position: self.position,
                    });
                }
                Ok(n) => {
                    filled += n;
                    self.position += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.poisoned = true;
                    return Err(EventPipeError::TransportFailure {
                        position: self.position,
                        source: e,
                    });
                }
            }
        }
        Ok(())
    }

    /// Read one byte, or `None` if the transport reports end-of-stream
    /// before it arrives. Only meaningful at object boundaries, where an
    /// ordered shutdown is legal.
    pub fn read_u8_or_eof(&mut self) -> Result<Option<u8>> {
        self.guard()?;
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.position += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.poisoned = true;
                    return Err(EventPipeError::TransportFailure {
                        position: self.position,
                        source: e,
                    });
                }
            }
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// LEB128-unsigned, at most 5 groups of 7 bits.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let start = self.position;
        let mut value = 0u32;
        let mut shift = 0;
        loop {
            if shift == 5 * 7 {
                return Err(EventPipeError::MalformedVarint { position: start });
            }
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// LEB128-unsigned, at most 10 groups of 7 bits.
    pub fn read_varint_u64(&mut self) -> Result<u64> {
        let start = self.position;
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            if shift == 10 * 7 {
                return Err(EventPipeError::MalformedVarint { position: start });
            }
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// UTF-16-LE code units up to and including a zero terminator. Returns
    /// the string and the total bytes consumed (an empty string is 2 bytes).
    /// Unpaired surrogates are replaced, not rejected.
    pub fn read_utf16_string(&mut self) -> Result<(String, u64)> {
        let mut units = Vec::new();
        let mut consumed = 0u64;
        loop {
            let unit = self.read_u16()?;
            consumed += 2;
            if unit == 0 {
                return Ok((String::from_utf16_lossy(&units), consumed));
            }
            units.push(unit);
        }
    }

    pub fn skip(&mut self, count: u64) -> Result<()> {
        let mut scratch = [0u8; 512];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(scratch.len() as u64) as usize;
            self.fill(&mut scratch[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Discard up to 3 bytes so that `position` lands on a 4-byte boundary
    /// of the logical stream.
    pub fn align4(&mut self) -> Result<()> {
        let rem = self.position % 4;
        if rem != 0 {
            self.skip(4 - rem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Delivers one byte per read call, like a slow pipe.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn primitives_advance_position() {
        let bytes = vec![0x2a, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut reader = PositionedReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_u8().unwrap(), 0x2a);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0x12345678);
        assert_eq!(reader.position(), 7);
    }

    #[test]
    fn short_reads_are_looped() {
        let mut reader = PositionedReader::new(TrickleReader {
            data: vec![0xef, 0xbe, 0xad, 0xde],
            pos: 0,
        });
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn eof_mid_structure_is_an_error() {
        let mut reader = PositionedReader::new(Cursor::new(vec![0x01, 0x02]));
        match reader.read_u32() {
            Err(EventPipeError::UnexpectedEndOfStream { position: 2 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // position 2: both available bytes were consumed before the failure
        assert!(reader.read_u8().is_err(), "reader must stay poisoned");
    }

    #[test]
    fn eof_at_boundary_is_not_an_error() {
        let mut reader = PositionedReader::new(Cursor::new(Vec::new()));
        assert_eq!(reader.read_u8_or_eof().unwrap(), None);
    }

    #[test]
    fn varint_single_and_multi_group() {
        let mut reader = PositionedReader::new(Cursor::new(vec![0x05, 0xe5, 0x8e, 0x26]));
        assert_eq!(reader.read_varint_u32().unwrap(), 5);
        assert_eq!(reader.read_varint_u32().unwrap(), 624_485);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn varint_u32_overflow() {
        // six continuation groups
        let mut reader =
            PositionedReader::new(Cursor::new(vec![0x80, 0x80, 0x80, 0x80, 0x80, 0x01]));
        match reader.read_varint_u32() {
            Err(EventPipeError::MalformedVarint { position: 0 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn varint_u64_ten_groups_max() {
        let mut bytes = vec![0x80u8; 9];
        bytes.push(0x01);
        let mut reader = PositionedReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_varint_u64().unwrap(), 1u64 << 63);

        let mut bytes = vec![0x80u8; 10];
        bytes.push(0x01);
        let mut reader = PositionedReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_varint_u64(),
            Err(EventPipeError::MalformedVarint { .. })
        ));
    }

    #[test]
    fn utf16_string_round_trip() {
        let mut bytes = Vec::new();
        for unit in "nope".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        let mut reader = PositionedReader::new(Cursor::new(bytes));
        let (s, consumed) = reader.read_utf16_string().unwrap();
        assert_eq!(s, "nope");
        assert_eq!(consumed, 10);
    }

    #[test]
    fn empty_utf16_string_is_two_bytes() {
        let mut reader = PositionedReader::new(Cursor::new(vec![0, 0]));
        let (s, consumed) = reader.read_utf16_string().unwrap();
        assert_eq!(s, "");
        assert_eq!(consumed, 2);
    }

    #[test]
    fn align4_consumes_the_remainder() {
        let mut reader = PositionedReader::new(Cursor::new(vec![0u8; 8]));
        reader.read_u8().unwrap();
        reader.align4().unwrap();
        assert_eq!(reader.position(), 4);
        reader.align4().unwrap();
        assert_eq!(reader.position(), 4);
    }
}
