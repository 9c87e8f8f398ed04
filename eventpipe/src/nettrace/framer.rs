use std::io::Read;

use log::trace;
use num_traits::FromPrimitive;

use super::reader::PositionedReader;
use super::{NettraceTag, ObjectKind};
use crate::{EventPipeError, Result};

pub const DEFAULT_BLOCK_CAPACITY: usize = 64 * 1024;
/// Hard ceiling for a single block; a stream claiming more is rejected
/// rather than buffered.
pub const MAX_BLOCK_SIZE: u32 = (8 * DEFAULT_BLOCK_CAPACITY) as u32;

/// Identity of one framed object, read from its FastSerialization type
/// header.
#[derive(Debug, Clone, Copy)]
pub struct ObjectFrame {
    pub kind: ObjectKind,
    pub version: u32,
    pub min_reader_version: u32,
}

impl ObjectFrame {
    pub fn require_version(&self, expected: u32, position: u64) -> Result<()> {
        if self.version != expected || self.min_reader_version != expected {
            return Err(EventPipeError::UnsupportedBlockVersion {
                position,
                kind: self.kind,
                version: self.version,
                min_reader_version: self.min_reader_version,
            });
        }
        Ok(())
    }
}

/// Read and classify the next object header.
///
/// Returns `None` when the transport closes at the object boundary or the
/// stream ends with a `NullReference` terminator tag. The header is three
/// tags (`BeginPrivateObject`, `BeginPrivateObject`, `NullReference`), two
/// version words, and a length-prefixed ASCII type name, closed by an
/// `EndObject` tag.
pub fn read_object_header<R: Read>(
    reader: &mut PositionedReader<R>,
) -> Result<Option<ObjectFrame>> {
    let position = reader.position();
    let Some(first) = reader.read_u8_or_eof()? else {
        return Ok(None);
    };
    match NettraceTag::from_u8(first) {
        Some(NettraceTag::NullReference) => return Ok(None),
        Some(NettraceTag::BeginPrivateObject) => {}
        _ => {
            return Err(EventPipeError::UnknownObject {
                position,
                name: format!("tag 0x{first:02x}"),
            })
        }
    }

    let type_tag = reader.read_u8()?;
    let null_tag = reader.read_u8()?;
    if NettraceTag::from_u8(type_tag) != Some(NettraceTag::BeginPrivateObject)
        || NettraceTag::from_u8(null_tag) != Some(NettraceTag::NullReference)
    {
        return Err(EventPipeError::UnknownObject {
            position,
            name: format!("tags 0x{type_tag:02x} 0x{null_tag:02x}"),
        });
    }

    let version = reader.read_u32()?;
    let min_reader_version = reader.read_u32()?;
    let name_length = reader.read_u32()?;
    if name_length > 64 {
        return Err(EventPipeError::UnknownObject {
            position,
            name: format!("<{name_length} byte name>"),
        });
    }
    let mut name_bytes = vec![0u8; name_length as usize];
    reader.fill(&mut name_bytes)?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    let kind = match (name_length, name.as_str()) {
        (5, "Trace") => ObjectKind::Trace,
        (10, "EventBlock") => ObjectKind::EventBlock,
        (13, "MetadataBlock") => ObjectKind::MetadataBlock,
        (10, "StackBlock") => ObjectKind::StackBlock,
        (7, "SPBlock") => ObjectKind::SequencePointBlock,
        _ => return Err(EventPipeError::UnknownObject { position, name }),
    };

    expect_end_object(reader)?;
    trace!("object {kind:?} v{version} (min reader v{min_reader_version})");

    Ok(Some(ObjectFrame {
        kind,
        version,
        min_reader_version,
    }))
}

pub fn expect_end_object<R: Read>(reader: &mut PositionedReader<R>) -> Result<()> {
    let byte = reader.read_u8()?;
    if NettraceTag::from_u8(byte) != Some(NettraceTag::EndObject) {
        return Err(EventPipeError::MissingEndObject {
            position: reader.position() - 1,
        });
    }
    Ok(())
}

/// Reusable buffer for block bodies. Owned by the session driver and lent to
/// one block parser at a time; grows on demand up to [`MAX_BLOCK_SIZE`] and
/// keeps its capacity across blocks.
pub struct BlockBuffer {
    buf: Vec<u8>,
}

impl BlockBuffer {
    pub fn new() -> Self {
        BlockBuffer {
            buf: Vec::with_capacity(DEFAULT_BLOCK_CAPACITY),
        }
    }

    /// Read one block body: size word, padding to the stream's 4-byte
    /// alignment, `size` body bytes, and the trailing `EndObject` tag (which
    /// is validated but not part of the returned slice). Returns the logical
    /// offset of the first body byte alongside the body.
    pub fn read_block<R: Read>(
        &mut self,
        reader: &mut PositionedReader<R>,
    ) -> Result<(u64, &[u8])> {
        let size_position = reader.position();
        let size = reader.read_u32()?;
        if size > MAX_BLOCK_SIZE {
            return Err(EventPipeError::BlockTooLarge {
                position: size_position,
                size,
                limit: MAX_BLOCK_SIZE,
            });
        }

        reader.align4()?;
        let origin = reader.position();

        self.buf.resize(size as usize, 0);
        reader.fill(&mut self.buf)?;
        expect_end_object(reader)?;

        Ok((origin, self.buf.as_slice()))
    }
}

impl Default for BlockBuffer {
    fn default() -> Self {
        Self::new()
    }
}
