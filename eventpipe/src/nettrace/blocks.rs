use std::collections::HashMap;

use binrw::BinRead;
use log::{debug, warn};

use super::blob::{read_blob_header, EventBlobHeader};
use super::framer::ObjectFrame;
use super::session::EventSink;
use super::{BlockHeader, EventRecord, Frames, MetadataRecord, StackBlockHeader, StackRecord};
use crate::{coreclr, EventPipeError, Result};

/// Bounds-checked cursor over one extracted block body.
///
/// `origin` is the logical stream offset of the first body byte, so error
/// positions and alignment stay expressed in stream coordinates even though
/// parsing happens against an in-memory buffer. Block bodies start 4-byte
/// aligned in the stream, which makes buffer-relative and stream-relative
/// alignment interchangeable.
pub struct BlockCursor<'a> {
    data: &'a [u8],
    pos: usize,
    origin: u64,
}

impl<'a> BlockCursor<'a> {
    pub fn new(data: &'a [u8], origin: u64) -> Self {
        BlockCursor {
            data,
            pos: 0,
            origin,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn stream_position(&self) -> u64 {
        self.origin + self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn truncated<T>(&self) -> Result<T> {
        Err(EventPipeError::UnexpectedEndOfStream {
            position: self.origin + self.data.len() as u64,
        })
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return self.truncated();
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let start = self.stream_position();
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

    pub fn read_varint_u64(&mut self) -> Result<u64> {
        let start = self.stream_position();
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

    /// UTF-16-LE code units up to and including the zero terminator.
    pub fn read_utf16_string(&mut self) -> Result<(String, usize)> {
        let mut units = Vec::new();
        let start = self.pos;
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                return Ok((String::from_utf16_lossy(&units), self.pos - start));
            }
            units.push(unit);
        }
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        if count > self.remaining() {
            return self.truncated();
        }
        self.pos += count;
        Ok(())
    }

    /// Advance to the next 4-byte boundary, clamped to the end of the block.
    pub fn align4(&mut self) -> Result<()> {
        let rem = self.pos % 4;
        if rem != 0 {
            self.pos += (4 - rem).min(self.remaining());
        }
        Ok(())
    }

    /// Run a binrw parser over the unread remainder of the block. A parse
    /// failure is reported as truncation at the point the parser reached.
    pub fn parse_with<T, F>(&mut self, parse: F) -> Result<T>
    where
        F: FnOnce(&mut std::io::Cursor<&'a [u8]>) -> binrw::BinResult<T>,
    {
        let mut io = std::io::Cursor::new(&self.data[self.pos..]);
        match parse(&mut io) {
            Ok(value) => {
                self.pos += io.position() as usize;
                Ok(value)
            }
            Err(_) => Err(EventPipeError::UnexpectedEndOfStream {
                position: self.stream_position() + io.position(),
            }),
        }
    }
}

/// Decoder state shared by the block parsers for the lifetime of one
/// session. The driver owns it; parsers borrow it while they run.
#[derive(Debug, Default)]
pub struct SessionTables {
    pub metadata: HashMap<u32, MetadataRecord>,
    pub stacks: HashMap<u32, StackRecord>,
    pub threads: HashMap<u64, ThreadSequenceState>,
}

/// Last published sequence number and timestamp per capture thread, kept to
/// flag sequence regressions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSequenceState {
    pub sequence_number: u32,
    pub last_timestamp: u64,
}

/// Common prologue of Event and Metadata block bodies: the block header,
/// reserved surplus bytes, and the compressed-headers flag.
fn read_block_prologue(cursor: &mut BlockCursor<'_>) -> Result<BlockHeader> {
    let header = cursor.parse_with(|io| BlockHeader::read(io))?;
    let surplus = header.header_size.saturating_sub(BlockHeader::WIRE_SIZE);
    if surplus > 0 {
        cursor.skip(surplus as usize)?;
    }
    Ok(header)
}

/// Blob loop termination. Some producers count the object's trailing
/// EndObject tag into the reported block size, so the last byte of the body
/// may not belong to any blob.
fn has_more_blobs(cursor: &BlockCursor<'_>) -> bool {
    cursor.remaining() > 1
}

pub fn parse_metadata_block(
    frame: &ObjectFrame,
    data: &[u8],
    origin: u64,
    tables: &mut SessionTables,
) -> Result<()> {
    frame.require_version(2, origin)?;

    let mut cursor = BlockCursor::new(data, origin);
    let header = read_block_prologue(&mut cursor)?;
    let compressed = header.uses_compressed_headers();
    let mut carried = EventBlobHeader::default();

    while has_more_blobs(&cursor) {
        let blob = read_blob_header(&mut cursor, &mut carried, compressed)?;
        let payload_start = cursor.position();

        let metadata_id = cursor.read_u32()?;
        let (provider_name, _) = cursor.read_utf16_string()?;
        let event_id = cursor.read_u32()?;
        let (event_name, _) = cursor.read_utf16_string()?;
        let keywords = cursor.read_u64()?;
        let version = cursor.read_u32()?;
        let level = cursor.read_u32()?;

        let consumed = cursor.position() - payload_start;
        let declared = blob.payload_size as usize;
        if consumed > declared {
            return Err(EventPipeError::UnexpectedEndOfStream {
                position: cursor.stream_position(),
            });
        }
        // trailing bytes are reserved (field schemas, tagged extensions)
        cursor.skip(declared - consumed)?;
        if !compressed {
            cursor.align4()?;
        }

        debug!(
            "metadata {metadata_id}: provider {provider_name:?} event {event_id} ({event_name:?})"
        );
        tables.metadata.insert(
            metadata_id,
            MetadataRecord {
                metadata_id,
                provider_name,
                event_id,
                event_name,
                keywords,
                version,
                level,
            },
        );
    }
    Ok(())
}

pub fn parse_event_block(
    frame: &ObjectFrame,
    data: &[u8],
    origin: u64,
    tables: &mut SessionTables,
    pointer_size: u32,
    sink: &mut dyn EventSink,
) -> Result<()> {
    frame.require_version(2, origin)?;

    let mut cursor = BlockCursor::new(data, origin);
    let header = read_block_prologue(&mut cursor)?;
    let compressed = header.uses_compressed_headers();
    // deltas are cumulative across blobs of one block, never across blocks
    let mut carried = EventBlobHeader::default();

    while has_more_blobs(&cursor) {
        let blob_offset = cursor.stream_position();
        let blob = read_blob_header(&mut cursor, &mut carried, compressed)?;
        let payload = cursor.read_bytes(blob.payload_size as usize)?;
        if !compressed {
            cursor.align4()?;
        }

        let Some(meta) = tables.metadata.get(&blob.metadata_id).filter(|_| blob.metadata_id != 0)
        else {
            // tolerated: skip by the declared payload length and keep going
            warn!(
                "event blob at offset {blob_offset} references unbound metadata id {}; \
                 skipping {} payload bytes",
                blob.metadata_id, blob.payload_size
            );
            continue;
        };

        let thread = tables.threads.entry(blob.capture_thread_id).or_default();
        if thread.sequence_number != 0 && blob.sequence_number <= thread.sequence_number {
            warn!(
                "sequence number went from {} to {} on capture thread {} (previous event at {})",
                thread.sequence_number,
                blob.sequence_number,
                blob.capture_thread_id,
                thread.last_timestamp
            );
        }
        thread.sequence_number = blob.sequence_number;
        thread.last_timestamp = blob.timestamp;

        let stack = (blob.stack_id != 0)
            .then(|| tables.stacks.get(&blob.stack_id).cloned())
            .flatten();
        let decoded = coreclr::decode_event(&meta.provider_name, meta.event_id, payload, pointer_size);

        sink.on_event(EventRecord {
            provider_name: meta.provider_name.clone(),
            event_id: meta.event_id,
            event_name: (!meta.event_name.is_empty()).then(|| meta.event_name.clone()),
            keywords: meta.keywords,
            version: meta.version,
            level: meta.level,
            sequence_number: blob.sequence_number,
            thread_id: blob.thread_id,
            capture_thread_id: blob.capture_thread_id,
            processor_number: blob.processor_number,
            stack_id: blob.stack_id,
            timestamp: blob.timestamp,
            activity_id: blob.activity_id,
            related_activity_id: blob.related_activity_id,
            is_sorted: blob.is_sorted,
            stack,
            payload: payload.to_vec(),
            decoded,
        });
    }
    Ok(())
}

pub fn parse_stack_block(
    frame: &ObjectFrame,
    data: &[u8],
    origin: u64,
    tables: &mut SessionTables,
    pointer_size: u32,
) -> Result<()> {
    frame.require_version(2, origin)?;

    let mut cursor = BlockCursor::new(data, origin);
    let header = cursor.parse_with(|io| StackBlockHeader::read(io))?;
    let frame_width = if pointer_size == 4 { 4u32 } else { 8u32 };

    for index in 0..header.count {
        let stack_size = cursor.read_u32()?;
        let frame_count = stack_size / frame_width;
        let frames = if frame_width == 4 {
            let mut frames = Vec::with_capacity(frame_count as usize);
            for _ in 0..frame_count {
                frames.push(cursor.read_u32()?);
            }
            Frames::Ptr32(frames)
        } else {
            let mut frames = Vec::with_capacity(frame_count as usize);
            for _ in 0..frame_count {
                frames.push(cursor.read_u64()?);
            }
            Frames::Ptr64(frames)
        };
        // a stack size that is not a whole number of frames leaves dregs
        cursor.skip((stack_size % frame_width) as usize)?;
        tables
            .stacks
            .insert(header.first_id.wrapping_add(index), StackRecord { frames });
    }
    debug!(
        "stack block installed ids {}..={}",
        header.first_id,
        header.first_id.wrapping_add(header.count.wrapping_sub(1))
    );
    Ok(())
}
