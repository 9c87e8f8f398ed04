//! The Nettrace / FastSerialization stream format.
//!
//! A stream is a fixed prefix (`"Nettrace"`, then `"!FastSerialization.1"`),
//! one `Trace` object carrying capture-time facts, and a sequence of block
//! objects (events, metadata, stacks, sequence points) until the transport
//! closes or a `NullReference` tag ends the stream.

use binrw::BinRead;
use num_derive::FromPrimitive;

use crate::coreclr::KnownEvent;

mod blob;
mod blocks;
mod framer;
mod reader;
pub mod session;

pub use blob::{EventBlobHeader, EventBlobHeaderV4};
pub use blocks::BlockCursor;
pub use framer::{BlockBuffer, ObjectFrame, DEFAULT_BLOCK_CAPACITY, MAX_BLOCK_SIZE};
pub use reader::PositionedReader;

/// FastSerialization tag bytes. Only `NullReference`, `BeginPrivateObject`
/// and `EndObject` appear structurally; the rest exist so that a tag byte
/// inside tolerated regions still names itself in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum NettraceTag {
    NullReference = 1,
    ObjectReference = 2,
    ForwardReference = 3,
    BeginObject = 4,
    BeginPrivateObject = 5,
    EndObject = 6,
    ForwardDefinition = 7,
}

/// The closed set of object names a Nettrace stream may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Trace,
    EventBlock,
    MetadataBlock,
    StackBlock,
    SequencePointBlock,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct SyncTimeUtc {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

/// Body of the `Trace` object: capture-time facts the decoder mostly passes
/// through, except `pointer_size`, which fixes the stack frame width for the
/// rest of the stream.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct TraceInfo {
    pub sync_time_utc: SyncTimeUtc,
    pub sync_time_qpc: u64,
    pub qpc_frequency: u64,
    pub pointer_size: u32,
    pub process_id: u32,
    pub number_of_processors: u32,
    pub expected_cpu_sampling_rate: u32,
}

impl TraceInfo {
    /// On-wire size of the Trace object body.
    pub const WIRE_SIZE: usize = 48;

    pub fn frame_width(&self) -> u32 {
        if self.pointer_size == 4 {
            4
        } else {
            8
        }
    }
}

/// Prefix of every Event/Metadata block body. `header_size` may exceed the
/// fixed 20 bytes; the surplus is reserved and skipped.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct BlockHeader {
    pub header_size: u16,
    pub flags: u16,
    pub min_timestamp: u64,
    pub max_timestamp: u64,
}

impl BlockHeader {
    pub const WIRE_SIZE: u16 = 20;

    /// Bit 0 selects compressed event blob headers for the whole block.
    pub fn uses_compressed_headers(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct StackBlockHeader {
    pub first_id: u32,
    pub count: u32,
}

/// A captured call stack. Frame width follows the trace's pointer size, so a
/// single table holds either flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRecord {
    pub frames: Frames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frames {
    Ptr32(Vec<u32>),
    Ptr64(Vec<u64>),
}

impl Frames {
    pub fn len(&self) -> usize {
        match self {
            Frames::Ptr32(f) => f.len(),
            Frames::Ptr64(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame addresses widened to 64 bits, in capture order.
    pub fn iter_u64(&self) -> impl Iterator<Item = u64> + '_ {
        let (narrow, wide) = match self {
            Frames::Ptr32(f) => (Some(f.iter()), None),
            Frames::Ptr64(f) => (None, Some(f.iter())),
        };
        narrow
            .into_iter()
            .flatten()
            .map(|&a| a as u64)
            .chain(wide.into_iter().flatten().copied())
    }
}

/// Binds a metadata id to the provider/event identity used by every later
/// event blob that names the id. Id zero is the "unbound" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub metadata_id: u32,
    pub provider_name: String,
    pub event_id: u32,
    /// May be empty; many providers leave it blank.
    pub event_name: String,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,
}

/// One decoded event, published in stream order.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub provider_name: String,
    pub event_id: u32,
    pub event_name: Option<String>,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,

    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    pub timestamp: u64,
    pub activity_id: [u8; 16],
    pub related_activity_id: [u8; 16],
    pub is_sorted: bool,

    /// Resolved from the stack table at publication time; `None` when
    /// `stack_id` is zero or not (yet) known.
    pub stack: Option<StackRecord>,
    /// Raw payload bytes, always present even when `decoded` is set.
    pub payload: Vec<u8>,
    /// Structured form for the event ids this crate knows how to decode.
    pub decoded: Option<KnownEvent>,
}
