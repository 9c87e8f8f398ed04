//! Live client for the .NET runtime's out-of-process diagnostics facility.
//!
//! A managed process exposes a diagnostics endpoint (a Unix domain socket on
//! Linux/macOS). [`diagnostics::DiagnosticsClient`] connects to it, starts an
//! EventPipe tracing session, and hands the same connection to
//! [`nettrace::EventPipeSession`], which decodes the resulting Nettrace byte
//! stream and publishes each event to a caller-supplied sink.
//!
//! Format reference:
//! <https://github.com/microsoft/perfview/blob/main/src/TraceEvent/EventPipe/EventPipeFormat.md>

use thiserror::Error;

pub mod coreclr;
pub mod diagnostics;
pub mod nettrace;

pub use nettrace::session::{EventPipeSession, EventSink, StopHandle, StopReason};
pub use nettrace::{EventRecord, MetadataRecord, StackRecord, TraceInfo};

use nettrace::ObjectKind;

/// Everything that can go wrong between connecting to the diagnostics
/// endpoint and the end of the event stream. Structural decode errors carry
/// the logical stream offset (counted from the first byte of "Nettrace") at
/// which they were detected.
#[derive(Error, Debug)]
pub enum EventPipeError {
    #[error("transport failure at stream offset {position}: {source}")]
    TransportFailure {
        position: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected end of stream at offset {position}")]
    UnexpectedEndOfStream { position: u64 },
    #[error("stream does not start with the Nettrace magic (offset {position})")]
    BadMagic { position: u64 },
    #[error("unsupported FastSerialization identifier at offset {position}")]
    BadFastSerializationVersion { position: u64 },
    #[error("unknown object {name:?} at offset {position}")]
    UnknownObject { position: u64, name: String },
    #[error(
        "unsupported {kind:?} version {version} (min reader {min_reader_version}) at offset {position}"
    )]
    UnsupportedBlockVersion {
        position: u64,
        kind: ObjectKind,
        version: u32,
        min_reader_version: u32,
    },
    #[error("expected an EndObject tag at offset {position}")]
    MissingEndObject { position: u64 },
    #[error("varint overflow at offset {position}")]
    MalformedVarint { position: u64 },
    #[error("block of {size} bytes at offset {position} exceeds the {limit} byte ceiling")]
    BlockTooLarge { position: u64, size: u32, limit: u32 },
    #[error("diagnostics IPC failure: {0}")]
    Ipc(#[from] std::io::Error),
    #[error("no diagnostics socket found for pid {pid}")]
    EndpointNotFound { pid: u32 },
    #[error("diagnostics command rejected by the runtime (hresult 0x{hresult:08x})")]
    CommandRejected { hresult: u32 },
}

pub type Result<T> = std::result::Result<T, EventPipeError>;
