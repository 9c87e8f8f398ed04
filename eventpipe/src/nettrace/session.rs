use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use binrw::BinRead;
use log::{debug, info};

use super::blocks::{self, SessionTables};
use super::framer::{self, BlockBuffer, ObjectFrame};
use super::reader::PositionedReader;
use super::{EventRecord, MetadataRecord, ObjectKind, StackRecord, TraceInfo};
use crate::{EventPipeError, Result};

pub const NETTRACE_MAGIC: &[u8; 8] = b"Nettrace";
pub const FAST_SERIALIZATION_IDENT: &[u8; 20] = b"!FastSerialization.1";

/// Receives decoded records in exact stream order. The decoder never buffers
/// or reorders; a slow sink backpressures the transport.
pub trait EventSink {
    fn on_trace_info(&mut self, _info: &TraceInfo) {}
    fn on_event(&mut self, event: EventRecord);
    /// Raw bytes of a sequence-point block, for consumers that track
    /// per-thread checkpoints. The decoder itself does not interpret them.
    fn on_sequence_point(&mut self, _block: &[u8]) {}
}

/// Why `listen` returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The transport reached an ordered end of stream.
    EndOfStream,
    /// A [`StopHandle`] asked the session to finish.
    StopRequested,
}

/// One-way stop signal. Cloneable so a control thread can request the stop
/// while the session thread is blocked in `listen`. The flag is observed
/// between top-level objects; the object being decoded always completes (or
/// fails) first. For timely cancellation, shut the transport down instead.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Decoder state machine over one Nettrace stream.
///
/// Owns the transport, the metadata and stack tables, the reusable block
/// buffer, and the stop flag. None of that state survives the session.
pub struct EventPipeSession<R> {
    reader: PositionedReader<R>,
    session_id: u64,
    tables: SessionTables,
    block: BlockBuffer,
    stop: Arc<AtomicBool>,
    trace_info: Option<TraceInfo>,
}

impl<R: Read> EventPipeSession<R> {
    pub fn new(transport: R, session_id: u64) -> Self {
        EventPipeSession {
            reader: PositionedReader::new(transport),
            session_id,
            tables: SessionTables::default(),
            block: BlockBuffer::new(),
            stop: Arc::new(AtomicBool::new(false)),
            trace_info: None,
        }
    }

    /// The id the runtime assigned when the session was started; needed to
    /// stop the session over a second connection.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn trace_info(&self) -> Option<&TraceInfo> {
        self.trace_info.as_ref()
    }

    pub fn metadata(&self) -> &std::collections::HashMap<u32, MetadataRecord> {
        &self.tables.metadata
    }

    pub fn stacks(&self) -> &std::collections::HashMap<u32, StackRecord> {
        &self.tables.stacks
    }

    /// Logical bytes consumed so far, counted from the 'N' of "Nettrace".
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Decode the whole stream, publishing to `sink`, until end of stream, a
    /// decode error, or a cooperative stop.
    pub fn listen(&mut self, sink: &mut dyn EventSink) -> Result<StopReason> {
        if self.stop_requested() {
            return Ok(StopReason::StopRequested);
        }

        self.read_stream_header()?;

        let Some(frame) = framer::read_object_header(&mut self.reader)? else {
            return Err(EventPipeError::UnexpectedEndOfStream {
                position: self.reader.position(),
            });
        };
        if frame.kind != ObjectKind::Trace {
            return Err(EventPipeError::UnknownObject {
                position: self.reader.position(),
                name: format!("{:?} before the Trace object", frame.kind),
            });
        }
        frame.require_version(4, self.reader.position())?;
        self.read_trace_fields(sink)?;

        loop {
            if self.stop_requested() {
                info!("stop requested, leaving the object loop");
                return Ok(StopReason::StopRequested);
            }
            let Some(frame) = framer::read_object_header(&mut self.reader)? else {
                info!("end of stream at offset {}", self.reader.position());
                return Ok(StopReason::EndOfStream);
            };
            self.dispatch(frame, sink)?;
        }
    }

    fn read_stream_header(&mut self) -> Result<()> {
        let mut magic = [0u8; 8];
        self.reader.fill(&mut magic)?;
        if &magic != NETTRACE_MAGIC {
            return Err(EventPipeError::BadMagic { position: 0 });
        }

        let ident_length = self.reader.read_u32()?;
        if ident_length as usize != FAST_SERIALIZATION_IDENT.len() {
            return Err(EventPipeError::BadFastSerializationVersion { position: 8 });
        }
        let mut ident = [0u8; 20];
        self.reader.fill(&mut ident)?;
        if &ident != FAST_SERIALIZATION_IDENT {
            return Err(EventPipeError::BadFastSerializationVersion { position: 12 });
        }
        Ok(())
    }

    fn read_trace_fields(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        let mut buf = [0u8; TraceInfo::WIRE_SIZE];
        self.reader.fill(&mut buf)?;
        let info = TraceInfo::read(&mut std::io::Cursor::new(&buf[..])).map_err(|_| {
            EventPipeError::UnexpectedEndOfStream {
                position: self.reader.position(),
            }
        })?;
        framer::expect_end_object(&mut self.reader)?;

        info!(
            "trace: pid {} on {} processors, {}-bit, qpc frequency {}",
            info.process_id,
            info.number_of_processors,
            info.pointer_size * 8,
            info.qpc_frequency
        );
        self.trace_info = Some(info);
        sink.on_trace_info(&info);
        Ok(())
    }

    fn dispatch(&mut self, frame: ObjectFrame, sink: &mut dyn EventSink) -> Result<()> {
        // frame width defaults to 64-bit if a capture ever omits the Trace
        // object; pointer_size pins it otherwise
        let pointer_size = self.trace_info.map_or(8, |t| t.pointer_size);

        match frame.kind {
            ObjectKind::Trace => {
                frame.require_version(4, self.reader.position())?;
                self.read_trace_fields(sink)
            }
            ObjectKind::EventBlock => {
                let (origin, body) = self.block.read_block(&mut self.reader)?;
                debug!("event block: {} bytes at offset {origin}", body.len());
                blocks::parse_event_block(&frame, body, origin, &mut self.tables, pointer_size, sink)
            }
            ObjectKind::MetadataBlock => {
                let (origin, body) = self.block.read_block(&mut self.reader)?;
                debug!("metadata block: {} bytes at offset {origin}", body.len());
                blocks::parse_metadata_block(&frame, body, origin, &mut self.tables)
            }
            ObjectKind::StackBlock => {
                let (origin, body) = self.block.read_block(&mut self.reader)?;
                debug!("stack block: {} bytes at offset {origin}", body.len());
                blocks::parse_stack_block(&frame, body, origin, &mut self.tables, pointer_size)
            }
            ObjectKind::SequencePointBlock => {
                let (origin, body) = self.block.read_block(&mut self.reader)?;
                frame.require_version(2, origin)?;
                sink.on_sequence_point(body);
                Ok(())
            }
        }
    }
}
