//! CoreCLR provider vocabulary: the keyword masks and verbosity levels used
//! when subscribing, and payload decoders for the runtime event ids this
//! crate understands. Everything else stays opaque on the event record.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::nettrace::BlockCursor;
use crate::Result;

pub const DOTNET_RUNTIME_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
pub const DOTNET_RUNDOWN_PROVIDER: &str = "Microsoft-Windows-DotNETRuntimeRundown";
pub const SAMPLE_PROFILER_PROVIDER: &str = "Microsoft-DotNETCore-SampleProfiler";

bitflags! {
    /// CLR event category mask, passed as the provider keywords when a
    /// session is started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKeyword: u64 {
        const GC                               = 0x1;
        const GC_HANDLE                        = 0x2;
        const LOADER                           = 0x8;
        const JIT                              = 0x10;
        const NGEN                             = 0x20;
        const SECURITY                         = 0x400;
        const APP_DOMAIN_RESOURCE_MANAGEMENT   = 0x800;
        const JIT_TRACING                      = 0x1000;
        const INTEROP                          = 0x2000;
        const CONTENTION                       = 0x4000;
        const EXCEPTION                        = 0x8000;
        const THREADING                        = 0x10000;
        const TYPE                             = 0x80000;
        const GC_HEAP_DUMP                     = 0x100000;
        const GC_SAMPLED_OBJECT_ALLOCATION_HIGH = 0x200000;
        const GC_SAMPLED_OBJECT_ALLOCATION_LOW  = 0x2000000;
        const STACK                            = 0x40000000;

        const _ = !0;
    }
}

/// Subscription verbosity, 1 (critical) to 5 (verbose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u32)]
pub enum EventVerbosityLevel {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

/// Runtime event ids this crate dispatches on.
pub mod event_id {
    pub const ALLOCATION_TICK: u32 = 10;
    pub const EXCEPTION_THROWN: u32 = 80;
    pub const CONTENTION_START: u32 = 81;
    pub const CONTENTION_STOP: u32 = 91;
}

/// Structured payloads for the decoded event ids.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownEvent {
    ExceptionThrown(ExceptionThrownEvent),
    ContentionStart(ContentionEvent),
    ContentionStop(ContentionEvent),
}

/// ExceptionThrown_V1: two UTF-16 strings, then the faulting instruction
/// pointer (width follows the capture's pointer size), then reserved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionThrownEvent {
    pub exception_type: String,
    pub message: String,
    pub instruction_pointer: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ContentionFlags {
    Managed = 0,
    Native = 1,
}

/// ContentionStart_V1 / ContentionStop: a flags byte and the CLR instance
/// id; stop events from newer runtimes append the wait duration.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentionEvent {
    pub flags: Option<ContentionFlags>,
    pub clr_instance_id: u16,
    pub duration_ns: Option<f64>,
}

/// Decode the payloads this crate knows. `None` means the caller should
/// treat the payload as opaque; a malformed payload also falls back to
/// opaque rather than failing the stream.
pub fn decode_event(
    provider_name: &str,
    event_id: u32,
    payload: &[u8],
    pointer_size: u32,
) -> Option<KnownEvent> {
    if provider_name != DOTNET_RUNTIME_PROVIDER {
        return None;
    }
    match event_id {
        event_id::EXCEPTION_THROWN => decode_exception_thrown(payload, pointer_size)
            .ok()
            .map(KnownEvent::ExceptionThrown),
        event_id::CONTENTION_START => decode_contention(payload)
            .ok()
            .map(KnownEvent::ContentionStart),
        event_id::CONTENTION_STOP => decode_contention(payload)
            .ok()
            .map(KnownEvent::ContentionStop),
        _ => None,
    }
}

fn decode_exception_thrown(payload: &[u8], pointer_size: u32) -> Result<ExceptionThrownEvent> {
    let mut cursor = BlockCursor::new(payload, 0);
    let (exception_type, _) = cursor.read_utf16_string()?;
    let (message, _) = cursor.read_utf16_string()?;
    let instruction_pointer = if pointer_size == 4 {
        (cursor.remaining() >= 4)
            .then(|| cursor.read_u32().map(u64::from))
            .transpose()?
    } else {
        (cursor.remaining() >= 8)
            .then(|| cursor.read_u64())
            .transpose()?
    };
    Ok(ExceptionThrownEvent {
        exception_type,
        message,
        instruction_pointer,
    })
}

fn decode_contention(payload: &[u8]) -> Result<ContentionEvent> {
    let mut cursor = BlockCursor::new(payload, 0);
    let flags = ContentionFlags::from_u8(cursor.read_u8()?);
    let clr_instance_id = cursor.read_u16()?;
    let duration_ns = (cursor.remaining() >= 8)
        .then(|| cursor.read_u64().map(f64::from_bits))
        .transpose()?;
    Ok(ContentionEvent {
        flags,
        clr_instance_id,
        duration_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_utf16z(out: &mut Vec<u8>, s: &str) {
        for unit in s.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
    }

    #[test]
    fn exception_thrown_with_64_bit_ip() {
        let mut payload = Vec::new();
        push_utf16z(&mut payload, "System.InvalidOperationException");
        push_utf16z(&mut payload, "nope");
        payload.extend_from_slice(&0x7ffe_1234u64.to_le_bytes());

        let Some(KnownEvent::ExceptionThrown(ev)) = decode_event(
            DOTNET_RUNTIME_PROVIDER,
            event_id::EXCEPTION_THROWN,
            &payload,
            8,
        ) else {
            panic!("expected a decoded exception");
        };
        assert_eq!(ev.exception_type, "System.InvalidOperationException");
        assert_eq!(ev.message, "nope");
        assert_eq!(ev.instruction_pointer, Some(0x7ffe_1234));
    }

    #[test]
    fn exception_with_empty_message_and_no_tail() {
        let mut payload = Vec::new();
        push_utf16z(&mut payload, "E");
        push_utf16z(&mut payload, "");

        let Some(KnownEvent::ExceptionThrown(ev)) = decode_event(
            DOTNET_RUNTIME_PROVIDER,
            event_id::EXCEPTION_THROWN,
            &payload,
            4,
        ) else {
            panic!("expected a decoded exception");
        };
        assert_eq!(ev.message, "");
        assert_eq!(ev.instruction_pointer, None);
    }

    #[test]
    fn truncated_exception_payload_falls_back_to_opaque() {
        // string with no terminator
        let payload = vec![0x41, 0x00, 0x42];
        assert_eq!(
            decode_event(
                DOTNET_RUNTIME_PROVIDER,
                event_id::EXCEPTION_THROWN,
                &payload,
                8
            ),
            None
        );
    }

    #[test]
    fn contention_stop_with_duration() {
        let mut payload = vec![0u8]; // managed
        payload.extend_from_slice(&5u16.to_le_bytes());
        payload.extend_from_slice(&1250.5f64.to_bits().to_le_bytes());

        let Some(KnownEvent::ContentionStop(ev)) = decode_event(
            DOTNET_RUNTIME_PROVIDER,
            event_id::CONTENTION_STOP,
            &payload,
            8,
        ) else {
            panic!("expected a decoded contention stop");
        };
        assert_eq!(ev.flags, Some(ContentionFlags::Managed));
        assert_eq!(ev.clr_instance_id, 5);
        assert_eq!(ev.duration_ns, Some(1250.5));
    }

    #[test]
    fn other_providers_stay_opaque() {
        assert_eq!(
            decode_event(SAMPLE_PROFILER_PROVIDER, event_id::EXCEPTION_THROWN, &[], 8),
            None
        );
    }
}
