//! The .NET diagnostics IPC protocol: endpoint discovery, the
//! `DOTNET_IPC_V1` command envelopes, and the client that turns a connection
//! into a decoding [`EventPipeSession`].
//!
//! The runtime serves one command per connection. Starting a session leaves
//! the Nettrace byte stream on the same connection; stopping it therefore
//! requires a second, independent connection so the stop envelope never
//! interleaves with inbound stream bytes.

use std::io::Read;

use crate::coreclr::{EventKeyword, EventVerbosityLevel, DOTNET_RUNTIME_PROVIDER};
use crate::{EventPipeError, Result};

pub const IPC_MAGIC: &[u8; 14] = b"DOTNET_IPC_V1\0";
const IPC_HEADER_SIZE: u16 = 20;

/// Output format requested from the runtime; this crate only decodes
/// NetTrace.
pub const NETTRACE_FORMAT: u32 = 1;

mod command_set {
    pub const EVENT_PIPE: u8 = 0x02;
}

mod event_pipe_command {
    pub const STOP_TRACING: u8 = 0x01;
    pub const COLLECT_TRACING_2: u8 = 0x03;
}

mod server_response {
    pub const ERROR: u8 = 0xFF;
}

/// One provider subscription inside a start request.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub keywords: EventKeyword,
    pub level: EventVerbosityLevel,
    pub filter: String,
}

impl ProviderConfig {
    /// Subscribe to the CLR runtime provider itself.
    pub fn runtime(keywords: EventKeyword, level: EventVerbosityLevel) -> Self {
        ProviderConfig {
            name: DOTNET_RUNTIME_PROVIDER.to_owned(),
            keywords,
            level,
            filter: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub circular_buffer_mb: u32,
    pub request_rundown: bool,
    pub providers: Vec<ProviderConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            circular_buffer_mb: 256,
            request_rundown: false,
            providers: vec![ProviderConfig::runtime(
                EventKeyword::GC | EventKeyword::EXCEPTION | EventKeyword::CONTENTION,
                EventVerbosityLevel::Verbose,
            )],
        }
    }
}

fn write_utf16z(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

fn envelope(set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let total = IPC_HEADER_SIZE as usize + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(IPC_MAGIC);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.push(set);
    out.push(command);
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved
    out.extend_from_slice(payload);
    out
}

/// CollectTracing2: circular buffer size, output format, rundown flag, then
/// the provider list.
pub fn collect_tracing_envelope(config: &SessionConfig) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&config.circular_buffer_mb.to_le_bytes());
    payload.extend_from_slice(&NETTRACE_FORMAT.to_le_bytes());
    payload.push(config.request_rundown as u8);
    payload.extend_from_slice(&(config.providers.len() as u32).to_le_bytes());
    for provider in &config.providers {
        payload.extend_from_slice(&provider.keywords.bits().to_le_bytes());
        payload.extend_from_slice(&(provider.level as u32).to_le_bytes());
        write_utf16z(&mut payload, &provider.name);
        write_utf16z(&mut payload, &provider.filter);
    }
    envelope(
        command_set::EVENT_PIPE,
        event_pipe_command::COLLECT_TRACING_2,
        &payload,
    )
}

/// StopTracing: just the session id to tear down.
pub fn stop_tracing_envelope(session_id: u64) -> Vec<u8> {
    envelope(
        command_set::EVENT_PIPE,
        event_pipe_command::STOP_TRACING,
        &session_id.to_le_bytes(),
    )
}

/// Read a response envelope and its u64 payload (the session id on both
/// start and stop). An error response carries an HRESULT instead.
fn read_response_u64(stream: &mut impl Read) -> Result<u64> {
    let mut header = [0u8; IPC_HEADER_SIZE as usize];
    stream.read_exact(&mut header)?;
    if &header[..14] != IPC_MAGIC {
        return Err(EventPipeError::Ipc(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "response does not start with the DOTNET_IPC_V1 magic",
        )));
    }
    let command_id = header[17];
    if command_id == server_response::ERROR {
        let mut hresult = [0u8; 4];
        stream.read_exact(&mut hresult)?;
        return Err(EventPipeError::CommandRejected {
            hresult: u32::from_le_bytes(hresult),
        });
    }
    let mut value = [0u8; 8];
    stream.read_exact(&mut value)?;
    Ok(u64::from_le_bytes(value))
}

#[cfg(unix)]
pub use unix::{diagnostics_socket_path, DiagnosticsClient};

#[cfg(unix)]
mod unix {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;

    use log::{debug, info};

    use super::*;
    use crate::nettrace::session::EventPipeSession;

    /// Locate the rendezvous socket the runtime creates for `pid`:
    /// `$TMPDIR/dotnet-diagnostic-<pid>-<disambiguator>-socket`.
    pub fn diagnostics_socket_path(pid: u32) -> Result<PathBuf> {
        let tmp = std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let prefix = format!("dotnet-diagnostic-{pid}-");
        for entry in std::fs::read_dir(&tmp)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with("-socket") {
                return Ok(entry.path());
            }
        }
        Err(EventPipeError::EndpointNotFound { pid })
    }

    /// One connection to a managed process's diagnostics endpoint. The
    /// runtime answers a single command per connection, so each client is
    /// consumed by the command it sends.
    pub struct DiagnosticsClient {
        stream: UnixStream,
        pid: u32,
    }

    impl DiagnosticsClient {
        pub fn connect(pid: u32) -> Result<Self> {
            let path = diagnostics_socket_path(pid)?;
            debug!("connecting to {}", path.display());
            let stream = UnixStream::connect(path)?;
            Ok(DiagnosticsClient { stream, pid })
        }

        /// Start an EventPipe session. On success the connection carries the
        /// Nettrace stream and is handed to the returned session.
        pub fn start_tracing(
            mut self,
            config: &SessionConfig,
        ) -> Result<EventPipeSession<UnixStream>> {
            self.stream.write_all(&collect_tracing_envelope(config))?;
            let session_id = read_response_u64(&mut self.stream)?;
            info!(
                "EventPipe session 0x{session_id:x} started on pid {}",
                self.pid
            );
            Ok(EventPipeSession::new(self.stream, session_id))
        }

        /// Stop a session started on another connection.
        pub fn stop_tracing(mut self, session_id: u64) -> Result<()> {
            self.stream.write_all(&stop_tracing_envelope(session_id))?;
            let echoed = read_response_u64(&mut self.stream)?;
            debug!("session 0x{echoed:x} stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_envelope_layout() {
        let bytes = stop_tracing_envelope(0xAABB_CCDD_1122_3344);
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[..14], IPC_MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[14], bytes[15]]), 28);
        assert_eq!(bytes[16], 0x02); // EventPipe command set
        assert_eq!(bytes[17], 0x01); // StopTracing
        assert_eq!(&bytes[18..20], &[0, 0]);
        assert_eq!(
            u64::from_le_bytes(bytes[20..].try_into().unwrap()),
            0xAABB_CCDD_1122_3344
        );
    }

    #[test]
    fn collect_tracing_envelope_layout() {
        let config = SessionConfig {
            circular_buffer_mb: 64,
            request_rundown: true,
            providers: vec![ProviderConfig {
                name: "P".into(),
                keywords: EventKeyword::EXCEPTION,
                level: EventVerbosityLevel::Warning,
                filter: String::new(),
            }],
        };
        let bytes = collect_tracing_envelope(&config);
        assert_eq!(bytes[17], 0x03); // CollectTracing2
        let payload = &bytes[20..];
        assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), 64);
        assert_eq!(
            u32::from_le_bytes(payload[4..8].try_into().unwrap()),
            NETTRACE_FORMAT
        );
        assert_eq!(payload[8], 1); // rundown requested
        assert_eq!(u32::from_le_bytes(payload[9..13].try_into().unwrap()), 1);
        assert_eq!(
            u64::from_le_bytes(payload[13..21].try_into().unwrap()),
            0x8000
        );
        assert_eq!(u32::from_le_bytes(payload[21..25].try_into().unwrap()), 3);
        // "P\0" in UTF-16, then an empty filter
        assert_eq!(&payload[25..], &[0x50, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            u16::from_le_bytes([bytes[14], bytes[15]]) as usize,
            bytes.len()
        );
    }

    #[test]
    fn error_response_surfaces_the_hresult() {
        let mut response = Vec::new();
        response.extend_from_slice(IPC_MAGIC);
        response.extend_from_slice(&24u16.to_le_bytes());
        response.push(0xFF); // server command set
        response.push(0xFF); // error
        response.extend_from_slice(&[0, 0]);
        response.extend_from_slice(&0x8013_1384u32.to_le_bytes());

        let mut cursor = std::io::Cursor::new(response);
        match read_response_u64(&mut cursor) {
            Err(EventPipeError::CommandRejected { hresult }) => {
                assert_eq!(hresult, 0x8013_1384)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ok_response_yields_the_session_id() {
        let mut response = Vec::new();
        response.extend_from_slice(IPC_MAGIC);
        response.extend_from_slice(&28u16.to_le_bytes());
        response.push(0xFF);
        response.push(0x00); // OK
        response.extend_from_slice(&[0, 0]);
        response.extend_from_slice(&7u64.to_le_bytes());

        let mut cursor = std::io::Cursor::new(response);
        assert_eq!(read_response_u64(&mut cursor).unwrap(), 7);
    }
}
