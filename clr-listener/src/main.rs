use clap::Parser;

/// Listen to CLR runtime events (GC, exceptions, lock contention) from a
/// running .NET process and print them until ENTER is pressed.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Process id of the target managed process
    #[arg(long)]
    pid: u32,

    /// Circular buffer size handed to the runtime, in megabytes
    #[arg(long, default_value_t = 256)]
    buffer_mb: u32,

    /// Also request rundown events when the session stops
    #[arg(long)]
    rundown: bool,

    /// Subscription verbosity, 1 (critical) to 5 (verbose)
    #[arg(long, default_value_t = 5)]
    level: u32,
}

#[cfg(unix)]
fn main() -> eventpipe::Result<()> {
    use log::{error, info};
    use num_traits::FromPrimitive;

    use eventpipe::coreclr::{EventKeyword, EventVerbosityLevel, KnownEvent};
    use eventpipe::diagnostics::{DiagnosticsClient, ProviderConfig, SessionConfig};
    use eventpipe::{EventRecord, EventSink, TraceInfo};

    #[derive(Default)]
    struct PrintSink {
        events: u64,
    }

    impl EventSink for PrintSink {
        fn on_trace_info(&mut self, info: &TraceInfo) {
            println!(
                "attached: pid {} ({}-bit, {} processors)",
                info.process_id,
                info.pointer_size * 8,
                info.number_of_processors
            );
        }

        fn on_event(&mut self, event: EventRecord) {
            self.events += 1;
            match &event.decoded {
                Some(KnownEvent::ExceptionThrown(ex)) => {
                    println!(
                        "exception on thread {}: {} ({:?})",
                        event.thread_id, ex.exception_type, ex.message
                    );
                    if let Some(stack) = &event.stack {
                        for address in stack.frames.iter_u64() {
                            println!("    0x{address:016x}");
                        }
                    }
                }
                Some(KnownEvent::ContentionStart(_)) => {
                    println!("contention started on thread {}", event.thread_id);
                }
                Some(KnownEvent::ContentionStop(c)) => match c.duration_ns {
                    Some(ns) => println!(
                        "contention ended on thread {} after {:.1} us",
                        event.thread_id,
                        ns / 1_000.0
                    ),
                    None => println!("contention ended on thread {}", event.thread_id),
                },
                None => {
                    println!(
                        "{} / {} ({})",
                        event.provider_name,
                        event.event_id,
                        event.event_name.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }

    env_logger::init();
    let args = Args::parse();

    let level = EventVerbosityLevel::from_u32(args.level).unwrap_or(EventVerbosityLevel::Verbose);
    let config = SessionConfig {
        circular_buffer_mb: args.buffer_mb,
        request_rundown: args.rundown,
        providers: vec![ProviderConfig::runtime(
            EventKeyword::GC | EventKeyword::EXCEPTION | EventKeyword::CONTENTION,
            level,
        )],
    };

    let client = DiagnosticsClient::connect(args.pid)?;
    let mut session = client.start_tracing(&config)?;
    let session_id = session.session_id();
    let stop = session.stop_handle();

    let decoder = std::thread::spawn(move || {
        let mut sink = PrintSink::default();
        let result = session.listen(&mut sink);
        (result, sink.events)
    });

    println!("Press ENTER to stop listening to events...");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    stop.stop();
    // the stop command needs its own connection; the first one carries the
    // inbound event stream
    DiagnosticsClient::connect(args.pid)?.stop_tracing(session_id)?;

    match decoder.join() {
        Ok((Ok(reason), events)) => info!("session ended ({reason:?}) after {events} events"),
        Ok((Err(err), events)) => error!("decoding failed after {events} events: {err}"),
        Err(_) => error!("decoder thread panicked"),
    }
    Ok(())
}

#[cfg(not(unix))]
fn main() {
    let _ = Args::parse();
    eprintln!("clr-listener needs the Unix diagnostics socket transport");
    std::process::exit(1);
}
