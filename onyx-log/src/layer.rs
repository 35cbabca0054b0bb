//! The console [`Layer`]: colour-coded, timestamped, one lock per line.

use std::{
    fmt::{self, Write as _},
    io::{self, Write},
    sync::Mutex,
};

use time::{OffsetDateTime, macros::format_description};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{Layer, layer::Context};

use crate::severity::{Severity, SeverityFlags, SeverityHandle};

const RESET: &str = "\x1b[0m";

enum Sink {
    /// Error and Fatal to stderr, everything else to stdout.
    Console,
    Writer(Box<dyn Write + Send>),
}

impl Sink {
    fn write_line(&mut self, severity: Severity, line: &str) -> io::Result<()> {
        match self {
            Sink::Console if severity.is_diagnostic() => {
                io::stderr().lock().write_all(line.as_bytes())
            }
            Sink::Console => io::stdout().lock().write_all(line.as_bytes()),
            Sink::Writer(writer) => {
                writer.write_all(line.as_bytes())?;
                writer.flush()
            }
        }
    }
}

/// A [`Layer`] that renders events as `[HH:MM:SS] <tag><message>` lines.
///
/// Events whose [`Severity`] is masked out by the layer's
/// [`SeverityHandle`] are dropped. Formatting and writing happen under a
/// single mutex, so lines from concurrent callers never interleave.
pub struct ConsoleLayer {
    severity: SeverityHandle,
    ansi: bool,
    sink: Mutex<Sink>,
}

impl fmt::Debug for ConsoleLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleLayer")
            .field("severity", &self.severity.get())
            .field("ansi", &self.ansi)
            .finish_non_exhaustive()
    }
}

impl ConsoleLayer {
    /// Writes to stdout/stderr with ANSI colours.
    pub fn new(severity: SeverityFlags) -> Self {
        Self {
            severity: SeverityHandle::new(severity),
            ansi: true,
            sink: Mutex::new(Sink::Console),
        }
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Redirect every line, regardless of severity, into `writer`.
    pub fn to_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.sink = Mutex::new(Sink::Writer(Box::new(writer)));
        self
    }

    pub fn severity_handle(&self) -> SeverityHandle {
        self.severity.clone()
    }

    fn format_line(
        &self,
        severity: Severity,
        event: &Event<'_>,
        fields: &LineFields,
    ) -> String {
        let mut line = String::with_capacity(64 + fields.message.len());
        line.push('[');
        line.push_str(&timestamp());
        line.push_str("] ");
        if self.ansi {
            line.push_str(severity.colour());
        }
        match (severity, fields.prefix.as_deref()) {
            (Severity::Validation, Some(prefix)) => {
                let _ = write!(line, "[{prefix}]\t");
            }
            (Severity::Validation, None) => line.push_str("[Validation]\t"),
            _ => line.push_str(severity.tag()),
        }
        line.push_str(fields.message.trim_end_matches('\n'));
        line.push_str(&fields.rest);

        if severity.is_diagnostic() {
            let metadata = event.metadata();
            let _ = write!(
                line,
                "\nFile: {}\nLine : {}\nModule : {}",
                metadata.file().unwrap_or("<unknown>"),
                metadata
                    .line()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "?".to_owned()),
                metadata.module_path().unwrap_or("<unknown>"),
            );
        }
        if self.ansi {
            line.push_str(RESET);
        }
        line.push('\n');
        line
    }
}

impl<S: Subscriber> Layer<S> for ConsoleLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let severity = Severity::classify(event.metadata());
        if !self.severity.allows(severity) {
            return;
        }

        let mut fields = LineFields::default();
        event.record(&mut fields);

        let mut sink = self.sink.lock().expect("log sink lock poisoned");
        let line = self.format_line(severity, event, &fields);
        // Nowhere left to report a failing log sink.
        let _ = sink.write_line(severity, &line);
    }
}

fn timestamp() -> String {
    let now =
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "??:??:??".to_owned())
}

#[derive(Default)]
struct LineFields {
    message: String,
    prefix: Option<String>,
    rest: String,
}

impl Visit for LineFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "prefix" => self.prefix = Some(value.to_owned()),
            name => {
                let _ = write!(self.rest, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            "prefix" => self.prefix = Some(format!("{value:?}")),
            name => {
                let _ = write!(self.rest, " {name}={value:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::MemoryWriter;

    fn capture(
        flags: SeverityFlags,
    ) -> (tracing::Dispatch, MemoryWriter, SeverityHandle) {
        let out = MemoryWriter::default();
        let layer = ConsoleLayer::new(flags)
            .with_ansi(false)
            .to_writer(out.clone());
        let handle = layer.severity_handle();
        let dispatch =
            tracing::Dispatch::new(tracing_subscriber::registry().with(layer));
        (dispatch, out, handle)
    }

    #[test]
    fn lines_carry_timestamp_and_tag() {
        let (dispatch, out, _) = capture(SeverityFlags::ALL);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("hello {}", 42);
            crate::plain!("bare line");
            crate::success!("it worked");
        });

        let text = out.contents();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let bytes = line.as_bytes();
            assert_eq!(bytes[0], b'[');
            assert_eq!(bytes[3], b':');
            assert_eq!(bytes[6], b':');
            assert_eq!(&line[9..11], "] ");
        }
        assert!(lines[0].ends_with("[Info]\thello 42"));
        assert!(lines[1].ends_with("] bare line"));
        assert!(lines[2].ends_with("[Success]\tit worked"));
    }

    #[test]
    fn mask_filters_channels_and_can_change_at_runtime() {
        let (dispatch, out, handle) =
            capture(SeverityFlags::WARNINGS | SeverityFlags::ERRORS);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::debug!("hidden debug");
            tracing::info!("hidden info");
            tracing::warn!("shown warning");
            crate::validation!("Vulkan", "hidden validation");

            handle.set(SeverityFlags::VALIDATION);
            tracing::warn!("hidden warning");
            crate::validation!("Vulkan", "shown validation");
        });

        let text = out.contents();
        assert!(!text.contains("hidden"));
        assert!(text.contains("[Warning]\tshown warning"));
        assert!(text.contains("[Vulkan]\tshown validation"));
    }

    #[test]
    fn errors_carry_source_attribution() {
        let (dispatch, out, _) = capture(SeverityFlags::ALL);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!("plain error");
            crate::fatal!("cannot continue");
        });

        let text = out.contents();
        assert!(text.contains("[Error]\tplain error\nFile: "));
        assert!(text.contains("[FATAL]\tcannot continue\nFile: "));
        assert_eq!(text.matches("Line : ").count(), 2);
        assert_eq!(text.matches("Module : onyx_log::layer::tests").count(), 2);
    }

    #[test]
    fn extra_fields_follow_the_message() {
        let (dispatch, out, _) = capture(SeverityFlags::ALL);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(frame = 7, kind = "buffer", "created");
        });

        assert!(out.contents().contains("created frame=7 kind=buffer"));
    }

    #[test]
    fn ansi_wraps_line_in_colour_and_reset() {
        let out = MemoryWriter::default();
        let layer = ConsoleLayer::new(SeverityFlags::ALL).to_writer(out.clone());
        let dispatch =
            tracing::Dispatch::new(tracing_subscriber::registry().with(layer));
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!("careful");
        });

        let text = out.contents();
        assert!(text.contains("\x1b[33m[Warning]\tcareful\x1b[0m\n"));
    }

    #[test]
    fn concurrent_callers_never_interleave_lines() {
        const THREADS: usize = 8;
        const LINES: usize = 200;

        let (dispatch, out, _) = capture(SeverityFlags::ALL);
        let dispatch = Arc::new(dispatch);

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let dispatch = Arc::clone(&dispatch);
                thread::spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        for l in 0..LINES {
                            tracing::info!(
                                "thread {t} line {l} {}",
                                "x".repeat(64)
                            );
                        }
                    });
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("logging thread panicked");
        }

        let text = out.contents();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), THREADS * LINES);

        let mut seen = HashSet::new();
        for line in lines {
            let (_, body) =
                line.split_once("[Info]\t").expect("line lost its tag");
            let mut words = body.split(' ');
            assert_eq!(words.next(), Some("thread"));
            let t: usize = words.next().unwrap().parse().unwrap();
            assert_eq!(words.next(), Some("line"));
            let l: usize = words.next().unwrap().parse().unwrap();
            assert_eq!(words.next(), Some("x".repeat(64).as_str()));
            assert_eq!(words.next(), None);
            assert!(seen.insert((t, l)));
        }
        assert_eq!(seen.len(), THREADS * LINES);
    }
}
