use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::thread;

use ansi_term::Colour;
use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Environment variable that overrides the configured log level.
pub const LOG_ENV: &str = "FAAS_LOG";

/// One-letter severity and its terminal colour.
fn severity(level: &Level) -> (char, Colour) {
    match *level {
        Level::TRACE => ('T', Colour::Purple),
        Level::DEBUG => ('D', Colour::Blue),
        Level::INFO => ('I', Colour::Green),
        Level::WARN => ('W', Colour::Yellow),
        Level::ERROR => ('E', Colour::Red),
    }
}

/// Writes `I1017 12:34:56.789012 io-worker-0 connection.rs:42] message`.
struct FaasFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for FaasFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let (letter, colour) = severity(metadata.level());
        let stamp = Local::now().format("%m%d %H:%M:%S%.6f");
        if self.ansi && writer.has_ansi_escapes() {
            write!(writer, "{}{}", colour.paint(letter.to_string()), stamp)?;
        } else {
            write!(writer, "{}{}", letter, stamp)?;
        }

        let thread = thread::current();
        let file = metadata
            .file()
            .and_then(|f| Path::new(f).file_name())
            .and_then(OsStr::to_str)
            .unwrap_or("<unknown>");
        write!(
            writer,
            " {:<8.8} {}:{}] ",
            thread.name().unwrap_or("-"),
            file,
            metadata.line().unwrap_or(0)
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber.
///
/// Events at `default_log_level` (or whatever `FAAS_LOG` says) go to stderr.
/// When `log_file` is set, the same events are also appended to that file
/// through a non-blocking writer; the returned guard must be kept alive for
/// the file output to be flushed.
pub fn init_log(
    default_log_level: &str,
    log_file: Option<&Path>,
    ansi: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let make_filter = || {
        EnvFilter::builder()
            .with_default_directive(
                default_log_level
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            )
            .with_env_var(LOG_ENV)
            .from_env_lossy()
    };

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(FaasFormatter { ansi })
        .with_filter(make_filter());

    let registry = tracing_subscriber::registry().with(log_fmt_layer);

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| OsStr::new("gateway.log"));
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(FaasFormatter { ansi: false })
                .with_writer(non_blocking)
                .with_filter(make_filter());
            registry.with(file_layer).init();
            tracing::info!("tracing-log initialized, also writing to {}", path.display());
            Some(guard)
        }
        None => {
            registry.init();
            tracing::info!("tracing-log initialized");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn prefix_has_severity_thread_and_file() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(FaasFormatter { ansi: false })
            .with_writer(move || writer.clone())
            .finish();
        thread::Builder::new()
            .name("log-test".to_owned())
            .spawn(move || {
                tracing::subscriber::with_default(subscriber, || tracing::warn!("disk {} full", 3))
            })
            .unwrap()
            .join()
            .unwrap();

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(out.starts_with('W'), "{}", out);
        assert!(out.contains(" log-test logging.rs:"), "{}", out);
        assert!(out.ends_with("] disk 3 full\n"), "{}", out);
    }
}
