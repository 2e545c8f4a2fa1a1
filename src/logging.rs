use crate::redaction::RedactingWriter;
use crate::types::ProviderId;
use std::panic;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

pub const LOG_FILE_NAME: &str = "patchflow.log";

/// Installs the global subscriber: env filter, redacted stderr output, an optional
/// daily-rolling file, and span traces for `ObservedError`. Keep the returned
/// guard alive for the life of the process so buffered lines get flushed.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "patchflow=info".into(),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(|| RedactingWriter::new(std::io::stderr()));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log directory {}: {}", dir.display(), e);
            }
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(move || RedactingWriter::new(non_blocking.clone()));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
    {
        eprintln!("Tracing already initialized: {}", e);
    }

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per gateway call counters, logged once when the stream ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub attempts: usize,
    pub text_events: usize,
    pub text_chars: usize,
    pub rate_limit_events: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_text(&mut self, content: &str) {
        self.text_events += 1;
        self.text_chars += content.chars().count();
    }

    pub fn record_rate_limit(&mut self) {
        self.rate_limit_events += 1;
    }

    pub fn log_summary(&self, provider: ProviderId, model_id: &str, outcome: &str, elapsed: Duration) {
        info!(
            "[STREAM END] {}/{} | Outcome: {} | Attempts: {} | Text: {} events, {} chars | RateLimit: {} | {:.2}s",
            provider,
            model_id,
            outcome,
            self.attempts,
            self.text_events,
            self.text_chars,
            self.rate_limit_events,
            elapsed.as_secs_f64()
        );
    }
}
