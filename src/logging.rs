use crate::classifier::StreamEvent;
use crate::main_helper::Args;
use crate::types::{CitelineError, Result, Role};
use std::panic;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_NAME: &str = "citeline.log";

pub fn prepare_log_dir<P: AsRef<Path>>(dir: P) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// File-only logging so the terminal stays free for the conversation.
/// Keep the returned guard alive for the lifetime of the process.
pub fn init_tracing(args: &Args) -> Result<WorkerGuard> {
    let dir = prepare_log_dir(&args.log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "citeline=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (json_layer, text_layer) = if args.log_json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            ),
        )
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
    {
        return Err(CitelineError::Internal(
            format!("Failed to install tracing subscriber: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    Ok(guard)
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

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

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

#[derive(Default, Debug)]
pub struct StreamMetric {
    pub fragments: usize,
    pub deltas: usize,
    pub tool_messages: usize,
    pub citation_updates: usize,
    pub text_chars: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fragment(&mut self) {
        self.fragments += 1;
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageDelta(m) => {
                self.deltas += 1;
                if m.role == Role::Tool || m.context.is_some() {
                    self.tool_messages += 1;
                }
                self.text_chars += m.content.len();
            }
            StreamEvent::CitationUpdate(_) => self.citation_updates += 1,
            StreamEvent::History(_) | StreamEvent::Failure(_) => {}
        }
    }

    pub fn log_summary(&self, turn_id: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] TurnID: {} | Fragments: {} | Deltas: {} | Tool: {} | Citation updates: {} | Text: {} chars",
            turn_id, self.fragments, self.deltas, self.tool_messages, self.citation_updates, self.text_chars
        );
    }
}
