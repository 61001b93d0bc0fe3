use std::{fs, path::Path, thread};

use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::events::{Event, EventKind};

pub const DEFAULT_LOG_FILTER: &str = "info,wavelane_core=trace,wavelane_host=trace";
pub const DEFAULT_LOG_PREFIX: &str = "wavelane";

/// Keeps the file writer flushing until dropped.
pub struct TelemetryGuard {
    pub session_id: Uuid,
    _file_guard: WorkerGuard,
}

pub fn init_tracing(log_dir: impl AsRef<Path>) -> anyhow::Result<TelemetryGuard> {
    init_tracing_with_options(log_dir, DEFAULT_LOG_PREFIX, DEFAULT_LOG_FILTER)
}

/// Compact output on stdout plus a JSON log file per run in `log_dir`.
/// `RUST_LOG` overrides `default_filter`.
pub fn init_tracing_with_options(
    log_dir: impl AsRef<Path>,
    file_prefix: &str,
    default_filter: &str,
) -> anyhow::Result<TelemetryGuard> {
    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let session_id = Uuid::new_v4();
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let file_appender =
        tracing_appender::rolling::never(log_dir, format!("{file_prefix}-{timestamp}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_thread_ids(true)
        .with_target(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer);

    if let Err(error) = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        warn!(?error, "global tracing subscriber already initialized");
    } else {
        info!(%session_id, "tracing initialized");
    }

    Ok(TelemetryGuard {
        session_id,
        _file_guard: file_guard,
    })
}

/// Logs every session event until the bus drops the receiver's sender side.
pub fn spawn_event_logger(events: Receiver<Event>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("wavelane-event-log".to_string())
        .spawn(move || {
            for event in events {
                match &event.kind {
                    EventKind::OperationFailed { operation, result } => warn!(
                        sequence = event.sequence,
                        document_id = %event.document_id,
                        %operation,
                        flags = ?result.flags(),
                        "document operation failed"
                    ),
                    EventKind::EncodeFailed { message } => warn!(
                        sequence = event.sequence,
                        document_id = %event.document_id,
                        %message,
                        "encode failed"
                    ),
                    kind => debug!(
                        sequence = event.sequence,
                        document_id = %event.document_id,
                        path = %event.path,
                        event = kind.name(),
                        "session event"
                    ),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::EventBus, model::DocumentId};

    #[test]
    fn event_logger_stops_with_the_bus() {
        let bus = EventBus::new();
        let logger = spawn_event_logger(bus.subscribe()).expect("spawn logger");
        bus.publish(DocumentId::new(), "", EventKind::Saved);
        bus.publish(DocumentId::new(), "", EventKind::Closed);
        drop(bus);
        logger.join().expect("logger exits once the bus is gone");
    }
}
