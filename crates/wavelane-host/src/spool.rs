use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use anyhow::Context;
use tracing::{error, info};
use wavelane_core::{EncodeQueue, EncodeReporter, EncodeRequest, persistence::write_atomic};

/// Hands encode requests to an out-of-process encoder by dropping one JSON
/// ticket per request into a spool directory.
#[derive(Debug)]
pub struct SpoolEncodeQueue {
    spool_dir: PathBuf,
    next_ticket: AtomicU64,
}

impl SpoolEncodeQueue {
    #[must_use]
    pub fn new(spool_dir: PathBuf) -> Self {
        Self {
            spool_dir,
            next_ticket: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }
}

fn write_ticket(spool_dir: &Path, ticket: u64, request: &EncodeRequest) -> anyhow::Result<PathBuf> {
    let path = spool_dir.join(format!("{}-{ticket:06}.json", request.document_id));
    let bytes = serde_json::to_vec_pretty(request).context("failed to serialize encode request")?;
    write_atomic(&path, &bytes)
        .with_context(|| format!("failed to write encode ticket: {}", path.display()))?;
    Ok(path)
}

impl EncodeQueue for SpoolEncodeQueue {
    fn submit(&self, request: EncodeRequest, reporter: EncodeReporter) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let spool_dir = self.spool_dir.clone();
        let fallback = reporter.clone();
        let spawned = thread::Builder::new()
            .name("wavelane-encode-spool".to_string())
            .spawn(move || match write_ticket(&spool_dir, ticket, &request) {
                Ok(path) => {
                    info!(ticket, path = %path.display(), "encode ticket spooled");
                    reporter.queued(format!("queued as {}", path.display()));
                }
                Err(error) => reporter.failed(format!("{error:#}")),
            });
        if let Err(error) = spawned {
            error!(?error, "failed to spawn encode spool thread");
            fallback.failed(format!("failed to start encode hand-off: {error}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use wavelane_core::{
        EncodeJob, EncodePreset, EventKind, FileFormat, Session, SessionOptions,
        fixtures::build_demo_session,
    };

    use super::*;

    #[test]
    fn spooled_requests_are_reported_as_queued() {
        let temp = tempfile::tempdir().expect("temp dir");
        let session = Arc::new(Session::new(SessionOptions::default()));
        let demo = build_demo_session(&session).expect("demo");
        let events = session.subscribe();
        let queue = SpoolEncodeQueue::new(temp.path().join("spool"));

        session
            .queue_encode(
                demo.multitrack,
                EncodeJob {
                    track_routing: vec![Some(demo.vocal_track), None],
                    preset: EncodePreset {
                        name: "stems".to_string(),
                        format: FileFormat::Flac,
                    },
                    temporary_files_dir: temp.path().join("work"),
                    output_path: temp.path().join("mix.flac"),
                    range_start: 0,
                    range_length: None,
                },
                &queue,
            )
            .expect("encode should be handed off");

        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("encode event");
        assert!(matches!(event.kind, EventKind::EncodeQueued { .. }));
        assert_eq!(event.document_id, demo.multitrack);

        let tickets: Vec<_> = std::fs::read_dir(queue.spool_dir())
            .expect("spool dir")
            .collect();
        assert_eq!(tickets.len(), 1);
    }
}
