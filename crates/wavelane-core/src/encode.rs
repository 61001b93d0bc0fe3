use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    channel::ChannelLayout,
    events::EventKind,
    export,
    format::{FileFormat, SampleEncoding, SampleFormat},
    model::{DocumentId, DocumentKind, TrackId},
    persistence::{self, SessionFile},
    session::{Session, SessionError},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodePreset {
    pub name: String,
    pub format: FileFormat,
}

/// What the caller asks to have encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodeJob {
    /// One entry per output channel group; `None` leaves it unassigned. An
    /// empty routing encodes the master mix.
    pub track_routing: Vec<Option<TrackId>>,
    pub preset: EncodePreset,
    pub temporary_files_dir: PathBuf,
    pub output_path: PathBuf,
    pub range_start: u64,
    /// Up to the end of the session when unset.
    pub range_length: Option<u64>,
}

/// What the encode service receives once intermediates are on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodeRequest {
    pub document_id: DocumentId,
    pub track_routing: Vec<Option<TrackId>>,
    pub preset: EncodePreset,
    pub temporary_files_dir: PathBuf,
    pub output_path: PathBuf,
    pub range: (u64, u64),
    /// Rendered audio per routing entry, aligned with `track_routing`.
    pub intermediate_files: Vec<Option<PathBuf>>,
    pub project_file: PathBuf,
}

/// Publishes the progress of a handed-off encode onto the session's events.
#[derive(Debug, Clone)]
pub struct EncodeReporter {
    session: Arc<Session>,
    document_id: DocumentId,
    output_path: String,
}

impl EncodeReporter {
    pub fn queued(&self, message: impl Into<String>) {
        let message = message.into();
        info!(document_id = %self.document_id, %message, "encode queued");
        self.session.events().publish(
            self.document_id,
            self.output_path.clone(),
            EventKind::EncodeQueued { message },
        );
    }

    pub fn failed(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(document_id = %self.document_id, %message, "encode failed");
        self.session.events().publish(
            self.document_id,
            self.output_path.clone(),
            EventKind::EncodeFailed { message },
        );
    }
}

/// External encoding service. Implementations report back through the
/// reporter, typically from another thread.
pub trait EncodeQueue: Send + Sync {
    fn submit(&self, request: EncodeRequest, reporter: EncodeReporter);
}

fn write_intermediate(
    path: &Path,
    sample_rate: u32,
    layout: ChannelLayout,
    samples: &[f32],
) -> Result<(), SessionError> {
    let format = SampleFormat::new(sample_rate, SampleEncoding::F32, layout)?;
    export::write_wav(path, &format, samples, &mut |_| {})?;
    Ok(())
}

impl Session {
    /// Renders intermediates for `job` and hands them to `queue`. The outcome
    /// of the encode itself only arrives as events.
    #[instrument(skip(self, job, queue), fields(document_id = %id, output = %job.output_path.display(), routed = job.track_routing.len()))]
    pub fn queue_encode(
        self: &Arc<Self>,
        id: DocumentId,
        job: EncodeJob,
        queue: &dyn EncodeQueue,
    ) -> Result<(), SessionError> {
        let document = self.document(id)?;
        let Some(multitrack) = document.multitrack() else {
            return Err(SessionError::WrongDocumentKind {
                expected: DocumentKind::Multitrack,
                actual: document.kind(),
            });
        };
        for track_id in job.track_routing.iter().flatten() {
            if multitrack.track(*track_id).is_none() {
                return Err(SessionError::StaleReference(format!("track {track_id}")));
            }
        }
        let master = multitrack
            .master()
            .ok_or_else(|| SessionError::StaleReference("master track".to_string()))?;

        let duration = multitrack.duration();
        let range_length = job
            .range_length
            .unwrap_or_else(|| duration.saturating_sub(job.range_start));
        if job.track_routing.is_empty() {
            export::render_len(range_length, master.channel_count())?;
        }
        for track in job
            .track_routing
            .iter()
            .flatten()
            .filter_map(|track_id| multitrack.track(*track_id))
        {
            export::render_len(range_length, track.channel_count())?;
        }

        fs::create_dir_all(&job.temporary_files_dir)
            .with_context(|| {
                format!(
                    "failed to create encode temp directory: {}",
                    job.temporary_files_dir.display()
                )
            })
            .map_err(SessionError::from)?;

        let sources = self.source_audio(id, &multitrack.tracks);
        let mut intermediate_files = Vec::with_capacity(job.track_routing.len().max(1));
        if job.track_routing.is_empty() {
            let mix = export::render_mixdown(
                &multitrack.tracks,
                multitrack.sample_rate,
                master.channel_count(),
                job.range_start,
                range_length,
                &sources,
            )?;
            let path = job.temporary_files_dir.join("master.wav");
            write_intermediate(
                &path,
                multitrack.sample_rate,
                master.format.layout.clone(),
                &mix,
            )?;
            intermediate_files.push(Some(path));
        } else {
            for entry in &job.track_routing {
                let Some(track) = entry.and_then(|track_id| multitrack.track(track_id)) else {
                    intermediate_files.push(None);
                    continue;
                };
                let rendered = export::render_track(
                    track,
                    multitrack.sample_rate,
                    job.range_start,
                    range_length,
                    &sources,
                )?;
                let path = job
                    .temporary_files_dir
                    .join(format!("track-{}.wav", track.id));
                write_intermediate(
                    &path,
                    multitrack.sample_rate,
                    track.format.layout.clone(),
                    &rendered,
                )?;
                intermediate_files.push(Some(path));
            }
        }

        let stem = job
            .output_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("encode");
        let project_file = persistence::template_path(&job.temporary_files_dir, stem);
        persistence::save_session(&project_file, &SessionFile::from_document(&document)?)?;

        let request = EncodeRequest {
            document_id: id,
            track_routing: job.track_routing,
            preset: job.preset,
            temporary_files_dir: job.temporary_files_dir,
            output_path: job.output_path,
            range: (job.range_start, range_length),
            intermediate_files,
            project_file,
        };
        let reporter = EncodeReporter {
            session: Arc::clone(self),
            document_id: id,
            output_path: request.output_path.display().to_string(),
        };
        info!(files = request.intermediate_files.len(), "encode request handed off");
        queue.submit(request, reporter);
        Ok(())
    }
}
