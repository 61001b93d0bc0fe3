use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    audio::{self, Sidecar},
    convert::SampleTypeConversion,
    destination::{self, is_file_read_only, is_folder_read_only, is_valid_filename},
    events::EventKind,
    export,
    format::{FileFormat, SampleEncoding, SampleFormat},
    model::{Document, DocumentBody, DocumentId, DocumentKind, OperationKind},
    persistence::{self, SessionFile},
    session::{ReferencedAudio, Session, SessionError, SourceInfo, same_path},
    time::rescale_frames,
};

/// Outcome of a save or export. Every flag names one failed precondition;
/// `error` is set whenever any other flag is.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveResult {
    pub error: bool,
    pub missing_path: bool,
    pub file_read_only: bool,
    pub folder_read_only: bool,
    pub invalid_filename: bool,
    pub invalid_filename_ext: bool,
    pub open_document: bool,
    pub invalid_sample_type: bool,
    pub sub_document: bool,
    pub template_exists: bool,
    pub internal: bool,
}

impl SaveResult {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn internal_failure() -> Self {
        Self {
            error: true,
            internal: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.error
    }

    fn sealed(mut self) -> Self {
        self.error = self.missing_path
            || self.file_read_only
            || self.folder_read_only
            || self.invalid_filename
            || self.invalid_filename_ext
            || self.open_document
            || self.invalid_sample_type
            || self.sub_document
            || self.template_exists
            || self.internal;
        self
    }

    /// Names of the raised flags, for logs and UIs.
    #[must_use]
    pub fn flags(&self) -> Vec<&'static str> {
        [
            (self.missing_path, "missing_path"),
            (self.file_read_only, "file_read_only"),
            (self.folder_read_only, "folder_read_only"),
            (self.invalid_filename, "invalid_filename"),
            (self.invalid_filename_ext, "invalid_filename_ext"),
            (self.open_document, "open_document"),
            (self.invalid_sample_type, "invalid_sample_type"),
            (self.sub_document, "sub_document"),
            (self.template_exists, "template_exists"),
            (self.internal, "internal"),
        ]
        .into_iter()
        .filter_map(|(raised, name)| raised.then_some(name))
        .collect()
    }
}

/// Trimming applied to copied referenced audio.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrimParameters {
    /// Samples, at the session rate, kept past the end of the longest clip
    /// reading the source.
    pub handle_length: u64,
}

/// Re-encoding applied to copied referenced audio.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReferencedExportParameters {
    /// Each source keeps its own container when unset.
    pub file_format: Option<FileFormat>,
    pub conversion: Option<SampleTypeConversion>,
    pub include_metadata: bool,
}

/// How referenced documents land next to a session written with
/// `copy_referenced_documents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReferencedCopyParameters {
    pub overwrite_files: bool,
    /// Also copies referenced files that are not audio.
    pub include_video: bool,
    pub trim: Option<TrimParameters>,
    pub export: Option<ReferencedExportParameters>,
}

impl ReferencedCopyParameters {
    fn reencodes(&self) -> bool {
        self.trim.is_some() || self.export.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SaveParameters {
    pub copy_referenced_documents: bool,
    pub referenced: ReferencedCopyParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SaveAsParameters {
    /// Inferred from the extension, then from the document, when unset.
    pub file_format: Option<FileFormat>,
    pub include_metadata: bool,
    pub conversion: Option<SampleTypeConversion>,
    pub copy_referenced_documents: bool,
    pub referenced: ReferencedCopyParameters,
}

impl Default for SaveAsParameters {
    fn default() -> Self {
        Self {
            file_format: None,
            include_metadata: true,
            conversion: None,
            copy_referenced_documents: false,
            referenced: ReferencedCopyParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportParameters {
    pub file_format: Option<FileFormat>,
    pub include_metadata: bool,
    pub conversion: Option<SampleTypeConversion>,
    pub copy_referenced_documents: bool,
    pub referenced: ReferencedCopyParameters,
}

impl Default for ExportParameters {
    fn default() -> Self {
        Self {
            file_format: None,
            include_metadata: true,
            conversion: None,
            copy_referenced_documents: false,
            referenced: ReferencedCopyParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TemplateParameters {
    pub include_metadata: bool,
    pub overwrite: bool,
}

/// Handle on a running save or export.
#[derive(Debug)]
pub struct OperationTicket {
    document_id: DocumentId,
    operation: OperationKind,
    receiver: Receiver<SaveResult>,
    resolved: OnceLock<SaveResult>,
}

impl OperationTicket {
    fn pending(document_id: DocumentId, operation: OperationKind) -> (Self, Sender<SaveResult>) {
        let (sender, receiver) = bounded(1);
        let ticket = Self {
            document_id,
            operation,
            receiver,
            resolved: OnceLock::new(),
        };
        (ticket, sender)
    }

    fn ready(document_id: DocumentId, operation: OperationKind, result: SaveResult) -> Self {
        let (ticket, _) = Self::pending(document_id, operation);
        let _ = ticket.resolved.set(result);
        ticket
    }

    #[must_use]
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    #[must_use]
    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    fn settle(&self, result: SaveResult) -> SaveResult {
        *self.resolved.get_or_init(|| result)
    }

    /// The result if the operation has finished.
    #[must_use]
    pub fn try_result(&self) -> Option<SaveResult> {
        if let Some(result) = self.resolved.get() {
            return Some(*result);
        }
        match self.receiver.try_recv() {
            Ok(result) => Some(self.settle(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(self.settle(SaveResult::internal_failure())),
        }
    }

    /// Blocks until the operation finishes.
    #[must_use]
    pub fn wait(&self) -> SaveResult {
        if let Some(result) = self.resolved.get() {
            return *result;
        }
        let result = self
            .receiver
            .recv()
            .unwrap_or_else(|_| SaveResult::internal_failure());
        self.settle(result)
    }

    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SaveResult> {
        if let Some(result) = self.resolved.get() {
            return Some(*result);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(self.settle(result)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.settle(SaveResult::internal_failure())),
        }
    }
}

#[derive(Debug, Clone)]
enum Request {
    Save(SaveParameters),
    SaveAs(PathBuf, SaveAsParameters),
    Export(PathBuf, ExportParameters),
    Template(String, TemplateParameters),
}

impl Request {
    fn operation(&self) -> OperationKind {
        match self {
            Self::Save(_) => OperationKind::Save,
            Self::SaveAs(..) => OperationKind::SaveAs,
            Self::Export(..) => OperationKind::Export,
            Self::Template(..) => OperationKind::ExportTemplate,
        }
    }
}

/// A validated write, carried to the worker thread.
#[derive(Debug, Clone)]
struct WritePlan {
    operation: OperationKind,
    destination: PathBuf,
    file_format: FileFormat,
    conversion: Option<SampleTypeConversion>,
    include_metadata: bool,
    copy_referenced: Option<ReferencedCopyParameters>,
}

/// Audio the worker converted while writing, adopted by the document after a
/// successful save-as.
type Converted = Option<(SampleFormat, Vec<f32>)>;

fn default_format(document: &Document) -> FileFormat {
    match &document.body {
        DocumentBody::Waveform(waveform) => waveform.file_format,
        DocumentBody::Multitrack(_) | DocumentBody::Compound(_) => FileFormat::Session,
    }
}

/// Native format of what would be written: the waveform itself, or a float
/// mixdown at the master layout for a multitrack.
fn source_format(document: &Document) -> Option<SampleFormat> {
    match &document.body {
        DocumentBody::Waveform(waveform) => Some(waveform.format.clone()),
        DocumentBody::Multitrack(multitrack) => multitrack.master().and_then(|master| {
            SampleFormat::new(
                multitrack.sample_rate,
                SampleEncoding::F32,
                master.format.layout.clone(),
            )
            .ok()
        }),
        DocumentBody::Compound(_) => None,
    }
}

fn representable(
    document: &Document,
    file_format: FileFormat,
    conversion: Option<&SampleTypeConversion>,
) -> bool {
    if file_format == FileFormat::Session {
        return document.kind() == DocumentKind::Multitrack;
    }
    let Some(source) = source_format(document) else {
        return false;
    };
    let target = match conversion {
        Some(conversion) => match conversion.resolve(&source) {
            Ok(target) => target,
            Err(_) => return false,
        },
        None => source,
    };
    file_format.supports(&target)
}

fn kind_accepts(kind: DocumentKind, file_format: FileFormat) -> bool {
    match kind {
        DocumentKind::Multitrack => file_format == FileFormat::Session,
        DocumentKind::Waveform => file_format.is_audio(),
        DocumentKind::Compound => false,
    }
}

impl Session {
    /// Saves the document at its current path.
    pub fn save(
        self: &Arc<Self>,
        id: DocumentId,
        parameters: SaveParameters,
    ) -> Result<OperationTicket, SessionError> {
        self.start(id, Request::Save(parameters))
    }

    /// Saves the document at a new path, which it adopts on success.
    pub fn save_as(
        self: &Arc<Self>,
        id: DocumentId,
        path: impl Into<PathBuf>,
        parameters: SaveAsParameters,
    ) -> Result<OperationTicket, SessionError> {
        self.start(id, Request::SaveAs(path.into(), parameters))
    }

    /// Writes a copy of the document without touching its path or dirty flag.
    /// Multitrack documents exported to an audio format are mixed down.
    pub fn export(
        self: &Arc<Self>,
        id: DocumentId,
        path: impl Into<PathBuf>,
        parameters: ExportParameters,
    ) -> Result<OperationTicket, SessionError> {
        self.start(id, Request::Export(path.into(), parameters))
    }

    pub fn export_as_template(
        self: &Arc<Self>,
        id: DocumentId,
        name: impl Into<String>,
        parameters: TemplateParameters,
    ) -> Result<OperationTicket, SessionError> {
        self.start(id, Request::Template(name.into(), parameters))
    }

    /// Names of the stored multitrack templates.
    pub fn list_templates(&self) -> Result<Vec<String>, SessionError> {
        Ok(persistence::list_templates(&self.options.template_dir)?)
    }

    #[instrument(skip(self, request), fields(document_id = %id, operation = %request.operation()))]
    fn start(self: &Arc<Self>, id: DocumentId, request: Request) -> Result<OperationTicket, SessionError> {
        let operation = request.operation();
        let snapshot = {
            let handle = self.handle(id)?;
            let mut document = handle.write();
            self.ensure_open(id)?;
            let kind = document.kind();
            if kind == DocumentKind::Compound
                || (operation == OperationKind::ExportTemplate && kind != DocumentKind::Multitrack)
            {
                return Err(SessionError::WrongDocumentKind {
                    expected: DocumentKind::Multitrack,
                    actual: kind,
                });
            }
            if document.is_busy() {
                return Err(SessionError::OperationInProgress(id));
            }
            document.in_flight = Some(operation);
            document.clone()
        };

        let plan = match self.validate(&snapshot, &request) {
            Ok(plan) => plan,
            Err(result) => {
                warn!(flags = ?result.flags(), "save validation failed");
                self.finish(id, operation, None, result, None);
                return Ok(OperationTicket::ready(id, operation, result));
            }
        };

        let (ticket, sender) = OperationTicket::pending(id, operation);
        let session = Arc::clone(self);
        let worker_plan = plan.clone();
        let spawned = thread::Builder::new()
            .name(format!("wavelane-{operation}"))
            .spawn(move || {
                let written = panic::catch_unwind(AssertUnwindSafe(|| {
                    session.write(&snapshot, &worker_plan)
                }));
                let (result, converted) = match written {
                    Ok(Ok(converted)) => (SaveResult::success(), converted),
                    Ok(Err(error)) => {
                        error!(document_id = %id, ?error, "write failed");
                        (SaveResult::internal_failure(), None)
                    }
                    Err(_) => {
                        error!(document_id = %id, "write panicked");
                        (SaveResult::internal_failure(), None)
                    }
                };
                session.finish(id, operation, Some(&worker_plan), result, converted);
                let _ = sender.send(result);
            });

        if let Err(spawn_error) = spawned {
            error!(%spawn_error, "failed to spawn save worker");
            let result = SaveResult::internal_failure();
            self.finish(id, operation, Some(&plan), result, None);
            return Ok(OperationTicket::ready(id, operation, result));
        }
        Ok(ticket)
    }

    fn collides_with_open_document(&self, id: DocumentId, path: &Path, allow_own: bool) -> bool {
        if self
            .open_paths_except(id)
            .iter()
            .any(|other| same_path(other, path))
        {
            return true;
        }
        !allow_own
            && self
                .read(id, |document| {
                    Ok(document
                        .path
                        .as_deref()
                        .is_some_and(|own| same_path(own, path)))
                })
                .unwrap_or(false)
    }

    /// Runs the fixed precondition sequence. Flags accumulate; a malformed
    /// filename skips the checks that need a usable path, and so does a plain
    /// save without one, though it still reports a sub-document.
    fn validate(&self, document: &Document, request: &Request) -> Result<WritePlan, SaveResult> {
        let mut result = SaveResult::default();
        let operation = request.operation();
        let max_path_len = self.options.max_path_len;

        let (destination, file_format, conversion, include_metadata, copy_referenced) = match request {
            Request::Save(parameters) => {
                // 7
                let Some(path) = document.path.clone() else {
                    result.missing_path = true;
                    result.sub_document = document.is_compound_sub_document();
                    return Err(result.sealed());
                };
                (
                    path,
                    default_format(document),
                    None,
                    true,
                    parameters
                        .copy_referenced_documents
                        .then(|| parameters.referenced.clone()),
                )
            }
            Request::SaveAs(path, parameters) => (
                path.clone(),
                parameters
                    .file_format
                    .or_else(|| FileFormat::from_path(path))
                    .unwrap_or_else(|| default_format(document)),
                parameters.conversion.clone(),
                parameters.include_metadata,
                parameters
                    .copy_referenced_documents
                    .then(|| parameters.referenced.clone()),
            ),
            Request::Export(path, parameters) => {
                let file_format = parameters
                    .file_format
                    .or_else(|| FileFormat::from_path(path))
                    .unwrap_or_else(|| default_format(document));
                (
                    destination::with_format_extension(path, file_format),
                    file_format,
                    parameters.conversion.clone(),
                    parameters.include_metadata,
                    parameters
                        .copy_referenced_documents
                        .then(|| parameters.referenced.clone()),
                )
            }
            Request::Template(name, parameters) => {
                if name.trim().is_empty() || name.contains(['/', '\\']) {
                    result.invalid_filename = true;
                }
                (
                    persistence::template_path(&self.options.template_dir, name),
                    FileFormat::Session,
                    None,
                    parameters.include_metadata,
                    None,
                )
            }
        };

        // 1
        if !is_valid_filename(&destination, max_path_len) {
            result.invalid_filename = true;
        }

        if !result.invalid_filename {
            // 2
            let allow_own = operation == OperationKind::Save;
            if self.collides_with_open_document(document.id, &destination, allow_own) {
                result.open_document = true;
            }
            // 3
            if matches!(operation, OperationKind::Save | OperationKind::SaveAs)
                && (!file_format.accepts_extension(&destination)
                    || !kind_accepts(document.kind(), file_format))
            {
                result.invalid_filename_ext = true;
            }
            // 4
            if is_file_read_only(&destination) {
                result.file_read_only = true;
            }
            // 5
            if is_folder_read_only(&destination) {
                result.folder_read_only = true;
            }
            // 6
            let checks_format = !result.invalid_filename_ext
                || operation == OperationKind::Export;
            if checks_format && !representable(document, file_format, conversion.as_ref()) {
                result.invalid_sample_type = true;
            }
            if let Some(referenced) = &copy_referenced {
                if !self.referenced_exports_representable(document, referenced) {
                    result.invalid_sample_type = true;
                }
            }
        }
        // 8
        if operation == OperationKind::Save && document.is_compound_sub_document() {
            result.sub_document = true;
        }
        // 9
        if let Request::Template(_, parameters) = request {
            if !parameters.overwrite && destination.exists() {
                result.template_exists = true;
            }
        }

        let result = result.sealed();
        if result.error {
            return Err(result);
        }
        Ok(WritePlan {
            operation,
            destination,
            file_format,
            conversion,
            include_metadata,
            copy_referenced,
        })
    }

    /// Whether every referenced source can be re-encoded as requested.
    fn referenced_exports_representable(
        &self,
        document: &Document,
        parameters: &ReferencedCopyParameters,
    ) -> bool {
        let (Some(export), Some(multitrack)) = (&parameters.export, document.multitrack()) else {
            return true;
        };
        multitrack.clips().all(|(_, clip)| {
            let Some(source) = self.referenced_audio(document.id, &clip.source) else {
                return true;
            };
            let target = match &export.conversion {
                Some(conversion) => match conversion.resolve(&source.format) {
                    Ok(target) => target,
                    Err(_) => return false,
                },
                None => source.format,
            };
            let file_format = export.file_format.unwrap_or(source.file_format);
            file_format.is_audio() && file_format.supports(&target)
        })
    }

    fn report_progress(&self, id: DocumentId, progress: Option<u8>) {
        let Ok(handle) = self.handle(id) else {
            return;
        };
        let mut document = handle.write();
        let DocumentBody::Waveform(waveform) = &mut document.body else {
            return;
        };
        if waveform.busy_progress == progress {
            return;
        }
        waveform.busy_progress = progress;
        self.emit(
            &document,
            EventKind::BusyChanged {
                busy: progress.is_some(),
                progress,
            },
        );
    }

    #[instrument(skip(self, document, plan), fields(document_id = %document.id, path = %plan.destination.display(), format = %plan.file_format.id()))]
    fn write(&self, document: &Document, plan: &WritePlan) -> Result<Converted> {
        match &document.body {
            DocumentBody::Multitrack(multitrack) if plan.file_format == FileFormat::Session => {
                let mut session_file = SessionFile::from_document(document)?;
                // Sources saved after their clips were added are found again by path.
                for clip in session_file
                    .tracks
                    .iter_mut()
                    .flat_map(|track| track.clips.iter_mut())
                {
                    if let Ok(SourceInfo { path: Some(path), .. }) =
                        self.resolve_source_ref(document.id, &clip.source)
                    {
                        clip.source.path = Some(path);
                    }
                }
                match plan.operation {
                    OperationKind::ExportTemplate => {
                        session_file.strip_for_template(plan.include_metadata);
                    }
                    _ if !plan.include_metadata => session_file.metadata.clear(),
                    _ => {}
                }
                if let Some(referenced) = &plan.copy_referenced {
                    self.copy_referenced_sources(
                        document.id,
                        multitrack.sample_rate,
                        &mut session_file,
                        &plan.destination,
                        referenced,
                    )?;
                }
                persistence::save_session(&plan.destination, &session_file)?;
                info!(tracks = multitrack.tracks.len(), "session written");
                Ok(None)
            }
            DocumentBody::Multitrack(multitrack) => {
                let format = source_format(document)
                    .ok_or_else(|| anyhow::anyhow!("session has no master track"))?;
                let sources = self.source_audio(document.id, &multitrack.tracks);
                let mix = export::render_mixdown(
                    &multitrack.tracks,
                    multitrack.sample_rate,
                    format.channel_count(),
                    0,
                    multitrack.duration(),
                    &sources,
                )?;
                self.write_audio_payload(document, plan, &format, &mix)?;
                Ok(None)
            }
            DocumentBody::Waveform(waveform) => {
                let converted = self.write_audio_payload(document, plan, &waveform.format, &waveform.samples)?;
                Ok(converted)
            }
            DocumentBody::Compound(_) => Err(anyhow::anyhow!("compound documents are not written")),
        }
    }

    /// Copies or re-encodes every clip source into the session's
    /// `<stem>_files` folder and points the written clips at the copies.
    /// Returns the number of files written.
    #[instrument(skip(self, session_file, parameters), fields(path = %session_path.display(), reencode = parameters.reencodes()))]
    fn copy_referenced_sources(
        &self,
        owner: DocumentId,
        session_rate: u32,
        session_file: &mut SessionFile,
        session_path: &Path,
        parameters: &ReferencedCopyParameters,
    ) -> Result<usize> {
        let directory = persistence::referenced_files_dir(session_path);
        let mut longest_clip: HashMap<PathBuf, u64> = HashMap::new();
        for clip in session_file.tracks.iter().flat_map(|track| track.clips.iter()) {
            if let Some(path) = &clip.source.path {
                let longest = longest_clip.entry(path.clone()).or_default();
                *longest = (*longest).max(clip.duration);
            }
        }

        let mut copies: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut written = 0;
        for clip in session_file
            .tracks
            .iter_mut()
            .flat_map(|track| track.clips.iter_mut())
        {
            let Some(source_path) = clip.source.path.clone() else {
                continue;
            };
            if let Some(copy) = copies.get(&source_path) {
                clip.source.path = Some(copy.clone());
                continue;
            }
            let is_audio = FileFormat::from_path(&source_path).is_some_and(FileFormat::is_audio);
            if !is_audio && !parameters.include_video {
                debug!(source = %source_path.display(), "non-audio reference left in place");
                continue;
            }

            let copy = if is_audio && parameters.reencodes() {
                let Some(source) = self.referenced_audio(owner, &clip.source) else {
                    warn!(source = %source_path.display(), "referenced audio not open, not copied");
                    continue;
                };
                let keep = parameters.trim.map(|trim| {
                    let frames = longest_clip
                        .get(&source_path)
                        .copied()
                        .unwrap_or_default()
                        .saturating_add(trim.handle_length);
                    rescale_frames(frames, session_rate, source.format.sample_rate())
                });
                self.write_referenced_audio(&source_path, &source, keep, &directory, parameters)?
            } else {
                persistence::copy_referenced_file(&source_path, &directory, parameters.overwrite_files)?
            };
            let Some((copy, fresh)) = copy else {
                continue;
            };
            written += usize::from(fresh);
            copies.insert(source_path, copy.clone());
            clip.source.path = Some(copy);
        }
        debug!(written, "referenced documents copied");
        Ok(written)
    }

    /// Writes the first `keep` frames of a source (all when unset) in the
    /// requested format. Returns the destination and whether it was written.
    fn write_referenced_audio(
        &self,
        source_path: &Path,
        source: &ReferencedAudio,
        keep: Option<u64>,
        directory: &Path,
        parameters: &ReferencedCopyParameters,
    ) -> Result<Option<(PathBuf, bool)>> {
        let export = parameters.export.clone().unwrap_or_default();
        let file_format = export.file_format.unwrap_or(source.file_format);
        let stem = source_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("source");
        let destination = directory.join(format!("{stem}.{}", file_format.primary_extension()));
        if same_path(&destination, source_path) {
            return Ok(Some((destination, false)));
        }
        if destination.exists() && !parameters.overwrite_files {
            return Ok(Some((destination, false)));
        }

        let channels = source.format.channel_count().max(1);
        let total = source.samples.len() / channels;
        let kept = keep.map_or(total, |frames| {
            usize::try_from(frames).map_or(total, |frames| frames.min(total))
        });
        let samples = &source.samples[..kept * channels];
        let converted = match &export.conversion {
            Some(conversion) => Some(conversion.apply(&source.format, samples)?),
            None => None,
        };
        let (format, payload) = converted
            .as_ref()
            .map_or((&source.format, samples), |(format, payload)| (format, payload.as_slice()));
        std::fs::create_dir_all(directory).with_context(|| {
            format!("failed to create referenced files directory: {}", directory.display())
        })?;
        export::write_audio(
            &destination,
            file_format,
            format,
            payload,
            self.options.ffmpeg_binary.as_deref(),
            &mut |_| {},
        )?;
        if export.include_metadata {
            let kept = kept as u64;
            audio::write_sidecar(
                &destination,
                &Sidecar {
                    markers: source
                        .markers
                        .iter()
                        .filter(|marker| marker.start < kept)
                        .cloned()
                        .collect(),
                    metadata: source.metadata.clone(),
                },
            )?;
        }
        info!(destination = %destination.display(), frames = kept, "referenced audio written");
        Ok(Some((destination, true)))
    }

    fn write_audio_payload(
        &self,
        document: &Document,
        plan: &WritePlan,
        format: &SampleFormat,
        samples: &[f32],
    ) -> Result<Converted> {
        let converted = match &plan.conversion {
            Some(conversion) => Some(conversion.apply(format, samples)?),
            None => None,
        };
        let (target, payload) = converted
            .as_ref()
            .map_or((format, samples), |(target, payload)| (target, payload.as_slice()));

        let reports_progress = document.kind() == DocumentKind::Waveform;
        let mut progress = |percent: u8| {
            if reports_progress && percent % 10 == 0 {
                self.report_progress(document.id, Some(percent));
            }
        };
        export::write_audio(
            &plan.destination,
            plan.file_format,
            target,
            payload,
            self.options.ffmpeg_binary.as_deref(),
            &mut progress,
        )?;

        if plan.include_metadata {
            audio::write_sidecar(
                &plan.destination,
                &Sidecar {
                    markers: document.markers.clone(),
                    metadata: document.metadata.clone(),
                },
            )?;
        }
        Ok(converted)
    }

    /// Publishes the outcome and settles document state. Runs before the
    /// ticket resolves, so waiters observe the final state.
    fn finish(
        &self,
        id: DocumentId,
        operation: OperationKind,
        plan: Option<&WritePlan>,
        result: SaveResult,
        converted: Converted,
    ) {
        let Ok(handle) = self.handle(id) else {
            warn!(document_id = %id, "document vanished during save");
            return;
        };
        let mut document = handle.write();
        document.in_flight = None;
        if let DocumentBody::Waveform(waveform) = &mut document.body {
            if waveform.busy_progress.take().is_some() {
                self.emit(
                    &document,
                    EventKind::BusyChanged {
                        busy: false,
                        progress: None,
                    },
                );
            }
        }

        let Some(plan) = plan.filter(|_| result.is_success()) else {
            self.emit(&document, EventKind::OperationFailed { operation, result });
            warn!(document_id = %id, %operation, flags = ?result.flags(), "operation failed");
            return;
        };

        match operation {
            OperationKind::Save | OperationKind::SaveAs => {
                if operation == OperationKind::SaveAs {
                    document.path = Some(plan.destination.clone());
                    if let Some(stem) = plan.destination.file_stem().and_then(|stem| stem.to_str()) {
                        document.display_name = stem.to_string();
                    }
                    if let DocumentBody::Waveform(waveform) = &mut document.body {
                        waveform.file_format = plan.file_format;
                        if let Some((format, samples)) = converted {
                            waveform.format = format;
                            waveform.samples = Arc::new(samples);
                        }
                    }
                }
                if document.dirty {
                    document.dirty = false;
                    self.emit(&document, EventKind::DirtyChanged { dirty: false });
                }
                self.emit(&document, EventKind::Saved);
                info!(document_id = %id, path = %plan.destination.display(), "document saved");
            }
            OperationKind::Export | OperationKind::ExportTemplate => {
                self.bus.publish(
                    id,
                    plan.destination.display().to_string(),
                    EventKind::Exported,
                );
                info!(document_id = %id, path = %plan.destination.display(), "document exported");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tracks_every_flag() {
        assert!(!SaveResult::default().sealed().error);
        let result = SaveResult {
            folder_read_only: true,
            ..SaveResult::default()
        }
        .sealed();
        assert!(result.error);
        assert_eq!(result.flags(), vec!["folder_read_only"]);

        let internal = SaveResult::internal_failure();
        assert!(internal.error && internal.internal);
    }

    #[test]
    fn ready_tickets_resolve_without_waiting() {
        let ticket = OperationTicket::ready(
            DocumentId::new(),
            OperationKind::Save,
            SaveResult {
                missing_path: true,
                ..SaveResult::default()
            }
            .sealed(),
        );
        assert_eq!(ticket.try_result().map(|result| result.missing_path), Some(true));
        assert!(ticket.wait().error);
    }

    #[test]
    fn dropped_worker_reports_internal_failure() {
        let (ticket, sender) = OperationTicket::pending(DocumentId::new(), OperationKind::Export);
        assert_eq!(ticket.wait_timeout(Duration::from_millis(5)), None);
        drop(sender);
        assert_eq!(ticket.wait(), SaveResult::internal_failure());
    }
}
