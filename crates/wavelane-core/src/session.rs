use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    audio,
    channel::{ChannelLayout, LayoutError},
    destination::DEFAULT_MAX_PATH_LEN,
    events::{Event, EventBus, EventKind},
    export::{MAX_RENDER_SAMPLES, RenderError, SourceAudio},
    format::{ChannelFormat, FileFormat, FormatError, SampleFormat},
    model::{
        Clip, ClipId, Compound, Document, DocumentBody, DocumentId, DocumentKind, Marker,
        MarkerKind, Multitrack, PannerSettings, SourceRef, Track, TrackId, TrackKind, Waveform,
    },
    persistence,
    time::rescale_frames,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(i64),
    #[error("invalid sample encoding: {0} bits")]
    InvalidEncoding(u32),
    #[error("routing has {actual} entries, clip needs {expected}")]
    RoutingLengthMismatch { expected: usize, actual: usize },
    #[error("source channel {index} out of range for a {channels} channel source")]
    InvalidSourceChannel { index: usize, channels: usize },
    #[error("source channel {0} routed more than once")]
    DuplicateSourceChannel(usize),
    #[error("routing has {actual} entries, track has {expected} channels")]
    InvalidChannelCount { expected: usize, actual: usize },
    #[error("clip duration must be positive")]
    InvalidDuration,
    #[error("invalid marker type: {0}")]
    InvalidMarkerType(String),
    #[error("stale reference: {0}")]
    StaleReference(String),
    #[error("clip source document {0} is not open")]
    SourceUnresolved(DocumentId),
    #[error("the master track cannot be added or removed")]
    MasterTrackImmutable,
    #[error("track {0} does not hold clips")]
    NotAClipTrack(TrackId),
    #[error("document {0} is busy")]
    Busy(DocumentId),
    #[error("document {0} has unsaved changes")]
    UnsavedChanges(DocumentId),
    #[error("a save or export is already running for document {0}")]
    OperationInProgress(DocumentId),
    #[error("expected a {expected} document, found {actual}")]
    WrongDocumentKind {
        expected: DocumentKind,
        actual: DocumentKind,
    },
    #[error("document {0} already belongs to another compound document")]
    AlreadyAttached(DocumentId),
    #[error("{frames} frames of {channels} channels are too long to render")]
    RenderTooLong { frames: u64, channels: usize },
    #[error("a waveform of {frames} frames does not fit in memory")]
    WaveformTooLong { frames: u64 },
    #[error("io error: {0}")]
    Io(String),
}

impl From<anyhow::Error> for SessionError {
    fn from(value: anyhow::Error) -> Self {
        Self::Io(format!("{value:#}"))
    }
}

impl From<LayoutError> for SessionError {
    fn from(value: LayoutError) -> Self {
        match value {
            LayoutError::InvalidLayout(reason) => Self::InvalidLayout(reason),
        }
    }
}

impl From<RenderError> for SessionError {
    fn from(value: RenderError) -> Self {
        match value {
            RenderError::TooLong { frames, channels } => Self::RenderTooLong { frames, channels },
        }
    }
}

impl From<FormatError> for SessionError {
    fn from(value: FormatError) -> Self {
        match value {
            FormatError::InvalidSampleRate(rate) => Self::InvalidSampleRate(rate),
            FormatError::InvalidEncoding(bits) => Self::InvalidEncoding(bits),
        }
    }
}

fn stale_document(id: DocumentId) -> SessionError {
    SessionError::StaleReference(format!("document {id}"))
}

fn stale_track(id: TrackId) -> SessionError {
    SessionError::StaleReference(format!("track {id}"))
}

fn stale_clip(id: ClipId) -> SessionError {
    SessionError::StaleReference(format!("clip {id}"))
}

/// Whether a clip may route the same source channel to several of its channels.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    #[default]
    AllowDuplicates,
    Exclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionOptions {
    pub routing_policy: RoutingPolicy,
    pub template_dir: PathBuf,
    pub ffmpeg_binary: Option<PathBuf>,
    pub max_path_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            routing_policy: RoutingPolicy::default(),
            template_dir: PathBuf::from("templates"),
            ffmpeg_binary: None,
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    #[default]
    Normal,
    /// Discards unsaved changes.
    Force,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddClipRequest {
    pub source: SourceRef,
    pub routing: Vec<usize>,
    pub start: u64,
    /// Defaults to the source's duration at the session rate.
    pub duration: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackStatePatch {
    pub mute: Option<bool>,
    pub solo: Option<bool>,
    pub armed: Option<bool>,
    pub visible: Option<bool>,
    pub name: Option<String>,
}

/// Format metadata of a clip's source, read at resolution time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub document_id: DocumentId,
    pub path: Option<PathBuf>,
    pub kind: DocumentKind,
    pub sample_rate: u32,
    pub channel_count: usize,
    pub duration: u64,
}

impl SourceRef {
    #[must_use]
    pub fn document(document_id: DocumentId) -> Self {
        Self {
            document_id,
            path: None,
        }
    }

    /// A reference that resolves only through the path of an open document.
    #[must_use]
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            document_id: DocumentId(uuid::Uuid::nil()),
            path: Some(path.into()),
        }
    }
}

pub(crate) type DocumentHandle = Arc<RwLock<Document>>;

#[derive(Debug, Clone)]
pub(crate) struct ReferencedAudio {
    pub format: SampleFormat,
    pub file_format: FileFormat,
    pub samples: Arc<Vec<f32>>,
    pub markers: Vec<Marker>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Changes persisted content; rejected while busy.
    Structural,
    /// Selection, playhead and dirty toggles.
    Passive,
}

#[derive(Debug, Default)]
struct Changes {
    events: Vec<EventKind>,
    dirty: bool,
}

impl Changes {
    fn emit(&mut self, kind: EventKind) {
        self.events.push(kind);
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

#[derive(Debug, Default)]
struct ActiveSlot {
    current: Option<DocumentId>,
    history: Vec<DocumentId>,
}

fn multitrack(document: &Document) -> Result<&Multitrack, SessionError> {
    document
        .multitrack()
        .ok_or(SessionError::WrongDocumentKind {
            expected: DocumentKind::Multitrack,
            actual: document.kind(),
        })
}

fn multitrack_mut(document: &mut Document) -> Result<&mut Multitrack, SessionError> {
    let actual = document.kind();
    match &mut document.body {
        DocumentBody::Multitrack(multitrack) => Ok(multitrack),
        DocumentBody::Waveform(_) | DocumentBody::Compound(_) => {
            Err(SessionError::WrongDocumentKind {
                expected: DocumentKind::Multitrack,
                actual,
            })
        }
    }
}

fn waveform_mut(document: &mut Document) -> Result<&mut Waveform, SessionError> {
    let actual = document.kind();
    match &mut document.body {
        DocumentBody::Waveform(waveform) => Ok(waveform),
        DocumentBody::Multitrack(_) | DocumentBody::Compound(_) => {
            Err(SessionError::WrongDocumentKind {
                expected: DocumentKind::Waveform,
                actual,
            })
        }
    }
}

/// Interleaved length of a waveform holding `frames` frames.
fn waveform_len(frames: u64, channels: usize) -> Result<usize, SessionError> {
    usize::try_from(frames)
        .ok()
        .and_then(|frames| frames.checked_mul(channels))
        .filter(|len| *len <= MAX_RENDER_SAMPLES)
        .ok_or(SessionError::WaveformTooLong { frames })
}

fn source_info(document: &Document) -> Option<SourceInfo> {
    Some(SourceInfo {
        document_id: document.id,
        path: document.path.clone(),
        kind: document.kind(),
        sample_rate: document.sample_rate()?,
        channel_count: document.channel_count()?,
        duration: document.duration(),
    })
}

pub(crate) fn same_path(left: &Path, right: &Path) -> bool {
    if left == right {
        return true;
    }
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Index and duplicate checks shared by every routing entry point. Length is
/// checked by the caller, which knows which error it owes.
fn validate_routing(
    policy: RoutingPolicy,
    routing: &[usize],
    source_channels: usize,
) -> Result<(), SessionError> {
    if let Some(index) = routing.iter().find(|index| **index >= source_channels) {
        return Err(SessionError::InvalidSourceChannel {
            index: *index,
            channels: source_channels,
        });
    }
    if policy == RoutingPolicy::Exclusive {
        let mut seen = HashSet::new();
        if let Some(index) = routing.iter().find(|index| !seen.insert(**index)) {
            return Err(SessionError::DuplicateSourceChannel(*index));
        }
    }
    Ok(())
}

/// Every open document, the active-document slot and the event stream.
///
/// Lock order: the active slot, then document locks (a compound before its
/// sub-documents), then the registry lock and the event bus. Nothing takes the
/// active slot while holding a document lock.
#[derive(Debug, Default)]
pub struct Session {
    pub(crate) options: SessionOptions,
    documents: RwLock<HashMap<DocumentId, DocumentHandle>>,
    active: Mutex<ActiveSlot>,
    pub(crate) bus: EventBus,
}

impl Session {
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.bus.subscribe()
    }

    pub(crate) fn handle(&self, id: DocumentId) -> Result<DocumentHandle, SessionError> {
        self.documents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| stale_document(id))
    }

    pub(crate) fn ensure_open(&self, id: DocumentId) -> Result<(), SessionError> {
        if self.documents.read().contains_key(&id) {
            Ok(())
        } else {
            Err(stale_document(id))
        }
    }

    #[must_use]
    pub fn is_open(&self, id: DocumentId) -> bool {
        self.documents.read().contains_key(&id)
    }

    fn handles(&self) -> Vec<DocumentHandle> {
        self.documents.read().values().cloned().collect()
    }

    pub(crate) fn read<T>(
        &self,
        id: DocumentId,
        view: impl FnOnce(&Document) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let handle = self.handle(id)?;
        let document = handle.read();
        self.ensure_open(id)?;
        view(&document)
    }

    fn edit<T>(
        &self,
        id: DocumentId,
        access: Access,
        apply: impl FnOnce(&mut Document, &mut Changes) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let handle = self.handle(id)?;
        let mut document = handle.write();
        self.ensure_open(id)?;
        if access == Access::Structural && document.is_busy() {
            return Err(SessionError::Busy(id));
        }
        let mut changes = Changes::default();
        let value = apply(&mut document, &mut changes)?;
        self.commit(&mut document, changes);
        Ok(value)
    }

    fn commit(&self, document: &mut Document, changes: Changes) {
        if changes.dirty {
            document.touch();
        }
        let path = document.path_string();
        for kind in changes.events {
            self.bus.publish(document.id, path.clone(), kind);
        }
        if changes.dirty && !document.dirty {
            document.dirty = true;
            self.bus
                .publish(document.id, path, EventKind::DirtyChanged { dirty: true });
        }
    }

    pub(crate) fn emit(&self, document: &Document, kind: EventKind) {
        self.bus.publish(document.id, document.path_string(), kind);
    }

    fn register(&self, document: Document, user_created: bool) -> Result<DocumentId, SessionError> {
        let id = document.id;
        let handle = Arc::new(RwLock::new(document));
        {
            let document = handle.write();
            self.documents.write().insert(id, Arc::clone(&handle));
            self.emit(&document, EventKind::New { user_created });
            info!(document_id = %id, kind = %document.kind(), user_created, "document registered");
        }
        self.activate(id)?;
        Ok(id)
    }

    #[instrument(skip(self, name, master_layout), fields(sample_rate, channels = master_layout.channel_count()))]
    pub fn new_multitrack(
        &self,
        name: impl Into<String>,
        sample_rate: u32,
        master_layout: ChannelLayout,
    ) -> Result<DocumentId, SessionError> {
        if sample_rate == 0 {
            return Err(SessionError::InvalidSampleRate(0));
        }
        let mut multitrack = Multitrack {
            sample_rate,
            tracks: Vec::new(),
            panner: PannerSettings::default(),
            next_track_id: 1,
        };
        let master_id = multitrack.allocate_track_id();
        multitrack.insert_track(Track::new(
            master_id,
            TrackKind::Master,
            "Master",
            ChannelFormat::new(master_layout),
        ));
        self.register(
            Document::new(name, DocumentBody::Multitrack(multitrack)),
            true,
        )
    }

    #[instrument(skip(self, name), fields(format = %format, frames))]
    pub fn new_waveform(
        &self,
        name: impl Into<String>,
        format: SampleFormat,
        frames: u64,
    ) -> Result<DocumentId, SessionError> {
        let length = waveform_len(frames, format.channel_count())?;
        let waveform = Waveform {
            format,
            file_format: FileFormat::WavePcm,
            samples: Arc::new(vec![0.0; length]),
            busy_progress: None,
        };
        self.register(Document::new(name, DocumentBody::Waveform(waveform)), true)
    }

    #[instrument(skip(self, name))]
    pub fn new_compound(&self, name: impl Into<String>) -> Result<DocumentId, SessionError> {
        self.register(
            Document::new(name, DocumentBody::Compound(Compound::default())),
            true,
        )
    }

    /// Id of the open document persisted at `path`, if any.
    #[must_use]
    pub fn find_by_path(&self, path: &Path) -> Option<DocumentId> {
        self.handles().into_iter().find_map(|handle| {
            let document = handle.read();
            document
                .path
                .as_deref()
                .is_some_and(|candidate| same_path(candidate, path))
                .then_some(document.id)
        })
    }

    /// Opens a session or audio file and activates it. A path that is already
    /// open yields the existing document.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn open(&self, path: &Path) -> Result<DocumentId, SessionError> {
        if let Some(existing) = self.find_by_path(path) {
            debug!(document_id = %existing, "path already open");
            self.activate(existing)?;
            return Ok(existing);
        }

        let document = match FileFormat::from_path(path) {
            Some(FileFormat::Session) => self.load_session_document(path)?,
            Some(file_format) => Self::load_audio_document(path, file_format)?,
            None => {
                return Err(SessionError::Io(format!(
                    "unsupported file type: {}",
                    path.display()
                )));
            }
        };
        self.register(document, false)
    }

    fn load_session_document(&self, path: &Path) -> Result<Document, SessionError> {
        let mut session = persistence::load_session(path)?;

        // Referenced audio that is not open yet is opened alongside, and clip
        // sources are rebound to the live ids.
        for track in &mut session.tracks {
            for clip in &mut track.clips {
                if self.is_open(clip.source.document_id) {
                    continue;
                }
                let Some(source_path) = clip.source.path.clone() else {
                    continue;
                };
                let resolved = match self.find_by_path(&source_path) {
                    Some(id) => Some(id),
                    None => Self::load_audio_document(&source_path, FileFormat::WavePcm)
                        .and_then(|document| self.register_background(document))
                        .inspect_err(|error| {
                            warn!(source = %source_path.display(), %error, "clip source could not be opened");
                        })
                        .ok(),
                };
                if let Some(id) = resolved {
                    clip.source.document_id = id;
                }
            }
        }
        Ok(session.into_document(Some(path.to_path_buf())))
    }

    fn register_background(&self, document: Document) -> Result<DocumentId, SessionError> {
        let id = document.id;
        let handle = Arc::new(RwLock::new(document));
        let document = handle.write();
        self.documents.write().insert(id, Arc::clone(&handle));
        self.emit(&document, EventKind::New { user_created: false });
        debug!(document_id = %id, "referenced document opened");
        Ok(id)
    }

    fn load_audio_document(path: &Path, fallback: FileFormat) -> Result<Document, SessionError> {
        let decoded = audio::decode_audio_file(path)?;
        let format = SampleFormat::new(
            decoded.sample_rate,
            decoded.encoding,
            ChannelLayout::for_channel_count(decoded.channels),
        )?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("Untitled")
            .to_string();
        let waveform = Waveform {
            format,
            file_format: FileFormat::from_path(path).unwrap_or(fallback),
            samples: Arc::new(decoded.samples),
            busy_progress: None,
        };
        let mut document = Document::new(name, DocumentBody::Waveform(waveform));
        document.path = Some(path.to_path_buf());
        if let Some(sidecar) = audio::read_sidecar(path)? {
            document.markers = sidecar.markers;
            document.markers.sort_by_key(|marker| marker.start);
            document.metadata = sidecar.metadata;
        }
        Ok(document)
    }

    /// Makes `child` a sub-document of `compound`.
    #[instrument(skip(self), fields(compound_id = %compound_id, child_id = %child_id))]
    pub fn attach_sub_document(
        &self,
        compound_id: DocumentId,
        child_id: DocumentId,
    ) -> Result<(), SessionError> {
        self.read(compound_id, |document| match document.body {
            DocumentBody::Compound(_) => Ok(()),
            _ => Err(SessionError::WrongDocumentKind {
                expected: DocumentKind::Compound,
                actual: document.kind(),
            }),
        })?;

        let has_audio = self.edit(child_id, Access::Structural, |document, _| {
            if document.kind() == DocumentKind::Compound {
                return Err(SessionError::WrongDocumentKind {
                    expected: DocumentKind::Waveform,
                    actual: DocumentKind::Compound,
                });
            }
            match document.parent_compound {
                Some(parent) if parent != compound_id => {
                    return Err(SessionError::AlreadyAttached(child_id));
                }
                _ => document.parent_compound = Some(compound_id),
            }
            Ok(document.channel_count().is_some())
        })?;

        let attached = self.edit(compound_id, Access::Passive, |document, _| {
            if let DocumentBody::Compound(compound) = &mut document.body {
                if !compound.sub_documents.contains(&child_id) {
                    compound.sub_documents.push(child_id);
                }
                compound.has_audio |= has_audio;
            }
            Ok(())
        });
        if let Err(error) = attached {
            if let Ok(handle) = self.handle(child_id) {
                handle.write().parent_compound = None;
            }
            return Err(error);
        }
        info!("sub-document attached");
        Ok(())
    }

    fn check_closable(document: &Document, mode: CloseMode) -> Result<(), SessionError> {
        if document.is_busy() {
            return Err(SessionError::Busy(document.id));
        }
        if document.dirty && mode == CloseMode::Normal {
            return Err(SessionError::UnsavedChanges(document.id));
        }
        Ok(())
    }

    /// Closes a document, and the sub-documents of a compound. Either every
    /// document involved closes or none does. A closed id never resolves again.
    #[instrument(skip(self), fields(document_id = %id, mode = ?mode))]
    pub fn close(&self, id: DocumentId, mode: CloseMode) -> Result<(), SessionError> {
        let mut active = self.active.lock();
        let handle = self.handle(id)?;
        let parent = {
            let document = handle.write();
            self.ensure_open(id)?;
            Self::check_closable(&document, mode)?;

            let child_handles: Vec<DocumentHandle> = match &document.body {
                DocumentBody::Compound(compound) => compound
                    .sub_documents
                    .iter()
                    .filter_map(|child| self.handle(*child).ok())
                    .collect(),
                DocumentBody::Multitrack(_) | DocumentBody::Waveform(_) => Vec::new(),
            };
            let children: Vec<_> = child_handles.iter().map(|child| child.write()).collect();
            for child in &children {
                Self::check_closable(child, mode)?;
            }

            {
                let mut registry = self.documents.write();
                for child in &children {
                    registry.remove(&child.id);
                }
                registry.remove(&id);
            }
            for child in &children {
                self.emit(child, EventKind::Closed);
                Self::forget_active(&mut active, child.id);
                debug!(document_id = %child.id, "sub-document closed");
            }
            self.emit(&document, EventKind::Closed);
            Self::forget_active(&mut active, id);
            document.parent_compound
        };

        if let Some(parent) = parent.and_then(|parent| self.handle(parent).ok()) {
            if let DocumentBody::Compound(compound) = &mut parent.write().body {
                compound.sub_documents.retain(|child| *child != id);
            }
        }
        self.promote_active(&mut active);
        info!("document closed");
        Ok(())
    }

    fn forget_active(active: &mut ActiveSlot, id: DocumentId) {
        active.history.retain(|entry| *entry != id);
        if active.current == Some(id) {
            active.current = None;
        }
    }

    /// Activates the most recent document still open, once the active one is gone.
    fn promote_active(&self, active: &mut ActiveSlot) {
        if active.current.is_some() {
            return;
        }
        while let Some(candidate) = active.history.last().copied() {
            if let Ok(handle) = self.handle(candidate) {
                active.current = Some(candidate);
                let path = handle.read().path_string();
                self.bus.publish(candidate, path, EventKind::Activated);
                debug!(document_id = %candidate, "active document promoted");
                return;
            }
            active.history.pop();
        }
    }

    #[instrument(skip(self), fields(document_id = %id))]
    pub fn activate(&self, id: DocumentId) -> Result<(), SessionError> {
        let path = self.read(id, |document| Ok(document.path_string()))?;
        let mut active = self.active.lock();
        self.ensure_open(id)?;
        if active.current == Some(id) {
            return Ok(());
        }
        active.history.retain(|entry| *entry != id);
        active.history.push(id);
        active.current = Some(id);
        self.bus.publish(id, path, EventKind::Activated);
        debug!("document activated");
        Ok(())
    }

    #[must_use]
    pub fn active_document(&self) -> Option<DocumentId> {
        self.active.lock().current
    }

    pub fn document(&self, id: DocumentId) -> Result<Document, SessionError> {
        self.read(id, |document| Ok(document.clone()))
    }

    /// Snapshots of every open document, oldest first.
    #[must_use]
    pub fn documents(&self) -> Vec<Document> {
        let mut documents: Vec<Document> = self
            .handles()
            .into_iter()
            .map(|handle| handle.read().clone())
            .collect();
        documents.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then(left.id.cmp(&right.id))
        });
        documents
    }

    pub fn is_dirty(&self, id: DocumentId) -> Result<bool, SessionError> {
        self.read(id, |document| Ok(document.dirty))
    }

    /// Clip tracks, then bus tracks, then the master track.
    pub fn tracks(&self, id: DocumentId) -> Result<Vec<Track>, SessionError> {
        self.read(id, |document| Ok(multitrack(document)?.tracks.clone()))
    }

    fn tracks_of_kind(&self, id: DocumentId, kind: TrackKind) -> Result<Vec<Track>, SessionError> {
        self.read(id, |document| {
            Ok(multitrack(document)?
                .tracks
                .iter()
                .filter(|track| track.kind() == kind)
                .cloned()
                .collect())
        })
    }

    pub fn clip_tracks(&self, id: DocumentId) -> Result<Vec<Track>, SessionError> {
        self.tracks_of_kind(id, TrackKind::Clip)
    }

    pub fn bus_tracks(&self, id: DocumentId) -> Result<Vec<Track>, SessionError> {
        self.tracks_of_kind(id, TrackKind::Bus)
    }

    pub fn master_track(&self, id: DocumentId) -> Result<Track, SessionError> {
        self.read(id, |document| {
            multitrack(document)?
                .master()
                .cloned()
                .ok_or_else(|| SessionError::StaleReference("master track".to_string()))
        })
    }

    pub fn track(&self, id: DocumentId, track_id: TrackId) -> Result<Track, SessionError> {
        self.read(id, |document| {
            multitrack(document)?
                .track(track_id)
                .cloned()
                .ok_or_else(|| stale_track(track_id))
        })
    }

    pub fn track_by_name(&self, id: DocumentId, name: &str) -> Result<Option<Track>, SessionError> {
        self.read(id, |document| {
            Ok(multitrack(document)?
                .tracks
                .iter()
                .find(|track| track.name == name)
                .cloned())
        })
    }

    pub fn clip(&self, id: DocumentId, clip_id: ClipId) -> Result<Clip, SessionError> {
        self.read(id, |document| {
            multitrack(document)?
                .clip(clip_id)
                .map(|(_, clip)| clip.clone())
                .ok_or_else(|| stale_clip(clip_id))
        })
    }

    pub fn selected_clips(&self, id: DocumentId) -> Result<Vec<ClipId>, SessionError> {
        self.read(id, |document| {
            Ok(multitrack(document)?
                .clips()
                .filter(|(_, clip)| clip.selected)
                .map(|(_, clip)| clip.id)
                .collect())
        })
    }

    pub fn markers(&self, id: DocumentId) -> Result<Vec<Marker>, SessionError> {
        self.read(id, |document| Ok(document.markers.clone()))
    }

    /// Length in samples at the document's own rate.
    pub fn duration(&self, id: DocumentId) -> Result<u64, SessionError> {
        self.read(id, |document| Ok(document.duration()))
    }

    #[instrument(skip(self, layout, name), fields(document_id = %id, kind = ?kind))]
    pub fn add_track(
        &self,
        id: DocumentId,
        layout: ChannelLayout,
        kind: TrackKind,
        name: impl Into<String>,
    ) -> Result<TrackId, SessionError> {
        if kind == TrackKind::Master {
            return Err(SessionError::MasterTrackImmutable);
        }
        let name = name.into();
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let track_id = multitrack.allocate_track_id();
            multitrack.insert_track(Track::new(
                track_id,
                kind,
                name.clone(),
                ChannelFormat::new(layout),
            ));
            changes.emit(EventKind::TrackAdded { track_id, name });
            changes.mark_dirty();
            info!(track_id = %track_id, "track added");
            Ok(track_id)
        })
    }

    #[instrument(skip(self), fields(document_id = %id, track_id = %track_id))]
    pub fn remove_track(&self, id: DocumentId, track_id: TrackId) -> Result<(), SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let index = multitrack
                .tracks
                .iter()
                .position(|track| track.id == track_id)
                .ok_or_else(|| stale_track(track_id))?;
            if multitrack.tracks[index].kind() == TrackKind::Master {
                return Err(SessionError::MasterTrackImmutable);
            }
            let track = multitrack.tracks.remove(index);
            for clip in &track.clips {
                changes.emit(EventKind::ClipRemoved {
                    track_id,
                    clip_id: clip.id,
                });
            }
            changes.emit(EventKind::TrackRemoved {
                track_id,
                name: track.name,
            });
            changes.mark_dirty();
            info!(clips = track.clips.len(), "track removed");
            Ok(())
        })
    }

    #[instrument(skip(self, patch), fields(document_id = %id, track_id = %track_id))]
    pub fn set_track_state(
        &self,
        id: DocumentId,
        track_id: TrackId,
        patch: TrackStatePatch,
    ) -> Result<Track, SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let track = multitrack_mut(document)?
                .track_mut(track_id)
                .ok_or_else(|| stale_track(track_id))?;
            let before = track.clone();
            if let Some(mute) = patch.mute {
                track.mute = mute;
            }
            if let Some(solo) = patch.solo {
                track.solo = solo;
            }
            if let Some(armed) = patch.armed {
                track.armed = armed;
            }
            if let Some(visible) = patch.visible {
                track.visible = visible;
            }
            if let Some(name) = patch.name {
                track.name = name;
            }
            if *track != before {
                changes.mark_dirty();
            }
            info!(
                mute = track.mute,
                solo = track.solo,
                armed = track.armed,
                "track state patched"
            );
            Ok(track.clone())
        })
    }

    /// Returns whether the selection changed.
    #[instrument(skip(self), fields(document_id = %id, track_id = %track_id))]
    pub fn select_track(
        &self,
        id: DocumentId,
        track_id: TrackId,
        selected: bool,
    ) -> Result<bool, SessionError> {
        self.edit(id, Access::Passive, |document, changes| {
            let track = multitrack_mut(document)?
                .track_mut(track_id)
                .ok_or_else(|| stale_track(track_id))?;
            if track.selected == selected {
                return Ok(false);
            }
            track.selected = selected;
            changes.emit(EventKind::TrackSelection { track_id, selected });
            Ok(true)
        })
    }

    pub(crate) fn resolve_source_ref(
        &self,
        target: DocumentId,
        source: &SourceRef,
    ) -> Result<SourceInfo, SessionError> {
        let unresolved = SessionError::SourceUnresolved(source.document_id);
        if source.document_id == target {
            return Err(unresolved);
        }
        if let Ok(handle) = self.handle(source.document_id) {
            let document = handle.read();
            if self.is_open(document.id) {
                return source_info(&document).ok_or(unresolved);
            }
        }
        let Some(path) = source.path.as_deref() else {
            return Err(unresolved);
        };
        match self.find_by_path(path) {
            Some(found) if found != target => self
                .handle(found)
                .ok()
                .and_then(|handle| source_info(&handle.read()))
                .ok_or(unresolved),
            _ => Err(unresolved),
        }
    }

    fn clip_source(&self, id: DocumentId, clip_id: ClipId) -> Result<SourceRef, SessionError> {
        self.read(id, |document| {
            multitrack(document)?
                .clip(clip_id)
                .map(|(_, clip)| clip.source.clone())
                .ok_or_else(|| stale_clip(clip_id))
        })
    }

    /// Looks up the clip's source among the open documents.
    pub fn resolve_source(&self, id: DocumentId, clip_id: ClipId) -> Result<SourceInfo, SessionError> {
        let source = self.clip_source(id, clip_id)?;
        self.resolve_source_ref(id, &source)
    }

    #[instrument(skip(self, request), fields(document_id = %id, track_id = %track_id, start = request.start))]
    pub fn add_clip(
        &self,
        id: DocumentId,
        track_id: TrackId,
        request: AddClipRequest,
    ) -> Result<ClipId, SessionError> {
        let source = self.resolve_source_ref(id, &request.source)?;
        let policy = self.options.routing_policy;
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let sample_rate = multitrack.sample_rate;
            let track = multitrack
                .track_mut(track_id)
                .ok_or_else(|| stale_track(track_id))?;
            if track.kind() != TrackKind::Clip {
                return Err(SessionError::NotAClipTrack(track_id));
            }
            if request.routing.len() != track.channel_count() {
                return Err(SessionError::InvalidChannelCount {
                    expected: track.channel_count(),
                    actual: request.routing.len(),
                });
            }
            validate_routing(policy, &request.routing, source.channel_count)?;
            let duration = request.duration.unwrap_or_else(|| {
                rescale_frames(source.duration, source.sample_rate, sample_rate)
            });
            if duration == 0 {
                return Err(SessionError::InvalidDuration);
            }

            let clip = Clip {
                id: ClipId::new(),
                name: request.name.unwrap_or_else(|| {
                    source
                        .path
                        .as_deref()
                        .and_then(Path::file_stem)
                        .and_then(|stem| stem.to_str())
                        .unwrap_or("Clip")
                        .to_string()
                }),
                start: request.start,
                duration,
                source: SourceRef {
                    document_id: source.document_id,
                    path: source.path.clone(),
                },
                source_channel_routing: request.routing,
                selected: false,
            };
            let clip_id = clip.id;
            track.clips.push(clip);
            changes.emit(EventKind::ClipAdded { track_id, clip_id });
            changes.mark_dirty();
            info!(clip_id = %clip_id, duration, "clip added");
            Ok(clip_id)
        })
    }

    /// Copies a clip onto `target_track` at `start` under a new id.
    #[instrument(skip(self), fields(document_id = %id, clip_id = %clip_id, track_id = %target_track))]
    pub fn duplicate_clip(
        &self,
        id: DocumentId,
        clip_id: ClipId,
        target_track: TrackId,
        start: u64,
    ) -> Result<ClipId, SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let mut copy = multitrack
                .clip(clip_id)
                .map(|(_, clip)| clip.clone())
                .ok_or_else(|| stale_clip(clip_id))?;
            let track = multitrack
                .track_mut(target_track)
                .ok_or_else(|| stale_track(target_track))?;
            if track.kind() != TrackKind::Clip {
                return Err(SessionError::NotAClipTrack(target_track));
            }
            if copy.channel_count() != track.channel_count() {
                return Err(SessionError::InvalidChannelCount {
                    expected: track.channel_count(),
                    actual: copy.channel_count(),
                });
            }
            copy.id = ClipId::new();
            copy.start = start;
            copy.selected = false;
            let new_id = copy.id;
            track.clips.push(copy);
            changes.emit(EventKind::ClipAdded {
                track_id: target_track,
                clip_id: new_id,
            });
            changes.mark_dirty();
            info!(new_clip_id = %new_id, "clip duplicated");
            Ok(new_id)
        })
    }

    pub fn move_clip(&self, id: DocumentId, clip_id: ClipId, start: u64) -> Result<(), SessionError> {
        self.move_clips(id, &[(clip_id, start)])
    }

    /// Moves several clips in time. Either every clip moves or none does.
    #[instrument(skip(self, moves), fields(document_id = %id, clips = moves.len()))]
    pub fn move_clips(&self, id: DocumentId, moves: &[(ClipId, u64)]) -> Result<(), SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let located = moves
                .iter()
                .map(|(clip_id, start)| {
                    multitrack
                        .locate_clip(*clip_id)
                        .map(|location| (location, *start))
                        .ok_or_else(|| stale_clip(*clip_id))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for ((track_index, clip_index), start) in located {
                let track = &mut multitrack.tracks[track_index];
                let clip = &mut track.clips[clip_index];
                if clip.start == start {
                    continue;
                }
                clip.start = start;
                changes.emit(EventKind::ClipMoved {
                    from_track: track.id,
                    to_track: track.id,
                    clip_id: clip.id,
                    start,
                });
                changes.mark_dirty();
            }
            debug!("clips moved");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(document_id = %id, clip_id = %clip_id, duration))]
    pub fn resize_clip(&self, id: DocumentId, clip_id: ClipId, duration: u64) -> Result<(), SessionError> {
        if duration == 0 {
            return Err(SessionError::InvalidDuration);
        }
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let (track_index, clip_index) = multitrack
                .locate_clip(clip_id)
                .ok_or_else(|| stale_clip(clip_id))?;
            let clip = &mut multitrack.tracks[track_index].clips[clip_index];
            if clip.duration != duration {
                clip.duration = duration;
                changes.mark_dirty();
            }
            Ok(())
        })
    }

    /// Moves a clip to another track, keeping its id. Without an explicit
    /// routing, a channel count change maps clip channel `i` to source
    /// channel `i % source_channels`.
    #[instrument(skip(self, routing), fields(document_id = %id, clip_id = %clip_id, track_id = %track_id))]
    pub fn move_clip_to_track(
        &self,
        id: DocumentId,
        clip_id: ClipId,
        track_id: TrackId,
        routing: Option<Vec<usize>>,
    ) -> Result<(), SessionError> {
        let source = self.clip_source(id, clip_id)?;
        let source_info = self.resolve_source_ref(id, &source);
        let policy = self.options.routing_policy;

        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let (from_index, clip_index) = multitrack
                .locate_clip(clip_id)
                .ok_or_else(|| stale_clip(clip_id))?;
            let to_index = multitrack
                .tracks
                .iter()
                .position(|track| track.id == track_id)
                .ok_or_else(|| stale_track(track_id))?;
            let target = &multitrack.tracks[to_index];
            if target.kind() != TrackKind::Clip {
                return Err(SessionError::NotAClipTrack(track_id));
            }
            let target_channels = target.channel_count();
            let current = &multitrack.tracks[from_index].clips[clip_index];

            let new_routing = match routing {
                Some(routing) => {
                    if routing.len() != target_channels {
                        return Err(SessionError::InvalidChannelCount {
                            expected: target_channels,
                            actual: routing.len(),
                        });
                    }
                    let info = source_info.clone()?;
                    validate_routing(policy, &routing, info.channel_count)?;
                    routing
                }
                None if current.channel_count() == target_channels => {
                    current.source_channel_routing.clone()
                }
                None => {
                    let info = source_info.clone()?;
                    let channels = info.channel_count.max(1);
                    (0..target_channels).map(|index| index % channels).collect()
                }
            };

            let from_track = multitrack.tracks[from_index].id;
            let mut clip = multitrack.tracks[from_index].clips.remove(clip_index);
            clip.source_channel_routing = new_routing;
            let start = clip.start;
            multitrack.tracks[to_index].clips.push(clip);
            changes.emit(EventKind::ClipMoved {
                from_track,
                to_track: track_id,
                clip_id,
                start,
            });
            changes.mark_dirty();
            info!(from_track = %from_track, "clip moved to track");
            Ok(())
        })
    }

    /// Replaces a clip's routing. On failure the previous routing is kept.
    #[instrument(skip(self, routing), fields(document_id = %id, clip_id = %clip_id))]
    pub fn set_routing(
        &self,
        id: DocumentId,
        clip_id: ClipId,
        routing: Vec<usize>,
    ) -> Result<(), SessionError> {
        let source = self.clip_source(id, clip_id)?;
        let info = self.resolve_source_ref(id, &source)?;
        let policy = self.options.routing_policy;

        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let (track_index, clip_index) = multitrack
                .locate_clip(clip_id)
                .ok_or_else(|| stale_clip(clip_id))?;
            let track = &mut multitrack.tracks[track_index];
            if routing.len() != track.channel_count() {
                return Err(SessionError::RoutingLengthMismatch {
                    expected: track.channel_count(),
                    actual: routing.len(),
                });
            }
            validate_routing(policy, &routing, info.channel_count)?;
            let clip = &mut track.clips[clip_index];
            if clip.source.document_id != info.document_id {
                return Err(SessionError::SourceUnresolved(clip.source.document_id));
            }
            if clip.source_channel_routing != routing {
                clip.source_channel_routing = routing;
                changes.mark_dirty();
            }
            debug!("routing updated");
            Ok(())
        })
    }

    /// Returns false if the clip is not in the document.
    #[instrument(skip(self), fields(document_id = %id, clip_id = %clip_id))]
    pub fn remove_clip(&self, id: DocumentId, clip_id: ClipId) -> Result<bool, SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let Some((track_index, clip_index)) = multitrack.locate_clip(clip_id) else {
                debug!("clip not present");
                return Ok(false);
            };
            let track = &mut multitrack.tracks[track_index];
            track.clips.remove(clip_index);
            changes.emit(EventKind::ClipRemoved {
                track_id: track.id,
                clip_id,
            });
            changes.mark_dirty();
            info!("clip removed");
            Ok(true)
        })
    }

    fn set_clip_selected(
        &self,
        id: DocumentId,
        clip_id: ClipId,
        selected: bool,
    ) -> Result<bool, SessionError> {
        self.edit(id, Access::Passive, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let (track_index, clip_index) = multitrack
                .locate_clip(clip_id)
                .ok_or_else(|| stale_clip(clip_id))?;
            let track = &mut multitrack.tracks[track_index];
            let clip = &mut track.clips[clip_index];
            if clip.selected == selected {
                return Ok(false);
            }
            clip.selected = selected;
            changes.emit(EventKind::ClipSelection {
                track_id: track.id,
                clip_id,
                selected,
            });
            Ok(true)
        })
    }

    /// Returns whether the clip was newly selected.
    pub fn select_clip(&self, id: DocumentId, clip_id: ClipId) -> Result<bool, SessionError> {
        self.set_clip_selected(id, clip_id, true)
    }

    pub fn deselect_clip(&self, id: DocumentId, clip_id: ClipId) -> Result<bool, SessionError> {
        self.set_clip_selected(id, clip_id, false)
    }

    /// Deselects every clip; returns how many were selected.
    #[instrument(skip(self), fields(document_id = %id))]
    pub fn clear_clip_selection(&self, id: DocumentId) -> Result<usize, SessionError> {
        self.edit(id, Access::Passive, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            let mut cleared = 0;
            for track in &mut multitrack.tracks {
                let track_id = track.id;
                for clip in track.clips.iter_mut().filter(|clip| clip.selected) {
                    clip.selected = false;
                    changes.emit(EventKind::ClipSelection {
                        track_id,
                        clip_id: clip.id,
                        selected: false,
                    });
                    cleared += 1;
                }
            }
            Ok(cleared)
        })
    }

    #[instrument(skip(self, name, description), fields(document_id = %id, start, kind = %kind))]
    pub fn add_marker(
        &self,
        id: DocumentId,
        start: u64,
        length: u64,
        name: impl Into<String>,
        kind: &str,
        description: impl Into<String>,
    ) -> Result<(), SessionError> {
        let kind: MarkerKind = kind.parse().map_err(SessionError::InvalidMarkerType)?;
        let name = name.into();
        let description = description.into();
        self.edit(id, Access::Structural, |document, changes| {
            if document.kind() == DocumentKind::Compound {
                return Err(SessionError::WrongDocumentKind {
                    expected: DocumentKind::Multitrack,
                    actual: DocumentKind::Compound,
                });
            }
            document.insert_marker(Marker {
                start,
                length,
                name: name.clone(),
                description,
                kind,
            });
            changes.emit(EventKind::MarkerAdded { name, kind });
            changes.mark_dirty();
            Ok(())
        })
    }

    #[instrument(skip(self, key, value), fields(document_id = %id))]
    pub fn set_metadata(
        &self,
        id: DocumentId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        let key = key.into();
        let value = value.into();
        self.edit(id, Access::Structural, |document, changes| {
            if document.metadata.get(&key) != Some(&value) {
                document.metadata.insert(key, value);
                changes.mark_dirty();
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(document_id = %id))]
    pub fn set_panner(&self, id: DocumentId, panner: PannerSettings) -> Result<(), SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let multitrack = multitrack_mut(document)?;
            if multitrack.panner != panner {
                multitrack.panner = panner;
                changes.mark_dirty();
            }
            Ok(())
        })
    }

    pub fn set_playhead(&self, id: DocumentId, position: u64) -> Result<(), SessionError> {
        self.edit(id, Access::Passive, |document, _| {
            document.playhead = position;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(document_id = %id, dirty))]
    pub fn set_dirty(&self, id: DocumentId, dirty: bool) -> Result<(), SessionError> {
        self.edit(id, Access::Passive, |document, changes| {
            if document.dirty != dirty {
                document.dirty = dirty;
                changes.emit(EventKind::DirtyChanged { dirty });
            }
            Ok(())
        })
    }

    /// Overwrites interleaved frames from `start_frame`, growing the waveform
    /// as needed.
    #[instrument(skip(self, interleaved), fields(document_id = %id, start_frame, samples = interleaved.len()))]
    pub fn write_frames(
        &self,
        id: DocumentId,
        start_frame: u64,
        interleaved: &[f32],
    ) -> Result<(), SessionError> {
        self.edit(id, Access::Structural, |document, changes| {
            let waveform = waveform_mut(document)?;
            let channels = waveform.format.channel_count();
            if interleaved.len() % channels != 0 {
                return Err(SessionError::InvalidChannelCount {
                    expected: channels,
                    actual: interleaved.len() % channels,
                });
            }
            if interleaved.is_empty() {
                return Ok(());
            }
            let written = (interleaved.len() / channels) as u64;
            let end_frame = start_frame
                .checked_add(written)
                .ok_or(SessionError::WaveformTooLong { frames: u64::MAX })?;
            let end = waveform_len(end_frame, channels)?;
            let offset = end - interleaved.len();
            let samples = Arc::make_mut(&mut waveform.samples);
            if samples.len() < end {
                samples.resize(end, 0.0);
            }
            samples[offset..end].copy_from_slice(interleaved);
            changes.mark_dirty();
            Ok(())
        })
    }

    fn set_progress(&self, id: DocumentId, progress: Option<u8>, require_idle: bool) -> Result<(), SessionError> {
        self.edit(id, Access::Passive, |document, changes| {
            if require_idle && document.is_busy() {
                return Err(SessionError::Busy(id));
            }
            if document.in_flight.is_some() {
                return Err(SessionError::Busy(id));
            }
            let waveform = waveform_mut(document)?;
            let progress = progress.map(|value| value.min(100));
            if waveform.busy_progress == progress {
                return Ok(());
            }
            waveform.busy_progress = progress;
            changes.emit(EventKind::BusyChanged {
                busy: progress.is_some(),
                progress,
            });
            Ok(())
        })
    }

    /// Marks a waveform busy at 0% progress. Structural edits fail until
    /// [`Session::end_busy`].
    #[instrument(skip(self), fields(document_id = %id))]
    pub fn begin_busy(&self, id: DocumentId) -> Result<(), SessionError> {
        self.set_progress(id, Some(0), true)
    }

    pub fn set_busy_progress(&self, id: DocumentId, progress: u8) -> Result<(), SessionError> {
        self.set_progress(id, Some(progress), false)
    }

    #[instrument(skip(self), fields(document_id = %id))]
    pub fn end_busy(&self, id: DocumentId) -> Result<(), SessionError> {
        self.set_progress(id, None, false)
    }

    /// Paths of every open document except `id`.
    pub(crate) fn open_paths_except(&self, id: DocumentId) -> Vec<PathBuf> {
        self.handles()
            .into_iter()
            .filter_map(|handle| {
                let document = handle.read();
                (document.id != id).then(|| document.path.clone()).flatten()
            })
            .collect()
    }

    /// Format, audio and annotations of a clip's waveform source.
    pub(crate) fn referenced_audio(&self, owner: DocumentId, source: &SourceRef) -> Option<ReferencedAudio> {
        let info = self.resolve_source_ref(owner, source).ok()?;
        let handle = self.handle(info.document_id).ok()?;
        let document = handle.read();
        let waveform = document.waveform()?;
        Some(ReferencedAudio {
            format: waveform.format.clone(),
            file_format: waveform.file_format,
            samples: Arc::clone(&waveform.samples),
            markers: document.markers.clone(),
            metadata: document.metadata.clone(),
        })
    }

    /// Audio of every waveform source referenced by `tracks`, keyed by the id
    /// stored in the clip.
    pub(crate) fn source_audio(&self, owner: DocumentId, tracks: &[Track]) -> HashMap<DocumentId, SourceAudio> {
        let mut sources = HashMap::new();
        for clip in tracks.iter().flat_map(|track| track.clips.iter()) {
            if sources.contains_key(&clip.source.document_id) {
                continue;
            }
            let Ok(info) = self.resolve_source_ref(owner, &clip.source) else {
                warn!(clip_id = %clip.id, "clip source unresolved, rendering silence");
                continue;
            };
            let Ok(handle) = self.handle(info.document_id) else {
                continue;
            };
            let document = handle.read();
            if let Some(waveform) = document.waveform() {
                sources.insert(
                    clip.source.document_id,
                    SourceAudio {
                        sample_rate: waveform.format.sample_rate(),
                        channels: waveform.format.channel_count(),
                        samples: Arc::clone(&waveform.samples),
                    },
                );
            }
        }
        sources
    }
}
