use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::format::{ChannelFormat, FileFormat, SampleFormat};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Track id, unique within its document and never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClipId(pub Uuid);

impl ClipId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Cue,
    Track,
    Cart,
    Subclip,
}

impl MarkerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cue => "cue",
            Self::Track => "track",
            Self::Cart => "cart",
            Self::Subclip => "subclip",
        }
    }
}

impl FromStr for MarkerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cue" => Ok(Self::Cue),
            "track" => Ok(Self::Track),
            "cart" => Ok(Self::Cart),
            "subclip" => Ok(Self::Subclip),
            _ => Err(value.to_string()),
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Marker {
    pub start: u64,
    pub length: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub kind: MarkerKind,
}

/// Non-owning link from a clip to the document supplying its audio. Resolved
/// against the open documents on every access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub document_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Clip {
    pub id: ClipId,
    pub name: String,
    pub start: u64,
    pub duration: u64,
    pub source: SourceRef,
    pub source_channel_routing: Vec<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub selected: bool,
}

impl Clip {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.duration)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.source_channel_routing.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Clip,
    Bus,
    Master,
}

impl TrackKind {
    /// Position in the mixed enumeration: clip tracks, bus tracks, master.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Clip => 0,
            Self::Bus => 1,
            Self::Master => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub id: TrackId,
    kind: TrackKind,
    pub name: String,
    pub format: ChannelFormat,
    pub mute: bool,
    pub solo: bool,
    pub armed: bool,
    pub visible: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub selected: bool,
    pub clips: Vec<Clip>,
}

impl Track {
    #[must_use]
    pub fn new(id: TrackId, kind: TrackKind, name: impl Into<String>, format: ChannelFormat) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            format,
            mute: false,
            solo: false,
            armed: false,
            visible: true,
            selected: false,
            clips: Vec::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.format.channel_count()
    }

    #[must_use]
    pub fn clip(&self, clip_id: ClipId) -> Option<&Clip> {
        self.clips.iter().find(|clip| clip.id == clip_id)
    }

    #[must_use]
    pub fn selected_clip_ids(&self) -> Vec<ClipId> {
        self.clips
            .iter()
            .filter(|clip| clip.selected)
            .map(|clip| clip.id)
            .collect()
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.clips.iter().map(Clip::end).max().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum PannerSettings {
    MinusXdBCenter { gain_db: f32 },
    LogarithmicCut,
}

impl Default for PannerSettings {
    fn default() -> Self {
        Self::MinusXdBCenter { gain_db: -3.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Multitrack {
    pub sample_rate: u32,
    pub tracks: Vec<Track>,
    pub panner: PannerSettings,
    pub next_track_id: u32,
}

impl Multitrack {
    #[must_use]
    pub fn master(&self) -> Option<&Track> {
        self.tracks
            .iter()
            .find(|track| track.kind() == TrackKind::Master)
    }

    #[must_use]
    pub fn track(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == track_id)
    }

    pub fn track_mut(&mut self, track_id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|track| track.id == track_id)
    }

    /// Index of the track and of the clip within it.
    #[must_use]
    pub fn locate_clip(&self, clip_id: ClipId) -> Option<(usize, usize)> {
        self.tracks.iter().enumerate().find_map(|(track_index, track)| {
            track
                .clips
                .iter()
                .position(|clip| clip.id == clip_id)
                .map(|clip_index| (track_index, clip_index))
        })
    }

    #[must_use]
    pub fn clip(&self, clip_id: ClipId) -> Option<(&Track, &Clip)> {
        self.locate_clip(clip_id).map(|(track_index, clip_index)| {
            let track = &self.tracks[track_index];
            (track, &track.clips[clip_index])
        })
    }

    pub fn allocate_track_id(&mut self) -> TrackId {
        let id = TrackId(self.next_track_id);
        self.next_track_id = self.next_track_id.saturating_add(1);
        id
    }

    /// Inserts keeping clip tracks first, then bus tracks, then master.
    pub fn insert_track(&mut self, track: Track) -> usize {
        let rank = track.kind().rank();
        let index = self
            .tracks
            .iter()
            .position(|existing| existing.kind().rank() > rank)
            .unwrap_or(self.tracks.len());
        self.tracks.insert(index, track);
        index
    }

    #[must_use]
    pub fn clip_count(&self) -> usize {
        self.tracks.iter().map(|track| track.clips.len()).sum()
    }

    #[must_use]
    pub fn duration(&self) -> u64 {
        self.tracks.iter().map(Track::end).max().unwrap_or_default()
    }

    pub fn clips(&self) -> impl Iterator<Item = (&Track, &Clip)> {
        self.tracks
            .iter()
            .flat_map(|track| track.clips.iter().map(move |clip| (track, clip)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub format: SampleFormat,
    pub file_format: FileFormat,
    /// Interleaved samples in -1.0..=1.0.
    pub samples: Arc<Vec<f32>>,
    pub busy_progress: Option<u8>,
}

impl Waveform {
    #[must_use]
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.format.channel_count().max(1)) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Compound {
    pub sub_documents: Vec<DocumentId>,
    pub has_audio: bool,
    pub has_video: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentBody {
    Multitrack(Multitrack),
    Waveform(Waveform),
    Compound(Compound),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Multitrack,
    Waveform,
    Compound,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multitrack => f.write_str("multitrack"),
            Self::Waveform => f.write_str("waveform"),
            Self::Compound => f.write_str("compound"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Save,
    SaveAs,
    Export,
    ExportTemplate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Save => f.write_str("save"),
            Self::SaveAs => f.write_str("save_as"),
            Self::Export => f.write_str("export"),
            Self::ExportTemplate => f.write_str("export_template"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub display_name: String,
    pub path: Option<PathBuf>,
    pub dirty: bool,
    pub markers: Vec<Marker>,
    pub metadata: BTreeMap<String, String>,
    pub playhead: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_compound: Option<DocumentId>,
    pub body: DocumentBody,
    pub in_flight: Option<OperationKind>,
}

impl Document {
    #[must_use]
    pub fn new(display_name: impl Into<String>, body: DocumentBody) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            display_name: display_name.into(),
            path: None,
            dirty: false,
            markers: Vec::new(),
            metadata: BTreeMap::new(),
            playhead: 0,
            created_at: now,
            updated_at: now,
            parent_compound: None,
            body,
            in_flight: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn kind(&self) -> DocumentKind {
        match self.body {
            DocumentBody::Multitrack(_) => DocumentKind::Multitrack,
            DocumentBody::Waveform(_) => DocumentKind::Waveform,
            DocumentBody::Compound(_) => DocumentKind::Compound,
        }
    }

    /// Platform path, or an empty string if never persisted.
    #[must_use]
    pub fn path_string(&self) -> String {
        self.path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.busy_progress().is_some()
    }

    /// Progress of a long-running operation. Only waveform documents report one.
    #[must_use]
    pub fn busy_progress(&self) -> Option<u8> {
        match &self.body {
            DocumentBody::Waveform(waveform) => waveform.busy_progress,
            DocumentBody::Multitrack(_) | DocumentBody::Compound(_) => None,
        }
    }

    #[must_use]
    pub fn is_compound_sub_document(&self) -> bool {
        self.parent_compound.is_some()
    }

    #[must_use]
    pub fn multitrack(&self) -> Option<&Multitrack> {
        match &self.body {
            DocumentBody::Multitrack(multitrack) => Some(multitrack),
            DocumentBody::Waveform(_) | DocumentBody::Compound(_) => None,
        }
    }

    #[must_use]
    pub fn waveform(&self) -> Option<&Waveform> {
        match &self.body {
            DocumentBody::Waveform(waveform) => Some(waveform),
            DocumentBody::Multitrack(_) | DocumentBody::Compound(_) => None,
        }
    }

    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        match &self.body {
            DocumentBody::Multitrack(multitrack) => Some(multitrack.sample_rate),
            DocumentBody::Waveform(waveform) => Some(waveform.format.sample_rate()),
            DocumentBody::Compound(_) => None,
        }
    }

    /// Number of audio channels a clip can route from.
    #[must_use]
    pub fn channel_count(&self) -> Option<usize> {
        match &self.body {
            DocumentBody::Multitrack(multitrack) => multitrack.master().map(Track::channel_count),
            DocumentBody::Waveform(waveform) => Some(waveform.format.channel_count()),
            DocumentBody::Compound(_) => None,
        }
    }

    /// Duration in samples at the document's own rate.
    #[must_use]
    pub fn duration(&self) -> u64 {
        match &self.body {
            DocumentBody::Multitrack(multitrack) => multitrack.duration(),
            DocumentBody::Waveform(waveform) => waveform.frames(),
            DocumentBody::Compound(_) => 0,
        }
    }

    pub fn insert_marker(&mut self, marker: Marker) {
        let index = self
            .markers
            .iter()
            .position(|existing| existing.start > marker.start)
            .unwrap_or(self.markers.len());
        self.markers.insert(index, marker);
    }
}
