use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::{
    format::SESSION_EXTENSION,
    model::{Document, DocumentBody, Marker, Multitrack, PannerSettings, Track, TrackKind},
};

pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Serialized body of a multitrack session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFile {
    pub display_name: String,
    pub sample_rate: u32,
    #[serde(default)]
    pub panner: PannerSettings,
    pub next_track_id: u32,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub markers: Vec<Marker>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEnvelope {
    format_version: u32,
    checksum: String,
    session: serde_json::Value,
}

impl SessionFile {
    pub fn from_document(document: &Document) -> Result<Self> {
        let DocumentBody::Multitrack(multitrack) = &document.body else {
            return Err(anyhow::anyhow!(
                "{} document cannot be written as a session",
                document.kind()
            ));
        };
        Ok(Self {
            display_name: document.display_name.clone(),
            sample_rate: multitrack.sample_rate,
            panner: multitrack.panner,
            next_track_id: multitrack.next_track_id,
            tracks: multitrack.tracks.clone(),
            markers: document.markers.clone(),
            metadata: document.metadata.clone(),
            created_at: document.created_at,
            updated_at: document.updated_at,
        })
    }

    /// Checks the structural rules a live document relies on.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(anyhow::anyhow!("session sample rate must be positive"));
        }
        let masters = self
            .tracks
            .iter()
            .filter(|track| track.kind() == TrackKind::Master)
            .count();
        if masters != 1 {
            return Err(anyhow::anyhow!("session has {masters} master tracks"));
        }

        let mut track_ids = HashSet::new();
        let mut clip_ids = HashSet::new();
        for track in &self.tracks {
            if !track_ids.insert(track.id) {
                return Err(anyhow::anyhow!("duplicate track id {}", track.id));
            }
            if track.id.0 >= self.next_track_id {
                return Err(anyhow::anyhow!(
                    "track id {} is not below next id {}",
                    track.id,
                    self.next_track_id
                ));
            }
            for clip in &track.clips {
                if !clip_ids.insert(clip.id) {
                    return Err(anyhow::anyhow!("duplicate clip id {}", clip.id));
                }
                if clip.channel_count() != track.channel_count() {
                    return Err(anyhow::anyhow!(
                        "clip {} routes {} channels onto a {} channel track",
                        clip.id,
                        clip.channel_count(),
                        track.channel_count()
                    ));
                }
                if clip.duration == 0 {
                    return Err(anyhow::anyhow!("clip {} has zero duration", clip.id));
                }
            }
        }
        Ok(())
    }

    /// Builds a clean live document. Tracks are re-sorted into mixed order.
    #[must_use]
    pub fn into_document(self, path: Option<PathBuf>) -> Document {
        let mut multitrack = Multitrack {
            sample_rate: self.sample_rate,
            tracks: Vec::with_capacity(self.tracks.len()),
            panner: self.panner,
            next_track_id: self.next_track_id,
        };
        for track in self.tracks {
            multitrack.insert_track(track);
        }

        let mut document = Document::new(self.display_name, DocumentBody::Multitrack(multitrack));
        document.path = path;
        document.markers = self.markers;
        document.markers.sort_by_key(|marker| marker.start);
        document.metadata = self.metadata;
        document.created_at = self.created_at;
        document.updated_at = self.updated_at;
        document
    }

    /// Drops per-session state that a template should not carry.
    pub fn strip_for_template(&mut self, include_metadata: bool) {
        for track in &mut self.tracks {
            track.selected = false;
            for clip in &mut track.clips {
                clip.selected = false;
                clip.source.path = None;
            }
        }
        if !include_metadata {
            self.markers.clear();
            self.metadata.clear();
        }
    }
}

fn checksum(session: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_vec(session).context("failed to encode session body")?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("{digest:x}"))
}

pub fn encode_session(session: &SessionFile) -> Result<Vec<u8>> {
    let body = serde_json::to_value(session).context("failed to serialize session")?;
    let envelope = SessionEnvelope {
        format_version: SESSION_FORMAT_VERSION,
        checksum: checksum(&body)?,
        session: body,
    };
    serde_json::to_vec_pretty(&envelope).context("failed to serialize session envelope")
}

pub fn decode_session(bytes: &[u8]) -> Result<SessionFile> {
    let envelope: SessionEnvelope =
        serde_json::from_slice(bytes).context("invalid session json")?;
    if envelope.format_version > SESSION_FORMAT_VERSION {
        return Err(anyhow::anyhow!(
            "unsupported session format version {}",
            envelope.format_version
        ));
    }
    let expected = checksum(&envelope.session)?;
    if expected != envelope.checksum {
        return Err(anyhow::anyhow!("session checksum mismatch"));
    }
    let session: SessionFile =
        serde_json::from_value(envelope.session).context("invalid session body")?;
    session.validate()?;
    Ok(session)
}

#[must_use]
pub fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Writes bytes to a temporary sibling of `path` and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let mut temp_file =
        tempfile::NamedTempFile::new_in(&parent).context("failed to create temp file")?;
    temp_file
        .write_all(bytes)
        .context("failed to write temp file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist file: {}", path.display()))?;
    Ok(())
}

#[instrument(skip(session), fields(path = %path.display(), tracks = session.tracks.len()))]
pub fn save_session(path: &Path, session: &SessionFile) -> Result<()> {
    let bytes = encode_session(session)?;
    write_atomic(path, &bytes)?;
    info!("session saved");
    Ok(())
}

#[instrument(fields(path = %path.display()))]
pub fn load_session(path: &Path) -> Result<SessionFile> {
    let content =
        fs::read(path).with_context(|| format!("failed to read session: {}", path.display()))?;
    let session = decode_session(&content)
        .with_context(|| format!("failed to load session: {}", path.display()))?;
    info!(tracks = session.tracks.len(), "session loaded");
    Ok(session)
}

/// Folder that receives copies of referenced audio for a session at `path`.
#[must_use]
pub fn referenced_files_dir(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("session");
    parent_dir(path).join(format!("{stem}_files"))
}

/// Copies one referenced file into `directory`, keeping existing copies unless
/// `overwrite`. Returns the copy and whether it was written, or `None` when the
/// source is gone.
#[instrument(fields(source = %source_path.display(), directory = %directory.display(), overwrite))]
pub fn copy_referenced_file(
    source_path: &Path,
    directory: &Path,
    overwrite: bool,
) -> Result<Option<(PathBuf, bool)>> {
    let Some(file_name) = source_path.file_name() else {
        return Ok(None);
    };
    let destination = directory.join(file_name);
    if destination == source_path {
        return Ok(Some((destination, false)));
    }
    if !source_path.is_file() {
        warn!("referenced file missing, not copied");
        return Ok(None);
    }
    if destination.exists() && !overwrite {
        return Ok(Some((destination, false)));
    }
    fs::create_dir_all(directory).with_context(|| {
        format!("failed to create referenced files directory: {}", directory.display())
    })?;
    fs::copy(source_path, &destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source_path.display(),
            destination.display()
        )
    })?;
    debug!(destination = %destination.display(), "referenced file copied");
    Ok(Some((destination, true)))
}

#[must_use]
pub fn template_path(template_dir: &Path, name: &str) -> PathBuf {
    template_dir.join(format!("{name}.{SESSION_EXTENSION}"))
}

/// Names of the templates stored in `template_dir`, sorted.
#[instrument(fields(template_dir = %template_dir.display()))]
pub fn list_templates(template_dir: &Path) -> Result<Vec<String>> {
    if !template_dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in WalkDir::new(template_dir).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(?error, "ignoring unreadable entry while listing templates");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_session = path
            .extension()
            .and_then(|value| value.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case(SESSION_EXTENSION));
        if let (true, Some(stem)) = (is_session, path.file_stem().and_then(|stem| stem.to_str())) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    debug!(count = names.len(), "templates listed");
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::ChannelLayout, format::ChannelFormat, model::TrackId};

    fn session_file() -> SessionFile {
        let now = Utc::now();
        SessionFile {
            display_name: "Mix".to_string(),
            sample_rate: 48_000,
            panner: PannerSettings::default(),
            next_track_id: 2,
            tracks: vec![Track::new(
                TrackId(1),
                TrackKind::Master,
                "Master",
                ChannelFormat::new(ChannelLayout::stereo()),
            )],
            markers: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let session = session_file();
        let bytes = encode_session(&session).expect("encode");
        assert_eq!(decode_session(&bytes).expect("decode"), session);

        let tampered = String::from_utf8(bytes)
            .expect("utf8")
            .replace("\"Mix\"", "\"Other\"");
        let error = decode_session(tampered.as_bytes()).expect_err("checksum should fail");
        assert!(error.to_string().contains("checksum"));
    }

    #[test]
    fn sessions_without_master_are_rejected() {
        let mut session = session_file();
        session.tracks.clear();
        let bytes = encode_session(&session).expect("encode");
        assert!(decode_session(&bytes).is_err());
    }

    #[test]
    fn templates_are_listed_by_name() {
        let temp = tempfile::tempdir().expect("temp dir");
        save_session(&template_path(temp.path(), "podcast"), &session_file()).expect("save");
        save_session(&template_path(temp.path(), "band"), &session_file()).expect("save");
        fs::write(temp.path().join("notes.txt"), b"x").expect("write");

        assert_eq!(
            list_templates(temp.path()).expect("list"),
            vec!["band".to_string(), "podcast".to_string()]
        );
        assert!(list_templates(&temp.path().join("missing")).expect("list").is_empty());
    }

    #[test]
    fn referenced_copies_are_kept_unless_overwriting() {
        let temp = tempfile::tempdir().expect("temp dir");
        let source = temp.path().join("take.wav");
        fs::write(&source, b"first").expect("write source");
        let directory = referenced_files_dir(&temp.path().join("out/mix.wlsx"));
        assert_eq!(directory, temp.path().join("out/mix_files"));

        let copy = directory.join("take.wav");
        assert_eq!(
            copy_referenced_file(&source, &directory, false).expect("copy"),
            Some((copy.clone(), true))
        );
        fs::write(&source, b"second").expect("rewrite source");
        assert_eq!(
            copy_referenced_file(&source, &directory, false).expect("copy"),
            Some((copy.clone(), false))
        );
        assert_eq!(fs::read(&copy).expect("read copy"), b"first");
        assert_eq!(
            copy_referenced_file(&source, &directory, true).expect("copy"),
            Some((copy.clone(), true))
        );
        assert_eq!(fs::read(&copy).expect("read copy"), b"second");
        assert_eq!(
            copy_referenced_file(&temp.path().join("gone.wav"), &directory, true).expect("copy"),
            None
        );
    }
}
