pub mod config;
pub mod spool;

use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};
use wavelane_core::{
    CloseMode, CommandDispatch, CommandRegistry, DocumentId, DocumentKind, EncodeJob,
    EncodePreset, FileFormat, SaveAsParameters, SaveParameters, Session, TrackId, TrackKind,
    TrackStatePatch, destination::with_format_extension,
};

use crate::{config::AppConfig, spool::SpoolEncodeQueue};

#[derive(Debug, Default)]
struct HostState {
    untitled_count: u32,
    focused_track: Option<(DocumentId, TrackId)>,
}

/// Shared state the registered commands act on.
struct HostContext {
    session: Arc<Session>,
    config: AppConfig,
    state: Mutex<HostState>,
    encoder: SpoolEncodeQueue,
}

impl HostContext {
    fn active(&self) -> Option<DocumentId> {
        self.session.active_document()
    }

    fn active_kind(&self) -> Option<DocumentKind> {
        let id = self.active()?;
        self.session.document(id).ok().map(|document| document.kind())
    }

    fn new_multitrack(&self) -> bool {
        let title = {
            let mut state = self.state.lock();
            state.untitled_count += 1;
            format!("{} {}", self.config.session.default_title, state.untitled_count)
        };
        match self.session.new_multitrack(
            title,
            self.config.session.default_sample_rate,
            self.config.default_layout(),
        ) {
            Ok(id) => {
                info!(document_id = %id, "multitrack created");
                true
            }
            Err(error) => {
                warn!(%error, "failed to create multitrack");
                false
            }
        }
    }

    fn save_active(&self) -> bool {
        let Some(id) = self.active() else {
            return false;
        };
        let Ok(document) = self.session.document(id) else {
            return false;
        };
        let started = if document.path.is_some() {
            self.session.save(id, SaveParameters::default())
        } else {
            let format = match document.kind() {
                DocumentKind::Waveform => FileFormat::WavePcm,
                _ => FileFormat::Session,
            };
            let path = with_format_extension(
                &self.config.paths.untitled_dir.join(&document.display_name),
                format,
            );
            self.session.save_as(id, path, SaveAsParameters::default())
        };
        match started {
            Ok(ticket) => {
                info!(document_id = %ticket.document_id(), operation = %ticket.operation(), "save started");
                true
            }
            Err(error) => {
                warn!(%error, "save not started");
                false
            }
        }
    }

    fn close_active(&self) -> bool {
        let Some(id) = self.active() else {
            return false;
        };
        match self.session.close(id, CloseMode::Normal) {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "close refused");
                false
            }
        }
    }

    fn add_track(&self) -> bool {
        let Some(id) = self.active() else {
            return false;
        };
        let name = self
            .session
            .clip_tracks(id)
            .map(|tracks| format!("Track {}", tracks.len() + 1))
            .unwrap_or_else(|_| "Track".to_string());
        match self
            .session
            .add_track(id, self.config.default_layout(), TrackKind::Clip, name)
        {
            Ok(track_id) => {
                self.state.lock().focused_track = Some((id, track_id));
                true
            }
            Err(error) => {
                warn!(%error, "track not added");
                false
            }
        }
    }

    /// The last added track of the active document, else its first clip track.
    fn focused_track(&self) -> Option<(DocumentId, TrackId)> {
        let id = self.active()?;
        let remembered = self.state.lock().focused_track;
        if let Some((document_id, track_id)) = remembered
            && document_id == id
            && self.session.track(id, track_id).is_ok()
        {
            return Some((id, track_id));
        }
        let first = self.session.clip_tracks(id).ok()?.into_iter().next()?;
        Some((id, first.id))
    }

    fn focused_track_muted(&self) -> bool {
        self.focused_track()
            .and_then(|(id, track_id)| self.session.track(id, track_id).ok())
            .is_some_and(|track| track.mute)
    }

    fn toggle_mute(&self) -> bool {
        let Some((id, track_id)) = self.focused_track() else {
            return false;
        };
        let patch = TrackStatePatch {
            mute: Some(!self.focused_track_muted()),
            ..TrackStatePatch::default()
        };
        match self.session.set_track_state(id, track_id, patch) {
            Ok(track) => {
                info!(track_id = %track.id, mute = track.mute, "mute toggled");
                true
            }
            Err(error) => {
                warn!(%error, "mute toggle failed");
                false
            }
        }
    }

    fn encode_master(&self) -> bool {
        let Some(id) = self.active() else {
            return false;
        };
        let Ok(document) = self.session.document(id) else {
            return false;
        };
        let job = EncodeJob {
            track_routing: Vec::new(),
            preset: EncodePreset {
                name: "master".to_string(),
                format: FileFormat::WavePcm,
            },
            temporary_files_dir: self
                .config
                .paths
                .encode_temp_dir
                .join(id.to_string()),
            output_path: with_format_extension(
                &self.config.export.encode_spool_dir.join(&document.display_name),
                FileFormat::WavePcm,
            ),
            range_start: 0,
            range_length: None,
        };
        match self.session.queue_encode(id, job, &self.encoder) {
            Ok(()) => true,
            Err(error) => {
                error!(%error, "encode not queued");
                false
            }
        }
    }
}

/// The application shell: one session plus the commands scripts and menus
/// dispatch against it.
pub struct Host {
    context: Arc<HostContext>,
    commands: CommandRegistry,
}

impl Host {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let session = Arc::new(Session::new(config.session_options()));
        let encoder = SpoolEncodeQueue::new(config.export.encode_spool_dir.clone());
        let context = Arc::new(HostContext {
            session,
            config,
            state: Mutex::new(HostState::default()),
            encoder,
        });
        let commands = register_commands(&context);
        Self { context, commands }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.context.session
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.context.config
    }

    #[must_use]
    pub fn command_ids(&self) -> Vec<&str> {
        self.commands.ids()
    }

    pub fn open(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        match self.context.session.open(&path) {
            Ok(_) => true,
            Err(error) => {
                warn!(path = %path.display(), %error, "open failed");
                false
            }
        }
    }
}

impl CommandDispatch for Host {
    #[instrument(skip(self))]
    fn invoke(&self, id: &str) -> bool {
        self.commands.invoke(id)
    }

    fn is_enabled(&self, id: &str) -> bool {
        self.commands.is_enabled(id)
    }

    fn is_checked(&self, id: &str) -> bool {
        self.commands.is_checked(id)
    }
}

fn register_commands(context: &Arc<HostContext>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    let ctx = Arc::clone(context);
    registry.register("file.new", move || ctx.new_multitrack());

    let (ctx, enabled) = (Arc::clone(context), Arc::clone(context));
    registry.register_with_state(
        "file.save",
        move || ctx.save_active(),
        move || enabled.active_kind().is_some_and(|kind| kind != DocumentKind::Compound),
        || false,
    );

    let (ctx, enabled) = (Arc::clone(context), Arc::clone(context));
    registry.register_with_state(
        "file.close",
        move || ctx.close_active(),
        move || enabled.active().is_some(),
        || false,
    );

    let (ctx, enabled) = (Arc::clone(context), Arc::clone(context));
    registry.register_with_state(
        "track.add",
        move || ctx.add_track(),
        move || enabled.active_kind() == Some(DocumentKind::Multitrack),
        || false,
    );

    let (ctx, enabled, checked) = (
        Arc::clone(context),
        Arc::clone(context),
        Arc::clone(context),
    );
    registry.register_with_state(
        "track.mute.toggle",
        move || ctx.toggle_mute(),
        move || enabled.focused_track().is_some(),
        move || checked.focused_track_muted(),
    );

    let (ctx, enabled) = (Arc::clone(context), Arc::clone(context));
    registry.register_with_state(
        "file.encode.master",
        move || ctx.encode_master(),
        move || enabled.active_kind() == Some(DocumentKind::Multitrack),
        || false,
    );

    registry
}
