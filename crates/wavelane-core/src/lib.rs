pub mod audio;
pub mod channel;
pub mod commands;
pub mod convert;
pub mod destination;
pub mod diagnostics;
pub mod encode;
pub mod events;
pub mod export;
pub mod fixtures;
pub mod format;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod session;
pub mod time;

pub use channel::{ChannelLabel, ChannelLayout, CommonLayout, LayoutError};
pub use commands::{CommandDispatch, CommandRegistry};
pub use convert::{DitherSettings, DitherType, SampleTypeConversion};
pub use diagnostics::{TelemetryGuard, init_tracing, init_tracing_with_options, spawn_event_logger};
pub use encode::{EncodeJob, EncodePreset, EncodeQueue, EncodeReporter, EncodeRequest};
pub use events::{Event, EventBus, EventKind};
pub use format::{
    ChannelFormat, DEFAULT_SAMPLE_RATE, FileFormat, FormatError, SESSION_EXTENSION,
    SampleEncoding, SampleFormat,
};
pub use model::{
    Clip, ClipId, Document, DocumentId, DocumentKind, Marker, MarkerKind, OperationKind,
    PannerSettings, SourceRef, Track, TrackId, TrackKind,
};
pub use pipeline::{
    ExportParameters, OperationTicket, ReferencedCopyParameters, ReferencedExportParameters,
    SaveAsParameters, SaveParameters, SaveResult, TemplateParameters, TrimParameters,
};
pub use session::{
    AddClipRequest, CloseMode, RoutingPolicy, Session, SessionError, SessionOptions, SourceInfo,
    TrackStatePatch,
};
