use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use wavelane_core::{
    AddClipRequest, ChannelLayout, DEFAULT_SAMPLE_RATE, DocumentKind, EncodeJob, EncodePreset,
    EncodeQueue, EncodeReporter, EncodeRequest, EventKind, FileFormat, SampleEncoding,
    SampleFormat, Session, SessionError, SessionOptions, SourceRef, TrackId, TrackKind,
    fixtures::build_demo_session, persistence,
};

/// Records every request and answers synchronously.
#[derive(Default)]
struct RecordingQueue {
    reject: bool,
    requests: Mutex<Vec<EncodeRequest>>,
}

impl EncodeQueue for RecordingQueue {
    fn submit(&self, request: EncodeRequest, reporter: EncodeReporter) {
        if self.reject {
            reporter.failed("encoder offline");
        } else {
            reporter.queued(format!("{} accepted", request.preset.name));
        }
        self.requests.lock().push(request);
    }
}

fn job(root: &Path, track_routing: Vec<Option<TrackId>>) -> EncodeJob {
    EncodeJob {
        track_routing,
        preset: EncodePreset {
            name: "broadcast".to_string(),
            format: FileFormat::Mp3,
        },
        temporary_files_dir: root.join("work"),
        output_path: root.join("out").join("episode.mp3"),
        range_start: 0,
        range_length: None,
    }
}

fn frames_and_channels(path: &Path) -> (u32, u16) {
    let reader = hound::WavReader::open(path).expect("intermediate is a wav file");
    (reader.duration(), reader.spec().channels)
}

#[test]
fn master_mix_is_rendered_when_nothing_is_routed() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Arc::new(Session::new(SessionOptions::default()));
    let demo = build_demo_session(&session).expect("demo");
    let events = session.subscribe();
    let queue = RecordingQueue::default();

    let mut master_job = job(temp.path(), Vec::new());
    master_job.range_start = u64::from(DEFAULT_SAMPLE_RATE);
    session
        .queue_encode(demo.multitrack, master_job, &queue)
        .expect("encode handed off");

    let requests = queue.requests.lock();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.document_id, demo.multitrack);
    assert_eq!(
        request.range,
        (u64::from(DEFAULT_SAMPLE_RATE), u64::from(DEFAULT_SAMPLE_RATE))
    );
    assert_eq!(request.intermediate_files.len(), 1);
    let master = request.intermediate_files[0]
        .as_deref()
        .expect("master intermediate");
    assert_eq!(master.file_name().and_then(|name| name.to_str()), Some("master.wav"));
    assert_eq!(frames_and_channels(master), (DEFAULT_SAMPLE_RATE, 2));

    let project = persistence::load_session(&request.project_file).expect("project file");
    assert_eq!(project.tracks.len(), 4);
    assert_eq!(
        request.project_file.file_stem().and_then(|stem| stem.to_str()),
        Some("episode")
    );

    let event = events.try_recv().expect("queued event");
    assert_eq!(
        event.kind,
        EventKind::EncodeQueued {
            message: "broadcast accepted".to_string()
        }
    );
    assert_eq!(PathBuf::from(&event.path), request.output_path);
    assert!(session.is_dirty(demo.multitrack).expect("dirty"));
}

#[test]
fn routed_tracks_render_one_intermediate_each() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Arc::new(Session::new(SessionOptions::default()));
    let demo = build_demo_session(&session).expect("demo");
    let queue = RecordingQueue::default();

    let mut stems = job(
        temp.path(),
        vec![Some(demo.vocal_track), None, Some(demo.music_track)],
    );
    stems.range_start = u64::from(DEFAULT_SAMPLE_RATE / 2);
    stems.range_length = Some(u64::from(DEFAULT_SAMPLE_RATE / 2));
    session
        .queue_encode(demo.multitrack, stems, &queue)
        .expect("encode handed off");

    let requests = queue.requests.lock();
    let files = &requests[0].intermediate_files;
    assert_eq!(files.len(), 3);
    assert!(files[1].is_none());

    let vocal = files[0].as_deref().expect("vocal stem");
    assert_eq!(frames_and_channels(vocal), (DEFAULT_SAMPLE_RATE / 2, 1));
    let mut reader = hound::WavReader::open(vocal).expect("vocal wav");
    assert!(reader
        .samples::<f32>()
        .map(|sample| sample.expect("sample"))
        .any(|sample| sample.abs() > 0.01));

    let music = files[2].as_deref().expect("music stem");
    assert_eq!(frames_and_channels(music), (DEFAULT_SAMPLE_RATE / 2, 2));
}

#[test]
fn rejected_encodes_arrive_as_failure_events() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Arc::new(Session::new(SessionOptions::default()));
    let demo = build_demo_session(&session).expect("demo");
    let events = session.subscribe();
    let queue = RecordingQueue {
        reject: true,
        ..RecordingQueue::default()
    };

    session
        .queue_encode(demo.multitrack, job(temp.path(), Vec::new()), &queue)
        .expect("hand-off itself succeeds");
    let kinds: Vec<EventKind> = events.try_iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::EncodeFailed {
            message: "encoder offline".to_string()
        }]
    );
}

#[test]
fn unknown_tracks_and_waveforms_are_refused() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Arc::new(Session::new(SessionOptions::default()));
    let demo = build_demo_session(&session).expect("demo");
    let queue = RecordingQueue::default();

    let error = session
        .queue_encode(
            demo.multitrack,
            job(temp.path(), vec![Some(TrackId(999))]),
            &queue,
        )
        .expect_err("track 999 does not exist");
    assert!(matches!(error, SessionError::StaleReference(_)));

    let take = session
        .new_waveform(
            "Take",
            SampleFormat::new(48_000, SampleEncoding::I16, ChannelLayout::stereo())
                .expect("valid format"),
            10,
        )
        .expect("waveform");
    assert_eq!(
        session.queue_encode(take, job(temp.path(), Vec::new()), &queue),
        Err(SessionError::WrongDocumentKind {
            expected: DocumentKind::Multitrack,
            actual: DocumentKind::Waveform
        })
    );
    assert!(queue.requests.lock().is_empty());
    assert!(!temp.path().join("work").exists());
}

#[test]
fn renders_too_long_for_an_intermediate_are_refused() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Arc::new(Session::new(SessionOptions::default()));
    let mix = session
        .new_multitrack("Far", DEFAULT_SAMPLE_RATE, ChannelLayout::stereo())
        .expect("multitrack");
    let take = session
        .new_waveform(
            "Take",
            SampleFormat::new(DEFAULT_SAMPLE_RATE, SampleEncoding::I16, ChannelLayout::mono())
                .expect("valid format"),
            10,
        )
        .expect("waveform");
    let track = session
        .add_track(mix, ChannelLayout::mono(), TrackKind::Clip, "Late")
        .expect("track");
    let start = u64::MAX / 4;
    session
        .add_clip(
            mix,
            track,
            AddClipRequest {
                source: SourceRef::document(take),
                routing: vec![0],
                start,
                duration: Some(10),
                name: None,
            },
        )
        .expect("a late clip is still a valid clip");
    let queue = RecordingQueue::default();

    assert_eq!(
        session.queue_encode(mix, job(temp.path(), Vec::new()), &queue),
        Err(SessionError::RenderTooLong {
            frames: start + 10,
            channels: 2
        })
    );
    assert_eq!(
        session.queue_encode(mix, job(temp.path(), vec![Some(track)]), &queue),
        Err(SessionError::RenderTooLong {
            frames: start + 10,
            channels: 1
        })
    );
    assert!(queue.requests.lock().is_empty());
    assert!(!temp.path().join("work").exists());

    let mut tail = job(temp.path(), vec![Some(track)]);
    tail.range_start = start;
    session
        .queue_encode(mix, tail, &queue)
        .expect("a window around the clip renders");
    let requests = queue.requests.lock();
    let stem = requests[0].intermediate_files[0]
        .as_deref()
        .expect("late stem");
    assert_eq!(frames_and_channels(stem), (10, 1));
}
