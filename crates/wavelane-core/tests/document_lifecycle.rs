use std::path::Path;

use crossbeam_channel::Receiver;
use wavelane_core::{
    AddClipRequest, ChannelLayout, CloseMode, DocumentKind, Event, EventKind,
    MarkerKind, PannerSettings, SampleEncoding, SampleFormat, Session, SessionError,
    SessionOptions, SourceRef, TrackKind,
};

fn stereo_format() -> SampleFormat {
    SampleFormat::new(48_000, SampleEncoding::I16, ChannelLayout::stereo()).expect("valid format")
}

fn drain(events: &Receiver<Event>) -> Vec<Event> {
    events.try_iter().collect()
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|event| event.kind.name()).collect()
}

fn write_test_wav(path: &Path, frames: usize) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for frame in 0..frames {
        let value = ((frame % 200) as i16 - 100) * 100;
        writer.write_sample(value).expect("left sample");
        writer.write_sample(-value).expect("right sample");
    }
    writer.finalize().expect("finalize wav");
}

#[test]
fn new_documents_are_announced_then_activated() {
    let session = Session::new(SessionOptions::default());
    let events = session.subscribe();

    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    let published = drain(&events);
    assert_eq!(kinds(&published), vec!["new", "activated"]);
    assert_eq!(
        published[0].kind,
        EventKind::New { user_created: true }
    );
    assert!(published.iter().all(|event| event.document_id == id));
    assert!(published[0].sequence < published[1].sequence);
    assert_eq!(session.active_document(), Some(id));
    assert!(!session.is_dirty(id).expect("dirty"));
}

#[test]
fn dirty_is_announced_once_per_flip() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    let events = session.subscribe();

    let first = session
        .add_track(id, ChannelLayout::stereo(), TrackKind::Clip, "Drums")
        .expect("track");
    session
        .add_track(id, ChannelLayout::mono(), TrackKind::Clip, "Bass")
        .expect("track");

    let published = drain(&events);
    assert_eq!(
        kinds(&published),
        vec!["track_added", "dirty_changed", "track_added"]
    );
    assert_eq!(
        published[0].kind,
        EventKind::TrackAdded {
            track_id: first,
            name: "Drums".to_string()
        }
    );
    assert_eq!(published[1].kind, EventKind::DirtyChanged { dirty: true });

    session.set_dirty(id, false).expect("clear dirty");
    assert_eq!(
        drain(&events).last().map(|event| event.kind.clone()),
        Some(EventKind::DirtyChanged { dirty: false })
    );
}

#[test]
fn selection_and_playhead_do_not_dirty() {
    let session = Session::new(SessionOptions::default());
    let source = session
        .new_waveform("Source", stereo_format(), 1_000)
        .expect("source");
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    let track_id = session
        .add_track(id, ChannelLayout::stereo(), TrackKind::Clip, "Music")
        .expect("track");
    let clip_id = session
        .add_clip(
            id,
            track_id,
            AddClipRequest {
                source: SourceRef::document(source),
                routing: vec![0, 1],
                start: 0,
                duration: None,
                name: Some("Bed".to_string()),
            },
        )
        .expect("clip");
    session.set_dirty(id, false).expect("clean");
    let events = session.subscribe();

    assert!(session.select_clip(id, clip_id).expect("select"));
    assert!(!session.select_clip(id, clip_id).expect("already selected"));
    assert!(session.select_track(id, track_id, true).expect("select track"));
    session.set_playhead(id, 500).expect("playhead");
    assert_eq!(session.selected_clips(id).expect("selection"), vec![clip_id]);
    assert_eq!(session.clear_clip_selection(id).expect("clear"), 1);

    assert_eq!(
        kinds(&drain(&events)),
        vec!["clip_selection", "track_selection", "clip_selection"]
    );
    assert!(!session.is_dirty(id).expect("dirty"));
    assert_eq!(session.document(id).expect("document").playhead, 500);
}

#[test]
fn closing_twice_reports_a_stale_reference() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    let events = session.subscribe();

    session.close(id, CloseMode::Normal).expect("clean close");
    assert_eq!(kinds(&drain(&events)), vec!["closed"]);
    assert!(!session.is_open(id));
    assert!(matches!(
        session.close(id, CloseMode::Force),
        Err(SessionError::StaleReference(_))
    ));
    assert!(matches!(
        session.add_track(id, ChannelLayout::mono(), TrackKind::Clip, "Late"),
        Err(SessionError::StaleReference(_))
    ));
    assert_eq!(session.active_document(), None);
}

#[test]
fn unsaved_documents_need_a_forced_close() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    session
        .add_track(id, ChannelLayout::stereo(), TrackKind::Bus, "Reverb")
        .expect("bus");

    assert_eq!(
        session.close(id, CloseMode::Normal),
        Err(SessionError::UnsavedChanges(id))
    );
    assert!(session.is_open(id));
    session.close(id, CloseMode::Force).expect("forced close");
    assert!(!session.is_open(id));
}

#[test]
fn closing_the_active_document_promotes_the_last_activated() {
    let session = Session::new(SessionOptions::default());
    let first = session
        .new_multitrack("First", 48_000, ChannelLayout::stereo())
        .expect("first");
    let second = session
        .new_waveform("Second", stereo_format(), 10)
        .expect("second");
    let third = session
        .new_multitrack("Third", 48_000, ChannelLayout::stereo())
        .expect("third");
    session.activate(first).expect("activate first");
    assert_eq!(session.active_document(), Some(first));

    let events = session.subscribe();
    session.close(first, CloseMode::Normal).expect("close first");
    let published = drain(&events);
    assert_eq!(kinds(&published), vec!["closed", "activated"]);
    assert_eq!(published[1].document_id, third);
    assert_eq!(session.active_document(), Some(third));

    session.close(second, CloseMode::Normal).expect("close inactive");
    assert_eq!(session.active_document(), Some(third));
    session.close(third, CloseMode::Normal).expect("close last");
    assert_eq!(session.active_document(), None);
}

#[test]
fn closing_a_compound_closes_its_sub_documents() {
    let session = Session::new(SessionOptions::default());
    let compound = session.new_compound("Video").expect("compound");
    let audio = session
        .new_waveform("Audio", stereo_format(), 100)
        .expect("audio");
    session
        .attach_sub_document(compound, audio)
        .expect("attach");
    assert!(session
        .document(audio)
        .expect("audio")
        .is_compound_sub_document());

    let other = session.new_compound("Other").expect("other compound");
    assert_eq!(
        session.attach_sub_document(other, audio),
        Err(SessionError::AlreadyAttached(audio))
    );

    session.close(compound, CloseMode::Normal).expect("close compound");
    assert!(!session.is_open(compound));
    assert!(!session.is_open(audio));
    assert!(session.is_open(other));
}

#[test]
fn compound_close_is_all_or_nothing() {
    let session = Session::new(SessionOptions::default());
    let compound = session.new_compound("Video").expect("compound");
    let clean = session
        .new_waveform("Clean", stereo_format(), 10)
        .expect("clean audio");
    let edited = session
        .new_waveform("Edited", stereo_format(), 10)
        .expect("edited audio");
    session.attach_sub_document(compound, clean).expect("attach clean");
    session.attach_sub_document(compound, edited).expect("attach edited");
    session
        .write_frames(edited, 0, &[0.25, -0.25])
        .expect("edit audio");
    let events = session.subscribe();

    assert_eq!(
        session.close(compound, CloseMode::Normal),
        Err(SessionError::UnsavedChanges(edited))
    );
    assert!(session.is_open(compound));
    assert!(session.is_open(clean));
    assert!(session.is_open(edited));
    assert!(drain(&events).is_empty());
    assert_eq!(session.active_document(), Some(edited));

    session.close(compound, CloseMode::Force).expect("forced close");
    assert!(session.documents().is_empty());
    assert_eq!(kinds(&drain(&events)), vec!["closed", "closed", "closed"]);
    assert_eq!(session.active_document(), None);
}

#[test]
fn closing_a_compound_promotes_past_its_sub_documents() {
    let session = Session::new(SessionOptions::default());
    let mix = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    let compound = session.new_compound("Video").expect("compound");
    let audio = session
        .new_waveform("Audio", stereo_format(), 10)
        .expect("audio");
    session.attach_sub_document(compound, audio).expect("attach");
    assert_eq!(session.active_document(), Some(audio));
    let events = session.subscribe();

    session.close(compound, CloseMode::Normal).expect("close compound");
    let published = drain(&events);
    assert_eq!(kinds(&published), vec!["closed", "closed", "activated"]);
    assert_eq!(published[0].document_id, audio);
    assert_eq!(published[1].document_id, compound);
    assert_eq!(published[2].document_id, mix);
    assert_eq!(session.active_document(), Some(mix));
}

#[test]
fn oversized_waveform_writes_are_refused() {
    let session = Session::new(SessionOptions::default());
    let take = session
        .new_waveform("Take", stereo_format(), 10)
        .expect("waveform");

    assert_eq!(
        session.write_frames(take, u64::MAX, &[0.1, 0.1]),
        Err(SessionError::WaveformTooLong { frames: u64::MAX })
    );
    assert_eq!(
        session.write_frames(take, u64::MAX / 4, &[0.1, 0.1]),
        Err(SessionError::WaveformTooLong {
            frames: u64::MAX / 4 + 1
        })
    );
    assert_eq!(
        session.new_waveform("Huge", stereo_format(), u64::MAX / 4),
        Err(SessionError::WaveformTooLong {
            frames: u64::MAX / 4
        })
    );
    assert_eq!(session.duration(take), Ok(10));
    assert_eq!(session.is_dirty(take), Ok(false));

    session
        .write_frames(take, 12, &[0.1, 0.1])
        .expect("growing a little is fine");
    assert_eq!(session.duration(take), Ok(13));
}

#[test]
fn busy_waveforms_reject_structural_edits() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_waveform("Take", stereo_format(), 100)
        .expect("waveform");
    let events = session.subscribe();

    session.begin_busy(id).expect("busy");
    assert_eq!(session.begin_busy(id), Err(SessionError::Busy(id)));
    assert_eq!(
        session.write_frames(id, 0, &[0.5, 0.5]),
        Err(SessionError::Busy(id))
    );
    assert_eq!(
        session.add_marker(id, 0, 0, "Start", "cue", ""),
        Err(SessionError::Busy(id))
    );
    assert_eq!(session.close(id, CloseMode::Force), Err(SessionError::Busy(id)));
    session.set_playhead(id, 50).expect("playhead while busy");
    session.set_busy_progress(id, 40).expect("progress");
    session.end_busy(id).expect("idle");

    session
        .write_frames(id, 0, &[0.5, 0.5])
        .expect("writable again");
    assert_eq!(
        drain(&events)
            .into_iter()
            .filter_map(|event| match event.kind {
                EventKind::BusyChanged { progress, .. } => Some(progress),
                _ => None,
            })
            .collect::<Vec<_>>(),
        vec![Some(0), Some(40), None]
    );
}

#[test]
fn marker_types_are_checked_by_name() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");

    assert_eq!(
        session.add_marker(id, 0, 0, "Intro", "chapter", ""),
        Err(SessionError::InvalidMarkerType("chapter".to_string()))
    );
    assert!(session.markers(id).expect("markers").is_empty());

    session
        .add_marker(id, 9_600, 0, "Verse", "Track", "")
        .expect("track marker");
    session
        .add_marker(id, 4_800, 2_400, "Hook", "SUBCLIP", "loop me")
        .expect("subclip marker");
    let markers = session.markers(id).expect("markers");
    assert_eq!(
        markers
            .iter()
            .map(|marker| (marker.start, marker.kind))
            .collect::<Vec<_>>(),
        vec![(4_800, MarkerKind::Subclip), (9_600, MarkerKind::Track)]
    );

    let compound = session.new_compound("Video").expect("compound");
    assert_eq!(
        session.add_marker(compound, 0, 0, "Cut", "cue", ""),
        Err(SessionError::WrongDocumentKind {
            expected: DocumentKind::Multitrack,
            actual: DocumentKind::Compound
        })
    );
}

#[test]
fn opening_an_open_path_returns_the_same_document() {
    let temp = tempfile::tempdir().expect("temp dir");
    let path = temp.path().join("take.wav");
    write_test_wav(&path, 441);

    let session = Session::new(SessionOptions::default());
    let first = session.open(&path).expect("open");
    let other = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");
    assert_eq!(session.active_document(), Some(other));

    let second = session.open(&path).expect("open again");
    assert_eq!(first, second);
    assert_eq!(session.active_document(), Some(first));
    assert_eq!(session.documents().len(), 2);

    let document = session.document(first).expect("document");
    assert_eq!(document.display_name, "take");
    assert_eq!(document.sample_rate(), Some(44_100));
    assert_eq!(document.channel_count(), Some(2));
    assert_eq!(document.duration(), 441);
    assert!(!document.dirty);
    assert_eq!(session.find_by_path(&path), Some(first));
}

#[test]
fn unknown_extensions_and_missing_files_fail_to_open() {
    let temp = tempfile::tempdir().expect("temp dir");
    let session = Session::new(SessionOptions::default());
    assert!(matches!(
        session.open(&temp.path().join("notes.txt")),
        Err(SessionError::Io(_))
    ));
    assert!(matches!(
        session.open(&temp.path().join("missing.wav")),
        Err(SessionError::Io(_))
    ));
    assert!(session.documents().is_empty());
    assert_eq!(session.active_document(), None);
}

#[test]
fn unchanged_metadata_and_panner_leave_documents_clean() {
    let session = Session::new(SessionOptions::default());
    let id = session
        .new_multitrack("Mix", 48_000, ChannelLayout::stereo())
        .expect("multitrack");

    session
        .set_panner(id, PannerSettings::default())
        .expect("same panner");
    assert!(!session.is_dirty(id).expect("dirty"));

    session
        .set_panner(id, PannerSettings::LogarithmicCut)
        .expect("new panner");
    assert!(session.is_dirty(id).expect("dirty"));
    assert_eq!(
        session.document(id).expect("document").multitrack().map(|mix| mix.panner),
        Some(PannerSettings::LogarithmicCut)
    );

    session.set_dirty(id, false).expect("clean");
    session.set_metadata(id, "genre", "ambient").expect("metadata");
    assert!(session.is_dirty(id).expect("dirty"));
    session.set_dirty(id, false).expect("clean");
    session.set_metadata(id, "genre", "ambient").expect("same metadata");
    assert!(!session.is_dirty(id).expect("dirty"));
}
