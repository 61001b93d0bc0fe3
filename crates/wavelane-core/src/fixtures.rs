use std::f32::consts::TAU;

use crate::{
    channel::ChannelLayout,
    format::{DEFAULT_SAMPLE_RATE, SampleEncoding, SampleFormat},
    model::{DocumentId, SourceRef, TrackId, TrackKind},
    session::{AddClipRequest, Session, SessionError},
};

/// Ids of everything [`build_demo_session`] creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSession {
    pub multitrack: DocumentId,
    pub tone: DocumentId,
    pub vocal_track: TrackId,
    pub music_track: TrackId,
    pub bus_track: TrackId,
}

/// `seconds` of a stereo sine tone, left at `hz` and right an octave up.
#[must_use]
pub fn demo_tone(sample_rate: u32, seconds: u32, hz: f32) -> Vec<f32> {
    let frames = sample_rate as usize * seconds as usize;
    let mut samples = Vec::with_capacity(frames * 2);
    for frame in 0..frames {
        let phase = frame as f32 / sample_rate as f32;
        samples.push((phase * hz * TAU).sin() * 0.25);
        samples.push((phase * hz * 2.0 * TAU).sin() * 0.25);
    }
    samples
}

/// Opens a tone waveform and a small multitrack mix that plays it.
pub fn build_demo_session(session: &Session) -> Result<DemoSession, SessionError> {
    let format = SampleFormat::new(DEFAULT_SAMPLE_RATE, SampleEncoding::I16, ChannelLayout::stereo())?;
    let tone = session.new_waveform("Demo Tone", format, 0)?;
    session.write_frames(tone, 0, &demo_tone(DEFAULT_SAMPLE_RATE, 2, 220.0))?;

    let multitrack = session.new_multitrack("Demo Mix", DEFAULT_SAMPLE_RATE, ChannelLayout::stereo())?;
    let vocal_track = session.add_track(multitrack, ChannelLayout::mono(), TrackKind::Clip, "Vocal")?;
    let music_track =
        session.add_track(multitrack, ChannelLayout::stereo(), TrackKind::Clip, "Music")?;
    let bus_track = session.add_track(multitrack, ChannelLayout::stereo(), TrackKind::Bus, "FX Bus")?;

    session.add_clip(
        multitrack,
        vocal_track,
        AddClipRequest {
            source: SourceRef::document(tone),
            routing: vec![0],
            start: u64::from(DEFAULT_SAMPLE_RATE / 2),
            duration: Some(u64::from(DEFAULT_SAMPLE_RATE)),
            name: Some("Vocal take".to_string()),
        },
    )?;
    session.add_clip(
        multitrack,
        music_track,
        AddClipRequest {
            source: SourceRef::document(tone),
            routing: vec![0, 1],
            start: 0,
            duration: None,
            name: Some("Bed".to_string()),
        },
    )?;
    session.add_marker(multitrack, 0, 0, "Intro", "cue", "")?;
    session.add_marker(
        multitrack,
        u64::from(DEFAULT_SAMPLE_RATE),
        u64::from(DEFAULT_SAMPLE_RATE / 2),
        "Hook",
        "subclip",
        "chorus entry",
    )?;
    session.set_metadata(multitrack, "artist", "Wavelane")?;

    Ok(DemoSession {
        multitrack,
        tone,
        vocal_track,
        music_track,
        bus_track,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;

    #[test]
    fn demo_session_is_mixable() {
        let session = Session::new(SessionOptions::default());
        let demo = build_demo_session(&session).expect("demo");

        let tracks = session.tracks(demo.multitrack).expect("tracks");
        assert_eq!(tracks.len(), 4);
        assert_eq!(session.clip_tracks(demo.multitrack).expect("clip tracks").len(), 2);
        assert_eq!(session.markers(demo.multitrack).expect("markers").len(), 2);
        assert_eq!(
            session.duration(demo.multitrack).expect("duration"),
            u64::from(DEFAULT_SAMPLE_RATE) * 2
        );
        assert!(session.is_dirty(demo.multitrack).expect("dirty"));
    }
}
