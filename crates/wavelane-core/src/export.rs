use std::{
    collections::HashMap,
    fs,
    io::{BufWriter, Seek, Write},
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    format::{FileFormat, SampleEncoding, SampleFormat},
    model::{DocumentId, Track, TrackKind},
    persistence::parent_dir,
    time::rescale_frames,
};

/// Decoded audio of an open document, ready to be read by clips.
#[derive(Debug, Clone)]
pub struct SourceAudio {
    pub sample_rate: u32,
    pub channels: usize,
    pub samples: Arc<Vec<f32>>,
}

impl SourceAudio {
    fn frames(&self) -> u64 {
        (self.samples.len() / self.channels.max(1)) as u64
    }
}

/// Interleaved samples a 32-bit float WAV data chunk can hold.
pub const MAX_RENDER_SAMPLES: usize = 1 << 30;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("rendering {frames} frames of {channels} channels exceeds the render limit")]
    TooLong { frames: u64, channels: usize },
}

/// Buffer length for `frames` frames of `channels` channels, if renderable.
pub fn render_len(frames: u64, channels: usize) -> Result<usize, RenderError> {
    usize::try_from(frames)
        .ok()
        .and_then(|frames| frames.checked_mul(channels.max(1)))
        .filter(|len| *len <= MAX_RENDER_SAMPLES)
        .ok_or(RenderError::TooLong { frames, channels })
}

/// Renders the frames `start..start + frames` of a track's clips through
/// their routing, interleaved at the track's own channel count.
pub fn render_track(
    track: &Track,
    session_rate: u32,
    start: u64,
    frames: u64,
    sources: &HashMap<DocumentId, SourceAudio>,
) -> Result<Vec<f32>, RenderError> {
    let channels = track.channel_count().max(1);
    let mut buffer = vec![0.0_f32; render_len(frames, channels)?];
    let range_end = start.saturating_add(frames);

    for clip in &track.clips {
        let first = clip.start.max(start);
        let last = clip.end().min(range_end);
        if first >= last {
            continue;
        }
        let Some(source) = sources.get(&clip.source.document_id) else {
            warn!(clip_id = %clip.id, source = %clip.source.document_id, "skipping clip with unresolved source");
            continue;
        };
        let source_frames = source.frames();
        for timeline_frame in first..last {
            let source_frame =
                rescale_frames(timeline_frame - clip.start, session_rate, source.sample_rate);
            if source_frame >= source_frames {
                break;
            }
            // Both fit: the buffer length was checked above and the source is in memory.
            let output_base = (timeline_frame - start) as usize * channels;
            let source_base = source_frame as usize * source.channels;
            for (channel, source_channel) in clip.source_channel_routing.iter().enumerate() {
                if channel >= channels {
                    break;
                }
                if let Some(sample) = source.samples.get(source_base + source_channel) {
                    buffer[output_base + channel] += *sample;
                }
            }
        }
    }
    Ok(buffer)
}

/// Folds or spreads interleaved audio onto another channel count.
#[must_use]
pub fn fold_channels(interleaved: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return interleaved.to_vec();
    }
    let mut output = vec![0.0_f32; interleaved.len() / from * to];
    for (frame, input) in interleaved.chunks_exact(from).enumerate() {
        let target = &mut output[frame * to..(frame + 1) * to];
        if from == 1 {
            target.fill(input[0]);
            continue;
        }
        for (channel, sample) in input.iter().enumerate() {
            target[channel % to] += *sample;
        }
    }
    output
}

/// Mixes every audible clip track down to `channels` channels over
/// `start..start + frames`.
#[instrument(skip(tracks, sources), fields(tracks = tracks.len(), channels, start, frames))]
pub fn render_mixdown(
    tracks: &[Track],
    session_rate: u32,
    channels: usize,
    start: u64,
    frames: u64,
    sources: &HashMap<DocumentId, SourceAudio>,
) -> Result<Vec<f32>, RenderError> {
    let audible: Vec<&Track> = tracks
        .iter()
        .filter(|track| track.kind() == TrackKind::Clip && !track.mute)
        .collect();
    let any_solo = audible.iter().any(|track| track.solo);
    let channels = channels.max(1);
    let mut mix = vec![0.0_f32; render_len(frames, channels)?];

    for track in audible.into_iter().filter(|track| !any_solo || track.solo) {
        let rendered = render_track(track, session_rate, start, frames, sources)?;
        let folded = fold_channels(&rendered, track.channel_count(), channels);
        for (output, sample) in mix.iter_mut().zip(folded) {
            *output += sample;
        }
    }
    debug!(samples = mix.len(), "mixdown rendered");
    Ok(mix)
}

fn encode_wav<W: Write + Seek>(
    writer: W,
    format: &SampleFormat,
    samples: &[f32],
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: u16::try_from(format.channel_count()).context("too many channels for wav")?,
        sample_rate: format.sample_rate(),
        bits_per_sample: format.encoding().bits(),
        sample_format: if format.encoding().is_float() {
            hound::SampleFormat::Float
        } else {
            hound::SampleFormat::Int
        },
    };
    let mut writer =
        hound::WavWriter::new(BufWriter::new(writer), spec).context("failed to start wav stream")?;

    let chunk_len = (samples.len() / 100).max(format.channel_count()).max(1);
    let chunks = samples.len().div_ceil(chunk_len).max(1);
    progress(0);
    for (index, chunk) in samples.chunks(chunk_len).enumerate() {
        for sample in chunk {
            let sample = sample.clamp(-1.0, 1.0);
            let written = match format.encoding() {
                SampleEncoding::U8 => writer.write_sample((sample * f32::from(i8::MAX)).round() as i8),
                SampleEncoding::I16 => {
                    writer.write_sample((sample * f32::from(i16::MAX)).round() as i16)
                }
                SampleEncoding::I24 => writer.write_sample((sample * 8_388_607.0).round() as i32),
                SampleEncoding::F32 => writer.write_sample(sample),
            };
            written.context("failed to write wav sample")?;
        }
        let percent = ((index + 1) * 100 / chunks).min(100);
        progress(u8::try_from(percent).unwrap_or(100));
    }

    writer.finalize().context("failed to finalize wav file")?;
    progress(100);
    Ok(())
}

/// Writes a WAV file through a temporary sibling, renaming it into place
/// once complete.
#[instrument(skip(samples, progress), fields(path = %path.display(), format = %format))]
pub fn write_wav(
    path: &Path,
    format: &SampleFormat,
    samples: &[f32],
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create wav output directory: {}", parent.display()))?;

    let mut temp_file =
        tempfile::NamedTempFile::new_in(&parent).context("failed to create temp wav file")?;
    encode_wav(temp_file.as_file_mut(), format, samples, progress)?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist wav file: {}", path.display()))?;

    info!("wav written");
    Ok(())
}

fn ffmpeg_codec_args(file_format: FileFormat, encoding: SampleEncoding) -> Result<Vec<&'static str>> {
    let pcm_big_endian = match encoding {
        SampleEncoding::U8 => "pcm_s8",
        SampleEncoding::I16 => "pcm_s16be",
        SampleEncoding::I24 => "pcm_s24be",
        SampleEncoding::F32 => "pcm_f32be",
    };
    let args = match file_format {
        FileFormat::Aiff | FileFormat::Au => vec!["-codec:a", pcm_big_endian],
        FileFormat::Caf => vec!["-codec:a", pcm_big_endian, "-f", "caf"],
        FileFormat::Flac => vec![
            "-codec:a",
            "flac",
            "-sample_fmt",
            if matches!(encoding, SampleEncoding::I24) { "s32" } else { "s16" },
        ],
        FileFormat::Mp3 => vec!["-codec:a", "libmp3lame", "-qscale:a", "2"],
        FileFormat::Mp2 => vec!["-codec:a", "mp2", "-b:a", "256k"],
        FileFormat::Aac => vec!["-codec:a", "aac", "-b:a", "256k"],
        FileFormat::Ogg => vec!["-codec:a", "libvorbis", "-qscale:a", "6"],
        FileFormat::Ape => {
            return Err(anyhow::anyhow!("no encoder available for {}", file_format.title()));
        }
        FileFormat::WavePcm | FileFormat::Session => {
            return Err(anyhow::anyhow!("{} is not transcoded", file_format.title()));
        }
    };
    Ok(args)
}

#[instrument(skip(samples, progress), fields(path = %path.display(), file_format = %file_format.id()))]
fn transcode(
    path: &Path,
    file_format: FileFormat,
    format: &SampleFormat,
    samples: &[f32],
    ffmpeg_binary: Option<&Path>,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    let codec_args = ffmpeg_codec_args(file_format, format.encoding())?;
    let ffmpeg = ffmpeg_binary.map_or_else(|| PathBuf::from("ffmpeg"), Path::to_path_buf);

    let temp_dir = tempfile::tempdir().context("failed to create temporary transcode directory")?;
    let temp_wav = temp_dir.path().join("wavelane_transcode.wav");
    write_wav(&temp_wav, format, samples, progress)?;

    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_else(|| file_format.primary_extension());
    let output = tempfile::Builder::new()
        .prefix(".wavelane-")
        .suffix(&format!(".{extension}"))
        .tempfile_in(&parent)
        .context("failed to create temporary output file")?;

    let status = Command::new(&ffmpeg)
        .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(&temp_wav)
        .args(codec_args)
        .arg(output.path())
        .status()
        .with_context(|| format!("failed to spawn ffmpeg: {}", ffmpeg.display()))?;

    if !status.success() {
        return Err(anyhow::anyhow!(
            "ffmpeg exited with status {status} while writing {}",
            file_format.title()
        ));
    }

    output
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist transcoded file: {}", path.display()))?;
    info!("transcode completed");
    Ok(())
}

/// Writes interleaved audio in the requested container, atomically.
pub fn write_audio(
    path: &Path,
    file_format: FileFormat,
    format: &SampleFormat,
    samples: &[f32],
    ffmpeg_binary: Option<&Path>,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    match file_format {
        FileFormat::WavePcm => write_wav(path, format, samples, progress),
        FileFormat::Session => Err(anyhow::anyhow!("audio cannot be written as a session file")),
        other => transcode(path, other, format, samples, ffmpeg_binary, progress),
    }
}
