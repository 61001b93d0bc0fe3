use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use tracing::{debug, instrument, warn};

use crate::{
    format::{DEFAULT_SAMPLE_RATE, SampleEncoding},
    model::Marker,
    persistence::write_atomic,
};

pub const SIDECAR_SUFFIX: &str = "wlmeta.json";

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: usize,
    pub encoding: SampleEncoding,
    /// Interleaved frames.
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    #[must_use]
    pub fn frames(&self) -> u64 {
        (self.samples.len() / self.channels.max(1)) as u64
    }
}

/// Markers and metadata stored next to an audio file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Sidecar {
    #[serde(default)]
    pub markers: Vec<Marker>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[must_use]
pub fn sidecar_path(audio_path: &Path) -> PathBuf {
    let mut name = audio_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(SIDECAR_SUFFIX);
    audio_path.with_file_name(name)
}

#[instrument(fields(path = %audio_path.display()))]
pub fn read_sidecar(audio_path: &Path) -> Result<Option<Sidecar>> {
    let path = sidecar_path(audio_path);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes =
        fs::read(&path).with_context(|| format!("failed to read sidecar: {}", path.display()))?;
    match serde_json::from_slice::<Sidecar>(&bytes) {
        Ok(sidecar) => Ok(Some(sidecar)),
        Err(error) => {
            warn!(path = %path.display(), ?error, "ignoring unreadable sidecar");
            Ok(None)
        }
    }
}

#[instrument(skip(sidecar), fields(path = %audio_path.display(), markers = sidecar.markers.len()))]
pub fn write_sidecar(audio_path: &Path, sidecar: &Sidecar) -> Result<()> {
    let json = serde_json::to_vec_pretty(sidecar).context("failed to serialize sidecar")?;
    write_atomic(&sidecar_path(audio_path), &json)
}

/// Decodes every packet of the default track into interleaved `f32` frames.
#[instrument(fields(path = %path.display()))]
pub fn decode_audio_file(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path)
        .with_context(|| format!("failed to open audio file: {}", path.display()))?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|value| value.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default audio track found in {}", path.display()))?;
    let track_id = track.id;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let encoding = track
        .codec_params
        .bits_per_sample
        .and_then(|bits| SampleEncoding::from_bits(bits).ok())
        .unwrap_or(SampleEncoding::F32);
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let mut channels = track
        .codec_params
        .channels
        .map_or(2, |value| value.count());
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(error)) if error.kind() == ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                return Err(anyhow::anyhow!(
                    "audio stream reset required for {}",
                    path.display()
                ));
            }
            Err(error) => return Err(error.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => {
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if samples.is_empty() {
        return Err(anyhow::anyhow!(
            "decoded zero samples from {}",
            path.display()
        ));
    }

    debug!(
        sample_rate,
        channels,
        total_frames = samples.len() / channels.max(1),
        "audio decode complete"
    );

    Ok(DecodedAudio {
        sample_rate,
        channels,
        encoding,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_sits_next_to_the_audio_file() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/take.wav")),
            PathBuf::from("/tmp/take.wav.wlmeta.json")
        );
    }

    #[test]
    fn missing_sidecar_reads_as_none() {
        let temp = tempfile::tempdir().expect("temp dir");
        let audio = temp.path().join("take.wav");
        assert_eq!(read_sidecar(&audio).expect("read"), None);

        let sidecar = Sidecar {
            markers: Vec::new(),
            metadata: BTreeMap::from([("artist".to_string(), "me".to_string())]),
        };
        write_sidecar(&audio, &sidecar).expect("write");
        assert_eq!(read_sidecar(&audio).expect("read"), Some(sidecar));
    }
}
