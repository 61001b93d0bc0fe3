use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelLayout;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const SESSION_EXTENSION: &str = "wlsx";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(i64),
    #[error("invalid sample encoding: {0} bits")]
    InvalidEncoding(u32),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// 8 bit unsigned integer.
    U8,
    /// 16 bit signed integer, little endian.
    I16,
    /// 24 bit signed integer, little endian packed.
    I24,
    /// 32 bit float in -1.0..=1.0.
    F32,
}

impl SampleEncoding {
    pub const ALL: [Self; 4] = [Self::U8, Self::I16, Self::I24, Self::F32];

    #[must_use]
    pub const fn bits(self) -> u16 {
        match self {
            Self::U8 => 8,
            Self::I16 => 16,
            Self::I24 => 24,
            Self::F32 => 32,
        }
    }

    pub fn from_bits(bits: u32) -> Result<Self, FormatError> {
        match bits {
            8 => Ok(Self::U8),
            16 => Ok(Self::I16),
            24 => Ok(Self::I24),
            32 => Ok(Self::F32),
            other => Err(FormatError::InvalidEncoding(other)),
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => f.write_str("8-bit unsigned"),
            Self::I16 => f.write_str("16-bit signed"),
            Self::I24 => f.write_str("24-bit signed"),
            Self::F32 => f.write_str("32-bit float"),
        }
    }
}

/// Sample rate, encoding and channel layout of a piece of audio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "SampleFormatFields")]
pub struct SampleFormat {
    sample_rate: u32,
    encoding: SampleEncoding,
    layout: ChannelLayout,
}

#[derive(Deserialize)]
struct SampleFormatFields {
    sample_rate: u32,
    encoding: SampleEncoding,
    layout: ChannelLayout,
}

impl TryFrom<SampleFormatFields> for SampleFormat {
    type Error = FormatError;

    fn try_from(value: SampleFormatFields) -> Result<Self, Self::Error> {
        Self::new(value.sample_rate, value.encoding, value.layout)
    }
}

impl SampleFormat {
    pub fn new(
        sample_rate: u32,
        encoding: SampleEncoding,
        layout: ChannelLayout,
    ) -> Result<Self, FormatError> {
        if sample_rate == 0 {
            return Err(FormatError::InvalidSampleRate(0));
        }
        Ok(Self {
            sample_rate,
            encoding,
            layout,
        })
    }

    /// Builds a format from loosely typed script values.
    pub fn try_new(sample_rate: i64, bits: u32, layout: ChannelLayout) -> Result<Self, FormatError> {
        let rate = u32::try_from(sample_rate)
            .ok()
            .filter(|rate| *rate > 0)
            .ok_or(FormatError::InvalidSampleRate(sample_rate))?;
        Self::new(rate, SampleEncoding::from_bits(bits)?, layout)
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    #[must_use]
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.layout.channel_count()
    }

    #[must_use]
    pub fn channel_format(&self) -> ChannelFormat {
        ChannelFormat {
            encoding: self.encoding,
            layout: self.layout.clone(),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {}, {}",
            self.sample_rate,
            self.encoding,
            self.layout.description()
        )
    }
}

/// A track's format: everything of [`SampleFormat`] except the rate, which
/// tracks inherit from their session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelFormat {
    pub encoding: SampleEncoding,
    pub layout: ChannelLayout,
}

impl ChannelFormat {
    #[must_use]
    pub fn new(layout: ChannelLayout) -> Self {
        Self {
            encoding: SampleEncoding::F32,
            layout,
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.layout.channel_count()
    }

    pub fn with_rate(&self, sample_rate: u32) -> Result<SampleFormat, FormatError> {
        SampleFormat::new(sample_rate, self.encoding, self.layout.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateSupport {
    Range(u32, u32),
    List(&'static [u32]),
}

impl RateSupport {
    fn contains(self, rate: u32) -> bool {
        match self {
            Self::Range(min, max) => (min..=max).contains(&rate),
            Self::List(rates) => rates.contains(&rate),
        }
    }
}

const MPEG_LAYER3_RATES: &[u32] = &[
    8_000, 11_025, 12_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000,
];
const MPEG_LAYER2_RATES: &[u32] = &[16_000, 22_050, 24_000, 32_000, 44_100, 48_000];
const ALL_ENCODINGS: &[SampleEncoding] = &SampleEncoding::ALL;
const INTEGER_ENCODINGS: &[SampleEncoding] =
    &[SampleEncoding::U8, SampleEncoding::I16, SampleEncoding::I24];

/// Container/file formats a document can be written as.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    WavePcm,
    Aiff,
    Flac,
    Mp3,
    Mp2,
    Aac,
    Ogg,
    Caf,
    Au,
    Ape,
    Session,
}

impl FileFormat {
    pub const ALL: [Self; 11] = [
        Self::WavePcm,
        Self::Aiff,
        Self::Flac,
        Self::Mp3,
        Self::Mp2,
        Self::Aac,
        Self::Ogg,
        Self::Caf,
        Self::Au,
        Self::Ape,
        Self::Session,
    ];

    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::WavePcm => "wave_pcm",
            Self::Aiff => "aiff",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Mp2 => "mp2",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Caf => "caf",
            Self::Au => "au",
            Self::Ape => "ape",
            Self::Session => "session",
        }
    }

    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::WavePcm => "Wave PCM",
            Self::Aiff => "AIFF",
            Self::Flac => "FLAC (Free Lossless Audio Codec)",
            Self::Mp3 => "MP3 Audio",
            Self::Mp2 => "MP2 Audio",
            Self::Aac => "AAC Audio",
            Self::Ogg => "Xiph OGG Container",
            Self::Caf => "Apple Core Audio Format",
            Self::Au => "Sun AU",
            Self::Ape => "Monkey's Audio",
            Self::Session => "Wavelane Multitrack Session",
        }
    }

    #[must_use]
    pub const fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::WavePcm => &["wav", "bwf"],
            Self::Aiff => &["aif", "aiff", "aifc"],
            Self::Flac => &["flac"],
            Self::Mp3 => &["mp3"],
            Self::Mp2 => &["mp2", "mpa"],
            Self::Aac => &["aac", "m4a"],
            Self::Ogg => &["ogg"],
            Self::Caf => &["caf"],
            Self::Au => &["au", "snd"],
            Self::Ape => &["ape"],
            Self::Session => &[SESSION_EXTENSION],
        }
    }

    #[must_use]
    pub fn primary_extension(self) -> &'static str {
        self.extensions()[0]
    }

    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.id() == id)
    }

    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extensions().contains(&extension.as_str()))
    }

    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|value| value.to_str())
            .and_then(Self::from_extension)
    }

    #[must_use]
    pub fn accepts_extension(self, path: &Path) -> bool {
        path.extension()
            .and_then(|value| value.to_str())
            .is_some_and(|extension| {
                let extension = extension.to_ascii_lowercase();
                self.extensions().contains(&extension.as_str())
            })
    }

    #[must_use]
    pub const fn is_audio(self) -> bool {
        !matches!(self, Self::Session)
    }

    fn capabilities(self) -> (&'static [SampleEncoding], usize, RateSupport) {
        match self {
            Self::WavePcm | Self::Aiff | Self::Caf | Self::Au => {
                (ALL_ENCODINGS, 32, RateSupport::Range(1_000, 768_000))
            }
            Self::Flac => (INTEGER_ENCODINGS, 8, RateSupport::Range(1, 655_350)),
            Self::Mp3 => (ALL_ENCODINGS, 2, RateSupport::List(MPEG_LAYER3_RATES)),
            Self::Mp2 => (ALL_ENCODINGS, 2, RateSupport::List(MPEG_LAYER2_RATES)),
            Self::Aac => (ALL_ENCODINGS, 8, RateSupport::Range(8_000, 96_000)),
            Self::Ogg => (ALL_ENCODINGS, 8, RateSupport::Range(8_000, 192_000)),
            Self::Ape => (INTEGER_ENCODINGS, 2, RateSupport::Range(1_000, 192_000)),
            Self::Session => (ALL_ENCODINGS, usize::MAX, RateSupport::Range(1, u32::MAX)),
        }
    }

    /// Whether this container can store audio of the given format.
    #[must_use]
    pub fn supports(self, format: &SampleFormat) -> bool {
        let (encodings, max_channels, rates) = self.capabilities();
        encodings.contains(&format.encoding())
            && format.channel_count() <= max_channels
            && rates.contains(format.sample_rate())
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CommonLayout;

    #[test]
    fn stored_formats_are_validated_on_load() {
        let format = SampleFormat::new(44_100, SampleEncoding::I24, ChannelLayout::stereo())
            .expect("valid format");
        let stored = serde_json::to_value(&format).expect("serialize");
        assert_eq!(
            serde_json::from_value::<SampleFormat>(stored.clone()).expect("deserialize"),
            format
        );

        let mut zero_rate = stored;
        zero_rate["sample_rate"] = serde_json::json!(0);
        let error = serde_json::from_value::<SampleFormat>(zero_rate).expect_err("zero rate");
        assert!(error.to_string().contains("invalid sample rate: 0"));
    }

    #[test]
    fn zero_and_negative_rates_are_rejected() {
        let layout = ChannelLayout::stereo();
        assert_eq!(
            SampleFormat::new(0, SampleEncoding::I16, layout.clone()),
            Err(FormatError::InvalidSampleRate(0))
        );
        assert_eq!(
            SampleFormat::try_new(-44_100, 16, layout.clone()),
            Err(FormatError::InvalidSampleRate(-44_100))
        );
        assert_eq!(
            SampleFormat::try_new(44_100, 12, layout),
            Err(FormatError::InvalidEncoding(12))
        );
    }

    #[test]
    fn equality_is_componentwise() {
        let a = SampleFormat::new(48_000, SampleEncoding::I24, ChannelLayout::stereo())
            .expect("valid format");
        let b = SampleFormat::try_new(48_000, 24, ChannelLayout::stereo()).expect("valid format");
        let c = SampleFormat::new(48_000, SampleEncoding::I24, ChannelLayout::mono())
            .expect("valid format");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn extension_lookup_is_case_insensitive() {
        assert_eq!(FileFormat::from_extension("WAV"), Some(FileFormat::WavePcm));
        assert_eq!(FileFormat::from_extension("aif"), Some(FileFormat::Aiff));
        assert_eq!(FileFormat::from_extension("wlsx"), Some(FileFormat::Session));
        assert!(FileFormat::Flac.accepts_extension(Path::new("/tmp/a.FLAC")));
        assert!(!FileFormat::Flac.accepts_extension(Path::new("/tmp/a.wav")));
        assert!(!FileFormat::Flac.accepts_extension(Path::new("/tmp/noext")));
    }

    #[test]
    fn capability_table_rejects_unrepresentable_formats() {
        let float_stereo = SampleFormat::new(48_000, SampleEncoding::F32, ChannelLayout::stereo())
            .expect("valid format");
        let surround = SampleFormat::new(
            44_100,
            SampleEncoding::I16,
            ChannelLayout::common(CommonLayout::Surround51),
        )
        .expect("valid format");
        let odd_rate = SampleFormat::new(37_000, SampleEncoding::I16, ChannelLayout::stereo())
            .expect("valid format");

        assert!(FileFormat::WavePcm.supports(&float_stereo));
        assert!(!FileFormat::Flac.supports(&float_stereo));
        assert!(!FileFormat::Mp3.supports(&surround));
        assert!(FileFormat::Flac.supports(&surround));
        assert!(!FileFormat::Mp3.supports(&odd_rate));
    }
}
