//! Sample type conversion parameters and the channel/rate conversion applied
//! when a waveform document is written in a different format.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    channel::ChannelLayout,
    format::{FormatError, SampleEncoding, SampleFormat},
    time::rescale_frames,
};

pub const MIN_DITHER_STRENGTH_DB: f32 = 1.0;
pub const MAX_DITHER_STRENGTH_DB: f32 = 50.0;
pub const MIN_CROSSOVER_HZ: f32 = 13_000.0;
pub const MAX_CROSSOVER_HZ: f32 = 28_800.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DitherType {
    Triangular,
    TriangularShaped,
    Gaussian,
    GaussianShaped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoiseShaping {
    None,
    LightSlope,
    NeutralLight,
    NeutralHeavy,
    WeightedLight,
    WeightedHeavy,
    UShapedShallow,
    UShapedMedium,
    UShapedDeep,
    HighPass,
}

impl NoiseShaping {
    /// Share of the configured strength the shaping curve lets through.
    /// Always within 0..=1.
    #[must_use]
    pub const fn template_weight(self) -> f32 {
        match self {
            Self::None => 1.0,
            Self::LightSlope => 0.9,
            Self::NeutralLight => 0.85,
            Self::WeightedLight => 0.8,
            Self::UShapedShallow => 0.75,
            Self::NeutralHeavy => 0.7,
            Self::WeightedHeavy => 0.65,
            Self::UShapedMedium => 0.6,
            Self::HighPass => 0.55,
            Self::UShapedDeep => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    Off,
    Constant,
    DynamicLight,
    DynamicMedium,
    DynamicExtreme,
}

impl AdaptiveMode {
    const fn depth(self) -> f32 {
        match self {
            Self::Off | Self::Constant => 0.0,
            Self::DynamicLight => 0.25,
            Self::DynamicMedium => 0.5,
            Self::DynamicExtreme => 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DitherSettings {
    enabled: bool,
    dither_type: DitherType,
    strength_db: f32,
    noise_shaping: NoiseShaping,
    adaptive_mode: AdaptiveMode,
    crossover_hz: f32,
}

#[derive(Deserialize)]
struct DitherSettingsRepr {
    enabled: bool,
    dither_type: DitherType,
    strength_db: f32,
    noise_shaping: NoiseShaping,
    adaptive_mode: AdaptiveMode,
    crossover_hz: f32,
}

impl<'de> Deserialize<'de> for DitherSettings {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = DitherSettingsRepr::deserialize(deserializer)?;
        Ok(Self::new(repr.dither_type, repr.strength_db)
            .with_enabled(repr.enabled)
            .with_noise_shaping(repr.noise_shaping)
            .with_adaptive_mode(repr.adaptive_mode)
            .with_crossover_hz(repr.crossover_hz))
    }
}

impl Default for DitherSettings {
    fn default() -> Self {
        Self::new(DitherType::Triangular, 1.0)
    }
}

impl DitherSettings {
    #[must_use]
    pub fn new(dither_type: DitherType, strength_db: f32) -> Self {
        Self {
            enabled: true,
            dither_type,
            strength_db: clamp_strength(strength_db),
            noise_shaping: NoiseShaping::None,
            adaptive_mode: AdaptiveMode::Off,
            crossover_hz: 18_000.0,
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_strength_db(mut self, strength_db: f32) -> Self {
        self.strength_db = clamp_strength(strength_db);
        self
    }

    #[must_use]
    pub fn with_noise_shaping(mut self, noise_shaping: NoiseShaping) -> Self {
        self.noise_shaping = noise_shaping;
        self
    }

    #[must_use]
    pub fn with_adaptive_mode(mut self, adaptive_mode: AdaptiveMode) -> Self {
        self.adaptive_mode = adaptive_mode;
        self
    }

    #[must_use]
    pub fn with_crossover_hz(mut self, crossover_hz: f32) -> Self {
        self.crossover_hz = if crossover_hz.is_nan() {
            MIN_CROSSOVER_HZ
        } else {
            crossover_hz.clamp(MIN_CROSSOVER_HZ, MAX_CROSSOVER_HZ)
        };
        self
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn dither_type(&self) -> DitherType {
        self.dither_type
    }

    #[must_use]
    pub fn strength_db(&self) -> f32 {
        self.strength_db
    }

    #[must_use]
    pub fn noise_shaping(&self) -> NoiseShaping {
        self.noise_shaping
    }

    #[must_use]
    pub fn adaptive_mode(&self) -> AdaptiveMode {
        self.adaptive_mode
    }

    #[must_use]
    pub fn crossover_hz(&self) -> f32 {
        self.crossover_hz
    }

    /// Dither strength in dB for a signal envelope `level` in 0..=1.
    ///
    /// With adaptive mode off the configured strength is used as is. Any other
    /// mode scales it by the noise shaping template, and the dynamic modes
    /// back off further as the signal gets louder. The result never exceeds
    /// the configured strength.
    #[must_use]
    pub fn effective_strength(&self, level: f32) -> f32 {
        if !self.enabled {
            return 0.0;
        }

        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        let strength = match self.adaptive_mode {
            AdaptiveMode::Off => self.strength_db,
            mode => {
                let shaped = self.strength_db * self.noise_shaping.template_weight();
                shaped * (1.0 - mode.depth() * level)
            }
        };
        strength.min(self.strength_db)
    }
}

fn clamp_strength(strength_db: f32) -> f32 {
    if strength_db.is_nan() {
        return MIN_DITHER_STRENGTH_DB;
    }
    strength_db.clamp(MIN_DITHER_STRENGTH_DB, MAX_DITHER_STRENGTH_DB)
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Target format for a conversion. `None` fields keep the source value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SampleTypeConversion {
    pub sample_rate: Option<u32>,
    pub encoding: Option<SampleEncoding>,
    pub layout: Option<ChannelLayout>,
    left_mix: f32,
    right_mix: f32,
    resample_quality: f32,
    pub use_resample_filter: bool,
    pub dither: Option<DitherSettings>,
}

impl Default for SampleTypeConversion {
    fn default() -> Self {
        Self {
            sample_rate: None,
            encoding: None,
            layout: None,
            left_mix: 0.5,
            right_mix: 0.5,
            resample_quality: 0.75,
            use_resample_filter: true,
            dither: None,
        }
    }
}

impl SampleTypeConversion {
    #[must_use]
    pub fn keep_source() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: SampleEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: ChannelLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    #[must_use]
    pub fn with_mix(mut self, left_mix: f32, right_mix: f32) -> Self {
        self.left_mix = clamp_unit(left_mix);
        self.right_mix = clamp_unit(right_mix);
        self
    }

    #[must_use]
    pub fn with_resample_quality(mut self, quality: f32) -> Self {
        self.resample_quality = clamp_unit(quality);
        self
    }

    #[must_use]
    pub fn with_dither(mut self, dither: DitherSettings) -> Self {
        self.dither = Some(dither);
        self
    }

    #[must_use]
    pub fn left_mix(&self) -> f32 {
        clamp_unit(self.left_mix)
    }

    #[must_use]
    pub fn right_mix(&self) -> f32 {
        clamp_unit(self.right_mix)
    }

    #[must_use]
    pub fn resample_quality(&self) -> f32 {
        clamp_unit(self.resample_quality)
    }

    pub fn resolve(&self, source: &SampleFormat) -> Result<SampleFormat, FormatError> {
        SampleFormat::new(
            self.sample_rate.unwrap_or(source.sample_rate()),
            self.encoding.unwrap_or(source.encoding()),
            self.layout.clone().unwrap_or_else(|| source.layout().clone()),
        )
    }

    /// Converts interleaved samples from `source` into the resolved target
    /// format. Bit depth is not touched here; it is applied when writing.
    pub fn apply(
        &self,
        source: &SampleFormat,
        samples: &[f32],
    ) -> Result<(SampleFormat, Vec<f32>), FormatError> {
        let target = self.resolve(source)?;
        let remapped = remap_channels(
            samples,
            source.layout(),
            target.layout(),
            self.left_mix(),
            self.right_mix(),
        );
        let resampled = resample_linear(
            &remapped,
            target.channel_count(),
            source.sample_rate(),
            target.sample_rate(),
        );
        debug!(
            source = %source,
            target = %target,
            quality = self.resample_quality(),
            frames_in = samples.len() / source.channel_count().max(1),
            frames_out = resampled.len() / target.channel_count().max(1),
            "sample type conversion applied"
        );
        Ok((target, resampled))
    }
}

fn remap_channels(
    samples: &[f32],
    source: &ChannelLayout,
    target: &ChannelLayout,
    left_mix: f32,
    right_mix: f32,
) -> Vec<f32> {
    if source == target {
        return samples.to_vec();
    }

    let source_channels = source.channel_count();
    let target_channels = target.channel_count();
    let frames = samples.len() / source_channels;
    let mut output = Vec::with_capacity(frames * target_channels);

    // Per target channel, the source channel it copies from (None = silence).
    let mapping: Vec<Option<usize>> = target
        .labels()
        .iter()
        .enumerate()
        .map(|(index, label)| {
            source
                .index_of(*label)
                .or_else(|| (index < source_channels).then_some(index))
        })
        .collect();

    for frame in samples.chunks_exact(source_channels) {
        match (source_channels, target_channels) {
            (2, 1) => output.push(frame[0] * left_mix + frame[1] * right_mix),
            (1, _) => output.extend(std::iter::repeat_n(frame[0], target_channels)),
            _ => output.extend(
                mapping
                    .iter()
                    .map(|source_index| source_index.map_or(0.0, |index| frame[index])),
            ),
        }
    }
    output
}

fn resample_linear(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || channels == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let frames_in = samples.len() / channels;
    let frames_out = usize::try_from(rescale_frames(frames_in as u64, from_rate, to_rate))
        .unwrap_or(frames_in);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = frames_in.saturating_sub(1);
    let mut output = Vec::with_capacity(frames_out * channels);

    for frame in 0..frames_out {
        let position = frame as f64 * step;
        let index = (position.floor() as usize).min(last);
        let next = (index + 1).min(last);
        let fraction = (position - index as f64) as f32;
        for channel in 0..channels {
            let a = samples[index * channels + channel];
            let b = samples[next * channels + channel];
            output.push(a + (b - a) * fraction);
        }
    }
    output
}
