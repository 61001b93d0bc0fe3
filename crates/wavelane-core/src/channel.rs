use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("invalid channel layout: {0}")]
    InvalidLayout(String),
}

/// Physical or logical role of a single audio channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLabel {
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
    RearSurroundLeft,
    RearSurroundRight,
    FrontLeftWide,
    FrontRightWide,
    Lfe2,
    LeftTotal,
    RightTotal,
    LeftHeight,
    RightHeight,
    BottomFrontLeft,
    BottomFrontCenter,
    BottomFrontRight,
    ProximityLeft,
    ProximityRight,
    AmbisonicW,
    AmbisonicX,
    AmbisonicY,
    AmbisonicZ,
    Discrete,
}

impl ChannelLabel {
    /// Every label, indexed by its numeric code.
    pub const ALL: [Self; 37] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::FrontCenter,
        Self::LowFrequency,
        Self::BackLeft,
        Self::BackRight,
        Self::FrontLeftOfCenter,
        Self::FrontRightOfCenter,
        Self::BackCenter,
        Self::SideLeft,
        Self::SideRight,
        Self::TopCenter,
        Self::TopFrontLeft,
        Self::TopFrontCenter,
        Self::TopFrontRight,
        Self::TopBackLeft,
        Self::TopBackCenter,
        Self::TopBackRight,
        Self::RearSurroundLeft,
        Self::RearSurroundRight,
        Self::FrontLeftWide,
        Self::FrontRightWide,
        Self::Lfe2,
        Self::LeftTotal,
        Self::RightTotal,
        Self::LeftHeight,
        Self::RightHeight,
        Self::BottomFrontLeft,
        Self::BottomFrontCenter,
        Self::BottomFrontRight,
        Self::ProximityLeft,
        Self::ProximityRight,
        Self::AmbisonicW,
        Self::AmbisonicX,
        Self::AmbisonicY,
        Self::AmbisonicZ,
        Self::Discrete,
    ];

    #[must_use]
    pub fn code(self) -> u16 {
        Self::ALL
            .iter()
            .position(|label| *label == self)
            .map_or(u16::MAX, |index| index as u16)
    }

    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FrontLeft => "Front-Left",
            Self::FrontRight => "Front-Right",
            Self::FrontCenter => "Front-Center",
            Self::LowFrequency => "Low-Frequency",
            Self::BackLeft => "Back-Left",
            Self::BackRight => "Back-Right",
            Self::FrontLeftOfCenter => "Front-Left-Of-Center",
            Self::FrontRightOfCenter => "Front-Right-Of-Center",
            Self::BackCenter => "Back-Center",
            Self::SideLeft => "Side-Left",
            Self::SideRight => "Side-Right",
            Self::TopCenter => "Top-Center",
            Self::TopFrontLeft => "Top-Front-Left",
            Self::TopFrontCenter => "Top-Front-Center",
            Self::TopFrontRight => "Top-Front-Right",
            Self::TopBackLeft => "Top-Back-Left",
            Self::TopBackCenter => "Top-Back-Center",
            Self::TopBackRight => "Top-Back-Right",
            Self::RearSurroundLeft => "Rear-Surround-Left",
            Self::RearSurroundRight => "Rear-Surround-Right",
            Self::FrontLeftWide => "Front-Left-Wide",
            Self::FrontRightWide => "Front-Right-Wide",
            Self::Lfe2 => "LFE2",
            Self::LeftTotal => "Left-Total",
            Self::RightTotal => "Right-Total",
            Self::LeftHeight => "Left-Height",
            Self::RightHeight => "Right-Height",
            Self::BottomFrontLeft => "Bottom-Front-Left",
            Self::BottomFrontCenter => "Bottom-Front-Center",
            Self::BottomFrontRight => "Bottom-Front-Right",
            Self::ProximityLeft => "Proximity-Left",
            Self::ProximityRight => "Proximity-Right",
            Self::AmbisonicW => "Ambisonic-W",
            Self::AmbisonicX => "Ambisonic-X",
            Self::AmbisonicY => "Ambisonic-Y",
            Self::AmbisonicZ => "Ambisonic-Z",
            Self::Discrete => "Discrete",
        }
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named presets for the layouts most sessions use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommonLayout {
    Mono,
    Stereo,
    MatrixStereo,
    LeftCenterRight,
    LeftRightLfe,
    Quadraphonic,
    Pentagonal,
    Surround51,
    Legacy51,
    Broadcast51,
    Hexagonal,
    Surround71,
    Surround71Itu,
    Surround71Mpeg,
    Surround71Emagic,
    Octagonal,
    Cube,
    SmpteDtv,
    Vst10_2,
    AmbisonicBFormat,
    Discrete4,
    Discrete8,
    Discrete32,
}

impl CommonLayout {
    pub const ALL: [Self; 23] = [
        Self::Mono,
        Self::Stereo,
        Self::MatrixStereo,
        Self::LeftCenterRight,
        Self::LeftRightLfe,
        Self::Quadraphonic,
        Self::Pentagonal,
        Self::Surround51,
        Self::Legacy51,
        Self::Broadcast51,
        Self::Hexagonal,
        Self::Surround71,
        Self::Surround71Itu,
        Self::Surround71Mpeg,
        Self::Surround71Emagic,
        Self::Octagonal,
        Self::Cube,
        Self::SmpteDtv,
        Self::Vst10_2,
        Self::AmbisonicBFormat,
        Self::Discrete4,
        Self::Discrete8,
        Self::Discrete32,
    ];

    #[must_use]
    pub fn labels(self) -> Vec<ChannelLabel> {
        use ChannelLabel::{
            AmbisonicW, AmbisonicX, AmbisonicY, AmbisonicZ, BackCenter, BackLeft, BackRight,
            Discrete, FrontCenter, FrontLeft, FrontLeftOfCenter, FrontRight, FrontRightOfCenter,
            LeftTotal, Lfe2, LowFrequency, RearSurroundLeft, RearSurroundRight, RightTotal,
            SideLeft, SideRight, TopBackLeft, TopBackRight, TopFrontCenter, TopFrontLeft,
            TopFrontRight,
        };

        match self {
            Self::Mono => vec![Discrete],
            Self::Stereo => vec![FrontLeft, FrontRight],
            Self::MatrixStereo => vec![LeftTotal, RightTotal],
            Self::LeftCenterRight => vec![FrontLeft, FrontCenter, FrontRight],
            Self::LeftRightLfe => vec![FrontLeft, FrontRight, LowFrequency],
            Self::Quadraphonic => vec![FrontLeft, FrontRight, BackLeft, BackRight],
            Self::Pentagonal => vec![FrontLeft, FrontRight, BackLeft, BackRight, FrontCenter],
            Self::Surround51 | Self::Broadcast51 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
            ],
            Self::Legacy51 => vec![
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                FrontCenter,
                LowFrequency,
            ],
            Self::Hexagonal => vec![
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                FrontCenter,
                BackCenter,
            ],
            Self::Surround71 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
                FrontLeftOfCenter,
                FrontRightOfCenter,
            ],
            Self::Surround71Itu => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
                RearSurroundLeft,
                RearSurroundRight,
            ],
            Self::Surround71Mpeg => vec![
                FrontCenter,
                FrontLeftOfCenter,
                FrontRightOfCenter,
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                LowFrequency,
            ],
            Self::Surround71Emagic => vec![
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                FrontCenter,
                LowFrequency,
                FrontLeftOfCenter,
                FrontRightOfCenter,
            ],
            Self::Octagonal => vec![
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                FrontCenter,
                BackCenter,
                SideLeft,
                SideRight,
            ],
            Self::Cube => vec![
                FrontLeft,
                FrontRight,
                BackLeft,
                BackRight,
                TopFrontLeft,
                TopFrontRight,
                TopBackLeft,
                TopBackRight,
            ],
            Self::SmpteDtv => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
                LeftTotal,
                RightTotal,
            ],
            Self::Vst10_2 => vec![
                FrontLeft,
                FrontRight,
                FrontCenter,
                LowFrequency,
                BackLeft,
                BackRight,
                TopFrontLeft,
                TopFrontCenter,
                TopFrontRight,
                TopBackLeft,
                TopBackRight,
                Lfe2,
            ],
            Self::AmbisonicBFormat => vec![AmbisonicW, AmbisonicX, AmbisonicY, AmbisonicZ],
            Self::Discrete4 => vec![Discrete; 4],
            Self::Discrete8 => vec![Discrete; 8],
            Self::Discrete32 => vec![Discrete; 32],
        }
    }
}

/// Ordered, immutable sequence of channel roles. Never empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "Vec<ChannelLabel>", into = "Vec<ChannelLabel>")]
pub struct ChannelLayout {
    labels: Vec<ChannelLabel>,
}

impl ChannelLayout {
    pub fn from_labels(labels: impl Into<Vec<ChannelLabel>>) -> Result<Self, LayoutError> {
        let labels = labels.into();
        if labels.is_empty() {
            return Err(LayoutError::InvalidLayout(
                "a layout needs at least one channel".to_string(),
            ));
        }
        Ok(Self { labels })
    }

    /// Builds a layout from numeric label codes as exposed to scripts.
    pub fn from_codes(codes: &[u16]) -> Result<Self, LayoutError> {
        let labels = codes
            .iter()
            .map(|code| {
                ChannelLabel::from_code(*code).ok_or_else(|| {
                    LayoutError::InvalidLayout(format!("unrecognized channel label code {code}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_labels(labels)
    }

    #[must_use]
    pub fn common(layout: CommonLayout) -> Self {
        Self {
            labels: layout.labels(),
        }
    }

    pub fn discrete(channels: usize) -> Result<Self, LayoutError> {
        Self::from_labels(vec![ChannelLabel::Discrete; channels])
    }

    #[must_use]
    pub fn mono() -> Self {
        Self::common(CommonLayout::Mono)
    }

    #[must_use]
    pub fn stereo() -> Self {
        Self::common(CommonLayout::Stereo)
    }

    /// Picks a sensible layout for a bare channel count read from a file.
    #[must_use]
    pub fn for_channel_count(channels: usize) -> Self {
        match channels {
            0 | 1 => Self::mono(),
            2 => Self::stereo(),
            6 => Self::common(CommonLayout::Surround51),
            8 => Self::common(CommonLayout::Surround71),
            count => Self {
                labels: vec![ChannelLabel::Discrete; count],
            },
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn labels(&self) -> &[ChannelLabel] {
        &self.labels
    }

    #[must_use]
    pub fn label(&self, index: usize) -> Option<ChannelLabel> {
        self.labels.get(index).copied()
    }

    #[must_use]
    pub fn index_of(&self, label: ChannelLabel) -> Option<usize> {
        self.labels.iter().position(|candidate| *candidate == label)
    }

    #[must_use]
    pub fn description(&self) -> String {
        let names = self
            .labels
            .iter()
            .map(|label| label.name())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} Channel Configuration {names}", self.labels.len())
    }
}

impl TryFrom<Vec<ChannelLabel>> for ChannelLayout {
    type Error = LayoutError;

    fn try_from(value: Vec<ChannelLabel>) -> Result<Self, Self::Error> {
        Self::from_labels(value)
    }
}

impl From<ChannelLayout> for Vec<ChannelLabel> {
    fn from(value: ChannelLayout) -> Self {
        value.labels
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_the_label_table() {
        for label in ChannelLabel::ALL {
            assert_eq!(ChannelLabel::from_code(label.code()), Some(label));
        }
        assert_eq!(ChannelLabel::from_code(999), None);
    }

    #[test]
    fn empty_and_unknown_inputs_are_rejected() {
        assert!(ChannelLayout::from_labels(Vec::new()).is_err());
        assert!(ChannelLayout::from_codes(&[]).is_err());
        assert!(ChannelLayout::from_codes(&[0, 4_000]).is_err());
        assert!(ChannelLayout::discrete(0).is_err());
    }

    #[test]
    fn presets_match_their_documented_channel_counts() {
        assert_eq!(ChannelLayout::common(CommonLayout::Mono).channel_count(), 1);
        assert_eq!(ChannelLayout::common(CommonLayout::Surround51).channel_count(), 6);
        assert_eq!(ChannelLayout::common(CommonLayout::Surround71Itu).channel_count(), 8);
        assert_eq!(ChannelLayout::common(CommonLayout::Vst10_2).channel_count(), 12);
        assert_eq!(ChannelLayout::common(CommonLayout::Discrete32).channel_count(), 32);
    }

    #[test]
    fn description_lists_every_label() {
        let layout = ChannelLayout::stereo();
        assert_eq!(
            layout.description(),
            "2 Channel Configuration Front-Left Front-Right"
        );
    }

    #[test]
    fn empty_layout_json_is_rejected() {
        let parsed = serde_json::from_str::<ChannelLayout>("[]");
        assert!(parsed.is_err());
        let parsed = serde_json::from_str::<ChannelLayout>(r#"["front_left","low_frequency"]"#)
            .expect("non-empty layout should parse");
        assert_eq!(parsed.channel_count(), 2);
    }
}
