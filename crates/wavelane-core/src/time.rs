#[must_use]
pub fn samples_to_seconds(samples: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }

    samples as f64 / f64::from(sample_rate)
}

/// Converts a frame count measured at `from_rate` into frames at `to_rate`.
#[must_use]
pub fn rescale_frames(frames: u64, from_rate: u32, to_rate: u32) -> u64 {
    if from_rate == 0 || to_rate == 0 {
        return 0;
    }
    if from_rate == to_rate {
        return frames;
    }

    let scaled = u128::from(frames) * u128::from(to_rate);
    let rounded = (scaled + u128::from(from_rate) / 2) / u128::from(from_rate);
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_convert_to_seconds() {
        assert_eq!(samples_to_seconds(88_200, 44_100), 2.0);
        assert_eq!(samples_to_seconds(24_000, 48_000), 0.5);
    }

    #[test]
    fn rescale_between_common_rates() {
        assert_eq!(rescale_frames(44_100, 44_100, 48_000), 48_000);
        assert_eq!(rescale_frames(48_000, 48_000, 96_000), 96_000);
        assert_eq!(rescale_frames(1_000, 48_000, 48_000), 1_000);
        assert_eq!(rescale_frames(1_000, 0, 48_000), 0);
    }

    #[test]
    fn zero_rate_conversions_are_zero() {
        assert_eq!(samples_to_seconds(10, 0), 0.0);
        assert_eq!(rescale_frames(10, 48_000, 0), 0);
    }
}
