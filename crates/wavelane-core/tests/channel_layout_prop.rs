use proptest::prelude::*;
use wavelane_core::{ChannelLabel, ChannelLayout, CommonLayout};

fn label_codes() -> impl Strategy<Value = Vec<u16>> {
    prop::collection::vec(0u16..ChannelLabel::ALL.len() as u16, 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn layouts_are_equal_exactly_when_their_label_sequences_are(
        left in label_codes(),
        right in label_codes(),
    ) {
        let left_layout = ChannelLayout::from_codes(&left).expect("codes in range");
        let right_layout = ChannelLayout::from_codes(&right).expect("codes in range");
        prop_assert_eq!(left_layout == right_layout, left == right);
        prop_assert_eq!(left_layout.channel_count(), left.len());
    }

    #[test]
    fn json_round_trip_keeps_label_order(codes in label_codes()) {
        let layout = ChannelLayout::from_codes(&codes).expect("codes in range");
        let json = serde_json::to_string(&layout).expect("serialize layout");
        let decoded: ChannelLayout = serde_json::from_str(&json).expect("deserialize layout");
        prop_assert_eq!(decoded.labels(), layout.labels());
    }

    #[test]
    fn out_of_range_codes_are_rejected(
        mut codes in label_codes(),
        bad in (ChannelLabel::ALL.len() as u16)..u16::MAX,
        at in 0usize..12,
    ) {
        let index = at % codes.len();
        codes[index] = bad;
        prop_assert!(ChannelLayout::from_codes(&codes).is_err());
    }
}

#[test]
fn labels_are_reported_in_declared_order() {
    let layout = ChannelLayout::common(CommonLayout::LeftCenterRight);
    assert_eq!(
        layout.labels(),
        &[
            ChannelLabel::FrontLeft,
            ChannelLabel::FrontCenter,
            ChannelLabel::FrontRight
        ]
    );
    assert_eq!(layout.index_of(ChannelLabel::FrontRight), Some(2));
    assert_eq!(
        layout.description(),
        "3 Channel Configuration Front-Left Front-Center Front-Right"
    );
}

#[test]
fn reordered_labels_make_a_different_layout() {
    let stereo = ChannelLayout::stereo();
    let swapped =
        ChannelLayout::from_labels(vec![ChannelLabel::FrontRight, ChannelLabel::FrontLeft])
            .expect("valid layout");
    assert_ne!(stereo, swapped);
    assert!(ChannelLayout::from_codes(&[]).is_err());
}
