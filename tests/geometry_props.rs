use footprint_mask::geometry::{fit, BoundingBox};
use footprint_mask::transform::{TransformLimits, TransformState};
use proptest::prelude::*;

proptest! {
    #[test]
    fn cover_fit_always_covers_and_centers(
        x in -500.0f64..500.0,
        y in -500.0f64..500.0,
        width in 1.0f64..2000.0,
        height in 1.0f64..2000.0,
        image_width in 1u32..4096,
        image_height in 1u32..4096,
        overscan in 1.0f64..1.5,
    ) {
        let bbox = BoundingBox::new(x, y, width, height);
        let result = fit(bbox, image_width, image_height, overscan).expect("valid input");

        prop_assert!(result.scaled_width + 1e-6 >= width);
        prop_assert!(result.scaled_height + 1e-6 >= height);

        let image_cx = result.offset_x + result.scaled_width / 2.0;
        let image_cy = result.offset_y + result.scaled_height / 2.0;
        let (cx, cy) = bbox.center();
        prop_assert!((image_cx - cx).abs() < 1e-6);
        prop_assert!((image_cy - cy).abs() < 1e-6);
    }

    #[test]
    fn scale_stays_within_limits(factors in prop::collection::vec(0.01f64..10.0, 1..20)) {
        let limits = TransformLimits::default();
        let mut state = TransformState::default();
        for factor in factors {
            state = state.scaled(factor, limits);
            prop_assert!(state.scale >= limits.min_scale);
            prop_assert!(state.scale <= limits.max_scale);
        }
    }

    #[test]
    fn rotation_stays_in_range(deltas in prop::collection::vec(-1000i32..1000, 1..20)) {
        let mut state = TransformState::default();
        let mut expected: i64 = 0;
        for delta in deltas {
            state = state.rotated(delta);
            expected += delta as i64;
            prop_assert!((0..360).contains(&state.rotation_degrees));
        }
        prop_assert_eq!(state.rotation_degrees as i64, expected.rem_euclid(360));
    }
}
