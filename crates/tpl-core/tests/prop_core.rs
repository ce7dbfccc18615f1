// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PROPERTY-BASED TESTS — tpl-core
//
// Window arithmetic, top-k compression and LR schedule bounds for arbitrary
// inputs.
// Run: cargo test --release -p tpl-core --test prop_core
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use proptest::prelude::*;
use tpl_core::{
    window_for_block, GradientCodec, LrScheduler, ParameterSet, Tensor, TopKCodec,
};

fn dense(max_len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0f32..100.0, 1..max_len)
}

// ─────────────────────────────────────────────────────────────────
// WINDOW PROPERTIES
// ─────────────────────────────────────────────────────────────────

proptest! {
    /// PROPERTY: a block lies inside the window it maps to
    #[test]
    fn prop_block_inside_its_window(block in 0u64..u64::MAX / 2, bpw in 1u64..10_000) {
        let window = window_for_block(block, bpw);
        prop_assert!(window * bpw <= block);
        prop_assert!(block < (window + 1) * bpw);
    }

    /// PROPERTY: later blocks never map to earlier windows
    #[test]
    fn prop_window_monotonic(a in 0u64..1_000_000, gap in 0u64..1_000_000, bpw in 1u64..500) {
        prop_assert!(window_for_block(a, bpw) <= window_for_block(a + gap, bpw));
    }
}

// ─────────────────────────────────────────────────────────────────
// COMPRESSION PROPERTIES
// ─────────────────────────────────────────────────────────────────

proptest! {
    /// PROPERTY: top-k keeps min(k, n) entries, ascending, none smaller than a dropped one
    #[test]
    fn prop_topk_keeps_largest(data in dense(64), k in 0usize..80) {
        let n = data.len();
        let mut params = ParameterSet::new();
        params.insert("w".to_string(), Tensor::zeros(&[n]));
        let codec = TopKCodec::for_parameters(&params);
        let t = Tensor::from_vec(vec![n], data.clone()).unwrap();

        let fragment = codec.compress("w", &t, k).unwrap();
        prop_assert_eq!(fragment.idxs.len(), k.min(n));
        prop_assert!(fragment.idxs.windows(2).all(|w| w[0] < w[1]));

        let smallest_kept = fragment
            .vals
            .iter()
            .map(|v| v.abs())
            .fold(f32::INFINITY, f32::min);
        for (i, v) in data.iter().enumerate() {
            if !fragment.idxs.contains(&(i as i64)) {
                prop_assert!(v.abs() <= smallest_kept);
            }
        }

        if !fragment.idxs.is_empty() {
            let decoded = codec.decode("w", &fragment).unwrap();
            for (&i, &v) in fragment.idxs.iter().zip(fragment.vals.iter()) {
                prop_assert_eq!(decoded.data[i as usize], v);
            }
        }
    }

    /// PROPERTY: sign is in {-1, 0, 1} and agrees with the value
    #[test]
    fn prop_sign_agrees(data in dense(64)) {
        let t = Tensor::from_vec(vec![data.len()], data.clone()).unwrap();
        for (s, v) in t.sign().data.iter().zip(data.iter()) {
            prop_assert!(*s == -1.0 || *s == 0.0 || *s == 1.0);
            prop_assert!(s * v >= 0.0);
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// SCHEDULE PROPERTIES
// ─────────────────────────────────────────────────────────────────

proptest! {
    /// PROPERTY: the learning rate never leaves [min(eta_min, warmup start), base]
    #[test]
    fn prop_lr_bounded(
        base in 1e-5f32..1.0,
        eta_factor in 0.0f32..1.0,
        warmup in 0u64..500,
        t_0 in 1u64..2_000,
        t_mult in 1u64..4,
        epoch in 0u64..100_000,
    ) {
        let s = LrScheduler {
            base_lr: base,
            warmup_steps: warmup,
            t_0,
            t_mult,
            eta_min: base * eta_factor,
            last_epoch: epoch,
        };
        let lr = s.last_lr();
        let floor = (base * eta_factor).min(base * 0.1);
        prop_assert!(lr.is_finite());
        prop_assert!(lr >= floor * (1.0 - 1e-4));
        prop_assert!(lr <= base * (1.0 + 1e-4));
    }
}
