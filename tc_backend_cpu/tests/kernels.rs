//! Kernel properties checked against straightforward reference loops.

use approx::assert_relative_eq;
use proptest::prelude::*;
use proptest::test_runner::Config;
use rand::Rng;

use tc_backend_cpu::{conv2d, matmul, sum_axis, transpose, ConvDims, KernelConfig, MatmulDims};

fn reference_matmul(a: &[f32], b: &[f32], m: usize, n: usize, p: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * p];
    for i in 0..m {
        for k in 0..n {
            for j in 0..p {
                c[i * p + j] += a[i * n + k] * b[k * p + j];
            }
        }
    }
    c
}

fn small_ints(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec((-4i32..=4).prop_map(|v| v as f32), len)
}

proptest! {
    #![proptest_config(Config::with_cases(64))]

    #[test]
    fn prop_matmul_matches_reference(
        (m, n, p, a, b) in (1usize..9, 1usize..9, 1usize..9).prop_flat_map(|(m, n, p)| {
            (Just(m), Just(n), Just(p), small_ints(m * n), small_ints(n * p))
        })
    ) {
        let expected = reference_matmul(&a, &b, m, n, p);
        let c = matmul(&a, &b, MatmulDims::new(1, m, n, p), false, false, &KernelConfig::eager());
        prop_assert_eq!(c, expected);
    }

    #[test]
    fn prop_transpose_of_product(
        (m, n, p, a, b) in (1usize..7, 1usize..7, 1usize..7).prop_flat_map(|(m, n, p)| {
            (Just(m), Just(n), Just(p), small_ints(m * n), small_ints(n * p))
        })
    ) {
        let cfg = KernelConfig::default();
        let ab = matmul(&a, &b, MatmulDims::new(1, m, n, p), false, false, &cfg);
        let lhs = transpose(&ab, 1, m, p, &cfg);
        let bt = transpose(&b, 1, n, p, &cfg);
        let at = transpose(&a, 1, m, n, &cfg);
        let rhs = matmul(&bt, &at, MatmulDims::new(1, p, n, m), false, false, &cfg);
        prop_assert_eq!(lhs, rhs);
    }

    #[test]
    fn prop_transpose_involution(
        (batch, rows, cols, x) in (1usize..4, 1usize..9, 1usize..9).prop_flat_map(|(b, r, c)| {
            (Just(b), Just(r), Just(c), prop::collection::vec(-100.0f32..100.0, b * r * c))
        })
    ) {
        let cfg = KernelConfig::eager();
        let once = transpose(&x, batch, rows, cols, &cfg);
        prop_assert_eq!(transpose(&once, batch, cols, rows, &cfg), x);
    }

    #[test]
    fn prop_sum_axis_matches_reference(
        (shape, axis, x) in prop::collection::vec(1usize..5, 1..4).prop_flat_map(|shape| {
            let len: usize = shape.iter().product();
            let rank = shape.len();
            (Just(shape), 0..rank, small_ints(len))
        })
    ) {
        let (outer, reduced, inner) = tc_backend_cpu::split_extents(&shape, axis);
        let mut expected = vec![0.0f32; outer * inner];
        for o in 0..outer {
            for r in 0..reduced {
                for i in 0..inner {
                    expected[o * inner + i] += x[(o * reduced + r) * inner + i];
                }
            }
        }
        prop_assert_eq!(sum_axis(&x, &shape, axis, &KernelConfig::eager()), expected);
    }
}

#[test]
fn test_threshold_invariance() {
    let mut rng = rand::thread_rng();
    let (batch, m, n, p) = (3, 17, 11, 13);
    let a: Vec<f32> = (0..batch * m * n).map(|_| rng.gen_range(-8i32..8) as f32).collect();
    let b: Vec<f32> = (0..batch * n * p).map(|_| rng.gen_range(-8i32..8) as f32).collect();
    let dims = MatmulDims::new(batch, m, n, p);

    let tiny = KernelConfig::eager();
    let huge = KernelConfig::sequential();
    for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
        assert_eq!(
            matmul(&a, &b, dims, ta, tb, &tiny),
            matmul(&a, &b, dims, ta, tb, &huge),
            "variant ({ta}, {tb})"
        );
    }
    assert_eq!(transpose(&a, batch, m, n, &tiny), transpose(&a, batch, m, n, &huge));
    assert_eq!(
        sum_axis(&a, &[batch, m, n], 1, &tiny),
        sum_axis(&a, &[batch, m, n], 1, &huge)
    );

    let dims = ConvDims { channels: 3, height: 9, width: 7, filters: 4, kernel_h: 3, kernel_w: 2 };
    let input: Vec<f32> = (0..dims.input_len()).map(|_| rng.gen_range(-4i32..4) as f32).collect();
    let filters: Vec<f32> = (0..dims.filter_len()).map(|_| rng.gen_range(-4i32..4) as f32).collect();
    assert_eq!(conv2d(&input, &filters, dims, &tiny), conv2d(&input, &filters, dims, &huge));
}

#[test]
fn test_large_random_matmul_close_to_reference() {
    let mut rng = rand::thread_rng();
    let (m, n, p) = (64, 96, 48);
    let a: Vec<f32> = (0..m * n).map(|_| rng.gen::<f32>() - 0.5).collect();
    let b: Vec<f32> = (0..n * p).map(|_| rng.gen::<f32>() - 0.5).collect();
    let expected = reference_matmul(&a, &b, m, n, p);
    let c = matmul(&a, &b, MatmulDims::new(1, m, n, p), false, false, KernelConfig::shared());
    for (x, y) in c.iter().zip(&expected) {
        assert_relative_eq!(x, y, epsilon = 1e-4, max_relative = 1e-4);
    }
}

#[test]
fn test_concrete_scenarios() {
    let cfg = KernelConfig::shared();
    let c = matmul(&[1.0; 6], &[1.0; 6], MatmulDims::new(1, 2, 3, 2), false, false, cfg);
    assert_eq!(c, vec![3.0; 4]);
    assert_eq!(transpose(&[1.0, 2.0, 3.0, 4.0], 1, 2, 2, cfg), vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(sum_axis(&[1.0, 2.0, 3.0, 4.0], &[2, 2], 0, cfg), vec![4.0, 6.0]);
}
