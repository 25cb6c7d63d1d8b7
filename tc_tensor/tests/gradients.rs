//! Gradient checks against central finite differences, plus the concrete
//! scenarios the engine is expected to reproduce exactly.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tc_tensor::prelude::*;
use tc_tensor::GraphError;

const EPS: f32 = 1e-2;
const TOLERANCE: f32 = 2e-2;

fn scalar(t: &Tensor) -> f32 {
    t.to_vec().unwrap()[0]
}

/// Compare the analytic gradient of `f` at `x` with central differences.
fn check_gradient<F>(x: &Tensor, analytic: &Tensor, f: F, name: &str)
where
    F: Fn(&Tensor) -> f32,
{
    assert_eq!(x.shape(), analytic.shape(), "{name}: gradient shape");
    let grad = analytic.to_vec().unwrap();
    for i in 0..x.elements() {
        let mut plus = x.detach();
        let mut minus = x.detach();
        let mut index = vec![0; x.rank()];
        tc_tensor::shape::unravel(i, x.dims(), &mut index);
        let v = x.get(&index).unwrap();
        plus.set(&index, v + EPS).unwrap();
        minus.set(&index, v - EPS).unwrap();
        let numeric = (f(&plus) - f(&minus)) / (2.0 * EPS);
        let diff = (numeric - grad[i]).abs();
        assert!(diff < TOLERANCE, "{name}[{i}]: analytic={}, numeric={numeric}, diff={diff}", grad[i]);
    }
}

#[test]
fn test_matmul_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(21);
    let a = Tensor::rand_uniform_with([3, 4], -1.0, 1.0, &mut rng).track_grad();
    let b = Tensor::rand_uniform_with([4, 2], -1.0, 1.0, &mut rng).track_grad();

    let y = a
        .matmul_with_grad(&b)
        .unwrap()
        .activate_with_grad(Activation::Tanh)
        .unwrap()
        .sum_all_with_grad()
        .unwrap();
    y.backward().unwrap();

    let forward = |a: &Tensor, b: &Tensor| scalar(&a.matmul(b).unwrap().activate(Activation::Tanh).unwrap().sum_all().unwrap());
    check_gradient(&a, &a.grad().unwrap(), |p| forward(p, &b), "dA");
    check_gradient(&b, &b.grad().unwrap(), |p| forward(&a, p), "dB");
}

#[test]
fn test_conv_gradient_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(22);
    let x = Tensor::rand_uniform_with([2, 2, 4, 4], -1.0, 1.0, &mut rng).track_grad();
    let w = Tensor::rand_uniform_with([3, 2, 2, 2], -1.0, 1.0, &mut rng).track_grad();

    x.conv2d_with_grad(&w)
        .unwrap()
        .activate_with_grad(Activation::Sigmoid)
        .unwrap()
        .sum_all_with_grad()
        .unwrap()
        .backward()
        .unwrap();

    let forward = |x: &Tensor, w: &Tensor| scalar(&x.conv2d(w).unwrap().activate(Activation::Sigmoid).unwrap().sum_all().unwrap());
    check_gradient(&x, &x.grad().unwrap(), |p| forward(p, &w), "dX");
    check_gradient(&w, &w.grad().unwrap(), |p| forward(&x, p), "dW");
}

#[test]
fn test_broadcast_division_gradient() {
    let mut rng = StdRng::seed_from_u64(23);
    let a = Tensor::rand_uniform_with([2, 3], -1.0, 1.0, &mut rng).track_grad();
    let b = Tensor::rand_uniform_with([3], 1.0, 2.0, &mut rng).track_grad();
    a.div_with_grad(&b).unwrap().mean_with_grad(0, false).unwrap().sum_all_with_grad().unwrap().backward().unwrap();

    let forward = |a: &Tensor, b: &Tensor| scalar(&a.div(b).unwrap().mean(0, false).unwrap().sum_all().unwrap());
    check_gradient(&a, &a.grad().unwrap(), |p| forward(p, &b), "da");
    check_gradient(&b, &b.grad().unwrap(), |p| forward(&a, p), "db");
}

#[test]
fn test_ones_matmul_scenario() {
    let c = Tensor::ones([2, 3]).matmul(&Tensor::ones([3, 2])).unwrap();
    assert_eq!(c.to_vec().unwrap(), vec![3.0; 4]);
}

#[test]
fn test_transpose_scenario() {
    let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
    assert_eq!(t.transpose().unwrap().to_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn test_column_sum_scenario() {
    let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
    assert_eq!(t.sum(0, false).unwrap().to_vec().unwrap(), vec![4.0, 6.0]);
}

#[test]
fn test_diamond_graph_fires_shared_node_once() {
    // x feeds two branches that meet again: z = 2x + x*x.
    let x = Tensor::from_vec(vec![3.0], [1]).unwrap().track_grad();
    let h = x.scale_with_grad(1.0).unwrap();
    let left = h.scale_with_grad(2.0).unwrap();
    let right = h.mul_with_grad(&h).unwrap();
    let z = left.add_with_grad(&right).unwrap();
    z.backward().unwrap();

    let node = h.autograd().unwrap();
    assert_eq!(node.expected_contributions(), 3);
    assert_eq!(node.received_contributions(), 3);
    assert!(node.has_fired());
    // dz/dx = 2 + 2x
    assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![8.0]);
}

#[test]
fn test_single_pass_is_enforced() {
    let x = Tensor::from_vec(vec![1.0, 2.0], [2]).unwrap().track_grad();
    let y = x.scale_with_grad(2.0).unwrap();
    y.backward().unwrap();

    assert!(matches!(y.backward(), Err(TensorError::Graph(GraphError::ContributionAfterFire))));
    assert!(matches!(
        x.add_with_grad(&x),
        Err(TensorError::Graph(GraphError::EdgeAfterBackward))
    ));

    x.zero_grad();
    assert!(x.grad().is_none());
    let z = x.scale_with_grad(3.0).unwrap();
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![3.0, 3.0]);
}

#[test]
fn test_unused_branch_holds_back_its_input() {
    let x = Tensor::from_vec(vec![1.0], [1]).unwrap().track_grad();
    let used = x.scale_with_grad(2.0).unwrap();
    let _unused = x.scale_with_grad(5.0).unwrap();
    used.backward().unwrap();

    // Only one of two expected contributions arrived.
    let node = x.autograd().unwrap();
    assert_eq!(node.expected_contributions(), 2);
    assert_eq!(node.received_contributions(), 1);
    assert!(!node.has_fired());
    assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![2.0]);
}

#[test]
fn test_detached_tensors_stay_out_of_the_graph() {
    let x = Tensor::ones([2]).track_grad();
    let frozen = x.detach();
    let y = frozen.scale_with_grad(4.0).unwrap();
    assert!(!y.requires_grad());
    y.backward().unwrap();
    assert!(x.grad().is_none());
    assert_eq!(x.autograd().unwrap().expected_contributions(), 0);
}
