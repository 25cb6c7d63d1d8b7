//! Reverse-mode autograd with explicit fan-in accounting.
//!
//! Every tensor that requires gradients carries an [`AutogradContext`].
//! Wiring an [`Operation`] into the graph bumps the expected contribution
//! count of each tracked input. During backward a node accumulates incoming
//! gradients and only runs its operation's backward once every expected
//! contribution has arrived, so each node fires exactly once per pass.
//!
//! The graph is single-pass: once backward has reached a node, new consumer
//! edges and late contributions are rejected until [`Tensor::zero_grad`]
//! resets it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{GraphError, Result, TensorError};
use crate::shape::Shape;
use crate::tensor::Tensor;

static NEXT_NODE: AtomicU64 = AtomicU64::new(0);

/// A differentiable operation.
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of inputs `compute` and `backward` expect.
    fn required_inputs(&self) -> usize {
        2
    }

    /// Forward pass. The result carries no graph node; [`apply`] attaches one.
    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor>;

    /// Exactly one gradient per input, in input order, each shaped like its
    /// input.
    fn backward(&self, grad_output: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

struct NodeState {
    operation: Option<Arc<dyn Operation>>,
    inputs: Vec<Tensor>,
    grad: Option<Tensor>,
    expected: usize,
    received: usize,
    fired: bool,
}

/// A node of the autograd graph.
pub struct AutogradContext {
    id: u64,
    shape: Shape,
    state: Mutex<NodeState>,
}

impl fmt::Debug for AutogradContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AutogradContext")
            .field("id", &self.id)
            .field("op", &state.operation.as_ref().map(|op| op.name()))
            .field("expected", &state.expected)
            .field("received", &state.received)
            .field("fired", &state.fired)
            .finish()
    }
}

/// What a node hands to the walk when it fires.
struct Firing {
    operation: Option<Arc<dyn Operation>>,
    inputs: Vec<Tensor>,
    grad: Tensor,
}

impl AutogradContext {
    pub(crate) fn new(shape: Shape) -> Self {
        Self {
            id: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
            shape,
            state: Mutex::new(NodeState {
                operation: None,
                inputs: Vec::new(),
                grad: None,
                expected: 0,
                received: 0,
                fired: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the producing operation; `None` for a leaf.
    pub fn operation_name(&self) -> Option<&'static str> {
        self.lock().operation.as_ref().map(|op| op.name())
    }

    pub fn is_leaf(&self) -> bool {
        self.lock().operation.is_none()
    }

    pub fn expected_contributions(&self) -> usize {
        self.lock().expected
    }

    pub fn received_contributions(&self) -> usize {
        self.lock().received
    }

    pub fn has_fired(&self) -> bool {
        self.lock().fired
    }

    /// Accumulated gradient, `None` until the first contribution.
    pub fn grad(&self) -> Option<Tensor> {
        self.lock().grad.clone()
    }

    fn check_accepts_edge(&self) -> Result<()> {
        let state = self.lock();
        if state.received > 0 || state.fired {
            return Err(GraphError::EdgeAfterBackward.into());
        }
        Ok(())
    }

    /// Record `operation` as this node's producer. Every input that requires
    /// gradients expects one more contribution.
    pub(crate) fn set_operation(&self, operation: Arc<dyn Operation>, inputs: Vec<Tensor>) -> Result<()> {
        let tracked: Vec<&Arc<AutogradContext>> = inputs.iter().filter_map(|t| t.autograd.as_ref()).collect();
        for ctx in &tracked {
            ctx.check_accepts_edge()?;
        }
        for ctx in &tracked {
            ctx.lock().expected += 1;
        }
        let mut state = self.lock();
        state.operation = Some(operation);
        state.inputs = inputs;
        Ok(())
    }

    /// Add one contribution; returns the firing once the last expected one
    /// is in.
    fn accumulate(&self, incoming: Tensor) -> Result<Option<Firing>> {
        let incoming = if incoming.shape() == &self.shape {
            incoming
        } else {
            incoming.sum_to(&self.shape)?
        };

        let mut state = self.lock();
        if state.fired {
            return Err(GraphError::ContributionAfterFire.into());
        }
        let grad = match &state.grad {
            None => incoming.detach(),
            Some(acc) => acc.add(&incoming)?,
        };
        state.grad = Some(grad.clone());
        state.received += 1;
        if state.received < state.expected.max(1) {
            return Ok(None);
        }
        state.fired = true;
        Ok(Some(Firing {
            operation: state.operation.clone(),
            inputs: state.inputs.clone(),
            grad,
        }))
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.grad = None;
        state.expected = 0;
        state.received = 0;
        state.fired = false;
    }
}

/// Run `operation` forward and, if any input requires gradients, attach a
/// graph node recording it.
pub fn apply<O: Operation + 'static>(operation: O, inputs: &[&Tensor]) -> Result<Tensor> {
    if inputs.len() != operation.required_inputs() {
        return Err(GraphError::ArityMismatch {
            op: operation.name(),
            expected: operation.required_inputs(),
            found: inputs.len(),
        }
        .into());
    }
    let mut out = operation.compute(inputs)?;
    if inputs.iter().any(|t| t.requires_grad()) {
        let ctx = AutogradContext::new(out.shape.clone());
        ctx.set_operation(Arc::new(operation), inputs.iter().map(|&t| t.clone()).collect())?;
        out.autograd = Some(Arc::new(ctx));
    }
    Ok(out)
}

impl Tensor {
    /// Mark this tensor as a leaf that accumulates gradients. A tensor that
    /// already requires gradients is returned unchanged.
    pub fn track_grad(mut self) -> Tensor {
        if self.autograd.is_none() {
            self.autograd = Some(Arc::new(AutogradContext::new(self.shape.clone())));
        }
        self
    }

    pub fn requires_grad(&self) -> bool {
        self.autograd.is_some()
    }

    pub fn autograd(&self) -> Option<&Arc<AutogradContext>> {
        self.autograd.as_ref()
    }

    /// Same storage, no graph node.
    pub fn detach(&self) -> Tensor {
        Tensor {
            autograd: None,
            ..self.clone()
        }
    }

    /// Accumulated gradient of this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.autograd.as_ref().and_then(|ctx| ctx.grad())
    }

    /// Clear gradient and fan-in counters so the tensor can join a freshly
    /// built graph.
    pub fn zero_grad(&self) {
        if let Some(ctx) = &self.autograd {
            ctx.reset();
        }
    }

    /// Backpropagate from this tensor, seeded with ones.
    pub fn backward(&self) -> Result<()> {
        if self.autograd.is_none() {
            return Ok(());
        }
        self.backward_with(self.ones_like()?)
    }

    /// Backpropagate from this tensor, seeded with `grad`.
    ///
    /// No-op when the tensor does not require gradients. Errors abort the
    /// walk; gradients already accumulated stay where they are.
    pub fn backward_with(&self, grad: Tensor) -> Result<()> {
        let Some(root) = &self.autograd else {
            return Ok(());
        };
        if grad.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "backward",
                lhs: self.shape().clone(),
                rhs: grad.shape().clone(),
            });
        }

        let mut stack = vec![(Arc::clone(root), grad)];
        while let Some((node, grad)) = stack.pop() {
            let Some(firing) = node.accumulate(grad)? else {
                continue;
            };
            let Some(operation) = firing.operation else {
                continue;
            };
            let input_grads = operation.backward(&firing.grad, &firing.inputs)?;
            if input_grads.len() != firing.inputs.len() {
                return Err(GraphError::GradientCount {
                    op: operation.name(),
                    expected: firing.inputs.len(),
                    found: input_grads.len(),
                }
                .into());
            }
            tracing::trace!(op = operation.name(), node = node.id, "backward fired");
            for (input, g) in firing.inputs.iter().zip(input_grads) {
                if let Some(ctx) = &input.autograd {
                    stack.push((Arc::clone(ctx), g));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `out = x + y` with pass-through gradients.
    struct Plus;

    impl Operation for Plus {
        fn name(&self) -> &'static str {
            "plus"
        }

        fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
            inputs[0].add(inputs[1])
        }

        fn backward(&self, grad_output: &Tensor, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![grad_output.clone(), grad_output.clone()])
        }
    }

    /// Returns one gradient too few.
    struct Lossy;

    impl Operation for Lossy {
        fn name(&self) -> &'static str {
            "lossy"
        }

        fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
            inputs[0].add(inputs[1])
        }

        fn backward(&self, grad_output: &Tensor, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![grad_output.clone()])
        }
    }

    #[test]
    fn test_fan_in_counts() {
        let x = Tensor::ones([2]).track_grad();
        let y = apply(Plus, &[&x, &x]).unwrap();
        let z = apply(Plus, &[&y, &x]).unwrap();
        assert_eq!(x.autograd().unwrap().expected_contributions(), 3);
        assert_eq!(y.autograd().unwrap().expected_contributions(), 1);

        z.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![3.0, 3.0]);
        assert!(x.autograd().unwrap().has_fired());
        assert_eq!(z.autograd().unwrap().operation_name(), Some("plus"));
    }

    #[test]
    fn test_untracked_inputs_get_no_node() {
        let a = Tensor::ones([2]);
        let out = apply(Plus, &[&a, &a]).unwrap();
        assert!(!out.requires_grad());
        out.backward().unwrap();
        assert!(a.grad().is_none());
    }

    #[test]
    fn test_arity_mismatch() {
        let a = Tensor::ones([2]);
        let err = apply(Plus, &[&a]).unwrap_err();
        assert_eq!(
            err,
            TensorError::Graph(GraphError::ArityMismatch {
                op: "plus",
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn test_gradient_count_checked() {
        let a = Tensor::ones([2]).track_grad();
        let out = apply(Lossy, &[&a, &a]).unwrap();
        assert!(matches!(
            out.backward(),
            Err(TensorError::Graph(GraphError::GradientCount { expected: 2, found: 1, .. }))
        ));
    }

    #[test]
    fn test_single_pass_guards() {
        let x = Tensor::ones([2]).track_grad();
        let y = apply(Plus, &[&x, &x]).unwrap();
        y.backward().unwrap();

        // x has been reached; no new consumers until it is reset.
        assert_eq!(
            apply(Plus, &[&x, &x]).unwrap_err(),
            TensorError::Graph(GraphError::EdgeAfterBackward)
        );
        assert_eq!(y.backward().unwrap_err(), TensorError::Graph(GraphError::ContributionAfterFire));

        x.zero_grad();
        assert!(x.grad().is_none());
        let y2 = apply(Plus, &[&x, &x]).unwrap();
        y2.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_seed_shape_checked() {
        let x = Tensor::ones([2]).track_grad();
        assert!(matches!(
            x.backward_with(Tensor::ones([3])),
            Err(TensorError::ShapeMismatch { op: "backward", .. })
        ));
    }
}
