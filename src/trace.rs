//! Shadow autodiff graph.
//!
//! A traced array carries a [`Trace`]: a node of a reverse-mode computation graph that
//! mirrors every operation applied to the array. Each derived node stores a backward
//! closure mapping the gradient of its output to the gradients of its parents, in the
//! same `(out, back)` style as the rest of the crate's differentiable operations.
//!
//! Gradients are flat `f64` vectors in row-major logical order of the node's shape,
//! independent of the strides or element type of the array the node shadows.
//!
//! # Example
//!
//! ```rust
//! use sigma_core::trace::Trace;
//!
//! let x = Trace::leaf(&[2, 3]);
//! let y = x.permute(&[1, 0]);
//! let grads = y.backward_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! // y[j][i] = x[i][j]
//! assert_eq!(grads.get(&x).unwrap(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shape;

/// Maps the gradient of a node's output to the gradients of its parents.
pub type Backward = Box<dyn Fn(&[f64]) -> Vec<Vec<f64>> + Send + Sync>;

static NEXT_NODE: AtomicU64 = AtomicU64::new(0);

/// The operation that produced a trace node.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceOp {
    Leaf,
    Reshape,
    Flatten,
    Permute(Vec<usize>),
    Slice { begin: Vec<usize>, end: Vec<usize> },
    Add,
    Subtract,
    Multiply,
    Divide,
    SquareRoot,
    Sum,
}

struct TraceNode {
    id: u64,
    op: TraceOp,
    shape: Vec<usize>,
    parents: Vec<Trace>,
    backward: Option<Backward>,
}

/// Handle to a node of the autodiff graph. Cloning shares the node.
#[derive(Clone)]
pub struct Trace(Arc<TraceNode>);

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.0.id)
            .field("op", &self.0.op)
            .field("shape", &self.0.shape)
            .field("parents", &self.0.parents.iter().map(Trace::id).collect::<Vec<_>>())
            .finish()
    }
}

impl Trace {
    /// A fresh leaf node of the given shape.
    pub fn leaf(shape: &[usize]) -> Self {
        Self::node(TraceOp::Leaf, shape.to_vec(), Vec::new(), None)
    }

    /// A node derived from `parents`.
    ///
    /// `backward` must return one gradient per parent, each the length of that parent's
    /// shape.
    pub fn derived(op: TraceOp, shape: Vec<usize>, parents: Vec<Trace>, backward: Backward) -> Self {
        Self::node(op, shape, parents, Some(backward))
    }

    fn node(op: TraceOp, shape: Vec<usize>, parents: Vec<Trace>, backward: Option<Backward>) -> Self {
        Self(Arc::new(TraceNode {
            id: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
            op,
            shape,
            parents,
            backward,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn op(&self) -> &TraceOp {
        &self.0.op
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn parents(&self) -> &[Trace] {
        &self.0.parents
    }

    pub fn is_leaf(&self) -> bool {
        self.0.parents.is_empty()
    }

    /// Mirrors a reshape (or flatten when `flatten` is set).
    pub fn reshape(&self, new_shape: &[usize], flatten: bool) -> Self {
        let op = if flatten { TraceOp::Flatten } else { TraceOp::Reshape };
        Self::derived(
            op,
            new_shape.to_vec(),
            vec![self.clone()],
            Box::new(|grad| vec![grad.to_vec()]),
        )
    }

    /// Mirrors a permutation of the dimensions. `dims` must be a valid permutation.
    pub fn permute(&self, dims: &[usize]) -> Self {
        let in_shape = self.shape().to_vec();
        let out_shape = shape::permuted(&in_shape, dims);
        // walk the output gradient in the input's logical order
        let out_strides = shape::strides_for(&out_shape);
        let gather = shape::strided_offsets(
            &in_shape,
            &shape::permuted(&out_strides, &shape::inverse_permutation(dims)),
            0,
        );
        Self::derived(
            TraceOp::Permute(dims.to_vec()),
            out_shape,
            vec![self.clone()],
            Box::new(move |grad| vec![gather.iter().map(|&o| grad[o]).collect()]),
        )
    }

    /// Mirrors a slice `[begin, end)`. The range must be valid for this node's shape.
    pub fn slice(&self, begin: &[usize], end: &[usize]) -> Self {
        let in_shape = self.shape().to_vec();
        let out_shape: Vec<usize> = begin.iter().zip(end).map(|(b, e)| e - b).collect();
        let in_strides = shape::strides_for(&in_shape);
        let base: usize = begin.iter().zip(&in_strides).map(|(b, s)| b * s).sum();
        let scatter = shape::strided_offsets(&out_shape, &in_strides, base);
        let len = shape::product(&in_shape);
        Self::derived(
            TraceOp::Slice {
                begin: begin.to_vec(),
                end: end.to_vec(),
            },
            out_shape,
            vec![self.clone()],
            Box::new(move |grad| {
                let mut full = vec![0.0; len];
                for (&o, &g) in scatter.iter().zip(grad) {
                    full[o] += g;
                }
                vec![full]
            }),
        )
    }

    /// Reverse-mode gradients of every ancestor, seeded with ones.
    pub fn gradients(&self) -> Gradients {
        self.backward_from(&vec![1.0; shape::product(self.shape())])
    }

    /// Reverse-mode gradients of every ancestor, seeded with `seed`.
    pub fn backward_from(&self, seed: &[f64]) -> Gradients {
        let mut grads: HashMap<u64, Vec<f64>> = HashMap::new();
        grads.insert(self.id(), seed.to_vec());

        for node in self.topological_order().into_iter().rev() {
            let (Some(backward), Some(grad)) = (&node.0.backward, grads.get(&node.id())) else {
                continue;
            };
            let parent_grads = backward(grad);
            for (parent, g) in node.parents().iter().zip(parent_grads) {
                match grads.get_mut(&parent.id()) {
                    Some(acc) => acc.iter_mut().zip(&g).for_each(|(a, b)| *a += b),
                    None => {
                        grads.insert(parent.id(), g);
                    }
                }
            }
        }
        Gradients(grads)
    }

    /// Ancestors before descendants, ending with `self`.
    fn topological_order(&self) -> Vec<Trace> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node.id()) {
                continue;
            }
            stack.push((node.clone(), true));
            for parent in node.parents() {
                if !visited.contains(&parent.id()) {
                    stack.push((parent.clone(), false));
                }
            }
        }
        order
    }
}

/// Gradients keyed by trace node.
#[derive(Debug, Clone, Default)]
pub struct Gradients(HashMap<u64, Vec<f64>>);

impl Gradients {
    /// Gradient with respect to `node`, if it contributed to the output.
    pub fn get(&self, node: &Trace) -> Option<&[f64]> {
        self.0.get(&node.id()).map(Vec::as_slice)
    }
}

/// Sums a gradient over the dimensions an operand of `shape` was broadcast along to
/// produce `target`.
pub(crate) fn unbroadcast(grad: &[f64], shape: &[usize], target: &[usize]) -> Vec<f64> {
    if shape == target {
        return grad.to_vec();
    }
    let offsets = shape::strided_offsets(target, &shape::broadcast_strides(shape, target), 0);
    let mut reduced = vec![0.0; shape::product(shape)];
    for (&o, &g) in offsets.iter().zip(grad) {
        reduced[o] += g;
    }
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_scatters_into_zeros() {
        let x = Trace::leaf(&[3, 3]);
        let y = x.slice(&[1, 1], &[3, 2]);
        assert_eq!(y.shape(), &[2, 1]);
        let grads = y.backward_from(&[2.0, 3.0]);
        assert_eq!(
            grads.get(&x).unwrap(),
            &[0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0]
        );
    }

    #[test]
    fn shared_ancestors_accumulate() {
        let x = Trace::leaf(&[2]);
        let a = x.reshape(&[2, 1], false);
        let b = x.reshape(&[1, 2], false);
        let join = Trace::derived(
            TraceOp::Add,
            vec![2],
            vec![a, b],
            Box::new(|g| vec![g.to_vec(), g.to_vec()]),
        );
        assert_eq!(join.gradients().get(&x).unwrap(), &[2.0, 2.0]);
    }

    #[test]
    fn unbroadcast_sums_stretched_dims() {
        let grad = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(unbroadcast(&grad, &[3], &[2, 3]), vec![5.0, 7.0, 9.0]);
        assert_eq!(unbroadcast(&grad, &[2, 1], &[2, 3]), vec![6.0, 15.0]);
        assert_eq!(unbroadcast(&grad, &[1], &[2, 3]), vec![21.0]);
    }

    #[test]
    fn permute_round_trip_is_identity() {
        let x = Trace::leaf(&[2, 3, 4]);
        let dims = [2, 0, 1];
        let y = x.permute(&dims).permute(&shape::inverse_permutation(&dims));
        assert_eq!(y.shape(), x.shape());
        let seed: Vec<f64> = (0..24).map(f64::from).collect();
        assert_eq!(y.backward_from(&seed).get(&x).unwrap(), seed.as_slice());
    }
}
