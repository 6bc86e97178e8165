//! Elementwise kernels shared by every handler.
//!
//! Operands are gathered in row-major logical order (resolving strides, slices and
//! broadcasting), combined in `f64` with `rayon`, and stored back in the handler's element
//! type on the handler's backend. When any operand is traced, the result carries a trace
//! node whose backward closure yields one gradient per traced operand, reduced over the
//! dimensions that operand was broadcast along.

use rayon::prelude::*;
use tracing::instrument;

use super::{ComputationHandler, Operand};
use crate::buffer::ArrayData;
use crate::error::{Error, Result};
use crate::ndarray::NDArray;
use crate::shape;
use crate::trace::{Trace, TraceOp, unbroadcast};

/// Elementwise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn forward(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Subtract => a - b,
            Self::Multiply => a * b,
            Self::Divide => a / b,
        }
    }

    /// Partial derivatives `(d/da, d/db)` at `(a, b)`.
    fn partials(self, a: f64, b: f64) -> (f64, f64) {
        match self {
            Self::Add => (1.0, 1.0),
            Self::Subtract => (1.0, -1.0),
            Self::Multiply => (b, a),
            Self::Divide => (1.0 / b, -a / (b * b)),
        }
    }

    fn trace_op(self) -> TraceOp {
        match self {
            Self::Add => TraceOp::Add,
            Self::Subtract => TraceOp::Subtract,
            Self::Multiply => TraceOp::Multiply,
            Self::Divide => TraceOp::Divide,
        }
    }
}

/// An operand reduced to its logical values.
struct Resolved {
    shape: Vec<usize>,
    values: Vec<f64>,
    trace: Option<Trace>,
}

fn resolve<H: ComputationHandler + ?Sized>(handler: &H, operand: Operand<'_>) -> Result<Resolved> {
    let tag = handler.backend_tag();
    match operand {
        Operand::Array(array) => {
            handler.check_owned(array)?;
            Ok(Resolved {
                shape: array.shape().to_vec(),
                values: array.to_f64_vec()?,
                trace: array.trace().cloned(),
            })
        }
        Operand::Number(number) => {
            if let Some(found) = number.handler_tag().filter(|&found| found != tag) {
                return Err(Error::backend_mismatch(&tag, &found));
            }
            Ok(Resolved {
                shape: vec![1],
                values: vec![number.value()],
                trace: number.trace().cloned(),
            })
        }
        Operand::Scalar(value) => Ok(Resolved {
            shape: vec![1],
            values: vec![value],
            trace: None,
        }),
    }
}

fn store<H: ComputationHandler + ?Sized>(
    handler: &H,
    shape: Vec<usize>,
    values: &[f64],
    trace: Option<Trace>,
) -> Result<NDArray> {
    let data = ArrayData::from_f64_saturating(handler.data_type(), values, &handler.location())?;
    let array = NDArray::from_data(data, shape, handler.backend_tag())?;
    Ok(match trace {
        Some(trace) => array.with_trace(trace),
        None => array,
    })
}

/// Values of `operand` repeated along the broadcast dimensions of `target`.
fn broadcast(operand: &Resolved, target: &[usize]) -> Vec<f64> {
    if operand.shape == target {
        return operand.values.clone();
    }
    shape::strided_offsets(target, &shape::broadcast_strides(&operand.shape, target), 0)
        .into_par_iter()
        .map(|o| operand.values[o])
        .collect()
}

#[instrument(level = "trace", skip_all, fields(op = ?op, a = %a, b = %b))]
pub(super) fn binary<H: ComputationHandler + ?Sized>(
    handler: &H,
    op: BinaryOp,
    a: Operand<'_>,
    b: Operand<'_>,
) -> Result<NDArray> {
    handler.check_ready()?;
    let a = resolve(handler, a)?;
    let b = resolve(handler, b)?;
    let out_shape = shape::broadcast_shapes(&a.shape, &b.shape)?;

    let av = broadcast(&a, &out_shape);
    let bv = broadcast(&b, &out_shape);
    let out: Vec<f64> = av
        .par_iter()
        .zip(bv.par_iter())
        .map(|(&x, &y)| op.forward(x, y))
        .collect();

    let parents: Vec<(Trace, bool)> = [(&a, true), (&b, false)]
        .into_iter()
        .filter_map(|(operand, is_left)| operand.trace.clone().map(|t| (t, is_left)))
        .collect();
    let trace = (!parents.is_empty()).then(|| {
        let shapes: Vec<Vec<usize>> = parents.iter().map(|(t, _)| t.shape().to_vec()).collect();
        let sides: Vec<bool> = parents.iter().map(|(_, is_left)| *is_left).collect();
        let target = out_shape.clone();
        Trace::derived(
            op.trace_op(),
            out_shape.clone(),
            parents.into_iter().map(|(t, _)| t).collect(),
            Box::new(move |grad| {
                let (da, db): (Vec<f64>, Vec<f64>) = grad
                    .par_iter()
                    .zip(av.par_iter().zip(bv.par_iter()))
                    .map(|(&g, (&x, &y))| {
                        let (pa, pb) = op.partials(x, y);
                        (g * pa, g * pb)
                    })
                    .unzip();
                sides
                    .iter()
                    .zip(&shapes)
                    .map(|(&is_left, shape)| {
                        let full = if is_left { &da } else { &db };
                        unbroadcast(full, shape, &target)
                    })
                    .collect()
            }),
        )
    });

    store(handler, out_shape, &out, trace)
}

#[instrument(level = "trace", skip_all, fields(a = %a))]
pub(super) fn square_root<H: ComputationHandler + ?Sized>(handler: &H, a: Operand<'_>) -> Result<NDArray> {
    handler.check_ready()?;
    let a = resolve(handler, a)?;
    let out: Vec<f64> = a.values.par_iter().map(|v| v.sqrt()).collect();

    let trace = a.trace.map(|parent| {
        let roots = out.clone();
        Trace::derived(
            TraceOp::SquareRoot,
            a.shape.clone(),
            vec![parent],
            Box::new(move |grad| {
                vec![grad
                    .iter()
                    .zip(&roots)
                    .map(|(g, r)| g * 0.5 / r)
                    .collect()]
            }),
        )
    });

    store(handler, a.shape, &out, trace)
}

#[instrument(level = "trace", skip_all, fields(a = %a))]
pub(super) fn sum<H: ComputationHandler + ?Sized>(handler: &H, a: Operand<'_>) -> Result<NDArray> {
    handler.check_ready()?;
    let a = resolve(handler, a)?;
    let total: f64 = a.values.par_iter().sum();

    let trace = a.trace.map(|parent| {
        let len = a.values.len();
        Trace::derived(
            TraceOp::Sum,
            vec![1],
            vec![parent],
            Box::new(move |grad| vec![vec![grad[0]; len]]),
        )
    });

    store(handler, vec![1], &[total], trace)
}
