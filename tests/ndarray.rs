use assert_matches::assert_matches;
use proptest::prelude::*;
use sigma_core::{Arithmetic, ComputationHandler, CpuHandler, DataType, Error, NDArray, Number};

fn iota(handler: &CpuHandler, shape: &[usize]) -> NDArray {
    let len = shape.iter().product::<usize>();
    let values: Vec<f64> = (0..len).map(|v| v as f64).collect();
    handler.create_from(shape, &values).unwrap()
}

#[test]
fn test_creation_validates_shape() {
    let handler = CpuHandler::float32();
    assert_matches!(handler.create(&[]), Err(Error::InvalidShape { .. }));
    assert_matches!(handler.create(&[2, 0]), Err(Error::InvalidShape { .. }));
    assert_matches!(
        handler.create_from(&[2, 2], &[1.0, 2.0, 3.0]),
        Err(Error::ShapeMismatch { .. })
    );

    let zeros = handler.create(&[2, 3]).unwrap();
    assert_eq!(zeros.rank(), 2);
    assert_eq!(zeros.length(), 6);
    assert_eq!(zeros.strides(), &[3, 1]);
    assert_eq!(zeros.data_type(), DataType::Float32);
    assert!(zeros.is_matrix() && !zeros.is_vector() && !zeros.is_scalar());
    assert_eq!(zeros.to_f64_vec().unwrap(), vec![0.0; 6]);
}

#[test]
fn test_rank_predicates() {
    let handler = CpuHandler::float64();
    assert!(handler.create(&[1]).unwrap().is_scalar());
    assert!(handler.create(&[4]).unwrap().is_vector());
    assert!(!handler.create(&[1, 4]).unwrap().is_vector());
    assert!(!handler.create(&[2, 2, 2]).unwrap().is_matrix());
}

#[test]
fn test_value_access_and_conversion() {
    let handler = CpuHandler::float32();
    let mut a = handler.create(&[2, 2]).unwrap();
    a.set_value(0.1f64, &[1, 0]).unwrap();
    assert_eq!(a.get_value::<f64>(&[1, 0]).unwrap(), 0.1f32 as f64);
    assert_eq!(a.get_value::<f32>(&[1, 0]).unwrap(), 0.1);

    a.set_value(-3i32, &[0, 1]).unwrap();
    assert_eq!(a.get_value::<i64>(&[0, 1]).unwrap(), -3);
    assert_matches!(
        a.get_value::<u8>(&[0, 1]),
        Err(Error::TypeConversionError { target: "u8", .. })
    );
    assert_matches!(a.get_value::<f64>(&[2, 0]), Err(Error::IndexOutOfRange { .. }));
    assert_matches!(a.get_value::<f64>(&[0]), Err(Error::IndexOutOfRange { .. }));
}

#[test]
fn test_float32_rejects_unrepresentable_values() {
    let handler = CpuHandler::float32();
    let mut a = handler.create(&[1]).unwrap();
    assert_matches!(a.set_value(1e300f64, &[0]), Err(Error::TypeConversionError { .. }));
    assert_matches!(
        handler.create_from(&[2], &[1.0, 1e300]),
        Err(Error::TypeConversionError { target: "f32", .. })
    );
}

#[test]
fn test_float32_arithmetic_saturates() {
    let handler = CpuHandler::float32();
    let big = handler.create_from(&[1], &[3e38]).unwrap();
    let sum = handler.add(&big, &big).unwrap();
    assert_eq!(sum.get_value::<f64>(&[0]).unwrap(), f64::INFINITY);
}

#[test]
fn test_reshape_shares_contiguous_storage() {
    let handler = CpuHandler::float64();
    let a = iota(&handler, &[2, 3]);
    let mut b = a.reshape(&[3, 2]).unwrap();
    assert!(b.data().shares_storage(a.data()));

    b.set_value(42.0f64, &[2, 1]).unwrap();
    assert_eq!(a.get_value::<f64>(&[1, 2]).unwrap(), 42.0);

    assert_matches!(a.reshape(&[4, 2]), Err(Error::ShapeMismatch { .. }));
    assert_matches!(a.reshape(&[6, 0]), Err(Error::InvalidShape { .. }));
}

#[test]
fn test_reshape_of_transposed_copies() {
    let handler = CpuHandler::float64();
    let a = iota(&handler, &[2, 3]);
    let t = a.transpose().unwrap();
    assert!(!t.is_contiguous());

    let flat = t.flatten().unwrap();
    assert!(!flat.data().shares_storage(a.data()));
    assert_eq!(flat.shape(), &[6]);
    assert_eq!(
        flat.get_data_as::<u8>().unwrap(),
        vec![0, 3, 1, 4, 2, 5]
    );
}

#[test]
fn test_in_place_structural_ops() {
    let handler = CpuHandler::float64();
    let mut a = iota(&handler, &[2, 3, 4]);
    a.permute_in_place(&[2, 0, 1]).unwrap();
    assert_eq!(a.shape(), &[4, 2, 3]);
    assert_eq!(a.get_value::<u8>(&[3, 1, 2]).unwrap(), 23);

    a.transpose_in_place().unwrap();
    assert_eq!(a.shape(), &[3, 2, 4]);
    a.flatten_in_place().unwrap();
    assert_eq!(a.shape(), &[24]);
    a.reshape_in_place(&[6, 4]).unwrap();
    assert!(a.is_contiguous());

    assert_matches!(a.permute(&[0, 0]), Err(Error::InvalidPermutation { .. }));
    assert_matches!(a.permute(&[0]), Err(Error::InvalidPermutation { .. }));
}

#[test]
fn test_slice_reads_region() {
    let handler = CpuHandler::float64();
    let a = iota(&handler, &[3, 4]);
    let s = a.slice(&[1, 1], &[3, 3]).unwrap();
    assert_eq!(s.shape(), &[2, 2]);
    assert_eq!(s.get_data_as::<u8>().unwrap(), vec![5, 6, 9, 10]);
    assert!(s.data().shares_storage(a.data()));

    let mut s = s;
    s.set_value(-1.0f64, &[1, 0]).unwrap();
    assert_eq!(a.get_value::<f64>(&[2, 1]).unwrap(), -1.0);

    assert_matches!(a.slice(&[1, 1], &[1, 3]), Err(Error::InvalidRange { .. }));
    assert_matches!(a.slice(&[0, 0], &[4, 1]), Err(Error::InvalidRange { .. }));
    assert_matches!(a.slice(&[0], &[1]), Err(Error::InvalidRange { .. }));
}

#[test]
fn test_deep_copy_is_independent() {
    let handler = CpuHandler::float64();
    let a = handler.trace(&iota(&handler, &[2, 2])).unwrap();
    let mut b = a.deep_copy().unwrap();
    b.set_value(9.0f64, &[0, 0]).unwrap();

    assert_eq!(a.get_value::<f64>(&[0, 0]).unwrap(), 0.0);
    assert!(b.is_traced());
    assert_ne!(a.trace().unwrap().id(), b.trace().unwrap().id());
    assert_eq!(b.backend_tag(), a.backend_tag());
}

#[test]
fn test_release_keeps_views_alive() {
    let handler = CpuHandler::float64();
    let mut a = iota(&handler, &[4]);
    let view = a.slice(&[2], &[4]).unwrap();
    a.release();
    a.release();

    assert!(a.is_released());
    assert_matches!(a.to_f64_vec(), Err(Error::IndexOutOfRange { .. }));
    assert_eq!(view.get_data_as::<u8>().unwrap(), vec![2, 3]);
}

#[test]
fn test_traced_structural_ops_keep_graph_shape() {
    let handler = CpuHandler::float64();
    let a = handler.trace(&iota(&handler, &[2, 3])).unwrap();
    let t = a.transpose().unwrap();
    assert_eq!(t.trace().unwrap().shape(), t.shape());
    let s = a.slice(&[0, 1], &[2, 2]).unwrap();
    assert_eq!(s.trace().unwrap().shape(), &[2, 1]);
    let r = t.reshape(&[6]).unwrap();
    assert_eq!(r.trace().unwrap().shape(), &[6]);
}

#[test]
fn test_number_from_array() {
    let handler = CpuHandler::float32();
    let one = handler.create_from(&[1, 1], &[2.5]).unwrap();
    let n = Number::from_array(&one).unwrap();
    assert_eq!(n.value(), 2.5);
    assert_eq!(n.handler_tag(), Some(handler.backend_tag()));
    assert_eq!(n.data_type(), DataType::Float32);

    let two = handler.create(&[2]).unwrap();
    assert_matches!(Number::from_array(&two), Err(Error::ShapeMismatch { .. }));
}

fn shape_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..5, 1..5)
}

/// A shape, a permutation of its dimensions and a non-empty region of the permuted shape.
fn permuted_region_strategy()
-> impl Strategy<Value = (Vec<usize>, Vec<usize>, Vec<(usize, usize)>)> {
    shape_strategy()
        .prop_flat_map(|shape| {
            let rank = shape.len();
            (Just(shape), Just((0..rank).collect::<Vec<_>>()).prop_shuffle())
        })
        .prop_flat_map(|(shape, dims)| {
            let region: Vec<_> = dims
                .iter()
                .map(|&d| {
                    let n = shape[d];
                    (0..n).prop_flat_map(move |b| (Just(b), b + 1..=n)).boxed()
                })
                .collect();
            (Just(shape), Just(dims), region)
        })
}

/// Every multi-index of `shape` in row-major order.
fn all_indices(shape: &[usize]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    for &n in shape {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                (0..n).map(move |i| {
                    let mut index = prefix.clone();
                    index.push(i);
                    index
                })
            })
            .collect();
    }
    out
}

proptest! {
    #[test]
    fn prop_reshape_round_trip(shape in shape_strategy()) {
        let handler = CpuHandler::float64();
        let a = iota(&handler, &shape);
        let back = a.flatten().unwrap().reshape(&shape).unwrap();
        prop_assert_eq!(back.shape(), a.shape());
        prop_assert_eq!(back.to_f64_vec().unwrap(), a.to_f64_vec().unwrap());
    }

    #[test]
    fn prop_permute_then_inverse_is_identity(
        (shape, dims) in shape_strategy().prop_flat_map(|shape| {
            let rank = shape.len();
            (Just(shape), Just((0..rank).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let handler = CpuHandler::float64();
        let a = iota(&handler, &shape);
        let mut inverse = vec![0; dims.len()];
        for (i, &d) in dims.iter().enumerate() {
            inverse[d] = i;
        }
        let back = a.permute(&dims).unwrap().permute(&inverse).unwrap();
        prop_assert_eq!(back.shape(), a.shape());
        prop_assert_eq!(back.to_f64_vec().unwrap(), a.to_f64_vec().unwrap());
    }

    #[test]
    fn prop_slice_matches_direct_reads((shape, dims, region) in permuted_region_strategy()) {
        let handler = CpuHandler::float64();
        let a = iota(&handler, &shape).permute(&dims).unwrap();
        let begin: Vec<usize> = region.iter().map(|&(b, _)| b).collect();
        let end: Vec<usize> = region.iter().map(|&(_, e)| e).collect();

        let s = a.slice(&begin, &end).unwrap();
        let extents: Vec<usize> = region.iter().map(|&(b, e)| e - b).collect();
        prop_assert_eq!(s.shape(), extents.as_slice());
        prop_assert!(s.data().shares_storage(a.data()));
        for offset in all_indices(&extents) {
            let direct: Vec<usize> = offset.iter().zip(&begin).map(|(o, b)| o + b).collect();
            prop_assert_eq!(
                s.get_value::<f64>(&offset).unwrap(),
                a.get_value::<f64>(&direct).unwrap()
            );
        }
    }

    #[test]
    fn prop_transpose_swaps_indices(rows in 1usize..6, cols in 1usize..6, r in 0usize..6, c in 0usize..6) {
        prop_assume!(r < rows && c < cols);
        let handler = CpuHandler::float32();
        let a = iota(&handler, &[rows, cols]);
        let t = a.transpose().unwrap();
        prop_assert_eq!(
            t.get_value::<f64>(&[c, r]).unwrap(),
            a.get_value::<f64>(&[r, c]).unwrap()
        );
    }
}
