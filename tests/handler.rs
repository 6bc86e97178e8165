use std::io::Cursor;

use assert_matches::assert_matches;
use rand::Rng;
use sigma_core::device::{DeviceContext, DeviceId};
use sigma_core::handler::BinaryOp;
use sigma_core::{Arithmetic, Backend, ComputationHandler, CpuHandler, CudaHandler, Error, Number};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn assert_close(got: &[f64], want: &[f64]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert!((g - w).abs() < 1e-9, "{got:?} != {want:?}");
    }
}

#[test]
fn test_elementwise_arithmetic() {
    init_tracing();
    let handler = CpuHandler::float64();
    let a = handler.create_from(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = handler.create_from(&[2, 2], &[4.0, 3.0, 2.0, 1.0]).unwrap();

    assert_eq!(handler.add(&a, &b).unwrap().to_f64_vec().unwrap(), vec![5.0; 4]);
    assert_eq!(
        handler.subtract(&a, &b).unwrap().to_f64_vec().unwrap(),
        vec![-3.0, -1.0, 1.0, 3.0]
    );
    assert_eq!(
        handler.multiply(&a, &b).unwrap().to_f64_vec().unwrap(),
        vec![4.0, 6.0, 6.0, 4.0]
    );
    assert_eq!(
        handler.divide(&a, 2.0).unwrap().to_f64_vec().unwrap(),
        vec![0.5, 1.0, 1.5, 2.0]
    );
    assert_eq!(
        handler.square_root(&b).unwrap().get_data_as::<f64>().unwrap()[0],
        2.0
    );
    assert_eq!(handler.sum(&a).unwrap().shape(), &[1]);
    assert_eq!(handler.sum(&a).unwrap().to_f64_vec().unwrap(), vec![10.0]);

    let via_op = handler
        .apply_binary(BinaryOp::Subtract, (&b).into(), 1.0.into())
        .unwrap();
    assert_eq!(via_op.to_f64_vec().unwrap(), vec![3.0, 2.0, 1.0, 0.0]);
}

#[test]
fn test_arithmetic_on_views() {
    let handler = CpuHandler::float64();
    let a = handler
        .create_from(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
        .unwrap();
    let t = a.transpose().unwrap();
    let doubled = handler.multiply(&t, 2.0).unwrap();
    assert_eq!(doubled.shape(), &[3, 2]);
    assert!(doubled.is_contiguous());
    assert_eq!(
        doubled.get_data_as::<u8>().unwrap(),
        vec![0, 6, 2, 8, 4, 10]
    );
}

#[test]
fn test_broadcasting() {
    let handler = CpuHandler::float64();
    let matrix = handler
        .create_from(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        .unwrap();
    let row = handler.create_from(&[3], &[10.0, 20.0, 30.0]).unwrap();
    let column = handler.create_from(&[2, 1], &[100.0, 200.0]).unwrap();

    let by_row = handler.add(&matrix, &row).unwrap();
    assert_eq!(by_row.shape(), &[2, 3]);
    assert_eq!(
        by_row.to_f64_vec().unwrap(),
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );

    let outer = handler.add(&row, &column).unwrap();
    assert_eq!(outer.shape(), &[2, 3]);
    assert_eq!(
        outer.to_f64_vec().unwrap(),
        vec![110.0, 120.0, 130.0, 210.0, 220.0, 230.0]
    );

    let wrong = handler.create(&[2]).unwrap();
    assert_matches!(handler.add(&matrix, &wrong), Err(Error::ShapeMismatch { .. }));
}

#[test]
fn test_numbers_as_operands() {
    let handler = CpuHandler::float32();
    let a = handler.create_from(&[2], &[1.0, 2.0]).unwrap();
    let three = handler.number(3.0).unwrap();
    let free = Number::new(0.5, sigma_core::DataType::Float32).unwrap();

    assert_eq!(handler.multiply(&a, &three).unwrap().to_f64_vec().unwrap(), vec![3.0, 6.0]);
    assert_eq!(handler.add(&free, &a).unwrap().to_f64_vec().unwrap(), vec![1.5, 2.5]);

    let other = CpuHandler::float32();
    let foreign = other.number(1.0).unwrap();
    assert_matches!(handler.add(&a, &foreign), Err(Error::BackendMismatch { .. }));
}

#[test]
fn test_handlers_own_their_arrays() {
    let first = CpuHandler::float64();
    let second = CpuHandler::float64();
    let a = first.create(&[2]).unwrap();

    assert_matches!(second.add(&a, 1.0), Err(Error::BackendMismatch { .. }));
    assert_matches!(second.trace(&a), Err(Error::BackendMismatch { .. }));
    assert_eq!(first.backend(), Backend::Cpu);
}

#[test]
fn test_gradients_through_broadcast() {
    init_tracing();
    let handler = CpuHandler::float64();
    let x = handler
        .trace(&handler.create_from(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap())
        .unwrap();
    let w = handler
        .trace(&handler.create_from(&[2], &[0.5, -1.0]).unwrap())
        .unwrap();

    let loss = handler.sum(&handler.multiply(&x, &w).unwrap()).unwrap();
    let grads = loss.trace().unwrap().gradients();

    assert_close(grads.get(x.trace().unwrap()).unwrap(), &[0.5, -1.0, 0.5, -1.0]);
    assert_close(grads.get(w.trace().unwrap()).unwrap(), &[4.0, 6.0]);
}

#[test]
fn test_gradients_of_division_and_root() {
    let handler = CpuHandler::float64();
    let x = handler
        .trace(&handler.create_from(&[2], &[4.0, 9.0]).unwrap())
        .unwrap();
    let root = handler.square_root(&x).unwrap();
    let y = handler.sum(&handler.divide(1.0, &root).unwrap()).unwrap();
    let grads = y.trace().unwrap().gradients();

    // d/dx x^-1/2 = -1/2 x^-3/2
    assert_close(
        grads.get(x.trace().unwrap()).unwrap(),
        &[-0.5 / 8.0, -0.5 / 27.0],
    );
}

#[test]
fn test_gradients_through_views() {
    let handler = CpuHandler::float64();
    let x = handler
        .trace(
            &handler
                .create_from(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                .unwrap(),
        )
        .unwrap();
    let column = x.slice(&[0, 1], &[2, 2]).unwrap();
    let y = handler.sum(&handler.multiply(&column, &column).unwrap()).unwrap();
    let grads = y.trace().unwrap().gradients();
    assert_close(
        grads.get(x.trace().unwrap()).unwrap(),
        &[0.0, 4.0, 0.0, 0.0, 10.0, 0.0],
    );

    let t = x.transpose().unwrap();
    let scaled = handler.multiply(&t, &handler.create_from(&[3, 1], &[1.0, 2.0, 3.0]).unwrap()).unwrap();
    let grads = handler.sum(&scaled).unwrap().trace().unwrap().gradients();
    assert_close(
        grads.get(x.trace().unwrap()).unwrap(),
        &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0],
    );
}

#[test]
fn test_traced_numbers() {
    let handler = CpuHandler::float64();
    let a = handler.create_from(&[3], &[1.0, 2.0, 3.0]).unwrap();
    let k = handler.trace_number(&handler.number(2.0).unwrap()).unwrap();
    let y = handler.sum(&handler.multiply(&a, &k).unwrap()).unwrap();
    let grads = y.trace().unwrap().gradients();
    assert_close(grads.get(k.trace().unwrap()).unwrap(), &[6.0]);
}

#[test]
fn test_serialise_round_trip() {
    init_tracing();
    let handler = CpuHandler::float64();
    let a = handler
        .create_from(&[2, 3], &[0.5, -1.0, 2.0, 1e-3, 7.0, -8.25])
        .unwrap();
    let t = a.transpose().unwrap();

    let mut bytes = Vec::new();
    handler.serialise(&t, &mut bytes).unwrap();
    let back = handler.deserialise(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(back.shape(), &[3, 2]);
    assert!(back.is_contiguous());
    assert_eq!(back.to_f64_vec().unwrap(), t.to_f64_vec().unwrap());

    // any handler of the same family can read it
    let sibling = CpuHandler::float64();
    let copy = sibling.deserialise(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(copy.backend_tag(), sibling.backend_tag());
}

#[test]
fn test_serialise_random_arrays() {
    let mut rng = rand::rng();
    for handler in [CpuHandler::float32(), CpuHandler::float64()] {
        let shape: Vec<usize> = (0..rng.random_range(1..4))
            .map(|_| rng.random_range(1..5))
            .collect();
        let len = shape.iter().product::<usize>();
        let values: Vec<f64> = (0..len).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect();
        let a = handler.create_from(&shape, &values).unwrap();

        let mut bytes = Vec::new();
        handler.serialise(&a, &mut bytes).unwrap();
        let back = handler.deserialise(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(back.shape(), a.shape());
        assert_eq!(back.to_f64_vec().unwrap(), a.to_f64_vec().unwrap());
    }
}

#[test]
fn test_serialise_detects_corruption() {
    let handler = CpuHandler::float32();
    let a = handler.create_from(&[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut bytes = Vec::new();
    handler.serialise(&a, &mut bytes).unwrap();

    let mut flipped = bytes.clone();
    let data_byte = flipped.len() - 6;
    flipped[data_byte] ^= 0x40;
    assert_matches!(
        handler.deserialise(&mut Cursor::new(&flipped)),
        Err(Error::CorruptedData(_))
    );

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(handler.deserialise(&mut Cursor::new(&bad_magic)).is_err());

    let truncated = &bytes[..bytes.len() - 2];
    assert!(handler.deserialise(&mut Cursor::new(truncated)).is_err());
}

#[test]
fn test_serialise_requires_same_family() {
    let f64_handler = CpuHandler::float64();
    let f32_handler = CpuHandler::float32();
    let a = f64_handler.create_from(&[2], &[1.0, 2.0]).unwrap();

    let mut bytes = Vec::new();
    assert_matches!(
        f32_handler.serialise(&a, &mut bytes),
        Err(Error::UnsupportedFormat(_))
    );
    f64_handler.serialise(&a, &mut bytes).unwrap();
    assert_matches!(
        f32_handler.deserialise(&mut Cursor::new(&bytes)),
        Err(Error::UnsupportedFormat(_))
    );
}

#[test]
fn test_size_bytes() {
    let handler = CpuHandler::float64();
    let a = handler.create(&[2, 3]).unwrap();
    assert_eq!(
        handler.size_bytes(&a).unwrap(),
        6 * 8 + 2 * 2 * size_of::<usize>()
    );

    let f32_handler = CpuHandler::float32();
    let b = f32_handler.create(&[5]).unwrap();
    assert_eq!(f32_handler.size_bytes(&b).unwrap(), 5 * 4 + 2 * size_of::<usize>());
    assert_matches!(handler.size_bytes(&b), Err(Error::UnsupportedFormat(_)));
}

fn device_handler(id: u32) -> CudaHandler {
    CudaHandler::new(DeviceContext::host_staged(DeviceId(id)))
}

#[test]
fn test_device_operations_require_binding() {
    init_tracing();
    let handler = device_handler(100);
    DeviceContext::unbind_current_thread();
    assert_matches!(handler.create(&[2]), Err(Error::ContextNotBound { .. }));

    handler.context().bind_to_current_thread();
    let a = handler.create_from(&[2], &[1.0, 2.0]).unwrap();
    let b = handler.multiply(&a, 3.0).unwrap();
    assert_eq!(b.to_f64_vec().unwrap(), vec![3.0, 6.0]);
    assert_eq!(handler.context().live_allocations(), 2);

    let elsewhere = handler.clone();
    let result = std::thread::spawn(move || elsewhere.add(&b, 1.0).map(|_| ()))
        .join()
        .unwrap();
    assert_matches!(result, Err(Error::ContextNotBound { .. }));
}

#[test]
fn test_device_and_host_arrays_do_not_mix() {
    let device = device_handler(101);
    device.context().bind_to_current_thread();
    let host = CpuHandler::float32();

    let on_device = device.create(&[2]).unwrap();
    let on_host = host.create(&[2]).unwrap();
    assert_matches!(device.add(&on_device, &on_host), Err(Error::BackendMismatch { .. }));
    assert_matches!(host.add(&on_host, &on_device), Err(Error::BackendMismatch { .. }));
    assert_eq!(device.backend(), Backend::Cuda);
}

#[test]
fn test_device_arrays_are_freed_with_their_last_view() {
    let device = device_handler(102);
    let context = device.context().clone();
    context.bind_to_current_thread();

    let mut a = device.create_from(&[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let view = a.slice(&[1], &[3]).unwrap();
    a.release();
    assert_eq!(context.live_allocations(), 1);
    assert_eq!(view.get_data_as::<u8>().unwrap(), vec![2, 3]);
    drop(view);
    assert_eq!(context.live_allocations(), 0);
}

#[test]
fn test_device_serialisation() {
    let device = device_handler(103);
    device.context().bind_to_current_thread();
    let a = device.create_from(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let mut bytes = Vec::new();
    device.serialise(&a, &mut bytes).unwrap();

    let other = device_handler(104);
    other.context().bind_to_current_thread();
    let back = other.deserialise(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(back.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let host = CpuHandler::float32();
    assert_matches!(
        host.deserialise(&mut Cursor::new(&bytes)),
        Err(Error::UnsupportedFormat(_))
    );
}
