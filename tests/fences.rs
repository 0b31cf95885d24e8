mod common;

use common::*;
use pulse::*;
use std::time::{Duration, Instant};

#[test]
fn waiting_on_nothing_returns_immediately() {
    let (_backend, device) = software_device();
    let start = Instant::now();
    device.wait_for_fences(&[], true, Duration::from_secs(60)).unwrap();
    device.wait_for_fences(&[], false, Duration::ZERO).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn fresh_fences_are_ready() {
    let (_backend, device) = software_device();
    let a = device.create_fence().unwrap();
    let b = device.create_fence().unwrap();
    assert!(a.is_ready());
    device.wait_for_fences(&[&a, &b], true, Duration::ZERO).unwrap();
    device.wait_for_fences_default(&[&a], false).unwrap();
    device.destroy_fence(a).unwrap();
    device.destroy_fence(b).unwrap();
}

#[test]
fn submitted_fence_signals_after_work() {
    let (_backend, device) = software_device();
    let out = buffer(&device, BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD, 256 * 4);
    let code = flat_index_kernel(16);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readwrite_storage_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();
    let idle = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.bind_storage_buffers(&[&out]).unwrap();
    pass.dispatch(16, 16, 1).unwrap();
    pass.end().unwrap();
    list.submit(Some(&fence)).unwrap();

    // `idle` was never submitted, so any-of returns at once
    device.wait_for_fences(&[&fence, &idle], false, Duration::from_secs(30)).unwrap();
    device.wait_for_fences(&[&fence, &idle], true, Duration::from_secs(30)).unwrap();
    assert!(fence.is_ready());
    assert_eq!(list.state(), CommandListState::Ready);
    assert_eq!(read_u32s(&device, &out), (0..256).collect::<Vec<u32>>());

    list.release().unwrap();
    device.destroy_fence(fence).unwrap();
    device.destroy_fence(idle).unwrap();
    device.destroy_buffer(out).unwrap();
}

#[test]
fn fences_belong_to_their_device() {
    let backend = software_backend(DebugLevel::Low);
    let first = backend.create_device(&[]).unwrap();
    let second = backend.create_device(&[]).unwrap();
    let fence = first.create_fence().unwrap();

    assert_eq!(
        second.wait_for_fences(&[&fence], true, Duration::ZERO),
        Err(Error::InvalidDevice)
    );
    assert_eq!(second.destroy_fence(fence).err(), Some(Error::InvalidDevice));
}
