// End-to-end dispatches on the CPU backend

mod common;

use common::*;
use pulse::*;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

#[test]
fn global_invocation_ids_fill_buffer_in_row_major_order() {
    let (_backend, device) = software_device();
    let out = buffer(&device, BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD, 1024 * 4);
    let code = flat_index_kernel(32);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readwrite_storage_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_storage_buffers(&[&out]).unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.dispatch(32, 32, 1).unwrap();
    pass.end().unwrap();
    list.submit(Some(&fence)).unwrap();

    device.wait_for_fences(&[&fence], true, WAIT).unwrap();
    assert!(fence.is_ready());
    assert_eq!(read_u32s(&device, &out), (0..1024).collect::<Vec<u32>>());

    list.release().unwrap();
    device.destroy_fence(fence).unwrap();
    device.destroy_compute_pipeline(pipeline).unwrap();
    device.destroy_buffer(out).unwrap();
}

#[test]
fn uniform_data_and_read_only_inputs_reach_the_shader() {
    let (_backend, device) = software_device();
    let src = buffer(&device, BufferUsage::STORAGE_READ | BufferUsage::TRANSFER_UPLOAD, 64 * 4);
    let dst = buffer(&device, BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD, 64 * 4);
    write_u32s(&device, &src, &(0..64).map(|i| i * 10).collect::<Vec<_>>());

    let code = add_uniform_kernel();
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readonly_storage_buffers: 1,
            num_readwrite_storage_buffers: 1,
            num_uniform_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.bind_storage_buffers(&[&src]).unwrap();
    pass.bind_storage_buffers(&[&dst]).unwrap();
    pass.bind_uniform_data(0, &7u32.to_le_bytes()).unwrap();
    pass.dispatch(64, 1, 1).unwrap();
    pass.end().unwrap();
    list.submit(Some(&fence)).unwrap();
    device.wait_for_fences(&[&fence], true, WAIT).unwrap();

    let expected: Vec<u32> = (0..64).map(|i| i * 10 + 7).collect();
    assert_eq!(read_u32s(&device, &dst), expected);

    drop(list);
    device.destroy_fence(fence).unwrap();
    device.destroy_buffer(src).unwrap();
    device.destroy_buffer(dst).unwrap();
}

#[test]
fn rebinding_between_dispatches_does_not_touch_queued_work() {
    let (_backend, device) = software_device();
    let usage = BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD;
    let first = buffer(&device, usage, 16 * 4);
    let second = buffer(&device, usage, 16 * 4);
    let code = flat_index_kernel(16);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readwrite_storage_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.bind_storage_buffers(&[&first]).unwrap();
    pass.dispatch(8, 1, 1).unwrap();
    // The first dispatch keeps the group it was recorded with
    pass.bind_storage_buffers(&[&second]).unwrap();
    pass.dispatch(16, 1, 1).unwrap();
    pass.end().unwrap();
    list.submit(Some(&fence)).unwrap();
    device.wait_for_fences(&[&fence], true, WAIT).unwrap();

    let first_values = read_u32s(&device, &first);
    assert_eq!(&first_values[..8], &(0..8).collect::<Vec<u32>>()[..]);
    assert!(first_values[8..].iter().all(|&v| v == 0));
    assert_eq!(read_u32s(&device, &second), (0..16).collect::<Vec<u32>>());

    drop(list);
    device.destroy_fence(fence).unwrap();
    device.destroy_buffer(first).unwrap();
    device.destroy_buffer(second).unwrap();
}

#[test]
fn indirect_dispatch_reads_group_counts_at_execution() {
    let (_backend, device) = software_device();
    let out = buffer(&device, BufferUsage::STORAGE_WRITE | BufferUsage::TRANSFER_DOWNLOAD, 32 * 4);
    let args = buffer(&device, BufferUsage::STORAGE_READ | BufferUsage::TRANSFER_UPLOAD, 16);
    // Offset 4: x = 8, y = 2, z = 1
    write_u32s(&device, &args, &[99, 8, 2, 1]);

    let code = flat_index_kernel(8);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readwrite_storage_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.bind_storage_buffers(&[&out]).unwrap();
    assert_eq!(pass.dispatch_indirect(&args, 2), Err(Error::InvalidRegion));
    assert_eq!(pass.dispatch_indirect(&args, 8), Err(Error::InvalidRegion));
    pass.dispatch_indirect(&args, 4).unwrap();
    pass.end().unwrap();
    list.submit(Some(&fence)).unwrap();
    device.wait_for_fences(&[&fence], true, WAIT).unwrap();

    let values = read_u32s(&device, &out);
    assert_eq!(&values[..16], &(0..16).collect::<Vec<u32>>()[..]);
    assert!(values[16..].iter().all(|&v| v == 0));

    drop(list);
    device.destroy_fence(fence).unwrap();
    device.destroy_buffer(out).unwrap();
    device.destroy_buffer(args).unwrap();
}

#[test]
fn dispatch_then_copy_runs_in_recorded_order() {
    let (_backend, device) = software_device();
    let out = buffer(&device, BufferUsage::STORAGE_WRITE, 64 * 4);
    let readback = buffer(&device, BufferUsage::TRANSFER_DOWNLOAD, 64 * 4);
    let code = flat_index_kernel(8);
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineCreateInfo {
            num_readwrite_storage_buffers: 1,
            ..pipeline_info(&code)
        })
        .unwrap();
    let fence = device.create_fence().unwrap();

    let mut list = device.request_command_list(CommandListUsage::General).unwrap();
    let mut pass = list.begin_compute_pass().unwrap();
    pass.bind_compute_pipeline(&pipeline).unwrap();
    pass.bind_storage_buffers(&[&out]).unwrap();
    pass.dispatch(8, 8, 1).unwrap();
    pass.end().unwrap();
    list.copy_buffer_to_buffer(&whole(&out), &whole(&readback)).unwrap();
    list.submit(Some(&fence)).unwrap();
    device.wait_for_fences(&[&fence], true, WAIT).unwrap();

    assert_eq!(read_u32s(&device, &readback), (0..64).collect::<Vec<u32>>());

    drop(list);
    device.destroy_fence(fence).unwrap();
    device.destroy_buffer(out).unwrap();
    device.destroy_buffer(readback).unwrap();
}

#[test]
fn malformed_shaders_fail_pipeline_creation() {
    let (_backend, device) = software_device();
    let code = flat_index_kernel(4);

    assert_eq!(
        device.create_compute_pipeline(&pipeline_info(&code[..code.len() - 3])).err(),
        Some(Error::InitializationFailed)
    );
    assert_eq!(
        device
            .create_compute_pipeline(&ComputePipelineCreateInfo::spirv(&code, "missing"))
            .err(),
        Some(Error::InitializationFailed)
    );
    assert_eq!(
        device
            .create_compute_pipeline(&ComputePipelineCreateInfo {
                format: ShaderFormats::WGSL,
                ..pipeline_info(&code)
            })
            .err(),
        Some(Error::BackendsCandidatesShaderFormatMismatch)
    );
}
