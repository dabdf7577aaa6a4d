//! Integration tests that need a live GPU. Run with `cargo test -- --ignored`
//! on a machine with a suitable device.

use gtl_rhi::{
    BufferCreateInfo, BufferMemoryBarrier, BufferUsage, Context, MemoryAccess, MemoryProperties,
    PipelineBarrier, PipelineStage, SignalSemaphoreInfo, WaitSemaphoreInfo, WHOLE_SIZE,
};

fn init_context(name: &str) -> Context {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::initialize(name, 0, 1, 0).expect("no suitable GPU for integration test")
}

#[test]
#[ignore = "requires a GPU"]
fn buffer_echo_roundtrip() {
    let mut ctx = init_context("buffer_echo_roundtrip");

    let upload = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: 64,
            ..Default::default()
        })
        .unwrap();
    let device_local = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
            size: 64,
            ..Default::default()
        })
        .unwrap();
    let readback = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::HOST_VISIBLE
                | MemoryProperties::HOST_COHERENT
                | MemoryProperties::HOST_CACHED,
            size: 64,
            ..Default::default()
        })
        .unwrap();

    // The reported size is padded up to the base alignment.
    assert!(ctx.get_buffer_size(upload) >= 64);
    assert_eq!(ctx.get_buffer_size(upload) % 32, 0);

    let ptr = ctx.get_buffer_cpu_ptr(upload);
    assert!(!ptr.is_null());
    for i in 0..64 {
        unsafe { ptr.add(i).write(i as u8) };
    }

    let cmd = ctx.create_command_buffer().unwrap();
    ctx.begin_command_buffer(cmd).unwrap();
    ctx.cmd_copy_buffer(cmd, upload, 0, device_local, 0, 64);
    ctx.cmd_pipeline_barrier(
        cmd,
        &PipelineBarrier {
            buffer_barriers: &[BufferMemoryBarrier {
                buffer: device_local,
                src_stage_mask: PipelineStage::TRANSFER,
                src_access_mask: MemoryAccess::TRANSFER_WRITE,
                dst_stage_mask: PipelineStage::TRANSFER,
                dst_access_mask: MemoryAccess::TRANSFER_READ,
                offset: 0,
                size: WHOLE_SIZE,
            }],
            ..Default::default()
        },
    );
    ctx.cmd_copy_buffer(cmd, device_local, 0, readback, 0, 64);
    ctx.end_command_buffer(cmd);

    let semaphore = ctx.create_semaphore(0).unwrap();
    ctx.submit_command_buffer(cmd, &[SignalSemaphoreInfo { semaphore, value: 1 }], &[]);
    ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], u64::MAX)
        .unwrap();

    let out = ctx.get_buffer_cpu_ptr(readback);
    ctx.invalidate_mapped_memory(readback, 0, WHOLE_SIZE).unwrap();
    for i in 0..64 {
        assert_eq!(unsafe { out.add(i).read() }, i as u8);
    }

    ctx.destroy_semaphore(semaphore);
    ctx.destroy_command_buffer(cmd);
    ctx.destroy_buffer(upload);
    ctx.destroy_buffer(device_local);
    ctx.destroy_buffer(readback);
}

#[test]
#[ignore = "requires a GPU"]
fn timeline_ordering() {
    let mut ctx = init_context("timeline_ordering");

    let semaphore = ctx.create_semaphore(0).unwrap();

    let cmd_a = ctx.create_command_buffer().unwrap();
    ctx.begin_command_buffer(cmd_a).unwrap();
    ctx.end_command_buffer(cmd_a);

    let cmd_b = ctx.create_command_buffer().unwrap();
    ctx.begin_command_buffer(cmd_b).unwrap();
    ctx.end_command_buffer(cmd_b);

    ctx.submit_command_buffer(cmd_a, &[SignalSemaphoreInfo { semaphore, value: 10 }], &[]);
    ctx.submit_command_buffer(
        cmd_b,
        &[SignalSemaphoreInfo { semaphore, value: 11 }],
        &[WaitSemaphoreInfo { semaphore, value: 10 }],
    );

    ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 11 }], u64::MAX)
        .unwrap();

    ctx.destroy_command_buffer(cmd_a);
    ctx.destroy_command_buffer(cmd_b);
    ctx.destroy_semaphore(semaphore);
}

#[test]
#[ignore = "requires a GPU"]
fn wait_timeout_is_reported() {
    let ctx = {
        let mut ctx = init_context("wait_timeout_is_reported");
        let semaphore = ctx.create_semaphore(0).unwrap();
        let result =
            ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], 1_000_000);
        assert!(matches!(result, Err(gtl_rhi::GpuError::Timeout)));
        ctx.destroy_semaphore(semaphore);
        ctx
    };
    drop(ctx);
}
