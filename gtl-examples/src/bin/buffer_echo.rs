//! Round-trips 64 bytes host -> device -> host through two copies and a
//! timeline semaphore, then fills the device buffer and reads it back again.

use gtl_rhi::{
    BufferCreateInfo, BufferMemoryBarrier, BufferUsage, Context, MemoryAccess, MemoryProperties,
    PipelineBarrier, PipelineStage, SignalSemaphoreInfo, WaitSemaphoreInfo, WHOLE_SIZE,
};

const SIZE: u64 = 64;

fn main() {
    env_logger::init();

    let mut ctx = Context::initialize("buffer_echo", 0, 1, 0).expect("initialize");

    let upload = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: SIZE,
            debug_name: Some("upload"),
            ..Default::default()
        })
        .expect("create upload buffer");

    let device_local = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
            size: SIZE,
            debug_name: Some("device"),
            ..Default::default()
        })
        .expect("create device buffer");

    let readback = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::TRANSFER_DST,
            memory_properties: MemoryProperties::HOST_VISIBLE
                | MemoryProperties::HOST_COHERENT
                | MemoryProperties::HOST_CACHED,
            size: SIZE,
            debug_name: Some("readback"),
            ..Default::default()
        })
        .expect("create readback buffer");

    let upload_ptr = ctx.get_buffer_cpu_ptr(upload);
    assert!(!upload_ptr.is_null());
    for i in 0..SIZE as usize {
        unsafe { upload_ptr.add(i).write(i as u8) };
    }

    let cmd = ctx.create_command_buffer().expect("create command buffer");
    ctx.begin_command_buffer(cmd).expect("begin");
    ctx.cmd_copy_buffer(cmd, upload, 0, device_local, 0, SIZE);
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
    ctx.cmd_copy_buffer(cmd, device_local, 0, readback, 0, SIZE);
    ctx.end_command_buffer(cmd);

    let semaphore = ctx.create_semaphore(0).expect("create semaphore");
    ctx.submit_command_buffer(
        cmd,
        &[SignalSemaphoreInfo { semaphore, value: 1 }],
        &[],
    );
    ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], u64::MAX)
        .expect("wait");

    let readback_ptr = ctx.get_buffer_cpu_ptr(readback);
    ctx.invalidate_mapped_memory(readback, 0, WHOLE_SIZE).expect("invalidate");
    for i in 0..SIZE as usize {
        let value = unsafe { readback_ptr.add(i).read() };
        assert_eq!(value, i as u8, "byte {i} did not round-trip");
    }
    println!("echo: {SIZE} bytes ok");

    // Fill pass: the creation padding keeps whole-buffer fills legal.
    let cmd2 = ctx.create_command_buffer().expect("create command buffer");
    ctx.begin_command_buffer(cmd2).expect("begin");
    ctx.cmd_fill_buffer(cmd2, device_local, 0, WHOLE_SIZE, 0xa5);
    ctx.cmd_pipeline_barrier(
        cmd2,
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
    ctx.cmd_copy_buffer(cmd2, device_local, 0, readback, 0, SIZE);
    ctx.end_command_buffer(cmd2);

    ctx.submit_command_buffer(
        cmd2,
        &[SignalSemaphoreInfo { semaphore, value: 2 }],
        &[WaitSemaphoreInfo { semaphore, value: 1 }],
    );
    ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 2 }], u64::MAX)
        .expect("wait");

    ctx.invalidate_mapped_memory(readback, 0, WHOLE_SIZE).expect("invalidate");
    for i in 0..SIZE as usize {
        assert_eq!(unsafe { readback_ptr.add(i).read() }, 0xa5);
    }
    println!("fill: {SIZE} bytes ok");

    ctx.destroy_semaphore(semaphore);
    ctx.destroy_command_buffer(cmd);
    ctx.destroy_command_buffer(cmd2);
    ctx.destroy_buffer(upload);
    ctx.destroy_buffer(device_local);
    ctx.destroy_buffer(readback);
}
