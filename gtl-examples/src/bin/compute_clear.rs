//! Dispatches a compute kernel that clears a 16x16 storage image to 0.5 and
//! mirrors every texel into a storage buffer, then reads the buffer back.
//!
//! The kernel is assembled directly as SPIR-V words so the demo has no
//! shader-compiler dependency.

use gtl_rhi::{
    BindSet, Bindings, BufferBinding, BufferCreateInfo, BufferMemoryBarrier, BufferUsage,
    ComputePipelineCreateInfo, Context, ImageBinding, ImageCreateInfo, ImageFormat, ImageUsage,
    MemoryAccess, MemoryProperties, PipelineBarrier, PipelineStage, ShaderCreateInfo, ShaderStage,
    SignalSemaphoreInfo, WaitSemaphoreInfo, WHOLE_SIZE,
};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

/// layout(local_size_x = 8, local_size_y = 8) in;
/// layout(set = 0, binding = 0, r32f) uniform image2D img;
/// layout(set = 0, binding = 1) buffer Out { float data[]; };
/// void main() {
///     imageStore(img, ivec2(gl_GlobalInvocationID.xy), vec4(0.5));
///     data[gl_GlobalInvocationID.y * 16 + gl_GlobalInvocationID.x] = 0.5;
/// }
fn clear_shader_spirv() -> Vec<u8> {
    let mut words: Vec<u32> = vec![0x0723_0203, 0x0001_0000, 0, 35, 0];
    let mut inst = |opcode: u32, operands: &[u32]| {
        words.push(((operands.len() as u32 + 1) << 16) | opcode);
        words.extend_from_slice(operands);
    };

    const MAIN: u32 = 0x6e69_616d; // "main"

    inst(17, &[1]); // OpCapability Shader
    inst(14, &[0, 1]); // OpMemoryModel Logical GLSL450
    inst(15, &[5, 1, MAIN, 0, 15]); // OpEntryPoint GLCompute %1 "main" %15
    inst(16, &[1, 17, 8, 8, 1]); // OpExecutionMode LocalSize 8 8 1
    inst(71, &[13, 34, 0]); // img: DescriptorSet 0
    inst(71, &[13, 33, 0]); // img: Binding 0
    inst(71, &[15, 11, 28]); // gid: BuiltIn GlobalInvocationId
    inst(71, &[23, 6, 4]); // runtime array: ArrayStride 4
    inst(71, &[24, 3]); // block struct: BufferBlock
    inst(72, &[24, 0, 35, 0]); // member 0: Offset 0
    inst(71, &[26, 34, 0]); // buf: DescriptorSet 0
    inst(71, &[26, 33, 1]); // buf: Binding 1
    inst(19, &[2]); // %2 = void
    inst(33, &[3, 2]); // %3 = fn() -> void
    inst(22, &[4, 32]); // %4 = f32
    inst(21, &[5, 32, 0]); // %5 = u32
    inst(21, &[6, 32, 1]); // %6 = i32
    inst(23, &[7, 5, 3]); // %7 = vec3<u32>
    inst(23, &[8, 5, 2]); // %8 = vec2<u32>
    inst(23, &[9, 6, 2]); // %9 = vec2<i32>
    inst(23, &[10, 4, 4]); // %10 = vec4<f32>
    inst(25, &[11, 4, 1, 0, 0, 0, 2, 3]); // %11 = image2D, storage, r32f
    inst(32, &[12, 0, 11]); // %12 = ptr UniformConstant image
    inst(59, &[12, 13, 0]); // %13 = img
    inst(32, &[14, 1, 7]); // %14 = ptr Input vec3<u32>
    inst(59, &[14, 15, 1]); // %15 = gid
    inst(43, &[4, 16, 0x3f00_0000]); // %16 = 0.5f
    inst(44, &[10, 17, 16, 16, 16, 16]); // %17 = vec4(0.5)
    inst(29, &[23, 4]); // %23 = f32[]
    inst(30, &[24, 23]); // %24 = struct { f32[] }
    inst(32, &[25, 2, 24]); // %25 = ptr Uniform struct  (2 = Uniform)
    inst(59, &[25, 26, 2]); // %26 = buf
    inst(32, &[27, 2, 4]); // %27 = ptr Uniform f32
    inst(43, &[5, 28, 16]); // %28 = 16u
    inst(43, &[6, 29, 0]); // %29 = 0
    inst(54, &[2, 1, 0, 3]); // main
    inst(248, &[18]); // label
    inst(61, &[7, 19, 15]); // g = load gid
    inst(79, &[8, 20, 19, 19, 0, 1]); // gxy = shuffle
    inst(124, &[9, 21, 20]); // ixy = bitcast
    inst(61, &[11, 22, 13]); // imgv = load img
    inst(99, &[22, 21, 17]); // imageWrite(imgv, ixy, vec4(0.5))
    inst(81, &[5, 30, 19, 0]); // gx
    inst(81, &[5, 31, 19, 1]); // gy
    inst(132, &[5, 32, 31, 28]); // gy * 16
    inst(128, &[5, 33, 32, 30]); // + gx
    inst(65, &[27, 34, 26, 29, 33]); // chain = &buf.data[idx]
    inst(62, &[34, 16]); // store 0.5
    inst(253, &[]); // return
    inst(56, &[]); // end

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn main() {
    env_logger::init();

    let mut ctx = Context::initialize("compute_clear", 0, 1, 0).expect("initialize");

    let spirv = clear_shader_spirv();
    let shader = ctx
        .create_shader(&ShaderCreateInfo {
            source: &spirv,
            stage_flags: ShaderStage::COMPUTE,
            debug_name: Some("clear"),
            ..Default::default()
        })
        .expect("create shader");

    let image = ctx
        .create_image(&ImageCreateInfo {
            width: WIDTH,
            height: HEIGHT,
            format: ImageFormat::R32Sfloat,
            usage: ImageUsage::STORAGE,
            debug_name: Some("target"),
            ..Default::default()
        })
        .expect("create image");

    let output = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::STORAGE,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: (WIDTH * HEIGHT * 4) as u64,
            debug_name: Some("output"),
            ..Default::default()
        })
        .expect("create output buffer");

    let pipeline = ctx.create_compute_pipeline(&ComputePipelineCreateInfo {
        shader,
        debug_name: Some("clear"),
    });

    let bind_sets: Vec<BindSet> = ctx.create_bind_sets(pipeline, 1);
    let image_bindings = [ImageBinding { binding: 0, image, index: 0 }];
    ctx.update_bind_set(
        bind_sets[0],
        &Bindings {
            buffers: &[BufferBinding { binding: 1, buffer: output, ..Default::default() }],
            images: &image_bindings,
            ..Default::default()
        },
    );

    let cmd = ctx.create_command_buffer().expect("create command buffer");
    ctx.begin_command_buffer(cmd).expect("begin");
    ctx.cmd_transition_shader_image_layouts(cmd, shader, 0, &image_bindings);
    ctx.cmd_bind_pipeline(cmd, pipeline, &bind_sets, &[]);
    ctx.cmd_dispatch(cmd, WIDTH / 8, HEIGHT / 8, 1);
    ctx.cmd_pipeline_barrier(
        cmd,
        &PipelineBarrier {
            buffer_barriers: &[BufferMemoryBarrier {
                buffer: output,
                src_stage_mask: PipelineStage::COMPUTE_SHADER,
                src_access_mask: MemoryAccess::SHADER_WRITE,
                dst_stage_mask: PipelineStage::HOST,
                dst_access_mask: MemoryAccess::HOST_READ,
                offset: 0,
                size: WHOLE_SIZE,
            }],
            ..Default::default()
        },
    );
    ctx.end_command_buffer(cmd);

    let semaphore = ctx.create_semaphore(0).expect("create semaphore");
    ctx.submit_command_buffer(cmd, &[SignalSemaphoreInfo { semaphore, value: 1 }], &[]);
    ctx.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], u64::MAX)
        .expect("wait");

    let ptr = ctx.get_buffer_cpu_ptr(output) as *const f32;
    ctx.invalidate_mapped_memory(output, 0, WHOLE_SIZE).expect("invalidate");
    for i in 0..(WIDTH * HEIGHT) as usize {
        let texel = unsafe { ptr.add(i).read() };
        assert_eq!(texel, 0.5, "texel {i} not cleared");
    }
    println!("clear: {}x{} texels ok", WIDTH, HEIGHT);

    ctx.destroy_semaphore(semaphore);
    ctx.destroy_command_buffer(cmd);
    ctx.destroy_bind_sets(&bind_sets);
    ctx.destroy_pipeline(pipeline);
    ctx.destroy_buffer(output);
    ctx.destroy_image(image);
    ctx.destroy_shader(shader);
}
