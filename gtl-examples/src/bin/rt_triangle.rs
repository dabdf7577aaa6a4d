//! Traces rays against a single triangle: builds a BLAS and a TLAS, links a
//! ray-gen/miss/closest-hit pipeline, and reads the payload results back
//! through a storage buffer. Every ray hits the triangle, so every written
//! value is the closest-hit payload.
//!
//! The three stages are assembled directly as SPIR-V 1.4 words.

use gtl_rhi::{
    BindSet, Bindings, BlasCreateInfo, BlasInstance, BufferBinding, BufferCreateInfo,
    BufferMemoryBarrier, BufferUsage, Context, MemoryAccess, MemoryProperties, PipelineBarrier,
    PipelineStage, RtHitGroup, RtPipelineCreateInfo, Shader, ShaderCreateInfo, ShaderStage,
    SignalSemaphoreInfo, TlasBinding, TlasCreateInfo, WaitSemaphoreInfo, WHOLE_SIZE,
};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

const MAIN: u32 = 0x6e69_616d; // "main"
const SPV_KHR_RAY_TRACING: [u32; 5] = [
    0x5f56_5053, // "SPV_"
    0x5f52_484b, // "KHR_"
    0x5f79_6172, // "ray_"
    0x6361_7274, // "trac"
    0x0067_6e69, // "ing\0"
];

const RAY_GENERATION: u32 = 5313;
const CLOSEST_HIT: u32 = 5316;
const MISS: u32 = 5317;
const BUILTIN_LAUNCH_ID: u32 = 5319;
const CAP_RAY_TRACING: u32 = 4479;
const OP_TRACE_RAY: u32 = 4445;
const STORAGE_STORAGE_BUFFER: u32 = 12;
const STORAGE_RAY_PAYLOAD: u32 = 5338;
const STORAGE_INCOMING_RAY_PAYLOAD: u32 = 5342;

struct Assembler {
    words: Vec<u32>,
}

impl Assembler {
    fn new(bound: u32) -> Self {
        // magic, SPIR-V 1.4, generator, bound, schema
        Self { words: vec![0x0723_0203, 0x0001_0400, 0, bound, 0] }
    }

    fn inst(&mut self, opcode: u32, operands: &[u32]) -> &mut Self {
        self.words.push(((operands.len() as u32 + 1) << 16) | opcode);
        self.words.extend_from_slice(operands);
        self
    }

    fn rt_prelude(&mut self) -> &mut Self {
        self.inst(17, &[1]); // OpCapability Shader
        self.inst(17, &[CAP_RAY_TRACING]); // OpCapability RayTracingKHR
        self.inst(10, &SPV_KHR_RAY_TRACING); // OpExtension
        self.inst(14, &[0, 1]) // OpMemoryModel Logical GLSL450
    }

    fn bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// layout(set = 0, binding = 0) uniform accelerationStructureEXT tlas;
/// layout(set = 0, binding = 1) buffer Out { float data[]; };
/// layout(location = 0) rayPayloadEXT float hit_value;
/// void main() {
///     traceRayEXT(tlas, OPAQUE, 0xff, 0, 0, 0,
///                 vec3(0, 0, -1), 0.001, vec3(0, 0, 1), 100.0, 0);
///     data[gl_LaunchIDEXT.y * 16 + gl_LaunchIDEXT.x] = hit_value;
/// }
fn raygen_spirv() -> Vec<u8> {
    let mut m = Assembler::new(42);
    m.rt_prelude()
        .inst(15, &[RAY_GENERATION, 1, MAIN, 0, 11, 15, 17, 19])
        .inst(71, &[11, 34, 0]) // tlas: DescriptorSet 0
        .inst(71, &[11, 33, 0]) // tlas: Binding 0
        .inst(71, &[12, 6, 4]) // runtime array: ArrayStride 4
        .inst(71, &[13, 2]) // out block: Block
        .inst(72, &[13, 0, 35, 0]) // member 0: Offset 0
        .inst(71, &[15, 34, 0]) // out: DescriptorSet 0
        .inst(71, &[15, 33, 1]) // out: Binding 1
        .inst(71, &[19, 11, BUILTIN_LAUNCH_ID]) // BuiltIn LaunchIdKHR
        .inst(19, &[2]) // %2 = void
        .inst(33, &[3, 2]) // %3 = fn() -> void
        .inst(22, &[4, 32]) // %4 = f32
        .inst(21, &[5, 32, 0]) // %5 = u32
        .inst(21, &[6, 32, 1]) // %6 = i32
        .inst(23, &[7, 5, 3]) // %7 = vec3<u32>
        .inst(23, &[8, 4, 3]) // %8 = vec3<f32>
        .inst(5341, &[9]) // %9 = acceleration structure
        .inst(32, &[10, 0, 9]) // %10 = ptr UniformConstant
        .inst(59, &[10, 11, 0]) // %11 = tlas
        .inst(29, &[12, 4]) // %12 = f32[]
        .inst(30, &[13, 12]) // %13 = struct { f32[] }
        .inst(32, &[14, STORAGE_STORAGE_BUFFER, 13]) // %14 = ptr StorageBuffer
        .inst(59, &[14, 15, STORAGE_STORAGE_BUFFER]) // %15 = out
        .inst(32, &[16, STORAGE_RAY_PAYLOAD, 4]) // %16 = ptr RayPayloadKHR f32
        .inst(59, &[16, 17, STORAGE_RAY_PAYLOAD]) // %17 = hit_value
        .inst(32, &[18, 1, 7]) // %18 = ptr Input vec3<u32>
        .inst(59, &[18, 19, 1]) // %19 = gl_LaunchIDEXT
        .inst(32, &[20, STORAGE_STORAGE_BUFFER, 4]) // %20 = ptr StorageBuffer f32
        .inst(43, &[4, 21, 0x0000_0000]) // %21 = 0.0
        .inst(43, &[4, 22, 0x3f80_0000]) // %22 = 1.0
        .inst(43, &[4, 23, 0x3a83_126f]) // %23 = 0.001
        .inst(43, &[4, 24, 0x42c8_0000]) // %24 = 100.0
        .inst(43, &[4, 26, 0xbf80_0000]) // %26 = -1.0
        .inst(44, &[8, 25, 21, 21, 26]) // %25 = vec3(0, 0, -1)
        .inst(44, &[8, 27, 21, 21, 22]) // %27 = vec3(0, 0, 1)
        .inst(43, &[5, 28, 16]) // %28 = 16u
        .inst(43, &[5, 29, 0]) // %29 = 0u
        .inst(43, &[5, 30, 1]) // %30 = 1u (OPAQUE ray flag)
        .inst(43, &[5, 31, 255]) // %31 = 0xffu
        .inst(43, &[6, 32, 0]) // %32 = 0
        .inst(54, &[2, 1, 0, 3]) // main
        .inst(248, &[33]) // label
        .inst(61, &[7, 34, 19]) // launch id
        .inst(61, &[9, 35, 11]) // tlas
        .inst(
            OP_TRACE_RAY,
            &[35, 30, 31, 29, 29, 29, 25, 23, 27, 24, 17],
        )
        .inst(81, &[5, 36, 34, 0]) // x
        .inst(81, &[5, 37, 34, 1]) // y
        .inst(132, &[5, 38, 37, 28]) // y * 16
        .inst(128, &[5, 39, 38, 36]) // + x
        .inst(61, &[4, 40, 17]) // payload
        .inst(65, &[20, 41, 15, 32, 39]) // &out.data[idx]
        .inst(62, &[41, 40]) // store
        .inst(253, &[]) // return
        .inst(56, &[]); // end
    m.bytes()
}

/// layout(location = 0) rayPayloadInEXT float hit_value;
/// void main() { hit_value = <value>; }
fn payload_write_spirv(execution_model: u32, value_bits: u32) -> Vec<u8> {
    let mut m = Assembler::new(9);
    m.rt_prelude()
        .inst(15, &[execution_model, 1, MAIN, 0, 6])
        .inst(19, &[2]) // void
        .inst(33, &[3, 2]) // fn
        .inst(22, &[4, 32]) // f32
        .inst(32, &[5, STORAGE_INCOMING_RAY_PAYLOAD, 4])
        .inst(59, &[5, 6, STORAGE_INCOMING_RAY_PAYLOAD])
        .inst(43, &[4, 7, value_bits])
        .inst(54, &[2, 1, 0, 3])
        .inst(248, &[8])
        .inst(62, &[6, 7])
        .inst(253, &[])
        .inst(56, &[]);
    m.bytes()
}

fn main() {
    env_logger::init();

    let mut ctx = Context::initialize("rt_triangle", 0, 1, 0).expect("initialize");

    // Triangle spanning the z = 0 plane around the origin.
    let vertices: [f32; 9] = [-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 0.0, 1.0, 0.0];
    let indices: [u32; 3] = [0, 1, 2];

    let vertex_buffer = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT
                | BufferUsage::SHADER_DEVICE_ADDRESS,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: std::mem::size_of_val(&vertices) as u64,
            debug_name: Some("triangle vertices"),
            ..Default::default()
        })
        .expect("create vertex buffer");
    let index_buffer = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT
                | BufferUsage::SHADER_DEVICE_ADDRESS,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: std::mem::size_of_val(&indices) as u64,
            debug_name: Some("triangle indices"),
            ..Default::default()
        })
        .expect("create index buffer");

    unsafe {
        std::ptr::copy_nonoverlapping(
            vertices.as_ptr() as *const u8,
            ctx.get_buffer_cpu_ptr(vertex_buffer),
            std::mem::size_of_val(&vertices),
        );
        std::ptr::copy_nonoverlapping(
            indices.as_ptr() as *const u8,
            ctx.get_buffer_cpu_ptr(index_buffer),
            std::mem::size_of_val(&indices),
        );
    }

    let blas = ctx
        .create_blas(&BlasCreateInfo {
            vertex_buffer,
            index_buffer,
            max_vertex: 2,
            triangle_count: 1,
            is_opaque: true,
            debug_name: Some("triangle"),
        })
        .expect("build BLAS");

    let tlas = ctx
        .create_tlas(&TlasCreateInfo {
            instances: &[BlasInstance {
                blas,
                hit_group_index: 0,
                instance_custom_index: 0,
                transform: [
                    [1.0, 0.0, 0.0, 0.0],
                    [0.0, 1.0, 0.0, 0.0],
                    [0.0, 0.0, 1.0, 0.0],
                ],
            }],
            debug_name: Some("scene"),
        })
        .expect("build TLAS");

    let rgen_source = raygen_spirv();
    let miss_source = payload_write_spirv(MISS, 0x3e80_0000); // 0.25
    let chit_source = payload_write_spirv(CLOSEST_HIT, 0x3f80_0000); // 1.0

    fn rt_shader<'a>(source: &'a [u8], stage: ShaderStage, name: &'a str) -> ShaderCreateInfo<'a> {
        ShaderCreateInfo {
            source,
            stage_flags: stage,
            debug_name: Some(name),
            max_ray_payload_size: 4,
            max_ray_hit_attribute_size: 8,
        }
    }

    let shaders = ctx
        .create_shaders_parallel(&[
            rt_shader(&rgen_source, ShaderStage::RAYGEN, "rgen"),
            rt_shader(&miss_source, ShaderStage::MISS, "miss"),
            rt_shader(&chit_source, ShaderStage::CLOSEST_HIT, "chit"),
        ])
        .expect("create shaders");
    let (rgen, miss, chit) = (shaders[0], shaders[1], shaders[2]);

    let pipeline = ctx.create_rt_pipeline(&RtPipelineCreateInfo {
        rgen_shader: rgen,
        miss_shaders: &[miss],
        hit_groups: &[RtHitGroup {
            closest_hit_shader: chit,
            any_hit_shader: Shader::NULL,
        }],
        debug_name: Some("trace"),
        max_ray_payload_size: 4,
        max_ray_hit_attribute_size: 8,
    });

    let output = ctx
        .create_buffer(&BufferCreateInfo {
            usage: BufferUsage::STORAGE,
            memory_properties: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            size: (WIDTH * HEIGHT * 4) as u64,
            debug_name: Some("output"),
            ..Default::default()
        })
        .expect("create output buffer");

    let bind_sets: Vec<BindSet> = ctx.create_bind_sets(pipeline, 1);
    ctx.update_bind_set(
        bind_sets[0],
        &Bindings {
            buffers: &[BufferBinding { binding: 1, buffer: output, ..Default::default() }],
            tlases: &[TlasBinding { binding: 0, tlas, index: 0 }],
            ..Default::default()
        },
    );

    let cmd = ctx.create_command_buffer().expect("create command buffer");
    ctx.begin_command_buffer(cmd).expect("begin");
    ctx.cmd_bind_pipeline(cmd, pipeline, &bind_sets, &[]);
    ctx.cmd_trace_rays(cmd, pipeline, WIDTH, HEIGHT);
    ctx.cmd_pipeline_barrier(
        cmd,
        &PipelineBarrier {
            buffer_barriers: &[BufferMemoryBarrier {
                buffer: output,
                src_stage_mask: PipelineStage::RAY_TRACING_SHADER,
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
    let mut hits = 0;
    for i in 0..(WIDTH * HEIGHT) as usize {
        if unsafe { ptr.add(i).read() } == 1.0 {
            hits += 1;
        }
    }
    assert_eq!(hits, (WIDTH * HEIGHT) as usize, "all rays should hit");
    println!("trace: {hits} rays hit");

    ctx.destroy_semaphore(semaphore);
    ctx.destroy_command_buffer(cmd);
    ctx.destroy_bind_sets(&bind_sets);
    ctx.destroy_pipeline(pipeline);
    ctx.destroy_buffer(output);
    ctx.destroy_tlas(tlas);
    ctx.destroy_blas(blas);
    for shader in [rgen, miss, chit] {
        ctx.destroy_shader(shader);
    }
    ctx.destroy_buffer(vertex_buffer);
    ctx.destroy_buffer(index_buffer);
}
