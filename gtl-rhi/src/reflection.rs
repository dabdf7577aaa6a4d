//! SPIR-V shader reflection.
//!
//! Walks the raw instruction stream of a module (no copy of the input) and
//! extracts the metadata the pipeline compiler and binding system need:
//! descriptor bindings per set, push-constant block size, ray payload and hit
//! attribute sizes, and the entry point's workgroup dimensions.

use std::collections::{HashMap, HashSet};

use crate::error::{GpuError, GpuResult};

/// Standard SPIR-V/Vulkan descriptor binding codes.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Sampler = 0,
    CombinedImageSampler = 1,
    SampledImage = 2,
    StorageImage = 3,
    UniformBuffer = 6,
    StorageBuffer = 7,
    AccelerationStructure = 1000150000,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflectionBinding {
    pub binding: u32,
    pub count: u32,
    pub descriptor_type: DescriptorType,
    pub read_access: bool,
    pub write_access: bool,
    /// Image dimensionality, biased by one so that 0 means "not an image"
    /// never occurs (2D image -> 2, 3D image -> 3, non-image -> 1).
    pub dim: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReflectionDescriptorSet {
    pub bindings: Vec<ReflectionBinding>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Dense, ordered by set index.
    pub descriptor_sets: Vec<ReflectionDescriptorSet>,
    pub push_constants_size: u32,
    pub max_ray_payload_size: u32,
    pub max_ray_hit_attribute_size: u32,
    pub payload_count: u32,
    pub workgroup_size: [u32; 3],
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

// Opcodes
const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_MATRIX: u16 = 24;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_ARRAY: u16 = 28;
const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_CONSTANT: u16 = 43;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_CALL: u16 = 57;
const OP_VARIABLE: u16 = 59;
const OP_IMAGE_TEXEL_POINTER: u16 = 60;
const OP_LOAD: u16 = 61;
const OP_STORE: u16 = 62;
const OP_COPY_MEMORY: u16 = 63;
const OP_ACCESS_CHAIN: u16 = 65;
const OP_IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
const OP_DECORATE: u16 = 71;
const OP_MEMBER_DECORATE: u16 = 72;
const OP_COPY_OBJECT: u16 = 83;
const OP_ATOMIC_FIRST: u16 = 227;
const OP_ATOMIC_LAST: u16 = 242;
const OP_TYPE_ACCELERATION_STRUCTURE_KHR: u16 = 5341;

// Decorations
const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_ARRAY_STRIDE: u32 = 6;
const DECORATION_NON_WRITABLE: u32 = 24;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_OFFSET: u32 = 35;

// Storage classes
const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_UNIFORM: u32 = 2;
const STORAGE_PUSH_CONSTANT: u32 = 9;
const STORAGE_STORAGE_BUFFER: u32 = 12;
const STORAGE_RAY_PAYLOAD_KHR: u32 = 5338;
const STORAGE_HIT_ATTRIBUTE_KHR: u32 = 5339;
const STORAGE_INCOMING_RAY_PAYLOAD_KHR: u32 = 5342;

const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

#[derive(Clone, Debug)]
enum Type {
    Int { width: u32 },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Image { dim: u32, sampled: u32 },
    Sampler,
    SampledImage { image: u32 },
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct { members: Vec<u32> },
    Pointer { storage_class: u32, pointee: u32 },
    AccelerationStructure,
}

#[derive(Clone, Copy, Debug, Default)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    non_writable: bool,
    block: bool,
    buffer_block: bool,
    array_stride: Option<u32>,
}

struct Variable {
    id: u32,
    type_id: u32,
    storage_class: u32,
}

/// Reads little-endian words straight out of the input span.
struct WordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WordReader<'a> {
    fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < 20 || bytes.len() % 4 != 0 {
            return None;
        }
        Some(Self { bytes, offset: 0 })
    }

    fn word(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    fn word_count(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Returns `(opcode, operand_range)` and advances past the instruction.
    fn next_instruction(&mut self) -> Option<(u16, std::ops::Range<usize>)> {
        if self.offset >= self.word_count() {
            return None;
        }
        let first = self.word(self.offset);
        let word_count = (first >> 16) as usize;
        let opcode = (first & 0xffff) as u16;
        if word_count == 0 || self.offset + word_count > self.word_count() {
            return None;
        }
        let operands = (self.offset + 1)..(self.offset + word_count);
        self.offset += word_count;
        Some((opcode, operands))
    }
}

struct ModuleInfo {
    types: HashMap<u32, Type>,
    constants: HashMap<u32, u32>,
    decorations: HashMap<u32, Decorations>,
    member_offsets: HashMap<(u32, u32), u32>,
    variables: Vec<Variable>,
    accessed: HashSet<u32>,
    entry_point_count: u32,
    workgroup_size: [u32; 3],
}

impl ModuleInfo {
    fn decoration(&self, id: u32) -> Decorations {
        self.decorations.get(&id).copied().unwrap_or_default()
    }

    /// Unwraps outer array levels, returning the base type id and the total
    /// descriptor count.
    fn unwrap_arrays(&self, mut type_id: u32) -> (u32, u32) {
        let mut count = 1u32;
        loop {
            match self.types.get(&type_id) {
                Some(Type::Array { element, length_id }) => {
                    count *= self.constants.get(length_id).copied().unwrap_or(1).max(1);
                    type_id = *element;
                }
                Some(Type::RuntimeArray { element }) => {
                    type_id = *element;
                }
                _ => return (type_id, count),
            }
        }
    }

    /// Byte size of a type: primitives are `(scalar_width / 8) * max(1,
    /// vector components)`; structs sum their members (honoring member
    /// offsets when decorated); arrays multiply by length (honoring the
    /// array stride when decorated).
    fn type_size(&self, type_id: u32) -> u32 {
        match self.types.get(&type_id) {
            Some(Type::Int { width }) | Some(Type::Float { width }) => width / 8,
            Some(Type::Vector { component, count }) => self.type_size(*component) * count,
            Some(Type::Matrix { column, count }) => self.type_size(*column) * count,
            Some(Type::Array { element, length_id }) => {
                let length = self.constants.get(length_id).copied().unwrap_or(0);
                let stride = self
                    .decoration(type_id)
                    .array_stride
                    .unwrap_or_else(|| self.type_size(*element));
                stride * length
            }
            Some(Type::Struct { members }) => {
                let mut size = 0u32;
                for (member, member_type) in members.iter().enumerate() {
                    let member_size = self.type_size(*member_type);
                    match self.member_offsets.get(&(type_id, member as u32)) {
                        Some(offset) => size = size.max(offset + member_size),
                        None => size += member_size,
                    }
                }
                size
            }
            _ => 0,
        }
    }

    fn classify_binding(&self, var: &Variable) -> Option<(DescriptorType, u32)> {
        let pointee = match self.types.get(&var.type_id) {
            Some(Type::Pointer { pointee, .. }) => *pointee,
            _ => return None,
        };
        let (base, _) = self.unwrap_arrays(pointee);

        let image_dim = |image_id: u32| match self.types.get(&image_id) {
            Some(Type::Image { dim, .. }) => dim + 1,
            _ => 1,
        };

        match (var.storage_class, self.types.get(&base)?) {
            (STORAGE_UNIFORM_CONSTANT, Type::Image { dim, sampled }) => {
                let ty = if *sampled == 2 {
                    DescriptorType::StorageImage
                } else {
                    DescriptorType::SampledImage
                };
                Some((ty, dim + 1))
            }
            (STORAGE_UNIFORM_CONSTANT, Type::Sampler) => Some((DescriptorType::Sampler, 1)),
            (STORAGE_UNIFORM_CONSTANT, Type::SampledImage { image }) => {
                Some((DescriptorType::CombinedImageSampler, image_dim(*image)))
            }
            (STORAGE_UNIFORM_CONSTANT, Type::AccelerationStructure) => {
                Some((DescriptorType::AccelerationStructure, 1))
            }
            (STORAGE_UNIFORM, Type::Struct { .. }) => {
                let decorations = self.decoration(base);
                if decorations.buffer_block {
                    Some((DescriptorType::StorageBuffer, 1))
                } else {
                    Some((DescriptorType::UniformBuffer, 1))
                }
            }
            (STORAGE_STORAGE_BUFFER, Type::Struct { .. }) => {
                Some((DescriptorType::StorageBuffer, 1))
            }
            _ => None,
        }
    }
}

fn parse_module(spirv: &[u8]) -> GpuResult<ModuleInfo> {
    let mut reader = WordReader::new(spirv)
        .ok_or(GpuError::ReflectionFailed("module too small or misaligned"))?;

    if reader.word(0) != SPIRV_MAGIC {
        return Err(GpuError::ReflectionFailed("bad magic number"));
    }
    reader.offset = 5;

    let mut info = ModuleInfo {
        types: HashMap::new(),
        constants: HashMap::new(),
        decorations: HashMap::new(),
        member_offsets: HashMap::new(),
        variables: Vec::new(),
        accessed: HashSet::new(),
        entry_point_count: 0,
        workgroup_size: [0; 3],
    };

    // Access-chain and copy results alias their root variable.
    let mut aliases: HashMap<u32, u32> = HashMap::new();
    let mut in_function_section = false;

    fn mark_accessed(aliases: &HashMap<u32, u32>, accessed: &mut HashSet<u32>, id: u32) {
        let root = aliases.get(&id).copied().unwrap_or(id);
        accessed.insert(root);
    }

    while let Some((opcode, operands)) = reader.next_instruction() {
        let op = |i: usize| reader.word(operands.start + i);
        let operand_count = operands.len();

        match opcode {
            OP_ENTRY_POINT => {
                info.entry_point_count += 1;
            }
            OP_EXECUTION_MODE => {
                if operand_count >= 5 && op(1) == EXECUTION_MODE_LOCAL_SIZE {
                    info.workgroup_size = [op(2), op(3), op(4)];
                }
            }
            OP_TYPE_INT => {
                info.types.insert(op(0), Type::Int { width: op(1) });
            }
            OP_TYPE_FLOAT => {
                info.types.insert(op(0), Type::Float { width: op(1) });
            }
            OP_TYPE_VECTOR => {
                info.types.insert(op(0), Type::Vector { component: op(1), count: op(2) });
            }
            OP_TYPE_MATRIX => {
                info.types.insert(op(0), Type::Matrix { column: op(1), count: op(2) });
            }
            OP_TYPE_IMAGE => {
                info.types.insert(op(0), Type::Image { dim: op(2), sampled: op(6) });
            }
            OP_TYPE_SAMPLER => {
                info.types.insert(op(0), Type::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                info.types.insert(op(0), Type::SampledImage { image: op(1) });
            }
            OP_TYPE_ARRAY => {
                info.types.insert(op(0), Type::Array { element: op(1), length_id: op(2) });
            }
            OP_TYPE_RUNTIME_ARRAY => {
                info.types.insert(op(0), Type::RuntimeArray { element: op(1) });
            }
            OP_TYPE_STRUCT => {
                let members = (1..operand_count).map(|i| op(i)).collect();
                info.types.insert(op(0), Type::Struct { members });
            }
            OP_TYPE_POINTER => {
                info.types.insert(op(0), Type::Pointer { storage_class: op(1), pointee: op(2) });
            }
            OP_TYPE_ACCELERATION_STRUCTURE_KHR => {
                info.types.insert(op(0), Type::AccelerationStructure);
            }
            OP_CONSTANT => {
                if operand_count >= 3 {
                    info.constants.insert(op(1), op(2));
                }
            }
            OP_DECORATE => {
                let entry = info.decorations.entry(op(0)).or_default();
                match op(1) {
                    DECORATION_DESCRIPTOR_SET => entry.set = Some(op(2)),
                    DECORATION_BINDING => entry.binding = Some(op(2)),
                    DECORATION_NON_WRITABLE => entry.non_writable = true,
                    DECORATION_BLOCK => entry.block = true,
                    DECORATION_BUFFER_BLOCK => entry.buffer_block = true,
                    DECORATION_ARRAY_STRIDE => entry.array_stride = Some(op(2)),
                    _ => {}
                }
            }
            OP_MEMBER_DECORATE => {
                if op(2) == DECORATION_OFFSET && operand_count >= 4 {
                    info.member_offsets.insert((op(0), op(1)), op(3));
                }
            }
            OP_VARIABLE if !in_function_section => {
                info.variables.push(Variable {
                    id: op(1),
                    type_id: op(0),
                    storage_class: op(2),
                });
            }
            OP_FUNCTION => {
                in_function_section = true;
            }
            _ if in_function_section => match opcode {
                OP_LOAD | OP_IMAGE_TEXEL_POINTER => {
                    mark_accessed(&aliases, &mut info.accessed, op(2));
                }
                OP_STORE => {
                    mark_accessed(&aliases, &mut info.accessed, op(0));
                }
                OP_COPY_MEMORY => {
                    mark_accessed(&aliases, &mut info.accessed, op(0));
                    mark_accessed(&aliases, &mut info.accessed, op(1));
                }
                OP_ACCESS_CHAIN | OP_IN_BOUNDS_ACCESS_CHAIN => {
                    let root = aliases.get(&op(2)).copied().unwrap_or(op(2));
                    aliases.insert(op(1), root);
                    mark_accessed(&aliases, &mut info.accessed, root);
                }
                OP_COPY_OBJECT => {
                    let root = aliases.get(&op(2)).copied().unwrap_or(op(2));
                    aliases.insert(op(1), root);
                }
                OP_FUNCTION_CALL => {
                    for i in 3..operand_count {
                        mark_accessed(&aliases, &mut info.accessed, op(i));
                    }
                }
                OP_ATOMIC_FIRST..=OP_ATOMIC_LAST => {
                    for i in 0..operand_count {
                        mark_accessed(&aliases, &mut info.accessed, op(i));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(info)
}

/// Reflects a SPIR-V module. The input bytes are only read, never copied.
pub fn reflect_shader(spirv: &[u8]) -> GpuResult<ShaderReflection> {
    let info = parse_module(spirv)?;

    if info.entry_point_count != 1 {
        return Err(GpuError::ReflectionFailed("expected exactly one entry point"));
    }

    let mut reflection = ShaderReflection {
        workgroup_size: info.workgroup_size,
        ..Default::default()
    };

    let mut push_constant_blocks = 0u32;
    let mut sets: HashMap<u32, Vec<ReflectionBinding>> = HashMap::new();

    for var in &info.variables {
        match var.storage_class {
            STORAGE_RAY_PAYLOAD_KHR | STORAGE_INCOMING_RAY_PAYLOAD_KHR => {
                let size = interface_var_size(&info, var);
                reflection.max_ray_payload_size = reflection.max_ray_payload_size.max(size);
                reflection.payload_count += 1;
            }
            STORAGE_HIT_ATTRIBUTE_KHR => {
                let size = interface_var_size(&info, var);
                reflection.max_ray_hit_attribute_size =
                    reflection.max_ray_hit_attribute_size.max(size);
            }
            STORAGE_PUSH_CONSTANT => {
                push_constant_blocks += 1;
                if push_constant_blocks > 1 {
                    return Err(GpuError::ReflectionFailed("more than one push constant block"));
                }
                reflection.push_constants_size = interface_var_size(&info, var);
            }
            _ => {
                let Some((descriptor_type, dim)) = info.classify_binding(var) else {
                    continue;
                };
                let decorations = info.decoration(var.id);
                let (Some(set), Some(binding)) = (decorations.set, decorations.binding) else {
                    continue;
                };

                let pointee = match info.types.get(&var.type_id) {
                    Some(Type::Pointer { pointee, .. }) => *pointee,
                    _ => continue,
                };
                let (base_type, count) = info.unwrap_arrays(pointee);

                let accessed = info.accessed.contains(&var.id);
                let non_writable = decorations.non_writable
                    || info.decoration(base_type).non_writable;

                sets.entry(set).or_default().push(ReflectionBinding {
                    binding,
                    count,
                    descriptor_type,
                    read_access: accessed,
                    write_access: accessed && !non_writable,
                    dim,
                });
            }
        }
    }

    if let Some(max_set) = sets.keys().copied().max() {
        reflection
            .descriptor_sets
            .resize_with(max_set as usize + 1, ReflectionDescriptorSet::default);
        for (set, mut bindings) in sets {
            bindings.sort_by_key(|b| b.binding);
            reflection.descriptor_sets[set as usize].bindings = bindings;
        }
    }

    Ok(reflection)
}

fn interface_var_size(info: &ModuleInfo, var: &Variable) -> u32 {
    match info.types.get(&var.type_id) {
        Some(Type::Pointer { pointee, .. }) => info.type_size(*pointee),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ModuleBuilder {
        words: Vec<u32>,
    }

    impl ModuleBuilder {
        fn new() -> Self {
            // magic, version 1.0, generator, bound, schema
            Self { words: vec![SPIRV_MAGIC, 0x0001_0000, 0, 100, 0] }
        }

        fn inst(&mut self, opcode: u16, operands: &[u32]) -> &mut Self {
            self.words.push(((operands.len() as u32 + 1) << 16) | opcode as u32);
            self.words.extend_from_slice(operands);
            self
        }

        fn bytes(&self) -> Vec<u8> {
            self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
        }
    }

    const NAME_MAIN: [u32; 2] = [0x6e69_616d, 0]; // "main\0"
    const GL_COMPUTE: u32 = 5;
    const RAY_GENERATION: u32 = 5313;

    /// Compute shader with one storage image at (set 0, binding 0), written
    /// in the entry point, 8x8x1 workgroup.
    fn storage_image_module() -> Vec<u8> {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_EXECUTION_MODE, &[1, EXECUTION_MODE_LOCAL_SIZE, 8, 8, 1])
            .inst(OP_DECORATE, &[2, DECORATION_DESCRIPTOR_SET, 0])
            .inst(OP_DECORATE, &[2, DECORATION_BINDING, 0])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            // 2D storage image (dim 1, sampled 2, format R32f)
            .inst(OP_TYPE_IMAGE, &[4, 3, 1, 0, 0, 0, 2, 3])
            .inst(OP_TYPE_POINTER, &[5, STORAGE_UNIFORM_CONSTANT, 4])
            .inst(OP_VARIABLE, &[5, 2, STORAGE_UNIFORM_CONSTANT])
            .inst(OP_FUNCTION, &[10, 11, 0, 12])
            .inst(OP_LOAD, &[4, 13, 2]);
        m.bytes()
    }

    #[test]
    fn storage_image_binding() {
        let reflection = reflect_shader(&storage_image_module()).unwrap();

        assert_eq!(reflection.workgroup_size, [8, 8, 1]);
        assert_eq!(reflection.descriptor_sets.len(), 1);
        let binding = &reflection.descriptor_sets[0].bindings[0];
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.count, 1);
        assert_eq!(binding.descriptor_type, DescriptorType::StorageImage);
        assert_eq!(binding.dim, 2);
        assert!(binding.read_access);
        assert!(binding.write_access);
    }

    #[test]
    fn reflection_is_deterministic() {
        let module = storage_image_module();
        assert_eq!(reflect_shader(&module).unwrap(), reflect_shader(&module).unwrap());
    }

    #[test]
    fn non_writable_clears_write_access() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_DECORATE, &[2, DECORATION_DESCRIPTOR_SET, 0])
            .inst(OP_DECORATE, &[2, DECORATION_BINDING, 3])
            .inst(OP_DECORATE, &[2, DECORATION_NON_WRITABLE])
            .inst(OP_DECORATE, &[6, DECORATION_BLOCK])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            .inst(OP_TYPE_STRUCT, &[6, 3])
            .inst(OP_TYPE_POINTER, &[5, STORAGE_STORAGE_BUFFER, 6])
            .inst(OP_VARIABLE, &[5, 2, STORAGE_STORAGE_BUFFER])
            .inst(OP_FUNCTION, &[10, 11, 0, 12])
            .inst(OP_ACCESS_CHAIN, &[3, 13, 2, 50])
            .inst(OP_LOAD, &[3, 14, 13]);

        let reflection = reflect_shader(&m.bytes()).unwrap();
        let binding = &reflection.descriptor_sets[0].bindings[0];
        assert_eq!(binding.descriptor_type, DescriptorType::StorageBuffer);
        assert!(binding.read_access);
        assert!(!binding.write_access);
    }

    #[test]
    fn unused_binding_has_no_access() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_DECORATE, &[2, DECORATION_DESCRIPTOR_SET, 0])
            .inst(OP_DECORATE, &[2, DECORATION_BINDING, 0])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            .inst(OP_TYPE_IMAGE, &[4, 3, 1, 0, 0, 0, 2, 3])
            .inst(OP_TYPE_POINTER, &[5, STORAGE_UNIFORM_CONSTANT, 4])
            .inst(OP_VARIABLE, &[5, 2, STORAGE_UNIFORM_CONSTANT])
            .inst(OP_FUNCTION, &[10, 11, 0, 12]);

        let reflection = reflect_shader(&m.bytes()).unwrap();
        let binding = &reflection.descriptor_sets[0].bindings[0];
        assert!(!binding.read_access);
        assert!(!binding.write_access);
    }

    #[test]
    fn push_constant_block_size() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_MEMBER_DECORATE, &[7, 0, DECORATION_OFFSET, 0])
            .inst(OP_MEMBER_DECORATE, &[7, 1, DECORATION_OFFSET, 16])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            .inst(OP_TYPE_VECTOR, &[4, 3, 4])
            .inst(OP_TYPE_STRUCT, &[7, 4, 3])
            .inst(OP_TYPE_POINTER, &[8, STORAGE_PUSH_CONSTANT, 7])
            .inst(OP_VARIABLE, &[8, 9, STORAGE_PUSH_CONSTANT]);

        let reflection = reflect_shader(&m.bytes()).unwrap();
        assert_eq!(reflection.push_constants_size, 20);
    }

    #[test]
    fn ray_payload_sizes() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[RAY_GENERATION, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            .inst(OP_TYPE_VECTOR, &[4, 3, 4])
            // payload: struct { vec4; float } = 20 bytes
            .inst(OP_TYPE_STRUCT, &[5, 4, 3])
            .inst(OP_TYPE_POINTER, &[6, STORAGE_RAY_PAYLOAD_KHR, 5])
            .inst(OP_VARIABLE, &[6, 7, STORAGE_RAY_PAYLOAD_KHR])
            // hit attributes: vec2 = 8 bytes
            .inst(OP_TYPE_VECTOR, &[8, 3, 2])
            .inst(OP_TYPE_POINTER, &[9, STORAGE_HIT_ATTRIBUTE_KHR, 8])
            .inst(OP_VARIABLE, &[9, 10, STORAGE_HIT_ATTRIBUTE_KHR]);

        let reflection = reflect_shader(&m.bytes()).unwrap();
        assert_eq!(reflection.max_ray_payload_size, 20);
        assert_eq!(reflection.max_ray_hit_attribute_size, 8);
        assert_eq!(reflection.payload_count, 1);
    }

    #[test]
    fn descriptor_array_count() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_DECORATE, &[2, DECORATION_DESCRIPTOR_SET, 1])
            .inst(OP_DECORATE, &[2, DECORATION_BINDING, 4])
            .inst(OP_TYPE_FLOAT, &[3, 32])
            .inst(OP_TYPE_IMAGE, &[4, 3, 1, 0, 0, 0, 1, 0])
            .inst(OP_TYPE_INT, &[20, 32])
            .inst(OP_CONSTANT, &[20, 21, 16])
            .inst(OP_TYPE_ARRAY, &[22, 4, 21])
            .inst(OP_TYPE_POINTER, &[5, STORAGE_UNIFORM_CONSTANT, 22])
            .inst(OP_VARIABLE, &[5, 2, STORAGE_UNIFORM_CONSTANT]);

        let reflection = reflect_shader(&m.bytes()).unwrap();
        assert_eq!(reflection.descriptor_sets.len(), 2);
        let binding = &reflection.descriptor_sets[1].bindings[0];
        assert_eq!(binding.count, 16);
        assert_eq!(binding.descriptor_type, DescriptorType::SampledImage);
    }

    #[test]
    fn two_entry_points_fail() {
        let mut m = ModuleBuilder::new();
        m.inst(OP_ENTRY_POINT, &[GL_COMPUTE, 1, NAME_MAIN[0], NAME_MAIN[1]])
            .inst(OP_ENTRY_POINT, &[GL_COMPUTE, 2, NAME_MAIN[0], NAME_MAIN[1]]);

        assert!(matches!(
            reflect_shader(&m.bytes()),
            Err(GpuError::ReflectionFailed(_))
        ));
    }

    #[test]
    fn garbage_input_fails() {
        assert!(reflect_shader(&[0u8; 8]).is_err());
        assert!(reflect_shader(&[0u8; 64]).is_err());
    }
}
