// Shared helpers for the integration tests
//
// `Kernel` writes a GLCompute SPIR-V module word by word: u32 storage
// buffers, u32 uniform blocks, invocation ids and plain integer arithmetic.

#![allow(dead_code)]

use pulse::*;
use spirv::{BuiltIn, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};
use std::collections::HashMap;

pub type Id = u32;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn software_backend(level: DebugLevel) -> Backend {
    init_logging();
    Backend::load(BackendFlags::SOFTWARE, ShaderFormats::SPIRV, level).expect("CPU backend always loads")
}

pub fn software_device() -> (Backend, Device) {
    let backend = software_backend(DebugLevel::Low);
    let device = backend.create_device(&[]).expect("CPU device");
    (backend, device)
}

pub fn buffer(device: &Device, usage: BufferUsage, size: u64) -> Buffer {
    device.create_buffer(&BufferCreateInfo { usage, size }).expect("buffer")
}

pub fn whole(buffer: &Buffer) -> BufferRegion<'_> {
    BufferRegion {
        buffer,
        offset: 0,
        size: buffer.size(),
    }
}

pub fn write_u32s(device: &Device, buffer: &Buffer, values: &[u32]) {
    let mut mapping = device.map_buffer(buffer, MapMode::Write).expect("map for upload");
    for (chunk, value) in mapping.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

pub fn read_u32s(device: &Device, buffer: &Buffer) -> Vec<u32> {
    let mapping = device.map_buffer(buffer, MapMode::Read).expect("map for download");
    mapping
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn emit(out: &mut Vec<u32>, op: Op, operands: &[u32]) {
    out.push(((operands.len() as u32 + 1) << 16) | op as u32);
    out.extend_from_slice(operands);
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes.resize(bytes.len().next_multiple_of(4), 0);
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub struct Kernel {
    next_id: u32,
    entry: String,
    local_size: [u32; 3],
    annotations: Vec<u32>,
    globals: Vec<u32>,
    body: Vec<u32>,
    interface: Vec<Id>,
    constants: HashMap<u32, Id>,
    builtins: HashMap<u32, Id>,
    main: Id,
    void: Id,
    void_fn: Id,
    uint: Id,
    uvec3: Id,
    ptr_input_uvec3: Id,
    ptr_storage_uint: Id,
    ptr_uniform_uint: Id,
}

impl Kernel {
    pub fn new(entry: &str, local_size: [u32; 3]) -> Self {
        let mut k = Self {
            next_id: 1,
            entry: entry.to_string(),
            local_size,
            annotations: Vec::new(),
            globals: Vec::new(),
            body: Vec::new(),
            interface: Vec::new(),
            constants: HashMap::new(),
            builtins: HashMap::new(),
            main: 0,
            void: 0,
            void_fn: 0,
            uint: 0,
            uvec3: 0,
            ptr_input_uvec3: 0,
            ptr_storage_uint: 0,
            ptr_uniform_uint: 0,
        };
        k.void = k.declare(Op::TypeVoid, &[]);
        k.void_fn = k.declare(Op::TypeFunction, &[k.void]);
        k.uint = k.declare(Op::TypeInt, &[32, 0]);
        k.uvec3 = k.declare(Op::TypeVector, &[k.uint, 3]);
        k.ptr_input_uvec3 = k.declare(Op::TypePointer, &[StorageClass::Input as u32, k.uvec3]);
        k.ptr_storage_uint = k.declare(Op::TypePointer, &[StorageClass::StorageBuffer as u32, k.uint]);
        k.ptr_uniform_uint = k.declare(Op::TypePointer, &[StorageClass::Uniform as u32, k.uint]);
        k.main = k.id();
        k
    }

    fn id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn declare(&mut self, op: Op, operands: &[u32]) -> Id {
        let id = self.id();
        let mut all = vec![id];
        all.extend_from_slice(operands);
        emit(&mut self.globals, op, &all);
        id
    }

    fn decorate(&mut self, target: Id, decoration: Decoration, extra: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(extra);
        emit(&mut self.annotations, Op::Decorate, &operands);
    }

    fn variable(&mut self, pointer: Id, class: StorageClass) -> Id {
        let id = self.id();
        emit(&mut self.globals, Op::Variable, &[pointer, id, class as u32]);
        id
    }

    fn block(&mut self, member: Id, class: StorageClass, set: u32, binding: u32) -> Id {
        let block = self.declare(Op::TypeStruct, &[member]);
        emit(
            &mut self.annotations,
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        );
        self.decorate(block, Decoration::Block, &[]);
        let pointer = self.declare(Op::TypePointer, &[class as u32, block]);
        let var = self.variable(pointer, class);
        self.decorate(var, Decoration::DescriptorSet, &[set]);
        self.decorate(var, Decoration::Binding, &[binding]);
        var
    }

    /// `buffer { uint data[]; }` at (set, binding)
    pub fn storage_buffer(&mut self, set: u32, binding: u32) -> Id {
        let array = self.declare(Op::TypeRuntimeArray, &[self.uint]);
        self.decorate(array, Decoration::ArrayStride, &[4]);
        self.block(array, StorageClass::StorageBuffer, set, binding)
    }

    /// `uniform { uint value; }` at set 2
    pub fn uniform_u32(&mut self, binding: u32) -> Id {
        self.block(self.uint, StorageClass::Uniform, 2, binding)
    }

    pub fn constant(&mut self, value: u32) -> Id {
        if let Some(id) = self.constants.get(&value) {
            return *id;
        }
        let id = self.id();
        emit(&mut self.globals, Op::Constant, &[self.uint, id, value]);
        self.constants.insert(value, id);
        id
    }

    fn builtin(&mut self, builtin: BuiltIn, component: u32) -> Id {
        let var = match self.builtins.get(&(builtin as u32)) {
            Some(var) => *var,
            None => {
                let var = self.variable(self.ptr_input_uvec3, StorageClass::Input);
                self.decorate(var, Decoration::BuiltIn, &[builtin as u32]);
                self.builtins.insert(builtin as u32, var);
                self.interface.push(var);
                var
            }
        };
        let (vector, value) = (self.id(), self.id());
        emit(&mut self.body, Op::Load, &[self.uvec3, vector, var]);
        emit(&mut self.body, Op::CompositeExtract, &[self.uint, value, vector, component]);
        value
    }

    pub fn global_id(&mut self, component: u32) -> Id {
        self.builtin(BuiltIn::GlobalInvocationId, component)
    }

    pub fn num_workgroups(&mut self, component: u32) -> Id {
        self.builtin(BuiltIn::NumWorkgroups, component)
    }

    fn binary(&mut self, op: Op, a: Id, b: Id) -> Id {
        let result = self.id();
        emit(&mut self.body, op, &[self.uint, result, a, b]);
        result
    }

    pub fn iadd(&mut self, a: Id, b: Id) -> Id {
        self.binary(Op::IAdd, a, b)
    }

    pub fn imul(&mut self, a: Id, b: Id) -> Id {
        self.binary(Op::IMul, a, b)
    }

    fn element(&mut self, buffer: Id, index: Id) -> Id {
        let zero = self.constant(0);
        let pointer = self.id();
        emit(
            &mut self.body,
            Op::AccessChain,
            &[self.ptr_storage_uint, pointer, buffer, zero, index],
        );
        pointer
    }

    pub fn load(&mut self, buffer: Id, index: Id) -> Id {
        let pointer = self.element(buffer, index);
        let value = self.id();
        emit(&mut self.body, Op::Load, &[self.uint, value, pointer]);
        value
    }

    pub fn store(&mut self, buffer: Id, index: Id, value: Id) {
        let pointer = self.element(buffer, index);
        emit(&mut self.body, Op::Store, &[pointer, value]);
    }

    pub fn load_uniform(&mut self, block: Id) -> Id {
        let zero = self.constant(0);
        let (pointer, value) = (self.id(), self.id());
        emit(&mut self.body, Op::AccessChain, &[self.ptr_uniform_uint, pointer, block, zero]);
        emit(&mut self.body, Op::Load, &[self.uint, value, pointer]);
        value
    }

    pub fn bytes(&mut self) -> Vec<u8> {
        let label = self.id();
        let mut out = vec![spirv::MAGIC_NUMBER, 0x0001_0300, 0, self.next_id, 0];
        emit(&mut out, Op::Capability, &[spirv::Capability::Shader as u32]);
        emit(&mut out, Op::MemoryModel, &[0, 1]);

        let mut entry = vec![ExecutionModel::GLCompute as u32, self.main];
        entry.extend(string_words(&self.entry));
        entry.extend_from_slice(&self.interface);
        emit(&mut out, Op::EntryPoint, &entry);
        let [x, y, z] = self.local_size;
        emit(&mut out, Op::ExecutionMode, &[self.main, ExecutionMode::LocalSize as u32, x, y, z]);

        out.extend_from_slice(&self.annotations);
        out.extend_from_slice(&self.globals);
        emit(&mut out, Op::Function, &[self.void, self.main, 0, self.void_fn]);
        emit(&mut out, Op::Label, &[label]);
        out.extend_from_slice(&self.body);
        emit(&mut out, Op::Return, &[]);
        emit(&mut out, Op::FunctionEnd, &[]);

        out.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// `out[gid.y * width + gid.x] = gid.y * width + gid.x`, output at set 1 binding 0
pub fn flat_index_kernel(width: u32) -> Vec<u8> {
    let mut k = Kernel::new("main", [1, 1, 1]);
    let out = k.storage_buffer(1, 0);
    let x = k.global_id(0);
    let y = k.global_id(1);
    let w = k.constant(width);
    let row = k.imul(y, w);
    let index = k.iadd(row, x);
    k.store(out, index, index);
    k.bytes()
}

/// `dst[i] = src[i] + uniform`, src at set 0, dst at set 1, uniform at set 2
pub fn add_uniform_kernel() -> Vec<u8> {
    let mut k = Kernel::new("main", [1, 1, 1]);
    let src = k.storage_buffer(0, 0);
    let dst = k.storage_buffer(1, 0);
    let addend = k.uniform_u32(0);
    let i = k.global_id(0);
    let value = k.load(src, i);
    let offset = k.load_uniform(addend);
    let sum = k.iadd(value, offset);
    k.store(dst, i, sum);
    k.bytes()
}

pub fn pipeline_info(code: &[u8]) -> ComputePipelineCreateInfo<'_> {
    ComputePipelineCreateInfo::spirv(code, "main")
}
