// Minimal SPIR-V builder for interpreter tests
//
// Produces a single GLCompute entry point whose body is appended in order.

use spirv::{BuiltIn, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};
use std::collections::HashMap;

use super::module::{Id, Program};

fn emit(out: &mut Vec<u32>, op: Op, operands: &[u32]) {
    out.push(((operands.len() as u32 + 1) << 16) | op as u32);
    out.extend_from_slice(operands);
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub struct Assembler {
    next_id: u32,
    entry: String,
    local_size: [u32; 3],
    decorations: Vec<u32>,
    globals: Vec<u32>,
    body: Vec<u32>,
    interface: Vec<u32>,
    constants: HashMap<u32, Id>,
    builtins: HashMap<u32, Id>,
    main: Id,
    main_label: Id,
    current_label: Id,
    void_fn: Id,
    void: Id,
    pub u32_t: Id,
    pub bool_t: Id,
    uvec3: Id,
    ptr_input_uvec3: Id,
    ptr_sb_u32: Id,
    ptr_wg_u32: Id,
}

impl Assembler {
    pub fn compute(entry: &str, local_size: [u32; 3]) -> Self {
        let mut asm = Self {
            next_id: 1,
            entry: entry.to_string(),
            local_size,
            decorations: Vec::new(),
            globals: Vec::new(),
            body: Vec::new(),
            interface: Vec::new(),
            constants: HashMap::new(),
            builtins: HashMap::new(),
            main: 0,
            main_label: 0,
            current_label: 0,
            void_fn: 0,
            void: 0,
            u32_t: 0,
            bool_t: 0,
            uvec3: 0,
            ptr_input_uvec3: 0,
            ptr_sb_u32: 0,
            ptr_wg_u32: 0,
        };
        asm.void = asm.global(Op::TypeVoid, &[]);
        asm.void_fn = asm.global(Op::TypeFunction, &[asm.void]);
        asm.u32_t = asm.global(Op::TypeInt, &[32, 0]);
        asm.bool_t = asm.global(Op::TypeBool, &[]);
        asm.uvec3 = asm.global(Op::TypeVector, &[asm.u32_t, 3]);
        asm.ptr_input_uvec3 = asm.global(Op::TypePointer, &[StorageClass::Input as u32, asm.uvec3]);
        asm.ptr_sb_u32 = asm.global(Op::TypePointer, &[StorageClass::StorageBuffer as u32, asm.u32_t]);
        asm.ptr_wg_u32 = asm.global(Op::TypePointer, &[StorageClass::Workgroup as u32, asm.u32_t]);
        asm.main = asm.id();
        asm.main_label = asm.id();
        asm.current_label = asm.main_label;
        asm
    }

    pub fn id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Declare a type or variable whose result id is the first operand slot
    fn global(&mut self, op: Op, operands: &[u32]) -> Id {
        let id = self.id();
        let mut all = vec![id];
        all.extend_from_slice(operands);
        emit(&mut self.globals, op, &all);
        id
    }

    fn decorate(&mut self, target: Id, decoration: Decoration, extra: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(extra);
        emit(&mut self.decorations, Op::Decorate, &operands);
    }

    fn variable(&mut self, pointer_ty: Id, class: StorageClass) -> Id {
        let id = self.id();
        emit(&mut self.globals, Op::Variable, &[pointer_ty, id, class as u32]);
        id
    }

    pub fn const_u32(&mut self, value: u32) -> Id {
        if let Some(id) = self.constants.get(&value) {
            return *id;
        }
        let id = self.id();
        emit(&mut self.globals, Op::Constant, &[self.u32_t, id, value]);
        self.constants.insert(value, id);
        id
    }

    /// Runtime array of u32 in a storage buffer block
    pub fn storage_buffer_u32(&mut self, set: u32, binding: u32) -> Id {
        let array = self.global(Op::TypeRuntimeArray, &[self.u32_t]);
        self.decorate(array, Decoration::ArrayStride, &[4]);
        let block = self.global(Op::TypeStruct, &[array]);
        emit(
            &mut self.decorations,
            Op::MemberDecorate,
            &[block, 0, Decoration::Offset as u32, 0],
        );
        self.decorate(block, Decoration::Block, &[]);
        let pointer = self.global(Op::TypePointer, &[StorageClass::StorageBuffer as u32, block]);
        let var = self.variable(pointer, StorageClass::StorageBuffer);
        self.decorate(var, Decoration::DescriptorSet, &[set]);
        self.decorate(var, Decoration::Binding, &[binding]);
        var
    }

    pub fn workgroup_array_u32(&mut self, length: u32) -> Id {
        let len = self.const_u32(length);
        let array = self.global(Op::TypeArray, &[self.u32_t, len]);
        let pointer = self.global(Op::TypePointer, &[StorageClass::Workgroup as u32, array]);
        self.variable(pointer, StorageClass::Workgroup)
    }

    fn builtin_x(&mut self, builtin: BuiltIn) -> Id {
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
        let (vector, x) = (self.id(), self.id());
        emit(&mut self.body, Op::Load, &[self.uvec3, vector, var]);
        emit(&mut self.body, Op::CompositeExtract, &[self.u32_t, x, vector, 0]);
        x
    }

    pub fn global_invocation_x(&mut self) -> Id {
        self.builtin_x(BuiltIn::GlobalInvocationId)
    }

    pub fn local_invocation_x(&mut self) -> Id {
        self.builtin_x(BuiltIn::LocalInvocationId)
    }

    pub fn current_label(&self) -> Id {
        self.current_label
    }

    pub fn label(&mut self, label: Id) {
        emit(&mut self.body, Op::Label, &[label]);
        self.current_label = label;
    }

    pub fn branch(&mut self, target: Id) {
        emit(&mut self.body, Op::Branch, &[target]);
    }

    pub fn branch_conditional(&mut self, cond: Id, on_true: Id, on_false: Id) {
        emit(&mut self.body, Op::BranchConditional, &[cond, on_true, on_false]);
    }

    pub fn loop_merge(&mut self, merge: Id, continue_target: Id) {
        emit(&mut self.body, Op::LoopMerge, &[merge, continue_target, 0]);
    }

    pub fn phi_u32(&mut self, result: Id, incoming: &[(Id, Id)]) {
        let mut operands = vec![self.u32_t, result];
        for (value, parent) in incoming {
            operands.extend_from_slice(&[*value, *parent]);
        }
        emit(&mut self.body, Op::Phi, &operands);
    }

    pub fn iadd(&mut self, result: Id, a: Id, b: Id) {
        emit(&mut self.body, Op::IAdd, &[self.u32_t, result, a, b]);
    }

    pub fn umod(&mut self, result: Id, a: Id, b: Id) {
        emit(&mut self.body, Op::UMod, &[self.u32_t, result, a, b]);
    }

    pub fn ult(&mut self, result: Id, a: Id, b: Id) {
        emit(&mut self.body, Op::ULessThan, &[self.bool_t, result, a, b]);
    }

    pub fn barrier(&mut self) {
        let workgroup = self.const_u32(2);
        let semantics = self.const_u32(0x108);
        emit(&mut self.body, Op::ControlBarrier, &[workgroup, workgroup, semantics]);
    }

    fn buffer_element(&mut self, buffer: Id, index: Id) -> Id {
        let zero = self.const_u32(0);
        let pointer = self.id();
        emit(&mut self.body, Op::AccessChain, &[self.ptr_sb_u32, pointer, buffer, zero, index]);
        pointer
    }

    pub fn store_u32_at(&mut self, buffer: Id, index: Id, value: Id) {
        let pointer = self.buffer_element(buffer, index);
        emit(&mut self.body, Op::Store, &[pointer, value]);
    }

    pub fn atomic_add_u32_at(&mut self, buffer: Id, index: Id, value: Id) {
        let pointer = self.buffer_element(buffer, index);
        let device = self.const_u32(1);
        let relaxed = self.const_u32(0);
        let old = self.id();
        emit(
            &mut self.body,
            Op::AtomicIAdd,
            &[self.u32_t, old, pointer, device, relaxed, value],
        );
    }

    fn shared_element(&mut self, shared: Id, index: Id) -> Id {
        let pointer = self.id();
        emit(&mut self.body, Op::AccessChain, &[self.ptr_wg_u32, pointer, shared, index]);
        pointer
    }

    pub fn store_shared_u32(&mut self, shared: Id, index: Id, value: Id) {
        let pointer = self.shared_element(shared, index);
        emit(&mut self.body, Op::Store, &[pointer, value]);
    }

    pub fn load_shared_u32(&mut self, result: Id, shared: Id, index: Id) {
        let pointer = self.shared_element(shared, index);
        emit(&mut self.body, Op::Load, &[self.u32_t, result, pointer]);
    }

    /// Complete SPIR-V binary as words
    pub fn words(&self) -> Vec<u32> {
        let mut out = vec![spirv::MAGIC_NUMBER, 0x0001_0300, 0, self.next_id, 0];
        emit(&mut out, Op::Capability, &[spirv::Capability::Shader as u32]);
        emit(&mut out, Op::MemoryModel, &[0, 1]);

        let mut entry = vec![ExecutionModel::GLCompute as u32, self.main];
        entry.extend(string_words(&self.entry));
        entry.extend_from_slice(&self.interface);
        emit(&mut out, Op::EntryPoint, &entry);
        let [x, y, z] = self.local_size;
        emit(&mut out, Op::ExecutionMode, &[self.main, ExecutionMode::LocalSize as u32, x, y, z]);

        out.extend_from_slice(&self.decorations);
        out.extend_from_slice(&self.globals);
        emit(&mut out, Op::Function, &[self.void, self.main, 0, self.void_fn]);
        emit(&mut out, Op::Label, &[self.main_label]);
        out.extend_from_slice(&self.body);
        emit(&mut out, Op::Return, &[]);
        emit(&mut out, Op::FunctionEnd, &[]);
        out
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.words().iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn finish(&self) -> Program {
        Program::parse(&self.bytes(), &self.entry).unwrap()
    }
}
