// SPIR-V compute interpreter
//
// Each invocation is an independent, resumable state machine over the shared
// `Program`. Invocations of one workgroup are stepped round-robin between
// `OpControlBarrier`s, so barrier semantics hold without one OS thread per
// invocation.

use anyhow::{anyhow, bail, ensure, Result};
use parking_lot::Mutex;
use spirv::{BuiltIn, GLOp, Op, StorageClass};
use std::collections::HashMap;

use super::module::{Function, Id, Instruction, Program, Type};
use super::value::{Pointer, Value};
use crate::backend::soft::binding::SoftGroup;
use crate::backend::soft::memory::{SoftImage, SoftMemory};
use crate::types::ImageFormat;

/// Largest workgroup the CPU backend runs
pub const MAX_WORKGROUP_INVOCATIONS: u32 = 1024;

/// Invocations in one workgroup of the given size, if within the limit
pub fn workgroup_invocations(local_size: [u32; 3]) -> Option<u32> {
    local_size
        .iter()
        .try_fold(1u32, |acc, &n| acc.checked_mul(n))
        .filter(|&count| count > 0 && count <= MAX_WORKGROUP_INVOCATIONS)
}

/// Identifies one workgroup of one dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkgroupKey {
    pub dispatch: u64,
    pub index: u32,
}

/// Workgroup variables of a pipeline, allocated by the first invocation
/// that touches them
pub type SharedTable = Mutex<HashMap<(WorkgroupKey, Id), Value>>;

/// What an invocation sees of the outside world
pub struct ExecContext<'a> {
    pub groups: &'a [Option<SoftGroup>; 3],
    pub shared: &'a SharedTable,
    pub workgroup: WorkgroupKey,
}

impl ExecContext<'_> {
    fn group(&self, set: u32) -> Result<&SoftGroup> {
        self.groups
            .get(set as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("descriptor set {} is not bound", set))
    }

    fn buffer(&self, set: u32, binding: u32) -> Result<&SoftMemory> {
        let group = self.group(set)?;
        let index = (binding as usize)
            .checked_sub(group.images.len())
            .ok_or_else(|| anyhow!("binding {} of set {} is an image", binding, set))?;
        group
            .buffers
            .get(index)
            .map(|b| b.as_ref())
            .ok_or_else(|| anyhow!("no buffer at set {} binding {}", set, binding))
    }

    fn image(&self, set: u32, binding: u32) -> Result<&SoftImage> {
        self.group(set)?
            .images
            .get(binding as usize)
            .map(|i| i.as_ref())
            .ok_or_else(|| anyhow!("no image at set {} binding {}", set, binding))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Builtins {
    pub global_id: [u32; 3],
    pub local_id: [u32; 3],
    pub workgroup_id: [u32; 3],
    pub num_workgroups: [u32; 3],
    pub workgroup_size: [u32; 3],
    pub local_index: u32,
}

fn uvec3(v: [u32; 3]) -> Value {
    Value::Composite(v.iter().map(|w| Value::Word(*w)).collect())
}

impl Builtins {
    fn value(&self, builtin: BuiltIn) -> Option<Value> {
        Some(match builtin {
            BuiltIn::GlobalInvocationId => uvec3(self.global_id),
            BuiltIn::LocalInvocationId => uvec3(self.local_id),
            BuiltIn::WorkgroupId => uvec3(self.workgroup_id),
            BuiltIn::NumWorkgroups => uvec3(self.num_workgroups),
            BuiltIn::WorkgroupSize => uvec3(self.workgroup_size),
            BuiltIn::LocalInvocationIndex => Value::Word(self.local_index),
            _ => return None,
        })
    }
}

/// Why `Invocation::run` returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Barrier,
    Done,
}

enum Flow {
    Next,
    Barrier,
}

struct Frame<'p> {
    function: &'p Function,
    block: usize,
    pc: usize,
    return_to: Option<Id>,
}

pub struct Invocation<'p> {
    program: &'p Program,
    values: Vec<Option<Value>>,
    locals: Vec<Value>,
    frames: Vec<Frame<'p>>,
}

fn arg(inst: &Instruction, index: usize) -> Result<u32> {
    inst.operands
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("{:?} is missing operand {}", inst.op, index))
}

fn signed(v: &Value) -> Result<i32> {
    Ok(v.word()? as i32)
}

fn int(f: impl Fn(u32, u32) -> u32) -> impl Fn(&Value, &Value) -> Result<Value> {
    move |a, b| Ok(Value::Word(f(a.word()?, b.word()?)))
}

fn sint(f: impl Fn(i32, i32) -> i32) -> impl Fn(&Value, &Value) -> Result<Value> {
    move |a, b| Ok(Value::Word(f(signed(a)?, signed(b)?) as u32))
}

fn float(f: impl Fn(f32, f32) -> f32) -> impl Fn(&Value, &Value) -> Result<Value> {
    move |a, b| Ok(Value::from_f32(f(a.float()?, b.float()?)))
}

fn compare<T>(
    read: impl Fn(&Value) -> Result<T>,
    f: impl Fn(T, T) -> bool,
) -> impl Fn(&Value, &Value) -> Result<Value> {
    move |a, b| Ok(Value::Bool(f(read(a)?, read(b)?)))
}

fn unary_float(f: impl Fn(f32) -> f32) -> impl Fn(&Value) -> Result<Value> {
    move |a| Ok(Value::from_f32(f(a.float()?)))
}

/// Remainder taking the sign of the divisor
fn floored_rem_i32(a: i32, b: i32) -> i32 {
    if b == 0 {
        return 0;
    }
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn floored_rem_f32(a: f32, b: f32) -> f32 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

impl<'p> Invocation<'p> {
    pub fn new(program: &'p Program, builtins: &Builtins) -> Result<Self> {
        let mut invocation = Self {
            program,
            values: vec![None; program.bound as usize],
            locals: Vec::new(),
            frames: Vec::new(),
        };

        for global in &program.globals {
            let pointer = match global.class {
                StorageClass::StorageBuffer | StorageClass::Uniform | StorageClass::UniformConstant => {
                    let (set, binding) = (global.set.unwrap_or(0), global.binding.unwrap_or(0));
                    match program.ty(global.pointee)? {
                        Type::Image { .. } => Pointer::Resource { set, binding },
                        _ => Pointer::Buffer {
                            set,
                            binding,
                            offset: 0,
                            ty: global.pointee,
                        },
                    }
                }
                StorageClass::Workgroup => Pointer::Shared {
                    var: global.id,
                    path: Vec::new(),
                    ty: global.pointee,
                },
                StorageClass::Input | StorageClass::Private | StorageClass::Output => {
                    let value = match (global.builtin.and_then(|b| builtins.value(b)), global.initializer) {
                        (Some(value), _) => value,
                        (None, Some(init)) => program
                            .constant(init)
                            .cloned()
                            .ok_or_else(|| anyhow!("initializer %{} is not a constant", init))?,
                        (None, None) => program.zero(global.pointee)?,
                    };
                    invocation.locals.push(value);
                    Pointer::Local {
                        slot: invocation.locals.len() - 1,
                        path: Vec::new(),
                        ty: global.pointee,
                    }
                }
                other => bail!("unsupported storage class {:?} on %{}", other, global.id),
            };
            invocation.set(global.id, Value::Pointer(pointer))?;
        }

        invocation.frames.push(Frame {
            function: program.function(program.entry)?,
            block: 0,
            pc: 0,
            return_to: None,
        });
        Ok(invocation)
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    fn get(&self, id: Id) -> Result<&Value> {
        if let Some(Some(value)) = self.values.get(id as usize) {
            return Ok(value);
        }
        self.program
            .constant(id)
            .ok_or_else(|| anyhow!("%{} used before definition", id))
    }

    fn operand(&self, inst: &Instruction, index: usize) -> Result<Value> {
        Ok(self.get(arg(inst, index)?)?.clone())
    }

    fn set(&mut self, id: Id, value: Value) -> Result<()> {
        let slot = self
            .values
            .get_mut(id as usize)
            .ok_or_else(|| anyhow!("id %{} exceeds the module bound", id))?;
        *slot = Some(value);
        Ok(())
    }

    /// Run until the invocation finishes or reaches a barrier
    pub fn run(&mut self, ctx: &ExecContext) -> Result<Step> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(Step::Done);
            };
            let function: &'p Function = frame.function;
            let block = &function.blocks[frame.block];
            let inst = block
                .instructions
                .get(frame.pc)
                .ok_or_else(|| anyhow!("block %{} has no terminator", block.label))?;
            frame.pc += 1;

            if let Flow::Barrier = self.execute(inst, ctx)? {
                return Ok(Step::Barrier);
            }
        }
    }

    fn branch(&mut self, target: Id) -> Result<()> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| anyhow!("branch without a frame"))?;
        let function: &'p Function = frame.function;
        let from = function.blocks[frame.block].label;
        frame.block = function.block_index(target)?;
        frame.pc = 0;

        // Phis read their inputs before any of them is written
        let mut incoming = Vec::new();
        for inst in function.blocks[frame.block]
            .instructions
            .iter()
            .take_while(|i| i.op == Op::Phi)
        {
            let result = arg(inst, 1)?;
            let source = inst.operands[2..]
                .chunks_exact(2)
                .find(|pair| pair[1] == from)
                .map(|pair| pair[0])
                .ok_or_else(|| anyhow!("phi %{} has no entry for block %{}", result, from))?;
            incoming.push((result, source));
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = incoming.len();
        }
        let values = incoming
            .iter()
            .map(|(result, source)| Ok((*result, self.get(*source)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        for (result, value) in values {
            self.set(result, value)?;
        }
        Ok(())
    }

    fn execute(&mut self, inst: &'p Instruction, ctx: &ExecContext) -> Result<Flow> {
        let program = self.program;
        match inst.op {
            Op::Variable => {
                let result = arg(inst, 1)?;
                let pointee = match program.ty(arg(inst, 0)?)? {
                    Type::Pointer { pointee, .. } => *pointee,
                    other => bail!("variable of non-pointer type {:?}", other),
                };
                let init = match inst.operands.get(3) {
                    Some(init) => self.get(*init)?.clone(),
                    None => program.zero(pointee)?,
                };
                // Function variables are reused across calls since SPIR-V has no recursion
                let existing = match self.values.get(result as usize) {
                    Some(Some(Value::Pointer(Pointer::Local { slot, .. }))) => Some(*slot),
                    _ => None,
                };
                let slot = match existing {
                    Some(slot) => {
                        self.locals[slot] = init;
                        slot
                    }
                    None => {
                        self.locals.push(init);
                        self.locals.len() - 1
                    }
                };
                self.set(
                    result,
                    Value::Pointer(Pointer::Local {
                        slot,
                        path: Vec::new(),
                        ty: pointee,
                    }),
                )?;
            }
            Op::Undef => {
                let value = program.zero(arg(inst, 0)?)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::Load | Op::AtomicLoad => {
                let pointer = self.operand(inst, 2)?;
                let value = self.load(pointer.pointer()?, ctx)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::Store => {
                let pointer = self.operand(inst, 0)?;
                let value = self.operand(inst, 1)?;
                self.store(pointer.pointer()?, value, ctx)?;
            }
            Op::AtomicStore => {
                let pointer = self.operand(inst, 0)?;
                let value = self.operand(inst, 3)?;
                self.store(pointer.pointer()?, value, ctx)?;
            }
            Op::AccessChain | Op::InBoundsAccessChain => {
                let base = self.operand(inst, 2)?;
                let indices = inst.operands[3..]
                    .iter()
                    .map(|id| self.get(*id)?.word())
                    .collect::<Result<Vec<_>>>()?;
                let pointer = self.access_chain(base.pointer()?, &indices)?;
                self.set(arg(inst, 1)?, Value::Pointer(pointer))?;
            }
            Op::ArrayLength => {
                let base = self.operand(inst, 2)?;
                let Pointer::Buffer { set, binding, offset, ty } = base.pointer()? else {
                    bail!("OpArrayLength on a pointer that is not a buffer");
                };
                let (member_offset, member) = program.member_offset(*ty, arg(inst, 3)?)?;
                let (_, stride) = program.element_stride(member)?;
                let start = (*offset + member_offset) as usize;
                let len = ctx.buffer(*set, *binding)?.len();
                let count = len.saturating_sub(start) / stride.max(1) as usize;
                self.set(arg(inst, 1)?, Value::Word(count as u32))?;
            }
            Op::CopyObject | Op::UConvert | Op::SConvert | Op::Bitcast => {
                let value = self.operand(inst, 2)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::CompositeConstruct => {
                let parts = inst.operands[2..]
                    .iter()
                    .map(|id| Ok(self.get(*id)?.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let parts = match program.ty(arg(inst, 0)?)? {
                    Type::Vector { .. } => parts.iter().flat_map(Value::scalars).collect(),
                    _ => parts,
                };
                self.set(arg(inst, 1)?, Value::Composite(parts))?;
            }
            Op::CompositeExtract => {
                let composite = self.get(arg(inst, 2)?)?;
                let value = composite.extract(&inst.operands[3..])?.clone();
                self.set(arg(inst, 1)?, value)?;
            }
            Op::CompositeInsert => {
                let object = self.operand(inst, 2)?;
                let composite = self.get(arg(inst, 3)?)?;
                let value = composite.insert(&inst.operands[4..], object)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::VectorShuffle => {
                let mut pool = self.operand(inst, 2)?.components()?.to_vec();
                pool.extend_from_slice(self.get(arg(inst, 3)?)?.components()?);
                let parts = inst.operands[4..]
                    .iter()
                    .map(|&c| {
                        if c == u32::MAX {
                            Ok(Value::Undef)
                        } else {
                            pool.get(c as usize)
                                .cloned()
                                .ok_or_else(|| anyhow!("shuffle component {} out of range", c))
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.set(arg(inst, 1)?, Value::Composite(parts))?;
            }
            Op::Dot => {
                let a = self.operand(inst, 2)?;
                let b = self.operand(inst, 3)?;
                let mut sum = 0.0f32;
                for (x, y) in a.components()?.iter().zip(b.components()?) {
                    sum += x.float()? * y.float()?;
                }
                self.set(arg(inst, 1)?, Value::from_f32(sum))?;
            }
            Op::Any | Op::All => {
                let v = self.operand(inst, 2)?;
                let bits = v.scalars().iter().map(Value::boolean).collect::<Result<Vec<_>>>()?;
                let result = if inst.op == Op::Any {
                    bits.iter().any(|b| *b)
                } else {
                    bits.iter().all(|b| *b)
                };
                self.set(arg(inst, 1)?, Value::Bool(result))?;
            }
            Op::Select => {
                let cond = self.operand(inst, 2)?;
                let a = self.operand(inst, 3)?;
                let b = self.operand(inst, 4)?;
                let value = if let Value::Composite(_) = cond {
                    cond.zip3(&a, &b, &|c, x, y| Ok(if c.boolean()? { x.clone() } else { y.clone() }))?
                } else if cond.boolean()? {
                    a
                } else {
                    b
                };
                self.set(arg(inst, 1)?, value)?;
            }
            Op::SNegate
            | Op::FNegate
            | Op::Not
            | Op::LogicalNot
            | Op::ConvertFToU
            | Op::ConvertFToS
            | Op::ConvertSToF
            | Op::ConvertUToF => {
                let a = self.operand(inst, 2)?;
                let value = match inst.op {
                    Op::SNegate => a.map(&|v| Ok(Value::Word(signed(v)?.wrapping_neg() as u32)))?,
                    Op::FNegate => a.map(&unary_float(|x| -x))?,
                    Op::Not => a.map(&|v| Ok(Value::Word(!v.word()?)))?,
                    Op::LogicalNot => a.map(&|v| Ok(Value::Bool(!v.boolean()?)))?,
                    Op::ConvertFToU => a.map(&|v| Ok(Value::Word(v.float()? as u32)))?,
                    Op::ConvertFToS => a.map(&|v| Ok(Value::Word(v.float()? as i32 as u32)))?,
                    Op::ConvertSToF => a.map(&|v| Ok(Value::from_f32(signed(v)? as f32)))?,
                    _ => a.map(&|v| Ok(Value::from_f32(v.word()? as f32)))?,
                };
                self.set(arg(inst, 1)?, value)?;
            }
            Op::Phi | Op::LoopMerge | Op::SelectionMerge | Op::MemoryBarrier => {}
            Op::Branch => self.branch(arg(inst, 0)?)?,
            Op::BranchConditional => {
                let target = if self.get(arg(inst, 0)?)?.boolean()? {
                    arg(inst, 1)?
                } else {
                    arg(inst, 2)?
                };
                self.branch(target)?;
            }
            Op::Switch => {
                let selector = self.get(arg(inst, 0)?)?.word()?;
                let target = inst.operands[2..]
                    .chunks_exact(2)
                    .find(|case| case[0] == selector)
                    .map_or(arg(inst, 1)?, |case| case[1]);
                self.branch(target)?;
            }
            Op::Return | Op::ReturnValue => {
                let value = match inst.op {
                    Op::ReturnValue => Some(self.operand(inst, 0)?),
                    _ => None,
                };
                if let Some(frame) = self.frames.pop() {
                    if let (Some(result), Some(value)) = (frame.return_to, value) {
                        self.set(result, value)?;
                    }
                }
            }
            Op::Unreachable | Op::Kill => self.frames.clear(),
            Op::FunctionCall => {
                let callee = program.function(arg(inst, 2)?)?;
                ensure!(
                    callee.params.len() == inst.operands.len() - 3,
                    "call to %{} with the wrong argument count",
                    callee.id
                );
                for (param, id) in callee.params.iter().zip(&inst.operands[3..]) {
                    let value = self.get(*id)?.clone();
                    self.set(*param, value)?;
                }
                self.frames.push(Frame {
                    function: callee,
                    block: 0,
                    pc: 0,
                    return_to: Some(arg(inst, 1)?),
                });
            }
            Op::ExtInst => {
                let value = self.ext_inst(inst)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::ControlBarrier => return Ok(Flow::Barrier),
            Op::ImageRead => {
                let value = self.image_read(inst, ctx)?;
                self.set(arg(inst, 1)?, value)?;
            }
            Op::ImageWrite => self.image_write(inst, ctx)?,
            Op::AtomicExchange
            | Op::AtomicCompareExchange
            | Op::AtomicIIncrement
            | Op::AtomicIDecrement
            | Op::AtomicIAdd
            | Op::AtomicISub
            | Op::AtomicSMin
            | Op::AtomicUMin
            | Op::AtomicSMax
            | Op::AtomicUMax
            | Op::AtomicAnd
            | Op::AtomicOr
            | Op::AtomicXor => {
                let old = self.atomic(inst, ctx)?;
                self.set(arg(inst, 1)?, Value::Word(old))?;
            }
            _ => {
                let a = self.operand(inst, 2)?;
                let b = self.operand(inst, 3)?;
                let value = binary(inst.op, &a, &b)?;
                self.set(arg(inst, 1)?, value)?;
            }
        }
        Ok(Flow::Next)
    }

    fn access_chain(&self, base: &Pointer, indices: &[u32]) -> Result<Pointer> {
        let program = self.program;
        let step = |ty: Id, index: u32| -> Result<Id> {
            Ok(match program.ty(ty)? {
                Type::Struct { members, .. } => *members
                    .get(index as usize)
                    .ok_or_else(|| anyhow!("struct member {} out of range", index))?,
                Type::Array { element, .. } | Type::RuntimeArray { element, .. } => *element,
                Type::Vector { component, .. } => *component,
                other => bail!("cannot index into {:?}", other),
            })
        };

        Ok(match base {
            Pointer::Local { slot, path, ty } => {
                let mut ty = *ty;
                for index in indices {
                    ty = step(ty, *index)?;
                }
                Pointer::Local {
                    slot: *slot,
                    path: path.iter().chain(indices).copied().collect(),
                    ty,
                }
            }
            Pointer::Shared { var, path, ty } => {
                let mut ty = *ty;
                for index in indices {
                    ty = step(ty, *index)?;
                }
                Pointer::Shared {
                    var: *var,
                    path: path.iter().chain(indices).copied().collect(),
                    ty,
                }
            }
            Pointer::Buffer { set, binding, offset, ty } => {
                let mut ty = *ty;
                let mut offset = *offset as u64;
                for &index in indices {
                    if let Type::Struct { .. } = program.ty(ty)? {
                        let (member_offset, member) = program.member_offset(ty, index)?;
                        offset += member_offset as u64;
                        ty = member;
                    } else {
                        let (element, stride) = program.element_stride(ty)?;
                        offset += index as u64 * stride as u64;
                        ty = element;
                    }
                }
                Pointer::Buffer {
                    set: *set,
                    binding: *binding,
                    // Past-the-end offsets read as zero and drop stores
                    offset: offset.min(u32::MAX as u64) as u32,
                    ty,
                }
            }
            Pointer::Resource { .. } => bail!("access chain into an opaque resource"),
        })
    }

    fn shared_root_type(&self, var: Id) -> Result<Id> {
        self.program
            .globals
            .iter()
            .find(|g| g.id == var)
            .map(|g| g.pointee)
            .ok_or_else(|| anyhow!("%{} is not a workgroup variable", var))
    }

    fn load(&self, pointer: &Pointer, ctx: &ExecContext) -> Result<Value> {
        match pointer {
            Pointer::Local { slot, path, ty } => match self.locals[*slot].extract(path) {
                Ok(value) => Ok(value.clone()),
                Err(_) => self.program.zero(*ty),
            },
            Pointer::Shared { var, path, ty } => {
                let root = self.shared_root_type(*var)?;
                let mut table = ctx.shared.lock();
                let entry = match table.entry((ctx.workgroup, *var)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => e.insert(self.program.zero(root)?),
                };
                match entry.extract(path) {
                    Ok(value) => Ok(value.clone()),
                    Err(_) => self.program.zero(*ty),
                }
            }
            Pointer::Buffer { set, binding, offset, ty } => {
                self.read_memory(ctx.buffer(*set, *binding)?, *offset as usize, *ty)
            }
            Pointer::Resource { set, binding } => Ok(Value::Image {
                set: *set,
                binding: *binding,
            }),
        }
    }

    fn store(&mut self, pointer: &Pointer, value: Value, ctx: &ExecContext) -> Result<()> {
        match pointer {
            Pointer::Local { slot, path, .. } => {
                if let Some(target) = self.locals[*slot].extract_mut(path) {
                    *target = value;
                }
            }
            Pointer::Shared { var, path, .. } => {
                let root = self.shared_root_type(*var)?;
                let mut table = ctx.shared.lock();
                let entry = match table.entry((ctx.workgroup, *var)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => e.insert(self.program.zero(root)?),
                };
                if let Some(target) = entry.extract_mut(path) {
                    *target = value;
                }
            }
            Pointer::Buffer { set, binding, offset, ty } => {
                self.write_memory(ctx.buffer(*set, *binding)?, *offset as usize, *ty, &value)?;
            }
            Pointer::Resource { .. } => bail!("store to an opaque resource"),
        }
        Ok(())
    }

    fn read_memory(&self, memory: &SoftMemory, offset: usize, ty: Id) -> Result<Value> {
        let program = self.program;
        Ok(match program.ty(ty)? {
            Type::Bool => Value::Bool(memory.load_u32(offset) != 0),
            Type::Int { .. } | Type::Float => Value::Word(memory.load_u32(offset)),
            Type::Vector { component, count } => Value::Composite(
                (0..*count as usize)
                    .map(|i| self.read_memory(memory, offset + 4 * i, *component))
                    .collect::<Result<_>>()?,
            ),
            Type::Array { length, .. } => {
                let (element, stride) = program.element_stride(ty)?;
                Value::Composite(
                    (0..*length as usize)
                        .map(|i| self.read_memory(memory, offset + i * stride as usize, element))
                        .collect::<Result<_>>()?,
                )
            }
            Type::Struct { members, .. } => Value::Composite(
                (0..members.len() as u32)
                    .map(|m| {
                        let (member_offset, member) = program.member_offset(ty, m)?;
                        self.read_memory(memory, offset + member_offset as usize, member)
                    })
                    .collect::<Result<_>>()?,
            ),
            other => bail!("cannot load {:?} from a buffer", other),
        })
    }

    fn write_memory(&self, memory: &SoftMemory, offset: usize, ty: Id, value: &Value) -> Result<()> {
        let program = self.program;
        match program.ty(ty)? {
            Type::Bool | Type::Int { .. } | Type::Float => memory.store_u32(offset, value.word()?),
            Type::Vector { component, .. } => {
                for (i, part) in value.components()?.iter().enumerate() {
                    self.write_memory(memory, offset + 4 * i, *component, part)?;
                }
            }
            Type::Array { .. } => {
                let (element, stride) = program.element_stride(ty)?;
                for (i, part) in value.components()?.iter().enumerate() {
                    self.write_memory(memory, offset + i * stride as usize, element, part)?;
                }
            }
            Type::Struct { .. } => {
                for (m, part) in value.components()?.iter().enumerate() {
                    let (member_offset, member) = program.member_offset(ty, m as u32)?;
                    self.write_memory(memory, offset + member_offset as usize, member, part)?;
                }
            }
            other => bail!("cannot store {:?} to a buffer", other),
        }
        Ok(())
    }

    /// Read-modify-write on a 32-bit location, returning the previous value
    fn atomic(&mut self, inst: &Instruction, ctx: &ExecContext) -> Result<u32> {
        let pointer = self.operand(inst, 2)?;
        let op = inst.op;
        let (value, comparator) = match op {
            Op::AtomicIIncrement | Op::AtomicIDecrement => (1, 0),
            Op::AtomicCompareExchange => (self.get(arg(inst, 6)?)?.word()?, self.get(arg(inst, 7)?)?.word()?),
            _ => (self.get(arg(inst, 5)?)?.word()?, 0),
        };
        let apply = move |old: u32| -> u32 {
            match op {
                Op::AtomicExchange => value,
                Op::AtomicCompareExchange => {
                    if old == comparator {
                        value
                    } else {
                        old
                    }
                }
                Op::AtomicIIncrement | Op::AtomicIAdd => old.wrapping_add(value),
                Op::AtomicIDecrement | Op::AtomicISub => old.wrapping_sub(value),
                Op::AtomicSMin => (old as i32).min(value as i32) as u32,
                Op::AtomicUMin => old.min(value),
                Op::AtomicSMax => (old as i32).max(value as i32) as u32,
                Op::AtomicUMax => old.max(value),
                Op::AtomicAnd => old & value,
                Op::AtomicOr => old | value,
                _ => old ^ value,
            }
        };

        match pointer.pointer()? {
            Pointer::Buffer { set, binding, offset, .. } => {
                let memory = ctx.buffer(*set, *binding)?;
                Ok(if op == Op::AtomicCompareExchange {
                    memory.compare_exchange_u32(*offset as usize, comparator, value)
                } else {
                    memory.update_u32(*offset as usize, apply)
                })
            }
            Pointer::Shared { var, path, .. } => {
                let root = self.shared_root_type(*var)?;
                let mut table = ctx.shared.lock();
                let entry = match table.entry((ctx.workgroup, *var)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => e.insert(self.program.zero(root)?),
                };
                match entry.extract_mut(path) {
                    Some(target) => {
                        let old = target.word()?;
                        *target = Value::Word(apply(old));
                        Ok(old)
                    }
                    None => Ok(0),
                }
            }
            Pointer::Local { slot, path, .. } => match self.locals[*slot].extract_mut(path) {
                Some(target) => {
                    let old = target.word()?;
                    *target = Value::Word(apply(old));
                    Ok(old)
                }
                None => Ok(0),
            },
            Pointer::Resource { .. } => bail!("atomic on an opaque resource"),
        }
    }

    fn ext_inst(&self, inst: &Instruction) -> Result<Value> {
        ensure!(
            Some(arg(inst, 2)?) == self.program.glsl_std,
            "only GLSL.std.450 extended instructions are supported"
        );
        let raw = arg(inst, 3)?;
        let op = GLOp::from_u32(raw).ok_or_else(|| anyhow!("unknown GLSL.std.450 instruction {}", raw))?;
        let a = self.operand(inst, 4)?;
        let b = || self.operand(inst, 5);
        let c = || self.operand(inst, 6);
        Ok(match op {
            GLOp::FAbs => a.map(&unary_float(f32::abs))?,
            GLOp::SAbs => a.map(&|v| Ok(Value::Word(signed(v)?.wrapping_abs() as u32)))?,
            GLOp::FSign => a.map(&unary_float(|x| if x == 0.0 { 0.0 } else { x.signum() }))?,
            GLOp::SSign => a.map(&|v| Ok(Value::Word(signed(v)?.signum() as u32)))?,
            GLOp::Floor => a.map(&unary_float(f32::floor))?,
            GLOp::Ceil => a.map(&unary_float(f32::ceil))?,
            GLOp::Round => a.map(&unary_float(f32::round))?,
            GLOp::Trunc => a.map(&unary_float(f32::trunc))?,
            GLOp::Fract => a.map(&unary_float(|x| x - x.floor()))?,
            GLOp::Sqrt => a.map(&unary_float(f32::sqrt))?,
            GLOp::InverseSqrt => a.map(&unary_float(|x| 1.0 / x.sqrt()))?,
            GLOp::Sin => a.map(&unary_float(f32::sin))?,
            GLOp::Cos => a.map(&unary_float(f32::cos))?,
            GLOp::Tan => a.map(&unary_float(f32::tan))?,
            GLOp::Exp => a.map(&unary_float(f32::exp))?,
            GLOp::Log => a.map(&unary_float(f32::ln))?,
            GLOp::Exp2 => a.map(&unary_float(f32::exp2))?,
            GLOp::Log2 => a.map(&unary_float(f32::log2))?,
            GLOp::Pow => a.zip(&b()?, &float(f32::powf))?,
            GLOp::FMin => a.zip(&b()?, &float(f32::min))?,
            GLOp::FMax => a.zip(&b()?, &float(f32::max))?,
            GLOp::UMin => a.zip(&b()?, &int(u32::min))?,
            GLOp::UMax => a.zip(&b()?, &int(u32::max))?,
            GLOp::SMin => a.zip(&b()?, &sint(i32::min))?,
            GLOp::SMax => a.zip(&b()?, &sint(i32::max))?,
            GLOp::FClamp => a.zip3(&b()?, &c()?, &|x, lo, hi| {
                Ok(Value::from_f32(x.float()?.max(lo.float()?).min(hi.float()?)))
            })?,
            GLOp::UClamp => a.zip3(&b()?, &c()?, &|x, lo, hi| {
                Ok(Value::Word(x.word()?.max(lo.word()?).min(hi.word()?)))
            })?,
            GLOp::SClamp => a.zip3(&b()?, &c()?, &|x, lo, hi| {
                Ok(Value::Word(signed(x)?.max(signed(lo)?).min(signed(hi)?) as u32))
            })?,
            GLOp::FMix => a.zip3(&b()?, &c()?, &|x, y, t| {
                let t = t.float()?;
                Ok(Value::from_f32(x.float()? * (1.0 - t) + y.float()? * t))
            })?,
            GLOp::Fma => a.zip3(&b()?, &c()?, &|x, y, z| {
                Ok(Value::from_f32(x.float()?.mul_add(y.float()?, z.float()?)))
            })?,
            GLOp::Length => {
                let mut sum = 0.0f32;
                for v in a.scalars() {
                    let x = v.float()?;
                    sum += x * x;
                }
                Value::from_f32(sum.sqrt())
            }
            other => bail!("GLSL.std.450 {:?} is not supported", other),
        })
    }

    fn texel_location(&self, image: &SoftImage, coord: &Value) -> Result<Option<usize>> {
        let parts = coord.scalars().iter().map(Value::word).collect::<Result<Vec<_>>>()?;
        let x = parts.first().copied().unwrap_or(0);
        let y = parts.get(1).copied().unwrap_or(0);
        let slice = parts.get(2).copied().unwrap_or(0);
        // Negative coordinates wrap to huge values and fall outside the image
        Ok(image.texel_offset(x, y, slice))
    }

    fn image_read(&self, inst: &Instruction, ctx: &ExecContext) -> Result<Value> {
        let Value::Image { set, binding } = self.operand(inst, 2)? else {
            bail!("OpImageRead on a value that is not an image");
        };
        let image = ctx.image(set, binding)?;
        let coord = self.operand(inst, 3)?;
        let texel = match self.texel_location(image, &coord)? {
            Some(offset) => decode_texel(image.format, &image.memory.read_vec(offset, image.texel_size()))?,
            None => [Value::Word(0), Value::Word(0), Value::Word(0), Value::Word(0)],
        };
        Ok(match self.program.ty(arg(inst, 0)?)? {
            Type::Vector { count, .. } => Value::Composite(texel[..*count as usize].to_vec()),
            _ => texel[0].clone(),
        })
    }

    fn image_write(&self, inst: &Instruction, ctx: &ExecContext) -> Result<()> {
        let Value::Image { set, binding } = self.operand(inst, 0)? else {
            bail!("OpImageWrite on a value that is not an image");
        };
        let image = ctx.image(set, binding)?;
        let coord = self.operand(inst, 1)?;
        let texel = self.operand(inst, 2)?;
        if let Some(offset) = self.texel_location(image, &coord)? {
            image.memory.write(offset, &encode_texel(image.format, &texel.scalars())?);
        }
        Ok(())
    }
}

fn binary(op: Op, a: &Value, b: &Value) -> Result<Value> {
    let word = |v: &Value| v.word();
    let f32_of = |v: &Value| v.float();
    let boolean = |v: &Value| v.boolean();
    match op {
        Op::IAdd => a.zip(b, &int(u32::wrapping_add)),
        Op::ISub => a.zip(b, &int(u32::wrapping_sub)),
        Op::IMul => a.zip(b, &int(u32::wrapping_mul)),
        Op::UDiv => a.zip(b, &int(|x, y| if y == 0 { 0 } else { x / y })),
        Op::UMod => a.zip(b, &int(|x, y| if y == 0 { 0 } else { x % y })),
        Op::SDiv => a.zip(b, &sint(|x, y| if y == 0 { 0 } else { x.wrapping_div(y) })),
        Op::SRem => a.zip(b, &sint(|x, y| if y == 0 { 0 } else { x.wrapping_rem(y) })),
        Op::SMod => a.zip(b, &sint(floored_rem_i32)),
        Op::FAdd => a.zip(b, &float(|x, y| x + y)),
        Op::FSub => a.zip(b, &float(|x, y| x - y)),
        Op::FMul | Op::VectorTimesScalar => a.zip(b, &float(|x, y| x * y)),
        Op::FDiv => a.zip(b, &float(|x, y| x / y)),
        Op::FRem => a.zip(b, &float(|x, y| x % y)),
        Op::FMod => a.zip(b, &float(floored_rem_f32)),
        Op::ShiftRightLogical => a.zip(b, &int(u32::wrapping_shr)),
        Op::ShiftRightArithmetic => a.zip(b, &int(|x, y| (x as i32).wrapping_shr(y) as u32)),
        Op::ShiftLeftLogical => a.zip(b, &int(u32::wrapping_shl)),
        Op::BitwiseOr => a.zip(b, &int(|x, y| x | y)),
        Op::BitwiseXor => a.zip(b, &int(|x, y| x ^ y)),
        Op::BitwiseAnd => a.zip(b, &int(|x, y| x & y)),
        Op::LogicalEqual => a.zip(b, &compare(boolean, |x, y| x == y)),
        Op::LogicalNotEqual => a.zip(b, &compare(boolean, |x, y| x != y)),
        Op::LogicalOr => a.zip(b, &compare(boolean, |x, y| x || y)),
        Op::LogicalAnd => a.zip(b, &compare(boolean, |x, y| x && y)),
        Op::IEqual => a.zip(b, &compare(word, |x, y| x == y)),
        Op::INotEqual => a.zip(b, &compare(word, |x, y| x != y)),
        Op::UGreaterThan => a.zip(b, &compare(word, |x, y| x > y)),
        Op::UGreaterThanEqual => a.zip(b, &compare(word, |x, y| x >= y)),
        Op::ULessThan => a.zip(b, &compare(word, |x, y| x < y)),
        Op::ULessThanEqual => a.zip(b, &compare(word, |x, y| x <= y)),
        Op::SGreaterThan => a.zip(b, &compare(signed, |x, y| x > y)),
        Op::SGreaterThanEqual => a.zip(b, &compare(signed, |x, y| x >= y)),
        Op::SLessThan => a.zip(b, &compare(signed, |x, y| x < y)),
        Op::SLessThanEqual => a.zip(b, &compare(signed, |x, y| x <= y)),
        Op::FOrdEqual => a.zip(b, &compare(f32_of, |x, y| x == y)),
        Op::FOrdNotEqual => a.zip(b, &compare(f32_of, |x, y| !x.is_nan() && !y.is_nan() && x != y)),
        Op::FUnordNotEqual => a.zip(b, &compare(f32_of, |x, y| x != y)),
        Op::FOrdLessThan => a.zip(b, &compare(f32_of, |x, y| x < y)),
        Op::FOrdGreaterThan => a.zip(b, &compare(f32_of, |x, y| x > y)),
        Op::FOrdLessThanEqual => a.zip(b, &compare(f32_of, |x, y| x <= y)),
        Op::FOrdGreaterThanEqual => a.zip(b, &compare(f32_of, |x, y| x >= y)),
        other => bail!("instruction {:?} is not executable", other),
    }
}

/// Expand a stored texel into four channels
fn decode_texel(format: ImageFormat, bytes: &[u8]) -> Result<[Value; 4]> {
    use ImageFormat::*;
    let word = |i: usize| Value::Word(u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]));
    let one_f = Value::from_f32(1.0);
    let zero = Value::Word(0);
    Ok(match format {
        R32Uint | R32Int => [word(0), zero.clone(), zero, Value::Word(1)],
        R32Float => [word(0), zero.clone(), zero, one_f],
        R32G32Uint | R32G32Int => [word(0), word(1), zero, Value::Word(1)],
        R32G32Float => [word(0), word(1), zero, one_f],
        R32G32B32A32Uint | R32G32B32A32Int | R32G32B32A32Float => [word(0), word(1), word(2), word(3)],
        R8G8B8A8Unorm | R8G8B8A8UnormSrgb => {
            let f = |i: usize| Value::from_f32(bytes[i] as f32 / 255.0);
            [f(0), f(1), f(2), f(3)]
        }
        R8G8B8A8Snorm => {
            let f = |i: usize| Value::from_f32((bytes[i] as i8 as f32 / 127.0).max(-1.0));
            [f(0), f(1), f(2), f(3)]
        }
        R8G8B8A8Uint => {
            let u = |i: usize| Value::Word(bytes[i] as u32);
            [u(0), u(1), u(2), u(3)]
        }
        R8G8B8A8Int => {
            let s = |i: usize| Value::Word(bytes[i] as i8 as i32 as u32);
            [s(0), s(1), s(2), s(3)]
        }
        other => bail!("storage image format {:?} is not supported by the CPU backend", other),
    })
}

fn encode_texel(format: ImageFormat, channels: &[Value]) -> Result<Vec<u8>> {
    use ImageFormat::*;
    let channel = |i: usize| channels.get(i).cloned().unwrap_or(Value::Word(0));
    let words = |n: usize| -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4 * n);
        for i in 0..n {
            out.extend_from_slice(&channel(i).word()?.to_le_bytes());
        }
        Ok(out)
    };
    Ok(match format {
        R32Uint | R32Int | R32Float => words(1)?,
        R32G32Uint | R32G32Int | R32G32Float => words(2)?,
        R32G32B32A32Uint | R32G32B32A32Int | R32G32B32A32Float => words(4)?,
        R8G8B8A8Unorm | R8G8B8A8UnormSrgb => (0..4)
            .map(|i| Ok((channel(i).float()?.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect::<Result<_>>()?,
        R8G8B8A8Snorm => (0..4)
            .map(|i| Ok((channel(i).float()?.clamp(-1.0, 1.0) * 127.0).round() as i8 as u8))
            .collect::<Result<_>>()?,
        R8G8B8A8Uint | R8G8B8A8Int => (0..4)
            .map(|i| Ok(channel(i).word()? as u8))
            .collect::<Result<_>>()?,
        other => bail!("storage image format {:?} is not supported by the CPU backend", other),
    })
}

/// Execute one workgroup to completion
pub fn run_workgroup(
    program: &Program,
    local_size: [u32; 3],
    workgroup_id: [u32; 3],
    num_workgroups: [u32; 3],
    ctx: &ExecContext,
) -> Result<()> {
    let count = workgroup_invocations(local_size)
        .ok_or_else(|| anyhow!("workgroup size {:?} is out of range", local_size))?;
    let mut invocations = Vec::with_capacity(count as usize);
    for z in 0..local_size[2] {
        for y in 0..local_size[1] {
            for x in 0..local_size[0] {
                let local_id = [x, y, z];
                let builtins = Builtins {
                    global_id: [
                        workgroup_id[0].wrapping_mul(local_size[0]).wrapping_add(x),
                        workgroup_id[1].wrapping_mul(local_size[1]).wrapping_add(y),
                        workgroup_id[2].wrapping_mul(local_size[2]).wrapping_add(z),
                    ],
                    local_id,
                    workgroup_id,
                    num_workgroups,
                    workgroup_size: local_size,
                    local_index: (z * local_size[1] + y) * local_size[0] + x,
                };
                invocations.push(Invocation::new(program, &builtins)?);
            }
        }
    }

    let result = step_until_done(&mut invocations, ctx);
    ctx.shared.lock().retain(|(key, _), _| *key != ctx.workgroup);
    result
}

/// Round-robin over the invocations until none is parked on a barrier
fn step_until_done(invocations: &mut [Invocation], ctx: &ExecContext) -> Result<()> {
    loop {
        let mut waiting = 0;
        for invocation in invocations.iter_mut() {
            if let Step::Barrier = invocation.run(ctx)? {
                waiting += 1;
            }
        }
        if waiting == 0 {
            return Ok(());
        }
    }
}
