// SPIR-V module loading for the CPU interpreter
//
// Only the compute subset is accepted. Types, constants, decorations and
// global variables are resolved up front; function bodies are kept as
// decoded instructions grouped into blocks.

use anyhow::{anyhow, bail, ensure, Context, Result};
use spirv::{BuiltIn, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};
use std::collections::HashMap;

use super::value::Value;

pub type Id = u32;

#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Int { signed: bool },
    Float,
    Vector { component: Id, count: u32 },
    Array { element: Id, length: u32, stride: Option<u32> },
    RuntimeArray { element: Id, stride: Option<u32> },
    Struct { members: Vec<Id>, offsets: Vec<Option<u32>> },
    Pointer { class: StorageClass, pointee: Id },
    Image { dim: spirv::Dim },
    Function,
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub op: Op,
    pub operands: Box<[u32]>,
}

#[derive(Debug)]
pub struct Block {
    pub label: Id,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug)]
pub struct Function {
    pub id: Id,
    pub params: Vec<Id>,
    pub blocks: Vec<Block>,
    labels: HashMap<Id, usize>,
}

impl Function {
    pub fn block_index(&self, label: Id) -> Result<usize> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| anyhow!("branch to unknown label %{}", label))
    }
}

#[derive(Clone, Debug)]
pub struct GlobalVariable {
    pub id: Id,
    pub class: StorageClass,
    pub pointee: Id,
    pub initializer: Option<Id>,
    pub set: Option<u32>,
    pub binding: Option<u32>,
    pub builtin: Option<BuiltIn>,
}

#[derive(Default)]
struct Decorations {
    set: HashMap<Id, u32>,
    binding: HashMap<Id, u32>,
    builtin: HashMap<Id, BuiltIn>,
    stride: HashMap<Id, u32>,
    offsets: HashMap<(Id, u32), u32>,
}

/// A parsed compute shader, shared read-only by every invocation
#[derive(Debug)]
pub struct Program {
    pub bound: u32,
    pub entry: Id,
    pub local_size: Option<[u32; 3]>,
    pub glsl_std: Option<Id>,
    types: Vec<Option<Type>>,
    constants: Vec<Option<Value>>,
    pub globals: Vec<GlobalVariable>,
    functions: Vec<Function>,
    function_index: HashMap<Id, usize>,
}

fn read_string(words: &[u32]) -> Result<(String, usize)> {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        let chars = word.to_le_bytes();
        match chars.iter().position(|&c| c == 0) {
            Some(pos) => {
                bytes.extend_from_slice(&chars[..pos]);
                return Ok((String::from_utf8(bytes)?, i + 1));
            }
            None => bytes.extend_from_slice(&chars),
        }
    }
    bail!("unterminated string literal")
}

fn operand(operands: &[u32], index: usize, op: Op) -> Result<u32> {
    operands
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("{:?} is missing operand {}", op, index))
}

impl Program {
    /// Decode a little- or big-endian SPIR-V binary
    pub fn parse(code: &[u8], entrypoint: &str) -> Result<Self> {
        ensure!(code.len() % 4 == 0, "SPIR-V size {} is not a multiple of 4", code.len());
        let mut words: Vec<u32> = code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        ensure!(words.len() >= 5, "SPIR-V header is truncated");
        if words[0] == spirv::MAGIC_NUMBER.swap_bytes() {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }
        ensure!(words[0] == spirv::MAGIC_NUMBER, "bad SPIR-V magic number {:#x}", words[0]);
        Self::from_words(&words, entrypoint)
    }

    pub fn from_words(words: &[u32], entrypoint: &str) -> Result<Self> {
        ensure!(words.len() >= 5, "SPIR-V header is truncated");
        let bound = words[3];
        let mut program = Program {
            bound,
            entry: 0,
            local_size: None,
            glsl_std: None,
            types: vec![None; bound as usize],
            constants: vec![None; bound as usize],
            globals: Vec::new(),
            functions: Vec::new(),
            function_index: HashMap::new(),
        };

        let mut decorations = Decorations::default();
        let mut entry = None;
        let mut modes: Vec<(Id, [u32; 3], bool)> = Vec::new();
        let mut current: Option<Function> = None;

        let mut pos = 5;
        while pos < words.len() {
            let word = words[pos];
            let (wc, opcode) = ((word >> 16) as usize, word & 0xffff);
            ensure!(wc != 0, "instruction with zero word count at word {}", pos);
            ensure!(pos + wc <= words.len(), "instruction runs past the end of the module");
            let op = Op::from_u32(opcode).ok_or_else(|| anyhow!("unknown opcode {}", opcode))?;
            let operands = &words[pos + 1..pos + wc];
            pos += wc;

            if let Some(function) = current.as_mut() {
                match op {
                    Op::FunctionParameter => {
                        function.params.push(operand(operands, 1, op)?);
                    }
                    Op::Label => {
                        let label = operand(operands, 0, op)?;
                        function.labels.insert(label, function.blocks.len());
                        function.blocks.push(Block {
                            label,
                            instructions: Vec::new(),
                        });
                    }
                    Op::FunctionEnd => {
                        if let Some(function) = current.take() {
                            program.function_index.insert(function.id, program.functions.len());
                            program.functions.push(function);
                        }
                    }
                    Op::Line | Op::NoLine | Op::Nop => {}
                    _ => {
                        ensure!(is_supported(op), "unsupported instruction {:?}", op);
                        let block = function
                            .blocks
                            .last_mut()
                            .ok_or_else(|| anyhow!("{:?} outside of a block", op))?;
                        block.instructions.push(Instruction {
                            op,
                            operands: operands.into(),
                        });
                    }
                }
                continue;
            }

            match op {
                Op::EntryPoint => {
                    let model = operand(operands, 0, op)?;
                    let function = operand(operands, 1, op)?;
                    let (name, _) = read_string(&operands[2..])?;
                    if name == entrypoint && ExecutionModel::from_u32(model) == Some(ExecutionModel::GLCompute) {
                        entry = Some(function);
                    }
                }
                Op::ExecutionMode | Op::ExecutionModeId => {
                    let target = operand(operands, 0, op)?;
                    if ExecutionMode::from_u32(operand(operands, 1, op)?) == Some(ExecutionMode::LocalSize)
                        || ExecutionMode::from_u32(operand(operands, 1, op)?) == Some(ExecutionMode::LocalSizeId)
                    {
                        let size = [
                            operand(operands, 2, op)?,
                            operand(operands, 3, op)?,
                            operand(operands, 4, op)?,
                        ];
                        modes.push((target, size, op == Op::ExecutionModeId));
                    }
                }
                Op::ExtInstImport => {
                    let (name, _) = read_string(&operands[1..])?;
                    if name == "GLSL.std.450" {
                        program.glsl_std = Some(operand(operands, 0, op)?);
                    }
                }
                Op::Decorate => {
                    let target = operand(operands, 0, op)?;
                    match Decoration::from_u32(operand(operands, 1, op)?) {
                        Some(Decoration::DescriptorSet) => {
                            decorations.set.insert(target, operand(operands, 2, op)?);
                        }
                        Some(Decoration::Binding) => {
                            decorations.binding.insert(target, operand(operands, 2, op)?);
                        }
                        Some(Decoration::ArrayStride) => {
                            decorations.stride.insert(target, operand(operands, 2, op)?);
                        }
                        Some(Decoration::BuiltIn) => {
                            let raw = operand(operands, 2, op)?;
                            let builtin = BuiltIn::from_u32(raw)
                                .ok_or_else(|| anyhow!("unknown builtin {}", raw))?;
                            decorations.builtin.insert(target, builtin);
                        }
                        _ => {}
                    }
                }
                Op::MemberDecorate => {
                    if Decoration::from_u32(operand(operands, 2, op)?) == Some(Decoration::Offset) {
                        decorations.offsets.insert(
                            (operand(operands, 0, op)?, operand(operands, 1, op)?),
                            operand(operands, 3, op)?,
                        );
                    }
                }
                Op::TypeVoid => program.set_type(operand(operands, 0, op)?, Type::Void)?,
                Op::TypeBool => program.set_type(operand(operands, 0, op)?, Type::Bool)?,
                Op::TypeInt => {
                    ensure!(operand(operands, 1, op)? == 32, "only 32-bit integers are supported");
                    let signed = operand(operands, 2, op)? != 0;
                    program.set_type(operand(operands, 0, op)?, Type::Int { signed })?;
                }
                Op::TypeFloat => {
                    ensure!(operand(operands, 1, op)? == 32, "only 32-bit floats are supported");
                    program.set_type(operand(operands, 0, op)?, Type::Float)?;
                }
                Op::TypeVector => {
                    let ty = Type::Vector {
                        component: operand(operands, 1, op)?,
                        count: operand(operands, 2, op)?,
                    };
                    program.set_type(operand(operands, 0, op)?, ty)?;
                }
                Op::TypeArray => {
                    let id = operand(operands, 0, op)?;
                    let length = program
                        .constant(operand(operands, 2, op)?)
                        .and_then(Value::as_word)
                        .ok_or_else(|| anyhow!("array %{} has a non-constant length", id))?;
                    let ty = Type::Array {
                        element: operand(operands, 1, op)?,
                        length,
                        stride: decorations.stride.get(&id).copied(),
                    };
                    program.set_type(id, ty)?;
                }
                Op::TypeRuntimeArray => {
                    let id = operand(operands, 0, op)?;
                    let ty = Type::RuntimeArray {
                        element: operand(operands, 1, op)?,
                        stride: decorations.stride.get(&id).copied(),
                    };
                    program.set_type(id, ty)?;
                }
                Op::TypeStruct => {
                    let id = operand(operands, 0, op)?;
                    let members = operands[1..].to_vec();
                    let offsets = (0..members.len() as u32)
                        .map(|m| decorations.offsets.get(&(id, m)).copied())
                        .collect();
                    program.set_type(id, Type::Struct { members, offsets })?;
                }
                Op::TypePointer => {
                    let raw = operand(operands, 1, op)?;
                    let class = StorageClass::from_u32(raw)
                        .ok_or_else(|| anyhow!("unknown storage class {}", raw))?;
                    let ty = Type::Pointer {
                        class,
                        pointee: operand(operands, 2, op)?,
                    };
                    program.set_type(operand(operands, 0, op)?, ty)?;
                }
                Op::TypeImage => {
                    let raw = operand(operands, 2, op)?;
                    let dim = spirv::Dim::from_u32(raw).ok_or_else(|| anyhow!("unknown image dim {}", raw))?;
                    program.set_type(operand(operands, 0, op)?, Type::Image { dim })?;
                }
                Op::TypeFunction => program.set_type(operand(operands, 0, op)?, Type::Function)?,
                Op::Constant | Op::SpecConstant => {
                    let value = Value::Word(operand(operands, 2, op)?);
                    program.set_constant(operand(operands, 1, op)?, value)?;
                }
                Op::ConstantTrue | Op::SpecConstantTrue => {
                    program.set_constant(operand(operands, 1, op)?, Value::Bool(true))?;
                }
                Op::ConstantFalse | Op::SpecConstantFalse => {
                    program.set_constant(operand(operands, 1, op)?, Value::Bool(false))?;
                }
                Op::ConstantComposite | Op::SpecConstantComposite => {
                    let parts = operands[2..]
                        .iter()
                        .map(|id| {
                            program
                                .constant(*id)
                                .cloned()
                                .ok_or_else(|| anyhow!("constant %{} used before definition", id))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    program.set_constant(operand(operands, 1, op)?, Value::Composite(parts))?;
                }
                Op::ConstantNull | Op::Undef => {
                    let zero = program.zero(operand(operands, 0, op)?)?;
                    program.set_constant(operand(operands, 1, op)?, zero)?;
                }
                Op::Variable => {
                    let id = operand(operands, 1, op)?;
                    let raw = operand(operands, 2, op)?;
                    let class = StorageClass::from_u32(raw)
                        .ok_or_else(|| anyhow!("unknown storage class {}", raw))?;
                    let pointee = match program.ty(operand(operands, 0, op)?)? {
                        Type::Pointer { pointee, .. } => *pointee,
                        other => bail!("variable %{} has non-pointer type {:?}", id, other),
                    };
                    program.globals.push(GlobalVariable {
                        id,
                        class,
                        pointee,
                        initializer: operands.get(3).copied(),
                        set: decorations.set.get(&id).copied(),
                        binding: decorations.binding.get(&id).copied(),
                        builtin: decorations.builtin.get(&id).copied(),
                    });
                }
                Op::Function => {
                    current = Some(Function {
                        id: operand(operands, 1, op)?,
                        params: Vec::new(),
                        blocks: Vec::new(),
                        labels: HashMap::new(),
                    });
                }
                // Debug info, capabilities and friends carry nothing we execute
                _ => {}
            }
        }

        ensure!(current.is_none(), "function is missing OpFunctionEnd");
        program.entry = entry.with_context(|| format!("no GLCompute entry point named '{}'", entrypoint))?;
        ensure!(
            program.function_index.contains_key(&program.entry),
            "entry point function %{} has no body",
            program.entry
        );

        for (target, size, by_id) in modes {
            if target != program.entry {
                continue;
            }
            program.local_size = Some(if by_id {
                let mut resolved = [1; 3];
                for (slot, id) in resolved.iter_mut().zip(size) {
                    *slot = program
                        .constant(id)
                        .and_then(Value::as_word)
                        .ok_or_else(|| anyhow!("LocalSizeId operand %{} is not a constant", id))?;
                }
                resolved
            } else {
                size
            });
        }

        // WorkgroupSize may also be declared as a decorated constant
        for (id, builtin) in &decorations.builtin {
            if *builtin == BuiltIn::WorkgroupSize {
                if let Some(Value::Composite(parts)) = program.constant(*id) {
                    let words: Vec<u32> = parts.iter().filter_map(Value::as_word).collect();
                    if words.len() == 3 {
                        program.local_size = Some([words[0], words[1], words[2]]);
                    }
                }
            }
        }

        Ok(program)
    }

    fn set_type(&mut self, id: Id, ty: Type) -> Result<()> {
        let slot = self
            .types
            .get_mut(id as usize)
            .ok_or_else(|| anyhow!("id %{} exceeds the module bound", id))?;
        *slot = Some(ty);
        Ok(())
    }

    fn set_constant(&mut self, id: Id, value: Value) -> Result<()> {
        let slot = self
            .constants
            .get_mut(id as usize)
            .ok_or_else(|| anyhow!("id %{} exceeds the module bound", id))?;
        *slot = Some(value);
        Ok(())
    }

    pub fn ty(&self, id: Id) -> Result<&Type> {
        self.types
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("%{} is not a type", id))
    }

    pub fn constant(&self, id: Id) -> Option<&Value> {
        self.constants.get(id as usize).and_then(Option::as_ref)
    }

    pub fn function(&self, id: Id) -> Result<&Function> {
        self.function_index
            .get(&id)
            .map(|&i| &self.functions[i])
            .ok_or_else(|| anyhow!("call to unknown function %{}", id))
    }

    /// Zero-initialised value of a type
    pub fn zero(&self, ty: Id) -> Result<Value> {
        Ok(match self.ty(ty)? {
            Type::Bool => Value::Bool(false),
            Type::Int { .. } | Type::Float => Value::Word(0),
            Type::Vector { component, count } => {
                Value::Composite(vec![self.zero(*component)?; *count as usize])
            }
            Type::Array { element, length, .. } => {
                Value::Composite(vec![self.zero(*element)?; *length as usize])
            }
            Type::Struct { members, .. } => Value::Composite(
                members
                    .iter()
                    .map(|m| self.zero(*m))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Type::RuntimeArray { .. } => Value::Composite(Vec::new()),
            _ => Value::Undef,
        })
    }

    /// Size in bytes of a type in explicitly laid out memory
    pub fn size_of(&self, ty: Id) -> Result<u32> {
        Ok(match self.ty(ty)? {
            Type::Bool | Type::Int { .. } | Type::Float => 4,
            Type::Vector { count, .. } => 4 * count,
            Type::Array { element, length, stride } => {
                let stride = match stride {
                    Some(stride) => *stride,
                    None => self.size_of(*element)?,
                };
                stride * length
            }
            Type::RuntimeArray { .. } => 0,
            Type::Struct { members, .. } => {
                let mut end = 0;
                for index in 0..members.len() {
                    let (offset, member) = self.member_offset(ty, index as u32)?;
                    end = end.max(offset + self.size_of(member)?);
                }
                end
            }
            other => bail!("type {:?} has no memory layout", other),
        })
    }

    /// Offset and type of a struct member, falling back to packed layout
    pub fn member_offset(&self, ty: Id, index: u32) -> Result<(u32, Id)> {
        let Type::Struct { members, offsets } = self.ty(ty)? else {
            bail!("%{} is not a struct", ty);
        };
        let member = *members
            .get(index as usize)
            .ok_or_else(|| anyhow!("struct %{} has no member {}", ty, index))?;
        if let Some(offset) = offsets[index as usize] {
            return Ok((offset, member));
        }
        let mut offset = 0;
        for previous in 0..index as usize {
            offset = match offsets[previous] {
                Some(explicit) => explicit,
                None => offset,
            } + self.size_of(members[previous])?;
        }
        Ok((offset, member))
    }

    /// Element type and stride of an array or runtime array
    pub fn element_stride(&self, ty: Id) -> Result<(Id, u32)> {
        match self.ty(ty)? {
            Type::Array { element, stride, .. } | Type::RuntimeArray { element, stride } => {
                let stride = match stride {
                    Some(stride) => *stride,
                    None => self.size_of(*element)?,
                };
                Ok((*element, stride))
            }
            Type::Vector { component, .. } => Ok((*component, 4)),
            other => bail!("cannot index into {:?}", other),
        }
    }
}

/// Instructions the interpreter knows how to execute
fn is_supported(op: Op) -> bool {
    use Op::*;
    matches!(
        op,
        Variable
            | Undef
            | Load
            | Store
            | AccessChain
            | InBoundsAccessChain
            | ArrayLength
            | CopyObject
            | CompositeConstruct
            | CompositeExtract
            | CompositeInsert
            | VectorShuffle
            | VectorTimesScalar
            | Dot
            | SNegate
            | FNegate
            | IAdd
            | FAdd
            | ISub
            | FSub
            | IMul
            | FMul
            | UDiv
            | SDiv
            | FDiv
            | UMod
            | SRem
            | SMod
            | FRem
            | FMod
            | ConvertFToU
            | ConvertFToS
            | ConvertSToF
            | ConvertUToF
            | UConvert
            | SConvert
            | Bitcast
            | ShiftRightLogical
            | ShiftRightArithmetic
            | ShiftLeftLogical
            | BitwiseOr
            | BitwiseXor
            | BitwiseAnd
            | Not
            | LogicalEqual
            | LogicalNotEqual
            | LogicalOr
            | LogicalAnd
            | LogicalNot
            | Select
            | IEqual
            | INotEqual
            | UGreaterThan
            | SGreaterThan
            | UGreaterThanEqual
            | SGreaterThanEqual
            | ULessThan
            | SLessThan
            | ULessThanEqual
            | SLessThanEqual
            | FOrdEqual
            | FOrdNotEqual
            | FOrdLessThan
            | FOrdGreaterThan
            | FOrdLessThanEqual
            | FOrdGreaterThanEqual
            | FUnordNotEqual
            | Any
            | All
            | Phi
            | LoopMerge
            | SelectionMerge
            | Branch
            | BranchConditional
            | Switch
            | Return
            | ReturnValue
            | Unreachable
            | Kill
            | FunctionCall
            | ExtInst
            | ControlBarrier
            | MemoryBarrier
            | ImageRead
            | ImageWrite
            | AtomicLoad
            | AtomicStore
            | AtomicExchange
            | AtomicCompareExchange
            | AtomicIIncrement
            | AtomicIDecrement
            | AtomicIAdd
            | AtomicISub
            | AtomicSMin
            | AtomicUMin
            | AtomicSMax
            | AtomicUMax
            | AtomicAnd
            | AtomicOr
            | AtomicXor
    )
}
