use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::classfile::{
    ACC_STATIC, ClassFile, CodeAttribute, read_u8_class, read_u16_class, read_u32_class,
};
use crate::constant_pool::{ConstantPool, CpEntry};
use crate::error::PatchError;
use crate::frames;
use crate::ir::{Constant, Insn, Label, LocalVariable, LocalVariableTable, MethodBody, TryCatch};
use crate::opcodes;

/// Offsets that carry a label, allocated on first use.
#[derive(Default)]
struct LabelMap {
    by_offset: BTreeMap<u32, Label>,
    next: u32,
}

impl LabelMap {
    fn label_at(&mut self, offset: u32) -> Label {
        if let Some(label) = self.by_offset.get(&offset) {
            return *label;
        }
        let label = Label(self.next);
        self.next += 1;
        self.by_offset.insert(offset, label);
        label
    }
}

/// Decode the `Code` attribute of `class.methods[method_index]`.
///
/// Returns `None` for abstract and native methods.
pub(crate) fn decode_method(class: &ClassFile, method_index: usize) -> Result<Option<MethodBody>> {
    let method = class
        .methods
        .get(method_index)
        .ok_or_else(|| PatchError::malformed(format!("no method at index {method_index}")))?;
    let Some(code_index) = class.code_attribute_index(method)? else {
        return Ok(None);
    };
    let class_name = class.class_name()?;
    let method_name = class.member_name(method)?;
    let descriptor = class.member_descriptor(method)?;
    let code_attribute = CodeAttribute::parse(&method.attributes[code_index].info)
        .with_context(|| format!("parse Code of {class_name}.{method_name}{descriptor}"))?;
    let pool = &class.constant_pool;
    let code = &code_attribute.code;

    let mut boundaries = Vec::new();
    let mut labels = LabelMap::default();
    let mut offset = 0usize;
    while offset < code.len() {
        let length = instruction_length(code, offset)?;
        if offset + length > code.len() {
            return Err(PatchError::malformed(format!(
                "instruction at {offset} overruns the code array"
            )));
        }
        for target in branch_offsets(code, offset)? {
            labels.label_at(target);
        }
        if code[offset] == opcodes::NEW {
            labels.label_at(offset as u32);
        }
        boundaries.push(offset as u32);
        offset += length;
    }

    let mut try_catches = Vec::with_capacity(code_attribute.exception_table.len());
    for entry in &code_attribute.exception_table {
        let catch_type = if entry.catch_type == 0 {
            None
        } else {
            Some(pool.class_name(entry.catch_type)?)
        };
        try_catches.push(TryCatch {
            start: labels.label_at(entry.start_pc as u32),
            end: labels.label_at(entry.end_pc as u32),
            handler: labels.label_at(entry.handler_pc as u32),
            catch_type,
        });
    }

    let mut body = MethodBody {
        class_name: class_name.clone(),
        method_name,
        descriptor,
        is_static: method.access_flags & ACC_STATIC != 0,
        insns: Vec::new(),
        try_catches,
        line_numbers: Vec::new(),
        local_variables: Vec::new(),
        declared_frames: BTreeMap::new(),
        max_locals: code_attribute.max_locals,
        max_stack: code_attribute.max_stack,
        next_label: 0,
    };

    for attribute in &code_attribute.attributes {
        let name = class.attribute_name(attribute)?;
        let data = &attribute.info;
        match name.as_str() {
            "LineNumberTable" => {
                let mut cursor = 0;
                let count = read_u16_class(data, &mut cursor)?;
                for _ in 0..count {
                    let start = read_u16_class(data, &mut cursor)?;
                    let line = read_u16_class(data, &mut cursor)?;
                    body.line_numbers
                        .push((labels.label_at(start as u32), line));
                }
            }
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                let table = if name == "LocalVariableTable" {
                    LocalVariableTable::Types
                } else {
                    LocalVariableTable::Signatures
                };
                let mut cursor = 0;
                let count = read_u16_class(data, &mut cursor)?;
                for _ in 0..count {
                    let start = read_u16_class(data, &mut cursor)? as u32;
                    let length = read_u16_class(data, &mut cursor)? as u32;
                    let name_index = read_u16_class(data, &mut cursor)?;
                    let descriptor_index = read_u16_class(data, &mut cursor)?;
                    let slot = read_u16_class(data, &mut cursor)?;
                    body.local_variables.push(LocalVariable {
                        table,
                        start: labels.label_at(start),
                        end: labels.label_at(start + length),
                        name_index,
                        descriptor_index,
                        slot,
                    });
                }
            }
            "StackMapTable" => {
                let initial = frames::entry_frame(&body)?;
                let declared = frames::parse_stack_map_table(data, &initial, pool, &mut |offset| {
                    labels.label_at(offset)
                })
                .context("parse StackMapTable")?;
                for (offset, frame) in declared {
                    let label = labels.label_at(offset);
                    body.declared_frames.insert(label, frame);
                }
            }
            other => {
                tracing::debug!(
                    class = %class_name,
                    method = %body.method_name,
                    attribute = other,
                    "dropping code attribute on rewrite"
                );
            }
        }
    }

    let boundary_set: BTreeSet<u32> = boundaries.iter().copied().collect();
    let code_length = code.len() as u32;
    for offset in labels.by_offset.keys() {
        if *offset != code_length && !boundary_set.contains(offset) {
            return Err(PatchError::malformed(format!(
                "label offset {offset} is not an instruction boundary"
            )));
        }
    }

    let mut insns = Vec::with_capacity(boundaries.len() * 2);
    for offset in &boundaries {
        if let Some(label) = labels.by_offset.get(offset) {
            insns.push(Insn::Label(*label));
        }
        let insn = decode_instruction(class, pool, code, *offset as usize, &labels)
            .with_context(|| format!("decode instruction at offset {offset}"))?;
        insns.push(insn);
    }
    if let Some(label) = labels.by_offset.get(&code_length) {
        insns.push(Insn::Label(*label));
    }

    body.insns = insns;
    body.next_label = labels.next;
    Ok(Some(body))
}

fn decode_instruction(
    class: &ClassFile,
    pool: &ConstantPool,
    code: &[u8],
    offset: usize,
    labels: &LabelMap,
) -> Result<Insn> {
    let opcode = code[offset];
    let label = |target: u32| -> Result<Label> {
        labels
            .by_offset
            .get(&target)
            .copied()
            .ok_or_else(|| PatchError::malformed(format!("no label for offset {target}")))
    };
    let mut cursor = offset + 1;
    let insn = match opcode {
        opcodes::NOP..=opcodes::DCONST_1 => Insn::Simple(opcode),
        opcodes::BIPUSH => Insn::Int {
            opcode,
            operand: read_u8_class(code, &mut cursor)? as i8 as i32,
        },
        opcodes::SIPUSH => Insn::Int {
            opcode,
            operand: read_u16_class(code, &mut cursor)? as i16 as i32,
        },
        opcodes::LDC => {
            let index = read_u8_class(code, &mut cursor)? as u16;
            Insn::Ldc(constant(pool, index)?)
        }
        opcodes::LDC_W | opcodes::LDC2_W => {
            let index = read_u16_class(code, &mut cursor)?;
            Insn::Ldc(constant(pool, index)?)
        }
        opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE => Insn::Var {
            opcode,
            slot: read_u8_class(code, &mut cursor)? as u16,
        },
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
            let relative = opcode - opcodes::ILOAD_0;
            Insn::Var {
                opcode: opcodes::ILOAD + relative / 4,
                slot: (relative % 4) as u16,
            }
        }
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
            let relative = opcode - opcodes::ISTORE_0;
            Insn::Var {
                opcode: opcodes::ISTORE + relative / 4,
                slot: (relative % 4) as u16,
            }
        }
        opcodes::IALOAD..=opcodes::SALOAD | opcodes::IASTORE..=opcodes::LXOR => {
            Insn::Simple(opcode)
        }
        opcodes::IINC => Insn::Iinc {
            slot: read_u8_class(code, &mut cursor)? as u16,
            delta: read_u8_class(code, &mut cursor)? as i8 as i16,
        },
        opcodes::I2L..=opcodes::DCMPG => Insn::Simple(opcode),
        opcodes::IFEQ..=opcodes::GOTO | opcodes::IFNULL | opcodes::IFNONNULL => {
            let delta = read_u16_class(code, &mut cursor)? as i16 as i64;
            Insn::Jump {
                opcode,
                target: label(relative_target(offset, delta)?)?,
            }
        }
        opcodes::GOTO_W => {
            let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
            Insn::Jump {
                opcode: opcodes::GOTO,
                target: label(relative_target(offset, delta)?)?,
            }
        }
        opcodes::JSR | opcodes::RET | opcodes::JSR_W => {
            return Err(PatchError::structural(
                "jsr/ret subroutines are not supported",
            ));
        }
        opcodes::TABLESWITCH => {
            cursor += padding(offset);
            let default = read_u32_class(code, &mut cursor)? as i32 as i64;
            let low = read_u32_class(code, &mut cursor)? as i32;
            let high = read_u32_class(code, &mut cursor)? as i32;
            let count = switch_count(low, high)?;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
                targets.push(label(relative_target(offset, delta)?)?);
            }
            Insn::TableSwitch {
                default: label(relative_target(offset, default)?)?,
                low,
                high,
                targets,
            }
        }
        opcodes::LOOKUPSWITCH => {
            cursor += padding(offset);
            let default = read_u32_class(code, &mut cursor)? as i32 as i64;
            let npairs = read_u32_class(code, &mut cursor)? as i32;
            if npairs < 0 || npairs as usize > code.len().saturating_sub(cursor) / 8 {
                return Err(PatchError::malformed("invalid lookupswitch pair count"));
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = read_u32_class(code, &mut cursor)? as i32;
                let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
                pairs.push((key, label(relative_target(offset, delta)?)?));
            }
            Insn::LookupSwitch {
                default: label(relative_target(offset, default)?)?,
                pairs,
            }
        }
        opcodes::IRETURN..=opcodes::RETURN
        | opcodes::ARRAYLENGTH
        | opcodes::ATHROW
        | opcodes::MONITORENTER
        | opcodes::MONITOREXIT => Insn::Simple(opcode),
        opcodes::GETSTATIC..=opcodes::PUTFIELD => {
            let member = pool.member_ref(read_u16_class(code, &mut cursor)?)?;
            Insn::Field {
                opcode,
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
            }
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
            let member = pool.member_ref(read_u16_class(code, &mut cursor)?)?;
            Insn::Invoke {
                opcode,
                owner: member.owner,
                name: member.name,
                descriptor: member.descriptor,
                interface: member.interface,
            }
        }
        opcodes::INVOKEDYNAMIC => {
            let cp_index = read_u16_class(code, &mut cursor)?;
            let (bootstrap_index, name_and_type_index) = match pool.get(cp_index)? {
                CpEntry::InvokeDynamic {
                    bootstrap_index,
                    name_and_type_index,
                } => (*bootstrap_index, *name_and_type_index),
                _ => {
                    return Err(PatchError::malformed(format!(
                        "invokedynamic operand {cp_index} is not an InvokeDynamic constant"
                    )));
                }
            };
            let (name, descriptor) = pool.name_and_type(name_and_type_index)?;
            Insn::InvokeDynamic {
                cp_index,
                name,
                descriptor,
                bootstrap_strings: class.bootstrap_strings(bootstrap_index)?,
            }
        }
        opcodes::NEW => Insn::New {
            class: pool.class_name(read_u16_class(code, &mut cursor)?)?,
            site: label(offset as u32)?,
        },
        opcodes::NEWARRAY => Insn::Int {
            opcode,
            operand: read_u8_class(code, &mut cursor)? as i32,
        },
        opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => Insn::Type {
            opcode,
            class: pool.class_name(read_u16_class(code, &mut cursor)?)?,
        },
        opcodes::WIDE => {
            let widened = read_u8_class(code, &mut cursor)?;
            let slot = read_u16_class(code, &mut cursor)?;
            match widened {
                opcodes::IINC => Insn::Iinc {
                    slot,
                    delta: read_u16_class(code, &mut cursor)? as i16,
                },
                opcodes::ILOAD..=opcodes::ALOAD | opcodes::ISTORE..=opcodes::ASTORE => Insn::Var {
                    opcode: widened,
                    slot,
                },
                opcodes::RET => {
                    return Err(PatchError::structural(
                        "jsr/ret subroutines are not supported",
                    ));
                }
                other => {
                    return Err(PatchError::malformed(format!(
                        "invalid wide opcode 0x{other:02x}"
                    )));
                }
            }
        }
        opcodes::MULTIANEWARRAY => Insn::MultiANewArray {
            class: pool.class_name(read_u16_class(code, &mut cursor)?)?,
            dims: read_u8_class(code, &mut cursor)?,
        },
        other => {
            return Err(PatchError::malformed(format!(
                "unsupported opcode 0x{other:02x}"
            )));
        }
    };
    Ok(insn)
}

fn constant(pool: &ConstantPool, index: u16) -> Result<Constant> {
    let value = match pool.get(index)? {
        CpEntry::Integer(value) => Constant::Int(*value),
        CpEntry::Float(bits) => Constant::Float(*bits),
        CpEntry::Long(value) => Constant::Long(*value),
        CpEntry::Double(bits) => Constant::Double(*bits),
        CpEntry::String(utf8_index) => Constant::String(pool.utf8(*utf8_index)?),
        CpEntry::Class(name_index) => Constant::Class(pool.utf8(*name_index)?),
        CpEntry::MethodHandle { .. } => Constant::MethodHandle(index),
        CpEntry::MethodType(_) => Constant::MethodType(index),
        CpEntry::Dynamic {
            name_and_type_index,
            ..
        } => Constant::Dynamic {
            index,
            descriptor: pool.name_and_type(*name_and_type_index)?.1,
        },
        other => {
            return Err(PatchError::malformed(format!(
                "constant {index} is not loadable: {other:?}"
            )));
        }
    };
    Ok(value)
}

fn relative_target(offset: usize, delta: i64) -> Result<u32> {
    let target = offset as i64 + delta;
    u32::try_from(target)
        .map_err(|_| PatchError::malformed(format!("branch target {target} out of range")))
}

fn switch_count(low: i32, high: i32) -> Result<usize> {
    let count = (high as i64) - (low as i64) + 1;
    if count < 0 || count > u16::MAX as i64 {
        return Err(PatchError::malformed("invalid tableswitch range"));
    }
    Ok(count as usize)
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

/// Branch and switch targets of the instruction at `offset`, as absolute offsets.
fn branch_offsets(code: &[u8], offset: usize) -> Result<Vec<u32>> {
    let opcode = code[offset];
    let mut cursor = offset + 1;
    let targets = match opcode {
        opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
            let delta = read_u16_class(code, &mut cursor)? as i16 as i64;
            vec![relative_target(offset, delta)?]
        }
        opcodes::GOTO_W | opcodes::JSR_W => {
            let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
            vec![relative_target(offset, delta)?]
        }
        opcodes::TABLESWITCH => {
            cursor += padding(offset);
            let default = read_u32_class(code, &mut cursor)? as i32 as i64;
            let low = read_u32_class(code, &mut cursor)? as i32;
            let high = read_u32_class(code, &mut cursor)? as i32;
            let mut targets = vec![relative_target(offset, default)?];
            for _ in 0..switch_count(low, high)? {
                let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
                targets.push(relative_target(offset, delta)?);
            }
            targets
        }
        opcodes::LOOKUPSWITCH => {
            cursor += padding(offset);
            let default = read_u32_class(code, &mut cursor)? as i32 as i64;
            let npairs = read_u32_class(code, &mut cursor)? as i32;
            let mut targets = vec![relative_target(offset, default)?];
            for _ in 0..npairs.max(0) {
                cursor += 4;
                let delta = read_u32_class(code, &mut cursor)? as i32 as i64;
                targets.push(relative_target(offset, delta)?);
            }
            targets
        }
        _ => Vec::new(),
    };
    Ok(targets)
}

/// Encoded length of the instruction at `offset`.
pub(crate) fn instruction_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => {
            let mut cursor = offset + 1 + padding(offset) + 4;
            let low = read_u32_class(code, &mut cursor)? as i32;
            let high = read_u32_class(code, &mut cursor)? as i32;
            1 + padding(offset) + 12 + switch_count(low, high)? * 4
        }
        opcodes::LOOKUPSWITCH => {
            let mut cursor = offset + 1 + padding(offset) + 4;
            let npairs = read_u32_class(code, &mut cursor)? as i32;
            if npairs < 0 || npairs as usize > code.len().saturating_sub(cursor) / 8 {
                return Err(PatchError::malformed("invalid lookupswitch pair count"));
            }
            1 + padding(offset) + 8 + (npairs as usize) * 8
        }
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => match code.get(offset + 1) {
            Some(&opcodes::IINC) => 6,
            Some(_) => 4,
            None => return Err(PatchError::malformed("truncated wide instruction")),
        },
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        other => {
            return Err(PatchError::malformed(format!(
                "unsupported opcode 0x{other:02x}"
            )));
        }
    };
    Ok(length)
}
