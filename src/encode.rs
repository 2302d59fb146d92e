use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::classfile::{ClassFile, CodeAttribute, ExceptionEntry, RawAttribute};
use crate::constant_pool::ConstantPool;
use crate::decode::padding;
use crate::descriptor;
use crate::error::PatchError;
use crate::frames::{self, Frame};
use crate::ir::{Constant, Insn, Label, LocalVariableTable, MethodBody};
use crate::opcodes;

/// Maximum widening rounds before layout is declared unstable.
const MAX_LAYOUT_ROUNDS: usize = 32;

/// Instruction offsets for one layout attempt.
struct Layout {
    offsets: Vec<u32>,
    labels: BTreeMap<Label, u32>,
    code_length: u32,
}

impl Layout {
    fn label_offset(&self, label: Label) -> Result<u32> {
        self.labels.get(&label).copied().ok_or_else(|| {
            PatchError::serialization(format!("label {label:?} has no offset"))
        })
    }
}

/// Serialize a method body into `Code` attribute contents.
///
/// Recomputes max stack, max locals and (for class files that use them)
/// StackMapTable frames. Conditional branches that no longer reach their
/// target are rewritten in place into an inverted branch over a `goto_w`.
pub(crate) fn encode_method(class: &mut ClassFile, body: &mut MethodBody) -> Result<Vec<u8>> {
    let emit_frames = class.uses_stack_map_frames();
    let pool = &mut class.constant_pool;

    let mut wide_gotos = BTreeSet::new();
    let mut rounds = 0;
    let layout = loop {
        rounds += 1;
        if rounds > MAX_LAYOUT_ROUNDS {
            return Err(PatchError::serialization("branch layout did not converge"));
        }
        let layout = compute_layout(body, pool, &wide_gotos)?;
        let mut changed = false;
        let mut far_conditionals = Vec::new();
        for (index, insn) in body.insns.iter().enumerate() {
            let Insn::Jump { opcode, target } = insn else {
                continue;
            };
            let displacement =
                layout.label_offset(*target)? as i64 - layout.offsets[index] as i64;
            if i16::try_from(displacement).is_ok() {
                continue;
            }
            if *opcode == opcodes::GOTO {
                changed |= wide_gotos.insert(index);
            } else {
                far_conditionals.push(index);
            }
        }
        if !far_conditionals.is_empty() {
            widen_conditionals(body, &far_conditionals)?;
            wide_gotos.clear();
            continue;
        }
        if !changed {
            break layout;
        }
    };
    if layout.code_length == 0 || layout.code_length > u16::MAX as u32 {
        return Err(PatchError::serialization(format!(
            "method {}{} code length {} is outside 1..=65535",
            body.method_name, body.descriptor, layout.code_length
        )));
    }

    let analysis = frames::analyze(body, emit_frames)
        .with_context(|| format!("compute frames for {}{}", body.method_name, body.descriptor))?;

    let mut code = Vec::with_capacity(layout.code_length as usize);
    for (index, insn) in body.insns.iter().enumerate() {
        let offset = layout.offsets[index];
        if code.len() as u32 != offset {
            return Err(PatchError::serialization(format!(
                "layout mismatch at instruction {index}: expected {offset}, wrote {}",
                code.len()
            )));
        }
        emit(
            &mut code,
            insn,
            offset,
            &layout,
            pool,
            wide_gotos.contains(&index),
        )?;
    }

    let mut exception_table = Vec::with_capacity(body.try_catches.len());
    for try_catch in &body.try_catches {
        let start_pc = layout.label_offset(try_catch.start)?;
        let end_pc = layout.label_offset(try_catch.end)?;
        if start_pc >= end_pc {
            tracing::debug!(
                method = %body.method_name,
                "dropping empty exception range"
            );
            continue;
        }
        let catch_type = match &try_catch.catch_type {
            Some(name) => pool.intern_class(name)?,
            None => 0,
        };
        exception_table.push(ExceptionEntry {
            start_pc: start_pc as u16,
            end_pc: end_pc as u16,
            handler_pc: layout.label_offset(try_catch.handler)? as u16,
            catch_type,
        });
    }

    let mut attributes = Vec::new();
    if !body.line_numbers.is_empty() {
        let mut info = Vec::new();
        info.extend_from_slice(&(body.line_numbers.len() as u16).to_be_bytes());
        for (label, line) in &body.line_numbers {
            info.extend_from_slice(&(layout.label_offset(*label)? as u16).to_be_bytes());
            info.extend_from_slice(&line.to_be_bytes());
        }
        attributes.push(RawAttribute {
            name_index: pool.intern_utf8("LineNumberTable")?,
            info,
        });
    }
    for (table, attribute_name) in [
        (LocalVariableTable::Types, "LocalVariableTable"),
        (LocalVariableTable::Signatures, "LocalVariableTypeTable"),
    ] {
        let entries: Vec<_> = body
            .local_variables
            .iter()
            .filter(|variable| variable.table == table)
            .collect();
        if entries.is_empty() {
            continue;
        }
        let mut info = Vec::new();
        info.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for variable in entries {
            let start = layout.label_offset(variable.start)?;
            let end = layout.label_offset(variable.end)?;
            let length = end.checked_sub(start).ok_or_else(|| {
                PatchError::serialization("local variable range ends before it starts")
            })?;
            info.extend_from_slice(&(start as u16).to_be_bytes());
            info.extend_from_slice(&(length as u16).to_be_bytes());
            info.extend_from_slice(&variable.name_index.to_be_bytes());
            info.extend_from_slice(&variable.descriptor_index.to_be_bytes());
            info.extend_from_slice(&variable.slot.to_be_bytes());
        }
        attributes.push(RawAttribute {
            name_index: pool.intern_utf8(attribute_name)?,
            info,
        });
    }
    if emit_frames && !analysis.frames.is_empty() {
        let mut positioned: Vec<(u32, Frame)> = Vec::with_capacity(analysis.frames.len());
        for (label, frame) in &analysis.frames {
            positioned.push((layout.label_offset(*label)?, frame.clone()));
        }
        positioned.sort_by_key(|(offset, _)| *offset);
        let initial = frames::entry_frame(body)?;
        let info = frames::write_stack_map_table(&positioned, &initial, pool, &|label| {
            layout.label_offset(label)
        })?;
        attributes.push(RawAttribute {
            name_index: pool.intern_utf8("StackMapTable")?,
            info,
        });
    }

    body.max_stack = analysis.max_stack;
    body.max_locals = analysis.max_locals.max(body.max_locals);
    let attribute = CodeAttribute {
        max_stack: body.max_stack,
        max_locals: body.max_locals,
        code,
        exception_table,
        attributes,
    };
    attribute.to_bytes()
}

fn compute_layout(
    body: &MethodBody,
    pool: &mut ConstantPool,
    wide_gotos: &BTreeSet<usize>,
) -> Result<Layout> {
    let mut offsets = Vec::with_capacity(body.insns.len());
    let mut labels = BTreeMap::new();
    let mut offset = 0u32;
    for (index, insn) in body.insns.iter().enumerate() {
        offsets.push(offset);
        if let Insn::Label(label) = insn {
            if labels.insert(*label, offset).is_some() {
                return Err(PatchError::structural(format!(
                    "label {label:?} is placed more than once"
                )));
            }
        }
        let size = encoded_size(insn, offset, pool, wide_gotos.contains(&index))?;
        offset = offset
            .checked_add(size)
            .ok_or_else(|| PatchError::serialization("code offset overflow"))?;
    }
    Ok(Layout {
        offsets,
        labels,
        code_length: offset,
    })
}

fn encoded_size(insn: &Insn, offset: u32, pool: &mut ConstantPool, wide_goto: bool) -> Result<u32> {
    let size = match insn {
        Insn::Label(_) => 0,
        Insn::Simple(_) => 1,
        Insn::Int { opcode, .. } => match *opcode {
            opcodes::SIPUSH => 3,
            _ => 2,
        },
        Insn::Var { slot, .. } => match *slot {
            0..=3 => 1,
            4..=255 => 2,
            _ => 4,
        },
        Insn::Iinc { slot, delta } => {
            if *slot <= 255 && i8::try_from(*delta).is_ok() {
                3
            } else {
                6
            }
        }
        Insn::Ldc(constant) => {
            let index = constant_index(constant, pool)?;
            if constant.is_wide() || index > 255 { 3 } else { 2 }
        }
        Insn::Type { .. } | Insn::New { .. } | Insn::Field { .. } => 3,
        Insn::Invoke { opcode, .. } => {
            if *opcode == opcodes::INVOKEINTERFACE {
                5
            } else {
                3
            }
        }
        Insn::InvokeDynamic { .. } => 5,
        Insn::Jump { .. } => {
            if wide_goto {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch { targets, .. } => {
            1 + padding(offset as usize) as u32 + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            1 + padding(offset as usize) as u32 + 8 + 8 * pairs.len() as u32
        }
        Insn::MultiANewArray { .. } => 4,
    };
    Ok(size)
}

fn constant_index(constant: &Constant, pool: &mut ConstantPool) -> Result<u16> {
    match constant {
        Constant::Int(value) => pool.intern_integer(*value),
        Constant::Float(bits) => pool.intern_float(*bits),
        Constant::Long(value) => pool.intern_long(*value),
        Constant::Double(bits) => pool.intern_double(*bits),
        Constant::String(value) => pool.intern_string(value),
        Constant::Class(name) => pool.intern_class(name),
        Constant::MethodHandle(index) | Constant::MethodType(index) => Ok(*index),
        Constant::Dynamic { index, .. } => Ok(*index),
    }
}

/// Replace each far `if<cond> L` with `if<!cond> skip; goto L; skip:`.
fn widen_conditionals(body: &mut MethodBody, positions: &[usize]) -> Result<()> {
    for position in positions.iter().rev() {
        let Insn::Jump { opcode, target } = body.insns[*position].clone() else {
            continue;
        };
        let inverted = opcodes::invert_branch(opcode).ok_or_else(|| {
            PatchError::serialization(format!("cannot widen branch opcode 0x{opcode:02x}"))
        })?;
        let skip = body.new_label();
        body.insns.splice(
            *position..=*position,
            [
                Insn::Jump {
                    opcode: inverted,
                    target: skip,
                },
                Insn::Jump {
                    opcode: opcodes::GOTO,
                    target,
                },
                Insn::Label(skip),
            ],
        );
    }
    Ok(())
}

fn push_u16(code: &mut Vec<u8>, value: u16) {
    code.extend_from_slice(&value.to_be_bytes());
}

fn push_i32(code: &mut Vec<u8>, value: i32) {
    code.extend_from_slice(&value.to_be_bytes());
}

fn relative(layout: &Layout, label: Label, offset: u32) -> Result<i32> {
    let displacement = layout.label_offset(label)? as i64 - offset as i64;
    i32::try_from(displacement)
        .map_err(|_| PatchError::serialization("branch displacement overflow"))
}

fn emit(
    code: &mut Vec<u8>,
    insn: &Insn,
    offset: u32,
    layout: &Layout,
    pool: &mut ConstantPool,
    wide_goto: bool,
) -> Result<()> {
    match insn {
        Insn::Label(_) => {}
        Insn::Simple(opcode) => code.push(*opcode),
        Insn::Int { opcode, operand } => {
            code.push(*opcode);
            if *opcode == opcodes::SIPUSH {
                let value = i16::try_from(*operand)
                    .map_err(|_| PatchError::serialization("sipush operand out of range"))?;
                code.extend_from_slice(&value.to_be_bytes());
            } else if *opcode == opcodes::BIPUSH {
                let value = i8::try_from(*operand)
                    .map_err(|_| PatchError::serialization("bipush operand out of range"))?;
                code.push(value as u8);
            } else {
                let value = u8::try_from(*operand)
                    .map_err(|_| PatchError::serialization("newarray type out of range"))?;
                code.push(value);
            }
        }
        Insn::Var { opcode, slot } => {
            let (base, short_base) = match *opcode {
                opcodes::ILOAD..=opcodes::ALOAD => (opcodes::ILOAD, opcodes::ILOAD_0),
                _ => (opcodes::ISTORE, opcodes::ISTORE_0),
            };
            match *slot {
                0..=3 => code.push(short_base + (opcode - base) * 4 + *slot as u8),
                4..=255 => {
                    code.push(*opcode);
                    code.push(*slot as u8);
                }
                _ => {
                    code.push(opcodes::WIDE);
                    code.push(*opcode);
                    push_u16(code, *slot);
                }
            }
        }
        Insn::Iinc { slot, delta } => {
            if *slot <= 255 && i8::try_from(*delta).is_ok() {
                code.push(opcodes::IINC);
                code.push(*slot as u8);
                code.push(*delta as i8 as u8);
            } else {
                code.push(opcodes::WIDE);
                code.push(opcodes::IINC);
                push_u16(code, *slot);
                code.extend_from_slice(&delta.to_be_bytes());
            }
        }
        Insn::Ldc(constant) => {
            let index = constant_index(constant, pool)?;
            if constant.is_wide() {
                code.push(opcodes::LDC2_W);
                push_u16(code, index);
            } else if index > 255 {
                code.push(opcodes::LDC_W);
                push_u16(code, index);
            } else {
                code.push(opcodes::LDC);
                code.push(index as u8);
            }
        }
        Insn::Type { opcode, class } => {
            code.push(*opcode);
            push_u16(code, pool.intern_class(class)?);
        }
        Insn::New { class, .. } => {
            code.push(opcodes::NEW);
            push_u16(code, pool.intern_class(class)?);
        }
        Insn::Field {
            opcode,
            owner,
            name,
            descriptor,
        } => {
            code.push(*opcode);
            push_u16(code, pool.intern_field_ref(owner, name, descriptor)?);
        }
        Insn::Invoke {
            opcode,
            owner,
            name,
            descriptor,
            interface,
        } => {
            let index = pool.intern_method_ref(owner, name, descriptor, *interface)?;
            code.push(*opcode);
            push_u16(code, index);
            if *opcode == opcodes::INVOKEINTERFACE {
                let (arguments, _) = descriptor::invoke_stack_effect(descriptor)?;
                let count = u8::try_from(arguments + 1)
                    .map_err(|_| PatchError::serialization("too many interface arguments"))?;
                code.push(count);
                code.push(0);
            }
        }
        Insn::InvokeDynamic { cp_index, .. } => {
            code.push(opcodes::INVOKEDYNAMIC);
            push_u16(code, *cp_index);
            code.push(0);
            code.push(0);
        }
        Insn::Jump { opcode, target } => {
            let displacement = relative(layout, *target, offset)?;
            if wide_goto {
                code.push(opcodes::GOTO_W);
                push_i32(code, displacement);
            } else {
                let short = i16::try_from(displacement)
                    .map_err(|_| PatchError::serialization("branch displacement overflow"))?;
                code.push(*opcode);
                code.extend_from_slice(&short.to_be_bytes());
            }
        }
        Insn::TableSwitch {
            default,
            low,
            high,
            targets,
        } => {
            code.push(opcodes::TABLESWITCH);
            code.resize(code.len() + padding(offset as usize), 0);
            push_i32(code, relative(layout, *default, offset)?);
            push_i32(code, *low);
            push_i32(code, *high);
            for target in targets {
                push_i32(code, relative(layout, *target, offset)?);
            }
        }
        Insn::LookupSwitch { default, pairs } => {
            code.push(opcodes::LOOKUPSWITCH);
            code.resize(code.len() + padding(offset as usize), 0);
            push_i32(code, relative(layout, *default, offset)?);
            push_i32(code, pairs.len() as i32);
            for (key, target) in pairs {
                push_i32(code, *key);
                push_i32(code, relative(layout, *target, offset)?);
            }
        }
        Insn::MultiANewArray { class, dims } => {
            code.push(opcodes::MULTIANEWARRAY);
            push_u16(code, pool.intern_class(class)?);
            code.push(*dims);
        }
    }
    Ok(())
}
