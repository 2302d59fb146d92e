use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Context, Result};

use crate::classfile::{read_u8_class, read_u16_class};
use crate::constant_pool::ConstantPool;
use crate::descriptor::{self, MethodShape};
use crate::error::PatchError;
use crate::ir::{Constant, Insn, Label, MethodBody};
use crate::opcodes;

const OBJECT: &str = "java/lang/Object";
const THROWABLE: &str = "java/lang/Throwable";

/// Verification type of one local or stack slot.
///
/// Long and double values occupy two slots; the second holds `Top`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object(String),
    Uninitialized(Label),
}

impl VType {
    fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            VType::Null | VType::Object(_) | VType::UninitializedThis | VType::Uninitialized(_)
        )
    }

    pub(crate) fn object(name: &str) -> Self {
        VType::Object(name.to_string())
    }
}

/// Locals and operand stack at one position, in slot-expanded form.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Frame {
    pub(crate) locals: Vec<VType>,
    pub(crate) stack: Vec<VType>,
}

impl Frame {
    fn set_local(&mut self, slot: usize, value: VType) {
        let wide = value.is_wide();
        let needed = slot + if wide { 2 } else { 1 };
        if self.locals.len() < needed {
            self.locals.resize(needed, VType::Top);
        }
        if slot > 0 && self.locals[slot - 1].is_wide() {
            self.locals[slot - 1] = VType::Top;
        }
        self.locals[slot] = value;
        if wide {
            self.locals[slot + 1] = VType::Top;
        }
    }

    fn replace_all(&mut self, from: &VType, to: &VType) {
        for value in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if value == from {
                *value = to.clone();
            }
        }
    }
}

/// Expand a StackMapTable-style list (one entry per long/double) into slots.
fn expand(values: Vec<VType>) -> Vec<VType> {
    let mut expanded = Vec::with_capacity(values.len());
    for value in values {
        let wide = value.is_wide();
        expanded.push(value);
        if wide {
            expanded.push(VType::Top);
        }
    }
    expanded
}

/// Inverse of [`expand`], also dropping trailing unused locals.
fn compress(values: &[VType], trim_tops: bool) -> Vec<VType> {
    let mut compressed = Vec::with_capacity(values.len());
    let mut index = 0;
    while index < values.len() {
        let value = &values[index];
        compressed.push(value.clone());
        index += if value.is_wide() { 2 } else { 1 };
    }
    if trim_tops {
        while compressed.last() == Some(&VType::Top) {
            compressed.pop();
        }
    }
    compressed
}

pub(crate) fn field_type(field_descriptor: &str) -> Result<VType> {
    let value = match descriptor::value_kind(field_descriptor)? {
        descriptor::ValueKind::Int => VType::Integer,
        descriptor::ValueKind::Float => VType::Float,
        descriptor::ValueKind::Long => VType::Long,
        descriptor::ValueKind::Double => VType::Double,
        descriptor::ValueKind::Reference => match descriptor::reference_class_name(field_descriptor)
        {
            Some(name) => VType::Object(name),
            None => {
                return Err(PatchError::malformed(format!(
                    "invalid reference descriptor {field_descriptor}"
                )));
            }
        },
    };
    Ok(value)
}

/// Implicit frame at method entry.
pub(crate) fn entry_frame(body: &MethodBody) -> Result<Frame> {
    let shape = MethodShape::parse(&body.descriptor)?;
    let mut locals = Vec::new();
    if !body.is_static {
        if body.method_name == "<init>" && body.class_name != OBJECT {
            locals.push(VType::UninitializedThis);
        } else {
            locals.push(VType::Object(body.class_name.clone()));
        }
    }
    for parameter in &shape.parameters {
        locals.push(field_type(parameter)?);
    }
    Ok(Frame {
        locals: expand(locals),
        stack: Vec::new(),
    })
}

/// Result of the type dataflow over a method body.
#[derive(Clone, Debug)]
pub(crate) struct FrameAnalysis {
    /// One frame per merge point, in instruction order, keyed by a label at that point.
    pub(crate) frames: Vec<(Label, Frame)>,
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
}

/// Infer frames for every merge point, trusting `declared_frames` where they exist.
pub(crate) fn analyze(body: &MethodBody, trust_declared: bool) -> Result<FrameAnalysis> {
    let insns = &body.insns;
    let mut label_index = BTreeMap::new();
    for (index, insn) in insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            label_index.insert(*label, index);
        }
    }
    let position_of = |label: Label| -> Result<usize> {
        label_index.get(&label).copied().ok_or_else(|| {
            PatchError::structural(format!("label {label:?} is not placed in the method"))
        })
    };

    let mut handlers = Vec::new();
    for try_catch in &body.try_catches {
        let start = position_of(try_catch.start)?;
        let end = position_of(try_catch.end)?;
        let handler = position_of(try_catch.handler)?;
        let catch_type = VType::Object(
            try_catch
                .catch_type
                .clone()
                .unwrap_or_else(|| THROWABLE.to_string()),
        );
        handlers.push((start, end, handler, catch_type));
    }

    let entry = entry_frame(body)?;
    let parameter_locals = entry.locals.clone();
    let mut pinned: BTreeMap<usize, Frame> = BTreeMap::new();
    if trust_declared {
        for (label, frame) in &body.declared_frames {
            if let Some(index) = label_index.get(label) {
                pinned.insert(*index, frame.clone());
            }
        }
    }

    let mut states: Vec<Option<Frame>> = vec![None; insns.len()];
    let mut queue = VecDeque::new();
    let mut max_stack = 0usize;
    let mut max_locals = body.max_locals as usize;

    if insns.is_empty() {
        return Err(PatchError::structural("method body is empty"));
    }
    merge_into(
        &mut states,
        &pinned,
        &mut queue,
        0,
        entry,
        &parameter_locals,
    )?;

    while let Some(index) = queue.pop_front() {
        let Some(state) = states[index].clone() else {
            continue;
        };
        max_stack = max_stack.max(state.stack.len());
        max_locals = max_locals.max(state.locals.len());

        for (start, end, handler, catch_type) in &handlers {
            if index >= *start && index < *end && insns[index].is_real() {
                let handler_state = Frame {
                    locals: state.locals.clone(),
                    stack: vec![catch_type.clone()],
                };
                merge_into(
                    &mut states,
                    &pinned,
                    &mut queue,
                    *handler,
                    handler_state,
                    &parameter_locals,
                )?;
            }
        }

        let insn = &insns[index];
        let mut after = state.clone();
        execute(body, insn, &mut after)
            .with_context(|| format!("interpret instruction {index} of {}", body.method_name))?;
        max_stack = max_stack.max(after.stack.len());
        max_locals = max_locals.max(after.locals.len());

        if matches!(insn, Insn::Var { .. } | Insn::Iinc { .. }) {
            for (start, end, handler, catch_type) in &handlers {
                if index >= *start && index < *end {
                    let handler_state = Frame {
                        locals: after.locals.clone(),
                        stack: vec![catch_type.clone()],
                    };
                    merge_into(
                        &mut states,
                        &pinned,
                        &mut queue,
                        *handler,
                        handler_state,
                        &parameter_locals,
                    )?;
                }
            }
        }

        for target in insn.targets() {
            let target_index = position_of(target)?;
            merge_into(
                &mut states,
                &pinned,
                &mut queue,
                target_index,
                after.clone(),
                &parameter_locals,
            )?;
        }
        if !insn.is_unconditional() {
            if index + 1 >= insns.len() {
                return Err(PatchError::structural(format!(
                    "execution falls off the end of {}{}",
                    body.method_name, body.descriptor
                )));
            }
            merge_into(
                &mut states,
                &pinned,
                &mut queue,
                index + 1,
                after,
                &parameter_locals,
            )?;
        }
    }

    for (index, insn) in insns.iter().enumerate() {
        if insn.is_real() && states[index].is_none() {
            return Err(PatchError::structural(format!(
                "unreachable instruction {index} in {}{}",
                body.method_name, body.descriptor
            )));
        }
    }

    let frame_labels = merge_point_labels(body);
    let mut frames = Vec::new();
    let mut emitted_positions = BTreeSet::new();
    for (index, insn) in insns.iter().enumerate() {
        let Insn::Label(label) = insn else {
            continue;
        };
        if !frame_labels.contains(label) {
            continue;
        }
        let Some(real) = body.next_real(index) else {
            return Err(PatchError::structural(format!(
                "branch target {label:?} has no instruction after it"
            )));
        };
        if !emitted_positions.insert(real) {
            continue;
        }
        let state = states[real].clone().ok_or_else(|| {
            PatchError::structural(format!("merge point {label:?} is unreachable"))
        })?;
        frames.push((*label, state));
    }

    let max_stack = u16::try_from(max_stack)
        .map_err(|_| PatchError::serialization("operand stack exceeds 65535 slots"))?;
    let max_locals = u16::try_from(max_locals)
        .map_err(|_| PatchError::serialization("locals exceed 65535 slots"))?;
    Ok(FrameAnalysis {
        frames,
        max_stack,
        max_locals,
    })
}

/// Labels that need a StackMapTable frame: jump and switch targets, handler entries.
pub(crate) fn merge_point_labels(body: &MethodBody) -> BTreeSet<Label> {
    let mut labels = BTreeSet::new();
    for insn in &body.insns {
        labels.extend(insn.targets());
    }
    for try_catch in &body.try_catches {
        labels.insert(try_catch.handler);
    }
    labels
}

fn merge_into(
    states: &mut [Option<Frame>],
    pinned: &BTreeMap<usize, Frame>,
    queue: &mut VecDeque<usize>,
    index: usize,
    incoming: Frame,
    parameter_locals: &[VType],
) -> Result<()> {
    if let Some(declared) = pinned.get(&index) {
        if declared.stack.len() != incoming.stack.len() {
            return Err(PatchError::structural(format!(
                "stack depth {} does not match declared frame depth {} at instruction {index}",
                incoming.stack.len(),
                declared.stack.len()
            )));
        }
        if states[index].is_none() {
            states[index] = Some(declared.clone());
            queue.push_back(index);
        }
        return Ok(());
    }

    match &states[index] {
        None => {
            states[index] = Some(incoming);
            queue.push_back(index);
        }
        Some(existing) => {
            let merged = merge_frames(existing, &incoming, parameter_locals)
                .with_context(|| format!("merge at instruction {index}"))?;
            if merged != *existing {
                states[index] = Some(merged);
                queue.push_back(index);
            }
        }
    }
    Ok(())
}

fn merge_frames(left: &Frame, right: &Frame, parameter_locals: &[VType]) -> Result<Frame> {
    if left.stack.len() != right.stack.len() {
        return Err(PatchError::structural(format!(
            "inconsistent stack depth at merge: {} vs {}",
            left.stack.len(),
            right.stack.len()
        )));
    }
    let mut stack = Vec::with_capacity(left.stack.len());
    for (a, b) in left.stack.iter().zip(&right.stack) {
        if a == b {
            stack.push(a.clone());
        } else if is_initialized_reference(a) && is_initialized_reference(b) {
            stack.push(merge_references(a, b, None));
        } else {
            return Err(PatchError::structural(format!(
                "incompatible stack values at merge: {a:?} vs {b:?}"
            )));
        }
    }

    let len = left.locals.len().max(right.locals.len());
    let mut locals = Vec::with_capacity(len);
    for slot in 0..len {
        let a = left.locals.get(slot).unwrap_or(&VType::Top);
        let b = right.locals.get(slot).unwrap_or(&VType::Top);
        let merged = if a == b {
            a.clone()
        } else if is_initialized_reference(a) && is_initialized_reference(b) {
            merge_references(a, b, parameter_locals.get(slot))
        } else {
            VType::Top
        };
        locals.push(merged);
    }
    // A wide value whose second half was lost is no longer usable.
    for slot in 0..locals.len() {
        if locals[slot].is_wide() && locals.get(slot + 1) != Some(&VType::Top) {
            locals[slot] = VType::Top;
        }
    }
    while locals.last() == Some(&VType::Top) {
        locals.pop();
    }
    Ok(Frame { locals, stack })
}

/// Whether a declared frame is consistent with an inferred one: same stack
/// shape, and every local the declared frame keeps holds a value of the same
/// category. Reference types are not compared, lacking a class hierarchy.
pub(crate) fn declared_frame_agrees(declared: &Frame, inferred: &Frame) -> bool {
    declared.stack.len() == inferred.stack.len()
        && declared
            .stack
            .iter()
            .zip(&inferred.stack)
            .all(|(declared, inferred)| same_category(declared, inferred))
        && declared.locals.iter().enumerate().all(|(slot, declared)| {
            *declared == VType::Top
                || inferred
                    .locals
                    .get(slot)
                    .is_some_and(|inferred| same_category(declared, inferred))
        })
}

fn same_category(declared: &VType, inferred: &VType) -> bool {
    match declared {
        VType::Top => true,
        value if value.is_reference() => inferred.is_reference(),
        value => value == inferred,
    }
}

fn is_initialized_reference(value: &VType) -> bool {
    matches!(value, VType::Null | VType::Object(_))
}

/// Without a class hierarchy, differing references merge to the declared
/// parameter type when one side still has it, otherwise to `java/lang/Object`.
fn merge_references(a: &VType, b: &VType, declared: Option<&VType>) -> VType {
    match (a, b) {
        (VType::Null, other) | (other, VType::Null) => other.clone(),
        _ => match declared {
            Some(declared) if declared == a || declared == b => declared.clone(),
            _ => VType::object(OBJECT),
        },
    }
}

fn pop(frame: &mut Frame, count: usize) -> Result<Vec<VType>> {
    if frame.stack.len() < count {
        return Err(PatchError::structural(format!(
            "operand stack underflow: need {count}, have {}",
            frame.stack.len()
        )));
    }
    let at = frame.stack.len() - count;
    Ok(frame.stack.split_off(at))
}

fn push(frame: &mut Frame, value: VType) {
    let wide = value.is_wide();
    frame.stack.push(value);
    if wide {
        frame.stack.push(VType::Top);
    }
}

pub(crate) fn simple_result(opcode: u8) -> Option<(usize, Option<VType>)> {
    use opcodes::*;
    let effect = match opcode {
        NOP => (0, None),
        ACONST_NULL => (0, Some(VType::Null)),
        ICONST_M1..=ICONST_5 => (0, Some(VType::Integer)),
        LCONST_0 | LCONST_1 => (0, Some(VType::Long)),
        FCONST_0..=FCONST_2 => (0, Some(VType::Float)),
        DCONST_0 | DCONST_1 => (0, Some(VType::Double)),
        IALOAD | BALOAD | CALOAD | SALOAD => (2, Some(VType::Integer)),
        LALOAD => (2, Some(VType::Long)),
        FALOAD => (2, Some(VType::Float)),
        DALOAD => (2, Some(VType::Double)),
        IASTORE | BASTORE | CASTORE | SASTORE | FASTORE | AASTORE => (3, None),
        LASTORE | DASTORE => (4, None),
        POP => (1, None),
        POP2 => (2, None),
        IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
            (2, Some(VType::Integer))
        }
        INEG | I2B | I2C | I2S => (1, Some(VType::Integer)),
        LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => (4, Some(VType::Long)),
        LNEG => (2, Some(VType::Long)),
        LSHL | LSHR | LUSHR => (3, Some(VType::Long)),
        FADD | FSUB | FMUL | FDIV | FREM => (2, Some(VType::Float)),
        FNEG => (1, Some(VType::Float)),
        DADD | DSUB | DMUL | DDIV | DREM => (4, Some(VType::Double)),
        DNEG => (2, Some(VType::Double)),
        I2L => (1, Some(VType::Long)),
        I2F => (1, Some(VType::Float)),
        I2D => (1, Some(VType::Double)),
        L2I => (2, Some(VType::Integer)),
        L2F => (2, Some(VType::Float)),
        L2D => (2, Some(VType::Double)),
        F2I => (1, Some(VType::Integer)),
        F2L => (1, Some(VType::Long)),
        F2D => (1, Some(VType::Double)),
        D2I => (2, Some(VType::Integer)),
        D2L => (2, Some(VType::Long)),
        D2F => (2, Some(VType::Float)),
        LCMP => (4, Some(VType::Integer)),
        FCMPL | FCMPG => (2, Some(VType::Integer)),
        DCMPL | DCMPG => (4, Some(VType::Integer)),
        IRETURN | FRETURN | ARETURN | ATHROW => (1, None),
        LRETURN | DRETURN => (2, None),
        RETURN => (0, None),
        ARRAYLENGTH => (1, Some(VType::Integer)),
        MONITORENTER | MONITOREXIT => (1, None),
        _ => return None,
    };
    Some(effect)
}

fn execute(body: &MethodBody, insn: &Insn, frame: &mut Frame) -> Result<()> {
    match insn {
        Insn::Label(_) => {}
        Insn::Simple(opcode) => execute_simple(*opcode, frame)?,
        Insn::Int { opcode, operand } => match *opcode {
            opcodes::BIPUSH | opcodes::SIPUSH => push(frame, VType::Integer),
            opcodes::NEWARRAY => {
                pop(frame, 1)?;
                let element = match u8::try_from(*operand).unwrap_or(0) {
                    opcodes::T_BOOLEAN => "Z",
                    opcodes::T_CHAR => "C",
                    opcodes::T_FLOAT => "F",
                    opcodes::T_DOUBLE => "D",
                    opcodes::T_BYTE => "B",
                    opcodes::T_SHORT => "S",
                    opcodes::T_INT => "I",
                    opcodes::T_LONG => "J",
                    other => {
                        return Err(PatchError::malformed(format!(
                            "invalid newarray type {other}"
                        )));
                    }
                };
                push(frame, VType::Object(format!("[{element}")));
            }
            other => {
                return Err(PatchError::structural(format!(
                    "opcode 0x{other:02x} cannot carry an int operand"
                )));
            }
        },
        Insn::Var { opcode, slot } => {
            let slot = *slot as usize;
            match *opcode {
                opcodes::ILOAD => push(frame, VType::Integer),
                opcodes::LLOAD => push(frame, VType::Long),
                opcodes::FLOAD => push(frame, VType::Float),
                opcodes::DLOAD => push(frame, VType::Double),
                opcodes::ALOAD => {
                    let value = frame.locals.get(slot).cloned().unwrap_or(VType::Top);
                    if !value.is_reference() {
                        return Err(PatchError::structural(format!(
                            "aload of slot {slot} holding {value:?}"
                        )));
                    }
                    push(frame, value);
                }
                opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE => {
                    let value = pop(frame, 1)?.remove(0);
                    frame.set_local(slot, value);
                }
                opcodes::LSTORE | opcodes::DSTORE => {
                    let value = pop(frame, 2)?.remove(0);
                    frame.set_local(slot, value);
                }
                other => {
                    return Err(PatchError::structural(format!(
                        "unsupported local variable opcode 0x{other:02x}"
                    )));
                }
            }
        }
        Insn::Iinc { slot, .. } => frame.set_local(*slot as usize, VType::Integer),
        Insn::Ldc(constant) => {
            let value = match constant {
                Constant::Int(_) => VType::Integer,
                Constant::Float(_) => VType::Float,
                Constant::Long(_) => VType::Long,
                Constant::Double(_) => VType::Double,
                Constant::String(_) => VType::object("java/lang/String"),
                Constant::Class(_) => VType::object("java/lang/Class"),
                Constant::MethodHandle(_) => VType::object("java/lang/invoke/MethodHandle"),
                Constant::MethodType(_) => VType::object("java/lang/invoke/MethodType"),
                Constant::Dynamic { descriptor, .. } => field_type(descriptor)?,
            };
            push(frame, value);
        }
        Insn::Type { opcode, class } => {
            pop(frame, 1)?;
            match *opcode {
                opcodes::ANEWARRAY => {
                    let array = if class.starts_with('[') {
                        format!("[{class}")
                    } else {
                        format!("[L{class};")
                    };
                    push(frame, VType::Object(array));
                }
                opcodes::CHECKCAST => push(frame, VType::Object(class.clone())),
                opcodes::INSTANCEOF => push(frame, VType::Integer),
                other => {
                    return Err(PatchError::structural(format!(
                        "opcode 0x{other:02x} cannot carry a type operand"
                    )));
                }
            }
        }
        Insn::New { site, .. } => push(frame, VType::Uninitialized(*site)),
        Insn::Field {
            opcode, descriptor, ..
        } => {
            let size = descriptor::value_kind(descriptor)?.slots();
            match *opcode {
                opcodes::GETSTATIC => push(frame, field_type(descriptor)?),
                opcodes::PUTSTATIC => {
                    pop(frame, size)?;
                }
                opcodes::GETFIELD => {
                    pop(frame, 1)?;
                    push(frame, field_type(descriptor)?);
                }
                opcodes::PUTFIELD => {
                    pop(frame, size + 1)?;
                }
                other => {
                    return Err(PatchError::structural(format!(
                        "opcode 0x{other:02x} is not a field access"
                    )));
                }
            }
        }
        Insn::Invoke {
            opcode,
            owner,
            name,
            descriptor,
            ..
        } => {
            let shape = MethodShape::parse(descriptor)?;
            pop(frame, shape.parameter_slots()?)?;
            if *opcode != opcodes::INVOKESTATIC {
                let receiver = pop(frame, 1)?.remove(0);
                if *opcode == opcodes::INVOKESPECIAL && name == "<init>" {
                    let initialized = match &receiver {
                        VType::UninitializedThis => VType::Object(body.class_name.clone()),
                        VType::Uninitialized(site) => {
                            VType::Object(new_site_class(body, *site).unwrap_or(owner.clone()))
                        }
                        _ => VType::Object(owner.clone()),
                    };
                    frame.replace_all(&receiver, &initialized);
                }
            }
            if let Some(return_type) = &shape.return_type {
                push(frame, field_type(return_type)?);
            }
        }
        Insn::InvokeDynamic { descriptor, .. } => {
            let shape = MethodShape::parse(descriptor)?;
            pop(frame, shape.parameter_slots()?)?;
            if let Some(return_type) = &shape.return_type {
                push(frame, field_type(return_type)?);
            }
        }
        Insn::Jump { opcode, .. } => match *opcode {
            opcodes::GOTO => {}
            opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => {
                pop(frame, 1)?;
            }
            opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => {
                pop(frame, 2)?;
            }
            other => {
                return Err(PatchError::structural(format!(
                    "unsupported jump opcode 0x{other:02x}"
                )));
            }
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => {
            pop(frame, 1)?;
        }
        Insn::MultiANewArray { class, dims } => {
            pop(frame, *dims as usize)?;
            push(frame, VType::Object(class.clone()));
        }
    }
    Ok(())
}

fn execute_simple(opcode: u8, frame: &mut Frame) -> Result<()> {
    if let Some((pops, result)) = simple_result(opcode) {
        pop(frame, pops)?;
        if let Some(result) = result {
            push(frame, result);
        }
        return Ok(());
    }
    match opcode {
        opcodes::AALOAD => {
            let popped = pop(frame, 2)?;
            let element = match &popped[0] {
                VType::Object(name) => match name.strip_prefix('[') {
                    Some(element) => field_type(element)?,
                    None => VType::object(OBJECT),
                },
                VType::Null => VType::Null,
                _ => VType::object(OBJECT),
            };
            push(frame, element);
        }
        opcodes::DUP => {
            let top = pop(frame, 1)?;
            frame.stack.extend(top.iter().cloned());
            frame.stack.extend(top);
        }
        opcodes::DUP_X1 => {
            let values = pop(frame, 2)?;
            frame.stack.push(values[1].clone());
            frame.stack.extend(values);
        }
        opcodes::DUP_X2 => {
            let values = pop(frame, 3)?;
            frame.stack.push(values[2].clone());
            frame.stack.extend(values);
        }
        opcodes::DUP2 => {
            let values = pop(frame, 2)?;
            frame.stack.extend(values.iter().cloned());
            frame.stack.extend(values);
        }
        opcodes::DUP2_X1 => {
            let values = pop(frame, 3)?;
            frame.stack.extend(values[1..].iter().cloned());
            frame.stack.extend(values);
        }
        opcodes::DUP2_X2 => {
            let values = pop(frame, 4)?;
            frame.stack.extend(values[2..].iter().cloned());
            frame.stack.extend(values);
        }
        opcodes::SWAP => {
            let mut values = pop(frame, 2)?;
            values.swap(0, 1);
            frame.stack.extend(values);
        }
        other => {
            return Err(PatchError::structural(format!(
                "unsupported opcode 0x{other:02x}"
            )));
        }
    }
    Ok(())
}

fn new_site_class(body: &MethodBody, site: Label) -> Option<String> {
    body.insns.iter().find_map(|insn| match insn {
        Insn::New { class, site: found } if *found == site => Some(class.clone()),
        _ => None,
    })
}

fn read_verification_type(
    data: &[u8],
    offset: &mut usize,
    pool: &ConstantPool,
    label_at: &mut dyn FnMut(u32) -> Label,
) -> Result<VType> {
    let value = match read_u8_class(data, offset)? {
        0 => VType::Top,
        1 => VType::Integer,
        2 => VType::Float,
        3 => VType::Double,
        4 => VType::Long,
        5 => VType::Null,
        6 => VType::UninitializedThis,
        7 => VType::Object(pool.class_name(read_u16_class(data, offset)?)?),
        8 => VType::Uninitialized(label_at(read_u16_class(data, offset)? as u32)),
        tag => {
            return Err(PatchError::malformed(format!(
                "invalid verification type tag {tag}"
            )));
        }
    };
    Ok(value)
}

fn read_verification_types(
    data: &[u8],
    offset: &mut usize,
    count: usize,
    pool: &ConstantPool,
    label_at: &mut dyn FnMut(u32) -> Label,
) -> Result<Vec<VType>> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_verification_type(data, offset, pool, label_at)?);
    }
    Ok(values)
}

/// Decode a StackMapTable attribute into absolute-offset frames.
pub(crate) fn parse_stack_map_table(
    data: &[u8],
    initial: &Frame,
    pool: &ConstantPool,
    label_at: &mut dyn FnMut(u32) -> Label,
) -> Result<Vec<(u32, Frame)>> {
    let mut offset = 0;
    let count = read_u16_class(data, &mut offset)?;
    let mut locals = compress(&initial.locals, false);
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let frame_type = read_u8_class(data, &mut offset)?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => (
                (frame_type - 64) as u32,
                read_verification_types(data, &mut offset, 1, pool, label_at)?,
            ),
            247 => {
                let delta = read_u16_class(data, &mut offset)? as u32;
                (
                    delta,
                    read_verification_types(data, &mut offset, 1, pool, label_at)?,
                )
            }
            248..=250 => {
                let delta = read_u16_class(data, &mut offset)? as u32;
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(PatchError::malformed("chop frame removes too many locals"));
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            251 => (read_u16_class(data, &mut offset)? as u32, Vec::new()),
            252..=254 => {
                let delta = read_u16_class(data, &mut offset)? as u32;
                let appended = read_verification_types(
                    data,
                    &mut offset,
                    (frame_type - 251) as usize,
                    pool,
                    label_at,
                )?;
                locals.extend(appended);
                (delta, Vec::new())
            }
            255 => {
                let delta = read_u16_class(data, &mut offset)? as u32;
                let local_count = read_u16_class(data, &mut offset)? as usize;
                locals = read_verification_types(data, &mut offset, local_count, pool, label_at)?;
                let stack_count = read_u16_class(data, &mut offset)? as usize;
                let stack =
                    read_verification_types(data, &mut offset, stack_count, pool, label_at)?;
                (delta, stack)
            }
            _ => {
                return Err(PatchError::malformed(format!(
                    "reserved stack map frame type {frame_type}"
                )));
            }
        };
        let position = match previous {
            None => delta,
            Some(previous) => previous + delta + 1,
        };
        previous = Some(position);
        frames.push((
            position,
            Frame {
                locals: expand(locals.clone()),
                stack: expand(stack),
            },
        ));
    }
    if offset != data.len() {
        return Err(PatchError::malformed("trailing bytes in StackMapTable"));
    }
    Ok(frames)
}

fn write_verification_type(
    out: &mut Vec<u8>,
    value: &VType,
    pool: &mut ConstantPool,
    label_offset: &dyn Fn(Label) -> Result<u32>,
) -> Result<()> {
    match value {
        VType::Top => out.push(0),
        VType::Integer => out.push(1),
        VType::Float => out.push(2),
        VType::Double => out.push(3),
        VType::Long => out.push(4),
        VType::Null => out.push(5),
        VType::UninitializedThis => out.push(6),
        VType::Object(name) => {
            out.push(7);
            out.extend_from_slice(&pool.intern_class(name)?.to_be_bytes());
        }
        VType::Uninitialized(site) => {
            out.push(8);
            let offset = u16::try_from(label_offset(*site)?)
                .map_err(|_| PatchError::serialization("uninitialized offset overflow"))?;
            out.extend_from_slice(&offset.to_be_bytes());
        }
    }
    Ok(())
}

fn write_verification_types(
    out: &mut Vec<u8>,
    values: &[VType],
    pool: &mut ConstantPool,
    label_offset: &dyn Fn(Label) -> Result<u32>,
) -> Result<()> {
    for value in values {
        write_verification_type(out, value, pool, label_offset)?;
    }
    Ok(())
}

/// Encode frames (sorted by offset) as StackMapTable attribute contents,
/// choosing the most compact frame kind for each entry.
pub(crate) fn write_stack_map_table(
    frames: &[(u32, Frame)],
    initial: &Frame,
    pool: &mut ConstantPool,
    label_offset: &dyn Fn(Label) -> Result<u32>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let count = u16::try_from(frames.len())
        .map_err(|_| PatchError::serialization("too many stack map frames"))?;
    out.extend_from_slice(&count.to_be_bytes());

    let mut previous_locals = compress(&initial.locals, true);
    let mut previous_offset: Option<u32> = None;
    for (offset, frame) in frames {
        let delta = match previous_offset {
            None => *offset,
            Some(previous) => offset
                .checked_sub(previous + 1)
                .ok_or_else(|| PatchError::serialization("stack map frames out of order"))?,
        };
        let delta16 = u16::try_from(delta)
            .map_err(|_| PatchError::serialization("stack map offset overflow"))?;
        previous_offset = Some(*offset);

        let locals = compress(&frame.locals, true);
        let stack = compress(&frame.stack, false);
        let same_locals = locals == previous_locals;
        if same_locals && stack.is_empty() {
            if delta < 64 {
                out.push(delta as u8);
            } else {
                out.push(251);
                out.extend_from_slice(&delta16.to_be_bytes());
            }
        } else if same_locals && stack.len() == 1 {
            if delta < 64 {
                out.push(64 + delta as u8);
            } else {
                out.push(247);
                out.extend_from_slice(&delta16.to_be_bytes());
            }
            write_verification_type(&mut out, &stack[0], pool, label_offset)?;
        } else if stack.is_empty()
            && locals.len() > previous_locals.len()
            && locals.len() - previous_locals.len() <= 3
            && locals.starts_with(&previous_locals)
        {
            let appended = &locals[previous_locals.len()..];
            out.push(251 + appended.len() as u8);
            out.extend_from_slice(&delta16.to_be_bytes());
            write_verification_types(&mut out, appended, pool, label_offset)?;
        } else if stack.is_empty()
            && locals.len() < previous_locals.len()
            && previous_locals.len() - locals.len() <= 3
            && previous_locals.starts_with(&locals)
        {
            out.push(251 - (previous_locals.len() - locals.len()) as u8);
            out.extend_from_slice(&delta16.to_be_bytes());
        } else {
            out.push(255);
            out.extend_from_slice(&delta16.to_be_bytes());
            out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
            write_verification_types(&mut out, &locals, pool, label_offset)?;
            out.extend_from_slice(&(stack.len() as u16).to_be_bytes());
            write_verification_types(&mut out, &stack, pool, label_offset)?;
        }
        previous_locals = locals;
    }
    Ok(out)
}
