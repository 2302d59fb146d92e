use std::collections::{BTreeMap, BTreeSet};

use crate::frames::Frame;
use crate::opcodes;

/// Symbolic position inside a method body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Label(pub(crate) u32);

/// Loadable constant referenced by `ldc`, `ldc_w` or `ldc2_w`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Constant {
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    String(String),
    Class(String),
    MethodHandle(u16),
    MethodType(u16),
    /// Dynamically computed constant, kept by pool index with its field descriptor.
    Dynamic { index: u16, descriptor: String },
}

impl Constant {
    pub(crate) fn is_wide(&self) -> bool {
        match self {
            Constant::Long(_) | Constant::Double(_) => true,
            Constant::Dynamic { descriptor, .. } => descriptor == "J" || descriptor == "D",
            _ => false,
        }
    }
}

/// One operation of a method body. Branch targets are labels, never offsets.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Insn {
    Label(Label),
    /// Opcode without operands: arithmetic, array access, stack shuffles, returns,
    /// `athrow`, monitors.
    Simple(u8),
    /// `bipush`, `sipush` and `newarray`.
    Int { opcode: u8, operand: i32 },
    /// Local load or store; short forms such as `aload_0` are normalized to this.
    Var { opcode: u8, slot: u16 },
    Iinc { slot: u16, delta: i16 },
    Ldc(Constant),
    /// `anewarray`, `checkcast` and `instanceof`.
    Type { opcode: u8, class: String },
    /// `new`; `site` labels the instruction itself for uninitialized frame types.
    New { class: String, site: Label },
    Field {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
    },
    Invoke {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
        interface: bool,
    },
    InvokeDynamic {
        cp_index: u16,
        name: String,
        descriptor: String,
        bootstrap_strings: Vec<String>,
    },
    Jump { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
    MultiANewArray { class: String, dims: u8 },
}

impl Insn {
    /// Whether this is a real instruction rather than a label.
    pub(crate) fn is_real(&self) -> bool {
        !matches!(self, Insn::Label(_))
    }

    /// Control never continues to the next instruction.
    pub(crate) fn is_unconditional(&self) -> bool {
        match self {
            Insn::Simple(opcode) => opcodes::is_exit(*opcode),
            Insn::Jump { opcode, .. } => *opcode == opcodes::GOTO,
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => true,
            _ => false,
        }
    }

    /// Explicit branch targets of a jump or switch.
    pub(crate) fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump { target, .. } => vec![*target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, label)| *label))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn load(opcode: u8, slot: u16) -> Self {
        Insn::Var { opcode, slot }
    }

    pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Invoke {
            opcode: opcodes::INVOKESTATIC,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            interface: false,
        }
    }

    pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Invoke {
            opcode: opcodes::INVOKEVIRTUAL,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            interface: false,
        }
    }

    pub(crate) fn invoke_special(owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Invoke {
            opcode: opcodes::INVOKESPECIAL,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            interface: false,
        }
    }

    pub(crate) fn get_static(owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Field {
            opcode: opcodes::GETSTATIC,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    /// Shortest push of an int constant.
    pub(crate) fn push_int(value: i32) -> Self {
        match value {
            -1..=5 => Insn::Simple((opcodes::ICONST_0 as i32 + value) as u8),
            -128..=127 => Insn::Int {
                opcode: opcodes::BIPUSH,
                operand: value,
            },
            -32768..=32767 => Insn::Int {
                opcode: opcodes::SIPUSH,
                operand: value,
            },
            _ => Insn::Ldc(Constant::Int(value)),
        }
    }

    /// Shortest push of a long constant.
    pub(crate) fn push_long(value: i64) -> Self {
        match value {
            0 => Insn::Simple(opcodes::LCONST_0),
            1 => Insn::Simple(opcodes::LCONST_1),
            _ => Insn::Ldc(Constant::Long(value)),
        }
    }
}

/// Exception handler range expressed with labels.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TryCatch {
    pub(crate) start: Label,
    pub(crate) end: Label,
    pub(crate) handler: Label,
    /// Internal class name, `None` for catch-all (`finally`).
    pub(crate) catch_type: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LocalVariableTable {
    Types,
    Signatures,
}

/// Entry of LocalVariableTable or LocalVariableTypeTable. Names and
/// descriptors stay as pool indices since the pool is append-only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LocalVariable {
    pub(crate) table: LocalVariableTable,
    pub(crate) start: Label,
    pub(crate) end: Label,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) slot: u16,
}

/// Decoded instruction stream of one method plus label-based side tables.
#[derive(Clone, Debug)]
pub(crate) struct MethodBody {
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) insns: Vec<Insn>,
    pub(crate) try_catches: Vec<TryCatch>,
    pub(crate) line_numbers: Vec<(Label, u16)>,
    pub(crate) local_variables: Vec<LocalVariable>,
    /// StackMapTable frames as declared by the compiler, keyed by position.
    pub(crate) declared_frames: BTreeMap<Label, Frame>,
    pub(crate) max_locals: u16,
    pub(crate) max_stack: u16,
    pub(crate) next_label: u32,
}

impl MethodBody {
    pub(crate) fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Reserve `size` fresh local slots above every slot in use.
    pub(crate) fn fresh_local(&mut self, size: u16) -> u16 {
        let mut next = self.max_locals;
        for insn in &self.insns {
            let used = match insn {
                Insn::Var { opcode, slot } => {
                    let wide = matches!(
                        *opcode,
                        opcodes::LLOAD | opcodes::DLOAD | opcodes::LSTORE | opcodes::DSTORE
                    );
                    slot.saturating_add(if wide { 2 } else { 1 })
                }
                Insn::Iinc { slot, .. } => slot.saturating_add(1),
                _ => 0,
            };
            next = next.max(used);
        }
        self.max_locals = next.saturating_add(size);
        next
    }

    /// Index of the instruction slot holding `label`.
    pub(crate) fn label_position(&self, label: Label) -> Option<usize> {
        self.insns
            .iter()
            .position(|insn| *insn == Insn::Label(label))
    }

    /// Index of the next real instruction at or after `index`.
    pub(crate) fn next_real(&self, index: usize) -> Option<usize> {
        (index..self.insns.len()).find(|position| self.insns[*position].is_real())
    }

    /// Insert a sequence at `index`, shifting later instructions.
    pub(crate) fn splice(&mut self, index: usize, fragment: Vec<Insn>) {
        self.insns.splice(index..index, fragment);
    }

    /// Replace the instruction at `index` with a sequence.
    pub(crate) fn replace(&mut self, index: usize, fragment: Vec<Insn>) {
        self.insns.splice(index..=index, fragment);
    }

    /// Labels that some branch, switch or exception handler refers to.
    pub(crate) fn referenced_labels(&self) -> BTreeSet<Label> {
        let mut labels: BTreeSet<Label> = self.insns.iter().flat_map(Insn::targets).collect();
        for try_catch in &self.try_catches {
            labels.insert(try_catch.handler);
        }
        labels
    }
}

#[cfg(test)]
impl MethodBody {
    /// Body with the given stream; `next_label` starts above any label in use.
    pub(crate) fn for_test(
        method_name: &str,
        descriptor: &str,
        is_static: bool,
        insns: Vec<Insn>,
    ) -> Self {
        let next_label = insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Label(Label(id)) => Some(id + 1),
                _ => None,
            })
            .chain(insns.iter().flat_map(Insn::targets).map(|Label(id)| id + 1))
            .max()
            .unwrap_or(0);
        let parameter_slots = crate::descriptor::MethodShape::parse(descriptor)
            .and_then(|shape| shape.parameter_slots())
            .expect("test descriptor");
        MethodBody {
            class_name: "com/example/Sample".to_string(),
            method_name: method_name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            insns,
            try_catches: Vec::new(),
            line_numbers: Vec::new(),
            local_variables: Vec::new(),
            declared_frames: BTreeMap::new(),
            max_locals: (parameter_slots + usize::from(!is_static)) as u16,
            max_stack: 0,
            next_label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(insns: Vec<Insn>) -> MethodBody {
        MethodBody {
            class_name: "Sample".to_string(),
            method_name: "run".to_string(),
            descriptor: "()V".to_string(),
            is_static: true,
            insns,
            try_catches: Vec::new(),
            line_numbers: Vec::new(),
            local_variables: Vec::new(),
            declared_frames: BTreeMap::new(),
            max_locals: 1,
            max_stack: 0,
            next_label: 0,
        }
    }

    #[test]
    fn fresh_local_skips_wide_slots_in_use() {
        let mut body = body(vec![
            Insn::Var {
                opcode: opcodes::LSTORE,
                slot: 3,
            },
            Insn::Simple(opcodes::RETURN),
        ]);

        assert_eq!(5, body.fresh_local(1));
        assert_eq!(6, body.max_locals);
        assert_eq!(6, body.fresh_local(2));
        assert_eq!(8, body.max_locals);
    }

    #[test]
    fn push_int_picks_shortest_form() {
        assert_eq!(Insn::Simple(opcodes::ICONST_M1), Insn::push_int(-1));
        assert_eq!(Insn::Simple(opcodes::ICONST_5), Insn::push_int(5));
        assert_eq!(
            Insn::Int {
                opcode: opcodes::BIPUSH,
                operand: 100
            },
            Insn::push_int(100)
        );
        assert_eq!(Insn::Ldc(Constant::Int(70000)), Insn::push_int(70000));
    }

    #[test]
    fn switches_report_every_target() {
        let insn = Insn::LookupSwitch {
            default: Label(0),
            pairs: vec![(1, Label(1)), (5, Label(2))],
        };

        assert_eq!(vec![Label(0), Label(1), Label(2)], insn.targets());
        assert!(insn.is_unconditional());
    }
}
