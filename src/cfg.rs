use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;

use crate::descriptor;
use crate::error::PatchError;
use crate::frames;
use crate::ir::{Insn, Label, MethodBody};
use crate::opcodes;

/// Basic block graph over a method body.
#[derive(Clone, Debug)]
pub(crate) struct ControlFlowGraph {
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) edges: Vec<FlowEdge>,
}

/// Basic block covering a range of instruction indices.
#[derive(Clone, Debug)]
pub(crate) struct BasicBlock {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

/// Edge between basic blocks, identified by block index.
#[derive(Clone, Debug)]
pub(crate) struct FlowEdge {
    pub(crate) from: usize,
    pub(crate) to: usize,
    pub(crate) kind: EdgeKind,
}

/// Edge classification used for CFG inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum EdgeKind {
    FallThrough,
    Branch,
    Exception,
}

impl ControlFlowGraph {
    fn block_at(&self, index: usize) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| block.start <= index && index < block.end)
    }

    fn successors(&self, block: usize) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter().filter(move |edge| edge.from == block)
    }
}

/// Build a control flow graph from the instruction stream.
pub(crate) fn build_cfg(body: &MethodBody) -> Result<ControlFlowGraph> {
    let insns = &body.insns;
    let label_index = label_positions(body);
    let position_of = |label: Label| -> Result<usize> {
        label_index.get(&label).copied().ok_or_else(|| {
            PatchError::structural(format!("label {label:?} is not placed in the method"))
        })
    };

    let mut leaders = BTreeSet::new();
    leaders.insert(0usize);
    for (index, insn) in insns.iter().enumerate() {
        for target in insn.targets() {
            leaders.insert(position_of(target)?);
        }
        if !insn.targets().is_empty() || insn.is_unconditional() {
            leaders.insert(index + 1);
        }
    }
    for try_catch in &body.try_catches {
        leaders.insert(position_of(try_catch.start)?);
        leaders.insert(position_of(try_catch.end)?);
        leaders.insert(position_of(try_catch.handler)?);
    }

    let leader_list: Vec<usize> = leaders
        .into_iter()
        .filter(|index| *index < insns.len())
        .collect();
    let mut blocks = Vec::new();
    for (position, start) in leader_list.iter().enumerate() {
        let end = leader_list.get(position + 1).copied().unwrap_or(insns.len());
        blocks.push(BasicBlock { start: *start, end });
    }

    let mut graph = ControlFlowGraph {
        blocks,
        edges: Vec::new(),
    };
    let mut edges = Vec::new();
    for (block_index, block) in graph.blocks.iter().enumerate() {
        let last_real = (block.start..block.end)
            .rev()
            .find(|index| insns[*index].is_real());
        let mut falls_through = true;
        if let Some(last) = last_real {
            let insn = &insns[last];
            for target in insn.targets() {
                if let Some(to) = graph.block_at(position_of(target)?) {
                    edges.push(FlowEdge {
                        from: block_index,
                        to,
                        kind: EdgeKind::Branch,
                    });
                }
            }
            falls_through = !insn.is_unconditional();
        }
        if falls_through && block.end < insns.len() {
            edges.push(FlowEdge {
                from: block_index,
                to: block_index + 1,
                kind: EdgeKind::FallThrough,
            });
        }
    }
    for try_catch in &body.try_catches {
        let start = position_of(try_catch.start)?;
        let end = position_of(try_catch.end)?;
        let Some(handler) = graph.block_at(position_of(try_catch.handler)?) else {
            continue;
        };
        for (block_index, block) in graph.blocks.iter().enumerate() {
            let covered = block.start >= start && block.end <= end;
            let has_code = (block.start..block.end).any(|index| insns[index].is_real());
            if covered && has_code {
                edges.push(FlowEdge {
                    from: block_index,
                    to: handler,
                    kind: EdgeKind::Exception,
                });
            }
        }
    }
    graph.edges = edges;
    Ok(graph)
}

fn label_positions(body: &MethodBody) -> BTreeMap<Label, usize> {
    body.insns
        .iter()
        .enumerate()
        .filter_map(|(index, insn)| match insn {
            Insn::Label(label) => Some((*label, index)),
            _ => None,
        })
        .collect()
}

/// Operand stack slots consumed and produced by one instruction.
pub(crate) fn stack_effect(insn: &Insn) -> Result<(usize, usize)> {
    let effect = match insn {
        Insn::Label(_) | Insn::Iinc { .. } => (0, 0),
        Insn::Simple(opcode) => simple_stack_effect(*opcode)?,
        Insn::Int { opcode, .. } => match *opcode {
            opcodes::NEWARRAY => (1, 1),
            _ => (0, 1),
        },
        Insn::Var { opcode, .. } => match *opcode {
            opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD => (0, 1),
            opcodes::LLOAD | opcodes::DLOAD => (0, 2),
            opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE => (1, 0),
            opcodes::LSTORE | opcodes::DSTORE => (2, 0),
            other => {
                return Err(PatchError::structural(format!(
                    "unsupported local variable opcode 0x{other:02x}"
                )));
            }
        },
        Insn::Ldc(constant) => (0, if constant.is_wide() { 2 } else { 1 }),
        Insn::Type { .. } => (1, 1),
        Insn::New { .. } => (0, 1),
        Insn::Field {
            opcode, descriptor, ..
        } => {
            let size = descriptor::value_kind(descriptor)?.slots();
            match *opcode {
                opcodes::GETSTATIC => (0, size),
                opcodes::PUTSTATIC => (size, 0),
                opcodes::GETFIELD => (1, size),
                _ => (size + 1, 0),
            }
        }
        Insn::Invoke {
            opcode, descriptor, ..
        } => {
            let (arguments, produced) = descriptor::invoke_stack_effect(descriptor)?;
            let receiver = usize::from(*opcode != opcodes::INVOKESTATIC);
            (arguments + receiver, produced)
        }
        Insn::InvokeDynamic { descriptor, .. } => descriptor::invoke_stack_effect(descriptor)?,
        Insn::Jump { opcode, .. } => match *opcode {
            opcodes::GOTO => (0, 0),
            opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => (2, 0),
            _ => (1, 0),
        },
        Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => (1, 0),
        Insn::MultiANewArray { dims, .. } => (*dims as usize, 1),
    };
    Ok(effect)
}

fn simple_stack_effect(opcode: u8) -> Result<(usize, usize)> {
    if let Some((pops, result)) = frames::simple_result(opcode) {
        let pushes = match result {
            Some(frames::VType::Long | frames::VType::Double) => 2,
            Some(_) => 1,
            None => 0,
        };
        return Ok((pops, pushes));
    }
    let effect = match opcode {
        opcodes::AALOAD => (2, 1),
        opcodes::DUP => (1, 2),
        opcodes::DUP_X1 => (2, 3),
        opcodes::DUP_X2 => (3, 4),
        opcodes::DUP2 => (2, 4),
        opcodes::DUP2_X1 => (3, 5),
        opcodes::DUP2_X2 => (4, 6),
        opcodes::SWAP => (2, 2),
        other => {
            return Err(PatchError::structural(format!(
                "unsupported opcode 0x{other:02x}"
            )));
        }
    };
    Ok(effect)
}

/// Operand stack depth at every reachable label.
///
/// Fails when a path underflows, falls off the end of the method, or two
/// paths reach the same block with different depths.
pub(crate) fn label_depths(body: &MethodBody) -> Result<BTreeMap<Label, usize>> {
    let graph = build_cfg(body)?;
    let insns = &body.insns;
    let mut entry_depth: Vec<Option<usize>> = vec![None; graph.blocks.len()];
    let mut depths = BTreeMap::new();
    let mut queue = VecDeque::new();
    if graph.blocks.is_empty() {
        return Err(PatchError::structural("method body is empty"));
    }
    entry_depth[0] = Some(0);
    queue.push_back(0usize);

    while let Some(block_index) = queue.pop_front() {
        let block = &graph.blocks[block_index];
        let Some(mut depth) = entry_depth[block_index] else {
            continue;
        };
        let mut last_real = None;
        for index in block.start..block.end {
            let insn = &insns[index];
            if let Insn::Label(label) = insn {
                depths.insert(*label, depth);
                continue;
            }
            let (pops, pushes) = stack_effect(insn)?;
            depth = depth.checked_sub(pops).ok_or_else(|| {
                PatchError::structural(format!(
                    "operand stack underflow at instruction {index} of {}{}",
                    body.method_name, body.descriptor
                ))
            })?;
            depth += pushes;
            last_real = Some(insn);
        }
        let falls_through = last_real.is_none_or(|insn| !insn.is_unconditional());
        if falls_through && block.end >= insns.len() {
            return Err(PatchError::structural(format!(
                "execution falls off the end of {}{}",
                body.method_name, body.descriptor
            )));
        }

        for edge in graph.successors(block_index) {
            let incoming = match edge.kind {
                EdgeKind::Exception => 1,
                EdgeKind::FallThrough | EdgeKind::Branch => depth,
            };
            match entry_depth[edge.to] {
                None => {
                    entry_depth[edge.to] = Some(incoming);
                    queue.push_back(edge.to);
                }
                Some(existing) if existing != incoming => {
                    return Err(PatchError::structural(format!(
                        "inconsistent stack depth at merge: {existing} vs {incoming}"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(depths)
}

/// Check that a rewrite kept the entry depth of every label that was reachable before it.
pub(crate) fn check_balance(before: &BTreeMap<Label, usize>, after: &MethodBody) -> Result<()> {
    let after_depths = label_depths(after)?;
    for (label, depth) in before {
        match after_depths.get(label) {
            Some(found) if found == depth => {}
            Some(found) => {
                return Err(PatchError::structural(format!(
                    "label {label:?} changed stack depth from {depth} to {found}"
                )));
            }
            None if after.label_position(*label).is_some() => {
                return Err(PatchError::structural(format!(
                    "label {label:?} is no longer reachable"
                )));
            }
            None => {}
        }
    }
    Ok(())
}
