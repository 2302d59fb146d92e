use anyhow::Result;

use crate::ir::{Insn, Label, MethodBody};
use crate::opcodes;

pub(crate) mod call_site;
pub(crate) mod negative_index;
pub(crate) mod null_default;
pub(crate) mod null_guard;
pub(crate) mod race_throw;
pub(crate) mod tuning_constant;
pub(crate) mod unguarded_body;
pub(crate) mod unset_field;
pub(crate) mod unwanted_call;

/// Metadata describing a defect signature.
#[derive(Clone, Debug)]
pub(crate) struct PatternMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
}

/// Location of a defect inside one method body, as found by a matcher.
///
/// Positions are indices into `MethodBody::insns` at the time of the scan.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum MatchSite {
    /// A value that may be null at `insert_at` and gets dereferenced later.
    NullableValue { slot: u16, insert_at: usize },
    /// A `return` that drops data when an adjusted index is negative.
    NegativeIndexDrop {
        slot: u16,
        return_at: usize,
        resume: Label,
    },
    /// `new E ... athrow` guarded, optionally, by a re-evaluable probe.
    ThrowSite {
        new_at: usize,
        athrow_at: usize,
        probe: Option<Probe>,
    },
    /// A parameter stored straight into a field without a null check.
    UnguardedFieldStore {
        slot: u16,
        parameter_descriptor: String,
        field_descriptor: String,
    },
    /// Instructions `start..end` not yet covered by a handler of the expected
    /// exception. The stack is empty at `end`, which is where execution
    /// continues after the handler. With `spill_receiver` the stack holds
    /// exactly the receiver of the region's first call at `start`, otherwise
    /// it is empty there too.
    GuardedRegion {
        start: usize,
        end: usize,
        spill_receiver: bool,
    },
    /// A constant load to substitute.
    Constant { at: usize },
    /// A void call at `end - 1` together with the straight-line expression
    /// `start..end - 1` building its arguments. No label in the range is
    /// referenced from outside.
    RemovableCall { start: usize, end: usize },
    /// Positions where `this.name` may still be null, in ascending order.
    UnsetField {
        insert_at: Vec<usize>,
        name: String,
        descriptor: String,
    },
}

/// Condition re-evaluated by a retry loop: `aload n`, zero-argument getters
/// and field reads, then a null branch at `branch_at`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Probe {
    pub(crate) start: usize,
    pub(crate) branch_at: usize,
}

/// Single forward pass looking for one defect signature.
///
/// A matcher must report its own patched shape as not found, so running a
/// catalog twice leaves the second run without effect.
pub(crate) trait PatternMatcher: Send + Sync {
    fn metadata(&self) -> PatternMetadata;
    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>>;
}

pub(crate) fn is_null_branch(insn: &Insn) -> bool {
    matches!(
        insn,
        Insn::Jump {
            opcode: opcodes::IFNULL | opcodes::IFNONNULL,
            ..
        }
    )
}

/// Next real instruction after `index`, with its position.
pub(crate) fn next_real_after(body: &MethodBody, index: usize) -> Option<(usize, &Insn)> {
    body.next_real(index + 1)
        .map(|position| (position, &body.insns[position]))
}

/// Instruction ending straight-line flow: branches, switches, returns and throws.
pub(crate) fn ends_straight_line(insn: &Insn) -> bool {
    insn.is_unconditional() || !insn.targets().is_empty()
}

/// Whether instruction `index` lies inside a handler range catching `exception`.
pub(crate) fn is_covered(body: &MethodBody, index: usize, exception: &str) -> bool {
    body.try_catches.iter().any(|try_catch| {
        if try_catch.catch_type.as_deref() != Some(exception) {
            return false;
        }
        match (
            body.label_position(try_catch.start),
            body.label_position(try_catch.end),
        ) {
            (Some(start), Some(end)) => start < index && index < end,
            _ => false,
        }
    })
}
