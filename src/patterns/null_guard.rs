use anyhow::Result;

use crate::descriptor::{self, MethodShape};
use crate::error::PatchError;
use crate::ir::{Constant, Insn, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, is_null_branch, next_real_after};

/// Where the possibly-null value comes from.
#[derive(Clone, Debug)]
pub(crate) enum NullableSource {
    /// Parameter by declaration index, `this` not counted.
    Parameter(usize),
    /// Local stored from the result of a call, e.g. a component lookup.
    /// Any owner matches when `owner` is `None`.
    CallResult { owner: Option<String>, name: String },
    /// Local stored from an instance field read.
    FieldValue { name: String },
}

/// Detects a nullable value dereferenced without a preceding null check.
pub(crate) struct MissingNullGuard {
    pub(crate) source: NullableSource,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Loaded { pushes: usize },
}

impl PatternMatcher for MissingNullGuard {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "MISSING_NULL_GUARD",
            name: "Missing null guard",
            description: "Nullable value dereferenced before any null check",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        let Some((slot, insert_at)) = self.locate_value(body)? else {
            return Ok(None);
        };

        let mut state = State::Idle;
        for insn in &body.insns[insert_at..] {
            state = match (state, insn) {
                (_, Insn::Label(_)) => state,
                (
                    _,
                    Insn::Var {
                        opcode: opcodes::ALOAD,
                        slot: loaded,
                    },
                ) if *loaded == slot => State::Loaded { pushes: 0 },
                (_, Insn::Var {
                    opcode: opcodes::ASTORE,
                    slot: stored,
                }) if *stored == slot => return Ok(None),
                (State::Loaded { pushes: 0 }, branch) if is_null_branch(branch) => {
                    return Ok(None);
                }
                (State::Loaded { pushes }, insn) if dereferences(insn, pushes)? => {
                    return Ok(Some(MatchSite::NullableValue { slot, insert_at }));
                }
                (State::Loaded { pushes: 0 }, insn) if is_harmless_push(insn) => {
                    State::Loaded { pushes: 1 }
                }
                _ => State::Idle,
            };
        }
        Ok(None)
    }
}

impl MissingNullGuard {
    /// Slot holding the value and the position right after it becomes available.
    fn locate_value(&self, body: &MethodBody) -> Result<Option<(u16, usize)>> {
        match &self.source {
            NullableSource::Parameter(index) => {
                if body.method_name == "<init>" {
                    return Err(PatchError::structural(
                        "cannot return from a constructor before super()",
                    ));
                }
                let shape = MethodShape::parse(&body.descriptor)?;
                let parameter = shape.parameters.get(*index).ok_or_else(|| {
                    PatchError::structural(format!(
                        "{}{} has no parameter {index}",
                        body.method_name, body.descriptor
                    ))
                })?;
                if !descriptor::is_reference(parameter) {
                    return Err(PatchError::structural(format!(
                        "parameter {index} of {}{} is not a reference",
                        body.method_name, body.descriptor
                    )));
                }
                Ok(Some((shape.parameter_slot(*index, body.is_static)?, 0)))
            }
            NullableSource::CallResult { owner, name } => Ok(stored_result(body, |insn| {
                matches!(
                    insn,
                    Insn::Invoke { owner: called_owner, name: called_name, .. }
                        if called_name == name
                            && owner.as_ref().is_none_or(|owner| owner == called_owner)
                )
            })),
            NullableSource::FieldValue { name } => Ok(stored_result(body, |insn| {
                matches!(
                    insn,
                    Insn::Field { opcode: opcodes::GETFIELD, name: read, .. } if read == name
                )
            })),
        }
    }
}

/// First `astore` of a value produced by an instruction accepted by
/// `produces`, allowing one `checkcast` in between.
fn stored_result(body: &MethodBody, produces: impl Fn(&Insn) -> bool) -> Option<(u16, usize)> {
    for (index, insn) in body.insns.iter().enumerate() {
        if !produces(insn) {
            continue;
        }
        let Some((mut position, mut next)) = next_real_after(body, index) else {
            continue;
        };
        if let Insn::Type {
            opcode: opcodes::CHECKCAST,
            ..
        } = next
        {
            let Some(found) = next_real_after(body, position) else {
                continue;
            };
            (position, next) = found;
        }
        if let Insn::Var {
            opcode: opcodes::ASTORE,
            slot,
        } = next
        {
            return Some((*slot, position + 1));
        }
    }
    None
}

/// Instance access consuming the loaded value plus `pushes` stack slots.
fn dereferences(insn: &Insn, pushes: usize) -> Result<bool> {
    let found = match insn {
        Insn::Invoke {
            opcode: opcodes::INVOKEVIRTUAL | opcodes::INVOKEINTERFACE,
            descriptor,
            ..
        } => descriptor::invoke_stack_effect(descriptor)?.0 == pushes,
        Insn::Field {
            opcode: opcodes::GETFIELD,
            ..
        } => pushes == 0,
        Insn::Simple(opcodes::ARRAYLENGTH | opcodes::MONITORENTER) => pushes == 0,
        _ => false,
    };
    Ok(found)
}

/// Single-slot push with no side effect.
fn is_harmless_push(insn: &Insn) -> bool {
    match insn {
        Insn::Simple(opcode) => matches!(
            *opcode,
            opcodes::ACONST_NULL..=opcodes::ICONST_5 | opcodes::FCONST_0..=opcodes::FCONST_2
        ),
        Insn::Int { opcode, .. } => matches!(*opcode, opcodes::BIPUSH | opcodes::SIPUSH),
        Insn::Ldc(constant) => !constant.is_wide() && !matches!(constant, Constant::Dynamic { .. }),
        Insn::Var { opcode, .. } => {
            matches!(*opcode, opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD)
        }
        _ => false,
    }
}
