use std::collections::BTreeSet;

use anyhow::Result;

use crate::descriptor::{self, MethodShape};
use crate::ir::{Insn, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, is_null_branch, next_real_after};

/// Detects `this.field = parameter;` where a null parameter later breaks
/// readers of the field.
pub(crate) struct NullToEmptyDefault {
    /// Field to watch; any field when `None`.
    pub(crate) field: Option<String>,
}

impl PatternMatcher for NullToEmptyDefault {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "NULL_TO_EMPTY_DEFAULT",
            name: "Null stored instead of empty value",
            description: "Parameter stored to a field without a null check",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        if body.is_static {
            return Ok(None);
        }
        let shape = MethodShape::parse(&body.descriptor)?;
        let mut parameters = Vec::with_capacity(shape.parameters.len());
        for (index, parameter) in shape.parameters.iter().enumerate() {
            if descriptor::is_reference(parameter) {
                parameters.push((shape.parameter_slot(index, false)?, parameter.clone()));
            }
        }

        let mut checked: BTreeSet<u16> = BTreeSet::new();
        for (index, insn) in body.insns.iter().enumerate() {
            let Insn::Var {
                opcode: opcodes::ALOAD,
                slot,
            } = insn
            else {
                continue;
            };
            let Some((next_at, next)) = next_real_after(body, index) else {
                continue;
            };
            if is_null_branch(next) {
                checked.insert(*slot);
                continue;
            }
            if *slot != 0 {
                continue;
            }
            let Some((parameter_slot, parameter_descriptor)) = (match next {
                Insn::Var {
                    opcode: opcodes::ALOAD,
                    slot: loaded,
                } => parameters.iter().find(|(slot, _)| slot == loaded),
                _ => None,
            }) else {
                continue;
            };
            if checked.contains(parameter_slot) {
                continue;
            }
            let Some((
                _,
                Insn::Field {
                    opcode: opcodes::PUTFIELD,
                    name,
                    descriptor: field_descriptor,
                    ..
                },
            )) = next_real_after(body, next_at)
            else {
                continue;
            };
            if self.field.as_ref().is_some_and(|field| field != name) {
                continue;
            }
            return Ok(Some(MatchSite::UnguardedFieldStore {
                slot: *parameter_slot,
                parameter_descriptor: parameter_descriptor.clone(),
                field_descriptor: field_descriptor.clone(),
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Label;

    const REFS: &str = "[Lcom/example/InvalidatablePersistentRef;";

    fn setter(prefix: Vec<Insn>) -> MethodBody {
        let mut insns = prefix;
        insns.extend([
            Insn::load(opcodes::ALOAD, 0),
            Insn::load(opcodes::ALOAD, 1),
            Insn::Field {
                opcode: opcodes::PUTFIELD,
                owner: "com/example/SpawnMarkerEntity".to_string(),
                name: "npcReferences".to_string(),
                descriptor: REFS.to_string(),
            },
            Insn::Simple(opcodes::RETURN),
        ]);
        MethodBody::for_test("setNpcReferences", &format!("({REFS})V"), false, insns)
    }

    #[test]
    fn direct_store_of_parameter_is_found() {
        let matcher = NullToEmptyDefault {
            field: Some("npcReferences".to_string()),
        };

        assert_eq!(
            Some(MatchSite::UnguardedFieldStore {
                slot: 1,
                parameter_descriptor: REFS.to_string(),
                field_descriptor: REFS.to_string(),
            }),
            matcher.scan(&setter(Vec::new())).expect("scan")
        );
    }

    #[test]
    fn checked_parameter_is_not_found() {
        let skip = Label(0);
        let body = setter(vec![
            Insn::load(opcodes::ALOAD, 1),
            Insn::Jump {
                opcode: opcodes::IFNONNULL,
                target: skip,
            },
            Insn::Simple(opcodes::RETURN),
            Insn::Label(skip),
        ]);

        assert_eq!(None, NullToEmptyDefault { field: None }.scan(&body).expect("scan"));
    }

    #[test]
    fn other_fields_are_ignored() {
        let matcher = NullToEmptyDefault {
            field: Some("owner".to_string()),
        };

        assert_eq!(None, matcher.scan(&setter(Vec::new())).expect("scan"));
    }
}
