use anyhow::Result;

use crate::error::PatchError;
use crate::ir::{Insn, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, is_null_branch};

/// Where a field may still be null although readers expect a value.
#[derive(Clone, Debug)]
pub(crate) enum FieldAnchor {
    /// Every `return` of a constructor that never assigns the field, e.g. an
    /// entity created by a codec that skipped the field.
    ConstructorExit,
    /// Right after each call to `method` in a method that only assigns the
    /// field when `guard_field` is non-null.
    AfterCall { method: String, guard_field: String },
}

/// Detects an instance field of `this` that can be left null on the way out
/// of a method.
pub(crate) struct UnsetField {
    pub(crate) field: String,
    pub(crate) descriptor: String,
    pub(crate) anchor: FieldAnchor,
}

impl PatternMatcher for UnsetField {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "UNSET_FIELD",
            name: "Field left unset",
            description: "Field readers expect to be non-null can be left null",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        if body.is_static {
            return Ok(None);
        }
        let insert_at: Vec<usize> = match &self.anchor {
            FieldAnchor::ConstructorExit => {
                if body.method_name != "<init>" {
                    return Err(PatchError::structural(format!(
                        "{}{} is not a constructor",
                        body.method_name, body.descriptor
                    )));
                }
                if body.insns.iter().any(|insn| self.is_store(insn)) {
                    return Ok(None);
                }
                body.insns
                    .iter()
                    .enumerate()
                    .filter(|(_, insn)| **insn == Insn::Simple(opcodes::RETURN))
                    .map(|(index, _)| index)
                    .collect()
            }
            FieldAnchor::AfterCall {
                method,
                guard_field,
            } => {
                if !checks_own_field(body, guard_field) {
                    return Ok(None);
                }
                body.insns
                    .iter()
                    .enumerate()
                    .filter(|(_, insn)| matches!(insn, Insn::Invoke { name, .. } if name == method))
                    .map(|(index, _)| index + 1)
                    .filter(|at| !self.defaulted_at(body, *at))
                    .collect()
            }
        };
        if insert_at.is_empty() {
            return Ok(None);
        }
        Ok(Some(MatchSite::UnsetField {
            insert_at,
            name: self.field.clone(),
            descriptor: self.descriptor.clone(),
        }))
    }
}

impl UnsetField {
    fn is_store(&self, insn: &Insn) -> bool {
        matches!(
            insn,
            Insn::Field { opcode: opcodes::PUTFIELD, name, .. } if *name == self.field
        )
    }

    /// Whether `at` already starts with `if (this.field == null)`.
    fn defaulted_at(&self, body: &MethodBody, at: usize) -> bool {
        let mut reals = body.insns[at..].iter().filter(|insn| insn.is_real());
        matches!(
            (reals.next(), reals.next(), reals.next()),
            (
                Some(Insn::Var { opcode: opcodes::ALOAD, slot: 0 }),
                Some(Insn::Field { opcode: opcodes::GETFIELD, name, .. }),
                Some(Insn::Jump { opcode: opcodes::IFNONNULL, .. }),
            ) if *name == self.field
        )
    }
}

/// Whether the body contains `aload_0; getfield field; ifnull/ifnonnull`.
fn checks_own_field(body: &MethodBody, field: &str) -> bool {
    let reals: Vec<&Insn> = body.insns.iter().filter(|insn| insn.is_real()).collect();
    reals.windows(3).any(|window| {
        matches!(
            window,
            [
                Insn::Var { opcode: opcodes::ALOAD, slot: 0 },
                Insn::Field { opcode: opcodes::GETFIELD, name, .. },
                branch,
            ] if name == field && is_null_branch(branch)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Label;

    const MARKER: &str = "com/example/SpawnMarker";
    const REFS: &str = "[Lcom/example/Ref;";

    fn field(opcode: u8, name: &str, descriptor: &str) -> Insn {
        Insn::Field {
            opcode,
            owner: MARKER.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    fn constructor_default() -> UnsetField {
        UnsetField {
            field: "npcReferences".to_string(),
            descriptor: REFS.to_string(),
            anchor: FieldAnchor::ConstructorExit,
        }
    }

    fn spawn_default() -> UnsetField {
        UnsetField {
            field: "npcReferences".to_string(),
            descriptor: REFS.to_string(),
            anchor: FieldAnchor::AfterCall {
                method: "refreshTimeout".to_string(),
                guard_field: "storedFlock".to_string(),
            },
        }
    }

    fn spawn_body() -> MethodBody {
        let skip = Label(0);
        MethodBody::for_test(
            "spawnNPC",
            "()Z",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 0),
                field(opcodes::GETFIELD, "storedFlock", "Lcom/example/Flock;"),
                Insn::Jump {
                    opcode: opcodes::IFNULL,
                    target: skip,
                },
                Insn::load(opcodes::ALOAD, 0),
                Insn::Simple(opcodes::ICONST_1),
                Insn::Type {
                    opcode: opcodes::ANEWARRAY,
                    class: "com/example/Ref".to_string(),
                },
                field(opcodes::PUTFIELD, "npcReferences", REFS),
                Insn::Label(skip),
                Insn::load(opcodes::ALOAD, 0),
                Insn::invoke_virtual(MARKER, "refreshTimeout", "()V"),
                Insn::Simple(opcodes::ICONST_1),
                Insn::Simple(opcodes::IRETURN),
            ],
        )
    }

    #[test]
    fn constructor_returns_are_found() {
        let body = MethodBody::for_test(
            "<init>",
            "()V",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 0),
                Insn::invoke_special("java/lang/Object", "<init>", "()V"),
                Insn::Simple(opcodes::RETURN),
            ],
        );

        assert_eq!(
            Some(MatchSite::UnsetField {
                insert_at: vec![2],
                name: "npcReferences".to_string(),
                descriptor: REFS.to_string(),
            }),
            constructor_default().scan(&body).expect("scan")
        );
    }

    #[test]
    fn constructor_assigning_the_field_is_not_found() {
        let body = MethodBody::for_test(
            "<init>",
            "()V",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 0),
                Insn::invoke_special("java/lang/Object", "<init>", "()V"),
                Insn::load(opcodes::ALOAD, 0),
                Insn::Simple(opcodes::ACONST_NULL),
                field(opcodes::PUTFIELD, "npcReferences", REFS),
                Insn::Simple(opcodes::RETURN),
            ],
        );

        assert_eq!(None, constructor_default().scan(&body).expect("scan"));
    }

    #[test]
    fn point_after_the_timeout_refresh_is_found() {
        let site = spawn_default().scan(&spawn_body()).expect("scan");

        assert_eq!(
            Some(MatchSite::UnsetField {
                insert_at: vec![10],
                name: "npcReferences".to_string(),
                descriptor: REFS.to_string(),
            }),
            site
        );
    }

    #[test]
    fn spawn_without_the_flock_check_is_not_found() {
        let mut body = spawn_body();
        body.insns.drain(0..3);

        assert_eq!(None, spawn_default().scan(&body).expect("scan"));
    }

    #[test]
    fn defaulted_spawn_is_not_found() {
        let mut body = spawn_body();
        let skip = Label(1);
        body.splice(
            10,
            vec![
                Insn::load(opcodes::ALOAD, 0),
                field(opcodes::GETFIELD, "npcReferences", REFS),
                Insn::Jump {
                    opcode: opcodes::IFNONNULL,
                    target: skip,
                },
                Insn::load(opcodes::ALOAD, 0),
                Insn::Simple(opcodes::ICONST_0),
                Insn::Type {
                    opcode: opcodes::ANEWARRAY,
                    class: "com/example/Ref".to_string(),
                },
                field(opcodes::PUTFIELD, "npcReferences", REFS),
                Insn::Label(skip),
            ],
        );

        assert_eq!(None, spawn_default().scan(&body).expect("scan"));
    }
}
