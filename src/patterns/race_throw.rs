use std::collections::BTreeSet;

use anyhow::Result;

use crate::ir::{Constant, Insn, Label, MethodBody};
use crate::opcodes;
use crate::patterns::{
    MatchSite, PatternMatcher, PatternMetadata, Probe, ends_straight_line, is_null_branch,
    next_real_after,
};

/// Detects `throw new E("<message>...")` raised when a race leaves state
/// temporarily inconsistent.
///
/// With `require_probe` the throw must sit right behind a null branch over a
/// re-evaluable probe, which is what a retry loop needs.
pub(crate) struct ThrowOnRace {
    /// Internal name of the thrown exception.
    pub(crate) exception: String,
    pub(crate) message_prefix: String,
    pub(crate) require_probe: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Allocated { new_at: usize, saw_message: bool },
    Constructed { new_at: usize },
}

impl PatternMatcher for ThrowOnRace {
    fn metadata(&self) -> PatternMetadata {
        if self.require_probe {
            PatternMetadata {
                id: "RACE_GUARD_THEN_THROW",
                name: "Race guard then throw",
                description: "Transient condition checked once before throwing",
            }
        } else {
            PatternMetadata {
                id: "UNCONDITIONAL_THROW_ON_RACE",
                name: "Unconditional throw on race",
                description: "Exception thrown for a state a concurrent update resolves",
            }
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        let referenced = body.referenced_labels();
        let mut state = State::Idle;
        for (index, insn) in body.insns.iter().enumerate() {
            state = match (state, insn) {
                (_, Insn::New { class, .. }) if *class == self.exception => {
                    match next_real_after(body, index) {
                        Some((_, Insn::Simple(opcodes::DUP))) => State::Allocated {
                            new_at: index,
                            saw_message: false,
                        },
                        _ => State::Idle,
                    }
                }
                (State::Allocated { new_at, .. }, insn) if self.carries_message(insn) => {
                    State::Allocated {
                        new_at,
                        saw_message: true,
                    }
                }
                (
                    State::Allocated {
                        new_at,
                        saw_message: true,
                    },
                    Insn::Invoke {
                        opcode: opcodes::INVOKESPECIAL,
                        owner,
                        name,
                        ..
                    },
                ) if *owner == self.exception && name == "<init>" => State::Constructed { new_at },
                (State::Constructed { new_at }, Insn::Simple(opcodes::ATHROW)) => {
                    let probe = find_probe(body, new_at, &referenced);
                    if probe.is_some() || !self.require_probe {
                        return Ok(Some(MatchSite::ThrowSite {
                            new_at,
                            athrow_at: index,
                            probe,
                        }));
                    }
                    State::Idle
                }
                (State::Constructed { .. }, Insn::Label(_)) => state,
                (State::Constructed { .. }, _) => State::Idle,
                (_, insn) if ends_straight_line(insn) => State::Idle,
                _ => state,
            };
        }
        Ok(None)
    }
}

impl ThrowOnRace {
    fn carries_message(&self, insn: &Insn) -> bool {
        match insn {
            Insn::Ldc(Constant::String(text)) => text.starts_with(&self.message_prefix),
            Insn::InvokeDynamic {
                bootstrap_strings, ..
            } => bootstrap_strings
                .iter()
                .any(|recipe| recipe.contains(&self.message_prefix)),
            _ => false,
        }
    }
}

/// Walk back from the allocation to the null branch guarding it and the
/// `aload n; getter*` sequence feeding that branch.
fn find_probe(body: &MethodBody, new_at: usize, referenced: &BTreeSet<Label>) -> Option<Probe> {
    let mut cursor = new_at;
    let branch_at = loop {
        cursor = cursor.checked_sub(1)?;
        match &body.insns[cursor] {
            Insn::Label(label) if referenced.contains(label) => return None,
            Insn::Label(_) => {}
            insn if is_null_branch(insn) => break cursor,
            _ => return None,
        }
    };
    // The fall-through of the branch must be the throw itself.
    if next_real_after(body, branch_at).map(|(position, _)| position) != Some(new_at) {
        return None;
    }

    loop {
        cursor = cursor.checked_sub(1)?;
        match &body.insns[cursor] {
            Insn::Label(label) if referenced.contains(label) => return None,
            Insn::Label(_) => {}
            Insn::Var {
                opcode: opcodes::ALOAD,
                ..
            } => {
                return Some(Probe {
                    start: cursor,
                    branch_at,
                });
            }
            Insn::Invoke {
                opcode: opcodes::INVOKEVIRTUAL | opcodes::INVOKEINTERFACE,
                descriptor,
                ..
            } if descriptor.starts_with("()L") || descriptor.starts_with("()[") => {}
            Insn::Field {
                opcode: opcodes::GETFIELD,
                descriptor,
                ..
            } if descriptor.starts_with('L') || descriptor.starts_with('[') => {}
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCEPTION: &str = "java/lang/IllegalStateException";

    fn matcher(require_probe: bool) -> ThrowOnRace {
        ThrowOnRace {
            exception: EXCEPTION.to_string(),
            message_prefix: "Player is already in a world".to_string(),
            require_probe,
        }
    }

    fn add_player_body(message: Insn) -> MethodBody {
        let proceed = Label(0);
        let site = Label(1);
        MethodBody::for_test(
            "addPlayer",
            "(Lcom/example/PlayerRef;)V",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 1),
                Insn::invoke_virtual("com/example/PlayerRef", "getReference", "()Lcom/example/Ref;"),
                Insn::Jump {
                    opcode: opcodes::IFNULL,
                    target: proceed,
                },
                Insn::Label(site),
                Insn::New {
                    class: EXCEPTION.to_string(),
                    site,
                },
                Insn::Simple(opcodes::DUP),
                message,
                Insn::invoke_special(EXCEPTION, "<init>", "(Ljava/lang/String;)V"),
                Insn::Simple(opcodes::ATHROW),
                Insn::Label(proceed),
                Insn::Simple(opcodes::RETURN),
            ],
        )
    }

    #[test]
    fn throw_with_literal_message_is_found_with_probe() {
        let body = add_player_body(Insn::Ldc(Constant::String(
            "Player is already in a world".to_string(),
        )));

        let site = matcher(true).scan(&body).expect("scan");

        assert_eq!(
            Some(MatchSite::ThrowSite {
                new_at: 4,
                athrow_at: 8,
                probe: Some(Probe {
                    start: 0,
                    branch_at: 2
                }),
            }),
            site
        );
    }

    #[test]
    fn string_concatenation_recipe_is_recognised() {
        let body = add_player_body(Insn::InvokeDynamic {
            cp_index: 7,
            name: "makeConcatWithConstants".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
            bootstrap_strings: vec!["Player is already in a world: \u{1}".to_string()],
        });

        assert!(matcher(false).scan(&body).expect("scan").is_some());
    }

    #[test]
    fn other_messages_are_ignored() {
        let body = add_player_body(Insn::Ldc(Constant::String("Unrelated".to_string())));

        assert_eq!(None, matcher(false).scan(&body).expect("scan"));
    }

    #[test]
    fn probe_is_rejected_when_the_throw_is_a_branch_target() {
        let mut body = add_player_body(Insn::Ldc(Constant::String(
            "Player is already in a world".to_string(),
        )));
        body.insns.insert(
            0,
            Insn::Jump {
                opcode: opcodes::GOTO,
                target: Label(1),
            },
        );

        assert_eq!(None, matcher(true).scan(&body).expect("scan"));
        assert!(matcher(false).scan(&body).expect("scan").is_some());
    }
}
