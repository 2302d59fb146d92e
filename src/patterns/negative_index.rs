use anyhow::Result;

use crate::ir::{Insn, Label, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, ends_straight_line, next_real_after};

/// Detects `if (index - offset < 0) return;` where the early return drops data
/// that arrived out of order.
pub(crate) struct DroppedOutOfOrderData;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Adjusted { slot: u16 },
}

impl PatternMatcher for DroppedOutOfOrderData {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "DROPPED_OUT_OF_ORDER_DATA",
            name: "Dropped out-of-order data",
            description: "Negative adjusted index returns early instead of recovering",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        let mut state = State::Idle;
        for (index, insn) in body.insns.iter().enumerate() {
            match (state, insn) {
                (_, Insn::Simple(opcodes::ISUB)) => {
                    if let Some((
                        _,
                        Insn::Var {
                            opcode: opcodes::ISTORE,
                            slot,
                        },
                    )) = next_real_after(body, index)
                    {
                        state = State::Adjusted { slot: *slot };
                    }
                }
                (
                    State::Adjusted { slot },
                    Insn::Var {
                        opcode: opcodes::ILOAD,
                        slot: loaded,
                    },
                ) if *loaded == slot => {
                    let Some((
                        branch_at,
                        Insn::Jump {
                            opcode: opcodes::IFGE,
                            target,
                        },
                    )) = next_real_after(body, index)
                    else {
                        continue;
                    };
                    if let Some(return_at) = negative_branch_return(body, branch_at, *target) {
                        return Ok(Some(MatchSite::NegativeIndexDrop {
                            slot,
                            return_at,
                            resume: *target,
                        }));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Position of the `return` ending the fall-through path of the branch at
/// `branch_at`, provided it is reached before `resume` and before any other
/// control transfer.
fn negative_branch_return(body: &MethodBody, branch_at: usize, resume: Label) -> Option<usize> {
    for (offset, insn) in body.insns[branch_at + 1..].iter().enumerate() {
        match insn {
            Insn::Label(label) if *label == resume => return None,
            Insn::Simple(opcode) if opcodes::is_return(*opcode) => {
                return Some(branch_at + 1 + offset);
            }
            insn if ends_straight_line(insn) => return None,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_data_body(error_branch_end: Insn) -> MethodBody {
        let normal = Label(0);
        MethodBody::for_test(
            "putInteractionSyncData",
            "(ILjava/lang/Object;)V",
            false,
            vec![
                Insn::load(opcodes::ILOAD, 1),
                Insn::load(opcodes::ALOAD, 0),
                Insn::Field {
                    opcode: opcodes::GETFIELD,
                    owner: "com/example/Chain".to_string(),
                    name: "tempSyncDataOffset".to_string(),
                    descriptor: "I".to_string(),
                },
                Insn::Simple(opcodes::ISUB),
                Insn::Var {
                    opcode: opcodes::ISTORE,
                    slot: 1,
                },
                Insn::load(opcodes::ILOAD, 1),
                Insn::Jump {
                    opcode: opcodes::IFGE,
                    target: normal,
                },
                Insn::get_static("java/lang/System", "err", "Ljava/io/PrintStream;"),
                Insn::Simple(opcodes::POP),
                error_branch_end,
                Insn::Label(normal),
                Insn::Simple(opcodes::RETURN),
            ],
        )
    }

    #[test]
    fn early_return_in_negative_branch_is_found() {
        let site = DroppedOutOfOrderData
            .scan(&sync_data_body(Insn::Simple(opcodes::RETURN)))
            .expect("scan");

        assert_eq!(
            Some(MatchSite::NegativeIndexDrop {
                slot: 1,
                return_at: 9,
                resume: Label(0)
            }),
            site
        );
    }

    #[test]
    fn recovered_branch_is_not_found() {
        let body = sync_data_body(Insn::Jump {
            opcode: opcodes::GOTO,
            target: Label(0),
        });

        assert_eq!(None, DroppedOutOfOrderData.scan(&body).expect("scan"));
    }

    #[test]
    fn plain_negative_check_without_subtraction_is_ignored() {
        let mut body = sync_data_body(Insn::Simple(opcodes::RETURN));
        body.insns[3] = Insn::Simple(opcodes::IADD);

        assert_eq!(None, DroppedOutOfOrderData.scan(&body).expect("scan"));
    }
}
