use anyhow::Result;

use crate::cfg;
use crate::descriptor;
use crate::ir::{Constant, Insn, Label, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, ends_straight_line};

/// Detects a void static call, together with the expression building its
/// arguments, that must not run at all. Player-left broadcasts sent while the
/// player is being removed are the motivating case.
///
/// The argument expression must mention `marker`, either as a string constant
/// or inside an `invokedynamic` recipe, so unrelated calls to the same method
/// are left alone.
pub(crate) struct UnwantedCall {
    /// Suffix of the owner's internal name, e.g. `PlayerUtil`.
    pub(crate) owner_suffix: String,
    pub(crate) name: String,
    pub(crate) marker: String,
}

impl PatternMatcher for UnwantedCall {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "UNWANTED_STATIC_CALL",
            name: "Unwanted static call",
            description: "Side-effecting call that has to be dropped along with its arguments",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        for (index, insn) in body.insns.iter().enumerate() {
            let Insn::Invoke {
                opcode: opcodes::INVOKESTATIC,
                owner,
                name,
                descriptor,
                ..
            } = insn
            else {
                continue;
            };
            if !owner.ends_with(self.owner_suffix.as_str()) || *name != self.name {
                continue;
            }
            let (arguments, produced) = descriptor::invoke_stack_effect(descriptor)?;
            if produced != 0 {
                continue;
            }
            if let Some(start) = self.argument_start(body, index, arguments)? {
                return Ok(Some(MatchSite::RemovableCall {
                    start,
                    end: index + 1,
                }));
            }
        }
        Ok(None)
    }
}

impl UnwantedCall {
    /// First instruction of the straight-line expression producing the
    /// `arguments` stack slots consumed by the call at `call_at`.
    ///
    /// Gives up on anything the removal could not drop cleanly: labels other
    /// code refers to, control flow, stores and instructions whose results
    /// outlive the call.
    fn argument_start(
        &self,
        body: &MethodBody,
        call_at: usize,
        arguments: usize,
    ) -> Result<Option<usize>> {
        let referenced = body.referenced_labels();
        let mut need = arguments;
        let mut start = call_at;
        let mut marked = false;
        while need > 0 {
            let Some(previous) = start.checked_sub(1) else {
                return Ok(None);
            };
            start = previous;
            let insn = &body.insns[start];
            match insn {
                Insn::Label(label) => {
                    if referenced.contains(label) || is_range_boundary(body, *label) {
                        return Ok(None);
                    }
                    continue;
                }
                Insn::Iinc { .. } => return Ok(None),
                Insn::Var { opcode, .. } if is_store(*opcode) => return Ok(None),
                insn if ends_straight_line(insn) => return Ok(None),
                _ => {}
            }
            let (pops, pushes) = cfg::stack_effect(insn)?;
            if pushes == 0 || pushes > need {
                return Ok(None);
            }
            need = need - pushes + pops;
            marked |= self.mentions_marker(insn);
        }
        Ok(marked.then_some(start))
    }

    fn mentions_marker(&self, insn: &Insn) -> bool {
        match insn {
            Insn::Ldc(Constant::String(text)) => *text == self.marker,
            Insn::InvokeDynamic {
                bootstrap_strings, ..
            } => bootstrap_strings
                .iter()
                .any(|text| text.contains(self.marker.as_str())),
            _ => false,
        }
    }
}

fn is_store(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::ISTORE | opcodes::LSTORE | opcodes::FSTORE | opcodes::DSTORE | opcodes::ASTORE
    )
}

fn is_range_boundary(body: &MethodBody, label: Label) -> bool {
    body.try_catches
        .iter()
        .any(|try_catch| try_catch.start == label || try_catch.end == label)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER_UTIL: &str = "com/example/PlayerUtil";
    const MESSAGE: &str = "com/example/Message";
    const BROADCAST: &str = "(Ljava/util/UUID;Lcom/example/Message;)V";

    fn matcher() -> UnwantedCall {
        UnwantedCall {
            owner_suffix: "PlayerUtil".to_string(),
            name: "broadcastMessageToPlayers".to_string(),
            marker: "server.general.playerLeftWorld".to_string(),
        }
    }

    fn translation(key: &str) -> Vec<Insn> {
        vec![
            Insn::Ldc(Constant::String(key.to_string())),
            Insn::invoke_static(MESSAGE, "translation", "(Ljava/lang/String;)Lcom/example/Message;"),
        ]
    }

    fn removed_body(key: &str) -> MethodBody {
        let mut insns = vec![
            Insn::load(opcodes::ALOAD, 1),
            Insn::invoke_virtual("com/example/Player", "remove", "()V"),
            Insn::Label(Label(0)),
            Insn::load(opcodes::ALOAD, 2),
        ];
        insns.extend(translation(key));
        insns.extend([
            Insn::invoke_static(PLAYER_UTIL, "broadcastMessageToPlayers", BROADCAST),
            Insn::Simple(opcodes::RETURN),
        ]);
        MethodBody::for_test(
            "onEntityRemoved",
            "(Lcom/example/Player;Ljava/util/UUID;)V",
            false,
            insns,
        )
    }

    #[test]
    fn broadcast_and_its_arguments_are_found() {
        assert_eq!(
            Some(MatchSite::RemovableCall { start: 3, end: 7 }),
            matcher().scan(&removed_body("server.general.playerLeftWorld")).expect("scan")
        );
    }

    #[test]
    fn other_broadcasts_are_kept() {
        assert_eq!(
            None,
            matcher().scan(&removed_body("server.general.playerJoinedWorld")).expect("scan")
        );
    }

    #[test]
    fn marker_inside_a_string_recipe_counts() {
        let mut body = removed_body("unused");
        body.insns[4] = Insn::InvokeDynamic {
            cp_index: 0,
            name: "makeConcatWithConstants".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
            bootstrap_strings: vec!["server.general.playerLeftWorld\u{1}".to_string()],
        };

        assert_eq!(
            Some(MatchSite::RemovableCall { start: 3, end: 7 }),
            matcher().scan(&body).expect("scan")
        );
    }

    #[test]
    fn arguments_with_their_own_branches_are_kept() {
        let (other, join) = (Label(1), Label(2));
        let body = MethodBody::for_test(
            "onEntityRemoved",
            "(Lcom/example/Player;Ljava/util/UUID;)V",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 2),
                Insn::load(opcodes::ALOAD, 1),
                Insn::Jump {
                    opcode: opcodes::IFNULL,
                    target: other,
                },
                Insn::Ldc(Constant::String("server.general.playerLeftWorld".to_string())),
                Insn::Jump {
                    opcode: opcodes::GOTO,
                    target: join,
                },
                Insn::Label(other),
                Insn::Ldc(Constant::String("server.general.playerLeft".to_string())),
                Insn::Label(join),
                Insn::invoke_static(MESSAGE, "translation", "(Ljava/lang/String;)Lcom/example/Message;"),
                Insn::invoke_static(PLAYER_UTIL, "broadcastMessageToPlayers", BROADCAST),
                Insn::Simple(opcodes::RETURN),
            ],
        );

        assert_eq!(None, matcher().scan(&body).expect("scan"));
    }
}
