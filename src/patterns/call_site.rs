use anyhow::Result;

use crate::ir::{Insn, MethodBody};
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, is_covered};

/// Detects a call that throws on current runtimes, e.g. `Thread.stop()`,
/// when no handler for that exception surrounds it yet.
pub(crate) struct UnsupportedCallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    /// Internal name of the exception the call raises.
    pub(crate) exception: String,
}

impl PatternMatcher for UnsupportedCallSite {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "UNSUPPORTED_CALL_SITE",
            name: "Unsupported call site",
            description: "Call that always throws on the running platform",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        for (index, insn) in body.insns.iter().enumerate() {
            let Insn::Invoke {
                owner,
                name,
                descriptor,
                ..
            } = insn
            else {
                continue;
            };
            if *owner != self.owner || *name != self.name || *descriptor != self.descriptor {
                continue;
            }
            if !is_covered(body, index, &self.exception) {
                return Ok(Some(MatchSite::GuardedRegion {
                    start: index,
                    end: index + 1,
                    spill_receiver: true,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Label, TryCatch};
    use crate::opcodes;

    fn matcher() -> UnsupportedCallSite {
        UnsupportedCallSite {
            owner: "java/lang/Thread".to_string(),
            name: "stop".to_string(),
            descriptor: "()V".to_string(),
            exception: "java/lang/UnsupportedOperationException".to_string(),
        }
    }

    fn stop_body() -> MethodBody {
        MethodBody::for_test(
            "stop",
            "()V",
            false,
            vec![
                Insn::load(opcodes::ALOAD, 0),
                Insn::Field {
                    opcode: opcodes::GETFIELD,
                    owner: "com/example/TickingThread".to_string(),
                    name: "thread".to_string(),
                    descriptor: "Ljava/lang/Thread;".to_string(),
                },
                Insn::invoke_virtual("java/lang/Thread", "stop", "()V"),
                Insn::Simple(opcodes::RETURN),
            ],
        )
    }

    #[test]
    fn bare_call_is_found() {
        assert_eq!(
            Some(MatchSite::GuardedRegion {
                start: 2,
                end: 3,
                spill_receiver: true,
            }),
            matcher().scan(&stop_body()).expect("scan")
        );
    }

    #[test]
    fn call_inside_matching_handler_is_not_found() {
        let mut body = stop_body();
        let (start, end, handler) = (Label(0), Label(1), Label(2));
        body.insns.insert(2, Insn::Label(start));
        body.insns.insert(4, Insn::Label(end));
        body.insns.extend([
            Insn::Label(handler),
            Insn::Simple(opcodes::POP),
            Insn::Simple(opcodes::RETURN),
        ]);
        body.try_catches.push(TryCatch {
            start,
            end,
            handler,
            catch_type: Some("java/lang/UnsupportedOperationException".to_string()),
        });

        assert_eq!(None, matcher().scan(&body).expect("scan"));
    }
}
