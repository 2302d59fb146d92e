use anyhow::{Context, Result};

use crate::cfg;
use crate::descriptor::{self, MethodShape, ValueKind};
use crate::error::PatchError;
use crate::ir::{Constant, Insn, MethodBody, TryCatch};
use crate::opcodes;
use crate::patterns::{MatchSite, Probe};

pub(crate) const MAX_RETRY_ATTEMPTS: u32 = 100;
pub(crate) const MAX_RETRY_DELAY_MS: u64 = 5_000;

const NOTICE_PREFIX: &str = "[HyFixes-Early]";
const INTERRUPTED_EXCEPTION: &str = "java/lang/InterruptedException";

/// Line printed by patched code when the fix kicks in.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Notice {
    pub(crate) to_stderr: bool,
    pub(crate) text: String,
}

impl Notice {
    pub(crate) fn out(text: impl Into<String>) -> Self {
        Self {
            to_stderr: false,
            text: text.into(),
        }
    }

    pub(crate) fn err(text: impl Into<String>) -> Self {
        Self {
            to_stderr: true,
            text: text.into(),
        }
    }

    fn insns(&self) -> Vec<Insn> {
        let stream = if self.to_stderr { "err" } else { "out" };
        vec![
            Insn::get_static("java/lang/System", stream, "Ljava/io/PrintStream;"),
            Insn::Ldc(Constant::String(format!("{NOTICE_PREFIX} {}", self.text))),
            Insn::invoke_virtual("java/io/PrintStream", "println", "(Ljava/lang/String;)V"),
        ]
    }
}

/// Method invoked by generated code.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MethodRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodRef {
    pub(crate) fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Recovery run by an exception-wrap handler.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Fallback {
    /// Invoke a no-argument method on the receiver of the wrapped call.
    ReceiverCall(MethodRef),
    /// Call a chain of no-argument methods starting from the first parameter
    /// of type `parameter`, each on the previous result. Failures of the chain
    /// are caught and reported with `failure`.
    ParameterCleanup {
        parameter: String,
        calls: Vec<MethodRef>,
        success: Notice,
        failure: Notice,
    },
}

/// Code fragment spliced at a match site.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Fragment {
    /// Return the default value when the value is null.
    GuardAndReturn { notice: Notice },
    /// Replace a null parameter with an empty value of its type.
    DefaultSubstitution { notice: Notice },
    /// Re-run the probe up to `attempts` times, sleeping between attempts,
    /// before falling through to the original failure path.
    BoundedRetryLoop { attempts: u32, delay_ms: u64 },
    /// Catch `exception` around a region, then run the fallback and continue
    /// after the region.
    ExceptionWrap {
        exception: String,
        fallback: Fallback,
        notice: Notice,
    },
    /// Turn the dropping `return` into "index = 0; continue".
    ClampAndResume { notice: Notice },
    /// Drop the exception and continue after the throw.
    ThrowToContinue { notice: Notice },
    /// Drop the exception and return the default value.
    ThrowToReturn { notice: Notice },
    ConstantSubstitution { replacement: Constant },
    /// Delete the call and its argument expression.
    RemoveCall,
    /// Assign an empty value to the field when it is still null.
    FieldDefault { notice: Option<Notice> },
}

impl Fragment {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Fragment::GuardAndReturn { .. } => "guard-and-return",
            Fragment::DefaultSubstitution { .. } => "default-substitution",
            Fragment::BoundedRetryLoop { .. } => "bounded-retry-loop",
            Fragment::ExceptionWrap { .. } => "exception-wrap-with-fallback",
            Fragment::ClampAndResume { .. } => "clamp-and-resume",
            Fragment::ThrowToContinue { .. } => "throw-to-continue",
            Fragment::ThrowToReturn { .. } => "throw-to-return",
            Fragment::ConstantSubstitution { .. } => "constant-substitution",
            Fragment::RemoveCall => "remove-call",
            Fragment::FieldDefault { .. } => "field-default",
        }
    }
}

/// Splice `fragment` at `site`, checking that every label reachable before
/// the splice keeps its operand stack depth.
pub(crate) fn inject(body: &mut MethodBody, site: &MatchSite, fragment: &Fragment) -> Result<()> {
    let mut before = cfg::label_depths(body).context("stack depths before injection")?;
    match (site, fragment) {
        (MatchSite::NullableValue { slot, insert_at }, Fragment::GuardAndReturn { notice }) => {
            let skip = body.new_label();
            let mut insns = vec![
                Insn::load(opcodes::ALOAD, *slot),
                Insn::Jump {
                    opcode: opcodes::IFNONNULL,
                    target: skip,
                },
            ];
            insns.extend(notice.insns());
            insns.extend(default_return(body)?);
            insns.push(Insn::Label(skip));
            body.splice(*insert_at, insns);
        }
        (
            MatchSite::UnguardedFieldStore {
                slot,
                parameter_descriptor,
                field_descriptor,
            },
            Fragment::DefaultSubstitution { notice },
        ) => {
            let empty = match empty_value(body, parameter_descriptor) {
                Some(insns) => insns,
                None => empty_value(body, field_descriptor).ok_or_else(|| {
                    PatchError::structural(format!(
                        "no empty value for {parameter_descriptor} or {field_descriptor}"
                    ))
                })?,
            };
            let skip = body.new_label();
            let mut insns = vec![
                Insn::load(opcodes::ALOAD, *slot),
                Insn::Jump {
                    opcode: opcodes::IFNONNULL,
                    target: skip,
                },
            ];
            insns.extend(notice.insns());
            insns.extend(empty);
            insns.push(Insn::Var {
                opcode: opcodes::ASTORE,
                slot: *slot,
            });
            insns.push(Insn::Label(skip));
            body.splice(0, insns);
        }
        (
            MatchSite::ThrowSite {
                probe: Some(probe), ..
            },
            Fragment::BoundedRetryLoop { attempts, delay_ms },
        ) => retry_loop(body, *probe, *attempts, *delay_ms)?,
        (MatchSite::ThrowSite { athrow_at, .. }, Fragment::ThrowToContinue { notice }) => {
            expect_insn(body, *athrow_at, |insn| *insn == Insn::Simple(opcodes::ATHROW))?;
            let mut insns = vec![Insn::Simple(opcodes::POP)];
            insns.extend(notice.insns());
            body.replace(*athrow_at, insns);
        }
        (MatchSite::ThrowSite { athrow_at, .. }, Fragment::ThrowToReturn { notice }) => {
            expect_insn(body, *athrow_at, |insn| *insn == Insn::Simple(opcodes::ATHROW))?;
            let mut insns = vec![Insn::Simple(opcodes::POP)];
            insns.extend(notice.insns());
            insns.extend(default_return(body)?);
            body.replace(*athrow_at, insns);
        }
        (
            MatchSite::NegativeIndexDrop {
                slot,
                return_at,
                resume,
            },
            Fragment::ClampAndResume { notice },
        ) => {
            let opcode = match body.insns.get(*return_at) {
                Some(Insn::Simple(opcode)) if opcodes::is_return(*opcode) => *opcode,
                _ => {
                    return Err(PatchError::structural(format!(
                        "no return at instruction {return_at}"
                    )));
                }
            };
            let mut insns = match opcode {
                opcodes::RETURN => Vec::new(),
                opcodes::LRETURN | opcodes::DRETURN => vec![Insn::Simple(opcodes::POP2)],
                _ => vec![Insn::Simple(opcodes::POP)],
            };
            insns.extend(notice.insns());
            insns.extend([
                Insn::Simple(opcodes::ICONST_0),
                Insn::Var {
                    opcode: opcodes::ISTORE,
                    slot: *slot,
                },
                Insn::Jump {
                    opcode: opcodes::GOTO,
                    target: *resume,
                },
            ]);
            body.replace(*return_at, insns);
        }
        (
            MatchSite::GuardedRegion {
                start,
                end,
                spill_receiver,
            },
            Fragment::ExceptionWrap {
                exception,
                fallback,
                notice,
            },
        ) => exception_wrap(
            body,
            (*start, *end, *spill_receiver),
            exception,
            fallback,
            notice,
        )?,
        (MatchSite::Constant { at }, Fragment::ConstantSubstitution { replacement }) => {
            match body.insns.get(*at) {
                Some(Insn::Ldc(original)) if original.is_wide() == replacement.is_wide() => {}
                _ => {
                    return Err(PatchError::structural(format!(
                        "instruction {at} is not a constant of the replacement's size"
                    )));
                }
            }
            body.insns[*at] = Insn::Ldc(replacement.clone());
        }
        (MatchSite::RemovableCall { start, end }, Fragment::RemoveCall) => {
            if start >= end || *end > body.insns.len() {
                return Err(PatchError::structural(format!(
                    "call range {start}..{end} is out of bounds"
                )));
            }
            // Labels of the removed expression now mark its start.
            let kept: Vec<Insn> = body
                .insns
                .drain(*start..*end)
                .filter(|insn| !insn.is_real())
                .collect();
            for insn in &kept {
                if let Insn::Label(label) = insn {
                    before.remove(label);
                }
            }
            body.splice(*start, kept);
        }
        (
            MatchSite::UnsetField {
                insert_at,
                name,
                descriptor,
            },
            Fragment::FieldDefault { notice },
        ) => {
            let owner = body.class_name.clone();
            let field = |opcode: u8| Insn::Field {
                opcode,
                owner: owner.clone(),
                name: name.clone(),
                descriptor: descriptor.clone(),
            };
            for at in insert_at.iter().rev() {
                if *at > body.insns.len() {
                    return Err(PatchError::structural(format!(
                        "insertion point {at} is out of bounds"
                    )));
                }
                let empty = empty_value(body, descriptor).ok_or_else(|| {
                    PatchError::structural(format!("no empty value for {descriptor}"))
                })?;
                let skip = body.new_label();
                let mut insns = vec![
                    Insn::load(opcodes::ALOAD, 0),
                    field(opcodes::GETFIELD),
                    Insn::Jump {
                        opcode: opcodes::IFNONNULL,
                        target: skip,
                    },
                ];
                if let Some(notice) = notice {
                    insns.extend(notice.insns());
                }
                insns.push(Insn::load(opcodes::ALOAD, 0));
                insns.extend(empty);
                insns.push(field(opcodes::PUTFIELD));
                insns.push(Insn::Label(skip));
                body.splice(*at, insns);
            }
        }
        (site, fragment) => {
            return Err(PatchError::structural(format!(
                "fragment {} does not fit site {site:?}",
                fragment.kind()
            )));
        }
    }
    cfg::check_balance(&before, body).context("stack depths after injection")
}

fn expect_insn(body: &MethodBody, index: usize, check: impl Fn(&Insn) -> bool) -> Result<()> {
    match body.insns.get(index) {
        Some(insn) if check(insn) => Ok(()),
        found => Err(PatchError::structural(format!(
            "unexpected instruction {found:?} at {index}"
        ))),
    }
}

/// `return` of the zero value for the method's return type.
fn default_return(body: &MethodBody) -> Result<Vec<Insn>> {
    if body.method_name == "<init>" {
        return Err(PatchError::structural(
            "early return from a constructor is not supported",
        ));
    }
    let shape = MethodShape::parse(&body.descriptor)?;
    let insns = match shape.return_kind()? {
        None => vec![Insn::Simple(opcodes::RETURN)],
        Some(ValueKind::Int) => vec![
            Insn::Simple(opcodes::ICONST_0),
            Insn::Simple(opcodes::IRETURN),
        ],
        Some(ValueKind::Float) => vec![
            Insn::Simple(opcodes::FCONST_0),
            Insn::Simple(opcodes::FRETURN),
        ],
        Some(ValueKind::Long) => vec![
            Insn::Simple(opcodes::LCONST_0),
            Insn::Simple(opcodes::LRETURN),
        ],
        Some(ValueKind::Double) => vec![
            Insn::Simple(opcodes::DCONST_0),
            Insn::Simple(opcodes::DRETURN),
        ],
        Some(ValueKind::Reference) => vec![
            Insn::Simple(opcodes::ACONST_NULL),
            Insn::Simple(opcodes::ARETURN),
        ],
    };
    Ok(insns)
}

/// Instructions pushing an empty value for a reference descriptor, or `None`
/// when the type has no known empty value.
fn empty_value(body: &mut MethodBody, field_descriptor: &str) -> Option<Vec<Insn>> {
    if let Some(element) = descriptor::array_element(field_descriptor) {
        let allocation = match element.as_bytes().first()? {
            b'Z' => newarray(opcodes::T_BOOLEAN),
            b'C' => newarray(opcodes::T_CHAR),
            b'F' => newarray(opcodes::T_FLOAT),
            b'D' => newarray(opcodes::T_DOUBLE),
            b'B' => newarray(opcodes::T_BYTE),
            b'S' => newarray(opcodes::T_SHORT),
            b'I' => newarray(opcodes::T_INT),
            b'J' => newarray(opcodes::T_LONG),
            _ => Insn::Type {
                opcode: opcodes::ANEWARRAY,
                class: descriptor::reference_class_name(element)?,
            },
        };
        return Some(vec![Insn::Simple(opcodes::ICONST_0), allocation]);
    }

    let class = descriptor::reference_class_name(field_descriptor)?;
    let empty = match class.as_str() {
        "java/util/List" | "java/util/Collection" | "java/lang/Iterable" => vec![
            Insn::invoke_static("java/util/Collections", "emptyList", "()Ljava/util/List;"),
        ],
        "java/util/Set" => vec![Insn::invoke_static(
            "java/util/Collections",
            "emptySet",
            "()Ljava/util/Set;",
        )],
        "java/util/Map" => vec![Insn::invoke_static(
            "java/util/Collections",
            "emptyMap",
            "()Ljava/util/Map;",
        )],
        "java/util/ArrayList" | "java/util/HashMap" | "java/util/HashSet" => {
            let site = body.new_label();
            vec![
                Insn::Label(site),
                Insn::New {
                    class: class.clone(),
                    site,
                },
                Insn::Simple(opcodes::DUP),
                Insn::invoke_special(&class, "<init>", "()V"),
            ]
        }
        _ => return None,
    };
    Some(empty)
}

fn newarray(element_type: u8) -> Insn {
    Insn::Int {
        opcode: opcodes::NEWARRAY,
        operand: i32::from(element_type),
    }
}

fn retry_loop(body: &mut MethodBody, probe: Probe, attempts: u32, delay_ms: u64) -> Result<()> {
    if !(1..=MAX_RETRY_ATTEMPTS).contains(&attempts) {
        return Err(PatchError::structural(format!(
            "retry attempts {attempts} outside 1..={MAX_RETRY_ATTEMPTS}"
        )));
    }
    if delay_ms > MAX_RETRY_DELAY_MS {
        return Err(PatchError::structural(format!(
            "retry delay {delay_ms}ms above {MAX_RETRY_DELAY_MS}ms"
        )));
    }
    expect_insn(body, probe.branch_at, crate::patterns::is_null_branch)?;
    let counter = body.fresh_local(1);
    let retry = body.new_label();
    let exhausted = body.new_label();
    let sleep_start = body.new_label();
    let sleep_end = body.new_label();
    let interrupted = body.new_label();

    // Tail first so `probe.start` stays valid. An interrupted sleep restores
    // the interrupt flag and gives up on the remaining attempts.
    body.splice(
        probe.branch_at + 1,
        vec![
            Insn::load(opcodes::ILOAD, counter),
            Insn::push_int(attempts as i32),
            Insn::Jump {
                opcode: opcodes::IF_ICMPGE,
                target: exhausted,
            },
            Insn::Iinc {
                slot: counter,
                delta: 1,
            },
            Insn::push_long(delay_ms as i64),
            Insn::Label(sleep_start),
            Insn::invoke_static("java/lang/Thread", "sleep", "(J)V"),
            Insn::Label(sleep_end),
            Insn::Jump {
                opcode: opcodes::GOTO,
                target: retry,
            },
            Insn::Label(interrupted),
            Insn::Simple(opcodes::POP),
            Insn::invoke_static("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;"),
            Insn::invoke_virtual("java/lang/Thread", "interrupt", "()V"),
            Insn::Label(exhausted),
        ],
    );
    body.try_catches.insert(
        0,
        TryCatch {
            start: sleep_start,
            end: sleep_end,
            handler: interrupted,
            catch_type: Some(INTERRUPTED_EXCEPTION.to_string()),
        },
    );
    body.splice(
        probe.start,
        vec![
            Insn::Simple(opcodes::ICONST_0),
            Insn::Var {
                opcode: opcodes::ISTORE,
                slot: counter,
            },
            Insn::Label(retry),
        ],
    );
    Ok(())
}

fn exception_wrap(
    body: &mut MethodBody,
    (start, end, spill_receiver): (usize, usize, bool),
    exception: &str,
    fallback: &Fallback,
    notice: &Notice,
) -> Result<()> {
    if start >= end || end >= body.insns.len() {
        return Err(PatchError::structural(format!(
            "invalid wrapped region {start}..{end}"
        )));
    }
    if spill_receiver != matches!(fallback, Fallback::ReceiverCall(_)) {
        return Err(PatchError::structural(
            "receiver fallback needs a spilled receiver and only it",
        ));
    }

    // Mark both ends, `end` first so `start` stays valid.
    let resume = body.new_label();
    body.splice(end, vec![Insn::Label(resume)]);
    let entry = body.new_label();
    body.splice(start, vec![Insn::Label(entry)]);
    let depths = cfg::label_depths(body)?;
    let entry_depth = depths.get(&entry).copied();
    let resume_depth = depths.get(&resume).copied();
    if entry_depth != Some(usize::from(spill_receiver)) || resume_depth != Some(0) {
        return Err(PatchError::structural(format!(
            "wrapped region needs an empty stack around it, found {entry_depth:?} and {resume_depth:?}"
        )));
    }

    let receiver = spill_receiver.then(|| body.fresh_local(1));
    let try_start = body.new_label();
    let try_end = body.new_label();
    let handler = body.new_label();

    let mut head = Vec::new();
    if let Some(slot) = receiver {
        head.push(Insn::Var {
            opcode: opcodes::ASTORE,
            slot,
        });
    }
    head.push(Insn::Label(try_start));
    if let Some(slot) = receiver {
        head.push(Insn::load(opcodes::ALOAD, slot));
    }
    body.splice(start + 1, head);

    let resume_at = body
        .label_position(resume)
        .ok_or_else(|| PatchError::structural("resume label disappeared"))?;
    let falls_through = body.insns[..resume_at]
        .iter()
        .rev()
        .find(|insn| insn.is_real())
        .is_some_and(|insn| !insn.is_unconditional());
    let mut tail = vec![Insn::Label(try_end)];
    if falls_through {
        tail.push(Insn::Jump {
            opcode: opcodes::GOTO,
            target: resume,
        });
    }
    tail.push(Insn::Label(handler));
    tail.push(Insn::Simple(opcodes::POP));
    tail.extend(notice.insns());
    let (recovery, cleanup_handler) = fallback_insns(body, fallback, receiver)?;
    tail.extend(recovery);
    body.splice(resume_at, tail);

    // Innermost handler first so it wins over any enclosing one.
    body.try_catches.insert(
        0,
        TryCatch {
            start: try_start,
            end: try_end,
            handler,
            catch_type: Some(exception.to_string()),
        },
    );
    if let Some(cleanup_handler) = cleanup_handler {
        body.try_catches.insert(0, cleanup_handler);
    }
    Ok(())
}

/// Handler body after the caught exception was popped, plus the handler
/// guarding it, if any.
fn fallback_insns(
    body: &mut MethodBody,
    fallback: &Fallback,
    receiver: Option<u16>,
) -> Result<(Vec<Insn>, Option<TryCatch>)> {
    match (fallback, receiver) {
        (Fallback::ReceiverCall(method), Some(slot)) => {
            let mut insns = vec![
                Insn::load(opcodes::ALOAD, slot),
                Insn::invoke_virtual(&method.owner, &method.name, &method.descriptor),
            ];
            insns.extend(discard_result(&method.descriptor)?);
            Ok((insns, None))
        }
        (
            Fallback::ParameterCleanup {
                parameter,
                calls,
                success,
                failure,
            },
            None,
        ) => {
            let shape = MethodShape::parse(&body.descriptor)?;
            let index = shape
                .parameters
                .iter()
                .position(|candidate| candidate == parameter)
                .ok_or_else(|| {
                    PatchError::structural(format!(
                        "{}{} takes no {parameter} parameter",
                        body.method_name, body.descriptor
                    ))
                })?;
            let slot = shape.parameter_slot(index, body.is_static)?;
            let Some(last) = calls.last() else {
                return Err(PatchError::structural("cleanup needs at least one call"));
            };
            let cleanup_start = body.new_label();
            let cleanup_end = body.new_label();
            let cleanup_failed = body.new_label();
            let done = body.new_label();

            let mut insns = vec![
                Insn::Label(cleanup_start),
                Insn::load(opcodes::ALOAD, slot),
            ];
            for call in calls {
                insns.push(Insn::invoke_virtual(&call.owner, &call.name, &call.descriptor));
            }
            insns.extend(discard_result(&last.descriptor)?);
            insns.extend(success.insns());
            insns.push(Insn::Label(cleanup_end));
            insns.push(Insn::Jump {
                opcode: opcodes::GOTO,
                target: done,
            });
            insns.push(Insn::Label(cleanup_failed));
            insns.push(Insn::Simple(opcodes::POP));
            insns.extend(failure.insns());
            insns.push(Insn::Label(done));
            let handler = TryCatch {
                start: cleanup_start,
                end: cleanup_end,
                handler: cleanup_failed,
                catch_type: Some("java/lang/Exception".to_string()),
            };
            Ok((insns, Some(handler)))
        }
        (fallback, receiver) => Err(PatchError::structural(format!(
            "fallback {fallback:?} does not fit receiver {receiver:?}"
        ))),
    }
}

/// Pop whatever a call with `descriptor` left on the stack.
fn discard_result(descriptor: &str) -> Result<Vec<Insn>> {
    let insns = match MethodShape::parse(descriptor)?.return_kind()? {
        None => Vec::new(),
        Some(kind) if kind.slots() == 2 => vec![Insn::Simple(opcodes::POP2)],
        Some(_) => vec![Insn::Simple(opcodes::POP)],
    };
    Ok(insns)
}
