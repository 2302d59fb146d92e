use std::collections::BTreeMap;

use anyhow::{Context, Result};
use jclassfile::class_file;

use crate::classfile::{ACC_BRIDGE, ACC_SYNTHETIC, ClassFile, MemberInfo};
use crate::decode::decode_method;
use crate::encode::encode_method;
use crate::error::PatchError;
use crate::frames::{self, Frame};
use crate::inject::{Fragment, inject};
use crate::ir::{Label, MethodBody};
use crate::patterns::PatternMatcher;

/// Class and method a transformer is bound to.
///
/// Class names may be given dotted (`a.b.C$D`) or internal (`a/b/C$D`); both
/// compare equal. Without a descriptor the method name must be unique among
/// non-bridge methods.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetDescriptor {
    class_name: String,
    method_name: String,
    descriptor: Option<String>,
}

impl TargetDescriptor {
    pub fn new(class_name: &str, method_name: &str, descriptor: Option<&str>) -> Self {
        Self {
            class_name: dotted_name(class_name),
            method_name: method_name.to_string(),
            descriptor: descriptor.map(str::to_string),
        }
    }

    /// Dotted class name.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn descriptor(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    pub fn matches_class(&self, class_name: &str) -> bool {
        dotted_name(class_name) == self.class_name
    }
}

pub fn dotted_name(class_name: &str) -> String {
    class_name.replace('/', ".")
}

/// Dotted name of the class declared by `bytes`.
pub fn declared_class_name(bytes: &[u8]) -> Result<String> {
    let class = ClassFile::parse(bytes).context("parse class file")?;
    Ok(dotted_name(&class.class_name()?))
}

/// Result of one method rewriter on one class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MethodOutcome {
    Applied,
    /// The defect signature is absent, e.g. fixed upstream or already patched.
    PatternNotFound,
}

/// Methods of a class one rewriter applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum MethodSelector {
    /// A single method. Without a descriptor the name must be unique among
    /// the methods javac did not generate, so bridges are ignored.
    Exact {
        name: String,
        descriptor: Option<String>,
    },
    /// Every non-bridge method whose name starts with the prefix, e.g. the
    /// lambdas javac emits for one enclosing method.
    Prefix(String),
}

impl MethodSelector {
    fn resolve(&self, class: &ClassFile) -> Result<Vec<usize>> {
        match self {
            MethodSelector::Exact {
                name,
                descriptor: Some(descriptor),
            } => class.find_methods(|found| found == name, Some(descriptor), 0),
            MethodSelector::Exact {
                name,
                descriptor: None,
            } => {
                let found =
                    class.find_methods(|found| found == name, None, ACC_BRIDGE | ACC_SYNTHETIC)?;
                if found.len() > 1 {
                    return Err(PatchError::structural(format!(
                        "target method {name} is ambiguous ({} overloads)",
                        found.len()
                    )));
                }
                Ok(found)
            }
            MethodSelector::Prefix(prefix) => {
                class.find_methods(|found| found.starts_with(prefix.as_str()), None, ACC_BRIDGE)
            }
        }
    }
}

impl std::fmt::Display for MethodSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodSelector::Exact { name, descriptor } => {
                write!(f, "{name}{}", descriptor.as_deref().unwrap_or(""))
            }
            MethodSelector::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// One matcher bound to one fragment, applied to the selected methods.
pub(crate) struct MethodRewriter {
    pub(crate) selector: MethodSelector,
    pub(crate) matcher: Box<dyn PatternMatcher>,
    pub(crate) fragment: Fragment,
}

impl MethodRewriter {
    pub(crate) fn new(
        method_name: &str,
        descriptor: Option<&str>,
        matcher: impl PatternMatcher + 'static,
        fragment: Fragment,
    ) -> Self {
        Self {
            selector: MethodSelector::Exact {
                name: method_name.to_string(),
                descriptor: descriptor.map(str::to_string),
            },
            matcher: Box::new(matcher),
            fragment,
        }
    }

    /// Rewriter for every method whose name starts with `prefix`.
    pub(crate) fn prefixed(
        prefix: &str,
        matcher: impl PatternMatcher + 'static,
        fragment: Fragment,
    ) -> Self {
        Self {
            selector: MethodSelector::Prefix(prefix.to_string()),
            matcher: Box::new(matcher),
            fragment,
        }
    }

    /// Scan once and splice the fragment at the first match.
    pub(crate) fn rewrite(&self, body: &mut MethodBody) -> Result<MethodOutcome> {
        let Some(site) = self.matcher.scan(body)? else {
            return Ok(MethodOutcome::PatternNotFound);
        };
        tracing::debug!(
            pattern = self.matcher.metadata().id,
            method = %body.method_name,
            ?site,
            "pattern matched"
        );
        inject(body, &site, &self.fragment)
            .with_context(|| format!("inject {}", self.fragment.kind()))?;
        Ok(MethodOutcome::Applied)
    }
}

/// Outcome of one method rewriter, for diagnostics.
#[derive(Clone, Debug)]
pub(crate) struct MethodReport {
    /// `name(descriptor)` of the rewritten method.
    pub(crate) method: String,
    pub(crate) pattern: &'static str,
    pub(crate) outcome: MethodOutcome,
}

#[derive(Clone, Debug)]
pub(crate) struct ClassRewrite {
    pub(crate) bytes: Vec<u8>,
    pub(crate) reports: Vec<MethodReport>,
}

impl ClassRewrite {
    pub(crate) fn applied(&self) -> bool {
        self.reports
            .iter()
            .any(|report| report.outcome == MethodOutcome::Applied)
    }
}

/// Parse a class, run each rewriter against its method and re-serialize.
///
/// Rewriters run in order; later rewriters of the same method see the stream
/// left by earlier ones. The input is returned as is when nothing matched.
pub(crate) fn rewrite_class(bytes: &[u8], rewriters: &[MethodRewriter]) -> Result<ClassRewrite> {
    let mut class = ClassFile::parse(bytes).context("parse class file")?;
    let class_name = class.class_name()?;
    let mut bodies: BTreeMap<usize, MethodBody> = BTreeMap::new();
    let mut changed = Vec::new();
    let mut reports = Vec::with_capacity(rewriters.len());

    for rewriter in rewriters {
        let pattern = rewriter.matcher.metadata().id;
        let method_indices = rewriter.selector.resolve(&class)?;
        if method_indices.is_empty() {
            tracing::debug!(
                class = %class_name,
                method = %rewriter.selector,
                "target method not found"
            );
            reports.push(MethodReport {
                method: rewriter.selector.to_string(),
                pattern,
                outcome: MethodOutcome::PatternNotFound,
            });
            continue;
        }
        for method_index in method_indices {
            if !bodies.contains_key(&method_index) {
                let body = decode_method(&class, method_index)?.ok_or_else(|| {
                    PatchError::structural(format!(
                        "{class_name}.{} has no code",
                        rewriter.selector
                    ))
                })?;
                bodies.insert(method_index, body);
            }
            let Some(body) = bodies.get_mut(&method_index) else {
                continue;
            };
            let outcome = rewriter.rewrite(body).with_context(|| {
                format!(
                    "rewrite {class_name}.{}{}",
                    body.method_name, body.descriptor
                )
            })?;
            if outcome == MethodOutcome::Applied && !changed.contains(&method_index) {
                changed.push(method_index);
            }
            reports.push(MethodReport {
                method: format!("{}{}", body.method_name, body.descriptor),
                pattern,
                outcome,
            });
        }
    }

    if changed.is_empty() {
        return Ok(ClassRewrite {
            bytes: bytes.to_vec(),
            reports,
        });
    }

    for method_index in changed {
        let Some(body) = bodies.get_mut(&method_index) else {
            continue;
        };
        let code = encode_method(&mut class, body)
            .with_context(|| format!("encode {class_name}.{}{}", body.method_name, body.descriptor))?;
        let code_index = class
            .code_attribute_index(&class.methods[method_index])?
            .ok_or_else(|| PatchError::structural("Code attribute disappeared"))?;
        class.methods[method_index].attributes[code_index].info = code;
    }
    tracing::debug!(
        class = %class_name,
        constants = class.constant_pool.len(),
        appended = class.constant_pool.added(),
        "re-serializing patched class"
    );
    let output = class.to_bytes().context("serialize class file")?;
    verify_output(bytes, &output)?;
    Ok(ClassRewrite {
        bytes: output,
        reports,
    })
}

/// Cross-check every method whose code differs between `original` and
/// `patched`: its declared StackMapTable must agree with a fresh inference at
/// every merge point, and its declared max stack and locals must cover the
/// inferred ones. Returns the number of methods checked.
pub fn verify_frames(original: &[u8], patched: &[u8]) -> Result<usize> {
    let before = ClassFile::parse(original).context("parse original class file")?;
    let after = ClassFile::parse(patched).context("parse patched class file")?;
    let mut checked = 0;
    for (method_index, method) in after.methods.iter().enumerate() {
        let unchanged = match before.methods.get(method_index) {
            Some(original_method) => {
                code_bytes(&before, original_method)? == code_bytes(&after, method)?
            }
            None => false,
        };
        if unchanged {
            continue;
        }
        let Some(body) = decode_method(&after, method_index)? else {
            continue;
        };
        let method = format!("{}{}", body.method_name, body.descriptor);
        let inferred = frames::analyze(&body, false)
            .with_context(|| format!("infer frames of {method}"))?;
        if body.max_stack < inferred.max_stack || body.max_locals < inferred.max_locals {
            return Err(PatchError::structural(format!(
                "{method} declares max stack {} and max locals {}, needs {} and {}",
                body.max_stack, body.max_locals, inferred.max_stack, inferred.max_locals
            )));
        }
        let at_instruction = |label: Label| {
            body.label_position(label)
                .and_then(|position| body.next_real(position))
        };
        let declared: BTreeMap<usize, &Frame> = body
            .declared_frames
            .iter()
            .filter_map(|(label, frame)| at_instruction(*label).map(|position| (position, frame)))
            .collect();
        for (label, frame) in &inferred.frames {
            let declared_frame = at_instruction(*label).and_then(|position| declared.get(&position));
            match declared_frame {
                Some(declared_frame) if frames::declared_frame_agrees(declared_frame, frame) => {}
                Some(declared_frame) => {
                    return Err(PatchError::structural(format!(
                        "{method}: declared frame {declared_frame:?} disagrees with {frame:?} at {label:?}"
                    )));
                }
                None => {
                    return Err(PatchError::structural(format!(
                        "{method}: no declared frame at merge point {label:?}"
                    )));
                }
            }
        }
        checked += 1;
    }
    Ok(checked)
}

fn code_bytes<'a>(class: &ClassFile, method: &'a MemberInfo) -> Result<Option<&'a [u8]>> {
    Ok(class
        .code_attribute_index(method)?
        .map(|index| method.attributes[index].info.as_slice()))
}

/// The output must re-parse with our reader, and with jclassfile whenever
/// jclassfile accepted the input.
fn verify_output(input: &[u8], output: &[u8]) -> Result<()> {
    ClassFile::parse(output)
        .map_err(|error| PatchError::serialization(format!("output does not re-parse: {error:#}")))?;
    if class_file::parse(input).is_ok() {
        if let Err(error) = class_file::parse(output) {
            return Err(PatchError::serialization(format!(
                "output rejected by jclassfile: {error:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ACC_BRIDGE;
    use crate::error::FailureKind;
    use crate::inject::Fragment;
    use crate::ir::{Constant, Insn};
    use crate::opcodes;
    use crate::patterns::tuning_constant::TuningConstant;
    use crate::testing::{add_method, empty_class};

    const HANDLER: &str = "com/example/Handler";

    fn limit_body(descriptor: &str, value: i32) -> MethodBody {
        MethodBody::for_test(
            "limit",
            descriptor,
            false,
            vec![
                Insn::Ldc(Constant::Int(value)),
                Insn::Simple(opcodes::IRETURN),
            ],
        )
    }

    /// `limit(String)` plus the `limit(Object)` bridge javac adds for a
    /// generic interface method.
    fn bridged_class() -> Vec<u8> {
        let mut class = empty_class(HANDLER);
        add_method(&mut class, limit_body("(Ljava/lang/String;)I", 70000));
        add_method(
            &mut class,
            MethodBody::for_test(
                "limit",
                "(Ljava/lang/Object;)I",
                false,
                vec![
                    Insn::load(opcodes::ALOAD, 0),
                    Insn::load(opcodes::ALOAD, 1),
                    Insn::Type {
                        opcode: opcodes::CHECKCAST,
                        class: "java/lang/String".to_string(),
                    },
                    Insn::invoke_virtual(HANDLER, "limit", "(Ljava/lang/String;)I"),
                    Insn::Simple(opcodes::IRETURN),
                ],
            ),
        );
        class.methods[1].access_flags |= ACC_BRIDGE | ACC_SYNTHETIC;
        class.to_bytes().expect("serialize class")
    }

    fn limit_rewriter(method_name: &str) -> MethodRewriter {
        MethodRewriter::new(
            method_name,
            None,
            TuningConstant {
                original: Constant::Int(70000),
                replacement: Constant::Int(80000),
            },
            Fragment::ConstantSubstitution {
                replacement: Constant::Int(80000),
            },
        )
    }

    #[test]
    fn target_compares_dotted_and_internal_names() {
        let target = TargetDescriptor::new("com/example/World$Inner", "addPlayer", None);

        assert_eq!("com.example.World$Inner", target.class_name());
        assert!(target.matches_class("com.example.World$Inner"));
        assert!(target.matches_class("com/example/World$Inner"));
        assert!(!target.matches_class("com.example.World"));
    }

    #[test]
    fn bridge_methods_do_not_make_the_target_ambiguous() {
        let rewrite = rewrite_class(&bridged_class(), &[limit_rewriter("limit")]).expect("rewrite");

        assert!(rewrite.applied());
        assert_eq!(1, rewrite.reports.len());
        assert_eq!("limit(Ljava/lang/String;)I", rewrite.reports[0].method);
    }

    #[test]
    fn overloads_written_by_hand_stay_ambiguous() {
        let mut class = empty_class(HANDLER);
        add_method(&mut class, limit_body("(Ljava/lang/String;)I", 70000));
        add_method(&mut class, limit_body("(I)I", 70000));
        let bytes = class.to_bytes().expect("serialize class");

        let error = rewrite_class(&bytes, &[limit_rewriter("limit")]).expect_err("ambiguous");

        assert_eq!(FailureKind::StructuralViolation, FailureKind::classify(&error));
    }

    #[test]
    fn missing_method_is_reported_as_not_found() {
        let input = bridged_class();

        let rewrite = rewrite_class(&input, &[limit_rewriter("threshold")]).expect("rewrite");

        assert!(!rewrite.applied());
        assert_eq!(input, rewrite.bytes);
        assert_eq!(MethodOutcome::PatternNotFound, rewrite.reports[0].outcome);
        assert_eq!("threshold", rewrite.reports[0].method);
    }

    #[test]
    fn prefix_selector_covers_every_lambda_but_no_bridge() {
        let mut class = empty_class(HANDLER);
        for name in ["lambda$limit$0", "lambda$limit$1", "lambda$other$2"] {
            let mut body = limit_body("()I", 70000);
            body.method_name = name.to_string();
            add_method(&mut class, body);
        }
        let mut bridge = limit_body("()I", 70000);
        bridge.method_name = "lambda$limit$bridge".to_string();
        add_method(&mut class, bridge);
        class.methods[3].access_flags |= ACC_BRIDGE;
        let bytes = class.to_bytes().expect("serialize class");
        let rewriter = MethodRewriter::prefixed(
            "lambda$limit$",
            TuningConstant {
                original: Constant::Int(70000),
                replacement: Constant::Int(80000),
            },
            Fragment::ConstantSubstitution {
                replacement: Constant::Int(80000),
            },
        );

        let rewrite = rewrite_class(&bytes, &[rewriter]).expect("rewrite");

        let methods: Vec<&str> = rewrite
            .reports
            .iter()
            .map(|report| report.method.as_str())
            .collect();
        assert_eq!(vec!["lambda$limit$0()I", "lambda$limit$1()I"], methods);
        assert!(rewrite.applied());
    }

    #[test]
    fn frame_check_covers_rewritten_methods_only() {
        let input = bridged_class();
        let output = rewrite_class(&input, &[limit_rewriter("limit")])
            .expect("rewrite")
            .bytes;

        assert_eq!(1, verify_frames(&input, &output).expect("frames agree"));
        assert_eq!(0, verify_frames(&input, &input).expect("nothing rewritten"));
    }

    #[test]
    fn frame_check_rejects_an_understated_max_stack() {
        let input = bridged_class();
        let output = rewrite_class(&input, &[limit_rewriter("limit")])
            .expect("rewrite")
            .bytes;
        let mut class = ClassFile::parse(&output).expect("parse output");
        let code = class
            .code_attribute_index(&class.methods[0])
            .expect("attributes")
            .expect("code");
        class.methods[0].attributes[code].info[..2].copy_from_slice(&0u16.to_be_bytes());
        let broken = class.to_bytes().expect("serialize class");

        let error = verify_frames(&input, &broken).expect_err("max stack too small");

        assert_eq!(FailureKind::StructuralViolation, FailureKind::classify(&error));
    }
}
