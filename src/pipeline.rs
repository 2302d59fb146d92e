use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::catalog;
use crate::config::ConfigSnapshot;
use crate::error::FailureKind;
use crate::patterns::PatternMetadata;
use crate::rewriter::{MethodOutcome, MethodRewriter, TargetDescriptor, rewrite_class};

/// Per-transformer counters, updated from any thread.
#[derive(Debug, Default)]
struct TransformerStats {
    applied: AtomicU64,
    not_found: AtomicU64,
    disabled: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of a transformer's counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub not_found: u64,
    pub disabled: u64,
    pub failed: u64,
}

/// One catalog entry: a class target plus the method rewriters patching it.
pub struct Transformer {
    name: String,
    target: TargetDescriptor,
    priority: i32,
    enabled: bool,
    rewriters: Vec<MethodRewriter>,
    /// Shared with the same-named transformer of later registries.
    stats: Arc<TransformerStats>,
}

impl Transformer {
    pub(crate) fn new(name: &str, target: TargetDescriptor, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            target,
            priority,
            enabled: true,
            rewriters: Vec::new(),
            stats: Arc::default(),
        }
    }

    pub(crate) fn with_rewriter(mut self, rewriter: MethodRewriter) -> Self {
        self.rewriters.push(rewriter);
        self
    }

    pub(crate) fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Higher runs first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Defect signatures looked for, one per method rewriter.
    pub(crate) fn patterns(&self) -> Vec<PatternMetadata> {
        self.rewriters
            .iter()
            .map(|rewriter| rewriter.matcher.metadata())
            .collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.stats.applied.load(Ordering::Relaxed),
            not_found: self.stats.not_found.load(Ordering::Relaxed),
            disabled: self.stats.disabled.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Run this transformer with the fallback guarantee: any failure or panic
    /// yields `None` and a diagnostic, never partial output.
    fn attempt(&self, class_name: &str, bytes: &[u8]) -> (Option<Vec<u8>>, Diagnostic) {
        let method = Some(match self.target.descriptor() {
            Some(descriptor) => format!("{}{descriptor}", self.target.method_name()),
            None => self.target.method_name().to_string(),
        });
        let diagnostic = |outcome: Outcome, message: String| Diagnostic {
            transformer: self.name.clone(),
            class_name: class_name.to_string(),
            method: method.clone(),
            outcome,
            message,
        };

        if !self.enabled {
            self.stats.disabled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(transformer = %self.name, class = class_name, "transformer disabled by config");
            return (
                None,
                diagnostic(Outcome::Disabled, "disabled by config".to_string()),
            );
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            rewrite_class(bytes, &self.rewriters)
        }));
        match result {
            Ok(Ok(rewrite)) => {
                let summary = rewrite
                    .reports
                    .iter()
                    .map(|report| {
                        let outcome = match report.outcome {
                            MethodOutcome::Applied => "applied",
                            MethodOutcome::PatternNotFound => "pattern not found",
                        };
                        format!("{} {}: {outcome}", report.pattern, report.method)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                if rewrite.applied() {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        transformer = %self.name,
                        class = class_name,
                        original_size = bytes.len(),
                        transformed_size = rewrite.bytes.len(),
                        "{summary}"
                    );
                    (Some(rewrite.bytes), diagnostic(Outcome::Applied, summary))
                } else {
                    self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        transformer = %self.name,
                        class = class_name,
                        "no matching instructions, class bytes unchanged: {summary}"
                    );
                    (None, diagnostic(Outcome::PatternNotFound, summary))
                }
            }
            Ok(Err(error)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let kind = FailureKind::classify(&error);
                let message = format!("{error:#}");
                if kind == FailureKind::MalformedInput {
                    tracing::warn!(
                        transformer = %self.name,
                        class = class_name,
                        kind = kind.as_str(),
                        "returning original bytecode: {message}"
                    );
                } else {
                    tracing::error!(
                        transformer = %self.name,
                        class = class_name,
                        kind = kind.as_str(),
                        "returning original bytecode: {message}"
                    );
                }
                (None, diagnostic(Outcome::Failed(kind), message))
            }
            Err(payload) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    transformer = %self.name,
                    class = class_name,
                    "transformer panicked, returning original bytecode: {message}"
                );
                (
                    None,
                    diagnostic(Outcome::Failed(FailureKind::Internal), message),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic without message".to_string()
    }
}

/// Immutable set of transformers in registration order.
#[derive(Default)]
pub struct Registry {
    transformers: Vec<Transformer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, transformer: Transformer) {
        self.transformers.push(transformer);
    }

    /// Continue the counters of same-named transformers in `previous`.
    fn carry_stats_from(&mut self, previous: &Registry) {
        for transformer in &mut self.transformers {
            if let Some(old) = previous.get(&transformer.name) {
                transformer.stats = Arc::clone(&old.stats);
            }
        }
    }

    pub fn transformers(&self) -> &[Transformer] {
        &self.transformers
    }

    pub fn get(&self, name: &str) -> Option<&Transformer> {
        self.transformers
            .iter()
            .find(|transformer| transformer.name == name)
    }

    /// Transformers targeting `class_name`, highest priority first and
    /// registration order among equals.
    pub fn select(&self, class_name: &str) -> Vec<&Transformer> {
        let mut selected: Vec<&Transformer> = self
            .transformers
            .iter()
            .filter(|transformer| transformer.target.matches_class(class_name))
            .collect();
        selected.sort_by_key(|transformer| Reverse(transformer.priority));
        selected
    }
}

/// What happened for one (class, transformer) pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Applied,
    PatternNotFound,
    Disabled,
    /// The class name is not a valid binary name; nothing was attempted.
    Rejected,
    Failed(FailureKind),
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::PatternNotFound => "pattern-not-found",
            Outcome::Disabled => "disabled",
            Outcome::Rejected => "rejected",
            Outcome::Failed(kind) => kind.as_str(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub transformer: String,
    /// Class name as presented by the host.
    pub class_name: String,
    /// `name` or `name(descriptor)` of the target method.
    pub method: Option<String>,
    pub outcome: Outcome,
    pub message: String,
}

/// Output of one pipeline call: the bytes to hand back to the host plus one
/// diagnostic per transformer invocation.
#[derive(Clone, Debug)]
pub struct TransformResult {
    pub bytes: Vec<u8>,
    pub applied: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Host-facing entry point. Never fails: the result is either a validly
/// patched class or the input bytes.
pub struct TransformerPipeline {
    registry: RwLock<Arc<Registry>>,
}

impl TransformerPipeline {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: RwLock::new(Arc::new(registry)),
        }
    }

    /// Pipeline over the built-in catalog.
    pub fn from_config(config: &ConfigSnapshot) -> Self {
        Self::new(catalog::registry(config))
    }

    /// Current registry; callers keep a consistent view while holding it.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in `registry` as is, counters included.
    pub fn replace_registry(&self, registry: Registry) {
        let mut current = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(registry);
    }

    /// Rebuild the catalog from a new configuration snapshot. Counters of
    /// transformers present before and after keep accumulating.
    pub fn reconfigure(&self, config: &ConfigSnapshot) {
        let mut registry = catalog::registry(config);
        let mut current = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registry.carry_stats_from(&current);
        *current = Arc::new(registry);
    }

    pub fn transform(&self, class_name: &str, bytes: &[u8]) -> Vec<u8> {
        self.apply(class_name, bytes).bytes
    }

    pub fn apply(&self, class_name: &str, bytes: &[u8]) -> TransformResult {
        if !is_valid_class_name(class_name) {
            tracing::warn!(class = class_name, "ignoring invalid class name");
            return TransformResult {
                bytes: bytes.to_vec(),
                applied: false,
                diagnostics: vec![Diagnostic {
                    transformer: "pipeline".to_string(),
                    class_name: class_name.to_string(),
                    method: None,
                    outcome: Outcome::Rejected,
                    message: "invalid fully-qualified class name".to_string(),
                }],
            };
        }

        let registry = self.registry();
        let mut current = bytes.to_vec();
        let mut applied = false;
        let mut diagnostics = Vec::new();
        for transformer in registry.select(class_name) {
            let (output, diagnostic) = transformer.attempt(class_name, &current);
            if let Some(output) = output {
                current = output;
                applied = true;
            }
            diagnostics.push(diagnostic);
        }
        TransformResult {
            bytes: current,
            applied,
            diagnostics,
        }
    }
}

/// Java binary name: identifier segments separated by `.` or `/`.
pub fn is_valid_class_name(class_name: &str) -> bool {
    !class_name.is_empty()
        && class_name.split(['.', '/']).all(|segment| {
            let mut chars = segment.chars();
            chars
                .next()
                .is_some_and(|first| first.is_alphabetic() || first == '_' || first == '$')
                && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        })
}
