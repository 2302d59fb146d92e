use anyhow::Result;

use crate::ir::{Constant, Insn, MethodBody};
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata};

/// Detects a hard-coded tuning value loaded with `ldc`.
///
/// Once the replacement value is present the method counts as patched.
pub(crate) struct TuningConstant {
    pub(crate) original: Constant,
    pub(crate) replacement: Constant,
}

impl PatternMatcher for TuningConstant {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "HARD_CODED_TUNING_CONSTANT",
            name: "Hard-coded tuning constant",
            description: "Constant replaced by a configured value",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        if self.original == self.replacement {
            return Ok(None);
        }
        let already_patched = body
            .insns
            .iter()
            .any(|insn| matches!(insn, Insn::Ldc(constant) if *constant == self.replacement));
        if already_patched {
            return Ok(None);
        }
        Ok(body
            .insns
            .iter()
            .position(|insn| matches!(insn, Insn::Ldc(constant) if *constant == self.original))
            .map(|at| MatchSite::Constant { at }))
    }
}
