use anyhow::Result;

use crate::descriptor::MethodShape;
use crate::ir::{Insn, MethodBody};
use crate::opcodes;
use crate::patterns::{MatchSite, PatternMatcher, PatternMetadata, is_covered};

/// Detects a void callback whose body runs without a handler for
/// `exception`, e.g. player removal failing on a reference that was
/// invalidated concurrently.
///
/// Only methods taking a `parameter` are reported, since the fallback works
/// on that argument.
pub(crate) struct UnguardedBody {
    pub(crate) exception: String,
    /// Field descriptor of the parameter, e.g. `Lcom/example/PlayerRef;`.
    pub(crate) parameter: String,
}

impl PatternMatcher for UnguardedBody {
    fn metadata(&self) -> PatternMetadata {
        PatternMetadata {
            id: "UNGUARDED_CALLBACK_BODY",
            name: "Unguarded callback body",
            description: "Callback body that lets a stale-reference exception escape",
        }
    }

    fn scan(&self, body: &MethodBody) -> Result<Option<MatchSite>> {
        let shape = MethodShape::parse(&body.descriptor)?;
        if shape.return_type.is_some() || !shape.parameters.contains(&self.parameter) {
            return Ok(None);
        }
        let Some(start) = body.next_real(0) else {
            return Ok(None);
        };
        let Some(end) = (0..body.insns.len())
            .rev()
            .find(|index| body.insns[*index].is_real())
        else {
            return Ok(None);
        };
        if body.insns[end] != Insn::Simple(opcodes::RETURN) || end <= start {
            return Ok(None);
        }
        if is_covered(body, start, &self.exception) {
            return Ok(None);
        }
        Ok(Some(MatchSite::GuardedRegion {
            start,
            end,
            spill_receiver: false,
        }))
    }
}
