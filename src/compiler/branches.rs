//! Pending-branch bookkeeping. Each control-flow construct kind gets its own
//! stack of position lists: entering a construct pushes an empty level,
//! branch instructions that must reach "the end of this construct" record
//! their raw position in the top level, and leaving the construct drains the
//! level so the driver can patch every recorded position to the now-known
//! target. Positions resolving to the same target are patched independently;
//! there is no coalescing.

use super::CompileError;

#[derive(Debug)]
pub struct GotoSet {
    kind: &'static str,
    levels: Vec<Vec<usize>>,
}

impl GotoSet {
    pub fn new(kind: &'static str) -> GotoSet {
        GotoSet { kind, levels: Vec::new() }
    }

    pub fn push_level(&mut self) {
        self.levels.push(Vec::new());
    }

    /// Record a branch instruction's raw position in the innermost level.
    /// A record with no open level means upstream validation let a stray
    /// break/next/fallthrough through; that is fatal here.
    pub fn note(&mut self, pos: usize) -> Result<(), CompileError> {
        match self.levels.last_mut() {
            Some(level) => {
                level.push(pos);
                Ok(())
            }
            None => Err(CompileError::UnbalancedControlFlow { kind: self.kind }),
        }
    }

    /// Take the innermost level's recorded positions, keeping the level
    /// open. Used for per-arm fallthrough resolution inside a switch.
    pub fn drain_top(&mut self) -> Result<Vec<usize>, CompileError> {
        match self.levels.last_mut() {
            Some(level) => Ok(std::mem::take(level)),
            None => Err(CompileError::UnbalancedControlFlow { kind: self.kind }),
        }
    }

    /// Close the innermost level, returning every position still pending.
    pub fn pop_level(&mut self) -> Result<Vec<usize>, CompileError> {
        self.levels.pop().ok_or(CompileError::UnbalancedControlFlow { kind: self.kind })
    }

    /// All construct entries have been matched by exits.
    pub fn is_balanced(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_keeps_levels_separate() {
        let mut gs = GotoSet::new("break");
        gs.push_level();
        gs.note(3).unwrap();
        gs.push_level();
        gs.note(7).unwrap();
        assert_eq!(gs.depth(), 2);
        assert_eq!(gs.pop_level().unwrap(), vec![7]);
        assert_eq!(gs.pop_level().unwrap(), vec![3]);
        assert!(gs.is_balanced());
    }

    #[test]
    fn note_without_level_is_fatal() {
        let mut gs = GotoSet::new("next");
        match gs.note(0) {
            Err(CompileError::UnbalancedControlFlow { kind: "next" }) => {}
            other => panic!("expected UnbalancedControlFlow, got {other:?}"),
        }
    }

    #[test]
    fn pop_without_level_is_fatal() {
        let mut gs = GotoSet::new("fallthrough");
        assert!(gs.pop_level().is_err());
    }

    #[test]
    fn drain_keeps_level_open() {
        let mut gs = GotoSet::new("fallthrough");
        gs.push_level();
        gs.note(1).unwrap();
        gs.note(2).unwrap();
        assert_eq!(gs.drain_top().unwrap(), vec![1, 2]);
        assert_eq!(gs.depth(), 1);
        gs.note(9).unwrap();
        assert_eq!(gs.pop_level().unwrap(), vec![9]);
    }
}
