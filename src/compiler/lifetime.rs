//! Per-slot lifetimes over the raw instruction sequence: first defining
//! instruction to last use, restricted to reachable instructions. Slots
//! referenced anywhere inside a loop get their lifetime widened to the whole
//! loop, so reuse across iterations stays safe and elimination never retires
//! a loop-carried value early. This is the sole input to dead-instruction
//! elimination and to deciding which slots survive into the packed frame.

use std::collections::HashMap;

use crate::inst::{Inst, Slot};

use super::CompileError;

#[derive(Debug, Default)]
pub struct Lifetimes {
    begin: Vec<Option<usize>>,
    end: Vec<Option<usize>>,
    /// Reads per slot; a slot defined but never read is a dead-store
    /// candidate regardless of how many times it is written.
    use_count: Vec<usize>,
    /// Inverse maps: instruction -> slots beginning/ending there.
    pub inst_begins: HashMap<usize, Vec<Slot>>,
    pub inst_ends: HashMap<usize, Vec<Slot>>,
}

impl Lifetimes {
    /// `mask[pc]` selects which raw instructions participate (reachable and
    /// not yet eliminated). `loops` holds inclusive raw ranges of compiled
    /// loop bodies, innermost recorded first.
    pub fn compute(
        insts: &[Inst],
        nslots: usize,
        mask: &[bool],
        loops: &[(usize, usize)],
    ) -> Lifetimes {
        let mut lt = Lifetimes {
            begin: vec![None; nslots],
            end: vec![None; nslots],
            use_count: vec![0; nslots],
            inst_begins: HashMap::new(),
            inst_ends: HashMap::new(),
        };

        for (pc, inst) in insts.iter().enumerate() {
            if !mask[pc] {
                continue;
            }
            for d in inst.defs() {
                lt.touch(d, pc);
            }
            for u in inst.uses() {
                lt.touch(u, pc);
                lt.use_count[u] += 1;
            }
        }

        // Widen across loops: any slot referenced inside [start, end] lives
        // for the whole range. An unreachable loop head masks the whole
        // range out above, so such loops contribute nothing.
        for &(start, end) in loops {
            if !mask.get(start).copied().unwrap_or(false) {
                continue;
            }
            for s in 0..nslots {
                if let (Some(b), Some(e)) = (lt.begin[s], lt.end[s]) {
                    if b <= end && e >= start {
                        lt.begin[s] = Some(b.min(start));
                        lt.end[s] = Some(e.max(end));
                    }
                }
            }
        }

        for s in 0..nslots {
            if let Some(b) = lt.begin[s] {
                lt.inst_begins.entry(b).or_default().push(s);
            }
            if let Some(e) = lt.end[s] {
                lt.inst_ends.entry(e).or_default().push(s);
            }
        }
        lt
    }

    fn touch(&mut self, slot: Slot, pc: usize) {
        self.begin[slot] = Some(self.begin[slot].map_or(pc, |b| b.min(pc)));
        self.end[slot] = Some(self.end[slot].map_or(pc, |e| e.max(pc)));
    }

    pub fn begin_of(&self, slot: Slot) -> Option<usize> {
        self.begin.get(slot).copied().flatten()
    }

    pub fn end_of(&self, slot: Slot) -> Option<usize> {
        self.end.get(slot).copied().flatten()
    }

    /// Slot appears in at least one participating instruction.
    pub fn referenced(&self, slot: Slot) -> bool {
        self.begin.get(slot).copied().flatten().is_some()
    }

    /// Slot is written but its value is never read.
    pub fn never_read(&self, slot: Slot) -> bool {
        self.referenced(slot) && self.use_count[slot] == 0
    }

    /// Invariant check: every slot's beginning precedes (or equals) its
    /// ending, loop widening included.
    pub fn validate(&self) -> Result<(), CompileError> {
        for s in 0..self.begin.len() {
            if let (Some(b), Some(e)) = (self.begin[s], self.end[s]) {
                if b > e {
                    return Err(CompileError::LifetimeOrder { slot: s, begin: b, end: e });
                }
            }
        }
        Ok(())
    }
}
