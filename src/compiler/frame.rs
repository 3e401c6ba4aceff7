//! Two-generation frame allocation. The first generation hands every
//! distinct identifier a unique slot during the walk; the second generation
//! packs the survivors after dead-instruction elimination. Keeping the first
//! generation immutable during emission means no in-progress instruction
//! ever observes a half-finished renumbering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ast::{Id, Type};
use crate::inst::Slot;

use super::CompileError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub name: String,
    pub ty: Type,
    pub managed: bool,
}

/// Final (packed) frame layout handed to the execution engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub slots: Vec<SlotInfo>,
}

impl FrameLayout {
    pub fn size(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Default)]
pub struct Frame {
    layout1: HashMap<String, Slot>,
    /// Inverse of `layout1`; index is the slot. Also used for dumps.
    idents: Vec<Id>,
    /// frame1 -> frame2; `None` marks a slot eliminated with its instructions.
    slot_map: Vec<Option<Slot>>,
    size2: usize,
}

impl Frame {
    pub fn new() -> Frame {
        Frame::default()
    }

    /// Slot for an identifier, assigning one on first reference. The second
    /// element is true when the slot was newly created. A slot, once
    /// assigned, is never reassigned within the generation.
    pub fn slot(&mut self, id: &Id) -> (Slot, bool) {
        if let Some(&s) = self.layout1.get(&id.name) {
            return (s, false);
        }
        let s = self.idents.len();
        self.layout1.insert(id.name.clone(), s);
        self.idents.push(id.clone());
        (s, true)
    }

    pub fn size1(&self) -> usize {
        self.idents.len()
    }

    /// First-generation slots holding managed values.
    pub fn managed1(&self) -> Vec<Slot> {
        (0..self.idents.len()).filter(|&s| self.idents[s].ty.is_managed()).collect()
    }

    /// Build the second generation: keep exactly the slots marked used,
    /// preserving relative order.
    pub fn compact(&mut self, used: &[bool]) {
        debug_assert_eq!(used.len(), self.idents.len());
        self.slot_map = Vec::with_capacity(used.len());
        let mut next = 0;
        for &u in used {
            if u {
                self.slot_map.push(Some(next));
                next += 1;
            } else {
                self.slot_map.push(None);
            }
        }
        self.size2 = next;
    }

    /// Translate a first-generation slot referenced by a surviving
    /// instruction at `pos`. Hitting a removed slot means dead-code
    /// elimination and the lifetime tracker disagreed; that is fatal.
    pub fn translate(&self, slot: Slot, pos: usize) -> Result<Slot, CompileError> {
        self.slot_map
            .get(slot)
            .copied()
            .flatten()
            .ok_or(CompileError::DanglingSlot { pos, slot })
    }

    /// Translation that tolerates removed slots, for side tables whose
    /// entries simply drop out with their instructions.
    pub fn translate_opt(&self, slot: Slot) -> Option<Slot> {
        self.slot_map.get(slot).copied().flatten()
    }

    pub fn size2(&self) -> usize {
        self.size2
    }

    /// Packed layout, in second-generation order.
    pub fn layout(&self) -> FrameLayout {
        let mut slots = vec![None; self.size2];
        for (s1, id) in self.idents.iter().enumerate() {
            if let Some(Some(s2)) = self.slot_map.get(s1) {
                slots[*s2] = Some(SlotInfo {
                    name: id.name.clone(),
                    ty: id.ty,
                    managed: id.ty.is_managed(),
                });
            }
        }
        FrameLayout { slots: slots.into_iter().flatten().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Id;

    #[test]
    fn first_touch_assigns_stable_slots() {
        let mut f = Frame::new();
        let (a, new_a) = f.slot(&Id::local("a", Type::Int));
        let (b, new_b) = f.slot(&Id::local("b", Type::Str));
        let (a2, new_a2) = f.slot(&Id::local("a", Type::Int));
        assert_eq!((a, new_a), (0, true));
        assert_eq!((b, new_b), (1, true));
        assert_eq!((a2, new_a2), (0, false));
        assert_eq!(f.size1(), 2);
        assert_eq!(f.managed1(), vec![1]);
    }

    #[test]
    fn compaction_preserves_relative_order() {
        let mut f = Frame::new();
        for name in ["a", "b", "c", "d"] {
            f.slot(&Id::local(name, Type::Int));
        }
        f.compact(&[true, false, true, true]);
        assert_eq!(f.size2(), 3);
        assert_eq!(f.translate(0, 0).unwrap(), 0);
        assert_eq!(f.translate(2, 0).unwrap(), 1);
        assert_eq!(f.translate(3, 0).unwrap(), 2);
        let layout = f.layout();
        assert_eq!(
            layout.slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "c", "d"]
        );
    }

    #[test]
    fn translating_removed_slot_is_fatal() {
        let mut f = Frame::new();
        f.slot(&Id::local("a", Type::Int));
        f.slot(&Id::local("b", Type::Int));
        f.compact(&[true, false]);
        match f.translate(1, 9) {
            Err(CompileError::DanglingSlot { pos: 9, slot: 1 }) => {}
            other => panic!("expected DanglingSlot, got {other:?}"),
        }
        assert_eq!(f.translate_opt(1), None);
    }
}
