//! Bookkeeping for non-local storage: the deduplicated global table, the
//! capture table, and the iterator descriptors that looping constructs
//! accumulate. Entries are appended as the walk encounters them and never
//! removed mid-function; finalize remaps their slots into the packed frame.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::inst::Slot;

/// Per-global metadata handed to the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalInfo {
    pub name: String,
    pub slot: Slot,
}

/// Descriptor for one table-iteration loop: the frame slots its loop
/// variables (and optional value variable) are written into on each advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableIterInfo {
    pub loop_var_slots: Vec<Slot>,
    pub value_var_slot: Option<Slot>,
}

#[derive(Debug, Default)]
pub struct VarTables {
    globals: Vec<GlobalInfo>,
    global_index: HashMap<String, usize>, // inverse of `globals`
    captures: Vec<GlobalInfo>,
    capture_index: HashMap<String, usize>,
    /// frame1 slots whose current value is already in the frame, so a read
    /// needs no fresh load.
    materialized: HashSet<Slot>,
    table_iters: Vec<TableIterInfo>,
    num_step_iters: usize,
}

impl VarTables {
    pub fn new() -> VarTables {
        VarTables::default()
    }

    /// Table index for a global, appending an entry on first reference.
    pub fn global_idx(&mut self, name: &str, slot: Slot) -> usize {
        if let Some(&i) = self.global_index.get(name) {
            return i;
        }
        let i = self.globals.len();
        self.globals.push(GlobalInfo { name: name.to_string(), slot });
        self.global_index.insert(name.to_string(), i);
        i
    }

    pub fn capture_idx(&mut self, name: &str, slot: Slot) -> usize {
        if let Some(&i) = self.capture_index.get(name) {
            return i;
        }
        let i = self.captures.len();
        self.captures.push(GlobalInfo { name: name.to_string(), slot });
        self.capture_index.insert(name.to_string(), i);
        i
    }

    pub fn is_materialized(&self, slot: Slot) -> bool {
        self.materialized.contains(&slot)
    }

    pub fn mark_materialized(&mut self, slot: Slot) {
        self.materialized.insert(slot);
    }

    /// Snapshot of the materialization set, taken before compiling a
    /// sub-body that is not guaranteed to execute. Restoring afterwards
    /// forgets loads emitted on that path, so the code at the join point
    /// loads for itself instead of reading a possibly uninitialized slot.
    pub fn materialized_snapshot(&self) -> HashSet<Slot> {
        self.materialized.clone()
    }

    pub fn restore_materialized(&mut self, snapshot: HashSet<Slot>) {
        self.materialized = snapshot;
    }

    pub fn add_table_iter(&mut self, info: TableIterInfo) -> usize {
        self.table_iters.push(info);
        self.table_iters.len() - 1
    }

    pub fn add_step_iter(&mut self) -> usize {
        let i = self.num_step_iters;
        self.num_step_iters += 1;
        i
    }

    /// Finalized tables, with each slot pushed through the frame1->frame2
    /// translation. Globals whose every instruction was eliminated drop out
    /// with their slots; iterator slots are written by side-effecting
    /// advance instructions and therefore always survive.
    pub fn finalize<F>(self, translate: F) -> (Vec<GlobalInfo>, Vec<TableIterInfo>, usize)
    where
        F: Fn(Slot) -> Option<Slot>,
    {
        let globals = self
            .globals
            .into_iter()
            .filter_map(|g| translate(g.slot).map(|slot| GlobalInfo { name: g.name, slot }))
            .collect();
        let iters = self
            .table_iters
            .into_iter()
            .map(|it| TableIterInfo {
                loop_var_slots: it.loop_var_slots.iter().filter_map(|&s| translate(s)).collect(),
                value_var_slot: it.value_var_slot.and_then(&translate),
            })
            .collect();
        (globals, iters, self.num_step_iters)
    }
}
