//! Whole-program finalization. Individual bodies compile independently and
//! conservatively assume they may recurse; once every body is in hand, the
//! call graph settles which ones provably cannot appear twice on a call
//! stack, letting the engine skip frame save/restore for them.

use std::collections::{HashMap, HashSet};

use crate::compiler::CompiledBody;

/// One compiled function plus the call edges its profile reported.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub name: String,
    pub callees: Vec<String>,
    pub body: CompiledBody,
}

/// Settle the `non_recursive` flag on every body. A function stays
/// (potentially) recursive if it can reach itself through known callees, or
/// if any reachable callee is not in this compilation unit: an unknown
/// callee might call back in. Recomputing from scratch makes the pass
/// idempotent.
pub fn finalize_functions(funcs: &mut [FuncInfo]) {
    let index: HashMap<&str, usize> =
        funcs.iter().enumerate().map(|(i, f)| (f.name.as_str(), i)).collect();
    let flags: Vec<bool> = (0..funcs.len()).map(|i| !may_recurse(i, funcs, &index)).collect();
    for (f, non_recursive) in funcs.iter_mut().zip(flags) {
        f.body.non_recursive = non_recursive;
    }
}

fn may_recurse(start: usize, funcs: &[FuncInfo], index: &HashMap<&str, usize>) -> bool {
    let mut seen = HashSet::new();
    let mut work: Vec<&str> = funcs[start].callees.iter().map(String::as_str).collect();
    while let Some(name) = work.pop() {
        let Some(&j) = index.get(name) else {
            return true;
        };
        if j == start {
            return true;
        }
        if seen.insert(j) {
            work.extend(funcs[j].callees.iter().map(String::as_str));
        }
    }
    false
}
