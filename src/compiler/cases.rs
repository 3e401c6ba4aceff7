//! Switch dispatch tables. Dispatch values form a small closed set of atomic
//! kinds, so each kind gets its own family of concrete maps rather than one
//! polymorphic table: numeric kinds keep numeric ordering, text-like values
//! (strings, addresses, prefixes) keep exact equality. A function may contain
//! several switches of the same kind, hence the Vec of maps per family,
//! indexed by switch occurrence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::{Type, Value};
use crate::inst::Label;

use super::CompileError;

/// Which case-map family a switch subject dispatches through. Booleans ride
/// in the signed-integer family; addresses are text-like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    Int,
    UInt,
    Double,
    Str,
}

impl CaseKind {
    pub fn of(ty: Type) -> Option<CaseKind> {
        match ty {
            Type::Bool | Type::Int => Some(CaseKind::Int),
            Type::UInt => Some(CaseKind::UInt),
            Type::Double => Some(CaseKind::Double),
            Type::Str | Type::Addr => Some(CaseKind::Str),
            Type::Table | Type::Vector | Type::Any => None,
        }
    }
}

/// Intermediary tables: values map to labels, which may not be placed yet.
/// Doubles are keyed by IEEE bit pattern so the map stays ordered; dispatch
/// is by exact equality, so the bit-level ordering is irrelevant.
#[derive(Debug, Default)]
pub struct CaseTablesBuilder {
    int: Vec<BTreeMap<i64, Label>>,
    uint: Vec<BTreeMap<u64, Label>>,
    double: Vec<BTreeMap<u64, Label>>,
    str: Vec<BTreeMap<String, Label>>,
}

impl CaseTablesBuilder {
    pub fn new() -> CaseTablesBuilder {
        CaseTablesBuilder::default()
    }

    /// Allocate the next map in `kind`'s family, returning its occurrence
    /// index within that family.
    pub fn new_table(&mut self, kind: CaseKind) -> usize {
        match kind {
            CaseKind::Int => {
                self.int.push(BTreeMap::new());
                self.int.len() - 1
            }
            CaseKind::UInt => {
                self.uint.push(BTreeMap::new());
                self.uint.len() - 1
            }
            CaseKind::Double => {
                self.double.push(BTreeMap::new());
                self.double.len() - 1
            }
            CaseKind::Str => {
                self.str.push(BTreeMap::new());
                self.str.len() - 1
            }
        }
    }

    /// Record one case value. Duplicate values are a caller contract
    /// violation; the concrete map keeps the last write.
    pub fn add(&mut self, kind: CaseKind, table: usize, value: &Value, label: Label) {
        match (kind, value) {
            (CaseKind::Int, Value::Int(i)) => {
                self.int[table].insert(*i, label);
            }
            (CaseKind::Int, Value::Bool(b)) => {
                self.int[table].insert(*b as i64, label);
            }
            (CaseKind::UInt, Value::UInt(u)) => {
                self.uint[table].insert(*u, label);
            }
            (CaseKind::Double, Value::Double(d)) => {
                self.double[table].insert(d.to_bits(), label);
            }
            (CaseKind::Str, Value::Str(s)) => {
                self.str[table].insert(s.clone(), label);
            }
            // Kind/value mismatches were rejected by the type-checker.
            _ => {}
        }
    }

    /// True if any recorded label, in any family, satisfies `pred`.
    pub fn any_label(&self, pred: impl Fn(Label) -> bool) -> bool {
        self.int
            .iter()
            .flat_map(|m| m.values())
            .chain(self.uint.iter().flat_map(|m| m.values()))
            .chain(self.double.iter().flat_map(|m| m.values()))
            .chain(self.str.iter().flat_map(|m| m.values()))
            .copied()
            .any(pred)
    }

    /// Labels recorded in one table, for reachability walks over the raw
    /// sequence before concretization.
    pub fn labels(&self, kind: CaseKind, table: usize) -> Vec<Label> {
        match kind {
            CaseKind::Int => self.int[table].values().copied().collect(),
            CaseKind::UInt => self.uint[table].values().copied().collect(),
            CaseKind::Double => self.double[table].values().copied().collect(),
            CaseKind::Str => self.str[table].values().copied().collect(),
        }
    }

    /// Convert every intermediary map one-to-one into its concrete
    /// counterpart, resolving each label to a final instruction position.
    pub fn concretize<F>(self, mut resolve: F) -> Result<CaseTables, CompileError>
    where
        F: FnMut(Label) -> Result<usize, CompileError>,
    {
        fn conv<K: Ord + Clone, F>(
            maps: Vec<BTreeMap<K, Label>>,
            resolve: &mut F,
        ) -> Result<Vec<BTreeMap<K, usize>>, CompileError>
        where
            F: FnMut(Label) -> Result<usize, CompileError>,
        {
            maps.into_iter()
                .map(|m| m.into_iter().map(|(k, l)| Ok((k, resolve(l)?))).collect())
                .collect()
        }

        Ok(CaseTables {
            int: conv(self.int, &mut resolve)?,
            uint: conv(self.uint, &mut resolve)?,
            double: conv(self.double, &mut resolve)?,
            str: conv(self.str, &mut resolve)?,
        })
    }
}

/// Concrete tables: values map to final instruction positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseTables {
    pub int: Vec<BTreeMap<i64, usize>>,
    pub uint: Vec<BTreeMap<u64, usize>>,
    pub double: Vec<BTreeMap<u64, usize>>,
    pub str: Vec<BTreeMap<String, usize>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_identity(l: Label) -> Result<usize, CompileError> {
        match l {
            Label::To(p) => Ok(p),
            _ => Err(CompileError::UnresolvedBranch { pos: 0 }),
        }
    }

    #[test]
    fn families_are_independent() {
        let mut b = CaseTablesBuilder::new();
        let i0 = b.new_table(CaseKind::Int);
        let s0 = b.new_table(CaseKind::Str);
        let i1 = b.new_table(CaseKind::Int);
        assert_eq!((i0, s0, i1), (0, 0, 1));
        b.add(CaseKind::Int, i1, &Value::Int(4), Label::To(10));
        b.add(CaseKind::Str, s0, &Value::Str("x".into()), Label::To(20));
        let t = b.concretize(resolve_identity).unwrap();
        assert_eq!(t.int[1].get(&4), Some(&10));
        assert_eq!(t.str[0].get("x"), Some(&20));
        assert!(t.int[0].is_empty());
    }

    #[test]
    fn bool_dispatch_uses_int_family() {
        let mut b = CaseTablesBuilder::new();
        let t0 = b.new_table(CaseKind::Int);
        b.add(CaseKind::Int, t0, &Value::Bool(true), Label::To(5));
        let t = b.concretize(resolve_identity).unwrap();
        assert_eq!(t.int[0].get(&1), Some(&5));
    }

    #[test]
    fn duplicate_value_is_last_write_wins() {
        let mut b = CaseTablesBuilder::new();
        let t0 = b.new_table(CaseKind::UInt);
        b.add(CaseKind::UInt, t0, &Value::UInt(9), Label::To(1));
        b.add(CaseKind::UInt, t0, &Value::UInt(9), Label::To(2));
        let t = b.concretize(resolve_identity).unwrap();
        assert_eq!(t.uint[0].get(&9), Some(&2));
    }

    #[test]
    fn pending_label_fails_concretization() {
        let mut b = CaseTablesBuilder::new();
        let t0 = b.new_table(CaseKind::Double);
        b.add(CaseKind::Double, t0, &Value::Double(1.5), Label::Pending);
        assert!(b.concretize(resolve_identity).is_err());
    }
}
