//! Boundary types for the analysis passes that run before compilation.
//! The compiler consumes these as immutable, already-validated artifacts;
//! it never computes them itself.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ast::{BinOp, UnOp, Value};

/// Free-variable profile of one function: which globals and captures its
/// body touches, and which functions it calls (used for whole-program
/// recursion detection after every body has compiled).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub globals: Vec<String>,
    pub captures: Vec<String>,
    pub callees: Vec<String>,
}

/// Use-definition summary for one body. The only question the compiler
/// asks of it is "is this assignment's value ever read afterwards" — dead
/// assignments with pure right-hand sides are not emitted at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UseDefs {
    dead_assigns: HashSet<String>,
}

impl UseDefs {
    pub fn with_dead_assigns<I, S>(names: I) -> UseDefs
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UseDefs { dead_assigns: names.into_iter().map(Into::into).collect() }
    }

    pub fn assignment_dead(&self, name: &str) -> bool {
        self.dead_assigns.contains(name)
    }
}

/// Handle onto the reduction pass, kept alive through compilation for
/// on-the-fly simplification queries. Folding is best-effort: `None` means
/// "emit the instruction", never an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reducer;

impl Reducer {
    pub fn fold_binary(&self, op: BinOp, lhs: &Value, rhs: &Value) -> Option<Value> {
        use Value::*;
        match (lhs, rhs) {
            (Int(a), Int(b)) => fold_int(op, *a, *b),
            (UInt(a), UInt(b)) => fold_uint(op, *a, *b),
            (Double(a), Double(b)) => fold_double(op, *a, *b),
            (Bool(a), Bool(b)) => match op {
                BinOp::And => Some(Bool(*a && *b)),
                BinOp::Or => Some(Bool(*a || *b)),
                BinOp::Eq => Some(Bool(a == b)),
                BinOp::Ne => Some(Bool(a != b)),
                _ => None,
            },
            (Str(a), Str(b)) => match op {
                BinOp::Add => Some(Str(format!("{a}{b}"))),
                BinOp::Eq => Some(Bool(a == b)),
                BinOp::Ne => Some(Bool(a != b)),
                BinOp::Lt => Some(Bool(a < b)),
                BinOp::Le => Some(Bool(a <= b)),
                BinOp::Gt => Some(Bool(a > b)),
                BinOp::Ge => Some(Bool(a >= b)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn fold_unary(&self, op: UnOp, operand: &Value) -> Option<Value> {
        match (op, operand) {
            (UnOp::Not, Value::Bool(b)) => Some(Value::Bool(!b)),
            (UnOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int),
            (UnOp::Neg, Value::Double(d)) => Some(Value::Double(-d)),
            _ => None,
        }
    }
}

fn fold_int(op: BinOp, a: i64, b: i64) -> Option<Value> {
    use Value::{Bool, Int};
    Some(match op {
        BinOp::Add => Int(a.checked_add(b)?),
        BinOp::Sub => Int(a.checked_sub(b)?),
        BinOp::Mul => Int(a.checked_mul(b)?),
        BinOp::Div => Int(a.checked_div(b)?),
        BinOp::Mod => Int(a.checked_rem(b)?),
        BinOp::Eq => Bool(a == b),
        BinOp::Ne => Bool(a != b),
        BinOp::Lt => Bool(a < b),
        BinOp::Le => Bool(a <= b),
        BinOp::Gt => Bool(a > b),
        BinOp::Ge => Bool(a >= b),
        BinOp::And | BinOp::Or => return None,
    })
}

fn fold_uint(op: BinOp, a: u64, b: u64) -> Option<Value> {
    use Value::{Bool, UInt};
    Some(match op {
        BinOp::Add => UInt(a.checked_add(b)?),
        BinOp::Sub => UInt(a.checked_sub(b)?),
        BinOp::Mul => UInt(a.checked_mul(b)?),
        BinOp::Div => UInt(a.checked_div(b)?),
        BinOp::Mod => UInt(a.checked_rem(b)?),
        BinOp::Eq => Bool(a == b),
        BinOp::Ne => Bool(a != b),
        BinOp::Lt => Bool(a < b),
        BinOp::Le => Bool(a <= b),
        BinOp::Gt => Bool(a > b),
        BinOp::Ge => Bool(a >= b),
        BinOp::And | BinOp::Or => return None,
    })
}

fn fold_double(op: BinOp, a: f64, b: f64) -> Option<Value> {
    use Value::{Bool, Double};
    Some(match op {
        BinOp::Add => Double(a + b),
        BinOp::Sub => Double(a - b),
        BinOp::Mul => Double(a * b),
        BinOp::Div if b != 0.0 => Double(a / b),
        BinOp::Div => return None,
        BinOp::Eq => Bool(a == b),
        BinOp::Ne => Bool(a != b),
        BinOp::Lt => Bool(a < b),
        BinOp::Le => Bool(a <= b),
        BinOp::Gt => Bool(a > b),
        BinOp::Ge => Bool(a >= b),
        BinOp::Mod | BinOp::And | BinOp::Or => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_int_arithmetic() {
        let r = Reducer;
        assert_eq!(r.fold_binary(BinOp::Add, &Value::Int(2), &Value::Int(3)), Some(Value::Int(5)));
        assert_eq!(r.fold_binary(BinOp::Lt, &Value::Int(2), &Value::Int(3)), Some(Value::Bool(true)));
    }

    #[test]
    fn refuses_division_by_zero() {
        let r = Reducer;
        assert_eq!(r.fold_binary(BinOp::Div, &Value::Int(1), &Value::Int(0)), None);
        assert_eq!(r.fold_binary(BinOp::Div, &Value::Double(1.0), &Value::Double(0.0)), None);
    }

    #[test]
    fn refuses_mixed_types() {
        let r = Reducer;
        assert_eq!(r.fold_binary(BinOp::Add, &Value::Int(1), &Value::Double(2.0)), None);
    }

    #[test]
    fn dead_assign_lookup() {
        let ud = UseDefs::with_dead_assigns(["x"]);
        assert!(ud.assignment_dead("x"));
        assert!(!ud.assignment_dead("y"));
    }
}
