use serde::{Deserialize, Serialize};

// ---- Types and identifiers ----

/// Atomic and aggregate types of the rill language, as left by the
/// type-checker. The compiler only cares about three properties: which
/// case-map family a type dispatches through, whether values of the type
/// need lifecycle management, and (for iteration) whether it is a table
/// or a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Int,
    UInt,
    Double,
    Str,
    /// Network addresses and prefixes; compared textually.
    Addr,
    Table,
    Vector,
    Any,
}

impl Type {
    /// Whether frame slots of this type hold reference-counted values the
    /// execution engine must finalize on scope exit.
    pub fn is_managed(self) -> bool {
        matches!(self, Type::Str | Type::Addr | Type::Table | Type::Vector | Type::Any)
    }
}

/// Where an identifier lives relative to the function being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Local,
    Global,
    Capture,
}

/// A resolved identifier. Name resolution happened upstream, so two `Id`s
/// with the same name always denote the same variable within one body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Id {
    pub name: String,
    pub ty: Type,
    pub scope: ScopeKind,
}

impl Id {
    pub fn local(name: impl Into<String>, ty: Type) -> Id {
        Id { name: name.into(), ty, scope: ScopeKind::Local }
    }

    pub fn global(name: impl Into<String>, ty: Type) -> Id {
        Id { name: name.into(), ty, scope: ScopeKind::Global }
    }

    pub fn capture(name: impl Into<String>, ty: Type) -> Id {
        Id { name: name.into(), ty, scope: ScopeKind::Capture }
    }
}

// ---- Constants ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::UInt(_) => Type::UInt,
            Value::Double(_) => Type::Double,
            Value::Str(_) => Type::Str,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

// ---- Reduced expressions ----
//
// The reduction pass flattens nested expression trees into temporaries, so
// by the time a body reaches the compiler every operand is either a name or
// a constant. Anything deeper is a caller contract violation.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Name(Id),
    Const(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Operand(Operand),
    Binary { op: BinOp, lhs: Operand, rhs: Operand },
    Unary { op: UnOp, operand: Operand },
    Call { func: String, args: Vec<Operand> },
}

impl Expr {
    /// True if evaluating the expression cannot be observed from outside
    /// the frame. Calls may do anything, so they never qualify.
    pub fn is_pure(&self) -> bool {
        !matches!(self, Expr::Call { .. })
    }
}

// ---- Reduced statements ----

/// One arm of a switch. An arm with no values is the default arm; an arm
/// with several values dispatches each of them to the same body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub values: Vec<Value>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Block(Vec<Stmt>),
    /// Expression evaluated for effect (a call); pure expressions at
    /// statement position were already dropped by the reduction pass.
    Expr(Expr),
    Assign { target: Id, value: Expr },
    If { cond: Operand, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    /// Iteration over a table's keys (and optionally its values).
    ForTable { loop_vars: Vec<Id>, value_var: Option<Id>, table: Id, body: Vec<Stmt> },
    /// Counted iteration over a vector.
    ForVector { loop_var: Id, vector: Id, body: Vec<Stmt> },
    Switch { subject: Id, arms: Vec<CaseArm> },
    Break,
    Next,
    Fallthrough,
    Return(Option<Operand>),
    /// An inlined callee: `return` inside the body stores to `ret_var`
    /// (when present) and branches to the end of the body.
    CatchReturn { ret_var: Option<Id>, body: Vec<Stmt> },
}
