//! Instruction model: opcodes, the intermediary instruction form the driver
//! emits into, and the final form handed to the execution engine.

use serde::{Deserialize, Serialize};

use crate::ast::Value;

/// A frame slot index. Raw (first-generation) and packed (second-generation)
/// slots share this type; an instruction only ever holds slots of the
/// generation matching its lifecycle state.
pub type Slot = usize;

// ── Opcodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    LoadConst,
    Move,
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
    Not,
    Neg,
    LoadGlobal,
    StoreGlobal,
    LoadCapture,
    StoreCapture,
    Call,
    CallVoid,
    Goto,
    BranchFalse,
    SwitchInt,
    SwitchUint,
    SwitchDouble,
    SwitchStr,
    InitTableIter,
    NextTableIter,
    InitStepIter,
    NextStepIter,
    Return,
    ReturnValue,
}

impl Op {
    /// Does the instruction carry a branch target?
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Goto
                | Op::BranchFalse
                | Op::SwitchInt
                | Op::SwitchUint
                | Op::SwitchDouble
                | Op::SwitchStr
                | Op::NextTableIter
                | Op::NextStepIter
        )
    }

    /// Can execution continue at the next instruction?
    pub fn falls_through(self) -> bool {
        !matches!(self, Op::Goto | Op::Return | Op::ReturnValue)
    }
}

// ── Branch labels ────────────────────────────────────────────────────

/// Reference to an instruction in the raw sequence. `Pending` is the
/// reserved placeholder for "target beyond anything compiled so far"; it is
/// overwritten when the enclosing construct closes and must never survive
/// into a finished compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    None,
    Pending,
    To(usize),
}

// ── Opaque handles ───────────────────────────────────────────────────

/// Opaque mark for "the instruction position representing this statement's
/// entry". A value type with equality/ordering only; other components use it
/// to set up branch targets without seeing instruction internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StmtMark(usize);

impl StmtMark {
    pub const NONE: StmtMark = StmtMark(usize::MAX);

    pub fn at(pos: usize) -> StmtMark {
        StmtMark(pos)
    }

    pub fn pos(self) -> Option<usize> {
        if self == StmtMark::NONE { None } else { Some(self.0) }
    }
}

/// Opaque carrier for an instruction's extra operands, so code outside the
/// instruction module can assemble multi-operand forms (call arguments,
/// iteration variables) without touching the representation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxHandle(AuxVals);

impl AuxHandle {
    pub fn new() -> AuxHandle {
        AuxHandle(AuxVals::default())
    }

    pub fn push_slot(&mut self, slot: Slot) {
        self.0.elems.push(AuxElem::Slot(slot));
    }

    pub fn push_const(&mut self, v: Value) {
        self.0.elems.push(AuxElem::Const(v));
    }

    pub fn set_func(&mut self, name: impl Into<String>) {
        self.0.func = Some(name.into());
    }

    pub(crate) fn into_aux(self) -> AuxVals {
        self.0
    }
}

impl Default for AuxHandle {
    fn default() -> Self {
        AuxHandle::new()
    }
}

// ── Auxiliary operands ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuxElem {
    Slot(Slot),
    Const(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxVals {
    pub elems: Vec<AuxElem>,
    pub func: Option<String>,
}

impl AuxVals {
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.elems.iter().filter_map(|e| match e {
            AuxElem::Slot(s) => Some(*s),
            AuxElem::Const(_) => None,
        })
    }
}

// ── Intermediary instructions ────────────────────────────────────────

/// Instruction as emitted during the walk: slot operands are first-generation,
/// the branch target may still be a placeholder, and the liveness flag is
/// settled by the finalize step.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Op,
    pub v1: Option<Slot>,
    pub v2: Option<Slot>,
    pub v3: Option<Slot>,
    pub constant: Option<Value>,
    pub target: Label,
    /// Index into a per-kind side table: global table entry, capture index,
    /// case-map occurrence, or iterator descriptor, depending on `op`.
    pub idx: Option<usize>,
    pub aux: Option<AuxVals>,
    pub live: bool,
    pub final_pos: Option<usize>,
}

impl Inst {
    pub fn new(op: Op) -> Inst {
        Inst {
            op,
            v1: None,
            v2: None,
            v3: None,
            constant: None,
            target: Label::None,
            idx: None,
            aux: None,
            live: true,
            final_pos: None,
        }
    }

    pub fn v1(mut self, s: Slot) -> Inst {
        self.v1 = Some(s);
        self
    }

    pub fn v2(mut self, s: Slot) -> Inst {
        self.v2 = Some(s);
        self
    }

    pub fn v3(mut self, s: Slot) -> Inst {
        self.v3 = Some(s);
        self
    }

    pub fn constant(mut self, v: Value) -> Inst {
        self.constant = Some(v);
        self
    }

    pub fn target(mut self, t: Label) -> Inst {
        self.target = t;
        self
    }

    pub fn idx(mut self, i: usize) -> Inst {
        self.idx = Some(i);
        self
    }

    pub fn aux(mut self, aux: AuxHandle) -> Inst {
        self.aux = Some(aux.into_aux());
        self
    }

    /// The slot this instruction writes, if it is an assignment.
    pub fn assigned_slot(&self) -> Option<Slot> {
        match self.op {
            Op::LoadConst
            | Op::Move
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::And
            | Op::Or
            | Op::Not
            | Op::Neg
            | Op::LoadGlobal
            | Op::LoadCapture
            | Op::Call
            | Op::NextStepIter => self.v1,
            _ => None,
        }
    }

    /// Slots this instruction defines (writes). Iterator advance writes all
    /// of its loop variables, carried in the aux block.
    pub fn defs(&self) -> Vec<Slot> {
        match self.op {
            Op::NextTableIter => self.aux.as_ref().map(|a| a.slots().collect()).unwrap_or_default(),
            _ => self.assigned_slot().into_iter().collect(),
        }
    }

    /// Slots this instruction reads.
    pub fn uses(&self) -> Vec<Slot> {
        let mut out = Vec::new();
        match self.op {
            Op::Move | Op::Not | Op::Neg => out.extend(self.v2),
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::And
            | Op::Or => {
                out.extend(self.v2);
                out.extend(self.v3);
            }
            Op::StoreGlobal
            | Op::StoreCapture
            | Op::BranchFalse
            | Op::SwitchInt
            | Op::SwitchUint
            | Op::SwitchDouble
            | Op::SwitchStr
            | Op::InitTableIter
            | Op::InitStepIter
            | Op::ReturnValue => out.extend(self.v1),
            Op::Call | Op::CallVoid => {
                if let Some(aux) = &self.aux {
                    out.extend(aux.slots());
                }
            }
            Op::LoadConst
            | Op::LoadGlobal
            | Op::LoadCapture
            | Op::Goto
            | Op::NextTableIter
            | Op::NextStepIter
            | Op::Return => {}
        }
        out
    }

    /// Pure assignments are the only candidates for dead-instruction
    /// elimination; everything else either branches, stores outside the
    /// frame, or may do so (calls).
    pub fn is_pure_assign(&self) -> bool {
        matches!(
            self.op,
            Op::LoadConst
                | Op::Move
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Eq
                | Op::Ne
                | Op::Lt
                | Op::Le
                | Op::Gt
                | Op::Ge
                | Op::And
                | Op::Or
                | Op::Not
                | Op::Neg
                | Op::LoadGlobal
                | Op::LoadCapture
        )
    }
}

// ── Final instructions ───────────────────────────────────────────────

/// Instruction in its final lifecycle state: slot operands are packed
/// second-generation indices and the branch target, if any, is a concrete
/// position in the final sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalInst {
    pub op: Op,
    pub v1: Option<Slot>,
    pub v2: Option<Slot>,
    pub v3: Option<Slot>,
    pub constant: Option<Value>,
    pub target: Option<usize>,
    pub idx: Option<usize>,
    pub aux: Option<AuxVals>,
}

impl std::fmt::Display for FinalInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.op)?;
        for v in [self.v1, self.v2, self.v3].into_iter().flatten() {
            write!(f, " r{v}")?;
        }
        if let Some(c) = &self.constant {
            write!(f, " {c}")?;
        }
        if let Some(i) = self.idx {
            write!(f, " #{i}")?;
        }
        if let Some(t) = self.target {
            write!(f, " -> {t}")?;
        }
        if let Some(aux) = &self.aux {
            if let Some(func) = &aux.func {
                write!(f, " {func}()")?;
            }
            for e in &aux.elems {
                match e {
                    AuxElem::Slot(s) => write!(f, " r{s}")?,
                    AuxElem::Const(v) => write!(f, " {v}")?,
                }
            }
        }
        Ok(())
    }
}
