//! The function-body compiler. Walks an already-reduced statement tree,
//! emits intermediary instructions with first-generation frame slots, and
//! runs a single finalize step: reachability + dead-store elimination,
//! frame compaction, and rewriting into the final instruction sequence with
//! every branch target and side table concretized.

pub mod branches;
pub mod cases;
pub mod frame;
pub mod lifetime;
pub mod vars;

use serde::{Deserialize, Serialize};

use crate::analysis::{Profile, Reducer, UseDefs};
use crate::ast::{BinOp, CaseArm, Expr, Id, Operand, ScopeKind, Stmt, Type, UnOp};
use crate::inst::{AuxElem, AuxHandle, AuxVals, FinalInst, Inst, Label, Op, Slot, StmtMark};

use branches::GotoSet;
use cases::{CaseKind, CaseTables, CaseTablesBuilder};
use frame::{Frame, FrameLayout};
use lifetime::Lifetimes;
use vars::{GlobalInfo, TableIterInfo, VarTables};

/// Internal-consistency failures. The compiler assumes well-formed,
/// pre-validated input, so none of these are user-facing diagnostics and
/// none are recoverable: compilation of a function is all-or-nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("unresolved branch target at instruction {pos}")]
    UnresolvedBranch { pos: usize },
    #[error("instruction {pos} references slot r{slot}, which was removed from the final frame")]
    DanglingSlot { pos: usize, slot: usize },
    #[error("control-flow stack for '{kind}' used without a matching open level")]
    UnbalancedControlFlow { kind: &'static str },
    #[error("slot r{slot} lifetime begins at {begin}, after its end at {end}")]
    LifetimeOrder { slot: usize, begin: usize, end: usize },
    #[error("body is not in reduced form: {what}")]
    NotReduced { what: String },
    #[error("analysis results incomplete: {what}")]
    MissingAnalysis { what: String },
}

/// The finished artifact for one function body, handed to the execution
/// engine as an opaque unit. All slot numbers are second-generation, all
/// branch targets are concrete positions into `insts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledBody {
    pub name: String,
    pub insts: Vec<FinalInst>,
    pub frame: FrameLayout,
    /// Slots the engine must finalize on scope exit.
    pub managed_slots: Vec<Slot>,
    pub globals: Vec<GlobalInfo>,
    pub cases: CaseTables,
    pub table_iters: Vec<TableIterInfo>,
    pub num_step_iters: usize,
    /// Settled by the cross-function finalize step; `false` until then.
    pub non_recursive: bool,
}

impl std::fmt::Display for CompiledBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nr = if self.non_recursive { ", non-recursive" } else { "" };
        writeln!(f, "{} (frame size {}{nr})", self.name, self.frame.size())?;
        for (i, s) in self.frame.slots.iter().enumerate() {
            let m = if s.managed { " managed" } else { "" };
            writeln!(f, "  r{i}: {} {:?}{m}", s.name, s.ty)?;
        }
        for (pc, inst) in self.insts.iter().enumerate() {
            writeln!(f, "  {pc:4}: {inst}")?;
        }
        for g in &self.globals {
            writeln!(f, "  global {} -> r{}", g.name, g.slot)?;
        }
        for (i, it) in self.table_iters.iter().enumerate() {
            writeln!(f, "  table-iter #{i}: vars {:?}", it.loop_var_slots)?;
        }
        if self.num_step_iters > 0 {
            writeln!(f, "  step iters: {}", self.num_step_iters)?;
        }
        Ok(())
    }
}

pub struct Compiler<'a> {
    profile: &'a Profile,
    usedefs: &'a UseDefs,
    reducer: &'a Reducer,

    /// Raw instruction sequence produced by the walk; the final sequence is
    /// built separately so dead instructions are cheap to drop.
    insts1: Vec<Inst>,

    frame: Frame,
    vars: VarTables,
    cases: CaseTablesBuilder,

    breaks: GotoSet,
    nexts: GotoSet,
    fallthroughs: GotoSet,
    catches: GotoSet,

    /// Return variables of active catch-return bodies, innermost last.
    retvars: Vec<Option<Id>>,

    /// Armed by a global/capture write: the next emitted instruction is
    /// immediately followed by the matching store-back.
    pending_global_store: Option<(usize, Slot)>,
    pending_capture_store: Option<(usize, Slot)>,

    /// Inclusive raw ranges of compiled loop bodies, for lifetime widening.
    loop_ranges: Vec<(usize, usize)>,

    temp_count: usize,
}

impl<'a> Compiler<'a> {
    pub fn compile(
        name: &str,
        body: &[Stmt],
        profile: &'a Profile,
        usedefs: &'a UseDefs,
        reducer: &'a Reducer,
    ) -> Result<CompiledBody, CompileError> {
        let mut c = Compiler {
            profile,
            usedefs,
            reducer,
            insts1: Vec::new(),
            frame: Frame::new(),
            vars: VarTables::new(),
            cases: CaseTablesBuilder::new(),
            breaks: GotoSet::new("break"),
            nexts: GotoSet::new("next"),
            fallthroughs: GotoSet::new("fallthrough"),
            catches: GotoSet::new("catch-return"),
            retvars: Vec::new(),
            pending_global_store: None,
            pending_capture_store: None,
            loop_ranges: Vec::new(),
            temp_count: 0,
        };
        c.compile_stmts(body)?;
        c.finalize(name)
    }

    // ── Emission ─────────────────────────────────────────────────────

    fn next_pos(&self) -> usize {
        self.insts1.len()
    }

    fn mark(&self) -> StmtMark {
        match self.insts1.len() {
            0 => StmtMark::NONE,
            n => StmtMark::at(n - 1),
        }
    }

    /// Append one instruction, then satisfy any armed store-back: some
    /// value-producing instructions do not know they are writing to a
    /// global or capture, so the store is appended as a follow-up rather
    /// than fused into the producer.
    fn add_inst(&mut self, inst: Inst) -> usize {
        let pos = self.insts1.len();
        self.insts1.push(inst);
        if let Some((g, slot)) = self.pending_global_store.take() {
            self.insts1.push(Inst::new(Op::StoreGlobal).v1(slot).idx(g));
        }
        if let Some((cap, slot)) = self.pending_capture_store.take() {
            self.insts1.push(Inst::new(Op::StoreCapture).v1(slot).idx(cap));
        }
        pos
    }

    fn set_target(&mut self, pos: usize, label: Label) {
        self.insts1[pos].target = label;
    }

    // ── Slot management ──────────────────────────────────────────────

    fn temp(&mut self, ty: Type) -> Slot {
        let name = format!("$t{}", self.temp_count);
        self.temp_count += 1;
        let (slot, _) = self.frame.slot(&Id::local(name, ty));
        slot
    }

    fn check_profiled(&self, id: &Id) -> Result<(), CompileError> {
        let (list, what) = match id.scope {
            ScopeKind::Global => (&self.profile.globals, "global"),
            ScopeKind::Capture => (&self.profile.captures, "capture"),
            ScopeKind::Local => return Ok(()),
        };
        if list.iter().any(|n| n == &id.name) {
            Ok(())
        } else {
            Err(CompileError::MissingAnalysis {
                what: format!("{what} '{}' absent from the function profile", id.name),
            })
        }
    }

    /// Slot for a read. Globals and captures are loaded into their slot on
    /// first touch; afterwards the frame copy (kept current by store-backs)
    /// is used directly.
    fn read_slot(&mut self, id: &Id) -> Result<Slot, CompileError> {
        self.check_profiled(id)?;
        let (slot, _) = self.frame.slot(id);
        match id.scope {
            ScopeKind::Local => {}
            ScopeKind::Global => {
                let g = self.vars.global_idx(&id.name, slot);
                if !self.vars.is_materialized(slot) {
                    self.add_inst(Inst::new(Op::LoadGlobal).v1(slot).idx(g));
                    self.vars.mark_materialized(slot);
                }
            }
            ScopeKind::Capture => {
                let c = self.vars.capture_idx(&id.name, slot);
                if !self.vars.is_materialized(slot) {
                    self.add_inst(Inst::new(Op::LoadCapture).v1(slot).idx(c));
                    self.vars.mark_materialized(slot);
                }
            }
        }
        Ok(slot)
    }

    /// Slot for a write. Registers global/capture table entries but leaves
    /// materialization to the caller: the right-hand side may still need to
    /// read the old value, so marking too early would suppress its load.
    fn write_slot(&mut self, id: &Id) -> Result<Slot, CompileError> {
        self.check_profiled(id)?;
        let (slot, _) = self.frame.slot(id);
        match id.scope {
            ScopeKind::Local => {}
            ScopeKind::Global => {
                self.vars.global_idx(&id.name, slot);
            }
            ScopeKind::Capture => {
                self.vars.capture_idx(&id.name, slot);
            }
        }
        Ok(slot)
    }

    fn arm_store(&mut self, id: &Id, slot: Slot) {
        match id.scope {
            ScopeKind::Global => {
                let g = self.vars.global_idx(&id.name, slot);
                self.pending_global_store = Some((g, slot));
            }
            ScopeKind::Capture => {
                let c = self.vars.capture_idx(&id.name, slot);
                self.pending_capture_store = Some((c, slot));
            }
            ScopeKind::Local => {}
        }
    }

    fn operand_slot(&mut self, operand: &Operand) -> Result<Slot, CompileError> {
        match operand {
            Operand::Name(id) => self.read_slot(id),
            Operand::Const(v) => {
                let t = self.temp(v.ty());
                self.add_inst(Inst::new(Op::LoadConst).v1(t).constant(v.clone()));
                Ok(t)
            }
        }
    }

    // ── Expressions ──────────────────────────────────────────────────

    /// Build the single instruction that leaves `e`'s value in `dest`,
    /// emitting any operand-materializing instructions along the way. The
    /// returned instruction is not yet emitted, so the caller can arm a
    /// store-back first; `None` means the value is already in place.
    fn expr_inst(&mut self, dest: Slot, e: &Expr) -> Result<Option<Inst>, CompileError> {
        match e {
            Expr::Operand(Operand::Const(v)) => {
                Ok(Some(Inst::new(Op::LoadConst).v1(dest).constant(v.clone())))
            }
            Expr::Operand(Operand::Name(id)) => {
                let src = self.read_slot(id)?;
                if src == dest {
                    Ok(None)
                } else {
                    Ok(Some(Inst::new(Op::Move).v1(dest).v2(src)))
                }
            }
            Expr::Unary { op, operand } => {
                if let Operand::Const(v) = operand {
                    if let Some(folded) = self.reducer.fold_unary(*op, v) {
                        return Ok(Some(Inst::new(Op::LoadConst).v1(dest).constant(folded)));
                    }
                }
                let src = self.operand_slot(operand)?;
                Ok(Some(Inst::new(unop_op(*op)).v1(dest).v2(src)))
            }
            Expr::Binary { op, lhs, rhs } => self.binary_inst(dest, *op, lhs, rhs),
            Expr::Call { func, args } => {
                let aux = self.call_aux(func, args)?;
                Ok(Some(Inst::new(Op::Call).v1(dest).aux(aux)))
            }
        }
    }

    /// Binary forms are register⊕register (`v2`,`v3`) or
    /// register⊕constant (`v2`,`constant`); a constant left operand of a
    /// non-commutative operator is materialized into a temporary.
    fn binary_inst(
        &mut self,
        dest: Slot,
        op: BinOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<Option<Inst>, CompileError> {
        let opcode = binop_op(op);
        match (lhs, rhs) {
            (Operand::Const(a), Operand::Const(b)) => {
                if let Some(folded) = self.reducer.fold_binary(op, a, b) {
                    return Ok(Some(Inst::new(Op::LoadConst).v1(dest).constant(folded)));
                }
                // Fold refused (overflow, division by zero): keep the
                // operation for the engine to trap on.
                let l = self.operand_slot(lhs)?;
                Ok(Some(Inst::new(opcode).v1(dest).v2(l).constant(b.clone())))
            }
            (Operand::Name(l), Operand::Const(b)) => {
                let l = self.read_slot(l)?;
                Ok(Some(Inst::new(opcode).v1(dest).v2(l).constant(b.clone())))
            }
            (Operand::Const(a), Operand::Name(r)) => {
                if commutes(op) {
                    let r = self.read_slot(r)?;
                    Ok(Some(Inst::new(opcode).v1(dest).v2(r).constant(a.clone())))
                } else {
                    let l = self.operand_slot(lhs)?;
                    let r = self.read_slot(r)?;
                    Ok(Some(Inst::new(opcode).v1(dest).v2(l).v3(r)))
                }
            }
            (Operand::Name(l), Operand::Name(r)) => {
                let l = self.read_slot(l)?;
                let r = self.read_slot(r)?;
                Ok(Some(Inst::new(opcode).v1(dest).v2(l).v3(r)))
            }
        }
    }

    fn call_aux(&mut self, func: &str, args: &[Operand]) -> Result<AuxHandle, CompileError> {
        let mut aux = AuxHandle::new();
        aux.set_func(func);
        for a in args {
            match a {
                Operand::Name(id) => {
                    let s = self.read_slot(id)?;
                    aux.push_slot(s);
                }
                Operand::Const(v) => aux.push_const(v.clone()),
            }
        }
        Ok(aux)
    }

    /// Value of `cond` in a slot, re-evaluated at this point. A bare name
    /// needs no instruction; anything else computes into a temporary.
    fn cond_slot(&mut self, cond: &Expr) -> Result<Slot, CompileError> {
        if let Expr::Operand(Operand::Name(id)) = cond {
            return self.read_slot(id);
        }
        let t = self.temp(Type::Bool);
        if let Some(inst) = self.expr_inst(t, cond)? {
            self.add_inst(inst);
        }
        Ok(t)
    }

    // ── Statements ───────────────────────────────────────────────────

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<StmtMark, CompileError> {
        let mut last = self.mark();
        for s in stmts {
            last = self.compile_stmt(s)?;
        }
        Ok(last)
    }

    /// Compile a sub-body that is not guaranteed to execute on every path
    /// reaching the code after it: conditional arms, loop bodies, and
    /// catch-return bodies (whose tail a converted return skips). Global and
    /// capture loads emitted inside stay valid within the sub-body but are
    /// forgotten afterwards, so every later read is dominated by its load.
    fn compile_branch_body(&mut self, stmts: &[Stmt]) -> Result<StmtMark, CompileError> {
        let snapshot = self.vars.materialized_snapshot();
        let mark = self.compile_stmts(stmts)?;
        self.vars.restore_materialized(snapshot);
        Ok(mark)
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<StmtMark, CompileError> {
        match stmt {
            Stmt::Block(stmts) => self.compile_stmts(stmts),
            Stmt::Expr(e) => self.compile_stmt_expr(e),
            Stmt::Assign { target, value } => self.compile_assign(target, value),
            Stmt::If { cond, then_body, else_body } => self.compile_if(cond, then_body, else_body),
            Stmt::While { cond, body } => self.compile_while(cond, body),
            Stmt::ForTable { loop_vars, value_var, table, body } => {
                self.compile_for_table(loop_vars, value_var.as_ref(), table, body)
            }
            Stmt::ForVector { loop_var, vector, body } => {
                self.compile_for_vector(loop_var, vector, body)
            }
            Stmt::Switch { subject, arms } => self.compile_switch(subject, arms),
            Stmt::Break => {
                let pos = self.add_inst(Inst::new(Op::Goto).target(Label::Pending));
                self.breaks.note(pos)?;
                Ok(StmtMark::at(pos))
            }
            Stmt::Next => {
                let pos = self.add_inst(Inst::new(Op::Goto).target(Label::Pending));
                self.nexts.note(pos)?;
                Ok(StmtMark::at(pos))
            }
            Stmt::Fallthrough => {
                let pos = self.add_inst(Inst::new(Op::Goto).target(Label::Pending));
                self.fallthroughs.note(pos)?;
                Ok(StmtMark::at(pos))
            }
            Stmt::Return(operand) => self.compile_return(operand.as_ref()),
            Stmt::CatchReturn { ret_var, body } => self.compile_catch_return(ret_var.as_ref(), body),
        }
    }

    fn compile_stmt_expr(&mut self, e: &Expr) -> Result<StmtMark, CompileError> {
        match e {
            Expr::Call { func, args } => {
                let aux = self.call_aux(func, args)?;
                Ok(StmtMark::at(self.add_inst(Inst::new(Op::CallVoid).aux(aux))))
            }
            // The reduction pass drops value-discarding pure expressions;
            // seeing one means the caller skipped it.
            _ => Err(CompileError::NotReduced {
                what: "pure expression at statement position".to_string(),
            }),
        }
    }

    fn compile_assign(&mut self, target: &Id, value: &Expr) -> Result<StmtMark, CompileError> {
        if self.usedefs.assignment_dead(&target.name) && value.is_pure() {
            return Ok(self.mark());
        }
        let dest = self.write_slot(target)?;
        let inst = self.expr_inst(dest, value)?;
        self.vars.mark_materialized(dest);
        match inst {
            Some(inst) => {
                self.arm_store(target, dest);
                Ok(StmtMark::at(self.add_inst(inst)))
            }
            // Self-assignment; the frame copy is already current.
            None => Ok(self.mark()),
        }
    }

    fn compile_if(
        &mut self,
        cond: &Operand,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<StmtMark, CompileError> {
        let cond_slot = self.operand_slot(cond)?;
        let skip = self.add_inst(Inst::new(Op::BranchFalse).v1(cond_slot).target(Label::Pending));
        self.compile_branch_body(then_body)?;
        if else_body.is_empty() {
            self.set_target(skip, Label::To(self.next_pos()));
        } else {
            let exit = self.add_inst(Inst::new(Op::Goto).target(Label::Pending));
            self.set_target(skip, Label::To(self.next_pos()));
            self.compile_branch_body(else_body)?;
            self.set_target(exit, Label::To(self.next_pos()));
        }
        Ok(self.mark())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<StmtMark, CompileError> {
        let loop_top = self.next_pos();
        self.breaks.push_level();
        self.nexts.push_level();

        let cond_slot = self.cond_slot(cond)?;
        let exit = self.add_inst(Inst::new(Op::BranchFalse).v1(cond_slot).target(Label::Pending));
        self.compile_branch_body(body)?;
        self.add_inst(Inst::new(Op::Goto).target(Label::To(loop_top)));

        let end = self.next_pos();
        self.set_target(exit, Label::To(end));
        for p in self.nexts.pop_level()? {
            self.set_target(p, Label::To(loop_top));
        }
        for p in self.breaks.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        self.loop_ranges.push((loop_top, end - 1));
        Ok(self.mark())
    }

    fn compile_for_table(
        &mut self,
        loop_vars: &[Id],
        value_var: Option<&Id>,
        table: &Id,
        body: &[Stmt],
    ) -> Result<StmtMark, CompileError> {
        let table_slot = self.read_slot(table)?;
        let mut var_slots = Vec::with_capacity(loop_vars.len());
        for v in loop_vars {
            var_slots.push(self.write_slot(v)?);
        }
        let value_slot = match value_var {
            Some(v) => Some(self.write_slot(v)?),
            None => None,
        };
        // The advance instruction keeps these current on every iteration.
        for &s in var_slots.iter().chain(&value_slot) {
            self.vars.mark_materialized(s);
        }
        let iter = self.vars.add_table_iter(TableIterInfo {
            loop_var_slots: var_slots.clone(),
            value_var_slot: value_slot,
        });
        self.add_inst(Inst::new(Op::InitTableIter).v1(table_slot).idx(iter));

        // The advance instruction is the loop head: `next` re-enters here.
        let loop_top = self.next_pos();
        let mut aux = AuxHandle::new();
        for &s in &var_slots {
            aux.push_slot(s);
        }
        if let Some(s) = value_slot {
            aux.push_slot(s);
        }
        let advance =
            self.add_inst(Inst::new(Op::NextTableIter).idx(iter).target(Label::Pending).aux(aux));

        self.breaks.push_level();
        self.nexts.push_level();
        self.compile_branch_body(body)?;
        self.add_inst(Inst::new(Op::Goto).target(Label::To(loop_top)));

        let end = self.next_pos();
        self.set_target(advance, Label::To(end));
        for p in self.nexts.pop_level()? {
            self.set_target(p, Label::To(loop_top));
        }
        for p in self.breaks.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        self.loop_ranges.push((loop_top, end - 1));
        Ok(self.mark())
    }

    fn compile_for_vector(
        &mut self,
        loop_var: &Id,
        vector: &Id,
        body: &[Stmt],
    ) -> Result<StmtMark, CompileError> {
        let vec_slot = self.read_slot(vector)?;
        let var_slot = self.write_slot(loop_var)?;
        self.vars.mark_materialized(var_slot);
        let iter = self.vars.add_step_iter();
        self.add_inst(Inst::new(Op::InitStepIter).v1(vec_slot).idx(iter));

        let loop_top = self.next_pos();
        let advance =
            self.add_inst(Inst::new(Op::NextStepIter).v1(var_slot).idx(iter).target(Label::Pending));

        self.breaks.push_level();
        self.nexts.push_level();
        self.compile_branch_body(body)?;
        self.add_inst(Inst::new(Op::Goto).target(Label::To(loop_top)));

        let end = self.next_pos();
        self.set_target(advance, Label::To(end));
        for p in self.nexts.pop_level()? {
            self.set_target(p, Label::To(loop_top));
        }
        for p in self.breaks.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        self.loop_ranges.push((loop_top, end - 1));
        Ok(self.mark())
    }

    fn compile_switch(&mut self, subject: &Id, arms: &[CaseArm]) -> Result<StmtMark, CompileError> {
        let subj_slot = self.read_slot(subject)?;
        let kind = CaseKind::of(subject.ty).ok_or_else(|| CompileError::NotReduced {
            what: format!("switch subject '{}' is not of atomic type", subject.name),
        })?;
        let table = self.cases.new_table(kind);
        let opcode = match kind {
            CaseKind::Int => Op::SwitchInt,
            CaseKind::UInt => Op::SwitchUint,
            CaseKind::Double => Op::SwitchDouble,
            CaseKind::Str => Op::SwitchStr,
        };
        let dispatch = self.add_inst(Inst::new(opcode).v1(subj_slot).idx(table).target(Label::Pending));

        self.breaks.push_level();
        self.fallthroughs.push_level();

        let mut default_start = None;
        for arm in arms {
            let body_start = self.next_pos();
            // Fallthroughs from the previous arm land on this body.
            for p in self.fallthroughs.drain_top()? {
                self.set_target(p, Label::To(body_start));
            }
            if arm.values.is_empty() {
                default_start = Some(body_start);
            }
            for v in &arm.values {
                self.cases.add(kind, table, v, Label::To(body_start));
            }
            self.compile_branch_body(&arm.body)?;
        }

        let end = self.next_pos();
        self.set_target(dispatch, Label::To(default_start.unwrap_or(end)));
        for p in self.fallthroughs.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        for p in self.breaks.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        Ok(self.mark())
    }

    fn compile_return(&mut self, operand: Option<&Operand>) -> Result<StmtMark, CompileError> {
        if let Some(ret_var) = self.retvars.last().cloned() {
            // Inside a catch-return body: store to the return variable (if
            // the caller uses the value) and branch to the body's end.
            if let (Some(rv), Some(op)) = (ret_var, operand) {
                self.compile_assign(&rv, &Expr::Operand(op.clone()))?;
            }
            let pos = self.add_inst(Inst::new(Op::Goto).target(Label::Pending));
            self.catches.note(pos)?;
            return Ok(StmtMark::at(pos));
        }
        let pos = match operand {
            Some(Operand::Name(id)) => {
                let s = self.read_slot(id)?;
                self.add_inst(Inst::new(Op::ReturnValue).v1(s))
            }
            Some(Operand::Const(v)) => {
                self.add_inst(Inst::new(Op::ReturnValue).constant(v.clone()))
            }
            None => self.add_inst(Inst::new(Op::Return)),
        };
        Ok(StmtMark::at(pos))
    }

    fn compile_catch_return(
        &mut self,
        ret_var: Option<&Id>,
        body: &[Stmt],
    ) -> Result<StmtMark, CompileError> {
        self.catches.push_level();
        self.retvars.push(ret_var.cloned());
        self.compile_branch_body(body)?;
        let end = self.next_pos();
        for p in self.catches.pop_level()? {
            self.set_target(p, Label::To(end));
        }
        self.retvars.pop();
        Ok(self.mark())
    }

    // ── Finalize ─────────────────────────────────────────────────────

    fn finalize(mut self, name: &str) -> Result<CompiledBody, CompileError> {
        // Bodies that can fall off the end get a synthetic return. A body
        // ending in an explicit return still needs one when any branch or
        // case label was patched to "first instruction after the body":
        // a trailing conditional whose arm returns leaves such a target.
        let end = self.insts1.len();
        let past_end = |l: Label| matches!(l, Label::To(t) if t >= end);
        let last_op = self.insts1.last().map(|i| i.op);
        if !matches!(last_op, Some(Op::Return | Op::ReturnValue))
            || self.insts1.iter().any(|i| past_end(i.target))
            || self.cases.any_label(past_end)
        {
            self.add_inst(Inst::new(Op::Return));
        }

        for gs in [&self.breaks, &self.nexts, &self.fallthroughs, &self.catches] {
            if !gs.is_balanced() {
                return Err(CompileError::UnbalancedControlFlow { kind: gs.kind() });
            }
        }

        let n = self.insts1.len();
        let reachable = self.mark_reachable()?;

        // Dead-store elimination to a fixpoint: removing a store can orphan
        // the stores feeding it. The lifetime maps are the sole arbiter.
        let mut mask = reachable;
        let lifetimes = loop {
            let lt = Lifetimes::compute(&self.insts1, self.frame.size1(), &mask, &self.loop_ranges);
            let mut changed = false;
            for (pc, inst) in self.insts1.iter().enumerate() {
                if !mask[pc] || !inst.is_pure_assign() {
                    continue;
                }
                if let Some(d) = inst.assigned_slot() {
                    if lt.never_read(d) {
                        mask[pc] = false;
                        changed = true;
                    }
                }
            }
            if !changed {
                break lt;
            }
        };
        lifetimes.validate()?;

        // Slot survival and the second-generation numbering.
        let mut used = vec![false; self.frame.size1()];
        for (pc, inst) in self.insts1.iter().enumerate() {
            if !mask[pc] {
                continue;
            }
            for s in inst.defs().into_iter().chain(inst.uses()) {
                used[s] = true;
            }
        }
        self.frame.compact(&used);

        let mut final_pos: Vec<Option<usize>> = vec![None; n];
        let mut next_fp = 0;
        for (pc, inst) in self.insts1.iter_mut().enumerate() {
            inst.live = mask[pc];
            if mask[pc] {
                inst.final_pos = Some(next_fp);
                final_pos[pc] = Some(next_fp);
                next_fp += 1;
            }
        }

        // Branches to an eliminated instruction forward to the next
        // survivor; a placeholder or past-the-end target is fatal.
        let resolve = |label: Label| -> Result<usize, CompileError> {
            let Label::To(start) = label else {
                return Err(CompileError::UnresolvedBranch { pos: n });
            };
            for fp in final_pos.iter().skip(start) {
                if let Some(p) = fp {
                    return Ok(*p);
                }
            }
            Err(CompileError::UnresolvedBranch { pos: start })
        };

        let mut insts2 = Vec::with_capacity(next_fp);
        for (pc, inst) in self.insts1.iter().enumerate() {
            if !mask[pc] {
                continue;
            }
            let target = if inst.op.is_branch() { Some(resolve(inst.target)?) } else { None };
            let aux = match &inst.aux {
                Some(a) => Some(remap_aux(a, &self.frame, pc)?),
                None => None,
            };
            insts2.push(FinalInst {
                op: inst.op,
                v1: translate_operand(&self.frame, inst.v1, pc)?,
                v2: translate_operand(&self.frame, inst.v2, pc)?,
                v3: translate_operand(&self.frame, inst.v3, pc)?,
                constant: inst.constant.clone(),
                target,
                idx: inst.idx,
                aux,
            });
        }

        let cases = std::mem::take(&mut self.cases).concretize(resolve)?;
        let vars = std::mem::take(&mut self.vars);
        let (globals, table_iters, num_step_iters) =
            vars.finalize(|s| self.frame.translate_opt(s));
        let managed_slots: Vec<Slot> =
            self.frame.managed1().into_iter().filter_map(|s| self.frame.translate_opt(s)).collect();

        Ok(CompiledBody {
            name: name.to_string(),
            insts: insts2,
            frame: self.frame.layout(),
            managed_slots,
            globals,
            cases,
            table_iters,
            num_step_iters,
            non_recursive: false,
        })
    }

    /// Forward reachability over the raw sequence, following fallthrough,
    /// branch targets, and every case label of switch dispatches. A
    /// placeholder label on a reachable instruction means a goto-set was
    /// popped without patching.
    fn mark_reachable(&self) -> Result<Vec<bool>, CompileError> {
        let n = self.insts1.len();
        let mut seen = vec![false; n];
        let mut work = vec![0usize];
        while let Some(pc) = work.pop() {
            if pc >= n || seen[pc] {
                continue;
            }
            seen[pc] = true;
            let inst = &self.insts1[pc];
            if inst.op.falls_through() {
                work.push(pc + 1);
            }
            match inst.target {
                Label::To(t) => work.push(t),
                Label::Pending => return Err(CompileError::UnresolvedBranch { pos: pc }),
                Label::None => {}
            }
            if let Some(kind) = switch_kind(inst.op) {
                if let Some(table) = inst.idx {
                    for label in self.cases.labels(kind, table) {
                        match label {
                            Label::To(t) => work.push(t),
                            Label::Pending => {
                                return Err(CompileError::UnresolvedBranch { pos: pc });
                            }
                            Label::None => {}
                        }
                    }
                }
            }
        }
        Ok(seen)
    }
}

fn translate_operand(
    frame: &Frame,
    slot: Option<Slot>,
    pos: usize,
) -> Result<Option<Slot>, CompileError> {
    slot.map(|s| frame.translate(s, pos)).transpose()
}

fn remap_aux(aux: &AuxVals, frame: &Frame, pos: usize) -> Result<AuxVals, CompileError> {
    let mut elems = Vec::with_capacity(aux.elems.len());
    for e in &aux.elems {
        elems.push(match e {
            AuxElem::Slot(s) => AuxElem::Slot(frame.translate(*s, pos)?),
            AuxElem::Const(v) => AuxElem::Const(v.clone()),
        });
    }
    Ok(AuxVals { elems, func: aux.func.clone() })
}

fn switch_kind(op: Op) -> Option<CaseKind> {
    match op {
        Op::SwitchInt => Some(CaseKind::Int),
        Op::SwitchUint => Some(CaseKind::UInt),
        Op::SwitchDouble => Some(CaseKind::Double),
        Op::SwitchStr => Some(CaseKind::Str),
        _ => None,
    }
}

fn binop_op(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
    }
}

fn unop_op(op: UnOp) -> Op {
    match op {
        UnOp::Not => Op::Not,
        UnOp::Neg => Op::Neg,
    }
}

fn commutes(op: BinOp) -> bool {
    matches!(op, BinOp::Add | BinOp::Mul | BinOp::Eq | BinOp::Ne | BinOp::And | BinOp::Or)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Id, Value};

    fn compile(body: &[Stmt]) -> CompiledBody {
        let profile = Profile::default();
        let ud = UseDefs::default();
        let rd = Reducer;
        Compiler::compile("test", body, &profile, &ud, &rd).expect("compile failed")
    }

    fn compile_with(body: &[Stmt], profile: &Profile, ud: &UseDefs) -> CompiledBody {
        Compiler::compile("test", body, profile, ud, &Reducer).expect("compile failed")
    }

    fn int_local(name: &str) -> Id {
        Id::local(name, Type::Int)
    }

    fn assign_const(name: &str, v: i64) -> Stmt {
        Stmt::Assign {
            target: int_local(name),
            value: Expr::Operand(Operand::Const(Value::Int(v))),
        }
    }

    // --- basic emission ---

    #[test]
    fn straight_line_body() {
        let body = vec![
            assign_const("x", 1),
            Stmt::Assign {
                target: int_local("y"),
                value: Expr::Binary {
                    op: BinOp::Add,
                    lhs: Operand::Name(int_local("x")),
                    rhs: Operand::Const(Value::Int(2)),
                },
            },
            Stmt::Return(Some(Operand::Name(int_local("y")))),
        ];
        let cb = compile(&body);
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::LoadConst, Op::Add, Op::ReturnValue]);
        assert_eq!(cb.frame.size(), 2);
    }

    #[test]
    fn constant_fold_through_reducer() {
        let body = vec![
            Stmt::Assign {
                target: int_local("x"),
                value: Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Operand::Const(Value::Int(6)),
                    rhs: Operand::Const(Value::Int(7)),
                },
            },
            Stmt::Return(Some(Operand::Name(int_local("x")))),
        ];
        let cb = compile(&body);
        assert_eq!(cb.insts[0].op, Op::LoadConst);
        assert_eq!(cb.insts[0].constant, Some(Value::Int(42)));
    }

    #[test]
    fn pure_statement_expression_is_contract_violation() {
        let body = vec![Stmt::Expr(Expr::Operand(Operand::Const(Value::Int(1))))];
        let err = Compiler::compile("t", &body, &Profile::default(), &UseDefs::default(), &Reducer)
            .unwrap_err();
        assert!(matches!(err, CompileError::NotReduced { .. }));
    }

    // --- dead code and frame compaction ---

    #[test]
    fn dead_store_is_eliminated_and_slot_removed() {
        let body = vec![
            assign_const("dead", 5),
            assign_const("live", 6),
            Stmt::Return(Some(Operand::Name(int_local("live")))),
        ];
        let cb = compile(&body);
        assert_eq!(cb.insts.len(), 2, "dead store should be dropped: {cb}");
        assert_eq!(cb.frame.size(), 1);
        assert_eq!(cb.frame.slots[0].name, "live");
        // Frame translation totality: every surviving operand is in range.
        for inst in &cb.insts {
            for s in [inst.v1, inst.v2, inst.v3].into_iter().flatten() {
                assert!(s < cb.frame.size());
            }
        }
    }

    #[test]
    fn cascading_dead_stores() {
        // b = a; c = b; nothing reads c: all three stores die.
        let body = vec![
            assign_const("a", 1),
            Stmt::Assign {
                target: int_local("b"),
                value: Expr::Operand(Operand::Name(int_local("a"))),
            },
            Stmt::Assign {
                target: int_local("c"),
                value: Expr::Operand(Operand::Name(int_local("b"))),
            },
            Stmt::Return(None),
        ];
        let cb = compile(&body);
        assert_eq!(cb.insts.len(), 1);
        assert_eq!(cb.insts[0].op, Op::Return);
        assert_eq!(cb.frame.size(), 0);
    }

    #[test]
    fn usedefs_suppresses_dead_assignment_emission() {
        let ud = UseDefs::with_dead_assigns(["scratch"]);
        let body = vec![assign_const("scratch", 9), Stmt::Return(None)];
        let cb = compile_with(&body, &Profile::default(), &ud);
        assert_eq!(cb.insts.len(), 1);
        assert_eq!(cb.frame.size(), 0);
    }

    #[test]
    fn unreachable_code_is_dropped_and_branches_forward() {
        let body = vec![
            Stmt::Return(None),
            assign_const("x", 1),
            Stmt::Return(Some(Operand::Name(int_local("x")))),
        ];
        let cb = compile(&body);
        assert_eq!(cb.insts.len(), 1);
        assert_eq!(cb.insts[0].op, Op::Return);
    }

    // --- globals and captures ---

    #[test]
    fn global_write_gets_store_back() {
        let g = Id::global("g", Type::Int);
        let profile = Profile { globals: vec!["g".into()], ..Default::default() };
        let body = vec![
            Stmt::Assign {
                target: g.clone(),
                value: Expr::Operand(Operand::Const(Value::Int(3))),
            },
            Stmt::Return(None),
        ];
        let cb = compile_with(&body, &profile, &UseDefs::default());
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::LoadConst, Op::StoreGlobal, Op::Return]);
        assert_eq!(cb.globals.len(), 1);
        assert_eq!(cb.globals[0].name, "g");
        assert_eq!(Some(cb.globals[0].slot), cb.insts[1].v1);
    }

    #[test]
    fn global_read_loads_once() {
        let g = Id::global("g", Type::Int);
        let profile = Profile { globals: vec!["g".into()], ..Default::default() };
        let body = vec![
            Stmt::Assign {
                target: int_local("a"),
                value: Expr::Operand(Operand::Name(g.clone())),
            },
            Stmt::Assign {
                target: int_local("b"),
                value: Expr::Operand(Operand::Name(g.clone())),
            },
            Stmt::Assign {
                target: int_local("c"),
                value: Expr::Binary {
                    op: BinOp::Add,
                    lhs: Operand::Name(int_local("a")),
                    rhs: Operand::Name(int_local("b")),
                },
            },
            Stmt::Return(Some(Operand::Name(int_local("c")))),
        ];
        let cb = compile_with(&body, &profile, &UseDefs::default());
        let loads = cb.insts.iter().filter(|i| i.op == Op::LoadGlobal).count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn unprofiled_global_is_missing_analysis() {
        let body = vec![Stmt::Assign {
            target: Id::global("mystery", Type::Int),
            value: Expr::Operand(Operand::Const(Value::Int(1))),
        }];
        let err = Compiler::compile("t", &body, &Profile::default(), &UseDefs::default(), &Reducer)
            .unwrap_err();
        assert!(matches!(err, CompileError::MissingAnalysis { .. }));
    }

    #[test]
    fn capture_write_gets_store_back() {
        let c = Id::capture("up", Type::Int);
        let profile = Profile { captures: vec!["up".into()], ..Default::default() };
        let body = vec![
            Stmt::Assign { target: c, value: Expr::Operand(Operand::Const(Value::Int(1))) },
            Stmt::Return(None),
        ];
        let cb = compile_with(&body, &profile, &UseDefs::default());
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::LoadConst, Op::StoreCapture, Op::Return]);
    }

    // --- control flow ---

    #[test]
    fn stray_break_is_unbalanced() {
        let err = Compiler::compile(
            "t",
            &[Stmt::Break],
            &Profile::default(),
            &UseDefs::default(),
            &Reducer,
        )
        .unwrap_err();
        assert_eq!(err, CompileError::UnbalancedControlFlow { kind: "break" });
    }

    #[test]
    fn catch_return_branches_to_body_end() {
        let rv = int_local("ret");
        let body = vec![
            Stmt::CatchReturn {
                ret_var: Some(rv.clone()),
                body: vec![
                    Stmt::Return(Some(Operand::Const(Value::Int(7)))),
                    assign_const("unseen", 1),
                ],
            },
            Stmt::Return(Some(Operand::Name(rv))),
        ];
        let cb = compile(&body);
        // ret = 7; goto end; return ret — the unreachable store dies.
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::LoadConst, Op::Goto, Op::ReturnValue]);
        assert_eq!(cb.insts[1].target, Some(2));
    }

    #[test]
    fn trailing_conditional_return_gets_padded() {
        // if (c) { return }  — the skip branch targets past the body's last
        // instruction, so a terminating return must be appended.
        let body = vec![Stmt::If {
            cond: Operand::Name(Id::local("c", Type::Bool)),
            then_body: vec![Stmt::Return(None)],
            else_body: vec![],
        }];
        let cb = compile(&body);
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::BranchFalse, Op::Return, Op::Return]);
        assert_eq!(cb.insts[0].target, Some(2));
    }

    #[test]
    fn trailing_empty_case_arm_targets_the_pad() {
        // A final empty arm's case label points past the last instruction.
        let body = vec![Stmt::Switch {
            subject: int_local("x"),
            arms: vec![
                CaseArm { values: vec![], body: vec![Stmt::Return(None)] },
                CaseArm { values: vec![Value::Int(1)], body: vec![] },
            ],
        }];
        let cb = compile(&body);
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::SwitchInt, Op::Return, Op::Return]);
        assert_eq!(cb.cases.int[0].get(&1), Some(&2));
    }

    #[test]
    fn conditional_first_touch_reloads_on_the_join_path() {
        // if (c) { a = g }; b = g; return b — the join path cannot rely on
        // the load emitted inside the conditional arm.
        let g = Id::global("g", Type::Int);
        let profile = Profile { globals: vec!["g".into()], ..Default::default() };
        let body = vec![
            Stmt::If {
                cond: Operand::Name(Id::local("c", Type::Bool)),
                then_body: vec![Stmt::Assign {
                    target: int_local("a"),
                    value: Expr::Operand(Operand::Name(g.clone())),
                }],
                else_body: vec![],
            },
            Stmt::Assign {
                target: int_local("b"),
                value: Expr::Operand(Operand::Name(g.clone())),
            },
            Stmt::Return(Some(Operand::Name(int_local("b")))),
        ];
        let cb = compile_with(&body, &profile, &UseDefs::default());
        let join = cb.insts[0].target.expect("skip branch target");
        assert!(
            cb.insts[join..].iter().any(|i| i.op == Op::LoadGlobal),
            "no load on the join path:\n{cb}"
        );
    }

    #[test]
    fn loop_body_first_touch_reloads_after_the_loop() {
        // while (c) { a = g }; b = g — the loop may run zero times, so the
        // read after it loads again.
        let g = Id::global("g", Type::Int);
        let profile = Profile { globals: vec!["g".into()], ..Default::default() };
        let body = vec![
            Stmt::While {
                cond: Expr::Operand(Operand::Name(Id::local("c", Type::Bool))),
                body: vec![Stmt::Assign {
                    target: int_local("a"),
                    value: Expr::Operand(Operand::Name(g.clone())),
                }],
            },
            Stmt::Assign {
                target: int_local("b"),
                value: Expr::Operand(Operand::Name(g.clone())),
            },
            Stmt::Return(Some(Operand::Name(int_local("b")))),
        ];
        let cb = compile_with(&body, &profile, &UseDefs::default());
        let loads = cb.insts.iter().filter(|i| i.op == Op::LoadGlobal).count();
        assert_eq!(loads, 2, "one load per divergent region:\n{cb}");
    }

    #[test]
    fn managed_slots_reported_in_final_numbering() {
        let body = vec![
            assign_const("n", 1),
            Stmt::Assign {
                target: Id::local("s", Type::Str),
                value: Expr::Operand(Operand::Const(Value::Str("hi".into()))),
            },
            Stmt::Return(Some(Operand::Name(Id::local("s", Type::Str)))),
        ];
        let cb = compile(&body);
        // "n" is dead, so "s" packs down to slot 0.
        assert_eq!(cb.frame.size(), 1);
        assert_eq!(cb.managed_slots, vec![0]);
    }

    #[test]
    fn void_call_keeps_argument_slots_alive() {
        let body = vec![
            assign_const("x", 3),
            Stmt::Expr(Expr::Call {
                func: "log".into(),
                args: vec![Operand::Name(int_local("x"))],
            }),
            Stmt::Return(None),
        ];
        let cb = compile(&body);
        let ops: Vec<Op> = cb.insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Op::LoadConst, Op::CallVoid, Op::Return]);
        let aux = cb.insts[1].aux.as_ref().expect("call aux");
        assert_eq!(aux.func.as_deref(), Some("log"));
        assert_eq!(aux.slots().collect::<Vec<_>>(), vec![0]);
    }
}
