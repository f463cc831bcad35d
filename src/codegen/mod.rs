pub mod frame;
pub mod regs;

use std::collections::HashMap;

use crate::error::CompileError;
use crate::ir::{scope_contains, IrFunc, IrParam, IrProgram, Quad};

use self::frame::{calc_frame, StackFrameInfo};
use self::regs::{AddrKind, Descriptors};

/// Cost of evicting a temporary that lives nowhere else: unpayable.
const SPILL_INF: u64 = u64::MAX / 2;

macro_rules! emit {
    ($self:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $self.text.push(format!($fmt $(, $arg)*))
    };
}

struct Cur {
    name: String,
    frame: StackFrameInfo,
    array_homes: HashMap<String, String>,
}

/// Translates the quadruple program into Minisys assembly, one function at
/// a time in block order, with the Aho-Sethi-Ullman §8.6 descriptor
/// discipline.
pub struct CodeGen<'a> {
    ir: &'a IrProgram,
    text: Vec<String>,
    desc: Descriptors,
    frames: HashMap<String, StackFrameInfo>,
    cur: Option<Cur>,
}

impl<'a> CodeGen<'a> {
    pub fn new(ir: &'a IrProgram) -> CodeGen<'a> {
        CodeGen {
            ir,
            text: Vec::new(),
            desc: Descriptors::new(),
            frames: HashMap::new(),
            cur: None,
        }
    }

    pub fn compile(mut self) -> Result<String, CompileError> {
        for func in &self.ir.funcs {
            if self.ir.func_range(func).is_some() {
                self.frames
                    .insert(func.name.clone(), calc_frame(self.ir, func)?);
            }
        }

        for block in &self.ir.blocks {
            for (j, quad) in block.quads.iter().enumerate() {
                self.emit_quad(block.start + j, quad)?;
            }
            let boundary_done = matches!(
                block.quads.last().map(|q| q.op.as_str()),
                Some("j") | Some("j_false") | Some("return_void") | Some("return_expr")
                    | Some("set_label")
            );
            if !boundary_done {
                self.spill_block_end();
            }
        }

        let text = peephole(std::mem::take(&mut self.text));
        Ok(self.render(&text))
    }

    fn render(&self, text: &[String]) -> String {
        let mut lines = Vec::new();
        lines.push(".data".to_string());
        for v in self.ir.global_vars() {
            lines.push(format!("{}: .word 0x0", v.name));
        }
        for a in self.ir.global_arrays() {
            let words = vec!["0x0"; a.len.max(1)].join(", ");
            lines.push(format!("{}: .word {}", a.name, words));
        }
        lines.push(".text".to_string());
        lines.extend(text.iter().cloned());

        let mut out = String::new();
        for line in lines {
            if line.starts_with('.') || line.contains(':') {
                out.push_str(&line);
            } else {
                out.push('\t');
                out.push_str(&line);
            }
            out.push('\n');
        }
        out
    }

    // ---- descriptor-aware emission helpers ----

    fn flush_stale(&mut self) {
        for var in self.desc.stale_vars() {
            if let Some(reg) = self.desc.reg_holding(&var) {
                let home = self
                    .desc
                    .addr(&var)
                    .and_then(|a| a.bound.clone())
                    .unwrap_or_default();
                emit!(self, "sw {}, {}", reg, home);
                self.desc.note_stored(&var);
            }
        }
    }

    fn spill_block_end(&mut self) {
        self.flush_stale();
        self.desc.clear_registers();
    }

    fn quad_reads(q: &Quad) -> Vec<&str> {
        let mut reads = vec![q.arg1.as_str(), q.arg2.as_str()];
        if q.op == "call" {
            reads.extend(q.call_args());
        }
        reads
    }

    /// Is `var` read again before this procedure's exit label?
    fn referenced_later(&self, var: &str, idx: usize) -> bool {
        for q in &self.ir.quads[idx + 1..] {
            if q.op == "set_label" && q.res.ends_with("_exit") {
                return false;
            }
            if Self::quad_reads(q).contains(&var) {
                return true;
            }
        }
        false
    }

    fn eviction_cost(&self, reg: &'static str, idx: usize, q: &Quad) -> u64 {
        let mut cost = 0u64;
        for v in &self.desc.reg(reg).vars {
            if v == &q.res && !Self::quad_reads(q).contains(&v.as_str()) {
                continue; // about to be overwritten
            }
            if !self.referenced_later(v, idx) {
                continue;
            }
            let addr = match self.desc.addr(v) {
                Some(a) => a,
                None => continue,
            };
            if addr.locations.iter().any(|l| l != reg) {
                continue; // another copy exists, no store needed
            }
            if addr.bound.is_some() {
                cost += 1;
            } else {
                return SPILL_INF;
            }
        }
        cost
    }

    fn needs_store(&self, var: &str, reg: &str, idx: usize, q: &Quad) -> bool {
        if var == q.res && !Self::quad_reads(q).contains(&var) {
            return false;
        }
        if !self.referenced_later(var, idx) {
            return false;
        }
        match self.desc.addr(var) {
            Some(a) => a.bound.is_some() && !a.locations.iter().any(|l| l != reg),
            None => false,
        }
    }

    /// Aho-Sethi-Ullman register selection: reuse, else an empty register,
    /// else evict the cheapest victim (spilling what must be kept).
    fn alloc_reg(
        &mut self,
        idx: usize,
        q: &Quad,
        locked: &[&'static str],
    ) -> Result<&'static str, CompileError> {
        let empty = self
            .desc
            .usable_regs()
            .find(|(name, d)| d.vars.is_empty() && !locked.contains(name))
            .map(|(name, _)| name);
        if let Some(reg) = empty {
            return Ok(reg);
        }

        let mut best: Option<(&'static str, u64)> = None;
        let candidates: Vec<&'static str> = self
            .desc
            .usable_regs()
            .filter(|(name, _)| !locked.contains(name))
            .map(|(name, _)| name)
            .collect();
        for name in candidates {
            let cost = self.eviction_cost(name, idx, q);
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((name, cost));
            }
        }
        let (reg, cost) = best.ok_or_else(|| {
            CompileError::Internal("no usable register available".to_string())
        })?;
        if cost >= SPILL_INF {
            return Err(CompileError::Internal(
                "register pressure too high: only unspillable temporaries remain".to_string(),
            ));
        }

        let victims: Vec<String> = self.desc.reg(reg).vars.iter().cloned().collect();
        for v in victims {
            if self.needs_store(&v, reg, idx, q) {
                let home = self
                    .desc
                    .addr(&v)
                    .and_then(|a| a.bound.clone())
                    .unwrap_or_default();
                emit!(self, "sw {}, {}", reg, home);
                self.desc.note_stored(&v);
            }
        }
        self.desc.evict_all(reg);
        Ok(reg)
    }

    /// Make sure a variable's value is in a pool register, loading or
    /// transferring as needed.
    fn ensure_in_reg(
        &mut self,
        var: &str,
        idx: usize,
        q: &Quad,
        locked: &[&'static str],
    ) -> Result<&'static str, CompileError> {
        if let Some(reg) = self.desc.reg_holding(var) {
            return Ok(reg);
        }
        if self.desc.lives_in_v0(var) {
            let reg = self.alloc_reg(idx, q, locked)?;
            emit!(self, "move {}, $v0", reg);
            self.desc.take_for_result(reg, var);
            return Ok(reg);
        }
        let home = self.desc.addr(var).and_then(|a| a.bound.clone());
        match home {
            Some(home) => {
                let reg = self.alloc_reg(idx, q, locked)?;
                emit!(self, "lw {}, {}", reg, home);
                emit!(self, "nop");
                emit!(self, "nop");
                self.desc.take_for_result(reg, var);
                self.desc.note_stored(var);
                Ok(reg)
            }
            None => Err(CompileError::Internal(format!(
                "value of `{}` is not available in any location",
                var
            ))),
        }
    }

    /// `$t9` doubles as the array-base scratch register; relocate a chosen
    /// operand out of it when needed.
    fn avoid_t9(
        &mut self,
        reg: &'static str,
        idx: usize,
        q: &Quad,
        locked: &[&'static str],
    ) -> Result<&'static str, CompileError> {
        if reg != "$t9" {
            return Ok(reg);
        }
        let mut lock: Vec<&'static str> = locked.to_vec();
        lock.push("$t9");
        let replacement = self.alloc_reg(idx, q, &lock)?;
        emit!(self, "move {}, $t9", replacement);
        let vars: Vec<String> = self.desc.reg("$t9").vars.iter().cloned().collect();
        self.desc.evict_all("$t9");
        for v in &vars {
            self.desc.share_register(replacement, v);
        }
        Ok(replacement)
    }

    fn claim_t9(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let vars: Vec<String> = self.desc.reg("$t9").vars.iter().cloned().collect();
        for v in vars {
            if self.needs_store(&v, "$t9", idx, q) {
                let home = self
                    .desc
                    .addr(&v)
                    .and_then(|a| a.bound.clone())
                    .unwrap_or_default();
                emit!(self, "sw $t9, {}", home);
                self.desc.note_stored(&v);
            }
        }
        self.desc.evict_all("$t9");
        Ok(())
    }

    fn array_home(&self, array_id: &str) -> Result<String, CompileError> {
        self.cur
            .as_ref()
            .and_then(|c| c.array_homes.get(array_id).cloned())
            .ok_or_else(|| {
                CompileError::Internal(format!("array `{}` has no base address", array_id))
            })
    }

    /// Put the base address of an array into `$t9`.
    fn load_array_base(&mut self, array_id: &str, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let base = self.array_home(array_id)?;
        self.claim_t9(idx, q)?;
        if base.contains('(') {
            // A reference parameter: the slot holds the address.
            emit!(self, "lw $t9, {}", base);
            emit!(self, "nop");
            emit!(self, "nop");
        } else {
            emit!(self, "la $t9, {}", base);
        }
        Ok(())
    }

    // ---- function framing ----

    fn prologue(&mut self, func: &IrFunc) -> Result<(), CompileError> {
        let frame = self
            .frames
            .get(&func.name)
            .cloned()
            .ok_or_else(|| CompileError::Internal(format!("no frame for `{}`", func.name)))?;

        emit!(
            self,
            "{}: # {} frame, {} words",
            func.name,
            if frame.is_leaf { "leaf" } else { "non-leaf" },
            frame.word_size
        );
        emit!(self, "addiu $sp, $sp, -{}", frame.frame_bytes());
        if !frame.is_leaf {
            emit!(self, "sw $ra, {}($sp)", frame.ra_slot());
        }
        for k in 0..frame.saved_regs() {
            emit!(self, "sw $s{}, {}($sp)", k, frame.saved_reg_slot(k));
        }

        self.desc.reset(frame.gprs_to_save, func.name == "main");

        for v in self.ir.global_vars() {
            self.desc
                .bind(&v.id, AddrKind::Global, Some(format!("{}($0)", v.name)));
        }
        let mut array_homes = HashMap::new();
        for a in self.ir.global_arrays() {
            array_homes.insert(a.id.clone(), a.name.clone());
        }

        for (i, param) in func.params.iter().enumerate() {
            let slot = format!("{}($sp)", frame.incoming_param_slot(i));
            match param {
                IrParam::Scalar(id) => {
                    self.desc.bind(id, AddrKind::Stack, Some(slot.clone()));
                }
                IrParam::Array(id) => {
                    array_homes.insert(id.clone(), slot.clone());
                }
            }
            if i < 4 {
                emit!(self, "sw $a{}, {}", i, slot);
            }
        }

        let param_ids: Vec<&str> = func.params.iter().map(|p| p.id()).collect();
        let mut local_index = 0usize;
        for v in &self.ir.vars {
            if scope_contains(&func.scope, &v.scope)
                && !v.is_temp()
                && !param_ids.contains(&v.id.as_str())
            {
                let slot = format!("{}($sp)", frame.local_slot(local_index));
                self.desc.bind(&v.id, AddrKind::Stack, Some(slot));
                local_index += 1;
            }
        }

        self.cur = Some(Cur {
            name: func.name.clone(),
            frame,
            array_homes,
        });
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), CompileError> {
        let frame = self
            .cur
            .as_ref()
            .map(|c| c.frame.clone())
            .ok_or_else(|| CompileError::Internal("epilogue outside a function".to_string()))?;
        for k in 0..frame.saved_regs() {
            emit!(self, "lw $s{}, {}($sp)", k, frame.saved_reg_slot(k));
            emit!(self, "nop");
            emit!(self, "nop");
        }
        if !frame.is_leaf {
            emit!(self, "lw $ra, {}($sp)", frame.ra_slot());
            emit!(self, "nop");
            emit!(self, "nop");
        }
        emit!(self, "addiu $sp, $sp, {}", frame.frame_bytes());
        emit!(self, "jr $ra");
        emit!(self, "nop");
        Ok(())
    }

    // ---- per-quadruple emission ----

    fn emit_quad(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        match q.op.as_str() {
            "set_label" => self.emit_set_label(q),
            "j" => {
                self.spill_block_end();
                emit!(self, "j {}", q.res);
                emit!(self, "nop");
                Ok(())
            }
            "j_false" => {
                let cond = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
                self.spill_block_end();
                emit!(self, "beq {}, $zero, {}", cond, q.res);
                emit!(self, "nop");
                Ok(())
            }
            "=const" => self.emit_const(idx, q),
            "=var" => self.emit_copy(idx, q),
            "=$" => {
                let addr = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
                let val = self.ensure_in_reg(&q.arg2, idx, q, &[addr])?;
                emit!(self, "sw {}, 0({})", val, addr);
                Ok(())
            }
            "[]" => self.emit_array_read(idx, q),
            "=[]" => self.emit_array_write(idx, q),
            "call" => self.emit_call(idx, q),
            "return_expr" => {
                let e = q.arg1.clone();
                self.flush_stale();
                if let Some(reg) = self.desc.reg_holding(&e) {
                    emit!(self, "move $v0, {}", reg);
                } else if self.desc.lives_in_v0(&e) {
                    // already where it belongs
                } else {
                    let home = self
                        .desc
                        .addr(&e)
                        .and_then(|a| a.bound.clone())
                        .ok_or_else(|| {
                            CompileError::Internal(format!("returned value `{}` lost", e))
                        })?;
                    emit!(self, "lw $v0, {}", home);
                    emit!(self, "nop");
                    emit!(self, "nop");
                }
                self.epilogue()?;
                self.desc.clear_registers();
                Ok(())
            }
            "return_void" => {
                self.flush_stale();
                self.epilogue()?;
                self.desc.clear_registers();
                Ok(())
            }
            "out_asm" => {
                for line in q.arg1.lines() {
                    emit!(self, "{}", line);
                }
                Ok(())
            }
            op if crate::ir::BINARY_OPS.contains(&op) && !q.arg2.is_empty() => {
                self.emit_binary(idx, q)
            }
            op if crate::ir::UNARY_OPS.contains(&op) => self.emit_unary(idx, q),
            other => Err(CompileError::Internal(format!(
                "unknown quadruple op `{}`",
                other
            ))),
        }
    }

    fn emit_set_label(&mut self, q: &Quad) -> Result<(), CompileError> {
        if let Some(func) = self
            .ir
            .funcs
            .iter()
            .find(|f| !f.entry_label.is_empty() && f.entry_label == q.res)
        {
            let func = func.clone();
            return self.prologue(&func);
        }
        if q.res.ends_with("_exit") {
            // Procedure teardown: the epilogue was emitted by the return
            // quadruple; only descriptor state remains to deallocate.
            self.flush_stale();
            self.desc.clear_registers();
            return Ok(());
        }
        emit!(self, "{}:", q.res);
        Ok(())
    }

    fn emit_const(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let value = parse_int(&q.arg1).ok_or_else(|| {
            CompileError::Internal(format!("bad constant literal `{}`", q.arg1))
        })?;
        let reg = self.alloc_reg(idx, q, &[])?;
        self.desc.take_for_result(reg, &q.res);
        if (-32768..=32767).contains(&value) {
            emit!(self, "addiu {}, $zero, {}", reg, value);
        } else {
            let bits = value as u32;
            emit!(self, "lui {}, {}", reg, (bits >> 16) & 0xffff);
            emit!(self, "ori {}, {}, {}", reg, reg, bits & 0xffff);
        }
        Ok(())
    }

    /// `=var y, , x`: x joins y's register. Locals store through to their
    /// stack home immediately; globals are left dirty until the next call
    /// site or block end.
    fn emit_copy(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let src = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
        self.desc.share_register(src, &q.res);
        let (kind, home) = match self.desc.addr(&q.res) {
            Some(a) => (a.kind, a.bound.clone()),
            None => (AddrKind::Temp, None),
        };
        if kind == AddrKind::Stack {
            if let Some(home) = home {
                emit!(self, "sw {}, {}", src, home);
                self.desc.note_stored(&q.res);
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let ra = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
        let rb = self.ensure_in_reg(&q.arg2, idx, q, &[ra])?;
        let rt = self.alloc_reg(idx, q, &[ra, rb])?;
        self.desc.take_for_result(rt, &q.res);

        match q.op.as_str() {
            "PLUS" => emit!(self, "add {}, {}, {}", rt, ra, rb),
            "MINUS" => emit!(self, "sub {}, {}, {}", rt, ra, rb),
            "MULTIPLY" => {
                emit!(self, "mult {}, {}", ra, rb);
                emit!(self, "mflo {}", rt);
            }
            "SLASH" => {
                emit!(self, "div {}, {}", ra, rb);
                emit!(self, "mflo {}", rt);
            }
            "PERCENT" => {
                emit!(self, "div {}, {}", ra, rb);
                emit!(self, "mfhi {}", rt);
            }
            "BITAND_OP" | "AND_OP" => emit!(self, "and {}, {}, {}", rt, ra, rb),
            "BITOR_OP" | "OR_OP" => emit!(self, "or {}, {}, {}", rt, ra, rb),
            "BITXOR_OP" => emit!(self, "xor {}, {}, {}", rt, ra, rb),
            "LEFT_OP" => emit!(self, "sllv {}, {}, {}", rt, ra, rb),
            "RIGHT_OP" => emit!(self, "srlv {}, {}, {}", rt, ra, rb),
            "LT_OP" => emit!(self, "slt {}, {}, {}", rt, ra, rb),
            "GT_OP" => emit!(self, "slt {}, {}, {}", rt, rb, ra),
            "GE_OP" => {
                emit!(self, "slt {}, {}, {}", rt, ra, rb);
                emit!(self, "xori {}, {}, 1", rt, rt);
            }
            "LE_OP" => {
                emit!(self, "slt {}, {}, {}", rt, rb, ra);
                emit!(self, "xori {}, {}, 1", rt, rt);
            }
            "EQ_OP" => {
                emit!(self, "sub {}, {}, {}", rt, ra, rb);
                emit!(self, "sltu {}, $zero, {}", rt, rt);
                emit!(self, "xori {}, {}, 1", rt, rt);
            }
            "NE_OP" => emit!(self, "sub {}, {}, {}", rt, ra, rb),
            other => {
                return Err(CompileError::Internal(format!(
                    "unknown binary op `{}`",
                    other
                )))
            }
        }
        Ok(())
    }

    fn emit_unary(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let ra = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
        let rt = self.alloc_reg(idx, q, &[ra])?;
        self.desc.take_for_result(rt, &q.res);

        match q.op.as_str() {
            "MINUS" => emit!(self, "sub {}, $zero, {}", rt, ra),
            "PLUS" => emit!(self, "add {}, $zero, {}", rt, ra),
            "NOT_OP" => {
                emit!(self, "sltu {}, $zero, {}", rt, ra);
                emit!(self, "xori {}, {}, 1", rt, rt);
            }
            "BITINV_OP" => emit!(self, "nor {}, {}, $zero", rt, ra),
            "DOLLAR" => {
                emit!(self, "lw {}, 0({})", rt, ra);
                emit!(self, "nop");
                emit!(self, "nop");
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "unknown unary op `{}`",
                    other
                )))
            }
        }
        Ok(())
    }

    /// `[] arr, idx, t`: offset through `$v1`, base through `$t9`.
    fn emit_array_read(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let ri = self.ensure_in_reg(&q.arg2, idx, q, &[])?;
        let ri = self.avoid_t9(ri, idx, q, &[])?;
        emit!(self, "sll $v1, {}, 2", ri);
        self.load_array_base(&q.arg1, idx, q)?;
        emit!(self, "add $v1, $t9, $v1");

        let rt = self.alloc_reg(idx, q, &[])?;
        self.desc.take_for_result(rt, &q.res);
        emit!(self, "lw {}, 0($v1)", rt);
        emit!(self, "nop");
        emit!(self, "nop");
        Ok(())
    }

    /// `=[] idx, val, arr`: symmetrical store.
    fn emit_array_write(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        let ri = self.ensure_in_reg(&q.arg1, idx, q, &[])?;
        let ri = self.avoid_t9(ri, idx, q, &[])?;
        let rv = self.ensure_in_reg(&q.arg2, idx, q, &[ri])?;
        let rv = self.avoid_t9(rv, idx, q, &[ri])?;
        emit!(self, "sll $v1, {}, 2", ri);
        self.load_array_base(&q.res, idx, q)?;
        emit!(self, "add $v1, $t9, $v1");
        emit!(self, "sw {}, 0($v1)", rv);
        Ok(())
    }

    fn emit_call(&mut self, idx: usize, q: &Quad) -> Result<(), CompileError> {
        // Dirty globals first, so staging moves stay adjacent to the jal.
        self.flush_stale();

        let args = q.call_args();
        for (i, arg) in args.iter().enumerate() {
            let array_base = self
                .cur
                .as_ref()
                .and_then(|c| c.array_homes.get(*arg).cloned());
            let src = if self.desc.lives_in_v0(arg) {
                Some("$v0".to_string())
            } else {
                self.desc.reg_holding(arg).map(String::from)
            };

            if i < 4 {
                match (src, array_base) {
                    (Some(reg), _) => emit!(self, "move $a{}, {}", i, reg),
                    (None, Some(base)) if !base.contains('(') => {
                        emit!(self, "la $a{}, {}", i, base)
                    }
                    (None, Some(base)) => {
                        emit!(self, "lw $a{}, {}", i, base);
                        emit!(self, "nop");
                        emit!(self, "nop");
                    }
                    (None, None) => {
                        let home = self
                            .desc
                            .addr(arg)
                            .and_then(|a| a.bound.clone())
                            .ok_or_else(|| {
                                CompileError::Internal(format!("argument `{}` lost", arg))
                            })?;
                        emit!(self, "lw $a{}, {}", i, home);
                        emit!(self, "nop");
                        emit!(self, "nop");
                    }
                }
            } else {
                let slot = i * 4;
                match (src, array_base) {
                    (Some(reg), _) => emit!(self, "sw {}, {}($sp)", reg, slot),
                    (None, Some(base)) if !base.contains('(') => {
                        emit!(self, "la $v1, {}", base);
                        emit!(self, "sw $v1, {}($sp)", slot);
                    }
                    (None, Some(base)) => {
                        emit!(self, "lw $v1, {}", base);
                        emit!(self, "nop");
                        emit!(self, "nop");
                        emit!(self, "sw $v1, {}($sp)", slot);
                    }
                    (None, None) => {
                        let home = self
                            .desc
                            .addr(arg)
                            .and_then(|a| a.bound.clone())
                            .ok_or_else(|| {
                                CompileError::Internal(format!("argument `{}` lost", arg))
                            })?;
                        emit!(self, "lw $v1, {}", home);
                        emit!(self, "nop");
                        emit!(self, "nop");
                        emit!(self, "sw $v1, {}($sp)", slot);
                    }
                }
            }
        }

        emit!(self, "jal {}", q.arg1);
        emit!(self, "nop");
        self.desc.invalidate_caller_saved();

        if !q.res.is_empty() {
            let feeds_next_call = self
                .ir
                .quads
                .get(idx + 1)
                .map_or(false, |n| n.op == "call" && n.call_args().contains(&q.res.as_str()));
            if feeds_next_call {
                // Threaded straight into the next call's argument staging.
                self.desc.park_in_v0(&q.res);
            } else {
                let rt = self.alloc_reg(idx, q, &[])?;
                emit!(self, "move {}, $v0", rt);
                self.desc.take_for_result(rt, &q.res);
                let (kind, home) = match self.desc.addr(&q.res) {
                    Some(a) => (a.kind, a.bound.clone()),
                    None => (AddrKind::Temp, None),
                };
                if kind == AddrKind::Stack {
                    if let Some(home) = home {
                        emit!(self, "sw {}, {}", rt, home);
                        self.desc.note_stored(&q.res);
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_int(literal: &str) -> Option<i64> {
    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        literal.parse().ok()
    }
}

/// Instructions whose first operand is a plain destination register.
const WRITE_OPS: [&str; 24] = [
    "add", "addu", "addiu", "sub", "subu", "and", "andi", "or", "ori", "xor", "xori", "nor",
    "slt", "sltu", "sltiu", "sll", "srl", "sra", "sllv", "srlv", "lui", "lw", "la", "move",
];

fn dest_of(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(2, ' ');
    let op = parts.next()?;
    let rest = parts.next()?;
    let dest = rest.split(',').next()?.trim();
    Some((op, dest))
}

/// Move-coalescing peephole: when a `move X, Y` immediately follows the
/// instruction that wrote `Y` (and that instruction is not a `nop` or a
/// store), retarget the writer to `X` and drop the move. `move X, X`
/// disappears. Conservatively skips everything else.
pub fn peephole(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(rest) = line.strip_prefix("move ") {
            let mut ops = rest.split(',');
            let x = ops.next().map(str::trim).unwrap_or("");
            let y = ops.next().map(str::trim).unwrap_or("");
            if !x.is_empty() && x == y {
                continue;
            }
            if let Some(prev) = out.last() {
                if let Some((op, dest)) = dest_of(prev) {
                    if WRITE_OPS.contains(&op) && dest == y {
                        let rewritten = prev.replacen(y, x, 1);
                        // Retargeting a move can degenerate it.
                        if rewritten == format!("move {}, {}", x, x) {
                            out.pop();
                        } else {
                            *out.last_mut().unwrap() = rewritten;
                        }
                        continue;
                    }
                }
            }
        }
        out.push(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrArray, IrFunc, IrProgram, IrVar, MiniCType, Quad};
    use crate::irgen::partition_blocks;

    fn var(id: &str, name: &str, scope: Vec<usize>, init: bool) -> IrVar {
        IrVar {
            id: id.to_string(),
            name: name.to_string(),
            ty: MiniCType::Int,
            scope,
            initialized: init,
        }
    }

    fn func(name: &str, scope: Vec<usize>) -> IrFunc {
        IrFunc {
            name: name.to_string(),
            ret_ty: MiniCType::Int,
            params: Vec::new(),
            entry_label: format!("{}_entry", name),
            exit_label: format!("{}_exit", name),
            scope,
            has_return: true,
            is_interrupt: false,
            local_vars: Vec::new(),
            child_functions: Vec::new(),
        }
    }

    fn finish(mut program: IrProgram) -> IrProgram {
        program.blocks = partition_blocks(&program.quads);
        program
    }

    fn minimal_main() -> IrProgram {
        finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("=const", "0", "", "_var_0"),
                Quad::new("return_expr", "_var_0", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![var("_var_0", "_var_0", vec![0, 1], true)],
            arrays: Vec::new(),
            funcs: vec![func("main", vec![0, 1])],
        })
    }

    #[test]
    fn minimal_main_assembly_shape() {
        let asm = CodeGen::new(&minimal_main()).compile().unwrap();

        assert!(asm.contains(".data"));
        assert!(asm.contains(".text"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("jr $ra"));
        assert!(asm.contains("addiu $sp, $sp, -"));
        // The zero is materialized and ends up in $v0.
        assert!(asm.contains("$zero, 0"));
        assert!(asm.contains("$v0"));
    }

    #[test]
    fn prologue_and_epilogue_adjust_sp_symmetrically() {
        let asm = CodeGen::new(&minimal_main()).compile().unwrap();
        let alloc: Vec<&str> = asm
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("addiu $sp, $sp, -"))
            .collect();
        let dealloc: Vec<&str> = asm
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("addiu $sp, $sp,") && !l.contains('-'))
            .collect();
        assert_eq!(alloc.len(), 1);
        assert_eq!(dealloc.len(), 1);
        let a: i64 = alloc[0].rsplit(' ').next().unwrap().parse().unwrap();
        let d: i64 = dealloc[0].rsplit(' ').next().unwrap().parse().unwrap();
        assert_eq!(-a, d);
    }

    #[test]
    fn globals_appear_in_data_and_are_stored() {
        // int g; int main() { g = 1; return g; }
        let program = finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("=const", "1", "", "_var_1"),
                Quad::new("=var", "_var_1", "", "_var_0"),
                Quad::new("return_expr", "_var_0", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![
                var("_var_0", "g", vec![0], true),
                var("_var_1", "_var_1", vec![0, 1], true),
            ],
            arrays: Vec::new(),
            funcs: vec![func("main", vec![0, 1])],
        });
        let asm = CodeGen::new(&program).compile().unwrap();

        assert!(asm.contains("g: .word 0x0"));
        // The dirty global is flushed before the function returns.
        assert!(asm.contains("sw") && asm.contains("g($0)"));
    }

    #[test]
    fn array_access_uses_scaled_index() {
        // a[i] read: [] a, i, t
        let program = finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("=const", "3", "", "_var_1"),
                Quad::new("[]", "_arr_0", "_var_1", "_var_2"),
                Quad::new("return_expr", "_var_2", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![
                var("_var_1", "_var_1", vec![0, 1], true),
                var("_var_2", "_var_2", vec![0, 1], true),
            ],
            arrays: vec![IrArray {
                id: "_arr_0".to_string(),
                name: "a".to_string(),
                elem_ty: MiniCType::Int,
                len: 10,
                scope: vec![0],
            }],
            funcs: vec![func("main", vec![0, 1])],
        });
        let asm = CodeGen::new(&program).compile().unwrap();

        assert!(asm.contains("a: .word"));
        assert!(asm.contains("sll $v1"));
        assert!(asm.contains(", 2"));
        assert!(asm.contains("add $v1, $t9, $v1"));
        assert!(asm.contains("la $t9, a"));
    }

    #[test]
    fn every_lw_is_followed_by_delay_nops() {
        let program = minimal_main();
        let asm = CodeGen::new(&program).compile().unwrap();
        let lines: Vec<&str> = asm.lines().map(str::trim).collect();
        for (i, line) in lines.iter().enumerate() {
            if line.starts_with("lw ") {
                let next_two = &lines[i + 1..(i + 3).min(lines.len())];
                assert!(
                    next_two.iter().any(|l| *l == "nop"),
                    "lw at line {} lacks a delay nop: {:?}",
                    i,
                    next_two
                );
            }
        }
    }

    #[test]
    fn branches_carry_delay_slots() {
        let program = finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("set_label", "", "", "_label_0"),
                Quad::new("=const", "1", "", "_var_0"),
                Quad::new("j_false", "_var_0", "", "_label_1"),
                Quad::new("j", "", "", "_label_0"),
                Quad::new("set_label", "", "", "_label_1"),
                Quad::new("=const", "0", "", "_var_1"),
                Quad::new("return_expr", "_var_1", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![
                var("_var_0", "_var_0", vec![0, 1], true),
                var("_var_1", "_var_1", vec![0, 1], true),
            ],
            arrays: Vec::new(),
            funcs: vec![func("main", vec![0, 1])],
        });
        let asm = CodeGen::new(&program).compile().unwrap();
        let lines: Vec<&str> = asm.lines().map(str::trim).collect();
        for (i, line) in lines.iter().enumerate() {
            if line.starts_with("beq") || line.starts_with("j ") || line.starts_with("jal ") {
                assert_eq!(lines.get(i + 1), Some(&"nop"), "after {:?}", line);
            }
        }
        assert!(asm.contains("_label_0:"));
        assert!(asm.contains("beq"));
    }

    #[test]
    fn large_constant_uses_lui_ori() {
        let program = finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("=const", "1048576", "", "_var_0"),
                Quad::new("return_expr", "_var_0", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![var("_var_0", "_var_0", vec![0, 1], true)],
            arrays: Vec::new(),
            funcs: vec![func("main", vec![0, 1])],
        });
        let asm = CodeGen::new(&program).compile().unwrap();
        assert!(asm.contains("lui"));
        assert!(asm.contains("ori"));
    }

    #[test]
    fn call_stages_args_and_invalidates() {
        // int helper(int a); main: t = helper(5); return t;
        let mut helper = func("helper", vec![0, 2]);
        helper.params = vec![crate::ir::IrParam::Scalar("_var_9".to_string())];
        let program = finish(IrProgram {
            quads: vec![
                Quad::new("set_label", "", "", "main_entry"),
                Quad::new("=const", "5", "", "_var_0"),
                Quad::new("call", "helper", "_var_0", "_var_1"),
                Quad::new("return_expr", "_var_1", "", "main_exit"),
                Quad::new("set_label", "", "", "main_exit"),
                Quad::new("set_label", "", "", "helper_entry"),
                Quad::new("return_expr", "_var_9", "", "helper_exit"),
                Quad::new("set_label", "", "", "helper_exit"),
            ],
            blocks: Vec::new(),
            vars: vec![
                var("_var_0", "_var_0", vec![0, 1], true),
                var("_var_1", "_var_1", vec![0, 1], true),
                var("_var_9", "a", vec![0, 2], true),
            ],
            arrays: Vec::new(),
            funcs: vec![func("main", vec![0, 1]), helper],
        });
        let asm = CodeGen::new(&program).compile().unwrap();

        assert!(asm.contains("jal helper"));
        // First argument travels through $a0 one way or another.
        assert!(asm.contains("$a0"));
        // main is a non-leaf: $ra must be saved and restored.
        assert!(asm.contains("sw $ra"));
        assert!(asm.contains("lw $ra"));
    }

    #[test]
    fn peephole_coalesces_move_after_write() {
        let lines = vec![
            "add $t0, $t1, $t2".to_string(),
            "move $v0, $t0".to_string(),
        ];
        assert_eq!(peephole(lines), vec!["add $v0, $t1, $t2".to_string()]);
    }

    #[test]
    fn peephole_skips_nop_and_store() {
        let lines = vec![
            "jal f".to_string(),
            "nop".to_string(),
            "move $t0, $v0".to_string(),
        ];
        assert_eq!(peephole(lines.clone()), lines);

        let lines = vec![
            "sw $t1, 8($sp)".to_string(),
            "move $t0, $t1".to_string(),
        ];
        assert_eq!(peephole(lines.clone()), lines);
    }

    #[test]
    fn peephole_removes_self_move_and_is_idempotent() {
        let lines = vec![
            "addiu $t0, $zero, 1".to_string(),
            "move $t1, $t0".to_string(),
            "move $t1, $t1".to_string(),
            "sw $t1, 0($sp)".to_string(),
        ];
        let once = peephole(lines);
        let twice = peephole(once.clone());
        assert_eq!(once, twice);
        assert_eq!(
            once,
            vec![
                "addiu $t1, $zero, 1".to_string(),
                "sw $t1, 0($sp)".to_string(),
            ]
        );
    }

    #[test]
    fn instructions_are_indented_labels_are_not() {
        let asm = CodeGen::new(&minimal_main()).compile().unwrap();
        for line in asm.lines() {
            if line.is_empty() {
                continue;
            }
            if line.starts_with('.') || line.contains(':') {
                assert!(!line.starts_with('\t'), "directive/label indented: {:?}", line);
            } else {
                assert!(line.starts_with('\t'), "instruction not indented: {:?}", line);
            }
        }
    }
}
