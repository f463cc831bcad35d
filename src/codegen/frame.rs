use crate::error::CompileError;
use crate::ir::{scope_contains, IrFunc, IrProgram};

/// Minisys machine constants: 32-bit words, 64 KiB RAM and ROM.
pub const WORD_BYTES: usize = 4;
pub const RAM_BYTES: usize = 65536;
pub const ROM_BYTES: usize = 65536;

/// General-purpose registers the allocator may hand out, in preference
/// order.
pub const USABLE_REGS: [&str; 18] = [
    "$t0", "$t1", "$t2", "$t3", "$t4", "$t5", "$t6", "$t7", "$t8", "$t9", "$s0", "$s1", "$s2",
    "$s3", "$s4", "$s5", "$s6", "$s7",
];

pub const SAVED_REGS: usize = 8; // $s0..$s7

/// Per-function stack frame shape. The layout, bottom of frame upward:
/// outgoing argument slots, local data, saved `$s` registers, then `$ra`
/// in the top word. Incoming parameters live in the caller's outgoing
/// area at `frame + 4*i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub is_leaf: bool,
    /// Total frame size in words, rounded up to even.
    pub word_size: usize,
    pub outgoing_slots: usize,
    pub local_data: usize,
    pub gprs_to_save: usize,
    pub ret_addr_words: usize,
}

impl StackFrameInfo {
    pub fn frame_bytes(&self) -> usize {
        self.word_size * WORD_BYTES
    }

    pub fn local_slot(&self, index: usize) -> usize {
        (self.outgoing_slots + index) * WORD_BYTES
    }

    pub fn saved_reg_slot(&self, index: usize) -> usize {
        (self.outgoing_slots + self.local_data + index) * WORD_BYTES
    }

    pub fn ra_slot(&self) -> usize {
        (self.word_size - 1) * WORD_BYTES
    }

    pub fn incoming_param_slot(&self, index: usize) -> usize {
        self.frame_bytes() + index * WORD_BYTES
    }

    /// `$s` registers actually preserved; the formula above can nominally
    /// exceed the eight that exist.
    pub fn saved_regs(&self) -> usize {
        self.gprs_to_save.min(SAVED_REGS)
    }
}

/// Compute the frame for one function (Aho-Sethi-Ullman activation-record
/// layout, with the sizing rules this compiler has always used).
pub fn calc_frame(program: &IrProgram, func: &IrFunc) -> Result<StackFrameInfo, CompileError> {
    let (entry, exit) = program.func_range(func).ok_or_else(|| {
        CompileError::Internal(format!("function `{}` has no entry label", func.name))
    })?;
    let body = &program.quads[entry..=exit];

    let calls: Vec<&crate::ir::Quad> = body.iter().filter(|q| q.op == "call").collect();
    let is_leaf = calls.is_empty();

    let outgoing_slots = if is_leaf {
        0
    } else {
        calls
            .iter()
            .map(|q| q.call_args().len())
            .max()
            .unwrap_or(0)
            .max(4)
    };

    let param_ids: Vec<&str> = func.params.iter().map(|p| p.id()).collect();
    let scalar_locals = program
        .vars
        .iter()
        .filter(|v| {
            scope_contains(&func.scope, &v.scope)
                && !v.is_temp()
                && !param_ids.contains(&v.id.as_str())
        })
        .count();
    let array_words: usize = program
        .arrays
        .iter()
        .filter(|a| scope_contains(&func.scope, &a.scope) && !param_ids.contains(&a.id.as_str()))
        .map(|a| a.len)
        .sum();
    let local_data = scalar_locals + array_words;

    let gprs_to_save = if func.name == "main" {
        0
    } else if local_data > 18 {
        8
    } else if local_data > 10 {
        local_data - 8
    } else {
        0
    };

    let ret_addr_words = if is_leaf { 0 } else { 1 };

    // The second gprs_to_save term reproduces the sizing this generator
    // has always produced; the extra words are dead padding.
    let mut word_size = ret_addr_words + local_data + gprs_to_save + outgoing_slots + gprs_to_save;
    if word_size % 2 != 0 {
        word_size += 1;
    }

    Ok(StackFrameInfo {
        is_leaf,
        word_size,
        outgoing_slots,
        local_data,
        gprs_to_save,
        ret_addr_words,
    })
}
