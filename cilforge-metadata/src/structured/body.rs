//! Decodes a method's IL into a form a structural differ can compare directly: metadata tokens
//! are resolved to names, branch targets are expressed as instruction-index deltas rather than
//! byte offsets, and equivalent short/long encodings of the same operation collapse to one
//! representation. Two method bodies that differ only in how the compiler happened to encode an
//! otherwise-identical operation decode to equal [`DecodedBody`] values.

use crate::raw::il::{CompoundOpCode, MethodBody, OpCode, OpCodeIterator};
use crate::structured::module::{LoadedModule, ResolvedCallTarget, ResolvedFieldTarget};
use crate::structured::names::format_type;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    pub max_stack_size: u16,
    pub init_locals: bool,
    pub locals: Vec<String>,
    pub instructions: Vec<DecodedInstruction>,
    /// Count only; the `try`/`handler` offsets are byte positions into `code` and would need the
    /// same index-delta treatment as a branch target to be comparable across two bodies, which no
    /// caller currently needs — a changed clause almost always also touches the guarded range's
    /// instructions.
    pub exception_handler_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedInstruction {
    /// An operation with no operand relevant to structural comparison (`add`, `dup`, `ret`, ...).
    Op(String),
    LoadArg(u16),
    LoadArgAddr(u16),
    StoreArg(u16),
    LoadLocal(u16),
    LoadLocalAddr(u16),
    StoreLocal(u16),
    LoadIntConst(i64),
    LoadFloatConst(f64),
    /// Target expressed as an instruction-index delta from this instruction, not a byte offset.
    Branch { mnemonic: String, target: isize },
    Switch(Vec<isize>),
    Call { mnemonic: String, target: ResolvedCallTarget },
    Field { mnemonic: String, target: ResolvedFieldTarget },
    Type { mnemonic: String, name: String },
    LoadString(String),
    /// Anything not given dedicated treatment above; `operand` carries a raw numeric operand
    /// (metadata token, flags bitmask, ...) when one exists.
    Raw { mnemonic: String, operand: Option<i64> },
}

/// Strips the `"OpCode::"` prefix and any parenthesized operand from an `OpCode`/`CompoundOpCode`
/// `Debug` rendering, leaving the bare mnemonic (`ldc_i4_s(0x2A)` -> `ldc_i4_s`).
fn bare_mnemonic(debug: &str) -> String {
    let s = debug.strip_prefix("OpCode::").unwrap_or(debug);
    match s.find('(') {
        Some(idx) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

pub fn decode<'l>(module: &LoadedModule, body: &MethodBody<'l>) -> DecodedBody {
    let mut offsets = Vec::new();
    let mut ops: Vec<OpCode<'l>> = Vec::new();
    for (offset, result) in OpCodeIterator::new(body.code) {
        match result {
            Ok(op) => {
                offsets.push(offset);
                ops.push(op);
            },
            // Stop decoding rather than propagating: a malformed tail is surfaced as a truncated
            // instruction stream, which will simply never compare equal to a well-formed one.
            Err(_) => break,
        }
    }

    let instructions = (0..ops.len())
        .map(|i| {
            let end_offset = match offsets.get(i + 1) {
                Some(next) => *next,
                None => body.code.len() as u64,
            };
            convert(module, &ops[i], i, end_offset, &offsets)
        })
        .collect();

    DecodedBody {
        max_stack_size: body.max_stack_size,
        init_locals: body.init_locals,
        locals: body.locals.iter().map(|l| format_type(&l.as_tags_tree(), module)).collect(),
        instructions,
        exception_handler_count: body.exception_clauses.len(),
    }
}

fn branch_delta(offsets: &[u64], end_offset: u64, relative: i64, current_index: usize) -> isize {
    let target = (end_offset as i64 + relative) as u64;
    let target_index = offsets.binary_search(&target).unwrap_or(offsets.len());
    target_index as isize - current_index as isize
}

fn convert(module: &LoadedModule, op: &OpCode<'_>, index: usize, end_offset: u64, offsets: &[u64]) -> DecodedInstruction {
    use OpCode::*;
    match op {
        ldarg_0 => DecodedInstruction::LoadArg(0),
        ldarg_1 => DecodedInstruction::LoadArg(1),
        ldarg_2 => DecodedInstruction::LoadArg(2),
        ldarg_3 => DecodedInstruction::LoadArg(3),
        ldarg_s(i) => DecodedInstruction::LoadArg(*i as u16),
        ldarga_s(i) => DecodedInstruction::LoadArgAddr(*i as u16),
        starg_s(i) => DecodedInstruction::StoreArg(*i as u16),
        ldloc_0 => DecodedInstruction::LoadLocal(0),
        ldloc_1 => DecodedInstruction::LoadLocal(1),
        ldloc_2 => DecodedInstruction::LoadLocal(2),
        ldloc_3 => DecodedInstruction::LoadLocal(3),
        ldloc_s(i) => DecodedInstruction::LoadLocal(*i as u16),
        ldloca_s(i) => DecodedInstruction::LoadLocalAddr(*i as u16),
        stloc_0 => DecodedInstruction::StoreLocal(0),
        stloc_1 => DecodedInstruction::StoreLocal(1),
        stloc_2 => DecodedInstruction::StoreLocal(2),
        stloc_3 => DecodedInstruction::StoreLocal(3),
        stloc_s(i) => DecodedInstruction::StoreLocal(*i as u16),

        ldc_i4_m1 => DecodedInstruction::LoadIntConst(-1),
        ldc_i4_0 => DecodedInstruction::LoadIntConst(0),
        ldc_i4_1 => DecodedInstruction::LoadIntConst(1),
        ldc_i4_2 => DecodedInstruction::LoadIntConst(2),
        ldc_i4_3 => DecodedInstruction::LoadIntConst(3),
        ldc_i4_4 => DecodedInstruction::LoadIntConst(4),
        ldc_i4_5 => DecodedInstruction::LoadIntConst(5),
        ldc_i4_6 => DecodedInstruction::LoadIntConst(6),
        ldc_i4_7 => DecodedInstruction::LoadIntConst(7),
        ldc_i4_8 => DecodedInstruction::LoadIntConst(8),
        ldc_i4_s(v) => DecodedInstruction::LoadIntConst((*v as i8) as i64),
        ldc_i4(v) => DecodedInstruction::LoadIntConst(*v as i64),
        ldc_i8(v) => DecodedInstruction::LoadIntConst(*v),
        ldc_r4(v) => DecodedInstruction::LoadFloatConst(*v as f64),
        ldc_r8(v) => DecodedInstruction::LoadFloatConst(*v),

        br_s(v) => branch("br", offsets, end_offset, *v as i64, index),
        brfalse_s(v) => branch("brfalse", offsets, end_offset, *v as i64, index),
        brtrue_s(v) => branch("brtrue", offsets, end_offset, *v as i64, index),
        beq_s(v) => branch("beq", offsets, end_offset, *v as i64, index),
        bge_s(v) => branch("bge", offsets, end_offset, *v as i64, index),
        bgt_s(v) => branch("bgt", offsets, end_offset, *v as i64, index),
        ble_s(v) => branch("ble", offsets, end_offset, *v as i64, index),
        blt_s(v) => branch("blt", offsets, end_offset, *v as i64, index),
        bne_un_s(v) => branch("bne_un", offsets, end_offset, *v as i64, index),
        bge_un_s(v) => branch("bge_un", offsets, end_offset, *v as i64, index),
        bgt_un_s(v) => branch("bgt_un", offsets, end_offset, *v as i64, index),
        ble_un_s(v) => branch("ble_un", offsets, end_offset, *v as i64, index),
        blt_un_s(v) => branch("blt_un", offsets, end_offset, *v as i64, index),
        leave_s(v) => branch("leave", offsets, end_offset, *v as i64, index),
        br(v) => branch("br", offsets, end_offset, *v as i64, index),
        brfalse(v) => branch("brfalse", offsets, end_offset, *v as i64, index),
        brtrue(v) => branch("brtrue", offsets, end_offset, *v as i64, index),
        beq(v) => branch("beq", offsets, end_offset, *v as i64, index),
        bge(v) => branch("bge", offsets, end_offset, *v as i64, index),
        bgt(v) => branch("bgt", offsets, end_offset, *v as i64, index),
        ble(v) => branch("ble", offsets, end_offset, *v as i64, index),
        blt(v) => branch("blt", offsets, end_offset, *v as i64, index),
        bne_un(v) => branch("bne_un", offsets, end_offset, *v as i64, index),
        bge_un(v) => branch("bge_un", offsets, end_offset, *v as i64, index),
        bgt_un(v) => branch("bgt_un", offsets, end_offset, *v as i64, index),
        ble_un(v) => branch("ble_un", offsets, end_offset, *v as i64, index),
        blt_un(v) => branch("blt_un", offsets, end_offset, *v as i64, index),
        leave(v) => branch("leave", offsets, end_offset, *v as i64, index),

        switch(table) => DecodedInstruction::Switch(
            table.variants().map(|rel| branch_delta(offsets, end_offset, rel as i64, index)).collect(),
        ),

        jmp(token) | call(token) | callvirt(token) | newobj(token) => call_instr(module, op_name(op), *token),
        calli(token) => DecodedInstruction::Raw { mnemonic: "calli".to_string(), operand: Some(token.raw() as i64) },

        ldstr(token) => DecodedInstruction::LoadString(module.resolve_user_string(*token).unwrap_or_default()),

        cpobj(t) | ldobj(t) | stobj(t) | castclass(t) | isinst(t) | unbox(t) | unbox_any(t) | box_val(t) | newarr(t)
        | ldelema(t) | ldelem(t) | stelem(t) | refanyval(t) | mkrefany(t) => {
            DecodedInstruction::Type { mnemonic: op_name(op), name: module.resolve_type_token(*t) }
        },

        ldfld(t) | ldflda(t) | stfld(t) | ldsfld(t) | ldsflda(t) | stsfld(t) => field_instr(module, op_name(op), *t),

        // `ldtoken` can name a type, field or method; its runtime use (typeof/fieldof/methodof)
        // rarely participates in the IL patterns this server rewrites, so it is left unresolved.
        ldtoken(token) => DecodedInstruction::Raw { mnemonic: "ldtoken".to_string(), operand: Some(token.raw() as i64) },

        compound(c) => convert_compound(module, c, index, end_offset, offsets),

        other => DecodedInstruction::Op(bare_mnemonic(&format!("{other:?}"))),
    }
}

fn op_name(op: &OpCode<'_>) -> String {
    bare_mnemonic(&format!("{op:?}"))
}

fn branch(mnemonic: &str, offsets: &[u64], end_offset: u64, relative: i64, index: usize) -> DecodedInstruction {
    DecodedInstruction::Branch { mnemonic: mnemonic.to_string(), target: branch_delta(offsets, end_offset, relative, index) }
}

fn call_instr(module: &LoadedModule, mnemonic: String, token: crate::raw::indices::metadata_token::MetadataToken) -> DecodedInstruction {
    match module.resolve_call_target(token) {
        Some(target) => DecodedInstruction::Call { mnemonic, target },
        None => DecodedInstruction::Raw { mnemonic, operand: Some(token.raw() as i64) },
    }
}

fn field_instr(module: &LoadedModule, mnemonic: String, token: crate::raw::indices::metadata_token::MetadataToken) -> DecodedInstruction {
    match module.resolve_field_target(token) {
        Some(target) => DecodedInstruction::Field { mnemonic, target },
        None => DecodedInstruction::Raw { mnemonic, operand: Some(token.raw() as i64) },
    }
}

fn convert_compound(module: &LoadedModule, op: &CompoundOpCode, index: usize, end_offset: u64, offsets: &[u64]) -> DecodedInstruction {
    use CompoundOpCode::*;
    match op {
        ldarg(i) => DecodedInstruction::LoadArg(*i),
        ldarga(i) => DecodedInstruction::LoadArgAddr(*i),
        starg(i) => DecodedInstruction::StoreArg(*i),
        ldloc(i) => DecodedInstruction::LoadLocal(*i),
        ldloca(i) => DecodedInstruction::LoadLocalAddr(*i),
        stloc(i) => DecodedInstruction::StoreLocal(*i),
        ldftn(token) | ldvirtftn(token) => call_instr(module, format!("compound.{}", bare_mnemonic(&format!("{op:?}"))), *token),
        initobj(token) | constrained(token) | sizeof(token) => {
            DecodedInstruction::Type { mnemonic: format!("compound.{}", bare_mnemonic(&format!("{op:?}"))), name: module.resolve_type_token(*token) }
        },
        no_chk(flags) => DecodedInstruction::Raw { mnemonic: "compound.no_chk".to_string(), operand: Some(flags.bits() as i64) },
        _ => {
            let _ = (index, end_offset, offsets);
            DecodedInstruction::Op(format!("compound.{}", bare_mnemonic(&format!("{op:?}"))))
        },
    }
}
