// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The x86_64 instruction encoder.
//!
//! `compile_*` methods append to an instruction node list; [`Assembler::assemble`]
//! encodes the list, flushing the constant pool inline under displacement
//! pressure (bridged by a forward jump over the literals) and at function end
//! otherwise. Static-constant operands are encoded RIP-relative with the
//! disp32 patched once the pool assigns the literal its final offset.

use crate::compile::asm::pool::{emit_pool, ConstFixup, ConstantPool, StaticConstData};
use crate::compile::asm::{Label, Relocation, StaticConst};
use crate::errors::CompileError;
use crate::indices::FuncIndex;

/// Default displacement budget before the pool is force-flushed.
pub const DEFAULT_MAX_DISPLACEMENT: usize = 1 << 30;

/// An x86_64 register tag: 16 general-purpose plus 16 vector registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[rustfmt::skip]
pub enum Reg {
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
    Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7,
    Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
}

impl Reg {
    #[inline]
    pub fn is_xmm(self) -> bool {
        self >= Reg::Xmm0
    }

    /// Low three encoding bits.
    #[inline]
    fn low(self) -> u8 {
        (self as u8) & 0x7
    }

    /// The REX extension bit.
    #[inline]
    fn ext(self) -> bool {
        ((self as u8) & 0x8) != 0
    }

    /// Whether using this register as an 8-bit operand requires an empty REX
    /// prefix (spl/bpl/sil/dil vs. ah/ch/dh/bh).
    #[inline]
    fn byte_needs_rex(self) -> bool {
        matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }
}

/// Condition codes, named after their `setcc`/`jcc` suffix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    B,
    Ae,
    Be,
    A,
    L,
    Ge,
    Le,
    G,
    S,
    P,
    Np,
}

impl Cond {
    fn nibble(self) -> u8 {
        match self {
            Cond::E => 0x4,
            Cond::Ne => 0x5,
            Cond::B => 0x2,
            Cond::Ae => 0x3,
            Cond::Be => 0x6,
            Cond::A => 0x7,
            Cond::L => 0xc,
            Cond::Ge => 0xd,
            Cond::Le => 0xe,
            Cond::G => 0xf,
            Cond::S => 0x8,
            Cond::P => 0xa,
            Cond::Np => 0xb,
        }
    }
}

/// Instruction mnemonics. The `l`/`q` suffix is the operand size; moves
/// between general-purpose and vector registers are still spelled `Movl`/
/// `Movq` and pick the `movd`/`movq` encodings from their operand kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Inst {
    // data movement
    Movb, Movw, Movl, Movq, Movaps, Movss, Movsd, Movdqu, Movupd,
    Movzxbl, Movzxwl, Movsxbl, Movsxwl, Movsxbq, Movsxwq, Movsxdq,
    Leaq,
    // gp alu
    Addl, Addq, Subl, Subq, Andl, Andq, Orl, Orq, Xorl, Xorq,
    Cmpl, Cmpq, Testl, Testq, Imull, Imulq,
    Shll, Shlq, Shrl, Shrq, Sarl, Sarq, Roll, Rolq, Rorl, Rorq,
    Idivl, Idivq, Divl, Divq,
    Lzcntl, Lzcntq, Tzcntl, Tzcntq, Popcntl, Popcntq,
    // sse
    Addss, Addsd, Subss, Subsd, Mulss, Mulsd, Divss, Divsd,
    Sqrtss, Sqrtsd, Ucomiss, Ucomisd,
    Andps, Andnps, Orps, Xorps, Pand, Pandn, Por, Pxor, Ptest,
    Cvtsi2ssl, Cvtsi2ssq, Cvtsi2sdl, Cvtsi2sdq, Cvtss2sd, Cvtsd2ss,
    // one-operand / no-operand
    Pushq, Popq, Ud2, Ret, Cdq, Cqo, Mfence, Leave,
}

impl Inst {
    fn mnemonic(self) -> &'static str {
        // Debug form is close enough for error reporting.
        match self {
            Inst::Movdqu => "movdqu",
            Inst::Movupd => "movupd",
            Inst::Movl => "mov (32-bit)",
            Inst::Movq => "mov (64-bit)",
            Inst::Cmpl => "cmp (32-bit)",
            Inst::Cmpq => "cmp (64-bit)",
            _ => "instruction",
        }
    }
}

/// `(mandatory prefix, REX.W, opcode bytes)`.
type Enc = (Option<u8>, bool, &'static [u8]);

#[derive(Debug)]
enum Node {
    Standalone(Inst),
    RegToReg { inst: Inst, src: Reg, dst: Reg },
    ImmToReg { inst: Inst, imm: i64, dst: Reg },
    MemToReg { inst: Inst, base: Reg, disp: i32, dst: Reg },
    RegToMem { inst: Inst, src: Reg, base: Reg, disp: i32 },
    MemIdxToReg { inst: Inst, base: Reg, index: Reg, scale_log2: u8, disp: i32, dst: Reg },
    RegToMemIdx { inst: Inst, src: Reg, base: Reg, index: Reg, scale_log2: u8, disp: i32 },
    ConstToReg { inst: Inst, c: StaticConst, dst: Reg },
    RegToConst { inst: Inst, src: Reg, c: StaticConst },
    OneOp { inst: Inst, reg: Reg },
    ShiftCl { inst: Inst, dst: Reg },
    ShiftImm { inst: Inst, imm: u8, dst: Reg },
    Setcc { cond: Cond, dst: Reg },
    Jmp { label: Label },
    Jcc { cond: Cond, label: Label },
    CallFunc { func: FuncIndex },
    CallReg { reg: Reg },
    CallMem { base: Reg, disp: i32 },
    JmpReg { reg: Reg },
    Anchor { label: Label },
}

enum LabelState {
    /// `(patch_at, next_instr_offset)` fixups awaiting the bind.
    Unbound(Vec<(usize, u64)>),
    Bound(u64),
}

/// The x86_64 assembler.
pub struct Assembler {
    nodes: Vec<Node>,
    consts: Vec<StaticConstData>,
    jump_tables: Vec<(StaticConst, Vec<Label>)>,
    pool: ConstantPool,
    labels: Vec<LabelState>,
    buf: Vec<u8>,
    relocations: Vec<Relocation>,
    /// Maximum distance between the first instruction referencing a pool
    /// constant and the pool itself before an inline flush is forced.
    pub max_displacement_for_constant_pool: usize,
}

/// The encoded form of one function, ready for linking.
pub struct AssembledFunction {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            consts: Vec::new(),
            jump_tables: Vec::new(),
            pool: ConstantPool::default(),
            labels: Vec::new(),
            buf: Vec::new(),
            relocations: Vec::new(),
            max_displacement_for_constant_pool: DEFAULT_MAX_DISPLACEMENT,
        }
    }

    // ===== emission API =====

    pub fn new_static_const(&mut self, bytes: &[u8]) -> StaticConst {
        let id = u32::try_from(self.consts.len()).unwrap();
        self.consts.push(StaticConstData::new(bytes));
        StaticConst(id)
    }

    /// Registers a callback fired exactly once with the constant's absolute
    /// offset in the final binary.
    pub fn on_const_finalized(&mut self, c: StaticConst, cb: impl FnOnce(u64) + 'static) {
        self.consts[c.0 as usize].callbacks.push(Box::new(cb));
    }

    /// Declares `c` to be a jump table over `labels`: after assembly each
    /// 32-bit entry holds the label's offset relative to the table start.
    pub fn set_jump_table(&mut self, c: StaticConst, labels: Vec<Label>) {
        debug_assert_eq!(self.consts[c.0 as usize].bytes.len(), labels.len() * 4);
        self.jump_tables.push((c, labels));
    }

    pub fn new_label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).unwrap();
        self.labels.push(LabelState::Unbound(Vec::new()));
        Label(id)
    }

    /// Binds `label` to the position of the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.nodes.push(Node::Anchor { label });
    }

    pub fn compile_standalone(&mut self, inst: Inst) {
        self.nodes.push(Node::Standalone(inst));
    }

    pub fn compile_register_to_register(&mut self, inst: Inst, src: Reg, dst: Reg) {
        self.nodes.push(Node::RegToReg { inst, src, dst });
    }

    pub fn compile_const_to_register(&mut self, inst: Inst, imm: i64, dst: Reg) {
        self.nodes.push(Node::ImmToReg { inst, imm, dst });
    }

    pub fn compile_memory_to_register(&mut self, inst: Inst, base: Reg, disp: i32, dst: Reg) {
        self.nodes.push(Node::MemToReg {
            inst,
            base,
            disp,
            dst,
        });
    }

    pub fn compile_register_to_memory(&mut self, inst: Inst, src: Reg, base: Reg, disp: i32) {
        self.nodes.push(Node::RegToMem {
            inst,
            src,
            base,
            disp,
        });
    }

    /// A load through `[base + index * scale + disp]`.
    pub fn compile_memory_index_to_register(
        &mut self,
        inst: Inst,
        base: Reg,
        index: Reg,
        scale_log2: u8,
        disp: i32,
        dst: Reg,
    ) {
        self.nodes.push(Node::MemIdxToReg {
            inst,
            base,
            index,
            scale_log2,
            disp,
            dst,
        });
    }

    /// A store through `[base + index * scale + disp]`.
    pub fn compile_register_to_memory_index(
        &mut self,
        inst: Inst,
        src: Reg,
        base: Reg,
        index: Reg,
        scale_log2: u8,
        disp: i32,
    ) {
        self.nodes.push(Node::RegToMemIdx {
            inst,
            src,
            base,
            index,
            scale_log2,
            disp,
        });
    }

    /// Emits an instruction whose source operand is a pool literal,
    /// referenced RIP-relative.
    pub fn compile_static_const_to_register(
        &mut self,
        inst: Inst,
        c: StaticConst,
        dst: Reg,
    ) -> Result<(), CompileError> {
        self.check_const_operand(inst, c)?;
        self.nodes.push(Node::ConstToReg { inst, c, dst });
        Ok(())
    }

    /// Emits an instruction whose destination (or right-hand) operand is a
    /// pool literal, referenced RIP-relative.
    pub fn compile_register_to_static_const(
        &mut self,
        inst: Inst,
        src: Reg,
        c: StaticConst,
    ) -> Result<(), CompileError> {
        self.check_const_operand(inst, c)?;
        self.nodes.push(Node::RegToConst { inst, src, c });
        Ok(())
    }

    pub fn compile_one_operand(&mut self, inst: Inst, reg: Reg) {
        self.nodes.push(Node::OneOp { inst, reg });
    }

    /// Shift/rotate `dst` by `cl`.
    pub fn compile_shift_cl(&mut self, inst: Inst, dst: Reg) {
        self.nodes.push(Node::ShiftCl { inst, dst });
    }

    /// Shift/rotate `dst` by a constant.
    pub fn compile_shift_imm(&mut self, inst: Inst, imm: u8, dst: Reg) {
        self.nodes.push(Node::ShiftImm { inst, imm, dst });
    }

    pub fn compile_setcc(&mut self, cond: Cond, dst: Reg) {
        self.nodes.push(Node::Setcc { cond, dst });
    }

    pub fn compile_jump(&mut self, label: Label) {
        self.nodes.push(Node::Jmp { label });
    }

    pub fn compile_jump_cond(&mut self, cond: Cond, label: Label) {
        self.nodes.push(Node::Jcc { cond, label });
    }

    /// A `call rel32` to another function in the same module, resolved by the
    /// link pass through the returned relocation list.
    pub fn compile_call_func(&mut self, func: FuncIndex) {
        self.nodes.push(Node::CallFunc { func });
    }

    pub fn compile_call_register(&mut self, reg: Reg) {
        self.nodes.push(Node::CallReg { reg });
    }

    /// `call qword ptr [base + disp]`.
    pub fn compile_call_memory(&mut self, base: Reg, disp: i32) {
        self.nodes.push(Node::CallMem { base, disp });
    }

    /// `jmp reg`; the dispatch half of a jump table.
    pub fn compile_jump_to_register(&mut self, reg: Reg) {
        self.nodes.push(Node::JmpReg { reg });
    }

    fn check_const_operand(&self, inst: Inst, c: StaticConst) -> Result<(), CompileError> {
        if self.consts[c.0 as usize].bytes.len() % 2 != 0 {
            return Err(CompileError::InvalidOperand {
                instruction: inst.mnemonic(),
            });
        }
        Ok(())
    }

    // ===== assembly =====

    /// Encodes the node list into its final byte sequence.
    pub fn assemble(mut self) -> Result<AssembledFunction, CompileError> {
        let nodes = core::mem::take(&mut self.nodes);
        for node in &nodes {
            self.encode_node(node)?;
            self.maybe_flush_constants(false);
        }
        self.maybe_flush_constants(true);

        for state in &self.labels {
            assert!(
                matches!(state, LabelState::Bound(_)),
                "label never bound during assembly"
            );
        }

        for (c, labels) in core::mem::take(&mut self.jump_tables) {
            let table_offset = self.consts[c.0 as usize]
                .finalized_offset
                .expect("jump table never flushed");
            for (i, label) in labels.iter().enumerate() {
                let LabelState::Bound(target) = self.labels[label.0 as usize] else {
                    unreachable!()
                };
                let entry = i32::try_from(target as i64 - table_offset as i64).unwrap();
                let at = table_offset as usize + i * 4;
                self.buf[at..at + 4].copy_from_slice(&entry.to_le_bytes());
            }
        }

        if self.buf.len() > i32::MAX as usize {
            return Err(CompileError::CodeTooLarge);
        }

        Ok(AssembledFunction {
            code: self.buf,
            relocations: self.relocations,
        })
    }

    /// Flushes the constant pool if forced by displacement pressure, or
    /// unconditionally at end of function. An inline flush bridges the
    /// literals with a forward jump: short when the pool fits the rel8
    /// range, long otherwise.
    fn maybe_flush_constants(&mut self, end_of_function: bool) {
        if self.pool.is_empty() {
            return;
        }

        if end_of_function {
            emit_pool(&mut self.pool, &mut self.consts, &mut self.buf);
            return;
        }

        let Some(displacement) = self.pool.displacement(self.buf.len() as u64) else {
            return;
        };
        if (displacement as usize) < self.max_displacement_for_constant_pool {
            return;
        }

        let size = self.pool.size_in_bytes(&self.consts);
        if size <= i8::MAX as usize {
            self.buf.push(0xeb);
            self.buf.push(u8::try_from(size).unwrap());
        } else {
            self.buf.push(0xe9);
            self.buf
                .extend_from_slice(&i32::try_from(size).unwrap().to_le_bytes());
        }
        emit_pool(&mut self.pool, &mut self.consts, &mut self.buf);
    }

    // ===== byte-level emitters =====

    fn emit_rex_opcode(
        &mut self,
        pfx: Option<u8>,
        rex_w: bool,
        reg: Reg,
        rm: Reg,
        force_rex: bool,
        opc: &[u8],
    ) {
        if let Some(pfx) = pfx {
            self.buf.push(pfx);
        }
        let mut rex = 0x40u8;
        if rex_w {
            rex |= 0x08;
        }
        if reg.ext() {
            rex |= 0x04;
        }
        if rm.ext() {
            rex |= 0x01;
        }
        if rex != 0x40 || force_rex {
            self.buf.push(rex);
        }
        self.buf.extend_from_slice(opc);
    }

    fn emit_rex_opcode_idx(
        &mut self,
        pfx: Option<u8>,
        rex_w: bool,
        reg: Reg,
        index: Reg,
        base: Reg,
        opc: &[u8],
    ) {
        if let Some(pfx) = pfx {
            self.buf.push(pfx);
        }
        let mut rex = 0x40u8;
        if rex_w {
            rex |= 0x08;
        }
        if reg.ext() {
            rex |= 0x04;
        }
        if index.ext() {
            rex |= 0x02;
        }
        if base.ext() {
            rex |= 0x01;
        }
        if rex != 0x40 {
            self.buf.push(rex);
        }
        self.buf.extend_from_slice(opc);
    }

    /// ModRM+SIB+disp for a `[base + index * scale + disp]` operand.
    fn mem_index_operand(&mut self, reg: Reg, base: Reg, index: Reg, scale_log2: u8, disp: i32) {
        debug_assert!(scale_log2 <= 3);
        debug_assert!(index.low() != 0b100 || index.ext(), "rsp cannot be an index");
        let mode = if disp == 0 && base.low() != 0b101 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };
        self.modrm(mode, reg.low(), 0b100);
        self.buf
            .push((scale_log2 << 6) | (index.low() << 3) | base.low());
        match mode {
            0b01 => self.buf.push(disp as i8 as u8),
            0b10 => self.buf.extend_from_slice(&disp.to_le_bytes()),
            _ => {}
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.buf.push((mode << 6) | (reg << 3) | rm);
    }

    /// ModRM+SIB+disp for a `[base + disp]` operand.
    fn mem_operand(&mut self, reg: Reg, base: Reg, disp: i32) {
        let needs_sib = base.low() == 0b100; // rsp/r12
        let mode = if disp == 0 && base.low() != 0b101 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };
        let rm = if needs_sib { 0b100 } else { base.low() };
        self.modrm(mode, reg.low(), rm);
        if needs_sib {
            // scale=0, index=none(100), base
            self.buf.push(0x24);
        }
        match mode {
            0b01 => self.buf.push(disp as i8 as u8),
            0b10 => self.buf.extend_from_slice(&disp.to_le_bytes()),
            _ => {}
        }
    }

    /// Like `mem_operand` but with a literal opcode extension in the reg
    /// field.
    fn mem_operand_ext(&mut self, ext: u8, base: Reg, disp: i32) {
        let needs_sib = base.low() == 0b100;
        let mode = if disp == 0 && base.low() != 0b101 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };
        let rm = if needs_sib { 0b100 } else { base.low() };
        self.modrm(mode, ext, rm);
        if needs_sib {
            self.buf.push(0x24);
        }
        match mode {
            0b01 => self.buf.push(disp as i8 as u8),
            0b10 => self.buf.extend_from_slice(&disp.to_le_bytes()),
            _ => {}
        }
    }

    /// Emits a RIP-relative operand referencing `c`, registering the pool use
    /// and the disp32 fixup.
    fn rip_operand(&mut self, c: StaticConst, reg: Reg) {
        self.modrm(0b00, reg.low(), 0b101);
        let at = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        let next_instr = self.buf.len() as u64;
        self.consts[c.0 as usize]
            .fixups
            .push(ConstFixup::Disp32 { at, next_instr });
    }

    /// Encodings with a memory *source* operand (also used for reg-reg,
    /// where the source sits in `rm`).
    fn mem_src_enc(inst: Inst, operand: Reg) -> Enc {
        match inst {
            Inst::Movl if operand.is_xmm() => (Some(0x66), false, &[0x0f, 0x6e]),
            Inst::Movl => (None, false, &[0x8b]),
            Inst::Movq if operand.is_xmm() => (Some(0xf3), false, &[0x0f, 0x7e]),
            Inst::Movq => (None, true, &[0x8b]),
            Inst::Movzxbl => (None, false, &[0x0f, 0xb6]),
            Inst::Movzxwl => (None, false, &[0x0f, 0xb7]),
            Inst::Movsxbl => (None, false, &[0x0f, 0xbe]),
            Inst::Movsxwl => (None, false, &[0x0f, 0xbf]),
            Inst::Movsxbq => (None, true, &[0x0f, 0xbe]),
            Inst::Movsxwq => (None, true, &[0x0f, 0xbf]),
            Inst::Movsxdq => (None, true, &[0x63]),
            Inst::Movss => (Some(0xf3), false, &[0x0f, 0x10]),
            Inst::Movsd => (Some(0xf2), false, &[0x0f, 0x10]),
            Inst::Movdqu => (Some(0xf3), false, &[0x0f, 0x6f]),
            Inst::Movupd => (Some(0x66), false, &[0x0f, 0x10]),
            Inst::Movaps => (None, false, &[0x0f, 0x28]),
            Inst::Leaq => (None, true, &[0x8d]),
            Inst::Addl => (None, false, &[0x03]),
            Inst::Addq => (None, true, &[0x03]),
            Inst::Subl => (None, false, &[0x2b]),
            Inst::Subq => (None, true, &[0x2b]),
            Inst::Andl => (None, false, &[0x23]),
            Inst::Andq => (None, true, &[0x23]),
            Inst::Orl => (None, false, &[0x0b]),
            Inst::Orq => (None, true, &[0x0b]),
            Inst::Xorl => (None, false, &[0x33]),
            Inst::Xorq => (None, true, &[0x33]),
            Inst::Cmpl => (None, false, &[0x3b]),
            Inst::Cmpq => (None, true, &[0x3b]),
            Inst::Testl => (None, false, &[0x85]),
            Inst::Testq => (None, true, &[0x85]),
            Inst::Imull => (None, false, &[0x0f, 0xaf]),
            Inst::Imulq => (None, true, &[0x0f, 0xaf]),
            Inst::Lzcntl => (Some(0xf3), false, &[0x0f, 0xbd]),
            Inst::Lzcntq => (Some(0xf3), true, &[0x0f, 0xbd]),
            Inst::Tzcntl => (Some(0xf3), false, &[0x0f, 0xbc]),
            Inst::Tzcntq => (Some(0xf3), true, &[0x0f, 0xbc]),
            Inst::Popcntl => (Some(0xf3), false, &[0x0f, 0xb8]),
            Inst::Popcntq => (Some(0xf3), true, &[0x0f, 0xb8]),
            Inst::Addss => (Some(0xf3), false, &[0x0f, 0x58]),
            Inst::Addsd => (Some(0xf2), false, &[0x0f, 0x58]),
            Inst::Subss => (Some(0xf3), false, &[0x0f, 0x5c]),
            Inst::Subsd => (Some(0xf2), false, &[0x0f, 0x5c]),
            Inst::Mulss => (Some(0xf3), false, &[0x0f, 0x59]),
            Inst::Mulsd => (Some(0xf2), false, &[0x0f, 0x59]),
            Inst::Divss => (Some(0xf3), false, &[0x0f, 0x5e]),
            Inst::Divsd => (Some(0xf2), false, &[0x0f, 0x5e]),
            Inst::Sqrtss => (Some(0xf3), false, &[0x0f, 0x51]),
            Inst::Sqrtsd => (Some(0xf2), false, &[0x0f, 0x51]),
            Inst::Ucomiss => (None, false, &[0x0f, 0x2e]),
            Inst::Ucomisd => (Some(0x66), false, &[0x0f, 0x2e]),
            Inst::Andps => (None, false, &[0x0f, 0x54]),
            Inst::Andnps => (None, false, &[0x0f, 0x55]),
            Inst::Orps => (None, false, &[0x0f, 0x56]),
            Inst::Xorps => (None, false, &[0x0f, 0x57]),
            Inst::Pand => (Some(0x66), false, &[0x0f, 0xdb]),
            Inst::Pandn => (Some(0x66), false, &[0x0f, 0xdf]),
            Inst::Por => (Some(0x66), false, &[0x0f, 0xeb]),
            Inst::Pxor => (Some(0x66), false, &[0x0f, 0xef]),
            Inst::Ptest => (Some(0x66), false, &[0x0f, 0x38, 0x17]),
            Inst::Cvtsi2ssl => (Some(0xf3), false, &[0x0f, 0x2a]),
            Inst::Cvtsi2ssq => (Some(0xf3), true, &[0x0f, 0x2a]),
            Inst::Cvtsi2sdl => (Some(0xf2), false, &[0x0f, 0x2a]),
            Inst::Cvtsi2sdq => (Some(0xf2), true, &[0x0f, 0x2a]),
            Inst::Cvtss2sd => (Some(0xf3), false, &[0x0f, 0x5a]),
            Inst::Cvtsd2ss => (Some(0xf2), false, &[0x0f, 0x5a]),
            _ => unreachable!("{inst:?} has no memory-source encoding"),
        }
    }

    /// Encodings with a memory *destination* operand.
    fn mem_dst_enc(inst: Inst) -> Enc {
        match inst {
            Inst::Movb => (None, false, &[0x88]),
            Inst::Movw => (Some(0x66), false, &[0x89]),
            Inst::Movl => (None, false, &[0x89]),
            Inst::Movq => (None, true, &[0x89]),
            Inst::Movss => (Some(0xf3), false, &[0x0f, 0x11]),
            Inst::Movsd => (Some(0xf2), false, &[0x0f, 0x11]),
            Inst::Movdqu => (Some(0xf3), false, &[0x0f, 0x7f]),
            Inst::Movupd => (Some(0x66), false, &[0x0f, 0x11]),
            Inst::Cmpl => (None, false, &[0x39]),
            Inst::Cmpq => (None, true, &[0x39]),
            _ => unreachable!("{inst:?} has no memory-destination encoding"),
        }
    }

    fn encode_node(&mut self, node: &Node) -> Result<(), CompileError> {
        match *node {
            Node::Anchor { label } => self.bind_now(label),
            Node::Standalone(inst) => self.encode_standalone(inst),
            Node::RegToReg { inst, src, dst } => self.encode_rr(inst, src, dst),
            Node::ImmToReg { inst, imm, dst } => self.encode_ir(inst, imm, dst)?,
            Node::MemToReg {
                inst,
                base,
                disp,
                dst,
            } => {
                let (pfx, w, opc) = Self::mem_src_enc(inst, dst);
                self.emit_rex_opcode(pfx, w, dst, base, false, opc);
                self.mem_operand(dst, base, disp);
            }
            Node::RegToMem {
                inst,
                src,
                base,
                disp,
            } => {
                let (pfx, w, opc) = Self::mem_dst_enc(inst);
                let force_rex = inst == Inst::Movb && src.byte_needs_rex();
                self.emit_rex_opcode(pfx, w, src, base, force_rex, opc);
                self.mem_operand(src, base, disp);
            }
            Node::ConstToReg { inst, c, dst } => {
                let start = self.buf.len() as u64;
                self.pool.add_const(c, start);
                let (pfx, w, opc) = Self::mem_src_enc(inst, dst);
                self.emit_rex_opcode(pfx, w, dst, Reg::Rax, false, opc);
                self.rip_operand(c, dst);
            }
            Node::RegToConst { inst, src, c } => {
                let start = self.buf.len() as u64;
                self.pool.add_const(c, start);
                let (pfx, w, opc) = Self::mem_dst_enc(inst);
                self.emit_rex_opcode(pfx, w, src, Reg::Rax, false, opc);
                self.rip_operand(c, src);
            }
            Node::MemIdxToReg {
                inst,
                base,
                index,
                scale_log2,
                disp,
                dst,
            } => {
                let (pfx, w, opc) = Self::mem_src_enc(inst, dst);
                self.emit_rex_opcode_idx(pfx, w, dst, index, base, opc);
                self.mem_index_operand(dst, base, index, scale_log2, disp);
            }
            Node::RegToMemIdx {
                inst,
                src,
                base,
                index,
                scale_log2,
                disp,
            } => {
                let (pfx, w, opc) = Self::mem_dst_enc(inst);
                // Byte stores from spl/bpl/sil/dil need the empty REX, which
                // emit_rex_opcode_idx produces anyway when any extension bit
                // is set; force it through a manual prefix otherwise.
                if inst == Inst::Movb
                    && src.byte_needs_rex()
                    && !src.ext()
                    && !base.ext()
                    && !index.ext()
                {
                    if let Some(pfx) = pfx {
                        self.buf.push(pfx);
                    }
                    self.buf.push(0x40);
                    self.buf.extend_from_slice(opc);
                } else {
                    self.emit_rex_opcode_idx(pfx, w, src, index, base, opc);
                }
                self.mem_index_operand(src, base, index, scale_log2, disp);
            }
            Node::OneOp { inst, reg } => self.encode_one_op(inst, reg),
            Node::ShiftCl { inst, dst } => {
                let (w, ext) = match inst {
                    Inst::Shll => (false, 4),
                    Inst::Shlq => (true, 4),
                    Inst::Shrl => (false, 5),
                    Inst::Shrq => (true, 5),
                    Inst::Sarl => (false, 7),
                    Inst::Sarq => (true, 7),
                    Inst::Roll => (false, 0),
                    Inst::Rolq => (true, 0),
                    Inst::Rorl => (false, 1),
                    Inst::Rorq => (true, 1),
                    _ => unreachable!("{inst:?} is not a shift"),
                };
                self.emit_rex_opcode(None, w, Reg::Rax, dst, false, &[0xd3]);
                self.modrm(0b11, ext, dst.low());
            }
            Node::ShiftImm { inst, imm, dst } => {
                let (w, ext) = match inst {
                    Inst::Shll => (false, 4),
                    Inst::Shlq => (true, 4),
                    Inst::Shrl => (false, 5),
                    Inst::Shrq => (true, 5),
                    Inst::Sarl => (false, 7),
                    Inst::Sarq => (true, 7),
                    Inst::Roll => (false, 0),
                    Inst::Rolq => (true, 0),
                    Inst::Rorl => (false, 1),
                    Inst::Rorq => (true, 1),
                    _ => unreachable!("{inst:?} is not a shift"),
                };
                self.emit_rex_opcode(None, w, Reg::Rax, dst, false, &[0xc1]);
                self.modrm(0b11, ext, dst.low());
                self.buf.push(imm);
            }
            Node::Setcc { cond, dst } => {
                let force_rex = dst.byte_needs_rex();
                self.emit_rex_opcode(None, false, Reg::Rax, dst, force_rex, &[]);
                self.buf.extend_from_slice(&[0x0f, 0x90 | cond.nibble()]);
                self.modrm(0b11, 0, dst.low());
            }
            Node::Jmp { label } => self.encode_jump(label, None),
            Node::Jcc { cond, label } => self.encode_jump(label, Some(cond)),
            Node::CallFunc { func } => {
                self.buf.push(0xe8);
                let offset = u32::try_from(self.buf.len()).unwrap();
                self.buf.extend_from_slice(&[0, 0, 0, 0]);
                self.relocations.push(Relocation {
                    offset,
                    target: func,
                });
            }
            Node::CallReg { reg } => {
                self.emit_rex_opcode(None, false, Reg::Rax, reg, false, &[0xff]);
                self.modrm(0b11, 2, reg.low());
            }
            Node::CallMem { base, disp } => {
                self.emit_rex_opcode(None, false, Reg::Rax, base, false, &[0xff]);
                // /2 in the reg field selects near call.
                self.mem_operand_ext(2, base, disp);
            }
            Node::JmpReg { reg } => {
                self.emit_rex_opcode(None, false, Reg::Rax, reg, false, &[0xff]);
                self.modrm(0b11, 4, reg.low());
            }
        }
        Ok(())
    }

    fn encode_standalone(&mut self, inst: Inst) {
        match inst {
            Inst::Ud2 => self.buf.extend_from_slice(&[0x0f, 0x0b]),
            Inst::Ret => self.buf.push(0xc3),
            Inst::Cdq => self.buf.push(0x99),
            Inst::Cqo => self.buf.extend_from_slice(&[0x48, 0x99]),
            Inst::Mfence => self.buf.extend_from_slice(&[0x0f, 0xae, 0xf0]),
            Inst::Leave => self.buf.push(0xc9),
            _ => unreachable!("{inst:?} is not a standalone instruction"),
        }
    }

    fn encode_rr(&mut self, inst: Inst, src: Reg, dst: Reg) {
        // movd/movq from vector to general-purpose flips the operand roles.
        if matches!(inst, Inst::Movl | Inst::Movq) && src.is_xmm() && !dst.is_xmm() {
            let w = inst == Inst::Movq;
            self.emit_rex_opcode(Some(0x66), w, src, dst, false, &[0x0f, 0x7e]);
            self.modrm(0b11, src.low(), dst.low());
            return;
        }
        // test encodes its register operand in the reg field.
        if matches!(inst, Inst::Testl | Inst::Testq) {
            let (pfx, w, opc) = Self::mem_src_enc(inst, dst);
            self.emit_rex_opcode(pfx, w, src, dst, false, opc);
            self.modrm(0b11, src.low(), dst.low());
            return;
        }
        let (pfx, w, opc) = Self::mem_src_enc(inst, dst);
        let force_rex = matches!(inst, Inst::Movzxbl | Inst::Movsxbl | Inst::Movsxbq)
            && src.byte_needs_rex();
        self.emit_rex_opcode(pfx, w, dst, src, force_rex, opc);
        self.modrm(0b11, dst.low(), src.low());
    }

    fn encode_ir(&mut self, inst: Inst, imm: i64, dst: Reg) -> Result<(), CompileError> {
        match inst {
            Inst::Movl => {
                self.emit_rex_opcode(None, false, Reg::Rax, dst, false, &[]);
                self.buf.push(0xb8 | dst.low());
                self.buf
                    .extend_from_slice(&(imm as u32 as i32).to_le_bytes());
            }
            Inst::Movq => {
                // movabs
                self.emit_rex_opcode(None, true, Reg::Rax, dst, false, &[]);
                self.buf.push(0xb8 | dst.low());
                self.buf.extend_from_slice(&imm.to_le_bytes());
            }
            Inst::Testl | Inst::Testq => {
                let imm = i32::try_from(imm).map_err(|_| CompileError::DisplacementOverflow)?;
                self.emit_rex_opcode(None, inst == Inst::Testq, Reg::Rax, dst, false, &[0xf7]);
                self.modrm(0b11, 0, dst.low());
                self.buf.extend_from_slice(&imm.to_le_bytes());
            }
            _ => {
                let (w, ext) = match inst {
                    Inst::Addl => (false, 0),
                    Inst::Addq => (true, 0),
                    Inst::Orl => (false, 1),
                    Inst::Orq => (true, 1),
                    Inst::Andl => (false, 4),
                    Inst::Andq => (true, 4),
                    Inst::Subl => (false, 5),
                    Inst::Subq => (true, 5),
                    Inst::Xorl => (false, 6),
                    Inst::Xorq => (true, 6),
                    Inst::Cmpl => (false, 7),
                    Inst::Cmpq => (true, 7),
                    _ => unreachable!("{inst:?} has no immediate form"),
                };
                let imm = i32::try_from(imm).map_err(|_| CompileError::DisplacementOverflow)?;
                self.emit_rex_opcode(None, w, Reg::Rax, dst, false, &[0x81]);
                self.modrm(0b11, ext, dst.low());
                self.buf.extend_from_slice(&imm.to_le_bytes());
            }
        }
        Ok(())
    }

    fn encode_one_op(&mut self, inst: Inst, reg: Reg) {
        match inst {
            Inst::Pushq => {
                self.emit_rex_opcode(None, false, Reg::Rax, reg, false, &[]);
                self.buf.push(0x50 | reg.low());
            }
            Inst::Popq => {
                self.emit_rex_opcode(None, false, Reg::Rax, reg, false, &[]);
                self.buf.push(0x58 | reg.low());
            }
            Inst::Idivl | Inst::Idivq | Inst::Divl | Inst::Divq => {
                let w = matches!(inst, Inst::Idivq | Inst::Divq);
                let ext = if matches!(inst, Inst::Idivl | Inst::Idivq) {
                    7
                } else {
                    6
                };
                self.emit_rex_opcode(None, w, Reg::Rax, reg, false, &[0xf7]);
                self.modrm(0b11, ext, reg.low());
            }
            _ => unreachable!("{inst:?} is not a one-operand instruction"),
        }
    }

    fn encode_jump(&mut self, label: Label, cond: Option<Cond>) {
        match self.labels[label.0 as usize] {
            LabelState::Bound(target) => {
                // Backward jump: pick the shortest encoding that fits.
                // Short forms (jmp rel8 / jcc rel8) are both two bytes.
                let disp8 = target as i64 - (self.buf.len() as i64 + 2);
                if let Ok(disp8) = i8::try_from(disp8) {
                    match cond {
                        None => self.buf.push(0xeb),
                        Some(c) => self.buf.push(0x70 | c.nibble()),
                    }
                    self.buf.push(disp8 as u8);
                } else {
                    let long_len = if cond.is_some() { 6 } else { 5 };
                    let disp = i32::try_from(target as i64 - (self.buf.len() as i64 + long_len))
                        .expect("backward jump out of range");
                    match cond {
                        None => self.buf.push(0xe9),
                        Some(c) => self.buf.extend_from_slice(&[0x0f, 0x80 | c.nibble()]),
                    }
                    self.buf.extend_from_slice(&disp.to_le_bytes());
                }
            }
            LabelState::Unbound(_) => {
                // Forward jumps conservatively take the long form; the fixup
                // is patched when the label binds.
                match cond {
                    None => self.buf.push(0xe9),
                    Some(c) => self.buf.extend_from_slice(&[0x0f, 0x80 | c.nibble()]),
                }
                let at = self.buf.len();
                self.buf.extend_from_slice(&[0, 0, 0, 0]);
                let next_instr = self.buf.len() as u64;
                let LabelState::Unbound(fixups) = &mut self.labels[label.0 as usize] else {
                    unreachable!()
                };
                fixups.push((at, next_instr));
            }
        }
    }

    fn bind_now(&mut self, label: Label) {
        let offset = self.buf.len() as u64;
        let state = core::mem::replace(&mut self.labels[label.0 as usize], LabelState::Bound(offset));
        match state {
            LabelState::Unbound(fixups) => {
                for (at, next_instr) in fixups {
                    let disp = i32::try_from(offset as i64 - next_instr as i64)
                        .expect("forward jump out of range");
                    self.buf[at..at + 4].copy_from_slice(&disp.to_le_bytes());
                }
            }
            LabelState::Bound(_) => panic!("label bound twice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn odd_length_const_rejected_at_enqueue() {
        let mut a = Assembler::new();
        let c = a.new_static_const(&[1]);
        assert!(matches!(
            a.compile_static_const_to_register(Inst::Movdqu, c, Reg::Xmm0),
            Err(CompileError::InvalidOperand { .. })
        ));
        assert!(matches!(
            a.compile_register_to_static_const(Inst::Movdqu, Reg::Xmm0, c),
            Err(CompileError::InvalidOperand { .. })
        ));
    }

    fn expect_offsets(a: &mut Assembler, consts: &[StaticConst], expected: &[u64]) -> Vec<Rc<Cell<Option<u64>>>> {
        let mut seen = Vec::new();
        for c in consts {
            let cell = Rc::new(Cell::new(None));
            let cloned = Rc::clone(&cell);
            a.on_const_finalized(*c, move |offset| cloned.set(Some(offset)));
            seen.push(cell);
        }
        assert_eq!(consts.len(), expected.len());
        seen
    }

    #[test]
    fn flush_at_end_of_function() {
        let mut a = Assembler::new();
        a.max_displacement_for_constant_pool = 1 << 31;
        a.buf.extend_from_slice(b"????");

        let c0 = a.new_static_const(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let c1 = a.new_static_const(&[10, 11, 12, 13]);
        let seen = expect_offsets(&mut a, &[c0, c1], &[4, 12]);
        a.pool.add_const(c0, 100);
        a.pool.add_const(c1, 100);
        a.pool.first_use_offset_in_binary = Some(0);

        a.maybe_flush_constants(true);

        assert_eq!(
            a.buf,
            [b'?', b'?', b'?', b'?', 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13]
        );
        assert_eq!(seen[0].get(), Some(4));
        assert_eq!(seen[1].get(), Some(12));
    }

    #[test]
    fn no_flush_without_pressure() {
        let mut a = Assembler::new();
        a.max_displacement_for_constant_pool = 1 << 31;
        a.buf.extend_from_slice(b"????");

        let c0 = a.new_static_const(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let c1 = a.new_static_const(&[10, 11, 12, 13]);
        a.pool.add_const(c0, 100);
        a.pool.add_const(c1, 100);
        a.pool.first_use_offset_in_binary = Some(0);

        a.maybe_flush_constants(false);

        assert_eq!(a.buf, b"????");
        assert!(!a.pool.is_empty());
    }

    #[test]
    fn forced_flush_uses_short_bridge_jump() {
        let mut a = Assembler::new();
        a.max_displacement_for_constant_pool = 0;
        a.buf.extend_from_slice(b"????");

        let c0 = a.new_static_const(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let c1 = a.new_static_const(&[10, 11, 12, 13]);
        let seen = expect_offsets(&mut a, &[c0, c1], &[6, 14]);
        a.pool.add_const(c0, 100);
        a.pool.add_const(c1, 100);
        a.pool.first_use_offset_in_binary = Some(0);

        a.maybe_flush_constants(false);

        // Short jump over 12 bytes of literals.
        assert_eq!(
            a.buf,
            [
                b'?', b'?', b'?', b'?',
                0xeb, 0x0c,
                1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13,
            ]
        );
        assert_eq!(seen[0].get(), Some(6));
        assert_eq!(seen[1].get(), Some(14));
    }

    #[test]
    fn forced_flush_uses_long_bridge_jump() {
        let mut a = Assembler::new();
        a.max_displacement_for_constant_pool = 0;
        a.buf.extend_from_slice(b"????");

        let large = vec![0xaau8; 256];
        let c0 = a.new_static_const(&large);
        let seen = expect_offsets(&mut a, &[c0], &[9]);
        a.pool.add_const(c0, 100);
        a.pool.first_use_offset_in_binary = Some(0);

        a.maybe_flush_constants(false);

        let mut expected = vec![b'?', b'?', b'?', b'?', 0xe9, 0x00, 0x01, 0x00, 0x00];
        expected.extend_from_slice(&large);
        assert_eq!(a.buf, expected);
        assert_eq!(seen[0].get(), Some(4 + 5));
    }

    struct RipCase {
        inst: Inst,
        c: &'static [u8],
        reg: Reg,
        ud2s_before_const: usize,
        exp: Vec<u8>,
    }

    const QWORD: &[u8] = &[0x1, 0x2, 0x3, 0x4, 0x5, 0x6, 0x7, 0x8];
    const XWORD: &[u8] = &[
        0x1, 0x2, 0x3, 0x4, 0x5, 0x6, 0x7, 0x8, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80,
    ];

    fn run_rip_case(case: RipCase, to_const: bool) {
        let mut a = Assembler::new();
        let c = a.new_static_const(case.c);
        if to_const {
            a.compile_register_to_static_const(case.inst, case.reg, c)
                .unwrap();
        } else {
            a.compile_static_const_to_register(case.inst, c, case.reg)
                .unwrap();
        }
        for _ in 0..case.ud2s_before_const {
            a.compile_standalone(Inst::Ud2);
        }
        let out = a.assemble().unwrap();
        assert_eq!(out.code, case.exp, "{:?}", case.inst);
    }

    #[test]
    fn rip_relative_const_source_encodings() {
        let ud2x5: [u8; 10] = [0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb];
        let mut ud2x10 = Vec::new();
        ud2x10.extend_from_slice(&ud2x5);
        ud2x10.extend_from_slice(&ud2x5);

        // cmp r12d, dword ptr [rip + 0x14]; rip = 0x7 so the const lands at 0x1b.
        let mut exp = vec![0x44, 0x3b, 0x25, 0x14, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x10);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpl,
                c: QWORD,
                reg: Reg::R12,
                ud2s_before_const: 10,
                exp,
            },
            false,
        );

        // cmp eax, dword ptr [rip + 0x14]
        let mut exp = vec![0x3b, 0x5, 0x14, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x10);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpl,
                c: QWORD,
                reg: Reg::Rax,
                ud2s_before_const: 10,
                exp,
            },
            false,
        );

        // cmp r12, qword ptr [rip]; rip points at the const itself.
        let mut exp = vec![0x4c, 0x3b, 0x25, 0x0, 0x0, 0x0, 0x0];
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpq,
                c: QWORD,
                reg: Reg::R12,
                ud2s_before_const: 0,
                exp,
            },
            false,
        );

        // cmp rsp, qword ptr [rip + 0xa]
        let mut exp = vec![0x48, 0x3b, 0x25, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpq,
                c: QWORD,
                reg: Reg::Rsp,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // movdqu xmm14, xmmword ptr [rip + 0xa]
        let mut exp = vec![0xf3, 0x44, 0xf, 0x6f, 0x35, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Movdqu,
                c: XWORD,
                reg: Reg::Xmm14,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // movupd xmm1, xmmword ptr [rip + 0xa]
        let mut exp = vec![0x66, 0xf, 0x10, 0xd, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Movupd,
                c: XWORD,
                reg: Reg::Xmm1,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // lea r11, [rip + 0x14]
        let mut exp = vec![0x4c, 0x8d, 0x1d, 0x14, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x10);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Leaq,
                c: XWORD,
                reg: Reg::R11,
                ud2s_before_const: 10,
                exp,
            },
            false,
        );

        // movd xmm14, dword ptr [rip + 0xa]
        let mut exp = vec![0x66, 0x44, 0xf, 0x6e, 0x35, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Movl,
                c: XWORD,
                reg: Reg::Xmm14,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // mov rsp, qword ptr [rip + 0xa]
        let mut exp = vec![0x48, 0x8b, 0x25, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Movq,
                c: XWORD,
                reg: Reg::Rsp,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // movq xmm1, qword ptr [rip + 0xa]
        let mut exp = vec![0xf3, 0xf, 0x7e, 0xd, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(XWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Movq,
                c: XWORD,
                reg: Reg::Xmm1,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // ucomisd xmm15, qword ptr [rip + 6]
        let ud2x3: [u8; 6] = [0xf, 0xb, 0xf, 0xb, 0xf, 0xb];
        let mut exp = vec![0x66, 0x44, 0xf, 0x2e, 0x3d, 0x6, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x3);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Ucomisd,
                c: QWORD,
                reg: Reg::Xmm15,
                ud2s_before_const: 3,
                exp,
            },
            false,
        );

        // ucomiss xmm15, dword ptr [rip + 6]
        let mut exp = vec![0x44, 0xf, 0x2e, 0x3d, 0x6, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x3);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Ucomiss,
                c: QWORD,
                reg: Reg::Xmm15,
                ud2s_before_const: 3,
                exp,
            },
            false,
        );

        // subss xmm13, dword ptr [rip + 0xa]
        let mut exp = vec![0xf3, 0x44, 0xf, 0x5c, 0x2d, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Subss,
                c: QWORD,
                reg: Reg::Xmm13,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // subsd xmm1, qword ptr [rip + 0xa]
        let mut exp = vec![0xf2, 0xf, 0x5c, 0xd, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Subsd,
                c: QWORD,
                reg: Reg::Xmm1,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // add eax, dword ptr [rip + 0xa]
        let mut exp = vec![0x3, 0x5, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Addl,
                c: QWORD,
                reg: Reg::Rax,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );

        // add rax, qword ptr [rip + 0xa]
        let mut exp = vec![0x48, 0x3, 0x5, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Addq,
                c: QWORD,
                reg: Reg::Rax,
                ud2s_before_const: 5,
                exp,
            },
            false,
        );
    }

    #[test]
    fn rip_relative_const_destination_encodings() {
        let ud2x10: [u8; 20] = [
            0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf,
            0xb, 0xf, 0xb,
        ];

        // cmp dword ptr [rip + 0x14], r12d
        let mut exp = vec![0x44, 0x39, 0x25, 0x14, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x10);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpl,
                c: QWORD,
                reg: Reg::R12,
                ud2s_before_const: 10,
                exp,
            },
            true,
        );

        // cmp dword ptr [rip + 0x14], eax
        let mut exp = vec![0x39, 0x5, 0x14, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x10);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpl,
                c: QWORD,
                reg: Reg::Rax,
                ud2s_before_const: 10,
                exp,
            },
            true,
        );

        // cmp qword ptr [rip], r12
        let mut exp = vec![0x4c, 0x39, 0x25, 0x0, 0x0, 0x0, 0x0];
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpq,
                c: QWORD,
                reg: Reg::R12,
                ud2s_before_const: 0,
                exp,
            },
            true,
        );

        // cmp qword ptr [rip + 0xa], rsp
        let ud2x5: [u8; 10] = [0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb, 0xf, 0xb];
        let mut exp = vec![0x48, 0x39, 0x25, 0xa, 0x0, 0x0, 0x0];
        exp.extend_from_slice(&ud2x5);
        exp.extend_from_slice(QWORD);
        run_rip_case(
            RipCase {
                inst: Inst::Cmpq,
                c: QWORD,
                reg: Reg::Rsp,
                ud2s_before_const: 5,
                exp,
            },
            true,
        );
    }

    #[test]
    fn backward_jumps_use_short_form() {
        let mut a = Assembler::new();
        let top = a.new_label();
        a.bind(top);
        a.compile_standalone(Inst::Ud2);
        a.compile_jump(top);
        let out = a.assemble().unwrap();
        // ud2 (2 bytes) then jmp -4.
        assert_eq!(out.code, vec![0x0f, 0x0b, 0xeb, 0xfc]);
    }

    #[test]
    fn forward_jumps_use_long_form() {
        let mut a = Assembler::new();
        let end = a.new_label();
        a.compile_jump_cond(Cond::E, end);
        a.compile_standalone(Inst::Ud2);
        a.bind(end);
        let out = a.assemble().unwrap();
        // je +2 (long form) over the ud2.
        assert_eq!(out.code, vec![0x0f, 0x84, 0x02, 0x00, 0x00, 0x00, 0x0f, 0x0b]);
    }
}
