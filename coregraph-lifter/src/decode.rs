//! Whitelist decoder: machine code to AccessorOps
//!
//! Decoding uses capstone; lifting recognizes only the instruction subset an
//! out-of-line accessor needs (pointer loads and spills, immediate
//! arithmetic, compares, conditional branches, return). The first encoding
//! outside the whitelist stops the lift with an explicit error — the lifter
//! never guesses past an unrecognized instruction, and an accessor it cannot
//! lift is simply unavailable.

use crate::error::LiftError;
use crate::program::{AccessorOp, AccessorProgram, AluOp, Cond, MemRef, RValue, Reg};
use capstone::arch::x86::{X86OpMem, X86Operand, X86OperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;
use capstone::{Capstone, Insn, RegId};
use coregraph_descriptors::FunctionDescriptor;
use std::collections::HashMap;
use tracing::debug;

/// Lifts function descriptors into accessor programs. One instance per
/// thread; the lifter holds no per-function state.
pub struct AccessorLifter {
    cs: Capstone,
}

impl AccessorLifter {
    pub fn new() -> Result<Self, LiftError> {
        let cs = Capstone::new()
            .x86()
            .mode(capstone::arch::x86::ArchMode::Mode64)
            .detail(true)
            .build()?;
        Ok(Self { cs })
    }

    /// Lift a function's bytes into an [`AccessorProgram`], or an explicit
    /// unsupported error.
    pub fn lift(&self, func: &FunctionDescriptor) -> Result<AccessorProgram, LiftError> {
        if !func.has_body() {
            return Err(LiftError::MissingBody {
                linkage: func.linkage_name.clone(),
            });
        }

        let insns = self.cs.disasm_all(&func.bytes, func.low_address)?;

        let mut ops: Vec<AccessorOp> = Vec::new();
        let mut index_of_addr: HashMap<u64, usize> = HashMap::new();
        let mut fixups: Vec<(usize, u64)> = Vec::new();
        let mut decoded_len = 0u64;

        for insn in insns.iter() {
            index_of_addr.insert(insn.address(), ops.len());
            decoded_len += insn.bytes().len() as u64;
            self.translate(insn, &mut ops, &mut fixups)?;
        }

        // Capstone stops silently at the first undecodable byte; treat the
        // remainder as an unsupported encoding.
        if decoded_len < func.bytes.len() as u64 {
            return Err(LiftError::UnsupportedInstruction {
                mnemonic: "(undecodable)".to_string(),
                address: func.low_address + decoded_len,
            });
        }

        for (op_idx, target_addr) in fixups {
            let target = index_of_addr
                .get(&target_addr)
                .copied()
                .filter(|&t| t < ops.len())
                .ok_or(LiftError::InvalidBranchTarget {
                    target: target_addr,
                })?;
            match &mut ops[op_idx] {
                AccessorOp::Jump { target: t } | AccessorOp::JumpIf { target: t, .. } => {
                    *t = target;
                }
                _ => unreachable!("fixup recorded for a non-branch op"),
            }
        }

        debug!(
            "lifted `{}` at {:#x}: {} ops",
            func.linkage_name,
            func.low_address,
            ops.len()
        );
        Ok(AccessorProgram {
            linkage_name: func.linkage_name.clone(),
            function_address: func.low_address,
            ops,
        })
    }

    fn translate(
        &self,
        insn: &Insn<'_>,
        ops: &mut Vec<AccessorOp>,
        fixups: &mut Vec<(usize, u64)>,
    ) -> Result<(), LiftError> {
        let mnemonic = insn.mnemonic().unwrap_or("").to_string();
        let address = insn.address();
        let next_address = address + insn.bytes().len() as u64;

        let unsupported = || LiftError::UnsupportedInstruction {
            mnemonic: mnemonic.clone(),
            address,
        };
        let bad_operand = || LiftError::UnsupportedOperand {
            mnemonic: mnemonic.clone(),
            address,
        };

        match mnemonic.as_str() {
            "nop" | "endbr64" => return Ok(()),
            "ret" => {
                ops.push(AccessorOp::Return);
                return Ok(());
            }
            "leave" => {
                ops.push(AccessorOp::Move {
                    dst: Reg::RSP,
                    src: RValue::Reg {
                        reg: Reg::RBP,
                        width: 8,
                    },
                    width: 8,
                });
                ops.push(AccessorOp::Pop { dst: Reg::RBP });
                return Ok(());
            }
            "cdqe" => {
                ops.push(AccessorOp::Extend {
                    dst: Reg::RAX,
                    src: Reg::RAX,
                    from_bits: 32,
                    signed: true,
                });
                return Ok(());
            }
            _ => {}
        }

        let operands = self.operands(insn)?;

        match mnemonic.as_str() {
            "mov" => {
                let (dst, src) = two_operands(&operands).ok_or_else(bad_operand)?;
                match &dst.op_type {
                    X86OperandType::Reg(reg) => {
                        let (dst_reg, width) = self.gp_reg(*reg, &mnemonic, address)?;
                        let src = self.rvalue(src, next_address, &mnemonic, address, false)?;
                        ops.push(AccessorOp::Move {
                            dst: dst_reg,
                            src,
                            width,
                        });
                    }
                    X86OperandType::Mem(mem) => {
                        let mem = self.memref(mem, next_address, &mnemonic, address)?;
                        let src = self.rvalue(src, next_address, &mnemonic, address, false)?;
                        ops.push(AccessorOp::Store {
                            mem,
                            src,
                            size: dst.size,
                        });
                    }
                    _ => return Err(bad_operand()),
                }
            }
            "movzx" | "movsx" | "movsxd" => {
                let signed = mnemonic != "movzx";
                let (dst, src) = two_operands(&operands).ok_or_else(bad_operand)?;
                let X86OperandType::Reg(dst_id) = &dst.op_type else {
                    return Err(bad_operand());
                };
                let (dst_reg, width) = self.gp_reg(*dst_id, &mnemonic, address)?;
                match &src.op_type {
                    X86OperandType::Mem(mem) => {
                        let mem = self.memref(mem, next_address, &mnemonic, address)?;
                        ops.push(AccessorOp::Move {
                            dst: dst_reg,
                            src: RValue::Mem {
                                mem,
                                size: src.size,
                                sign_extend: signed,
                            },
                            width,
                        });
                    }
                    X86OperandType::Reg(src_id) => {
                        let (src_reg, src_width) = self.gp_reg(*src_id, &mnemonic, address)?;
                        ops.push(AccessorOp::Extend {
                            dst: dst_reg,
                            src: src_reg,
                            from_bits: src_width * 8,
                            signed,
                        });
                        if signed && width == 4 {
                            // 32-bit destinations zero the upper half.
                            ops.push(AccessorOp::Extend {
                                dst: dst_reg,
                                src: dst_reg,
                                from_bits: 32,
                                signed: false,
                            });
                        }
                    }
                    _ => return Err(bad_operand()),
                }
            }
            "lea" => {
                let (dst, src) = two_operands(&operands).ok_or_else(bad_operand)?;
                let X86OperandType::Reg(dst_id) = &dst.op_type else {
                    return Err(bad_operand());
                };
                let X86OperandType::Mem(mem) = &src.op_type else {
                    return Err(bad_operand());
                };
                let (dst_reg, _) = self.gp_reg(*dst_id, &mnemonic, address)?;
                let mem = self.memref(mem, next_address, &mnemonic, address)?;
                ops.push(AccessorOp::Lea { dst: dst_reg, mem });
            }
            "add" | "sub" | "and" | "or" | "xor" | "shl" | "sal" | "shr" | "sar" => {
                let op = match mnemonic.as_str() {
                    "add" => AluOp::Add,
                    "sub" => AluOp::Sub,
                    "and" => AluOp::And,
                    "or" => AluOp::Or,
                    "xor" => AluOp::Xor,
                    "shl" | "sal" => AluOp::Shl,
                    "shr" => AluOp::Shr,
                    _ => AluOp::Sar,
                };
                let (dst, src) = two_operands(&operands).ok_or_else(bad_operand)?;
                let X86OperandType::Reg(dst_id) = &dst.op_type else {
                    return Err(bad_operand());
                };
                let (dst_reg, width) = self.gp_reg(*dst_id, &mnemonic, address)?;
                let src = self.rvalue(src, next_address, &mnemonic, address, false)?;
                ops.push(AccessorOp::Alu {
                    op,
                    dst: dst_reg,
                    src,
                    width,
                });
            }
            "inc" | "dec" => {
                let dst = operands.first().ok_or_else(bad_operand)?;
                let X86OperandType::Reg(dst_id) = &dst.op_type else {
                    return Err(bad_operand());
                };
                let (dst_reg, width) = self.gp_reg(*dst_id, &mnemonic, address)?;
                ops.push(AccessorOp::Alu {
                    op: if mnemonic == "inc" {
                        AluOp::Add
                    } else {
                        AluOp::Sub
                    },
                    dst: dst_reg,
                    src: RValue::Imm(1),
                    width,
                });
            }
            "cmp" | "test" => {
                let (a, b) = two_operands(&operands).ok_or_else(bad_operand)?;
                let a = self.rvalue(a, next_address, &mnemonic, address, true)?;
                let b = self.rvalue(b, next_address, &mnemonic, address, true)?;
                ops.push(if mnemonic == "cmp" {
                    AccessorOp::Compare { a, b }
                } else {
                    AccessorOp::Test { a, b }
                });
            }
            "push" | "pop" => {
                let opnd = operands.first().ok_or_else(bad_operand)?;
                let X86OperandType::Reg(id) = &opnd.op_type else {
                    return Err(bad_operand());
                };
                let (reg, width) = self.gp_reg(*id, &mnemonic, address)?;
                if width != 8 {
                    return Err(bad_operand());
                }
                ops.push(if mnemonic == "push" {
                    AccessorOp::Push { src: reg }
                } else {
                    AccessorOp::Pop { dst: reg }
                });
            }
            "jmp" => {
                let target = branch_target(&operands).ok_or_else(bad_operand)?;
                fixups.push((ops.len(), target));
                ops.push(AccessorOp::Jump { target: 0 });
            }
            m if m.starts_with("set") => {
                let cond = condition_suffix(&m[3..]).ok_or_else(unsupported)?;
                let dst = operands.first().ok_or_else(bad_operand)?;
                let X86OperandType::Reg(id) = &dst.op_type else {
                    return Err(bad_operand());
                };
                let (reg, _) = self.gp_reg(*id, &mnemonic, address)?;
                ops.push(AccessorOp::SetCond { dst: reg, cond });
            }
            m if m.starts_with('j') => {
                let cond = condition_suffix(&m[1..]).ok_or_else(unsupported)?;
                let target = branch_target(&operands).ok_or_else(bad_operand)?;
                fixups.push((ops.len(), target));
                ops.push(AccessorOp::JumpIf { cond, target: 0 });
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }

    fn operands(&self, insn: &Insn<'_>) -> Result<Vec<X86Operand>, LiftError> {
        let detail = self.cs.insn_detail(insn)?;
        Ok(detail
            .arch_detail()
            .operands()
            .into_iter()
            .filter_map(|op| match op {
                ArchOperand::X86Operand(x) => Some(x),
                _ => None,
            })
            .collect())
    }

    /// Map a capstone register id to a GP slot and operand width in bytes.
    /// High-byte registers (ah..bh) and everything non-GP are unsupported.
    fn gp_reg(&self, reg: RegId, mnemonic: &str, address: u64) -> Result<(Reg, u8), LiftError> {
        let name = self.cs.reg_name(reg).unwrap_or_default();
        gp_reg_by_name(&name).ok_or_else(|| LiftError::UnsupportedOperand {
            mnemonic: mnemonic.to_string(),
            address,
        })
    }

    fn memref(
        &self,
        mem: &X86OpMem,
        next_address: u64,
        mnemonic: &str,
        address: u64,
    ) -> Result<MemRef, LiftError> {
        let bad = || LiftError::UnsupportedOperand {
            mnemonic: mnemonic.to_string(),
            address,
        };

        let mut out = MemRef {
            base: None,
            index: None,
            disp: mem.disp(),
        };

        if mem.base().0 != 0 {
            let base_name = self.cs.reg_name(mem.base()).unwrap_or_default();
            if base_name == "rip" {
                // Fold rip-relative addressing into an absolute displacement.
                out.disp = next_address.wrapping_add(mem.disp() as u64) as i64;
            } else {
                let (base, width) = gp_reg_by_name(&base_name).ok_or_else(bad)?;
                if width != 8 {
                    return Err(bad());
                }
                out.base = Some(base);
            }
        }
        if mem.index().0 != 0 {
            let index_name = self.cs.reg_name(mem.index()).unwrap_or_default();
            let (index, width) = gp_reg_by_name(&index_name).ok_or_else(bad)?;
            if width != 8 {
                return Err(bad());
            }
            out.index = Some((index, mem.scale() as u8));
        }
        Ok(out)
    }

    fn rvalue(
        &self,
        op: &X86Operand,
        next_address: u64,
        mnemonic: &str,
        address: u64,
        sign_extend_loads: bool,
    ) -> Result<RValue, LiftError> {
        match &op.op_type {
            X86OperandType::Reg(reg) => {
                let (reg, width) = self.gp_reg(*reg, mnemonic, address)?;
                Ok(RValue::Reg { reg, width })
            }
            X86OperandType::Imm(v) => Ok(RValue::Imm(*v)),
            X86OperandType::Mem(mem) => {
                let mem = self.memref(mem, next_address, mnemonic, address)?;
                Ok(RValue::Mem {
                    mem,
                    size: op.size,
                    // Sub-width compare operands are widened the way cmp
                    // widens its immediate: sign extension.
                    sign_extend: sign_extend_loads && op.size < 8,
                })
            }
            _ => Err(LiftError::UnsupportedOperand {
                mnemonic: mnemonic.to_string(),
                address,
            }),
        }
    }
}

fn two_operands(operands: &[X86Operand]) -> Option<(&X86Operand, &X86Operand)> {
    match operands {
        [a, b] => Some((a, b)),
        _ => None,
    }
}

fn branch_target(operands: &[X86Operand]) -> Option<u64> {
    match operands {
        [op] => match &op.op_type {
            X86OperandType::Imm(target) => Some(*target as u64),
            _ => None,
        },
        _ => None,
    }
}

fn condition_suffix(suffix: &str) -> Option<Cond> {
    let cond = match suffix {
        "e" | "z" => Cond::Eq,
        "ne" | "nz" => Cond::Ne,
        "a" | "nbe" => Cond::Above,
        "ae" | "nb" | "nc" => Cond::AboveEq,
        "b" | "c" | "nae" => Cond::Below,
        "be" | "na" => Cond::BelowEq,
        "g" | "nle" => Cond::Greater,
        "ge" | "nl" => Cond::GreaterEq,
        "l" | "nge" => Cond::Less,
        "le" | "ng" => Cond::LessEq,
        _ => return None,
    };
    Some(cond)
}

fn gp_reg_by_name(name: &str) -> Option<(Reg, u8)> {
    #[rustfmt::skip]
    let table: &[(&str, u8, u8)] = &[
        ("rax", 0, 8), ("eax", 0, 4), ("ax", 0, 2), ("al", 0, 1),
        ("rcx", 1, 8), ("ecx", 1, 4), ("cx", 1, 2), ("cl", 1, 1),
        ("rdx", 2, 8), ("edx", 2, 4), ("dx", 2, 2), ("dl", 2, 1),
        ("rbx", 3, 8), ("ebx", 3, 4), ("bx", 3, 2), ("bl", 3, 1),
        ("rsp", 4, 8), ("esp", 4, 4), ("sp", 4, 2), ("spl", 4, 1),
        ("rbp", 5, 8), ("ebp", 5, 4), ("bp", 5, 2), ("bpl", 5, 1),
        ("rsi", 6, 8), ("esi", 6, 4), ("si", 6, 2), ("sil", 6, 1),
        ("rdi", 7, 8), ("edi", 7, 4), ("di", 7, 2), ("dil", 7, 1),
        ("r8", 8, 8), ("r8d", 8, 4), ("r8w", 8, 2), ("r8b", 8, 1),
        ("r9", 9, 8), ("r9d", 9, 4), ("r9w", 9, 2), ("r9b", 9, 1),
        ("r10", 10, 8), ("r10d", 10, 4), ("r10w", 10, 2), ("r10b", 10, 1),
        ("r11", 11, 8), ("r11d", 11, 4), ("r11w", 11, 2), ("r11b", 11, 1),
        ("r12", 12, 8), ("r12d", 12, 4), ("r12w", 12, 2), ("r12b", 12, 1),
        ("r13", 13, 8), ("r13d", 13, 4), ("r13w", 13, 2), ("r13b", 13, 1),
        ("r14", 14, 8), ("r14d", 14, 4), ("r14w", 14, 2), ("r14b", 14, 1),
        ("r15", 15, 8), ("r15d", 15, 4), ("r15w", 15, 2), ("r15b", 15, 1),
    ];
    table
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|&(_, idx, width)| (Reg(idx), width))
}
