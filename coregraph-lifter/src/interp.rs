//! Bounded evaluation of accessor programs
//!
//! Evaluation is a pure function of (arguments, memory image). The register
//! file follows the SysV calling convention: arguments arrive in rdi, rsi,
//! rdx, rcx, r8, r9 and the result is read from rax. A small scratch frame
//! stands in for the callee's stack so spill code works; everything else is
//! read from the immutable image. Every operation costs one step against the
//! budget — the walked memory may be corrupted, so unbounded loops must
//! surface as divergence failures, not hangs.

use crate::error::EvalError;
use crate::program::{AccessorOp, AccessorProgram, AluOp, Cond, MemRef, RValue, Reg};
use coregraph_image::MemoryImage;

/// Default step budget. Generous for real accessors (typically under twenty
/// operations) while bounding walks over corrupted data.
pub const DEFAULT_STEP_BUDGET: usize = 4096;

/// Synthetic address of the scratch frame. Far outside any plausible
/// mapping, so image reads and scratch accesses never alias.
const SCRATCH_BASE: u64 = 0x7fff_ff00_0000;
const SCRATCH_LEN: usize = 1024;
/// Initial stack pointer, leaving push room below and spill room above.
const SCRATCH_TOP: u64 = SCRATCH_BASE + 768;

/// SysV integer argument registers, in order.
const ARG_REGS: [Reg; 6] = [
    Reg::RDI,
    Reg::RSI,
    Reg::RDX,
    Reg::RCX,
    Reg(8),
    Reg(9),
];

/// Evaluates accessor programs against one memory image.
pub struct Evaluator<'a> {
    image: &'a MemoryImage,
    step_budget: usize,
}

struct Flags {
    a: u64,
    b: u64,
    width: u8,
}

struct Machine {
    regs: [u64; 16],
    flags: Option<Flags>,
    scratch: [u8; SCRATCH_LEN],
}

impl<'a> Evaluator<'a> {
    pub fn new(image: &'a MemoryImage, step_budget: usize) -> Self {
        Self { image, step_budget }
    }

    /// Run a program with the given arguments; returns the value left in rax.
    pub fn evaluate(&self, program: &AccessorProgram, args: &[u64]) -> Result<u64, EvalError> {
        let mut m = Machine {
            regs: [0; 16],
            flags: None,
            scratch: [0; SCRATCH_LEN],
        };
        m.regs[Reg::RSP.index()] = SCRATCH_TOP;
        for (reg, &value) in ARG_REGS.iter().zip(args) {
            m.regs[reg.index()] = value;
        }

        let mut pc = 0usize;
        let mut steps = 0usize;
        loop {
            steps += 1;
            if steps > self.step_budget {
                return Err(EvalError::Divergence {
                    budget: self.step_budget,
                });
            }
            let op = program.ops.get(pc).ok_or(EvalError::NoReturn)?;
            pc += 1;
            match *op {
                AccessorOp::Move { dst, src, width } => {
                    let value = self.read(&m, &src)?;
                    write_reg(&mut m, dst, width, value);
                }
                AccessorOp::Lea { dst, mem } => {
                    let addr = effective_address(&m, &mem);
                    write_reg(&mut m, dst, 8, addr);
                }
                AccessorOp::Alu {
                    op,
                    dst,
                    src,
                    width,
                } => {
                    let a = mask(m.regs[dst.index()], width);
                    let b = mask(self.read(&m, &src)?, width);
                    let result = match op {
                        AluOp::Add => a.wrapping_add(b),
                        AluOp::Sub => a.wrapping_sub(b),
                        AluOp::And => a & b,
                        AluOp::Or => a | b,
                        AluOp::Xor => a ^ b,
                        AluOp::Shl => a.wrapping_shl(b as u32 & 63),
                        AluOp::Shr => a.wrapping_shr(b as u32 & 63),
                        AluOp::Sar => {
                            (sign_extend(a, width).wrapping_shr(b as u32 & 63)) as u64
                        }
                    };
                    write_reg(&mut m, dst, width, result);
                }
                AccessorOp::Extend {
                    dst,
                    src,
                    from_bits,
                    signed,
                } => {
                    let raw = m.regs[src.index()] & ones(from_bits);
                    let value = if signed {
                        sign_extend(raw, from_bits / 8) as u64
                    } else {
                        raw
                    };
                    write_reg(&mut m, dst, 8, value);
                }
                AccessorOp::Store { mem, src, size } => {
                    let addr = effective_address(&m, &mem);
                    let value = self.read(&m, &src)?;
                    store_scratch(&mut m, addr, size, value)?;
                }
                AccessorOp::Compare { a, b } => {
                    let width = rvalue_width(&a).max(rvalue_width(&b));
                    let a = self.read(&m, &a)?;
                    let b = self.read(&m, &b)?;
                    m.flags = Some(Flags { a, b, width });
                }
                AccessorOp::Test { a, b } => {
                    let width = rvalue_width(&a).max(rvalue_width(&b));
                    let a = self.read(&m, &a)?;
                    let b = self.read(&m, &b)?;
                    m.flags = Some(Flags {
                        a: a & b,
                        b: 0,
                        width,
                    });
                }
                AccessorOp::SetCond { dst, cond } => {
                    let value = eval_cond(&m, cond)? as u64;
                    write_reg(&mut m, dst, 1, value);
                }
                AccessorOp::Jump { target } => pc = target,
                AccessorOp::JumpIf { cond, target } => {
                    if eval_cond(&m, cond)? {
                        pc = target;
                    }
                }
                AccessorOp::Push { src } => {
                    let value = m.regs[src.index()];
                    let addr = m.regs[Reg::RSP.index()].wrapping_sub(8);
                    m.regs[Reg::RSP.index()] = addr;
                    store_scratch(&mut m, addr, 8, value)?;
                }
                AccessorOp::Pop { dst } => {
                    let addr = m.regs[Reg::RSP.index()];
                    let value = self.load(&m, addr, 8)?;
                    m.regs[Reg::RSP.index()] = addr.wrapping_add(8);
                    write_reg(&mut m, dst, 8, value);
                }
                AccessorOp::Return => return Ok(m.regs[Reg::RAX.index()]),
            }
        }
    }

    fn read(&self, m: &Machine, value: &RValue) -> Result<u64, EvalError> {
        match value {
            RValue::Reg { reg, width } => Ok(mask(m.regs[reg.index()], *width)),
            RValue::Imm(v) => Ok(*v as u64),
            RValue::Mem {
                mem,
                size,
                sign_extend: sext,
            } => {
                let addr = effective_address(m, mem);
                let raw = self.load(m, addr, *size)?;
                Ok(if *sext {
                    sign_extend(raw, *size) as u64
                } else {
                    raw
                })
            }
        }
    }

    fn load(&self, m: &Machine, addr: u64, size: u8) -> Result<u64, EvalError> {
        if let Some(offset) = scratch_offset(addr, size) {
            let mut buf = [0u8; 8];
            buf[..size as usize].copy_from_slice(&m.scratch[offset..offset + size as usize]);
            return Ok(u64::from_le_bytes(buf));
        }
        let result = match size {
            1 => self.image.read_u8(addr).map(u64::from),
            2 => self.image.read_u16(addr).map(u64::from),
            4 => self.image.read_u32(addr).map(u64::from),
            _ => self.image.read_u64(addr),
        };
        result.map_err(|_| EvalError::InvalidMemoryReference { addr })
    }
}

fn effective_address(m: &Machine, mem: &MemRef) -> u64 {
    let mut addr = mem.disp as u64;
    if let Some(base) = mem.base {
        addr = addr.wrapping_add(m.regs[base.index()]);
    }
    if let Some((index, scale)) = mem.index {
        addr = addr.wrapping_add(m.regs[index.index()].wrapping_mul(scale as u64));
    }
    addr
}

fn scratch_offset(addr: u64, size: u8) -> Option<usize> {
    let end = SCRATCH_BASE + SCRATCH_LEN as u64;
    if addr >= SCRATCH_BASE && addr + size as u64 <= end {
        Some((addr - SCRATCH_BASE) as usize)
    } else {
        None
    }
}

fn store_scratch(m: &mut Machine, addr: u64, size: u8, value: u64) -> Result<(), EvalError> {
    let offset =
        scratch_offset(addr, size).ok_or(EvalError::StoreOutsideScratch { addr })?;
    m.scratch[offset..offset + size as usize]
        .copy_from_slice(&value.to_le_bytes()[..size as usize]);
    Ok(())
}

fn mask(value: u64, width: u8) -> u64 {
    match width {
        8 => value,
        w => value & ones(w * 8),
    }
}

fn ones(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(value: u64, width_bytes: u8) -> i64 {
    match width_bytes {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        _ => value as i64,
    }
}

/// x86 sub-register write semantics: 64-bit writes replace, 32-bit writes
/// zero the upper half, 16/8-bit writes merge into the low bits.
fn write_reg(m: &mut Machine, dst: Reg, width: u8, value: u64) {
    let slot = &mut m.regs[dst.index()];
    *slot = match width {
        8 => value,
        4 => value & 0xffff_ffff,
        2 => (*slot & !0xffff) | (value & 0xffff),
        _ => (*slot & !0xff) | (value & 0xff),
    };
}

fn eval_cond(m: &Machine, cond: Cond) -> Result<bool, EvalError> {
    let flags = m.flags.as_ref().ok_or(EvalError::FlagsUnset)?;
    let (ua, ub) = (mask(flags.a, flags.width), mask(flags.b, flags.width));
    let (sa, sb) = (
        sign_extend(ua, flags.width),
        sign_extend(ub, flags.width),
    );
    Ok(match cond {
        Cond::Eq => ua == ub,
        Cond::Ne => ua != ub,
        Cond::Above => ua > ub,
        Cond::AboveEq => ua >= ub,
        Cond::Below => ua < ub,
        Cond::BelowEq => ua <= ub,
        Cond::Greater => sa > sb,
        Cond::GreaterEq => sa >= sb,
        Cond::Less => sa < sb,
        Cond::LessEq => sa <= sb,
    })
}

fn rvalue_width(value: &RValue) -> u8 {
    match value {
        RValue::Reg { width, .. } => *width,
        RValue::Imm(_) => 0,
        RValue::Mem { size, .. } => *size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregraph_image::{MemoryRegion, Permissions};

    fn image_with(addr: u64, bytes: Vec<u8>) -> MemoryImage {
        MemoryImage::from_regions(vec![MemoryRegion::new(addr, Permissions::RW, bytes)]).unwrap()
    }

    fn program(ops: Vec<AccessorOp>) -> AccessorProgram {
        AccessorProgram {
            linkage_name: "test".to_string(),
            function_address: 0x1000,
            ops,
        }
    }

    #[test]
    fn load_through_receiver_pointer() {
        // mov rax, [rdi]; ret
        let img = image_with(0x2000, 0x1122334455667788u64.to_le_bytes().to_vec());
        let prog = program(vec![
            AccessorOp::Move {
                dst: Reg::RAX,
                src: RValue::Mem {
                    mem: MemRef::base_disp(Reg::RDI, 0),
                    size: 8,
                    sign_extend: false,
                },
                width: 8,
            },
            AccessorOp::Return,
        ]);
        let out = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
            .evaluate(&prog, &[0x2000])
            .unwrap();
        assert_eq!(out, 0x1122334455667788);
    }

    #[test]
    fn unmapped_dereference_is_reported() {
        let img = image_with(0x2000, vec![0; 8]);
        let prog = program(vec![
            AccessorOp::Move {
                dst: Reg::RAX,
                src: RValue::Mem {
                    mem: MemRef::base_disp(Reg::RDI, 0),
                    size: 8,
                    sign_extend: false,
                },
                width: 8,
            },
            AccessorOp::Return,
        ]);
        let err = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
            .evaluate(&prog, &[0xdead0000])
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::InvalidMemoryReference { addr: 0xdead0000 }
        );
    }

    #[test]
    fn infinite_loop_diverges_within_budget() {
        let img = image_with(0x2000, vec![0; 8]);
        let prog = program(vec![AccessorOp::Jump { target: 0 }]);
        let err = Evaluator::new(&img, 100).evaluate(&prog, &[]).unwrap_err();
        assert_eq!(err, EvalError::Divergence { budget: 100 });
    }

    #[test]
    fn spills_go_to_scratch_not_image() {
        // push rbp; mov rbp, rsp; mov [rbp-8], rdi; mov rax, [rbp-8]; pop rbp; ret
        let img = image_with(0x2000, vec![0; 8]);
        let prog = program(vec![
            AccessorOp::Push { src: Reg::RBP },
            AccessorOp::Move {
                dst: Reg::RBP,
                src: RValue::Reg {
                    reg: Reg::RSP,
                    width: 8,
                },
                width: 8,
            },
            AccessorOp::Store {
                mem: MemRef::base_disp(Reg::RBP, -8),
                src: RValue::Reg {
                    reg: Reg::RDI,
                    width: 8,
                },
                size: 8,
            },
            AccessorOp::Move {
                dst: Reg::RAX,
                src: RValue::Mem {
                    mem: MemRef::base_disp(Reg::RBP, -8),
                    size: 8,
                    sign_extend: false,
                },
                width: 8,
            },
            AccessorOp::Pop { dst: Reg::RBP },
            AccessorOp::Return,
        ]);
        let out = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
            .evaluate(&prog, &[0x4242])
            .unwrap();
        assert_eq!(out, 0x4242);
    }

    #[test]
    fn store_into_image_is_refused() {
        let img = image_with(0x2000, vec![0; 8]);
        let prog = program(vec![
            AccessorOp::Store {
                mem: MemRef::base_disp(Reg::RDI, 0),
                src: RValue::Imm(1),
                size: 8,
            },
            AccessorOp::Return,
        ]);
        let err = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
            .evaluate(&prog, &[0x2000])
            .unwrap_err();
        assert_eq!(err, EvalError::StoreOutsideScratch { addr: 0x2000 });
    }

    #[test]
    fn conditional_selects_branch() {
        // if *(u32*)rdi == 7 { rax = rdi + 8 } else { rax = 0 }
        let mut bytes = 7u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 12]);
        let img = image_with(0x3000, bytes);
        let prog = program(vec![
            AccessorOp::Compare {
                a: RValue::Mem {
                    mem: MemRef::base_disp(Reg::RDI, 0),
                    size: 4,
                    sign_extend: true,
                },
                b: RValue::Imm(7),
            },
            AccessorOp::JumpIf {
                cond: Cond::Ne,
                target: 4,
            },
            AccessorOp::Lea {
                dst: Reg::RAX,
                mem: MemRef::base_disp(Reg::RDI, 8),
            },
            AccessorOp::Return,
            AccessorOp::Move {
                dst: Reg::RAX,
                src: RValue::Imm(0),
                width: 4,
            },
            AccessorOp::Return,
        ]);
        let ev = Evaluator::new(&img, DEFAULT_STEP_BUDGET);
        assert_eq!(ev.evaluate(&prog, &[0x3000]).unwrap(), 0x3008);

        // Change the selector: the else branch returns null.
        let img2 = image_with(0x3000, vec![0u8; 16]);
        let ev2 = Evaluator::new(&img2, DEFAULT_STEP_BUDGET);
        assert_eq!(ev2.evaluate(&prog, &[0x3000]).unwrap(), 0);
    }
}
