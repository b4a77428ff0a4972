//! The lifted accessor program
//!
//! An [`AccessorProgram`] is a pure function of (arguments, memory image):
//! a flat list of register-machine operations over the sixteen general
//! purpose registers, one compare-flag pair and a small scratch frame for
//! callee spills. Branch targets are pre-resolved operation indices. Programs
//! are immutable and shared; lifting the same function twice yields an
//! identical program.

use std::fmt;

/// A general purpose register slot, in x86-64 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

impl Reg {
    pub const RAX: Reg = Reg(0);
    pub const RCX: Reg = Reg(1);
    pub const RDX: Reg = Reg(2);
    pub const RBX: Reg = Reg(3);
    pub const RSP: Reg = Reg(4);
    pub const RBP: Reg = Reg(5);
    pub const RSI: Reg = Reg(6);
    pub const RDI: Reg = Reg(7);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const REG_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match REG_NAMES.get(self.index()) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "r?{}", self.0),
        }
    }
}

/// A memory operand: `base + index*scale + disp`, all parts optional.
/// RIP-relative addressing is folded into an absolute displacement at lift
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRef {
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    pub disp: i64,
}

impl MemRef {
    pub fn base_disp(base: Reg, disp: i64) -> Self {
        MemRef {
            base: Some(base),
            index: None,
            disp,
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut wrote = false;
        if let Some(base) = self.base {
            write!(f, "{base}")?;
            wrote = true;
        }
        if let Some((index, scale)) = self.index {
            if wrote {
                write!(f, "+")?;
            }
            write!(f, "{index}*{scale}")?;
            wrote = true;
        }
        if self.disp != 0 || !wrote {
            if self.disp >= 0 && wrote {
                write!(f, "+{:#x}", self.disp)?;
            } else {
                write!(f, "{:#x}", self.disp)?;
            }
        }
        write!(f, "]")
    }
}

/// A readable operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RValue {
    /// Register truncated to `width` bytes
    Reg { reg: Reg, width: u8 },
    Imm(i64),
    /// Memory load of `size` bytes, optionally sign-extended
    Mem {
        mem: MemRef,
        size: u8,
        sign_extend: bool,
    },
}

impl fmt::Display for RValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RValue::Reg { reg, width } => write!(f, "{reg}:{width}"),
            RValue::Imm(v) => write!(f, "{v:#x}"),
            RValue::Mem {
                mem,
                size,
                sign_extend,
            } => write!(f, "{}{mem}:{size}", if *sign_extend { "s" } else { "" }),
        }
    }
}

/// Branch/set condition, evaluated against the last compare pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Above,
    AboveEq,
    Below,
    BelowEq,
    Greater,
    GreaterEq,
    Less,
    LessEq,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Above => "a",
            Cond::AboveEq => "ae",
            Cond::Below => "b",
            Cond::BelowEq => "be",
            Cond::Greater => "g",
            Cond::GreaterEq => "ge",
            Cond::Less => "l",
            Cond::LessEq => "le",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Sar => "sar",
        };
        write!(f, "{s}")
    }
}

/// One operation of a lifted accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorOp {
    /// Write `src` to `dst` with x86 sub-register width semantics: 8-byte
    /// writes replace, 4-byte writes zero the upper half, 1/2-byte writes
    /// merge into the low bits.
    Move { dst: Reg, src: RValue, width: u8 },
    /// Address computation without a load
    Lea { dst: Reg, mem: MemRef },
    Alu {
        op: AluOp,
        dst: Reg,
        src: RValue,
        width: u8,
    },
    /// Zero/sign extension of a sub-register into a full register
    Extend {
        dst: Reg,
        src: Reg,
        from_bits: u8,
        signed: bool,
    },
    /// Store into the scratch frame (spill); stores to image memory fail at
    /// evaluation time, the image is immutable
    Store { mem: MemRef, src: RValue, size: u8 },
    Compare { a: RValue, b: RValue },
    Test { a: RValue, b: RValue },
    SetCond { dst: Reg, cond: Cond },
    Jump { target: usize },
    JumpIf { cond: Cond, target: usize },
    Push { src: Reg },
    Pop { dst: Reg },
    Return,
}

impl fmt::Display for AccessorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessorOp::Move { dst, src, width } => write!(f, "mov{width} {dst}, {src}"),
            AccessorOp::Lea { dst, mem } => write!(f, "lea {dst}, {mem}"),
            AccessorOp::Alu {
                op,
                dst,
                src,
                width,
            } => write!(f, "{op}{width} {dst}, {src}"),
            AccessorOp::Extend {
                dst,
                src,
                from_bits,
                signed,
            } => write!(
                f,
                "{}ext {dst}, {src}:{from_bits}",
                if *signed { "s" } else { "z" }
            ),
            AccessorOp::Store { mem, src, size } => write!(f, "store{size} {mem}, {src}"),
            AccessorOp::Compare { a, b } => write!(f, "cmp {a}, {b}"),
            AccessorOp::Test { a, b } => write!(f, "test {a}, {b}"),
            AccessorOp::SetCond { dst, cond } => write!(f, "set{cond} {dst}"),
            AccessorOp::Jump { target } => write!(f, "jmp @{target}"),
            AccessorOp::JumpIf { cond, target } => write!(f, "j{cond} @{target}"),
            AccessorOp::Push { src } => write!(f, "push {src}"),
            AccessorOp::Pop { dst } => write!(f, "pop {dst}"),
            AccessorOp::Return => write!(f, "ret"),
        }
    }
}

/// A lifted accessor: the executable intermediate form of one compiled
/// function. Cached by (module build identity, function address) and reused
/// for every object of the owning type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorProgram {
    /// Mangled name of the lifted function, for diagnostics
    pub linkage_name: String,
    /// Link-time entry address of the function
    pub function_address: u64,
    pub ops: Vec<AccessorOp>,
}

impl AccessorProgram {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl fmt::Display for AccessorProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} @ {:#x}:", self.linkage_name, self.function_address)?;
        for (i, op) in self.ops.iter().enumerate() {
            writeln!(f, "  {i:3}: {op}")?;
        }
        Ok(())
    }
}
