/// Byte offset into the guest register file.
pub type RegOffset = u64;

/// Identifier of a block-local IR temporary.
pub type TmpId = u64;

/// Value types attached to register and memory accesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    V128,
    V256,
}

impl Ty {
    /// Width of a value of this type in bytes. `I1` occupies a full byte when
    /// stored, matching the lifter's layout rules.
    pub fn size_bytes(self) -> u64 {
        match self {
            Ty::I1 | Ty::I8 => 1,
            Ty::I16 => 2,
            Ty::I32 | Ty::F32 => 4,
            Ty::I64 | Ty::F64 => 8,
            Ty::I128 | Ty::V128 => 16,
            Ty::V256 => 32,
        }
    }
}

/// Expression operators. The set is deliberately coarse: block analyses in
/// this workspace reason about operand flow, not operator semantics, so only
/// the operator families needed to faithfully round-trip lifter output are
/// distinguished. Unknown lifter operators map to `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Sub,
    Mul,
    DivU,
    DivS,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Not,
    Neg,
    CmpEq,
    CmpNe,
    CmpLtU,
    CmpLtS,
    CmpLeU,
    CmpLeS,
    Widen,
    Narrow,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMulAdd,
    Other(u32),
}

/// Constant leaf values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Const {
    U1(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F64(f64),
    V128(u16),
    V256(u32),
}

/// Where control flow leaves a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpKind {
    Boring,
    Call,
    Ret,
    Syscall,
    NoDecode,
    SigTrap,
}

/// IR expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Constant value.
    Const(Const),
    /// Read of a register at a fixed byte offset.
    Get { offset: RegOffset, ty: Ty },
    /// Indexed register-file read. Not analyzable: the accessed offset is
    /// only known at run time.
    GetI {
        base: RegOffset,
        ty: Ty,
        index: Box<Expr>,
        bias: i32,
        elems: u32,
    },
    /// Read of a block-local temporary.
    RdTmp(TmpId),
    Unop { op: Op, arg: Box<Expr> },
    Binop { op: Op, args: Box<[Expr; 2]> },
    Triop { op: Op, args: Box<[Expr; 3]> },
    Qop { op: Op, args: Box<[Expr; 4]> },
    /// Memory load at a computed address.
    Load { ty: Ty, addr: Box<Expr> },
    /// If-then-else select.
    Ite {
        cond: Box<Expr>,
        iftrue: Box<Expr>,
        iffalse: Box<Expr>,
    },
    /// Call to a pure helper; the result depends on every argument.
    CCall { ret_ty: Ty, func: &'static str, args: Vec<Expr> },
}

impl Expr {
    pub fn rdtmp(tmp: TmpId) -> Self {
        Expr::RdTmp(tmp)
    }

    pub fn get(offset: RegOffset, ty: Ty) -> Self {
        Expr::Get { offset, ty }
    }

    pub fn const_u64(value: u64) -> Self {
        Expr::Const(Const::U64(value))
    }

    pub fn load(ty: Ty, addr: Expr) -> Self {
        Expr::Load {
            ty,
            addr: Box::new(addr),
        }
    }

    pub fn unop(op: Op, arg: Expr) -> Self {
        Expr::Unop {
            op,
            arg: Box::new(arg),
        }
    }

    pub fn binop(op: Op, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binop {
            op,
            args: Box::new([lhs, rhs]),
        }
    }

    pub fn ite(cond: Expr, iftrue: Expr, iffalse: Expr) -> Self {
        Expr::Ite {
            cond: Box::new(cond),
            iftrue: Box::new(iftrue),
            iffalse: Box::new(iffalse),
        }
    }
}

/// IR statements.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Padding; no effect.
    NoOp,
    /// Marks the boundary of a guest instruction.
    IMark { addr: u64, len: u32 },
    /// Call/return address hint for the guest ABI; no dataflow effect.
    AbiHint,
    /// Register write at a fixed byte offset.
    Put { offset: RegOffset, ty: Ty, data: Expr },
    /// Indexed register-file write. Not analyzable.
    PutI {
        base: RegOffset,
        index: Expr,
        bias: i32,
        data: Expr,
    },
    /// Temporary assignment.
    WrTmp { tmp: TmpId, data: Expr },
    /// Memory store at a computed address.
    Store { addr: Expr, data: Expr },
    /// Guarded store.
    StoreG { addr: Expr, data: Expr, guard: Expr },
    /// Guarded load with an alternative value.
    LoadG {
        dst: TmpId,
        addr: Expr,
        alt: Expr,
        guard: Expr,
    },
    /// Compare-and-swap.
    Cas {
        addr: Expr,
        expected: Expr,
        data: Expr,
    },
    /// Load-linked / store-conditional.
    Llsc {
        result: TmpId,
        addr: Expr,
        store_data: Option<Expr>,
    },
    /// Call to an impure helper with opaque side effects.
    Dirty {
        guard: Expr,
        args: Vec<Expr>,
        mem_addr: Option<Expr>,
    },
    /// Memory barrier; no dataflow effect.
    MemBar,
    /// Conditional side exit out of the block.
    Exit { guard: Expr, dst: u64, jk: JumpKind },
}

/// A lifted basic block: the statement sequence plus the expression computing
/// the fall-through successor address.
#[derive(Clone, Debug, PartialEq)]
pub struct IrBlock {
    pub stmts: Vec<Stmt>,
    pub next: Expr,
    pub jump_kind: JumpKind,
}

impl IrBlock {
    pub fn new(stmts: Vec<Stmt>, next: Expr, jump_kind: JumpKind) -> Self {
        Self {
            stmts,
            next,
            jump_kind,
        }
    }
}
