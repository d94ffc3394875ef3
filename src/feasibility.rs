use std::collections::BTreeSet;

use vex_ir::{Expr, IrBlock, Stmt, Ty};

/// Register byte offsets, tracked individually so partial-width accesses are
/// exact.
pub type RegSet = BTreeSet<u64>;

/// Cached feasibility facts about one block: whether it only contains
/// constructs the engine can execute concretely, which register bytes it
/// overwrites, and which it reads before overwriting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    pub try_emulate: bool,
    pub used: RegSet,
    pub clobbered: RegSet,
}

impl Default for BlockEntry {
    fn default() -> Self {
        Self {
            try_emulate: true,
            used: RegSet::new(),
            clobbered: RegSet::new(),
        }
    }
}

/// Analyze `block`, computing clobbered-before-read and used-before-clobber
/// register byte sets. Indexed register accesses, guarded and atomic memory
/// operations, impure helper calls, and 1-bit register I/O clear
/// `try_emulate`: the accessed locations cannot be determined (or synced
/// back) ahead of execution.
pub fn analyze(block: &IrBlock) -> BlockEntry {
    let mut entry = BlockEntry::default();

    for stmt in &block.stmts {
        if !check_stmt(&mut entry, stmt) {
            entry.try_emulate = false;
            return entry;
        }
    }
    if !check_expr(&mut entry, &block.next) {
        entry.try_emulate = false;
    }

    entry
}

fn mark_clobbered(entry: &mut BlockEntry, offset: u64, size: u64) {
    for byte in offset..offset + size {
        entry.clobbered.insert(byte);
    }
}

fn mark_read(entry: &mut BlockEntry, offset: u64, size: u64) {
    for byte in offset..offset + size {
        if !entry.clobbered.contains(&byte) {
            entry.used.insert(byte);
        }
    }
}

fn check_stmt(entry: &mut BlockEntry, stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Put { offset, ty, data } => {
            if !check_expr(entry, data) {
                return false;
            }
            if *ty == Ty::I1 {
                return false;
            }
            mark_clobbered(entry, *offset, ty.size_bytes());
            true
        }
        Stmt::WrTmp { data, .. } => check_expr(entry, data),
        Stmt::Store { addr, data } => check_expr(entry, addr) && check_expr(entry, data),
        Stmt::Exit { guard, .. } => check_expr(entry, guard),
        Stmt::NoOp | Stmt::IMark { .. } | Stmt::AbiHint | Stmt::MemBar => true,
        // An indirect register-file write cannot be resolved ahead of time,
        // and there is no way to observe it during execution either.
        Stmt::PutI { .. } => false,
        Stmt::StoreG { .. }
        | Stmt::LoadG { .. }
        | Stmt::Cas { .. }
        | Stmt::Llsc { .. }
        | Stmt::Dirty { .. } => false,
    }
}

fn check_expr(entry: &mut BlockEntry, expr: &Expr) -> bool {
    match expr {
        Expr::Const(_) | Expr::RdTmp(_) => true,
        Expr::Get { offset, ty } => {
            if *ty == Ty::I1 {
                return false;
            }
            mark_read(entry, *offset, ty.size_bytes());
            true
        }
        Expr::GetI { .. } => false,
        Expr::Unop { arg, .. } => check_expr(entry, arg),
        Expr::Binop { args, .. } => args.iter().all(|arg| check_expr(entry, arg)),
        Expr::Triop { args, .. } => args.iter().all(|arg| check_expr(entry, arg)),
        Expr::Qop { args, .. } => args.iter().all(|arg| check_expr(entry, arg)),
        Expr::Load { addr, .. } => check_expr(entry, addr),
        Expr::Ite {
            cond,
            iftrue,
            iffalse,
        } => check_expr(entry, cond) && check_expr(entry, iftrue) && check_expr(entry, iffalse),
        Expr::CCall { args, .. } => args.iter().all(|arg| check_expr(entry, arg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vex_ir::{JumpKind, Op};

    fn block(stmts: Vec<Stmt>) -> IrBlock {
        IrBlock::new(stmts, Expr::const_u64(0x2000), JumpKind::Boring)
    }

    #[test]
    fn read_before_clobber_is_used() {
        let b = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::WrTmp { tmp: 0, data: Expr::get(16, Ty::I64) },
            Stmt::Put { offset: 16, ty: Ty::I64, data: Expr::rdtmp(0) },
        ]);

        let entry = analyze(&b);
        assert!(entry.try_emulate);
        assert!(entry.used.contains(&16));
        assert!(entry.used.contains(&23));
        assert!(entry.clobbered.contains(&16));
    }

    #[test]
    fn read_after_clobber_is_not_used() {
        let b = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::Put { offset: 16, ty: Ty::I64, data: Expr::const_u64(1) },
            Stmt::WrTmp { tmp: 0, data: Expr::get(16, Ty::I64) },
        ]);

        let entry = analyze(&b);
        assert!(entry.try_emulate);
        assert!(entry.used.is_empty());
        assert_eq!(entry.clobbered.len(), 8);
    }

    #[test]
    fn partial_overlap_is_byte_precise() {
        // Clobber the low 4 bytes, then read all 8: only the high half is a
        // prior use.
        let b = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::Put { offset: 16, ty: Ty::I32, data: Expr::const_u64(0) },
            Stmt::WrTmp { tmp: 0, data: Expr::get(16, Ty::I64) },
        ]);

        let entry = analyze(&b);
        assert!(!entry.used.contains(&16));
        assert!(!entry.used.contains(&19));
        assert!(entry.used.contains(&20));
        assert!(entry.used.contains(&23));
    }

    #[test]
    fn put_data_is_read_before_clobbering() {
        // `put(rax, get(rax) + 1)` reads rax first, so it is both used and
        // clobbered.
        let b = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::Put {
                offset: 16,
                ty: Ty::I64,
                data: Expr::binop(Op::Add, Expr::get(16, Ty::I64), Expr::const_u64(1)),
            },
        ]);

        let entry = analyze(&b);
        assert!(entry.used.contains(&16));
        assert!(entry.clobbered.contains(&16));
    }

    #[test]
    fn one_bit_register_io_rejected() {
        let get = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::WrTmp { tmp: 0, data: Expr::get(128, Ty::I1) },
        ]);
        assert!(!analyze(&get).try_emulate);

        let put = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::Put { offset: 128, ty: Ty::I1, data: Expr::const_u64(0) },
        ]);
        assert!(!analyze(&put).try_emulate);
    }

    #[test]
    fn unsupported_statements_rejected() {
        let stmts: Vec<Stmt> = vec![
            Stmt::PutI {
                base: 0x100,
                index: Expr::rdtmp(0),
                bias: 0,
                data: Expr::rdtmp(1),
            },
            Stmt::Cas {
                addr: Expr::rdtmp(0),
                expected: Expr::rdtmp(1),
                data: Expr::rdtmp(2),
            },
            Stmt::Llsc {
                result: 0,
                addr: Expr::rdtmp(1),
                store_data: None,
            },
            Stmt::Dirty {
                guard: Expr::rdtmp(0),
                args: vec![],
                mem_addr: None,
            },
        ];

        for stmt in stmts {
            let b = block(vec![Stmt::IMark { addr: 0x1000, len: 4 }, stmt]);
            assert!(!analyze(&b).try_emulate);
        }
    }

    #[test]
    fn indexed_get_rejected() {
        let b = block(vec![
            Stmt::IMark { addr: 0x1000, len: 4 },
            Stmt::WrTmp {
                tmp: 0,
                data: Expr::GetI {
                    base: 0x100,
                    ty: Ty::I64,
                    index: Box::new(Expr::rdtmp(1)),
                    bias: 0,
                    elems: 8,
                },
            },
        ]);
        assert!(!analyze(&b).try_emulate);
    }

    #[test]
    fn next_expression_is_checked() {
        let b = IrBlock::new(
            vec![Stmt::IMark { addr: 0x1000, len: 4 }],
            Expr::get(184, Ty::I64),
            JumpKind::Ret,
        );

        let entry = analyze(&b);
        assert!(entry.try_emulate);
        assert!(entry.used.contains(&184));
    }
}
