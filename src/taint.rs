use std::collections::{BTreeSet, HashMap};

use vex_ir::{Expr, IrBlock, Stmt};

/// Result returned by the taint flow analyzer.
pub type Result<T> = std::result::Result<T, Error>;

/// Analysis failures. Any of these means the block cannot be tracked and
/// concrete execution of it must not proceed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported statement {kind} at index {index}")]
    UnsupportedStmt { index: usize, kind: &'static str },

    #[error("unsupported expression {0}")]
    UnsupportedExpr(&'static str),
}

/// A value that can carry taint: a guest register (by byte offset into the
/// register file), a block-local IR temporary, or a memory location described
/// by the entities its address is computed from. Ordering makes the address
/// entity list of a `Memory` entity canonical, so structurally equal memory
/// references compare equal regardless of discovery order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaintEntity {
    Register(u64),
    Temp(u64),
    Memory(Vec<TaintEntity>),
}

/// Set of taint entities with deterministic iteration order.
pub type EntitySet = BTreeSet<TaintEntity>;

/// A taint sink together with the guest instruction it occurs at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaintSink {
    pub entity: TaintEntity,
    pub instr_addr: u64,
}

/// Cacheable taint summary of one lifted block: the `(sink, sources)`
/// relation in statement order (later sinks may read earlier ones), the
/// entities each instruction's ITE guards depend on, and the entities the
/// block's conditional exit guard depends on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockTaintSummary {
    pub flows: Vec<(TaintSink, EntitySet)>,
    pub ite_conds: HashMap<u64, EntitySet>,
    pub exit_guard_deps: EntitySet,
}

impl BlockTaintSummary {
    /// Compute the taint summary of `block`, lifted from `addr`.
    pub fn from_block(block: &IrBlock, addr: u64) -> Result<Self> {
        let mut summary = BlockTaintSummary::default();
        let mut curr_instr_addr = addr;
        let mut seen_imark = false;

        for (index, stmt) in block.stmts.iter().enumerate() {
            match stmt {
                Stmt::IMark { addr, .. } => {
                    curr_instr_addr = *addr;
                    seen_imark = true;
                }
                Stmt::Put { offset, data, .. } => {
                    debug_assert!(seen_imark, "register write before first instruction mark");
                    let sources = summary.sources_of(data, curr_instr_addr)?;
                    summary.record_flow(TaintEntity::Register(*offset), curr_instr_addr, sources);
                }
                Stmt::WrTmp { tmp, data } => {
                    debug_assert!(seen_imark, "temp write before first instruction mark");
                    let sources = summary.sources_of(data, curr_instr_addr)?;
                    summary.record_flow(TaintEntity::Temp(*tmp), curr_instr_addr, sources);
                }
                Stmt::Store { addr, data } => {
                    debug_assert!(seen_imark, "store before first instruction mark");
                    let address_entities = summary.sources_of(addr, curr_instr_addr)?;
                    let sources = summary.sources_of(data, curr_instr_addr)?;
                    summary.record_flow(
                        TaintEntity::Memory(address_entities.into_iter().collect()),
                        curr_instr_addr,
                        sources,
                    );
                }
                Stmt::Exit { guard, .. } => {
                    let deps = summary.sources_of(guard, curr_instr_addr)?;
                    summary.exit_guard_deps.extend(deps);
                }
                Stmt::NoOp | Stmt::AbiHint | Stmt::MemBar => {}
                Stmt::PutI { .. } => {
                    return Err(Error::UnsupportedStmt { index, kind: "PutI" })
                }
                Stmt::StoreG { .. } => {
                    return Err(Error::UnsupportedStmt { index, kind: "StoreG" })
                }
                Stmt::LoadG { .. } => {
                    return Err(Error::UnsupportedStmt { index, kind: "LoadG" })
                }
                Stmt::Cas { .. } => return Err(Error::UnsupportedStmt { index, kind: "Cas" }),
                Stmt::Llsc { .. } => {
                    return Err(Error::UnsupportedStmt { index, kind: "Llsc" })
                }
                Stmt::Dirty { .. } => {
                    return Err(Error::UnsupportedStmt { index, kind: "Dirty" })
                }
            }
        }

        Ok(summary)
    }

    fn record_flow(&mut self, entity: TaintEntity, instr_addr: u64, sources: EntitySet) {
        if !sources.is_empty() {
            self.flows.push((TaintSink { entity, instr_addr }, sources));
        }
    }

    /// Flatten the register, temporary and memory leaves `expr` reads. ITE
    /// guard entities are merged into [Self::ite_conds] under `instr_addr` on
    /// the way.
    fn sources_of(&mut self, expr: &Expr, instr_addr: u64) -> Result<EntitySet> {
        let mut sources = EntitySet::new();
        self.collect_sources(expr, instr_addr, &mut sources)?;
        Ok(sources)
    }

    fn collect_sources(
        &mut self,
        expr: &Expr,
        instr_addr: u64,
        out: &mut EntitySet,
    ) -> Result<()> {
        match expr {
            Expr::Const(_) => {}
            Expr::Get { offset, .. } => {
                out.insert(TaintEntity::Register(*offset));
            }
            Expr::RdTmp(tmp) => {
                out.insert(TaintEntity::Temp(*tmp));
            }
            Expr::Unop { arg, .. } => self.collect_sources(arg, instr_addr, out)?,
            Expr::Binop { args, .. } => {
                for arg in args.iter() {
                    self.collect_sources(arg, instr_addr, out)?;
                }
            }
            Expr::Triop { args, .. } => {
                for arg in args.iter() {
                    self.collect_sources(arg, instr_addr, out)?;
                }
            }
            Expr::Qop { args, .. } => {
                for arg in args.iter() {
                    self.collect_sources(arg, instr_addr, out)?;
                }
            }
            Expr::CCall { args, .. } => {
                for arg in args {
                    self.collect_sources(arg, instr_addr, out)?;
                }
            }
            Expr::Ite {
                cond,
                iftrue,
                iffalse,
            } => {
                let mut cond_entities = EntitySet::new();
                self.collect_sources(cond, instr_addr, &mut cond_entities)?;
                self.ite_conds
                    .entry(instr_addr)
                    .or_default()
                    .extend(cond_entities.iter().cloned());
                out.extend(cond_entities);
                self.collect_sources(iftrue, instr_addr, out)?;
                self.collect_sources(iffalse, instr_addr, out)?;
            }
            Expr::Load { addr, .. } => {
                let mut address_entities = EntitySet::new();
                self.collect_sources(addr, instr_addr, &mut address_entities)?;
                out.insert(TaintEntity::Memory(address_entities.into_iter().collect()));
            }
            Expr::GetI { .. } => return Err(Error::UnsupportedExpr("GetI")),
        }
        Ok(())
    }
}
