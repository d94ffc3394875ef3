//! Concrete-execution co-processor for a symbolic execution engine.
//!
//! The engine hands a [session::Session] an emulator, a range of basic blocks
//! and a description of which guest registers currently hold symbolic values.
//! The session drives the emulator block by block, tracking per-byte memory
//! taint and per-register/temporary taint through an IR-level flow analysis
//! of each block, and stops cleanly — with memory and registers rolled back
//! to the last committed block — as soon as symbolic data would influence an
//! address, a branch guard or anything else concrete execution cannot
//! represent.
//!
//! ### Collaborators
//!
//! The CPU emulator is reached through the [emulator::Emulator] trait and
//! calls back through [emulator::EventHandler]; the machine-code lifter is
//! reached through [vex_ir::Lifter]. Neither is implemented here.

pub use vex_ir;

/// Emulator capability traits, register ids and event callbacks.
pub mod emulator;

/// Taint bitmap store, transactional write log and shared page cache.
pub mod mem;

/// Clobbered/used-register feasibility analysis of lifted blocks.
pub mod feasibility;

/// Taint entities and the block taint-flow analysis.
pub mod taint;

/// The session: hook dispatch, taint propagation, commit/rollback and the
/// controller surface exposed to the owning engine.
pub mod session;

pub use session::{CacheRegistry, Session, SharedCaches, StopReason, TransmitRecord};
