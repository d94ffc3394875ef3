use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::emulator::{
    self, AccessKind, Arch, Emulator, EmulatorOps, EventHandler, Protection, RegisterContext,
    reg,
};
use crate::feasibility::{self, BlockEntry};
use crate::mem::{self, MemRange, PageCache, Taint, TaintMap, WriteLog, PAGE_SIZE};
use crate::taint::{BlockTaintSummary, TaintEntity, TaintSink};
use vex_ir::{ArchInfo, GuestArch, Lifter, DEFAULT_MAX_INSNS};

/// Result returned by session APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session controller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Mem(#[from] mem::Error),

    #[error("failed to map cached pages at {addr:#x}")]
    MapFailed { addr: u64 },
}

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    StopPoint,
    Error,
    Syscall,
    ExecNone,
    ZeroPage,
    NoStart,
    Segfault,
    ZeroDiv,
    NoDecode,
    Hlt,
    LiftFailed,
    SymbolicCondition,
    SymbolicReadAddr,
    SymbolicWriteAddr,
}

impl StopReason {
    /// Human-readable description attached to the logged stop event.
    pub fn message(self) -> &'static str {
        match self {
            StopReason::Normal => "reached maximum steps",
            StopReason::StopPoint => "hit a stop point",
            StopReason::Error => "something went wrong",
            StopReason::Syscall => "unable to handle syscall",
            StopReason::ExecNone => "fetching empty page",
            StopReason::ZeroPage => "accessing zero page",
            StopReason::NoStart => "failed to start",
            StopReason::Segfault => "permissions or mapping error",
            StopReason::ZeroDiv => "divide by zero",
            StopReason::NoDecode => "instruction decoding error",
            StopReason::Hlt => "hit a halt instruction",
            StopReason::LiftFailed => "failed to lift block to IR",
            StopReason::SymbolicCondition => "symbolic condition for ITE or exit",
            StopReason::SymbolicReadAddr => "attempted to read from symbolic address",
            StopReason::SymbolicWriteAddr => "attempted to write to symbolic address",
        }
    }
}

/// Maximum byte span of one translated block. The emulator reports a size of
/// zero for blocks it had to split, in which case stop points are checked
/// against this bound instead; some stop points may fire a block early as a
/// result.
pub const MAX_BLOCK_SPAN: u32 = 800;

// Guest register-file byte offsets of eax..ebx and esi in the 32-bit x86
// layout, checked and cleared by the transmit shortcut.
const X86_GUEST_EAX: u64 = 8;
const X86_GUEST_GPR_END: u64 = 24;
const X86_GUEST_ESI: u64 = 32;
const X86_GUEST_ESI_END: u64 = 36;

/// Caches shareable between sessions executing the same program image.
#[derive(Clone)]
pub struct SharedCaches {
    pages: Rc<RefCell<PageCache>>,
    blocks: Rc<RefCell<HashMap<u64, BlockEntry>>>,
}

impl SharedCaches {
    fn new() -> Self {
        Self {
            pages: Rc::new(RefCell::new(PageCache::new())),
            blocks: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

/// Registry handing out [SharedCaches] by cache key. Owned by the embedding
/// engine; sessions constructed with the same key share page and feasibility
/// caches.
#[derive(Default)]
pub struct CacheRegistry {
    entries: HashMap<u64, SharedCaches>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn caches(&mut self, key: u64) -> SharedCaches {
        self.entries
            .entry(key)
            .or_insert_with(SharedCaches::new)
            .clone()
    }
}

/// A buffer captured by the transmit-syscall shortcut, to be replayed by the
/// owning engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransmitRecord {
    pub data: Vec<u8>,
    pub count: u32,
}

/// Cumulative taint of a set of sources: outright symbolic, or transitively
/// dependent on a memory read whose address is symbolic (resp. concrete).
#[derive(Clone, Copy, Debug, Default)]
struct TaintStatus {
    is_symbolic: bool,
    reads_symbolic_addr: bool,
    reads_concrete_addr: bool,
    read_instr_addr: u64,
}

enum Feasibility {
    Accept,
    SymbolicRegister(u64),
    Unsupported,
}

/// One concrete-execution session. Drives an emulator through a budget of
/// basic blocks while tracking taint, committing each completed block and
/// rolling back the one in flight when a stop is triggered, so the owning
/// engine always observes the state as of the last committed block.
pub struct Session<L: Lifter> {
    lifter: L,
    caches: SharedCaches,
    block_taint_cache: HashMap<u64, Rc<BlockTaintSummary>>,

    taints: TaintMap,
    mem_writes: WriteLog,
    mem_writes_taint_map: HashMap<u64, bool>,
    mem_reads_taint_dst: HashMap<u64, (Vec<TaintSink>, bool)>,

    symbolic_registers: BTreeSet<u64>,
    symbolic_temps: BTreeSet<u64>,
    block_symbolic_registers: BTreeSet<u64>,
    block_concrete_registers: BTreeSet<u64>,
    block_symbolic_temps: BTreeSet<u64>,

    saved_registers: Option<RegisterContext>,
    stop_points: BTreeSet<u64>,

    bbl_addrs: Vec<u64>,
    stack_pointers: Vec<u64>,
    executed_pages: BTreeSet<u64>,
    transmit_records: Vec<TransmitRecord>,

    guest: Option<(GuestArch, ArchInfo)>,
    transmit_sysno: Option<u32>,
    transmit_block_addr: u64,
    track_bbls: bool,
    track_stack: bool,

    cur_steps: u64,
    max_steps: u64,
    syscall_count: u64,
    block_pending: bool,
    stopped: bool,
    stop_reason: StopReason,
    stopping_register: Option<u64>,
    stopping_memory: Option<u64>,
    ignore_next_block: bool,
    ignore_next_selfmod: bool,
    interrupt_handled: bool,
    cur_address: u64,
    cur_size: u32,
    prev_block: Option<u64>,
}

impl<L: Lifter> Session<L> {
    pub fn new(lifter: L, caches: SharedCaches) -> Self {
        Self {
            lifter,
            caches,
            block_taint_cache: HashMap::new(),
            taints: TaintMap::new(),
            mem_writes: WriteLog::new(),
            mem_writes_taint_map: HashMap::new(),
            mem_reads_taint_dst: HashMap::new(),
            symbolic_registers: BTreeSet::new(),
            symbolic_temps: BTreeSet::new(),
            block_symbolic_registers: BTreeSet::new(),
            block_concrete_registers: BTreeSet::new(),
            block_symbolic_temps: BTreeSet::new(),
            saved_registers: None,
            stop_points: BTreeSet::new(),
            bbl_addrs: Vec::new(),
            stack_pointers: Vec::new(),
            executed_pages: BTreeSet::new(),
            transmit_records: Vec::new(),
            guest: None,
            transmit_sysno: None,
            transmit_block_addr: 0,
            track_bbls: true,
            track_stack: true,
            cur_steps: 0,
            max_steps: 0,
            syscall_count: 0,
            block_pending: false,
            stopped: true,
            stop_reason: StopReason::NoStart,
            stopping_register: None,
            stopping_memory: None,
            ignore_next_block: false,
            ignore_next_selfmod: false,
            interrupt_handled: false,
            cur_address: 0,
            cur_size: 0,
            prev_block: None,
        }
    }

    //
    // Session controller
    //

    /// Run the emulator from `pc` for at most `step_budget` committed blocks.
    /// On return the guest state is exactly that of the last committed block.
    pub fn start<E: Emulator>(
        &mut self,
        emu: &mut E,
        pc: u64,
        step_budget: u64,
    ) -> StopReason {
        self.stopped = false;
        self.stop_reason = StopReason::NoStart;
        self.max_steps = step_budget;
        self.cur_steps = 0;
        self.block_pending = false;
        self.prev_block = None;
        self.ignore_next_block = false;
        self.ignore_next_selfmod = false;
        self.interrupt_handled = false;
        self.stopping_register = None;
        self.stopping_memory = None;
        self.executed_pages.clear();
        self.mem_reads_taint_dst.clear();
        self.mem_writes_taint_map.clear();
        self.block_symbolic_registers.clear();
        self.block_concrete_registers.clear();
        self.block_symbolic_temps.clear();

        if pc == 0 {
            self.stopped = true;
            self.stop_reason = StopReason::ZeroPage;
            return self.stop_reason;
        }

        self.saved_registers = Some(emu.save_registers());
        let outcome = emu.run(pc, self);

        if outcome.is_ok()
            && self.stop_reason == StopReason::NoStart
            && emu.instruction_pointer().unwrap_or(1) == 0
        {
            // The run fell through to the bogus terminator address.
            self.commit(emu);
            self.stop_reason = StopReason::ZeroPage;
        }

        self.rollback(emu);
        self.stopped = true;

        match outcome {
            Err(emulator::Error::InvalidInstruction) => self.stop_reason = StopReason::NoDecode,
            Err(emulator::Error::DivByZero) => self.stop_reason = StopReason::ZeroDiv,
            Err(emulator::Error::Halt) => self.stop_reason = StopReason::Hlt,
            Err(emulator::Error::FetchUnmapped)
                if self.stop_reason == StopReason::NoStart =>
            {
                self.stop_reason = StopReason::ExecNone;
            }
            Err(err) => {
                if self.stop_reason == StopReason::NoStart {
                    warn!("emulator failed without a recorded stop: {err}");
                    self.stop_reason = StopReason::Error;
                }
            }
            Ok(()) => {}
        }

        self.stop_reason
    }

    /// Record `reason` and ask the emulator to halt at the next safe point.
    /// A syscall stop commits first: the syscall was consumed successfully.
    pub fn stop(&mut self, emu: &mut dyn EmulatorOps, reason: StopReason) {
        self.stopped = true;
        if reason == StopReason::Syscall {
            self.commit(emu);
        }
        self.stop_reason = reason;
        debug!("stopping emulation: {}", reason.message());
        emu.request_stop();
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn stopping_register(&self) -> Option<u64> {
        self.stopping_register
    }

    pub fn stopping_memory(&self) -> Option<u64> {
        self.stopping_memory
    }

    pub fn cur_steps(&self) -> u64 {
        self.cur_steps
    }

    pub fn syscall_count(&self) -> u64 {
        self.syscall_count
    }

    pub fn bbl_addrs(&self) -> &[u64] {
        &self.bbl_addrs
    }

    pub fn stack_pointers(&self) -> &[u64] {
        &self.stack_pointers
    }

    pub fn executed_pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.executed_pages.iter().copied()
    }

    pub fn interrupt_handled(&self) -> bool {
        self.interrupt_handled
    }

    /// Replace the set of addresses execution must not enter.
    pub fn set_stop_points(&mut self, stops: impl IntoIterator<Item = u64>) {
        self.stop_points = stops.into_iter().collect();
    }

    pub fn set_tracking(&mut self, track_bbls: bool, track_stack: bool) {
        self.track_bbls = track_bbls;
        self.track_stack = track_stack;
    }

    /// Enable symbolic-register tracking for `arch`; blocks are lifted and
    /// analyzed from then on.
    pub fn enable_symbolic_reg_tracking(&mut self, arch: GuestArch, archinfo: ArchInfo) {
        self.guest = Some((arch, archinfo));
    }

    pub fn disable_symbolic_reg_tracking(&mut self) {
        self.guest = None;
    }

    pub fn symbolic_registers(&self) -> &BTreeSet<u64> {
        &self.symbolic_registers
    }

    pub fn set_symbolic_registers(&mut self, offsets: impl IntoIterator<Item = u64>) {
        self.symbolic_registers = offsets.into_iter().collect();
    }

    /// Configure the CGC transmit shortcut: interrupt `0x80` with this
    /// syscall number is consumed natively, stepping one block at
    /// `block_addr`.
    pub fn set_transmit_sysno(&mut self, sysno: u32, block_addr: u64) {
        self.transmit_sysno = Some(sysno);
        self.transmit_block_addr = block_addr;
    }

    pub fn transmit_records(&self) -> &[TransmitRecord] {
        &self.transmit_records
    }

    pub fn clear_transmit_records(&mut self) {
        self.transmit_records.clear();
    }

    //
    // Memory and page-cache management
    //

    /// Activate taint tracking for `len` bytes of pages starting at `addr`,
    /// optionally seeding the bitmaps from a caller-provided taint image.
    pub fn activate_region(
        &mut self,
        addr: u64,
        len: u64,
        image: Option<&[Taint]>,
    ) -> Result<()> {
        if let Some(image) = image {
            if image.len() < len as usize {
                return Err(Error::Mem(mem::Error::ShortTaintImage {
                    len: image.len(),
                    expected: len as usize,
                }));
            }
        }

        let mut offset = 0usize;
        while (offset as u64) < len {
            let page_image = match image {
                Some(image) => {
                    let slice = &image[offset..offset + PAGE_SIZE];
                    Some(slice.try_into().map_err(|_| {
                        Error::Mem(mem::Error::ShortTaintImage {
                            len: slice.len(),
                            expected: PAGE_SIZE,
                        })
                    })?)
                }
                None => None,
            };
            self.taints
                .activate(addr + offset as u64, page_image, &mut self.mem_writes);
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn activate_page(&mut self, addr: u64, image: Option<&[Taint]>) -> Result<()> {
        self.activate_region(addr, PAGE_SIZE as u64, image)
    }

    /// Lowest symbolic byte in `[addr, addr + size)`, if any.
    pub fn find_tainted(&self, addr: u64, size: usize) -> Option<u64> {
        self.taints.find_tainted(addr, size)
    }

    /// Consecutive dirty-byte ranges to be synchronized back into the owning
    /// engine's memory model.
    pub fn sync(&self) -> Vec<MemRange> {
        self.taints.dirty_ranges()
    }

    /// Cache `bytes` at `addr` and map the pages into the emulator.
    pub fn cache_page(
        &mut self,
        emu: &mut dyn EmulatorOps,
        addr: u64,
        bytes: &[u8],
        perms: Protection,
    ) -> Result<()> {
        let pages = Rc::clone(&self.caches.pages);
        let mut pages = pages.borrow_mut();
        pages.cache(addr, bytes, perms)?;
        if !pages.map_into(emu, addr, bytes.len()) {
            return Err(Error::MapFailed { addr });
        }
        Ok(())
    }

    pub fn in_cache(&self, addr: u64) -> bool {
        self.caches.pages.borrow().contains(addr)
    }

    pub fn uncache_region(&mut self, emu: &mut dyn EmulatorOps, addr: u64, len: u64) {
        self.caches.pages.borrow_mut().wipe_region(emu, addr, len);
    }

    pub fn clear_page_cache(&mut self, emu: &mut dyn EmulatorOps) {
        self.caches.pages.borrow_mut().clear(emu);
    }

    //
    // Commit and rollback
    //

    /// Promote the in-flight block: snapshot registers, realize deferred
    /// writes, advance the step counter and fold the block-local taint sets
    /// into the session sets.
    fn commit(&mut self, emu: &mut dyn EmulatorOps) {
        self.saved_registers = Some(emu.save_registers());
        self.mem_writes.commit(&mut self.taints);
        if self.block_pending {
            self.cur_steps += 1;
            self.block_pending = false;
        }

        let promoted = std::mem::take(&mut self.block_symbolic_registers);
        let demoted = std::mem::take(&mut self.block_concrete_registers);
        let temps = std::mem::take(&mut self.block_symbolic_temps);
        self.symbolic_registers.extend(promoted);
        for offset in demoted {
            self.symbolic_registers.remove(&offset);
        }
        self.symbolic_temps.extend(temps);
    }

    /// Undo the in-flight block: revert logged writes, restore the register
    /// snapshot and drop the uncommitted trace entry.
    fn rollback(&mut self, emu: &mut dyn EmulatorOps) {
        self.mem_writes.rollback(&mut self.taints, emu);
        if let Some(saved) = &self.saved_registers {
            emu.restore_registers(saved);
        }
        if self.block_pending {
            if self.track_bbls {
                self.bbl_addrs.pop();
            }
            self.block_pending = false;
        }
    }

    /// Record entry to the block at `addr` and stop if the step budget is
    /// exhausted or a stop point falls inside it.
    fn step(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: u32, check_stop_points: bool) {
        if self.track_bbls {
            self.bbl_addrs.push(addr);
        }
        if self.track_stack {
            self.stack_pointers.push(emu.stack_pointer().unwrap_or(0));
        }
        self.executed_pages.insert(mem::page_of(addr));
        self.cur_address = addr;
        self.cur_size = size;
        self.block_pending = true;

        if self.cur_steps >= self.max_steps {
            self.stop(emu, StopReason::Normal);
        } else if check_stop_points {
            let span = u64::from(size.max(MAX_BLOCK_SPAN));
            if self
                .stop_points
                .range(addr..addr.saturating_add(span))
                .next()
                .is_some()
            {
                self.stop(emu, StopReason::StopPoint);
            }
        }
    }

    //
    // Feasibility
    //

    fn check_block(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: u32) -> Feasibility {
        let Some((arch, archinfo)) = self.guest else {
            return Feasibility::Accept;
        };
        if self.symbolic_registers.is_empty() {
            return Feasibility::Accept;
        }

        let blocks_rc = Rc::clone(&self.caches.blocks);
        let mut blocks = blocks_rc.borrow_mut();
        let entry = match blocks.entry(addr) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let mut bytes = vec![0u8; size as usize];
                let computed = if emu.mem_read(addr, &mut bytes).is_ok() {
                    match self
                        .lifter
                        .lift(arch, &archinfo, &bytes, addr, DEFAULT_MAX_INSNS)
                    {
                        Ok(block) => feasibility::analyze(&block),
                        Err(err) => {
                            debug!("feasibility lift failed at {addr:#x}: {err}");
                            BlockEntry {
                                try_emulate: false,
                                ..BlockEntry::default()
                            }
                        }
                    }
                } else {
                    BlockEntry {
                        try_emulate: false,
                        ..BlockEntry::default()
                    }
                };
                slot.insert(computed)
            }
        };

        if !entry.try_emulate {
            return Feasibility::Unsupported;
        }
        for &offset in &self.symbolic_registers {
            if entry.used.contains(&offset) {
                return Feasibility::SymbolicRegister(offset);
            }
        }
        // The block overwrites these registers with concrete values.
        for offset in &entry.clobbered {
            self.symbolic_registers.remove(offset);
        }
        Feasibility::Accept
    }

    //
    // Taint propagation
    //

    fn propagate_taints(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: u32) {
        let summary = match self.block_taint_cache.get(&addr) {
            Some(summary) => Rc::clone(summary),
            None => {
                let Some((arch, archinfo)) = self.guest else {
                    return;
                };
                let mut bytes = vec![0u8; size as usize];
                if emu.mem_read(addr, &mut bytes).is_err() {
                    self.stop(emu, StopReason::Error);
                    return;
                }
                let block = match self
                    .lifter
                    .lift(arch, &archinfo, &bytes, addr, DEFAULT_MAX_INSNS)
                {
                    Ok(block) => block,
                    Err(err) => {
                        debug!("lift failed at {addr:#x}: {err}");
                        self.stop(emu, StopReason::LiftFailed);
                        return;
                    }
                };
                let summary = match BlockTaintSummary::from_block(&block, addr) {
                    Ok(summary) => Rc::new(summary),
                    Err(err) => {
                        warn!("taint analysis failed at {addr:#x}: {err}");
                        self.stop(emu, StopReason::Error);
                        return;
                    }
                };
                self.block_taint_cache.insert(addr, Rc::clone(&summary));
                summary
            }
        };

        self.mem_reads_taint_dst.clear();
        self.mem_writes_taint_map.clear();

        for (sink, sources) in &summary.flows {
            // A tainted ITE guard means the chosen arm is unknown to the
            // concrete execution; give the block back to the engine.
            if let Some(conds) = summary.ite_conds.get(&sink.instr_addr) {
                let status = self.final_status(conds.iter(), sink.instr_addr);
                if status.is_symbolic || status.reads_symbolic_addr || status.reads_concrete_addr {
                    self.stop(emu, StopReason::SymbolicCondition);
                    return;
                }
            }

            match &sink.entity {
                TaintEntity::Memory(address_entities) => {
                    let address_status =
                        self.final_status(address_entities.iter(), sink.instr_addr);
                    if address_status.is_symbolic
                        || address_status.reads_symbolic_addr
                        || address_status.reads_concrete_addr
                    {
                        self.stopping_memory = Some(sink.instr_addr);
                        self.stop(emu, StopReason::SymbolicWriteAddr);
                        return;
                    }

                    let status = self.final_status(sources.iter(), sink.instr_addr);
                    if status.reads_symbolic_addr {
                        self.stopping_memory = Some(sink.instr_addr);
                        self.stop(emu, StopReason::SymbolicReadAddr);
                        return;
                    }
                    let symbolic = status.is_symbolic;
                    if status.reads_concrete_addr && !symbolic {
                        // The write hook will mark the bytes concrete for
                        // now; the read hook upgrades them if the read turns
                        // out symbolic.
                        self.defer_on_read(status.read_instr_addr, sink.clone());
                    }
                    if !self.set_write_taint(sink.instr_addr, symbolic) {
                        self.stop(emu, StopReason::Error);
                        return;
                    }
                }
                TaintEntity::Register(_) | TaintEntity::Temp(_) => {
                    let status = self.final_status(sources.iter(), sink.instr_addr);
                    if status.reads_symbolic_addr {
                        self.stopping_memory = Some(sink.instr_addr);
                        self.stop(emu, StopReason::SymbolicReadAddr);
                        return;
                    }
                    if status.is_symbolic {
                        match sink.entity {
                            TaintEntity::Register(offset) => {
                                // Block-level marks are ordered by recency: a
                                // symbolic write supersedes an earlier
                                // concrete mark.
                                self.block_concrete_registers.remove(&offset);
                                self.block_symbolic_registers.insert(offset);
                            }
                            TaintEntity::Temp(id) => {
                                self.block_symbolic_temps.insert(id);
                            }
                            TaintEntity::Memory(_) => unreachable!(),
                        }
                    } else if status.reads_concrete_addr {
                        self.defer_on_read(status.read_instr_addr, sink.clone());
                        if let TaintEntity::Register(offset) = sink.entity {
                            self.block_concrete_registers.insert(offset);
                        }
                    } else if let TaintEntity::Register(offset) = sink.entity {
                        // None of the dependencies carry taint.
                        self.block_concrete_registers.insert(offset);
                    }
                }
            }
        }
    }

    /// Resolve the cumulative taint of `sources`, with `instr_addr` standing
    /// in as the read site for memory sources.
    fn final_status<'a>(
        &self,
        sources: impl Iterator<Item = &'a TaintEntity>,
        instr_addr: u64,
    ) -> TaintStatus {
        let mut status = TaintStatus::default();
        for source in sources {
            match source {
                TaintEntity::Register(offset) => {
                    if self.is_symbolic_register(*offset) {
                        status.is_symbolic = true;
                    } else if let Some(read_instr) = self.pending_read_of(source) {
                        status.reads_concrete_addr = true;
                        status.read_instr_addr = read_instr;
                    }
                }
                TaintEntity::Temp(id) => {
                    if self.is_symbolic_temp(*id) {
                        status.is_symbolic = true;
                    } else if let Some(read_instr) = self.pending_read_of(source) {
                        status.reads_concrete_addr = true;
                        status.read_instr_addr = read_instr;
                    }
                }
                TaintEntity::Memory(address_entities) => {
                    let address_status = self.final_status(address_entities.iter(), instr_addr);
                    if address_status.is_symbolic || address_status.reads_symbolic_addr {
                        status.reads_symbolic_addr = true;
                        break;
                    } else if address_status.reads_concrete_addr {
                        // The address itself comes out of memory. Its value
                        // cannot be determined without evaluating the block,
                        // so the read is treated as one from a symbolic
                        // address.
                        status.reads_symbolic_addr = true;
                        break;
                    } else {
                        status.reads_concrete_addr = true;
                        status.read_instr_addr = instr_addr;
                    }
                }
            }
        }
        status
    }

    /// Block-level taint is more recent than the session sets and wins.
    fn is_symbolic_register(&self, offset: u64) -> bool {
        if self.block_symbolic_registers.contains(&offset) {
            return true;
        }
        if self.block_concrete_registers.contains(&offset) {
            return false;
        }
        self.symbolic_registers.contains(&offset)
    }

    fn is_symbolic_temp(&self, id: u64) -> bool {
        self.symbolic_temps.contains(&id) || self.block_symbolic_temps.contains(&id)
    }

    /// Instruction address of the pending memory read `entity` depends on.
    fn pending_read_of(&self, entity: &TaintEntity) -> Option<u64> {
        self.mem_reads_taint_dst
            .iter()
            .find(|(_, (sinks, _))| sinks.iter().any(|sink| sink.entity == *entity))
            .map(|(&read_instr, _)| read_instr)
    }

    fn defer_on_read(&mut self, read_instr: u64, sink: TaintSink) {
        self.mem_reads_taint_dst
            .entry(read_instr)
            .or_insert_with(|| (Vec::new(), false))
            .0
            .push(sink);
    }

    /// Record whether the write at `instr_addr` stores a symbolic value.
    /// Returns `false` when the instruction already performed a write; a
    /// second one cannot be attributed.
    fn set_write_taint(&mut self, instr_addr: u64, symbolic: bool) -> bool {
        if self.mem_writes_taint_map.contains_key(&instr_addr) {
            warn!("multiple memory writes at instruction {instr_addr:#x} are not supported");
            return false;
        }
        self.mem_writes_taint_map.insert(instr_addr, symbolic);
        true
    }

    /// Called by the read hook once a symbolic byte is read: every sink
    /// deferred on the read at the current instruction becomes symbolic.
    fn propagate_mem_read_taints(&mut self, emu: &mut dyn EmulatorOps) {
        let pc = match emu.instruction_pointer() {
            Ok(pc) => pc,
            Err(_) => return,
        };
        let sinks = match self.mem_reads_taint_dst.get_mut(&pc) {
            Some((_, processed)) if *processed => return,
            Some((sinks, processed)) => {
                // The emulator may deliver the same read hook twice.
                *processed = true;
                sinks.clone()
            }
            None => return,
        };

        for sink in sinks {
            match sink.entity {
                TaintEntity::Register(offset) => {
                    // The register was provisionally block-marked concrete
                    // when the flow was deferred; the upgrade supersedes it.
                    self.block_concrete_registers.remove(&offset);
                    self.symbolic_registers.insert(offset);
                }
                TaintEntity::Temp(id) => {
                    self.symbolic_temps.insert(id);
                }
                TaintEntity::Memory(_) => {
                    self.mem_writes_taint_map.insert(sink.instr_addr, true);
                }
            }
        }
    }

    fn handle_write(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) {
        // A missing entry means taint was not computed for this write; treat
        // it as concrete.
        let symbolic = emu
            .instruction_pointer()
            .ok()
            .and_then(|pc| self.mem_writes_taint_map.get(&pc).copied())
            .unwrap_or(false);
        if let Err(err) = mem::record_write(
            &mut self.taints,
            &mut self.mem_writes,
            emu,
            addr,
            size,
            symbolic,
        ) {
            warn!("failed to record write at {addr:#x}: {err}");
            self.stop(emu, StopReason::Error);
        }
    }

    fn exit_guard_symbolic(&self, block_addr: u64) -> bool {
        // The previous block completed, so no symbolic-address read occurred
        // in it; only outright symbolic guard dependencies matter. Commit has
        // already folded its block-local sets.
        self.block_taint_cache
            .get(&block_addr)
            .map(|summary| {
                self.final_status(summary.exit_guard_deps.iter(), block_addr)
                    .is_symbolic
            })
            .unwrap_or(false)
    }

    //
    // Transmit shortcut
    //

    fn transmit_shortcut(&mut self, emu: &mut dyn EmulatorOps) -> emulator::Result<()> {
        let Some(sysno) = self.transmit_sysno else {
            return Ok(());
        };
        let arg_symbolic = self.symbolic_registers.iter().any(|&offset| {
            (X86_GUEST_EAX..X86_GUEST_GPR_END).contains(&offset)
                || (X86_GUEST_ESI..X86_GUEST_ESI_END).contains(&offset)
        });
        if arg_symbolic {
            return Ok(());
        }
        if emu.reg_read(reg::x86::EAX)? as u32 != sysno {
            return Ok(());
        }

        let fd = emu.reg_read(reg::x86::EBX)? as u32;
        if fd != 0 && fd != 1 {
            // Writes to other descriptors (stderr included) are uncommon;
            // leave them to the engine.
            return Ok(());
        }
        let buf = emu.reg_read(reg::x86::ECX)?;
        let count = emu.reg_read(reg::x86::EDX)? as u32;
        let tx_bytes = emu.reg_read(reg::x86::ESI)?;

        let mut data = vec![0u8; count as usize];
        if emu.mem_read(buf, &mut data).is_err() {
            return Ok(());
        }
        if tx_bytes != 0 {
            let mut probe = [0u8; 4];
            if emu.mem_read(tx_bytes, &mut probe).is_err() {
                return Ok(());
            }
        }
        if self.taints.find_tainted(buf, count as usize).is_some() {
            return Ok(());
        }

        self.step(emu, self.transmit_block_addr, 0, false);
        self.commit(emu);
        if self.stopped {
            return Ok(());
        }

        if tx_bytes != 0 {
            emu.mem_write(tx_bytes, &count.to_le_bytes())?;
            self.handle_write(emu, tx_bytes, 4);
        }
        self.transmit_records.push(TransmitRecord { data, count });
        emu.reg_write(reg::x86::EAX, 0)?;
        for offset in X86_GUEST_EAX..X86_GUEST_EAX + 4 {
            self.symbolic_registers.remove(&offset);
        }
        self.interrupt_handled = true;
        self.syscall_count += 1;
        Ok(())
    }
}

impl<L: Lifter> EventHandler for Session<L> {
    fn block(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: u32) {
        trace!("block [{addr:#x}, {end:#x})", end = addr + size as u64);
        if self.ignore_next_block {
            // Re-entry after a self-modifying store; the block was already
            // counted.
            self.ignore_next_block = false;
            self.ignore_next_selfmod = true;
            return;
        }

        self.commit(emu);
        if let Some(prev) = self.prev_block {
            if self.exit_guard_symbolic(prev) {
                self.stop(emu, StopReason::SymbolicCondition);
                return;
            }
        }

        self.step(emu, addr, size, true);
        if !self.stopped {
            match self.check_block(emu, addr, size) {
                Feasibility::Accept => {
                    if self.guest.is_some() {
                        self.propagate_taints(emu, addr, size);
                    }
                }
                Feasibility::SymbolicRegister(offset) => {
                    self.stopping_register = Some(offset);
                    self.stop(emu, StopReason::SymbolicCondition);
                }
                Feasibility::Unsupported => {
                    self.stop(emu, StopReason::NoDecode);
                }
            }
        }

        self.prev_block = Some(addr);
    }

    fn mem_read(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) {
        trace!("read [{addr:#x}, {end:#x})", end = addr + size as u64);
        if self.taints.find_tainted(addr, size).is_some() {
            self.propagate_mem_read_taints(emu);
        }
    }

    fn mem_write(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) {
        trace!("write [{addr:#x}, {end:#x})", end = addr + size as u64);
        if self.ignore_next_selfmod {
            // The self-modifying store is redelivered when the emulator
            // restarts the block.
            self.ignore_next_selfmod = false;
        } else {
            let block_end = self.cur_address + self.cur_size as u64;
            let write_end = addr + size as u64;
            if (addr >= self.cur_address && addr < block_end)
                || (self.cur_address >= addr && self.cur_address < write_end)
            {
                // The block modified its own code; the emulator will restart
                // it and redeliver the block hook.
                self.ignore_next_block = true;
            }
        }
        self.handle_write(emu, addr, size);
    }

    fn mem_unmapped(
        &mut self,
        emu: &mut dyn EmulatorOps,
        kind: AccessKind,
        addr: u64,
        size: usize,
    ) -> bool {
        if kind == AccessKind::Write {
            return false;
        }
        let start = mem::page_of(addr);
        let end = mem::page_of(addr + size.saturating_sub(1) as u64);
        let pages = Rc::clone(&self.caches.pages);
        let pages = pages.borrow();
        pages.map_into(emu, start, PAGE_SIZE)
            && (start == end || pages.map_into(emu, end, PAGE_SIZE))
    }

    fn protection_fault(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) -> bool {
        debug!("protection fault [{addr:#x}, {end:#x})", end = addr + size as u64);
        self.stop(emu, StopReason::Segfault);
        true
    }

    fn interrupt(&mut self, emu: &mut dyn EmulatorOps, intno: u32) {
        self.interrupt_handled = false;
        if emu.arch() == Arch::X86 && intno == 0x80 {
            if let Err(err) = self.transmit_shortcut(emu) {
                debug!("transmit shortcut aborted: {err}");
            }
        }
    }
}
