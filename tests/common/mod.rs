//! Shared fixtures: a scripted emulator that replays a fixed block/access
//! trace through the event callbacks, and a lifter that serves hand-built IR
//! blocks. Together they stand in for the real CPU emulator and lifter.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use concrete_vex::emulator::{
    AccessKind, Arch, EmulatorOps, Emulator, Error, EventHandler, Protection, RegId,
    RegisterContext, Result,
};
use concrete_vex::mem::{page_of, SharedPageBuf, PAGE_SIZE};
use concrete_vex::session::{CacheRegistry, Session};
use vex_ir::{ArchInfo, GuestArch, IrBlock, Lifter};

// Guest register-file byte offsets of the x86-64 general-purpose registers.
pub const RAX: u64 = 16;
pub const RCX: u64 = 24;
pub const RBX: u64 = 40;
pub const RSP: u64 = 48;

/// One scripted effect inside a block.
#[derive(Clone, Debug)]
pub enum Action {
    /// Memory read performed by the instruction at `pc`.
    Read { pc: u64, addr: u64, size: usize },
    /// Memory write performed by the instruction at `pc`. The write hook
    /// fires before `bytes` land in memory, as in the real emulator.
    Write { pc: u64, addr: u64, bytes: Vec<u8> },
    /// Architectural register update taking effect mid-block.
    SetReg { reg: RegId, value: u64 },
    /// Interrupt raised by the instruction at `pc`.
    Interrupt { pc: u64, intno: u32 },
    /// Permission violation at `addr`.
    ProtFault { addr: u64, size: usize },
}

/// One translated block in the scripted trace.
#[derive(Clone, Debug)]
pub struct BlockExec {
    pub addr: u64,
    pub size: u32,
    pub actions: Vec<Action>,
}

impl BlockExec {
    pub fn new(addr: u64, size: u32) -> Self {
        Self {
            addr,
            size,
            actions: Vec::new(),
        }
    }

    pub fn with_actions(addr: u64, size: u32, actions: Vec<Action>) -> Self {
        Self {
            addr,
            size,
            actions,
        }
    }
}

/// Emulator double: paged memory, a flat register file, and a scripted run
/// loop that replays blocks and their memory accesses through the hooks.
pub struct ScriptedEmulator {
    arch: Arch,
    pages: BTreeMap<u64, SharedPageBuf>,
    regs: HashMap<u32, u64>,
    stop_requested: bool,
    script: Vec<BlockExec>,
}

impl ScriptedEmulator {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            pages: BTreeMap::new(),
            regs: HashMap::new(),
            stop_requested: false,
            script: Vec::new(),
        }
    }

    pub fn set_script(&mut self, script: Vec<BlockExec>) {
        self.script = script;
    }

    /// Map a zeroed private page at `addr`.
    pub fn map_anon(&mut self, addr: u64, len: u64) {
        let base = page_of(addr);
        let mut offset = 0;
        while offset < len {
            self.pages
                .entry(base + offset)
                .or_insert_with(|| Rc::new(std::cell::RefCell::new(Box::new([0u8; PAGE_SIZE]))));
            offset += PAGE_SIZE as u64;
        }
    }

    pub fn set_pc(&mut self, value: u64) {
        let pc = self.arch.pc();
        self.regs.insert(pc.0, value);
    }

    pub fn reg(&self, reg: RegId) -> u64 {
        self.regs.get(&reg.0).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, reg: RegId, value: u64) {
        self.regs.insert(reg.0, value);
    }

    pub fn read_bytes(&mut self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem_read(addr, &mut buf).expect("memory not mapped");
        buf
    }

    fn page_and_offset(&self, addr: u64) -> Result<(SharedPageBuf, usize)> {
        let page = self
            .pages
            .get(&page_of(addr))
            .ok_or(Error::Unmapped(addr))?;
        Ok((Rc::clone(page), (addr - page_of(addr)) as usize))
    }

    fn is_mapped(&self, addr: u64, size: usize) -> bool {
        let end = addr + size.saturating_sub(1) as u64;
        self.pages.contains_key(&page_of(addr)) && self.pages.contains_key(&page_of(end))
    }
}

impl EmulatorOps for ScriptedEmulator {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (i, out) in buf.iter_mut().enumerate() {
            let (page, offset) = self.page_and_offset(addr + i as u64)?;
            *out = page.borrow()[offset];
        }
        Ok(())
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        for (i, &byte) in data.iter().enumerate() {
            let (page, offset) = self.page_and_offset(addr + i as u64)?;
            page.borrow_mut()[offset] = byte;
        }
        Ok(())
    }

    fn map_shared(&mut self, addr: u64, _perms: Protection, buf: SharedPageBuf) -> Result<()> {
        if addr % PAGE_SIZE as u64 != 0 {
            return Err(Error::Map);
        }
        self.pages.insert(addr, buf);
        Ok(())
    }

    fn unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        let mut offset = 0;
        while offset < size {
            self.pages.remove(&(page_of(addr) + offset));
            offset += PAGE_SIZE as u64;
        }
        Ok(())
    }

    fn reg_read(&mut self, reg: RegId) -> Result<u64> {
        Ok(self.regs.get(&reg.0).copied().unwrap_or(0))
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()> {
        self.regs.insert(reg.0, value);
        Ok(())
    }

    fn save_registers(&mut self) -> RegisterContext {
        let mut bytes = Vec::with_capacity(self.regs.len() * 12);
        let mut entries: Vec<_> = self.regs.iter().collect();
        entries.sort();
        for (&id, &value) in entries {
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        RegisterContext(bytes)
    }

    fn restore_registers(&mut self, context: &RegisterContext) {
        self.regs.clear();
        for entry in context.0.chunks_exact(12) {
            let id = u32::from_le_bytes(entry[0..4].try_into().unwrap());
            let value = u64::from_le_bytes(entry[4..12].try_into().unwrap());
            self.regs.insert(id, value);
        }
    }

    fn request_stop(&mut self) {
        self.stop_requested = true;
    }
}

impl Emulator for ScriptedEmulator {
    fn run(&mut self, pc: u64, events: &mut dyn EventHandler) -> Result<()> {
        self.stop_requested = false;
        let script = self.script.clone();
        let start = script
            .iter()
            .position(|block| block.addr == pc)
            .ok_or(Error::FetchUnmapped)?;

        for block in &script[start..] {
            self.set_pc(block.addr);
            events.block(&mut *self, block.addr, block.size);
            if self.stop_requested {
                return Ok(());
            }

            for action in &block.actions {
                match action {
                    Action::Read { pc, addr, size } => {
                        self.set_pc(*pc);
                        if !self.is_mapped(*addr, *size)
                            && !events.mem_unmapped(&mut *self, AccessKind::Read, *addr, *size)
                        {
                            return Err(Error::Unmapped(*addr));
                        }
                        events.mem_read(&mut *self, *addr, *size);
                    }
                    Action::Write { pc, addr, bytes } => {
                        self.set_pc(*pc);
                        if !self.is_mapped(*addr, bytes.len())
                            && !events.mem_unmapped(
                                &mut *self,
                                AccessKind::Write,
                                *addr,
                                bytes.len(),
                            )
                        {
                            return Err(Error::Unmapped(*addr));
                        }
                        events.mem_write(&mut *self, *addr, bytes.len());
                        if !self.stop_requested {
                            self.mem_write(*addr, bytes)?;
                        }
                    }
                    Action::SetReg { reg, value } => {
                        self.regs.insert(reg.0, *value);
                    }
                    Action::Interrupt { pc, intno } => {
                        self.set_pc(*pc);
                        events.interrupt(&mut *self, *intno);
                    }
                    Action::ProtFault { addr, size } => {
                        events.protection_fault(&mut *self, *addr, *size);
                    }
                }
                if self.stop_requested {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// Lifter double serving pre-registered IR blocks by address.
#[derive(Default)]
pub struct FixtureLifter {
    blocks: HashMap<u64, IrBlock>,
}

impl FixtureLifter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: u64, block: IrBlock) {
        self.blocks.insert(addr, block);
    }

    pub fn with_block(addr: u64, block: IrBlock) -> Self {
        let mut lifter = Self::new();
        lifter.insert(addr, block);
        lifter
    }
}

impl Lifter for FixtureLifter {
    fn lift(
        &self,
        _arch: GuestArch,
        _archinfo: &ArchInfo,
        _bytes: &[u8],
        addr: u64,
        _max_insns: u32,
    ) -> vex_ir::Result<IrBlock> {
        self.blocks
            .get(&addr)
            .cloned()
            .ok_or(vex_ir::Error::NoDecode { addr })
    }
}

/// Session wired to a fresh cache registry, with x86-64 symbolic tracking
/// enabled.
pub fn tracked_session(lifter: FixtureLifter) -> Session<FixtureLifter> {
    let mut registry = CacheRegistry::new();
    let mut session = Session::new(lifter, registry.caches(0));
    session.enable_symbolic_reg_tracking(GuestArch::Amd64, ArchInfo::default());
    session
}
