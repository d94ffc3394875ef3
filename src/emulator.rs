use crate::mem::SharedPageBuf;

/// Result returned by emulator APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes reported by the embedded CPU emulator. The run loop maps a
/// subset of these onto stop reasons; the rest surface as generic errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A memory mapping request was invalid or overlapped an existing one.
    #[error("invalid memory mapping")]
    Map,

    /// Instruction fetch touched unmapped memory.
    #[error("fetch from unmapped memory")]
    FetchUnmapped,

    /// Data access touched unmapped memory.
    #[error("access to unmapped memory at {0:#x}")]
    Unmapped(u64),

    /// The emulator could not decode an instruction.
    #[error("invalid instruction")]
    InvalidInstruction,

    /// Integer division by zero in guest code.
    #[error("division by zero")]
    DivByZero,

    /// The guest executed a halt instruction.
    #[error("halt instruction reached")]
    Halt,

    /// Any other emulator failure.
    #[error("emulator failure: {0}")]
    Internal(String),
}

/// Guest architecture of the emulator instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Arm64,
    Mips,
}

/// Identifier of an emulator register. The numbering is defined by the
/// emulator implementation; the constants in [reg] cover the registers this
/// crate itself needs to touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegId(pub u32);

/// Register ids used by the co-processor: program counter and stack pointer
/// per architecture, plus the x86 argument registers consumed by the
/// transmit-syscall shortcut.
pub mod reg {
    pub mod x86 {
        use super::super::RegId;

        pub const EAX: RegId = RegId(19);
        pub const EBX: RegId = RegId(21);
        pub const ECX: RegId = RegId(22);
        pub const EDX: RegId = RegId(24);
        pub const ESI: RegId = RegId(29);
        pub const EIP: RegId = RegId(26);
        pub const ESP: RegId = RegId(30);
    }

    pub mod x86_64 {
        use super::super::RegId;

        pub const RIP: RegId = RegId(41);
        pub const RSP: RegId = RegId(44);
    }

    pub mod arm {
        use super::super::RegId;

        pub const PC: RegId = RegId(11);
        pub const SP: RegId = RegId(12);
    }

    pub mod arm64 {
        use super::super::RegId;

        pub const PC: RegId = RegId(260);
        pub const SP: RegId = RegId(4);
    }

    pub mod mips {
        use super::super::RegId;

        pub const PC: RegId = RegId(1);
        pub const SP: RegId = RegId(33);
    }
}

impl Arch {
    /// Program counter register for this architecture.
    pub fn pc(self) -> RegId {
        match self {
            Arch::X86 => reg::x86::EIP,
            Arch::X86_64 => reg::x86_64::RIP,
            Arch::Arm => reg::arm::PC,
            Arch::Arm64 => reg::arm64::PC,
            Arch::Mips => reg::mips::PC,
        }
    }

    /// Stack pointer register for this architecture.
    pub fn sp(self) -> RegId {
        match self {
            Arch::X86 => reg::x86::ESP,
            Arch::X86_64 => reg::x86_64::RSP,
            Arch::Arm => reg::arm::SP,
            Arch::Arm64 => reg::arm64::SP,
            Arch::Mips => reg::mips::SP,
        }
    }
}

/// Page access permissions for mapped memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protection(pub u8);

impl Protection {
    pub const NONE: Protection = Protection(0);
    pub const READ: Protection = Protection(1);
    pub const WRITE: Protection = Protection(2);
    pub const EXEC: Protection = Protection(4);
    pub const ALL: Protection = Protection(7);

    pub fn contains(self, other: Protection) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Protection {
    type Output = Protection;

    fn bitor(self, rhs: Protection) -> Protection {
        Protection(self.0 | rhs.0)
    }
}

/// Kind of memory access that triggered a fault hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

/// Opaque snapshot of the full guest register file, produced and consumed
/// only by the emulator implementation that created it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterContext(pub Vec<u8>);

/// Object-safe emulator capabilities available both between runs and from
/// inside event callbacks.
pub trait EmulatorOps {
    fn arch(&self) -> Arch;

    fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Map one page of memory backed by a buffer shared with the caller, so
    /// that guest writes are visible through the buffer and vice versa.
    fn map_shared(&mut self, addr: u64, perms: Protection, buf: SharedPageBuf) -> Result<()>;

    fn unmap(&mut self, addr: u64, size: u64) -> Result<()>;

    fn reg_read(&mut self, reg: RegId) -> Result<u64>;

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()>;

    fn save_registers(&mut self) -> RegisterContext;

    fn restore_registers(&mut self, context: &RegisterContext);

    /// Ask the emulator to leave its run loop at the end of the current
    /// callback. Harmless outside a run.
    fn request_stop(&mut self);

    fn instruction_pointer(&mut self) -> Result<u64> {
        let pc = self.arch().pc();
        self.reg_read(pc)
    }

    fn stack_pointer(&mut self) -> Result<u64> {
        let sp = self.arch().sp();
        self.reg_read(sp)
    }
}

/// Callbacks delivered by the emulator while it executes guest code. The
/// emulator passes itself back through `emu` so handlers can inspect and
/// modify guest state mid-run.
pub trait EventHandler {
    /// Entry to a translated basic block, before its first instruction.
    fn block(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: u32);

    /// A memory read is about to be performed.
    fn mem_read(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize);

    /// A memory write is about to be performed; guest memory still holds the
    /// pre-image when this fires.
    fn mem_write(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize);

    /// An access touched unmapped memory. Returning `true` means the handler
    /// mapped the page and the access should be retried; `false` lets the
    /// emulator raise the fault.
    fn mem_unmapped(
        &mut self,
        emu: &mut dyn EmulatorOps,
        kind: AccessKind,
        addr: u64,
        size: usize,
    ) -> bool;

    /// An access violated page permissions.
    fn protection_fault(&mut self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) -> bool;

    /// The guest raised an interrupt.
    fn interrupt(&mut self, emu: &mut dyn EmulatorOps, intno: u32);
}

/// A runnable emulator. `run` executes from `pc` until a handler requests a
/// stop or the emulator faults, delivering events to `events` along the way.
pub trait Emulator: EmulatorOps {
    fn run(&mut self, pc: u64, events: &mut dyn EventHandler) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_registers() {
        assert_eq!(Arch::X86.pc(), reg::x86::EIP);
        assert_eq!(Arch::X86_64.pc(), reg::x86_64::RIP);
        assert_eq!(Arch::X86_64.sp(), reg::x86_64::RSP);
        assert_eq!(Arch::Mips.sp(), reg::mips::SP);
    }

    #[test]
    fn protection_bits() {
        let rw = Protection::READ | Protection::WRITE;
        assert!(rw.contains(Protection::READ));
        assert!(rw.contains(Protection::WRITE));
        assert!(!rw.contains(Protection::EXEC));
        assert!(Protection::ALL.contains(rw));
    }
}
