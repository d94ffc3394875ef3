use crate::ir::IrBlock;

/// Guest architectures the lifter understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuestArch {
    X86,
    Amd64,
    Arm,
    Arm64,
    Mips32,
}

/// Architecture tuning parameters forwarded to the lifter verbatim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchInfo {
    pub hwcaps: u64,
    pub big_endian: bool,
}

/// Default cap on the number of guest instructions lifted into one block.
pub const DEFAULT_MAX_INSNS: u32 = 99;

/// Errors returned by a lifter.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no decodable instruction at {addr:#x}")]
    NoDecode { addr: u64 },

    #[error("guest architecture {0:?} is not supported")]
    UnsupportedGuest(GuestArch),

    #[error("lifter failure: {0}")]
    Internal(String),
}

/// Result returned by lifter APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Interface to the machine-code lifter. Implementations translate the raw
/// bytes of one basic block into an [IrBlock]; `bytes` bounds the block and
/// `max_insns` bounds how many guest instructions may be consumed.
pub trait Lifter {
    fn lift(
        &self,
        arch: GuestArch,
        archinfo: &ArchInfo,
        bytes: &[u8],
        addr: u64,
        max_insns: u32,
    ) -> Result<IrBlock>;
}
