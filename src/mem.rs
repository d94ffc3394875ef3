use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::emulator::{self, EmulatorOps, Protection};

/// Memory result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Possible memory errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The address is not aligned to a page boundary.
    #[error("address {0:#x} is not page-aligned")]
    Unaligned(u64),

    /// The length is not a whole number of pages.
    #[error("length {0:#x} is not a multiple of the page size")]
    UnalignedLength(u64),

    /// A page is already cached with different contents or permissions.
    #[error("page at {0:#x} is already cached with different contents")]
    CacheMismatch(u64),

    /// A caller-provided taint image is too short for the requested region.
    #[error("taint image of {len} bytes is too short for region of {expected} bytes")]
    ShortTaintImage { len: usize, expected: usize },

    /// The emulator rejected a memory operation.
    #[error(transparent)]
    Emulator(#[from] emulator::Error),
}

/// Size of a guest page.
pub const PAGE_SIZE: usize = 0x1000;

const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);
const OFFSET_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Page-aligned base of the page containing `addr`.
pub fn page_of(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Per-byte taint tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Taint {
    /// Untouched since the last synchronization with the owning engine.
    None = 0,
    /// Concrete value modified since the last synchronization.
    Dirty = 1,
    /// Value originating from symbolic data; its concrete bytes are not to be
    /// trusted by the owning engine.
    Symbolic = 2,
}

type PageBitmap = Box<[Taint; PAGE_SIZE]>;

fn blank_bitmap() -> PageBitmap {
    Box::new([Taint::None; PAGE_SIZE])
}

/// A contiguous range of guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRange {
    pub address: u64,
    pub length: u64,
}

/// Byte-granular taint tags for every active page. A page becomes active when
/// it is remapped for writing or initialized with symbolic data; bytes of
/// inactive pages are implicitly taint-free.
#[derive(Default)]
pub struct TaintMap {
    pages: BTreeMap<u64, PageBitmap>,
}

impl TaintMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap of the active page containing `addr`, if any.
    pub fn page(&self, addr: u64) -> Option<&[Taint; PAGE_SIZE]> {
        self.pages.get(&page_of(addr)).map(|b| &**b)
    }

    pub fn page_mut(&mut self, addr: u64) -> Option<&mut [Taint; PAGE_SIZE]> {
        self.pages.get_mut(&page_of(addr)).map(|b| &mut **b)
    }

    pub fn is_active(&self, addr: u64) -> bool {
        self.pages.contains_key(&page_of(addr))
    }

    /// Activate the page containing `addr`, initializing its bitmap from
    /// `image` when the page carries symbolic data. Re-activation keeps the
    /// existing bitmap. In both cases, deferred writes in `log` targeting the
    /// page are realized in place so that subsequent reads observe them.
    pub fn activate(&mut self, addr: u64, image: Option<&[Taint; PAGE_SIZE]>, log: &mut WriteLog) {
        let base = page_of(addr);
        if self.pages.contains_key(&base) {
            warn!("page {base:#x} is already active; keeping its bitmap");
        } else {
            let bitmap = match image {
                Some(image) => Box::new(*image),
                None => blank_bitmap(),
            };
            self.pages.insert(base, bitmap);
        }

        let bitmap = self.pages.get_mut(&base).map(|b| &mut **b);
        if let Some(bitmap) = bitmap {
            for record in log.records.iter_mut() {
                if record.pre_taint.is_none() && page_of(record.address) == base {
                    debug!(
                        "lazily realizing write [{:#x}, {:#x})",
                        record.address,
                        record.address + record.size as u64
                    );
                    let start = (record.address & OFFSET_MASK) as usize;
                    for tag in bitmap[start..start + record.size as usize].iter_mut() {
                        *tag = Taint::Dirty;
                    }
                    record.pre_taint = Some(full_mask(record.size));
                }
            }
        }
    }

    /// Lowest address in `[addr, addr + size)` tagged [Taint::Symbolic], or
    /// `None` when the range is free of symbolic bytes.
    pub fn find_tainted(&self, addr: u64, size: usize) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let start = (addr & OFFSET_MASK) as usize;
        let end = ((addr + size as u64 - 1) & OFFSET_MASK) as usize;

        if end >= start {
            let bitmap = self.page(addr)?;
            (start..=end)
                .find(|&i| bitmap[i] == Taint::Symbolic)
                .map(|i| page_of(addr) + i as u64)
        } else {
            // The range straddles a page boundary.
            if let Some(bitmap) = self.page(addr) {
                if let Some(i) = (start..PAGE_SIZE).find(|&i| bitmap[i] == Taint::Symbolic) {
                    return Some(page_of(addr) + i as u64);
                }
            }
            let tail = addr + size as u64 - 1;
            let bitmap = self.page(tail)?;
            (0..=end)
                .find(|&i| bitmap[i] == Taint::Symbolic)
                .map(|i| page_of(tail) + i as u64)
        }
    }

    /// Consecutive runs of [Taint::Dirty] bytes across all active pages, in
    /// address order. Runs do not span page boundaries.
    pub fn dirty_ranges(&self) -> Vec<MemRange> {
        let mut ranges = Vec::new();
        for (&base, bitmap) in &self.pages {
            let mut i = 0;
            while i < PAGE_SIZE {
                if bitmap[i] == Taint::Dirty {
                    let start = i;
                    while i < PAGE_SIZE && bitmap[i] == Taint::Dirty {
                        i += 1;
                    }
                    ranges.push(MemRange {
                        address: base + start as u64,
                        length: (i - start) as u64,
                    });
                } else {
                    i += 1;
                }
            }
        }
        ranges
    }
}

/// Largest guest memory write delivered by a single hook invocation.
pub const MAX_WRITE_SIZE: usize = 8;

fn full_mask(size: u8) -> u8 {
    ((1u16 << size) - 1) as u8
}

/// One logged memory write. `pre_taint` is `None` when the page was inactive
/// at write time (every byte was taint-free and the pre-image is irrelevant);
/// otherwise bit `i` of the mask is set iff byte `i` of the record was not
/// [Taint::Dirty] before the write and must be reset on rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub address: u64,
    pub size: u8,
    pub value: [u8; MAX_WRITE_SIZE],
    pub pre_taint: Option<u8>,
}

/// Ordered log of guest memory writes since the last commit. Records never
/// straddle a page boundary; [record_write] splits such writes.
#[derive(Default)]
pub struct WriteLog {
    records: Vec<WriteRecord>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[WriteRecord] {
        &self.records
    }

    /// Append a record, capturing the pre-image from the emulator unless the
    /// page was inactive.
    pub fn push(
        &mut self,
        emu: &mut dyn EmulatorOps,
        address: u64,
        size: u8,
        pre_taint: Option<u8>,
    ) -> Result<()> {
        let mut value = [0u8; MAX_WRITE_SIZE];
        if pre_taint.is_some() {
            emu.mem_read(address, &mut value[..size as usize])?;
        }
        self.records.push(WriteRecord {
            address,
            size,
            value,
            pre_taint,
        });
        Ok(())
    }

    /// Commit the log: realize deferred records whose page has since become
    /// active, then forget everything. Committed bytes stay [Taint::Dirty] in
    /// the bitmap until the engine synchronizes them out.
    pub fn commit(&mut self, taints: &mut TaintMap) {
        for record in self.records.iter_mut() {
            if record.pre_taint.is_none() {
                if let Some(bitmap) = taints.page_mut(record.address) {
                    debug!(
                        "commit: lazily realizing write [{:#x}, {:#x})",
                        record.address,
                        record.address + record.size as u64
                    );
                    let start = (record.address & OFFSET_MASK) as usize;
                    for tag in bitmap[start..start + record.size as usize].iter_mut() {
                        *tag = Taint::Dirty;
                    }
                    record.pre_taint = Some(full_mask(record.size));
                }
            }
        }
        self.records.clear();
    }

    /// Undo every logged write in LIFO order, restoring guest memory and the
    /// taint bitmap to their pre-write state.
    pub fn rollback(&mut self, taints: &mut TaintMap, emu: &mut dyn EmulatorOps) {
        for record in self.records.iter().rev() {
            let start = (record.address & OFFSET_MASK) as usize;
            match record.pre_taint {
                None => {
                    // Every byte was taint-free before the write. The page may
                    // have been activated since; clear whatever the failed
                    // block installed there.
                    if let Some(bitmap) = taints.page_mut(record.address) {
                        for tag in bitmap[start..start + record.size as usize].iter_mut() {
                            *tag = Taint::None;
                        }
                    }
                }
                Some(mask) => {
                    if let Err(err) = emu.mem_write(record.address, &record.value[..record.size as usize])
                    {
                        warn!("rollback: restoring {:#x} failed: {err}", record.address);
                        break;
                    }
                    if mask != 0 {
                        if let Some(bitmap) = taints.page_mut(record.address) {
                            for i in 0..record.size as usize {
                                if (mask >> i) & 1 == 1 {
                                    bitmap[start + i] = Taint::None;
                                }
                            }
                        }
                    }
                }
            }
        }
        self.records.clear();
    }
}

/// Stamp the taint of a guest write into the bitmap and log it for rollback.
/// `symbolic` marks every written byte [Taint::Symbolic] (no pre-taint bits
/// are needed; rollback resets symbolic bytes to [Taint::None]); otherwise
/// bytes not already dirty become [Taint::Dirty] with their mask bit
/// recorded. Writes crossing a page boundary produce two records.
pub fn record_write(
    taints: &mut TaintMap,
    log: &mut WriteLog,
    emu: &mut dyn EmulatorOps,
    addr: u64,
    size: usize,
    symbolic: bool,
) -> Result<()> {
    let first_len = size.min(PAGE_SIZE - (addr & OFFSET_MASK) as usize);
    record_write_chunk(taints, log, emu, addr, first_len, symbolic)?;
    if first_len < size {
        record_write_chunk(
            taints,
            log,
            emu,
            addr + first_len as u64,
            size - first_len,
            symbolic,
        )?;
    }
    Ok(())
}

fn record_write_chunk(
    taints: &mut TaintMap,
    log: &mut WriteLog,
    emu: &mut dyn EmulatorOps,
    addr: u64,
    size: usize,
    symbolic: bool,
) -> Result<()> {
    debug_assert!(size <= MAX_WRITE_SIZE);
    let start = (addr & OFFSET_MASK) as usize;
    let pre_taint = match taints.page_mut(addr) {
        Some(bitmap) => {
            let mut mask = 0u8;
            for i in 0..size {
                if bitmap[start + i] != Taint::Dirty {
                    mask |= 1 << i;
                }
                if symbolic {
                    bitmap[start + i] = Taint::Symbolic;
                } else {
                    bitmap[start + i] = Taint::Dirty;
                }
            }
            Some(mask)
        }
        None => None,
    };
    log.push(emu, addr, size as u8, pre_taint)
}

/// Shared backing buffer of one cached page. Mapping it into the emulator
/// makes guest writes land directly in the cache.
pub type SharedPageBuf = Rc<RefCell<Box<[u8; PAGE_SIZE]>>>;

/// One cached page of guest memory.
#[derive(Clone)]
pub struct CachedPage {
    pub data: SharedPageBuf,
    pub perms: Protection,
}

/// Content-addressed cache of guest pages, shareable between sessions that
/// execute the same program image.
#[derive(Default)]
pub struct PageCache {
    pages: BTreeMap<u64, CachedPage>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.pages.contains_key(&addr)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Cache `bytes` page by page starting at `addr`. Pages already cached
    /// must carry identical contents; re-caching them is a no-op.
    pub fn cache(&mut self, addr: u64, bytes: &[u8], perms: Protection) -> Result<()> {
        if addr & OFFSET_MASK != 0 {
            return Err(Error::Unaligned(addr));
        }
        if bytes.len() % PAGE_SIZE != 0 {
            return Err(Error::UnalignedLength(bytes.len() as u64));
        }

        for (index, chunk) in bytes.chunks_exact(PAGE_SIZE).enumerate() {
            let page_addr = addr + (index * PAGE_SIZE) as u64;
            if let Some(existing) = self.pages.get(&page_addr) {
                debug!("page {page_addr:#x} already cached");
                if existing.data.borrow().as_slice() != chunk {
                    return Err(Error::CacheMismatch(page_addr));
                }
                continue;
            }

            let mut data = Box::new([0u8; PAGE_SIZE]);
            data.copy_from_slice(chunk);
            self.pages.insert(
                page_addr,
                CachedPage {
                    data: Rc::new(RefCell::new(data)),
                    perms,
                },
            );
        }
        Ok(())
    }

    /// Map every cached page in `[addr, addr + size)` into the emulator by
    /// shared buffer. Returns `false` if any page is missing from the cache
    /// or rejected by the emulator.
    pub fn map_into(&self, emu: &mut dyn EmulatorOps, addr: u64, size: usize) -> bool {
        let mut success = true;
        let mut offset = 0;
        while offset < size as u64 {
            let page_addr = addr + offset;
            match self.pages.get(&page_addr) {
                Some(page) => {
                    if let Err(err) = emu.map_shared(page_addr, page.perms, Rc::clone(&page.data)) {
                        warn!("map_into [{page_addr:#x}]: {err}");
                        success = false;
                    }
                }
                None => success = false,
            }
            offset += PAGE_SIZE as u64;
        }
        success
    }

    /// Unmap and drop the cached page at `addr`, if present.
    pub fn wipe_page(&mut self, emu: &mut dyn EmulatorOps, addr: u64) {
        if self.pages.remove(&addr).is_some() {
            if let Err(err) = emu.unmap(addr, PAGE_SIZE as u64) {
                debug!("wipe_page [{addr:#x}]: {err}");
            }
        }
    }

    /// Wipe every cached page overlapping `[addr, addr + len)`.
    pub fn wipe_region(&mut self, emu: &mut dyn EmulatorOps, addr: u64, len: u64) {
        let base = page_of(addr);
        let mut offset = 0;
        while offset < len {
            self.wipe_page(emu, base + offset);
            offset += PAGE_SIZE as u64;
        }
    }

    /// Wipe every cached page.
    pub fn clear(&mut self, emu: &mut dyn EmulatorOps) {
        while let Some(&addr) = self.pages.keys().next() {
            self.wipe_page(emu, addr);
        }
    }
}
