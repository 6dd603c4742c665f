//! Guest memory: the composed physical view, address translation, host↔guest
//! copies, and the copy-on-write core.
//!
//! A [`GuestMemory`] owns one contiguous *main region* (guest-physical
//! `[physbase, physbase + size)`, identity-mapped by the page tables) plus
//! the 4 KiB pages of its [`MemoryBank`].  A forked machine's view shares
//! the master's main region and bank arenas read-only and owns only its own
//! bank.
//!
//! This module never talks to the hypervisor directly: memory-slot changes
//! are recorded as [`SlotUpdate`]s and applied by the owning machine before
//! the vCPU next runs.  That keeps every operation here, including the
//! whole CoW path, exercisable on plain host memory.

use std::borrow::Cow;
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap, GuestRegionMmap, MmapRegion};

use crate::bank::{BankError, BankPage, MemoryBank, PageKind, ARENA_SIZE};
use crate::paging::{
    self, page_align, PagingError, LEVEL_SHIFTS, PAGE_SIZE, PDE64_ADDR_MASK, PDE64_NX,
    PDE64_PRESENT, PDE64_RW, PDE64_USER, TABLE_FLAGS,
};

/// KVM slot index of the main memory region.
pub const MAIN_SLOT: u32 = 0;

/// First KVM slot index used by an original machine's bank arenas.
const FIRST_BANK_SLOT: u32 = 1;

const ZERO_PAGE: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum MemoryError {
    /// Reserving the main region's host mapping failed.
    #[error("failed to allocate {size} bytes of guest memory")]
    Mmap { size: u64 },

    /// Composing or extending the guest-physical view failed.
    #[error("failed to compose the guest memory view")]
    Region,

    /// An address was unmapped or lacked the required permissions.
    #[error("protection violation at {addr:#x}")]
    ProtectionViolation { addr: u64 },

    /// A bounded read ran past its limit.
    #[error("bounds exceeded reading {len} bytes at {addr:#x}")]
    BoundsExceeded { addr: u64, len: usize },

    /// The range is valid but not physically contiguous in host memory.
    #[error("guest range at {addr:#x} spans non-contiguous memory")]
    NotContiguous { addr: u64 },

    /// A gather request supplied too few buffer slots.
    #[error("{needed} buffers needed but only {provided} provided")]
    TooFewBuffers { needed: usize, provided: usize },

    /// A backing-store access failed outright.
    #[error("guest memory access failed at {addr:#x}")]
    Access { addr: u64 },

    /// A slot install would overlap an existing slot in guest-physical
    /// space.
    #[error("memory slot {idx} overlaps an installed slot")]
    SlotOverlap { idx: u32 },

    /// A slot operation referenced an index that was never installed.
    #[error("no such memory slot {idx}")]
    NoSuchSlot { idx: u32 },

    #[error(transparent)]
    Bank(#[from] BankError),

    #[error(transparent)]
    Paging(#[from] PagingError),
}

// ═══════════════════════════════════════════════════════════════════════
//  Slot bookkeeping
// ═══════════════════════════════════════════════════════════════════════

/// A pending change to the hypervisor's memory-slot table.  The owning
/// machine drains these with [`GuestMemory::take_slot_updates`] and applies
/// them before re-entering the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotUpdate {
    Install { idx: u32, gpa: u64, size: u64, ro: bool },
    Delete { idx: u32 },
}

#[derive(Debug, Clone, Copy)]
struct SlotInfo {
    idx: u32,
    gpa: u64,
    size: u64,
    ro: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestMemory
// ═══════════════════════════════════════════════════════════════════════

/// The guest's physical memory and page tables.
pub struct GuestMemory {
    mem: GuestMemoryMmap,
    main: Arc<GuestRegionMmap>,
    physbase: u64,
    size: u64,
    page_tables: u64,
    bank: MemoryBank,
    /// Master bank arenas shared into a forked view (read-only).
    inherited: Vec<Arc<GuestRegionMmap>>,
    main_memory_writes: bool,
    slots: Vec<SlotInfo>,
    pending: Vec<SlotUpdate>,
}

fn bank_base_for(physbase: u64, size: u64) -> u64 {
    (physbase + size + ARENA_SIZE - 1) & !(ARENA_SIZE - 1)
}

impl GuestMemory {
    /// Allocate a fresh guest with `size` bytes of main memory at
    /// guest-physical `physbase`.  The main region is writable by the
    /// guest until [`prepare`](Self::mask_writable_pages)-style masking
    /// turns it into a CoW master.
    pub fn new(physbase: u64, size: u64) -> Result<Self, MemoryError> {
        let mapping =
            MmapRegion::new(size as usize).map_err(|_| MemoryError::Mmap { size })?;
        let main = Arc::new(
            GuestRegionMmap::new(mapping, GuestAddress(physbase))
                .map_err(|_| MemoryError::Mmap { size })?,
        );
        let mem = GuestMemoryMmap::from_arc_regions(vec![main.clone()])
            .map_err(|_| MemoryError::Region)?;
        let mut memory = Self {
            mem,
            main,
            physbase,
            size,
            page_tables: 0,
            bank: MemoryBank::new(bank_base_for(physbase, size), FIRST_BANK_SLOT),
            inherited: Vec::new(),
            main_memory_writes: true,
            slots: Vec::new(),
            pending: Vec::new(),
        };
        memory.install_memory(MAIN_SLOT, physbase, size, false)?;
        Ok(memory)
    }

    /// Build a forked view sharing `master`'s main region and bank pages
    /// read-only.  The child gets its own page-table root (a bank copy of
    /// the master's) and an empty bank placed above the master's reserved
    /// span.
    pub fn fork_from(master: &GuestMemory) -> Result<Self, MemoryError> {
        let mut regions = vec![master.main.clone()];
        let mut inherited = Vec::new();
        for arena in master.bank.arenas() {
            regions.push(arena.region().clone());
            inherited.push(arena.region().clone());
        }
        let mem =
            GuestMemoryMmap::from_arc_regions(regions).map_err(|_| MemoryError::Region)?;

        let master_arena_slots =
            ((master.bank.reserved_end() - master.bank.base_gpa()) / ARENA_SIZE) as u32;
        let first_slot = FIRST_BANK_SLOT + master_arena_slots.max(1);

        let mut memory = Self {
            mem,
            main: master.main.clone(),
            physbase: master.physbase,
            size: master.size,
            page_tables: 0,
            bank: MemoryBank::new(master.bank.reserved_end(), first_slot),
            inherited,
            main_memory_writes: false,
            slots: Vec::new(),
            pending: Vec::new(),
        };
        memory.install_memory(MAIN_SLOT, master.physbase, master.size, true)?;
        for arena in master.bank.arenas() {
            memory.install_memory(arena.slot(), arena.gpa(), ARENA_SIZE, true)?;
        }
        memory.adopt_root(master.page_tables)?;
        Ok(memory)
    }

    /// Rewind a forked view to `master`'s state: drop (or recycle) the
    /// bank, re-mirror any master arenas that appeared since the fork, and
    /// take a fresh copy of the master's root table.
    pub fn reset_from(&mut self, master: &GuestMemory, keep: bool) -> Result<(), MemoryError> {
        for idx in self.bank.reset(keep) {
            self.delete_memory(idx)?;
        }
        if !keep {
            let mut regions = vec![self.main.clone()];
            regions.extend(self.inherited.iter().cloned());
            self.mem =
                GuestMemoryMmap::from_arc_regions(regions).map_err(|_| MemoryError::Region)?;
        }
        // Mirror arenas the master allocated after the fork.
        for arena in master.bank.arenas() {
            let gpa = arena.gpa();
            if !self.slots.iter().any(|s| s.idx == arena.slot()) {
                self.mem = self
                    .mem
                    .insert_region(arena.region().clone())
                    .map_err(|_| MemoryError::Region)?;
                self.inherited.push(arena.region().clone());
                self.install_memory(arena.slot(), gpa, ARENA_SIZE, true)?;
            }
        }
        self.adopt_root(master.page_tables)
    }

    fn adopt_root(&mut self, master_root: u64) -> Result<(), MemoryError> {
        let root = self.bank_page(PageKind::Table, false)?;
        self.copy_page(master_root, root)?;
        self.page_tables = root;
        Ok(())
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn physbase(&self) -> u64 {
        self.physbase
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Guest-physical address of the page-table root (the CR3 value).
    pub fn page_tables(&self) -> u64 {
        self.page_tables
    }

    pub(crate) fn set_page_tables(&mut self, root: u64) {
        self.page_tables = root;
    }

    /// Whether the guest may write the main region in place instead of
    /// going through bank pages.
    pub fn main_memory_writes(&self) -> bool {
        self.main_memory_writes
    }

    pub(crate) fn set_main_memory_writes(&mut self, value: bool) {
        self.main_memory_writes = value;
    }

    /// The raw composed view, for the page-table builder and the loader.
    pub(crate) fn raw(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    pub(crate) fn bank(&self) -> &MemoryBank {
        &self.bank
    }

    pub(crate) fn set_bank_limit(&mut self, max_work_mem: u64) {
        self.bank.set_limit(Some(max_work_mem));
    }

    /// Bank pages currently backing guest data (the CoW working set).
    pub fn banked_memory_pages(&self) -> u64 {
        self.bank.data_pages()
    }

    /// Host pointer for an installed guest-physical address; used by the
    /// machine when applying slot updates.
    pub(crate) fn host_address(&self, gpa: u64) -> Result<*mut u8, MemoryError> {
        self.mem
            .get_host_address(GuestAddress(gpa))
            .map_err(|_| MemoryError::Access { addr: gpa })
    }

    fn in_main(&self, gpa: u64) -> bool {
        gpa >= self.physbase && gpa < self.physbase + self.size
    }

    /// A guest-physical page is *owned* (writable host-side and
    /// guest-side) iff it is one of our own bank pages, or main-region
    /// memory on a machine in direct-write mode.
    fn owned(&self, gpa: u64) -> bool {
        self.bank.owns(gpa) || (self.main_memory_writes && self.in_main(gpa))
    }

    // ─── Slot bookkeeping ────────────────────────────────────────────

    /// Record a slot installation.  Slots must not overlap in
    /// guest-physical space.
    pub fn install_memory(
        &mut self,
        idx: u32,
        gpa: u64,
        size: u64,
        ro: bool,
    ) -> Result<(), MemoryError> {
        if self
            .slots
            .iter()
            .any(|s| s.idx == idx || (gpa < s.gpa + s.size && s.gpa < gpa + size))
        {
            return Err(MemoryError::SlotOverlap { idx });
        }
        self.slots.push(SlotInfo { idx, gpa, size, ro });
        self.pending.push(SlotUpdate::Install { idx, gpa, size, ro });
        Ok(())
    }

    /// Record a slot removal.
    pub fn delete_memory(&mut self, idx: u32) -> Result<(), MemoryError> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.idx == idx)
            .ok_or(MemoryError::NoSuchSlot { idx })?;
        self.slots.remove(pos);
        self.pending.push(SlotUpdate::Delete { idx });
        Ok(())
    }

    /// Drain the pending slot changes for the hypervisor.
    pub(crate) fn take_slot_updates(&mut self) -> Vec<SlotUpdate> {
        std::mem::take(&mut self.pending)
    }

    #[cfg(test)]
    fn installed_slots(&self) -> Vec<(u32, bool)> {
        self.slots.iter().map(|s| (s.idx, s.ro)).collect()
    }

    // ─── Raw physical access (setup-time, no page tables) ────────────

    pub(crate) fn write_phys(&self, gpa: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        if !self.in_main(gpa) || !self.in_main(gpa + bytes.len() as u64 - 1) {
            return Err(MemoryError::Access { addr: gpa });
        }
        self.mem
            .write_slice(bytes, GuestAddress(gpa))
            .map_err(|_| MemoryError::Access { addr: gpa })
    }

    pub(crate) fn read_phys(&self, gpa: u64, bytes: &mut [u8]) -> Result<(), MemoryError> {
        self.mem
            .read_slice(bytes, GuestAddress(gpa))
            .map_err(|_| MemoryError::Access { addr: gpa })
    }

    fn read_u64(&self, gpa: u64) -> Result<u64, MemoryError> {
        self.mem
            .read_obj(GuestAddress(gpa))
            .map_err(|_| MemoryError::Access { addr: gpa })
    }

    fn write_u64(&self, gpa: u64, value: u64) -> Result<(), MemoryError> {
        self.mem
            .write_obj(value, GuestAddress(gpa))
            .map_err(|_| MemoryError::Access { addr: gpa })
    }

    fn copy_page(&self, src: u64, dst: u64) -> Result<(), MemoryError> {
        let mut buf = [0u8; PAGE_SIZE as usize];
        self.mem
            .read_slice(&mut buf, GuestAddress(src))
            .map_err(|_| MemoryError::Access { addr: src })?;
        self.mem
            .write_slice(&buf, GuestAddress(dst))
            .map_err(|_| MemoryError::Access { addr: dst })
    }

    // ─── Translation ─────────────────────────────────────────────────

    fn leaf(&self, va: u64) -> Result<u64, MemoryError> {
        paging::lookup(&self.mem, self.page_tables, va)
            .ok_or(MemoryError::ProtectionViolation { addr: va })
    }

    /// Walk the page tables and return the guest-physical address backing
    /// `va`.
    pub fn translate(&self, va: u64) -> Result<u64, MemoryError> {
        let leaf = self.leaf(va)?;
        Ok((leaf & PDE64_ADDR_MASK) | (va & (PAGE_SIZE - 1)))
    }

    /// Host pointer for a guest range, valid only while no page is
    /// redirected.  Fails unless the range is physically contiguous in
    /// host memory.  No permission checks.
    pub fn at(&self, va: u64, len: usize) -> Result<*const u8, MemoryError> {
        self.contiguous_ptr(va, len, false)
    }

    /// Like [`at`](Self::at), but also verifies the range is entirely
    /// user-accessible and does not cross pages of differing permissions.
    pub fn safe_at(&self, va: u64, len: usize) -> Result<*const u8, MemoryError> {
        self.contiguous_ptr(va, len, true)
    }

    fn contiguous_ptr(&self, va: u64, len: usize, safe: bool) -> Result<*const u8, MemoryError> {
        if len == 0 {
            return Err(MemoryError::BoundsExceeded { addr: va, len });
        }
        let mut expected: Option<*const u8> = None;
        let mut first: *const u8 = std::ptr::null();
        let mut perms: Option<u64> = None;
        let mut addr = va;
        let end = va + len as u64;
        while addr < end {
            let leaf = self.leaf(addr)?;
            if safe {
                if leaf & PDE64_USER == 0 {
                    return Err(MemoryError::ProtectionViolation { addr });
                }
                let bits = leaf & (PDE64_RW | PDE64_USER | PDE64_NX);
                if *perms.get_or_insert(bits) != bits {
                    return Err(MemoryError::ProtectionViolation { addr });
                }
            }
            let pa = (leaf & PDE64_ADDR_MASK) | (addr & (PAGE_SIZE - 1));
            let ptr = self.host_address(pa)? as *const u8;
            match expected {
                None => first = ptr,
                Some(want) if want != ptr => {
                    return Err(MemoryError::NotContiguous { addr: va })
                }
                _ => {}
            }
            let chunk = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))).min(end - addr);
            expected = Some(unsafe { ptr.add(chunk as usize) });
            addr += chunk;
        }
        Ok(first)
    }

    // ─── Copies ──────────────────────────────────────────────────────

    /// Write `src` into the guest at `va`, acquiring writable pages as
    /// needed.  With `zeroes`, pages the copy fully covers skip the
    /// duplicate-from-master step; the caller is overwriting them anyway.
    pub fn copy_to_guest(
        &mut self,
        va: u64,
        src: &[u8],
        zeroes: bool,
    ) -> Result<(), MemoryError> {
        let mut off = 0usize;
        while off < src.len() {
            let addr = va + off as u64;
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = ((PAGE_SIZE - page_off) as usize).min(src.len() - off);
            let full = page_off == 0 && chunk == PAGE_SIZE as usize;
            let pa = self.writable_page_pa(page_align(addr), zeroes && full)?;
            self.mem
                .write_slice(&src[off..off + chunk], GuestAddress(pa + page_off))
                .map_err(|_| MemoryError::Access { addr })?;
            off += chunk;
        }
        Ok(())
    }

    /// Read guest memory into `dst`, enforcing user-page permissions.
    pub fn copy_from_guest(&self, dst: &mut [u8], va: u64) -> Result<(), MemoryError> {
        self.copy_in(dst, va, true)
    }

    /// Read guest memory without permission checks.  Used by the fault
    /// diagnostics path, which must be able to see kernel stack frames.
    pub fn unsafe_copy_from_guest(&self, dst: &mut [u8], va: u64) -> Result<(), MemoryError> {
        self.copy_in(dst, va, false)
    }

    fn copy_in(&self, dst: &mut [u8], va: u64, require_user: bool) -> Result<(), MemoryError> {
        let mut off = 0usize;
        while off < dst.len() {
            let addr = va + off as u64;
            let leaf = self.leaf(addr)?;
            if require_user && leaf & PDE64_USER == 0 {
                return Err(MemoryError::ProtectionViolation { addr });
            }
            let page_off = addr & (PAGE_SIZE - 1);
            let pa = (leaf & PDE64_ADDR_MASK) | page_off;
            let chunk = ((PAGE_SIZE - page_off) as usize).min(dst.len() - off);
            self.mem
                .read_slice(&mut dst[off..off + chunk], GuestAddress(pa))
                .map_err(|_| MemoryError::Access { addr })?;
            off += chunk;
        }
        Ok(())
    }

    /// Describe `[va, va + len)` as host slices without copying, merging
    /// physically adjacent pages.  Fails with
    /// [`MemoryError::TooFewBuffers`] if more than `max_buffers` segments
    /// would be needed.
    pub fn gather_buffers_from_range(
        &self,
        max_buffers: usize,
        va: u64,
        len: u64,
    ) -> Result<Vec<&[u8]>, MemoryError> {
        let segments = self.segments(va, len)?;
        if segments.len() > max_buffers {
            return Err(MemoryError::TooFewBuffers {
                needed: segments.len(),
                provided: max_buffers,
            });
        }
        // Safety: each segment is a live mapping in `self.mem`, disjoint
        // from every other, and the borrow is tied to `&self`.
        Ok(segments
            .into_iter()
            .map(|(ptr, len)| unsafe { std::slice::from_raw_parts(ptr, len) })
            .collect())
    }

    /// Like [`gather_buffers_from_range`](Self::gather_buffers_from_range)
    /// but every returned slice points at a page the guest (and the host)
    /// may write, acquiring CoW pages as needed.
    pub fn writable_buffers_from_range(
        &mut self,
        max_buffers: usize,
        va: u64,
        len: u64,
    ) -> Result<Vec<&mut [u8]>, MemoryError> {
        // Acquire first so the segment walk sees the redirected pages.
        let mut addr = page_align(va);
        while addr < va + len {
            self.writable_page_pa(addr, false)?;
            addr += PAGE_SIZE;
        }
        let segments = self.segments(va, len)?;
        if segments.len() > max_buffers {
            return Err(MemoryError::TooFewBuffers {
                needed: segments.len(),
                provided: max_buffers,
            });
        }
        // Safety: segments are disjoint live mappings; the mutable borrow
        // of `self` outlives every slice.
        Ok(segments
            .into_iter()
            .map(|(ptr, len)| unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) })
            .collect())
    }

    fn segments(&self, va: u64, len: u64) -> Result<Vec<(*const u8, usize)>, MemoryError> {
        let mut out: Vec<(*const u8, usize)> = Vec::new();
        let mut addr = va;
        let end = va + len;
        while addr < end {
            let leaf = self.leaf(addr)?;
            if leaf & PDE64_USER == 0 {
                return Err(MemoryError::ProtectionViolation { addr });
            }
            let page_off = addr & (PAGE_SIZE - 1);
            let pa = (leaf & PDE64_ADDR_MASK) | page_off;
            let chunk = (PAGE_SIZE - page_off).min(end - addr) as usize;
            let ptr = self.host_address(pa)? as *const u8;
            match out.last_mut() {
                Some((last_ptr, last_len))
                    if unsafe { last_ptr.add(*last_len) } == ptr =>
                {
                    *last_len += chunk;
                }
                _ => out.push((ptr, chunk)),
            }
            addr += chunk as u64;
        }
        Ok(out)
    }

    /// Zero a guest range with CoW awareness: fully covered read-only
    /// pages are replaced without duplicating their old contents first.
    pub fn memzero(&mut self, va: u64, len: u64) -> Result<(), MemoryError> {
        let mut addr = va;
        let end = va + len;
        while addr < end {
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = (PAGE_SIZE - page_off).min(end - addr);
            let full = page_off == 0 && chunk == PAGE_SIZE;
            let pa = self.writable_page_pa(page_align(addr), full)?;
            self.mem
                .write_slice(&ZERO_PAGE[..chunk as usize], GuestAddress(pa + page_off))
                .map_err(|_| MemoryError::Access { addr })?;
            addr += chunk;
        }
        Ok(())
    }

    /// Invoke `visit` once per physical segment of the range.
    pub fn foreach_memory<F>(&self, va: u64, len: u64, mut visit: F) -> Result<(), MemoryError>
    where
        F: FnMut(&[u8]),
    {
        for slice in self.gather_buffers_from_range(usize::MAX, va, len)? {
            visit(slice);
        }
        Ok(())
    }

    /// Borrow the range when it is one contiguous host segment, otherwise
    /// return an owned copy.  The allocation-avoiding read for syscall
    /// handlers.
    pub fn string_or_view(&self, va: u64, len: usize) -> Result<Cow<'_, [u8]>, MemoryError> {
        let segments = self.segments(va, len as u64)?;
        if let [(ptr, seg_len)] = segments[..] {
            // Safety: a single live mapping covering the whole range,
            // borrowed for as long as `&self`.
            return Ok(Cow::Borrowed(unsafe { std::slice::from_raw_parts(ptr, seg_len) }));
        }
        let mut buf = vec![0u8; len];
        self.copy_from_guest(&mut buf, va)?;
        Ok(Cow::Owned(buf))
    }

    /// Read a NUL-terminated guest string of at most `max` bytes.
    pub fn copy_from_cstring(&self, va: u64, max: usize) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut addr = va;
        loop {
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = ((PAGE_SIZE - page_off) as usize).min(max + 1 - bytes.len());
            let mut buf = vec![0u8; chunk];
            self.copy_from_guest(&mut buf, addr)?;
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&buf[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&buf);
            if bytes.len() > max {
                return Err(MemoryError::BoundsExceeded { addr: va, len: max });
            }
            addr += chunk as u64;
        }
    }

    // ─── Copy-on-write core ──────────────────────────────────────────

    /// Resolve the page containing `addr` to something writable, walking
    /// (and privatising) the page tables as needed.
    ///
    /// `flags` are the `PDE64_*` bits a redirected or fresh leaf receives
    /// (`PDE64_PRESENT` is implied).  With `zeroes`, a newly acquired page
    /// skips the duplicate-from-master copy because the caller is about to
    /// overwrite every byte of it.
    ///
    /// Returns the guest-physical address of the writable page.  The next
    /// guest entry is the TLB invalidation point: the in-guest fault stub
    /// reloads CR3, and host-driven calls re-apply the special registers.
    pub fn get_writable_page(
        &mut self,
        addr: u64,
        flags: u64,
        zeroes: bool,
    ) -> Result<u64, MemoryError> {
        let va = page_align(addr);
        let leaf_addr = self.writable_leaf_addr(va)?;
        let leaf = self.read_u64(leaf_addr)?;
        if leaf & PDE64_PRESENT != 0 {
            let pa = leaf & PDE64_ADDR_MASK;
            if leaf & PDE64_RW != 0 && self.owned(pa) {
                return Ok(pa);
            }
            if self.main_memory_writes && self.in_main(pa) {
                self.write_u64(leaf_addr, leaf | PDE64_RW)?;
                return Ok(pa);
            }
            let fresh = self.bank_page(PageKind::Data, false)?;
            if !zeroes {
                self.copy_page(pa, fresh)?;
            }
            self.write_u64(leaf_addr, fresh | flags | PDE64_PRESENT | (leaf & PDE64_NX))?;
            debug!("cow: {va:#x} redirected {pa:#x} -> {fresh:#x}");
            Ok(fresh)
        } else if self.main_memory_writes && self.in_main(va) {
            // Demand-map an identity page of the main region.
            self.write_u64(leaf_addr, va | flags | PDE64_PRESENT)?;
            Ok(va)
        } else {
            let fresh = self.bank_page(PageKind::Data, true)?;
            self.write_u64(leaf_addr, fresh | flags | PDE64_PRESENT)?;
            debug!("cow: {va:#x} demand-allocated {fresh:#x}");
            Ok(fresh)
        }
    }

    /// Walk to the leaf entry for `va`, creating missing tables from the
    /// bank and privatising table pages shared with a master.
    fn writable_leaf_addr(&mut self, va: u64) -> Result<u64, MemoryError> {
        let mut table = self.page_tables;
        for shift in &LEVEL_SHIFTS[..3] {
            let entry_addr = table + paging::table_index(va, *shift) * 8;
            let entry = self.read_u64(entry_addr)?;
            table = if entry & PDE64_PRESENT == 0 {
                let fresh = self.bank_page(PageKind::Table, true)?;
                self.write_u64(entry_addr, fresh | TABLE_FLAGS)?;
                fresh
            } else {
                let next = entry & PDE64_ADDR_MASK;
                if self.owned(next) {
                    next
                } else {
                    let copy = self.bank_page(PageKind::Table, false)?;
                    self.copy_page(next, copy)?;
                    self.write_u64(entry_addr, copy | TABLE_FLAGS)?;
                    copy
                }
            };
        }
        Ok(table + paging::table_index(va, LEVEL_SHIFTS[3]) * 8)
    }

    /// Point the leaf for `va` at an explicit guest-physical page, e.g. a
    /// page resolved in a remote peer.
    pub(crate) fn map_page_to(&mut self, va: u64, pa: u64, flags: u64) -> Result<(), MemoryError> {
        let leaf_addr = self.writable_leaf_addr(page_align(va))?;
        self.write_u64(leaf_addr, page_align(pa) | flags | PDE64_PRESENT)
    }

    /// Merge a foreign region (a peer machine's memory) into this view
    /// and record its slot.
    pub(crate) fn share_region(
        &mut self,
        region: Arc<GuestRegionMmap>,
        slot: u32,
        gpa: u64,
        size: u64,
        ro: bool,
    ) -> Result<(), MemoryError> {
        self.mem = self
            .mem
            .insert_region(region)
            .map_err(|_| MemoryError::Region)?;
        self.install_memory(slot, gpa, size, ro)
    }

    /// The main region's backing, for sharing with a peer machine.
    pub(crate) fn main_region(&self) -> Arc<GuestRegionMmap> {
        self.main.clone()
    }

    fn writable_page_pa(&mut self, page_va: u64, zeroes: bool) -> Result<u64, MemoryError> {
        if let Some(leaf) = paging::lookup(&self.mem, self.page_tables, page_va) {
            let pa = leaf & PDE64_ADDR_MASK;
            if leaf & PDE64_RW != 0 && self.owned(pa) {
                return Ok(pa);
            }
        }
        self.get_writable_page(page_va, PDE64_USER | PDE64_RW, zeroes)
    }

    fn bank_page(&mut self, kind: PageKind, scrub_if_recycled: bool) -> Result<u64, MemoryError> {
        let BankPage {
            gpa,
            new_arena,
            recycled,
        } = self.bank.allocate_page(kind)?;
        if let Some((slot, region)) = new_arena {
            self.mem = self
                .mem
                .insert_region(region)
                .map_err(|_| MemoryError::Region)?;
            self.install_memory(slot, gpa & !(ARENA_SIZE - 1), ARENA_SIZE, false)?;
        }
        if recycled && scrub_if_recycled {
            self.mem
                .write_slice(&ZERO_PAGE, GuestAddress(gpa))
                .map_err(|_| MemoryError::Access { addr: gpa })?;
        }
        Ok(gpa)
    }

    // ─── Master preparation ──────────────────────────────────────────

    /// Clear the writable bit on every user page at or above `boundary`,
    /// so any later write, from this machine or a fork, faults into a
    /// bank page.  Returns the number of leaves masked.
    pub fn mask_writable_pages(&mut self, boundary: u64) -> Result<u64, MemoryError> {
        let root = self.page_tables;
        let mut masked = 0;
        self.mask_level(root, 0, 0, boundary, &mut masked)?;
        Ok(masked)
    }

    fn mask_level(
        &mut self,
        table: u64,
        level: usize,
        va_base: u64,
        boundary: u64,
        masked: &mut u64,
    ) -> Result<(), MemoryError> {
        let shift = LEVEL_SHIFTS[level];
        for idx in 0..512u64 {
            let entry_addr = table + idx * 8;
            let entry = self.read_u64(entry_addr)?;
            if entry & PDE64_PRESENT == 0 {
                continue;
            }
            let va = va_base + (idx << shift);
            if level < 3 {
                self.mask_level(entry & PDE64_ADDR_MASK, level + 1, va, boundary, masked)?;
            } else if entry & PDE64_USER != 0 && entry & PDE64_RW != 0 && va >= boundary {
                self.write_u64(entry_addr, entry & !PDE64_RW)?;
                *masked += 1;
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
