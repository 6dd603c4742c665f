//! Pools of pre-reserved host pages backing copy-on-write faults.
//!
//! A [`MemoryBank`] grows in whole *arenas* (anonymous 2 MiB mappings that
//! each become one KVM memory slot) and hands out single 4 KiB pages from
//! the newest arena.  Arenas live above the machine's main memory region in
//! guest-physical space; a forked child's bank starts above the span its
//! master may still grow into, so master and child slots never overlap.
//!
//! Data pages (CoW working set) and page-table pages are accounted
//! separately: `banked_memory_pages()` reports exactly the pages a guest
//! dirtied, not the paging structures that carry them.

use std::sync::Arc;

use thiserror::Error;
use vm_memory::{GuestAddress, GuestRegionMmap, MmapRegion};

use crate::paging::PAGE_SIZE;

/// Pages per arena (2 MiB).
pub const ARENA_PAGES: u64 = 512;

/// Bytes per arena.
pub const ARENA_SIZE: u64 = ARENA_PAGES * PAGE_SIZE;

#[derive(Error, Debug)]
pub enum BankError {
    /// The configured working-memory ceiling is exhausted.
    #[error("working memory limit of {limit} bytes exhausted")]
    LimitExhausted { limit: u64 },

    /// The host refused to give us another arena mapping.
    #[error("failed to reserve a {ARENA_SIZE}-byte arena")]
    ArenaAllocation,
}

/// What a freshly acquired bank page will hold.  Only the accounting
/// differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Guest data redirected by a CoW fault or a host-side write.
    Data,
    /// A page-table page (root copy, intermediate table, or leaf table).
    Table,
}

/// One arena: a host mapping, its guest-physical placement, and a cursor.
pub struct BankArena {
    region: Arc<GuestRegionMmap>,
    gpa: u64,
    slot: u32,
    used: u64,
    /// Pages below this index have been handed out before (only possible
    /// after a cursor reset) and must be scrubbed on reuse.
    high_water: u64,
}

impl BankArena {
    /// Guest-physical base of this arena.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// KVM slot index this arena is registered under.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The backing region, for composing guest memory views.
    pub fn region(&self) -> &Arc<GuestRegionMmap> {
        &self.region
    }
}

/// Result of a page allocation.
pub struct BankPage {
    /// Guest-physical address of the page.
    pub gpa: u64,
    /// Set when this allocation created a new arena that still needs a KVM
    /// slot and a spot in the owner's guest-memory view.
    pub new_arena: Option<(u32, Arc<GuestRegionMmap>)>,
    /// The page may hold stale bytes from before a reset and must be
    /// zeroed if the caller is not about to overwrite all of it.
    pub recycled: bool,
}

/// An append-only pool of 4 KiB pages grouped into KVM-slot-sized arenas.
pub struct MemoryBank {
    arenas: Vec<BankArena>,
    base_gpa: u64,
    next_gpa: u64,
    first_slot: u32,
    next_slot: u32,
    /// Ceiling in bytes; `None` means unlimited, `Some(0)` disables the
    /// bank entirely (a fork-only master).
    max_work_mem: Option<u64>,
    data_pages: u64,
    table_pages: u64,
    /// Index of the arena currently being carved up.
    active: usize,
}

impl MemoryBank {
    /// Create an empty bank whose arenas will occupy guest-physical space
    /// from `base_gpa` upward and KVM slots from `first_slot` upward.
    pub fn new(base_gpa: u64, first_slot: u32) -> Self {
        Self {
            arenas: Vec::new(),
            base_gpa,
            next_gpa: base_gpa,
            first_slot,
            next_slot: first_slot,
            max_work_mem: None,
            data_pages: 0,
            table_pages: 0,
            active: 0,
        }
    }

    /// Set the working-memory ceiling in bytes.  `None` removes the
    /// ceiling; `Some(0)` makes every allocation fail.
    pub fn set_limit(&mut self, max_work_mem: Option<u64>) {
        self.max_work_mem = max_work_mem;
    }

    /// The configured ceiling.
    pub fn limit(&self) -> Option<u64> {
        self.max_work_mem
    }

    /// Guest-physical base of the bank's arena span.
    pub fn base_gpa(&self) -> u64 {
        self.base_gpa
    }

    /// Guest-physical address one past the highest arena this bank may
    /// ever create under its current ceiling.  Unlimited banks reserve a
    /// single arena's span as the minimum.
    pub fn reserved_end(&self) -> u64 {
        let span = match self.max_work_mem {
            None => ARENA_SIZE,
            Some(limit) => (limit + ARENA_SIZE - 1) & !(ARENA_SIZE - 1),
        };
        self.base_gpa + span.max(self.next_gpa - self.base_gpa)
    }

    /// Pages of guest data currently handed out.
    pub fn data_pages(&self) -> u64 {
        self.data_pages
    }

    /// Page-table pages currently handed out.
    pub fn table_pages(&self) -> u64 {
        self.table_pages
    }

    /// All pages handed out, in bytes.
    pub fn used_bytes(&self) -> u64 {
        (self.data_pages + self.table_pages) * PAGE_SIZE
    }

    /// The arenas, oldest first.
    pub fn arenas(&self) -> &[BankArena] {
        &self.arenas
    }

    /// Whether `gpa` falls inside a page this bank has handed out.
    pub fn owns(&self, gpa: u64) -> bool {
        self.arenas
            .iter()
            .any(|a| gpa >= a.gpa && gpa < a.gpa + a.used * PAGE_SIZE)
    }

    /// Hand out one 4 KiB page, growing by a whole arena when the current
    /// one is full.
    pub fn allocate_page(&mut self, kind: PageKind) -> Result<BankPage, BankError> {
        if let Some(limit) = self.max_work_mem {
            if self.used_bytes() + PAGE_SIZE > limit {
                return Err(BankError::LimitExhausted { limit });
            }
        }

        let mut new_arena = None;
        if self.active >= self.arenas.len()
            || self.arenas[self.active].used == ARENA_PAGES
        {
            if self.active + 1 < self.arenas.len() {
                // A kept arena from before a reset.
                self.active += 1;
            } else {
                let mapping = MmapRegion::new(ARENA_SIZE as usize)
                    .map_err(|_| BankError::ArenaAllocation)?;
                let region = GuestRegionMmap::new(mapping, GuestAddress(self.next_gpa))
                    .map_err(|_| BankError::ArenaAllocation)?;
                let region = Arc::new(region);
                self.arenas.push(BankArena {
                    region: region.clone(),
                    gpa: self.next_gpa,
                    slot: self.next_slot,
                    used: 0,
                    high_water: 0,
                });
                new_arena = Some((self.next_slot, region));
                self.active = self.arenas.len() - 1;
                self.next_gpa += ARENA_SIZE;
                self.next_slot += 1;
            }
        }

        let arena = &mut self.arenas[self.active];
        let index = arena.used;
        arena.used += 1;
        let recycled = index < arena.high_water;
        arena.high_water = arena.high_water.max(arena.used);

        match kind {
            PageKind::Data => self.data_pages += 1,
            PageKind::Table => self.table_pages += 1,
        }

        Ok(BankPage {
            gpa: self.arenas[self.active].gpa + index * PAGE_SIZE,
            new_arena,
            recycled,
        })
    }

    /// Release every page.  With `keep`, arenas (and their KVM slots) stay
    /// registered and are carved up again on the next allocation; without
    /// it, the arenas are dropped and their slot indices returned so the
    /// caller can detach them from the hypervisor.
    pub fn reset(&mut self, keep: bool) -> Vec<u32> {
        self.data_pages = 0;
        self.table_pages = 0;
        self.active = 0;
        if keep {
            for arena in &mut self.arenas {
                arena.used = 0;
            }
            Vec::new()
        } else {
            let slots = self.arenas.iter().map(|a| a.slot).collect();
            self.arenas.clear();
            self.next_gpa = self.base_gpa;
            self.next_slot = self.first_slot;
            slots
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
