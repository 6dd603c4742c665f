//! Static ELF64 image loading.
//!
//! The engine runs statically linked x86_64 executables.  Loading copies
//! every `PT_LOAD` segment into the identity-mapped main region, records
//! each segment's protection for the page-table builder, and keeps the
//! symbol table around so hosts can call guest functions by name and
//! fault dumps can name the failing address.

use std::collections::HashMap;

use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};
use goblin::elf::{header, Elf};
use log::{debug, info};
use thiserror::Error;

use crate::memory::GuestMemory;
use crate::paging::{page_align, page_align_up};

#[derive(Error, Debug)]
pub enum LoaderError {
    /// goblin could not make sense of the image.
    #[error("failed to parse guest binary: {0}")]
    Parse(#[from] goblin::error::Error),

    /// The image is not a 64-bit x86_64 executable.
    #[error("guest binary is not a 64-bit x86_64 executable")]
    WrongMachine,

    /// A loadable segment falls outside the guest's usable address range.
    #[error("segment at {vaddr:#x}+{memsz:#x} is outside guest memory")]
    SegmentOutOfRange { vaddr: u64, memsz: u64 },

    /// A segment's file range runs past the end of the binary.
    #[error("segment file range {offset:#x}+{filesz:#x} exceeds binary size")]
    TruncatedSegment { offset: u64, filesz: u64 },

    /// The image has no loadable segments.
    #[error("guest binary has no loadable segments")]
    NoSegments,
}

/// One loadable mapping for the page-table builder.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub len: u64,
    pub writable: bool,
    pub executable: bool,
}

/// The result of loading: entry point, extent, and the symbol table.
#[derive(Clone)]
pub struct LoadedImage {
    entry: u64,
    lowest: u64,
    end: u64,
    symbols: HashMap<String, u64>,
    /// `(address, name)` sorted by address, for nearest-symbol lookups.
    by_address: Vec<(u64, String)>,
}

impl LoadedImage {
    /// The ELF entry point.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Lowest mapped address of the image.
    pub fn lowest_address(&self) -> u64 {
        self.lowest
    }

    /// One past the highest mapped address, page-aligned.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Address of a symbol, if the image carries one by that name.
    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Name and offset of the symbol covering `addr`, for diagnostics.
    pub fn resolve(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = self.by_address.partition_point(|(a, _)| *a <= addr);
        let (base, name) = self.by_address.get(idx.checked_sub(1)?)?;
        Some((name.as_str(), addr - base))
    }
}

/// Parse `binary` and copy its loadable segments into guest memory.
///
/// `user_base` is the lowest address user mappings may occupy (the end of
/// the kernel area) and `user_end` the top of the main region.  Returns
/// the image description plus the segment list the page-table builder
/// needs.
pub fn load(
    memory: &GuestMemory,
    binary: &[u8],
    user_base: u64,
    user_end: u64,
    verbose: bool,
) -> Result<(LoadedImage, Vec<Segment>), LoaderError> {
    let elf = Elf::parse(binary)?;
    if !elf.is_64 || elf.header.e_machine != header::EM_X86_64 {
        return Err(LoaderError::WrongMachine);
    }

    let mut segments = Vec::new();
    let mut lowest = u64::MAX;
    let mut end = 0u64;

    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.p_memsz == 0 {
            continue;
        }
        let vaddr = ph.p_vaddr;
        if vaddr < user_base || vaddr.saturating_add(ph.p_memsz) > user_end {
            return Err(LoaderError::SegmentOutOfRange {
                vaddr,
                memsz: ph.p_memsz,
            });
        }
        let offset = ph.p_offset as usize;
        let filesz = ph.p_filesz as usize;
        if offset.saturating_add(filesz) > binary.len() {
            return Err(LoaderError::TruncatedSegment {
                offset: ph.p_offset,
                filesz: ph.p_filesz,
            });
        }

        // Identity mapping: the segment's file bytes land at its vaddr.
        // BSS needs no explicit zeroing: fresh main memory is zero.
        memory
            .write_phys(vaddr, &binary[offset..offset + filesz])
            .map_err(|_| LoaderError::SegmentOutOfRange {
                vaddr,
                memsz: ph.p_memsz,
            })?;

        let seg = Segment {
            vaddr: page_align(vaddr),
            len: page_align_up(vaddr + ph.p_memsz) - page_align(vaddr),
            writable: ph.p_flags & PF_W != 0,
            executable: ph.p_flags & PF_X != 0,
        };
        if verbose {
            info!(
                "load segment {:#x}..{:#x} file {:#x}+{:#x} {}{}{}",
                vaddr,
                vaddr + ph.p_memsz,
                ph.p_offset,
                ph.p_filesz,
                if ph.p_flags & goblin::elf::program_header::PF_R != 0 { "r" } else { "-" },
                if seg.writable { "w" } else { "-" },
                if seg.executable { "x" } else { "-" },
            );
        }
        lowest = lowest.min(seg.vaddr);
        end = end.max(seg.vaddr + seg.len);
        segments.push(seg);
    }

    if segments.is_empty() {
        return Err(LoaderError::NoSegments);
    }

    let mut symbols = HashMap::new();
    let mut by_address = Vec::new();
    for sym in elf.syms.iter() {
        if sym.st_value == 0 {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if name.is_empty() {
                continue;
            }
            symbols.insert(name.to_string(), sym.st_value);
            if sym.is_function() {
                by_address.push((sym.st_value, name.to_string()));
            }
        }
    }
    by_address.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(
        "loaded image: entry {:#x}, {:#x}..{:#x}, {} symbols",
        elf.entry,
        lowest,
        end,
        symbols.len(),
    );

    Ok((
        LoadedImage {
            entry: elf.entry,
            lowest,
            end,
            symbols,
            by_address,
        },
        segments,
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────
