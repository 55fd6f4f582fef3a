//! In-memory view of loaded ELF images
//!
//! Everything here reads the dynamic section of modules that the loader already mapped, so
//! no file is opened. Addresses in the dynamic section are either relocated by the loader
//! (glibc) or left as link-time virtual addresses (musl, bionic, the vDSO); [`DynamicView`]
//! accepts both.

use std::ffi::{c_void, CStr};
use std::ops::Range;

use object::elf::{
    Dyn64, Rela64, Sym64, DT_GNU_HASH, DT_HASH, DT_JMPREL, DT_NULL, DT_PLTRELSZ, DT_RELA,
    DT_RELASZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB, SHN_UNDEF, STT_FUNC, STT_GNU_IFUNC, STT_NOTYPE,
    STT_OBJECT,
};
use object::LittleEndian;

#[cfg(target_arch = "aarch64")]
use object::elf::{R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT};
#[cfg(target_arch = "x86_64")]
use object::elf::{R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT};

const LE: LittleEndian = LittleEndian;

/// A module as reported by the dynamic loader.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    /// Path of the image; the main program is reported under `/proc/self/exe`.
    pub path: String,
    /// Difference between run-time and link-time addresses.
    pub bias: usize,
    /// Run-time address range covered by `PT_LOAD` segments.
    pub range: Range<usize>,
    /// Position in load order, the main program is 0.
    pub index: usize,
    dynamic: Option<usize>,
}

impl LoadedModule {
    pub fn is_main_program(&self) -> bool {
        self.index == 0
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.range.contains(&address)
    }

    /// Parse the `PT_DYNAMIC` segment, if the module has one.
    pub fn dynamic(&self) -> Option<DynamicView> {
        // SAFETY: the address comes from the loader's program headers of a mapped image.
        self.dynamic
            .and_then(|address| unsafe { DynamicView::parse(self.bias, address) })
    }
}

/// Snapshot of the modules currently loaded, in load order.
pub fn loaded_modules() -> Vec<LoadedModule> {
    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<LoadedModule>);
        let info = &*info;
        let index = modules.len();

        let path = if index == 0 || info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            std::fs::read_link("/proc/self/exe")
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let bias = info.dlpi_addr as usize;
        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
        };
        let mut start = usize::MAX;
        let mut end = 0;
        let mut dynamic = None;
        for phdr in phdrs {
            match phdr.p_type {
                libc::PT_LOAD if phdr.p_memsz > 0 => {
                    start = start.min(bias + phdr.p_vaddr as usize);
                    end = end.max(bias + (phdr.p_vaddr + phdr.p_memsz) as usize);
                }
                libc::PT_DYNAMIC => dynamic = Some(bias + phdr.p_vaddr as usize),
                _ => {}
            }
        }
        if start > end {
            start = end;
        }

        modules.push(LoadedModule {
            path,
            bias,
            range: start..end,
            index,
            dynamic,
        });
        0
    }

    let mut modules: Vec<LoadedModule> = Vec::new();
    // SAFETY: the callback only touches the vector passed through `data`.
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut modules as *mut _ as *mut c_void);
    }
    modules
}

/// A defined symbol found through a module's hash table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub address: usize,
    pub size: usize,
    /// `STT_GNU_IFUNC`: `address` is the resolver, not the implementation.
    pub indirect: bool,
}

/// Relocation kinds that bind a pointer-sized slot to a symbol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// `JUMP_SLOT` in `DT_JMPREL`: lazily bound PLT entry.
    JumpSlot,
    /// `GLOB_DAT` in `DT_RELA`: eagerly bound GOT entry.
    GlobalData,
    /// Absolute 64-bit data relocation, such as a function pointer table.
    Absolute,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SlotKind::JumpSlot => "JUMP_SLOT",
            SlotKind::GlobalData => "GLOB_DAT",
            SlotKind::Absolute => "ABS64",
        })
    }
}

/// A relocated slot that holds the address of a symbol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RelocatedSlot {
    pub address: usize,
    pub kind: SlotKind,
}

enum Hash {
    Gnu(usize),
    Sysv(usize),
}

/// Tables referenced from a module's `PT_DYNAMIC` segment.
pub struct DynamicView {
    bias: usize,
    strtab: usize,
    strsz: usize,
    symtab: usize,
    hash: Option<Hash>,
    jmprel: Option<(usize, usize)>,
    rela: Option<(usize, usize)>,
}

impl DynamicView {
    /// # Safety
    ///
    /// `dynamic` must point at the mapped, `DT_NULL` terminated dynamic array of a module
    /// loaded with `bias`.
    unsafe fn parse(bias: usize, dynamic: usize) -> Option<Self> {
        let fix = |ptr: u64| {
            let ptr = ptr as usize;
            if ptr < bias {
                ptr + bias
            } else {
                ptr
            }
        };

        let mut strtab = None;
        let mut strsz = 0;
        let mut symtab = None;
        let mut gnu_hash = None;
        let mut sysv_hash = None;
        let (mut jmprel, mut pltrelsz) = (None, 0);
        let (mut rela, mut relasz) = (None, 0);

        let mut entry = dynamic as *const Dyn64<LittleEndian>;
        loop {
            let tag = (*entry).d_tag.get(LE);
            let value = (*entry).d_val.get(LE);
            match u32::try_from(tag) {
                Ok(DT_NULL) => break,
                Ok(DT_STRTAB) => strtab = Some(fix(value)),
                Ok(DT_STRSZ) => strsz = value as usize,
                Ok(DT_SYMTAB) => symtab = Some(fix(value)),
                Ok(DT_GNU_HASH) => gnu_hash = Some(fix(value)),
                Ok(DT_HASH) => sysv_hash = Some(fix(value)),
                Ok(DT_JMPREL) => jmprel = Some(fix(value)),
                Ok(DT_PLTRELSZ) => pltrelsz = value as usize,
                Ok(DT_RELA) => rela = Some(fix(value)),
                Ok(DT_RELASZ) => relasz = value as usize,
                _ => {}
            }
            entry = entry.add(1);
        }

        Some(DynamicView {
            bias,
            strtab: strtab?,
            strsz,
            symtab: symtab?,
            hash: gnu_hash.map(Hash::Gnu).or(sysv_hash.map(Hash::Sysv)),
            jmprel: jmprel.map(|address| (address, pltrelsz)),
            rela: rela.map(|address| (address, relasz)),
        })
    }

    fn symbol(&self, index: u32) -> &Sym64<LittleEndian> {
        // SAFETY: indices come from the module's own hash table or relocations.
        unsafe { &*(self.symtab as *const Sym64<LittleEndian>).add(index as usize) }
    }

    fn name(&self, symbol: &Sym64<LittleEndian>) -> Option<&CStr> {
        let offset = symbol.st_name.get(LE) as usize;
        if self.strsz != 0 && offset >= self.strsz {
            return None;
        }
        // SAFETY: offsets within `DT_STRSZ` point at NUL terminated strings.
        Some(unsafe { CStr::from_ptr((self.strtab + offset) as *const libc::c_char) })
    }

    fn defined(&self, index: u32, name: &[u8]) -> Option<SymbolEntry> {
        let symbol = self.symbol(index);
        if self.name(symbol)?.to_bytes() != name {
            return None;
        }
        if symbol.st_shndx.get(LE) == SHN_UNDEF || symbol.st_value.get(LE) == 0 {
            return None;
        }
        let kind = symbol.st_info & 0xf;
        if !matches!(kind, STT_FUNC | STT_GNU_IFUNC | STT_OBJECT | STT_NOTYPE) {
            return None;
        }
        Some(SymbolEntry {
            address: self.bias + symbol.st_value.get(LE) as usize,
            size: symbol.st_size.get(LE) as usize,
            indirect: kind == STT_GNU_IFUNC,
        })
    }

    /// Look up a symbol this module defines.
    pub fn lookup(&self, name: &str) -> Option<SymbolEntry> {
        match self.hash {
            Some(Hash::Gnu(table)) => unsafe { self.gnu_lookup(table, name.as_bytes()) },
            Some(Hash::Sysv(table)) => unsafe { self.sysv_lookup(table, name.as_bytes()) },
            None => None,
        }
    }

    unsafe fn gnu_lookup(&self, table: usize, name: &[u8]) -> Option<SymbolEntry> {
        let header = table as *const u32;
        let nbuckets = *header;
        let symoffset = *header.add(1);
        let bloom_size = *header.add(2) as usize;
        let bloom_shift = *header.add(3);
        if nbuckets == 0 || bloom_size == 0 {
            return None;
        }
        let bloom = header.add(4) as *const u64;
        let buckets = bloom.add(bloom_size) as *const u32;
        let chain = buckets.add(nbuckets as usize);

        let hash = gnu_hash(name);
        let word = *bloom.add((hash as usize / 64) % bloom_size);
        let mask = (1u64 << (hash % 64)) | (1u64 << ((hash >> bloom_shift) % 64));
        if word & mask != mask {
            return None;
        }

        let mut index = *buckets.add((hash % nbuckets) as usize);
        if index < symoffset {
            return None;
        }
        loop {
            let chain_hash = *chain.add((index - symoffset) as usize);
            if (hash | 1) == (chain_hash | 1) {
                if let Some(entry) = self.defined(index, name) {
                    return Some(entry);
                }
            }
            if chain_hash & 1 != 0 {
                return None;
            }
            index += 1;
        }
    }

    unsafe fn sysv_lookup(&self, table: usize, name: &[u8]) -> Option<SymbolEntry> {
        let header = table as *const u32;
        let nbuckets = *header;
        let nchain = *header.add(1);
        if nbuckets == 0 {
            return None;
        }
        let buckets = header.add(2);
        let chain = buckets.add(nbuckets as usize);

        let mut index = *buckets.add((sysv_hash(name) % nbuckets) as usize);
        while index != 0 && index < nchain {
            if let Some(entry) = self.defined(index, name) {
                return Some(entry);
            }
            index = *chain.add(index as usize);
        }
        None
    }

    /// Every slot in `DT_JMPREL` and `DT_RELA` bound to `name`.
    pub fn slots_for(&self, name: &str) -> Vec<RelocatedSlot> {
        let mut slots = Vec::new();
        for (table, plt) in [(self.jmprel, true), (self.rela, false)] {
            let Some((start, size)) = table else {
                continue;
            };
            let count = size / std::mem::size_of::<Rela64<LittleEndian>>();
            let relocations = start as *const Rela64<LittleEndian>;
            for i in 0..count {
                // SAFETY: `count` entries fit in the table size reported by the loader.
                let rela = unsafe { &*relocations.add(i) };
                let info = rela.r_info.get(LE);
                let index = (info >> 32) as u32;
                if index == 0 {
                    continue;
                }
                let Some(kind) = slot_kind((info & 0xffff_ffff) as u32, plt) else {
                    continue;
                };
                let symbol = self.symbol(index);
                if self.name(symbol).map(CStr::to_bytes) == Some(name.as_bytes()) {
                    slots.push(RelocatedSlot {
                        address: self.bias + rela.r_offset.get(LE) as usize,
                        kind,
                    });
                }
            }
        }
        slots
    }
}

#[cfg(target_arch = "x86_64")]
fn slot_kind(r_type: u32, plt: bool) -> Option<SlotKind> {
    match (r_type, plt) {
        (R_X86_64_JUMP_SLOT, true) => Some(SlotKind::JumpSlot),
        (R_X86_64_GLOB_DAT, false) => Some(SlotKind::GlobalData),
        (R_X86_64_64, false) => Some(SlotKind::Absolute),
        _ => None,
    }
}

#[cfg(target_arch = "aarch64")]
fn slot_kind(r_type: u32, plt: bool) -> Option<SlotKind> {
    match (r_type, plt) {
        (R_AARCH64_JUMP_SLOT, true) => Some(SlotKind::JumpSlot),
        (R_AARCH64_GLOB_DAT, false) => Some(SlotKind::GlobalData),
        (R_AARCH64_ABS64, false) => Some(SlotKind::Absolute),
        _ => None,
    }
}

fn gnu_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(5381u32, |h, &c| h.wrapping_mul(33).wrapping_add(u32::from(c)))
}

fn sysv_hash(name: &[u8]) -> u32 {
    name.iter().fold(0u32, |h, &c| {
        let h = (h << 4).wrapping_add(u32::from(c));
        let high = h & 0xf000_0000;
        (h ^ (high >> 24)) & !high
    })
}
