//! Page protections and executable memory
//!
//! Patching code or relocation tables needs pages that are normally read-only to be
//! writable for a short time. [`WritableWindow`] does that with reference counting per page,
//! so two hooks whose targets share a page never restore the protection under each other.

use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{trace, warn};

use crate::error::HookError;

/// Access rights of a mapping, as in the second column of `/proc/self/maps`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegion {
    pub range: Range<usize>,
    pub protection: Protection,
    pub path: Option<String>,
}

impl MapRegion {
    pub fn contains(&self, address: usize) -> bool {
        self.range.contains(&address)
    }
}

/// Parse the text of a `maps` file; malformed lines are skipped.
pub fn parse_maps(text: &str) -> Vec<MapRegion> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapRegion> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = fields.next()?.as_bytes();
    if perms.len() < 3 {
        return None;
    }
    // offset, device, inode
    let path = fields.nth(3).map(str::to_string);
    Some(MapRegion {
        range: start..end,
        protection: Protection {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            exec: perms[2] == b'x',
        },
        path,
    })
}

pub fn read_maps() -> io::Result<Vec<MapRegion>> {
    Ok(parse_maps(&std::fs::read_to_string("/proc/self/maps")?))
}

/// The mapping that contains `address`, if any.
pub fn region_of(address: usize) -> io::Result<Option<MapRegion>> {
    Ok(read_maps()?
        .into_iter()
        .find(|region| region.contains(address)))
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

fn page_range(address: usize, len: usize) -> Range<usize> {
    let page = page_size();
    let start = address & !(page - 1);
    let end = (address + len.max(1) + page - 1) & !(page - 1);
    start..end
}

struct PageState {
    users: usize,
    original: Protection,
}

lazy_static! {
    static ref OPEN_PAGES: Mutex<HashMap<usize, PageState>> = Mutex::new(HashMap::new());
}

/// Makes a byte range writable until dropped, then restores the recorded protection.
#[derive(Debug)]
pub struct WritableWindow {
    pages: Range<usize>,
}

impl WritableWindow {
    pub fn open(address: usize, len: usize) -> Result<Self, HookError> {
        let pages = page_range(address, len);
        let page = page_size();
        let regions = read_maps()?;
        let mut open = OPEN_PAGES.lock().unwrap_or_else(|e| e.into_inner());

        let mut opened = Vec::new();
        for start in pages.clone().step_by(page) {
            if let Some(state) = open.get_mut(&start) {
                state.users += 1;
                opened.push(start);
                continue;
            }
            let original = regions
                .iter()
                .find(|region| region.contains(start))
                .map(|region| region.protection)
                .ok_or_else(|| HookError::PermissionDenied {
                    address: start,
                    source: io::Error::new(io::ErrorKind::NotFound, "page is not mapped"),
                });
            let result = original.and_then(|original| {
                let writable = Protection {
                    write: true,
                    read: true,
                    ..original
                };
                protect(start, page, writable).map_err(|source| HookError::PermissionDenied {
                    address: start,
                    source,
                })?;
                Ok(original)
            });
            match result {
                Ok(original) => {
                    trace!("page {:#x} writable, was {:?}", start, original);
                    open.insert(start, PageState { users: 1, original });
                    opened.push(start);
                }
                Err(err) => {
                    for start in opened {
                        release(&mut open, start, page);
                    }
                    return Err(err);
                }
            }
        }
        Ok(WritableWindow { pages })
    }
}

impl Drop for WritableWindow {
    fn drop(&mut self) {
        let page = page_size();
        let mut open = OPEN_PAGES.lock().unwrap_or_else(|e| e.into_inner());
        for start in self.pages.clone().step_by(page) {
            release(&mut open, start, page);
        }
    }
}

fn release(open: &mut HashMap<usize, PageState>, start: usize, page: usize) {
    let Some(state) = open.get_mut(&start) else {
        return;
    };
    state.users -= 1;
    if state.users == 0 {
        let original = state.original;
        open.remove(&start);
        if let Err(err) = protect(start, page, original) {
            warn!("failed to restore protection of page {:#x}: {}", start, err);
        }
    }
}

pub fn protect(address: usize, len: usize, protection: Protection) -> io::Result<()> {
    let pages = page_range(address, len);
    // SAFETY: only changes access rights of whole pages inside existing mappings.
    let rc = unsafe {
        libc::mprotect(
            pages.start as *mut libc::c_void,
            pages.end - pages.start,
            protection.to_prot(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Map `len` read-write bytes within `reach` bytes of `hint`.
///
/// Fails with `NotFound` when the address space around `hint` has no gap large enough.
pub fn map_near(hint: usize, len: usize, reach: usize) -> io::Result<usize> {
    let page = page_size();
    let len = (len + page - 1) & !(page - 1);
    let low = hint.saturating_sub(reach).max(0x10000);
    let high = hint.saturating_add(reach);

    let regions = read_maps()?;
    let mut candidates = Vec::new();
    let mut previous_end = low;
    for region in regions.iter().chain(std::iter::once(&MapRegion {
        range: high..high,
        protection: Protection::default(),
        path: None,
    })) {
        let gap = previous_end.max(low)..region.range.start.min(high);
        previous_end = previous_end.max(region.range.end);
        if gap.start >= gap.end || gap.end - gap.start < len {
            continue;
        }
        let gap = (gap.start + page - 1) & !(page - 1)..gap.end & !(page - 1);
        if gap.end < gap.start + len {
            continue;
        }
        let candidate = if gap.end <= hint {
            gap.end - len
        } else if gap.start >= hint {
            gap.start
        } else {
            hint & !(page - 1)
        };
        if candidate.abs_diff(hint) <= reach && (candidate + len).abs_diff(hint) <= reach {
            candidates.push(candidate);
        }
    }
    candidates.sort_by_key(|candidate| candidate.abs_diff(hint));

    for candidate in candidates {
        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
        let mapped = unsafe {
            libc::mmap(
                candidate as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            continue;
        }
        if mapped as usize == candidate {
            return Ok(candidate);
        }
        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        // SAFETY: unmapping the region that was just mapped.
        unsafe { libc::munmap(mapped, len) };
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no free pages within {:#x} bytes of {:#x}", reach, hint),
    ))
}

/// Map `len` read-write bytes anywhere.
pub fn map_anywhere(len: usize) -> io::Result<usize> {
    // SAFETY: a fresh anonymous private mapping.
    let mapped = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(mapped as usize)
    }
}

/// Make freshly written code visible to instruction fetch.
#[cfg(target_arch = "x86_64")]
pub fn flush_icache(_start: usize, _len: usize) {
    // Instruction and data caches are coherent.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Make freshly written code visible to instruction fetch.
#[cfg(target_arch = "aarch64")]
pub fn flush_icache(start: usize, len: usize) {
    use std::arch::asm;

    let end = start + len;
    let ctr: u64;
    // SAFETY: cache maintenance by virtual address on mapped memory.
    unsafe {
        asm!("mrs {}, ctr_el0", out(reg) ctr);
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);

        let mut line = start & !(dline - 1);
        while line < end {
            asm!("dc cvau, {}", in(reg) line);
            line += dline;
        }
        asm!("dsb ish");

        let mut line = start & !(iline - 1);
        while line < end {
            asm!("ic ivau, {}", in(reg) line);
            line += iline;
        }
        asm!("dsb ish", "isb");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c6a00000-55d0c6a2a000 r--p 00000000 fd:01 1835113                    /usr/bin/demo
55d0c6a2a000-55d0c6b0e000 r-xp 0002a000 fd:01 1835113                    /usr/bin/demo
7f1d2c000000-7f1d2c021000 rw-p 00000000 00:00 0
not a mapping
7ffd5a9e1000-7ffd5aa02000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn test_parse_maps() {
        let regions = parse_maps(MAPS);
        assert_eq!(regions.len(), 4);
        assert_eq!(regions[1].range, 0x55d0c6a2a000..0x55d0c6b0e000);
        assert_eq!(
            regions[1].protection,
            Protection {
                read: true,
                write: false,
                exec: true
            }
        );
        assert_eq!(regions[1].path.as_deref(), Some("/usr/bin/demo"));
        assert_eq!(regions[2].path, None);
        assert_eq!(regions[3].path.as_deref(), Some("[stack]"));
        assert!(regions[0].contains(0x55d0c6a29fff));
        assert!(!regions[0].contains(0x55d0c6a2a000));
    }

    #[test]
    fn test_page_range() {
        let page = page_size();
        assert_eq!(page_range(page + 1, 1), page..2 * page);
        assert_eq!(page_range(2 * page - 4, 8), page..3 * page);
    }

    fn protection_of(address: usize) -> Protection {
        region_of(address).unwrap().unwrap().protection
    }

    #[test]
    fn test_writable_window_restores_protection() {
        let page = page_size();
        let base = map_anywhere(2 * page).unwrap();
        let read_only = Protection {
            read: true,
            ..Protection::default()
        };
        protect(base, 2 * page, read_only).unwrap();

        let outer = WritableWindow::open(base + 8, 8).unwrap();
        let inner = WritableWindow::open(base + 16, 8).unwrap();
        assert!(protection_of(base).write);
        drop(outer);
        // Still held by the inner window.
        assert!(protection_of(base).write);
        unsafe { (base as *mut u64).add(2).write(42) };
        drop(inner);
        assert_eq!(protection_of(base), read_only);
        assert_eq!(unsafe { (base as *const u64).add(2).read() }, 42);
    }

    #[test]
    fn test_unmapped_window_is_denied() {
        // Below vm.mmap_min_addr, never mapped.
        let err = WritableWindow::open(0x1000, 8).unwrap_err();
        assert!(matches!(err, HookError::PermissionDenied { .. }));
    }

    #[test]
    fn test_map_near() {
        let hint = test_map_near as usize;
        let reach = 1 << 31;
        let near = map_near(hint, 64, reach).unwrap();
        assert!(near.abs_diff(hint) < reach);
        assert_eq!(near % page_size(), 0);
    }
}
