//! Inline hooks
//!
//! The entry of the target is overwritten with a branch to the handler. The instructions
//! the branch displaces are relocated into a trampoline that ends with a branch back, so
//! the trampoline behaves like the unhooked function.
//!
//! Patching is ordered so that no thread ever executes a half written branch: the first
//! instruction is replaced with a branch to itself in a single atomic store, then the rest
//! of the patch is written, then the head is replaced with its final bytes in another
//! atomic store. Threads that arrive in between spin on the self branch for a moment.
//!
//! This only covers threads that enter at the entry point. A thread that was preempted
//! inside the displaced range, after the first displaced instruction, resumes in the
//! middle of the new bytes. Nothing here suspends threads, so installing or removing an
//! inline hook while another thread is inside the first few instructions of the target
//! is not safe.
//!
//! Trampoline pages are never unmapped, a thread may still run inside one after the hook
//! is removed.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as arch;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

use std::sync::atomic::{compiler_fence, Ordering};

use log::debug;

use super::Interception;
use crate::error::HookError;
use crate::memory::{self, WritableWindow};

/// Code generated for one hook, not yet visible to callers.
pub(super) struct Layout {
    /// Bytes written over the entry.
    pub patch: Vec<u8>,
    /// Start of the relocated prologue.
    pub trampoline: usize,
}

pub(super) struct Prepared {
    name: String,
    entry: usize,
    layout: Layout,
}

/// Build the trampoline for the function at `entry`.
pub(super) fn prepare(name: &str, entry: usize, handler: usize) -> Result<Prepared, HookError> {
    let layout = arch::prepare(name, entry, handler)?;
    debug!(
        "{}: {} byte patch at {:#x}, trampoline {:#x}",
        name,
        layout.patch.len(),
        entry,
        layout.trampoline
    );
    Ok(Prepared {
        name: name.to_string(),
        entry,
        layout,
    })
}

impl Prepared {
    pub(super) fn trampoline(&self) -> usize {
        self.layout.trampoline
    }

    /// Redirect the entry.
    pub(super) fn commit(self) -> Result<InlinePatch, HookError> {
        let len = self.layout.patch.len();
        // SAFETY: the prologue was decoded from this range, so it is mapped and readable.
        let saved = unsafe { std::slice::from_raw_parts(self.entry as *const u8, len) }.to_vec();
        write_code(self.entry, &self.layout.patch)?;
        Ok(InlinePatch {
            name: self.name,
            entry: self.entry,
            saved,
            patch: self.layout.patch,
            trampoline: self.layout.trampoline,
        })
    }
}

pub(super) struct InlinePatch {
    name: String,
    entry: usize,
    saved: Vec<u8>,
    patch: Vec<u8>,
    trampoline: usize,
}

impl Interception for InlinePatch {
    fn original(&self) -> usize {
        self.trampoline
    }

    fn remove(&mut self) -> Result<(), HookError> {
        // SAFETY: the patched range stays mapped for the life of the process.
        let current = unsafe { std::slice::from_raw_parts(self.entry as *const u8, self.patch.len()) };
        if current != self.patch.as_slice() {
            return Err(HookError::UnsupportedInstructionPattern {
                symbol: self.name.clone(),
                address: self.entry,
                reason: "entry was modified after the hook was installed".to_string(),
            });
        }
        write_code(self.entry, &self.saved)
    }
}

/// Replace the code at `entry` with `bytes` without exposing a partial write.
fn write_code(entry: usize, bytes: &[u8]) -> Result<(), HookError> {
    let head = arch::PARK.len().min(bytes.len());
    let _window = WritableWindow::open(entry, bytes.len())?;
    // SAFETY: the window keeps the range writable; the head store is atomic.
    unsafe {
        if bytes.len() > head {
            arch::store_head(entry, arch::PARK);
            memory::flush_icache(entry, head);
            compiler_fence(Ordering::SeqCst);
            std::ptr::copy_nonoverlapping(
                bytes[head..].as_ptr(),
                (entry + head) as *mut u8,
                bytes.len() - head,
            );
            memory::flush_icache(entry + head, bytes.len() - head);
            compiler_fence(Ordering::SeqCst);
        }
        arch::store_head(entry, &bytes[..head]);
    }
    memory::flush_icache(entry, bytes.len());
    Ok(())
}

fn unsupported(name: &str, entry: usize, reason: impl Into<String>) -> HookError {
    HookError::UnsupportedInstructionPattern {
        symbol: name.to_string(),
        address: entry,
        reason: reason.into(),
    }
}

/// Readable bytes from `entry` to the end of its mapping, at most `limit`.
fn readable(name: &str, entry: usize, limit: usize) -> Result<&'static [u8], HookError> {
    let region = memory::region_of(entry)?
        .filter(|region| region.protection.read)
        .ok_or_else(|| unsupported(name, entry, "entry is not mapped readable"))?;
    let len = (region.range.end - entry).min(limit);
    // SAFETY: the range lies inside a readable mapping of loaded code.
    Ok(unsafe { std::slice::from_raw_parts(entry as *const u8, len) })
}

/// Map a page for a trampoline, close to `entry` if possible.
///
/// Returns the page and whether it is within `reach` of `entry`.
fn trampoline_page(entry: usize, reach: usize) -> Result<(usize, bool), HookError> {
    let len = memory::page_size();
    match memory::map_near(entry, len, reach) {
        Ok(page) => Ok((page, true)),
        Err(err) => {
            debug!("no trampoline page near {:#x}: {}", entry, err);
            Ok((memory::map_anywhere(len)?, false))
        }
    }
}

/// Copy `code` into the trampoline page and make it executable.
fn seal(page: usize, offset: usize, code: &[u8]) -> Result<(), HookError> {
    // SAFETY: the page was mapped read-write by `trampoline_page` and is not yet in use.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), (page + offset) as *mut u8, code.len());
    }
    memory::protect(
        page,
        memory::page_size(),
        memory::Protection {
            read: true,
            write: false,
            exec: true,
        },
    )
    .map_err(|source| HookError::PermissionDenied {
        address: page,
        source,
    })?;
    memory::flush_icache(page, memory::page_size());
    Ok(())
}

/// Give back a trampoline page nothing points at yet.
fn discard(page: usize) {
    // SAFETY: the page was never published.
    unsafe {
        libc::munmap(page as *mut libc::c_void, memory::page_size());
    }
}
