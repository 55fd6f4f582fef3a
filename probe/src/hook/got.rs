//! Indirection-table hooks
//!
//! A slot is a pointer-sized relocation target in a caller module. It is swapped with a
//! single atomic store, so a concurrent caller loads either the old or the new pointer.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use super::Interception;
use crate::elf::{LoadedModule, RelocatedSlot};
use crate::error::HookError;
use crate::memory::WritableWindow;

pub(super) struct SlotPatch {
    /// Slot address and the value it held before the hook.
    slots: Vec<(usize, usize)>,
    handler: usize,
    original: usize,
}

impl SlotPatch {
    /// The function calls through `slots` currently reach.
    ///
    /// A jump slot that was never called still points at the module's own PLT; the loader
    /// would bind it to `implementation`.
    pub(super) fn target_of(
        module: &LoadedModule,
        slots: &[RelocatedSlot],
        implementation: Option<usize>,
    ) -> usize {
        let current = slots
            .iter()
            .map(|slot| unsafe { slot_ref(slot.address) }.load(Ordering::SeqCst))
            .find(|value| *value != 0)
            .unwrap_or(0);
        match implementation {
            Some(implementation) if current == 0 || module.contains(current) => implementation,
            _ => current,
        }
    }

    /// Point every slot at `handler`. `original` must already be published.
    pub(super) fn apply(
        slots: &[RelocatedSlot],
        handler: usize,
        original: usize,
    ) -> Result<Self, HookError> {
        let mut patch = SlotPatch {
            slots: Vec::with_capacity(slots.len()),
            handler,
            original,
        };
        for slot in slots {
            if slot.address % std::mem::align_of::<usize>() != 0 {
                let _ = patch.remove();
                return Err(HookError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("misaligned {} slot at {:#x}", slot.kind, slot.address),
                )));
            }
            match swap(slot.address, handler) {
                Ok(previous) => patch.slots.push((slot.address, previous)),
                Err(err) => {
                    let _ = patch.remove();
                    return Err(err);
                }
            }
        }
        Ok(patch)
    }
}

impl Interception for SlotPatch {
    fn original(&self) -> usize {
        self.original
    }

    fn remove(&mut self) -> Result<(), HookError> {
        while let Some((address, previous)) = self.slots.pop() {
            let _window = match WritableWindow::open(address, std::mem::size_of::<usize>()) {
                Ok(window) => window,
                Err(err) => {
                    self.slots.push((address, previous));
                    return Err(err);
                }
            };
            // SAFETY: alignment was checked when the slot was patched.
            let slot = unsafe { slot_ref(address) };
            if let Err(found) =
                slot.compare_exchange(self.handler, previous, Ordering::SeqCst, Ordering::SeqCst)
            {
                warn!(
                    "slot {:#x} was changed to {:#x} behind the hook, leaving it",
                    address, found
                );
            }
        }
        Ok(())
    }
}

fn swap(address: usize, value: usize) -> Result<usize, HookError> {
    let _window = WritableWindow::open(address, std::mem::size_of::<usize>())?;
    // SAFETY: the slot is an aligned pointer inside a mapped relocation table.
    Ok(unsafe { slot_ref(address) }.swap(value, Ordering::SeqCst))
}

/// # Safety
///
/// `address` must be an aligned, mapped, pointer-sized slot.
unsafe fn slot_ref<'a>(address: usize) -> &'a AtomicUsize {
    &*(address as *const AtomicUsize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::SlotKind;

    static TABLE: [AtomicUsize; 2] = [AtomicUsize::new(0x1000), AtomicUsize::new(0x2000)];

    fn slots() -> Vec<RelocatedSlot> {
        TABLE
            .iter()
            .map(|slot| RelocatedSlot {
                address: slot as *const AtomicUsize as usize,
                kind: SlotKind::GlobalData,
            })
            .collect()
    }

    #[test]
    fn test_apply_and_remove_restores_each_slot() {
        let mut patch = SlotPatch::apply(&slots(), 0x5000, 0x1000).unwrap();
        assert_eq!(TABLE[0].load(Ordering::SeqCst), 0x5000);
        assert_eq!(TABLE[1].load(Ordering::SeqCst), 0x5000);
        assert_eq!(patch.original(), 0x1000);

        patch.remove().unwrap();
        assert_eq!(TABLE[0].load(Ordering::SeqCst), 0x1000);
        assert_eq!(TABLE[1].load(Ordering::SeqCst), 0x2000);
        assert_eq!(SlotKind::GlobalData.to_string(), "GLOB_DAT");
    }
}
