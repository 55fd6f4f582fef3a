//! `sigaction` plumbing shared by the fault handler and the stack dump handler.

use std::io;

use log::debug;

use crate::error::CaptureError;

/// Size of the alternate signal stack installed for threads that have none, or a small one.
pub const ALT_STACK_SIZE: usize = 64 * 1024;

pub type Action = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install `action` for `signal` and return the action it replaced.
pub fn install(
    signal: libc::c_int,
    action: Action,
    flags: libc::c_int,
) -> Result<libc::sigaction, CaptureError> {
    // SAFETY: both structs are fully initialized before use.
    unsafe {
        let mut new: libc::sigaction = std::mem::zeroed();
        new.sa_sigaction = action as usize;
        new.sa_flags = flags | libc::SA_SIGINFO;
        libc::sigemptyset(&mut new.sa_mask);
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, &new, &mut old) != 0 {
            return Err(CaptureError::SignalInstall {
                signal,
                source: io::Error::last_os_error(),
            });
        }
        Ok(old)
    }
}

/// Hand the signal to `previous`, then let the default action run.
///
/// # Safety
///
/// Must be called from the handler of `signal` with the arguments it received.
pub unsafe fn chain(
    signal: libc::c_int,
    previous: Option<&libc::sigaction>,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if let Some(previous) = previous {
        let handler = previous.sa_sigaction;
        if handler != libc::SIG_DFL && handler != libc::SIG_IGN {
            if previous.sa_flags & libc::SA_SIGINFO != 0 {
                let action: Action = std::mem::transmute(handler);
                action(signal, info, context);
            } else {
                let action: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
                action(signal);
            }
        }
    }
    libc::signal(signal, libc::SIG_DFL);
    libc::raise(signal);
}

/// Make sure the calling thread has an alternate signal stack of at least
/// [`ALT_STACK_SIZE`] bytes.
///
/// Stacks installed here are never freed.
pub fn ensure_alt_stack() -> io::Result<()> {
    // SAFETY: plain syscalls on a zeroed struct and a fresh mapping.
    unsafe {
        let mut current: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(std::ptr::null(), &mut current) != 0 {
            return Err(io::Error::last_os_error());
        }
        if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALT_STACK_SIZE {
            return Ok(());
        }
        let guard = crate::memory::page_size();
        let base = libc::mmap(
            std::ptr::null_mut(),
            ALT_STACK_SIZE + guard,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // Guard page at the low end, stacks grow down.
        libc::mprotect(base, guard, libc::PROT_NONE);
        let stack = libc::stack_t {
            ss_sp: (base as usize + guard) as *mut libc::c_void,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&stack, std::ptr::null_mut()) != 0 {
            let err = io::Error::last_os_error();
            libc::munmap(base, ALT_STACK_SIZE + guard);
            return Err(err);
        }
        debug!(
            "alternate signal stack at {:#x} for thread {}",
            stack.ss_sp as usize,
            thread_id()
        );
    }
    Ok(())
}

/// Kernel id of the calling thread. Async-signal-safe.
pub fn thread_id() -> u32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Interrupted program counter and stack pointer.
///
/// # Safety
///
/// `context` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
#[cfg(target_arch = "x86_64")]
pub unsafe fn registers(context: *const libc::c_void) -> (usize, usize) {
    let context = &*(context as *const libc::ucontext_t);
    let gregs = &context.uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RSP as usize] as usize,
    )
}

/// Interrupted program counter and stack pointer.
///
/// # Safety
///
/// `context` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
#[cfg(target_arch = "aarch64")]
pub unsafe fn registers(context: *const libc::c_void) -> (usize, usize) {
    let context = &*(context as *const libc::ucontext_t);
    (
        context.uc_mcontext.pc as usize,
        context.uc_mcontext.sp as usize,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alt_stack_is_installed_once() {
        std::thread::spawn(|| {
            ensure_alt_stack().unwrap();
            let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
            assert_eq!(unsafe { libc::sigaltstack(std::ptr::null(), &mut current) }, 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= ALT_STACK_SIZE);
            let installed = current.ss_sp;
            ensure_alt_stack().unwrap();
            assert_eq!(unsafe { libc::sigaltstack(std::ptr::null(), &mut current) }, 0);
            assert_eq!(current.ss_sp, installed);
        })
        .join()
        .unwrap();
    }
}
