//! Inline hooks, alone and nested with indirection-table hooks.
//!
//! Environments that forbid writable code report an environment limitation; the tests
//! accept that and stop early.

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};

use perf_probe::resolver::{self, LibraryMatcher};
use perf_probe::{HookEngine, HookError, HookHandle, HookSpec, Strategy};

type MixFn = extern "C" fn(u64, u64) -> u64;

#[inline(never)]
extern "C" fn mix(a: u64, b: u64) -> u64 {
    let x = a.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let y = b.rotate_left(17) ^ x;
    y.wrapping_add(x >> 7)
}

static ORIGINAL_MIX: AtomicUsize = AtomicUsize::new(0);

extern "C" fn mix_plus_one(a: u64, b: u64) -> u64 {
    let original: MixFn = unsafe { std::mem::transmute(ORIGINAL_MIX.load(Ordering::SeqCst)) };
    original(a, b).wrapping_add(1)
}

fn call_mix(a: u64, b: u64) -> u64 {
    let function: MixFn = black_box(mix);
    function(a, b)
}

fn entry_bytes(address: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, 16) }.to_vec()
}

fn installed_or_skip(result: Result<HookHandle, HookError>) -> Option<HookHandle> {
    match result {
        Ok(handle) => Some(handle),
        Err(err) if err.is_environment_limitation() => {
            eprintln!("inline hooks unavailable here: {}", err);
            None
        }
        Err(err) => panic!("install failed: {}", err),
    }
}

#[test]
fn inline_hook_redirects_and_restores_bytes() {
    let engine = HookEngine::global();
    let expected = call_mix(3, 4);
    let entry = mix as usize;
    let before = entry_bytes(entry);

    let Some(handle) = installed_or_skip(engine.install(
        HookSpec::inline_at("mix", entry).store_original(&ORIGINAL_MIX),
        mix_plus_one as usize,
    )) else {
        return;
    };
    assert_eq!(handle.strategy(), Strategy::Inline);
    assert_ne!(entry_bytes(entry), before);
    assert_eq!(call_mix(3, 4), expected.wrapping_add(1));

    let original: MixFn = unsafe { handle.original_fn() };
    assert_eq!(original(3, 4), expected);
    assert_eq!(handle.original(), ORIGINAL_MIX.load(Ordering::SeqCst));

    let again = engine.install(HookSpec::inline_at("mix", entry), mix_plus_one as usize);
    assert!(matches!(again, Err(HookError::AlreadyInstalled { .. })));

    engine.uninstall(&handle).unwrap();
    assert_eq!(entry_bytes(entry), before);
    assert_eq!(call_mix(3, 4), expected);
    // The trampoline stays usable after uninstall.
    assert_eq!(original(3, 4), expected);
}

static ORIGINAL_INLINE: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_SLOT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn getppid_inline() -> libc::pid_t {
    let original: extern "C" fn() -> libc::pid_t =
        unsafe { std::mem::transmute(ORIGINAL_INLINE.load(Ordering::SeqCst)) };
    original() + 1
}

extern "C" fn getppid_slot() -> libc::pid_t {
    let original: extern "C" fn() -> libc::pid_t =
        unsafe { std::mem::transmute(ORIGINAL_SLOT.load(Ordering::SeqCst)) };
    original() + 1000
}

#[test]
fn nested_hooks_reach_the_true_original() {
    let _ = pretty_env_logger::try_init();
    let engine = HookEngine::global();
    let libc_getppid = resolver::resolve(&LibraryMatcher::Any, "getppid")
        .unwrap()
        .address;
    let direct: extern "C" fn() -> libc::pid_t = unsafe { std::mem::transmute(libc_getppid) };
    let real = direct();

    let slot = engine
        .install(
            HookSpec::indirection(LibraryMatcher::MainProgram, "getppid")
                .store_original(&ORIGINAL_SLOT),
            getppid_slot as usize,
        )
        .unwrap();
    assert_eq!(unsafe { libc::getppid() }, real + 1000);

    let Some(inline) = installed_or_skip(engine.install(
        HookSpec::inline(LibraryMatcher::Contains("libc.so".to_string()), "getppid")
            .store_original(&ORIGINAL_INLINE),
        getppid_inline as usize,
    )) else {
        engine.uninstall(&slot).unwrap();
        return;
    };
    // Both handlers now reach libc through the trampoline.
    assert_eq!(
        ORIGINAL_SLOT.load(Ordering::SeqCst),
        ORIGINAL_INLINE.load(Ordering::SeqCst)
    );
    assert_eq!(slot.original(), inline.original());
    assert_eq!(unsafe { libc::getppid() }, real + 1000);
    assert_eq!(black_box(direct)(), real + 1);

    engine.uninstall(&inline).unwrap();
    assert_eq!(ORIGINAL_SLOT.load(Ordering::SeqCst), libc_getppid);
    assert_eq!(unsafe { libc::getppid() }, real + 1000);
    assert_eq!(black_box(direct)(), real);

    engine.uninstall(&slot).unwrap();
    assert_eq!(unsafe { libc::getppid() }, real);
}

#[cfg(target_arch = "x86_64")]
#[inline(never)]
extern "C" fn too_short() {}

#[cfg(target_arch = "x86_64")]
#[test]
fn too_short_function_is_left_alone() {
    let entry = black_box(too_short as extern "C" fn()) as usize;
    let before = entry_bytes(entry);
    let err = HookEngine::global()
        .install(HookSpec::inline_at("too_short", entry), mix_plus_one as usize)
        .unwrap_err();
    assert!(err.is_environment_limitation(), "{}", err);
    assert_eq!(entry_bytes(entry), before);
    too_short();
}

#[cfg(target_arch = "x86_64")]
extern "C" fn getpgrp_fixed() -> libc::pid_t {
    4242
}

#[cfg(target_arch = "x86_64")]
#[test]
fn unpatchable_function_falls_back_to_the_indirection_table() {
    let runtime = perf_probe::init().unwrap();
    let entry = black_box(too_short as extern "C" fn()) as usize;
    let before = entry_bytes(entry);
    let real = unsafe { libc::getpgrp() };

    let handle = runtime
        .hook_with_fallback(
            HookSpec::inline_at("too_short", entry),
            HookSpec::indirection(LibraryMatcher::MainProgram, "getpgrp"),
            getpgrp_fixed as usize,
        )
        .unwrap();
    assert_eq!(handle.strategy(), Strategy::Indirection);
    assert_eq!(handle.symbol(), "getpgrp");
    assert_eq!(entry_bytes(entry), before);
    assert_eq!(unsafe { libc::getpgrp() }, 4242);

    runtime.unhook(&handle).unwrap();
    assert_eq!(unsafe { libc::getpgrp() }, real);
    too_short();
}
