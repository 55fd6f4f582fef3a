use perf_probe::error::ResolveError;
use perf_probe::resolver::{self, LibraryMatcher};

fn dlsym(name: &std::ffi::CStr) -> usize {
    unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) as usize }
}

#[test]
fn resolves_like_the_dynamic_loader() {
    let resolved = resolver::resolve(&LibraryMatcher::Any, "getppid").unwrap();
    assert_eq!(resolved.address, dlsym(c"getppid"));
    assert!(resolved.module.contains("libc"), "{}", resolved.module);

    let module = resolver::module_of(resolved.address).unwrap();
    assert_eq!(module.path, resolved.module);
    assert!(!module.is_main_program());
}

#[test]
fn library_filter_restricts_the_search() {
    let found = resolver::resolve(&LibraryMatcher::Contains("libc".to_string()), "getpgrp");
    assert!(found.is_ok());

    let err = resolver::resolve(&LibraryMatcher::MainProgram, "getpgrp").unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }), "{}", err);
}

#[test]
fn missing_symbol_is_not_found() {
    let err = resolver::resolve(&LibraryMatcher::Any, "perf_probe_no_such_symbol").unwrap_err();
    assert_eq!(
        err,
        ResolveError::NotFound {
            library: "*".to_string(),
            symbol: "perf_probe_no_such_symbol".to_string(),
        }
    );
}

#[test]
fn strict_resolution_of_a_unique_symbol() {
    let strict = resolver::resolve_strict(&LibraryMatcher::Any, "getppid").unwrap();
    let first = resolver::resolve(&LibraryMatcher::Any, "getppid").unwrap();
    assert_eq!(strict, first);
}

#[test]
fn main_program_is_first() {
    let modules = resolver::matching_modules(&LibraryMatcher::MainProgram);
    assert_eq!(modules.len(), 1);
    assert!(modules[0].is_main_program());
    let exe = std::env::current_exe().unwrap();
    assert_eq!(
        std::fs::canonicalize(&modules[0].path).unwrap(),
        std::fs::canonicalize(exe).unwrap()
    );
    // Code of this test lives in the main program.
    let here = resolver::module_of(main_program_is_first as usize).unwrap();
    assert!(here.is_main_program());
}

#[test]
fn sees_libraries_loaded_later() {
    let handle = unsafe { libc::dlopen(c"libm.so.6".as_ptr(), libc::RTLD_NOW) };
    assert!(!handle.is_null());
    let resolved =
        resolver::resolve(&LibraryMatcher::FileName("libm.so.6".to_string()), "cbrt").unwrap();
    let expected = unsafe { libc::dlsym(handle, c"cbrt".as_ptr()) } as usize;
    assert_eq!(resolved.address, expected);
}
