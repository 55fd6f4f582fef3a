//! The interceptor hooks the allocator for the whole test binary, so everything is
//! checked by address: the test harness allocates concurrently.

use std::ffi::c_void;
use std::sync::Arc;

use perf_probe::probe_types::ReportEvent;
use perf_probe::resolver::{self, LibraryMatcher};
use perf_probe::{ChannelSink, HandlerRegistry, ProbeConfig};

fn address(pointer: *mut c_void) -> u64 {
    pointer as u64
}

#[test]
fn outstanding_allocations_are_tracked_exactly() {
    let (sink, reports) = ChannelSink::bounded(16);
    let runtime = perf_probe::init_with(
        ProbeConfig::default(),
        HandlerRegistry::new().register_leaks(Arc::new(sink)),
    )
    .unwrap();
    let interceptor = runtime
        .install_interceptor(LibraryMatcher::MainProgram)
        .unwrap();
    let tracker = interceptor.tracker();
    let window = interceptor.begin_window();

    unsafe {
        // malloc(16) without free: one outstanding record.
        let kept = libc::malloc(16);
        assert!(tracker.is_outstanding(address(kept)));
        let record = tracker
            .snapshot_outstanding()
            .into_iter()
            .find(|record| record.address == address(kept))
            .unwrap();
        assert_eq!(record.size, 16);
        assert!(record.call_site.is_known());
        let caller = resolver::module_of(record.call_site.0 as usize).unwrap();
        assert!(caller.is_main_program());

        // malloc(16) then free: nothing outstanding.
        let freed = libc::malloc(16);
        assert!(tracker.is_outstanding(address(freed)));
        libc::free(freed);
        assert!(!tracker.is_outstanding(address(freed)));

        let zeroed = libc::calloc(4, 8);
        let zeroed_record = tracker
            .snapshot_outstanding()
            .into_iter()
            .find(|record| record.address == address(zeroed))
            .unwrap();
        assert_eq!(zeroed_record.size, 32);
        libc::free(zeroed);
        assert!(!tracker.is_outstanding(address(zeroed)));

        // realloc moves the record to the new block.
        let grown = libc::realloc(kept, 4096);
        assert!(tracker.is_outstanding(address(grown)));
        if grown != kept {
            assert!(!tracker.is_outstanding(address(kept)));
        }

        let leaked = perf_probe::trigger_native_allocation(8192).unwrap() as u64;
        assert!(tracker.is_outstanding(leaked));

        let in_window = runtime.end_window(&interceptor, window);
        let addresses: Vec<u64> = in_window.iter().map(|record| record.address).collect();
        assert!(addresses.contains(&address(grown)));
        assert!(addresses.contains(&leaked));
        assert!(!addresses.contains(&address(freed)));
        assert!(!addresses.contains(&address(zeroed)));

        let reported = reports
            .try_iter()
            .filter_map(|event| match event {
                ReportEvent::Leak(records) => Some(records),
                _ => None,
            })
            .last()
            .unwrap();
        assert!(reported.iter().any(|record| record.address == leaked));

        libc::free(grown);
        libc::free(leaked as *mut c_void);
        assert!(!tracker.is_outstanding(address(grown)));
        assert!(!tracker.is_outstanding(leaked));
    }

    interceptor.uninstall().unwrap();
    unsafe {
        let untracked = libc::malloc(24);
        assert!(!tracker.is_outstanding(address(untracked)));
        libc::free(untracked);
    }
}
