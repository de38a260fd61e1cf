use heap_leak_track::context;
use heap_leak_track::modules::NoPatching;
use heap_leak_track::patch::PatchTable;
use heap_leak_track::{Config, Error, Tracker, TrackingAllocator};
use serial_test::serial;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

fn quiet() -> Config {
    Config {
        report_to_debugger: false,
        ..Default::default()
    }
}

#[inline(never)]
fn leak(size: usize) -> &'static mut [u8] {
    Box::leak(vec![7u8; size].into_boxed_slice())
}

#[test]
#[serial]
fn rust_allocations_are_tracked() {
    let tracker = Tracker::builder(quiet())
        .patcher(Box::new(NoPatching))
        .patch_table(PatchTable::new())
        .build()
        .unwrap();
    let guard = tracker.install().unwrap();
    let thread = context::thread_id();
    tracker.mark_all_reported(Some(thread));

    let freed = vec![0u8; 4096];
    drop(freed);
    let leaked = leak(1234);

    let report = tracker.report(Some(thread));
    assert!(report.groups.iter().any(|group| group.size == 1234
        && group.address == leaked.as_ptr() as u64));
    assert!(!report.groups.iter().any(|group| group.size == 4096));

    drop(guard);
    // Once uninstalled, nothing new is recorded.
    let before = tracker.raw_outstanding(None);
    let _late = leak(99);
    assert_eq!(tracker.raw_outstanding(None), before);
}

#[test]
#[serial]
fn only_one_tracker_at_a_time() {
    let build = || {
        Tracker::builder(quiet())
            .patcher(Box::new(NoPatching))
            .patch_table(PatchTable::new())
            .build()
            .unwrap()
    };
    let first = build();
    let second = build();
    let guard = first.install().unwrap();
    assert!(matches!(second.install(), Err(Error::AlreadyInstalled)));
    drop(guard);
    let guard = second.install().unwrap();
    drop(guard);
}
