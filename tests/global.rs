mod common;

use guardalloc::{global, Config, Error, LeakDetector, MemAllocator};

#[test]
fn global_lifecycle() {
    common::setup_logger();
    let allocator = global::init(Config::new().debug_fill(true)).unwrap();
    assert!(std::ptr::eq(allocator, global::global()));
    assert_eq!(
        global::init(Config::new()).unwrap_err(),
        Error::AlreadyInitialized
    );
    let text = common::capture(allocator);

    let kept = allocator.allocate(256, "kept").unwrap();
    let freed = allocator.allocate(16, "freed").unwrap();
    unsafe { allocator.free(Some(freed)).unwrap() };

    assert_eq!(LeakDetector::new(global::global()).check(), 1);
    assert!(text
        .lock()
        .unwrap()
        .starts_with("Error: Not freed memory blocks: 1"));

    unsafe { allocator.free(Some(kept)).unwrap() };
    assert_eq!(global::shutdown(), 0);
}
