//! Fatal errors abort the process, so each case runs in a child copy of this
//! test binary.

mod common;

use std::{
    env,
    process::{Command, Output},
    sync::Mutex,
};

use guardalloc::{Config, Guarded, LockFree, MemAllocator, System};

const CHILD_ENV: &str = "GUARDALLOC_ABORT_CHILD";

fn is_child() -> bool {
    env::var_os(CHILD_ENV).is_some()
}

fn run_child(test: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap()
}

#[test]
fn guarded_array_overflow_aborts() {
    if is_child() {
        let allocator = Guarded::<_, Mutex<()>>::new(System);
        let _ = allocator.allocate_array(usize::MAX / 2 + 1, 2, "overflowing");
        return;
    }
    common::setup_logger();
    let output = run_child("guarded_array_overflow_aborts");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!(
            "Malloc array aborted due to integer overflow: len={}x2 in overflowing, total 0",
            usize::MAX / 2 + 1
        )),
        "{stderr}"
    );
}

#[test]
fn lockfree_array_overflow_aborts() {
    if is_child() {
        let allocator = LockFree::new(System);
        let _ = allocator.allocate_zeroed_array(3, usize::MAX / 2, "overflowing");
        return;
    }
    common::setup_logger();
    let output = run_child("lockfree_array_overflow_aborts");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Malloc array aborted due to integer overflow"));
}

#[test]
fn abort_on_error_aborts_after_reporting() {
    if is_child() {
        let config = Config::new().abort_on_error(true);
        let allocator = Guarded::<_, Mutex<()>>::with_config(System, config);
        let _ = unsafe { allocator.free(None) };
        return;
    }
    common::setup_logger();
    let output = run_child("abort_on_error_aborts_after_reporting");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Memoryblock free: attempt to free NULL pointer"));
}
