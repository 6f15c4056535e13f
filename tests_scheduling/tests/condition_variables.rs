//! Process-wide key (condition variable) semantics.

use kernel_types::{Duration, Handle, KernelError, ThreadId, Timeout};
use tests_scheduling::{boot, eventually, spawn_guest, TestSystem};

const CONDVAR: u64 = 0x1800;

/// Starts a waiter that owns the guest mutex at `mutex_addr` and parks on
/// the shared condition variable.
fn park_on_condvar(
    system: &TestSystem,
    thread: ThreadId,
    handle: Handle,
    mutex_addr: u64,
) -> std::thread::JoinHandle<Result<(), KernelError>> {
    system.handles.insert(handle, thread);
    system.memory.write_word(mutex_addr, handle.as_raw());
    spawn_guest(&system.kernel, thread, move |kernel| {
        kernel.wait_process_wide_key_atomic(thread, mutex_addr, CONDVAR, handle, Timeout::Never)
    })
}

#[test]
fn test_signal_wakes_most_urgent_waiters_first() {
    let system = boot();
    let mid = system.started_thread("mid", 20, 0);
    let urgent = system.started_thread("urgent", 10, 1);
    let lazy = system.started_thread("lazy", 30, 2);

    let mid_join = park_on_condvar(&system, mid, Handle::from_raw(0x11), 0x1000);
    let urgent_join = park_on_condvar(&system, urgent, Handle::from_raw(0x12), 0x1010);
    let lazy_join = park_on_condvar(&system, lazy, Handle::from_raw(0x13), 0x1020);

    assert!(eventually(1000, || {
        system.is_paused(mid) && system.is_paused(urgent) && system.is_paused(lazy)
    }));
    // the atomic unlock released every mutex word
    assert_eq!(system.memory.word(0x1000), 0);
    assert_eq!(system.memory.word(0x1010), 0);
    assert_eq!(system.memory.word(0x1020), 0);

    let signaler = system.started_thread("signaler", 5, 3);
    system
        .kernel
        .signal_process_wide_key(signaler, CONDVAR, 2)
        .unwrap();

    // the two most urgent waiters wake; the least urgent stays parked
    assert_eq!(urgent_join.join().unwrap(), Ok(()));
    assert_eq!(mid_join.join().unwrap(), Ok(()));
    assert!(system.is_paused(lazy));

    // each wake re-acquired its own (free) mutex
    assert_eq!(system.memory.word(0x1010), 0x12);
    assert_eq!(system.memory.word(0x1000), 0x11);

    system
        .kernel
        .signal_process_wide_key(signaler, CONDVAR, -1)
        .unwrap();
    assert_eq!(lazy_join.join().unwrap(), Ok(()));
}

#[test]
fn test_condvar_wait_times_out() {
    let system = boot();
    let waiter = system.started_thread("waiter", 20, 0);
    let handle = Handle::from_raw(0x11);
    system.handles.insert(handle, waiter);
    system.memory.write_word(0x1000, handle.as_raw());

    let join = spawn_guest(&system.kernel, waiter, move |kernel| {
        kernel.wait_process_wide_key_atomic(
            waiter,
            0x1000,
            CONDVAR,
            handle,
            Timeout::After(Duration::from_millis(30)),
        )
    });

    assert_eq!(join.join().unwrap(), Err(KernelError::Timeout));
}

#[test]
fn test_woken_waiter_contends_for_held_mutex() {
    let system = boot();
    let waiter = system.started_thread("waiter", 20, 0);
    let thief = system.started_thread("thief", 25, 1);
    let waiter_handle = Handle::from_raw(0x11);
    let thief_handle = Handle::from_raw(0x12);
    system.handles.insert(thief_handle, thief);

    let join = park_on_condvar(&system, waiter, waiter_handle, 0x1000);
    assert!(eventually(1000, || system.is_paused(waiter)));

    // someone else grabbed the mutex while the waiter was parked
    system.memory.write_word(0x1000, thief_handle.as_raw());

    let signaler = system.started_thread("signaler", 5, 3);
    system
        .kernel
        .signal_process_wide_key(signaler, CONDVAR, -1)
        .unwrap();

    // the waiter is off the condvar but still blocked, now on the mutex;
    // the word gained the listeners flag
    assert!(eventually(1000, || {
        system.memory.word(0x1000) == (thief_handle.as_raw() | kernel_types::HANDLE_HAS_LISTENERS)
    }));
    assert!(system.is_paused(waiter));

    // the thief unlocks; the waiter finally owns the mutex and wakes
    let unlock = spawn_guest(&system.kernel, thief, move |kernel| {
        kernel.arbitrate_unlock(thief, 0x1000)
    });
    assert_eq!(unlock.join().unwrap(), Ok(()));
    assert_eq!(join.join().unwrap(), Ok(()));
    assert_eq!(system.memory.word(0x1000), waiter_handle.as_raw());
}
