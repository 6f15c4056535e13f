//! Futex-style address wait/signal semantics.

use hle_kernel::{ArbitrationType, SignalType};
use kernel_types::{KernelError, Timeout};
use tests_scheduling::{boot, eventually, spawn_guest};

const ADDR: u64 = 0x1400;

#[test]
fn test_signal_modify_decrements_when_waiters_are_covered() {
    let system = boot();
    let first = system.started_thread("first", 20, 0);
    let second = system.started_thread("second", 22, 1);
    let driver = system.started_thread("driver", 5, 3);
    system.memory.write_word(ADDR, 3);

    let first_join = spawn_guest(&system.kernel, first, move |kernel| {
        kernel.wait_for_address(first, ADDR, ArbitrationType::WaitIfEqual, 3, Timeout::Never)
    });
    let second_join = spawn_guest(&system.kernel, second, move |kernel| {
        kernel.wait_for_address(second, ADDR, ArbitrationType::WaitIfEqual, 3, Timeout::Never)
    });
    assert!(eventually(1000, || {
        system.is_paused(first) && system.is_paused(second)
    }));

    // exactly 2 waiters, count 2, word == 3: decrement and wake both
    system
        .kernel
        .signal_to_address(
            driver,
            ADDR,
            SignalType::ModifyByWaitingCountAndSignalIfEqual,
            3,
            2,
        )
        .unwrap();

    assert_eq!(first_join.join().unwrap(), Ok(()));
    assert_eq!(second_join.join().unwrap(), Ok(()));
    assert_eq!(system.memory.word(ADDR), 2);
}

#[test]
fn test_signal_modify_keeps_word_when_count_cannot_drain() {
    let system = boot();
    let first = system.started_thread("first", 20, 0);
    let second = system.started_thread("second", 22, 1);
    let driver = system.started_thread("driver", 5, 3);
    system.memory.write_word(ADDR, 3);

    let first_join = spawn_guest(&system.kernel, first, move |kernel| {
        kernel.wait_for_address(first, ADDR, ArbitrationType::WaitIfEqual, 3, Timeout::Never)
    });
    let second_join = spawn_guest(&system.kernel, second, move |kernel| {
        kernel.wait_for_address(second, ADDR, ArbitrationType::WaitIfEqual, 3, Timeout::Never)
    });
    assert!(eventually(1000, || {
        system.is_paused(first) && system.is_paused(second)
    }));

    // 2 waiters but only 1 wake: the word is left untouched
    system
        .kernel
        .signal_to_address(
            driver,
            ADDR,
            SignalType::ModifyByWaitingCountAndSignalIfEqual,
            3,
            1,
        )
        .unwrap();
    assert_eq!(system.memory.word(ADDR), 3);
    // the more urgent waiter woke, the other still waits
    assert_eq!(first_join.join().unwrap(), Ok(()));
    assert!(system.is_paused(second));

    system
        .kernel
        .signal_to_address(driver, ADDR, SignalType::Signal, 0, -1)
        .unwrap();
    assert_eq!(second_join.join().unwrap(), Ok(()));
}

#[test]
fn test_signal_wakes_in_urgency_order() {
    let system = boot();
    let lazy = system.started_thread("lazy", 30, 0);
    let urgent = system.started_thread("urgent", 10, 1);
    let driver = system.started_thread("driver", 5, 3);
    system.memory.write_word(ADDR, 0);

    let lazy_join = spawn_guest(&system.kernel, lazy, move |kernel| {
        kernel.wait_for_address(lazy, ADDR, ArbitrationType::WaitIfEqual, 0, Timeout::Never)
    });
    let urgent_join = spawn_guest(&system.kernel, urgent, move |kernel| {
        kernel.wait_for_address(urgent, ADDR, ArbitrationType::WaitIfEqual, 0, Timeout::Never)
    });
    assert!(eventually(1000, || {
        system.is_paused(lazy) && system.is_paused(urgent)
    }));

    system
        .kernel
        .signal_to_address(driver, ADDR, SignalType::Signal, 0, 1)
        .unwrap();
    assert_eq!(urgent_join.join().unwrap(), Ok(()));
    assert!(system.is_paused(lazy));

    system
        .kernel
        .signal_to_address(driver, ADDR, SignalType::Signal, 0, -1)
        .unwrap();
    assert_eq!(lazy_join.join().unwrap(), Ok(()));
}

#[test]
fn test_decrement_variant_updates_word_before_blocking() {
    let system = boot();
    let waiter = system.started_thread("waiter", 20, 0);
    let driver = system.started_thread("driver", 5, 3);
    system.memory.write_word(ADDR, 5);

    let join = spawn_guest(&system.kernel, waiter, move |kernel| {
        kernel.wait_for_address(
            waiter,
            ADDR,
            ArbitrationType::DecrementAndWaitIfLessThan,
            10,
            Timeout::Never,
        )
    });

    assert!(eventually(1000, || system.is_paused(waiter)));
    assert_eq!(system.memory.word(ADDR), 4);

    system
        .kernel
        .signal_to_address(driver, ADDR, SignalType::Signal, 0, -1)
        .unwrap();
    assert_eq!(join.join().unwrap(), Ok(()));
}

#[test]
fn test_wait_for_address_timeout() {
    let system = boot();
    let waiter = system.started_thread("waiter", 20, 0);
    system.memory.write_word(ADDR, 1);

    let join = spawn_guest(&system.kernel, waiter, move |kernel| {
        kernel.wait_for_address(
            waiter,
            ADDR,
            ArbitrationType::WaitIfEqual,
            1,
            Timeout::After(kernel_types::Duration::from_millis(30)),
        )
    });
    assert_eq!(join.join().unwrap(), Err(KernelError::Timeout));
}
