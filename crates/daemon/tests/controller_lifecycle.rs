//! Mount lifecycle tests
//!
//! Drive the controller with a fake device manager and a fake backend, so
//! no FUSE privileges are needed.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use iphonedisk_daemon::mount::{
    ControllerError, ControllerOptions, DetachPolicy, FailurePolicy, LifecycleState,
};

use support::{eventually, FakeBackend, Harness, TIMEOUT};

const SETTLE: Duration = Duration::from_millis(100);

fn options() -> ControllerOptions {
    ControllerOptions {
        unmount_timeout: Duration::from_secs(2),
        ..ControllerOptions::default()
    }
}

fn attach_and_wait_running(harness: &Harness) {
    assert!(harness.device.fire_attach());
    assert!(
        harness.status.wait_for(LifecycleState::Running, TIMEOUT),
        "never reached Running, state is {}",
        harness.status.state()
    );
}

#[test]
fn test_starts_waiting_for_device() {
    let mut harness = Harness::start(options());
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
    assert_eq!(harness.backend.mount_calls(), 0);
    harness.stop().unwrap();
}

#[test]
fn test_attach_mounts_and_runs() {
    let mut harness = Harness::start(options());

    attach_and_wait_running(&harness);
    assert!(eventually(|| harness.backend.runs() == 1));
    assert_eq!(harness.device.opens(), 1);
    assert_eq!(harness.backend.live(), 1);
    assert!(harness.mount_point().is_dir());

    harness.stop().unwrap();
    assert_eq!(harness.backend.unmounts(), 1);
    assert_eq!(harness.backend.live(), 0);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
}

#[test]
fn test_detach_while_running_unmounts() {
    let mut harness = Harness::start(options());
    attach_and_wait_running(&harness);

    assert!(harness.device.fire_detach());
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));

    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
    assert_eq!(harness.backend.unmounts(), 1);
    assert_eq!(harness.backend.live(), 0);
    assert_eq!(harness.backend.force_unmounts(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_detach_while_waiting_is_noop() {
    let mut harness = Harness::start(options());

    harness.device.fire_detach();
    thread::sleep(SETTLE);

    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
    assert_eq!(harness.status.completed_cycles(), 0);
    assert_eq!(harness.device.opens(), 0);
    assert_eq!(harness.backend.mount_calls(), 0);

    // still reacts to the next attach
    attach_and_wait_running(&harness);
    harness.stop().unwrap();
}

#[test]
fn test_attach_while_running_is_ignored() {
    let mut harness = Harness::start(options());
    attach_and_wait_running(&harness);

    for _ in 0..3 {
        harness.device.fire_attach();
    }
    thread::sleep(SETTLE);

    assert_eq!(harness.status.state(), LifecycleState::Running);
    assert_eq!(harness.device.opens(), 1);
    assert_eq!(harness.backend.mounts(), 1);
    assert_eq!(harness.backend.max_live(), 1);

    harness.stop().unwrap();
}

fn run_cycles(n: u64) {
    let mut harness = Harness::start(options());

    for i in 1..=n {
        attach_and_wait_running(&harness);
        assert_eq!(harness.backend.live(), 1);
        harness.device.fire_detach();
        assert!(
            harness.status.wait_for_cycles(i, TIMEOUT),
            "cycle {} did not complete",
            i
        );
        assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
    }

    assert_eq!(harness.backend.mounts(), n as usize);
    assert_eq!(harness.backend.unmounts(), n as usize);
    assert_eq!(harness.device.opens(), n as usize);
    assert_eq!(harness.backend.max_live(), 1);
    assert_eq!(harness.backend.live(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_single_cycle() {
    run_cycles(1);
}

#[test]
fn test_two_cycles() {
    run_cycles(2);
}

#[test]
fn test_fifty_cycles() {
    run_cycles(50);
}

#[test]
fn test_detach_during_mount_aborts() {
    let backend = FakeBackend::new();
    let mut harness = Harness::start_with(options(), backend.clone());

    let device = harness.device.clone();
    backend.on_mount(move || {
        device.fire_detach();
    });

    harness.device.fire_attach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));

    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
    assert_eq!(backend.mounts(), 1);
    assert_eq!(backend.runs(), 0);
    assert_eq!(backend.unmounts(), 1);
    assert_eq!(backend.live(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_detach_during_mount_ignored() {
    let backend = FakeBackend::new();
    let mut harness = Harness::start_with(
        ControllerOptions {
            detach_policy: DetachPolicy::Ignore,
            ..options()
        },
        backend.clone(),
    );

    let device = harness.device.clone();
    backend.on_mount(move || {
        device.fire_detach();
    });

    attach_and_wait_running(&harness);
    assert!(eventually(|| backend.runs() == 1));
    thread::sleep(SETTLE);
    assert_eq!(harness.status.state(), LifecycleState::Running);
    assert_eq!(harness.status.completed_cycles(), 0);

    // a later detach still ends the cycle
    harness.device.fire_detach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));
    assert_eq!(backend.live(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_session_open_failure_is_fatal() {
    let mut harness = Harness::start(options());
    harness.device.fail_open(true);

    harness.device.fire_attach();
    let err = harness.join().unwrap_err();

    assert!(matches!(err, ControllerError::SessionOpen { .. }), "{err}");
    assert_eq!(harness.device.opens(), 1);
    assert_eq!(harness.backend.mount_calls(), 0);
    // the mount point is only prepared once Mounting is entered
    assert!(!harness.mount_point().exists());
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
}

#[test]
fn test_mount_failure_is_fatal() {
    let mut harness = Harness::start(options());
    harness.backend.fail_next(1);

    harness.device.fire_attach();
    let err = harness.join().unwrap_err();

    assert!(matches!(err, ControllerError::Mount(_)), "{err}");
    assert_eq!(harness.backend.mount_calls(), 1);
    assert_eq!(harness.backend.live(), 0);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
}

#[test]
fn test_retry_policy_recovers() {
    let backend = FakeBackend::new();
    backend.fail_next(2);
    let mut harness = Harness::start_with(
        ControllerOptions {
            failure_policy: FailurePolicy::Retry {
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
            },
            ..options()
        },
        backend.clone(),
    );

    attach_and_wait_running(&harness);
    assert_eq!(backend.mount_calls(), 3);
    assert_eq!(backend.mounts(), 1);
    assert_eq!(harness.device.opens(), 3);

    harness.stop().unwrap();
    assert_eq!(backend.live(), 0);
}

#[test]
fn test_retry_waits_for_device_after_detach() {
    let backend = FakeBackend::new();
    backend.fail_next(1);
    let mut harness = Harness::start_with(
        ControllerOptions {
            failure_policy: FailurePolicy::Retry {
                initial_backoff_ms: 20,
                max_backoff_ms: 20,
            },
            ..options()
        },
        backend.clone(),
    );

    harness.device.fire_attach();
    assert!(eventually(|| backend.mount_calls() == 1));
    harness.device.fire_detach();
    thread::sleep(SETTLE);

    // no retry without a device
    assert_eq!(backend.mount_calls(), 1);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);

    attach_and_wait_running(&harness);
    harness.stop().unwrap();
}

#[test]
fn test_shutdown_while_running() {
    let mut harness = Harness::start(options());
    attach_and_wait_running(&harness);

    harness.stop().unwrap();

    assert_eq!(harness.backend.unmounts(), 1);
    assert_eq!(harness.backend.live(), 0);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);
}

#[test]
fn test_shutdown_is_idempotent() {
    let mut harness = Harness::start(options());
    harness.shutdown.shutdown();
    harness.shutdown.shutdown();
    assert!(harness.shutdown.is_requested());
    harness.join().unwrap();
}

#[test]
fn test_unresponsive_loop_is_force_unmounted() {
    let backend = FakeBackend::new();
    backend.ignore_exit(true);
    let mut harness = Harness::start_with(
        ControllerOptions {
            unmount_timeout: Duration::from_millis(100),
            ..options()
        },
        backend.clone(),
    );
    attach_and_wait_running(&harness);

    harness.device.fire_detach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));

    assert_eq!(backend.force_unmounts(), 1);
    assert_eq!(backend.unmounts(), 1);
    assert_eq!(backend.live(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_loop_exit_without_detach_returns_to_waiting() {
    let mut harness = Harness::start(options());
    attach_and_wait_running(&harness);
    assert!(eventually(|| harness.backend.runs() == 1));

    assert!(harness.backend.end_loop());
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));
    thread::sleep(SETTLE);

    // the device is still attached, but only a new attach remounts
    assert_eq!(harness.backend.mounts(), 1);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);

    attach_and_wait_running(&harness);
    assert_eq!(harness.backend.mounts(), 2);
    harness.stop().unwrap();
}

#[test]
fn test_reattach_during_unmount_remounts() {
    let backend = FakeBackend::new();
    backend.ignore_exit(true);
    let mut harness = Harness::start_with(
        ControllerOptions {
            unmount_timeout: Duration::from_millis(200),
            ..options()
        },
        backend.clone(),
    );
    attach_and_wait_running(&harness);
    assert!(eventually(|| backend.runs() == 1));

    // both land while the loop is still being asked to exit
    harness.device.fire_detach();
    harness.device.fire_attach();

    assert!(
        eventually(|| {
            backend.mounts() == 2 && harness.status.state() == LifecycleState::Running
        }),
        "device was not remounted, state is {}",
        harness.status.state()
    );
    assert_eq!(harness.status.completed_cycles(), 1);
    assert_eq!(backend.force_unmounts(), 1);
    assert_eq!(backend.unmounts(), 1);
    assert_eq!(harness.device.opens(), 2);
    assert_eq!(backend.max_live(), 1);

    backend.ignore_exit(false);
    harness.stop().unwrap();
    assert_eq!(backend.live(), 0);
}

#[test]
fn test_detach_after_reattach_during_unmount_stays_waiting() {
    let backend = FakeBackend::new();
    backend.ignore_exit(true);
    let mut harness = Harness::start_with(
        ControllerOptions {
            unmount_timeout: Duration::from_millis(100),
            ..options()
        },
        backend.clone(),
    );
    attach_and_wait_running(&harness);

    harness.device.fire_detach();
    harness.device.fire_attach();
    harness.device.fire_detach();

    assert!(harness.status.wait_for_cycles(1, TIMEOUT));
    thread::sleep(SETTLE);
    assert_eq!(backend.mounts(), 1);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);

    backend.ignore_exit(false);
    attach_and_wait_running(&harness);
    assert_eq!(backend.mounts(), 2);
    harness.stop().unwrap();
}

fn reattach_during_mount(policy: DetachPolicy) {
    let backend = FakeBackend::new();
    let mut harness = Harness::start_with(
        ControllerOptions {
            detach_policy: policy,
            ..options()
        },
        backend.clone(),
    );

    let device = harness.device.clone();
    let fired = AtomicBool::new(false);
    backend.on_mount(move || {
        if !fired.swap(true, Ordering::SeqCst) {
            device.fire_detach();
            device.fire_attach();
        }
    });

    harness.device.fire_attach();
    assert!(
        eventually(|| {
            backend.mounts() == 2 && harness.status.state() == LifecycleState::Running
        }),
        "device was not remounted under {:?}, state is {}",
        policy,
        harness.status.state()
    );
    assert!(eventually(|| backend.runs() == 1));

    // the first mount was released without ever running
    assert_eq!(backend.unmounts(), 1);
    assert_eq!(harness.device.opens(), 2);
    assert_eq!(backend.max_live(), 1);
    assert_eq!(harness.status.completed_cycles(), 1);

    harness.stop().unwrap();
    assert_eq!(backend.live(), 0);
}

#[test]
fn test_reattach_during_mount_remounts_on_abort() {
    reattach_during_mount(DetachPolicy::Abort);
}

#[test]
fn test_reattach_during_mount_remounts_on_ignore() {
    reattach_during_mount(DetachPolicy::Ignore);
}

#[test]
fn test_abandoned_loop_blocks_remount_until_it_exits() {
    let backend = FakeBackend::new();
    backend.ignore_exit(true);
    backend.ignore_force(true);
    let mut harness = Harness::start_with(
        ControllerOptions {
            unmount_timeout: Duration::from_millis(50),
            ..options()
        },
        backend.clone(),
    );
    attach_and_wait_running(&harness);
    assert!(eventually(|| backend.runs() == 1));

    harness.device.fire_detach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));
    assert_eq!(backend.force_unmounts(), 1);
    assert_eq!(backend.live(), 1);

    // the old loop still holds the mount point
    harness.device.fire_attach();
    thread::sleep(SETTLE);
    assert_eq!(backend.mount_calls(), 1);
    assert_eq!(harness.device.opens(), 1);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);

    // its late exit releases the mount and the deferred attach proceeds
    assert!(backend.end_loop());
    assert!(
        eventually(|| {
            backend.mounts() == 2 && harness.status.state() == LifecycleState::Running
        }),
        "deferred attach never mounted, state is {}",
        harness.status.state()
    );
    assert_eq!(backend.unmounts(), 1);
    assert_eq!(backend.max_live(), 1);

    backend.ignore_exit(false);
    backend.ignore_force(false);
    harness.stop().unwrap();
    assert_eq!(backend.live(), 0);
}

#[test]
fn test_abandoned_loop_exit_without_reattach_stays_waiting() {
    let backend = FakeBackend::new();
    backend.ignore_exit(true);
    backend.ignore_force(true);
    let mut harness = Harness::start_with(
        ControllerOptions {
            unmount_timeout: Duration::from_millis(50),
            ..options()
        },
        backend.clone(),
    );
    attach_and_wait_running(&harness);
    assert!(eventually(|| backend.runs() == 1));

    harness.device.fire_detach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));

    assert!(backend.end_loop());
    assert!(eventually(|| backend.live() == 0));
    thread::sleep(SETTLE);
    assert_eq!(backend.mounts(), 1);
    assert_eq!(harness.status.state(), LifecycleState::WaitingForDevice);

    backend.ignore_exit(false);
    backend.ignore_force(false);
    attach_and_wait_running(&harness);
    harness.stop().unwrap();
}

#[test]
fn test_huge_unmount_timeout_does_not_panic() {
    let mut harness = Harness::start(ControllerOptions {
        unmount_timeout: Duration::from_secs(u64::MAX),
        ..options()
    });
    attach_and_wait_running(&harness);

    harness.device.fire_detach();
    assert!(harness.status.wait_for_cycles(1, TIMEOUT));
    assert_eq!(harness.backend.live(), 0);

    harness.stop().unwrap();
}

#[test]
fn test_zero_backoff_retry_does_not_spin() {
    let backend = FakeBackend::new();
    backend.fail_next(usize::MAX);
    let mut harness = Harness::start_with(
        ControllerOptions {
            failure_policy: FailurePolicy::Retry {
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            },
            ..options()
        },
        backend.clone(),
    );

    harness.device.fire_attach();
    thread::sleep(Duration::from_millis(200));

    // at most one attempt per 10ms floor
    assert!(backend.mount_calls() >= 2);
    assert!(backend.mount_calls() <= 25, "{} mount calls", backend.mount_calls());

    harness.stop().unwrap();
}
