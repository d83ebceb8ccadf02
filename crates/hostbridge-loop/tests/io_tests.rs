//! Reactor and loop integration tests using pipes.
//!
//! Pipes give controlled readiness: the read end becomes readable once bytes
//! are written, and stays readable (level-triggered) until they are drained.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hostbridge_loop::{
    sleep, timeout, Direction, Elapsed, HostLoop, LoopConfig, LoopError, LoopHandle, Sleep,
};

/// Create a pipe and return (read_fd, write_fd) as OwnedFds.
fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Set non-blocking
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn write_all(fd: &OwnedFd, bytes: &[u8]) {
    let mut file = std::fs::File::from(fd.try_clone().expect("dup failed"));
    file.write_all(bytes).expect("write failed");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hostbridge_loop=debug")
        .with_test_writer()
        .try_init();
}

#[test]
fn test_add_remove_watch() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let handle = host.handle();
    let (read_fd, _write_fd) = pipe().expect("failed to create pipe");
    let fd = read_fd.as_raw_fd();

    handle.add_watch(fd, Direction::Read, || {}).unwrap();
    assert!(handle.has_watch(fd, Direction::Read));
    assert!(!handle.has_watch(fd, Direction::Write));
    assert_eq!(handle.watch_count(), 1);

    assert!(handle.remove_watch(fd, Direction::Read));
    assert!(!handle.remove_watch(fd, Direction::Read));
    assert_eq!(handle.watch_count(), 0);
}

#[test]
fn test_duplicate_watch_rejected() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let handle = host.handle();
    let (read_fd, _write_fd) = pipe().expect("failed to create pipe");
    let fd = read_fd.as_raw_fd();

    handle.add_watch(fd, Direction::Read, || {}).unwrap();
    let err = handle.add_watch(fd, Direction::Read, || {}).unwrap_err();
    assert!(matches!(
        err,
        LoopError::DuplicateWatch { fd: f, direction: Direction::Read } if f == fd
    ));
    // The original watch survives the rejected duplicate.
    assert_eq!(handle.watch_count(), 1);

    // The other direction on the same descriptor is a separate pair.
    handle.add_watch(fd, Direction::Write, || {}).unwrap();
    assert_eq!(handle.watch_count(), 2);
}

#[test]
fn test_watch_removed_before_callback() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let (read_fd, write_fd) = pipe().expect("failed to create pipe");
    let fd = read_fd.as_raw_fd();

    let fired = Rc::new(Cell::new(0u32));
    let seen_live = Rc::new(Cell::new(true));
    {
        let fired = Rc::clone(&fired);
        let seen_live = Rc::clone(&seen_live);
        host.handle()
            .add_watch(fd, Direction::Read, move || {
                let handle = LoopHandle::current().expect("callback runs inside the loop");
                seen_live.set(handle.has_watch(fd, Direction::Read));
                fired.set(fired.get() + 1);
            })
            .unwrap();
    }

    write_all(&write_fd, b"ping");

    // The bytes are never drained, so the descriptor stays readable.
    host.block_on(sleep(Duration::from_millis(50)));

    assert_eq!(fired.get(), 1, "level-triggered readiness must fire once");
    assert!(!seen_live.get(), "watch must be gone when the callback runs");
    assert_eq!(host.handle().watch_count(), 0);
}

#[test]
fn test_reregister_from_callback() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let (read_fd, write_fd) = pipe().expect("failed to create pipe");
    let fd = read_fd.as_raw_fd();

    let fired = Rc::new(Cell::new(0u32));

    fn arm(handle: LoopHandle, fd: i32, fired: Rc<Cell<u32>>) {
        let next = handle.clone();
        handle
            .add_watch(fd, Direction::Read, move || {
                fired.set(fired.get() + 1);
                if fired.get() < 3 {
                    arm(next, fd, fired);
                }
            })
            .unwrap();
    }

    arm(host.handle(), fd, Rc::clone(&fired));
    write_all(&write_fd, b"x");

    host.block_on(sleep(Duration::from_millis(50)));
    assert_eq!(fired.get(), 3);
    assert_eq!(host.handle().watch_count(), 0);
}

#[test]
fn test_read_and_write_share_descriptor() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let handle = host.handle();
    let (read_fd, write_fd) = pipe().expect("failed to create pipe");
    let wfd = write_fd.as_raw_fd();
    let rfd = read_fd.as_raw_fd();

    let writable = Rc::new(Cell::new(false));
    let readable = Rc::new(Cell::new(false));
    {
        let writable = Rc::clone(&writable);
        handle
            .add_watch(wfd, Direction::Write, move || writable.set(true))
            .unwrap();
    }
    {
        let readable = Rc::clone(&readable);
        handle
            .add_watch(rfd, Direction::Read, move || readable.set(true))
            .unwrap();
    }

    // An empty pipe is writable straight away; nothing is readable yet.
    host.block_on(sleep(Duration::from_millis(20)));
    assert!(writable.get());
    assert!(!readable.get());
    assert!(handle.has_watch(rfd, Direction::Read));
}

#[test]
fn test_call_soon_threadsafe_wakes_parked_loop() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let remote = host.remote();
    let hits = Arc::new(AtomicUsize::new(0));

    let worker = {
        let hits = Arc::clone(&hits);
        thread::spawn(move || {
            assert!(!remote.is_loop_thread());
            thread::sleep(Duration::from_millis(30));
            remote
                .call_soon_threadsafe(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
    };

    let observed = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&observed);
    let hits_seen = Arc::clone(&hits);
    let started = Instant::now();
    host.block_on(async move {
        while hits_seen.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(1)).await;
        }
        *slot.borrow_mut() = Some(started.elapsed());
    });
    worker.join().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(observed.borrow().is_some());
}

#[test]
fn test_remote_wake_of_root_future() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let (tx, rx) = std::sync::mpsc::channel::<std::task::Waker>();

    let worker = thread::spawn(move || {
        let waker = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        waker.wake();
    });

    let mut polls = 0;
    host.block_on(std::future::poll_fn(|cx| {
        polls += 1;
        if polls == 1 {
            tx.send(cx.waker().clone()).unwrap();
            std::task::Poll::Pending
        } else {
            std::task::Poll::Ready(())
        }
    }));
    worker.join().unwrap();
    assert_eq!(polls, 2);
}

#[test]
fn test_sleep_and_timeout() {
    init_tracing();
    let host = HostLoop::with_config(LoopConfig::from_env()).unwrap();

    let started = Instant::now();
    let nap = sleep(Duration::from_millis(30));
    assert!(nap.deadline() >= started + Duration::from_millis(30));
    assert!(!nap.is_elapsed());
    host.block_on(nap);
    assert!(started.elapsed() >= Duration::from_millis(30));

    // A deadline already in the past completes on first poll.
    host.block_on(Sleep::until(started));

    let fast = host.block_on(timeout(Duration::from_millis(200), async { 5 }));
    assert_eq!(fast, Ok(5));

    let slow = host.block_on(timeout(
        Duration::from_millis(20),
        sleep(Duration::from_secs(5)),
    ));
    assert_eq!(slow, Err(Elapsed));
}

#[test]
fn test_spawned_tasks_interleave() {
    init_tracing();
    let host = HostLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let slow = {
        let order = Rc::clone(&order);
        host.spawn_local(async move {
            sleep(Duration::from_millis(40)).await;
            order.borrow_mut().push("slow");
        })
    };
    let fast = {
        let order = Rc::clone(&order);
        host.spawn_local(async move {
            sleep(Duration::from_millis(10)).await;
            order.borrow_mut().push("fast");
        })
    };

    host.block_on(async move {
        assert!(!fast.is_finished());
        slow.await;
        assert!(fast.is_finished());
        fast.await;
    });
    assert_eq!(*order.borrow(), vec!["fast", "slow"]);
}

#[test]
fn test_drop_clears_watches() {
    init_tracing();
    let (read_fd, _write_fd) = pipe().expect("failed to create pipe");
    let fd = read_fd.as_raw_fd();
    let dropped = Rc::new(Cell::new(false));

    struct Flag(Rc<Cell<bool>>);
    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let host = HostLoop::new().unwrap();
    let handle = host.handle();
    let flag = Flag(Rc::clone(&dropped));
    handle
        .add_watch(fd, Direction::Read, move || drop(flag))
        .unwrap();
    drop(host);

    assert!(dropped.get(), "pending watch callbacks are dropped with the loop");
    assert_eq!(handle.watch_count(), 0);
    assert!(handle.is_closed());
}
