//! A small thread-per-task engine for driving the bridge in tests.
//!
//! Each entry point returns from `start` straight away and does its work on
//! a worker thread, the way a real engine hands work to its own executor.

#![allow(dead_code)]

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use hostbridge::{ReadyEvent, Registrar, Resolver};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hostbridge=trace,hostbridge_loop=debug")
        .with_test_writer()
        .try_init();
}

/// Create a non-blocking pipe and return (read_fd, write_fd).
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
        libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub fn write_bytes(fd: RawFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    assert_eq!(n, bytes.len() as isize, "short pipe write");
}

/// Write until the pipe buffer is full, so the write end is no longer ready.
pub fn fill_pipe(fd: RawFd) -> usize {
    let chunk = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = unsafe { libc::write(fd, chunk.as_ptr().cast(), chunk.len()) };
        if n <= 0 {
            return total;
        }
        total += n as usize;
    }
}

fn read_some(fd: RawFd, max: usize) -> io::Result<Vec<u8>> {
    let mut chunk = vec![0u8; max];
    let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), max) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    chunk.truncate(n as usize);
    Ok(chunk)
}

/// Resolve with `value` after `delay`, from a worker thread.
pub fn delayed<T: Send + 'static>(
    delay: Duration,
    value: T,
) -> impl FnOnce(Resolver<T>, Registrar, Registrar) {
    move |resolve: Resolver<T>, _read: Registrar, _write: Registrar| {
        thread::spawn(move || {
            thread::sleep(delay);
            resolve.resolve(value);
        });
    }
}

pub fn add(a: i64, b: i64) -> impl FnOnce(Resolver<i64>, Registrar, Registrar) {
    move |resolve: Resolver<i64>, _read: Registrar, _write: Registrar| {
        thread::spawn(move || resolve.resolve(a + b));
    }
}

/// Read exactly `len` bytes from a non-blocking descriptor.
///
/// The first wait is registered from `start` on the host thread; later waits
/// are registered from the worker thread. End of stream before `len` bytes
/// resolves with `UnexpectedEof` as the payload.
pub fn read_exact(
    fd: RawFd,
    len: usize,
) -> impl FnOnce(Resolver<io::Result<Vec<u8>>>, Registrar, Registrar) {
    move |resolve: Resolver<io::Result<Vec<u8>>>, read: Registrar, _write: Registrar| {
        let ready = match wait_readable(&read, fd) {
            Ok(ready) => ready,
            Err(e) => {
                resolve.resolve(Err(io::Error::other(e)));
                return;
            }
        };
        thread::spawn(move || read_worker(fd, len, resolve, read, ready));
    }
}

fn wait_readable(read: &Registrar, fd: RawFd) -> hostbridge::Result<Receiver<ReadyEvent>> {
    let (tx, rx) = mpsc::channel();
    read.register(fd, move |event| {
        let _ = tx.send(event);
    })?;
    Ok(rx)
}

fn read_worker(
    fd: RawFd,
    len: usize,
    resolve: Resolver<io::Result<Vec<u8>>>,
    read: Registrar,
    mut ready: Receiver<ReadyEvent>,
) {
    let mut buf = Vec::with_capacity(len);
    loop {
        // The sender lives in the watch callback; it is dropped unfired when
        // the task is cancelled.
        if ready.recv().is_err() {
            return;
        }

        loop {
            match read_some(fd, len - buf.len()) {
                Ok(chunk) if chunk.is_empty() => {
                    resolve.resolve(Err(io::ErrorKind::UnexpectedEof.into()));
                    return;
                }
                Ok(chunk) => {
                    buf.extend_from_slice(&chunk);
                    if buf.len() == len {
                        resolve.resolve(Ok(buf));
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    resolve.resolve(Err(e));
                    return;
                }
            }
        }

        ready = match wait_readable(&read, fd) {
            Ok(ready) => ready,
            Err(_) => return,
        };
    }
}

/// Register a read wait from a foreign thread and never resolve.
pub fn register_remotely(fd: RawFd) -> impl FnOnce(Resolver<()>, Registrar, Registrar) {
    move |_resolve: Resolver<()>, read: Registrar, _write: Registrar| {
        thread::spawn(move || {
            read.register(fd, |_| {})
                .expect("queueing a registration on a live loop");
        });
    }
}
