//! A self-pipe-like kernel object the I/O reactor can wait on.
//!
//! Writing a byte is signal-safe and thread-safe (a single `write(2)` to a
//! pipe is atomic with respect to both); reading drains and is idempotent.
//! This is the "extra" wakeup mechanism every reactor in this crate
//! includes in its wait-set so the injection queue (§4.5) and the
//! keyboard-interrupt bridge (§4.6) can interrupt a blocked `handle_io`
//! from off the loop thread.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
mod imp {
    use std::io;
    use std::os::unix::io::RawFd;

    pub(super) struct Pipe {
        pub(super) read_fd: RawFd,
        pub(super) write_fd: RawFd,
    }

    impl Pipe {
        pub(super) fn new() -> io::Result<Self> {
            let mut fds = [0 as RawFd; 2];
            // SAFETY: `fds` is a valid pointer to two `RawFd`s, as
            // `pipe(2)` requires.
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fds[0]/fds[1] are open descriptors returned by the
            // pipe() call above.
            unsafe {
                let read_flags = libc::fcntl(fds[0], libc::F_GETFL);
                libc::fcntl(fds[0], libc::F_SETFL, read_flags | libc::O_NONBLOCK);
                let write_flags = libc::fcntl(fds[1], libc::F_GETFL);
                libc::fcntl(fds[1], libc::F_SETFL, write_flags | libc::O_NONBLOCK);
            }
            Ok(Pipe {
                read_fd: fds[0],
                write_fd: fds[1],
            })
        }

        /// Write a single byte. Signal- and thread-safe: `write(2)` on a
        /// pipe of at most `PIPE_BUF` bytes is atomic, and non-blocking
        /// writes to an already-full buffer simply fail with `EAGAIN`,
        /// which we treat as "already woken" (coalescing).
        pub(super) fn write_one(&self) {
            let byte = [1u8];
            // SAFETY: write_fd is a valid, open, non-blocking fd.
            unsafe {
                libc::write(self.write_fd, byte.as_ptr() as *const _, 1);
            }
        }

        /// Drain every pending byte. Idempotent: calling this on an
        /// already-empty pipe is a no-op (`read` returns `EAGAIN`).
        pub(super) fn drain(&self) {
            let mut buf = [0u8; 256];
            loop {
                // SAFETY: read_fd is valid and buf is a valid buffer of
                // the given length.
                let n = unsafe {
                    libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n <= 0 {
                    break;
                }
            }
        }

        pub(super) fn read_fd(&self) -> RawFd {
            self.read_fd
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            // SAFETY: both fds were opened by this struct and aren't
            // used elsewhere.
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }
}

/// The reactor-facing wakeup primitive. Construction may fail only if the
/// platform refuses to hand out a pipe (file descriptor exhaustion).
pub struct WakeupChannel {
    #[cfg(unix)]
    pipe: imp::Pipe,
    woken: AtomicBool,
}

impl WakeupChannel {
    pub fn new() -> io::Result<Self> {
        Ok(WakeupChannel {
            #[cfg(unix)]
            pipe: imp::Pipe::new()?,
            woken: AtomicBool::new(false),
        })
    }

    /// Non-blocking, reentrancy-safe, coalescing: repeated calls before
    /// the next drain collapse to a single observable wakeup.
    pub fn wakeup_thread_and_signal_safe(&self) {
        if !self.woken.swap(true, Ordering::SeqCst) {
            #[cfg(unix)]
            self.pipe.write_one();
        }
    }

    /// Equivalent alias matching the shorter name used elsewhere in this
    /// crate's call sites.
    pub fn wake(&self) {
        self.wakeup_thread_and_signal_safe()
    }

    /// Drain any pending wakeup. Idempotent.
    pub fn drain(&self) {
        self.woken.store(false, Ordering::SeqCst);
        #[cfg(unix)]
        self.pipe.drain();
    }

    /// True if a wakeup is currently pending (not yet drained).
    pub fn is_pending(&self) -> bool {
        self.woken.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    pub fn readable_fd(&self) -> std::os::unix::io::RawFd {
        self.pipe.read_fd()
    }
}
