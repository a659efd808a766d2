//! File-descriptor readiness multiplexing over `poll(2)`.
//!
//! [`Poller`] owns a dense `pollfd` array (what the syscall wants) plus a
//! parallel callback array. `add` and `remove` never touch those arrays
//! directly: mutations are staged in pending queues and applied at the top
//! of the next [`poll`](Poller::poll), so the set being iterated is stable
//! for the whole invocation and both methods are safe to call from any
//! thread at any time, including from inside a callback.
//!
//! Removed entries leave a hole (`fd == -1`, which `poll(2)` ignores) that
//! the next `add` fills, keeping the array compact.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

/// Invoked when the registered fd is readable. Return `false` to have the
/// fd removed from the poll set.
pub type PollCallback = Box<dyn FnMut() -> bool + Send>;

#[derive(Default)]
struct Slots {
    /// Contiguous array handed to `poll(2)`. Holes have `fd == -1`.
    fds: Vec<libc::pollfd>,
    /// Callback for the fd at the same index.
    callbacks: Vec<Option<PollCallback>>,
    /// Lowest free index, or `fds.len()` when full.
    next_available: usize,
}

/// Thread-safe wrapper around the system `poll()` call.
#[derive(Default)]
pub struct Poller {
    pending_adds: Mutex<HashMap<RawFd, PollCallback>>,
    pending_removals: Mutex<Vec<RawFd>>,
    slots: Mutex<Slots>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run when `fd` is readable.
    ///
    /// Takes effect just before the next poll.
    pub fn add(&self, fd: RawFd, callback: impl FnMut() -> bool + Send + 'static) {
        self.pending_adds.lock().insert(fd, Box::new(callback));
    }

    /// Stop polling `fd`. Unknown fds are ignored.
    pub fn remove(&self, fd: RawFd) {
        self.pending_removals.lock().push(fd);
    }

    /// Perform a single poll of all registered fds, waiting at most
    /// `timeout_ms`, and invoke the callback of every readable one.
    ///
    /// Returns the number of ready fds. On a syscall error the error is
    /// logged and returned; the caller may retry after a backoff.
    pub fn poll(&self, timeout_ms: i32) -> io::Result<usize> {
        let mut slots = self.slots.lock();
        let slots = &mut *slots;

        {
            let mut removals = self.pending_removals.lock();
            Self::apply_removals(slots, &mut removals);
        }
        {
            let mut adds = self.pending_adds.lock();
            Self::apply_adds(slots, &mut adds);
        }

        #[allow(unsafe_code)]
        let ret = unsafe {
            libc::poll(
                slots.fds.as_mut_ptr(),
                slots.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            log::error!("poll failed: {err}");
            return Err(err);
        }

        let ready = ret as usize;
        if ready == 0 {
            return Ok(0);
        }

        let readable = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
        let mut finished = Vec::new();
        let mut processed = 0;

        for i in 0..slots.fds.len() {
            let fd = slots.fds[i].fd;
            if fd < 0 || (slots.fds[i].revents & readable) == 0 {
                continue;
            }
            if let Some(callback) = slots.callbacks[i].as_mut() {
                if !callback() {
                    finished.push(fd);
                }
            }
            processed += 1;
            if processed == ready {
                break;
            }
        }

        // Fold the fds retired by their callbacks in with any removals that
        // arrived during the callbacks, so they all land in the same tick.
        {
            let mut removals = self.pending_removals.lock();
            removals.extend(finished);
            Self::apply_removals(slots, &mut removals);
        }

        Ok(ready)
    }

    fn apply_adds(slots: &mut Slots, adds: &mut HashMap<RawFd, PollCallback>) {
        for (fd, callback) in adds.drain() {
            if slots.next_available == slots.fds.len() {
                slots.fds.push(libc::pollfd {
                    fd: -1,
                    events: 0,
                    revents: 0,
                });
                slots.callbacks.push(None);
            }

            let index = slots.next_available;
            slots.fds[index] = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            slots.callbacks[index] = Some(callback);

            while slots.next_available < slots.fds.len()
                && slots.fds[slots.next_available].fd >= 0
            {
                slots.next_available += 1;
            }
        }
    }

    fn apply_removals(slots: &mut Slots, removals: &mut Vec<RawFd>) {
        for fd in removals.drain(..) {
            if let Some(index) = slots.fds.iter().position(|p| p.fd == fd) {
                slots.fds[index] = libc::pollfd {
                    fd: -1,
                    events: 0,
                    revents: 0,
                };
                slots.callbacks[index] = None;
                if index < slots.next_available {
                    slots.next_available = index;
                }
            }
        }
    }
}
