//! Cross-process synchronisation primitives.
//!
//! Everything here lives *inside* the mapped segment, so the pthread
//! objects are initialised with `PTHREAD_PROCESS_SHARED` and reached
//! through whatever address the current process mapped the segment at.
//! Condition variables are bound to `CLOCK_MONOTONIC` so bounded waits
//! survive wall-clock steps.
//!
//! Locking hands back an RAII guard; releasing on drop is what makes a
//! panicking (or cancelled) waiter leave the segment unlocked.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::warn;
use nix::time::{clock_gettime, ClockId};

use crate::error::Result;

fn check_rc(rc: libc::c_int, what: &str) {
    if rc != 0 {
        // A failing pthread call on an initialised process-shared object
        // means the segment state is gone; there is nothing to unwind to.
        panic!("vsi: {what} failed: {}", io::Error::from_raw_os_error(rc));
    }
}

/// Process-shared mutex embedded in segment memory.
#[repr(C)]
pub(crate) struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread objects initialised with PTHREAD_PROCESS_SHARED are
// made for concurrent use from any thread of any process.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialise the mutex in place. Called exactly once, when the
    /// segment is created; openers use the already-initialised object.
    ///
    /// # Safety
    /// `this` must point at writable, 8-aligned segment memory that no
    /// other thread or process is touching yet.
    pub unsafe fn init(this: *mut SharedMutex) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init((*this).inner.get(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        Ok(())
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        check_rc(rc, "pthread_mutex_lock");
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl MutexGuard<'_> {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.inner.get()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        if rc != 0 {
            warn!("pthread_mutex_unlock failed: {rc}");
        }
    }
}

/// Absolute `CLOCK_MONOTONIC` deadline for bounded waits.
#[derive(Clone, Copy)]
pub(crate) struct Deadline {
    ts: libc::timespec,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Deadline {
        let now = match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => ts,
            Err(err) => {
                // An unreadable monotonic clock degrades the wait to an
                // immediate timeout rather than an unbounded block.
                warn!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
                return Deadline {
                    ts: libc::timespec {
                        tv_sec: 0,
                        tv_nsec: 0,
                    },
                };
            }
        };
        let mut sec = now.tv_sec() + timeout.as_secs() as libc::time_t;
        let mut nsec = now.tv_nsec() as i64 + timeout.subsec_nanos() as i64;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        Deadline {
            ts: libc::timespec {
                tv_sec: sec,
                tv_nsec: nsec as libc::c_long,
            },
        }
    }
}

/// Process-shared condition variable embedded in segment memory.
#[repr(C)]
pub(crate) struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: see `SharedMutex`.
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut SharedCondvar) -> Result<()> {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let rc = libc::pthread_condattr_init(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_condattr_setclock(&mut attr, libc::CLOCK_MONOTONIC);
        let rc = libc::pthread_cond_init((*this).inner.get(), &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        Ok(())
    }

    /// Block until signalled. The guard proves the associated mutex is
    /// held; it is atomically released for the duration of the wait.
    pub fn wait(&self, guard: &MutexGuard<'_>) {
        let rc = unsafe { libc::pthread_cond_wait(self.inner.get(), guard.raw()) };
        check_rc(rc, "pthread_cond_wait");
    }

    /// Block until signalled or the deadline passes. Returns true when
    /// the wait timed out.
    pub fn wait_until(&self, guard: &MutexGuard<'_>, deadline: Deadline) -> bool {
        let rc =
            unsafe { libc::pthread_cond_timedwait(self.inner.get(), guard.raw(), &deadline.ts) };
        if rc == libc::ETIMEDOUT {
            return true;
        }
        check_rc(rc, "pthread_cond_timedwait");
        false
    }

    pub fn signal(&self) {
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        check_rc(rc, "pthread_cond_signal");
    }

    pub fn broadcast(&self) {
        let rc = unsafe { libc::pthread_cond_broadcast(self.inner.get()) };
        check_rc(rc, "pthread_cond_broadcast");
    }
}

/// The per-queue "semaphore": mutex + condvar + undelivered-message and
/// waiter counters. One of these is embedded in every signal queue
/// record; the mutex doubles as the lock for the queue's head/tail/count
/// fields.
#[repr(C)]
pub(crate) struct QueueSemaphore {
    mutex: SharedMutex,
    cond: SharedCondvar,
    message_count: AtomicU32,
    waiter_count: AtomicU32,
}

impl QueueSemaphore {
    /// # Safety
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut QueueSemaphore) -> Result<()> {
        SharedMutex::init(std::ptr::addr_of_mut!((*this).mutex))?;
        SharedCondvar::init(std::ptr::addr_of_mut!((*this).cond))?;
        (*this).message_count = AtomicU32::new(0);
        (*this).waiter_count = AtomicU32::new(0);
        Ok(())
    }

    pub fn lock(&self) -> MutexGuard<'_> {
        self.mutex.lock()
    }

    /// Record one newly deliverable message and wake one waiter.
    pub fn post(&self, _held: &MutexGuard<'_>) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.cond.signal();
    }

    /// Account for one message consumed by a destructive fetch.
    pub fn take_message(&self, _held: &MutexGuard<'_>) {
        let count = self.message_count.load(Ordering::Relaxed);
        if count > 0 {
            self.message_count.store(count - 1, Ordering::Relaxed);
        }
    }

    /// Reset the deliverable count (queue flush).
    pub fn reset(&self, _held: &MutexGuard<'_>) {
        self.message_count.store(0, Ordering::Relaxed);
    }

    pub fn message_count(&self) -> u32 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn waiter_count(&self) -> u32 {
        self.waiter_count.load(Ordering::Relaxed)
    }

    pub fn wait(&self, guard: &MutexGuard<'_>) {
        self.waiter_count.fetch_add(1, Ordering::Relaxed);
        self.cond.wait(guard);
        self.waiter_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns true when the wait timed out.
    pub fn wait_until(&self, guard: &MutexGuard<'_>, deadline: Deadline) -> bool {
        self.waiter_count.fetch_add(1, Ordering::Relaxed);
        let timed_out = self.cond.wait_until(guard, deadline);
        self.waiter_count.fetch_sub(1, Ordering::Relaxed);
        timed_out
    }

    /// Rouse every sleeper so cooperative cancellation flags get
    /// re-checked.
    pub fn wake_all(&self) {
        let _guard = self.mutex.lock();
        self.cond.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Heap-allocated stand-ins are fine for these tests: process-shared
    // objects work within a single process too.
    fn boxed_semaphore() -> Arc<Box<QueueSemaphore>> {
        let mut sem: Box<QueueSemaphore> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { QueueSemaphore::init(&mut *sem as *mut QueueSemaphore).unwrap() };
        Arc::new(sem)
    }

    #[test]
    fn post_and_take_track_messages() {
        let sem = boxed_semaphore();
        {
            let guard = sem.lock();
            sem.post(&guard);
            sem.post(&guard);
            assert_eq!(sem.message_count(), 2);
            sem.take_message(&guard);
            assert_eq!(sem.message_count(), 1);
            sem.reset(&guard);
            assert_eq!(sem.message_count(), 0);
            // A take on an empty semaphore must not wrap.
            sem.take_message(&guard);
            assert_eq!(sem.message_count(), 0);
        }
    }

    #[test]
    fn timed_wait_expires() {
        let sem = boxed_semaphore();
        let guard = sem.lock();
        let deadline = Deadline::after(Duration::from_millis(20));
        // Re-wait on spurious wakes; only a real timeout ends the loop.
        let mut timed_out = false;
        for _ in 0..10 {
            if sem.wait_until(&guard, deadline) {
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
    }

    #[test]
    fn post_wakes_waiter() {
        let sem = boxed_semaphore();
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || {
                let guard = sem.lock();
                while sem.message_count() == 0 {
                    sem.wait(&guard);
                }
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        {
            let guard = sem.lock();
            sem.post(&guard);
        }
        waiter.join().unwrap();
        assert_eq!(sem.waiter_count(), 0);
    }
}
