use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Bit marking the handle as closing; once set, no new references succeed.
const CLOSING: u64 = 1 << 63;

/// Reference-counted wrapper over a raw kernel file descriptor.
///
/// The count gates use of the descriptor number: acquisition fails once the
/// closing bit is set, and the mutex is held around the actual close(2), so
/// a concurrent user observes either a valid descriptor or a definitively
/// closed one, never a reused number.
pub struct Fd {
    raw: RawFd,
    refs: AtomicU64,
    closed: Mutex<bool>,
}

/// RAII reference to an [`Fd`]; dropping it releases the count.
pub struct FdRef<'a> {
    fd: &'a Fd,
}

impl Drop for FdRef<'_> {
    fn drop(&mut self) {
        self.fd.dec_ref();
    }
}

impl Fd {
    pub fn new(raw: RawFd) -> Arc<Fd> {
        Arc::new(Fd {
            raw,
            refs: AtomicU64::new(1),
            closed: Mutex::new(false),
        })
    }

    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// Acquire a usage reference. Fails once the handle is closing.
    pub fn inc_ref(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur & CLOSING != 0 {
                return false;
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    pub fn dec_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!((prev & !CLOSING) > 0, "fd {} reference underflow", self.raw);
    }

    /// Acquire a reference and mark the handle closing in one step.
    /// Succeeds exactly once over the lifetime of the handle.
    pub fn closing_inc_ref(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur & CLOSING != 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                cur,
                (cur + 1) | CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    /// Guarded variant of [`Fd::inc_ref`].
    pub fn try_ref(&self) -> Option<FdRef<'_>> {
        if self.inc_ref() {
            Some(FdRef { fd: self })
        } else {
            None
        }
    }

    /// Guarded variant of [`Fd::closing_inc_ref`].
    pub fn closing_ref(&self) -> Option<FdRef<'_>> {
        if self.closing_inc_ref() {
            Some(FdRef { fd: self })
        } else {
            None
        }
    }

    /// Close the underlying descriptor. The lock guarantees no close(2)
    /// races a use of the number.
    pub fn close_raw(&self) -> Result<(), i32> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Err(libc::EBADF);
        }
        *closed = true;
        nix::unistd::close(self.raw).map_err(|e| e as i32)
    }

    #[cfg(test)]
    pub fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::Acquire) & !CLOSING
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        // Last-resort release for handles whose closing path never ran.
        let closed = self.closed.get_mut().unwrap();
        if !*closed {
            *closed = true;
            let _ = nix::unistd::close(self.raw);
        }
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.refs.load(Ordering::Relaxed);
        write!(
            f,
            "Fd({}, refs={}, closing={})",
            self.raw,
            refs & !CLOSING,
            refs & CLOSING != 0
        )
    }
}
