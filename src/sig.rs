// https://github.com/vorner/signal-hook/blob/master/signal-hook-registry/src/lib.rs

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ptr::null_mut;

use libc::{__errno_location, c_int, c_void, pid_t, sighandler_t, siginfo_t, sigset_t};
use thiserror::Error;

/// Signals whose handlers read or mutate the job table.
pub(crate) const JOB_SIGNALS: [c_int; 3] = [libc::SIGCHLD, libc::SIGINT, libc::SIGTSTP];

#[derive(Debug, PartialEq, Error)]
pub enum SigError {
    #[error("{call}: {}", os_message(.errno))]
    Syscall { call: &'static str, errno: c_int },
}

fn os_message(errno: &c_int) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

impl SigError {
    fn last(call: &'static str) -> Self {
        SigError::Syscall {
            call,
            errno: errno(),
        }
    }
}

pub(crate) fn errno() -> c_int {
    unsafe { *__errno_location() }
}

pub(crate) fn set_errno(value: c_int) {
    unsafe { *__errno_location() = value };
}

pub(crate) fn signal_set(signals: &[c_int]) -> sigset_t {
    let mut set = MaybeUninit::<sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for &signum in signals {
            libc::sigaddset(set.as_mut_ptr(), signum);
        }
        set.assume_init()
    }
}

pub(crate) type Handler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// Installs `handler` for `signum`. Every job signal is blocked while any
/// handler runs, so handlers never interleave with each other.
pub(crate) fn install_sighandler(signum: c_int, handler: Handler) -> Result<(), SigError> {
    let mut sa = unsafe { MaybeUninit::<libc::sigaction>::zeroed().assume_init() };
    sa.sa_sigaction = handler as sighandler_t;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    sa.sa_mask = signal_set(&JOB_SIGNALS);

    match unsafe { libc::sigaction(signum, &sa, null_mut()) } {
        -1 => Err(SigError::last("sigaction")),
        _ => Ok(()),
    }
}

/// Restores the default disposition of `signum`. Safe to call between
/// `fork` and `exec`.
pub(crate) fn reset_sighandler(signum: c_int) {
    unsafe { libc::signal(signum, libc::SIG_DFL) };
}

/// Scoped block of a set of signals. The mask in effect before the block is
/// restored on drop.
pub(crate) struct SignalBlock {
    previous: sigset_t,
}

impl SignalBlock {
    pub(crate) fn new(signals: &[c_int]) -> Result<Self, SigError> {
        let set = signal_set(signals);
        let mut previous = MaybeUninit::<sigset_t>::uninit();

        match unsafe { libc::sigprocmask(libc::SIG_BLOCK, &set, previous.as_mut_ptr()) } {
            -1 => Err(SigError::last("sigprocmask")),
            _ => Ok(SignalBlock {
                previous: unsafe { previous.assume_init() },
            }),
        }
    }

    /// The mask that was in effect before this block was taken.
    pub(crate) fn previous(&self) -> &sigset_t {
        &self.previous
    }

    /// Sleeps until `ready` holds. The predicate is evaluated with the
    /// signals blocked; `sigsuspend` atomically swaps in the previous mask
    /// while sleeping, so a notification can't slip in between the check and
    /// the sleep.
    ///
    /// Must not be called on a nested block whose previous mask already
    /// blocks the signals that make `ready` true.
    pub(crate) fn wait_until<F>(&self, mut ready: F)
    where
        F: FnMut() -> bool,
    {
        while !ready() {
            // always returns -1/EINTR once a handler has run
            unsafe { libc::sigsuspend(&self.previous) };
        }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if unsafe { libc::sigprocmask(libc::SIG_SETMASK, &self.previous, null_mut()) } == -1 {
            let error = SigError::last("sigprocmask");
            log::error!("failed to restore signal mask: {}", error);
            eprintln!("{}", error);
            std::process::exit(1);
        }
    }
}

/// A [`SignalBlock`] known to cover every job signal. Only
/// [`critical_section`] makes one.
pub(crate) struct CriticalSection(SignalBlock);

impl Deref for CriticalSection {
    type Target = SignalBlock;

    fn deref(&self) -> &SignalBlock {
        &self.0
    }
}

/// Blocks every job signal for the lifetime of the returned guard.
pub(crate) fn critical_section() -> Result<CriticalSection, SigError> {
    SignalBlock::new(&JOB_SIGNALS).map(CriticalSection)
}

/// State shared between the main flow and signal handlers.
///
/// There is no lock; exclusion comes from the signal mask. The main flow
/// reaches the value only through a held [`CriticalSection`], and handlers run
/// with every job signal blocked.
pub(crate) struct SignalShared<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SignalShared<T> {}

impl<T> SignalShared<T> {
    pub(crate) const fn new(value: T) -> Self {
        SignalShared {
            value: UnsafeCell::new(value),
        }
    }

    /// Main-flow access. Calls must not nest.
    pub(crate) fn with<R, F>(&self, _section: &CriticalSection, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        f(unsafe { &mut *self.value.get() })
    }

    /// Handler access.
    ///
    /// # Safety
    ///
    /// Only call from a handler installed with [`install_sighandler`], which
    /// keeps the other job signals blocked for its whole duration.
    pub(crate) unsafe fn with_in_handler<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        f(&mut *self.value.get())
    }
}

/// Sends `signum` to the process group `pgid`. A group that has already
/// vanished is not an error.
pub(crate) fn signal_group(pgid: pid_t, signum: c_int) -> Result<(), SigError> {
    if pgid <= 0 {
        return Ok(());
    }

    match unsafe { libc::kill(-pgid, signum) } {
        -1 if errno() == libc::ESRCH => Ok(()),
        -1 => Err(SigError::last("kill")),
        _ => Ok(()),
    }
}

/// Formats into a fixed stack buffer. Usable from signal handlers and from a
/// freshly forked child; output past the capacity is dropped.
pub(crate) struct RawWriter {
    buf: [u8; 256],
    len: usize,
}

impl RawWriter {
    pub(crate) const fn new() -> Self {
        RawWriter {
            buf: [0; 256],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Writes the buffered bytes to `fd` with raw `write(2)` calls.
    pub(crate) fn write_to(&self, fd: c_int) {
        let mut rest = self.as_bytes();
        while !rest.is_empty() {
            let n = unsafe { libc::write(fd, rest.as_ptr() as *const c_void, rest.len()) };
            if n < 0 {
                if errno() == libc::EINTR {
                    continue;
                }
                return;
            }
            rest = &rest[n as usize..];
        }
    }
}

impl fmt::Write for RawWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}
