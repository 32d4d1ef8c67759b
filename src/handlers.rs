use std::fmt::{self, Write};

use libc::{c_int, c_void, pid_t, siginfo_t};

use crate::job::{Job, JobState, JobTable};
use crate::sig::{self, install_sighandler, RawWriter, SigError, SignalShared};

/// The job list, shared between the read/eval loop and the handlers below.
pub(crate) static JOBS: SignalShared<JobTable> = SignalShared::new(JobTable::new());

/// A state change of a reaped child that belongs to a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ChildEvent {
    Stopped { jid: u32, pid: pid_t, signal: c_int },
    Terminated { jid: u32, pid: pid_t, signal: c_int },
    Exited { jid: u32, pid: pid_t, status: c_int },
}

impl fmt::Display for ChildEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChildEvent::Stopped { jid, pid, signal } => {
                write!(f, "Job [{}] ({}) stopped by signal {}", jid, pid, signal)
            }
            ChildEvent::Terminated { jid, pid, signal } => {
                write!(f, "Job [{}] ({}) terminated by signal {}", jid, pid, signal)
            }
            ChildEvent::Exited { jid, pid, status } => {
                write!(f, "Job [{}] ({}) exited with status {}", jid, pid, status)
            }
        }
    }
}

/// Reaps every child that has already terminated or stopped, without
/// waiting for the others, and updates `jobs` accordingly.
///
/// Stopped jobs move to [`JobState::Stopped`]; exited or killed jobs are
/// deleted. Children that are not a job's key process (earlier pipeline
/// stages) are reaped silently. Runs inside the SIGCHLD handler, so neither
/// this function nor `notify` may allocate.
pub(crate) fn reap_children<F>(jobs: &mut JobTable, mut notify: F)
where
    F: FnMut(ChildEvent),
{
    loop {
        let mut status: c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG | libc::WUNTRACED) };
        // 0: nothing else has changed state; -1: no children left
        if pid <= 0 {
            break;
        }

        let jid = match jobs.find_by_pid(pid) {
            Some(job) => job.jid(),
            None => continue,
        };

        if libc::WIFSTOPPED(status) {
            let _ = jobs.set_state(pid, JobState::Stopped);
            notify(ChildEvent::Stopped {
                jid,
                pid,
                signal: libc::WSTOPSIG(status),
            });
        } else if libc::WIFSIGNALED(status) {
            jobs.delete(pid);
            notify(ChildEvent::Terminated {
                jid,
                pid,
                signal: libc::WTERMSIG(status),
            });
        } else if libc::WIFEXITED(status) {
            jobs.delete(pid);
            notify(ChildEvent::Exited {
                jid,
                pid,
                status: libc::WEXITSTATUS(status),
            });
        }
    }
}

fn report(event: ChildEvent) {
    if let ChildEvent::Exited { .. } = event {
        return;
    }

    let mut w = RawWriter::new();
    let _ = writeln!(w, "{}", event);
    w.write_to(libc::STDOUT_FILENO);
}

/// Sends `signum` to the foreground job's process group, if there is one.
fn forward_to_foreground(signum: c_int) {
    let pgid = unsafe { JOBS.with_in_handler(|jobs| jobs.foreground().map(Job::pgid)) };
    if let Some(pgid) = pgid {
        // nothing useful to do with a failure here
        let _ = sig::signal_group(pgid, signum);
    }
}

extern "C" fn sigchld_handler(_sig: c_int, _info: *mut siginfo_t, _gdata: *mut c_void) {
    let saved = sig::errno();
    unsafe { JOBS.with_in_handler(|jobs| reap_children(jobs, report)) };
    sig::set_errno(saved);
}

extern "C" fn sigint_handler(_sig: c_int, _info: *mut siginfo_t, _gdata: *mut c_void) {
    let saved = sig::errno();
    forward_to_foreground(libc::SIGINT);
    sig::set_errno(saved);
}

/// The Foreground -> Stopped transition happens when SIGCHLD reports the
/// stop, not here.
extern "C" fn sigtstp_handler(_sig: c_int, _info: *mut siginfo_t, _gdata: *mut c_void) {
    let saved = sig::errno();
    forward_to_foreground(libc::SIGTSTP);
    sig::set_errno(saved);
}

extern "C" fn sigquit_handler(_sig: c_int, _info: *mut siginfo_t, _gdata: *mut c_void) {
    let mut w = RawWriter::new();
    let _ = writeln!(w, "Terminating after receipt of SIGQUIT signal");
    w.write_to(libc::STDOUT_FILENO);
    unsafe { libc::_exit(1) };
}

/// Signals the shell handles itself. Children reset these to their default
/// disposition before exec.
pub(crate) const HANDLED_SIGNALS: [c_int; 4] =
    [libc::SIGINT, libc::SIGTSTP, libc::SIGCHLD, libc::SIGQUIT];

pub(crate) fn install() -> Result<(), SigError> {
    install_sighandler(libc::SIGINT, sigint_handler)?;
    install_sighandler(libc::SIGTSTP, sigtstp_handler)?;
    install_sighandler(libc::SIGCHLD, sigchld_handler)?;
    install_sighandler(libc::SIGQUIT, sigquit_handler)?;
    log::debug!("installed job control signal handlers");
    Ok(())
}
