use std::ffi::{CStr, CString, NulError};
use std::fmt::Write;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{null, null_mut};

use libc::{c_char, c_int, pid_t, sigset_t, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use thiserror::Error;

use crate::builtins::{self, BuiltinError};
use crate::handlers::{HANDLED_SIGNALS, JOBS};
use crate::job::{JobError, JobState};
use crate::parser::{self, ParseError, Pipeline};
use crate::sig::{self, CriticalSection, RawWriter, SigError};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Signal(#[from] SigError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Builtin(#[from] BuiltinError),
    #[error("{call} error: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("argument contains a NUL byte")]
    NulByte(#[from] NulError),
}

impl ExecutionError {
    fn last(call: &'static str) -> Self {
        ExecutionError::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Signal primitive failures leave the job list out of step with the
    /// system; the shell can't carry on after one.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Signal(_))
    }

    /// Job-control errors are part of the shell's conversation with the
    /// user and go to stdout; the rest are diagnostics.
    pub(crate) fn is_user_facing(&self) -> bool {
        matches!(self, ExecutionError::Job(_) | ExecutionError::Builtin(_))
    }
}

struct Redirect<'a> {
    path: CString,
    shown: &'a str,
    flags: c_int,
    target: c_int,
}

/// A pipeline stage with everything the child needs already allocated, so
/// nothing allocates between `fork` and `exec`.
struct PreparedStage<'a> {
    name: &'a str,
    argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    redirects: Vec<Redirect<'a>>,
}

impl<'a> Redirect<'a> {
    fn new(shown: &'a str, flags: c_int, target: c_int) -> Result<Self, NulError> {
        Ok(Redirect {
            path: CString::new(shown)?,
            shown,
            flags,
            target,
        })
    }
}

/// Input redirection is honoured on the first stage only, output redirection
/// on the last; each stage keeps its own error redirection.
fn prepare<'a>(pipeline: &Pipeline<'a>) -> Result<Vec<PreparedStage<'a>>, NulError> {
    let last = pipeline.stages.len().saturating_sub(1);
    let mut prepared = Vec::with_capacity(pipeline.stages.len());

    for (index, stage) in pipeline.stages.iter().enumerate() {
        let argv = stage
            .argv
            .iter()
            .map(|arg| CString::new(*arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(null());

        let mut redirects = Vec::new();
        match stage.input {
            Some(path) if index == 0 => {
                redirects.push(Redirect::new(path, libc::O_RDONLY, STDIN_FILENO)?)
            }
            Some(path) => log::warn!("ignoring input redirection from {} in stage {}", path, index),
            None => {}
        }
        match stage.output {
            Some(path) if index == last => {
                let mode = if stage.append {
                    libc::O_APPEND
                } else {
                    libc::O_TRUNC
                };
                redirects.push(Redirect::new(
                    path,
                    libc::O_WRONLY | libc::O_CREAT | mode,
                    STDOUT_FILENO,
                )?);
            }
            Some(path) => log::warn!("ignoring output redirection to {} in stage {}", path, index),
            None => {}
        }
        if let Some(path) = stage.error {
            redirects.push(Redirect::new(
                path,
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                STDERR_FILENO,
            )?);
        }

        prepared.push(PreparedStage {
            name: stage.argv.first().copied().unwrap_or_default(),
            argv,
            argv_ptrs,
            redirects,
        });
    }

    Ok(prepared)
}

fn channel() -> Result<(OwnedFd, OwnedFd), ExecutionError> {
    let mut filedes: [c_int; 2] = [-1, -1];

    match unsafe { libc::pipe(filedes.as_mut_ptr()) } {
        -1 => Err(ExecutionError::last("pipe")),
        _ => Ok(unsafe {
            (
                OwnedFd::from_raw_fd(filedes[0]),
                OwnedFd::from_raw_fd(filedes[1]),
            )
        }),
    }
}

/// The system's message for `errno`. `strerror` may reuse its buffer, so
/// only the single-threaded child calls this.
unsafe fn describe(errno: c_int) -> &'static str {
    CStr::from_ptr(libc::strerror(errno))
        .to_str()
        .unwrap_or("Unknown error")
}

fn child_exit(message: std::fmt::Arguments<'_>) -> ! {
    let mut w = RawWriter::new();
    let _ = w.write_fmt(message);
    let _ = w.write_char('\n');
    w.write_to(STDERR_FILENO);
    unsafe { libc::_exit(1) }
}

/// Child side of `fork`: join the job's process group, wire up the stage's
/// streams and replace the process image. Never returns.
unsafe fn exec_stage(
    stage: &PreparedStage<'_>,
    index: usize,
    channels: &[(OwnedFd, OwnedFd)],
    pgid: pid_t,
    mask: &sigset_t,
) -> ! {
    for &signum in HANDLED_SIGNALS.iter() {
        sig::reset_sighandler(signum);
    }
    // the Rust runtime ignores SIGPIPE, and exec keeps ignored dispositions
    sig::reset_sighandler(libc::SIGPIPE);
    libc::sigprocmask(libc::SIG_SETMASK, mask, null_mut());
    libc::setpgid(0, pgid);

    if index > 0 {
        libc::dup2(channels[index - 1].0.as_raw_fd(), STDIN_FILENO);
    }
    if index < channels.len() {
        libc::dup2(channels[index].1.as_raw_fd(), STDOUT_FILENO);
    }
    for redirect in &stage.redirects {
        let fd = libc::open(redirect.path.as_ptr(), redirect.flags, 0o644 as libc::c_uint);
        if fd == -1 {
            child_exit(format_args!("{}: {}", redirect.shown, describe(sig::errno())));
        }
        if fd != redirect.target {
            libc::dup2(fd, redirect.target);
            libc::close(fd);
        }
    }
    for (read, write) in channels {
        libc::close(read.as_raw_fd());
        libc::close(write.as_raw_fd());
    }

    libc::execvp(stage.argv_ptrs[0], stage.argv_ptrs.as_ptr());

    match sig::errno() {
        libc::ENOENT => child_exit(format_args!("{}: Command not found", stage.name)),
        errno => child_exit(format_args!("{}: {}", stage.name, describe(errno))),
    }
}

/// Blocks until job `pid` is no longer the foreground job: it was reaped or
/// it stopped. `section` must be the outermost critical section.
pub(crate) fn wait_foreground(section: &CriticalSection, pid: pid_t) {
    section.wait_until(|| JOBS.with(section, |jobs| jobs.foreground_pid() != Some(pid)));
}

/// Starts every stage of `pipeline` in one new process group and registers
/// the group as a job keyed by the last stage's pid.
pub(crate) fn launch(pipeline: &Pipeline<'_>, cmdline: &str) -> Result<(), ExecutionError> {
    let stages = prepare(pipeline)?;

    // held until the job is registered, so SIGCHLD can't reap a stage first
    let block = sig::critical_section()?;
    if JOBS.with(&block, |jobs| jobs.is_full()) {
        return Err(JobError::TableFull.into());
    }

    let channels = (1..stages.len())
        .map(|_| channel())
        .collect::<Result<Vec<_>, _>>()?;

    let mut pgid: pid_t = 0;
    let mut last: pid_t = 0;
    for (index, stage) in stages.iter().enumerate() {
        match unsafe { libc::fork() } {
            -1 => {
                let error = ExecutionError::last("fork");
                sig::signal_group(pgid, libc::SIGKILL)?;
                return Err(error);
            }
            0 => unsafe { exec_stage(stage, index, &channels, pgid, block.previous()) },
            pid => {
                if pgid == 0 {
                    pgid = pid;
                }
                // the child makes the same call; either may run first
                unsafe { libc::setpgid(pid, pgid) };
                log::debug!("started {} ({}) in process group {}", stage.name, pid, pgid);
                last = pid;
            }
        }
    }
    drop(channels);

    let state = if pipeline.background {
        JobState::Background
    } else {
        JobState::Foreground
    };
    if let Err(error) = JOBS.with(&block, |jobs| jobs.add(last, pgid, state, cmdline)) {
        sig::signal_group(pgid, libc::SIGKILL)?;
        return Err(error.into());
    }

    if pipeline.background {
        // the stored text, so this line agrees with later `jobs` listings
        JOBS.with(&block, |jobs| {
            if let Some(job) = jobs.find_by_pid(last) {
                println!("[{}] ({}) {}", job.jid(), job.pid(), job.command_text());
            }
        });
    } else {
        wait_foreground(&block, last);
    }

    Ok(())
}

/// Evaluates one input line: a builtin runs in the shell, anything else
/// becomes a job.
pub(crate) fn eval(line: &str) -> Result<(), ExecutionError> {
    let cmdline = line.trim_end_matches(&['\n', '\r'][..]);
    let pipeline = parser::parse(cmdline)?;
    if pipeline.is_empty() {
        return Ok(());
    }

    if pipeline.stages.len() == 1 && builtins::run(&pipeline.stages[0].argv)? {
        return Ok(());
    }

    launch(&pipeline, cmdline)
}
