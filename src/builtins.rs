use libc::pid_t;
use thiserror::Error;

use crate::execution::{wait_foreground, ExecutionError};
use crate::handlers::JOBS;
use crate::job::JobState;
use crate::sig::{self, SigError};

#[derive(Debug, PartialEq, Error)]
pub enum BuiltinError {
    #[error("{0} command requires PID or %jobid argument")]
    MissingArgument(&'static str),
    #[error("{0}: No such job")]
    NoSuchJob(String),
    #[error("({0}): No such process")]
    NoSuchProcess(pid_t),
    #[error("{0}: argument must be a PID or %jobid")]
    BadArgument(&'static str),
}

#[derive(Debug, PartialEq)]
enum JobRef {
    Jid(u32),
    Pid(pid_t),
}

fn parse_job_ref(command: &'static str, arg: &str) -> Result<JobRef, BuiltinError> {
    if let Some(jid) = arg.strip_prefix('%') {
        return jid
            .parse()
            .map(JobRef::Jid)
            .map_err(|_| BuiltinError::NoSuchJob(arg.to_string()));
    }

    if arg.starts_with(|c: char| c.is_ascii_digit()) {
        return arg
            .parse()
            .map(JobRef::Pid)
            .map_err(|_| BuiltinError::BadArgument(command));
    }

    Err(BuiltinError::BadArgument(command))
}

/// Runs `argv` if it names a builtin. Returns `false` when it doesn't.
pub(crate) fn run(argv: &[&str]) -> Result<bool, ExecutionError> {
    match argv.first().copied() {
        Some("quit") => std::process::exit(0),
        Some("jobs") => list_jobs()?,
        Some("fg") => resume("fg", &argv[1..], JobState::Foreground)?,
        Some("bg") => resume("bg", &argv[1..], JobState::Background)?,
        _ => return Ok(false),
    }

    Ok(true)
}

fn list_jobs() -> Result<(), SigError> {
    let block = sig::critical_section()?;
    JOBS.with(&block, |jobs| {
        for job in jobs.list() {
            println!("{}", job);
        }
    });
    Ok(())
}

/// `fg`/`bg`: continue the job's process group and move it to `state`.
fn resume(command: &'static str, args: &[&str], state: JobState) -> Result<(), ExecutionError> {
    let arg = args
        .first()
        .copied()
        .ok_or(BuiltinError::MissingArgument(command))?;
    let target = parse_job_ref(command, arg)?;

    let block = sig::critical_section()?;
    let (pid, pgid) = JOBS.with(&block, |jobs| {
        let job = match target {
            JobRef::Jid(jid) => jobs
                .find_by_jid(jid)
                .ok_or_else(|| BuiltinError::NoSuchJob(arg.to_string())),
            JobRef::Pid(pid) => jobs
                .find_by_pid(pid)
                .ok_or(BuiltinError::NoSuchProcess(pid)),
        }?;
        Ok::<_, BuiltinError>((job.pid(), job.pgid()))
    })?;

    sig::signal_group(pgid, libc::SIGCONT)?;
    JOBS.with(&block, |jobs| jobs.set_state(pid, state))?;
    log::debug!("{}: continued process group {} as {:?}", command, pgid, state);

    if state == JobState::Foreground {
        wait_foreground(&block, pid);
    } else {
        JOBS.with(&block, |jobs| {
            if let Some(job) = jobs.find_by_pid(pid) {
                println!("[{}] ({}) {}", job.jid(), job.pid(), job.command_text());
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::handlers::reap_children;
    use crate::sig::testing::process_lock;

    #[test]
    fn test_parse_job_ref() {
        assert_eq!(parse_job_ref("fg", "%3"), Ok(JobRef::Jid(3)));
        assert_eq!(parse_job_ref("bg", "1234"), Ok(JobRef::Pid(1234)));
        assert_eq!(
            parse_job_ref("fg", "%x"),
            Err(BuiltinError::NoSuchJob("%x".to_string()))
        );
        assert_eq!(parse_job_ref("fg", "abc"), Err(BuiltinError::BadArgument("fg")));
        assert_eq!(parse_job_ref("bg", "12abc"), Err(BuiltinError::BadArgument("bg")));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BuiltinError::MissingArgument("fg").to_string(),
            "fg command requires PID or %jobid argument"
        );
        assert_eq!(
            BuiltinError::NoSuchJob("%3".to_string()).to_string(),
            "%3: No such job"
        );
        assert_eq!(
            BuiltinError::NoSuchProcess(99).to_string(),
            "(99): No such process"
        );
        assert_eq!(
            BuiltinError::BadArgument("bg").to_string(),
            "bg: argument must be a PID or %jobid"
        );
    }

    #[test]
    fn test_not_a_builtin() {
        assert!(!run(&["ls", "-l"]).unwrap());
        assert!(!run(&[]).unwrap());
    }

    #[test]
    fn test_fg_unknown_job() {
        let _lock = process_lock();
        match run(&["fg", "%3"]) {
            Err(ExecutionError::Builtin(error)) => {
                assert_eq!(error.to_string(), "%3: No such job")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bg_unknown_pid_and_missing_argument() {
        let _lock = process_lock();
        assert!(matches!(
            run(&["bg", "999999"]),
            Err(ExecutionError::Builtin(BuiltinError::NoSuchProcess(999999)))
        ));
        assert!(matches!(
            run(&["bg"]),
            Err(ExecutionError::Builtin(BuiltinError::MissingArgument("bg")))
        ));
        assert!(matches!(
            run(&["fg", "x"]),
            Err(ExecutionError::Builtin(BuiltinError::BadArgument("fg")))
        ));
    }

    #[test]
    fn test_jobs_on_empty_table() {
        let _lock = process_lock();
        assert!(run(&["jobs"]).unwrap());
    }

    #[test]
    fn test_bg_continues_stopped_job() -> Result<(), Box<dyn std::error::Error>> {
        let _lock = process_lock();

        let pid = match unsafe { libc::fork() } {
            -1 => panic!("fork failed"),
            0 => unsafe {
                libc::setpgid(0, 0);
                libc::raise(libc::SIGSTOP);
                loop {
                    libc::pause();
                }
            },
            pid => pid,
        };
        unsafe { libc::setpgid(pid, pid) };

        {
            let block = sig::critical_section()?;
            JOBS.with(&block, |jobs| jobs.add(pid, pid, JobState::Stopped, "sleep 100"))?;
        }

        let pid_arg = pid.to_string();
        assert!(run(&["bg", &pid_arg])?);

        {
            let block = sig::critical_section()?;
            let state = JOBS.with(&block, |jobs| jobs.find_by_pid(pid).map(|job| job.state()));
            assert_eq!(state, Some(JobState::Background));
            assert_eq!(JOBS.with(&block, |jobs| jobs.foreground_pid()), None);
        }

        unsafe { libc::kill(pid, libc::SIGKILL) };
        let block = sig::critical_section()?;
        for _ in 0..500 {
            // the SIGSTOP report may come first; keep draining until deleted
            JOBS.with(&block, |jobs| reap_children(jobs, |_| {}));
            if JOBS.with(&block, |jobs| jobs.is_empty()) {
                return Ok(());
            }
            sleep(Duration::from_millis(10));
        }
        panic!("job {} was never reaped", pid);
    }
}
