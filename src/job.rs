use std::fmt;

use libc::pid_t;
use thiserror::Error;

/// Maximum number of jobs alive at once.
pub(crate) const MAX_JOBS: usize = 16;
/// Bytes of command text kept per job.
pub(crate) const MAX_LINE: usize = 1024;

#[derive(Debug, PartialEq, Error)]
pub enum JobError {
    #[error("Tried to create too many jobs")]
    TableFull,
    #[error("invalid job pid {0}")]
    InvalidPid(pid_t),
    #[error("job ({0}) cannot enter the foreground while job ({1}) holds it")]
    ForegroundBusy(pid_t, pid_t),
    #[error("({0}): No such process")]
    NoSuchPid(pid_t),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Foreground,
    Background,
    Stopped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Foreground => "Foreground",
            JobState::Background => "Running",
            JobState::Stopped => "Stopped",
        })
    }
}

/// Command line stored inline, so clearing a slot never frees memory.
#[derive(Clone, Copy)]
pub struct CommandText {
    buf: [u8; MAX_LINE],
    len: usize,
}

impl CommandText {
    const EMPTY: CommandText = CommandText {
        buf: [0; MAX_LINE],
        len: 0,
    };

    fn new(text: &str) -> Self {
        let mut len = text.len().min(MAX_LINE);
        while !text.is_char_boundary(len) {
            len -= 1;
        }

        let mut cmdline = CommandText::EMPTY;
        cmdline.buf[..len].copy_from_slice(&text.as_bytes()[..len]);
        cmdline.len = len;
        cmdline
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl fmt::Debug for CommandText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Job {
    pid: pid_t,
    pgid: pid_t,
    jid: u32,
    state: JobState,
    cmdline: CommandText,
}

impl Job {
    const FREE: Job = Job {
        pid: 0,
        pgid: 0,
        jid: 0,
        state: JobState::Background,
        cmdline: CommandText::EMPTY,
    };

    fn is_free(&self) -> bool {
        self.pid == 0
    }

    /// Pid of the last process of the job; the table key.
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// Process group every process of the job belongs to.
    pub fn pgid(&self) -> pid_t {
        self.pgid
    }

    pub fn jid(&self) -> u32 {
        self.jid
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn command_text(&self) -> &str {
        self.cmdline.as_str()
    }
}

/// The `jobs` listing line.
impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] ({}) {} {}",
            self.jid,
            self.pid,
            self.state,
            self.cmdline.as_str()
        )
    }
}

/// Fixed-capacity job list.
///
/// Lookups are linear scans over [`MAX_JOBS`] slots. Nothing reachable from
/// [`JobTable::delete`], [`JobTable::set_state`] or
/// [`JobTable::foreground`] allocates, logs or locks, since the signal
/// handlers call them.
#[derive(Debug)]
pub struct JobTable {
    jobs: [Job; MAX_JOBS],
    next_jid: u32,
}

impl JobTable {
    pub const fn new() -> Self {
        JobTable {
            jobs: [Job::FREE; MAX_JOBS],
            next_jid: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.iter().filter(|job| !job.is_free()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.jobs.iter().all(|job| !job.is_free())
    }

    fn max_jid(&self) -> u32 {
        self.jobs.iter().map(|job| job.jid).max().unwrap_or(0)
    }

    fn allocate_jid(&mut self) -> u32 {
        loop {
            if self.next_jid == 0 || self.next_jid > MAX_JOBS as u32 {
                self.next_jid = 1;
            }
            let jid = self.next_jid;
            self.next_jid += 1;
            if self.find_by_jid(jid).is_none() {
                return jid;
            }
        }
    }

    /// Registers a job keyed by `pid` whose processes live in group `pgid`.
    pub fn add(
        &mut self,
        pid: pid_t,
        pgid: pid_t,
        state: JobState,
        cmdline: &str,
    ) -> Result<u32, JobError> {
        if pid < 1 || pgid < 1 {
            return Err(JobError::InvalidPid(pid));
        }
        if state == JobState::Foreground {
            if let Some(current) = self.foreground_pid() {
                return Err(JobError::ForegroundBusy(pid, current));
            }
        }

        let slot = self
            .jobs
            .iter()
            .position(Job::is_free)
            .ok_or(JobError::TableFull)?;
        let jid = self.allocate_jid();

        self.jobs[slot] = Job {
            pid,
            pgid,
            jid,
            state,
            cmdline: CommandText::new(cmdline),
        };
        log::info!("Added job [{}] {} {}", jid, pid, cmdline);

        Ok(jid)
    }

    /// Removes the job keyed by `pid`. Returns `false` if there is none.
    pub fn delete(&mut self, pid: pid_t) -> bool {
        if pid < 1 {
            return false;
        }

        match self.jobs.iter_mut().find(|job| job.pid == pid) {
            Some(job) => {
                *job = Job::FREE;
                self.next_jid = self.max_jid() + 1;
                true
            }
            None => false,
        }
    }

    pub fn find_by_pid(&self, pid: pid_t) -> Option<&Job> {
        if pid < 1 {
            return None;
        }
        self.jobs.iter().find(|job| job.pid == pid)
    }

    pub fn find_by_pid_mut(&mut self, pid: pid_t) -> Option<&mut Job> {
        if pid < 1 {
            return None;
        }
        self.jobs.iter_mut().find(|job| job.pid == pid)
    }

    pub fn find_by_jid(&self, jid: u32) -> Option<&Job> {
        if jid < 1 {
            return None;
        }
        self.jobs
            .iter()
            .find(|job| !job.is_free() && job.jid == jid)
    }

    pub fn foreground(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|job| !job.is_free() && job.state == JobState::Foreground)
    }

    pub fn foreground_pid(&self) -> Option<pid_t> {
        self.foreground().map(Job::pid)
    }

    /// Moves the job keyed by `pid` to `state`, keeping at most one job in
    /// the foreground.
    pub fn set_state(&mut self, pid: pid_t, state: JobState) -> Result<(), JobError> {
        if state == JobState::Foreground {
            match self.foreground_pid() {
                Some(current) if current != pid => {
                    return Err(JobError::ForegroundBusy(pid, current))
                }
                _ => {}
            }
        }

        let job = self.find_by_pid_mut(pid).ok_or(JobError::NoSuchPid(pid))?;
        job.state = state;
        Ok(())
    }

    /// Live jobs in slot order. The iterator can be cloned to walk the list
    /// again.
    pub fn list(&self) -> impl Iterator<Item = &Job> + Clone + '_ {
        self.jobs.iter().filter(|job| !job.is_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find() {
        let mut jobs = JobTable::new();
        let jid = jobs.add(100, 100, JobState::Background, "sleep 5 &\n").unwrap();
        assert_eq!(jid, 1);

        let job = jobs.find_by_jid(jid).unwrap();
        assert_eq!(job.pid(), 100);
        assert_eq!(job.pgid(), 100);
        assert_eq!(job.state(), JobState::Background);
        assert_eq!(job.command_text(), "sleep 5 &\n");

        assert_eq!(jobs.find_by_pid(100).unwrap().jid(), 1);
    }

    #[test]
    fn test_add_rejects_invalid_pid() {
        let mut jobs = JobTable::new();
        assert_eq!(
            jobs.add(0, 0, JobState::Background, "x"),
            Err(JobError::InvalidPid(0))
        );
        assert_eq!(
            jobs.add(-4, 4, JobState::Background, "x"),
            Err(JobError::InvalidPid(-4))
        );
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_lookups_reject_non_positive() {
        let mut jobs = JobTable::new();
        jobs.add(7, 7, JobState::Stopped, "cat").unwrap();

        assert!(jobs.find_by_pid(0).is_none());
        assert!(jobs.find_by_pid(-7).is_none());
        assert!(jobs.find_by_jid(0).is_none());
        assert!(!jobs.delete(0));
        assert!(!jobs.delete(-1));
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_table_full() {
        let mut jobs = JobTable::new();
        for pid in 1..=MAX_JOBS as pid_t {
            jobs.add(pid, pid, JobState::Background, "sleep 100 &").unwrap();
        }
        assert!(jobs.is_full());

        assert_eq!(
            jobs.add(500, 500, JobState::Background, "one too many"),
            Err(JobError::TableFull)
        );
        assert_eq!(jobs.len(), MAX_JOBS);
        assert!(jobs.find_by_pid(500).is_none());
        assert_eq!(
            JobError::TableFull.to_string(),
            "Tried to create too many jobs"
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut jobs = JobTable::new();
        jobs.add(10, 10, JobState::Background, "a").unwrap();
        jobs.add(11, 11, JobState::Stopped, "b").unwrap();

        assert!(jobs.delete(10));
        assert!(!jobs.delete(10));
        assert!(!jobs.delete(12));

        let rest: Vec<_> = jobs.list().map(|job| (job.pid(), job.jid())).collect();
        assert_eq!(rest, vec![(11, 2)]);
        assert_eq!(jobs.find_by_pid(11).unwrap().command_text(), "b");
    }

    #[test]
    fn test_job_ids_trend_low() {
        let mut jobs = JobTable::new();
        assert_eq!(jobs.add(10, 10, JobState::Background, "a").unwrap(), 1);
        assert_eq!(jobs.add(11, 11, JobState::Background, "b").unwrap(), 2);
        assert_eq!(jobs.add(12, 12, JobState::Background, "c").unwrap(), 3);

        assert!(jobs.delete(12));
        assert_eq!(jobs.add(13, 13, JobState::Background, "d").unwrap(), 3);

        assert!(jobs.delete(11));
        assert!(jobs.delete(13));
        assert_eq!(jobs.add(14, 14, JobState::Background, "e").unwrap(), 2);

        assert!(jobs.delete(10));
        assert!(jobs.delete(14));
        assert!(jobs.is_empty());
        assert_eq!(jobs.add(15, 15, JobState::Background, "f").unwrap(), 1);
    }

    #[test]
    fn test_job_ids_unique_after_wrap() {
        let mut jobs = JobTable::new();
        for pid in 1..=MAX_JOBS as pid_t {
            jobs.add(pid, pid, JobState::Background, "x").unwrap();
        }
        // free a low id while the highest stays live
        assert!(jobs.delete(3));
        let jid = jobs.add(100, 100, JobState::Background, "y").unwrap();
        assert_eq!(jid, 3);

        let mut ids: Vec<u32> = jobs.list().map(Job::jid).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), MAX_JOBS);
        assert!(ids.iter().all(|&id| id >= 1 && id <= MAX_JOBS as u32));
    }

    #[test]
    fn test_ids_positive_and_unique_under_churn() {
        let mut jobs = JobTable::new();
        let mut next_pid: pid_t = 1;

        for round in 0..200 {
            if round % 3 == 2 {
                let victim = jobs.list().nth(round % 5).map(Job::pid);
                if let Some(pid) = victim {
                    assert!(jobs.delete(pid));
                }
            } else {
                if let Err(error) = jobs.add(next_pid, next_pid, JobState::Background, "churn") {
                    assert_eq!(error, JobError::TableFull);
                    assert_eq!(jobs.len(), MAX_JOBS);
                }
                next_pid += 1;
            }

            let mut ids: Vec<u32> = jobs.list().map(Job::jid).collect();
            let live = ids.len();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), live);
            assert!(live <= MAX_JOBS);
            assert!(ids.iter().all(|&id| id > 0));
        }
    }

    #[test]
    fn test_single_foreground() {
        let mut jobs = JobTable::new();
        jobs.add(20, 20, JobState::Foreground, "vi").unwrap();
        assert_eq!(jobs.foreground_pid(), Some(20));

        assert_eq!(
            jobs.add(21, 21, JobState::Foreground, "top"),
            Err(JobError::ForegroundBusy(21, 20))
        );
        jobs.add(21, 21, JobState::Background, "top &").unwrap();
        assert_eq!(
            jobs.set_state(21, JobState::Foreground),
            Err(JobError::ForegroundBusy(21, 20))
        );

        jobs.set_state(20, JobState::Stopped).unwrap();
        assert_eq!(jobs.foreground_pid(), None);

        jobs.set_state(21, JobState::Foreground).unwrap();
        assert_eq!(jobs.foreground_pid(), Some(21));
        // re-promoting the foreground job itself is fine
        jobs.set_state(21, JobState::Foreground).unwrap();

        let foreground = jobs
            .list()
            .filter(|job| job.state() == JobState::Foreground)
            .count();
        assert_eq!(foreground, 1);
    }

    #[test]
    fn test_set_state_unknown_pid() {
        let mut jobs = JobTable::new();
        assert_eq!(
            jobs.set_state(99, JobState::Background),
            Err(JobError::NoSuchPid(99))
        );
    }

    #[test]
    fn test_list_is_restartable() {
        let mut jobs = JobTable::new();
        jobs.add(30, 30, JobState::Background, "sleep 100 &").unwrap();
        jobs.add(31, 29, JobState::Stopped, "cat | wc").unwrap();
        jobs.delete(30);
        jobs.add(32, 32, JobState::Foreground, "make").unwrap();

        let listing = jobs.list();
        let first: Vec<String> = listing.clone().map(|job| job.to_string()).collect();
        let second: Vec<String> = listing.map(|job| job.to_string()).collect();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec!["[3] (32) Foreground make", "[2] (31) Stopped cat | wc"]
        );
    }

    #[test]
    fn test_listing_running() {
        let mut jobs = JobTable::new();
        jobs.add(40, 40, JobState::Background, "sleep 100 &").unwrap();
        let line = jobs.list().next().unwrap().to_string();
        assert_eq!(line, "[1] (40) Running sleep 100 &");
    }

    #[test]
    fn test_command_text_truncated_on_char_boundary() {
        let mut jobs = JobTable::new();
        let long = format!("{}é", "a".repeat(MAX_LINE - 1));
        jobs.add(50, 50, JobState::Background, &long).unwrap();

        let text = jobs.find_by_pid(50).unwrap().command_text();
        assert_eq!(text.len(), MAX_LINE - 1);
        assert!(text.chars().all(|c| c == 'a'));
    }
}
