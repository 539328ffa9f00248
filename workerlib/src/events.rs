/// Lifecycle states a job reports to the coordinator. The progression is
/// one way: `Running` first, then exactly one of the terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Passing,
    Stopped,
    Failing,
}

/// Exit code the runtime reports for a command killed with the container.
pub const KILLED_EXIT_CODE: i64 = 137;

/// How the last command of a job came out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Killed,
    Failed(i64),
}

impl ExecOutcome {
    pub fn from_exit_code(code: i64) -> Self {
        match code {
            0 => ExecOutcome::Success,
            KILLED_EXIT_CODE => ExecOutcome::Killed,
            code => ExecOutcome::Failed(code),
        }
    }

    pub fn job_status(&self) -> JobStatus {
        match self {
            ExecOutcome::Success => JobStatus::Passing,
            ExecOutcome::Killed => JobStatus::Stopped,
            ExecOutcome::Failed(_) => JobStatus::Failing,
        }
    }
}
