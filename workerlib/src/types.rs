use chrono::{DateTime, Utc};

/// One unit of work dispatched by the coordinator: a named container and
/// the command lines to run inside it, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobTask {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
}

/// Accounting for a completed upload.
#[derive(Clone, Copy, Debug)]
pub struct UploadStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bytes_sent: u64,
}

/// Split a command line into an argument vector on whitespace. Runs of
/// whitespace collapse, and shell quoting is not honored: `echo 'a b'`
/// becomes three tokens.
pub fn tokenize(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
