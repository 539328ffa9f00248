use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Worker agent for a remote CI coordinator
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// The address of the coordinator, e.g. http://127.0.0.1:50051
    #[clap(short = 's', long = "server", env = "WORKER_SERVER")]
    pub server: String,
    /// Root CA certificate to verify the coordinator with (enables TLS)
    #[clap(long = "root-cert")]
    pub root_cert: Option<PathBuf>,
    /// Compress outbound messages with gzip
    #[clap(long)]
    pub compress: bool,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum SubCommand {
    /// keep the coordinator informed this worker is up, until interrupted
    Serve,
    /// run one job to completion
    Run {
        #[clap(long)]
        /// name of the job, also used as the container name
        name: String,

        #[clap(long)]
        /// image to run the job's commands in
        image: String,

        #[clap(long = "command", multiple_occurrences = true)]
        /// a command line to execute, repeat the flag for more
        commands: Vec<String>,

        #[clap(long)]
        /// file to upload once the job passes
        upload: Option<PathBuf>,
    },
    /// upload a file to the coordinator
    Upload {
        /// path of the file to send
        file: PathBuf,
    },
    /// stop a running job's container
    Stop {
        /// container id the job runs in
        container_id: String,
    },
}
