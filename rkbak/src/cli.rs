use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rkbak", version, about = "Tiered backup runner for rk8s nodes")]
pub struct Cli {
    /// Path of the YAML config file
    #[arg(short, long, env = "RKBAK_CONFIG", default_value = "/etc/rk8s/rkbak.yaml")]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a backup for every configured job, or only the selected ones
    Run {
        #[arg(long = "job", value_name = "NAME")]
        jobs: Vec<String>,
    },
    /// Print the catalog of a job
    List {
        #[arg(long, value_name = "NAME")]
        job: String,
    },
    /// Re-check every verified artifact of a job against its stored digest
    Verify {
        #[arg(long, value_name = "NAME")]
        job: String,
    },
    /// Show what retention would keep and delete right now
    Plan {
        #[arg(long, value_name = "NAME")]
        job: String,
    },
}
