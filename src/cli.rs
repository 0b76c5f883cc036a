use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "survey-analysis-engine",
    version,
    about = "Multi-tenant survey analysis worker"
)]
pub struct Args {
    /// Overrides SURVEY_ANALYSIS_WORKER_COUNT.
    #[arg(long, global = true)]
    pub workers: Option<usize>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the worker pool until interrupted (default).
    Run {
        #[arg(long, default_value_t = false)]
        apply_schema: bool,
    },
    /// Submit one analysis job and print the outcome as JSON.
    Enqueue {
        #[arg(long)]
        company: Uuid,
        #[arg(long)]
        survey: Uuid,
        /// RFC 3339 window start (inclusive).
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 window end (exclusive).
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Print the effective configuration as JSON.
    PrintConfig,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { apply_schema: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let args = Args::try_parse_from(["survey-analysis-engine"]).unwrap();
        assert_eq!(args.command(), Command::Run { apply_schema: false });
        assert_eq!(args.workers, None);
    }

    #[test]
    fn parses_enqueue_with_global_workers() {
        let args = Args::try_parse_from([
            "survey-analysis-engine",
            "enqueue",
            "--company",
            "00000000-0000-0000-0000-000000000001",
            "--survey",
            "00000000-0000-0000-0000-000000000002",
            "--start",
            "2026-03-01T00:00:00Z",
            "--end",
            "2026-03-02T00:00:00Z",
            "--workers",
            "3",
        ])
        .unwrap();
        assert_eq!(args.workers, Some(3));
        match args.command() {
            Command::Enqueue { company, start, .. } => {
                assert_eq!(company, Uuid::from_u128(1));
                assert_eq!(start.to_rfc3339(), "2026-03-01T00:00:00+00:00");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_window_bounds() {
        let err = Args::try_parse_from([
            "survey-analysis-engine",
            "enqueue",
            "--company",
            "00000000-0000-0000-0000-000000000001",
            "--survey",
            "00000000-0000-0000-0000-000000000002",
            "--start",
            "yesterday",
            "--end",
            "2026-03-02T00:00:00Z",
        ]);
        assert!(err.is_err());
    }
}
