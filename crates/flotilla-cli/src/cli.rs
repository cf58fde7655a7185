use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use flotilla_core::app::ResultFilter;
use flotilla_core::domain::{OperationId, TaskId};

#[derive(Parser, Debug)]
#[command(name = "flotilla", about = "Run workflows across a host fleet")]
pub struct Args {
    /// Config file; falls back to $FLOTILLA_CONFIG, then ./flotilla.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pump the queue and archive finished tasks until ctrl-c.
    Master,

    /// Consume a redis-broker operator's dispatch list until ctrl-c.
    Worker {
        /// Operator id; defaults to worker.operator, then default_operator.
        #[arg(long)]
        operator: Option<String>,

        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Run an operation and print the queued task.
    Submit(SubmitArgs),

    /// Print a task, or a filtered view of its results.
    Status(StatusArgs),

    /// Queue a new task re-running some hosts of an existing one.
    Redo {
        task: TaskId,

        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        runner: Option<String>,
    },

    /// Recompute an operation's cached hosts and workflow.
    RefreshCache { operation: OperationId },

    /// Show queue stats; with flags, change the admission limits first.
    Limits {
        #[arg(long)]
        max_queued: Option<usize>,

        #[arg(long)]
        max_running: Option<usize>,
    },
}

#[derive(ClapArgs, Debug)]
pub struct SubmitArgs {
    pub operation: OperationId,

    /// Invoking user; defaults to $USER.
    #[arg(long)]
    pub runner: Option<String>,

    /// KEY=VALUE run-time argument; VALUE is parsed as JSON when it can be.
    #[arg(long = "arg", value_name = "KEY=VALUE")]
    pub args: Vec<String>,

    /// Use the operation's cached hosts and workflow.
    #[arg(long)]
    pub use_cache: bool,
}

#[derive(ClapArgs, Debug)]
pub struct StatusArgs {
    pub task: TaskId,

    /// Print the result-code histogram instead of the task.
    #[arg(long, conflicts_with = "parse")]
    pub codes: bool,

    /// Print `{count, ips, details}` for the hosts matching the filter flags.
    #[arg(long)]
    pub parse: bool,

    #[command(flatten)]
    pub filter: FilterArgs,
}

#[derive(ClapArgs, Debug, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub finished: Option<bool>,

    #[arg(long)]
    pub success: Option<bool>,

    #[arg(long)]
    pub failure: Option<bool>,

    #[arg(long)]
    pub code: Option<i64>,

    /// Seconds.
    #[arg(long)]
    pub cost_gt: Option<f64>,

    /// Seconds.
    #[arg(long)]
    pub cost_lt: Option<f64>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> ResultFilter {
        ResultFilter {
            finished: self.finished,
            success: self.success,
            failure: self.failure,
            code: self.code,
            cost_gt: self.cost_gt,
            cost_lt: self.cost_lt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_collects_repeated_args() {
        let args = Args::try_parse_from([
            "flotilla",
            "submit",
            "op-01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "--arg",
            "release=\"v2\"",
            "--arg",
            "count=3",
            "--use-cache",
        ])
        .unwrap();
        let Commands::Submit(submit) = args.command else {
            panic!("expected submit");
        };
        assert_eq!(submit.args, vec!["release=\"v2\"", "count=3"]);
        assert!(submit.use_cache);
    }

    #[test]
    fn redo_filter_flags_map_to_result_filter() {
        let args = Args::try_parse_from([
            "flotilla",
            "redo",
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "--failure",
            "true",
        ])
        .unwrap();
        let Commands::Redo { filter, .. } = args.command else {
            panic!("expected redo");
        };
        assert_eq!(filter.to_filter(), ResultFilter::failed());
    }

    #[test]
    fn bad_task_id_is_rejected() {
        assert!(Args::try_parse_from(["flotilla", "status", "task-nope"]).is_err());
    }
}
