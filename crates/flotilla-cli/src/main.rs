use anyhow::{Context, bail};
use clap::Parser;
use flotilla_core::app::{Engine, EngineBuilder, RunOptions};
use flotilla_core::config::FlotillaConfig;
use flotilla_core::domain::RunningKwargs;
use flotilla_core::observability::init_tracing;
use flotilla_core::ports::AdmissionLimits;
use serde::Serialize;

mod cli;

use cli::{Args, Commands, StatusArgs, SubmitArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = FlotillaConfig::load(args.config.as_deref()).context("load config")?;
    init_tracing(&config.log).context("init tracing")?;

    if let Commands::Worker {
        concurrency: Some(n),
        ..
    } = &args.command
    {
        config.worker.concurrency = *n;
    }

    let engine = EngineBuilder::new(config).build().await.context("build engine")?;

    match args.command {
        Commands::Master => master(&engine).await,
        Commands::Worker { operator, .. } => worker(&engine, operator.as_deref()).await,
        Commands::Submit(submit_args) => submit(&engine, submit_args).await,
        Commands::Status(status_args) => status(&engine, status_args).await,
        Commands::Redo {
            task,
            filter,
            runner,
        } => {
            let filter = filter.to_filter();
            let runner = runner.unwrap_or_else(default_runner);
            let redo = engine.tasks().redo(task, Some(&filter), &runner).await?;
            print_json(&redo)
        }
        Commands::RefreshCache { operation } => {
            let cache = engine.operations().refresh_cache(operation).await?;
            print_json(&cache)
        }
        Commands::Limits {
            max_queued,
            max_running,
        } => limits(&engine, max_queued, max_running).await,
    }
}

async fn master(engine: &Engine) -> anyhow::Result<()> {
    if engine.config.queue.redis_url.is_none() {
        tracing::warn!("no queue.redis_url: this master only sees tasks submitted in-process");
    }
    let handle = engine.worker_master().spawn();
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutdown requested, waiting for in-flight tasks");
    handle.shutdown_and_join().await;
    Ok(())
}

async fn worker(engine: &Engine, operator: Option<&str>) -> anyhow::Result<()> {
    let source = engine.broker_source(operator)?;
    let group = engine.worker_group(source);
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutdown requested, finishing in-flight hosts");
    group.shutdown_and_join().await;
    Ok(())
}

async fn submit(engine: &Engine, args: SubmitArgs) -> anyhow::Result<()> {
    let kwargs = parse_kwargs(&args.args)?;
    let runner = args.runner.unwrap_or_else(default_runner);
    let task = engine
        .operations()
        .run(
            args.operation,
            &runner,
            kwargs,
            RunOptions {
                use_cache: args.use_cache,
            },
        )
        .await?;
    print_json(&task)
}

async fn status(engine: &Engine, args: StatusArgs) -> anyhow::Result<()> {
    let tasks = engine.tasks();
    if args.codes {
        print_json(&tasks.code_map(args.task).await?)
    } else if args.parse {
        print_json(&tasks.parse(args.task, &args.filter.to_filter()).await?)
    } else {
        print_json(&tasks.get(args.task).await?)
    }
}

async fn limits(
    engine: &Engine,
    max_queued: Option<usize>,
    max_running: Option<usize>,
) -> anyhow::Result<()> {
    if max_queued.is_some() || max_running.is_some() {
        let current = engine.queue.limits().await?;
        let limits = AdmissionLimits {
            max_queued: max_queued.unwrap_or(current.max_queued),
            max_running: max_running.unwrap_or(current.max_running),
        };
        if limits.max_queued == 0 || limits.max_running == 0 {
            bail!("admission limits must be positive");
        }
        engine.queue.set_limits(limits).await?;
    }
    print_json(&engine.queue.stats().await?)
}

/// `KEY=VALUE` pairs; a VALUE that is not valid JSON is kept as a string.
fn parse_kwargs(pairs: &[String]) -> anyhow::Result<RunningKwargs> {
    let mut kwargs = RunningKwargs::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--arg {pair:?} is not KEY=VALUE");
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        kwargs.insert(key.trim().to_string(), value);
    }
    Ok(kwargs)
}

fn default_runner() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli".to_string())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kwargs_parse_json_or_fall_back_to_string() {
        let kwargs = parse_kwargs(&[
            "count=3".to_string(),
            "release=v2".to_string(),
            "flags=[\"a\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(kwargs["count"], json!(3));
        assert_eq!(kwargs["release"], json!("v2"));
        assert_eq!(kwargs["flags"], json!(["a"]));
    }

    #[test]
    fn kwargs_need_an_equals_sign() {
        assert!(parse_kwargs(&["oops".to_string()]).is_err());
    }
}
