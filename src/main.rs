use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use benchrun::anthropic::AnthropicClient;
use benchrun::cli::{Cli, Command, RunArgs, Selection};
use benchrun::config::BenchConfig;
use benchrun::dispatcher::Dispatcher;
use benchrun::error::BenchError;
use benchrun::sink::{JsonlResultSink, ResultSink, WriteMode, model_dir_name};
use benchrun::source::{Catalogue, load_exclusions, load_run_ids, pending};
use benchrun::ui::{self, RunProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = BenchConfig::load_from(&cli.config)?;
    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Status(selection) => status(config, &selection),
    }
}

/// Logs go to stderr. `BENCHRUN_LOG` wins over `RUST_LOG`, which wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let filter = std::env::var("BENCHRUN_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "benchrun=debug" } else { "benchrun=warn" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .compact(),
        )
        .init();
}

/// Applies directory overrides and resolves the model name.
fn apply_selection(config: &mut BenchConfig, selection: &Selection) -> Result<String> {
    if let Some(dir) = &selection.catalogue {
        config.catalogue_dir = dir.clone();
    }
    if let Some(dir) = &selection.result_dir {
        config.result_dir = dir.clone();
    }
    selection
        .model
        .clone()
        .or_else(|| config.model.clone())
        .context("no model given; pass --model or set `model` in benchrun.toml")
}

async fn run(mut config: BenchConfig, args: RunArgs) -> Result<()> {
    let model = apply_selection(&mut config, &args.selection)?;
    if let Some(threads) = args.threads {
        config.pool_size = threads;
    }
    config.validate()?;

    let mut catalogue = Catalogue::load(&config.catalogue_dir, &args.selection.categories)?;
    let mut mode = if args.allow_overwrite || !config.resume_mode {
        WriteMode::Overwrite
    } else {
        WriteMode::Append
    };
    if let Some(path) = &args.run_ids {
        catalogue = catalogue.restrict_to(&load_run_ids(path)?);
        mode = WriteMode::Overwrite;
        println!("Running specific test cases from {}", path.display());
    }
    if let Some(path) = &args.exclude {
        catalogue = catalogue.exclude(&load_exclusions(path)?);
    }

    let sink = Arc::new(JsonlResultSink::open(&config.result_dir, &model, mode)?);
    let existing = if config.resume_mode && !args.allow_overwrite {
        sink.completed_ids()?
    } else {
        HashSet::new()
    };
    let jobs = pending(catalogue.into_jobs(), &existing);
    if jobs.is_empty() {
        println!(
            "All selected test cases have been previously generated for {model}. Nothing to do."
        );
        return Ok(());
    }
    println!(
        "Generating {} results for {model} ({} already present)",
        jobs.len(),
        existing.len()
    );

    let client = Arc::new(AnthropicClient::with_base_url(
        config.api_key.clone(),
        model.clone(),
        config.endpoint.clone(),
    )?);
    let dispatcher = Dispatcher::new(config.dispatch_config(), config.retry_policy());
    let progress = RunProgress::new(&model, config.reporter_config());

    match dispatcher.run(jobs, client, sink, progress).await {
        Ok(summary) => {
            ui::print_summary(&summary);
            Ok(())
        }
        Err(err @ BenchError::SinkWrite { .. }) => {
            tracing::error!(error = %err, "result sink failed");
            eprintln!(
                "{} {err}",
                Style::new()
                    .red()
                    .bold()
                    .apply_to("CRITICAL: failed to persist result, aborting run.")
            );
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn status(mut config: BenchConfig, selection: &Selection) -> Result<()> {
    let model = apply_selection(&mut config, selection)?;
    let catalogue = Catalogue::load(&config.catalogue_dir, &selection.categories)?;
    let completed = JsonlResultSink::scan(&config.result_dir, &model)?;

    let done_style = Style::new().green();
    let todo_style = Style::new().yellow();
    println!(
        "Results for {model} in {}",
        config.result_dir.join(model_dir_name(&model)).display()
    );
    for category in catalogue.categories() {
        let jobs = catalogue.jobs_in(category);
        let done = completed
            .get(category)
            .map(|ids| jobs.iter().filter(|j| ids.contains(&j.id)).count())
            .unwrap_or(0);
        let style = if done == jobs.len() { &done_style } else { &todo_style };
        println!(
            "  {category}: {}",
            style.apply_to(format!("{done}/{} complete", jobs.len()))
        );
    }
    Ok(())
}
