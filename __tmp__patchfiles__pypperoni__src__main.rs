// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{BuildArgs, CheckArgs, Cli, Command};
use pypperoni_packaging::bytecode_compiler::UnavailableCompiler;
use pypperoni_packaging::config::{ImportAliasPolicy, TranspileConfig};
use pypperoni_packaging::module_graph::{ModuleGraph, NullHostResolver};
use pypperoni_packaging::orchestrator;
use std::sync::Mutex;

fn main() {
    let cli = Cli::parse();
    let level = logging::level_from_verbosity(cli.verbose, cli.quiet);
    let logger_context = logging::logger_from_env(level);
    let logger = logger_context.logger;

    let result = match &cli.command {
        Command::Build(args) => run_build(args, &logger),
        Command::Check(args) => run_check(args, &logger),
    };

    if let Err(err) = result {
        slog::error!(logger, "{:#}", err);
        std::process::exit(1);
    }
}

fn ingest_paths(graph: &mut ModuleGraph, paths: &[std::path::PathBuf], main_name: &Option<String>) -> Result<()> {
    for (i, path) in paths.iter().enumerate() {
        let is_main = i == 0
            && (main_name.is_none()
                || main_name.as_deref() == path.file_stem().and_then(|s| s.to_str()));

        if path.is_dir() {
            graph
                .add_tree(path)
                .with_context(|| format!("ingesting directory {}", path.display()))?;
        } else {
            let name = main_name.clone().filter(|_| is_main);
            graph
                .add_file(path, name, is_main)
                .with_context(|| format!("ingesting file {}", path.display()))?;
        }
    }
    graph.generate_codecs_index().context("generating codecs_index")?;
    Ok(())
}

fn run_build(args: &BuildArgs, logger: &slog::Logger) -> Result<()> {
    let mut aliases = ImportAliasPolicy::default();
    for (from, to) in &args.aliases {
        aliases.insert(from.clone(), to.clone());
    }

    let mut config = TranspileConfig::new(args.project.clone(), args.out_dir.clone());
    config.aliases = aliases;
    if let Some(v) = args.max_file_size {
        config.max_file_size = v;
    }
    if let Some(v) = args.split_interval {
        config.split_interval = v;
    }
    if let Some(v) = args.workers {
        config.worker_count = v;
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count)
        .build()
        .context("building worker pool")?;

    let mut graph = ModuleGraph::new(config.aliases.clone());
    ingest_paths(&mut graph, &args.paths, &args.main)?;

    let compiler: Mutex<dyn pypperoni_packaging::bytecode_compiler::PythonBytecodeCompiler + Send> =
        Mutex::new(UnavailableCompiler);
    let reporter = logging::SlogProgressReporter { logger: logger.clone() };

    let entries = pool.install(|| {
        orchestrator::build(&mut graph, &config, &compiler, &NullHostResolver, &reporter)
    })?;

    slog::info!(logger, "wrote manifest with {} module(s)", entries.len());
    Ok(())
}

fn run_check(args: &CheckArgs, logger: &slog::Logger) -> Result<()> {
    let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
    ingest_paths(&mut graph, &args.paths, &args.main)?;
    graph.reduce(&NullHostResolver).context("reducing module graph")?;

    for module in graph.modules() {
        slog::info!(logger, "{} (id={})", module.name, module.id());
    }
    Ok(())
}

