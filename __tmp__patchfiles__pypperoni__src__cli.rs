// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Command-line argument definitions. */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pypperoni", about = "Ahead-of-time Python-to-C transpiler")]
pub struct Cli {
    /// Increase logging verbosity (stack to raise further).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Decrease logging verbosity (stack to lower further).
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Transpile a set of Python sources into generated C plus a CMake project.
    Build(BuildArgs),
    /// Build the module graph and report the reduced module set without
    /// generating any code.
    Check(CheckArgs),
}

#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Name of the generated project, used in the CMakeLists.txt.
    #[arg(long)]
    pub project: String,

    /// Output directory for generated C sources and the CMake project.
    #[arg(long = "out")]
    pub out_dir: PathBuf,

    /// Name of the main module. Defaults to the stem of the first path if omitted.
    #[arg(long)]
    pub main: Option<String>,

    /// Maximum bytes per generated `.c` file part before splitting.
    #[arg(long = "max-file-size")]
    pub max_file_size: Option<u64>,

    /// Maximum instructions per chunk before a code object is split.
    #[arg(long = "split-interval")]
    pub split_interval: Option<usize>,

    /// Number of parallel lowering workers.
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Import alias in `FROM=TO` form; may be repeated.
    #[arg(long = "alias", value_parser = parse_alias)]
    pub aliases: Vec<(String, String)>,

    /// Python source files, directories (added as a preserved tree), to ingest.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Name of the main module. Defaults to the stem of the first path if omitted.
    #[arg(long)]
    pub main: Option<String>,

    /// Python source files or directories to ingest.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

fn parse_alias(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((from, to)) => Ok((from.to_string(), to.to_string())),
        None => Err(format!("expected FROM=TO, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alias_valid() {
        assert_eq!(parse_alias("a=b").unwrap(), ("a".to_string(), "b".to_string()));
    }

    #[test]
    fn test_parse_alias_invalid() {
        assert!(parse_alias("noequals").is_err());
    }

    #[test]
    fn test_build_args_parse() {
        let cli = Cli::parse_from([
            "pypperoni",
            "build",
            "--project",
            "demo",
            "--out",
            "out",
            "src/m.py",
        ]);
        match cli.command {
            Command::Build(args) => {
                assert_eq!(args.project, "demo");
                assert_eq!(args.paths, vec![PathBuf::from("src/m.py")]);
            }
            _ => panic!("expected Build"),
        }
    }
}


