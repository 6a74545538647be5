use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;

use atf_harness::runner::UNPRIVILEGED_USER_VAR;
use atf_harness::{ConfigVars, HarnessConfig};

type Result<T> = color_eyre::eyre::Result<T>;

/// Environment variable naming the default work directory root.
pub const WORKDIR_ENV: &str = "ATF_WORKDIR";

/// Runs ATF test programs and reports their results
#[derive(Parser, Debug)]
#[command(name = "atf-harness")]
#[command(about = "Runs ATF test programs and reports their results")]
#[command(version)]
pub struct Cli {
    /// Configuration variable passed to every test program (repeatable)
    #[arg(short = 'v', long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Directory in which test case work directories are created
    /// (default: $ATF_WORKDIR or the system temporary directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// User to run test cases requiring an unprivileged user as
    #[arg(long)]
    pub unprivileged_user: Option<String>,

    /// Test programs to run
    #[arg(required = true)]
    pub programs: Vec<PathBuf>,
}

fn parse_var(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{arg}'")),
    }
}

/// Runtime configuration of the harness binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Test programs, in the order they run
    pub programs: Vec<PathBuf>,
    /// Harness configuration shared by every test program
    pub harness: HarnessConfig,
}

impl Config {
    /// Validate command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let workdir_root = cli
            .workdir
            .or_else(|| std::env::var_os(WORKDIR_ENV).map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir);
        if !workdir_root.is_dir() {
            return Err(eyre!(
                "Invalid work directory '{}': not a directory",
                workdir_root.display()
            ));
        }

        let mut vars: ConfigVars = cli.vars.into_iter().collect();
        if let Some(user) = cli.unprivileged_user {
            vars.insert(UNPRIVILEGED_USER_VAR.to_string(), user);
        }

        for program in &cli.programs {
            if !program.is_file() {
                return Err(eyre!("Invalid test program '{}': not a file", program.display()));
            }
        }

        Ok(Config {
            programs: cli.programs,
            harness: HarnessConfig { workdir_root, vars },
        })
    }
}
