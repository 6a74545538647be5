use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tempfile::TempDir;

/// Path of the harness binary built for these tests
pub const HARNESS_BINARY: &str = env!("CARGO_BIN_EXE_atf-harness");

struct CaseDefinition {
    name: String,
    properties: Vec<(String, String)>,
    body: String,
    cleanup: Option<String>,
}

/// Builder for a shell-script ATF test program.
///
/// Case bodies are shell snippets. They see `$results` (the results file),
/// `$srcdir`, and each `-v key=value` variable as `$var_key`.
pub struct TestProgram {
    dir: TempDir,
    cases: Vec<CaseDefinition>,
    raw_listing: Option<String>,
}

impl TestProgram {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self {
            dir,
            cases: Vec::new(),
            raw_listing: None,
        })
    }

    /// Adds a test case with the given body
    pub fn case(mut self, name: &str, body: &str) -> Self {
        self.cases.push(CaseDefinition {
            name: name.to_string(),
            properties: Vec::new(),
            body: body.to_string(),
            cleanup: None,
        });
        self
    }

    /// Sets a metadata property on the most recently added case
    pub fn property(mut self, name: &str, value: &str) -> Self {
        if let Some(case) = self.cases.last_mut() {
            case.properties.push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Gives the most recently added case a cleanup routine
    pub fn cleanup(mut self, body: &str) -> Self {
        if let Some(case) = self.cases.last_mut() {
            case.properties.push(("has.cleanup".to_string(), "true".to_string()));
            case.cleanup = Some(body.to_string());
        }
        self
    }

    /// Replaces the generated `-l` output with `listing`
    pub fn raw_listing(mut self, listing: &str) -> Self {
        self.raw_listing = Some(listing.to_string());
        self
    }

    fn listing(&self) -> String {
        if let Some(raw) = &self.raw_listing {
            let mut raw = raw.clone();
            if !raw.ends_with('\n') {
                raw.push('\n');
            }
            return raw;
        }
        let mut listing = String::from("Content-Type: application/X-atf-tp; version=\"1\"\n");
        for case in &self.cases {
            let _ = write!(listing, "\nident: {}\n", case.name);
            for (name, value) in &case.properties {
                let _ = writeln!(listing, "{name}: {value}");
            }
        }
        listing
    }

    fn script(&self) -> String {
        let mut script = String::from("#!/bin/sh\n");
        let _ = write!(
            script,
            "if [ \"$1\" = \"-l\" ]; then\ncat <<'__LISTING__'\n{}__LISTING__\nexit 0\nfi\n",
            self.listing()
        );
        script.push_str(concat!(
            "results=\n",
            "srcdir=\n",
            "tc=\n",
            "for arg in \"$@\"; do\n",
            "    case \"$arg\" in\n",
            "        -r*) results=\"${arg#-r}\" ;;\n",
            "        -s*) srcdir=\"${arg#-s}\" ;;\n",
            "        -v*) kv=\"${arg#-v}\"; export \"var_${kv%%=*}=${kv#*=}\" ;;\n",
            "        *) tc=\"$arg\" ;;\n",
            "    esac\n",
            "done\n",
            "case \"$tc\" in\n",
        ));
        for case in &self.cases {
            let _ = write!(script, "{}:body)\n{}\nexit 0\n;;\n", case.name, case.body);
            if let Some(cleanup) = &case.cleanup {
                let _ = write!(script, "{}:cleanup)\n{}\nexit 0\n;;\n", case.name, cleanup);
            }
        }
        script.push_str("esac\necho \"unknown test case $tc\" >&2\nexit 100\n");
        script
    }

    /// Writes the program to disk
    pub fn build(self) -> Result<BuiltProgram> {
        let path = self.dir.path().join("test_program");
        fs::write(&path, self.script()).context("Failed to write test program")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        let workdir_root = self.dir.path().join("work");
        fs::create_dir(&workdir_root)?;

        Ok(BuiltProgram {
            dir: self.dir,
            path,
            workdir_root,
        })
    }
}

/// A test program on disk, with a private work directory root
pub struct BuiltProgram {
    dir: TempDir,
    path: PathBuf,
    workdir_root: PathBuf,
}

impl BuiltProgram {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch space next to the program, for marker files and the like
    pub fn scratch(&self) -> &Path {
        self.dir.path()
    }

    pub fn workdir_root(&self) -> &Path {
        &self.workdir_root
    }

    fn harness_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(HARNESS_BINARY);
        cmd.arg("--workdir")
            .arg(&self.workdir_root)
            .args(args)
            .arg(&self.path)
            .env("RUST_LOG", "debug")
            .stdin(Stdio::null());
        cmd
    }

    /// Runs the harness binary on this program and collects its output
    pub fn run_harness(&self, args: &[&str]) -> Result<HarnessOutput> {
        let output = self
            .harness_command(args)
            .output()
            .context("Failed to run atf-harness")?;
        Ok(HarnessOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Starts the harness binary without waiting for it
    pub fn spawn_harness(&self, args: &[&str]) -> Result<Child> {
        self.harness_command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn atf-harness")
    }
}

/// What a harness run printed and how it exited
pub struct HarnessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl HarnessOutput {
    /// `tc-end` records without their timestamps: `name, state[, reason]`
    pub fn tc_ends(&self) -> Vec<String> {
        records(&self.stdout, "tc-end: ")
    }

    /// `tp-end` records without their timestamps: `path[, reason]`
    pub fn tp_ends(&self) -> Vec<String> {
        records(&self.stdout, "tp-end: ")
    }
}

fn records(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(prefix))
        .map(|rest| rest.split_once(", ").map_or(rest, |(_, rest)| rest).to_string())
        .collect()
}
