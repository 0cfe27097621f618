// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::info;
use pb_util::run_command_timeout;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

pub const PTS_BIN: &str = "phoronix-test-suite";

// The tool's configuration channel is environment variables. They are
// set on the child only; this process' environment stays clean.
const ENV_INSTALL_ROOT: &str = "PTS_TEST_INSTALL_ROOT_PATH";
const ENV_PRESET_OPTIONS: &str = "PRESET_OPTIONS";
const ENV_FORCE_RUNS: &str = "FORCE_TIMES_TO_RUN";
const ENV_NR_THREADS: &str = "NUM_CPU_CORES";
const ENV_RESULTS_NAME: &str = "TEST_RESULTS_NAME";
const ENV_RESULTS_ID: &str = "TEST_RESULTS_IDENTIFIER";
const ENV_SILENT: &str = "PTS_SILENT_MODE";

#[derive(Debug, Clone, Default)]
pub struct PtsConfig {
    /// Redirects where the tool installs and exercises test payloads.
    /// For storage runs this must point into the target device's mount,
    /// or the test would measure the OS disk instead.
    pub install_root: Option<PathBuf>,
    /// Pre-answered interactive options, "test.option=value" each.
    pub preset_options: Vec<String>,
    /// Fixed statistical run count instead of the tool's adaptive one.
    pub force_runs: Option<u32>,
    /// Thread count override for CPU-bound tests.
    pub force_threads: Option<u32>,
    pub result_name: Option<String>,
    pub result_id: Option<String>,
    /// Benchmark tools can hang; None means wait forever.
    pub timeout: Option<Duration>,
}

impl PtsConfig {
    pub fn results_dir() -> PathBuf {
        let home = env::var_os("HOME").unwrap_or_else(|| "/root".into());
        PathBuf::from(home).join(".phoronix-test-suite/test-results")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(PTS_BIN);
        cmd.args(args).env(ENV_SILENT, "TRUE");

        if let Some(root) = self.install_root.as_ref() {
            cmd.env(ENV_INSTALL_ROOT, root);
        }
        if !self.preset_options.is_empty() {
            cmd.env(ENV_PRESET_OPTIONS, self.preset_options.join(";"));
        }
        if let Some(runs) = self.force_runs {
            cmd.env(ENV_FORCE_RUNS, runs.to_string());
        }
        if let Some(threads) = self.force_threads {
            cmd.env(ENV_NR_THREADS, threads.to_string());
        }
        if let Some(name) = self.result_name.as_ref() {
            cmd.env(ENV_RESULTS_NAME, name);
        }
        if let Some(id) = self.result_id.as_ref() {
            cmd.env(ENV_RESULTS_ID, id);
        }
        cmd
    }

    pub fn install(&self, test: &str) -> Result<()> {
        info!("pts: installing {}", test);
        run_command_timeout(
            &mut self.command(&["batch-install", test]),
            self.timeout,
            "test install failed",
        )
    }

    pub fn run(&self, test: &str) -> Result<()> {
        info!("pts: running {}", test);
        run_command_timeout(
            &mut self.command(&["batch-run", test]),
            self.timeout,
            "test run failed",
        )
    }

    pub fn upload(&self, result: &str) -> Result<()> {
        info!("pts: uploading {}", result);
        run_command_timeout(
            &mut self.command(&["upload-result", result]),
            self.timeout,
            "result upload failed",
        )
    }
}

/// Move a located artifact to its stable per-run name. Refuses to
/// clobber an existing result.
pub fn rename_result(results_dir: &Path, from: &str, to: &str) -> Result<()> {
    let src = results_dir.join(from);
    let dst = results_dir.join(to);
    if dst.exists() {
        bail!("result {:?} already exists", &dst);
    }
    fs::rename(&src, &dst)?;
    info!("pts: result {:?} -> {:?}", from, to);
    Ok(())
}

/// Short name used in composed result names: last path-ish component,
/// version suffix dropped ("pts/compress-7zip-1.11.0" -> "compress-7zip").
pub fn test_short_name(test: &str) -> String {
    let base = test.rsplit('/').next().unwrap_or(test);
    let is_version = |s: &str| {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
    };
    let trimmed = match base.rfind('-') {
        Some(idx) if is_version(&base[idx + 1..]) => &base[..idx],
        _ => base,
    };
    trimmed.to_string()
}
