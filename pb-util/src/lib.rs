// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::info;
use simplelog as sl;
use std::collections::HashMap;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod json_file;
pub mod sysfs;

pub use json_file::{JsonLoad, JsonReportFile, JsonSave};

lazy_static::lazy_static! {
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
    pub static ref PAGE_SIZE: usize = ::page_size::get();
}

pub fn nr_cpus() -> usize {
    *NR_SYSTEM_CPUS
}

/// Whether this process may mutate kernel state and raw block devices.
/// Detected once at startup and passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Root,
    Sudo,
    Unprivileged,
}

impl Privilege {
    pub fn detect() -> Self {
        if unsafe { libc::geteuid() } == 0 {
            return Self::Root;
        }
        // Passwordless elevation counts. "sudo -n" never prompts.
        match Command::new("sudo")
            .args(&["-n", "true"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(rc) if rc.success() => Self::Sudo,
            _ => Self::Unprivileged,
        }
    }

    pub fn can_mutate(&self) -> bool {
        *self != Self::Unprivileged
    }
}

fn format_size_internal<T>(size: T, zero: &str) -> String
where
    T: num::ToPrimitive,
{
    let format_size_helper = |size: u64, shift: u32, suffix: &str| -> Option<String> {
        let unit: u64 = 1 << shift;

        if (size as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (size as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (size as f64 / unit as f64) < 1024.0 {
            Some(format!("{:.0}{}", size as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let size = size.to_u64().unwrap();

    if size == 0 {
        zero.to_string()
    } else if size < 9999 {
        format!("{}", size)
    } else {
        format_size_helper(size, 10, "K")
            .or_else(|| format_size_helper(size, 20, "M"))
            .or_else(|| format_size_helper(size, 30, "G"))
            .or_else(|| format_size_helper(size, 40, "P"))
            .or_else(|| format_size_helper(size, 50, "E"))
            .unwrap_or_else(|| "INF".into())
    }
}

pub fn format_size<T>(size: T) -> String
where
    T: num::ToPrimitive,
{
    format_size_internal(size, "0")
}

fn format_duration_internal(dur: f64, zero: &str) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some(zero.to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(0), 1000, "n")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(3), 1000, "u"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24 * 365, 1000, "Y"))
        .unwrap_or_else(|| "INF".into())
}

pub fn format_duration(dur: f64) -> String {
    format_duration_internal(dur, "0")
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
            ('Y', 3600.0 * 24.0 * 365.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num.trim().parse::<f64>()? * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num.trim().parse::<f64>()?;
    }
    Ok(sum)
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().unwrap().as_secs()
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            sl::SimpleLogger::init(sl_level, lcfg.build()).unwrap();
        }
    }
}

/// Run to completion and fail on non-zero exit. Benchmark installs and
/// runs block indefinitely by default; pass a timeout for tools which
/// are known to hang.
pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    run_command_timeout(cmd, None, emsg)
}

pub fn run_command_timeout(
    cmd: &mut Command,
    timeout: Option<Duration>,
    emsg: &str,
) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", &cmd_str))?;
    let expires = timeout.map(|t| SystemTime::now() + t);

    loop {
        match child.try_wait()? {
            Some(rc) if rc.success() => return Ok(()),
            Some(rc) => bail!("{} ({:?}): {}", &cmd_str, &rc, emsg),
            None => {}
        }

        if prog_exiting() {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{}: interrupted", &cmd_str);
        }

        if let Some(exp) = expires.as_ref() {
            if SystemTime::now() >= *exp {
                let _ = child.kill();
                let _ = child.wait();
                bail!(
                    "{}: timed out after {}",
                    &cmd_str,
                    format_duration(timeout.unwrap().as_secs_f64())
                );
            }
        }

        wait_prog_state(Duration::from_millis(100));
    }
}

/// Capture stdout of a best-effort probe command (ethtool, dmidecode).
pub fn command_stdout(cmd: &mut Command) -> Result<String> {
    let cmd_str = format!("{:?}", &cmd);
    let output = cmd
        .stderr(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {}", &cmd_str))?;
    if !output.status.success() {
        bail!("{} ({:?})", &cmd_str, &output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

struct GlobalProgState {
    exiting: bool,
}

lazy_static::lazy_static! {
    static ref PROG_STATE: Mutex<GlobalProgState> =
        Mutex::new(GlobalProgState { exiting: false });
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_STATE.lock().unwrap().exiting = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    PROG_STATE.lock().unwrap().exiting
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

pub fn wait_prog_state(dur: Duration) -> ProgState {
    let state = PROG_STATE.lock().unwrap();
    if state.exiting {
        return ProgState::Exiting;
    }
    let (state, _) = PROG_WAITQ.wait_timeout(state, dur).unwrap();
    match state.exiting {
        true => ProgState::Exiting,
        false => ProgState::Running,
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.000003932, "3.9u"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
            (60480000.0, "1.9Y"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
            println!("{} -> {} ({})", pair.0, &result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0000039, "3.9u"),
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (2040.0, "34.0M"),
            (1.27, "1.27"),
            (1.37, "100m1.27"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert_eq!(pair.0, result);
            println!("{} -> {} ({})", pair.1, result, pair.0);
        }
    }

    #[test]
    fn test_format_size() {
        for pair in &[(0u64, "0"), (4096, "4096"), (10240, "10.0K"), (1 << 20, "1.0M")] {
            assert_eq!(&super::format_size(pair.0), pair.1);
        }
    }
}
