// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use clap::{App, AppSettings, ArgMatches, SubCommand};
use pb_util::parse_duration;
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use crate::run::StorageTarget;

const DEFAULT_STORAGE_TESTS: &str = "pts/fio";
const DEFAULT_CPU_TESTS: &str = "pts/compress-7zip,pts/stream";
const DEFAULT_PORT: u16 = 5201;

#[derive(Debug)]
pub struct Args {
    pub verbosity: u32,
    pub result_name: Option<String>,
    pub result_id: Option<String>,
    pub upload: bool,
    pub tool_timeout: Option<Duration>,
    pub mode: Mode,
}

#[derive(Debug)]
pub enum Mode {
    Storage {
        targets: Vec<StorageTarget>,
        tests: Vec<String>,
        skip_preconditioning: bool,
    },
    Cpu {
        threads: Option<u32>,
        runs: Option<u32>,
        tests: Vec<String>,
    },
    Network {
        peer: Option<String>,
        server_mode: bool,
        interface: Option<String>,
        nic_speed: Option<u64>,
        streams: Option<u32>,
        port: u16,
    },
}

impl Mode {
    /// Network runs capture tool stdout to local files; there is no
    /// result archive for --upload to act on.
    pub fn supports_upload(&self) -> bool {
        !matches!(self, Mode::Network { .. })
    }
}

fn cli_app() -> App<'static, 'static> {
    App::new("perfbench")
        .version(clap::crate_version!())
        .about("Benchmark orchestration for storage, CPU/memory and network")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .args_from_usage(
            "-v... 'Increase verbosity, can be repeated'
             --result-name [NAME] 'Name recorded on results'
             --result-id [ID] 'Identifier recorded on results'
             --upload 'Upload each result after its run'
             --tool-timeout [DURATION] 'Abort a hung external tool after this long (e.g. 90m)'",
        )
        .subcommand(
            SubCommand::with_name("storage")
                .about("Benchmark block devices, one at a time")
                .args_from_usage(
                    "--disk [SPEC]... 'Target device as device;label'
                     --disk-file [FILE] 'File of device;label lines, #-comments allowed'
                     --tests [LIST] 'Comma-separated test identifiers'
                     --skip-preconditioning 'Skip the steady-state write passes'",
                ),
        )
        .subcommand(
            SubCommand::with_name("cpu")
                .about("Benchmark CPU and memory")
                .args_from_usage(
                    "--threads [N] 'Thread count, at most the detected CPU count'
                     --runs [N] 'Fixed number of statistical runs per test'
                     --tests [LIST] 'Comma-separated test identifiers'",
                ),
        )
        .subcommand(
            SubCommand::with_name("network")
                .about("Benchmark the network path to a peer")
                .args_from_usage(
                    "--server [ADDR] 'Peer address, client mode'
                     --server-mode 'Run the server daemons until interrupted'
                     --interface [NAME] 'Interface under test'
                     --nic-speed [MBPS] 'Override the detected link speed'
                     --streams [N] 'Override the derived stream count'
                     --port [N] 'Server port'",
                ),
        )
}

pub fn parse() -> Result<Args> {
    args_from_matches(&cli_app().get_matches())
}

fn args_from_matches(matches: &ArgMatches) -> Result<Args> {
    let result_name = matches.value_of("result-name").map(str::to_string);
    let result_id = matches.value_of("result-id").map(str::to_string);
    let upload = matches.is_present("upload");
    if result_name.is_some() != result_id.is_some() {
        bail!("--result-name and --result-id must be given together");
    }
    if upload && result_name.is_none() {
        bail!("--upload requires --result-name and --result-id");
    }

    let tool_timeout = match matches.value_of("tool-timeout") {
        Some(v) => Some(Duration::from_secs_f64(parse_duration(v)?)),
        None => None,
    };

    let mode = match matches.subcommand() {
        ("storage", Some(sub)) => storage_mode(sub)?,
        ("cpu", Some(sub)) => cpu_mode(sub, pb_util::nr_cpus())?,
        ("network", Some(sub)) => network_mode(sub)?,
        _ => bail!("a subcommand is required"),
    };

    Ok(Args {
        verbosity: matches.occurrences_of("v") as u32,
        result_name,
        result_id,
        upload,
        tool_timeout,
        mode,
    })
}

fn storage_mode(matches: &ArgMatches) -> Result<Mode> {
    let mut targets = Vec::new();
    if let Some(specs) = matches.values_of("disk") {
        for spec in specs {
            targets.push(parse_disk_spec(spec)?);
        }
    }
    if let Some(path) = matches.value_of("disk-file") {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading disk file {:?}", path))?;
        targets.extend(parse_disk_file(&content)?);
    }
    if targets.is_empty() {
        bail!("no target disks, use --disk or --disk-file");
    }
    validate_labels(&targets)?;

    Ok(Mode::Storage {
        targets,
        tests: test_list(matches, DEFAULT_STORAGE_TESTS),
        skip_preconditioning: matches.is_present("skip-preconditioning"),
    })
}

fn cpu_mode(matches: &ArgMatches, nr_cpus: usize) -> Result<Mode> {
    let threads = match matches.value_of("threads") {
        Some(v) => {
            let n: u32 = v.parse().with_context(|| format!("bad --threads {:?}", v))?;
            if n == 0 || n as usize > nr_cpus {
                bail!("--threads {} outside 1..={} detected CPUs", n, nr_cpus);
            }
            Some(n)
        }
        None => None,
    };
    let runs = match matches.value_of("runs") {
        Some(v) => Some(v.parse::<u32>().with_context(|| format!("bad --runs {:?}", v))?),
        None => None,
    };

    Ok(Mode::Cpu {
        threads,
        runs,
        tests: test_list(matches, DEFAULT_CPU_TESTS),
    })
}

fn network_mode(matches: &ArgMatches) -> Result<Mode> {
    let peer = matches.value_of("server").map(str::to_string);
    let server_mode = matches.is_present("server-mode");
    // Exactly one role per invocation.
    if peer.is_some() == server_mode {
        bail!("exactly one of --server and --server-mode is required");
    }

    let nic_speed = match matches.value_of("nic-speed") {
        Some(v) => Some(
            v.parse::<u64>()
                .with_context(|| format!("bad --nic-speed {:?}", v))?,
        ),
        None => None,
    };
    let streams = match matches.value_of("streams") {
        Some(v) => Some(
            v.parse::<u32>()
                .with_context(|| format!("bad --streams {:?}", v))?,
        ),
        None => None,
    };
    let port = match matches.value_of("port") {
        Some(v) => v.parse::<u16>().with_context(|| format!("bad --port {:?}", v))?,
        None => DEFAULT_PORT,
    };

    Ok(Mode::Network {
        peer,
        server_mode,
        interface: matches.value_of("interface").map(str::to_string),
        nic_speed,
        streams,
        port,
    })
}

fn parse_disk_spec(spec: &str) -> Result<StorageTarget> {
    let (dev, label) = spec
        .split_once(';')
        .ok_or_else(|| anyhow!("disk spec {:?} not in device;label form", spec))?;
    if dev.is_empty() || label.is_empty() {
        bail!("disk spec {:?} has an empty device or label", spec);
    }
    Ok(StorageTarget {
        dev_path: dev.to_string(),
        label: label.to_string(),
    })
}

fn parse_disk_file(content: &str) -> Result<Vec<StorageTarget>> {
    let mut targets = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        targets.push(parse_disk_spec(line)?);
    }
    Ok(targets)
}

/// Labels derive mount points and result names, so a duplicate would
/// silently merge two devices' artifacts.
fn validate_labels(targets: &[StorageTarget]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(&target.label) {
            bail!("duplicate disk label {:?}", &target.label);
        }
    }
    Ok(())
}

fn test_list(matches: &ArgMatches, default: &str) -> Vec<String> {
    matches
        .value_of("tests")
        .unwrap_or(default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_cmdline(argv: &[&str]) -> Result<Args> {
        let matches = cli_app().get_matches_from_safe(argv)?;
        args_from_matches(&matches)
    }

    #[test]
    fn test_storage_disks() {
        let args = parse_cmdline(&[
            "perfbench",
            "storage",
            "--disk",
            "/dev/sdb;L1",
            "--disk",
            "/dev/sdc;L2",
        ])
        .unwrap();
        match args.mode {
            Mode::Storage { targets, tests, .. } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[0].dev_path, "/dev/sdb");
                assert_eq!(targets[0].label, "L1");
                assert_eq!(tests, vec!["pts/fio"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Malformed spec, duplicate label, no disks at all.
        assert!(parse_cmdline(&["perfbench", "storage", "--disk", "/dev/sdb"]).is_err());
        assert!(parse_cmdline(&[
            "perfbench", "storage", "--disk", "/dev/sdb;L1", "--disk", "/dev/sdc;L1",
        ])
        .is_err());
        assert!(parse_cmdline(&["perfbench", "storage"]).is_err());
    }

    #[test]
    fn test_disk_file_format() {
        let targets = parse_disk_file(
            "# fleet disks\n\
             /dev/sdb;L1\n\
             \n\
             /dev/nvme0n1;N1\n",
        )
        .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].label, "N1");

        assert!(parse_disk_file("/dev/sdb\n").is_err());
    }

    #[test]
    fn test_upload_pairing() {
        let base = ["perfbench", "storage", "--disk", "/dev/sdb;L1"];

        let mut argv = vec!["perfbench", "--upload"];
        argv.extend(&base[1..]);
        assert!(parse_cmdline(&argv).is_err());

        let mut argv = vec!["perfbench", "--result-name", "nightly"];
        argv.extend(&base[1..]);
        assert!(parse_cmdline(&argv).is_err());

        let mut argv = vec![
            "perfbench",
            "--upload",
            "--result-name",
            "nightly",
            "--result-id",
            "run-7",
        ];
        argv.extend(&base[1..]);
        let args = parse_cmdline(&argv).unwrap();
        assert!(args.upload);
        assert_eq!(args.result_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn test_upload_applicability() {
        let args = parse_cmdline(&[
            "perfbench",
            "--upload",
            "--result-name",
            "nightly",
            "--result-id",
            "run-7",
            "storage",
            "--disk",
            "/dev/sdb;L1",
        ])
        .unwrap();
        assert!(args.mode.supports_upload());

        let args = parse_cmdline(&[
            "perfbench",
            "--upload",
            "--result-name",
            "nightly",
            "--result-id",
            "run-7",
            "network",
            "--server",
            "peer1",
        ])
        .unwrap();
        assert!(!args.mode.supports_upload());
    }

    #[test]
    fn test_network_role_xor() {
        assert!(parse_cmdline(&["perfbench", "network"]).is_err());
        assert!(parse_cmdline(&[
            "perfbench",
            "network",
            "--server",
            "peer1",
            "--server-mode",
        ])
        .is_err());

        match parse_cmdline(&["perfbench", "network", "--server", "peer1"])
            .unwrap()
            .mode
        {
            Mode::Network { peer, server_mode, port, .. } => {
                assert_eq!(peer.as_deref(), Some("peer1"));
                assert!(!server_mode);
                assert_eq!(port, DEFAULT_PORT);
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse_cmdline(&["perfbench", "network", "--server-mode", "--port", "5555"])
            .unwrap()
            .mode
        {
            Mode::Network { peer, server_mode, port, .. } => {
                assert_eq!(peer, None);
                assert!(server_mode);
                assert_eq!(port, 5555);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_threads_validation() {
        let matches = cli_app()
            .get_matches_from_safe(vec!["perfbench", "cpu", "--threads", "4"])
            .unwrap();
        let (_, sub) = matches.subcommand();
        let sub = sub.unwrap();

        assert!(cpu_mode(sub, 2).is_err());
        match cpu_mode(sub, 8).unwrap() {
            Mode::Cpu { threads, .. } => assert_eq!(threads, Some(4)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tool_timeout() {
        let args = parse_cmdline(&[
            "perfbench",
            "--tool-timeout",
            "90m",
            "storage",
            "--disk",
            "/dev/sdb;L1",
        ])
        .unwrap();
        assert_eq!(args.tool_timeout, Some(Duration::from_secs(5400)));
    }
}
