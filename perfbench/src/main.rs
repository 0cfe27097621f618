// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{error, info, warn};
use pb_util::{init_logging, setup_prog_state, sysfs, unix_now, JsonReportFile, Privilege};
use std::path::PathBuf;
use std::process::exit;

mod args;
mod device;
mod ledger;
mod locate;
mod nic;
mod precondition;
mod pts;
mod run;
mod snapshot;

use args::Mode;
use device::Classifier;
use ledger::Ledger;
use pts::PtsConfig;
use run::{run_all, CpuDriver, NetworkDriver, StorageDriver, CPU_RESOURCE, NETWORK_RESOURCE, NETWORK_TESTS};
use snapshot::EnvSnapshot;

fn write_snapshot(snap: EnvSnapshot, result_id: &Option<String>) {
    let name = match result_id {
        Some(id) => format!("{}-environment.json", id),
        None => format!("{}-environment.json", unix_now()),
    };
    let mut report = JsonReportFile::<EnvSnapshot>::new(&name);
    report.data = snap;
    match report.commit() {
        Ok(()) => info!("environment snapshot saved to {:?}", &name),
        Err(e) => warn!("failed to save environment snapshot ({:#})", &e),
    }
}

fn run(args: args::Args) -> Result<i32> {
    let privilege = Privilege::detect();
    info!("privilege: {:?}", privilege);
    if !privilege.can_mutate() {
        warn!("running unprivileged, kernel tuning and device preparation will be skipped");
    }
    if args.upload && !args.mode.supports_upload() {
        warn!("--upload has no effect, network runs only produce local capture files");
    }

    // Daemon mode holds server processes until interrupted; nothing is
    // measured or recorded on this end.
    if let Mode::Network { server_mode: true, port, .. } = &args.mode {
        run::serve(*port)?;
        return Ok(0);
    }

    let mut ledger = Ledger::default();
    let base_pts = PtsConfig {
        result_name: args.result_name.clone(),
        result_id: args.result_id.clone(),
        timeout: args.tool_timeout,
        ..Default::default()
    };

    match args.mode {
        Mode::Storage {
            targets,
            tests,
            skip_preconditioning,
        } => {
            let mut driver =
                StorageDriver::new(targets, privilege, base_pts, skip_preconditioning, args.upload);
            let snap = EnvSnapshot::capture(
                &Classifier::default(),
                &driver.device_names(),
                &[],
                privilege,
            );
            write_snapshot(snap, &args.result_id);

            let resources = driver.labels();
            run_all(&mut driver, &resources, &tests, &mut ledger);
        }
        Mode::Cpu {
            threads,
            runs,
            tests,
        } => {
            let mut pts = base_pts;
            pts.force_runs = runs;
            pts.force_threads = threads;
            let mut driver = CpuDriver::new(pts, args.upload);

            let snap = EnvSnapshot::capture(&Classifier::default(), &[], &[], privilege);
            write_snapshot(snap, &args.result_id);

            run_all(
                &mut driver,
                &[CPU_RESOURCE.to_string()],
                &tests,
                &mut ledger,
            );
        }
        Mode::Network {
            peer,
            server_mode: _,
            interface,
            nic_speed,
            streams,
            port,
        } => {
            // Argument validation guarantees a peer in client mode.
            let peer = match peer {
                Some(v) => v,
                None => anyhow::bail!("client mode requires --server"),
            };
            let output_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            let ifaces = match interface.clone() {
                Some(name) => vec![name],
                None => sysfs::list_net_interfaces(),
            };
            let snap = EnvSnapshot::capture(&Classifier::default(), &[], &ifaces, privilege);
            write_snapshot(snap, &args.result_id);

            let mut driver = NetworkDriver::new(
                peer,
                port,
                interface,
                nic_speed,
                streams,
                args.result_id.clone(),
                output_dir,
            );
            let tests: Vec<String> = NETWORK_TESTS.iter().map(|t| t.to_string()).collect();
            run_all(
                &mut driver,
                &[NETWORK_RESOURCE.to_string()],
                &tests,
                &mut ledger,
            );
        }
    }

    // The summary and exit status come from the ledger alone, after
    // every resource has been released.
    print!("{}", ledger.format_summary());
    Ok(ledger.exit_code())
}

fn main() {
    setup_prog_state();

    let args = match args::parse() {
        Ok(v) => v,
        Err(e) => {
            init_logging(0);
            error!("{:#}", &e);
            exit(1);
        }
    };
    init_logging(args.verbosity);

    match run(args) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    }
}
