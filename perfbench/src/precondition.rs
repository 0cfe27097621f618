// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::info;
use pb_util::Privilege;
use std::process::Command;

use crate::device::DevCategory;

/// Two full-device passes bring flash to steady state; the first fills
/// the address space, the second forces garbage collection into its
/// sustained regime.
pub const PASSES: u32 = 2;
const BLOCK_SIZE: &str = "1M";
const IODEPTH: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Ran,
    Skipped(String),
}

/// Destroys all data on the device. Must run against the raw block
/// device before it is formatted so the whole addressable range is
/// conditioned, not just the filesystem's share. Passes are issued
/// through `run` so the caller owns execution and timeout policy.
pub fn precondition(
    dev_path: &str,
    category: DevCategory,
    privilege: Privilege,
    skip_requested: bool,
    run: &mut dyn FnMut(&mut Command) -> Result<()>,
) -> Result<Precondition> {
    if let Some(reason) = skip_reason(category, privilege, skip_requested) {
        info!("precondition: skipping {} ({})", dev_path, &reason);
        return Ok(Precondition::Skipped(reason));
    }

    for pass in 1..=PASSES {
        info!(
            "precondition: {} sequential write pass {}/{}",
            dev_path, pass, PASSES
        );
        run(&mut fio_write_pass(dev_path, pass, privilege))?;
    }
    Ok(Precondition::Ran)
}

fn fio_write_pass(dev_path: &str, pass: u32, privilege: Privilege) -> Command {
    let args = [
        format!("--name=precondition-pass{}", pass),
        format!("--filename={}", dev_path),
        "--rw=write".to_string(),
        format!("--bs={}", BLOCK_SIZE),
        format!("--iodepth={}", IODEPTH),
        "--ioengine=libaio".to_string(),
        "--direct=1".to_string(),
        "--numjobs=1".to_string(),
        "--minimal".to_string(),
    ];

    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg("fio").args(&args);
            cmd
        }
        _ => {
            let mut cmd = Command::new("fio");
            cmd.args(&args);
            cmd
        }
    }
}

pub fn skip_reason(
    category: DevCategory,
    privilege: Privilege,
    skip_requested: bool,
) -> Option<String> {
    if skip_requested {
        return Some("disabled on the command line".into());
    }
    if !privilege.can_mutate() {
        return Some("raw device writes require privilege".into());
    }
    match category {
        DevCategory::Nvme | DevCategory::Ssd | DevCategory::Virtual => None,
        DevCategory::Hdd => Some(
            "rotational media does not reach a distinct steady state; \
             full-device writes would take hours"
                .into(),
        ),
        DevCategory::Unknown => Some("device type unknown".into()),
    }
}
