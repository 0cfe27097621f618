// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use glob::glob;
use log::trace;
use proc_mounts::MountList;
use scan_fmt::scan_fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{read_one_line, run_command, Privilege};

pub const SYSFS_BLOCK: &str = "/sys/block";
pub const SYSFS_NET: &str = "/sys/class/net";

pub fn read_sys_attr<P: AsRef<Path>>(path: P) -> Result<String> {
    Ok(fs::read_to_string(path.as_ref())?.trim_end().to_string())
}

/// Write a kernel attribute file. Writing sysfs/procfs requires root
/// proper; with passwordless sudo the write is routed through it.
pub fn write_sys_attr<P: AsRef<Path>>(path: P, line: &str, privilege: Privilege) -> Result<()> {
    let path = path.as_ref();
    match privilege {
        Privilege::Root => Ok(fs::write(path, line)?),
        Privilege::Sudo => run_command(
            Command::new("sudo").args(&[
                "sh",
                "-c",
                &format!("echo {} > {}", line, path.display()),
            ]),
            "attribute write failed",
        ),
        Privilege::Unprivileged => bail!("no privilege to write {:?}", path),
    }
}

/// Basename of the `driver` symlink in a sysfs device directory, if any.
pub fn driver_name(dev_dir: &Path) -> Option<String> {
    let target = fs::read_link(dev_dir.join("driver")).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

/// Given a device name, determine whether it's rotational.
pub fn is_devname_rotational(sysfs_block: &Path, devname: &str) -> Result<bool> {
    let path = sysfs_block.join(devname).join("queue").join("rotational");

    let buf = read_one_line(&path)?;
    trace!("read {:?} content '{}'", &path, buf.trim());
    match scan_fmt!(&buf, "{d}", u32) {
        Ok(v) => Ok(v != 0),
        Err(e) => bail!("parse error: '{}' ({:?})", &buf, &e),
    }
}

pub fn read_sysctl(key: &str) -> Result<String> {
    let path = format!("/proc/sys/{}", key.replace('.', "/"));
    read_sys_attr(&path)
}

pub fn read_sysctl_u64(key: &str) -> Result<u64> {
    Ok(read_sysctl(key)?.trim().parse::<u64>()?)
}

pub fn list_net_interfaces() -> Vec<String> {
    list_dir_names(&format!("{}/*", SYSFS_NET))
}

fn list_dir_names(pattern: &str) -> Vec<String> {
    glob(pattern)
        .unwrap()
        .filter_map(|x| x.ok())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect()
}

/// Mountpoints currently backed by the device or one of its partitions.
/// The orchestrator wipes target devices, so any live mount disqualifies
/// a device and a root/boot mount is fatal.
pub fn active_mounts(dev_path: &str) -> Result<Vec<(String, PathBuf)>> {
    let mounts = MountList::new()?;
    Ok(mounts
        .0
        .iter()
        .filter(|mi| source_matches_device(&mi.source.to_string_lossy(), dev_path))
        .map(|mi| (mi.source.to_string_lossy().into_owned(), mi.dest.clone()))
        .collect())
}

/// The device itself or one of its partitions. A plain prefix test
/// would also catch sibling devices (sda vs sdab), so the suffix must
/// be a partition number: digits, or p-digits when the device name
/// already ends in a digit (nvme0n1 -> nvme0n1p1).
fn source_matches_device(source: &str, dev_path: &str) -> bool {
    let rest = match source.strip_prefix(dev_path) {
        Some(v) => v,
        None => return false,
    };
    if rest.is_empty() {
        return true;
    }
    let rest = match dev_path.ends_with(|c: char| c.is_ascii_digit()) {
        true => match rest.strip_prefix('p') {
            Some(v) => v,
            None => return false,
        },
        false => rest,
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

pub fn is_system_mount(dest: &Path) -> bool {
    dest == Path::new("/") || dest.starts_with("/boot")
}
