// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, warn};
use pb_util::sysfs;
use pb_util::Privilege;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHED_NONE: &str = "none";
pub const SCHED_MQ_DEADLINE: &str = "mq-deadline";

// Transport-layer shims to step over while walking from a block device
// toward its host controller. An allowlist, not exhaustive.
const TRANSPORT_DRIVERS: &[&str] = &[
    "sd",
    "sr",
    "ses",
    "scsi_transport_sas",
    "scsi_transport_fc",
    "scsi_transport_spi",
];

// Paravirtual controllers. The transport, not the medium behind it,
// decides the scheduler, so rotational is ignored for these.
const PARAVIRT_DRIVERS: &[&str] = &[
    "virtio_blk",
    "virtio_scsi",
    "xen-blkfront",
    "xen_scsifront",
    "vmw_pvscsi",
    "hv_storvsc",
];

// Physical HBAs. Medium type comes from the rotational flag.
const PHYSICAL_HBA_DRIVERS: &[&str] = &[
    "ahci",
    "mpt2sas",
    "mpt3sas",
    "megaraid_sas",
    "hpsa",
    "smartpqi",
    "aacraid",
    "qla2xxx",
    "lpfc",
    "usb-storage",
    "uas",
];

const MAX_WALK_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevCategory {
    Nvme,
    Ssd,
    Hdd,
    Virtual,
    Unknown,
}

impl std::fmt::Display for DevCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Nvme => "nvme",
            Self::Ssd => "ssd",
            Self::Hdd => "hdd",
            Self::Virtual => "virtual",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: DevCategory,
    pub driver_chain: Vec<String>,
}

pub struct Classifier {
    sysfs_block: PathBuf,
    sysfs_root: PathBuf,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            sysfs_block: PathBuf::from(sysfs::SYSFS_BLOCK),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl Classifier {
    #[cfg(test)]
    fn with_roots<P: AsRef<Path>>(sysfs_block: P, sysfs_root: P) -> Self {
        Self {
            sysfs_block: sysfs_block.as_ref().into(),
            sysfs_root: sysfs_root.as_ref().into(),
        }
    }

    /// Classify a block device by walking its kernel driver chain.
    /// A pure read of current sysfs state. Absence of information is a
    /// valid terminal classification, never an error.
    pub fn classify(&self, devname: &str) -> Classification {
        let mut chain = Vec::new();
        let dev_link = self.sysfs_block.join(devname).join("device");

        let root = fs::canonicalize(&self.sysfs_root).unwrap_or_else(|_| self.sysfs_root.clone());
        let mut dir = match fs::canonicalize(&dev_link) {
            Ok(v) => v,
            Err(e) => {
                debug!("device: no sysfs node for {:?} ({:#})", &dev_link, &e);
                return Classification {
                    category: DevCategory::Unknown,
                    driver_chain: chain,
                };
            }
        };

        for _ in 0..MAX_WALK_DEPTH {
            if let Some(driver) = sysfs::driver_name(&dir) {
                let decided = self.decide(&driver, devname);
                chain.push(driver);
                if let Some(category) = decided {
                    return Classification {
                        category,
                        driver_chain: chain,
                    };
                }
            }
            // Bounded by the sysfs root even when links are malformed.
            if !dir.pop() || !dir.starts_with(&root) {
                break;
            }
        }

        debug!(
            "device: no terminal driver for {} (chain: {:?})",
            devname, &chain
        );
        Classification {
            category: DevCategory::Unknown,
            driver_chain: chain,
        }
    }

    fn decide(&self, driver: &str, devname: &str) -> Option<DevCategory> {
        if TRANSPORT_DRIVERS.contains(&driver) {
            return None;
        }
        if driver == "nvme" {
            return Some(DevCategory::Nvme);
        }
        if PARAVIRT_DRIVERS.contains(&driver) {
            return Some(DevCategory::Virtual);
        }
        if PHYSICAL_HBA_DRIVERS.contains(&driver) {
            return Some(match sysfs::is_devname_rotational(&self.sysfs_block, devname) {
                Ok(true) => DevCategory::Hdd,
                Ok(false) => DevCategory::Ssd,
                Err(e) => {
                    warn!(
                        "device: {} behind {} but rotational flag unreadable ({:#})",
                        devname, driver, &e
                    );
                    DevCategory::Unknown
                }
            });
        }
        debug!("device: unrecognized controller driver {:?}", driver);
        Some(DevCategory::Unknown)
    }

    /// Apply a recommended scheduler if it is safe to do so. Failures
    /// here affect measurement validity, not correctness, so this never
    /// aborts the run.
    pub fn apply_scheduler(
        &self,
        devname: &str,
        sched: &str,
        privilege: Privilege,
    ) -> SchedApply {
        let path = self.sysfs_block.join(devname).join("queue").join("scheduler");

        let line = match sysfs::read_sys_attr(&path) {
            Ok(v) => v,
            Err(_) => {
                return SchedApply::Skipped(format!(
                    "{} exposes no scheduler interface",
                    devname
                ))
            }
        };

        let (current, available) = parse_scheduler_line(&line);
        if current.as_deref() == Some(sched) {
            return SchedApply::AlreadySet;
        }
        if !available.iter().any(|s| s == sched) {
            return SchedApply::Warned(format!(
                "{:?} not selectable for {} (available: {})",
                sched,
                devname,
                available.join(" ")
            ));
        }
        if !privilege.can_mutate() {
            return SchedApply::Warned(format!(
                "insufficient privilege to set {:?} on {}, leaving {:?}",
                sched,
                devname,
                current.as_deref().unwrap_or("?")
            ));
        }

        match sysfs::write_sys_attr(&path, sched, privilege) {
            Ok(()) => SchedApply::Applied,
            Err(e) => SchedApply::Warned(format!(
                "failed to set {:?} on {} ({:#})",
                sched, devname, &e
            )),
        }
    }
}

/// Scheduler recommendation per category. Total: every category maps to
/// a scheduler. Non-rotational transports gain nothing from reordering;
/// rotational media benefits from deadline-based seek batching.
pub fn recommend(category: DevCategory) -> &'static str {
    match category {
        DevCategory::Nvme | DevCategory::Ssd | DevCategory::Virtual => SCHED_NONE,
        DevCategory::Hdd | DevCategory::Unknown => SCHED_MQ_DEADLINE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedApply {
    Applied,
    AlreadySet,
    Skipped(String),
    Warned(String),
}

/// Parse the kernel's "noop [mq-deadline] kyber" format into the
/// current scheduler and the selectable list.
pub fn parse_scheduler_line(line: &str) -> (Option<String>, Vec<String>) {
    let mut current = None;
    let mut available = Vec::new();
    for tok in line.split_whitespace() {
        if tok.starts_with('[') && tok.ends_with(']') {
            let name = tok[1..tok.len() - 1].to_string();
            current = Some(name.clone());
            available.push(name);
        } else {
            available.push(tok.to_string());
        }
    }
    (current, available)
}
