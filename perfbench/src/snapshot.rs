// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::Local;
use log::debug;
use pb_util::{command_stdout, nr_cpus, sysfs, JsonLoad, JsonSave, Privilege, PAGE_SIZE};
use scan_fmt::scan_fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use sysinfo::SystemExt;

use crate::device::{Classification, Classifier};

const SNAPSHOT_DOC: &str = "\
//
// perfbench environment snapshot
//
// Point-in-time record of the kernel, hardware and tuning state a
// result set was produced under, independent of whatever metadata the
// benchmark tool itself records. Every field is best-effort; absent
// sources are simply null.
//
";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CpufreqInfo {
    pub governor: Option<String>,
    pub driver: Option<String>,
    pub min_freq_khz: Option<u64>,
    pub max_freq_khz: Option<u64>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StorageSnap {
    pub name: String,
    pub classification: Option<Classification>,
    pub scheduler: Option<String>,
    pub nr_requests: Option<u64>,
    pub rotational: Option<bool>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct NetSnap {
    pub name: String,
    pub mtu: Option<u64>,
    pub speed_mbps: Option<u64>,
    pub driver: Option<String>,
    pub offloads: Option<String>,
    pub ring_buffers: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub captured_at: String,
    pub kernel: Option<String>,
    pub os_release: BTreeMap<String, String>,
    pub nr_cpus: usize,
    pub page_size: usize,
    pub cpufreq: CpufreqInfo,
    pub numa_nodes: Vec<String>,
    pub memory_total: Option<u64>,
    pub memory_free: Option<u64>,
    pub loadavg_1min: Option<f64>,
    pub storage: Vec<StorageSnap>,
    pub network: Vec<NetSnap>,
    pub dmidecode: Option<String>,
}

impl JsonLoad for EnvSnapshot {}
impl JsonSave for EnvSnapshot {
    fn preamble() -> Option<String> {
        Some(SNAPSHOT_DOC.to_string())
    }
}

impl EnvSnapshot {
    pub fn capture(
        classifier: &Classifier,
        storage_devs: &[String],
        net_ifaces: &[String],
        privilege: Privilege,
    ) -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        Self {
            captured_at: Local::now().to_rfc3339(),
            kernel: sysfs::read_sys_attr("/proc/sys/kernel/osrelease").ok(),
            os_release: fs::read_to_string("/etc/os-release")
                .map(|s| parse_os_release(&s))
                .unwrap_or_default(),
            nr_cpus: nr_cpus(),
            page_size: *PAGE_SIZE,
            cpufreq: capture_cpufreq(),
            numa_nodes: sysfs_names("/sys/devices/system/node", "node"),
            memory_total: Some(sys.get_total_memory() * 1024),
            memory_free: Some(sys.get_free_memory() * 1024),
            loadavg_1min: read_loadavg(),
            storage: storage_devs
                .iter()
                .map(|dev| capture_storage(classifier, dev))
                .collect(),
            network: net_ifaces.iter().map(|ifc| capture_net(ifc, privilege)).collect(),
            dmidecode: capture_dmidecode(privilege),
        }
    }
}

fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(idx) = line.find('=') {
            let key = line[..idx].to_string();
            let val = line[idx + 1..].trim_matches('"').to_string();
            map.insert(key, val);
        }
    }
    map
}

fn capture_cpufreq() -> CpufreqInfo {
    let base = Path::new("/sys/devices/system/cpu/cpu0/cpufreq");
    let attr = |name: &str| sysfs::read_sys_attr(base.join(name)).ok();
    CpufreqInfo {
        governor: attr("scaling_governor"),
        driver: attr("scaling_driver"),
        min_freq_khz: attr("scaling_min_freq").and_then(|v| v.trim().parse().ok()),
        max_freq_khz: attr("scaling_max_freq").and_then(|v| v.trim().parse().ok()),
    }
}

fn sysfs_names(dir: &str, prefix: &str) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(iter) => {
            let mut names: Vec<String> = iter
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with(prefix) && n[prefix.len()..].parse::<u32>().is_ok())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

fn read_loadavg() -> Option<f64> {
    let line = pb_util::read_one_line("/proc/loadavg").ok()?;
    scan_fmt!(&line, "{f}", f64).ok()
}

fn capture_storage(classifier: &Classifier, devname: &str) -> StorageSnap {
    let queue = Path::new(sysfs::SYSFS_BLOCK).join(devname).join("queue");
    StorageSnap {
        name: devname.to_string(),
        classification: Some(classifier.classify(devname)),
        scheduler: sysfs::read_sys_attr(queue.join("scheduler")).ok(),
        nr_requests: sysfs::read_sys_attr(queue.join("nr_requests"))
            .ok()
            .and_then(|v| v.trim().parse().ok()),
        rotational: sysfs::is_devname_rotational(Path::new(sysfs::SYSFS_BLOCK), devname).ok(),
    }
}

fn capture_net(iface: &str, privilege: Privilege) -> NetSnap {
    let base = Path::new(sysfs::SYSFS_NET).join(iface);
    let ethtool = |flag: &str| -> Option<String> {
        let mut cmd = match privilege {
            Privilege::Sudo => {
                let mut c = Command::new("sudo");
                c.args(&["ethtool", flag, iface]);
                c
            }
            _ => {
                let mut c = Command::new("ethtool");
                c.args(&[flag, iface]);
                c
            }
        };
        match command_stdout(&mut cmd) {
            Ok(out) => Some(out),
            Err(e) => {
                debug!("snapshot: ethtool {} {} failed ({:#})", flag, iface, &e);
                None
            }
        }
    };

    NetSnap {
        name: iface.to_string(),
        mtu: sysfs::read_sys_attr(base.join("mtu"))
            .ok()
            .and_then(|v| v.trim().parse().ok()),
        speed_mbps: crate::nic::link_speed_mbps(iface),
        driver: sysfs::driver_name(&base.join("device")),
        offloads: ethtool("-k"),
        ring_buffers: ethtool("-g"),
    }
}

fn capture_dmidecode(privilege: Privilege) -> Option<String> {
    let mut cmd = match privilege {
        Privilege::Root => Command::new("dmidecode"),
        Privilege::Sudo => {
            let mut c = Command::new("sudo");
            c.arg("dmidecode");
            c
        }
        // Hardware inventory needs the privileged probe.
        Privilege::Unprivileged => return None,
    };
    match command_stdout(&mut cmd) {
        Ok(out) => Some(out),
        Err(e) => {
            debug!("snapshot: dmidecode failed ({:#})", &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let content = r#"
NAME="Fedora Linux"
VERSION_ID=40
# comment
PRETTY_NAME="Fedora Linux 40 (Server Edition)"
"#;
        let map = parse_os_release(content);
        assert_eq!(map.get("NAME").map(|s| s.as_str()), Some("Fedora Linux"));
        assert_eq!(map.get("VERSION_ID").map(|s| s.as_str()), Some("40"));
        assert_eq!(
            map.get("PRETTY_NAME").map(|s| s.as_str()),
            Some("Fedora Linux 40 (Server Edition)")
        );
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_capture_never_fails() {
        // Every field is independently optional; capture must succeed
        // on any host, privileged or not.
        let snap = EnvSnapshot::capture(
            &Classifier::default(),
            &["definitely-not-a-disk".to_string()],
            &[],
            Privilege::Unprivileged,
        );
        assert_eq!(snap.storage.len(), 1);
        assert!(snap.nr_cpus > 0);
        assert!(snap.as_json().unwrap().contains("environment snapshot"));
    }
}
