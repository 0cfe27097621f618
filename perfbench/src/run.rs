// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use pb_util::{
    command_stdout, prog_exiting, run_command, run_command_timeout, sysfs, unix_now,
    wait_prog_state, Privilege, ProgState,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::device::{recommend, Classifier, DevCategory, SchedApply};
use crate::ledger::{Ledger, Phase};
use crate::locate::{locate, snapshot_results};
use crate::nic::{characterize, wait_for_peer, LinkCharacterization, STREAM_COUNT_FLOOR};
use crate::precondition::{precondition, Precondition};
use crate::pts::{rename_result, test_short_name, PtsConfig};

const MOUNT_ROOT: &str = "/mnt";
const PEER_WAIT: Duration = Duration::from_secs(60);
const IPERF_DURATION_SECS: u32 = 60;
// Per-stream UDP target. Stream count tracks line rate 1:1 in Gbps, so
// the aggregate offered load matches the link.
const UDP_PER_STREAM_TARGET: &str = "1G";

pub const NETWORK_RESOURCE: &str = "network";
pub const CPU_RESOURCE: &str = "host";
pub const NETWORK_TESTS: &[&str] = &["iperf3-tcp", "iperf3-udp", "netperf"];

/// One resource's lifecycle, split into the phases the sequencer
/// isolates failures between. `execute` returns the name of the result
/// artifact it produced, if it could be located.
pub trait StepDriver {
    fn prepare(&mut self, resource: &str) -> Result<()>;
    fn install(&mut self, resource: &str, test: &str) -> Result<()>;
    fn execute(&mut self, resource: &str, test: &str) -> Result<Option<String>>;
    fn release(&mut self, resource: &str);
}

/// Drive every (resource, test) pair start to finish, strictly one
/// resource at a time. Concurrent I/O across resources would
/// contaminate each one's measurements.
///
/// A prepare failure abandons that resource's tests; an install failure
/// drops only that test's execute step; an execute failure drops
/// nothing else. All three land in the ledger and the run continues.
/// Release happens exactly once per resource on every path.
pub fn run_all(
    driver: &mut dyn StepDriver,
    resources: &[String],
    tests: &[String],
    ledger: &mut Ledger,
) {
    for resource in resources {
        if prog_exiting() {
            warn!("run: interrupted, skipping remaining resources");
            break;
        }

        info!("run: preparing {}", resource);
        if let Err(e) = driver.prepare(resource) {
            ledger.record_failure(resource, None, Phase::Prepare, format!("{:#}", &e));
            driver.release(resource);
            continue;
        }

        for test in tests {
            if prog_exiting() {
                break;
            }
            if let Err(e) = driver.install(resource, test) {
                ledger.record_failure(resource, Some(test.as_str()), Phase::Install, format!("{:#}", &e));
                continue;
            }
            if prog_exiting() {
                break;
            }
            match driver.execute(resource, test) {
                Ok(Some(name)) => ledger.record_result(&name),
                Ok(None) => {}
                Err(e) => ledger.record_failure(
                    resource,
                    Some(test.as_str()),
                    Phase::Execute,
                    format!("{:#}", &e),
                ),
            }
        }

        driver.release(resource);
    }
}

/// Steady-state conditioning, then the format. Conditioning writes the
/// raw device, so it must precede mkfs; both go through `run` so the
/// sequence is testable without touching a device.
fn condition_and_format(
    dev_path: &str,
    category: DevCategory,
    privilege: Privilege,
    skip_preconditioning: bool,
    run: &mut dyn FnMut(&mut Command, &str) -> Result<()>,
) -> Result<()> {
    match precondition(dev_path, category, privilege, skip_preconditioning, &mut |cmd| {
        run(cmd, "preconditioning pass failed")
    })? {
        Precondition::Ran => info!("storage: {} preconditioned", dev_path),
        Precondition::Skipped(_) => {}
    }

    if !privilege.can_mutate() {
        bail!("formatting {} requires privilege", dev_path);
    }
    info!("storage: formatting {}", dev_path);
    run(
        &mut tool_cmd(privilege, "mkfs.ext4", &["-F", dev_path]),
        "format failed",
    )
}

/// External tool invocation, routed through sudo when that is the
/// privilege we have.
fn tool_cmd(privilege: Privilege, program: &str, args: &[&str]) -> Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        }
        _ => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

//
// Storage
//

#[derive(Debug, Clone)]
pub struct StorageTarget {
    pub dev_path: String,
    pub label: String,
}

/// Held while a target device is formatted and mounted. Release is
/// explicit in the normal flow; Drop covers panic and interrupt paths.
struct MountGuard {
    dev_path: String,
    mountpoint: PathBuf,
    privilege: Privilege,
    released: bool,
}

impl MountGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Unmount before removing the mountpoint before wiping
        // signatures; each step is attempted even if the previous
        // one failed.
        let mp = self.mountpoint.display().to_string();
        if let Err(e) = run_command(
            &mut tool_cmd(self.privilege, "umount", &[&mp]),
            "unmount failed",
        ) {
            warn!("storage: release of {:?} ({:#})", &self.mountpoint, &e);
        }
        if let Err(e) = run_command(
            &mut tool_cmd(self.privilege, "rmdir", &[&mp]),
            "mountpoint removal failed",
        ) {
            warn!("storage: release of {:?} ({:#})", &self.mountpoint, &e);
        }
        if let Err(e) = run_command(
            &mut tool_cmd(self.privilege, "wipefs", &["-a", &self.dev_path]),
            "signature wipe failed",
        ) {
            warn!("storage: release of {} ({:#})", &self.dev_path, &e);
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct StorageDriver {
    targets: Vec<StorageTarget>,
    classifier: Classifier,
    privilege: Privilege,
    pts: PtsConfig,
    skip_preconditioning: bool,
    upload: bool,
    mounts: HashMap<String, MountGuard>,
}

impl StorageDriver {
    pub fn new(
        targets: Vec<StorageTarget>,
        privilege: Privilege,
        pts: PtsConfig,
        skip_preconditioning: bool,
        upload: bool,
    ) -> Self {
        Self {
            targets,
            classifier: Classifier::default(),
            privilege,
            pts,
            skip_preconditioning,
            upload,
            mounts: HashMap::new(),
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.label.clone()).collect()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter_map(|t| {
                Path::new(&t.dev_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .collect()
    }

    fn target(&self, label: &str) -> Result<StorageTarget> {
        self.targets
            .iter()
            .find(|t| t.label == label)
            .cloned()
            .ok_or_else(|| anyhow!("unknown storage resource {:?}", label))
    }

    /// Per-resource tool config: test I/O must land on the target
    /// device's mount, not the OS disk. The test's target-directory
    /// prompt is pre-answered so batch mode never blocks on it.
    fn pts_for(&self, resource: &str, test: &str) -> PtsConfig {
        let mut cfg = self.pts.clone();
        if let Some(guard) = self.mounts.get(resource) {
            cfg.install_root = Some(guard.mountpoint.clone());
            cfg.preset_options.push(format!(
                "{}.directory={}",
                test_short_name(test),
                guard.mountpoint.display()
            ));
        }
        cfg
    }
}

impl StepDriver for StorageDriver {
    fn prepare(&mut self, resource: &str) -> Result<()> {
        let target = self.target(resource)?;
        let devname = Path::new(&target.dev_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("bad device path {:?}", &target.dev_path))?;

        // The device is about to be wiped. A live system mount
        // disqualifies it outright; anything else is unmounted.
        for (source, dest) in sysfs::active_mounts(&target.dev_path)? {
            if sysfs::is_system_mount(&dest) {
                bail!("{} holds system mount {:?}, refusing to touch it", source, dest);
            }
            warn!("storage: unmounting {} from {:?}", &source, &dest);
            run_command(
                &mut tool_cmd(self.privilege, "umount", &[&dest.display().to_string()]),
                "unmount failed",
            )?;
        }

        let cls = self.classifier.classify(&devname);
        info!(
            "storage: {} classified {} (chain: {})",
            &devname,
            cls.category,
            cls.driver_chain.join(" -> ")
        );
        let sched = recommend(cls.category);
        match self.classifier.apply_scheduler(&devname, sched, self.privilege) {
            SchedApply::Applied => info!("storage: {} scheduler set to {}", &devname, sched),
            SchedApply::AlreadySet => {
                info!("storage: {} scheduler already {}", &devname, sched)
            }
            SchedApply::Skipped(reason) => info!("storage: {}", &reason),
            SchedApply::Warned(reason) => warn!("storage: {}", &reason),
        }

        let timeout = self.pts.timeout;
        condition_and_format(
            &target.dev_path,
            cls.category,
            self.privilege,
            self.skip_preconditioning,
            &mut |cmd, emsg| run_command_timeout(cmd, timeout, emsg),
        )?;

        let mountpoint = PathBuf::from(MOUNT_ROOT).join(&target.label);
        let mp = mountpoint.display().to_string();
        run_command(
            &mut tool_cmd(self.privilege, "mkdir", &["-p", &mp]),
            "mountpoint creation failed",
        )?;
        run_command(
            &mut tool_cmd(self.privilege, "mount", &[&target.dev_path, &mp]),
            "mount failed",
        )
        .context("mounting formatted device")?;

        self.mounts.insert(
            resource.to_string(),
            MountGuard {
                dev_path: target.dev_path,
                mountpoint,
                privilege: self.privilege,
                released: false,
            },
        );
        Ok(())
    }

    fn install(&mut self, resource: &str, test: &str) -> Result<()> {
        self.pts_for(resource, test).install(test)
    }

    fn execute(&mut self, resource: &str, test: &str) -> Result<Option<String>> {
        let cfg = self.pts_for(resource, test);
        let results_dir = PtsConfig::results_dir();

        let before = snapshot_results(&results_dir)?;
        cfg.run(test)?;

        match locate(&results_dir, &before)?.name() {
            None => Ok(None),
            Some(found) => {
                let stable = format!("{}_{}_result", resource, test_short_name(test));
                rename_result(&results_dir, found, &stable)?;
                if self.upload {
                    if let Err(e) = cfg.upload(&stable) {
                        warn!("storage: upload of {} failed ({:#})", &stable, &e);
                    }
                }
                Ok(Some(stable))
            }
        }
    }

    fn release(&mut self, resource: &str) {
        if let Some(mut guard) = self.mounts.remove(resource) {
            info!("storage: releasing {}", resource);
            guard.release();
        }
    }
}

//
// CPU / memory
//

pub struct CpuDriver {
    pts: PtsConfig,
    upload: bool,
}

impl CpuDriver {
    pub fn new(pts: PtsConfig, upload: bool) -> Self {
        Self { pts, upload }
    }

    fn result_id(&self) -> String {
        self.pts
            .result_id
            .clone()
            .unwrap_or_else(|| unix_now().to_string())
    }
}

impl StepDriver for CpuDriver {
    fn prepare(&mut self, _resource: &str) -> Result<()> {
        Ok(())
    }

    fn install(&mut self, _resource: &str, test: &str) -> Result<()> {
        self.pts.install(test)
    }

    fn execute(&mut self, _resource: &str, test: &str) -> Result<Option<String>> {
        let results_dir = PtsConfig::results_dir();

        let before = snapshot_results(&results_dir)?;
        self.pts.run(test)?;

        match locate(&results_dir, &before)?.name() {
            None => Ok(None),
            Some(found) => {
                let stable = format!("{}_{}", self.result_id(), test_short_name(test));
                rename_result(&results_dir, found, &stable)?;
                if self.upload {
                    if let Err(e) = self.pts.upload(&stable) {
                        warn!("cpu: upload of {} failed ({:#})", &stable, &e);
                    }
                }
                Ok(Some(stable))
            }
        }
    }

    fn release(&mut self, _resource: &str) {}
}

//
// Network
//

pub struct NetworkDriver {
    peer: String,
    port: u16,
    interface: Option<String>,
    speed_override: Option<u64>,
    streams_override: Option<u32>,
    result_id: String,
    output_dir: PathBuf,
    link: Option<LinkCharacterization>,
}

impl NetworkDriver {
    pub fn new(
        peer: String,
        port: u16,
        interface: Option<String>,
        speed_override: Option<u64>,
        streams_override: Option<u32>,
        result_id: Option<String>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            peer,
            port,
            interface,
            speed_override,
            streams_override,
            result_id: result_id.unwrap_or_else(|| unix_now().to_string()),
            output_dir,
            link: None,
        }
    }

    fn streams(&self) -> u32 {
        self.link
            .as_ref()
            .map(|l| l.stream_count)
            .unwrap_or(STREAM_COUNT_FLOOR)
    }
}

impl StepDriver for NetworkDriver {
    fn prepare(&mut self, _resource: &str) -> Result<()> {
        self.link = Some(characterize(
            self.interface.as_deref(),
            &self.peer,
            self.port,
            self.speed_override,
            self.streams_override,
        ));
        Ok(())
    }

    // The peer's daemons are started out of band; gate every client
    // step on reachability so a dead peer fails fast per test instead
    // of hanging the measurement tool.
    fn install(&mut self, _resource: &str, _test: &str) -> Result<()> {
        wait_for_peer(&self.peer, self.port, PEER_WAIT)
    }

    fn execute(&mut self, _resource: &str, test: &str) -> Result<Option<String>> {
        let mut cmd = match test {
            "iperf3-tcp" => iperf3_tcp_cmd(&self.peer, self.port, self.streams()),
            "iperf3-udp" => iperf3_udp_cmd(&self.peer, self.port, self.streams()),
            "netperf" => netperf_cmd(&self.peer),
            other => bail!("unknown network test {:?}", other),
        };
        let output = command_stdout(&mut cmd)?;

        let name = format!("{}_{}", &self.result_id, test);
        fs::write(self.output_dir.join(&name), output)
            .with_context(|| format!("writing {:?}", &name))?;
        Ok(Some(name))
    }

    fn release(&mut self, _resource: &str) {}
}

fn iperf3_tcp_cmd(peer: &str, port: u16, streams: u32) -> Command {
    let mut cmd = Command::new("iperf3");
    cmd.args(&[
        "-c",
        peer,
        "-p",
        &port.to_string(),
        "-P",
        &streams.to_string(),
        "-t",
        &IPERF_DURATION_SECS.to_string(),
    ]);
    cmd
}

fn iperf3_udp_cmd(peer: &str, port: u16, streams: u32) -> Command {
    let mut cmd = Command::new("iperf3");
    cmd.args(&[
        "-c",
        peer,
        "-p",
        &port.to_string(),
        "-u",
        "-b",
        UDP_PER_STREAM_TARGET,
        "-P",
        &streams.to_string(),
        "-t",
        &IPERF_DURATION_SECS.to_string(),
    ]);
    cmd
}

fn netperf_cmd(peer: &str) -> Command {
    let mut cmd = Command::new("netperf");
    cmd.args(&[
        "-H",
        peer,
        "-t",
        "TCP_RR",
        "--",
        "-o",
        "min_latency,mean_latency,p99_latency,max_latency",
    ]);
    cmd
}

/// Daemon mode: run the server ends of the network tests until
/// interrupted. The daemons are children of this process and die
/// with it.
pub fn serve(port: u16) -> Result<()> {
    let mut iperf = Command::new("iperf3")
        .args(&["-s", "-p", &port.to_string()])
        .spawn()
        .context("starting iperf3 server")?;
    let mut netserver = Command::new("netserver")
        .arg("-D")
        .spawn()
        .context("starting netserver")?;

    info!("network: serving on port {}, interrupt to stop", port);
    while wait_prog_state(Duration::from_millis(500)) == ProgState::Running {}

    let _ = iperf.kill();
    let _ = iperf.wait();
    let _ = netserver.kill();
    let _ = netserver.wait();
    info!("network: server daemons stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockDriver {
        events: Vec<String>,
        fail_prepare: HashSet<String>,
        fail_install: HashSet<(String, String)>,
        fail_execute: HashSet<(String, String)>,
    }

    impl StepDriver for MockDriver {
        fn prepare(&mut self, resource: &str) -> Result<()> {
            self.events.push(format!("prepare {}", resource));
            match self.fail_prepare.contains(resource) {
                true => bail!("prepare boom"),
                false => Ok(()),
            }
        }
        fn install(&mut self, resource: &str, test: &str) -> Result<()> {
            self.events.push(format!("install {} {}", resource, test));
            match self.fail_install.contains(&(resource.into(), test.into())) {
                true => bail!("install boom"),
                false => Ok(()),
            }
        }
        fn execute(&mut self, resource: &str, test: &str) -> Result<Option<String>> {
            self.events.push(format!("execute {} {}", resource, test));
            match self.fail_execute.contains(&(resource.into(), test.into())) {
                true => bail!("execute boom"),
                false => Ok(Some(format!("{}_{}_result", resource, test))),
            }
        }
        fn release(&mut self, resource: &str) {
            self.events.push(format!("release {}", resource));
        }
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn pos(events: &[String], needle: &str) -> usize {
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing event {:?} in {:?}", needle, events))
    }

    #[test]
    fn test_clean_run() {
        let mut drv = MockDriver::default();
        let mut ledger = Ledger::default();
        run_all(&mut drv, &strs(&["r1", "r2"]), &strs(&["X"]), &mut ledger);

        assert!(ledger.is_clean());
        assert_eq!(ledger.exit_code(), 0);
        assert_eq!(
            drv.events,
            vec![
                "prepare r1",
                "install r1 X",
                "execute r1 X",
                "release r1",
                "prepare r2",
                "install r2 X",
                "execute r2 X",
                "release r2",
            ]
        );
    }

    #[test]
    fn test_install_failure_isolated() {
        let mut drv = MockDriver::default();
        drv.fail_install.insert(("r1".into(), "X".into()));
        let mut ledger = Ledger::default();
        run_all(&mut drv, &strs(&["r1", "r2"]), &strs(&["X", "Y"]), &mut ledger);

        // X's execute on r1 is dropped; everything else proceeds.
        assert!(!drv.events.contains(&"execute r1 X".to_string()));
        for needed in &[
            "install r1 Y",
            "execute r1 Y",
            "install r2 X",
            "execute r2 X",
            "install r2 Y",
            "execute r2 Y",
        ] {
            assert!(drv.events.contains(&needed.to_string()), "{}", needed);
        }

        assert_eq!(ledger.failures().len(), 1);
        let failure = &ledger.failures()[0];
        assert_eq!(failure.resource, "r1");
        assert_eq!(failure.test.as_deref(), Some("X"));
        assert_eq!(failure.phase, Phase::Install);
    }

    #[test]
    fn test_execute_failure_isolated() {
        let mut drv = MockDriver::default();
        drv.fail_execute.insert(("r1".into(), "X".into()));
        let mut ledger = Ledger::default();
        run_all(&mut drv, &strs(&["r1"]), &strs(&["X", "Y"]), &mut ledger);

        assert!(drv.events.contains(&"execute r1 Y".to_string()));
        assert_eq!(ledger.failures().len(), 1);
        assert_eq!(ledger.failures()[0].phase, Phase::Execute);
        assert_eq!(ledger.exit_code(), 1);
    }

    #[test]
    fn test_prepare_failure_abandons_resource() {
        let mut drv = MockDriver::default();
        drv.fail_prepare.insert("r1".into());
        let mut ledger = Ledger::default();
        run_all(&mut drv, &strs(&["r1", "r2"]), &strs(&["X"]), &mut ledger);

        // No test steps for r1, but release still runs and r2 is
        // unaffected.
        assert!(!drv.events.iter().any(|e| e.starts_with("install r1")));
        assert!(!drv.events.iter().any(|e| e.starts_with("execute r1")));
        assert!(drv.events.contains(&"release r1".to_string()));
        assert!(drv.events.contains(&"execute r2 X".to_string()));

        assert_eq!(ledger.failures().len(), 1);
        assert_eq!(ledger.failures()[0].phase, Phase::Prepare);
        assert_eq!(ledger.failures()[0].test, None);
    }

    #[test]
    fn test_release_once_and_serialized() {
        let mut drv = MockDriver::default();
        drv.fail_execute.insert(("r1".into(), "X".into()));
        let mut ledger = Ledger::default();
        run_all(&mut drv, &strs(&["r1", "r2"]), &strs(&["X"]), &mut ledger);

        for r in &["r1", "r2"] {
            let releases = drv
                .events
                .iter()
                .filter(|e| *e == &format!("release {}", r))
                .count();
            assert_eq!(releases, 1, "release count for {}", r);
        }
        // r1 fully finishes, release included, before r2 starts.
        assert!(pos(&drv.events, "release r1") < pos(&drv.events, "prepare r2"));
    }

    #[test]
    fn test_condition_precedes_format() {
        // Program names suffice here; the pass arguments are covered by
        // the preconditioning tests.
        let mut seen: Vec<String> = Vec::new();
        condition_and_format("/dev/sdz", DevCategory::Ssd, Privilege::Root, false, &mut |cmd, _| {
            seen.push(cmd.get_program().to_string_lossy().into_owned());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["fio", "fio", "mkfs.ext4"]);

        // HDDs skip conditioning but still format.
        let mut seen: Vec<String> = Vec::new();
        condition_and_format("/dev/sdz", DevCategory::Hdd, Privilege::Root, false, &mut |cmd, _| {
            seen.push(cmd.get_program().to_string_lossy().into_owned());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["mkfs.ext4"]);

        // Unprivileged issues nothing at all.
        let mut issued = 0;
        assert!(condition_and_format(
            "/dev/sdz",
            DevCategory::Ssd,
            Privilege::Unprivileged,
            false,
            &mut |_, _| {
                issued += 1;
                Ok(())
            }
        )
        .is_err());
        assert_eq!(issued, 0);
    }

    #[test]
    fn test_network_command_shapes() {
        let cmd = iperf3_tcp_cmd("192.0.2.7", 5201, 25);
        assert_eq!(cmd.get_program(), "iperf3");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["-c", "192.0.2.7", "-p", "5201", "-P", "25", "-t", "60"]);

        let udp = iperf3_udp_cmd("192.0.2.7", 5201, 10);
        let args: Vec<String> = udp
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"-u".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-b" && w[1] == "1G"));

        let np = netperf_cmd("192.0.2.7");
        assert_eq!(np.get_program(), "netperf");
    }

    #[test]
    fn test_tool_cmd_privilege_routing() {
        let cmd = tool_cmd(Privilege::Root, "wipefs", &["-a", "/dev/sdz"]);
        assert_eq!(cmd.get_program(), "wipefs");

        let cmd = tool_cmd(Privilege::Sudo, "wipefs", &["-a", "/dev/sdz"]);
        assert_eq!(cmd.get_program(), "sudo");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["wipefs", "-a", "/dev/sdz"]);
    }
}
