// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, info, warn};
use pb_util::sysfs;
use pb_util::{format_size, prog_exiting};
use scan_fmt::scan_fmt;
use std::fs;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

/// Empirical floor; a single flow can't saturate links much above
/// 10-20 Gbps, and the UDP test's fixed per-stream target needs the
/// count to track line rate 1:1 in Gbps.
pub const STREAM_COUNT_FLOOR: u32 = 10;

/// Headroom multiplier over the raw bandwidth-delay product.
pub const BDP_HEADROOM: f64 = 1.2;

const RTT_PROBE_ATTEMPTS: u32 = 5;
const RTT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Link speed in Mbps. Reads -1 without carrier and fails outright on
/// many virtual NICs; both degrade to unknown.
pub fn link_speed_mbps(iface: &str) -> Option<u64> {
    let path = format!("{}/{}/speed", sysfs::SYSFS_NET, iface);
    match sysfs::read_sys_attr(&path) {
        Ok(v) => match v.trim().parse::<i64>() {
            Ok(speed) if speed > 0 => Some(speed as u64),
            _ => {
                debug!("nic: {} reports no usable speed ({:?})", iface, v.trim());
                None
            }
        },
        Err(e) => {
            debug!("nic: can't read speed for {} ({:#})", iface, &e);
            None
        }
    }
}

pub fn stream_count(speed_mbps: Option<u64>) -> u32 {
    match speed_mbps {
        Some(speed) => STREAM_COUNT_FLOOR.max((speed / 1000) as u32),
        None => STREAM_COUNT_FLOOR,
    }
}

/// BDP with headroom: Mbps * ms is 125 bytes in flight.
pub fn bdp_bytes(speed_mbps: u64, rtt_ms: f64) -> u64 {
    (speed_mbps as f64 * rtt_ms * 125.0 * BDP_HEADROOM).round() as u64
}

/// Interface carrying the default route.
pub fn default_route_interface() -> Result<String> {
    default_route_interface_in(Path::new(PROC_NET_ROUTE))
}

fn default_route_interface_in(path: &Path) -> Result<String> {
    for line in fs::read_to_string(path)?.lines().skip(1) {
        if let Ok((iface, dest)) = scan_fmt!(line, "{} {x}", String, [hex u32]) {
            if dest == 0 {
                return Ok(iface);
            }
        }
    }
    bail!("no default route in {:?}", path);
}

/// Best observed TCP connect time toward the peer, in milliseconds.
/// Gates buffer sizing, not measurement, so the probe timeout is
/// short. None when the peer is unreachable.
pub fn measure_rtt(peer: &str, port: u16) -> Option<f64> {
    let addr = resolve(peer, port)?;
    let mut best: Option<f64> = None;

    for _ in 0..RTT_PROBE_ATTEMPTS {
        let started = Instant::now();
        match TcpStream::connect_timeout(&addr, RTT_PROBE_TIMEOUT) {
            Ok(_) => {
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                best = Some(match best {
                    Some(b) => b.min(ms),
                    None => ms,
                });
            }
            Err(e) => debug!("nic: RTT probe to {} failed ({:#})", &addr, &e),
        }
    }
    best
}

/// Bounded reachability probe used before dependent client steps. The
/// peer's server daemons are started out of band.
pub fn wait_for_peer(peer: &str, port: u16, timeout: Duration) -> Result<()> {
    let addr = match resolve(peer, port) {
        Some(v) => v,
        None => bail!("can't resolve {}:{}", peer, port),
    };
    let expires = SystemTime::now() + timeout;

    loop {
        if TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok() {
            return Ok(());
        }
        if prog_exiting() {
            bail!("interrupted while waiting for {}", &addr);
        }
        if SystemTime::now() >= expires {
            bail!("{} unreachable after {:?}", &addr, timeout);
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

fn resolve(peer: &str, port: u16) -> Option<SocketAddr> {
    match (peer, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("nic: failed to resolve {} ({:#})", peer, &e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferCheck {
    pub required_bytes: u64,
    pub rmem_max: u64,
    pub wmem_max: u64,
    pub adequate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferRequirement {
    Checked(BufferCheck),
    Skip(String),
}

/// Pure comparison half, separated so the arithmetic is testable
/// without sysctl access.
pub fn buffer_requirement(
    speed_mbps: Option<u64>,
    rtt_ms: Option<f64>,
    rmem_max: u64,
    wmem_max: u64,
) -> BufferRequirement {
    let speed = match speed_mbps {
        Some(v) => v,
        None => return BufferRequirement::Skip("link speed unknown".into()),
    };
    let rtt = match rtt_ms {
        Some(v) => v,
        None => return BufferRequirement::Skip("peer RTT unmeasurable".into()),
    };

    let required = bdp_bytes(speed, rtt);
    BufferRequirement::Checked(BufferCheck {
        required_bytes: required,
        rmem_max,
        wmem_max,
        adequate: rmem_max >= required && wmem_max >= required,
    })
}

pub fn probe_buffer_requirement(speed_mbps: Option<u64>, rtt_ms: Option<f64>) -> BufferRequirement {
    let rmem = match sysfs::read_sysctl_u64("net.core.rmem_max") {
        Ok(v) => v,
        Err(e) => return BufferRequirement::Skip(format!("can't read rmem_max ({:#})", &e)),
    };
    let wmem = match sysfs::read_sysctl_u64("net.core.wmem_max") {
        Ok(v) => v,
        Err(e) => return BufferRequirement::Skip(format!("can't read wmem_max ({:#})", &e)),
    };
    buffer_requirement(speed_mbps, rtt_ms, rmem, wmem)
}

/// Everything the network driver derives about the path under test.
#[derive(Debug, Clone)]
pub struct LinkCharacterization {
    pub interface: Option<String>,
    pub speed_mbps: Option<u64>,
    pub rtt_ms: Option<f64>,
    pub stream_count: u32,
    pub buffer: BufferRequirement,
}

pub fn characterize(
    interface: Option<&str>,
    peer: &str,
    port: u16,
    speed_override: Option<u64>,
    streams_override: Option<u32>,
) -> LinkCharacterization {
    let interface = match interface {
        Some(v) => Some(v.to_string()),
        None => match default_route_interface() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("nic: can't determine interface ({:#})", &e);
                None
            }
        },
    };

    let speed_mbps = speed_override.or_else(|| {
        interface
            .as_deref()
            .and_then(|iface| link_speed_mbps(iface))
    });
    let rtt_ms = measure_rtt(peer, port);
    let streams = streams_override.unwrap_or_else(|| stream_count(speed_mbps));
    let buffer = probe_buffer_requirement(speed_mbps, rtt_ms);

    let lc = LinkCharacterization {
        interface,
        speed_mbps,
        rtt_ms,
        stream_count: streams,
        buffer,
    };
    log_characterization(&lc, peer);
    lc
}

fn log_characterization(lc: &LinkCharacterization, peer: &str) {
    info!(
        "nic: interface={} speed={} rtt={} streams={}",
        lc.interface.as_deref().unwrap_or("?"),
        match lc.speed_mbps {
            Some(v) => format!("{}Mbps", v),
            None => "unknown".into(),
        },
        match lc.rtt_ms {
            Some(v) => format!("{:.2}ms", v),
            None => "unknown".into(),
        },
        lc.stream_count
    );
    match &lc.buffer {
        BufferRequirement::Skip(reason) => {
            warn!("nic: skipping socket buffer check ({})", reason)
        }
        BufferRequirement::Checked(chk) if chk.adequate => info!(
            "nic: socket buffer ceilings adequate (need {}, rmem_max {}, wmem_max {})",
            format_size(chk.required_bytes),
            format_size(chk.rmem_max),
            format_size(chk.wmem_max)
        ),
        BufferRequirement::Checked(chk) => {
            warn!(
                "nic: socket buffer ceilings too low for the path to {}: set \
                 net.core.rmem_max and net.core.wmem_max to at least {} locally \
                 (currently {}/{})",
                peer,
                chk.required_bytes,
                format_size(chk.rmem_max),
                format_size(chk.wmem_max)
            );
            // This process can't touch the remote end.
            warn!(
                "nic: apply the same sysctl values on {} before trusting TCP results",
                peer
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_stream_count() {
        // Floor of 10 including unknown speed, then 1:1 per Gbps.
        assert_eq!(stream_count(None), 10);
        assert_eq!(stream_count(Some(0)), 10);
        assert_eq!(stream_count(Some(100)), 10);
        assert_eq!(stream_count(Some(10_000)), 10);
        assert_eq!(stream_count(Some(25_000)), 25);
        assert_eq!(stream_count(Some(100_000)), 100);

        // Monotone in speed.
        let mut last = 0;
        for speed in (0..200_000).step_by(1000) {
            let n = stream_count(Some(speed));
            assert!(n >= last && n >= 10);
            last = n;
        }
    }

    #[test]
    fn test_bdp_exact() {
        // 10 Gbps at 2ms: 10000 * 2 * 125 * 1.2 bytes, exactly.
        assert_eq!(bdp_bytes(10_000, 2.0), 3_000_000);
        assert_eq!(bdp_bytes(1_000, 1.0), 150_000);
    }

    #[test]
    fn test_buffer_requirement() {
        assert_eq!(
            buffer_requirement(None, Some(1.0), 0, 0),
            BufferRequirement::Skip("link speed unknown".into())
        );
        assert_eq!(
            buffer_requirement(Some(1000), None, 0, 0),
            BufferRequirement::Skip("peer RTT unmeasurable".into())
        );

        match buffer_requirement(Some(10_000), Some(2.0), 4 << 20, 4 << 20) {
            BufferRequirement::Checked(chk) => {
                assert_eq!(chk.required_bytes, 3_000_000);
                assert!(chk.adequate);
            }
            other => panic!("unexpected {:?}", other),
        }
        match buffer_requirement(Some(10_000), Some(2.0), 212_992, 212_992) {
            BufferRequirement::Checked(chk) => assert!(!chk.adequate),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_route() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask"
        )
        .unwrap();
        writeln!(f, "eth1\t0000A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF").unwrap();
        writeln!(f, "eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000").unwrap();
        f.flush().unwrap();

        assert_eq!(default_route_interface_in(f.path()).unwrap(), "eth0");
    }

    #[test]
    fn test_default_route_missing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "Iface\tDestination\tGateway").unwrap();
        writeln!(f, "eth1\t0000A8C0\t00000000").unwrap();
        f.flush().unwrap();

        assert!(default_route_interface_in(f.path()).is_err());
    }
}
