// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Install,
    Execute,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Install => write!(f, "install"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub resource: String,
    pub test: Option<String>,
    pub phase: Phase,
    pub reason: String,
}

/// Append-only record of per-step outcomes. Mutated only through the
/// record operations below; read once at the end for the exit status.
#[derive(Debug, Default)]
pub struct Ledger {
    failures: Vec<Failure>,
    results: Vec<String>,
}

impl Ledger {
    pub fn record_failure(&mut self, resource: &str, test: Option<&str>, phase: Phase, reason: String) {
        self.failures.push(Failure {
            resource: resource.to_string(),
            test: test.map(|t| t.to_string()),
            phase,
            reason,
        });
    }

    pub fn record_result(&mut self, name: &str) {
        self.results.push(name.to_string());
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        match self.is_clean() {
            true => 0,
            false => 1,
        }
    }

    pub fn format_summary(&self) -> String {
        let mut buf = String::new();

        writeln!(buf, "\n== Run summary ==").unwrap();
        match self.results.len() {
            0 => writeln!(buf, "No results collected.").unwrap(),
            _ => {
                writeln!(buf, "Results ({}):", self.results.len()).unwrap();
                for name in self.results.iter() {
                    writeln!(buf, "  {}", name).unwrap();
                }
            }
        }

        if !self.failures.is_empty() {
            writeln!(buf, "Failures ({}):", self.failures.len()).unwrap();
            for failure in self.failures.iter() {
                writeln!(
                    buf,
                    "  {} / {} / {}: {}",
                    failure.resource,
                    failure.test.as_deref().unwrap_or("-"),
                    failure.phase,
                    failure.reason
                )
                .unwrap();
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        let mut ledger = Ledger::default();
        ledger.record_result("L1_fio_result");
        assert!(ledger.is_clean());
        assert_eq!(ledger.exit_code(), 0);

        ledger.record_failure("disk1", Some("compress-gzip"), Phase::Install, "boom".into());
        assert_eq!(ledger.exit_code(), 1);
        assert_eq!(ledger.failures().len(), 1);
    }

    #[test]
    fn test_summary_lists_coordinates() {
        let mut ledger = Ledger::default();
        ledger.record_result("L1_pts_result");
        ledger.record_failure("disk2", Some("sqlite"), Phase::Execute, "timed out".into());
        ledger.record_failure("disk3", None, Phase::Prepare, "format failed".into());

        let summary = ledger.format_summary();
        assert!(summary.contains("L1_pts_result"));
        assert!(summary.contains("disk2 / sqlite / execute: timed out"));
        assert!(summary.contains("disk3 / - / prepare: format failed"));
    }
}
