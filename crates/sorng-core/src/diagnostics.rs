//! Connection check report.
//!
//! A connection test runs a fixed ladder of probes (DNS, TCP, login,
//! remote root) and records one [`CheckStep`] per rung. The first failing
//! rung stops the ladder and becomes the report's summary.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStep {
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub resolved_ip: Option<String>,
    pub steps: Vec<CheckStep>,
    pub success: bool,
    pub summary: String,
    pub total_duration_ms: u64,
}

/// Append a step timed from `started`.
pub fn push_step(
    steps: &mut Vec<CheckStep>,
    name: &str,
    status: StepStatus,
    message: impl Into<String>,
    started: Instant,
) {
    steps.push(CheckStep {
        name: name.to_string(),
        status,
        message: message.into(),
        duration_ms: started.elapsed().as_millis() as u64,
    });
}

/// Resolve `host:port`, recording a "DNS" step. Returns the first address.
pub fn probe_dns(host: &str, port: u16, steps: &mut Vec<CheckStep>) -> Option<SocketAddr> {
    let t = Instant::now();
    match format!("{}:{}", host, port).to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(first) => {
                push_step(steps, "DNS", StepStatus::Pass, format!("{} → {}", host, first.ip()), t);
                Some(first)
            }
            None => {
                push_step(steps, "DNS", StepStatus::Fail, format!("No addresses for {}", host), t);
                None
            }
        },
        Err(e) => {
            push_step(steps, "DNS", StepStatus::Fail, format!("Lookup failed: {}", e), t);
            None
        }
    }
}

/// TCP connect with timeout, recording a "TCP" step.
pub fn probe_tcp(addr: SocketAddr, timeout: Duration, steps: &mut Vec<CheckStep>) -> bool {
    let t = Instant::now();
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => {
            push_step(steps, "TCP", StepStatus::Pass, format!("Connected to {}", addr), t);
            true
        }
        Err(e) => {
            push_step(steps, "TCP", StepStatus::Fail, format!("Connect to {}: {}", addr, e), t);
            false
        }
    }
}

/// Build the final report from accumulated steps.
pub fn finish_report(
    host: &str,
    port: u16,
    protocol: &str,
    resolved_ip: Option<String>,
    steps: Vec<CheckStep>,
    started: Instant,
) -> ConnectionReport {
    let first_fail = steps.iter().find(|s| s.status == StepStatus::Fail);
    let success = first_fail.is_none() && !steps.is_empty();
    let summary = match first_fail {
        Some(fail) => format!("Stopped at {}: {}", fail.name, fail.message),
        None if steps.iter().any(|s| s.status == StepStatus::Warn) => {
            "Connected, with warnings".to_string()
        }
        None if success => "Connection OK".to_string(),
        None => "No checks ran".to_string(),
    };
    ConnectionReport {
        host: host.to_string(),
        port,
        protocol: protocol.to_string(),
        resolved_ip,
        steps,
        success,
        summary,
        total_duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn dns_resolves_localhost() {
        let mut steps = Vec::new();
        assert!(probe_dns("localhost", 21, &mut steps).is_some());
        assert_eq!(steps[0].status, StepStatus::Pass);
    }

    #[test]
    fn tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut steps = Vec::new();
        assert!(probe_tcp(addr, Duration::from_secs(2), &mut steps));
        drop(listener);
    }

    #[test]
    fn report_summarises_first_failure() {
        let t = Instant::now();
        let mut steps = Vec::new();
        push_step(&mut steps, "DNS", StepStatus::Pass, "ok", t);
        push_step(&mut steps, "Login", StepStatus::Fail, "530 Login incorrect", t);
        push_step(&mut steps, "Remote root", StepStatus::Skip, "", t);
        let report = finish_report("h", 21, "ftp", None, steps, t);
        assert!(!report.success);
        assert_eq!(report.summary, "Stopped at Login: 530 Login incorrect");
    }

    #[test]
    fn empty_report_is_not_success() {
        let report = finish_report("h", 22, "sftp", None, Vec::new(), Instant::now());
        assert!(!report.success);
    }

    #[test]
    fn step_serializes_camel_case() {
        let step = CheckStep {
            name: "TCP".into(),
            status: StepStatus::Pass,
            message: "ok".into(),
            duration_ms: 3,
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"durationMs\":3"));
        assert!(json.contains("\"status\":\"pass\""));
    }
}
