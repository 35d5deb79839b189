use crate::redact::Redactor;
use crate::remote::{argv, command_line, RemoteSession};
use crate::RuntimeError;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info, warn};

const JOURNAL_LINES: &str = "50";

/// Restart-then-verify parameters for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCheck {
    pub name: String,
    pub attempts: u32,
    pub backoff: Duration,
    /// Deadline for each individual health probe.
    pub timeout: Duration,
    /// Probe command; `systemctl is-active --quiet <name>` when unset.
    pub health_command: Option<Vec<String>>,
}

impl ServiceCheck {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: 5,
            backoff: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
            health_command: None,
        }
    }

    fn probe_argv(&self) -> Vec<String> {
        self.health_command
            .clone()
            .unwrap_or_else(|| argv(["systemctl", "is-active", "--quiet", self.name.as_str()]))
    }

    /// Restart the service, then probe it up to `attempts` times.
    ///
    /// Returns the number of probes used. When every probe fails, the unit
    /// definition and recent journal are collected, redacted, and attached to
    /// the error.
    pub fn restart_and_verify(
        &self,
        session: &dyn RemoteSession,
        redactor: &Redactor,
    ) -> Result<u32, RuntimeError> {
        let restart = argv(["systemctl", "restart", self.name.as_str()]);
        let out = session.run_command(&restart, self.timeout)?;
        if !out.success() {
            return Err(RuntimeError::CommandFailed {
                command: command_line(&restart),
                exit_code: out.exit_code,
                stderr: redactor.redact(&out.stderr),
            });
        }

        let probe = self.probe_argv();
        let attempts = self.attempts.max(1);
        for attempt in 1..=attempts {
            let healthy = match session.run_command(&probe, self.timeout) {
                Ok(out) => out.success(),
                Err(RuntimeError::Timeout { .. }) => false,
                Err(e) => return Err(e),
            };
            if healthy {
                info!("service {} healthy after {attempt} probe(s)", self.name);
                return Ok(attempt);
            }
            debug!("service {} probe {attempt}/{attempts} failed", self.name);
            if attempt < attempts {
                std::thread::sleep(self.backoff);
            }
        }

        warn!(
            "service {} on {} did not become healthy; collecting diagnostics",
            self.name,
            session.address()
        );
        Err(RuntimeError::HealthCheckExhausted {
            service: self.name.clone(),
            attempts,
            diagnostics: redactor.redact(&self.diagnostics(session)),
        })
    }

    fn diagnostics(&self, session: &dyn RemoteSession) -> String {
        let commands = [
            argv(["systemctl", "cat", self.name.as_str()]),
            argv([
                "journalctl",
                "-u",
                self.name.as_str(),
                "-n",
                JOURNAL_LINES,
                "--no-pager",
            ]),
        ];
        let mut report = String::new();
        for cmd in &commands {
            let _ = writeln!(report, "$ {}", command_line(cmd));
            match session.run_command(cmd, self.timeout) {
                Ok(out) => {
                    report.push_str(&out.stdout);
                    report.push_str(&out.stderr);
                }
                Err(e) => {
                    let _ = writeln!(report, "(unavailable: {e})");
                }
            }
            if !report.ends_with('\n') {
                report.push('\n');
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExecutor;
    use crate::remote::{Credentials, RemoteExecutor};

    fn check(name: &str, attempts: u32) -> ServiceCheck {
        ServiceCheck {
            attempts,
            backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
            ..ServiceCheck::new(name)
        }
    }

    #[test]
    fn healthy_service_passes_first_probe() {
        let exec = MockExecutor::new();
        let session = exec.connect("web", &Credentials::default()).unwrap();
        let used = check("nginx", 3)
            .restart_and_verify(session.as_ref(), &Redactor::default())
            .unwrap();
        assert_eq!(used, 1);
        assert_eq!(exec.restart_count("web", "nginx"), 1);
    }

    #[test]
    fn exhaustion_reports_redacted_diagnostics() {
        let exec = MockExecutor::new();
        exec.set_unhealthy("app", true);
        exec.put_file(
            "web",
            "/etc/systemd/system/app.service",
            "[Service]\nEnvironment=API_TOKEN=tok-123\nExecStart=/opt/app --db-pass hunter2\n",
        );
        let session = exec.connect("web", &Credentials::default()).unwrap();
        let redactor = Redactor::new(vec!["hunter2".to_owned()]);

        let err = check("app", 3)
            .restart_and_verify(session.as_ref(), &redactor)
            .unwrap_err();
        match err {
            RuntimeError::HealthCheckExhausted {
                service,
                attempts,
                diagnostics,
            } => {
                assert_eq!(service, "app");
                assert_eq!(attempts, 3);
                assert!(diagnostics.contains("$ systemctl cat app"));
                assert!(diagnostics.contains("journalctl -u app -n 50 --no-pager"));
                assert!(diagnostics.contains("status=1/FAILURE"));
                assert!(!diagnostics.contains("tok-123"));
                assert!(!diagnostics.contains("hunter2"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let probes = exec
            .command_log()
            .iter()
            .filter(|l| l.starts_with("systemctl is-active"))
            .count();
        assert_eq!(probes, 3);
    }

    #[test]
    fn custom_probe_timeout_counts_as_failed_attempt() {
        let exec = MockExecutor::new();
        exec.hang_on("curl");
        let session = exec.connect("web", &Credentials::default()).unwrap();
        let mut c = check("api", 2);
        c.health_command = Some(argv(["curl", "-fsS", "http://127.0.0.1:8080/health"]));
        let err = c
            .restart_and_verify(session.as_ref(), &Redactor::default())
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::HealthCheckExhausted { attempts: 2, .. }
        ));
    }

    #[test]
    fn failed_restart_is_command_failure() {
        let exec = MockExecutor::new();
        exec.fail_on("systemctl restart");
        let session = exec.connect("web", &Credentials::default()).unwrap();
        let err = check("nginx", 3)
            .restart_and_verify(session.as_ref(), &Redactor::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { exit_code: 1, .. }));
    }
}
