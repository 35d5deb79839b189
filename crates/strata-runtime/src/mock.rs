//! In-memory provider and executor used by tests and `backend = "mock"`.
//!
//! `MockExecutor` simulates just enough of a Linux host (files, `ufw`,
//! `systemctl`, `journalctl`) to observe whether provisioning converges.

use crate::provider::{Attributes, ResourceProvider, ResourceSpec};
use crate::remote::{command_line, CommandOutput, Credentials, RemoteExecutor, RemoteSession};
use crate::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use strata_schema::ResourceHandle;

fn poisoned<T>(e: &std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::Provider(format!("mutex poisoned: {e}"))
}

#[derive(Default)]
struct ProviderState {
    resources: BTreeMap<String, ResourceSpec>,
    next_address: u32,
    creates: usize,
    destroys: usize,
    fail_on: BTreeSet<String>,
    released: Vec<String>,
    fail_release: bool,
}

#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProviderState>, RuntimeError> {
        self.state.lock().map_err(|e| poisoned(&e))
    }

    /// Make `create_or_update_resource` fail for resources with this name.
    pub fn fail_on(&self, resource_name: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_on.insert(resource_name.to_owned());
        }
    }

    /// Remove a resource behind the orchestrator's back, as external drift would.
    pub fn forget(&self, handle: &ResourceHandle) {
        if let Ok(mut s) = self.state.lock() {
            s.resources.remove(handle.as_str());
        }
    }

    /// Make `release_stable_address` fail.
    pub fn fail_release(&self, fail: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_release = fail;
        }
    }

    /// Addresses handed back through `release_stable_address`.
    pub fn released_addresses(&self) -> Vec<String> {
        self.state.lock().map(|s| s.released.clone()).unwrap_or_default()
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().map(|s| s.resources.len()).unwrap_or(0)
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().map(|s| s.creates).unwrap_or(0)
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.lock().map(|s| s.destroys).unwrap_or(0)
    }
}

impl ResourceProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_or_update_resource(
        &self,
        spec: &ResourceSpec,
    ) -> Result<ResourceHandle, RuntimeError> {
        let mut s = self.lock()?;
        s.creates += 1;
        if s.fail_on.contains(&spec.name) {
            return Err(RuntimeError::Provider(format!(
                "injected failure creating '{}'",
                spec.name
            )));
        }
        let handle = spec.handle();
        s.resources.insert(handle.to_string(), spec.clone());
        Ok(handle)
    }

    fn destroy_resource(&self, handle: &ResourceHandle) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        s.destroys += 1;
        s.resources
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ResourceNotFound(handle.to_string()))
    }

    fn describe_resource(&self, handle: &ResourceHandle) -> Result<Attributes, RuntimeError> {
        let s = self.lock()?;
        s.resources
            .get(handle.as_str())
            .map(|spec| spec.attributes(handle))
            .ok_or_else(|| RuntimeError::ResourceNotFound(handle.to_string()))
    }

    fn allocate_stable_address(&self) -> Result<String, RuntimeError> {
        let mut s = self.lock()?;
        s.next_address += 1;
        Ok(format!("192.0.2.{}", s.next_address))
    }

    fn release_stable_address(&self, address: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        if s.fail_release {
            return Err(RuntimeError::Provider(format!(
                "injected failure releasing '{address}'"
            )));
        }
        s.released.push(address.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct MockHost {
    files: BTreeMap<String, Vec<u8>>,
    firewall: Vec<String>,
    restarts: BTreeMap<String, u32>,
    scripts_run: Vec<String>,
    script_env: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Default)]
struct ExecutorState {
    hosts: BTreeMap<String, MockHost>,
    calls: usize,
    connects: usize,
    failing_connects: u32,
    fail_on: Vec<String>,
    unhealthy: BTreeSet<String>,
    command_log: Vec<String>,
    hang_on: Vec<String>,
    dropped: Vec<(String, u32)>,
}

/// Simulated fleet of hosts, keyed by address.
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ExecutorState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    /// Total remote operations issued: connects, uploads and commands.
    pub fn call_count(&self) -> usize {
        self.with_state(|s| s.calls).unwrap_or(0)
    }

    pub fn connect_count(&self) -> usize {
        self.with_state(|s| s.connects).unwrap_or(0)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.with_state(|s| s.command_log.clone()).unwrap_or_default()
    }

    /// The next `n` connection attempts fail with a transient error.
    pub fn fail_connects(&self, n: u32) {
        self.with_state(|s| s.failing_connects = n);
    }

    /// Commands whose command line contains `needle` exit with status 1.
    pub fn fail_on(&self, needle: &str) {
        self.with_state(|s| s.fail_on.push(needle.to_owned()));
    }

    /// Commands whose command line contains `needle` exceed any timeout.
    pub fn hang_on(&self, needle: &str) {
        self.with_state(|s| s.hang_on.push(needle.to_owned()));
    }

    /// The next `n` commands whose command line starts with `prefix` lose the
    /// connection before running.
    pub fn drop_connection_on(&self, prefix: &str, n: u32) {
        self.with_state(|s| s.dropped.push((prefix.to_owned(), n)));
    }

    pub fn set_unhealthy(&self, service: &str, unhealthy: bool) {
        self.with_state(|s| {
            if unhealthy {
                s.unhealthy.insert(service.to_owned());
            } else {
                s.unhealthy.remove(service);
            }
        });
    }

    pub fn put_file(&self, address: &str, path: &str, content: &str) {
        self.with_state(|s| {
            s.hosts
                .entry(address.to_owned())
                .or_default()
                .files
                .insert(path.to_owned(), content.as_bytes().to_vec())
        });
    }

    pub fn file(&self, address: &str, path: &str) -> Option<String> {
        self.with_state(|s| {
            s.hosts
                .get(address)
                .and_then(|h| h.files.get(path))
                .map(|b| String::from_utf8_lossy(b).into_owned())
        })
        .flatten()
    }

    pub fn firewall_rules(&self, address: &str) -> Vec<String> {
        self.with_state(|s| {
            s.hosts
                .get(address)
                .map(|h| h.firewall.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn restart_count(&self, address: &str, service: &str) -> u32 {
        self.with_state(|s| {
            s.hosts
                .get(address)
                .and_then(|h| h.restarts.get(service).copied())
                .unwrap_or(0)
        })
        .unwrap_or(0)
    }

    pub fn scripts_run(&self, address: &str) -> Vec<String> {
        self.with_state(|s| {
            s.hosts
                .get(address)
                .map(|h| h.scripts_run.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Environment the script at `path` last ran with.
    pub fn script_env(&self, address: &str, path: &str) -> BTreeMap<String, String> {
        self.with_state(|s| {
            s.hosts
                .get(address)
                .and_then(|h| h.script_env.get(path).cloned())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }
}

impl RemoteExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect(
        &self,
        address: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession + '_>, RuntimeError> {
        let mut s = self.state.lock().map_err(|e| poisoned(&e))?;
        s.calls += 1;
        s.connects += 1;
        if s.failing_connects > 0 {
            s.failing_connects -= 1;
            return Err(RuntimeError::Connect {
                address: address.to_owned(),
                message: "connection refused (simulated)".to_owned(),
            });
        }
        s.hosts.entry(address.to_owned()).or_default();
        Ok(Box::new(MockSession {
            executor: self,
            address: address.to_owned(),
        }))
    }
}

struct MockSession<'a> {
    executor: &'a MockExecutor,
    address: String,
}

fn output(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn ufw_rule(args: &[&str]) -> Option<String> {
    match args {
        ["from", source, "to", "any", "port", port, "proto", proto] => {
            Some(format!("{source} {port}/{proto}"))
        }
        _ => None,
    }
}

impl MockHost {
    fn execute(&mut self, argv: &[&str], unhealthy: &BTreeSet<String>) -> CommandOutput {
        match argv {
            ["env", rest @ ..] => {
                let split = rest.iter().position(|w| !w.contains('=')).unwrap_or(rest.len());
                let (assignments, command) = rest.split_at(split);
                let out = self.execute(command, unhealthy);
                if let ["bash" | "sh", path] = command {
                    if out.success() {
                        let env = assignments
                            .iter()
                            .filter_map(|a| a.split_once('='))
                            .map(|(k, v)| (k.to_owned(), v.to_owned()))
                            .collect();
                        self.script_env.insert((*path).to_owned(), env);
                    }
                }
                out
            }
            ["test", "-e", path] => output(i32::from(!self.files.contains_key(*path)), "", ""),
            ["cat", path] => match self.files.get(*path) {
                Some(bytes) => output(0, String::from_utf8_lossy(bytes), ""),
                None => output(1, "", format!("cat: {path}: No such file or directory")),
            },
            ["cp", "-p", src, dst] | ["cp", src, dst] => match self.files.get(*src).cloned() {
                Some(bytes) => {
                    self.files.insert((*dst).to_owned(), bytes);
                    output(0, "", "")
                }
                None => output(1, "", format!("cp: cannot stat '{src}'")),
            },
            ["bash", path] | ["sh", path] => {
                if self.files.contains_key(*path) {
                    self.scripts_run.push((*path).to_owned());
                    output(0, format!("ran {path}"), "")
                } else {
                    output(127, "", format!("bash: {path}: No such file or directory"))
                }
            }
            ["ufw", "delete", "allow", rest @ ..] => match ufw_rule(rest) {
                Some(rule) => match self.firewall.iter().position(|r| *r == rule) {
                    Some(i) => {
                        self.firewall.remove(i);
                        output(0, "Rule deleted", "")
                    }
                    None => output(1, "", "Could not delete non-existent rule"),
                },
                None => output(2, "", "ERROR: Invalid syntax"),
            },
            ["ufw", "allow", rest @ ..] => match ufw_rule(rest) {
                Some(rule) => {
                    self.firewall.push(rule);
                    output(0, "Rule added", "")
                }
                None => output(2, "", "ERROR: Invalid syntax"),
            },
            ["systemctl", "restart", name] => {
                *self.restarts.entry((*name).to_owned()).or_insert(0) += 1;
                output(0, "", "")
            }
            ["systemctl", "is-active", "--quiet", name] => {
                if unhealthy.contains(*name) {
                    output(3, "", "")
                } else {
                    output(0, "", "")
                }
            }
            ["systemctl", "cat", name] => {
                let unit = format!("/etc/systemd/system/{name}.service");
                match self.files.get(&unit) {
                    Some(bytes) => output(0, String::from_utf8_lossy(bytes), ""),
                    None => output(0, format!("[Service]\nExecStart=/usr/sbin/{name}\n"), ""),
                }
            }
            ["journalctl", "-u", name, ..] => output(
                0,
                format!("{name}.service: Main process exited, code=exited, status=1/FAILURE\n"),
                "",
            ),
            _ => output(0, "", ""),
        }
    }
}

impl RemoteSession for MockSession<'_> {
    fn address(&self) -> &str {
        &self.address
    }

    fn upload_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), RuntimeError> {
        let mut s = self.executor.state.lock().map_err(|e| poisoned(&e))?;
        s.calls += 1;
        s.command_log.push(format!("upload {remote_path}"));
        s.hosts
            .entry(self.address.clone())
            .or_default()
            .files
            .insert(remote_path.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn run_command(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let mut s = self.executor.state.lock().map_err(|e| poisoned(&e))?;
        s.calls += 1;
        let line = command_line(argv);
        s.command_log.push(line.clone());

        if let Some(entry) = s
            .dropped
            .iter_mut()
            .find(|(prefix, n)| *n > 0 && line.starts_with(prefix.as_str()))
        {
            entry.1 -= 1;
            return Err(RuntimeError::Connect {
                address: self.address.clone(),
                message: "Connection reset by peer (simulated)".to_owned(),
            });
        }
        if s.hang_on.iter().any(|n| line.contains(n.as_str())) {
            return Err(RuntimeError::Timeout {
                command: line,
                secs: timeout.as_secs(),
            });
        }
        if s.fail_on.iter().any(|n| line.contains(n.as_str())) {
            return Ok(output(1, "", format!("simulated failure: {line}")));
        }

        let words: Vec<&str> = argv.iter().map(String::as_str).collect();
        let unhealthy = s.unhealthy.clone();
        let host = s.hosts.entry(self.address.clone()).or_default();
        Ok(host.execute(&words, &unhealthy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::argv;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn mock_provider_lifecycle() {
        let provider = MockProvider::new();
        let spec = ResourceSpec {
            environment: "dev".to_owned(),
            isolation_key: "k".to_owned(),
            layer: "01-core".to_owned(),
            name: "vpc".to_owned(),
            kind: "network".to_owned(),
            properties: BTreeMap::new(),
            address: None,
        };
        let handle = provider.create_or_update_resource(&spec).unwrap();
        assert_eq!(provider.resource_count(), 1);
        assert_eq!(provider.describe_resource(&handle).unwrap()["name"], "vpc");
        provider.destroy_resource(&handle).unwrap();
        assert!(provider.destroy_resource(&handle).is_err());
        assert_eq!(provider.destroy_calls(), 2);

        provider.release_stable_address("192.0.2.1").unwrap();
        provider.fail_release(true);
        assert!(provider.release_stable_address("192.0.2.2").is_err());
        assert_eq!(provider.released_addresses(), vec!["192.0.2.1"]);

        provider.fail_on("vpc");
        assert!(provider.create_or_update_resource(&spec).is_err());
    }

    #[test]
    fn mock_host_files_and_scripts() {
        let exec = MockExecutor::new();
        let session = exec.connect("192.0.2.1", &Credentials::default()).unwrap();
        session.upload_file(b"echo hi\n", "/tmp/a.sh").unwrap();
        assert!(session.run_command(&argv(["bash", "/tmp/a.sh"]), T).unwrap().success());
        assert!(!session.run_command(&argv(["bash", "/tmp/b.sh"]), T).unwrap().success());
        assert_eq!(exec.scripts_run("192.0.2.1"), vec!["/tmp/a.sh"]);

        let cat = session.run_command(&argv(["cat", "/tmp/a.sh"]), T).unwrap();
        assert_eq!(cat.stdout, "echo hi\n");
        assert!(!session.run_command(&argv(["cat", "/nope"]), T).unwrap().success());
        assert_eq!(exec.call_count(), 6);

        let with_env = argv(["env", "DB_PASSWORD=pw", "bash", "/tmp/a.sh"]);
        assert!(session.run_command(&with_env, T).unwrap().success());
        assert_eq!(exec.script_env("192.0.2.1", "/tmp/a.sh")["DB_PASSWORD"], "pw");
        assert_eq!(session.run_command(&argv(["test", "-e", "/tmp/a.sh"]), T).unwrap().exit_code, 0);
        assert_eq!(session.run_command(&argv(["test", "-e", "/nope"]), T).unwrap().exit_code, 1);
    }

    #[test]
    fn mock_ufw_semantics() {
        let exec = MockExecutor::new();
        let session = exec.connect("h", &Credentials::default()).unwrap();
        let allow = argv(["ufw", "allow", "from", "10.0.0.0/8", "to", "any", "port", "22", "proto", "tcp"]);
        let delete = argv(["ufw", "delete", "allow", "from", "10.0.0.0/8", "to", "any", "port", "22", "proto", "tcp"]);
        session.run_command(&allow, T).unwrap();
        session.run_command(&allow, T).unwrap();
        assert_eq!(exec.firewall_rules("h").len(), 2);
        assert!(session.run_command(&delete, T).unwrap().success());
        assert!(session.run_command(&delete, T).unwrap().success());
        assert!(!session.run_command(&delete, T).unwrap().success());
    }

    #[test]
    fn injected_failures() {
        let exec = MockExecutor::new();
        exec.fail_connects(1);
        assert!(exec.connect("h", &Credentials::default()).is_err());
        let session = exec.connect("h", &Credentials::default()).unwrap();

        exec.fail_on("restart");
        let out = session
            .run_command(&argv(["systemctl", "restart", "nginx"]), T)
            .unwrap();
        assert_eq!(out.exit_code, 1);

        exec.hang_on("sleep");
        assert!(matches!(
            session.run_command(&argv(["sleep", "100"]), T),
            Err(RuntimeError::Timeout { .. })
        ));

        exec.set_unhealthy("nginx", true);
        let probe = session
            .run_command(&argv(["systemctl", "is-active", "--quiet", "nginx"]), T)
            .unwrap();
        assert_eq!(probe.exit_code, 3);

        exec.drop_connection_on("ufw", 1);
        let allow = argv(["ufw", "allow", "from", "10.0.0.0/8", "to", "any", "port", "22", "proto", "tcp"]);
        assert!(matches!(
            session.run_command(&allow, T),
            Err(RuntimeError::Connect { .. })
        ));
        assert!(session.run_command(&allow, T).unwrap().success());
    }
}
