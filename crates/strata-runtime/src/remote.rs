use crate::RuntimeError;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "root".to_owned(),
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An established connection to one host.
///
/// A non-zero exit status is returned as a normal [`CommandOutput`]; errors
/// are reserved for transport failures and timeouts.
pub trait RemoteSession {
    fn address(&self) -> &str;

    fn upload_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), RuntimeError>;

    fn run_command(&self, argv: &[String], timeout: Duration)
        -> Result<CommandOutput, RuntimeError>;
}

pub trait RemoteExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession + '_>, RuntimeError>;
}

pub fn select_executor(name: &str) -> Result<Box<dyn RemoteExecutor>, RuntimeError> {
    match name {
        "ssh" => Ok(Box::new(crate::ssh::SshExecutor::new())),
        "mock" => Ok(Box::new(crate::mock::MockExecutor::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

/// Build an argv from string literals.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c))
    {
        return word.to_owned();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

pub fn command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}
