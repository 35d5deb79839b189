use crate::remote::{command_line, shell_quote, CommandOutput, Credentials, RemoteExecutor, RemoteSession};
use crate::{RuntimeError, TIMEOUT_EXIT_CODE};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// ssh reserves this status for its own (connection-level) failures.
const SSH_TRANSPORT_ERROR: i32 = 255;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Remote execution through the system `ssh` client in batch mode.
pub struct SshExecutor {
    program: String,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            program: "ssh".to_owned(),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

struct SshSession<'a> {
    program: &'a str,
    address: String,
    credentials: Credentials,
}

impl SshSession<'_> {
    fn args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!(
                "ConnectTimeout={}",
                self.credentials.connect_timeout.as_secs().max(1)
            ),
            "-o".to_owned(),
            "StrictHostKeyChecking=accept-new".to_owned(),
            "-p".to_owned(),
            self.credentials.port.to_string(),
        ];
        if let Some(identity) = &self.credentials.identity_file {
            args.push("-i".to_owned());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.credentials.user, self.address));
        args.push("--".to_owned());
        args.push(remote_command.to_owned());
        args
    }

    fn ssh(
        &self,
        remote_command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let output = run_with_timeout(self.program, &self.args(remote_command), stdin, timeout)
            .map_err(|e| match e {
                RuntimeError::Timeout { secs, .. } => RuntimeError::Timeout {
                    command: remote_command.to_owned(),
                    secs,
                },
                other => other,
            })?;
        if output.exit_code == SSH_TRANSPORT_ERROR {
            return Err(RuntimeError::Connect {
                address: self.address.clone(),
                message: output.stderr.trim().to_owned(),
            });
        }
        Ok(output)
    }
}

impl RemoteSession for SshSession<'_> {
    fn address(&self) -> &str {
        &self.address
    }

    fn upload_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), RuntimeError> {
        let parent = match remote_path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => "/",
        };
        let staging = format!("{remote_path}.strata-upload");
        let script = format!(
            "mkdir -p {dir} && cat > {tmp} && mv -f {tmp} {dest}",
            dir = shell_quote(parent),
            tmp = shell_quote(&staging),
            dest = shell_quote(remote_path),
        );
        let timeout = self.credentials.connect_timeout + Duration::from_secs(60);
        let output = self.ssh(&script, Some(bytes), timeout)?;
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("upload {remote_path}"),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        debug!("uploaded {} bytes to {}:{remote_path}", bytes.len(), self.address);
        Ok(())
    }

    fn run_command(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        self.ssh(&command_line(argv), None, timeout)
    }
}

impl RemoteExecutor for SshExecutor {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn connect(
        &self,
        address: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession + '_>, RuntimeError> {
        let session = SshSession {
            program: &self.program,
            address: address.to_owned(),
            credentials: credentials.clone(),
        };
        let probe = session.ssh(
            "true",
            None,
            credentials.connect_timeout + Duration::from_secs(5),
        )?;
        if !probe.success() {
            return Err(RuntimeError::Connect {
                address: address.to_owned(),
                message: probe.stderr.trim().to_owned(),
            });
        }
        debug!("connected to {}@{address}", credentials.user);
        Ok(Box::new(session))
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Run a local program with a hard deadline. The child is killed at the
/// deadline and the call fails with [`RuntimeError::Timeout`].
pub(crate) fn run_with_timeout(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, RuntimeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RuntimeError::BackendUnavailable(program.to_owned()),
            _ => RuntimeError::Io(e),
        })?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let bytes = bytes.to_vec();
            Some(thread::spawn(move || pipe.write_all(&bytes)))
        }
        _ => None,
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill_and_reap(&mut child);
                return Err(RuntimeError::Timeout {
                    command: program.to_owned(),
                    secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(RuntimeError::Io(e));
            }
        }
    };

    if let Some(w) = writer {
        if let Ok(Err(e)) = w.join() {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(RuntimeError::Io(e));
            }
        }
    }
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(TIMEOUT_EXIT_CODE),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}
