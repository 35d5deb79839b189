use crate::redact::Redactor;
use crate::remote::{command_line, RemoteSession};
use crate::RuntimeError;
use std::time::Duration;
use strata_schema::Protocol;
use tracing::debug;

/// Upper bound on delete passes; a host holding more copies of one rule than
/// this is reported rather than looped on.
const MAX_DUPLICATE_DELETES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub source: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl FirewallRule {
    pub fn key(&self) -> (String, u16, Protocol) {
        (self.source.clone(), self.port, self.protocol)
    }

    fn spec(&self) -> Vec<String> {
        vec![
            "from".to_owned(),
            self.source.clone(),
            "to".to_owned(),
            "any".to_owned(),
            "port".to_owned(),
            self.port.to_string(),
            "proto".to_owned(),
            self.protocol.as_str().to_owned(),
        ]
    }

    pub fn allow_argv(&self) -> Vec<String> {
        let mut argv = vec!["ufw".to_owned(), "allow".to_owned()];
        argv.extend(self.spec());
        argv
    }

    pub fn delete_argv(&self) -> Vec<String> {
        let mut argv = vec!["ufw".to_owned(), "delete".to_owned(), "allow".to_owned()];
        argv.extend(self.spec());
        argv
    }

    /// Remove every existing copy of the rule, then add it once.
    ///
    /// Returns how many pre-existing copies were removed.
    pub fn converge(
        &self,
        session: &dyn RemoteSession,
        timeout: Duration,
        redactor: &Redactor,
    ) -> Result<u32, RuntimeError> {
        let delete = self.delete_argv();
        let mut removed = 0;
        loop {
            if removed >= MAX_DUPLICATE_DELETES {
                return Err(RuntimeError::CommandFailed {
                    command: command_line(&delete),
                    exit_code: 0,
                    stderr: format!("more than {MAX_DUPLICATE_DELETES} copies of the rule"),
                });
            }
            if !session.run_command(&delete, timeout)?.success() {
                break;
            }
            removed += 1;
        }

        let allow = self.allow_argv();
        let out = session.run_command(&allow, timeout)?;
        if !out.success() {
            return Err(RuntimeError::CommandFailed {
                command: command_line(&allow),
                exit_code: out.exit_code,
                stderr: redactor.redact(&out.stderr),
            });
        }
        debug!(
            "firewall {} {}/{} on {} (removed {removed} prior)",
            self.source,
            self.port,
            self.protocol.as_str(),
            session.address()
        );
        Ok(removed)
    }
}
