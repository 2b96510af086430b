use std::io;
use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::settings::Settings;

/// A command to run on the annotation host, kept as a structured
/// program/argument vector so no caller ever splices values into shell text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Compound step expressed as a small `sh` script. Values are passed as
    /// positional parameters (`$1`, `$2`, …), never substituted into the
    /// script text itself.
    pub fn shell(script: &str, args: &[&str]) -> Self {
        let mut command = Self::new("sh").arg("-c").arg(script).arg("sh");
        for arg in args {
            command = command.arg(*arg);
        }
        command
    }

    /// Single-line rendering for log events.
    pub fn to_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of one remote invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Capability to run commands on the annotation host and to move corpus
/// directories to and from it. Injected into the job state machine so tests
/// and alternative transports can substitute their own.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, command: &RemoteCommand) -> io::Result<CommandOutput>;

    /// Copy a local file or directory into `remote_dir` on the annotation
    /// host. With `delete`, files missing locally are removed remotely.
    async fn push(&self, local: &Path, remote_dir: &str, delete: bool) -> io::Result<CommandOutput>;

    /// Copy `remote_dir` from the annotation host into `local`, optionally
    /// restricted by rsync-style filter arguments.
    async fn pull(
        &self,
        remote_dir: &str,
        local: &Path,
        filters: &[String],
    ) -> io::Result<CommandOutput>;
}

/// Quote a value for inclusion in generated shell script text.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Production executor: ssh for commands, rsync for directory transfer.
pub struct SshExecutor {
    host: String,
    user: String,
    ssh_key: String,
}

impl SshExecutor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            host: settings.remote_host.clone(),
            user: settings.remote_user.clone(),
            ssh_key: settings.ssh_key.clone(),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The remote sshd hands our command line to a shell, so each token is
    /// quoted to keep the argv boundaries we were given.
    fn remote_line(command: &RemoteCommand) -> String {
        let mut line = shell_quote(&command.program);
        for arg in &command.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, command), fields(command = %command.to_line()))]
    async fn run(&self, command: &RemoteCommand) -> io::Result<CommandOutput> {
        let output = Command::new("ssh")
            .arg("-i")
            .arg(&self.ssh_key)
            .arg(self.target())
            .arg(Self::remote_line(command))
            .output()
            .await?;
        let output = CommandOutput::from(output);
        debug!(exit_code = ?output.exit_code, "remote command finished");
        Ok(output)
    }

    #[instrument(skip(self, local))]
    async fn push(&self, local: &Path, remote_dir: &str, delete: bool) -> io::Result<CommandOutput> {
        let mut command = Command::new("rsync");
        command.arg("-av");
        if delete {
            command.arg("--delete");
        }
        command
            .arg("-e")
            .arg(format!("ssh -i {}", self.ssh_key))
            .arg(local)
            .arg(format!("{}:{}/", self.target(), remote_dir));
        Ok(CommandOutput::from(command.output().await?))
    }

    #[instrument(skip(self, local))]
    async fn pull(
        &self,
        remote_dir: &str,
        local: &Path,
        filters: &[String],
    ) -> io::Result<CommandOutput> {
        let mut command = Command::new("rsync");
        command.arg("-av");
        for filter in filters {
            command.arg(filter);
        }
        command
            .arg("-e")
            .arg(format!("ssh -i {}", self.ssh_key))
            .arg(format!("{}:{}", self.target(), remote_dir))
            .arg(local);
        Ok(CommandOutput::from(command.output().await?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!("'plain.txt'", shell_quote("plain.txt"));
        assert_eq!("'with space'", shell_quote("with space"));
        assert_eq!("'it'\\''s'", shell_quote("it's"));
    }

    #[test]
    fn test_shell_command_positional_args() {
        let command = RemoteCommand::shell(r#"mkdir -p "$1""#, &["corpora/demo"]);
        assert_eq!("sh", command.program);
        assert_eq!(
            vec!["-c", r#"mkdir -p "$1""#, "sh", "corpora/demo"],
            command.args
        );
    }

    #[test]
    fn test_remote_line_is_fully_quoted() {
        let command = RemoteCommand::new("kill").arg("-0").arg("4242");
        assert_eq!("'kill' '-0' '4242'", SshExecutor::remote_line(&command));
    }
}
