//! Appliance access over the system `ssh` client.

use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::Appliance;

/// Where and how to reach the appliance.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
    pub known_hosts_file: PathBuf,
    pub connect_timeout: Duration,
    /// Upper bound on a single remote command, including connection setup.
    pub command_timeout: Duration,
}

/// Runs every operation as a non-interactive `ssh` invocation.
#[derive(Debug, Clone)]
pub struct SshAppliance {
    target: SshTarget,
}

impl SshAppliance {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    fn command(&self, remote_command: &str) -> Command {
        let target = &self.target;
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg("-i")
            .arg(&target.identity_file)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=yes")
            .arg("-o")
            .arg(format!(
                "UserKnownHostsFile={}",
                target.known_hosts_file.display()
            ))
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                target.connect_timeout.as_secs().max(1)
            ))
            .arg(format!("{}@{}", target.user, target.host))
            .arg("--")
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn exec(&self, remote_command: &str, stdin: Option<&str>) -> Result<String> {
        debug!(host = %self.target.host, command = %remote_command, "ssh exec");

        let mut cmd = self.command(remote_command);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().context("Failed to spawn ssh")?;

        if let Some(input) = stdin {
            let mut pipe = child.stdin.take().context("ssh stdin not captured")?;
            pipe.write_all(input.as_bytes())
                .await
                .context("Failed to write to ssh stdin")?;
            pipe.shutdown().await.context("Failed to close ssh stdin")?;
        }

        let output = tokio::time::timeout(self.target.command_timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "ssh command timed out after {}s",
                    self.target.command_timeout.as_secs()
                )
            })?
            .context("Failed to wait for ssh")?;

        if !output.status.success() {
            anyhow::bail!(
                "remote command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Quote a single argument for a POSIX shell on the appliance.
fn quote(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

fn push_command(remote_path: &str) -> String {
    format!("sudo tee {} > /dev/null", quote(remote_path))
}

fn remove_command(remote_path: &str) -> String {
    format!("sudo rm -f {}", quote(remote_path))
}

fn fetch_command(remote_path: &str) -> String {
    let path = quote(remote_path);
    format!("if [ -f {path} ]; then sudo cat {path}; fi")
}

#[async_trait]
impl Appliance for SshAppliance {
    async fn push_file(&self, remote_path: &str, content: &str) -> Result<()> {
        self.exec(&push_command(remote_path), Some(content))
            .await
            .with_context(|| format!("Failed to push {remote_path}"))?;
        Ok(())
    }

    async fn remove_file(&self, remote_path: &str) -> Result<()> {
        self.exec(&remove_command(remote_path), None)
            .await
            .with_context(|| format!("Failed to remove {remote_path}"))?;
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<()> {
        self.exec(command, None)
            .await
            .with_context(|| format!("Failed to run `{command}`"))?;
        Ok(())
    }

    async fn fetch_file(&self, remote_path: &str) -> Result<String> {
        self.exec(&fetch_command(remote_path), None)
            .await
            .with_context(|| format!("Failed to fetch {remote_path}"))
    }
}
