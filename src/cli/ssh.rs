//! SSH transport
//!
//! Production [`ArrayGateway`]: runs the system `ssh` client for every
//! command. Key authentication is preferred; password-only setups go
//! through `sshpass -e` so the secret never appears on a command line.

use super::command::ArrayCommand;
use crate::config::DriverConfig;
use crate::domain::{ArrayGateway, CommandOutput};
use crate::error::{Error, Result};
use async_trait::async_trait;
use shell_escape::unix::escape;
use std::ffi::OsString;
use tokio::process::Command;
use tracing::debug;

/// SSH connection settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl From<&DriverConfig> for SshConfig {
    fn from(config: &DriverConfig) -> Self {
        Self {
            host: config.san_ip.clone(),
            port: config.san_ssh_port,
            login: config.san_login.clone(),
            password: config.san_password.clone(),
            private_key: config.san_private_key.clone(),
        }
    }
}

/// Gateway that shells out to `ssh`
#[derive(Debug, Clone)]
pub struct SshGateway {
    config: SshConfig,
}

impl SshGateway {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Remote command line with every token shell-escaped
    pub fn remote_command_line(command: &ArrayCommand) -> String {
        command
            .argv()
            .into_iter()
            .map(|token| escape(token.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Program and arguments for one invocation
    fn invocation(&self, command: &ArrayCommand) -> (String, Vec<OsString>) {
        let mut args: Vec<OsString> = Vec::new();
        let program = if self.config.private_key.is_none() && self.config.password.is_some() {
            args.extend(["-e".into(), "ssh".into()]);
            "sshpass".to_string()
        } else {
            "ssh".to_string()
        };

        args.extend([
            "-p".into(),
            self.config.port.to_string().into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ]);
        if let Some(key) = &self.config.private_key {
            args.extend(["-i".into(), key.into(), "-o".into(), "BatchMode=yes".into()]);
        }
        args.push(format!("{}@{}", self.config.login, self.config.host).into());
        args.push(Self::remote_command_line(command).into());
        (program, args)
    }
}

#[async_trait]
impl ArrayGateway for SshGateway {
    async fn execute(&self, command: &ArrayCommand) -> Result<CommandOutput> {
        let (program, args) = self.invocation(command);
        debug!("ssh {}@{}: {}", self.config.login, self.config.host, command);

        let mut child = Command::new(&program);
        child.args(&args).kill_on_drop(true);
        if program == "sshpass" {
            if let Some(password) = &self.config.password {
                child.env("SSHPASS", password);
            }
        }

        let output = child.output().await.map_err(|e| Error::CommandExecution {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("failed to spawn {}: {}", program, e),
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
