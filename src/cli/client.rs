//! Checked command execution
//!
//! [`ArrayClient`] is the only place raw command output is judged. A
//! command succeeds when it exits zero with an empty stderr; anything on
//! stderr is surfaced even with a zero exit code. Array error codes found
//! on stderr are classified into the driver taxonomy here and nowhere else.

use super::command::{ArrayCommand, DELIM};
use super::response::{CliResponse, Layout};
use crate::domain::{ArrayGatewayRef, CommandOutput};
use crate::error::{ArrayErrorCode, Error, Result};
use tracing::debug;

/// Array command client
#[derive(Clone)]
pub struct ArrayClient {
    gateway: ArrayGatewayRef,
}

impl ArrayClient {
    pub fn new(gateway: ArrayGatewayRef) -> Self {
        Self { gateway }
    }

    /// Run a command and return its raw output without judging it
    pub async fn run_unchecked(&self, command: &ArrayCommand) -> Result<CommandOutput> {
        debug!("array command: {}", command);
        let output = self.gateway.execute(command).await?;
        debug!(
            "array reply to {}: exit={} stdout={:?} stderr={:?}",
            command.verb(),
            output.exit_code,
            output.stdout,
            output.stderr
        );
        Ok(output)
    }

    /// Run a command and fail on a non-zero exit or any stderr output
    pub async fn run(&self, command: &ArrayCommand) -> Result<CommandOutput> {
        let output = self.run_unchecked(command).await?;
        check(command, output)
    }

    /// Run a table listing
    pub async fn table(&self, command: &ArrayCommand) -> Result<CliResponse> {
        let output = self.run(command).await?;
        CliResponse::parse(command.verb(), &output.stdout, DELIM, Layout::Table)
    }

    /// Run a `key!value` listing
    pub async fn detail(&self, command: &ArrayCommand) -> Result<CliResponse> {
        let output = self.run(command).await?;
        CliResponse::parse(command.verb(), &output.stdout, DELIM, Layout::Detail)
    }

    /// Run a creating command and return the id the array assigned
    pub async fn create(&self, command: &ArrayCommand) -> Result<String> {
        let output = self.run(command).await?;
        created_id(command.verb(), &output.stdout)
    }
}

/// Judge one command's output
pub fn check(command: &ArrayCommand, output: CommandOutput) -> Result<CommandOutput> {
    if output.is_clean() {
        return Ok(output);
    }

    let (kind, name) = command.target();
    if let Some(code) = ArrayErrorCode::find_in(&output.stderr) {
        return Err(code.classify(command.verb(), kind, name, &output.stderr));
    }

    if output.exit_code != 0 {
        return Err(Error::CommandExecution {
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }

    Err(Error::BackendApi {
        operation: command.verb().to_string(),
        code: None,
        message: output.stderr.trim().to_string(),
    })
}

/// Extract `N` from `..., id [N], successfully created`. When several ids
/// are printed (`Vdisk [3] copy [1] ...`) the last one names the new object.
pub fn created_id(verb: &str, stdout: &str) -> Result<String> {
    let malformed = || Error::MalformedResponse {
        command: verb.to_string(),
        reason: format!("no object id in '{}'", stdout.trim()),
    };
    let open = stdout.rfind('[').ok_or_else(malformed)?;
    let close = stdout[open..].find(']').ok_or_else(malformed)? + open;
    let id = stdout[open + 1..close].trim();
    if id.is_empty() || !stdout.contains("successfully created") {
        return Err(malformed());
    }
    Ok(id.to_string())
}
