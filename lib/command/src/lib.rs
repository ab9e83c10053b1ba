use docksmith_client::entities::{
  docksmith_timestamp, update::Log,
};
use run_command::async_run_command;

/// Run a shell command and capture its output as an audit [Log]
/// stamped with the stage name. The docker adapter and the
/// pre-update script runner record every engine interaction
/// through here.
pub async fn run_docksmith_command(
  stage: &str,
  command: impl Into<String>,
) -> Log {
  let command = command.into();
  let start_ts = docksmith_timestamp();
  let output = async_run_command(&command).await;
  Log {
    stage: stage.to_string(),
    success: output.success(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    start_ts,
    end_ts: docksmith_timestamp(),
  }
}
