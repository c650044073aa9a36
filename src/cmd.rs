use crate::{EngineError, Result};
use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

/// Runs `cmd` to completion with stdout/stderr captured. Blocks for as long as
/// the tool runs; a non-zero exit is returned as `Ok` for the caller to judge.
pub fn run_captured(cmd: &mut Command, tool: &str) -> Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.output().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
            tool: tool.to_string(),
        },
        _ => EngineError::Io(e),
    })
}

pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub fn first_line_of_stdout(output: &Output) -> Option<String> {
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from flashing up while the tools run.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}
