//! Blocking external-process execution.
//!
//! Every external tool the pipeline drives (the reconstruction engine, the
//! geometry converter, the analysis binaries) goes through [`run`]: spawn
//! with inherited stdout/stderr so the operator sees the tool's own
//! output, block until exit, and fail loudly on a nonzero status. Failed
//! runs are never retried.

use std::ffi::OsStr;
use std::process::Command;

use crate::error::{Error, Result};

/// Run `program` with `args`, blocking until it exits.
///
/// # Errors
///
/// [`Error::Spawn`] when the program cannot be started,
/// [`Error::ExternalProcess`] on a nonzero exit status. A termination by
/// signal is reported as status `-1`.
pub fn run<S: AsRef<OsStr>>(program: impl AsRef<OsStr>, args: &[S]) -> Result<()> {
    let command = display_command(program.as_ref(), args);
    log::info!("running: {command}");

    let status = Command::new(program.as_ref())
        .args(args)
        .status()
        .map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;

    if !status.success() {
        return Err(Error::ExternalProcess {
            command,
            status: status.code().unwrap_or(-1),
        });
    }
    log::info!("command ended with status 0");
    Ok(())
}

fn display_command<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut command = program.to_string_lossy().into_owned();
    for arg in args {
        command.push(' ');
        command.push_str(&arg.as_ref().to_string_lossy());
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_ok() {
        run("sh", &["-c", "exit 0"]).unwrap();
    }

    #[test]
    fn nonzero_exit_carries_the_status() {
        let error = run("sh", &["-c", "exit 7"]).unwrap_err();
        match error {
            Error::ExternalProcess { status, .. } => assert_eq!(status, 7),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let error = run("calo-calib-no-such-binary", &[] as &[&str]).unwrap_err();
        assert!(matches!(error, Error::Spawn { .. }));
    }
}
