//! Running external commands.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::process::Command;
use tracing::debug;

/// Render a command line for logs, quoting arguments that need it.
pub fn command_to_string<S: AsRef<OsStr>>(command: &[S]) -> String {
    command
        .iter()
        .map(|arg| shell_quote(&arg.as_ref().to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,^{}".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Run a command with extra environment variables.
///
/// Returns stdout on success. A non-zero exit becomes
/// `Error::CommandFailed` carrying stdout followed by stderr.
pub fn command<K, V, S>(environment: &[(K, V)], command: &[S]) -> Result<String>
where
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let command_str = command_to_string(command);
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::command_failed(-1, "", "empty command"))?;

    debug!("{}", command_str);

    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in environment {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .map_err(|e| Error::command_failed(-1, command_str.clone(), e.to_string()))?;
    let status = output.status.code().unwrap_or(-1);
    debug!("{}: exit {}", program.as_ref().to_string_lossy(), status);

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(Error::command_failed(status, command_str, combined));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Environment that disables user and system git configuration.
pub const CLEAN_GIT_ENV: [(&str, &str); 3] = [
    ("HOME", ""),
    ("XDG_CONFIG_HOME", ""),
    ("GIT_CONFIG_NOSYSTEM", "1"),
];

/// Run git without user or system configuration.
pub fn clean_git<S: AsRef<OsStr>>(args: &[S]) -> Result<String> {
    clean_git_with_env::<&str, &str, S>(&[], args)
}

/// Run git without user or system configuration, plus extra environment.
pub fn clean_git_with_env<K, V, S>(environment: &[(K, V)], args: &[S]) -> Result<String>
where
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let mut env: Vec<(&OsStr, &OsStr)> = CLEAN_GIT_ENV
        .iter()
        .map(|(k, v)| (OsStr::new(*k), OsStr::new(*v)))
        .collect();
    env.extend(environment.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));

    let mut argv: Vec<&OsStr> = vec![OsStr::new("git")];
    argv.extend(args.iter().map(|a| a.as_ref()));

    command(&env, &argv)
}
