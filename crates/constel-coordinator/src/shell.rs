use std::process::Command;

use anyhow::{Context, Result, bail};

/// Run a host tool and return its stdout. A non-zero exit is an error carrying stderr.
pub fn run(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "Command failed (exit {}): {} {}: {}",
            output.status.code().unwrap_or(-1),
            cmd,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
