use tokio::process::Command;

/// Run a user-supplied shell snippet, logging its output. Never fails the
/// caller. Returns whether the command ran and exited successfully.
pub async fn run(label: &str, command: &str) -> bool {
    tracing::info!("Running {}: '{}'", label, command);

    let output = match Command::new("sh").arg("-c").arg(command).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Failed to start {}: {}", label, e);
            return false;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::info!("{}: {}", label, stdout.trim_end());
    }

    if !output.status.success() {
        tracing::error!(
            "{} exited with {}: {}",
            label,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
        return false;
    }
    true
}
