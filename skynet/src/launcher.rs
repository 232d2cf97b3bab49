//! Continue-session launcher
//!
//! Turns [`LaunchRequest`]s from the pipeline into runs of the configured
//! agent program. New transcript lines written by that run reach the pipeline
//! through the watcher like any other write.

use anyhow::{Context, Result};
use skynet_core::commands::render_args;
use skynet_core::config::CommandConfig;
use skynet_core::LaunchRequest;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serve requests until `shutdown` fires or the pipeline drops its outlet.
///
/// Each request runs in its own task so a long agent run does not hold up
/// the next one.
pub async fn run(
    config: CommandConfig,
    mut requests: mpsc::Receiver<LaunchRequest>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let config = config.clone();
        tokio::spawn(async move {
            match launch(&config, &request).await {
                Ok(status) if status.success() => {
                    tracing::info!(session_id = %request.session_id, "Continue run finished");
                }
                Ok(status) => {
                    tracing::warn!(session_id = %request.session_id, %status, "Continue run failed");
                }
                Err(e) => {
                    tracing::error!(session_id = %request.session_id, error = %e, "Cannot launch continue run");
                }
            }
        });
    }
    tracing::debug!("Launcher stopped");
}

/// Run the configured program once for `request` and wait for it
pub async fn launch(config: &CommandConfig, request: &LaunchRequest) -> Result<ExitStatus> {
    let args = render_args(&config.args, &request.session_id, &request.text);
    let mut command = tokio::process::Command::new(&config.program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // The agent resumes a session relative to where it ran
    if let Some(cwd) = request.cwd.as_deref().filter(|dir| Path::new(dir).is_dir()) {
        command.current_dir(cwd);
    }

    tracing::info!(
        session_id = %request.session_id,
        program = %config.program,
        cwd = request.cwd.as_deref().unwrap_or("-"),
        "Launching continue run"
    );
    command
        .status()
        .await
        .with_context(|| format!("failed to spawn {}", config.program))
}
