//! Startup deployment trigger.
//!
//! Runs the configured deployment script once, in the background:
//!
//! ```text
//! <script> <checksum> <archive> <host:port>...
//! ```
//!
//! The script owns connectivity retries, transfer, remote checksum
//! verification and restarting the remote process. The simulator only
//! launches it and logs what it printed.

use crate::config::DeployConfig;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What the deployment script did
#[derive(Debug)]
pub struct DeployOutcome {
    pub status: ExitStatus,
    /// stdout followed by stderr
    pub output: String,
}

/// Run the deployment script to completion
pub async fn run(deploy: &DeployConfig, work_dir: &Path) -> io::Result<DeployOutcome> {
    let output = Command::new(&deploy.script)
        .arg(&deploy.checksum)
        .arg(&deploy.archive)
        .args(&deploy.targets)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(DeployOutcome {
        status: output.status,
        output: combined,
    })
}

/// Fire-and-forget: launch the script on a background task and log the result
pub fn spawn(deploy: DeployConfig, work_dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            script = %deploy.script.display(),
            targets = deploy.targets.len(),
            "Starting deployment"
        );

        match run(&deploy, &work_dir).await {
            Ok(outcome) => {
                for line in outcome.output.lines().filter(|l| !l.trim().is_empty()) {
                    info!(target: "deploy", "{line}");
                }
                if outcome.status.success() {
                    info!(status = %outcome.status, "Deployment finished");
                } else {
                    warn!(status = %outcome.status, "Deployment script failed");
                }
            }
            Err(e) => {
                error!(script = %deploy.script.display(), error = %e, "Failed to launch deployment script");
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn deploy(script: &str) -> DeployConfig {
        DeployConfig {
            script: PathBuf::from(script),
            checksum: PathBuf::from("build.sha256"),
            archive: PathBuf::from("build.tar.gz"),
            targets: vec!["10.0.0.21:22".to_string(), "10.0.0.22:22".to_string()],
        }
    }

    #[tokio::test]
    async fn test_run_passes_arguments() {
        let dir = assert_fs::TempDir::new().unwrap();
        let outcome = run(&deploy("echo"), dir.path()).await.unwrap();

        assert!(outcome.status.success());
        assert_eq!(
            outcome.output,
            "build.sha256 build.tar.gz 10.0.0.21:22 10.0.0.22:22\n"
        );
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let dir = assert_fs::TempDir::new().unwrap();
        let outcome = run(&deploy("false"), dir.path()).await.unwrap();
        assert!(!outcome.status.success());
    }

    #[tokio::test]
    async fn test_missing_script() {
        let dir = assert_fs::TempDir::new().unwrap();
        assert!(run(&deploy("/nonexistent/deploy.sh"), dir.path()).await.is_err());

        // The background variant only logs
        spawn(deploy("/nonexistent/deploy.sh"), dir.path().to_path_buf())
            .await
            .unwrap();
    }
}
