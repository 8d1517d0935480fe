//! Docker build executor.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use buildlane_core::{BuildExecutor, BuildJob, BuildOutcome, DockerRunConfig, Error, JobId, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Log lines attached to the outcome of a failed build.
const FAILURE_LOG_TAIL: &str = "20";

/// Seconds Docker waits after SIGTERM before killing a stopped container.
const STOP_GRACE_SECONDS: i64 = 5;

/// Upper limits an agent allows builds to request. 0 means no cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub max_cpu_count: u32,
    pub max_memory_mb: u64,
    pub max_memory_swap_mb: u64,
}

impl ContainerLimits {
    /// Host configuration for a build, with requested limits capped.
    pub fn host_config(&self, run: &DockerRunConfig) -> HostConfig {
        let cpus = cap(run.cpu_count as u64, self.max_cpu_count as u64);
        let memory_mb = cap(run.memory_mb, self.max_memory_mb);
        let memory_swap_mb = cap(run.memory_swap_mb, self.max_memory_swap_mb).map(|swap| {
            // Docker rejects a memory+swap limit below the memory limit.
            memory_mb.map_or(swap, |memory| swap.max(memory))
        });

        HostConfig {
            network_mode: run.network_disabled.then(|| "none".to_string()),
            nano_cpus: cpus.map(|c| saturating_i64(c.saturating_mul(1_000_000_000))),
            memory: memory_mb.map(mb_to_bytes),
            memory_swap: memory_swap_mb.map(mb_to_bytes),
            ..Default::default()
        }
    }
}

/// Effective limit: the request capped by `max`, `None` when both are unset.
fn cap(requested: u64, max: u64) -> Option<u64> {
    match (requested, max) {
        (0, 0) => None,
        (0, max) => Some(max),
        (requested, 0) => Some(requested),
        (requested, max) => Some(requested.min(max)),
    }
}

fn mb_to_bytes(mb: u64) -> i64 {
    saturating_i64(mb.saturating_mul(1024 * 1024))
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Runs build jobs in local Docker containers.
pub struct DockerBuildExecutor {
    docker: Docker,
    limits: ContainerLimits,
}

impl DockerBuildExecutor {
    /// Create a new executor connecting to the local Docker daemon.
    pub fn new(limits: ContainerLimits) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker, limits })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, limits: ContainerLimits) -> Self {
        Self { docker, limits }
    }

    fn container_name(job_id: JobId) -> String {
        format!("buildlane-job-{}", job_id)
    }

    fn container_config(&self, job: &BuildJob) -> Config<String> {
        let run = &job.build_config.docker_run_config;
        let labels = HashMap::from([
            ("buildlane.job-id".to_string(), job.id.to_string()),
            ("buildlane.course-id".to_string(), job.course_id.to_string()),
        ]);

        Config {
            image: Some(job.build_config.docker_image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                job.build_config.build_script.clone(),
            ]),
            env: Some(run.env.clone()),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(self.limits.host_config(run)),
            ..Default::default()
        }
    }

    /// Pull the image unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::ExecutionFailed(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wait for the container to exit and return its exit code.
    async fn wait_for_exit(&self, container_name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exit codes are reported as wait errors.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::ExecutionFailed(format!(
                "Failed to wait for container: {}",
                e
            ))),
            None => Err(Error::ExecutionFailed(
                "Container wait stream ended without a result".to_string(),
            )),
        }
    }

    async fn log_tail(&self, container_name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: FAILURE_LOG_TAIL.to_string(),
            ..Default::default()
        };

        let mut lines = Vec::new();
        let mut stream = self.docker.logs(container_name, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    lines.push(String::from_utf8_lossy(&message).trim_end().to_string());
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            }
        }
        lines.join("\n")
    }

    async fn stop(&self, container_name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                container_name,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to stop container: {}",
                e
            ))),
        }
    }

    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }

    async fn remove_quietly(&self, container_name: &str) {
        if let Err(e) = self.remove(container_name).await {
            warn!(container = %container_name, error = %e, "Failed to clean up container");
        }
    }
}

/// The container no longer exists or is already stopped.
fn is_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }
    )
}

#[async_trait]
impl BuildExecutor for DockerBuildExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutcome> {
        let container_name = Self::container_name(job.id);
        self.ensure_image(&job.build_config.docker_image).await?;

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(job_id = %job.id, container = %container_name, "Creating container");
        self.docker
            .create_container(Some(create_options), self.container_config(job))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(&container_name).await;
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        let timeout = Duration::from_secs(job.build_config.timeout_seconds);
        let outcome = match tokio::time::timeout(timeout, self.wait_for_exit(&container_name)).await
        {
            Err(_) => {
                warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "Build timed out");
                if let Err(e) = self.stop(&container_name).await {
                    warn!(job_id = %job.id, error = %e, "Failed to stop timed out container");
                }
                Ok(BuildOutcome::timed_out())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) => Ok(BuildOutcome::successful()),
            Ok(Ok(code)) => {
                let tail = self.log_tail(&container_name).await;
                Ok(BuildOutcome::failed(
                    Some(code as i32),
                    format!("build script exited with code {}\n{}", code, tail),
                ))
            }
        };

        self.remove_quietly(&container_name).await;
        outcome
    }

    async fn interrupt(&self, job_id: JobId) -> Result<()> {
        let container_name = Self::container_name(job_id);
        info!(job_id = %job_id, container = %container_name, "Interrupting build");
        self.stop(&container_name).await?;
        self.remove(&container_name).await
    }
}
