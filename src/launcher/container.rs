// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;

use crate::errors::LaunchError;
use crate::launcher::{Launcher, WorkerOutcome};
use crate::observability::messages::launcher::{WorkerExited, WorkerSpawned};
use crate::observability::messages::StructuredLog;

/// Runs a worker inside a container via the local Docker/Podman engine API.
/// The handle returned from `spawn` is the container id.
pub struct ContainerLauncher {
    docker: Docker,
    worker_image: String,
}

impl ContainerLauncher {
    /// Connect to the local container runtime. Fallible, unlike the
    /// teacher's `.expect()`-on-connect style, because `"auto"` backend
    /// resolution (spec §4.4) needs to try this and fall back rather than
    /// crash the whole orchestrator.
    pub async fn connect(worker_image: impl Into<String>) -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults().map_err(|source| LaunchError::Container {
            worker_id: "<connect>".to_string(),
            source,
        })?;
        Ok(Self {
            docker,
            worker_image: worker_image.into(),
        })
    }

    /// `true` if the daemon responds to a ping within its own default
    /// timeout. Used by `"auto"` backend resolution; never returns an error,
    /// since "is it up" is itself the question being asked.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// `true` if `image` is already pulled locally, so `"auto"` resolution
    /// doesn't silently fall back to pulling a multi-hundred-megabyte image
    /// mid-dispatch.
    pub async fn has_image(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    fn to_launch_error(worker_id: &str, source: bollard::errors::Error) -> LaunchError {
        LaunchError::Container {
            worker_id: worker_id.to_string(),
            source,
        }
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn spawn(
        &self,
        worker_id: &str,
        feature: &str,
        worktree_path: &Path,
        branch: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, LaunchError> {
        let options = CreateContainerOptions {
            name: format!("mahabharatha-worker-{worker_id}"),
            platform: None,
        };

        let bind = format!("{}:/workspace", worktree_path.display());

        let mut container_env = vec![
            format!("WORKER_ID={worker_id}"),
            format!("FEATURE={feature}"),
            format!("BRANCH={branch}"),
        ];
        container_env.extend(env.iter().map(|(k, v)| format!("{k}={v}")));

        // Security posture required by spec §4.4: workers run as an
        // unprivileged uid, the rootfs is read-only (the worktree bind mount
        // is the only writable surface), every Linux capability is dropped,
        // and the container has no network access — an untrusted LLM-driven
        // worker has no business reaching the network or the host.
        let config = Config {
            image: Some(self.worker_image.clone()),
            user: Some("1000:1000".to_string()),
            env: Some(container_env),
            working_dir: Some("/workspace".to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![bind]),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))?;

        WorkerSpawned {
            worker_id,
            task_id: worker_id,
            backend: "container",
        }
        .log();

        Ok(created.id)
    }

    async fn poll(&self, worker_id: &str, handle: &str) -> Result<Option<WorkerOutcome>, LaunchError> {
        let inspect = self
            .docker
            .inspect_container(handle, None)
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))?;

        let Some(state) = inspect.state else {
            return Ok(None);
        };

        if state.running.unwrap_or(false) {
            return Ok(None);
        }

        let exit_code = state.exit_code.map(|c| c as i32);
        let outcome = WorkerOutcome::from_exit_code(exit_code);
        WorkerExited {
            worker_id,
            exit_code,
        }
        .log();
        Ok(Some(outcome))
    }

    async fn terminate(&self, worker_id: &str, handle: &str) -> Result<(), LaunchError> {
        self.docker
            .stop_container(handle, Some(StopContainerOptions { t: 15 }))
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))
    }

    async fn kill(&self, worker_id: &str, handle: &str) -> Result<(), LaunchError> {
        self.docker
            .kill_container(handle, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))?;
        self.docker
            .remove_container(handle, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))
    }

    async fn output(&self, worker_id: &str, handle: &str) -> Result<String, LaunchError> {
        use bollard::container::LogsOptions;
        use futures_util::TryStreamExt;

        let mut stream = self.docker.logs(
            handle,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| Self::to_launch_error(worker_id, e))?
        {
            output.push_str(&chunk.to_string());
        }
        Ok(output)
    }

    fn backend_name(&self) -> &'static str {
        "container"
    }
}
