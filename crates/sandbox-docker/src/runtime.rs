use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use futures_util::StreamExt;
use sandbox::{ExecOutput, ExecRequest, SandboxError, SandboxRuntime, SandboxSpec};
use tracing::{debug, info};

use crate::command::{collect_output, split_argv};
use crate::config::DockerConfig;

/// HTTP 304: the container is already in the requested state.
const NOT_MODIFIED: u16 = 304;

/// [`SandboxRuntime`] backed by the local Docker Engine.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect to the daemon using the platform defaults (`DOCKER_HOST` or
    /// the local socket) and verify it answers.
    pub async fn connect(config: DockerConfig) -> sandbox::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::BackendNotAvailable(format!("docker connect: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("docker ping: {e}")))?;
        Ok(Self { docker, config })
    }

    fn container_name(&self) -> String {
        format!("{}-{}", self.config.name_prefix, uuid::Uuid::new_v4())
    }
}

fn is_not_modified(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == NOT_MODIFIED
    )
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self, spec: &SandboxSpec) -> sandbox::Result<()> {
        if self.docker.inspect_image(&spec.image).await.is_ok() {
            debug!(image = %spec.image, "image present locally");
            return Ok(());
        }

        info!(image = %spec.image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: spec.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                SandboxError::BackendNotAvailable(format!("pull {}: {e}", spec.image))
            })?;
        }
        info!(image = %spec.image, "image pulled");
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> sandbox::Result<String> {
        let name = self.container_name();
        // A TTY with open stdin keeps the image's default process alive,
        // so the container stays up between start and exec.
        let config = Config {
            image: Some(spec.image.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("create {name}: {e}")))?;
        debug!(sandbox = %name, "container created");
        Ok(name)
    }

    async fn start(&self, name: &str) -> sandbox::Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(SandboxError::StartFailed(format!("start {name}: {e}"))),
        }
    }

    async fn push_archive(&self, name: &str, path: &str, archive: Vec<u8>) -> sandbox::Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_owned(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(name, Some(options), archive.into())
            .await
            .map_err(|e| SandboxError::StageFailed(format!("upload to {name}:{path}: {e}")))
    }

    async fn exec(&self, name: &str, request: &ExecRequest<'_>) -> sandbox::Result<ExecOutput> {
        let argv = split_argv(request.cmd);
        if argv.is_empty() {
            return Err(SandboxError::ExecFailed("empty command".into()));
        }

        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    working_dir: Some(request.workdir.to_owned()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("create exec in {name}: {e}")))?;

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { output, .. }) => {
                let output = collect_output(output)
                    .await
                    .map_err(|e| SandboxError::ExecFailed(format!("read output of {name}: {e}")))?;
                Ok(ExecOutput { output })
            }
            Ok(StartExecResults::Detached) => Err(SandboxError::ExecFailed(format!(
                "exec in {name} started detached"
            ))),
            Err(e) => Err(SandboxError::ExecFailed(format!("start exec in {name}: {e}"))),
        }
    }

    async fn stop(&self, name: &str) -> sandbox::Result<()> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout_secs,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(SandboxError::RemovalFailed(format!("stop {name}: {e}"))),
        }
    }

    async fn remove(&self, name: &str) -> sandbox::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| SandboxError::RemovalFailed(format!("remove {name}: {e}")))
    }
}
