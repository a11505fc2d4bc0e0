//! Docker provider: one container per sandbox.
//!
//! The container's main process is `sleep <ttl>`, so it stops on its own
//! once the lifetime runs out. Commands run through exec, files move as tar
//! archives.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{HostConfig, PortBinding, PortMap};
use bollard::Docker;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{
    ByteStream, CommandApi, CreateRequest, FileContent, FilesystemApi, Process, ProcessEvent,
    ProviderError, RemoteSandbox, SandboxProvider, Utf8Decoder,
};
use crate::config::DockerConfig;

const LABEL: &str = "dev.sandman.sandbox";
const READ_CHUNK: usize = 64 * 1024;

/// Provider backed by the local Docker daemon.
pub(crate) struct DockerProvider {
    config: DockerConfig,
}

impl DockerProvider {
    pub(crate) fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    async fn client(&self) -> Result<Docker, ProviderError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ProviderError::connection(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        docker.ping().await.map_err(|e| {
            ProviderError::connection(format!("Cannot ping Docker daemon. Is Docker running? {e}"))
        })?;
        Ok(docker)
    }

    fn sandbox(&self, docker: Docker, id: String) -> Arc<dyn RemoteSandbox> {
        Arc::new(DockerSandbox {
            docker,
            id,
            workdir: self.config.workdir.clone(),
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, request: &CreateRequest) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let docker = self.client().await?;
        let short = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("sandman-{}", &short[..12]);

        debug!("Creating container: {}", name);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                build_container_config(&self.config, request),
            )
            .await
            .map_err(|e| classify(&name, e))?;

        debug!("Starting container");
        docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| classify(&name, e))?;

        Ok(self.sandbox(docker, name))
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteSandbox>, ProviderError> {
        let docker = self.client().await?;
        let info = docker
            .inspect_container(sandbox_id, None)
            .await
            .map_err(|e| classify(sandbox_id, e))?;

        let state = info.state.unwrap_or_default();
        if state.paused == Some(true) {
            return Err(ProviderError::unavailable(format!("Sandbox {sandbox_id} is paused")));
        }
        if state.running != Some(true) {
            return Err(ProviderError::unavailable(format!(
                "Sandbox {sandbox_id} not found (container is not running)"
            )));
        }

        Ok(self.sandbox(docker, sandbox_id.to_string()))
    }
}

fn build_container_config(config: &DockerConfig, request: &CreateRequest) -> ContainerConfig<String> {
    let ports: Vec<String> = request.ports.iter().map(|p| format!("{p}/tcp")).collect();

    let exposed_ports = ports
        .iter()
        .map(|key| (key.clone(), HashMap::new()))
        .collect::<HashMap<_, _>>();

    let port_bindings: PortMap = ports
        .iter()
        .map(|key| {
            (
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    // Empty host port lets Docker pick an ephemeral one
                    host_port: Some(String::new()),
                }]),
            )
        })
        .collect();

    ContainerConfig {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            "sleep".to_string(),
            request.timeout.as_secs().max(1).to_string(),
        ]),
        working_dir: Some(config.workdir.clone()),
        labels: Some(HashMap::from([(LABEL.to_string(), "true".to_string())])),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Maps daemon errors onto the provider taxonomy.
fn classify(id: &str, error: DockerError) -> ProviderError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::unavailable(format!("Sandbox {id} not found: {message}")),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ProviderError::api(status_code, message),
        other => ProviderError::connection(other.to_string()),
    }
}

struct DockerSandbox {
    docker: Docker,
    id: String,
    workdir: String,
}

impl DockerSandbox {
    fn commands_api(&self) -> DockerCommands {
        DockerCommands {
            docker: self.docker.clone(),
            id: self.id.clone(),
            workdir: self.workdir.clone(),
        }
    }
}

#[async_trait]
impl RemoteSandbox for DockerSandbox {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn commands(&self) -> Option<Arc<dyn CommandApi>> {
        Some(Arc::new(self.commands_api()))
    }

    async fn filesystem(&self) -> Option<Arc<dyn FilesystemApi>> {
        Some(Arc::new(DockerFilesystem {
            commands: self.commands_api(),
        }))
    }

    async fn hostname(&self, port: u16) -> Result<String, ProviderError> {
        let info = self
            .docker
            .inspect_container(&self.id, None)
            .await
            .map_err(|e| classify(&self.id, e))?;

        let ports = info
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();
        published_port(&ports, port)
            .map(|host_port| format!("localhost:{host_port}"))
            .ok_or_else(|| ProviderError::other(format!("Port {port} is not published")))
    }

    async fn kill(&self) -> Result<(), ProviderError> {
        self.docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(&self.id, e))
    }
}

/// Host port Docker bound for `port`, if any.
fn published_port(ports: &PortMap, port: u16) -> Option<String> {
    ports
        .get(&format!("{port}/tcp"))?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.clone())
        .filter(|host_port| !host_port.is_empty())
}

#[derive(Clone)]
struct DockerCommands {
    docker: Docker,
    id: String,
    workdir: String,
}

#[async_trait]
impl CommandApi for DockerCommands {
    async fn spawn(&self, argv: &[String]) -> Result<Process, ProviderError> {
        if argv.is_empty() {
            return Err(ProviderError::spawn("empty command"));
        }

        let exec = self
            .docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    working_dir: Some(self.workdir.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ProviderError::spawn(format!("Failed to create exec: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::spawn(format!("Failed to start exec: {e}")))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(ProviderError::spawn("exec started detached"));
        };

        let docker = self.docker.clone();
        let exec_id = exec.id.clone();
        let events = async_stream::stream! {
            let mut out = Utf8Decoder::default();
            let mut err = Utf8Decoder::default();

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        let text = out.push(&message);
                        if !text.is_empty() {
                            yield Ok(ProcessEvent::Stdout(text));
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        let text = err.push(&message);
                        if !text.is_empty() {
                            yield Ok(ProcessEvent::Stderr(text));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(ProviderError::connection(format!("Error reading exec output: {e}")));
                        return;
                    }
                }
            }

            let (out, err) = (out.finish(), err.finish());
            if !out.is_empty() {
                yield Ok(ProcessEvent::Stdout(out));
            }
            if !err.is_empty() {
                yield Ok(ProcessEvent::Stderr(err));
            }

            match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => {
                    let code = inspect
                        .exit_code
                        .and_then(|code| i32::try_from(code).ok())
                        .unwrap_or(-1);
                    yield Ok(ProcessEvent::Exit { code, status: format!("exit status {code}") });
                }
                Err(e) => yield Err(ProviderError::connection(format!("Failed to inspect exec: {e}"))),
            }
        };

        Ok(Process {
            pid: Some(exec.id),
            events: events.boxed(),
        })
    }
}

struct DockerFilesystem {
    commands: DockerCommands,
}

impl DockerFilesystem {
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.commands.workdir.trim_end_matches('/'), path)
        }
    }
}

#[async_trait]
impl FilesystemApi for DockerFilesystem {
    async fn write(&self, path: &str, content: FileContent) -> Result<(), ProviderError> {
        let target = self.resolve(path);
        let target = Path::new(&target);
        let parent = target
            .parent()
            .map_or_else(|| "/".to_string(), |p| p.display().to_string());
        let name = target
            .file_name()
            .ok_or_else(|| ProviderError::other(format!("Invalid file path: {path}")))?
            .to_string_lossy()
            .into_owned();

        // upload_to_container needs the destination directory to exist
        self.commands
            .run(&["mkdir".to_string(), "-p".to_string(), parent.clone()])
            .await?;

        let archive = single_file_tar(&name, &content.into_bytes())?;
        self.commands
            .docker
            .upload_to_container(
                &self.commands.id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| classify(&self.commands.id, e))
    }

    async fn read(&self, path: &str) -> Result<ByteStream, ProviderError> {
        let archive: Vec<u8> = self
            .commands
            .docker
            .download_from_container(
                &self.commands.id,
                Some(DownloadFromContainerOptions {
                    path: self.resolve(path),
                }),
            )
            .map_ok(|chunk| chunk.to_vec())
            .try_concat()
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => ProviderError::file_not_found(path),
                other => classify(&self.commands.id, other),
            })?;

        let content = first_file_in_tar(&archive)?;
        let chunks: Vec<Result<Bytes, ProviderError>> = content
            .chunks(READ_CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Builds an in-memory tar archive holding one regular file.
fn single_file_tar(name: &str, content: &[u8]) -> Result<Bytes, ProviderError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().try_into().unwrap_or_default());
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| ProviderError::other(format!("Failed to build archive: {e}")))?;
    builder
        .into_inner()
        .map(Bytes::from)
        .map_err(|e| ProviderError::other(format!("Failed to build archive: {e}")))
}

/// Extracts the first regular file from a tar archive.
fn first_file_in_tar(archive: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let invalid = |e: std::io::Error| ProviderError::other(format!("Invalid archive: {e}"));
    let mut archive = tar::Archive::new(archive);

    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).map_err(invalid)?;
            return Ok(content);
        }
    }

    Err(ProviderError::other("Archive holds no regular file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_container_config() {
        let config = DockerConfig::default();
        let request = CreateRequest {
            timeout: Duration::from_millis(600_000),
            ports: vec![3000, 8080],
        };

        let container = build_container_config(&config, &request);
        assert_eq!(container.image.as_deref(), Some("ubuntu:24.04"));
        assert_eq!(
            container.cmd,
            Some(vec!["sleep".to_string(), "600".to_string()])
        );

        let exposed = container.exposed_ports.unwrap();
        assert!(exposed.contains_key("3000/tcp"));
        assert!(exposed.contains_key("8080/tcp"));

        let bindings = container.host_config.unwrap().port_bindings.unwrap();
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn test_published_port() {
        let ports: PortMap = HashMap::from([
            (
                "3000/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some("49153".to_string()),
                }]),
            ),
            ("8080/tcp".to_string(), None),
        ]);

        assert_eq!(published_port(&ports, 3000).as_deref(), Some("49153"));
        assert_eq!(published_port(&ports, 8080), None);
        assert_eq!(published_port(&ports, 9999), None);
    }

    #[test]
    fn test_tar_roundtrip() {
        let content = b"binary\0data\xff".to_vec();
        let archive = single_file_tar("blob.bin", &content).unwrap();
        assert_eq!(first_file_in_tar(&archive).unwrap(), content);
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify(
            "sandman-abc",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(err.is_unavailable());

        let err = classify(
            "sandman-abc",
            DockerError::DockerResponseServerError {
                status_code: 500,
                message: "boom".to_string(),
            },
        );
        assert!(!err.is_unavailable());
    }
}
