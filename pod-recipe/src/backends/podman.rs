use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    env, fs,
    path::Path,
    process::{Command, Output, Stdio},
};
use tempfile::TempDir;

use crate::{
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus, Image,
        ImageBuildSpec, ImageId, ImageName,
    },
    services::ContainerBackend,
};

/// Drives the `podman` command line. Set `PODMAN` to use another binary with
/// the same interface.
pub struct PodmanBackend {
    program: String,
}

#[derive(Debug, Deserialize)]
struct InspectImage {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Labels", default)]
    labels: Option<Map<String, String>>,

    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<Map<String, String>>,
}

#[derive(Debug, Deserialize)]
struct PsContainer {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Names", default)]
    names: Vec<String>,

    #[serde(rename = "State")]
    state: String,

    #[serde(rename = "Labels", default)]
    labels: Option<Map<String, String>>,
}

impl PodmanBackend {
    pub fn connect() -> Result<PodmanBackend> {
        let program = env::var("PODMAN").unwrap_or_else(|_| "podman".into());
        let backend = PodmanBackend { program };

        let version = backend.run(&["--version"])?;
        info!("using {}", version.trim());

        Ok(backend)
    }

    fn command(&self, args: &[&str]) -> Command {
        debug!("{} {}", self.program, args.join(" "));
        let mut command = Command::new(&self.program);
        command.args(args);
        command
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        self.command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| anyhow!("could not run {}: {}", self.program, err))
    }

    /// Runs a command to completion and returns its stdout, failing on a
    /// non-zero exit with the command's stderr.
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed ({}): {}",
                self.program,
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs a command with its output passed through to the terminal.
    fn run_attached(&self, args: &[&str]) -> Result<()> {
        let status = self
            .command(args)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| anyhow!("could not run {}: {}", self.program, err))?;
        if !status.success() {
            return Err(anyhow!(
                "{} {} failed ({})",
                self.program,
                args.first().unwrap_or(&""),
                status
            ));
        }
        Ok(())
    }
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr).to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
}

fn parse_status(state: &str) -> ContainerStatus {
    match state.to_ascii_lowercase().as_str() {
        "configured" | "created" => ContainerStatus::Configured,
        "running" => ContainerStatus::Running,
        "exited" | "stopped" => ContainerStatus::Exited,
        status => {
            warn!("unknown container status: {:?}", status);
            ContainerStatus::Unknown
        }
    }
}

fn utf8_path<'a>(path: &'a Path, what: &str) -> Result<&'a str> {
    path.to_str()
        .ok_or_else(|| anyhow!("the {} path is not valid utf-8", what))
}

fn build_args(spec: &ImageBuildSpec, iidfile: &Path) -> Result<Vec<String>> {
    let mut args = vec![
        "build".to_owned(),
        "--format".to_owned(),
        spec.format.as_str().to_owned(),
        "--file".to_owned(),
        utf8_path(&spec.containerfile, "containerfile")?.to_owned(),
        "--tag".to_owned(),
        spec.name.0.clone(),
        "--iidfile".to_owned(),
        utf8_path(iidfile, "image id file")?.to_owned(),
    ];
    args.extend(label_args(&spec.labels));
    args.push(utf8_path(&spec.context, "context")?.to_owned());
    Ok(args)
}

fn label_args(labels: &Map<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(key, value)| vec!["--label".to_owned(), format!("{}={}", key, value)])
        .collect()
}

impl ContainerBackend for PodmanBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>> {
        let output = self.output(&["image", "inspect", name.0.as_str()])?;

        if !output.status.success() {
            if is_missing(&output.stderr) {
                return Ok(None);
            }
            return Err(anyhow!(
                "could not inspect image {}: {}",
                name.0,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let images: Vec<InspectImage> = serde_json::from_slice(&output.stdout)?;
        let InspectImage { id, labels, config } = match images.into_iter().next() {
            Some(image) => image,
            None => return Ok(None),
        };

        let labels = labels
            .or_else(|| config.and_then(|config| config.labels))
            .unwrap_or_else(Default::default);

        Ok(Some(Image {
            id: ImageId(id),
            labels,
        }))
    }

    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId> {
        self.run_attached(&["pull", name.0.as_str()])?;

        let image = self
            .get_image(name)?
            .ok_or_else(|| anyhow!("image {} missing after pull", name.0))?;
        Ok(image.id)
    }

    fn build_image(&mut self, spec: ImageBuildSpec) -> Result<ImageId> {
        let temp_dir = TempDir::new()?;
        let iidfile = temp_dir.path().join("iid");

        let args = build_args(&spec, &iidfile)?;
        self.run_attached(&args.iter().map(String::as_str).collect::<Vec<_>>())?;

        let image_id = fs::read_to_string(&iidfile)?;
        temp_dir.close()?;

        Ok(ImageId(image_id.trim().to_owned()))
    }

    fn identity_exists(&mut self, image: &ImageName, uid: u32) -> Result<bool> {
        let uid = uid.to_string();
        let output = self.output(&[
            "run",
            "--rm",
            "--user",
            "0",
            "--entrypoint",
            "getent",
            image.0.as_str(),
            "passwd",
            uid.as_str(),
        ])?;

        // getent exits 2 when the key is not in the database.
        match output.status.code() {
            Some(0) => {
                debug!(
                    "uid {} taken in {}: {}",
                    uid,
                    image.0,
                    String::from_utf8_lossy(&output.stdout).trim()
                );
                Ok(true)
            }
            Some(2) => Ok(false),
            _ => Err(anyhow!(
                "could not look up uid {} in {} ({}): {}",
                uid,
                image.0,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>> {
        let mut containers = Map::new();

        let filters = labels
            .iter()
            .map(|(label, value)| format!("label={}={}", label, value))
            .collect::<Vec<_>>();
        let mut args = vec!["ps", "--all", "--format", "json"];
        for filter in filters.iter() {
            args.push("--filter");
            args.push(filter.as_str());
        }

        let stdout = self.run(&args)?;
        if stdout.trim().is_empty() {
            return Ok(containers);
        }
        let reply: Vec<PsContainer> = serde_json::from_str(&stdout)?;

        'container_loop: for container in reply {
            let container_labels = container.labels.unwrap_or_else(Default::default);
            for (label, value) in labels.iter() {
                let container_label_value = container_labels.get(*label).map(|s| s.as_str());
                if container_label_value != Some(*value) {
                    continue 'container_loop;
                }
            }

            let name = match container.names.into_iter().next() {
                Some(name) => ContainerName(name),
                None => continue,
            };

            let container = Container {
                id: ContainerId(container.id),
                name,
                status: parse_status(&container.state),
                labels: container_labels,
            };
            containers.insert(container.name.clone(), container);
        }

        Ok(containers)
    }

    fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        let publish = format!("{}:{}", spec.publish.0, spec.publish.1);
        let labels = label_args(&spec.labels);

        let mut args = vec![
            "create",
            "--name",
            spec.name.0.as_str(),
            "--publish",
            publish.as_str(),
        ];
        args.extend(labels.iter().map(String::as_str));
        args.push(spec.image_name.0.as_str());

        let stdout = self.run(&args)?;
        Ok(ContainerId(stdout.trim().to_owned()))
    }

    fn start_container(&mut self, name: &str) -> Result<ContainerId> {
        let stdout = self.run(&["start", name])?;
        Ok(ContainerId(stdout.trim().to_owned()))
    }

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId> {
        let timeout = timeout.to_string();
        let stdout = self.run(&["stop", "--time", timeout.as_str(), name])?;
        Ok(ContainerId(stdout.trim().to_owned()))
    }

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId> {
        let mut args = vec!["rm"];
        if remove_volumes {
            args.push("--volumes");
        }
        args.push(name);

        let stdout = self.run(&args)?;
        Ok(ContainerId(stdout.trim().to_owned()))
    }
}
