use anyhow::{anyhow, Result};
use blake3;
use log::{info, warn};
use std::{
    collections::BTreeMap as Map,
    path::{Path, PathBuf},
};

use crate::{
    context::BuildContext,
    error::RecipeError,
    hasher::DigestHasher,
    models::{
        BuildPolicy, Container, ContainerId, ContainerName, ContainerSpec, ContainerStatus,
        ImageBuildSpec, ImageId, ImageName, PullPolicy,
    },
    recipe::DependencyManifest,
    services::{ContainerBackend, ProjectRecipe},
};

const LABEL_PROJECT: &str = "io.podman.recipe.project";
const LABEL_HASH: &str = "io.podman.recipe.hash";
const LABEL_IMAGE_HASH: &str = "io.podman.recipe.image-hash";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContainerOperation {
    Create,
    Recreate,
    Start,
    Stop,
    Remove,
}

pub struct Controller {
    backend: Box<dyn ContainerBackend>,
    project: ProjectRecipe,
    containers: Map<ContainerName, Container>,
    project_name: String,
    context_dir: PathBuf,
}

impl Controller {
    pub fn init<B, P, C>(
        project_name: P,
        backend: B,
        project: ProjectRecipe,
        context_dir: C,
    ) -> Result<Controller>
    where
        B: 'static + ContainerBackend,
        P: Into<String>,
        C: AsRef<Path>,
    {
        let project_name = project_name.into();
        let mut backend = Box::new(backend);
        let containers = backend.list_containers(vec![(LABEL_PROJECT, project_name.as_str())])?;

        Ok(Controller {
            backend,
            project,
            containers,
            project_name,
            context_dir: context_dir.as_ref().into(),
        })
    }

    fn base_image(&self) -> ImageName {
        ImageName(self.project.recipe.base_image.to_string())
    }

    pub fn pull_base_image(&mut self, pull_policy: PullPolicy) -> Result<()> {
        let base_image = self.base_image();
        let image = self.backend.get_image(&base_image)?;

        match (pull_policy, image) {
            (PullPolicy::IfNotPresent, None) | (PullPolicy::Always, _) => {
                info!("pulling base image {}", base_image.0);
                self.backend.pull_image(&base_image)?;
            }
            _ => (),
        }

        Ok(())
    }

    /// The service uid must be free in the base image, otherwise the build
    /// would silently reuse somebody else's identity.
    pub fn check_identity(&mut self) -> Result<()> {
        let base_image = self.base_image();
        let uid = self.project.recipe.identity.uid;

        if self.backend.identity_exists(&base_image, uid)? {
            return Err(RecipeError::IdentityCollision {
                uid,
                image: base_image.0,
            }
            .into());
        }

        Ok(())
    }

    /// Builds the service image. Returns `None` when the policy allowed
    /// reusing an image built from identical inputs.
    pub fn build_image(
        &mut self,
        build_policy: BuildPolicy,
        pull_policy: PullPolicy,
    ) -> Result<Option<ImageId>> {
        let recipe = self.project.recipe.clone();
        recipe.validate()?;
        let manifest = DependencyManifest::load(self.context_dir.join(&recipe.manifest))?;
        if manifest.is_empty() {
            warn!("{:?} lists no packages", recipe.manifest);
        }

        let image_hash = recipe.image_hash(&self.context_dir)?;
        let image_name = self.project.image_name.clone();

        if build_policy == BuildPolicy::IfChanged {
            if let Some(image) = self.backend.get_image(&image_name)? {
                if image.labels.get(LABEL_IMAGE_HASH) == Some(&image_hash) {
                    info!("image {} is up to date", image_name.0);
                    return Ok(None);
                }
            }
        }

        self.pull_base_image(pull_policy)?;
        self.check_identity()?;

        let context = BuildContext::stage(&recipe, &self.context_dir)?;

        let mut labels = Map::new();
        labels.insert(LABEL_PROJECT.to_owned(), self.project_name.clone());
        labels.insert(LABEL_IMAGE_HASH.to_owned(), image_hash);

        let image_spec = ImageBuildSpec {
            name: image_name,
            context: context.path().into(),
            containerfile: context.containerfile(),
            format: recipe.image_format(),
            labels,
        };

        info!(
            "building image {} from {} bytes of context with {} pinned packages",
            image_spec.name.0,
            context.size(),
            context.manifest().packages().count()
        );
        let image_id = self.backend.build_image(image_spec)?;
        context.close()?;

        Ok(Some(image_id))
    }

    fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.project.container_name.clone(),
            image_name: self.project.image_name.clone(),
            publish: (self.project.host_port, self.project.recipe.port),
            labels: Default::default(),
        }
    }

    /// The spec hash covers the image id so a rebuilt image recreates the container.
    fn spec_hash(&mut self, spec: &ContainerSpec) -> Result<String> {
        let image = self.backend.get_image(&spec.image_name)?;

        let mut hasher = blake3::Hasher::new();
        hasher.input(spec);
        hasher.input(image.map(|image| image.id));
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Finds containers labelled with this project that are not the service
    /// container, e.g. left behind after renaming the service.
    pub fn find_orphans(&mut self) -> Result<Vec<ContainerName>> {
        let orphans = self
            .containers
            .keys()
            .filter(|name| **name != self.project.container_name)
            .cloned()
            .collect::<Vec<_>>();

        info!("found orphans: {:?}", orphans);

        Ok(orphans)
    }

    pub fn start_container_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let spec = self.container_spec();
        let spec_hash = self.spec_hash(&spec)?;

        let container = match self.containers.get(&spec.name) {
            Some(container) => container,
            None => return Ok(vec![(spec.name, ContainerOperation::Create)]),
        };

        let container_hash = container.labels.get(LABEL_HASH);
        let operation = if container_hash.map(|h| *h == spec_hash).unwrap_or(false) {
            match container.status {
                ContainerStatus::Configured => Some(ContainerOperation::Start),
                ContainerStatus::Running => None,
                ContainerStatus::Exited => Some(ContainerOperation::Start),
                ContainerStatus::Unknown => Some(ContainerOperation::Recreate),
            }
        } else {
            Some(ContainerOperation::Recreate)
        };

        Ok(operation
            .map(|operation| (spec.name, operation))
            .into_iter()
            .collect())
    }

    pub fn stop_container_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let name = &self.project.container_name;
        let diff = match self.containers.get(name) {
            Some(container) if container.status == ContainerStatus::Running => {
                vec![(name.clone(), ContainerOperation::Stop)]
            }
            _ => vec![],
        };

        Ok(diff)
    }

    pub fn remove_container_diff(&mut self) -> Result<Vec<(ContainerName, ContainerOperation)>> {
        let name = &self.project.container_name;
        let diff = match self.containers.get(name) {
            Some(_container) => vec![(name.clone(), ContainerOperation::Remove)],
            None => vec![],
        };

        Ok(diff)
    }

    pub fn container_apply(
        &mut self,
        name: &ContainerName,
        operation: ContainerOperation,
        timeout: u32,
    ) -> Result<()> {
        let existing = |containers: &Map<ContainerName, Container>| -> Result<Container> {
            containers
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("could not find container {:?}", name))
        };

        match operation {
            ContainerOperation::Create => {
                let container_id = self.container_create()?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Recreate => {
                let container = existing(&self.containers)?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
                let container_id = self.container_create()?;
                self.backend.start_container(&container_id.0)?;
            }
            ContainerOperation::Start => {
                let container = existing(&self.containers)?;
                self.backend.start_container(&container.id.0)?;
            }
            ContainerOperation::Stop => {
                let container = existing(&self.containers)?;
                self.backend.stop_container(&container.id.0, timeout)?;
            }
            ContainerOperation::Remove => {
                let container = existing(&self.containers)?;

                if container.status == ContainerStatus::Running {
                    self.backend.stop_container(&container.id.0, timeout)?;
                }
                self.backend.remove_container(&container.id.0, false)?;
            }
        }

        Ok(())
    }

    pub fn container_create(&mut self) -> Result<ContainerId> {
        let mut spec = self.container_spec();
        let hash = self.spec_hash(&spec)?;

        if self.backend.get_image(&spec.image_name)?.is_none() {
            return Err(anyhow!(
                "image {} does not exist, build it first",
                spec.image_name.0
            ));
        }

        spec.labels
            .insert(LABEL_PROJECT.into(), self.project_name.clone());
        spec.labels.insert(LABEL_HASH.into(), hash);

        let id = self.backend.create_container(spec)?;

        Ok(id)
    }
}
