use anyhow::Result;
use std::{collections::BTreeMap as Map, path::Path};

use crate::{
    models::{
        Container, ContainerId, ContainerName, ContainerSpec, Image, ImageBuildSpec, ImageId,
        ImageName,
    },
    recipe::Recipe,
};

pub trait RecipeFrontend {
    fn recipe<P: AsRef<Path>>(&mut self, project_name: &str, recipe_file_path: P)
        -> Result<ProjectRecipe>;
}

/// A recipe together with the names derived from the project it belongs to.
#[derive(Clone, Debug)]
pub struct ProjectRecipe {
    pub image_name: ImageName,
    pub container_name: ContainerName,
    pub host_port: u16,
    pub recipe: Recipe,
}

pub trait ContainerBackend {
    fn get_image(&mut self, name: &ImageName) -> Result<Option<Image>>;

    fn pull_image(&mut self, name: &ImageName) -> Result<ImageId>;

    fn build_image(&mut self, image_spec: ImageBuildSpec) -> Result<ImageId>;

    /// Whether `uid` already has a passwd entry inside `image`.
    fn identity_exists(&mut self, image: &ImageName, uid: u32) -> Result<bool>;

    fn list_containers(
        &mut self,
        labels: Vec<(&str, &str)>,
    ) -> Result<Map<ContainerName, Container>>;

    fn create_container(&mut self, container_spec: ContainerSpec) -> Result<ContainerId>;

    fn start_container(&mut self, name: &str) -> Result<ContainerId>;

    fn stop_container(&mut self, name: &str, timeout: u32) -> Result<ContainerId>;

    fn remove_container(&mut self, name: &str, remove_volumes: bool) -> Result<ContainerId>;
}
