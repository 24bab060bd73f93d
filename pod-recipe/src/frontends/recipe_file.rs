use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_yaml;
use std::{
    convert::TryFrom,
    fs::File,
    path::{Path, PathBuf},
};

use crate::{
    models::{ContainerName, EntryPoint, Identity, ImageName, ImageReference, ListenPort, LogLevel},
    recipe::Recipe,
    services::{ProjectRecipe, RecipeFrontend},
};

const DEFAULT_SERVICE: &str = "service";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    pub version: String,

    pub name: Option<String>,

    pub image: Option<String>,

    pub base_image: Option<String>,

    pub workdir: Option<PathBuf>,

    pub manifest: Option<PathBuf>,

    pub payload: Option<Payload>,

    pub user: Option<User>,

    pub port: Option<u16>,

    /// Host port the container port is published on.
    pub publish: Option<u16>,

    pub log_level: Option<String>,

    pub entry_point: Option<String>,

    pub server: Option<String>,

    pub health_check: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Payload {
    Short(PathBuf),
    Extended {
        source: PathBuf,

        dest: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct User {
    pub uid: u32,

    pub username: String,
}

pub struct RecipeFileFrontend;

impl RecipeFileFrontend {
    pub fn new() -> RecipeFileFrontend {
        RecipeFileFrontend
    }

    fn project_recipe(project_name: &str, file: RecipeFile) -> Result<ProjectRecipe> {
        if file.version != "1" {
            return Err(anyhow!(
                "unsupported recipe file version {:?}, expected \"1\"",
                file.version
            ));
        }

        let defaults = Recipe::default();

        let base_image = match file.base_image {
            Some(reference) => reference.parse::<ImageReference>()?,
            None => defaults.base_image,
        };

        let (payload, payload_dest) = match file.payload {
            Some(Payload::Short(source)) => (source.clone(), source),
            Some(Payload::Extended { source, dest }) => {
                let dest = dest.unwrap_or_else(|| source.clone());
                (source, dest)
            }
            None => (defaults.payload, defaults.payload_dest),
        };

        let identity = match file.user {
            Some(User { uid, username }) => Identity::new(uid, username)?,
            None => defaults.identity,
        };

        let port = match file.port {
            Some(port) => ListenPort::try_from(port)?,
            None => defaults.port,
        };

        let log_level = match file.log_level {
            Some(level) => level.parse::<LogLevel>()?,
            None => defaults.log_level,
        };

        let entry_point = match file.entry_point {
            Some(reference) => reference.parse::<EntryPoint>()?,
            None => defaults.entry_point,
        };

        let recipe = Recipe {
            base_image,
            workdir: file.workdir.unwrap_or(defaults.workdir),
            manifest: file.manifest.unwrap_or(defaults.manifest),
            payload,
            payload_dest,
            identity,
            port,
            log_level,
            entry_point,
            server: file.server.unwrap_or(defaults.server),
            health_check: file.health_check,
        };
        recipe.validate()?;

        let service_name = file.name.unwrap_or_else(|| DEFAULT_SERVICE.into());
        let image_name = match file.image {
            Some(image_name) => ImageName(image_name),
            None => ImageName(format!("{}_{}", project_name, service_name)),
        };

        Ok(ProjectRecipe {
            image_name,
            container_name: ContainerName(format!("{}_{}", project_name, service_name)),
            host_port: file.publish.unwrap_or_else(|| recipe.port.get()),
            recipe,
        })
    }
}

impl RecipeFrontend for RecipeFileFrontend {
    fn recipe<P: AsRef<Path>>(
        &mut self,
        project_name: &str,
        recipe_file_path: P,
    ) -> Result<ProjectRecipe> {
        let recipe_file = File::open(recipe_file_path.as_ref())?;
        let file: RecipeFile = serde_yaml::from_reader(recipe_file)?;
        RecipeFileFrontend::project_recipe(project_name, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecipeError;

    fn parse(project: &str, yaml: &str) -> Result<ProjectRecipe> {
        let file: RecipeFile = serde_yaml::from_str(yaml)?;
        RecipeFileFrontend::project_recipe(project, file)
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let project = parse("accounts", "version: \"1\"\n").unwrap();
        assert_eq!(project.recipe, Recipe::default());
        assert_eq!(project.image_name, ImageName("accounts_service".into()));
        assert_eq!(project.container_name, ContainerName("accounts_service".into()));
        assert_eq!(project.host_port, 8080);
    }

    #[test]
    fn full_file() {
        let project = parse(
            "shop",
            r#"
version: "1"
name: api
image: registry.local/shop/api
base_image: python:3.11.4-slim-bookworm
workdir: /srv
manifest: deps/requirements.txt
payload:
  source: src/api
  dest: api
user:
  uid: 10001
  username: api
port: 5000
publish: 15000
log_level: WARNING
entry_point: api.wsgi:create_app()
health_check: /health
"#,
        )
        .unwrap();

        let recipe = &project.recipe;
        assert_eq!(recipe.base_image.to_string(), "python:3.11.4-slim-bookworm");
        assert_eq!(recipe.workdir, PathBuf::from("/srv"));
        assert_eq!(recipe.payload, PathBuf::from("src/api"));
        assert_eq!(recipe.payload_dest, PathBuf::from("api"));
        assert_eq!(recipe.identity.uid, 10001);
        assert_eq!(recipe.port.get(), 5000);
        assert_eq!(recipe.log_level, LogLevel::Warning);
        assert_eq!(recipe.entry_point.to_string(), "api.wsgi:create_app()");
        assert_eq!(recipe.health_check.as_deref(), Some("/health"));
        assert_eq!(project.image_name, ImageName("registry.local/shop/api".into()));
        assert_eq!(project.container_name, ContainerName("shop_api".into()));
        assert_eq!(project.host_port, 15000);
    }

    #[test]
    fn short_payload() {
        let project = parse("p", "version: \"1\"\npayload: app\n").unwrap();
        assert_eq!(project.recipe.payload, PathBuf::from("app"));
        assert_eq!(project.recipe.payload_dest, PathBuf::from("app"));
    }

    #[test]
    fn rejects_floating_base_image() {
        let err = parse("p", "version: \"1\"\nbase_image: python:latest\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecipeError>(),
            Some(RecipeError::UnpinnedBaseImage { .. })
        ));
    }

    #[test]
    fn rejects_root_user_and_bad_entry_point() {
        assert!(parse("p", "version: \"1\"\nuser:\n  uid: 0\n  username: app\n").is_err());
        assert!(parse("p", "version: \"1\"\nentry_point: service\n").is_err());
        assert!(parse("p", "version: \"1\"\nport: 0\n").is_err());
    }

    #[test]
    fn demo_recipe_matches_defaults() {
        let project = parse("demo", include_str!("../../../demos/pod-recipe.yml")).unwrap();
        assert_eq!(project.recipe.health_check.as_deref(), Some("/health"));
        assert_eq!(
            project.recipe,
            Recipe {
                health_check: Some("/health".into()),
                ..Recipe::default()
            }
        );
    }

    #[test]
    fn rejects_unknown_fields_and_versions() {
        assert!(parse("p", "version: \"1\"\nrestart: always\n").is_err());
        assert!(parse("p", "version: \"2\"\n").is_err());
    }
}
