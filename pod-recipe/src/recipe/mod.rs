use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use crate::{
    error::RecipeError,
    models::{
        BindAddress, EntryPoint, Identity, ImageFormat, ImageReference, ListenPort, LogLevel,
    },
};

mod containerfile;
mod layers;
mod manifest;

pub use containerfile::Instruction;
pub use manifest::DependencyManifest;

/// The five build and launch stages, in the only order they may run.
///
/// Dependencies are installed before the application is copied so that the
/// install layer stays cached while only application code changes.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    BaseRuntime,
    DependencyInstall,
    PayloadLoad,
    IdentityDeescalation,
    ProcessLaunch,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::BaseRuntime,
        Stage::DependencyInstall,
        Stage::PayloadLoad,
        Stage::IdentityDeescalation,
        Stage::ProcessLaunch,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Stage::BaseRuntime => "base runtime",
            Stage::DependencyInstall => "dependencies",
            Stage::PayloadLoad => "application",
            Stage::IdentityDeescalation => "identity",
            Stage::ProcessLaunch => "launch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Everything needed to build the service image and start its server.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Recipe {
    pub base_image: ImageReference,
    /// Absolute directory inside the image holding manifest and application.
    pub workdir: PathBuf,
    /// Dependency manifest, relative to the build context.
    pub manifest: PathBuf,
    /// Application source tree, relative to the build context.
    pub payload: PathBuf,
    /// Where the application lands, relative to `workdir`.
    pub payload_dest: PathBuf,
    pub identity: Identity,
    pub port: ListenPort,
    pub log_level: LogLevel,
    pub entry_point: EntryPoint,
    pub server: String,
    pub health_check: Option<String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Recipe {
            base_image: ImageReference {
                name: "python".into(),
                tag: Some("3.9-slim".into()),
                digest: None,
            },
            workdir: PathBuf::from("/app"),
            manifest: PathBuf::from("requirements.txt"),
            payload: PathBuf::from("service"),
            payload_dest: PathBuf::from("service"),
            identity: Identity::default(),
            port: ListenPort::DEFAULT,
            log_level: LogLevel::Info,
            entry_point: EntryPoint {
                module: "service".into(),
                attribute: "app".into(),
            },
            server: "gunicorn".into(),
            health_check: None,
        }
    }
}

fn relative_path(path: &Path) -> Result<(), RecipeError> {
    let invalid = |reason: &str| RecipeError::InvalidPath {
        path: path.into(),
        reason: reason.into(),
    };

    if path.as_os_str().is_empty() {
        return Err(invalid("path is empty"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => (),
            Component::ParentDir => return Err(invalid("path leaves the build context")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"))
            }
        }
    }
    Ok(())
}

/// Paths end up unquoted in `WORKDIR`, `COPY` and `RUN` lines.
fn plain_path(path: &Path) -> Result<(), RecipeError> {
    let plain = path.to_str().map(|path| {
        path.chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c))
    });
    if plain != Some(true) {
        return Err(RecipeError::InvalidPath {
            path: path.into(),
            reason: "only letters, digits, '/', '.', '_' and '-' are allowed".into(),
        });
    }
    Ok(())
}

impl Recipe {
    pub fn validate(&self) -> Result<(), RecipeError> {
        if !self.workdir.is_absolute() {
            return Err(RecipeError::InvalidPath {
                path: self.workdir.clone(),
                reason: "working directory must be absolute".into(),
            });
        }
        for path in &[&self.workdir, &self.manifest, &self.payload, &self.payload_dest] {
            plain_path(path)?;
        }

        relative_path(&self.manifest)?;
        if self.manifest.file_name().is_none() {
            return Err(RecipeError::InvalidPath {
                path: self.manifest.clone(),
                reason: "manifest must name a file".into(),
            });
        }
        relative_path(&self.payload)?;
        relative_path(&self.payload_dest)?;

        self.identity.validate()?;

        if self.server.is_empty() || self.server.chars().any(char::is_whitespace) {
            return Err(RecipeError::InvalidPath {
                path: PathBuf::from(&self.server),
                reason: "server must be a single program name".into(),
            });
        }

        if let Some(path) = &self.health_check {
            if !path.starts_with('/') || path.contains(char::is_whitespace) || path.contains('\'') {
                return Err(RecipeError::InvalidPath {
                    path: PathBuf::from(path),
                    reason: "health check must be an absolute URL path".into(),
                });
            }
        }

        Ok(())
    }

    pub fn bind(&self) -> BindAddress {
        BindAddress::all_interfaces(self.port)
    }

    /// A health check only survives in the docker image format.
    pub fn image_format(&self) -> ImageFormat {
        match self.health_check {
            Some(_) => ImageFormat::Docker,
            None => ImageFormat::Oci,
        }
    }

    /// The file name the manifest is copied to inside `workdir`.
    pub fn manifest_name(&self) -> PathBuf {
        self.manifest
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.manifest.clone())
    }

    /// The server command line baked into the image. The server is started
    /// directly, binding the declared port on every interface.
    pub fn command(&self) -> Vec<String> {
        vec![
            self.server.clone(),
            format!("--bind={}", self.bind()),
            format!("--log-level={}", self.log_level),
            self.entry_point.to_string(),
        ]
    }

    pub fn instructions(&self, stage: Stage) -> Vec<Instruction> {
        match stage {
            Stage::BaseRuntime => vec![
                Instruction::From(self.base_image.clone()),
                Instruction::Workdir(self.workdir.clone()),
            ],
            Stage::DependencyInstall => {
                let manifest_name = self.manifest_name();
                vec![
                    Instruction::Copy {
                        source: self.manifest.clone(),
                        dest: manifest_name.clone(),
                        tree: false,
                    },
                    Instruction::Run(format!(
                        "pip install --no-cache-dir -r {}",
                        manifest_name.display()
                    )),
                ]
            }
            Stage::PayloadLoad => vec![Instruction::Copy {
                source: self.payload.clone(),
                dest: self.payload_dest.clone(),
                tree: true,
            }],
            Stage::IdentityDeescalation => {
                let Identity { uid, username } = &self.identity;
                vec![
                    Instruction::Run(format!(
                        "useradd --uid {} --no-log-init {} && chown -R {} {}",
                        uid,
                        username,
                        username,
                        self.workdir.display()
                    )),
                    Instruction::User(username.clone()),
                ]
            }
            Stage::ProcessLaunch => {
                let mut instructions = vec![Instruction::Expose(self.port)];
                if let Some(path) = &self.health_check {
                    let probe = format!(
                        "import urllib.request; urllib.request.urlopen('http://127.0.0.1:{}{}', timeout=5)",
                        self.port, path
                    );
                    instructions.push(Instruction::Healthcheck(vec![
                        "python".into(),
                        "-c".into(),
                        probe,
                    ]));
                }
                instructions.push(Instruction::Cmd(self.command()));
                instructions
            }
        }
    }

    pub fn stages(&self) -> Vec<(Stage, Vec<Instruction>)> {
        Stage::ALL
            .iter()
            .map(|stage| (*stage, self.instructions(*stage)))
            .collect()
    }
}
