use std::{
    fmt,
    path::{Path, PathBuf},
};

use super::Recipe;
use crate::models::{ImageReference, ListenPort};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Instruction {
    From(ImageReference),
    Workdir(PathBuf),
    /// `tree` copies a whole directory rather than a single file.
    Copy {
        source: PathBuf,
        dest: PathBuf,
        tree: bool,
    },
    Run(String),
    User(String),
    Expose(ListenPort),
    Healthcheck(Vec<String>),
    Cmd(Vec<String>),
}

/// Renders an argument vector in exec form, which needs no shell in the image.
fn exec_form(args: &[String]) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| String::from("[]"))
}

fn tree_path(path: &Path, relative_to_workdir: bool) -> String {
    let path = path.display().to_string();
    let path = path.trim_start_matches("./").trim_end_matches('/');
    if relative_to_workdir {
        format!("./{}/", path)
    } else {
        format!("{}/", path)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From(reference) => write!(f, "FROM {}", reference),
            Instruction::Workdir(path) => write!(f, "WORKDIR {}", path.display()),
            Instruction::Copy {
                source,
                dest,
                tree: true,
            } => write!(f, "COPY {} {}", tree_path(source, false), tree_path(dest, true)),
            Instruction::Copy { source, dest, .. } => {
                write!(f, "COPY {} {}", source.display(), dest.display())
            }
            Instruction::Run(command) => write!(f, "RUN {}", command),
            Instruction::User(user) => write!(f, "USER {}", user),
            Instruction::Expose(port) => write!(f, "EXPOSE {}", port),
            Instruction::Healthcheck(args) => {
                write!(f, "HEALTHCHECK --interval=30s --timeout=10s CMD {}", exec_form(args))
            }
            Instruction::Cmd(args) => write!(f, "CMD {}", exec_form(args)),
        }
    }
}

impl Recipe {
    /// Renders the recipe as a Containerfile.
    pub fn containerfile(&self) -> String {
        let mut out = String::from("# Generated by pod-recipe, changes will be overwritten.\n");

        for (stage, instructions) in self.stages() {
            out.push_str(&format!("\n# {}\n", stage));
            for instruction in instructions {
                out.push_str(&instruction.to_string());
                out.push('\n');
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogLevel;

    #[test]
    fn renders_default_recipe() {
        let expected = "\
# Generated by pod-recipe, changes will be overwritten.

# base runtime
FROM python:3.9-slim
WORKDIR /app

# dependencies
COPY requirements.txt requirements.txt
RUN pip install --no-cache-dir -r requirements.txt

# application
COPY service/ ./service/

# identity
RUN useradd --uid 1000 --no-log-init theia && chown -R theia /app
USER theia

# launch
EXPOSE 8080
CMD [\"gunicorn\",\"--bind=0.0.0.0:8080\",\"--log-level=info\",\"service:app\"]
";
        assert_eq!(Recipe::default().containerfile(), expected);
    }

    #[test]
    fn dependencies_install_before_application_copy() {
        let rendered = Recipe::default().containerfile();
        let install = rendered.find("RUN pip install").unwrap();
        let copy = rendered.find("COPY service").unwrap();
        let user = rendered.find("USER theia").unwrap();
        assert!(install < copy);
        assert!(copy < user);
    }

    #[test]
    fn nothing_after_user_needs_root() {
        let rendered = Recipe::default().containerfile();
        let after_user = &rendered[rendered.find("USER theia").unwrap()..];
        assert!(!after_user.contains("RUN "));
        assert!(!after_user.contains("USER root"));
    }

    #[test]
    fn exposed_port_matches_bind() {
        let recipe = Recipe {
            port: "5000".parse().unwrap(),
            log_level: LogLevel::Warning,
            ..Recipe::default()
        };
        let rendered = recipe.containerfile();
        assert!(rendered.contains("EXPOSE 5000\n"));
        assert!(rendered.contains("\"--bind=0.0.0.0:5000\""));
        assert!(rendered.contains("\"--log-level=warning\""));
        assert!(!rendered.contains("--bind=0.0:"));
    }

    #[test]
    fn health_check_probes_declared_port() {
        let recipe = Recipe {
            health_check: Some("/health".into()),
            ..Recipe::default()
        };
        let rendered = recipe.containerfile();
        let healthcheck = rendered
            .lines()
            .find(|line| line.starts_with("HEALTHCHECK"))
            .unwrap();
        assert!(healthcheck.contains("http://127.0.0.1:8080/health"));
        assert!(rendered.find("HEALTHCHECK").unwrap() < rendered.find("\nCMD [").unwrap());
    }
}
