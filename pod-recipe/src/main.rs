use anyhow::{anyhow, Result};
use crossterm::{
    cursor,
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use log::info;
use std::{
    env, fs,
    io::{stdout, Write},
    path::{Path, PathBuf},
    process,
};
use structopt::StructOpt;

use backends::PodmanBackend;
use controller::{ContainerOperation, Controller};
use frontends::RecipeFileFrontend;
use launcher::LaunchConfig;
use models::{
    BindAddress, BuildPolicy, ContainerName, EntryPoint, Identity, ListenPort, LogLevel,
    PullPolicy,
};
use services::{ProjectRecipe, RecipeFrontend};

mod backends;
mod context;
mod controller;
mod error;
mod frontends;
mod hasher;
mod launcher;
mod models;
mod recipe;
mod services;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "pod-recipe",
    about = "Builds and runs a single web service container with podman."
)]
enum Opt {
    /// Prints the Containerfile generated from pod-recipe.yml.
    Render {
        #[structopt(short, long, parse(from_os_str))]
        /// Write the Containerfile here instead of stdout.
        output: Option<PathBuf>,
    },
    /// Shows the build stages and the cache key of every layer.
    Plan,
    Build {
        #[structopt(short, long)]
        /// Always pull the base image.
        pull: bool,

        #[structopt(short, long)]
        /// Build even if an image from identical inputs exists.
        force: bool,
    },
    /// Builds the image if needed and starts the service container.
    Up {
        #[structopt(long)]
        /// Build the image even if nothing changed.
        build: bool,

        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    Stop {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    Down {
        #[structopt(long, default_value = "5")]
        timeout: u32,

        #[structopt(long)]
        remove_orphans: bool,
    },
    /// Runs the application server in the foreground: checks the entry point,
    /// binds the port once, drops root and forwards stop signals. The image
    /// itself starts the server directly with the same settings.
    Launch {
        #[structopt(default_value = "service:app")]
        /// Application object in <module>:<attribute> form.
        entry_point: EntryPoint,

        #[structopt(long, env = "PORT", default_value = "8080")]
        port: ListenPort,

        #[structopt(long, env = "LOG_LEVEL", default_value = "info")]
        log_level: LogLevel,

        #[structopt(long, default_value = "/app", parse(from_os_str))]
        workdir: PathBuf,

        #[structopt(long, default_value = "gunicorn")]
        server: String,

        #[structopt(long, default_value = "1000")]
        /// Uid to switch to when started as root.
        uid: u32,

        #[structopt(long, default_value = "theia")]
        user: String,
    },
}

fn find_recipe_file<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    for path in path.as_ref().ancestors() {
        let recipe_file_path = path.join("pod-recipe.yml");
        if recipe_file_path.exists() {
            return Some(recipe_file_path);
        }

        let recipe_file_path = path.join("pod-recipe.yaml");
        if recipe_file_path.exists() {
            return Some(recipe_file_path);
        }
    }

    None
}

fn main() -> Result<()> {
    pretty_env_logger::init_custom_env("LOG");

    let opt = Opt::from_args();

    match opt {
        Opt::Launch {
            entry_point,
            port,
            log_level,
            workdir,
            server,
            uid,
            user,
        } => {
            let config = LaunchConfig {
                bind: BindAddress::all_interfaces(port),
                log_level,
                entry_point,
                server,
                workdir,
                identity: Some(Identity::new(uid, user)?),
            };

            let outcome = launcher::launch(config)?;
            process::exit(outcome.exit_code());
        }
        opt => project_command(opt),
    }
}

fn project_command(opt: Opt) -> Result<()> {
    let mut stdout = stdout();

    let current_dir = env::current_dir()?;
    let recipe_file_path = find_recipe_file(current_dir);

    let recipe_file_path = recipe_file_path
        .ok_or_else(|| anyhow!("Couldn't find a pod-recipe.yml file in the current working directory or any of its parents."))?;
    info!("found recipe file {:?}", recipe_file_path);

    let work_directory = recipe_file_path
        .parent()
        .ok_or_else(|| anyhow!("Recipe file has no parent."))?;
    info!("found work directory {:?}", work_directory);

    env::set_current_dir(work_directory)?;

    let project_name = work_directory
        .file_name()
        .and_then(|path| path.to_str())
        .ok_or_else(|| anyhow!("Couldn't determine the project name."))?;
    info!("project name {:?}", project_name);

    let mut frontend = RecipeFileFrontend::new();
    let project = frontend.recipe(project_name, recipe_file_path.as_path())?;
    info!("parsed recipe");

    match opt {
        Opt::Render { output } => {
            let containerfile = project.recipe.containerfile();
            match output {
                Some(path) => fs::write(path, containerfile)?,
                None => stdout.write_all(containerfile.as_bytes())?,
            }
            return Ok(());
        }
        Opt::Plan => return print_plan(&project, work_directory, &mut stdout),
        _ => (),
    }

    let backend = PodmanBackend::connect()?;
    info!("connected to podman");

    let mut controller = Controller::init(project_name, backend, project, work_directory)?;
    info!("created controller");

    match opt {
        Opt::Build { pull, force } => {
            let pull_policy = if pull {
                PullPolicy::Always
            } else {
                PullPolicy::IfNotPresent
            };

            let build_policy = if force {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            match controller.build_image(build_policy, pull_policy)? {
                Some(image_id) => {
                    print_info(&mut stdout, &format!("built image {}\n", image_id.0))?
                }
                None => print_info(
                    &mut stdout,
                    "image is up to date, rerun with --force to rebuild.\n",
                )?,
            }
        }
        Opt::Up {
            build,
            timeout,
            remove_orphans,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let build_policy = if build {
                BuildPolicy::Always
            } else {
                BuildPolicy::IfChanged
            };

            controller.build_image(build_policy, PullPolicy::IfNotPresent)?;

            let diff = controller.start_container_diff()?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;
        }
        Opt::Stop {
            timeout,
            remove_orphans,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.stop_container_diff()?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;
        }
        Opt::Down {
            timeout,
            remove_orphans,
        } => {
            check_orphans(&mut controller, &mut stdout, remove_orphans, timeout)?;

            let diff = controller.remove_container_diff()?;
            container_apply(&mut controller, &mut stdout, diff, timeout)?;
        }
        Opt::Render { .. } | Opt::Plan | Opt::Launch { .. } => (),
    }

    Ok(())
}

fn print_info(stdout: &mut impl Write, message: &str) -> Result<()> {
    stdout
        .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
        .queue(style::Print(message))?
        .flush()?;
    Ok(())
}

fn print_plan(project: &ProjectRecipe, context: &Path, stdout: &mut impl Write) -> Result<()> {
    let layers = project.recipe.layer_keys(context)?;

    let mut current_stage = None;
    for layer in layers {
        if current_stage != Some(layer.stage) {
            current_stage = Some(layer.stage);
            let title = format!("{}\n", layer.stage);
            stdout.queue(style::PrintStyledContent(title.as_str().green().bold()))?;
        }

        let key = layer.key.to_hex();
        stdout
            .queue(style::PrintStyledContent(key.as_str()[..12].dark_grey()))?
            .queue(style::Print(format!("  {}\n", layer.instruction)))?;
    }

    stdout.flush()?;
    Ok(())
}

/// Looks for orphans, if there are any and `remove_orphans` is set to true
/// they will be removed. Otherwise a message will be printed.
fn check_orphans(
    controller: &mut Controller,
    stdout: &mut impl Write,
    remove_orphans: bool,
    timeout: u32,
) -> Result<()> {
    let orphans = controller.find_orphans()?;

    if !orphans.is_empty() {
        if remove_orphans {
            let diff = orphans
                .into_iter()
                .map(|name| (name, ContainerOperation::Remove))
                .collect();
            container_apply(controller, stdout, diff, timeout)?;
        } else {
            print_info(
                stdout,
                "found orphans, rerun with --remove-orphans to remove them.\n",
            )?;
        }
    } else {
        info!("found no orphans");
    }

    Ok(())
}

fn container_apply(
    controller: &mut Controller,
    stdout: &mut impl Write,
    operations: Vec<(ContainerName, ContainerOperation)>,
    timeout: u32,
) -> Result<()> {
    fn operation_verb(operation: ContainerOperation) -> &'static str {
        match operation {
            ContainerOperation::Create => "Creating",
            ContainerOperation::Recreate => "Recreating",
            ContainerOperation::Start => "Starting",
            ContainerOperation::Stop => "Stopping",
            ContainerOperation::Remove => "Removing",
        }
    }

    let lines = operations
        .iter()
        .map(|(container_name, operation)| {
            let verb = operation_verb(*operation);
            format!("{} {}", verb, container_name.0)
        })
        .collect::<Vec<_>>();

    let longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);

    for line in lines.iter() {
        stdout.queue(style::Print(line))?;

        let padding = longest_line - line.len() + 1;
        stdout
            .queue(cursor::MoveRight(padding as u16))?
            .queue(style::Print("...\n"))?;
    }

    stdout.flush()?;

    for (line, (container_name, operation)) in operations.into_iter().enumerate() {
        controller.container_apply(&container_name, operation, timeout)?;

        stdout
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((lines.len() - line) as u16))?
            .queue(cursor::MoveRight(longest_line as u16 + 5))?
            .queue(style::PrintStyledContent("done".green().bold()))?
            .queue(cursor::RestorePosition)?
            .flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    #[test]
    fn launch_defaults_match_image_command() {
        let recipe = Recipe::default();
        let opt = Opt::from_iter_safe(&["pod-recipe", "launch"]).unwrap();

        match opt {
            Opt::Launch {
                entry_point,
                workdir,
                server,
                uid,
                user,
                ..
            } => {
                assert_eq!(entry_point, recipe.entry_point);
                assert_eq!(workdir, recipe.workdir);
                assert_eq!(server, recipe.server);
                assert_eq!(Identity::new(uid, user).unwrap(), recipe.identity);
                assert_eq!(recipe.command()[0], server);
                assert_eq!(recipe.command()[3], entry_point.to_string());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
