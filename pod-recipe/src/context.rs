use anyhow::{anyhow, Result};
use log::{debug, info};
use number_prefix::NumberPrefix;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use crate::{
    error::RecipeError,
    hasher::context_walker,
    recipe::{DependencyManifest, Recipe},
};

pub const CONTAINERFILE: &str = "Containerfile";

/// A private copy of exactly what the image build may see: the dependency
/// manifest, the application tree and the rendered Containerfile.
pub struct BuildContext {
    dir: TempDir,
    size: u64,
    manifest: DependencyManifest,
}

impl BuildContext {
    /// Stages the context in pipeline order. The manifest is validated and
    /// copied before the application tree is touched, so an unusable manifest
    /// fails the build without copying any application code.
    pub fn stage<P: AsRef<Path>>(recipe: &Recipe, context_dir: P) -> Result<BuildContext> {
        let context_dir = context_dir.as_ref();
        recipe.validate()?;

        let dir = TempDir::new()?;
        let mut size = 0;

        let manifest_path = context_dir.join(&recipe.manifest);
        let manifest = DependencyManifest::load(&manifest_path)?;
        size += copy_file(&manifest_path, &dir.path().join(&recipe.manifest))?;
        info!(
            "staged manifest {:?} with {} requirements",
            recipe.manifest,
            manifest.requirements().len()
        );

        let payload_path = context_dir.join(&recipe.payload);
        if !payload_path.is_dir() {
            return Err(RecipeError::MissingPayload(payload_path).into());
        }
        size += copy_tree(context_dir, &payload_path, &dir.path().join(&recipe.payload))?;
        info!("staged application tree {:?}", recipe.payload);

        let containerfile = recipe.containerfile();
        size += containerfile.len() as u64;
        write_private(&dir.path().join(CONTAINERFILE), containerfile.as_bytes())?;

        match NumberPrefix::binary(size as f32) {
            NumberPrefix::Standalone(bytes) => println!("Staged build context ({} bytes)", bytes),
            NumberPrefix::Prefixed(prefix, n) => {
                println!("Staged build context ({:.1} {}B)", n, prefix)
            }
        };

        Ok(BuildContext {
            dir,
            size,
            manifest,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn containerfile(&self) -> PathBuf {
        self.dir.path().join(CONTAINERFILE)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn manifest(&self) -> &DependencyManifest {
        &self.manifest
    }

    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let copied = fs::copy(from, to)?;
    debug!("copied {:?} ({} bytes)", from, copied);
    Ok(copied)
}

/// Copies a tree byte for byte, skipping whatever the context's
/// `.dockerignore` excludes. Symlinks are recreated with the same target.
fn copy_tree(context_dir: &Path, from: &Path, to: &Path) -> Result<u64> {
    let mut size = 0;
    fs::create_dir_all(to)?;

    for entry in context_walker(context_dir, from)?.build() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from)?;
        let target = to.join(relative);
        let file_type = entry
            .file_type()
            .ok_or_else(|| anyhow!("cannot read file type of {:?}", entry.path()))?;

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            size += copy_file(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            symlink(&link, &target)?;
            debug!("linked {:?} -> {:?}", target, link);
        } else {
            return Err(anyhow!(
                "{:?} is not a file, directory or symlink and cannot be copied",
                entry.path()
            ));
        }
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "Flask==2.1.2\n").unwrap();
        fs::create_dir_all(dir.path().join("service/common")).unwrap();
        fs::write(dir.path().join("service/__init__.py"), "app = object()\n").unwrap();
        fs::write(dir.path().join("service/common/status.py"), "HTTP_200_OK = 200\n").unwrap();
        dir
    }

    #[test]
    fn stages_manifest_payload_and_containerfile() {
        let dir = context();
        let staged = BuildContext::stage(&Recipe::default(), dir.path()).unwrap();

        assert_eq!(
            fs::read(staged.path().join("service/common/status.py")).unwrap(),
            b"HTTP_200_OK = 200\n"
        );
        assert_eq!(
            fs::read_to_string(staged.containerfile()).unwrap(),
            Recipe::default().containerfile()
        );
        assert_eq!(staged.manifest().requirements().len(), 1);
        assert!(staged.size() > 0);
    }

    #[test]
    fn honours_root_dockerignore() {
        let dir = context();
        fs::write(dir.path().join(".dockerignore"), "**/__pycache__\n").unwrap();
        fs::create_dir(dir.path().join("service/__pycache__")).unwrap();
        fs::write(dir.path().join("service/__pycache__/x.pyc"), [0u8]).unwrap();

        let staged = BuildContext::stage(&Recipe::default(), dir.path()).unwrap();
        assert!(!staged.path().join("service/__pycache__").exists());
        assert!(staged.path().join("service/__init__.py").exists());
    }

    #[test]
    fn nested_dockerignore_is_plain_content() {
        let dir = context();
        fs::write(dir.path().join("service/.dockerignore"), "common\n").unwrap();

        let staged = BuildContext::stage(&Recipe::default(), dir.path()).unwrap();
        assert!(staged.path().join("service/common/status.py").exists());
        assert_eq!(
            fs::read(staged.path().join("service/.dockerignore")).unwrap(),
            b"common\n"
        );
    }

    #[test]
    fn symlinks_are_recreated() {
        let dir = context();
        symlink("__init__.py", dir.path().join("service/wsgi.py")).unwrap();

        let staged = BuildContext::stage(&Recipe::default(), dir.path()).unwrap();
        let link = staged.path().join("service/wsgi.py");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("__init__.py"));
    }

    #[test]
    fn bad_manifest_fails_before_payload_copy() {
        let dir = context();
        fs::write(dir.path().join("requirements.txt"), "Flask>=2\n").unwrap();

        let err = BuildContext::stage(&Recipe::default(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<RecipeError>(),
            Some(RecipeError::InvalidRequirement { line: 1, .. })
        ));
    }

    #[test]
    fn missing_manifest_and_payload_are_fatal() {
        let dir = context();
        fs::remove_dir_all(dir.path().join("service")).unwrap();
        let err = BuildContext::stage(&Recipe::default(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<RecipeError>(),
            Some(RecipeError::MissingPayload(_))
        ));

        fs::remove_file(dir.path().join("requirements.txt")).unwrap();
        let err = BuildContext::stage(&Recipe::default(), dir.path())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<RecipeError>(),
            Some(RecipeError::MissingManifest(_))
        ));
    }
}
