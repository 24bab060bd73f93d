use anyhow::Result;
use blake3;
use ignore::{
    gitignore::{Gitignore, GitignoreBuilder},
    WalkBuilder,
};
use std::{
    fs::{self, File},
    hash::{Hash, Hasher},
    io,
    path::Path,
};

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);

    /// Feeds the contents of a single file.
    fn input_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()>;

    /// Feeds every entry below `tree` that the build context rooted at
    /// `context_root` would include, in a stable order, together with its
    /// path relative to `tree`. Symlinks contribute their target.
    fn input_tree<P: AsRef<Path>, Q: AsRef<Path>>(&mut self, context_root: P, tree: Q) -> Result<()>;
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                panic!();
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }

    fn input_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut file = File::open(path)?;
        io::copy(&mut file, self)?;
        Ok(())
    }

    fn input_tree<P: AsRef<Path>, Q: AsRef<Path>>(&mut self, context_root: P, tree: Q) -> Result<()> {
        let tree = tree.as_ref();
        let walk = context_walker(context_root, tree)?
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walk {
            let entry = entry?;
            let relative = entry.path().strip_prefix(tree)?;
            self.input(relative);

            match entry.file_type() {
                Some(file_type) if file_type.is_file() => {
                    self.input(EntryKind::File);
                    self.input_file(entry.path())?;
                }
                Some(file_type) if file_type.is_symlink() => {
                    self.input(EntryKind::Symlink);
                    self.input(fs::read_link(entry.path())?);
                }
                _ => self.input(EntryKind::Directory),
            }
        }

        Ok(())
    }
}

#[derive(Hash)]
enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Matcher for the `.dockerignore` at the root of a build context. Like
/// `podman build`, only the root file is read.
pub fn dockerignore<P: AsRef<Path>>(context_root: P) -> Result<Gitignore> {
    let context_root = context_root.as_ref();
    let mut builder = GitignoreBuilder::new(context_root);

    let path = context_root.join(".dockerignore");
    if path.is_file() {
        if let Some(err) = builder.add(&path) {
            return Err(err.into());
        }
    }

    Ok(builder.build()?)
}

/// A walker over `tree`, a directory inside `context_root`, that sees the
/// same entries the container engine would: everything, hidden files
/// included, minus what the context's `.dockerignore` excludes. Symlinks are
/// yielded as links and never followed.
pub fn context_walker<P, Q>(context_root: P, tree: Q) -> Result<WalkBuilder>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let ignore = dockerignore(context_root)?;

    let mut builder = WalkBuilder::new(tree);
    builder
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !ignore
                .matched_path_or_any_parents(entry.path(), is_dir)
                .is_ignore()
        });
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn tree_digest(root: &Path) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.input_tree(root, root).unwrap();
        hasher.finalize()
    }

    #[test]
    fn tree_digest_follows_contents() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.py"), "print('a')\n").unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/b.py"), "print('b')\n").unwrap();

        let first = tree_digest(dir.path());
        assert_eq!(first, tree_digest(dir.path()));

        fs::write(dir.path().join("pkg/b.py"), "print('c')\n").unwrap();
        assert_ne!(first, tree_digest(dir.path()));
    }

    #[test]
    fn tree_digest_skips_dockerignored_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".dockerignore"), "*.pyc\n").unwrap();
        fs::write(dir.path().join("a.py"), "print('a')\n").unwrap();

        let before = tree_digest(dir.path());
        fs::write(dir.path().join("a.pyc"), [0u8, 1, 2]).unwrap();
        assert_eq!(before, tree_digest(dir.path()));
    }

    #[test]
    fn root_dockerignore_applies_to_subtree() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".dockerignore"), "**/__pycache__\n").unwrap();
        fs::create_dir_all(dir.path().join("service/__pycache__")).unwrap();
        fs::write(dir.path().join("service/__init__.py"), "app = None\n").unwrap();
        fs::write(dir.path().join("service/__pycache__/x.pyc"), [0u8]).unwrap();

        let seen = context_walker(dir.path(), dir.path().join("service"))
            .unwrap()
            .build()
            .map(|entry| entry.unwrap().path().to_path_buf())
            .collect::<Vec<_>>();
        assert!(seen.contains(&dir.path().join("service/__init__.py")));
        assert!(!seen.iter().any(|path| path.ends_with("__pycache__")));
        assert!(!seen.iter().any(|path| path.ends_with("x.pyc")));
    }

    #[test]
    fn tree_digest_covers_symlink_targets() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.py"), "a = 1\n").unwrap();
        fs::write(dir.path().join("b.py"), "b = 1\n").unwrap();
        symlink("a.py", dir.path().join("link.py")).unwrap();

        let before = tree_digest(dir.path());
        fs::remove_file(dir.path().join("link.py")).unwrap();
        symlink("b.py", dir.path().join("link.py")).unwrap();
        assert_ne!(before, tree_digest(dir.path()));
    }
}
