use log::debug;
use std::{collections::BTreeMap as Map, fs, io, path::Path};

use crate::error::RecipeError;

/// One pinned requirement of the dependency manifest.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub version: String,
    pub marker: Option<String>,
    pub line: usize,
}

/// A `requirements.txt` style manifest in which every entry resolves to
/// exactly one version.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct DependencyManifest {
    requirements: Vec<Requirement>,
}

impl DependencyManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DependencyManifest, RecipeError> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RecipeError::MissingManifest(path.into()))
            }
            Err(err) => return Err(err.into()),
        };

        let manifest = DependencyManifest::parse(&text)?;
        for requirement in manifest.requirements.iter() {
            debug!(
                "{:?}:{}: {}{:?}=={} {}",
                path,
                requirement.line,
                requirement.name,
                requirement.extras,
                requirement.version,
                requirement.marker.as_deref().unwrap_or("")
            );
        }
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<DependencyManifest, RecipeError> {
        let mut requirements = Vec::new();
        let mut seen: Map<String, usize> = Map::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = strip_comment(raw).trim();
            if content.is_empty() {
                continue;
            }

            let requirement = parse_requirement(content, line)?;
            let key = normalize_name(&requirement.name);
            if let Some(first) = seen.insert(key, line) {
                return Err(RecipeError::DuplicateRequirement {
                    name: requirement.name,
                    first,
                    second: line,
                });
            }

            requirements.push(requirement);
        }

        Ok(DependencyManifest { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn packages(&self) -> impl Iterator<Item = (&str, &str)> {
        self.requirements
            .iter()
            .map(|requirement| (requirement.name.as_str(), requirement.version.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(index) => &line[..index],
        None => line,
    }
}

/// Package names compare equal regardless of case and of `-`, `_`, `.` runs.
fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.chars() {
        if c == '-' || c == '_' || c == '.' {
            separator = true;
            continue;
        }
        if separator && !normalized.is_empty() {
            normalized.push('-');
        }
        separator = false;
        normalized.push(c.to_ascii_lowercase());
    }
    normalized
}

fn parse_requirement(content: &str, line: usize) -> Result<Requirement, RecipeError> {
    let invalid = |reason: String| RecipeError::InvalidRequirement { line, reason };

    if content.starts_with('-') {
        return Err(invalid(format!(
            "installer option {:?} is not allowed, list pinned packages only",
            content
        )));
    }
    if content.contains("://") || content.contains(" @ ") {
        return Err(invalid(format!(
            "{:?} installs from a URL or path and cannot be pinned",
            content
        )));
    }

    let (spec, marker) = match content.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_owned())),
        None => (content, None),
    };

    let (name_part, version) = spec.split_once("==").ok_or_else(|| {
        invalid(format!(
            "{:?} is not pinned to an exact version with ==",
            spec
        ))
    })?;
    let name_part = name_part.trim();
    let version = version.trim();

    if version.is_empty()
        || version.starts_with('=')
        || version.contains('*')
        || version.contains(',')
        || version.chars().any(char::is_whitespace)
    {
        return Err(invalid(format!(
            "{:?} does not name exactly one version",
            spec
        )));
    }

    let (name, extras) = match name_part.split_once('[') {
        Some((name, extras)) => {
            let extras = extras
                .strip_suffix(']')
                .ok_or_else(|| invalid(format!("unterminated extras in {:?}", name_part)))?;
            let extras = extras
                .split(',')
                .map(|extra| extra.trim().to_owned())
                .filter(|extra| !extra.is_empty())
                .collect();
            (name.trim(), extras)
        }
        None => (name_part, Vec::new()),
    };

    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name.chars().next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
    if !name_ok {
        return Err(invalid(format!("{:?} is not a valid package name", name)));
    }

    Ok(Requirement {
        name: name.into(),
        extras,
        version: version.into(),
        marker,
        line,
    })
}
