use serde::Deserialize;
use std::{
    collections::BTreeMap as Map,
    convert::TryFrom,
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::RecipeError;

/// Tags that move between releases and therefore never pin anything.
const FLOATING_TAGS: &[&str] = &["latest", "stable", "edge", "rolling", "nightly"];

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageName(pub String);

#[derive(Clone, Debug)]
pub struct Image {
    pub id: ImageId,
    pub labels: Map<String, String>,
}

#[derive(Clone, Debug, Hash)]
pub struct ImageBuildSpec {
    pub name: ImageName,
    pub context: PathBuf,
    pub containerfile: PathBuf,
    pub format: ImageFormat,
    pub labels: Map<String, String>,
}

/// Image manifest format. OCI images drop `HEALTHCHECK`, docker images keep it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ImageFormat {
    Oci,
    Docker,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Oci => "oci",
            ImageFormat::Docker => "docker",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerId(pub String);

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ContainerName(pub String);

#[derive(Clone, Debug, Hash)]
pub struct Container {
    pub id: ContainerId,
    pub name: ContainerName,
    pub status: ContainerStatus,
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ContainerStatus {
    Configured,
    Running,
    Exited,
    Unknown,
}

#[derive(Clone, Debug, Hash)]
pub struct ContainerSpec {
    pub name: ContainerName,
    pub image_name: ImageName,
    /// Host port published to the declared container port.
    pub publish: (u16, ListenPort),
    pub labels: Map<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildPolicy {
    Always,
    IfChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
}

/// A base image reference that is guaranteed to be pinned, either by an
/// explicit non-floating tag or by a content digest.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ImageReference {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl FromStr for ImageReference {
    type Err = RecipeError;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        let invalid = || RecipeError::InvalidImageReference(reference.into());

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
                if algorithm.is_empty()
                    || hex.len() < 32
                    || !hex.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(invalid());
                }
                (rest, Some(digest.to_owned()))
            }
            None => (reference, None),
        };

        // A colon before the last slash belongs to a registry port.
        let last_component = rest.rfind('/').map(|index| index + 1).unwrap_or(0);
        let (name, tag) = match rest[last_component..].rfind(':') {
            Some(index) => {
                let index = last_component + index;
                (&rest[..index], Some(rest[index + 1..].to_owned()))
            }
            None => (rest, None),
        };

        let name_ok = !name.is_empty()
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/:".contains(c)
            })
            && !name.starts_with('/')
            && !name.ends_with('/');
        if !name_ok {
            return Err(invalid());
        }

        if let Some(tag) = &tag {
            let tag_ok = !tag.is_empty()
                && tag.len() <= 128
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));
            if !tag_ok {
                return Err(invalid());
            }
        }

        if digest.is_none() {
            match &tag {
                None => {
                    return Err(RecipeError::UnpinnedBaseImage {
                        reference: reference.into(),
                        reason: "no tag or digest given".into(),
                    })
                }
                Some(tag) if FLOATING_TAGS.contains(&tag.to_ascii_lowercase().as_str()) => {
                    return Err(RecipeError::UnpinnedBaseImage {
                        reference: reference.into(),
                        reason: format!("tag {:?} is floating", tag),
                    })
                }
                _ => (),
            }
        }

        Ok(ImageReference {
            name: name.into(),
            tag,
            digest,
        })
    }
}

impl TryFrom<String> for ImageReference {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// The non-root user the service runs as. The uid is fixed so that volumes
/// mounted from outside keep matching ownership across image versions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    pub uid: u32,
    pub username: String,
}

impl Identity {
    pub const DEFAULT_UID: u32 = 1000;
    pub const DEFAULT_USERNAME: &'static str = "theia";

    pub fn new<S: Into<String>>(uid: u32, username: S) -> Result<Identity, RecipeError> {
        let identity = Identity {
            uid,
            username: username.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.uid == 0 {
            return Err(RecipeError::InvalidIdentity(
                "uid 0 is root, the service must run unprivileged".into(),
            ));
        }

        let mut chars = self.username.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false);
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !first_ok || !rest_ok || self.username.len() > 32 {
            return Err(RecipeError::InvalidIdentity(format!(
                "{:?} is not a valid user name",
                self.username
            )));
        }
        if self.username == "root" {
            return Err(RecipeError::InvalidIdentity(
                "the service user cannot be named root".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Identity {
    fn default() -> Self {
        Identity {
            uid: Identity::DEFAULT_UID,
            username: Identity::DEFAULT_USERNAME.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u16")]
pub struct ListenPort(u16);

impl ListenPort {
    pub const DEFAULT: ListenPort = ListenPort(8080);

    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for ListenPort {
    type Error = RecipeError;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        if port == 0 {
            return Err(RecipeError::InvalidPort(port.to_string()));
        }
        Ok(ListenPort(port))
    }
}

impl FromStr for ListenPort {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let port = s
            .trim()
            .parse::<u16>()
            .map_err(|_| RecipeError::InvalidPort(s.into()))?;
        ListenPort::try_from(port)
    }
}

impl fmt::Display for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the server listens: every local interface on the declared port.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct BindAddress {
    pub port: ListenPort,
}

impl BindAddress {
    pub fn all_interfaces(port: ListenPort) -> BindAddress {
        BindAddress { port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port.get()))
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl FromStr for LogLevel {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => Err(RecipeError::InvalidLogLevel(s.into())),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, RecipeError> {
        value.parse()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `<module>:<attribute>` reference to the object the server should load.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct EntryPoint {
    pub module: String,
    pub attribute: String,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl EntryPoint {
    /// Candidate files, relative to the application directory, that would
    /// provide the module.
    pub fn module_candidates(&self) -> [PathBuf; 2] {
        let path: PathBuf = self.module.split('.').collect();
        [path.with_extension("py"), path.join("__init__.py")]
    }

    /// Finds the file providing the module under `app_dir`.
    pub fn locate<P: AsRef<Path>>(&self, app_dir: P) -> Option<PathBuf> {
        self.module_candidates()
            .iter()
            .map(|candidate| app_dir.as_ref().join(candidate))
            .find(|path| path.is_file())
    }

    fn attribute_name(&self) -> &str {
        self.attribute
            .split('(')
            .next()
            .unwrap_or(&self.attribute)
    }
}

impl FromStr for EntryPoint {
    type Err = RecipeError;

    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RecipeError::InvalidEntryPoint {
            reference: reference.into(),
            reason: reason.into(),
        };

        let (module, attribute) = reference
            .split_once(':')
            .ok_or_else(|| invalid("expected <module>:<attribute>"))?;

        if module.is_empty() || !module.split('.').all(is_identifier) {
            return Err(invalid("module must be a dotted path of identifiers"));
        }

        let entry_point = EntryPoint {
            module: module.into(),
            attribute: attribute.into(),
        };

        // `create_app()` style factories are allowed, the call is left to the server.
        let call_ok = match attribute.find('(') {
            Some(_) => attribute.ends_with(')'),
            None => true,
        };
        if !is_identifier(entry_point.attribute_name()) || !call_ok {
            return Err(invalid("attribute must be an identifier"));
        }

        Ok(entry_point)
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = RecipeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.attribute)
    }
}
