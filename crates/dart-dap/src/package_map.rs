//! Maps `package:` URIs to filesystem paths using a package-map file.
//!
//! Two formats are supported: the modern `.dart_tool/package_config.json`
//! and the legacy `.packages` line format. A map is immutable once built;
//! picking up changes means constructing a new instance.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PackageConfigFile {
    #[serde(default)]
    packages: Vec<PackageConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct PackageConfigEntry {
    name: String,
    #[serde(rename = "rootUri")]
    root_uri: String,
    #[serde(default, rename = "packageUri")]
    package_uri: Option<String>,
}

/// An immutable table of package name → absolute lib directory.
#[derive(Debug, Default)]
pub struct PackageMap {
    packages: HashMap<String, PathBuf>,
}

impl PackageMap {
    /// Load a package map file, detecting the format from its name.
    pub fn load_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if path.file_name().and_then(|n| n.to_str()) == Some("package_config.json") {
            Self::parse_package_config(&text, base_dir)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
        } else {
            Ok(Self::parse_dot_packages(&text, base_dir))
        }
    }

    /// Find and load the package map for a program root: prefers
    /// `.dart_tool/package_config.json`, falls back to `.packages`.
    pub fn load_for_root(root: &Path) -> io::Result<Self> {
        let config = root.join(".dart_tool").join("package_config.json");
        if config.is_file() {
            return Self::load_file(&config);
        }
        let legacy = root.join(".packages");
        if legacy.is_file() {
            return Self::load_file(&legacy);
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no package map found under {}", root.display()),
        ))
    }

    pub fn parse_package_config(text: &str, base_dir: &Path) -> serde_json::Result<Self> {
        let config: PackageConfigFile = serde_json::from_str(text)?;
        let mut packages = HashMap::with_capacity(config.packages.len());
        for entry in config.packages {
            let root = resolve_uri_reference(&entry.root_uri, base_dir);
            let lib_dir = match entry.package_uri.as_deref() {
                Some(package_uri) => root.join(package_uri.trim_end_matches('/')),
                None => root,
            };
            packages.insert(entry.name, normalize(lib_dir));
        }
        Ok(Self { packages })
    }

    pub fn parse_dot_packages(text: &str, base_dir: &Path) -> Self {
        let mut packages = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, uri)) = line.split_once(':') else {
                continue;
            };
            // `file:` URIs keep their own colon, so re-join when needed.
            let uri = if uri.starts_with("file") && line[name.len() + 1..].starts_with("file:") {
                &line[name.len() + 1..]
            } else {
                uri
            };
            let dir = resolve_uri_reference(uri, base_dir);
            packages.insert(
                name.to_string(),
                normalize(PathBuf::from(
                    dir.to_string_lossy().trim_end_matches('/').to_string(),
                )),
            );
        }
        Self { packages }
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Resolve a `package:name/path.dart` URI to a filesystem path.
    pub fn resolve(&self, package_uri: &str) -> Option<PathBuf> {
        let rest = package_uri.strip_prefix("package:")?;
        let (name, path) = rest.split_once('/')?;
        let lib_dir = self.packages.get(name)?;
        Some(lib_dir.join(path))
    }

    /// Reverse lookup: convert a filesystem path under some package's lib
    /// directory back into a `package:` URI.
    pub fn package_uri_for_path(&self, path: &Path) -> Option<String> {
        let mut best: Option<(&String, &PathBuf)> = None;
        for (name, lib_dir) in &self.packages {
            if path.starts_with(lib_dir) {
                let better = match best {
                    Some((_, current)) => {
                        lib_dir.components().count() > current.components().count()
                    }
                    None => true,
                };
                if better {
                    best = Some((name, lib_dir));
                }
            }
        }
        let (name, lib_dir) = best?;
        let rel = path.strip_prefix(lib_dir).ok()?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Some(format!("package:{name}/{rel}"))
    }
}

fn resolve_uri_reference(uri: &str, base_dir: &Path) -> PathBuf {
    if let Some(path) = uri.strip_prefix("file://") {
        return PathBuf::from(path);
    }
    let path = Path::new(uri);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Lexically collapse `.` and `..` components so joined relative roots
/// compare cleanly in `starts_with` checks.
fn normalize(path: PathBuf) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
