//! Mod descriptors and pack manifests.
//!
//! A descriptor points at a `*.mod.json` manifest; the pack content lives in
//! the directory next to it with the same name minus the `.mod.json` suffix.

use crate::error::{PatchError, PatchResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

const MANIFEST_SUFFIX: &str = ".mod.json";

/// User-side entry for one installed pack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModDescriptor {
    /// Location of the `*.mod.json` manifest
    pub path: PathBuf,
    /// Remote the pack was cloned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    /// Homepage of the pack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Consent to run the pack's patcher scripts
    #[serde(default)]
    pub allow_scripts: bool,
    /// Time of the last remote version probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<u64>,
    /// Version reported by the last remote probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

// Older configurations list bare manifest paths
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorEntry {
    Path(PathBuf),
    Full(ModDescriptor),
}

impl From<DescriptorEntry> for ModDescriptor {
    fn from(entry: DescriptorEntry) -> Self {
        match entry {
            DescriptorEntry::Path(path) => Self {
                path,
                ..Self::default()
            },
            DescriptorEntry::Full(descriptor) => descriptor,
        }
    }
}

impl ModDescriptor {
    /// Descriptor for the manifest at `path` without script consent
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Grant or revoke consent to run scripts
    pub fn with_allow_scripts(mut self, allow: bool) -> Self {
        self.allow_scripts = allow;
        self
    }

    /// Directory holding the pack content.
    pub fn pack_dir(&self) -> PathBuf {
        let raw = self.path.to_string_lossy();
        raw.strip_suffix(MANIFEST_SUFFIX)
            .map_or_else(|| self.path.clone(), PathBuf::from)
    }
}

/// Pack manifest (`*.mod.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModManifest {
    /// Display name
    pub name: String,
    /// Pack version
    pub version: String,
    /// Authors, in credit order
    #[serde(default)]
    pub authors: Vec<String>,
    /// Homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Where to look for a newer manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
    /// Where to download a newer version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Pack only works with its patcher scripts enabled
    #[serde(default)]
    pub require_scripts: bool,
}

/// A loaded pack: descriptor, manifest and content directory
#[derive(Debug, Clone)]
pub struct ModPack {
    /// How the user configured the pack
    pub descriptor: ModDescriptor,
    /// What the pack says about itself
    pub manifest: ModManifest,
    /// Content root
    pub dir: PathBuf,
}

impl ModPack {
    /// Read and check the manifest named by `descriptor`.
    pub async fn load(descriptor: &ModDescriptor) -> PatchResult<Self> {
        let bytes = fs::read(&descriptor.path).await?;
        let manifest: ModManifest = serde_json::from_slice(&bytes)?;

        if manifest.require_scripts && !descriptor.allow_scripts {
            return Err(PatchError::Config(format!(
                "{} requires scripts but they are not allowed",
                manifest.name
            )));
        }

        let dir = descriptor.pack_dir();
        if !fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(PatchError::Config(format!(
                "pack directory {} does not exist",
                dir.display()
            )));
        }

        if descriptor.allow_scripts {
            warn!(
                "Scripts enabled for {} {}: patchers run with full user privileges",
                manifest.name, manifest.version
            );
        }

        Ok(Self {
            descriptor: descriptor.clone(),
            manifest,
            dir,
        })
    }

    /// Suffix appended to fragment names so packs never collide
    pub fn identity(&self) -> String {
        format!("{}-{}", self.manifest.name, self.manifest.version)
    }

    /// Whether this pack's scripts may run
    pub fn scripts_allowed(&self) -> bool {
        self.descriptor.allow_scripts
    }
}

/// Read the descriptors file: a JSON array of descriptors or manifest paths.
///
/// Relative manifest paths resolve against the file's directory.
pub async fn load_descriptors(path: &Path) -> PatchResult<Vec<ModDescriptor>> {
    let bytes = fs::read(path).await?;
    let entries: Vec<DescriptorEntry> = serde_json::from_slice(&bytes)?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let descriptors: Vec<ModDescriptor> = entries
        .into_iter()
        .map(ModDescriptor::from)
        .map(|mut d| {
            if d.path.is_relative() {
                d.path = base.join(&d.path);
            }
            d
        })
        .collect();

    info!("Loaded {} mod descriptors from {}", descriptors.len(), path.display());
    Ok(descriptors)
}
