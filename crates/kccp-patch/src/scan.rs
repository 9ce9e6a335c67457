//! Walking pack directories into a [`PatchTable`].
//!
//! A file's role comes from its directory name or its filename prefix:
//!
//! ```text
//! kcs2/img/common/common_main.png/original/icon.png   target /kcs2/img/common/common_main.png, fragment icon.png
//! kcs2/img/common/common_main.png/patched/icon.png
//! kcs2/js/main.js/original.js                         target /kcs2/js/main.js, fragment .js
//! kcs2/js/main.js/patched.js
//! kcs2/js/patcher/rewrite.sh                          script for everything under /kcs2/js
//! ```

use crate::{
    error::{PatchError, PatchResult},
    imgdiff::average_hash,
    manifest::ModPack,
    rules::{ByteRule, ImageRule, PatchRule, PatchTable, pair_digest},
    script::ExecutablePatcher,
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Role of a file inside a pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Content the target currently has
    Original,
    /// Replacement content
    Patched,
    /// Executable transform
    Patcher,
    /// Skipped
    Ignore,
}

impl RuleKind {
    const ALL: [(&'static str, Self); 4] = [
        ("original", Self::Original),
        ("patched", Self::Patched),
        ("patcher", Self::Patcher),
        ("ignore", Self::Ignore),
    ];

    fn from_dir(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(dir, _)| *dir == name)
            .map(|(_, kind)| *kind)
    }
}

/// A classified pack file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Role of the file
    pub kind: RuleKind,
    /// Canonical path prefix the file applies to
    pub target: String,
    /// Name pairing an original with its patched counterpart
    pub fragment: String,
}

/// Classify a file from its directory components relative to the pack root.
pub fn classify(dirs: &[String], file: &str) -> Option<Classified> {
    if let Some((last, parent)) = dirs.split_last()
        && let Some(kind) = RuleKind::from_dir(last)
    {
        return Some(Classified {
            kind,
            target: format!("/{}", parent.join("/")),
            fragment: file.to_string(),
        });
    }

    RuleKind::ALL.iter().find_map(|(prefix, kind)| {
        file.strip_prefix(prefix).map(|fragment| Classified {
            kind: *kind,
            target: format!("/{}", dirs.join("/")),
            fragment: fragment.to_string(),
        })
    })
}

type PairKey = (String, String);

#[derive(Default)]
struct PackFiles {
    originals: BTreeMap<PairKey, PathBuf>,
    patched: BTreeMap<PairKey, PathBuf>,
    patchers: Vec<(String, PathBuf)>,
}

/// Build the table for `packs`, in precedence order (later packs win).
///
/// Misconfigured rules are logged and skipped; they never abort the scan.
pub fn scan_packs(packs: &[ModPack], script_timeout: Duration) -> PatchTable {
    let mut table = PatchTable::new();
    for (index, pack) in packs.iter().enumerate() {
        info!("Preparing {}", pack.dir.display());
        let before = table.len();
        scan_pack(&mut table, index, pack, script_timeout);
        table.add_pack();
        info!(
            "Loaded {} rules from {} {}",
            table.len() - before,
            pack.manifest.name,
            pack.manifest.version
        );
    }
    table
}

fn scan_pack(table: &mut PatchTable, index: usize, pack: &ModPack, script_timeout: Duration) {
    let files = collect_files(table, pack);
    let identity = pack.identity();

    for ((target, fragment), original) in &files.originals {
        let key = (target.clone(), fragment.clone());
        let Some(patched) = files.patched.get(&key) else {
            error!(
                "Missing {} in patched - delete original file if no patch needed!",
                original.display()
            );
            table.add_error();
            continue;
        };

        let name = format!("{fragment}@{identity}");
        let is_image = fragment.to_ascii_lowercase().ends_with(".png");
        match load_pair(&name, is_image, original, patched) {
            Ok(rule) => table.insert(target.clone(), index, rule),
            Err(e) => {
                error!("Skipping rule {} for {}: {}", name, target, e);
                table.add_error();
            }
        }
    }

    for key in files.patched.keys() {
        if !files.originals.contains_key(key) {
            debug!("Patched {} for {} has no original, ignored", key.1, key.0);
        }
    }

    for (target, program) in files.patchers {
        if !pack.scripts_allowed() {
            warn!(
                "Scripts are disabled for {}, not loading {}",
                identity,
                program.display()
            );
            continue;
        }
        match std::fs::read(&program) {
            Ok(contents) => {
                let patcher = ExecutablePatcher::new(program, &contents, script_timeout);
                table.insert(target, index, PatchRule::Script(Arc::new(patcher)));
            }
            Err(e) => {
                error!("Failed to read patcher {}: {}", program.display(), e);
                table.add_error();
            }
        }
    }
}

fn collect_files(table: &mut PatchTable, pack: &ModPack) -> PackFiles {
    let mut files = PackFiles::default();
    let walker = WalkDir::new(&pack.dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read pack entry: {}", e);
                table.add_error();
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some((dirs, file)) = relative_components(&pack.dir, entry.path()) else {
            continue;
        };
        let Some(classified) = classify(&dirs, &file) else {
            warn!("Invalid path {}", entry.path().display());
            continue;
        };

        let path = entry.path().to_path_buf();
        let key = (classified.target, classified.fragment);
        match classified.kind {
            RuleKind::Original => {
                files.originals.insert(key, path);
            }
            RuleKind::Patched => {
                files.patched.insert(key, path);
            }
            RuleKind::Patcher => files.patchers.push((key.0, path)),
            RuleKind::Ignore => {}
        }
    }
    files
}

fn relative_components(root: &Path, path: &Path) -> Option<(Vec<String>, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let file = parts.pop()?;
    Some((parts, file))
}

fn load_pair(
    name: &str,
    is_image: bool,
    original: &Path,
    patched: &Path,
) -> PatchResult<PatchRule> {
    let original_bytes = std::fs::read(original)?;
    let patched_bytes = std::fs::read(patched)?;
    let digest = pair_digest(&original_bytes, &patched_bytes);

    if !is_image {
        return Ok(PatchRule::Bytes(Arc::new(ByteRule {
            name: name.to_string(),
            original: Bytes::from(original_bytes),
            patched: Bytes::from(patched_bytes),
            digest,
        })));
    }

    let decode = |bytes: &[u8], path: &Path| {
        image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
            .map(|img| img.to_rgba8())
            .map_err(|e| PatchError::Config(format!("{}: {}", path.display(), e)))
    };
    let original_img = decode(&original_bytes, original)?;
    let patched_img = decode(&patched_bytes, patched)?;

    Ok(PatchRule::Image(Arc::new(ImageRule {
        name: name.to_string(),
        original_hash: average_hash(&original_img),
        original: original_img,
        patched: patched_img,
        patched_png: Bytes::from(patched_bytes),
        digest,
    })))
}
