//! In-memory match table built from the scanned packs.

use crate::script::Patcher;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use image::RgbaImage;
use std::{collections::HashMap, sync::Arc};

/// A spritesheet region replacement
#[derive(Debug)]
pub struct ImageRule {
    /// Fragment name with the owning pack's suffix
    pub name: String,
    /// Art the region must currently show
    pub original: RgbaImage,
    /// Average hash of `original`
    pub original_hash: u64,
    /// Replacement art
    pub patched: RgbaImage,
    /// Replacement as shipped, served as-is for whole-image matches
    pub patched_png: Bytes,
    /// Content digest of both files
    pub digest: String,
}

/// An exact-content file replacement
#[derive(Debug)]
pub struct ByteRule {
    /// Fragment name with the owning pack's suffix
    pub name: String,
    /// Bytes the asset must currently have
    pub original: Bytes,
    /// Replacement bytes
    pub patched: Bytes,
    /// Content digest of both files
    pub digest: String,
}

impl ByteRule {
    /// Build a rule with its digest
    pub fn new(name: impl Into<String>, original: Bytes, patched: Bytes) -> Self {
        let digest = pair_digest(&original, &patched);
        Self {
            name: name.into(),
            original,
            patched,
            digest,
        }
    }
}

/// Digest of an original/patched pair
pub fn pair_digest(original: &[u8], patched: &[u8]) -> String {
    format!("{:x}{:x}", md5::compute(original), md5::compute(patched))
}

/// One rule attached to a target prefix
#[derive(Debug, Clone)]
pub enum PatchRule {
    /// Spritesheet region or whole-image replacement
    Image(Arc<ImageRule>),
    /// Exact-content replacement
    Bytes(Arc<ByteRule>),
    /// Scripted rewrite
    Script(Arc<dyn Patcher>),
}

impl PatchRule {
    fn digest(&self) -> String {
        match self {
            Self::Image(rule) => rule.digest.clone(),
            Self::Bytes(rule) => rule.digest.clone(),
            Self::Script(patcher) => patcher.fingerprint(),
        }
    }
}

#[derive(Debug, Clone)]
struct TargetedRule {
    pack: usize,
    rule: PatchRule,
}

/// Rules grouped by target canonical path
#[derive(Debug, Default)]
pub struct PatchTable {
    targets: HashMap<String, Vec<TargetedRule>>,
    rules: usize,
    packs: usize,
    errors: usize,
}

/// Rules that apply to one asset, highest precedence first
#[derive(Debug, Default)]
pub struct ResolvedPatches {
    /// Script rules
    pub scripts: Vec<Arc<dyn Patcher>>,
    /// Image rules
    pub images: Vec<Arc<ImageRule>>,
    /// Byte rules
    pub bytes: Vec<Arc<ByteRule>>,
    /// Digest over every contributing rule
    pub patch_hash: String,
}

impl ResolvedPatches {
    /// Whether nothing applies
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.images.is_empty() && self.bytes.is_empty()
    }
}

impl PatchTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `rule` from pack number `pack` to `target`
    pub fn insert(&mut self, target: impl Into<String>, pack: usize, rule: PatchRule) {
        self.targets
            .entry(target.into())
            .or_default()
            .push(TargetedRule { pack, rule });
        self.rules += 1;
    }

    /// Record a successfully scanned pack
    pub(crate) fn add_pack(&mut self) {
        self.packs += 1;
    }

    /// Record a skipped rule or pack
    pub(crate) fn add_error(&mut self) {
        self.errors += 1;
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules
    }

    /// Whether the table has no rules
    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }

    /// Number of packs that contributed
    pub fn pack_count(&self) -> usize {
        self.packs
    }

    /// Number of configuration errors met while building the table
    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// Number of distinct target paths
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Collect the rules for `path`.
    ///
    /// Targets are visited from the full path down to its top-level
    /// directory; the root never matches. Within a target, later packs come
    /// first.
    pub fn resolve(&self, path: &str) -> ResolvedPatches {
        let mut resolved = ResolvedPatches::default();
        let mut digests = Vec::new();

        let mut prefix = path.trim_end_matches('/');
        while !prefix.is_empty() {
            if let Some(rules) = self.targets.get(prefix) {
                let mut ordered: Vec<&TargetedRule> = rules.iter().collect();
                ordered.sort_by(|a, b| b.pack.cmp(&a.pack));

                for targeted in ordered {
                    digests.push(targeted.rule.digest());
                    match &targeted.rule {
                        PatchRule::Image(rule) => resolved.images.push(Arc::clone(rule)),
                        PatchRule::Bytes(rule) => resolved.bytes.push(Arc::clone(rule)),
                        PatchRule::Script(patcher) => resolved.scripts.push(Arc::clone(patcher)),
                    }
                }
            }
            prefix = prefix.rfind('/').map_or("", |i| &prefix[..i]);
        }

        digests.sort();
        resolved.patch_hash = STANDARD.encode(md5::compute(digests.join(",")).0);
        resolved
    }
}
