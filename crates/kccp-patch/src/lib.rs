//! Overlay packs for cached game assets
//!
//! Packs ("mods") ship pairs of `original`/`patched` files grouped under the
//! canonical path they apply to. The pipeline matches them against the
//! assets the cache serves and rewrites the matches:
//!
//! - **Spritesheets**: each frame declared in the asset's `.json` sidecar is
//!   compared against the pack's originals with a perceptual pixel
//!   difference; matching frames are replaced by the patched art
//! - **Other files**: replaced when their bytes equal the pack's original
//! - **Scripts**: packs granted script consent may ship executables that
//!   rewrite anything under their target
//!
//! Patched images are kept in a derived cache (`mod-cache.json` plus
//! `_patched/`) keyed by the source's `lastmodified` and a digest over the
//! contributing rules.
//!
//! # Example
//!
//! ```no_run
//! use kccp_patch::{PatchPipeline, PipelineConfig, load_descriptors};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = PatchPipeline::open(PipelineConfig::new("./cache")).await?;
//! let mods = load_descriptors(Path::new("./mods.json")).await?;
//! let table = pipeline.reload(&mods).await?;
//! println!("{} rules loaded", table.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod imgdiff;
pub mod manifest;
pub mod patched_cache;
pub mod pipeline;
pub mod rules;
pub mod scan;
pub mod script;
pub mod sprite;

pub use error::{PatchError, PatchResult};
pub use manifest::{ModDescriptor, ModManifest, ModPack, load_descriptors};
pub use patched_cache::PatchedCache;
pub use pipeline::{PatchPipeline, PipelineConfig};
pub use rules::{PatchRule, PatchTable, ResolvedPatches};
pub use script::{ExecutablePatcher, Patcher};
