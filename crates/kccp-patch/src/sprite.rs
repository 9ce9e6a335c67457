//! Spritesheet frame metadata and region replacement.

use crate::{
    error::{PatchError, PatchResult},
    imgdiff::{average_hash, is_match},
    rules::ImageRule,
};
use bytes::Bytes;
use image::{Rgba, RgbaImage, imageops};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::debug;

/// One frame rectangle of a spritesheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Frame {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width
    pub w: u32,
    /// Height
    pub h: u32,
}

#[derive(Deserialize)]
struct FrameEntry {
    frame: Frame,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Frames {
    List(Vec<FrameEntry>),
    Named(BTreeMap<String, FrameEntry>),
}

#[derive(Deserialize)]
struct Sidecar {
    frames: Frames,
}

/// Location of the frame metadata that accompanies `cache_file`
pub fn sidecar_path(cache_file: &Path) -> PathBuf {
    cache_file.with_extension("json")
}

/// Parse a sidecar document.
pub fn parse_sidecar(path: &Path, bytes: &[u8]) -> PatchResult<Vec<Frame>> {
    let sidecar: Sidecar = serde_json::from_slice(bytes).map_err(|e| PatchError::Sidecar {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(match sidecar.frames {
        Frames::List(list) => list.into_iter().map(|e| e.frame).collect(),
        Frames::Named(named) => named.into_values().map(|e| e.frame).collect(),
    })
}

/// Read the frames declared for `cache_file`, or `None` when it has no sidecar.
pub async fn load_frames(cache_file: &Path) -> PatchResult<Option<Vec<Frame>>> {
    let path = sidecar_path(cache_file);
    match fs::read(&path).await {
        Ok(bytes) => parse_sidecar(&path, &bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Result of matching rules against one image
#[derive(Debug)]
pub enum SheetOutcome {
    /// No rule matched
    Unchanged,
    /// The whole image matched a rule; its patched file replaces the asset
    Replaced(Bytes),
    /// Some frames were replaced
    Composited {
        /// The edited sheet
        image: RgbaImage,
        /// How many frames were replaced
        replaced: usize,
    },
}

/// Match `rules` against `sheet` and apply the first match per region.
///
/// Without frames the image is treated as one sprite. With frames, each rule
/// is consumed by the first region it matches.
pub fn apply_rules(
    mut sheet: RgbaImage,
    frames: Option<&[Frame]>,
    rules: &[Arc<ImageRule>],
) -> SheetOutcome {
    let Some(frames) = frames else {
        let hash = average_hash(&sheet);
        return rules
            .iter()
            .find(|rule| is_match(&sheet, hash, &rule.original, rule.original_hash))
            .map_or(SheetOutcome::Unchanged, |rule| {
                debug!("Whole image matches {}", rule.name);
                SheetOutcome::Replaced(rule.patched_png.clone())
            });
    };

    let mut candidates: Vec<&Arc<ImageRule>> = rules.iter().collect();
    let mut replaced = 0;

    for frame in frames {
        if candidates.is_empty() {
            break;
        }
        if !candidates
            .iter()
            .any(|rule| rule.original.dimensions() == (frame.w, frame.h))
        {
            continue;
        }
        if u64::from(frame.x) + u64::from(frame.w) > u64::from(sheet.width())
            || u64::from(frame.y) + u64::from(frame.h) > u64::from(sheet.height())
        {
            debug!("Frame {:?} lies outside the sheet", frame);
            continue;
        }

        let region = imageops::crop_imm(&sheet, frame.x, frame.y, frame.w, frame.h).to_image();
        let hash = average_hash(&region);
        let Some(position) = candidates
            .iter()
            .position(|rule| is_match(&region, hash, &rule.original, rule.original_hash))
        else {
            continue;
        };

        let rule = candidates.remove(position);
        debug!("Frame at ({}, {}) matches {}", frame.x, frame.y, rule.name);
        clear_region(&mut sheet, *frame);
        imageops::replace(
            &mut sheet,
            &rule.patched,
            i64::from(frame.x),
            i64::from(frame.y),
        );
        replaced += 1;
    }

    if replaced == 0 {
        SheetOutcome::Unchanged
    } else {
        SheetOutcome::Composited {
            image: sheet,
            replaced,
        }
    }
}

fn clear_region(sheet: &mut RgbaImage, frame: Frame) {
    for y in frame.y..frame.y + frame.h {
        for x in frame.x..frame.x + frame.w {
            sheet.put_pixel(x, y, Rgba([0, 0, 0, 0]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::pair_digest;

    fn checker(w: u32, h: u32, seed: u8) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgba([seed, 40, 200, 255])
            } else {
                Rgba([250, seed, 10, 255])
            }
        })
    }

    fn rule(original: RgbaImage, patched: RgbaImage) -> Arc<ImageRule> {
        Arc::new(ImageRule {
            name: "icon.png@test-1".to_string(),
            original_hash: average_hash(&original),
            digest: pair_digest(original.as_raw(), patched.as_raw()),
            original,
            patched,
            patched_png: Bytes::from_static(b"patched-file"),
        })
    }

    #[test]
    fn test_parse_sidecar_forms() {
        let named = br#"{"frames":{"b":{"frame":{"x":1,"y":2,"w":3,"h":4},"rotated":false}},"meta":{}}"#;
        let frames = parse_sidecar(Path::new("a.json"), named).unwrap();
        assert_eq!(frames, vec![Frame { x: 1, y: 2, w: 3, h: 4 }]);

        let listed = br#"{"frames":[{"filename":"a","frame":{"x":0,"y":0,"w":8,"h":8}}]}"#;
        assert_eq!(parse_sidecar(Path::new("a.json"), listed).unwrap().len(), 1);

        let broken = br#"{"frames": 3}"#;
        assert!(matches!(
            parse_sidecar(Path::new("a.json"), broken),
            Err(PatchError::Sidecar { .. })
        ));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/cache/kcs2/img/sheet.png")),
            PathBuf::from("/cache/kcs2/img/sheet.json")
        );
    }

    #[test]
    fn test_whole_image_replacement() {
        let img = checker(16, 16, 0);
        let outcome = apply_rules(img.clone(), None, &[rule(img, checker(16, 16, 99))]);
        assert!(matches!(outcome, SheetOutcome::Replaced(b) if b == "patched-file"));
    }

    #[test]
    fn test_whole_image_size_mismatch() {
        let outcome = apply_rules(
            checker(16, 16, 0),
            None,
            &[rule(checker(8, 8, 0), checker(8, 8, 99))],
        );
        assert!(matches!(outcome, SheetOutcome::Unchanged));
    }

    #[test]
    fn test_frame_region_replaced() {
        let mut sheet = RgbaImage::from_pixel(32, 32, Rgba([0, 0, 0, 255]));
        let icon = checker(8, 8, 0);
        imageops::replace(&mut sheet, &icon, 16, 8);
        let patched = RgbaImage::from_pixel(8, 8, Rgba([255, 0, 255, 255]));

        let frames = [Frame { x: 0, y: 0, w: 8, h: 8 }, Frame { x: 16, y: 8, w: 8, h: 8 }];
        let outcome = apply_rules(sheet, Some(&frames), &[rule(icon, patched)]);
        let SheetOutcome::Composited { image, replaced } = outcome else {
            panic!("expected a composited sheet");
        };
        assert_eq!(replaced, 1);
        assert_eq!(*image.get_pixel(16, 8), Rgba([255, 0, 255, 255]));
        assert_eq!(*image.get_pixel(23, 15), Rgba([255, 0, 255, 255]));
        assert_eq!(*image.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_rule_consumed_once() {
        let icon = checker(8, 8, 0);
        let mut sheet = RgbaImage::from_pixel(16, 8, Rgba([0, 0, 0, 255]));
        imageops::replace(&mut sheet, &icon, 0, 0);
        imageops::replace(&mut sheet, &icon, 8, 0);
        let patched = RgbaImage::from_pixel(8, 8, Rgba([9, 9, 9, 255]));

        let frames = [Frame { x: 0, y: 0, w: 8, h: 8 }, Frame { x: 8, y: 0, w: 8, h: 8 }];
        let SheetOutcome::Composited { image, replaced } =
            apply_rules(sheet, Some(&frames), &[rule(icon.clone(), patched)])
        else {
            panic!("expected a composited sheet");
        };
        assert_eq!(replaced, 1);
        assert_eq!(*image.get_pixel(8, 0), *icon.get_pixel(0, 0));
    }

    #[test]
    fn test_out_of_bounds_frame_skipped() {
        let icon = checker(8, 8, 0);
        let frames = [Frame { x: 12, y: 0, w: 8, h: 8 }];
        let outcome = apply_rules(
            checker(16, 16, 0),
            Some(&frames),
            &[rule(icon, checker(8, 8, 1))],
        );
        assert!(matches!(outcome, SheetOutcome::Unchanged));
    }
}
