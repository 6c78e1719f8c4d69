use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use ndarray::Array3;
use ndarray_npy::WriteNpyExt;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::model::ModelHandle;
use crate::nodule::{extract_centered_patch, Nodule};
use crate::volume::ScanVolume;
use crate::TARGET_XAI;

/// Trilinear resize to the target shape. Matches the map-then-interpolate
/// behavior the activation maps need: small feature-resolution grids blown
/// back up to patch resolution.
pub fn resize_trilinear(src: &Array3<f32>, target: (usize, usize, usize)) -> Array3<f32> {
    let (sd, sh, sw) = src.dim();
    let (td, th, tw) = target;

    let scale = |src_len: usize, dst_len: usize, idx: usize| -> f32 {
        if dst_len <= 1 {
            0.0
        } else {
            idx as f32 * (src_len - 1) as f32 / (dst_len - 1) as f32
        }
    };

    Array3::from_shape_fn(target, |(z, y, x)| {
        let fz = scale(sd, td, z);
        let fy = scale(sh, th, y);
        let fx = scale(sw, tw, x);

        let z0 = fz.floor() as usize;
        let y0 = fy.floor() as usize;
        let x0 = fx.floor() as usize;
        let z1 = (z0 + 1).min(sd - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let x1 = (x0 + 1).min(sw - 1);
        let (dz, dy, dx) = (fz - z0 as f32, fy - y0 as f32, fx - x0 as f32);

        let c00 = src[[z0, y0, x0]] * (1.0 - dx) + src[[z0, y0, x1]] * dx;
        let c01 = src[[z0, y1, x0]] * (1.0 - dx) + src[[z0, y1, x1]] * dx;
        let c10 = src[[z1, y0, x0]] * (1.0 - dx) + src[[z1, y0, x1]] * dx;
        let c11 = src[[z1, y1, x0]] * (1.0 - dx) + src[[z1, y1, x1]] * dx;

        let c0 = c00 * (1.0 - dy) + c01 * dy;
        let c1 = c10 * (1.0 - dy) + c11 * dy;
        c0 * (1.0 - dz) + c1 * dz
    })
}

fn jet(v: f32) -> [f32; 3] {
    let v = v.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    [r, g, b]
}

/// Flatten the central slice of the activation map onto the corresponding
/// CT slice as a color overlay.
fn write_overlay_png(
    patch: &Array3<f32>,
    cam: &Array3<f32>,
    path: &Path,
) -> Result<(), PipelineError> {
    let (depth, rows, cols) = patch.dim();
    let mid = depth / 2;

    let img = RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
        let (row, col) = (y as usize, x as usize);
        let gray = patch[[mid, row, col]].clamp(0.0, 1.0);
        let heat = jet(cam[[mid, row, col]]);
        let blend = |g: f32, h: f32| ((g * 0.6 + h * 0.4) * 255.0).round() as u8;
        Rgb([blend(gray, heat[0]), blend(gray, heat[1]), blend(gray, heat[2])])
    });

    img.save(path)
        .map_err(|e| PipelineError::Input(format!("cannot write overlay {}: {}", path.display(), e)))
}

/// Generate and persist the explainability assets for one risk-flagged
/// nodule: the raw activation map as `.npy` plus a middle-slice overlay PNG.
///
/// Returns the overlay path, falling back to the raw map path if only the
/// PNG failed. The caller treats any error as "explainability unavailable"
/// for this nodule; nothing here may abort the run.
pub fn generate_activation_assets(
    model: &ModelHandle,
    volume: &ScanVolume,
    nodule: &Nodule,
    xai_dir: &Path,
    patch_size: usize,
) -> Result<PathBuf, PipelineError> {
    let patch = extract_centered_patch(&volume.data, nodule.centroid, patch_size);

    let cam = model.activation_map(&patch)?;
    let mut cam = resize_trilinear(&cam, (patch_size, patch_size, patch_size));

    let max = cam.iter().fold(0.0_f32, |a, &b| a.max(b));
    if max > 0.0 {
        cam.mapv_inplace(|v| v / max);
    }

    fs::create_dir_all(xai_dir)
        .map_err(|e| PipelineError::Input(format!("cannot create {}: {}", xai_dir.display(), e)))?;

    let cam_path = xai_dir.join(format!("nodule_{}_gradcam.npy", nodule.id));
    let file = File::create(&cam_path)
        .map_err(|e| PipelineError::Input(format!("cannot write {}: {}", cam_path.display(), e)))?;
    cam.write_npy(BufWriter::new(file))
        .map_err(|e| PipelineError::Input(format!("cannot write {}: {}", cam_path.display(), e)))?;

    let png_path = xai_dir.join(format!("nodule_{}_gradcam.png", nodule.id));
    match write_overlay_png(&patch, &cam, &png_path) {
        Ok(()) => {
            info!(target: TARGET_XAI, "Wrote activation assets for nodule {}", nodule.id);
            Ok(png_path)
        }
        Err(e) => {
            warn!(target: TARGET_XAI, "Overlay PNG failed for nodule {}: {}; keeping raw map", nodule.id, e);
            Ok(cam_path)
        }
    }
}
