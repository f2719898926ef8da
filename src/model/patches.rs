//! Patch-space transforms shared by the reference model and snapshot dumps.
//!
//! Patch vectors are laid out row, column, channel with channel fastest,
//! so `unpatchify(patchify(x)) == x`.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3};

/// Split a [C, H, W] image into a [num_patches, patch_dim] grid.
pub fn patchify(image: &Array3<f32>, patch_size: usize) -> Result<Array2<f32>> {
    let (channels, height, width) = image.dim();
    if patch_size == 0 || height % patch_size != 0 || width % patch_size != 0 {
        bail!(
            "image {}x{} is not divisible into {}px patches",
            height,
            width,
            patch_size
        );
    }
    let grid_h = height / patch_size;
    let grid_w = width / patch_size;
    let patch_dim = patch_size * patch_size * channels;
    let mut patches = Array2::zeros((grid_h * grid_w, patch_dim));
    for gi in 0..grid_h {
        for gj in 0..grid_w {
            let row = gi * grid_w + gj;
            for pi in 0..patch_size {
                for pj in 0..patch_size {
                    for ch in 0..channels {
                        let col = (pi * patch_size + pj) * channels + ch;
                        patches[[row, col]] =
                            image[[ch, gi * patch_size + pi, gj * patch_size + pj]];
                    }
                }
            }
        }
    }
    Ok(patches)
}

/// Reassemble a square patch grid into a [C, H, W] image.
pub fn unpatchify(patches: &Array2<f32>, patch_size: usize) -> Result<Array3<f32>> {
    let (num_patches, patch_dim) = patches.dim();
    let grid = (num_patches as f64).sqrt() as usize;
    if grid * grid != num_patches {
        bail!("{} patches do not form a square grid", num_patches);
    }
    if patch_size == 0 || patch_dim % (patch_size * patch_size) != 0 {
        bail!(
            "patch dim {} does not match {}px patches",
            patch_dim,
            patch_size
        );
    }
    let channels = patch_dim / (patch_size * patch_size);
    let side = grid * patch_size;
    let mut image = Array3::zeros((channels, side, side));
    for gi in 0..grid {
        for gj in 0..grid {
            let row = gi * grid + gj;
            for pi in 0..patch_size {
                for pj in 0..patch_size {
                    for ch in 0..channels {
                        let col = (pi * patch_size + pj) * channels + ch;
                        image[[ch, gi * patch_size + pi, gj * patch_size + pj]] =
                            patches[[row, col]];
                    }
                }
            }
        }
    }
    Ok(image)
}

/// Zero out the masked patches of an image (mask entry 1 = masked).
pub fn apply_patch_mask(
    image: &Array3<f32>,
    mask: &Array1<f32>,
    patch_size: usize,
) -> Result<Array3<f32>> {
    let mut patches = patchify(image, patch_size)?;
    if patches.nrows() != mask.len() {
        bail!(
            "mask covers {} patches, image has {}",
            mask.len(),
            patches.nrows()
        );
    }
    for (row, &m) in mask.iter().enumerate() {
        if m > 0.5 {
            patches.row_mut(row).fill(0.0);
        }
    }
    unpatchify(&patches, patch_size)
}
