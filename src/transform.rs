//! The four invertible VP8L transforms.
//!
//! Each parsed transform owns its metadata and undoes itself on a decoded
//! pixel buffer; the forward halves used by the encoder live alongside as
//! free functions. All channel arithmetic wraps modulo 256.

use std::collections::HashMap;

use num_traits::clamp;

use crate::decoder::DecodingError;
use crate::encoder::EncodingError;
use crate::lossless::subsample_size;

/// A parsed transform, recorded in bitstream order. `width` is the width of
/// the image the transform was applied to, which its inverse restores.
#[derive(Debug, Clone)]
pub(crate) enum Transform {
    Predictor {
        size_bits: u8,
        meta: Vec<u8>,
        width: u16,
    },
    CrossColor {
        size_bits: u8,
        meta: Vec<u8>,
        width: u16,
    },
    SubtractGreen,
    ColorIndexing {
        num_colors: u16,
        palette: Vec<u8>,
        width: u16,
    },
}

/// log2 of the number of palette indices packed per byte.
pub(crate) fn palette_index_bits(num_colors: u16) -> u8 {
    match num_colors {
        0..=2 => 3,
        3..=4 => 2,
        5..=16 => 1,
        _ => 0,
    }
}

impl Transform {
    /// Width of the image downstream of this transform. Only color-indexing
    /// changes it, by packing several indices into one byte.
    pub(crate) fn output_width(&self, current: u16) -> u16 {
        match self {
            Transform::ColorIndexing {
                num_colors, width, ..
            } => subsample_size(*width, palette_index_bits(*num_colors)),
            _ => current,
        }
    }

    /// Undoes the transform on a decoded buffer, returning the restored
    /// (possibly wider) buffer.
    pub(crate) fn apply_inverse(
        self,
        buf: Vec<u8>,
        height: u16,
    ) -> Result<Vec<u8>, DecodingError> {
        match self {
            Transform::SubtractGreen => Ok(inverse_subtract_green(buf)),
            Transform::Predictor {
                size_bits,
                meta,
                width,
            } => inverse_predictor(buf, width as usize, height as usize, size_bits, &meta),
            Transform::CrossColor {
                size_bits,
                meta,
                width,
            } => inverse_cross_color(buf, width as usize, height as usize, size_bits, &meta),
            Transform::ColorIndexing {
                num_colors,
                palette,
                width,
            } => inverse_color_indexing(buf, width as usize, height as usize, num_colors, &palette),
        }
    }
}

fn pixel(buf: &[u8], p: usize) -> [u8; 4] {
    [buf[4 * p], buf[4 * p + 1], buf[4 * p + 2], buf[4 * p + 3]]
}

fn avg2(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b)) >> 1) as u8
}

fn avg2_px(a: [u8; 4], b: [u8; 4]) -> [u8; 4] {
    [
        avg2(a[0], b[0]),
        avg2(a[1], b[1]),
        avg2(a[2], b[2]),
        avg2(a[3], b[3]),
    ]
}

fn sum_abs_diff(a: [u8; 4], b: [u8; 4]) -> i32 {
    (0..4).map(|c| (i32::from(a[c]) - i32::from(b[c])).abs()).sum()
}

/// One of the 14 predictor modes over the `{L, T, TL, TR}` neighborhood.
/// Returns `None` for an out-of-range mode byte.
pub(crate) fn predict_pixel(
    mode: u8,
    l: [u8; 4],
    t: [u8; 4],
    tl: [u8; 4],
    tr: [u8; 4],
) -> Option<[u8; 4]> {
    let px = match mode {
        0 => [0, 0, 0, 0xff],
        1 => l,
        2 => t,
        3 => tr,
        4 => tl,
        5 => avg2_px(avg2_px(l, tr), t),
        6 => avg2_px(l, tl),
        7 => avg2_px(l, t),
        8 => avg2_px(tl, t),
        9 => avg2_px(t, tr),
        10 => avg2_px(avg2_px(l, tl), avg2_px(t, tr)),
        11 => {
            // Select: whichever of L and T the top-left corner resembles less.
            if sum_abs_diff(tl, t) < sum_abs_diff(tl, l) {
                l
            } else {
                t
            }
        }
        12 => {
            let mut px = [0; 4];
            for c in 0..4 {
                let v = i32::from(l[c]) + i32::from(t[c]) - i32::from(tl[c]);
                px[c] = clamp(v, 0, 255) as u8;
            }
            px
        }
        13 => {
            let a = avg2_px(l, t);
            let mut px = [0; 4];
            for c in 0..4 {
                let v = i32::from(a[c]) + (i32::from(a[c]) - i32::from(tl[c])) / 2;
                px[c] = clamp(v, 0, 255) as u8;
            }
            px
        }
        _ => return None,
    };
    Some(px)
}

/// Prediction for `(x, y)` honoring the border conventions that override the
/// tile mode on the first row and column.
fn predict_at(
    buf: &[u8],
    x: usize,
    y: usize,
    width: usize,
    mode: u8,
) -> Result<[u8; 4], DecodingError> {
    let p = y * width + x;
    if x == 0 && y == 0 {
        return Ok([0, 0, 0, 0xff]);
    }
    if y == 0 {
        return Ok(pixel(buf, p - 1));
    }
    if x == 0 {
        return Ok(pixel(buf, p - width));
    }
    let l = pixel(buf, p - 1);
    let t = pixel(buf, p - width);
    let tl = pixel(buf, p - width - 1);
    // For the last column this wraps to the leftmost pixel of the current
    // row, which is already reconstructed.
    let tr = pixel(buf, p - width + 1);
    predict_pixel(mode, l, t, tl, tr).ok_or(DecodingError::InvalidTransformType)
}

fn inverse_predictor(
    mut buf: Vec<u8>,
    width: usize,
    height: usize,
    size_bits: u8,
    meta: &[u8],
) -> Result<Vec<u8>, DecodingError> {
    if buf.len() != 4 * width * height {
        return Err(DecodingError::PixelBufferOverflow);
    }
    let tiles_per_row = subsample_size(width as u16, size_bits) as usize;
    for p in 0..width * height {
        let (x, y) = (p % width, p / width);
        let tile = (y >> size_bits) * tiles_per_row + (x >> size_bits);
        let mode = meta[4 * tile + 1];
        let pred = predict_at(&buf, x, y, width, mode)?;
        for c in 0..4 {
            buf[4 * p + c] = buf[4 * p + c].wrapping_add(pred[c]);
        }
    }
    Ok(buf)
}

/// `(t * c) >> 5` with both factors sign-extended, truncated back to a byte.
fn color_transform_delta(t: i8, c: i8) -> u8 {
    ((i32::from(t) * i32::from(c)) >> 5) as u8
}

fn inverse_cross_color(
    mut buf: Vec<u8>,
    width: usize,
    height: usize,
    size_bits: u8,
    meta: &[u8],
) -> Result<Vec<u8>, DecodingError> {
    if buf.len() != 4 * width * height {
        return Err(DecodingError::PixelBufferOverflow);
    }
    let tiles_per_row = subsample_size(width as u16, size_bits) as usize;
    for p in 0..width * height {
        let (x, y) = (p % width, p / width);
        let tile = (y >> size_bits) * tiles_per_row + (x >> size_bits);
        let red_to_blue = meta[4 * tile] as i8;
        let green_to_blue = meta[4 * tile + 1] as i8;
        let green_to_red = meta[4 * tile + 2] as i8;

        let green = buf[4 * p + 1] as i8;
        let red = buf[4 * p].wrapping_add(color_transform_delta(green_to_red, green));
        let mut blue = buf[4 * p + 2].wrapping_add(color_transform_delta(green_to_blue, green));
        blue = blue.wrapping_add(color_transform_delta(red_to_blue, red as i8));
        buf[4 * p] = red;
        buf[4 * p + 2] = blue;
    }
    Ok(buf)
}

fn inverse_subtract_green(mut buf: Vec<u8>) -> Vec<u8> {
    for px in buf.chunks_exact_mut(4) {
        px[0] = px[0].wrapping_add(px[1]);
        px[2] = px[2].wrapping_add(px[1]);
    }
    buf
}

fn inverse_color_indexing(
    buf: Vec<u8>,
    width: usize,
    height: usize,
    num_colors: u16,
    palette: &[u8],
) -> Result<Vec<u8>, DecodingError> {
    let bits = palette_index_bits(num_colors);
    let packed_width = subsample_size(width as u16, bits) as usize;
    if buf.len() != 4 * packed_width * height {
        return Err(DecodingError::PixelBufferOverflow);
    }

    let index_bits = 8 >> bits;
    let index_mask = if bits == 0 { 0xff } else { (1u8 << index_bits) - 1 };
    let pixels_per_byte = 1usize << bits;

    let mut out = vec![0u8; 4 * width * height];
    for y in 0..height {
        for x in 0..width {
            let packed = buf[4 * (y * packed_width + x / pixels_per_byte) + 1];
            let shift = (x % pixels_per_byte) as u8 * index_bits;
            let index = usize::from((packed >> shift) & index_mask);
            let o = 4 * (y * width + x);
            // Indices past the palette resolve to transparent black.
            if index < usize::from(num_colors) {
                out[o..o + 4].copy_from_slice(&palette[4 * index..4 * index + 4]);
            }
        }
    }
    Ok(out)
}

//
// Forward halves, used by the encoder.
//

pub(crate) fn forward_subtract_green(buf: &mut [u8]) {
    for px in buf.chunks_exact_mut(4) {
        px[0] = px[0].wrapping_sub(px[1]);
        px[2] = px[2].wrapping_sub(px[1]);
    }
}

/// Squared-frequency concentration score; lower means the residual histogram
/// is more skewed and should entropy-code smaller.
fn tile_score(histograms: &[[u32; 256]; 4]) -> f64 {
    let mut score = 0.0;
    for hist in histograms {
        let sum: u64 = hist.iter().map(|&h| u64::from(h)).sum();
        if sum == 0 {
            continue;
        }
        let sum_sq: u64 = hist.iter().map(|&h| u64::from(h) * u64::from(h)).sum();
        score += 1.0 - sum_sq as f64 / (sum as f64 * sum as f64);
    }
    score
}

/// Applies the predictor transform: picks the lowest-entropy mode per tile,
/// replaces pixels with residuals, and returns `(residuals, mode meta-image)`.
pub(crate) fn forward_predictor(
    buf: &[u8],
    width: usize,
    height: usize,
    size_bits: u8,
) -> (Vec<u8>, Vec<u8>) {
    let tiles_per_row = subsample_size(width as u16, size_bits) as usize;
    let tiles_per_col = subsample_size(height as u16, size_bits) as usize;
    let tile_size = 1usize << size_bits;

    let mut residuals = vec![0u8; buf.len()];
    let mut meta = vec![0u8; 4 * tiles_per_row * tiles_per_col];

    for ty in 0..tiles_per_col {
        for tx in 0..tiles_per_row {
            let x0 = tx * tile_size;
            let y0 = ty * tile_size;
            let x1 = (x0 + tile_size).min(width);
            let y1 = (y0 + tile_size).min(height);

            let mut best_mode = 0;
            let mut best_score = f64::INFINITY;
            for mode in 0..14u8 {
                let mut histograms = [[0u32; 256]; 4];
                for y in y0..y1 {
                    for x in x0..x1 {
                        let pred = predict_at(buf, x, y, width, mode)
                            .expect("mode is in range");
                        let p = 4 * (y * width + x);
                        for c in 0..4 {
                            let residual = buf[p + c].wrapping_sub(pred[c]);
                            histograms[c][usize::from(residual)] += 1;
                        }
                    }
                }
                let score = tile_score(&histograms);
                if score < best_score {
                    best_score = score;
                    best_mode = mode;
                }
            }

            for y in y0..y1 {
                for x in x0..x1 {
                    let pred = predict_at(buf, x, y, width, best_mode)
                        .expect("mode is in range");
                    let p = 4 * (y * width + x);
                    for c in 0..4 {
                        residuals[p + c] = buf[p + c].wrapping_sub(pred[c]);
                    }
                }
            }
            let t = 4 * (ty * tiles_per_row + tx);
            meta[t..t + 4].copy_from_slice(&[0, best_mode, 0, 0xff]);
        }
    }
    (residuals, meta)
}

/// Collects the image's unique colors in order of first appearance.
pub(crate) fn build_palette(buf: &[u8]) -> Result<Vec<[u8; 4]>, EncodingError> {
    let mut seen = HashMap::new();
    let mut palette = Vec::new();
    for px in buf.chunks_exact(4) {
        let color = [px[0], px[1], px[2], px[3]];
        if seen.insert(color, palette.len()).is_none() {
            if palette.len() == 256 {
                return Err(EncodingError::PaletteExceeds256Colors);
            }
            palette.push(color);
        }
    }
    Ok(palette)
}

/// Replaces each pixel with its palette index and packs indices into the
/// green channel, several per byte for small palettes.
pub(crate) fn pack_palette_indices(
    buf: &[u8],
    width: usize,
    height: usize,
    palette: &[[u8; 4]],
) -> Vec<u8> {
    let index_of: HashMap<[u8; 4], u8> = palette
        .iter()
        .enumerate()
        .map(|(i, &c)| (c, i as u8))
        .collect();

    let bits = palette_index_bits(palette.len() as u16);
    let index_bits = 8 >> bits;
    let pixels_per_byte = 1usize << bits;
    let packed_width = subsample_size(width as u16, bits) as usize;

    let mut out = vec![0u8; 4 * packed_width * height];
    for y in 0..height {
        for x in 0..width {
            let px = &buf[4 * (y * width + x)..][..4];
            let index = index_of[&[px[0], px[1], px[2], px[3]]];
            let o = 4 * (y * packed_width + x / pixels_per_byte);
            let shift = (x % pixels_per_byte) as u8 * index_bits;
            out[o + 1] |= index << shift;
            out[o + 3] = 0xff;
        }
    }
    out
}
