//! VP8X extended-format header and ALPH alpha-chunk support.

use byteorder::ReadBytesExt;
use num_traits::clamp;
use std::io::Read;

use crate::decoder::DecodingError;
use crate::lossless::LosslessDecoder;

/// Feature flags and canvas geometry carried by a `VP8X` chunk.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WebPExtendedInfo {
    pub(crate) alpha: bool,
    pub(crate) exif_metadata: bool,
    pub(crate) xmp_metadata: bool,
    pub(crate) animation: bool,
    pub(crate) icc_profile: bool,
    pub(crate) canvas_width: u32,
    pub(crate) canvas_height: u32,
}

pub(crate) fn read_3_bytes<R: Read>(r: &mut R) -> Result<u32, DecodingError> {
    let mut bytes = [0u8; 3];
    r.read_exact(&mut bytes)?;
    Ok(u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16)
}

/// Parses the 10-byte `VP8X` payload.
pub(crate) fn read_extended_header<R: Read>(
    r: &mut R,
    chunk_size: u32,
) -> Result<WebPExtendedInfo, DecodingError> {
    if chunk_size != 10 {
        return Err(DecodingError::InvalidVp8xChunkSize(chunk_size));
    }

    let flags = r.read_u8()?;
    let info = WebPExtendedInfo {
        alpha: flags & (1 << 4) != 0,
        exif_metadata: flags & (1 << 5) != 0,
        xmp_metadata: flags & (1 << 3) != 0,
        animation: flags & (1 << 2) != 0,
        icc_profile: flags & (1 << 1) != 0,
        ..Default::default()
    };
    if flags & !0b0011_1110 != 0 {
        log::warn!("reserved VP8X flag bits set: {flags:#04x}");
    }

    let mut reserved = [0u8; 3];
    r.read_exact(&mut reserved)?;

    let canvas_width = read_3_bytes(r)? + 1;
    let canvas_height = read_3_bytes(r)? + 1;
    if canvas_width > 16384 || canvas_height > 16384 {
        return Err(DecodingError::DimensionsOutOfRange);
    }

    Ok(WebPExtendedInfo {
        canvas_width,
        canvas_height,
        ..info
    })
}

/// Builds the 10-byte `VP8X` payload the encoder emits.
pub(crate) fn extended_header_payload(alpha: bool, width: u32, height: u32) -> [u8; 10] {
    let mut payload = [0u8; 10];
    if alpha {
        payload[0] |= 1 << 4;
    }
    let w = width - 1;
    let h = height - 1;
    payload[4..7].copy_from_slice(&[w as u8, (w >> 8) as u8, (w >> 16) as u8]);
    payload[7..10].copy_from_slice(&[h as u8, (h >> 8) as u8, (h >> 16) as u8]);
    payload
}

/// Row filters an ALPH chunk may apply before compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilteringMethod {
    None,
    Horizontal,
    Vertical,
    Gradient,
}

/// A decoded, defiltered alpha plane: `width * height` bytes, row-major.
#[derive(Debug)]
pub(crate) struct AlphaChunk {
    pub(crate) filtering_method: FilteringMethod,
    pub(crate) data: Vec<u8>,
}

/// Parses an `ALPH` chunk: header byte, raw or VP8L-compressed plane, then
/// the row filter is reversed.
pub(crate) fn read_alpha_chunk<R: Read>(
    r: &mut R,
    width: u16,
    height: u16,
) -> Result<AlphaChunk, DecodingError> {
    let info = r.read_u8().map_err(|_| DecodingError::InvalidAlphChunk)?;

    let compression = info & 0b11;
    let filtering_method = match (info >> 2) & 0b11 {
        0 => FilteringMethod::None,
        1 => FilteringMethod::Horizontal,
        2 => FilteringMethod::Vertical,
        _ => FilteringMethod::Gradient,
    };
    let preprocessing = (info >> 4) & 0b11;
    if preprocessing != 0 {
        log::warn!("ignoring unknown ALPH preprocessing value {preprocessing}");
    }

    let plane_len = usize::from(width) * usize::from(height);
    let mut data = match compression {
        0 => {
            let mut data = vec![0u8; plane_len];
            r.read_exact(&mut data)
                .map_err(|_| DecodingError::InvalidAlphaDimensions)?;
            data
        }
        1 => {
            // A headerless VP8L stream; the green channel carries the alpha
            // values and the dimensions come from the surrounding container.
            let mut compressed = Vec::new();
            r.read_to_end(&mut compressed)?;
            let mut decoder = LosslessDecoder::new_headerless(compressed, width, height);
            let frame = decoder.decode_headerless_frame()?;
            if (frame.width, frame.height) != (width, height) {
                return Err(DecodingError::InvalidAlphaDimensions);
            }
            frame.buf.chunks_exact(4).map(|px| px[1]).collect()
        }
        other => return Err(DecodingError::InvalidAlphaCompression(other)),
    };

    unfilter_alpha(&mut data, usize::from(width), usize::from(height), filtering_method);
    Ok(AlphaChunk {
        filtering_method,
        data,
    })
}

/// Predictor for one alpha sample given the already-reconstructed plane.
pub(crate) fn get_alpha_predictor(
    plane: &[u8],
    x: usize,
    y: usize,
    width: usize,
    method: FilteringMethod,
) -> u8 {
    match method {
        FilteringMethod::None => 0,
        FilteringMethod::Horizontal => {
            if x == 0 {
                if y == 0 {
                    0
                } else {
                    plane[(y - 1) * width]
                }
            } else {
                plane[y * width + x - 1]
            }
        }
        FilteringMethod::Vertical => {
            if y == 0 {
                if x == 0 {
                    0
                } else {
                    plane[x - 1]
                }
            } else {
                plane[(y - 1) * width + x]
            }
        }
        FilteringMethod::Gradient => match (x, y) {
            (0, 0) => 0,
            (0, _) => plane[(y - 1) * width],
            (_, 0) => plane[x - 1],
            _ => {
                let left = i32::from(plane[y * width + x - 1]);
                let top = i32::from(plane[(y - 1) * width + x]);
                let top_left = i32::from(plane[(y - 1) * width + x - 1]);
                clamp(left + top - top_left, 0, 255) as u8
            }
        },
    }
}

fn unfilter_alpha(plane: &mut [u8], width: usize, height: usize, method: FilteringMethod) {
    if method == FilteringMethod::None {
        return;
    }
    for y in 0..height {
        for x in 0..width {
            let predictor = get_alpha_predictor(plane, x, y, width, method);
            plane[y * width + x] = plane[y * width + x].wrapping_add(predictor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_extended_header() {
        let payload = extended_header_payload(true, 300, 7);
        let info = read_extended_header(&mut Cursor::new(payload), 10).unwrap();
        assert!(info.alpha);
        assert!(!info.animation);
        assert_eq!((info.canvas_width, info.canvas_height), (300, 7));
    }

    #[test]
    fn rejects_wrong_vp8x_size() {
        let err = read_extended_header(&mut Cursor::new([0u8; 9]), 9).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidVp8xChunkSize(9)));
    }

    #[test]
    fn rejects_oversized_canvas() {
        let mut payload = [0u8; 10];
        let w = 16385u32 - 1;
        payload[4..7].copy_from_slice(&[w as u8, (w >> 8) as u8, (w >> 16) as u8]);
        let err = read_extended_header(&mut Cursor::new(payload), 10).unwrap_err();
        assert!(matches!(err, DecodingError::DimensionsOutOfRange));
    }

    #[test]
    fn raw_alpha_plane_round_trips() {
        let mut chunk = vec![0u8]; // raw, no filter
        chunk.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let alpha = read_alpha_chunk(&mut Cursor::new(chunk), 3, 2).unwrap();
        assert_eq!(alpha.filtering_method, FilteringMethod::None);
        assert_eq!(alpha.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn rejects_reserved_compression_method() {
        let chunk = vec![0b10u8, 0, 0, 0, 0];
        let err = read_alpha_chunk(&mut Cursor::new(chunk), 2, 2).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidAlphaCompression(2)));
    }

    #[test]
    fn short_raw_plane_is_dimension_mismatch() {
        let chunk = vec![0u8, 9, 9];
        let err = read_alpha_chunk(&mut Cursor::new(chunk), 2, 2).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidAlphaDimensions));
    }

    #[test]
    fn empty_chunk_is_invalid() {
        let err = read_alpha_chunk(&mut Cursor::new(Vec::new()), 1, 1).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidAlphChunk));
    }

    fn filter_plane(plane: &[u8], width: usize, height: usize, method: FilteringMethod) -> Vec<u8> {
        // Forward filter for tests: residual against the original plane.
        let mut out = vec![0u8; plane.len()];
        for y in 0..height {
            for x in 0..width {
                let predictor = get_alpha_predictor(plane, x, y, width, method);
                out[y * width + x] = plane[y * width + x].wrapping_sub(predictor);
            }
        }
        out
    }

    #[test]
    fn every_filter_method_round_trips() {
        let plane: Vec<u8> = (0..20u8).map(|i| i.wrapping_mul(37)).collect();
        for method in [
            FilteringMethod::None,
            FilteringMethod::Horizontal,
            FilteringMethod::Vertical,
            FilteringMethod::Gradient,
        ] {
            let mut filtered = filter_plane(&plane, 5, 4, method);
            unfilter_alpha(&mut filtered, 5, 4, method);
            assert_eq!(filtered, plane, "{method:?}");
        }
    }

    #[test]
    fn vp8l_compressed_alpha_uses_green_channel() {
        use crate::encoder::{build_huffman_codes, write_huffman_tree, BitWriter};

        // Headerless stream for a 2x2 plane with alpha values 1..=4.
        let mut w = BitWriter::new();
        w.write_bits(0, 1).unwrap(); // no transforms
        w.write_bits(0, 1).unwrap(); // no color cache
        w.write_bits(0, 1).unwrap(); // no meta-Huffman
        let mut green_hist = vec![0u32; 280];
        for v in 1..=4 {
            green_hist[v] = 1;
        }
        let green_codes = build_huffman_codes(&green_hist, 15);
        write_huffman_tree(&mut w, &green_codes).unwrap();
        let mut zero = vec![0u32; 256];
        zero[0] = 1;
        for _ in 0..3 {
            write_huffman_tree(&mut w, &build_huffman_codes(&zero, 15)).unwrap();
        }
        write_huffman_tree(&mut w, &build_huffman_codes(&[0u32; 40], 15)).unwrap();
        for v in 1..=4 {
            w.write_code(green_codes[v]).unwrap();
        }

        let mut chunk = vec![0b01u8]; // compression 1, no filter
        chunk.extend_from_slice(&w.into_bytes());
        let alpha = read_alpha_chunk(&mut Cursor::new(chunk), 2, 2).unwrap();
        assert_eq!(alpha.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn horizontal_filter_decodes_known_rows() {
        // filter byte: compression 0, filter 1 (horizontal).
        let mut chunk = vec![0b0100u8];
        // Row deltas for [10, 20, 30] / [5, 5, 5].
        chunk.extend_from_slice(&[10, 10, 10, 251, 0, 0]);
        let alpha = read_alpha_chunk(&mut Cursor::new(chunk), 3, 2).unwrap();
        assert_eq!(alpha.data, vec![10, 20, 30, 5, 5, 5]);
    }
}
