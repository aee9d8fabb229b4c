//! Decoding of VP8L (WebP lossless) bitstreams.
//!
//! The decoder mirrors the layered structure of the format: a little-endian
//! bit reader feeds canonical prefix-code trees, which feed a pixel pass of
//! literals, LZ77 backward references and color-cache hits; the recorded
//! transforms are then inverted in reverse order.

use std::io::Read;

use crate::decoder::DecodingError;
use crate::huffman::HuffmanTree;
use crate::nrgba::NrgbaImage;
use crate::transform::Transform;

/// Fixed reorder permutation for the meta code-length alphabet.
pub(crate) const CODE_LENGTH_CODE_ORDER: [usize; 19] = [
    17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

/// Near-distance neighborhood map. Each entry packs `(y_off << 4) | (8 - x_off)`;
/// distance codes 1..=120 index it, larger codes are plain linear offsets.
#[rustfmt::skip]
pub(crate) const DIST_MAP: [u8; 120] = [
    0x18, 0x07, 0x17, 0x19, 0x28, 0x06, 0x27, 0x29, 0x16, 0x1a, 0x26, 0x2a,
    0x38, 0x05, 0x37, 0x39, 0x15, 0x1b, 0x36, 0x3a, 0x25, 0x2b, 0x48, 0x04,
    0x47, 0x49, 0x14, 0x1c, 0x35, 0x3b, 0x46, 0x4a, 0x24, 0x2c, 0x58, 0x45,
    0x4b, 0x34, 0x3c, 0x03, 0x57, 0x59, 0x13, 0x1d, 0x56, 0x5a, 0x23, 0x2d,
    0x44, 0x4c, 0x55, 0x5b, 0x33, 0x3d, 0x68, 0x02, 0x67, 0x69, 0x12, 0x1e,
    0x66, 0x6a, 0x22, 0x2e, 0x54, 0x5c, 0x43, 0x4d, 0x65, 0x6b, 0x32, 0x3e,
    0x78, 0x01, 0x77, 0x79, 0x53, 0x5d, 0x11, 0x1f, 0x64, 0x6c, 0x42, 0x4e,
    0x76, 0x7a, 0x21, 0x2f, 0x75, 0x7b, 0x31, 0x3f, 0x63, 0x6d, 0x52, 0x5e,
    0x00, 0x74, 0x7c, 0x41, 0x4f, 0x10, 0x20, 0x62, 0x6e, 0x30, 0x73, 0x7d,
    0x51, 0x5f, 0x40, 0x72, 0x7e, 0x61, 0x6f, 0x50, 0x71, 0x7f, 0x60, 0x70,
];

pub(crate) const NUM_LITERAL_CODES: usize = 256;
pub(crate) const NUM_LENGTH_CODES: usize = 24;
pub(crate) const NUM_DISTANCE_CODES: usize = 40;

/// Multiplicative hash shared by encoder and decoder color caches.
pub(crate) fn color_cache_hash(argb: u32, cache_bits: u8) -> usize {
    (argb.wrapping_mul(0x1E35_A7BD) >> (32 - cache_bits as u32)) as usize
}

pub(crate) fn subsample_size(size: u16, sampling_bits: u8) -> u16 {
    (((size as u32) + (1 << sampling_bits) - 1) >> sampling_bits) as u16
}

/// Buffered little-endian bit reader over an in-memory byte stream.
///
/// Bits are consumed LSB-first within each byte; bytes in file order.
pub(crate) struct BitReader {
    data: Vec<u8>,
    pos: usize,
    buf: u64,
    nbits: u32,
}

impl BitReader {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            buf: 0,
            nbits: 0,
        }
    }

    /// Consumes the next `n` bits, `0 <= n <= 24`.
    pub(crate) fn read_bits(&mut self, n: u32) -> Result<u32, DecodingError> {
        debug_assert!(n <= 24);
        while self.nbits < n {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(DecodingError::UnexpectedEof)?;
            self.buf |= u64::from(byte) << self.nbits;
            self.pos += 1;
            self.nbits += 8;
        }
        let value = (self.buf & ((1u64 << n) - 1)) as u32;
        self.buf >>= n;
        self.nbits -= n;
        Ok(value)
    }
}

/// Decoded prefix-code tables for one Huffman group.
struct HuffmanCodeGroup {
    green: HuffmanTree,
    red: HuffmanTree,
    blue: HuffmanTree,
    alpha: HuffmanTree,
    distance: HuffmanTree,
}

/// The meta-image that selects a Huffman group per pixel tile.
struct MetaGroupIndex {
    tiles: Vec<u8>,
    tile_bits: u8,
    tiles_per_row: usize,
}

/// A fully decoded lossless frame: tightly packed R,G,B,A bytes.
pub(crate) struct LosslessFrame {
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) buf: Vec<u8>,
}

impl LosslessFrame {
    /// Copies the pixels into a caller buffer of exactly `4 * width * height`
    /// bytes.
    pub(crate) fn fill_rgba(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.buf);
    }

    pub(crate) fn into_nrgba(self) -> NrgbaImage {
        NrgbaImage::from_vec(self.buf, self.width.into(), self.height.into())
            .expect("frame buffer matches its declared dimensions")
    }
}

/// VP8L bitstream decoder over one chunk payload.
pub(crate) struct LosslessDecoder {
    r: BitReader,
    width: u16,
    height: u16,
    transforms: Vec<Transform>,
}

impl LosslessDecoder {
    pub(crate) fn new<R: Read>(mut r: R) -> Result<Self, DecodingError> {
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        Ok(Self {
            r: BitReader::new(data),
            width: 0,
            height: 0,
            transforms: Vec::new(),
        })
    }

    /// Wraps a raw VP8L stream that carries no 5-byte header of its own; the
    /// dimensions come from the surrounding container (ALPH chunks do this).
    pub(crate) fn new_headerless(data: Vec<u8>, width: u16, height: u16) -> Self {
        Self {
            r: BitReader::new(data),
            width,
            height,
            transforms: Vec::new(),
        }
    }

    pub(crate) fn bit_reader(&mut self) -> &mut BitReader {
        &mut self.r
    }

    /// Decodes the 5-byte stream header and everything after it.
    pub(crate) fn decode_frame(&mut self) -> Result<LosslessFrame, DecodingError> {
        let signature = self.r.read_bits(8)? as u8;
        if signature != 0x2f {
            return Err(DecodingError::InvalidVp8lHeader(signature));
        }
        self.width = self.r.read_bits(14)? as u16 + 1;
        self.height = self.r.read_bits(14)? as u16 + 1;
        let _alpha_used = self.r.read_bits(1)?;
        let version = self.r.read_bits(3)? as u8;
        if version != 0 {
            return Err(DecodingError::InvalidVp8lVersion(version));
        }
        self.decode_body()
    }

    /// Decodes a headerless stream whose dimensions were supplied up front.
    pub(crate) fn decode_headerless_frame(&mut self) -> Result<LosslessFrame, DecodingError> {
        self.decode_body()
    }

    fn decode_body(&mut self) -> Result<LosslessFrame, DecodingError> {
        let (width, height) = (self.width, self.height);

        let mut transformed_width = width;
        while self.r.read_bits(1)? == 1 {
            if self.transforms.len() == 4 {
                return Err(DecodingError::InvalidTransformType);
            }
            let transform = self.read_transform(transformed_width, height)?;
            transformed_width = transform.output_width(transformed_width);
            self.transforms.push(transform);
        }

        let mut buf = self.decode_image_stream(transformed_width, height, true)?;
        for i in (0..self.transforms.len()).rev() {
            let transform = std::mem::replace(&mut self.transforms[i], Transform::SubtractGreen);
            buf = transform.apply_inverse(buf, height)?;
        }
        self.transforms.clear();

        Ok(LosslessFrame { width, height, buf })
    }

    fn read_transform(&mut self, width: u16, height: u16) -> Result<Transform, DecodingError> {
        match self.r.read_bits(2)? {
            0 => {
                let size_bits = self.r.read_bits(3)? as u8 + 2;
                let block_width = subsample_size(width, size_bits);
                let block_height = subsample_size(height, size_bits);
                let meta = self.decode_image_stream(block_width, block_height, false)?;
                log::debug!("predictor transform, tile bits {size_bits}");
                Ok(Transform::Predictor {
                    size_bits,
                    meta,
                    width,
                })
            }
            1 => {
                let size_bits = self.r.read_bits(3)? as u8 + 2;
                let block_width = subsample_size(width, size_bits);
                let block_height = subsample_size(height, size_bits);
                let meta = self.decode_image_stream(block_width, block_height, false)?;
                log::debug!("cross-color transform, tile bits {size_bits}");
                Ok(Transform::CrossColor {
                    size_bits,
                    meta,
                    width,
                })
            }
            2 => Ok(Transform::SubtractGreen),
            3 => {
                let num_colors = self.r.read_bits(8)? as u16 + 1;
                let mut palette = self.decode_image_stream(num_colors, 1, false)?;
                // The palette is stored delta-encoded.
                for i in 4..palette.len() {
                    palette[i] = palette[i].wrapping_add(palette[i - 4]);
                }
                log::debug!("color-indexing transform, {num_colors} colors");
                Ok(Transform::ColorIndexing {
                    num_colors,
                    palette,
                    width,
                })
            }
            _ => unreachable!("2-bit transform type"),
        }
    }

    /// The shared image-stream decoder. Transform metadata and the main pixel
    /// pass both land here; only the top level may carry a meta-Huffman image.
    fn decode_image_stream(
        &mut self,
        width: u16,
        height: u16,
        is_top_level: bool,
    ) -> Result<Vec<u8>, DecodingError> {
        let cache_bits = if self.r.read_bits(1)? == 1 {
            let bits = self.r.read_bits(4)? as u8;
            if bits == 0 || bits > 11 {
                return Err(DecodingError::InvalidColorCacheParameters(bits));
            }
            bits
        } else {
            0
        };

        let meta = if is_top_level && self.r.read_bits(1)? == 1 {
            let tile_bits = self.r.read_bits(3)? as u8 + 2;
            let block_width = subsample_size(width, tile_bits);
            let block_height = subsample_size(height, tile_bits);
            let tiles = self.decode_image_stream(block_width, block_height, false)?;
            Some(MetaGroupIndex {
                tiles,
                tile_bits,
                tiles_per_row: block_width as usize,
            })
        } else {
            None
        };

        let num_groups = match &meta {
            Some(meta) => {
                let max_index = meta
                    .tiles
                    .chunks_exact(4)
                    .map(|px| (usize::from(px[0]) << 8) | usize::from(px[1]))
                    .max()
                    .unwrap_or(0);
                max_index + 1
            }
            None => 1,
        };

        let cache_size = if cache_bits > 0 { 1usize << cache_bits } else { 0 };
        let mut groups = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            groups.push(self.read_huffman_group(cache_size)?);
        }

        self.decode_pixels(width, height, cache_bits, &groups, meta.as_ref())
    }

    fn read_huffman_group(&mut self, cache_size: usize) -> Result<HuffmanCodeGroup, DecodingError> {
        Ok(HuffmanCodeGroup {
            green: self.read_huffman_code(NUM_LITERAL_CODES + NUM_LENGTH_CODES + cache_size)?,
            red: self.read_huffman_code(NUM_LITERAL_CODES)?,
            blue: self.read_huffman_code(NUM_LITERAL_CODES)?,
            alpha: self.read_huffman_code(NUM_LITERAL_CODES)?,
            distance: self.read_huffman_code(NUM_DISTANCE_CODES)?,
        })
    }

    /// Reads one serialized prefix code: either the 1/2-symbol "simple" form
    /// or the meta-Huffman "full" form with optional RLE of code lengths.
    pub(crate) fn read_huffman_code(
        &mut self,
        alphabet_size: usize,
    ) -> Result<HuffmanTree, DecodingError> {
        if self.r.read_bits(1)? == 1 {
            // Simple form.
            let num_symbols = self.r.read_bits(1)? + 1;
            let is_8bit = self.r.read_bits(1)? == 1;
            let symbol0 = if is_8bit {
                self.r.read_bits(8)? as u16
            } else {
                self.r.read_bits(1)? as u16
            };
            if usize::from(symbol0) >= alphabet_size {
                return Err(DecodingError::InvalidHuffmanTree);
            }
            if num_symbols == 1 {
                return Ok(HuffmanTree::build_single(symbol0));
            }
            let symbol1 = self.r.read_bits(8)? as u16;
            if usize::from(symbol1) >= alphabet_size || symbol1 == symbol0 {
                return Err(DecodingError::InvalidHuffmanTree);
            }
            return HuffmanTree::build_pair(symbol0, symbol1);
        }

        // Full form: a prefix code over the 19 code-length symbols first.
        let num_code_lengths = 4 + self.r.read_bits(4)? as usize;
        let mut code_length_lengths = [0u16; 19];
        for &position in CODE_LENGTH_CODE_ORDER.iter().take(num_code_lengths) {
            code_length_lengths[position] = self.r.read_bits(3)? as u16;
        }
        let code_length_tree = HuffmanTree::build_explicit(&code_length_lengths)?;

        let mut max_symbol = if self.r.read_bits(1)? == 1 {
            let length_nbits = 2 + 2 * self.r.read_bits(3)?;
            2 + self.r.read_bits(length_nbits)? as usize
        } else {
            alphabet_size
        };
        if max_symbol > alphabet_size {
            return Err(DecodingError::InvalidHuffmanTree);
        }

        let mut code_lengths = vec![0u16; alphabet_size];
        let mut prev_code_length = 8u16;
        let mut symbol = 0;
        while symbol < alphabet_size {
            if max_symbol == 0 {
                break;
            }
            max_symbol -= 1;
            let code_length = code_length_tree.read_symbol(&mut self.r)?;
            match code_length {
                0..=15 => {
                    code_lengths[symbol] = code_length;
                    symbol += 1;
                    if code_length != 0 {
                        prev_code_length = code_length;
                    }
                }
                16 | 17 | 18 => {
                    let (use_prev, extra_bits, offset) = match code_length {
                        16 => (true, 2, 3),
                        17 => (false, 3, 3),
                        _ => (false, 7, 11),
                    };
                    let repeat = self.r.read_bits(extra_bits)? as usize + offset;
                    if symbol + repeat > alphabet_size {
                        return Err(DecodingError::InvalidHuffmanTree);
                    }
                    let length = if use_prev { prev_code_length } else { 0 };
                    for _ in 0..repeat {
                        code_lengths[symbol] = length;
                        symbol += 1;
                    }
                }
                _ => return Err(DecodingError::InvalidHuffmanTree),
            }
        }

        HuffmanTree::build_explicit(&code_lengths)
    }

    /// Reads the extra bits of a prefix-coded length or distance symbol and
    /// returns the decoded value (always >= 1).
    fn read_prefix_value(&mut self, symbol: u32) -> Result<u32, DecodingError> {
        if symbol < 4 {
            return Ok(symbol + 1);
        }
        let extra_bits = (symbol - 2) >> 1;
        let offset = (2 + (symbol & 1)) << extra_bits;
        Ok(offset + self.r.read_bits(extra_bits)? + 1)
    }

    fn decode_pixels(
        &mut self,
        width: u16,
        height: u16,
        cache_bits: u8,
        groups: &[HuffmanCodeGroup],
        meta: Option<&MetaGroupIndex>,
    ) -> Result<Vec<u8>, DecodingError> {
        let width = width as usize;
        let num_pixels = width * height as usize;
        let buf_len = num_pixels
            .checked_mul(4)
            .ok_or(DecodingError::PixelBufferOverflow)?;
        let mut buf = vec![0u8; buf_len];

        let cache_size = if cache_bits > 0 { 1usize << cache_bits } else { 0 };
        let mut cache = vec![0u32; cache_size];
        // Pixels are inserted into the cache lazily, right before a lookup.
        let mut cache_pixels_inserted = 0usize;

        let mut p = 0usize;
        while p < num_pixels {
            let group = match meta {
                Some(meta) => {
                    let x = p % width;
                    let y = p / width;
                    let tile =
                        (y >> meta.tile_bits) * meta.tiles_per_row + (x >> meta.tile_bits);
                    let index = (usize::from(meta.tiles[4 * tile]) << 8)
                        | usize::from(meta.tiles[4 * tile + 1]);
                    &groups[index]
                }
                None => &groups[0],
            };

            let code = usize::from(group.green.read_symbol(&mut self.r)?);
            if code < NUM_LITERAL_CODES {
                let green = code as u8;
                let red = group.red.read_symbol(&mut self.r)? as u8;
                let blue = group.blue.read_symbol(&mut self.r)? as u8;
                let alpha = group.alpha.read_symbol(&mut self.r)? as u8;
                buf[4 * p..4 * p + 4].copy_from_slice(&[red, green, blue, alpha]);
                p += 1;
            } else if code < NUM_LITERAL_CODES + NUM_LENGTH_CODES {
                let length =
                    self.read_prefix_value((code - NUM_LITERAL_CODES) as u32)? as usize;
                let distance_symbol = group.distance.read_symbol(&mut self.r)?;
                let distance_code = self.read_prefix_value(u32::from(distance_symbol))?;
                let distance = plane_code_to_distance(distance_code, width) as usize;

                if distance > p || p + length > num_pixels {
                    return Err(DecodingError::InvalidLz77Parameters);
                }
                // Byte-by-byte so overlapping runs (distance 1) replicate.
                let (mut src, mut dst) = (4 * (p - distance), 4 * p);
                for _ in 0..4 * length {
                    buf[dst] = buf[src];
                    src += 1;
                    dst += 1;
                }
                p += length;
            } else {
                let index = code - NUM_LITERAL_CODES - NUM_LENGTH_CODES;
                while cache_pixels_inserted < p {
                    let argb = pack_argb(&buf[4 * cache_pixels_inserted..]);
                    cache[color_cache_hash(argb, cache_bits)] = argb;
                    cache_pixels_inserted += 1;
                }
                let argb = *cache
                    .get(index)
                    .ok_or(DecodingError::InvalidColorCacheIndex)?;
                buf[4 * p..4 * p + 4].copy_from_slice(&unpack_argb(argb));
                p += 1;
            }
        }

        Ok(buf)
    }
}

/// Maps a decoded distance code to a pixel offset: small codes go through the
/// 120-entry neighborhood map, larger codes are linear.
pub(crate) fn plane_code_to_distance(distance_code: u32, width: usize) -> u32 {
    if distance_code > 120 {
        return distance_code - 120;
    }
    let packed = u32::from(DIST_MAP[(distance_code - 1) as usize]);
    let y_off = (packed >> 4) as i32;
    let x_off = 8 - (packed & 0xf) as i32;
    let distance = y_off * width as i32 + x_off;
    distance.max(1) as u32
}

pub(crate) fn pack_argb(px: &[u8]) -> u32 {
    (u32::from(px[3]) << 24) | (u32::from(px[0]) << 16) | (u32::from(px[1]) << 8) | u32::from(px[2])
}

pub(crate) fn unpack_argb(argb: u32) -> [u8; 4] {
    [
        (argb >> 16) as u8,
        (argb >> 8) as u8,
        argb as u8,
        (argb >> 24) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_reader_is_lsb_first() {
        let mut r = BitReader::new(vec![0b1010_0110, 0b0000_0001]);
        assert_eq!(r.read_bits(3).unwrap(), 0b110);
        assert_eq!(r.read_bits(5).unwrap(), 0b10100);
        assert_eq!(r.read_bits(8).unwrap(), 1);
        assert!(matches!(
            r.read_bits(1),
            Err(DecodingError::UnexpectedEof)
        ));
    }

    #[test]
    fn bit_reader_spans_byte_boundaries() {
        let mut r = BitReader::new(vec![0xff, 0x00, 0xff]);
        assert_eq!(r.read_bits(4).unwrap(), 0xf);
        assert_eq!(r.read_bits(12).unwrap(), 0x00f);
        assert_eq!(r.read_bits(8).unwrap(), 0xff);
    }

    #[test]
    fn subsample_rounds_up() {
        assert_eq!(subsample_size(16, 2), 4);
        assert_eq!(subsample_size(17, 2), 5);
        assert_eq!(subsample_size(1, 7), 1);
    }

    #[test]
    fn prefix_values_match_symbol_table() {
        let mut d = LosslessDecoder::new_headerless(vec![0b0000_0001], 1, 1);
        // Symbols 0..=3 carry no extra bits.
        assert_eq!(d.read_prefix_value(0).unwrap(), 1);
        assert_eq!(d.read_prefix_value(3).unwrap(), 4);
        // Symbol 4: one extra bit (reads 1), offset 4 -> value 6.
        assert_eq!(d.read_prefix_value(4).unwrap(), 6);
        // Symbol 6: two extra bits (reads 0), offset 8 -> value 9.
        assert_eq!(d.read_prefix_value(6).unwrap(), 9);
    }

    #[test]
    fn distance_map_resolves_neighborhood() {
        // Code 1 -> (x=0, y=1): one row up.
        assert_eq!(plane_code_to_distance(1, 10), 10);
        // Code 2 -> (x=1, y=0): previous pixel.
        assert_eq!(plane_code_to_distance(2, 10), 1);
        // Code 4 -> (x=-1, y=1).
        assert_eq!(plane_code_to_distance(4, 10), 11);
        // Codes past the table are linear, shifted by its length.
        assert_eq!(plane_code_to_distance(121, 10), 1);
        assert_eq!(plane_code_to_distance(200, 10), 80);
        // Results are clamped to at least one pixel.
        assert_eq!(plane_code_to_distance(2, 1), 1);
    }

    #[test]
    fn color_cache_hash_stays_in_range() {
        for bits in 1..=11u8 {
            for argb in [0u32, 1, 0xdead_beef, u32::MAX, 0x8000_0001] {
                assert!(color_cache_hash(argb, bits) < (1 << bits));
            }
        }
    }

    #[test]
    fn argb_pack_unpack_round_trip() {
        let px = [1u8, 2, 3, 4];
        assert_eq!(unpack_argb(pack_argb(&px)), px);
        assert_eq!(pack_argb(&[0xaa, 0xbb, 0xcc, 0xdd]), 0xddaa_bbcc);
    }

    #[test]
    fn rejects_bad_signature_and_version() {
        let mut d = LosslessDecoder::new(&[0x30u8, 0, 0, 0, 0][..]).unwrap();
        assert!(matches!(
            d.decode_frame(),
            Err(DecodingError::InvalidVp8lHeader(0x30))
        ));

        // Valid signature but version bits set.
        let mut d = LosslessDecoder::new(&[0x2f, 0x00, 0x00, 0x00, 0x20u8][..]).unwrap();
        assert!(matches!(
            d.decode_frame(),
            Err(DecodingError::InvalidVp8lVersion(1))
        ));
    }

    #[test]
    fn decodes_reference_single_pixel_stream() {
        // Reference VP8L payload for a single (255, 0, 0, 128) pixel: a
        // one-color palette whose streams consist entirely of single-symbol
        // prefix codes.
        let payload = vec![
            47, 0, 0, 0, 16, 7, 16, 253, 143, 2, 6, 34, 162, 255, 1, 0,
        ];
        let mut d = LosslessDecoder::new(&payload[..]).unwrap();
        let frame = d.decode_frame().unwrap();
        assert_eq!((frame.width, frame.height), (1, 1));
        assert_eq!(frame.buf, vec![255, 0, 0, 128]);
    }

    fn zero_bit_group(green: HuffmanTree) -> HuffmanCodeGroup {
        HuffmanCodeGroup {
            green,
            red: HuffmanTree::build_single(0),
            blue: HuffmanTree::build_single(0),
            alpha: HuffmanTree::build_single(0),
            distance: HuffmanTree::build_single(0),
        }
    }

    #[test]
    fn out_of_range_cache_index_is_rejected() {
        // Green symbol 283 is cache slot 3, but cc_bits = 1 only has two.
        let groups = [zero_bit_group(HuffmanTree::build_pair(0, 283).unwrap())];
        let mut d = LosslessDecoder::new_headerless(vec![0b0000_0010], 2, 1);
        let err = d.decode_pixels(2, 1, 1, &groups, None).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidColorCacheIndex));
    }

    #[test]
    fn over_long_backward_reference_is_rejected() {
        // Literal, then a copy of length 4 into a 2-pixel image.
        let groups = [zero_bit_group(HuffmanTree::build_pair(0, 259).unwrap())];
        let mut d = LosslessDecoder::new_headerless(vec![0b0000_0010], 2, 1);
        let err = d.decode_pixels(2, 1, 0, &groups, None).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidLz77Parameters));
    }

    #[test]
    fn backward_reference_before_start_is_rejected() {
        // Length-1 copy whose distance resolves past the first pixel.
        let groups = [HuffmanCodeGroup {
            green: HuffmanTree::build_pair(0, 256).unwrap(),
            red: HuffmanTree::build_single(0),
            blue: HuffmanTree::build_single(0),
            alpha: HuffmanTree::build_single(0),
            distance: HuffmanTree::build_single(4),
        }];
        // Bits: green 0 (literal), green 1 (copy), distance extra bit 0.
        let mut d = LosslessDecoder::new_headerless(vec![0b0000_0010], 2, 1);
        let err = d.decode_pixels(2, 1, 0, &groups, None).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidLz77Parameters));
    }

    #[test]
    fn rle_run_replicates_a_seed_pixel() {
        // Literal, then distance-1 copies across the rest of the row.
        let groups = [HuffmanCodeGroup {
            green: HuffmanTree::build_pair(0, 260).unwrap(),
            red: HuffmanTree::build_single(7),
            blue: HuffmanTree::build_single(9),
            alpha: HuffmanTree::build_single(0xff),
            distance: HuffmanTree::build_single(1),
        }];
        // green 0 (literal), green 1 -> symbol 260: length symbol 4, one
        // extra bit (0) -> length 5; distance symbol 1 -> distance code 2,
        // which maps to the previous pixel.
        let mut d = LosslessDecoder::new_headerless(vec![0b0000_0010], 6, 1);
        let buf = d.decode_pixels(6, 1, 0, &groups, None).unwrap();
        assert_eq!(buf.len(), 24);
        for px in buf.chunks_exact(4) {
            assert_eq!(px, [7, 0, 9, 0xff]);
        }
    }

    #[test]
    fn invalid_color_cache_bits_are_rejected() {
        // Header for a 1x1 image followed by: no transforms (1 bit = 0),
        // use_color_cache = 1, cc_bits = 12 (invalid).
        // Bits after the 5 header bytes: 0, 1, then 12 LSB-first (0,0,1,1),
        // packed as 0b0011_0010.
        let payload = vec![0x2f, 0x00, 0x00, 0x00, 0x00, 0x32];
        let mut d = LosslessDecoder::new(&payload[..]).unwrap();
        assert!(matches!(
            d.decode_frame(),
            Err(DecodingError::InvalidColorCacheParameters(12))
        ));
    }
}
