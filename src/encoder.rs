//! Encoding of WebP lossless images.
//!
//! The encoder mirrors the decoder layer by layer: a transform pass rewrites
//! the pixels, a tokenizer turns them into literals, backward references and
//! color-cache hits, canonical prefix codes are built per alphabet, and a
//! little-endian bit writer packs everything into a `VP8L` chunk inside a
//! `RIFF/WEBP` container.

use std::collections::{BinaryHeap, HashMap};
use std::io::{self, Write};

use thiserror::Error;

use crate::extended;
use crate::lossless::{
    color_cache_hash, pack_argb, plane_code_to_distance, subsample_size, CODE_LENGTH_CODE_ORDER,
    NUM_DISTANCE_CODES, NUM_LENGTH_CODES, NUM_LITERAL_CODES,
};
use crate::nrgba::NrgbaImage;
use crate::riff::{self, WebPRiffChunk};
use crate::transform;

/// Tile granularity used for the predictor transform.
const PREDICTOR_TILE_BITS: u8 = 4;
/// Color cache size (log2) for the main entropy pass of non-palette images.
const COLOR_CACHE_BITS: u8 = 10;

const MAX_HUFFMAN_DEPTH: u8 = 15;
const CODE_LENGTH_MAX_DEPTH: u8 = 7;

/// Errors that can occur when encoding a WebP image
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EncodingError {
    /// An IO error occurred while writing the output
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),

    /// A value was wider than its declared bit count
    #[error("Value does not fit in {0} bits")]
    InvalidBitCount(u8),

    /// The palette transform was asked to index more than 256 colors
    #[error("Image has more than 256 unique colors")]
    PaletteExceeds256Colors,

    /// Width or height outside 1..=16384
    #[error("Image dimensions out of range")]
    DimensionsOutOfRange,
}

/// One canonical prefix code: `depth` bits, emitted bit-reversed. Depth 0
/// means the symbol is unused; depth -1 marks the lone symbol of a
/// single-symbol alphabet, which costs zero bits on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HuffmanCode {
    pub(crate) bits: u16,
    pub(crate) depth: i8,
}

/// Little-endian bit writer. Bits accumulate LSB-first and whole bytes are
/// flushed eagerly, so at most 7 bits are ever pending.
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    buffer: u64,
    nbits: u8,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self {
            bytes: Vec::new(),
            buffer: 0,
            nbits: 0,
        }
    }

    pub(crate) fn write_bits(&mut self, bits: u64, nbits: u8) -> Result<(), EncodingError> {
        if nbits > 64 || (nbits < 64 && bits >= 1u64 << nbits) {
            return Err(EncodingError::InvalidBitCount(nbits));
        }
        if nbits > 32 {
            self.write_bits(bits & 0xffff_ffff, 32)?;
            return self.write_bits(bits >> 32, nbits - 32);
        }
        self.buffer |= bits << self.nbits;
        self.nbits += nbits;
        while self.nbits >= 8 {
            self.bytes.push(self.buffer as u8);
            self.buffer >>= 8;
            self.nbits -= 8;
        }
        Ok(())
    }

    /// Emits `code.depth` bits of the bit-reversed code pattern. Unused and
    /// single-symbol codes cost nothing.
    pub(crate) fn write_code(&mut self, code: HuffmanCode) -> Result<(), EncodingError> {
        if code.depth <= 0 {
            return Ok(());
        }
        let depth = code.depth as u8;
        let reversed = code.bits.reverse_bits() >> (16 - u32::from(depth));
        self.write_bits(u64::from(reversed), depth)
    }

    /// Pads the pending bits with zeros up to the next byte boundary.
    pub(crate) fn align_byte(&mut self) {
        if self.nbits > 0 {
            self.bytes.push(self.buffer as u8);
            self.buffer = 0;
            self.nbits = 0;
        }
    }

    pub(crate) fn into_bytes(mut self) -> Vec<u8> {
        self.align_byte();
        self.bytes
    }
}

/// Builds length-limited canonical prefix codes from a histogram.
pub(crate) fn build_huffman_codes(histogram: &[u32], max_depth: u8) -> Vec<HuffmanCode> {
    let mut codes = vec![HuffmanCode::default(); histogram.len()];
    let used: Vec<usize> = (0..histogram.len()).filter(|&s| histogram[s] > 0).collect();
    match used.len() {
        0 => codes,
        1 => {
            codes[used[0]].depth = -1;
            codes
        }
        _ => {
            let depths = build_depths(histogram, &used, max_depth);
            assign_canonical(&mut codes, &used, &depths);
            codes
        }
    }
}

/// Conventional Huffman merge with a floor on leaf weights, followed by an
/// iterative depth-limiting pass. The result always satisfies the Kraft
/// inequality for `max_depth`.
fn build_depths(histogram: &[u32], used: &[usize], max_depth: u8) -> Vec<u8> {
    struct Node {
        weight: u64,
        children: Option<(usize, usize)>,
        leaf: Option<usize>,
    }

    let total: u64 = used.iter().map(|&s| u64::from(histogram[s])).sum();
    let min_weight = (total >> (max_depth - 2)).max(1);

    let mut nodes: Vec<Node> = used
        .iter()
        .enumerate()
        .map(|(i, &s)| Node {
            weight: u64::from(histogram[s]).max(min_weight),
            children: None,
            leaf: Some(i),
        })
        .collect();

    let mut heap: BinaryHeap<std::cmp::Reverse<(u64, usize)>> = (0..nodes.len())
        .map(|i| std::cmp::Reverse((nodes[i].weight, i)))
        .collect();
    while heap.len() > 1 {
        let std::cmp::Reverse((wa, a)) = heap.pop().expect("heap len checked");
        let std::cmp::Reverse((wb, b)) = heap.pop().expect("heap len checked");
        let merged = nodes.len();
        nodes.push(Node {
            weight: wa + wb,
            children: Some((a, b)),
            leaf: None,
        });
        heap.push(std::cmp::Reverse((wa + wb, merged)));
    }
    let std::cmp::Reverse((_, root)) = heap.pop().expect("at least two leaves");

    let mut depths = vec![0u8; used.len()];
    let mut stack = vec![(root, 0u8)];
    while let Some((node, depth)) = stack.pop() {
        match (nodes[node].children, nodes[node].leaf) {
            (Some((a, b)), _) => {
                stack.push((a, depth.saturating_add(1)));
                stack.push((b, depth.saturating_add(1)));
            }
            (None, Some(leaf)) => depths[leaf] = depth.max(1),
            _ => unreachable!("node is a branch or a leaf"),
        }
    }

    for depth in depths.iter_mut() {
        if *depth > max_depth {
            *depth = max_depth;
        }
    }
    // Capping can oversubscribe the code space; push the rarest symbols
    // deeper until the Kraft sum fits again.
    let mut kraft: u64 = depths.iter().map(|&d| 1u64 << (max_depth - d)).sum();
    while kraft > 1u64 << max_depth {
        let deepen = (0..used.len())
            .filter(|&i| depths[i] < max_depth)
            .min_by_key(|&i| (histogram[used[i]], std::cmp::Reverse(depths[i])))
            .expect("kraft sum exceeds capacity only while a symbol is shallow");
        kraft -= 1u64 << (max_depth - depths[deepen] - 1);
        depths[deepen] += 1;
    }

    depths
}

/// Canonical rule: sort `(depth, symbol)` ascending, pad the running code
/// with zeros on every depth increase.
fn assign_canonical(codes: &mut [HuffmanCode], used: &[usize], depths: &[u8]) {
    let mut order: Vec<(u8, usize)> = depths.iter().copied().zip(used.iter().copied()).collect();
    order.sort_unstable();

    let mut code = 0u16;
    let mut prev_depth = 0u8;
    for (depth, symbol) in order {
        code <<= depth - prev_depth;
        codes[symbol] = HuffmanCode {
            bits: code,
            depth: depth as i8,
        };
        code += 1;
        prev_depth = depth;
    }
}

/// Serializes one prefix code table (§ simple or full form).
pub(crate) fn write_huffman_tree(
    w: &mut BitWriter,
    codes: &[HuffmanCode],
) -> Result<(), EncodingError> {
    let used: Vec<usize> = (0..codes.len()).filter(|&s| codes[s].depth != 0).collect();

    if used.is_empty() {
        // The alphabet never occurs; emit the cheapest legal code.
        w.write_bits(1, 1)?; // simple
        w.write_bits(0, 1)?; // one symbol
        w.write_bits(0, 1)?; // 1-bit symbol
        w.write_bits(0, 1)?; // symbol zero
        return Ok(());
    }

    if used.len() <= 2 && used.iter().all(|&s| s < 256) {
        w.write_bits(1, 1)?;
        w.write_bits(used.len() as u64 - 1, 1)?;
        let first = used[0] as u64;
        if first <= 1 {
            w.write_bits(0, 1)?;
            w.write_bits(first, 1)?;
        } else {
            w.write_bits(1, 1)?;
            w.write_bits(first, 8)?;
        }
        if used.len() == 2 {
            w.write_bits(used[1] as u64, 8)?;
        }
        return Ok(());
    }
    debug_assert!(codes.iter().all(|c| c.depth >= 0), "simple form covers -1");

    // Full form: the code lengths themselves are prefix coded, with runs of
    // zero lengths folded into the 17/18 repeat operators.
    let tokens = code_length_tokens(codes);

    w.write_bits(0, 1)?;
    let mut depth_histogram = [0u32; 19];
    for &(symbol, _, _) in &tokens {
        depth_histogram[usize::from(symbol)] += 1;
    }
    let meta = build_huffman_codes(&depth_histogram, CODE_LENGTH_MAX_DEPTH);

    let mut num_code_lengths = CODE_LENGTH_CODE_ORDER.len();
    while num_code_lengths > 4 && meta[CODE_LENGTH_CODE_ORDER[num_code_lengths - 1]].depth == 0 {
        num_code_lengths -= 1;
    }
    w.write_bits(num_code_lengths as u64 - 4, 4)?;
    for &symbol in CODE_LENGTH_CODE_ORDER.iter().take(num_code_lengths) {
        // A single-symbol meta code is flagged with any non-zero length.
        let depth = meta[symbol].depth;
        w.write_bits(if depth < 0 { 1 } else { depth as u64 }, 3)?;
    }
    w.write_bits(0, 1)?; // cover the whole alphabet

    for &(symbol, extra_bits, extra) in &tokens {
        w.write_code(meta[usize::from(symbol)])?;
        w.write_bits(u64::from(extra), extra_bits)?;
    }
    Ok(())
}

/// Flattens per-symbol depths into code-length symbols, emitting zero runs
/// as repeat operators: 17 covers 3..=10 zeros, 18 covers 11..=138.
fn code_length_tokens(codes: &[HuffmanCode]) -> Vec<(u8, u8, u8)> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < codes.len() {
        let depth = codes[i].depth as u8;
        if depth != 0 {
            tokens.push((depth, 0, 0));
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < codes.len() && codes[i + run].depth == 0 {
            run += 1;
        }
        i += run;
        while run >= 11 {
            let n = run.min(138);
            tokens.push((18, 7, (n - 11) as u8));
            run -= n;
        }
        while run >= 3 {
            let n = run.min(10);
            tokens.push((17, 3, (n - 3) as u8));
            run -= n;
        }
        for _ in 0..run {
            tokens.push((0, 0, 0));
        }
    }
    tokens
}

/// Splits a length or distance value into its prefix symbol and extra bits.
pub(crate) fn prefix_encode(value: u32) -> (u16, u8, u32) {
    debug_assert!(value >= 1);
    let d = value - 1;
    if d < 4 {
        return (d as u16, 0, 0);
    }
    let high_bit = 31 - d.leading_zeros();
    let extra_bits = (high_bit - 1) as u8;
    let second_bit = (d >> extra_bits) & 1;
    let symbol = (2 * high_bit + second_bit) as u16;
    (symbol, extra_bits, d & ((1 << extra_bits) - 1))
}

/// Smallest distance code for each offset the neighborhood map can express.
fn build_distance_code_map(width: usize) -> HashMap<u32, u32> {
    let mut map = HashMap::new();
    for code in 1..=120u32 {
        map.entry(plane_code_to_distance(code, width)).or_insert(code);
    }
    map
}

enum Token {
    /// r, g, b, a channel bytes.
    Literal([u8; 4]),
    Cache(u16),
    Copy { length: u32, distance_code: u32 },
}

const HASH_BUCKETS: usize = 1 << 14;
const LZ77_WINDOW: usize = (1 << 20) - 120;
const LZ77_MAX_LENGTH: usize = 4096;
const LZ77_MIN_LENGTH: usize = 3;
const LZ77_MAX_CHAIN: usize = 8;

fn hash3(pixels: &[u32], i: usize) -> usize {
    let h = (u64::from(pixels[i]) << 32)
        ^ (u64::from(pixels[i + 1]) << 16)
        ^ u64::from(pixels[i + 2]);
    (h.wrapping_mul(0x9E37_79B1_85EB_CA87) >> (64 - 14)) as usize
}

/// Walks the pixels row-major, producing literals, backward references found
/// through a hash chain over pixel triples, and color-cache hits. The cache
/// is updated for every pixel passed, matching the decoder's insertion order.
fn tokenize(buf: &[u8], width: usize, cache_bits: u8) -> Vec<Token> {
    let pixels: Vec<u32> = buf.chunks_exact(4).map(pack_argb).collect();
    let n = pixels.len();
    let distance_codes = build_distance_code_map(width);

    let mut head = vec![usize::MAX; HASH_BUCKETS];
    let mut prev = vec![usize::MAX; n];

    let cache_size = if cache_bits > 0 { 1usize << cache_bits } else { 0 };
    let mut cache = vec![0u32; cache_size];

    let mut tokens = Vec::new();
    let mut i = 0;
    while i < n {
        let mut best_length = 0;
        let mut best_distance = 0;
        if i + 2 < n {
            let mut j = head[hash3(&pixels, i)];
            let mut chain = 0;
            while j != usize::MAX && chain < LZ77_MAX_CHAIN {
                if i - j > LZ77_WINDOW {
                    break; // chain entries only get older
                }
                let max_length = LZ77_MAX_LENGTH.min(n - i);
                let mut length = 0;
                while length < max_length && pixels[j + length] == pixels[i + length] {
                    length += 1;
                }
                if length > best_length {
                    best_length = length;
                    best_distance = i - j;
                }
                j = prev[j];
                chain += 1;
            }
        }

        if best_length >= LZ77_MIN_LENGTH {
            let distance_code = match distance_codes.get(&(best_distance as u32)) {
                Some(&code) => code,
                None => best_distance as u32 + 120,
            };
            tokens.push(Token::Copy {
                length: best_length as u32,
                distance_code,
            });
            for k in i..i + best_length {
                if cache_bits > 0 {
                    cache[color_cache_hash(pixels[k], cache_bits)] = pixels[k];
                }
                if k + 2 < n {
                    let h = hash3(&pixels, k);
                    prev[k] = head[h];
                    head[h] = k;
                }
            }
            i += best_length;
        } else {
            let px = pixels[i];
            if cache_bits > 0 && cache[color_cache_hash(px, cache_bits)] == px {
                tokens.push(Token::Cache(color_cache_hash(px, cache_bits) as u16));
            } else {
                if cache_bits > 0 {
                    cache[color_cache_hash(px, cache_bits)] = px;
                }
                tokens.push(Token::Literal([
                    buf[4 * i],
                    buf[4 * i + 1],
                    buf[4 * i + 2],
                    buf[4 * i + 3],
                ]));
            }
            if i + 2 < n {
                let h = hash3(&pixels, i);
                prev[i] = head[h];
                head[h] = i;
            }
            i += 1;
        }
    }
    tokens
}

/// Entropy-codes one image stream: cache parameters, prefix-code tables for
/// the five alphabets, then the token stream.
fn encode_image_stream(
    w: &mut BitWriter,
    buf: &[u8],
    width: usize,
    height: usize,
    is_top_level: bool,
    cache_bits: u8,
) -> Result<(), EncodingError> {
    debug_assert_eq!(buf.len(), 4 * width * height);

    if cache_bits > 0 {
        w.write_bits(1, 1)?;
        w.write_bits(u64::from(cache_bits), 4)?;
    } else {
        w.write_bits(0, 1)?;
    }
    if is_top_level {
        // A single Huffman group; no meta-image.
        w.write_bits(0, 1)?;
    }

    let tokens = tokenize(buf, width, cache_bits);

    let cache_size = if cache_bits > 0 { 1usize << cache_bits } else { 0 };
    let mut green_histogram = vec![0u32; NUM_LITERAL_CODES + NUM_LENGTH_CODES + cache_size];
    let mut red_histogram = vec![0u32; NUM_LITERAL_CODES];
    let mut blue_histogram = vec![0u32; NUM_LITERAL_CODES];
    let mut alpha_histogram = vec![0u32; NUM_LITERAL_CODES];
    let mut distance_histogram = vec![0u32; NUM_DISTANCE_CODES];

    for token in &tokens {
        match token {
            Token::Literal([r, g, b, a]) => {
                green_histogram[usize::from(*g)] += 1;
                red_histogram[usize::from(*r)] += 1;
                blue_histogram[usize::from(*b)] += 1;
                alpha_histogram[usize::from(*a)] += 1;
            }
            Token::Cache(index) => {
                green_histogram[NUM_LITERAL_CODES + NUM_LENGTH_CODES + usize::from(*index)] += 1;
            }
            Token::Copy {
                length,
                distance_code,
            } => {
                green_histogram[NUM_LITERAL_CODES + usize::from(prefix_encode(*length).0)] += 1;
                distance_histogram[usize::from(prefix_encode(*distance_code).0)] += 1;
            }
        }
    }

    let green_codes = build_huffman_codes(&green_histogram, MAX_HUFFMAN_DEPTH);
    let red_codes = build_huffman_codes(&red_histogram, MAX_HUFFMAN_DEPTH);
    let blue_codes = build_huffman_codes(&blue_histogram, MAX_HUFFMAN_DEPTH);
    let alpha_codes = build_huffman_codes(&alpha_histogram, MAX_HUFFMAN_DEPTH);
    let distance_codes = build_huffman_codes(&distance_histogram, MAX_HUFFMAN_DEPTH);

    write_huffman_tree(w, &green_codes)?;
    write_huffman_tree(w, &red_codes)?;
    write_huffman_tree(w, &blue_codes)?;
    write_huffman_tree(w, &alpha_codes)?;
    write_huffman_tree(w, &distance_codes)?;

    for token in &tokens {
        match token {
            Token::Literal([r, g, b, a]) => {
                w.write_code(green_codes[usize::from(*g)])?;
                w.write_code(red_codes[usize::from(*r)])?;
                w.write_code(blue_codes[usize::from(*b)])?;
                w.write_code(alpha_codes[usize::from(*a)])?;
            }
            Token::Cache(index) => {
                w.write_code(
                    green_codes[NUM_LITERAL_CODES + NUM_LENGTH_CODES + usize::from(*index)],
                )?;
            }
            Token::Copy {
                length,
                distance_code,
            } => {
                let (symbol, extra_bits, extra) = prefix_encode(*length);
                w.write_code(green_codes[NUM_LITERAL_CODES + usize::from(symbol)])?;
                w.write_bits(u64::from(extra), extra_bits)?;
                let (symbol, extra_bits, extra) = prefix_encode(*distance_code);
                w.write_code(distance_codes[usize::from(symbol)])?;
                w.write_bits(u64::from(extra), extra_bits)?;
            }
        }
    }
    Ok(())
}

fn delta_encode_palette(palette: &[[u8; 4]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * palette.len());
    let mut prev = [0u8; 4];
    for &entry in palette {
        for c in 0..4 {
            out.push(entry[c].wrapping_sub(prev[c]));
        }
        prev = entry;
    }
    out
}

/// Options recognized by [`WebPEncoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderOptions {
    /// Emit a `VP8X` chunk ahead of `VP8L`, with the alpha flag set when the
    /// image has any non-opaque pixel.
    pub use_extended_format: bool,
}

/// WebP lossless image encoder.
pub struct WebPEncoder<W> {
    w: W,
    options: EncoderOptions,
}

impl<W: Write> WebPEncoder<W> {
    /// Create a new encoder that writes its output to `w`.
    pub fn new(w: W) -> Self {
        Self::new_with_options(w, EncoderOptions::default())
    }

    /// Create a new encoder with explicit options.
    pub fn new_with_options(w: W, options: EncoderOptions) -> Self {
        Self { w, options }
    }

    /// Encodes `image` losslessly. Output written before a failure should be
    /// discarded.
    pub fn encode(mut self, image: &NrgbaImage) -> Result<(), EncodingError> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        if width == 0 || width > 16384 || height == 0 || height > 16384 {
            return Err(EncodingError::DimensionsOutOfRange);
        }
        let mut rgba = image.to_tightly_packed();

        let mut bw = BitWriter::new();
        bw.write_bits(0x2f, 8)?;
        bw.write_bits(width as u64 - 1, 14)?;
        bw.write_bits(height as u64 - 1, 14)?;
        bw.write_bits(1, 1)?; // the pixel surface carries an alpha channel
        bw.write_bits(0, 3)?; // version

        // Index through a palette only when it pays for itself; an image of
        // mostly unique colors compresses better through the predictor.
        let palette = match transform::build_palette(&rgba) {
            Ok(palette) if 4 * palette.len() <= width * height => Some(palette),
            Ok(_) | Err(EncodingError::PaletteExceeds256Colors) => None,
            Err(e) => return Err(e),
        };

        match palette {
            Some(palette) => {
                log::debug!("encoding with a {}-color palette", palette.len());
                bw.write_bits(1, 1)?;
                bw.write_bits(3, 2)?;
                bw.write_bits(palette.len() as u64 - 1, 8)?;
                let delta = delta_encode_palette(&palette);
                encode_image_stream(&mut bw, &delta, palette.len(), 1, false, 0)?;
                bw.write_bits(0, 1)?; // end of transforms

                let packed = transform::pack_palette_indices(&rgba, width, height, &palette);
                let packed_width = subsample_size(
                    width as u16,
                    transform::palette_index_bits(palette.len() as u16),
                ) as usize;
                encode_image_stream(&mut bw, &packed, packed_width, height, true, 0)?;
            }
            None => {
                log::debug!("encoding with subtract-green and predictor transforms");
                bw.write_bits(1, 1)?;
                bw.write_bits(2, 2)?; // subtract green
                transform::forward_subtract_green(&mut rgba);

                bw.write_bits(1, 1)?;
                bw.write_bits(0, 2)?; // predictor
                bw.write_bits(u64::from(PREDICTOR_TILE_BITS) - 2, 3)?;
                let (residuals, meta) =
                    transform::forward_predictor(&rgba, width, height, PREDICTOR_TILE_BITS);
                let tiles_w = subsample_size(width as u16, PREDICTOR_TILE_BITS) as usize;
                let tiles_h = subsample_size(height as u16, PREDICTOR_TILE_BITS) as usize;
                encode_image_stream(&mut bw, &meta, tiles_w, tiles_h, false, 0)?;
                bw.write_bits(0, 1)?; // end of transforms

                encode_image_stream(&mut bw, &residuals, width, height, true, COLOR_CACHE_BITS)?;
            }
        }

        let payload = bw.into_bytes();
        let vp8x;
        let mut chunks: Vec<(WebPRiffChunk, &[u8])> = Vec::new();
        if self.options.use_extended_format {
            vp8x = extended::extended_header_payload(
                !image.is_opaque(),
                width as u32,
                height as u32,
            );
            chunks.push((WebPRiffChunk::VP8X, &vp8x));
        }
        chunks.push((WebPRiffChunk::VP8L, &payload));
        riff::write_container(&mut self.w, &chunks)?;
        Ok(())
    }
}
