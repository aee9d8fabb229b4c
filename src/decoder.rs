use std::io::{self, Cursor, Read, Seek};
use std::ops::Range;

use thiserror::Error;

use crate::extended::{self, AlphaChunk, WebPExtendedInfo};
use crate::lossless::LosslessDecoder;
use crate::nrgba::NrgbaImage;
use crate::riff::{RiffReader, WebPRiffChunk};

/// Errors that can occur when attempting to decode a WebP image
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodingError {
    /// An IO error occurred while reading the file
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),

    /// RIFF's "RIFF" signature not found or invalid
    #[error("RIFF signature not found")]
    MissingRiffHeader,

    /// The RIFF form type is not "WEBP"
    #[error("RIFF form type is not WEBP")]
    NotAWebpFile,

    /// The stream ended inside a chunk header
    #[error("Chunk header truncated")]
    ShortChunkHeader,

    /// A chunk declared more payload than the stream holds
    #[error("Chunk payload truncated")]
    ShortChunkData,

    /// An odd-length chunk is not followed by its padding byte
    #[error("Odd-length chunk is missing its padding byte")]
    MissingPaddingByte,

    /// A subchunk extends past the end declared by the RIFF header
    #[error("Subchunk extends past the RIFF payload")]
    ListSubchunkTooLong,

    /// More than one VP8X chunk, or one that does not lead the file
    #[error("Duplicate or misplaced VP8X chunk")]
    DuplicateVp8xChunk,

    /// VP8X payload is not exactly 10 bytes
    #[error("Invalid VP8X chunk size: {0}")]
    InvalidVp8xChunkSize(u32),

    /// ALPH chunk too short to carry its header byte
    #[error("Invalid ALPH chunk")]
    InvalidAlphChunk,

    /// ALPH compression bits name a reserved method
    #[error("Invalid alpha compression method: {0}")]
    InvalidAlphaCompression(u8),

    /// The alpha plane does not match the canvas dimensions
    #[error("Alpha plane does not match the image dimensions")]
    InvalidAlphaDimensions,

    /// ALPH chunk without a VP8X alpha flag, repeated, or next to VP8L
    #[error("ALPH chunk not permitted here")]
    UnexpectedAlphChunk,

    /// Signature of 0x2f not found
    #[error("Invalid VP8L signature: {0:#04x}")]
    InvalidVp8lHeader(u8),

    /// Version number was not zero
    #[error("Invalid VP8L version: {0}")]
    InvalidVp8lVersion(u8),

    /// The bitstream ended mid-read
    #[error("Unexpected end of bitstream")]
    UnexpectedEof,

    /// Code lengths that do not describe a valid prefix code
    #[error("Invalid Huffman code lengths")]
    InvalidHuffmanTree,

    /// Color cache size outside 1..=11 bits
    #[error("Invalid color cache parameters: {0}")]
    InvalidColorCacheParameters(u8),

    /// A cache code referenced a slot past the cache size
    #[error("Color cache index out of range")]
    InvalidColorCacheIndex,

    /// Transform list or transform metadata was invalid
    #[error("Invalid transform data")]
    InvalidTransformType,

    /// A backward reference that reaches outside the decoded pixels
    #[error("Invalid LZ77 backward reference")]
    InvalidLz77Parameters,

    /// Decoded pixels would not fit the declared buffer
    #[error("Pixel buffer bounds exceeded")]
    PixelBufferOverflow,

    /// The file is valid lossy WebP, which this crate does not decode
    #[error("VP8 lossy WebP decoding is not yet supported")]
    LossyUnsupported,

    /// Width or height outside 1..=16384
    #[error("Image dimensions out of range")]
    DimensionsOutOfRange,
}

impl DecodingError {
    /// Reclassifies an EOF hit inside a chunk header.
    pub(crate) fn short_header(e: DecodingError) -> DecodingError {
        match e {
            DecodingError::IoError(ref io_err)
                if io_err.kind() == io::ErrorKind::UnexpectedEof =>
            {
                DecodingError::ShortChunkHeader
            }
            other => other,
        }
    }
}

/// WebP image format decoder.
///
/// `new` scans and validates the container up front; the pixel work happens
/// in [`read_image`](WebPDecoder::read_image). The decoder performs many
/// small reads, so the reader should be buffered.
#[derive(Debug)]
pub struct WebPDecoder<R> {
    r: R,
    width: u32,
    height: u32,
    extended: Option<WebPExtendedInfo>,
    alpha_chunk: Option<AlphaChunk>,
    vp8l: Option<Range<u64>>,
}

impl<R: Read + Seek> WebPDecoder<R> {
    /// Create a new `WebPDecoder` from the reader `r`.
    pub fn new(r: R) -> Result<WebPDecoder<R>, DecodingError> {
        let mut decoder = WebPDecoder {
            r,
            width: 0,
            height: 0,
            extended: None,
            alpha_chunk: None,
            vp8l: None,
        };
        decoder.read_data()?;
        Ok(decoder)
    }

    fn read_data(&mut self) -> Result<(), DecodingError> {
        let mut riff = RiffReader::open(&mut self.r)?;

        let mut is_first_chunk = true;
        let mut extended: Option<WebPExtendedInfo> = None;
        let mut alpha_chunk: Option<AlphaChunk> = None;
        let mut vp8l: Option<Range<u64>> = None;

        while let Some(scanned) = riff.next_chunk()? {
            let range = scanned.start..scanned.start + u64::from(scanned.len);
            match scanned.chunk {
                WebPRiffChunk::VP8X => {
                    if !is_first_chunk {
                        return Err(DecodingError::DuplicateVp8xChunk);
                    }
                    let payload = riff.chunk_payload(&scanned)?;
                    let info =
                        extended::read_extended_header(&mut Cursor::new(payload), scanned.len)?;
                    extended = Some(info);
                }
                WebPRiffChunk::ALPH => {
                    let alpha_allowed = extended.map_or(false, |info| info.alpha)
                        && alpha_chunk.is_none()
                        && vp8l.is_none();
                    if !alpha_allowed {
                        return Err(DecodingError::UnexpectedAlphChunk);
                    }
                    let info = extended.expect("alpha flag requires VP8X");
                    let payload = riff.chunk_payload(&scanned)?;
                    let chunk = extended::read_alpha_chunk(
                        &mut Cursor::new(payload),
                        info.canvas_width as u16,
                        info.canvas_height as u16,
                    )?;
                    alpha_chunk = Some(chunk);
                }
                WebPRiffChunk::VP8L => {
                    if alpha_chunk.is_some() {
                        return Err(DecodingError::UnexpectedAlphChunk);
                    }
                    if vp8l.is_none() {
                        vp8l = Some(range);
                    }
                }
                WebPRiffChunk::VP8 => return Err(DecodingError::LossyUnsupported),
                chunk => {
                    log::debug!("skipping chunk {:?}", chunk.to_fourcc());
                }
            }
            is_first_chunk = false;
        }

        let vp8l = vp8l.ok_or(DecodingError::UnexpectedEof)?;

        // Peek the VP8L stream header for the image dimensions.
        self.r.seek(io::SeekFrom::Start(vp8l.start))?;
        let mut header = [0u8; 5];
        self.r
            .read_exact(&mut header)
            .map_err(|_| DecodingError::UnexpectedEof)?;
        if header[0] != 0x2f {
            return Err(DecodingError::InvalidVp8lHeader(header[0]));
        }
        let bits = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if bits >> 29 != 0 {
            return Err(DecodingError::InvalidVp8lVersion((bits >> 29) as u8));
        }
        self.width = (bits & 0x3fff) + 1;
        self.height = ((bits >> 14) & 0x3fff) + 1;

        if let Some(info) = &extended {
            if (info.canvas_width, info.canvas_height) != (self.width, self.height) {
                log::warn!(
                    "VP8X canvas {}x{} disagrees with VP8L dimensions {}x{}",
                    info.canvas_width,
                    info.canvas_height,
                    self.width,
                    self.height
                );
            }
        }

        self.extended = extended;
        self.alpha_chunk = alpha_chunk;
        self.vp8l = Some(vp8l);
        Ok(())
    }

    /// Returns the (width, height) of the image in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns whether the decoded pixels may carry non-opaque alpha.
    pub fn has_alpha(&self) -> bool {
        match &self.extended {
            Some(info) => info.alpha,
            None => true,
        }
    }

    /// Returns the defiltered alpha plane decoded from an `ALPH` chunk, when
    /// the file carried one.
    pub fn alpha_plane(&self) -> Option<&[u8]> {
        self.alpha_chunk.as_ref().map(|chunk| chunk.data.as_slice())
    }

    /// Returns the number of bytes required to store the decoded image.
    pub fn output_buffer_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Decodes the image into a freshly allocated pixel surface.
    pub fn read_image(&mut self) -> Result<NrgbaImage, DecodingError> {
        let range = self.vp8l.clone().ok_or(DecodingError::UnexpectedEof)?;
        let mut decoder = LosslessDecoder::new(range_reader(&mut self.r, range)?)?;
        let frame = decoder.decode_frame()?;
        Ok(frame.into_nrgba())
    }

    /// Decodes the image into a caller buffer of exactly
    /// [`output_buffer_size`](WebPDecoder::output_buffer_size) bytes,
    /// tightly packed R,G,B,A.
    pub fn read_image_into(&mut self, buf: &mut [u8]) -> Result<(), DecodingError> {
        if buf.len() != self.output_buffer_size() {
            return Err(DecodingError::PixelBufferOverflow);
        }
        let range = self.vp8l.clone().ok_or(DecodingError::UnexpectedEof)?;
        let mut decoder = LosslessDecoder::new(range_reader(&mut self.r, range)?)?;
        let frame = decoder.decode_frame()?;
        frame.fill_rgba(buf);
        Ok(())
    }
}

pub(crate) fn range_reader<R: Read + Seek>(
    mut r: R,
    range: Range<u64>,
) -> Result<impl Read, DecodingError> {
    r.seek(io::SeekFrom::Start(range.start))?;
    Ok(r.take(range.end - range.start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn container_with_lengths(riff_size: u32, chunk_size: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&riff_size.to_le_bytes());
        bytes.extend_from_slice(b"WEBP");
        bytes.extend_from_slice(b"VP8L");
        bytes.extend_from_slice(&chunk_size.to_le_bytes());
        bytes.extend_from_slice(&[0x2f, 0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn crafted_chunk_lengths_are_rejected_without_panicking() {
        // An odd u32::MAX payload length would wrap the pad rounding and the
        // end-offset arithmetic if either were done in u32 without care; the
        // chunk must simply be found longer than the container.
        let err =
            WebPDecoder::new(Cursor::new(container_with_lengths(u32::MAX, u32::MAX))).unwrap_err();
        assert!(matches!(err, DecodingError::ListSubchunkTooLong));

        // An outer size too small to hold even one chunk header.
        let err = WebPDecoder::new(Cursor::new(container_with_lengths(5, 5))).unwrap_err();
        assert!(matches!(err, DecodingError::ShortChunkHeader));

        // An honest outer size whose chunk payload the stream cannot back.
        let err = WebPDecoder::new(Cursor::new(container_with_lengths(94, 80))).unwrap_err();
        assert!(matches!(err, DecodingError::ShortChunkData));
    }

    fn wrap_vp8l(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        crate::riff::write_container(&mut out, &[(WebPRiffChunk::VP8L, payload)]).unwrap();
        out
    }

    #[test]
    fn decodes_reference_pixel_container() {
        let payload = [47u8, 0, 0, 0, 16, 7, 16, 253, 143, 2, 6, 34, 162, 255, 1];
        let mut decoder = WebPDecoder::new(Cursor::new(wrap_vp8l(&payload))).unwrap();
        assert_eq!(decoder.dimensions(), (1, 1));
        let image = decoder.read_image().unwrap();
        assert_eq!(image.at(0, 0), [255, 0, 0, 128]);

        let mut buf = vec![0u8; decoder.output_buffer_size()];
        decoder.read_image_into(&mut buf).unwrap();
        assert_eq!(buf, vec![255, 0, 0, 128]);
    }

    #[test]
    fn lossy_input_is_rejected_with_capability_error() {
        let mut bytes = Vec::new();
        crate::riff::write_container(&mut bytes, &[(WebPRiffChunk::VP8, &[0u8; 16])]).unwrap();
        let err = WebPDecoder::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DecodingError::LossyUnsupported));
    }

    #[test]
    fn missing_riff_header_is_reported() {
        let err = WebPDecoder::new(Cursor::new(b"INVALID bytes here".to_vec())).unwrap_err();
        assert!(matches!(err, DecodingError::MissingRiffHeader));
    }

    #[test]
    fn second_vp8x_chunk_is_rejected() {
        let vp8x = extended::extended_header_payload(false, 1, 1);
        let mut bytes = Vec::new();
        crate::riff::write_container(
            &mut bytes,
            &[
                (WebPRiffChunk::VP8X, &vp8x[..]),
                (WebPRiffChunk::VP8X, &vp8x[..]),
            ],
        )
        .unwrap();
        let err = WebPDecoder::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DecodingError::DuplicateVp8xChunk));
    }

    #[test]
    fn alpha_chunk_requires_vp8x_alpha_flag() {
        let vp8x = extended::extended_header_payload(false, 1, 1);
        let mut bytes = Vec::new();
        crate::riff::write_container(
            &mut bytes,
            &[
                (WebPRiffChunk::VP8X, &vp8x[..]),
                (WebPRiffChunk::ALPH, &[0u8, 42][..]),
            ],
        )
        .unwrap();
        let err = WebPDecoder::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DecodingError::UnexpectedAlphChunk));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let payload = [47u8, 0, 0, 0, 16, 7, 16, 253, 143, 2, 6, 34, 162, 255, 1];
        let mut bytes = Vec::new();
        crate::riff::write_container(
            &mut bytes,
            &[
                (WebPRiffChunk::Unknown(*b"JUNK"), &[1, 2, 3][..]),
                (WebPRiffChunk::VP8L, &payload[..]),
            ],
        )
        .unwrap();
        let mut decoder = WebPDecoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(decoder.read_image().unwrap().at(0, 0), [255, 0, 0, 128]);
    }

    #[test]
    fn alpha_chunk_is_parsed_before_lossy_rejection() {
        // A VP8X + ALPH + VP8 file: the alpha plane parses, then the lossy
        // image data is refused.
        let vp8x = extended::extended_header_payload(true, 2, 2);
        let alph = [0u8, 1, 2, 3, 4]; // raw, unfiltered 2x2 plane
        let mut bytes = Vec::new();
        crate::riff::write_container(
            &mut bytes,
            &[
                (WebPRiffChunk::VP8X, &vp8x[..]),
                (WebPRiffChunk::ALPH, &alph[..]),
                (WebPRiffChunk::VP8, &[0u8; 8][..]),
            ],
        )
        .unwrap();
        let err = WebPDecoder::new(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DecodingError::LossyUnsupported));
    }
}
