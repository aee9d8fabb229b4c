//! Decoding and encoding of lossless WebP images.
//!
//! The crate covers the VP8L bitstream (prefix-coded literals, LZ77 backward
//! references, a color cache, and the four invertible transforms), the
//! `RIFF/WEBP` container it travels in, and the extended-format `VP8X` and
//! `ALPH` chunks. Lossy `VP8 ` payloads are recognized but refused with
//! [`DecodingError::LossyUnsupported`].
//!
//! Decoding:
//!
//! ```no_run
//! # fn run() -> Result<(), webp_lossless::DecodingError> {
//! let file = std::io::BufReader::new(std::fs::File::open("image.webp")?);
//! let mut decoder = webp_lossless::WebPDecoder::new(file)?;
//! let image = decoder.read_image()?;
//! # Ok(()) }
//! ```
//!
//! Encoding:
//!
//! ```
//! # fn run() -> Result<(), webp_lossless::EncodingError> {
//! use webp_lossless::{NrgbaImage, Rect, WebPEncoder};
//!
//! let mut image = NrgbaImage::new(Rect::new(0, 0, 2, 2));
//! image.set_nrgba(0, 0, [255, 0, 0, 255]);
//! let mut out = Vec::new();
//! WebPEncoder::new(&mut out).encode(&image)?;
//! # Ok(()) }
//! # run().unwrap();
//! ```

mod decoder;
mod encoder;
mod extended;
mod huffman;
mod lossless;
mod nrgba;
mod riff;
mod transform;

pub use self::decoder::{DecodingError, WebPDecoder};
pub use self::encoder::{EncoderOptions, EncodingError, WebPEncoder};
pub use self::nrgba::{NrgbaImage, Rect};
