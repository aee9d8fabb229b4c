//! RIFF container framing.
//!
//! The reader side scans `RIFF/WEBP` chunk headers and hands back bounded
//! payload ranges; the writer side assembles chunk payloads into a container
//! with the mandatory even-length padding.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, Write};

use crate::decoder::DecodingError;

/// All RIFF chunks this crate recognises inside a WebP file.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Hash, Eq)]
pub(crate) enum WebPRiffChunk {
    RIFF,
    WEBP,
    VP8,
    VP8L,
    VP8X,
    ALPH,
    Unknown([u8; 4]),
}

impl WebPRiffChunk {
    pub(crate) fn from_fourcc(chunk_fourcc: [u8; 4]) -> Self {
        match &chunk_fourcc {
            b"RIFF" => Self::RIFF,
            b"WEBP" => Self::WEBP,
            b"VP8 " => Self::VP8,
            b"VP8L" => Self::VP8L,
            b"VP8X" => Self::VP8X,
            b"ALPH" => Self::ALPH,
            _ => Self::Unknown(chunk_fourcc),
        }
    }

    pub(crate) fn to_fourcc(self) -> [u8; 4] {
        match self {
            Self::RIFF => *b"RIFF",
            Self::WEBP => *b"WEBP",
            Self::VP8 => *b"VP8 ",
            Self::VP8L => *b"VP8L",
            Self::VP8X => *b"VP8X",
            Self::ALPH => *b"ALPH",
            Self::Unknown(fourcc) => fourcc,
        }
    }

    pub(crate) fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

pub(crate) fn read_fourcc<R: Read>(mut r: R) -> Result<WebPRiffChunk, DecodingError> {
    let mut chunk_fourcc = [0; 4];
    r.read_exact(&mut chunk_fourcc)?;
    Ok(WebPRiffChunk::from_fourcc(chunk_fourcc))
}

/// Reads a `fourcc + u32 length` chunk header, returning the chunk, its
/// payload length, and the length rounded up to the trailing pad byte.
pub(crate) fn read_chunk_header<R: Read>(
    mut r: R,
) -> Result<(WebPRiffChunk, u32, u32), DecodingError> {
    let chunk = read_fourcc(&mut r).map_err(DecodingError::short_header)?;
    let chunk_size = r
        .read_u32::<LittleEndian>()
        .map_err(|e| DecodingError::short_header(e.into()))?;
    let chunk_size_rounded = chunk_size.saturating_add(chunk_size & 1);
    Ok((chunk, chunk_size, chunk_size_rounded))
}

/// One scanned chunk: its identity and the byte range its payload occupies in
/// the underlying stream.
#[derive(Debug, Clone)]
pub(crate) struct ScannedChunk {
    pub chunk: WebPRiffChunk,
    pub start: u64,
    pub len: u32,
}

/// A forward-only scanner over the chunks of a `RIFF .... WEBP` container.
///
/// `open` validates the outer framing; `next_chunk` yields each subchunk in
/// file order without reading payload bytes, so the caller can come back for
/// the ones it wants.
#[derive(Debug)]
pub(crate) struct RiffReader<R> {
    r: R,
    /// One past the last payload byte the outer RIFF length admits.
    riff_end: u64,
    /// Total length of the underlying stream.
    stream_len: u64,
    position: u64,
}

impl<R: Read + Seek> RiffReader<R> {
    pub(crate) fn open(mut r: R) -> Result<Self, DecodingError> {
        let stream_len = r.seek(io::SeekFrom::End(0))?;
        r.seek(io::SeekFrom::Start(0))?;

        let mut signature = [0; 4];
        r.read_exact(&mut signature)
            .map_err(|_| DecodingError::MissingRiffHeader)?;
        if &signature != b"RIFF" {
            return Err(DecodingError::MissingRiffHeader);
        }
        let riff_size = r
            .read_u32::<LittleEndian>()
            .map_err(|_| DecodingError::MissingRiffHeader)?;

        let mut form_type = [0; 4];
        r.read_exact(&mut form_type)
            .map_err(|_| DecodingError::NotAWebpFile)?;
        if &form_type != b"WEBP" {
            return Err(DecodingError::NotAWebpFile);
        }

        // The outer length counts the form type plus every subchunk. It is
        // not clamped to the stream: a subchunk past the declared length is
        // ListSubchunkTooLong, one past the actual bytes is ShortChunkData.
        let riff_end = 8u64.saturating_add(u64::from(riff_size));
        Ok(Self {
            r,
            riff_end,
            stream_len,
            position: 12,
        })
    }

    /// Advances to the next chunk header. Returns `None` once the declared
    /// container length is exhausted.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<ScannedChunk>, DecodingError> {
        if self.position >= self.riff_end {
            return Ok(None);
        }
        if self.position + 8 > self.riff_end {
            return Err(DecodingError::ShortChunkHeader);
        }
        self.r.seek(io::SeekFrom::Start(self.position))?;
        let (chunk, len, len_rounded) = read_chunk_header(&mut self.r)?;

        let start = self.position + 8;
        let end = start + u64::from(len);
        if end > self.riff_end {
            return Err(DecodingError::ListSubchunkTooLong);
        }
        if end > self.stream_len {
            return Err(DecodingError::ShortChunkData);
        }
        if len != len_rounded && end + 1 > self.stream_len {
            return Err(DecodingError::MissingPaddingByte);
        }

        self.position = start + u64::from(len_rounded);
        Ok(Some(ScannedChunk { chunk, start, len }))
    }

    /// Reads a scanned chunk's payload bytes. The scan position is untouched;
    /// `next_chunk` reseeks before every header read.
    pub(crate) fn chunk_payload(&mut self, chunk: &ScannedChunk) -> Result<Vec<u8>, DecodingError> {
        self.r.seek(io::SeekFrom::Start(chunk.start))?;
        let mut data = vec![0; chunk.len as usize];
        self.r
            .read_exact(&mut data)
            .map_err(|_| DecodingError::ShortChunkData)?;
        Ok(data)
    }
}

/// Writes a complete `RIFF <len> WEBP` container holding `chunks`, padding
/// each odd-length payload with one zero byte.
pub(crate) fn write_container<W: Write>(
    w: &mut W,
    chunks: &[(WebPRiffChunk, &[u8])],
) -> io::Result<()> {
    let mut total = 4u32;
    for (_, payload) in chunks {
        let len = payload.len() as u32;
        total += 8 + len + (len & 1);
    }

    w.write_all(b"RIFF")?;
    w.write_u32::<LittleEndian>(total)?;
    w.write_all(b"WEBP")?;
    for (chunk, payload) in chunks {
        w.write_all(&chunk.to_fourcc())?;
        w.write_u32::<LittleEndian>(payload.len() as u32)?;
        w.write_all(payload)?;
        if payload.len() % 2 == 1 {
            w.write_u8(0)?;
        }
    }
    Ok(())
}
