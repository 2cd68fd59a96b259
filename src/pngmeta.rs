use crate::imagex::{MetaChunks, TAG_EXIF, TAG_ICCP, TAG_XMP};
use flate2::read::ZlibDecoder;
use std::io::{self, Read};

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

const XMP_KEYWORD: &[u8] = b"XML:com.adobe.xmp";
const KEYWORD_LIMIT: usize = 79;

/// Pass-through filter over a PNG byte stream.
///
/// Every byte read from the underlying stream is yielded to the consumer
/// unchanged; the filter merely observes the stream to pick out iCCP, eXIf
/// and XMP-bearing iTXt chunks, verify their CRCs and collect the decoded
/// payloads. Unrecognized chunks (and repeats of an already-collected tag)
/// are length-skipped without buffering, so memory stays bounded by the
/// largest recognized chunk.
#[derive(Debug)]
pub struct PngMetaReader<R> {
    inner: R,
    lead: [u8; 8],
    lead_pos: usize,
    state: State,
    chunks: MetaChunks,
}

#[derive(Debug)]
enum State {
    /// Collecting the 8-byte length + fourcc chunk header.
    Header { have: usize, buf: [u8; 8] },
    /// Passing an uninteresting chunk's data + CRC through.
    Skip { left: u64 },
    /// Accumulating fourcc + data + CRC of a recognized chunk.
    Capture {
        kind: ChunkKind,
        left: usize,
        buf: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Iccp,
    Exif,
    Itxt,
}

impl<R: Read> PngMetaReader<R> {
    /// Reads and validates the 8-byte signature up front; those bytes are
    /// re-yielded to the consumer so the stream stays byte-identical.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if magic != PNG_MAGIC {
            return Err(format_error("not a PNG file"));
        }
        Ok(Self {
            inner,
            lead: magic,
            lead_pos: 0,
            state: State::Header {
                have: 0,
                buf: [0; 8],
            },
            chunks: MetaChunks::default(),
        })
    }

    pub fn chunks(&self) -> &MetaChunks {
        &self.chunks
    }

    pub fn into_chunks(self) -> MetaChunks {
        self.chunks
    }

    /// Feed observed bytes into the chunk state machine. Consumes nothing
    /// from the underlying stream; boundaries may fall anywhere inside
    /// `bytes`.
    fn observe(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        loop {
            let consumed = match &mut self.state {
                State::Header { have, buf } => {
                    let take = (8 - *have).min(bytes.len());
                    buf[*have..*have + take].copy_from_slice(&bytes[..take]);
                    *have += take;
                    if *have == 8 {
                        let header = *buf;
                        self.begin_chunk(header);
                    }
                    take
                }
                State::Skip { left } => {
                    let take = (*left).min(bytes.len() as u64) as usize;
                    *left -= take as u64;
                    if *left == 0 {
                        self.state = State::Header {
                            have: 0,
                            buf: [0; 8],
                        };
                    }
                    take
                }
                State::Capture { kind, left, buf } => {
                    let take = (*left).min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    *left -= take;
                    if *left == 0 {
                        let kind = *kind;
                        let raw = std::mem::take(buf);
                        self.state = State::Header {
                            have: 0,
                            buf: [0; 8],
                        };
                        self.finish_chunk(kind, raw)?;
                    }
                    take
                }
            };
            if consumed == bytes.len() {
                return Ok(());
            }
            bytes = &bytes[consumed..];
        }
    }

    fn begin_chunk(&mut self, header: [u8; 8]) {
        let data_len = u32::from_be_bytes(header[..4].try_into().unwrap()) as u64;
        let fourcc: [u8; 4] = header[4..8].try_into().unwrap();

        let kind = match &fourcc {
            b"iCCP" if self.chunks.get(TAG_ICCP).is_none() => Some(ChunkKind::Iccp),
            b"eXIf" if self.chunks.get(TAG_EXIF).is_none() => Some(ChunkKind::Exif),
            b"iTXt" if self.chunks.get(TAG_XMP).is_none() => Some(ChunkKind::Itxt),
            _ => None,
        };

        self.state = match kind {
            Some(kind) => {
                let mut buf = Vec::with_capacity(4 + (data_len as usize).min(1 << 20) + 4);
                buf.extend_from_slice(&fourcc);
                State::Capture {
                    kind,
                    left: data_len as usize + 4,
                    buf,
                }
            }
            // Data plus trailing CRC, neither buffered nor verified.
            None => State::Skip { left: data_len + 4 },
        };
    }

    /// `raw` holds fourcc + data + CRC of a complete recognized chunk.
    fn finish_chunk(&mut self, kind: ChunkKind, raw: Vec<u8>) -> io::Result<()> {
        let n = raw.len();
        let stored = u32::from_be_bytes(raw[n - 4..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[..n - 4]);
        if hasher.finalize() != stored {
            return Err(format_error("invalid checksum"));
        }

        let data = &raw[4..n - 4];
        match kind {
            ChunkKind::Iccp => {
                let icc = parse_iccp(data)?;
                if !icc.is_empty() {
                    self.chunks.insert_first(TAG_ICCP, icc);
                }
            }
            ChunkKind::Exif => {
                if !data.is_empty() {
                    self.chunks.insert_first(TAG_EXIF, data.to_vec());
                }
            }
            ChunkKind::Itxt => {
                if let Some(text) = parse_itxt_xmp(data)? {
                    if !text.is_empty() {
                        self.chunks.insert_first(TAG_XMP, text);
                    }
                }
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for PngMetaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.lead_pos < self.lead.len() {
            let take = (self.lead.len() - self.lead_pos).min(buf.len());
            buf[..take].copy_from_slice(&self.lead[self.lead_pos..self.lead_pos + take]);
            self.lead_pos += take;
            return Ok(take);
        }
        let n = self.inner.read(buf)?;
        self.observe(&buf[..n])?;
        Ok(n)
    }
}

/// iCCP: profile name (≤79 bytes, NUL-terminated), compression method 0,
/// then a zlib stream holding the ICC profile.
fn parse_iccp(data: &[u8]) -> io::Result<Vec<u8>> {
    let (_name, rest) = read_cstr(data, KEYWORD_LIMIT)?;
    let (&method, zdata) = rest
        .split_first()
        .ok_or_else(|| format_error("truncated iCCP chunk"))?;
    if method != 0 {
        return Err(format_error("unknown compression method"));
    }
    let mut profile = Vec::new();
    ZlibDecoder::new(zdata).read_to_end(&mut profile)?;
    Ok(profile)
}

/// iTXt: keyword, compression flag + method, language tag, translated
/// keyword, then the text. Returns the text only for the XMP keyword.
fn parse_itxt_xmp(data: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let (keyword, rest) = read_cstr(data, KEYWORD_LIMIT)?;
    if rest.len() < 2 {
        return Err(format_error("truncated iTXt chunk"));
    }
    let flag = rest[0];
    let method = rest[1];
    let rest = &rest[2..];
    let (_lang, rest) = read_cstr(rest, usize::MAX)?;
    let (_translated, text) = read_cstr(rest, usize::MAX)?;

    if flag == 1 && method != 0 {
        return Err(format_error("unknown compression method"));
    }
    if keyword != XMP_KEYWORD {
        return Ok(None);
    }

    if flag == 1 {
        let mut out = Vec::new();
        ZlibDecoder::new(text).read_to_end(&mut out)?;
        Ok(Some(out))
    } else {
        Ok(Some(text.to_vec()))
    }
}

/// NUL-terminated field. Exceeding `limit` bytes without a NUL is a format
/// error (the PNG keyword cap is hard).
fn read_cstr(data: &[u8], limit: usize) -> io::Result<(&[u8], &[u8])> {
    let window = limit.saturating_add(1).min(data.len());
    match data[..window].iter().position(|&b| b == 0) {
        Some(i) => Ok((&data[..i], &data[i + 1..])),
        None if data.len() > limit => Err(format_error("keyword too long")),
        None => Err(format_error("truncated text chunk")),
    }
}

fn format_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("png: {msg}"))
}
