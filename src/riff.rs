use anyhow::{bail, Result};

pub const CHUNK_VP8X: [u8; 4] = *b"VP8X";
pub const CHUNK_ICCP: [u8; 4] = *b"ICCP";
pub const CHUNK_EXIF: [u8; 4] = *b"EXIF";
pub const CHUNK_XMP: [u8; 4] = *b"XMP ";

const FLAG_ICCP: u32 = 0x20;
const FLAG_ALPHA: u32 = 0x10;
const FLAG_EXIF: u32 = 0x08;
const FLAG_XMP: u32 = 0x04;

const VP8X_PAYLOAD_LEN: usize = 10;
const MAX_CANVAS: u32 = 1 << 24;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub fourcc: [u8; 4],
    pub data: Vec<u8>,
}

/// Splice `payload` into a WebP container under `fourcc` (one of ICCP,
/// EXIF, XMP), creating or updating the VP8X header as needed. An existing
/// chunk with the same fourcc is replaced. The input buffer is never
/// modified; on error the caller keeps what it had.
pub fn set_chunk(webp: &[u8], fourcc: [u8; 4], payload: &[u8]) -> Result<Vec<u8>> {
    let flag = match &fourcc {
        b"ICCP" => FLAG_ICCP,
        b"EXIF" => FLAG_EXIF,
        b"XMP " => FLAG_XMP,
        _ => bail!("unsupported metadata chunk {:?}", four_str(&fourcc)),
    };

    let mut chunks = parse(webp)?;
    let features = Features::detect(&chunks)?;

    // Make sure a VP8X header leads the container, then set the feature bit.
    if !chunks.iter().any(|c| c.fourcc == CHUNK_VP8X) {
        chunks.insert(
            0,
            Chunk {
                fourcc: CHUNK_VP8X,
                data: build_vp8x(0, &features),
            },
        );
    }
    for c in chunks.iter_mut().filter(|c| c.fourcc == CHUNK_VP8X) {
        let mut flags = read_vp8x_flags(&c.data)?;
        flags |= flag;
        if features.has_alpha {
            flags |= FLAG_ALPHA;
        }
        c.data = build_vp8x(flags, &features);
    }

    // Replace in place or append, then restore canonical chunk order.
    match chunks.iter_mut().find(|c| c.fourcc == fourcc) {
        Some(c) => c.data = payload.to_vec(),
        None => chunks.push(Chunk {
            fourcc,
            data: payload.to_vec(),
        }),
    }
    chunks.sort_by_key(|c| chunk_order(&c.fourcc));

    Ok(assemble(&chunks))
}

/// Chunk list of a WebP container, header validated.
pub fn parse(webp: &[u8]) -> Result<Vec<Chunk>> {
    if webp.len() < 12 || &webp[..4] != b"RIFF" || &webp[8..12] != b"WEBP" {
        bail!("not a WebP container");
    }
    let mut chunks = Vec::new();
    let mut pos = 12usize;
    while pos < webp.len() {
        if pos + 8 > webp.len() {
            bail!("truncated chunk header at offset {pos}");
        }
        let fourcc: [u8; 4] = webp[pos..pos + 4].try_into().unwrap();
        let size = u32::from_le_bytes(webp[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let start = pos + 8;
        let end = start + size;
        if end > webp.len() {
            bail!("truncated {} chunk", four_str(&fourcc));
        }
        chunks.push(Chunk {
            fourcc,
            data: webp[start..end].to_vec(),
        });
        pos = end + (size & 1); // chunks are padded to even sizes
    }
    Ok(chunks)
}

struct Features {
    width: u32,
    height: u32,
    has_alpha: bool,
}

impl Features {
    /// Canvas size and alpha presence, from VP8X when present, otherwise
    /// from the VP8/VP8L stream headers.
    fn detect(chunks: &[Chunk]) -> Result<Self> {
        if let Some(c) = chunks.iter().find(|c| c.fourcc == CHUNK_VP8X) {
            if c.data.len() < VP8X_PAYLOAD_LEN {
                bail!("malformed VP8X chunk");
            }
            let flags = read_vp8x_flags(&c.data)?;
            let width = 1 + read_u24(&c.data[4..7]);
            let height = 1 + read_u24(&c.data[7..10]);
            let has_alpha =
                flags & FLAG_ALPHA != 0 || chunks.iter().any(|c| &c.fourcc == b"ALPH");
            return Ok(Self {
                width,
                height,
                has_alpha,
            });
        }
        if let Some(c) = chunks.iter().find(|c| &c.fourcc == b"VP8 ") {
            let (width, height) = parse_vp8_dimensions(&c.data)?;
            let has_alpha = chunks.iter().any(|c| &c.fourcc == b"ALPH");
            return Ok(Self {
                width,
                height,
                has_alpha,
            });
        }
        if let Some(c) = chunks.iter().find(|c| &c.fourcc == b"VP8L") {
            return parse_vp8l_features(&c.data);
        }
        bail!("no image stream chunk in container");
    }
}

fn build_vp8x(flags: u32, features: &Features) -> Vec<u8> {
    let mut data = vec![0u8; VP8X_PAYLOAD_LEN];
    data[..4].copy_from_slice(&flags.to_le_bytes());
    write_u24(&mut data[4..7], features.width - 1);
    write_u24(&mut data[7..10], features.height - 1);
    data
}

fn read_vp8x_flags(data: &[u8]) -> Result<u32> {
    if data.len() < VP8X_PAYLOAD_LEN {
        bail!("malformed VP8X chunk");
    }
    Ok(u32::from_le_bytes(data[..4].try_into().unwrap()))
}

/// Key frame header of a lossy stream: 3-byte frame tag, start code
/// 9D 01 2A, then 14-bit width and height.
fn parse_vp8_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    if data.len() < 10 || data[3..6] != [0x9d, 0x01, 0x2a] {
        bail!("malformed VP8 stream header");
    }
    let width = u32::from(u16::from_le_bytes([data[6], data[7]]) & 0x3fff);
    let height = u32::from(u16::from_le_bytes([data[8], data[9]]) & 0x3fff);
    Ok((width, height))
}

/// VP8L stream header: signature 0x2F, then a little-endian bit field with
/// 14-bit width-1, 14-bit height-1 and the alpha-is-used bit.
fn parse_vp8l_features(data: &[u8]) -> Result<Features> {
    if data.len() < 5 || data[0] != 0x2f {
        bail!("malformed VP8L stream header");
    }
    let bits = u32::from_le_bytes(data[1..5].try_into().unwrap());
    let width = (bits & 0x3fff) + 1;
    let height = ((bits >> 14) & 0x3fff) + 1;
    let has_alpha = (bits >> 28) & 1 == 1;
    if width > MAX_CANVAS || height > MAX_CANVAS {
        bail!("canvas size out of range");
    }
    Ok(Features {
        width,
        height,
        has_alpha,
    })
}

fn chunk_order(fourcc: &[u8; 4]) -> u8 {
    match fourcc {
        b"VP8X" => 0,
        b"ICCP" => 1,
        b"ANIM" => 2,
        b"EXIF" => 6,
        b"XMP " => 7,
        // ALPH, VP8/VP8L, ANMF and anything unknown keep their relative
        // positions between ICCP and EXIF.
        _ => 3,
    }
}

fn assemble(chunks: &[Chunk]) -> Vec<u8> {
    let payload: usize = chunks
        .iter()
        .map(|c| 8 + c.data.len() + (c.data.len() & 1))
        .sum();
    let mut out = Vec::with_capacity(12 + payload);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((4 + payload) as u32).to_le_bytes());
    out.extend_from_slice(b"WEBP");
    for c in chunks {
        out.extend_from_slice(&c.fourcc);
        out.extend_from_slice(&(c.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&c.data);
        if c.data.len() & 1 == 1 {
            out.push(0);
        }
    }
    out
}

fn read_u24(data: &[u8]) -> u32 {
    u32::from(data[0]) | u32::from(data[1]) << 8 | u32::from(data[2]) << 16
}

fn write_u24(data: &mut [u8], value: u32) {
    data[0] = value as u8;
    data[1] = (value >> 8) as u8;
    data[2] = (value >> 16) as u8;
}

fn four_str(fourcc: &[u8; 4]) -> String {
    fourcc.iter().map(|&b| b as char).collect()
}
