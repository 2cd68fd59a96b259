use crate::pngmeta::{self, PngMetaReader};
use anyhow::{Context, Result};
use image::codecs::png::PngDecoder;
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::io::{self, Cursor};

pub const TAG_ICCP: &str = "ICCP";
pub const TAG_EXIF: &str = "EXIF";
pub const TAG_XMP: &str = "XMP";

/// Ancillary metadata payloads keyed by well-known tag, as they should land
/// in the WebP container. At most one payload per tag; first write wins.
#[derive(Debug, Default, Clone)]
pub struct MetaChunks {
    tags: HashMap<&'static str, Vec<u8>>,
}

impl MetaChunks {
    pub fn get(&self, tag: &str) -> Option<&[u8]> {
        self.tags.get(tag).map(|v| v.as_slice())
    }

    pub fn insert_first(&mut self, tag: &'static str, data: Vec<u8>) {
        self.tags.entry(tag).or_insert(data);
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }
}

type DecodeFn = fn(&[u8]) -> Result<(DynamicImage, MetaChunks)>;

/// One registered image format: a magic prefix (`?` matches any byte) and a
/// decoder that also yields whatever sidecar metadata the format carries.
pub struct Format {
    pub name: &'static str,
    pub magic: &'static [u8],
    pub decode: DecodeFn,
}

/// Explicit format registry, built once at program start and threaded
/// through decode calls. Formats are tried in registration order.
pub struct Registry {
    formats: Vec<Format>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Format {
            name: "png",
            magic: pngmeta::PNG_MAGIC,
            decode: decode_png,
        });
        reg
    }

    pub fn register(&mut self, format: Format) {
        self.formats.push(format);
    }

    /// Magic-dispatching decode. Unmatched inputs fall back to the general
    /// `image` loader with an empty metadata set.
    pub fn decode(&self, data: &[u8]) -> Result<(DynamicImage, &'static str, MetaChunks)> {
        for f in &self.formats {
            if magic_match(data, f.magic) {
                let (img, chunks) = (f.decode)(data)?;
                return Ok((img, f.name, chunks));
            }
        }
        let img = image::load_from_memory(data).context("unrecognized image data")?;
        Ok((img, "image", MetaChunks::default()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn magic_match(header: &[u8], magic: &[u8]) -> bool {
    header.len() >= magic.len()
        && magic
            .iter()
            .zip(header)
            .all(|(m, b)| *m == b'?' || m == b)
}

fn decode_png(data: &[u8]) -> Result<(DynamicImage, MetaChunks)> {
    // Metadata pass: drive the pass-through filter to EOF so chunks after
    // the image data are seen and every recognized CRC is verified.
    let mut meta = PngMetaReader::new(Cursor::new(data))?;
    io::copy(&mut meta, &mut io::sink())?;
    let chunks = meta.into_chunks();

    // Pixel pass.
    let decoder = PngDecoder::new(Cursor::new(data))?;
    let img = DynamicImage::from_decoder(decoder)?;
    Ok((img, chunks))
}

/// Pixel equality in 8-bit non-premultiplied RGBA.
pub fn is_image_equal(a: &DynamicImage, b: &DynamicImage) -> bool {
    if a.dimensions() != b.dimensions() {
        return false;
    }
    a.to_rgba8().as_raw() == b.to_rgba8().as_raw()
}
