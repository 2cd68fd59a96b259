use crate::imagex::{self, MetaChunks, Registry, TAG_EXIF, TAG_ICCP, TAG_XMP};
use crate::iox::{Input, Output};
use crate::options::EncodeOptions;
use crate::riff;
use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::{self, BufReader, BufWriter, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Convert,
    Copy,
}

/// Maps an input byte stream to an output byte stream. The set is closed:
/// either a WebP encode or a verbatim copy.
pub enum Codec {
    Copy,
    WebP(WebPCodec),
}

impl Codec {
    pub fn kind(&self) -> JobKind {
        match self {
            Codec::Copy => JobKind::Copy,
            Codec::WebP(_) => JobKind::Convert,
        }
    }

    /// Fatal problems come back as the error; non-fatal ones accumulate in
    /// `warnings`.
    pub fn convert(
        &self,
        input: &mut Input,
        output: &mut Output,
        registry: &Registry,
        warnings: &mut Vec<anyhow::Error>,
    ) -> Result<()> {
        match self {
            Codec::Copy => copy_stream(input, output),
            Codec::WebP(codec) => codec.convert(input, output, registry, warnings),
        }
    }
}

fn copy_stream(input: &mut Input, output: &mut Output) -> Result<()> {
    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    io::copy(&mut reader, &mut writer).context("copy failed")?;
    writer.flush().context("flush output failed")?;
    Ok(())
}

pub struct WebPCodec {
    pub opts: EncodeOptions,
    pub copy_meta: bool,
    pub check_image: bool,
}

impl WebPCodec {
    fn convert(
        &self,
        input: &mut Input,
        output: &mut Output,
        registry: &Registry,
        warnings: &mut Vec<anyhow::Error>,
    ) -> Result<()> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).context("read image failed")?;

        let (img, _, chunks) = registry.decode(&data).context("decode image failed")?;

        let (width, height) = img.dimensions();
        let encoded = if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            webp::Encoder::from_rgba(rgba.as_raw(), width, height)
                .encode_advanced(&self.opts.config)
        } else {
            let rgb = img.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), width, height)
                .encode_advanced(&self.opts.config)
        };
        let mut webp_data = encoded
            .map_err(|e| anyhow!("encode failed: {e:?}"))?
            .to_vec();

        if self.opts.config.lossless == 1 && self.check_image {
            match webp::Decoder::new(&webp_data).decode() {
                Some(decoded) => {
                    let decoded_img = if decoded.is_alpha() {
                        image::RgbaImage::from_raw(
                            decoded.width(),
                            decoded.height(),
                            decoded.to_vec(),
                        )
                        .map(image::DynamicImage::ImageRgba8)
                    } else {
                        image::RgbImage::from_raw(
                            decoded.width(),
                            decoded.height(),
                            decoded.to_vec(),
                        )
                        .map(image::DynamicImage::ImageRgb8)
                    };
                    match decoded_img {
                        Some(decoded_img) => {
                            if !imagex::is_image_equal(&img, &decoded_img) {
                                warnings.push(anyhow!("lossless options on, but image not equal"));
                            }
                        }
                        None => {
                            warnings.push(anyhow!("decode failed when comparing lossless image"));
                        }
                    }
                }
                None => {
                    warnings.push(anyhow!("decode failed when comparing lossless image"));
                }
            }
        }

        if self.copy_meta && !chunks.is_empty() {
            webp_data = splice_metadata(webp_data, &chunks, warnings);
        }

        output
            .write_all(&webp_data)
            .context("write to output failed")?;
        Ok(())
    }
}

/// Splices ICC profile, EXIF and XMP in that order. Each failed splice
/// becomes a warning and leaves the buffer as it was.
fn splice_metadata(
    mut webp_data: Vec<u8>,
    chunks: &MetaChunks,
    warnings: &mut Vec<anyhow::Error>,
) -> Vec<u8> {
    for (fourcc, tag) in [
        (riff::CHUNK_ICCP, TAG_ICCP),
        (riff::CHUNK_EXIF, TAG_EXIF),
        (riff::CHUNK_XMP, TAG_XMP),
    ] {
        let Some(payload) = chunks.get(tag) else {
            continue;
        };
        match riff::set_chunk(&webp_data, fourcc, payload) {
            Ok(spliced) => webp_data = spliced,
            Err(e) => warnings.push(e.context(format!("set {tag} failed"))),
        }
    }
    webp_data
}
