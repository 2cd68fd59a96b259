use anyhow::{anyhow, bail, Result};
use clap::ValueEnum;
use libwebp_sys::WebPImageHint;
use webp::WebPConfig;

pub const LOSSY_DEFAULT_QUALITY: f32 = 75.0;
pub const LOSSLESS_DEFAULT_QUALITY: f32 = 70.0;
pub const LOSSLESS_DEFAULT_LEVEL: i32 = 6;

/// libwebp's lossless presets: (method, quality) per level 0..=9.
const LOSSLESS_PRESETS: [(i32, f32); 10] = [
    (0, 0.0),
    (1, 20.0),
    (2, 25.0),
    (3, 30.0),
    (3, 50.0),
    (4, 50.0),
    (4, 75.0),
    (4, 90.0),
    (5, 90.0),
    (6, 100.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum Preset {
    Default,
    Photo,
    Picture,
    Drawing,
    Icon,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ImageHint {
    Photo,
    Picture,
    Graph,
}

impl ImageHint {
    pub fn value(self) -> WebPImageHint {
        match self {
            ImageHint::Photo => WebPImageHint::WEBP_HINT_PHOTO,
            ImageHint::Picture => WebPImageHint::WEBP_HINT_PICTURE,
            ImageHint::Graph => WebPImageHint::WEBP_HINT_GRAPH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum AlphaFilter {
    None,
    Fast,
    Best,
}

impl AlphaFilter {
    pub fn value(self) -> i32 {
        match self {
            AlphaFilter::None => 0,
            AlphaFilter::Fast => 1,
            AlphaFilter::Best => 2,
        }
    }
}

/// Encoder settings handed to every WebP job. Plain data, shared by clone.
#[derive(Clone)]
pub struct EncodeOptions {
    pub config: WebPConfig,
}

impl EncodeOptions {
    /// Default libwebp config adjusted by `preset`, the same field tweaks
    /// libwebp's own preset initializer applies.
    pub fn new(preset: Preset, quality: f32) -> Result<Self> {
        let mut config =
            WebPConfig::new().map_err(|_| anyhow!("libwebp config initialization failed"))?;
        config.quality = quality;

        match preset {
            Preset::Default => {}
            Preset::Picture => {
                config.sns_strength = 80;
                config.filter_sharpness = 4;
                config.filter_strength = 35;
                config.preprocessing &= !2;
            }
            Preset::Photo => {
                config.sns_strength = 80;
                config.filter_sharpness = 3;
                config.filter_strength = 30;
                config.preprocessing |= 2;
            }
            Preset::Drawing => {
                config.sns_strength = 25;
                config.filter_sharpness = 6;
                config.filter_strength = 10;
            }
            Preset::Icon => {
                config.sns_strength = 25;
                config.filter_sharpness = 6;
                config.preprocessing &= !2;
            }
            Preset::Text => {
                config.sns_strength = 0;
                config.filter_sharpness = 0;
                config.preprocessing &= !2;
                config.segments = 2;
            }
        }

        if !(0.0..=100.0).contains(&quality) {
            bail!("quality {quality} out of range [0, 100]");
        }
        Ok(Self { config })
    }

    /// Lossless preset: level 0 is fastest, 9 densest. Overrides method and
    /// quality like libwebp's `WebPConfigLosslessPreset`.
    pub fn setup_lossless_preset(&mut self, level: i32) -> Result<()> {
        if !(0..=9).contains(&level) {
            bail!("lossless preset level {level} out of range [0, 9]");
        }
        let (method, quality) = LOSSLESS_PRESETS[level as usize];
        self.config.lossless = 1;
        self.config.method = method;
        self.config.quality = quality;
        Ok(())
    }

    /// Range checks matching libwebp's `WebPValidateConfig`.
    pub fn validate(&self) -> Result<()> {
        let c = &self.config;
        check_range_f32("quality", c.quality, 0.0, 100.0)?;
        check_range("method", c.method, 0, 6)?;
        check_min("size", c.target_size, 0)?;
        check_min_f32("psnr", c.target_PSNR, 0.0)?;
        check_range("segments", c.segments, 1, 4)?;
        check_range("sns", c.sns_strength, 0, 100)?;
        check_range("strength", c.filter_strength, 0, 100)?;
        check_range("sharpness", c.filter_sharpness, 0, 7)?;
        check_range("filter type", c.filter_type, 0, 1)?;
        check_range("af", c.autofilter, 0, 1)?;
        check_range("pass", c.pass, 1, 10)?;
        check_range("partition_limit", c.partition_limit, 0, 100)?;
        check_range("pre", c.preprocessing, 0, 7)?;
        check_range("alpha_method", c.alpha_compression, 0, 1)?;
        check_range("alpha_filter", c.alpha_filtering, 0, 2)?;
        check_range("alpha quality", c.alpha_quality, 0, 100)?;
        check_range("near_lossless", c.near_lossless, 0, 100)?;
        if (c.image_hint as u32) >= (WebPImageHint::WEBP_HINT_LAST as u32) {
            bail!("invalid image hint");
        }
        Ok(())
    }
}

fn check_range(name: &str, value: i32, min: i32, max: i32) -> Result<()> {
    if value < min || value > max {
        bail!("{name} {value} out of range [{min}, {max}]");
    }
    Ok(())
}

fn check_range_f32(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !(min..=max).contains(&value) {
        bail!("{name} {value} out of range [{min}, {max}]");
    }
    Ok(())
}

fn check_min(name: &str, value: i32, min: i32) -> Result<()> {
    if value < min {
        bail!("{name} {value} must be at least {min}");
    }
    Ok(())
}

fn check_min_f32(name: &str, value: f32, min: f32) -> Result<()> {
    if value < min {
        bail!("{name} {value} must be at least {min}");
    }
    Ok(())
}

/// libwebp encoder version as "major.minor.revision".
pub fn encoder_version() -> String {
    let v = unsafe { libwebp_sys::WebPGetEncoderVersion() };
    format!("{}.{}.{}", (v >> 16) & 0xff, (v >> 8) & 0xff, v & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_passes_validation() {
        let opts = EncodeOptions::new(Preset::Default, 75.0).unwrap();
        opts.validate().unwrap();
        assert_eq!(opts.config.quality, 75.0);
    }

    #[test]
    fn presets_adjust_filter_fields() {
        let photo = EncodeOptions::new(Preset::Photo, 75.0).unwrap();
        assert_eq!(photo.config.sns_strength, 80);
        assert_eq!(photo.config.filter_sharpness, 3);
        assert_eq!(photo.config.filter_strength, 30);

        let text = EncodeOptions::new(Preset::Text, 75.0).unwrap();
        assert_eq!(text.config.sns_strength, 0);
        assert_eq!(text.config.segments, 2);
    }

    #[test]
    fn out_of_range_quality_is_rejected() {
        assert!(EncodeOptions::new(Preset::Default, 101.0).is_err());
        assert!(EncodeOptions::new(Preset::Default, -1.0).is_err());
    }

    #[test]
    fn lossless_preset_sets_method_and_quality() {
        let mut opts = EncodeOptions::new(Preset::Default, 75.0).unwrap();
        opts.setup_lossless_preset(LOSSLESS_DEFAULT_LEVEL).unwrap();
        assert_eq!(opts.config.lossless, 1);
        assert_eq!(opts.config.method, 4);
        assert_eq!(opts.config.quality, 75.0);

        opts.setup_lossless_preset(9).unwrap();
        assert_eq!(opts.config.method, 6);
        assert_eq!(opts.config.quality, 100.0);

        assert!(opts.setup_lossless_preset(10).is_err());
        assert!(opts.setup_lossless_preset(-1).is_err());
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let mut opts = EncodeOptions::new(Preset::Default, 75.0).unwrap();
        opts.config.segments = 5;
        assert!(opts.validate().is_err());

        let mut opts = EncodeOptions::new(Preset::Default, 75.0).unwrap();
        opts.config.pass = 0;
        assert!(opts.validate().is_err());

        let mut opts = EncodeOptions::new(Preset::Default, 75.0).unwrap();
        opts.config.alpha_filtering = 3;
        assert!(opts.validate().is_err());
    }
}
