//! Re-encoding of generated images as lossy WebP.
//!
//! WebP can only carry metadata as EXIF, so the PNG text chunks NovelAI writes are
//! folded into the EXIF `UserComment` tag as a JSON object. When the generation
//! record in the `Comment` chunk can be read, a caption in the style other image
//! viewers understand is added next to it.

use exif::{experimental::Writer, Field, In, Tag};
use image::{DynamicImage, ImageFormat};
use img_parts::{webp::WebP, ImageEXIF};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{ser::PrettyFormatter, Map, Value};
use std::io::Cursor;

use crate::{request::Sampler, GenError, Result};

const COMMENT_KEY: &str = "Comment";
const FALLBACK_SAMPLER_LABEL: &str = "Euler a";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeOptions {
    /// 0 to 100, higher is better looking and bigger
    pub quality: f32,
    /// 0 to 6, higher is slower and smaller
    pub method: i32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: 75.0,
            method: 4,
        }
    }
}

/// A decoded image together with the text metadata it was stored with
#[derive(Debug, Clone)]
pub struct SourceImage {
    image: DynamicImage,
    info: IndexMap<String, String>,
}

impl SourceImage {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            info: IndexMap::new(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// Decodes `data`. For PNG input the text chunks ahead of the image data are
    /// kept as the info block.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(data)?;
        let info = match image::guess_format(data) {
            Ok(ImageFormat::Png) => png_text(data)?,
            _ => IndexMap::new(),
        };

        Ok(Self { image, info })
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn info(&self) -> &IndexMap<String, String> {
        &self.info
    }
}

fn png_text(data: &[u8]) -> Result<IndexMap<String, String>> {
    let reader = png::Decoder::new(Cursor::new(data)).read_info()?;
    let info = reader.info();

    let mut text = IndexMap::new();
    for chunk in &info.uncompressed_latin1_text {
        text.insert(chunk.keyword.clone(), chunk.text.clone());
    }
    for chunk in &info.compressed_latin1_text {
        text.insert(chunk.keyword.clone(), chunk.get_text()?);
    }
    for chunk in &info.utf8_text {
        text.insert(chunk.keyword.clone(), chunk.get_text()?);
    }

    Ok(text)
}

/// Re-encode `source` as lossy WebP.
///
/// Explicit `metadata` is written as given. Without it the image's own info block
/// is used, if it has one. A `Comment` that doesn't hold a readable generation
/// record is carried over untouched.
pub fn encode_webp(
    source: &SourceImage,
    metadata: Option<&[Field]>,
    options: &EncodeOptions,
) -> Result<Vec<u8>> {
    let tags = match metadata {
        Some(fields) if !fields.is_empty() => Some(write_exif(fields)?),
        _ if source.info.is_empty() => None,
        _ => {
            let (width, height) = (source.image.width(), source.image.height());
            let comment = info_comment(&source.info, width, height)?;
            let field = Field {
                tag: Tag::UserComment,
                ifd_num: In::PRIMARY,
                value: exif::Value::Undefined(comment, 0),
            };
            Some(write_exif(std::slice::from_ref(&field))?)
        }
    };

    let encoded = lossy_webp(&source.image, options)?;
    let Some(tags) = tags else {
        return Ok(encoded);
    };

    let mut container = WebP::from_bytes(encoded.into())?;
    container.set_exif(Some(tags.into()));
    Ok(container.encoder().bytes().to_vec())
}

fn lossy_webp(image: &DynamicImage, options: &EncodeOptions) -> Result<Vec<u8>> {
    // libwebp only takes 8-bit RGB(A)
    let image = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };

    let encoder =
        webp::Encoder::from_image(&image).map_err(|e| GenError::WebpEncode(e.to_string()))?;
    let mut config = libwebp_sys::WebPConfig::new()
        .map_err(|_| GenError::WebpEncode("could not initialize encoder config".into()))?;
    config.lossless = 0;
    config.quality = options.quality;
    config.method = options.method;

    let memory = encoder
        .encode_advanced(&config)
        .map_err(|e| GenError::WebpEncode(format!("{e:?}")))?;

    Ok(memory.to_vec())
}

fn write_exif(fields: &[Field]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    for field in fields {
        writer.push_field(field);
    }

    let mut buf = Cursor::new(Vec::new());
    writer.write(&mut buf, false)?;
    Ok(buf.into_inner())
}

fn info_comment(info: &IndexMap<String, String>, width: u32, height: u32) -> Result<Vec<u8>> {
    let record = info.get(COMMENT_KEY).and_then(|c| GenerationRecord::parse(c));

    let mut items = Map::new();
    for (key, value) in info {
        if record.is_some() && key == COMMENT_KEY {
            continue;
        }
        items.insert(key.clone(), Value::String(value.clone()));
    }

    if let Some(record) = record {
        let description = info.get("Description").map(String::as_str).unwrap_or_default();
        let caption = record.caption(description, width, height);
        items.insert("NovelAIComment".into(), record.raw);
        items.insert("exif comment".into(), Value::String(caption));
    }

    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    items.serialize(&mut ser)?;
    Ok(out)
}

/// The generation parameters NovelAI stores as JSON in the `Comment` chunk
struct GenerationRecord {
    raw: Value,
    uc: String,
    steps: String,
    scale: String,
    seed: String,
    sampler: &'static str,
}

impl GenerationRecord {
    fn parse(comment: &str) -> Option<Self> {
        let raw = match serde_json::from_str::<Value>(comment) {
            Ok(raw @ Value::Object(_)) => raw,
            Ok(_) => return None,
            Err(e) => {
                tracing::debug!(%e, "comment is not a generation record");
                return None;
            }
        };

        let field = |key: &str| raw.get(key).map(plain);
        let sampler = raw
            .get("sampler")
            .and_then(Value::as_str)
            .and_then(|s| Sampler::try_from(s).ok())
            .map_or(FALLBACK_SAMPLER_LABEL, |s| s.caption_label());

        Some(Self {
            uc: field("uc")?,
            steps: field("steps")?,
            scale: field("scale")?,
            seed: field("seed")?,
            sampler,
            raw,
        })
    }

    fn caption(&self, description: &str, width: u32, height: u32) -> String {
        format!(
            "{description}\n\
             Negative prompt: {}\n\
             Steps: {}, Sampler: {}, CFG scale: {}, Seed: {}, Size: {width}x{height}, Clip skip: 2, ENSD: 31337",
            self.uc, self.steps, self.sampler, self.scale, self.seed,
        )
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use image::RgbImage;
    use serde_json::json;

    use super::*;

    fn png_with_text(chunks: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, 8, 8);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            for (key, text) in chunks {
                encoder.add_text_chunk(key.to_string(), text.to_string()).unwrap();
            }
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[128u8; 8 * 8 * 3]).unwrap();
        }
        out
    }

    fn exif_of(webp: &[u8]) -> Option<exif::Exif> {
        let container = WebP::from_bytes(Bytes::copy_from_slice(webp)).unwrap();
        let raw = container.exif()?;
        Some(exif::Reader::new().read_raw(raw.to_vec()).unwrap())
    }

    fn user_comment(webp: &[u8]) -> Value {
        let exif = exif_of(webp).expect("exif chunk");
        let field = exif.get_field(Tag::UserComment, In::PRIMARY).unwrap();
        match &field.value {
            exif::Value::Undefined(bytes, _) => serde_json::from_slice(bytes).unwrap(),
            other => panic!("unexpected value {other:?}"),
        }
    }

    fn assert_lossy_webp(data: &[u8]) {
        assert_eq!(&data[..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
        assert!(data.windows(4).any(|w| w == b"VP8 "));
        assert!(!data.windows(4).any(|w| w == b"VP8L"));
    }

    #[test]
    fn reads_png_text_chunks_in_order() {
        let data = png_with_text(&[("Title", "AI generated image"), ("Description", "1girl")]);
        let source = SourceImage::from_bytes(&data).unwrap();

        let keys: Vec<_> = source.info().keys().map(String::as_str).collect();
        assert_eq!(keys, ["Title", "Description"]);
        assert_eq!(source.image().width(), 8);
    }

    #[test]
    fn generation_record_becomes_caption() {
        let comment = json!({
            "uc": "lowres", "steps": 28, "scale": 5.0, "seed": 1234, "sampler": "k_euler_ancestral"
        });
        let data = png_with_text(&[
            ("Description", "1girl, solo"),
            ("Comment", &comment.to_string()),
            ("Software", "NovelAI"),
        ]);
        let source = SourceImage::from_bytes(&data).unwrap();

        let webp = encode_webp(&source, None, &EncodeOptions::default()).unwrap();
        assert_lossy_webp(&webp);

        let items = user_comment(&webp);
        assert!(items.get("Comment").is_none());
        assert_eq!(items["NovelAIComment"], comment);
        assert_eq!(items["Software"], json!("NovelAI"));
        assert_eq!(
            items["exif comment"],
            json!(
                "1girl, solo\nNegative prompt: lowres\nSteps: 28, Sampler: Euler a, CFG scale: 5.0, \
                 Seed: 1234, Size: 8x8, Clip skip: 2, ENSD: 31337"
            )
        );
    }

    #[test]
    fn malformed_comment_passes_through() {
        let data = png_with_text(&[("Description", "x"), ("Comment", "{not json")]);
        let source = SourceImage::from_bytes(&data).unwrap();

        let webp = encode_webp(&source, None, &EncodeOptions::default()).unwrap();
        let items = user_comment(&webp);
        assert_eq!(items, json!({"Description": "x", "Comment": "{not json"}));
    }

    #[test]
    fn incomplete_record_passes_through() {
        let source = SourceImage::new(DynamicImage::ImageRgb8(RgbImage::new(4, 4)))
            .with_info("Comment", r#"{"steps": 28}"#);

        let webp = encode_webp(&source, None, &EncodeOptions::default()).unwrap();
        assert_eq!(user_comment(&webp), json!({"Comment": r#"{"steps": 28}"#}));
    }

    #[test]
    fn no_info_means_no_exif() {
        let source = SourceImage::new(DynamicImage::ImageRgb8(RgbImage::new(4, 4)));
        let webp = encode_webp(&source, None, &EncodeOptions::default()).unwrap();

        assert_lossy_webp(&webp);
        assert!(exif_of(&webp).is_none());
    }

    #[test]
    fn explicit_metadata_wins() {
        let source = SourceImage::new(DynamicImage::ImageRgb8(RgbImage::new(4, 4)))
            .with_info("Comment", "ignored");
        let fields = [Field {
            tag: Tag::ImageDescription,
            ifd_num: In::PRIMARY,
            value: exif::Value::Ascii(vec![b"hello".to_vec()]),
        }];

        let webp = encode_webp(&source, Some(&fields), &EncodeOptions::default()).unwrap();
        let exif = exif_of(&webp).unwrap();
        let description = exif.get_field(Tag::ImageDescription, In::PRIMARY).unwrap();
        assert!(matches!(&description.value, exif::Value::Ascii(v) if v == &[b"hello".to_vec()]));
        assert!(exif.get_field(Tag::UserComment, In::PRIMARY).is_none());
    }
}
