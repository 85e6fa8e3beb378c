//! Input normalization for provider calls.
//!
//! Avatars become a 3:4 portrait JPEG at a fixed resolution; garments are
//! flattened and capped in size but otherwise left alone. Decode or encode
//! failures never fail a request: the fetched bytes are passed through
//! unchanged and the reason is recorded on the prepared image.

use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tracing::{debug, warn};
use tryon_contracts::request::{GenerationRequest, ImageRef, ImageRole};

use crate::error::{FetchError, PreprocessError};
use crate::fetch::ImageSource;

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub avatar_width: u32,
    pub avatar_height: u32,
    /// Avatars wider than `height * landscape_ratio` are rotated upright.
    pub landscape_ratio: f64,
    pub garment_max_side: u32,
    pub jpeg_quality: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            avatar_width: 768,
            avatar_height: 1024,
            landscape_ratio: 1.2,
            garment_max_side: 1024,
            jpeg_quality: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub role: ImageRole,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Set when normalization failed and `bytes` are the original payload.
    pub degraded_reason: Option<String>,
}

impl PreparedImage {
    pub fn passthrough(role: ImageRole, bytes: Vec<u8>, reason: String) -> Self {
        let mime_type = image::guess_format(&bytes)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Self {
            role,
            bytes,
            mime_type,
            width: None,
            height: None,
            degraded_reason: Some(reason),
        }
    }

    pub fn is_normalized(&self) -> bool {
        self.degraded_reason.is_none()
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

/// Both inputs of one request, fetched and normalized once and shared by
/// every provider attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInputs {
    pub avatar: PreparedImage,
    pub garment: PreparedImage,
}

#[derive(Clone)]
pub struct ImagePreprocessor {
    source: Arc<dyn ImageSource>,
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    pub fn new(source: Arc<dyn ImageSource>, config: PreprocessConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Fetch then normalize. Only the fetch can fail.
    pub async fn prepare(
        &self,
        image: &ImageRef,
        role: ImageRole,
    ) -> Result<PreparedImage, FetchError> {
        let bytes = self.source.fetch_bytes(image).await?;
        Ok(self.normalize(bytes, role).await)
    }

    pub async fn prepare_inputs(
        &self,
        request: &GenerationRequest,
    ) -> Result<PreparedInputs, (ImageRole, FetchError)> {
        let (avatar, garment) = tokio::join!(
            self.prepare(request.avatar(), ImageRole::Avatar),
            self.prepare(request.garment(), ImageRole::Garment),
        );
        Ok(PreparedInputs {
            avatar: avatar.map_err(|err| (ImageRole::Avatar, err))?,
            garment: garment.map_err(|err| (ImageRole::Garment, err))?,
        })
    }

    /// Pixel work runs on the blocking pool. Falls back to `bytes` on failure.
    pub async fn normalize(&self, bytes: Vec<u8>, role: ImageRole) -> PreparedImage {
        let config = self.config.clone();
        let original = bytes.clone();
        let joined = tokio::task::spawn_blocking(move || normalize_bytes(&bytes, role, &config))
            .await
            .map_err(|err| PreprocessError::Join(err.to_string()));
        match joined.and_then(|result| result) {
            Ok(prepared) => {
                debug!(
                    role = %role,
                    width = prepared.width,
                    height = prepared.height,
                    bytes = prepared.bytes.len(),
                    "normalized input image"
                );
                prepared
            }
            Err(err) => {
                warn!(role = %role, error = %err, "preprocessing failed; using original bytes");
                PreparedImage::passthrough(role, original, err.to_string())
            }
        }
    }
}

pub fn normalize_bytes(
    bytes: &[u8],
    role: ImageRole,
    config: &PreprocessConfig,
) -> Result<PreparedImage, PreprocessError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| PreprocessError::Decode {
        role,
        message: err.to_string(),
    })?;
    match role {
        ImageRole::Avatar => {
            let prepared = normalize_avatar(decoded, config);
            let (width, height) = prepared.dimensions();
            let bytes = encode_jpeg(prepared, config.jpeg_quality).map_err(|message| {
                PreprocessError::Encode { role, message }
            })?;
            Ok(PreparedImage {
                role,
                bytes,
                mime_type: "image/jpeg".to_string(),
                width: Some(width),
                height: Some(height),
                degraded_reason: None,
            })
        }
        ImageRole::Garment => {
            let prepared = normalize_garment(decoded, config);
            let (width, height) = prepared.dimensions();
            let bytes = encode_png(prepared)
                .map_err(|message| PreprocessError::Encode { role, message })?;
            Ok(PreparedImage {
                role,
                bytes,
                mime_type: "image/png".to_string(),
                width: Some(width),
                height: Some(height),
                degraded_reason: None,
            })
        }
    }
}

pub fn normalize_avatar(image: DynamicImage, config: &PreprocessConfig) -> RgbImage {
    let mut image = image;
    if f64::from(image.width()) > f64::from(image.height()) * config.landscape_ratio {
        image = image.rotate90();
    }
    let flattened = flatten_onto_white(&image);
    let padded = pad_to_aspect(&flattened, config.avatar_width, config.avatar_height);
    image::imageops::resize(
        &padded,
        config.avatar_width,
        config.avatar_height,
        FilterType::CatmullRom,
    )
}

pub fn normalize_garment(image: DynamicImage, config: &PreprocessConfig) -> RgbImage {
    let flattened = flatten_onto_white(&image);
    let longest = flattened.width().max(flattened.height());
    let max_side = config.garment_max_side.max(1);
    if longest <= max_side {
        return flattened;
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let width = ((f64::from(flattened.width()) * scale).round() as u32).max(1);
    let height = ((f64::from(flattened.height()) * scale).round() as u32).max(1);
    image::imageops::resize(&flattened, width, height, FilterType::CatmullRom)
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

/// Centers `image` on a white canvas with the `target_w:target_h` aspect.
fn pad_to_aspect(image: &RgbImage, target_w: u32, target_h: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let target_w = u64::from(target_w.max(1));
    let target_h = u64::from(target_h.max(1));
    let (w, h) = (u64::from(width), u64::from(height));
    let (canvas_w, canvas_h) = if w * target_h > h * target_w {
        (w, (w * target_h).div_ceil(target_w))
    } else {
        ((h * target_w).div_ceil(target_h), h)
    };
    let (canvas_w, canvas_h) = (canvas_w as u32, canvas_h as u32);
    if canvas_w == width && canvas_h == height {
        return image.clone();
    }
    let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, Rgb([255, 255, 255]));
    let offset_x = i64::from((canvas_w - width) / 2);
    let offset_y = i64::from((canvas_h - height) / 2);
    image::imageops::overlay(&mut canvas, image, offset_x, offset_y);
    canvas
}

fn encode_jpeg(image: RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode_image(&DynamicImage::ImageRgb8(image))
        .map_err(|err| err.to_string())?;
    Ok(bytes)
}

fn encode_png(image: RgbImage) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| err.to_string())?;
    Ok(cursor.into_inner())
}
