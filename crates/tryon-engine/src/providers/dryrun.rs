use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use sha2::{Digest, Sha256};
use tracing::debug;
use tryon_contracts::outcome::GeneratedImage;
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::GarmentCategory;

use super::ProviderAdapter;
use crate::config::non_empty_env;
use crate::context::CallContext;
use crate::error::ProviderError;
use crate::preprocess::PreparedImage;

const CANVAS_WIDTH: u32 = 768;
const CANVAS_HEIGHT: u32 = 1024;

/// Offline provider: pastes the garment over the avatar inside a fixed
/// placement box. Same inputs always produce the same bytes.
#[derive(Debug, Clone, Default)]
pub struct DryrunAdapter {
    latency: Duration,
}

impl DryrunAdapter {
    pub fn from_env() -> Self {
        let latency = non_empty_env("TRYON_DRYRUN_LATENCY_MS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        Self { latency }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Placement box as fractions of the canvas: (left, top, right, bottom).
    pub fn placement(category: GarmentCategory) -> (f64, f64, f64, f64) {
        match category {
            GarmentCategory::UpperBody => (0.2, 0.18, 0.8, 0.55),
            GarmentCategory::LowerBody => (0.25, 0.48, 0.75, 0.92),
            GarmentCategory::FullBody => (0.2, 0.18, 0.8, 0.92),
        }
    }
}

impl NamedProvider for DryrunAdapter {
    fn name(&self) -> &str {
        "dryrun"
    }
}

#[async_trait]
impl ProviderAdapter for DryrunAdapter {
    fn is_configured(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        avatar: &PreparedImage,
        garment: &PreparedImage,
        category: GarmentCategory,
    ) -> Result<GeneratedImage, ProviderError> {
        if !self.latency.is_zero() {
            ctx.sleep(self.latency).await?;
        }
        ctx.mark_response_started();
        let avatar_bytes = avatar.bytes.clone();
        let garment_bytes = garment.bytes.clone();
        let task = tokio::task::spawn_blocking(move || {
            composite(&avatar_bytes, &garment_bytes, category)
        });
        let bytes = ctx
            .call(async {
                task.await
                    .map_err(|err| ProviderError::Malformed(format!("dryrun composite task: {err}")))?
            })
            .await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        debug!(category = %category, digest = %&digest[..12], "dryrun composite ready");
        Ok(GeneratedImage {
            bytes,
            mime_type: "image/png".to_string(),
            width: Some(CANVAS_WIDTH),
            height: Some(CANVAS_HEIGHT),
            source_url: Some(format!("dryrun://{}", &digest[..16])),
        })
    }
}

fn composite(
    avatar: &[u8],
    garment: &[u8],
    category: GarmentCategory,
) -> Result<Vec<u8>, ProviderError> {
    let mut canvas = match image::load_from_memory(avatar) {
        Ok(decoded) => image::imageops::resize(
            &decoded.to_rgba8(),
            CANVAS_WIDTH,
            CANVAS_HEIGHT,
            FilterType::Triangle,
        ),
        Err(_) => RgbaImage::from_pixel(CANVAS_WIDTH, CANVAS_HEIGHT, Rgba([255, 255, 255, 255])),
    };
    if let Ok(decoded) = image::load_from_memory(garment) {
        let (left, top, right, bottom) = DryrunAdapter::placement(category);
        let box_x = (f64::from(CANVAS_WIDTH) * left) as i64;
        let box_y = (f64::from(CANVAS_HEIGHT) * top) as i64;
        let box_w = ((f64::from(CANVAS_WIDTH) * (right - left)) as u32).max(1);
        let box_h = ((f64::from(CANVAS_HEIGHT) * (bottom - top)) as u32).max(1);
        let fitted = decoded.resize(box_w, box_h, FilterType::Triangle).to_rgba8();
        let offset_x = box_x + i64::from((box_w - fitted.width().min(box_w)) / 2);
        let offset_y = box_y + i64::from((box_h - fitted.height().min(box_h)) / 2);
        image::imageops::overlay(&mut canvas, &fitted, offset_x, offset_y);
    }
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| ProviderError::Malformed(format!("dryrun encode failed: {err}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
    use tryon_contracts::request::{GarmentCategory, ImageRole};

    use super::DryrunAdapter;
    use crate::context::{CallContext, CancelSignal};
    use crate::error::ProviderError;
    use crate::preprocess::PreparedImage;
    use crate::providers::ProviderAdapter;

    fn solid(width: u32, height: u32, pixel: Rgba<u8>, role: ImageRole) -> PreparedImage {
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, pixel))
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap_or_default();
        PreparedImage::passthrough(role, cursor.into_inner(), "test".to_string())
    }

    #[tokio::test]
    async fn composite_is_deterministic_and_places_garment() -> anyhow::Result<()> {
        let adapter = DryrunAdapter::new();
        let avatar = solid(30, 40, Rgba([0, 0, 255, 255]), ImageRole::Avatar);
        let garment = solid(10, 10, Rgba([255, 0, 0, 255]), ImageRole::Garment);
        let ctx = CallContext::new(CancelSignal::new());

        let first = adapter
            .invoke(&ctx, &avatar, &garment, GarmentCategory::UpperBody)
            .await?;
        let second = adapter
            .invoke(&ctx, &avatar, &garment, GarmentCategory::UpperBody)
            .await?;
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.source_url, second.source_url);
        assert!(first
            .source_url
            .as_deref()
            .is_some_and(|url| url.starts_with("dryrun://")));

        let decoded = image::load_from_memory(&first.bytes)?;
        assert_eq!(decoded.dimensions(), (768, 1024));
        // torso centre carries the garment, feet keep the avatar
        assert_eq!(decoded.get_pixel(384, 370), Rgba([255, 0, 0, 255]));
        assert_eq!(decoded.get_pixel(384, 1000), Rgba([0, 0, 255, 255]));
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_avatar_uses_white_canvas() -> anyhow::Result<()> {
        let adapter = DryrunAdapter::new();
        let avatar = PreparedImage::passthrough(ImageRole::Avatar, b"junk".to_vec(), "x".into());
        let garment = solid(10, 10, Rgba([255, 0, 0, 255]), ImageRole::Garment);
        let image = adapter
            .invoke(
                &CallContext::new(CancelSignal::new()),
                &avatar,
                &garment,
                GarmentCategory::LowerBody,
            )
            .await?;
        let decoded = image::load_from_memory(&image.bytes)?;
        assert_eq!(decoded.get_pixel(10, 10), Rgba([255, 255, 255, 255]));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_latency_honours_deadline() {
        let adapter = DryrunAdapter::new().with_latency(Duration::from_secs(30));
        let avatar = solid(4, 4, Rgba([0, 0, 0, 255]), ImageRole::Avatar);
        let garment = solid(4, 4, Rgba([0, 0, 0, 255]), ImageRole::Garment);
        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(1));
        let result = adapter
            .invoke(&ctx, &avatar, &garment, GarmentCategory::FullBody)
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout { responding: false })));
    }
}
