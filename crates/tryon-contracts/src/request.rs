use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GarmentCategory {
    UpperBody,
    LowerBody,
    FullBody,
}

impl GarmentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GarmentCategory::UpperBody => "upper_body",
            GarmentCategory::LowerBody => "lower_body",
            GarmentCategory::FullBody => "full_body",
        }
    }
}

impl fmt::Display for GarmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GarmentCategory {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "upper_body" | "upper" | "top" | "tops" => Ok(GarmentCategory::UpperBody),
            "lower_body" | "lower" | "bottom" | "bottoms" => Ok(GarmentCategory::LowerBody),
            "full_body" | "full" | "dress" | "dresses" | "one_pieces" | "one_piece" => {
                Ok(GarmentCategory::FullBody)
            }
            _ => Err(format!("unknown garment category '{raw}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Cascade,
    Race,
    Benchmark,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Cascade => "cascade",
            Strategy::Race => "race",
            Strategy::Benchmark => "benchmark",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cascade" | "fallback" | "sequential" => Ok(Strategy::Cascade),
            "race" | "first" => Ok(Strategy::Race),
            "benchmark" | "all" => Ok(Strategy::Benchmark),
            _ => Err(format!("unknown strategy '{raw}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Avatar,
    Garment,
}

impl ImageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageRole::Avatar => "avatar",
            ImageRole::Garment => "garment",
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageRole {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "avatar" | "person" | "model" => Ok(ImageRole::Avatar),
            "garment" | "product" | "clothing" => Ok(ImageRole::Garment),
            _ => Err(format!("unknown image role '{raw}'")),
        }
    }
}

/// Where an input image lives. Resolved to bytes by an image source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImageRef {
    Path(PathBuf),
    Url(String),
    DataUri(String),
}

impl ImageRef {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return ImageRef::Url(trimmed.to_string());
        }
        if lowered.starts_with("data:") {
            return ImageRef::DataUri(trimmed.to_string());
        }
        ImageRef::Path(PathBuf::from(trimmed))
    }

    pub fn describe(&self) -> String {
        match self {
            ImageRef::Path(path) => path.display().to_string(),
            ImageRef::Url(url) => url.clone(),
            ImageRef::DataUri(uri) => {
                let header = uri.split(',').next().unwrap_or("data:");
                format!("{header},<{} chars>", uri.len())
            }
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A try-on request. Fields are fixed once built; the job id doubles as the
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    job_id: String,
    avatar: ImageRef,
    garment: ImageRef,
    category: GarmentCategory,
    strategy: Strategy,
    providers: Vec<String>,
}

impl GenerationRequest {
    pub fn new(
        job_id: impl Into<String>,
        avatar: ImageRef,
        garment: ImageRef,
        category: GarmentCategory,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            avatar,
            garment,
            category,
            strategy: Strategy::default(),
            providers: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers = Vec::new();
        for provider in providers {
            let provider = provider.into().trim().to_ascii_lowercase();
            if provider.is_empty() || self.providers.contains(&provider) {
                continue;
            }
            self.providers.push(provider);
        }
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn avatar(&self) -> &ImageRef {
        &self.avatar
    }

    pub fn garment(&self) -> &ImageRef {
        &self.garment
    }

    pub fn category(&self) -> GarmentCategory {
        self.category
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Requested provider ids in priority order. Empty means "engine default".
    pub fn providers(&self) -> &[String] {
        &self.providers
    }
}

pub fn new_job_id() -> String {
    format!("job-{}", uuid::Uuid::new_v4().simple())
}
