use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::{non_empty_env, response_json_or_error, PublishBackend};

const DEFAULT_API_BASE: &str = "https://freeimage.host/api/1/upload";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// freeimage.host uploader: one multipart POST per screenshot, hosted URL
/// taken from the `image.url` field of the JSON response. Not retried.
pub struct ImageHost {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl ImageHost {
    pub fn from_env() -> Result<Self> {
        let api_key = non_empty_env("FREEIMAGE_API_KEY").context("FREEIMAGE_API_KEY not set")?;
        let api_base =
            non_empty_env("FREEIMAGE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build upload HTTP client")?;
        Ok(Self {
            api_base,
            api_key,
            http,
        })
    }
}

impl PublishBackend for ImageHost {
    fn publish(&self, png_path: &Path) -> Result<String> {
        let bytes =
            std::fs::read(png_path).with_context(|| format!("failed reading {}", png_path.display()))?;
        let file_name = png_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "screenshot.png".to_string());
        let part = MultipartPart::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .context("invalid screenshot mime type")?;
        let form = MultipartForm::new()
            .text("key", self.api_key.clone())
            .text("action", "upload")
            .text("format", "json")
            .part("source", part);
        let response = self
            .http
            .post(&self.api_base)
            .multipart(form)
            .send()
            .with_context(|| format!("image upload request failed ({})", self.api_base))?;
        let parsed = response_json_or_error("image host", response)?;
        hosted_url(&parsed)
    }
}

fn hosted_url(payload: &Value) -> Result<String> {
    payload
        .get("image")
        .and_then(|image| image.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .context("image host response missing image.url")
}
