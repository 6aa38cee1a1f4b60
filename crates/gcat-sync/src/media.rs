//! Image download and multipart upload for created catalog entries.

use std::sync::Arc;

use futures::future::join_all;
use gcat_core::{media_filename, media_plan, CatalogEntry, EntityKind, MediaAsset, MediaField, Product};
use gcat_storage::{FetchError, HttpFetcher};
use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

const TOKEN_LEN: usize = 22;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("download of {url} failed: {source}")]
    Download { url: String, source: FetchError },
    #[error("upload of {filename} failed: {source}")]
    Submit {
        filename: String,
        source: FetchError,
    },
}

/// Fresh lowercase alphanumeric token for upload filenames.
pub fn random_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadTally {
    pub uploaded: Vec<MediaAsset>,
    pub failed: usize,
}

pub struct MediaUploader {
    http: Arc<HttpFetcher>,
    upload_url: String,
    api_token: Option<String>,
}

impl MediaUploader {
    pub fn new(http: Arc<HttpFetcher>, upload_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http,
            upload_url: upload_url.into(),
            api_token,
        }
    }

    /// Downloads `image_url` and attaches it to `entry` under `field`.
    pub async fn upload(
        &self,
        image_url: &str,
        entry: &CatalogEntry,
        field: MediaField,
    ) -> Result<MediaAsset, UploadError> {
        let image = self
            .http
            .fetch_bytes(image_url)
            .await
            .map_err(|source| UploadError::Download {
                url: image_url.to_string(),
                source,
            })?;

        let filename = media_filename(&entry.slug, &random_token());
        info!(field = field.as_str(), filename = %filename, entry_id = entry.id, "uploading image");

        let submit_err = |source| UploadError::Submit {
            filename: filename.clone(),
            source,
        };
        let part = Part::bytes(image.body)
            .file_name(filename.clone())
            .mime_str("image/jpeg")
            .map_err(|e| submit_err(FetchError::Request(e)))?;
        let form = Form::new()
            .text("refId", entry.id.to_string())
            .text("ref", EntityKind::Game.uid())
            .text("field", field.as_str())
            .part("files", part);

        self.http
            .post_multipart(&self.upload_url, form, self.api_token.as_deref())
            .await
            .map_err(submit_err)?;

        Ok(MediaAsset {
            source_url: image_url.to_string(),
            field,
            filename,
        })
    }

    /// Cover plus up to five screenshots, all concurrently. Failures never touch the entry.
    pub async fn upload_all(&self, product: &Product, entry: &CatalogEntry) -> UploadTally {
        let plan = media_plan(product);
        let results = join_all(
            plan.iter()
                .map(|(url, field)| self.upload(url, entry, *field)),
        )
        .await;

        let mut tally = UploadTally::default();
        for result in results {
            match result {
                Ok(asset) => tally.uploaded.push(asset),
                Err(err) => {
                    warn!(operation = "upload_image", entry = %entry.slug, error = %err, "image upload failed");
                    tally.failed += 1;
                }
            }
        }
        tally
    }
}
