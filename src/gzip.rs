// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Gzip body compression for both pipelines.
//!
//! Outgoing bodies are compressed and tagged with `content-encoding: gzip`.
//! Incoming bodies tagged that way are decompressed and re-tagged `identity`,
//! other deliveries pass through untouched. Bodies are fully buffered.

use crate::{
    errors::LinkError,
    interceptor::{Interceptor, Next},
    message::{AckStrategy, ConsumedMessage, PublishMessage},
};
use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use async_trait::async_trait;
use lapin::types::ShortString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub use async_compression::Level;

pub const GZIP_CONTENT_ENCODING: &str = "gzip";
/// Encoding set on deliveries once decompressed
pub const IDENTITY_CONTENT_ENCODING: &str = "identity";

pub struct GzipInterceptor {
    level: Level,
}

impl Default for GzipInterceptor {
    fn default() -> Self {
        Self::new(Level::Default)
    }
}

impl GzipInterceptor {
    pub fn new(level: Level) -> Self {
        GzipInterceptor { level }
    }

    async fn compress(&self, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        let mut encoder = GzipEncoder::with_quality(Vec::with_capacity(body.len()), self.level);

        let written = match encoder.write_all(body).await {
            Ok(_) => encoder.shutdown().await,
            Err(err) => Err(err),
        };

        match written {
            Ok(_) => Ok(encoder.into_inner()),
            Err(err) => {
                error!(error = err.to_string(), "failure to compress body");
                Err(LinkError::CompressionError(err.to_string()))
            }
        }
    }

    async fn decompress(&self, body: &[u8]) -> Result<Vec<u8>, LinkError> {
        let mut decoder = GzipDecoder::new(body);
        let mut decoded = Vec::with_capacity(body.len() * 2);

        match decoder.read_to_end(&mut decoded).await {
            Ok(_) => Ok(decoded),
            Err(err) => {
                error!(error = err.to_string(), "failure to decompress body");
                Err(LinkError::CompressionError(err.to_string()))
            }
        }
    }
}

fn is_gzip(encoding: &Option<ShortString>) -> bool {
    encoding
        .as_ref()
        .is_some_and(|enc| enc.as_str().eq_ignore_ascii_case(GZIP_CONTENT_ENCODING))
}

#[async_trait]
impl Interceptor<ConsumedMessage, AckStrategy> for GzipInterceptor {
    async fn intercept(
        &self,
        mut message: ConsumedMessage,
        cancellation: CancellationToken,
        next: Next<'_, ConsumedMessage, AckStrategy>,
    ) -> Result<AckStrategy, LinkError> {
        if is_gzip(message.properties.content_encoding()) {
            message.body = self.decompress(&message.body).await?;
            message.properties = message
                .properties
                .with_content_encoding(ShortString::from(IDENTITY_CONTENT_ENCODING));
        }

        next(message, cancellation).await
    }
}

#[async_trait]
impl Interceptor<PublishMessage, ()> for GzipInterceptor {
    async fn intercept(
        &self,
        mut message: PublishMessage,
        cancellation: CancellationToken,
        next: Next<'_, PublishMessage, ()>,
    ) -> Result<(), LinkError> {
        message.body = self.compress(&message.body).await?;
        message.properties = message
            .properties
            .with_content_encoding(ShortString::from(GZIP_CONTENT_ENCODING));

        next(message, cancellation).await
    }
}
