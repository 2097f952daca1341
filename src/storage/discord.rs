//! Discord channel used as a best-effort object store.
//!
//! Each object is one message whose content is `media-key:{key}` with the
//! payload attached. Lookups scan the channel backwards, newest first, over a
//! bounded window of recent messages; objects that scroll out of that window
//! are no longer addressable.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, SyncByteStream, ensure_key_present,
    file_name_of, resolve_content_type,
};
use crate::{
    config::DiscordConfig,
    models::file_object::{FileObject, ProviderType, UploadOptions},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    Client, Response, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER},
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::{io, time::Duration};
use tracing::{debug, warn};

const KEY_MARKER: &str = "media-key:";
/// Message content is capped at 2000 characters; leave room for the marker.
const MAX_KEY_LEN: usize = 1900;
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    size: u64,
    url: String,
    content_type: Option<String>,
}

#[derive(Deserialize)]
struct RateLimited {
    retry_after: f64,
}

pub struct DiscordProvider {
    api: Client,
    /// Attachment downloads go to the CDN without the bot token.
    cdn: Client,
    api_base: String,
    channel_id: String,
    max_file_size: u64,
    search_limit: usize,
}

impl DiscordProvider {
    pub async fn new(config: &DiscordConfig) -> StorageResult<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(StorageError::InvalidArgument("Discord bot token must be set".into()));
        }
        if config.channel_id.trim().is_empty() {
            return Err(StorageError::InvalidArgument("Discord channel id must be set".into()));
        }

        let mut auth = HeaderValue::from_str(&format!("Bot {}", config.bot_token.trim()))
            .map_err(|_| StorageError::InvalidArgument("Discord bot token is not a valid header".into()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let api = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("media-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| StorageError::Unknown(err.to_string()))?;
        let cdn = Client::builder()
            .build()
            .map_err(|err| StorageError::Unknown(err.to_string()))?;

        let provider = Self {
            api,
            cdn,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            channel_id: config.channel_id.trim().to_string(),
            max_file_size: config.max_file_size,
            search_limit: config.search_limit,
        };

        provider.fetch_channel().await.map_err(|err| match err {
            StorageError::NotFound(_) => StorageError::InvalidArgument(format!(
                "Discord channel {} does not exist or is not visible to the bot",
                provider.channel_id
            )),
            other => other,
        })?;
        debug!(channel = %provider.channel_id, "Discord channel reachable");
        Ok(provider)
    }

    fn channel_url(&self) -> String {
        format!("{}/channels/{}", self.api_base, self.channel_id)
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.channel_url())
    }

    async fn fetch_channel(&self) -> StorageResult<()> {
        let response = self
            .api
            .get(self.channel_url())
            .send()
            .await
            .map_err(map_reqwest)?;
        check(response, &self.channel_id).await?;
        Ok(())
    }

    /// Newest message carrying `key`, within the configured search window.
    async fn find_message(&self, key: &str) -> StorageResult<Option<Message>> {
        Ok(self.matching_messages(key, true).await?.into_iter().next())
    }

    /// Messages carrying `key`, newest first. Scans backwards page by page
    /// until the window is exhausted, or the first hit when `first_only`.
    async fn matching_messages(&self, key: &str, first_only: bool) -> StorageResult<Vec<Message>> {
        let marker = marker_for(key);
        let mut before: Option<String> = None;
        let mut remaining = self.search_limit;
        let mut found = Vec::new();

        while remaining > 0 {
            let limit = remaining.min(PAGE_SIZE);
            let mut request = self
                .api
                .get(self.messages_url())
                .query(&[("limit", limit.to_string())]);
            if let Some(before) = &before {
                request = request.query(&[("before", before)]);
            }
            let response = check(request.send().await.map_err(map_reqwest)?, key).await?;
            let page: Vec<Message> = response.json().await.map_err(map_reqwest)?;
            let Some(last) = page.last() else {
                break;
            };
            before = Some(last.id.clone());
            remaining = remaining.saturating_sub(page.len());

            for message in page {
                if message.content == marker && !message.attachments.is_empty() {
                    found.push(message);
                    if first_only {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn locate(&self, key: &str) -> StorageResult<(Message, FileObject)> {
        let message = self
            .find_message(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let object = to_file_object(key, &message)?;
        Ok((message, object))
    }
}

fn marker_for(key: &str) -> String {
    format!("{}{}", KEY_MARKER, key)
}

fn to_file_object(key: &str, message: &Message) -> StorageResult<FileObject> {
    let attachment = message
        .attachments
        .first()
        .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
    Ok(FileObject {
        key: key.to_string(),
        url: attachment.url.clone(),
        size: attachment.size,
        content_type: attachment
            .content_type
            .clone()
            .unwrap_or_else(|| resolve_content_type(None, key)),
        last_modified: message.timestamp,
        etag: None,
        provider: ProviderType::Discord,
        signed_url: None,
    })
}

/// Stop the body with an error as soon as it grows past `limit`.
fn cap_stream(body: ByteStream, limit: u64) -> ByteStream {
    let mut seen = 0u64;
    Box::pin(body.map(move |chunk| {
        let chunk = chunk?;
        seen += chunk.len() as u64;
        if seen > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("upload exceeds the {} byte attachment limit", limit),
            ));
        }
        Ok(chunk)
    }))
}

async fn check(response: Response, key: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let header_hint = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body_hint = response
            .json::<RateLimited>()
            .await
            .ok()
            .map(|body| body.retry_after);
        let retry_after = body_hint.or(header_hint).unwrap_or(1.0);
        warn!(provider = "discord", retry_after, "rate limited");
        return Err(StorageError::Unavailable(format!(
            "Discord rate limit hit, retry_after={:.3}s",
            retry_after
        )));
    }
    let message = response.text().await.unwrap_or_default();
    Err(StorageError::from_status(status.as_u16(), key, message))
}

fn map_reqwest(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() {
        StorageError::Unavailable(err.to_string())
    } else if err.is_decode() {
        StorageError::Unknown(format!("unexpected Discord response: {}", err))
    } else {
        StorageError::Unknown(err.to_string())
    }
}

#[async_trait]
impl StorageProvider for DiscordProvider {
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidArgument(format!(
                "key longer than {} bytes cannot be stored on Discord",
                MAX_KEY_LEN
            )));
        }
        if size > self.max_file_size {
            return Err(StorageError::InvalidArgument(format!(
                "{} bytes exceeds the Discord attachment limit of {} bytes",
                size, self.max_file_size
            )));
        }

        let content_type = resolve_content_type(options.content_type.as_deref(), key);
        let payload = serde_json::json!({ "content": marker_for(key) }).to_string();
        let capped = SyncByteStream::new(cap_stream(body, self.max_file_size));
        let file = Part::stream_with_length(reqwest::Body::wrap_stream(capped), size)
            .file_name(file_name_of(key).to_string())
            .mime_str(&content_type)
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        let form = Form::new().text("payload_json", payload).part("files[0]", file);

        let response = self
            .api
            .post(self.messages_url())
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest)?;
        let message: Message = check(response, key).await?.json().await.map_err(map_reqwest)?;

        debug!(provider = "discord", key, message_id = %message.id, "posted attachment");
        to_file_object(key, &message)
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        ensure_key_present(key)?;
        let (_, object) = self.locate(key).await?;
        let response = self
            .cdn
            .get(&object.url)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check(response, key).await?;
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok((Box::pin(stream), object))
    }

    /// Removes every message carrying `key` so an older upload of the same
    /// key cannot resurface.
    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        for message in self.matching_messages(key, false).await? {
            let response = self
                .api
                .delete(format!("{}/{}", self.messages_url(), message.id))
                .send()
                .await
                .map_err(map_reqwest)?;
            match check(response, key).await {
                Ok(_) | Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        ensure_key_present(key)?;
        self.locate(key).await.map(|(_, object)| object.url)
    }

    /// Discord has no signing; the attachment URL is returned as is.
    async fn get_signed_url(&self, key: &str, _expires_in: Duration) -> StorageResult<String> {
        self.get_url(key).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        self.locate(key).await.map(|(_, object)| object)
    }

    async fn check_health(&self) -> StorageResult<()> {
        self.fetch_channel().await
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Discord
    }
}
