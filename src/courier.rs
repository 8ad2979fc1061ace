//! Delivery collaborator: hands one catalog item to the destination.
//!
//! The engine treats delivery as opaque; its only retry policy is "record the
//! failure and move to the next item". Errors that invalidate the destination
//! itself are classified separately so the run can abort.

use crate::model::{CatalogItem, ContentKind, Quality};
use crate::resolver::ResolvedDestination;
use async_trait::async_trait;
use teloxide::payloads::{SendDocumentSetters, SendPhotoSetters, SendVideoSetters};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile};
use teloxide::ApiError;
use teloxide::RequestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination itself became unusable (kicked, rights revoked).
    /// Fatal to the run; the resolver cache must be invalidated.
    #[error("destination revoked: {0}")]
    Revoked(String),
    /// This item could not be delivered; the run continues.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Platform reference to the message that carried a delivered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef(pub i64);

#[async_trait]
pub trait Courier: Send + Sync {
    async fn deliver(
        &self,
        destination: &ResolvedDestination,
        item: &CatalogItem,
        quality: Quality,
        caption: &str,
    ) -> Result<MessageRef, DeliveryError>;
}

/// Sends media to Telegram by URL, picking the rendition that matches the
/// batch's quality preference. Streaming items (HLS/DASH/YouTube) cannot be
/// uploaded this way, so they are delivered as a manual-link message.
pub struct TelegramCourier {
    bot: Bot,
}

impl TelegramCourier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn classify(err: RequestError) -> DeliveryError {
    match &err {
        RequestError::Api(api) => match api {
            ApiError::BotKicked
            | ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::NotEnoughRightsToPostMessages => DeliveryError::Revoked(err.to_string()),
            _ => DeliveryError::Failed(err.to_string()),
        },
        _ => DeliveryError::Failed(err.to_string()),
    }
}

fn manual_link_text(item: &CatalogItem) -> String {
    format!(
        "Manual download required\n\n{}\n\nLink:\n{}\n\nCopy the link and download it yourself.",
        item.title, item.url
    )
}

#[async_trait]
impl Courier for TelegramCourier {
    async fn deliver(
        &self,
        destination: &ResolvedDestination,
        item: &CatalogItem,
        quality: Quality,
        caption: &str,
    ) -> Result<MessageRef, DeliveryError> {
        let chat = ChatId(destination.chat_id);

        if item.kind == ContentKind::Streaming {
            let msg = self
                .bot
                .send_message(chat, manual_link_text(item))
                .await
                .map_err(classify)?;
            return Ok(MessageRef(msg.id.0 as i64));
        }

        let content_url = item.url_for(quality);
        let url = reqwest::Url::parse(content_url)
            .map_err(|e| DeliveryError::Failed(format!("bad content URL {content_url}: {e}")))?;
        let input = InputFile::url(url);

        let msg = match item.kind {
            ContentKind::Video => {
                self.bot
                    .send_video(chat, input)
                    .caption(caption.to_owned())
                    .await
            }
            ContentKind::Image => {
                self.bot
                    .send_photo(chat, input)
                    .caption(caption.to_owned())
                    .await
            }
            ContentKind::Document | ContentKind::Streaming => {
                self.bot
                    .send_document(chat, input)
                    .caption(caption.to_owned())
                    .await
            }
        }
        .map_err(classify)?;

        Ok(MessageRef(msg.id.0 as i64))
    }
}
