//! Destination resolver: the resolve → permission-check → first-contact
//! handshake that must succeed before anything is sent to a chat.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("cannot resolve destination {0}; check the id and add the bot to the channel first")]
    UnresolvedPeer(String),
    #[error("bot is not admin of destination {0}; grant the Post Messages permission")]
    NotAdmin(String),
    #[error("initialization probe to destination {0} failed: {1}")]
    ProbeFailed(String, String),
}

/// A destination the platform client has verified and durably cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub chat_id: i64,
    pub title: Option<String>,
}

/// Platform calls the resolver needs. Production talks to Telegram through
/// [`TelegramGateway`]; tests inject fakes.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn resolve_chat(&self, destination_id: i64) -> Result<ResolvedDestination, DestinationError>;
    async fn check_post_permission(&self, destination_id: i64) -> Result<(), DestinationError>;
    async fn send_probe(&self, destination_id: i64) -> Result<(), DestinationError>;
}

/// Performs the handshake and caches successful resolutions per process.
///
/// The cache is owned here and injected where needed; invalidation is an
/// explicit operation (restore must call it, since a restored destination id
/// cannot be assumed valid in the current session).
pub struct DestinationResolver {
    gateway: Arc<dyn ChatGateway>,
    cache: Mutex<HashMap<i64, ResolvedDestination>>,
}

impl DestinationResolver {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            gateway,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and verify a destination, in this exact order:
    /// resolve, permission check, then the mandatory first-contact probe.
    /// The probe is what makes the platform client cache the peer handle, so
    /// its failure is surfaced, never swallowed.
    ///
    /// Re-verifying an already-cached destination short-circuits to a
    /// permission re-check without re-sending the probe.
    #[instrument(skip(self))]
    pub async fn resolve_and_verify(&self, destination_id: i64) -> Result<ResolvedDestination, DestinationError> {
        let cached = self.cache.lock().await.get(&destination_id).cloned();
        if let Some(resolved) = cached {
            self.gateway.check_post_permission(destination_id).await?;
            return Ok(resolved);
        }

        let resolved = self.gateway.resolve_chat(destination_id).await?;
        self.gateway.check_post_permission(destination_id).await?;
        self.gateway.send_probe(destination_id).await?;
        info!(destination_id, title = ?resolved.title, "destination verified");

        self.cache.lock().await.insert(destination_id, resolved.clone());
        Ok(resolved)
    }

    /// Drop a cached resolution so the next run performs the full handshake.
    pub async fn invalidate(&self, destination_id: i64) {
        if self.cache.lock().await.remove(&destination_id).is_some() {
            info!(destination_id, "destination cache invalidated");
        }
    }

    /// Whether a destination currently has a cached resolution.
    pub async fn is_cached(&self, destination_id: i64) -> bool {
        self.cache.lock().await.contains_key(&destination_id)
    }
}

/// Telegram implementation of the gateway.
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn resolve_chat(&self, destination_id: i64) -> Result<ResolvedDestination, DestinationError> {
        let chat = self
            .bot
            .get_chat(ChatId(destination_id))
            .await
            .map_err(|e| DestinationError::UnresolvedPeer(format!("{destination_id} ({e})")))?;
        Ok(ResolvedDestination {
            chat_id: destination_id,
            title: chat.title().map(str::to_owned),
        })
    }

    async fn check_post_permission(&self, destination_id: i64) -> Result<(), DestinationError> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| DestinationError::UnresolvedPeer(format!("{destination_id} ({e})")))?;
        let member = self
            .bot
            .get_chat_member(ChatId(destination_id), me.id)
            .await
            .map_err(|e| DestinationError::NotAdmin(format!("{destination_id} ({e})")))?;
        if !member.kind.is_privileged() {
            return Err(DestinationError::NotAdmin(destination_id.to_string()));
        }
        Ok(())
    }

    async fn send_probe(&self, destination_id: i64) -> Result<(), DestinationError> {
        let msg = self
            .bot
            .send_message(ChatId(destination_id), "Initializing delivery…")
            .await
            .map_err(|e| DestinationError::ProbeFailed(destination_id.to_string(), e.to_string()))?;
        // The probe only exists to warm the peer cache; its content is noise,
        // so clean it up best-effort.
        if let Err(e) = self.bot.delete_message(ChatId(destination_id), msg.id).await {
            warn!(destination_id, ?e, "failed to delete probe message");
        }
        Ok(())
    }
}

static TME_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"t\.me/c/(\d+)").expect("valid regex"));

/// Extract a numeric destination id from operator input.
///
/// Accepts `-1001234567890`, a bare negative id, a `t.me/c/…` link, or a
/// 10+ digit number (prefixed with `-100`).
pub fn extract_destination_id(text: &str) -> Option<i64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, '`' | '*' | '_' | ' '))
        .collect();

    if let Some(rest) = cleaned.strip_prefix("-100") {
        if rest.chars().all(|c| c.is_ascii_digit()) && rest.len() >= 6 {
            return cleaned.parse().ok();
        }
    }
    if let Some(rest) = cleaned.strip_prefix('-') {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return cleaned.parse().ok();
        }
    }
    if let Some(caps) = TME_LINK.captures(&cleaned) {
        return format!("-100{}", &caps[1]).parse().ok();
    }
    if cleaned.len() >= 10 && cleaned.chars().all(|c| c.is_ascii_digit()) {
        return format!("-100{cleaned}").parse().ok();
    }
    None
}
