//! Recipient address normalization at the adapter boundary.

use zapflow_core::error::{Result, ZapflowError};

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

/// Strip everything but digits and check the E.164 length window.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return Err(ZapflowError::InvalidRecipient(format!(
            "'{raw}' is not a phone number ({} digits)",
            digits.len()
        )));
    }
    Ok(digits)
}

/// WAHA chat id: a JID passes through untouched, a phone becomes `<digits>@c.us`.
pub fn waha_chat_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if let Some((user, server)) = trimmed.split_once('@') {
        if user.is_empty() || server.is_empty() {
            return Err(ZapflowError::InvalidRecipient(format!("malformed chat id '{raw}'")));
        }
        return Ok(trimmed.to_string());
    }
    Ok(format!("{}@c.us", normalize_phone(trimmed)?))
}

/// Telegram target: numeric chat id (negative for groups/channels) or `@username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramTarget {
    Id(i64),
    Username(String),
}

impl TelegramTarget {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TelegramTarget::Id(id) => serde_json::json!(id),
            TelegramTarget::Username(name) => serde_json::json!(name),
        }
    }
}

pub fn telegram_target(raw: &str) -> Result<TelegramTarget> {
    let trimmed = raw.trim();
    if let Some(name) = trimmed.strip_prefix('@') {
        let valid = name.len() >= 4
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ZapflowError::InvalidRecipient(format!("invalid Telegram username '{raw}'")));
        }
        return Ok(TelegramTarget::Username(trimmed.to_string()));
    }
    trimmed
        .parse::<i64>()
        .ok()
        .filter(|id| *id != 0)
        .map(TelegramTarget::Id)
        .ok_or_else(|| ZapflowError::InvalidRecipient(format!("invalid Telegram chat id '{raw}'")))
}
