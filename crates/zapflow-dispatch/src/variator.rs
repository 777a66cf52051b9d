//! Message Variator: N textual variants of a template so recipients do not
//! all receive the same bytes.
//!
//! Two implementations: [`HttpVariator`] calls the external paraphrasing
//! service, [`SynonymVariator`] does deterministic local synonym substitution.
//! Both keep `{{placeholders}}` verbatim and, when they cannot reach the
//! requested count of distinct texts, pad with an invisible marker instead of
//! failing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zapflow_core::config::VariatorConfig;
use zapflow_core::error::{Result, ZapflowError};

/// Appended (repeated) to duplicates to make them distinct; renders as nothing.
const DISAMBIGUATION_MARKER: char = '\u{200B}';

#[async_trait]
pub trait Variator: Send + Sync {
    /// Produce `quantity` variants of `template`.
    async fn variations(&self, template: &str, quantity: usize) -> Result<Vec<String>>;
}

/// Variants resolved once per job, looked up per recipient by index.
#[derive(Debug, Clone)]
pub struct VariantSet {
    template: String,
    variants: Vec<String>,
}

impl VariantSet {
    /// The template alone: used when variation is off or unavailable.
    pub fn single(template: &str) -> Self {
        Self {
            template: template.to_string(),
            variants: Vec::new(),
        }
    }

    /// Ask the variator for `total` variants. A failing variator degrades to
    /// the bare template and the error comes back for reporting.
    pub async fn resolve(
        variator: Option<&dyn Variator>,
        template: &str,
        total: usize,
    ) -> (Self, Option<ZapflowError>) {
        let Some(variator) = variator.filter(|_| total > 1) else {
            return (Self::single(template), None);
        };
        match variator.variations(template, total).await {
            Ok(variants) if !variants.is_empty() => (
                Self {
                    template: template.to_string(),
                    variants,
                },
                None,
            ),
            Ok(_) => (
                Self::single(template),
                Some(ZapflowError::Variator("no variations returned".into())),
            ),
            Err(e) => (Self::single(template), Some(e)),
        }
    }

    /// Variant for recipient `index` (wraps around).
    pub fn get(&self, index: usize) -> &str {
        if self.variants.is_empty() {
            &self.template
        } else {
            &self.variants[index % self.variants.len()]
        }
    }
}

/// `{{...}}` tokens in order of appearance.
pub fn placeholders(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        found.push(&rest[start..start + len + 2]);
        rest = &rest[start + len + 2..];
    }
    found
}

/// Trimmed, deduplicated candidates that still carry every placeholder of `template`.
pub fn distinct_valid(candidates: Vec<String>, template: &str) -> Vec<String> {
    let required = placeholders(template);
    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        let trimmed = candidate.trim();
        if trimmed.is_empty() || out.iter().any(|v| v == trimmed) {
            continue;
        }
        if required.iter().all(|p| trimmed.contains(p)) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Exactly `quantity` distinct variants: valid candidates first, then
/// marker-padded copies.
pub fn ensure_distinct(candidates: Vec<String>, template: &str, quantity: usize) -> Vec<String> {
    let mut out = distinct_valid(candidates, template);
    out.truncate(quantity);
    if out.is_empty() {
        out.push(template.to_string());
    }
    let base_len = out.len();
    let mut n = 1;
    while out.len() < quantity {
        let base = out[(out.len() - base_len) % base_len].clone();
        let marker: String = std::iter::repeat_n(DISAMBIGUATION_MARKER, n).collect();
        out.push(format!("{base}{marker}"));
        n += 1;
    }
    out
}

#[derive(Debug, Serialize)]
struct VariationRequest<'a> {
    message: &'a str,
    quantity: usize,
}

#[derive(Debug, Deserialize)]
struct VariationResponse {
    success: bool,
    #[serde(default)]
    variations: Vec<String>,
    #[serde(default)]
    fallback: bool,
    #[serde(default)]
    reason: Option<String>,
}

enum RequestError {
    /// The service explicitly asked callers to use no variation.
    Fallback(String),
    Failed(ZapflowError),
}

/// Client for the external variation service.
pub struct HttpVariator {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpVariator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            max_retries,
        }
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &VariatorConfig) -> Option<Self> {
        config.endpoint.as_ref().filter(|e| !e.is_empty()).map(|endpoint| {
            Self::new(
                endpoint.clone(),
                Duration::from_secs(config.timeout_secs),
                config.max_retries,
            )
        })
    }

    async fn request(&self, template: &str, quantity: usize) -> std::result::Result<Vec<String>, RequestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&VariationRequest {
                message: template,
                quantity,
            })
            .send()
            .await
            .map_err(|e| RequestError::Failed(ZapflowError::Variator(format!("request failed: {e}"))))?;

        let status = response.status();
        let body: VariationResponse = response
            .json()
            .await
            .map_err(|e| {
                RequestError::Failed(ZapflowError::Variator(format!("invalid response ({status}): {e}")))
            })?;

        if body.success {
            Ok(body.variations)
        } else if body.fallback {
            Err(RequestError::Fallback(body.reason.unwrap_or_else(|| "unspecified".into())))
        } else {
            Err(RequestError::Failed(ZapflowError::Variator(format!(
                "service error ({status}): {}",
                body.reason.unwrap_or_default()
            ))))
        }
    }
}

#[async_trait]
impl Variator for HttpVariator {
    async fn variations(&self, template: &str, quantity: usize) -> Result<Vec<String>> {
        let mut collected: Vec<String> = Vec::new();
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.request(template, quantity).await {
                Ok(batch) => {
                    collected.extend(batch);
                    let distinct = distinct_valid(collected.clone(), template);
                    if distinct.len() >= quantity {
                        return Ok(ensure_distinct(collected, template, quantity));
                    }
                    tracing::debug!(
                        "Variator attempt {} produced {}/{} distinct variants",
                        attempt + 1,
                        distinct.len(),
                        quantity
                    );
                }
                // An explicit fallback answer is final.
                Err(RequestError::Fallback(reason)) => {
                    return Err(ZapflowError::Variator(format!("service asked for fallback: {reason}")));
                }
                Err(RequestError::Failed(e)) => {
                    tracing::warn!("⚠️ Variator attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }

        if collected.is_empty() {
            return Err(last_error.unwrap_or_else(|| ZapflowError::Variator("no variations".into())));
        }
        Ok(ensure_distinct(collected, template, quantity))
    }
}

/// Deterministic local substitution from a small Portuguese synonym table.
/// Variant 0 is the template itself.
pub struct SynonymVariator {
    groups: Vec<Vec<&'static str>>,
}

impl SynonymVariator {
    pub fn new() -> Self {
        Self {
            groups: vec![
                vec!["olá", "oi", "e aí"],
                vec!["promoção", "oferta", "condição especial"],
                vec!["aproveite", "não perca", "garanta já"],
                vec!["hoje", "agora"],
                vec!["desconto", "abatimento"],
                vec!["obrigado", "valeu", "agradecemos"],
                vec!["novidade", "lançamento"],
                vec!["rápido", "ligeiro"],
                vec!["contato", "retorno"],
            ],
        }
    }

    fn group_of(&self, word: &str) -> Option<&Vec<&'static str>> {
        let lower = word.to_lowercase();
        self.groups.iter().find(|g| g.iter().any(|w| *w == lower))
    }

    /// Substitute every known word outside placeholders for variant `index`.
    pub fn variant(&self, template: &str, index: usize) -> String {
        if index == 0 {
            return template.to_string();
        }
        let mut out = String::with_capacity(template.len());
        let mut word_no = 0usize;
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            out.push_str(&self.substitute(&rest[..start], index, &mut word_no));
            out.push_str(&rest[start..start + len + 2]);
            rest = &rest[start + len + 2..];
        }
        out.push_str(&self.substitute(rest, index, &mut word_no));
        out
    }

    fn substitute(&self, text: &str, index: usize, word_no: &mut usize) -> String {
        let mut out = String::with_capacity(text.len());
        let mut word = String::new();
        for ch in text.chars() {
            if ch.is_alphabetic() {
                word.push(ch);
                continue;
            }
            if !word.is_empty() {
                out.push_str(&self.replace_word(&word, index + *word_no));
                *word_no += 1;
                word.clear();
            }
            out.push(ch);
        }
        if !word.is_empty() {
            out.push_str(&self.replace_word(&word, index + *word_no));
            *word_no += 1;
        }
        out
    }

    fn replace_word(&self, word: &str, seed: usize) -> String {
        let Some(group) = self.group_of(word) else {
            return word.to_string();
        };
        let pick = group[seed % group.len()];
        if word.chars().next().is_some_and(char::is_uppercase) {
            let mut chars = pick.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect())
                .unwrap_or_default()
        } else {
            pick.to_string()
        }
    }
}

impl Default for SynonymVariator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Variator for SynonymVariator {
    async fn variations(&self, template: &str, quantity: usize) -> Result<Vec<String>> {
        let candidates = (0..quantity * 3).map(|i| self.variant(template, i)).collect();
        Ok(ensure_distinct(candidates, template, quantity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn placeholder_scan() {
        assert_eq!(placeholders("Oi {{name}}, veja {{link}}!"), vec!["{{name}}", "{{link}}"]);
        assert!(placeholders("sem nada {{ aberto").is_empty());
    }

    #[test]
    fn ensure_distinct_pads_with_marker() {
        let out = ensure_distinct(vec!["a".into(), "a".into()], "a", 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "a");
        assert_ne!(out[1], out[0]);
        assert_ne!(out[2], out[1]);
        assert!(out[1].starts_with('a'));
    }

    #[test]
    fn ensure_distinct_drops_lost_placeholders() {
        let out = ensure_distinct(
            vec!["Oi, tudo bem?".into(), "Olá {{name}}!".into()],
            "Oi {{name}}!",
            1,
        );
        assert_eq!(out, vec!["Olá {{name}}!".to_string()]);
    }

    #[test]
    fn synonym_variant_is_deterministic_and_keeps_placeholders() {
        let v = SynonymVariator::new();
        let template = "Olá {{name}}, aproveite a promoção de hoje!";
        assert_eq!(v.variant(template, 0), template);
        let a = v.variant(template, 1);
        assert_eq!(a, v.variant(template, 1));
        assert!(a.contains("{{name}}"));
        assert!(a.starts_with(char::is_uppercase));
    }

    #[tokio::test]
    async fn synonym_variations_are_distinct() {
        let v = SynonymVariator::new();
        let out = v.variations("Olá! Aproveite a promoção de hoje.", 5).await.unwrap();
        assert_eq!(out.len(), 5);
        let mut dedup = out.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 5);
    }

    #[tokio::test]
    async fn synonym_pads_when_nothing_to_substitute() {
        let v = SynonymVariator::new();
        let out = v.variations("Reunião às 15h", 3).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "Reunião às 15h");
    }

    #[tokio::test]
    async fn variant_set_falls_back_on_error() {
        struct Broken;
        #[async_trait]
        impl Variator for Broken {
            async fn variations(&self, _t: &str, _q: usize) -> Result<Vec<String>> {
                Err(ZapflowError::Variator("down".into()))
            }
        }

        let (set, err) = VariantSet::resolve(Some(&Broken), "Oi {{name}}", 4).await;
        assert!(err.is_some());
        assert_eq!(set.get(0), "Oi {{name}}");
        assert_eq!(set.get(3), "Oi {{name}}");
    }

    #[tokio::test]
    async fn variant_set_wraps_indices() {
        let v = SynonymVariator::new();
        let (set, err) = VariantSet::resolve(Some(&v), "Olá, promoção hoje", 2).await;
        assert!(err.is_none());
        assert_eq!(set.get(0), set.get(2));
        assert_eq!(set.get(1), set.get(3));
    }

    #[tokio::test]
    async fn http_variator_success() {
        let server = MockServer::start_async().await;
        let call = server
            .mock_async(|when, then| {
                when.method(POST).path("/variations").body_includes("\"quantity\":2");
                then.status(200).json_body(json!({
                    "success": true,
                    "variations": ["Oi {{name}}, tudo bem?", "Olá {{name}}, como vai?"]
                }));
            })
            .await;

        let v = HttpVariator::new(server.url("/variations"), Duration::from_secs(5), 2);
        let out = v.variations("Oi {{name}}", 2).await.unwrap();
        assert_eq!(out.len(), 2);
        call.assert_async().await;
    }

    #[tokio::test]
    async fn http_variator_fallback_is_not_retried() {
        let server = MockServer::start_async().await;
        let call = server
            .mock_async(|when, then| {
                when.method(POST).path("/variations");
                then.status(200).json_body(json!({
                    "success": false,
                    "fallback": true,
                    "reason": "quota exceeded"
                }));
            })
            .await;

        let v = HttpVariator::new(server.url("/variations"), Duration::from_secs(5), 3);
        let err = v.variations("Oi", 3).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        call.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn http_variator_retries_then_pads() {
        let server = MockServer::start_async().await;
        let call = server
            .mock_async(|when, then| {
                when.method(POST).path("/variations");
                then.status(200).json_body(json!({"success": true, "variations": ["Oi!"]}));
            })
            .await;

        let v = HttpVariator::new(server.url("/variations"), Duration::from_secs(5), 2);
        let out = v.variations("Oi", 3).await.unwrap();
        assert_eq!(out.len(), 3);
        call.assert_calls_async(3).await;
    }
}
