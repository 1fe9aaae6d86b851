//! LLM resolution validator: prompt assembly, PDF excerpting, and strict
//! JSON verdict parsing.
//!
//! The prompt is a structured JSON document describing both markets side by
//! side, with settlement sources, an outcome mapping, the data-source domains
//! scraped from every URL field, and (for Kalshi) an excerpt of the contract
//! terms PDF. The model must answer with a single JSON object.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::llm::LlmClient;
use crate::matches::{MatchPayload, ResolutionVerdict};
use crate::types::{Market, MarketSnapshot, ResolutionSource, Venue};

const SYSTEM_PROMPT: &str = "You are a strict arbitrage validator. Determine if two binary markets resolve identically with no ambiguity. Reject if timing, definitions, or data sources differ. Respond only with JSON.";

const CONTRACT_EXCERPT_LIMIT: usize = 6000;
const MAX_PDF_BYTES: usize = 8 << 20;

/// Validates market pairs via the LLM.
pub struct ValidatorService {
    llm: LlmClient,
    pdf: Option<PdfExtractor>,
    system_prompt: String,
}

impl ValidatorService {
    pub fn new(llm: LlmClient, pdf: Option<PdfExtractor>, system_prompt: Option<String>) -> Self {
        let system_prompt = system_prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or_else(|| SYSTEM_PROMPT.to_string());
        Self {
            llm,
            pdf,
            system_prompt,
        }
    }

    /// Runs the LLM prompt for the pair and returns the parsed verdict.
    /// Errors here are reported by the caller and never cached.
    pub async fn validate(&self, payload: &MatchPayload) -> Result<ResolutionVerdict> {
        let prompt_input = build_prompt_payload(payload, self.pdf.as_ref()).await?;
        let input_json = serde_json::to_string_pretty(&prompt_input)
            .context("marshal validator prompt input")?;

        let user_prompt = [
            "Compare the following Polymarket and Kalshi markets. Polymarket and Kalshi are prediction markets, you are helping with an arbitrage detection system.",
            "Right now, a possible risk-free arbitrage is possible if the two markets resolve identically.",
            "They must represent the exact same binary outcome, their resolution criteria must be the same, and have matching cutoff/resolution criteria to be valid.",
            "For example, they can have different resolution sources, but as long as the criteria and the resolution sources agree on the exact definition, that is valid.",
            "If either market allows outcomes not strictly YES/NO for the exact same event, answer false. If a potential resolution where yes or no are not the only possibilities, answer false.",
            "Pay special attention to timing, settlement sources, definitions, tiebreakers, cancellations, or alternate clauses.",
            "If unsure, treat it as invalid. Answer concisely with only necessary information, nothing too much more.",
            &format!(
                "Return EXACTLY this JSON format:\n{{\n  \"ValidResolution\": true|false,\n  \"ResolutionReason\": \"short explanation\"\n}}\n\nInput JSON:\n{input_json}"
            ),
        ]
        .join("\n");

        let raw = self
            .llm
            .complete(&self.system_prompt, &user_prompt)
            .await
            .context("validator llm call")?;
        parse_verdict(&raw).context("validator parse response")
    }
}

// === Prompt payload ===

#[derive(Debug, Serialize)]
struct PromptPayload {
    pair_id: String,
    matched_at_utc: String,
    generated_at_utc: String,
    similarity: f64,
    distance: f64,
    polymarket: MarketPromptSection,
    kalshi: MarketPromptSection,
}

#[derive(Debug, Serialize)]
struct MarketPromptSection {
    venue: String,
    event_id: String,
    market_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    event_title: String,
    question: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    subtitle: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    resolution_source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    resolution_details: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    close_time_utc: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    category: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    settlement_sources: Vec<ResolutionSource>,
    #[serde(skip_serializing_if = "String::is_empty")]
    reference_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    contract_terms_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    contract_terms_excerpt: String,
    outcome_mapping: OutcomeMapping,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    data_source_domains: Vec<String>,
}

#[derive(Debug, Serialize)]
struct OutcomeMapping {
    yes_means: String,
    no_means: String,
}

async fn build_prompt_payload(
    payload: &MatchPayload,
    pdf: Option<&PdfExtractor>,
) -> Result<PromptPayload> {
    let pm = payload
        .snapshot_for(Venue::Polymarket)
        .context("payload missing polymarket snapshot")?;
    let kx = payload
        .snapshot_for(Venue::Kalshi)
        .context("payload missing kalshi snapshot")?;

    let pm_section = build_market_section(pm, String::new());

    let mut kx_excerpt = String::new();
    if let Some(extractor) = pdf {
        if !kx.event.contract_terms_url.is_empty() {
            match extractor.extract(&kx.event.contract_terms_url).await {
                Ok(text) => kx_excerpt = truncate_text(&text, CONTRACT_EXCERPT_LIMIT),
                Err(err) => debug!(
                    "[validator] pdf extract failed url={}: {err:#}",
                    kx.event.contract_terms_url
                ),
            }
        }
    }
    let kx_section = build_market_section(kx, kx_excerpt);

    Ok(PromptPayload {
        pair_id: payload.pair_id.clone(),
        matched_at_utc: format_time(Some(payload.matched_at)),
        generated_at_utc: format_time(Some(Utc::now())),
        similarity: payload.similarity,
        distance: payload.distance,
        polymarket: pm_section,
        kalshi: kx_section,
    })
}

fn build_market_section(snap: &MarketSnapshot, pdf_text: String) -> MarketPromptSection {
    let event = &snap.event;
    let market = &snap.market;

    let mut settlement = event.settlement_sources.clone();
    if settlement.is_empty() && !event.resolution_source.is_empty() {
        settlement.push(ResolutionSource {
            name: event.resolution_source.clone(),
            url: String::new(),
        });
    }

    let domains = collect_domains(
        &settlement,
        [
            market.reference_url.as_str(),
            event.contract_terms_url.as_str(),
            event.description.as_str(),
            event.resolution_details.as_str(),
            market.subtitle.as_str(),
        ],
    );

    // PDF text wins; resolution details are the fallback excerpt.
    let contract_excerpt = if pdf_text.is_empty() {
        event.resolution_details.clone()
    } else {
        pdf_text
    };

    MarketPromptSection {
        venue: snap.venue.to_string(),
        event_id: event.event_id.clone(),
        market_id: market.market_id.clone(),
        event_title: event.title.clone(),
        question: market.question.clone(),
        subtitle: market.subtitle.clone(),
        description: event.description.clone(),
        resolution_source: event.resolution_source.clone(),
        resolution_details: event.resolution_details.clone(),
        close_time_utc: format_time(snap.close_time()),
        category: event.category.clone(),
        settlement_sources: settlement,
        reference_url: market.reference_url.clone(),
        contract_terms_url: event.contract_terms_url.clone(),
        contract_terms_excerpt: contract_excerpt,
        outcome_mapping: OutcomeMapping {
            yes_means: build_outcome_text(market, true),
            no_means: build_outcome_text(market, false),
        },
        data_source_domains: domains,
    }
}

fn build_outcome_text(market: &Market, yes: bool) -> String {
    if yes {
        if !market.subtitle.is_empty() {
            return format!("YES when: {}", market.subtitle.trim());
        }
        return format!(
            "YES when the question \"{}\" resolves positively.",
            market.question.trim()
        );
    }
    "NO covers all other outcomes or when the YES condition fails.".to_string()
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").unwrap())
}

/// Scans every URL field for hostnames, normalized to lower case and sorted.
fn collect_domains<'a>(
    sources: &[ResolutionSource],
    texts: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut domains = std::collections::BTreeSet::new();
    let mut add = |raw: &str| {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        if let Ok(url) = reqwest::Url::parse(raw) {
            if let Some(host) = url.host_str() {
                domains.insert(host.to_lowercase());
            }
        }
    };
    for source in sources {
        add(&source.url);
    }
    for text in texts {
        if text.is_empty() {
            continue;
        }
        add(text);
        for found in url_regex().find_iter(text) {
            add(found.as_str());
        }
    }
    domains.into_iter().collect()
}

/// Truncates on a char boundary, marking the cut.
fn truncate_text(text: &str, limit: usize) -> String {
    let text = text.trim();
    if limit == 0 || text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} ... (truncated)", &text[..end])
}

/// Extracts the first balanced `{...}` substring and decodes it. Anything
/// else (markdown fences, commentary, no JSON at all) is a parse fault.
pub fn parse_verdict(raw: &str) -> Result<ResolutionVerdict> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty llm response");
    }
    let candidate = first_balanced_object(raw).unwrap_or(raw);
    serde_json::from_str(candidate).context("decode verdict json")
}

fn first_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// === PDF extraction ===

/// Downloads a contract-terms PDF (content capped at 8 MB) and extracts its
/// text preserving approximate reading order.
pub struct PdfExtractor {
    http: reqwest::Client,
}

impl PdfExtractor {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
            .context("build pdf http client")?;
        Ok(Self { http })
    }

    pub async fn extract(&self, url: &str) -> Result<String> {
        if url.is_empty() {
            bail!("pdf url is empty");
        }
        let resp = self.http.get(url).send().await.context("pdf download")?;
        if !resp.status().is_success() {
            bail!("pdf download failed: {}", resp.status());
        }
        if let Some(length) = resp.content_length() {
            if length as usize > MAX_PDF_BYTES {
                bail!("pdf too large: {length} bytes");
            }
        }
        let bytes = resp.bytes().await.context("pdf body")?;
        let bytes = if bytes.len() > MAX_PDF_BYTES {
            bytes.slice(..MAX_PDF_BYTES)
        } else {
            bytes
        };

        // CPU-bound parse off the async runtime
        let text = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|err| anyhow::anyhow!("pdf text extraction: {err}"))
        })
        .await
        .context("join pdf task")??;
        Ok(text)
    }
}

// =============================================================================
// TESTS
// =============================================================================
