//! Natural-language insights for the monthly report. The generator is an
//! unreliable external service; callers go through `insights_or_fallback`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::models::MonthlyStats;

pub(crate) const FALLBACK_INSIGHTS: [&str; 3] = [
    "Your highest expense category this month might need attention.",
    "Consider setting up a budget for better financial management.",
    "Track your recurring expenses to identify potential savings.",
];

const INSIGHT_COUNT: usize = 3;
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub(crate) trait InsightGenerator: Send + Sync {
    async fn generate(&self, stats: &MonthlyStats, month: &str) -> Result<Vec<String>>;
}

pub(crate) fn fallback_insights() -> Vec<String> {
    FALLBACK_INSIGHTS.iter().map(|s| s.to_string()).collect()
}

/// Asks `generator` for insights; any failure or empty answer yields the
/// fixed fallback list.
pub(crate) async fn insights_or_fallback(
    generator: Option<&dyn InsightGenerator>,
    stats: &MonthlyStats,
    month: &str,
) -> Vec<String> {
    let Some(generator) = generator else {
        return fallback_insights();
    };
    match generator.generate(stats, month).await {
        Ok(list) => {
            let cleaned: Vec<String> = list
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(INSIGHT_COUNT)
                .collect();
            if cleaned.is_empty() {
                warn!(month, "insight generator returned nothing; using fallback");
                fallback_insights()
            } else {
                cleaned
            }
        }
        Err(e) => {
            warn!(month, error = %format!("{e:#}"), "insight generation failed; using fallback");
            fallback_insights()
        }
    }
}

/// Prompt carrying only the aggregate, never individual entries.
pub(crate) fn build_prompt(stats: &MonthlyStats, month: &str) -> Result<String> {
    let data = serde_json::json!({
        "totalIncome": stats.total_income.to_string(),
        "totalExpenses": stats.total_expenses.to_string(),
        "netIncome": stats.net().to_string(),
        "expenseCategories": stats.by_category,
    });
    let data = serde_json::to_string(&data).context("Failed to encode stats")?;
    Ok(format!(
        "Analyze this financial data for {month} and provide {INSIGHT_COUNT} concise, \
         actionable insights. Focus on spending patterns and practical advice. \
         Keep it friendly and conversational.\n\n\
         Financial Data: {data}\n\n\
         Format the response as a JSON array of strings, like this:\n\
         [\"insight 1\", \"insight 2\", \"insight 3\"]"
    ))
}

/// Strips Markdown code fences and parses a JSON array of strings.
pub(crate) fn parse_insights(text: &str) -> Result<Vec<String>> {
    let fence = Regex::new("```(?:json)?").context("Invalid fence pattern")?;
    let cleaned = fence.replace_all(text, "");
    let insights: Vec<String> = serde_json::from_str(cleaned.trim())
        .with_context(|| format!("Insight reply is not a JSON string array: {}", cleaned.trim()))?;
    Ok(insights)
}

// ── Gemini ────────────────────────────────────────────────────

pub(crate) struct GeminiInsights {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiInsights {
    pub(crate) fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: GEMINI_API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl InsightGenerator for GeminiInsights {
    async fn generate(&self, stats: &MonthlyStats, month: &str) -> Result<Vec<String>> {
        let prompt = build_prompt(stats, month)?;
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: &prompt }],
            }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Insight request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Insight service returned {status}: {body}");
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to decode insight response")?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .ok_or_else(|| anyhow!("Insight response had no candidates"))?;

        parse_insights(&text)
    }
}

#[cfg(test)]
mod tests;
