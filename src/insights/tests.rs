#![allow(clippy::unwrap_used)]

use super::*;
use rust_decimal_macros::dec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn sample_stats() -> MonthlyStats {
    let mut stats = MonthlyStats::default();
    stats.add_income(dec!(3000));
    stats.add_expense("groceries", dec!(420.50));
    stats.add_expense("housing", dec!(1200));
    stats
}

struct FixedInsights(Result<Vec<String>, String>);

#[async_trait]
impl InsightGenerator for FixedInsights {
    async fn generate(&self, _stats: &MonthlyStats, _month: &str) -> Result<Vec<String>> {
        self.0.clone().map_err(|e| anyhow!(e))
    }
}

// ── Parsing ───────────────────────────────────────────────────

#[test]
fn test_parse_plain_array() {
    let parsed = parse_insights(r#"["a", "b", "c"]"#).unwrap();
    assert_eq!(parsed, vec!["a", "b", "c"]);
}

#[test]
fn test_parse_strips_code_fences() {
    let reply = "```json\n[\"Cut dining out\", \"Groceries are steady\"]\n```\n";
    let parsed = parse_insights(reply).unwrap();
    assert_eq!(parsed, vec!["Cut dining out", "Groceries are steady"]);

    let bare_fence = "```\n[\"one\"]\n```";
    assert_eq!(parse_insights(bare_fence).unwrap(), vec!["one"]);
}

#[test]
fn test_parse_rejects_non_array() {
    assert!(parse_insights(r#"{"insight": "spend less"}"#).is_err());
    assert!(parse_insights("Here are some tips: save more").is_err());
    assert!(parse_insights("").is_err());
}

#[test]
fn test_prompt_carries_only_aggregates() {
    let prompt = build_prompt(&sample_stats(), "January 2024").unwrap();
    assert!(prompt.contains("January 2024"));
    assert!(prompt.contains("\"totalIncome\":\"3000\""));
    assert!(prompt.contains("\"totalExpenses\":\"1620.50\""));
    assert!(prompt.contains("\"groceries\":\"420.50\""));
    assert!(prompt.contains("JSON array of strings"));
}

// ── Fallback ──────────────────────────────────────────────────

#[tokio::test]
async fn test_no_generator_uses_fallback() {
    let insights = insights_or_fallback(None, &sample_stats(), "January 2024").await;
    assert_eq!(insights, fallback_insights());
    assert_eq!(insights.len(), 3);
}

#[tokio::test]
async fn test_generator_error_uses_fallback() {
    let failing = FixedInsights(Err("503 from upstream".into()));
    let insights = insights_or_fallback(Some(&failing), &sample_stats(), "January 2024").await;
    assert_eq!(insights, fallback_insights());
}

#[tokio::test]
async fn test_empty_answer_uses_fallback() {
    let blank = FixedInsights(Ok(vec!["  ".into(), String::new()]));
    let insights = insights_or_fallback(Some(&blank), &sample_stats(), "January 2024").await;
    assert_eq!(insights, fallback_insights());
}

#[tokio::test]
async fn test_generated_insights_are_trimmed_and_capped() {
    let chatty = FixedInsights(Ok(vec![
        " first ".into(),
        "second".into(),
        "".into(),
        "third".into(),
        "fourth".into(),
    ]));
    let insights = insights_or_fallback(Some(&chatty), &sample_stats(), "January 2024").await;
    assert_eq!(insights, vec!["first", "second", "third"]);
}

// ── Gemini client against a local stub server ─────────────────

/// Serves one canned HTTP response and hands back the raw request.
async fn serve_once(status_line: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
            if request_complete(&request) {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
    });

    (format!("http://{addr}"), rx)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    raw.len() >= header_end + 4 + content_length
}

#[tokio::test]
async fn test_gemini_parses_fenced_reply() {
    let reply = serde_json::json!({
        "candidates": [{
            "content": {
                "parts": [{ "text": "```json\n[\"Housing is 74% of spending\", \"Income covers expenses\", \"Review groceries\"]\n```" }]
            }
        }]
    });
    let (base, request) = serve_once("200 OK", reply.to_string()).await;

    let gemini = GeminiInsights::new("test-key".into(), "gemini-1.5-flash".into())
        .unwrap()
        .with_base_url(&base);
    let insights = gemini.generate(&sample_stats(), "January 2024").await.unwrap();
    assert_eq!(
        insights,
        vec!["Housing is 74% of spending", "Income covers expenses", "Review groceries"]
    );

    let request = request.await.unwrap();
    assert!(request.starts_with("POST /models/gemini-1.5-flash:generateContent"));
    assert!(request.to_ascii_lowercase().contains("x-goog-api-key: test-key"));
    assert!(request.contains("January 2024"));
}

#[tokio::test]
async fn test_gemini_http_error_is_an_error() {
    let (base, _request) = serve_once("500 Internal Server Error", "{}".into()).await;
    let gemini = GeminiInsights::new("k".into(), "m".into())
        .unwrap()
        .with_base_url(&base);
    let err = gemini.generate(&sample_stats(), "January 2024").await.unwrap_err();
    assert!(format!("{err:#}").contains("500"));
}

#[tokio::test]
async fn test_gemini_without_candidates_is_an_error() {
    let (base, _request) = serve_once("200 OK", r#"{"candidates": []}"#.into()).await;
    let gemini = GeminiInsights::new("k".into(), "m".into())
        .unwrap()
        .with_base_url(&base);
    assert!(gemini.generate(&sample_stats(), "January 2024").await.is_err());
}
