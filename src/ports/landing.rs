use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::AppConfig;
use crate::ports::http::{bounded, build_client, classify_send_error, classify_status};
use crate::ports::openai::{parse_angles, OpenAiAdapter};
use crate::ports::retry::RetryPolicy;
use crate::ports::{LandingAnalysisPort, LandingAnalysisRequest, PortError, Provider};
use crate::work_item::fragments::LandingAnalysisResult;

const ANALYST_SYSTEM: &str = "You analyse product landing pages for ad testing. Answer with a single JSON object only.";

/// Fetches a landing page and asks the text model to summarise it.
pub struct LandingPageAnalyzer {
    config: Arc<AppConfig>,
    openai: Arc<OpenAiAdapter>,
    retry: RetryPolicy,
}

impl LandingPageAnalyzer {
    pub fn new(config: Arc<AppConfig>, openai: Arc<OpenAiAdapter>) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        Self {
            config,
            openai,
            retry,
        }
    }

    fn fetch_page(&self, url: &Url) -> Result<String, PortError> {
        let provider = Provider::LandingAnalysis;
        let client = build_client(provider, self.config.landing.timeout_secs)?;
        self.retry.run(provider, "fetch_landing", |_| {
            let response = client
                .get(url.as_str())
                .header("User-Agent", "adforge-backend-core/0.1")
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            let status = response.status();
            let body = response
                .text()
                .map_err(|e| PortError::transient(provider, format!("read body failed: {e}")))?;
            if !status.is_success() {
                return Err(classify_status(provider, status, body.as_str()));
            }
            Ok(body)
        })
    }
}

impl LandingAnalysisPort for LandingPageAnalyzer {
    fn analyze(
        &self,
        request: &LandingAnalysisRequest,
    ) -> Result<LandingAnalysisResult, PortError> {
        let provider = Provider::LandingAnalysis;
        let url = validate_landing_url(request.url.as_str())?;
        let html = self.fetch_page(&url)?;
        let text = bounded(
            strip_markup(html.as_str()).as_str(),
            self.config.landing.max_page_chars,
        );
        if text.trim().is_empty() {
            return Err(PortError::permanent(provider, "landing page has no readable text"));
        }
        debug!(url = %url, chars = text.chars().count(), "landing page fetched");

        let user = format!(
            "Product: {}\nLanding page URL: {}\n\nPage text:\n{}\n\nReturn JSON with \"summary\" (two sentences) and \"angles\": up to {} objects with \"name\", \"hook\", \"audience\".",
            request.brief.title, url, text, request.angle_count
        );
        let value = self.openai.chat_json(
            provider,
            "analyze_landing",
            ANALYST_SYSTEM,
            user.as_str(),
        )?;
        parse_analysis(url.as_str(), &value, request.angle_count as usize)
            .map_err(|message| PortError::permanent(provider, message))
    }
}

pub(crate) fn validate_landing_url(raw: &str) -> Result<Url, PortError> {
    let provider = Provider::LandingAnalysis;
    let url = Url::parse(raw.trim())
        .map_err(|e| PortError::permanent(provider, format!("invalid landing URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PortError::permanent(
            provider,
            format!("landing URL must be http(s), got '{}'", url.scheme()),
        ));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(PortError::permanent(provider, "landing URL has no host"));
    }
    Ok(url)
}

fn parse_analysis(
    url: &str,
    value: &Value,
    max_angles: usize,
) -> Result<LandingAnalysisResult, String> {
    let summary = value
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| String::from("analysis is missing a summary"))?;
    // An analysis without usable angles is still a valid analysis.
    let mut angles = parse_angles(value).unwrap_or_default();
    angles.truncate(max_angles.max(1));
    Ok(LandingAnalysisResult {
        url: url.to_string(),
        summary: summary.to_string(),
        angles,
    })
}

/// Drops script/style blocks and tags, decodes the common entities and
/// collapses whitespace.
pub(crate) fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let lower = html.to_ascii_lowercase();
    let mut i = 0usize;
    while i < html.len() {
        let rest = &lower[i..];
        if rest.starts_with("<script") || rest.starts_with("<style") {
            let closing = if rest.starts_with("<script") {
                "</script>"
            } else {
                "</style>"
            };
            match rest.find(closing) {
                Some(end) => {
                    i += end + closing.len();
                    text.push(' ');
                    continue;
                }
                None => break,
            }
        }
        if opens_tag(rest) {
            if let Some(end) = rest.find('>') {
                i += end + 1;
                text.push(' ');
                continue;
            }
        }
        let Some(ch) = html[i..].chars().next() else {
            break;
        };
        text.push(ch);
        i += ch.len_utf8();
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `<` followed by a tag name, `/`, `!` or `?`. Anything else, including a
/// `<` with no closing `>`, is kept as text.
fn opens_tag(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('<')
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'))
}
