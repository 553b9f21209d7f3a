use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::multipart;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::ports::http::{build_client, classify_send_error, read_json};
use crate::ports::retry::RetryPolicy;
use crate::ports::{
    AnglesRequest, CopiesRequest, CopyPort, HeadlinesRequest, ImagePort, LandingCopyRequest,
    PortError, ProductBrief, PromptImageRequest, Provider, SourceImageRequest,
};
use crate::work_item::fragments::{AdAngle, CreativeImage, ImageVariant, LandingCopyResult};

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImagesResponseItem>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponseItem {
    #[serde(default)]
    b64_json: Option<String>,
}

/// Copy and image generation against the OpenAI HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    config: Arc<AppConfig>,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        Self { config, retry }
    }

    fn api_key(&self, provider: Provider) -> Result<&str, PortError> {
        self.config
            .openai
            .api_key
            .as_deref()
            .ok_or_else(|| PortError::missing_credential(provider, "OPENAI_API_KEY"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.openai.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Runs a chat completion constrained to a JSON object and returns the
    /// parsed object.
    pub(crate) fn chat_json(
        &self,
        provider: Provider,
        operation: &str,
        system: &str,
        user: &str,
    ) -> Result<Value, PortError> {
        let api_key = self.api_key(provider)?;
        let client = build_client(provider, self.config.openai.timeout_secs)?;
        let body = json!({
            "model": self.config.openai.text_model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ]
        });
        let url = self.endpoint("chat/completions");

        let payload: ChatCompletionResponse = self.retry.run(provider, operation, |_| {
            let response = client
                .post(url.as_str())
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            read_json(provider, response)
        })?;

        let content = payload
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| PortError::permanent(provider, "model returned no message content"))?;
        serde_json::from_str(content).map_err(|e| {
            PortError::permanent(provider, format!("model returned non-JSON content: {e}"))
        })
    }

    fn output_dir_for(&self, work_item_id: &str) -> PathBuf {
        self.config
            .storage
            .output_dir
            .join(sanitize_id(work_item_id))
    }

    fn resolve_media_path(&self, value: &str) -> PathBuf {
        let candidate = PathBuf::from(value);
        if candidate.is_absolute() {
            candidate
        } else {
            self.config.app_root.join(candidate)
        }
    }
}

impl CopyPort for OpenAiAdapter {
    fn generate_angles(&self, request: &AnglesRequest) -> Result<Vec<AdAngle>, PortError> {
        let user = format!(
            "{}\n\nReturn {} distinct advertising angles as JSON: {{\"angles\": [{{\"name\", \"hook\", \"audience\"}}]}}.{}",
            brief_block(&request.brief),
            request.count,
            extra_instructions(request.prompt_override.as_deref()),
        );
        let value = self.chat_json(Provider::Copy, "angles", COPYWRITER_SYSTEM, user.as_str())?;
        parse_angles(&value).map_err(|message| PortError::permanent(Provider::Copy, message))
    }

    fn generate_headlines(&self, request: &HeadlinesRequest) -> Result<Vec<String>, PortError> {
        let user = format!(
            "{}\n\nAngle: {} ({})\nReturn {} ad headlines under 40 characters as JSON: {{\"headlines\": [string]}}.{}",
            brief_block(&request.brief),
            request.angle.name,
            request.angle.hook,
            request.count,
            extra_instructions(request.prompt_override.as_deref()),
        );
        let value =
            self.chat_json(Provider::Copy, "headlines", COPYWRITER_SYSTEM, user.as_str())?;
        parse_string_list(&value, "headlines")
            .map_err(|message| PortError::permanent(Provider::Copy, message))
    }

    fn generate_copies(&self, request: &CopiesRequest) -> Result<Vec<String>, PortError> {
        let user = format!(
            "{}\n\nAngle: {} ({})\nHeadlines: {}\nReturn {} primary ad texts as JSON: {{\"copies\": [string]}}.{}",
            brief_block(&request.brief),
            request.angle.name,
            request.angle.hook,
            request.headlines.join(" | "),
            request.count,
            extra_instructions(request.prompt_override.as_deref()),
        );
        let value = self.chat_json(Provider::Copy, "copies", COPYWRITER_SYSTEM, user.as_str())?;
        parse_string_list(&value, "copies")
            .map_err(|message| PortError::permanent(Provider::Copy, message))
    }

    fn generate_landing_copy(
        &self,
        request: &LandingCopyRequest,
    ) -> Result<LandingCopyResult, PortError> {
        let angles = request
            .angles
            .iter()
            .map(|a| format!("- {}: {}", a.name, a.hook))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "{}\n\nAngles:\n{}\nWrite landing page copy as JSON with keys headline, subheadline, body_html, bullet_points, call_to_action.{}",
            brief_block(&request.brief),
            if angles.is_empty() { String::from("- (none)") } else { angles },
            extra_instructions(request.prompt_override.as_deref()),
        );
        let value =
            self.chat_json(Provider::Copy, "landing_copy", COPYWRITER_SYSTEM, user.as_str())?;
        serde_json::from_value::<LandingCopyResult>(value).map_err(|e| {
            PortError::permanent(Provider::Copy, format!("landing copy shape invalid: {e}"))
        })
    }
}

impl ImagePort for OpenAiAdapter {
    fn generate_from_source(
        &self,
        request: &SourceImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError> {
        let provider = Provider::Images;
        if request.sources.is_empty() {
            return Err(PortError::permanent(provider, "no source images supplied"));
        }
        if request.prompt.trim().is_empty() {
            return Err(PortError::permanent(provider, "image prompt is empty"));
        }
        let api_key = self.api_key(provider)?;

        let mut sources = Vec::with_capacity(request.sources.len());
        for media in request.sources.iter() {
            let abs = self.resolve_media_path(media.path.as_str());
            let bytes = fs::read(abs.as_path()).map_err(|e| {
                PortError::permanent(provider, format!("source image '{}': {e}", media.path))
            })?;
            let file_name = abs
                .file_name()
                .and_then(|v| v.to_str())
                .unwrap_or("image.png")
                .to_string();
            let mime = media
                .mime_type
                .clone()
                .unwrap_or_else(|| mime_for_path(abs.as_path()));
            sources.push((bytes, file_name, mime));
        }

        let client = build_client(provider, self.config.openai.timeout_secs)?;
        let url = self.endpoint("images/edits");
        let settings = &self.config.openai;

        let payload: ImagesResponse = self.retry.run(provider, "images/edits", |_| {
            let mut form = multipart::Form::new()
                .text("model", settings.image_model.clone())
                .text("size", settings.image_size.clone())
                .text("quality", settings.image_quality.clone())
                .text("prompt", request.prompt.clone())
                .text("n", request.count.max(1).to_string())
                .text("input_fidelity", "high");
            for (bytes, file_name, mime) in sources.iter() {
                let part = multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime.as_str())
                    .map_err(|e| {
                        PortError::permanent(provider, format!("invalid mime '{mime}': {e}"))
                    })?;
                form = form.part("image[]", part);
            }
            let response = client
                .post(url.as_str())
                .bearer_auth(api_key)
                .multipart(form)
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            read_json(provider, response)
        })?;

        write_images(
            self.output_dir_for(request.work_item_id.as_str()).as_path(),
            request.file_stem.as_str(),
            request.prompt.as_str(),
            ImageVariant::SourceConditioned,
            &payload,
        )
    }

    fn generate_from_prompt(
        &self,
        request: &PromptImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError> {
        let provider = Provider::Images;
        if request.prompt.trim().is_empty() {
            return Err(PortError::permanent(provider, "image prompt is empty"));
        }
        let api_key = self.api_key(provider)?;
        let client = build_client(provider, self.config.openai.timeout_secs)?;
        let url = self.endpoint("images/generations");
        let body = json!({
            "model": self.config.openai.image_model,
            "prompt": request.prompt,
            "size": self.config.openai.image_size,
            "quality": self.config.openai.image_quality,
            "n": request.count.max(1),
        });

        let payload: ImagesResponse = self.retry.run(provider, "images/generations", |_| {
            let response = client
                .post(url.as_str())
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            read_json(provider, response)
        })?;

        write_images(
            self.output_dir_for(request.work_item_id.as_str()).as_path(),
            request.file_stem.as_str(),
            request.prompt.as_str(),
            ImageVariant::Prompted,
            &payload,
        )
    }
}

const COPYWRITER_SYSTEM: &str =
    "You are a direct-response copywriter for e-commerce ad tests. Answer with a single JSON object only.";

fn brief_block(brief: &ProductBrief) -> String {
    let mut out = format!("Product: {}", brief.title);
    if let Some(description) = brief.description.as_deref() {
        out.push_str(format!("\nDescription: {description}").as_str());
    }
    if !brief.benefits.is_empty() {
        out.push_str(format!("\nBenefits: {}", brief.benefits.join(", ")).as_str());
    }
    if let Some(price) = brief.price.as_deref() {
        out.push_str(format!("\nPrice: {price}").as_str());
    }
    if let Some(audience) = brief.audience.as_deref() {
        out.push_str(format!("\nAudience: {audience}").as_str());
    }
    out
}

fn extra_instructions(prompt_override: Option<&str>) -> String {
    prompt_override
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("\nAdditional instructions: {v}"))
        .unwrap_or_default()
}

pub(crate) fn parse_angles(value: &Value) -> Result<Vec<AdAngle>, String> {
    let items = value
        .get("angles")
        .and_then(Value::as_array)
        .ok_or_else(|| String::from("response is missing an 'angles' array"))?;
    let angles = items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?.trim();
            let hook = item
                .get("hook")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            if name.is_empty() {
                return None;
            }
            Some(AdAngle {
                name: name.to_string(),
                hook: hook.to_string(),
                audience: item
                    .get("audience")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            })
        })
        .collect::<Vec<_>>();
    if angles.is_empty() {
        return Err(String::from("response contained no usable angles"));
    }
    Ok(angles)
}

fn parse_string_list(value: &Value, field: &str) -> Result<Vec<String>, String> {
    let items = value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| format!("response is missing a '{field}' array"))?
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if items.is_empty() {
        return Err(format!("response contained no {field}"));
    }
    Ok(items)
}

fn write_images(
    dir: &Path,
    file_stem: &str,
    prompt: &str,
    variant: ImageVariant,
    payload: &ImagesResponse,
) -> Result<Vec<CreativeImage>, PortError> {
    let provider = Provider::Images;
    let encoded = payload
        .data
        .iter()
        .filter_map(|item| item.b64_json.as_deref())
        .collect::<Vec<_>>();
    if encoded.is_empty() {
        return Err(PortError::permanent(provider, "API returned no image payload"));
    }
    fs::create_dir_all(dir)
        .map_err(|e| PortError::permanent(provider, format!("output dir: {e}")))?;

    let stem = sanitize_id(file_stem);
    let mut out = Vec::with_capacity(encoded.len());
    for (index, b64) in encoded.into_iter().enumerate() {
        let bytes = BASE64_STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| PortError::permanent(provider, format!("image base64 decode failed: {e}")))?;
        let path = dir.join(format!("{stem}_{index}.png"));
        fs::write(path.as_path(), bytes.as_slice())
            .map_err(|e| PortError::permanent(provider, format!("image write failed: {e}")))?;
        out.push(CreativeImage {
            path: path.to_string_lossy().to_string(),
            prompt: prompt.to_string(),
            variant,
            bytes_written: bytes.len(),
        });
    }
    Ok(out)
}

fn sanitize_id(value: &str) -> String {
    let cleaned = value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() {
        String::from("item")
    } else {
        cleaned
    }
}

pub(crate) fn mime_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => String::from("image/jpeg"),
        "webp" => String::from("image/webp"),
        _ => String::from("image/png"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortErrorKind;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("adforge_openai_test_{}", Uuid::new_v4()))
    }

    #[test]
    fn parse_angles_skips_unnamed_entries() {
        let value = json!({"angles": [
            {"name": "Comfort", "hook": "Sit for hours", "audience": "remote workers"},
            {"name": "  ", "hook": "ignored"},
            {"name": "Price", "hook": "Half the cost"}
        ]});
        let angles = parse_angles(&value).expect("angles should parse");
        assert_eq!(angles.len(), 2);
        assert_eq!(angles[0].audience.as_deref(), Some("remote workers"));
        assert_eq!(angles[1].audience, None);
    }

    #[test]
    fn parse_angles_rejects_empty_payloads() {
        assert!(parse_angles(&json!({"angles": []})).is_err());
        assert!(parse_angles(&json!({"other": 1})).is_err());
    }

    #[test]
    fn parse_string_list_trims_and_filters() {
        let value = json!({"headlines": [" A ", "", 3, "B"]});
        assert_eq!(
            parse_string_list(&value, "headlines").expect("list should parse"),
            vec![String::from("A"), String::from("B")]
        );
    }

    #[test]
    fn write_images_decodes_payloads_into_work_item_dir() {
        let dir = temp_dir();
        let payload = ImagesResponse {
            data: vec![ImagesResponseItem {
                b64_json: Some(BASE64_STANDARD.encode(b"png-bytes")),
            }],
        };
        let images = write_images(
            dir.as_path(),
            "creative main",
            "a chair",
            ImageVariant::Prompted,
            &payload,
        )
        .expect("images should be written");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].bytes_written, 9);
        assert!(images[0].path.ends_with("creative_main_0.png"));
        assert_eq!(
            fs::read(images[0].path.as_str()).expect("image should exist"),
            b"png-bytes"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_api_key_is_permanent_before_network() {
        let config = Arc::new(AppConfig::defaults(temp_dir().as_path()).expect("defaults"));
        let adapter = OpenAiAdapter::new(config);
        let err = adapter
            .generate_from_prompt(&PromptImageRequest {
                work_item_id: String::from("wi-1"),
                file_stem: String::from("creative"),
                prompt: String::from("a chair"),
                count: 1,
            })
            .expect_err("missing key should fail");
        assert_eq!(err.kind, PortErrorKind::Permanent);
        assert!(err.message.contains("OPENAI_API_KEY"));
    }
}
