use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_SETTINGS_REL_PATH: &str = "config/adforge.settings.toml";
const DEFAULT_DB_REL_PATH: &str = "var/backend/adforge.db";
const DEFAULT_OUTPUT_REL_PATH: &str = "var/creatives";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("setting '{field}' is invalid: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    Inline,
    Queue,
}

impl ExecutorMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" | "thread" => Some(Self::Inline),
            "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub image_size: String,
    pub image_quality: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShopifySettings {
    pub shop_domain: Option<String>,
    pub access_token: Option<String>,
    pub api_version: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaSettings {
    pub access_token: Option<String>,
    pub ad_account_id: Option<String>,
    pub api_version: String,
    pub daily_budget_cents: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LandingSettings {
    pub max_page_chars: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub executor: ExecutorMode,
    pub queue_workers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSettings {
    pub launch_enabled: bool,
    pub objective: String,
}

/// Process-wide settings, built once at startup and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub app_root: PathBuf,
    pub storage: StorageSettings,
    pub openai: OpenAiSettings,
    pub shopify: ShopifySettings,
    pub meta: MetaSettings,
    pub landing: LandingSettings,
    pub retry: RetrySettings,
    pub dispatcher: DispatcherSettings,
    pub campaign: CampaignSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    storage: StorageSection,
    openai: OpenAiSection,
    shopify: ShopifySection,
    meta: MetaSection,
    landing: LandingSection,
    retry: RetrySection,
    dispatcher: DispatcherSection,
    campaign: CampaignSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StorageSection {
    db_path: Option<String>,
    output_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OpenAiSection {
    base_url: Option<String>,
    text_model: Option<String>,
    image_model: Option<String>,
    image_size: Option<String>,
    image_quality: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShopifySection {
    shop_domain: Option<String>,
    api_version: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaSection {
    ad_account_id: Option<String>,
    api_version: Option<String>,
    daily_budget_cents: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LandingSection {
    max_page_chars: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetrySection {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DispatcherSection {
    executor: Option<ExecutorMode>,
    queue_workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CampaignSection {
    launch_enabled: Option<bool>,
    objective: Option<String>,
}

impl AppConfig {
    /// Reads the TOML settings file, then `.env`, then the process
    /// environment; later sources win.
    pub fn load(app_root: &Path, explicit_path: Option<&str>) -> Result<Self, ConfigError> {
        let settings_path = explicit_path
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| std::env::var("ADFORGE_CONFIG").ok())
            .map(|v| resolve_under_root(app_root, v.as_str()))
            .unwrap_or_else(|| app_root.join(DEFAULT_SETTINGS_REL_PATH));

        let raw = if settings_path.is_file() {
            Some(
                fs::read_to_string(settings_path.as_path()).map_err(|error| {
                    ConfigError::ReadFile {
                        path: settings_path.display().to_string(),
                        message: error.to_string(),
                    }
                })?,
            )
        } else {
            None
        };

        let dotenv_path = app_root.join(".env");
        let dotenv = match fs::read_to_string(dotenv_path.as_path()) {
            Ok(raw) => Some(raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                return Err(ConfigError::ReadFile {
                    path: dotenv_path.display().to_string(),
                    message: error.to_string(),
                })
            }
        };
        let env = layered_env(dotenv.as_deref(), std::env::vars());

        Self::from_sources(
            app_root,
            raw.as_deref()
                .map(|content| (settings_path.display().to_string(), content)),
            &env,
        )
    }

    pub fn from_sources(
        app_root: &Path,
        settings: Option<(String, &str)>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let file = match settings {
            Some((path, raw)) => {
                toml::from_str::<SettingsFile>(raw).map_err(|error| ConfigError::ParseToml {
                    path,
                    message: error.to_string(),
                })?
            }
            None => SettingsFile::default(),
        };
        let lookup = |key: &str| {
            env.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let db_path = lookup("ADFORGE_DB")
            .or(file.storage.db_path)
            .unwrap_or_else(|| String::from(DEFAULT_DB_REL_PATH));
        let output_dir = lookup("ADFORGE_OUTPUT_DIR")
            .or(file.storage.output_dir)
            .unwrap_or_else(|| String::from(DEFAULT_OUTPUT_REL_PATH));

        let executor = match lookup("ADFORGE_EXECUTOR") {
            Some(raw) => ExecutorMode::parse(raw.as_str()).ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: String::from("ADFORGE_EXECUTOR"),
                    message: format!("expected inline or queue, got '{raw}'"),
                }
            })?,
            None => file.dispatcher.executor.unwrap_or(ExecutorMode::Inline),
        };
        let queue_workers = file.dispatcher.queue_workers.unwrap_or(4);
        if queue_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("dispatcher.queue_workers"),
                message: String::from("must be at least 1"),
            });
        }

        let retry = RetrySettings {
            max_attempts: file.retry.max_attempts.unwrap_or(3),
            initial_backoff_ms: file.retry.initial_backoff_ms.unwrap_or(500),
            max_backoff_ms: file.retry.max_backoff_ms.unwrap_or(8_000),
            multiplier: file.retry.multiplier.unwrap_or(2.0),
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("retry.max_attempts"),
                message: String::from("must be at least 1"),
            });
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("retry.multiplier"),
                message: String::from("must be >= 1.0"),
            });
        }

        Ok(Self {
            app_root: app_root.to_path_buf(),
            storage: StorageSettings {
                db_path: resolve_under_root(app_root, db_path.as_str()),
                output_dir: resolve_under_root(app_root, output_dir.as_str()),
            },
            openai: OpenAiSettings {
                api_key: lookup("OPENAI_API_KEY"),
                base_url: lookup("OPENAI_BASE_URL")
                    .or(file.openai.base_url)
                    .unwrap_or_else(|| String::from("https://api.openai.com/v1")),
                text_model: lookup("OPENAI_TEXT_MODEL")
                    .or(file.openai.text_model)
                    .unwrap_or_else(|| String::from("gpt-4o-mini")),
                image_model: lookup("OPENAI_IMAGE_MODEL")
                    .or(file.openai.image_model)
                    .unwrap_or_else(|| String::from("gpt-image-1")),
                image_size: lookup("OPENAI_IMAGE_SIZE")
                    .or(file.openai.image_size)
                    .unwrap_or_else(|| String::from("1024x1024")),
                image_quality: lookup("OPENAI_IMAGE_QUALITY")
                    .or(file.openai.image_quality)
                    .unwrap_or_else(|| String::from("high")),
                timeout_secs: file.openai.timeout_secs.unwrap_or(120),
            },
            shopify: ShopifySettings {
                shop_domain: lookup("SHOPIFY_SHOP_DOMAIN").or(file.shopify.shop_domain),
                access_token: lookup("SHOPIFY_ACCESS_TOKEN"),
                api_version: file
                    .shopify
                    .api_version
                    .unwrap_or_else(|| String::from("2024-10")),
                timeout_secs: file.shopify.timeout_secs.unwrap_or(30),
            },
            meta: MetaSettings {
                access_token: lookup("META_ACCESS_TOKEN"),
                ad_account_id: lookup("META_AD_ACCOUNT_ID").or(file.meta.ad_account_id),
                api_version: file
                    .meta
                    .api_version
                    .unwrap_or_else(|| String::from("v21.0")),
                daily_budget_cents: file.meta.daily_budget_cents.unwrap_or(2_000),
                timeout_secs: file.meta.timeout_secs.unwrap_or(30),
            },
            landing: LandingSettings {
                max_page_chars: file.landing.max_page_chars.unwrap_or(12_000),
                timeout_secs: file.landing.timeout_secs.unwrap_or(20),
            },
            retry,
            dispatcher: DispatcherSettings {
                executor,
                queue_workers,
            },
            campaign: CampaignSettings {
                launch_enabled: file.campaign.launch_enabled.unwrap_or(false),
                objective: file
                    .campaign
                    .objective
                    .unwrap_or_else(|| String::from("OUTCOME_TRAFFIC")),
            },
        })
    }

    /// Defaults rooted at `app_root`, with no credentials.
    pub fn defaults(app_root: &Path) -> Result<Self, ConfigError> {
        Self::from_sources(app_root, None, &HashMap::new())
    }
}

pub fn default_app_root() -> PathBuf {
    std::env::var("ADFORGE_APP_ROOT")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_under_root(root: &Path, value: &str) -> PathBuf {
    let candidate = PathBuf::from(value);
    if candidate.is_absolute() {
        candidate
    } else {
        root.join(candidate)
    }
}

/// `.env` entries with the process environment laid over them.
fn layered_env(
    dotenv: Option<&str>,
    process: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = dotenv
        .map(|raw| raw.lines().filter_map(dotenv_entry).collect())
        .unwrap_or_default();
    env.extend(process);
    env
}

/// One `KEY=value` line. Blank lines, comments, `export` prefixes and keys
/// with inner whitespace are handled the way shells treat them.
fn dotenv_entry(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key.to_string(), dotenv_value(value.trim())))
}

fn dotenv_value(raw: &str) -> String {
    let quoted = ['"', '\'']
        .into_iter()
        .find_map(|q| raw.strip_prefix(q).and_then(|v| v.strip_suffix(q)));
    match quoted {
        Some(inner) => inner.to_string(),
        None => raw
            .split_once(" #")
            .map_or(raw, |(before, _)| before.trim_end())
            .to_string(),
    }
}
