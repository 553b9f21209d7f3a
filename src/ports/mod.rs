pub mod http;
pub mod landing;
pub mod meta_ads;
pub mod openai;
pub mod retry;
pub mod shopify;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::work_item::fragments::{
    AdAngle, CampaignResult, CreativeImage, Fragment, LandingAnalysisResult, LandingCopyResult,
    StorefrontProduct, StorefrontResult,
};
use crate::work_item::{InputSnapshot, MediaRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Copy,
    Images,
    LandingAnalysis,
    Storefront,
    Ads,
    Internal,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Images => "images",
            Self::LandingAnalysis => "landing_analysis",
            Self::Storefront => "storefront",
            Self::Ads => "ads",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortErrorKind {
    /// The call kept failing after the port exhausted its retries.
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{provider:?} port {kind:?} error: {message}")]
pub struct PortError {
    pub provider: Provider,
    pub kind: PortErrorKind,
    pub message: String,
    /// Results the port produced before it failed, e.g. a product created
    /// ahead of a page that could not be.
    pub partial: Vec<Fragment>,
}

impl PortError {
    pub fn transient(provider: Provider, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: PortErrorKind::Transient,
            message: message.into(),
            partial: Vec::new(),
        }
    }

    pub fn permanent(provider: Provider, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: PortErrorKind::Permanent,
            message: message.into(),
            partial: Vec::new(),
        }
    }

    pub fn missing_credential(provider: Provider, name: &str) -> Self {
        Self::permanent(provider, format!("missing credential {name}"))
    }

    pub fn with_partial(mut self, fragment: Fragment) -> Self {
        self.partial.push(fragment);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == PortErrorKind::Transient
    }
}

/// Product attributes every copy prompt is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductBrief {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub benefits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl ProductBrief {
    pub fn from_snapshot(snapshot: &InputSnapshot) -> Self {
        Self {
            title: snapshot.title.trim().to_string(),
            description: snapshot
                .description
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            benefits: snapshot
                .benefits
                .iter()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            price: snapshot.price.clone(),
            audience: snapshot.audience.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnglesRequest {
    pub brief: ProductBrief,
    pub count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeadlinesRequest {
    pub brief: ProductBrief,
    pub angle: AdAngle,
    pub count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopiesRequest {
    pub brief: ProductBrief,
    pub angle: AdAngle,
    pub headlines: Vec<String>,
    pub count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandingCopyRequest {
    pub brief: ProductBrief,
    pub angles: Vec<AdAngle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceImageRequest {
    pub work_item_id: String,
    pub file_stem: String,
    pub sources: Vec<MediaRef>,
    pub prompt: String,
    pub count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptImageRequest {
    pub work_item_id: String,
    pub file_stem: String,
    pub prompt: String,
    pub count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandingAnalysisRequest {
    pub url: String,
    pub brief: ProductBrief,
    pub angle_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorefrontRequest {
    pub title: String,
    pub description_html: String,
    /// Hosted URLs or local files; local files are uploaded first.
    pub image_paths: Vec<String>,
    /// Product left behind by an earlier attempt; reused instead of creating
    /// a second one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_product: Option<StorefrontProduct>,
    pub page_title: String,
    pub page_body_html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorefrontPageUpdate {
    pub current: StorefrontResult,
    pub page_title: String,
    pub page_body_html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignRequest {
    pub name: String,
    pub objective: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_url: Option<String>,
    pub daily_budget_cents: u64,
}

pub trait CopyPort: Send + Sync + 'static {
    fn generate_angles(&self, request: &AnglesRequest) -> Result<Vec<AdAngle>, PortError>;
    fn generate_headlines(&self, request: &HeadlinesRequest) -> Result<Vec<String>, PortError>;
    fn generate_copies(&self, request: &CopiesRequest) -> Result<Vec<String>, PortError>;
    fn generate_landing_copy(
        &self,
        request: &LandingCopyRequest,
    ) -> Result<LandingCopyResult, PortError>;
}

pub trait ImagePort: Send + Sync + 'static {
    fn generate_from_source(
        &self,
        request: &SourceImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError>;
    fn generate_from_prompt(
        &self,
        request: &PromptImageRequest,
    ) -> Result<Vec<CreativeImage>, PortError>;
}

pub trait LandingAnalysisPort: Send + Sync + 'static {
    fn analyze(&self, request: &LandingAnalysisRequest)
        -> Result<LandingAnalysisResult, PortError>;
}

pub trait StorefrontPort: Send + Sync + 'static {
    fn create_product_page(
        &self,
        request: &StorefrontRequest,
    ) -> Result<StorefrontResult, PortError>;
    fn update_page(&self, request: &StorefrontPageUpdate) -> Result<StorefrontResult, PortError>;
}

pub trait AdsPort: Send + Sync + 'static {
    fn create_campaign(&self, request: &CampaignRequest) -> Result<CampaignResult, PortError>;
}

pub type SharedCopyPort = Arc<dyn CopyPort>;
pub type SharedImagePort = Arc<dyn ImagePort>;
pub type SharedLandingAnalysisPort = Arc<dyn LandingAnalysisPort>;
pub type SharedStorefrontPort = Arc<dyn StorefrontPort>;
pub type SharedAdsPort = Arc<dyn AdsPort>;

/// A single port invocation derived by a pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PortRequest {
    Angles(AnglesRequest),
    Headlines(HeadlinesRequest),
    Copies(CopiesRequest),
    LandingCopy(LandingCopyRequest),
    SourceImages(SourceImageRequest),
    PromptImages(PromptImageRequest),
    AnalyzeLanding(LandingAnalysisRequest),
    CreateStorefront(StorefrontRequest),
    UpdateStorefrontPage(StorefrontPageUpdate),
    CreateCampaign(CampaignRequest),
}

impl PortRequest {
    pub fn provider(&self) -> Provider {
        match self {
            Self::Angles(_) | Self::Headlines(_) | Self::Copies(_) | Self::LandingCopy(_) => {
                Provider::Copy
            }
            Self::SourceImages(_) | Self::PromptImages(_) => Provider::Images,
            Self::AnalyzeLanding(_) => Provider::LandingAnalysis,
            Self::CreateStorefront(_) | Self::UpdateStorefrontPage(_) => Provider::Storefront,
            Self::CreateCampaign(_) => Provider::Ads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum PortResponse {
    Angles(Vec<AdAngle>),
    Headlines(Vec<String>),
    Copies(Vec<String>),
    LandingCopy(LandingCopyResult),
    Images(Vec<CreativeImage>),
    LandingAnalysis(LandingAnalysisResult),
    Storefront(StorefrontResult),
    Campaign(CampaignResult),
}

#[derive(Clone)]
pub struct CapabilityPorts {
    pub copy: SharedCopyPort,
    pub images: SharedImagePort,
    pub analysis: SharedLandingAnalysisPort,
    pub storefront: SharedStorefrontPort,
    pub ads: SharedAdsPort,
}

impl CapabilityPorts {
    /// Production adapters wired from one configuration value.
    pub fn from_config(config: &Arc<AppConfig>) -> Self {
        let openai = Arc::new(openai::OpenAiAdapter::new(config.clone()));
        Self {
            copy: openai.clone(),
            images: openai.clone(),
            analysis: Arc::new(landing::LandingPageAnalyzer::new(config.clone(), openai)),
            storefront: Arc::new(shopify::ShopifyAdapter::new(config.clone())),
            ads: Arc::new(meta_ads::MetaAdsAdapter::new(config.clone())),
        }
    }

    pub fn call(&self, request: &PortRequest) -> Result<PortResponse, PortError> {
        match request {
            PortRequest::Angles(r) => self.copy.generate_angles(r).map(PortResponse::Angles),
            PortRequest::Headlines(r) => {
                self.copy.generate_headlines(r).map(PortResponse::Headlines)
            }
            PortRequest::Copies(r) => self.copy.generate_copies(r).map(PortResponse::Copies),
            PortRequest::LandingCopy(r) => self
                .copy
                .generate_landing_copy(r)
                .map(PortResponse::LandingCopy),
            PortRequest::SourceImages(r) => {
                self.images.generate_from_source(r).map(PortResponse::Images)
            }
            PortRequest::PromptImages(r) => {
                self.images.generate_from_prompt(r).map(PortResponse::Images)
            }
            PortRequest::AnalyzeLanding(r) => self
                .analysis
                .analyze(r)
                .map(PortResponse::LandingAnalysis),
            PortRequest::CreateStorefront(r) => self
                .storefront
                .create_product_page(r)
                .map(PortResponse::Storefront),
            PortRequest::UpdateStorefrontPage(r) => self
                .storefront
                .update_page(r)
                .map(PortResponse::Storefront),
            PortRequest::CreateCampaign(r) => {
                self.ads.create_campaign(r).map(PortResponse::Campaign)
            }
        }
    }
}
