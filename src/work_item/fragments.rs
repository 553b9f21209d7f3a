use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod keys {
    pub const ANGLES: &str = "angles";
    pub const CREATIVES: &str = "creatives";
    pub const LANDING_COPY: &str = "landing_copy";
    pub const PRODUCT: &str = "product";
    pub const PAGE: &str = "page";
    pub const CAMPAIGN: &str = "campaign";
    pub const ANALYSIS: &str = "analysis";

    pub fn headlines(angle_index: usize) -> String {
        format!("headlines.{angle_index}")
    }

    pub fn copies(angle_index: usize) -> String {
        format!("copies.{angle_index}")
    }

    pub fn images(angle_index: usize) -> String {
        format!("images.{angle_index}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdAngle {
    pub name: String,
    pub hook: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleSource {
    Generated,
    Analysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnglesResult {
    pub angles: Vec<AdAngle>,
    pub source: AngleSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageVariant {
    SourceConditioned,
    Prompted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreativeImage {
    pub path: String,
    pub prompt: String,
    pub variant: ImageVariant,
    pub bytes_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesResult {
    pub images: Vec<CreativeImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingCopyResult {
    pub headline: String,
    pub subheadline: String,
    pub body_html: String,
    #[serde(default)]
    pub bullet_points: Vec<String>,
    pub call_to_action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorefrontProduct {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorefrontResult {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_handle: Option<String>,
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Skipped,
    CreatedPaused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignResult {
    pub status: CampaignStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CampaignResult {
    pub fn skipped(note: impl Into<String>) -> Self {
        Self {
            status: CampaignStatus::Skipped,
            campaign_id: None,
            note: Some(note.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LandingAnalysisResult {
    pub url: String,
    pub summary: String,
    #[serde(default)]
    pub angles: Vec<AdAngle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleHeadlines {
    pub angle_index: usize,
    pub headlines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleCopies {
    pub angle_index: usize,
    pub copies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleImages {
    pub angle_index: usize,
    pub images: Vec<CreativeImage>,
}

/// One named piece of accumulated pipeline output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fragment {
    Angles(AnglesResult),
    Creatives(ImagesResult),
    LandingCopy(LandingCopyResult),
    Product(StorefrontProduct),
    Page(StorefrontResult),
    Campaign(CampaignResult),
    Analysis(LandingAnalysisResult),
    Headlines(AngleHeadlines),
    Copies(AngleCopies),
    AngleImages(AngleImages),
}

impl Fragment {
    pub fn key(&self) -> String {
        match self {
            Self::Angles(_) => String::from(keys::ANGLES),
            Self::Creatives(_) => String::from(keys::CREATIVES),
            Self::LandingCopy(_) => String::from(keys::LANDING_COPY),
            Self::Product(_) => String::from(keys::PRODUCT),
            Self::Page(_) => String::from(keys::PAGE),
            Self::Campaign(_) => String::from(keys::CAMPAIGN),
            Self::Analysis(_) => String::from(keys::ANALYSIS),
            Self::Headlines(v) => keys::headlines(v.angle_index),
            Self::Copies(v) => keys::copies(v.angle_index),
            Self::AngleImages(v) => keys::images(v.angle_index),
        }
    }
}

/// Accumulated fragments keyed by [`Fragment::key`]. Merges only insert or
/// replace; nothing is ever removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultFragments(BTreeMap<String, Fragment>);

impl ResultFragments {
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, fragment: Fragment) -> Option<Fragment> {
        self.0.insert(fragment.key(), fragment)
    }

    pub fn merge<I>(&mut self, patch: I)
    where
        I: IntoIterator<Item = Fragment>,
    {
        for fragment in patch {
            self.insert(fragment);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Fragment> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn angles(&self) -> Option<&AnglesResult> {
        match self.get(keys::ANGLES) {
            Some(Fragment::Angles(v)) => Some(v),
            _ => None,
        }
    }

    pub fn creatives(&self) -> Option<&ImagesResult> {
        match self.get(keys::CREATIVES) {
            Some(Fragment::Creatives(v)) => Some(v),
            _ => None,
        }
    }

    pub fn landing_copy(&self) -> Option<&LandingCopyResult> {
        match self.get(keys::LANDING_COPY) {
            Some(Fragment::LandingCopy(v)) => Some(v),
            _ => None,
        }
    }

    pub fn product(&self) -> Option<&StorefrontProduct> {
        match self.get(keys::PRODUCT) {
            Some(Fragment::Product(v)) => Some(v),
            _ => None,
        }
    }

    pub fn page(&self) -> Option<&StorefrontResult> {
        match self.get(keys::PAGE) {
            Some(Fragment::Page(v)) => Some(v),
            _ => None,
        }
    }

    pub fn campaign(&self) -> Option<&CampaignResult> {
        match self.get(keys::CAMPAIGN) {
            Some(Fragment::Campaign(v)) => Some(v),
            _ => None,
        }
    }

    pub fn analysis(&self) -> Option<&LandingAnalysisResult> {
        match self.get(keys::ANALYSIS) {
            Some(Fragment::Analysis(v)) => Some(v),
            _ => None,
        }
    }

    pub fn headlines(&self, angle_index: usize) -> Option<&AngleHeadlines> {
        match self.get(keys::headlines(angle_index).as_str()) {
            Some(Fragment::Headlines(v)) => Some(v),
            _ => None,
        }
    }

    pub fn copies(&self, angle_index: usize) -> Option<&AngleCopies> {
        match self.get(keys::copies(angle_index).as_str()) {
            Some(Fragment::Copies(v)) => Some(v),
            _ => None,
        }
    }

    pub fn angle_images(&self, angle_index: usize) -> Option<&AngleImages> {
        match self.get(keys::images(angle_index).as_str()) {
            Some(Fragment::AngleImages(v)) => Some(v),
            _ => None,
        }
    }
}

impl FromIterator<Fragment> for ResultFragments {
    fn from_iter<T: IntoIterator<Item = Fragment>>(iter: T) -> Self {
        let mut out = Self::new();
        out.merge(iter);
        out
    }
}
