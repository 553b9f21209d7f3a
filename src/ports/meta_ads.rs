use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;
use crate::ports::http::{build_client, classify_send_error, read_json};
use crate::ports::retry::RetryPolicy;
use crate::ports::{AdsPort, CampaignRequest, PortError, Provider};
use crate::work_item::fragments::{CampaignResult, CampaignStatus};

#[derive(Debug, Deserialize)]
struct CreatedObject {
    #[serde(default)]
    id: Option<String>,
}

/// Meta Graph API client. Campaigns are always created paused.
pub struct MetaAdsAdapter {
    config: Arc<AppConfig>,
    retry: RetryPolicy,
}

impl MetaAdsAdapter {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        Self { config, retry }
    }

    fn campaigns_endpoint(&self, ad_account_id: &str) -> String {
        format!(
            "https://graph.facebook.com/{}/{}/campaigns",
            self.config.meta.api_version,
            normalize_ad_account(ad_account_id)
        )
    }
}

impl AdsPort for MetaAdsAdapter {
    fn create_campaign(&self, request: &CampaignRequest) -> Result<CampaignResult, PortError> {
        let provider = Provider::Ads;
        if request.name.trim().is_empty() {
            return Err(PortError::permanent(provider, "campaign name is empty"));
        }
        let token = self
            .config
            .meta
            .access_token
            .as_deref()
            .ok_or_else(|| PortError::missing_credential(provider, "META_ACCESS_TOKEN"))?;
        let account = self
            .config
            .meta
            .ad_account_id
            .as_deref()
            .ok_or_else(|| PortError::missing_credential(provider, "META_AD_ACCOUNT_ID"))?;

        let client = build_client(provider, self.config.meta.timeout_secs)?;
        let url = self.campaigns_endpoint(account);
        let budget = request.daily_budget_cents.to_string();
        let params = [
            ("name", request.name.as_str()),
            ("objective", request.objective.as_str()),
            ("status", "PAUSED"),
            ("special_ad_categories", "[]"),
            ("daily_budget", budget.as_str()),
            ("access_token", token),
        ];

        let created: CreatedObject = self.retry.run(provider, "create_campaign", |_| {
            let response = client
                .post(url.as_str())
                .form(&params)
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            read_json(provider, response)
        })?;
        let campaign_id = created
            .id
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PortError::permanent(provider, "campaign create returned no id"))?;
        info!(campaign_id = campaign_id.as_str(), "paused campaign created");

        Ok(CampaignResult {
            status: CampaignStatus::CreatedPaused,
            campaign_id: Some(campaign_id),
            note: request
                .landing_url
                .as_ref()
                .map(|u| format!("landing page {u}")),
        })
    }
}

fn normalize_ad_account(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("act_") {
        trimmed.to_string()
    } else {
        format!("act_{trimmed}")
    }
}
