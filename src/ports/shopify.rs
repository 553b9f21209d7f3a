use std::fs;
use std::path::Path;
use std::sync::Arc;

use reqwest::blocking::multipart;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::ports::http::{build_client, classify_send_error, classify_status, read_json};
use crate::ports::openai::mime_for_path;
use crate::ports::retry::RetryPolicy;
use crate::ports::{PortError, Provider, StorefrontPageUpdate, StorefrontPort, StorefrontRequest};
use crate::work_item::fragments::{Fragment, StorefrontProduct, StorefrontResult};

const PRODUCT_CREATE: &str = r#"mutation productCreate($product: ProductCreateInput!, $media: [CreateMediaInput!]) {
  productCreate(product: $product, media: $media) {
    product { id handle }
    userErrors { field message }
  }
}"#;

const STAGED_UPLOADS_CREATE: &str = r#"mutation stagedUploadsCreate($input: [StagedUploadInput!]!) {
  stagedUploadsCreate(input: $input) {
    stagedTargets { url resourceUrl parameters { name value } }
    userErrors { field message }
  }
}"#;

const PAGE_CREATE: &str = r#"mutation pageCreate($page: PageCreateInput!) {
  pageCreate(page: $page) {
    page { id handle }
    userErrors { field message }
  }
}"#;

const PAGE_UPDATE: &str = r#"mutation pageUpdate($id: ID!, $page: PageUpdateInput!) {
  pageUpdate(id: $id, page: $page) {
    page { id handle }
    userErrors { field message }
  }
}"#;

/// Upload slot returned by `stagedUploadsCreate`. The file is POSTed to
/// `url` with `parameters` as form fields; `resource_url` then works as a
/// media `originalSource`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedTarget {
    url: String,
    resource_url: String,
    parameters: Vec<(String, String)>,
}

/// Shopify Admin GraphQL client for product and landing page publishing.
pub struct ShopifyAdapter {
    config: Arc<AppConfig>,
    retry: RetryPolicy,
}

struct ShopCredentials<'a> {
    domain: &'a str,
    token: &'a str,
}

impl ShopifyAdapter {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let retry = RetryPolicy::from_settings(&config.retry);
        Self { config, retry }
    }

    fn credentials(&self) -> Result<ShopCredentials<'_>, PortError> {
        let domain = self
            .config
            .shopify
            .shop_domain
            .as_deref()
            .ok_or_else(|| PortError::missing_credential(Provider::Storefront, "SHOPIFY_SHOP_DOMAIN"))?;
        let token = self
            .config
            .shopify
            .access_token
            .as_deref()
            .ok_or_else(|| {
                PortError::missing_credential(Provider::Storefront, "SHOPIFY_ACCESS_TOKEN")
            })?;
        Ok(ShopCredentials {
            domain: domain.trim_start_matches("https://").trim_end_matches('/'),
            token,
        })
    }

    fn graphql(
        &self,
        creds: &ShopCredentials<'_>,
        operation: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value, PortError> {
        let provider = Provider::Storefront;
        let client = build_client(provider, self.config.shopify.timeout_secs)?;
        let url = format!(
            "https://{}/admin/api/{}/graphql.json",
            creds.domain, self.config.shopify.api_version
        );
        let body = json!({"query": query, "variables": variables});

        let payload: Value = self.retry.run(provider, operation, |_| {
            let response = client
                .post(url.as_str())
                .header("X-Shopify-Access-Token", creds.token)
                .json(&body)
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            let payload: Value = read_json(provider, response)?;
            check_top_level_errors(&payload)?;
            Ok(payload)
        })?;
        mutation_payload(&payload, operation)
    }

    fn page_url(&self, creds: &ShopCredentials<'_>, handle: Option<&str>) -> Option<String> {
        handle.map(|h| format!("https://{}/pages/{}", creds.domain, h))
    }

    fn create_product(
        &self,
        creds: &ShopCredentials<'_>,
        request: &StorefrontRequest,
    ) -> Result<StorefrontProduct, PortError> {
        let media = product_media(&request.image_paths, |path| self.stage_upload(creds, path))?;
        let media_count = media.len();
        let product = self.graphql(
            creds,
            "productCreate",
            PRODUCT_CREATE,
            json!({
                "product": {
                    "title": request.title,
                    "descriptionHtml": request.description_html,
                    "status": "DRAFT",
                    "tags": ["adforge"]
                },
                "media": media
            }),
        )?;
        let product_id = string_at(&product, "product", "id").ok_or_else(|| {
            PortError::permanent(Provider::Storefront, "productCreate returned no product id")
        })?;
        info!(
            product_id = product_id.as_str(),
            media = media_count,
            "storefront product created"
        );
        Ok(StorefrontProduct {
            product_id,
            product_handle: string_at(&product, "product", "handle"),
        })
    }

    /// Uploads a local creative to Shopify's staging storage and returns the
    /// resource URL media inputs can point at.
    fn stage_upload(&self, creds: &ShopCredentials<'_>, path: &Path) -> Result<String, PortError> {
        let provider = Provider::Storefront;
        let upload = UploadFile::for_path(path)?;
        let payload = self.graphql(
            creds,
            "stagedUploadsCreate",
            STAGED_UPLOADS_CREATE,
            json!({ "input": [upload.staged_input()] }),
        )?;
        let target = parse_staged_target(&payload)?;
        let bytes = fs::read(path).map_err(|e| {
            PortError::permanent(
                provider,
                format!("failed to read creative '{}': {e}", path.display()),
            )
        })?;

        let client = build_client(provider, self.config.shopify.timeout_secs)?;
        self.retry.run(provider, "stagedUpload", |_| {
            let mut form = multipart::Form::new();
            for (name, value) in target.parameters.iter() {
                form = form.text(name.clone(), value.clone());
            }
            let part = multipart::Part::bytes(bytes.clone())
                .file_name(upload.file_name.clone())
                .mime_str(upload.mime.as_str())
                .map_err(|e| {
                    PortError::permanent(provider, format!("invalid mime '{}': {e}", upload.mime))
                })?;
            let response = client
                .post(target.url.as_str())
                .multipart(form.part("file", part))
                .send()
                .map_err(|e| classify_send_error(provider, &e))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let body = response.text().unwrap_or_default();
                Err(classify_status(provider, status, body.as_str()))
            }
        })?;
        info!(path = %path.display(), "creative staged for storefront upload");
        Ok(target.resource_url)
    }
}

impl StorefrontPort for ShopifyAdapter {
    fn create_product_page(
        &self,
        request: &StorefrontRequest,
    ) -> Result<StorefrontResult, PortError> {
        let provider = Provider::Storefront;
        if request.title.trim().is_empty() {
            return Err(PortError::permanent(provider, "product title is empty"));
        }
        let creds = self.credentials()?;

        let product = match request.existing_product.as_ref() {
            Some(existing) => {
                info!(
                    product_id = existing.product_id.as_str(),
                    "reusing storefront product from an earlier attempt"
                );
                existing.clone()
            }
            None => self.create_product(&creds, request)?,
        };

        // From here on the product exists; every failure hands it back.
        let keep_product =
            |error: PortError| error.with_partial(Fragment::Product(product.clone()));
        let page = self
            .graphql(
                &creds,
                "pageCreate",
                PAGE_CREATE,
                json!({
                    "page": {
                        "title": request.page_title,
                        "body": request.page_body_html,
                        "isPublished": true
                    }
                }),
            )
            .map_err(keep_product)?;
        let page_id = string_at(&page, "page", "id").ok_or_else(|| {
            keep_product(PortError::permanent(provider, "pageCreate returned no page id"))
        })?;
        let page_handle = string_at(&page, "page", "handle");

        Ok(StorefrontResult {
            product_id: product.product_id,
            product_handle: product.product_handle,
            page_id,
            page_url: self.page_url(&creds, page_handle.as_deref()),
        })
    }

    fn update_page(&self, request: &StorefrontPageUpdate) -> Result<StorefrontResult, PortError> {
        let provider = Provider::Storefront;
        if request.current.page_id.trim().is_empty() {
            return Err(PortError::permanent(provider, "page id is empty"));
        }
        let creds = self.credentials()?;
        let page = self.graphql(
            &creds,
            "pageUpdate",
            PAGE_UPDATE,
            json!({
                "id": request.current.page_id,
                "page": {
                    "title": request.page_title,
                    "body": request.page_body_html
                }
            }),
        )?;
        let page_handle = string_at(&page, "page", "handle");
        Ok(StorefrontResult {
            page_url: self
                .page_url(&creds, page_handle.as_deref())
                .or_else(|| request.current.page_url.clone()),
            ..request.current.clone()
        })
    }
}

/// GraphQL-level errors. Throttling is the only retryable one.
fn check_top_level_errors(payload: &Value) -> Result<(), PortError> {
    let Some(errors) = payload.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    if errors.is_empty() {
        return Ok(());
    }
    let throttled = errors.iter().any(|e| {
        e.pointer("/extensions/code").and_then(Value::as_str) == Some("THROTTLED")
    });
    let message = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("; ");
    if throttled {
        Err(PortError::transient(Provider::Storefront, message))
    } else {
        Err(PortError::permanent(Provider::Storefront, message))
    }
}

fn mutation_payload(payload: &Value, operation: &str) -> Result<Value, PortError> {
    let provider = Provider::Storefront;
    let result = payload
        .get("data")
        .and_then(|d| d.get(operation))
        .filter(|v| !v.is_null())
        .ok_or_else(|| PortError::permanent(provider, format!("{operation} returned no data")))?;
    if let Some(user_errors) = result.get("userErrors").and_then(Value::as_array) {
        if !user_errors.is_empty() {
            let message = user_errors
                .iter()
                .map(|e| {
                    let field = e
                        .get("field")
                        .and_then(Value::as_array)
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(Value::as_str)
                                .collect::<Vec<_>>()
                                .join(".")
                        })
                        .unwrap_or_default();
                    let text = e.get("message").and_then(Value::as_str).unwrap_or("error");
                    if field.is_empty() {
                        text.to_string()
                    } else {
                        format!("{field}: {text}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PortError::permanent(
                provider,
                format!("{operation} rejected: {message}"),
            ));
        }
    }
    Ok(result.clone())
}

/// Media inputs for `productCreate`. Hosted URLs pass through, local files
/// go through `stage`, and local paths that no longer exist are skipped.
fn product_media<F>(image_paths: &[String], mut stage: F) -> Result<Vec<Value>, PortError>
where
    F: FnMut(&Path) -> Result<String, PortError>,
{
    let mut media = Vec::with_capacity(image_paths.len());
    for raw in image_paths {
        let source = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.clone()
        } else {
            let path = Path::new(raw.as_str());
            if !path.is_file() {
                warn!(path = raw.as_str(), "creative file missing, not attached to product");
                continue;
            }
            stage(path)?
        };
        media.push(json!({"originalSource": source, "mediaContentType": "IMAGE"}));
    }
    Ok(media)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UploadFile {
    file_name: String,
    mime: String,
}

impl UploadFile {
    fn for_path(path: &Path) -> Result<Self, PortError> {
        let file_name = path
            .file_name()
            .and_then(|v| v.to_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                PortError::permanent(
                    Provider::Storefront,
                    format!("creative path '{}' has no file name", path.display()),
                )
            })?;
        Ok(Self {
            file_name: file_name.to_string(),
            mime: mime_for_path(path),
        })
    }

    fn staged_input(&self) -> Value {
        json!({
            "resource": "IMAGE",
            "filename": self.file_name,
            "mimeType": self.mime,
            "httpMethod": "POST"
        })
    }
}

fn parse_staged_target(payload: &Value) -> Result<StagedTarget, PortError> {
    let provider = Provider::Storefront;
    let target = payload
        .get("stagedTargets")
        .and_then(Value::as_array)
        .and_then(|targets| targets.first())
        .ok_or_else(|| PortError::permanent(provider, "stagedUploadsCreate returned no target"))?;
    let field = |name: &str| {
        target
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                PortError::permanent(provider, format!("staged upload target has no {name}"))
            })
    };
    let parameters = target
        .get("parameters")
        .and_then(Value::as_array)
        .map(|params| {
            params
                .iter()
                .filter_map(|p| {
                    Some((
                        p.get("name")?.as_str()?.to_string(),
                        p.get("value")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(StagedTarget {
        url: field("url")?,
        resource_url: field("resourceUrl")?,
        parameters,
    })
}

fn string_at(value: &Value, object: &str, field: &str) -> Option<String> {
    value
        .get(object)
        .and_then(|o| o.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}
