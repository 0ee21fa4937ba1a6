use log::debug;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    AssetId, BranchId, BranchSummary, ListResponse, ProjectId, ProjectSummary, UserId,
    UserResponse,
};
use crate::{Result, SyncError};

/// Authenticated client for the project-hosting API.
#[derive(Clone, Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(SyncError::Config("API key is not set".to_string()));
        }
        Ok(ApiClient {
            client: authorized_client(api_key)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying client, carrying the bearer token as a default header.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Looks the user up by name. The name is sent as a single escaped path
    /// segment.
    pub async fn user_id(&self, username: &str) -> Result<UserId> {
        let mut url = url::Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("API URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .push("users")
            .push(username);
        let user: UserResponse = self.get_json_at(url.as_str(), &[]).await?;
        Ok(user.id)
    }

    pub async fn projects(&self, user_id: UserId) -> Result<Vec<ProjectSummary>> {
        let projects: ListResponse<ProjectSummary> = self
            .get_json(&format!("/users/{}/projects", user_id.0), &[])
            .await?;
        Ok(projects.result)
    }

    pub async fn branches(&self, project_id: ProjectId) -> Result<Vec<BranchSummary>> {
        let branches: ListResponse<BranchSummary> = self
            .get_json(&format!("/projects/{}/branches", project_id), &[])
            .await?;
        Ok(branches.result)
    }

    /// One page of the asset listing, kept as raw JSON so the cached manifest
    /// preserves every field the API returned.
    pub async fn assets_page(
        &self,
        project_id: ProjectId,
        branch_id: &BranchId,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Value>> {
        debug!("Fetching assets of project {} (skip={}, limit={})", project_id, skip, limit);
        let page: ListResponse<Value> = self
            .get_json(
                &format!("/projects/{}/assets", project_id),
                &[
                    ("branch", branch_id.0.clone()),
                    ("skip", skip.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(page.result)
    }

    pub async fn asset_detail(&self, asset_id: AssetId) -> Result<Value> {
        self.get_json(&format!("/assets/{}", asset_id), &[]).await
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.get_json_at(&format!("{}{}", self.base_url, path), query).await
    }

    async fn get_json_at<T>(&self, url: &str, query: &[(&str, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.client.get(url).query(query).send().await?;
        let response = check_status(response)?;
        Ok(response.json().await?)
    }
}

/// A client that sends `Authorization: Bearer <key>` on every request.
pub fn authorized_client(api_key: &str) -> Result<reqwest::Client> {
    let mut auth_value = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|_| SyncError::Config("API key contains invalid characters".to_string()))?;
    auth_value.set_sensitive(true);
    let mut default_headers = header::HeaderMap::new();
    default_headers.append(header::AUTHORIZATION, auth_value);
    Ok(reqwest::Client::builder()
        .default_headers(default_headers)
        .build()?)
}

/// Maps non-success statuses onto [`SyncError`] variants.
pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound(response.url().to_string())),
        status if !status.is_success() => Err(SyncError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        }),
        _ => Ok(response),
    }
}
