//! HTTP client for the collection API.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use reqwest::{Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::cache::entry::Page;
use crate::config::Config;
use crate::descriptor::QueryDescriptor;
use crate::error::RemoteError;
use crate::remote::client::{MutationRequest, RemoteClient};
use crate::remote::wire::{
  ApiCreateRequest, ApiDeleteRequest, ApiErrorBody, ApiRow, ApiSearchRequest, ApiSearchResponse,
  ApiUpdateRequest,
};
use crate::row::Row;

/// Collection API client. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct HttpRemoteClient {
  http: reqwest::Client,
  base_url: String,
  token: String,
}

impl HttpRemoteClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;

    // Validate the base URL up front so request building can't fail later
    let base = Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.api.base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(config.api.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: base.to_string().trim_end_matches('/').to_string(),
      token,
    })
  }

  async fn send<T: serde::Serialize>(
    &self,
    method: Method,
    url: String,
    body: &T,
  ) -> Result<reqwest::Response, RemoteError> {
    let response = self
      .http
      .request(method, &url)
      .bearer_auth(&self.token)
      .json(body)
      .send()
      .await?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
  }
}

/// Map a non-2xx response to the error taxonomy: a 4xx with a parseable
/// message body is a validation rejection the user should read verbatim,
/// everything else is transport.
fn classify_failure(status: StatusCode, body: &str) -> RemoteError {
  if status.is_client_error() {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
      if !parsed.message.is_empty() {
        return RemoteError::Validation {
          message: parsed.message,
        };
      }
    }
  }
  RemoteError::Transport(format!("HTTP {}", status))
}

#[async_trait::async_trait]
impl RemoteClient for HttpRemoteClient {
  async fn fetch_page(
    &self,
    descriptor: &QueryDescriptor,
    page_token: Option<u64>,
  ) -> Result<Page, RemoteError> {
    let url = format!("{}/api/{}/search", self.base_url, descriptor.resource);
    let request = ApiSearchRequest {
      filters: &descriptor.filters,
      date_range: descriptor.date_range.as_ref(),
      sort: descriptor.sort.as_ref(),
      limit: descriptor.limit,
      page_token,
    };

    let response = self.send(Method::POST, url, &request).await?;
    let body: ApiSearchResponse = response.json().await?;

    debug!(
      resource = %descriptor.resource,
      rows = body.items.len(),
      has_more = body.next_page_token.is_some(),
      "page fetched"
    );
    Ok(Page::new(
      body.items.into_iter().map(ApiRow::into_row).collect(),
      body.next_page_token,
    ))
  }

  async fn mutate(&self, request: &MutationRequest) -> Result<Option<Row>, RemoteError> {
    let response = match request {
      MutationRequest::Create { resource, row } => {
        let url = format!("{}/api/{}", self.base_url, resource);
        let body = ApiCreateRequest {
          id: &row.id,
          fields: &row.fields,
        };
        self.send(Method::POST, url, &body).await?
      }
      MutationRequest::Update {
        resource,
        id,
        fields,
      } => {
        let url = format!("{}/api/{}/{}", self.base_url, resource, id);
        self.send(Method::PATCH, url, &ApiUpdateRequest { fields }).await?
      }
      MutationRequest::Delete { resource, ids } => {
        let url = format!("{}/api/{}/delete", self.base_url, resource);
        self.send(Method::POST, url, &ApiDeleteRequest { ids }).await?
      }
    };

    // Deletes and some updates come back with an empty body
    Ok(response.json::<ApiRow>().await.ok().map(ApiRow::into_row))
  }
}
