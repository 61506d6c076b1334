use std::future::Future;

use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Read filter for [`Backend::query_single`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    eq: Vec<(String, String)>,
    order: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.eq.push((column.to_string(), value.to_string()));
        self
    }

    /// Newest first by `column`.
    pub fn latest_by(mut self, column: &str) -> Self {
        self.order = Some(format!("{}.desc", column));
        self
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .eq
            .iter()
            .map(|(c, v)| (c.clone(), format!("eq.{}", v)))
            .collect();
        if let Some(order) = &self.order {
            pairs.push(("order".to_string(), order.clone()));
        }
        pairs.push(("limit".to_string(), "1".to_string()));
        pairs
    }
}

/// The authority, as seen from the client: a read endpoint and an
/// invocation endpoint. Implementations must be cheap to share.
pub trait Backend: Send + Sync + 'static {
    /// Fetch exactly one row or fail with `NotFound`.
    fn query_single(&self, table: &str, filter: &Filter) -> impl Future<Output = Result<Value>> + Send;

    /// Call a server-side function. The response body is not used.
    fn invoke(&self, name: &str, method: Method) -> impl Future<Output = Result<()>> + Send;
}

/// HTTP implementation over one shared `reqwest::Client`.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestClient {
    pub fn new(base_url: &str, api_key: &str, access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request.header("apikey", &self.api_key).bearer_auth(bearer)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Authority {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

impl Backend for RestClient {
    async fn query_single(&self, table: &str, filter: &Filter) -> Result<Value> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let request = self.http.get(&url).query(&filter.query_pairs());
        let response = self.authorize(request).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound {
                table: table.to_string(),
            });
        }

        let rows: Vec<Value> = check_status(response).await?.json().await?;
        rows.into_iter().next().ok_or_else(|| SyncError::NotFound {
            table: table.to_string(),
        })
    }

    async fn invoke(&self, name: &str, method: Method) -> Result<()> {
        let url = format!("{}/functions/v1/{}", self.base_url, name);
        let request = self.http.request(method, &url);
        let response = self.authorize(request).send().await?;
        check_status(response).await?;
        Ok(())
    }
}
