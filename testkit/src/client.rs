//! Shared plumbing for REST calls: client construction, status checks and decoding.
use std::time;

use reqwest::header;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

const USER_AGENT: &str = "sync-gateway-testkit";

/// Build a client that sends JSON by default and gives up on a request after `timeout`.
pub fn build_client(timeout: Option<time::Duration>) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(USER_AGENT);

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder.build()
}

/// Send a request, turning transport failures and non-2xx statuses into `ApiError`.
pub async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
    let (client, request) = request.build_split();
    let request = request.map_err(ApiError::Client)?;
    let url = request.url().to_string();

    let response = client
        .execute(request)
        .await
        .map_err(|source| ApiError::Request {
            url: url.clone(),
            source,
        })?;

    check_status(response).await
}

/// Keep 2xx responses, read the body of anything else into an `ApiError::Status`.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();

    Err(ApiError::Status { url, status, body })
}

pub async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let url = response.url().to_string();

    response
        .json::<T>()
        .await
        .map_err(|source| ApiError::Decode { url, source })
}

/// Send a request and decode its JSON body.
pub async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ApiError> {
    let response = send(request).await?;
    decode(response).await
}
