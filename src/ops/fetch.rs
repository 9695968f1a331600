//! Fetch Operation (Op)
//!
//! The only op that reaches the network. The origin allowlist is enforced
//! here, before any I/O, so no user-land shim is part of the trust
//! boundary. Redirects are followed only while the target origin equals the
//! origin of the original request; everything else is rejected regardless
//! of the allowlist.
//!
//! The request crosses the op boundary as a JSON envelope and the response
//! comes back the same way, with the body fully materialized as a string.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use v8;

use crate::config::SandboxConfig;
use crate::ops::bindings::{extract_string_arg, throw_error, throw_type_error};
use crate::runtime::JsRuntime;

/// Redirect chains longer than this are treated as errors.
const MAX_REDIRECTS: usize = 10;

/// Errors that can occur during the fetch op
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request URL's origin is not on the allowlist
    #[error("OriginNotAllowed: origin of '{0}' is not allowlisted")]
    OriginNotAllowed(String),

    /// The request URL is not a well-formed http(s) URL
    #[error("invalid fetch URL '{0}'")]
    InvalidUrl(String),

    /// The request failed in transit (includes rejected cross-origin redirects)
    #[error("fetch failed: {0}")]
    RequestFailed(String),

    /// The HTTP client could not be constructed
    #[error("HTTP client initialization failed: {0}")]
    ClientInit(String),
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Request envelope produced by the bootstrap's `fetch`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    /// Absolute request URL
    pub url: String,
    /// HTTP method, uppercased by the bootstrap
    #[serde(default = "default_method")]
    pub method: String,
    /// Header pairs in insertion order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request body, when present
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response envelope handed back to the bootstrap
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_text: String,
    /// Response header pairs
    pub headers: Vec<(String, String)>,
    /// Final URL after same-origin redirects
    pub url: String,
    /// Response body as text
    pub body: String,
}

/// Outbound HTTP stack: one reqwest client on a dedicated tokio runtime.
///
/// Ops are called synchronously from the engine thread, so requests are
/// driven to completion with `block_on`; the user-visible suspension point
/// is the `await` in the bootstrap's `fetch`.
pub struct HttpClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
}

impl HttpClient {
    /// Build the client with the same-origin-only redirect policy.
    pub fn new() -> FetchResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| FetchError::ClientInit(e.to_string()))?;

        let policy = reqwest::redirect::Policy::custom(|attempt| {
            let same_origin = attempt
                .previous()
                .first()
                .map(|first| first.origin() == attempt.url().origin())
                .unwrap_or(false);
            if !same_origin {
                attempt.error("cross-origin redirect rejected")
            } else if attempt.previous().len() > MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .map_err(|e| FetchError::ClientInit(e.to_string()))?;

        Ok(Self { runtime, client })
    }

    /// Perform one allowlist-checked request.
    pub fn fetch(&self, config: &SandboxConfig, request: FetchRequest) -> FetchResult<FetchResponse> {
        let url = Url::parse(&request.url)
            .map_err(|_| FetchError::InvalidUrl(request.url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(request.url.clone()));
        }
        if !config.is_origin_allowed(&url) {
            return Err(FetchError::OriginNotAllowed(request.url.clone()));
        }

        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchError::RequestFailed(format!("invalid method '{}'", request.method)))?;

        tracing::debug!("fetch {} {}", method, url);

        self.runtime.block_on(async {
            let mut builder = self.client.request(method, url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

            let status = response.status();
            let final_url = response.url().to_string();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).to_string(),
                    )
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

            Ok(FetchResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                headers,
                url: final_url,
                body,
            })
        })
    }
}

/// The fetch op: parse the envelope, perform the request, hand back JSON.
pub fn op_fetch(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let request_json = match extract_string_arg(scope, &args, 0) {
        Some(request_json) => request_json,
        None => {
            throw_type_error(scope, "fetch requires a request JSON argument");
            return;
        }
    };

    let request: FetchRequest = match serde_json::from_str(&request_json) {
        Ok(request) => request,
        Err(e) => {
            throw_type_error(scope, &format!("malformed fetch request: {}", e));
            return;
        }
    };

    let (config, http) = {
        let state = JsRuntime::state(scope);
        let state = state.borrow();
        (state.config.clone(), state.http.clone())
    };

    match http.fetch(&config, request) {
        Ok(response) => {
            let json = match serde_json::to_string(&response) {
                Ok(json) => json,
                Err(e) => {
                    throw_error(scope, &format!("fetch response serialization failed: {}", e));
                    return;
                }
            };
            if let Some(value) = v8::String::new(scope, &json) {
                rv.set(value.into());
            }
        }
        Err(err) => throw_error(scope, &err.to_string()),
    }
}
