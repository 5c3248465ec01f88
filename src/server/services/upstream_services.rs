use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use axum::http::{Method, header};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::server::utils::referer_utils::synthesize_referer;

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// connection refused, dns, timeouts, on every attempt
    #[error("network error after {attempts} attempt(s): {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    /// a transient status that never went away
    #[error("upstream returned {status} after {attempts} attempt(s)")]
    Status { status: u16, attempts: u32 },

    #[error("upstream deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
    Deadline { deadline: Duration, attempts: u32 },
}

impl UpstreamError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Network { attempts, .. }
            | Self::Status { attempts, .. }
            | Self::Deadline { attempts, .. } => *attempts,
        }
    }
}

/// what the handler asks for, only Range is ever taken from the client
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: Url,
    pub method: Method,
    pub range: Option<String>,
}

/// a response the caller has to deal with, success or not. redirects land here untouched
#[derive(Debug)]
pub struct UpstreamFetch {
    pub response: reqwest::Response,
    pub attempts: u32,
}

#[async_trait::async_trait]
pub trait UpstreamServiceTrait {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamFetch, UpstreamError>;
}

/// bookkeeping for one fetch, gone once it returns
#[derive(Default)]
struct RetryState {
    attempt_number: u32,
    last_error: Option<reqwest::Error>,
    last_status_code: Option<u16>,
}

impl RetryState {
    fn into_error(self) -> UpstreamError {
        match self.last_error {
            Some(source) => UpstreamError::Network {
                attempts: self.attempt_number,
                source,
            },
            None => UpstreamError::Status {
                status: self.last_status_code.unwrap_or(502),
                attempts: self.attempt_number,
            },
        }
    }
}

pub struct UpstreamService {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamService {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        // redirects go back to the player through the proxy, never followed here. the timeout
        // bounds idle gaps between reads, a healthy segment can take as long as it needs
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .context("Failed to build upstream http client")?;

        Ok(Self { http, config })
    }

    // headers are fixed, nothing from the client leaks through except Range
    fn build_request(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let method = if request.method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        };

        let referer = synthesize_referer(
            &request.url,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        );

        let mut builder = self
            .http
            .request(method, request.url.clone())
            .header(header::USER_AGENT, &self.config.user_agent)
            .header(header::ACCEPT, "*/*")
            .header(header::CONNECTION, "keep-alive")
            .header(header::REFERER, referer);

        if let Some(range) = &request.range {
            builder = builder.header(header::RANGE, range);
        }

        builder
    }

    async fn fetch_with_retry(
        &self,
        request: &UpstreamRequest,
        attempts: &AtomicU32,
    ) -> Result<UpstreamFetch, UpstreamError> {
        let mut state = RetryState::default();

        loop {
            state.attempt_number += 1;
            attempts.store(state.attempt_number, Ordering::Relaxed);

            debug!(
                "Upstream attempt {} for {}",
                state.attempt_number, request.url
            );

            match self.build_request(request).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if !self.config.is_retry_status(status) {
                        return Ok(UpstreamFetch {
                            response,
                            attempts: state.attempt_number,
                        });
                    }
                    state.last_status_code = Some(status);
                    state.last_error = None;
                }
                Err(e) => {
                    state.last_status_code = None;
                    state.last_error = Some(e);
                }
            }

            if state.attempt_number > self.config.max_retries {
                return Err(state.into_error());
            }

            let delay = self.config.backoff_for(state.attempt_number);
            match (&state.last_error, state.last_status_code) {
                (Some(e), _) => warn!(
                    "Upstream attempt {} failed ({}), retrying in {:?}",
                    state.attempt_number, e, delay
                ),
                (None, status) => warn!(
                    "Upstream attempt {} returned {:?}, retrying in {:?}",
                    state.attempt_number, status, delay
                ),
            }

            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl UpstreamServiceTrait for UpstreamService {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamFetch, UpstreamError> {
        let attempts = AtomicU32::new(0);

        let Some(deadline) = self.config.deadline else {
            return self.fetch_with_retry(request, &attempts).await;
        };

        match tokio::time::timeout(deadline, self.fetch_with_retry(request, &attempts)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Deadline {
                deadline,
                attempts: attempts.load(Ordering::Relaxed),
            }),
        }
    }
}
