use std::fmt;
use std::sync::Arc;

use bulwark_common::resilience::{
    AttemptContext, CallOptions, Clock, ResilienceError, ResilienceResult, ResilienceSettings,
    ResilientClient, SystemClock,
};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::{Client as ReqwestClient, IntoUrl, Method, Request, RequestBuilder, Response};
use tracing::debug;

use super::error::HttpError;
use crate::errors::InfraResult;

/// HTTP client whose requests run under per-service resilience policy.
///
/// Each service key gets its own `reqwest` transport, built on first use with
/// that service's connect timeout. Requests are cloned per attempt, so bodies
/// must be buffered.
pub struct ResilientHttpClient<C: Clock = SystemClock> {
    resilience: ResilientClient<C>,
    requests: ReqwestClient,
    transports: Arc<DashMap<String, ReqwestClient>>,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
}

impl<C: Clock> Clone for ResilientHttpClient<C> {
    fn clone(&self) -> Self {
        Self {
            resilience: self.resilience.clone(),
            requests: self.requests.clone(),
            transports: Arc::clone(&self.transports),
            user_agent: self.user_agent.clone(),
            default_headers: self.default_headers.clone(),
        }
    }
}

impl<C: Clock> fmt::Debug for ResilientHttpClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("resilience", &self.resilience)
            .field("transports", &self.transports.len())
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl ResilientHttpClient<SystemClock> {
    /// Convenience constructor over fresh resilience state.
    pub fn new(settings: ResilienceSettings) -> InfraResult<Self> {
        Self::builder(ResilientClient::new(settings)?).build()
    }
}

impl<C: Clock> ResilientHttpClient<C> {
    /// Start building a client on top of an existing resilient client.
    pub fn builder(resilience: ResilientClient<C>) -> ResilientHttpClientBuilder<C> {
        ResilientHttpClientBuilder { resilience, user_agent: None, default_headers: None }
    }

    /// The resilient client every request runs through.
    pub fn resilience(&self) -> &ResilientClient<C> {
        &self.resilience
    }

    /// Create a request builder. The service transport is chosen at send time.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.requests.request(method, url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Send a request under the service's policy.
    ///
    /// 4xx and 5xx responses are failures; 429, 408 and 5xx are retried, any
    /// other client error fails immediately.
    pub async fn send(
        &self,
        service: &str,
        builder: RequestBuilder,
    ) -> ResilienceResult<Response, HttpError> {
        self.send_with_options(service, &CallOptions::default(), builder).await
    }

    /// Send a request with per-call overrides.
    pub async fn send_with_options(
        &self,
        service: &str,
        options: &CallOptions,
        builder: RequestBuilder,
    ) -> ResilienceResult<Response, HttpError> {
        let transport = self.transport(service).map_err(|err| {
            ResilienceError::InvalidConfiguration {
                service: service.to_owned(),
                message: format!("failed to build HTTP transport: {err}"),
            }
        })?;

        let builder = &builder;
        self.resilience
            .execute_with_options(service, options, |ctx| {
                let request = builder
                    .try_clone()
                    .ok_or(HttpError::UnclonableRequest)
                    .and_then(|cloned| cloned.build().map_err(HttpError::Build));
                dispatch(transport.clone(), request, ctx)
            })
            .await
    }

    fn transport(&self, service: &str) -> Result<ReqwestClient, reqwest::Error> {
        if let Some(existing) = self.transports.get(service) {
            return Ok(existing.value().clone());
        }

        let connect_timeout = self.resilience.settings().resolve(service).connect_timeout;
        let mut builder = ReqwestClient::builder().connect_timeout(connect_timeout).no_proxy();
        if let Some(agent) = &self.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        if let Some(headers) = &self.default_headers {
            builder = builder.default_headers(headers.clone());
        }
        let client = builder.build()?;
        debug!(
            service,
            connect_timeout_ms = connect_timeout.as_millis() as u64,
            "Built HTTP transport"
        );

        let entry = self.transports.entry(service.to_owned()).or_insert(client);
        let transport = entry.value().clone();
        Ok(transport)
    }
}

async fn dispatch(
    transport: ReqwestClient,
    request: Result<Request, HttpError>,
    ctx: AttemptContext,
) -> Result<Response, HttpError> {
    let request = request?;
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!(service = %ctx.service, attempt = ctx.attempt, %method, %url, "Sending HTTP request");

    let response = transport.execute(request).await?;
    let status = response.status();
    debug!(
        service = %ctx.service,
        attempt = ctx.attempt,
        %method,
        %url,
        status = status.as_u16(),
        "Received HTTP response"
    );

    if status.is_client_error() || status.is_server_error() {
        return Err(HttpError::Status { status, url });
    }
    Ok(response)
}

/// Builder for [`ResilientHttpClient`].
#[derive(Debug)]
pub struct ResilientHttpClientBuilder<C: Clock = SystemClock> {
    resilience: ResilientClient<C>,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
}

impl<C: Clock> ResilientHttpClientBuilder<C> {
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn build(self) -> InfraResult<ResilientHttpClient<C>> {
        let requests = ReqwestClient::builder().no_proxy().build()?;

        Ok(ResilientHttpClient {
            resilience: self.resilience,
            requests,
            transports: Arc::new(DashMap::new()),
            user_agent: self.user_agent,
            default_headers: self.default_headers,
        })
    }
}
