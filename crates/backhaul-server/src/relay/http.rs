//! HTTP relay: turns an inbound HTTP call into a bus round-trip.
//!
//! The request is serialized into an [`HttpRequestModel`], published to the
//! owning tenant's request exchange, and the caller waits on the correlator
//! until the agent's [`HttpResponseModel`] arrives or the timeout fires.

use super::correlator::RequestCorrelator;
use crate::consumer::{start_consumer, DeliveryHandler};
use crate::directory::RouteDirectory;
use crate::topology::TopologyManager;
use backhaul_core::envelope::HeaderList;
use backhaul_core::names::{self, headers};
use backhaul_core::{
    BoxFuture, HttpRequestModel, HttpResponseModel, Message, MessageBus, Properties, RelayError,
    RelayResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Response headers never copied to the client.
const EXCLUDED_RESPONSE_HEADERS: &[&str] = &["transfer-encoding"];

/// An HTTP request as accepted by the front door.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    /// Full display URL, including scheme, host and query.
    pub url: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value.to_string()),
            None => self
                .headers
                .push((name.to_string(), vec![value.to_string()])),
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Host the client addressed: the `Host` header, else the URL authority.
    pub fn host(&self) -> Option<String> {
        let from_header = self
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("host"))
            .and_then(|(_, values)| values.first().cloned());
        from_header.or_else(|| {
            let rest = self.url.split_once("://")?.1;
            let authority = rest.split(['/', '?', '#']).next()?;
            (!authority.is_empty()).then(|| authority.to_string())
        })
    }

    /// Serialize for the agent. Bodyless methods never carry bytes.
    fn into_envelope(self) -> HttpRequestModel {
        let bytes = if HttpRequestModel::method_has_no_body(&self.method) {
            None
        } else {
            Some(self.body)
        };
        HttpRequestModel {
            request_url: self.url,
            method: self.method,
            headers: self.headers,
            bytes,
        }
    }
}

/// The response the front door writes back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    pub fn status_only(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn redirect(permanent: bool, location: &str) -> Self {
        Self {
            status: if permanent { 301 } else { 302 },
            content_type: None,
            headers: vec![("Location".to_string(), vec![location.to_string()])],
            body: Vec::new(),
        }
    }

    /// Replay an agent response onto the client connection.
    pub fn from_agent(response: HttpResponseModel) -> Self {
        if response.is_redirected {
            if let Some(url) = response.redirect_url.as_deref() {
                let permanent = matches!(response.http_status_code, 301 | 308);
                return Self::redirect(permanent, url);
            }
            warn!(status = response.http_status_code, "redirect without target; relaying as-is");
        }

        let headers = response
            .headers
            .into_iter()
            .filter(|(name, _)| {
                !EXCLUDED_RESPONSE_HEADERS
                    .iter()
                    .any(|excluded| name.eq_ignore_ascii_case(excluded))
            })
            .collect();

        let body = match response.string_content {
            Some(text) if !text.is_empty() => text.into_bytes(),
            _ => response.bytes.unwrap_or_default(),
        };

        Self {
            status: response.http_status_code,
            content_type: response.content_type,
            headers,
            body,
        }
    }
}

/// Relays HTTP requests to tenant agents.
pub struct HttpRelay {
    directory: Arc<RouteDirectory>,
    topology: Arc<TopologyManager>,
    bus: Arc<dyn MessageBus>,
    correlator: Arc<RequestCorrelator>,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(
        directory: Arc<RouteDirectory>,
        topology: Arc<TopologyManager>,
        bus: Arc<dyn MessageBus>,
        correlator: Arc<RequestCorrelator>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            topology,
            bus,
            correlator,
            timeout,
        }
    }

    /// Declare the response queue and start completing pending requests
    /// from it.
    pub async fn start_response_consumer(&self) -> RelayResult<JoinHandle<()>> {
        self.topology.ensure_response_queue().await?;
        let handler = Arc::new(ResponseHandler {
            correlator: self.correlator.clone(),
        });
        start_consumer(self.bus.as_ref(), names::RESPONSE_QUEUE, handler).await
    }

    /// Relay one request and wait for the agent's answer.
    ///
    /// Unknown hosts fail with [`RelayError::RouteNotFound`]; a missing
    /// answer becomes a 504.
    pub async fn handle(&self, request: InboundRequest) -> RelayResult<OutboundResponse> {
        let request_id = Uuid::new_v4().to_string();
        let host = request
            .host()
            .ok_or_else(|| RelayError::RouteNotFound("(no host)".to_string()))?;

        let project = self.directory.resolve(&host).await?;
        let project_host = self.directory.project_host(&project);
        let username = project.customer.username.as_str();

        let method = request.method.clone();
        let body = serde_json::to_vec(&request.into_envelope())?;

        self.topology.ensure_tenant_request_queue(username).await?;

        let properties = Properties::default()
            .with_message_id(request_id.as_str())
            .with_header(headers::INTERNAL_URL, project.internal_url.as_str())
            .with_header(headers::HOST, project_host.as_str());
        let message = Message::new(body).with_properties(properties);

        let pending = self.correlator.register(&request_id).await;
        if let Err(e) = self
            .bus
            .publish(names::REQUEST_EXCHANGE, username, message)
            .await
        {
            self.correlator.cancel(pending).await;
            return Err(e);
        }
        debug!(request_id = %pending.id(), method = %method, host = %project_host, "request published");

        match self.correlator.wait(pending, self.timeout).await {
            Ok(response) => Ok(OutboundResponse::from_agent(response)),
            Err(RelayError::ResponseTimeout) => {
                let still_pending = self.correlator.pending_count().await;
                info!(
                    request_id = %request_id,
                    host = %project_host,
                    still_pending,
                    "agent did not answer in time"
                );
                Ok(OutboundResponse::status_only(504))
            }
            Err(e) => Err(e),
        }
    }
}

/// Completes pending requests from `response_bus`.
struct ResponseHandler {
    correlator: Arc<RequestCorrelator>,
}

impl DeliveryHandler for ResponseHandler {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let request_id = message
                .properties
                .message_id
                .as_deref()
                .ok_or_else(|| RelayError::MissingHeader("MessageId".to_string()))?;
            let response: HttpResponseModel = serde_json::from_slice(&message.body)
                .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;
            if !self.correlator.complete(request_id, response).await {
                debug!(request_id = %request_id, "late or duplicate response ignored");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{project, spawn_echo_agent};
    use backhaul_core::{DomainType, MemoryBus};

    struct Harness {
        bus: Arc<MemoryBus>,
        relay: HttpRelay,
        correlator: Arc<RequestCorrelator>,
    }

    fn header<'a>(response: &'a OutboundResponse, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().map(String::as_str))
    }

    async fn harness(timeout: Duration) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let directory = Arc::new(RouteDirectory::new(".app.example.com"));
        directory
            .refresh(vec![
                project("alice", "acme", DomainType::Default),
                project("bob", "bob.io", DomainType::Custom),
            ])
            .await;
        let topology = Arc::new(TopologyManager::new(bus.clone()));
        let correlator = Arc::new(RequestCorrelator::new());
        let relay = HttpRelay::new(directory, topology, bus.clone(), correlator.clone(), timeout);
        relay.start_response_consumer().await.unwrap();
        Harness {
            bus,
            relay,
            correlator,
        }
    }

    #[test]
    fn test_inbound_host_from_header_then_url() {
        let req = InboundRequest::new("GET", "https://a.example.com:8443/x?y=1");
        assert_eq!(req.host().as_deref(), Some("a.example.com:8443"));
        let req = req.with_header("Host", "b.example.com");
        assert_eq!(req.host().as_deref(), Some("b.example.com"));
        assert_eq!(InboundRequest::new("GET", "/relative").host(), None);
    }

    #[test]
    fn test_envelope_skips_body_for_get() {
        let env = InboundRequest::new("GET", "https://a/").with_body("ignored").into_envelope();
        assert!(env.bytes.is_none());
        let env = InboundRequest::new("POST", "https://a/").with_body("data").into_envelope();
        assert_eq!(env.bytes.as_deref(), Some(&b"data"[..]));
    }

    #[test]
    fn test_agent_response_replay() {
        let mut agent = HttpResponseModel::text(201, "");
        agent.bytes = Some(vec![1, 2, 3]);
        agent.content_type = Some("application/octet-stream".into());
        agent.headers = vec![
            ("Transfer-Encoding".into(), vec!["chunked".into()]),
            ("X-Trace".into(), vec!["a".into(), "b".into()]),
        ];
        let out = OutboundResponse::from_agent(agent);
        assert_eq!(out.status, 201);
        assert_eq!(out.body, vec![1, 2, 3]);
        assert_eq!(out.content_type.as_deref(), Some("application/octet-stream"));
        assert!(header(&out, "transfer-encoding").is_none());
        assert_eq!(out.headers[0].1, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_string_body_preferred_over_bytes() {
        let mut agent = HttpResponseModel::text(200, "ok");
        agent.bytes = Some(b"raw".to_vec());
        assert_eq!(OutboundResponse::from_agent(agent).body, b"ok");
    }

    #[test]
    fn test_redirects() {
        let permanent = OutboundResponse::from_agent(HttpResponseModel::redirect(308, "https://n/"));
        assert_eq!(permanent.status, 301);
        assert_eq!(header(&permanent, "location"), Some("https://n/"));

        let temporary = OutboundResponse::from_agent(HttpResponseModel::redirect(307, "https://t/"));
        assert_eq!(temporary.status, 302);
        assert_eq!(header(&temporary, "Location"), Some("https://t/"));
    }

    #[tokio::test]
    async fn test_round_trip_through_agent() {
        let h = harness(Duration::from_secs(5)).await;
        spawn_echo_agent(h.bus.clone(), "alice", HttpResponseModel::text(200, "ok")).await;

        let req = InboundRequest::new("GET", "https://acme.app.example.com/hello")
            .with_header("Host", "acme.app.example.com");
        let resp = h.relay.handle(req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
        assert_eq!(h.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_published_envelope_and_headers() {
        let h = harness(Duration::from_millis(50)).await;
        let req = InboundRequest::new("POST", "https://bob.io/submit")
            .with_header("Host", "bob.io")
            .with_header("Content-Type", "text/plain")
            .with_body("payload");
        let resp = h.relay.handle(req).await.unwrap();
        assert_eq!(resp.status, 504);

        let published = h.bus.get("bob_request_bus").await.unwrap();
        let props = &published.properties;
        assert!(props.message_id.is_some());
        assert_eq!(props.text("Host").unwrap(), "bob.io");
        assert_eq!(props.text("IntUrl").unwrap(), "http://localhost:3000");
        let envelope: HttpRequestModel = serde_json::from_slice(&published.body).unwrap();
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.request_url, "https://bob.io/submit");
        assert_eq!(envelope.bytes.as_deref(), Some(&b"payload"[..]));
        assert!(h.bus.get("bob_request_bus").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_answer_is_gateway_timeout() {
        let h = harness(Duration::from_secs(100)).await;
        let req = InboundRequest::new("GET", "https://acme.app.example.com/")
            .with_header("Host", "acme.app.example.com");
        let resp = h.relay.handle(req).await.unwrap();
        assert_eq!(resp.status, 504);
        assert!(resp.body.is_empty());
        assert_eq!(h.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_host_is_route_not_found() {
        let h = harness(Duration::from_secs(1)).await;
        let req = InboundRequest::new("GET", "https://nope.example.com/")
            .with_header("Host", "nope.example.com");
        assert!(matches!(
            h.relay.handle(req).await,
            Err(RelayError::RouteNotFound(_))
        ));
        assert_eq!(h.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_response_is_dropped() {
        let h = harness(Duration::from_secs(1)).await;
        let bad = Message::new("not json")
            .with_properties(Properties::default().with_message_id("whatever"));
        h.bus.publish("response", "", bad).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.bus.depth("response_bus").await != Some(0)
                || h.bus.in_flight("response_bus").await != Some(0)
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
