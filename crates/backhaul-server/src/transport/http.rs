//! HTTP front door using hyper.
//!
//! Plain requests are handed to the [`HttpRelay`]. WebSocket upgrades for a
//! project host are completed here and handed to the [`WebSocketRelay`], so
//! one public port serves both. Relay failures map onto status codes.

use crate::relay::{HttpRelay, InboundRequest, OutboundResponse, WebSocketRelay};
use crate::transport::websocket;
use backhaul_core::{RelayError, RelayResult};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode, Uri};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// The relays reachable through the HTTP port.
#[derive(Clone)]
pub struct FrontDoor {
    pub http: Arc<HttpRelay>,
    pub websocket: Arc<WebSocketRelay>,
}

/// Serve the HTTP front door until the server fails.
pub async fn start_http_server(bind_addr: SocketAddr, front: FrontDoor) -> RelayResult<()> {
    let listener = TcpListener::bind(bind_addr)
        .map_err(|e| RelayError::Transport(format!("HTTP bind failed: {e}")))?;
    serve(listener, front).await
}

/// Serve on an already bound listener.
pub(crate) async fn serve(listener: TcpListener, front: FrontDoor) -> RelayResult<()> {
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote_addr = conn.remote_addr().ip();
        let front = front.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let front = front.clone();
                async move { Ok::<_, Infallible>(handle(&front, remote_addr, req).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)
        .map_err(|e| RelayError::Transport(format!("HTTP listener: {e}")))?
        .serve(make_svc);
    info!(addr = %local_addr, "HTTP listener started");

    server
        .await
        .map_err(|e| RelayError::Transport(format!("HTTP server: {e}")))
}

async fn handle(front: &FrontDoor, client_ip: IpAddr, req: Request<Body>) -> Response<Body> {
    if is_websocket_upgrade(req.headers()) {
        return upgrade(front.websocket.clone(), client_ip, req).await;
    }

    let inbound = match to_inbound(req).await {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(client = %client_ip, error = %e, "unreadable request");
            return plain(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };
    debug!(client = %client_ip, method = %inbound.method, url = %inbound.url, "inbound request");

    match front.http.handle(inbound).await {
        Ok(response) => to_response(response),
        Err(RelayError::RouteNotFound(host)) => {
            debug!(client = %client_ip, host = %host, "unknown host");
            plain(StatusCode::NOT_FOUND, "Not Found")
        }
        Err(e) => {
            warn!(client = %client_ip, error = %e, "relay failed");
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

/// `Upgrade: websocket` together with an `upgrade` token in `Connection`.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// Accept a WebSocket upgrade for a known project host and run its session
/// once hyper hands over the connection.
async fn upgrade(
    relay: Arc<WebSocketRelay>,
    client_ip: IpAddr,
    mut req: Request<Body>,
) -> Response<Body> {
    let Some(accept) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return plain(StatusCode::BAD_REQUEST, "Bad Request");
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return plain(StatusCode::BAD_REQUEST, "Bad Request");
    };

    let host = request_host(req.headers(), req.uri()).to_ascii_lowercase();
    let project = match relay.project_for(&host).await {
        Ok(project) => project,
        Err(e) => {
            debug!(client = %client_ip, host = %host, error = %e, "WebSocket for unknown host rejected");
            return plain(StatusCode::NOT_FOUND, "Not Found");
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(client = %client_ip, error = %e, "WebSocket upgrade failed");
                return;
            }
        };
        let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
        let (mut source, sink) = websocket::split(ws_stream);
        if let Err(e) = relay.initialize(&project, &mut source, Arc::new(sink)).await {
            warn!(client = %client_ip, error = %e, "WebSocket session error");
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// `Host` header, else the URI authority.
fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Capture method, display URL, header multimap and body.
async fn to_inbound(req: Request<Body>) -> RelayResult<InboundRequest> {
    let (parts, body) = req.into_parts();

    let host = request_host(&parts.headers, &parts.uri);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let scheme = parts.uri.scheme_str().unwrap_or("http");

    let mut inbound = InboundRequest::new(parts.method.as_str(), &format!("{scheme}://{host}{path}"));
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(value) => inbound = inbound.with_header(name.as_str(), value),
            Err(_) => debug!(header = %name, "non-text header skipped"),
        }
    }

    if !backhaul_core::HttpRequestModel::method_has_no_body(&inbound.method) {
        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|e| RelayError::Transport(format!("request body: {e}")))?;
        inbound = inbound.with_body(bytes.to_vec());
    }
    Ok(inbound)
}

fn to_response(outbound: OutboundResponse) -> Response<Body> {
    let status = StatusCode::from_u16(outbound.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(outbound.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &outbound.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "invalid header name skipped");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if let Some(content_type) = outbound
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    response
}

fn plain(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
