//! The hyper service: accept loop, request dispatch, access logging.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn;
use hyper_util::server::graceful;
use hyper_util::service::TowerToHyperService;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tower_service::Service;
use tracing::{debug, error, info};

use vdc_api_types::api_err;

use crate::formatter::{self, ErrorMessageExtension};
use crate::router::{ApiHandler, Router};
use crate::Body;

const MAX_REQUEST_BODY_SIZE: usize = 512 * 1024;

/// Serve an API tree on a TCP listener until shutdown is requested, then
/// drain in-flight connections.
pub async fn serve(listener: TcpListener, router: &'static Router) -> Result<(), Error> {
    let graceful = graceful::GracefulShutdown::new();

    info!(
        "listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        tokio::select! {
            _ = crate::shutdown_future() => break,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                let service = ApiService { peer, router };
                let watcher = graceful.watcher();
                tokio::spawn(async move {
                    if let Err(err) = service.serve(conn, Some(watcher)).await {
                        debug!("connection error: {err:#}");
                    }
                });
            }
        }
    }

    debug!("listener stopped, draining connections");
    graceful.shutdown().await;
    Ok(())
}

/// Per-connection service carrying the peer address.
#[derive(Clone)]
pub struct ApiService {
    pub peer: std::net::SocketAddr,
    pub router: &'static Router,
}

impl ApiService {
    pub async fn serve<S>(
        self,
        conn: S,
        mut graceful: Option<graceful::Watcher>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = TowerToHyperService::new(self);
        let io = TokioIo::new(conn);
        let builder = conn::auto::Builder::new(TokioExecutor::new());
        let connection = builder.serve_connection_with_upgrades(io, service);
        if let Some(graceful) = graceful.take() {
            graceful.watch(connection).await
        } else {
            connection.await
        }
        .map_err(|err| format_err!("error serving connection: {err}"))
    }
}

impl Service<Request<Incoming>> for ApiService {
    type Response = Response<Body>;
    type Error = Error;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let router = self.router;
        let peer = self.peer;
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let response = handle_request(router, req).await;
            log_response(&peer, &method, &path, &response);
            Ok(response)
        })
    }
}

fn log_response(
    peer: &std::net::SocketAddr,
    method: &hyper::Method,
    path: &str,
    response: &Response<Body>,
) {
    let status = response.status();
    if status.is_success() || status.is_informational() {
        debug!("{} {path}: {} [client {peer}]", method.as_str(), status.as_u16());
    } else {
        let message = response
            .extensions()
            .get::<ErrorMessageExtension>()
            .map(|ext| ext.0.as_str())
            .unwrap_or("request failed");
        error!(
            "{} {path}: {} [client {peer}] {message}",
            method.as_str(),
            status.as_u16(),
        );
    }
}

/// Split a path into non-empty components; components starting with a dot
/// are illegal.
fn path_components(path: &str) -> Result<Vec<&str>, Error> {
    let mut components = Vec::new();
    for item in path.split('/') {
        if item.is_empty() {
            continue;
        }
        if item.starts_with('.') {
            return Err(api_err!(Validation, "path contains illegal components"));
        }
        components.push(item);
    }
    Ok(components)
}

async fn handle_request(router: &'static Router, req: Request<Incoming>) -> Response<Body> {
    match dispatch(router, req).await {
        Ok(response) => response,
        Err(err) => formatter::format_error(err),
    }
}

async fn dispatch(
    router: &'static Router,
    req: Request<Incoming>,
) -> Result<Response<Body>, Error> {
    let (parts, body) = req.into_parts();

    let components = path_components(parts.uri.path())?;
    let mut uri_params = HashMap::new();
    let target = router
        .find_route(&components, &mut uri_params)
        .ok_or_else(|| api_err!(NotFound, "no such endpoint '{}'", parts.uri.path()))?;

    let method = target.method(&parts.method).ok_or_else(|| {
        api_err!(
            Validation,
            "method {} not allowed on '{}'",
            parts.method,
            parts.uri.path()
        )
    })?;

    match method.handler {
        ApiHandler::Raw(handler) => {
            let params = build_params(&parts, None, uri_params)?;
            handler(Request::from_parts(parts, body), params).await
        }
        ApiHandler::Async(handler) => {
            let bytes = read_body(body).await?;
            let params = build_params(&parts, Some(&bytes), uri_params)?;
            let result = handler(params).await;
            Ok(formatter::format_result(result, method.success_status))
        }
    }
}

async fn read_body(body: Incoming) -> Result<Vec<u8>, Error> {
    let collected = body
        .collect()
        .await
        .map_err(|err| api_err!(Validation, "problems reading request body: {err}"))?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_REQUEST_BODY_SIZE {
        return Err(api_err!(Validation, "request body too large"));
    }
    Ok(bytes.to_vec())
}

/// Merge request parameters: json body fields, then query string pairs,
/// then uri path parameters (later sources win).
fn build_params(
    parts: &hyper::http::request::Parts,
    body: Option<&[u8]>,
    uri_params: HashMap<String, String>,
) -> Result<Value, Error> {
    let mut params = match body {
        Some(bytes) if !bytes.is_empty() => {
            let value: Value = serde_json::from_slice(bytes)
                .map_err(|err| api_err!(Validation, "invalid json body: {err}"))?;
            match value {
                Value::Object(map) => Value::Object(map),
                Value::Null => Value::Object(Map::new()),
                _ => return Err(api_err!(Validation, "request body must be a json object")),
            }
        }
        _ => Value::Object(Map::new()),
    };

    let map = params.as_object_mut().expect("params is an object");
    if let Some(query) = parts.uri.query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            map.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    for (key, value) in uri_params {
        map.insert(key, Value::String(value));
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_component_splitting() {
        assert_eq!(path_components("/api/vms/x").unwrap(), vec!["api", "vms", "x"]);
        assert_eq!(path_components("//api//vms/").unwrap(), vec!["api", "vms"]);
        assert!(path_components("/api/.hidden").is_err());
    }

    #[test]
    fn param_merging() {
        let req = Request::builder()
            .uri("/api/vms?verbose=1")
            .body(())
            .unwrap();
        let (parts, ()) = req.into_parts();

        let mut uri_params = HashMap::new();
        uri_params.insert("id".to_string(), "vm-1".to_string());

        let params = build_params(
            &parts,
            Some(br#"{ "name": "a", "id": "body-wins-not" }"#),
            uri_params,
        )
        .unwrap();

        assert_eq!(params["name"], "a");
        assert_eq!(params["verbose"], "1");
        // path parameters override body fields
        assert_eq!(params["id"], "vm-1");
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        let req = Request::builder().uri("/api/vms").body(()).unwrap();
        let (parts, ()) = req.into_parts();
        assert!(build_params(&parts, Some(b"[1,2,3]"), HashMap::new()).is_err());
        assert!(build_params(&parts, Some(b"not json"), HashMap::new()).is_err());
        assert!(build_params(&parts, Some(b""), HashMap::new()).is_ok());
    }
}
