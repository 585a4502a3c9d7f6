//! Auxiliary HTTP listener: liveness, readiness and Prometheus metrics.

use std::convert::Infallible;

use anyhow::Result;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state behind every connection.
#[derive(Clone)]
pub struct Probes {
    metrics: Option<PrometheusHandle>,
    ready: watch::Receiver<bool>,
}

impl Probes {
    pub fn new(metrics: Option<PrometheusHandle>, ready: watch::Receiver<bool>) -> Self { Self { metrics, ready } }

    /// Status and body for a request line.
    pub fn route(&self, method: &Method, path: &str) -> (StatusCode, String) {
        if method != Method::GET {
            return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n".into());
        }
        match path {
            "/healthz" => (StatusCode::OK, "ok\n".into()),
            "/readyz" if *self.ready.borrow() => (StatusCode::OK, "ok\n".into()),
            "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "service list not synced\n".into()),
            "/metrics" => match &self.metrics {
                Some(h) => (StatusCode::OK, h.render()),
                None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed\n".into()),
            },
            _ => (StatusCode::NOT_FOUND, "not found\n".into()),
        }
    }

    fn respond(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        let (status, body) = self.route(req.method(), req.uri().path());
        let mut resp = Response::new(Full::new(Bytes::from(body)));
        *resp.status_mut() = status;
        resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        resp
    }
}

/// Serve probes on `listener` until `cancel` fires.
pub async fn serve(listener: TcpListener, probes: Probes, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let probes = probes.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let resp = probes.respond(&req);
                            async move { Ok::<_, Infallible>(resp) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(%peer, error = %e, "http connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "http accept failed"),
            }
        }
    }
    info!(%addr, "http shutdown");
    Ok(())
}
