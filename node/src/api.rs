use std::convert::Infallible;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use chordkv_lib::snapshot::RingSnapshot;

fn format_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    format_response(
        StatusCode::NOT_FOUND,
        json!({ "error": "Not Found" }).to_string(),
    )
}

fn ping() -> Response<Full<Bytes>> {
    let response_body = json!({ "message": "pong" }).to_string();
    format_response(StatusCode::OK, response_body)
}

fn status(snapshot: &RingSnapshot) -> Response<Full<Bytes>> {
    match serde_json::to_string(snapshot) {
        Ok(body) => format_response(StatusCode::OK, body),
        Err(e) => format_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

fn route(method: &Method, path: &str, snapshots: &watch::Receiver<RingSnapshot>) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/ping") => ping(),
        (&Method::GET, "/status") => status(&snapshots.borrow()),
        _ => not_found(),
    }
}

async fn handler(
    req: Request<hyper::body::Incoming>,
    snapshots: watch::Receiver<RingSnapshot>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &snapshots))
}

/// Serves `/ping` and `/status` on `address` until the listener fails.
pub async fn run(
    address: &str,
    snapshots: watch::Receiver<RingSnapshot>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(address).await?;

    info!("API is listening on http://{}", listener.local_addr()?);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let snapshots = snapshots.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handler(req, snapshots.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}
