use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// A request the mock server received. Header names are lowercase.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub type Handler = Arc<dyn Fn(&RecordedRequest) -> (StatusCode, Value) + Send + Sync>;

/// JSON-over-HTTP server answering every request through one handler.
pub struct MockHttpServer {
    url: Url,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockHttpServer {
    pub async fn start(handler: Handler) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock HTTP listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = {
            let requests = requests.clone();
            make_service_fn(move |_| {
                let handler = handler.clone();
                let requests = requests.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        serve_request(handler.clone(), requests.clone(), req)
                    }))
                }
            })
        };

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock HTTP server stopped: {err}");
            }
        });

        Ok(Self {
            url: Url::parse(&format!("http://{addr}")).context("invalid mock server URL")?,
            requests,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Always answers `status` with `body`.
    pub async fn respond_with(status: StatusCode, body: Value) -> Result<Self> {
        Self::start(Arc::new(move |_| (status, body.clone()))).await
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    pub fn endpoint(&self, path: &str) -> Url {
        self.url.join(path).expect("mock endpoint path should be valid")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    handler: Handler,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
        })
        .collect();

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                let mut response =
                    Response::new(Body::from(format!("invalid JSON payload: {err}")));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                return Ok(response);
            }
        }
    };

    let recorded = RecordedRequest {
        method,
        path,
        headers,
        body,
    };
    let (status, value) = handler(&recorded);
    requests.lock().expect("request log poisoned").push(recorded);

    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
