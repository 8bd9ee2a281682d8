//! 文件服务端点
//!
//! # 路由
//!
//! - `GET /` 共享列表（JSON）
//! - `GET|HEAD /files/:id` 内联预览
//! - `GET|HEAD /download/:id` 附件下载
//! - `GET /checksum/:id[?start=&end=]` 整文件或区间 SHA-256
//!
//! 所有请求先经过 [`guard`]：限速、令牌检查、访问日志、连接跟踪。

use crate::checksum::{self, ALGORITHM, Sha256Digest};
use crate::config::Settings;
use crate::error::{Result, ShareError};
use crate::logging::AccessLogEntry;
use crate::planner::{self, ByteRange};
use crate::share::{MediaKind, ShareEntry, ShareRegistry};
use crate::tracker::{ActionKind, ConnectionTracker};
use crate::transfer::range::{content_range, parse_range};
use crate::transfer::security::{AccessControl, RateLimiter};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// 服务端共享状态
pub struct AppState {
    pub registry: Arc<ShareRegistry>,
    pub tracker: Arc<ConnectionTracker>,
    pub access: AccessControl,
    pub limiter: RateLimiter,
    pub settings: Settings,
}

/// 文件服务器
pub struct FileServer {
    state: Arc<AppState>,
}

/// 运行中的服务器
pub struct ServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 供客户端使用的基础 URL
    pub fn base_url(&self) -> String {
        let host = if self.local_addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.local_addr.ip()
        };
        format!("http://{}", SocketAddr::new(host, self.local_addr.port()))
    }

    /// 停止接受新连接，等待进行中的请求结束
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Server task panicked: {}", e);
        }
        info!("File server on {} stopped", self.local_addr);
    }
}

impl FileServer {
    pub fn new(
        settings: &Settings,
        registry: Arc<ShareRegistry>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                registry,
                tracker,
                access: AccessControl::new(settings.access_token.clone()),
                limiter: RateLimiter::per_minute(settings.rate_limit_per_minute),
                settings: settings.clone(),
            }),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(list_handler))
            .route("/files/:id", get(preview_handler))
            .route("/download/:id", get(download_handler))
            .route("/checksum/:id", get(checksum_handler))
            .layer(middleware::from_fn_with_state(self.state.clone(), guard))
            .with_state(self.state.clone())
    }

    /// 绑定并在后台运行
    pub async fn start(&self, bind: SocketAddr) -> Result<ServerHandle> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ShareError::Bind {
                addr: bind.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let app = self.router();
        let nodelay = self.state.settings.enable_tcp_nodelay;

        let shutdown = cancel.clone();
        let limiter_state = self.state.clone();
        let task = tokio::spawn(async move {
            let prune = tokio::spawn(prune_loop(limiter_state, shutdown.clone()));
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .tcp_nodelay(nodelay)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
            if let Err(e) = serve.await {
                error!("File server error: {}", e);
            }
            shutdown.cancel();
            let _ = prune.await;
        });

        info!("File server listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            cancel,
            task,
        })
    }
}

async fn prune_loop(state: Arc<AppState>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => state.limiter.prune(),
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// 请求守卫：限速、令牌、访问日志、连接跟踪
async fn guard(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |c| c.0.ip());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let token = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|q| q.0.token);
    let admitted = state
        .limiter
        .check(client_ip)
        .and_then(|()| state.access.check(req.headers(), token.as_deref()));

    let response = match admitted {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    };

    let status = response.status();
    AccessLogEntry::new(client_ip, method.as_str(), &path, status.as_u16())
        .with_user_agent(user_agent.as_deref())
        .emit();

    if status.is_success() {
        let (kind, file_id) = classify(&path);
        state.tracker.record_access(client_ip, kind, file_id);
    }
    response
}

fn classify(path: &str) -> (ActionKind, Option<&str>) {
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let head = segments.next().unwrap_or_default();
    let id = segments.next().filter(|s| !s.is_empty());
    match head {
        "files" => (ActionKind::Preview, id),
        "download" => (ActionKind::Download, id),
        "checksum" => (ActionKind::Checksum, id),
        _ => (ActionKind::List, None),
    }
}

async fn list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.listing())
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    let entry = resolve_entry(&state, id).await?;
    serve_entry(&state, &entry, &method, &headers, Disposition::Inline).await
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response> {
    let entry = resolve_entry(&state, id).await?;
    serve_entry(&state, &entry, &method, &headers, Disposition::Attachment).await
}

/// 路径检查会访问文件系统，放到阻塞线程池
async fn resolve_entry(state: &AppState, id: String) -> Result<ShareEntry> {
    let registry = state.registry.clone();
    blocking(move || registry.resolve(&id)).await
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Inline,
    Attachment,
}

async fn serve_entry(
    state: &AppState,
    entry: &ShareEntry,
    method: &Method,
    request_headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response> {
    let mut file = tokio::fs::File::open(&entry.absolute_path).await?;
    // 以请求时的实际大小为准
    let file_size = file.metadata().await?.len();

    let requested = request_headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| ShareError::BadRequest("non-ASCII Range header".into()))
        })
        .transpose()?;
    let (status, range) = match requested {
        Some(value) => (StatusCode::PARTIAL_CONTENT, parse_range(value, file_size)?),
        None => (StatusCode::OK, ByteRange::new(0, file_size)),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
    if status == StatusCode::PARTIAL_CONTENT {
        headers.insert(
            header::CONTENT_RANGE,
            header_value(&content_range(&range, file_size))?,
        );
    }
    match disposition {
        Disposition::Attachment => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                header_value(&attachment_disposition(&entry.display_name))?,
            );
        }
        Disposition::Inline => {
            let content_type = match entry.media_kind() {
                MediaKind::Text => "text/plain; charset=utf-8".to_string(),
                _ => mime_guess::from_path(&entry.absolute_path)
                    .first_or_octet_stream()
                    .to_string(),
            };
            headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
            headers.insert(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
        }
    }

    if method == Method::HEAD {
        return Ok((status, headers).into_response());
    }

    debug!(
        "Serving {} bytes {}..{} of {}",
        entry.display_name, range.start, range.end, file_size
    );
    file.seek(SeekFrom::Start(range.start)).await?;
    let chunk = usize::try_from(planner::chunk_size_for(file_size, &state.settings))
        .unwrap_or(64 * 1024);
    let read_timeout = state.settings.upload_timeout();
    let stream = ReaderStream::with_capacity(file.take(range.len()), chunk)
        .timeout(read_timeout)
        .map(|item| {
            item.unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "file read stalled",
                ))
            })
        });
    Ok((status, headers, Body::from_stream(stream)).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ShareError::BadRequest(format!("invalid header value {value:?}: {e}")))
}

/// `attachment; filename="…"; filename*=UTF-8''…`
fn attachment_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(name.len() * 3);
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

#[derive(Deserialize)]
struct ChecksumQuery {
    start: Option<u64>,
    end: Option<u64>,
}

/// `/checksum/:id` 的响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumResponse {
    pub id: String,
    pub algorithm: String,
    pub digest: Sha256Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

async fn checksum_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ChecksumQuery>,
) -> Result<Json<ChecksumResponse>> {
    let entry = resolve_entry(&state, id.clone()).await?;
    let path = entry.absolute_path.clone();

    let digest = match (query.start, query.end) {
        (None, None) => {
            if let Some(cached) = state.registry.cached_digest(&entry) {
                cached
            } else {
                let digest = blocking(move || checksum::compute_file_digest(&path)).await?;
                state.registry.store_digest(&entry, digest);
                digest
            }
        }
        (Some(start), Some(end)) => {
            let size = tokio::fs::metadata(&path).await?.len();
            if start > end {
                return Err(ShareError::BadRequest(format!(
                    "checksum range {start}..{end} is reversed"
                )));
            }
            if end > size {
                return Err(ShareError::RangeNotSatisfiable { size });
            }
            blocking(move || checksum::compute_range_digest(&path, start, end)).await?
        }
        _ => {
            return Err(ShareError::BadRequest(
                "checksum range needs both start and end".into(),
            ));
        }
    };

    Ok(Json(ChecksumResponse {
        id,
        algorithm: ALGORITHM.to_string(),
        digest,
        start: query.start,
        end: query.end,
    }))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShareError::Io(std::io::Error::other(e)))?
}
