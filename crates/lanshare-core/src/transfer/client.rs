//! 下载客户端
//!
//! 多线程、可续传、带完整性校验的 HTTP 下载。
//!
//! # 流程
//!
//! 1. `HEAD` 查询远端大小
//! 2. 查询续传记录：有效则只下载 `[bytes_completed, total)` 一个区间，否则由规划器切分
//! 3. 预分配 `<dest>.partial`，每个工作任务打开自己的句柄，写各自不相交的区间
//! 4. 任一工作任务失败或被取消：取消其余任务，保存连续写入的最高偏移，状态 `Interrupted`
//! 5. 全部完成后校验整文件摘要：一致则重命名为目标文件并删除续传记录，否则 `Failed`
//!
//! 区间摘要或整文件摘要不匹配都按 `Failed` 处理，删除续传记录，保留部分文件。
//! 每个请求等待响应头的时间和读取停滞的时间共用 `read_stall_timeout`。
//!
//! 同一个目标路径不能同时有两个下载任务，调用方负责保证。

use crate::checksum::{self, Sha256Digest};
use crate::config::Settings;
use crate::error::{Result, ShareError};
use crate::planner::{self, ByteRange, ThreadPlan};
use crate::resume::ResumeStore;
use crate::share::ShareListing;
use crate::transfer::progress::{ProgressCounter, ProgressSnapshot, SpeedMeter};
use crate::transfer::server::ChecksumResponse;
use crate::transfer::task::{TaskState, TransferTask, partial_path_for};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 下载事件回调
pub trait DownloadCallback: Send + Sync {
    /// 状态变化
    fn on_state(&self, _state: TaskState) {}

    /// 周期性进度
    fn on_progress(&self, _progress: &ProgressSnapshot) {}
}

/// 不关心事件时使用
pub struct NoopCallback;

impl DownloadCallback for NoopCallback {}

/// 下载请求
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// 已知的整文件摘要；为空时从服务端 `/checksum` 获取
    pub expected_checksum: Option<Sha256Digest>,
    /// 覆盖配置的最大线程数
    pub threads: Option<usize>,
    /// 忽略并删除已有的续传记录
    pub fresh: bool,
    /// 服务端要求的访问令牌
    pub token: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: &str, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.to_string(),
            destination: destination.into(),
            ..Default::default()
        }
    }
}

/// 下载成功后的摘要
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub destination: PathBuf,
    pub total_bytes: u64,
    /// 续传起点，0 表示从头下载
    pub resumed_from: u64,
    pub threads: usize,
    /// 完成校验的摘要（无法获取期望值时为空）
    pub digest: Option<Sha256Digest>,
    pub elapsed: Duration,
}

/// 后台运行的下载
pub struct DownloadHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<DownloadReport>>,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<DownloadReport> {
        self.task
            .await
            .map_err(|e| ShareError::Io(std::io::Error::other(e)))?
    }
}

/// 下载客户端
pub struct DownloadClient {
    http: reqwest::Client,
    settings: Settings,
    resume: ResumeStore,
    permits: Arc<Semaphore>,
    progress_interval: Duration,
}

impl DownloadClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_resume_store(settings, ResumeStore::new(settings.resume_dir()))
    }

    pub fn with_resume_store(settings: &Settings, resume: ResumeStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .tcp_nodelay(settings.enable_tcp_nodelay)
            .build()?;
        Ok(Self {
            http,
            settings: settings.clone(),
            resume,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            progress_interval: Duration::from_millis(500),
        })
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn resume_store(&self) -> &ResumeStore {
        &self.resume
    }

    /// 获取对端 `GET /` 的共享列表
    pub async fn fetch_listing(&self, base: &Url, token: Option<&str>) -> Result<ShareListing> {
        let limit = self.settings.read_stall_timeout();
        let response = within(limit, base.as_str(), self.get(base.clone(), token).send()).await?;
        ensure_success(response.status(), base.as_str())?;
        within(limit, base.as_str(), response.json()).await
    }

    /// 同时下载多个文件
    ///
    /// 并发数受 `max_concurrent_downloads` 限制，结果与请求一一对应，单个失败不影响其他文件。
    pub async fn download_many(
        &self,
        requests: Vec<DownloadRequest>,
        callback: Arc<dyn DownloadCallback>,
        cancel: CancellationToken,
    ) -> Vec<Result<DownloadReport>> {
        let downloads = requests
            .into_iter()
            .map(|request| self.download(request, callback.clone(), cancel.clone()));
        futures_util::future::join_all(downloads).await
    }

    /// 在后台任务中下载
    pub fn spawn(
        self: &Arc<Self>,
        request: DownloadRequest,
        callback: Arc<dyn DownloadCallback>,
    ) -> DownloadHandle {
        let cancel = CancellationToken::new();
        let client = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { client.download(request, callback, token).await });
        DownloadHandle { cancel, task }
    }

    /// 下载到 `request.destination`
    pub async fn download(
        &self,
        request: DownloadRequest,
        callback: Arc<dyn DownloadCallback>,
        cancel: CancellationToken,
    ) -> Result<DownloadReport> {
        let _permit = tokio::select! {
            () = cancel.cancelled() => return Err(ShareError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ShareError::Cancelled)?,
        };
        let started = Instant::now();

        let total = self.remote_size(&request).await?;
        let destination = request.destination.clone();
        let partial = partial_path_for(&destination);

        if request.fresh {
            self.resume.clear(&request.url, &destination)?;
        }
        let record = if request.fresh {
            None
        } else {
            self.resume
                .load_valid(&request.url, &destination, &partial, total)
        };

        let settings = self.effective_settings(request.threads);
        let chunk_size = planner::chunk_size_for(total, &settings);
        let (plan, resumed_from, expected) = match &record {
            Some(r) if r.bytes_completed > 0 => (
                ThreadPlan::resume_suffix(r.bytes_completed, total, chunk_size),
                r.bytes_completed,
                request.expected_checksum.or(r.expected_checksum),
            ),
            _ => (planner::plan(total, &settings), 0, request.expected_checksum),
        };

        let mut task = TransferTask::new(&request.url, destination.clone(), total, expected, plan);
        task.bytes_completed = resumed_from;
        let threads = task.thread_plan.thread_count();
        info!(
            "Downloading {} -> {:?} ({} bytes, {} thread(s), resume at {})",
            request.url, destination, total, threads, resumed_from
        );

        prepare_partial(&partial, total, resumed_from > 0).await?;
        advance(&mut task, TaskState::InProgress, callback.as_ref());

        if let Err(e) = self
            .run_workers(&request, &mut task, &partial, callback.clone(), &cancel)
            .await
        {
            self.settle_failure(&mut task, &e, callback.as_ref());
            return Err(e);
        }

        advance(&mut task, TaskState::Verifying, callback.as_ref());
        let digest = match self.verify_whole(&request, &task, &partial).await {
            Ok(digest) => digest,
            Err(e) => {
                // 传输错误时数据已完整，下次续传只需重新校验
                self.settle_failure(&mut task, &e, callback.as_ref());
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, &destination).await?;
        self.resume.clear(&request.url, &destination)?;
        advance(&mut task, TaskState::Completed, callback.as_ref());

        let elapsed = started.elapsed();
        info!(
            "Downloaded {:?} ({} bytes) in {:.1}s",
            destination,
            total,
            elapsed.as_secs_f64()
        );
        Ok(DownloadReport {
            destination,
            total_bytes: total,
            resumed_from,
            threads,
            digest,
            elapsed,
        })
    }

    /// 摘要不匹配：删除续传记录，`Failed`；其他错误：保存续传记录，`Interrupted`
    fn settle_failure(
        &self,
        task: &mut TransferTask,
        err: &ShareError,
        callback: &dyn DownloadCallback,
    ) {
        if matches!(err, ShareError::Integrity { .. }) {
            // 数据已损坏，续传没有意义；保留部分文件供检查
            if let Err(clear_err) = self.resume.clear(&task.source_url, &task.destination_path) {
                error!("Failed to clear resume record: {}", clear_err);
            }
            advance(task, TaskState::Failed, callback);
            warn!("Download of {} failed: {}", task.source_url, err);
            return;
        }

        advance(task, TaskState::Interrupted, callback);
        match self.resume.save(&task.to_resume_record()) {
            Ok(()) => info!(
                "Download of {} interrupted at {}/{} bytes: {}",
                task.source_url, task.bytes_completed, task.total_bytes, err
            ),
            Err(save_err) => error!("Failed to save resume record: {}", save_err),
        }
    }

    fn effective_settings(&self, threads: Option<usize>) -> Settings {
        let mut settings = self.settings.clone();
        if let Some(n) = threads {
            settings.max_download_threads = n.clamp(1, crate::config::MAX_DOWNLOAD_THREADS_LIMIT);
            settings.enable_multithreaded_download = n > 1;
        }
        settings
    }

    fn get(&self, url: impl reqwest::IntoUrl, token: Option<&str>) -> reqwest::RequestBuilder {
        let builder = self.http.get(url);
        match token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    /// 远端文件大小
    ///
    /// 优先使用 `HEAD` 的 `Content-Length`；服务端不支持时改用 `Range: bytes=0-0`
    /// 读取 `Content-Range` 中的总大小。
    async fn remote_size(&self, request: &DownloadRequest) -> Result<u64> {
        let limit = self.settings.read_stall_timeout();
        let mut head = self.http.head(&request.url);
        if let Some(t) = &request.token {
            head = head.bearer_auth(t);
        }
        let response = within(limit, &request.url, head.send()).await?;
        ensure_success(response.status(), &request.url)?;
        if let Some(len) = header_u64(response.headers().get(CONTENT_LENGTH)) {
            return Ok(len);
        }

        debug!("HEAD without Content-Length, asking for a one-byte range");
        let range = self
            .get(&request.url, request.token.as_deref())
            .header(RANGE, "bytes=0-0");
        let response = within(limit, &request.url, range.send()).await?;
        ensure_success(response.status(), &request.url)?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                ShareError::transport(format!("{} did not report its size", request.url))
            })
    }

    async fn run_workers(
        &self,
        request: &DownloadRequest,
        task: &mut TransferTask,
        partial: &Path,
        callback: Arc<dyn DownloadCallback>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ranges: Vec<ByteRange> = task
            .thread_plan
            .ranges
            .iter()
            .copied()
            .filter(|r| !r.is_empty())
            .collect();
        if ranges.is_empty() {
            return Ok(());
        }

        let counter = ProgressCounter::new(task.total_bytes, task.bytes_completed);
        let workers_cancel = cancel.child_token();
        let verify_url = if self.settings.verify_chunks {
            checksum_url(&request.url)
        } else {
            None
        };

        let flushed: Vec<Arc<AtomicU64>> =
            ranges.iter().map(|_| Arc::new(AtomicU64::new(0))).collect();
        let mut handles = Vec::with_capacity(ranges.len());
        for (range, done) in ranges.iter().zip(&flushed) {
            let job = RangeJob {
                http: self.http.clone(),
                url: request.url.clone(),
                token: request.token.clone(),
                partial: partial.to_path_buf(),
                range: *range,
                buffer_size: self.settings.tcp_buffer_size.max(8 * 1024),
                stall_timeout: self.settings.read_stall_timeout(),
                verify_url: verify_url.clone(),
                counter: counter.clone(),
                flushed: done.clone(),
                cancel: workers_cancel.clone(),
            };
            handles.push(tokio::spawn(job.run()));
        }

        let reporter = tokio::spawn(report_progress(
            counter.clone(),
            callback.clone(),
            self.progress_interval,
            workers_cancel.clone(),
        ));

        let mut joined = std::pin::pin!(futures_util::future::join_all(handles));
        let mut timed_out = None;
        let results = tokio::select! {
            results = &mut joined => results,
            limit = deadline(self.settings.download_timeout()) => {
                warn!("Download of {} exceeded {:?}", request.url, limit);
                timed_out = Some(limit);
                // 工作任务在下一次读取时退出，已经写入的字节仍然计入
                workers_cancel.cancel();
                joined.await
            }
        };
        workers_cancel.cancel();
        let _ = reporter.await;
        callback.on_progress(&SpeedMeter::new().sample(&counter));
        flushed_results(&flushed, &ranges, task);

        let mut worst: Option<ShareError> = None;
        for result in results {
            let e = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join) => ShareError::Io(std::io::Error::other(join)),
            };
            if worst.as_ref().is_none_or(|w| severity(&e) > severity(w)) {
                worst = Some(e);
            }
        }
        match (worst, timed_out) {
            (Some(e @ ShareError::Integrity { .. }), _) => Err(e),
            (_, Some(limit)) => Err(ShareError::transport(format!(
                "download timed out after {limit:?}"
            ))),
            (Some(e), None) => Err(e),
            (None, None) => Ok(()),
        }
    }

    async fn verify_whole(
        &self,
        request: &DownloadRequest,
        task: &TransferTask,
        partial: &Path,
    ) -> Result<Option<Sha256Digest>> {
        let expected = match task.expected_checksum {
            Some(d) => Some(d),
            None => match checksum_url(&request.url) {
                Some(url) => Some(
                    fetch_checksum(
                        &self.http,
                        url,
                        request.token.as_deref(),
                        self.settings.read_stall_timeout(),
                    )
                    .await?,
                ),
                None => None,
            },
        };
        let Some(expected) = expected else {
            warn!(
                "No checksum available for {}, skipping verification",
                request.url
            );
            return Ok(None);
        };

        let path = partial.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || checksum::compute_file_digest(&path))
            .await
            .map_err(|e| ShareError::Io(std::io::Error::other(e)))??;
        checksum::ensure_match(&task.destination_path, &expected, &actual)?;
        debug!("Checksum verified for {:?}: {}", task.destination_path, actual);
        Ok(Some(actual))
    }
}

/// 整体超时；未设置时永不完成
async fn deadline(limit: Option<Duration>) -> Duration {
    match limit {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

/// 多个工作任务失败时报告最严重的一个：摘要不匹配 > 其他错误 > 取消
///
/// 取消通常是其他错误的连带结果。
fn severity(err: &ShareError) -> u8 {
    match err {
        ShareError::Cancelled => 0,
        ShareError::Integrity { .. } => 2,
        _ => 1,
    }
}

/// 在 `limit` 内等待响应，超时视为传输失败
async fn within<T>(
    limit: Duration,
    url: &str,
    pending: impl Future<Output = reqwest::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, pending).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ShareError::transport(format!(
            "{url} did not respond within {limit:?}"
        ))),
    }
}

/// 计算从第一个区间起点开始连续写入的最高偏移，写回任务
fn flushed_results(flushed: &[Arc<AtomicU64>], ranges: &[ByteRange], task: &mut TransferTask) {
    let Some(first) = ranges.first() else {
        return;
    };
    let mut offset = first.start;
    for (range, done) in ranges.iter().zip(flushed) {
        let written = done.load(Ordering::Acquire).min(range.len());
        offset = range.start + written;
        if written < range.len() {
            break;
        }
    }
    task.bytes_completed = offset;
}

fn advance(task: &mut TransferTask, next: TaskState, callback: &dyn DownloadCallback) {
    if task.transition(next) {
        callback.on_state(next);
    }
}

async fn report_progress(
    counter: Arc<ProgressCounter>,
    callback: Arc<dyn DownloadCallback>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut meter = SpeedMeter::new();
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => callback.on_progress(&meter.sample(&counter)),
        }
    }
}

/// 预分配部分文件；续传时保留已有内容
async fn prepare_partial(partial: &Path, total: u64, resuming: bool) -> Result<()> {
    if let Some(parent) = partial.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(!resuming)
        .open(partial)
        .await?;
    file.set_len(total).await?;
    Ok(())
}

/// 一个工作任务负责的区间
struct RangeJob {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    partial: PathBuf,
    range: ByteRange,
    buffer_size: usize,
    stall_timeout: Duration,
    verify_url: Option<Url>,
    counter: Arc<ProgressCounter>,
    flushed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl RangeJob {
    async fn run(self) -> Result<()> {
        let result = self.fetch().await;
        if let Err(e) = &result
            && !matches!(e, ShareError::Cancelled)
        {
            warn!(
                "Range {}..{} of {} failed: {}",
                self.range.start, self.range.end, self.url, e
            );
            // 让其他工作任务在下一次读取时停止
            self.cancel.cancel();
        }
        result
    }

    async fn fetch(&self) -> Result<()> {
        let mut request = self
            .http
            .get(&self.url)
            .header(RANGE, self.range.to_header_value());
        if let Some(t) = &self.token {
            request = request.bearer_auth(t);
        }
        let response = tokio::select! {
            () = self.cancel.cancelled() => return Err(ShareError::Cancelled),
            response = within(self.stall_timeout, &self.url, request.send()) => response?,
        };
        let status = response.status();
        // 200 只在区间从 0 开始时可用：读满区间长度后丢弃剩余内容
        let usable = status == StatusCode::PARTIAL_CONTENT
            || (status == StatusCode::OK && self.range.start == 0);
        if !usable {
            return Err(ShareError::transport(format!(
                "unexpected status {status} for range {}",
                self.range.to_header_value()
            )));
        }

        let mut file = OpenOptions::new().write(true).open(&self.partial).await?;
        file.seek(SeekFrom::Start(self.range.start)).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let mut stream = response.bytes_stream();

        let total = self.range.len();
        let mut written: u64 = 0;
        let mut unflushed: usize = 0;
        let copied: Result<()> = loop {
            if written == total {
                break Ok(());
            }
            let next = tokio::select! {
                () = self.cancel.cancelled() => break Err(ShareError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => {
                    break Err(ShareError::transport(format!(
                        "read stalled for {:?} at byte {}",
                        self.stall_timeout,
                        self.range.start + written
                    )));
                }
                Ok(None) => {
                    break Err(ShareError::transport(format!(
                        "connection closed after {written} of {total} bytes"
                    )));
                }
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(Some(Ok(bytes))) => bytes,
            };

            let take = usize::try_from(total - written).map_or(bytes.len(), |r| r.min(bytes.len()));
            if let Err(e) = writer.write_all(&bytes[..take]).await {
                break Err(e.into());
            }
            written += take as u64;
            unflushed += take;
            self.counter.add(take as u64);

            if unflushed >= self.buffer_size {
                if let Err(e) = writer.flush().await {
                    break Err(e.into());
                }
                self.flushed.store(written, Ordering::Release);
                unflushed = 0;
            }
        };

        // 无论成功与否都把缓冲写入磁盘，只记录确实落盘的字节
        writer.flush().await?;
        self.flushed.store(written, Ordering::Release);
        copied?;

        if let Some(url) = &self.verify_url {
            self.verify_chunk(url.clone()).await?;
        }
        Ok(())
    }

    /// 与服务端核对本区间的摘要
    async fn verify_chunk(&self, mut url: Url) -> Result<()> {
        url.query_pairs_mut()
            .append_pair("start", &self.range.start.to_string())
            .append_pair("end", &self.range.end.to_string());
        let fetch = fetch_checksum(&self.http, url, self.token.as_deref(), self.stall_timeout);
        let remote = tokio::select! {
            () = self.cancel.cancelled() => return Err(ShareError::Cancelled),
            remote = fetch => remote?,
        };

        let path = self.partial.clone();
        let (start, end) = (self.range.start, self.range.end);
        let local =
            tokio::task::spawn_blocking(move || checksum::compute_range_digest(&path, start, end))
                .await
                .map_err(|e| ShareError::Io(std::io::Error::other(e)))??;
        if let Err(e) = checksum::ensure_match(&self.partial, &remote, &local) {
            // 这个区间需要重新下载
            self.flushed.store(0, Ordering::Release);
            return Err(e);
        }
        debug!("Chunk {}..{} verified", start, end);
        Ok(())
    }
}

/// 由 `/download/{id}` 或 `/files/{id}` 推出 `/checksum/{id}`
pub fn checksum_url(source_url: &str) -> Option<Url> {
    let mut url = Url::parse(source_url).ok()?;
    let segments: Vec<String> = url.path_segments()?.map(str::to_string).collect();
    match segments.as_slice() {
        [kind, id] if (kind == "download" || kind == "files") && !id.is_empty() => {
            url.set_path(&format!("/checksum/{id}"));
            url.set_query(None);
            Some(url)
        }
        _ => None,
    }
}

async fn fetch_checksum(
    http: &reqwest::Client,
    url: Url,
    token: Option<&str>,
    limit: Duration,
) -> Result<Sha256Digest> {
    let mut request = http.get(url.clone());
    if let Some(t) = token {
        request = request.bearer_auth(t);
    }
    // 服务端计算大文件摘要可能较慢，但不应超过停滞时限
    let response = within(limit, url.as_str(), request.send()).await?;
    ensure_success(response.status(), url.as_str())?;
    let body: ChecksumResponse = within(limit, url.as_str(), response.json()).await?;
    Ok(body.digest)
}

fn ensure_success(status: StatusCode, url: &str) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED {
        Err(ShareError::Unauthorized)
    } else {
        Err(ShareError::transport(format!("{url} returned {status}")))
    }
}

fn header_u64(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KB;

    #[test]
    fn test_checksum_url() {
        assert_eq!(
            checksum_url("http://10.0.0.2:8000/download/abc?token=x")
                .unwrap()
                .as_str(),
            "http://10.0.0.2:8000/checksum/abc"
        );
        assert_eq!(
            checksum_url("http://10.0.0.2:8000/files/abc").unwrap().as_str(),
            "http://10.0.0.2:8000/checksum/abc"
        );
        assert!(checksum_url("http://example.com/some/other/file.iso").is_none());
        assert!(checksum_url("not a url").is_none());
    }

    #[test]
    fn test_contiguous_flushed_offset() {
        let ranges = crate::planner::partition(100, 4);
        let mut task = TransferTask::new(
            "http://x/download/y",
            PathBuf::from("out"),
            100,
            None,
            ThreadPlan {
                chunk_size: 8 * KB,
                ranges: ranges.clone(),
            },
        );
        let flushed: Vec<_> = [25u64, 10, 25, 0]
            .into_iter()
            .map(|n| Arc::new(AtomicU64::new(n)))
            .collect();
        flushed_results(&flushed, &ranges, &mut task);
        // 第二个区间只写了 10 字节，后面的区间即使写完也不算
        assert_eq!(task.bytes_completed, 35);

        let all_done: Vec<_> = ranges
            .iter()
            .map(|r| Arc::new(AtomicU64::new(r.len())))
            .collect();
        flushed_results(&all_done, &ranges, &mut task);
        assert_eq!(task.bytes_completed, 100);
    }

    #[test]
    fn test_resume_suffix_offset() {
        let ranges = vec![ByteRange::new(400, 1000)];
        let mut task = TransferTask::new(
            "http://x/download/y",
            PathBuf::from("out"),
            1000,
            None,
            ThreadPlan::resume_suffix(400, 1000, 8 * KB),
        );
        let flushed = vec![Arc::new(AtomicU64::new(50))];
        flushed_results(&flushed, &ranges, &mut task);
        assert_eq!(task.bytes_completed, 450);
    }

    #[test]
    fn test_worst_error_wins() {
        let integrity = ShareError::Integrity {
            path: PathBuf::from("out"),
            expected: "00".into(),
            actual: "11".into(),
        };
        let transport = ShareError::transport("reset");
        assert!(severity(&integrity) > severity(&transport));
        assert!(severity(&transport) > severity(&ShareError::Cancelled));
    }

    #[tokio::test]
    async fn test_within_times_out() {
        let err = within(
            Duration::from_millis(20),
            "http://10.0.0.2/x",
            std::future::pending::<reqwest::Result<()>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShareError::Transport(_)));
        assert!(err.is_resumable());
    }

    #[test]
    fn test_thread_override() {
        let client = DownloadClient::with_resume_store(
            &Settings::default(),
            ResumeStore::new(std::env::temp_dir()),
        )
        .unwrap();
        let one = client.effective_settings(Some(1));
        assert!(!one.enable_multithreaded_download);
        let many = client.effective_settings(Some(64));
        assert_eq!(many.max_download_threads, 16);
    }
}
