//! 전송 클라이언트 (호출자 API)
//!
//! 클라이언트는 요청을 디스패처 큐에 넣고 [`TransferHandle`]을 돌려줄 뿐,
//! 전송 상태에는 접근하지 않는다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{ResourceId, SessionId};
use crate::config::{ClientConfig, ProtocolVersion, TransferParameters};
use crate::dispatcher::{AbortPredicate, ActiveSessions, Event, TransferDispatcher};
use crate::error::TransferError;
use crate::read::ReadTransfer;
use crate::stats::ProgressCallback;
use crate::status::Status;
use crate::transfer::{Transfer, TransferInit};
use crate::transport::Transport;
use crate::write::WriteTransfer;
use crate::{Error, Result};

/// 읽기 옵션
#[derive(Default)]
pub struct ReadOptions {
    /// 전송 파라미터 (없으면 클라이언트 기본값)
    pub parameters: Option<TransferParameters>,

    /// 진행 콜백
    pub progress: Option<ProgressCallback>,

    /// 시작 오프셋
    pub initial_offset: u64,
}

/// 쓰기 옵션
#[derive(Default)]
pub struct WriteOptions {
    /// 진행 콜백
    pub progress: Option<ProgressCallback>,

    /// `data[0]`에 해당하는 오프셋
    pub initial_offset: u64,
}

/// 전송 결과 핸들
///
/// `await`하면 결과를 받는다. 디스패처가 결과 없이 사라지면 ABORTED.
pub struct TransferHandle<T> {
    rx: oneshot::Receiver<std::result::Result<T, TransferError>>,
    session_id: SessionId,
    handle_id: u64,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl<T> TransferHandle<T> {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// 전송 취소 요청. 이미 끝난 전송에는 효과 없음
    pub fn cancel(&self) {
        let _ = self.events_tx.send(Event::Cancel {
            session_id: self.session_id,
            handle_id: self.handle_id,
        });
    }

    /// 런타임 밖에서 결과 대기
    pub fn wait_blocking(self) -> std::result::Result<T, TransferError> {
        let session_id = self.session_id;
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(dispatcher_gone(session_id)))
    }
}

impl<T> Future for TransferHandle<T> {
    type Output = std::result::Result<T, TransferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let session_id = self.session_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(dispatcher_gone(session_id))))
    }
}

impl<T> fmt::Debug for TransferHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("session_id", &self.session_id)
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

fn dispatcher_gone(session_id: SessionId) -> TransferError {
    TransferError::new(session_id, Status::Aborted, "디스패처 종료")
}

/// 전송 클라이언트
pub struct TransferClient {
    events_tx: mpsc::UnboundedSender<Event>,
    config: ClientConfig,
    protocol_version: RwLock<ProtocolVersion>,
    next_session_id: AtomicU32,
    next_handle_id: AtomicU64,
    active_sessions: ActiveSessions,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferClient {
    /// 클라이언트 생성 및 디스패처 시작 (tokio 런타임 안에서 호출)
    pub fn new(transport: impl Transport, config: ClientConfig) -> Result<Self> {
        Self::start(Box::new(transport), config, None)
    }

    /// 송신 직전마다 `abort`를 확인하는 클라이언트
    pub fn with_abort_predicate(
        transport: impl Transport,
        config: ClientConfig,
        abort: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::start(Box::new(transport), config, Some(Arc::new(abort)))
    }

    fn start(
        transport: Box<dyn Transport>,
        config: ClientConfig,
        abort: Option<AbortPredicate>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let active_sessions = ActiveSessions::default();
        let dispatcher = TransferDispatcher::new(
            transport,
            events_tx.clone(),
            events_rx,
            abort,
            active_sessions.clone(),
        );
        let worker = runtime.spawn(dispatcher.run());

        info!(
            "전송 클라이언트 시작: {:?}, timeout={:?}, initial_timeout={:?}, max_retries={}",
            config.protocol_version,
            config.timeouts.timeout,
            config.timeouts.initial_timeout,
            config.timeouts.max_retries
        );

        Ok(Self {
            events_tx,
            protocol_version: RwLock::new(config.protocol_version),
            config,
            next_session_id: AtomicU32::new(rand::random()),
            next_handle_id: AtomicU64::new(1),
            active_sessions,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        *self.protocol_version.read()
    }

    /// 이후 시작하는 전송의 프로토콜 버전 변경
    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        *self.protocol_version.write() = version;
    }

    /// 읽기 시작
    pub fn start_read(
        &self,
        resource_id: ResourceId,
        options: ReadOptions,
    ) -> TransferHandle<Bytes> {
        let parameters = options.parameters.unwrap_or(self.config.read_parameters);
        let init = self.transfer_init(resource_id, options.progress);
        let (tx, rx) = oneshot::channel();
        let handle = self.handle(rx, &init);

        if let Err(e) = parameters.validate() {
            let _ = tx.send(Err(TransferError::new(
                init.session_id,
                Status::InvalidArgument,
                e.to_string(),
            )));
            return handle;
        }

        let read = ReadTransfer::new(parameters, options.initial_offset);
        self.submit(Transfer::read(init, read, tx));
        handle
    }

    /// 쓰기 시작
    pub fn start_write(
        &self,
        resource_id: ResourceId,
        data: impl Into<Bytes>,
        options: WriteOptions,
    ) -> TransferHandle<()> {
        let init = self.transfer_init(resource_id, options.progress);
        let (tx, rx) = oneshot::channel();
        let handle = self.handle(rx, &init);

        let write = WriteTransfer::new(data.into(), options.initial_offset);
        self.submit(Transfer::write(init, write, tx));
        handle
    }

    /// 리소스 전체 읽기
    pub async fn read(&self, resource_id: ResourceId) -> std::result::Result<Bytes, TransferError> {
        self.start_read(resource_id, ReadOptions::default()).await
    }

    /// 리소스에 데이터 쓰기
    pub async fn write(
        &self,
        resource_id: ResourceId,
        data: impl Into<Bytes>,
    ) -> std::result::Result<(), TransferError> {
        self.start_write(resource_id, data, WriteOptions::default()).await
    }

    /// 전송 취소
    pub fn cancel<T>(&self, handle: &TransferHandle<T>) {
        handle.cancel();
    }

    /// 진행 중인 전송을 ABORTED로 끝내고 디스패처 종료 대기
    pub async fn close(&self) {
        let _ = self.events_tx.send(Event::Stop);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("디스패처 태스크 비정상 종료: {}", e);
            }
        }
    }

    fn transfer_init(
        &self,
        resource_id: ResourceId,
        progress: Option<ProgressCallback>,
    ) -> TransferInit {
        let protocol_version = self.protocol_version();
        TransferInit {
            session_id: self.allocate_session_id(resource_id, protocol_version),
            resource_id,
            handle_id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            protocol_version,
            timeouts: self.config.timeouts,
            progress,
        }
    }

    fn allocate_session_id(&self, resource_id: ResourceId, version: ProtocolVersion) -> SessionId {
        match version {
            ProtocolVersion::Legacy => resource_id,
            ProtocolVersion::Versioned => loop {
                let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                // 0은 예약, 진행 중인 세션과 겹치면 건너뜀
                if id != 0 && !self.active_sessions.lock().contains(&id) {
                    return id;
                }
            },
        }
    }

    fn handle<T>(
        &self,
        rx: oneshot::Receiver<std::result::Result<T, TransferError>>,
        init: &TransferInit,
    ) -> TransferHandle<T> {
        TransferHandle {
            rx,
            session_id: init.session_id,
            handle_id: init.handle_id,
            events_tx: self.events_tx.clone(),
        }
    }

    fn submit(&self, transfer: Transfer) {
        let session_id = transfer.session_id();
        // 디스패처가 없으면 결과 송신측이 버려져서 핸들은 ABORTED가 됨
        if self.events_tx.send(Event::Start(Box::new(transfer))).is_err() {
            debug!("전송 {}: 디스패처 종료 후 요청됨", session_id);
        }
    }
}

impl Drop for TransferClient {
    fn drop(&mut self) {
        let _ = self.events_tx.send(Event::Stop);
    }
}

impl fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferClient")
            .field("config", &self.config)
            .field("protocol_version", &self.protocol_version())
            .finish()
    }
}
