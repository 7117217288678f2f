//! 전송 상태 머신 (읽기/쓰기 공통 드라이버)
//!
//! 전송 하나는 디스패처 태스크가 독점 소유하며, 모든 이벤트
//! (시작, 청크, 타임아웃, 연결 끊김, 취소, 종료)는 이 모듈의
//! [`Transfer`] 메서드를 통해서만 들어온다.
//!
//! ```text
//! Inactive ─start─▶ WaitingForInitialData / WaitingForTransferParameters
//!                        │                ▲
//!                        ▼                │ chunk
//!              ReceivingData / Transmitting ─timeout─▶ Recovery
//!                        │                                 │
//!                        └──────────────▶ Completed ◀──────┘
//! ```

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ResourceId, SessionId};
use crate::config::{ProtocolVersion, TransferTimeoutSettings};
use crate::error::{TransferError, TransportError};
use crate::read::ReadTransfer;
use crate::stats::{ProgressCallback, TransferProgress, TransferStats};
use crate::status::Status;
use crate::transport::Direction;
use crate::write::WriteTransfer;

/// 전송이 청크를 내보내는 통로
pub(crate) trait ChunkSink {
    fn send_chunk(&mut self, direction: Direction, chunk: &Chunk) -> Result<(), TransportError>;

    /// 송신 직전에 확인하는 중단 조건
    fn should_abort(&self) -> bool;
}

/// 송신 도중 전송이 종료됨 (결과는 이미 전달됨)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stopped;

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferState {
    Inactive,
    WaitingForInitialData,
    WaitingForTransferParameters,
    ReceivingData,
    Transmitting,
    Recovery,
    Completed,
}

/// 결과 전달 채널 (정확히 한 번 사용)
pub(crate) enum Completion {
    Read(oneshot::Sender<Result<Bytes, TransferError>>),
    Write(oneshot::Sender<Result<(), TransferError>>),
}

/// 읽기/쓰기 공통 상태
pub(crate) struct TransferCore {
    pub(crate) session_id: SessionId,
    pub(crate) resource_id: ResourceId,
    pub(crate) handle_id: u64,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) direction: Direction,
    pub(crate) state: TransferState,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeouts: TransferTimeoutSettings,
    pub(crate) retries: u32,
    pub(crate) disconnection_retries: u32,
    /// 한 번이라도 청크를 받았으면 연결 끊김은 복구 대상이 아님
    pub(crate) received_any: bool,
    pub(crate) last_chunk_sent: Option<Chunk>,
    pub(crate) stats: TransferStats,
    progress: Option<ProgressCallback>,
    completion: Option<Completion>,
}

impl TransferCore {
    pub(crate) fn is_completed(&self) -> bool {
        self.state == TransferState::Completed
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// 정상 상태 타임아웃
    pub(crate) fn set_next_chunk_timeout(&mut self) {
        self.set_timeout(self.timeouts.timeout);
    }

    /// 첫 응답 타임아웃
    pub(crate) fn set_initial_timeout(&mut self) {
        self.set_timeout(self.timeouts.initial_timeout);
    }

    pub(crate) fn report_progress(&mut self, progress: TransferProgress) {
        if let Some(callback) = self.progress.as_mut() {
            callback(progress);
        }
    }

    /// 청크 송신. 실패하면 전송을 종료하고 `Stopped`를 돌려줌
    pub(crate) fn send_chunk(
        &mut self,
        sink: &mut dyn ChunkSink,
        chunk: Chunk,
    ) -> Result<(), Stopped> {
        if sink.should_abort() {
            warn!("전송 {}: 중단 조건 충족, 청크를 보내지 않음", self.session_id);
            self.complete(Err(self.error(Status::Aborted, "중단 조건 충족")));
            return Err(Stopped);
        }

        if let Err(e) = sink.send_chunk(self.direction, &chunk) {
            warn!("전송 {}: 청크 송신 실패: {}", self.session_id, e);
            self.complete(Err(self.error(e.status(), e.to_string())));
            return Err(Stopped);
        }

        self.stats.chunks_sent += 1;
        self.last_chunk_sent = Some(chunk);
        Ok(())
    }

    /// COMPLETION 청크를 보내고 결과 전달 (송신 실패해도 결과는 유지)
    pub(crate) fn send_final_chunk(
        &mut self,
        sink: &mut dyn ChunkSink,
        status: Status,
        result: Result<Bytes, TransferError>,
    ) {
        if !sink.should_abort() {
            let chunk = Chunk::completion(self.session_id, status);
            match sink.send_chunk(self.direction, &chunk) {
                Ok(()) => self.stats.chunks_sent += 1,
                Err(e) => debug!("전송 {}: 완료 청크 송신 실패: {}", self.session_id, e),
            }
        }
        self.complete(result);
    }

    /// 종료 상태로 전환하고 결과 전달
    pub(crate) fn complete(&mut self, result: Result<Bytes, TransferError>) {
        self.state = TransferState::Completed;
        self.deadline = None;

        let Some(completion) = self.completion.take() else {
            return;
        };

        match &result {
            Ok(_) => info!(
                "전송 {} ({} resource={}) 완료: {}",
                self.session_id,
                self.direction,
                self.resource_id,
                self.stats.summary()
            ),
            Err(e) => warn!(
                "전송 {} ({} resource={}) 실패: {} | {}",
                self.session_id,
                self.direction,
                self.resource_id,
                e,
                self.stats.summary()
            ),
        }

        // 수신측이 핸들을 버렸으면 결과는 그냥 버려짐
        match completion {
            Completion::Read(tx) => {
                let _ = tx.send(result);
            }
            Completion::Write(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
        }
    }

    pub(crate) fn error(&self, status: Status, message: impl Into<String>) -> TransferError {
        TransferError::new(self.session_id, status, message)
    }
}

/// 전송 종류 (닫힌 집합)
pub(crate) enum TransferKind {
    Read(ReadTransfer),
    Write(WriteTransfer),
}

/// 전송 생성 인자
pub(crate) struct TransferInit {
    pub(crate) session_id: SessionId,
    pub(crate) resource_id: ResourceId,
    pub(crate) handle_id: u64,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) timeouts: TransferTimeoutSettings,
    pub(crate) progress: Option<ProgressCallback>,
}

/// 전송 하나
pub(crate) struct Transfer {
    pub(crate) core: TransferCore,
    pub(crate) kind: TransferKind,
}

impl Transfer {
    fn with_kind(
        init: TransferInit,
        direction: Direction,
        completion: Completion,
        kind: TransferKind,
    ) -> Self {
        Self {
            core: TransferCore {
                session_id: init.session_id,
                resource_id: init.resource_id,
                handle_id: init.handle_id,
                protocol_version: init.protocol_version,
                direction,
                state: TransferState::Inactive,
                deadline: None,
                timeouts: init.timeouts,
                retries: 0,
                disconnection_retries: 0,
                received_any: false,
                last_chunk_sent: None,
                stats: TransferStats::new(),
                progress: init.progress,
                completion: Some(completion),
            },
            kind,
        }
    }

    /// 읽기 전송 생성
    pub(crate) fn read(
        init: TransferInit,
        transfer: ReadTransfer,
        tx: oneshot::Sender<Result<Bytes, TransferError>>,
    ) -> Self {
        Self::with_kind(init, Direction::Read, Completion::Read(tx), TransferKind::Read(transfer))
    }

    /// 쓰기 전송 생성
    pub(crate) fn write(
        init: TransferInit,
        transfer: WriteTransfer,
        tx: oneshot::Sender<Result<(), TransferError>>,
    ) -> Self {
        Self::with_kind(
            init,
            Direction::Write,
            Completion::Write(tx),
            TransferKind::Write(transfer),
        )
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.core.session_id
    }

    pub(crate) fn resource_id(&self) -> ResourceId {
        self.core.resource_id
    }

    pub(crate) fn direction(&self) -> Direction {
        self.core.direction
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.core.deadline
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.core.is_completed()
    }

    fn initial_chunk(&self) -> Chunk {
        match &self.kind {
            TransferKind::Read(read) => read.initial_chunk(&self.core),
            TransferKind::Write(write) => write.initial_chunk(&self.core),
        }
    }

    fn waiting_state(&self) -> TransferState {
        match self.kind {
            TransferKind::Read(_) => TransferState::WaitingForInitialData,
            TransferKind::Write(_) => TransferState::WaitingForTransferParameters,
        }
    }

    /// 첫 청크 송신
    pub(crate) fn start(&mut self, sink: &mut dyn ChunkSink) {
        if self.core.state != TransferState::Inactive {
            return;
        }

        info!(
            "전송 {} 시작: {} resource={} ({:?})",
            self.core.session_id,
            self.core.direction,
            self.core.resource_id,
            self.core.protocol_version
        );

        self.core.state = self.waiting_state();
        let chunk = self.initial_chunk();
        if self.core.send_chunk(sink, chunk).is_ok() {
            self.core.set_initial_timeout();
        }
    }

    /// 수신 청크 처리
    pub(crate) fn handle_chunk(&mut self, chunk: Chunk, sink: &mut dyn ChunkSink) {
        if self.core.is_completed() {
            debug!("전송 {}: 완료 후 도착한 청크 무시", self.core.session_id);
            return;
        }

        self.core.received_any = true;
        self.core.retries = 0;
        self.core.stats.chunks_received += 1;

        if self.core.state == TransferState::Recovery {
            debug!("전송 {}: 응답 수신, 복구 상태 해제", self.core.session_id);
            self.core.state = self.waiting_state();
        }

        if chunk.is_final() {
            self.handle_final_chunk(chunk, sink);
            return;
        }

        // Stopped면 결과는 이미 전달됨
        let _ = match &mut self.kind {
            TransferKind::Read(read) => read.handle_data_chunk(&mut self.core, chunk, sink),
            TransferKind::Write(write) => write.handle_data_chunk(&mut self.core, chunk, sink),
        };
    }

    fn handle_final_chunk(&mut self, chunk: Chunk, sink: &mut dyn ChunkSink) {
        let code = chunk.header.status.unwrap_or_default();

        match Status::from_code(code) {
            None => {
                warn!("전송 {}: 알 수 없는 상태 코드 {}", self.core.session_id, code);
                let error = self
                    .core
                    .error(Status::InvalidArgument, format!("잘못된 상태 코드 {}", code));
                self.core.send_final_chunk(sink, Status::InvalidArgument, Err(error));
            }
            Some(Status::Ok) => {
                let payload = match &mut self.kind {
                    TransferKind::Read(read) => read.take_data(),
                    TransferKind::Write(_) => Bytes::new(),
                };
                self.core.complete(Ok(payload));
            }
            Some(status) => {
                let error = self.core.error(status, "상대측이 전송을 종료함");
                self.core.complete(Err(error));
            }
        }
    }

    /// 데드라인 경과 처리
    pub(crate) fn handle_timeout(&mut self, sink: &mut dyn ChunkSink) {
        self.core.deadline = None;

        match self.core.state {
            TransferState::Inactive | TransferState::Completed => {}
            TransferState::Transmitting => {
                // 쓰기의 pacing 틱
                if let TransferKind::Write(write) = &mut self.kind {
                    let _ = write.transmit_next(&mut self.core, sink);
                }
            }
            TransferState::Recovery => self.handle_recovery_timeout(sink),
            _ => {
                debug!("전송 {}: 타임아웃, 복구 상태 진입", self.core.session_id);
                self.core.state = TransferState::Recovery;
                self.handle_recovery_timeout(sink);
            }
        }
    }

    fn handle_recovery_timeout(&mut self, sink: &mut dyn ChunkSink) {
        let max_retries = self.core.timeouts.max_retries;

        if self.core.retries >= max_retries {
            warn!(
                "전송 {}: {}회 재시도 후에도 응답 없음",
                self.core.session_id, self.core.retries
            );
            let error = self.core.error(
                Status::DeadlineExceeded,
                format!("{}회 재시도 후 응답 없음", self.core.retries),
            );
            self.core.complete(Err(error));
            return;
        }

        self.core.retries += 1;
        self.core.stats.timeout_retries += 1;

        let chunk = match &mut self.kind {
            TransferKind::Read(read) => read.retry_chunk(&self.core),
            TransferKind::Write(write) => write.retry_chunk(&self.core),
        };

        debug!(
            "전송 {}: 재전송 {}/{} ({:?})",
            self.core.session_id,
            self.core.retries,
            max_retries,
            chunk.chunk_type()
        );

        if self.core.send_chunk(sink, chunk).is_ok() {
            self.core.set_next_chunk_timeout();
        }
    }

    /// 스트림이 FAILED_PRECONDITION으로 닫힘
    pub(crate) fn handle_disconnection(&mut self, sink: &mut dyn ChunkSink) {
        if self.core.is_completed() {
            return;
        }

        if self.core.received_any
            || self.core.disconnection_retries >= self.core.timeouts.max_retries
        {
            let error = self.core.error(
                Status::Internal,
                format!(
                    "전송 {} {}회 재시작 후 중단",
                    self.core.session_id, self.core.disconnection_retries
                ),
            );
            self.core.complete(Err(error));
            return;
        }

        self.core.disconnection_retries += 1;
        info!(
            "전송 {}: 연결 끊김, 첫 청크 재전송 ({}/{})",
            self.core.session_id, self.core.disconnection_retries, self.core.timeouts.max_retries
        );

        self.core.state = self.waiting_state();
        let chunk = self.initial_chunk();
        if self.core.send_chunk(sink, chunk).is_ok() {
            self.core.set_initial_timeout();
        }
    }

    /// 복구 불가능한 스트림 종료
    pub(crate) fn handle_stream_failure(&mut self, status: Status) {
        if self.core.is_completed() {
            return;
        }
        let error = self.core.error(Status::Internal, format!("스트림이 {} 상태로 닫힘", status));
        self.core.complete(Err(error));
    }

    /// 호출자 취소
    pub(crate) fn handle_cancellation(&mut self, sink: &mut dyn ChunkSink) {
        if self.core.is_completed() {
            return;
        }
        info!("전송 {}: 취소됨", self.core.session_id);
        let error = self.core.error(Status::Cancelled, "호출자가 취소함");
        self.core.send_final_chunk(sink, Status::Cancelled, Err(error));
    }

    /// 디스패처 종료
    pub(crate) fn handle_termination(&mut self, sink: &mut dyn ChunkSink) {
        if self.core.is_completed() {
            return;
        }
        let error = self.core.error(Status::Aborted, "디스패처 종료");
        self.core.send_final_chunk(sink, Status::Aborted, Err(error));
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("session_id", &self.core.session_id)
            .field("resource_id", &self.core.resource_id)
            .field("direction", &self.core.direction)
            .field("state", &self.core.state)
            .field("retries", &self.core.retries)
            .finish()
    }
}
