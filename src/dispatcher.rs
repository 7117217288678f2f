//! 전송 디스패처 (단일 태스크 이벤트 루프)
//!
//! 모든 전송 상태는 이 태스크 하나가 소유한다. 호출자와 트랜스포트는
//! [`Event`]를 큐에 넣기만 하고, 루프는 다음 순서로 돈다.
//!
//! 1. 가장 가까운 데드라인 계산
//! 2. 그 데드라인까지 이벤트 대기
//! 3. 이벤트 하나 처리
//! 4. 데드라인이 지난 전송의 타임아웃 처리 후 완료된 전송 제거

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ResourceId, SessionId};
use crate::error::TransportError;
use crate::status::Status;
use crate::transfer::{ChunkSink, Transfer};
use crate::transport::{Direction, Streams, Transport};

/// 송신 직전마다 확인하는 중단 조건
pub type AbortPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// 진행 중인 세션 ID 집합 (버전 프로토콜의 ID 할당에 사용)
pub(crate) type ActiveSessions = Arc<Mutex<HashSet<SessionId>>>;

/// 디스패처 이벤트
#[derive(Debug)]
pub(crate) enum Event {
    /// 새 전송
    Start(Box<Transfer>),

    /// 트랜스포트가 받은 청크
    Chunk {
        direction: Direction,
        generation: u64,
        chunk: Chunk,
    },

    /// 호출자 취소
    Cancel { session_id: SessionId, handle_id: u64 },

    /// 트랜스포트 스트림 종료
    StreamClosed {
        direction: Direction,
        generation: u64,
        status: Status,
    },

    /// 디스패처 종료
    Stop,
}

/// 전송이 보는 송신 통로 (스트림 + 중단 조건)
struct Link<'a> {
    streams: &'a mut Streams,
    abort: Option<&'a AbortPredicate>,
}

impl ChunkSink for Link<'_> {
    fn send_chunk(&mut self, direction: Direction, chunk: &Chunk) -> Result<(), TransportError> {
        let result = self.streams.send(direction, chunk);
        if result.is_err() {
            // 다음 송신에서 다시 열림
            self.streams.reset(direction);
        }
        result
    }

    fn should_abort(&self) -> bool {
        self.abort.is_some_and(|abort| abort())
    }
}

/// 전송 디스패처
pub(crate) struct TransferDispatcher {
    events_rx: mpsc::UnboundedReceiver<Event>,
    streams: Streams,
    abort: Option<AbortPredicate>,
    transfers: HashMap<SessionId, Transfer>,
    resources: HashMap<ResourceId, SessionId>,
    active_sessions: ActiveSessions,
}

impl TransferDispatcher {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
        abort: Option<AbortPredicate>,
        active_sessions: ActiveSessions,
    ) -> Self {
        Self {
            events_rx,
            streams: Streams::new(transport, events_tx),
            abort,
            transfers: HashMap::new(),
            resources: HashMap::new(),
            active_sessions,
        }
    }

    /// 이벤트 루프. `Stop`을 받거나 모든 송신측이 사라지면 종료
    pub(crate) async fn run(mut self) {
        info!("전송 디스패처 시작");

        loop {
            let received = match self.next_deadline() {
                Some(deadline) => time::timeout_at(deadline, self.events_rx.recv()).await.ok(),
                None => Some(self.events_rx.recv().await),
            };

            match received {
                Some(Some(Event::Stop)) | Some(None) => break,
                Some(Some(event)) => self.handle_event(event),
                // 데드라인 도달
                None => {}
            }

            self.handle_timeouts();
            self.remove_completed();
        }

        self.terminate_all();
        info!("전송 디스패처 종료");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.transfers.values().filter_map(Transfer::deadline).min()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(transfer) => self.start_transfer(*transfer),
            Event::Chunk {
                direction,
                generation,
                chunk,
            } => self.handle_chunk(direction, generation, chunk),
            Event::Cancel { session_id, handle_id } => self.cancel_transfer(session_id, handle_id),
            Event::StreamClosed {
                direction,
                generation,
                status,
            } => self.handle_stream_closed(direction, generation, status),
            Event::Stop => {}
        }
    }

    fn start_transfer(&mut self, mut transfer: Transfer) {
        let session_id = transfer.session_id();
        let resource_id = transfer.resource_id();

        if self.resources.contains_key(&resource_id) || self.transfers.contains_key(&session_id) {
            warn!(
                "전송 {}: resource {}에 이미 진행 중인 전송이 있음",
                session_id, resource_id
            );
            let error = transfer.core.error(
                Status::AlreadyExists,
                format!("resource {}에 진행 중인 전송이 있음", resource_id),
            );
            transfer.core.complete(Err(error));
            return;
        }

        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };
        transfer.start(&mut link);

        self.resources.insert(resource_id, session_id);
        self.active_sessions.lock().insert(session_id);
        self.transfers.insert(session_id, transfer);
    }

    fn handle_chunk(&mut self, direction: Direction, generation: u64, chunk: Chunk) {
        if !self.streams.is_current(direction, generation) {
            debug!("{} 스트림: 이전 세대({}) 청크 무시", direction, generation);
            return;
        }

        let session_id = chunk.session_id();
        let Some(transfer) = self.transfers.get_mut(&session_id) else {
            debug!("{} 스트림: 알 수 없는 세션 {}의 청크 무시", direction, session_id);
            return;
        };

        if transfer.direction() != direction {
            warn!(
                "전송 {}: {} 스트림으로 {} 전송의 청크 도착, 무시",
                session_id,
                direction,
                transfer.direction()
            );
            return;
        }

        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };
        transfer.handle_chunk(chunk, &mut link);
    }

    fn cancel_transfer(&mut self, session_id: SessionId, handle_id: u64) {
        let Some(transfer) = self.transfers.get_mut(&session_id) else {
            debug!("전송 {}: 이미 종료된 전송의 취소 요청", session_id);
            return;
        };

        // 거부된 중복 요청의 핸들은 진행 중인 전송을 취소할 수 없음
        if transfer.core.handle_id != handle_id {
            debug!("전송 {}: 다른 핸들의 취소 요청 무시", session_id);
            return;
        }

        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };
        transfer.handle_cancellation(&mut link);
    }

    fn handle_stream_closed(&mut self, direction: Direction, generation: u64, status: Status) {
        if !self.streams.is_current(direction, generation) {
            debug!("{} 스트림: 이전 세대({}) 종료 알림 무시", direction, generation);
            return;
        }

        self.streams.reset(direction);

        if status.is_ok() {
            debug!("{} 스트림 정상 종료", direction);
            return;
        }

        warn!("{} 스트림이 {} 상태로 닫힘", direction, status);

        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };
        for transfer in self.transfers.values_mut() {
            if transfer.direction() != direction {
                continue;
            }
            if status == Status::FailedPrecondition {
                transfer.handle_disconnection(&mut link);
            } else {
                transfer.handle_stream_failure(status);
            }
        }
    }

    fn handle_timeouts(&mut self) {
        let now = Instant::now();
        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };

        for transfer in self.transfers.values_mut() {
            if matches!(transfer.deadline(), Some(deadline) if deadline <= now) {
                transfer.handle_timeout(&mut link);
            }
        }
    }

    fn remove_completed(&mut self) {
        let completed: Vec<SessionId> = self
            .transfers
            .iter()
            .filter(|(_, transfer)| transfer.is_completed())
            .map(|(&session_id, _)| session_id)
            .collect();

        for session_id in completed {
            if let Some(transfer) = self.transfers.remove(&session_id) {
                if self.resources.get(&transfer.resource_id()) == Some(&session_id) {
                    self.resources.remove(&transfer.resource_id());
                }
                self.active_sessions.lock().remove(&session_id);
                debug!("전송 {} 제거", session_id);
            }
        }
    }

    /// 남은 전송을 모두 ABORTED로 종료하고 스트림 정리
    fn terminate_all(&mut self) {
        let mut link = Link {
            streams: &mut self.streams,
            abort: self.abort.as_ref(),
        };
        for transfer in self.transfers.values_mut() {
            transfer.handle_termination(&mut link);
        }

        self.transfers.clear();
        self.resources.clear();
        self.active_sessions.lock().clear();
        self.streams.reset_all();
    }
}
