//! 트랜스포트 추상화
//!
//! 엔진은 방향(읽기/쓰기)마다 하나의 논리 스트림을 사용한다.
//! 스트림은 첫 송신 시점에 열리고, 에러가 나면 버려진 뒤 다음 송신에서
//! 다시 열린다. 트랜스포트는 수신한 청크와 스트림 종료를 [`StreamEvents`]로
//! 알리기만 하고, 전송 상태는 절대 직접 건드리지 않는다.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::dispatcher::Event;
use crate::error::TransportError;
use crate::status::Status;

/// 스트림 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 클라이언트가 읽는 전송
    Read,

    /// 클라이언트가 쓰는 전송
    Write,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    /// 와이어 태그
    pub fn tag(self) -> u8 {
        match self {
            Direction::Read => 0x52,  // 'R'
            Direction::Write => 0x57, // 'W'
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x52 => Some(Direction::Read),
            0x57 => Some(Direction::Write),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// 트랜스포트가 디스패처로 이벤트를 넘기는 핸들
///
/// 어느 스레드에서 호출해도 되며 절대 블록하지 않는다.
/// 스트림이 다시 열리면 이전 핸들의 이벤트는 무시된다.
#[derive(Clone)]
pub struct StreamEvents {
    tx: mpsc::UnboundedSender<Event>,
    direction: Direction,
    generation: u64,
}

impl StreamEvents {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Event>,
        direction: Direction,
        generation: u64,
    ) -> Self {
        Self {
            tx,
            direction,
            generation,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 수신 청크 전달. 디스패처가 종료됐으면 `false`
    pub fn on_chunk(&self, chunk: Chunk) -> bool {
        self.tx
            .send(Event::Chunk {
                direction: self.direction,
                generation: self.generation,
                chunk,
            })
            .is_ok()
    }

    /// 수신 바이트를 디코딩해서 전달. 디코딩 실패는 로그만 남기고 버림
    pub fn on_bytes(&self, bytes: &[u8]) -> bool {
        match Chunk::from_bytes(bytes) {
            Ok(chunk) => self.on_chunk(chunk),
            Err(e) => {
                warn!("{} 스트림: 청크 디코딩 실패: {}", self.direction, e);
                !self.tx.is_closed()
            }
        }
    }

    /// 스트림 종료 알림. `FAILED_PRECONDITION`이면 재연결을 시도함
    pub fn on_stream_closed(&self, status: Status) -> bool {
        self.tx
            .send(Event::StreamClosed {
                direction: self.direction,
                generation: self.generation,
                status,
            })
            .is_ok()
    }
}

impl fmt::Debug for StreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEvents")
            .field("direction", &self.direction)
            .field("generation", &self.generation)
            .finish()
    }
}

/// 엔진이 사용하는 트랜스포트
///
/// 모든 메서드는 디스패처 태스크에서만 호출된다.
pub trait Transport: Send + 'static {
    /// 스트림 열기. 이후 수신은 `events`로 전달해야 함
    fn open_stream(
        &mut self,
        direction: Direction,
        events: StreamEvents,
    ) -> Result<(), TransportError>;

    /// 청크 송신
    fn send(&mut self, direction: Direction, chunk: &Chunk) -> Result<(), TransportError>;

    /// 스트림 정리. 다음 송신에서 다시 열림
    fn reset_stream(&mut self, direction: Direction);
}

/// 방향별 스트림 상태
#[derive(Debug, Clone, Copy, Default)]
struct StreamSlot {
    open: bool,
    generation: u64,
}

/// 디스패처가 소유하는 스트림 집합 (지연 오픈 + 세대 관리)
pub(crate) struct Streams {
    transport: Box<dyn Transport>,
    events_tx: mpsc::UnboundedSender<Event>,
    slots: [StreamSlot; 2],
}

impl Streams {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            transport,
            events_tx,
            slots: [StreamSlot::default(); 2],
        }
    }

    /// 청크 송신 (필요하면 스트림을 먼저 연다)
    pub(crate) fn send(
        &mut self,
        direction: Direction,
        chunk: &Chunk,
    ) -> Result<(), TransportError> {
        let slot = &mut self.slots[direction.index()];
        if !slot.open {
            slot.generation += 1;
            let events = StreamEvents::new(self.events_tx.clone(), direction, slot.generation);
            self.transport.open_stream(direction, events)?;
            slot.open = true;
            debug!("{} 스트림 열림 (generation {})", direction, slot.generation);
        }
        self.transport.send(direction, chunk)
    }

    /// 현재 세대의 스트림인지 확인
    pub(crate) fn is_current(&self, direction: Direction, generation: u64) -> bool {
        let slot = &self.slots[direction.index()];
        slot.open && slot.generation == generation
    }

    /// 스트림 정리
    pub(crate) fn reset(&mut self, direction: Direction) {
        let slot = &mut self.slots[direction.index()];
        if slot.open {
            slot.open = false;
            self.transport.reset_stream(direction);
            debug!("{} 스트림 리셋 (generation {})", direction, slot.generation);
        }
    }

    pub(crate) fn reset_all(&mut self) {
        for direction in Direction::ALL {
            self.reset(direction);
        }
    }
}
