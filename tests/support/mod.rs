//! 통합 테스트용 메모리 내 상대측
//!
//! 클라이언트가 보낸 청크를 `send` 안에서 바로 처리하고 응답을
//! [`StreamEvents`]로 돌려준다. 응답은 코덱을 거쳐 전달된다.
//!
//! - 클라이언트 쓰기: 상대측이 수신측 (윈도우 지정, 절반 남으면 CONTINUE)
//! - 클라이언트 읽기: 상대측이 송신측 (윈도우만큼 한 번에 전송)

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ctp::{
    Chunk, ChunkType, ClientConfig, Direction, SessionId, Status, StreamEvents, TransferParameters,
    TransferTimeoutSettings, Transport, TransportError,
};

/// 상대측 동작 설정
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// 쓰기 수신 윈도우
    pub window: u32,

    /// 쓰기 수신 청크 크기
    pub chunk_size: u32,

    /// 쓰기 송신측에 요구하는 청크 간격
    pub min_delay_us: u32,

    /// 응답 없이 무시할 START 수
    pub ignore_starts: usize,

    /// 스트림을 끊어버릴 START 수
    pub disconnect_starts: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            window: 1024,
            chunk_size: 256,
            min_delay_us: 0,
            ignore_starts: 0,
            disconnect_starts: 0,
        }
    }
}

enum Session {
    /// 클라이언트 쓰기를 받는 중
    Receiving {
        resource_id: u32,
        offset: u64,
        window_end: u64,
        data: Vec<u8>,
    },

    /// 클라이언트 읽기에 보내는 중
    Sending {
        data: Vec<u8>,
        sent_offset: u64,
        window_end: u64,
        max_chunk: u64,
        finished: bool,
    },
}

#[derive(Default)]
struct PeerState {
    config: PeerConfig,
    resources: HashMap<u32, Vec<u8>>,
    streams: HashMap<Direction, StreamEvents>,
    sessions: HashMap<SessionId, Session>,
    received: Vec<(Direction, Chunk)>,
    continues_sent: usize,
    observer: Option<mpsc::UnboundedSender<(Direction, Chunk)>>,
}

impl PeerState {
    fn parameters(&self, chunk_type: ChunkType, session_id: SessionId, offset: u64) -> Chunk {
        Chunk::new(chunk_type, session_id)
            .with_window(offset, offset + self.config.window as u64)
            .with_max_chunk_size(self.config.chunk_size)
            .with_min_delay(self.config.min_delay_us)
    }

    /// START 가로채기. 처리했으면 `true`
    fn intercept_start(&mut self, direction: Direction) -> bool {
        if self.config.ignore_starts > 0 {
            self.config.ignore_starts -= 1;
            return true;
        }
        if self.config.disconnect_starts > 0 {
            self.config.disconnect_starts -= 1;
            if let Some(events) = self.streams.get(&direction) {
                events.on_stream_closed(Status::FailedPrecondition);
            }
            return true;
        }
        false
    }

    fn handle_write_chunk(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        let session_id = chunk.session_id();

        match chunk.chunk_type() {
            Some(ChunkType::Start) => {
                if self.intercept_start(Direction::Write) {
                    return Vec::new();
                }
                let offset = chunk.offset();
                self.sessions.insert(
                    session_id,
                    Session::Receiving {
                        resource_id: chunk.header.resource_id.unwrap_or(session_id),
                        offset,
                        window_end: offset + self.config.window as u64,
                        data: Vec::new(),
                    },
                );
                vec![self.parameters(ChunkType::ParametersRetransmit, session_id, offset)]
            }
            Some(ChunkType::Data) => self.receive_data(chunk),
            Some(ChunkType::Completion) => {
                self.sessions.remove(&session_id);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn receive_data(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        let session_id = chunk.session_id();
        let window = self.config.window as u64;

        let Some(Session::Receiving {
            resource_id,
            offset,
            window_end,
            data,
        }) = self.sessions.get_mut(&session_id)
        else {
            return Vec::new();
        };

        if chunk.offset() != *offset {
            *window_end = *offset + window;
            let expected = *offset;
            return vec![self.parameters(ChunkType::ParametersRetransmit, session_id, expected)];
        }

        data.extend_from_slice(&chunk.data);
        *offset += chunk.data.len() as u64;

        if chunk.is_last_data() {
            let resource_id = *resource_id;
            let data = std::mem::take(data);
            self.sessions.remove(&session_id);
            self.resources.insert(resource_id, data);
            return vec![Chunk::completion(session_id, Status::Ok)];
        }

        if window_end.saturating_sub(*offset) <= window / 2 {
            *window_end = *offset + window;
            let current = *offset;
            self.continues_sent += 1;
            return vec![self.parameters(ChunkType::ParametersContinue, session_id, current)];
        }
        Vec::new()
    }

    fn handle_read_chunk(&mut self, chunk: &Chunk) -> Vec<Chunk> {
        let session_id = chunk.session_id();
        let chunk_type = chunk.chunk_type();

        match chunk_type {
            Some(ChunkType::Completion) => {
                self.sessions.remove(&session_id);
                return Vec::new();
            }
            Some(ChunkType::Data) => return Vec::new(),
            Some(ChunkType::Start) => {
                if self.intercept_start(Direction::Read) {
                    return Vec::new();
                }
                self.sessions.remove(&session_id);
            }
            _ => {}
        }

        if !self.sessions.contains_key(&session_id) {
            // 구버전 재전송은 세션 ID = 리소스 ID로 시작 취급
            if chunk_type == Some(ChunkType::ParametersContinue) {
                return Vec::new();
            }
            let resource_id = chunk.header.resource_id.unwrap_or(session_id);
            let Some(data) = self.resources.get(&resource_id).cloned() else {
                return vec![Chunk::completion(session_id, Status::NotFound)];
            };
            self.sessions.insert(
                session_id,
                Session::Sending {
                    data,
                    sent_offset: chunk.offset(),
                    window_end: 0,
                    max_chunk: 0,
                    finished: false,
                },
            );
        }

        let Some(Session::Sending {
            data,
            sent_offset,
            window_end,
            max_chunk,
            finished,
        }) = self.sessions.get_mut(&session_id)
        else {
            return Vec::new();
        };

        if chunk_type != Some(ChunkType::ParametersContinue) {
            *sent_offset = chunk.offset();
            *finished = false;
        }
        *window_end = chunk.header.window_end_offset;
        if let Some(size) = chunk.header.max_chunk_size_bytes {
            *max_chunk = size as u64;
        }

        let end = data.len() as u64;
        let mut out = Vec::new();
        loop {
            if *sent_offset >= end {
                if !*finished {
                    out.push(Chunk::data(session_id, end, Bytes::new()).with_remaining_bytes(0));
                    *finished = true;
                }
                break;
            }

            let window_left = window_end.saturating_sub(*sent_offset);
            if window_left == 0 {
                break;
            }

            let limit = if *max_chunk == 0 { window_left } else { *max_chunk };
            let len = limit.min(window_left).min(end - *sent_offset);
            let next = *sent_offset + len;
            let payload = Bytes::copy_from_slice(&data[*sent_offset as usize..next as usize]);
            out.push(
                Chunk::data(session_id, *sent_offset, payload).with_remaining_bytes(end - next),
            );
            *sent_offset = next;

            if next == end {
                *finished = true;
                break;
            }
        }
        out
    }
}

/// 메모리 내 상대측 (트랜스포트 겸 서버)
#[derive(Clone, Default)]
pub struct LoopbackPeer {
    state: Arc<Mutex<PeerState>>,
}

impl LoopbackPeer {
    pub fn new(config: PeerConfig) -> Self {
        let peer = Self::default();
        peer.state.lock().config = config;
        peer
    }

    pub fn insert_resource(&self, resource_id: u32, data: Vec<u8>) {
        self.state.lock().resources.insert(resource_id, data);
    }

    pub fn resource(&self, resource_id: u32) -> Option<Vec<u8>> {
        self.state.lock().resources.get(&resource_id).cloned()
    }

    /// 클라이언트가 보낸 청크 전체
    pub fn received(&self) -> Vec<(Direction, Chunk)> {
        self.state.lock().received.clone()
    }

    pub fn continues_sent(&self) -> usize {
        self.state.lock().continues_sent
    }

    /// 이후 클라이언트가 보내는 청크를 받아보는 채널
    pub fn observe(&self) -> mpsc::UnboundedReceiver<(Direction, Chunk)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().observer = Some(tx);
        rx
    }
}

impl Transport for LoopbackPeer {
    fn open_stream(
        &mut self,
        direction: Direction,
        events: StreamEvents,
    ) -> Result<(), TransportError> {
        self.state.lock().streams.insert(direction, events);
        Ok(())
    }

    fn send(&mut self, direction: Direction, chunk: &Chunk) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.received.push((direction, chunk.clone()));
        if let Some(observer) = &state.observer {
            let _ = observer.send((direction, chunk.clone()));
        }

        let replies = match direction {
            Direction::Write => state.handle_write_chunk(chunk),
            Direction::Read => state.handle_read_chunk(chunk),
        };

        if let Some(events) = state.streams.get(&direction) {
            for reply in replies {
                let bytes = reply.to_bytes().map_err(|e| TransportError::Rejected {
                    status: Status::Internal,
                    reason: e.to_string(),
                })?;
                events.on_bytes(&bytes);
            }
        }
        Ok(())
    }

    fn reset_stream(&mut self, direction: Direction) {
        self.state.lock().streams.remove(&direction);
    }
}

/// 테스트용 클라이언트 설정 (윈도우 1024, 청크 256)
pub fn test_config(timeout: Duration, initial_timeout: Duration, max_retries: u32) -> ClientConfig {
    ClientConfig {
        timeouts: TransferTimeoutSettings::new(timeout, initial_timeout, max_retries).unwrap(),
        read_parameters: TransferParameters::new(1024, 256, 0).unwrap(),
        ..ClientConfig::default()
    }
}

/// 위치마다 다른 값을 가진 테스트 데이터
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// 한 방향으로 보낸 청크 중 특정 타입만
pub fn chunks_of(
    received: &[(Direction, Chunk)],
    direction: Direction,
    chunk_type: ChunkType,
) -> Vec<Chunk> {
    received
        .iter()
        .filter(|(d, c)| *d == direction && c.chunk_type() == Some(chunk_type))
        .map(|(_, c)| c.clone())
        .collect()
}
