//! 청크 정의와 코덱
//!
//! 청크는 스트림 위로 오가는 유일한 메시지 단위다.
//! 필드의 값뿐 아니라 "존재 여부"도 의미를 가지므로 (`status`,
//! `remaining_bytes`, `max_chunk_size_bytes`, `min_delay_microseconds`)
//! 헤더는 `Option` 필드를 그대로 직렬화한다.
//!
//! 바이트 레이아웃: `header_len(u16 LE) | bincode(header) | payload`

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::status::Status;
use crate::{Error, Result};

/// 세션 ID (개시자가 할당)
pub type SessionId = u32;

/// 리소스 ID (전송 대상 객체)
pub type ResourceId = u32;

/// 청크 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkType {
    /// 전송 시작
    Start = 1,

    /// 데이터
    Data = 2,

    /// 윈도우 재설정 (송신측은 offset부터 다시 보냄)
    ParametersRetransmit = 3,

    /// 윈도우 확장 (송신측은 이어서 보냄)
    ParametersContinue = 4,

    /// 전송 종료 (status 포함)
    Completion = 5,
}

/// 청크 헤더
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// 청크 타입. 레거시 청크는 타입이 없음
    pub chunk_type: Option<ChunkType>,

    /// 세션 ID
    pub session_id: SessionId,

    /// 리소스 ID (START에만 존재)
    pub resource_id: Option<ResourceId>,

    /// 전송 내 바이트 오프셋
    pub offset: u64,

    /// 남은 바이트 수. 0이면 마지막 데이터 청크
    pub remaining_bytes: Option<u64>,

    /// 수신측이 허용한 대기 바이트 수
    pub pending_bytes: Option<u32>,

    /// 수신측 윈도우 끝 오프셋
    pub window_end_offset: u64,

    /// 수신측이 요구하는 청크당 최대 크기
    pub max_chunk_size_bytes: Option<u32>,

    /// 수신측 pacing 힌트 (마이크로초)
    pub min_delay_microseconds: Option<u32>,

    /// 완료 상태 코드 (COMPLETION에만 존재)
    pub status: Option<u32>,
}

/// 청크 (스트림 메시지 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 청크 헤더
    pub header: ChunkHeader,

    /// 데이터 (DATA 청크)
    pub data: Bytes,
}

impl Chunk {
    /// 빈 청크 생성
    pub fn new(chunk_type: ChunkType, session_id: SessionId) -> Self {
        Self {
            header: ChunkHeader {
                chunk_type: Some(chunk_type),
                session_id,
                ..ChunkHeader::default()
            },
            data: Bytes::new(),
        }
    }

    /// START 청크
    pub fn start(session_id: SessionId, resource_id: ResourceId) -> Self {
        let mut chunk = Self::new(ChunkType::Start, session_id);
        chunk.header.resource_id = Some(resource_id);
        chunk
    }

    /// DATA 청크
    pub fn data(session_id: SessionId, offset: u64, data: Bytes) -> Self {
        let mut chunk = Self::new(ChunkType::Data, session_id);
        chunk.header.offset = offset;
        chunk.data = data;
        chunk
    }

    /// COMPLETION 청크
    pub fn completion(session_id: SessionId, status: Status) -> Self {
        let mut chunk = Self::new(ChunkType::Completion, session_id);
        chunk.header.status = Some(status.code());
        chunk
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.header.offset = offset;
        self
    }

    pub fn with_window(mut self, offset: u64, window_end_offset: u64) -> Self {
        self.header.offset = offset;
        self.header.window_end_offset = window_end_offset;
        let pending = window_end_offset.saturating_sub(offset).min(u32::MAX as u64);
        self.header.pending_bytes = Some(pending as u32);
        self
    }

    pub fn with_remaining_bytes(mut self, remaining: u64) -> Self {
        self.header.remaining_bytes = Some(remaining);
        self
    }

    pub fn with_max_chunk_size(mut self, size: u32) -> Self {
        self.header.max_chunk_size_bytes = Some(size);
        self
    }

    pub fn with_min_delay(mut self, micros: u32) -> Self {
        self.header.min_delay_microseconds = Some(micros);
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        self.header.chunk_type
    }

    pub fn offset(&self) -> u64 {
        self.header.offset
    }

    /// 완료 청크 여부 (status 존재)
    pub fn is_final(&self) -> bool {
        self.header.status.is_some()
    }

    /// 재전송 신호 여부. 타입 없는 레거시 청크도 재전송으로 취급
    pub fn is_retransmit(&self) -> bool {
        matches!(
            self.header.chunk_type,
            None | Some(ChunkType::Start) | Some(ChunkType::ParametersRetransmit)
        )
    }

    /// 마지막 데이터 청크 여부
    pub fn is_last_data(&self) -> bool {
        self.header.remaining_bytes == Some(0)
    }

    /// 청크를 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_bytes = bincode::serialize(&self.header)?;
        let header_len = u16::try_from(header_bytes.len())
            .map_err(|_| Error::MalformedChunk(format!("헤더 크기 초과: {}", header_bytes.len())))?;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + self.data.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// 바이트에서 청크 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::MalformedChunk("길이 접두사 없음".into()));
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(Error::MalformedChunk(format!(
                "헤더 잘림: {} < {}",
                bytes.len(),
                2 + header_len
            )));
        }

        let header: ChunkHeader = bincode::deserialize(&bytes[2..2 + header_len])?;

        // status는 COMPLETION (또는 타입 없는 레거시 청크)에만 허용
        match (header.chunk_type, header.status) {
            (Some(ChunkType::Completion), None) => {
                return Err(Error::MalformedChunk("COMPLETION 청크에 status 없음".into()));
            }
            (Some(t), Some(_)) if t != ChunkType::Completion => {
                return Err(Error::MalformedChunk(format!("{:?} 청크에 status 존재", t)));
            }
            _ => {}
        }

        let data = Bytes::copy_from_slice(&bytes[2 + header_len..]);
        Ok(Self { header, data })
    }
}
