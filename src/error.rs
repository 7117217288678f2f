//! 에러 타입 정의

use thiserror::Error;

use crate::chunk::SessionId;
use crate::status::Status;

/// CTP 라이브러리 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("잘못된 청크: {0}")]
    MalformedChunk(String),

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("tokio 런타임 밖에서 호출됨: {0}")]
    Runtime(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

/// 전송 결과 에러 (결과 핸들로 전달됨)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("전송 {session_id} 실패: {status} ({message})")]
pub struct TransferError {
    pub status: Status,
    pub session_id: SessionId,
    pub message: String,
}

impl TransferError {
    pub fn new(session_id: SessionId, status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            session_id,
            message: message.into(),
        }
    }
}

/// 트랜스포트 송신/스트림 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 스트림이 열려 있지 않음 (재연결 대상)
    #[error("스트림이 열려 있지 않음")]
    StreamNotOpen,

    #[error("송신 실패 ({status}): {reason}")]
    Rejected { status: Status, reason: String },
}

impl TransportError {
    /// 전송에 전달할 상태 코드
    pub fn status(&self) -> Status {
        match self {
            TransportError::StreamNotOpen => Status::FailedPrecondition,
            TransportError::Rejected { status, .. } => *status,
        }
    }

    pub fn io(err: std::io::Error) -> Self {
        TransportError::Rejected {
            status: Status::Unavailable,
            reason: err.to_string(),
        }
    }
}
