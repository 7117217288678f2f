//! # CTP (Chunk Transfer Protocol)
//!
//! 신뢰성 없는 메시지 스트림 위의 윈도우 기반 대용량 전송 클라이언트 엔진
//!
//! ## 핵심 특징
//! - **윈도우 흐름 제어**: 수신측이 윈도우와 청크 크기를 정하고 송신측이 따름
//! - **순서 보장 수신**: 재조립 버퍼 없이 어긋난 오프셋은 재전송 요청
//! - **타임아웃 재시도**: 모든 재시도는 `max_retries`로 제한
//! - **연결 복구**: 첫 응답 전 스트림이 끊기면 전송을 다시 시작
//! - **단일 태스크 디스패처**: 방향별 스트림 하나에 여러 전송을 다중화
//!
//! ## 사용 예
//! ```no_run
//! use ctp::{ClientConfig, TransferClient, UdpTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::new("127.0.0.1:9000".parse()?);
//! let client = TransferClient::new(transport, ClientConfig::default())?;
//!
//! let data = client.read(1).await?;
//! client.write(2, data).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod client;
pub mod config;
mod dispatcher;
pub mod error;
mod read;
pub mod stats;
pub mod status;
mod transfer;
pub mod transport;
pub mod udp;
mod write;

pub use chunk::{Chunk, ChunkHeader, ChunkType, ResourceId, SessionId};
pub use client::{ReadOptions, TransferClient, TransferHandle, WriteOptions};
pub use config::{ClientConfig, ProtocolVersion, TransferParameters, TransferTimeoutSettings};
pub use dispatcher::AbortPredicate;
pub use error::{Error, Result, TransferError, TransportError};
pub use stats::{ProgressCallback, TransferProgress, TransferStats};
pub use status::Status;
pub use transport::{Direction, StreamEvents, Transport};
pub use udp::UdpTransport;
