//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result};

/// 와이어 프로토콜 버전
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// 세션 ID = 리소스 ID, 핸드쉐이크 없음
    #[default]
    Legacy,

    /// 개시자가 세션 ID를 할당, START에 리소스 ID 포함
    Versioned,
}

/// 타임아웃/재시도 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeoutSettings {
    /// 정상 상태 응답 대기 시간
    pub timeout: Duration,

    /// 첫 응답 대기 시간 (서버측 준비 시간 포함)
    pub initial_timeout: Duration,

    /// 연속 타임아웃/재연결 최대 재시도 횟수
    pub max_retries: u32,
}

impl Default for TransferTimeoutSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            initial_timeout: Duration::from_secs(4),
            max_retries: 3,
        }
    }
}

impl TransferTimeoutSettings {
    pub fn new(timeout: Duration, initial_timeout: Duration, max_retries: u32) -> Result<Self> {
        let settings = Self {
            timeout,
            initial_timeout,
            max_retries,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout은 0보다 커야 함".into()));
        }
        if self.initial_timeout < self.timeout {
            return Err(Error::InvalidConfig(format!(
                "initial_timeout({:?})이 timeout({:?})보다 짧음",
                self.initial_timeout, self.timeout
            )));
        }
        Ok(())
    }
}

/// 읽기 전송 파라미터 (수신측이 송신측에 요구하는 값)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParameters {
    /// 윈도우 크기 (바이트)
    pub max_pending_bytes: u32,

    /// 청크당 최대 크기 (바이트)
    pub max_chunk_size_bytes: u32,

    /// 청크 간 최소 간격 (마이크로초, 0이면 최대 속도)
    pub min_delay_microseconds: u32,
}

impl Default for TransferParameters {
    fn default() -> Self {
        Self {
            max_pending_bytes: 32 * 1024,
            max_chunk_size_bytes: 1024,
            min_delay_microseconds: 0,
        }
    }
}

impl TransferParameters {
    pub fn new(
        max_pending_bytes: u32,
        max_chunk_size_bytes: u32,
        min_delay_microseconds: u32,
    ) -> Result<Self> {
        let params = Self {
            max_pending_bytes,
            max_chunk_size_bytes,
            min_delay_microseconds,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pending_bytes == 0 || self.max_chunk_size_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_bytes, max_chunk_size_bytes는 0보다 커야 함".into(),
            ));
        }
        if self.max_chunk_size_bytes > self.max_pending_bytes {
            return Err(Error::InvalidConfig(format!(
                "청크 크기({})가 윈도우({})보다 큼",
                self.max_chunk_size_bytes, self.max_pending_bytes
            )));
        }
        Ok(())
    }
}

/// 클라이언트 설정
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// 타임아웃/재시도
    pub timeouts: TransferTimeoutSettings,

    /// 읽기 기본 파라미터
    pub read_parameters: TransferParameters,

    /// 초기 프로토콜 버전
    pub protocol_version: ProtocolVersion,
}

impl ClientConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.validate()?;
        self.read_parameters.validate()
    }

    /// 저지연 링크용 설정 (짧은 타임아웃, 작은 윈도우)
    pub fn low_latency() -> Self {
        Self {
            timeouts: TransferTimeoutSettings {
                timeout: Duration::from_millis(250),
                initial_timeout: Duration::from_millis(500),
                max_retries: 3,
            },
            read_parameters: TransferParameters {
                max_pending_bytes: 16 * 1024,
                max_chunk_size_bytes: 1024,
                min_delay_microseconds: 0,
            },
            protocol_version: ProtocolVersion::Versioned,
        }
    }

    /// 불안정한 링크용 설정
    pub fn unstable_link() -> Self {
        Self {
            timeouts: TransferTimeoutSettings {
                timeout: Duration::from_secs(5),
                initial_timeout: Duration::from_secs(10),
                max_retries: 8,
            },
            read_parameters: TransferParameters {
                max_pending_bytes: 4 * 1024, // 작은 윈도우
                max_chunk_size_bytes: 512,
                min_delay_microseconds: 200,
            },
            protocol_version: ProtocolVersion::Legacy,
        }
    }
}
