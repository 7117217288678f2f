//! 전송 진행 상황과 통계

use std::time::{Duration, Instant};

/// 진행 콜백으로 전달되는 값
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// 송신(쓰기) 또는 수신(읽기)된 바이트 오프셋
    pub bytes_sent: u64,

    /// 상대측이 확인한 바이트 오프셋
    pub bytes_confirmed_received: u64,

    /// 전체 크기 (알 수 없으면 `None`)
    pub total_size_bytes: Option<u64>,
}

impl TransferProgress {
    /// 진행률 (0.0 ~ 1.0). 전체 크기를 모르면 `None`
    pub fn percent_received(&self) -> Option<f64> {
        match self.total_size_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.bytes_confirmed_received as f64 / total as f64),
            None => None,
        }
    }
}

/// 진행 콜백 타입 (디스패처 태스크에서 호출됨)
pub type ProgressCallback = Box<dyn FnMut(TransferProgress) + Send>;

/// 전송별 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 보낸 청크 수
    pub chunks_sent: u64,

    /// 받은 청크 수
    pub chunks_received: u64,

    /// 데이터 바이트 (보냄 또는 받음)
    pub data_bytes: u64,

    /// 버려진 청크 수 (순서 불일치, 오래된 윈도우)
    pub discarded_chunks: u64,

    /// 재전송으로 다시 보낸 바이트
    pub dropped_bytes: u64,

    /// 타임아웃 재시도 횟수
    pub timeout_retries: u64,

    /// 윈도우 확장 횟수
    pub window_extensions: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            chunks_sent: 0,
            chunks_received: 0,
            data_bytes: 0,
            discarded_chunks: 0,
            dropped_bytes: 0,
            timeout_retries: 0,
            window_extensions: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.data_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {} | Throughput: {:.2} MB/s | Chunks: {} sent / {} recv | Discarded: {} | Dropped: {} B | Retries: {} | Extensions: {}",
            self.elapsed().as_secs_f64(),
            self.data_bytes,
            self.throughput() / 1_000_000.0,
            self.chunks_sent,
            self.chunks_received,
            self.discarded_chunks,
            self.dropped_bytes,
            self.timeout_retries,
            self.window_extensions,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
