//! 읽기 전송 (윈도우 흐름 제어의 수신측)
//!
//! - 순서대로 도착한 데이터만 받는다. 재조립 버퍼는 없다
//! - 오프셋이 어긋나면 마지막 정상 오프셋으로 파라미터를 다시 보낸다
//! - 윈도우가 절반 이하로 남으면 미리 확장해서 송신측이 멈추지 않게 한다

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::chunk::{Chunk, ChunkType};
use crate::config::{ProtocolVersion, TransferParameters};
use crate::stats::TransferProgress;
use crate::status::Status;
use crate::transfer::{ChunkSink, Stopped, TransferCore, TransferState};

/// 윈도우 확장 기준 (남은 윈도우 <= max_pending_bytes / EXTEND_WINDOW_DIVISOR)
const EXTEND_WINDOW_DIVISOR: u64 = 2;

/// 읽기 전송 상태
#[derive(Debug)]
pub(crate) struct ReadTransfer {
    parameters: TransferParameters,

    /// 다음에 받을 바이트 오프셋
    offset: u64,

    /// 현재 윈도우 끝
    window_end_offset: u64,

    /// 상대측이 알려준 남은 크기
    remaining_transfer_size: Option<u64>,

    /// 받은 데이터 (오프셋 순서)
    data: BytesMut,
}

impl ReadTransfer {
    pub(crate) fn new(parameters: TransferParameters, initial_offset: u64) -> Self {
        Self {
            parameters,
            offset: initial_offset,
            window_end_offset: initial_offset + parameters.max_pending_bytes as u64,
            remaining_transfer_size: None,
            data: BytesMut::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    #[cfg(test)]
    pub(crate) fn window_end_offset(&self) -> u64 {
        self.window_end_offset
    }

    /// 윈도우에 남은 바이트
    pub(crate) fn pending_bytes(&self) -> u64 {
        self.window_end_offset.saturating_sub(self.offset)
    }

    pub(crate) fn take_data(&mut self) -> Bytes {
        std::mem::take(&mut self.data).freeze()
    }

    fn with_parameters(&self, chunk: Chunk) -> Chunk {
        chunk
            .with_window(self.offset, self.window_end_offset)
            .with_max_chunk_size(self.parameters.max_chunk_size_bytes)
            .with_min_delay(self.parameters.min_delay_microseconds)
    }

    /// START 청크 (전송 파라미터 포함)
    pub(crate) fn initial_chunk(&self, core: &TransferCore) -> Chunk {
        self.with_parameters(Chunk::start(core.session_id, core.resource_id))
    }

    /// 현재 오프셋에서 윈도우를 새로 잡은 파라미터 청크
    fn parameters_chunk(&mut self, core: &TransferCore, chunk_type: ChunkType) -> Chunk {
        self.window_end_offset = self.offset + self.parameters.max_pending_bytes as u64;
        self.with_parameters(Chunk::new(chunk_type, core.session_id))
    }

    /// 타임아웃 재시도용 청크
    pub(crate) fn retry_chunk(&mut self, core: &TransferCore) -> Chunk {
        // 버전 프로토콜에서 START가 유실됐으면 상대측은 세션을 모름
        if core.protocol_version == ProtocolVersion::Versioned && !core.received_any {
            return self.initial_chunk(core);
        }
        self.parameters_chunk(core, ChunkType::ParametersRetransmit)
    }

    pub(crate) fn handle_data_chunk(
        &mut self,
        core: &mut TransferCore,
        chunk: Chunk,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), Stopped> {
        if !matches!(chunk.chunk_type(), None | Some(ChunkType::Data)) {
            debug!(
                "전송 {}: 읽기 전송에 {:?} 청크 도착, 무시",
                core.session_id,
                chunk.chunk_type()
            );
            core.set_next_chunk_timeout();
            return Ok(());
        }

        core.state = TransferState::ReceivingData;

        if chunk.offset() != self.offset {
            debug!(
                "전송 {}: 예상 오프셋 {}, 수신 오프셋 {}; 파라미터 재전송",
                core.session_id,
                self.offset,
                chunk.offset()
            );
            core.stats.discarded_chunks += 1;
            let params = self.parameters_chunk(core, ChunkType::ParametersRetransmit);
            core.send_chunk(sink, params)?;
            core.set_next_chunk_timeout();
            return Ok(());
        }

        let len = chunk.data.len() as u64;
        self.data.extend_from_slice(&chunk.data);
        self.offset += len;
        core.stats.data_bytes += len;

        match chunk.header.remaining_bytes {
            Some(0) => {
                core.report_progress(TransferProgress {
                    bytes_sent: self.offset,
                    bytes_confirmed_received: self.offset,
                    total_size_bytes: Some(self.offset),
                });
                let data = self.take_data();
                core.send_final_chunk(sink, Status::Ok, Ok(data));
                return Ok(());
            }
            Some(remaining) => self.remaining_transfer_size = Some(remaining),
            None => {
                if let Some(remaining) = self.remaining_transfer_size {
                    self.remaining_transfer_size = Some(remaining.saturating_sub(len));
                }
            }
        }

        core.report_progress(TransferProgress {
            bytes_sent: self.offset,
            bytes_confirmed_received: self.offset,
            total_size_bytes: self
                .remaining_transfer_size
                .and_then(|r| self.offset.checked_add(r)),
        });

        let max_pending = self.parameters.max_pending_bytes as u64;
        if self.pending_bytes() == 0 {
            let params = self.parameters_chunk(core, ChunkType::ParametersRetransmit);
            core.send_chunk(sink, params)?;
        } else if self.pending_bytes() <= max_pending / EXTEND_WINDOW_DIVISOR {
            let params = self.parameters_chunk(core, ChunkType::ParametersContinue);
            core.stats.window_extensions += 1;
            debug!(
                "전송 {}: 윈도우 확장 -> {}",
                core.session_id, self.window_end_offset
            );
            core.send_chunk(sink, params)?;
        }

        core.set_next_chunk_timeout();
        Ok(())
    }
}
