//! 쓰기 전송 (윈도우 흐름 제어의 송신측)
//!
//! 수신측이 보내는 파라미터 청크로 윈도우가 정해진다.
//! 윈도우 안의 데이터는 타이머 틱마다 한 청크씩 보낸다. 청크 간격
//! (`min_chunk_delay`)은 sleep이 아니라 다음 데드라인으로 구현되므로
//! 디스패처는 그 사이 다른 전송을 처리할 수 있다.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkType};
use crate::stats::TransferProgress;
use crate::status::Status;
use crate::transfer::{ChunkSink, Stopped, TransferCore, TransferState};

/// 쓰기 전송 상태
#[derive(Debug)]
pub(crate) struct WriteTransfer {
    /// 보낼 데이터 (불변)
    data: Bytes,

    /// `data[0]`의 전송 오프셋
    initial_offset: u64,

    /// 다음에 보낼 오프셋
    sent_offset: u64,

    /// 수신측이 허용한 윈도우 끝 (데이터 끝을 넘지 않음)
    window_end_offset: u64,

    /// 수신측이 확인한 오프셋
    confirmed_offset: u64,

    /// 청크당 최대 크기 (0이면 아직 모름)
    max_chunk_size_bytes: u32,

    /// 청크 간 최소 간격 (마이크로초)
    min_chunk_delay_us: u32,
}

impl WriteTransfer {
    pub(crate) fn new(data: Bytes, initial_offset: u64) -> Self {
        Self {
            data,
            initial_offset,
            sent_offset: initial_offset,
            window_end_offset: initial_offset,
            confirmed_offset: initial_offset,
            max_chunk_size_bytes: 0,
            min_chunk_delay_us: 0,
        }
    }

    /// 데이터 끝 오프셋
    pub(crate) fn end_offset(&self) -> u64 {
        self.initial_offset + self.data.len() as u64
    }

    #[cfg(test)]
    pub(crate) fn sent_offset(&self) -> u64 {
        self.sent_offset
    }

    #[cfg(test)]
    pub(crate) fn window_end_offset(&self) -> u64 {
        self.window_end_offset
    }

    /// START 청크 (전체 크기 포함)
    pub(crate) fn initial_chunk(&self, core: &TransferCore) -> Chunk {
        Chunk::start(core.session_id, core.resource_id)
            .with_offset(self.initial_offset)
            .with_remaining_bytes(self.data.len() as u64)
    }

    /// 타임아웃 재시도용 청크: 마지막으로 보낸 청크
    ///
    /// 수신측이 타임아웃을 처리하지 않아도 이 청크로 파라미터 갱신을 유도한다.
    pub(crate) fn retry_chunk(&self, core: &TransferCore) -> Chunk {
        core.last_chunk_sent
            .clone()
            .unwrap_or_else(|| self.initial_chunk(core))
    }

    /// 파라미터 청크의 윈도우 끝 (데이터 끝으로 제한)
    fn window_end_for(&self, chunk: &Chunk) -> u64 {
        let window_end = match chunk.header.pending_bytes {
            // 재전송 청크는 구버전일 수 있으므로 pending_bytes 우선
            Some(pending) if chunk.is_retransmit() => chunk.offset().saturating_add(pending as u64),
            _ => chunk.header.window_end_offset,
        };
        window_end.min(self.end_offset())
    }

    /// 파라미터 청크 처리
    pub(crate) fn handle_data_chunk(
        &mut self,
        core: &mut TransferCore,
        chunk: Chunk,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), Stopped> {
        if chunk.chunk_type() == Some(ChunkType::Data) {
            warn!("전송 {}: 쓰기 전송에 DATA 청크 도착, 무시", core.session_id);
            core.stats.discarded_chunks += 1;
            core.set_next_chunk_timeout();
            return Ok(());
        }

        let offset = chunk.offset();
        if offset < self.initial_offset || offset > self.end_offset() {
            warn!(
                "전송 {}: 수신측 오프셋 {}이 데이터 범위 [{}, {}] 밖",
                core.session_id,
                offset,
                self.initial_offset,
                self.end_offset()
            );
            let error = core.error(
                Status::OutOfRange,
                format!("오프셋 {}이 데이터 끝 {}을 넘음", offset, self.end_offset()),
            );
            core.send_final_chunk(sink, Status::OutOfRange, Err(error));
            return Err(Stopped);
        }

        let window_end = self.window_end_for(&chunk);

        if chunk.is_retransmit() {
            if offset < self.sent_offset {
                core.stats.dropped_bytes += self.sent_offset - offset;
            }
            self.sent_offset = offset;
        } else if window_end <= self.sent_offset {
            debug!(
                "전송 {}: 오래된 윈도우 청크 무시 (window_end={}, sent_offset={})",
                core.session_id, window_end, self.sent_offset
            );
            core.stats.discarded_chunks += 1;
            core.set_next_chunk_timeout();
            return Ok(());
        }

        self.confirmed_offset = offset;

        if let Some(size) = chunk.header.max_chunk_size_bytes {
            self.max_chunk_size_bytes = size;
        }
        if let Some(delay) = chunk.header.min_delay_microseconds {
            self.min_chunk_delay_us = delay;
        }

        if self.max_chunk_size_bytes == 0 {
            if window_end <= self.sent_offset {
                warn!("전송 {}: 수신측이 0바이트 윈도우를 요청함", core.session_id);
                let error = core.error(Status::InvalidArgument, "청크 크기와 윈도우가 모두 0");
                core.send_final_chunk(sink, Status::InvalidArgument, Err(error));
                return Err(Stopped);
            }
            // 청크 크기 지정이 없으면 윈도우 전체를 한 번에
            let window = (window_end - self.sent_offset).min(u32::MAX as u64);
            self.max_chunk_size_bytes = window as u32;
        }

        self.window_end_offset = window_end;
        core.state = TransferState::Transmitting;
        self.transmit_next(core, sink)
    }

    /// 다음 DATA 청크 송신 (Transmitting 상태의 타이머 틱)
    pub(crate) fn transmit_next(
        &mut self,
        core: &mut TransferCore,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), Stopped> {
        let end = self.end_offset();
        let window_left = self.window_end_offset.saturating_sub(self.sent_offset);

        if window_left == 0 && self.sent_offset < end {
            core.state = TransferState::WaitingForTransferParameters;
            core.set_next_chunk_timeout();
            return Ok(());
        }

        let len = (self.max_chunk_size_bytes as u64)
            .min(window_left)
            .min(end.saturating_sub(self.sent_offset));
        let start = (self.sent_offset - self.initial_offset) as usize;
        let payload = self.data.slice(start..start + len as usize);

        let next_offset = self.sent_offset + len;
        let chunk = Chunk::data(core.session_id, self.sent_offset, payload)
            .with_remaining_bytes(end - next_offset);

        core.send_chunk(sink, chunk)?;
        self.sent_offset = next_offset;
        core.stats.data_bytes += len;

        core.report_progress(TransferProgress {
            bytes_sent: self.sent_offset,
            bytes_confirmed_received: self.confirmed_offset,
            total_size_bytes: Some(end),
        });

        if self.sent_offset >= self.window_end_offset || self.sent_offset >= end {
            // 윈도우 소진: 다음 파라미터 대기
            core.state = TransferState::WaitingForTransferParameters;
            core.set_next_chunk_timeout();
        } else {
            core.set_timeout(Duration::from_micros(self.min_chunk_delay_us as u64));
        }
        Ok(())
    }
}
