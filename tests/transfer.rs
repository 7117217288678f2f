//! 클라이언트 엔진 통합 테스트 (메모리 내 상대측 사용)

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use ctp::{
    ChunkType, Direction, ProtocolVersion, ReadOptions, Status, TransferClient, TransferProgress,
    WriteOptions,
};
use support::{chunks_of, pattern, test_config, LoopbackPeer, PeerConfig};

fn client(peer: &LoopbackPeer) -> TransferClient {
    let config = test_config(Duration::from_millis(100), Duration::from_millis(200), 3);
    TransferClient::new(peer.clone(), config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_write_then_read_round_trip() {
    let peer = LoopbackPeer::new(PeerConfig::default());
    let client = client(&peer);

    for (resource_id, len) in [(1u32, 0usize), (2, 1), (3, 255), (4, 256), (5, 3 * 256 + 7)] {
        let data = pattern(len);
        client.write(resource_id, data.clone()).await.unwrap();
        assert_eq!(peer.resource(resource_id).unwrap(), data, "write len {}", len);

        let read = client.read(resource_id).await.unwrap();
        assert_eq!(read, Bytes::from(data), "read len {}", len);
    }

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_large_write_extends_window() {
    let peer = LoopbackPeer::new(PeerConfig {
        window: 1024,
        chunk_size: 256,
        ..PeerConfig::default()
    });
    let client = client(&peer);

    let data = pattern(10_000);
    client.write(10, data.clone()).await.unwrap();

    assert_eq!(peer.resource(10).unwrap(), data);
    assert!(peer.continues_sent() >= 9, "continues: {}", peer.continues_sent());

    let received = peer.received();
    let data_chunks = chunks_of(&received, Direction::Write, ChunkType::Data);
    assert!(data_chunks.iter().all(|c| c.data.len() <= 256));
    assert!(data_chunks.last().unwrap().is_last_data());

    // 상대측이 OK로 끝냈으므로 클라이언트는 완료 청크를 보내지 않음
    assert!(received.iter().all(|(_, c)| !c.is_final()));
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_read_recovers_from_dropped_start() {
    let peer = LoopbackPeer::new(PeerConfig {
        ignore_starts: 1,
        ..PeerConfig::default()
    });
    peer.insert_resource(20, pattern(700));

    let config = test_config(Duration::from_millis(100), Duration::from_millis(100), 2);
    let client = TransferClient::new(peer.clone(), config).unwrap();

    let data = client.read(20).await.unwrap();
    assert_eq!(data, Bytes::from(pattern(700)));

    let received = peer.received();
    assert_eq!(chunks_of(&received, Direction::Read, ChunkType::Start).len(), 1);
    assert_eq!(
        chunks_of(&received, Direction::Read, ChunkType::ParametersRetransmit).len(),
        1
    );
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_versioned_retry_resends_start() {
    let peer = LoopbackPeer::new(PeerConfig {
        ignore_starts: 1,
        ..PeerConfig::default()
    });
    let config = test_config(Duration::from_millis(100), Duration::from_millis(100), 2);
    let client = TransferClient::new(peer.clone(), config).unwrap();
    client.set_protocol_version(ProtocolVersion::Versioned);

    // 버전 프로토콜에서는 재시도도 START이므로 상대측이 리소스를 모름
    let error = client.read(404).await.unwrap_err();
    assert_eq!(error.status, Status::NotFound);
    assert_eq!(chunks_of(&peer.received(), Direction::Read, ChunkType::Start).len(), 2);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_write_after_first_data() {
    let peer = LoopbackPeer::new(PeerConfig {
        min_delay_us: 1_000_000,
        ..PeerConfig::default()
    });
    let mut observed = peer.observe();
    let client = client(&peer);

    let handle = client.start_write(30, pattern(4096), WriteOptions::default());
    loop {
        let (_, chunk) = observed.recv().await.unwrap();
        if chunk.chunk_type() == Some(ChunkType::Data) {
            break;
        }
    }
    handle.cancel();

    let error = handle.await.unwrap_err();
    assert_eq!(error.status, Status::Cancelled);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let received = peer.received();
    assert_eq!(chunks_of(&received, Direction::Write, ChunkType::Data).len(), 1);
    let completions = chunks_of(&received, Direction::Write, ChunkType::Completion);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].header.status, Some(Status::Cancelled.code()));
    assert_eq!(received.last().unwrap().1.chunk_type(), Some(ChunkType::Completion));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_transfer_on_same_resource() {
    let peer = LoopbackPeer::new(PeerConfig::default());
    peer.insert_resource(40, pattern(3000));
    let client = client(&peer);

    let first = client.start_read(40, ReadOptions::default());
    let second = client.start_write(40, pattern(10), WriteOptions::default());

    assert_eq!(second.await.unwrap_err().status, Status::AlreadyExists);
    assert_eq!(first.await.unwrap(), Bytes::from(pattern(3000)));

    // 첫 전송이 끝나면 같은 리소스를 다시 쓸 수 있음
    client.write(40, pattern(10)).await.unwrap();
    assert_eq!(peer.resource(40).unwrap(), pattern(10));
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_survives_stream_disconnection() {
    let peer = LoopbackPeer::new(PeerConfig {
        disconnect_starts: 2,
        ..PeerConfig::default()
    });
    let client = client(&peer);

    client.write(50, pattern(2000)).await.unwrap();
    assert_eq!(peer.resource(50).unwrap(), pattern(2000));

    let starts = chunks_of(&peer.received(), Direction::Write, ChunkType::Start);
    assert_eq!(starts.len(), 3);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnection_retries_are_bounded() {
    let peer = LoopbackPeer::new(PeerConfig {
        disconnect_starts: 10,
        ..PeerConfig::default()
    });
    let client = client(&peer);

    let error = client.write(60, pattern(10)).await.unwrap_err();
    assert_eq!(error.status, Status::Internal);
    // 최초 START + 재시작 3회
    assert_eq!(chunks_of(&peer.received(), Direction::Write, ChunkType::Start).len(), 4);
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_versioned_sessions() {
    let peer = LoopbackPeer::new(PeerConfig::default());
    let client = client(&peer);
    client.set_protocol_version(ProtocolVersion::Versioned);

    client.write(70, pattern(600)).await.unwrap();
    assert_eq!(client.read(70).await.unwrap(), Bytes::from(pattern(600)));

    let received = peer.received();
    let starts: Vec<_> = received
        .iter()
        .filter(|(_, c)| c.chunk_type() == Some(ChunkType::Start))
        .collect();
    assert_eq!(starts.len(), 2);
    for (_, start) in starts {
        assert_eq!(start.header.resource_id, Some(70));
    }
    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_reported() {
    let peer = LoopbackPeer::new(PeerConfig::default());
    peer.insert_resource(80, pattern(1500));
    let client = client(&peer);

    let write_reports = Arc::new(Mutex::new(Vec::new()));
    let sink = write_reports.clone();
    let options = WriteOptions {
        progress: Some(Box::new(move |p: TransferProgress| sink.lock().push(p))),
        ..WriteOptions::default()
    };
    client.start_write(81, pattern(1000), options).await.unwrap();

    let reports = write_reports.lock();
    let last = reports.last().unwrap();
    assert_eq!(last.bytes_sent, 1000);
    assert_eq!(last.total_size_bytes, Some(1000));
    assert!(reports.windows(2).all(|w| w[0].bytes_sent <= w[1].bytes_sent));
    drop(reports);

    let read_reports = Arc::new(Mutex::new(Vec::new()));
    let sink = read_reports.clone();
    let options = ReadOptions {
        progress: Some(Box::new(move |p: TransferProgress| sink.lock().push(p))),
        ..ReadOptions::default()
    };
    client.start_read(80, options).await.unwrap();
    assert_eq!(read_reports.lock().last().unwrap().bytes_confirmed_received, 1500);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_aborts_pending_transfers() {
    let peer = LoopbackPeer::new(PeerConfig {
        ignore_starts: 1,
        ..PeerConfig::default()
    });
    let client = client(&peer);

    let handle = client.start_write(90, pattern(100), WriteOptions::default());
    tokio::task::yield_now().await;
    client.close().await;

    assert_eq!(handle.await.unwrap_err().status, Status::Aborted);
    let completions = chunks_of(&peer.received(), Direction::Write, ChunkType::Completion);
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].header.status, Some(Status::Aborted.code()));
}
