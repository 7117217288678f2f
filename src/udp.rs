//! UDP 트랜스포트
//!
//! 방향마다 서버에 connect된 UDP 소켓 하나를 쓴다.
//! 데이터그램 형식: `[direction tag u8][crc32 u32 LE][chunk bytes]`
//!
//! - CRC가 맞지 않는 데이터그램은 버림
//! - 소켓 수신 에러는 `FAILED_PRECONDITION` 스트림 종료로 알림 (재연결 대상)

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::error::TransportError;
use crate::status::Status;
use crate::transport::{Direction, StreamEvents, Transport};

/// 최대 데이터그램 크기
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// 데이터그램 헤더 크기 (tag + crc32)
pub const DATAGRAM_HEADER_SIZE: usize = 5;

/// 청크를 데이터그램으로 인코딩
pub fn encode_datagram(direction: Direction, chunk: &Chunk) -> Result<Vec<u8>, TransportError> {
    let bytes = chunk.to_bytes().map_err(|e| TransportError::Rejected {
        status: Status::Internal,
        reason: e.to_string(),
    })?;

    if bytes.len() + DATAGRAM_HEADER_SIZE > MAX_DATAGRAM_SIZE {
        return Err(TransportError::Rejected {
            status: Status::ResourceExhausted,
            reason: format!("청크 {} bytes가 데이터그램 한도를 넘음", bytes.len()),
        });
    }

    let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_SIZE + bytes.len());
    datagram.push(direction.tag());
    datagram.extend_from_slice(&crc32fast::hash(&bytes).to_le_bytes());
    datagram.extend_from_slice(&bytes);
    Ok(datagram)
}

/// 데이터그램 디코딩. 형식이나 CRC가 틀리면 `None`
pub fn decode_datagram(datagram: &[u8]) -> Option<(Direction, &[u8])> {
    if datagram.len() < DATAGRAM_HEADER_SIZE {
        return None;
    }

    let direction = Direction::from_tag(datagram[0])?;
    let crc = u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    let payload = &datagram[DATAGRAM_HEADER_SIZE..];

    if crc32fast::hash(payload) != crc {
        return None;
    }
    Some((direction, payload))
}

/// 열린 스트림 하나
///
/// 송신은 논블로킹 std 소켓으로 바로 시스템 콜을 하고,
/// 수신 태스크는 같은 소켓의 tokio 핸들을 쓴다.
struct UdpStream {
    sender: StdUdpSocket,
    recv_task: JoinHandle<()>,
}

/// UDP 트랜스포트
pub struct UdpTransport {
    server_addr: SocketAddr,
    streams: [Option<UdpStream>; 2],
}

impl UdpTransport {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            streams: [None, None],
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn bind(&self) -> std::io::Result<StdUdpSocket> {
        let bind_addr: SocketAddr = if self.server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = StdUdpSocket::bind(bind_addr)?;
        socket.connect(self.server_addr)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl Transport for UdpTransport {
    fn open_stream(
        &mut self,
        direction: Direction,
        events: StreamEvents,
    ) -> Result<(), TransportError> {
        self.reset_stream(direction);

        let sender = self.bind().map_err(TransportError::io)?;
        let receiver = sender
            .try_clone()
            .and_then(UdpSocket::from_std)
            .map_err(TransportError::io)?;
        if let Ok(local_addr) = sender.local_addr() {
            info!("{} 스트림: {} -> {}", direction, local_addr, self.server_addr);
        }

        let recv_task = tokio::spawn(receive_loop(receiver, events));
        self.streams[direction.index()] = Some(UdpStream { sender, recv_task });
        Ok(())
    }

    fn send(&mut self, direction: Direction, chunk: &Chunk) -> Result<(), TransportError> {
        let stream = self.streams[direction.index()]
            .as_ref()
            .ok_or(TransportError::StreamNotOpen)?;
        let datagram = encode_datagram(direction, chunk)?;

        match stream.sender.send(&datagram) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(TransportError::Rejected {
                status: Status::ResourceExhausted,
                reason: "소켓 송신 버퍼 가득 참".into(),
            }),
            Err(e) => Err(TransportError::io(e)),
        }
    }

    fn reset_stream(&mut self, direction: Direction) {
        if let Some(stream) = self.streams[direction.index()].take() {
            stream.recv_task.abort();
            debug!("{} 스트림 소켓 닫음", direction);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for stream in self.streams.iter_mut().filter_map(Option::take) {
            stream.recv_task.abort();
        }
    }
}

/// 스트림 수신 태스크
async fn receive_loop(socket: UdpSocket, events: StreamEvents) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => match decode_datagram(&buf[..len]) {
                Some((direction, payload)) if direction == events.direction() => {
                    if !events.on_bytes(payload) {
                        break;
                    }
                }
                Some((direction, _)) => {
                    debug!("{} 스트림: {} 방향 데이터그램 무시", events.direction(), direction);
                }
                None => {
                    warn!("{} 스트림: 잘못된 데이터그램 ({} bytes) 폐기", events.direction(), len);
                }
            },
            Err(e) => {
                warn!("{} 스트림 수신 에러: {}", events.direction(), e);
                events.on_stream_closed(Status::FailedPrecondition);
                break;
            }
        }
    }
}
