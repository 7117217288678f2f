//! CTP 클라이언트 - Chunk Transfer Protocol
//!
//! UDP 서버의 리소스를 읽거나 리소스에 파일을 쓴다.
//!
//! 사용법:
//!   cargo run --release --bin ctp-client -- <read|write> <RESOURCE> [OPTIONS]
//!
//! 예시:
//!   # 리소스 3을 읽어서 파일로 저장
//!   cargo run --release --bin ctp-client -- read 3 --server 127.0.0.1:9000 --output data.bin
//!
//!   # 파일을 리소스 7에 쓰기 (불안정한 링크 설정)
//!   cargo run --release --bin ctp-client -- write 7 -s 127.0.0.1:9000 -f data.bin --preset unstable

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ctp::{
    ClientConfig, ProtocolVersion, ReadOptions, TransferClient, TransferProgress, UdpTransport,
    WriteOptions,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// 실행할 작업
enum Command {
    Read { output_path: Option<PathBuf> },
    Write { input_path: PathBuf },
}

/// CLI 설정
struct CliConfig {
    command: Command,
    resource_id: u32,
    server_addr: SocketAddr,
    initial_offset: u64,
    config: ClientConfig,
}

const USAGE: &str = r#"CTP Client - Chunk Transfer Protocol 클라이언트

윈도우 흐름 제어 기반 대용량 전송 클라이언트
- 수신측이 윈도우/청크 크기를 정하고 송신측이 따름
- 타임아웃 재시도, 연결 끊김 복구

사용법:
  ctp-client read <RESOURCE> [OPTIONS]
  ctp-client write <RESOURCE> -f <PATH> [OPTIONS]

옵션:
  -s, --server <ADDR>         서버 주소 (기본: 127.0.0.1:9000)
  -o, --output <PATH>         읽은 데이터 저장 경로 (read)
  -f, --file <PATH>           보낼 파일 경로 (write)
  --offset <BYTES>            시작 오프셋 (기본: 0)
  --preset <NAME>             default | low-latency | unstable
  --protocol <VERSION>        legacy | versioned
  --timeout-ms <MS>           응답 대기 시간
  --initial-timeout-ms <MS>   첫 응답 대기 시간
  --retries <N>               최대 재시도 횟수
  --window <BYTES>            읽기 윈도우 크기
  --chunk-size <BYTES>        읽기 청크 크기
  --min-delay-us <US>         청크 간 최소 간격 (읽기)
  -h, --help                  이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#;

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> CliResult<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값이 필요함", flag).into())
}

fn parse_args() -> CliResult<CliConfig> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        std::process::exit(0);
    }

    let resource_id: u32 = args[2].parse().map_err(|_| format!("잘못된 리소스 ID: {}", args[2]))?;

    let mut server_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 9000));
    let mut output_path = None;
    let mut input_path = None;
    let mut initial_offset = 0;
    let mut config = ClientConfig::default();
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut i = 3;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--server" | "-s" => server_addr = next_value(&args, &mut i, flag)?.parse()?,
            "--output" | "-o" => {
                output_path = Some(PathBuf::from(next_value(&args, &mut i, flag)?))
            }
            "--file" | "-f" => input_path = Some(PathBuf::from(next_value(&args, &mut i, flag)?)),
            "--offset" => initial_offset = next_value(&args, &mut i, flag)?.parse()?,
            "--preset" => {
                config = match next_value(&args, &mut i, flag)? {
                    "default" => ClientConfig::default(),
                    "low-latency" => ClientConfig::low_latency(),
                    "unstable" => ClientConfig::unstable_link(),
                    other => return Err(format!("알 수 없는 프리셋: {}", other).into()),
                };
            }
            "--protocol" | "--timeout-ms" | "--initial-timeout-ms" | "--retries" | "--window"
            | "--chunk-size" | "--min-delay-us" => {
                // 프리셋 위에 덮어쓰도록 나중에 적용
                let value = next_value(&args, &mut i, flag)?.to_string();
                overrides.push((flag.to_string(), value));
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    for (flag, value) in overrides {
        match flag.as_str() {
            "--protocol" => {
                config.protocol_version = match value.as_str() {
                    "legacy" => ProtocolVersion::Legacy,
                    "versioned" => ProtocolVersion::Versioned,
                    other => return Err(format!("알 수 없는 프로토콜: {}", other).into()),
                };
            }
            "--timeout-ms" => config.timeouts.timeout = Duration::from_millis(value.parse()?),
            "--initial-timeout-ms" => {
                config.timeouts.initial_timeout = Duration::from_millis(value.parse()?)
            }
            "--retries" => config.timeouts.max_retries = value.parse()?,
            "--window" => config.read_parameters.max_pending_bytes = value.parse()?,
            "--chunk-size" => config.read_parameters.max_chunk_size_bytes = value.parse()?,
            "--min-delay-us" => config.read_parameters.min_delay_microseconds = value.parse()?,
            _ => {}
        }
    }
    config.validate()?;

    let command = match args[1].as_str() {
        "read" => Command::Read { output_path },
        "write" => Command::Write {
            input_path: input_path.ok_or("write에는 --file이 필요함")?,
        },
        other => return Err(format!("알 수 없는 명령: {}", other).into()),
    };

    Ok(CliConfig {
        command,
        resource_id,
        server_addr,
        initial_offset,
        config,
    })
}

/// 10% 단위로 진행률을 로그로 남기는 콜백
fn progress_logger(label: &'static str) -> Box<dyn FnMut(TransferProgress) + Send> {
    let mut last_step = None;
    Box::new(move |progress: TransferProgress| {
        let Some(ratio) = progress.percent_received() else {
            return;
        };
        let step = (ratio * 10.0) as u32;
        if last_step != Some(step) {
            last_step = Some(step);
            info!(
                "{} 진행: {:.0}% ({} bytes 송신, {} bytes 확인)",
                label,
                ratio * 100.0,
                progress.bytes_sent,
                progress.bytes_confirmed_received
            );
        }
    })
}

#[tokio::main]
async fn main() -> CliResult<()> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = parse_args()?;

    info!("CTP Client starting...");
    info!("Server address: {}", cli.server_addr);
    info!("Resource: {}", cli.resource_id);
    info!("Protocol: {:?}", cli.config.protocol_version);

    let transport = UdpTransport::new(cli.server_addr);
    let client = TransferClient::new(transport, cli.config)?;
    let start = Instant::now();

    let bytes = match cli.command {
        Command::Read { output_path } => {
            let options = ReadOptions {
                progress: Some(progress_logger("읽기")),
                initial_offset: cli.initial_offset,
                ..ReadOptions::default()
            };
            let data = client.start_read(cli.resource_id, options).await?;

            if let Some(path) = &output_path {
                std::fs::write(path, &data)?;
                info!("Data saved to {:?}", path);
            }
            data.len()
        }
        Command::Write { input_path } => {
            let data = std::fs::read(&input_path)?;
            let len = data.len();
            info!("Sending {:?} ({} bytes)", input_path, len);

            let options = WriteOptions {
                progress: Some(progress_logger("쓰기")),
                initial_offset: cli.initial_offset,
            };
            client.start_write(cli.resource_id, data, options).await?;
            len
        }
    };

    client.close().await;

    let elapsed = start.elapsed();
    info!("Transfer complete!");
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    info!("  Total bytes: {}", bytes);
    if elapsed.as_secs_f64() > 0.0 {
        info!(
            "  Throughput: {:.2} MB/s",
            bytes as f64 / elapsed.as_secs_f64() / 1_000_000.0
        );
    }

    Ok(())
}
