//! MBT CLI - Multicast Bundle Transfer
//!
//! UDP 멀티캐스트로 파일 묶음을 1:N 전송하는 도구
//! - serve: 파일 목록을 가상 타볼로 묶어 그룹에 공지 + 스트리밍
//! - download: 공지를 듣고 타볼을 현재 디렉토리에 재조립
//!
//! 사용법:
//!   mbt [전역 옵션] <명령> [인자...]
//!
//! 예시:
//!   # 디렉토리 하나를 재귀적으로 서빙
//!   mbt serve ./dataset:::dataset
//!
//!   # 같은 그룹에서 다운로드 (루프백 테스트는 -l)
//!   mbt -l download

use std::net::{Ipv4Addr, SocketAddr};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mbt::fileset;
use mbt::{
    Client, Config, Error, HashId, Multicast, Server, VirtualTarballReader, DEFAULT_GROUP,
    HASH_SIZE,
};

struct CliOptions {
    group: SocketAddr,
    config: Config,
    command: Option<String>,
    args: Vec<String>,
}

fn parse_args() -> CliOptions {
    let argv: Vec<String> = std::env::args().collect();
    let mut opts = CliOptions {
        group: DEFAULT_GROUP.parse().expect("기본 그룹 주소"),
        config: Config::default(),
        command: None,
        args: Vec::new(),
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--group" | "-g" => {
                if i + 1 < argv.len() {
                    opts.group = argv[i + 1].parse().expect("유효한 그룹 주소 필요 (host:port)");
                    i += 1;
                }
            }
            "--interface" | "-i" => {
                if i + 1 < argv.len() {
                    let addr: Ipv4Addr = argv[i + 1].parse().expect("유효한 인터페이스 IPv4 주소 필요");
                    opts.config.interface = Some(addr);
                    i += 1;
                }
            }
            "--ttl" | "-t" => {
                if i + 1 < argv.len() {
                    opts.config.ttl = argv[i + 1].parse().expect("유효한 TTL 필요");
                    i += 1;
                }
            }
            "--loopback" | "-l" => {
                opts.config.loopback = true;
            }
            "--rate" => {
                if i + 1 < argv.len() {
                    opts.config.send_rate = argv[i + 1].parse().expect("유효한 속도(bytes/sec) 필요");
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < argv.len() {
                    opts.config.chunk_size = argv[i + 1].parse().expect("유효한 청크 크기 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                if opts.command.is_none() {
                    opts.command = Some(other.to_string());
                } else {
                    opts.args.push(other.to_string());
                }
            }
        }
        i += 1;
    }

    opts
}

fn print_help() {
    println!(
        r#"MBT - Multicast Bundle Transfer

UDP 멀티캐스트 기반 1:N 파일 전송 도구
- 수신자는 미수신 바이트 구간만 추적하고 서버에 ACK 힌트를 보냄
- 전송 단위는 메타데이터 SHA-256으로 식별 (컨텐츠 ID)

사용법:
  mbt [전역 옵션] <명령> [인자...]

명령:
  serve <spec...>      파일들을 멀티캐스트 그룹에 서빙 (별칭: s)
  download [id]        공지를 듣고 현재 디렉토리로 다운로드 (별칭: d)
                       [id]를 주면 해당 전송만 받음 (64자리 hex)
  id <spec...>         파일 목록의 컨텐츠 ID 출력
  ls <spec...>         파일 목록과 컨텐츠 ID 출력

파일 스펙:
  path                 파일 하나
  path::alias          파일 이름 바꿔서 추가
  dir::subdir          디렉토리 바로 아래 파일들만 subdir/ 밑으로
  dir:::subdir         디렉토리 전체를 재귀적으로 subdir/ 밑으로

전역 옵션:
  -g, --group <ADDR>   멀티캐스트 그룹 (기본: 236.0.0.100:1360)
                       데이터 채널은 포트+1 사용
  -i, --interface <IP> 조인할 인터페이스의 IPv4 주소
  -t, --ttl <N>        패킷 TTL (기본: 8)
  -l, --loopback       루프백 수신 허용 (같은 호스트 테스트용)
  --rate <BPS>         송신 속도 bytes/sec, 0 = 무제한 (기본: 12500000)
  --chunk-size <SIZE>  데이터 청크 크기 (기본: 1400)
  -h, --help           이 도움말 출력

예시:
  # 파일 두 개와 디렉토리 하나 서빙
  mbt serve notes.txt data.bin::payload.bin ./photos:::photos

  # 특정 전송만 다운로드
  mbt download 9f2a...64자리hex
"#
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let opts = parse_args();
    let Some(command) = opts.command.clone() else {
        print_help();
        std::process::exit(1);
    };

    match command.as_str() {
        "serve" | "s" => serve(opts).await,
        "download" | "d" => download(opts).await,
        "id" => id_command(opts),
        "ls" => ls_command(opts),
        other => {
            eprintln!("알 수 없는 명령: {}", other);
            print_help();
            std::process::exit(1);
        }
    }
}

async fn serve(opts: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let files = fileset::collect_files(&opts.args)?;
    let reader = VirtualTarballReader::open(files)?;
    println!("{}", hex::encode(reader.hash_id()));

    let multicast = Multicast::new(opts.group, &opts.config)?;
    let channels = multicast.server_channels(&opts.config);
    let mut server = Server::new(channels, reader, opts.config.clone())?;
    let stats = server.stats();

    tokio::select! {
        r = server.run() => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("인터럽트");
            println!("{}", stats.read().summary());
        }
    }
    Ok(())
}

async fn download(opts: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let hash_id = match opts.args.first() {
        Some(s) => Some(parse_hash_id(s)?),
        None => None,
    };

    let multicast = Multicast::new(opts.group, &opts.config)?;
    let channels = multicast.client_channels(&opts.config);
    let output_dir = std::env::current_dir()?;
    let mut client = Client::new(channels, opts.config.clone(), output_dir, hash_id);
    client.run().await?;

    println!("{}", client.stats().read().summary());
    Ok(())
}

fn id_command(opts: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let files = fileset::collect_files(&opts.args)?;
    let reader = VirtualTarballReader::open(files)?;
    println!("{}", hex::encode(reader.hash_id()));
    Ok(())
}

fn ls_command(opts: CliOptions) -> Result<(), Box<dyn std::error::Error>> {
    let files = fileset::collect_files(&opts.args)?;
    let reader = VirtualTarballReader::open(files)?;
    println!("Files:");
    for f in reader.files() {
        println!("  {:o} {:>15} '{}'", f.mode, f.size, f.path);
    }
    println!("{}", hex::encode(reader.hash_id()));
    Ok(())
}

fn parse_hash_id(s: &str) -> Result<HashId, Error> {
    let bytes = hex::decode(s).map_err(|_| Error::InvalidHashId(s.to_string()))?;
    if bytes.len() != HASH_SIZE {
        return Err(Error::InvalidHashId(s.to_string()));
    }
    let mut id = [0u8; HASH_SIZE];
    id.copy_from_slice(&bytes);
    Ok(id)
}
