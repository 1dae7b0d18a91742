//! 멀티캐스트 전송 계층
//!
//! 엔드포인트당 UDP 소켓 2개:
//! - 컨트롤 소켓: 그룹:포트. 서버/클라이언트 모두 송수신
//! - 데이터 소켓: 그룹:포트+1. 서버 → 클라이언트 전용
//!
//! 상위 계층에는 논리 채널 3개(ControlToServer, ControlToClient, Data)를
//! 바운디드 mpsc 큐로 노출한다. 가득 찬 큐에 도착한 데이터그램은 버려지며
//! 이는 네트워크 손실과 동일하게 취급된다 (재요청 로직이 복구).

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Config, Error, Result};

/// 수신 데이터그램 최대 크기
const MAX_DATAGRAM: usize = 65536;

/// 수신 데이터그램 하나
#[derive(Debug, Clone)]
pub struct UdpMessage {
    pub data: Bytes,
    pub from: SocketAddr,
}

/// 클라이언트측 논리 채널 묶음
pub struct ClientChannels {
    /// 서버가 멀티캐스트한 컨트롤 메시지 수신
    pub control_to_client: mpsc::Receiver<UdpMessage>,

    /// 데이터 청크 수신
    pub data: mpsc::Receiver<UdpMessage>,

    /// 서버로 보낼 요청 송신
    pub control_to_server: mpsc::Sender<Bytes>,
}

/// 서버측 논리 채널 묶음
pub struct ServerChannels {
    /// 클라이언트 요청 수신
    pub control_to_server: mpsc::Receiver<UdpMessage>,

    /// 클라이언트들로 멀티캐스트할 컨트롤 메시지 송신
    pub control_to_client: mpsc::Sender<Bytes>,

    /// 데이터 청크 송신
    pub data: mpsc::Sender<Bytes>,
}

/// 멀티캐스트 소켓 쌍
pub struct Multicast {
    control: Arc<UdpSocket>,
    data: Arc<UdpSocket>,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
}

impl Multicast {
    /// 그룹에 조인한 컨트롤/데이터 소켓 생성
    ///
    /// 데이터 포트는 관례상 컨트롤 포트 + 1
    pub fn new(group: SocketAddr, config: &Config) -> Result<Self> {
        let group_ip = match group.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "IPv4 멀티캐스트 그룹만 지원",
                )))
            }
        };
        if !group_ip.is_multicast() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "멀티캐스트 주소가 아님",
            )));
        }

        let control = bind_group_socket(group_ip, group.port(), config)?;
        let data = bind_group_socket(group_ip, group.port() + 1, config)?;

        Ok(Self {
            control: Arc::new(control),
            data: Arc::new(data),
            control_addr: SocketAddr::new(IpAddr::V4(group_ip), group.port()),
            data_addr: SocketAddr::new(IpAddr::V4(group_ip), group.port() + 1),
        })
    }

    /// 클라이언트용 채널 생성. 소켓 펌프 태스크들을 띄운다
    pub fn client_channels(&self, config: &Config) -> ClientChannels {
        let (ctrl_in_tx, ctrl_in_rx) = mpsc::channel(config.queue_depth);
        let (data_in_tx, data_in_rx) = mpsc::channel(config.queue_depth);
        let (ctrl_out_tx, ctrl_out_rx) = mpsc::channel::<Bytes>(config.queue_depth);

        spawn_recv(self.control.clone(), ctrl_in_tx);
        spawn_recv(self.data.clone(), data_in_tx);
        spawn_send(self.control.clone(), self.control_addr, ctrl_out_rx);

        ClientChannels {
            control_to_client: ctrl_in_rx,
            data: data_in_rx,
            control_to_server: ctrl_out_tx,
        }
    }

    /// 서버용 채널 생성. 소켓 펌프 태스크들을 띄운다
    pub fn server_channels(&self, config: &Config) -> ServerChannels {
        let (ctrl_in_tx, ctrl_in_rx) = mpsc::channel(config.queue_depth);
        let (ctrl_out_tx, ctrl_out_rx) = mpsc::channel::<Bytes>(config.queue_depth);
        let (data_out_tx, data_out_rx) = mpsc::channel::<Bytes>(config.queue_depth);

        spawn_recv(self.control.clone(), ctrl_in_tx);
        spawn_send(self.control.clone(), self.control_addr, ctrl_out_rx);
        spawn_send(self.data.clone(), self.data_addr, data_out_rx);

        ServerChannels {
            control_to_server: ctrl_in_rx,
            control_to_client: ctrl_out_tx,
            data: data_out_tx,
        }
    }
}

fn bind_group_socket(group_ip: Ipv4Addr, port: u16, config: &Config) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    // 같은 호스트에서 여러 수신자가 한 포트를 공유할 수 있게
    socket.set_reuse_address(true)?;
    socket.set_send_buffer_size(4 * 1024 * 1024)?;
    socket.set_recv_buffer_size(4 * 1024 * 1024)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let socket: std::net::UdpSocket = socket.into();
    let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&group_ip, &interface)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(config.loopback)?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket)?)
}

/// 소켓 → 큐 펌프
///
/// 큐가 가득 차면 데이터그램을 버린다 (네트워크 손실과 동일).
/// 수신 에러는 치명적: 태스크가 끝나고 큐가 닫혀 이벤트 루프에 전파된다
fn spawn_recv(socket: Arc<UdpSocket>, tx: mpsc::Sender<UdpMessage>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let msg = UdpMessage {
                        data: Bytes::copy_from_slice(&buf[..len]),
                        from,
                    };
                    match tx.try_send(msg) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("수신 큐 가득 참, 데이터그램 버림");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => {
                    warn!("소켓 수신 에러: {}", e);
                    break;
                }
            }
        }
    });
}

/// 큐 → 소켓 펌프
fn spawn_send(socket: Arc<UdpSocket>, target: SocketAddr, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if let Err(e) = socket.send_to(&buf, target).await {
                warn!("소켓 송신 에러: {}", e);
                break;
            }
        }
    });
}
