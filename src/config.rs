//! 프로토콜 설정

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_TTL};

/// MBT 전송 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 데이터 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 메타데이터 섹션 크기 (바이트)
    /// 청크와 마찬가지로 데이터그램 하나에 들어가야 함
    pub section_size: usize,

    /// Announce 주기 (밀리초)
    pub announce_interval_ms: u64,

    /// 재요청 타임아웃 (밀리초)
    /// 컨트롤 메시지 송신 후 이 시간 안에 응답이 없으면 같은 요청 재전송
    pub resend_timeout_ms: u64,

    /// 목표 송신 속도 (bytes/sec)
    /// 0이면 페이싱 없이 최대 속도로 전송
    pub send_rate: u64,

    /// 논리 채널 큐 깊이 (데이터그램 수)
    /// 가득 찬 큐에 도착한 데이터그램은 네트워크 손실과 동일하게 버려짐
    pub queue_depth: usize,

    /// 패킷 TTL
    pub ttl: u32,

    /// 루프백 수신 허용 (같은 호스트 테스트용)
    pub loopback: bool,

    /// 멀티캐스트 조인에 사용할 인터페이스 IPv4 주소
    /// None이면 시스템 기본 인터페이스
    pub interface: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            section_size: 1200,
            announce_interval_ms: 1000,   // 1초
            resend_timeout_ms: 500,       // 500ms
            send_rate: 12_500_000,        // 100 Mbit/s
            queue_depth: 1024,
            ttl: DEFAULT_TTL,
            loopback: false,
            interface: None,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 신뢰 가능한 LAN용 설정
    pub fn fast_lan() -> Self {
        Self {
            chunk_size: 1400,
            send_rate: 0,                 // 페이싱 없음
            resend_timeout_ms: 200,
            ttl: 1,
            ..Self::default()
        }
    }

    /// 손실 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            chunk_size: 1000,             // 작은 청크
            section_size: 900,
            send_rate: 2_500_000,         // 20 Mbit/s
            resend_timeout_ms: 800,
            ..Self::default()
        }
    }

    /// Announce 주기
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// 재요청 타임아웃
    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    /// 청크 송신 간격
    ///
    /// 목표 속도를 청크 단위 sleep으로 근사한다
    pub fn chunk_interval(&self) -> Duration {
        if self.send_rate == 0 {
            // 페이싱 없음. 이벤트 루프가 굶지 않을 만큼만 양보
            return Duration::from_micros(10);
        }
        let us = (self.chunk_size as u64).saturating_mul(1_000_000) / self.send_rate;
        Duration::from_micros(us.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_interval_matches_rate() {
        let config = Config {
            chunk_size: 1000,
            send_rate: 1_000_000,
            ..Config::default()
        };
        // 1MB/s에 1KB 청크면 1ms 간격
        assert_eq!(config.chunk_interval(), Duration::from_millis(1));
    }

    #[test]
    fn unpaced_interval_is_small_but_nonzero() {
        let config = Config {
            send_rate: 0,
            ..Config::default()
        };
        assert!(config.chunk_interval() > Duration::ZERO);
        assert!(config.chunk_interval() < Duration::from_millis(1));
    }
}
