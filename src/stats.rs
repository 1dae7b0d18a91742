//! 전송 통계

use std::time::{Duration, Instant};

/// 엔드포인트 전송 통계
///
/// 이벤트 루프가 갱신하고 외부에서는 `Arc<RwLock<_>>` 핸들로 관찰한다
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 송신 바이트 (페이로드 기준)
    pub bytes_sent: u64,

    /// 수신 바이트 (새로 수신한 페이로드 기준)
    pub bytes_received: u64,

    /// 송신 데이터그램 수
    pub datagrams_sent: u64,

    /// 수신 데이터그램 수
    pub datagrams_received: u64,

    /// 이미 받은 구간이라 버린 데이터그램 수
    pub duplicate_datagrams: u64,

    /// 수신한 ACK 힌트 수 (서버)
    pub acks_received: u64,

    /// 보낸 Announce 수 (서버)
    pub announces_sent: u64,

    /// 재요청 횟수 (클라이언트)
    pub resends: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_sent: 0,
            bytes_received: 0,
            datagrams_sent: 0,
            datagrams_received: 0,
            duplicate_datagrams: 0,
            acks_received: 0,
            announces_sent: 0,
            resends: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 평균 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / secs
    }

    /// 평균 수신 처리율 (bytes/sec)
    pub fn recv_throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / secs
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} B ({} dgram) | Received: {} B ({} dgram, {} dup) | ACKs: {} | Resends: {}",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.datagrams_sent,
            self.bytes_received,
            self.datagrams_received,
            self.duplicate_datagrams,
            self.acks_received,
            self.resends,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
