//! 수신 클라이언트
//!
//! 상태 기계: ExpectAnnouncement → ExpectMetadataHeader →
//! ExpectMetadataSections → ExpectDataSections → Done
//!
//! 모든 수신/타이머 이벤트를 단일 이벤트 루프가 도착 순서대로 처리한다.
//! 유일한 패킷 간 기억은 NakRegions이며 ack이 멱등이라 순서 뒤섞임과
//! 중복을 그대로 견딘다.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::message::{self, AckRegion, Frame, MetadataHeader, Opcode, SectionIndex};
use crate::multicast::{ClientChannels, UdpMessage};
use crate::region::{NakRegions, Region};
use crate::stats::TransferStats;
use crate::tarball::{self, VirtualTarballWriter};
use crate::{Config, Error, HashId, Result};

/// 클라이언트 프로토콜 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    ExpectAnnouncement,
    ExpectMetadataHeader,
    ExpectMetadataSections,
    ExpectDataSections,
    Done,
}

/// 수신 클라이언트
pub struct Client {
    ctrl_rx: mpsc::Receiver<UdpMessage>,
    data_rx: mpsc::Receiver<UdpMessage>,
    ctrl_tx: mpsc::Sender<Bytes>,

    config: Config,
    output_dir: PathBuf,

    state: ClientState,

    /// 전송 식별자. 첫 announcement에서 고정되거나 운영자가 미리 지정
    hash_id: Option<HashId>,

    section_count: u16,
    sections: Vec<Bytes>,
    next_section: u16,

    writer: Option<VirtualTarballWriter>,

    /// 미수신 구간. 생성 시점부터 빈 상태로 존재한다
    nak: NakRegions,

    /// 마지막으로 관찰한 데이터 구간. 서버에 힌트로 돌려보낸다
    last_ack: Region,

    /// 요청 유실 복구용 재전송 데드라인. 컨트롤 송신 때마다 재장전
    resend_at: Option<Instant>,

    bytes_received: u64,
    last_report_bytes: u64,
    last_report_at: Instant,

    stats: Arc<RwLock<TransferStats>>,
}

impl Client {
    /// 새 클라이언트 생성
    ///
    /// `hash_id`를 주면 그 ID의 announcement만 받아들인다
    pub fn new(
        channels: ClientChannels,
        config: Config,
        output_dir: PathBuf,
        hash_id: Option<HashId>,
    ) -> Self {
        Self {
            ctrl_rx: channels.control_to_client,
            data_rx: channels.data,
            ctrl_tx: channels.control_to_server,
            config,
            output_dir,
            state: ClientState::ExpectAnnouncement,
            hash_id,
            section_count: 0,
            sections: Vec::new(),
            next_section: 0,
            writer: None,
            nak: NakRegions::new(0),
            last_ack: Region::new(0, 0),
            resend_at: None,
            bytes_received: 0,
            last_report_bytes: 0,
            last_report_at: Instant::now(),
            stats: Arc::new(RwLock::new(TransferStats::new())),
        }
    }

    /// 현재 상태
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// 통계 핸들
    pub fn stats(&self) -> Arc<RwLock<TransferStats>> {
        self.stats.clone()
    }

    /// 클라이언트 이벤트 루프. Done이 되면 반환한다
    pub async fn run(&mut self) -> Result<()> {
        info!("MBT client started, waiting for announcement...");
        let mut report = time::interval(Duration::from_secs(1));

        loop {
            if self.state == ClientState::Done {
                break;
            }

            let deadline = self.resend_at;
            tokio::select! {
                msg = self.ctrl_rx.recv() => match msg {
                    Some(m) => self.process_control(m).await?,
                    None => return Err(Error::ChannelClosed),
                },
                msg = self.data_rx.recv() => match msg {
                    Some(m) => self.process_data(m).await?,
                    None => return Err(Error::ChannelClosed),
                },
                _ = resend_wait(deadline) => {
                    // 요청이나 응답이 유실됐다고 보고 같은 요청을 다시 보낸다
                    self.stats.write().resends += 1;
                    self.ask().await?;
                },
                _ = report.tick() => self.report_progress(),
            }
        }

        Ok(())
    }

    async fn process_control(&mut self, msg: UdpMessage) -> Result<()> {
        let Some(frame) = Frame::parse(&msg.data) else {
            debug!("짧은 컨트롤 데이터그램 버림: {} bytes", msg.data.len());
            return Ok(());
        };

        match self.state {
            ClientState::ExpectAnnouncement => {
                if frame.opcode() != Some(Opcode::AnnounceTarball) {
                    return Ok(());
                }
                if let Some(want) = self.hash_id {
                    if want != frame.hash_id {
                        // 다른 전송의 공지
                        return Ok(());
                    }
                }
                self.hash_id = Some(frame.hash_id);
                info!("announcement: id={}", hex::encode(frame.hash_id));
                self.state = ClientState::ExpectMetadataHeader;
                self.ask().await?;
            }

            ClientState::ExpectMetadataHeader => {
                if Some(frame.hash_id) != self.hash_id {
                    return Ok(());
                }
                if frame.opcode() != Some(Opcode::RespondMetadataHeader) {
                    return Ok(());
                }
                let Some(header) = MetadataHeader::decode(frame.payload) else {
                    warn!("잘못된 메타데이터 헤더 버림");
                    return Ok(());
                };
                if header.section_count == 0 {
                    warn!("섹션 0개짜리 메타데이터 헤더 무시");
                    return Ok(());
                }
                info!("metadata header: {} sections", header.section_count);
                self.section_count = header.section_count;
                self.sections.clear();
                self.next_section = 0;
                self.state = ClientState::ExpectMetadataSections;
                self.ask().await?;
            }

            ClientState::ExpectMetadataSections => {
                if Some(frame.hash_id) != self.hash_id {
                    return Ok(());
                }
                if frame.opcode() != Some(Opcode::RespondMetadataSection) {
                    return Ok(());
                }
                let Some((index, data)) = message::decode_section(frame.payload) else {
                    warn!("잘못된 메타데이터 섹션 버림");
                    return Ok(());
                };
                if index == self.next_section {
                    self.sections.push(Bytes::copy_from_slice(data));
                    self.next_section += 1;
                    if self.next_section >= self.section_count {
                        return self.build_writer().await;
                    }
                }
                // 순서가 어긋났으면 필요한 섹션을 다시 요청
                self.ask().await?;
            }

            // 데이터 단계에서는 컨트롤 메시지에 관심 없음
            ClientState::ExpectDataSections | ClientState::Done => {}
        }

        Ok(())
    }

    /// 모든 메타데이터 섹션 수신 완료: 디코딩하고 쓰기 준비
    async fn build_writer(&mut self) -> Result<()> {
        let Some(hash_id) = self.hash_id else {
            return Ok(());
        };

        let mut md = Vec::new();
        for section in &self.sections {
            md.extend_from_slice(section);
        }
        info!("decoding metadata... ({} bytes)", md.len());
        let (declared_size, files) = tarball::decode_metadata(&md)?;

        let writer = VirtualTarballWriter::create(files, &hash_id, &self.output_dir)?;
        if writer.size() != declared_size {
            return Err(Error::SizeMismatch {
                expected: declared_size,
                got: writer.size(),
            });
        }

        for f in writer.files() {
            info!("  {:o} {:>12} {}", f.mode, f.size, f.path);
        }

        self.nak.clear(writer.size());
        self.last_ack = Region::new(0, 0);
        self.writer = Some(writer);

        if self.nak.is_all_acked() {
            // 빈 타볼: 받을 데이터가 없다
            return self.complete();
        }

        self.state = ClientState::ExpectDataSections;
        self.ask().await
    }

    async fn process_data(&mut self, msg: UdpMessage) -> Result<()> {
        if self.writer.is_none() {
            // 아직 메타데이터 전: 조용히 무시
            debug!("메타데이터 수신 전 데이터 무시");
            return Ok(());
        }

        let Some(frame) = Frame::parse(&msg.data) else {
            return Ok(());
        };
        if Some(frame.hash_id) != self.hash_id {
            return Ok(());
        }
        if frame.opcode() != Some(Opcode::DataSection) {
            return Ok(());
        }
        let Some((offset, data)) = message::decode_data_section(frame.payload) else {
            warn!("잘못된 데이터 섹션 버림");
            return Ok(());
        };

        self.stats.write().datagrams_received += 1;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.saturating_add(data.len() as u64);
        if end > self.nak.size() {
            warn!("범위 밖 데이터 섹션 무시: [{}, {})", offset, end);
            return Ok(());
        }

        self.last_ack = Region::new(offset, end);

        if self.nak.is_acked(offset, end) {
            // 이미 받은 구간
            self.stats.write().duplicate_datagrams += 1;
            if self.nak.is_all_acked() {
                return self.complete();
            }
            return self.ask().await;
        }

        self.nak.ack(offset, end)?;
        if let Some(w) = &self.writer {
            w.write_at(data, offset)?;
        }
        self.bytes_received += data.len() as u64;
        self.stats.write().bytes_received += data.len() as u64;

        if self.nak.is_all_acked() {
            return self.complete();
        }
        self.ask().await
    }

    /// 현재 상태에 맞는 요청 송신 + 재전송 타이머 재장전
    async fn ask(&mut self) -> Result<()> {
        let Some(hash_id) = self.hash_id else {
            return Ok(());
        };

        let frame = match self.state {
            ClientState::ExpectMetadataHeader => {
                message::encode_frame(&hash_id, Opcode::RequestMetadataHeader, &[])
            }
            ClientState::ExpectMetadataSections => message::encode_frame(
                &hash_id,
                Opcode::RequestMetadataSection,
                &SectionIndex {
                    index: self.next_section,
                }
                .encode(),
            ),
            ClientState::ExpectDataSections => message::encode_frame(
                &hash_id,
                Opcode::AckDataSection,
                &AckRegion {
                    start: self.last_ack.start,
                    end_ex: self.last_ack.end_ex,
                }
                .encode(),
            ),
            ClientState::ExpectAnnouncement | ClientState::Done => return Ok(()),
        };

        self.ctrl_tx
            .send(frame.into())
            .await
            .map_err(|_| Error::ChannelClosed)?;
        self.resend_at = Some(Instant::now() + self.config.resend_timeout());
        Ok(())
    }

    /// 전송 완료: 쓰기 검증 + rename, Done 전이
    fn complete(&mut self) -> Result<()> {
        if let Some(w) = self.writer.take() {
            w.close()?;
        }
        self.state = ClientState::Done;
        self.resend_at = None;
        info!("transfer complete: {}", self.stats.read().summary());
        Ok(())
    }

    /// 1초 주기 수신 속도 보고
    fn report_progress(&mut self) {
        if self.state != ClientState::ExpectDataSections {
            return;
        }
        let now = Instant::now();
        let secs = now.duration_since(self.last_report_at).as_secs_f64();
        if secs > 0.0 {
            let delta = self.bytes_received - self.last_report_bytes;
            let size = self.nak.size();
            let pct = if size > 0 {
                (size - self.nak.outstanding_bytes()) as f64 * 100.0 / size as f64
            } else {
                100.0
            };
            info!("{:>12.0} B/s  {:5.1}% complete", delta as f64 / secs, pct);
        }
        self.last_report_bytes = self.bytes_received;
        self.last_report_at = now;
    }
}

/// 재전송 데드라인 대기. 타이머가 꺼져 있으면 영원히 대기
async fn resend_wait(deadline: Option<Instant>) {
    match deadline {
        Some(t) => time::sleep_until(t).await,
        None => std::future::pending::<()>().await,
    }
}
