//! 송신 서버
//!
//! 클라이언트별 상태 없음. 동작 세 가지를 한 이벤트 루프에서 처리한다:
//! - Announce: 주기적으로 타볼 공지
//! - 응답: 메타데이터 헤더/섹션 요청에 응답, ACK 힌트 기록
//! - 데이터 펌프: 미수신 구간을 라운드로빈으로 돌며 청크 송신

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{
    self, AckRegion, Frame, MetadataHeader, Opcode, SectionIndex,
};
use crate::multicast::{ServerChannels, UdpMessage};
use crate::region::{NakRegions, Region};
use crate::stats::TransferStats;
use crate::tarball::VirtualTarballReader;
use crate::{Config, Error, HashId, Result};

/// 송신 서버
pub struct Server {
    ctrl_rx: mpsc::Receiver<UdpMessage>,
    ctrl_tx: mpsc::Sender<Bytes>,
    data_tx: mpsc::Sender<Bytes>,

    reader: VirtualTarballReader,
    config: Config,
    hash_id: HashId,

    /// 미리 잘라 둔 메타데이터 섹션들
    sections: Vec<Bytes>,

    /// 수신자들의 ACK으로 줄어드는 미전달 추정 구간
    ///
    /// 전부 ACK되면 다시 clear해서 늦게 합류한 수신자도 받게 한다
    nak: NakRegions,

    /// 데이터 펌프 커서 (전역 오프셋)
    cursor: u64,

    stats: Arc<RwLock<TransferStats>>,
}

impl Server {
    /// 새 서버 생성. 메타데이터를 섹션 단위로 잘라 둔다
    pub fn new(
        channels: ServerChannels,
        reader: VirtualTarballReader,
        config: Config,
    ) -> Result<Self> {
        let metadata = reader.metadata();
        let sections: Vec<Bytes> = metadata
            .chunks(config.section_size)
            .map(Bytes::copy_from_slice)
            .collect();
        if sections.len() > u16::MAX as usize {
            return Err(Error::MetadataTooLarge(sections.len()));
        }

        let mut nak = NakRegions::new(reader.size());
        nak.clear(reader.size());

        let hash_id = reader.hash_id();
        Ok(Self {
            ctrl_rx: channels.control_to_server,
            ctrl_tx: channels.control_to_client,
            data_tx: channels.data,
            reader,
            config,
            hash_id,
            sections,
            nak,
            cursor: 0,
            stats: Arc::new(RwLock::new(TransferStats::new())),
        })
    }

    /// 통계 핸들
    pub fn stats(&self) -> Arc<RwLock<TransferStats>> {
        self.stats.clone()
    }

    /// 서버 이벤트 루프. 전송 계층이 끊길 때까지 돈다
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "MBT server started: id={}, {} files, {} bytes, {} metadata sections",
            hex::encode(self.hash_id),
            self.reader.files().len(),
            self.reader.size(),
            self.sections.len(),
        );

        let mut announce = tokio::time::interval(self.config.announce_interval());
        let mut pump = tokio::time::interval(self.config.chunk_interval());

        loop {
            tokio::select! {
                _ = announce.tick() => self.announce().await?,
                _ = pump.tick() => self.pump_one().await?,
                msg = self.ctrl_rx.recv() => match msg {
                    Some(m) => self.handle_control(m).await?,
                    None => return Err(Error::ChannelClosed),
                },
            }
        }
    }

    async fn announce(&mut self) -> Result<()> {
        let frame = message::encode_frame(&self.hash_id, Opcode::AnnounceTarball, &[]);
        self.send_control(frame).await?;
        self.stats.write().announces_sent += 1;
        Ok(())
    }

    async fn handle_control(&mut self, msg: UdpMessage) -> Result<()> {
        let Some(frame) = Frame::parse(&msg.data) else {
            debug!("짧은 컨트롤 데이터그램 버림: {} bytes from {}", msg.data.len(), msg.from);
            return Ok(());
        };
        if frame.hash_id != self.hash_id {
            // 다른 전송에 대한 메시지
            return Ok(());
        }

        match frame.opcode() {
            Some(Opcode::RequestMetadataHeader) => {
                debug!("metadata header 요청 from {}", msg.from);
                let header = MetadataHeader {
                    section_count: self.sections.len() as u16,
                };
                let reply = message::encode_frame(
                    &self.hash_id,
                    Opcode::RespondMetadataHeader,
                    &header.encode(),
                );
                self.send_control(reply).await?;
            }

            Some(Opcode::RequestMetadataSection) => {
                let Some(req) = SectionIndex::decode(frame.payload) else {
                    warn!("잘못된 섹션 요청 버림 from {}", msg.from);
                    return Ok(());
                };
                let Some(section) = self.sections.get(req.index as usize) else {
                    warn!("범위 밖 섹션 요청 무시: {}", req.index);
                    return Ok(());
                };
                let reply = message::encode_frame(
                    &self.hash_id,
                    Opcode::RespondMetadataSection,
                    &message::encode_section(req.index, section),
                );
                self.send_control(reply).await?;
            }

            Some(Opcode::AckDataSection) => {
                let Some(ack) = AckRegion::decode(frame.payload) else {
                    warn!("잘못된 ACK 버림 from {}", msg.from);
                    return Ok(());
                };
                self.record_ack(ack);
            }

            // 클라이언트끼리의 요청이 들리거나 모르는 opcode면 무시
            _ => {}
        }

        Ok(())
    }

    /// ACK 힌트 반영
    ///
    /// 같은 구간이 다시 ACK되면서 커서보다 뒤에 있다면 그 수신자가
    /// 뒤처진 것이므로 커서를 그 지점으로 되돌려 재전송을 편향시킨다
    fn record_ack(&mut self, ack: AckRegion) {
        if ack.start >= ack.end_ex || ack.end_ex > self.nak.size() {
            // 첫 ACK(0,0)는 힌트 없음
            return;
        }

        self.stats.write().acks_received += 1;

        let again = self.nak.is_acked(ack.start, ack.end_ex);
        if self.nak.ack(ack.start, ack.end_ex).is_err() {
            return;
        }
        if again && ack.end_ex < self.cursor {
            debug!("수신자 지연 감지: cursor {} -> {}", self.cursor, ack.end_ex);
            self.cursor = ack.end_ex;
        }
    }

    /// 청크 하나 송신
    ///
    /// 커서 이후의 첫 미수신 구간에서 읽는다. 끝까지 갔으면 처음으로
    /// 되돌고, 전부 ACK된 상태면 전체를 다시 미수신으로 돌려 재순환한다
    async fn pump_one(&mut self) -> Result<()> {
        let size = self.reader.size();
        if size == 0 {
            return Ok(());
        }

        let region = match self.nak.next_outstanding(self.cursor) {
            Some(r) => r,
            None => {
                self.cursor = 0;
                match self.nak.next_outstanding(0) {
                    Some(r) => r,
                    None => {
                        self.nak.clear(size);
                        Region::new(0, size)
                    }
                }
            }
        };

        let offset = region.start.max(self.cursor);
        let want = (self.config.chunk_size as u64).min(region.end_ex - offset) as usize;
        let mut buf = vec![0u8; want];
        let n = self.reader.read_at(&mut buf, offset)?;
        buf.truncate(n);

        let frame = message::encode_frame(
            &self.hash_id,
            Opcode::DataSection,
            &message::encode_data_section(offset, &buf),
        );
        self.data_tx
            .send(frame.into())
            .await
            .map_err(|_| Error::ChannelClosed)?;
        self.cursor = offset + n as u64;

        let mut stats = self.stats.write();
        stats.bytes_sent += n as u64;
        stats.datagrams_sent += 1;
        Ok(())
    }

    async fn send_control(&mut self, frame: Vec<u8>) -> Result<()> {
        self.ctrl_tx
            .send(frame.into())
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}
