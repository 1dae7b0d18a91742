//! 와이어 프레이밍
//!
//! 모든 데이터그램은 32바이트 컨텐츠 ID + 1바이트 opcode + 페이로드.
//! 멀티바이트 정수는 전부 리틀엔디안. 페이로드 길이는 데이터그램 길이로 암시.

use crate::{HashId, HASH_SIZE};

/// 메시지 opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// 타볼 공지 (서버 → 클라이언트, 컨트롤)
    AnnounceTarball = 0x01,

    /// 메타데이터 헤더 요청 (클라이언트 → 서버)
    RequestMetadataHeader = 0x10,

    /// 메타데이터 헤더 응답: u16 섹션 수
    RespondMetadataHeader = 0x11,

    /// 메타데이터 섹션 요청: u16 인덱스
    RequestMetadataSection = 0x12,

    /// 메타데이터 섹션 응답: u16 인덱스 + 바이트
    RespondMetadataSection = 0x13,

    /// 수신 구간 ACK: u64 start + u64 endEx
    AckDataSection = 0x20,

    /// 데이터 청크 (서버 → 클라이언트, 데이터 채널): u64 offset + 바이트
    DataSection = 0x30,
}

impl Opcode {
    /// 바이트에서 opcode 해석. 모르는 값이면 None (수신측은 무시해야 함)
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0x01 => Some(Opcode::AnnounceTarball),
            0x10 => Some(Opcode::RequestMetadataHeader),
            0x11 => Some(Opcode::RespondMetadataHeader),
            0x12 => Some(Opcode::RequestMetadataSection),
            0x13 => Some(Opcode::RespondMetadataSection),
            0x20 => Some(Opcode::AckDataSection),
            0x30 => Some(Opcode::DataSection),
            _ => None,
        }
    }
}

/// 수신 데이터그램 분해 결과
#[derive(Debug)]
pub struct Frame<'a> {
    /// 전송 식별자
    pub hash_id: HashId,

    /// opcode 원시 바이트 (모르는 opcode도 일단 통과)
    pub op: u8,

    /// 나머지 페이로드
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// 데이터그램 분해. 헤더도 안 되는 길이면 None
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < HASH_SIZE + 1 {
            return None;
        }
        let mut hash_id = [0u8; HASH_SIZE];
        hash_id.copy_from_slice(&buf[..HASH_SIZE]);
        Some(Self {
            hash_id,
            op: buf[HASH_SIZE],
            payload: &buf[HASH_SIZE + 1..],
        })
    }

    /// 알려진 opcode면 Some
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }
}

/// 데이터그램 하나 조립
pub fn encode_frame(hash_id: &HashId, op: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HASH_SIZE + 1 + payload.len());
    buf.extend_from_slice(hash_id);
    buf.push(op as u8);
    buf.extend_from_slice(payload);
    buf
}

/// RespondMetadataHeader 페이로드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub section_count: u16,
}

impl MetadataHeader {
    pub fn encode(&self) -> [u8; 2] {
        self.section_count.to_le_bytes()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        Some(Self {
            section_count: u16::from_le_bytes([payload[0], payload[1]]),
        })
    }
}

/// RequestMetadataSection 페이로드 / RespondMetadataSection 선두 필드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionIndex {
    pub index: u16,
}

impl SectionIndex {
    pub fn encode(&self) -> [u8; 2] {
        self.index.to_le_bytes()
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        Some(Self {
            index: u16::from_le_bytes([payload[0], payload[1]]),
        })
    }
}

/// RespondMetadataSection 페이로드 조립
pub fn encode_section(index: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + data.len());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// RespondMetadataSection 페이로드 분해: (인덱스, 섹션 바이트)
pub fn decode_section(payload: &[u8]) -> Option<(u16, &[u8])> {
    let idx = SectionIndex::decode(payload)?;
    Some((idx.index, &payload[2..]))
}

/// AckDataSection 페이로드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRegion {
    pub start: u64,
    pub end_ex: u64,
}

impl AckRegion {
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.start.to_le_bytes());
        buf[8..].copy_from_slice(&self.end_ex.to_le_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 16 {
            return None;
        }
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&payload[..8]);
        b.copy_from_slice(&payload[8..16]);
        Some(Self {
            start: u64::from_le_bytes(a),
            end_ex: u64::from_le_bytes(b),
        })
    }
}

/// DataSection 페이로드 조립
pub fn encode_data_section(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// DataSection 페이로드 분해: (전역 오프셋, 청크 바이트)
pub fn decode_data_section(payload: &[u8]) -> Option<(u64, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let mut o = [0u8; 8];
    o.copy_from_slice(&payload[..8]);
    Some((u64::from_le_bytes(o), &payload[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let id = [0xABu8; 32];
        let buf = encode_frame(&id, Opcode::DataSection, &[1, 2, 3]);
        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(frame.hash_id, id);
        assert_eq!(frame.opcode(), Some(Opcode::DataSection));
        assert_eq!(frame.payload, &[1, 2, 3]);
    }

    #[test]
    fn frame_rejects_short_datagram() {
        assert!(Frame::parse(&[0u8; 32]).is_none());
        assert!(Frame::parse(&[]).is_none());
    }

    #[test]
    fn frame_passes_unknown_opcode_through() {
        let mut buf = vec![0u8; 33];
        buf[32] = 0x7F;
        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(frame.op, 0x7F);
        assert_eq!(frame.opcode(), None);
    }

    #[test]
    fn ack_region_layout_is_little_endian() {
        let ack = AckRegion {
            start: 0x0102,
            end_ex: 0x0304,
        };
        let buf = ack.encode();
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 0x01);
        assert_eq!(buf[8], 0x04);
        assert_eq!(AckRegion::decode(&buf), Some(ack));
        assert!(AckRegion::decode(&buf[..15]).is_none());
    }

    #[test]
    fn data_section_round_trip() {
        let buf = encode_data_section(1400, b"hello");
        let (offset, data) = decode_data_section(&buf).unwrap();
        assert_eq!(offset, 1400);
        assert_eq!(data, b"hello");
        assert!(decode_data_section(&buf[..7]).is_none());
    }

    #[test]
    fn section_round_trip() {
        let buf = encode_section(7, b"md");
        let (index, data) = decode_section(&buf).unwrap();
        assert_eq!(index, 7);
        assert_eq!(data, b"md");
    }
}
