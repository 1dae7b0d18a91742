//! 에러 타입 정의

use thiserror::Error;

/// MBT 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("범위 밖 접근: offset={offset}, size={size}")]
    OutOfRange { offset: u64, size: u64 },

    #[error("해시 불일치 ({context}): expected {expected}, got {got}")]
    HashMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("타볼 크기 불일치: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("중복 경로: {0}")]
    DuplicatePath(String),

    #[error("안전하지 않은 경로: {0}")]
    UnsafePath(String),

    #[error("전송할 파일 없음")]
    NoFiles,

    #[error("유효하지 않은 컨텐츠 ID: {0}")]
    InvalidHashId(String),

    #[error("메타데이터 파싱 실패: {0}")]
    MalformedMetadata(&'static str),

    #[error("메타데이터가 너무 큼: {0} 섹션")]
    MetadataTooLarge(usize),

    #[error("채널 닫힘")]
    ChannelClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
