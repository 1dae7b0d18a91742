//! 가상 타볼
//!
//! 파일 목록을 길이 size의 연속 바이트 스트림 하나로 취급한다.
//! 바이트 b는 offsets[i] ≤ b < offsets[i]+size[i]인 파일 i의
//! 로컬 오프셋 b - offsets[i]에 대응된다.
//!
//! - Reader: 송신측. 열 때 파일별 SHA-256을 계산하고 임의 오프셋 읽기 제공
//! - Writer: 수신측. `.part` 임시 파일에 쓰고 닫을 때 검증 후 최종 이름으로 rename

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{Error, HashId, Result, HASH_SIZE};

/// 타볼 구성 파일 하나
#[derive(Debug, Clone)]
pub struct TarballFile {
    /// 타볼 내 상대 경로 (슬래시 구분, UTF-8)
    pub path: String,

    /// 로컬 파일시스템 경로 (직렬화되지 않음)
    pub local_path: PathBuf,

    /// 파일 크기 (바이트). 전송 중 변하지 않는다고 가정
    pub size: u64,

    /// POSIX 모드 비트
    pub mode: u32,

    /// 파일 내용의 SHA-256
    pub hash: [u8; HASH_SIZE],
}

/// 정규 메타데이터 스트림 인코딩
///
/// u64 타볼 크기, u32 파일 수, 파일마다 u16 경로 길이 + 경로 + u64 크기
/// + u32 모드 + 32바이트 해시. 컨텐츠 ID는 이 바이트열의 SHA-256이다.
pub fn encode_metadata(files: &[TarballFile]) -> Vec<u8> {
    let size: u64 = files.iter().map(|f| f.size).sum();
    let mut buf = Vec::with_capacity(12 + files.len() * 64);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&(files.len() as u32).to_le_bytes());
    for f in files {
        let path = f.path.as_bytes();
        buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&f.size.to_le_bytes());
        buf.extend_from_slice(&f.mode.to_le_bytes());
        buf.extend_from_slice(&f.hash);
    }
    buf
}

/// 메타데이터 스트림 디코딩: (선언된 타볼 크기, 파일 목록)
///
/// local_path는 비워서 돌려준다. 수신측이 출력 디렉토리에 맞춰 채운다.
pub fn decode_metadata(buf: &[u8]) -> Result<(u64, Vec<TarballFile>)> {
    let mut cur = Cursor { buf, pos: 0 };
    let size = cur.read_u64()?;
    let count = cur.read_u32()?;
    // count는 아직 검증 전이므로 미리 크게 할당하지 않는다
    let mut files = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let path_len = cur.read_u16()? as usize;
        let path_bytes = cur.read_bytes(path_len)?;
        let path = String::from_utf8(path_bytes.to_vec())
            .map_err(|_| Error::MalformedMetadata("경로가 UTF-8이 아님"))?;
        let file_size = cur.read_u64()?;
        let mode = cur.read_u32()?;
        let hash_bytes = cur.read_bytes(HASH_SIZE)?;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(hash_bytes);
        files.push(TarballFile {
            path,
            local_path: PathBuf::new(),
            size: file_size,
            mode,
            hash,
        });
    }
    Ok((size, files))
}

/// 컨텐츠 ID: 정규 메타데이터 스트림의 SHA-256
pub fn compute_hash_id(files: &[TarballFile]) -> HashId {
    let digest = Sha256::digest(encode_metadata(files));
    digest.into()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedMetadata("짧은 메타데이터"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }
}

fn check_unique(files: &[TarballFile]) -> Result<()> {
    let mut seen = HashSet::with_capacity(files.len());
    for f in files {
        if !seen.insert(f.path.as_str()) {
            return Err(Error::DuplicatePath(f.path.clone()));
        }
    }
    Ok(())
}

/// 네트워크에서 받은 경로 검증: 절대 경로, 빈 컴포넌트, `.`/`..` 금지
fn validate_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path
            .split('/')
            .any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(Error::UnsafePath(path.to_string()));
    }
    Ok(())
}

fn hash_reader(mut r: impl Read) -> std::io::Result<[u8; HASH_SIZE]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn part_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

fn prefix_sums(files: &[TarballFile]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(files.len());
    let mut total = 0u64;
    for f in files {
        offsets.push(total);
        total += f.size;
    }
    (offsets, total)
}

/// offsets[i] ≤ off를 만족하는 마지막 파일 인덱스
fn file_index(offsets: &[u64], off: u64) -> usize {
    offsets.partition_point(|&o| o <= off) - 1
}

/// 송신측 타볼: 읽기 전용, 열 때 파일별 해시를 한 번 계산
pub struct VirtualTarballReader {
    files: Vec<TarballFile>,
    handles: Vec<File>,
    offsets: Vec<u64>,
    size: u64,
    hash_id: HashId,
}

impl VirtualTarballReader {
    /// 파일 목록을 열고 해시 계산 후 컨텐츠 ID 유도
    pub fn open(mut files: Vec<TarballFile>) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::NoFiles);
        }
        check_unique(&files)?;

        let mut handles = Vec::with_capacity(files.len());
        for f in &mut files {
            let file = File::open(&f.local_path)?;
            let meta = file.metadata()?;
            if meta.len() != f.size {
                return Err(Error::SizeMismatch {
                    expected: f.size,
                    got: meta.len(),
                });
            }
            f.hash = hash_reader(&file)?;
            handles.push(file);
        }

        let (offsets, size) = prefix_sums(&files);
        let hash_id = compute_hash_id(&files);
        Ok(Self {
            files,
            handles,
            offsets,
            size,
            hash_id,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    pub fn files(&self) -> &[TarballFile] {
        &self.files
    }

    /// 정규 메타데이터 스트림
    pub fn metadata(&self) -> Vec<u8> {
        encode_metadata(&self.files)
    }

    /// 전역 오프셋에서 buf 길이만큼 읽기. 파일 경계를 넘으면 이어붙인다
    ///
    /// 타볼 끝에 걸리면 읽은 바이트 수가 buf보다 작을 수 있다
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Err(Error::OutOfRange {
                offset,
                size: self.size,
            });
        }

        let mut n = 0usize;
        let mut off = offset;
        let mut i = file_index(&self.offsets, off);
        while n < buf.len() && off < self.size {
            while self.files[i].size == 0 || off >= self.offsets[i] + self.files[i].size {
                i += 1;
            }
            let local = off - self.offsets[i];
            let avail = (self.files[i].size - local) as usize;
            let take = avail.min(buf.len() - n);
            self.handles[i].read_exact_at(&mut buf[n..n + take], local)?;
            n += take;
            off += take as u64;
        }
        Ok(n)
    }
}

/// 수신측 타볼: `.part` 임시 파일에 기록, close에서 검증 + rename
pub struct VirtualTarballWriter {
    files: Vec<TarballFile>,
    parts: Vec<PathBuf>,
    handles: Vec<File>,
    offsets: Vec<u64>,
    size: u64,
    hash_id: HashId,
}

impl VirtualTarballWriter {
    /// 메타데이터로 받은 파일 목록으로 쓰기 준비
    ///
    /// 목록에서 유도한 컨텐츠 ID가 expected와 다르면 HashMismatch.
    /// 각 대상 파일은 `<경로>.part`로 생성되고 미리 크기만큼 늘려 둔다.
    pub fn create(files: Vec<TarballFile>, expected: &HashId, output_dir: &Path) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::NoFiles);
        }
        for f in &files {
            validate_path(&f.path)?;
        }
        check_unique(&files)?;

        let hash_id = compute_hash_id(&files);
        if &hash_id != expected {
            return Err(Error::HashMismatch {
                context: "metadata".to_string(),
                expected: hex::encode(expected),
                got: hex::encode(hash_id),
            });
        }

        let mut files = files;
        let mut parts = Vec::with_capacity(files.len());
        let mut handles = Vec::with_capacity(files.len());
        for f in &mut files {
            f.local_path = output_dir.join(&f.path);
            if let Some(dir) = f.local_path.parent() {
                fs::create_dir_all(dir)?;
            }
            let part = part_path(&f.local_path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&part)?;
            file.set_len(f.size)?;
            parts.push(part);
            handles.push(file);
        }

        let (offsets, size) = prefix_sums(&files);
        Ok(Self {
            files,
            parts,
            handles,
            offsets,
            size,
            hash_id,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    pub fn files(&self) -> &[TarballFile] {
        &self.files
    }

    /// 전역 오프셋에 쓰기. 파일 경계를 넘으면 나눠서 기록한다
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if offset >= self.size || end > self.size {
            return Err(Error::OutOfRange {
                offset,
                size: self.size,
            });
        }

        let mut n = 0usize;
        let mut off = offset;
        let mut i = file_index(&self.offsets, off);
        while n < data.len() {
            while self.files[i].size == 0 || off >= self.offsets[i] + self.files[i].size {
                i += 1;
            }
            let local = off - self.offsets[i];
            let avail = (self.files[i].size - local) as usize;
            let take = avail.min(data.len() - n);
            self.handles[i].write_all_at(&data[n..n + take], local)?;
            n += take;
            off += take as u64;
        }
        Ok(n)
    }

    /// 파일별 내용 해시 검증, 모드 적용, `.part` → 최종 이름 rename
    ///
    /// 검증 실패한 파일은 삭제하고 HashMismatch를 돌려준다
    pub fn close(mut self) -> Result<()> {
        self.handles.clear();

        let mut failed: Option<Error> = None;
        for (f, part) in self.files.iter().zip(&self.parts) {
            let got = {
                let file = File::open(part)?;
                hash_reader(&file)?
            };
            if got != f.hash {
                warn!("파일 해시 불일치, 삭제: {}", f.path);
                let _ = fs::remove_file(part);
                if failed.is_none() {
                    failed = Some(Error::HashMismatch {
                        context: f.path.clone(),
                        expected: hex::encode(f.hash),
                        got: hex::encode(got),
                    });
                }
                continue;
            }
            fs::set_permissions(part, fs::Permissions::from_mode(f.mode & 0o7777))?;
            fs::rename(part, &f.local_path)?;
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn make_file(dir: &Path, name: &str, contents: &[u8]) -> TarballFile {
        let local_path = dir.join(name);
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(&local_path).unwrap();
        f.write_all(contents).unwrap();
        TarballFile {
            path: name.to_string(),
            local_path,
            size: contents.len() as u64,
            mode: 0o644,
            hash: [0u8; HASH_SIZE],
        }
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn reader_computes_size_and_stable_id() {
        let dir = tempdir().unwrap();
        let files = vec![
            make_file(dir.path(), "a.bin", &patterned(100, 1)),
            make_file(dir.path(), "b/c.bin", &patterned(50, 2)),
        ];

        let r1 = VirtualTarballReader::open(files.clone()).unwrap();
        assert_eq!(r1.size(), 150);

        let r2 = VirtualTarballReader::open(files).unwrap();
        assert_eq!(r1.hash_id(), r2.hash_id());
        assert_eq!(r1.hash_id(), compute_hash_id(r1.files()));
    }

    #[test]
    fn hash_id_is_sensitive_to_metadata() {
        let base = vec![TarballFile {
            path: "a".to_string(),
            local_path: PathBuf::new(),
            size: 4,
            mode: 0o644,
            hash: [7u8; HASH_SIZE],
        }];
        let id = compute_hash_id(&base);

        let mut renamed = base.clone();
        renamed[0].path = "b".to_string();
        assert_ne!(compute_hash_id(&renamed), id);

        let mut remoded = base.clone();
        remoded[0].mode = 0o755;
        assert_ne!(compute_hash_id(&remoded), id);

        let mut rehashed = base.clone();
        rehashed[0].hash[0] ^= 1;
        assert_ne!(compute_hash_id(&rehashed), id);
    }

    #[test]
    fn metadata_round_trip() {
        let files = vec![
            TarballFile {
                path: "x/y.txt".to_string(),
                local_path: PathBuf::new(),
                size: 10,
                mode: 0o600,
                hash: [3u8; HASH_SIZE],
            },
            TarballFile {
                path: "z".to_string(),
                local_path: PathBuf::new(),
                size: 0,
                mode: 0o644,
                hash: [4u8; HASH_SIZE],
            },
        ];
        let buf = encode_metadata(&files);
        let (size, decoded) = decode_metadata(&buf).unwrap();
        assert_eq!(size, 10);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path, "x/y.txt");
        assert_eq!(decoded[0].mode, 0o600);
        assert_eq!(decoded[1].size, 0);
        assert_eq!(decoded[1].hash, [4u8; HASH_SIZE]);

        assert!(decode_metadata(&buf[..buf.len() - 1]).is_err());
        assert!(decode_metadata(&buf[..5]).is_err());
    }

    #[test]
    fn read_spans_file_boundaries() {
        let dir = tempdir().unwrap();
        let files = vec![
            make_file(dir.path(), "a", b"aaaaa"),
            make_file(dir.path(), "empty", b""),
            make_file(dir.path(), "b", b"bbbbbbb"),
        ];
        let reader = VirtualTarballReader::open(files).unwrap();
        assert_eq!(reader.size(), 12);

        let mut buf = vec![0u8; 12];
        assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 12);
        assert_eq!(&buf, b"aaaaabbbbbbb");

        let mut buf = vec![0u8; 4];
        assert_eq!(reader.read_at(&mut buf, 3).unwrap(), 4);
        assert_eq!(&buf, b"aabb");

        // 타볼 끝에 걸치면 짧게 읽힘
        let mut buf = vec![0u8; 10];
        assert_eq!(reader.read_at(&mut buf, 10).unwrap(), 2);

        assert!(matches!(
            reader.read_at(&mut buf, 12),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn duplicate_paths_rejected() {
        let dir = tempdir().unwrap();
        let mut files = vec![make_file(dir.path(), "a", b"xy")];
        files.push(files[0].clone());
        assert!(matches!(
            VirtualTarballReader::open(files),
            Err(Error::DuplicatePath(_))
        ));
    }

    #[test]
    fn writer_round_trip() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let contents = [patterned(3000, 5), patterned(1, 6), patterned(4500, 7)];
        let files = vec![
            make_file(src.path(), "one.bin", &contents[0]),
            make_file(src.path(), "two", &contents[1]),
            make_file(src.path(), "sub/three.bin", &contents[2]),
        ];
        let reader = VirtualTarballReader::open(files).unwrap();
        let writer =
            VirtualTarballWriter::create(reader.files().to_vec(), &reader.hash_id(), out.path())
                .unwrap();
        assert_eq!(writer.size(), reader.size());

        // 임의 크기 청크로 전체 복사 (경계에 안 맞는 크기)
        let mut offset = 0u64;
        let mut buf = vec![0u8; 700];
        while offset < reader.size() {
            let n = reader.read_at(&mut buf, offset).unwrap();
            writer.write_at(&buf[..n], offset).unwrap();
            offset += n as u64;
        }
        writer.close().unwrap();

        assert_eq!(fs::read(out.path().join("one.bin")).unwrap(), contents[0]);
        assert_eq!(fs::read(out.path().join("two")).unwrap(), contents[1]);
        assert_eq!(
            fs::read(out.path().join("sub/three.bin")).unwrap(),
            contents[2]
        );
        assert!(!out.path().join("one.bin.part").exists());

        let mode = fs::metadata(out.path().join("one.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn writer_rejects_wrong_id() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let files = vec![make_file(src.path(), "a", b"data")];
        let reader = VirtualTarballReader::open(files).unwrap();
        let wrong = [0u8; HASH_SIZE];
        assert!(matches!(
            VirtualTarballWriter::create(reader.files().to_vec(), &wrong, out.path()),
            Err(Error::HashMismatch { .. })
        ));
    }

    #[test]
    fn writer_rejects_unsafe_paths() {
        let out = tempdir().unwrap();
        for path in ["../evil", "/abs", "a//b", "a/./b", "a/../b", ""] {
            let files = vec![TarballFile {
                path: path.to_string(),
                local_path: PathBuf::new(),
                size: 1,
                mode: 0o644,
                hash: [0u8; HASH_SIZE],
            }];
            let id = compute_hash_id(&files);
            assert!(
                matches!(
                    VirtualTarballWriter::create(files, &id, out.path()),
                    Err(Error::UnsafePath(_))
                ),
                "accepted: {path:?}"
            );
        }
    }

    #[test]
    fn close_deletes_corrupt_files() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let files = vec![make_file(src.path(), "a.bin", &patterned(256, 9))];
        let reader = VirtualTarballReader::open(files).unwrap();
        let writer =
            VirtualTarballWriter::create(reader.files().to_vec(), &reader.hash_id(), out.path())
                .unwrap();

        // 잘못된 내용 기록
        writer.write_at(&vec![0xFFu8; 256], 0).unwrap();
        assert!(matches!(
            writer.close(),
            Err(Error::HashMismatch { .. })
        ));
        assert!(!out.path().join("a.bin").exists());
        assert!(!out.path().join("a.bin.part").exists());
    }

    #[test]
    fn write_out_of_range_rejected() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let files = vec![make_file(src.path(), "a", b"0123456789")];
        let reader = VirtualTarballReader::open(files).unwrap();
        let writer =
            VirtualTarballWriter::create(reader.files().to_vec(), &reader.hash_id(), out.path())
                .unwrap();
        assert!(matches!(
            writer.write_at(b"xx", 9),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            writer.write_at(b"x", 10),
            Err(Error::OutOfRange { .. })
        ));
    }
}
