//! 파일 스펙 해석과 파일 목록 수집
//!
//! serve/id/ls가 받는 인자 형식:
//! - `path`          파일 하나 (타볼에는 파일명으로 들어감)
//! - `path::alias`   파일 이름 바꿔서 추가
//! - `dir::subdir`   디렉토리 바로 아래 파일들을 subdir/ 밑으로 (재귀 없음)
//! - `dir:::subdir`  디렉토리 전체를 재귀적으로 subdir/ 밑으로
//!
//! 읽을 수 없는 항목은 경고만 내고 건너뛴다. 결과 목록은 경로순 정렬
//! (컨텐츠 ID가 순서에 의존하므로 여기서 정규화한다).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tracing::warn;
use walkdir::WalkDir;

use crate::tarball::TarballFile;
use crate::{Error, Result, HASH_SIZE};

/// 해석된 파일 스펙 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// 로컬 경로
    pub local_path: PathBuf,

    /// 타볼 내 하위 디렉토리 (파일이면 새 이름)
    pub subdir: String,

    /// 디렉토리 재귀 추가 여부
    pub recursive: bool,
}

/// 인자 하나 해석. `:::`가 `::`보다 먼저다
pub fn parse_spec(arg: &str) -> FileSpec {
    if let Some(sep) = arg.rfind(":::") {
        if sep > 0 {
            return FileSpec {
                local_path: PathBuf::from(&arg[..sep]),
                subdir: arg[sep + 3..].to_string(),
                recursive: true,
            };
        }
    }
    if let Some(sep) = arg.rfind("::") {
        if sep > 0 {
            return FileSpec {
                local_path: PathBuf::from(&arg[..sep]),
                subdir: arg[sep + 2..].to_string(),
                recursive: false,
            };
        }
    }
    FileSpec {
        local_path: PathBuf::from(arg),
        subdir: String::new(),
        recursive: false,
    }
}

/// 스펙 목록을 타볼 파일 목록으로 수집
///
/// 해시는 비워 둔다 (Reader가 열 때 계산)
pub fn collect_files(args: &[String]) -> Result<Vec<TarballFile>> {
    let mut files = Vec::new();

    for arg in args {
        let spec = parse_spec(arg);
        let meta = match fs::metadata(&spec.local_path) {
            Ok(m) => m,
            Err(e) => {
                warn!("건너뜀 {}: {}", spec.local_path.display(), e);
                continue;
            }
        };

        if meta.is_dir() {
            collect_dir(&spec, &mut files);
        } else if meta.is_file() {
            let name = if !spec.subdir.is_empty() {
                spec.subdir.clone()
            } else {
                match spec.local_path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n.to_string(),
                    None => {
                        warn!("건너뜀 {}: 파일명이 UTF-8이 아님", spec.local_path.display());
                        continue;
                    }
                }
            };
            files.push(TarballFile {
                path: name,
                local_path: spec.local_path,
                size: meta.len(),
                mode: meta.permissions().mode(),
                hash: [0u8; HASH_SIZE],
            });
        } else {
            warn!("건너뜀 {}: 일반 파일이 아님", spec.local_path.display());
        }
    }

    if files.is_empty() {
        return Err(Error::NoFiles);
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    for w in files.windows(2) {
        if w[0].path == w[1].path {
            return Err(Error::DuplicatePath(w[0].path.clone()));
        }
    }
    Ok(files)
}

fn collect_dir(spec: &FileSpec, files: &mut Vec<TarballFile>) {
    let max_depth = if spec.recursive { usize::MAX } else { 1 };
    for entry in WalkDir::new(&spec.local_path)
        .min_depth(1)
        .max_depth(max_depth)
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("건너뜀: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("건너뜀 {}: {}", entry.path().display(), e);
                continue;
            }
        };

        // 루트 기준 상대 경로를 슬래시 구분으로
        let rel = match entry.path().strip_prefix(&spec.local_path) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let mut parts = Vec::new();
        let mut utf8 = true;
        for c in rel.components() {
            match c.as_os_str().to_str() {
                Some(s) => parts.push(s),
                None => {
                    utf8 = false;
                    break;
                }
            }
        }
        if !utf8 {
            warn!("건너뜀 {}: 경로가 UTF-8이 아님", entry.path().display());
            continue;
        }
        let rel = parts.join("/");
        let tar_path = if spec.subdir.is_empty() {
            rel
        } else {
            format!("{}/{}", spec.subdir, rel)
        };

        files.push(TarballFile {
            path: tar_path,
            local_path: entry.into_path(),
            size: meta.len(),
            mode: meta.permissions().mode(),
            hash: [0u8; HASH_SIZE],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn parse_spec_forms() {
        assert_eq!(
            parse_spec("some/dir"),
            FileSpec {
                local_path: PathBuf::from("some/dir"),
                subdir: String::new(),
                recursive: false,
            }
        );
        assert_eq!(
            parse_spec("file.txt::renamed"),
            FileSpec {
                local_path: PathBuf::from("file.txt"),
                subdir: "renamed".to_string(),
                recursive: false,
            }
        );
        assert_eq!(
            parse_spec("dir:::sub"),
            FileSpec {
                local_path: PathBuf::from("dir"),
                subdir: "sub".to_string(),
                recursive: true,
            }
        );
        // 빈 subdir도 허용
        assert_eq!(
            parse_spec("dir:::"),
            FileSpec {
                local_path: PathBuf::from("dir"),
                subdir: String::new(),
                recursive: true,
            }
        );
    }

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn paths(files: &[TarballFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn directory_without_recursion() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"a");
        write_file(&dir.path().join("sub/b.txt"), b"b");

        let args = vec![dir.path().to_str().unwrap().to_string()];
        let files = collect_files(&args).unwrap();
        assert_eq!(paths(&files), vec!["a.txt"]);
    }

    #[test]
    fn directory_recursive_with_subdir() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"a");
        write_file(&dir.path().join("sub/b.txt"), b"b");
        write_file(&dir.path().join("sub/deep/c.txt"), b"c");

        let args = vec![format!("{}:::pkg", dir.path().to_str().unwrap())];
        let files = collect_files(&args).unwrap();
        assert_eq!(
            paths(&files),
            vec!["pkg/a.txt", "pkg/sub/b.txt", "pkg/sub/deep/c.txt"]
        );
    }

    #[test]
    fn file_alias_renames() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("orig.bin");
        write_file(&file, b"data");
        fs::set_permissions(&file, fs::Permissions::from_mode(0o640)).unwrap();

        let args = vec![format!("{}::renamed.bin", file.to_str().unwrap())];
        let files = collect_files(&args).unwrap();
        assert_eq!(paths(&files), vec!["renamed.bin"]);
        assert_eq!(files[0].size, 4);
        assert_eq!(files[0].mode & 0o777, 0o640);
    }

    #[test]
    fn plain_file_uses_base_name() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        write_file(&file, b"x");

        let args = vec![file.to_str().unwrap().to_string()];
        let files = collect_files(&args).unwrap();
        assert_eq!(paths(&files), vec!["plain.txt"]);
    }

    #[test]
    fn empty_list_is_an_error() {
        let args = vec!["/definitely/not/there".to_string()];
        assert!(matches!(collect_files(&args), Err(Error::NoFiles)));
        assert!(matches!(collect_files(&[]), Err(Error::NoFiles)));
    }

    #[test]
    fn duplicate_tar_paths_rejected() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        write_file(&a, b"1");
        write_file(&b, b"2");

        let args = vec![
            format!("{}::same", a.to_str().unwrap()),
            format!("{}::same", b.to_str().unwrap()),
        ];
        assert!(matches!(
            collect_files(&args),
            Err(Error::DuplicatePath(_))
        ));
    }
}
