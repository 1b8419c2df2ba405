//! 打包：收集条目并写出 zip 或 tar 系列归档。

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::format::{ArchiveFormat, Compressor};
use super::zipstream::{Method, ZipStreamWriter};
use super::{ArchiveError, parent_virtual};
use crate::auth::Session;
use crate::storage::{Storage, join_virtual};

const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// 归档中的一个条目；`name` 为相对公共根目录、以 `/` 分隔的路径。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub real: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug)]
pub struct CollectedEntries {
    /// 不含扩展名的归档文件名。
    pub name: String,
    pub entries: Vec<ArchiveEntry>,
}

/// 深度优先遍历所选路径，子项按名称排序。
///
/// 规则拒绝的路径连同其子树一并跳过；符号链接与读取失败的条目记录日志后跳过。
pub async fn collect_entries(
    session: &Session,
    selections: &[String],
) -> Result<CollectedEntries, ArchiveError> {
    let common = common_root(selections);
    let name = archive_name(&common, &session.storage, selections.len() > 1);
    let real_root = session.storage.resolve_path_checked(&common, true).await?;
    let root = match fs::metadata(&real_root).await {
        Ok(metadata) if metadata.is_dir() => common,
        _ => parent_virtual(&common),
    };

    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = selections.iter().rev().cloned().collect::<Vec<_>>();
    while let Some(virtual_path) = stack.pop() {
        if !visited.insert(virtual_path.clone()) {
            continue;
        }
        if !session.check(&virtual_path) {
            debug!(path = virtual_path, "archive entry denied by rules");
            continue;
        }
        let real = match session
            .storage
            .resolve_path_checked(&virtual_path, false)
            .await
        {
            Ok(real) => real,
            Err(err) => {
                warn!(path = virtual_path, error = %err, "skipping archive entry");
                continue;
            }
        };
        let metadata = match fs::metadata(&real).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = virtual_path, error = %err, "skipping archive entry");
                continue;
            }
        };

        let name = relative_name(&root, &virtual_path);
        if metadata.is_dir() {
            match read_children(&real).await {
                Ok(children) => {
                    for child in children.into_iter().rev() {
                        stack.push(join_virtual(&virtual_path, &child));
                    }
                }
                Err(err) => warn!(path = virtual_path, error = %err, "failed to list directory"),
            }
            if !name.is_empty() {
                entries.push(ArchiveEntry {
                    name,
                    real,
                    is_dir: true,
                    size: 0,
                });
            }
        } else if metadata.is_file() && !name.is_empty() {
            entries.push(ArchiveEntry {
                name,
                real,
                is_dir: false,
                size: metadata.len(),
            });
        }
    }

    Ok(CollectedEntries { name, entries })
}

async fn read_children(dir: &Path) -> io::Result<Vec<String>> {
    let mut reader = fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!(name = ?raw, "skipping non-utf8 file name"),
        }
    }
    names.sort();
    Ok(names)
}

/// 所选路径的最长公共目录前缀。
fn common_root(paths: &[String]) -> String {
    let mut segments = paths
        .iter()
        .map(|path| path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>());
    let Some(mut common) = segments.next() else {
        return "/".to_string();
    };
    for other in segments {
        let shared = common
            .iter()
            .zip(&other)
            .take_while(|(left, right)| left == right)
            .count();
        common.truncate(shared);
    }
    format!("/{}", common.join("/"))
}

fn relative_name(root: &str, path: &str) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string()
}

/// 公共根的末段名；根为 `/` 时使用作用域目录名，多选时加 `_` 前缀。
fn archive_name(root: &str, storage: &Storage, multiple: bool) -> String {
    let base = root
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .or_else(|| {
            storage
                .root_path()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "archive".to_string());
    if multiple { format!("_{base}") } else { base }
}

/// 同步写出归档，需在阻塞线程中调用。
///
/// 单个文件打开失败只记录日志，归档始终正常收尾。
pub fn write_archive<W: Write>(
    format: ArchiveFormat,
    entries: &[ArchiveEntry],
    out: W,
) -> Result<W, ArchiveError> {
    match format {
        ArchiveFormat::Zip => write_zip(entries, out),
        _ => write_tar(format, entries, out),
    }
}

fn write_zip<W: Write>(entries: &[ArchiveEntry], out: W) -> Result<W, ArchiveError> {
    let mut writer = ZipStreamWriter::new(out);
    for entry in entries {
        if entry.is_dir {
            writer.add_directory(&entry.name)?;
            continue;
        }
        let Some(mut file) = open_entry(entry) else {
            continue;
        };
        // 空文件用 Stored，避免出现压缩后非零、解压后为零的条目
        let method = if entry.size == 0 {
            Method::Stored
        } else {
            Method::Deflated
        };
        writer.add_file(
            &entry.name,
            method,
            entry.size >= ZIP64_THRESHOLD,
            &mut file,
        )?;
    }
    Ok(writer.finish()?)
}

fn write_tar<W: Write>(
    format: ArchiveFormat,
    entries: &[ArchiveEntry],
    out: W,
) -> Result<W, ArchiveError> {
    let mut builder = tar::Builder::new(Compressor::new(format, out));
    for entry in entries {
        if entry.is_dir {
            builder.append_dir(&entry.name, &entry.real)?;
            continue;
        }
        let Some(mut file) = open_entry(entry) else {
            continue;
        };
        builder.append_file(&entry.name, &mut file)?;
    }
    let compressor = builder.into_inner()?;
    Ok(compressor.finish()?)
}

fn open_entry(entry: &ArchiveEntry) -> Option<std::fs::File> {
    match std::fs::File::open(&entry.real) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(entry = entry.name, error = %err, "failed to open archive entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::users::{Permissions, Settings, User};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn session(root: &Path, rules: Vec<Rule>, hide_dotfiles: bool) -> Session {
        let user = Arc::new(User {
            username: "bob".into(),
            password: "pw".into(),
            scope: String::new(),
            perm: Permissions::all(),
            rules,
            hide_dotfiles,
        });
        Session::new(
            user,
            Arc::new(Settings::default()),
            Storage::new(root.to_path_buf()),
        )
    }

    fn names(collected: &CollectedEntries) -> Vec<&str> {
        collected
            .entries
            .iter()
            .map(|entry| entry.name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn walk_is_sorted_and_skips_denied_subtrees() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("proj");
        std::fs::create_dir_all(root.join("src/bin")).expect("mkdir");
        std::fs::create_dir_all(root.join("target/debug")).expect("mkdir");
        std::fs::write(root.join("src/lib.rs"), b"lib").expect("write");
        std::fs::write(root.join("src/bin/main.rs"), b"main").expect("write");
        std::fs::write(root.join("target/debug/app"), b"bin").expect("write");
        std::fs::write(root.join("Cargo.toml"), b"[package]").expect("write");
        std::fs::write(root.join(".env"), b"TOKEN=1").expect("write");
        let session = session(temp.path(), vec![Rule::prefix("/proj/target", false)], true);

        let collected = collect_entries(&session, &["/proj".to_string()])
            .await
            .expect("collect");
        assert_eq!(collected.name, "proj");
        assert_eq!(
            names(&collected),
            vec!["Cargo.toml", "src", "src/bin", "src/bin/main.rs", "src/lib.rs"]
        );
        let lib = collected
            .entries
            .iter()
            .find(|entry| entry.name == "src/lib.rs")
            .expect("lib entry");
        assert_eq!(lib.size, 3);
        assert!(!lib.is_dir);
    }

    #[tokio::test]
    async fn single_file_is_named_after_itself() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("docs")).expect("mkdir");
        std::fs::write(temp.path().join("docs/report.pdf"), b"%PDF").expect("write");
        let session = session(temp.path(), Vec::new(), false);

        let collected = collect_entries(&session, &["/docs/report.pdf".to_string()])
            .await
            .expect("collect");
        assert_eq!(collected.name, "report.pdf");
        assert_eq!(names(&collected), vec!["report.pdf"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_left_out() {
        let temp = tempdir().expect("tempdir");
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write");
        let root = temp.path().join("root");
        std::fs::create_dir_all(root.join("dir")).expect("mkdir");
        std::fs::write(root.join("dir/real.txt"), b"real").expect("write");
        std::os::unix::fs::symlink(&outside, root.join("dir/link.txt")).expect("symlink");
        let session = session(&root, Vec::new(), false);

        let collected = collect_entries(&session, &["/dir".to_string()])
            .await
            .expect("collect");
        assert_eq!(names(&collected), vec!["real.txt"]);
    }

    #[tokio::test]
    async fn zip_is_written_straight_to_a_plain_writer() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("pack");
        std::fs::create_dir_all(root.join("sub")).expect("mkdir");
        std::fs::write(root.join("sub/data.txt"), b"data data data").expect("write");
        std::fs::write(root.join("zero.txt"), b"").expect("write");
        let session = session(temp.path(), Vec::new(), false);
        let collected = collect_entries(&session, &["/pack".to_string()])
            .await
            .expect("collect");

        let bytes = write_archive(ArchiveFormat::Zip, &collected.entries, Vec::new())
            .expect("write zip");
        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("open zip");
        let mut listed = (0..archive.len())
            .map(|index| {
                archive
                    .by_index(index)
                    .map(|file| file.name().to_string())
                    .expect("entry")
            })
            .collect::<Vec<_>>();
        listed.sort();
        assert_eq!(listed, vec!["sub/", "sub/data.txt", "zero.txt"]);

        let mut data = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("sub/data.txt").expect("data entry"),
            &mut data,
        )
        .expect("read");
        assert_eq!(data, "data data data");
        let zero = archive.by_name("zero.txt").expect("zero entry");
        assert_eq!((zero.size(), zero.compressed_size()), (0, 0));
    }

    #[test]
    fn common_root_and_names() {
        let storage = Storage::new(PathBuf::from("/srv/files/alice"));
        assert_eq!(
            common_root(&["/a/b/x".to_string(), "/a/b/y/z".to_string()]),
            "/a/b"
        );
        assert_eq!(common_root(&["/a".to_string(), "/b".to_string()]), "/");
        assert_eq!(archive_name("/a/b", &storage, true), "_b");
        assert_eq!(archive_name("/", &storage, false), "alice");
        assert_eq!(relative_name("/", "/x/y"), "x/y");
        assert_eq!(relative_name("/a/b", "/a/b/c"), "c");
    }
}
