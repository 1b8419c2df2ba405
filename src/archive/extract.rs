//! 受限解压：先扫描元数据校验全部限制，再逐条写入目标目录。

use serde::Serialize;
use std::cell::Cell;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tokio::fs;
use tracing::{debug, warn};

use super::ArchiveError;
use super::format::{ArchiveFormat, Decompressor};
use crate::auth::Session;
use crate::storage::join_virtual;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
/// GNU 长名与 PAX 扩展头的数据会整块读入内存。
const MAX_EXTENSION_SIZE: u64 = 64 * 1024;
/// 每个 tar 条目在数据之外可能占用的字节：头部、对齐填充与扩展头。
const TAR_ENTRY_OVERHEAD: u64 = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ExtractLimits {
    pub max_archive_size: u64,
    pub max_entries: usize,
    pub max_total_uncompressed: u64,
    pub max_entry_uncompressed: u64,
    /// 压缩后与解压后大小之比的下限。
    pub min_compression_ratio: f64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_archive_size: 1 << 30,
            max_entries: 10_000,
            max_total_uncompressed: 10 << 30,
            max_entry_uncompressed: 2 << 30,
            min_compression_ratio: 0.001,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
}

#[derive(Debug)]
struct ScannedEntry {
    /// zip 中为条目序号，tar 中为条目头部在解压流中的位置。
    index: u64,
    name: String,
    is_dir: bool,
    size: u64,
}

#[derive(Debug)]
struct PlannedEntry {
    index: u64,
    name: String,
    real: PathBuf,
    is_dir: bool,
    size: u64,
}

/// 将归档解压到 `destination`（虚拟路径）。
///
/// 任一条目违反限制时整个请求失败且不写入任何文件；规则拒绝的条目只跳过自身。
pub async fn extract_archive(
    session: &Session,
    archive: &Path,
    format: ArchiveFormat,
    destination: &str,
    overwrite: bool,
    limits: &ExtractLimits,
) -> Result<ExtractSummary, ArchiveError> {
    let archive_size = fs::metadata(archive).await?.len();
    if archive_size > limits.max_archive_size {
        return Err(ArchiveError::ArchiveTooLarge {
            size: archive_size,
            max: limits.max_archive_size,
        });
    }
    session
        .storage
        .resolve_path_checked(destination, true)
        .await?;

    let path = archive.to_path_buf();
    let scan_limits = limits.clone();
    let (scanned, skipped) = tokio::task::spawn_blocking(move || match format {
        ArchiveFormat::Zip => scan_zip(&path, &scan_limits),
        _ => scan_tar(&path, format, archive_size, &scan_limits),
    })
    .await
    .map_err(io::Error::other)??;

    let mut summary = ExtractSummary {
        skipped,
        ..ExtractSummary::default()
    };
    let planned = plan_entries(session, destination, scanned, &mut summary).await?;

    let path = archive.to_path_buf();
    let write_limits = limits.clone();
    tokio::task::spawn_blocking(move || {
        let max_entry = write_limits.max_entry_uncompressed;
        match format {
            ArchiveFormat::Zip => write_zip(&path, &planned, overwrite, max_entry, &mut summary)?,
            _ => write_tar(&path, format, &planned, overwrite, &write_limits, &mut summary)?,
        }
        Ok::<_, ArchiveError>(summary)
    })
    .await
    .map_err(io::Error::other)?
}

/// 规范化条目名：折叠 `.` 与 `..`，拒绝绝对路径和越出根目录的名称。
///
/// 规范化后为空的名称（如 `./`）返回 `None`。
fn canonical_entry_name(raw: &str) -> Result<Option<String>, ArchiveError> {
    let normalized = raw.replace('\\', "/");
    let bytes = normalized.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic();
    if normalized.starts_with('/') || has_drive || normalized.contains('\0') {
        return Err(ArchiveError::InvalidEntryPath(raw.to_string()));
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ArchiveError::InvalidEntryPath(raw.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        Ok(None)
    } else {
        Ok(Some(segments.join("/")))
    }
}

/// 累计条目大小并检查单条与总量上限。
struct SizeBudget<'a> {
    limits: &'a ExtractLimits,
    total: u64,
    entries: usize,
}

impl<'a> SizeBudget<'a> {
    fn new(limits: &'a ExtractLimits) -> Self {
        Self {
            limits,
            total: 0,
            entries: 0,
        }
    }

    fn count(&mut self) -> Result<(), ArchiveError> {
        self.entries += 1;
        if self.entries > self.limits.max_entries {
            return Err(ArchiveError::TooManyEntries {
                max: self.limits.max_entries,
            });
        }
        Ok(())
    }

    fn add(&mut self, name: &str, size: u64) -> Result<(), ArchiveError> {
        if size > self.limits.max_entry_uncompressed {
            return Err(ArchiveError::EntryTooLarge {
                name: name.to_string(),
                size,
                max: self.limits.max_entry_uncompressed,
            });
        }
        self.total = self.total.saturating_add(size);
        if self.total > self.limits.max_total_uncompressed {
            return Err(ArchiveError::TotalSizeTooLarge {
                max: self.limits.max_total_uncompressed,
            });
        }
        Ok(())
    }

    fn check_ratio(&self, name: &str, compressed: u64, size: u64) -> Result<(), ArchiveError> {
        if size == 0 {
            return Ok(());
        }
        let ratio = compressed as f64 / size as f64;
        if ratio < self.limits.min_compression_ratio {
            return Err(ArchiveError::RatioTooLow {
                name: name.to_string(),
                ratio,
                min: self.limits.min_compression_ratio,
            });
        }
        Ok(())
    }
}

fn scan_zip(
    path: &Path,
    limits: &ExtractLimits,
) -> Result<(Vec<ScannedEntry>, usize), ArchiveError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    if archive.len() > limits.max_entries {
        return Err(ArchiveError::TooManyEntries {
            max: limits.max_entries,
        });
    }

    let mut budget = SizeBudget::new(limits);
    let mut scanned = Vec::new();
    let mut skipped = 0;
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        budget.count()?;
        let raw_name = file.name().to_string();
        if file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            debug!(entry = raw_name, "skipping symlink entry");
            skipped += 1;
            continue;
        }

        let size = file.size();
        let compressed = file.compressed_size();
        let is_dir = file.is_dir();
        if !is_dir && size == 0 && compressed > 0 {
            return Err(ArchiveError::InvalidEntry(raw_name));
        }
        budget.add(&raw_name, size)?;
        budget.check_ratio(&raw_name, compressed, size)?;

        match canonical_entry_name(&raw_name)? {
            Some(name) => scanned.push(ScannedEntry {
                index: index as u64,
                name,
                is_dir,
                size,
            }),
            None => skipped += 1,
        }
    }
    Ok((scanned, skipped))
}

/// 统计解压后的字节数，越过上限时报错并置位共享标志。
///
/// tar 在扫描阶段只读头部，但扩展头与跳过的数据仍会流经解压器。
struct CappedReader<R> {
    inner: R,
    remaining: u64,
    exceeded: Rc<Cell<bool>>,
}

impl<R: Read> Read for CappedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            if self.inner.read(&mut [0u8; 1])? == 0 {
                return Ok(0);
            }
            self.exceeded.set(true);
            return Err(io::Error::other(
                "decompressed archive exceeds the size limit",
            ));
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |rest| rest.min(buf.len()));
        let read = self.inner.read(&mut buf[..max])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}

type TarArchive = tar::Archive<CappedReader<Decompressor<File>>>;

/// 解压流的总上限：条目数据总量加上每个条目的固定开销。
fn tar_stream_cap(limits: &ExtractLimits) -> u64 {
    let entries = u64::try_from(limits.max_entries)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    limits
        .max_total_uncompressed
        .saturating_add(entries.saturating_mul(TAR_ENTRY_OVERHEAD))
}

fn open_tar(
    path: &Path,
    format: ArchiveFormat,
    limits: &ExtractLimits,
) -> io::Result<(TarArchive, Rc<Cell<bool>>)> {
    let exceeded = Rc::new(Cell::new(false));
    let reader = CappedReader {
        inner: Decompressor::new(format, File::open(path)?),
        remaining: tar_stream_cap(limits),
        exceeded: exceeded.clone(),
    };
    Ok((tar::Archive::new(reader), exceeded))
}

/// 解压流越过上限导致的任何错误都按总量超限上报。
fn capped_error(err: ArchiveError, exceeded: &Cell<bool>, limits: &ExtractLimits) -> ArchiveError {
    if exceeded.get() {
        ArchiveError::TotalSizeTooLarge {
            max: limits.max_total_uncompressed,
        }
    } else {
        err
    }
}

fn is_extension_header(kind: tar::EntryType) -> bool {
    kind.is_gnu_longname()
        || kind.is_gnu_longlink()
        || kind.is_pax_local_extensions()
        || kind.is_pax_global_extensions()
}

fn scan_tar(
    path: &Path,
    format: ArchiveFormat,
    archive_size: u64,
    limits: &ExtractLimits,
) -> Result<(Vec<ScannedEntry>, usize), ArchiveError> {
    let (mut archive, exceeded) = open_tar(path, format, limits)?;
    let mut budget = SizeBudget::new(limits);
    let (scanned, skipped) = scan_tar_entries(&mut archive, &mut budget)
        .map_err(|err| capped_error(err, &exceeded, limits))?;

    // tar 条目没有各自的压缩大小，按整个文件计算
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    budget.check_ratio(&name, archive_size, budget.total)?;
    Ok((scanned, skipped))
}

/// 以原始模式遍历，扩展头先按大小校验再读入，随后作用于下一个条目。
fn scan_tar_entries(
    archive: &mut TarArchive,
    budget: &mut SizeBudget<'_>,
) -> Result<(Vec<ScannedEntry>, usize), ArchiveError> {
    let mut scanned = Vec::new();
    let mut skipped = 0;
    let mut long_name: Option<Vec<u8>> = None;
    let mut pax_path: Option<Vec<u8>> = None;
    let mut pax_size: Option<u64> = None;

    for entry in archive.entries().map_err(read_error)?.raw(true) {
        let mut entry = entry.map_err(read_error)?;
        let entry_type = entry.header().entry_type();
        if is_extension_header(entry_type) {
            let size = entry.header().size().map_err(read_error)?;
            if size > MAX_EXTENSION_SIZE {
                return Err(ArchiveError::InvalidEntry(format!(
                    "{entry_type:?} header of {size} bytes"
                )));
            }
            if entry_type.is_gnu_longname() {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(read_error)?;
                while data.last() == Some(&0) {
                    data.pop();
                }
                long_name = Some(data);
            } else if entry_type.is_pax_local_extensions() {
                if let Some(extensions) = entry.pax_extensions().map_err(read_error)? {
                    for extension in extensions {
                        let extension = extension.map_err(read_error)?;
                        match extension.key() {
                            Ok("path") => pax_path = Some(extension.value_bytes().to_vec()),
                            Ok("size") => {
                                pax_size = extension.value().ok().and_then(|v| v.parse().ok());
                            }
                            _ => {}
                        }
                    }
                }
            }
            continue;
        }

        let position = entry.raw_header_position();
        let name_bytes = long_name.take();
        let pax_name = pax_path.take();
        let declared = pax_size.take();
        budget.count()?;
        let raw_name = match name_bytes.or(pax_name) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
        };
        let is_dir = entry_type.is_dir();
        if !is_dir && !entry_type.is_file() && entry_type != tar::EntryType::Continuous {
            debug!(entry = raw_name, kind = ?entry_type, "skipping non-regular tar entry");
            skipped += 1;
            continue;
        }

        let size = match (is_dir, declared) {
            (true, _) => 0,
            (false, Some(size)) => size,
            (false, None) => entry.header().size().map_err(read_error)?,
        };
        budget.add(&raw_name, size)?;
        match canonical_entry_name(&raw_name)? {
            Some(name) => scanned.push(ScannedEntry {
                index: position,
                name,
                is_dir,
                size,
            }),
            None => skipped += 1,
        }
    }
    Ok((scanned, skipped))
}

/// 读取归档时的格式类错误视为归档损坏。
fn read_error(err: io::Error) -> ArchiveError {
    match err.kind() {
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            ArchiveError::Corrupt(err.to_string())
        }
        _ => ArchiveError::Io(err),
    }
}

async fn plan_entries(
    session: &Session,
    destination: &str,
    scanned: Vec<ScannedEntry>,
    summary: &mut ExtractSummary,
) -> Result<Vec<PlannedEntry>, ArchiveError> {
    let mut planned = Vec::with_capacity(scanned.len());
    for entry in scanned {
        let virtual_path = join_virtual(destination, &entry.name);
        if !session.check(&virtual_path) {
            debug!(path = virtual_path, "archive entry denied by rules");
            summary.skipped += 1;
            continue;
        }
        let real = session
            .storage
            .resolve_path_checked(&virtual_path, true)
            .await?;
        planned.push(PlannedEntry {
            index: entry.index,
            name: entry.name,
            real,
            is_dir: entry.is_dir,
            size: entry.size,
        });
    }
    Ok(planned)
}

fn write_zip(
    path: &Path,
    planned: &[PlannedEntry],
    overwrite: bool,
    max_entry: u64,
    summary: &mut ExtractSummary,
) -> Result<(), ArchiveError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    for entry in planned {
        if entry.is_dir {
            create_directory(entry, summary)?;
            continue;
        }
        if !prepare_file(entry, overwrite, summary)? {
            continue;
        }
        let mut reader = archive.by_index(entry.index as usize)?;
        copy_entry(&mut reader, entry, max_entry)?;
        summary.files += 1;
    }
    Ok(())
}

fn write_tar(
    path: &Path,
    format: ArchiveFormat,
    planned: &[PlannedEntry],
    overwrite: bool,
    limits: &ExtractLimits,
    summary: &mut ExtractSummary,
) -> Result<(), ArchiveError> {
    let (mut archive, exceeded) = open_tar(path, format, limits)?;
    write_tar_entries(
        &mut archive,
        planned,
        overwrite,
        limits.max_entry_uncompressed,
        summary,
    )
    .map_err(|err| capped_error(err, &exceeded, limits))
}

/// 按头部位置匹配扫描阶段记录的条目，长名与 PAX 扩展由 tar 自行合并。
fn write_tar_entries(
    archive: &mut TarArchive,
    planned: &[PlannedEntry],
    overwrite: bool,
    max_entry: u64,
    summary: &mut ExtractSummary,
) -> Result<(), ArchiveError> {
    let mut pending = planned.iter().peekable();
    for entry in archive.entries().map_err(read_error)? {
        let Some(next) = pending.peek() else {
            break;
        };
        let mut reader = entry.map_err(read_error)?;
        if reader.raw_header_position() != next.index {
            continue;
        }
        let target = *next;
        pending.next();

        if target.is_dir {
            create_directory(target, summary)?;
        } else if prepare_file(target, overwrite, summary)? {
            copy_entry(&mut reader, target, max_entry)?;
            summary.files += 1;
        }
    }
    Ok(())
}

fn create_directory(entry: &PlannedEntry, summary: &mut ExtractSummary) -> Result<(), ArchiveError> {
    match std::fs::symlink_metadata(&entry.real) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            warn!(entry = entry.name, "directory entry collides with an existing file");
            summary.skipped += 1;
            return Ok(());
        }
        Err(err) if err.kind() == ErrorKind::NotFound => std::fs::create_dir_all(&entry.real)?,
        Err(err) => return Err(err.into()),
    }
    summary.directories += 1;
    Ok(())
}

/// 判断文件条目是否需要写入，并创建父目录。
fn prepare_file(
    entry: &PlannedEntry,
    overwrite: bool,
    summary: &mut ExtractSummary,
) -> Result<bool, ArchiveError> {
    match std::fs::symlink_metadata(&entry.real) {
        Ok(metadata) if metadata.is_dir() || metadata.file_type().is_symlink() => {
            warn!(entry = entry.name, "file entry collides with a directory or link");
            summary.skipped += 1;
            return Ok(false);
        }
        Ok(_) if !overwrite => {
            debug!(entry = entry.name, "keeping existing file");
            summary.skipped += 1;
            return Ok(false);
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    if let Some(parent) = entry.real.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(true)
}

/// 最多读取声明大小加一个字节；实际数据超过声明大小时删除半成品并报错。
fn copy_entry<R: Read>(
    reader: &mut R,
    entry: &PlannedEntry,
    max_entry: u64,
) -> Result<(), ArchiveError> {
    let limit = entry.size.min(max_entry).saturating_add(1);
    let mut out = File::create(&entry.real)?;
    let copied = io::copy(&mut reader.by_ref().take(limit), &mut out).map_err(read_error)?;
    if copied > entry.size {
        drop(out);
        if let Err(err) = std::fs::remove_file(&entry.real) {
            warn!(entry = entry.name, error = %err, "failed to remove oversized entry");
        }
        return Err(ArchiveError::InvalidEntry(entry.name.clone()));
    }
    Ok(())
}
