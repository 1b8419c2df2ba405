//! 归档格式表：扩展名、查询参数与压缩编解码器。

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::ArchiveError;

const XZ_PRESET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarLz4,
    TarSz,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 7] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Tar,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarBz2,
        ArchiveFormat::TarXz,
        ArchiveFormat::TarLz4,
        ArchiveFormat::TarSz,
    ];

    /// 解析 `algo` 查询参数；`zip`、`true` 与空值均表示 zip。
    pub fn from_query(algo: &str) -> Result<Self, ArchiveError> {
        match algo {
            "zip" | "true" | "" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "targz" => Ok(ArchiveFormat::TarGz),
            "tarbz2" => Ok(ArchiveFormat::TarBz2),
            "tarxz" => Ok(ArchiveFormat::TarXz),
            "tarlz4" => Ok(ArchiveFormat::TarLz4),
            "tarsz" => Ok(ArchiveFormat::TarSz),
            other => Err(ArchiveError::UnknownFormat(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::TarBz2 => ".tar.bz2",
            ArchiveFormat::TarXz => ".tar.xz",
            ArchiveFormat::TarLz4 => ".tar.lz4",
            ArchiveFormat::TarSz => ".tar.sz",
        }
    }

    /// 按文件名后缀识别格式（大小写不敏感），取最长匹配。
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tgz") {
            return Some(ArchiveFormat::TarGz);
        }
        Self::ALL
            .into_iter()
            .filter(|format| lower.ends_with(format.extension()))
            .max_by_key(|format| format.extension().len())
    }
}

/// tar 外层的压缩写入器，`Plain` 用于未压缩的 tar 与 zip。
pub enum Compressor<W: Write> {
    Plain(W),
    Gz(GzEncoder<W>),
    Bz2(BzEncoder<W>),
    Xz(XzEncoder<W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Sz(snap::write::FrameEncoder<W>),
}

impl<W: Write> Compressor<W> {
    pub fn new(format: ArchiveFormat, inner: W) -> Self {
        match format {
            ArchiveFormat::Zip | ArchiveFormat::Tar => Compressor::Plain(inner),
            ArchiveFormat::TarGz => {
                Compressor::Gz(GzEncoder::new(inner, flate2::Compression::default()))
            }
            ArchiveFormat::TarBz2 => {
                Compressor::Bz2(BzEncoder::new(inner, bzip2::Compression::default()))
            }
            ArchiveFormat::TarXz => Compressor::Xz(XzEncoder::new(inner, XZ_PRESET)),
            ArchiveFormat::TarLz4 => Compressor::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
            ArchiveFormat::TarSz => Compressor::Sz(snap::write::FrameEncoder::new(inner)),
        }
    }

    /// 写出压缩尾部并取回内部写入器。
    pub fn finish(self) -> io::Result<W> {
        match self {
            Compressor::Plain(inner) => Ok(inner),
            Compressor::Gz(encoder) => encoder.finish(),
            Compressor::Bz2(encoder) => encoder.finish(),
            Compressor::Xz(encoder) => encoder.finish(),
            Compressor::Lz4(encoder) => encoder.finish().map_err(io::Error::other),
            Compressor::Sz(mut encoder) => {
                encoder.flush()?;
                encoder
                    .into_inner()
                    .map_err(|err| io::Error::new(err.error().kind(), err.error().to_string()))
            }
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(inner) => inner.write(buf),
            Compressor::Gz(encoder) => encoder.write(buf),
            Compressor::Bz2(encoder) => encoder.write(buf),
            Compressor::Xz(encoder) => encoder.write(buf),
            Compressor::Lz4(encoder) => encoder.write(buf),
            Compressor::Sz(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(inner) => inner.flush(),
            Compressor::Gz(encoder) => encoder.flush(),
            Compressor::Bz2(encoder) => encoder.flush(),
            Compressor::Xz(encoder) => encoder.flush(),
            Compressor::Lz4(encoder) => encoder.flush(),
            Compressor::Sz(encoder) => encoder.flush(),
        }
    }
}

pub enum Decompressor<R: Read> {
    Plain(R),
    Gz(GzDecoder<R>),
    Bz2(BzDecoder<R>),
    Xz(XzDecoder<R>),
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    Sz(snap::read::FrameDecoder<R>),
}

impl<R: Read> Decompressor<R> {
    pub fn new(format: ArchiveFormat, inner: R) -> Self {
        match format {
            ArchiveFormat::Zip | ArchiveFormat::Tar => Decompressor::Plain(inner),
            ArchiveFormat::TarGz => Decompressor::Gz(GzDecoder::new(inner)),
            ArchiveFormat::TarBz2 => Decompressor::Bz2(BzDecoder::new(inner)),
            ArchiveFormat::TarXz => Decompressor::Xz(XzDecoder::new(inner)),
            ArchiveFormat::TarLz4 => Decompressor::Lz4(lz4_flex::frame::FrameDecoder::new(inner)),
            ArchiveFormat::TarSz => Decompressor::Sz(snap::read::FrameDecoder::new(inner)),
        }
    }
}

impl<R: Read> Read for Decompressor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decompressor::Plain(inner) => inner.read(buf),
            Decompressor::Gz(decoder) => decoder.read(buf),
            Decompressor::Bz2(decoder) => decoder.read(buf),
            Decompressor::Xz(decoder) => decoder.read(buf),
            Decompressor::Lz4(decoder) => decoder.read(buf),
            Decompressor::Sz(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_map_to_formats() {
        assert_eq!(ArchiveFormat::from_query("").ok(), Some(ArchiveFormat::Zip));
        assert_eq!(
            ArchiveFormat::from_query("true").ok(),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_query("tarbz2").ok(),
            Some(ArchiveFormat::TarBz2)
        );
        assert!(matches!(
            ArchiveFormat::from_query("tarzst"),
            Err(ArchiveError::UnknownFormat(name)) if name == "tarzst"
        ));
    }

    #[test]
    fn file_names_pick_the_longest_suffix() {
        assert_eq!(
            ArchiveFormat::from_file_name("backup.TAR.GZ"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_file_name("a.tar"),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(
            ArchiveFormat::from_file_name("x.tgz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_file_name("photos.zip"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::from_file_name("notes.txt"), None);
    }
}
