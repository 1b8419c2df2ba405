//! 无需 Seek 的 zip 写出。
//!
//! 每个条目先写本地头（大小与 CRC 置零并设置数据描述符标志），数据之后紧跟
//! 数据描述符；中央目录在 `finish` 时一次写出。超过 4 GiB 的条目、偏移或条目数
//! 使用 zip64 扩展。

use flate2::Crc;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::{self, ErrorKind, Read, Write};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_END_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const END_SIG: u32 = 0x0605_4b50;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;
const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// 高字节 3 表示 unix，外部属性的高 16 位为文件模式。
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_ZIP64;
/// 1980-01-01 00:00。
const DOS_TIME: u16 = 0;
const DOS_DATE: u16 = 0x21;

const U32_LIMIT: u64 = u32::MAX as u64;
const U16_LIMIT: usize = u16::MAX as usize;
const FILE_MODE: u32 = 0o100644;
const DIR_MODE: u32 = 0o040755;
const DOS_DIR_ATTR: u32 = 0x10;
const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflated,
}

impl Method {
    fn code(self) -> u16 {
        match self {
            Method::Stored => 0,
            Method::Deflated => 8,
        }
    }
}

#[derive(Debug)]
struct CentralRecord {
    name: String,
    method: u16,
    crc: u32,
    compressed: u64,
    size: u64,
    offset: u64,
    external: u32,
    zip64: bool,
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// 顺序写出 zip 归档，输出端只需实现 [`Write`]。
pub struct ZipStreamWriter<W: Write> {
    out: CountingWriter<W>,
    records: Vec<CentralRecord>,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: CountingWriter {
                inner: out,
                written: 0,
            },
            records: Vec::new(),
        }
    }

    /// 写入目录条目，名称自动补上结尾的 `/`。
    pub fn add_directory(&mut self, name: &str) -> io::Result<()> {
        let name = if name.ends_with('/') {
            name.to_string()
        } else {
            format!("{name}/")
        };
        self.add_entry(
            name,
            Method::Stored,
            false,
            (DIR_MODE << 16) | DOS_DIR_ATTR,
            &mut io::empty(),
        )
    }

    /// 写入文件条目；`large` 为真时本地头携带 zip64 扩展，允许超过 4 GiB。
    pub fn add_file<R: Read>(
        &mut self,
        name: &str,
        method: Method,
        large: bool,
        reader: &mut R,
    ) -> io::Result<()> {
        self.add_entry(name.to_string(), method, large, FILE_MODE << 16, reader)
    }

    fn add_entry<R: Read>(
        &mut self,
        name: String,
        method: Method,
        large: bool,
        external: u32,
        reader: &mut R,
    ) -> io::Result<()> {
        if name.len() > U16_LIMIT {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "entry name is too long for zip",
            ));
        }
        let offset = self.out.written;
        self.out
            .write_all(&local_header(&name, method.code(), large))?;

        let start = self.out.written;
        let mut crc = Crc::new();
        let size = match method {
            Method::Stored => copy_with_crc(reader, &mut self.out, &mut crc)?,
            Method::Deflated => {
                let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
                let size = copy_with_crc(reader, &mut encoder, &mut crc)?;
                encoder.finish()?;
                size
            }
        };
        let compressed = self.out.written - start;
        if !large && (size >= U32_LIMIT || compressed >= U32_LIMIT) {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("entry `{name}` exceeds 4 GiB without zip64"),
            ));
        }

        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc.sum());
        if large {
            put_u64(&mut descriptor, compressed);
            put_u64(&mut descriptor, size);
        } else {
            put_u32(&mut descriptor, compressed as u32);
            put_u32(&mut descriptor, size as u32);
        }
        self.out.write_all(&descriptor)?;

        self.records.push(CentralRecord {
            name,
            method: method.code(),
            crc: crc.sum(),
            compressed,
            size,
            offset,
            external,
            zip64: large,
        });
        Ok(())
    }

    /// 写出中央目录与结束记录，返回底层输出。
    pub fn finish(mut self) -> io::Result<W> {
        let directory_offset = self.out.written;
        for record in &self.records {
            self.out.write_all(&central_header(record))?;
        }
        let directory_size = self.out.written - directory_offset;
        let count = self.records.len();

        let needs_zip64 = count >= U16_LIMIT
            || directory_offset >= U32_LIMIT
            || directory_size >= U32_LIMIT;
        let mut tail = Vec::with_capacity(98);
        if needs_zip64 {
            let zip64_offset = self.out.written;
            put_u32(&mut tail, ZIP64_END_SIG);
            put_u64(&mut tail, 44);
            put_u16(&mut tail, VERSION_MADE_BY);
            put_u16(&mut tail, VERSION_ZIP64);
            put_u32(&mut tail, 0);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, count as u64);
            put_u64(&mut tail, count as u64);
            put_u64(&mut tail, directory_size);
            put_u64(&mut tail, directory_offset);

            put_u32(&mut tail, ZIP64_LOCATOR_SIG);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, zip64_offset);
            put_u32(&mut tail, 1);
        }

        let short_count = count.min(U16_LIMIT) as u16;
        put_u32(&mut tail, END_SIG);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, short_count);
        put_u16(&mut tail, short_count);
        put_u32(&mut tail, directory_size.min(U32_LIMIT) as u32);
        put_u32(&mut tail, directory_offset.min(U32_LIMIT) as u32);
        put_u16(&mut tail, 0);
        self.out.write_all(&tail)?;
        self.out.flush()?;
        Ok(self.out.inner)
    }
}

fn copy_with_crc<R: Read, W: Write>(reader: &mut R, out: &mut W, crc: &mut Crc) -> io::Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        crc.update(&buffer[..read]);
        out.write_all(&buffer[..read])?;
        total += read as u64;
    }
}

fn local_header(name: &str, method: u16, large: bool) -> Vec<u8> {
    let mut header = Vec::with_capacity(30 + name.len() + 20);
    put_u32(&mut header, LOCAL_HEADER_SIG);
    put_u16(&mut header, if large { VERSION_ZIP64 } else { VERSION_DEFAULT });
    put_u16(&mut header, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
    put_u16(&mut header, method);
    put_u16(&mut header, DOS_TIME);
    put_u16(&mut header, DOS_DATE);
    put_u32(&mut header, 0);
    if large {
        put_u32(&mut header, u32::MAX);
        put_u32(&mut header, u32::MAX);
    } else {
        put_u32(&mut header, 0);
        put_u32(&mut header, 0);
    }
    put_u16(&mut header, name.len() as u16);
    put_u16(&mut header, if large { 20 } else { 0 });
    header.extend_from_slice(name.as_bytes());
    if large {
        put_u16(&mut header, ZIP64_EXTRA_ID);
        put_u16(&mut header, 16);
        put_u64(&mut header, 0);
        put_u64(&mut header, 0);
    }
    header
}

fn central_header(record: &CentralRecord) -> Vec<u8> {
    // zip64 扩展只携带溢出的字段，顺序固定为原始大小、压缩大小、偏移
    let mut extra = Vec::new();
    if record.size >= U32_LIMIT {
        put_u64(&mut extra, record.size);
    }
    if record.compressed >= U32_LIMIT {
        put_u64(&mut extra, record.compressed);
    }
    if record.offset >= U32_LIMIT {
        put_u64(&mut extra, record.offset);
    }
    let needs_zip64 = record.zip64 || !extra.is_empty();

    let mut header = Vec::with_capacity(46 + record.name.len() + 4 + extra.len());
    put_u32(&mut header, CENTRAL_HEADER_SIG);
    put_u16(&mut header, VERSION_MADE_BY);
    put_u16(
        &mut header,
        if needs_zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT },
    );
    put_u16(&mut header, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
    put_u16(&mut header, record.method);
    put_u16(&mut header, DOS_TIME);
    put_u16(&mut header, DOS_DATE);
    put_u32(&mut header, record.crc);
    put_u32(&mut header, record.compressed.min(U32_LIMIT) as u32);
    put_u32(&mut header, record.size.min(U32_LIMIT) as u32);
    put_u16(&mut header, record.name.len() as u16);
    put_u16(
        &mut header,
        if extra.is_empty() { 0 } else { 4 + extra.len() as u16 },
    );
    put_u16(&mut header, 0);
    put_u16(&mut header, 0);
    put_u16(&mut header, 0);
    put_u32(&mut header, record.external);
    put_u32(&mut header, record.offset.min(U32_LIMIT) as u32);
    header.extend_from_slice(record.name.as_bytes());
    if !extra.is_empty() {
        put_u16(&mut header, ZIP64_EXTRA_ID);
        put_u16(&mut header, extra.len() as u16);
        header.extend_from_slice(&extra);
    }
    header
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// 只实现 Write 的输出端，并记录每次写入的大小。
    struct WriteOnly {
        bytes: Vec<u8>,
        writes: usize,
    }

    impl Write for WriteOnly {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn read_back(bytes: Vec<u8>) -> zip::ZipArchive<Cursor<Vec<u8>>> {
        zip::ZipArchive::new(Cursor::new(bytes)).expect("open zip")
    }

    #[test]
    fn entries_written_without_seek_read_back() {
        let mut writer = ZipStreamWriter::new(WriteOnly {
            bytes: Vec::new(),
            writes: 0,
        });
        writer.add_directory("docs").expect("dir");
        let text = "hello zip ".repeat(500);
        writer
            .add_file("docs/a.txt", Method::Deflated, false, &mut text.as_bytes())
            .expect("deflated");
        writer
            .add_file("empty.txt", Method::Stored, false, &mut io::empty())
            .expect("empty");
        writer
            .add_file("big-flag.bin", Method::Stored, true, &mut &b"raw"[..])
            .expect("zip64 entry");
        writer
            .add_file("名字.txt", Method::Deflated, false, &mut &b"utf8"[..])
            .expect("utf8 name");
        let out = writer.finish().expect("finish");
        assert!(out.writes > 0);

        let mut archive = read_back(out.bytes);
        assert_eq!(archive.len(), 5);

        let dir = archive.by_name("docs/").expect("dir entry");
        assert!(dir.is_dir());
        assert_eq!(dir.unix_mode(), Some(DIR_MODE));
        drop(dir);

        let mut file = archive.by_name("docs/a.txt").expect("file entry");
        assert_eq!(file.size(), text.len() as u64);
        assert!(file.compressed_size() < file.size());
        assert_eq!(file.unix_mode(), Some(FILE_MODE));
        let mut content = String::new();
        file.read_to_string(&mut content).expect("read");
        assert_eq!(content, text);
        drop(file);

        for (name, expected) in [
            ("empty.txt", &b""[..]),
            ("big-flag.bin", &b"raw"[..]),
            ("名字.txt", &b"utf8"[..]),
        ] {
            let mut file = archive
                .by_name(name)
                .unwrap_or_else(|_| panic!("missing {name}"));
            let mut content = Vec::new();
            file.read_to_end(&mut content).expect("read");
            assert_eq!(content, expected, "{name}");
        }
    }

    #[test]
    fn many_entries_switch_to_zip64_end_records() {
        let count = U16_LIMIT + 3;
        let mut writer = ZipStreamWriter::new(Vec::new());
        for index in 0..count {
            writer
                .add_file(&format!("f{index}"), Method::Stored, false, &mut io::empty())
                .expect("entry");
        }
        let bytes = writer.finish().expect("finish");
        let zip64_end = ZIP64_END_SIG.to_le_bytes();
        assert!(bytes.windows(4).any(|window| window == zip64_end));

        let archive = read_back(bytes);
        assert_eq!(archive.len(), count);
    }
}
