//! Archive streamer - job ディレクトリを ZIP としてシンクへ書き出す
//!
//! # 決定性
//! - エントリはジョブ root からの相対パス（`/` 区切り）の辞書順
//! - タイムスタンプ・パーミッション・圧縮方式は固定
//!
//! 変更のないディレクトリからは毎回バイト単位で同一のアーカイブが得られます。
//!
//! # ストリーミング
//! まず blocking プールでファイル一覧を集め、続いて ZIP エンコーダ（同期）が
//! エンコード済みのチャンクを bounded channel 経由で非同期シンクへ渡します。
//! シンクが遅ければエンコードも待たされ、シンクへの書き込みが失敗すれば
//! （クライアント切断など）エンコードは中断されます。
//!
//! `ArchiveMode::Streaming` では、途中で失敗した時点で壊れたアーカイブの一部が
//! すでにシンクへ届いている可能性があります。`ArchiveMode::Buffered` は
//! `root/tmp` にスプールしてから送るので、シンクには完全なアーカイブしか届きません。

use std::fs::File as StdFile;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::atomic_write::staging_file;
use crate::config::ArchiveMode;
use crate::domain::{ArchiveSummary, StoreError};

/// Size of the chunks handed from the encoder to the sink.
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between encoder and sink.
const CHANNEL_DEPTH: usize = 4;

const ENTRY_MODE: u32 = 0o644;

/// A regular file found under the job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchiveFile {
    /// Entry name: relative path, `/`-separated.
    name: String,
    path: PathBuf,
    len: u64,
}

/// `StreamArchive`: write a ZIP of `job_dir` into `sink`.
///
/// Fails with [`StoreError::NotFound`] before writing anything if `job_dir`
/// is missing or not a directory.
pub async fn stream_archive<W>(
    job_dir: &Path,
    staging_dir: &Path,
    sink: &mut W,
    mode: ArchiveMode,
) -> Result<ArchiveSummary, StoreError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let meta = fs::metadata(job_dir)
        .await
        .map_err(StoreError::lookup("stat job dir", job_dir))?;
    if !meta.is_dir() {
        return Err(StoreError::NotFound(job_dir.to_path_buf()));
    }

    let dir = job_dir.to_path_buf();
    let files = task::spawn_blocking(move || collect_files(&dir))
        .await
        .map_err(|join| StoreError::io("walk job dir", job_dir)(io::Error::other(join)))?
        .map_err(StoreError::io("walk job dir", job_dir))?;

    archive_files(job_dir, files, staging_dir, sink, mode).await
}

async fn archive_files<W>(
    job_dir: &Path,
    files: Vec<ArchiveFile>,
    staging_dir: &Path,
    sink: &mut W,
    mode: ArchiveMode,
) -> Result<ArchiveSummary, StoreError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match mode {
        ArchiveMode::Streaming => stream_direct(job_dir, files, sink).await,
        ArchiveMode::Buffered => stream_spooled(job_dir, files, staging_dir, sink).await,
    }
}

async fn stream_direct<W>(
    job_dir: &Path,
    files: Vec<ArchiveFile>,
    sink: &mut W,
) -> Result<ArchiveSummary, StoreError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let encoder = task::spawn_blocking(move || encode(&files, ChannelWriter::new(tx)));

    let mut bytes = 0u64;
    let mut sink_error = None;
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = sink.write_all(&chunk).await {
            sink_error = Some(err);
            break;
        }
        bytes += chunk.len() as u64;
    }
    // 受信側を閉じて、エンコーダ側の blocking_send を失敗させる
    drop(rx);

    let encoded = encoder
        .await
        .map_err(|join| StoreError::io("encode archive", job_dir)(io::Error::other(join)))?;

    if let Some(err) = sink_error {
        debug!(job_dir = %job_dir.display(), bytes, "archive sink failed; encoding aborted");
        return Err(StoreError::io("write archive", job_dir)(err));
    }
    let entries = encoded.map_err(StoreError::io("encode archive", job_dir))?;

    sink.flush()
        .await
        .map_err(StoreError::io("write archive", job_dir))?;

    Ok(ArchiveSummary { entries, bytes })
}

async fn stream_spooled<W>(
    job_dir: &Path,
    files: Vec<ArchiveFile>,
    staging_dir: &Path,
    sink: &mut W,
) -> Result<ArchiveSummary, StoreError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    fs::create_dir_all(staging_dir)
        .await
        .map_err(StoreError::io("create staging dir", staging_dir))?;
    let mut spool = staging_file(staging_dir, "zip_")
        .await
        .map_err(StoreError::io("create archive spool", staging_dir))?;

    // spool はエンコード失敗時にここで drop され、シンクには何も届かない
    let (_spool, reader, entries) = task::spawn_blocking(move || {
        let entries = encode(&files, spool.as_file_mut())?;
        let reader = spool.reopen()?;
        Ok::<_, io::Error>((spool, reader, entries))
    })
    .await
    .map_err(|join| StoreError::io("encode archive", job_dir)(io::Error::other(join)))?
    .map_err(StoreError::io("encode archive", job_dir))?;

    let mut reader = File::from_std(reader);
    let bytes = tokio::io::copy(&mut reader, sink)
        .await
        .map_err(StoreError::io("write archive", job_dir))?;
    sink.flush()
        .await
        .map_err(StoreError::io("write archive", job_dir))?;

    Ok(ArchiveSummary { entries, bytes })
}

/// Write `files` into a ZIP on `out`. Returns the number of entries.
fn encode<W: Write>(files: &[ArchiveFile], out: W) -> io::Result<usize> {
    let mut zip = ZipWriter::new_stream(out);

    for file in files {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(ENTRY_MODE)
            .large_file(file.len >= u64::from(u32::MAX));
        zip.start_file(file.name.as_str(), options)
            .map_err(zip_io)?;
        let mut source = StdFile::open(&file.path)?;
        io::copy(&mut source, &mut zip)?;
    }

    let mut out = zip.finish().map_err(zip_io)?;
    out.flush()?;
    Ok(files.len())
}

/// Every regular file under `job_dir`, sorted by entry name. Symlinks are
/// neither followed nor archived.
fn collect_files(job_dir: &Path) -> io::Result<Vec<ArchiveFile>> {
    let mut files = Vec::new();
    let mut pending = vec![(job_dir.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = format!("{prefix}{}", entry.file_name().to_string_lossy());
            if file_type.is_dir() {
                pending.push((entry.path(), format!("{name}/")));
            } else if file_type.is_file() {
                files.push(ArchiveFile {
                    name,
                    path: entry.path(),
                    len: entry.metadata()?.len(),
                });
            }
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn zip_io(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(err) => err,
        other => io::Error::other(other),
    }
}

/// `Write` adapter that batches bytes into [`CHUNK_SIZE`] chunks and hands
/// them to the async side. Must only be used off the async runtime.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive sink closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive sink closed",
            ));
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // finish() 後に flush されていない末尾を送る。送れなくてもシンク側でエラーになる
        let _ = self.send_buffered();
    }
}
