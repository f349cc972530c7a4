//! Send direction: process stdout into a multipart upload.

use crate::store::{BackupStore, CompletedPart};
use crate::transfer::Throughput;
use crate::utils::errors::{Result, ShipError};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, info};

pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Multipart part-count ceiling of the store.
pub const MAX_PARTS: u64 = 10_000;
pub const MAX_PART_SIZE: u64 = i32::MAX as u64;

/// Part size that keeps an upload of `expected_size` bytes within the part
/// count limit.
pub fn part_size_for(expected_size: u64) -> Result<usize> {
    let required = MIN_PART_SIZE.max(expected_size.div_ceil(MAX_PARTS));
    if required > MAX_PART_SIZE {
        return Err(ShipError::ChunkTooLarge {
            required,
            max: MAX_PART_SIZE,
        });
    }
    usize::try_from(required).map_err(|_| ShipError::ChunkTooLarge {
        required,
        max: usize::MAX as u64,
    })
}

/// Read until `buf` is full or the stream ends.
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Upload `stdout` part by part, then complete the upload once the process
/// has exited with status 0.
pub(crate) async fn pump_send<R>(
    store: &BackupStore,
    key: &str,
    upload_id: &str,
    mut stdout: R,
    part_size: usize,
    mut exit_rx: watch::Receiver<Option<i32>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut throughput = Throughput::new();
    let mut parts = Vec::new();
    let mut part_number = 1u32;

    loop {
        let mut buf = vec![0u8; part_size];
        let filled = read_chunk(&mut stdout, &mut buf).await?;
        if filled == 0 && !parts.is_empty() {
            break;
        }
        buf.truncate(filled);
        let etag = store
            .upload_part(key, upload_id, part_number, Bytes::from(buf))
            .await?;
        debug!("Uploaded part {} of {} ({} bytes)", part_number, key, filled);
        parts.push(CompletedPart { part_number, etag });
        throughput.add_part(filled);
        part_number += 1;
        if filled < part_size {
            break;
        }
    }

    let status = *exit_rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ShipError::Daemon(format!("no exit status for {key}")))?;
    let code = status.unwrap_or(-1);
    if code != 0 {
        return Err(ShipError::Daemon(format!(
            "send command for {key} exited with status {code}"
        )));
    }

    store.complete_multipart(key, upload_id, parts).await?;
    info!(
        "Shipped {}: {} in {} part(s)",
        key,
        throughput.summary(),
        throughput.parts()
    );
    Ok(())
}
