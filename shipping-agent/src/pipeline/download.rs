//! Restore direction: object stream into process stdin.

use crate::store::BackupStore;
use crate::transfer::Throughput;
use crate::utils::errors::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

pub const RESTORE_READ_SIZE: usize = 1024 * 1024;

pub(crate) async fn pump_restore<W>(
    store: &BackupStore,
    key: &str,
    mut stdin: W,
    settle: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = store.get_object(key).await?;
    let mut throughput = Throughput::new();
    let mut buf = vec![0u8; RESTORE_READ_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdin.write_all(&buf[..n]).await?;
        throughput.add(n);
    }
    stdin.flush().await?;
    drop(stdin);

    // Give the receiving command time to materialize the volume.
    tokio::time::sleep(settle).await;
    info!("Restored {}: {}", key, throughput.summary());
    Ok(())
}
