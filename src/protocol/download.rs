use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{decomposition_failure, transport_failure, TransferResult};
use crate::model::{BlobTransfer, BlockTransfer, TransferId};
use crate::transport::{get_range_request, probe_request, ReqwestTransport};
use crate::queue::WorkUnit;

use super::Decomposition;

/// Probes the remote object's size, then splits it into `chunk_size`-sized ranged-GET units
/// writing into the local destination file, plus a finalize unit verifying the assembled file
/// size (spec §4.2, §6: download direction).
pub async fn decompose(
    blob: &BlobTransfer,
    chunk_size: u64,
    transport: Arc<ReqwestTransport>,
) -> TransferResult<Decomposition> {
    let probe = transport
        .execute(probe_request(&blob.source, Duration::from_secs(30)))
        .await?;
    if !probe.exists {
        return Err(transport_failure(format!(
            "remote object '{}' does not exist",
            blob.source
        )));
    }
    let total_size = probe
        .total_size
        .ok_or_else(|| transport_failure("probe did not report a content size"))?;

    let local_path = PathBuf::from(&blob.destination);
    let temp_path = temp_path_for(&local_path);
    preallocate(&temp_path, total_size).await?;

    let mut blocks = Vec::new();
    let mut units: Vec<Arc<dyn WorkUnit>> = Vec::new();
    let mut child_ids = Vec::new();

    let mut offset = 0u64;
    while offset < total_size || total_size == 0 {
        let end = (offset + chunk_size).min(total_size);
        let child_id = format!("{}-block-{}", blob.id, blocks.len());

        blocks.push(BlockTransfer::new(child_id.clone(), blob.id.clone(), offset, end));
        child_ids.push(child_id.clone());

        units.push(Arc::new(DownloadBlockUnit {
            id: child_id,
            transport: Arc::clone(&transport),
            endpoint_url: blob.source.clone(),
            temp_path: temp_path.clone(),
            start: offset,
            end,
            timeout: Duration::from_secs(120),
        }));

        offset = end;
        if total_size == 0 {
            break;
        }
    }

    let finalize_id = format!("{}-finalize", blob.id);
    units.push(Arc::new(DownloadFinalizeUnit {
        id: finalize_id,
        depends_on: child_ids,
        temp_path,
        local_path,
        expected_size: total_size,
    }));

    Ok(Decomposition { units, blocks })
}

/// Rebuilds the work units for `blob` from already-persisted `BlockTransfer` records instead of
/// re-probing the remote object (spec §4.5: once `initialCallComplete` is true, resume never
/// redoes the probe). The `.part` file is re-preallocated defensively — a no-op if it already
/// has the right size — in case it was removed between runs.
pub async fn units_from_blocks(
    blob: &BlobTransfer,
    blocks: &[BlockTransfer],
    transport: Arc<ReqwestTransport>,
) -> TransferResult<Decomposition> {
    let mut ordered = blocks.to_vec();
    ordered.sort_by_key(|block| block.start_range);
    let total_size = ordered.last().map(|block| block.end_range).unwrap_or(0);

    let local_path = PathBuf::from(&blob.destination);
    let temp_path = temp_path_for(&local_path);
    preallocate(&temp_path, total_size).await?;

    let mut units: Vec<Arc<dyn WorkUnit>> = Vec::new();
    let mut child_ids = Vec::new();

    for block in &ordered {
        child_ids.push(block.id.clone());
        units.push(Arc::new(DownloadBlockUnit {
            id: block.id.clone(),
            transport: Arc::clone(&transport),
            endpoint_url: blob.source.clone(),
            temp_path: temp_path.clone(),
            start: block.start_range,
            end: block.end_range,
            timeout: Duration::from_secs(120),
        }));
    }

    let finalize_id = format!("{}-finalize", blob.id);
    units.push(Arc::new(DownloadFinalizeUnit {
        id: finalize_id,
        depends_on: child_ids,
        temp_path,
        local_path,
        expected_size: total_size,
    }));

    Ok(Decomposition { units, blocks: ordered })
}

/// Destination writes land in a sibling `.part` file so a crash or a canceled transfer never
/// leaves a partially-overwritten file at the path the caller expects to read (spec §4.5:
/// "atomic rename from a temp path on success"). Re-downloading a block overwrites the same
/// offset in this same temp file, so resumption after a restart is idempotent.
fn temp_path_for(path: &PathBuf) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

async fn preallocate(path: &PathBuf, size: u64) -> TransferResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| decomposition_failure(format!("cannot create destination dir: {err}")))?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|err| decomposition_failure(format!("cannot open destination file: {err}")))?;
    file.set_len(size)
        .await
        .map_err(|err| decomposition_failure(format!("cannot preallocate destination file: {err}")))?;
    Ok(())
}

struct DownloadBlockUnit {
    id: TransferId,
    transport: Arc<ReqwestTransport>,
    endpoint_url: String,
    temp_path: PathBuf,
    start: u64,
    end: u64,
    timeout: Duration,
}

#[async_trait]
impl WorkUnit for DownloadBlockUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn depends_on(&self) -> &[String] {
        &[]
    }

    async fn execute(&self) -> TransferResult<()> {
        let request = get_range_request(&self.endpoint_url, self.start, self.end, self.timeout);
        let bytes = self.transport.execute(request).await?;

        // Re-downloading a block (after a pause/resume or retry) overwrites the same offset,
        // so this write is idempotent regardless of how many times it runs.
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.temp_path)
            .await
            .map_err(|err| decomposition_failure(format!("cannot open destination file: {err}")))?;
        file.seek(SeekFrom::Start(self.start))
            .await
            .map_err(|err| decomposition_failure(format!("cannot seek destination file: {err}")))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| decomposition_failure(format!("cannot write destination file: {err}")))?;
        Ok(())
    }
}

struct DownloadFinalizeUnit {
    id: TransferId,
    depends_on: Vec<String>,
    temp_path: PathBuf,
    local_path: PathBuf,
    expected_size: u64,
}

#[async_trait]
impl WorkUnit for DownloadFinalizeUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    async fn execute(&self) -> TransferResult<()> {
        let metadata = tokio::fs::metadata(&self.temp_path)
            .await
            .map_err(|err| decomposition_failure(format!("cannot stat destination file: {err}")))?;
        if metadata.len() != self.expected_size {
            return Err(decomposition_failure(format!(
                "destination file size {} does not match expected {}",
                metadata.len(),
                self.expected_size
            )));
        }
        tokio::fs::rename(&self.temp_path, &self.local_path)
            .await
            .map_err(|err| decomposition_failure(format!("cannot commit destination file: {err}")))?;
        Ok(())
    }
}
