use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{decomposition_failure, TransferResult};
use crate::model::{BlobTransfer, BlockTransfer, TransferId};
use crate::queue::WorkUnit;
use crate::transport::{block_id_for, commit_block_list_request, put_block_request, ReqwestTransport};

use super::Decomposition;

/// Splits `blob`'s local source file into `chunk_size`-sized blocks and builds one
/// [`WorkUnit`] per block plus a finalize unit that commits the block list once every block
/// has landed (spec §4.2, §6: upload direction). Each block's id (spec §3: "for uploads this
/// doubles as the block identifier sent to the service") is derived from `blob.id` and its
/// index, so re-decomposing the same blob on resume always reproduces the exact ids the server
/// already has bytes for.
pub async fn decompose(
    blob: &BlobTransfer,
    chunk_size: u64,
    transport: Arc<ReqwestTransport>,
) -> TransferResult<Decomposition> {
    let local_path = PathBuf::from(&blob.source);
    let metadata = tokio::fs::metadata(&local_path)
        .await
        .map_err(|err| decomposition_failure(format!("cannot stat upload source: {err}")))?;
    let total_size = metadata.len();

    let mut blocks = Vec::new();
    let mut units: Vec<Arc<dyn WorkUnit>> = Vec::new();
    let mut block_ids = Vec::new();

    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < total_size || total_size == 0 {
        let end = (offset + chunk_size).min(total_size);
        let block_id = block_id_for(&blob.id, index);

        blocks.push(BlockTransfer::new(block_id.clone(), blob.id.clone(), offset, end));
        block_ids.push(block_id.clone());

        units.push(Arc::new(UploadBlockUnit {
            id: block_id,
            transport: Arc::clone(&transport),
            endpoint_url: blob.destination.clone(),
            local_path: local_path.clone(),
            start: offset,
            end,
            timeout: Duration::from_secs(120),
        }));

        offset = end;
        index += 1;
        if total_size == 0 {
            break;
        }
    }

    let finalize_id = format!("{}-finalize", blob.id);
    units.push(Arc::new(UploadFinalizeUnit {
        id: finalize_id,
        depends_on: block_ids.clone(),
        transport,
        endpoint_url: blob.destination.clone(),
        block_ids,
        content_type: blob.properties.content_type.clone(),
        timeout: Duration::from_secs(120),
    }));

    Ok(Decomposition { units, blocks })
}

/// Rebuilds the work units for `blob` from already-persisted `BlockTransfer` records instead of
/// re-statting the local source file (spec §4.5: resume never redoes the decomposition once
/// `initialCallComplete` is true). `blocks` need not be sorted; the returned units follow
/// ascending `start_range`, matching `decompose`'s ordering so the commit lists blocks in the
/// same order the original decomposition chose.
pub fn units_from_blocks(
    blob: &BlobTransfer,
    blocks: &[BlockTransfer],
    transport: Arc<ReqwestTransport>,
) -> Decomposition {
    let mut ordered = blocks.to_vec();
    ordered.sort_by_key(|block| block.start_range);

    let local_path = PathBuf::from(&blob.source);
    let mut units: Vec<Arc<dyn WorkUnit>> = Vec::new();
    let mut block_ids = Vec::new();

    for block in &ordered {
        block_ids.push(block.id.clone());
        units.push(Arc::new(UploadBlockUnit {
            id: block.id.clone(),
            transport: Arc::clone(&transport),
            endpoint_url: blob.destination.clone(),
            local_path: local_path.clone(),
            start: block.start_range,
            end: block.end_range,
            timeout: Duration::from_secs(120),
        }));
    }

    let finalize_id = format!("{}-finalize", blob.id);
    units.push(Arc::new(UploadFinalizeUnit {
        id: finalize_id,
        depends_on: block_ids.clone(),
        transport,
        endpoint_url: blob.destination.clone(),
        block_ids,
        content_type: blob.properties.content_type.clone(),
        timeout: Duration::from_secs(120),
    }));

    Decomposition { units, blocks: ordered }
}

/// `id` doubles as the wire block id sent on the PUT (spec §3), so there is no separate field
/// for it here.
struct UploadBlockUnit {
    id: TransferId,
    transport: Arc<ReqwestTransport>,
    endpoint_url: String,
    local_path: PathBuf,
    start: u64,
    end: u64,
    timeout: Duration,
}

#[async_trait]
impl WorkUnit for UploadBlockUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn depends_on(&self) -> &[String] {
        &[]
    }

    async fn execute(&self) -> TransferResult<()> {
        let mut file = tokio::fs::File::open(&self.local_path)
            .await
            .map_err(|err| decomposition_failure(format!("cannot open upload source: {err}")))?;
        file.seek(SeekFrom::Start(self.start))
            .await
            .map_err(|err| decomposition_failure(format!("cannot seek upload source: {err}")))?;

        let len = (self.end - self.start) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|err| decomposition_failure(format!("cannot read upload chunk: {err}")))?;

        let request = put_block_request(&self.endpoint_url, &self.id, buf, self.timeout);
        self.transport.execute(request).await
    }
}

struct UploadFinalizeUnit {
    id: TransferId,
    depends_on: Vec<String>,
    transport: Arc<ReqwestTransport>,
    endpoint_url: String,
    block_ids: Vec<String>,
    content_type: Option<String>,
    timeout: Duration,
}

#[async_trait]
impl WorkUnit for UploadFinalizeUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    async fn execute(&self) -> TransferResult<()> {
        let request = commit_block_list_request(
            &self.endpoint_url,
            &self.block_ids,
            self.content_type.as_deref(),
            self.timeout,
        );
        self.transport.execute(request).await
    }
}
