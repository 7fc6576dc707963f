//! Decode a slotted destination back into the original bytes

use ferry_core::{FerryError, FerryResult, TransferStatus};
use ferry_crypto::TransferKey;
use tracing::info;

use crate::handler::verify_encoded;
use crate::model::{DestinationLayout, TransferSession};
use crate::pipeline::{unframe_slot, ChunkPipeline};
use crate::store::StoreProvider;

/// Write the plaintext of a completed, transformed transfer to `output`.
///
/// Every slot is checked against its recorded digest (when one exists)
/// before decoding. Returns the number of bytes written.
pub fn unpack_destination(
    session: &TransferSession,
    key: Option<&TransferKey>,
    stores: &dyn StoreProvider,
    output: &str,
) -> FerryResult<u64> {
    let DestinationLayout::Slotted { slot_size } = session.layout else {
        return Err(FerryError::Config(format!(
            "{} holds plain bytes; nothing to unpack",
            session.destination_path
        )));
    };
    if session.status != TransferStatus::Completed {
        return Err(FerryError::Config(format!(
            "transfer {} is {}; only completed transfers can be unpacked",
            session.transfer_id, session.status
        )));
    }

    let pipeline = ChunkPipeline::for_session(session, key)?;
    let packed = stores.open(&session.destination_path)?;
    let out = stores.open(output)?;
    out.resize(session.total_size)?;

    for chunk in &session.chunks {
        let slot = packed.read(chunk.sequence * slot_size, slot_size as usize)?;
        let payload = unframe_slot(&slot)?;
        if let Some(expected) = &chunk.expected_hash {
            verify_encoded(expected, payload)?;
        }
        let plain = pipeline.decode(chunk.sequence, payload, chunk.size as usize)?;
        if plain.len() as u64 != chunk.size {
            return Err(FerryError::Transform(format!(
                "{} decoded to {} bytes, expected {}",
                chunk.chunk_id,
                plain.len(),
                chunk.size
            )));
        }
        out.write(chunk.offset, &plain)?;
    }

    info!(
        transfer_id = %session.transfer_id,
        output,
        bytes = session.total_size,
        "destination unpacked"
    );
    Ok(session.total_size)
}
