// BLOB version prefix helpers. [version: u8][payload].
// samples.record: version 1 = wincode Vec<ThreadEntry>, version 2 = wincode Vec<ProcessEntry>.
// session.gpus: version 1 = wincode Vec<GpuDevice>.

pub(super) const BLOB_VERSION_THREADS: u8 = 1;
pub(super) const BLOB_VERSION_PROCESSES: u8 = 2;
pub(super) const BLOB_VERSION_GPUS: u8 = 1;

pub(super) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Splits a blob into (version, payload). Empty blobs have version 0.
pub(super) fn split_version(bytes: &[u8]) -> (u8, &[u8]) {
    match bytes.split_first() {
        Some((version, payload)) => (*version, payload),
        None => (0, bytes),
    }
}
