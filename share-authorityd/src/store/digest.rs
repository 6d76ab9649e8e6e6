use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{RecordKey, Transport};

/// Advertisement state of one record: its key and the friends granted on it
pub type RecordState = (RecordKey, Vec<String>);

/// Hash only what the advertisement daemon publishes; registration and
/// grant timestamps are excluded.
#[derive(Serialize)]
struct DigestView<'a> {
    service_type: &'a str,
    hostname: &'a str,
    instance_name: &'a str,
    port: u16,
    transport: Transport,
    granted: Vec<&'a str>,
}

/// Computes a SHA-256 digest of an owner's records and grants.
/// Records are sorted by key and grants by friend id, so the digest does not
/// depend on query order.
pub fn compute_digest(state: &[RecordState]) -> String {
    let mut indices: Vec<usize> = (0..state.len()).collect();
    indices.sort_by(|&a, &b| state[a].0.cmp(&state[b].0));

    let views: Vec<DigestView<'_>> = indices
        .iter()
        .map(|&i| {
            let (key, granted) = &state[i];
            let mut granted: Vec<&str> = granted.iter().map(String::as_str).collect();
            granted.sort_unstable();
            DigestView {
                service_type: &key.service_type,
                hostname: &key.hostname,
                instance_name: &key.instance_name,
                port: key.port,
                transport: key.transport,
                granted,
            }
        })
        .collect();

    let json = serde_json::to_string(&views)
        .expect("Failed to serialize advertisement state for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
