/// Content digest used as the delivery id of an outbound payload.
///
/// BLAKE3 over the channel id and the encoded bytes, so the same payload
/// published on two channels never shares an acknowledgment slot.
pub fn content_digest(channel_id: &str, payload: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(channel_id.len() as u64).to_le_bytes());
    hasher.update(channel_id.as_bytes());
    hasher.update(payload);
    hasher.finalize().to_hex().to_string()
}

/// Raw BLAKE3 of inbound bytes, for replay detection.
pub fn payload_hash(payload: &[u8]) -> [u8; 32] {
    *blake3::hash(payload).as_bytes()
}
