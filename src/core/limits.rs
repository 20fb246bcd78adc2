//! Wire safety limits.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_transfer_payload_bytes: usize,
    pub max_sync_payload_bytes: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_bytes_string_len: usize,
    pub max_cbor_text_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_transfer_payload_bytes: 4 * 1024 * 1024,
            max_sync_payload_bytes: 15 * 1024 * 1024,

            max_cbor_depth: 16,
            max_cbor_map_entries: 4_096,
            max_cbor_array_entries: 4_096,
            max_cbor_bytes_string_len: 15 * 1024 * 1024,
            max_cbor_text_string_len: 64 * 1024,
        }
    }
}
