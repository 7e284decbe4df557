//! Binary stream content: a stream whose items follow the
//! start → chunk… → end convention, carrying base64url-coded byte chunks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::stream::CoStreamView;
use crate::transaction::MAX_RECOMMENDED_TX_SIZE;

/// Chunks are kept under the recommended transaction size with headroom for
/// the envelope and base64 expansion.
pub const MAX_BINARY_CHUNK_SIZE: usize = MAX_RECOMMENDED_TX_SIZE - 1024;

const BINARY_PREFIX: &str = "binary_U";

/// The stream items of one binary upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BinaryStreamItem {
    #[serde(rename_all = "camelCase")]
    Start {
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_size_bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Chunk {
        chunk: String,
    },
    End,
}

/// Decoded state of a binary stream.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryStreamInfo {
    pub mime_type: String,
    pub total_size_bytes: Option<u64>,
    pub file_name: Option<String>,
    pub chunks: Vec<Vec<u8>>,
    pub finished: bool,
}

impl BinaryStreamInfo {
    pub fn into_bytes(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Encode one chunk as a stream item value.
pub fn chunk_item(bytes: &[u8]) -> Value {
    let encoded = format!("{}{}", BINARY_PREFIX, crate::ids::encode_b64(bytes));
    serde_json::to_value(BinaryStreamItem::Chunk { chunk: encoded })
        .unwrap_or(Value::Null)
}

/// Encode the opening item.
pub fn start_item(mime_type: &str, total_size_bytes: Option<u64>, file_name: Option<&str>) -> Value {
    serde_json::to_value(BinaryStreamItem::Start {
        mime_type: mime_type.to_string(),
        total_size_bytes,
        file_name: file_name.map(str::to_string),
    })
    .unwrap_or(Value::Null)
}

/// Encode the end marker.
pub fn end_item() -> Value {
    serde_json::to_value(BinaryStreamItem::End).unwrap_or(Value::Null)
}

/// Split a blob into chunk-sized pieces.
pub fn split_chunks(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(MAX_BINARY_CHUNK_SIZE)
}

/// Fold a stream view into the binary state.
///
/// Returns `None` when no session has produced a `start` item, or when the
/// stream is unfinished and the caller did not allow that. When several
/// sessions uploaded concurrently, the first session in merge order wins.
pub(crate) fn binary_chunks(
    view: &CoStreamView,
    allow_unfinished: bool,
) -> Option<BinaryStreamInfo> {
    for session in view.sessions() {
        let items = view.per_session(session);
        let mut parsed = items.iter().filter_map(|item| {
            serde_json::from_value::<BinaryStreamItem>(item.value.clone()).ok()
        });

        let (mime_type, total_size_bytes, file_name) = match parsed.next() {
            Some(BinaryStreamItem::Start {
                mime_type,
                total_size_bytes,
                file_name,
            }) => (mime_type, total_size_bytes, file_name),
            _ => continue,
        };

        let mut chunks = Vec::new();
        let mut finished = false;
        for item in parsed {
            match item {
                BinaryStreamItem::Chunk { chunk } => {
                    let material = chunk.strip_prefix(BINARY_PREFIX)?;
                    chunks.push(decode_chunk(material)?);
                }
                BinaryStreamItem::End => {
                    finished = true;
                    break;
                }
                BinaryStreamItem::Start { .. } => break,
            }
        }

        if !finished && !allow_unfinished {
            return None;
        }
        return Some(BinaryStreamInfo {
            mime_type,
            total_size_bytes,
            file_name,
            chunks,
            finished,
        });
    }
    None
}

fn decode_chunk(material: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.decode(material).ok()
}
