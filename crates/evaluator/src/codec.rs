use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::{DispatchError, DispatchResult};
use crate::graph::Graph;

/// File name the evaluation script is staged under.
pub const EVAL_SCRIPT: &str = "eval.sage";

/// Encode a value so it survives as a single whitespace-free argv entry.
pub fn encode_arg(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

pub fn encode_graph(graph: &Graph) -> DispatchResult<String> {
    let json = serde_json::to_string(graph)
        .map_err(|e| DispatchError::Encode(format!("graph {}: {e}", graph.id)))?;
    Ok(encode_arg(&json))
}

/// `<interpreter> eval.sage <answer> <graph>`; both payloads must already
/// be encoded.
pub fn build_command(interpreter: &str, encoded_answer: &str, encoded_graph: &str) -> String {
    format!("{interpreter} {EVAL_SCRIPT} {encoded_answer} {encoded_graph}")
}

#[cfg(test)]
fn decode_arg(value: &str) -> Result<String, String> {
    let bytes = STANDARD.decode(value).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}
