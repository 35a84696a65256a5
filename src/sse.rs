use serde::Deserialize;
use serde_json::Value;

/// One meaningful update from the agent stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    TextDelta(String),
    Finish { reason: String },
    /// A `model` frame with a sub-type the translator does not render.
    Other { kind: String },
}

pub const FINISH_REASON_END_TURN: &str = "end_turn";

impl UpstreamEvent {
    pub fn end_turn() -> Self {
        Self::Finish {
            reason: FINISH_REASON_END_TURN.to_string(),
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    event: Option<RawModelEvent>,
}

#[derive(Debug, Deserialize)]
struct RawModelEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: Option<Value>,
}

/// Decodes the joined `data:` payload of one SSE block.
///
/// Each line is an independent JSON object. Lines that fail to parse are
/// skipped and frames whose top-level type is not `model` are dropped.
pub fn decode_block(data: &str) -> Vec<UpstreamEvent> {
    data.split('\n')
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .filter_map(decode_line)
        .collect()
}

fn decode_line(line: &str) -> Option<UpstreamEvent> {
    let frame: RawFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::trace!(
                target: "orchids_gateway::upstream_sse",
                "skipping malformed frame: {err}"
            );
            return None;
        }
    };
    if frame.kind != "model" {
        tracing::debug!(
            target: "orchids_gateway::upstream_sse",
            frame_type = %frame.kind,
            "dropping non-model frame"
        );
        return None;
    }
    let event = frame.event?;
    Some(match event.kind.as_str() {
        "text-delta" => UpstreamEvent::TextDelta(match event.delta {
            Some(Value::String(text)) => text,
            _ => String::new(),
        }),
        "finish" => UpstreamEvent::end_turn(),
        _ => UpstreamEvent::Other { kind: event.kind },
    })
}

#[cfg(test)]
mod tests {
    use super::{UpstreamEvent, decode_block};

    #[test]
    fn text_delta_and_finish_are_classified() {
        let data = concat!(
            r#"{"type":"model","event":{"type":"text-delta","delta":"Hi"}}"#,
            "\n",
            r#"{"type":"model","event":{"type":"finish","finishReason":"stop"}}"#
        );
        assert_eq!(
            decode_block(data),
            vec![
                UpstreamEvent::TextDelta("Hi".to_string()),
                UpstreamEvent::end_turn()
            ]
        );
    }

    #[test]
    fn malformed_lines_do_not_hide_later_frames() {
        let data = concat!(
            "{not json",
            "\n",
            r#"{"type":"model","event":{"type":"text-delta","delta":"ok"}}"#
        );
        assert_eq!(
            decode_block(data),
            vec![UpstreamEvent::TextDelta("ok".to_string())]
        );
    }

    #[test]
    fn non_model_frames_are_dropped() {
        let data = r#"{"type":"coding_agent.start","data":{}}"#;
        assert!(decode_block(data).is_empty());
    }

    #[test]
    fn unknown_model_subtypes_pass_through_as_other() {
        let data = "{\"type\":\"model\",\"event\":{\"type\":\"reasoning-delta\"}}\r";
        assert_eq!(
            decode_block(data),
            vec![UpstreamEvent::Other {
                kind: "reasoning-delta".to_string()
            }]
        );
    }
}
