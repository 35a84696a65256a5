use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PublicModel {
    pub id: &'static str,
    pub object: &'static str,
    pub owned_by: &'static str,
}

const PUBLIC_MODELS: [PublicModel; 6] = [
    public("claude-opus-4-5", "anthropic"),
    public("claude-opus-4-5-thinking", "anthropic"),
    public("claude-sonnet-4-20250514", "anthropic"),
    public("claude-sonnet-4-5", "anthropic"),
    public("gpt-4", "openai"),
    public("gpt-4o", "openai"),
];

const fn public(id: &'static str, owned_by: &'static str) -> PublicModel {
    PublicModel {
        id,
        object: "model",
        owned_by,
    }
}

pub fn model_list() -> &'static [PublicModel] {
    &PUBLIC_MODELS
}

/// Maps a public model name to the agent's model identifier.
/// Unknown names are returned unchanged.
pub fn resolve_agent_model(name: &str) -> String {
    let mapped = match name.trim() {
        "claude-opus-4-5" | "claude-opus-4-5-thinking" | "claude-opus-4-5-20251101" => {
            "claude-opus-4.5"
        }
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" => "claude-sonnet-4.5",
        "claude-sonnet-4-20250514" | "claude-sonnet-4" => "claude-sonnet-4",
        "claude-haiku-4-5" | "claude-haiku-4-5-20251001" => "claude-haiku-4.5",
        other => other,
    };
    mapped.to_string()
}

#[cfg(test)]
mod tests {
    use super::{model_list, resolve_agent_model};

    #[test]
    fn known_aliases_are_mapped() {
        assert_eq!(resolve_agent_model("claude-opus-4-5"), "claude-opus-4.5");
        assert_eq!(
            resolve_agent_model("claude-sonnet-4-20250514"),
            "claude-sonnet-4"
        );
    }

    #[test]
    fn unknown_names_pass_through() {
        assert_eq!(resolve_agent_model("gpt-4o"), "gpt-4o");
        assert_eq!(resolve_agent_model("my-model"), "my-model");
    }

    #[test]
    fn model_list_is_fixed() {
        let ids: Vec<&str> = model_list().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 6);
        assert!(ids.contains(&"claude-opus-4-5-thinking"));
    }
}
