use std::collections::{HashMap, HashSet};

use mgate_dialect::Proto;
use mgate_storage::ChannelRow;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    OpenAi,
    Claude,
    Gemini,
    Azure,
    Bedrock,
    Custom,
}

impl Family {
    pub fn parse(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "openai" => Family::OpenAi,
            "claude" | "anthropic" => Family::Claude,
            "gemini" | "google" => Family::Gemini,
            "azure" => Family::Azure,
            "bedrock" | "aws" => Family::Bedrock,
            _ => Family::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::OpenAi => "openai",
            Family::Claude => "claude",
            Family::Gemini => "gemini",
            Family::Azure => "azure",
            Family::Bedrock => "bedrock",
            Family::Custom => "custom",
        }
    }

    /// The chat wire protocol this family speaks. Azure speaks OpenAI;
    /// Bedrock-fronting gateways speak the Anthropic shape.
    pub fn chat_proto(&self) -> Proto {
        match self {
            Family::OpenAi | Family::Azure | Family::Custom => Proto::OpenAiChat,
            Family::Claude | Family::Bedrock => Proto::Claude,
            Family::Gemini => Proto::Gemini,
        }
    }

    /// Whether the `/v1`-stripping URL rule applies (OpenAI-compatible
    /// bases only).
    pub fn openai_url_rule(&self) -> bool {
        matches!(self, Family::OpenAi | Family::Azure | Family::Custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ChannelStatus::Enabled,
            1 => ChannelStatus::ManuallyDisabled,
            _ => ChannelStatus::AutoDisabled,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            ChannelStatus::Enabled => 0,
            ChannelStatus::ManuallyDisabled => 1,
            ChannelStatus::AutoDisabled => 2,
        }
    }
}

/// In-memory view of one upstream channel, built from its stored row.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub family: Family,
    pub base_url: String,
    keys: Vec<String>,
    pub status: ChannelStatus,
    pub priority: i32,
    pub weight: u32,
    models: HashSet<String>,
    rewrite: HashMap<String, String>,
    groups: HashSet<String>,
    pub header_override: Vec<(String, String)>,
    pub pass_through_errors: bool,
}

impl Channel {
    pub fn from_row(row: &ChannelRow) -> Self {
        let keys = split_csv(&row.credential);
        let models = split_csv(&row.models).into_iter().collect();
        let groups = split_csv(&row.channel_groups).into_iter().collect();
        let rewrite = row
            .model_rewrite
            .as_ref()
            .and_then(|value| value.as_object())
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let header_override = row
            .header_override
            .as_ref()
            .and_then(|value| value.as_object())
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: row.id,
            name: row.name.clone(),
            family: Family::parse(&row.family),
            base_url: row.base_url.trim_end_matches('/').to_string(),
            keys,
            status: ChannelStatus::from_i32(row.status),
            priority: row.priority,
            weight: row.weight.max(0) as u32,
            models,
            rewrite,
            groups,
            header_override,
            pass_through_errors: row.pass_through_errors,
        }
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn in_any_group(&self, groups: &HashSet<String>) -> bool {
        self.groups.iter().any(|group| groups.contains(group))
    }

    /// Client-facing name mapped through the channel's rewrite table.
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.rewrite.get(model).map(String::as_str).unwrap_or(model)
    }

    pub fn visible_models(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }

    /// One key out of the pool. Comma-separated credential material is a
    /// key pool; a single entry behaves like a pool of one.
    pub fn pick_key(&self) -> &str {
        match self.keys.len() {
            0 => "",
            1 => &self.keys[0],
            n => {
                let index = rand::rng().random_range(0..n);
                &self.keys[index]
            }
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> ChannelRow {
        ChannelRow {
            id: 7,
            name: "primary".to_string(),
            family: "openai".to_string(),
            base_url: "https://api.openai.com/".to_string(),
            credential: "sk-a, sk-b".to_string(),
            status: 0,
            priority: 10,
            weight: 5,
            models: "gpt-4o-mini,gpt-4o".to_string(),
            model_rewrite: Some(serde_json::json!({"gpt-4o-mini": "gpt-4o-mini-2024"})),
            channel_groups: "default,vip".to_string(),
            header_override: None,
            pass_through_errors: false,
        }
    }

    #[test]
    fn row_parsing() {
        let channel = Channel::from_row(&row());
        assert_eq!(channel.family, Family::OpenAi);
        assert_eq!(channel.base_url, "https://api.openai.com");
        assert!(channel.serves_model("gpt-4o"));
        assert!(!channel.serves_model("claude-3"));
        assert_eq!(channel.upstream_model("gpt-4o-mini"), "gpt-4o-mini-2024");
        assert_eq!(channel.upstream_model("gpt-4o"), "gpt-4o");
        assert!(["sk-a", "sk-b"].contains(&channel.pick_key()));
    }

    #[test]
    fn group_intersection() {
        let channel = Channel::from_row(&row());
        let mine: HashSet<String> = ["vip".to_string()].into_iter().collect();
        assert!(channel.in_any_group(&mine));
        let other: HashSet<String> = ["internal".to_string()].into_iter().collect();
        assert!(!channel.in_any_group(&other));
    }

    #[test]
    fn family_protos() {
        assert_eq!(Family::parse("anthropic").chat_proto(), Proto::Claude);
        assert_eq!(Family::parse("azure").chat_proto(), Proto::OpenAiChat);
        assert!(Family::parse("azure").openai_url_rule());
        assert!(!Family::parse("gemini").openai_url_rule());
    }
}
