//! Role implementations backed by a chat model.
//!
//! Replies are accepted either as a JSON object or as Markdown `###`
//! sections. An unparseable reply is re-requested up to `parse_attempts`
//! times with a format reminder; after that the parse error is returned, never
//! a silently defaulted value.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    Curator, CuratorInput, Generator, GeneratorInput, GeneratorOutput, Reflection, Reflector,
    ReflectorInput,
};
use crate::config::ModelConfig;
use crate::model::prompt::{curator_prompt, generator_prompt, reflector_prompt};
use crate::model::{CallTag, ChatMessage, ChatModel, UsageLog};
use crate::playbook::types::default_section;
use crate::playbook::{BulletId, BulletTag, CuratorDelta, DeltaOperation, TagKind};

const FORMAT_REMINDER: &str = "Your previous reply could not be parsed. Respond again using \
exactly the required Markdown sections and nothing else.";

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

async fn complete_parsed<T>(
    model: &ChatModel,
    mut messages: Vec<ChatMessage>,
    attempts: usize,
    tag: CallTag<'_>,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    let role = tag.role;
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let reply = model
            .complete(&messages, tag)
            .await
            .with_context(|| format!("{role} model call failed"))?;
        match parse(&reply) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => {
                warn!(role, attempt, attempts, error = %e, "Unparseable model reply");
                messages.push(ChatMessage::assistant(reply));
                messages.push(ChatMessage::user(FORMAT_REMINDER));
                last_error = Some(e);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| anyhow::anyhow!("no reply"));
    Err(err.context(format!("{role} produced no parseable reply after {attempts} attempts")))
}

/// Strip optional markdown code fences from the response.
fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let stripped = stripped.strip_suffix("```").unwrap_or(stripped);
    stripped.trim()
}

fn looks_like_json(s: &str) -> bool {
    strip_code_fences(s).starts_with('{')
}

/// Split Markdown into `### Header` sections keyed by normalised header
/// (`"Bullet IDs"` becomes `bullet_ids`). Headers inside code blocks are
/// treated as content.
pub fn parse_markdown_sections(text: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();
    let mut in_code = false;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.starts_with("```") {
            in_code = !in_code;
        }
        let header = (!in_code)
            .then(|| stripped.trim_start_matches('#'))
            .filter(|rest| rest.len() < stripped.len() && rest.starts_with(char::is_whitespace));

        match header {
            Some(rest) => {
                if let Some(key) = current.take() {
                    sections.insert(key, body.join("\n").trim().to_string());
                }
                current = Some(rest.trim().to_lowercase().replace(' ', "_"));
                body.clear();
            }
            None => body.push(line),
        }
    }
    if let Some(key) = current {
        sections.insert(key, body.join("\n").trim().to_string());
    }
    sections
}

/// Pull the code out of a generator answer.
///
/// A fenced `python` block wins; otherwise a generic fence is stripped;
/// otherwise the trimmed text is returned.
pub fn extract_python_code(text: &str) -> String {
    if let Some(start) = text.find("```python") {
        let rest = &text[start + "```python".len()..];
        let end = rest.find("```").unwrap_or(rest.len());
        return rest[..end].trim().to_string();
    }
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        return rest.strip_suffix("```").unwrap_or(rest).trim().to_string();
    }
    trimmed.to_string()
}

fn parse_id_value(value: &serde_json::Value) -> Option<BulletId> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64().map(BulletId::new),
        _ => None,
    }
}

fn parse_json_list(text: &str) -> Result<Vec<serde_json::Value>> {
    let text = strip_code_fences(text);
    if text.is_empty() || text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("null") {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).with_context(|| format!("expected a JSON list, got: {text}"))
}

/// Ids the generator cites. Unparseable entries are dropped.
fn parse_bullet_ids(values: &[serde_json::Value]) -> Vec<BulletId> {
    values.iter().filter_map(parse_id_value).collect()
}

/// Reflector tags. Tags are advisory, so malformed entries are dropped.
fn parse_bullet_tags(values: &[serde_json::Value]) -> Vec<BulletTag> {
    values
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(parse_id_value);
            let tag = item
                .get("tag")
                .and_then(|t| t.as_str())
                .and_then(|t| match t.trim().to_lowercase().as_str() {
                    "helpful" => Some(TagKind::Helpful),
                    "harmful" => Some(TagKind::Harmful),
                    "neutral" => Some(TagKind::Neutral),
                    _ => None,
                });
            match (id, tag) {
                (Some(id), Some(tag)) => Some(BulletTag { id, tag }),
                _ => {
                    debug!(tag = %item, "Dropping malformed bullet tag");
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawGeneratorOutput {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    bullet_ids: Vec<serde_json::Value>,
    #[serde(default, alias = "final_answer")]
    code: String,
}

pub(crate) fn parse_generator_output(text: &str) -> Result<GeneratorOutput> {
    let raw = if looks_like_json(text) {
        serde_json::from_str::<RawGeneratorOutput>(strip_code_fences(text))
            .context("failed to parse generator JSON")?
    } else {
        let sections = parse_markdown_sections(text);
        match sections.get("final_answer") {
            Some(answer) => RawGeneratorOutput {
                reasoning: sections.get("reasoning").cloned().unwrap_or_default(),
                bullet_ids: sections
                    .get("bullet_ids")
                    .map(|ids| parse_json_list(ids).unwrap_or_default())
                    .unwrap_or_default(),
                code: answer.clone(),
            },
            // No sections at all: accept a bare fenced block.
            None if text.contains("```python") => RawGeneratorOutput {
                reasoning: text[..text.find("```python").unwrap_or(0)].trim().to_string(),
                bullet_ids: Vec::new(),
                code: text.to_string(),
            },
            None => bail!("generator reply has no `### Final Answer` section"),
        }
    };

    let code = extract_python_code(&raw.code);
    if code.is_empty() {
        bail!("generator reply contains no code");
    }
    Ok(GeneratorOutput {
        reasoning: raw.reasoning.trim().to_string(),
        code,
        bullet_ids: parse_bullet_ids(&raw.bullet_ids),
    })
}

#[derive(Debug, Clone)]
pub struct LlmGenerator {
    model: ChatModel,
    parse_attempts: usize,
}

impl LlmGenerator {
    pub fn new(model: ChatModel, parse_attempts: usize) -> Self {
        Self {
            model,
            parse_attempts,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(ChatModel::from_config(config), config.parse_attempts)
    }

    pub fn with_usage_log(mut self, usage: UsageLog) -> Self {
        self.model = self.model.with_usage_log(usage);
        self
    }
}

impl Generator for LlmGenerator {
    async fn generate(&self, input: GeneratorInput<'_>) -> Result<GeneratorOutput> {
        let messages = generator_prompt(&input);
        let output = complete_parsed(
            &self.model,
            messages,
            self.parse_attempts,
            CallTag {
                role: "generator",
                task_id: input.task_id,
                step: Some(input.step),
            },
            parse_generator_output,
        )
        .await?;
        debug!(
            step = input.step,
            code_len = output.code.len(),
            bullets = output.bullet_ids.len(),
            "Generator produced step"
        );
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawReflection {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    error_identification: String,
    #[serde(default, alias = "root_cause_analysis")]
    root_cause: String,
    #[serde(default)]
    correct_approach: String,
    #[serde(default)]
    key_insight: String,
    #[serde(default)]
    bullet_tags: Vec<serde_json::Value>,
}

pub(crate) fn parse_reflection(text: &str) -> Result<Reflection> {
    let raw = if looks_like_json(text) {
        serde_json::from_str::<RawReflection>(strip_code_fences(text))
            .context("failed to parse reflector JSON")?
    } else {
        let mut sections = parse_markdown_sections(text);
        let mut take = |key: &str| sections.remove(key).unwrap_or_default();
        let tags = take("bullet_tags");
        RawReflection {
            reasoning: take("reasoning"),
            error_identification: take("error_identification"),
            root_cause: take("root_cause_analysis"),
            correct_approach: take("correct_approach"),
            key_insight: take("key_insight"),
            bullet_tags: parse_json_list(&tags).unwrap_or_default(),
        }
    };

    if raw.reasoning.trim().is_empty()
        && raw.key_insight.trim().is_empty()
        && raw.error_identification.trim().is_empty()
    {
        bail!("reflector reply has no reasoning, error identification or key insight");
    }

    Ok(Reflection {
        reasoning: raw.reasoning,
        error_identification: raw.error_identification,
        root_cause: raw.root_cause,
        correct_approach: raw.correct_approach,
        key_insight: raw.key_insight,
        bullet_tags: parse_bullet_tags(&raw.bullet_tags),
    })
}

#[derive(Debug, Clone)]
pub struct LlmReflector {
    model: ChatModel,
    parse_attempts: usize,
}

impl LlmReflector {
    pub fn new(model: ChatModel, parse_attempts: usize) -> Self {
        Self {
            model,
            parse_attempts,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(ChatModel::from_config(config), config.parse_attempts)
    }

    pub fn with_usage_log(mut self, usage: UsageLog) -> Self {
        self.model = self.model.with_usage_log(usage);
        self
    }
}

impl Reflector for LlmReflector {
    async fn reflect(&self, input: ReflectorInput<'_>) -> Result<Reflection> {
        complete_parsed(
            &self.model,
            reflector_prompt(&input),
            self.parse_attempts,
            CallTag {
                role: "reflector",
                task_id: input.task_id,
                step: None,
            },
            parse_reflection,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Curator
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawOperation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    bullet_id: Option<serde_json::Value>,
}

impl RawOperation {
    /// `None` for operations the playbook does not take from the curator.
    fn into_operation(self) -> Result<Option<DeltaOperation>> {
        let bullet_id = || {
            self.bullet_id
                .as_ref()
                .and_then(parse_id_value)
                .with_context(|| format!("{} operation without a valid bullet_id", self.kind))
        };
        let op = match self.kind.trim().to_uppercase().as_str() {
            "ADD" => DeltaOperation::Add {
                section: self
                    .section
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(default_section),
                content: self.content.clone().unwrap_or_default(),
            },
            "UPDATE" => DeltaOperation::Update {
                bullet_id: bullet_id()?,
                content: self.content.clone().unwrap_or_default(),
            },
            "REMOVE" => DeltaOperation::Remove {
                bullet_id: bullet_id()?,
            },
            // Counters come from the reflector's tags.
            "TAG" => return Ok(None),
            other => bail!("unknown curator operation type {other:?}"),
        };
        Ok(Some(op))
    }
}

#[derive(Deserialize)]
struct RawDelta {
    #[serde(default)]
    reasoning: String,
    operations: Vec<RawOperation>,
}

pub(crate) fn parse_curator_delta(text: &str) -> Result<CuratorDelta> {
    let raw = if looks_like_json(text) {
        serde_json::from_str::<RawDelta>(strip_code_fences(text))
            .context("failed to parse curator JSON")?
    } else {
        let sections = parse_markdown_sections(text);
        let Some(operations) = sections.get("operations") else {
            bail!("curator reply has no `### Operations` section");
        };
        let values = parse_json_list(operations)?;
        RawDelta {
            reasoning: sections.get("reasoning").cloned().unwrap_or_default(),
            operations: values
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()
                .context("malformed curator operation")?,
        }
    };

    let mut operations = Vec::new();
    for raw_op in raw.operations {
        if let Some(op) = raw_op.into_operation()? {
            operations.push(op);
        }
    }
    Ok(CuratorDelta {
        reasoning: raw.reasoning,
        operations,
    })
}

#[derive(Debug, Clone)]
pub struct LlmCurator {
    model: ChatModel,
    parse_attempts: usize,
}

impl LlmCurator {
    pub fn new(model: ChatModel, parse_attempts: usize) -> Self {
        Self {
            model,
            parse_attempts,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(ChatModel::from_config(config), config.parse_attempts)
    }

    pub fn with_usage_log(mut self, usage: UsageLog) -> Self {
        self.model = self.model.with_usage_log(usage);
        self
    }
}

impl Curator for LlmCurator {
    async fn curate(&self, input: CuratorInput<'_>) -> Result<CuratorDelta> {
        complete_parsed(
            &self.model,
            curator_prompt(&input),
            self.parse_attempts,
            CallTag {
                role: "curator",
                task_id: input.task_id,
                step: None,
            },
            parse_curator_delta,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_python_code() {
        let text = "I will list songs.\n```python\nprint(apis.spotify.show_songs())\n```\nDone.";
        assert_eq!(extract_python_code(text), "print(apis.spotify.show_songs())");
        assert_eq!(extract_python_code("```\nx = 1\n```"), "x = 1");
        assert_eq!(extract_python_code("  x = 1  "), "x = 1");
    }

    #[test]
    fn test_markdown_sections_ignore_headers_in_code() {
        let text = "### Reasoning\nLook first.\n\n### Final Answer\n```python\n### not a header\nprint(1)\n```";
        let sections = parse_markdown_sections(text);
        assert_eq!(sections["reasoning"], "Look first.");
        assert!(sections["final_answer"].contains("### not a header"));
        assert_eq!(sections.len(), 2);
    }

    #[test]
    fn test_parse_generator_markdown() {
        let text = "### Reasoning\nCheck the account first.\n\n### Bullet IDs\n[\"b-00002\", \"[b-00005]\"]\n\n### Final Answer\n```python\nprint(apis.spotify.show_account())\n```";
        let output = parse_generator_output(text).unwrap();
        assert_eq!(output.reasoning, "Check the account first.");
        assert_eq!(output.code, "print(apis.spotify.show_account())");
        assert_eq!(output.bullet_ids, vec![BulletId::new(2), BulletId::new(5)]);
    }

    #[test]
    fn test_parse_generator_json_with_none_ids() {
        let text = "```json\n{\"reasoning\": \"r\", \"bullet_ids\": [], \"final_answer\": \"```python\\nx = 1\\n```\"}\n```";
        let output = parse_generator_output(text).unwrap();
        assert_eq!(output.code, "x = 1");
        assert!(output.bullet_ids.is_empty());
    }

    #[test]
    fn test_generator_reply_without_code_is_malformed() {
        assert!(parse_generator_output("I am not sure what to do.").is_err());
        assert!(parse_generator_output("### Reasoning\nr\n### Final Answer\n").is_err());
    }

    #[test]
    fn test_parse_reflection_markdown() {
        let text = "### Reasoning\nThe agent stopped after page 1.\n### Error Identification\nStep 2.\n### Root Cause Analysis\nIgnored pagination.\n### Correct Approach\nLoop pages.\n### Key Insight\nAlways paginate.\n### Bullet Tags\n[{\"id\": \"b-00001\", \"tag\": \"Harmful\"}, {\"id\": \"bogus\", \"tag\": \"helpful\"}]";
        let reflection = parse_reflection(text).unwrap();
        assert_eq!(reflection.root_cause, "Ignored pagination.");
        assert_eq!(reflection.key_insight, "Always paginate.");
        assert_eq!(
            reflection.bullet_tags,
            vec![BulletTag {
                id: BulletId::new(1),
                tag: TagKind::Harmful
            }]
        );
    }

    #[test]
    fn test_empty_reflection_is_malformed() {
        assert!(parse_reflection("{}").is_err());
    }

    #[test]
    fn test_parse_curator_markdown() {
        let text = "### Reasoning\nNew tip.\n### Operations\n[{\"type\": \"ADD\", \"section\": \"apis\", \"content\": \"Paginate.\", \"bullet_id\": null}, {\"type\": \"TAG\", \"bullet_id\": \"b-00001\", \"metadata\": {\"helpful\": 1}}, {\"type\": \"REMOVE\", \"bullet_id\": 3}]";
        let delta = parse_curator_delta(text).unwrap();
        assert_eq!(
            delta.operations,
            vec![
                DeltaOperation::Add {
                    section: "apis".into(),
                    content: "Paginate.".into()
                },
                DeltaOperation::Remove {
                    bullet_id: BulletId::new(3)
                },
            ]
        );
    }

    #[test]
    fn test_curator_reply_without_operations_is_malformed() {
        assert!(parse_curator_delta("### Reasoning\nnothing to add").is_err());
        assert!(parse_curator_delta("{\"reasoning\": \"r\"}").is_err());
        assert!(parse_curator_delta("### Operations\n[{\"type\": \"UPDATE\", \"content\": \"x\"}]").is_err());
        assert!(parse_curator_delta("### Operations\n[]").unwrap().is_empty());
    }
}
