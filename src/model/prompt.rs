//! Prompt templates for the three roles.
//!
//! Each function constructs a `Vec<ChatMessage>` ready to be sent to an LLM.
//! The templates ask for Markdown sections (`### Reasoning`, ...); the role
//! parsers also accept the same fields as a JSON object.

use crate::model::api::ChatMessage;
use crate::roles::{CuratorInput, GeneratorInput, ReflectorInput};

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

const GENERATOR_SYSTEM: &str = "\
You are a coding agent solving a task by writing Python that is executed in a \
stateful sandbox, one block at a time. Print anything you need to see. When the \
task is done, call `apis.supervisor.complete_task()` (with `answer=` if the task \
asks a question).

Respond using exactly these Markdown sections:

### Reasoning
<what the previous observations tell you and which single step to take next>

### Bullet IDs
<JSON list of playbook ids you relied on, e.g. [\"b-00003\"], or []>

### Final Answer
```python
<the code for this step only>
```";

/// Build the generator prompt for one step.
pub fn generator_prompt(input: &GeneratorInput<'_>) -> Vec<ChatMessage> {
    let metadata = if input.metadata.is_empty() {
        "(none)".to_string()
    } else {
        input
            .metadata
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        "## Playbook\n{playbook}\n\n## Task\n{task}\n\n## Task context\n{metadata}\n{context}\n## Previous steps\n{history}\n\nWrite step {step}.",
        playbook = input.playbook.as_prompt(),
        task = input.task,
        context = input
            .context
            .map(|c| format!("\n{c}\n"))
            .unwrap_or_default(),
        history = input.trajectory_history,
        step = input.step + 1,
    );

    vec![ChatMessage::system(GENERATOR_SYSTEM), ChatMessage::user(user)]
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

const REFLECTOR_SYSTEM: &str = "\
You diagnose a coding agent's attempt at a task. Compare its trajectory with the \
reference solution and the unit-test report, and judge the playbook bullets it used.

Respond using exactly these Markdown sections:

### Reasoning
### Error Identification
### Root Cause Analysis
### Correct Approach
### Key Insight
### Bullet Tags
<JSON list such as [{\"id\": \"b-00001\", \"tag\": \"helpful\"}]; tags are helpful, harmful or neutral; [] if none>";

pub fn reflector_prompt(input: &ReflectorInput<'_>) -> Vec<ChatMessage> {
    let user = format!(
        "## Task\n{task}\n\n## Trajectory\n{feedback}\n\n## Playbook\n{playbook}\n\n\
         ## Reference solution\n{ground_truth}\n\n## Unit tests ({passed}/{total} passed)\n{report}",
        task = input.task,
        feedback = input.feedback,
        playbook = input.playbook.as_prompt(),
        ground_truth = input.ground_truth.unwrap_or("(not available)"),
        passed = input.unit_test_results.passed,
        total = input.unit_test_results.total,
        report = input.unit_test_results.report,
    );
    vec![ChatMessage::system(REFLECTOR_SYSTEM), ChatMessage::user(user)]
}

// ---------------------------------------------------------------------------
// Curator
// ---------------------------------------------------------------------------

const CURATOR_SYSTEM: &str = "\
You maintain a playbook of short, general strategy tips for a coding agent. Turn \
the latest reflection into playbook changes. Add new insights, update bullets the \
reflection shows to be wrong, and remove bullets that are misleading. Do not \
invent API names that do not appear in the inputs.

Respond using exactly these Markdown sections:

### Reasoning
### Operations
<JSON list of operations, [] if nothing changes. Each is one of
{\"type\": \"ADD\", \"section\": \"...\", \"content\": \"...\"}
{\"type\": \"UPDATE\", \"bullet_id\": \"b-00001\", \"content\": \"...\"}
{\"type\": \"REMOVE\", \"bullet_id\": \"b-00001\"}>";

pub fn curator_prompt(input: &CuratorInput<'_>) -> Vec<ChatMessage> {
    let user = format!(
        "## Task\n{task}\n\n## Current playbook\n{playbook}\n\n## Latest reflection\n{reflection}\n\n\
         ## Recent reflections\n{guidebook}\n\n## Final code of the attempt\n```python\n{code}\n```",
        task = input.question_context,
        playbook = input.playbook.as_prompt(),
        reflection = input.reflection.summary(),
        guidebook = input.guidebook,
        code = input.final_code,
    );
    vec![ChatMessage::system(CURATOR_SYSTEM), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EvaluationResult;
    use crate::playbook::{Playbook, Provenance};
    use crate::trajectory::SampleContext;

    #[test]
    fn test_generator_prompt_includes_playbook_and_metadata() {
        let mut playbook = Playbook::new();
        playbook.insert("apis", "Paginate list endpoints.", Provenance::new("t", None));
        let mut metadata = SampleContext::new();
        metadata.insert("email".into(), "jo@example.com".into());

        let messages = generator_prompt(&GeneratorInput {
            task_id: "t",
            task: "How many songs are in my library?",
            playbook: &playbook,
            metadata: &metadata,
            context: None,
            trajectory_history: "(no steps yet)",
            step: 0,
        });

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        let user = &messages[1].content;
        assert!(user.contains("[b-00001] Paginate list endpoints."));
        assert!(user.contains("- email: jo@example.com"));
        assert!(user.ends_with("Write step 1."));
    }

    #[test]
    fn test_reflector_prompt_reports_test_counts() {
        let playbook = Playbook::new();
        let results = EvaluationResult {
            passed: 1,
            total: 3,
            report: "details".into(),
        };
        let messages = reflector_prompt(&ReflectorInput {
            task_id: "t",
            task: "t",
            playbook: &playbook,
            ground_truth: None,
            feedback: "### Step 1",
            unit_test_results: &results,
        });
        assert!(messages[1].content.contains("## Unit tests (1/3 passed)"));
        assert!(messages[1].content.contains("(not available)"));
    }
}
