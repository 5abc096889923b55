//! Stage prompt construction.
//!
//! Pure string assembly; the dispatcher gathers the inputs and the executor
//! writes the result to the run's artifacts.

use foreman_db::models::{Attachment, Finding, SkillProfile, Stage, WorkItem};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything the prompt for one stage draws on.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub stage: Stage,
    pub item: &'a WorkItem,
    pub open_findings: &'a [Finding],
    pub attachments: &'a [Attachment],
    pub skill: Option<&'a SkillProfile>,
}

// ---------------------------------------------------------------------------
// Stage instructions
// ---------------------------------------------------------------------------

const PLAN_INSTRUCTIONS: &str = "## Stage: plan

Investigate the work item below and write an implementation plan. Read the
relevant code, identify the files to change and the risks involved, and
describe how the acceptance criteria will be verified.

Do NOT modify any files in this stage.
";

const EXECUTE_INSTRUCTIONS: &str = "## Stage: execute

Implement the work item below in the project directory. Keep the change
focused on what the acceptance criteria require and follow the existing
conventions of the codebase.
";

const TEST_INSTRUCTIONS: &str = "## Stage: test

Verify the implementation of the work item below. Run the project's tests
and check every acceptance criterion. Exit with a nonzero status if any
criterion is not met, and explain what failed.
";

fn stage_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::Plan => PLAN_INSTRUCTIONS,
        Stage::Execute => EXECUTE_INSTRUCTIONS,
        Stage::Test => TEST_INSTRUCTIONS,
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build the full prompt for one stage run.
pub fn build_stage_prompt(ctx: &PromptContext<'_>) -> String {
    let item = ctx.item;
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(&format!("# Work item #{}: {}\n\n", item.id, item.title));
    prompt.push_str(stage_instructions(ctx.stage));
    prompt.push('\n');

    prompt.push_str("## Details\n\n");
    prompt.push_str(&format!("- **Kind:** {}\n", item.kind));
    prompt.push_str(&format!("- **Priority:** {}\n", item.priority));
    if let Some(severity) = item.severity {
        prompt.push_str(&format!("- **Severity:** {severity}\n"));
    }
    if let Some(parent) = item.parent_id {
        prompt.push_str(&format!("- **Parent work item:** #{parent}\n"));
    }
    prompt.push('\n');

    let body = if item.body.trim().is_empty() {
        item.body_text.trim()
    } else {
        item.body.trim()
    };
    if !body.is_empty() {
        prompt.push_str("## Description\n\n");
        prompt.push_str(body);
        prompt.push_str("\n\n");
    }

    if !item.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n\n");
        for criterion in item.acceptance_criteria.iter() {
            prompt.push_str(&format!("- {criterion}\n"));
        }
        prompt.push('\n');
    }

    if !ctx.open_findings.is_empty() {
        prompt.push_str("## Open findings\n\n");
        for finding in ctx.open_findings {
            let marker = if finding.blocking { ", blocking" } else { "" };
            prompt.push_str(&format!(
                "- [{}{marker}] {}\n",
                finding.severity, finding.title
            ));
            for line in finding.details.lines().filter(|l| !l.trim().is_empty()) {
                prompt.push_str(&format!("  {line}\n"));
            }
        }
        prompt.push('\n');
    }

    if !ctx.attachments.is_empty() {
        prompt.push_str("## Attachments\n\n");
        for a in ctx.attachments {
            prompt.push_str(&format!(
                "- `{}` ({}, {} bytes) at `{}`\n",
                a.file_name, a.mime_type, a.size_bytes, a.file_path
            ));
        }
        prompt.push('\n');
    }

    if let Some(skill) = ctx.skill {
        prompt.push_str(&format!("## Skill profile: {}\n\n", skill.name));
        if !skill.skills.is_empty() {
            prompt.push_str(&format!("Skills: {}\n\n", skill.skills.join(", ")));
        }
        if let Some(instructions) = skill.instructions.as_deref().map(str::trim) {
            if !instructions.is_empty() {
                prompt.push_str(instructions);
                prompt.push_str("\n\n");
            }
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use foreman_db::models::{
        Complexity, FindingStatus, Severity, WorkItemKind, WorkItemStatus,
    };
    use sqlx::types::Json;

    use super::*;

    fn item() -> WorkItem {
        let now = Utc::now();
        WorkItem {
            id: 7,
            kind: WorkItemKind::Bug,
            title: "Login button does nothing".into(),
            body: "Clicking login on Safari has no effect.".into(),
            body_text: String::new(),
            status: WorkItemStatus::Triaged,
            priority: 2,
            severity: Some(Severity::High),
            complexity: Complexity::Medium,
            project_path: "/srv/app".into(),
            parent_id: None,
            acceptance_criteria: Json(vec!["login works on Safari".into()]),
            claimed_at: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    #[test]
    fn includes_item_and_criteria() {
        let item = item();
        let prompt = build_stage_prompt(&PromptContext {
            stage: Stage::Execute,
            item: &item,
            open_findings: &[],
            attachments: &[],
            skill: None,
        });
        assert!(prompt.starts_with("# Work item #7: Login button does nothing"));
        assert!(prompt.contains("## Stage: execute"));
        assert!(prompt.contains("- **Severity:** high"));
        assert!(prompt.contains("Clicking login on Safari"));
        assert!(prompt.contains("- login works on Safari"));
        assert!(!prompt.contains("## Open findings"));
    }

    #[test]
    fn lists_findings_and_skill_instructions() {
        let item = item();
        let finding = Finding {
            id: 1,
            work_item_id: 7,
            run_id: Some(3),
            severity: Severity::High,
            title: "test stage failed".into(),
            details: "exit code 1".into(),
            blocking: true,
            status: FindingStatus::Open,
            child_work_item_id: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let skill = SkillProfile {
            id: 1,
            name: "frontend".into(),
            skills: Json(vec!["playwright".into()]),
            instructions: Some("Run the e2e suite.".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let prompt = build_stage_prompt(&PromptContext {
            stage: Stage::Test,
            item: &item,
            open_findings: std::slice::from_ref(&finding),
            attachments: &[],
            skill: Some(&skill),
        });
        assert!(prompt.contains("- [high, blocking] test stage failed"));
        assert!(prompt.contains("  exit code 1"));
        assert!(prompt.contains("Skills: playwright"));
        assert!(prompt.contains("Run the e2e suite."));
    }
}
