//! Generic fallback skill for requests no specialist matches.

use std::path::PathBuf;

use crate::domain::JobContext;
use crate::error::SkillError;
use crate::skills::{
    check_required_files, required_files_from_contract, Skill, SkillDescriptor, DEFAULT_SKILL_CODE,
};

pub struct GeneralDefaultSkill;

impl Skill for GeneralDefaultSkill {
    fn descriptor(&self) -> SkillDescriptor {
        SkillDescriptor {
            code: DEFAULT_SKILL_CODE.to_string(),
            name: "General Default".to_string(),
            aliases: vec!["auto".to_string(), "general".to_string()],
            version: "1.0.0".to_string(),
            schema_version: "1.0.0".to_string(),
            description: "Generic fallback skill for unmatched requirements.".to_string(),
            task_type: "general".to_string(),
        }
    }

    fn score(&self, requirement: &str, _files: &[PathBuf]) -> f64 {
        // A flat baseline keeps the fallback viable without ever beating
        // a specialist that actually matched something.
        if requirement.trim().is_empty() {
            0.2
        } else {
            0.5
        }
    }

    fn build_execution_plan(&self, ctx: &JobContext) -> serde_json::Value {
        let required_files = required_files_from_contract(ctx.output_contract.as_ref());
        serde_json::json!({
            "schema_version": "1.0.0",
            "selected_skill": DEFAULT_SKILL_CODE,
            "output_contract": ctx
                .output_contract
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "required_files": [] })),
            "packaging_rules": {
                "include": [
                    "outputs/**",
                    "job/execution-plan.json",
                    "job/request.md",
                    "logs/agent-last-message.md",
                    "manifest.json",
                ]
            },
            "timeouts": { "soft_seconds": 900, "hard_seconds": 1200 },
            "retry_policy": { "max_attempts": 2, "backoff_seconds": [30, 120] },
            "hints": {
                "required_files": required_files,
                "write_readme_for_assumptions": true,
            },
        })
    }

    fn build_prompt(&self, ctx: &JobContext, plan: &serde_json::Value) -> String {
        format!(
            "You are an enterprise task execution agent. Follow these constraints strictly:\n\
             - Working directory: {}\n\
             - Input directory: inputs/\n\
             - Output directory: outputs/\n\
             - Plan file: job/execution-plan.json\n\
             - Requirement file: job/request.md\n\
             - Execute as skill: {}\n\
             - Never modify files under inputs/\n\
             - Write all results only into outputs/\n\
             - When information is missing, make minimal reasonable assumptions and record them in outputs/README.md\n\
             - Satisfy the output_contract in execution-plan.json before anything else\n\n\
             execution-plan.json:\n{}\n",
            ctx.workspace_dir.display(),
            ctx.selected_skill,
            serde_json::to_string_pretty(plan).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    fn validate_outputs(&self, ctx: &JobContext) -> Result<(), SkillError> {
        let outputs_dir = ctx.workspace_dir.join("outputs");
        let has_any_file = outputs_dir.exists()
            && walk_has_file(&outputs_dir);
        if !has_any_file {
            return Err(SkillError::OutputsMissing {
                reason: "outputs/ is empty".to_string(),
            });
        }
        check_required_files(ctx)
    }

    fn artifact_manifest(&self, _ctx: &JobContext) -> Vec<serde_json::Value> {
        vec![serde_json::json!({ "kind": "default", "path": "outputs/" })]
    }
}

fn walk_has_file(dir: &std::path::Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() || (path.is_dir() && walk_has_file(&path)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(workspace: &std::path::Path) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            tenant_id: "default".to_string(),
            requirement: "do something useful".to_string(),
            workspace_dir: workspace.to_path_buf(),
            input_files: Vec::new(),
            selected_skill: DEFAULT_SKILL_CODE.to_string(),
            agent: "build".to_string(),
            model: None,
            output_contract: None,
        }
    }

    #[test]
    fn empty_outputs_violate_the_contract() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("outputs")).unwrap();
        let err = GeneralDefaultSkill.validate_outputs(&ctx(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("outputs/ is empty"));
    }

    #[test]
    fn nested_output_counts_as_non_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("outputs/sub")).unwrap();
        std::fs::write(tmp.path().join("outputs/sub/out.txt"), "x").unwrap();
        assert!(GeneralDefaultSkill.validate_outputs(&ctx(tmp.path())).is_ok());
    }

    #[test]
    fn prompt_embeds_workspace_and_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let plan = GeneralDefaultSkill.build_execution_plan(&ctx);
        let prompt = GeneralDefaultSkill.build_prompt(&ctx, &plan);
        assert!(prompt.contains(&tmp.path().display().to_string()));
        assert!(prompt.contains("Never modify files under inputs/"));
        assert!(prompt.contains("execution-plan.json"));
    }

    #[test]
    fn baseline_score_sits_above_threshold_floor() {
        assert_eq!(GeneralDefaultSkill.score("anything", &[]), 0.5);
        assert_eq!(GeneralDefaultSkill.score("  ", &[]), 0.2);
    }
}
