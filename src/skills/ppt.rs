//! Slide-deck skill: requirement plus media assets in, pptx out.

use std::path::PathBuf;

use crate::domain::JobContext;
use crate::error::SkillError;
use crate::skills::{check_required_files, Skill, SkillDescriptor};

const PPT_KEYWORDS: &[&str] = &["ppt", "slide", "slides", "presentation", "deck", "pitch"];

const STRONG_MEDIA_EXTENSIONS: &[&str] = &["pptx"];
const WEAK_MEDIA_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "pdf"];

pub struct PptSkill;

impl Skill for PptSkill {
    fn descriptor(&self) -> SkillDescriptor {
        SkillDescriptor {
            code: "ppt".to_string(),
            name: "PPT Generator".to_string(),
            aliases: vec!["slides".to_string(), "presentation".to_string()],
            version: "1.0.0".to_string(),
            schema_version: "1.0.0".to_string(),
            description: "Generate a slide deck from the requirement and media assets.".to_string(),
            task_type: "presentation".to_string(),
        }
    }

    fn score(&self, requirement: &str, files: &[PathBuf]) -> f64 {
        let text = requirement.to_lowercase();
        let keyword_hits = PPT_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();
        let mut file_score = 0.0;
        for path in files {
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
                continue;
            };
            if STRONG_MEDIA_EXTENSIONS.contains(&ext.as_str()) {
                file_score += 0.45;
            } else if WEAK_MEDIA_EXTENSIONS.contains(&ext.as_str()) {
                file_score += 0.12;
            }
        }
        (0.08 + keyword_hits as f64 * 0.14 + file_score).min(1.0)
    }

    fn build_execution_plan(&self, ctx: &JobContext) -> serde_json::Value {
        let contract = ctx
            .output_contract
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "required_files": ["slides.pptx"] }));
        serde_json::json!({
            "schema_version": "1.0.0",
            "selected_skill": "ppt",
            "output_contract": contract,
            "packaging_rules": {
                "include": ["outputs/**", "job/request.md", "job/execution-plan.json"]
            },
            "timeouts": { "soft_seconds": 900, "hard_seconds": 1200 },
            "retry_policy": { "max_attempts": 2, "backoff_seconds": [30, 120] },
            "ppt_rules": {
                "theme": "professional",
                "write_assumptions_to_readme": true,
            },
        })
    }

    fn build_prompt(&self, _ctx: &JobContext, plan: &serde_json::Value) -> String {
        format!(
            "Execute the ppt skill for this job.\n\
             Hard requirements:\n\
             - Read text and image assets from inputs/\n\
             - Deliver the deck as outputs/slides.pptx\n\
             - Optional previews may go to outputs/preview/*.png\n\
             - When information is missing, make minimal reasonable assumptions and record them in outputs/README.md\n\
             - Never modify inputs/\n\
             - Satisfy the output_contract in execution-plan.json exactly\n\n\
             execution-plan.json:\n{}\n",
            serde_json::to_string_pretty(plan).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    fn validate_outputs(&self, ctx: &JobContext) -> Result<(), SkillError> {
        let slides = ctx.workspace_dir.join("outputs").join("slides.pptx");
        if !slides.exists() {
            return Err(SkillError::ContractViolated {
                reason: "ppt skill requires outputs/slides.pptx".to_string(),
            });
        }
        check_required_files(ctx)
    }

    fn artifact_manifest(&self, _ctx: &JobContext) -> Vec<serde_json::Value> {
        vec![serde_json::json!({ "kind": "slides", "path": "outputs/slides.pptx" })]
    }
}
