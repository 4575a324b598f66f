//! Data-analysis skill: tabular data in, report plus charts out.

use std::path::PathBuf;

use crate::domain::JobContext;
use crate::error::SkillError;
use crate::skills::{check_required_files, Skill, SkillDescriptor};

const DATA_KEYWORDS: &[&str] = &[
    "data",
    "analysis",
    "analyze",
    "statistics",
    "report",
    "trend",
    "csv",
    "excel",
    "dataset",
    "summarize",
];

const DATA_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls", "parquet", "json"];

pub struct DataAnalysisSkill;

impl Skill for DataAnalysisSkill {
    fn descriptor(&self) -> SkillDescriptor {
        SkillDescriptor {
            code: "data-analysis".to_string(),
            name: "Data Analysis".to_string(),
            aliases: vec!["analysis".to_string(), "csv-analysis".to_string()],
            version: "1.0.0".to_string(),
            schema_version: "1.0.0".to_string(),
            description: "Analyze tabular data and output a report with charts.".to_string(),
            task_type: "data_analysis".to_string(),
        }
    }

    fn score(&self, requirement: &str, files: &[PathBuf]) -> f64 {
        let text = requirement.to_lowercase();
        let keyword_hits = DATA_KEYWORDS.iter().filter(|kw| text.contains(*kw)).count();
        let file_hits = files
            .iter()
            .filter(|path| {
                path.extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        DATA_EXTENSIONS.contains(&ext.as_str())
                    })
                    .unwrap_or(false)
            })
            .count();
        (0.15 + keyword_hits as f64 * 0.12 + file_hits as f64 * 0.2).min(1.0)
    }

    fn build_execution_plan(&self, ctx: &JobContext) -> serde_json::Value {
        let contract = ctx.output_contract.clone().unwrap_or_else(|| {
            serde_json::json!({
                "required_files": ["report.md"],
                "suggested_files": ["charts/overview.png"],
            })
        });
        serde_json::json!({
            "schema_version": "1.0.0",
            "selected_skill": "data-analysis",
            "output_contract": contract,
            "packaging_rules": {
                "include": ["outputs/**", "job/request.md", "job/execution-plan.json"]
            },
            "timeouts": { "soft_seconds": 900, "hard_seconds": 1200 },
            "retry_policy": { "max_attempts": 2, "backoff_seconds": [30, 120] },
            "analysis_rules": {
                "chart_engine": "matplotlib",
                "write_assumptions_to_readme": true,
            },
        })
    }

    fn build_prompt(&self, _ctx: &JobContext, plan: &serde_json::Value) -> String {
        format!(
            "Execute the data-analysis skill for this job.\n\
             Hard requirements:\n\
             - Read raw data from inputs/ and never modify the originals\n\
             - Write structured findings to outputs/report.md\n\
             - Render reproducible charts under outputs/charts/ (png preferred)\n\
             - When column semantics are unclear, make minimal reasonable assumptions and record them in outputs/README.md\n\
             - Deliver exactly what the output_contract in execution-plan.json requires\n\n\
             execution-plan.json:\n{}\n",
            serde_json::to_string_pretty(plan).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    fn validate_outputs(&self, ctx: &JobContext) -> Result<(), SkillError> {
        let report = ctx.workspace_dir.join("outputs").join("report.md");
        if !report.exists() {
            return Err(SkillError::ContractViolated {
                reason: "data-analysis requires outputs/report.md".to_string(),
            });
        }
        check_required_files(ctx)
    }

    fn artifact_manifest(&self, _ctx: &JobContext) -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({ "kind": "report", "path": "outputs/report.md" }),
            serde_json::json!({ "kind": "chart_dir", "path": "outputs/charts" }),
        ]
    }
}
