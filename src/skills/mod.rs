//! Pluggable skills: strategies that turn a request into an execution
//! plan, a prompt, and an output validator.
//!
//! Skills are compiled-in value objects. They never touch the store or
//! the queue; new skills are added by registering a descriptor in
//! [`SkillRegistry::with_builtin_skills`].

mod data_analysis;
mod general;
mod ppt;

pub use data_analysis::DataAnalysisSkill;
pub use general::GeneralDefaultSkill;
pub use ppt::PptSkill;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::JobContext;
use crate::error::SkillError;

/// Code of the fallback skill used when routing confidence is low.
pub const DEFAULT_SKILL_CODE: &str = "general-default";

/// Skill metadata exposed through the API and used by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub code: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub version: String,
    pub schema_version: String,
    pub description: String,
    pub task_type: String,
}

/// A pluggable execution strategy.
pub trait Skill: Send + Sync {
    fn descriptor(&self) -> SkillDescriptor;

    /// Confidence in [0, 1] that this skill fits the request.
    fn score(&self, requirement: &str, files: &[PathBuf]) -> f64;

    /// Structured plan persisted to `job/execution-plan.json`.
    fn build_execution_plan(&self, ctx: &JobContext) -> serde_json::Value;

    /// Final prompt sent to the agent, embedding the plan snapshot.
    fn build_prompt(&self, ctx: &JobContext, plan: &serde_json::Value) -> String;

    /// Check the `outputs/` tree against the contract after execution.
    fn validate_outputs(&self, ctx: &JobContext) -> Result<(), SkillError>;

    /// Declared artifacts, included in the skill detail endpoint.
    fn artifact_manifest(&self, ctx: &JobContext) -> Vec<serde_json::Value>;
}

/// Pull the required-file list out of an output contract.
///
/// Contracts are user-supplied, so several key spellings are accepted.
pub(crate) fn required_files_from_contract(contract: Option<&serde_json::Value>) -> Vec<String> {
    let Some(contract) = contract else {
        return Vec::new();
    };
    for key in ["required_files", "files", "required"] {
        if let Some(values) = contract.get(key).and_then(|v| v.as_array()) {
            return values
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

/// Check each required file exists under `outputs/`.
pub(crate) fn check_required_files(ctx: &JobContext) -> Result<(), SkillError> {
    let outputs_dir = ctx.workspace_dir.join("outputs");
    for required in required_files_from_contract(ctx.output_contract.as_ref()) {
        if !outputs_dir.join(&required).exists() {
            return Err(SkillError::ContractViolated {
                reason: format!("missing required output file: {required}"),
            });
        }
    }
    Ok(())
}

/// Registry of all available skills, addressable by code or alias.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
    aliases: HashMap<String, String>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Registry with all compiled-in skills.
    pub fn with_builtin_skills() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GeneralDefaultSkill));
        registry.register(Arc::new(DataAnalysisSkill));
        registry.register(Arc::new(PptSkill));
        registry
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        let descriptor = skill.descriptor();
        for alias in &descriptor.aliases {
            self.aliases.insert(alias.clone(), descriptor.code.clone());
        }
        self.skills.insert(descriptor.code, skill);
    }

    /// Resolve a skill by code or alias.
    pub fn get(&self, code: &str) -> Result<Arc<dyn Skill>, SkillError> {
        if let Some(skill) = self.skills.get(code) {
            return Ok(Arc::clone(skill));
        }
        if let Some(canonical) = self.aliases.get(code) {
            if let Some(skill) = self.skills.get(canonical) {
                return Ok(Arc::clone(skill));
            }
        }
        Err(SkillError::UnknownSkill {
            code: code.to_string(),
        })
    }

    pub fn all(&self) -> Vec<Arc<dyn Skill>> {
        self.skills.values().map(Arc::clone).collect()
    }

    pub fn list_descriptors(&self) -> Vec<SkillDescriptor> {
        let mut descriptors: Vec<SkillDescriptor> =
            self.skills.values().map(|s| s.descriptor()).collect();
        descriptors.sort_by(|a, b| a.code.cmp(&b.code));
        descriptors
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::with_builtin_skills()
    }
}

/// Result of routing a request to a skill.
pub struct RouteOutcome {
    // manual Debug impl below since `Arc<dyn Skill>` doesn't implement Debug
    pub skill: Arc<dyn Skill>,
    /// Set when the router fell back to the default skill.
    pub fallback_reason: Option<String>,
    /// Best non-default candidate and its score, for the audit trail.
    pub best_candidate: Option<(String, f64)>,
}

impl std::fmt::Debug for RouteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOutcome")
            .field("skill", &self.skill.descriptor().code)
            .field("fallback_reason", &self.fallback_reason)
            .field("best_candidate", &self.best_candidate)
            .finish()
    }
}

/// Scores candidates and falls back to the default skill below the
/// configured confidence threshold.
pub struct SkillRouter {
    registry: Arc<SkillRegistry>,
    fallback_threshold: f64,
}

impl SkillRouter {
    pub fn new(registry: Arc<SkillRegistry>, fallback_threshold: f64) -> Self {
        Self {
            registry,
            fallback_threshold,
        }
    }

    /// Resolve the skill to run.
    ///
    /// An explicit `skill_code` short-circuits scoring; an unknown code
    /// surfaces as [`SkillError::UnknownSkill`] for the API to map to
    /// a bad request.
    pub fn select(
        &self,
        requirement: &str,
        files: &[PathBuf],
        skill_code: Option<&str>,
    ) -> Result<RouteOutcome, SkillError> {
        if let Some(code) = skill_code {
            return Ok(RouteOutcome {
                skill: self.registry.get(code)?,
                fallback_reason: None,
                best_candidate: None,
            });
        }

        let mut best: Option<(f64, Arc<dyn Skill>)> = None;
        for skill in self.registry.all() {
            if skill.descriptor().code == DEFAULT_SKILL_CODE {
                continue;
            }
            let score = skill.score(requirement, files);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, skill));
            }
        }

        match best {
            Some((score, skill)) if score >= self.fallback_threshold => {
                let code = skill.descriptor().code;
                Ok(RouteOutcome {
                    skill,
                    fallback_reason: None,
                    best_candidate: Some((code, score)),
                })
            }
            Some((score, skill)) => Ok(RouteOutcome {
                skill: self.registry.get(DEFAULT_SKILL_CODE)?,
                fallback_reason: Some(format!(
                    "max score {:.2} below threshold {:.2}",
                    score, self.fallback_threshold
                )),
                best_candidate: Some((skill.descriptor().code, score)),
            }),
            None => Ok(RouteOutcome {
                skill: self.registry.get(DEFAULT_SKILL_CODE)?,
                fallback_reason: Some("no skill registered, fallback to default".to_string()),
                best_candidate: None,
            }),
        }
    }
}
