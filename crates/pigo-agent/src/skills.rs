//! Skills — SKILL.md instruction documents that teach the model workflows.
//!
//! Each skill lives in its own directory under the skills root as a
//! `SKILL.md` file with YAML frontmatter. Metadata is loaded once at agent
//! construction; bodies are read lazily when a skill is actually injected.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

/// YAML frontmatter metadata for a skill.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    /// When true the model cannot pull this skill in via `use_skill`; it is
    /// also excluded from pre-flight matching.
    #[serde(default)]
    pub disable_model_invocation: bool,
}

/// A discovered skill. The body stays on disk until needed.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub file_path: PathBuf,
    pub disable_model_invocation: bool,
}

impl Skill {
    /// Read and return the skill body with frontmatter stripped.
    pub fn load_body(&self) -> std::io::Result<String> {
        let raw = std::fs::read_to_string(&self.file_path)?;
        Ok(match parse_frontmatter(&raw) {
            Some((_, body)) => body,
            None => raw,
        })
    }

    /// Render the injection envelope around the skill body.
    pub fn envelope(&self) -> std::io::Result<String> {
        let body = self.load_body()?;
        Ok(format!("<skill name=\"{}\">\n{}\n</skill>", self.name, body))
    }
}

/// Load all skills from `dir`. Each immediate subdirectory containing a
/// `SKILL.md` with valid frontmatter yields one skill; duplicates by name
/// are dropped (first wins).
pub fn load_skills(dir: &Path) -> Vec<Skill> {
    let mut seen = HashSet::new();
    let mut skills = Vec::new();

    if !dir.is_dir() {
        return skills;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return skills,
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if !path.is_dir() {
            continue;
        }
        let skill_file = path.join("SKILL.md");
        if !skill_file.is_file() {
            continue;
        }

        let raw = match std::fs::read_to_string(&skill_file) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let Some((meta, _)) = parse_frontmatter(&raw) else {
            debug!(path = %skill_file.display(), "skipping skill: invalid frontmatter");
            continue;
        };

        if !seen.insert(meta.name.clone()) {
            continue;
        }

        skills.push(Skill {
            name: meta.name,
            description: meta.description,
            file_path: skill_file,
            disable_model_invocation: meta.disable_model_invocation,
        });
    }

    debug!(count = skills.len(), dir = %dir.display(), "skills loaded");
    skills
}

/// Split a SKILL.md file into YAML frontmatter and markdown body.
///
/// Frontmatter sits between `---` delimiters at the top of the file.
pub fn parse_frontmatter(content: &str) -> Option<(SkillMeta, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }

    let after_first = &trimmed[3..];
    let closing_idx = after_first.find("\n---")?;
    let yaml_block = &after_first[..closing_idx];
    let body_start = closing_idx + 4; // skip "\n---"
    let body = if body_start < after_first.len() {
        after_first[body_start..].trim_start_matches('\n').to_string()
    } else {
        String::new()
    };

    let meta: SkillMeta = serde_yaml::from_str(yaml_block).ok()?;
    Some((meta, body))
}
