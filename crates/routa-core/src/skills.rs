//! Skill lookup
//!
//! A skill is a named block of instructions prepended to the first prompt of
//! a session.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SkillResolver: Send + Sync {
    /// Literal skill text for `name`, if the skill exists
    async fn resolve(&self, name: &str) -> Option<String>;
}

/// Reads `<dir>/<name>/SKILL.md`, falling back to `<dir>/<name>.md`
pub struct DirectorySkillResolver {
    root: PathBuf,
}

impl DirectorySkillResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SkillResolver for DirectorySkillResolver {
    async fn resolve(&self, name: &str) -> Option<String> {
        // Skill names are single path components.
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return None;
        }
        let candidates = [
            self.root.join(name).join("SKILL.md"),
            self.root.join(format!("{}.md", name)),
        ];
        for path in candidates {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                debug!("Resolved skill {} from {:?}", name, path);
                return Some(content);
            }
        }
        None
    }
}

/// Resolver used when no skills directory is configured
pub struct NoSkills;

#[async_trait]
impl SkillResolver for NoSkills {
    async fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_resolver() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("review")).unwrap();
        std::fs::write(dir.path().join("review").join("SKILL.md"), "Review carefully").unwrap();
        std::fs::write(dir.path().join("plan.md"), "Plan first").unwrap();

        let resolver = DirectorySkillResolver::new(dir.path());
        assert_eq!(resolver.resolve("review").await.as_deref(), Some("Review carefully"));
        assert_eq!(resolver.resolve("plan").await.as_deref(), Some("Plan first"));
        assert!(resolver.resolve("missing").await.is_none());
        assert!(resolver.resolve("../plan").await.is_none());
        assert!(NoSkills.resolve("plan").await.is_none());
    }
}
