//! Include/exclude rules shared by both vault backends.
//!
//! Paths are vault-relative, `/`-separated, and matched case-insensitively.

use anyhow::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use cope_rag_core::Error;

use crate::config::VaultConfig;

/// Folder and glob rules deciding which vault paths are visible.
#[derive(Debug, Clone)]
pub struct VaultRules {
    included_folders: Vec<String>,
    excluded_folders: Vec<String>,
    excluded_patterns: GlobSet,
}

fn clean_folder(folder: &str) -> Option<String> {
    let f = folder.trim().trim_matches('/').to_lowercase();
    (!f.is_empty()).then_some(f)
}

fn under(rel_lower: &str, folder: &str) -> bool {
    rel_lower == folder
        || rel_lower
            .strip_prefix(folder)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Normalize a caller-supplied relative path to `a/b/c.md` form.
pub fn normalize_rel(path: &str) -> String {
    let p = path.trim().replace('\\', "/");
    let p = p.trim_start_matches("./").trim_start_matches('/');
    p.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl VaultRules {
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.excluded_patterns {
            let glob = GlobBuilder::new(pattern.trim())
                .case_insensitive(true)
                .literal_separator(false)
                .build()?;
            builder.add(glob);
        }
        Ok(Self {
            included_folders: config.included_folders.iter().filter_map(|f| clean_folder(f)).collect(),
            excluded_folders: config.excluded_folders.iter().filter_map(|f| clean_folder(f)).collect(),
            excluded_patterns: builder.build()?,
        })
    }

    pub fn is_excluded(&self, rel: &str) -> bool {
        let rel = normalize_rel(rel);
        let rel_lower = rel.to_lowercase();
        self.excluded_folders.iter().any(|f| under(&rel_lower, f)) || self.excluded_patterns.is_match(&rel)
    }

    pub fn is_included(&self, rel: &str) -> bool {
        if self.included_folders.is_empty() {
            return true;
        }
        let rel_lower = normalize_rel(rel).to_lowercase();
        self.included_folders.iter().any(|f| under(&rel_lower, f))
    }

    pub fn allows(&self, rel: &str) -> bool {
        self.is_included(rel) && !self.is_excluded(rel)
    }

    /// Reject `rel` with [`Error::PathRejected`] unless the rules allow it.
    pub fn check(&self, rel: &str) -> cope_rag_core::Result<()> {
        if self.is_excluded(rel) {
            return Err(Error::path_rejected(rel, "matches an excluded folder or pattern"));
        }
        if !self.is_included(rel) {
            return Err(Error::path_rejected(rel, "outside the included folders"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(included: &[&str]) -> VaultRules {
        let config = VaultConfig {
            included_folders: included.iter().map(|s| s.to_string()).collect(),
            excluded_patterns: vec![".obsidian/**".into(), "**/*.excalidraw.md".into()],
            ..VaultConfig::default()
        };
        VaultRules::from_config(&config).unwrap()
    }

    #[test]
    fn test_excluded_folders_are_case_insensitive() {
        let r = rules(&[]);
        assert!(r.is_excluded("Templates/daily.md"));
        assert!(r.is_excluded("attachments"));
        assert!(!r.is_excluded("templates-old/x.md"));
        assert!(!r.is_excluded("Cours/x.md"));
    }

    #[test]
    fn test_excluded_patterns() {
        let r = rules(&[]);
        assert!(r.is_excluded(".obsidian/workspace.md"));
        assert!(r.is_excluded("Cours/plan.excalidraw.md"));
        assert!(r.check("Cours/plan.md").is_ok());
    }

    #[test]
    fn test_included_folders_restrict() {
        let r = rules(&["ChatEPS", "/Cours/"]);
        assert!(r.allows("ChatEPS/note.md"));
        assert!(r.allows("cours/sub/x.md"));
        assert!(!r.allows("Other/x.md"));
        assert!(r.check("Other/x.md").unwrap_err().is_path_rejected());
    }

    #[test]
    fn test_normalize_rel() {
        assert_eq!(normalize_rel("./a//b\\c.md"), "a/b/c.md");
        assert_eq!(normalize_rel("/a/./b.md"), "a/b.md");
    }
}
