//! Target list loading.
//!
//! One target per line: `host[:port] [credential_ref]`. Blank lines and
//! anything after `#` are ignored. Duplicate identifiers keep the first
//! occurrence so a target never runs twice in one batch plan.

use std::collections::HashSet;
use std::path::Path;

use crate::model::Target;

use super::validation::ConfigError;

/// Parse a target list.
///
/// # Errors
/// `ConfigError::TargetError` for a line with more than two fields.
pub fn parse_targets(content: &str) -> Result<Vec<Target>, ConfigError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(id), credential) = (fields.next(), fields.next()) else {
            continue;
        };
        if fields.next().is_some() {
            return Err(ConfigError::TargetError {
                line: idx + 1,
                message: format!("expected 'host [credential]', got '{line}'"),
            });
        }

        if !seen.insert(id.to_string()) {
            tracing::warn!(line = idx + 1, target = id, "Duplicate target ignored");
            continue;
        }
        let target = Target::new(id);
        targets.push(match credential {
            Some(credential) => target.with_credential(credential),
            None => target,
        });
    }

    Ok(targets)
}

/// Read and parse a target list file.
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<Target>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let targets = parse_targets(&content)?;
    tracing::debug!(path = %path.display(), count = targets.len(), "Targets loaded");
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let content = "\
# production web tier
web01.example.com
web02.example.com:2222  ops-key   # non-standard ssh

10.0.0.7 vault:db-admin
";
        let targets = parse_targets(content).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].id(), "web01.example.com");
        assert_eq!(targets[0].credential(), None);
        assert_eq!(targets[1].port(), Some(2222));
        assert_eq!(targets[1].credential(), Some("ops-key"));
        assert_eq!(targets[2].credential(), Some("vault:db-admin"));
    }

    #[test]
    fn test_duplicates_keep_first() {
        let targets = parse_targets("a cred-1\nb\na cred-2\n").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].credential(), Some("cred-1"));
    }

    #[test]
    fn test_extra_fields_rejected() {
        let err = parse_targets("ok\nhost cred extra\n").unwrap_err();
        assert!(matches!(err, ConfigError::TargetError { line: 2, .. }));
    }

    #[test]
    fn test_load_targets_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.txt");
        std::fs::write(&path, "db01\ndb02\n").unwrap();
        assert_eq!(load_targets(&path).unwrap().len(), 2);
        assert!(matches!(
            load_targets(dir.path().join("missing.txt")),
            Err(ConfigError::IoError(_))
        ));
    }
}
