use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CBC_DIR: &str = ".cbc";
pub const CONFIG_FILE: &str = ".cbc/config.yaml";
pub const RUNS_DB_FILE: &str = ".cbc/runs.db";
pub const OBJECTS_DIR: &str = ".cbc/objects";
pub const COMPLIANCE_FILE: &str = ".cbc/compliance.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn cbc_dir(root: &Path) -> PathBuf {
    root.join(CBC_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn runs_db_path(root: &Path) -> PathBuf {
    root.join(RUNS_DB_FILE)
}

pub fn objects_dir(root: &Path) -> PathBuf {
    root.join(OBJECTS_DIR)
}

/// Resolve a configured path: absolute paths are used as-is, relative paths
/// are taken relative to the project root.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(config_path(root), PathBuf::from("/tmp/proj/.cbc/config.yaml"));
        assert_eq!(runs_db_path(root), PathBuf::from("/tmp/proj/.cbc/runs.db"));
        assert_eq!(objects_dir(root), PathBuf::from("/tmp/proj/.cbc/objects"));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            resolve(root, Path::new("/var/data")),
            PathBuf::from("/var/data")
        );
        assert_eq!(
            resolve(root, Path::new("data/objects")),
            PathBuf::from("/tmp/proj/data/objects")
        );
    }
}
