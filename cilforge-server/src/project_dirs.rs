//! On-disk layout (§6 "On-disk layout"): `BaseDLL/`, `Output/`, `OutputTemp/` under a
//! per-project cache root. The server is handed an arbitrary absolute `project_path` on
//! `initialize`; this module turns that into a stable, collision-resistant directory name under
//! the configured `cache_root` rather than trying to mirror the path itself (which may contain
//! characters the host filesystem rejects, or collide across drives/mount points).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProjectDirs {
    root: PathBuf,
}

impl ProjectDirs {
    pub fn resolve(cache_root: &Path, project_path: &Path) -> Self {
        let mut hasher = DefaultHasher::new();
        project_path.hash(&mut hasher);
        let digest = hasher.finish();

        let readable = project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let sanitized: String = readable.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();

        Self { root: cache_root.join(format!("{sanitized}-{digest:016x}")) }
    }

    pub fn base_dll_dir(&self) -> PathBuf {
        self.root.join("BaseDLL")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("Output")
    }

    pub fn output_temp_dir(&self) -> PathBuf {
        self.root.join("OutputTemp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_project_path_resolves_to_same_directory() {
        let a = ProjectDirs::resolve(Path::new("/cache"), Path::new("/home/user/MyGame"));
        let b = ProjectDirs::resolve(Path::new("/cache"), Path::new("/home/user/MyGame"));
        assert_eq!(a.base_dll_dir(), b.base_dll_dir());
    }

    #[test]
    fn distinct_project_paths_do_not_collide() {
        let a = ProjectDirs::resolve(Path::new("/cache"), Path::new("/home/user/MyGame"));
        let b = ProjectDirs::resolve(Path::new("/cache"), Path::new("/home/user/OtherGame"));
        assert_ne!(a.base_dll_dir(), b.base_dll_dir());
    }
}
