use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

/// Filesystem access confined to a base directory.
///
/// Every operation takes a script-relative path. Confinement is a two-step
/// process: the script path is first normalized against a synthetic absolute
/// root (so any run of leading `..` collapses to nothing), and only then
/// joined onto the base directory. Normalizing *before* the join is the
/// enforcement mechanism — done the other way around, `../../etc/passwd`
/// would walk right out of the root.
///
/// All I/O uses `tokio::fs` so large reads never block the async runtime.
#[derive(Debug, Clone)]
pub struct ConfinedFileAccess {
    base: PathBuf,
}

impl ConfinedFileAccess {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a script-relative path to an absolute host path inside the
    /// base directory.
    pub fn resolve(&self, script_path: &str) -> Result<PathBuf, SandboxError> {
        if script_path.contains('\0') {
            return Err(SandboxError::PathTraversalRejected(PathBuf::from(
                script_path.replace('\0', ""),
            )));
        }

        // Normalize as if rooted at "/": `.` vanishes, `..` pops one level
        // and is a no-op at the root.
        let mut normalized = PathBuf::new();
        for component in Path::new(script_path).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        let joined = self.base.join(&normalized);
        if !joined.starts_with(&self.base) {
            return Err(SandboxError::PathTraversalRejected(joined));
        }
        Ok(joined)
    }

    /// Whether the path exists. A real I/O failure (as opposed to plain
    /// absence) is propagated, not folded into `false`.
    pub async fn exists(&self, script_path: &str) -> Result<bool, SandboxError> {
        let path = self.resolve(script_path)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Metadata for a path, or `None` when it does not exist.
    pub async fn stat(&self, script_path: &str) -> Result<Option<Metadata>, SandboxError> {
        let path = self.resolve(script_path)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Entry names of a directory, or `None` when it does not exist.
    pub async fn list_directory(
        &self,
        script_path: &str,
    ) -> Result<Option<Vec<String>>, SandboxError> {
        let path = self.resolve(script_path)?;
        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(Some(entries))
    }

    pub async fn read(&self, script_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(script_path)?;
        Ok(tokio::fs::read(&path).await?)
    }

    pub async fn read_to_string(&self, script_path: &str) -> Result<String, SandboxError> {
        let path = self.resolve(script_path)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    pub async fn write(&self, script_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let path = self.resolve(script_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(base: &str) -> ConfinedFileAccess {
        ConfinedFileAccess::new(base)
    }

    #[test]
    fn test_resolve_plain_path() {
        let fs = access("/game/assets");
        assert_eq!(
            fs.resolve("maps/level1.rhai").unwrap(),
            PathBuf::from("/game/assets/maps/level1.rhai")
        );
    }

    #[test]
    fn test_resolve_clamps_parent_traversal() {
        let fs = access("/game/assets");
        assert_eq!(
            fs.resolve("../../secret").unwrap(),
            PathBuf::from("/game/assets/secret")
        );
        // Any number of leading ../ segments stays inside the base
        assert_eq!(
            fs.resolve("../../../../../../etc/passwd").unwrap(),
            PathBuf::from("/game/assets/etc/passwd")
        );
    }

    #[test]
    fn test_resolve_interior_dotdot() {
        let fs = access("/game/assets");
        assert_eq!(
            fs.resolve("maps/../scripts/./main.rhai").unwrap(),
            PathBuf::from("/game/assets/scripts/main.rhai")
        );
    }

    #[test]
    fn test_resolve_absolute_path_is_rerooted() {
        let fs = access("/game/assets");
        assert_eq!(
            fs.resolve("/etc/passwd").unwrap(),
            PathBuf::from("/game/assets/etc/passwd")
        );
    }

    #[test]
    fn test_resolve_rejects_nul() {
        let fs = access("/game/assets");
        assert!(matches!(
            fs.resolve("a\0b"),
            Err(SandboxError::PathTraversalRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ConfinedFileAccess::new(dir.path());

        fs.write("state/save.json", b"{\"hp\":10}").await.unwrap();
        let data = fs.read("state/save.json").await.unwrap();
        assert_eq!(data, b"{\"hp\":10}");
        assert!(fs.exists("state/save.json").await.unwrap());
        assert!(!fs.exists("state/other.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_write_lands_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ConfinedFileAccess::new(dir.path());

        fs.write("../escape.txt", b"clamped").await.unwrap();
        assert!(dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_exists_propagates_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ConfinedFileAccess::new(dir.path());

        fs.write("plain.txt", b"x").await.unwrap();
        // Walking through a regular file is an I/O error, not absence
        assert!(matches!(
            fs.exists("plain.txt/child").await,
            Err(SandboxError::Io(_))
        ));
        assert!(!fs.exists("absent.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_stat_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ConfinedFileAccess::new(dir.path());

        assert!(fs.stat("nope.txt").await.unwrap().is_none());
        fs.write("yes.txt", b"x").await.unwrap();
        let meta = fs.stat("yes.txt").await.unwrap().unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.len(), 1);
    }

    #[tokio::test]
    async fn test_list_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fs = ConfinedFileAccess::new(dir.path());

        assert!(fs.list_directory("maps").await.unwrap().is_none());
        fs.write("maps/a.rhai", b"1").await.unwrap();
        fs.write("maps/b.rhai", b"2").await.unwrap();
        let entries = fs.list_directory("maps").await.unwrap().unwrap();
        assert_eq!(entries, vec!["a.rhai".to_string(), "b.rhai".to_string()]);
    }
}
