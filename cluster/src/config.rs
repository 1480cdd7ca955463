use std::path::{Path, PathBuf};

use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_DATA_PATH: &str = "data";
const DEFAULT_LOGS_PATH: &str = "logs";
/// Number of applied entries since the last snapshot that triggers a new one.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 8192;

/// Node configuration.
///
/// Built once at process start (flags and/or a TOML file) and passed by value
/// to [`Configuration::init`] and the consensus server. Nothing reads it from
/// global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub data_path: PathBuf,
    pub logs_path: PathBuf,
    /// Keep every store in memory and never touch the filesystem.
    pub dev_mode: bool,
    /// Allow this node to form a brand-new single member cluster when it
    /// finds no existing raft state.
    pub bootstrap: bool,
    pub snapshot_threshold: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            logs_path: PathBuf::from(DEFAULT_LOGS_PATH),
            dev_mode: false,
            bootstrap: false,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }
}

impl Configuration {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Path {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Configuration = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Err(Error::Config("snapshot_threshold must be positive".into()));
        }
        if !self.dev_mode && self.data_path.as_os_str().is_empty() {
            return Err(Error::Config("data_path must be set outside dev mode".into()));
        }
        if !self.dev_mode && self.logs_path.as_os_str().is_empty() {
            return Err(Error::Config("logs_path must be set outside dev mode".into()));
        }
        Ok(())
    }

    /// Prepares the on-disk layout: both directories are resolved to absolute
    /// paths and created (mode 0755) if missing. A no-op in dev mode.
    pub fn init(&self) -> Result<()> {
        if self.dev_mode {
            return Ok(());
        }
        let data_path = absolute(&self.data_path)?;
        create_dir(&data_path)?;
        let logs_path = absolute(&self.logs_path)?;
        create_dir(&logs_path)?;
        info!(
            "data path {}, logs path {}",
            data_path.display(),
            logs_path.display()
        );
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| Error::Path {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(path))
}

fn create_dir(path: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path).map_err(|source| Error::Path {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn durable(dir: &TempDir) -> Configuration {
        Configuration {
            data_path: dir.path().join("node/data"),
            logs_path: dir.path().join("node/logs"),
            ..Default::default()
        }
    }

    #[test]
    fn test_init_creates_directories() {
        let dir = TempDir::new().unwrap();
        let config = durable(&dir);
        config.init().unwrap();

        for path in [&config.data_path, &config.logs_path] {
            let meta = std::fs::metadata(path).unwrap();
            assert!(meta.is_dir());
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = meta.permissions().mode() & 0o777;
                assert_eq!(mode & 0o700, 0o700);
                assert_eq!(mode & !0o755, 0);
            }
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = durable(&dir);
        config.init().unwrap();
        std::fs::write(config.data_path.join("marker"), b"x").unwrap();

        config.init().unwrap();
        assert_eq!(std::fs::read(config.data_path.join("marker")).unwrap(), b"x");
        assert!(config.logs_path.is_dir());
    }

    #[test]
    fn test_dev_mode_skips_filesystem() {
        let dir = TempDir::new().unwrap();
        let config = Configuration {
            dev_mode: true,
            ..durable(&dir)
        };
        config.init().unwrap();
        assert!(!config.data_path.exists());
        assert!(!config.logs_path.exists());
    }

    #[test]
    fn test_init_fails_when_path_is_a_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let config = Configuration {
            data_path: blocker.join("data"),
            ..durable(&dir)
        };
        assert!(matches!(config.init(), Err(Error::Path { .. })));
    }

    #[test]
    fn test_from_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_path = \"/var/lib/node\"\nbootstrap = true\nsnapshot_threshold = 16\n",
        )
        .unwrap();

        let config = Configuration::from_toml(&path).unwrap();
        assert_eq!(config.data_path, PathBuf::from("/var/lib/node"));
        assert_eq!(config.logs_path, PathBuf::from(DEFAULT_LOGS_PATH));
        assert!(config.bootstrap);
        assert!(!config.dev_mode);
        assert_eq!(config.snapshot_threshold, 16);
    }

    #[test]
    fn test_from_toml_rejects_zero_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "snapshot_threshold = 0\n").unwrap();
        assert!(matches!(
            Configuration::from_toml(&path),
            Err(Error::Config(_))
        ));
    }
}
