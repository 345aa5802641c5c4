use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

pub const MB: u64 = 1_000_000;
pub const GB: u64 = 1_000_000_000;

/// rsync transfer flags applied to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub transfer_source_permissions: bool,
    pub transfer_source_owner: bool,
    pub transfer_source_group: bool,
    pub symlinks_as_symlinks: bool,
    pub transfer_device_files: bool,
    pub transfer_special_files: bool,
    pub compress_file_transfer: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            transfer_source_permissions: true,
            transfer_source_owner: false,
            transfer_source_group: false,
            symlinks_as_symlinks: true,
            transfer_device_files: false,
            transfer_special_files: false,
            compress_file_transfer: false,
        }
    }
}

/// Per-module overrides of [`TransferOptions`]. Unset fields inherit the global value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOverrides {
    pub transfer_source_permissions: Option<bool>,
    pub transfer_source_owner: Option<bool>,
    pub transfer_source_group: Option<bool>,
    pub symlinks_as_symlinks: Option<bool>,
    pub transfer_device_files: Option<bool>,
    pub transfer_special_files: Option<bool>,
    pub compress_file_transfer: Option<bool>,
}

impl TransferOverrides {
    pub fn apply(&self, base: TransferOptions) -> TransferOptions {
        TransferOptions {
            transfer_source_permissions: self
                .transfer_source_permissions
                .unwrap_or(base.transfer_source_permissions),
            transfer_source_owner: self.transfer_source_owner.unwrap_or(base.transfer_source_owner),
            transfer_source_group: self.transfer_source_group.unwrap_or(base.transfer_source_group),
            symlinks_as_symlinks: self.symlinks_as_symlinks.unwrap_or(base.symlinks_as_symlinks),
            transfer_device_files: self.transfer_device_files.unwrap_or(base.transfer_device_files),
            transfer_special_files: self
                .transfer_special_files
                .unwrap_or(base.transfer_special_files),
            compress_file_transfer: self
                .compress_file_transfer
                .unwrap_or(base.compress_file_transfer),
        }
    }
}

/// One source folder and where it goes inside the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Module {
    /// rsync source: local path, `host::module/path` or `user@host:/path`
    pub source_rsync: String,

    /// Sub-path inside the snapshot folder
    pub dest_subpath: String,

    pub enabled: bool,

    /// Passed to rsync through RSYNC_PASSWORD
    #[serde(skip_serializing)]
    pub auth_password: Option<String>,

    /// rsync --chmod spec, e.g. "Du+rwx,Fu+rw"
    pub change_file_permission: Option<String>,

    pub overrides: TransferOverrides,
}

impl Default for Module {
    fn default() -> Self {
        Self {
            source_rsync: String::new(),
            dest_subpath: String::new(),
            enabled: true,
            auth_password: None,
            change_file_permission: None,
            overrides: TransferOverrides::default(),
        }
    }
}

impl Module {
    pub fn new(source_rsync: impl Into<String>, dest_subpath: impl Into<String>) -> Self {
        Self {
            source_rsync: source_rsync.into(),
            dest_subpath: dest_subpath.into(),
            ..Self::default()
        }
    }

    /// String that identifies what this module backs up. Hashed into the
    /// signatures manifest to decide whether a previous snapshot can be linked.
    pub fn source_identity(&self) -> String {
        format!(
            "{}|{}",
            self.source_rsync.trim_end_matches('/'),
            self.dest_subpath.trim_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// rsync executable
    pub rsync_path: PathBuf,

    /// Retries of one block after a transient or space failure
    pub retry_count: usize,

    /// A folder holding a file with this name is not backed up
    pub ignore_signature_file: String,

    /// Smallest block worth a separate rsync call, in bytes
    pub min_block_size: u64,

    /// Block size target, in bytes
    pub max_block_size: u64,

    /// Hardlink unchanged files against previous snapshots
    pub use_previous_backup: bool,

    /// Number of previous snapshots to pass as link targets
    pub previous_backup_depth: usize,

    /// Record rsync command lines and exit codes in the session log
    pub enable_low_level_log_for_rsync: bool,

    /// Also run rsync verbose and record its output
    pub enable_intensive_low_level_log_for_rsync: bool,

    pub transfer: TransferOptions,

    /// Folder that receives the snapshot folders
    pub destination_root: Option<PathBuf>,

    pub modules: Vec<Module>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rsync_path: PathBuf::from("rsync"),
            retry_count: 3,
            ignore_signature_file: ".rsync_backup_skip".to_string(),
            min_block_size: 300 * MB,
            max_block_size: 5 * GB,
            use_previous_backup: true,
            previous_backup_depth: 1,
            enable_low_level_log_for_rsync: false,
            enable_intensive_low_level_log_for_rsync: false,
            transfer: TransferOptions::default(),
            destination_root: None,
            modules: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from an optional file and `RSYNC_BACKUP__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path.map(Path::to_path_buf).or_else(default_config_path);
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(path.is_some()));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("RSYNC_BACKUP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_block_size > self.max_block_size {
            return Err(BackupError::Config(format!(
                "min_block_size ({}) exceeds max_block_size ({})",
                self.min_block_size, self.max_block_size
            )));
        }
        if self.ignore_signature_file.is_empty() || self.ignore_signature_file.contains('/') {
            return Err(BackupError::Config(format!(
                "invalid ignore_signature_file: {:?}",
                self.ignore_signature_file
            )));
        }

        let mut seen = HashSet::new();
        for (index, module) in self.modules.iter().enumerate() {
            if module.source_rsync.trim().is_empty() {
                return Err(BackupError::Config(format!("module #{} has no source", index + 1)));
            }
            let dest = Path::new(&module.dest_subpath);
            if dest.is_absolute()
                || dest
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
            {
                return Err(BackupError::Config(format!(
                    "module #{} destination must stay inside the snapshot: {}",
                    index + 1,
                    module.dest_subpath
                )));
            }
            if module.enabled && !seen.insert(module.dest_subpath.trim_matches('/').to_string()) {
                return Err(BackupError::Config(format!(
                    "module #{} reuses destination {:?}",
                    index + 1,
                    module.dest_subpath
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter().filter(|m| m.enabled)
    }

    pub fn transfer_options_for(&self, module: &Module) -> TransferOptions {
        module.overrides.apply(self.transfer)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rsync-backup").join("config.toml"))
}

pub fn load_config() -> Result<Config> {
    let path = std::env::var_os("RSYNC_BACKUP_CONFIG").map(PathBuf::from);
    Config::load(path.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.min_block_size, 300 * MB);
        assert_eq!(config.max_block_size, 5 * GB);
        assert!(config.use_previous_backup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            retry_count = 5
            min_block_size = 1000
            max_block_size = 2000

            [transfer]
            compress_file_transfer = true

            [[modules]]
            source_rsync = "backup@nas::photos"
            dest_subpath = "photos"
            change_file_permission = "Du+rwx"

            [modules.overrides]
            transfer_source_owner = true

            [[modules]]
            source_rsync = "/srv/mail"
            dest_subpath = "mail"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.retry_count, 5);
        assert_eq!(config.modules.len(), 2);
        assert_eq!(config.enabled_modules().count(), 1);

        let photos = &config.modules[0];
        let options = config.transfer_options_for(photos);
        assert!(options.compress_file_transfer);
        assert!(options.transfer_source_owner);
        assert!(options.transfer_source_permissions);
        assert_eq!(photos.change_file_permission.as_deref(), Some("Du+rwx"));
    }

    #[test]
    fn test_rejects_inverted_block_bounds() {
        let config = Config {
            min_block_size: 10,
            max_block_size: 5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_rejects_escaping_destination() {
        let mut config = Config::default();
        config.modules.push(Module::new("/srv/a", "../outside"));
        assert!(config.validate().is_err());

        config.modules[0].dest_subpath = "/abs".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_destination() {
        let mut config = Config::default();
        config.modules.push(Module::new("/srv/a", "data"));
        config.modules.push(Module::new("/srv/b", "data/"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_source_identity_ignores_trailing_slashes() {
        let a = Module::new("host::mod/", "dest/");
        let b = Module::new("host::mod", "dest");
        assert_eq!(a.source_identity(), b.source_identity());
        assert_ne!(a.source_identity(), Module::new("host::mod", "other").source_identity());
    }
}
