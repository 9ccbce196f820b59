use std::path::{Path, PathBuf};
use std::time::Duration;

use vmdash_node::layout::Directories;
use vmdash_node::qemu::QemuSettings;

#[derive(serde::Deserialize, Debug)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
    /// Request body ceiling, ISO uploads included.
    pub max_upload_bytes: usize,
}

#[derive(serde::Deserialize, Debug)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub vms_dir: Option<PathBuf>,
    pub disks_dir: Option<PathBuf>,
    pub isos_dir: Option<PathBuf>,
    pub snapshots_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

impl StorageSettings {
    pub fn directories(&self) -> Directories {
        let mut dirs = Directories::under(&self.root);
        for (dir, configured) in [
            (&mut dirs.vms, &self.vms_dir),
            (&mut dirs.disks, &self.disks_dir),
            (&mut dirs.isos, &self.isos_dir),
            (&mut dirs.snapshots, &self.snapshots_dir),
            (&mut dirs.logs, &self.logs_dir),
        ] {
            if let Some(path) = configured {
                *dir = path.clone();
            }
        }
        dirs
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct QemuConfig {
    pub binary: PathBuf,
    pub img_binary: PathBuf,
    pub firmware: PathBuf,
    /// `-display` mode; omit to let QEMU pick.
    pub display: Option<String>,
    pub startup_grace_ms: u64,
    pub stop_timeout_ms: u64,
}

impl QemuConfig {
    pub fn settings(&self) -> QemuSettings {
        QemuSettings {
            binary: self.binary.clone(),
            firmware: self.firmware.clone(),
            display: self.display.clone().filter(|d| !d.is_empty()),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

#[derive(serde::Deserialize, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub storage: StorageSettings,
    pub qemu: QemuConfig,
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    // Get our base path which is one level up from current_dir
    let base_path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."));
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        // Empty values mean "not set" and fall back to the yaml files
        .set_override_option("storage.root", non_empty_var("STORAGE_ROOT"))?
        .set_override_option("qemu.binary", non_empty_var("QEMU_BINARY"))?
        .set_override_option("qemu.img_binary", non_empty_var("QEMU_IMG_BINARY"))?
        .set_override_option("application.port", non_empty_var("APP_PORT"))?
        .build()?;
    settings.try_deserialize::<Settings>()
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_directories_derive_from_root() {
        let storage = StorageSettings {
            root: PathBuf::from("/srv/vmdash"),
            vms_dir: None,
            disks_dir: Some(PathBuf::from("/mnt/fast/disks")),
            isos_dir: None,
            snapshots_dir: None,
            logs_dir: None,
        };
        let dirs = storage.directories();
        assert_eq!(dirs.vms, PathBuf::from("/srv/vmdash/vms"));
        assert_eq!(dirs.disks, PathBuf::from("/mnt/fast/disks"));
        assert_eq!(dirs.logs, PathBuf::from("/srv/vmdash/logs"));
    }

    #[test]
    fn empty_display_disables_the_flag() {
        let qemu = QemuConfig {
            binary: "qemu-system-x86_64".into(),
            img_binary: "qemu-img".into(),
            firmware: "/usr/share/OVMF/OVMF_CODE.fd".into(),
            display: Some(String::new()),
            startup_grace_ms: 250,
            stop_timeout_ms: 5000,
        };
        let settings = qemu.settings();
        assert_eq!(settings.display, None);
        assert_eq!(settings.startup_grace, Duration::from_millis(250));
    }

    #[test]
    fn environments() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }
}
