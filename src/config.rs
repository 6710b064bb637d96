use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub workspace: WorkspaceSettings,
    pub attendance: AttendanceSettings,
    pub fees: FeeSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Opened at start-up when set, so a front end can skip `workspace.select`.
    pub default_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttendanceSettings {
    pub percent_decimals: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeSettings {
    pub currency: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            workspace: WorkspaceSettings::default(),
            attendance: AttendanceSettings::default(),
            fees: FeeSettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for AttendanceSettings {
    fn default() -> Self {
        Self { percent_decimals: 0 }
    }
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
        }
    }
}

impl Settings {
    /// Layers `campusd.toml` (or `$CAMPUSD_CONFIG`) under `CAMPUSD__*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let file = std::env::var("CAMPUSD_CONFIG").unwrap_or_else(|_| "campusd".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("CAMPUSD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;
        let mut out: Settings = settings
            .try_deserialize()
            .context("invalid configuration")?;
        if out.attendance.percent_decimals > 4 {
            out.attendance.percent_decimals = 4;
        }
        Ok(out)
    }
}
