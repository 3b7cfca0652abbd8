use config::{Config, ConfigError, Environment, File};
use rusty_sweep::{
    BusAddress, BusLimits, ConnectionConfig, EngineConfig, FitOptions, RbwSettleTable,
    SettleEntry, SweepParameters,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.gpib_address > 30 {
            return Err(ConfigError::Message(format!(
                "gpib_address must be 0..=30, got {}",
                self.instrument.gpib_address
            )));
        }
        if self.instrument.device_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "device_id must not be empty".to_string(),
            ));
        }
        self.engine.validate()?;
        self.sweep
            .parameters()
            .map_err(|e| ConfigError::Message(format!("Invalid sweep section: {e}")))?;
        Ok(())
    }

    pub fn bus_address(&self) -> BusAddress {
        BusAddress {
            host: self.instrument.host.clone(),
            port: self.instrument.port,
            gpib_address: self.instrument.gpib_address,
        }
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.instrument.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.instrument.read_timeout_ms),
            write_timeout: Duration::from_millis(self.instrument.write_timeout_ms),
        }
    }

    /// Engine configuration; `validate()` must have passed
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            address: self.bus_address(),
            device_id: self.instrument.device_id.clone(),
            limits: BusLimits {
                max_consecutive_timeouts: self.engine.max_consecutive_timeouts,
                max_consecutive_io_failures: self.engine.max_consecutive_io_failures,
            },
            verify_settings: self.engine.verify_settings,
            settle: Arc::new(RbwSettleTable::new(self.engine.settle_table.clone())),
            fit: self.engine.fit,
            initial_parameters: self.sweep.parameters().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct InstrumentConfig {
    /// GPIB-Ethernet adapter host
    pub host: String,
    pub port: u16,
    pub gpib_address: u8,
    /// Substring expected in the `ID?` response
    pub device_id: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        let address = BusAddress::default();
        Self {
            host: address.host,
            port: address.port,
            gpib_address: address.gpib_address,
            device_id: "HP4195A".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub max_consecutive_timeouts: usize,
    pub max_consecutive_io_failures: usize,
    /// Read back center/span after setting them
    pub verify_settings: bool,
    /// Settle time per resolution bandwidth, seconds
    pub settle_table: Vec<SettleEntry>,
    pub fit: FitOptions,
}

impl Default for EngineSection {
    fn default() -> Self {
        let limits = BusLimits::default();
        Self {
            max_consecutive_timeouts: limits.max_consecutive_timeouts,
            max_consecutive_io_failures: limits.max_consecutive_io_failures,
            verify_settings: true,
            settle_table: RbwSettleTable::default().entries().to_vec(),
            fit: FitOptions::default(),
        }
    }
}

impl EngineSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_timeouts == 0 || self.max_consecutive_io_failures == 0 {
            return Err(ConfigError::Message(
                "bus failure thresholds must be at least 1".to_string(),
            ));
        }
        if self.settle_table.is_empty() {
            return Err(ConfigError::Message(
                "settle_table needs at least one entry".to_string(),
            ));
        }
        if let Some(bad) = self
            .settle_table
            .iter()
            .find(|e| !(e.resolution_bandwidth > 0.0))
        {
            return Err(ConfigError::Message(format!(
                "settle_table RBW must be positive, got {}",
                bad.resolution_bandwidth
            )));
        }
        if !(0.0..=1.0).contains(&self.fit.min_r_squared) {
            return Err(ConfigError::Message(format!(
                "fit.min_r_squared must be within [0, 1], got {}",
                self.fit.min_r_squared
            )));
        }
        if self.fit.max_iterations == 0 || self.fit.curve_points < 2 {
            return Err(ConfigError::Message(
                "fit needs max_iterations >= 1 and curve_points >= 2".to_string(),
            ));
        }
        if !(self.fit.window_fraction > 0.0) {
            return Err(ConfigError::Message(format!(
                "fit.window_fraction must be positive, got {}",
                self.fit.window_fraction
            )));
        }
        Ok(())
    }
}

/// Sweep settings the engine starts from
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub center_frequency: f64,
    pub span: f64,
    pub resolution_bandwidth: f64,
    pub oscillator_amplitude: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        let params = SweepParameters::default();
        Self {
            center_frequency: params.center_frequency(),
            span: params.span(),
            resolution_bandwidth: params.resolution_bandwidth(),
            oscillator_amplitude: params.oscillator_amplitude(),
        }
    }
}

impl SweepConfig {
    pub fn parameters(&self) -> Result<SweepParameters, rusty_sweep::EngineError> {
        let mut params = SweepParameters::with_center_span(self.center_frequency, self.span)?;
        params.set_resolution_bandwidth(self.resolution_bandwidth)?;
        params.set_oscillator_amplitude(self.oscillator_amplitude)?;
        Ok(params)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory for measurement CSV files
    pub output_dir: String,
    /// Draw results in the terminal
    pub plot: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: "./measurements".to_string(),
            plot: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();
    let mut config_file_found = false;

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
            config_file_found = true;
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["sweep.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                config_file_found = true;
                break;
            }
        }
    }

    if !config_file_found {
        builder = builder.add_source(Config::try_from(&AppConfig::default())?);
    }

    // RUSTY_SWEEP__INSTRUMENT__HOST=10.0.0.5 and friends
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_SWEEP")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;
    Ok(app_config)
}

/// Where the configuration in use came from
#[derive(Debug)]
pub enum ConfigSource {
    Loaded,
    /// Nothing usable was found; holds the reason
    Defaults(ConfigError),
}

/// Load configuration, falling back to defaults only when no file was
/// requested explicitly. Nothing is logged here because logging is set up
/// from the result.
pub fn load_config_or_default(
    config_path: Option<&Path>,
) -> Result<(AppConfig, ConfigSource), ConfigError> {
    or_default(load_config(config_path), config_path.is_some())
}

fn or_default(
    loaded: Result<AppConfig, ConfigError>,
    explicit: bool,
) -> Result<(AppConfig, ConfigSource), ConfigError> {
    match loaded {
        Ok(config) => Ok((config, ConfigSource::Loaded)),
        Err(e) if explicit => Err(e),
        Err(e) => Ok((AppConfig::default(), ConfigSource::Defaults(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        let engine = config.engine_config();
        assert_eq!(engine.address.port, 1234);
        assert_eq!(engine.address.gpib_address, 17);
        assert_eq!(engine.limits.max_consecutive_timeouts, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[instrument]\nhost = \"192.168.0.40\"\n\n[sweep]\nspan = 2500.0\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.instrument.host, "192.168.0.40");
        assert_eq!(config.instrument.port, 1234);
        assert_eq!(config.sweep.span, 2500.0);
        assert_eq!(config.sweep.center_frequency, 1.0e6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.sweep.span = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.engine.max_consecutive_timeouts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.instrument.gpib_address = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fallback_keeps_reason() {
        let failed = Err(ConfigError::Message("bad value".to_string()));
        let (config, source) = or_default(failed, false).unwrap();
        assert_eq!(config.instrument.port, 1234);
        assert!(matches!(source, ConfigSource::Defaults(ConfigError::Message(m)) if m == "bad value"));

        let failed = Err(ConfigError::Message("bad value".to_string()));
        assert!(or_default(failed, true).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let missing = Path::new("/nonexistent/sweep.toml");
        assert!(load_config_or_default(Some(missing)).is_err());
    }
}
