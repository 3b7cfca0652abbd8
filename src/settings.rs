use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::EngineError;
use crate::types::{SweepMode, SweepParameters};

/// Name written into every settings export
pub const EXPORTED_BY: &str = "rusty-sweep HP4195A engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

/// Snapshot of the analyzer's settings as shown to and edited by users.
///
/// Values the instrument has not reported yet are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSettings {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub connection_status: ConnectionStatus,
    #[serde(default)]
    pub center_frequency: Option<f64>,
    #[serde(default)]
    pub span: Option<f64>,
    #[serde(default)]
    pub start_frequency: Option<f64>,
    #[serde(default)]
    pub stop_frequency: Option<f64>,
    #[serde(default)]
    pub resolution_bandwidth: Option<f64>,
    #[serde(default)]
    pub oscillator_1_amplitude: Option<f64>,
    #[serde(default)]
    pub sweep_mode: Option<SweepMode>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            device_id: None,
            connection_status: ConnectionStatus::Disconnected,
            center_frequency: None,
            span: None,
            start_frequency: None,
            stop_frequency: None,
            resolution_bandwidth: None,
            oscillator_1_amplitude: None,
            sweep_mode: None,
            last_updated: None,
        }
    }
}

impl MachineSettings {
    pub fn from_parameters(params: &SweepParameters) -> Self {
        Self {
            center_frequency: Some(params.center_frequency()),
            span: Some(params.span()),
            start_frequency: Some(params.start_frequency()),
            stop_frequency: Some(params.stop_frequency()),
            resolution_bandwidth: Some(params.resolution_bandwidth()),
            oscillator_1_amplitude: Some(params.oscillator_amplitude()),
            sweep_mode: Some(params.sweep_mode()),
            last_updated: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Validated sweep parameters from these settings.
    ///
    /// Center/span wins over start/stop when both are present. Missing
    /// RBW, amplitude and mode keep their defaults.
    pub fn to_parameters(&self) -> Result<SweepParameters, EngineError> {
        let mut params = match (
            self.center_frequency,
            self.span,
            self.start_frequency,
            self.stop_frequency,
        ) {
            (Some(center), Some(span), _, _) => SweepParameters::with_center_span(center, span)?,
            (_, _, Some(start), Some(stop)) => SweepParameters::with_start_stop(start, stop)?,
            _ => {
                return Err(EngineError::InvalidParameter(
                    "settings define neither center/span nor start/stop".to_string(),
                ));
            }
        };
        if let Some(rbw) = self.resolution_bandwidth {
            params.set_resolution_bandwidth(rbw)?;
        }
        if let Some(dbm) = self.oscillator_1_amplitude {
            params.set_oscillator_amplitude(dbm)?;
        }
        if let Some(mode) = self.sweep_mode {
            params.set_sweep_mode(mode);
        }
        Ok(params)
    }
}

/// JSON document wrapping exported settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsExport {
    pub hp4195a_configuration: MachineSettings,
    pub exported_at: DateTime<Utc>,
    pub exported_by: String,
}

impl SettingsExport {
    pub fn new(settings: MachineSettings) -> Self {
        Self {
            hp4195a_configuration: settings,
            exported_at: Utc::now(),
            exported_by: EXPORTED_BY.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::export("settings JSON", e))
    }

    /// Parse an export document, or a bare settings object
    pub fn from_json(text: &str) -> Result<MachineSettings, EngineError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| EngineError::export("settings JSON", e))?;
        let settings = match value.get("hp4195a_configuration") {
            Some(inner) => serde_json::from_value(inner.clone()),
            None => serde_json::from_value(value),
        };
        settings.map_err(|e| EngineError::export("settings JSON", e))
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let json = self.to_json()?;
        fs::write(path, json).map_err(|e| EngineError::export(path.display().to_string(), e))
    }

    pub fn load(path: &Path) -> Result<MachineSettings, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::export(path.display().to_string(), e))?;
        Self::from_json(&text)
    }
}
