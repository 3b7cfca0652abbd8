use log::info;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::types::{AcquisitionResult, AmplitudeSweepRun};

const HEADER: [&str; 3] = ["Frequency", "Magnitude", "Phase"];

/// Write one `Frequency,Magnitude,Phase` row per sweep point
pub fn write_acquisition<W: Write>(writer: W, result: &AcquisitionResult) -> Result<(), EngineError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer
        .write_record(HEADER)
        .map_err(|e| EngineError::export("CSV header", e))?;
    for (f, m, p) in result.rows() {
        writer
            .write_record(&[f.to_string(), m.to_string(), p.to_string()])
            .map_err(|e| EngineError::export("CSV row", e))?;
    }
    writer.flush().map_err(|e| EngineError::export("CSV flush", e))
}

pub fn save_acquisition(path: &Path, result: &AcquisitionResult) -> Result<(), EngineError> {
    let file = File::create(path).map_err(|e| EngineError::export(path.display().to_string(), e))?;
    write_acquisition(file, result)?;
    info!("Saved {} points to {}", result.len(), path.display());
    Ok(())
}

/// Read a file written by [`save_acquisition`]
pub fn load_acquisition(path: &Path) -> Result<AcquisitionResult, EngineError> {
    let context = path.display().to_string();
    let mut reader = csv::Reader::from_path(path).map_err(|e| EngineError::export(&context, e))?;

    let headers = reader
        .headers()
        .map_err(|e| EngineError::export(&context, e))?
        .clone();
    if headers.iter().collect::<Vec<_>>() != HEADER {
        return Err(EngineError::export(
            &context,
            format!("unexpected header {headers:?}"),
        ));
    }

    let mut frequency = Vec::new();
    let mut magnitude = Vec::new();
    let mut phase = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| EngineError::export(&context, e))?;
        let field = |i: usize| -> Result<f64, EngineError> {
            record
                .get(i)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| {
                    EngineError::export(&context, format!("bad value in row {}", line + 1))
                })
        };
        frequency.push(field(0)?);
        magnitude.push(field(1)?);
        phase.push(field(2)?);
    }

    AcquisitionResult::new(magnitude, phase, frequency)
}

/// File name used for one amplitude sweep step, e.g. `amplitude_sweep_-10.0dBm.csv`
pub fn step_file_name(amplitude: f64) -> String {
    format!("amplitude_sweep_{amplitude:?}dBm.csv")
}

/// Write every completed step of `run` into `dir`, one CSV per step
pub fn export_sweep_run(dir: &Path, run: &AmplitudeSweepRun) -> Result<Vec<PathBuf>, EngineError> {
    fs::create_dir_all(dir).map_err(|e| EngineError::export(dir.display().to_string(), e))?;
    run.steps()
        .map(|(amplitude, result)| {
            let path = dir.join(step_file_name(amplitude));
            save_acquisition(&path, result)?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_layout() {
        let result =
            AcquisitionResult::new(vec![-20.5, -3.0], vec![12.0, -45.0], vec![1000.0, 2000.0])
                .unwrap();
        let mut buffer = Vec::new();
        write_acquisition(&mut buffer, &result).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text, "Frequency,Magnitude,Phase\n1000,-20.5,12\n2000,-3,-45\n");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        let result = AcquisitionResult::new(
            vec![-20.25, -3.5, -19.0],
            vec![10.0, 0.0, -10.0],
            vec![999_000.0, 1_000_000.0, 1_001_000.0],
        )
        .unwrap();
        save_acquisition(&path, &result).unwrap();
        assert_eq!(load_acquisition(&path).unwrap(), result);
    }

    #[test]
    fn test_step_file_names() {
        assert_eq!(step_file_name(-10.0), "amplitude_sweep_-10.0dBm.csv");
        assert_eq!(step_file_name(-7.5), "amplitude_sweep_-7.5dBm.csv");
        assert_eq!(step_file_name(0.0), "amplitude_sweep_0.0dBm.csv");
    }

    #[test]
    fn test_export_run_writes_completed_steps_only() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("amplitude_sweep");
        let mut run = AmplitudeSweepRun::new(vec![-10.0, -5.0, 0.0]);
        run.push(AcquisitionResult::new(vec![1.0], vec![0.0], vec![100.0]).unwrap());
        run.push(AcquisitionResult::new(vec![2.0], vec![0.0], vec![100.0]).unwrap());

        let paths = export_sweep_run(&dir, &run).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(dir.join("amplitude_sweep_-10.0dBm.csv").exists());
        assert!(dir.join("amplitude_sweep_-5.0dBm.csv").exists());
        assert!(!dir.join("amplitude_sweep_0.0dBm.csv").exists());
    }
}
