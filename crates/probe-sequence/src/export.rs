//! Measurement data export.
//!
//! One JSON and/or one tab-separated text file per measurement attempt,
//! written under `output_dir/<sample>/` with sanitized filenames.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use probe_core::{StationError, StationResult};
use serde::Serialize;

use crate::tree::ReadingSeries;

/// Snapshot of one measurement attempt, serialization-ready.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementExport {
    pub meta: BTreeMap<String, serde_json::Value>,
    pub series: ReadingSeries,
    pub analysis: BTreeMap<String, serde_json::Value>,
}

/// Replace anything that is not filename-safe with underscores.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Ensure the parent directory of `path` exists.
fn create_parent(path: &Path) -> StationResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write the export as pretty-printed JSON.
pub fn write_json(path: &PathBuf, export: &MeasurementExport) -> StationResult<()> {
    create_parent(path)?;
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, export)
        .map_err(|e| StationError::Instrument(format!("JSON export failed: {e}")))?;
    Ok(())
}

/// Write the reading series as tab-separated text, one row per reading.
pub fn write_txt(path: &PathBuf, export: &MeasurementExport) -> StationResult<()> {
    create_parent(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| StationError::Instrument(format!("TXT export failed: {e}")))?;

    writer
        .write_record(["series", "x", "y"])
        .map_err(|e| StationError::Instrument(format!("TXT export failed: {e}")))?;
    for (name, series) in &export.series {
        for (x, y) in series {
            writer
                .write_record([name.as_str(), &x.to_string(), &y.to_string()])
                .map_err(|e| StationError::Instrument(format!("TXT export failed: {e}")))?;
        }
    }
    writer
        .flush()
        .map_err(|e| StationError::Instrument(format!("TXT export failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_export() -> MeasurementExport {
        let mut series = ReadingSeries::new();
        series.insert("iv".into(), vec![(1.0, 1e-9), (2.0, 2e-9)]);
        let mut meta = BTreeMap::new();
        meta.insert("sample_name".into(), serde_json::json!("HPK VPX-17"));
        MeasurementExport {
            meta,
            series,
            analysis: BTreeMap::new(),
        }
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(safe_filename("HPK VPX 17/cross?.json"), "HPK_VPX_17_cross_.json");
        assert_eq!(safe_filename("iv_ramp-01.txt"), "iv_ramp-01.txt");
    }

    #[test]
    fn writes_json_that_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("export.json");
        write_json(&path, &sample_export()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["meta"]["sample_name"], "HPK VPX-17");
        assert_eq!(value["series"]["iv"][1][0], 2.0);
    }

    #[test]
    fn writes_tab_separated_readings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.txt");
        write_txt(&path, &sample_export()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "series\tx\ty");
        assert_eq!(lines.next().unwrap(), "iv\t1\t0.000000001");
    }
}
