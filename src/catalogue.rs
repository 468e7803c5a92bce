//! Schema catalogue consumed by the merge engine.
//!
//! The surrounding system owns the real catalogue; the engine only needs the
//! data type of each series and the catalogue (write) order of measurements
//! within a device, which fixes the chunk order inside output segments.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::types::{DataType, SeriesPath};

pub trait Catalogue: std::fmt::Debug + Send + Sync + 'static {
    /// Data type of one series; errors when the series is unknown.
    fn data_type(&self, series: &SeriesPath) -> Result<DataType, MergeError>;

    /// All registered devices, sorted.
    fn devices(&self) -> Vec<String>;

    /// Measurements of one device in catalogue order.
    fn measurements(&self, device: &str) -> Vec<String>;

    /// Every registered series, grouped by device (sorted), measurements in
    /// catalogue order within each device.
    fn all_series(&self) -> Vec<SeriesPath> {
        let mut out = Vec::new();
        for device in self.devices() {
            for measurement in self.measurements(&device) {
                out.push(SeriesPath::new(device.clone(), measurement));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SchemaType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Text,
}

impl From<DataType> for SchemaType {
    fn from(dt: DataType) -> Self {
        match dt {
            DataType::Bool => SchemaType::Bool,
            DataType::Int32 => SchemaType::Int32,
            DataType::Int64 => SchemaType::Int64,
            DataType::Float32 => SchemaType::Float32,
            DataType::Float64 => SchemaType::Float64,
            DataType::Text => SchemaType::Text,
        }
    }
}

impl From<SchemaType> for DataType {
    fn from(st: SchemaType) -> Self {
        match st {
            SchemaType::Bool => DataType::Bool,
            SchemaType::Int32 => DataType::Int32,
            SchemaType::Int64 => DataType::Int64,
            SchemaType::Float32 => DataType::Float32,
            SchemaType::Float64 => DataType::Float64,
            SchemaType::Text => DataType::Text,
        }
    }
}

/// In-memory catalogue, optionally persisted as a bincode snapshot.
#[derive(Debug, Default)]
pub struct InMemoryCatalogue {
    // insertion order per device is the catalogue order
    devices: BTreeMap<String, Vec<(String, DataType)>>,
}

#[derive(Serialize, Deserialize)]
struct CatalogueSnapshot {
    devices: BTreeMap<String, Vec<(String, SchemaType)>>,
}

impl InMemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a series; re-registering with the same type is a no-op.
    pub fn register(&mut self, series: SeriesPath, data_type: DataType) -> Result<(), MergeError> {
        let measurements = self.devices.entry(series.device.clone()).or_default();
        if let Some((_, existing)) = measurements.iter().find(|(m, _)| *m == series.measurement) {
            if *existing != data_type {
                return Err(MergeError::ConfigError(format!(
                    "Series {} already registered as {:?}",
                    series, existing
                )));
            }
            return Ok(());
        }
        measurements.push((series.measurement, data_type));
        Ok(())
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), MergeError> {
        let snapshot = CatalogueSnapshot {
            devices: self
                .devices
                .iter()
                .map(|(d, ms)| {
                    (
                        d.clone(),
                        ms.iter().map(|(m, t)| (m.clone(), SchemaType::from(*t))).collect(),
                    )
                })
                .collect(),
        };
        let tmp = path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut w = BufWriter::new(file);
            bincode::serialize_into(&mut w, &snapshot)
                .map_err(|e| MergeError::Serialization(e.to_string()))?;
            w.flush()?;
            w.get_ref().sync_data()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load_snapshot(path: &Path) -> Result<Self, MergeError> {
        let file = File::open(path)?;
        let snapshot: CatalogueSnapshot = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| MergeError::Serialization(e.to_string()))?;
        Ok(Self {
            devices: snapshot
                .devices
                .into_iter()
                .map(|(d, ms)| (d, ms.into_iter().map(|(m, t)| (m, DataType::from(t))).collect()))
                .collect(),
        })
    }
}

impl Catalogue for InMemoryCatalogue {
    fn data_type(&self, series: &SeriesPath) -> Result<DataType, MergeError> {
        self.devices
            .get(&series.device)
            .and_then(|ms| ms.iter().find(|(m, _)| *m == series.measurement))
            .map(|(_, t)| *t)
            .ok_or_else(|| MergeError::SeriesNotFound(series.to_string()))
    }

    fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    fn measurements(&self, device: &str) -> Vec<String> {
        self.devices
            .get(device)
            .map(|ms| ms.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_register_and_order() {
        let mut cat = InMemoryCatalogue::new();
        cat.register(SeriesPath::new("root.sg.d1", "s2"), DataType::Float64).unwrap();
        cat.register(SeriesPath::new("root.sg.d1", "s0"), DataType::Int64).unwrap();
        cat.register(SeriesPath::new("root.sg.d0", "s0"), DataType::Bool).unwrap();

        // Devices sorted; measurements in registration order within a device.
        assert_eq!(cat.devices(), vec!["root.sg.d0", "root.sg.d1"]);
        assert_eq!(cat.measurements("root.sg.d1"), vec!["s2", "s0"]);
        assert_eq!(
            cat.all_series(),
            vec![
                SeriesPath::new("root.sg.d0", "s0"),
                SeriesPath::new("root.sg.d1", "s2"),
                SeriesPath::new("root.sg.d1", "s0"),
            ]
        );
    }

    #[test]
    fn test_conflicting_type_is_rejected() {
        let mut cat = InMemoryCatalogue::new();
        let s = SeriesPath::new("root.sg.d1", "s0");
        cat.register(s.clone(), DataType::Int32).unwrap();
        cat.register(s.clone(), DataType::Int32).unwrap();
        assert!(cat.register(s, DataType::Text).is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalogue.bin");
        let mut cat = InMemoryCatalogue::new();
        cat.register(SeriesPath::new("root.sg.d1", "s0"), DataType::Float64).unwrap();
        cat.register(SeriesPath::new("root.sg.d1", "s1"), DataType::Text).unwrap();
        cat.save_snapshot(&path).unwrap();

        let back = InMemoryCatalogue::load_snapshot(&path).unwrap();
        assert_eq!(
            back.data_type(&SeriesPath::new("root.sg.d1", "s1")).unwrap(),
            DataType::Text
        );
        assert_eq!(back.measurements("root.sg.d1"), vec!["s0", "s1"]);
    }
}
