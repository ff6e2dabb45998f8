//! Append-only persistence for runs.
//!
//! Storage is a two-level tree: groups (one per run, e.g. `segment_1`) holding
//! datasets (one per test, e.g. `segment_1/test_1`). Datasets take raw
//! response samples; both levels take metadata attributes and a list of
//! trace documents.
//!
//! A node is addressed either by a full path (`"segment_1/test_1"`) or by a
//! group name plus `nested_name`.

use crate::error::{Result, RigError};
use crate::types::TraceDoc;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Attrs = Map<String, Value>;

pub trait DataSink: Send {
    fn init_group(&mut self, name: &str, mode: &str) -> Result<()>;

    /// Create a dataset. `dims` bounds how many samples it may receive
    /// (product of all dimensions; an empty `dims` is unbounded).
    fn init_data(&mut self, name: &str, mode: &str, dims: &[usize], nested_name: Option<&str>) -> Result<()>;

    fn append(&mut self, name: &str, data: &[f64], nested_name: Option<&str>) -> Result<()>;

    fn append_trace_info(&mut self, name: &str, doc: &TraceDoc) -> Result<()>;

    /// Merge `attrs` into the node's attributes. With `signal` set the node
    /// must be a dataset holding recorded signal data.
    fn set_metadata(&mut self, name: &str, attrs: &Attrs, signal: bool) -> Result<()>;

    fn delete_group(&mut self, name: &str) -> Result<()>;

    fn groups(&self) -> Vec<String>;

    /// Persist anything buffered since the last write.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A node address resolved to `(group, dataset)`.
fn resolve<'a>(name: &'a str, nested_name: Option<&'a str>) -> (&'a str, Option<&'a str>) {
    match nested_name {
        Some(nested) => (name, Some(nested)),
        None => match name.split_once('/') {
            Some((group, dataset)) => (group, Some(dataset)),
            None => (name, None),
        },
    }
}

fn capacity(dims: &[usize]) -> Option<usize> {
    if dims.is_empty() {
        None
    } else {
        Some(dims.iter().product())
    }
}

fn check_capacity(path: &str, dims: &[usize], len: usize, adding: usize) -> Result<()> {
    match capacity(dims) {
        Some(cap) if len + adding > cap => Err(RigError::Sink(format!(
            "dataset {} full: {} + {} samples exceeds dims {:?}",
            path, len, adding, dims
        ))),
        _ => Ok(()),
    }
}

fn missing(kind: &str, name: &str) -> RigError {
    RigError::Sink(format!("no {} named {}", kind, name))
}

// ─── In-memory sink ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetNode {
    pub mode: String,
    pub dims: Vec<usize>,
    pub samples: Vec<f64>,
    pub attrs: Attrs,
    pub traces: Vec<TraceDoc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupNode {
    pub mode: String,
    pub attrs: Attrs,
    pub traces: Vec<TraceDoc>,
    pub datasets: BTreeMap<String, DatasetNode>,
}

/// Sink that keeps everything in memory. Clones share one store, so a test
/// can hand one clone to a run and inspect another while it executes.
#[derive(Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<BTreeMap<String, GroupNode>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, name: &str) -> Option<GroupNode> {
        self.store.lock().get(name).cloned()
    }

    pub fn dataset(&self, path: &str) -> Option<DatasetNode> {
        let (group, dataset) = resolve(path, None);
        let store = self.store.lock();
        store.get(group)?.datasets.get(dataset?).cloned()
    }

    /// Trace documents recorded on a group or dataset.
    pub fn trace_docs(&self, path: &str) -> Vec<TraceDoc> {
        let (group, dataset) = resolve(path, None);
        let store = self.store.lock();
        let Some(g) = store.get(group) else {
            return Vec::new();
        };
        match dataset {
            Some(d) => g.datasets.get(d).map(|d| d.traces.clone()).unwrap_or_default(),
            None => g.traces.clone(),
        }
    }
}

impl DataSink for MemorySink {
    fn init_group(&mut self, name: &str, mode: &str) -> Result<()> {
        let mut store = self.store.lock();
        if store.contains_key(name) {
            return Err(RigError::Sink(format!("group {} already exists", name)));
        }
        store.insert(
            name.to_string(),
            GroupNode {
                mode: mode.to_string(),
                ..GroupNode::default()
            },
        );
        Ok(())
    }

    fn init_data(&mut self, name: &str, mode: &str, dims: &[usize], nested_name: Option<&str>) -> Result<()> {
        let (group, dataset) = resolve(name, nested_name);
        let dataset = dataset.ok_or_else(|| RigError::Sink(format!("{} names no dataset", name)))?;
        let mut store = self.store.lock();
        let g = store.get_mut(group).ok_or_else(|| missing("group", group))?;
        g.datasets.insert(
            dataset.to_string(),
            DatasetNode {
                mode: mode.to_string(),
                dims: dims.to_vec(),
                ..DatasetNode::default()
            },
        );
        Ok(())
    }

    fn append(&mut self, name: &str, data: &[f64], nested_name: Option<&str>) -> Result<()> {
        let (group, dataset) = resolve(name, nested_name);
        let dataset = dataset.ok_or_else(|| RigError::Sink(format!("{} names no dataset", name)))?;
        let mut store = self.store.lock();
        let d = store
            .get_mut(group)
            .and_then(|g| g.datasets.get_mut(dataset))
            .ok_or_else(|| missing("dataset", dataset))?;
        check_capacity(dataset, &d.dims, d.samples.len(), data.len())?;
        d.samples.extend_from_slice(data);
        Ok(())
    }

    fn append_trace_info(&mut self, name: &str, doc: &TraceDoc) -> Result<()> {
        let (group, dataset) = resolve(name, None);
        let mut store = self.store.lock();
        let g = store.get_mut(group).ok_or_else(|| missing("group", group))?;
        match dataset {
            Some(d) => g
                .datasets
                .get_mut(d)
                .ok_or_else(|| missing("dataset", d))?
                .traces
                .push(doc.clone()),
            None => g.traces.push(doc.clone()),
        }
        Ok(())
    }

    fn set_metadata(&mut self, name: &str, attrs: &Attrs, signal: bool) -> Result<()> {
        let (group, dataset) = resolve(name, None);
        let mut store = self.store.lock();
        let g = store.get_mut(group).ok_or_else(|| missing("group", group))?;
        let target = match dataset {
            Some(d) => &mut g.datasets.get_mut(d).ok_or_else(|| missing("dataset", d))?.attrs,
            None if signal => {
                return Err(RigError::Sink(format!("signal metadata needs a dataset, got group {}", name)))
            }
            None => &mut g.attrs,
        };
        for (k, v) in attrs {
            target.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn delete_group(&mut self, name: &str) -> Result<()> {
        self.store
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("group", name))
    }

    fn groups(&self) -> Vec<String> {
        self.store.lock().keys().cloned().collect()
    }
}

// ─── On-disk session ────────────────────────────────────────────────────────

/// Layout:
///
/// ```text
/// session_<epoch>/
///   manifest.json              groups and their modes
///   <group>/attrs.json         group attributes
///   <group>/traces.jsonl       group-level trace documents
///   <group>/<ds>.f64           samples, little-endian f64
///   <group>/<ds>.attrs.json    mode, dims and dataset attributes
///   <group>/<ds>.traces.jsonl  one trace document per line
/// ```
///
/// Dataset headers are rewritten when created or annotated, and on `flush`.
/// Appends only touch the sample file.
pub struct SessionSink {
    dir: PathBuf,
    groups: BTreeMap<String, SessionGroup>,
    stale_headers: BTreeSet<(String, String)>,
}

#[derive(Default)]
struct SessionGroup {
    mode: String,
    attrs: Attrs,
    datasets: BTreeMap<String, SessionDataset>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetHeader {
    pub mode: String,
    pub dims: Vec<usize>,
    pub len: usize,
    #[serde(default)]
    pub attrs: Attrs,
}

type SessionDataset = DatasetHeader;

impl SessionSink {
    /// Start a new timestamped session directory under `output_dir`.
    pub fn create(output_dir: &Path) -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::open_dir(&output_dir.join(format!("session_{}", timestamp)))
    }

    /// Use `dir` as the session directory, creating it if needed.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let sink = Self {
            dir: dir.to_path_buf(),
            groups: BTreeMap::new(),
            stale_headers: BTreeSet::new(),
        };
        sink.write_manifest()?;
        info!("Session data → {:?}", dir);
        Ok(sink)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_manifest(&self) -> Result<()> {
        let groups: Map<String, Value> = self
            .groups
            .iter()
            .map(|(name, g)| (name.clone(), json!({ "mode": g.mode, "datasets": g.datasets.keys().collect::<Vec<_>>() })))
            .collect();
        let manifest = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "system": "stim-capture",
            "sample_format": "f64le",
            "groups": groups,
        });
        fs::write(self.dir.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.dir.join(group)
    }

    fn write_group_attrs(&self, group: &str) -> Result<()> {
        let g = self.groups.get(group).ok_or_else(|| missing("group", group))?;
        let doc = json!({ "mode": g.mode, "attrs": g.attrs });
        fs::write(
            self.group_dir(group).join("attrs.json"),
            serde_json::to_string_pretty(&doc)?,
        )?;
        Ok(())
    }

    fn write_dataset_header(&self, group: &str, dataset: &str) -> Result<()> {
        let d = self
            .groups
            .get(group)
            .and_then(|g| g.datasets.get(dataset))
            .ok_or_else(|| missing("dataset", dataset))?;
        debug!("Header {}/{}: {} samples", group, dataset, d.len);
        fs::write(
            self.group_dir(group).join(format!("{}.attrs.json", dataset)),
            serde_json::to_string_pretty(d)?,
        )?;
        Ok(())
    }

    fn dataset_mut(&mut self, group: &str, dataset: &str) -> Result<&mut SessionDataset> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| missing("group", group))?
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| missing("dataset", dataset))
    }
}

impl DataSink for SessionSink {
    fn init_group(&mut self, name: &str, mode: &str) -> Result<()> {
        if self.groups.contains_key(name) {
            return Err(RigError::Sink(format!("group {} already exists", name)));
        }
        fs::create_dir_all(self.group_dir(name))?;
        self.groups.insert(
            name.to_string(),
            SessionGroup {
                mode: mode.to_string(),
                ..SessionGroup::default()
            },
        );
        self.write_group_attrs(name)?;
        self.write_manifest()
    }

    fn init_data(&mut self, name: &str, mode: &str, dims: &[usize], nested_name: Option<&str>) -> Result<()> {
        let (group, dataset) = resolve(name, nested_name);
        let dataset = dataset.ok_or_else(|| RigError::Sink(format!("{} names no dataset", name)))?;
        let g = self.groups.get_mut(group).ok_or_else(|| missing("group", group))?;
        g.datasets.insert(
            dataset.to_string(),
            SessionDataset {
                mode: mode.to_string(),
                dims: dims.to_vec(),
                len: 0,
                attrs: Attrs::new(),
            },
        );
        File::create(self.group_dir(group).join(format!("{}.f64", dataset)))?;
        self.write_dataset_header(group, dataset)?;
        self.write_manifest()
    }

    fn append(&mut self, name: &str, data: &[f64], nested_name: Option<&str>) -> Result<()> {
        let (group, dataset) = resolve(name, nested_name);
        let dataset = dataset.ok_or_else(|| RigError::Sink(format!("{} names no dataset", name)))?;
        let path = self.group_dir(group).join(format!("{}.f64", dataset));
        let d = self.dataset_mut(group, dataset)?;
        check_capacity(dataset, &d.dims, d.len, data.len())?;

        let file = OpenOptions::new().append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for &s in data {
            writer.write_f64::<LittleEndian>(s)?;
        }
        writer.flush()?;
        d.len += data.len();
        self.stale_headers.insert((group.to_string(), dataset.to_string()));
        Ok(())
    }

    fn append_trace_info(&mut self, name: &str, doc: &TraceDoc) -> Result<()> {
        let (group, dataset) = resolve(name, None);
        let file_name = match dataset {
            Some(d) => {
                self.dataset_mut(group, d)?;
                format!("{}.traces.jsonl", d)
            }
            None => {
                if !self.groups.contains_key(group) {
                    return Err(missing("group", group));
                }
                "traces.jsonl".to_string()
            }
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.group_dir(group).join(file_name))?;
        writeln!(file, "{}", serde_json::to_string(doc)?)?;
        Ok(())
    }

    fn set_metadata(&mut self, name: &str, attrs: &Attrs, signal: bool) -> Result<()> {
        let (group, dataset) = resolve(name, None);
        match dataset {
            Some(d) => {
                let node = self.dataset_mut(group, d)?;
                for (k, v) in attrs {
                    node.attrs.insert(k.clone(), v.clone());
                }
                self.stale_headers.remove(&(group.to_string(), d.to_string()));
                self.write_dataset_header(group, d)
            }
            None if signal => Err(RigError::Sink(format!(
                "signal metadata needs a dataset, got group {}",
                name
            ))),
            None => {
                let g = self.groups.get_mut(group).ok_or_else(|| missing("group", group))?;
                for (k, v) in attrs {
                    g.attrs.insert(k.clone(), v.clone());
                }
                self.write_group_attrs(group)
            }
        }
    }

    fn delete_group(&mut self, name: &str) -> Result<()> {
        if self.groups.remove(name).is_none() {
            return Err(missing("group", name));
        }
        self.stale_headers.retain(|(g, _)| g != name);
        fs::remove_dir_all(self.group_dir(name))?;
        debug!("Deleted group {}", name);
        self.write_manifest()
    }

    fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    fn flush(&mut self) -> Result<()> {
        for (group, dataset) in std::mem::take(&mut self.stale_headers) {
            self.write_dataset_header(&group, &dataset)?;
        }
        Ok(())
    }
}

impl Drop for SessionSink {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Could not write dataset headers in {:?}: {}", self.dir, e);
        }
    }
}

// ─── Session reader ─────────────────────────────────────────────────────────

/// Reads a session directory written by [`SessionSink`].
pub struct SessionReader {
    dir: PathBuf,
    pub manifest: Value,
}

impl SessionReader {
    pub fn open(dir: &Path) -> Result<Self> {
        let data = fs::read_to_string(dir.join("manifest.json"))?;
        let manifest: Value = serde_json::from_str(&data)?;
        if manifest["system"].as_str() != Some("stim-capture") {
            return Err(RigError::Sink(format!(
                "{:?} is not a stim-capture session",
                dir
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn groups(&self) -> Vec<String> {
        self.manifest["groups"]
            .as_object()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn group_attrs(&self, group: &str) -> Result<Attrs> {
        let data = fs::read_to_string(self.dir.join(group).join("attrs.json"))?;
        let doc: Value = serde_json::from_str(&data)?;
        Ok(doc["attrs"].as_object().cloned().unwrap_or_default())
    }

    pub fn dataset_header(&self, path: &str) -> Result<DatasetHeader> {
        let (group, dataset) = self.dataset_path(path)?;
        let data = fs::read_to_string(self.dir.join(group).join(format!("{}.attrs.json", dataset)))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn samples(&self, path: &str) -> Result<Vec<f64>> {
        let (group, dataset) = self.dataset_path(path)?;
        let file = File::open(self.dir.join(group).join(format!("{}.f64", dataset)))?;
        let n = file.metadata()?.len() as usize / std::mem::size_of::<f64>();
        let mut reader = BufReader::new(file);
        let mut samples = vec![0.0; n];
        reader.read_f64_into::<LittleEndian>(&mut samples)?;
        Ok(samples)
    }

    /// Trace documents of a group or dataset, skipping malformed lines.
    pub fn trace_docs(&self, path: &str) -> Result<Vec<TraceDoc>> {
        let (group, dataset) = resolve(path, None);
        let file_name = match dataset {
            Some(d) => format!("{}.traces.jsonl", d),
            None => "traces.jsonl".to_string(),
        };
        let file_path = self.dir.join(group).join(file_name);
        if !file_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&file_path)?);
        let mut docs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceDoc>(trimmed) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!("Skipping malformed trace document in {:?}: {}", file_path, e),
            }
        }
        Ok(docs)
    }

    fn dataset_path<'a>(&self, path: &'a str) -> Result<(&'a str, &'a str)> {
        match resolve(path, None) {
            (group, Some(dataset)) => Ok((group, dataset)),
            (group, None) => Err(RigError::Sink(format!("{} names no dataset", group))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Component, ComponentDoc};

    fn doc(freq: f64) -> TraceDoc {
        TraceDoc {
            samplerate_da: 500_000.0,
            components: vec![ComponentDoc {
                start_s: 0.0,
                component: Component::tone(freq, 70.0, 0.02, 0.0025),
            }],
            overloaded_attenuation: 0.0,
            time_stamps: vec![10.0, 10.25],
            testtype: "Tuning Curve".into(),
            user_tag: "unit".into(),
        }
    }

    fn attrs(v: Value) -> Attrs {
        v.as_object().cloned().unwrap_or_default()
    }

    /// Exercise the shared contract against any sink.
    fn exercise(sink: &mut dyn DataSink) {
        sink.init_group("segment_1", "finite").unwrap();
        sink.init_data("segment_1", "finite", &[2, 3], Some("test_1")).unwrap();
        sink.append("segment_1", &[1.0, 2.0, 3.0], Some("test_1")).unwrap();
        sink.append("segment_1/test_1", &[4.0, 5.0, 6.0], None).unwrap();
        assert!(matches!(
            sink.append("segment_1", &[7.0], Some("test_1")),
            Err(RigError::Sink(_))
        ));
        sink.append_trace_info("segment_1/test_1", &doc(5000.0)).unwrap();
        sink.set_metadata("segment_1/test_1", &attrs(json!({"reps": 3})), true).unwrap();
        sink.set_metadata("segment_1", &attrs(json!({"calibration_used": ""})), false).unwrap();
        assert!(sink
            .set_metadata("segment_1", &attrs(json!({"reps": 3})), true)
            .is_err());
        assert!(sink.append("segment_9", &[1.0], Some("test_1")).is_err());
        assert_eq!(sink.groups(), vec!["segment_1".to_string()]);
    }

    #[test]
    fn test_memory_sink_contract() {
        let mut sink = MemorySink::new();
        let view = sink.clone();
        exercise(&mut sink);

        let ds = view.dataset("segment_1/test_1").unwrap();
        assert_eq!(ds.samples, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(ds.attrs["reps"], 3);
        assert_eq!(view.trace_docs("segment_1/test_1"), vec![doc(5000.0)]);
        assert_eq!(view.group("segment_1").unwrap().attrs["calibration_used"], "");

        sink.delete_group("segment_1").unwrap();
        assert!(view.group("segment_1").is_none());
        assert!(sink.delete_group("segment_1").is_err());
    }

    #[test]
    fn test_session_sink_roundtrip_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SessionSink::open_dir(dir.path()).unwrap();
        exercise(&mut sink);
        sink.append_trace_info("segment_1", &doc(8000.0)).unwrap();

        let reader = SessionReader::open(dir.path()).unwrap();
        assert_eq!(reader.groups(), vec!["segment_1".to_string()]);
        assert_eq!(
            reader.samples("segment_1/test_1").unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        let header = reader.dataset_header("segment_1/test_1").unwrap();
        assert_eq!(header.dims, vec![2, 3]);
        assert_eq!(header.attrs["reps"], 3);
        assert_eq!(reader.trace_docs("segment_1/test_1").unwrap(), vec![doc(5000.0)]);
        assert_eq!(reader.trace_docs("segment_1").unwrap(), vec![doc(8000.0)]);
        assert_eq!(reader.group_attrs("segment_1").unwrap()["calibration_used"], "");
    }

    #[test]
    fn test_session_headers_written_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SessionSink::open_dir(dir.path()).unwrap();
        sink.init_group("explore_1", "open").unwrap();
        sink.init_data("explore_1", "open", &[], Some("responses")).unwrap();
        let header_path = dir.path().join("explore_1").join("responses.attrs.json");
        let written = fs::metadata(&header_path).unwrap().modified().unwrap();
        for i in 0..20 {
            sink.append("explore_1/responses", &[i as f64; 4], None).unwrap();
        }

        let reader = SessionReader::open(dir.path()).unwrap();
        assert_eq!(reader.dataset_header("explore_1/responses").unwrap().len, 0);
        assert_eq!(fs::metadata(&header_path).unwrap().modified().unwrap(), written);
        // sample file is complete before the header catches up
        assert_eq!(reader.samples("explore_1/responses").unwrap().len(), 80);

        sink.flush().unwrap();
        assert_eq!(reader.dataset_header("explore_1/responses").unwrap().len, 80);

        sink.append("explore_1/responses", &[1.0; 4], None).unwrap();
        drop(sink);
        assert_eq!(reader.dataset_header("explore_1/responses").unwrap().len, 84);
    }

    #[test]
    fn test_session_delete_group_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SessionSink::open_dir(dir.path()).unwrap();
        sink.init_group("calibration_test_1", "calibration").unwrap();
        sink.init_data("calibration_test_1", "calibration", &[4, 2], Some("vmax")).unwrap();
        sink.append("calibration_test_1", &[0.1, 0.2], Some("vmax")).unwrap();
        sink.delete_group("calibration_test_1").unwrap();

        assert!(!dir.path().join("calibration_test_1").exists());
        let reader = SessionReader::open(dir.path()).unwrap();
        assert!(reader.groups().is_empty());
    }

    #[test]
    fn test_reader_skips_malformed_trace_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SessionSink::open_dir(dir.path()).unwrap();
        sink.init_group("segment_1", "finite").unwrap();
        sink.append_trace_info("segment_1", &doc(1000.0)).unwrap();
        let path = dir.path().join("segment_1").join("traces.jsonl");
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "this is not json").unwrap();
        drop(f);
        sink.append_trace_info("segment_1", &doc(2000.0)).unwrap();

        let docs = SessionReader::open(dir.path()).unwrap().trace_docs("segment_1").unwrap();
        assert_eq!(docs, vec![doc(1000.0), doc(2000.0)]);
    }

    #[test]
    fn test_reader_rejects_foreign_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("manifest.json"), r#"{"system":"other"}"#).unwrap();
        assert!(SessionReader::open(dir.path()).is_err());
    }
}
