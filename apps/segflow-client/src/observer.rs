use std::{
    collections::{HashMap, hash_map::Entry},
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use segflow_abr::AlgorithmKind;
use segflow_core::{DiagnosticRecord, DiagnosticsObserver};
use tracing::warn;

/// Identifies one client of one simulation run in the log tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTarget {
    pub algorithm: AlgorithmKind,
    pub number_of_clients: u32,
    pub simulation_id: u32,
    pub client_id: u32,
}

/// Writes each record kind to its own JSON-lines file under
/// `<root>/<algorithm>/<clients>/sim<id>_cl<id>_<kind>.jsonl`.
#[derive(Debug)]
pub struct LogDirObserver {
    dir: PathBuf,
    prefix: String,
    writers: HashMap<&'static str, BufWriter<File>>,
    error: Option<io::Error>,
}

impl LogDirObserver {
    pub fn create(root: &Path, target: LogTarget) -> Result<Self> {
        let dir = root
            .join(target.algorithm.name())
            .join(target.number_of_clients.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("create log dir failed: {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: format!("sim{}_cl{}", target.simulation_id, target.client_id),
            writers: HashMap::new(),
            error: None,
        })
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{}_{kind}.jsonl", self.prefix))
    }

    /// Flushes every file and reports the first write error, if any.
    pub fn finish(mut self) -> Result<()> {
        if let Some(err) = self.error.take() {
            return Err(err).context("write diagnostics failed");
        }
        for (kind, writer) in &mut self.writers {
            writer
                .flush()
                .with_context(|| format!("flush {kind} log failed"))?;
        }
        Ok(())
    }

    fn write(&mut self, record: &DiagnosticRecord) -> io::Result<()> {
        let kind = record.kind();
        let writer = match self.writers.entry(kind) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.dir.join(format!("{}_{kind}.jsonl", self.prefix));
                entry.insert(BufWriter::new(File::create(path)?))
            }
        };
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")
    }
}

impl DiagnosticsObserver for LogDirObserver {
    fn record(&mut self, record: DiagnosticRecord) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write(&record) {
            warn!("diagnostics logging disabled: {err}");
            self.error = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use segflow_core::{BufferRecord, ThroughputRecord};

    use super::*;

    #[test]
    fn writes_one_file_per_record_kind() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let root = std::env::temp_dir().join(format!("segflow-logs-{nanos}"));
        let target = LogTarget {
            algorithm: AlgorithmKind::Panda,
            number_of_clients: 4,
            simulation_id: 2,
            client_id: 3,
        };

        let mut observer = LogDirObserver::create(&root, target).unwrap();
        observer.record(DiagnosticRecord::Throughput(ThroughputRecord {
            at_us: 10,
            bytes: 1_460,
        }));
        observer.record(DiagnosticRecord::Throughput(ThroughputRecord {
            at_us: 20,
            bytes: 540,
        }));
        observer.record(DiagnosticRecord::Buffer(BufferRecord {
            at_us: 20,
            level_before_us: 0,
            level_after_us: 2_000_000,
        }));
        let throughput_path = observer.path_for("throughput");
        let buffer_path = observer.path_for("buffer");
        observer.finish().unwrap();

        assert_eq!(throughput_path, root.join("panda").join("4").join("sim2_cl3_throughput.jsonl"));
        let throughput = fs::read_to_string(&throughput_path).unwrap();
        let lines: Vec<serde_json::Value> = throughput
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["bytes"], 540);

        let buffer = fs::read_to_string(&buffer_path).unwrap();
        assert!(buffer.contains("\"level_after_us\":2000000"));

        let _ = fs::remove_dir_all(root);
    }
}
