//! TensorBoard event files
//!
//! Events are `tensorflow.Event` protos framed as TFRecords. A run directory
//! holds one writer per split (`train/`, `validation/`), each starting with a
//! `brain.Event:2` version event followed by scalar summaries.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;

use crate::dataset::tfrecord::TfRecordWriter;
use crate::utils::error::Result;

pub const FILE_VERSION: &str = "brain.Event:2";

#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(double, tag = "1")]
    pub wall_time: f64,
    #[prost(int64, tag = "2")]
    pub step: i64,
    #[prost(oneof = "event::What", tags = "3, 5")]
    pub what: Option<event::What>,
}

pub mod event {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum What {
        #[prost(string, tag = "3")]
        FileVersion(String),
        #[prost(message, tag = "5")]
        Summary(super::Summary),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Summary {
    #[prost(message, repeated, tag = "1")]
    pub value: Vec<summary::Value>,
}

pub mod summary {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(oneof = "value::Kind", tags = "2")]
        pub kind: Option<value::Kind>,
    }

    pub mod value {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(float, tag = "2")]
            SimpleValue(f32),
        }
    }
}

/// Seconds since the Unix epoch with sub-second precision
pub fn wall_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// `<log_root>/<prefix>-<unix time>`
pub fn run_directory(log_root: &Path, prefix: &str) -> PathBuf {
    log_root.join(format!("{}-{}", prefix, wall_time()))
}

/// Appends events to a single `events.out.tfevents.*` file
pub struct EventWriter {
    path: PathBuf,
    writer: TfRecordWriter<BufWriter<File>>,
}

impl EventWriter {
    /// Create the directory and a new event file inside it
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let now = wall_time();
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}.{}.v2",
            now as u64,
            hostname(),
            std::process::id()
        ));

        let mut writer = Self {
            writer: TfRecordWriter::new(BufWriter::new(File::create(&path)?)),
            path,
        };
        writer.write_event(&Event {
            wall_time: now,
            step: 0,
            what: Some(event::What::FileVersion(FILE_VERSION.to_string())),
        })?;
        writer.flush()?;
        debug!("Opened event file {:?}", writer.path);
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_event(&mut self, event: &Event) -> Result<()> {
        self.writer.write_record(&event.encode_to_vec())
    }

    /// Record scalar `value` under `tag` at `step`
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write_event(&Event {
            wall_time: wall_time(),
            step: step as i64,
            what: Some(event::What::Summary(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    kind: Some(summary::value::Kind::SimpleValue(value as f32)),
                }],
            })),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tfrecord::TfRecordReader;
    use std::io::BufReader;

    fn read_events(path: &Path) -> Vec<Event> {
        TfRecordReader::new(BufReader::new(File::open(path).unwrap()))
            .map(|r| Event::decode(r.unwrap().as_slice()).unwrap())
            .collect()
    }

    #[test]
    fn test_event_file_starts_with_version() {
        let dir = tempfile::tempdir().unwrap();
        let writer = EventWriter::create(&dir.path().join("train")).unwrap();
        let name = writer.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("events.out.tfevents."));
        assert!(name.ends_with(".v2"));
        drop(writer);

        let events = read_events(&dir.path().join("train").join(&name));
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].what,
            Some(event::What::FileVersion(FILE_VERSION.to_string()))
        );
    }

    #[test]
    fn test_scalars_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EventWriter::create(dir.path()).unwrap();
        writer.add_scalar("epoch_loss", 0.75, 0).unwrap();
        writer.add_scalar("epoch_loss", 0.5, 1).unwrap();
        writer.flush().unwrap();

        let events = read_events(writer.path());
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].step, 1);
        match &events[2].what {
            Some(event::What::Summary(s)) => {
                assert_eq!(s.value[0].tag, "epoch_loss");
                assert_eq!(
                    s.value[0].kind,
                    Some(summary::value::Kind::SimpleValue(0.5))
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_run_directory_name() {
        let dir = run_directory(Path::new("logs"), "owl");
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("owl-"));
        assert!(name["owl-".len()..].parse::<f64>().is_ok());
        assert_eq!(dir.parent(), Some(Path::new("logs")));
    }
}
