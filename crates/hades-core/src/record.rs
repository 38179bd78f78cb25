use std::{
    collections::HashMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::process::Process;

/// Kind of payload carried by a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// The kernel dropped samples because the perf buffer was full.
    BufferOverflow,
    /// A process executed a new image.
    ProcessExec,
    /// A process found while scanning procfs.
    ProcessSnapshot,
}

impl DataType {
    pub fn code(self) -> &'static str {
        match self {
            DataType::BufferOverflow => "999",
            DataType::ProcessExec => "1000",
            DataType::ProcessSnapshot => "1001",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A record ready to be shipped upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data_type: DataType,
    /// Unix seconds
    pub time: u64,
    pub data: String,
}

impl Record {
    pub fn new(data_type: DataType, data: String) -> Self {
        Self {
            data_type,
            time: unix_now(),
            data,
        }
    }

    /// Serialize a process as the payload.
    pub fn from_process(data_type: DataType, process: &Process) -> Result<Self, serde_json::Error> {
        Ok(Self::new(data_type, serde_json::to_string(process)?))
    }

    /// Diagnostic emitted in place of the samples lost by the kernel.
    pub fn buffer_overflow(lost: u64) -> Self {
        Self::new(
            DataType::BufferOverflow,
            format!("perf event ring buffer full, dropped {lost} samples"),
        )
    }

    /// Flatten into the string map expected by the transport.
    pub fn into_fields(self) -> HashMap<String, String> {
        HashMap::from([
            ("data_type".to_string(), self.data_type.code().to_string()),
            ("time".to_string(), self.time.to_string()),
            ("data".to_string(), self.data),
        ])
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
