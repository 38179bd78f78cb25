//! Drains the record channel and writes one JSON object per line.
//!
//! Each record is flattened to the string map of the transport and tagged with
//! the agent identity before being written.

use anyhow::{Context, Result};
use hades_core::Record;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::daemon::config::AgentConfig;

pub struct Uploader {
    agent: AgentConfig,
}

impl Uploader {
    pub fn new(agent: AgentConfig) -> Self {
        Self { agent }
    }

    /// Write records until every sender is dropped. Returns how many were written.
    pub async fn run<W>(&self, mut rx: mpsc::UnboundedReceiver<Record>, mut out: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while let Some(record) = rx.recv().await {
            let mut line = self.encode(record)?;
            line.push('\n');
            out.write_all(line.as_bytes()).await.context("writing record")?;
            written += 1;
            if rx.is_empty() {
                out.flush().await.context("flushing records")?;
            }
        }
        out.flush().await.context("flushing records")?;
        log::debug!("uploader: channel closed after {written} records");
        Ok(written)
    }

    fn encode(&self, record: Record) -> Result<String> {
        let mut fields = record.into_fields();
        fields.insert("AgentID".to_string(), self.agent.agent_id.clone());
        fields.insert("Hostname".to_string(), self.agent.hostname.clone());
        serde_json::to_string(&fields).context("serializing record")
    }
}
