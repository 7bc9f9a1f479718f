//! JSON-line command ingestion.
//!
//! One command per line: `{"tenantId": .., "type": .., "payload": {..}}`,
//! with optional `id` and `metadata`. Blank lines and lines starting with `#`
//! are skipped. A line that does not parse is logged and skipped.

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use strata_core::{MessageId, TenantId};
use strata_events::{Command, Metadata};
use strata_infra::{CommandLog, CommandLogError};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCommand {
    #[serde(default)]
    pub id: Option<MessageId>,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default = "empty_payload")]
    pub payload: JsonValue,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

fn empty_payload() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl IncomingCommand {
    pub fn into_command(self) -> Command {
        let mut command = Command::new(self.tenant_id, self.command_type, self.payload);
        if let Some(id) = self.id {
            command = command.with_id(id);
        }
        if let Some(metadata) = self.metadata {
            command = command.with_metadata(metadata.with_source("stdin"));
        }
        command
    }
}

/// Parse one input line; `None` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<Command>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let incoming: IncomingCommand = serde_json::from_str(line)?;
    Ok(Some(incoming.into_command()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("reading input failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Log(#[from] CommandLogError),
}

/// Insert every command read from `reader` into `log` until end of input.
pub async fn ingest<R>(reader: R, log: &dyn CommandLog) -> Result<IngestStats, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed command");
                stats.malformed += 1;
                continue;
            }
        };

        let id = command.id.clone();
        match log.insert(command).await {
            Ok(()) => {
                debug!(line = line_no, command_id = %id, "command queued");
                stats.accepted += 1;
            }
            Err(CommandLogError::AlreadyExists(_)) => {
                warn!(line = line_no, command_id = %id, "duplicate command id; ignored");
                stats.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(stats)
}
