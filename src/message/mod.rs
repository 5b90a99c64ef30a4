//! Message envelope and its connection codec
//!
//! An envelope is created once at send time and never modified afterwards.
//! On the wire each connection carries exactly one envelope, encoded as a
//! single newline-terminated JSON document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::clock::{DependencySet, ProcessId, TimeVector};

/// One causal message as it travels between processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// `P<sender>-P<receiver>-M<seq_num>`.
    pub id: String,
    pub sender: ProcessId,
    pub receiver: ProcessId,
    pub content: String,
    /// The sender's local time at the send instant.
    pub tm: TimeVector,
    /// The sender's dependency set minus the record for `receiver`.
    pub piggybacked: DependencySet,
    /// Wall-clock stamp, for logs only.
    pub physical_ts: DateTime<Utc>,
    /// Per-peer sequence number, starting at 1.
    pub seq_num: u64,
}

impl Envelope {
    pub fn new(
        sender: ProcessId,
        receiver: ProcessId,
        seq_num: u64,
        content: impl Into<String>,
        tm: TimeVector,
        piggybacked: DependencySet,
    ) -> Self {
        Self {
            id: format!("P{sender}-P{receiver}-M{seq_num}"),
            sender,
            receiver,
            content: content.into(),
            tm,
            piggybacked,
            physical_ts: Utc::now(),
            seq_num,
        }
    }
}

/// Write one envelope to the connection as a JSON line.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Read the single envelope carried by a connection.
pub async fn read_envelope<R>(reader: &mut R) -> std::io::Result<Envelope>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before an envelope arrived",
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_envelope_id_convention() {
        let envelope = Envelope::new(
            0,
            2,
            7,
            "message 7",
            TimeVector::zeroed(3),
            DependencySet::new(),
        );
        assert_eq!(envelope.id, "P0-P2-M7");
        assert_eq!(envelope.seq_num, 7);
    }

    #[tokio::test]
    async fn test_codec_over_duplex_stream() {
        let (mut client, server) = tokio::io::duplex(4096);

        let mut piggybacked = DependencySet::new();
        piggybacked.upsert(2, TimeVector::from_components(vec![1, 0, 3]));
        let sent = Envelope::new(
            0,
            1,
            1,
            "message 1",
            TimeVector::from_components(vec![2, 0, 0]),
            piggybacked,
        );

        write_envelope(&mut client, &sent).await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let received = read_envelope(&mut reader).await.unwrap();
        assert_eq!(received.id, sent.id);
        assert_eq!(received.tm, sent.tm);
        assert_eq!(
            received.piggybacked.get(2),
            Some(&TimeVector::from_components(vec![1, 0, 3]))
        );

        // The connection carried exactly one envelope.
        assert!(read_envelope(&mut reader).await.is_err());
    }
}
