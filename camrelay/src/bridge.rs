//! Line-delimited JSON signaling over a pair of byte streams.
//!
//! Inbound messages are read one per line and dispatched in arrival order.
//! Outbound messages queued by the manager are written one per line.

use camrelay_rtc::{OutboundSignal, SessionManager};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Dispatches every inbound line until end of input. Returns the number of
/// non-blank lines read.
pub async fn read_inbound<R>(reader: R, manager: &SessionManager) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut count = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;
        manager.dispatch_json(line).await;
    }

    info!(messages = count, "Signaling input closed");
    Ok(count)
}

/// Writes queued outbound messages until every sender is gone.
pub async fn write_outbound<W>(
    mut messages: mpsc::UnboundedReceiver<OutboundSignal>,
    mut writer: W,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut count = 0u64;

    while let Some(message) = messages.recv().await {
        let line = match message.to_json() {
            Ok(line) => line,
            Err(e) => {
                error!(session_id = %message.session_id(), error = %e, "Unserializable outbound message");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        count += 1;
        debug!(session_id = %message.session_id(), "Outbound message written");
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use camrelay_rtc::{BusPublisher, CandidatePayload, Qos, RelayConfig, SessionId};
    use std::sync::Arc;

    struct NullPublisher;

    #[async_trait]
    impl BusPublisher for NullPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Bytes,
            _retained: bool,
            _qos: Qos,
        ) -> camrelay_rtc::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_outbound_lines() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(OutboundSignal::answer(SessionId::from("s1"), "v=0\r\n"))
            .unwrap();
        tx.send(OutboundSignal::candidate(
            SessionId::from("s1"),
            CandidatePayload {
                candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        ))
        .unwrap();
        drop(tx);

        let mut out = Vec::new();
        let written = write_outbound(rx, &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["key"], "video.webrtc.answer");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["key"], "video.webrtc.candidate");
    }

    #[tokio::test]
    async fn test_inbound_skips_blank_and_survives_garbage() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = RelayConfig {
            ice: camrelay_rtc::IceConfig {
                stun_servers: Vec::new(),
                ..Default::default()
            },
            ..RelayConfig::default()
        };
        let manager = SessionManager::new(config, Arc::new(tx), Arc::new(NullPublisher)).unwrap();

        let input = concat!(
            "{\"key\":\"video.webrtc.keep_alive\",\"session_id\":\"s1\"}\n",
            "\n",
            "not json\n",
            "{\"key\":\"video.webrtc.hang_up\",\"session_id\":\"s1\"}\n",
        );
        let count = read_inbound(input.as_bytes(), &manager).await.unwrap();

        assert_eq!(count, 3);
        assert_eq!(manager.session_count(), 0);
        manager.shutdown().await;
    }
}
