//! Virtual-channel stream seam.
//!
//! The real transport is an external collaborator; the data node only
//! requires resumable, totally-ordered reads per channel. [`MemoryMsgBus`]
//! is the in-process implementation used by tests and local deployments:
//! publishers append batches to a per-channel log, subscribers replay
//! from any position.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use vectorstream_core::{MsgBatch, Position, StreamMessage, Timestamp};

use crate::error::Result;

#[async_trait]
pub trait MsgStream: Send {
    /// Resume reading after `position`. The batch at `position` itself is
    /// already applied and is not re-delivered.
    async fn seek(&mut self, position: &Position) -> Result<()>;

    /// Next batch in stream order; `None` once the channel is closed and
    /// fully drained.
    async fn next(&mut self) -> Result<Option<MsgBatch>>;
}

pub trait MsgStreamFactory: Send + Sync {
    fn subscribe(&self, channel: &str) -> Box<dyn MsgStream>;
}

#[derive(Default)]
struct ChannelLog {
    batches: Vec<MsgBatch>,
    closed: bool,
}

/// In-memory durable message bus with replayable per-channel logs.
#[derive(Clone)]
pub struct MemoryMsgBus {
    logs: Arc<Mutex<HashMap<String, ChannelLog>>>,
    version: watch::Sender<u64>,
}

impl Default for MemoryMsgBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMsgBus {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            logs: Arc::new(Mutex::new(HashMap::new())),
            version,
        }
    }

    /// Append one batch; returns its position. Message IDs are assigned
    /// densely starting at 1.
    pub fn publish(
        &self,
        channel: &str,
        messages: Vec<StreamMessage>,
        timetick: Timestamp,
    ) -> Position {
        let position = {
            let mut logs = self.logs.lock().unwrap();
            let log = logs.entry(channel.to_string()).or_default();
            let msg_id = log.batches.len() as u64 + 1;
            let position = Position::new(channel, msg_id, timetick);
            log.batches.push(MsgBatch {
                messages,
                timetick,
                position: position.clone(),
            });
            position
        };
        self.version.send_modify(|v| *v += 1);
        position
    }

    /// Close a channel; subscribers drain what is left and see the end.
    pub fn close_channel(&self, channel: &str) {
        self.logs
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .closed = true;
        self.version.send_modify(|v| *v += 1);
    }

    pub fn latest_position(&self, channel: &str) -> Option<Position> {
        self.logs
            .lock()
            .unwrap()
            .get(channel)
            .and_then(|log| log.batches.last())
            .map(|b| b.position.clone())
    }
}

impl MsgStreamFactory for MemoryMsgBus {
    fn subscribe(&self, channel: &str) -> Box<dyn MsgStream> {
        Box::new(MemoryMsgStream {
            bus: self.clone(),
            channel: channel.to_string(),
            next_msg_id: 1,
        })
    }
}

struct MemoryMsgStream {
    bus: MemoryMsgBus,
    channel: String,
    next_msg_id: u64,
}

#[async_trait]
impl MsgStream for MemoryMsgStream {
    async fn seek(&mut self, position: &Position) -> Result<()> {
        self.next_msg_id = position.msg_id + 1;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<MsgBatch>> {
        loop {
            let mut rx = self.bus.version.subscribe();
            {
                let logs = self.bus.logs.lock().unwrap();
                if let Some(log) = logs.get(&self.channel) {
                    let index = (self.next_msg_id - 1) as usize;
                    if index < log.batches.len() {
                        self.next_msg_id += 1;
                        return Ok(Some(log.batches[index].clone()));
                    }
                    if log.closed {
                        return Ok(None);
                    }
                }
            }
            if rx.changed().await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_consume_in_order() {
        let bus = MemoryMsgBus::new();
        let p1 = bus.publish("ch-0", vec![], 10);
        let p2 = bus.publish("ch-0", vec![], 20);
        assert!(p1.msg_id < p2.msg_id);

        let mut stream = bus.subscribe("ch-0");
        assert_eq!(stream.next().await.unwrap().unwrap().position, p1);
        assert_eq!(stream.next().await.unwrap().unwrap().position, p2);
        bus.close_channel("ch-0");
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seek_skips_applied_batches() {
        let bus = MemoryMsgBus::new();
        let p1 = bus.publish("ch-0", vec![], 10);
        let p2 = bus.publish("ch-0", vec![], 20);

        let mut stream = bus.subscribe("ch-0");
        stream.seek(&p1).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().position, p2);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let bus = MemoryMsgBus::new();
        let mut stream = bus.subscribe("ch-0");
        let reader = tokio::spawn(async move { stream.next().await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let p = bus.publish("ch-0", vec![], 5);
        assert_eq!(reader.await.unwrap().unwrap().position, p);
    }
}
