//! DD filter node: drops mutations aimed at dropped collections and
//! partitions, and raises the clear signal when this channel's own
//! collection is dropped.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::info;

use vectorstream_core::{CollectionId, PartitionId};

use crate::error::Result;
use crate::flow_graph::{FlowMsg, FlowNode};

pub struct DdFilterNode {
    collection_id: CollectionId,
    clear_tx: mpsc::UnboundedSender<CollectionId>,
    dropped_collections: HashSet<CollectionId>,
    dropped_partitions: HashSet<(CollectionId, PartitionId)>,
}

impl DdFilterNode {
    pub fn new(
        collection_id: CollectionId,
        clear_tx: mpsc::UnboundedSender<CollectionId>,
    ) -> Self {
        Self {
            collection_id,
            clear_tx,
            dropped_collections: HashSet::new(),
            dropped_partitions: HashSet::new(),
        }
    }
}

#[async_trait]
impl FlowNode for DdFilterNode {
    fn name(&self) -> &'static str {
        "dd-filter"
    }

    async fn process(&mut self, mut msg: FlowMsg) -> Result<FlowMsg> {
        for collection_id in &msg.dropped_collections {
            if self.dropped_collections.insert(*collection_id)
                && *collection_id == self.collection_id
            {
                info!(collection_id, "own collection dropped, raising clear signal");
                msg.drop_collection = true;
                let _ = self.clear_tx.send(self.collection_id);
            }
        }
        for dropped in &msg.dropped_partitions {
            self.dropped_partitions.insert(*dropped);
        }

        msg.inserts.retain(|m| {
            !self.dropped_collections.contains(&m.collection_id)
                && !self
                    .dropped_partitions
                    .contains(&(m.collection_id, m.partition_id))
        });
        msg.deletes.retain(|m| {
            !self.dropped_collections.contains(&m.collection_id)
                && !self
                    .dropped_partitions
                    .contains(&(m.collection_id, m.partition_id))
        });
        Ok(msg)
    }
}
