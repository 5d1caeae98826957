//! Compaction Handler
//!
//! Owns the lifecycle of compaction plans:
//!
//! ```text
//! Pipelining -> Executing -> { Completed | Timeout | Failed }
//! ```
//!
//! A plan is dispatched to the data node watching the plan's channel and
//! completed when that node reports back. Completion is the only place a
//! compaction becomes visible: the result segment, the dropped sources
//! and the plan record land in meta as one atomic commit, so a reader
//! sees either all sources alive or all sources dropped and the result
//! present, never a partial swap. Terminal states are immutable; a
//! result for a timed-out plan is refused and its sources stay valid.
//!
//! Concurrent plans must not share sources: the first submitted wins and
//! later ones fail with `ConflictingCompaction`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vectorstream_core::PlanId;
use vectorstream_meta::keys::{compaction_plan_key, COMPACTION_PLAN_PREFIX};
use vectorstream_meta::{MetaKv, SegmentInfo, SegmentMeta, SegmentState};
use vectorstream_rpc::{CompactionPlan, CompactionResult};

use crate::channel_manager::ChannelManager;
use crate::cluster::Cluster;
use crate::config::CompactionConfig;
use crate::error::{CoordError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionTaskState {
    Pipelining,
    Executing,
    Completed,
    Timeout,
    Failed,
}

impl CompactionTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CompactionTaskState::Completed | CompactionTaskState::Timeout | CompactionTaskState::Failed
        )
    }

    fn name(self) -> &'static str {
        match self {
            CompactionTaskState::Pipelining => "pipelining",
            CompactionTaskState::Executing => "executing",
            CompactionTaskState::Completed => "completed",
            CompactionTaskState::Timeout => "timeout",
            CompactionTaskState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionTask {
    pub plan: CompactionPlan,
    pub trigger_id: PlanId,
    pub state: CompactionTaskState,
    pub result: Option<CompactionResult>,
    pub deadline_ms: i64,
}

/// Persisted form of a plan.
#[derive(Debug, Serialize, Deserialize)]
struct PlanRecord {
    plan: CompactionPlan,
    trigger_id: PlanId,
    state: CompactionTaskState,
}

pub struct CompactionHandler {
    meta: Arc<SegmentMeta>,
    kv: Arc<dyn MetaKv>,
    cluster: Arc<Cluster>,
    channel_manager: Arc<ChannelManager>,
    config: CompactionConfig,
    tasks: Mutex<HashMap<PlanId, CompactionTask>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl CompactionHandler {
    /// Open the handler, failing over any plan left non-terminal by a
    /// previous coordinator run. Sources of such plans remain valid.
    pub async fn open(
        meta: Arc<SegmentMeta>,
        kv: Arc<dyn MetaKv>,
        cluster: Arc<Cluster>,
        channel_manager: Arc<ChannelManager>,
        config: CompactionConfig,
    ) -> Result<Self> {
        let mut tasks = HashMap::new();
        for (key, value) in kv.load_with_prefix(COMPACTION_PLAN_PREFIX).await? {
            let Ok(mut record) = serde_json::from_slice::<PlanRecord>(&value) else {
                warn!(key = %key, "skipping unreadable compaction plan record");
                continue;
            };
            if !record.state.is_terminal() {
                warn!(plan_id = record.plan.plan_id, "in-flight plan aborted by restart");
                record.state = CompactionTaskState::Failed;
                kv.save(&key, serde_json::to_vec(&record).map_err(vectorstream_meta::MetaError::from)?)
                    .await?;
            }
            tasks.insert(
                record.plan.plan_id,
                CompactionTask {
                    plan: record.plan,
                    trigger_id: record.trigger_id,
                    state: record.state,
                    result: None,
                    deadline_ms: 0,
                },
            );
        }
        Ok(Self {
            meta,
            kv,
            cluster,
            channel_manager,
            config,
            tasks: Mutex::new(tasks),
        })
    }

    async fn persist(&self, task: &CompactionTask) -> Result<()> {
        let record = PlanRecord {
            plan: task.plan.clone(),
            trigger_id: task.trigger_id,
            state: task.state,
        };
        self.kv
            .save(
                &compaction_plan_key(task.plan.plan_id),
                serde_json::to_vec(&record).map_err(vectorstream_meta::MetaError::from)?,
            )
            .await?;
        Ok(())
    }

    fn encoded_plan_record(task: &CompactionTask) -> Result<(String, Vec<u8>)> {
        let record = PlanRecord {
            plan: task.plan.clone(),
            trigger_id: task.trigger_id,
            state: task.state,
        };
        Ok((
            compaction_plan_key(task.plan.plan_id),
            serde_json::to_vec(&record).map_err(vectorstream_meta::MetaError::from)?,
        ))
    }

    /// Register and dispatch a plan to the owner of its channel.
    pub async fn execute_plan(&self, trigger_id: PlanId, plan: CompactionPlan) -> Result<()> {
        let plan_id = plan.plan_id;
        {
            let mut tasks = self.tasks.lock().await;
            // First submitted wins on any shared source.
            for task in tasks.values() {
                if task.state.is_terminal() {
                    continue;
                }
                if let Some(&seg) = task
                    .plan
                    .segment_ids
                    .iter()
                    .find(|s| plan.segment_ids.contains(s))
                {
                    return Err(CoordError::ConflictingCompaction {
                        plan_id: task.plan.plan_id,
                        segment_id: seg,
                    });
                }
            }
            let task = CompactionTask {
                plan: plan.clone(),
                trigger_id,
                state: CompactionTaskState::Pipelining,
                result: None,
                deadline_ms: now_ms() + self.config.plan_timeout.as_millis() as i64,
            };
            self.persist(&task).await?;
            tasks.insert(plan_id, task);
        }

        let node = self.channel_manager.watching_node(&plan.channel).await;
        let client = match node {
            Some(node_id) => self.cluster.client(node_id).await,
            None => None,
        };
        let Some(client) = client else {
            self.fail_plan(plan_id).await?;
            return Err(CoordError::NoLiveNodes);
        };

        let status = client.compaction(plan.clone()).await;
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(&plan_id)
                .ok_or(CoordError::PlanNotFound(plan_id))?;
            if status.is_success() {
                task.state = CompactionTaskState::Executing;
                task.deadline_ms = now_ms() + self.config.plan_timeout.as_millis() as i64;
                metrics::COMPACTION_PLANS_TOTAL.inc();
                info!(plan_id, node = ?node, segments = ?plan.segment_ids, "compaction plan executing");
            } else {
                task.state = CompactionTaskState::Failed;
                warn!(plan_id, reason = %status.reason, "compaction plan rejected by node");
            }
            task.clone()
        };
        self.persist(&snapshot).await?;
        Ok(())
    }

    async fn fail_plan(&self, plan_id: PlanId) -> Result<()> {
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            tasks.get_mut(&plan_id).map(|task| {
                if !task.state.is_terminal() {
                    task.state = CompactionTaskState::Failed;
                }
                task.clone()
            })
        };
        if let Some(task) = snapshot {
            self.persist(&task).await?;
        }
        Ok(())
    }

    /// Apply a node's result: the atomic source-drop / result-insert swap.
    pub async fn complete_compaction(&self, result: CompactionResult) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&result.plan_id)
            .ok_or(CoordError::PlanNotFound(result.plan_id))?;
        if task.state != CompactionTaskState::Executing {
            return Err(CoordError::PlanNotExecuting {
                plan_id: result.plan_id,
                state: task.state.name(),
            });
        }

        let sources = task.plan.segment_ids.clone();
        let mut merged = SegmentInfo::new(
            result.segment_id,
            task.plan.collection_id,
            task.plan.partition_id,
            task.plan.channel.clone(),
            0,
        );
        merged.state = SegmentState::Flushed;
        merged.num_rows = result.num_rows;
        merged.binlogs = result.insert_logs.clone();
        merged.statslogs = result.statslogs.clone();
        merged.deltalogs = result.deltalogs.clone();
        merged.compaction_from = sources.clone();
        merged.created_by_compaction = true;
        for id in &sources {
            if let Some(src) = self.meta.get_segment(*id).await {
                merged.max_rows = merged.max_rows.max(src.max_rows);
                if let Some(dml) = src.dml_position {
                    let newer = merged
                        .dml_position
                        .as_ref()
                        .map_or(true, |cur| dml.msg_id > cur.msg_id);
                    if newer {
                        merged.dml_position = Some(dml);
                    }
                }
                if let Some(start) = src.start_position {
                    let earlier = merged
                        .start_position
                        .as_ref()
                        .map_or(true, |cur| start.msg_id < cur.msg_id);
                    if earlier {
                        merged.start_position = Some(start);
                    }
                }
            }
        }

        // Persist first: the plan record flips to Completed inside the
        // same commit that swaps the segments. Memory state follows.
        let mut completed = task.clone();
        completed.state = CompactionTaskState::Completed;
        completed.result = Some(result.clone());
        let plan_record = Self::encoded_plan_record(&completed)?;
        self.meta
            .complete_compaction(&sources, merged, plan_record)
            .await?;
        *task = completed;
        info!(
            plan_id = result.plan_id,
            result_segment = result.segment_id,
            sources = ?sources,
            "compaction completed"
        );
        Ok(())
    }

    /// Move overdue Executing plans to Timeout; their sources stay valid.
    pub async fn sweep_timeouts(&self) {
        let now = now_ms();
        let overdue: Vec<CompactionTask> = {
            let mut tasks = self.tasks.lock().await;
            let mut overdue = Vec::new();
            for task in tasks.values_mut() {
                if task.state == CompactionTaskState::Executing && now > task.deadline_ms {
                    task.state = CompactionTaskState::Timeout;
                    warn!(plan_id = task.plan.plan_id, "compaction plan timed out");
                    overdue.push(task.clone());
                }
            }
            overdue
        };
        for task in overdue {
            if let Err(e) = self.persist(&task).await {
                warn!(plan_id = task.plan.plan_id, error = %e, "failed to persist timeout");
            }
        }
    }

    pub async fn tasks_by_trigger(&self, trigger_id: PlanId) -> Vec<CompactionTask> {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.trigger_id == trigger_id)
            .cloned()
            .collect()
    }

    /// Non-terminal plans currently touching any of `segments`.
    pub async fn in_flight_on(&self, segments: &[vectorstream_core::SegmentId]) -> bool {
        self.tasks.lock().await.values().any(|t| {
            !t.state.is_terminal() && t.plan.segment_ids.iter().any(|s| segments.contains(s))
        })
    }
}
