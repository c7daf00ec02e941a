//! Shard state shared by the units, and the contexts units run in.

use crate::config::DataShardConfig;
use crate::PipelineConfig;
use std::collections::BTreeMap;
use strata_core::{Action, ActorId, Event, Message};
use strata_readsets::{ChangeExchange, InReadSets, OutReadSetRecord, OutReadSets};
use strata_storage::{decode_rows, keys, ShardStore, StorageError, SysTable, WriteBatch};
use strata_types::{
    decode, ChangeRecord, CodecError, PathId, PlanStep, ReadSetKey, TabletId, UserTable,
};
use tracing::debug;

const LAST_PLAN_STEP_KEY: &[u8] = b"last_plan_step";

/// In-memory state of one data shard. Rebuilt from the store on boot.
#[derive(Debug)]
pub struct ShardState {
    pub tablet_id: TabletId,
    pub config: PipelineConfig,
    pub user_tables: BTreeMap<PathId, UserTable>,
    pub outbox: OutReadSets,
    pub inbox: InReadSets,
    pub changes: ChangeExchange,
    /// Highest plan step this shard has seen.
    pub last_plan_step: PlanStep,
}

impl ShardState {
    pub fn new(tablet_id: TabletId, config: &DataShardConfig) -> Self {
        Self {
            tablet_id,
            config: config.pipeline.clone(),
            user_tables: BTreeMap::new(),
            outbox: OutReadSets::new(tablet_id, config.readsets.clone()),
            inbox: InReadSets::new(tablet_id, config.readsets.clone()),
            changes: ChangeExchange::new(tablet_id, config.change_exchange.clone()),
            last_plan_step: PlanStep::default(),
        }
    }

    pub fn restore(
        tablet_id: TabletId,
        config: &DataShardConfig,
        store: &dyn ShardStore,
    ) -> Result<Self, StorageError> {
        let tables: Vec<UserTable> = decode_rows(
            SysTable::UserTables.name(),
            store.scan_system(SysTable::UserTables)?,
        )?;
        let last_plan_step = match store.read_system(SysTable::Counters, LAST_PLAN_STEP_KEY)? {
            Some(bytes) => decode(&bytes)?,
            None => PlanStep::default(),
        };

        let state = Self {
            tablet_id,
            config: config.pipeline.clone(),
            user_tables: tables.into_iter().map(|t| (t.path_id, t)).collect(),
            outbox: OutReadSets::restore(tablet_id, config.readsets.clone(), store)?,
            inbox: InReadSets::restore(tablet_id, config.readsets.clone(), store)?,
            changes: ChangeExchange::restore(tablet_id, config.change_exchange.clone(), store)?,
            last_plan_step,
        };
        debug!(
            tablet = tablet_id.0,
            tables = state.user_tables.len(),
            last_plan_step = %state.last_plan_step,
            "Restored shard state"
        );
        Ok(state)
    }

    /// Record a newly seen plan step.
    pub fn observe_plan_step(
        &mut self,
        step: PlanStep,
        batch: &mut WriteBatch<SysTable>,
    ) -> Result<(), CodecError> {
        if step > self.last_plan_step {
            self.last_plan_step = step;
            batch.put(SysTable::Counters, LAST_PLAN_STEP_KEY.to_vec(), &step)?;
        }
        Ok(())
    }

    /// Publish the in-memory half of a committed transaction.
    pub(crate) fn apply_committed(&mut self, effects: TxEffects) -> Vec<Action> {
        for (path_id, table) in effects.table_updates {
            match table {
                Some(table) => {
                    self.user_tables.insert(path_id, table);
                }
                None => {
                    self.user_tables.remove(&path_id);
                }
            }
        }
        self.inbox.on_consumed(&effects.consumed);

        let mut actions = self.outbox.on_committed(effects.staged_readsets);
        actions.extend(self.changes.on_committed(effects.staged_changes));
        actions
    }
}

/// Everything a transaction changes in memory once it has committed.
#[derive(Debug, Default)]
pub(crate) struct TxEffects {
    staged_readsets: Vec<OutReadSetRecord>,
    staged_changes: Vec<ChangeRecord>,
    table_updates: BTreeMap<PathId, Option<UserTable>>,
    consumed: Vec<ReadSetKey>,
}

/// One local transaction. Units see the shard read-only and write through
/// the context; dropping the context rolls everything back.
pub struct TransactionContext<'a> {
    pub store: &'a dyn ShardStore,
    pub shard: &'a ShardState,
    pub batch: WriteBatch<SysTable>,
    effects: TxEffects,
}

impl<'a> TransactionContext<'a> {
    pub fn new(store: &'a dyn ShardStore, shard: &'a ShardState) -> Self {
        Self {
            store,
            shard,
            batch: WriteBatch::new(),
            effects: TxEffects::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shard.config
    }

    /// The table as this transaction sees it, including its own changes.
    pub fn user_table(&self, path_id: PathId) -> Option<&UserTable> {
        match self.effects.table_updates.get(&path_id) {
            Some(staged) => staged.as_ref(),
            None => self.shard.user_tables.get(&path_id),
        }
    }

    pub fn put_user_table(&mut self, table: UserTable) -> Result<(), CodecError> {
        self.batch
            .put(SysTable::UserTables, keys::u64_key(table.path_id.0), &table)?;
        self.effects.table_updates.insert(table.path_id, Some(table));
        Ok(())
    }

    pub fn remove_user_table(&mut self, path_id: PathId) {
        self.batch
            .remove(SysTable::UserTables, keys::u64_key(path_id.0));
        self.effects.table_updates.insert(path_id, None);
    }

    pub fn stage_read_set(&mut self, key: ReadSetKey, body: Vec<u8>) -> Result<u64, CodecError> {
        self.shard
            .outbox
            .stage(&mut self.effects.staged_readsets, key, body, &mut self.batch)
    }

    pub fn stage_change(
        &mut self,
        stream: PathId,
        table: PathId,
        body: Vec<u8>,
    ) -> Result<u64, CodecError> {
        self.shard.changes.stage(
            &mut self.effects.staged_changes,
            stream,
            table,
            body,
            &mut self.batch,
        )
    }

    /// Release an incoming read set, arrived or not.
    pub fn consume_read_set(&mut self, key: ReadSetKey) -> Result<(), CodecError> {
        self.shard.inbox.stage_consume(&key, &mut self.batch)?;
        self.effects.consumed.push(key);
        Ok(())
    }

    pub(crate) fn finish(self) -> (WriteBatch<SysTable>, TxEffects) {
        (self.batch, self.effects)
    }
}

/// Context of the completion phase, after the transaction committed.
pub struct CompleteContext<'a> {
    pub shard: &'a mut ShardState,
    pub actions: &'a mut Vec<Action>,
}

impl CompleteContext<'_> {
    pub fn send(&mut self, to: ActorId, message: Message) {
        self.actions.push(Action::send(to, message));
    }

    pub fn internal(&mut self, event: Event) {
        self.actions.push(Action::internal(event));
    }
}
