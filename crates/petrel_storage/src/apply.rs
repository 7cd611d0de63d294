//! WAL apply job: drains commit notifications and merges WAL segments into
//! table storage.
//!
//! Per table, visibility order equals WAL append order equals apply order.
//! A failed apply suspends the table instead of crashing the engine; a full
//! notification queue is compensated by the unpublished-txn rescan, so no
//! committed txn is ever lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use petrel_common::error::{PetrelError, PetrelResult};
use petrel_common::types::{ColumnType, TableToken, Value};

use crate::colfile;
use crate::engine::Engine;
use crate::sequencer::TxnLocation;
use crate::wal::events::{DataInfo, WalEventBody, WalEventReader};
use crate::wal::{segment_dir_name, wal_dir_name, CMD_RENAME_TABLE};
use crate::writer::TableWriter;

/// Per-segment apply state: the event reader plus the cumulative
/// writer-local → table symbol code translation folded from the segment's
/// diffs. Rebuilt from txn 0 on restart; folding interns by string, so the
/// rebuild is idempotent.
struct SegmentState {
    reader: WalEventReader,
    dir: PathBuf,
    translations: HashMap<usize, HashMap<i32, i32>>,
    folded_up_to: i32,
}

pub struct WalApplyJob {
    engine: Arc<Engine>,
    segments: HashMap<(String, i32, i32), SegmentState>,
}

impl WalApplyJob {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            segments: HashMap::new(),
        }
    }

    /// One pass: rescans all WAL tables when unpublished txns may exist,
    /// then drains the notification queue. True when any txn was applied.
    pub fn run(&mut self) -> bool {
        let mut useful = false;
        if self.engine.take_unpublished_wal_txn_count() > 0 {
            let tokens = self.engine.registry().table_tokens(true);
            for token in tokens.into_iter().filter(|t| t.is_wal()) {
                useful |= self.apply_table(&token);
            }
        }
        while let Some(notification) = self
            .engine
            .message_bus()
            .wal_txn_notifications
            .try_consume()
        {
            useful |= self.apply_table(&notification.token);
        }
        useful
    }

    fn apply_table(&mut self, token: &TableToken) -> bool {
        match self.apply_table_inner(token) {
            Ok(applied) => applied,
            Err(PetrelError::EntryUnavailable { .. }) => false,
            Err(e) => {
                tracing::error!(table = %token, error = %e, "WAL apply failed, suspending table");
                let _ = self.engine.sequencer().suspend(token);
                false
            }
        }
    }

    fn apply_table_inner(&mut self, token: &TableToken) -> PetrelResult<bool> {
        if self.engine.is_table_dropped(token) {
            self.engine.purge_dropped_table(token);
            return Ok(false);
        }
        if self
            .engine
            .registry()
            .get_token_by_dir_name(token.dir_name())
            .is_none()
        {
            // dropped and purged while the notification was in flight
            return Ok(false);
        }
        let sequencer = Arc::clone(self.engine.sequencer());
        if sequencer.is_suspended(token) {
            return Ok(false);
        }
        let tracker = sequencer.tracker(token)?;
        let seq_txn = tracker.seq_txn();

        let mut writer = self.engine.get_writer_unsafe(token, "wal apply")?;
        let applied = writer.seq_txn();
        sequencer.update_writer_txns(token, applied, seq_txn);
        if applied >= seq_txn {
            return Ok(false);
        }

        for txn in (applied + 1)..=seq_txn {
            let location = sequencer.txn_location(token, txn)?;
            self.apply_txn(token, &mut writer, txn, location)?;
            sequencer.update_writer_txns(token, txn, seq_txn);
        }
        tracing::debug!(table = %token, from = applied + 1, to = seq_txn, "applied WAL txns");
        self.engine.mat_view_graph().notify_txn_applied(token, seq_txn);
        Ok(true)
    }

    fn segment_state<'a>(
        segments: &'a mut HashMap<(String, i32, i32), SegmentState>,
        engine: &Engine,
        token: &TableToken,
        location: TxnLocation,
    ) -> PetrelResult<&'a mut SegmentState> {
        let key = (
            token.dir_name().to_string(),
            location.wal_id,
            location.segment_id,
        );
        if !segments.contains_key(&key) {
            let dir = engine
                .config()
                .db_root
                .join(token.dir_name())
                .join(wal_dir_name(location.wal_id))
                .join(segment_dir_name(location.segment_id));
            let reader = WalEventReader::open(engine.files(), &dir)?;
            segments.insert(
                key.clone(),
                SegmentState {
                    reader,
                    dir,
                    translations: HashMap::new(),
                    folded_up_to: -1,
                },
            );
        }
        Ok(segments.get_mut(&key).expect("segment state inserted"))
    }

    fn apply_txn(
        &mut self,
        token: &TableToken,
        writer: &mut TableWriter,
        seq_txn: i64,
        location: TxnLocation,
    ) -> PetrelResult<()> {
        let engine = Arc::clone(&self.engine);
        let state = Self::segment_state(&mut self.segments, &engine, token, location)?;
        let record = state
            .reader
            .read_record(location.segment_txn)?
            .ok_or_else(|| PetrelError::CorruptFile {
                path: state.dir.display().to_string(),
                reason: format!(
                    "missing committed record [segmentTxn={}]",
                    location.segment_txn
                ),
            })?;

        match &record.body {
            WalEventBody::Data(data) => {
                Self::apply_data(engine.files(), state, writer, location, data)?;
                writer.commit_applied(seq_txn)?;
            }
            WalEventBody::MatViewData {
                data,
                last_refresh_base_txn,
                last_refresh_timestamp,
            } => {
                Self::apply_data(engine.files(), state, writer, location, data)?;
                writer.commit_applied(seq_txn)?;
                if let Some(view_state) = engine.mat_view_graph().view_state(token) {
                    view_state.record_refresh(*last_refresh_base_txn, *last_refresh_timestamp);
                }
            }
            WalEventBody::Truncate => {
                writer.truncate_applied(seq_txn)?;
            }
            WalEventBody::Sql { cmd_type, sql, .. } => {
                if *cmd_type == CMD_RENAME_TABLE {
                    engine.apply_table_rename(token, sql)?;
                } else {
                    tracing::debug!(table = %token, cmd_type, "skipping non-structural SQL record");
                }
                writer.mark_seq_applied(seq_txn)?;
            }
            WalEventBody::MatViewInvalidate { invalid, reason } => {
                if let Some(view_state) = engine.mat_view_graph().view_state(token) {
                    view_state.set_invalid(*invalid, reason.clone());
                }
                writer.mark_seq_applied(seq_txn)?;
            }
        }
        Ok(())
    }

    /// Copies `[start_row_id, end_row_id)` from the segment's column files
    /// into the table, translating symbol codes through the segment's
    /// folded diffs.
    fn apply_data(
        ff: crate::fs::FilesFacade,
        state: &mut SegmentState,
        writer: &mut TableWriter,
        location: TxnLocation,
        data: &DataInfo,
    ) -> PetrelResult<()> {
        // Fold diffs of every record up to this one so codes from earlier
        // txns of the segment translate too.
        if state.folded_up_to < location.segment_txn {
            for txn in (state.folded_up_to + 1)..=location.segment_txn {
                if let Some(rec) = state.reader.read_record(txn)? {
                    let diffs = match &rec.body {
                        WalEventBody::Data(d) => &d.symbol_diffs,
                        WalEventBody::MatViewData { data: d, .. } => &d.symbol_diffs,
                        _ => continue,
                    };
                    for diff in diffs {
                        let map =
                            writer.apply_symbol_diff(diff.column_index as usize, &diff.entries)?;
                        state
                            .translations
                            .entry(diff.column_index as usize)
                            .or_default()
                            .extend(map);
                    }
                }
            }
            state.folded_up_to = location.segment_txn;
        }

        let columns = writer.meta().columns.clone();
        let mut rows = Vec::with_capacity((data.end_row_id - data.start_row_id) as usize);
        for row_id in data.start_row_id..data.end_row_id {
            let mut row = Vec::with_capacity(columns.len());
            for (i, col) in columns.iter().enumerate() {
                let raw =
                    colfile::read_value(ff, &state.dir, &col.name, col.col_type, row_id as u64)?;
                let value = if col.col_type == ColumnType::Symbol {
                    match raw {
                        Value::Null => Value::Null,
                        Value::Int(code) => {
                            let mapped = state
                                .translations
                                .get(&i)
                                .and_then(|m| m.get(&code))
                                .copied()
                                .unwrap_or(code);
                            match writer.symbol_value(i, mapped) {
                                Some(s) => Value::Symbol(s.to_string()),
                                None => {
                                    return Err(PetrelError::CorruptFile {
                                        path: state.dir.display().to_string(),
                                        reason: format!("unmapped symbol code {code}"),
                                    })
                                }
                            }
                        }
                        _ => unreachable!("symbol columns read as codes"),
                    }
                } else {
                    raw
                };
                row.push(value);
            }
            rows.push(row);
        }
        for row in rows {
            writer.append_row(row)?;
        }
        Ok(())
    }
}
