//! Background writer draining the request-log queue into the database.
//! Batches inserts off the request path; a failed batch is dropped with a
//! logged error rather than blocking or propagating.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ActiveValue, EntityTrait};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use mproxy_core::logsink::RequestLogEntry;

use crate::entities;
use crate::storage::SqlStorage;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

pub fn spawn_log_writer(
    storage: Arc<SqlStorage>,
    mut rx: mpsc::Receiver<RequestLogEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<RequestLogEntry> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker = tokio_time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    match entry {
                        Some(entry) => {
                            buffer.push(entry);
                            if buffer.len() >= BATCH_SIZE {
                                flush(&storage, &mut buffer).await;
                            }
                        }
                        None => {
                            flush(&storage, &mut buffer).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush(&storage, &mut buffer).await;
                }
            }
        }
    })
}

async fn flush(storage: &SqlStorage, buffer: &mut Vec<RequestLogEntry>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    let now = OffsetDateTime::now_utc();

    let models = batch
        .into_iter()
        .map(|entry| entities::request_logs::ActiveModel {
            id: ActiveValue::NotSet,
            at: ActiveValue::Set(entry.at),
            source_api: ActiveValue::Set(entry.source_api),
            target_api: ActiveValue::Set(entry.target_api),
            source_model: ActiveValue::Set(entry.source_model),
            target_model: ActiveValue::Set(entry.target_model),
            provider: ActiveValue::Set(entry.provider),
            request_body: ActiveValue::Set(entry.request_body),
            response_body: ActiveValue::Set(entry.response_body),
            status_code: ActiveValue::Set(i32::from(entry.status_code)),
            error_message: ActiveValue::Set(entry.error_message),
            processing_seconds: ActiveValue::Set(entry.processing_seconds),
            created_at: ActiveValue::Set(now),
        });

    if let Err(err) = entities::RequestLogs::insert_many(models)
        .exec(storage.connection())
        .await
    {
        tracing::error!(%err, dropped = count, "request log batch write failed");
    }
}
