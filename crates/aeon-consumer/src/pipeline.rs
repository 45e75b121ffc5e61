//! Per-command pipeline: `Queued → Timestamping → LayoutCheck → Locking →
//! Executing → Appending → Indexing → Notifying → Succeeded/Failed`,
//! expressed as one generic async function rather than an explicit state
//! enum — the `?`/`await` chain below already is the state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use aeon_bus::{NotifiedEntity, SubscriberRegistry};
use aeon_clock::HybridClock;
use aeon_codec::encode_entity;
use aeon_index::{IndexEngine, IndexedEntity};
use aeon_layout::{EntityDescriptor, Layout, LayoutCache, LayoutValue, Value};
use aeon_locks::LockProvider;
use aeon_store_core::{EntityMeta, Journal, StorageError};
use aeon_types::{
    Command, CommandTerminatedExceptionally, EntityId, EntityLayoutIntroduced,
    EventCausalityEstablished, HostErrorOccurred, HybridTimestamp, LayoutFingerprint,
};

use crate::ConsumerError;

/// Everything a single pipeline run needs, shared across every `publish`
/// call by `Arc`. Cheap to clone, so each job closure carries its own.
pub(crate) struct PipelineContext {
    pub(crate) clock: Arc<HybridClock>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) locks: Arc<dyn LockProvider>,
    pub(crate) layouts: LayoutCache,
    pub(crate) index: Arc<IndexEngine>,
    pub(crate) subscribers: Arc<SubscriberRegistry>,
    pub(crate) lock_timeout: Duration,
}

/// One layout known (or newly derived) for this run, paired with whether it
/// needs an `EntityLayoutIntroduced` event before anything of that
/// fingerprint can be appended.
struct CheckedLayout {
    layout: Layout,
    novel: bool,
}

fn check_layout(layouts: &LayoutCache, desc: EntityDescriptor) -> Result<CheckedLayout, ConsumerError> {
    let (layout, novel) = layouts.get_or_derive(&desc)?;
    Ok(CheckedLayout { layout, novel })
}

/// A to-be-appended `EntityLayoutIntroduced`, already encoded against its own
/// (always-known, bootstrap) layout.
struct PendingIntroduction {
    id: EntityId,
    timestamp: HybridTimestamp,
    payload: Vec<u8>,
    introduced: LayoutFingerprint,
}

/// A to-be-appended, already-encoded entity plus the decoded value used for
/// indexing and the fingerprint/meta used for journaling and notification.
struct PendingEntity {
    id: EntityId,
    timestamp: HybridTimestamp,
    fingerprint: LayoutFingerprint,
    payload: Vec<u8>,
    value: Value,
}

fn make_introduction(
    ctx: &PipelineContext,
    introduced_layout: &Layout,
    own_layout: &Layout,
) -> Result<PendingIntroduction, ConsumerError> {
    let id = EntityId::new();
    let timestamp = ctx.clock.tick();
    let event = EntityLayoutIntroduced {
        fingerprint: introduced_layout.fingerprint,
        schema: aeon_layout::encode_schema(introduced_layout),
    };
    let payload = encode_entity(&event.to_value(), own_layout, &ctx.layouts)?;
    Ok(PendingIntroduction { id, timestamp, payload, introduced: introduced_layout.fingerprint })
}

/// Run one command through the full pipeline, from timestamping through
/// notification, resolving to the command's own result or the error kind
/// that terminated it.
pub(crate) async fn run_pipeline<C>(ctx: Arc<PipelineContext>, command: C) -> Result<C::Output, ConsumerError>
where
    C: Command + LayoutValue,
    C::Event: LayoutValue,
{
    // 1. Timestamping.
    let command_id = EntityId::new();
    let command_ts = ctx.clock.tick();

    // 2. LayoutCheck. A layout derived for the first time in this process's
    // cache may still be one the journal already carries an
    // `EntityLayoutIntroduced` for, after a restart — `known_fingerprints`
    // is what makes "novel" mean "needs introducing" rather than just
    // "new to this cache".
    let already_introduced = ctx.journal.known_fingerprints().await?;
    let introduced_layout = check_layout(&ctx.layouts, EntityLayoutIntroduced::descriptor())?.layout;
    let command_layout = check_layout(&ctx.layouts, C::descriptor())?;
    let event_layout = check_layout(&ctx.layouts, C::Event::descriptor())?;
    let causality_layout = check_layout(&ctx.layouts, EventCausalityEstablished::descriptor())?;

    let mut seen = std::collections::HashSet::new();
    let mut introductions = Vec::new();
    for checked in [&command_layout, &event_layout, &causality_layout] {
        if checked.novel
            && seen.insert(checked.layout.fingerprint)
            && !already_introduced.contains(&checked.layout.fingerprint)
        {
            introductions.push(make_introduction(&ctx, &checked.layout, &introduced_layout)?);
        }
    }

    // 3. Locking.
    let lock_names = command.lock_names();
    let guards = ctx
        .locks
        .acquire_sorted(&lock_names, ctx.lock_timeout)
        .await
        .map_err(|_| ConsumerError::LockTimeout(lock_names.join(",")))?;

    // Command payload is encoded before `execute` consumes it by value.
    let command_value = command.to_value();
    let command_bytes = encode_entity(&command_value, &command_layout.layout, &ctx.layouts)?;

    // 4. Executing.
    let execution = Box::new(command).execute();
    let mut events = execution.events;
    let finish = execution.finish;

    let mut user_events = Vec::new();
    let mut causality_events = Vec::new();
    let mut host_failure: Option<String> = None;

    loop {
        match std::panic::catch_unwind(AssertUnwindSafe(|| events.next())) {
            Ok(Some(event)) => {
                let event_id = EntityId::new();
                let event_ts = ctx.clock.tick();
                let value = event.to_value();
                let payload = match encode_entity(&value, &event_layout.layout, &ctx.layouts) {
                    Ok(p) => p,
                    Err(e) => return Err(ConsumerError::from(e)),
                };
                user_events.push(PendingEntity {
                    id: event_id,
                    timestamp: event_ts,
                    fingerprint: event_layout.layout.fingerprint,
                    payload,
                    value,
                });

                let causality = EventCausalityEstablished { event_id, cause_id: command_id };
                let causality_ts = ctx.clock.tick();
                let causality_value = causality.to_value();
                let causality_payload = encode_entity(&causality_value, &causality_layout.layout, &ctx.layouts)
                    .expect("built-in causality layout always encodes its own value");
                causality_events.push(PendingEntity {
                    id: EntityId::new(),
                    timestamp: causality_ts,
                    fingerprint: causality_layout.layout.fingerprint,
                    payload: causality_payload,
                    value: causality_value,
                });
            }
            Ok(None) => break,
            Err(panic) => {
                host_failure = Some(panic_message(panic));
                break;
            }
        }
    }

    let output = if host_failure.is_none() {
        match std::panic::catch_unwind(AssertUnwindSafe(finish)) {
            Ok(output) => Some(output),
            Err(panic) => {
                host_failure = Some(panic_message(panic));
                None
            }
        }
    } else {
        None
    };

    // Host failure: abandon buffered user events, journal only the command
    // plus the failure pair.
    let (primary_events, extra_introductions) = if let Some(detail) = &host_failure {
        let terminated_layout = check_layout(&ctx.layouts, CommandTerminatedExceptionally::descriptor())?;
        let host_error_layout = check_layout(&ctx.layouts, HostErrorOccurred::descriptor())?;

        let mut extra = Vec::new();
        if terminated_layout.novel && !already_introduced.contains(&terminated_layout.layout.fingerprint) {
            extra.push(make_introduction(&ctx, &terminated_layout.layout, &introduced_layout)?);
        }
        if host_error_layout.novel
            && host_error_layout.layout.fingerprint != terminated_layout.layout.fingerprint
            && !already_introduced.contains(&host_error_layout.layout.fingerprint)
        {
            extra.push(make_introduction(&ctx, &host_error_layout.layout, &introduced_layout)?);
        }

        let terminated = CommandTerminatedExceptionally { message: detail.clone() };
        let terminated_value = terminated.to_value();
        let terminated_payload = encode_entity(&terminated_value, &terminated_layout.layout, &ctx.layouts)?;

        let host_error = HostErrorOccurred { detail: detail.clone() };
        let host_error_value = host_error.to_value();
        let host_error_payload = encode_entity(&host_error_value, &host_error_layout.layout, &ctx.layouts)?;

        let events = vec![
            PendingEntity {
                id: EntityId::new(),
                timestamp: ctx.clock.tick(),
                fingerprint: terminated_layout.layout.fingerprint,
                payload: terminated_payload,
                value: terminated_value,
            },
            PendingEntity {
                id: EntityId::new(),
                timestamp: ctx.clock.tick(),
                fingerprint: host_error_layout.layout.fingerprint,
                payload: host_error_payload,
                value: host_error_value,
            },
        ];
        (events, extra)
    } else {
        (Vec::new(), Vec::new())
    };

    // 5. Appending.
    let command_meta =
        EntityMeta { id: command_id, timestamp: command_ts, fingerprint: command_layout.layout.fingerprint };

    let mut tx = ctx.journal.begin().await?;
    for intro in introductions.iter().chain(extra_introductions.iter()) {
        let meta = EntityMeta { id: intro.id, timestamp: intro.timestamp, fingerprint: introduced_layout.fingerprint };
        if let Err(e) = tx.introduce_layout(&intro.payload, meta, command_id, intro.introduced).await {
            tx.abort().await.ok();
            return Err(e.into());
        }
    }
    if let Err(e) = tx.append_command(&command_bytes, command_meta).await {
        tx.abort().await.ok();
        return Err(e.into());
    }
    let appended = if host_failure.is_some() { &primary_events } else { &user_events };
    for entity in appended.iter() {
        let meta = EntityMeta { id: entity.id, timestamp: entity.timestamp, fingerprint: entity.fingerprint };
        if let Err(e) = tx.append_event(&entity.payload, meta, command_id).await {
            tx.abort().await.ok();
            return Err(e.into());
        }
    }
    if host_failure.is_none() {
        for causality in causality_events.iter() {
            let meta =
                EntityMeta { id: causality.id, timestamp: causality.timestamp, fingerprint: causality.fingerprint };
            if let Err(e) = tx.append_event(&causality.payload, meta, command_id).await {
                tx.abort().await.ok();
                return Err(e.into());
            }
        }
    }
    tx.commit().await?;

    // 6. Indexing. Locks are still held. "Appended entity" spans the command,
    // its events and their causality links alike — everything step 5 put in
    // the journal.
    let all_appended: Vec<&PendingEntity> =
        appended.iter().chain(if host_failure.is_none() { causality_events.iter() } else { [].iter() }).collect();

    ctx.index
        .add_to_collection(
            command_layout.layout.fingerprint,
            IndexedEntity { id: command_id, timestamp: command_ts, value: command_value },
        )
        .await;
    for entity in &all_appended {
        ctx.index
            .add_to_collection(
                entity.fingerprint,
                IndexedEntity { id: entity.id, timestamp: entity.timestamp, value: entity.value.clone() },
            )
            .await;
    }

    // 7. Notifying.
    let mut notified = Vec::with_capacity(1 + all_appended.len());
    notified.push(NotifiedEntity { id: command_id, fingerprint: command_layout.layout.fingerprint, timestamp: command_ts });
    for entity in &all_appended {
        notified.push(NotifiedEntity { id: entity.id, fingerprint: entity.fingerprint, timestamp: entity.timestamp });
    }
    ctx.subscribers.notify(&notified).await;

    // 8. Release (guards drop here) and resolve.
    drop(guards);

    match host_failure {
        Some(detail) => Err(ConsumerError::HostError(detail)),
        None => Ok(output.expect("finish() ran to completion on the non-failure path")),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "command execution panicked with a non-string payload".to_string()
    }
}
