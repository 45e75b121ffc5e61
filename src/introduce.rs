//! The `IntroduceEntityLayouts` bootstrap command (§4.8): published once on
//! `start`, and again whenever a type is registered while `Running`.
//!
//! Unlike a user [`aeon_types::Command`], this one never goes through
//! `CommandConsumer::publish` — it has no generic event type, and its event
//! (`EntityLayoutIntroduced`) is the same built-in every other command's
//! layout-check step already emits. Instead the facade appends it directly
//! through the journal, reusing the same introduce-then-append-then-index-
//! then-notify shape as `aeon_consumer::pipeline::run_pipeline`'s layout
//! check.

use std::sync::Arc;

use aeon_bus::{NotifiedEntity, SubscriberRegistry};
use aeon_clock::HybridClock;
use aeon_codec::encode_entity;
use aeon_index::{IndexEngine, IndexedEntity};
use aeon_layout::{EntityDescriptor, FieldType, Layout, LayoutCache, LayoutError, LayoutValue, Value};
use aeon_store_core::{EntityMeta, Journal};
use aeon_types::{EntityId, EntityLayoutIntroduced};

use crate::RepositoryError;

/// The bootstrap command itself: announces the set of command/event type
/// names this repository instance currently knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct IntroduceEntityLayouts {
    /// Stable names of every registered command/event type at the time this
    /// was published.
    pub type_names: Vec<String>,
}

impl LayoutValue for IntroduceEntityLayouts {
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("IntroduceEntityLayouts", vec![("type_names", FieldType::List(Box::new(FieldType::Str)))])
    }

    fn to_value(&self) -> Value {
        Value::Layout(vec![(
            "type_names".to_string(),
            Value::List(self.type_names.iter().cloned().map(Value::Str).collect()),
        )])
    }

    fn from_value(value: Value) -> Result<Self, LayoutError> {
        let mut fields = value
            .into_fields()
            .ok_or_else(|| LayoutError::MalformedSchema("expected layout-shaped value".into()))?;
        let type_names = match aeon_layout::take_field(&mut fields, "type_names")? {
            Value::List(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s),
                    other => Err(LayoutError::MalformedSchema(format!("expected str, got {other:?}"))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => return Err(LayoutError::MalformedSchema(format!("expected list, got {other:?}"))),
        };
        Ok(IntroduceEntityLayouts { type_names })
    }
}

/// Shared infrastructure [`publish_introduce_entity_layouts`] needs, a
/// narrow subset of what [`crate::Repository`] holds — kept as plain
/// arguments rather than a borrow of `Repository` so this stays callable
/// from both `start()` (before the repository is fully "up") and later
/// incremental registrations.
pub(crate) struct IntroductionContext<'a> {
    pub(crate) clock: &'a Arc<HybridClock>,
    pub(crate) journal: &'a Arc<dyn Journal>,
    pub(crate) layouts: &'a LayoutCache,
    pub(crate) index: &'a Arc<IndexEngine>,
    pub(crate) subscribers: &'a Arc<SubscriberRegistry>,
}

/// Publish one `IntroduceEntityLayouts(type_names)` command, appending an
/// `EntityLayoutIntroduced` for every descriptor not already known. A no-op
/// beyond the command itself when `descriptors` contains nothing new.
pub(crate) async fn publish_introduce_entity_layouts(
    ctx: &IntroductionContext<'_>,
    type_names: Vec<String>,
    descriptors: &[EntityDescriptor],
) -> Result<(), RepositoryError> {
    // A layout derived for the first time in this process's cache may
    // already carry an `EntityLayoutIntroduced` in the journal from a
    // prior run over the same storage (restart) — only fingerprints
    // missing from there actually need a fresh introduction.
    let already_introduced = ctx.journal.known_fingerprints().await?;
    let introduced_layout = ctx.layouts.get_or_derive(&EntityLayoutIntroduced::descriptor())?.0;
    let (command_layout, command_layout_novel) =
        ctx.layouts.get_or_derive(&IntroduceEntityLayouts::descriptor())?;

    let mut novel: Vec<Layout> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    if command_layout_novel
        && seen.insert(command_layout.fingerprint)
        && !already_introduced.contains(&command_layout.fingerprint)
    {
        novel.push(command_layout.clone());
    }
    for descriptor in descriptors {
        let (layout, is_novel) = ctx.layouts.get_or_derive(descriptor)?;
        if is_novel && seen.insert(layout.fingerprint) && !already_introduced.contains(&layout.fingerprint) {
            novel.push(layout);
        }
    }

    let command_id = EntityId::new();
    let command_ts = ctx.clock.tick();
    let command = IntroduceEntityLayouts { type_names };
    let command_value = command.to_value();
    let command_bytes = encode_entity(&command_value, &command_layout, ctx.layouts)?;
    let command_meta = EntityMeta { id: command_id, timestamp: command_ts, fingerprint: command_layout.fingerprint };

    struct Introduction {
        id: EntityId,
        timestamp: aeon_types::HybridTimestamp,
        payload: Vec<u8>,
        fingerprint: aeon_types::LayoutFingerprint,
        value: Value,
    }

    let mut introductions = Vec::with_capacity(novel.len());
    for layout in &novel {
        let id = EntityId::new();
        let timestamp = ctx.clock.tick();
        let event = EntityLayoutIntroduced { fingerprint: layout.fingerprint, schema: aeon_layout::encode_schema(layout) };
        let value = event.to_value();
        let payload = encode_entity(&value, &introduced_layout, ctx.layouts)?;
        introductions.push(Introduction { id, timestamp, payload, fingerprint: layout.fingerprint, value });
    }

    let mut tx = ctx.journal.begin().await?;
    for intro in &introductions {
        let meta = EntityMeta { id: intro.id, timestamp: intro.timestamp, fingerprint: introduced_layout.fingerprint };
        if let Err(e) = tx.introduce_layout(&intro.payload, meta, command_id, intro.fingerprint).await {
            tx.abort().await.ok();
            return Err(e.into());
        }
    }
    if let Err(e) = tx.append_command(&command_bytes, command_meta).await {
        tx.abort().await.ok();
        return Err(e.into());
    }
    tx.commit().await?;

    ctx.index
        .add_to_collection(command_layout.fingerprint, IndexedEntity { id: command_id, timestamp: command_ts, value: command_value })
        .await;
    for intro in &introductions {
        ctx.index
            .add_to_collection(introduced_layout.fingerprint, IndexedEntity { id: intro.id, timestamp: intro.timestamp, value: intro.value.clone() })
            .await;
    }

    let mut notified = Vec::with_capacity(1 + introductions.len());
    notified.push(NotifiedEntity { id: command_id, fingerprint: command_layout.fingerprint, timestamp: command_ts });
    for intro in &introductions {
        notified.push(NotifiedEntity { id: intro.id, fingerprint: introduced_layout.fingerprint, timestamp: intro.timestamp });
    }
    ctx.subscribers.notify(&notified).await;

    Ok(())
}
