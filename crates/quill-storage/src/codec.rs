//! Typed event layer
//!
//! Maps Rust types onto the opaque documents the engine stores. Each type
//! declares a stable tag which is written into the record metadata; reading
//! resolves the tag through an explicit [`TypeRegistry`].

use crate::backing::{BackingStore, FileStore};
use crate::engine::Engine;
use crate::pending::PendingWrite;
use quill_common::{Document, Error, RecordState, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;

/// Metadata key holding the type tag
pub const TYPE_TAG_KEY: &str = "type";

/// A payload type that can be stored in a stream
pub trait EventType: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier written next to every stored value
    const TYPE_TAG: &'static str;
}

/// Decoded value of some registered [`EventType`]
pub type AnyEvent = Box<dyn Any + Send>;

type DecodeFn = fn(Value) -> Result<AnyEvent>;

fn decode_as<T: EventType>(value: Value) -> Result<AnyEvent> {
    serde_json::from_value::<T>(value)
        .map(|v| Box::new(v) as AnyEvent)
        .map_err(|e| Error::Deserialization(format!("{}: {}", T::TYPE_TAG, e)))
}

/// Tag to decoder lookup
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: EventType>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE_TAG, decode_as::<T>);
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Serialize `value`; it must map to a JSON object
    pub fn encode<T: EventType>(&self, value: &T) -> Result<Document> {
        match serde_json::to_value(value) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(other) => Err(Error::Serialization(format!(
                "{} serialized to {}, expected an object",
                T::TYPE_TAG,
                json_kind(&other)
            ))),
            Err(e) => Err(Error::Serialization(format!("{}: {}", T::TYPE_TAG, e))),
        }
    }

    pub fn decode(&self, document: &Document, tag: &str) -> Result<AnyEvent> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| Error::UnknownType(tag.to_string()))?;
        decode(Value::Object(document.clone()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Typed front end over an [`Engine`]
pub struct Journal<S: BackingStore = FileStore> {
    engine: Engine<S>,
    registry: TypeRegistry,
}

impl<S: BackingStore> Journal<S> {
    pub fn new(engine: Engine<S>, registry: TypeRegistry) -> Self {
        Self { engine, registry }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn append_event<T: EventType>(&self, stream_id: &str, event: &T) -> Result<PendingWrite> {
        self.append(stream_id, RecordState::Event, event)
    }

    /// Store materialised state; [`Journal::read_decoded`] can stop here
    pub fn append_snapshot<T: EventType>(&self, stream_id: &str, snapshot: &T) -> Result<PendingWrite> {
        self.append(stream_id, RecordState::Snapshot, snapshot)
    }

    pub fn delete_stream(&self, stream_id: &str) -> Result<PendingWrite> {
        self.engine
            .enqueue(stream_id, RecordState::Delete, Document::new(), Document::new())
    }

    fn append<T: EventType>(&self, stream_id: &str, state: RecordState, value: &T) -> Result<PendingWrite> {
        let payload = self.registry.encode(value)?;
        let mut metadata = Document::new();
        metadata.insert(TYPE_TAG_KEY.into(), Value::String(T::TYPE_TAG.into()));
        self.engine.enqueue(stream_id, state, metadata, payload)
    }

    /// Decoded values of `stream_id`, newest first. With
    /// `until_last_snapshot` the walk ends at the newest snapshot, which is
    /// included.
    pub fn read_decoded(&self, stream_id: &str, until_last_snapshot: bool) -> Result<Vec<AnyEvent>> {
        let Some(reader) = self.engine.read(stream_id)? else {
            return Ok(Vec::new());
        };

        let mut values = Vec::new();
        for record in reader {
            let record = record?;
            let tag = record
                .metadata
                .get(TYPE_TAG_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::Deserialization(format!(
                        "record in stream {} carries no type tag",
                        record.stream_id
                    ))
                })?;
            values.push(self.registry.decode(&record.payload, tag)?);

            if until_last_snapshot && record.state == RecordState::Snapshot {
                break;
            }
        }
        Ok(values)
    }
}
