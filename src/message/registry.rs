//! Message type registry and topic resolver.
//!
//! Every message type a process can send or receive is declared once at
//! startup, together with its place in the hierarchy. `build` walks the
//! declared edges a single time and stores, per concrete tag, the ordered
//! routable-type list and a ready-made conversion into each ancestor, so the
//! hot paths (publish fan-out, delivery matching) are plain map lookups.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{AnyMessage, Message};
use crate::utils::error::RegistryError;

type Erased = dyn Any + Send + Sync;
type EncodeFn = fn(&Erased) -> Option<Result<Vec<u8>, serde_json::Error>>;
type DecodeFn = fn(&[u8]) -> Result<Arc<Erased>, serde_json::Error>;
type UpcastFn = Arc<dyn Fn(&Erased) -> Option<Box<Erased>> + Send + Sync>;

#[derive(Clone, Copy)]
struct Codecs {
    encode: EncodeFn,
    decode: DecodeFn,
}

struct Edge {
    parent: &'static str,
    upcast: UpcastFn,
}

struct TypeEntry {
    codecs: Codecs,
    /// Self first, then ancestors breadth-first.
    routable: Vec<&'static str>,
    upcasts: HashMap<&'static str, UpcastFn>,
}

fn encode_as<M: Message>(value: &Erased) -> Option<Result<Vec<u8>, serde_json::Error>> {
    value.downcast_ref::<M>().map(serde_json::to_vec)
}

fn decode_as<M: Message>(payload: &[u8]) -> Result<Arc<Erased>, serde_json::Error> {
    let message: M = serde_json::from_slice(payload)?;
    Ok(Arc::new(message))
}

fn identity<M: Message>() -> UpcastFn {
    Arc::new(|value: &Erased| {
        value
            .downcast_ref::<M>()
            .cloned()
            .map(|message| Box::new(message) as Box<Erased>)
    })
}

fn compose(first: Option<UpcastFn>, second: UpcastFn) -> UpcastFn {
    match first {
        None => second,
        Some(first) => Arc::new(move |value: &Erased| {
            let intermediate = first(value)?;
            second(&*intermediate)
        }),
    }
}

/// Collects message types and subtype edges before freezing them.
#[derive(Default)]
pub struct MessageRegistryBuilder {
    types: HashMap<&'static str, (Codecs, UpcastFn)>,
    parents: HashMap<&'static str, Vec<Edge>>,
}

impl MessageRegistryBuilder {
    /// Declares a message type. Registering the same type twice is harmless.
    pub fn register<M: Message>(mut self) -> Self {
        self.types.entry(M::TAG).or_insert_with(|| {
            (
                Codecs {
                    encode: encode_as::<M>,
                    decode: decode_as::<M>,
                },
                identity::<M>(),
            )
        });
        self
    }

    /// Declares `S` as a subtype of `P`: messages of type `S` are also
    /// delivered to subscribers of `P`, converted with `P::from`.
    pub fn register_subtype<S, P>(self) -> Self
    where
        S: Message,
        P: Message + From<S>,
    {
        let mut builder = self.register::<S>().register::<P>();
        let edges = builder.parents.entry(S::TAG).or_default();
        if !edges.iter().any(|edge| edge.parent == P::TAG) {
            edges.push(Edge {
                parent: P::TAG,
                upcast: Arc::new(|value: &Erased| {
                    value
                        .downcast_ref::<S>()
                        .cloned()
                        .map(|message| Box::new(P::from(message)) as Box<Erased>)
                }),
            });
        }
        builder
    }

    /// Precomputes routable types and ancestor conversions for every tag.
    pub fn build(self) -> Result<MessageRegistry, RegistryError> {
        let mut entries = HashMap::with_capacity(self.types.len());

        for (&tag, (codecs, identity)) in &self.types {
            let mut routable = vec![tag];
            let mut upcasts = HashMap::new();
            upcasts.insert(tag, identity.clone());

            let mut queue: VecDeque<(&'static str, Option<UpcastFn>)> = VecDeque::new();
            queue.push_back((tag, None));

            while let Some((current, to_current)) = queue.pop_front() {
                let Some(edges) = self.parents.get(current) else {
                    continue;
                };
                for edge in edges {
                    if edge.parent == tag {
                        return Err(RegistryError::Cycle(tag));
                    }
                    if upcasts.contains_key(edge.parent) {
                        continue;
                    }
                    let upcast = compose(to_current.clone(), edge.upcast.clone());
                    upcasts.insert(edge.parent, upcast.clone());
                    routable.push(edge.parent);
                    queue.push_back((edge.parent, Some(upcast)));
                }
            }

            entries.insert(
                tag,
                TypeEntry {
                    codecs: *codecs,
                    routable,
                    upcasts,
                },
            );
        }

        Ok(MessageRegistry { entries })
    }
}

/// Frozen view of every known message type.
pub struct MessageRegistry {
    entries: HashMap<&'static str, TypeEntry>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder::default()
    }

    /// Maps a tag read off the wire to the registered static tag.
    pub fn resolve(&self, tag: &str) -> Option<&'static str> {
        self.entries.get_key_value(tag).map(|(&tag, _)| tag)
    }

    /// The type itself followed by each registered ancestor. Empty for
    /// unknown tags.
    pub fn routable_types(&self, tag: &str) -> &[&'static str] {
        self.entries
            .get(tag)
            .map(|entry| entry.routable.as_slice())
            .unwrap_or_default()
    }

    /// True when a message tagged `tag` should reach subscribers of `ancestor`.
    pub fn is_subtype(&self, tag: &str, ancestor: &str) -> bool {
        self.routable_types(tag).contains(&ancestor)
    }

    /// Converts an erased message into `M`, which must be its own type or
    /// one of its registered ancestors.
    pub fn upcast<M: Message>(&self, message: &AnyMessage) -> Option<M> {
        let upcast = self.entries.get(message.tag())?.upcasts.get(M::TAG)?;
        upcast(message.value())
            .and_then(|value| value.downcast::<M>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn encode(&self, message: &AnyMessage) -> Option<Result<Vec<u8>, serde_json::Error>> {
        let entry = self.entries.get(message.tag())?;
        (entry.codecs.encode)(message.value())
    }

    pub(crate) fn decode(
        &self,
        tag: &'static str,
        payload: &[u8],
    ) -> Option<Result<AnyMessage, serde_json::Error>> {
        let entry = self.entries.get(tag)?;
        Some((entry.codecs.decode)(payload).map(|value| AnyMessage::from_parts(tag, value)))
    }
}
