use std::collections::HashSet;

pub type ConsumerTag = String;

/// A named broker destination and the consumers bound to it.
///
/// Every bound consumer receives its own copy of each message published to
/// the destination.
#[derive(Debug, Default)]
pub struct Destination {
    pub name: String,
    pub consumers: HashSet<ConsumerTag>,
}

impl Destination {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            consumers: HashSet::new(),
        }
    }

    /// Binding the same consumer twice has no effect.
    pub fn bind(&mut self, tag: ConsumerTag) {
        self.consumers.insert(tag);
    }

    pub fn unbind(&mut self, tag: &str) {
        self.consumers.remove(tag);
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
