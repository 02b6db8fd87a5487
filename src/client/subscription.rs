use std::fmt;

use crate::transport::frame::Frame;
use crate::utils::error::{Error, Result};

/// Callback invoked with every frame delivered to a subscription.
pub type MessageCallback = Box<dyn FnMut(&Frame) + Send>;

pub struct Subscription {
    pub id: u32,
    pub expression: String,
    callback: MessageCallback,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

/// The subscriptions of one connection, keyed by the id the broker echoes
/// back in `control_data`.
///
/// Ids start at 1 and are never reused; 0 belongs to the connection's inbox.
#[derive(Debug)]
pub struct SubscriptionTable {
    entries: Vec<Subscription>,
    capacity: usize,
    next_id: u32,
}

impl SubscriptionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            next_id: 1,
        }
    }

    pub fn insert(&mut self, expression: &str, callback: MessageCallback) -> Result<u32> {
        if self.entries.len() >= self.capacity {
            return Err(Error::ResourceExhausted(format!(
                "subscription table full ({} entries)",
                self.capacity
            )));
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.entries.push(Subscription {
            id,
            expression: expression.to_string(),
            callback,
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.id != id);
        before != self.entries.len()
    }

    /// Hands `frame` to the subscription named by its `control_data`.
    /// Returns false when no subscription has that id.
    pub fn dispatch(&mut self, frame: &Frame) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|s| s.id == frame.header.control_data)
        {
            Some(subscription) => {
                (subscription.callback)(frame);
                true
            }
            None => false,
        }
    }

    /// `(id, expression)` of every subscription, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.entries.iter().map(|s| (s.id, s.expression.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
