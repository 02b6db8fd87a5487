use tracing::debug;

use crate::broker::topic::is_topic_match;
use crate::utils::error::{Error, Result};

pub type ClientId = u64;

/// What the broker does with a frame that matches a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Send to the owning client, tagged with the subscription id
    Forward,
    /// Handle as a broker control message
    Control,
    /// Log the frame (debug catch-all)
    Print,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub expression: String,
    pub subscription_id: u32,
    /// `None` for the broker's built-in routes
    pub owner: Option<ClientId>,
    pub action: RouteAction,
}

impl Route {
    pub fn forward(expression: impl Into<String>, subscription_id: u32, owner: ClientId) -> Self {
        Self {
            expression: expression.into(),
            subscription_id,
            owner: Some(owner),
            action: RouteAction::Forward,
        }
    }

    pub fn builtin(expression: impl Into<String>, action: RouteAction) -> Self {
        Self {
            expression: expression.into(),
            subscription_id: 0,
            owner: None,
            action,
        }
    }
}

/// Capacity-bounded, insertion-ordered set of routes.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Vec::new(),
            capacity,
        }
    }

    /// Adds a route. Re-adding an identical route is a no-op and returns
    /// `Ok(false)`, which makes subscription replay after a reconnect safe.
    pub fn add(&mut self, route: Route) -> Result<bool> {
        if self.routes.contains(&route) {
            debug!(expression = %route.expression, "route already present");
            return Ok(false);
        }
        if self.routes.len() >= self.capacity {
            return Err(Error::ResourceExhausted(format!(
                "route table full ({} routes)",
                self.capacity
            )));
        }
        self.routes.push(route);
        Ok(true)
    }

    /// Drops every route owned by `owner`, returning how many were removed.
    pub fn remove_client(&mut self, owner: ClientId) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.owner != Some(owner));
        before - self.routes.len()
    }

    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Route> + 'a {
        self.routes
            .iter()
            .filter(move |r| is_topic_match(topic, &r.expression))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
