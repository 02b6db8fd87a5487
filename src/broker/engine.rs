//! Broker engine
//!
//! This module holds the routing state of the broker:
//! - the connected clients and the channels feeding their writer tasks
//! - the route table binding topic expressions to subscribers
//! - handling of the `_ROUTER.` control topics (HELLO, SUBSCRIBE)
//!
//! The API is synchronous and meant to sit behind `Arc<Mutex<Broker>>` in the
//! transport layer. Forwarding only tries to push onto each client's bounded
//! outbound queue, so the lock is never held across socket I/O.

use std::collections::HashMap;

use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::broker::client::ConnectedClient;
use crate::broker::route::{ClientId, Route, RouteAction, RouteTable};
use crate::config::BrokerSettings;
use crate::document::Document;
use crate::transport::frame::Frame;
use crate::transport::header::validate_topic;
use crate::utils::error::{Error, Result};

pub const CONTROL_PREFIX: &str = "_ROUTER.";
pub const CONTROL_EXPRESSION: &str = "_ROUTER.>";
pub const HELLO_TOPIC: &str = "_ROUTER.INBOX.HELLO";
pub const SUBSCRIBE_TOPIC: &str = "_ROUTER.INBOX.SUBSCRIBE";
/// Subscription id of the inbox route registered on HELLO.
pub const INBOX_SUBSCRIPTION_ID: u32 = 0;

const DEBUG_ROUTE_EXPRESSION: &str = ">";

#[derive(Debug)]
pub struct Broker {
    settings: BrokerSettings,
    routes: RouteTable,
    clients: HashMap<ClientId, ConnectedClient>,
    next_client_id: ClientId,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// Creates a broker with its built-in control route and, when enabled,
    /// the catch-all debug route.
    pub fn new(settings: BrokerSettings) -> Self {
        // built-ins count against the capacity like any other route
        let mut routes = RouteTable::new(settings.max_routes.max(2));
        let _ = routes.add(Route::builtin(CONTROL_EXPRESSION, RouteAction::Control));
        if settings.debug_route {
            let _ = routes.add(Route::builtin(DEBUG_ROUTE_EXPRESSION, RouteAction::Print));
        }
        Self {
            settings,
            routes,
            clients: HashMap::new(),
            next_client_id: 1,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Registers a newly accepted connection.
    ///
    /// Fails with `ResourceExhausted` once `max_connections` clients are
    /// connected.
    pub fn register_client(
        &mut self,
        peer: &str,
        sender: Sender<Frame>,
    ) -> Result<ClientId> {
        if self.clients.len() >= self.settings.max_connections {
            return Err(Error::ResourceExhausted(format!(
                "no free client slots ({} connected)",
                self.clients.len()
            )));
        }
        let id = self.next_client_id;
        self.next_client_id += 1;
        let client = ConnectedClient::new(id, peer, sender);
        info!(client = %client.ident, "client connected");
        self.clients.insert(id, client);
        Ok(id)
    }

    /// Removes a client and every route it owns. Safe to call twice.
    pub fn cleanup_client(&mut self, id: ClientId) {
        let removed = self.routes.remove_client(id);
        if let Some(client) = self.clients.remove(&id) {
            info!(client = %client.ident, routes = removed, "cleaned up client");
        }
    }

    /// Routes one inbound frame from `sender` to every matching route.
    pub fn route_frame(&mut self, sender: ClientId, frame: &Frame) {
        // snapshot: control handling may add routes while we iterate
        let matched: Vec<Route> = self.routes.matching(frame.topic()).cloned().collect();
        if matched.is_empty() {
            debug!(topic = %frame.topic(), "no route for message");
            return;
        }

        let mut dead = Vec::new();
        for route in matched {
            match route.action {
                RouteAction::Control => self.on_control(sender, frame),
                RouteAction::Print => self.print(sender, frame),
                RouteAction::Forward => {
                    let Some(owner) = route.owner else { continue };
                    if dead.contains(&owner) {
                        continue;
                    }
                    if !self.forward(owner, route.subscription_id, frame) {
                        dead.push(owner);
                    }
                }
            }
        }

        for owner in dead {
            let removed = self.routes.remove_client(owner);
            warn!(
                client = %self.ident(owner),
                routes = removed,
                "subscriber gone, purged its routes"
            );
        }
    }

    fn forward(&self, owner: ClientId, subscription_id: u32, frame: &Frame) -> bool {
        let Some(client) = self.clients.get(&owner) else {
            return false;
        };
        let mut header = frame.header.clone();
        header.control_data = subscription_id;
        client.send(Frame {
            header,
            payload: frame.payload.clone(),
        })
    }

    fn print(&self, sender: ClientId, frame: &Frame) {
        info!(
            target: "popbus::debug_route",
            from = %self.ident(sender),
            topic = %frame.topic(),
            flags = %frame.header.flags,
            payload = %String::from_utf8_lossy(&frame.payload),
            "message debug"
        );
    }

    fn on_control(&mut self, sender: ClientId, frame: &Frame) {
        let result = match frame.topic() {
            SUBSCRIBE_TOPIC => self.on_subscribe(sender, frame),
            HELLO_TOPIC => self.on_hello(sender, frame),
            other => {
                info!(topic = other, "no handler for control message");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(
                client = %self.ident(sender),
                topic = %frame.topic(),
                error = %e,
                "control message rejected"
            );
        }
    }

    fn on_subscribe(&mut self, sender: ClientId, frame: &Frame) -> Result<()> {
        let doc = frame.document()?;
        let expression = required_string(&doc, "topic")?;
        let route_id = doc
            .get_i32("route_id")
            .ok_or_else(|| Error::Decode("SUBSCRIBE without route_id".to_string()))?;
        let subscription_id = u32::try_from(route_id)
            .map_err(|_| Error::InvalidArgument(format!("negative route_id {route_id}")))?;
        self.add_route(sender, expression, subscription_id)
    }

    fn on_hello(&mut self, sender: ClientId, frame: &Frame) -> Result<()> {
        let doc = frame.document()?;
        let inbox = required_string(&doc, "inbox")?;
        self.add_route(sender, inbox, INBOX_SUBSCRIPTION_ID)?;
        if let Some(client) = self.clients.get_mut(&sender) {
            client.inbox = Some(inbox.to_string());
        }
        Ok(())
    }

    fn add_route(&mut self, owner: ClientId, expression: &str, subscription_id: u32) -> Result<()> {
        validate_topic("expression", expression)?;
        if !self.clients.contains_key(&owner) {
            return Err(Error::InvalidArgument(format!("unknown client {owner}")));
        }
        if self
            .routes
            .add(Route::forward(expression, subscription_id, owner))?
        {
            info!(
                client = %self.ident(owner),
                expression,
                subscription_id,
                "added route"
            );
        }
        Ok(())
    }

    fn ident(&self, id: ClientId) -> String {
        self.clients
            .get(&id)
            .map(|c| c.ident.clone())
            .unwrap_or_else(|| format!("?/{id}"))
    }

    pub fn client(&self, id: ClientId) -> Option<&ConnectedClient> {
        self.clients.get(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

fn required_string<'a>(doc: &'a Document, field: &str) -> Result<&'a str> {
    doc.get_string(field)
        .ok_or_else(|| Error::Decode(format!("control message without '{field}'")))
}
