//! Handlers for inbound requests.
//!
//! Each handler records the sender as a contact before answering, so a node
//! learns about everyone who talks to it.

use tracing::{debug, trace};

use crate::{
    message::{Body, FindValueReply, Message},
    node::KademliaNode,
    K_VALUE,
};

impl KademliaNode {
    /// Runs the handler for `msg`, returning the reply to send back, if any.
    pub async fn handle_message(&self, msg: Message) -> Option<Message> {
        let sender = msg.sender;
        if self.config().logging_enabled() {
            debug!(kind = ?msg.kind(), id = ?msg.id, "Received message from {sender}");
        }

        let body = match &msg.body {
            Body::Ping { pong: false } => {
                self.add_contact(sender).await;
                Body::Ping { pong: true }
            }
            Body::Ping { pong: true } => {
                // A reply outside of a call we made, still proof the sender is alive.
                self.add_contact(sender).await;
                return None;
            }
            Body::Store {
                key,
                data,
                expiration_time,
                replication_interval,
            } => {
                self.add_contact(sender).await;
                // No reply, so the caller does not count the record as stored.
                if let Err(e) = self
                    .store_local(*key, data.clone(), *expiration_time, *replication_interval)
                    .await
                {
                    debug!(%key, "Rejected record from {sender}: {e}");
                    return None;
                }

                Body::StoreReply {
                    closest: self.closest_to(key, K_VALUE).await,
                }
            }
            Body::FindNode { target } => {
                self.add_contact(sender).await;
                Body::FindNodeReply {
                    closest: self.closest_to(target, K_VALUE).await,
                }
            }
            Body::FindValue { key } => {
                self.add_contact(sender).await;
                let reply = match self.get_local(key).await {
                    Ok(value) => FindValueReply::Value(value),
                    Err(_) => FindValueReply::Nodes(self.closest_to(key, K_VALUE).await),
                };
                Body::FindValueReply(reply)
            }
            Body::StoreReply { .. } | Body::FindNodeReply { .. } | Body::FindValueReply(_) => {
                trace!(kind = ?msg.kind(), "Dropping unsolicited reply from {sender}");
                return None;
            }
        };

        Some(msg.reply(self.local(), body))
    }
}
