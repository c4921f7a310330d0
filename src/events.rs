//! User lifecycle events
//!
//! Users are created and removed by events published on two topics,
//! `create-user` and `delete-user`, each carrying `{"id": <int>}`. The
//! handler is transport-agnostic; the HTTP gateway feeds it through
//! `POST /events/:topic`.

use crate::common::{Error, PublicError};
use crate::domain::UserId;
use crate::service::UsersService;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const CREATE_USER_TOPIC: &str = "create-user";
pub const DELETE_USER_TOPIC: &str = "delete-user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UserEvent {
    pub id: UserId,
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Topic this handler does not know about
    Ignored,
}

pub struct UserEventHandler {
    users: Arc<UsersService>,
}

impl UserEventHandler {
    pub fn new(users: Arc<UsersService>) -> Self {
        Self { users }
    }

    pub async fn handle(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> std::result::Result<EventOutcome, PublicError> {
        debug!(topic, bytes = payload.len(), "user event received");

        match topic {
            CREATE_USER_TOPIC => {
                let event = decode(topic, payload)?;
                self.users.create_user(event.id).await.map_err(|err| {
                    error!(topic, user = event.id, error = %err, "failed to create user");
                    err
                })?;
            }
            DELETE_USER_TOPIC => {
                let event = decode(topic, payload)?;
                self.users.delete_user(event.id).await.map_err(|err| {
                    error!(topic, user = event.id, error = %err, "failed to delete user");
                    err
                })?;
            }
            other => {
                warn!(topic = other, "unhandled topic");
                return Ok(EventOutcome::Ignored);
            }
        }
        Ok(EventOutcome::Applied)
    }
}

fn decode(topic: &str, payload: &[u8]) -> std::result::Result<UserEvent, PublicError> {
    serde_json::from_slice(payload).map_err(|e| {
        error!(topic, error = %e, "failed to parse user event");
        PublicError::from(Error::InvalidArgument(format!("malformed {} event", topic)))
    })
}
