use std::sync::Arc;

use server_api::ApiContext;

use crate::{
    auth::AuthKeys,
    registry::{PresenceDirectory, RoomRegistry, SessionRegistry},
};

/// Everything a request handler needs, cloned per handler invocation.
/// The registries are process-local; the durable store is behind the
/// api context's pool.
#[derive(Clone)]
pub struct AppState {
    pub api: ApiContext,
    pub auth: Arc<AuthKeys>,
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<PresenceDirectory>,
    pub rooms: Arc<RoomRegistry>,
}
