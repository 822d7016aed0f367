use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use super::{GuildSession, SessionRef, SessionSettings, VoiceConnection};

/// Process-wide guild id -> session table. The only place sessions are created.
pub struct SessionRegistry {
    settings: SessionSettings,
    sessions: Mutex<HashMap<u64, SessionRef>>,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> Self {
        SessionRegistry {
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, guild_id: u64) -> SessionRef {
        let mut sessions = self.sessions.lock().await;

        sessions
            .entry(guild_id)
            .or_insert_with(|| {
                info!("Creating session for guild {guild_id}");
                Arc::new(Mutex::new(GuildSession::new(guild_id, self.settings)))
            })
            .clone()
    }

    pub async fn get(&self, guild_id: u64) -> Option<SessionRef> {
        self.sessions.lock().await.get(&guild_id).cloned()
    }

    /// Detaches and closes the session. Returns the voice connection it held, if any.
    pub async fn remove(&self, guild_id: u64) -> Option<VoiceConnection> {
        let session = self.sessions.lock().await.remove(&guild_id)?;

        let connection = session.lock().await.close();
        connection
    }

    pub async fn guild_ids(&self) -> Vec<u64> {
        self.sessions.lock().await.keys().copied().collect()
    }
}
