//! Bootstrap data for single-node deployments.
//!
//! Registration and chat creation belong to external services; a lone
//! gateway can instead be seeded from the environment:
//!
//! ```text
//! PARLEY_SEED_SESSIONS="tok-a=alice,tok-b=bob"
//! PARLEY_SEED_CHATS="c1=alice+bob"
//! ```

use parley_gateway::error::{ChatError, StoreError};
use parley_gateway::gateway::Gateway;
use parley_gateway::model::{Chat, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeedError {
    #[error("malformed {what} entry {entry:?}, expected {expected}")]
    Malformed {
        what: &'static str,
        entry: String,
        expected: &'static str,
    },
}

fn entries(spec: &str) -> impl Iterator<Item = &str> {
    spec.split(',').map(str::trim).filter(|e| !e.is_empty())
}

/// Parse `token=user[,token=user]`.
pub fn parse_sessions(spec: &str) -> Result<Vec<(String, UserId)>, SeedError> {
    entries(spec)
        .map(|entry| match entry.split_once('=') {
            Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                Ok((token.trim().to_string(), UserId::new(user.trim())))
            }
            _ => Err(SeedError::Malformed {
                what: "session",
                entry: entry.to_string(),
                expected: "token=user",
            }),
        })
        .collect()
}

/// Parse `chat=userA+userB[,…]`.
pub fn parse_chats(spec: &str) -> Result<Vec<Chat>, SeedError> {
    entries(spec)
        .map(|entry| {
            let malformed = || SeedError::Malformed {
                what: "chat",
                entry: entry.to_string(),
                expected: "chat=userA+userB",
            };
            let (id, pair) = entry.split_once('=').ok_or_else(malformed)?;
            let (a, b) = pair.split_once('+').ok_or_else(malformed)?;
            let (id, a, b) = (id.trim(), a.trim(), b.trim());
            if id.is_empty() || a.is_empty() || b.is_empty() || a == b {
                return Err(malformed());
            }
            Ok(Chat::direct(id, a, b))
        })
        .collect()
}

/// Apply both seeds. Chats that already exist are left alone so a node
/// with persistent storage can restart with the same environment.
pub async fn apply(gateway: &Gateway, sessions: Vec<(String, UserId)>, chats: Vec<Chat>) -> Result<(usize, usize), ChatError> {
    let mut seeded_sessions = 0;
    if let Some(store) = gateway.sessions() {
        for (token, user) in sessions {
            store.insert(token, user, "seed", None).await;
            seeded_sessions += 1;
        }
    } else if !sessions.is_empty() {
        log::warn!("Seed: ignoring {} sessions, gateway uses an external authenticator", sessions.len());
    }

    let mut seeded_chats = 0;
    for chat in chats {
        let id = chat.id.clone();
        match gateway.create_chat(chat).await {
            Ok(_) => seeded_chats += 1,
            Err(ChatError::Store(StoreError::Conflict(_))) => log::debug!("Seed: chat {id} already exists"),
            Err(e) => return Err(e),
        }
    }
    Ok((seeded_sessions, seeded_chats))
}
