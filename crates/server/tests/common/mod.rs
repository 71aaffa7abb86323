#![allow(dead_code)]

use messaging_server::config::{AppState, MessagingConfig};
use messaging_server::directory::StaticDirectory;
use messaging_server::models::UserProfile;
use messaging_server::store::JsonMessageStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub async fn test_state() -> (TempDir, AppState) {
    let dir = TempDir::new().unwrap();
    let mut config = MessagingConfig::with_base_dir(dir.path());
    config.push_timeout = Duration::from_millis(200);
    config.ensure_dirs().await.unwrap();

    let store = Arc::new(JsonMessageStore::new(&config).await.unwrap());
    let directory = Arc::new(
        StaticDirectory::new()
            .with_user(profile("u1", "alice"))
            .with_user(profile("u2", "bob"))
            .with_token("token-u1", "u1")
            .with_token("token-u2", "u2")
            .with_token("token-u3", "u3"),
    );

    let state = AppState::new(config, store, directory.clone(), directory);
    (dir, state)
}

pub fn profile(id: &str, username: &str) -> UserProfile {
    UserProfile {
        id: id.into(),
        username: username.into(),
        avatar_url: None,
    }
}
