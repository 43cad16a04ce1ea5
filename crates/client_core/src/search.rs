//! Debounced user-directory search. Only the latest query may publish
//! results; anything superseded while waiting or in flight is discarded.

use std::{sync::Arc, time::Duration};

use shared::domain::{User, UserId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{api::ChatApi, ClientEvent};

#[derive(Debug, Default)]
struct SearchState {
    generation: u64,
    query: String,
    results: Vec<User>,
    searching: bool,
}

#[derive(Clone)]
pub struct DirectorySearch {
    api: Arc<dyn ChatApi>,
    token: String,
    local_user: UserId,
    quiet_period: Duration,
    state: Arc<Mutex<SearchState>>,
    events: broadcast::Sender<ClientEvent>,
}

impl DirectorySearch {
    pub fn new(
        api: Arc<dyn ChatApi>,
        token: impl Into<String>,
        local_user: UserId,
        quiet_period: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            token: token.into(),
            local_user,
            quiet_period,
            state: Arc::new(Mutex::new(SearchState::default())),
            events,
        }
    }

    /// Records a new query. A blank query clears the results immediately;
    /// anything else is searched once the quiet period passes without a
    /// newer query.
    pub async fn update_query(&self, query: &str) {
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.query = query.to_string();
            if query.trim().is_empty() {
                state.results.clear();
                state.searching = false;
                let _ = self.events.send(ClientEvent::SearchResults {
                    query: query.to_string(),
                    users: Vec::new(),
                });
                return;
            }
            state.searching = true;
            state.generation
        };

        let search = self.clone();
        let query = query.to_string();
        tokio::spawn(async move {
            search.run(generation, query).await;
        });
    }

    async fn run(self, generation: u64, query: String) {
        tokio::time::sleep(self.quiet_period).await;
        if self.state.lock().await.generation != generation {
            debug!(%query, "search: superseded before request");
            return;
        }

        let result = self.api.search_users(&self.token, query.trim()).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(%query, "search: discarding stale response");
            return;
        }
        state.searching = false;
        match result {
            Ok(users) => {
                let users: Vec<User> = users
                    .into_iter()
                    .filter(|user| user.id != self.local_user)
                    .collect();
                debug!(%query, count = users.len(), "search: results ready");
                state.results = users.clone();
                let _ = self.events.send(ClientEvent::SearchResults { query, users });
            }
            Err(err) => {
                warn!(%query, %err, "search: request failed");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
            }
        }
    }

    pub async fn query(&self) -> String {
        self.state.lock().await.query.clone()
    }

    pub async fn results(&self) -> Vec<User> {
        self.state.lock().await.results.clone()
    }

    pub async fn is_searching(&self) -> bool {
        self.state.lock().await.searching
    }

    pub async fn clear(&self) {
        self.update_query("").await;
    }

    /// Drops the query and results and cancels any pending search without
    /// publishing anything.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        state.query.clear();
        state.results.clear();
        state.searching = false;
    }
}

#[cfg(test)]
#[path = "tests/search_tests.rs"]
mod tests;
