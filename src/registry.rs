//! Instance registry: the single source of truth for which instances this
//! node currently knows about.
//!
//! Invariant I1 (`spec.md` §4.S): exactly one `Client` per live
//! `instance_id`. Readers take a shared lock; `insert`/`remove` take the
//! exclusive lock, so a `Create` in flight never races a concurrent `List`.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::types::Client;

#[derive(Default)]
pub struct Registry {
    instances: RwLock<HashMap<String, Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, client: Client) {
        self.instances
            .write()
            .await
            .insert(client.instance_id.clone(), client);
    }

    pub async fn remove(&self, instance_id: &str) -> Option<Client> {
        self.instances.write().await.remove(instance_id)
    }

    pub async fn get(&self, instance_id: &str) -> Option<Client> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn contains(&self, instance_id: &str) -> bool {
        self.instances.read().await.contains_key(instance_id)
    }

    pub async fn list_ids(&self) -> std::collections::HashSet<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn list(&self) -> Vec<Client> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn update<F>(&self, instance_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Client),
    {
        let mut instances = self.instances.write().await;
        match instances.get_mut(instance_id) {
            Some(client) => {
                f(client);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }
}
