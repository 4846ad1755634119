//! AsyncDht node.

use std::thread;

use crate::common::{Contact, Id};
use crate::dht::{Dht, Info};
use crate::rpc::{CancellationToken, NodeLookup, ValueLookup};
use crate::{Error, Result};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
///
/// Every call runs the blocking operation on its own thread and awaits its result.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Info {
        self.0.info()
    }

    /// Returns a reference to the blocking [Dht].
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    pub async fn ping(&self, contact: Contact) -> Result<()> {
        self.spawn(move |dht| dht.ping(&contact)).await?
    }

    pub async fn store(&self, contact: Contact, key: String, value: Option<String>) -> Result<Option<String>> {
        self.spawn(move |dht| dht.store(&contact, &key, value)).await?
    }

    pub async fn find_node(&self, target: Id) -> Result<NodeLookup> {
        self.find_node_with(target, CancellationToken::new()).await
    }

    pub async fn find_node_with(&self, target: Id, cancel: CancellationToken) -> Result<NodeLookup> {
        self.spawn(move |dht| dht.find_node_with(target, &cancel)).await
    }

    pub async fn find_value(&self, key: String) -> Result<ValueLookup> {
        self.find_value_with(key, CancellationToken::new()).await
    }

    pub async fn find_value_with(
        &self,
        key: String,
        cancel: CancellationToken,
    ) -> Result<ValueLookup> {
        self.spawn(move |dht| dht.find_value_with(&key, &cancel)).await
    }

    pub async fn put(&self, key: String, value: String) -> Result<Vec<Contact>> {
        self.spawn(move |dht| dht.put(&key, value)).await?
    }

    pub async fn get(&self, key: String) -> Result<Option<String>> {
        self.spawn(move |dht| dht.get(&key)).await?
    }

    /// Wait until the bootstraping is done.
    ///
    /// Returns true if the bootstraping was successful.
    pub async fn bootstrap(&self, seeds: Vec<Contact>) -> Result<bool> {
        self.spawn(move |dht| dht.bootstrap(&seeds)).await
    }

    pub fn shutdown(&self) {
        self.0.shutdown()
    }

    // === Private Methods ===

    async fn spawn<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Dht) -> T + Send + 'static,
    {
        let (sender, receiver) = flume::bounded::<T>(1);
        let dht = self.0.clone();

        thread::Builder::new()
            .name("kadnode async task".to_string())
            .spawn(move || {
                let _ = sender.send(task(&dht));
            })?;

        receiver.recv_async().await.map_err(|_| Error::DhtWasShutdown)
    }
}
