//! Multiplexing client
//!
//! [`XClient`] keeps one [`Client`] per server address and routes calls
//! through a [`Discovery`]. Cached clients that have shut down are evicted and
//! redialed on next use.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::client::{Client, x_dial};
use crate::discovery::{Discovery, SelectMode};
use crate::protocol::{Options, Result};

/// Client over every server a [`Discovery`] knows about
pub struct XClient<D> {
    discovery: D,
    mode: SelectMode,
    options: Option<Options>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery> XClient<D> {
    /// Create a client picking servers from `discovery` with `mode`
    #[must_use]
    pub fn new(discovery: D, mode: SelectMode, options: Option<Options>) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The discovery in use
    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.lock().expect("client cache mutex poisoned")
    }

    /// Cached client for `rpc_addr`, dialing a new one if needed
    #[instrument(level = "debug", skip(self))]
    pub async fn dial(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let stale = {
            let mut clients = self.clients();
            if let Some(client) = clients.get(rpc_addr) {
                if client.is_available() {
                    return Ok(Arc::clone(client));
                }
            }
            clients.remove(rpc_addr)
        };
        if let Some(stale) = stale {
            debug!(addr = rpc_addr, "evicting unavailable client");
            let _ = stale.close().await;
        }

        let client = Arc::new(x_dial(rpc_addr, self.options.clone()).await?);

        let mut clients = self.clients();
        match clients.entry(rpc_addr.to_string()) {
            // Another caller dialed the same address meanwhile.
            Entry::Occupied(entry) if entry.get().is_available() => Ok(Arc::clone(entry.get())),
            Entry::Occupied(mut entry) => {
                entry.insert(Arc::clone(&client));
                Ok(client)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    async fn call_addr<A, R>(&self, rpc_addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let client = self.dial(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Call `service_method` on one server chosen by the select mode
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let rpc_addr = self.discovery.get(self.mode)?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Call `service_method` on every known server, one after another
    ///
    /// The first successful reply is stored in `reply`; later ones are
    /// dropped. The first error is returned only if no server succeeded, in
    /// which case `reply` is left untouched. Passing `None` still calls every
    /// server.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        mut reply: Option<&mut R>,
    ) -> Result<()>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let rpc_addrs = self.discovery.get_all()?;
        let mut first_error = None;
        let mut succeeded = false;

        for rpc_addr in &rpc_addrs {
            match self.call_addr::<A, R>(rpc_addr, service_method, args).await {
                Ok(value) => {
                    if !succeeded {
                        succeeded = true;
                        if let Some(slot) = reply.as_deref_mut() {
                            *slot = value;
                        }
                    }
                }
                Err(err) => {
                    debug!(addr = %rpc_addr, service_method, error = %err, "broadcast target failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if !succeeded => Err(err),
            _ => Ok(()),
        }
    }

    /// Close and evict every cached client
    pub async fn close(&self) -> Result<()> {
        let clients: Vec<_> = self.clients().drain().collect();
        for (rpc_addr, client) in clients {
            if let Err(err) = client.close().await {
                warn!(addr = %rpc_addr, error = %err, "xclient: close failed");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.clients().len()
    }
}
