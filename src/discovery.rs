//! Server discovery
//!
//! A [`Discovery`] resolves a logical call to one of a set of server
//! addresses (`network@addr`). [`MultiServerDiscovery`] holds a static list
//! that callers replace wholesale with [`Discovery::update`].

use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use tracing::debug;

use crate::protocol::{Error, Result};

/// Upper bound for the round-robin cursor's random starting point
const MAX_START_INDEX: usize = i32::MAX as usize;

/// How [`Discovery::get`] picks among the known servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    /// Uniformly random server
    #[default]
    Random,
    /// Each server in turn
    RoundRobin,
}

/// Source of server addresses
pub trait Discovery: Send + Sync {
    /// Reload the address set from its backing source
    fn refresh(&self) -> Result<()>;

    /// Replace the address set
    fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address
    fn get(&self, mode: SelectMode) -> Result<String>;

    /// Every known address
    fn get_all(&self) -> Result<Vec<String>>;
}

struct Servers {
    addrs: Vec<String>,
    index: usize,
}

/// Discovery over a fixed, user-maintained address list
pub struct MultiServerDiscovery {
    servers: Mutex<Servers>,
}

impl MultiServerDiscovery {
    /// Create a discovery over `servers`
    ///
    /// The round-robin cursor starts at a random offset so that fresh
    /// instances do not all hit the first server.
    #[must_use]
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: Mutex::new(Servers {
                addrs: servers,
                index: rand::rng().random_range(0..MAX_START_INDEX),
            }),
        }
    }

    fn servers(&self) -> MutexGuard<'_, Servers> {
        self.servers.lock().expect("discovery mutex poisoned")
    }
}

impl Discovery for MultiServerDiscovery {
    /// Static list: nothing to reload
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        debug!(count = servers.len(), "discovery servers updated");
        self.servers().addrs = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let mut servers = self.servers();
        let n = servers.addrs.len();
        if n == 0 {
            return Err(Error::NoServers);
        }

        let index = match mode {
            SelectMode::Random => rand::rng().random_range(0..n),
            SelectMode::RoundRobin => {
                servers.index = (servers.index + 1) % n;
                servers.index
            }
        };
        Ok(servers.addrs[index].clone())
    }

    fn get_all(&self) -> Result<Vec<String>> {
        let servers = self.servers();
        if servers.addrs.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(servers.addrs.clone())
    }
}
