//! Client: a user of the device with its own buffer reference cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::api::bo::BufferObject;
use crate::api::device::Device;
use crate::api::error::Result;
use crate::api::pushbuf::{PushBuf, PushBufCore};
use crate::core::refcache::{ClientRefCache, PushBufId};
use crate::sync::mutex::Mutex;

/// Back-reference from a cache entry to the command buffer owning it.
pub(crate) type CoreRef = Weak<Mutex<PushBufCore>>;

pub(crate) struct ClientShared {
    pub id: u32,
    pub device: Device,
    pub refs: Mutex<ClientRefCache<CoreRef>>,
    next_pushbuf: AtomicU64,
}

/// A client of a [`Device`].
///
/// Command buffers of the same client see each other's buffer references,
/// which is what lets one of them flush another to keep commands ordered.
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<ClientShared>,
}

impl Client {
    /// Register a new client on `device`.
    pub fn new(device: &Device) -> Result<Self> {
        let id = device.shared.alloc_client_id()?;
        log::debug!("client {} created", id);
        Ok(Self {
            shared: Arc::new(ClientShared {
                id,
                device: device.clone(),
                refs: Mutex::new(ClientRefCache::new()),
                next_pushbuf: AtomicU64::new(1),
            }),
        })
    }

    /// Client id, unique among live clients of the device.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    /// The command buffer of this client that currently references `bo`.
    pub fn owner_of(&self, bo: &BufferObject) -> Option<PushBuf> {
        let backref = {
            let refs = self.shared.refs.lock();
            refs.lookup(bo.handle()).map(|e| e.backref.clone())
        };
        backref.and_then(|weak| weak.upgrade()).map(PushBuf::from_core)
    }

    /// Number of buffer objects referenced by unflushed batches of this client.
    pub fn referenced_count(&self) -> usize {
        self.shared.refs.lock().len()
    }

    pub(crate) fn next_pushbuf_id(&self) -> PushBufId {
        PushBufId(self.shared.next_pushbuf.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("referenced", &self.referenced_count())
            .finish()
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.refs.get_mut().clear_all();
        self.device.shared.release_client_id(self.id);
        log::debug!("client {} destroyed", self.id);
    }
}
