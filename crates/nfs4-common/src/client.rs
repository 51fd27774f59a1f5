//! NFSv4.0 client records
//!
//! SETCLIENTID registers an unconfirmed record for a client name and
//! SETCLIENTID_CONFIRM promotes it. Only confirmed client ids may create
//! open or lock state. Client ids embed the server boot epoch in their high
//! word so ids from a previous server instance are recognized as stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{CommonError, CommonResult};

/// 8-byte verifier (client boot verifier or confirm verifier)
pub type Verifier = [u8; 8];

/// Registered client incarnation
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Server-assigned client id
    pub client_id: u64,
    /// Client-chosen name (`nfs_client_id4.id`)
    pub name: Bytes,
    /// Client boot verifier
    pub verifier: Verifier,
    /// Verifier the client must echo in SETCLIENTID_CONFIRM
    pub confirm: Verifier,
    /// Principal (AUTH_SYS uid) that registered the client
    pub principal: u32,
    /// Set by SETCLIENTID_CONFIRM
    pub confirmed: bool,
    /// Last RENEW or state-bearing operation
    pub last_renewed: Instant,
}

/// Result of SETCLIENTID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGrant {
    /// Client id to confirm
    pub client_id: u64,
    /// Verifier to echo in SETCLIENTID_CONFIRM
    pub confirm: Verifier,
}

#[derive(Debug, Default)]
struct NameSlots {
    confirmed: Option<u64>,
    unconfirmed: Option<u64>,
}

/// Client registrations for one server instance
pub struct ClientTable {
    boot: u32,
    next: AtomicU32,
    records: DashMap<u64, ClientRecord>,
    /// Name to record ids; only touched by SETCLIENTID and its confirm
    names: Mutex<HashMap<Bytes, NameSlots>>,
}

impl ClientTable {
    /// Create a table for a server instance booted at `boot`
    pub fn new(boot: u32) -> Self {
        Self {
            boot,
            next: AtomicU32::new(1),
            records: DashMap::new(),
            names: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> u64 {
        ((self.boot as u64) << 32) | self.next.fetch_add(1, Ordering::SeqCst) as u64
    }

    /// SETCLIENTID: register (or re-register) a client name
    pub fn set_client_id(
        &self,
        name: Bytes,
        verifier: Verifier,
        principal: u32,
    ) -> CommonResult<ClientGrant> {
        let mut names = self.names.lock();
        let slots = names.entry(name.clone()).or_default();

        let confirmed = slots
            .confirmed
            .and_then(|id| self.records.get(&id).map(|r| r.clone()));

        if let Some(existing) = &confirmed {
            if existing.principal != principal {
                debug!(client_id = existing.client_id, "client name registered to another principal");
                return Err(CommonError::ClientInUse(existing.client_id));
            }
        }

        // Same incarnation keeps its id; a new boot verifier gets a new id
        let client_id = match &confirmed {
            Some(existing) if existing.verifier == verifier => existing.client_id,
            _ => self.allocate_id(),
        };

        if let Some(stale) = slots.unconfirmed.take() {
            if Some(stale) != slots.confirmed {
                self.records.remove(&stale);
            }
        }

        let confirm: Verifier = rand::random();
        if Some(client_id) == slots.confirmed {
            if let Some(mut record) = self.records.get_mut(&client_id) {
                record.confirm = confirm;
            }
        } else {
            self.records.insert(
                client_id,
                ClientRecord {
                    client_id,
                    name,
                    verifier,
                    confirm,
                    principal,
                    confirmed: false,
                    last_renewed: Instant::now(),
                },
            );
        }
        slots.unconfirmed = Some(client_id);

        debug!(client_id, "SETCLIENTID");
        Ok(ClientGrant { client_id, confirm })
    }

    /// SETCLIENTID_CONFIRM. Returns the id of a previous incarnation that
    /// this confirmation superseded, whose state the caller must discard.
    pub fn confirm(&self, client_id: u64, confirm: Verifier) -> CommonResult<Option<u64>> {
        let mut names = self.names.lock();

        let name = {
            let record = self
                .records
                .get(&client_id)
                .ok_or(CommonError::StaleClient(client_id))?;
            if record.confirm != confirm {
                return Err(CommonError::StaleClient(client_id));
            }
            record.name.clone()
        };

        let slots = names.entry(name).or_default();
        if slots.unconfirmed != Some(client_id) {
            // Retransmitted confirm of an already confirmed client
            return if slots.confirmed == Some(client_id) {
                Ok(None)
            } else {
                Err(CommonError::StaleClient(client_id))
            };
        }

        slots.unconfirmed = None;
        let superseded = slots.confirmed.replace(client_id).filter(|old| *old != client_id);
        if let Some(old) = superseded {
            self.records.remove(&old);
        }
        if let Some(mut record) = self.records.get_mut(&client_id) {
            record.confirmed = true;
            record.last_renewed = Instant::now();
        }

        info!(client_id, ?superseded, "client confirmed");
        Ok(superseded)
    }

    /// RENEW, and the implicit renewal of every state-bearing operation.
    /// Fails for unknown, unconfirmed or previous-boot client ids.
    pub fn renew(&self, client_id: u64) -> CommonResult<()> {
        if (client_id >> 32) as u32 != self.boot {
            return Err(CommonError::StaleClient(client_id));
        }
        match self.records.get_mut(&client_id) {
            Some(mut record) if record.confirmed => {
                record.last_renewed = Instant::now();
                Ok(())
            }
            _ => Err(CommonError::StaleClient(client_id)),
        }
    }

    /// Look up a client record
    pub fn get(&self, client_id: u64) -> Option<ClientRecord> {
        self.records.get(&client_id).map(|r| r.clone())
    }

    /// Number of registered records (confirmed or not)
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no client is registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTable")
            .field("boot", &self.boot)
            .field("clients", &self.records.len())
            .finish()
    }
}
