use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// One holder's hold on one unit of a resource. Never deleted; release only
/// stamps `released_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Ulid,
    pub holder_id: Ulid,
    pub resource_id: Ulid,
    pub claimed_at: Ms,
    pub released_at: Option<Ms>,
}

impl Claim {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Units currently available.
    pub stock: u32,
    /// Units at provisioning time. `stock + open claims` always equals this.
    pub initial_stock: u32,
    /// Claims ever created against this resource.
    pub popularity: u64,
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>, description: Option<String>, stock: u32) -> Self {
        Self {
            id,
            name,
            description,
            stock,
            initial_stock: stock,
            popularity: 0,
        }
    }

    pub fn in_stock(&self) -> bool {
        self.stock > 0
    }

    /// Units currently out on open claims.
    pub fn claimed_units(&self) -> u32 {
        self.initial_stock.saturating_sub(self.stock)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            stock: self.stock,
            initial_stock: self.initial_stock,
            popularity: self.popularity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HolderState {
    pub id: Ulid,
    /// Unique contact key, e.g. an e-mail address.
    pub contact: String,
    /// Claim history, oldest first. At most one entry is open.
    pub claims: Vec<Claim>,
}

impl HolderState {
    pub fn new(id: Ulid, contact: String) -> Self {
        Self {
            id,
            contact,
            claims: Vec::new(),
        }
    }

    pub fn open_claim(&self) -> Option<&Claim> {
        self.claims.iter().rev().find(|c| c.is_open())
    }

    pub fn open_claim_on(&self, resource_id: Ulid) -> Option<&Claim> {
        self.open_claim().filter(|c| c.resource_id == resource_id)
    }

    pub fn record(&mut self, claim: Claim) {
        self.claims.push(claim);
    }

    /// Stamp the claim as released. Returns false if it was unknown or already closed.
    pub fn close(&mut self, claim_id: Ulid, released_at: Ms) -> bool {
        match self.claims.iter_mut().rev().find(|c| c.id == claim_id) {
            Some(claim) if claim.is_open() => {
                claim.released_at = Some(released_at);
                true
            }
            _ => false,
        }
    }

    pub fn info(&self) -> HolderInfo {
        HolderInfo {
            id: self.id,
            contact: self.contact.clone(),
        }
    }
}

/// WAL record payload. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        stock: u32,
    },
    HolderCreated {
        id: Ulid,
        contact: String,
    },
    ClaimOpened {
        id: Ulid,
        holder_id: Ulid,
        resource_id: Ulid,
        claimed_at: Ms,
    },
    ClaimClosed {
        id: Ulid,
        holder_id: Ulid,
        resource_id: Ulid,
        released_at: Ms,
    },
    /// Compacted form of a claim: one record carrying the whole lifecycle.
    ClaimRecorded {
        claim: Claim,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub stock: u32,
    pub initial_stock: u32,
    pub popularity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderInfo {
    pub id: Ulid,
    pub contact: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(holder_id: Ulid, resource_id: Ulid, claimed_at: Ms) -> Claim {
        Claim {
            id: Ulid::new(),
            holder_id,
            resource_id,
            claimed_at,
            released_at: None,
        }
    }

    #[test]
    fn resource_starts_full() {
        let rs = ResourceState::new(Ulid::new(), Some("Dom Casmurro".into()), None, 3);
        assert_eq!(rs.stock, 3);
        assert_eq!(rs.initial_stock, 3);
        assert_eq!(rs.popularity, 0);
        assert_eq!(rs.claimed_units(), 0);
        assert!(rs.in_stock());
    }

    #[test]
    fn empty_resource_not_in_stock() {
        let rs = ResourceState::new(Ulid::new(), None, None, 0);
        assert!(!rs.in_stock());
    }

    #[test]
    fn info_mirrors_state() {
        let mut rs = ResourceState::new(Ulid::new(), Some("Dipirona".into()), Some("500mg".into()), 5);
        rs.stock = 4;
        rs.popularity = 7;
        let info = rs.info();
        assert_eq!(info.id, rs.id);
        assert_eq!(info.name.as_deref(), Some("Dipirona"));
        assert_eq!(info.description.as_deref(), Some("500mg"));
        assert_eq!(info.stock, 4);
        assert_eq!(info.initial_stock, 5);
        assert_eq!(info.popularity, 7);
    }

    #[test]
    fn holder_without_claims_has_none_open() {
        let h = HolderState::new(Ulid::new(), "joao@example.com".into());
        assert!(h.open_claim().is_none());
        assert!(h.claims.is_empty());
    }

    #[test]
    fn open_claim_is_found() {
        let mut h = HolderState::new(Ulid::new(), "maria@example.com".into());
        let rid = Ulid::new();
        let c = claim(h.id, rid, 1000);
        h.record(c.clone());
        assert_eq!(h.open_claim(), Some(&c));
        assert_eq!(h.open_claim_on(rid), Some(&c));
        assert!(h.open_claim_on(Ulid::new()).is_none());
    }

    #[test]
    fn close_stamps_release_time() {
        let mut h = HolderState::new(Ulid::new(), "ana@example.com".into());
        let c = claim(h.id, Ulid::new(), 1000);
        h.record(c.clone());
        assert!(h.close(c.id, 2000));
        assert!(h.open_claim().is_none());
        assert_eq!(h.claims[0].released_at, Some(2000));
    }

    #[test]
    fn close_twice_is_rejected() {
        let mut h = HolderState::new(Ulid::new(), "ana@example.com".into());
        let c = claim(h.id, Ulid::new(), 1000);
        h.record(c.clone());
        assert!(h.close(c.id, 2000));
        assert!(!h.close(c.id, 3000));
        assert_eq!(h.claims[0].released_at, Some(2000)); // first stamp kept
    }

    #[test]
    fn close_unknown_claim_is_rejected() {
        let mut h = HolderState::new(Ulid::new(), "ana@example.com".into());
        h.record(claim(h.id, Ulid::new(), 1000));
        assert!(!h.close(Ulid::new(), 2000));
        assert!(h.open_claim().is_some());
    }

    #[test]
    fn history_keeps_closed_claims() {
        let mut h = HolderState::new(Ulid::new(), "joao@example.com".into());
        let first = claim(h.id, Ulid::new(), 1000);
        h.record(first.clone());
        h.close(first.id, 1500);
        let second = claim(h.id, Ulid::new(), 2000);
        h.record(second.clone());

        assert_eq!(h.claims.len(), 2);
        assert_eq!(h.open_claim().map(|c| c.id), Some(second.id));
        assert!(!h.claims[0].is_open());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClaimRecorded {
            claim: Claim {
                id: Ulid::new(),
                holder_id: Ulid::new(),
                resource_id: Ulid::new(),
                claimed_at: 1000,
                released_at: Some(2000),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
