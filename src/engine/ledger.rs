use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn check_in_stock(rs: &ResourceState) -> Result<(), EngineError> {
    if rs.in_stock() {
        Ok(())
    } else {
        Err(EngineError::OutOfStock(rs.id))
    }
}

/// A holder may have one open claim, on any resource.
pub(crate) fn check_no_open_claim(holder: &HolderState) -> Result<(), EngineError> {
    match holder.open_claim() {
        Some(claim) => Err(EngineError::HolderHasOpenClaim {
            holder_id: holder.id,
            resource_id: claim.resource_id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn find_open_claim(holder: &HolderState, resource_id: Ulid) -> Result<&Claim, EngineError> {
    holder
        .open_claim_on(resource_id)
        .ok_or(EngineError::NoOpenClaim {
            holder_id: holder.id,
            resource_id,
        })
}

/// Apply a claim event to the two rows it touches. Caller holds both write locks.
pub(crate) fn apply_claim(holder: &mut HolderState, rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ClaimOpened {
            id,
            holder_id,
            resource_id,
            claimed_at,
        } => {
            rs.stock = rs.stock.saturating_sub(1);
            rs.popularity += 1;
            holder.record(Claim {
                id: *id,
                holder_id: *holder_id,
                resource_id: *resource_id,
                claimed_at: *claimed_at,
                released_at: None,
            });
        }
        Event::ClaimClosed { id, released_at, .. } => {
            if holder.close(*id, *released_at) {
                rs.stock += 1;
            }
        }
        Event::ClaimRecorded { claim } => {
            rs.popularity += 1;
            if claim.is_open() {
                rs.stock = rs.stock.saturating_sub(1);
            }
            holder.record(claim.clone());
        }
        // Row creation is handled by the store, not here
        Event::ResourceCreated { .. } | Event::HolderCreated { .. } => {}
    }
}

/// Re-check the reserve rules for a logged claim before replaying it.
/// A closing event needs no check: closing an unknown claim is a no-op.
pub(crate) fn check_replayable(holder: &HolderState, rs: &ResourceState, event: &Event) -> Result<(), EngineError> {
    let opens = match event {
        Event::ClaimOpened { .. } => true,
        Event::ClaimRecorded { claim } => claim.is_open(),
        _ => false,
    };
    if opens {
        check_in_stock(rs)?;
        check_no_open_claim(holder)?;
    }
    Ok(())
}

/// Holder and resource a claim event refers to.
pub(crate) fn claim_rows(event: &Event) -> Option<(Ulid, Ulid)> {
    match event {
        Event::ClaimOpened {
            holder_id,
            resource_id,
            ..
        }
        | Event::ClaimClosed {
            holder_id,
            resource_id,
            ..
        } => Some((*holder_id, *resource_id)),
        Event::ClaimRecorded { claim } => Some((claim.holder_id, claim.resource_id)),
        Event::ResourceCreated { .. } | Event::HolderCreated { .. } => None,
    }
}
