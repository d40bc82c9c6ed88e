//! IPv4 address allocation.
//!
//! Two allocators with one contract: the private allocator walks a VPC's
//! CIDR (or its subnets) in deterministic order, the public allocator walks
//! the configured pool ranges. Neither writes to the Store directly: a
//! successful reservation returns the [`TxOp`] for the allocation row, and
//! the caller commits it in the same batch as the mutation that consumes the
//! address. The compare-and-set on the `(scope, address)` key is what makes
//! double allocation impossible, even across concurrent reservations.

use std::net::Ipv4Addr;

use anyhow::Error;
use tracing::debug;

use vdc_api_types::{
    api_bail, api_err, keys, AllocScope, AllocStatus, IpAllocation, Ipv4Cidr, Subnet, Ulid, Vpc,
};
use vdc_store::{Expect, Store, TxOp};

/// Seconds a released or dangling-reserved allocation is quarantined before
/// the address may be handed out again.
pub const RELEASE_GRACE_SECS: i64 = 300;

/// A successful reservation: the address and the store operation that, once
/// committed, makes it binding.
#[derive(Debug)]
pub struct Reservation {
    pub address: Ipv4Addr,
    pub op: TxOp,
}

/// Occupancy of one address as seen by the allocator.
enum Slot {
    Free,
    /// Free, but the old row still exists at this revision and must be
    /// replaced with a CAS.
    Reusable(u64),
    Taken,
}

fn slot(store: &Store, scope: &AllocScope, address: Ipv4Addr, now: i64) -> Result<Slot, Error> {
    match store.get_typed::<IpAllocation>(&keys::alloc(scope, address))? {
        None => Ok(Slot::Free),
        Some((alloc, rev)) => match alloc.status {
            AllocStatus::Released if now >= alloc.updated_at + RELEASE_GRACE_SECS => {
                Ok(Slot::Reusable(rev))
            }
            _ => Ok(Slot::Taken),
        },
    }
}

fn reserve_at(
    store: &Store,
    scope: &AllocScope,
    address: Ipv4Addr,
    owner: Option<Ulid>,
    now: i64,
) -> Result<Option<Reservation>, Error> {
    let expect = match slot(store, scope, address, now)? {
        Slot::Free => Expect::Absent,
        Slot::Reusable(rev) => Expect::Rev(rev),
        Slot::Taken => return Ok(None),
    };

    let row = IpAllocation {
        scope: scope.clone(),
        address,
        owner,
        status: AllocStatus::Reserved,
        updated_at: now,
    };

    debug!(%scope, %address, "reserved address");
    Ok(Some(Reservation {
        address,
        op: TxOp::put(keys::alloc(scope, address), expect, &row)?,
    }))
}

/// Reserve a private address inside a VPC.
///
/// Iterates the smallest free host part first; subnets, when present,
/// partition the space and are tried in CIDR order. `hint` short-circuits
/// the scan when the hinted address is inside the VPC and free.
pub fn reserve_private(
    store: &Store,
    vpc: &Vpc,
    subnets: &[Subnet],
    owner: Option<Ulid>,
    hint: Option<Ipv4Addr>,
    now: i64,
) -> Result<Reservation, Error> {
    let scope = AllocScope::VpcPrivate(vpc.name.clone());

    if let Some(hint) = hint {
        if private_address_valid(vpc, subnets, hint) {
            if let Some(reservation) = reserve_at(store, &scope, hint, owner, now)? {
                return Ok(reservation);
            }
        }
    }

    let mut cidrs: Vec<Ipv4Cidr> = if subnets.is_empty() {
        vec![vpc.cidr]
    } else {
        let mut cidrs: Vec<Ipv4Cidr> = subnets.iter().map(|s| s.cidr).collect();
        cidrs.sort();
        cidrs
    };
    cidrs.dedup();

    for cidr in cidrs {
        for address in cidr.hosts() {
            if let Some(reservation) = reserve_at(store, &scope, address, owner, now)? {
                return Ok(reservation);
            }
        }
    }

    Err(api_err!(
        Exhausted,
        "no free address in vpc {} ({})",
        vpc.name,
        vpc.cidr
    ))
}

fn private_address_valid(vpc: &Vpc, subnets: &[Subnet], address: Ipv4Addr) -> bool {
    if !vpc.cidr.contains_address(&address) {
        return false;
    }
    let in_reserved = |cidr: &Ipv4Cidr| {
        address == cidr.network() || address == cidr.gateway() || address == cidr.broadcast()
    };
    if in_reserved(&vpc.cidr) {
        return false;
    }
    for subnet in subnets {
        if subnet.cidr.contains_address(&address) {
            return !in_reserved(&subnet.cidr);
        }
    }
    subnets.is_empty()
}

/// Addresses of a public pool range. Ranges of /31 and /32 are used in
/// full; wider ranges exclude network and broadcast.
fn pool_addresses(cidr: Ipv4Cidr) -> Box<dyn Iterator<Item = Ipv4Addr>> {
    if cidr.mask() >= 31 {
        let count = 1u64 << (32 - cidr.mask());
        let base = cidr.network().to_bits() as u64;
        Box::new((0..count).map(move |n| Ipv4Addr::from_bits((base + n) as u32)))
    } else {
        let capacity = cidr.usable_capacity();
        Box::new((0..capacity).map_while(move |n| cidr.nth_usable(n)))
    }
}

/// Reserve an address from the region's public pool.
pub fn reserve_public(
    store: &Store,
    pool: &[Ipv4Cidr],
    owner: Option<Ulid>,
    hint: Option<Ipv4Addr>,
    now: i64,
) -> Result<Reservation, Error> {
    let scope = AllocScope::Public;

    if let Some(hint) = hint {
        if pool.iter().any(|cidr| cidr.contains_address(&hint)) {
            if let Some(reservation) = reserve_at(store, &scope, hint, owner, now)? {
                return Ok(reservation);
            }
        }
    }

    for cidr in pool {
        for address in pool_addresses(*cidr) {
            if let Some(reservation) = reserve_at(store, &scope, address, owner, now)? {
                return Ok(reservation);
            }
        }
    }

    Err(api_err!(Exhausted, "public ip pool is exhausted"))
}

/// Flip a reserved allocation to bound. Conflicts if the address is not
/// reserved or belongs to a different owner.
pub fn bind(
    store: &Store,
    scope: &AllocScope,
    address: Ipv4Addr,
    owner: Ulid,
    now: i64,
) -> Result<TxOp, Error> {
    let key = keys::alloc(scope, address);
    let Some((mut alloc, rev)) = store.get_typed::<IpAllocation>(&key)? else {
        api_bail!(NotFound, "no allocation for {address} in scope {scope}");
    };

    match alloc.status {
        AllocStatus::Released => {
            api_bail!(Conflict, "allocation {address} in scope {scope} was released")
        }
        AllocStatus::Bound if alloc.owner != Some(owner) => {
            api_bail!(Conflict, "address {address} is bound to another owner")
        }
        AllocStatus::Reserved if alloc.owner.is_some() && alloc.owner != Some(owner) => {
            api_bail!(Conflict, "address {address} is reserved for another owner")
        }
        _ => (),
    }

    alloc.status = AllocStatus::Bound;
    alloc.owner = Some(owner);
    alloc.updated_at = now;
    TxOp::put(key, Expect::Rev(rev), &alloc)
}

/// Release an allocation. Idempotent: releasing an unknown or already
/// released address yields no operation.
pub fn release(
    store: &Store,
    scope: &AllocScope,
    address: Ipv4Addr,
    owner: Option<Ulid>,
    now: i64,
) -> Result<Option<TxOp>, Error> {
    let key = keys::alloc(scope, address);
    let Some((mut alloc, rev)) = store.get_typed::<IpAllocation>(&key)? else {
        return Ok(None);
    };
    if alloc.status == AllocStatus::Released {
        return Ok(None);
    }
    if owner.is_some() && alloc.owner.is_some() && alloc.owner != owner {
        api_bail!(Conflict, "address {address} is owned by another entity");
    }

    alloc.status = AllocStatus::Released;
    alloc.updated_at = now;
    Ok(Some(TxOp::put(key, Expect::Rev(rev), &alloc)?))
}

/// All allocations of a scope, in address-string order.
pub fn list(store: &Store, scope: &AllocScope) -> Result<Vec<IpAllocation>, Error> {
    Ok(store
        .list_typed::<IpAllocation>(&keys::alloc_scope_prefix(scope))?
        .into_iter()
        .map(|(alloc, _)| alloc)
        .collect())
}

/// Delete allocation rows that no longer quarantine anything: released rows
/// past the grace period, and reserved rows past the grace period whose
/// owner vanished (crash between reserve and bind). Returns the reaped count.
pub fn reap_expired<F>(store: &Store, now: i64, owner_exists: F) -> Result<usize, Error>
where
    F: Fn(Ulid) -> bool,
{
    let mut reaped = 0;
    for (key, value, rev) in store.list(keys::ALLOC_PREFIX) {
        let alloc: IpAllocation = match serde_json::from_value(value) {
            Ok(alloc) => alloc,
            Err(_) => continue,
        };
        let expired = now >= alloc.updated_at + RELEASE_GRACE_SECS;
        let reap = match alloc.status {
            AllocStatus::Released => expired,
            AllocStatus::Reserved => {
                expired && !alloc.owner.map(&owner_exists).unwrap_or(false)
            }
            AllocStatus::Bound => false,
        };
        if reap {
            // a concurrent re-reservation of the same key just wins
            if store.delete(&key, Expect::Rev(rev)).is_ok() {
                reaped += 1;
            }
        }
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests;
