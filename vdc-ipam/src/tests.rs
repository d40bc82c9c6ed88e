use super::*;

use vdc_api_types::error_code;
use vdc_api_types::ErrorCode;

fn test_vpc(cidr: &str) -> Vpc {
    let cidr: Ipv4Cidr = cidr.parse().unwrap();
    Vpc {
        name: "v1".to_string(),
        cidr,
        subnets: Vec::new(),
        gateway: cidr.gateway(),
        mtu: 1500,
        chain: "ab12cd34".to_string(),
        created_at: 0,
    }
}

fn commit(store: &Store, reservation: Reservation) -> Ipv4Addr {
    store.batch(vec![reservation.op]).unwrap();
    reservation.address
}

#[test]
fn private_allocation_is_deterministic() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");

    let first = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
    assert_eq!(commit(&store, first), "10.0.0.2".parse::<Ipv4Addr>().unwrap());

    let second = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
    assert_eq!(commit(&store, second), "10.0.0.3".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn uncommitted_reservation_occupies_nothing() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");

    // computed but never committed
    let _dropped = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();

    let next = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
    assert_eq!(next.address, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn hint_is_honored_when_free() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");

    let hinted: Ipv4Addr = "10.0.0.50".parse().unwrap();
    let res = reserve_private(&store, &vpc, &[], None, Some(hinted), 0).unwrap();
    assert_eq!(commit(&store, res), hinted);

    // occupied hint falls back to the scan
    let res = reserve_private(&store, &vpc, &[], None, Some(hinted), 0).unwrap();
    assert_eq!(res.address, "10.0.0.2".parse::<Ipv4Addr>().unwrap());

    // gateway hint is refused
    let res = reserve_private(&store, &vpc, &[], None, Some(vpc.gateway), 0).unwrap();
    assert_eq!(res.address, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn exhaustion_on_tiny_vpc() {
    let store = Store::in_memory();
    // /29: .0 network, .1 gateway, .7 broadcast -> 5 usable
    let vpc = test_vpc("10.0.0.0/29");

    for _ in 0..5 {
        let res = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
        commit(&store, res);
    }

    let err = reserve_private(&store, &vpc, &[], None, None, 0).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);
}

#[test]
fn subnets_partition_the_space() {
    let store = Store::in_memory();
    let mut vpc = test_vpc("10.0.0.0/16");
    let subnet = Subnet {
        id: Ulid::generate(),
        vpc: vpc.name.clone(),
        cidr: "10.0.5.0/24".parse().unwrap(),
        created_at: 0,
    };
    vpc.subnets.push(subnet.id);

    let res = reserve_private(&store, &vpc, &[subnet.clone()], None, None, 0).unwrap();
    assert_eq!(res.address, "10.0.5.2".parse::<Ipv4Addr>().unwrap());

    // a hint outside every subnet is rejected
    let outside: Ipv4Addr = "10.0.9.9".parse().unwrap();
    let res = reserve_private(&store, &vpc, &[subnet], None, Some(outside), 0).unwrap();
    assert_eq!(res.address, "10.0.5.2".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn release_grace_period() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");
    let owner = Ulid::generate();
    let scope = AllocScope::VpcPrivate(vpc.name.clone());

    let res = reserve_private(&store, &vpc, &[], Some(owner), None, 100).unwrap();
    let first = commit(&store, res);
    store.batch(vec![bind(&store, &scope, first, owner, 100).unwrap()]).unwrap();

    let op = release(&store, &scope, first, Some(owner), 200).unwrap().unwrap();
    store.batch(vec![op]).unwrap();

    // inside the grace period the address is quarantined
    let res = reserve_private(&store, &vpc, &[], None, None, 200 + RELEASE_GRACE_SECS - 1).unwrap();
    assert_eq!(commit(&store, res), "10.0.0.3".parse::<Ipv4Addr>().unwrap());

    // after the grace period it is the smallest free address again
    let res = reserve_private(&store, &vpc, &[], None, None, 200 + RELEASE_GRACE_SECS).unwrap();
    assert_eq!(commit(&store, res), first);
}

#[test]
fn release_is_idempotent() {
    let store = Store::in_memory();
    let scope = AllocScope::VpcPrivate("v1".to_string());
    let address: Ipv4Addr = "10.0.0.2".parse().unwrap();

    // unknown address: no-op
    assert!(release(&store, &scope, address, None, 0).unwrap().is_none());

    let vpc = test_vpc("10.0.0.0/24");
    let res = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
    commit(&store, res);

    let op = release(&store, &scope, address, None, 1).unwrap().unwrap();
    store.batch(vec![op]).unwrap();
    assert!(release(&store, &scope, address, None, 2).unwrap().is_none());
}

#[test]
fn bind_conflicts() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");
    let scope = AllocScope::VpcPrivate(vpc.name.clone());
    let owner = Ulid::generate();
    let thief = Ulid::generate();

    let res = reserve_private(&store, &vpc, &[], Some(owner), None, 0).unwrap();
    let address = commit(&store, res);

    let err = bind(&store, &scope, address, thief, 1).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Conflict);

    store.batch(vec![bind(&store, &scope, address, owner, 1).unwrap()]).unwrap();

    // re-binding by the owner is a no-op level conflict check, not an error
    store.batch(vec![bind(&store, &scope, address, owner, 2).unwrap()]).unwrap();

    let err = bind(&store, &scope, address, thief, 3).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Conflict);
}

#[test]
fn public_pool_counts_usable_addresses() {
    let store = Store::in_memory();
    let pool: Vec<Ipv4Cidr> = vec!["203.0.113.0/30".parse().unwrap()];

    // a /30 pool holds exactly two usable addresses
    let a = reserve_public(&store, &pool, None, None, 0).unwrap();
    assert_eq!(commit(&store, a), "203.0.113.1".parse::<Ipv4Addr>().unwrap());
    let b = reserve_public(&store, &pool, None, None, 0).unwrap();
    assert_eq!(commit(&store, b), "203.0.113.2".parse::<Ipv4Addr>().unwrap());

    let err = reserve_public(&store, &pool, None, None, 0).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);
}

#[test]
fn public_pool_single_address_range() {
    let store = Store::in_memory();
    let pool: Vec<Ipv4Cidr> = vec!["198.51.100.7/32".parse().unwrap()];

    let res = reserve_public(&store, &pool, None, None, 0).unwrap();
    assert_eq!(commit(&store, res), "198.51.100.7".parse::<Ipv4Addr>().unwrap());

    let err = reserve_public(&store, &pool, None, None, 0).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);
}

#[test]
fn reaper_clears_expired_rows() {
    let store = Store::in_memory();
    let vpc = test_vpc("10.0.0.0/24");
    let scope = AllocScope::VpcPrivate(vpc.name.clone());
    let live_owner = Ulid::generate();
    let dead_owner = Ulid::generate();

    // bound allocation: never reaped
    let res = reserve_private(&store, &vpc, &[], Some(live_owner), None, 0).unwrap();
    let bound = commit(&store, res);
    store.batch(vec![bind(&store, &scope, bound, live_owner, 0).unwrap()]).unwrap();

    // reservation whose owner vanished
    let res = reserve_private(&store, &vpc, &[], Some(dead_owner), None, 0).unwrap();
    commit(&store, res);

    // released allocation past grace
    let res = reserve_private(&store, &vpc, &[], None, None, 0).unwrap();
    let released = commit(&store, res);
    let op = release(&store, &scope, released, None, 10).unwrap().unwrap();
    store.batch(vec![op]).unwrap();

    let now = 10 + RELEASE_GRACE_SECS;
    let reaped = reap_expired(&store, now, |owner| owner == live_owner).unwrap();
    assert_eq!(reaped, 2);
    assert_eq!(list(&store, &scope).unwrap().len(), 1);
}
