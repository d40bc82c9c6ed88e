//! `/api/vpcs`: VPCs, their subnets and firewall rules.

use anyhow::Error;
use serde_json::{json, Value};

use vdc_api_types::{
    api_err, keys, time::epoch_i64, AllocStatus, FirewallRule, FirewallRuleCreateRequest,
    IpAllocation, Subnet, SubnetCreateRequest, Ulid, VmRecord, Vpc, VpcCreateRequest,
    DEFAULT_RULE_PRIORITY,
};
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, SubdirMap, WorkerTask};
use vdc_store::{Expect, TxOp};

use super::{parse_body, resource_response, take_param, take_ulid, task_response};
use crate::context::state;

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_VPCS)
    .post(&API_METHOD_CREATE_VPC)
    .match_all("name", &ITEM_ROUTER);

const ITEM_SUBDIRS: SubdirMap = &[
    ("firewall-rules", &FIREWALL_ROUTER),
    ("subnets", &SUBNET_ROUTER),
];

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_VPC)
    .delete(&API_METHOD_DELETE_VPC)
    .subdirs(ITEM_SUBDIRS);

static SUBNET_ROUTER: Router = Router::new()
    .post(&API_METHOD_CREATE_SUBNET)
    .match_all("subnet", &SUBNET_ITEM_ROUTER);
static SUBNET_ITEM_ROUTER: Router = Router::new().delete(&API_METHOD_DELETE_SUBNET);

static FIREWALL_ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_RULES)
    .post(&API_METHOD_CREATE_RULE)
    .match_all("rule", &FIREWALL_ITEM_ROUTER);
static FIREWALL_ITEM_ROUTER: Router = Router::new().delete(&API_METHOD_DELETE_RULE);

static API_METHOD_LIST_VPCS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_vpcs));
static API_METHOD_CREATE_VPC: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_vpc)).status(201);
static API_METHOD_READ_VPC: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read_vpc));
static API_METHOD_DELETE_VPC: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&delete_vpc)).status(202);
static API_METHOD_CREATE_SUBNET: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_subnet)).status(201);
static API_METHOD_DELETE_SUBNET: ApiMethod = ApiMethod::new(&ApiHandler::Async(&delete_subnet));
static API_METHOD_LIST_RULES: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_rules));
static API_METHOD_CREATE_RULE: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_rule)).status(201);
static API_METHOD_DELETE_RULE: ApiMethod = ApiMethod::new(&ApiHandler::Async(&delete_rule));

fn list_vpcs(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let vpcs: Vec<Vpc> = state()
            .store
            .list_typed::<Vpc>(keys::VPC_PREFIX)?
            .into_iter()
            .map(|(vpc, _)| vpc)
            .collect();
        Ok(json!({ "data": vpcs, "total": vpcs.len() }))
    })
}

fn create_vpc(param: Value) -> ApiFuture {
    Box::pin(async move {
        let state = state();
        let request: VpcCreateRequest = parse_body(param)?;
        let cidr = request.validate(state.config.default_vpc_cidr)?;

        for (other, _) in state.store.list_typed::<Vpc>(keys::VPC_PREFIX)? {
            if other.cidr.overlaps(&cidr) {
                return Err(api_err!(
                    Conflict,
                    "cidr {cidr} overlaps vpc '{}' ({})",
                    other.name,
                    other.cidr
                ));
            }
        }

        let vpc = Vpc {
            name: request.name.clone(),
            cidr,
            subnets: Vec::new(),
            gateway: cidr.gateway(),
            mtu: request.mtu.unwrap_or(1500),
            chain: vdc_firewall::digest(&request.name)[..8].to_string(),
            created_at: epoch_i64(),
        };

        let revision = state
            .store
            .put(&keys::vpc(&vpc.name), &vpc, Expect::Absent)
            .map_err(|err| {
                if vdc_api_types::error_code(&err) == vdc_api_types::ErrorCode::Conflict {
                    api_err!(Conflict, "vpc '{}' already exists", vpc.name)
                } else {
                    err
                }
            })?;

        resource_response("created", &vpc, revision)
    })
}

fn read_vpc(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let name = take_param(&mut param, "name")?;
        let (vpc, _) = state().lookup_vpc(&name)?;
        let subnets: Vec<Subnet> = state()
            .store
            .list_typed::<Subnet>(keys::SUBNET_PREFIX)?
            .into_iter()
            .map(|(subnet, _)| subnet)
            .filter(|subnet| subnet.vpc == name)
            .collect();
        let mut value = serde_json::to_value(&vpc)?;
        value["subnet_details"] = json!(subnets);
        Ok(value)
    })
}

fn vpc_allocations(name: &str) -> Result<Vec<IpAllocation>, Error> {
    let scope = vdc_api_types::AllocScope::VpcPrivate(name.to_string());
    vdc_ipam::list(&state().store, &scope)
}

fn delete_vpc(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let name = take_param(&mut param, "name")?;
        let (vpc, revision) = app.lookup_vpc(&name)?;

        for (vm, _) in app.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.vpc == name && !vm.status.is_terminated() {
                return Err(api_err!(
                    Conflict,
                    "vpc '{name}' still has vm '{}'",
                    vm.name
                ));
            }
        }
        if vpc_allocations(&name)?
            .iter()
            .any(|alloc| alloc.status != AllocStatus::Released)
        {
            return Err(api_err!(Conflict, "vpc '{name}' still has allocated addresses"));
        }

        let task = WorkerTask::spawn(
            "delete-vpc",
            Some(format!("vpc/{name}")),
            move |worker| async move {
                let app = state();
                crate::reconcile::vpc::teardown_everywhere(app, &worker, &vpc).await?;

                // drop the vpc row plus every dependent row
                let mut ops = vec![TxOp::delete(keys::vpc(&vpc.name), Expect::Any)];
                for (subnet, _) in app.store.list_typed::<Subnet>(keys::SUBNET_PREFIX)? {
                    if subnet.vpc == vpc.name {
                        ops.push(TxOp::delete(keys::subnet(subnet.id), Expect::Any));
                    }
                }
                for (key, _, _) in app.store.list(&keys::firewall_rule_prefix(&vpc.name)) {
                    ops.push(TxOp::delete(key, Expect::Any));
                }
                let scope = vdc_api_types::AllocScope::VpcPrivate(vpc.name.clone());
                for (key, _, _) in app.store.list(&keys::alloc_scope_prefix(&scope)) {
                    ops.push(TxOp::delete(key, Expect::Any));
                }
                app.store.batch(ops)?;
                Ok(())
            },
        );

        task_response(
            "deleting",
            &json!({ "name": name }),
            revision,
            task,
            format!("/api/tasks/{task}"),
        )
    })
}

fn create_subnet(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let name = take_param(&mut param, "name")?;
        let request: SubnetCreateRequest = parse_body(param)?;
        let (mut vpc, revision) = app.lookup_vpc(&name)?;

        let cidr = request.cidr.canonical();
        if !vpc.cidr.overlaps(&cidr) || cidr.mask() < vpc.cidr.mask() {
            return Err(api_err!(
                Validation,
                "subnet {cidr} is not contained in vpc cidr {}",
                vpc.cidr
            ));
        }
        if cidr.mask() > 29 {
            return Err(api_err!(Validation, "subnet {cidr} is too small"));
        }

        let existing: Vec<Subnet> = app
            .store
            .list_typed::<Subnet>(keys::SUBNET_PREFIX)?
            .into_iter()
            .map(|(subnet, _)| subnet)
            .filter(|subnet| subnet.vpc == name)
            .collect();
        if let Some(clash) = existing.iter().find(|subnet| subnet.cidr.overlaps(&cidr)) {
            return Err(api_err!(
                Conflict,
                "subnet {cidr} overlaps existing subnet {}",
                clash.cidr
            ));
        }

        let subnet = Subnet {
            id: Ulid::generate(),
            vpc: name.clone(),
            cidr,
            created_at: epoch_i64(),
        };
        vpc.subnets.push(subnet.id);

        let revision = app.store.batch(vec![
            TxOp::put(keys::subnet(subnet.id), Expect::Absent, &subnet)?,
            TxOp::put(keys::vpc(&name), Expect::Rev(revision), &vpc)?,
        ])?;

        resource_response("created", &subnet, revision)
    })
}

fn delete_subnet(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let name = take_param(&mut param, "name")?;
        let subnet_id = take_ulid(&mut param, "subnet")?;
        let (mut vpc, vpc_rev) = app.lookup_vpc(&name)?;

        let Some((subnet, subnet_rev)) = app
            .store
            .get_typed::<Subnet>(&keys::subnet(subnet_id))?
        else {
            return Err(api_err!(NotFound, "no such subnet '{subnet_id}'"));
        };
        if subnet.vpc != name {
            return Err(api_err!(NotFound, "subnet '{subnet_id}' is not in vpc '{name}'"));
        }

        // refuse removal while any allocation in the subnet exists
        if vpc_allocations(&name)?.iter().any(|alloc| {
            alloc.status != AllocStatus::Released && subnet.cidr.contains_address(&alloc.address)
        }) {
            return Err(api_err!(
                Conflict,
                "subnet '{subnet_id}' still has allocated addresses"
            ));
        }

        vpc.subnets.retain(|id| *id != subnet_id);
        let revision = app.store.batch(vec![
            TxOp::delete(keys::subnet(subnet_id), Expect::Rev(subnet_rev)),
            TxOp::put(keys::vpc(&name), Expect::Rev(vpc_rev), &vpc)?,
        ])?;

        resource_response("deleted", &subnet, revision)
    })
}

fn list_rules(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let name = take_param(&mut param, "name")?;
        state().lookup_vpc(&name)?;
        let mut rules: Vec<FirewallRule> = state()
            .store
            .list_typed::<FirewallRule>(&keys::firewall_rule_prefix(&name))?
            .into_iter()
            .map(|(rule, _)| rule)
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(json!({ "data": rules, "total": rules.len() }))
    })
}

fn create_rule(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let name = take_param(&mut param, "name")?;
        let request: FirewallRuleCreateRequest = parse_body(param)?;
        request.validate()?;
        app.lookup_vpc(&name)?;

        let rule = FirewallRule {
            id: Ulid::generate(),
            vpc: name.clone(),
            direction: request.direction,
            protocol: request.protocol,
            port_start: request.port_start,
            port_end: request.port_end.or(request.port_start),
            cidr: request.cidr,
            description: request.description,
            priority: request.priority.unwrap_or(DEFAULT_RULE_PRIORITY),
            created_at: epoch_i64(),
        };

        let revision = app
            .store
            .put(&keys::firewall_rule(&name, rule.id), &rule, Expect::Absent)?;
        app.reconciler.kick_vpc(&name);

        resource_response("created", &rule, revision)
    })
}

fn delete_rule(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let name = take_param(&mut param, "name")?;
        let rule_id = take_ulid(&mut param, "rule")?;

        let key = keys::firewall_rule(&name, rule_id);
        let Some((rule, rev)) = app.store.get_typed::<FirewallRule>(&key)? else {
            return Err(api_err!(NotFound, "no such firewall rule '{rule_id}'"));
        };
        let revision = app.store.delete(&key, Expect::Rev(rev))?;
        app.reconciler.kick_vpc(&name);

        resource_response("deleted", &rule, revision)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdc_api_types::{error_code, ErrorCode};

    #[tokio::test]
    async fn vpc_create_read_and_conflicts() {
        crate::context::test_state();

        let created = create_vpc(json!({ "name": "t-vpcs-a", "cidr": "10.50.0.0/24" }))
            .await
            .unwrap();
        assert_eq!(created["status"], "created");
        assert_eq!(created["resource"]["cidr"], "10.50.0.0/24");
        assert!(created["revision"].as_u64().unwrap() > 0);

        // duplicate name
        let err = create_vpc(json!({ "name": "t-vpcs-a", "cidr": "10.51.0.0/24" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);

        // overlapping cidr
        let err = create_vpc(json!({ "name": "t-vpcs-b", "cidr": "10.50.0.128/25" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);

        let read = read_vpc(json!({ "name": "t-vpcs-a" })).await.unwrap();
        assert_eq!(read["name"], "t-vpcs-a");
        assert_eq!(read["gateway"], "10.50.0.1");

        // unknown body fields are rejected
        let err = create_vpc(json!({ "name": "t-vpcs-c", "cidr": "10.52.0.0/24", "vlan": 7 }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn subnets_partition_and_block_deletion() {
        crate::context::test_state();

        create_vpc(json!({ "name": "t-vpcs-sub", "cidr": "10.60.0.0/16" }))
            .await
            .unwrap();

        let created = create_subnet(json!({ "name": "t-vpcs-sub", "cidr": "10.60.1.0/24" }))
            .await
            .unwrap();
        let subnet_id = created["resource"]["id"].as_str().unwrap().to_string();

        // overlap with the existing subnet
        let err = create_subnet(json!({ "name": "t-vpcs-sub", "cidr": "10.60.1.128/25" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);

        // outside the vpc
        let err = create_subnet(json!({ "name": "t-vpcs-sub", "cidr": "10.99.0.0/24" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Validation);

        let deleted = delete_subnet(json!({ "name": "t-vpcs-sub", "subnet": subnet_id }))
            .await
            .unwrap();
        assert_eq!(deleted["status"], "deleted");
    }

    #[tokio::test]
    async fn firewall_rules_sort_and_kick() {
        crate::context::test_state();

        create_vpc(json!({ "name": "t-vpcs-fw", "cidr": "10.61.0.0/24" }))
            .await
            .unwrap();

        create_rule(json!({
            "name": "t-vpcs-fw",
            "direction": "inbound",
            "protocol": "tcp",
            "port_start": 443,
            "cidr": "0.0.0.0/0",
            "priority": 200,
        }))
        .await
        .unwrap();
        let low = create_rule(json!({
            "name": "t-vpcs-fw",
            "direction": "inbound",
            "protocol": "tcp",
            "port_start": 22,
            "cidr": "0.0.0.0/0",
            "priority": 100,
        }))
        .await
        .unwrap();

        let listed = list_rules(json!({ "name": "t-vpcs-fw" })).await.unwrap();
        assert_eq!(listed["total"], 2);
        assert_eq!(listed["data"][0]["port_start"], 22);

        let rule_id = low["resource"]["id"].as_str().unwrap().to_string();
        let deleted = delete_rule(json!({ "name": "t-vpcs-fw", "rule": rule_id }))
            .await
            .unwrap();
        assert_eq!(deleted["status"], "deleted");

        let listed = list_rules(json!({ "name": "t-vpcs-fw" })).await.unwrap();
        assert_eq!(listed["total"], 1);
    }
}
