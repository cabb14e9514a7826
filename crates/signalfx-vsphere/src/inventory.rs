// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::filter::InventoryFilter;
use crate::gateway::Gateway;
use crate::model::{
    Dimensions, Inventory, InventoryObject, ManagedObject, ManagedObjectRef, VmProperties,
    CLUSTER_COMPUTE_TYPE, COMPUTE_TYPE, DATACENTER_TYPE, FOLDER_TYPE,
};

/// Dimensions collected on the way down. Each branch owns its copy.
type DimPairs = Vec<(&'static str, String)>;

struct Visit {
    reference: ManagedObjectRef,
    dims: DimPairs,
}

fn with_pair(dims: &DimPairs, key: &'static str, value: &str) -> DimPairs {
    let mut dims = dims.clone();
    dims.push((key, value.to_string()));
    dims
}

fn pair_value<'a>(dims: &'a DimPairs, key: &str) -> &'a str {
    dims.iter()
        .rev()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
        .unwrap_or_default()
}

fn to_dimensions(dims: &DimPairs) -> Dimensions {
    dims.iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn vm_pairs(host_dims: &DimPairs, vm: &VmProperties) -> DimPairs {
    let mut dims = host_dims.clone();
    dims.extend([
        ("vm_name", vm.name.clone()),
        ("guest_id", vm.guest_id.clone()),
        ("vm_ip", vm.ip_address.clone()),
        ("guest_family", vm.guest_family.clone()),
        ("guest_fullname", vm.guest_full_name.clone()),
    ]);
    dims
}

/// Walks the managed object tree from the root folder and collects every host
/// and virtual machine.
pub struct InventoryService {
    gateway: Arc<dyn Gateway>,
    filter: Option<InventoryFilter>,
}

impl InventoryService {
    pub fn new(gateway: Arc<dyn Gateway>, filter: Option<InventoryFilter>) -> Self {
        InventoryService { gateway, filter }
    }

    fn accepts(&self, dims: &DimPairs, cluster: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.matches(pair_value(dims, "datacenter"), cluster))
    }

    pub async fn retrieve_inventory(&self) -> Result<Inventory, GatewayError> {
        let mut inventory = Inventory::default();
        let mut visited = HashSet::new();
        let mut stack = vec![Visit {
            reference: self.gateway.root_folder().await?,
            dims: Vec::new(),
        }];

        while let Some(Visit { reference, dims }) = stack.pop() {
            if !visited.insert(reference.value.clone()) {
                continue;
            }
            let object = self.gateway.retrieve_object(&reference).await?;

            // Children are pushed in reverse so they are visited in order.
            let children: Vec<Visit> = match object {
                ManagedObject::Folder { child_entity } => child_entity
                    .into_iter()
                    .filter(|child| {
                        let traversable = matches!(
                            child.object_type.as_str(),
                            FOLDER_TYPE | DATACENTER_TYPE | CLUSTER_COMPUTE_TYPE | COMPUTE_TYPE
                        );
                        if !traversable {
                            debug!(reference = %child, "Skipping folder child");
                        }
                        traversable
                    })
                    .map(|child| Visit {
                        reference: child,
                        dims: dims.clone(),
                    })
                    .collect(),
                // VM folders are never followed, every VM is reached through its host.
                ManagedObject::Datacenter { name, host_folder } => vec![Visit {
                    reference: host_folder,
                    dims: with_pair(&dims, "datacenter", &name),
                }],
                ManagedObject::ClusterComputeResource { name, hosts } => {
                    if !self.accepts(&dims, &name) {
                        debug!(cluster = %name, "Cluster excluded by filter");
                        continue;
                    }
                    let dims = with_pair(&dims, "cluster", &name);
                    hosts
                        .into_iter()
                        .map(|host| Visit {
                            reference: host,
                            dims: dims.clone(),
                        })
                        .collect()
                }
                ManagedObject::ComputeResource { name, hosts } => {
                    if !self.accepts(&dims, "") {
                        debug!(compute_resource = %name, "Compute resource excluded by filter");
                        continue;
                    }
                    hosts
                        .into_iter()
                        .map(|host| Visit {
                            reference: host,
                            dims: dims.clone(),
                        })
                        .collect()
                }
                ManagedObject::HostSystem { name, vms } => {
                    let dims = with_pair(&dims, "esx_ip", &name);
                    inventory.add_object(InventoryObject::new(reference, to_dimensions(&dims)));
                    vms.into_iter()
                        .map(|vm| Visit {
                            reference: vm,
                            dims: dims.clone(),
                        })
                        .collect()
                }
                ManagedObject::VirtualMachine(vm) => {
                    let dims = vm_pairs(&dims, &vm);
                    inventory.add_object(InventoryObject::new(reference, to_dimensions(&dims)));
                    Vec::new()
                }
            };
            stack.extend(children.into_iter().rev());
        }

        if inventory.is_empty() {
            warn!("vSphere inventory is empty");
        }
        debug!("Retrieved inventory of {} objects", inventory.len());
        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HOST_TYPE, VM_TYPE};
    use crate::testing::FakeGateway;

    fn ids(inventory: &Inventory) -> Vec<&str> {
        inventory
            .objects
            .iter()
            .map(|o| o.reference.value.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_retrieve_inventory() {
        let gateway = Arc::new(FakeGateway::sample_topology());
        let inventory = InventoryService::new(gateway, None)
            .retrieve_inventory()
            .await
            .unwrap();

        assert_eq!(ids(&inventory), vec!["host-1", "vm-1", "vm-2", "host-2"]);

        let host = &inventory.dimension_map["host-1"];
        assert_eq!(host["object_type"], HOST_TYPE);
        assert_eq!(host["datacenter"], "dc1");
        assert_eq!(host["cluster"], "cluster1");
        assert_eq!(host["esx_ip"], "10.0.0.1");

        let vm = &inventory.dimension_map["vm-1"];
        assert_eq!(vm["object_type"], VM_TYPE);
        assert_eq!(vm["ref_id"], "vm-1");
        assert_eq!(vm["esx_ip"], "10.0.0.1");
        assert_eq!(vm["cluster"], "cluster1");
        assert_eq!(vm["vm_name"], "web-1");
        assert_eq!(vm["guest_id"], "debian10_64Guest");
        assert_eq!(vm["vm_ip"], "192.168.1.10");
        assert_eq!(vm["guest_family"], "linuxGuest");
        assert_eq!(vm["guest_fullname"], "Debian GNU/Linux 10 (64-bit)");

        // Siblings do not share accumulated dimensions.
        let standalone = &inventory.dimension_map["host-2"];
        assert_eq!(standalone["datacenter"], "dc1");
        assert!(!standalone.contains_key("cluster"));
        assert_eq!(inventory.dimension_map["vm-2"]["vm_ip"], "");
    }

    #[tokio::test]
    async fn test_filter_prunes_clusters() {
        let gateway = Arc::new(FakeGateway::sample_topology());
        let filter = InventoryFilter::parse("Cluster == 'cluster1'").unwrap();
        let inventory = InventoryService::new(gateway.clone(), filter)
            .retrieve_inventory()
            .await
            .unwrap();
        // The standalone host is evaluated with an empty cluster name.
        assert_eq!(ids(&inventory), vec!["host-1", "vm-1", "vm-2"]);

        let filter = InventoryFilter::parse("Datacenter == 'dc1' && Cluster == ''").unwrap();
        let inventory = InventoryService::new(gateway, filter)
            .retrieve_inventory()
            .await
            .unwrap();
        assert_eq!(ids(&inventory), vec!["host-2"]);
    }

    #[tokio::test]
    async fn test_cycles_are_visited_once() {
        let root = ManagedObjectRef::new(FOLDER_TYPE, "group-d1");
        let gateway = FakeGateway::new("vc")
            .with_root(root.clone())
            .with_object(
                root.clone(),
                ManagedObject::Folder {
                    child_entity: vec![
                        root.clone(),
                        ManagedObjectRef::new(COMPUTE_TYPE, "domain-s1"),
                        ManagedObjectRef::new(COMPUTE_TYPE, "domain-s1"),
                    ],
                },
            )
            .with_object(
                ManagedObjectRef::new(COMPUTE_TYPE, "domain-s1"),
                ManagedObject::ComputeResource {
                    name: "standalone".into(),
                    hosts: vec![ManagedObjectRef::new(HOST_TYPE, "host-1")],
                },
            )
            .with_object(
                ManagedObjectRef::new(HOST_TYPE, "host-1"),
                ManagedObject::HostSystem {
                    name: "10.0.0.1".into(),
                    vms: Vec::new(),
                },
            );
        let inventory = InventoryService::new(Arc::new(gateway), None)
            .retrieve_inventory()
            .await
            .unwrap();
        assert_eq!(ids(&inventory), vec!["host-1"]);
        assert!(!inventory.dimension_map["host-1"].contains_key("datacenter"));
    }

    #[tokio::test]
    async fn test_gateway_error_fails_retrieval() {
        let root = ManagedObjectRef::new(FOLDER_TYPE, "group-d1");
        let gateway = FakeGateway::new("vc").with_root(root.clone()).with_object(
            root,
            ManagedObject::Folder {
                child_entity: vec![ManagedObjectRef::new(DATACENTER_TYPE, "missing")],
            },
        );
        let result = InventoryService::new(Arc::new(gateway), None)
            .retrieve_inventory()
            .await;
        assert!(result.is_err());
    }
}
