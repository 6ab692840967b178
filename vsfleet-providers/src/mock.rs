//! In-memory management plane used by tests and local runs.
//!
//! Models just enough of a vCenter inventory to drive the controller end to end:
//! folders, VMs with power state and guest network, resource pools, datastores and
//! template-library items. Tasks complete immediately unless a delay is configured.

use crate::inventory::{
    GuestNic, ObjectKind, ObjectRef, PowerState, TaskHandle, TaskRequest, VmSummary,
};
use crate::{Endpoint, GatewayConnector, GatewayError, GatewayResult, HypervisorGateway};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug)]
struct SimVm {
    id: String,
    name: String,
    folder: String,
    power_state: PowerState,
    guest_net: Vec<GuestNic>,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    // (path, id), insertion order is enumeration order
    folders: Vec<(String, String)>,
    vms: Vec<SimVm>,
    hosts: Vec<(String, String)>,
    resource_pools: Vec<(String, String)>,
    datastores: Vec<(String, String)>,
    // (library, item, id)
    library_items: Vec<(String, String, String)>,
    tasks: HashMap<String, Result<(), String>>,
    fail_clones: usize,
    // removed on their next property read
    vanishing: Vec<String>,
    fail_connect: bool,
    task_delay: Option<Duration>,
    submitted: Vec<&'static str>,
    in_flight: usize,
    peak_in_flight: usize,
    sessions: usize,
    logouts: usize,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, 1000 + self.next_id)
    }

    fn folder_path(&self, folder: &ObjectRef) -> GatewayResult<String> {
        self.folders
            .iter()
            .find(|(_, id)| *id == folder.id)
            .map(|(path, _)| path.clone())
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Folder, folder.id.as_str()))
    }

    fn vm_index(&self, vm: &ObjectRef) -> GatewayResult<usize> {
        self.vms
            .iter()
            .position(|v| v.id == vm.id)
            .ok_or_else(|| GatewayError::not_found(ObjectKind::VirtualMachine, vm.id.as_str()))
    }

    fn vm_by_name_mut(&mut self, name: &str) -> Option<&mut SimVm> {
        self.vms.iter_mut().find(|v| v.name == name)
    }

    fn clone_into(&mut self, name: &str, folder: &ObjectRef) -> Result<(), String> {
        if self.fail_clones > 0 {
            self.fail_clones -= 1;
            return Err(format!("simulated clone failure for {}", name));
        }
        let folder = self.folder_path(folder).map_err(|e| e.to_string())?;
        if self.vms.iter().any(|v| v.folder == folder && v.name == name) {
            return Err(format!("DuplicateName: {} already exists in {}", name, folder));
        }
        let id = self.next_id("vm");
        self.vms.push(SimVm {
            id,
            name: name.to_string(),
            folder,
            power_state: PowerState::PoweredOn,
            guest_net: Vec::new(),
        });
        Ok(())
    }

    fn ensure_exists(&self, list: &[(String, String)], r: &ObjectRef) -> GatewayResult<()> {
        if list.iter().any(|(_, id)| *id == r.id) {
            Ok(())
        } else {
            Err(GatewayError::not_found(r.kind, r.id.as_str()))
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Find an object by full path or by name, restricted to a datacenter and
/// optionally to one cluster (`/DC/host/CLUSTER/...`).
fn scoped<'a>(
    list: &'a [(String, String)],
    datacenter: &str,
    cluster: Option<&str>,
    path: &str,
) -> Option<&'a str> {
    let wanted = normalize(path);
    let dc_prefix = format!("/{}/", datacenter);
    list.iter()
        .filter(|(p, _)| p.starts_with(&dc_prefix))
        .filter(|(p, _)| match cluster {
            Some(cluster) => p.split('/').any(|segment| segment == cluster),
            None => true,
        })
        .find(|(p, _)| *p == wanted || last_segment(p) == last_segment(path))
        .map(|(_, id)| id.as_str())
}

/// Keeps the in-flight counter honest when a task wait is dropped early.
struct InFlight {
    state: Arc<Mutex<SimState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut st) = self.state.lock() {
            st.in_flight -= 1;
        }
    }
}

/// Shared handle on one simulated management plane. Clones observe the same inventory.
#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inventory shaped like a single-host vCenter: `DC0`, cluster `DC0_C0`, template `DC0_H0_VM0`.
    pub fn vpx() -> Self {
        let sim = Self::new();
        sim.add_folder("/DC0/vm");
        sim.add_vm("/DC0/vm", "DC0_H0_VM0", PowerState::PoweredOn);
        sim.add_host("/DC0/host/DC0_C0/DC0_H0");
        sim.add_resource_pool("/DC0/host/DC0_C0/Resources");
        sim.add_datastore("/DC0/datastore/LocalDS_0");
        sim.add_library_item("test-library", "DC0_H0_VM0");
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator state mutex poisoned")
    }

    pub fn add_folder(&self, path: &str) -> String {
        let mut st = self.lock();
        let id = st.next_id("group-v");
        st.folders.push((normalize(path), id.clone()));
        id
    }

    pub fn add_vm(&self, folder: &str, name: &str, power_state: PowerState) -> String {
        let mut st = self.lock();
        let id = st.next_id("vm");
        st.vms.push(SimVm {
            id: id.clone(),
            name: name.to_string(),
            folder: normalize(folder),
            power_state,
            guest_net: Vec::new(),
        });
        id
    }

    pub fn add_host(&self, path: &str) -> String {
        let mut st = self.lock();
        let id = st.next_id("host");
        st.hosts.push((normalize(path), id.clone()));
        id
    }

    pub fn add_resource_pool(&self, path: &str) -> String {
        let mut st = self.lock();
        let id = st.next_id("resgroup");
        st.resource_pools.push((normalize(path), id.clone()));
        id
    }

    pub fn add_datastore(&self, path: &str) -> String {
        let mut st = self.lock();
        let id = st.next_id("datastore");
        st.datastores.push((normalize(path), id.clone()));
        id
    }

    pub fn add_library_item(&self, library: &str, item: &str) -> String {
        let mut st = self.lock();
        let id = st.next_id("library-item");
        st.library_items
            .push((library.to_string(), item.to_string(), id.clone()));
        id
    }

    /// Guest tools report a single adapter carrying `ip`.
    pub fn set_guest_ip(&self, name: &str, ip: &str) -> bool {
        self.set_guest_net(name, vec![GuestNic::with_addresses("00:50:56:aa:bb:01", &[ip])])
    }

    pub fn set_guest_net(&self, name: &str, nics: Vec<GuestNic>) -> bool {
        let mut st = self.lock();
        match st.vm_by_name_mut(name) {
            Some(vm) => {
                vm.guest_net = nics;
                true
            }
            None => false,
        }
    }

    pub fn set_power_state(&self, name: &str, power_state: PowerState) -> bool {
        let mut st = self.lock();
        match st.vm_by_name_mut(name) {
            Some(vm) => {
                vm.power_state = power_state;
                true
            }
            None => false,
        }
    }

    /// Deletes a VM behind the controller's back.
    pub fn remove_vm(&self, name: &str) -> bool {
        let mut st = self.lock();
        let before = st.vms.len();
        st.vms.retain(|v| v.name != name);
        st.vms.len() != before
    }

    /// The VM is deleted the next time its properties are read, as if it was
    /// destroyed right after the folder listing.
    pub fn vanish_on_next_read(&self, name: &str) {
        self.lock().vanishing.push(name.to_string());
    }

    /// The next `n` clone-type tasks fail at completion.
    pub fn fail_next_clones(&self, n: usize) {
        self.lock().fail_clones = n;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Every awaited task takes at least `delay`.
    pub fn set_task_delay(&self, delay: Duration) {
        self.lock().task_delay = Some(delay);
    }

    pub fn vm_names_in(&self, folder: &str) -> Vec<String> {
        let folder = normalize(folder);
        self.lock()
            .vms
            .iter()
            .filter(|v| v.folder == folder)
            .map(|v| v.name.clone())
            .collect()
    }

    pub fn power_state_of(&self, name: &str) -> Option<PowerState> {
        self.lock()
            .vms
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.power_state)
    }

    pub fn submitted_operations(&self) -> Vec<&'static str> {
        self.lock().submitted.clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn sessions(&self) -> usize {
        self.lock().sessions
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }
}

#[async_trait]
impl GatewayConnector for Simulator {
    async fn connect(&self, endpoint: &Endpoint) -> GatewayResult<Arc<dyn HypervisorGateway>> {
        let mut st = self.lock();
        if st.fail_connect {
            return Err(GatewayError::Session(format!(
                "simulated login failure for {}",
                endpoint.url
            )));
        }
        st.sessions += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl HypervisorGateway for Simulator {
    async fn find_folder(&self, path: &str) -> GatewayResult<ObjectRef> {
        let wanted = normalize(path);
        self.lock()
            .folders
            .iter()
            .find(|(p, _)| *p == wanted)
            .map(|(_, id)| ObjectRef::new(ObjectKind::Folder, id.as_str()))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Folder, path))
    }

    async fn find_vm(&self, path: &str) -> GatewayResult<ObjectRef> {
        let st = self.lock();
        let found = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) => {
                let dir = normalize(dir);
                st.vms.iter().find(|v| v.folder == dir && v.name == name)
            }
            None => st.vms.iter().find(|v| v.name == path),
        };
        found
            .map(|v| ObjectRef::new(ObjectKind::VirtualMachine, v.id.as_str()))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::VirtualMachine, path))
    }

    async fn find_resource_pool(
        &self,
        datacenter: &str,
        cluster: &str,
        path: &str,
    ) -> GatewayResult<ObjectRef> {
        let st = self.lock();
        scoped(&st.resource_pools, datacenter, Some(cluster), path)
            .map(|id| ObjectRef::new(ObjectKind::ResourcePool, id))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::ResourcePool, path))
    }

    async fn find_datastore(&self, datacenter: &str, path: &str) -> GatewayResult<ObjectRef> {
        let st = self.lock();
        scoped(&st.datastores, datacenter, None, path)
            .map(|id| ObjectRef::new(ObjectKind::Datastore, id))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Datastore, path))
    }

    async fn find_host(&self, datacenter: &str, cluster: &str, name: &str) -> GatewayResult<ObjectRef> {
        let st = self.lock();
        scoped(&st.hosts, datacenter, Some(cluster), name)
            .map(|id| ObjectRef::new(ObjectKind::Host, id))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Host, name))
    }

    async fn find_library_item(&self, library: &str, item: &str) -> GatewayResult<ObjectRef> {
        let st = self.lock();
        if !st.library_items.iter().any(|(l, _, _)| l == library) {
            return Err(GatewayError::not_found(ObjectKind::Library, library));
        }
        st.library_items
            .iter()
            .find(|(l, i, _)| l == library && i == item)
            .map(|(_, _, id)| ObjectRef::new(ObjectKind::LibraryItem, id.as_str()))
            .ok_or_else(|| {
                GatewayError::not_found(ObjectKind::LibraryItem, format!("{}/{}", library, item))
            })
    }

    async fn list_children(&self, folder: &ObjectRef) -> GatewayResult<Vec<ObjectRef>> {
        let st = self.lock();
        let path = st.folder_path(folder)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children: Vec<ObjectRef> = st
            .vms
            .iter()
            .filter(|v| v.folder == path)
            .map(|v| ObjectRef::new(ObjectKind::VirtualMachine, v.id.as_str()))
            .collect();
        children.extend(
            st.folders
                .iter()
                .filter(|(p, _)| {
                    p.strip_prefix(prefix.as_str())
                        .map(|rest| !rest.is_empty() && !rest.contains('/'))
                        .unwrap_or(false)
                })
                .map(|(_, id)| ObjectRef::new(ObjectKind::Folder, id.as_str())),
        );
        Ok(children)
    }

    async fn vm_summary(&self, vm: &ObjectRef) -> GatewayResult<VmSummary> {
        let mut st = self.lock();
        let idx = st.vm_index(vm)?;
        let name = st.vms[idx].name.clone();
        if let Some(pos) = st.vanishing.iter().position(|n| *n == name) {
            st.vanishing.remove(pos);
            st.vms.remove(idx);
            return Err(GatewayError::not_found(ObjectKind::VirtualMachine, vm.id.as_str()));
        }
        let v = &st.vms[idx];
        Ok(VmSummary {
            reference: vm.clone(),
            name: v.name.clone(),
            power_state: v.power_state,
            guest_net: v.guest_net.clone(),
        })
    }

    async fn submit_task(&self, request: TaskRequest) -> GatewayResult<TaskHandle> {
        let mut st = self.lock();
        let operation = request.operation();
        st.submitted.push(operation);

        let outcome = match &request {
            TaskRequest::InstantClone {
                source,
                name,
                folder,
            } => {
                st.vm_index(source)?;
                st.clone_into(name, folder)
            }
            TaskRequest::Clone { source, name, spec } => {
                st.vm_index(source)?;
                st.ensure_exists(&st.hosts, &spec.host)?;
                st.ensure_exists(&st.resource_pools, &spec.resource_pool)?;
                st.ensure_exists(&st.datastores, &spec.datastore)?;
                st.clone_into(name, &spec.folder)
            }
            TaskRequest::LibraryDeploy { item, name, spec } => {
                if !st.library_items.iter().any(|(_, _, id)| *id == item.id) {
                    return Err(GatewayError::not_found(ObjectKind::LibraryItem, item.id.as_str()));
                }
                st.ensure_exists(&st.hosts, &spec.host)?;
                st.ensure_exists(&st.resource_pools, &spec.resource_pool)?;
                st.ensure_exists(&st.datastores, &spec.datastore)?;
                st.clone_into(name, &spec.folder)
            }
            TaskRequest::PowerOff { vm } => {
                let idx = st.vm_index(vm)?;
                let v = &mut st.vms[idx];
                if v.power_state == PowerState::PoweredOff {
                    return Err(GatewayError::AlreadyInState(v.name.clone()));
                }
                v.power_state = PowerState::PoweredOff;
                v.guest_net.clear();
                Ok(())
            }
            TaskRequest::Destroy { vm } => {
                let idx = st.vm_index(vm)?;
                if st.vms[idx].power_state == PowerState::PoweredOn {
                    Err(format!(
                        "InvalidPowerState: {} must be powered off before destroy",
                        st.vms[idx].name
                    ))
                } else {
                    st.vms.remove(idx);
                    Ok(())
                }
            }
        };

        let id = st.next_id("task");
        st.tasks.insert(id.clone(), outcome);
        Ok(TaskHandle::Pending { id, operation })
    }

    async fn wait_task(&self, task: &TaskHandle) -> GatewayResult<()> {
        let id = match task {
            TaskHandle::Completed { .. } => return Ok(()),
            TaskHandle::Pending { id, .. } => id,
        };

        let delay = {
            let mut st = self.lock();
            st.in_flight += 1;
            st.peak_in_flight = st.peak_in_flight.max(st.in_flight);
            st.task_delay
        };
        let guard = InFlight {
            state: self.state.clone(),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        let mut st = self.lock();
        match st.tasks.remove(id) {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(GatewayError::TaskFailed {
                task: id.clone(),
                message,
            }),
            None => Err(GatewayError::TaskFailed {
                task: id.clone(),
                message: "unknown task".to_string(),
            }),
        }
    }

    async fn logout(&self) -> GatewayResult<()> {
        self.lock().logouts += 1;
        Ok(())
    }
}
