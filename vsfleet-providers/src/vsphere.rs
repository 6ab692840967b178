//! vCenter Automation REST API (`/api`, vSphere 7+) gateway.

use crate::inventory::{
    GuestNic, IpConfig, ObjectKind, ObjectRef, PowerState, TaskHandle, TaskRequest, VmSummary,
};
use crate::{Endpoint, GatewayConnector, GatewayError, GatewayResult, HypervisorGateway};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SESSION_HEADER: &str = "vmware-api-session-id";
const DEFAULT_TASK_POLL: Duration = Duration::from_secs(1);

/// Logs in against vCenter and hands out [`VsphereGateway`] sessions.
#[derive(Clone, Debug)]
pub struct VsphereConnector {
    task_poll_interval: Duration,
}

impl Default for VsphereConnector {
    fn default() -> Self {
        Self {
            task_poll_interval: DEFAULT_TASK_POLL,
        }
    }
}

impl VsphereConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }
}

#[async_trait]
impl GatewayConnector for VsphereConnector {
    async fn connect(&self, endpoint: &Endpoint) -> GatewayResult<Arc<dyn HypervisorGateway>> {
        let gateway = VsphereGateway::login(endpoint, self.task_poll_interval).await?;
        Ok(Arc::new(gateway))
    }
}

pub struct VsphereGateway {
    client: Client,
    base: String,
    token: String,
    task_poll_interval: Duration,
}

// --- Wire types ---

#[derive(Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Deserialize)]
struct FolderSummary {
    folder: String,
}

#[derive(Deserialize)]
struct VmListItem {
    vm: String,
}

#[derive(Deserialize)]
struct VmInfo {
    name: String,
    power_state: String,
}

#[derive(Deserialize)]
struct ClusterSummary {
    cluster: String,
}

#[derive(Deserialize)]
struct HostSummary {
    host: String,
}

#[derive(Deserialize)]
struct ResourcePoolSummary {
    resource_pool: String,
}

#[derive(Deserialize)]
struct DatastoreSummary {
    datastore: String,
}

#[derive(Deserialize)]
struct GuestInterface {
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    ip: Option<GuestIpConfig>,
}

#[derive(Deserialize)]
struct GuestIpConfig {
    #[serde(default)]
    ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Deserialize)]
struct GuestIpAddress {
    ip_address: String,
}

#[derive(Deserialize)]
struct TaskInfo {
    status: String,
    #[serde(default)]
    error: Option<Value>,
}

impl From<GuestInterface> for GuestNic {
    fn from(iface: GuestInterface) -> Self {
        GuestNic {
            mac_address: iface.mac_address.unwrap_or_default(),
            ip_config: iface.ip.map(|ip| IpConfig {
                addresses: ip.ip_addresses.into_iter().map(|a| a.ip_address).collect(),
            }),
        }
    }
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Split a `/DC/vm/a/b` path into the datacenter name and folder components.
fn folder_components(path: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let datacenter = parts.next()?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return None;
    }
    Some((datacenter, rest))
}

/// Human readable message out of a vAPI error payload.
fn error_message(error: &Value) -> String {
    let messages: Vec<&str> = error["messages"]
        .as_array()
        .map(|m| m.iter().filter_map(|m| m["default_message"].as_str()).collect())
        .unwrap_or_default();
    if messages.is_empty() {
        error["error_type"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        messages.join("; ")
    }
}

impl VsphereGateway {
    async fn login(endpoint: &Endpoint, task_poll_interval: Duration) -> GatewayResult<Self> {
        let url = Url::parse(&endpoint.url)
            .with_context(|| format!("invalid vSphere URL {}", endpoint.url))?;
        let username = url.username().to_string();
        let password = url.password().map(|p| p.to_string());
        if username.is_empty() {
            return Err(GatewayError::Session(
                "vSphere URL carries no user name".to_string(),
            ));
        }

        let mut base = url.clone();
        // Credentials travel in the basic-auth header, never in request URLs.
        let _ = base.set_username("");
        let _ = base.set_password(None);
        base.set_query(None);
        let base = base.as_str().trim_end_matches('/').trim_end_matches("/sdk").to_string();

        // Default reqwest client has no overall timeout. A stalled vCenter would hang the caller.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(endpoint.insecure)
            .build()?;

        let session_url = format!("{}/api/session", base);
        tracing::debug!("🔵 [vSphere API] POST {} - Creating session for {}", session_url, username);
        let resp = client
            .post(&session_url)
            .basic_auth(&username, password)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(
                "❌ [vSphere API] POST {} failed: status={}, response={}",
                session_url,
                status.as_u16(),
                body
            );
            return Err(GatewayError::Session(format!(
                "login failed: status={} body={}",
                status.as_u16(),
                body
            )));
        }
        let token: String = resp.json().await?;
        tracing::info!("✅ [vSphere API] Session established against {}", base);

        Ok(Self {
            client,
            base,
            token,
            task_poll_interval,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base, path))
            .header(SESSION_HEADER, &self.token)
    }

    /// Turn non-2xx responses into typed errors.
    async fn check(&self, what: &str, resp: Response) -> GatewayResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(
            "❌ [vSphere API] {} failed: status={}, response={}",
            what,
            status.as_u16(),
            body
        );
        if body.contains("ALREADY_IN_DESIRED_STATE") {
            return Err(GatewayError::AlreadyInState(what.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Session(format!("session rejected: {}", body)));
        }
        Err(GatewayError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> GatewayResult<T> {
        let resp = self.request(Method::GET, path).query(query).send().await?;
        let resp = self.check(&format!("GET {}", path), resp).await?;
        Ok(resp.json().await?)
    }

    async fn post_json(&self, path: &str, query: &[(&str, &str)], body: &Value) -> GatewayResult<Value> {
        tracing::debug!("🔵 [vSphere API] POST {} payload={}", path, body);
        let mut req = self.request(Method::POST, path).query(query);
        if !body.is_null() {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let resp = self.check(&format!("POST {}", path), resp).await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).context("decoding vSphere response")?)
    }

    async fn find_datacenter(&self, name: &str) -> GatewayResult<String> {
        let found: Vec<DatacenterSummary> = self
            .get_json("/api/vcenter/datacenter", &[("names", name)])
            .await?;
        found
            .into_iter()
            .next()
            .map(|d| d.datacenter)
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Datacenter, name))
    }

    async fn find_cluster(&self, datacenter: &str, name: &str) -> GatewayResult<String> {
        let found: Vec<ClusterSummary> = self
            .get_json(
                "/api/vcenter/cluster",
                &[("names", name), ("datacenters", datacenter)],
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(|c| c.cluster)
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Cluster, name))
    }

    /// Submit with `vmw-tasks=true` and hand back the task id.
    async fn submit_async(
        &self,
        path: &str,
        action: &str,
        body: Value,
        operation: &'static str,
    ) -> GatewayResult<TaskHandle> {
        let resp = self
            .post_json(path, &[("action", action), ("vmw-tasks", "true")], &body)
            .await?;
        let id = resp
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no task id in {} response", operation))?
            .to_string();
        tracing::info!("🔵 [vSphere API] {} submitted as task {}", operation, id);
        Ok(TaskHandle::Pending { id, operation })
    }
}

fn clone_hardware(spec: &crate::inventory::CloneSpec) -> Value {
    json!({
        "cpu_update": { "num_cpus": spec.sizing.cpu_count },
        "memory_update": { "memory": spec.sizing.memory_mb },
    })
}

#[async_trait]
impl HypervisorGateway for VsphereGateway {
    async fn find_folder(&self, path: &str) -> GatewayResult<ObjectRef> {
        let (datacenter, components) = folder_components(path)
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Folder, path))?;
        let dc = self.find_datacenter(datacenter).await?;

        let mut parent: Option<String> = None;
        for component in components {
            let mut query = vec![
                ("names", component),
                ("type", "VIRTUAL_MACHINE"),
                ("datacenters", dc.as_str()),
            ];
            if let Some(p) = parent.as_deref() {
                query.push(("parent_folders", p));
            }
            let found: Vec<FolderSummary> = self.get_json("/api/vcenter/folder", &query).await?;
            let next = found
                .into_iter()
                .next()
                .map(|f| f.folder)
                .ok_or_else(|| GatewayError::not_found(ObjectKind::Folder, path))?;
            parent = Some(next);
        }

        parent
            .map(|id| ObjectRef::new(ObjectKind::Folder, id))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Folder, path))
    }

    async fn find_vm(&self, path: &str) -> GatewayResult<ObjectRef> {
        let found: Vec<VmListItem> = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) => {
                let folder = self.find_folder(dir).await?;
                self.get_json(
                    "/api/vcenter/vm",
                    &[("folders", folder.id.as_str()), ("names", name)],
                )
                .await?
            }
            None => self.get_json("/api/vcenter/vm", &[("names", path)]).await?,
        };
        found
            .into_iter()
            .next()
            .map(|v| ObjectRef::new(ObjectKind::VirtualMachine, v.vm))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::VirtualMachine, path))
    }

    async fn find_resource_pool(
        &self,
        datacenter: &str,
        cluster: &str,
        path: &str,
    ) -> GatewayResult<ObjectRef> {
        let dc = self.find_datacenter(datacenter).await?;
        let cluster = self.find_cluster(&dc, cluster).await?;
        let found: Vec<ResourcePoolSummary> = self
            .get_json(
                "/api/vcenter/resource-pool",
                &[
                    ("names", last_segment(path)),
                    ("clusters", cluster.as_str()),
                    ("datacenters", dc.as_str()),
                ],
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(|r| ObjectRef::new(ObjectKind::ResourcePool, r.resource_pool))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::ResourcePool, path))
    }

    async fn find_datastore(&self, datacenter: &str, path: &str) -> GatewayResult<ObjectRef> {
        let dc = self.find_datacenter(datacenter).await?;
        let found: Vec<DatastoreSummary> = self
            .get_json(
                "/api/vcenter/datastore",
                &[("names", last_segment(path)), ("datacenters", dc.as_str())],
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(|d| ObjectRef::new(ObjectKind::Datastore, d.datastore))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Datastore, path))
    }

    async fn find_host(&self, datacenter: &str, cluster: &str, name: &str) -> GatewayResult<ObjectRef> {
        let dc = self.find_datacenter(datacenter).await?;
        let cluster = self.find_cluster(&dc, cluster).await?;
        let found: Vec<HostSummary> = self
            .get_json(
                "/api/vcenter/host",
                &[
                    ("names", last_segment(name)),
                    ("clusters", cluster.as_str()),
                    ("datacenters", dc.as_str()),
                ],
            )
            .await?;
        found
            .into_iter()
            .next()
            .map(|h| ObjectRef::new(ObjectKind::Host, h.host))
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Host, name))
    }

    async fn find_library_item(&self, library: &str, item: &str) -> GatewayResult<ObjectRef> {
        let libraries = self
            .post_json(
                "/api/content/library",
                &[("action", "find")],
                &json!({ "name": library }),
            )
            .await?;
        let library_id = libraries
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(|id| id.as_str())
            .ok_or_else(|| GatewayError::not_found(ObjectKind::Library, library))?
            .to_string();

        let items = self
            .post_json(
                "/api/content/library/item",
                &[("action", "find")],
                &json!({ "library_id": library_id, "name": item }),
            )
            .await?;
        items
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(|id| id.as_str())
            .map(|id| ObjectRef::new(ObjectKind::LibraryItem, id))
            .ok_or_else(|| {
                GatewayError::not_found(ObjectKind::LibraryItem, format!("{}/{}", library, item))
            })
    }

    async fn list_children(&self, folder: &ObjectRef) -> GatewayResult<Vec<ObjectRef>> {
        let vms: Vec<VmListItem> = self
            .get_json("/api/vcenter/vm", &[("folders", folder.id.as_str())])
            .await?;
        let folders: Vec<FolderSummary> = self
            .get_json(
                "/api/vcenter/folder",
                &[("parent_folders", folder.id.as_str())],
            )
            .await?;
        Ok(vms
            .into_iter()
            .map(|v| ObjectRef::new(ObjectKind::VirtualMachine, v.vm))
            .chain(
                folders
                    .into_iter()
                    .map(|f| ObjectRef::new(ObjectKind::Folder, f.folder)),
            )
            .collect())
    }

    async fn vm_summary(&self, vm: &ObjectRef) -> GatewayResult<VmSummary> {
        let info: VmInfo = self
            .get_json(&format!("/api/vcenter/vm/{}", vm.id), &[])
            .await
            .map_err(|e| match e {
                GatewayError::Api { status: 404, .. } => {
                    GatewayError::not_found(ObjectKind::VirtualMachine, vm.id.as_str())
                }
                other => other,
            })?;
        let guest_net = self.guest_nics(vm).await?;
        Ok(VmSummary {
            reference: vm.clone(),
            name: info.name,
            power_state: PowerState::parse(&info.power_state),
            guest_net,
        })
    }

    async fn power_state(&self, vm: &ObjectRef) -> GatewayResult<PowerState> {
        #[derive(Deserialize)]
        struct PowerInfo {
            state: String,
        }
        let info: PowerInfo = self
            .get_json(&format!("/api/vcenter/vm/{}/power", vm.id), &[])
            .await?;
        Ok(PowerState::parse(&info.state))
    }

    async fn guest_nics(&self, vm: &ObjectRef) -> GatewayResult<Vec<GuestNic>> {
        let path = format!("/api/vcenter/vm/{}/guest/networking/interfaces", vm.id);
        match self.get_json::<Vec<GuestInterface>>(&path, &[]).await {
            Ok(ifaces) => Ok(ifaces.into_iter().map(GuestNic::from).collect()),
            // Guest tools not running or VM powered off: nothing reported yet.
            Err(GatewayError::Api { status, .. }) if status == 503 || status == 400 => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn submit_task(&self, request: TaskRequest) -> GatewayResult<TaskHandle> {
        let operation = request.operation();
        match request {
            TaskRequest::InstantClone {
                source,
                name,
                folder,
            } => {
                let body = json!({
                    "source": source.id,
                    "name": name,
                    "placement": { "folder": folder.id },
                });
                self.submit_async("/api/vcenter/vm", "instant-clone", body, operation)
                    .await
            }
            TaskRequest::Clone { source, name, spec } => {
                let body = json!({
                    "source": source.id,
                    "name": name,
                    "placement": {
                        "folder": spec.folder.id,
                        "host": spec.host.id,
                        "resource_pool": spec.resource_pool.id,
                        "datastore": spec.datastore.id,
                    },
                    "power_on": spec.power_on,
                    "hardware_customization": clone_hardware(&spec),
                });
                self.submit_async("/api/vcenter/vm", "clone", body, operation)
                    .await
            }
            TaskRequest::LibraryDeploy { item, name, spec } => {
                let body = json!({
                    "name": name,
                    "placement": {
                        "folder": spec.folder.id,
                        "host": spec.host.id,
                        "resource_pool": spec.resource_pool.id,
                    },
                    "disk_storage": { "datastore": spec.datastore.id },
                    "powered_on": spec.power_on,
                    "hardware_customization": clone_hardware(&spec),
                });
                let path = format!("/api/vcenter/vm-template/library-items/{}", item.id);
                self.submit_async(&path, "deploy", body, operation).await
            }
            TaskRequest::PowerOff { vm } => {
                let path = format!("/api/vcenter/vm/{}/power", vm.id);
                self.post_json(&path, &[("action", "stop")], &Value::Null)
                    .await
                    .map_err(|e| match e {
                        GatewayError::AlreadyInState(_) => GatewayError::AlreadyInState(vm.id.clone()),
                        other => other,
                    })?;
                Ok(TaskHandle::Completed { operation })
            }
            TaskRequest::Destroy { vm } => {
                let path = format!("/api/vcenter/vm/{}", vm.id);
                let resp = self.request(Method::DELETE, &path).send().await?;
                self.check(&format!("DELETE {}", path), resp).await?;
                Ok(TaskHandle::Completed { operation })
            }
        }
    }

    async fn wait_task(&self, task: &TaskHandle) -> GatewayResult<()> {
        let id = match task {
            TaskHandle::Completed { .. } => return Ok(()),
            TaskHandle::Pending { id, .. } => id,
        };
        let path = format!("/api/cis/tasks/{}", id);
        loop {
            let info: TaskInfo = self.get_json(&path, &[]).await?;
            match info.status.as_str() {
                "SUCCEEDED" => {
                    tracing::info!("✅ [vSphere API] Task {} ({}) succeeded", id, task.operation());
                    return Ok(());
                }
                "FAILED" => {
                    let message = info
                        .error
                        .as_ref()
                        .map(error_message)
                        .unwrap_or_else(|| "task failed".to_string());
                    return Err(GatewayError::TaskFailed {
                        task: id.clone(),
                        message,
                    });
                }
                _ => tokio::time::sleep(self.task_poll_interval).await,
            }
        }
    }

    async fn logout(&self) -> GatewayResult<()> {
        let resp = self.request(Method::DELETE, "/api/session").send().await?;
        self.check("DELETE /api/session", resp).await?;
        tracing::info!("✅ [vSphere API] Session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};

    async fn session(server: &mut ServerGuard) -> Arc<dyn HypervisorGateway> {
        server
            .mock("POST", "/api/session")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body("\"session-token\"")
            .create_async()
            .await;
        let url = server.url().replace("http://", "http://admin:secret@");
        VsphereConnector::new()
            .with_task_poll_interval(Duration::from_millis(5))
            .connect(&Endpoint {
                url: format!("{}/sdk", url),
                insecure: true,
            })
            .await
            .unwrap()
    }

    #[test]
    fn folder_components_needs_datacenter_and_folder() {
        assert_eq!(
            folder_components("/DC0/vm/"),
            Some(("DC0", vec!["vm"]))
        );
        assert_eq!(
            folder_components("/DC0/vm/runners"),
            Some(("DC0", vec!["vm", "runners"]))
        );
        assert_eq!(folder_components("/DC0"), None);
    }

    #[test]
    fn error_message_prefers_default_messages() {
        let err = json!({
            "error_type": "INVALID_ARGUMENT",
            "messages": [{ "default_message": "bad name" }]
        });
        assert_eq!(error_message(&err), "bad name");
        assert_eq!(error_message(&json!({ "error_type": "NOT_FOUND" })), "NOT_FOUND");
    }

    #[tokio::test]
    async fn login_rejected_is_session_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/session")
            .with_status(401)
            .with_body("{\"error_type\":\"UNAUTHENTICATED\"}")
            .create_async()
            .await;
        let url = server.url().replace("http://", "http://admin:wrong@");
        let err = VsphereConnector::new()
            .connect(&Endpoint {
                url,
                insecure: false,
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Session(_)));
    }

    #[tokio::test]
    async fn find_folder_walks_datacenter_then_folders() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        let dc = server
            .mock("GET", "/api/vcenter/datacenter")
            .match_query(Matcher::UrlEncoded("names".into(), "DC0".into()))
            .match_header(SESSION_HEADER, "session-token")
            .with_body(json!([{ "datacenter": "datacenter-1", "name": "DC0" }]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/api/vcenter/folder")
            .match_query(Matcher::UrlEncoded("names".into(), "vm".into()))
            .with_body(json!([{ "folder": "group-v3", "name": "vm" }]).to_string())
            .create_async()
            .await;

        let folder = gateway.find_folder("/DC0/vm/").await.unwrap();
        assert_eq!(folder, ObjectRef::new(ObjectKind::Folder, "group-v3"));
        dc.assert_async().await;
    }

    async fn datacenter_and_cluster(server: &mut ServerGuard) {
        server
            .mock("GET", "/api/vcenter/datacenter")
            .match_query(Matcher::UrlEncoded("names".into(), "DC0".into()))
            .with_body(json!([{ "datacenter": "datacenter-1", "name": "DC0" }]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/api/vcenter/cluster")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("names".into(), "DC0_C0".into()),
                Matcher::UrlEncoded("datacenters".into(), "datacenter-1".into()),
            ]))
            .with_body(json!([{ "cluster": "domain-c7", "name": "DC0_C0" }]).to_string())
            .create_async()
            .await;
    }

    #[tokio::test]
    async fn same_named_pools_resolve_within_cluster() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        datacenter_and_cluster(&mut server).await;
        let scoped = server
            .mock("GET", "/api/vcenter/resource-pool")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("names".into(), "Resources".into()),
                Matcher::UrlEncoded("clusters".into(), "domain-c7".into()),
                Matcher::UrlEncoded("datacenters".into(), "datacenter-1".into()),
            ]))
            .with_body(json!([{ "resource_pool": "resgroup-DC0_C0", "name": "Resources" }]).to_string())
            .expect(1)
            .create_async()
            .await;
        let unscoped = server
            .mock("GET", "/api/vcenter/resource-pool")
            .match_query(Matcher::Exact("names=Resources".into()))
            .with_body(
                json!([
                    { "resource_pool": "resgroup-OTHER-DC1", "name": "Resources" },
                    { "resource_pool": "resgroup-DC0_C0", "name": "Resources" }
                ])
                .to_string(),
            )
            .expect(0)
            .create_async()
            .await;

        let pool = gateway
            .find_resource_pool("DC0", "DC0_C0", "/DC0/host/DC0_C0/Resources")
            .await
            .unwrap();
        assert_eq!(pool, ObjectRef::new(ObjectKind::ResourcePool, "resgroup-DC0_C0"));
        scoped.assert_async().await;
        unscoped.assert_async().await;
    }

    #[tokio::test]
    async fn host_and_datastore_are_scoped_to_datacenter() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        datacenter_and_cluster(&mut server).await;
        server
            .mock("GET", "/api/vcenter/host")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("names".into(), "DC0_H0".into()),
                Matcher::UrlEncoded("clusters".into(), "domain-c7".into()),
                Matcher::UrlEncoded("datacenters".into(), "datacenter-1".into()),
            ]))
            .with_body(json!([{ "host": "host-21", "name": "DC0_H0" }]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/api/vcenter/datastore")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("names".into(), "LocalDS_0".into()),
                Matcher::UrlEncoded("datacenters".into(), "datacenter-1".into()),
            ]))
            .with_body(json!([{ "datastore": "datastore-61", "name": "LocalDS_0" }]).to_string())
            .create_async()
            .await;

        let host = gateway.find_host("DC0", "DC0_C0", "DC0_H0").await.unwrap();
        assert_eq!(host, ObjectRef::new(ObjectKind::Host, "host-21"));
        let ds = gateway
            .find_datastore("DC0", "/DC0/datastore/LocalDS_0")
            .await
            .unwrap();
        assert_eq!(ds, ObjectRef::new(ObjectKind::Datastore, "datastore-61"));
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        server
            .mock("GET", "/api/vcenter/datacenter")
            .match_query(Matcher::Any)
            .with_body(json!([{ "datacenter": "datacenter-1", "name": "DC0" }]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/api/vcenter/cluster")
            .match_query(Matcher::Any)
            .with_body("[]")
            .create_async()
            .await;
        let err = gateway
            .find_resource_pool("DC0", "nope", "Resources")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn missing_vm_is_not_found() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        server
            .mock("GET", "/api/vcenter/vm")
            .match_query(Matcher::Any)
            .with_body("[]")
            .create_async()
            .await;
        let err = gateway.find_vm("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn guest_nics_map_interfaces_and_tolerate_missing_tools() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        server
            .mock("GET", "/api/vcenter/vm/vm-42/guest/networking/interfaces")
            .with_body(
                json!([
                    { "mac_address": "00:50:56:01:02:03", "nic": "4000",
                      "ip": { "ip_addresses": [
                          { "ip_address": "fe80::1", "prefix_length": 64, "state": "PREFERRED" },
                          { "ip_address": "10.0.0.5", "prefix_length": 24, "state": "PREFERRED" }
                      ] } },
                    { "nic": "4001" }
                ])
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/vcenter/vm/vm-43/guest/networking/interfaces")
            .with_status(503)
            .with_body("{\"error_type\":\"SERVICE_UNAVAILABLE\"}")
            .create_async()
            .await;

        let nics = gateway
            .guest_nics(&ObjectRef::new(ObjectKind::VirtualMachine, "vm-42"))
            .await
            .unwrap();
        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].mac_address, "00:50:56:01:02:03");
        assert_eq!(
            nics[0].ip_config.as_ref().unwrap().addresses,
            vec!["fe80::1".to_string(), "10.0.0.5".to_string()]
        );
        assert!(nics[1].mac_address.is_empty());
        assert!(nics[1].ip_config.is_none());

        let none = gateway
            .guest_nics(&ObjectRef::new(ObjectKind::VirtualMachine, "vm-43"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn clone_task_is_polled_until_failure() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        server
            .mock("POST", "/api/vcenter/vm")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("action".into(), "instant-clone".into()),
                Matcher::UrlEncoded("vmw-tasks".into(), "true".into()),
            ]))
            .with_body("\"task-17\"")
            .create_async()
            .await;
        server
            .mock("GET", "/api/cis/tasks/task-17")
            .with_body(
                json!({
                    "status": "FAILED",
                    "error": { "error_type": "ALREADY_EXISTS",
                               "messages": [{ "default_message": "name in use" }] }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let handle = gateway
            .submit_task(TaskRequest::InstantClone {
                source: ObjectRef::new(ObjectKind::VirtualMachine, "vm-1"),
                name: "test-vm-x".to_string(),
                folder: ObjectRef::new(ObjectKind::Folder, "group-v3"),
            })
            .await
            .unwrap();
        assert_eq!(
            handle,
            TaskHandle::Pending {
                id: "task-17".to_string(),
                operation: "instant-clone"
            }
        );
        match gateway.wait_task(&handle).await {
            Err(GatewayError::TaskFailed { task, message }) => {
                assert_eq!(task, "task-17");
                assert_eq!(message, "name in use");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn power_off_already_off_is_typed() {
        let mut server = Server::new_async().await;
        let gateway = session(&mut server).await;
        server
            .mock("POST", "/api/vcenter/vm/vm-9/power")
            .match_query(Matcher::UrlEncoded("action".into(), "stop".into()))
            .with_status(400)
            .with_body("{\"error_type\":\"ALREADY_IN_DESIRED_STATE\"}")
            .create_async()
            .await;
        let err = gateway
            .submit_task(TaskRequest::PowerOff {
                vm: ObjectRef::new(ObjectKind::VirtualMachine, "vm-9"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyInState(id) if id == "vm-9"));
    }
}
