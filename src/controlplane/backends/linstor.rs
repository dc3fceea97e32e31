//! LINSTOR Storage Adapter
//!
//! Talks to the LINSTOR controller REST API (v1). Resource definitions,
//! volume definitions and external files map one to one onto the
//! [`StorageBackend`] port.

use crate::domain::ports::{
    DeployedVolume, ExternalFile, ResourceDefinition, ResourceGroup, ResourceWithVolumes,
    StorageBackend, VolumeDefinition,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Bit set in `ret_code` of every failed API call
const MASK_ERROR: i64 = i64::MIN >> 1;

/// Numeric part of the FAIL_EXISTS_* return codes
const FAIL_EXISTS_CODES: std::ops::RangeInclusive<i64> = 1001..=1099;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the LINSTOR adapter
#[derive(Debug, Clone)]
pub struct LinstorConfig {
    /// Controller base URL
    pub endpoint: String,
    /// Per request timeout
    pub timeout: Duration,
}

impl Default for LinstorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3370".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiCallRc {
    ret_code: i64,
    #[serde(default)]
    message: String,
}

impl ApiCallRc {
    fn is_error(&self) -> bool {
        self.ret_code & MASK_ERROR == MASK_ERROR
    }

    fn is_exists(&self) -> bool {
        self.is_error() && FAIL_EXISTS_CODES.contains(&(self.ret_code & 0xFFFF))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SelectFilter {
    #[serde(default)]
    place_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceGroupWire {
    name: String,
    #[serde(default)]
    select_filter: SelectFilter,
    #[serde(default)]
    props: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ResourceDefinitionCreate<'a> {
    resource_definition: ResourceDefinitionWire<'a>,
}

#[derive(Debug, Serialize)]
struct ResourceDefinitionWire<'a> {
    name: &'a str,
    resource_group_name: &'a str,
}

#[derive(Debug, Serialize)]
struct ResourceDefinitionModify {
    override_props: BTreeMap<String, String>,
    delete_props: Vec<String>,
}

#[derive(Debug, Serialize)]
struct VolumeDefinitionCreate<'a> {
    volume_definition: &'a VolumeDefinition,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceStateWire {
    in_use: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct VolumeStateWire {
    #[serde(default)]
    disk_state: String,
}

#[derive(Debug, Deserialize)]
struct VolumeWire {
    volume_number: u32,
    #[serde(default)]
    device_path: String,
    #[serde(default)]
    props: BTreeMap<String, String>,
    #[serde(default)]
    state: VolumeStateWire,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct ResourceWire {
    name: String,
    node_name: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    state: ResourceStateWire,
    #[serde(default)]
    volumes: Vec<VolumeWire>,
}

impl From<ResourceWire> for ResourceWithVolumes {
    fn from(r: ResourceWire) -> Self {
        let mut volumes: Vec<DeployedVolume> = r
            .volumes
            .into_iter()
            .map(|v| DeployedVolume {
                volume_number: v.volume_number,
                device_path: v.device_path,
                disk_state: v.state.disk_state,
                props: v.props,
                uuid: v.uuid,
            })
            .collect();
        volumes.sort_by_key(|v| v.volume_number);

        Self {
            name: r.name,
            node_name: r.node_name,
            uuid: r.uuid,
            in_use: r.state.in_use,
            volumes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExternalFileWire {
    path: String,
    #[serde(default)]
    content: String,
}

impl ExternalFileWire {
    fn decode(self) -> Result<ExternalFile> {
        let content = STANDARD
            .decode(self.content.as_bytes())
            .map_err(|e| Error::backend("decode external file", e))?;
        Ok(ExternalFile {
            path: self.path,
            content,
        })
    }
}

// =============================================================================
// LINSTOR Adapter
// =============================================================================

/// Adapter for a LINSTOR controller
pub struct LinstorBackend {
    config: LinstorConfig,
    http: Client,
}

impl LinstorBackend {
    /// Create a new LINSTOR adapter
    pub fn new(config: LinstorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    /// Send a request and decode the answer.
    ///
    /// `kind` and `name` describe the addressed object in not-found and
    /// already-exists errors.
    async fn execute_request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        kind: &str,
        name: &str,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!("LINSTOR request: {} {}", method, path);

        let mut req = self.http.request(method.clone(), self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::ResourceNotFound {
                kind: kind.into(),
                name: name.into(),
            });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let rcs: Vec<ApiCallRc> = serde_json::from_str(&text).unwrap_or_default();

            if status == StatusCode::CONFLICT || rcs.iter().any(ApiCallRc::is_exists) {
                return Err(Error::ResourceExists {
                    kind: kind.into(),
                    name: name.into(),
                });
            }

            let reason = rcs
                .iter()
                .filter(|rc| rc.is_error())
                .map(|rc| rc.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::backend(
                format!("{} {}", method, path),
                if reason.is_empty() {
                    format!("{}: {}", status, text)
                } else {
                    format!("{}: {}", status, reason)
                },
            ));
        }

        Ok(response.json::<T>().await?)
    }

    /// Send a mutating request, checking the returned API call results
    async fn execute_call<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        kind: &str,
        name: &str,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let rcs: Vec<ApiCallRc> = self
            .execute_request(method.clone(), path, body, kind, name)
            .await?;

        if rcs.iter().any(ApiCallRc::is_exists) {
            return Err(Error::ResourceExists {
                kind: kind.into(),
                name: name.into(),
            });
        }

        if let Some(rc) = rcs.iter().find(|rc| rc.is_error()) {
            return Err(Error::backend(format!("{} {}", method, path), &rc.message));
        }

        Ok(())
    }

    fn file_path(path: &str) -> String {
        format!("/v1/files/{}", urlencoding::encode(path))
    }
}

#[async_trait]
impl StorageBackend for LinstorBackend {
    async fn create_resource_group(&self, group: &ResourceGroup) -> Result<()> {
        let body = ResourceGroupWire {
            name: group.name.clone(),
            select_filter: SelectFilter {
                place_count: group.place_count,
            },
            props: group.props.clone(),
        };

        self.execute_call(Method::POST, "/v1/resource-groups", Some(&body), "ResourceGroup", &group.name)
            .await
    }

    async fn get_resource_group(&self, name: &str) -> Result<ResourceGroup> {
        let path = format!("/v1/resource-groups/{}", name);
        let rg: ResourceGroupWire = self
            .execute_request(Method::GET, &path, None::<&()>, "ResourceGroup", name)
            .await?;

        Ok(ResourceGroup {
            name: rg.name,
            place_count: rg.select_filter.place_count,
            props: rg.props,
        })
    }

    async fn create_resource_definition(&self, name: &str, resource_group: &str) -> Result<()> {
        let body = ResourceDefinitionCreate {
            resource_definition: ResourceDefinitionWire {
                name,
                resource_group_name: resource_group,
            },
        };

        self.execute_call(
            Method::POST,
            "/v1/resource-definitions",
            Some(&body),
            "ResourceDefinition",
            name,
        )
        .await
    }

    async fn get_resource_definition(&self, name: &str) -> Result<ResourceDefinition> {
        let path = format!("/v1/resource-definitions/{}", name);
        self.execute_request(Method::GET, &path, None::<&()>, "ResourceDefinition", name)
            .await
    }

    async fn delete_resource_definition(&self, name: &str) -> Result<()> {
        let path = format!("/v1/resource-definitions/{}", name);
        self.execute_call(Method::DELETE, &path, None::<&()>, "ResourceDefinition", name)
            .await
    }

    async fn modify_resource_definition(
        &self,
        name: &str,
        set: BTreeMap<String, String>,
        delete: Vec<String>,
    ) -> Result<()> {
        let path = format!("/v1/resource-definitions/{}", name);
        let body = ResourceDefinitionModify {
            override_props: set,
            delete_props: delete,
        };

        self.execute_call(Method::PUT, &path, Some(&body), "ResourceDefinition", name)
            .await
    }

    async fn create_volume_definition(
        &self,
        resource: &str,
        volume: &VolumeDefinition,
    ) -> Result<()> {
        let path = format!("/v1/resource-definitions/{}/volume-definitions", resource);
        let body = VolumeDefinitionCreate {
            volume_definition: volume,
        };
        let name = format!("{}/{}", resource, volume.volume_number);

        self.execute_call(Method::POST, &path, Some(&body), "VolumeDefinition", &name)
            .await
    }

    async fn list_volume_definitions(&self, resource: &str) -> Result<Vec<VolumeDefinition>> {
        let path = format!("/v1/resource-definitions/{}/volume-definitions", resource);
        let mut vds: Vec<VolumeDefinition> = self
            .execute_request(Method::GET, &path, None::<&()>, "ResourceDefinition", resource)
            .await?;

        vds.sort_by_key(|vd| vd.volume_number);
        Ok(vds)
    }

    async fn delete_volume_definition(&self, resource: &str, volume_number: u32) -> Result<()> {
        let path = format!(
            "/v1/resource-definitions/{}/volume-definitions/{}",
            resource, volume_number
        );
        let name = format!("{}/{}", resource, volume_number);

        self.execute_call(Method::DELETE, &path, None::<&()>, "VolumeDefinition", &name)
            .await
    }

    async fn autoplace(&self, resource: &str) -> Result<()> {
        let path = format!("/v1/resource-definitions/{}/autoplace", resource);
        let body = serde_json::json!({ "select_filter": {} });

        self.execute_call(Method::POST, &path, Some(&body), "Resource", resource)
            .await
    }

    async fn resource_view(&self, resource: &str) -> Result<Vec<ResourceWithVolumes>> {
        let path = format!("/v1/view/resources?resources={}", urlencoding::encode(resource));
        let resources: Vec<ResourceWire> = self
            .execute_request(Method::GET, &path, None::<&()>, "Resource", resource)
            .await?;

        Ok(resources
            .into_iter()
            .filter(|r| r.name == resource)
            .map(ResourceWithVolumes::from)
            .collect())
    }

    async fn list_external_files(&self) -> Result<Vec<ExternalFile>> {
        let files: Vec<ExternalFileWire> = self
            .execute_request(Method::GET, "/v1/files?content=true", None::<&()>, "ExternalFile", "*")
            .await?;

        files.into_iter().map(ExternalFileWire::decode).collect()
    }

    async fn get_external_file(&self, path: &str) -> Result<ExternalFile> {
        let file: ExternalFileWire = self
            .execute_request(Method::GET, &Self::file_path(path), None::<&()>, "ExternalFile", path)
            .await?;

        file.decode()
    }

    async fn put_external_file(&self, file: &ExternalFile) -> Result<()> {
        let body = ExternalFileWire {
            path: file.path.clone(),
            content: STANDARD.encode(&file.content),
        };

        self.execute_call(
            Method::PUT,
            &Self::file_path(&file.path),
            Some(&body),
            "ExternalFile",
            &file.path,
        )
        .await
    }

    async fn delete_external_file(&self, path: &str) -> Result<()> {
        self.execute_call(Method::DELETE, &Self::file_path(path), None::<&()>, "ExternalFile", path)
            .await
    }

    async fn attach_external_file(&self, resource: &str, path: &str) -> Result<()> {
        let url = format!(
            "/v1/resource-definitions/{}/files/{}",
            resource,
            urlencoding::encode(path)
        );
        self.execute_call(Method::POST, &url, None::<&()>, "ExternalFile", path)
            .await
    }

    async fn detach_external_file(&self, resource: &str, path: &str) -> Result<()> {
        let url = format!(
            "/v1/resource-definitions/{}/files/{}",
            resource,
            urlencoding::encode(path)
        );
        self.execute_call(Method::DELETE, &url, None::<&()>, "ExternalFile", path)
            .await
    }
}
