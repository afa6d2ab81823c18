//! JSON-RPC 2.0 front end for the IPAM engine
//!
//! One server instance serves one authenticated caller, typically a
//! session on the stdio transport. Requests are routed by method name to
//! the matching [`Ipam`] operation; engine failures come back as JSON-RPC
//! errors carrying the machine-readable kind.
//!
//! # Error codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | -32700 | Parse error |
//! | -32600 | Invalid request |
//! | -32601 | Method not found |
//! | -32602 | Invalid params |
//! | -32603 | Internal error |
//! | -32003 | Forbidden |
//! | -32000 | Any other engine error, `data.kind` names it |
//!
//! # Examples
//!
//! ```
//! use ipam_core::Caller;
//! use ipam_engine::Ipam;
//! use ipam_rpc::IpamServer;
//! use ipam_store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ipam = Arc::new(Ipam::new(MemoryStore::new()));
//! let server = IpamServer::new(ipam, Caller::member_of(["org_a"]));
//!
//! let request = r#"{
//!     "jsonrpc": "2.0",
//!     "method": "create_subnet",
//!     "params": {"cidr": "10.0.0.0/24", "name": "Office"},
//!     "id": 1
//! }"#;
//!
//! let response = server.handle_request(request).await?;
//! println!("Response: {}", response);
//! # Ok(())
//! # }
//! ```

pub mod transport;

use ipam_core::{AddressId, Caller, IpamError, OrgId, SubnetId};
use ipam_engine::{Ipam, SubnetUpdate};
use ipam_store::Store;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use transport::StdioTransport;

/// Host listing page size when none is given
pub const DEFAULT_HOSTS_LIMIT: usize = 256;

/// RPC server errors
#[derive(Error, Debug)]
pub enum RpcError {
    /// Request is not valid JSON
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Request is not a valid JSON-RPC 2.0 request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Method not found
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Params missing or of the wrong shape
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Engine refused the operation
    #[error(transparent)]
    Ipam(#[from] IpamError),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    fn new(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

impl From<&RpcError> for JsonRpcError {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::ParseError(_) => Self::new(-32700, err.to_string()),
            RpcError::InvalidRequest(_) => Self::new(-32600, err.to_string()),
            RpcError::MethodNotFound(_) => Self::new(-32601, err.to_string()),
            RpcError::InvalidParams(_) => Self::new(-32602, err.to_string()),
            RpcError::InternalError(_) => Self::new(-32603, err.to_string()),
            RpcError::Ipam(inner) => Self {
                code: match inner {
                    IpamError::Forbidden => -32003,
                    _ => -32000,
                },
                message: inner.to_string(),
                data: Some(serde_json::json!({ "kind": inner.kind() })),
            },
        }
    }
}

impl JsonRpcResponse {
    fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: serde_json::Value, err: &RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(err.into()),
            id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubnetParams {
    subnet: SubnetId,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: SubnetId,
}

#[derive(Debug, Deserialize)]
struct CreateSubnetParams {
    cidr: String,
    #[serde(default)]
    name: String,
    organization: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateSubnetParams {
    id: SubnetId,
    #[serde(flatten)]
    update: SubnetUpdate,
}

#[derive(Debug, Deserialize)]
struct DeleteSubnetParams {
    id: SubnetId,
    #[serde(default)]
    cascade: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    ip: IpAddr,
    organization: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestIpParams {
    subnet: SubnetId,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReserveIpParams {
    ip: IpAddr,
    subnet: Option<SubnetId>,
    organization: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressParams {
    id: AddressId,
}

#[derive(Debug, Deserialize)]
struct UpdateIpParams {
    id: AddressId,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostsParams {
    subnet: SubnetId,
    #[serde(default, deserialize_with = "host_offset")]
    offset: u128,
    limit: Option<usize>,
}

/// Host offset as a JSON number, or a decimal string past 2^64
#[derive(Deserialize)]
#[serde(untagged)]
enum HostOffset {
    Number(u64),
    Decimal(String),
}

fn host_offset<'de, D>(deserializer: D) -> std::result::Result<u128, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match HostOffset::deserialize(deserializer)? {
        HostOffset::Number(n) => Ok(u128::from(n)),
        HostOffset::Decimal(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct ImportParams {
    document: String,
    organization: Option<String>,
}

/// JSON-RPC server bound to one caller
pub struct IpamServer<S> {
    ipam: Arc<Ipam<S>>,
    caller: Caller,
}

impl<S: Store> IpamServer<S> {
    /// Create a server acting on behalf of `caller`
    pub fn new(ipam: Arc<Ipam<S>>, caller: Caller) -> Self {
        Self { ipam, caller }
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Handle a JSON-RPC 2.0 request
    ///
    /// Every failure, including unparsable input, is reported inside the
    /// returned response; `Err` only means the response itself could not
    /// be serialized.
    ///
    /// # Arguments
    ///
    /// * `request_str` - JSON-RPC request as string
    pub async fn handle_request(&self, request_str: &str) -> Result<String> {
        let response = match serde_json::from_str::<serde_json::Value>(request_str) {
            Err(e) => JsonRpcResponse::failure(
                serde_json::Value::Null,
                &RpcError::ParseError(e.to_string()),
            ),
            Ok(value) => self.handle_value(value).await,
        };

        serde_json::to_string(&response).map_err(|e| RpcError::InternalError(e.to_string()))
    }

    async fn handle_value(&self, value: serde_json::Value) -> JsonRpcResponse {
        let id = value.get("id").cloned().unwrap_or(serde_json::Value::Null);

        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return JsonRpcResponse::failure(id, &RpcError::InvalidRequest(e.to_string()))
            }
        };

        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::failure(
                request.id,
                &RpcError::InvalidRequest("Invalid JSON-RPC version".to_string()),
            );
        }

        debug!(method = %request.method, "Handling request");
        match self.dispatch(&request.method, &request.params).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(err) => JsonRpcResponse::failure(request.id, &err),
        }
    }

    async fn dispatch(&self, method: &str, params: &serde_json::Value) -> Result<serde_json::Value> {
        let ipam = &self.ipam;
        let caller = &self.caller;

        match method {
            "ping" => Ok(serde_json::json!({"status": "ok"})),
            "list_subnets" => to_json(ipam.visible_subnets(caller).await?),
            "get_subnet" => {
                let p: IdParams = parse_params(params)?;
                to_json(ipam.subnet(caller, p.id).await?)
            }
            "create_subnet" => {
                let p: CreateSubnetParams = parse_params(params)?;
                let organization = self.organization(p.organization);
                to_json(ipam.create_subnet(caller, organization, &p.cidr, &p.name).await?)
            }
            "update_subnet" => {
                let p: UpdateSubnetParams = parse_params(params)?;
                to_json(ipam.update_subnet(caller, p.id, p.update).await?)
            }
            "delete_subnet" => {
                let p: DeleteSubnetParams = parse_params(params)?;
                let removed = ipam.delete_subnet(caller, p.id, p.cascade).await?;
                Ok(serde_json::json!({ "deleted": p.id, "addresses_removed": removed }))
            }
            "subnet_children" => {
                let p: IdParams = parse_params(params)?;
                to_json(ipam.children(caller, p.id).await?)
            }
            "subnet_parent" => {
                let p: IdParams = parse_params(params)?;
                to_json(ipam.parent(caller, p.id).await?)
            }
            "resolve_subnet" => {
                let p: ResolveParams = parse_params(params)?;
                let organization = self.organization(p.organization);
                to_json(
                    ipam.resolve_owning_subnet(caller, organization.as_ref(), p.ip)
                        .await?,
                )
            }
            "next_available" => {
                let p: SubnetParams = parse_params(params)?;
                let ip = ipam.next_available(caller, p.subnet).await?;
                Ok(serde_json::json!({ "subnet": p.subnet, "ip_address": ip }))
            }
            "request_ip" => {
                let p: RequestIpParams = parse_params(params)?;
                to_json(ipam.request_address(caller, p.subnet, p.description).await?)
            }
            "reserve_ip" => {
                let p: ReserveIpParams = parse_params(params)?;
                let record = match p.subnet {
                    Some(subnet) => ipam.reserve(caller, subnet, p.ip, p.description).await?,
                    None => {
                        let organization = self.organization(p.organization);
                        ipam.create_address(caller, organization, p.ip, p.description)
                            .await?
                    }
                };
                to_json(record)
            }
            "update_ip" => {
                let p: UpdateIpParams = parse_params(params)?;
                to_json(ipam.update_description(caller, p.id, p.description).await?)
            }
            "release_ip" => {
                let p: AddressParams = parse_params(params)?;
                to_json(ipam.release_address(caller, p.id).await?)
            }
            "list_addresses" => {
                let p: SubnetParams = parse_params(params)?;
                to_json(ipam.addresses(caller, p.subnet).await?)
            }
            "get_address" => {
                let p: AddressParams = parse_params(params)?;
                to_json(ipam.address(caller, p.id).await?)
            }
            "hosts" => {
                let p: HostsParams = parse_params(params)?;
                let limit = p.limit.unwrap_or(DEFAULT_HOSTS_LIMIT);
                to_json(ipam.hosts(caller, p.subnet, p.offset, limit).await?)
            }
            "usage" => {
                let p: SubnetParams = parse_params(params)?;
                to_json(ipam.usage(caller, p.subnet).await?)
            }
            "import_subnet" => {
                let p: ImportParams = parse_params(params)?;
                let organization = p.organization.map(OrgId::from);
                to_json(
                    ipam.import_document(caller, organization, p.document.as_bytes())
                        .await?,
                )
            }
            "export_subnet" => {
                let p: SubnetParams = parse_params(params)?;
                let bytes = ipam.export_subnet(caller, p.subnet).await?;
                let document =
                    String::from_utf8(bytes).map_err(|e| RpcError::InternalError(e.to_string()))?;
                Ok(serde_json::json!({ "subnet": p.subnet, "document": document }))
            }
            _ => Err(RpcError::MethodNotFound(method.to_string())),
        }
    }

    /// Named owner, else the caller's only organization
    fn organization(&self, requested: Option<String>) -> Option<OrgId> {
        requested
            .map(OrgId::from)
            .or_else(|| self.caller.default_organization())
    }
}

fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T> {
    let params = match params {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}
