//! Provisioner registry and dispatch.
//!
//! Provisioners are matched against a resource's (type, class, id) by a
//! linear scan of the registry; the first match wins and newly added
//! provisioners are prepended, so later registrations override earlier ones.
//!
//! # Wire Protocol
//!
//! Every dispatch kind receives the same JSON request envelope and answers
//! with the same response envelope:
//!
//! ```text
//! request:  {resource_uid, resource_type, resource_class, resource_id,
//!            resource_params?, resource_metadata, state, shared}
//! response: {state?, values?, secrets?, shared?}
//! ```
//!
//! `resource_params` is omitted for deprovisioning, and a deprovision response
//! may only carry `shared`.
mod command;
mod http;

pub(crate) use command::resolve_binary;

use crate::config::EngineConfig;
use crate::error::{Error, Result, ValidationError};
use crate::state::{ResourceState, ResourceUid};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable carrying the mode token for command provisioners.
pub const MODE_ENV: &str = "SCORE_FLY_PROVISIONER_MODE";

/// Header carrying the mode token for http provisioners.
pub const MODE_HEADER: &str = "X-Score-Fly-Mode";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provisioner {
    pub id: String,
    pub resource_type: String,
    /// Empty matches any class.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_class: String,
    /// Empty matches any id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Fixed values; never fails, deprovision is a no-op.
    Static { values: Map<String, Value> },
    /// Local executable fed the request on stdin.
    Cmd {
        binary: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
    /// Endpoint receiving the request as a POST body.
    Http { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Provision,
    Deprovision,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Provision => "provision",
            Mode::Deprovision => "deprovision",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub resource_uid: String,
    pub resource_type: String,
    pub resource_class: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_params: Option<Map<String, Value>>,
    pub resource_metadata: Map<String, Value>,
    pub state: Map<String, Value>,
    pub shared: Value,
}

impl ProvisionRequest {
    pub fn new(uid: &ResourceUid, resource: &ResourceState, shared: &Value, mode: Mode) -> Self {
        let resource_params = match mode {
            Mode::Provision => Some(resource.resolved_params.clone().unwrap_or_default()),
            Mode::Deprovision => None,
        };
        ProvisionRequest {
            resource_uid: uid.to_string(),
            resource_type: resource.res_type.clone(),
            resource_class: resource.class.clone(),
            resource_id: resource.id.clone(),
            resource_params,
            resource_metadata: resource.metadata.clone(),
            state: resource.state.clone(),
            shared: shared.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Map<String, Value>>,
    /// Merge-patch for the project's shared state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<Value>,
}

impl Provisioner {
    pub fn matches(&self, res_type: &str, class: &str, id: &str) -> bool {
        self.resource_type == res_type
            && (self.resource_class.is_empty() || self.resource_class == class)
            && (self.resource_id.is_empty() || self.resource_id == id)
    }

    pub fn describe(&self) -> String {
        let pattern = format!(
            "{}.{}#{}",
            self.resource_type,
            or_wildcard(&self.resource_class),
            or_wildcard(&self.resource_id)
        );
        let target = match &self.dispatch {
            Dispatch::Static { values } => format!("static ({} values)", values.len()),
            Dispatch::Cmd { binary, args } if args.is_empty() => format!("cmd {binary}"),
            Dispatch::Cmd { binary, args } => format!("cmd {binary} {}", args.join(" ")),
            Dispatch::Http { url } => format!("http {url}"),
        };
        format!("{} ({pattern}) {target}", self.id)
    }

    /// Run a provision call and decode the response envelope.
    pub fn provision(
        &self,
        uid: &ResourceUid,
        request: &ProvisionRequest,
        config: &EngineConfig,
    ) -> Result<ProvisionResponse> {
        if let Dispatch::Static { values } = &self.dispatch {
            return Ok(ProvisionResponse {
                values: Some(values.clone()),
                ..ProvisionResponse::default()
            });
        }
        let raw = self.exchange(uid, request, Mode::Provision, config)?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::provision(uid, &self.id, "provision request returned no output"));
        }
        decode_response(&raw).map_err(|message| Error::provision(uid, &self.id, message))
    }

    /// Run a deprovision call; the response may only carry a shared patch.
    pub fn deprovision(
        &self,
        uid: &ResourceUid,
        request: &ProvisionRequest,
        config: &EngineConfig,
    ) -> Result<Option<Value>> {
        if let Dispatch::Static { .. } = &self.dispatch {
            return Ok(None);
        }
        let raw = self.exchange(uid, request, Mode::Deprovision, config)?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let response =
            decode_response(&raw).map_err(|message| Error::provision(uid, &self.id, message))?;
        if response.state.is_some() || response.values.is_some() || response.secrets.is_some() {
            return Err(Error::provision(
                uid,
                &self.id,
                "deprovision response cannot include state, values, or secrets",
            ));
        }
        Ok(response.shared)
    }

    fn exchange(
        &self,
        uid: &ResourceUid,
        request: &ProvisionRequest,
        mode: Mode,
        config: &EngineConfig,
    ) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(request)
            .map_err(|err| Error::provision(uid, &self.id, format!("encode request: {err}")))?;
        let outcome = match &self.dispatch {
            Dispatch::Static { .. } => Ok(Vec::new()),
            Dispatch::Cmd { binary, args } => {
                command::run(binary, args, mode, &body, config.dispatch_timeout)
            }
            Dispatch::Http { url } => http::post(url, mode, &body, config.dispatch_timeout),
        };
        outcome.map_err(|err| Error::provision(uid, &self.id, format!("{err:#}")))
    }
}

fn or_wildcard(pattern: &str) -> &str {
    if pattern.is_empty() {
        "*"
    } else {
        pattern
    }
}

fn decode_response(raw: &[u8]) -> std::result::Result<ProvisionResponse, String> {
    let response: ProvisionResponse = serde_json::from_slice(raw).map_err(|err| {
        tracing::debug!(raw = %String::from_utf8_lossy(raw), "invalid provisioner response");
        format!("failed to decode provisioner response: {err}")
    })?;
    if let Some(shared) = &response.shared {
        if !shared.is_object() && !shared.is_null() {
            return Err("shared state patch must be a JSON object".to_string());
        }
    }
    Ok(response)
}

/// First provisioner, in precedence order, matching the resource.
pub fn find_provisioner<'a>(
    provisioners: &'a [Provisioner],
    res_type: &str,
    class: &str,
    id: &str,
) -> Option<&'a Provisioner> {
    provisioners
        .iter()
        .find(|provisioner| provisioner.matches(res_type, class, id))
}

/// Validate a registration before it is stored.
pub fn validate_provisioner(provisioner: &Provisioner) -> std::result::Result<(), ValidationError> {
    let mut problems = Vec::new();
    if provisioner.id.trim().is_empty() {
        problems.push("provisioner id must be non-empty".to_string());
    }
    if provisioner.resource_type.trim().is_empty() {
        problems.push("provisioner resource type must be non-empty".to_string());
    }
    match &provisioner.dispatch {
        Dispatch::Static { .. } => {}
        Dispatch::Cmd { binary, .. } => {
            if binary.trim().is_empty() {
                problems.push("cmd provisioner binary must be non-empty".to_string());
            }
        }
        Dispatch::Http { url } => {
            let has_scheme = url
                .parse::<ureq::http::Uri>()
                .map(|uri| uri.scheme().is_some() && uri.host().is_some())
                .unwrap_or(false);
            if !has_scheme {
                problems.push(format!("invalid url '{url}' for an http provisioner"));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { problems })
    }
}

/// Register a provisioner ahead of all existing ones.
///
/// Any existing registration with the same id, or with the same
/// (type, class, id) pattern, is replaced.
pub fn add_provisioner(
    provisioners: &mut Vec<Provisioner>,
    provisioner: Provisioner,
) -> std::result::Result<(), ValidationError> {
    validate_provisioner(&provisioner)?;
    provisioners.retain(|existing| {
        let same_id = existing.id == provisioner.id;
        let same_pattern = existing.resource_type == provisioner.resource_type
            && existing.resource_class == provisioner.resource_class
            && existing.resource_id == provisioner.resource_id;
        if same_id || same_pattern {
            tracing::info!(id = %existing.id, "replacing existing provisioner");
        }
        !(same_id || same_pattern)
    });
    provisioners.insert(0, provisioner);
    Ok(())
}

pub fn remove_provisioner(provisioners: &mut Vec<Provisioner>, id: &str) -> bool {
    let before = provisioners.len();
    provisioners.retain(|existing| existing.id != id);
    provisioners.len() != before
}
