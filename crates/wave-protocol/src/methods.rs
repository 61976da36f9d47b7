//! RPC method names and their typed request/response payloads.
//!
//! Event methods carry the broker's own `WaveEvent` and
//! `SubscriptionRequest` types as data and have no wrapper here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wave_types::{Block, BlockDef, MetaMap, ORef, RuntimeOpts, TermSize};

pub const AUTHENTICATE: &str = "authenticate";
pub const ROUTE_ANNOUNCE: &str = "routeannounce";
pub const GET_OBJECT: &str = "getobject";
pub const GET_META: &str = "getmeta";
pub const SET_META: &str = "setmeta";
pub const RESOLVE_IDS: &str = "resolveids";
pub const CREATE_BLOCK: &str = "createblock";
pub const DELETE_BLOCK: &str = "deleteblock";
pub const CREATE_TAB: &str = "createtab";
pub const DELETE_TAB: &str = "deletetab";
pub const SET_VIEW: &str = "setview";
pub const BLOCK_INFO: &str = "blockinfo";
pub const EVENT_PUBLISH: &str = "eventpublish";
pub const EVENT_SUB: &str = "eventsub";
pub const EVENT_UNSUB: &str = "eventunsub";
pub const EVENT_UNSUB_ALL: &str = "eventunsuball";
pub const EVENT_READ_HISTORY: &str = "eventreadhistory";
/// Pushed by the server to subscribed peers; data is a `WaveEvent`.
pub const EVENT_RECV: &str = "eventrecv";
pub const CONTROLLER_STOP: &str = "controllerstop";
pub const CONTROLLER_RESYNC: &str = "controllerresync";
pub const CONTROLLER_STATUS: &str = "controllerstatus";
pub const CONTROLLER_INPUT: &str = "controllerinput";
pub const SET_CONFIG: &str = "setconfig";
pub const CONN_STATUS: &str = "connstatus";
// connection methods take the connection name as their data
pub const CONN_ENSURE: &str = "connensure";
pub const CONN_CONNECT: &str = "connconnect";
pub const CONN_DISCONNECT: &str = "conndisconnect";
pub const CONN_REINSTALL_WSH: &str = "connreinstallwsh";
pub const CONN_LIST: &str = "connlist";
pub const MESSAGE: &str = "message";
pub const TEST: &str = "test";
pub const STREAM_TEST: &str = "streamtest";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    #[serde(rename = "routeid")]
    pub route_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAnnounceRequest {
    #[serde(rename = "routeid")]
    pub route_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ORefRequest {
    pub oref: ORef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetMetaRequest {
    pub oref: ORef,
    pub meta: MetaMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveIdsRequest {
    /// Block the caller runs in; resolves `this` and `tab`.
    #[serde(default, rename = "blockid", skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveIdsResponse {
    #[serde(rename = "resolvedids")]
    pub resolved_ids: BTreeMap<String, ORef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateBlockRequest {
    #[serde(rename = "tabid")]
    pub tab_id: String,
    #[serde(rename = "blockdef")]
    pub block_def: BlockDef,
    #[serde(default, rename = "rtopts", skip_serializing_if = "Option::is_none")]
    pub runtime_opts: Option<RuntimeOpts>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIdRequest {
    #[serde(rename = "blockid")]
    pub block_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTabRequest {
    #[serde(rename = "workspaceid")]
    pub workspace_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTabRequest {
    #[serde(rename = "workspaceid")]
    pub workspace_id: String,
    #[serde(rename = "tabid")]
    pub tab_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetViewRequest {
    #[serde(rename = "blockid")]
    pub block_id: String,
    pub view: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockInfoResponse {
    #[serde(rename = "blockid")]
    pub block_id: String,
    #[serde(rename = "tabid")]
    pub tab_id: Option<String>,
    #[serde(rename = "windowid")]
    pub window_id: Option<String>,
    pub block: Block,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReadHistoryRequest {
    pub event: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_history_items", rename = "maxitems")]
    pub max_items: usize,
}

fn default_history_items() -> usize {
    10
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerResyncRequest {
    #[serde(rename = "blockid")]
    pub block_id: String,
    #[serde(default, rename = "forcerestart")]
    pub force_restart: bool,
    #[serde(default, rename = "rtopts", skip_serializing_if = "Option::is_none")]
    pub runtime_opts: Option<RuntimeOpts>,
}

/// Input for a block's running controller. Any combination of fields may
/// be set; `inputdata64` is base64.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInputRequest {
    #[serde(rename = "blockid")]
    pub block_id: String,
    #[serde(default, rename = "inputdata64", skip_serializing_if = "Option::is_none")]
    pub input_data64: Option<String>,
    #[serde(default, rename = "signame", skip_serializing_if = "Option::is_none")]
    pub sig_name: Option<String>,
    #[serde(default, rename = "termsize", skip_serializing_if = "Option::is_none")]
    pub term_size: Option<TermSize>,
}

/// Lifecycle state of one block controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockControllerStatus {
    #[serde(rename = "blockid")]
    pub block_id: String,
    /// `init`, `running` or `done`.
    #[serde(rename = "shellprocstatus")]
    pub shell_proc_status: String,
    pub version: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStatus {
    pub connection: String,
    pub status: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oref: Option<ORef>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTestRequest {
    #[serde(default = "default_stream_count")]
    pub count: u32,
    #[serde(default = "default_stream_interval", rename = "intervalms")]
    pub interval_ms: u64,
}

impl Default for StreamTestRequest {
    fn default() -> Self {
        Self {
            count: default_stream_count(),
            interval_ms: default_stream_interval(),
        }
    }
}

fn default_stream_count() -> u32 {
    5
}

fn default_stream_interval() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_test_defaults_from_empty_object() {
        let req: StreamTestRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req, StreamTestRequest::default());
        assert_eq!(req.count, 5);
    }

    #[test]
    fn history_request_defaults() {
        let req: EventReadHistoryRequest =
            serde_json::from_value(json!({"event": "blockfile"})).unwrap();
        assert_eq!(req.max_items, 10);
        assert!(req.scope.is_empty());
    }

    #[test]
    fn set_meta_parses_oref() {
        let req: SetMetaRequest =
            serde_json::from_value(json!({"oref": "block:b1", "meta": {"view": "term"}})).unwrap();
        assert_eq!(req.oref, ORef::block("b1"));
        assert!(serde_json::from_value::<SetMetaRequest>(json!({"oref": "b1", "meta": {}})).is_err());
    }

    #[test]
    fn controller_input_fields_are_optional() {
        let req: ControllerInputRequest =
            serde_json::from_value(json!({"blockid": "b1", "termsize": {"rows": 24, "cols": 80}})).unwrap();
        assert_eq!(req.term_size, Some(TermSize { rows: 24, cols: 80 }));
        assert!(req.input_data64.is_none());
        assert_eq!(serde_json::to_value(&req).unwrap().get("signame"), None);
    }
}
