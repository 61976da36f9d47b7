use serde::{Deserialize, Serialize};

use crate::meta::MetaMap;
use crate::oref::{ORef, OType};

/// Generate a fresh object id (UUID v7, time-ordered).
pub fn new_oid() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    pub width: i64,
    pub height: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: i64,
    pub cols: i64,
}

/// The process-wide client record. There is exactly one once initialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, rename = "windowids")]
    pub window_ids: Vec<String>,
    #[serde(default)]
    pub meta: MetaMap,
    #[serde(default, rename = "tosagreed")]
    pub tos_agreed: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "workspaceid")]
    pub workspace_id: String,
    #[serde(default, rename = "activetabid")]
    pub active_tab_id: String,
    #[serde(default)]
    pub pos: Point,
    #[serde(default, rename = "winsize")]
    pub win_size: WinSize,
    #[serde(default, rename = "lastfocusts")]
    pub last_focus_ts: i64,
    #[serde(default)]
    pub meta: MetaMap,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "tabids")]
    pub tab_ids: Vec<String>,
    #[serde(default)]
    pub meta: MetaMap,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub name: String,
    /// Oid of the tab's [`LayoutState`].
    #[serde(default, rename = "layoutstate")]
    pub layout_state: String,
    #[serde(default, rename = "blockids")]
    pub block_ids: Vec<String>,
    #[serde(default)]
    pub meta: MetaMap,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    #[serde(default)]
    pub meta: MetaMap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOpts {
    #[serde(default, rename = "termsize")]
    pub term_size: TermSize,
    #[serde(default, rename = "winsize")]
    pub win_size: WinSize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    /// ORef string of the containing object, usually a tab.
    #[serde(default, rename = "parentoref", skip_serializing_if = "Option::is_none")]
    pub parent_oref: Option<String>,
    #[serde(default, rename = "blockdef")]
    pub block_def: BlockDef,
    #[serde(default, rename = "runtimeopts", skip_serializing_if = "Option::is_none")]
    pub runtime_opts: Option<RuntimeOpts>,
    #[serde(default)]
    pub meta: MetaMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafOrderEntry {
    #[serde(rename = "nodeid")]
    pub node_id: String,
    #[serde(rename = "blockid")]
    pub block_id: String,
}

/// Per-tab layout record. The tree itself is opaque to the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutState {
    pub oid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, rename = "rootnode", skip_serializing_if = "Option::is_none")]
    pub root_node: Option<serde_json::Value>,
    #[serde(default, rename = "magnifiednodeid")]
    pub magnified_node_id: String,
    #[serde(default, rename = "focusednodeid")]
    pub focused_node_id: String,
    #[serde(default, rename = "leaforder")]
    pub leaf_order: Vec<LeafOrderEntry>,
    #[serde(default)]
    pub meta: MetaMap,
}

/// Tagged union over every stored object variant.
///
/// Serialized with an `otype` discriminator alongside the variant's fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "otype")]
pub enum WaveObj {
    #[serde(rename = "client")]
    Client(Client),
    #[serde(rename = "window")]
    Window(Window),
    #[serde(rename = "workspace")]
    Workspace(Workspace),
    #[serde(rename = "tab")]
    Tab(Tab),
    #[serde(rename = "block")]
    Block(Block),
    #[serde(rename = "layout")]
    Layout(LayoutState),
}

macro_rules! each_variant {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            WaveObj::Client($inner) => $body,
            WaveObj::Window($inner) => $body,
            WaveObj::Workspace($inner) => $body,
            WaveObj::Tab($inner) => $body,
            WaveObj::Block($inner) => $body,
            WaveObj::Layout($inner) => $body,
        }
    };
}

impl WaveObj {
    pub fn otype(&self) -> OType {
        match self {
            Self::Client(_) => OType::Client,
            Self::Window(_) => OType::Window,
            Self::Workspace(_) => OType::Workspace,
            Self::Tab(_) => OType::Tab,
            Self::Block(_) => OType::Block,
            Self::Layout(_) => OType::Layout,
        }
    }

    pub fn oid(&self) -> &str {
        each_variant!(self, o => &o.oid)
    }

    pub fn oref(&self) -> ORef {
        ORef::new(self.otype(), self.oid())
    }

    pub fn version(&self) -> i64 {
        each_variant!(self, o => o.version)
    }

    pub fn set_version(&mut self, version: i64) {
        each_variant!(self, o => o.version = version)
    }

    pub fn meta(&self) -> &MetaMap {
        each_variant!(self, o => &o.meta)
    }

    pub fn meta_mut(&mut self) -> &mut MetaMap {
        each_variant!(self, o => &mut o.meta)
    }

    /// Downcast into a concrete variant.
    pub fn into_typed<T: WaveObjType>(self) -> Option<T> {
        T::from_obj(self)
    }
}

/// Implemented by every concrete object variant for typed store access.
pub trait WaveObjType: Clone + Send + Sync + 'static {
    const OTYPE: OType;

    fn oid(&self) -> &str;
    fn version(&self) -> i64;
    fn into_obj(self) -> WaveObj;
    fn from_obj(obj: WaveObj) -> Option<Self>;

    fn oref(&self) -> ORef {
        ORef::new(Self::OTYPE, self.oid())
    }
}

macro_rules! impl_wave_obj_type {
    ($ty:ident, $variant:ident, $otype:expr) => {
        impl WaveObjType for $ty {
            const OTYPE: OType = $otype;

            fn oid(&self) -> &str {
                &self.oid
            }

            fn version(&self) -> i64 {
                self.version
            }

            fn into_obj(self) -> WaveObj {
                WaveObj::$variant(self)
            }

            fn from_obj(obj: WaveObj) -> Option<Self> {
                match obj {
                    WaveObj::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for WaveObj {
            fn from(value: $ty) -> Self {
                WaveObj::$variant(value)
            }
        }
    };
}

impl_wave_obj_type!(Client, Client, OType::Client);
impl_wave_obj_type!(Window, Window, OType::Window);
impl_wave_obj_type!(Workspace, Workspace, OType::Workspace);
impl_wave_obj_type!(Tab, Tab, OType::Tab);
impl_wave_obj_type!(Block, Block, OType::Block);
impl_wave_obj_type!(LayoutState, Layout, OType::Layout);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tab() -> Tab {
        Tab {
            oid: "t1".into(),
            version: 3,
            name: "T1".into(),
            layout_state: "l1".into(),
            block_ids: vec!["b1".into(), "b2".into()],
            meta: MetaMap::new(),
        }
    }

    #[test]
    fn json_carries_otype_tag_and_wire_names() {
        let obj = WaveObj::Tab(sample_tab());
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["otype"], "tab");
        assert_eq!(json["blockids"][1], "b2");
        assert_eq!(json["layoutstate"], "l1");

        let back: WaveObj = serde_json::from_value(json).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn shared_accessors() {
        let mut obj: WaveObj = sample_tab().into();
        assert_eq!(obj.otype(), OType::Tab);
        assert_eq!(obj.oid(), "t1");
        assert_eq!(obj.oref().to_string(), "tab:t1");
        obj.set_version(4);
        assert_eq!(obj.version(), 4);
        obj.meta_mut().insert("tab:color", "red");
        assert_eq!(obj.meta().get_str("tab:color"), Some("red"));
    }

    #[test]
    fn typed_downcast() {
        let obj: WaveObj = sample_tab().into();
        assert!(obj.clone().into_typed::<Block>().is_none());
        let tab = obj.into_typed::<Tab>().unwrap();
        assert_eq!(tab.oref(), ORef::tab("t1"));
    }

    #[test]
    fn window_defaults_fill_missing_fields() {
        let json = serde_json::json!({"otype": "window", "oid": "w1", "workspaceid": "ws1"});
        let obj: WaveObj = serde_json::from_value(json).unwrap();
        let win = obj.into_typed::<Window>().unwrap();
        assert_eq!(win.version, 0);
        assert_eq!(win.pos, Point::default());
        assert!(win.meta.is_empty());
    }

    #[test]
    fn oids_are_unique() {
        assert_ne!(new_oid(), new_oid());
    }
}
