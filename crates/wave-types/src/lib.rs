//! Foundation types for the Wave backend.
//!
//! Every other crate in the workspace depends on `wave-types`. It defines the
//! addressing scheme shared by the RPC surface, the event broker, and the
//! object store, plus the closed set of stored object variants.
//!
//! # Key Types
//!
//! - [`ORef`] -- `otype:oid` reference to one stored object
//! - [`OType`] -- the closed set of stored object kinds
//! - [`WaveObj`] -- tagged union over [`Client`], [`Window`], [`Workspace`],
//!   [`Tab`], [`Block`] and [`LayoutState`]
//! - [`MetaMap`] -- namespaced, loosely-typed metadata with explicit merge rules
//! - [`UpdateEntry`] / [`UpdateSet`] -- the unit of change propagated to subscribers

pub mod error;
pub mod meta;
pub mod object;
pub mod oref;
pub mod update;

pub use error::TypeError;
pub use meta::{MetaMap, MetaValue};
pub use object::{
    new_oid, Block, BlockDef, Client, LayoutState, LeafOrderEntry, Point, RuntimeOpts, Tab,
    TermSize, WaveObj, WaveObjType, Window, WinSize, Workspace,
};
pub use oref::{is_valid_oid, ORef, OType};
pub use update::{UpdateEntry, UpdateKind, UpdateSet, VersionWatermark};
