//! Workspace orchestration.
//!
//! Every function here runs inside one store transaction and leaves the
//! object graph consistent when it returns `Ok`: a child is never stored
//! without its parent listing it, and deletes cascade explicitly from the
//! orchestrator since the store itself never cascades. Effects outside the
//! store (events, controllers) are the caller's business once the
//! transaction has committed.

use std::collections::BTreeMap;

use wave_store::{StoreError, StoreResult, Tx};
use wave_types::{
    new_oid, Block, BlockDef, Client, LayoutState, LeafOrderEntry, ORef, OType, Point,
    RuntimeOpts, Tab, Window, WinSize, Workspace,
};

pub const META_VIEW: &str = "view";

pub const DEFAULT_WINDOW_POS: Point = Point { x: 100, y: 100 };
pub const DEFAULT_WINDOW_SIZE: WinSize = WinSize {
    width: 1200,
    height: 850,
};

/// Shortest prefix accepted as an abbreviated oid.
pub const MIN_OID_PREFIX: usize = 8;

/// Simple id naming the calling block.
pub const SIMPLE_ID_THIS: &str = "this";
/// Simple id naming the calling block's tab.
pub const SIMPLE_ID_TAB: &str = "tab";

fn invalid(oref: ORef, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidObject {
        oref,
        reason: reason.into(),
    }
}

pub fn create_client(tx: &mut Tx<'_>) -> StoreResult<Client> {
    tx.insert(Client {
        oid: new_oid(),
        ..Client::default()
    })
}

pub fn create_workspace(tx: &mut Tx<'_>, name: &str) -> StoreResult<Workspace> {
    tx.insert(Workspace {
        oid: new_oid(),
        name: name.to_string(),
        ..Workspace::default()
    })
}

/// New window with its own workspace and one active tab, appended to the
/// client's window list.
pub fn create_window(tx: &mut Tx<'_>, client_id: &str) -> StoreResult<Window> {
    let mut client = tx.must_get::<Client>(client_id)?;
    let window_id = new_oid();
    let short: String = window_id.chars().take(8).collect();
    let workspace = create_workspace(tx, &format!("w{short}"))?;
    tx.insert(Window {
        oid: window_id.clone(),
        workspace_id: workspace.oid.clone(),
        pos: DEFAULT_WINDOW_POS,
        win_size: DEFAULT_WINDOW_SIZE,
        ..Window::default()
    })?;
    create_tab(tx, &workspace.oid, Some("T1"), true)?;
    client.window_ids.push(window_id.clone());
    tx.update(client)?;
    tx.must_get::<Window>(&window_id)
}

/// New tab with an empty layout, appended to the workspace. Unnamed tabs
/// are called `T<n>`. Activating sets it as the active tab of the window
/// showing the workspace, if any.
pub fn create_tab(
    tx: &mut Tx<'_>,
    workspace_id: &str,
    name: Option<&str>,
    activate: bool,
) -> StoreResult<Tab> {
    let mut workspace = tx.must_get::<Workspace>(workspace_id)?;
    let layout = tx.insert(LayoutState {
        oid: new_oid(),
        ..LayoutState::default()
    })?;
    let name = match name.filter(|n| !n.is_empty()) {
        Some(n) => n.to_string(),
        None => format!("T{}", workspace.tab_ids.len() + 1),
    };
    let tab = tx.insert(Tab {
        oid: new_oid(),
        name,
        layout_state: layout.oid,
        ..Tab::default()
    })?;
    workspace.tab_ids.push(tab.oid.clone());
    tx.update(workspace)?;

    if activate {
        if let Some(window_id) = tx.find_window_for_workspace(workspace_id)? {
            let mut window = tx.must_get::<Window>(&window_id)?;
            window.active_tab_id = tab.oid.clone();
            tx.update(window)?;
        }
    }
    Ok(tab)
}

/// Delete a tab with its blocks and layout. Returns the ids of the deleted
/// blocks; a tab that does not exist deletes nothing.
pub fn delete_tab(tx: &mut Tx<'_>, workspace_id: &str, tab_id: &str) -> StoreResult<Vec<String>> {
    let Some(tab) = tx.get::<Tab>(tab_id)? else {
        return Ok(Vec::new());
    };
    let mut workspace = tx.must_get::<Workspace>(workspace_id)?;
    let Some(pos) = workspace.tab_ids.iter().position(|id| id == tab_id) else {
        return Err(invalid(
            ORef::tab(tab_id),
            format!("tab is not in workspace {workspace_id}"),
        ));
    };
    workspace.tab_ids.remove(pos);
    let next_active = workspace.tab_ids.first().cloned().unwrap_or_default();
    tx.update(workspace)?;

    if let Some(window_id) = tx.find_window_for_workspace(workspace_id)? {
        let mut window = tx.must_get::<Window>(&window_id)?;
        if window.active_tab_id == tab_id {
            window.active_tab_id = next_active;
            tx.update(window)?;
        }
    }

    for block_id in &tab.block_ids {
        tx.delete(&ORef::block(block_id))?;
    }
    if !tab.layout_state.is_empty() {
        tx.delete(&ORef::layout(&tab.layout_state))?;
    }
    tx.delete(&ORef::tab(tab_id))?;
    Ok(tab.block_ids)
}

/// New block in `tab_id`, added to the tab and to the end of its layout's
/// leaf order. The definition's meta must name a view.
pub fn create_block(
    tx: &mut Tx<'_>,
    tab_id: &str,
    block_def: BlockDef,
    rt_opts: Option<RuntimeOpts>,
) -> StoreResult<Block> {
    let block_id = new_oid();
    if block_def.meta.get_str(META_VIEW).map_or(true, str::is_empty) {
        return Err(invalid(ORef::block(&block_id), "block definition has no view"));
    }
    let mut tab = tx.must_get::<Tab>(tab_id)?;
    let block = tx.insert(Block {
        oid: block_id.clone(),
        parent_oref: Some(ORef::tab(tab_id).to_string()),
        meta: block_def.meta.clone(),
        block_def,
        runtime_opts: rt_opts,
        ..Block::default()
    })?;
    tab.block_ids.push(block_id.clone());
    let layout_id = tab.layout_state.clone();
    tx.update(tab)?;

    if let Some(mut layout) = tx.get::<LayoutState>(&layout_id)? {
        layout.leaf_order.push(LeafOrderEntry {
            node_id: new_oid(),
            block_id,
        });
        tx.update(layout)?;
    }
    Ok(block)
}

/// Remove a block from its tab and layout, then delete it. Returns the id
/// of the tab it was in.
pub fn delete_block(tx: &mut Tx<'_>, block_id: &str) -> StoreResult<String> {
    let tab_id = tx
        .find_tab_for_block(block_id)?
        .ok_or_else(|| StoreError::NotFound(ORef::block(block_id)))?;
    let mut tab = tx.must_get::<Tab>(&tab_id)?;
    tab.block_ids.retain(|id| id != block_id);
    let layout_id = tab.layout_state.clone();
    tx.update(tab)?;

    if let Some(mut layout) = tx.get::<LayoutState>(&layout_id)? {
        let before = layout.leaf_order.len();
        layout.leaf_order.retain(|leaf| leaf.block_id != block_id);
        if layout.leaf_order.len() != before {
            tx.update(layout)?;
        }
    }
    tx.delete(&ORef::block(block_id))?;
    Ok(tab_id)
}

pub fn set_view(tx: &mut Tx<'_>, block_id: &str, view: &str) -> StoreResult<Block> {
    let mut block = tx.must_get::<Block>(block_id)?;
    block.meta.insert(META_VIEW, view);
    tx.update(block)
}

/// Make sure the client exists with at least one usable window.
///
/// Creates the client and a first window on a fresh store. A lone window
/// whose workspace has lost every tab gets a new active tab. Returns true
/// if anything was created.
pub fn ensure_initial_data(tx: &mut Tx<'_>) -> StoreResult<bool> {
    let client = match tx.count(OType::Client)? {
        0 => create_client(tx)?,
        _ => tx.get_singleton::<Client>()?,
    };
    match client.window_ids.as_slice() {
        [] => {
            create_window(tx, &client.oid)?;
            Ok(true)
        }
        [window_id] => {
            let window = tx.must_get::<Window>(window_id)?;
            let workspace = tx.must_get::<Workspace>(&window.workspace_id)?;
            if workspace.tab_ids.is_empty() {
                create_tab(tx, &workspace.oid, Some("T1"), true)?;
                return Ok(true);
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

/// Resolve user-facing ids. Ids that cannot be resolved are left out.
///
/// Accepted forms: `this` (the calling block), `tab` (its tab), a 1-based
/// position in the calling tab's layout, a full `otype:oid` reference, or
/// a block or tab oid given in full or as a unique prefix of at least
/// [`MIN_OID_PREFIX`] characters.
pub fn resolve_ids(
    tx: &mut Tx<'_>,
    block_id: Option<&str>,
    ids: &[String],
) -> StoreResult<BTreeMap<String, ORef>> {
    let mut resolved = BTreeMap::new();
    for id in ids {
        if let Some(oref) = resolve_one(tx, block_id, id)? {
            resolved.insert(id.clone(), oref);
        }
    }
    Ok(resolved)
}

fn resolve_one(tx: &mut Tx<'_>, block_id: Option<&str>, id: &str) -> StoreResult<Option<ORef>> {
    let caller = block_id.filter(|b| !b.is_empty());
    if id == SIMPLE_ID_THIS {
        return Ok(caller.map(ORef::block));
    }
    if id == SIMPLE_ID_TAB {
        return match caller {
            Some(b) => Ok(tx.find_tab_for_block(b)?.map(ORef::tab)),
            None => Ok(None),
        };
    }
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        let Some(b) = caller else { return Ok(None) };
        return block_by_position(tx, b, id);
    }
    if id.contains(':') {
        return Ok(ORef::parse(id).ok());
    }
    resolve_oid_prefix(tx, id)
}

fn block_by_position(tx: &mut Tx<'_>, block_id: &str, pos: &str) -> StoreResult<Option<ORef>> {
    let Ok(index) = pos.parse::<usize>() else { return Ok(None) };
    let Some(tab_id) = tx.find_tab_for_block(block_id)? else { return Ok(None) };
    let tab = tx.must_get::<Tab>(&tab_id)?;
    let Some(layout) = tx.get::<LayoutState>(&tab.layout_state)? else { return Ok(None) };
    Ok(index
        .checked_sub(1)
        .and_then(|i| layout.leaf_order.get(i))
        .map(|leaf| ORef::block(&leaf.block_id)))
}

fn resolve_oid_prefix(tx: &mut Tx<'_>, id: &str) -> StoreResult<Option<ORef>> {
    let mut matches = Vec::new();
    for otype in [OType::Block, OType::Tab] {
        for obj in tx.get_all_obj(otype)? {
            if obj.oid() == id {
                return Ok(Some(obj.oref()));
            }
            if id.len() >= MIN_OID_PREFIX && obj.oid().starts_with(id) {
                matches.push(obj.oref());
            }
        }
    }
    Ok(match matches.len() {
        1 => matches.pop(),
        _ => None,
    })
}
