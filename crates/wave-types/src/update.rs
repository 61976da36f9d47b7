use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::object::WaveObj;
use crate::oref::{ORef, OType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Update,
    Delete,
}

/// One change produced by a store mutation.
///
/// An `Update` carries the full post-mutation snapshot; a `Delete` carries
/// only the identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntry {
    #[serde(rename = "updatetype")]
    pub kind: UpdateKind,
    pub otype: OType,
    pub oid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<WaveObj>,
}

impl UpdateEntry {
    pub fn update(obj: WaveObj) -> Self {
        Self {
            kind: UpdateKind::Update,
            otype: obj.otype(),
            oid: obj.oid().to_string(),
            obj: Some(obj),
        }
    }

    pub fn delete(oref: &ORef) -> Self {
        Self {
            kind: UpdateKind::Delete,
            otype: oref.otype,
            oid: oref.oid.clone(),
            obj: None,
        }
    }

    pub fn oref(&self) -> ORef {
        ORef::new(self.otype, self.oid.clone())
    }
}

/// Ordered batch of [`UpdateEntry`] values from one logical operation.
///
/// Entries are kept in insertion order and never collapsed, so a consumer
/// sees every intermediate version exactly once.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateSet(Vec<UpdateEntry>);

impl UpdateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: UpdateEntry) {
        self.0.push(entry);
    }

    pub fn extend(&mut self, other: UpdateSet) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, UpdateEntry> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<UpdateEntry> {
        self.0
    }
}

impl IntoIterator for UpdateSet {
    type Item = UpdateEntry;
    type IntoIter = std::vec::IntoIter<UpdateEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a UpdateSet {
    type Item = &'a UpdateEntry;
    type IntoIter = std::slice::Iter<'a, UpdateEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<UpdateEntry> for UpdateSet {
    fn from_iter<I: IntoIterator<Item = UpdateEntry>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Reader-side filter that drops stale updates.
///
/// Tracks the highest version observed per object. An update whose version
/// is lower than or equal to one already seen is rejected; a delete is
/// final for its oid.
#[derive(Debug, Default)]
pub struct VersionWatermark {
    seen: HashMap<ORef, i64>,
}

impl VersionWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the entry is newer than anything observed so far.
    pub fn observe(&mut self, entry: &UpdateEntry) -> bool {
        let oref = entry.oref();
        let seen = self.seen.get(&oref).copied();
        match entry.kind {
            UpdateKind::Delete => {
                self.seen.insert(oref, i64::MAX);
                seen != Some(i64::MAX)
            }
            UpdateKind::Update => {
                let version = entry.obj.as_ref().map(WaveObj::version).unwrap_or(0);
                if seen.is_some_and(|v| version <= v) {
                    return false;
                }
                self.seen.insert(oref, version);
                true
            }
        }
    }

    pub fn version_of(&self, oref: &ORef) -> Option<i64> {
        self.seen.get(oref).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Block;

    fn block(version: i64) -> WaveObj {
        WaveObj::Block(Block {
            oid: "b1".into(),
            version,
            ..Default::default()
        })
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(UpdateEntry::update(block(2))).unwrap();
        assert_eq!(json["updatetype"], "update");
        assert_eq!(json["otype"], "block");
        assert_eq!(json["oid"], "b1");
        assert_eq!(json["obj"]["version"], 2);

        let json = serde_json::to_value(UpdateEntry::delete(&ORef::block("b1"))).unwrap();
        assert_eq!(json["updatetype"], "delete");
        assert!(json.get("obj").is_none());
    }

    #[test]
    fn set_keeps_insertion_order() {
        let mut set = UpdateSet::new();
        set.push(UpdateEntry::update(block(1)));
        set.push(UpdateEntry::update(block(2)));
        set.push(UpdateEntry::delete(&ORef::tab("t1")));
        let kinds: Vec<_> = set.iter().map(|e| (e.otype, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (OType::Block, UpdateKind::Update),
                (OType::Block, UpdateKind::Update),
                (OType::Tab, UpdateKind::Delete),
            ]
        );
    }

    #[test]
    fn watermark_rejects_stale_versions() {
        let mut wm = VersionWatermark::new();
        assert!(wm.observe(&UpdateEntry::update(block(2))));
        assert!(!wm.observe(&UpdateEntry::update(block(2))));
        assert!(!wm.observe(&UpdateEntry::update(block(1))));
        assert!(wm.observe(&UpdateEntry::update(block(3))));
        assert_eq!(wm.version_of(&ORef::block("b1")), Some(3));
    }

    #[test]
    fn watermark_delete_is_final() {
        let mut wm = VersionWatermark::new();
        assert!(wm.observe(&UpdateEntry::update(block(5))));
        assert!(wm.observe(&UpdateEntry::delete(&ORef::block("b1"))));
        assert!(!wm.observe(&UpdateEntry::update(block(6))));
        assert!(!wm.observe(&UpdateEntry::delete(&ORef::block("b1"))));
    }
}
