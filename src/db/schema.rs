//! Vocabulary: predicates and collections.
//!
//! The schema maps predicate IRIs to ids and property flags, and collection
//! IRIs to the collection component of minted subject ids. It travels inside
//! the db-root blob so a loaded ledger is self-contained.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flake::{Pid, Sid};

/// Built-in predicate ids.
pub mod preds {
    use crate::flake::Pid;

    /// `rdf:type`; always multi-cardinality, always a reference.
    pub const RDF_TYPE: Pid = 0;
    /// `@id`: the subject's IRI, unique per subject.
    pub const ID: Pid = 1;
    /// `_tx/time`: commit wall-clock instant, on transaction subjects.
    pub const TX_TIME: Pid = 2;
    /// First id available to user predicates.
    pub const USER_BASE: Pid = 16;
}

/// Default collection for minted subjects.
pub const DEFAULT_COLLECTION: u32 = 0;

const COLLECTION_SHIFT: u32 = 44;

/// Compose a subject id from a collection id and a per-collection counter.
pub fn mint_sid(collection: u32, n: i64) -> Sid {
    ((collection as i64) << COLLECTION_SHIFT) | n
}

/// Collection id a subject was minted in.
pub fn sid_collection(sid: Sid) -> u32 {
    debug_assert!(sid > 0, "only user subjects carry a collection");
    (sid >> COLLECTION_SHIFT) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub id: Pid,
    pub iri: String,
    /// Multi-cardinality: values accumulate instead of replacing.
    pub multi: bool,
    /// Objects are subject references (`opst`-indexed).
    #[serde(rename = "ref")]
    pub is_ref: bool,
    /// `@list` container: element order preserved via metadata indexes.
    pub list: bool,
    pub component: bool,
    pub index: bool,
    pub unique: bool,
}

impl PredicateDef {
    fn new(id: Pid, iri: impl Into<String>) -> Self {
        Self {
            id,
            iri: iri.into(),
            multi: false,
            is_ref: false,
            list: false,
            component: false,
            index: false,
            unique: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    predicates: BTreeMap<String, PredicateDef>,
    by_id: BTreeMap<Pid, String>,
    collections: BTreeMap<String, u32>,
    next_pid: Pid,
    next_cid: u32,
}

impl Schema {
    /// The vocabulary every ledger starts with.
    pub fn base() -> Self {
        let mut schema = Self {
            predicates: BTreeMap::new(),
            by_id: BTreeMap::new(),
            collections: BTreeMap::from([("_default".to_string(), DEFAULT_COLLECTION)]),
            next_pid: preds::USER_BASE,
            next_cid: DEFAULT_COLLECTION + 1,
        };
        let mut rdf_type = PredicateDef::new(preds::RDF_TYPE, "rdf:type");
        rdf_type.multi = true;
        rdf_type.is_ref = true;
        rdf_type.index = true;
        schema.install(rdf_type);

        let mut id = PredicateDef::new(preds::ID, "@id");
        id.unique = true;
        id.index = true;
        schema.install(id);

        let mut tx_time = PredicateDef::new(preds::TX_TIME, "_tx/time");
        tx_time.index = true;
        schema.install(tx_time);
        schema
    }

    fn install(&mut self, def: PredicateDef) {
        self.by_id.insert(def.id, def.iri.clone());
        self.predicates.insert(def.iri.clone(), def);
    }

    pub fn predicate(&self, iri: &str) -> Option<&PredicateDef> {
        self.predicates.get(iri)
    }

    pub fn predicate_by_id(&self, id: Pid) -> Option<&PredicateDef> {
        self.by_id.get(&id).and_then(|iri| self.predicates.get(iri))
    }

    pub fn predicates(&self) -> impl Iterator<Item = &PredicateDef> {
        self.predicates.values()
    }

    /// Id for `iri`, registering a fresh predicate on first sight.
    pub fn ensure_predicate(&mut self, iri: &str) -> Pid {
        if let Some(def) = self.predicates.get(iri) {
            return def.id;
        }
        let id = self.next_pid;
        self.next_pid += 1;
        self.install(PredicateDef::new(id, iri));
        id
    }

    /// Merge observed property flags into a predicate definition. Flags only
    /// ever widen: once multi, always multi.
    pub fn widen_predicate(&mut self, iri: &str, multi: bool, is_ref: bool, list: bool) {
        if let Some(def) = self.predicates.get_mut(iri) {
            def.multi |= multi || list;
            def.is_ref |= is_ref;
            def.list |= list;
        }
    }

    pub fn collection(&self, iri: &str) -> Option<u32> {
        self.collections.get(iri).copied()
    }

    pub fn ensure_collection(&mut self, iri: &str) -> u32 {
        if let Some(id) = self.collections.get(iri) {
            return *id;
        }
        let id = self.next_cid;
        self.next_cid += 1;
        self.collections.insert(iri.to_string(), id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_vocabulary_is_present() {
        let schema = Schema::base();
        assert_eq!(schema.predicate("rdf:type").unwrap().id, preds::RDF_TYPE);
        assert!(schema.predicate("rdf:type").unwrap().multi);
        assert!(schema.predicate("rdf:type").unwrap().is_ref);
        assert!(schema.predicate("@id").unwrap().unique);
        assert_eq!(schema.predicate_by_id(preds::TX_TIME).unwrap().iri, "_tx/time");
    }

    #[test]
    fn ensure_predicate_is_idempotent() {
        let mut schema = Schema::base();
        let a = schema.ensure_predicate("schema/name");
        let b = schema.ensure_predicate("schema/name");
        assert_eq!(a, b);
        assert!(a >= preds::USER_BASE);
    }

    #[test]
    fn flags_widen_and_never_narrow() {
        let mut schema = Schema::base();
        schema.ensure_predicate("ex/favNums");
        schema.widen_predicate("ex/favNums", true, false, false);
        schema.widen_predicate("ex/favNums", false, false, false);
        assert!(schema.predicate("ex/favNums").unwrap().multi);
    }

    #[test]
    fn sids_pack_the_collection() {
        let sid = mint_sid(3, 17);
        assert_eq!(sid_collection(sid), 3);
        assert_eq!(sid & ((1 << 44) - 1), 17);
        assert!(mint_sid(0, 1) < mint_sid(1, 1));
    }
}
