//! The live, in-memory replica of one document.
//!
//! Content lives in a Yjs document (`yrs`) under the XML fragment the editor
//! binds to; presence lives in the [`Awareness`] map next to it. The merge
//! algorithm itself belongs to `yrs`: this wrapper only applies deltas,
//! reports what changed and exposes a structural view of the content.

use serde_json::{Map, Value as JsonValue};
use yrs::types::text::YChange;
use yrs::types::xml::{Xml, XmlElementRef, XmlFragment, XmlOut};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Out, ReadTxn, StateVector, Text, Transact, Update};

use crate::content::{normalize_for_export, render_markdown, ContentNode, Mark};
use crate::{SyncError, SyncResult};

pub mod awareness;

pub use awareness::{Awareness, AwarenessChange};

/// Name of the root XML fragment the rich-text editor binds to
pub const CONTENT_ROOT: &str = "default";

// v1 encoding of an update with no structs and an empty delete set
const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Content replica plus presence for one document
pub struct Replica {
    doc: Doc,
    awareness: Awareness,
}

impl Replica {
    /// Create an empty replica
    pub fn new() -> Self {
        let doc = Doc::new();
        doc.get_or_insert_xml_fragment(CONTENT_ROOT);
        Self {
            doc,
            awareness: Awareness::new(),
        }
    }

    /// Rebuild a replica by replaying persisted deltas in order
    pub fn from_updates<I, U>(updates: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = U>,
        U: AsRef<[u8]>,
    {
        let mut replica = Self::new();
        for update in updates {
            replica.apply_update(update.as_ref())?;
        }
        Ok(replica)
    }

    /// Apply a binary update.
    ///
    /// Returns the effective delta, or `None` when the update brought
    /// nothing new (already integrated, or still waiting on missing
    /// dependencies).
    pub fn apply_update(&mut self, update: &[u8]) -> SyncResult<Option<Vec<u8>>> {
        let decoded =
            Update::decode_v1(update).map_err(|e| SyncError::Replica(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Replica(e.to_string()))?;
        let delta = txn.encode_update_v1();

        Ok((delta.as_slice() != EMPTY_UPDATE).then_some(delta))
    }

    /// Encoded state vector of this replica
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full state as a single update
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer with `state_vector` lacks
    pub fn encode_diff(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| SyncError::Replica(e.to_string()))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&remote))
    }

    /// Structural view of the content, rooted at a `doc` node
    pub fn content_tree(&self) -> ContentNode {
        let txn = self.doc.transact();
        let mut content = Vec::new();
        if let Some(root) = txn.get_xml_fragment(CONTENT_ROOT) {
            for child in root.children(&txn) {
                push_node(&txn, child, &mut content);
            }
        }
        ContentNode::doc(content)
    }

    /// Markdown rendering of the content, normalized for export
    pub fn render_markdown(&self) -> String {
        render_markdown(&normalize_for_export(&self.content_tree()))
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

fn push_node<T: ReadTxn>(txn: &T, node: XmlOut, out: &mut Vec<ContentNode>) {
    match node {
        XmlOut::Element(element) => out.push(element_node(txn, &element)),
        XmlOut::Fragment(fragment) => {
            for child in fragment.children(txn) {
                push_node(txn, child, out);
            }
        }
        XmlOut::Text(text) => {
            for chunk in text.diff(txn, YChange::identity) {
                if let Out::Any(Any::String(value)) = &chunk.insert {
                    let marks = chunk
                        .attributes
                        .map(|attrs| {
                            let mut marks: Vec<Mark> = attrs
                                .iter()
                                .map(|(name, value)| Mark {
                                    kind: name.to_string(),
                                    attrs: match any_to_json(value) {
                                        JsonValue::Object(map) => map,
                                        _ => Map::new(),
                                    },
                                })
                                .collect();
                            marks.sort_by(|a, b| a.kind.cmp(&b.kind));
                            marks
                        })
                        .unwrap_or_default();
                    out.push(ContentNode::text(value.to_string(), marks));
                }
            }
        }
    }
}

fn element_node<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> ContentNode {
    let mut attrs = Map::new();
    for (name, value) in element.attributes(txn) {
        attrs.insert(name.to_string(), out_to_json(&value));
    }

    let mut node = ContentNode::element(element.tag().to_string(), attrs);
    for child in element.children(txn) {
        push_node(txn, child, &mut node.content);
    }
    node
}

fn out_to_json(value: &Out) -> JsonValue {
    match value {
        Out::Any(any) => any_to_json(any),
        _ => JsonValue::Null,
    }
}

fn any_to_json(value: &Any) -> JsonValue {
    match value {
        Any::Bool(b) => JsonValue::Bool(*b),
        Any::Number(n) => number_to_json(*n),
        Any::BigInt(n) => JsonValue::from(*n),
        Any::String(s) => JsonValue::String(s.to_string()),
        Any::Array(items) => JsonValue::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), any_to_json(value)))
                .collect(),
        ),
        _ => JsonValue::Null,
    }
}

// Yjs stores every number as f64; integral values read back as integers
fn number_to_json(n: f64) -> JsonValue {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Client-side edits for tests, produced the way a browser replica would.

    use super::CONTENT_ROOT;
    use yrs::types::xml::{Xml, XmlElementPrelim, XmlFragment, XmlFragmentRef, XmlTextPrelim};
    use yrs::{Doc, ReadTxn, Transact, TransactionMut};

    /// Run an edit on a client document and return the update it produced
    pub fn client_edit<F>(doc: &Doc, edit: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut, &XmlFragmentRef),
    {
        let root = doc.get_or_insert_xml_fragment(CONTENT_ROOT);
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            edit(&mut txn, &root);
        }
        doc.transact().encode_state_as_update_v1(&before)
    }

    /// Append a paragraph holding `text`
    pub fn push_paragraph(doc: &Doc, text: &str) -> Vec<u8> {
        client_edit(doc, |txn, root| {
            let paragraph = root.push_back(txn, XmlElementPrelim::empty("paragraph"));
            paragraph.push_back(txn, XmlTextPrelim::new(text));
        })
    }

    /// Append a paragraph holding one image per source
    pub fn push_images(doc: &Doc, sources: &[String]) -> Vec<u8> {
        client_edit(doc, |txn, root| {
            let paragraph = root.push_back(txn, XmlElementPrelim::empty("paragraph"));
            for source in sources {
                let image = paragraph.push_back(txn, XmlElementPrelim::empty("image"));
                image.insert_attribute(txn, "src", source.clone());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_util::{client_edit, push_paragraph};
    use crate::content::collect_referenced_image_ids;
    use yrs::types::xml::{XmlElementPrelim, XmlTextPrelim};

    #[test]
    fn test_new_replica_is_empty_doc() {
        let replica = Replica::new();
        assert_eq!(replica.content_tree(), ContentNode::doc(vec![]));
        assert_eq!(replica.render_markdown(), "");
        assert!(replica.awareness().is_empty());
    }

    #[test]
    fn test_redundant_update_has_no_delta() {
        let client = Doc::new();
        let update = push_paragraph(&client, "hello");

        let mut replica = Replica::new();
        assert!(replica.apply_update(&update).unwrap().is_some());
        assert!(replica.apply_update(&update).unwrap().is_none());
        assert_eq!(replica.render_markdown(), "hello\n");
    }

    #[test]
    fn test_replay_reconstructs_identical_state() {
        let client = Doc::new();
        let mut replica = Replica::new();
        let mut log = Vec::new();

        for text in ["one", "two", "three", "four"] {
            let update = push_paragraph(&client, text);
            if let Some(delta) = replica.apply_update(&update).unwrap() {
                log.push(delta);
            }
        }
        assert_eq!(log.len(), 4);

        let rebuilt = Replica::from_updates(&log).unwrap();
        assert_eq!(rebuilt.encode_state_as_update(), replica.encode_state_as_update());
        assert_eq!(rebuilt.content_tree(), replica.content_tree());
        assert_eq!(rebuilt.render_markdown(), "one\n\ntwo\n\nthree\n\nfour\n");
    }

    #[test]
    fn test_malformed_update_is_rejected() {
        let mut replica = Replica::new();
        let err = replica.apply_update(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, SyncError::Replica(_)));
        assert_eq!(replica.content_tree(), ContentNode::doc(vec![]));
    }

    #[test]
    fn test_diff_against_peer_state_vector() {
        let client = Doc::new();
        let mut replica = Replica::new();
        replica
            .apply_update(&push_paragraph(&client, "shared"))
            .unwrap();

        let peer = Doc::new();
        let diff = replica
            .encode_diff(&peer.transact().state_vector().encode_v1())
            .unwrap();
        {
            let mut txn = peer.transact_mut();
            txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
        }
        assert_eq!(
            peer.transact().state_vector().encode_v1(),
            replica.state_vector()
        );
    }

    #[test]
    fn test_content_tree_exposes_image_attributes() {
        let id = "01HZX3T47PW5Z7F73Q0Z6E4TQ3";
        let client = Doc::new();
        let update = client_edit(&client, |txn, root| {
            let paragraph = root.push_back(txn, XmlElementPrelim::empty("paragraph"));
            let image = paragraph.push_back(txn, XmlElementPrelim::empty("image"));
            image.insert_attribute(txn, "src", format!("/api/v1/images/{}", id));
            image.insert_attribute(txn, "alt", "diagram");
        });

        let mut replica = Replica::new();
        replica.apply_update(&update).unwrap();

        let tree = replica.content_tree();
        let image = &tree.content[0].content[0];
        assert_eq!(image.kind, "image");
        assert_eq!(image.attr_str("alt"), Some("diagram"));
        assert!(collect_referenced_image_ids(&tree).contains(id));
        assert_eq!(
            replica.render_markdown(),
            format!("![diagram](/api/v1/images/{})\n", id)
        );
    }

    #[test]
    fn test_numeric_attributes_read_back_as_integers() {
        let client = Doc::new();
        let update = client_edit(&client, |txn, root| {
            let heading = root.push_back(txn, XmlElementPrelim::empty("heading"));
            heading.insert_attribute(txn, "level", 2.0);
            heading.insert_attribute(txn, "ratio", 0.5);
            heading.push_back(txn, XmlTextPrelim::new("Title"));
        });

        let mut replica = Replica::new();
        replica.apply_update(&update).unwrap();

        let heading = &replica.content_tree().content[0];
        assert_eq!(heading.attrs.get("level").and_then(JsonValue::as_u64), Some(2));
        assert_eq!(heading.attrs.get("ratio").and_then(JsonValue::as_f64), Some(0.5));
        assert_eq!(replica.render_markdown(), "## Title\n");
    }

    #[test]
    fn test_ordered_list_start_survives_export() {
        let client = Doc::new();
        let update = client_edit(&client, |txn, root| {
            let list = root.push_back(txn, XmlElementPrelim::empty("orderedList"));
            list.insert_attribute(txn, "start", 3.0);
            for text in ["third", "fourth"] {
                let item = list.push_back(txn, XmlElementPrelim::empty("listItem"));
                let paragraph = item.push_back(txn, XmlElementPrelim::empty("paragraph"));
                paragraph.push_back(txn, XmlTextPrelim::new(text));
            }
        });

        let mut replica = Replica::new();
        replica.apply_update(&update).unwrap();

        assert_eq!(replica.render_markdown(), "3. third\n4. fourth\n");
    }
}
