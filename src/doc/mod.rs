//! The `docJson` outline tree.
//!
//! An article's document is held as raw `serde_json::Value` so unknown
//! rich-text content round-trips untouched. The engine inspects only the
//! outline skeleton: `outlineSection` nodes carrying a stable `sectionId`,
//! their heading / body / children containers, the `collapsed` attribute,
//! and `image` sources. Node identity is the `sectionId` string.
//!
//! Walkers and patchers use explicit work stacks rather than recursion so
//! pathological nesting cannot exhaust the call stack.

mod node;
mod patch;
mod walk;

pub use node::{
    attr_str, body_with_text, build_section, child_of_type, collapsed, content, content_mut,
    doc_hash, empty_doc, heading_with_text, node_type, plain_text, section_id,
};
pub use patch::{
    apply_section_upsert, apply_structure, insert_section_after, remove_sections, StructureOutcome,
};
pub use walk::{extract_sections, extract_tags, extract_upload_refs, flatten_structure, SectionRow, TagOccurrence};

use serde::{Deserialize, Serialize};

pub(crate) const TYPE_DOC: &str = "doc";
pub(crate) const TYPE_SECTION: &str = "outlineSection";
pub(crate) const TYPE_HEADING: &str = "outlineHeading";
pub(crate) const TYPE_BODY: &str = "outlineBody";
pub(crate) const TYPE_CHILDREN: &str = "outlineChildren";
pub(crate) const TYPE_IMAGE: &str = "image";
pub(crate) const TYPE_TEXT: &str = "text";
pub(crate) const ATTR_SECTION_ID: &str = "sectionId";
pub(crate) const ATTR_COLLAPSED: &str = "collapsed";
pub(crate) const ATTR_SRC: &str = "src";

/// One row of a structural snapshot: where a section sits in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureNode {
    pub section_id: String,
    pub parent_id: Option<String>,
    pub position: i64,
    #[serde(default)]
    pub collapsed: bool,
}
