//! Form field index built over the AcroForm tree
//!
//! The arena is a snapshot: entries are addressed by index and carry a
//! removal marker, so callers can mutate the document while walking a
//! stable list instead of re-enumerating the live field tree.

use crate::document::PdfDocument;
use crate::error::{PdfError, Result};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashSet;

/// Field trees deeper than this are treated as cyclic
const MAX_FIELD_DEPTH: usize = 32;

/// A terminal form field and the widgets that display it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub id: ObjectId,
    /// Fully qualified name (`parent.child`)
    pub name: String,
    /// Field type, inherited from ancestors when absent (`Sig`, `Tx`, `Btn`, `Ch`)
    pub kind: Option<Vec<u8>>,
    pub parent: Option<ObjectId>,
    pub widgets: Vec<ObjectId>,
    pub has_value: bool,
    pub removed: bool,
}

impl FieldEntry {
    pub fn is_signature(&self) -> bool {
        self.kind.as_deref() == Some(b"Sig".as_slice())
    }

    /// A signature field whose `/V` points at a signature dictionary
    pub fn is_signed(&self) -> bool {
        self.is_signature() && self.has_value
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldArena {
    entries: Vec<FieldEntry>,
}

impl FieldArena {
    /// Index every terminal field reachable from `/AcroForm /Fields`
    pub fn build(pdf: &PdfDocument) -> Result<Self> {
        let mut arena = Self::default();
        let Some(roots) = root_fields(pdf)? else {
            return Ok(arena);
        };

        let mut visited = HashSet::new();
        for root in roots {
            if let Object::Reference(id) = root {
                arena.visit(pdf, id, None, "", None, &mut visited, 0)?;
            }
        }
        Ok(arena)
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        pdf: &PdfDocument,
        id: ObjectId,
        parent: Option<ObjectId>,
        prefix: &str,
        inherited_kind: Option<Vec<u8>>,
        visited: &mut HashSet<ObjectId>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_FIELD_DEPTH || !visited.insert(id) {
            return Ok(());
        }

        let dict = pdf
            .doc()
            .get_object(id)
            .and_then(|o| o.as_dict())
            .map_err(|e| PdfError::Malformed(format!("field {:?}: {}", id, e)))?;

        let partial = dict
            .get(b"T")
            .and_then(|t| t.as_str())
            .ok()
            .map(|t| String::from_utf8_lossy(t).into_owned());
        let name = match partial {
            Some(p) if prefix.is_empty() => p,
            Some(p) => format!("{}.{}", prefix, p),
            None => prefix.to_string(),
        };
        let kind = dict
            .get(b"FT")
            .and_then(|ft| ft.as_name())
            .ok()
            .map(<[u8]>::to_vec)
            .or(inherited_kind);

        let kids = kid_references(pdf, dict);
        let (child_fields, widget_kids): (Vec<ObjectId>, Vec<ObjectId>) =
            kids.into_iter().partition(|kid| is_named(pdf, *kid));

        if !child_fields.is_empty() {
            for child in child_fields {
                self.visit(pdf, child, Some(id), &name, kind.clone(), visited, depth + 1)?;
            }
            return Ok(());
        }

        let widgets = if widget_kids.is_empty() && is_widget(dict) {
            vec![id]
        } else {
            widget_kids
        };

        self.entries.push(FieldEntry {
            id,
            name,
            kind,
            parent,
            widgets,
            has_value: matches!(dict.get(b"V"), Ok(v) if !matches!(v, Object::Null)),
            removed: false,
        });
        Ok(())
    }

    pub fn entries(&self) -> &[FieldEntry] {
        &self.entries
    }

    pub fn find(&self, name: &str) -> Option<&FieldEntry> {
        self.live().find(|f| f.name == name)
    }

    /// Entries not yet marked removed
    pub fn live(&self) -> impl Iterator<Item = &FieldEntry> {
        self.entries.iter().filter(|f| !f.removed)
    }

    pub fn mark_removed(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.removed = true;
        }
    }

    pub fn signature_count(&self) -> usize {
        self.live().filter(|f| f.is_signature()).count()
    }

    pub fn signed_count(&self) -> usize {
        self.live().filter(|f| f.is_signed()).count()
    }
}

fn root_fields(pdf: &PdfDocument) -> Result<Option<Vec<Object>>> {
    let catalog_id = pdf.catalog_id()?;
    let catalog = pdf
        .doc()
        .get_object(catalog_id)
        .and_then(|o| o.as_dict())
        .map_err(|e| PdfError::Malformed(format!("catalog: {}", e)))?;

    let Ok(acroform) = catalog.get(b"AcroForm") else {
        return Ok(None);
    };
    let acroform = pdf.resolve_dict(acroform)?;
    let Ok(fields) = acroform.get(b"Fields") else {
        return Ok(None);
    };
    let fields = pdf
        .resolve(fields)?
        .as_array()
        .map_err(|_| PdfError::Malformed("/Fields is not an array".to_string()))?;
    Ok(Some(fields.clone()))
}

fn kid_references(pdf: &PdfDocument, dict: &Dictionary) -> Vec<ObjectId> {
    dict.get(b"Kids")
        .ok()
        .and_then(|kids| pdf.resolve(kids).ok())
        .and_then(|kids| kids.as_array().ok())
        .map(|kids| kids.iter().filter_map(|k| k.as_reference().ok()).collect())
        .unwrap_or_default()
}

fn is_named(pdf: &PdfDocument, id: ObjectId) -> bool {
    pdf.doc()
        .get_object(id)
        .and_then(|o| o.as_dict())
        .map(|d| d.has(b"T"))
        .unwrap_or(false)
}

fn is_widget(dict: &Dictionary) -> bool {
    dict.get(b"Subtype")
        .and_then(|s| s.as_name())
        .map(|s| s == b"Widget")
        .unwrap_or(false)
}

/// Id of the AcroForm dictionary, hoisting an inline one into its own object.
///
/// # Arguments
/// * `doc` - Document to inspect
/// * `create` - Create an empty AcroForm when none exists
pub(crate) fn acroform_id(doc: &mut Document, create: bool) -> Result<Option<ObjectId>> {
    let existing = doc
        .catalog()
        .ok()
        .and_then(|c| c.get(b"AcroForm").ok())
        .cloned();

    let inline = match existing {
        Some(Object::Reference(id)) => return Ok(Some(id)),
        Some(Object::Dictionary(dict)) => dict,
        _ if create => {
            let mut dict = Dictionary::new();
            dict.set("Fields", Object::Array(vec![]));
            dict
        }
        _ => return Ok(None),
    };

    let id = doc.add_object(Object::Dictionary(inline));
    doc.catalog_mut()
        .map_err(|e| PdfError::Malformed(format!("catalog: {}", e)))?
        .set("AcroForm", Object::Reference(id));
    Ok(Some(id))
}

/// Mutate the array stored under `key` in `holder`, following one reference
fn with_array_mut<F>(doc: &mut Document, holder: ObjectId, key: &[u8], f: F) -> Result<()>
where
    F: FnOnce(&mut Vec<Object>),
{
    let target = doc
        .get_object(holder)
        .and_then(|o| o.as_dict())
        .map_err(|e| PdfError::Malformed(format!("{:?}: {}", holder, e)))?
        .get(key)
        .ok()
        .and_then(|v| v.as_reference().ok());

    match target {
        Some(array_id) => {
            let array = doc
                .get_object_mut(array_id)
                .and_then(|o| o.as_array_mut())
                .map_err(|e| PdfError::Malformed(format!("{:?}: {}", array_id, e)))?;
            f(array);
        }
        None => {
            let dict = doc
                .get_object_mut(holder)
                .and_then(|o| o.as_dict_mut())
                .map_err(|e| PdfError::Malformed(format!("{:?}: {}", holder, e)))?;
            let mut array = dict
                .get(key)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            f(&mut array);
            dict.set(key.to_vec(), Object::Array(array));
        }
    }
    Ok(())
}

pub(crate) fn push_reference(
    doc: &mut Document,
    holder: ObjectId,
    key: &[u8],
    target: ObjectId,
) -> Result<()> {
    with_array_mut(doc, holder, key, |array| array.push(Object::Reference(target)))
}

/// Returns whether `target` was present
pub(crate) fn remove_reference(
    doc: &mut Document,
    holder: ObjectId,
    key: &[u8],
    target: ObjectId,
) -> Result<bool> {
    let mut found = false;
    with_array_mut(doc, holder, key, |array| {
        let before = array.len();
        array.retain(|o| o.as_reference().map(|id| id != target).unwrap_or(true));
        found = array.len() != before;
    })?;
    Ok(found)
}

/// Whether the array under `holder[key]` lists `target`
pub(crate) fn references(pdf: &PdfDocument, holder: ObjectId, key: &[u8], target: ObjectId) -> bool {
    pdf.doc()
        .get_object(holder)
        .and_then(|o| o.as_dict())
        .ok()
        .and_then(|d| d.get(key).ok())
        .and_then(|v| pdf.resolve(v).ok())
        .and_then(|v| v.as_array().ok())
        .map(|a| a.iter().any(|o| o.as_reference().ok() == Some(target)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{create_pdf_with_signature_fields, create_test_pdf};
    use lopdf::StringFormat;

    #[test]
    fn test_no_acroform_is_empty() {
        let pdf = PdfDocument::from_bytes(&create_test_pdf(2, "Plain")).unwrap();
        let arena = FieldArena::build(&pdf).unwrap();
        assert!(arena.entries().is_empty());
    }

    #[test]
    fn test_indexes_merged_widget_fields() {
        let pdf = PdfDocument::from_bytes(&create_pdf_with_signature_fields(3)).unwrap();
        let arena = FieldArena::build(&pdf).unwrap();

        assert_eq!(arena.signature_count(), 3);
        assert_eq!(arena.signed_count(), 0);
        let entry = arena.find("sig2").unwrap();
        assert!(entry.is_signature());
        assert_eq!(entry.widgets, vec![entry.id]);
        assert_eq!(entry.parent, None);
    }

    #[test]
    fn test_hierarchical_names_and_inherited_type() {
        let mut pdf = PdfDocument::from_bytes(&create_test_pdf(1, "Tree")).unwrap();
        let doc = pdf.doc_mut();

        let child_id = doc.new_object_id();
        let parent_id = doc.add_object(Object::Dictionary({
            let mut d = Dictionary::new();
            d.set("T", Object::String(b"approvals".to_vec(), StringFormat::Literal));
            d.set("FT", Object::Name(b"Sig".to_vec()));
            d.set("Kids", Object::Array(vec![Object::Reference(child_id)]));
            d
        }));
        doc.objects.insert(
            child_id,
            Object::Dictionary({
                let mut d = Dictionary::new();
                d.set("T", Object::String(b"manager".to_vec(), StringFormat::Literal));
                d.set("Subtype", Object::Name(b"Widget".to_vec()));
                d.set("Parent", Object::Reference(parent_id));
                d
            }),
        );
        let acroform = acroform_id(doc, true).unwrap().unwrap();
        push_reference(doc, acroform, b"Fields", parent_id).unwrap();

        let arena = FieldArena::build(&pdf).unwrap();
        assert_eq!(arena.entries().len(), 1);
        let entry = arena.find("approvals.manager").unwrap();
        assert!(entry.is_signature());
        assert_eq!(entry.parent, Some(parent_id));
    }

    #[test]
    fn test_cyclic_kids_terminate() {
        let mut pdf = PdfDocument::from_bytes(&create_test_pdf(1, "Cycle")).unwrap();
        let doc = pdf.doc_mut();

        let a = doc.new_object_id();
        let b = doc.new_object_id();
        for (id, other, name) in [(a, b, "a"), (b, a, "b")] {
            let mut d = Dictionary::new();
            d.set("T", Object::String(name.as_bytes().to_vec(), StringFormat::Literal));
            d.set("Kids", Object::Array(vec![Object::Reference(other)]));
            doc.objects.insert(id, Object::Dictionary(d));
        }
        let acroform = acroform_id(doc, true).unwrap().unwrap();
        push_reference(doc, acroform, b"Fields", a).unwrap();

        assert!(FieldArena::build(&pdf).is_ok());
    }

    #[test]
    fn test_removal_markers() {
        let pdf = PdfDocument::from_bytes(&create_pdf_with_signature_fields(2)).unwrap();
        let mut arena = FieldArena::build(&pdf).unwrap();
        arena.mark_removed(0);
        assert_eq!(arena.signature_count(), 1);
        assert_eq!(arena.live().count(), 1);
        assert_eq!(arena.entries().len(), 2);
    }

    #[test]
    fn test_remove_reference_from_direct_and_indirect_arrays() {
        let mut pdf = PdfDocument::from_bytes(&create_pdf_with_signature_fields(2)).unwrap();
        let arena = FieldArena::build(&pdf).unwrap();
        let first = arena.entries()[0].id;
        let doc = pdf.doc_mut();
        let acroform = acroform_id(doc, false).unwrap().unwrap();

        assert!(remove_reference(doc, acroform, b"Fields", first).unwrap());
        assert!(!remove_reference(doc, acroform, b"Fields", first).unwrap());
        assert!(!references(&pdf, acroform, b"Fields", first));
        assert_eq!(FieldArena::build(&pdf).unwrap().signature_count(), 1);
    }
}
