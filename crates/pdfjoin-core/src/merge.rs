//! PDF Merge algorithm
//!
//! Combines multiple PDFs into a single document.

use crate::error::PdfJoinError;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;

/// Page attributes a page may inherit from its ancestors
const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"Resources", b"CropBox", b"Rotate"];

/// Merge multiple PDFs into one
///
/// The algorithm:
/// 1. If empty, return error
/// 2. Load every input; any failure aborts with `InvalidFileContent`
/// 3. Start from the first document as the destination
/// 4. For each further source document:
///    a. Pin inherited page attributes onto each page
///    b. Import all objects with IDs shifted past the destination's
///    c. Append pages and form fields to the destination
/// 5. Compress and return the merged result
pub fn merge_documents(documents: &[Vec<u8>]) -> Result<Vec<u8>, PdfJoinError> {
    if documents.is_empty() {
        return Err(PdfJoinError::OperationError("No documents to merge".into()));
    }

    let mut loaded = Vec::with_capacity(documents.len());
    for (index, bytes) in documents.iter().enumerate() {
        let doc = Document::load_mem(bytes).map_err(|e| PdfJoinError::InvalidFileContent {
            index,
            reason: e.to_string(),
        })?;
        loaded.push(doc);
    }

    let mut dest = merge_loaded(loaded)?;
    dest.compress();

    let mut buffer = Vec::new();
    dest.save_to(&mut buffer)
        .map_err(|e| PdfJoinError::OperationError(format!("Failed to save merged PDF: {}", e)))?;

    tracing::info!(
        "Merged {} documents into {} bytes",
        documents.len(),
        buffer.len()
    );
    Ok(buffer)
}

/// Merge already-parsed documents, consuming them
pub fn merge_loaded(documents: Vec<Document>) -> Result<Document, PdfJoinError> {
    let mut documents = documents.into_iter();
    let mut dest = documents
        .next()
        .ok_or_else(|| PdfJoinError::OperationError("No documents to merge".into()))?;

    let pages_id = pages_root(&dest)?;
    let mut dest_page_refs: Vec<ObjectId> = dest.get_pages().values().copied().collect();
    let mut dest_fields = acroform_fields(&dest);
    let mut dest_max_id = dest.max_id;

    for mut source in documents {
        let source_pages: Vec<ObjectId> = source.get_pages().values().copied().collect();
        for page_id in &source_pages {
            pin_inherited_attributes(&mut source, *page_id);
        }
        let source_fields = acroform_fields(&source);

        let id_offset = dest_max_id;
        let remapped: BTreeMap<ObjectId, Object> = source
            .objects
            .into_iter()
            .map(|(old_id, object)| ((old_id.0 + id_offset, old_id.1), remap_object_refs(object, id_offset)))
            .collect();
        dest.objects.extend(remapped);

        dest_page_refs.extend(source_pages.iter().map(|id| (id.0 + id_offset, id.1)));
        dest_fields.extend(
            source_fields
                .into_iter()
                .map(|o| remap_object_refs(o, id_offset)),
        );

        dest_max_id = (source.max_id + id_offset).max(dest_max_id);
    }

    dest.max_id = dest_max_id;
    update_page_tree(&mut dest, pages_id, &dest_page_refs)?;
    if !dest_fields.is_empty() {
        set_acroform_fields(&mut dest, dest_fields)?;
    }
    // Drops the source catalogs and page tree roots
    dest.prune_objects();
    Ok(dest)
}

fn pages_root(doc: &Document) -> Result<ObjectId, PdfJoinError> {
    doc.catalog()
        .and_then(|c| c.get(b"Pages"))
        .and_then(|p| p.as_reference())
        .map_err(|_| PdfJoinError::OperationError("No Pages reference in catalog".into()))
}

/// Copy attributes a page inherits from its ancestors onto the page itself
fn pin_inherited_attributes(doc: &mut Document, page_id: ObjectId) {
    let mut inherited = Dictionary::new();
    for key in INHERITABLE {
        let Ok(page) = doc.get_dictionary(page_id) else {
            return;
        };
        if page.has(key) {
            continue;
        }
        let mut parent = page.get(b"Parent").and_then(|p| p.as_reference()).ok();
        let mut depth = 0;
        while let (Some(id), true) = (parent, depth < 32) {
            let Ok(node) = doc.get_dictionary(id) else {
                break;
            };
            if let Ok(value) = node.get(key) {
                inherited.set(key.to_vec(), value.clone());
                break;
            }
            parent = node.get(b"Parent").and_then(|p| p.as_reference()).ok();
            depth += 1;
        }
    }

    if let Ok(page) = doc.get_object_mut(page_id).and_then(|o| o.as_dict_mut()) {
        for (key, value) in inherited.iter() {
            page.set(key.clone(), value.clone());
        }
    }
}

/// Top-level `/AcroForm /Fields` entries, empty when absent
fn acroform_fields(doc: &Document) -> Vec<Object> {
    let Ok(acroform) = doc.catalog().and_then(|c| c.get(b"AcroForm")) else {
        return vec![];
    };
    let acroform = match acroform {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    };
    let fields = acroform.and_then(|a| a.get(b"Fields").ok());
    let fields = match fields {
        Some(Object::Reference(id)) => doc.get_object(*id).and_then(|o| o.as_array()).ok(),
        Some(Object::Array(array)) => Some(array),
        _ => None,
    };
    fields.cloned().unwrap_or_default()
}

fn set_acroform_fields(doc: &mut Document, fields: Vec<Object>) -> Result<(), PdfJoinError> {
    let existing = doc
        .catalog()
        .ok()
        .and_then(|c| c.get(b"AcroForm").ok())
        .cloned();

    if let Some(Object::Reference(id)) = existing {
        if let Ok(dict) = doc.get_object_mut(id).and_then(|o| o.as_dict_mut()) {
            dict.set("Fields", Object::Array(fields));
            return Ok(());
        }
    }

    let mut dict = match existing {
        Some(Object::Dictionary(dict)) => dict,
        _ => Dictionary::new(),
    };
    dict.set("Fields", Object::Array(fields));
    let id = doc.add_object(Object::Dictionary(dict));
    doc.catalog_mut()
        .map_err(|_| PdfJoinError::OperationError("Invalid catalog".into()))?
        .set("AcroForm", Object::Reference(id));
    Ok(())
}

/// Recursively remap object references in an object
fn remap_object_refs(obj: Object, offset: u32) -> Object {
    match obj {
        Object::Reference(id) => Object::Reference((id.0 + offset, id.1)),
        Object::Array(arr) => Object::Array(
            arr.into_iter()
                .map(|o| remap_object_refs(o, offset))
                .collect(),
        ),
        Object::Dictionary(dict) => Object::Dictionary(remap_dictionary(dict, offset)),
        Object::Stream(mut stream) => {
            stream.dict = remap_dictionary(stream.dict, offset);
            Object::Stream(stream)
        }
        other => other,
    }
}

fn remap_dictionary(dict: Dictionary, offset: u32) -> Dictionary {
    let mut remapped = Dictionary::new();
    for (key, value) in dict.iter() {
        remapped.set(key.clone(), remap_object_refs(value.clone(), offset));
    }
    remapped
}

/// Point the destination page tree at `page_refs`, flattened under one node
fn update_page_tree(
    doc: &mut Document,
    pages_id: ObjectId,
    page_refs: &[ObjectId],
) -> Result<(), PdfJoinError> {
    for page_id in page_refs {
        if let Ok(page) = doc.get_object_mut(*page_id).and_then(|o| o.as_dict_mut()) {
            page.set("Parent", Object::Reference(pages_id));
        }
    }

    let pages_dict = doc
        .get_dictionary_mut(pages_id)
        .map_err(|_| PdfJoinError::OperationError("Invalid pages dictionary".into()))?;
    let kids = page_refs
        .iter()
        .map(|&id| Object::Reference(id))
        .collect::<Vec<_>>();
    pages_dict.set("Kids", Object::Array(kids));
    pages_dict.set("Count", Object::Integer(page_refs.len() as i64));

    Ok(())
}
