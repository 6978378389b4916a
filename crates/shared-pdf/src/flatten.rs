//! Signature field flattening
//!
//! `flatten(pdf, true)` bakes the appearance of every signed signature
//! field into its page and removes the interactive field.
//! `flatten(pdf, false)` deletes signature fields outright, which strips
//! unsigned placeholders before final packaging.
//!
//! Work happens in rounds over a fresh [`FieldArena`]. Each round
//! re-counts the candidate fields; the loop stops when none remain or
//! when a round leaves the count unchanged, so a document with K
//! candidates needs at most K rounds.

use crate::document::PdfDocument;
use crate::error::{PdfError, Result};
use crate::fields::{acroform_id, references, remove_reference, FieldArena, FieldEntry};
use lopdf::{Dictionary, Object, ObjectId, Stream};
use std::collections::HashSet;

/// Outcome of a flatten call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlattenReport {
    pub rounds: usize,
    /// Fields whose appearance was baked into page content
    pub flattened: usize,
    /// Fields deleted without keeping an appearance
    pub removed: usize,
    /// Signature fields still present afterwards
    pub remaining: usize,
}

fn candidate_count(pdf: &PdfDocument, only_signed: bool) -> Result<usize> {
    let arena = FieldArena::build(pdf)?;
    Ok(if only_signed {
        arena.signed_count()
    } else {
        arena.signature_count()
    })
}

/// Flatten or delete signature fields.
///
/// # Arguments
/// * `pdf` - Document to mutate in place
/// * `only_signed` - Bake signed fields (`true`) or delete all signature fields (`false`)
///
/// # Returns
/// Counts of what was done; fields that could not be handled are left in place
pub fn flatten(pdf: &mut PdfDocument, only_signed: bool) -> Result<FlattenReport> {
    let mut report = FlattenReport::default();
    let mut wrapped_pages = HashSet::new();
    let mut before = candidate_count(pdf, only_signed)?;

    while before > 0 {
        report.rounds += 1;
        let mut arena = FieldArena::build(pdf)?;
        let candidates: Vec<usize> = arena
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                !f.removed && f.is_signature() && (!only_signed || f.has_value)
            })
            .map(|(i, _)| i)
            .collect();

        for index in candidates {
            let entry = arena.entries()[index].clone();
            if only_signed {
                if bake_field(pdf, &entry, &mut wrapped_pages)? {
                    report.flattened += 1;
                    arena.mark_removed(index);
                }
            } else {
                detach_field(pdf, &entry)?;
                report.removed += 1;
                arena.mark_removed(index);
            }
        }

        let after = candidate_count(pdf, only_signed)?;
        if after == before {
            tracing::warn!(
                "Flatten made no progress in round {} ({} fields left)",
                report.rounds,
                after
            );
            break;
        }
        before = after;
    }

    if report.flattened + report.removed > 0 {
        pdf.doc_mut().prune_objects();
    }

    report.remaining = FieldArena::build(pdf)?.signature_count();
    if report.remaining == 0 {
        if let Some(acroform) = acroform_id(pdf.doc_mut(), false)? {
            if let Ok(dict) = pdf
                .doc_mut()
                .get_object_mut(acroform)
                .and_then(|o| o.as_dict_mut())
            {
                dict.remove(b"SigFlags");
            }
        }
    }

    tracing::info!(
        "Flattened document: {} baked, {} removed, {} remaining after {} rounds",
        report.flattened,
        report.removed,
        report.remaining,
        report.rounds
    );
    Ok(report)
}

/// Page that lists `widget` in its `/Annots`, falling back to `/P`
fn page_of_widget(pdf: &PdfDocument, widget: ObjectId) -> Option<ObjectId> {
    pdf.doc()
        .get_pages()
        .values()
        .copied()
        .find(|page| references(pdf, *page, b"Annots", widget))
        .or_else(|| {
            pdf.doc()
                .get_object(widget)
                .and_then(|o| o.as_dict())
                .and_then(|d| d.get(b"P"))
                .and_then(|p| p.as_reference())
                .ok()
        })
}

/// Normal appearance of a widget, honoring `/AS` for state dictionaries
fn normal_appearance(pdf: &PdfDocument, widget: &Dictionary) -> Option<Object> {
    let ap = pdf.resolve_dict(widget.get(b"AP").ok()?).ok()?;
    let normal = ap.get(b"N").ok()?;

    let chosen = match normal {
        Object::Reference(id) => match pdf.doc().get_object(*id).ok()? {
            Object::Stream(_) => return Some(Object::Reference(*id)),
            Object::Dictionary(states) => states.get(widget.get(b"AS").ok()?.as_name().ok()?).ok()?,
            _ => return None,
        },
        Object::Dictionary(states) => states.get(widget.get(b"AS").ok()?.as_name().ok()?).ok()?,
        Object::Stream(_) => normal,
        _ => return None,
    };

    match chosen {
        Object::Reference(id) => match pdf.doc().get_object(*id).ok()? {
            Object::Stream(_) => Some(Object::Reference(*id)),
            _ => None,
        },
        Object::Stream(_) => Some(chosen.clone()),
        _ => None,
    }
}

struct Bake {
    page: ObjectId,
    appearance: Object,
    rect: [f64; 4],
}

/// Returns `false` when some widget has nothing to bake
fn bake_field(
    pdf: &mut PdfDocument,
    entry: &FieldEntry,
    wrapped_pages: &mut HashSet<ObjectId>,
) -> Result<bool> {
    let mut bakes = Vec::with_capacity(entry.widgets.len());
    for widget_id in &entry.widgets {
        let widget = pdf
            .doc()
            .get_object(*widget_id)
            .and_then(|o| o.as_dict())
            .map_err(|e| PdfError::Malformed(format!("widget {:?}: {}", widget_id, e)))?;

        let Some(appearance) = normal_appearance(pdf, widget) else {
            tracing::debug!("Signature field {} has no appearance to bake", entry.name);
            return Ok(false);
        };
        let Some(rect) = widget.get(b"Rect").ok().and_then(|r| pdf.parse_rect(r).ok()) else {
            return Ok(false);
        };
        let Some(page) = page_of_widget(pdf, *widget_id) else {
            continue;
        };
        bakes.push(Bake {
            page,
            appearance,
            rect,
        });
    }

    for bake in bakes {
        bake_into_page(pdf, bake, wrapped_pages)?;
    }
    detach_field(pdf, entry)?;
    Ok(true)
}

fn bake_into_page(
    pdf: &mut PdfDocument,
    bake: Bake,
    wrapped_pages: &mut HashSet<ObjectId>,
) -> Result<()> {
    let xobject_id = match bake.appearance {
        Object::Reference(id) => id,
        inline => pdf.doc_mut().add_object(inline),
    };

    let bbox = {
        let stream = pdf
            .doc_mut()
            .get_object_mut(xobject_id)
            .and_then(|o| o.as_stream_mut())
            .map_err(|e| PdfError::Malformed(format!("appearance {:?}: {}", xobject_id, e)))?;
        stream.dict.set("Type", Object::Name(b"XObject".to_vec()));
        stream.dict.set("Subtype", Object::Name(b"Form".to_vec()));
        stream.dict.get(b"BBox").ok().cloned()
    };
    let [bx, by, bw, bh] = bbox
        .and_then(|b| pdf.parse_rect(&b).ok())
        .unwrap_or([0.0, 0.0, bake.rect[2], bake.rect[3]]);

    let [x, y, w, h] = bake.rect;
    let sx = if bw > 0.0 { w / bw } else { 1.0 };
    let sy = if bh > 0.0 { h / bh } else { 1.0 };
    let tx = x - bx * sx;
    let ty = y - by * sy;

    let mut resources = pdf
        .inherited_attribute(bake.page, b"Resources")
        .map(|r| pdf.resolve_dict(r).cloned())
        .transpose()?
        .unwrap_or_default();
    let mut xobjects = resources
        .get(b"XObject")
        .ok()
        .map(|x| pdf.resolve_dict(x).cloned())
        .transpose()?
        .unwrap_or_default();

    let name = (0..)
        .map(|n| format!("FlatSig{}", n))
        .find(|n| !xobjects.has(n.as_bytes()))
        .unwrap_or_default();
    xobjects.set(name.clone(), Object::Reference(xobject_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    let existing = pdf
        .doc()
        .get_object(bake.page)
        .and_then(|o| o.as_dict())
        .ok()
        .and_then(|d| d.get(b"Contents").ok())
        .cloned();
    let mut contents = match existing {
        Some(Object::Array(parts)) => parts,
        Some(Object::Reference(id)) => match pdf.doc().get_object(id) {
            Ok(Object::Array(parts)) => parts.clone(),
            _ => vec![Object::Reference(id)],
        },
        _ => vec![],
    };

    if wrapped_pages.insert(bake.page) {
        let save = pdf
            .doc_mut()
            .add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
        let restore = pdf
            .doc_mut()
            .add_object(Stream::new(Dictionary::new(), b"\nQ\n".to_vec()));
        contents.insert(0, Object::Reference(save));
        contents.push(Object::Reference(restore));
    }

    let draw = format!(
        "q {} 0 0 {} {} {} cm /{} Do Q\n",
        sx, sy, tx, ty, name
    );
    let draw_id = pdf
        .doc_mut()
        .add_object(Stream::new(Dictionary::new(), draw.into_bytes()));
    contents.push(Object::Reference(draw_id));

    let page = pdf
        .doc_mut()
        .get_object_mut(bake.page)
        .and_then(|o| o.as_dict_mut())
        .map_err(|e| PdfError::Malformed(format!("page {:?}: {}", bake.page, e)))?;
    page.set("Contents", Object::Array(contents));
    page.set("Resources", Object::Dictionary(resources));
    Ok(())
}

/// Remove a field's widgets from their pages and the field from its container
fn detach_field(pdf: &mut PdfDocument, entry: &FieldEntry) -> Result<()> {
    for widget in &entry.widgets {
        if let Some(page) = page_of_widget(pdf, *widget) {
            remove_reference(pdf.doc_mut(), page, b"Annots", *widget)?;
        }
    }

    match entry.parent {
        Some(parent) => {
            remove_reference(pdf.doc_mut(), parent, b"Kids", entry.id)?;
        }
        None => {
            if let Some(acroform) = acroform_id(pdf.doc_mut(), false)? {
                remove_reference(pdf.doc_mut(), acroform, b"Fields", entry.id)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{create_pdf_with_signature_fields, create_test_pdf};
    use crate::signature::prepare_signature;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use shared_types::SignaturePlacement;

    fn sign_field(pdf: &[u8], name: &str) -> Vec<u8> {
        let placement = SignaturePlacement {
            field_name: name.to_string(),
            page: 1,
            rect: [72.0, 72.0, 200.0, 50.0],
            signer_name: "Alice".to_string(),
            reason: "Approved".to_string(),
            image: None,
        };
        prepare_signature(pdf, &placement, 64, Utc::now()).unwrap().pdf
    }

    fn annot_count(pdf: &PdfDocument, page: u32) -> usize {
        let page_id = pdf.page_id(page).unwrap();
        pdf.doc()
            .get_object(page_id)
            .unwrap()
            .as_dict()
            .unwrap()
            .get(b"Annots")
            .ok()
            .and_then(|a| pdf.resolve(a).ok())
            .and_then(|a| a.as_array().ok())
            .map(|a| a.len())
            .unwrap_or(0)
    }

    #[test]
    fn test_delete_mode_strips_every_signature_field() {
        let mut pdf = PdfDocument::from_bytes(&create_pdf_with_signature_fields(3)).unwrap();

        let report = flatten(&mut pdf, false).unwrap();

        assert_eq!(report.removed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.rounds, 1);
        assert_eq!(FieldArena::build(&pdf).unwrap().signature_count(), 0);
        for page in 1..=3 {
            assert_eq!(annot_count(&pdf, page), 0);
        }
    }

    #[test]
    fn test_nothing_to_flatten() {
        let mut pdf = PdfDocument::from_bytes(&create_test_pdf(2, "Plain")).unwrap();
        let report = flatten(&mut pdf, true).unwrap();
        assert_eq!(report, FlattenReport::default());
    }

    #[test]
    fn test_unsigned_fields_survive_signed_flatten() {
        let mut pdf = PdfDocument::from_bytes(&create_pdf_with_signature_fields(2)).unwrap();
        let report = flatten(&mut pdf, true).unwrap();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.remaining, 2);
    }

    #[test]
    fn test_signed_field_is_baked_into_page() {
        let signed = sign_field(&create_pdf_with_signature_fields(2), "sig1");
        let mut pdf = PdfDocument::from_bytes(&signed).unwrap();

        let report = flatten(&mut pdf, true).unwrap();

        assert_eq!(report.flattened, 1);
        assert_eq!(report.remaining, 1);
        let arena = FieldArena::build(&pdf).unwrap();
        assert!(arena.find("sig1").is_none());
        assert!(arena.find("sig2").is_some());
        assert_eq!(annot_count(&pdf, 1), 0);

        let page_id = pdf.page_id(1).unwrap();
        let content = pdf.doc().get_page_content(page_id).unwrap();
        let content = String::from_utf8_lossy(&content);
        assert!(content.contains("/FlatSig0 Do"));
        assert!(content.contains("-Page-1"));
    }

    #[test]
    fn test_flattened_document_survives_save_and_reload() {
        let signed = sign_field(&create_test_pdf(1, "Reload"), "approval");
        let mut pdf = PdfDocument::from_bytes(&signed).unwrap();
        flatten(&mut pdf, true).unwrap();

        let bytes = pdf.save_to_bytes().unwrap();
        let reloaded = PdfDocument::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.page_count(), 1);
        assert_eq!(FieldArena::build(&reloaded).unwrap().signature_count(), 0);
    }

    #[test]
    fn test_signed_field_without_appearance_stops_the_loop() {
        let signed = sign_field(&create_test_pdf(1, "NoAp"), "sig");
        let mut pdf = PdfDocument::from_bytes(&signed).unwrap();
        let field_id = FieldArena::build(&pdf).unwrap().find("sig").unwrap().id;
        pdf.doc_mut()
            .get_object_mut(field_id)
            .unwrap()
            .as_dict_mut()
            .unwrap()
            .remove(b"AP");

        let report = flatten(&mut pdf, true).unwrap();

        assert_eq!(report.rounds, 1);
        assert_eq!(report.flattened, 0);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn test_sig_flags_dropped_when_no_signature_fields_remain() {
        let signed = sign_field(&create_test_pdf(1, "Flags"), "sig");
        let mut pdf = PdfDocument::from_bytes(&signed).unwrap();

        flatten(&mut pdf, true).unwrap();

        let acroform = acroform_id(pdf.doc_mut(), false).unwrap().unwrap();
        let dict = pdf.doc().get_object(acroform).unwrap().as_dict().unwrap();
        assert!(!dict.has(b"SigFlags"));
    }
}
