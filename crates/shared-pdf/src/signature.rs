//! Signature placeholders, byte ranges and CMS injection
//!
//! Signing is a two-phase operation. [`prepare_signature`] writes a
//! signature dictionary whose `/Contents` is a zero-filled hex string and
//! fixes the `/ByteRange` around it; the caller then signs the digest of
//! those ranges elsewhere and hands the DER container to
//! [`inject_signature`], which overwrites the placeholder in place so the
//! signed bytes never move.

use crate::document::PdfDocument;
use crate::error::{PdfError, Result};
use crate::fields::{acroform_id, push_reference, FieldArena};
use chrono::{DateTime, Utc};
use lopdf::{Dictionary, Object, ObjectId, Stream, StringFormat};
use sha2::{Digest, Sha256};
use shared_types::{PreparedSignaturePdf, SignaturePlacement};

/// Bytes reserved for the DER signature container
pub const DEFAULT_CONTENTS_CAPACITY: usize = 8192;

/// Wide enough for any file offset below 10 GB once patched
const BYTE_RANGE_PLACEHOLDER: i64 = 9_999_999_999;

/// SigFlags: SignaturesExist | AppendOnly
const SIG_FLAGS: i64 = 3;

/// An empty signature field to create
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub page: u32,
    /// `[x, y, width, height]` in PDF coordinates
    pub rect: [f64; 4],
}

/// A signature found in a PDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedSignature {
    pub field_name: String,
    pub byte_range: [u64; 4],
    /// DER container, including any zero padding from the placeholder
    pub contents: Vec<u8>,
    /// The byte range starts at 0 and ends at the last byte of the file
    pub covers_whole_document: bool,
}

/// Escape special characters for content-stream string literals
fn escape_pdf_string(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '(' => "\\(".to_string(),
            ')' => "\\)".to_string(),
            '\\' => "\\\\".to_string(),
            _ if c.is_ascii() => c.to_string(),
            _ => "?".to_string(),
        })
        .collect()
}

fn rect_array(rect: [f64; 4]) -> Object {
    Object::Array(vec![
        Object::Real(rect[0] as f32),
        Object::Real(rect[1] as f32),
        Object::Real((rect[0] + rect[2]) as f32),
        Object::Real((rect[1] + rect[3]) as f32),
    ])
}

fn widget_dictionary(name: &str, page_id: ObjectId, rect: [f64; 4]) -> Dictionary {
    let mut widget = Dictionary::new();
    widget.set("Type", Object::Name(b"Annot".to_vec()));
    widget.set("Subtype", Object::Name(b"Widget".to_vec()));
    widget.set("FT", Object::Name(b"Sig".to_vec()));
    widget.set(
        "T",
        Object::String(name.as_bytes().to_vec(), StringFormat::Literal),
    );
    widget.set("Rect", rect_array(rect));
    // Print
    widget.set("F", Object::Integer(4));
    widget.set("P", Object::Reference(page_id));
    widget
}

/// Register a merged field/widget with the AcroForm and its page
fn attach_widget(pdf: &mut PdfDocument, page_id: ObjectId, widget_id: ObjectId) -> Result<()> {
    let doc = pdf.doc_mut();
    let acroform = acroform_id(doc, true)?
        .ok_or_else(|| PdfError::Malformed("could not create AcroForm".to_string()))?;
    push_reference(doc, acroform, b"Fields", widget_id)?;
    push_reference(doc, page_id, b"Annots", widget_id)
}

/// Add empty, unsigned signature fields to a PDF.
///
/// # Arguments
/// * `pdf` - Source PDF bytes
/// * `specs` - One entry per field to create
///
/// # Returns
/// The re-saved PDF
pub fn add_signature_fields(pdf: &[u8], specs: &[FieldSpec]) -> Result<Vec<u8>> {
    let mut doc = PdfDocument::from_bytes(pdf)?;
    for spec in specs {
        let page_id = doc
            .page_id(spec.page)
            .ok_or(PdfError::PageNotFound(spec.page))?;
        let widget = widget_dictionary(&spec.name, page_id, spec.rect);
        let widget_id = doc.doc_mut().add_object(Object::Dictionary(widget));
        attach_widget(&mut doc, page_id, widget_id)?;
    }
    doc.save_to_bytes()
}

fn signature_dictionary(
    placement: &SignaturePlacement,
    capacity: usize,
    signing_time: DateTime<Utc>,
) -> Dictionary {
    let mut sig = Dictionary::new();
    sig.set("Type", Object::Name(b"Sig".to_vec()));
    sig.set("Filter", Object::Name(b"Adobe.PPKLite".to_vec()));
    sig.set("SubFilter", Object::Name(b"adbe.pkcs7.detached".to_vec()));
    sig.set(
        "Contents",
        Object::String(vec![0; capacity], StringFormat::Hexadecimal),
    );
    sig.set(
        "ByteRange",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
            Object::Integer(BYTE_RANGE_PLACEHOLDER),
        ]),
    );
    let m = signing_time.format("D:%Y%m%d%H%M%S+00'00'").to_string();
    sig.set("M", Object::String(m.into_bytes(), StringFormat::Literal));
    sig.set(
        "Name",
        Object::String(placement.signer_name.as_bytes().to_vec(), StringFormat::Literal),
    );
    sig.set(
        "Reason",
        Object::String(placement.reason.as_bytes().to_vec(), StringFormat::Literal),
    );
    sig
}

/// Visible stamp: light box, signer name and reason
fn appearance_stream(placement: &SignaturePlacement) -> Object {
    let width = placement.rect[2].abs();
    let height = placement.rect[3].abs();
    let font_size = (height * 0.25).clamp(6.0, 10.0);
    let line1_y = (height - font_size - 2.0).max(0.0);

    let content = format!(
        "q\n\
0.9 0.95 1 rg\n\
0 0 {w} {h} re f\n\
0.2 0.4 0.8 RG\n\
1 w\n\
0.5 0.5 {w2} {h2} re S\n\
0 0 0 rg\n\
BT\n\
/F1 {fs} Tf\n\
4 {y1} Td\n\
({signer}) Tj\n\
0 -{fs2} Td\n\
({reason}) Tj\n\
ET\n\
Q",
        w = width,
        h = height,
        w2 = (width - 1.0).max(0.0),
        h2 = (height - 1.0).max(0.0),
        fs = font_size,
        y1 = line1_y,
        fs2 = font_size + 2.0,
        signer = escape_pdf_string(&placement.signer_name),
        reason = escape_pdf_string(&placement.reason),
    );

    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Form".to_vec()));
    dict.set("FormType", Object::Integer(1));
    dict.set(
        "BBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Real(width as f32),
            Object::Real(height as f32),
        ]),
    );

    let mut f1 = Dictionary::new();
    f1.set("Type", Object::Name(b"Font".to_vec()));
    f1.set("Subtype", Object::Name(b"Type1".to_vec()));
    f1.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    let mut fonts = Dictionary::new();
    fonts.set("F1", Object::Dictionary(f1));
    let mut resources = Dictionary::new();
    resources.set("Font", Object::Dictionary(fonts));
    dict.set("Resources", Object::Dictionary(resources));

    Object::Stream(Stream::new(dict, content.into_bytes()))
}

fn set_on_dict(pdf: &mut PdfDocument, id: ObjectId, key: &str, value: Object) -> Result<()> {
    pdf.doc_mut()
        .get_object_mut(id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|e| PdfError::Malformed(format!("{:?}: {}", id, e)))?
        .set(key, value);
    Ok(())
}

/// Add a signature placeholder for `placement` and fix its byte range.
///
/// An existing unsigned signature field with the same name is reused;
/// otherwise a new widget is created on `placement.page`.
///
/// # Arguments
/// * `pdf` - Current revision of the document
/// * `placement` - Field name, page and rectangle of the signature
/// * `capacity` - Bytes reserved for the DER container
/// * `signing_time` - Written to `/M`
pub fn prepare_signature(
    pdf: &[u8],
    placement: &SignaturePlacement,
    capacity: usize,
    signing_time: DateTime<Utc>,
) -> Result<PreparedSignaturePdf> {
    let mut doc = PdfDocument::from_bytes(pdf)?;
    let page_id = doc
        .page_id(placement.page)
        .ok_or(PdfError::PageNotFound(placement.page))?;

    let existing = FieldArena::build(&doc)?
        .find(&placement.field_name)
        .cloned();
    if let Some(entry) = &existing {
        if !entry.is_signature() {
            return Err(PdfError::Malformed(format!(
                "field {} is not a signature field",
                entry.name
            )));
        }
        if entry.has_value {
            return Err(PdfError::Malformed(format!(
                "field {} is already signed",
                entry.name
            )));
        }
    }

    let sig_id = doc
        .doc_mut()
        .add_object(Object::Dictionary(signature_dictionary(
            placement,
            capacity,
            signing_time,
        )));
    let appearance_id = doc.doc_mut().add_object(appearance_stream(placement));
    let mut ap = Dictionary::new();
    ap.set("N", Object::Reference(appearance_id));

    match existing {
        Some(entry) => {
            set_on_dict(&mut doc, entry.id, "V", Object::Reference(sig_id))?;
            for widget in &entry.widgets {
                set_on_dict(&mut doc, *widget, "AP", Object::Dictionary(ap.clone()))?;
            }
        }
        None => {
            let mut widget = widget_dictionary(&placement.field_name, page_id, placement.rect);
            widget.set("V", Object::Reference(sig_id));
            widget.set("AP", Object::Dictionary(ap));
            let widget_id = doc.doc_mut().add_object(Object::Dictionary(widget));
            attach_widget(&mut doc, page_id, widget_id)?;
        }
    }

    let acroform = acroform_id(doc.doc_mut(), true)?
        .ok_or_else(|| PdfError::Malformed("could not create AcroForm".to_string()))?;
    set_on_dict(&mut doc, acroform, "SigFlags", Object::Integer(SIG_FLAGS))?;

    // Full rewrite, not an incremental update: byte ranges of signatures
    // already in the file no longer cover the bytes they signed.
    let mut bytes = doc.save_to_bytes()?;
    let (lt, gt) = locate_contents(&bytes, sig_id, capacity)?;
    let byte_range = [0, lt as u64, (gt + 1) as u64, (bytes.len() - gt - 1) as u64];
    patch_byte_range(&mut bytes, sig_id, &byte_range)?;

    tracing::debug!(
        "Prepared signature field {} (byte range {:?})",
        placement.field_name,
        byte_range
    );

    Ok(PreparedSignaturePdf {
        pdf: bytes,
        byte_range,
        contents_capacity: capacity,
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Byte span of `id`'s serialized object, from its header to `endobj`
fn locate_object(bytes: &[u8], id: ObjectId) -> Result<(usize, usize)> {
    let header = format!("{} {} obj", id.0, id.1);
    let mut from = 0;
    while let Some(pos) = find(bytes, header.as_bytes(), from) {
        let boundary = pos == 0 || bytes[pos - 1].is_ascii_whitespace();
        if boundary {
            let end = find(bytes, b"endobj", pos)
                .ok_or_else(|| PdfError::PlaceholderNotFound(format!("object {} has no end", id.0)))?;
            return Ok((pos, end));
        }
        from = pos + 1;
    }
    Err(PdfError::PlaceholderNotFound(format!(
        "object {} not found in output",
        id.0
    )))
}

/// Offsets of the `<` and `>` delimiting the signature's `/Contents`
fn locate_contents(bytes: &[u8], sig_id: ObjectId, capacity: usize) -> Result<(usize, usize)> {
    let (start, end) = locate_object(bytes, sig_id)?;
    let object = &bytes[start..end];

    let key = find(object, b"/Contents", 0)
        .ok_or_else(|| PdfError::PlaceholderNotFound("/Contents".to_string()))?;
    let lt = object[key + b"/Contents".len()..]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|p| p + key + b"/Contents".len())
        .filter(|&p| object[p] == b'<')
        .ok_or_else(|| PdfError::PlaceholderNotFound("/Contents is not a hex string".to_string()))?;
    let gt = find(object, b">", lt)
        .ok_or_else(|| PdfError::PlaceholderNotFound("unterminated /Contents".to_string()))?;

    if gt - lt - 1 != capacity * 2 {
        return Err(PdfError::PlaceholderNotFound(format!(
            "/Contents holds {} hex digits, expected {}",
            gt - lt - 1,
            capacity * 2
        )));
    }
    Ok((start + lt, start + gt))
}

/// Overwrite the `/ByteRange` placeholder, padding with spaces
fn patch_byte_range(bytes: &mut [u8], sig_id: ObjectId, byte_range: &[u64; 4]) -> Result<()> {
    let (start, end) = locate_object(bytes, sig_id)?;
    let key = find(&bytes[..end], b"/ByteRange", start)
        .ok_or_else(|| PdfError::PlaceholderNotFound("/ByteRange".to_string()))?;
    let open = find(&bytes[..end], b"[", key)
        .ok_or_else(|| PdfError::PlaceholderNotFound("/ByteRange array".to_string()))?;
    let close = find(&bytes[..end], b"]", open)
        .ok_or_else(|| PdfError::PlaceholderNotFound("/ByteRange array end".to_string()))?;

    let value = format!(
        "[{} {} {} {}]",
        byte_range[0], byte_range[1], byte_range[2], byte_range[3]
    );
    let slot = &mut bytes[open..=close];
    if value.len() > slot.len() {
        return Err(PdfError::PlaceholderNotFound(
            "/ByteRange placeholder too short".to_string(),
        ));
    }
    slot[..value.len()].copy_from_slice(value.as_bytes());
    slot[value.len()..].fill(b' ');
    Ok(())
}

/// The two byte-range slices concatenated.
///
/// Fails when the range does not start at 0, overlaps itself or runs
/// past the end of `pdf`.
pub fn signed_content(pdf: &[u8], byte_range: &[u64; 4]) -> Result<Vec<u8>> {
    let invalid = || PdfError::InvalidByteRange(*byte_range);
    let [start1, len1, start2, len2] = byte_range
        .map(usize::try_from)
        .map(|r| r.unwrap_or(usize::MAX));

    let end1 = start1.checked_add(len1).ok_or_else(invalid)?;
    let end2 = start2.checked_add(len2).ok_or_else(invalid)?;
    if start1 != 0 || end1 > start2 || end2 > pdf.len() {
        return Err(invalid());
    }

    let mut content = Vec::with_capacity(len1 + len2);
    content.extend_from_slice(&pdf[start1..end1]);
    content.extend_from_slice(&pdf[start2..end2]);
    Ok(content)
}

/// SHA-256 over the signed byte ranges
pub fn byte_range_digest(pdf: &[u8], byte_range: &[u64; 4]) -> Result<[u8; 32]> {
    let content = signed_content(pdf, byte_range)?;
    Ok(Sha256::digest(&content).into())
}

/// Write a DER signature container into a prepared placeholder.
///
/// Unused capacity stays zero-filled.
pub fn inject_signature(prepared: &PreparedSignaturePdf, cms: &[u8]) -> Result<Vec<u8>> {
    if cms.len() > prepared.contents_capacity {
        return Err(PdfError::SignatureTooLarge {
            size: cms.len(),
            capacity: prepared.contents_capacity,
        });
    }

    let invalid = || PdfError::InvalidByteRange(prepared.byte_range);
    let lt = usize::try_from(prepared.byte_range[1]).map_err(|_| invalid())?;
    let gt = usize::try_from(prepared.byte_range[2])
        .map_err(|_| invalid())?
        .checked_sub(1)
        .ok_or_else(invalid)?;
    let pdf = &prepared.pdf;
    if gt >= pdf.len()
        || pdf[lt] != b'<'
        || pdf[gt] != b'>'
        || gt - lt - 1 != prepared.contents_capacity * 2
    {
        return Err(invalid());
    }

    let encoded = hex::encode_upper(cms);
    let mut signed = pdf.clone();
    signed[lt + 1..lt + 1 + encoded.len()].copy_from_slice(encoded.as_bytes());
    Ok(signed)
}

/// Every signed signature field with its byte range and container
pub fn extract_signatures(pdf: &[u8]) -> Result<Vec<EmbeddedSignature>> {
    let doc = PdfDocument::from_bytes(pdf)?;
    let arena = FieldArena::build(&doc)?;
    let mut signatures = Vec::new();

    for field in arena.live().filter(|f| f.is_signed()) {
        let Ok(field_dict) = doc.doc().get_object(field.id).and_then(|o| o.as_dict()) else {
            continue;
        };
        let Ok(value) = field_dict.get(b"V") else {
            continue;
        };
        let value = doc.resolve_dict(value)?;

        let Some(byte_range) = value
            .get(b"ByteRange")
            .ok()
            .and_then(|br| doc.resolve(br).ok())
            .and_then(|br| br.as_array().ok())
            .filter(|br| br.len() == 4)
            .and_then(|br| {
                let mut range = [0u64; 4];
                for (slot, obj) in range.iter_mut().zip(br) {
                    *slot = match doc.resolve(obj).ok()? {
                        Object::Integer(i) => u64::try_from(*i).ok()?,
                        _ => return None,
                    };
                }
                Some(range)
            })
        else {
            tracing::warn!("Signature field {} has no usable /ByteRange", field.name);
            continue;
        };

        let contents = value
            .get(b"Contents")
            .and_then(|c| c.as_str())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        signatures.push(EmbeddedSignature {
            field_name: field.name.clone(),
            byte_range,
            contents,
            covers_whole_document: byte_range[0] == 0
                && byte_range[2].saturating_add(byte_range[3]) == pdf.len() as u64,
        });
    }

    signatures.sort_by_key(|s| s.byte_range[2]);
    Ok(signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{create_pdf_with_signature_fields, create_test_pdf};
    use chrono::TimeZone;

    fn placement(name: &str) -> SignaturePlacement {
        SignaturePlacement {
            field_name: name.to_string(),
            page: 1,
            rect: [72.0, 72.0, 200.0, 50.0],
            signer_name: "Jane (Signer)".to_string(),
            reason: "Approval".to_string(),
            image: None,
        }
    }

    fn signing_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_prepare_excludes_only_contents() {
        let pdf = create_test_pdf(1, "Prep");
        let prepared = prepare_signature(&pdf, &placement("sig"), 256, signing_time()).unwrap();

        let [start1, len1, start2, len2] = prepared.byte_range.map(|v| v as usize);
        assert_eq!(start1, 0);
        assert_eq!(prepared.pdf[len1], b'<');
        assert_eq!(prepared.pdf[start2 - 1], b'>');
        assert_eq!(start2 - len1, 256 * 2 + 2);
        assert_eq!(start2 + len2, prepared.pdf.len());
    }

    #[test]
    fn test_byte_range_is_written_into_the_file() {
        let pdf = create_test_pdf(1, "Prep");
        let prepared = prepare_signature(&pdf, &placement("sig"), 256, signing_time()).unwrap();

        let [a, b, c, d] = prepared.byte_range;
        let expected = format!("[{} {} {} {}]", a, b, c, d);
        assert!(find(&prepared.pdf, expected.as_bytes(), 0).is_some());
        assert!(find(&prepared.pdf, b"9999999999", 0).is_none());
    }

    #[test]
    fn test_injection_keeps_digest_stable() {
        let pdf = create_test_pdf(2, "Digest");
        let prepared = prepare_signature(&pdf, &placement("sig"), 256, signing_time()).unwrap();
        let before = byte_range_digest(&prepared.pdf, &prepared.byte_range).unwrap();

        let signed = inject_signature(&prepared, &[0x30, 0x03, 0x02, 0x01, 0x07]).unwrap();

        assert_eq!(signed.len(), prepared.pdf.len());
        assert_eq!(byte_range_digest(&signed, &prepared.byte_range).unwrap(), before);
    }

    #[test]
    fn test_extract_finds_injected_container() {
        let pdf = create_test_pdf(1, "Extract");
        let prepared = prepare_signature(&pdf, &placement("sig"), 128, signing_time()).unwrap();
        let cms = vec![0x30, 0x03, 0x02, 0x01, 0x07];
        let signed = inject_signature(&prepared, &cms).unwrap();

        let signatures = extract_signatures(&signed).unwrap();
        assert_eq!(signatures.len(), 1);
        let sig = &signatures[0];
        assert_eq!(sig.field_name, "sig");
        assert_eq!(sig.byte_range, prepared.byte_range);
        assert!(sig.covers_whole_document);
        assert_eq!(&sig.contents[..cms.len()], cms.as_slice());
        assert!(sig.contents[cms.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_oversized_container_is_rejected() {
        let pdf = create_test_pdf(1, "Big");
        let prepared = prepare_signature(&pdf, &placement("sig"), 16, signing_time()).unwrap();
        let err = inject_signature(&prepared, &[0u8; 17]).unwrap_err();
        assert_eq!(err, PdfError::SignatureTooLarge { size: 17, capacity: 16 });
    }

    #[test]
    fn test_existing_field_is_reused() {
        let pdf = create_pdf_with_signature_fields(2);
        let prepared = prepare_signature(&pdf, &placement("sig1"), 128, signing_time()).unwrap();

        let doc = PdfDocument::from_bytes(&prepared.pdf).unwrap();
        let arena = FieldArena::build(&doc).unwrap();
        assert_eq!(arena.signature_count(), 2);
        assert!(arena.find("sig1").unwrap().is_signed());
        assert!(!arena.find("sig2").unwrap().is_signed());
    }

    #[test]
    fn test_second_signature_rewrites_the_file() {
        let pdf = create_pdf_with_signature_fields(2);
        let cms = [0x30, 0x03, 0x02, 0x01, 0x07];
        let first = prepare_signature(&pdf, &placement("sig1"), 128, signing_time()).unwrap();
        let first_signed = inject_signature(&first, &cms).unwrap();
        let second =
            prepare_signature(&first_signed, &placement("sig2"), 128, signing_time()).unwrap();
        let both = inject_signature(&second, &cms).unwrap();

        let signatures = extract_signatures(&both).unwrap();
        assert_eq!(signatures.len(), 2);
        let sig1 = signatures.iter().find(|s| s.field_name == "sig1").unwrap();
        let sig2 = signatures.iter().find(|s| s.field_name == "sig2").unwrap();
        assert!(sig2.covers_whole_document);
        assert_eq!(sig1.byte_range, first.byte_range);
        assert!(!sig1.covers_whole_document);
    }

    #[test]
    fn test_signed_field_cannot_be_prepared_again() {
        let pdf = create_test_pdf(1, "Twice");
        let prepared = prepare_signature(&pdf, &placement("sig"), 64, signing_time()).unwrap();
        let err = prepare_signature(&prepared.pdf, &placement("sig"), 64, signing_time()).unwrap_err();
        assert!(matches!(err, PdfError::Malformed(_)));
    }

    #[test]
    fn test_missing_page() {
        let pdf = create_test_pdf(1, "Pages");
        let mut p = placement("sig");
        p.page = 3;
        assert_eq!(
            prepare_signature(&pdf, &p, 64, signing_time()).unwrap_err(),
            PdfError::PageNotFound(3)
        );
    }

    #[test]
    fn test_signed_content_rejects_bad_ranges() {
        let pdf = vec![0u8; 100];
        assert!(signed_content(&pdf, &[0, 10, 20, 80]).is_ok());
        assert!(signed_content(&pdf, &[1, 10, 20, 80]).is_err());
        assert!(signed_content(&pdf, &[0, 30, 20, 10]).is_err());
        assert!(signed_content(&pdf, &[0, 10, 20, 81]).is_err());
        assert!(signed_content(&pdf, &[0, u64::MAX, 20, 1]).is_err());
    }

    #[test]
    fn test_escape_pdf_string() {
        assert_eq!(escape_pdf_string("a(b)c\\"), "a\\(b\\)c\\\\");
        assert_eq!(escape_pdf_string("Zoë"), "Zo?");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: any byte outside the two ranges does not affect the digest
        #[test]
        fn gap_bytes_do_not_affect_digest(
            len1 in 1usize..64,
            gap in 1usize..32,
            len2 in 0usize..64,
            filler in any::<u8>(),
        ) {
            let total = len1 + gap + len2;
            let original: Vec<u8> = (0..total).map(|i| i as u8).collect();
            let mut altered = original.clone();
            for b in &mut altered[len1..len1 + gap] {
                *b = filler;
            }
            let range = [0, len1 as u64, (len1 + gap) as u64, len2 as u64];

            prop_assert_eq!(
                byte_range_digest(&original, &range).unwrap(),
                byte_range_digest(&altered, &range).unwrap()
            );
        }
    }
}
