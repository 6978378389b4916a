//! PDF parsing and manipulation using lopdf

use crate::error::{PdfError, Result};
use lopdf::{Dictionary, Document, Object, ObjectId};

/// Bound on parent-chain and reference walks; real page trees are shallow
const MAX_DEPTH: usize = 32;

/// US Letter, used when no MediaBox is found anywhere in the page tree
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Wrapper around lopdf::Document
#[derive(Debug, Clone)]
pub struct PdfDocument {
    doc: Document,
}

impl PdfDocument {
    /// Load a PDF from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc = Document::load_mem(bytes).map_err(|e| PdfError::Parse(e.to_string()))?;
        Ok(Self { doc })
    }

    pub fn from_document(doc: Document) -> Self {
        Self { doc }
    }

    pub fn into_inner(self) -> Document {
        self.doc
    }

    /// Get the number of pages
    pub fn page_count(&self) -> u32 {
        self.doc.get_pages().len() as u32
    }

    /// Get page object ID for a given page number (1-indexed)
    pub fn page_id(&self, page_num: u32) -> Option<ObjectId> {
        self.doc.get_pages().get(&page_num).copied()
    }

    /// Get page dimensions (MediaBox) as [x, y, width, height]
    pub fn page_dimensions(&self, page_num: u32) -> Result<[f64; 4]> {
        let page_id = self
            .page_id(page_num)
            .ok_or(PdfError::PageNotFound(page_num))?;

        match self.inherited_attribute(page_id, b"MediaBox") {
            Some(media_box) => self.parse_rect(media_box),
            None => Ok(DEFAULT_MEDIA_BOX),
        }
    }

    /// Look up `key` on a page node, walking up `/Parent` links
    pub fn inherited_attribute(&self, node_id: ObjectId, key: &[u8]) -> Option<&Object> {
        let mut current = node_id;
        for _ in 0..MAX_DEPTH {
            let dict = self.doc.get_object(current).ok()?.as_dict().ok()?;
            if let Ok(value) = dict.get(key) {
                return Some(value);
            }
            current = dict.get(b"Parent").ok()?.as_reference().ok()?;
        }
        None
    }

    /// Follow references until a direct object is reached
    pub fn resolve<'a>(&'a self, obj: &'a Object) -> Result<&'a Object> {
        let mut current = obj;
        for _ in 0..MAX_DEPTH {
            match current {
                Object::Reference(id) => {
                    current = self
                        .doc
                        .get_object(*id)
                        .map_err(|e| PdfError::Malformed(format!("dangling reference: {}", e)))?;
                }
                direct => return Ok(direct),
            }
        }
        Err(PdfError::Malformed("reference chain too deep".to_string()))
    }

    /// Resolve `obj` and require a dictionary (or a stream's dictionary)
    pub fn resolve_dict<'a>(&'a self, obj: &'a Object) -> Result<&'a Dictionary> {
        match self.resolve(obj)? {
            Object::Dictionary(dict) => Ok(dict),
            Object::Stream(stream) => Ok(&stream.dict),
            _ => Err(PdfError::Malformed("expected a dictionary".to_string())),
        }
    }

    /// The document catalog's object id
    pub fn catalog_id(&self) -> Result<ObjectId> {
        self.doc
            .trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .map_err(|_| PdfError::Malformed("trailer has no /Root reference".to_string()))
    }

    /// Parse a PDF rectangle array into [x, y, width, height]
    pub fn parse_rect(&self, obj: &Object) -> Result<[f64; 4]> {
        let arr = self
            .resolve(obj)?
            .as_array()
            .map_err(|_| PdfError::Malformed("rectangle is not an array".to_string()))?;

        if arr.len() != 4 {
            return Err(PdfError::Malformed(format!(
                "rectangle has {} elements, expected 4",
                arr.len()
            )));
        }

        let mut values = [0.0f64; 4];
        for (i, obj) in arr.iter().enumerate() {
            values[i] = self.extract_number(obj)?;
        }

        // Normalize corners so width and height are never negative
        let (x0, x1) = (values[0].min(values[2]), values[0].max(values[2]));
        let (y0, y1) = (values[1].min(values[3]), values[1].max(values[3]));
        Ok([x0, y0, x1 - x0, y1 - y0])
    }

    /// Extract a number from a PDF object
    pub fn extract_number(&self, obj: &Object) -> Result<f64> {
        match self.resolve(obj)? {
            Object::Integer(i) => Ok(*i as f64),
            Object::Real(r) => Ok(f64::from(*r)),
            _ => Err(PdfError::Malformed("expected a number".to_string())),
        }
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    /// Get mutable access to the internal document
    pub fn doc_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    /// Save the document to bytes
    pub fn save_to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.doc
            .save_to(&mut buffer)
            .map_err(|e| PdfError::Save(e.to_string()))?;
        Ok(buffer)
    }
}
