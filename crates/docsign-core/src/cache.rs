//! Operation-scoped cache of page dimensions
//!
//! Created by the caller for one operation and passed down explicitly,
//! so nothing outlives the request that filled it.

use crate::error::Result;
use shared_pdf::PdfDocument;
use shared_types::{CollectionId, DocumentId};
use std::collections::HashMap;

type PageKey = (CollectionId, DocumentId, u32);

#[derive(Debug, Default)]
pub struct OperationCache {
    page_dimensions: HashMap<PageKey, [f64; 4]>,
    parses: usize,
}

impl OperationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// MediaBox of `page`, parsing `pdf` only on a miss
    pub fn page_dimensions(
        &mut self,
        collection: CollectionId,
        document: DocumentId,
        page: u32,
        pdf: &[u8],
    ) -> Result<[f64; 4]> {
        let key = (collection, document, page);
        if let Some(dims) = self.page_dimensions.get(&key) {
            return Ok(*dims);
        }

        let parsed = PdfDocument::from_bytes(pdf)?;
        self.parses += 1;
        for page_num in 1..=parsed.page_count() {
            let dims = parsed.page_dimensions(page_num)?;
            self.page_dimensions
                .insert((collection, document, page_num), dims);
        }

        self.page_dimensions
            .get(&key)
            .copied()
            .ok_or_else(|| shared_pdf::PdfError::PageNotFound(page).into())
    }

    /// Forget a document's pages after its content changed
    pub fn invalidate(&mut self, collection: CollectionId, document: DocumentId) {
        self.page_dimensions
            .retain(|(c, d, _), _| !(*c == collection && *d == document));
    }

    /// How many times a PDF had to be parsed
    pub fn parses(&self) -> usize {
        self.parses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_pdf::fixtures::create_test_pdf;

    #[test]
    fn test_second_lookup_is_a_hit() {
        let pdf = create_test_pdf(3, "Cache");
        let mut cache = OperationCache::new();
        let (c, d) = (CollectionId::new(), DocumentId::new());

        let first = cache.page_dimensions(c, d, 1, &pdf).unwrap();
        let third = cache.page_dimensions(c, d, 3, &pdf).unwrap();

        assert_eq!(first, [0.0, 0.0, 612.0, 792.0]);
        assert_eq!(third, first);
        assert_eq!(cache.parses(), 1);
    }

    #[test]
    fn test_missing_page() {
        let pdf = create_test_pdf(1, "Cache");
        let mut cache = OperationCache::new();
        assert!(cache
            .page_dimensions(CollectionId::new(), DocumentId::new(), 5, &pdf)
            .is_err());
    }

    #[test]
    fn test_invalidate_forces_reparse() {
        let pdf = create_test_pdf(1, "Cache");
        let mut cache = OperationCache::new();
        let (c, d) = (CollectionId::new(), DocumentId::new());

        cache.page_dimensions(c, d, 1, &pdf).unwrap();
        cache.invalidate(c, d);
        cache.page_dimensions(c, d, 1, &pdf).unwrap();

        assert_eq!(cache.parses(), 2);
    }
}
