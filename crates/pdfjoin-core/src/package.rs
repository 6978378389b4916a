//! Final packaging: flatten every document, then merge them
//!
//! Each input is loaded on its own, its signed fields are baked in and its
//! remaining signature placeholders are stripped. The flattened copies are
//! written to a scratch directory for the operation and concatenated into
//! one PDF. Any input that fails to load aborts the whole package.

use crate::error::PdfJoinError;
use crate::merge::merge_documents;
use crate::scratch::ScratchSpace;
use shared_pdf::{flatten, FlattenReport, PdfDocument};
use shared_types::OperationId;
use std::path::Path;

/// Result of [`package_documents`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutput {
    pub pdf: Vec<u8>,
    pub page_count: u32,
    /// Per input document: signed fields baked in
    pub baked: Vec<usize>,
    /// Per input document: placeholders removed
    pub stripped: Vec<usize>,
}

/// Flatten a single document given as bytes.
///
/// # Arguments
/// * `bytes` - Source PDF
/// * `only_signed` - Bake signed fields (`true`) or delete all signature fields (`false`)
pub fn flatten_document(
    bytes: &[u8],
    only_signed: bool,
) -> Result<(Vec<u8>, FlattenReport), PdfJoinError> {
    let mut pdf = load(0, bytes)?;
    let report = flatten(&mut pdf, only_signed)?;
    Ok((pdf.save_to_bytes()?, report))
}

fn load(index: usize, bytes: &[u8]) -> Result<PdfDocument, PdfJoinError> {
    PdfDocument::from_bytes(bytes).map_err(|e| PdfJoinError::InvalidFileContent {
        index,
        reason: e.to_string(),
    })
}

/// Flatten and merge `inputs` into one PDF.
///
/// # Arguments
/// * `inputs` - Documents in output order
/// * `scratch_root` - Parent of the per-operation scratch directory
/// * `operation_id` - Names the scratch directory
///
/// # Returns
/// The merged PDF; its page count equals the sum of the inputs'
pub fn package_documents(
    inputs: &[Vec<u8>],
    scratch_root: &Path,
    operation_id: OperationId,
) -> Result<PackageOutput, PdfJoinError> {
    if inputs.is_empty() {
        return Err(PdfJoinError::OperationError("No documents to merge".into()));
    }

    let mut scratch = ScratchSpace::new(scratch_root, operation_id)?;
    let mut expected_pages = 0u32;
    let mut baked = Vec::with_capacity(inputs.len());
    let mut stripped = Vec::with_capacity(inputs.len());

    for (index, bytes) in inputs.iter().enumerate() {
        let mut pdf = load(index, bytes)?;
        expected_pages += pdf.page_count();

        let signed = flatten(&mut pdf, true)?;
        let placeholders = flatten(&mut pdf, false)?;
        baked.push(signed.flattened);
        stripped.push(placeholders.removed);

        scratch.write(&format!("{:04}.pdf", index), &pdf.save_to_bytes()?)?;
    }

    let pdf = merge_documents(&scratch.read_all()?)?;
    let page_count = PdfDocument::from_bytes(&pdf)?.page_count();
    if page_count != expected_pages {
        return Err(PdfJoinError::OperationError(format!(
            "merged document has {} pages, expected {}",
            page_count, expected_pages
        )));
    }
    scratch.close()?;

    tracing::info!(
        "Packaged {} documents ({} pages) for operation {}",
        inputs.len(),
        page_count,
        operation_id
    );

    Ok(PackageOutput {
        pdf,
        page_count,
        baked,
        stripped,
    })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use shared_pdf::fixtures::create_test_pdf;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// Property: packaging preserves the total page count and leaves no scratch files
        #[test]
        fn package_page_count(pages in proptest::collection::vec(1u32..4, 1..4)) {
            let root = tempfile::tempdir().unwrap();
            let inputs: Vec<Vec<u8>> = pages
                .iter()
                .enumerate()
                .map(|(i, n)| create_test_pdf(*n, &format!("Doc{}", i)))
                .collect();

            let output = package_documents(&inputs, root.path(), OperationId::new()).unwrap();

            prop_assert_eq!(output.page_count, pages.iter().sum::<u32>());
            prop_assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        }
    }
}
