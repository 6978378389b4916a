//! Subcommand implementations

use anyhow::{bail, Context, Result};
use docsign_core::{
    EngineConfig, LocalKeyStoreSigner, SplitOutcome, SplitProcessStore, SplitSignatureEngine,
    SystemClock,
};
use shared_crypto::{keys::common_name, verify_detached, CertificateIssuer, KeyStore};
use shared_pdf::{byte_range_digest, extract_signatures, normalized_to_pdf, PdfDocument};
use shared_types::{CollectionId, DocumentId, NormalizedRect, SignaturePlacement, SignerId};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct SignArgs {
    pub keystore: PathBuf,
    pub password: String,
    pub field: String,
    pub page: u32,
    pub rect: String,
    pub reason: String,
}

/// Outcome of checking one embedded signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReport {
    pub field_name: String,
    pub signer_name: Option<String>,
    pub covers_whole_document: bool,
    pub valid: bool,
    pub error: Option<String>,
}

impl fmt::Display for SignatureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signer = self.signer_name.as_deref().unwrap_or("unknown signer");
        match (&self.error, self.covers_whole_document) {
            (Some(error), _) => write!(f, "{}: INVALID ({})", self.field_name, error),
            (None, true) => write!(f, "{}: valid, signed by {}", self.field_name, signer),
            (None, false) => write!(
                f,
                "{}: valid, signed by {} (later revisions follow)",
                self.field_name, signer
            ),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Parse "x,y,width,height" in page-relative units
pub fn parse_rect(value: &str) -> Result<NormalizedRect> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid rectangle: {}", value))?;
    let [x, y, width, height] = parts.as_slice() else {
        bail!("Rectangle needs four values, got {}", parts.len());
    };
    Ok(NormalizedRect::new(*x, *y, *width, *height)?)
}

pub fn issue_cert(config: &EngineConfig, dn: &str, password: &str, out: &Path) -> Result<()> {
    let issuer = CertificateIssuer::new(config.crypto.issuer_settings());
    let blob = issuer
        .issue(dn, password)
        .with_context(|| format!("Failed to issue certificate for {}", dn))?;
    write(out, &blob)?;
    tracing::info!("Wrote key store for {} to {}", dn, out.display());
    Ok(())
}

pub fn inspect_keystore(path: &Path, password: &str) -> Result<String> {
    let store = KeyStore::open(&read(path)?, password).context("Failed to open key store")?;
    let tbs = &store.certificate.tbs_certificate;
    Ok(format!(
        "name:    {}\nsubject: {}\nsigner:  {}",
        store.friendly_name,
        tbs.subject,
        common_name(&store.certificate).unwrap_or_default()
    ))
}

pub fn flatten(input: &Path, output: &Path, only_signed: bool) -> Result<()> {
    let (pdf, report) =
        pdfjoin_core::flatten_document(&read(input)?, only_signed).context("Flatten failed")?;
    write(output, &pdf)?;
    tracing::info!(
        "Flattened {} fields, removed {} ({} rounds)",
        report.flattened,
        report.removed,
        report.rounds
    );
    Ok(())
}

pub fn merge(inputs: &[PathBuf], output: &Path) -> Result<()> {
    let documents = inputs
        .iter()
        .map(|path| read(path))
        .collect::<Result<Vec<_>>>()?;
    let merged = pdfjoin_core::merge_documents(&documents).context("Merge failed")?;
    write(output, &merged)?;
    tracing::info!("Merged {} documents into {}", inputs.len(), output.display());
    Ok(())
}

/// Sign one field through the split pipeline with a local key store
pub fn sign(config: &EngineConfig, args: &SignArgs, input: &Path, output: &Path) -> Result<()> {
    let pdf = read(input)?;
    let signer = LocalKeyStoreSigner::open(&read(&args.keystore)?, &args.password)
        .context("Failed to open key store")?;
    let signer_name = signer
        .signer_name()
        .unwrap_or_else(|| "Unknown signer".to_string());

    let media_box = PdfDocument::from_bytes(&pdf)
        .and_then(|doc| doc.page_dimensions(args.page))
        .with_context(|| format!("Cannot place a field on page {}", args.page))?;
    let placement = SignaturePlacement {
        field_name: args.field.clone(),
        page: args.page,
        rect: normalized_to_pdf(&parse_rect(&args.rect)?, media_box),
        signer_name,
        reason: args.reason.clone(),
        image: None,
    };

    let engine = SplitSignatureEngine::new(
        Arc::new(SplitProcessStore::new()),
        Arc::new(SystemClock),
        config.crypto.contents_capacity,
    );
    let outcome = engine
        .begin(
            CollectionId::new(),
            DocumentId::new(),
            SignerId::new(),
            pdf,
            None,
            vec![placement],
            &signer,
        )
        .context("Signing failed")?;

    match outcome {
        SplitOutcome::Completed(state) => {
            write(output, &state.current_pdf)?;
            tracing::info!("Signed field {} into {}", args.field, output.display());
            Ok(())
        }
        SplitOutcome::Pending { token, .. } => {
            bail!("Local signing unexpectedly deferred (process {})", token)
        }
    }
}

pub fn verify(path: &Path) -> Result<Vec<SignatureReport>> {
    let pdf = read(path)?;
    let signatures = extract_signatures(&pdf).context("Failed to read signatures")?;

    Ok(signatures
        .into_iter()
        .map(|sig| {
            let checked = byte_range_digest(&pdf, &sig.byte_range)
                .map_err(|e| e.to_string())
                .and_then(|digest| verify_detached(&sig.contents, &digest).map_err(|e| e.to_string()));
            match checked {
                Ok(verified) => SignatureReport {
                    field_name: sig.field_name,
                    signer_name: verified.signer_name,
                    covers_whole_document: sig.covers_whole_document,
                    valid: true,
                    error: None,
                },
                Err(error) => {
                    tracing::warn!("Signature {} failed verification: {}", sig.field_name, error);
                    SignatureReport {
                        field_name: sig.field_name,
                        signer_name: None,
                        covers_whole_document: sig.covers_whole_document,
                        valid: false,
                        error: Some(error),
                    }
                }
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::IssuerSettings;
    use shared_pdf::fixtures::create_test_pdf;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.crypto.pbkdf2_iterations = 1_000;
        config
    }

    #[test]
    fn test_parse_rect() {
        let rect = parse_rect("0.1, 0.2, 0.3, 0.1").unwrap();
        assert_eq!(rect.x(), 0.1);
        assert!(parse_rect("0.1,0.2,0.3").is_err());
        assert!(parse_rect("0.9,0.2,0.3,0.1").is_err());
        assert!(parse_rect("a,b,c,d").is_err());
    }

    #[test]
    fn test_issue_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jane.p8");

        issue_cert(&config(), "CN=Jane Doe,O=Acme", "pw", &path).unwrap();
        let summary = inspect_keystore(&path, "pw").unwrap();

        assert!(summary.contains("Jane Doe"));
        assert!(inspect_keystore(&path, "wrong").is_err());
    }

    #[test]
    fn test_sign_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = dir.path().join("signer.p8");
        let input = dir.path().join("in.pdf");
        let output = dir.path().join("out.pdf");

        let blob = CertificateIssuer::new(IssuerSettings {
            pbkdf2_iterations: 1_000,
            ..IssuerSettings::default()
        })
        .issue("CN=Jane Doe", "pw")
        .unwrap();
        fs::write(&keystore, blob).unwrap();
        fs::write(&input, create_test_pdf(1, "Contract")).unwrap();

        let args = SignArgs {
            keystore,
            password: "pw".to_string(),
            field: "approval".to_string(),
            page: 1,
            rect: "0.1,0.8,0.35,0.08".to_string(),
            reason: "Approval".to_string(),
        };
        sign(&config(), &args, &input, &output).unwrap();

        let reports = verify(&output).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].valid);
        assert_eq!(reports[0].signer_name.as_deref(), Some("Jane Doe"));
        assert!(reports[0].covers_whole_document);
        assert!(verify(&input).unwrap().is_empty());
    }

    #[test]
    fn test_merge_and_flatten() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        let merged = dir.path().join("merged.pdf");
        let flat = dir.path().join("flat.pdf");
        fs::write(&a, create_test_pdf(2, "A")).unwrap();
        fs::write(&b, create_test_pdf(1, "B")).unwrap();

        merge(&[a, b], &merged).unwrap();
        assert_eq!(
            pdfjoin_core::get_page_count(&fs::read(&merged).unwrap()).unwrap(),
            3
        );

        flatten(&merged, &flat, false).unwrap();
        assert!(flat.exists());
    }

    #[test]
    fn test_missing_input_names_the_file() {
        let err = flatten(Path::new("/nonexistent/in.pdf"), Path::new("/tmp/out.pdf"), true)
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/in.pdf"));
    }
}
