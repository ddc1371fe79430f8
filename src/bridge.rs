//! Bridge – the four generation operations built on [`ProcessRunner`].
//!
//! Each call walks the same states: validate the caller's input, resolve the
//! generator, run it, interpret what it left behind. Nothing is kept between
//! calls.
//!
//! The generator's exit code alone is not trusted. A zero exit still fails
//! when the expected PDF file is missing (file variants) or stdout is empty
//! (stream variants).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::locator::{GeneratorLocator, ProbeLocator};
use crate::runner::{ChildInvocation, ChildResult, ProcessRunner};

/// Which kind of document the generator renders (`-t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Invoice,
    /// Official confirmation of receipt (UPO).
    Upo,
}

impl DocumentKind {
    pub fn as_arg(self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Upo => "upo",
        }
    }
}

/// Invoice-only generator parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceParams {
    /// KSeF reference number (`--nrKSeF`).
    pub invoice_id: String,
    /// QR code URL template (`--qrCode`); the generator expands `{hash}`,
    /// `{nip}` and `{p1}` itself.
    pub qr_payload: String,
}

impl InvoiceParams {
    pub fn new(invoice_id: impl Into<String>, qr_payload: impl Into<String>) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            qr_payload: qr_payload.into(),
        }
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.invoice_id.trim().is_empty() {
            return Err(BridgeError::Validation("invoice requires a KSeF number".into()));
        }
        if self.qr_payload.trim().is_empty() {
            return Err(BridgeError::Validation(
                "invoice requires a QR code payload".into(),
            ));
        }
        Ok(())
    }
}

/// What a successful operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// The generator wrote this file.
    File(PathBuf),
    /// The rendered PDF, never empty.
    Bytes(Vec<u8>),
}

/// The tagged result of one bridge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success(Artifact),
    Failure { code: i32, message: String },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success(_))
    }

    /// `0` on success, otherwise the failure's result code.
    pub fn code(&self) -> i32 {
        match self {
            OperationOutcome::Success(_) => 0,
            OperationOutcome::Failure { code, .. } => *code,
        }
    }
}

impl From<BridgeError> for OperationOutcome {
    fn from(err: BridgeError) -> Self {
        OperationOutcome::Failure {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl<T: Into<Artifact>> From<Result<T, BridgeError>> for OperationOutcome {
    fn from(result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(artifact) => OperationOutcome::Success(artifact.into()),
            Err(err) => err.into(),
        }
    }
}

impl From<PathBuf> for Artifact {
    fn from(path: PathBuf) -> Self {
        Artifact::File(path)
    }
}

impl From<Vec<u8>> for Artifact {
    fn from(bytes: Vec<u8>) -> Self {
        Artifact::Bytes(bytes)
    }
}

/// Where the generator reads its document from.
#[derive(Debug, Clone, Copy)]
enum Source<'a> {
    File {
        input: &'a Path,
        output: Option<&'a Path>,
    },
    /// XML on stdin, PDF on stdout.
    Stream,
}

/// Drives the generator executable.
#[derive(Debug, Clone)]
pub struct Bridge<L = ProbeLocator> {
    locator: L,
    runner: ProcessRunner,
}

impl Bridge<ProbeLocator> {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            ProbeLocator::from_config(config),
            ProcessRunner::with_timeout(config.timeout()),
        )
    }
}

impl<L: GeneratorLocator> Bridge<L> {
    pub fn new(locator: L, runner: ProcessRunner) -> Self {
        Self { locator, runner }
    }

    /// Render the invoice at `xml_path` into `output_path` (default: next to
    /// the XML, see [`default_output_path`]). Returns the PDF path.
    pub fn generate_invoice(
        &self,
        xml_path: &Path,
        invoice: &InvoiceParams,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, BridgeError> {
        self.generate_file(DocumentKind::Invoice, xml_path, Some(invoice), output_path)
    }

    /// Render the UPO at `xml_path`. Returns the PDF path.
    pub fn generate_upo(
        &self,
        xml_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, BridgeError> {
        self.generate_file(DocumentKind::Upo, xml_path, None, output_path)
    }

    /// Render an in-memory invoice. Returns the PDF bytes.
    pub fn generate_invoice_from_bytes(
        &self,
        xml: &[u8],
        invoice: &InvoiceParams,
    ) -> Result<Vec<u8>, BridgeError> {
        self.generate_bytes(DocumentKind::Invoice, xml, Some(invoice))
    }

    /// Render an in-memory UPO. Returns the PDF bytes.
    pub fn generate_upo_from_bytes(&self, xml: &[u8]) -> Result<Vec<u8>, BridgeError> {
        self.generate_bytes(DocumentKind::Upo, xml, None)
    }

    fn generate_file(
        &self,
        kind: DocumentKind,
        xml_path: &Path,
        invoice: Option<&InvoiceParams>,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, BridgeError> {
        if !xml_path.exists() {
            return Err(BridgeError::Validation(format!(
                "document does not exist: {}",
                xml_path.display()
            )));
        }
        if let Some(params) = invoice {
            params.validate()?;
        }
        let output_path = output_path.filter(|p| !p.as_os_str().is_empty());

        let generator = self.locator.locate()?;
        let source = Source::File {
            input: xml_path,
            output: output_path,
        };
        let invocation = ChildInvocation::new(generator).args(build_args(kind, invoice, source));
        let result = self.runner.run(&invocation)?;
        check_exit(&result)?;

        let expected = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(xml_path));
        if !expected.is_file() {
            log::warn!(
                "Generator exited with 0 but {} does not exist",
                expected.display()
            );
            return Err(BridgeError::Postcondition(format!(
                "PDF file not produced: {}",
                expected.display()
            )));
        }

        log::info!("Generated {} PDF at {}", kind.as_arg(), expected.display());
        Ok(expected)
    }

    fn generate_bytes(
        &self,
        kind: DocumentKind,
        xml: &[u8],
        invoice: Option<&InvoiceParams>,
    ) -> Result<Vec<u8>, BridgeError> {
        if xml.iter().all(u8::is_ascii_whitespace) {
            return Err(BridgeError::Validation("no XML data".into()));
        }
        if let Some(params) = invoice {
            params.validate()?;
        }

        let generator = self.locator.locate()?;
        let invocation = ChildInvocation::new(generator)
            .args(build_args(kind, invoice, Source::Stream))
            .input(xml.to_vec());
        let result = self.runner.run(&invocation)?;
        check_exit(&result)?;

        if result.stdout.is_empty() {
            log::warn!("Generator exited with 0 but wrote nothing to stdout");
            return Err(BridgeError::Postcondition("no output produced".into()));
        }

        log::info!(
            "Generated {} PDF ({} bytes) from {} bytes of XML",
            kind.as_arg(),
            result.stdout.len(),
            xml.len()
        );
        Ok(result.stdout)
    }
}

/// Where the generator writes when no `-o` is given: the input path with a
/// trailing `.xml` replaced by `.pdf`, or `.pdf` appended otherwise.
pub fn default_output_path(xml_path: &Path) -> PathBuf {
    match xml_path.extension() {
        Some(ext) if ext == "xml" => xml_path.with_extension("pdf"),
        _ => {
            let mut path = xml_path.as_os_str().to_owned();
            path.push(".pdf");
            PathBuf::from(path)
        }
    }
}

fn build_args(kind: DocumentKind, invoice: Option<&InvoiceParams>, source: Source<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if let Source::File { input, .. } = source {
        args.push("-i".into());
        args.push(input.into());
    }

    args.push("-t".into());
    args.push(kind.as_arg().into());

    if let Some(params) = invoice {
        args.push("--nrKSeF".into());
        args.push(params.invoice_id.as_str().into());
        args.push("--qrCode".into());
        args.push(params.qr_payload.as_str().into());
    }

    match source {
        Source::File {
            output: Some(output),
            ..
        } => {
            args.push("-o".into());
            args.push(output.into());
        }
        Source::File { output: None, .. } => {}
        Source::Stream => args.push("--stream".into()),
    }

    args
}

fn check_exit(result: &ChildResult) -> Result<(), BridgeError> {
    if result.success() {
        return Ok(());
    }
    let stderr = result.stderr.trim();
    log::warn!("Generator exited with {}: {stderr}", result.exit_code);
    let message = if stderr.is_empty() {
        format!("generator exited with code {}", result.exit_code)
    } else {
        stderr.to_string()
    };
    Err(BridgeError::ChildFailure {
        code: result.exit_code,
        message,
    })
}
