//! Integration tests for the bridge operations against fake generators.
//!
//! These tests validate:
//! - the argument list handed to the generator
//! - file postconditions and default output naming
//! - byte-stream payloads, including large inputs
//! - propagation of the generator's exit code and stderr
//! - timeouts and idempotence

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use common::*;
use ksef_pdf_bridge::error::{CODE_POSTCONDITION, CODE_TIMEOUT};
use ksef_pdf_bridge::{
    Bridge, BridgeConfig, BridgeError, InvoiceParams, LaunchError, OperationOutcome,
    ProcessRunner,
};
use serial_test::serial;
use sha2::{Digest, Sha256};

// =====================================================================
// Helper
// =====================================================================

fn bridge_for(generator: &FakeGenerator) -> Bridge<PathBuf> {
    Bridge::new(generator.path.clone(), ProcessRunner::new())
}

fn params() -> InvoiceParams {
    InvoiceParams::new(
        "1234567890-20250314-ABCDEF-01",
        "https://ksef.mf.gov.pl/client-app/invoice/{nip}/{p1}/{hash}",
    )
}

/// Switches the process working directory for the lifetime of the guard.
struct WorkingDir(PathBuf);

impl WorkingDir {
    fn enter(dir: &Path) -> Self {
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        WorkingDir(previous)
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        std::env::set_current_dir(&self.0).unwrap();
    }
}

fn assert_pdf(bytes: &[u8]) {
    assert!(bytes.starts_with(b"%PDF-"), "Missing PDF header");
}

// =====================================================================
// File-path operations
// =====================================================================

#[test]
#[serial]
fn invoice_from_file_writes_next_to_xml() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let xml = gen.write_doc("FA_2025_001.xml", INVOICE_XML);

    let pdf = bridge_for(&gen).generate_invoice(&xml, &params(), None).unwrap();

    assert_eq!(pdf, gen.file("FA_2025_001.pdf"));
    assert_pdf(&read(&pdf));
    assert_eq!(
        gen.recorded_args(),
        [
            "-i",
            xml.to_str().unwrap(),
            "-t",
            "invoice",
            "--nrKSeF",
            "1234567890-20250314-ABCDEF-01",
            "--qrCode",
            "https://ksef.mf.gov.pl/client-app/invoice/{nip}/{p1}/{hash}",
        ]
    );
}

#[test]
#[serial]
fn upo_to_explicit_output_with_spaces() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let xml = gen.write_doc("upo.xml", UPO_XML);
    let out = gen.file("potwierdzenie odbioru.pdf");

    let pdf = bridge_for(&gen).generate_upo(&xml, Some(&out)).unwrap();

    assert_eq!(pdf, out);
    let bytes = read(&out);
    assert!(bytes.starts_with(b"%PDF-1.7 upo\n"));
    assert_eq!(
        gen.recorded_args(),
        ["-i", xml.to_str().unwrap(), "-t", "upo", "-o", out.to_str().unwrap()]
    );
}

#[test]
#[serial]
fn empty_output_path_means_default() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let xml = gen.write_doc("upo.xml", UPO_XML);

    let pdf = bridge_for(&gen).generate_upo(&xml, Some(Path::new(""))).unwrap();

    assert_eq!(pdf, gen.file("upo.pdf"));
    assert!(!gen.recorded_args().contains(&"-o".to_string()));
}

#[test]
#[serial]
fn zero_exit_without_file_is_a_failure() {
    let gen = FakeGenerator::new(SILENT);
    let xml = gen.write_doc("upo.xml", UPO_XML);

    let err = bridge_for(&gen).generate_upo(&xml, None).unwrap_err();

    assert!(matches!(err, BridgeError::Postcondition(_)));
    assert_eq!(err.code(), CODE_POSTCONDITION);
    assert!(err.to_string().starts_with("PDF file not produced"));
}

#[test]
#[serial]
fn removed_output_flips_success_to_failure() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let xml = gen.write_doc("upo.xml", UPO_XML);
    let bridge = bridge_for(&gen);

    let pdf = bridge.generate_upo(&xml, None).unwrap();
    assert!(pdf.is_file());

    // Same generator run, but the PDF disappears before it can be checked.
    let vanishing = FakeGenerator::new(&format!("{WELL_BEHAVED}\nrm -f \"$output\"\n"));
    let err = bridge_for(&vanishing).generate_upo(&xml, None).unwrap_err();
    assert!(matches!(err, BridgeError::Postcondition(_)), "got {err:?}");
}

#[test]
#[serial]
fn rejecting_generator_propagates_code_and_stderr() {
    let gen = FakeGenerator::new(REJECTING);
    let xml = gen.write_doc("fa.xml", INVOICE_XML);

    let err = bridge_for(&gen).generate_invoice(&xml, &params(), None).unwrap_err();

    assert_eq!(err.code(), 3);
    assert_eq!(
        err.to_string(),
        "PDF generation failed: Błąd podczas parsowania XML: unexpected end of input"
    );
}

#[test]
#[serial]
fn missing_generator_is_a_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let xml = dir.path().join("upo.xml");
    std::fs::write(&xml, UPO_XML).unwrap();

    let config = BridgeConfig {
        generator_name: "ksef-pdf-generator-missing".into(),
        search_dirs: vec![dir.path().to_path_buf()],
        ..BridgeConfig::default()
    };
    let err = Bridge::from_config(&config).generate_upo(&xml, None).unwrap_err();

    assert!(matches!(err, BridgeError::Resolution { .. }));
    assert!(err.to_string().starts_with("generator not found"));
}

#[test]
#[serial]
fn configured_search_dir_is_probed() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let xml = gen.write_doc("upo.xml", UPO_XML);

    let config = BridgeConfig {
        search_dirs: vec![gen.dir.path().to_path_buf()],
        ..BridgeConfig::default()
    };
    let pdf = Bridge::from_config(&config).generate_upo(&xml, None).unwrap();
    assert!(pdf.is_file());
}

#[test]
#[serial]
fn generator_in_working_directory_is_launched() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let _cwd = WorkingDir::enter(gen.dir.path());

    let pdf = Bridge::from_config(&BridgeConfig::default())
        .generate_upo_from_bytes(UPO_XML.as_bytes())
        .unwrap();

    assert!(pdf.starts_with(b"%PDF-1.7 upo\n"));
    assert_eq!(gen.recorded_args(), ["-t", "upo", "--stream"]);
}

#[test]
#[serial]
fn relative_generator_path_is_resolved_against_working_directory() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let _cwd = WorkingDir::enter(gen.dir.path());
    let xml = gen.write_doc("upo.xml", UPO_XML);

    let config = BridgeConfig {
        generator_name: "not-on-disk".into(),
        generator_path: Some(PathBuf::from("ksef-pdf-generator")),
        ..BridgeConfig::default()
    };
    let pdf = Bridge::from_config(&config).generate_upo(&xml, None).unwrap();

    assert_eq!(pdf, gen.file("upo.pdf"));
}

// =====================================================================
// Byte-stream operations
// =====================================================================

#[test]
#[serial]
fn invoice_from_bytes_returns_stdout() {
    let gen = FakeGenerator::new(WELL_BEHAVED);

    let pdf = bridge_for(&gen)
        .generate_invoice_from_bytes(INVOICE_XML.as_bytes(), &params())
        .unwrap();

    assert_pdf(&pdf);
    assert!(pdf.ends_with(INVOICE_XML.as_bytes()));
    assert_eq!(
        gen.recorded_args(),
        [
            "-t",
            "invoice",
            "--nrKSeF",
            "1234567890-20250314-ABCDEF-01",
            "--qrCode",
            "https://ksef.mf.gov.pl/client-app/invoice/{nip}/{p1}/{hash}",
            "--stream",
        ]
    );
}

#[test]
#[serial]
fn upo_from_bytes_returns_stdout() {
    let gen = FakeGenerator::new(WELL_BEHAVED);

    let pdf = bridge_for(&gen).generate_upo_from_bytes(UPO_XML.as_bytes()).unwrap();

    assert!(pdf.starts_with(b"%PDF-1.7 upo\n"));
    assert_eq!(gen.recorded_args(), ["-t", "upo", "--stream"]);
}

#[test]
#[serial]
fn empty_stdout_is_a_failure() {
    let gen = FakeGenerator::new(SILENT);

    let outcome: OperationOutcome = bridge_for(&gen)
        .generate_upo_from_bytes(UPO_XML.as_bytes())
        .into();

    match outcome {
        OperationOutcome::Failure { code, message } => {
            assert_eq!(code, CODE_POSTCONDITION);
            assert_eq!(message, "no output produced");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
#[serial]
fn ten_megabyte_document_round_trips() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let mut xml = String::from("<Faktura>");
    while xml.len() < 10 * 1024 * 1024 {
        xml.push_str("<Wiersz><P_7>Usługa serwisowa</P_7><P_8B>1</P_8B></Wiersz>");
    }
    xml.push_str("</Faktura>");

    let bridge = Bridge::new(
        gen.path.clone(),
        ProcessRunner::with_timeout(Some(Duration::from_secs(120))),
    );
    let pdf = bridge.generate_invoice_from_bytes(xml.as_bytes(), &params()).unwrap();

    assert!(pdf.ends_with(xml.as_bytes()));
}

#[test]
#[serial]
fn repeated_calls_are_byte_identical() {
    let gen = FakeGenerator::new(WELL_BEHAVED);
    let bridge = bridge_for(&gen);

    let digests: Vec<_> = (0..3)
        .map(|_| {
            let pdf = bridge
                .generate_invoice_from_bytes(INVOICE_XML.as_bytes(), &params())
                .unwrap();
            Sha256::digest(&pdf)
        })
        .collect();

    assert_eq!(digests[0], digests[1]);
    assert_eq!(digests[1], digests[2]);
}

// =====================================================================
// Timeouts
// =====================================================================

#[test]
#[serial]
fn hanging_generator_times_out() {
    let gen = FakeGenerator::new(HANGING);
    let bridge = Bridge::new(
        gen.path.clone(),
        ProcessRunner::with_timeout(Some(Duration::from_millis(300))),
    );

    let started = Instant::now();
    let err = bridge.generate_upo_from_bytes(UPO_XML.as_bytes()).unwrap_err();

    assert!(
        matches!(err, BridgeError::Launch(LaunchError::Timeout(_))),
        "got {err:?}"
    );
    assert_eq!(err.code(), CODE_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(20));
}
