//! ksef-bridge – run the KSeF PDF generator through the bridge from a shell.
//!
//! Usage:
//!   ksef-bridge invoice <input.xml> --nr-ksef <id> --qr-code <url> [-o out.pdf] [--stream] [--config cfg.json]
//!   ksef-bridge upo <input.xml> [-o out.pdf] [--stream] [--config cfg.json]
//!
//! With `--stream` the XML is read into memory and piped to the generator;
//! the PDF comes back on its stdout and is written to the output path. If
//! `-o` is omitted the PDF lands next to the input file.

use std::path::{Path, PathBuf};
use std::{env, fs, process};

use ksef_pdf_bridge::bridge::default_output_path;
use ksef_pdf_bridge::{Bridge, BridgeConfig, BridgeError, DocumentKind, InvoiceParams};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut kind: Option<DocumentKind> = None;
    let mut input_path: Option<PathBuf> = None;
    let mut output_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut nr_ksef: Option<String> = None;
    let mut qr_code: Option<String> = None;
    let mut stream = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stream" => stream = true,
            "--output" | "-o" => {
                output_path = Some(PathBuf::from(value_of(arg, iter.next(), &args[0])))
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(value_of(arg, iter.next(), &args[0])))
            }
            "--nr-ksef" => nr_ksef = Some(value_of(arg, iter.next(), &args[0])),
            "--qr-code" => qr_code = Some(value_of(arg, iter.next(), &args[0])),
            "--help" | "-h" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown flag: {other}");
                print_usage(&args[0]);
                process::exit(1);
            }
            "invoice" if kind.is_none() => kind = Some(DocumentKind::Invoice),
            "upo" if kind.is_none() => kind = Some(DocumentKind::Upo),
            path if kind.is_some() && input_path.is_none() => {
                input_path = Some(PathBuf::from(path))
            }
            other => {
                eprintln!("Unexpected argument: {other}");
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let (kind, input) = match (kind, input_path) {
        (Some(k), Some(i)) => (k, i),
        _ => {
            eprintln!("Error: a document type and an input file are required.");
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    let config = match config_path {
        Some(path) => match fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| BridgeConfig::from_json(&s))
        {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error reading config '{}': {e}", path.display());
                process::exit(1);
            }
        },
        None => BridgeConfig::from_env(),
    };

    let invoice = match kind {
        DocumentKind::Invoice => Some(InvoiceParams::new(
            nr_ksef.unwrap_or_default(),
            qr_code.unwrap_or_default(),
        )),
        DocumentKind::Upo => None,
    };

    let bridge = Bridge::from_config(&config);
    let result = if stream {
        generate_streamed(&bridge, kind, invoice.as_ref(), &input, output_path)
    } else {
        match &invoice {
            Some(params) => bridge.generate_invoice(&input, params, output_path.as_deref()),
            None => bridge.generate_upo(&input, output_path.as_deref()),
        }
    };

    match result {
        Ok(written) => eprintln!("Wrote '{}'", written.display()),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(exit_status(&e));
        }
    }
}

fn generate_streamed(
    bridge: &Bridge,
    kind: DocumentKind,
    invoice: Option<&InvoiceParams>,
    input: &Path,
    output: Option<PathBuf>,
) -> Result<PathBuf, BridgeError> {
    let xml = fs::read(input).map_err(|e| {
        BridgeError::Validation(format!("cannot read '{}': {e}", input.display()))
    })?;

    let pdf = match (kind, invoice) {
        (DocumentKind::Invoice, Some(params)) => {
            bridge.generate_invoice_from_bytes(&xml, params)?
        }
        _ => bridge.generate_upo_from_bytes(&xml)?,
    };

    let output = output.unwrap_or_else(|| default_output_path(input));
    fs::write(&output, &pdf).map_err(|e| {
        BridgeError::Postcondition(format!("cannot write '{}': {e}", output.display()))
    })?;
    Ok(output)
}

fn value_of(flag: &str, value: Option<&String>, prog: &str) -> String {
    match value {
        Some(v) => v.clone(),
        None => {
            eprintln!("Missing value for {flag}");
            print_usage(prog);
            process::exit(1);
        }
    }
}

/// Map a bridge error to a process exit status in `1..=255`.
fn exit_status(err: &BridgeError) -> i32 {
    match err.code() {
        code @ 1..=255 => code,
        _ => 1,
    }
}

fn print_usage(prog: &str) {
    eprintln!("ksef-bridge – KSeF PDF generator bridge (ksef-pdf-bridge)");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {prog} invoice <input.xml> --nr-ksef <id> --qr-code <url> [-o out.pdf] [--stream]");
    eprintln!("  {prog} upo <input.xml> [-o out.pdf] [--stream]");
    eprintln!();
    eprintln!("Flags:");
    eprintln!("  --output, -o   Output PDF path (default: input path with .pdf)");
    eprintln!("  --stream       Send the XML over stdin and read the PDF from stdout");
    eprintln!("  --config, -c   JSON bridge config (default: from KSEF_PDF_* environment)");
    eprintln!("  --nr-ksef      KSeF number (invoices only)");
    eprintln!("  --qr-code      QR code URL template (invoices only)");
    eprintln!("  --help         Print this message");
}
