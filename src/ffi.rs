//! C-compatible FFI API for the existing Delphi/C callers.
//!
//! # ABI Contract
//!
//! All exported functions use the `extern "C"` calling convention. The
//! generation entry points keep the symbol names the callers already link
//! against (`GenerateInvoicePDF`, `GenerateUPOPDF`,
//! `GenerateInvoicePDFFromStream`, `GenerateUPOPDFFromStream`, `FreeBuffer`).
//!
//! ## Result codes
//! - `0` – success.
//! - negative – the bridge failed locally (see [`crate::error`] for the
//!   individual codes).
//! - anything else – the generator's own exit code, passed through verbatim.
//!
//! ## Error messages
//! On failure a UTF-8 message is copied into the caller's `error_message`
//! buffer, truncated on a character boundary to `error_message_size - 1`
//! bytes and always NUL-terminated. On success the buffer holds an empty
//! string. A null buffer or a non-positive size skips the copy.
//!
//! ## Memory management
//! - PDF bytes returned by the `*FromStream` functions are allocated by this
//!   library. Callers **must** release them with `FreeBuffer`, exactly once.
//! - Releasing a pointer twice, or one not obtained from this library, is
//!   undefined behaviour and is not detected.
//! - Passing a null pointer to `FreeBuffer` is a no-op.
//!
//! ## Panics
//! No panic unwinds into the caller; a panic is reported as a failure with
//! code [`CODE_INTERNAL`](crate::error::CODE_INTERNAL).
//!
//! ## Usage from Delphi
//! ```pascal
//! function GenerateInvoicePDFFromStream(XmlData: PByte; XmlDataLength: Integer;
//!   NrKSeF, QrCode: PAnsiChar; out OutputBuffer: PByte; out OutputLength: Integer;
//!   ErrorMessage: PAnsiChar; ErrorMessageSize: Integer): Integer; cdecl;
//!   external 'ksef_pdf_bridge.dll';
//! procedure FreeBuffer(Buffer: PByte); cdecl; external 'ksef_pdf_bridge.dll';
//! ```

use std::alloc::{self, Layout};
use std::any::Any;
use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use crate::bridge::{Artifact, Bridge, InvoiceParams, OperationOutcome};
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Bytes reserved in front of every returned buffer to remember its length.
const HEADER: usize = mem::size_of::<usize>();
const ALIGN: usize = mem::align_of::<usize>();

/// Buffers handed out and not yet released.
static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);

static LOGGER: Once = Once::new();

fn init_logging() {
    LOGGER.call_once(|| {
        // The host may already have installed a logger.
        let _ = env_logger::try_init();
    });
}

/// Number of buffers returned by the `*FromStream` functions that have not
/// been passed to [`free_buffer`] yet.
pub fn outstanding_buffers() -> usize {
    LIVE_BUFFERS.load(Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// File-path API
// ---------------------------------------------------------------------------

/// Render the invoice XML at `xml_file_path` to PDF.
///
/// # Parameters
/// - `xml_file_path`: null-terminated UTF-8 path of the source XML
/// - `nr_ksef`: KSeF number printed on the invoice
/// - `qr_code`: QR code URL template
/// - `output_file_path`: target PDF path; `NULL` or `""` writes next to the
///   XML with a `.pdf` extension
/// - `error_message`, `error_message_size`: caller-owned message buffer
///
/// # Returns
/// `0` when the PDF file exists on return, otherwise a result code.
///
/// # Safety
/// - Every non-null string argument must be a valid null-terminated string.
/// - `error_message`, if non-null, must be writable for `error_message_size` bytes.
#[export_name = "GenerateInvoicePDF"]
pub unsafe extern "C" fn generate_invoice_pdf(
    xml_file_path: *const c_char,
    nr_ksef: *const c_char,
    qr_code: *const c_char,
    output_file_path: *const c_char,
    error_message: *mut c_char,
    error_message_size: c_int,
) -> c_int {
    at_boundary(error_message, error_message_size, || {
        let xml = required_str(xml_file_path, "XML file path")?;
        let params = invoice_params(nr_ksef, qr_code)?;
        let output = optional_str(output_file_path)?;
        bridge()
            .generate_invoice(Path::new(xml), &params, output.map(Path::new))
            .map(Artifact::File)
    })
}

/// Render the UPO XML at `xml_file_path` to PDF.
///
/// # Safety
/// Same as [`generate_invoice_pdf`].
#[export_name = "GenerateUPOPDF"]
pub unsafe extern "C" fn generate_upo_pdf(
    xml_file_path: *const c_char,
    output_file_path: *const c_char,
    error_message: *mut c_char,
    error_message_size: c_int,
) -> c_int {
    at_boundary(error_message, error_message_size, || {
        let xml = required_str(xml_file_path, "XML file path")?;
        let output = optional_str(output_file_path)?;
        bridge()
            .generate_upo(Path::new(xml), output.map(Path::new))
            .map(Artifact::File)
    })
}

// ---------------------------------------------------------------------------
// Byte-stream API
// ---------------------------------------------------------------------------

/// Render an in-memory invoice XML document to PDF bytes.
///
/// # Parameters
/// - `xml_data`, `xml_data_length`: the XML document
/// - `nr_ksef`, `qr_code`: as for [`generate_invoice_pdf`]
/// - `output_buffer`, `output_length`: on success, receive the PDF bytes;
///   on failure, `NULL` and `0`
/// - `error_message`, `error_message_size`: caller-owned message buffer
///
/// # Safety
/// - `xml_data` must point to `xml_data_length` readable bytes.
/// - `output_buffer` and `output_length` must be valid writable pointers.
/// - The caller must release `*output_buffer` with `FreeBuffer`.
#[export_name = "GenerateInvoicePDFFromStream"]
pub unsafe extern "C" fn generate_invoice_pdf_from_stream(
    xml_data: *const u8,
    xml_data_length: c_int,
    nr_ksef: *const c_char,
    qr_code: *const c_char,
    output_buffer: *mut *mut u8,
    output_length: *mut c_int,
    error_message: *mut c_char,
    error_message_size: c_int,
) -> c_int {
    clear_output(output_buffer, output_length);
    at_boundary(error_message, error_message_size, || {
        let xml = xml_bytes(xml_data, xml_data_length)?;
        let params = invoice_params(nr_ksef, qr_code)?;
        check_output_pointers(output_buffer, output_length)?;
        let pdf = bridge().generate_invoice_from_bytes(xml, &params)?;
        hand_over(pdf, output_buffer, output_length)
    })
}

/// Render an in-memory UPO XML document to PDF bytes.
///
/// # Safety
/// Same as [`generate_invoice_pdf_from_stream`].
#[export_name = "GenerateUPOPDFFromStream"]
pub unsafe extern "C" fn generate_upo_pdf_from_stream(
    xml_data: *const u8,
    xml_data_length: c_int,
    output_buffer: *mut *mut u8,
    output_length: *mut c_int,
    error_message: *mut c_char,
    error_message_size: c_int,
) -> c_int {
    clear_output(output_buffer, output_length);
    at_boundary(error_message, error_message_size, || {
        let xml = xml_bytes(xml_data, xml_data_length)?;
        check_output_pointers(output_buffer, output_length)?;
        let pdf = bridge().generate_upo_from_bytes(xml)?;
        hand_over(pdf, output_buffer, output_length)
    })
}

// ---------------------------------------------------------------------------
// Memory management
// ---------------------------------------------------------------------------

/// Release a buffer returned by a `*FromStream` function.
///
/// # Safety
/// `buffer` must be null or a pointer returned by this library that has not
/// been released yet.
#[export_name = "FreeBuffer"]
pub unsafe extern "C" fn free_buffer(buffer: *mut u8) {
    if buffer.is_null() {
        return;
    }
    let base = buffer.sub(HEADER);
    let len = (base as *const usize).read();
    alloc::dealloc(base, Layout::from_size_align_unchecked(len + HEADER, ALIGN));
    LIVE_BUFFERS.fetch_sub(1, Ordering::SeqCst);
}

/// Return the library version as a null-terminated string.
/// The caller must **not** free this pointer.
#[no_mangle]
pub extern "C" fn ksef_bridge_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bridge() -> Bridge {
    Bridge::from_config(&BridgeConfig::from_env())
}

/// Run `op`, catching panics, and translate its outcome into a result code
/// plus the caller's error message.
unsafe fn at_boundary<F>(error_message: *mut c_char, error_message_size: c_int, op: F) -> c_int
where
    F: FnOnce() -> Result<Artifact, BridgeError>,
{
    init_logging();
    let outcome: OperationOutcome = match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result.into(),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            log::error!("Panic inside bridge call: {msg}");
            BridgeError::Internal(msg).into()
        }
    };

    match outcome {
        OperationOutcome::Success(_) => {
            write_message(error_message, error_message_size, "");
            0
        }
        OperationOutcome::Failure { code, message } => {
            write_message(error_message, error_message_size, &message);
            code
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Copy `message` into a C buffer of `capacity` bytes, NUL-terminated.
unsafe fn write_message(dst: *mut c_char, capacity: c_int, message: &str) {
    if dst.is_null() || capacity <= 0 {
        return;
    }
    let text = truncate_utf8(message, capacity as usize - 1);
    ptr::copy_nonoverlapping(text.as_ptr() as *const c_char, dst, text.len());
    *dst.add(text.len()) = 0;
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

unsafe fn required_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, BridgeError> {
    if ptr.is_null() {
        return Err(BridgeError::Validation(format!("{what} is required")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| BridgeError::Validation(format!("{what} is not valid UTF-8: {e}")))
}

/// `NULL` and `""` both mean "not given".
unsafe fn optional_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, BridgeError> {
    if ptr.is_null() {
        return Ok(None);
    }
    let s = required_str(ptr, "output file path")?;
    Ok(Some(s).filter(|s| !s.is_empty()))
}

unsafe fn invoice_params(
    nr_ksef: *const c_char,
    qr_code: *const c_char,
) -> Result<InvoiceParams, BridgeError> {
    Ok(InvoiceParams::new(
        required_str(nr_ksef, "KSeF number")?,
        required_str(qr_code, "QR code")?,
    ))
}

unsafe fn xml_bytes<'a>(data: *const u8, len: c_int) -> Result<&'a [u8], BridgeError> {
    if data.is_null() || len <= 0 {
        return Err(BridgeError::Validation("no XML data".into()));
    }
    Ok(slice::from_raw_parts(data, len as usize))
}

fn check_output_pointers(buf: *mut *mut u8, len: *mut c_int) -> Result<(), BridgeError> {
    if buf.is_null() || len.is_null() {
        return Err(BridgeError::Validation(
            "output buffer pointers are required".into(),
        ));
    }
    Ok(())
}

unsafe fn clear_output(buf: *mut *mut u8, len: *mut c_int) {
    if !buf.is_null() {
        *buf = ptr::null_mut();
    }
    if !len.is_null() {
        *len = 0;
    }
}

/// Move `pdf` into a library-owned buffer and publish it to the caller.
unsafe fn hand_over(
    pdf: Vec<u8>,
    out_buf: *mut *mut u8,
    out_len: *mut c_int,
) -> Result<Artifact, BridgeError> {
    let len = c_int::try_from(pdf.len()).map_err(|_| BridgeError::Allocation(pdf.len()))?;
    let data = allocate_buffer(&pdf)?;
    *out_buf = data;
    *out_len = len;
    Ok(Artifact::Bytes(pdf))
}

/// Allocate `HEADER + bytes.len()` bytes, store the length in the header and
/// return a pointer just past it.
fn allocate_buffer(bytes: &[u8]) -> Result<*mut u8, BridgeError> {
    let too_big = || BridgeError::Allocation(bytes.len());
    let total = bytes.len().checked_add(HEADER).ok_or_else(too_big)?;
    let layout = Layout::from_size_align(total, ALIGN).map_err(|_| too_big())?;

    // SAFETY: `layout` has a non-zero size because HEADER > 0.
    let base = unsafe { alloc::alloc(layout) };
    if base.is_null() {
        log::error!("Cannot allocate {} bytes for the output buffer", bytes.len());
        return Err(too_big());
    }

    // SAFETY: `base` is valid for `total` bytes and aligned for usize.
    unsafe {
        (base as *mut usize).write(bytes.len());
        let data = base.add(HEADER);
        ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        LIVE_BUFFERS.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
