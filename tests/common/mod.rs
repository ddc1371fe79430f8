//! Fake generator executables for integration tests.
//!
//! Each fake is a `/bin/sh` script that speaks the generator's command line
//! (`-i`, `-o`, `-t`, `--nrKSeF`, `--qrCode`, `--stream`) and records the
//! arguments it received in `args.txt` next to itself.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Parses the generator arguments, then runs `$BEHAVIOUR`.
const PRELUDE: &str = r#"#!/bin/sh
printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
input=""; output=""; type=""; stream=0
while [ $# -gt 0 ]; do
  case "$1" in
    -i) input="$2"; shift 2 ;;
    -o) output="$2"; shift 2 ;;
    -t) type="$2"; shift 2 ;;
    --nrKSeF|--qrCode) shift 2 ;;
    --stream) stream=1; shift ;;
    *) echo "unknown argument: $1" >&2; exit 2 ;;
  esac
done
"#;

/// Writes `%PDF-1.7 <type>` followed by the XML, to stdout or to the file.
pub const WELL_BEHAVED: &str = r#"
if [ "$stream" = 1 ]; then
  printf '%%PDF-1.7 %s\n' "$type"
  cat
  exit 0
fi
[ -f "$input" ] || { echo "cannot read $input" >&2; exit 1; }
[ -n "$output" ] || output="${input%.xml}.pdf"
{ printf '%%PDF-1.7 %s\n' "$type"; cat "$input"; } > "$output"
"#;

/// Rejects every document with exit code 3.
pub const REJECTING: &str = r#"
cat > /dev/null
echo "Błąd podczas parsowania XML: unexpected end of input" >&2
exit 3
"#;

/// Claims success without producing anything.
pub const SILENT: &str = r#"
cat > /dev/null
exit 0
"#;

/// Closes stdin unread and claims success.
pub const CLOSES_INPUT: &str = r#"
exec 0<&-
exit 0
"#;

/// Never finishes.
pub const HANGING: &str = r#"
exec sleep 30
"#;

pub struct FakeGenerator {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FakeGenerator {
    pub fn new(behaviour: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ksef-pdf-generator");
        fs::write(&path, format!("{PRELUDE}{behaviour}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, path }
    }

    /// Arguments of the most recent run, one per element.
    pub fn recorded_args(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("args.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Write `contents` to `name` inside the generator's directory.
    pub fn write_doc(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

pub const INVOICE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Faktura><Podmiot1><DaneIdentyfikacyjne><NIP>1234567890</NIP></DaneIdentyfikacyjne></Podmiot1><Fa><P_1>2025-03-14</P_1></Fa></Faktura>
"#;

pub const UPO_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Potwierdzenie><NumerReferencyjnySesji>20250314-SE-1</NumerReferencyjnySesji></Potwierdzenie>
"#;
