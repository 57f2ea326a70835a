//!
//! Small text-stream helpers shared by the loaders and the FASTA writer.
//!

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

///
/// Open a text file, transparently decompressing if it starts with the gzip
/// magic bytes. Model, transition, and event files all go through this.
///
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let display = path.display().to_string();
    let mut file = File::open(path).map_err(|e| Error::io(&display, e))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| Error::io(&display, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::io(&display, e))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

///
/// Write one FASTA record, wrapping the sequence at `width` columns.
///
pub fn write_fasta(w: &mut impl Write, name: &str, seq: &str, width: usize) -> std::io::Result<()> {
    writeln!(w, ">{}", name)?;
    let bytes = seq.as_bytes();
    let width = width.max(1);
    let mut pos = 0;
    while pos < bytes.len() {
        let end = (pos + width).min(bytes.len());
        w.write_all(&bytes[pos..end])?;
        writeln!(w)?;
        pos = end;
    }
    Ok(())
}

//
// tests
//
