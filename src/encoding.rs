//! Packs variable-length documents into the square plaintext matrix served
//! by the articles endpoint. Row `i` is `[len_i, deflated bytes.., 0..]`;
//! rows past the corpus decode to the empty string. Cell values stay below
//! 256, so any plaintext modulus above one byte can carry them.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{Error, Result};

fn deflate(s: &str) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(s.as_bytes())
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Protocol(format!("compression failed: {e}")))
}

fn inflate(bytes: &[u8]) -> Result<String> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut s = String::new();
    decoder
        .read_to_string(&mut s)
        .map_err(|e| Error::Protocol(format!("corrupt document payload: {e}")))?;
    Ok(s)
}

/// Encodes documents into the smallest square matrix where every row fits
/// its length header plus payload.
pub fn strings_to_matrix(strings: &[String]) -> Result<Array2<u64>> {
    let encoded: Vec<Vec<u8>> = strings.iter().map(|s| deflate(s)).collect::<Result<_>>()?;
    let width = encoded.iter().map(Vec::len).max().unwrap_or(0) + 1;
    let side = ((strings.len() * width) as f64).sqrt().ceil() as usize;
    let side = side.max(width);

    let mut matrix = Array2::zeros((side, side));
    for (i, bytes) in encoded.iter().enumerate() {
        matrix[[i, 0]] = bytes.len() as u64;
        for (j, &b) in bytes.iter().enumerate() {
            matrix[[i, j + 1]] = u64::from(b);
        }
    }
    Ok(matrix)
}

/// Decodes one matrix row back into its document.
pub fn row_to_string(row: ArrayView1<u64>) -> Result<String> {
    let len = row[0] as usize;
    if len == 0 {
        return Ok(String::new());
    }
    if len + 1 > row.len() {
        return Err(Error::Protocol(format!(
            "length header {len} exceeds row width {}",
            row.len()
        )));
    }
    let bytes: Vec<u8> = row.iter().skip(1).take(len).map(|&v| v as u8).collect();
    inflate(&bytes)
}

pub fn matrix_to_strings(matrix: ArrayView2<u64>, count: usize) -> Result<Vec<String>> {
    if count > matrix.nrows() {
        return Err(Error::Protocol(format!(
            "{count} documents requested from a {}-row matrix",
            matrix.nrows()
        )));
    }
    (0..count).map(|i| row_to_string(matrix.row(i))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn documents_round_trip() {
        let original = strings(&[
            "Hello, World!",
            "This is a test",
            "private retrieval keeps the index to itself",
            "",
            "short",
        ]);
        let matrix = strings_to_matrix(&original).unwrap();
        assert_eq!(matrix.nrows(), matrix.ncols());
        let decoded = matrix_to_strings(matrix.view(), original.len()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn padding_rows_decode_to_empty() {
        let original = strings(&["abc", "de", "fghij"]);
        let matrix = strings_to_matrix(&original).unwrap();
        for i in original.len()..matrix.nrows() {
            assert_eq!(row_to_string(matrix.row(i)).unwrap(), "");
        }
    }

    #[test]
    fn every_row_fits_its_payload() {
        let original = strings(&["abc", "de", "fghij"]);
        let matrix = strings_to_matrix(&original).unwrap();
        for i in 0..original.len() {
            let len = matrix[[i, 0]] as usize;
            assert!(len + 1 <= matrix.ncols());
        }
    }

    #[test]
    fn single_document_gets_minimal_side() {
        let original = strings(&["Hello"]);
        let matrix = strings_to_matrix(&original).unwrap();
        let payload = matrix[[0, 0]] as usize;
        // With one document the side collapses to the row width itself.
        assert_eq!(matrix.nrows(), payload + 1);
        assert_eq!(
            matrix_to_strings(matrix.view(), 1).unwrap(),
            strings(&["Hello"])
        );
    }

    #[test]
    fn unicode_survives_compression() {
        let original = strings(&["sémaphore – 私的検索 — ёжик"]);
        let matrix = strings_to_matrix(&original).unwrap();
        assert_eq!(matrix_to_strings(matrix.view(), 1).unwrap(), original);
    }

    #[test]
    fn corrupt_payload_is_a_protocol_error() {
        let mut matrix = strings_to_matrix(&strings(&["hello there"])).unwrap();
        matrix[[0, 1]] ^= 0xff;
        assert!(matches!(
            row_to_string(matrix.row(0)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oversized_length_header_is_rejected() {
        let mut matrix = Array2::zeros((4, 4));
        matrix[[0, 0]] = 99;
        assert!(matches!(
            row_to_string(matrix.row(0)),
            Err(Error::Protocol(_))
        ));
    }
}
