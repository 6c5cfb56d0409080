// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Minimal FITS binary-table support for the XY star lists exchanged with
//! the external solver tools: three `1E` columns named `X_IMAGE`,
//! `Y_IMAGE` and `MAG_AUTO`, one row per star, with the source image
//! dimensions carried as header keywords.

use std::fs;
use std::path::Path;

use crate::error::SolveError;
use crate::star::Star;

const BLOCK: usize = 2880;
const CARD: usize = 80;

fn pad_card(text: &str) -> [u8; CARD] {
    let mut card = [b' '; CARD];
    let bytes = text.as_bytes();
    card[..bytes.len().min(CARD)].copy_from_slice(&bytes[..bytes.len().min(CARD)]);
    card
}

fn card_int(key: &str, value: i64) -> [u8; CARD] {
    pad_card(&format!("{:<8}= {:>20}", key, value))
}

fn card_logical(key: &str, value: bool) -> [u8; CARD] {
    pad_card(&format!("{:<8}= {:>20}", key, if value { "T" } else { "F" }))
}

fn card_str(key: &str, value: &str) -> [u8; CARD] {
    pad_card(&format!("{:<8}= '{:<8}'", key, value))
}

fn pad_block(buf: &mut Vec<u8>, fill: u8) {
    while buf.len() % BLOCK != 0 {
        buf.push(fill);
    }
}

/// Writes the star list as a FITS file with an empty primary HDU followed
/// by the binary table.
pub fn write_xyls(
    path: &Path,
    stars: &[Star],
    image_width: usize,
    image_height: usize,
) -> Result<(), SolveError> {
    let mut buf: Vec<u8> = Vec::new();

    // Primary HDU: headers only.
    for card in [
        card_logical("SIMPLE", true),
        card_int("BITPIX", 8),
        card_int("NAXIS", 0),
        card_logical("EXTEND", true),
        pad_card("END"),
    ] {
        buf.extend_from_slice(&card);
    }
    pad_block(&mut buf, b' ');

    // Binary table HDU.
    let row_bytes = 3 * 4;
    for card in [
        card_str("XTENSION", "BINTABLE"),
        card_int("BITPIX", 8),
        card_int("NAXIS", 2),
        card_int("NAXIS1", row_bytes as i64),
        card_int("NAXIS2", stars.len() as i64),
        card_int("PCOUNT", 0),
        card_int("GCOUNT", 1),
        card_int("TFIELDS", 3),
        card_str("TTYPE1", "X_IMAGE"),
        card_str("TFORM1", "1E"),
        card_str("TUNIT1", "pixels"),
        card_str("TTYPE2", "Y_IMAGE"),
        card_str("TFORM2", "1E"),
        card_str("TUNIT2", "pixels"),
        card_str("TTYPE3", "MAG_AUTO"),
        card_str("TFORM3", "1E"),
        card_str("TUNIT3", "magnitude"),
        card_str("EXTNAME", "SOURCES"),
        card_int("IMAGEW", image_width as i64),
        card_int("IMAGEH", image_height as i64),
        pad_card("END"),
    ] {
        buf.extend_from_slice(&card);
    }
    pad_block(&mut buf, b' ');

    // FITS table data is big-endian.
    for star in stars {
        buf.extend_from_slice(&star.x.to_be_bytes());
        buf.extend_from_slice(&star.y.to_be_bytes());
        buf.extend_from_slice(&star.mag.to_be_bytes());
    }
    pad_block(&mut buf, 0);

    fs::write(path, &buf).map_err(|e| {
        SolveError::ExternalToolFailure(format!("could not write {}: {}", path.display(), e))
    })
}

struct HeaderInfo {
    cards: Vec<(String, String)>,
    data_start: usize,
    data_len: usize,
}

fn value_of(cards: &[(String, String)], key: &str) -> Option<String> {
    cards
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

fn int_of(cards: &[(String, String)], key: &str) -> Option<i64> {
    value_of(cards, key).and_then(|v| v.parse().ok())
}

fn str_of(cards: &[(String, String)], key: &str) -> Option<String> {
    value_of(cards, key).map(|v| v.trim_matches(|c| c == '\'' || c == ' ').to_string())
}

/// Parses one HDU header starting at `at`, returning its cards and the
/// data extent that follows it.
fn parse_header(bytes: &[u8], at: usize) -> Result<HeaderInfo, SolveError> {
    let mut cards = Vec::new();
    let mut pos = at;
    loop {
        if pos + CARD > bytes.len() {
            return Err(SolveError::ExternalToolFailure(
                "FITS header truncated before END".into(),
            ));
        }
        let card = String::from_utf8_lossy(&bytes[pos..pos + CARD]).to_string();
        pos += CARD;
        let keyword = card[..8.min(card.len())].trim().to_string();
        if keyword == "END" {
            break;
        }
        if card.len() > 10 && &card[8..10] == "= " {
            let raw = card[10..].trim();
            // Strip any inline comment outside of a quoted string.
            let value = if raw.starts_with('\'') {
                match raw[1..].find('\'') {
                    Some(end) => raw[1..1 + end].trim_end().to_string(),
                    None => raw.to_string(),
                }
            } else {
                raw.split('/').next().unwrap_or("").trim().to_string()
            };
            cards.push((keyword, value));
        }
    }
    // Headers occupy whole blocks.
    let data_start = at + ((pos - at).div_ceil(BLOCK)) * BLOCK;
    let naxis = int_of(&cards, "NAXIS").unwrap_or(0);
    let mut data_len = if naxis == 0 { 0 } else { 1 };
    for n in 1..=naxis {
        data_len *= int_of(&cards, &format!("NAXIS{}", n)).unwrap_or(0) as usize;
    }
    Ok(HeaderInfo {
        cards,
        data_start,
        data_len,
    })
}

/// Reads back a star table written by [`write_xyls`] or produced by an
/// external extractor configured with the same columns. Column positions
/// are located from the TTYPEn/TFORMn cards; only single-precision float
/// columns are understood.
pub fn read_xyls(path: &Path) -> Result<Vec<(f32, f32, f32)>, SolveError> {
    let bytes = fs::read(path).map_err(|e| {
        SolveError::ExternalToolFailure(format!("could not read {}: {}", path.display(), e))
    })?;

    let mut at = 0usize;
    while at + CARD <= bytes.len() {
        let header = parse_header(&bytes, at)?;
        let is_table = str_of(&header.cards, "XTENSION")
            .map(|x| x == "BINTABLE")
            .unwrap_or(false);
        if is_table {
            return read_table_rows(&bytes, &header);
        }
        at = header.data_start + header.data_len.div_ceil(BLOCK) * BLOCK;
    }
    Err(SolveError::ExternalToolFailure(format!(
        "{} holds no binary table",
        path.display()
    )))
}

fn tform_bytes(tform: &str) -> Option<usize> {
    let split = tform.find(|c: char| c.is_ascii_alphabetic())?;
    let repeat: usize = if split == 0 {
        1
    } else {
        tform[..split].parse().ok()?
    };
    let unit = match &tform[split..split + 1] {
        "L" | "B" | "A" | "X" => 1,
        "I" => 2,
        "J" | "E" => 4,
        "K" | "D" => 8,
        _ => return None,
    };
    Some(repeat * unit)
}

fn read_table_rows(
    bytes: &[u8],
    header: &HeaderInfo,
) -> Result<Vec<(f32, f32, f32)>, SolveError> {
    let cards = &header.cards;
    let row_bytes = int_of(cards, "NAXIS1").unwrap_or(0) as usize;
    let nrows = int_of(cards, "NAXIS2").unwrap_or(0) as usize;
    let tfields = int_of(cards, "TFIELDS").unwrap_or(0) as usize;

    let mut x_off = None;
    let mut y_off = None;
    let mut mag_off = None;
    let mut offset = 0usize;
    for field in 1..=tfields {
        let ttype = str_of(cards, &format!("TTYPE{}", field)).unwrap_or_default();
        let tform = str_of(cards, &format!("TFORM{}", field)).unwrap_or_default();
        let size = tform_bytes(&tform).ok_or_else(|| {
            SolveError::ExternalToolFailure(format!("unsupported column format {:?}", tform))
        })?;
        match ttype.as_str() {
            "X_IMAGE" => x_off = Some(offset),
            "Y_IMAGE" => y_off = Some(offset),
            "MAG_AUTO" => mag_off = Some(offset),
            _ => {}
        }
        offset += size;
    }
    let (x_off, y_off, mag_off) = match (x_off, y_off, mag_off) {
        (Some(x), Some(y), Some(m)) => (x, y, m),
        _ => {
            return Err(SolveError::ExternalToolFailure(
                "table lacks X_IMAGE/Y_IMAGE/MAG_AUTO columns".into(),
            ))
        }
    };

    let mut rows = Vec::with_capacity(nrows);
    for row in 0..nrows {
        let base = header.data_start + row * row_bytes;
        if base + row_bytes > bytes.len() {
            return Err(SolveError::ExternalToolFailure(
                "FITS table data truncated".into(),
            ));
        }
        let float_at = |off: usize| {
            f32::from_be_bytes([
                bytes[base + off],
                bytes[base + off + 1],
                bytes[base + off + 2],
                bytes[base + off + 3],
            ])
        };
        rows.push((float_at(x_off), float_at(y_off), float_at(mag_off)));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_table_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.xyls");
        let mut stars = Vec::new();
        for i in 0..7 {
            let mut s = Star::new(10.5 + i as f32, 20.25 * i as f32);
            s.mag = 12.0 - 0.5 * i as f32;
            stars.push(s);
        }
        write_xyls(&path, &stars, 1024, 768).unwrap();

        // Whole file is block-aligned.
        let len = fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len % BLOCK, 0);

        let rows = read_xyls(&path).unwrap();
        assert_eq!(rows.len(), 7);
        for (row, star) in rows.iter().zip(&stars) {
            assert_eq!(row.0, star.x);
            assert_eq!(row.1, star.y);
            assert_eq!(row.2, star.mag);
        }
    }

    #[test]
    fn test_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.xyls");
        write_xyls(&path, &[], 100, 100).unwrap();
        assert_eq!(read_xyls(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_tform_sizes() {
        assert_eq!(tform_bytes("1E"), Some(4));
        assert_eq!(tform_bytes("E"), Some(4));
        assert_eq!(tform_bytes("2D"), Some(16));
        assert_eq!(tform_bytes("10A"), Some(10));
        assert_eq!(tform_bytes("1Q"), None);
    }
}
