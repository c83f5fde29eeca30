//! Encoding detection, decoding, and CSV reader construction.
//!
//! All byte-to-text conversion in tabload flows through this module:
//!
//! - **Detection**: a statistical guess from `chardetng` scored by how
//!   plausible the decoded non-ASCII characters are. Guesses below the
//!   confidence threshold fall back to a deterministic probe list.
//! - **Decoding**: `encoding_rs` with BOM handling; `latin-1` (WHATWG
//!   windows-1252) decodes any byte sequence, so the probe never fails.
//! - **Reader construction**: flexible in-memory CSV readers so malformed
//!   rows can be skipped and counted instead of aborting the file.

use std::borrow::Cow;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

/// Ordered probe list used when the statistical guess is not confident.
pub const FALLBACK_ENCODINGS: &[(&str, &Encoding)] = &[
    ("utf-8", UTF_8),
    ("latin-1", WINDOWS_1252),
    ("iso-8859-1", WINDOWS_1252),
    ("cp1252", WINDOWS_1252),
];

const LAST_RESORT_LABEL: &str = "latin-1";

/// Non-ASCII characters that commonly appear in legitimate legacy-encoded text.
const PLAUSIBLE_SYMBOLS: &[char] = &[
    '€', '£', '¥', '°', 'º', 'ª', '¿', '¡', '«', '»', '–', '—', '‘', '’', '“', '”', '·', '©',
    '®', '§', '±', '\u{a0}',
];

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedEncoding {
    pub label: String,
    pub encoding: &'static Encoding,
    pub confidence: f64,
    /// Whether the label came from the fallback probe rather than the guess.
    pub probed: bool,
}

pub fn canonical_label(encoding: &'static Encoding) -> String {
    if encoding == UTF_8 {
        "utf-8".to_string()
    } else if encoding == WINDOWS_1252 {
        LAST_RESORT_LABEL.to_string()
    } else {
        encoding.name().to_ascii_lowercase()
    }
}

/// Detect the encoding of `sample`, which may be a truncated prefix of the file.
pub fn detect_encoding(sample: &[u8], threshold: f64, truncated: bool) -> DetectedEncoding {
    if let Some((encoding, _)) = Encoding::for_bom(sample) {
        return DetectedEncoding {
            label: canonical_label(encoding),
            encoding,
            confidence: 1.0,
            probed: false,
        };
    }
    if is_utf8_prefix(sample, truncated) {
        return DetectedEncoding {
            label: "utf-8".to_string(),
            encoding: UTF_8,
            confidence: 1.0,
            probed: false,
        };
    }

    let mut detector = EncodingDetector::new();
    detector.feed(sample, !truncated);
    let guess = detector.guess(None, false);
    let confidence = plausibility(guess, sample);
    if confidence >= threshold {
        return DetectedEncoding {
            label: canonical_label(guess),
            encoding: guess,
            confidence,
            probed: false,
        };
    }

    let (label, encoding) = FALLBACK_ENCODINGS
        .iter()
        .find(|(_, encoding)| decodes_cleanly(*encoding, sample, truncated))
        .map(|(label, encoding)| (*label, *encoding))
        .unwrap_or((LAST_RESORT_LABEL, WINDOWS_1252));
    DetectedEncoding {
        label: label.to_string(),
        encoding,
        confidence,
        probed: true,
    }
}

fn is_utf8_prefix(sample: &[u8], truncated: bool) -> bool {
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        // A multi-byte sequence cut off by the sample boundary is not an error.
        Err(err) => truncated && err.error_len().is_none(),
    }
}

fn decodes_cleanly(encoding: &'static Encoding, sample: &[u8], truncated: bool) -> bool {
    if encoding == UTF_8 {
        return is_utf8_prefix(sample, truncated);
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(sample)
        .is_some()
}

/// Share of decoded non-ASCII characters that look like real text.
fn plausibility(encoding: &'static Encoding, sample: &[u8]) -> f64 {
    let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(sample) else {
        return 0.0;
    };
    let mut non_ascii = 0usize;
    let mut plausible = 0usize;
    for ch in text.chars().filter(|c| !c.is_ascii()) {
        non_ascii += 1;
        if ch.is_alphabetic() || PLAUSIBLE_SYMBOLS.contains(&ch) {
            plausible += 1;
        }
    }
    if non_ascii == 0 {
        return 1.0;
    }
    plausible as f64 / non_ascii as f64
}

/// Decode the whole buffer, returning the text and whether any bytes had to
/// be replaced.
pub fn decode_bytes<'a>(bytes: &'a [u8], encoding: &'static Encoding) -> (Cow<'a, str>, bool) {
    let (text, _, had_errors) = encoding.decode(bytes);
    (text, had_errors)
}

/// Result of decoding the full buffer with a sample-based guess.
#[derive(Debug)]
pub struct Decoded<'a> {
    pub text: Cow<'a, str>,
    pub encoding: DetectedEncoding,
    /// Set when the guess failed past the sample and the probe list took over.
    pub redetected_from: Option<String>,
    pub had_errors: bool,
}

/// Decode `bytes` with `detected`. If bytes beyond the detection sample do
/// not fit, the probe list is rerun against the whole buffer and the first
/// clean candidate wins.
pub fn decode_full(bytes: &[u8], detected: DetectedEncoding) -> Decoded<'_> {
    let (text, had_errors) = decode_bytes(bytes, detected.encoding);
    if !had_errors {
        return Decoded {
            text,
            encoding: detected,
            redetected_from: None,
            had_errors,
        };
    }
    let body = Encoding::for_bom(bytes).map_or(bytes, |(_, bom_len)| &bytes[bom_len..]);
    let clean = FALLBACK_ENCODINGS
        .iter()
        .find(|(_, encoding)| *encoding != detected.encoding && decodes_cleanly(*encoding, body, false));
    match clean {
        Some((label, encoding)) => {
            let (text, _) = encoding.decode_without_bom_handling(body);
            Decoded {
                text,
                encoding: DetectedEncoding {
                    label: label.to_string(),
                    encoding: *encoding,
                    confidence: detected.confidence,
                    probed: true,
                },
                redetected_from: Some(detected.label),
                had_errors: false,
            }
        }
        None => Decoded {
            text,
            encoding: detected,
            redetected_from: None,
            had_errors,
        },
    }
}

pub fn open_csv_reader(text: &str, delimiter: u8) -> csv::Reader<&[u8]> {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(text.as_bytes())
}

pub fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_is_detected_as_utf8_with_full_confidence() {
        let detected = detect_encoding(b"id,name\n1,alice\n", 0.7, false);
        assert_eq!(detected.label, "utf-8");
        assert_eq!(detected.confidence, 1.0);
        assert!(!detected.probed);
    }

    #[test]
    fn truncated_multibyte_sequence_still_counts_as_utf8() {
        let bytes = "name\ncafé".as_bytes();
        let cut = &bytes[..bytes.len() - 1];
        assert_eq!(detect_encoding(cut, 0.7, true).label, "utf-8");
        assert_ne!(detect_encoding(cut, 0.7, false).label, "utf-8");
    }

    #[test]
    fn latin1_text_is_labelled_latin1() {
        let (encoded, _, _) = WINDOWS_1252.encode("nombre;ciudad\nJosé Muñoz;España\nMaría Núñez;Cúcuta\n");
        let detected = detect_encoding(&encoded, 0.7, false);
        assert_eq!(detected.label, "latin-1");
        assert_eq!(detected.encoding, WINDOWS_1252);
    }

    #[test]
    fn unconfident_guess_falls_back_to_probe_list() {
        // Control-range bytes decode without error but are not plausible text.
        let bytes = [b'a', 0x81, 0x8d, 0x8f, 0x90, b'\n'];
        let detected = detect_encoding(&bytes, 0.7, false);
        assert!(detected.probed);
        assert_eq!(detected.label, "latin-1");
    }

    #[test]
    fn bom_selects_encoding() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"a,b\n");
        let detected = detect_encoding(&bytes, 0.7, false);
        assert_eq!(detected.label, "utf-8");
        let (text, had_errors) = decode_bytes(&bytes, detected.encoding);
        assert_eq!(text, "a,b\n");
        assert!(!had_errors);
    }

    #[test]
    fn invalid_bytes_past_the_sample_switch_to_a_clean_candidate() {
        let mut bytes = b"name\nplain\n".to_vec();
        let (tail, _, _) = WINDOWS_1252.encode("Muñoz\n");
        bytes.extend_from_slice(&tail);
        let guess = detect_encoding(&bytes[..11], 0.7, true);
        assert_eq!(guess.label, "utf-8");

        let decoded = decode_full(&bytes, guess);
        assert_eq!(decoded.encoding.label, "latin-1");
        assert_eq!(decoded.redetected_from.as_deref(), Some("utf-8"));
        assert!(!decoded.had_errors);
        assert!(decoded.text.ends_with("Muñoz\n"));
    }
}
