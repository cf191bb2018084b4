//! Best-effort profanity gate for chat input.
//!
//! Matching is case-insensitive and char-wise. Masking keeps consonants and
//! length and replaces every vowel inside a matched span, so the word stays
//! partially readable.

use std::sync::LazyLock;

pub const MASK_CHAR: char = '*';

/// Every entry must contain at least one vowel, otherwise masking could not
/// neutralize it and `mask` would stop being idempotent.
const DENYLIST: &[&str] = &[
    "lồn",
    "buồi",
    "cặc",
    "con cặc",
    "địt",
    "đụ",
    "đụ má",
    "đéo",
    "đĩ",
    "óc chó",
    "mẹ mày",
    "fuck",
    "shit",
    "bitch",
];

const VOWELS: &str = "aàáảãạăằắẳẵặâầấẩẫậ\
                      eèéẻẽẹêềếểễệ\
                      iìíỉĩị\
                      oòóỏõọôồốổỗộơờớởỡợ\
                      uùúủũụưừứửữự\
                      yỳýỷỹỵ";

static TERMS: LazyLock<Vec<Vec<char>>> =
    LazyLock::new(|| DENYLIST.iter().map(|t| t.chars().map(fold).collect()).collect());

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn is_vowel(c: char) -> bool {
    VOWELS.contains(fold(c))
}

/// Marks every position covered by any (possibly overlapping) match.
fn matched_positions(folded: &[char]) -> Vec<bool> {
    let mut hit = vec![false; folded.len()];
    for term in TERMS.iter() {
        if term.is_empty() || term.len() > folded.len() {
            continue;
        }
        for start in 0..=folded.len() - term.len() {
            if folded[start..start + term.len()] == term[..] {
                hit[start..start + term.len()].fill(true);
            }
        }
    }
    hit
}

/// True if any denylisted term occurs in `text`.
pub fn is_flagged(text: &str) -> bool {
    let folded: Vec<char> = text.chars().map(fold).collect();
    TERMS.iter().any(|term| {
        !term.is_empty() && folded.windows(term.len()).any(|w| w == &term[..])
    })
}

/// Replace the vowels of every denylisted span with [`MASK_CHAR`].
pub fn mask(text: &str) -> String {
    let folded: Vec<char> = text.chars().map(fold).collect();
    let hit = matched_positions(&folded);
    if !hit.contains(&true) {
        return text.to_string();
    }

    text.chars()
        .zip(hit)
        .map(|(c, masked)| if masked && is_vowel(c) { MASK_CHAR } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "",
        "chào buổi sáng",
        "lồn ơi",
        "LỒN",
        "đụ má mày",
        "con cặc con cặc",
        "óc chó thật sự",
        "what the FUCK is this shit",
        "đĩđĩđĩ",
        "mẹ màyđéo",
        "l*n",
        "kết quả xổ số miền Bắc 18h15",
    ];

    #[test]
    fn example_from_chat() {
        assert!(is_flagged("lồn ơi"));
        assert_eq!(mask("lồn ơi"), "l*n ơi");
    }

    #[test]
    fn case_insensitive_and_preserves_original_case() {
        assert!(is_flagged("LỒN"));
        assert_eq!(mask("LỒN"), "L*N");
        assert_eq!(mask("Shit happens"), "Sh*t happens");
    }

    #[test]
    fn clean_text_is_untouched() {
        let text = "kết quả xổ số miền Bắc 18h15";
        assert!(!is_flagged(text));
        assert_eq!(mask(text), text);
    }

    #[test]
    fn mask_is_idempotent() {
        for s in SAMPLES {
            let once = mask(s);
            assert_eq!(mask(&once), once, "input {:?}", s);
        }
    }

    #[test]
    fn mask_preserves_length_and_consonants() {
        for s in SAMPLES {
            let masked = mask(s);
            assert_eq!(masked.chars().count(), s.chars().count());
            for (a, b) in s.chars().zip(masked.chars()) {
                if a != b {
                    assert!(is_vowel(a));
                    assert_eq!(b, MASK_CHAR);
                }
            }
        }
    }

    #[test]
    fn masked_output_is_no_longer_flagged() {
        for s in SAMPLES {
            assert!(!is_flagged(&mask(s)), "input {:?}", s);
        }
    }

    #[test]
    fn overlapping_terms_are_all_masked() {
        // "đụ" and "đụ má" overlap
        assert_eq!(mask("đụ má"), "đ* m*");
    }

    #[test]
    fn every_term_has_a_vowel() {
        for term in DENYLIST {
            assert!(term.chars().any(is_vowel), "{:?}", term);
        }
    }
}
