//! Word tokenization for the full-text index
//!
//! Values are lower-cased and split on runs of non-alphanumeric
//! characters. Every retained word carries its 1-based ordinal
//! position. The same rules apply to indexed values and to lookup
//! phrases so position arithmetic lines up.

/// Split `text` into `(word, position)` pairs.
pub fn tokenize(text: &str) -> Vec<(String, u32)> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut pos = 0u32;

    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            pos += 1;
            words.push((std::mem::take(&mut current), pos));
        }
    }
    if !current.is_empty() {
        pos += 1;
        words.push((current, pos));
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let words = tokenize("Hello graph world");
        assert_eq!(
            words,
            vec![
                ("hello".to_string(), 1),
                ("graph".to_string(), 2),
                ("world".to_string(), 3)
            ]
        );
    }

    #[test]
    fn punctuation_runs_separate_words() {
        let words = tokenize("best-selling, ARTISTS!");
        assert_eq!(
            words,
            vec![
                ("best".to_string(), 1),
                ("selling".to_string(), 2),
                ("artists".to_string(), 3)
            ]
        );
    }

    #[test]
    fn empty_and_symbol_only_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("--- !!! ---").is_empty());
    }
}
