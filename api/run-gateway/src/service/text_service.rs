const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "of", "to", "in", "on", "at", "by", "for", "with",
    "from", "as", "is", "are", "was", "were", "be", "been", "it", "its", "this", "that", "these",
    "those", "there", "their", "they", "we", "you", "he", "she", "i", "me", "my", "our", "your",
    "has", "have", "had", "do", "does", "did", "so", "than",
];

/// Lowercases and replaces every non-alphanumeric char with a single space.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

pub fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let padded = format!(" {normalized} ");
    padded.contains(&format!(" {phrase} "))
}

/// Lowercase words that carry meaning: no stopwords, no leading digit.
pub fn content_terms(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|w| !w.is_empty())
        .filter(|w| !w.starts_with(|c: char| c.is_ascii_digit()))
        .filter(|w| !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Numbers written at the start of a token: "20ms" -> 20, "9.8" -> 9.8.
/// Tokens such as "p95" are words, not numbers.
pub fn numeric_tokens(text: &str) -> Vec<f64> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '"' | '\''))
        .filter_map(|token| {
            let token = token.trim_start_matches(['$', '~', '+']);
            if !token.starts_with(|c: char| c.is_ascii_digit()) {
                return None;
            }
            let mut end = 0;
            let mut seen_dot = false;
            let bytes = token.as_bytes();
            while end < bytes.len() {
                let b = bytes[end];
                if b.is_ascii_digit() {
                    end += 1;
                } else if b == b'.'
                    && !seen_dot
                    && bytes.get(end + 1).is_some_and(|n| n.is_ascii_digit())
                {
                    seen_dot = true;
                    end += 1;
                } else {
                    break;
                }
            }
            token[..end].parse::<f64>().ok()
        })
        .collect()
}

/// Splits on `.`, `!` or `?` followed by whitespace or end of text, so
/// decimals such as "9.8" stay inside their sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    let mut sentences = Vec::new();
    let mut current = String::new();
    for (i, ch) in chars.iter().enumerate() {
        current.push(*ch);
        let terminal = matches!(ch, '.' | '!' | '?');
        let boundary = chars.get(i + 1).map_or(true, |next| next.is_whitespace());
        if terminal && boundary {
            push_sentence(&mut sentences, &current);
            current.clear();
        }
    }
    push_sentence(&mut sentences, &current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.chars().any(char::is_alphanumeric) {
        sentences.push(trimmed.to_string());
    }
}
