//! Chat text hygiene: markup stripping and the denylist word filter.

/// Maximum chat message length, counted after trimming.
pub const MAX_MESSAGE_LENGTH: usize = 500;

/// Words masked out of chat messages before broadcast.
const DENYLIST: &[&str] = &["fuck", "shit", "bitch", "asshole", "cunt"];

/// Strip all markup: anything between `<` and `>` is dropped, including the
/// brackets. A trailing unterminated tag is dropped too.
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Replace every denylisted word with `***`, case-insensitively.
pub fn filter_denylist(input: &str) -> String {
    let mut filtered = input.to_string();
    for word in DENYLIST {
        filtered = mask_word(&filtered, word);
    }
    filtered
}

fn mask_word(text: &str, word: &str) -> String {
    // ASCII-lowercase keeps byte offsets aligned with the original text.
    let lower_text: String = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    let mut search = 0;
    while let Some(pos) = lower_text[search..].find(word) {
        let start = search + pos;
        result.push_str(&text[last..start]);
        result.push_str("***");
        last = start + word.len();
        search = last;
    }
    result.push_str(&text[last..]);
    result
}
