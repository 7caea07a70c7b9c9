use unicode_segmentation::UnicodeSegmentation;

const SPEAKER_MARKERS: [&str; 3] = ["Speaker", "Advisor", "Client"];

pub fn segment_sentences(text: &str) -> Vec<String> {
    text.unicode_sentences()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Drops a leading `DISCLAIMER:` preamble, keeping everything from the first
/// line that names a speaker.
pub fn strip_disclaimer(text: &str) -> String {
    if !text.contains("DISCLAIMER:") {
        return text.trim().to_string();
    }
    text.lines()
        .skip_while(|line| !SPEAKER_MARKERS.iter().any(|m| line.contains(m)))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Cuts `text` to at most `max_chars` grapheme clusters, appending `...` when
/// anything was dropped.
pub fn truncate_graphemes(text: &str, max_chars: usize) -> String {
    let mut graphemes = text.grapheme_indices(true);
    match graphemes.nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// The sentence with the most case-insensitive keyword hits. Ties go to the
/// earliest sentence; no hits at all yields `None`.
pub fn best_matching_sentence(text: &str, keywords: &[String]) -> Option<String> {
    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| k.to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    let mut best: Option<(usize, String)> = None;
    for sentence in segment_sentences(text) {
        let lower = sentence.to_lowercase();
        let hits = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
        if hits > 0 && best.as_ref().map_or(true, |(h, _)| hits > *h) {
            best = Some((hits, sentence));
        }
    }
    best.map(|(_, s)| s)
}
