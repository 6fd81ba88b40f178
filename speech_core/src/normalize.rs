//! Rewrites display text into text that reads well aloud.
//!
//! Steps run in a fixed order: citation markers are dropped, numbers become
//! words, symbols become words, brackets are stripped, whitespace collapses,
//! and the result is truncated. The steps repeat until the text settles, so
//! running the output through again changes nothing.
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Synthesis refuses overly long inputs; units are cut to this by default.
pub const DEFAULT_MAX_UNIT_CHARS: usize = 500;

const MAX_PASSES: usize = 4;

static CITATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d+\]").expect("citation pattern"));

static NUMBER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\$\s?)?\b(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d+))?\b").expect("number pattern")
});

const SYMBOL_WORDS: [(char, &str); 6] = [
    ('%', "percent"),
    ('$', "dollars"),
    ('&', "and"),
    ('@', "at"),
    ('#', "number"),
    ('°', "degree"),
];

const STRIPPED: [char; 4] = ['(', ')', '[', ']'];

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

const SCALES: [&str; 7] = [
    "",
    "thousand",
    "million",
    "billion",
    "trillion",
    "quadrillion",
    "quintillion",
];

#[derive(Debug, Clone)]
pub struct Normalizer {
    max_chars: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNIT_CHARS)
    }
}

impl Normalizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut text = self.pass(text);
        // A cut can leave a bare digit behind, e.g. "3rd" cut to "3".
        for _ in 1..MAX_PASSES {
            let again = self.pass(&text);
            if again == text {
                break;
            }
            text = again;
        }
        text
    }

    fn pass(&self, text: &str) -> String {
        let text = remove_citations(text);
        let text = expand_numbers(&text);
        let text = replace_symbols(&text);
        let text: String = text.chars().filter(|c| !STRIPPED.contains(c)).collect();
        let text = collapse_whitespace(&text);
        truncate(&text, self.max_chars)
    }
}

/// Drop bracketed numeric citation markers such as `[1]`.
pub fn remove_citations(text: &str) -> String {
    CITATION_PATTERN.replace_all(text, "").into_owned()
}

fn expand_numbers(text: &str) -> String {
    NUMBER_PATTERN
        .replace_all(text, |caps: &Captures| {
            let digits = caps[2].replace(',', "");
            let Ok(value) = digits.parse::<u64>() else {
                return caps[0].to_string();
            };
            let mut spoken = number_to_words(value);
            if let Some(fraction) = caps.get(3) {
                spoken.push_str(" point");
                for d in fraction.as_str().chars().filter_map(|c| c.to_digit(10)) {
                    spoken.push(' ');
                    spoken.push_str(ONES[d as usize]);
                }
            }
            if caps.get(1).is_some() {
                spoken.push_str(if value == 1 && caps.get(3).is_none() {
                    " dollar"
                } else {
                    " dollars"
                });
            }
            spoken
        })
        .into_owned()
}

fn replace_symbols(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match SYMBOL_WORDS.iter().find(|(symbol, _)| *symbol == c) {
            Some((_, word)) => {
                out.push(' ');
                out.push_str(word);
                out.push(' ');
            }
            None => out.push(c),
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Spell out an integer in English words.
pub fn number_to_words(n: u64) -> String {
    if n == 0 {
        return ONES[0].to_string();
    }

    let mut groups = Vec::new();
    let mut rest = n;
    let mut scale = 0;
    while rest > 0 {
        let group = rest % 1000;
        if group > 0 {
            let mut words = below_thousand(group);
            if !SCALES[scale].is_empty() {
                words.push(' ');
                words.push_str(SCALES[scale]);
            }
            groups.push(words);
        }
        rest /= 1000;
        scale += 1;
    }
    groups.reverse();
    groups.join(" ")
}

fn below_thousand(n: u64) -> String {
    let hundreds = n / 100;
    let rest = n % 100;
    let mut parts = Vec::new();
    if hundreds > 0 {
        parts.push(format!("{} hundred", ONES[hundreds as usize]));
    }
    if rest >= 20 {
        let tens = TENS[(rest / 10) as usize];
        match rest % 10 {
            0 => parts.push(tens.to_string()),
            ones => parts.push(format!("{tens} {}", ONES[ones as usize])),
        }
    } else if rest > 0 {
        parts.push(ONES[rest as usize].to_string());
    }
    parts.join(" ")
}
