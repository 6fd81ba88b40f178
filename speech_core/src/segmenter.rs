//! Incremental sentence segmentation over streamed response text.
//!
//! Deltas arrive as arbitrary fragments. The segmenter buffers them and cuts
//! at sentence terminators so synthesis can start before the response ends.

/// Default minimum length of every unit after the first.
pub const DEFAULT_MIN_UNIT_CHARS: usize = 10;

/// Clause splitting only kicks in once this much unterminated text has built up.
const CLAUSE_SPLIT_BUFFER_CHARS: usize = 30;
/// A clause cut at a comma must be at least this long.
const CLAUSE_MIN_CHARS: usize = 15;

const TERMINATORS: [char; 3] = ['.', '!', '?'];
/// May follow a terminator and still belong to its sentence.
const CLOSERS: [char; 6] = ['"', '\'', '\u{201D}', '\u{2019}', ')', ']'];

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub min_unit_chars: usize,
    /// Cut long unterminated runs at their first comma.
    pub split_long_clauses: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_unit_chars: DEFAULT_MIN_UNIT_CHARS,
            split_long_clauses: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    config: SegmenterConfig,
    buffer: String,
    emitted: usize,
}

impl SentenceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            emitted: 0,
        }
    }

    /// Append a delta and return every unit that became ready, in order.
    ///
    /// The first unit of a session is released at the first terminator so
    /// audio starts early. Later candidates shorter than the configured
    /// minimum are held and merged with what follows.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut units = Vec::new();
        let mut consumed = 0;
        for end in self.boundaries() {
            let candidate = self.buffer[consumed..end].trim();
            if self.emitted == 0 || candidate.chars().count() >= self.config.min_unit_chars {
                units.push(candidate.to_string());
                self.emitted += 1;
                consumed = end;
            }
        }
        self.buffer.drain(..consumed);

        if units.is_empty() && self.config.split_long_clauses {
            if let Some(clause) = self.take_clause() {
                units.push(clause);
            }
        }
        units
    }

    /// End of stream: whatever is left becomes the final unit.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        self.emitted += 1;
        Some(rest.to_string())
    }

    /// Units handed out so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offsets just past each sentence end, ascending.
    ///
    /// A terminator ends a sentence when whitespace or the end of the buffer
    /// follows it, possibly after closing quotes, brackets and `[n]` citation
    /// markers, which stay with the sentence. A trailing `.` right after a
    /// digit is not a boundary yet since the next delta may continue a decimal.
    fn boundaries(&self) -> Vec<usize> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut ends = Vec::new();
        for (k, &(_, c)) in chars.iter().enumerate() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            // Still inside a citation marker; wait for more text.
            let Some(run_end) = closing_run(&chars, k + 1) else {
                continue;
            };
            match chars.get(run_end) {
                Some(&(at, next)) => {
                    if next.is_whitespace() {
                        ends.push(at);
                    }
                }
                None => {
                    let decimal_hold = run_end == k + 1
                        && c == '.'
                        && k > 0
                        && chars[k - 1].1.is_ascii_digit();
                    if !decimal_hold {
                        ends.push(self.buffer.len());
                    }
                }
            }
        }
        ends
    }

    fn take_clause(&mut self) -> Option<String> {
        if self.buffer.chars().count() <= CLAUSE_SPLIT_BUFFER_CHARS {
            return None;
        }
        let comma = self.buffer.find(',')?;
        let end = comma + 1;
        let clause = self.buffer[..end].trim();
        if clause.chars().count() <= CLAUSE_MIN_CHARS {
            return None;
        }
        let clause = clause.to_string();
        self.buffer.drain(..end);
        self.emitted += 1;
        Some(clause)
    }
}

/// Index just past the closing characters and citation markers starting at
/// `start`. `None` when the buffer ends part way through a marker.
fn closing_run(chars: &[(usize, char)], start: usize) -> Option<usize> {
    let mut pos = start;
    loop {
        match chars.get(pos) {
            Some(&(_, c)) if CLOSERS.contains(&c) => pos += 1,
            Some(&(_, '[')) => {
                let mut end = pos + 1;
                while chars.get(end).is_some_and(|&(_, c)| c.is_ascii_digit()) {
                    end += 1;
                }
                match chars.get(end) {
                    Some(&(_, ']')) if end > pos + 1 => pos = end + 1,
                    None => return None,
                    _ => return Some(pos),
                }
            }
            _ => return Some(pos),
        }
    }
}
