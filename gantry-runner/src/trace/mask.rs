//! Streaming phrase masking
//!
//! Each registered secret gets its own [`PhraseFilter`] in the buffer's
//! transformer chain. Filters are push-based: input may split a secret at any
//! byte boundary, so a filter holds back a trailing partial match until it
//! either completes (emit `[MASKED]`) or is disambiguated (emit the held
//! prefix). The carry is bounded by [`MAX_PHRASE_SIZE`]; longer secrets are
//! matched per cap window and their tail beyond the final window may be
//! revealed.

use memchr::memmem;

/// Replacement emitted for every masked value.
pub const MASKED: &[u8] = b"[MASKED]";

/// Upper bound on the match window and therefore on a filter's carry.
pub const MAX_PHRASE_SIZE: usize = 4096;

/// A push-based byte stream transformer with bounded carry
pub trait StreamFilter: Send + Sync {
    /// Process `input`, appending output to `out`. May withhold a tail.
    fn write(&mut self, input: &[u8], out: &mut Vec<u8>);

    /// End of stream: flush anything withheld.
    fn finish(&mut self, out: &mut Vec<u8>);
}

/// Ordered chain of filters; the output of one feeds the next
pub struct FilterChain {
    filters: Vec<Box<dyn StreamFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn StreamFilter>>) -> Self {
        Self { filters }
    }

    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if self.filters.is_empty() {
            out.extend_from_slice(input);
            return;
        }

        let mut cur = Vec::with_capacity(input.len());
        self.filters[0].write(input, &mut cur);
        for filter in &mut self.filters[1..] {
            let mut next = Vec::with_capacity(cur.len());
            filter.write(&cur, &mut next);
            cur = next;
        }
        out.append(&mut cur);
    }

    /// Flush every filter's carry, routing it through the rest of the chain.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        for i in 0..self.filters.len() {
            let mut cur = Vec::new();
            self.filters[i].finish(&mut cur);
            for filter in &mut self.filters[i + 1..] {
                let mut next = Vec::new();
                filter.write(&cur, &mut next);
                cur = next;
            }
            out.append(&mut cur);
        }
    }
}

/// Result of scanning a chunk for one phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhraseMatch {
    /// Complete occurrence starting at this index.
    Full(usize),
    /// The chunk ends with this many-byte-offset partial occurrence.
    Partial(usize),
    /// No full or trailing partial occurrence.
    None,
}

/// Locate the first full occurrence of `phrase`, or a trailing partial one.
pub(crate) fn find(data: &[u8], phrase: &[u8]) -> PhraseMatch {
    if phrase.is_empty() || data.is_empty() {
        return PhraseMatch::None;
    }

    if let Some(i) = memmem::find(data, phrase) {
        return PhraseMatch::Full(i);
    }

    // A trailing partial match must start within the last phrase-length - 1
    // bytes; anything earlier would have been a full match.
    let mut pos = data.len().saturating_sub(phrase.len() - 1);
    while pos < data.len() {
        match memchr::memchr(phrase[0], &data[pos..]) {
            Some(off) => {
                let start = pos + off;
                let tail = &data[start..];
                if phrase.starts_with(tail) {
                    return PhraseMatch::Partial(start);
                }
                pos = start + 1;
            }
            None => break,
        }
    }

    PhraseMatch::None
}

/// Masks one phrase in a byte stream
pub struct PhraseFilter {
    phrase: Vec<u8>,
    pending: Vec<u8>,
}

impl PhraseFilter {
    pub fn new(phrase: &[u8]) -> Self {
        let mut phrase = phrase.to_vec();
        phrase.truncate(MAX_PHRASE_SIZE);
        Self {
            phrase,
            pending: Vec::new(),
        }
    }
}

impl StreamFilter for PhraseFilter {
    fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);

        let mut i = 0;
        loop {
            match find(&data[i..], &self.phrase) {
                PhraseMatch::Full(idx) => {
                    out.extend_from_slice(&data[i..i + idx]);
                    out.extend_from_slice(MASKED);
                    i += idx + self.phrase.len();
                }
                PhraseMatch::Partial(idx) => {
                    out.extend_from_slice(&data[i..i + idx]);
                    self.pending = data[i + idx..].to_vec();
                    return;
                }
                PhraseMatch::None => {
                    out.extend_from_slice(&data[i..]);
                    return;
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        // a partial that never completed is not the secret
        out.append(&mut self.pending);
    }
}

/// Replaces invalid UTF-8 sequences with U+FFFD
///
/// Runs after the maskers so the bytes that reach the limit writer and the
/// backing file are always valid UTF-8.
pub struct Utf8Filter {
    pending: Vec<u8>,
}

const REPLACEMENT: &[u8] = "\u{FFFD}".as_bytes();

impl Utf8Filter {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl StreamFilter for Utf8Filter {
    fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);

        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.extend_from_slice(s.as_bytes());
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.extend_from_slice(valid);
                    match e.error_len() {
                        Some(n) => {
                            out.extend_from_slice(REPLACEMENT);
                            rest = &after[n..];
                        }
                        None => {
                            // incomplete trailing sequence, carry to next write
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.pending.is_empty() {
            out.extend_from_slice(REPLACEMENT);
            self.pending.clear();
        }
    }
}
