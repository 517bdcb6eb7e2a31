//! Sensitive URL query parameter masking
//!
//! Replaces the value of known credential-bearing query parameters with
//! `[MASKED]`. A parameter counts only when it follows `?` or `&` and its
//! name is immediately followed by `=`. The value is swallowed until a
//! terminator: `&`, `?`, whitespace, a control byte, or end of stream —
//! so values of any length are fully scrubbed with a small, bounded carry.

use crate::trace::mask::{StreamFilter, MASKED};

/// Exact parameter names, compared case-insensitively.
const SENSITIVE_PARAMS: &[&str] = &["private_token", "authenticity_token", "rss_token"];

/// Name prefixes, compared case-insensitively.
const SENSITIVE_PREFIXES: &[&str] = &["x-amz-", "x-goog-", "x-ms-"];

/// Longest name worth buffering; anything longer cannot be sensitive.
const MAX_PARAM_NAME: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Pass bytes through, watching for `?` or `&`.
    Scan,
    /// Buffering a candidate parameter name (including its `?`/`&`).
    Name,
    /// Swallowing a sensitive value; `[MASKED]` was already emitted.
    Value,
}

/// Masks sensitive URL parameter values in a byte stream
pub struct SensitiveUrlFilter {
    state: State,
    /// Candidate name buffer, leading `?`/`&` included.
    name: Vec<u8>,
}

impl SensitiveUrlFilter {
    pub fn new() -> Self {
        Self {
            state: State::Scan,
            name: Vec::new(),
        }
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn is_value_terminator(b: u8) -> bool {
    b == b'&' || b == b'?' || b == b' ' || b < 0x20 || b == 0x7f
}

fn is_sensitive(name: &[u8]) -> bool {
    if name.is_empty() || name.len() > MAX_PARAM_NAME {
        return false;
    }
    let lower: Vec<u8> = name.iter().map(|b| b.to_ascii_lowercase()).collect();

    SENSITIVE_PARAMS.iter().any(|p| p.as_bytes() == lower)
        || SENSITIVE_PREFIXES
            .iter()
            .any(|p| lower.starts_with(p.as_bytes()))
}

impl StreamFilter for SensitiveUrlFilter {
    fn write(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match self.state {
                State::Scan => {
                    if b == b'?' || b == b'&' {
                        self.state = State::Name;
                        self.name.clear();
                        self.name.push(b);
                    } else {
                        out.push(b);
                    }
                    i += 1;
                }
                State::Name => {
                    if b == b'=' {
                        out.extend_from_slice(&self.name);
                        out.push(b'=');
                        if is_sensitive(&self.name[1..]) {
                            out.extend_from_slice(MASKED);
                            self.state = State::Value;
                        } else {
                            self.state = State::Scan;
                        }
                        self.name.clear();
                        i += 1;
                    } else if is_name_byte(b) && self.name.len() <= MAX_PARAM_NAME {
                        self.name.push(b);
                        i += 1;
                    } else {
                        // not a parameter assignment; flush and reprocess
                        // this byte (it may itself start a new parameter)
                        out.append(&mut self.name);
                        self.state = State::Scan;
                    }
                }
                State::Value => {
                    if is_value_terminator(b) {
                        // reprocess the terminator in scan state
                        self.state = State::Scan;
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        // a name with no `=` was never a parameter
        out.append(&mut self.name);
        self.state = State::Scan;
    }
}
