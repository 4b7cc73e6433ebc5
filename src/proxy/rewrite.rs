//! Streaming body placeholder substitution.
//!
//! Design note "streaming body rewrite": a non-buffering scanner that never
//! holds more than `len(placeholder) - 1` bytes past the current forwarded
//! offset. [`PlaceholderRewriter::feed`] is called with each inbound chunk
//! and returns the bytes now safe to forward; [`PlaceholderRewriter::finish`]
//! flushes whatever tail remains once the body is exhausted.

/// A bounded-lookahead placeholder-to-secret body rewriter.
pub struct PlaceholderRewriter {
    placeholder: Vec<u8>,
    replacement: Vec<u8>,
    carry: Vec<u8>,
    /// Whether any substitution has been made, so callers know whether
    /// `Content-Length` needs recomputing.
    pub substitutions: usize,
}

impl PlaceholderRewriter {
    /// Create a rewriter that replaces every occurrence of `placeholder`
    /// with `replacement`.
    #[must_use]
    pub fn new(placeholder: &str, replacement: &str) -> Self {
        Self {
            placeholder: placeholder.as_bytes().to_vec(),
            replacement: replacement.as_bytes().to_vec(),
            carry: Vec::new(),
            substitutions: 0,
        }
    }

    /// Feed the next chunk of body bytes, returning the bytes now safe to
    /// forward. Never holds more than `placeholder.len() - 1` bytes back.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Flush any bytes still held back because the body ended mid-match.
    pub fn finish(&mut self) -> Vec<u8> {
        self.drain(true)
    }

    fn drain(&mut self, flush_all: bool) -> Vec<u8> {
        if self.placeholder.is_empty() {
            return std::mem::take(&mut self.carry);
        }

        let mut out = Vec::new();
        let plen = self.placeholder.len();
        let mut i = 0;

        while i < self.carry.len() {
            let remaining = self.carry.len() - i;

            if remaining >= plen && self.carry[i..i + plen] == self.placeholder[..] {
                out.extend_from_slice(&self.replacement);
                self.substitutions += 1;
                i += plen;
                continue;
            }

            if !flush_all && remaining < plen {
                // Might be the start of a split match; hold it back.
                break;
            }

            out.push(self.carry[i]);
            i += 1;
        }

        self.carry.drain(0..i);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_placeholder_within_a_single_chunk() {
        let mut r = PlaceholderRewriter::new("<<SECRET>>", "real-token");
        let mut out = r.feed(br#"{"k":"<<SECRET>>"}"#);
        out.extend(r.finish());
        assert_eq!(out, br#"{"k":"real-token"}"#.to_vec());
    }

    #[test]
    fn rewrites_placeholder_split_across_chunks() {
        let mut r = PlaceholderRewriter::new("<<SECRET>>", "real-token");
        let mut out = r.feed(b"prefix-<<SEC");
        out.extend(r.feed(b"RET>>-suffix"));
        out.extend(r.finish());
        assert_eq!(out, b"prefix-real-token-suffix".to_vec());
    }

    #[test]
    fn never_holds_back_more_than_placeholder_len_minus_one() {
        let mut r = PlaceholderRewriter::new("ABCDE", "x");
        let out = r.feed(b"zzzzzzzzABC");
        assert!(out.len() >= 8); // "zzzzzzzz" always forwarded immediately
        assert!(r.carry.len() <= "ABCDE".len() - 1);
    }

    #[test]
    fn body_one_byte_off_from_placeholder_is_left_untouched() {
        let mut r = PlaceholderRewriter::new("<<SECRET>>", "real-token");
        let mut out = r.feed(b"<<SECRET>");
        out.extend(r.finish());
        assert_eq!(out, b"<<SECRET>".to_vec());
    }

    #[test]
    fn counts_substitutions() {
        let mut r = PlaceholderRewriter::new("X", "YY");
        let mut out = r.feed(b"aXbXc");
        out.extend(r.finish());
        assert_eq!(out, b"aYYbYYc".to_vec());
        assert_eq!(r.substitutions, 2);
    }
}
